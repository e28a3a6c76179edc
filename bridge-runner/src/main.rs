use anyhow::Result;
use bridge_api::ApiState;
use bridge_core::{BridgeContext, Config};
use bridge_delivery::DeliveryWorker;
use bridge_dispatch::ChangeFeedDispatcher;
use bridge_session::{LifecycleManager, QrPairingRenderer, SessionRegistry, SimulatedProtocol};
use bridge_watch::SubscriptionManager;
use std::sync::Arc;
use std::time::Duration;
use tokio;
use tokio_util::sync::CancellationToken;
use tracing;
use tracing_subscriber;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("Starting chat session bridge");

    let config = Config::from_env();
    let ctx = BridgeContext::new(config).await?;
    tracing::info!("Bridge context initialized ({:?} store)", ctx.config.store);

    let registry = Arc::new(SessionRegistry::new());
    let subscriptions = SubscriptionManager::start(ctx.store.clone(), &ctx.config.subscriptions);
    let lifecycle = Arc::new(LifecycleManager::new(
        ctx.store.clone(),
        registry.clone(),
        Arc::new(SimulatedProtocol::from_config(&ctx.config.sessions)),
        Arc::new(QrPairingRenderer::default()),
        Duration::from_secs(ctx.config.sessions.shutdown_timeout_secs),
    ));
    let worker = Arc::new(DeliveryWorker::new(ctx.store.clone(), registry.clone()));

    lifecycle.recover_orphans().await;

    let dispatcher = ChangeFeedDispatcher::new(subscriptions.clone(), lifecycle.clone(), worker);
    dispatcher.start();

    let api_shutdown = CancellationToken::new();
    let api_state = ApiState {
        ctx: ctx.clone(),
        registry,
        subscriptions: subscriptions.clone(),
    };
    let api_token = api_shutdown.clone();
    let api = tokio::spawn(async move {
        if let Err(e) = bridge_api::run(api_state, api_token).await {
            tracing::error!("API server error: {}", e);
        }
    });

    wait_for_signal().await;
    tracing::info!("Shutdown signal received");

    dispatcher.stop().await;
    lifecycle.shutdown_all().await;
    subscriptions.shutdown().await;

    api_shutdown.cancel();
    if let Err(e) = api.await {
        tracing::error!("API task ended abnormally: {}", e);
    }

    tracing::info!("Chat session bridge stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut sigterm) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {}", e);
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for ctrl-c: {}", e);
    }
}
