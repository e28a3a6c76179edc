use async_trait::async_trait;
use chrono::Utc;
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use std::sync::Arc;
use std::time::Duration;
use tracing;

use crate::config::FeedConfig;
use crate::db::{DbConnection, DbPool};
use crate::error::{BridgeError, BridgeResult};
use crate::feed::{spawn_polling_watch, Watch};
use crate::schema::{inbound_messages, outbound_messages, tenant_sessions};
use crate::store::models::{
    InboundMessageRow, NewInboundMessageRow, NewOutboundMessageRow, OutboundMessageRow,
    TenantSessionRow,
};
use crate::store::DocumentStore;
use crate::types::{
    DeliveryResult, Document, InboundMessage, MessageStatus, NewInboundMessage,
    NewOutboundMessage, OutboundMessage, Query, SessionState, SessionTransition, TenantSession,
};

/// PostgreSQL-backed store. Change feeds poll the watched query.
#[derive(Clone)]
pub struct PgStore {
    pool: Arc<DbPool>,
    poll_interval: Duration,
    batch_size: i64,
}

impl PgStore {
    pub fn new(pool: Arc<DbPool>, feed: &FeedConfig) -> Self {
        Self {
            pool,
            poll_interval: Duration::from_millis(feed.poll_interval_ms),
            batch_size: feed.batch_size,
        }
    }

    async fn conn(&self) -> BridgeResult<DbConnection> {
        self.pool
            .get()
            .await
            .map_err(|e| BridgeError::Pool(e.to_string()))
    }

    async fn load_session(
        conn: &mut DbConnection,
        tenant_id: &str,
    ) -> BridgeResult<Option<TenantSession>> {
        let row: Option<TenantSessionRow> = tenant_sessions::table
            .filter(tenant_sessions::tenant_id.eq(tenant_id))
            .select(TenantSessionRow::as_select())
            .first(conn)
            .await
            .optional()?;

        row.map(TenantSession::try_from).transpose()
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn request_session(&self, tenant_id: &str) -> BridgeResult<TenantSession> {
        if tenant_id.trim().is_empty() {
            return Err(BridgeError::InvalidInput("tenant_id is required".into()));
        }

        let mut conn = self.conn().await?;
        let now = Utc::now();
        let requested = SessionState::Requested.as_str();

        let created: Option<TenantSessionRow> = diesel::insert_into(tenant_sessions::table)
            .values((
                tenant_sessions::tenant_id.eq(tenant_id),
                tenant_sessions::state.eq(requested),
                tenant_sessions::requested_at.eq(now),
                tenant_sessions::updated_at.eq(now),
            ))
            .on_conflict_do_nothing()
            .returning(TenantSessionRow::as_returning())
            .get_result(&mut conn)
            .await
            .optional()?;
        if let Some(row) = created {
            return row.try_into();
        }

        // Only a terminal row may be re-requested. The state filter keeps a
        // concurrent request from resetting a session another one already started.
        let terminal: Vec<&'static str> = [SessionState::Disconnected, SessionState::Failed]
            .iter()
            .map(|state| state.as_str())
            .collect();
        let reset: Option<TenantSessionRow> = diesel::update(
            tenant_sessions::table
                .filter(tenant_sessions::tenant_id.eq(tenant_id))
                .filter(tenant_sessions::state.eq_any(terminal)),
        )
        .set((
            tenant_sessions::state.eq(requested),
            tenant_sessions::pairing_payload.eq(None::<String>),
            tenant_sessions::pairing_image.eq(None::<String>),
            tenant_sessions::last_error.eq(None::<String>),
            tenant_sessions::requested_at.eq(now),
            tenant_sessions::updated_at.eq(now),
        ))
        .returning(TenantSessionRow::as_returning())
        .get_result(&mut conn)
        .await
        .optional()?;
        if let Some(row) = reset {
            return row.try_into();
        }

        match Self::load_session(&mut conn, tenant_id).await? {
            Some(existing) => {
                tracing::debug!(
                    "Session for tenant {} is already {}, not re-requesting",
                    tenant_id,
                    existing.state
                );
                Ok(existing)
            }
            None => Err(BridgeError::session_not_found(tenant_id)),
        }
    }

    async fn get_session(&self, tenant_id: &str) -> BridgeResult<Option<TenantSession>> {
        let mut conn = self.conn().await?;
        Self::load_session(&mut conn, tenant_id).await
    }

    async fn transition_session(
        &self,
        tenant_id: &str,
        transition: SessionTransition,
    ) -> BridgeResult<TenantSession> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let allowed: Vec<&'static str> = transition
            .allowed_from()
            .iter()
            .map(|state| state.as_str())
            .collect();
        let target = tenant_sessions::table
            .filter(tenant_sessions::tenant_id.eq(tenant_id))
            .filter(tenant_sessions::state.eq_any(allowed));

        let updated: Option<TenantSessionRow> = match &transition {
            SessionTransition::Pairing { payload, image } => diesel::update(target)
                .set((
                    tenant_sessions::state.eq(SessionState::Pairing.as_str()),
                    tenant_sessions::pairing_payload.eq(Some(payload.as_str())),
                    tenant_sessions::pairing_image.eq(image.as_deref()),
                    tenant_sessions::pairing_started_at.eq(Some(now)),
                    tenant_sessions::updated_at.eq(now),
                ))
                .returning(TenantSessionRow::as_returning())
                .get_result(&mut conn)
                .await
                .optional()?,
            SessionTransition::Authenticated => diesel::update(target)
                .set((
                    tenant_sessions::pairing_payload.eq(None::<String>),
                    tenant_sessions::pairing_image.eq(None::<String>),
                    tenant_sessions::updated_at.eq(now),
                ))
                .returning(TenantSessionRow::as_returning())
                .get_result(&mut conn)
                .await
                .optional()?,
            SessionTransition::Connected => diesel::update(target)
                .set((
                    tenant_sessions::state.eq(SessionState::Connected.as_str()),
                    tenant_sessions::pairing_payload.eq(None::<String>),
                    tenant_sessions::pairing_image.eq(None::<String>),
                    tenant_sessions::last_error.eq(None::<String>),
                    tenant_sessions::connected_at.eq(Some(now)),
                    tenant_sessions::updated_at.eq(now),
                ))
                .returning(TenantSessionRow::as_returning())
                .get_result(&mut conn)
                .await
                .optional()?,
            SessionTransition::Disconnected { reason } => diesel::update(target)
                .set((
                    tenant_sessions::state.eq(SessionState::Disconnected.as_str()),
                    tenant_sessions::last_error.eq(Some(reason.as_str())),
                    tenant_sessions::disconnected_at.eq(Some(now)),
                    tenant_sessions::updated_at.eq(now),
                ))
                .returning(TenantSessionRow::as_returning())
                .get_result(&mut conn)
                .await
                .optional()?,
            SessionTransition::Failed { reason } => diesel::update(target)
                .set((
                    tenant_sessions::state.eq(SessionState::Failed.as_str()),
                    tenant_sessions::pairing_payload.eq(None::<String>),
                    tenant_sessions::pairing_image.eq(None::<String>),
                    tenant_sessions::last_error.eq(Some(reason.as_str())),
                    tenant_sessions::updated_at.eq(now),
                ))
                .returning(TenantSessionRow::as_returning())
                .get_result(&mut conn)
                .await
                .optional()?,
        };

        match updated {
            Some(row) => row.try_into(),
            None => match Self::load_session(&mut conn, tenant_id).await? {
                Some(current) => Err(BridgeError::InvalidTransition {
                    tenant_id: tenant_id.to_string(),
                    from: current.state,
                    to: transition.target(),
                }),
                None => Err(BridgeError::session_not_found(tenant_id)),
            },
        }
    }

    async fn enqueue_outbound(&self, message: NewOutboundMessage) -> BridgeResult<OutboundMessage> {
        let message = message.normalized()?;
        let mut conn = self.conn().await?;

        let row: OutboundMessageRow = diesel::insert_into(outbound_messages::table)
            .values(NewOutboundMessageRow {
                tenant_id: &message.tenant_id,
                recipient: &message.recipient,
                body: &message.body,
                status: MessageStatus::Pending.as_str(),
            })
            .returning(OutboundMessageRow::as_returning())
            .get_result(&mut conn)
            .await?;

        tracing::debug!("Queued outbound message {} for tenant {}", row.id, row.tenant_id);
        row.try_into()
    }

    async fn get_outbound(&self, id: i64) -> BridgeResult<Option<OutboundMessage>> {
        let mut conn = self.conn().await?;
        let row: Option<OutboundMessageRow> = outbound_messages::table
            .filter(outbound_messages::id.eq(id))
            .select(OutboundMessageRow::as_select())
            .first(&mut conn)
            .await
            .optional()?;

        row.map(OutboundMessage::try_from).transpose()
    }

    async fn complete_outbound(&self, id: i64, result: DeliveryResult) -> BridgeResult<bool> {
        let mut conn = self.conn().await?;
        let now = Utc::now();
        let target = outbound_messages::table
            .filter(outbound_messages::id.eq(id))
            .filter(outbound_messages::status.eq(MessageStatus::Pending.as_str()));

        let updated = match &result {
            DeliveryResult::Sent => diesel::update(target)
                .set((
                    outbound_messages::status.eq(MessageStatus::Sent.as_str()),
                    outbound_messages::error.eq(None::<String>),
                    outbound_messages::sent_at.eq(Some(now)),
                    outbound_messages::updated_at.eq(now),
                ))
                .execute(&mut conn)
                .await?,
            DeliveryResult::Failed(reason) => diesel::update(target)
                .set((
                    outbound_messages::status.eq(MessageStatus::Failed.as_str()),
                    outbound_messages::error.eq(Some(reason.as_str())),
                    outbound_messages::updated_at.eq(now),
                ))
                .execute(&mut conn)
                .await?,
        };

        if updated > 0 {
            return Ok(true);
        }

        let exists: Option<i64> = outbound_messages::table
            .filter(outbound_messages::id.eq(id))
            .select(outbound_messages::id)
            .first(&mut conn)
            .await
            .optional()?;

        match exists {
            Some(_) => Ok(false),
            None => Err(BridgeError::outbound_not_found(id)),
        }
    }

    async fn append_inbound(&self, message: NewInboundMessage) -> BridgeResult<InboundMessage> {
        let mut conn = self.conn().await?;
        let row: InboundMessageRow = diesel::insert_into(inbound_messages::table)
            .values(NewInboundMessageRow {
                tenant_id: &message.tenant_id,
                sender: &message.sender,
                body: &message.body,
            })
            .returning(InboundMessageRow::as_returning())
            .get_result(&mut conn)
            .await?;

        Ok(row.into())
    }

    async fn list_inbound(&self, tenant_id: &str) -> BridgeResult<Vec<InboundMessage>> {
        let mut conn = self.conn().await?;
        let rows: Vec<InboundMessageRow> = inbound_messages::table
            .filter(inbound_messages::tenant_id.eq(tenant_id))
            .order((inbound_messages::received_at.asc(), inbound_messages::id.asc()))
            .select(InboundMessageRow::as_select())
            .load(&mut conn)
            .await?;

        Ok(rows.into_iter().map(InboundMessage::from).collect())
    }

    async fn query(&self, query: &Query) -> BridgeResult<Vec<Document>> {
        let mut conn = self.conn().await?;

        match query {
            Query::SessionsInState(state) => {
                let rows: Vec<TenantSessionRow> = tenant_sessions::table
                    .filter(tenant_sessions::state.eq(state.as_str()))
                    .order((tenant_sessions::requested_at.asc(), tenant_sessions::tenant_id.asc()))
                    .limit(self.batch_size)
                    .select(TenantSessionRow::as_select())
                    .load(&mut conn)
                    .await?;

                rows.into_iter()
                    .map(|row| TenantSession::try_from(row).map(Document::Session))
                    .collect()
            }
            Query::OutboundWithStatus(status) => {
                let rows: Vec<OutboundMessageRow> = outbound_messages::table
                    .filter(outbound_messages::status.eq(status.as_str()))
                    .order((outbound_messages::created_at.asc(), outbound_messages::id.asc()))
                    .limit(self.batch_size)
                    .select(OutboundMessageRow::as_select())
                    .load(&mut conn)
                    .await?;

                rows.into_iter()
                    .map(|row| OutboundMessage::try_from(row).map(Document::Outbound))
                    .collect()
            }
        }
    }

    fn watch(&self, query: Query) -> Watch {
        let store = self.clone();
        spawn_polling_watch(query, self.poll_interval, move |query| {
            let store = store.clone();
            async move { store.query(&query).await }
        })
    }
}
