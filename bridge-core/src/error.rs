use thiserror::Error;

use crate::types::SessionState;

pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("connection pool error: {0}")]
    Pool(String),

    #[error("migration error: {0}")]
    Migration(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid session transition for tenant {tenant_id}: {from} -> {to}")]
    InvalidTransition {
        tenant_id: String,
        from: SessionState,
        to: SessionState,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("tenant not connected")]
    TenantNotConnected,

    #[error("failed to render pairing payload: {0}")]
    Render(String),
}

impl BridgeError {
    pub fn session_not_found(tenant_id: impl Into<String>) -> Self {
        BridgeError::NotFound {
            entity: "tenant session",
            id: tenant_id.into(),
        }
    }

    pub fn outbound_not_found(id: i64) -> Self {
        BridgeError::NotFound {
            entity: "outbound message",
            id: id.to_string(),
        }
    }
}
