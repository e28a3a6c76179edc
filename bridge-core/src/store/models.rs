use chrono::{DateTime, Utc};
use diesel::prelude::*;

use crate::error::BridgeError;
use crate::schema::{inbound_messages, outbound_messages, tenant_sessions};
use crate::types::{InboundMessage, OutboundMessage, TenantSession};

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = tenant_sessions)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct TenantSessionRow {
    pub tenant_id: String,
    pub state: String,
    pub pairing_payload: Option<String>,
    pub pairing_image: Option<String>,
    pub last_error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub pairing_started_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<TenantSessionRow> for TenantSession {
    type Error = BridgeError;

    fn try_from(row: TenantSessionRow) -> Result<Self, Self::Error> {
        Ok(TenantSession {
            tenant_id: row.tenant_id,
            state: row.state.parse()?,
            pairing_payload: row.pairing_payload,
            pairing_image: row.pairing_image,
            last_error: row.last_error,
            requested_at: row.requested_at,
            pairing_started_at: row.pairing_started_at,
            connected_at: row.connected_at,
            disconnected_at: row.disconnected_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = outbound_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct OutboundMessageRow {
    pub id: i64,
    pub tenant_id: String,
    pub recipient: String,
    pub body: String,
    pub status: String,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl TryFrom<OutboundMessageRow> for OutboundMessage {
    type Error = BridgeError;

    fn try_from(row: OutboundMessageRow) -> Result<Self, Self::Error> {
        Ok(OutboundMessage {
            id: row.id,
            tenant_id: row.tenant_id,
            recipient: row.recipient,
            body: row.body,
            status: row.status.parse()?,
            error: row.error,
            created_at: row.created_at,
            updated_at: row.updated_at,
            sent_at: row.sent_at,
        })
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = outbound_messages)]
pub struct NewOutboundMessageRow<'a> {
    pub tenant_id: &'a str,
    pub recipient: &'a str,
    pub body: &'a str,
    pub status: &'a str,
}

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = inbound_messages)]
#[diesel(check_for_backend(diesel::pg::Pg))]
pub struct InboundMessageRow {
    pub id: i64,
    pub tenant_id: String,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

impl From<InboundMessageRow> for InboundMessage {
    fn from(row: InboundMessageRow) -> Self {
        InboundMessage {
            id: row.id,
            tenant_id: row.tenant_id,
            sender: row.sender,
            body: row.body,
            received_at: row.received_at,
        }
    }
}

#[derive(Debug, Insertable)]
#[diesel(table_name = inbound_messages)]
pub struct NewInboundMessageRow<'a> {
    pub tenant_id: &'a str,
    pub sender: &'a str,
    pub body: &'a str,
}
