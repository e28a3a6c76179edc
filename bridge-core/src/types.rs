use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::BridgeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Requested,
    Pairing,
    Connected,
    Disconnected,
    Failed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionState::Requested => "requested",
            SessionState::Pairing => "pairing",
            SessionState::Connected => "connected",
            SessionState::Disconnected => "disconnected",
            SessionState::Failed => "failed",
        }
    }

    /// Live sessions own (or are about to own) a connection.
    pub fn is_live(&self) -> bool {
        !self.is_terminal()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Disconnected | SessionState::Failed)
    }

    /// The complete transition table for a tenant session.
    ///
    /// `pairing -> pairing` covers a refreshed pairing payload. Terminal states
    /// only leave through a new external request.
    pub fn can_transition_to(&self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Requested, Pairing)
                | (Requested, Failed)
                | (Pairing, Pairing)
                | (Pairing, Connected)
                | (Pairing, Failed)
                | (Connected, Disconnected)
                | (Connected, Failed)
                | (Disconnected, Requested)
                | (Failed, Requested)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "requested" => Ok(SessionState::Requested),
            "pairing" => Ok(SessionState::Pairing),
            "connected" => Ok(SessionState::Connected),
            "disconnected" => Ok(SessionState::Disconnected),
            "failed" => Ok(SessionState::Failed),
            other => Err(BridgeError::InvalidInput(format!(
                "unknown session state '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TenantSession {
    pub tenant_id: String,
    pub state: SessionState,
    pub pairing_payload: Option<String>,
    pub pairing_image: Option<String>,
    pub last_error: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub pairing_started_at: Option<DateTime<Utc>>,
    pub connected_at: Option<DateTime<Utc>>,
    pub disconnected_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl TenantSession {
    pub fn requested(tenant_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        TenantSession {
            tenant_id: tenant_id.into(),
            state: SessionState::Requested,
            pairing_payload: None,
            pairing_image: None,
            last_error: None,
            requested_at: now,
            pairing_started_at: None,
            connected_at: None,
            disconnected_at: None,
            updated_at: now,
        }
    }

    /// Applies a transition in place, stamping the matching timestamp.
    pub fn apply(&mut self, transition: &SessionTransition, now: DateTime<Utc>) {
        match transition {
            SessionTransition::Pairing { payload, image } => {
                self.state = SessionState::Pairing;
                self.pairing_payload = Some(payload.clone());
                self.pairing_image = image.clone();
                self.pairing_started_at = Some(now);
            }
            SessionTransition::Authenticated => {
                self.pairing_payload = None;
                self.pairing_image = None;
            }
            SessionTransition::Connected => {
                self.state = SessionState::Connected;
                self.pairing_payload = None;
                self.pairing_image = None;
                self.last_error = None;
                self.connected_at = Some(now);
            }
            SessionTransition::Disconnected { reason } => {
                self.state = SessionState::Disconnected;
                self.last_error = Some(reason.clone());
                self.disconnected_at = Some(now);
            }
            SessionTransition::Failed { reason } => {
                self.state = SessionState::Failed;
                self.pairing_payload = None;
                self.pairing_image = None;
                self.last_error = Some(reason.clone());
            }
        }
        self.updated_at = now;
    }
}

/// A write the lifecycle manager makes against a tenant session row.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionTransition {
    Pairing {
        payload: String,
        image: Option<String>,
    },
    /// Pairing accepted by the network; the payload is no longer usable.
    Authenticated,
    Connected,
    Disconnected {
        reason: String,
    },
    Failed {
        reason: String,
    },
}

impl SessionTransition {
    pub fn target(&self) -> SessionState {
        match self {
            SessionTransition::Pairing { .. } | SessionTransition::Authenticated => {
                SessionState::Pairing
            }
            SessionTransition::Connected => SessionState::Connected,
            SessionTransition::Disconnected { .. } => SessionState::Disconnected,
            SessionTransition::Failed { .. } => SessionState::Failed,
        }
    }

    /// Source states from which this write is accepted.
    pub fn allowed_from(&self) -> &'static [SessionState] {
        match self {
            SessionTransition::Pairing { .. } => {
                &[SessionState::Requested, SessionState::Pairing]
            }
            SessionTransition::Authenticated => &[SessionState::Pairing],
            SessionTransition::Connected => &[SessionState::Pairing],
            SessionTransition::Disconnected { .. } => &[SessionState::Connected],
            SessionTransition::Failed { .. } => &[
                SessionState::Requested,
                SessionState::Pairing,
                SessionState::Connected,
            ],
        }
    }

    pub fn is_allowed_from(&self, current: SessionState) -> bool {
        self.allowed_from().contains(&current)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for MessageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageStatus {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(MessageStatus::Pending),
            "sent" => Ok(MessageStatus::Sent),
            "failed" => Ok(MessageStatus::Failed),
            other => Err(BridgeError::InvalidInput(format!(
                "unknown message status '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub id: i64,
    pub tenant_id: String,
    pub recipient: String,
    pub body: String,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOutboundMessage {
    pub tenant_id: String,
    pub recipient: String,
    pub body: String,
}

impl NewOutboundMessage {
    /// Checks required fields and reduces the recipient to its digits.
    pub fn normalized(self) -> Result<Self, BridgeError> {
        let recipient = normalize_address(&self.recipient);
        if self.tenant_id.trim().is_empty() {
            return Err(BridgeError::InvalidInput("tenant_id is required".into()));
        }
        if recipient.is_empty() {
            return Err(BridgeError::InvalidInput(
                "recipient must contain at least one digit".into(),
            ));
        }
        if self.body.is_empty() {
            return Err(BridgeError::InvalidInput("body is required".into()));
        }
        Ok(NewOutboundMessage {
            tenant_id: self.tenant_id,
            recipient,
            body: self.body,
        })
    }
}

/// Strips everything but ASCII digits from a phone-style address.
pub fn normalize_address(address: &str) -> String {
    address.chars().filter(|c| c.is_ascii_digit()).collect()
}

/// Terminal outcome written back for an outbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Sent,
    Failed(String),
}

impl DeliveryResult {
    pub fn status(&self) -> MessageStatus {
        match self {
            DeliveryResult::Sent => MessageStatus::Sent,
            DeliveryResult::Failed(_) => MessageStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: i64,
    pub tenant_id: String,
    pub sender: String,
    pub body: String,
    pub received_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewInboundMessage {
    pub tenant_id: String,
    pub sender: String,
    pub body: String,
}

/// Logical queries the change feed can watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Query {
    SessionsInState(SessionState),
    OutboundWithStatus(MessageStatus),
}

impl Query {
    /// Stable identity used to share watches between consumers.
    pub fn key(&self) -> String {
        match self {
            Query::SessionsInState(state) => format!("sessions:{}", state),
            Query::OutboundWithStatus(status) => format!("outbound:{}", status),
        }
    }

    pub fn matches(&self, document: &Document) -> bool {
        match (self, document) {
            (Query::SessionsInState(state), Document::Session(session)) => session.state == *state,
            (Query::OutboundWithStatus(status), Document::Outbound(message)) => {
                message.status == *status
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "collection", rename_all = "snake_case")]
pub enum Document {
    Session(TenantSession),
    Outbound(OutboundMessage),
}

impl Document {
    pub fn id(&self) -> String {
        match self {
            Document::Session(session) => session.tenant_id.clone(),
            Document::Outbound(message) => message.id.to_string(),
        }
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Document::Session(session) => session.updated_at,
            Document::Outbound(message) => message.updated_at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    pub document: Document,
}

impl Change {
    /// Whether the change can carry new work; removals never do.
    pub fn is_upsert(&self) -> bool {
        matches!(self.kind, ChangeKind::Added | ChangeKind::Modified)
    }
}
