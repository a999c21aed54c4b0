use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

mod extract;
#[cfg(test)]
mod tests;

pub use extract::{extract_grants, extract_reason, extract_securities, extract_service, ExtractError, SecurityData};

/// Opaque token linking an asynchronous operation to its completion events.
///
/// At most one outstanding operation may own a given token at a time; the
/// router enforces this at registration. Tokens are UUIDv4 and never reused
/// by this runtime — a retry mints a fresh token.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(Uuid);

impl CorrelationId {
    /// Mint a fresh token.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Category of an inbound provider event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventCategory {
    SessionStatus,
    ServiceStatus,
    AuthorizationStatus,
    PartialResponse,
    Response,
}

/// Kind of one message inside an event. Dispatch falls back to this when no
/// correlation-token handler matches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    SessionStarted,
    SessionTerminated,
    ServiceOpened,
    ServiceOpenFailed,
    AuthorizationSuccess,
    AuthorizationFailure,
    AuthorizationRevoked,
    PartialDataResponse,
    DataResponse,
}

/// One message inside a provider event.
///
/// The payload is an opaque JSON object; typed extraction lives in
/// [`extract`] and fails softly (a malformed payload becomes a routed
/// handler fault, never a dispatch abort).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedMessage {
    pub kind: MessageKind,
    /// Token of the operation this message completes or advances, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    pub payload: Value,
}

impl FeedMessage {
    pub fn new(kind: MessageKind, correlation_id: Option<CorrelationId>, payload: Value) -> Self {
        Self {
            kind,
            correlation_id,
            payload,
        }
    }
}

/// One inbound provider event: a category and zero or more messages,
/// delivered in arrival order.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeedEvent {
    pub category: EventCategory,
    pub messages: Vec<FeedMessage>,
}

impl FeedEvent {
    pub fn new(category: EventCategory, messages: Vec<FeedMessage>) -> Self {
        Self { category, messages }
    }
}
