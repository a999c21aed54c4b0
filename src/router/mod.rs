use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::fmt;
use tokio::sync::mpsc;
use tracing::{error, info, trace};

use crate::event::{CorrelationId, FeedEvent, FeedMessage, MessageKind};


/// A registered message handler.
///
/// Handlers run synchronously on the dispatch task and must not block; they
/// parse the message and forward a typed result over a channel to the
/// component that owns the affected state. A returned error becomes a
/// [`DispatchFault`] and never interrupts dispatch of sibling messages.
pub type Handler = Box<dyn FnMut(&FeedMessage) -> anyhow::Result<()> + Send>;

/// Registration errors
#[derive(Debug, Clone, PartialEq)]
pub enum RouterError {
    /// The token already has a live handler; the owning operation must reach
    /// a terminal state (and be unregistered) before the token can be reused.
    TokenInUse(CorrelationId),
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouterError::TokenInUse(token) => {
                write!(f, "correlation token {} already has a registered handler", token)
            }
        }
    }
}

impl std::error::Error for RouterError {}

/// A handler error captured at the dispatch boundary.
#[derive(Debug, Clone)]
pub struct DispatchFault {
    pub kind: MessageKind,
    pub correlation_id: Option<CorrelationId>,
    pub error: String,
}

/// Counters for one dispatch call (and, accumulated, for the router's
/// lifetime).
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub by_token: usize,
    pub by_kind: usize,
    pub unmatched: usize,
    pub faults: usize,
}

impl DispatchStats {
    fn absorb(&mut self, other: DispatchStats) {
        self.by_token += other.by_token;
        self.by_kind += other.by_kind;
        self.unmatched += other.unmatched;
        self.faults += other.faults;
    }
}

/// Single dispatch point for the inbound event stream.
///
/// Looks up a handler per message, first by exact correlation token, then by
/// message kind; unmatched messages take a counted default path. All dispatch
/// happens on the calling task in arrival order.
pub struct EventRouter {
    by_kind: HashMap<MessageKind, Handler>,
    by_token: HashMap<CorrelationId, Handler>,
    fault_tx: Option<mpsc::UnboundedSender<DispatchFault>>,
    totals: DispatchStats,
}

impl EventRouter {
    pub fn new() -> Self {
        Self {
            by_kind: HashMap::new(),
            by_token: HashMap::new(),
            fault_tx: None,
            totals: DispatchStats::default(),
        }
    }

    /// Register the fallback handler for a message kind. Replaces any
    /// previous handler for that kind.
    pub fn register_by_kind(&mut self, kind: MessageKind, handler: Handler) {
        self.by_kind.insert(kind, handler);
    }

    /// Register the handler for one outstanding operation's token.
    ///
    /// Callers must [`unregister`](Self::unregister) the token once the
    /// operation reaches a terminal state, otherwise entries accumulate
    /// unboundedly.
    pub fn register_by_token(&mut self, token: CorrelationId, handler: Handler) -> Result<(), RouterError> {
        match self.by_token.entry(token) {
            Entry::Occupied(_) => Err(RouterError::TokenInUse(token)),
            Entry::Vacant(slot) => {
                slot.insert(handler);
                Ok(())
            }
        }
    }

    /// Remove a token's handler. Returns whether a handler was registered.
    pub fn unregister(&mut self, token: CorrelationId) -> bool {
        self.by_token.remove(&token).is_some()
    }

    /// Drop every token handler (session teardown). Returns how many were
    /// released.
    pub fn clear_token_handlers(&mut self) -> usize {
        let released = self.by_token.len();
        self.by_token.clear();
        if released > 0 {
            info!(released, "Released all token handlers");
        }
        released
    }

    /// Route handler faults to `sink` instead of the error log.
    pub fn set_fault_sink(&mut self, sink: mpsc::UnboundedSender<DispatchFault>) {
        self.fault_tx = Some(sink);
    }

    /// Number of live token registrations.
    pub fn token_count(&self) -> usize {
        self.by_token.len()
    }

    /// Lifetime dispatch counters.
    pub fn stats(&self) -> DispatchStats {
        self.totals
    }

    /// Dispatch every message in `event`, in order.
    ///
    /// Exactly one handler runs per message: the token handler if the message
    /// carries a registered token, else the kind handler, else the default
    /// path. A handler error is forwarded to the fault sink and the remaining
    /// messages still dispatch.
    pub fn dispatch(&mut self, event: &FeedEvent) -> DispatchStats {
        let mut stats = DispatchStats::default();

        for message in &event.messages {
            let result = match message.correlation_id.and_then(|t| self.by_token.get_mut(&t)) {
                Some(handler) => {
                    stats.by_token += 1;
                    Some(handler(message))
                }
                None => match self.by_kind.get_mut(&message.kind) {
                    Some(handler) => {
                        stats.by_kind += 1;
                        Some(handler(message))
                    }
                    None => None,
                },
            };

            match result {
                Some(Ok(())) => {}
                Some(Err(e)) => {
                    stats.faults += 1;
                    self.report_fault(message, e);
                }
                None => {
                    stats.unmatched += 1;
                    trace!(kind = ?message.kind, "No handler registered, message ignored");
                }
            }
        }

        self.totals.absorb(stats);
        stats
    }

    fn report_fault(&self, message: &FeedMessage, error: anyhow::Error) {
        let fault = DispatchFault {
            kind: message.kind,
            correlation_id: message.correlation_id,
            error: error.to_string(),
        };

        match &self.fault_tx {
            Some(tx) => {
                if tx.send(fault).is_err() {
                    error!(
                        kind = ?message.kind,
                        error = %error,
                        "Handler fault could not reach the fault sink"
                    );
                }
            }
            None => {
                error!(
                    kind = ?message.kind,
                    correlation_id = ?message.correlation_id,
                    error = %error,
                    "Handler fault with no sink registered"
                );
            }
        }
    }
}

impl Default for EventRouter {
    fn default() -> Self {
        Self::new()
    }
}
