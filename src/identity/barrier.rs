use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

use super::{AuthNotice, IdentityManager};
use crate::event::CorrelationId;

/// Counting barrier over a set of authorization tokens.
///
/// `wait` resolves once every tracked token has settled (Authorized, Failed,
/// or Revoked). Callers that issue a batch of authorization requests and need
/// "all N completed" semantics use this instead of blocking the dispatch
/// task. A session termination settles every token and releases the barrier
/// in the same pass.
pub struct AuthBarrier {
    manager: Arc<IdentityManager>,
    notices: broadcast::Receiver<AuthNotice>,
    pending: HashSet<CorrelationId>,
}

impl AuthBarrier {
    pub(crate) fn new(
        manager: Arc<IdentityManager>,
        tokens: impl IntoIterator<Item = CorrelationId>,
    ) -> Self {
        // Subscribe before the state check so a notice landing between the
        // two cannot be missed.
        let notices = manager.subscribe();
        Self {
            manager,
            notices,
            pending: tokens.into_iter().collect(),
        }
    }

    /// Wait until every tracked token settles.
    pub async fn wait(mut self) {
        self.pending.retain(|t| !self.manager.token_settled(t));

        while !self.pending.is_empty() {
            match self.notices.recv().await {
                Ok(notice) => {
                    if notice.state.is_settled() {
                        self.pending.remove(&notice.token);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Auth barrier lagged, re-checking tracked tokens");
                    self.pending.retain(|t| !self.manager.token_settled(t));
                }
                Err(broadcast::error::RecvError::Closed) => {
                    // Manager gone; nothing further can settle.
                    break;
                }
            }
        }
    }

    /// Tokens still unsettled at the time of the call.
    pub fn remaining(&self) -> usize {
        self.pending
            .iter()
            .filter(|t| !self.manager.token_settled(t))
            .count()
    }
}
