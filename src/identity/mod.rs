use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};

use crate::entitlement::EntitlementId;
use crate::event::CorrelationId;

mod barrier;

pub use barrier::AuthBarrier;

/// Lifecycle state of one user's authorization.
///
/// Legal transitions: Pending→Authorized, Pending→Failed, Authorized→Revoked.
/// Failed and Revoked are terminal; a fresh authorization request (new token)
/// is the only way forward from them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityState {
    Pending,
    Authorized,
    Failed,
    Revoked,
}

impl IdentityState {
    /// A settled state is anything a waiter no longer has to wait for.
    pub fn is_settled(&self) -> bool {
        !matches!(self, IdentityState::Pending)
    }
}

/// Provider-issued handle for a successfully authorized user.
///
/// Opaque to callers; the entitlement filter compares an item's required ids
/// against it. Constructed only from an authorization success payload and
/// dropped from the tracking map the moment the identity leaves Authorized.
#[derive(Clone, Debug)]
pub struct IdentityHandle {
    granted: HashSet<EntitlementId>,
}

impl IdentityHandle {
    pub fn from_grants(grants: impl IntoIterator<Item = EntitlementId>) -> Self {
        Self {
            granted: grants.into_iter().collect(),
        }
    }

    pub fn holds(&self, id: EntitlementId) -> bool {
        self.granted.contains(&id)
    }

    pub fn grant_count(&self) -> usize {
        self.granted.len()
    }
}

/// Broadcast on every lifecycle change.
#[derive(Clone, Debug, Serialize)]
pub struct AuthNotice {
    pub user_id: String,
    pub token: CorrelationId,
    pub state: IdentityState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Outcome of one applied lifecycle transition.
#[derive(Clone, Debug)]
pub struct AuthChange {
    pub user_id: String,
    pub token: CorrelationId,
    pub state: IdentityState,
    /// Present exactly when the new state is Authorized.
    pub handle: Option<Arc<IdentityHandle>>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("user '{user_id}' already has an authorization in state {state:?}")]
    AlreadyTracked { user_id: String, state: IdentityState },

    #[error("no authorization tracked for token {token}")]
    UnknownToken { token: CorrelationId },

    #[error("invalid transition {from:?} -> {to:?} for user '{user_id}'")]
    InvalidTransition {
        user_id: String,
        from: IdentityState,
        to: IdentityState,
    },

    #[error("duplicate {state:?} event for user '{user_id}'")]
    DuplicateTransition { user_id: String, state: IdentityState },
}

struct AuthRecord {
    user_id: String,
    token: CorrelationId,
    state: IdentityState,
    handle: Option<Arc<IdentityHandle>>,
}

/// Tracks every user's authorization lifecycle for one provider session.
///
/// All mutation happens on the dispatch task; the maps are concurrent so that
/// queries (entitlement checks, barrier polls) may read from anywhere.
pub struct IdentityManager {
    users: DashMap<String, AuthRecord>,
    tokens: DashMap<CorrelationId, String>,
    notice_tx: broadcast::Sender<AuthNotice>,
}

impl IdentityManager {
    pub fn new(notice_capacity: usize) -> Self {
        let (notice_tx, _) = broadcast::channel(notice_capacity);
        Self {
            users: DashMap::new(),
            tokens: DashMap::new(),
            notice_tx,
        }
    }

    /// Start tracking an authorization for `user_id` and mint its token.
    ///
    /// Rejected while the user is Pending or Authorized; a Failed or Revoked
    /// user may start over (the stale record is replaced).
    pub fn begin_authorization(&self, user_id: &str) -> Result<CorrelationId, IdentityError> {
        if let Some(existing) = self.users.get(user_id) {
            if !matches!(existing.state, IdentityState::Failed | IdentityState::Revoked) {
                return Err(IdentityError::AlreadyTracked {
                    user_id: user_id.to_string(),
                    state: existing.state,
                });
            }
        }

        let token = CorrelationId::new();
        self.users.insert(
            user_id.to_string(),
            AuthRecord {
                user_id: user_id.to_string(),
                token,
                state: IdentityState::Pending,
                handle: None,
            },
        );
        self.tokens.insert(token, user_id.to_string());

        info!(user_id, %token, "Tracking authorization");
        self.notify(user_id, token, IdentityState::Pending, None);
        Ok(token)
    }

    /// Pending→Authorized. Stores the identity handle and keeps the token
    /// registered (a later revocation arrives on the same token).
    pub fn apply_success(
        &self,
        token: CorrelationId,
        handle: IdentityHandle,
    ) -> Result<AuthChange, IdentityError> {
        let user_id = self.user_for(token)?;
        let mut record = self
            .users
            .get_mut(&user_id)
            .ok_or(IdentityError::UnknownToken { token })?;

        match record.state {
            IdentityState::Pending => {
                let handle = Arc::new(handle);
                record.state = IdentityState::Authorized;
                record.handle = Some(Arc::clone(&handle));
                drop(record);

                info!(user_id = %user_id, %token, grants = handle.grant_count(), "User authorized");
                self.notify(&user_id, token, IdentityState::Authorized, None);
                Ok(AuthChange {
                    user_id,
                    token,
                    state: IdentityState::Authorized,
                    handle: Some(handle),
                    reason: None,
                })
            }
            IdentityState::Authorized => Err(IdentityError::DuplicateTransition {
                user_id: user_id.clone(),
                state: IdentityState::Authorized,
            }),
            from => Err(IdentityError::InvalidTransition {
                user_id: user_id.clone(),
                from,
                to: IdentityState::Authorized,
            }),
        }
    }

    /// Pending→Failed. Terminal for this token; the token is released.
    pub fn apply_failure(
        &self,
        token: CorrelationId,
        reason: Option<String>,
    ) -> Result<AuthChange, IdentityError> {
        let user_id = self.user_for(token)?;
        let mut record = self
            .users
            .get_mut(&user_id)
            .ok_or(IdentityError::UnknownToken { token })?;

        match record.state {
            IdentityState::Pending => {
                record.state = IdentityState::Failed;
                record.handle = None;
                drop(record);
                self.tokens.remove(&token);

                warn!(user_id = %user_id, %token, reason = ?reason, "Authorization failed");
                self.notify(&user_id, token, IdentityState::Failed, reason.clone());
                Ok(AuthChange {
                    user_id,
                    token,
                    state: IdentityState::Failed,
                    handle: None,
                    reason,
                })
            }
            from => Err(IdentityError::InvalidTransition {
                user_id: user_id.clone(),
                from,
                to: IdentityState::Failed,
            }),
        }
    }

    /// Authorized→Revoked. Drops the stored handle so later entitlement
    /// queries fail closed, and releases the token.
    pub fn apply_revocation(&self, token: CorrelationId) -> Result<AuthChange, IdentityError> {
        let user_id = self.user_for(token)?;
        let mut record = self
            .users
            .get_mut(&user_id)
            .ok_or(IdentityError::UnknownToken { token })?;

        match record.state {
            IdentityState::Authorized => {
                record.state = IdentityState::Revoked;
                record.handle = None;
                drop(record);
                self.tokens.remove(&token);

                warn!(user_id = %user_id, %token, "Authorization revoked");
                self.notify(&user_id, token, IdentityState::Revoked, None);
                Ok(AuthChange {
                    user_id,
                    token,
                    state: IdentityState::Revoked,
                    handle: None,
                    reason: None,
                })
            }
            from => Err(IdentityError::InvalidTransition {
                user_id: user_id.clone(),
                from,
                to: IdentityState::Revoked,
            }),
        }
    }

    /// Force every tracked identity into a terminal state (session
    /// termination). Pending becomes Failed, Authorized becomes Revoked;
    /// every waiter is unblocked via the notice channel in the same pass.
    pub fn force_terminate_all(&self, reason: &str) -> Vec<AuthChange> {
        let mut changes = Vec::new();

        for mut record in self.users.iter_mut() {
            let to = match record.state {
                IdentityState::Pending => IdentityState::Failed,
                IdentityState::Authorized => IdentityState::Revoked,
                _ => continue,
            };
            record.state = to;
            record.handle = None;
            changes.push(AuthChange {
                user_id: record.user_id.clone(),
                token: record.token,
                state: to,
                handle: None,
                reason: Some(reason.to_string()),
            });
        }

        self.tokens.clear();
        for change in &changes {
            self.notify(&change.user_id, change.token, change.state, change.reason.clone());
        }

        if !changes.is_empty() {
            warn!(affected = changes.len(), reason, "Forced all identities terminal");
        }
        changes
    }

    pub fn state_of(&self, user_id: &str) -> Option<IdentityState> {
        self.users.get(user_id).map(|r| r.state)
    }

    /// The identity handle, present exactly while the user is Authorized.
    pub fn handle_for(&self, user_id: &str) -> Option<Arc<IdentityHandle>> {
        self.users.get(user_id).and_then(|r| r.handle.clone())
    }

    pub fn token_for(&self, user_id: &str) -> Option<CorrelationId> {
        self.users.get(user_id).map(|r| r.token)
    }

    pub fn authorized_users(&self) -> Vec<String> {
        self.users
            .iter()
            .filter(|r| r.state == IdentityState::Authorized)
            .map(|r| r.user_id.clone())
            .collect()
    }

    /// Subscribe to lifecycle notices.
    pub fn subscribe(&self) -> broadcast::Receiver<AuthNotice> {
        self.notice_tx.subscribe()
    }

    /// Whether a token's operation no longer needs waiting on. Tokens the
    /// manager has released (or never knew) count as settled.
    pub(crate) fn token_settled(&self, token: &CorrelationId) -> bool {
        match self.tokens.get(token) {
            Some(entry) => self
                .users
                .get(entry.value())
                .map(|r| r.state.is_settled())
                .unwrap_or(true),
            None => true,
        }
    }

    fn user_for(&self, token: CorrelationId) -> Result<String, IdentityError> {
        self.tokens
            .get(&token)
            .map(|entry| entry.value().clone())
            .ok_or(IdentityError::UnknownToken { token })
    }

    fn notify(&self, user_id: &str, token: CorrelationId, state: IdentityState, reason: Option<String>) {
        let _ = self.notice_tx.send(AuthNotice {
            user_id: user_id.to_string(),
            token,
            state,
            reason,
            at: Utc::now(),
        });
    }
}
