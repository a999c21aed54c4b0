use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::debug;

use crate::cache::CachedItem;
use crate::identity::IdentityHandle;


/// One unit of permission required to view a data item.
pub type EntitlementId = u32;

/// Visibility decision for one (item, identity) pair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Verdict {
    /// The item lists no entitlement identifiers; visible to every
    /// authorized identity.
    Open,
    /// Every required identifier is held.
    Entitled,
    /// At least one required identifier is missing.
    Denied { missing: Vec<EntitlementId> },
}

impl Verdict {
    pub fn allowed(&self) -> bool {
        !matches!(self, Verdict::Denied { .. })
    }
}

/// Decide whether `handle` may view an item requiring `required`.
///
/// Pure function: every listed identifier must be held. The denial carries
/// exactly the missing subset, in the order the item listed them.
pub fn check(required: &[EntitlementId], handle: &IdentityHandle) -> Verdict {
    if required.is_empty() {
        return Verdict::Open;
    }

    let missing: Vec<EntitlementId> = required
        .iter()
        .copied()
        .filter(|id| !handle.holds(*id))
        .collect();

    if missing.is_empty() {
        Verdict::Entitled
    } else {
        Verdict::Denied { missing }
    }
}

/// Per-user filtered result, emitted for every delivered item.
#[derive(Clone, Debug, Serialize)]
pub struct FilteredUpdate {
    pub user_id: String,
    pub security: String,
    pub verdict: Verdict,
    /// Field payload; present only when the verdict allows visibility.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

/// Audit notice for the first occurrence of a (security, missing-set)
/// denial.
#[derive(Clone, Debug, Serialize)]
pub struct DenialNotice {
    pub security: String,
    pub missing: Vec<EntitlementId>,
    /// The user the combination was first computed for.
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

/// Applies the entitlement check to every outbound item and fans the
/// decisions out.
///
/// The check itself is pure and may run for different (item, identity) pairs
/// concurrently; the only shared mutation is the seen-denial set.
pub struct EntitlementGate {
    update_tx: broadcast::Sender<FilteredUpdate>,
    denial_tx: broadcast::Sender<DenialNotice>,
    seen_denials: Mutex<HashSet<(String, Vec<EntitlementId>)>>,
}

impl EntitlementGate {
    pub fn new(capacity: usize) -> Self {
        let (update_tx, _) = broadcast::channel(capacity);
        let (denial_tx, _) = broadcast::channel(capacity);
        Self {
            update_tx,
            denial_tx,
            seen_denials: Mutex::new(HashSet::new()),
        }
    }

    /// Decide visibility of `item` for one identity and emit the outcome.
    pub fn deliver(&self, user_id: &str, handle: &IdentityHandle, item: &CachedItem) -> Verdict {
        let verdict = check(&item.entitlement_ids, handle);

        if let Verdict::Denied { missing } = &verdict {
            debug!(
                user_id,
                security = %item.security,
                missing = ?missing,
                "Entitlement denied"
            );
            self.record_denial(user_id, &item.security, missing);
        }

        let fields = verdict.allowed().then(|| item.fields.clone());
        let _ = self.update_tx.send(FilteredUpdate {
            user_id: user_id.to_string(),
            security: item.security.clone(),
            verdict: verdict.clone(),
            fields,
            timestamp: Utc::now(),
        });

        verdict
    }

    /// Subscribe to per-user filtered results.
    pub fn subscribe_updates(&self) -> broadcast::Receiver<FilteredUpdate> {
        self.update_tx.subscribe()
    }

    /// Subscribe to first-occurrence denial notices (audit hook).
    pub fn subscribe_denials(&self) -> broadcast::Receiver<DenialNotice> {
        self.denial_tx.subscribe()
    }

    fn record_denial(&self, user_id: &str, security: &str, missing: &[EntitlementId]) {
        // The combination key is order-insensitive
        let mut key = missing.to_vec();
        key.sort_unstable();

        let fresh = self
            .seen_denials
            .lock()
            .unwrap()
            .insert((security.to_string(), key));

        if fresh {
            let _ = self.denial_tx.send(DenialNotice {
                security: security.to_string(),
                missing: missing.to_vec(),
                user_id: user_id.to_string(),
                timestamp: Utc::now(),
            });
        }
    }
}
