use chrono::{DateTime, Utc};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

use crate::entitlement::{EntitlementGate, EntitlementId};
use crate::identity::IdentityHandle;


/// Immutable snapshot of one response item held for replay.
#[derive(Clone, Debug)]
pub struct CachedItem {
    /// Time-ordered item id (UUIDv7).
    pub item_id: Uuid,
    pub security: String,
    pub fields: Value,
    pub entitlement_ids: Vec<EntitlementId>,
    pub received_at: DateTime<Utc>,
}

impl CachedItem {
    pub fn new(security: String, fields: Value, entitlement_ids: Vec<EntitlementId>) -> Self {
        Self {
            item_id: Uuid::now_v7(),
            security,
            fields,
            entitlement_ids,
            received_at: Utc::now(),
        }
    }
}

/// Ordered buffer of every partial/final response item for one logical data
/// request.
///
/// Insertion order is arrival order and is preserved on replay; later items
/// may supersede or append to earlier partials. Items live for the process
/// lifetime — the provider gives no "no longer needed" signal. Writes happen
/// on the dispatch task only; replay reads may come from anywhere.
pub struct ResponseCache {
    items: RwLock<Vec<CachedItem>>,
    complete: AtomicBool,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            items: RwLock::new(Vec::new()),
            complete: AtomicBool::new(false),
        }
    }

    /// Append one response item in arrival order.
    pub fn record(&self, item: CachedItem) {
        if self.is_complete() {
            warn!(
                security = %item.security,
                "Response item recorded after the final response"
            );
        }
        self.items.write().unwrap().push(item);
    }

    /// Mark the tracked operation complete: late authorizers now know the
    /// cache is exhaustive.
    pub fn mark_complete(&self) {
        self.complete.store(true, Ordering::SeqCst);
        info!(items = self.len(), "Final response received, cache complete");
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.items.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.read().unwrap().is_empty()
    }

    /// Every cached item for `security`, oldest first.
    pub fn items_for(&self, security: &str) -> Vec<CachedItem> {
        self.items
            .read()
            .unwrap()
            .iter()
            .filter(|item| item.security == security)
            .cloned()
            .collect()
    }

    /// Replay the full cached history, in order, through the entitlement gate
    /// for one newly authorized identity. Returns the number of items
    /// replayed.
    ///
    /// Replay happens exactly once, at the moment of authorization; items
    /// recorded afterwards are not pushed to this identity (documented
    /// policy — late callers see them only via queries).
    pub fn replay_for(&self, user_id: &str, handle: &IdentityHandle, gate: &EntitlementGate) -> usize {
        let items = self.items.read().unwrap();
        for item in items.iter() {
            gate.deliver(user_id, handle, item);
        }

        info!(
            user_id,
            items = items.len(),
            complete = self.is_complete(),
            "Replayed cached history"
        );
        items.len()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}
