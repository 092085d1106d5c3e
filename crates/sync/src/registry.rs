/// Ref-counted subscription interest
///
/// Independent views (batch list, batch detail) may hold interest in the same
/// batch; a naive per-view subscribe/unsubscribe would cancel server-side
/// delivery while another view is still watching. Counts track marginal
/// interest and wire calls are emitted only when a count crosses zero.
use crate::batch::BatchId;
use crate::protocol::ClientMessage;
use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::mpsc;

/// Ref-counted per-batch subscription registry
pub struct SubscriptionRegistry {
    counts: Mutex<HashMap<BatchId, usize>>,
    outbound: mpsc::UnboundedSender<ClientMessage>,
}

impl SubscriptionRegistry {
    /// Wire emissions go to `outbound`; the connection supervisor drains it
    pub fn new(outbound: mpsc::UnboundedSender<ClientMessage>) -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            outbound,
        }
    }

    /// Register interest; emits one batched subscribe for ids whose count
    /// transitions 0→1
    pub fn subscribe(&self, ids: &[BatchId]) {
        let mut newly_active = Vec::new();
        {
            let mut counts = self.counts.lock();
            for id in ids {
                let count = counts.entry(id.clone()).or_insert(0);
                *count += 1;
                if *count == 1 {
                    newly_active.push(id.clone());
                }
            }
        }

        if !newly_active.is_empty() {
            tracing::debug!(batch_ids = ?newly_active, "subscribing");
            let _ = self.outbound.send(ClientMessage::Subscribe {
                batch_ids: newly_active,
            });
        }
    }

    /// Release interest; emits one batched unsubscribe for ids whose count
    /// transitions 1→0 and prunes them. Unknown or zero ids are no-ops.
    pub fn unsubscribe(&self, ids: &[BatchId]) {
        let mut released = Vec::new();
        {
            let mut counts = self.counts.lock();
            for id in ids {
                if let Some(count) = counts.get_mut(id) {
                    *count -= 1;
                    if *count == 0 {
                        counts.remove(id);
                        released.push(id.clone());
                    }
                }
            }
        }

        if !released.is_empty() {
            tracing::debug!(batch_ids = ?released, "unsubscribing");
            let _ = self.outbound.send(ClientMessage::Unsubscribe {
                batch_ids: released,
            });
        }
    }

    /// Current reference count for a batch id
    pub fn ref_count(&self, id: &str) -> usize {
        self.counts.lock().get(id).copied().unwrap_or(0)
    }

    /// All ids with live interest, sorted for deterministic wire payloads
    pub fn tracked_ids(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.counts.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }

    /// Re-announce the full id set after a reconnect.
    ///
    /// Counts are ignored: subscribe is idempotent server-side, so one
    /// subscribe carrying every tracked id restores delivery.
    pub fn reannounce(&self) {
        let ids = self.tracked_ids();
        if ids.is_empty() {
            return;
        }

        tracing::info!(batches = ids.len(), "re-announcing subscriptions");
        let _ = self
            .outbound
            .send(ClientMessage::Subscribe { batch_ids: ids });
    }
}
