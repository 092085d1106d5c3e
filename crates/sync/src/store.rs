/// Canonical observable table of batches
///
/// Single writer of truth: only the reconciler and the snapshot merge mutate
/// it, both on the context event loop. Readers observe copy-on-write map
/// snapshots through a watch channel; the published map's identity changes on
/// each mutation batch, entries are never dropped from under a reader.
use crate::batch::{Batch, BatchId};
use parking_lot::RwLock;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

type BatchMap = HashMap<BatchId, Batch>;

/// Observable batch table
pub struct BatchStore {
    batches: RwLock<BatchMap>,
    tx: watch::Sender<Arc<BatchMap>>,
}

impl BatchStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Arc::new(BatchMap::new()));
        Self {
            batches: RwLock::new(BatchMap::new()),
            tx,
        }
    }

    /// Reactive read handle; yields a fresh `Arc` map per mutation batch
    pub fn watch(&self) -> watch::Receiver<Arc<BatchMap>> {
        self.tx.subscribe()
    }

    pub fn get(&self, id: &str) -> Option<Batch> {
        self.batches.read().get(id).cloned()
    }

    pub fn ids(&self) -> Vec<BatchId> {
        let mut ids: Vec<BatchId> = self.batches.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.batches.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.batches.read().is_empty()
    }

    /// Create a placeholder on first observation of an unseen id
    pub(crate) fn ensure(&self, id: &str) {
        let mut batches = self.batches.write();
        if !batches.contains_key(id) {
            batches.insert(id.to_string(), Batch::placeholder(id));
            self.publish(&batches);
        }
    }

    /// Mutate one batch and publish; no-op for unknown ids
    pub(crate) fn update(&self, id: &str, mutate: impl FnOnce(&mut Batch)) {
        let mut batches = self.batches.write();
        if let Some(batch) = batches.get_mut(id) {
            mutate(batch);
            self.publish(&batches);
        }
    }

    /// Remove a batch (explicit delete event)
    pub(crate) fn remove(&self, id: &str) -> bool {
        let mut batches = self.batches.write();
        let removed = batches.remove(id).is_some();
        if removed {
            self.publish(&batches);
        }
        removed
    }

    /// Drop every entry (store reset)
    pub(crate) fn reset(&self) {
        let mut batches = self.batches.write();
        batches.clear();
        self.publish(&batches);
    }

    /// Merge one snapshot batch under the push-precedence policy
    pub(crate) fn merge_snapshot(&self, snapshot: Batch) {
        let mut batches = self.batches.write();
        Self::merge_one(&mut batches, snapshot);
        self.publish(&batches);
    }

    /// Merge a full snapshot response as one mutation batch (one publish)
    pub(crate) fn merge_snapshot_list(&self, snapshots: Vec<Batch>) {
        if snapshots.is_empty() {
            return;
        }

        let mut batches = self.batches.write();
        for snapshot in snapshots {
            Self::merge_one(&mut batches, snapshot);
        }
        self.publish(&batches);
    }

    fn merge_one(batches: &mut BatchMap, snapshot: Batch) {
        match batches.entry(snapshot.id.clone()) {
            Entry::Occupied(mut entry) => entry.get_mut().merge_snapshot(snapshot),
            Entry::Vacant(entry) => {
                entry.insert(snapshot);
            }
        }
    }

    fn publish(&self, batches: &BatchMap) {
        self.tx.send_replace(Arc::new(batches.clone()));
    }
}

impl Default for BatchStore {
    fn default() -> Self {
        Self::new()
    }
}
