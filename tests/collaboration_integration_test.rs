// Integration tests for the collaboration engine: Hub + History + Store
// wired together end to end, covering the documented concurrency scenarios.

#[cfg(test)]
mod collaboration_integration_tests {
    use std::sync::Arc;
    use std::time::Duration;

    use collab_engine::hub::Hub;
    use collab_engine::protocol::{OperationRequest, WireOpType};
    use collab_engine::session::Session;
    use collab_engine::store::{OperationStore, SqliteOperationStore};
    use uuid::Uuid;

    async fn test_store() -> Arc<dyn OperationStore> {
        Arc::new(SqliteOperationStore::connect("sqlite::memory:").await.unwrap())
    }

    fn insert_request(position: u64, content: &str) -> OperationRequest {
        OperationRequest {
            op_type: WireOpType::Insert,
            position,
            content: Some(content.to_string()),
            length: None,
        }
    }

    fn delete_request(position: u64, length: u64) -> OperationRequest {
        OperationRequest {
            op_type: WireOpType::Delete,
            position,
            content: None,
            length: Some(length),
        }
    }

    #[tokio::test]
    async fn s1_concurrent_inserts_converge_across_two_clients() {
        let store = test_store().await;
        let document_id = Uuid::new_v4();
        let (hub, _handle) = Hub::spawn(document_id, String::new(), Vec::new(), store, 1024, 1000, Duration::from_secs(30));

        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();

        hub.submit(alice, insert_request(0, "Hello"), 0).await.unwrap();

        // Bob submits concurrently, based on the same version Alice started from.
        let bob_accepted = hub.submit(bob, insert_request(0, "World"), 0).await.unwrap();
        assert_eq!(bob_accepted.len(), 1);

        let synced = hub.sync(0).await.unwrap();
        assert_eq!(synced.operations_since.len(), 2);
        assert_eq!(synced.current_version, 2);
    }

    #[tokio::test]
    async fn s5_slow_subscriber_is_dropped_without_blocking_the_hub() {
        let store = test_store().await;
        let document_id = Uuid::new_v4();
        let (hub, _handle) = Hub::spawn(document_id, String::new(), Vec::new(), store, 1024, 1000, Duration::from_secs(30));

        let author = Uuid::new_v4();
        let fast_subscriber = Uuid::new_v4();
        let slow_subscriber = Uuid::new_v4();

        let fast_session = Session::new(document_id, fast_subscriber);
        let (fast_tx, mut fast_rx) = tokio::sync::mpsc::channel(64);
        hub.join(fast_session, fast_tx).await.unwrap();

        // A subscriber with a channel of capacity 1 and nobody draining it.
        let slow_session = Session::new(document_id, slow_subscriber);
        let (slow_tx, _slow_rx) = tokio::sync::mpsc::channel(1);
        hub.join(slow_session, slow_tx).await.unwrap();

        for i in 0..10u64 {
            hub.submit(author, insert_request(i, "x"), i).await.unwrap();
        }

        // The fast subscriber still receives broadcasts; the Hub never blocked
        // waiting on the slow one's full channel.
        let mut received = 0;
        while fast_rx.try_recv().is_ok() {
            received += 1;
        }
        assert!(received > 0);
    }

    #[tokio::test]
    async fn s6_hub_rebuilds_history_from_store_after_restart() {
        let store = test_store().await;
        let document_id = Uuid::new_v4();
        let author = Uuid::new_v4();

        {
            let (hub, _handle) = Hub::spawn(
                document_id,
                String::new(),
                Vec::new(),
                Arc::clone(&store),
                1024,
                1000,
                Duration::from_secs(30),
            );
            for i in 0..5u64 {
                hub.submit(author, insert_request(i, "a"), i).await.unwrap();
            }
        }

        let persisted = store.load_since(document_id, 0).await.unwrap();
        assert_eq!(persisted.len(), 5);

        let (rebuilt, _handle) = Hub::spawn(
            document_id,
            String::new(),
            persisted,
            Arc::clone(&store),
            1024,
            1000,
            Duration::from_secs(30),
        );
        let synced = rebuilt.sync(3).await.unwrap();
        assert_eq!(synced.current_version, 5);
        assert_eq!(synced.operations_since.len(), 2);
    }

    #[tokio::test]
    async fn s7_delete_split_by_concurrent_insert_preserves_intent() {
        let store = test_store().await;
        let document_id = Uuid::new_v4();
        let (hub, _handle) = Hub::spawn(document_id, String::new(), Vec::new(), store, 1024, 1000, Duration::from_secs(30));

        let author = Uuid::new_v4();
        hub.submit(author, insert_request(0, "abcdef"), 0).await.unwrap();

        let deleter = Uuid::new_v4();
        let inserter = Uuid::new_v4();

        // Both submitted against base_version=1: insert "XY" at 3 lands inside
        // the delete's target range [1, 5) ("bcde"), so once the delete is
        // transformed against the already-accepted insert it must split in
        // two rather than merely shift, or it would delete the wrong span.
        hub.submit(inserter, insert_request(3, "XY"), 1).await.unwrap();
        let accepted_delete = hub.submit(deleter, delete_request(1, 4), 1).await.unwrap();

        assert_eq!(accepted_delete.len(), 2);

        let synced = hub.sync(0).await.unwrap();
        assert_eq!(synced.current_version, 4);
        assert_eq!(synced.operations_since.len(), 4);

        // "abcdef" + insert("XY", 3) -> "abcXYdef"; delete([1,5)) targets
        // "bcde" but the insert lands inside it, so the split fragments must
        // still net out to removing exactly that span, not "bcde" shifted.
        let mut text = String::new();
        for op in &synced.operations_since {
            text = op.apply(&text).unwrap();
        }
        assert_eq!(text, "aXYf");
    }
}
