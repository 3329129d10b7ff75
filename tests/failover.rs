mod common;

use common::*;
use meta_sentinel::metastore::{Chunk, File, FileStatus};
use meta_sentinel::{
    ConnectionPool, HaError, MetaStore, RedisMetaOps, SentinelClient, SentinelMetaStore, StoreError,
};
use std::time::Duration;

struct Cluster {
    primary: MockStore,
    replica: MockStore,
    sentinel: MockSentinel,
}

impl Cluster {
    async fn start() -> Self {
        let primary = MockStore::start().await;
        let replica = MockStore::replica_of(&primary).await;
        let sentinel = MockSentinel::start(&primary.endpoint).await;
        sentinel.set_replicas(&[(&replica.endpoint, true)]);
        Self {
            primary,
            replica,
            sentinel,
        }
    }

    /// Full stack with background monitoring
    async fn store(&self, prefer_replica_reads: bool) -> SentinelMetaStore {
        SentinelMetaStore::connect(
            sentinel_options(vec![self.sentinel.endpoint.clone()]),
            pool_options(),
            prefer_replica_reads,
            RedisMetaOps::new(),
        )
        .await
        .unwrap()
    }

    /// Initialized pool without monitoring, so only the retry path can
    /// discover topology changes
    async fn unmonitored_store(&self, prefer_replica_reads: bool) -> SentinelMetaStore {
        let client = SentinelClient::connect(sentinel_options(vec![self.sentinel.endpoint.clone()])).await;
        let pool = ConnectionPool::new(client, pool_options());
        assert!(pool.initialize().await);
        SentinelMetaStore::from_pool(pool, RedisMetaOps::new(), prefer_replica_reads)
    }

    /// Sentinel's view after promoting the replica; the old primary is gone
    fn promote_replica(&self) {
        self.replica.set_readonly(false);
        self.sentinel.set_primary(&self.replica.endpoint);
        self.sentinel.set_replicas(&[]);
    }
}

#[tokio::test]
async fn test_metadata_operations_through_adapter() {
    let cluster = Cluster::start().await;
    let store = cluster.store(true).await;

    let mut photo = File::new(1, "photos/2024/a.jpg");
    photo.size = 4096;
    let doc = File::new(1, "docs/readme.txt");
    let other = File::new(2, "photos/b.jpg");
    for file in [&photo, &doc, &other] {
        store.put_meta(file).await.unwrap();
    }

    assert_eq!(store.get_num_files().await.unwrap(), 3);
    assert_eq!(store.get_meta(1, "photos/2024/a.jpg", None).await.unwrap(), photo);
    assert_eq!(store.get_meta(1, "photos/2024/a.jpg", Some(0)).await.unwrap(), photo);
    assert!(store
        .get_meta(1, "photos/2024/a.jpg", Some(3))
        .await
        .unwrap_err()
        .is_not_found());
    assert_eq!(store.get_file_name(doc.uuid).await.unwrap(), doc);

    let listed = store.get_file_list(None, "photos/").await.unwrap();
    let names: Vec<_> = listed.iter().map(|f| (f.namespace_id, f.name.as_str())).collect();
    assert_eq!(names, vec![(1, "photos/2024/a.jpg"), (2, "photos/b.jpg")]);
    assert_eq!(store.get_file_list(Some(1), "").await.unwrap().len(), 2);

    assert_eq!(
        store.get_folder_list(Some(1), "", false).await.unwrap(),
        vec!["docs/", "photos/", "photos/2024/"]
    );
    assert_eq!(
        store.get_folder_list(Some(1), "", true).await.unwrap(),
        vec!["docs/", "photos/"]
    );

    store.mark_file_as_needs_repair(&photo).await.unwrap();
    assert_eq!(store.get_num_files_to_repair().await.unwrap(), 1);
    assert_eq!(store.get_files_to_repair(10).await.unwrap(), vec![photo.clone()]);
    store.mark_file_as_repaired(&photo).await.unwrap();
    assert_eq!(store.get_num_files_to_repair().await.unwrap(), 0);

    store.mark_file_as_pending_write_to_cloud(&doc).await.unwrap();
    assert_eq!(store.get_files_pending_write_to_cloud(10).await.unwrap().len(), 1);
    store.mark_file_as_written_to_cloud(&doc, true).await.unwrap();
    assert!(store.get_files_pending_write_to_cloud(10).await.unwrap().is_empty());
    assert_eq!(
        store.get_meta(1, "docs/readme.txt", None).await.unwrap().status,
        FileStatus::InCloud
    );

    let chunk = Chunk::new(0, 0, 4096);
    store.add_chunk_to_journal(&photo, &chunk, 7, true).await.unwrap();
    assert!(store.file_has_journal(&photo).await.unwrap());
    let journal = store.get_file_journal(&(&photo).into()).await.unwrap();
    assert_eq!(journal.len(), 1);
    assert!(journal[0].is_pre_op);
    store
        .update_chunk_in_journal(&photo, &chunk, true, false, 7)
        .await
        .unwrap();
    assert!(!store.get_file_journal(&(&photo).into()).await.unwrap()[0].is_pre_op);
    assert_eq!(store.get_files_with_journal().await.unwrap().len(), 1);
    store
        .update_chunk_in_journal(&photo, &chunk, true, true, 7)
        .await
        .unwrap();
    assert!(!store.file_has_journal(&photo).await.unwrap());
    assert!(store.get_files_with_journal().await.unwrap().is_empty());

    let mut with_chunks = photo.clone();
    with_chunks.chunks = vec![Chunk::new(0, 0, 2048), Chunk::new(1, 0, 2048), Chunk::new(2, 1, 10)];
    assert_eq!(store.update_chunks(&with_chunks, 0).await.unwrap(), 2);

    let renamed = File::new(1, "photos/2024/b.jpg");
    store.rename_meta(&photo, &renamed).await.unwrap();
    assert!(store
        .get_meta(1, "photos/2024/a.jpg", None)
        .await
        .unwrap_err()
        .is_not_found());
    let moved = store.get_meta(1, "photos/2024/b.jpg", None).await.unwrap();
    assert_eq!(moved.uuid, photo.uuid);
    assert_eq!(moved.chunks.len(), 2);

    store.delete_meta(&moved).await.unwrap();
    assert_eq!(store.get_num_files().await.unwrap(), 2);
    assert!(store.get_file_name(photo.uuid).await.unwrap_err().is_not_found());

    assert_eq!(store.max_num_keys_supported(), 1 << 32);
    store.shutdown().await;
}

#[tokio::test]
async fn test_reads_go_to_replica_and_writes_to_primary() {
    let cluster = Cluster::start().await;
    let store = cluster.store(true).await;

    let file = File::new(1, "a");
    store.put_meta(&file).await.unwrap();
    store.get_meta(1, "a", None).await.unwrap();

    assert_eq!(cluster.replica.command_count("SET"), 0);
    assert_eq!(cluster.primary.command_count("GET"), 0);
    assert_eq!(cluster.replica.command_count("GET"), 1);
    store.shutdown().await;
}

#[tokio::test]
async fn test_failover_is_transparent_with_monitoring() {
    let cluster = Cluster::start().await;
    let store = cluster.store(true).await;

    let before = File::new(1, "before");
    store.put_meta(&before).await.unwrap();

    cluster.primary.kill();
    cluster.promote_replica();

    let after = File::new(1, "after");
    store.put_meta(&after).await.unwrap();
    assert_eq!(store.get_meta(1, "before", None).await.unwrap(), before);
    assert_eq!(store.get_meta(1, "after", None).await.unwrap(), after);
    assert_eq!(
        store.pool().primary_addr().await,
        Some(cluster.replica.endpoint.clone())
    );
    store.shutdown().await;
}

#[tokio::test]
async fn test_retry_after_refresh_without_monitoring() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(true).await;
    assert!(!store.sentinel().is_monitoring());

    cluster.primary.kill();
    cluster.promote_replica();

    let file = File::new(1, "after");
    store.put_meta(&file).await.unwrap();
    assert!(cluster.replica.get("file:1:after").is_some());
    assert_eq!(
        store.pool().primary_addr().await,
        Some(cluster.replica.endpoint.clone())
    );
}

#[tokio::test]
async fn test_read_falls_back_to_primary_when_replicas_vanish() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(true).await;
    let file = File::new(1, "a");
    store.put_meta(&file).await.unwrap();

    cluster.replica.kill();
    cluster.sentinel.set_replicas(&[]);

    assert_eq!(store.get_meta(1, "a", None).await.unwrap(), file);
    assert_eq!(store.pool().replica_count().await, 0);
    assert_eq!(cluster.primary.command_count("GET"), 1);
}

#[tokio::test]
async fn test_demoted_primary_readonly_is_retried() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(true).await;

    // the old primary is still up but now refuses writes
    cluster.primary.set_readonly(true);
    cluster.promote_replica();

    store.put_meta(&File::new(1, "a")).await.unwrap();
    assert!(cluster.primary.command_count("SET") > 0);
    assert!(cluster.replica.command_count("SET") >= 2);
    assert_eq!(
        store.pool().primary_addr().await,
        Some(cluster.replica.endpoint.clone())
    );
}

#[tokio::test]
async fn test_not_found_is_not_retried() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(false).await;

    let err = store.get_meta(1, "missing", None).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(cluster.primary.command_count("GET"), 1);
    assert_eq!(cluster.sentinel.master_queries(), 1);
}

#[tokio::test]
async fn test_lock_held_is_not_retried() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(false).await;
    let file = File::new(1, "locked");

    store.lock_file(&file).await.unwrap();
    let err = store.lock_file(&file).await.unwrap_err();
    assert!(matches!(err, HaError::Store(StoreError::LockHeld { .. })));
    assert_eq!(cluster.primary.command_count("SET"), 2);

    store.unlock_file(&file).await.unwrap();
    store.lock_file(&file).await.unwrap();
}

#[tokio::test]
async fn test_lock_survives_lost_reply() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(false).await;
    let file = File::new(1, "locked");

    // the lock is taken but the connection drops before the reply
    cluster.primary.hang_up_after("SET");
    store.lock_file(&file).await.unwrap();
    assert_eq!(cluster.primary.command_count("SET"), 2);

    let err = store.lock_file(&file).await.unwrap_err();
    assert!(matches!(err, HaError::Store(StoreError::LockHeld { .. })));

    store.unlock_file(&file).await.unwrap();
    assert!(cluster.primary.get("lock:1:locked").is_none());
}

#[tokio::test]
async fn test_unlock_leaves_foreign_lock() {
    let cluster = Cluster::start().await;
    let owner = cluster.unmonitored_store(false).await;
    let other = cluster.unmonitored_store(false).await;
    let file = File::new(1, "shared");

    owner.lock_file(&file).await.unwrap();
    let err = other.unlock_file(&file).await.unwrap_err();
    assert!(matches!(err, HaError::Store(StoreError::LockHeld { .. })));
    assert!(cluster.primary.get("lock:1:shared").is_some());

    owner.unlock_file(&file).await.unwrap();
    other.unlock_file(&file).await.unwrap();
    other.lock_file(&file).await.unwrap();
}

#[tokio::test]
async fn test_rename_with_lost_reply_completes_once() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(false).await;
    let a = File::new(1, "a");
    store.put_meta(&a).await.unwrap();
    store.mark_file_as_needs_repair(&a).await.unwrap();

    cluster.primary.hang_up_after("DEL");
    store.rename_meta(&a, &File::new(1, "b")).await.unwrap();

    let names: Vec<_> = store
        .get_file_list(None, "")
        .await
        .unwrap()
        .into_iter()
        .map(|f| f.name)
        .collect();
    assert_eq!(names, vec!["b"]);
    let to_repair = store.get_files_to_repair(10).await.unwrap();
    assert_eq!(to_repair.len(), 1);
    assert_eq!(to_repair[0].name, "b");
    assert_eq!(to_repair[0].uuid, a.uuid);
    assert!(store.get_meta(1, "a", None).await.unwrap_err().is_not_found());
}

#[tokio::test]
async fn test_put_meta_with_lost_reply_is_applied_once() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(false).await;
    let file = File::new(1, "a");

    cluster.primary.hang_up_after("SADD");
    store.put_meta(&file).await.unwrap();

    assert_eq!(cluster.primary.command_count("SADD"), 2);
    assert_eq!(store.get_num_files().await.unwrap(), 1);
    assert_eq!(store.get_file_name(file.uuid).await.unwrap(), file);
}

#[tokio::test]
async fn test_logical_conflicts_pass_through() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(false).await;

    let a = File::new(1, "a");
    let b = File::new(1, "b");
    store.put_meta(&a).await.unwrap();
    store.put_meta(&b).await.unwrap();
    let queries = cluster.sentinel.master_queries();

    let err = store.rename_meta(&a, &b).await.unwrap_err();
    assert!(matches!(err, HaError::Store(StoreError::AlreadyExists { .. })));

    let err = store.update_chunks(&a, 5).await.unwrap_err();
    assert!(matches!(
        err,
        HaError::Store(StoreError::VersionConflict {
            expected: 5,
            found: 0,
            ..
        })
    ));

    // no refresh happened
    assert_eq!(cluster.sentinel.master_queries(), queries);
}

#[tokio::test]
async fn test_second_failure_is_returned() {
    let cluster = Cluster::start().await;
    let store = cluster.unmonitored_store(false).await;

    cluster.primary.kill();
    cluster.replica.kill();

    let err = store.put_meta(&File::new(1, "a")).await.unwrap_err();
    assert!(err.is_transport());
}

#[tokio::test]
async fn test_connect_fails_without_primary() {
    let sentinel = MockSentinel::start(&dead_endpoint().await).await;
    let result = SentinelMetaStore::connect(
        sentinel_options(vec![sentinel.endpoint.clone()]),
        pool_options(),
        true,
        RedisMetaOps::new(),
    )
    .await;
    assert!(matches!(result, Err(HaError::NoPrimaryAvailable)));
}

#[tokio::test]
async fn test_task_check_rotates_through_files() {
    let cluster = Cluster::start().await;
    let store = cluster.store(true).await;
    assert!(store.get_next_file_for_task_check().await.unwrap().is_none());

    for name in ["c", "a", "b"] {
        store.put_meta(&File::new(1, name)).await.unwrap();
    }

    let mut visited = Vec::new();
    for _ in 0..4 {
        let file = store.get_next_file_for_task_check().await.unwrap().unwrap();
        visited.push(file.name);
    }
    assert_eq!(visited, vec!["a", "b", "c", "a"]);

    // the cursor lives on the primary
    assert_eq!(cluster.replica.command_count("SET"), 0);
    store.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_stops_monitoring() {
    let cluster = Cluster::start().await;
    let store = cluster.store(true).await;
    assert!(store.sentinel().is_monitoring());

    tokio::time::timeout(Duration::from_secs(1), store.shutdown())
        .await
        .unwrap();
    assert!(!store.sentinel().is_monitoring());
}
