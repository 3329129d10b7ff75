//! Sentinel-aware [`MetaStore`]
//!
//! Every operation is classified as a read or a write, runs on a connection
//! borrowed from the pool, and on a transport-level failure refreshes the
//! pool and retries exactly once. Logical outcomes are returned unchanged.
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};
use uuid::Uuid;

use super::redis::RedisMetaOps;
use super::{Chunk, File, FileInfo, JournalRecord, MetaStore, MetaStoreOps};
use crate::config::Config;
use crate::core::connection::RespConnection;
use crate::error::{HaError, HaResult};
use crate::pool::{ConnectionPool, PoolOptions};
use crate::sentinel::{SentinelClient, SentinelOptions};
use crate::utils::generate_id;

/// Run `$op` (which names the borrowed connection `$conn`) on a read or
/// write connection, with one refresh-and-retry on transport errors
macro_rules! route {
    (@once $self:ident, read, $conn:ident, $op:expr) => {{
        match $self.pool.get_read_connection($self.prefer_replica_reads).await {
            Ok(handle) => {
                let mut guard = handle.lock().await;
                let $conn: &mut RespConnection = &mut guard;
                $op.await
            }
            Err(e) => Err(e),
        }
    }};
    (@once $self:ident, write, $conn:ident, $op:expr) => {{
        match $self.pool.get_write_connection().await {
            Ok(handle) => {
                let mut guard = handle.lock().await;
                let $conn: &mut RespConnection = &mut guard;
                $op.await
            }
            Err(e) => Err(e),
        }
    }};
    ($self:ident, $kind:ident, $name:literal, |$conn:ident| $op:expr) => {{
        match route!(@once $self, $kind, $conn, $op) {
            Err(e) if e.is_transport() => {
                warn!(operation = $name, "Store operation failed, refreshing pool and retrying: {}", e);
                $self.pool.refresh_connections().await;
                route!(@once $self, $kind, $conn, $op)
            }
            result => result,
        }
    }};
}

pub struct SentinelMetaStore<O: MetaStoreOps = RedisMetaOps> {
    sentinel: Arc<SentinelClient>,
    pool: Arc<ConnectionPool>,
    ops: O,
    prefer_replica_reads: bool,
    /// Token of every lock taken through this store, by file key
    held_locks: Mutex<HashMap<String, String>>,
}

impl SentinelMetaStore<RedisMetaOps> {
    /// Build the full stack from a loaded configuration
    pub async fn from_config(config: &Config) -> HaResult<Self> {
        Self::connect(
            config.sentinel_options(),
            config.pool_options(),
            config.metastore.prefer_replica_reads,
            RedisMetaOps::new(),
        )
        .await
    }
}

impl<O: MetaStoreOps> SentinelMetaStore<O> {
    /// Connect to the Sentinels, initialize the pool and start monitoring.
    ///
    /// Fails with [`HaError::NoPrimaryAvailable`] when no primary connection
    /// can be established. Sentinels being unreachable at this point surfaces
    /// the same way, since the primary cannot be resolved without them.
    pub async fn connect(
        sentinel_options: SentinelOptions,
        pool_options: PoolOptions,
        prefer_replica_reads: bool,
        ops: O,
    ) -> HaResult<Self> {
        let sentinel = SentinelClient::connect(sentinel_options).await;
        let pool = ConnectionPool::new(Arc::clone(&sentinel), pool_options);
        if !pool.initialize().await {
            return Err(HaError::NoPrimaryAvailable);
        }
        if !sentinel.start_monitoring().await {
            warn!(master = %sentinel.master_name(), "Topology monitoring not started");
        }
        info!(master = %sentinel.master_name(), "Sentinel metadata store ready");

        Ok(Self {
            sentinel,
            pool,
            ops,
            prefer_replica_reads,
            held_locks: Mutex::new(HashMap::new()),
        })
    }

    /// Wrap an already initialized pool; monitoring is left as is
    pub fn from_pool(pool: Arc<ConnectionPool>, ops: O, prefer_replica_reads: bool) -> Self {
        Self {
            sentinel: Arc::clone(pool.sentinel()),
            pool,
            ops,
            prefer_replica_reads,
            held_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn sentinel(&self) -> &Arc<SentinelClient> {
        &self.sentinel
    }

    /// Stop topology monitoring; the pooled connections close on drop
    pub async fn shutdown(&self) {
        self.sentinel.stop_monitoring().await;
    }

    fn held_locks(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.held_locks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl<O: MetaStoreOps> MetaStore for SentinelMetaStore<O> {
    async fn get_meta(&self, namespace_id: u8, name: &str, version: Option<i32>) -> HaResult<File> {
        route!(self, read, "get_meta", |conn| self
            .ops
            .get_meta(conn, namespace_id, name, version))
    }

    async fn get_file_name(&self, uuid: Uuid) -> HaResult<File> {
        route!(self, read, "get_file_name", |conn| self.ops.get_file_name(conn, uuid))
    }

    async fn get_file_list(&self, namespace_id: Option<u8>, prefix: &str) -> HaResult<Vec<FileInfo>> {
        route!(self, read, "get_file_list", |conn| self
            .ops
            .get_file_list(conn, namespace_id, prefix))
    }

    async fn get_folder_list(
        &self,
        namespace_id: Option<u8>,
        prefix: &str,
        skip_subfolders: bool,
    ) -> HaResult<Vec<String>> {
        route!(self, read, "get_folder_list", |conn| self.ops.get_folder_list(
            conn,
            namespace_id,
            prefix,
            skip_subfolders
        ))
    }

    fn max_num_keys_supported(&self) -> u64 {
        self.ops.max_num_keys_supported()
    }

    async fn get_num_files(&self) -> HaResult<u64> {
        route!(self, read, "get_num_files", |conn| self.ops.get_num_files(conn))
    }

    async fn get_num_files_to_repair(&self) -> HaResult<u64> {
        route!(self, read, "get_num_files_to_repair", |conn| self
            .ops
            .get_num_files_to_repair(conn))
    }

    async fn get_files_to_repair(&self, limit: usize) -> HaResult<Vec<File>> {
        route!(self, read, "get_files_to_repair", |conn| self
            .ops
            .get_files_to_repair(conn, limit))
    }

    async fn get_files_pending_write_to_cloud(&self, limit: usize) -> HaResult<Vec<File>> {
        route!(self, read, "get_files_pending_write_to_cloud", |conn| self
            .ops
            .get_files_pending_write_to_cloud(conn, limit))
    }

    async fn get_file_journal(&self, file: &FileInfo) -> HaResult<Vec<JournalRecord>> {
        route!(self, read, "get_file_journal", |conn| self.ops.get_file_journal(conn, file))
    }

    async fn get_files_with_journal(&self) -> HaResult<Vec<FileInfo>> {
        route!(self, read, "get_files_with_journal", |conn| self
            .ops
            .get_files_with_journal(conn))
    }

    async fn file_has_journal(&self, file: &File) -> HaResult<bool> {
        route!(self, read, "file_has_journal", |conn| self.ops.file_has_journal(conn, file))
    }

    async fn put_meta(&self, file: &File) -> HaResult<()> {
        route!(self, write, "put_meta", |conn| self.ops.put_meta(conn, file))
    }

    async fn delete_meta(&self, file: &File) -> HaResult<()> {
        route!(self, write, "delete_meta", |conn| self.ops.delete_meta(conn, file))
    }

    async fn rename_meta(&self, src: &File, dst: &File) -> HaResult<()> {
        route!(self, write, "rename_meta", |conn| self.ops.rename_meta(conn, src, dst))
    }

    async fn update_timestamps(&self, file: &File) -> HaResult<()> {
        route!(self, write, "update_timestamps", |conn| self
            .ops
            .update_timestamps(conn, file))
    }

    async fn update_chunks(&self, file: &File, version: i32) -> HaResult<usize> {
        route!(self, write, "update_chunks", |conn| self
            .ops
            .update_chunks(conn, file, version))
    }

    async fn mark_file_as_needs_repair(&self, file: &File) -> HaResult<()> {
        route!(self, write, "mark_file_as_needs_repair", |conn| self
            .ops
            .mark_file_as_needs_repair(conn, file))
    }

    async fn mark_file_as_repaired(&self, file: &File) -> HaResult<()> {
        route!(self, write, "mark_file_as_repaired", |conn| self
            .ops
            .mark_file_as_repaired(conn, file))
    }

    async fn mark_file_as_pending_write_to_cloud(&self, file: &File) -> HaResult<()> {
        route!(self, write, "mark_file_as_pending_write_to_cloud", |conn| self
            .ops
            .mark_file_as_pending_write_to_cloud(conn, file))
    }

    async fn mark_file_as_written_to_cloud(&self, file: &File, remove_pending: bool) -> HaResult<()> {
        route!(self, write, "mark_file_as_written_to_cloud", |conn| self
            .ops
            .mark_file_as_written_to_cloud(conn, file, remove_pending))
    }

    async fn update_file_status(&self, file: &File) -> HaResult<()> {
        route!(self, write, "update_file_status", |conn| self
            .ops
            .update_file_status(conn, file))
    }

    async fn lock_file(&self, file: &File) -> HaResult<()> {
        // one token for both attempts, so a retry recognizes its own lock
        let token = generate_id("lock");
        route!(self, write, "lock_file", |conn| self.ops.lock_file(conn, file, &token))?;
        self.held_locks().insert(file.key(), token);
        Ok(())
    }

    async fn unlock_file(&self, file: &File) -> HaResult<()> {
        let key = file.key();
        let token = self.held_locks().get(&key).cloned();
        route!(self, write, "unlock_file", |conn| self
            .ops
            .unlock_file(conn, file, token.as_deref()))?;
        self.held_locks().remove(&key);
        Ok(())
    }

    async fn add_chunk_to_journal(
        &self,
        file: &File,
        chunk: &Chunk,
        container_id: i32,
        is_write: bool,
    ) -> HaResult<()> {
        route!(self, write, "add_chunk_to_journal", |conn| self
            .ops
            .add_chunk_to_journal(conn, file, chunk, container_id, is_write))
    }

    async fn update_chunk_in_journal(
        &self,
        file: &File,
        chunk: &Chunk,
        is_write: bool,
        delete_record: bool,
        container_id: i32,
    ) -> HaResult<()> {
        route!(self, write, "update_chunk_in_journal", |conn| self
            .ops
            .update_chunk_in_journal(conn, file, chunk, is_write, delete_record, container_id))
    }

    async fn get_next_file_for_task_check(&self) -> HaResult<Option<File>> {
        route!(self, write, "get_next_file_for_task_check", |conn| self
            .ops
            .get_next_file_for_task_check(conn))
    }
}
