//! Metadata store interface and record types
//!
//! [`MetaStore`] is the interface callers program against. [`MetaStoreOps`]
//! is the per-operation store logic run against an explicit connection; the
//! Sentinel adapter composes an implementation of it with the connection
//! pool.
pub mod redis;
pub mod sentinel;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::core::connection::RespConnection;
use crate::error::HaResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    #[default]
    Available,
    NeedsRepair,
    PendingCloudWrite,
    InCloud,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: i32,
    pub file_version: i32,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

impl Chunk {
    pub fn new(chunk_id: i32, file_version: i32, size: u64) -> Self {
        Self {
            chunk_id,
            file_version,
            size,
            checksum: None,
        }
    }
}

/// Full metadata record of one file
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct File {
    pub uuid: Uuid,
    pub namespace_id: u8,
    pub name: String,
    pub version: i32,
    pub size: u64,
    pub ctime: u64,
    pub atime: u64,
    pub mtime: u64,
    #[serde(default)]
    pub status: FileStatus,
    #[serde(default)]
    pub chunks: Vec<Chunk>,
    #[serde(default)]
    pub container_ids: Vec<i32>,
}

impl File {
    /// A new, empty version-0 record with a fresh uuid and current timestamps
    pub fn new<S: Into<String>>(namespace_id: u8, name: S) -> Self {
        let now = crate::utils::unix_timestamp();
        Self {
            uuid: Uuid::new_v4(),
            namespace_id,
            name: name.into(),
            ctime: now,
            atime: now,
            mtime: now,
            ..Default::default()
        }
    }

    /// `{namespace}:{name}`, the identity used across all store keys
    pub fn key(&self) -> String {
        file_key(self.namespace_id, &self.name)
    }
}

impl fmt::Display for File {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{} (v{})", self.namespace_id, self.name, self.version)
    }
}

/// Summary of a file as returned by listings
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub namespace_id: u8,
    pub name: String,
    pub uuid: Uuid,
    pub version: i32,
    pub size: u64,
    pub ctime: u64,
    pub atime: u64,
    pub mtime: u64,
}

impl FileInfo {
    pub fn key(&self) -> String {
        file_key(self.namespace_id, &self.name)
    }
}

impl From<&File> for FileInfo {
    fn from(file: &File) -> Self {
        Self {
            namespace_id: file.namespace_id,
            name: file.name.clone(),
            uuid: file.uuid,
            version: file.version,
            size: file.size,
            ctime: file.ctime,
            atime: file.atime,
            mtime: file.mtime,
        }
    }
}

/// One chunk operation recorded in a file's journal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub chunk: Chunk,
    pub container_id: i32,
    pub is_write: bool,
    /// True until the operation is confirmed with an update
    pub is_pre_op: bool,
}

pub(crate) fn file_key(namespace_id: u8, name: &str) -> String {
    format!("{namespace_id}:{name}")
}

/// Split a `{namespace}:{name}` identity; names may themselves contain `:`
pub(crate) fn split_file_key(key: &str) -> Option<(u8, &str)> {
    let (ns, name) = key.split_once(':')?;
    Some((ns.parse().ok()?, name))
}

/// The metadata store interface
#[async_trait]
pub trait MetaStore: Send + Sync {
    // reads

    /// Load a file record; `version` pins a specific version
    async fn get_meta(&self, namespace_id: u8, name: &str, version: Option<i32>) -> HaResult<File>;
    async fn get_file_name(&self, uuid: Uuid) -> HaResult<File>;
    async fn get_file_list(&self, namespace_id: Option<u8>, prefix: &str) -> HaResult<Vec<FileInfo>>;
    async fn get_folder_list(
        &self,
        namespace_id: Option<u8>,
        prefix: &str,
        skip_subfolders: bool,
    ) -> HaResult<Vec<String>>;
    fn max_num_keys_supported(&self) -> u64;
    async fn get_num_files(&self) -> HaResult<u64>;
    async fn get_num_files_to_repair(&self) -> HaResult<u64>;
    async fn get_files_to_repair(&self, limit: usize) -> HaResult<Vec<File>>;
    async fn get_files_pending_write_to_cloud(&self, limit: usize) -> HaResult<Vec<File>>;
    async fn get_file_journal(&self, file: &FileInfo) -> HaResult<Vec<JournalRecord>>;
    async fn get_files_with_journal(&self) -> HaResult<Vec<FileInfo>>;
    async fn file_has_journal(&self, file: &File) -> HaResult<bool>;

    // writes

    async fn put_meta(&self, file: &File) -> HaResult<()>;
    async fn delete_meta(&self, file: &File) -> HaResult<()>;
    async fn rename_meta(&self, src: &File, dst: &File) -> HaResult<()>;
    async fn update_timestamps(&self, file: &File) -> HaResult<()>;
    /// Replace the chunk list of `version`; returns the number of chunks stored
    async fn update_chunks(&self, file: &File, version: i32) -> HaResult<usize>;
    async fn mark_file_as_needs_repair(&self, file: &File) -> HaResult<()>;
    async fn mark_file_as_repaired(&self, file: &File) -> HaResult<()>;
    async fn mark_file_as_pending_write_to_cloud(&self, file: &File) -> HaResult<()>;
    async fn mark_file_as_written_to_cloud(&self, file: &File, remove_pending: bool) -> HaResult<()>;
    async fn update_file_status(&self, file: &File) -> HaResult<()>;
    /// Take the exclusive lock on `file`; [`StoreError::LockHeld`] if another
    /// holder has it
    ///
    /// [`StoreError::LockHeld`]: crate::error::StoreError::LockHeld
    async fn lock_file(&self, file: &File) -> HaResult<()>;
    /// Release a lock taken through this store; a lock held by anyone else is
    /// left in place and reported as held
    async fn unlock_file(&self, file: &File) -> HaResult<()>;
    async fn add_chunk_to_journal(
        &self,
        file: &File,
        chunk: &Chunk,
        container_id: i32,
        is_write: bool,
    ) -> HaResult<()>;
    async fn update_chunk_in_journal(
        &self,
        file: &File,
        chunk: &Chunk,
        is_write: bool,
        delete_record: bool,
        container_id: i32,
    ) -> HaResult<()>;
    /// Next file in the background task-check rotation; advances a shared cursor
    async fn get_next_file_for_task_check(&self) -> HaResult<Option<File>>;
}

/// Store logic for each [`MetaStore`] operation, run on a given connection
#[async_trait]
pub trait MetaStoreOps: Send + Sync {
    async fn get_meta(
        &self,
        conn: &mut RespConnection,
        namespace_id: u8,
        name: &str,
        version: Option<i32>,
    ) -> HaResult<File>;
    async fn get_file_name(&self, conn: &mut RespConnection, uuid: Uuid) -> HaResult<File>;
    async fn get_file_list(
        &self,
        conn: &mut RespConnection,
        namespace_id: Option<u8>,
        prefix: &str,
    ) -> HaResult<Vec<FileInfo>>;
    async fn get_folder_list(
        &self,
        conn: &mut RespConnection,
        namespace_id: Option<u8>,
        prefix: &str,
        skip_subfolders: bool,
    ) -> HaResult<Vec<String>>;
    fn max_num_keys_supported(&self) -> u64;
    async fn get_num_files(&self, conn: &mut RespConnection) -> HaResult<u64>;
    async fn get_num_files_to_repair(&self, conn: &mut RespConnection) -> HaResult<u64>;
    async fn get_files_to_repair(&self, conn: &mut RespConnection, limit: usize)
        -> HaResult<Vec<File>>;
    async fn get_files_pending_write_to_cloud(
        &self,
        conn: &mut RespConnection,
        limit: usize,
    ) -> HaResult<Vec<File>>;
    async fn get_file_journal(
        &self,
        conn: &mut RespConnection,
        file: &FileInfo,
    ) -> HaResult<Vec<JournalRecord>>;
    async fn get_files_with_journal(&self, conn: &mut RespConnection) -> HaResult<Vec<FileInfo>>;
    async fn file_has_journal(&self, conn: &mut RespConnection, file: &File) -> HaResult<bool>;

    async fn put_meta(&self, conn: &mut RespConnection, file: &File) -> HaResult<()>;
    async fn delete_meta(&self, conn: &mut RespConnection, file: &File) -> HaResult<()>;
    async fn rename_meta(&self, conn: &mut RespConnection, src: &File, dst: &File)
        -> HaResult<()>;
    async fn update_timestamps(&self, conn: &mut RespConnection, file: &File) -> HaResult<()>;
    async fn update_chunks(
        &self,
        conn: &mut RespConnection,
        file: &File,
        version: i32,
    ) -> HaResult<usize>;
    async fn mark_file_as_needs_repair(&self, conn: &mut RespConnection, file: &File)
        -> HaResult<()>;
    async fn mark_file_as_repaired(&self, conn: &mut RespConnection, file: &File) -> HaResult<()>;
    async fn mark_file_as_pending_write_to_cloud(
        &self,
        conn: &mut RespConnection,
        file: &File,
    ) -> HaResult<()>;
    async fn mark_file_as_written_to_cloud(
        &self,
        conn: &mut RespConnection,
        file: &File,
        remove_pending: bool,
    ) -> HaResult<()>;
    async fn update_file_status(&self, conn: &mut RespConnection, file: &File) -> HaResult<()>;
    /// Take the lock under `token`; succeeds if `token` already holds it
    async fn lock_file(&self, conn: &mut RespConnection, file: &File, token: &str) -> HaResult<()>;
    /// Release the lock if `token` holds it; `None` releases nothing
    async fn unlock_file(
        &self,
        conn: &mut RespConnection,
        file: &File,
        token: Option<&str>,
    ) -> HaResult<()>;
    async fn add_chunk_to_journal(
        &self,
        conn: &mut RespConnection,
        file: &File,
        chunk: &Chunk,
        container_id: i32,
        is_write: bool,
    ) -> HaResult<()>;
    async fn update_chunk_in_journal(
        &self,
        conn: &mut RespConnection,
        file: &File,
        chunk: &Chunk,
        is_write: bool,
        delete_record: bool,
        container_id: i32,
    ) -> HaResult<()>;
    async fn get_next_file_for_task_check(&self, conn: &mut RespConnection)
        -> HaResult<Option<File>>;
}
