//! Redis record layout for the metadata store
//!
//! Keys, with `{key}` = `{namespace}:{name}`:
//!
//! | key | type | content |
//! |---|---|---|
//! | `file:{key}` | string | JSON [`File`] |
//! | `uuid:{uuid}` | string | `{key}` |
//! | `files`, `repair`, `pending_cloud`, `journals` | set | `{key}` members |
//! | `lock:{key}` | string | lock token, set with `NX` |
//! | `journal:{key}` | hash | `{chunk_id}:{container_id}` to JSON [`JournalRecord`] |
//! | `task_check:cursor` | string | last visited `{key}` |
//!
//! Writes that touch more than one key go through `MULTI`/`EXEC` and are
//! idempotent, since the adapter retries a write whose reply was lost.
use async_trait::async_trait;
use std::collections::BTreeSet;
use uuid::Uuid;

use super::{split_file_key, Chunk, File, FileInfo, FileStatus, JournalRecord, MetaStoreOps};
use crate::core::connection::RespConnection;
use crate::core::resp::RespValue;
use crate::error::{HaError, HaResult, StoreError};

const FILES_SET: &str = "files";
const REPAIR_SET: &str = "repair";
const PENDING_CLOUD_SET: &str = "pending_cloud";
const JOURNALS_SET: &str = "journals";
const TASK_CHECK_CURSOR: &str = "task_check:cursor";

/// Redis caps a keyspace at 2^32 keys
const MAX_KEYS: u64 = 1 << 32;

fn record_key(key: &str) -> String {
    format!("file:{key}")
}

fn uuid_key(uuid: &Uuid) -> String {
    format!("uuid:{uuid}")
}

fn lock_key(key: &str) -> String {
    format!("lock:{key}")
}

fn journal_key(key: &str) -> String {
    format!("journal:{key}")
}

fn journal_field(chunk: &Chunk, container_id: i32) -> String {
    format!("{}:{}", chunk.chunk_id, container_id)
}

fn unexpected(command: &str, reply: &RespValue) -> HaError {
    HaError::protocol(format!("Unexpected {command} reply: {reply:?}"))
}

async fn run(conn: &mut RespConnection, args: &[&str]) -> HaResult<RespValue> {
    let args: Vec<&[u8]> = args.iter().map(|a| a.as_bytes()).collect();
    conn.query(&args).await
}

async fn integer(conn: &mut RespConnection, args: &[&str]) -> HaResult<i64> {
    let reply = run(conn, args).await?;
    reply
        .as_integer()
        .ok_or_else(|| unexpected(args[0], &reply))
}

async fn ok(conn: &mut RespConnection, args: &[&str]) -> HaResult<()> {
    let reply = run(conn, args).await?;
    if reply.is_ok() {
        Ok(())
    } else {
        Err(unexpected(args[0], &reply))
    }
}

async fn string(conn: &mut RespConnection, args: &[&str]) -> HaResult<Option<String>> {
    match run(conn, args).await? {
        reply if reply.is_null() => Ok(None),
        reply => reply
            .as_str()
            .map(|s| Some(s.to_string()))
            .ok_or_else(|| unexpected(args[0], &reply)),
    }
}

async fn strings(conn: &mut RespConnection, args: &[&str]) -> HaResult<Vec<String>> {
    let reply = run(conn, args).await?;
    let command = args[0];
    match reply {
        RespValue::Array(None) => Ok(Vec::new()),
        RespValue::Array(Some(items)) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| unexpected(command, item))
            })
            .collect(),
        other => Err(unexpected(command, &other)),
    }
}

/// Run `commands` between `MULTI` and `EXEC` and return their replies.
///
/// `None` means a key under `WATCH` changed and nothing was applied.
async fn transaction(
    conn: &mut RespConnection,
    commands: &[Vec<String>],
) -> HaResult<Option<Vec<RespValue>>> {
    ok(conn, &["MULTI"]).await?;
    for command in commands {
        let args: Vec<&[u8]> = command.iter().map(|a| a.as_bytes()).collect();
        match conn.command(&args).await? {
            RespValue::SimpleString(s) if s == "QUEUED" => {}
            RespValue::Error(message) => {
                if !conn.command(&[b"DISCARD"]).await?.is_ok() {
                    conn.mark_broken();
                }
                return Err(HaError::from_reply(conn.endpoint(), &message));
            }
            other => {
                // the server may still be queueing
                conn.mark_broken();
                let name = command.first().map_or("MULTI", String::as_str);
                return Err(unexpected(name, &other));
            }
        }
    }

    match conn.command(&[b"EXEC"]).await? {
        RespValue::Array(None) => Ok(None),
        RespValue::Array(Some(replies)) => {
            if let Some(message) = replies.iter().find_map(|r| match r {
                RespValue::Error(message) => Some(message),
                _ => None,
            }) {
                return Err(HaError::from_reply(conn.endpoint(), message));
            }
            Ok(Some(replies))
        }
        RespValue::Error(message) => Err(HaError::from_reply(conn.endpoint(), &message)),
        other => Err(unexpected("EXEC", &other)),
    }
}

/// [`transaction`] without `WATCH`, which can only be aborted by an error
async fn atomic(conn: &mut RespConnection, commands: &[Vec<String>]) -> HaResult<Vec<RespValue>> {
    transaction(conn, commands)
        .await?
        .ok_or_else(|| HaError::protocol("EXEC aborted without WATCH"))
}

fn cmd(args: &[&str]) -> Vec<String> {
    args.iter().map(|a| a.to_string()).collect()
}

/// Set members in a stable order
async fn sorted_members(conn: &mut RespConnection, set: &str) -> HaResult<Vec<String>> {
    let mut members = strings(conn, &["SMEMBERS", set]).await?;
    members.sort();
    Ok(members)
}

/// Default metadata store logic on a Redis primary/replica deployment
#[derive(Debug, Clone, Default)]
pub struct RedisMetaOps;

impl RedisMetaOps {
    pub fn new() -> Self {
        Self
    }

    async fn load(&self, conn: &mut RespConnection, key: &str) -> HaResult<Option<File>> {
        match string(conn, &["GET", &record_key(key)]).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    async fn load_existing(&self, conn: &mut RespConnection, key: &str) -> HaResult<File> {
        self.load(conn, key)
            .await?
            .ok_or_else(|| StoreError::not_found(record_key(key)).into())
    }

    async fn store(&self, conn: &mut RespConnection, file: &File) -> HaResult<()> {
        let command = self.store_command(file)?;
        let args: Vec<&str> = command.iter().map(String::as_str).collect();
        ok(conn, &args).await
    }

    /// `SET` of `file`'s record, for use inside a transaction
    fn store_command(&self, file: &File) -> HaResult<Vec<String>> {
        let json = serde_json::to_string(file).map_err(StoreError::from)?;
        Ok(vec!["SET".to_string(), record_key(&file.key()), json])
    }

    async fn load_members(
        &self,
        conn: &mut RespConnection,
        set: &str,
        limit: usize,
    ) -> HaResult<Vec<File>> {
        let mut files = Vec::new();
        for key in sorted_members(conn, set).await? {
            if files.len() >= limit {
                break;
            }
            // members may outlive their record after a concurrent delete
            if let Some(file) = self.load(conn, &key).await? {
                files.push(file);
            }
        }
        Ok(files)
    }

    async fn matching_files(
        &self,
        conn: &mut RespConnection,
        namespace_id: Option<u8>,
        prefix: &str,
    ) -> HaResult<Vec<(u8, String)>> {
        Ok(sorted_members(conn, FILES_SET)
            .await?
            .iter()
            .filter_map(|key| split_file_key(key))
            .filter(|(ns, name)| {
                namespace_id.map_or(true, |wanted| wanted == *ns) && name.starts_with(prefix)
            })
            .map(|(ns, name)| (ns, name.to_string()))
            .collect())
    }
}

/// Folder paths below `prefix` in `name`, each ending in `/`
fn folders_of(name: &str, prefix: &str, skip_subfolders: bool) -> Vec<String> {
    let Some(rest) = name.strip_prefix(prefix) else {
        return Vec::new();
    };
    let mut folders = Vec::new();
    let mut end = prefix.len();
    for segment in rest.split_inclusive('/') {
        if !segment.ends_with('/') {
            break;
        }
        end += segment.len();
        folders.push(name[..end].to_string());
        if skip_subfolders {
            break;
        }
    }
    folders
}

#[async_trait]
impl MetaStoreOps for RedisMetaOps {
    async fn get_meta(
        &self,
        conn: &mut RespConnection,
        namespace_id: u8,
        name: &str,
        version: Option<i32>,
    ) -> HaResult<File> {
        let key = super::file_key(namespace_id, name);
        let file = self.load_existing(conn, &key).await?;
        match version {
            Some(wanted) if wanted != file.version => {
                Err(StoreError::not_found(format!("{}@v{}", record_key(&key), wanted)).into())
            }
            _ => Ok(file),
        }
    }

    async fn get_file_name(&self, conn: &mut RespConnection, uuid: Uuid) -> HaResult<File> {
        let ukey = uuid_key(&uuid);
        let key = string(conn, &["GET", &ukey])
            .await?
            .ok_or_else(|| HaError::from(StoreError::not_found(ukey)))?;
        self.load_existing(conn, &key).await
    }

    async fn get_file_list(
        &self,
        conn: &mut RespConnection,
        namespace_id: Option<u8>,
        prefix: &str,
    ) -> HaResult<Vec<FileInfo>> {
        let mut list = Vec::new();
        for (ns, name) in self.matching_files(conn, namespace_id, prefix).await? {
            if let Some(file) = self.load(conn, &super::file_key(ns, &name)).await? {
                list.push(FileInfo::from(&file));
            }
        }
        Ok(list)
    }

    async fn get_folder_list(
        &self,
        conn: &mut RespConnection,
        namespace_id: Option<u8>,
        prefix: &str,
        skip_subfolders: bool,
    ) -> HaResult<Vec<String>> {
        let folders: BTreeSet<String> = self
            .matching_files(conn, namespace_id, prefix)
            .await?
            .iter()
            .flat_map(|(_, name)| folders_of(name, prefix, skip_subfolders))
            .collect();
        Ok(folders.into_iter().collect())
    }

    fn max_num_keys_supported(&self) -> u64 {
        MAX_KEYS
    }

    async fn get_num_files(&self, conn: &mut RespConnection) -> HaResult<u64> {
        Ok(integer(conn, &["SCARD", FILES_SET]).await?.max(0) as u64)
    }

    async fn get_num_files_to_repair(&self, conn: &mut RespConnection) -> HaResult<u64> {
        Ok(integer(conn, &["SCARD", REPAIR_SET]).await?.max(0) as u64)
    }

    async fn get_files_to_repair(
        &self,
        conn: &mut RespConnection,
        limit: usize,
    ) -> HaResult<Vec<File>> {
        self.load_members(conn, REPAIR_SET, limit).await
    }

    async fn get_files_pending_write_to_cloud(
        &self,
        conn: &mut RespConnection,
        limit: usize,
    ) -> HaResult<Vec<File>> {
        self.load_members(conn, PENDING_CLOUD_SET, limit).await
    }

    async fn get_file_journal(
        &self,
        conn: &mut RespConnection,
        file: &FileInfo,
    ) -> HaResult<Vec<JournalRecord>> {
        let entries = strings(conn, &["HGETALL", &journal_key(&file.key())]).await?;
        let mut records = entries
            .chunks_exact(2)
            .map(|pair| serde_json::from_str::<JournalRecord>(&pair[1]))
            .collect::<Result<Vec<_>, _>>()
            .map_err(StoreError::from)?;
        records.sort_by_key(|r| (r.chunk.chunk_id, r.container_id));
        Ok(records)
    }

    async fn get_files_with_journal(&self, conn: &mut RespConnection) -> HaResult<Vec<FileInfo>> {
        let mut list = Vec::new();
        for key in sorted_members(conn, JOURNALS_SET).await? {
            match self.load(conn, &key).await? {
                Some(file) => list.push(FileInfo::from(&file)),
                // journal of a file whose first write never committed
                None => {
                    if let Some((namespace_id, name)) = split_file_key(&key) {
                        list.push(FileInfo {
                            namespace_id,
                            name: name.to_string(),
                            ..Default::default()
                        });
                    }
                }
            }
        }
        Ok(list)
    }

    async fn file_has_journal(&self, conn: &mut RespConnection, file: &File) -> HaResult<bool> {
        Ok(integer(conn, &["HLEN", &journal_key(&file.key())]).await? > 0)
    }

    async fn put_meta(&self, conn: &mut RespConnection, file: &File) -> HaResult<()> {
        let key = file.key();
        atomic(conn, &[
            self.store_command(file)?,
            cmd(&["SET", &uuid_key(&file.uuid), &key]),
            cmd(&["SADD", FILES_SET, &key]),
        ])
        .await?;
        Ok(())
    }

    async fn delete_meta(&self, conn: &mut RespConnection, file: &File) -> HaResult<()> {
        let key = file.key();
        let stored = self.load_existing(conn, &key).await?;
        let mut commands = vec![cmd(&["DEL", &record_key(&key), &uuid_key(&stored.uuid)])];
        for set in [FILES_SET, REPAIR_SET, PENDING_CLOUD_SET, JOURNALS_SET] {
            commands.push(cmd(&["SREM", set, &key]));
        }
        commands.push(cmd(&["DEL", &journal_key(&key)]));
        atomic(conn, &commands).await?;
        Ok(())
    }

    async fn rename_meta(
        &self,
        conn: &mut RespConnection,
        src: &File,
        dst: &File,
    ) -> HaResult<()> {
        let src_key = src.key();
        let dst_key = dst.key();
        let Some(mut record) = self.load(conn, &src_key).await? else {
            // a repeated rename whose first attempt already committed
            if let Some(moved) = self.load(conn, &dst_key).await? {
                if moved.uuid == src.uuid {
                    return Ok(());
                }
            }
            return Err(StoreError::not_found(record_key(&src_key)).into());
        };
        if integer(conn, &["EXISTS", &record_key(&dst_key)]).await? > 0 {
            return Err(StoreError::already_exists(record_key(&dst_key)).into());
        }

        record.namespace_id = dst.namespace_id;
        record.name = dst.name.clone();
        let mut commands = vec![
            self.store_command(&record)?,
            cmd(&["SET", &uuid_key(&record.uuid), &dst_key]),
            cmd(&["DEL", &record_key(&src_key)]),
        ];
        for set in [FILES_SET, REPAIR_SET, PENDING_CLOUD_SET] {
            if integer(conn, &["SISMEMBER", set, &src_key]).await? > 0 {
                commands.push(cmd(&["SREM", set, &src_key]));
                commands.push(cmd(&["SADD", set, &dst_key]));
            }
        }
        atomic(conn, &commands).await?;
        Ok(())
    }

    async fn update_timestamps(&self, conn: &mut RespConnection, file: &File) -> HaResult<()> {
        let mut record = self.load_existing(conn, &file.key()).await?;
        record.ctime = file.ctime;
        record.atime = file.atime;
        record.mtime = file.mtime;
        self.store(conn, &record).await
    }

    async fn update_chunks(
        &self,
        conn: &mut RespConnection,
        file: &File,
        version: i32,
    ) -> HaResult<usize> {
        let key = file.key();
        let mut record = self.load_existing(conn, &key).await?;
        if record.version != version {
            return Err(StoreError::VersionConflict {
                key: record_key(&key),
                expected: version,
                found: record.version,
            }
            .into());
        }

        record.chunks = file
            .chunks
            .iter()
            .filter(|c| c.file_version == version)
            .cloned()
            .collect();
        record.container_ids = file.container_ids.clone();
        let stored = record.chunks.len();
        self.store(conn, &record).await?;
        Ok(stored)
    }

    async fn mark_file_as_needs_repair(
        &self,
        conn: &mut RespConnection,
        file: &File,
    ) -> HaResult<()> {
        integer(conn, &["SADD", REPAIR_SET, &file.key()]).await?;
        Ok(())
    }

    async fn mark_file_as_repaired(&self, conn: &mut RespConnection, file: &File) -> HaResult<()> {
        integer(conn, &["SREM", REPAIR_SET, &file.key()]).await?;
        Ok(())
    }

    async fn mark_file_as_pending_write_to_cloud(
        &self,
        conn: &mut RespConnection,
        file: &File,
    ) -> HaResult<()> {
        integer(conn, &["SADD", PENDING_CLOUD_SET, &file.key()]).await?;
        Ok(())
    }

    async fn mark_file_as_written_to_cloud(
        &self,
        conn: &mut RespConnection,
        file: &File,
        remove_pending: bool,
    ) -> HaResult<()> {
        let key = file.key();
        let mut commands = Vec::new();
        if remove_pending {
            commands.push(cmd(&["SREM", PENDING_CLOUD_SET, &key]));
        }
        if let Some(mut record) = self.load(conn, &key).await? {
            record.status = FileStatus::InCloud;
            commands.push(self.store_command(&record)?);
        }
        if !commands.is_empty() {
            atomic(conn, &commands).await?;
        }
        Ok(())
    }

    async fn update_file_status(&self, conn: &mut RespConnection, file: &File) -> HaResult<()> {
        let mut record = self.load_existing(conn, &file.key()).await?;
        record.status = file.status;
        self.store(conn, &record).await
    }

    async fn lock_file(&self, conn: &mut RespConnection, file: &File, token: &str) -> HaResult<()> {
        let key = lock_key(&file.key());
        match run(conn, &["SET", &key, token, "NX"]).await? {
            reply if reply.is_ok() => Ok(()),
            reply if reply.is_null() => {
                // held under our own token when an earlier attempt's reply was lost
                if string(conn, &["GET", &key]).await?.as_deref() == Some(token) {
                    Ok(())
                } else {
                    Err(StoreError::lock_held(key).into())
                }
            }
            other => Err(unexpected("SET", &other)),
        }
    }

    async fn unlock_file(
        &self,
        conn: &mut RespConnection,
        file: &File,
        token: Option<&str>,
    ) -> HaResult<()> {
        let key = lock_key(&file.key());
        let Some(token) = token else {
            // nothing held here, so only an absent lock counts as unlocked
            return match integer(conn, &["EXISTS", &key]).await? {
                0 => Ok(()),
                _ => Err(StoreError::lock_held(key).into()),
            };
        };

        ok(conn, &["WATCH", &key]).await?;
        match string(conn, &["GET", &key]).await? {
            None => {
                ok(conn, &["UNWATCH"]).await?;
                Ok(())
            }
            Some(holder) if holder != token => {
                ok(conn, &["UNWATCH"]).await?;
                Err(StoreError::lock_held(key).into())
            }
            Some(_) => match transaction(conn, &[cmd(&["DEL", &key])]).await? {
                Some(_) => Ok(()),
                None => Err(StoreError::lock_held(key).into()),
            },
        }
    }

    async fn add_chunk_to_journal(
        &self,
        conn: &mut RespConnection,
        file: &File,
        chunk: &Chunk,
        container_id: i32,
        is_write: bool,
    ) -> HaResult<()> {
        let key = file.key();
        let record = JournalRecord {
            chunk: chunk.clone(),
            container_id,
            is_write,
            is_pre_op: true,
        };
        let json = serde_json::to_string(&record).map_err(StoreError::from)?;
        atomic(conn, &[
            cmd(&["HSET", &journal_key(&key), &journal_field(chunk, container_id), &json]),
            cmd(&["SADD", JOURNALS_SET, &key]),
        ])
        .await?;
        Ok(())
    }

    async fn update_chunk_in_journal(
        &self,
        conn: &mut RespConnection,
        file: &File,
        chunk: &Chunk,
        is_write: bool,
        delete_record: bool,
        container_id: i32,
    ) -> HaResult<()> {
        let key = file.key();
        let journal = journal_key(&key);
        let field = journal_field(chunk, container_id);

        if delete_record {
            integer(conn, &["HDEL", &journal, &field]).await?;
            if integer(conn, &["HLEN", &journal]).await? == 0 {
                integer(conn, &["SREM", JOURNALS_SET, &key]).await?;
            }
            return Ok(());
        }

        let record = JournalRecord {
            chunk: chunk.clone(),
            container_id,
            is_write,
            is_pre_op: false,
        };
        let json = serde_json::to_string(&record).map_err(StoreError::from)?;
        atomic(conn, &[
            cmd(&["HSET", &journal, &field, &json]),
            cmd(&["SADD", JOURNALS_SET, &key]),
        ])
        .await?;
        Ok(())
    }

    async fn get_next_file_for_task_check(
        &self,
        conn: &mut RespConnection,
    ) -> HaResult<Option<File>> {
        let members = sorted_members(conn, FILES_SET).await?;
        if members.is_empty() {
            return Ok(None);
        }

        let cursor = string(conn, &["GET", TASK_CHECK_CURSOR]).await?;
        let next = cursor
            .and_then(|c| members.iter().find(|m| m.as_str() > c.as_str()).cloned())
            .unwrap_or_else(|| members[0].clone());
        ok(conn, &["SET", TASK_CHECK_CURSOR, &next]).await?;
        self.load(conn, &next).await
    }
}
