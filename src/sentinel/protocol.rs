//! Sentinel request/reply handling
//!
//! `SENTINEL MASTER <name>` answers with a flat array of field/value pairs,
//! `SENTINEL REPLICAS <name>` with an array of such arrays. Only `ip`, `port`
//! and `flags` are consumed.
use futures::future::BoxFuture;
use std::collections::HashMap;

use crate::core::connection::RespConnection;
use crate::core::resp::RespValue;
use crate::core::{Endpoint, NodeInfo, NodeRole};
use crate::error::{HaError, HaResult};

const FLAG_SUBJECTIVELY_DOWN: &str = "s_down";
const FLAG_OBJECTIVELY_DOWN: &str = "o_down";
const FLAG_MASTER: &str = "master";

/// Whether a node with these flags is alive: neither subjectively nor
/// objectively down
pub fn flags_alive(flags: &str) -> bool {
    !flags
        .split(',')
        .map(str::trim)
        .any(|f| f == FLAG_SUBJECTIVELY_DOWN || f == FLAG_OBJECTIVELY_DOWN)
}

pub fn flags_role(flags: &str) -> NodeRole {
    if flags.split(',').map(str::trim).any(|f| f == FLAG_MASTER) {
        NodeRole::Primary
    } else {
        NodeRole::Replica
    }
}

/// Sentinels older than 5.0 only know `SLAVES`
pub fn is_unknown_subcommand(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("unknown") && lower.contains("subcommand")
}

fn field_map(entry: RespValue) -> Result<HashMap<String, String>, String> {
    let items = entry
        .into_array()
        .ok_or_else(|| "expected a field/value array".to_string())?;
    if items.len() % 2 != 0 {
        return Err(format!("odd number of elements ({}) in field/value array", items.len()));
    }

    let mut fields = HashMap::with_capacity(items.len() / 2);
    let mut iter = items.into_iter();
    while let (Some(key), Some(value)) = (iter.next(), iter.next()) {
        if let (Some(key), Some(value)) = (key.as_str(), value.as_str()) {
            fields.insert(key.to_string(), value.to_string());
        }
    }
    Ok(fields)
}

fn node_from_fields(fields: &HashMap<String, String>) -> Result<NodeInfo, String> {
    let ip = fields
        .get("ip")
        .filter(|ip| !ip.is_empty())
        .ok_or_else(|| "missing 'ip' field".to_string())?;
    let port = fields
        .get("port")
        .ok_or_else(|| "missing 'port' field".to_string())?;
    let port: u16 = port
        .parse()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| format!("invalid port '{port}'"))?;
    let flags = fields.get("flags").map(String::as_str).unwrap_or_default();

    Ok(NodeInfo::new(
        Endpoint::new(ip.as_str(), port),
        flags_alive(flags),
        flags_role(flags),
    ))
}

/// Parse a `SENTINEL MASTER` reply
pub fn parse_master_reply(reply: RespValue) -> Result<NodeInfo, String> {
    match reply {
        RespValue::Error(message) => Err(message),
        RespValue::Array(Some(_)) => {
            let fields = field_map(reply)?;
            let mut node = node_from_fields(&fields)?;
            // the monitored master is the primary regardless of extra flags
            node.role = NodeRole::Primary;
            Ok(node)
        }
        other => Err(format!("unexpected reply {other:?}")),
    }
}

/// Parse a `SENTINEL REPLICAS` reply, keeping Sentinel's order
pub fn parse_replicas_reply(reply: RespValue) -> Result<Vec<NodeInfo>, String> {
    match reply {
        RespValue::Error(message) => Err(message),
        RespValue::Array(None) => Ok(Vec::new()),
        RespValue::Array(Some(entries)) => entries
            .into_iter()
            .map(|entry| {
                let fields = field_map(entry)?;
                let mut node = node_from_fields(&fields)?;
                node.role = NodeRole::Replica;
                Ok(node)
            })
            .collect(),
        other => Err(format!("unexpected reply {other:?}")),
    }
}

/// Ask one Sentinel for the current primary of `master_name`
pub fn fetch_primary<'a>(
    conn: &'a mut RespConnection,
    master_name: &'a str,
) -> BoxFuture<'a, HaResult<NodeInfo>> {
    Box::pin(async move {
        let reply = conn
            .command(&[b"SENTINEL", b"MASTER", master_name.as_bytes()])
            .await?;
        parse_master_reply(reply).map_err(|m| HaError::query_failed(conn.endpoint(), m))
    })
}

/// Ask one Sentinel for the replica list of `master_name`
pub fn fetch_replicas<'a>(
    conn: &'a mut RespConnection,
    master_name: &'a str,
) -> BoxFuture<'a, HaResult<Vec<NodeInfo>>> {
    Box::pin(async move {
        let mut reply = conn
            .command(&[b"SENTINEL", b"REPLICAS", master_name.as_bytes()])
            .await?;
        if matches!(&reply, RespValue::Error(m) if is_unknown_subcommand(m)) {
            reply = conn
                .command(&[b"SENTINEL", b"SLAVES", master_name.as_bytes()])
                .await?;
        }
        parse_replicas_reply(reply).map_err(|m| HaError::query_failed(conn.endpoint(), m))
    })
}
