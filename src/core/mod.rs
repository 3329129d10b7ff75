//! Core abstractions shared by the Sentinel client, the pool and the store adapter
pub mod connection;
pub mod resp;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A `host:port` pair identifying a Sentinel or store node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new<S: Into<String>>(host: S, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            // bare IPv6 literal
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (host, port) = s
            .rsplit_once(':')
            .ok_or_else(|| format!("Invalid endpoint '{s}': must be host:port"))?;
        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() {
            return Err(format!("Invalid endpoint '{s}': empty host"));
        }
        let port: u16 = port
            .parse()
            .map_err(|_| format!("Invalid endpoint '{s}': bad port '{port}'"))?;
        if port == 0 {
            return Err(format!("Invalid endpoint '{s}': port must be non-zero"));
        }
        Ok(Endpoint::new(host, port))
    }
}

/// Role reported for a node by the Sentinel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeRole {
    Primary,
    Replica,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Primary => write!(f, "primary"),
            NodeRole::Replica => write!(f, "replica"),
        }
    }
}

/// Snapshot of one store node as reported by a Sentinel.
///
/// Values are replaced wholesale on every successful query and never
/// mutated in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub addr: Endpoint,
    pub alive: bool,
    pub role: NodeRole,
}

impl NodeInfo {
    pub fn new(addr: Endpoint, alive: bool, role: NodeRole) -> Self {
        Self { addr, alive, role }
    }

    pub fn is_primary(&self) -> bool {
        self.role == NodeRole::Primary
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} ({})",
            self.role,
            self.addr,
            if self.alive { "online" } else { "offline" }
        )
    }
}

/// Current primary and replica set for the monitored master.
///
/// Owned by the Sentinel client; everyone else only ever gets clones.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopologySnapshot {
    pub primary: Option<NodeInfo>,
    pub replicas: Vec<NodeInfo>,
}

impl TopologySnapshot {
    /// Whether `next` names a different primary address than `self`.
    ///
    /// A query that yields no primary is not a switch.
    pub fn primary_changed(&self, next: &NodeInfo) -> bool {
        match &self.primary {
            Some(current) => current.addr != next.addr,
            None => true,
        }
    }

    /// Whether `next` differs from the current replica list in size, or in
    /// the address or liveness of any element (in order).
    pub fn replicas_changed(&self, next: &[NodeInfo]) -> bool {
        self.replicas.len() != next.len()
            || self
                .replicas
                .iter()
                .zip(next)
                .any(|(a, b)| a.addr != b.addr || a.alive != b.alive)
    }
}
