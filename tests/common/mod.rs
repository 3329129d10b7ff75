//! In-process RESP servers standing in for Redis Sentinel and the store nodes
#![allow(dead_code)]

use bytes::{Bytes, BytesMut};
use meta_sentinel::core::connection::ConnectOptions;
use meta_sentinel::core::resp::{RespEncoder, RespParser, RespValue};
use meta_sentinel::{Endpoint, PoolOptions, SentinelOptions};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

pub const MASTER: &str = "mymaster";

pub fn bulk<S: AsRef<[u8]>>(s: S) -> RespValue {
    RespValue::BulkString(Some(Bytes::copy_from_slice(s.as_ref())))
}

pub fn simple(s: &str) -> RespValue {
    RespValue::SimpleString(s.to_string())
}

pub fn error<S: Into<String>>(s: S) -> RespValue {
    RespValue::Error(s.into())
}

fn int(n: usize) -> RespValue {
    RespValue::Integer(n as i64)
}

/// Handlers return `None` to apply a command without answering it: the
/// connection is dropped instead, as if the reply got lost on the way back
async fn serve<F>(listener: TcpListener, shutdown: CancellationToken, handler: Arc<F>)
where
    F: Fn(Vec<String>) -> Option<RespValue> + Send + Sync + 'static,
{
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => {
                let Ok((stream, _)) = accepted else { break };
                tokio::spawn(serve_connection(stream, shutdown.clone(), Arc::clone(&handler)));
            }
        }
    }
}

/// Run a queued `MULTI` batch; `None` if any command asked to hang up
fn exec_batch<F>(handler: &F, batch: Vec<Vec<String>>) -> Option<RespValue>
where
    F: Fn(Vec<String>) -> Option<RespValue>,
{
    let mut replies = Vec::new();
    let mut hang_up = false;
    for args in batch {
        match handler(args) {
            Some(reply) => replies.push(reply),
            None => hang_up = true,
        }
    }
    (!hang_up).then(|| RespValue::Array(Some(replies)))
}

async fn serve_connection<F>(mut stream: TcpStream, shutdown: CancellationToken, handler: Arc<F>)
where
    F: Fn(Vec<String>) -> Option<RespValue> + Send + Sync + 'static,
{
    let mut buf = BytesMut::new();
    let mut queued: Option<Vec<Vec<String>>> = None;
    loop {
        while let Ok(Some(request)) = RespParser::parse(&mut buf) {
            let args: Vec<String> = request
                .into_array()
                .unwrap_or_default()
                .iter()
                .filter_map(|a| a.as_str().map(str::to_string))
                .collect();
            let name = args.first().map(|a| a.to_ascii_uppercase()).unwrap_or_default();
            // WATCH is accepted but not enforced; tests run one client at a time
            let reply = match (name.as_str(), queued.is_some()) {
                ("WATCH" | "UNWATCH", _) => Some(simple("OK")),
                ("MULTI", false) => {
                    queued = Some(Vec::new());
                    Some(simple("OK"))
                }
                ("MULTI", true) => Some(error("ERR MULTI calls can not be nested")),
                ("EXEC" | "DISCARD", false) => Some(error(format!("ERR {name} without MULTI"))),
                ("EXEC", true) => exec_batch(&*handler, queued.take().unwrap_or_default()),
                ("DISCARD", true) => {
                    queued = None;
                    Some(simple("OK"))
                }
                (_, true) => {
                    if let Some(batch) = queued.as_mut() {
                        batch.push(args);
                    }
                    Some(simple("QUEUED"))
                }
                (_, false) => (*handler)(args),
            };
            let Some(reply) = reply else {
                return;
            };
            let mut out = BytesMut::new();
            RespEncoder::encode_into(&mut out, &reply);
            if stream.write_all(&out).await.is_err() {
                return;
            }
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => return,
            read = stream.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => return,
                Ok(_) => {}
            },
        }
    }
}

async fn bind() -> (TcpListener, Endpoint) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    (listener, Endpoint::new("127.0.0.1", port))
}

/// An endpoint nothing listens on
pub async fn dead_endpoint() -> Endpoint {
    let (listener, endpoint) = bind().await;
    drop(listener);
    endpoint
}

/// Poll `check` every 10ms until it holds or `timeout` passes
pub async fn wait_until<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub fn sentinel_options(sentinels: Vec<Endpoint>) -> SentinelOptions {
    SentinelOptions {
        master_name: MASTER.to_string(),
        sentinels,
        connect: ConnectOptions {
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(500),
            credentials: None,
            keep_alive: None,
        },
        monitor_interval: Duration::from_millis(50),
        monitor_jitter: Duration::ZERO,
    }
}

pub fn pool_options() -> PoolOptions {
    PoolOptions {
        connect: ConnectOptions {
            connect_timeout: Duration::from_millis(500),
            command_timeout: Duration::from_millis(1000),
            credentials: None,
            keep_alive: None,
        },
    }
}

struct SentinelState {
    master_name: String,
    primary: Endpoint,
    primary_down: bool,
    replicas: Vec<(Endpoint, bool)>,
    ping_reply: RespValue,
    legacy: bool,
    master_queries: usize,
}

fn node_fields(endpoint: &Endpoint, flags: &str) -> RespValue {
    RespValue::Array(Some(vec![
        bulk("name"),
        bulk(endpoint.to_string()),
        bulk("ip"),
        bulk(&endpoint.host),
        bulk("port"),
        bulk(endpoint.port.to_string()),
        bulk("flags"),
        bulk(flags),
    ]))
}

impl SentinelState {
    fn handle(&mut self, args: &[String]) -> RespValue {
        let upper: Vec<String> = args.iter().map(|a| a.to_ascii_uppercase()).collect();
        match upper.iter().map(String::as_str).collect::<Vec<_>>().as_slice() {
            ["PING"] => self.ping_reply.clone(),
            ["AUTH", ..] => simple("OK"),
            ["SENTINEL", "MASTER", _] => {
                self.master_queries += 1;
                if args[2] != self.master_name {
                    return error("ERR No such master with that name");
                }
                let flags = if self.primary_down {
                    "master,s_down,o_down"
                } else {
                    "master"
                };
                node_fields(&self.primary, flags)
            }
            ["SENTINEL", "REPLICAS", _] if self.legacy => {
                error("ERR Unknown sentinel subcommand 'REPLICAS'")
            }
            ["SENTINEL", "REPLICAS" | "SLAVES", _] => {
                if args[2] != self.master_name {
                    return error("ERR No such master with that name");
                }
                RespValue::Array(Some(
                    self.replicas
                        .iter()
                        .map(|(endpoint, alive)| {
                            node_fields(endpoint, if *alive { "slave" } else { "slave,s_down" })
                        })
                        .collect(),
                ))
            }
            _ => error(format!("ERR unknown command '{}'", args.join(" "))),
        }
    }
}

/// A Sentinel monitoring `MASTER` with a mutable topology
pub struct MockSentinel {
    pub endpoint: Endpoint,
    state: Arc<Mutex<SentinelState>>,
    shutdown: CancellationToken,
}

impl MockSentinel {
    pub async fn start(primary: &Endpoint) -> Self {
        let (listener, endpoint) = bind().await;
        let state = Arc::new(Mutex::new(SentinelState {
            master_name: MASTER.to_string(),
            primary: primary.clone(),
            primary_down: false,
            replicas: Vec::new(),
            ping_reply: simple("PONG"),
            legacy: false,
            master_queries: 0,
        }));
        let shutdown = CancellationToken::new();

        let handler_state = Arc::clone(&state);
        let handler =
            Arc::new(move |args: Vec<String>| Some(handler_state.lock().unwrap().handle(&args)));
        tokio::spawn(serve(listener, shutdown.clone(), handler));

        Self {
            endpoint,
            state,
            shutdown,
        }
    }

    pub fn set_master_name(&self, name: &str) {
        self.state.lock().unwrap().master_name = name.to_string();
    }

    pub fn set_primary(&self, primary: &Endpoint) {
        self.state.lock().unwrap().primary = primary.clone();
    }

    pub fn set_primary_down(&self, down: bool) {
        self.state.lock().unwrap().primary_down = down;
    }

    pub fn set_replicas(&self, replicas: &[(&Endpoint, bool)]) {
        self.state.lock().unwrap().replicas = replicas
            .iter()
            .map(|(endpoint, alive)| ((*endpoint).clone(), *alive))
            .collect();
    }

    pub fn set_ping_reply(&self, reply: RespValue) {
        self.state.lock().unwrap().ping_reply = reply;
    }

    /// Behave like a pre-5.0 Sentinel that only knows `SLAVES`
    pub fn set_legacy(&self, legacy: bool) {
        self.state.lock().unwrap().legacy = legacy;
    }

    pub fn master_queries(&self) -> usize {
        self.state.lock().unwrap().master_queries
    }

    /// Stop listening and drop every open connection
    pub fn kill(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockSentinel {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Default)]
struct StoreData {
    strings: HashMap<String, String>,
    sets: HashMap<String, BTreeSet<String>>,
    hashes: HashMap<String, BTreeMap<String, String>>,
}

impl StoreData {
    fn remove(&mut self, key: &str) -> bool {
        self.strings.remove(key).is_some()
            | self.sets.remove(key).is_some()
            | self.hashes.remove(key).is_some()
    }

    fn contains(&self, key: &str) -> bool {
        self.strings.contains_key(key) || self.sets.contains_key(key) || self.hashes.contains_key(key)
    }

    fn execute(&mut self, command: &str, args: &[String]) -> RespValue {
        let arg = |i: usize| args.get(i).cloned().unwrap_or_default();
        let rest = |from: usize| args.get(from..).unwrap_or_default();

        match command {
            "PING" => simple("PONG"),
            "AUTH" => simple("OK"),
            "GET" => match self.strings.get(&arg(1)) {
                Some(value) => bulk(value),
                None => RespValue::BulkString(None),
            },
            "SET" => {
                let nx = rest(3).iter().any(|o| o.eq_ignore_ascii_case("NX"));
                if nx && self.strings.contains_key(&arg(1)) {
                    return RespValue::BulkString(None);
                }
                self.strings.insert(arg(1), arg(2));
                simple("OK")
            }
            "DEL" => int(rest(1).iter().filter(|k| self.remove(k)).count()),
            "EXISTS" => int(rest(1).iter().filter(|k| self.contains(k)).count()),
            "SADD" => {
                let set = self.sets.entry(arg(1)).or_default();
                int(rest(2).iter().filter(|m| set.insert((*m).clone())).count())
            }
            "SREM" => {
                let key = arg(1);
                let removed = match self.sets.get_mut(&key) {
                    Some(set) => rest(2).iter().filter(|m| set.remove(*m)).count(),
                    None => 0,
                };
                if self.sets.get(&key).is_some_and(BTreeSet::is_empty) {
                    self.sets.remove(&key);
                }
                int(removed)
            }
            "SMEMBERS" => RespValue::Array(Some(
                self.sets
                    .get(&arg(1))
                    .map(|set| set.iter().map(bulk).collect())
                    .unwrap_or_default(),
            )),
            "SCARD" => int(self.sets.get(&arg(1)).map_or(0, BTreeSet::len)),
            "SISMEMBER" => int(usize::from(
                self.sets.get(&arg(1)).is_some_and(|set| set.contains(&arg(2))),
            )),
            "HSET" => {
                let hash = self.hashes.entry(arg(1)).or_default();
                int(rest(2)
                    .chunks_exact(2)
                    .filter(|pair| hash.insert(pair[0].clone(), pair[1].clone()).is_none())
                    .count())
            }
            "HGETALL" => RespValue::Array(Some(
                self.hashes
                    .get(&arg(1))
                    .map(|hash| hash.iter().flat_map(|(f, v)| [bulk(f), bulk(v)]).collect())
                    .unwrap_or_default(),
            )),
            "HDEL" => {
                let key = arg(1);
                let removed = match self.hashes.get_mut(&key) {
                    Some(hash) => rest(2).iter().filter(|f| hash.remove(*f).is_some()).count(),
                    None => 0,
                };
                if self.hashes.get(&key).is_some_and(BTreeMap::is_empty) {
                    self.hashes.remove(&key);
                }
                int(removed)
            }
            "HLEN" => int(self.hashes.get(&arg(1)).map_or(0, BTreeMap::len)),
            other => error(format!("ERR unknown command '{other}'")),
        }
    }
}

const WRITE_COMMANDS: &[&str] = &["SET", "DEL", "SADD", "SREM", "HSET", "HDEL"];

/// A Redis node implementing the command subset the metadata store uses
pub struct MockStore {
    pub endpoint: Endpoint,
    data: Arc<Mutex<StoreData>>,
    readonly: Arc<AtomicBool>,
    commands: Arc<Mutex<HashMap<String, usize>>>,
    hang_up_after: Arc<Mutex<Option<String>>>,
    shutdown: CancellationToken,
}

impl MockStore {
    /// A writable node with an empty keyspace
    pub async fn start() -> Self {
        Self::spawn(Arc::new(Mutex::new(StoreData::default())), false).await
    }

    /// A read-only node sharing `primary`'s keyspace, as if replicating it
    pub async fn replica_of(primary: &MockStore) -> Self {
        Self::spawn(Arc::clone(&primary.data), true).await
    }

    async fn spawn(data: Arc<Mutex<StoreData>>, readonly: bool) -> Self {
        let (listener, endpoint) = bind().await;
        let readonly = Arc::new(AtomicBool::new(readonly));
        let commands = Arc::new(Mutex::new(HashMap::new()));
        let hang_up_after = Arc::new(Mutex::new(None::<String>));
        let shutdown = CancellationToken::new();

        let (h_data, h_readonly, h_commands, h_hang_up) = (
            Arc::clone(&data),
            Arc::clone(&readonly),
            Arc::clone(&commands),
            Arc::clone(&hang_up_after),
        );
        let handler = Arc::new(move |args: Vec<String>| {
            let command = args.first().map(|c| c.to_ascii_uppercase()).unwrap_or_default();
            *h_commands.lock().unwrap().entry(command.clone()).or_insert(0) += 1;
            if h_readonly.load(Ordering::SeqCst) && WRITE_COMMANDS.contains(&command.as_str()) {
                return Some(error("READONLY You can't write against a read only replica."));
            }
            let reply = h_data.lock().unwrap().execute(&command, &args);

            let mut hang_up = h_hang_up.lock().unwrap();
            if hang_up.as_deref() == Some(command.as_str()) {
                *hang_up = None;
                return None;
            }
            Some(reply)
        });
        tokio::spawn(serve(listener, shutdown.clone(), handler));

        Self {
            endpoint,
            data,
            readonly,
            commands,
            hang_up_after,
            shutdown,
        }
    }

    /// Apply the next `command` but drop the connection instead of replying
    pub fn hang_up_after(&self, command: &str) {
        *self.hang_up_after.lock().unwrap() = Some(command.to_ascii_uppercase());
    }

    pub fn set_readonly(&self, readonly: bool) {
        self.readonly.store(readonly, Ordering::SeqCst);
    }

    /// Times `command` was received, whether or not it succeeded
    pub fn command_count(&self, command: &str) -> usize {
        self.commands
            .lock()
            .unwrap()
            .get(&command.to_ascii_uppercase())
            .copied()
            .unwrap_or(0)
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().unwrap().strings.get(key).cloned()
    }

    pub fn key_count(&self) -> usize {
        let data = self.data.lock().unwrap();
        data.strings.len() + data.sets.len() + data.hashes.len()
    }

    /// Stop listening and drop every open connection
    pub fn kill(&self) {
        self.shutdown.cancel();
    }
}

impl Drop for MockStore {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
