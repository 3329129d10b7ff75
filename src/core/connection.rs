//! RESP connections to Sentinel and store nodes
//!
//! A [`RespConnection`] is a single authenticated TCP channel. Any transport
//! failure, protocol violation or timeout leaves the stream in an unknown
//! state, so the connection marks itself broken and refuses further use.
use bytes::BytesMut;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use super::resp::{RespEncoder, RespParser, RespValue};
use super::Endpoint;
use crate::error::{HaError, HaResult};

/// Credentials sent with `AUTH` right after connecting
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// ACL user name (Redis 6+); `None` uses the legacy single-password form
    pub user: Option<String>,
    pub password: String,
}

impl Credentials {
    pub fn password<S: Into<String>>(password: S) -> Self {
        Self {
            user: None,
            password: password.into(),
        }
    }
}

/// Options applied to every new connection
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub connect_timeout: Duration,
    pub command_timeout: Duration,
    pub credentials: Option<Credentials>,
    /// TCP keep-alive idle time; `None` leaves keep-alive off
    pub keep_alive: Option<Duration>,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_millis(3000),
            command_timeout: Duration::from_millis(5000),
            credentials: None,
            keep_alive: None,
        }
    }
}

/// An opened, authenticated RESP channel to one node
#[derive(Debug)]
pub struct RespConnection {
    endpoint: Endpoint,
    stream: TcpStream,
    read_buf: BytesMut,
    write_buf: BytesMut,
    parser: RespParser,
    command_timeout: Duration,
    broken: Arc<AtomicBool>,
}

impl RespConnection {
    /// Dial `endpoint`, configure the socket and authenticate
    pub async fn connect(endpoint: &Endpoint, options: &ConnectOptions) -> HaResult<Self> {
        debug!(endpoint = %endpoint, "Connecting");

        let target = (endpoint.host.as_str(), endpoint.port);
        let stream = match timeout(options.connect_timeout, TcpStream::connect(target)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!(endpoint = %endpoint, error = %e, "Connect failed");
                return Err(HaError::Network(e));
            }
            Err(_) => return Err(HaError::timeout(format!("connect to {endpoint}"))),
        };

        Self::configure_stream(&stream, options.keep_alive)?;

        let mut conn = Self {
            endpoint: endpoint.clone(),
            stream,
            read_buf: BytesMut::with_capacity(4096),
            write_buf: BytesMut::with_capacity(1024),
            parser: RespParser::new(),
            command_timeout: options.command_timeout,
            broken: Arc::new(AtomicBool::new(false)),
        };

        if let Some(credentials) = &options.credentials {
            conn.authenticate(credentials).await?;
        }

        debug!(endpoint = %endpoint, "Connected");
        Ok(conn)
    }

    fn configure_stream(stream: &TcpStream, keep_alive: Option<Duration>) -> io::Result<()> {
        stream.set_nodelay(true)?;
        if let Some(idle) = keep_alive {
            let keepalive = socket2::TcpKeepalive::new().with_time(idle);
            socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
        }
        Ok(())
    }

    async fn authenticate(&mut self, credentials: &Credentials) -> HaResult<()> {
        let reply = match &credentials.user {
            Some(user) => {
                self.command(&[b"AUTH", user.as_bytes(), credentials.password.as_bytes()])
                    .await?
            }
            None => self.command(&[b"AUTH", credentials.password.as_bytes()]).await?,
        };

        match reply {
            RespValue::SimpleString(_) => Ok(()),
            RespValue::Error(message) => {
                warn!(endpoint = %self.endpoint, "Authentication rejected: {}", message);
                Err(HaError::Auth {
                    endpoint: self.endpoint.to_string(),
                    message,
                })
            }
            other => Err(HaError::protocol(format!(
                "Unexpected AUTH reply from {}: {:?}",
                self.endpoint, other
            ))),
        }
    }

    /// Send one command and return the raw reply.
    ///
    /// Error replies come back as `Ok(RespValue::Error)`; only transport and
    /// framing problems are `Err`, and those mark the connection broken.
    pub async fn command(&mut self, args: &[&[u8]]) -> HaResult<RespValue> {
        if self.is_broken() {
            return Err(HaError::Network(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("connection to {} is broken", self.endpoint),
            )));
        }

        let name = args
            .first()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .unwrap_or_default();

        // the reply is only consumed if this call runs to completion
        let pending = InFlight::arm(&self.broken);
        let result = timeout(self.command_timeout, self.round_trip(args)).await;
        pending.disarm();

        match result {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.mark_broken();
                Err(e)
            }
            Err(_) => {
                self.mark_broken();
                Err(HaError::timeout(format!("{name} on {}", self.endpoint)))
            }
        }
    }

    /// Like [`command`](Self::command) but turns error replies into [`HaError`]
    pub async fn query(&mut self, args: &[&[u8]]) -> HaResult<RespValue> {
        match self.command(args).await? {
            RespValue::Error(message) => Err(HaError::from_reply(&self.endpoint, &message)),
            value => Ok(value),
        }
    }

    /// Liveness probe: `PING` must be answered with `+PONG`
    pub async fn ping(&mut self) -> HaResult<()> {
        match self.command(&[b"PING"]).await? {
            RespValue::SimpleString(s) if s == "PONG" => Ok(()),
            other => Err(HaError::protocol(format!(
                "Unexpected PING reply from {}: {:?}",
                self.endpoint, other
            ))),
        }
    }

    async fn round_trip(&mut self, args: &[&[u8]]) -> HaResult<RespValue> {
        self.write_buf.clear();
        RespEncoder::encode_command(&mut self.write_buf, args);
        self.stream.write_all(&self.write_buf).await?;

        loop {
            if let Some(value) = self
                .parser
                .decode(&mut self.read_buf)
                .map_err(|e| HaError::protocol(format!("{} from {}", e, self.endpoint)))?
            {
                return Ok(value);
            }

            let n = self.stream.read_buf(&mut self.read_buf).await?;
            if n == 0 {
                return Err(HaError::Network(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("connection closed by {}", self.endpoint),
                )));
            }
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    /// Mark the stream unusable so no further command is sent on it
    pub fn mark_broken(&self) {
        if !self.broken.swap(true, Ordering::AcqRel) {
            debug!(endpoint = %self.endpoint, "Connection marked broken");
        }
    }

    /// Shared flag that flips when this connection breaks; readable without
    /// locking the connection itself
    pub fn broken_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.broken)
    }
}

/// Breaks the connection when a round trip is dropped before its reply is
/// read, which would otherwise be handed to the next command
struct InFlight {
    broken: Arc<AtomicBool>,
    armed: bool,
}

impl InFlight {
    fn arm(broken: &Arc<AtomicBool>) -> Self {
        Self {
            broken: Arc::clone(broken),
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if self.armed && !self.broken.swap(true, Ordering::AcqRel) {
            debug!("Command cancelled before its reply was read, connection marked broken");
        }
    }
}
