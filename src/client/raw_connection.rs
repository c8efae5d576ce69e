//! Raw TCP connection to a node's key-value service
//!
//! One request is in flight per connection at a time. Reads poll the socket
//! with short timeouts so a wait can be abandoned on deadline, on a dead
//! socket or on cancellation; bytes of a partially received frame are kept
//! across wakeups.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::cancel::CancelToken;
use crate::config::{ClientConfig, Credentials};
use crate::protocol::{
    Frame, FrameDecoder, HelloFeature, Magic, OpaqueGenerator, Opcode, Operation, Status,
};
use crate::utils::{ConnectionError, KvError, ProtocolError};

/// Upper bound on a single blocking read
const POLL_SLICE: Duration = Duration::from_millis(50);

/// Smallest timeout handed to the socket (zero means "block forever")
const MIN_SOCKET_WAIT: Duration = Duration::from_millis(1);

const READ_CHUNK: usize = 64 * 1024;

/// Part of a connection shared with its pool, so the pool can shut the
/// socket down while the connection is checked out
#[derive(Debug)]
pub struct ConnectionHandle {
    id: u64,
    alive: AtomicBool,
    stream: TcpStream,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark dead and shut the socket; a blocked reader wakes with EOF
    pub fn force_close(&self) {
        self.alive.store(false, Ordering::Release);
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

/// A connected, authenticated socket
pub struct Connection {
    host: String,
    port: u16,
    stream: TcpStream,
    handle: Arc<ConnectionHandle>,
    decoder: FrameDecoder,
    read_buf: Vec<u8>,
    write_buf: Vec<u8>,
    socket_timeout: Duration,
    negotiated: Vec<HelloFeature>,
    opaque: Arc<OpaqueGenerator>,
    /// Pool generation this connection was created in
    pub(crate) generation: u64,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id())
            .field("endpoint", &self.endpoint())
            .field("alive", &self.is_alive())
            .field("negotiated", &self.negotiated)
            .finish()
    }
}

impl Connection {
    fn connect_tcp(
        id: u64,
        host: &str,
        port: u16,
        connect_timeout: Duration,
        socket_timeout: Duration,
        opaque: Arc<OpaqueGenerator>,
    ) -> Result<Self, ConnectionError> {
        let connect_failed = |source: io::Error| ConnectionError::ConnectFailed {
            host: host.to_string(),
            port,
            source,
        };

        let addr = (host, port)
            .to_socket_addrs()
            .map_err(connect_failed)?
            .next()
            .ok_or_else(|| connect_failed(io::Error::new(io::ErrorKind::NotFound, "No addresses found")))?;

        let stream = TcpStream::connect_timeout(&addr, connect_timeout).map_err(connect_failed)?;
        stream.set_nodelay(true).ok();
        let shared = stream.try_clone().map_err(connect_failed)?;

        Ok(Self {
            host: host.to_string(),
            port,
            stream,
            handle: Arc::new(ConnectionHandle {
                id,
                alive: AtomicBool::new(true),
                stream: shared,
            }),
            decoder: FrameDecoder::new(),
            read_buf: vec![0u8; READ_CHUNK],
            write_buf: Vec::with_capacity(1024),
            socket_timeout,
            negotiated: Vec::new(),
            opaque,
            generation: 0,
        })
    }

    pub fn id(&self) -> u64 {
        self.handle.id
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn is_alive(&self) -> bool {
        self.handle.is_alive()
    }

    pub fn mark_dead(&self) {
        self.handle.alive.store(false, Ordering::Release);
    }

    pub fn handle(&self) -> Arc<ConnectionHandle> {
        Arc::clone(&self.handle)
    }

    /// Features the server accepted in HELLO
    pub fn negotiated(&self) -> &[HelloFeature] {
        &self.negotiated
    }

    pub fn has_feature(&self, feature: HelloFeature) -> bool {
        self.negotiated.contains(&feature)
    }

    pub fn next_opaque(&self) -> u32 {
        self.opaque.next()
    }

    /// Write a request frame
    pub fn send(&mut self, frame: &Frame, deadline: Instant) -> Result<(), KvError> {
        if !self.is_alive() {
            return Err(ConnectionError::Closed.into());
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(ConnectionError::DeadlineExceeded.into());
        }

        self.write_buf.clear();
        frame.encode_into(&mut self.write_buf);

        let timeout = remaining.min(self.socket_timeout).max(MIN_SOCKET_WAIT);
        let result = self
            .stream
            .set_write_timeout(Some(timeout))
            .and_then(|_| self.stream.write_all(&self.write_buf))
            .and_then(|_| self.stream.flush());

        result.map_err(|e| {
            self.mark_dead();
            match e.kind() {
                io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => {
                    ConnectionError::SocketTimeout(timeout.as_millis() as u64).into()
                }
                _ => ConnectionError::Io(e).into(),
            }
        })
    }

    /// Wait for the response to the request with `opaque`/`opcode`
    ///
    /// Any abandoned wait leaves unread bytes on the socket, so the
    /// connection is marked dead rather than reused.
    pub fn receive(
        &mut self,
        opaque: u32,
        opcode: u8,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> Result<Frame, KvError> {
        let frame = self.read_frame(deadline, cancel)?;

        let check = match frame.header.magic {
            Magic::Response => {
                if frame.header.opaque != opaque {
                    Err(ProtocolError::OpaqueMismatch {
                        expected: opaque,
                        actual: frame.header.opaque,
                    })
                } else if frame.header.opcode != opcode {
                    Err(ProtocolError::OpcodeMismatch {
                        expected: opcode,
                        actual: frame.header.opcode,
                    })
                } else {
                    Ok(())
                }
            }
            Magic::ServerRequest => Err(ProtocolError::UnexpectedServerRequest(frame.header.opcode)),
            Magic::Request => Err(ProtocolError::InvalidMagic(Magic::Request as u8)),
        };

        match check {
            Ok(()) => Ok(frame),
            Err(e) => {
                warn!("Closing connection #{} to {}: {}", self.id(), self.endpoint(), e);
                self.mark_dead();
                Err(e.into())
            }
        }
    }

    /// Send a request and wait for its response
    pub fn execute(
        &mut self,
        frame: &Frame,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> Result<Frame, KvError> {
        self.send(frame, deadline)?;
        self.receive(frame.header.opaque, frame.header.opcode, deadline, cancel)
    }

    fn read_frame(&mut self, deadline: Instant, cancel: Option<&CancelToken>) -> Result<Frame, KvError> {
        let mut last_data = Instant::now();
        loop {
            match self.decoder.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    warn!("Malformed frame from {}: {}", self.endpoint(), e);
                    self.mark_dead();
                    return Err(e.into());
                }
            }

            if !self.is_alive() {
                return Err(ConnectionError::Closed.into());
            }
            if cancel.map(CancelToken::is_cancelled).unwrap_or(false) {
                self.mark_dead();
                return Err(ConnectionError::Cancelled.into());
            }
            let now = Instant::now();
            if now >= deadline {
                self.mark_dead();
                return Err(ConnectionError::DeadlineExceeded.into());
            }
            let idle = now.duration_since(last_data);
            if idle >= self.socket_timeout {
                debug!(
                    "Connection #{} to {} idle for {:?}, treating as dead",
                    self.id(),
                    self.endpoint(),
                    idle
                );
                self.mark_dead();
                return Err(ConnectionError::SocketTimeout(self.socket_timeout.as_millis() as u64).into());
            }

            let wait = (deadline - now)
                .min(self.socket_timeout - idle)
                .min(POLL_SLICE)
                .max(MIN_SOCKET_WAIT);
            if let Err(e) = self.stream.set_read_timeout(Some(wait)) {
                self.mark_dead();
                return Err(ConnectionError::Io(e).into());
            }

            match self.stream.read(&mut self.read_buf) {
                Ok(0) => {
                    self.mark_dead();
                    return Err(ConnectionError::Closed.into());
                }
                Ok(n) => {
                    self.decoder.feed(&self.read_buf[..n]);
                    last_data = Instant::now();
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    self.mark_dead();
                    return Err(ConnectionError::Io(e).into());
                }
            }
        }
    }

    /// Liveness check for an idle connection: the peer must not have closed
    /// it and no unsolicited bytes may be waiting
    pub fn check_health(&mut self) -> bool {
        if !self.is_alive() {
            return false;
        }
        if self.decoder.buffered() > 0 {
            self.mark_dead();
            return false;
        }

        let mut probe = [0u8; 1];
        let healthy = match self.stream.set_nonblocking(true) {
            Ok(()) => matches!(
                self.stream.peek(&mut probe),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock
            ),
            Err(_) => false,
        };
        if self.stream.set_nonblocking(false).is_err() || !healthy {
            self.mark_dead();
            return false;
        }
        true
    }

    /// Fetch the cluster map JSON; `None` when the server has no config to
    /// give (plain memcached)
    pub fn fetch_cluster_config(&mut self, deadline: Instant) -> Result<Option<Vec<u8>>, KvError> {
        let request = Operation::get_cluster_config().encode(self.next_opaque())?;
        let response = self.execute(&request, deadline, None)?;
        match response.status() {
            Status::Success => Ok(Some(response.value)),
            Status::UnknownCommand | Status::NotSupported | Status::NotMyVbucket | Status::Eaccess => {
                debug!(
                    "{} cannot serve a cluster map ({})",
                    self.endpoint(),
                    response.status()
                );
                Ok(None)
            }
            other => Err(ProtocolError::Malformed(format!("config fetch answered {}", other)).into()),
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.handle.alive.store(false, Ordering::Release);
        self.stream.shutdown(Shutdown::Both).ok();
    }
}

/// Connection factory for creating connections with common config
#[derive(Clone)]
pub struct ConnectionFactory {
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,
    pub credentials: Option<Credentials>,
    pub bucket: Option<String>,
    pub hello_features: Vec<HelloFeature>,
    pub agent: String,
    opaque: Arc<OpaqueGenerator>,
    next_id: Arc<AtomicU64>,
}

impl ConnectionFactory {
    pub fn new(config: &ClientConfig, opaque: Arc<OpaqueGenerator>) -> Self {
        Self {
            connect_timeout: config.connect_timeout,
            socket_timeout: config.socket_timeout,
            credentials: config.credentials.clone(),
            bucket: Some(config.bucket.clone()).filter(|b| !b.is_empty()),
            hello_features: config.hello_features.clone(),
            agent: config.agent.clone(),
            opaque,
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Connect and run the handshake: HELLO, SASL PLAIN, SELECT_BUCKET
    pub fn create(&self, host: &str, port: u16) -> Result<Connection, KvError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + self.connect_timeout;
        let mut conn = Connection::connect_tcp(
            id,
            host,
            port,
            self.connect_timeout,
            self.socket_timeout,
            Arc::clone(&self.opaque),
        )?;

        if !self.hello_features.is_empty() {
            conn.negotiated = self.hello(&mut conn, deadline)?;
        }
        if let Some(ref credentials) = self.credentials {
            self.authenticate(&mut conn, credentials, deadline)?;
        }
        if let Some(ref bucket) = self.bucket {
            if conn.has_feature(HelloFeature::SelectBucket) {
                self.select_bucket(&mut conn, bucket, deadline)?;
            }
        }

        debug!(
            "Connected to {}:{} (conn #{}, features {:?})",
            host, port, id, conn.negotiated
        );
        Ok(conn)
    }

    fn request(&self, conn: &Connection, opcode: Opcode, key: &[u8], value: Vec<u8>) -> Result<Frame, KvError> {
        Ok(Frame::request(
            opcode as u8,
            0,
            conn.next_opaque(),
            0,
            0,
            Vec::new(),
            key.to_vec(),
            value,
        )?)
    }

    fn hello(&self, conn: &mut Connection, deadline: Instant) -> Result<Vec<HelloFeature>, KvError> {
        let mut value = Vec::with_capacity(self.hello_features.len() * 2);
        for feature in &self.hello_features {
            value.extend_from_slice(&(*feature as u16).to_be_bytes());
        }
        let request = self.request(conn, Opcode::Hello, self.agent.as_bytes(), value)?;
        let response = conn.execute(&request, deadline, None)?;

        if !response.status().is_success() {
            debug!(
                "{} rejected HELLO ({}), continuing without features",
                conn.endpoint(),
                response.status()
            );
            return Ok(Vec::new());
        }
        Ok(response
            .value
            .chunks_exact(2)
            .filter_map(|c| HelloFeature::from_u16(u16::from_be_bytes([c[0], c[1]])))
            .collect())
    }

    fn authenticate(
        &self,
        conn: &mut Connection,
        credentials: &Credentials,
        deadline: Instant,
    ) -> Result<(), KvError> {
        let request = self.request(conn, Opcode::SaslListMechs, b"", Vec::new())?;
        let response = conn.execute(&request, deadline, None)?;
        if !response.status().is_success() {
            return Err(ConnectionError::AuthFailed(format!(
                "listing SASL mechanisms failed: {}",
                response.status()
            ))
            .into());
        }
        let offered = String::from_utf8_lossy(&response.value).into_owned();
        if !offered.split_whitespace().any(|m| m == "PLAIN") {
            return Err(ConnectionError::AuthFailed(format!(
                "server does not offer PLAIN (offered: {})",
                offered
            ))
            .into());
        }

        let mut token = Vec::with_capacity(credentials.username.len() + credentials.password.len() + 2);
        token.push(0);
        token.extend_from_slice(credentials.username.as_bytes());
        token.push(0);
        token.extend_from_slice(credentials.password.as_bytes());

        let request = self.request(conn, Opcode::SaslAuth, b"PLAIN", token)?;
        let response = conn.execute(&request, deadline, None)?;
        match response.status() {
            Status::Success => Ok(()),
            status => Err(ConnectionError::AuthFailed(format!(
                "user '{}' rejected: {}",
                credentials.username, status
            ))
            .into()),
        }
    }

    fn select_bucket(&self, conn: &mut Connection, bucket: &str, deadline: Instant) -> Result<(), KvError> {
        let request = self.request(conn, Opcode::SelectBucket, bucket.as_bytes(), Vec::new())?;
        let response = conn.execute(&request, deadline, None)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ConnectionError::SelectBucketFailed(format!("{}: {}", bucket, response.status())).into())
        }
    }
}
