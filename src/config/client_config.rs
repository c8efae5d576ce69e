//! Client configuration

use std::fmt;
use std::time::Duration;

use crate::client::backoff::Backoff;
use crate::cluster::config_map::DEFAULT_KV_PORT;
use crate::protocol::{HelloFeature, DEFAULT_KV_TIMEOUT};
use crate::utils::KvError;

/// Seed node address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerAddress {
    pub host: String,
    pub port: u16,
}

impl ServerAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// SASL PLAIN credentials
#[derive(Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// How the bootstrap picks the key locator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocatorMode {
    /// Use the server's cluster map; fall back to a static ketama ring over
    /// the seeds if the server cannot serve one
    #[default]
    Auto,
    /// Never fetch a map; always hash over the seeds
    Ketama,
}

/// Per-node connection pool sizing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Connections opened when the node joins the topology
    pub min_size: usize,
    /// Hard cap on live connections to the node
    pub max_size: usize,
    /// How long `acquire` waits at the cap before `QueueTimeout`
    pub wait_timeout: Duration,
    /// Grace rounds given to checked-out connections on dispose
    pub close_attempts: u32,
    /// First grace interval; doubled every round
    pub close_attempt_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_size: 1,
            max_size: 2,
            wait_timeout: Duration::from_millis(2500),
            close_attempts: 5,
            close_attempt_interval: Duration::from_millis(10),
        }
    }
}

/// Complete client configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    // Connection
    pub seeds: Vec<ServerAddress>,
    pub bucket: String,
    pub credentials: Option<Credentials>,
    pub hello_features: Vec<HelloFeature>,
    pub agent: String,
    pub pool: PoolConfig,

    // Timeouts
    pub kv_timeout: Duration,
    pub connect_timeout: Duration,
    pub socket_timeout: Duration,

    // Topology
    pub config_poll_interval: Option<Duration>,
    pub locator: LocatorMode,

    // Retries
    pub max_retry_attempts: u32,
    pub backoff: Backoff,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            seeds: vec![ServerAddress::new("127.0.0.1", DEFAULT_KV_PORT)],
            bucket: "default".to_string(),
            credentials: None,
            hello_features: vec![
                HelloFeature::Xerror,
                HelloFeature::SelectBucket,
                HelloFeature::TcpNoDelay,
                HelloFeature::MutationSeqno,
                HelloFeature::Json,
            ],
            agent: format!("couchbase-kv/{}", env!("CARGO_PKG_VERSION")),
            pool: PoolConfig::default(),
            kv_timeout: DEFAULT_KV_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            socket_timeout: Duration::from_secs(1),
            config_poll_interval: Some(Duration::from_millis(2500)),
            locator: LocatorMode::Auto,
            max_retry_attempts: 10,
            backoff: Backoff::Controlled,
        }
    }
}

impl ClientConfig {
    /// Parse `couchbase://host1,host2:11211/bucket`
    ///
    /// Hosts without a port use 11210. A missing bucket keeps the default.
    pub fn from_connection_string(s: &str) -> Result<Self, KvError> {
        let rest = s
            .strip_prefix("couchbase://")
            .or_else(|| s.strip_prefix("memcached://"))
            .ok_or_else(|| KvError::Config(format!("unsupported scheme in '{}'", s)))?;

        let (hosts, bucket) = match rest.split_once('/') {
            Some((hosts, bucket)) => (hosts, Some(bucket)),
            None => (rest, None),
        };

        let mut seeds = Vec::new();
        for host in hosts.split(',').map(str::trim).filter(|h| !h.is_empty()) {
            let addr = crate::cluster::config_map::parse_host_port(host, DEFAULT_KV_PORT)
                .map_err(|e| KvError::Config(e.to_string()))?;
            seeds.push(ServerAddress::new(addr.host, addr.kv_port));
        }
        if seeds.is_empty() {
            return Err(KvError::Config(format!("no hosts in '{}'", s)));
        }

        let mut config = Self {
            seeds,
            ..Self::default()
        };
        if let Some(bucket) = bucket.map(str::trim).filter(|b| !b.is_empty()) {
            config.bucket = bucket.to_string();
        }
        Ok(config)
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    /// Reject settings the client cannot run with
    pub fn validate(&self) -> Result<(), KvError> {
        if self.seeds.is_empty() {
            return Err(KvError::Config("at least one seed address is required".into()));
        }
        if self.pool.max_size == 0 {
            return Err(KvError::Config("pool max_size must be at least 1".into()));
        }
        if self.pool.min_size > self.pool.max_size {
            return Err(KvError::Config(format!(
                "pool min_size {} exceeds max_size {}",
                self.pool.min_size, self.pool.max_size
            )));
        }
        if self.max_retry_attempts == 0 {
            return Err(KvError::Config("max_retry_attempts must be at least 1".into()));
        }
        if self.socket_timeout.is_zero() {
            return Err(KvError::Config("socket_timeout must be non-zero".into()));
        }
        Ok(())
    }
}
