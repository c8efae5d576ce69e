//! Key-value client
//!
//! [`KvClient`] bootstraps a topology from the seeds and exposes the document
//! operations on top of the dispatcher. Application outcomes such as
//! KeyNotFound or a CAS mismatch come back as an [`OperationResult`] with
//! that status; only transport, timeout and fatal failures are `Err`.

use std::io;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use super::cancel::CancelToken;
use super::dispatcher::Dispatcher;
use super::raw_connection::ConnectionFactory;
use super::transcoder::Transcoder;
use crate::cluster::{Topology, TopologyManager};
use crate::config::ClientConfig;
use crate::metrics::DiagnosticsReport;
use crate::protocol::{
    subdoc_flags, ObserveState, OpaqueGenerator, Opcode, Operation, OperationResult, Status,
    COUNTER_NO_CREATE,
};
use crate::utils::{KvError, Result};

/// Per-call overrides
#[derive(Debug, Clone, Copy, Default)]
pub struct KvOptions {
    /// Falls back to `ClientConfig::kv_timeout`
    pub timeout: Option<Duration>,
    /// Only apply when the document still has this CAS (0 = any)
    pub cas: u64,
    /// Seconds, or an absolute unix time past 30 days
    pub expiry: u32,
}

impl KvOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    pub fn expiry(mut self, expiry: u32) -> Self {
        self.expiry = expiry;
        self
    }
}

/// Sub-document read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupSpec {
    Get(String),
    Exists(String),
    Count(String),
}

impl LookupSpec {
    fn opcode(&self) -> Opcode {
        match self {
            LookupSpec::Get(_) => Opcode::SubdocGet,
            LookupSpec::Exists(_) => Opcode::SubdocExists,
            LookupSpec::Count(_) => Opcode::SubdocGetCount,
        }
    }

    fn path(&self) -> &str {
        match self {
            LookupSpec::Get(p) | LookupSpec::Exists(p) | LookupSpec::Count(p) => p,
        }
    }
}

/// Sub-document write
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateSpec {
    opcode: Opcode,
    path: String,
    value: Vec<u8>,
    create_parents: bool,
}

impl MutateSpec {
    fn new(opcode: Opcode, path: &str, value: impl Into<Vec<u8>>) -> Self {
        Self {
            opcode,
            path: path.to_string(),
            value: value.into(),
            create_parents: false,
        }
    }

    /// `value` is a JSON fragment
    pub fn insert(path: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::SubdocDictAdd, path, value)
    }

    pub fn upsert(path: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::SubdocDictUpsert, path, value)
    }

    pub fn replace(path: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::SubdocReplace, path, value)
    }

    pub fn remove(path: &str) -> Self {
        Self::new(Opcode::SubdocDelete, path, Vec::new())
    }

    pub fn counter(path: &str, delta: i64) -> Self {
        Self::new(Opcode::SubdocCounter, path, delta.to_string())
    }

    pub fn array_append(path: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::SubdocArrayPushLast, path, value)
    }

    pub fn array_prepend(path: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::SubdocArrayPushFirst, path, value)
    }

    pub fn array_insert(path: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::SubdocArrayInsert, path, value)
    }

    pub fn array_add_unique(path: &str, value: impl Into<Vec<u8>>) -> Self {
        Self::new(Opcode::SubdocArrayAddUnique, path, value)
    }

    /// Create missing intermediate objects
    pub fn create_parents(mut self) -> Self {
        self.create_parents = true;
        self
    }
}

struct ClientInner {
    config: ClientConfig,
    dispatcher: Dispatcher,
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        self.dispatcher.topology().close();
    }
}

/// Cluster-aware key-value client; cheap to clone
#[derive(Clone)]
pub struct KvClient {
    inner: Arc<ClientInner>,
}

impl KvClient {
    /// Bootstrap from the configured seeds
    pub fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let factory = ConnectionFactory::new(&config, Arc::new(OpaqueGenerator::new()));
        let topology = TopologyManager::bootstrap(&config, factory)?;
        {
            let current = topology.current();
            info!(
                "Connected to bucket '{}' at revision {} ({} nodes)",
                current.bucket(),
                current.revision(),
                current.num_nodes()
            );
        }
        let dispatcher = Dispatcher::new(topology, &config);
        Ok(Self {
            inner: Arc::new(ClientInner { config, dispatcher }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Current topology snapshot
    pub fn topology(&self) -> Arc<Topology> {
        self.topology_manager().current()
    }

    pub fn topology_manager(&self) -> &Arc<TopologyManager> {
        self.inner.dispatcher.topology()
    }

    /// Receive the new revision after every topology change
    pub fn subscribe(&self) -> mpsc::Receiver<u64> {
        self.topology_manager().subscribe()
    }

    /// Run a prepared operation on the calling thread
    pub fn execute(&self, op: &mut Operation) -> Result<OperationResult> {
        self.inner.dispatcher.execute(op, &CancelToken::new())
    }

    /// Like [`KvClient::execute`], abandoning the wait once `cancel` fires
    pub fn execute_with_cancel(&self, op: &mut Operation, cancel: &CancelToken) -> Result<OperationResult> {
        self.inner.dispatcher.execute(op, cancel)
    }

    /// Run an operation on tokio's blocking pool
    ///
    /// Dropping the returned future cancels the operation; the connection it
    /// was waiting on is closed rather than returned to the pool.
    pub async fn execute_async(&self, mut op: Operation) -> Result<OperationResult> {
        let cancel = CancelToken::new();
        let guard = cancel.drop_guard();
        let client = self.clone();
        let joined = tokio::task::spawn_blocking(move || client.inner.dispatcher.execute(&mut op, &cancel)).await;
        guard.disarm();
        joined.map_err(|e| KvError::Io(io::Error::new(io::ErrorKind::Other, e)))?
    }

    fn run(&self, op: Operation, opts: &KvOptions) -> Result<OperationResult> {
        let mut op = op.with_timeout(opts.timeout.unwrap_or(self.inner.config.kv_timeout));
        if opts.cas != 0 {
            op.cas = opts.cas;
        }
        self.execute(&mut op)
    }

    pub fn get(&self, key: &str, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::get(key), opts)
    }

    /// Read from replica `replica` (1-based)
    pub fn get_replica(&self, key: &str, replica: usize, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::get_replica(key, replica), opts)
    }

    /// Read and reset the expiry to `opts.expiry`
    pub fn get_and_touch(&self, key: &str, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::get_and_touch(key, opts.expiry), opts)
    }

    /// Read and lock for `lock_time` seconds; the returned CAS unlocks
    pub fn get_and_lock(&self, key: &str, lock_time: u32, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::get_and_lock(key, lock_time), opts)
    }

    pub fn unlock(&self, key: &str, cas: u64, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::unlock(key, cas), opts)
    }

    pub fn touch(&self, key: &str, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::touch(key, opts.expiry), opts)
    }

    pub fn upsert(&self, key: &str, value: &[u8], flags: u32, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::upsert(key, value, flags, opts.expiry), opts)
    }

    /// Store only if the key does not exist
    pub fn insert(&self, key: &str, value: &[u8], flags: u32, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::insert(key, value, flags, opts.expiry), opts)
    }

    /// Store only if the key exists
    pub fn replace(&self, key: &str, value: &[u8], flags: u32, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::replace(key, value, flags, opts.expiry), opts)
    }

    pub fn remove(&self, key: &str, opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::remove(key), opts)
    }

    /// Add `delta`; a missing key is created with `initial`, or reported as
    /// KeyNotFound when `initial` is `None`
    pub fn increment(&self, key: &str, delta: u64, initial: Option<u64>, opts: &KvOptions) -> Result<OperationResult> {
        self.counter(Opcode::Increment, key, delta, initial, opts)
    }

    /// Subtract `delta`, stopping at zero
    pub fn decrement(&self, key: &str, delta: u64, initial: Option<u64>, opts: &KvOptions) -> Result<OperationResult> {
        self.counter(Opcode::Decrement, key, delta, initial, opts)
    }

    fn counter(
        &self,
        opcode: Opcode,
        key: &str,
        delta: u64,
        initial: Option<u64>,
        opts: &KvOptions,
    ) -> Result<OperationResult> {
        let expiry = if initial.is_some() { opts.expiry } else { COUNTER_NO_CREATE };
        self.run(Operation::counter(opcode, key, delta, initial.unwrap_or(0), expiry), opts)
    }

    pub fn append(&self, key: &str, value: &[u8], opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::concat(Opcode::Append, key, value), opts)
    }

    pub fn prepend(&self, key: &str, value: &[u8], opts: &KvOptions) -> Result<OperationResult> {
        self.run(Operation::concat(Opcode::Prepend, key, value), opts)
    }

    /// Persistence state and CAS of a key on its primary
    pub fn observe(&self, key: &str, opts: &KvOptions) -> Result<(ObserveState, u64)> {
        let result = self.run(Operation::observe(key), opts)?;
        if !result.is_success() {
            return Err(KvError::UnexpectedStatus {
                key: key.to_string(),
                opcode: Opcode::Observe,
                status: result.status,
            });
        }
        Ok(result.observe_state()?)
    }

    pub fn lookup_in(&self, key: &str, spec: &LookupSpec, opts: &KvOptions) -> Result<OperationResult> {
        let op = Operation::subdoc(spec.opcode(), key, spec.path(), Vec::new(), subdoc_flags::NONE, None);
        self.run(op, opts)
    }

    pub fn mutate_in(&self, key: &str, spec: &MutateSpec, opts: &KvOptions) -> Result<OperationResult> {
        let flags = if spec.create_parents {
            subdoc_flags::MKDIR_P
        } else {
            subdoc_flags::NONE
        };
        let expiry = (opts.expiry != 0).then_some(opts.expiry);
        let op = Operation::subdoc(spec.opcode, key, &spec.path, spec.value.clone(), flags, expiry);
        self.run(op, opts)
    }

    pub fn noop(&self) -> Result<OperationResult> {
        self.run(Operation::noop(), &KvOptions::default())
    }

    /// Read and decode a document; `None` when the key does not exist
    pub fn get_as<T: Transcoder>(&self, key: &str, transcoder: &T, opts: &KvOptions) -> Result<Option<T::Value>> {
        let result = self.get(key, opts)?;
        match result.status {
            Status::Success => transcoder.decode(&result.value, result.flags).map(Some),
            Status::KeyNotFound => Ok(None),
            status => Err(KvError::UnexpectedStatus {
                key: key.to_string(),
                opcode: Opcode::Get,
                status,
            }),
        }
    }

    /// Encode and store a document
    pub fn upsert_as<T: Transcoder>(
        &self,
        key: &str,
        value: &T::Value,
        transcoder: &T,
        opts: &KvOptions,
    ) -> Result<OperationResult> {
        let (bytes, flags) = transcoder.encode(value)?;
        let op = Operation::upsert(key, bytes, flags, opts.expiry).with_datatype(transcoder.datatype());
        self.run(op, opts)
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        DiagnosticsReport::from_topology(&self.topology())
    }

    /// Stop polling and close every connection
    pub fn close(&self) {
        self.topology_manager().close();
    }
}
