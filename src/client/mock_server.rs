//! In-process key-value server for tests
//!
//! Speaks the binary protocol over loopback TCP, keeps documents in memory
//! and serves a cluster map. Tests can script failures (NotMyVbucket,
//! TemporaryFailure, ...) or make it swallow requests entirely.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

use crate::protocol::{datatype, subdoc_flags, Frame, FrameDecoder, HelloFeature, Opcode, Status};

const USERNAME: &str = "Administrator";
const PASSWORD: &str = "password";
const VBUCKET_UUID: u64 = 0xfeed_f00d;

struct Doc {
    value: Vec<u8>,
    flags: u32,
    cas: u64,
    datatype: u8,
    locked_until: Option<Instant>,
}

impl Doc {
    fn is_locked(&self) -> bool {
        self.locked_until.map(|t| Instant::now() < t).unwrap_or(false)
    }
}

struct Script {
    status: Status,
    remaining: Option<usize>,
    body: Vec<u8>,
}

struct MockState {
    docs: HashMap<Vec<u8>, Doc>,
    next_cas: u64,
    seqno: u64,
    config: Option<String>,
    script: Option<Script>,
    delay: Option<(Duration, usize)>,
    requests: HashMap<u8, usize>,
}

struct MockShared {
    state: Mutex<MockState>,
    stop: AtomicBool,
    silent: AtomicBool,
    accepted: AtomicUsize,
    memcached: bool,
}

#[derive(Default)]
struct Session {
    mutation_seqno: bool,
}

/// Handle to a running mock server; stops on drop
pub struct MockServer {
    port: u16,
    shared: Arc<MockShared>,
}

impl MockServer {
    /// Couchbase-style node serving a 64-vBucket map that points at itself
    pub fn start() -> Self {
        let server = Self::spawn(false);
        server.set_config(Self::vbucket_config(1, &[server.port], 64));
        server
    }

    /// Plain memcached: no HELLO, no cluster map
    pub fn start_memcached() -> Self {
        Self::spawn(true)
    }

    fn spawn(memcached: bool) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let shared = Arc::new(MockShared {
            state: Mutex::new(MockState {
                docs: HashMap::new(),
                next_cas: 1,
                seqno: 0,
                config: None,
                script: None,
                delay: None,
                requests: HashMap::new(),
            }),
            stop: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            accepted: AtomicUsize::new(0),
            memcached,
        });

        let accept_shared = Arc::clone(&shared);
        thread::spawn(move || {
            for stream in listener.incoming() {
                if accept_shared.stop.load(Ordering::SeqCst) {
                    return;
                }
                let Ok(stream) = stream else { continue };
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                let conn_shared = Arc::clone(&accept_shared);
                thread::spawn(move || serve(conn_shared, stream));
            }
        });

        Self { port, shared }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connections_accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    /// Number of requests seen with `opcode`
    pub fn requests(&self, opcode: Opcode) -> usize {
        self.shared
            .state
            .lock()
            .requests
            .get(&(opcode as u8))
            .copied()
            .unwrap_or(0)
    }

    pub fn set_config(&self, json: String) {
        self.shared.state.lock().config = Some(json);
    }

    /// Accept requests but never answer them
    pub fn set_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    /// Answer the next `times` keyed requests with `status`
    pub fn fail_next(&self, status: Status, times: usize) {
        self.shared.state.lock().script = Some(Script {
            status,
            remaining: Some(times),
            body: Vec::new(),
        });
    }

    /// Answer every keyed request with `status` and `body`
    pub fn fail_always(&self, status: Status, body: Option<String>) {
        self.shared.state.lock().script = Some(Script {
            status,
            remaining: None,
            body: body.map(String::into_bytes).unwrap_or_default(),
        });
    }

    /// Apply the next `times` keyed requests at once but hold their replies
    /// back for `delay`
    pub fn delay_next(&self, delay: Duration, times: usize) {
        self.shared.state.lock().delay = Some((delay, times));
    }

    pub fn clear_failures(&self) {
        self.shared.state.lock().script = None;
    }

    /// Stored value of a document
    pub fn doc(&self, key: &str) -> Option<Vec<u8>> {
        self.shared
            .state
            .lock()
            .docs
            .get(key.as_bytes())
            .map(|d| d.value.clone())
    }

    /// Map with vBuckets spread round-robin over `ports`, one replica when
    /// there is more than one node
    pub fn vbucket_config(rev: u64, ports: &[u16], num_vbuckets: usize) -> String {
        let n = ports.len();
        let entries: Vec<Vec<i16>> = (0..num_vbuckets)
            .map(|vb| {
                if n > 1 {
                    vec![(vb % n) as i16, ((vb + 1) % n) as i16]
                } else {
                    vec![0]
                }
            })
            .collect();
        Self::config_json(rev, ports, if n > 1 { 1 } else { 0 }, entries)
    }

    /// Map where node `owner` holds every vBucket
    pub fn vbucket_config_owned_by(rev: u64, ports: &[u16], owner: usize, num_vbuckets: usize) -> String {
        let entries = vec![vec![owner as i16]; num_vbuckets];
        Self::config_json(rev, ports, 0, entries)
    }

    /// Map with an explicit vBucket table
    pub fn config_json(rev: u64, ports: &[u16], replicas: usize, entries: Vec<Vec<i16>>) -> String {
        serde_json::json!({
            "rev": rev,
            "name": "default",
            "nodeLocator": "vbucket",
            "nodesExt": ports
                .iter()
                .map(|p| serde_json::json!({"hostname": "$HOST", "services": {"kv": p, "mgmt": 8091}}))
                .collect::<Vec<_>>(),
            "vBucketServerMap": {
                "hashAlgorithm": "CRC",
                "numReplicas": replicas,
                "serverList": ports.iter().map(|p| format!("$HOST:{}", p)).collect::<Vec<_>>(),
                "vBucketMap": entries,
            }
        })
        .to_string()
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        // wake the accept loop
        TcpStream::connect(("127.0.0.1", self.port)).ok();
    }
}

fn serve(shared: Arc<MockShared>, mut sock: TcpStream) {
    sock.set_nodelay(true).ok();
    sock.set_read_timeout(Some(Duration::from_millis(20))).ok();
    let mut decoder = FrameDecoder::new();
    let mut session = Session::default();
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        if shared.stop.load(Ordering::SeqCst) {
            return;
        }
        match sock.read(&mut buf) {
            Ok(0) => return,
            Ok(n) => decoder.feed(&buf[..n]),
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => continue,
            Err(_) => return,
        }
        loop {
            let request = match decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(_) => return,
            };
            if shared.silent.load(Ordering::SeqCst) {
                continue;
            }
            let response = shared.handle(&mut session, &request);
            if let Some(delay) = shared.reply_delay(request.header.opcode) {
                thread::sleep(delay);
            }
            if sock.write_all(&response.encode()).is_err() {
                return;
            }
        }
    }
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_be_bytes(a)
}

/// Response under construction
struct Reply {
    status: Status,
    extras: Vec<u8>,
    value: Vec<u8>,
    cas: u64,
    datatype: u8,
}

impl Reply {
    fn status(status: Status) -> Self {
        Self {
            status,
            extras: Vec::new(),
            value: Vec::new(),
            cas: 0,
            datatype: datatype::RAW,
        }
    }

    fn ok() -> Self {
        Self::status(Status::Success)
    }

    fn value(mut self, value: Vec<u8>) -> Self {
        self.value = value;
        self
    }

    fn cas(mut self, cas: u64) -> Self {
        self.cas = cas;
        self
    }

    fn extras(mut self, extras: Vec<u8>) -> Self {
        self.extras = extras;
        self
    }
}

impl MockShared {
    fn reply_delay(&self, opcode: u8) -> Option<Duration> {
        if !Opcode::from_u8(opcode).map(Opcode::is_keyed).unwrap_or(false) {
            return None;
        }
        let mut state = self.state.lock();
        let (delay, remaining) = state.delay.as_mut()?;
        if *remaining == 0 {
            return None;
        }
        *remaining -= 1;
        Some(*delay)
    }

    fn handle(&self, session: &mut Session, request: &Frame) -> Frame {
        let reply = self.dispatch(session, request);
        let mut frame = Frame::response(
            request.header.opcode,
            reply.status,
            request.header.opaque,
            reply.cas,
            reply.extras,
            Vec::new(),
            reply.value,
        )
        .unwrap();
        frame.header.datatype = reply.datatype;
        frame
    }

    fn dispatch(&self, session: &mut Session, request: &Frame) -> Reply {
        let mut state = self.state.lock();
        *state.requests.entry(request.header.opcode).or_insert(0) += 1;

        let Some(opcode) = Opcode::from_u8(request.header.opcode) else {
            return Reply::status(Status::UnknownCommand);
        };

        if opcode.is_keyed() {
            if let Some(script) = state.script.as_mut() {
                let active = script.remaining.map(|n| n > 0).unwrap_or(true);
                if active {
                    if let Some(n) = script.remaining.as_mut() {
                        *n -= 1;
                    }
                    return Reply::status(script.status).value(script.body.clone());
                }
            }
        }

        match opcode {
            Opcode::Hello if self.memcached => Reply::status(Status::UnknownCommand),
            Opcode::Hello => {
                let supported = [
                    HelloFeature::TcpNoDelay,
                    HelloFeature::MutationSeqno,
                    HelloFeature::Xerror,
                    HelloFeature::SelectBucket,
                    HelloFeature::Json,
                ];
                let mut accepted = Vec::new();
                for chunk in request.value.chunks_exact(2) {
                    let code = u16::from_be_bytes([chunk[0], chunk[1]]);
                    if let Some(f) = HelloFeature::from_u16(code).filter(|f| supported.contains(f)) {
                        session.mutation_seqno |= f == HelloFeature::MutationSeqno;
                        accepted.extend_from_slice(&code.to_be_bytes());
                    }
                }
                Reply::ok().value(accepted)
            }
            Opcode::SaslListMechs => Reply::ok().value(b"SCRAM-SHA512 SCRAM-SHA256 PLAIN".to_vec()),
            Opcode::SaslAuth => {
                let expected = format!("\0{}\0{}", USERNAME, PASSWORD);
                if request.key == b"PLAIN" && request.value == expected.as_bytes() {
                    Reply::ok().value(b"Authenticated".to_vec())
                } else {
                    Reply::status(Status::AuthError)
                }
            }
            Opcode::SelectBucket | Opcode::Noop => Reply::ok(),
            Opcode::GetClusterConfig => match state.config.clone() {
                Some(json) if !self.memcached => {
                    let mut reply = Reply::ok().value(json.into_bytes());
                    reply.datatype = datatype::JSON;
                    reply
                }
                _ => Reply::status(Status::UnknownCommand),
            },
            _ => state.document_op(session, opcode, request),
        }
    }
}

impl MockState {
    fn bump_cas(&mut self) -> u64 {
        self.next_cas += 1;
        self.next_cas
    }

    fn mutation_extras(&mut self, session: &Session) -> Vec<u8> {
        self.seqno += 1;
        if !session.mutation_seqno {
            return Vec::new();
        }
        let mut extras = VBUCKET_UUID.to_be_bytes().to_vec();
        extras.extend_from_slice(&self.seqno.to_be_bytes());
        extras
    }

    fn mutated(&mut self, session: &Session, cas: u64) -> Reply {
        let extras = self.mutation_extras(session);
        Reply::ok().cas(cas).extras(extras)
    }

    fn document_op(&mut self, session: &Session, opcode: Opcode, req: &Frame) -> Reply {
        let key = req.key.clone();
        match opcode {
            Opcode::Get | Opcode::GetReplica | Opcode::GetAndTouch => match self.docs.get(&key) {
                Some(doc) => {
                    let mut reply = Reply::ok()
                        .cas(doc.cas)
                        .extras(doc.flags.to_be_bytes().to_vec())
                        .value(doc.value.clone());
                    reply.datatype = doc.datatype;
                    reply
                }
                None => Reply::status(Status::KeyNotFound),
            },
            Opcode::GetAndLock => {
                let lock_secs = if req.extras.len() >= 4 { be_u32(&req.extras) } else { 15 };
                let cas = self.bump_cas();
                match self.docs.get_mut(&key) {
                    Some(doc) if doc.is_locked() => Reply::status(Status::TemporaryFailure),
                    Some(doc) => {
                        doc.locked_until = Some(Instant::now() + Duration::from_secs(lock_secs as u64));
                        doc.cas = cas;
                        Reply::ok()
                            .cas(cas)
                            .extras(doc.flags.to_be_bytes().to_vec())
                            .value(doc.value.clone())
                    }
                    None => Reply::status(Status::KeyNotFound),
                }
            }
            Opcode::Unlock => match self.docs.get_mut(&key) {
                Some(doc) if doc.cas == req.header.cas => {
                    doc.locked_until = None;
                    Reply::ok().cas(doc.cas)
                }
                Some(_) => Reply::status(Status::Locked),
                None => Reply::status(Status::KeyNotFound),
            },
            Opcode::Touch => match self.docs.get(&key) {
                Some(doc) => Reply::ok().cas(doc.cas),
                None => Reply::status(Status::KeyNotFound),
            },
            Opcode::Set | Opcode::Add | Opcode::Replace => {
                let existing = self.docs.get(&key);
                let cas_in = req.header.cas;
                let verdict = match (opcode, existing) {
                    (Opcode::Add, Some(_)) => Some(Status::KeyExists),
                    (Opcode::Replace, None) => Some(Status::KeyNotFound),
                    (_, None) if cas_in != 0 => Some(Status::KeyNotFound),
                    (_, Some(doc)) if doc.is_locked() && cas_in != doc.cas => Some(Status::Locked),
                    (_, Some(doc)) if cas_in != 0 && cas_in != doc.cas => Some(Status::KeyExists),
                    _ => None,
                };
                if let Some(status) = verdict {
                    return Reply::status(status);
                }
                let flags = if req.extras.len() >= 4 { be_u32(&req.extras) } else { 0 };
                let cas = self.bump_cas();
                self.docs.insert(
                    key,
                    Doc {
                        value: req.value.clone(),
                        flags,
                        cas,
                        datatype: req.header.datatype,
                        locked_until: None,
                    },
                );
                self.mutated(session, cas)
            }
            Opcode::Delete => match self.docs.get(&key) {
                None => Reply::status(Status::KeyNotFound),
                Some(doc) if req.header.cas != 0 && doc.cas != req.header.cas => {
                    Reply::status(Status::KeyExists)
                }
                Some(_) => {
                    self.docs.remove(&key);
                    let cas = self.bump_cas();
                    self.mutated(session, cas)
                }
            },
            Opcode::Increment | Opcode::Decrement => self.counter(session, opcode, req),
            Opcode::Append | Opcode::Prepend => {
                let cas = self.bump_cas();
                match self.docs.get_mut(&key) {
                    None => Reply::status(Status::ItemNotStored),
                    Some(doc) => {
                        if opcode == Opcode::Append {
                            doc.value.extend_from_slice(&req.value);
                        } else {
                            let mut value = req.value.clone();
                            value.extend_from_slice(&doc.value);
                            doc.value = value;
                        }
                        doc.cas = cas;
                        self.mutated(session, cas)
                    }
                }
            }
            Opcode::Observe => {
                let body = &req.value;
                let key_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                let key = &body[4..4 + key_len];
                let (state, cas) = match self.docs.get(key) {
                    Some(doc) => (0x00u8, doc.cas),
                    None => (0x80u8, 0),
                };
                let mut value = body[..4 + key_len].to_vec();
                value.push(state);
                value.extend_from_slice(&cas.to_be_bytes());
                Reply::ok().value(value)
            }
            op if op.is_subdoc() => self.subdoc(session, op, req),
            _ => Reply::status(Status::NotSupported),
        }
    }

    fn counter(&mut self, session: &Session, opcode: Opcode, req: &Frame) -> Reply {
        if req.extras.len() != 20 {
            return Reply::status(Status::InvalidArguments);
        }
        let delta = be_u64(&req.extras[..8]);
        let initial = be_u64(&req.extras[8..16]);
        let expiry = be_u32(&req.extras[16..20]);
        let cas = self.bump_cas();

        let next = match self.docs.get(&req.key) {
            None if expiry == 0xffff_ffff => return Reply::status(Status::KeyNotFound),
            None => initial,
            Some(doc) => {
                let Some(current) = std::str::from_utf8(&doc.value)
                    .ok()
                    .and_then(|s| s.trim().parse::<u64>().ok())
                else {
                    return Reply::status(Status::DeltaBadValue);
                };
                if opcode == Opcode::Increment {
                    current.wrapping_add(delta)
                } else {
                    current.saturating_sub(delta)
                }
            }
        };

        self.docs.insert(
            req.key.clone(),
            Doc {
                value: next.to_string().into_bytes(),
                flags: 0,
                cas,
                datatype: datatype::RAW,
                locked_until: None,
            },
        );
        self.mutated(session, cas).value(next.to_be_bytes().to_vec())
    }

    fn subdoc(&mut self, session: &Session, opcode: Opcode, req: &Frame) -> Reply {
        if req.extras.len() < 3 {
            return Reply::status(Status::InvalidArguments);
        }
        let path_len = u16::from_be_bytes([req.extras[0], req.extras[1]]) as usize;
        let mkdir = req.extras[2] & subdoc_flags::MKDIR_P != 0;
        let path = String::from_utf8_lossy(&req.value[..path_len]).into_owned();
        let fragment = &req.value[path_len..];

        let Some(doc) = self.docs.get(&req.key) else {
            return Reply::status(Status::KeyNotFound);
        };
        let Ok(mut root) = serde_json::from_slice::<Value>(&doc.value) else {
            return Reply::status(Status::SubdocDocNotJson);
        };
        let pointer = format!("/{}", path.replace('.', "/"));

        let outcome = match opcode {
            Opcode::SubdocGet => {
                return match root.pointer(&pointer) {
                    Some(v) => Reply::ok().cas(doc.cas).value(v.to_string().into_bytes()),
                    None => Reply::status(Status::SubdocPathNotFound),
                }
            }
            Opcode::SubdocExists => {
                return match root.pointer(&pointer) {
                    Some(_) => Reply::ok().cas(doc.cas),
                    None => Reply::status(Status::SubdocPathNotFound),
                }
            }
            Opcode::SubdocGetCount => {
                return match root.pointer(&pointer) {
                    Some(Value::Array(a)) => Reply::ok().value(a.len().to_string().into_bytes()),
                    Some(Value::Object(o)) => Reply::ok().value(o.len().to_string().into_bytes()),
                    Some(_) => Reply::status(Status::SubdocPathMismatch),
                    None => Reply::status(Status::SubdocPathNotFound),
                }
            }
            _ => mutate_json(&mut root, opcode, &path, fragment, mkdir),
        };

        match outcome {
            Ok(value) => {
                let cas = self.bump_cas();
                if let Some(doc) = self.docs.get_mut(&req.key) {
                    doc.value = root.to_string().into_bytes();
                    doc.cas = cas;
                }
                self.mutated(session, cas).value(value)
            }
            Err(status) => Reply::status(status),
        }
    }
}

/// Apply a sub-document mutation; returns the response body
fn mutate_json(root: &mut Value, opcode: Opcode, path: &str, fragment: &[u8], mkdir: bool) -> Result<Vec<u8>, Status> {
    let parts: Vec<&str> = path.split('.').collect();
    let (last, parents) = parts.split_last().ok_or(Status::SubdocPathInvalid)?;

    let mut parent = root;
    for part in parents {
        let Value::Object(map) = parent else {
            return Err(Status::SubdocPathMismatch);
        };
        if !map.contains_key(*part) {
            if !mkdir {
                return Err(Status::SubdocPathNotFound);
            }
            map.insert(part.to_string(), Value::Object(Default::default()));
        }
        parent = map.get_mut(*part).ok_or(Status::SubdocPathNotFound)?;
    }
    let Value::Object(map) = parent else {
        return Err(Status::SubdocPathMismatch);
    };
    let parse = || serde_json::from_slice::<Value>(fragment).map_err(|_| Status::SubdocCannotInsert);

    match opcode {
        Opcode::SubdocDictAdd => {
            if map.contains_key(*last) {
                return Err(Status::SubdocPathExists);
            }
            map.insert(last.to_string(), parse()?);
        }
        Opcode::SubdocDictUpsert => {
            map.insert(last.to_string(), parse()?);
        }
        Opcode::SubdocReplace => {
            let slot = map.get_mut(*last).ok_or(Status::SubdocPathNotFound)?;
            *slot = parse()?;
        }
        Opcode::SubdocDelete => {
            map.remove(*last).ok_or(Status::SubdocPathNotFound)?;
        }
        Opcode::SubdocCounter => {
            let delta: i64 = std::str::from_utf8(fragment)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or(Status::SubdocDeltaRange)?;
            let slot = map.entry(last.to_string()).or_insert(Value::from(0));
            let current = slot.as_i64().ok_or(Status::SubdocPathMismatch)?;
            let next = current.checked_add(delta).ok_or(Status::SubdocValueTooDeep)?;
            *slot = Value::from(next);
            return Ok(next.to_string().into_bytes());
        }
        Opcode::SubdocArrayPushLast | Opcode::SubdocArrayPushFirst | Opcode::SubdocArrayAddUnique => {
            let value = parse()?;
            let slot = map.entry(last.to_string()).or_insert_with(|| Value::Array(Vec::new()));
            let Value::Array(items) = slot else {
                return Err(Status::SubdocPathMismatch);
            };
            match opcode {
                Opcode::SubdocArrayPushFirst => items.insert(0, value),
                Opcode::SubdocArrayAddUnique if items.contains(&value) => {
                    return Err(Status::SubdocPathExists)
                }
                _ => items.push(value),
            }
        }
        _ => return Err(Status::NotSupported),
    }
    Ok(Vec::new())
}
