//! Per-node connection pool
//!
//! A single mutex guards the idle queue, the live-connection count and the
//! checked-out set; a condvar wakes acquirers waiting at the cap. Checked-out
//! connections travel inside a [`PooledConnection`] guard that hands them
//! back on drop.

use std::collections::{HashMap, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::raw_connection::{Connection, ConnectionFactory, ConnectionHandle};
use crate::config::PoolConfig;
use crate::utils::{KvError, Result};

/// Connection counts at a point in time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
}

struct PoolState {
    idle: VecDeque<Connection>,
    /// Live connections including ones being created
    total: usize,
    checked_out: HashMap<u64, Arc<ConnectionHandle>>,
    generation: u64,
    shutdown: bool,
}

struct PoolShared {
    host: String,
    port: u16,
    factory: ConnectionFactory,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

/// Bounded pool of connections to one node
#[derive(Clone)]
pub struct ConnectionPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("endpoint", &self.endpoint())
            .field("stats", &self.stats())
            .finish()
    }
}

impl ConnectionPool {
    /// Create an empty pool; call [`ConnectionPool::prewarm`] to open
    /// `min_size` connections
    pub fn new(host: &str, port: u16, factory: ConnectionFactory, config: PoolConfig) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                host: host.to_string(),
                port,
                factory,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    total: 0,
                    checked_out: HashMap::new(),
                    generation: 0,
                    shutdown: false,
                }),
                available: Condvar::new(),
            }),
        }
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.shared.host, self.shared.port)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    /// Open connections until `min_size` are live
    pub fn prewarm(&self) -> Result<()> {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        while state.total < shared.config.min_size && !state.shutdown {
            state.total += 1;
            let generation = state.generation;
            let created = MutexGuard::unlocked(&mut state, || shared.create());
            match created {
                Ok(mut conn) if !state.shutdown && generation == state.generation => {
                    conn.generation = generation;
                    state.idle.push_back(conn);
                    shared.available.notify_one();
                }
                Ok(_) => {
                    state.total -= 1;
                }
                Err(e) => {
                    state.total -= 1;
                    shared.available.notify_one();
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Borrow a connection, creating one if under the cap, waiting up to
    /// `timeout` otherwise
    pub fn acquire(&self, timeout: Duration) -> Result<PooledConnection> {
        let shared = &self.shared;
        let deadline = Instant::now() + timeout;
        let mut state = shared.state.lock();
        let mut timed_out = false;

        loop {
            if state.shutdown {
                return Err(KvError::PoolShutdown(self.endpoint()));
            }

            while let Some(mut conn) = state.idle.pop_front() {
                if conn.generation == state.generation && conn.check_health() {
                    state.checked_out.insert(conn.id(), conn.handle());
                    return Ok(PooledConnection::new(conn, Arc::clone(shared)));
                }
                debug!("Discarding stale connection #{} to {}", conn.id(), self.endpoint());
                state.total -= 1;
            }

            if state.total < shared.config.max_size {
                state.total += 1;
                let generation = state.generation;
                let created = MutexGuard::unlocked(&mut state, || shared.create());
                return match created {
                    Ok(mut conn) => {
                        if state.shutdown {
                            state.total -= 1;
                            shared.available.notify_one();
                            return Err(KvError::PoolShutdown(self.endpoint()));
                        }
                        conn.generation = generation;
                        state.checked_out.insert(conn.id(), conn.handle());
                        Ok(PooledConnection::new(conn, Arc::clone(shared)))
                    }
                    Err(e) => {
                        state.total -= 1;
                        shared.available.notify_one();
                        Err(e)
                    }
                };
            }

            if timed_out {
                return Err(KvError::QueueTimeout {
                    node: self.endpoint(),
                    waited: timeout,
                });
            }
            timed_out = shared.available.wait_until(&mut state, deadline).timed_out();
        }
    }

    /// Return a connection; same as dropping the guard
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Replace every connection with a fresh one
    ///
    /// Idle connections are closed now; checked-out ones are closed when
    /// they come back.
    pub fn resurrect(&self) -> Result<()> {
        let drained = {
            let mut state = self.shared.state.lock();
            if state.shutdown {
                return Err(KvError::PoolShutdown(self.endpoint()));
            }
            state.generation += 1;
            let drained: Vec<Connection> = state.idle.drain(..).collect();
            state.total -= drained.len();
            self.shared.available.notify_all();
            drained
        };
        info!(
            "Resurrecting pool for {} ({} idle connections closed)",
            self.endpoint(),
            drained.len()
        );
        drop(drained);
        self.prewarm()
    }

    /// Shut the pool down
    ///
    /// Checked-out connections get `close_attempts` grace rounds, doubling
    /// from `close_attempt_interval`, to come back; the rest are force-closed.
    pub fn dispose(&self) {
        let shared = &self.shared;
        let mut state = shared.state.lock();
        if state.shutdown {
            return;
        }
        state.shutdown = true;
        let idle: Vec<Connection> = state.idle.drain(..).collect();
        state.total -= idle.len();
        shared.available.notify_all();

        let mut interval = shared.config.close_attempt_interval;
        for _ in 0..shared.config.close_attempts {
            if state.checked_out.is_empty() {
                break;
            }
            shared.available.wait_for(&mut state, interval);
            interval = interval.saturating_mul(2);
        }

        let stragglers: Vec<Arc<ConnectionHandle>> =
            state.checked_out.drain().map(|(_, h)| h).collect();
        drop(state);
        drop(idle);

        if !stragglers.is_empty() {
            warn!(
                "Force-closing {} in-use connections to {}",
                stragglers.len(),
                self.endpoint()
            );
        }
        for handle in stragglers {
            handle.force_close();
        }
        debug!("Pool for {} disposed", self.endpoint());
    }

    pub fn is_shutdown(&self) -> bool {
        self.shared.state.lock().shutdown
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.shared.state.lock();
        PoolStats {
            total: state.total,
            idle: state.idle.len(),
            in_use: state.checked_out.len(),
        }
    }
}

impl PoolShared {
    fn create(&self) -> Result<Connection> {
        self.factory.create(&self.host, self.port)
    }

    fn release(&self, conn: Connection) {
        let mut state = self.state.lock();
        state.checked_out.remove(&conn.id());
        let recycle = conn.is_alive() && !state.shutdown && conn.generation == state.generation;
        if recycle {
            state.idle.push_back(conn);
        } else {
            state.total -= 1;
            drop(conn);
        }
        // wakes an acquirer, or dispose waiting for stragglers
        self.available.notify_all();
    }
}

/// A checked-out connection, returned to its pool on drop
pub struct PooledConnection {
    conn: Option<Connection>,
    pool: Arc<PoolShared>,
}

impl PooledConnection {
    fn new(conn: Connection, pool: Arc<PoolShared>) -> Self {
        Self {
            conn: Some(conn),
            pool,
        }
    }
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.conn.as_ref().map(Connection::id))
            .field("endpoint", &self.conn.as_ref().map(Connection::endpoint))
            .finish()
    }
}

impl Deref for PooledConnection {
    type Target = Connection;

    fn deref(&self) -> &Connection {
        match &self.conn {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Connection {
        match &mut self.conn {
            Some(conn) => conn,
            None => unreachable!("connection taken before drop"),
        }
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock_server::MockServer;
    use crate::config::ClientConfig;
    use crate::protocol::OpaqueGenerator;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread;

    fn pool_for(server: &MockServer, min: usize, max: usize) -> ConnectionPool {
        let factory = ConnectionFactory::new(&ClientConfig::default(), Arc::new(OpaqueGenerator::new()));
        let config = PoolConfig {
            min_size: min,
            max_size: max,
            wait_timeout: Duration::from_millis(200),
            ..PoolConfig::default()
        };
        ConnectionPool::new("127.0.0.1", server.port(), factory, config)
    }

    #[test]
    fn test_prewarm_opens_min_size() {
        let server = MockServer::start();
        let pool = pool_for(&server, 2, 4);
        pool.prewarm().unwrap();
        assert_eq!(
            pool.stats(),
            PoolStats {
                total: 2,
                idle: 2,
                in_use: 0
            }
        );
    }

    #[test]
    fn test_third_acquire_waits_for_release() {
        let server = MockServer::start();
        let pool = pool_for(&server, 2, 2);
        pool.prewarm().unwrap();

        let first = pool.acquire(Duration::from_secs(1)).unwrap();
        let second = pool.acquire(Duration::from_secs(1)).unwrap();
        assert_ne!(first.id(), second.id());

        let (tx, rx) = mpsc::channel();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || {
                let conn = pool.acquire(Duration::from_secs(5)).unwrap();
                tx.send(conn.id()).unwrap();
            })
        };

        assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
        let released_id = first.id();
        pool.release(first);

        let got = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(got, released_id);
        waiter.join().unwrap();
        drop(second);
        assert_eq!(server.connections_accepted(), 2);
    }

    #[test]
    fn test_queue_timeout_at_cap() {
        let server = MockServer::start();
        let pool = pool_for(&server, 0, 1);
        let _held = pool.acquire(Duration::from_secs(1)).unwrap();

        let started = Instant::now();
        let err = pool.acquire(Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, KvError::QueueTimeout { .. }));
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(err.is_transient());
    }

    #[test]
    fn test_checked_out_never_exceeds_max() {
        let server = MockServer::start();
        let pool = pool_for(&server, 0, 3);
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let current = Arc::clone(&current);
                let peak = Arc::clone(&peak);
                thread::spawn(move || {
                    for _ in 0..20 {
                        let conn = pool.acquire(Duration::from_secs(5)).unwrap();
                        let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        current.fetch_sub(1, Ordering::SeqCst);
                        drop(conn);
                    }
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(pool.stats().total <= 3);
        assert!(server.connections_accepted() <= 3);
    }

    #[test]
    fn test_dead_connection_not_recycled() {
        let server = MockServer::start();
        let pool = pool_for(&server, 0, 2);
        let conn = pool.acquire(Duration::from_secs(1)).unwrap();
        let dead_id = conn.id();
        conn.mark_dead();
        drop(conn);
        assert_eq!(pool.stats().total, 0);

        let conn = pool.acquire(Duration::from_secs(1)).unwrap();
        assert_ne!(conn.id(), dead_id);
    }

    #[test]
    fn test_resurrect_replaces_connections() {
        let server = MockServer::start();
        let pool = pool_for(&server, 1, 2);
        pool.prewarm().unwrap();
        let before = pool.acquire(Duration::from_secs(1)).unwrap().id();

        pool.resurrect().unwrap();
        let after = pool.acquire(Duration::from_secs(1)).unwrap().id();
        assert_ne!(before, after);
        assert_eq!(pool.stats().total, 1);
    }

    #[test]
    fn test_dispose_force_closes_stragglers() {
        let server = MockServer::start();
        let pool = pool_for(&server, 1, 2);
        pool.prewarm().unwrap();
        let held = pool.acquire(Duration::from_secs(1)).unwrap();
        let handle = held.handle();

        pool.dispose();
        assert!(!handle.is_alive());
        assert!(matches!(
            pool.acquire(Duration::from_millis(10)),
            Err(KvError::PoolShutdown(_))
        ));

        drop(held);
        assert_eq!(pool.stats().total, 0);
    }

    #[test]
    fn test_dispose_waits_for_prompt_release() {
        let server = MockServer::start();
        let pool = pool_for(&server, 0, 1);
        let held = pool.acquire(Duration::from_secs(1)).unwrap();
        let handle = held.handle();

        let releaser = thread::spawn(move || {
            thread::sleep(Duration::from_millis(15));
            drop(held);
        });
        pool.dispose();
        releaser.join().unwrap();

        assert!(!handle.is_alive());
        assert_eq!(pool.stats().in_use, 0);
        assert_eq!(pool.stats().total, 0);
    }
}
