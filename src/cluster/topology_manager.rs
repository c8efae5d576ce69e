//! Cluster topology tracker
//!
//! Holds the current [`Topology`] behind a single swappable `Arc`. Every
//! source of cluster maps (bootstrap, the poller, maps pushed inside
//! NotMyVbucket responses, forced refreshes) funnels into [`TopologyManager::update`],
//! which only ever moves the revision forward.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use super::config_map::{ClusterMap, NodeAddress};
use super::key_mapper::KeyMapper;
use super::node::ClusterNode;
use super::topology::Topology;
use crate::client::raw_connection::ConnectionFactory;
use crate::config::{ClientConfig, LocatorMode, PoolConfig, ServerAddress};
use crate::utils::{ClusterError, ConnectionError, KvError, Result};

/// How often the poller checks whether it should stop
const POLL_TICK: Duration = Duration::from_millis(50);

/// Shared topology tracker
pub struct TopologyManager {
    current: RwLock<Arc<Topology>>,
    /// Serializes writers; readers never take it
    update_lock: Mutex<()>,
    factory: ConnectionFactory,
    pool_config: PoolConfig,
    seeds: Vec<ServerAddress>,
    fetch_timeout: Duration,
    /// Whether a refresh is in progress (prevents concurrent refreshes)
    is_refreshing: AtomicBool,
    subscribers: Mutex<Vec<mpsc::Sender<u64>>>,
    poller: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl TopologyManager {
    /// Fetch the first cluster map from the seeds and start tracking it
    pub fn bootstrap(config: &ClientConfig, factory: ConnectionFactory) -> Result<Arc<Self>> {
        let map = Self::fetch_initial_map(config, &factory)?;
        let manager = Self::from_map(map, factory, config.pool.clone(), config.seeds.clone(), config.connect_timeout)?;
        if let Some(interval) = config.config_poll_interval {
            manager.start_polling(interval);
        }
        Ok(manager)
    }

    /// Track an already known map without polling
    pub fn from_map(
        map: ClusterMap,
        factory: ConnectionFactory,
        pool_config: PoolConfig,
        seeds: Vec<ServerAddress>,
        fetch_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let mapper = Arc::new(KeyMapper::from_map(&map)?);
        let nodes = map
            .nodes
            .iter()
            .map(|addr| Self::spawn_node(addr, &factory, &pool_config))
            .collect();
        info!(
            "Bootstrapped bucket '{}' at rev {} with {} nodes ({:?})",
            map.bucket,
            map.revision,
            map.nodes.len(),
            map.locator
        );
        let topology = Topology::new(map, nodes, mapper);

        Ok(Arc::new(Self {
            current: RwLock::new(Arc::new(topology)),
            update_lock: Mutex::new(()),
            factory,
            pool_config,
            seeds,
            fetch_timeout,
            is_refreshing: AtomicBool::new(false),
            subscribers: Mutex::new(Vec::new()),
            poller: Mutex::new(None),
            closed: AtomicBool::new(false),
        }))
    }

    fn fetch_initial_map(config: &ClientConfig, factory: &ConnectionFactory) -> Result<ClusterMap> {
        let seed_nodes = || {
            config
                .seeds
                .iter()
                .map(|s| NodeAddress::new(s.host.clone(), s.port))
                .collect::<Vec<_>>()
        };

        if config.locator == LocatorMode::Ketama {
            return Ok(ClusterMap::static_ketama(&config.bucket, seed_nodes()));
        }

        let mut failures = Vec::new();
        let mut config_unsupported = false;
        for seed in &config.seeds {
            let deadline = Instant::now() + config.connect_timeout;
            let fetched = factory
                .create(&seed.host, seed.port)
                .and_then(|mut conn| conn.fetch_cluster_config(deadline));

            match fetched {
                Ok(Some(json)) => match ClusterMap::parse_bytes(&json, &seed.host) {
                    Ok(map) => return Ok(map),
                    Err(e) => failures.push(format!("{}: {}", seed, e)),
                },
                Ok(None) => {
                    config_unsupported = true;
                    failures.push(format!("{}: no cluster map", seed));
                }
                Err(e @ KvError::Connection(ConnectionError::AuthFailed(_)))
                | Err(e @ KvError::Connection(ConnectionError::SelectBucketFailed(_))) => {
                    return Err(e);
                }
                Err(e) => {
                    warn!("Bootstrap from {} failed: {}", seed, e);
                    failures.push(format!("{}: {}", seed, e));
                }
            }
        }

        if config_unsupported {
            info!(
                "Seeds cannot serve a cluster map, hashing over {} seeds with ketama",
                config.seeds.len()
            );
            return Ok(ClusterMap::static_ketama(&config.bucket, seed_nodes()));
        }
        Err(ClusterError::BootstrapFailed(failures.join("; ")).into())
    }

    fn spawn_node(addr: &NodeAddress, factory: &ConnectionFactory, pool_config: &PoolConfig) -> Arc<ClusterNode> {
        let node = Arc::new(ClusterNode::new(addr.clone(), factory.clone(), pool_config.clone()));
        if pool_config.min_size > 0 {
            let warming = Arc::clone(&node);
            thread::spawn(move || warming.prewarm());
        }
        node
    }

    /// Current snapshot
    pub fn current(&self) -> Arc<Topology> {
        Arc::clone(&self.current.read())
    }

    pub fn revision(&self) -> u64 {
        self.current.read().revision()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Apply a cluster map; returns true if it replaced the current snapshot
    ///
    /// Maps at or below the current revision are ignored. Nodes present in
    /// both revisions keep their pools; removed nodes are disposed on a
    /// background thread.
    pub fn update(&self, map: ClusterMap) -> bool {
        if self.is_closed() {
            return false;
        }
        let _serial = self.update_lock.lock();
        let previous = self.current();
        if map.revision <= previous.revision() {
            debug!(
                "Ignoring cluster map rev {} (current rev {})",
                map.revision,
                previous.revision()
            );
            return false;
        }

        let mapper = match KeyMapper::from_map(&map) {
            Ok(mapper) if mapper == **previous.mapper() => Arc::clone(previous.mapper()),
            Ok(mapper) => Arc::new(mapper),
            Err(e) => {
                warn!("Rejecting cluster map rev {}: {}", map.revision, e);
                return false;
            }
        };

        let nodes: Vec<Arc<ClusterNode>> = map
            .nodes
            .iter()
            .map(|addr| match previous.node_by_address(addr) {
                Some(existing) => Arc::clone(existing),
                None => Self::spawn_node(addr, &self.factory, &self.pool_config),
            })
            .collect();
        let removed: Vec<Arc<ClusterNode>> = previous
            .nodes()
            .iter()
            .filter(|old| !nodes.iter().any(|n| Arc::ptr_eq(n, old)))
            .cloned()
            .collect();

        let revision = map.revision;
        let node_count = nodes.len();
        let added = nodes
            .iter()
            .filter(|n| previous.node_by_address(n.address()).is_none())
            .count();
        let remapped = !Arc::ptr_eq(&mapper, previous.mapper());
        let topology = Arc::new(Topology::new(map, nodes, mapper));
        *self.current.write() = topology;

        info!(
            "Cluster map rev {} -> {}: {} nodes (+{} -{}), mapping {}",
            previous.revision(),
            revision,
            node_count,
            added,
            removed.len(),
            if remapped { "rebuilt" } else { "unchanged" }
        );

        if !removed.is_empty() {
            thread::spawn(move || {
                for node in removed {
                    debug!("Disposing removed node {}", node.endpoint());
                    node.dispose();
                }
            });
        }

        self.subscribers.lock().retain(|tx| tx.send(revision).is_ok());
        true
    }

    /// Apply a map in JSON form, e.g. the body of a NotMyVbucket response
    pub fn update_from_json(&self, json: &[u8], source_host: &str) -> bool {
        match ClusterMap::parse_bytes(json, source_host) {
            Ok(map) => self.update(map),
            Err(e) => {
                debug!("Ignoring unparsable cluster map from {}: {}", source_host, e);
                false
            }
        }
    }

    /// Be told the new revision after every swap
    pub fn subscribe(&self) -> mpsc::Receiver<u64> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Fetch a map from the cluster now
    ///
    /// Uses compare-and-swap to ensure only one thread refreshes; returns
    /// true if a newer revision was applied.
    pub fn refresh_now(&self) -> bool {
        if self
            .is_refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let result = self.do_refresh();
        self.is_refreshing.store(false, Ordering::SeqCst);
        result
    }

    /// Refresh on a background thread unless one is already running
    pub fn request_refresh(self: &Arc<Self>) {
        if self.is_refreshing.load(Ordering::SeqCst) || self.is_closed() {
            return;
        }
        let manager = Arc::clone(self);
        thread::spawn(move || {
            manager.refresh_now();
        });
    }

    fn do_refresh(&self) -> bool {
        let topology = self.current();

        // live nodes first, then the rest, then seeds that are not members
        let mut candidates: Vec<&Arc<ClusterNode>> = topology.nodes().iter().collect();
        candidates.sort_by_key(|n| !n.is_alive());

        for node in candidates {
            let deadline = Instant::now() + self.fetch_timeout;
            let fetched = node
                .pool()
                .acquire(self.pool_config.wait_timeout.min(self.fetch_timeout))
                .and_then(|mut conn| conn.fetch_cluster_config(deadline));
            match fetched {
                Ok(Some(json)) => {
                    node.mark_alive();
                    return self.update_from_json(&json, node.host());
                }
                Ok(None) => return false,
                Err(e) => {
                    if matches!(e, KvError::Connection(ConnectionError::ConnectFailed { .. })) {
                        node.mark_dead();
                    }
                    debug!("Config fetch from {} failed: {}", node.endpoint(), e);
                }
            }
        }

        for seed in &self.seeds {
            let addr = NodeAddress::new(seed.host.clone(), seed.port);
            if topology.node_by_address(&addr).is_some() {
                continue;
            }
            let deadline = Instant::now() + self.fetch_timeout;
            let fetched = self
                .factory
                .create(&seed.host, seed.port)
                .and_then(|mut conn| conn.fetch_cluster_config(deadline));
            if let Ok(Some(json)) = fetched {
                return self.update_from_json(&json, &seed.host);
            }
        }

        warn!("Failed to refresh cluster map from any node");
        false
    }

    /// Poll for new maps every `interval` until closed
    pub fn start_polling(self: &Arc<Self>, interval: Duration) {
        let weak = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name("cbkv-config-poller".to_string())
            .spawn(move || loop {
                let wake = Instant::now() + interval;
                while Instant::now() < wake {
                    thread::sleep(POLL_TICK.min(wake.saturating_duration_since(Instant::now())));
                    match weak.upgrade() {
                        Some(m) if !m.is_closed() => {}
                        _ => return,
                    }
                }
                match weak.upgrade() {
                    Some(m) if !m.is_closed() => {
                        m.refresh_now();
                    }
                    _ => return,
                }
            });

        match spawned {
            Ok(handle) => *self.poller.lock() = Some(handle),
            Err(e) => warn!("Could not start cluster map poller: {}", e),
        }
    }

    /// Stop polling and dispose every node's pool
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self.poller.lock().take() {
            if handle.thread().id() != thread::current().id() {
                handle.join().ok();
            }
        }
        self.subscribers.lock().clear();

        let topology = self.current();
        for node in topology.nodes() {
            node.dispose();
        }
        info!("Topology tracker closed at rev {}", topology.revision());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::mock_server::MockServer;
    use crate::cluster::config_map::{Locator, VBucketTable};
    use crate::protocol::OpaqueGenerator;

    fn factory() -> ConnectionFactory {
        ConnectionFactory::new(&ClientConfig::default(), Arc::new(OpaqueGenerator::new()))
    }

    fn offline_pool() -> PoolConfig {
        PoolConfig {
            min_size: 0,
            ..PoolConfig::default()
        }
    }

    fn map(revision: u64, ports: &[u16], entries: Vec<Vec<i16>>) -> ClusterMap {
        ClusterMap {
            revision,
            bucket: "default".into(),
            locator: Locator::VBucket,
            nodes: ports.iter().map(|p| NodeAddress::new("127.0.0.1", *p)).collect(),
            vbuckets: Some(VBucketTable {
                num_replicas: 1,
                entries,
            }),
        }
    }

    fn manager(initial: ClusterMap) -> Arc<TopologyManager> {
        TopologyManager::from_map(initial, factory(), offline_pool(), vec![], Duration::from_millis(200)).unwrap()
    }

    #[test]
    fn test_same_or_older_revision_is_noop() {
        let tracker = manager(map(5, &[1, 2], vec![vec![0, 1], vec![1, 0]]));
        let before = tracker.current();

        assert!(!tracker.update(map(5, &[1, 2], vec![vec![1, 0], vec![0, 1]])));
        assert!(!tracker.update(map(4, &[3], vec![vec![0]])));

        let after = tracker.current();
        assert!(Arc::ptr_eq(&before, &after));
        assert_eq!(after.revision(), 5);
    }

    #[test]
    fn test_metadata_only_change_keeps_mapper_and_nodes() {
        let tracker = manager(map(1, &[1, 2], vec![vec![0, 1], vec![1, 0]]));
        let before = tracker.current();

        assert!(tracker.update(map(2, &[1, 2], vec![vec![0, 1], vec![1, 0]])));
        let after = tracker.current();
        assert_eq!(after.revision(), 2);
        assert!(Arc::ptr_eq(before.mapper(), after.mapper()));
        for (old, new) in before.nodes().iter().zip(after.nodes()) {
            assert!(Arc::ptr_eq(old, new));
        }
    }

    #[test]
    fn test_changed_map_rebuilds_mapper() {
        let tracker = manager(map(1, &[1, 2], vec![vec![0, 1], vec![1, 0]]));
        let before = tracker.current();
        assert!(tracker.update(map(2, &[1, 2], vec![vec![1, 0], vec![1, 0]])));
        assert!(!Arc::ptr_eq(before.mapper(), tracker.current().mapper()));
    }

    #[test]
    fn test_removed_node_disposed_in_background() {
        let tracker = manager(map(1, &[1, 2], vec![vec![0, 1], vec![1, 0]]));
        let leaving = Arc::clone(&tracker.current().nodes()[1]);

        assert!(tracker.update(map(2, &[1], vec![vec![0, -1], vec![0, -1]])));
        assert_eq!(tracker.current().num_nodes(), 1);

        let deadline = Instant::now() + Duration::from_secs(2);
        while !leaving.pool().is_shutdown() {
            assert!(Instant::now() < deadline, "removed node was not disposed");
            thread::sleep(Duration::from_millis(5));
        }
    }

    #[test]
    fn test_subscribers_hear_new_revision() {
        let tracker = manager(map(1, &[1], vec![vec![0]]));
        let rx = tracker.subscribe();
        tracker.update(map(1, &[1], vec![vec![0]]));
        tracker.update(map(3, &[1], vec![vec![0]]));
        assert_eq!(rx.recv_timeout(Duration::from_secs(1)).unwrap(), 3);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_update_from_json_resolves_host_placeholder() {
        let tracker = manager(map(1, &[1], vec![vec![0]]));
        let json = r#"{"rev": 9, "name": "default", "nodeLocator": "vbucket",
            "vBucketServerMap": {"numReplicas": 0, "serverList": ["$HOST:1"], "vBucketMap": [[0]]}}"#;
        assert!(tracker.update_from_json(json.as_bytes(), "127.0.0.1"));
        assert!(!tracker.update_from_json(b"{broken", "127.0.0.1"));

        let current = tracker.current();
        assert_eq!(current.revision(), 9);
        assert_eq!(current.nodes()[0].endpoint(), "127.0.0.1:1");
    }

    #[test]
    fn test_concurrent_updates_end_at_highest_revision() {
        let tracker = manager(map(1, &[1], vec![vec![0]]));
        let workers: Vec<_> = (2..=20u64)
            .map(|rev| {
                let tracker = Arc::clone(&tracker);
                thread::spawn(move || {
                    tracker.update(map(rev, &[1], vec![vec![0]]));
                })
            })
            .collect();
        for w in workers {
            w.join().unwrap();
        }
        assert_eq!(tracker.revision(), 20);
    }

    #[test]
    fn test_bootstrap_from_mock_and_refresh() {
        let server = MockServer::start();
        let mut config = ClientConfig::default();
        config.seeds = vec![ServerAddress::new("127.0.0.1", server.port())];
        config.config_poll_interval = None;

        let tracker = TopologyManager::bootstrap(&config, factory()).unwrap();
        assert_eq!(tracker.revision(), 1);
        assert_eq!(tracker.current().locator(), Locator::VBucket);

        server.set_config(MockServer::vbucket_config(4, &[server.port()], 64));
        assert!(tracker.refresh_now());
        assert_eq!(tracker.revision(), 4);
        tracker.close();
    }

    #[test]
    fn test_bootstrap_falls_back_to_ketama() {
        let server = MockServer::start_memcached();
        let mut config = ClientConfig::default();
        config.seeds = vec![ServerAddress::new("127.0.0.1", server.port())];
        config.config_poll_interval = None;

        let tracker = TopologyManager::bootstrap(&config, factory()).unwrap();
        assert_eq!(tracker.current().locator(), Locator::Ketama);
        assert_eq!(tracker.revision(), 0);
        tracker.close();
    }

    #[test]
    fn test_bootstrap_fails_without_reachable_seed() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut config = ClientConfig::default();
        config.seeds = vec![ServerAddress::new("127.0.0.1", port)];

        match TopologyManager::bootstrap(&config, factory()) {
            Err(KvError::Cluster(ClusterError::BootstrapFailed(msg))) => {
                assert!(msg.contains(&port.to_string()))
            }
            other => panic!("expected bootstrap failure, got {:?}", other.map(|t| t.revision())),
        }
    }

    #[test]
    fn test_poller_picks_up_new_revision() {
        let server = MockServer::start();
        let mut config = ClientConfig::default();
        config.seeds = vec![ServerAddress::new("127.0.0.1", server.port())];
        config.config_poll_interval = Some(Duration::from_millis(20));

        let tracker = TopologyManager::bootstrap(&config, factory()).unwrap();
        let rx = tracker.subscribe();
        server.set_config(MockServer::vbucket_config(2, &[server.port()], 64));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 2);
        tracker.close();
        assert!(tracker.is_closed());
    }
}
