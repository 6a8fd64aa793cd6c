//! Storage farm broker
//!
//! The broker is the single registry of known storage servers. Announcements
//! arrive from the static servers file and from a discovery feed; both go
//! through [`StorageFarmBroker::got_announcement`], which creates a
//! [`StorageServer`] the first time an id is seen and updates it in place
//! afterwards. A server id maps to the same descriptor for the broker's
//! whole lifetime.
//!
//! # Readiness
//!
//! [`StorageFarmBroker::when_connected_enough`] returns a future that
//! resolves once at least `n` servers are connected. The connected count is
//! sampled when a server's connection changes and forwarded to a watcher task
//! over a channel, so a threshold reached only briefly still counts, and
//! waiters always resolve on a later scheduler turn than the event that
//! satisfied them.
//!
//! # Example
//!
//! ```rust,ignore
//! let broker = StorageFarmBroker::new(BrokerConfig::default(), registry, connector)?;
//! broker.set_static_servers(&StaticServers::load("private/servers.yaml")?);
//! broker.use_introducer(&feed);
//!
//! broker.when_connected_enough(3).await?;
//! let servers = broker.servers_for_psi(&storage_index);
//! ```

use crate::announcement::{Announcement, ServerId};
use crate::config::{BrokerConfig, StaticServers};
use crate::connection::Connector;
use crate::error::{FarmError, Result};
use crate::introducer::{DiscoveryFeed, STORAGE_SERVICE};
use crate::observability::{describe_metrics, BrokerMetrics};
use crate::placement;
use crate::protocol::ProtocolRegistry;
use crate::server::{ConnectionTrigger, ServerContext, StorageServer};
use crate::status::ConnectionStatus;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace};

/// Events processed by the watcher task
#[derive(Debug)]
enum BrokerEvent {
    /// A server connected or disconnected; `connected` is the count right after
    ConnectionChanged {
        server_id: ServerId,
        seq: u64,
        connected: usize,
    },
    /// A threshold waiter was registered while `connected` servers were up
    WaiterAdded { seq: u64, connected: usize },
}

impl BrokerEvent {
    fn sample(&self) -> (u64, usize) {
        match self {
            BrokerEvent::ConnectionChanged { seq, connected, .. }
            | BrokerEvent::WaiterAdded { seq, connected } => (*seq, *connected),
        }
    }
}

struct Waiter {
    threshold: usize,
    /// Only samples taken at or after registration apply
    seq: u64,
    tx: oneshot::Sender<()>,
}

// ============================================================================
// Connected-enough future
// ============================================================================

/// Resolves once the broker has at least `threshold` connected servers.
///
/// Fails with [`FarmError::ShuttingDown`] if the broker shuts down first.
/// Never resolves if the threshold is never reached.
#[derive(Debug)]
#[must_use = "futures do nothing unless polled"]
pub struct ConnectedEnough {
    threshold: usize,
    rx: oneshot::Receiver<()>,
}

impl ConnectedEnough {
    pub fn threshold(&self) -> usize {
        self.threshold
    }
}

impl Future for ConnectedEnough {
    type Output = Result<()>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.get_mut().rx)
            .poll(cx)
            .map(|r| r.map_err(FarmError::from))
    }
}

// ============================================================================
// Broker
// ============================================================================

struct BrokerShared {
    config: BrokerConfig,
    context: ServerContext,
    servers: DashMap<ServerId, Arc<StorageServer>>,
    static_server_ids: RwLock<BTreeSet<ServerId>>,
    waiters: Mutex<Vec<Waiter>>,
    events: mpsc::UnboundedSender<BrokerEvent>,
    seq: AtomicU64,
    high_water_mark: AtomicUsize,
    shutting_down: AtomicBool,
}

/// Registry of known storage servers
pub struct StorageFarmBroker {
    shared: Arc<BrokerShared>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl StorageFarmBroker {
    /// Create a broker.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: BrokerConfig,
        registry: ProtocolRegistry,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        config.validate()?;
        describe_metrics();

        let context = ServerContext::new(Arc::new(registry), connector)
            .with_reconnect(config.reconnect.clone());
        let (events, rx) = mpsc::unbounded_channel();

        let shared = Arc::new(BrokerShared {
            config,
            context,
            servers: DashMap::new(),
            static_server_ids: RwLock::new(BTreeSet::new()),
            waiters: Mutex::new(Vec::new()),
            events,
            seq: AtomicU64::new(0),
            high_water_mark: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
        });

        let watcher = tokio::spawn(watch(Arc::downgrade(&shared), rx));

        Ok(Self {
            shared,
            watcher: Mutex::new(Some(watcher)),
        })
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.shared.config
    }

    // ---- Ingestion ----

    /// Load statically configured servers.
    ///
    /// May be called again; known ids are updated in place and the static id
    /// set is replaced.
    pub fn set_static_servers(&self, servers: &StaticServers) {
        let ids: BTreeSet<ServerId> = servers.announcements().map(|(id, _)| id).collect();
        info!(count = ids.len(), "loading static storage servers");
        *self.shared.static_server_ids.write() = ids;

        for (server_id, ann) in servers.announcements() {
            self.shared.got_announcement(server_id, ann.clone());
        }
    }

    /// Subscribe to storage announcements from a discovery feed
    pub fn use_introducer(&self, feed: &dyn DiscoveryFeed) {
        let shared = Arc::downgrade(&self.shared);
        feed.subscribe_to(
            STORAGE_SERVICE,
            Arc::new(move |server_id, ann| {
                if let Some(shared) = shared.upgrade() {
                    shared.got_announcement(server_id, ann);
                }
            }),
        );
        debug!(service = STORAGE_SERVICE, "subscribed to discovery feed");
    }

    /// Handle one announcement
    pub fn got_announcement(&self, server_id: ServerId, ann: Announcement) {
        self.shared.got_announcement(server_id, ann);
    }

    // ---- Readiness ----

    /// Future resolving once `threshold` servers are connected
    pub fn when_connected_enough(&self, threshold: usize) -> ConnectedEnough {
        let (tx, rx) = oneshot::channel();
        if !self.shared.shutting_down.load(Ordering::SeqCst) {
            let (event, pending) = {
                let mut waiters = self.shared.waiters.lock();
                let seq = self.shared.next_seq();
                waiters.push(Waiter { threshold, seq, tx });
                let connected = self.shared.connected_count();
                (BrokerEvent::WaiterAdded { seq, connected }, waiters.len())
            };
            BrokerMetrics::set_pending_waiters(pending);
            let _ = self.shared.events.send(event);
        }
        ConnectedEnough { threshold, rx }
    }

    // ---- Accessors ----

    /// Snapshot of every known server
    pub fn servers(&self) -> BTreeMap<ServerId, Arc<StorageServer>> {
        self.shared
            .servers
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect()
    }

    pub fn get_server(&self, server_id: &ServerId) -> Option<Arc<StorageServer>> {
        self.shared.servers.get(server_id).map(|e| Arc::clone(e.value()))
    }

    /// Known servers ordered by id
    pub fn get_known_servers(&self) -> Vec<Arc<StorageServer>> {
        self.servers().into_values().collect()
    }

    /// Connected servers ordered by id
    pub fn get_connected_servers(&self) -> Vec<Arc<StorageServer>> {
        self.get_known_servers()
            .into_iter()
            .filter(|s| s.is_connected())
            .collect()
    }

    pub fn get_all_server_ids(&self) -> BTreeSet<ServerId> {
        self.shared.servers.iter().map(|e| e.key().clone()).collect()
    }

    pub fn get_nickname_for(&self, server_id: &ServerId) -> Option<String> {
        self.get_server(server_id).map(|s| s.get_nickname())
    }

    pub fn static_server_ids(&self) -> BTreeSet<ServerId> {
        self.shared.static_server_ids.read().clone()
    }

    pub fn static_server_count(&self) -> usize {
        self.shared.static_server_ids.read().len()
    }

    pub fn connected_count(&self) -> usize {
        self.shared.connected_count()
    }

    /// Most servers ever connected at once
    pub fn connected_high_water_mark(&self) -> usize {
        self.shared.high_water_mark.load(Ordering::SeqCst)
    }

    /// Connection status of every known server
    pub fn connection_statuses(&self) -> BTreeMap<ServerId, ConnectionStatus> {
        self.shared
            .servers
            .iter()
            .map(|e| (e.key().clone(), e.value().get_connection_status()))
            .collect()
    }

    /// Connected servers in the order to use them for one file
    pub fn servers_for_psi(&self, peer_selection_index: &[u8]) -> Vec<Arc<StorageServer>> {
        placement::servers_for_psi(
            self.get_connected_servers(),
            peer_selection_index,
            &self.shared.config,
        )
    }

    // ---- Lifecycle ----

    /// Stop every server and fail pending waiters. Idempotent.
    pub fn shutdown(&self) {
        if self.shared.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!(servers = self.shared.servers.len(), "shutting down storage farm broker");

        for server in self.get_known_servers() {
            server.stop_connecting();
        }
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        // dropping the senders fails the waiters with ShuttingDown
        self.shared.waiters.lock().clear();
        BrokerMetrics::set_pending_waiters(0);
    }
}

impl Drop for StorageFarmBroker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BrokerShared {
    fn got_announcement(self: &Arc<Self>, server_id: ServerId, ann: Announcement) {
        if self.shutting_down.load(Ordering::SeqCst) {
            trace!(server_id = %server_id, "ignoring announcement after shutdown");
            return;
        }
        BrokerMetrics::increment_announcements();

        let existing = self.servers.get(&server_id).map(|e| Arc::clone(e.value()));
        if let Some(server) = existing {
            debug!(server_id = %server_id, "updating announcement");
            server.update_announcement(ann);
            return;
        }

        // plugins run here, outside any map lock
        let candidate = Arc::new(StorageServer::new(
            server_id.clone(),
            ann.clone(),
            self.context.clone(),
        ));

        let server = match self.servers.entry(server_id) {
            Entry::Occupied(entry) => {
                let server = Arc::clone(entry.get());
                drop(entry);
                debug!(server_id = %server.server_id(), "lost insertion race, updating announcement");
                server.update_announcement(ann);
                return;
            }
            Entry::Vacant(entry) => {
                info!(server_id = %entry.key(), "new storage server announced");
                entry.insert(Arc::clone(&candidate));
                candidate
            }
        };

        BrokerMetrics::set_servers_known(self.servers.len());
        server.start_connecting(self.trigger());
    }

    fn trigger(self: &Arc<Self>) -> ConnectionTrigger {
        let shared = Arc::downgrade(self);
        ConnectionTrigger::new(move |server_id| {
            if let Some(shared) = shared.upgrade() {
                shared.connection_changed(server_id);
            }
        })
    }

    /// Sample the connected count at the moment a server's state changed
    fn connection_changed(&self, server_id: &ServerId) {
        let seq = self.next_seq();
        let connected = self.connected_count();
        self.high_water_mark.fetch_max(connected, Ordering::SeqCst);
        BrokerMetrics::set_servers_connected(connected);

        let _ = self.events.send(BrokerEvent::ConnectionChanged {
            server_id: server_id.clone(),
            seq,
            connected,
        });
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst)
    }

    fn connected_count(&self) -> usize {
        self.servers.iter().filter(|e| e.value().is_connected()).count()
    }

    fn check_waiters(&self, seq: u64, connected: usize) {
        let (ready, pending) = {
            let mut waiters = self.waiters.lock();
            let (ready, pending): (Vec<_>, Vec<_>) = std::mem::take(&mut *waiters)
                .into_iter()
                .partition(|w| w.seq <= seq && connected >= w.threshold);
            *waiters = pending;
            (ready, waiters.len())
        };
        BrokerMetrics::set_pending_waiters(pending);

        for waiter in ready {
            debug!(threshold = waiter.threshold, connected, "connected enough");
            if waiter.tx.send(()).is_ok() {
                BrokerMetrics::increment_waiters_fired();
            }
        }
    }
}

async fn watch(shared: Weak<BrokerShared>, mut rx: mpsc::UnboundedReceiver<BrokerEvent>) {
    while let Some(event) = rx.recv().await {
        let (seq, connected) = event.sample();
        match &event {
            BrokerEvent::ConnectionChanged { server_id, .. } => {
                trace!(server_id = %server_id, connected, "connection changed")
            }
            BrokerEvent::WaiterAdded { .. } => trace!(connected, "waiter added"),
        }
        let Some(shared) = shared.upgrade() else {
            break;
        };
        shared.check_waiters(seq, connected);
    }
}
