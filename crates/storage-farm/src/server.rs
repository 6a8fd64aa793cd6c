//! Storage server descriptor
//!
//! A [`StorageServer`] is created the first time the broker sees a server id
//! and lives as long as the broker. It owns:
//!
//! - the permutation seed, derived once at creation and never replaced
//! - the latest announcement, replaced wholesale on re-announcement
//! - the matched protocol client, re-matched only while it is the placeholder
//! - one background connection task while started
//!
//! # State machine
//!
//! ```text
//!   Idle ──start──▶ Connecting ──connected──▶ Connected
//!                      ▲  │                      │
//!                      │  └──failed: backoff─┐   │
//!                      │◀────────────────────┘   │
//!                      └──────────lost───────────┘
//!   any ──stop──▶ Stopped ──start──▶ Connecting
//! ```
//!
//! Accessors never fail; they report the last known state.

use crate::announcement::{Announcement, Furl, ServerId};
use crate::config::ReconnectConfig;
use crate::connection::{ConnectionInfo, Connector, ServerReference};
use crate::observability::BrokerMetrics;
use crate::protocol::{LiveReference, MatchKind, MatchedProtocol, ProtocolRegistry, StorageClient};
use crate::reconnect::Backoff;
use crate::seed::{PermutationSeed, SeedSource};
use crate::status::{ConnectionState, ConnectionStatus};
use crate::version::ServerVersion;
use bytes::Bytes;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ============================================================================
// Connection trigger
// ============================================================================

/// Callback invoked whenever a server gains or loses its connection
#[derive(Clone)]
pub struct ConnectionTrigger(Arc<dyn Fn(&ServerId) + Send + Sync>);

impl ConnectionTrigger {
    pub fn new(f: impl Fn(&ServerId) + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }

    pub fn noop() -> Self {
        Self::new(|_| {})
    }

    pub(crate) fn fire(&self, server_id: &ServerId) {
        (self.0)(server_id)
    }
}

impl Default for ConnectionTrigger {
    fn default() -> Self {
        Self::noop()
    }
}

impl fmt::Debug for ConnectionTrigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ConnectionTrigger")
    }
}

// ============================================================================
// Server context
// ============================================================================

/// Collaborators shared by all descriptors of one broker
#[derive(Clone)]
pub struct ServerContext {
    pub registry: Arc<ProtocolRegistry>,
    pub connector: Arc<dyn Connector>,
    pub reconnect: ReconnectConfig,
}

impl ServerContext {
    pub fn new(registry: Arc<ProtocolRegistry>, connector: Arc<dyn Connector>) -> Self {
        Self {
            registry,
            connector,
            reconnect: ReconnectConfig::default(),
        }
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }
}

impl fmt::Debug for ServerContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerContext")
            .field("registry", &self.registry)
            .field("reconnect", &self.reconnect)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Descriptor
// ============================================================================

struct ServerState {
    announcement: Announcement,
    protocol: MatchedProtocol,
    connection: ConnectionState,
    trigger: ConnectionTrigger,
    task: Option<JoinHandle<()>>,
    /// Bumped on every start and stop; stale tasks see a mismatch and exit
    generation: u64,
    version: Option<ServerVersion>,
    connection_info: Option<ConnectionInfo>,
    last_connection_time: Option<SystemTime>,
    last_attempt: Option<Instant>,
    next_attempt: Option<Instant>,
}

struct Shared {
    server_id: ServerId,
    context: ServerContext,
    reference: LiveReference,
    wake: Notify,
    state: Mutex<ServerState>,
}

/// One storage server known to the broker
pub struct StorageServer {
    server_id: ServerId,
    seed: PermutationSeed,
    seed_source: SeedSource,
    shared: Arc<Shared>,
}

impl StorageServer {
    /// Create a descriptor from the first announcement seen for `server_id`.
    ///
    /// An announcement whose explicit permutation seed does not decode is
    /// malformed: the server gets the placeholder protocol and an id-derived
    /// seed.
    pub fn new(server_id: ServerId, ann: Announcement, context: ServerContext) -> Self {
        let reference = LiveReference::new();
        let (seed, seed_source, protocol) = match PermutationSeed::derive(&server_id, &ann) {
            Ok((seed, source)) => {
                let protocol =
                    context
                        .registry
                        .match_announcement(&server_id, &ann, reference.clone());
                (seed, source, protocol)
            }
            Err(e) => {
                warn!(server_id = %server_id, error = %e, "ignoring malformed announcement");
                let (seed, source) = PermutationSeed::derive_from_id(&server_id);
                (seed, source, MatchedProtocol::placeholder())
            }
        };

        debug!(
            server_id = %server_id,
            protocol = %protocol.client.protocol(),
            seed_source = ?seed_source,
            "created storage server"
        );

        Self {
            server_id: server_id.clone(),
            seed,
            seed_source,
            shared: Arc::new(Shared {
                server_id,
                context,
                reference,
                wake: Notify::new(),
                state: Mutex::new(ServerState {
                    announcement: ann,
                    protocol,
                    connection: ConnectionState::Idle,
                    trigger: ConnectionTrigger::noop(),
                    task: None,
                    generation: 0,
                    version: None,
                    connection_info: None,
                    last_connection_time: None,
                    last_attempt: None,
                    next_attempt: None,
                }),
            }),
        }
    }

    /// Replace the stored announcement.
    ///
    /// The permutation seed never changes. Protocol matching runs again only
    /// if the server is still on the placeholder.
    pub fn update_announcement(&self, ann: Announcement) {
        let mut state = self.shared.state.lock();
        state.announcement = ann;

        if !state.protocol.is_placeholder() {
            return;
        }
        if PermutationSeed::derive(&self.server_id, &state.announcement).is_err() {
            warn!(server_id = %self.server_id, "ignoring malformed re-announcement");
            return;
        }

        let matched = self.shared.context.registry.match_announcement(
            &self.server_id,
            &state.announcement,
            self.shared.reference.clone(),
        );
        if matched.is_placeholder() {
            return;
        }

        info!(
            server_id = %self.server_id,
            protocol = %matched.client.protocol(),
            "re-announcement offers a usable storage protocol"
        );
        state.protocol = matched;
        if state.connection == ConnectionState::Connecting && state.task.is_none() {
            self.shared.spawn_connection(&mut state);
        }
    }

    // ---- Lifecycle ----

    /// Begin connecting, retrying forever until stopped.
    ///
    /// `trigger` runs on every connect and disconnect. Has no effect if the
    /// server is already connecting or connected.
    ///
    /// # Panics
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start_connecting(&self, trigger: ConnectionTrigger) {
        let mut state = self.shared.state.lock();
        if state.connection.is_active() {
            debug!(server_id = %self.server_id, "already connecting");
            return;
        }
        state.trigger = trigger;
        state.connection = ConnectionState::Connecting;
        self.shared.spawn_connection(&mut state);
    }

    /// Halt connection attempts and drop any live connection.
    ///
    /// Repeated calls are no-ops.
    pub fn stop_connecting(&self) {
        let trigger = {
            let mut state = self.shared.state.lock();
            if state.connection == ConnectionState::Stopped {
                return;
            }
            state.generation += 1;
            if let Some(task) = state.task.take() {
                task.abort();
            }
            let was_connected = state.connection.is_connected();
            state.connection = ConnectionState::Stopped;
            state.connection_info = None;
            state.next_attempt = None;
            self.shared.reference.set(None);
            was_connected.then(|| state.trigger.clone())
        };

        debug!(server_id = %self.server_id, "stopped connecting");
        if let Some(trigger) = trigger {
            trigger.fire(&self.server_id);
        }
    }

    /// Skip the remaining backoff delay and attempt now.
    ///
    /// Only a task currently waiting out a delay is woken; nothing carries
    /// over to later delays.
    pub fn try_to_connect(&self) {
        let state = self.shared.state.lock();
        if state.connection == ConnectionState::Connecting && state.next_attempt.is_some() {
            self.shared.wake.notify_waiters();
        }
    }

    // ---- Accessors ----

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn get_permutation_seed(&self) -> &PermutationSeed {
        &self.seed
    }

    pub fn seed_source(&self) -> SeedSource {
        self.seed_source
    }

    /// Abbreviated name for display
    pub fn get_name(&self) -> String {
        self.server_id.short_name()
    }

    /// Full server id as text
    pub fn get_longname(&self) -> String {
        self.server_id.to_text()
    }

    /// Announced nickname, or empty
    pub fn get_nickname(&self) -> String {
        self.shared
            .state
            .lock()
            .announcement
            .nickname
            .clone()
            .unwrap_or_default()
    }

    pub fn get_announcement(&self) -> Announcement {
        self.shared.state.lock().announcement.clone()
    }

    pub fn get_storage_client(&self) -> Arc<dyn StorageClient> {
        Arc::clone(&self.shared.state.lock().protocol.client)
    }

    pub fn protocol_kind(&self) -> MatchKind {
        self.shared.state.lock().protocol.kind.clone()
    }

    /// Endpoint handed to the connector, if any
    pub fn endpoint(&self) -> Option<String> {
        self.shared.state.lock().protocol.endpoint.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.shared.state.lock().connection
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state().is_connected()
    }

    /// Live reference while connected
    pub fn get_reference(&self) -> Option<Arc<dyn ServerReference>> {
        self.shared.reference.get()
    }

    pub fn get_connection_status(&self) -> ConnectionStatus {
        let state = self.shared.state.lock();
        match state.connection {
            ConnectionState::Idle => ConnectionStatus::unstarted(),
            ConnectionState::Stopped => ConnectionStatus::stopped(state.last_connection_time),
            _ if state.protocol.endpoint.is_none() => ConnectionStatus::no_usable_protocol(),
            ConnectionState::Connected => {
                let info = state.connection_info.clone().unwrap_or_default();
                ConnectionStatus::connected(
                    &info.hint,
                    &info.handler,
                    state.last_connection_time.unwrap_or_else(SystemTime::now),
                    self.last_received_time(),
                )
            }
            ConnectionState::Connecting => match (state.next_attempt, state.last_attempt) {
                (Some(next), Some(last)) => {
                    let now = Instant::now();
                    ConnectionStatus::reconnecting(
                        next.saturating_duration_since(now),
                        now.saturating_duration_since(last),
                        state.last_connection_time,
                    )
                }
                _ => ConnectionStatus::trying(state.last_connection_time),
            },
        }
    }

    /// When data last arrived from the server
    pub fn last_received_time(&self) -> Option<SystemTime> {
        self.shared.reference.get().and_then(|r| r.last_received())
    }

    /// Version document from the most recent connection
    pub fn get_version(&self) -> Option<ServerVersion> {
        self.shared.state.lock().version.clone()
    }

    /// Advertised free space; `None` when unknown
    pub fn get_available_space(&self) -> Option<u64> {
        self.shared
            .state
            .lock()
            .version
            .as_ref()
            .and_then(ServerVersion::available_space)
    }

    /// Decoded tub id of the matched endpoint
    pub fn get_tubid(&self) -> Option<Bytes> {
        let endpoint = self.endpoint()?;
        Furl::parse(&endpoint).ok()?.tubid_bytes().ok()
    }

    pub fn get_lease_seed(&self) -> Bytes {
        self.get_tubid().unwrap_or_else(empty_digest)
    }

    pub fn get_write_enabler_seed(&self) -> Bytes {
        self.get_tubid().unwrap_or_else(empty_digest)
    }
}

impl Drop for StorageServer {
    fn drop(&mut self) {
        if let Some(task) = self.shared.state.lock().task.take() {
            task.abort();
        }
    }
}

impl fmt::Debug for StorageServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageServer")
            .field("server_id", &self.server_id)
            .field("seed", &self.seed)
            .field("state", &self.connection_state())
            .finish()
    }
}

fn empty_digest() -> Bytes {
    Bytes::copy_from_slice(&Sha256::digest(b""))
}

// ============================================================================
// Connection task
// ============================================================================

impl Shared {
    fn spawn_connection(self: &Arc<Self>, state: &mut ServerState) {
        let Some(endpoint) = state.protocol.endpoint.clone() else {
            debug!(server_id = %self.server_id, "no endpoint announced, not connecting");
            return;
        };
        state.generation += 1;
        state.last_attempt = None;
        state.next_attempt = None;

        let generation = state.generation;
        let shared = Arc::clone(self);
        state.task = Some(tokio::spawn(async move {
            shared.run(endpoint, generation).await;
        }));
    }

    async fn run(self: Arc<Self>, endpoint: String, generation: u64) {
        let mut backoff = Backoff::new(self.context.reconnect.clone());

        loop {
            if !self.begin_attempt(generation) {
                return;
            }
            BrokerMetrics::increment_connection_attempts();

            let reference = match self.context.connector.connect(&endpoint).await {
                Ok(reference) => reference,
                Err(e) => {
                    BrokerMetrics::increment_connection_failures();
                    let delay = backoff.next_delay();
                    debug!(
                        server_id = %self.server_id,
                        error = %e,
                        retry_in = ?delay,
                        "connection attempt failed"
                    );
                    if !self.wait_retry(generation, delay).await {
                        return;
                    }
                    continue;
                }
            };

            if !self.on_connected(generation, &reference) {
                return;
            }

            // a connection already closed wins over a ready version answer
            let version = tokio::select! {
                biased;
                _ = reference.closed() => None,
                version = reference.get_version() => Some(version),
            };
            if let Some(version) = version {
                // survived the version exchange: the schedule starts over
                backoff.reset();
                let version = version.unwrap_or_else(|e| {
                    debug!(server_id = %self.server_id, error = %e, "get_version failed, assuming defaults");
                    ServerVersion::defaults()
                });
                self.state.lock().version = Some(version);
                reference.closed().await;
            }

            BrokerMetrics::increment_connections_lost();
            if !self.on_lost(generation) {
                return;
            }

            let delay = backoff.next_delay();
            debug!(server_id = %self.server_id, retry_in = ?delay, "reconnecting after loss");
            if !self.wait_retry(generation, delay).await {
                return;
            }
        }
    }

    /// Wait out `delay`, or less if `try_to_connect` is called meanwhile.
    ///
    /// Returns false if this task's generation is no longer current.
    async fn wait_retry(&self, generation: u64, delay: Duration) -> bool {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        // registered before `next_attempt` becomes visible to try_to_connect
        notified.as_mut().enable();

        if !self.schedule_retry(generation, delay) {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = notified => {
                debug!(server_id = %self.server_id, "retrying early");
            }
        }
        true
    }

    fn begin_attempt(&self, generation: u64) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.last_attempt = Some(Instant::now());
        state.next_attempt = None;
        true
    }

    fn schedule_retry(&self, generation: u64, delay: Duration) -> bool {
        let mut state = self.state.lock();
        if state.generation != generation {
            return false;
        }
        state.next_attempt = Some(Instant::now() + delay);
        true
    }

    fn on_connected(&self, generation: u64, reference: &Arc<dyn ServerReference>) -> bool {
        let info = reference.connection_info();
        let trigger = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.connection = ConnectionState::Connected;
            state.connection_info = Some(info.clone());
            state.last_connection_time = Some(SystemTime::now());
            state.next_attempt = None;
            self.reference.set(Some(Arc::clone(reference)));
            state.trigger.clone()
        };

        info!(
            server_id = %self.server_id,
            hint = %info.hint,
            handler = %info.handler,
            "connected to storage server"
        );
        trigger.fire(&self.server_id);
        true
    }

    fn on_lost(&self, generation: u64) -> bool {
        let trigger = {
            let mut state = self.state.lock();
            if state.generation != generation {
                return false;
            }
            state.connection = ConnectionState::Connecting;
            state.connection_info = None;
            self.reference.set(None);
            state.trigger.clone()
        };

        info!(server_id = %self.server_id, "lost connection to storage server");
        trigger.fire(&self.server_id);
        true
    }
}
