//! Shared fakes for integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use storage_farm::prelude::*;
use storage_farm::protocol::{LiveReference, PluginConfig};
use storage_farm::seed::base32_encode;
use storage_farm::version::{ServerVersion, STORAGE_PROTOCOL_V1};
use tokio::sync::watch;

pub const DUMMY_PLUGIN: &str = "tahoe-lafs-dummy-v1";

/// Initialize tracing for tests
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("storage_farm=debug".parse().unwrap()),
        )
        .with_test_writer()
        .try_init();
}

/// Wait for a condition to become true, panicking after `timeout`
pub async fn wait_for(mut condition: impl FnMut() -> bool, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {timeout:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Check that a future is still pending after `within`
pub async fn stays_pending<F: Future + Unpin>(future: &mut F, within: Duration) -> bool {
    tokio::time::timeout(within, future).await.is_err()
}

// ============================================================================
// Announcements
// ============================================================================

pub fn tubid(n: usize) -> String {
    base32_encode(format!("tub-{n:016}").as_bytes())
}

pub fn furl(n: usize) -> String {
    format!("pb://{}@tcp:127.0.0.1:{}/swissnum", tubid(n), 40000 + n)
}

pub fn server_id(n: usize) -> ServerId {
    ServerId::from(format!("v0-server-{n}"))
}

/// Anonymous-endpoint announcement for server `n`
pub fn ann(n: usize) -> Announcement {
    Announcement::new()
        .with_service_name(STORAGE_SERVICE)
        .with_anonymous_furl(furl(n))
        .with_nickname(format!("server-{n}"))
}

pub fn version_with(protocol: serde_json::Value) -> ServerVersion {
    ServerVersion::from_value(json!({
        STORAGE_PROTOCOL_V1: protocol,
        "application-version": "fake/1.0",
    }))
}

// ============================================================================
// Connection layer
// ============================================================================

/// A controllable live reference
pub struct FakeReference {
    hint: String,
    version: Option<ServerVersion>,
    closed: watch::Sender<bool>,
}

impl FakeReference {
    pub fn new(hint: impl Into<String>, version: Option<ServerVersion>) -> Arc<Self> {
        let (closed, _) = watch::channel(false);
        Arc::new(Self {
            hint: hint.into(),
            version,
            closed,
        })
    }

    pub fn disconnect(&self) {
        self.closed.send_replace(true);
    }
}

#[async_trait]
impl ServerReference for FakeReference {
    async fn get_version(&self) -> Result<ServerVersion> {
        self.version
            .clone()
            .ok_or_else(|| FarmError::RemoteCall("no get_version()".into()))
    }

    async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        loop {
            let closed = *rx.borrow_and_update();
            if closed || rx.changed().await.is_err() {
                return;
            }
        }
    }

    fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            hint: self.hint.clone(),
            handler: "tcp".to_string(),
        }
    }

    fn last_received(&self) -> Option<SystemTime> {
        Some(SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))
    }
}

/// Connector that only reaches endpoints registered with [`FakeConnector::serve`]
#[derive(Default)]
pub struct FakeConnector {
    online: Mutex<HashMap<String, Arc<FakeReference>>>,
    attempts: Mutex<HashMap<String, usize>>,
    total_attempts: AtomicUsize,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bring an endpoint online
    pub fn serve(&self, endpoint: &str, version: Option<ServerVersion>) -> Arc<FakeReference> {
        let hint = endpoint
            .split_once('@')
            .and_then(|(_, rest)| rest.split('/').next())
            .unwrap_or("unknown")
            .to_string();
        let reference = FakeReference::new(hint, version);
        self.online
            .lock()
            .insert(endpoint.to_string(), Arc::clone(&reference));
        reference
    }

    /// Bring an endpoint online that drops every connection right after accepting it
    pub fn serve_dropping(&self, endpoint: &str) {
        self.serve(endpoint, None).disconnect();
    }

    /// Take an endpoint offline, dropping live connections to it
    pub fn disconnect(&self, endpoint: &str) {
        if let Some(reference) = self.online.lock().remove(endpoint) {
            reference.disconnect();
        }
    }

    pub fn attempts(&self, endpoint: &str) -> usize {
        self.attempts.lock().get(endpoint).copied().unwrap_or(0)
    }

    pub fn total_attempts(&self) -> usize {
        self.total_attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ServerReference>> {
        self.total_attempts.fetch_add(1, Ordering::SeqCst);
        *self
            .attempts
            .lock()
            .entry(endpoint.to_string())
            .or_default() += 1;

        match self.online.lock().get(endpoint) {
            Some(reference) => Ok(Arc::clone(reference) as Arc<dyn ServerReference>),
            None => Err(FarmError::ConnectionFailed {
                endpoint: endpoint.to_string(),
                reason: "connection refused".into(),
            }),
        }
    }
}

// ============================================================================
// Discovery feed
// ============================================================================

/// In-process discovery feed
#[derive(Default)]
pub struct LocalFeed {
    subscribers: Mutex<Vec<(String, AnnouncementCallback)>>,
}

impl LocalFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, service_name: &str, server_id: ServerId, ann: Announcement) {
        let callbacks: Vec<AnnouncementCallback> = self
            .subscribers
            .lock()
            .iter()
            .filter(|(service, _)| service == service_name)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback(server_id.clone(), ann.clone());
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl DiscoveryFeed for LocalFeed {
    fn subscribe_to(&self, service_name: &str, callback: AnnouncementCallback) {
        self.subscribers
            .lock()
            .push((service_name.to_string(), callback));
    }
}

// ============================================================================
// Plugins
// ============================================================================

/// Client produced by [`DummyPlugin`]
pub struct DummyStorage {
    pub server_id: ServerId,
    pub option: StorageOption,
    pub config: PluginConfig,
    pub reference: LiveReference,
}

impl StorageClient for DummyStorage {
    fn protocol(&self) -> &str {
        DUMMY_PLUGIN
    }

    fn supports(&self, _capability: &str) -> bool {
        true
    }

    fn reference(&self) -> Option<Arc<dyn ServerReference>> {
        self.reference.get()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

pub struct DummyPlugin;

impl StoragePlugin for DummyPlugin {
    fn create_client(
        &self,
        config: &PluginConfig,
        server_id: &ServerId,
        option: &StorageOption,
        reference: LiveReference,
    ) -> Result<Arc<dyn StorageClient>> {
        Ok(Arc::new(DummyStorage {
            server_id: server_id.clone(),
            option: option.clone(),
            config: config.clone(),
            reference,
        }))
    }
}

pub fn dummy_registry() -> ProtocolRegistry {
    let mut registry = ProtocolRegistry::new();
    registry.register(DUMMY_PLUGIN, Arc::new(DummyPlugin));
    registry
}

/// Broker with a fast fixed reconnect schedule
pub fn broker(registry: ProtocolRegistry, connector: Arc<FakeConnector>) -> StorageFarmBroker {
    broker_with(BrokerConfig::default(), registry, connector)
}

pub fn broker_with(
    config: BrokerConfig,
    registry: ProtocolRegistry,
    connector: Arc<FakeConnector>,
) -> StorageFarmBroker {
    let config = BrokerConfig {
        reconnect: ReconnectConfig::fixed(Duration::from_secs(1)),
        ..config
    };
    StorageFarmBroker::new(config, registry, connector).unwrap()
}
