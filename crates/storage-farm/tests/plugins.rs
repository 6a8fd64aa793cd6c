//! Storage plugin matching through the broker

mod common;

use common::*;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, Weak};
use std::time::Duration;
use storage_farm::prelude::*;
use storage_farm::protocol::{AnonymousStorage, LiveReference, MatchKind, PluginConfig};

fn dummy_option(endpoint: &str) -> StorageOption {
    StorageOption::new(DUMMY_PLUGIN)
        .with_field(StorageOption::STORAGE_SERVER_FURL, endpoint)
        .with_field("some", "thing")
}

#[tokio::test(start_paused = true)]
async fn test_plugin_client_gets_option_and_reference() {
    init_tracing();
    let connector = FakeConnector::new();
    let plugin_endpoint = "pb://fghij@nowhere/dummy";
    connector.serve(plugin_endpoint, None);

    let broker = broker(dummy_registry(), Arc::clone(&connector));
    let id = server_id(1);
    broker.got_announcement(
        id.clone(),
        ann(1).with_storage_option(dummy_option(plugin_endpoint)),
    );

    let server = broker.get_server(&id).unwrap();
    assert_eq!(server.protocol_kind(), MatchKind::Plugin(DUMMY_PLUGIN.into()));
    assert_eq!(server.endpoint().as_deref(), Some(plugin_endpoint));

    let client = server.get_storage_client();
    let dummy = client
        .as_any()
        .downcast_ref::<DummyStorage>()
        .expect("dummy storage client");
    assert_eq!(dummy.server_id, id);
    assert_eq!(dummy.option.fields.get("some"), Some(&Value::from("thing")));
    assert!(client.reference().is_none());

    wait_for(|| server.is_connected(), Duration::from_secs(5)).await;
    assert!(client.reference().is_some());
    // the anonymous endpoint is not used when a plugin matched
    assert_eq!(connector.attempts(&furl(1)), 0);
}

#[tokio::test(start_paused = true)]
async fn test_plugin_receives_local_config() {
    let mut config = PluginConfig::new();
    config.insert("web-port".into(), Value::from("tcp:0"));
    let mut registry = ProtocolRegistry::new();
    registry.register_with_config(DUMMY_PLUGIN, Arc::new(DummyPlugin), config.clone());

    let broker = broker(registry, FakeConnector::new());
    broker.got_announcement(
        server_id(1),
        Announcement::new().with_storage_option(dummy_option("pb://fghij@nowhere/dummy")),
    );

    let client = broker.get_server(&server_id(1)).unwrap().get_storage_client();
    let dummy = client.as_any().downcast_ref::<DummyStorage>().unwrap();
    assert_eq!(dummy.config, config);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_plugin_falls_back_to_anonymous() {
    let connector = FakeConnector::new();
    connector.serve(&furl(1), None);
    let broker = broker(ProtocolRegistry::new(), Arc::clone(&connector));

    broker.got_announcement(
        server_id(1),
        ann(1).with_storage_option(dummy_option("pb://fghij@nowhere/dummy")),
    );

    let server = broker.get_server(&server_id(1)).unwrap();
    assert_eq!(server.protocol_kind(), MatchKind::Anonymous);
    let client = server.get_storage_client();
    let anonymous = client.as_any().downcast_ref::<AnonymousStorage>().unwrap();
    assert_eq!(anonymous.furl(), furl(1));

    wait_for(|| server.is_connected(), Duration::from_secs(5)).await;
    assert!(client.reference().is_some());
    assert!(client.supports("leases"));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_options_are_skipped() {
    let connector = FakeConnector::new();
    let broker = broker(dummy_registry(), Arc::clone(&connector));
    let ann = Announcement::from_value(serde_json::json!({
        "storage-options": [
            42,
            {"storage-server-FURL": "pb://aaaaa@nowhere/nameless"},
            {"name": DUMMY_PLUGIN, "storage-server-FURL": "pb://fghij@nowhere/dummy"},
        ],
    }))
    .unwrap();

    broker.got_announcement(server_id(1), ann);

    let server = broker.get_server(&server_id(1)).unwrap();
    assert_eq!(server.protocol_kind(), MatchKind::Plugin(DUMMY_PLUGIN.into()));
    assert_eq!(server.endpoint().as_deref(), Some("pb://fghij@nowhere/dummy"));
}

#[tokio::test(start_paused = true)]
async fn test_plugin_without_endpoint_does_not_connect() {
    let connector = FakeConnector::new();
    let broker = broker(dummy_registry(), Arc::clone(&connector));
    broker.got_announcement(
        server_id(1),
        Announcement::new().with_storage_option(StorageOption::new(DUMMY_PLUGIN)),
    );

    let server = broker.get_server(&server_id(1)).unwrap();
    assert_eq!(server.protocol_kind(), MatchKind::Plugin(DUMMY_PLUGIN.into()));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.total_attempts(), 0);
    assert_eq!(
        server.get_connection_status().summary,
        "No usable storage protocol"
    );
}

/// Looks the server up in the broker while building its client
struct LookupPlugin {
    broker: Arc<Mutex<Weak<StorageFarmBroker>>>,
    seen: Arc<Mutex<Vec<(ServerId, bool, usize)>>>,
}

impl StoragePlugin for LookupPlugin {
    fn create_client(
        &self,
        config: &PluginConfig,
        server_id: &ServerId,
        option: &StorageOption,
        reference: LiveReference,
    ) -> Result<Arc<dyn StorageClient>> {
        let broker = self.broker.lock().upgrade();
        if let Some(broker) = broker {
            let known = broker.get_server(server_id).is_some();
            self.seen
                .lock()
                .push((server_id.clone(), known, broker.servers().len()));
        }
        DummyPlugin.create_client(config, server_id, option, reference)
    }
}

#[tokio::test(start_paused = true)]
async fn test_plugin_may_read_broker_while_matching() {
    let handle = Arc::new(Mutex::new(Weak::new()));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ProtocolRegistry::new();
    registry.register(
        DUMMY_PLUGIN,
        Arc::new(LookupPlugin {
            broker: Arc::clone(&handle),
            seen: Arc::clone(&seen),
        }),
    );

    let broker = Arc::new(broker(registry, FakeConnector::new()));
    *handle.lock() = Arc::downgrade(&broker);

    for n in 0..2 {
        broker.got_announcement(
            server_id(n),
            Announcement::new().with_storage_option(dummy_option("pb://fghij@nowhere/dummy")),
        );
    }

    assert_eq!(
        *seen.lock(),
        vec![(server_id(0), false, 0), (server_id(1), false, 1)]
    );
    assert_eq!(broker.servers().len(), 2);
    assert_eq!(
        broker.get_server(&server_id(1)).unwrap().protocol_kind(),
        MatchKind::Plugin(DUMMY_PLUGIN.into())
    );
}
