//! Storage protocol registry and matcher
//!
//! Servers advertise the protocols they speak as `storage-options` entries.
//! Locally enabled plugins are registered by name; matching walks the
//! announced options in order and the first one with a registered plugin
//! wins. Announcements that only carry the legacy anonymous endpoint always
//! match the built-in protocol, and anything else gets [`NullStorage`], an
//! inert placeholder that supports nothing and never touches the network.
//!
//! # Example
//!
//! ```rust,ignore
//! use storage_farm::protocol::ProtocolRegistry;
//! use std::sync::Arc;
//!
//! let mut registry = ProtocolRegistry::new();
//! registry.register("tahoe-lafs-dummy-v1", Arc::new(DummyPlugin));
//!
//! let matched = registry.match_announcement(&server_id, &ann, LiveReference::new());
//! ```

use crate::announcement::{Announcement, Reachability, ServerId, StorageOption};
use crate::connection::ServerReference;
use crate::error::Result;
use parking_lot::RwLock;
use serde_json::Value;
use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// Protocol name of the built-in client
pub const ANONYMOUS_PROTOCOL: &str = "anonymous-storage";

/// Protocol name of the inert placeholder
pub const NULL_PROTOCOL: &str = "null";

/// Capability names checked through [`StorageClient::supports`]
pub mod capability {
    pub const IMMUTABLE_READ: &str = "immutable-read";
    pub const IMMUTABLE_WRITE: &str = "immutable-write";
    pub const MUTABLE_SLOTS: &str = "mutable-slots";
    pub const LEASES: &str = "leases";

    /// Everything the built-in protocol offers
    pub const STORAGE_V1: &[&str] = &[IMMUTABLE_READ, IMMUTABLE_WRITE, MUTABLE_SLOTS, LEASES];
}

/// Client-side configuration section for one plugin
pub type PluginConfig = BTreeMap<String, Value>;

// ============================================================================
// Live reference
// ============================================================================

/// Shared accessor for a server's current live reference.
///
/// Protocol clients hold a clone; the owning server descriptor fills it on
/// connect and clears it on loss.
#[derive(Clone, Default)]
pub struct LiveReference(Arc<RwLock<Option<Arc<dyn ServerReference>>>>);

impl LiveReference {
    pub fn new() -> Self {
        Self::default()
    }

    /// The current reference, if connected
    pub fn get(&self) -> Option<Arc<dyn ServerReference>> {
        self.0.read().clone()
    }

    pub(crate) fn set(&self, reference: Option<Arc<dyn ServerReference>>) {
        *self.0.write() = reference;
    }
}

impl fmt::Debug for LiveReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveReference")
            .field("connected", &self.0.read().is_some())
            .finish()
    }
}

// ============================================================================
// Client and plugin traits
// ============================================================================

/// A protocol client bound to one server
pub trait StorageClient: Send + Sync {
    /// Name of the protocol this client speaks
    fn protocol(&self) -> &str;

    /// Check if the client can perform an operation
    fn supports(&self, capability: &str) -> bool;

    /// The live reference to the server, if connected
    fn reference(&self) -> Option<Arc<dyn ServerReference>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

/// Produces protocol clients for announced storage options
///
/// Implement this trait to add support for a new storage protocol.
pub trait StoragePlugin: Send + Sync {
    /// Create a client for `server_id` from its announced option.
    ///
    /// Must not perform I/O. An error causes the option to be skipped.
    fn create_client(
        &self,
        config: &PluginConfig,
        server_id: &ServerId,
        option: &StorageOption,
        reference: LiveReference,
    ) -> Result<Arc<dyn StorageClient>>;
}

// ============================================================================
// Built-in clients
// ============================================================================

/// Client for the legacy anonymous storage endpoint
#[derive(Debug, Clone)]
pub struct AnonymousStorage {
    furl: String,
    reference: LiveReference,
}

impl AnonymousStorage {
    pub fn new(furl: impl Into<String>, reference: LiveReference) -> Self {
        Self {
            furl: furl.into(),
            reference,
        }
    }

    pub fn furl(&self) -> &str {
        &self.furl
    }
}

impl StorageClient for AnonymousStorage {
    fn protocol(&self) -> &str {
        ANONYMOUS_PROTOCOL
    }

    fn supports(&self, capability: &str) -> bool {
        capability::STORAGE_V1.contains(&capability)
    }

    fn reference(&self) -> Option<Arc<dyn ServerReference>> {
        self.reference.get()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Placeholder for servers offering no protocol this client understands
#[derive(Debug, Clone, Copy, Default)]
pub struct NullStorage;

impl StorageClient for NullStorage {
    fn protocol(&self) -> &str {
        NULL_PROTOCOL
    }

    fn supports(&self, _capability: &str) -> bool {
        false
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

// ============================================================================
// Match result
// ============================================================================

/// How an announcement was matched
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchKind {
    /// A registered plugin, by name
    Plugin(String),
    /// The built-in anonymous protocol
    Anonymous,
    /// Nothing usable
    Placeholder,
}

/// Outcome of protocol matching for one server
#[derive(Clone)]
pub struct MatchedProtocol {
    pub kind: MatchKind,
    pub client: Arc<dyn StorageClient>,
    /// Endpoint to hand the connector, if any
    pub endpoint: Option<String>,
}

impl MatchedProtocol {
    pub fn placeholder() -> Self {
        Self {
            kind: MatchKind::Placeholder,
            client: Arc::new(NullStorage),
            endpoint: None,
        }
    }

    pub fn is_placeholder(&self) -> bool {
        self.kind == MatchKind::Placeholder
    }
}

impl fmt::Debug for MatchedProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MatchedProtocol")
            .field("kind", &self.kind)
            .field("protocol", &self.client.protocol())
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A registered plugin with its local configuration
#[derive(Clone)]
pub struct RegistryEntry {
    pub plugin: Arc<dyn StoragePlugin>,
    pub config: PluginConfig,
}

/// Registry of locally enabled storage plugins
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    plugins: HashMap<String, RegistryEntry>,
}

impl ProtocolRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a plugin with an empty configuration
    pub fn register(&mut self, name: &str, plugin: Arc<dyn StoragePlugin>) {
        self.register_with_config(name, plugin, PluginConfig::new());
    }

    /// Register a plugin with its client-side configuration
    pub fn register_with_config(
        &mut self,
        name: &str,
        plugin: Arc<dyn StoragePlugin>,
        config: PluginConfig,
    ) {
        self.plugins
            .insert(name.to_string(), RegistryEntry { plugin, config });
    }

    /// Get a plugin entry by name
    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.plugins.get(name)
    }

    /// Check if a plugin is registered
    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Registered plugin names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.plugins.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    /// Check if registry is empty
    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    /// Pick the protocol client for an announcement.
    ///
    /// Never fails: plugin errors skip the option and unmatched announcements
    /// get the placeholder.
    pub fn match_announcement(
        &self,
        server_id: &ServerId,
        ann: &Announcement,
        reference: LiveReference,
    ) -> MatchedProtocol {
        let fallback = match ann.reachability() {
            Reachability::Plugins {
                options,
                fallback_furl,
            } => {
                if let Some(matched) = self.match_options(server_id, options, &reference) {
                    return matched;
                }
                fallback_furl
            }
            Reachability::Anonymous { furl } => Some(furl),
            Reachability::Unreachable => None,
        };

        match fallback {
            Some(furl) => MatchedProtocol {
                kind: MatchKind::Anonymous,
                client: Arc::new(AnonymousStorage::new(furl, reference)),
                endpoint: Some(furl.to_string()),
            },
            None => {
                debug!(server_id = %server_id, "no usable storage protocol, using placeholder");
                MatchedProtocol::placeholder()
            }
        }
    }

    fn match_options(
        &self,
        server_id: &ServerId,
        options: &[StorageOption],
        reference: &LiveReference,
    ) -> Option<MatchedProtocol> {
        for option in options {
            let Some(entry) = self.plugins.get(&option.name) else {
                continue;
            };
            match entry
                .plugin
                .create_client(&entry.config, server_id, option, reference.clone())
            {
                Ok(client) => {
                    debug!(server_id = %server_id, plugin = %option.name, "matched storage plugin");
                    return Some(MatchedProtocol {
                        kind: MatchKind::Plugin(option.name.clone()),
                        client,
                        endpoint: option.storage_server_furl().map(str::to_string),
                    });
                }
                Err(e) => {
                    warn!(
                        server_id = %server_id,
                        plugin = %option.name,
                        error = %e,
                        "storage plugin rejected announced option"
                    );
                }
            }
        }
        None
    }
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
