//! # Storage Farm
//!
//! Server discovery and connection management for a decentralized storage
//! grid:
//! - **Broker**: one descriptor per server id, fed by static configuration
//!   and a discovery feed, with a "connected enough" readiness signal
//! - **Descriptors**: per-server connection lifecycle with unbounded
//!   reconnect, stable permutation seed and status reporting
//! - **Protocol matching**: announced storage options resolved against
//!   locally enabled plugins, with an inert fallback
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐   ┌──────────────────┐
//! │  servers.yaml    │   │  discovery feed  │
//! └────────┬─────────┘   └────────┬─────────┘
//!          └───────────┬──────────┘
//!                      ▼
//! ┌──────────────────────────────────────────┐
//! │            StorageFarmBroker             │
//! │  ServerId → StorageServer, waiters       │
//! └────────┬──────────────────────┬──────────┘
//!          ▼                      ▼
//! ┌──────────────────┐   ┌──────────────────┐
//! │  StorageServer   │──▶│ ProtocolRegistry │
//! │  seed, status,   │   │ plugins, anon,   │
//! │  connection task │   │ placeholder      │
//! └────────┬─────────┘   └──────────────────┘
//!          ▼
//! ┌──────────────────┐
//! │    Connector     │
//! └──────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use storage_farm::{BrokerConfig, ProtocolRegistry, StaticServers, StorageFarmBroker};
//!
//! let broker = StorageFarmBroker::new(BrokerConfig::default(), ProtocolRegistry::new(), connector)?;
//! broker.set_static_servers(&StaticServers::load("private/servers.yaml")?);
//! broker.use_introducer(&introducer);
//!
//! broker.when_connected_enough(7).await?;
//! for server in broker.servers_for_psi(&storage_index) {
//!     println!("{} {:?}", server.get_name(), server.get_available_space());
//! }
//! ```

pub mod announcement;
pub mod broker;
pub mod config;
pub mod connection;
pub mod error;
pub mod introducer;
pub mod observability;
pub mod placement;
pub mod protocol;
pub mod reconnect;
pub mod seed;
pub mod server;
pub mod status;
pub mod version;

// Re-export main types
pub use announcement::{Announcement, Furl, Reachability, ServerId, StorageOption};
pub use broker::{ConnectedEnough, StorageFarmBroker};
pub use config::{BrokerConfig, BrokerConfigBuilder, ReconnectConfig, StaticServers};
pub use connection::{ConnectionInfo, Connector, ServerReference};
pub use error::{FarmError, Result};
pub use introducer::{AnnouncementCallback, DiscoveryFeed, STORAGE_SERVICE};
pub use observability::{describe_metrics, BrokerMetrics};
pub use protocol::{
    AnonymousStorage, LiveReference, MatchKind, MatchedProtocol, NullStorage, PluginConfig,
    ProtocolRegistry, StorageClient, StoragePlugin,
};
pub use seed::{PermutationSeed, SeedSource};
pub use server::{ConnectionTrigger, ServerContext, StorageServer};
pub use status::{ConnectionState, ConnectionStatus};
pub use version::ServerVersion;

/// Re-export common types
pub mod prelude {
    pub use crate::announcement::*;
    pub use crate::broker::*;
    pub use crate::config::*;
    pub use crate::connection::*;
    pub use crate::error::*;
    pub use crate::introducer::*;
    pub use crate::protocol::{ProtocolRegistry, StorageClient, StoragePlugin};
    pub use crate::server::*;
    pub use crate::status::*;
}
