//! Broker configuration

use crate::announcement::{Announcement, ServerId};
use crate::error::{FarmError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Storage farm broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Order servers per file using their permutation seed; when false,
    /// servers are ordered by id
    pub permute_peers: bool,

    /// Long names of servers to place ahead of all others
    pub preferred_peers: Vec<String>,

    /// Reconnect backoff tuning
    pub reconnect: ReconnectConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            permute_peers: true,
            preferred_peers: vec![],
            reconnect: ReconnectConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn builder() -> BrokerConfigBuilder {
        BrokerConfigBuilder::new()
    }

    /// Reject settings the reconnect loop cannot work with
    pub fn validate(&self) -> Result<()> {
        self.reconnect.validate()
    }

    /// Check if a server is listed as preferred
    pub fn is_preferred(&self, server_id: &ServerId) -> bool {
        let longname = server_id.to_text();
        self.preferred_peers.iter().any(|p| *p == longname)
    }
}

/// Builder for broker configuration
#[derive(Debug, Default)]
pub struct BrokerConfigBuilder {
    permute_peers: Option<bool>,
    preferred_peers: Vec<String>,
    reconnect: Option<ReconnectConfig>,
}

impl BrokerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn permute_peers(mut self, permute: bool) -> Self {
        self.permute_peers = Some(permute);
        self
    }

    pub fn preferred_peer(mut self, longname: impl Into<String>) -> Self {
        self.preferred_peers.push(longname.into());
        self
    }

    pub fn preferred_peers(mut self, longnames: Vec<String>) -> Self {
        self.preferred_peers = longnames;
        self
    }

    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    pub fn build(self) -> BrokerConfig {
        let defaults = BrokerConfig::default();
        BrokerConfig {
            permute_peers: self.permute_peers.unwrap_or(defaults.permute_peers),
            preferred_peers: self.preferred_peers,
            reconnect: self.reconnect.unwrap_or(defaults.reconnect),
        }
    }
}

/// Reconnect backoff configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Upper bound on the delay between attempts
    pub max_delay: Duration,

    /// Growth factor per failed attempt
    pub multiplier: f64,

    /// Random spread applied to each delay, as a fraction
    pub jitter: f64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(3600),
            multiplier: std::f64::consts::E,
            jitter: 0.1196,
        }
    }
}

impl ReconnectConfig {
    pub fn validate(&self) -> Result<()> {
        if self.initial_delay.is_zero() {
            return Err(FarmError::Config("reconnect.initial_delay must be > 0".into()));
        }
        if self.max_delay < self.initial_delay {
            return Err(FarmError::Config(
                "reconnect.max_delay must be >= reconnect.initial_delay".into(),
            ));
        }
        if self.multiplier.is_nan() || self.multiplier < 1.0 {
            return Err(FarmError::Config("reconnect.multiplier must be >= 1".into()));
        }
        if !(0.0..1.0).contains(&self.jitter) {
            return Err(FarmError::Config("reconnect.jitter must be in [0, 1)".into()));
        }
        Ok(())
    }

    /// Fixed delays with no growth or jitter
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            multiplier: 1.0,
            jitter: 0.0,
        }
    }
}

// ============================================================================
// Static servers
// ============================================================================

/// One entry of the static servers file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticServerEntry {
    pub ann: Announcement,
}

/// Statically configured storage servers
///
/// ```yaml
/// storage:
///   v0-4uazse3xb6uu5qpkb7tel2bm6bpea4jhuigdhqcuvvse7hugtsia:
///     ann:
///       nickname: alpha
///       anonymous-storage-FURL: pb://abcde@nowhere/fake
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StaticServers {
    #[serde(default)]
    pub storage: BTreeMap<String, StaticServerEntry>,
}

impl StaticServers {
    /// Parse a static servers document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        if yaml.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a static servers file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let yaml = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&yaml)
    }

    pub fn len(&self) -> usize {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.storage.is_empty()
    }

    /// Announcements keyed by server id
    pub fn announcements(&self) -> impl Iterator<Item = (ServerId, &Announcement)> + '_ {
        self.storage
            .iter()
            .map(|(id, entry)| (ServerId::from(id.as_str()), &entry.ann))
    }
}
