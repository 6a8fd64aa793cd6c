//! Broker metrics
//!
//! Recorders use the `metrics` crate facade. Without the `metrics` feature
//! every function compiles to nothing; with it, values go to whatever
//! recorder the application installed.
//!
//! ```toml
//! storage-farm = { version = "0.1", features = ["metrics"] }
//! ```

use std::sync::OnceLock;

// ============================================================================
// Broker Metrics
// ============================================================================

/// Storage farm broker metrics
pub struct BrokerMetrics;

impl BrokerMetrics {
    // ---- Counters ----

    /// Announcements received from any source
    pub fn increment_announcements() {
        #[cfg(feature = "metrics")]
        metrics::counter!("storage_farm_announcements_total").increment(1);
    }

    /// Connection attempts started
    pub fn increment_connection_attempts() {
        #[cfg(feature = "metrics")]
        metrics::counter!("storage_farm_connection_attempts_total").increment(1);
    }

    /// Connection attempts that failed
    pub fn increment_connection_failures() {
        #[cfg(feature = "metrics")]
        metrics::counter!("storage_farm_connection_failures_total").increment(1);
    }

    /// Established connections that were lost
    pub fn increment_connections_lost() {
        #[cfg(feature = "metrics")]
        metrics::counter!("storage_farm_connections_lost_total").increment(1);
    }

    /// Threshold waiters resolved
    pub fn increment_waiters_fired() {
        #[cfg(feature = "metrics")]
        metrics::counter!("storage_farm_waiters_fired_total").increment(1);
    }

    // ---- Gauges ----

    /// Servers known to the broker
    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    pub fn set_servers_known(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("storage_farm_servers_known").set(count as f64);
    }

    /// Servers currently connected
    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    pub fn set_servers_connected(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("storage_farm_servers_connected").set(count as f64);
    }

    /// Threshold waiters still pending
    #[cfg_attr(not(feature = "metrics"), allow(unused_variables))]
    pub fn set_pending_waiters(count: usize) {
        #[cfg(feature = "metrics")]
        metrics::gauge!("storage_farm_pending_waiters").set(count as f64);
    }
}

static METRICS_DESCRIBED: OnceLock<()> = OnceLock::new();

/// Register metric descriptions with the installed recorder.
///
/// Call once after installing a recorder. Safe to call multiple times.
pub fn describe_metrics() {
    METRICS_DESCRIBED.get_or_init(describe);
}

fn describe() {
    #[cfg(feature = "metrics")]
    {
        metrics::describe_counter!(
            "storage_farm_announcements_total",
            "Storage announcements received"
        );
        metrics::describe_counter!(
            "storage_farm_connection_attempts_total",
            "Connection attempts to storage servers"
        );
        metrics::describe_counter!(
            "storage_farm_connection_failures_total",
            "Failed connection attempts to storage servers"
        );
        metrics::describe_counter!(
            "storage_farm_connections_lost_total",
            "Established storage server connections that were lost"
        );
        metrics::describe_counter!(
            "storage_farm_waiters_fired_total",
            "Connected-enough waiters resolved"
        );
        metrics::describe_gauge!("storage_farm_servers_known", "Storage servers known");
        metrics::describe_gauge!("storage_farm_servers_connected", "Storage servers connected");
        metrics::describe_gauge!(
            "storage_farm_pending_waiters",
            "Connected-enough waiters not yet resolved"
        );
    }

    tracing::debug!(enabled = cfg!(feature = "metrics"), "storage farm metrics described");
}
