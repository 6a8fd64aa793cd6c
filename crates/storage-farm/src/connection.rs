//! Connection-layer collaborator interfaces
//!
//! The byte-level RPC transport lives outside this crate. A [`Connector`]
//! turns an endpoint string into a live [`ServerReference`]; the reference
//! answers version queries and resolves [`ServerReference::closed`] when the
//! connection is lost.

use crate::error::Result;
use crate::version::ServerVersion;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::SystemTime;

/// Describes the transport a live reference is using
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConnectionInfo {
    /// Location hint that succeeded, e.g. `tcp:10.0.0.5:3456`
    pub hint: String,
    /// Handler that carried the connection, e.g. `tcp` or `tor`
    pub handler: String,
}

/// A live connection to a storage server
#[async_trait]
pub trait ServerReference: Send + Sync {
    /// Fetch the server's version document
    async fn get_version(&self) -> Result<ServerVersion>;

    /// Resolves once the connection is lost
    async fn closed(&self);

    fn connection_info(&self) -> ConnectionInfo;

    /// When data last arrived over this connection
    fn last_received(&self) -> Option<SystemTime> {
        None
    }
}

/// Opens connections to endpoints
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &str) -> Result<Arc<dyn ServerReference>>;
}
