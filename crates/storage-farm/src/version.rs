//! Storage server version document
//!
//! After connecting, the client asks the server for its version document: a
//! nested map keyed by protocol URI. Capacity information lives under the
//! storage protocol key.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

/// Key of the storage protocol section
pub const STORAGE_PROTOCOL_V1: &str = "http://allmydata.org/tahoe/protocols/storage/v1";

/// Key of the application version string
pub const APPLICATION_VERSION: &str = "application-version";

/// Modern capacity field
pub const AVAILABLE_SPACE: &str = "available-space";

/// Legacy capacity field
pub const MAXIMUM_IMMUTABLE_SHARE_SIZE: &str = "maximum-immutable-share-size";

/// Version document returned by a storage server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerVersion(Map<String, Value>);

impl ServerVersion {
    pub fn new(document: Map<String, Value>) -> Self {
        Self(document)
    }

    /// Build from a loosely-typed value; non-objects yield an empty document
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Object(map) => Self(map),
            _ => Self(Map::new()),
        }
    }

    /// Assumed version for servers that do not answer the version query
    pub fn defaults() -> Self {
        Self::from_value(json!({
            STORAGE_PROTOCOL_V1: {
                MAXIMUM_IMMUTABLE_SHARE_SIZE: u64::from(u32::MAX),
                "maximum-mutable-share-size": 2_000_000_000u64,
                "tolerates-immutable-read-overrun": false,
                "delete-mutable-shares-with-zero-length-writev": false,
                AVAILABLE_SPACE: null,
            },
            APPLICATION_VERSION: "unknown: no get_version()",
        }))
    }

    /// The storage protocol section, if present
    pub fn storage_protocol(&self) -> Option<&Map<String, Value>> {
        self.0.get(STORAGE_PROTOCOL_V1).and_then(Value::as_object)
    }

    /// Advertised free space, falling back to the maximum share size
    pub fn available_space(&self) -> Option<u64> {
        let protocol = self.storage_protocol()?;
        protocol
            .get(AVAILABLE_SPACE)
            .and_then(Value::as_u64)
            .or_else(|| {
                protocol
                    .get(MAXIMUM_IMMUTABLE_SHARE_SIZE)
                    .and_then(Value::as_u64)
            })
    }

    pub fn application_version(&self) -> Option<&str> {
        self.0.get(APPLICATION_VERSION).and_then(Value::as_str)
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn version(protocol: Value) -> ServerVersion {
        ServerVersion::from_value(json!({ STORAGE_PROTOCOL_V1: protocol }))
    }

    #[test]
    fn test_available_space_modern() {
        let v = version(json!({
            "maximum-immutable-share-size": 111,
            "available-space": 222,
        }));
        assert_eq!(v.available_space(), Some(222));
    }

    #[test]
    fn test_available_space_legacy() {
        let v = version(json!({ "maximum-immutable-share-size": 111 }));
        assert_eq!(v.available_space(), Some(111));
    }

    #[test]
    fn test_available_space_unknown() {
        assert_eq!(version(json!({})).available_space(), None);
        assert_eq!(ServerVersion::from_value(json!({})).available_space(), None);
        assert_eq!(ServerVersion::from_value(json!(1234)).available_space(), None);
    }

    #[test]
    fn test_defaults() {
        let v = ServerVersion::defaults();
        // null available-space falls through to the legacy field
        assert_eq!(v.available_space(), Some(u64::from(u32::MAX)));
        assert_eq!(v.application_version(), Some("unknown: no get_version()"));
    }
}
