//! Server identities and storage announcements
//!
//! An announcement is the record a storage server publishes (or a static
//! configuration entry provides) describing how to reach it. Only a handful
//! of fields are interpreted here; everything else is carried untouched in an
//! opaque bag so that protocol plugins can read their own keys.

use crate::error::{FarmError, Result};
use crate::seed::base32_decode;
use bytes::Bytes;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// Prefix carried by server ids derived from a public key
pub const PUBKEY_PREFIX: &str = "v0-";

/// Length of a base32-encoded 32-byte public key
const PUBKEY_BASE32_LEN: usize = 52;

/// Length of the abbreviated server name
const SHORT_NAME_LEN: usize = 8;

/// Opaque identifier of a storage server
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ServerId(Bytes);

impl ServerId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Lossy UTF-8 rendering of the full identifier
    pub fn to_text(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }

    /// The base32 key material if this id has the `v0-<52 base32 chars>` shape
    pub fn public_key_base32(&self) -> Option<&str> {
        let rest = self.0.strip_prefix(PUBKEY_PREFIX.as_bytes())?;
        if rest.len() != PUBKEY_BASE32_LEN || !rest.iter().all(u8::is_ascii_alphanumeric) {
            return None;
        }
        std::str::from_utf8(rest).ok()
    }

    /// Abbreviated name: eight characters following an optional `v0-` prefix
    pub fn short_name(&self) -> String {
        let body = self
            .0
            .strip_prefix(PUBKEY_PREFIX.as_bytes())
            .unwrap_or(&self.0[..]);
        let end = body.len().min(SHORT_NAME_LEN);
        String::from_utf8_lossy(&body[..end]).into_owned()
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(&self.0))
    }
}

impl From<&str> for ServerId {
    fn from(id: &str) -> Self {
        Self(Bytes::copy_from_slice(id.as_bytes()))
    }
}

impl From<String> for ServerId {
    fn from(id: String) -> Self {
        Self(Bytes::from(id))
    }
}

impl From<&[u8]> for ServerId {
    fn from(id: &[u8]) -> Self {
        Self(Bytes::copy_from_slice(id))
    }
}

impl From<Vec<u8>> for ServerId {
    fn from(id: Vec<u8>) -> Self {
        Self(Bytes::from(id))
    }
}

/// One entry of an announcement's `storage-options` list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageOption {
    /// Protocol plugin name
    pub name: String,

    /// Plugin-specific fields, passed through untouched
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl StorageOption {
    /// Field holding the endpoint for plugin-matched connections
    pub const STORAGE_SERVER_FURL: &'static str = "storage-server-FURL";

    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn storage_server_furl(&self) -> Option<&str> {
        self.fields
            .get(Self::STORAGE_SERVER_FURL)
            .and_then(Value::as_str)
    }

    /// Build an option from a raw entry, dropping entries without a string name
    fn from_value(value: Value) -> Option<Self> {
        let Value::Object(mut map) = value else {
            warn!("skipping storage option that is not an object");
            return None;
        };
        match map.remove("name") {
            Some(Value::String(name)) => Some(Self {
                name,
                fields: map.into_iter().collect(),
            }),
            _ => {
                warn!("skipping storage option without a name");
                None
            }
        }
    }
}

/// Storage server announcement
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Announcement {
    #[serde(
        rename = "service-name",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub service_name: Option<String>,

    #[serde(
        rename = "anonymous-storage-FURL",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub anonymous_storage_furl: Option<String>,

    #[serde(
        rename = "permutation-seed-base32",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub permutation_seed_base32: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nickname: Option<String>,

    #[serde(
        rename = "storage-options",
        default,
        deserialize_with = "lenient_storage_options",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub storage_options: Vec<StorageOption>,

    /// Fields not interpreted by the broker
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// How an announcement says the server can be reached
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reachability<'a> {
    /// Protocol options to match against local plugins, with the anonymous
    /// endpoint (if any) as fallback
    Plugins {
        options: &'a [StorageOption],
        fallback_furl: Option<&'a str>,
    },
    /// Only the legacy anonymous endpoint
    Anonymous { furl: &'a str },
    /// Nothing usable
    Unreachable,
}

impl Announcement {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse an announcement from a loosely-typed value
    pub fn from_value(value: Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    pub fn with_anonymous_furl(mut self, furl: impl Into<String>) -> Self {
        self.anonymous_storage_furl = Some(furl.into());
        self
    }

    pub fn with_permutation_seed(mut self, seed_base32: impl Into<String>) -> Self {
        self.permutation_seed_base32 = Some(seed_base32.into());
        self
    }

    pub fn with_nickname(mut self, nickname: impl Into<String>) -> Self {
        self.nickname = Some(nickname.into());
        self
    }

    pub fn with_storage_option(mut self, option: StorageOption) -> Self {
        self.storage_options.push(option);
        self
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn reachability(&self) -> Reachability<'_> {
        let furl = self.anonymous_storage_furl.as_deref();
        if !self.storage_options.is_empty() {
            return Reachability::Plugins {
                options: &self.storage_options,
                fallback_furl: furl,
            };
        }
        match furl {
            Some(furl) => Reachability::Anonymous { furl },
            None => Reachability::Unreachable,
        }
    }
}

fn lenient_storage_options<'de, D>(
    deserializer: D,
) -> std::result::Result<Vec<StorageOption>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Value>::deserialize(deserializer)?;
    Ok(match raw {
        Some(Value::Array(entries)) => entries
            .into_iter()
            .filter_map(StorageOption::from_value)
            .collect(),
        None | Some(Value::Null) => Vec::new(),
        Some(_) => {
            warn!("storage-options is not a list, ignoring it");
            Vec::new()
        }
    })
}

/// Foolscap-style reference URL: `pb://<tubid>@<hint>,<hint>/<name>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Furl {
    /// Base32 tub id as written in the URL
    pub tubid: String,
    /// Connection hints in announcement order
    pub location_hints: Vec<String>,
    /// Object name (swissnum)
    pub name: String,
}

impl Furl {
    pub fn parse(furl: &str) -> Result<Self> {
        let rest = furl
            .strip_prefix("pb://")
            .ok_or_else(|| FarmError::InvalidFurl(furl.to_string()))?;
        let (tubid, rest) = rest
            .split_once('@')
            .ok_or_else(|| FarmError::InvalidFurl(furl.to_string()))?;
        if tubid.is_empty() || !tubid.bytes().all(|b| b.is_ascii_alphanumeric()) {
            return Err(FarmError::InvalidFurl(furl.to_string()));
        }
        let (hints, name) = rest.rsplit_once('/').unwrap_or((rest, ""));
        Ok(Self {
            tubid: tubid.to_ascii_lowercase(),
            location_hints: hints
                .split(',')
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect(),
            name: name.to_string(),
        })
    }

    /// Decoded tub id bytes
    pub fn tubid_bytes(&self) -> Result<Bytes> {
        base32_decode(&self.tubid)
    }
}
