//! edgehub core types: resource kinds, keys, snapshots and version tokens.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};

pub mod wire;

pub use wire::{DecodeError, Report, StatusBatch};

/// Label carrying the identity of the edge cluster that reported a resource.
pub const CLUSTER_LABEL: &str = "ote-cluster";
/// Label carrying the edge-side resource version at report time.
pub const EDGE_VERSION_LABEL: &str = "edge-version";
/// Namespace used for store calls when a snapshot leaves it empty.
pub const DEFAULT_NAMESPACE: &str = "default";

/// Workload kinds the processor knows how to reconcile.
///
/// The set is closed: a report tagged with anything else fails to decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    DaemonSet,
    Deployment,
}

impl ResourceKind {
    pub const ALL: [ResourceKind; 2] = [ResourceKind::DaemonSet, ResourceKind::Deployment];

    /// Wire tag, as found in `Report.resourceKind`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::DaemonSet => "daemonset",
            ResourceKind::Deployment => "deployment",
        }
    }

    /// Kubernetes `kind` of the backing object.
    pub fn kind_name(&self) -> &'static str {
        match self {
            ResourceKind::DaemonSet => "DaemonSet",
            ResourceKind::Deployment => "Deployment",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceKind {
    type Err = DecodeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ResourceKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DecodeError::UnknownKind(s.to_string()))
    }
}

/// Opaque optimistic-concurrency token. Only ever compared for equality.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionToken(String);

impl VersionToken {
    pub fn new(token: impl Into<String>) -> Self { Self(token.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for VersionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VersionToken {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for VersionToken {
    fn from(s: String) -> Self { Self(s) }
}

/// Batch-local key, `namespace/name`. Store calls never use it for identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    pub fn new(key: impl Into<String>) -> Self { Self(key.into()) }

    pub fn from_parts(namespace: &str, name: &str) -> Self {
        Self(format!("{}/{}", namespace, name))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceKey {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

/// Edge-reported desired state of a single resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceSnapshot {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub labels: BTreeMap<String, String>,
    /// Token captured on the edge at report time; may be stale.
    #[serde(default)]
    pub version_token: VersionToken,
    /// Desired workload spec, passed through to the store untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<serde_json::Value>,
}

impl ResourceSnapshot {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self { name: name.into(), namespace: namespace.into(), ..Default::default() }
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    pub fn with_token(mut self, token: impl Into<VersionToken>) -> Self {
        self.version_token = token.into();
        self
    }

    pub fn with_spec(mut self, spec: serde_json::Value) -> Self {
        self.spec = Some(spec);
        self
    }

    /// Namespace used for store calls.
    pub fn store_namespace(&self) -> &str {
        if self.namespace.is_empty() { DEFAULT_NAMESPACE } else { &self.namespace }
    }

    /// Key this snapshot would be filed under in a batch.
    pub fn key(&self) -> ResourceKey {
        ResourceKey::from_parts(&self.namespace, &self.name)
    }

    pub fn cluster(&self) -> Option<&str> {
        self.labels.get(CLUSTER_LABEL).map(String::as_str)
    }

    pub fn edge_version(&self) -> Option<&str> {
        self.labels.get(EDGE_VERSION_LABEL).map(String::as_str)
    }

    /// Same desired state, with the concurrency token swapped for `token`.
    pub fn rebased(&self, token: VersionToken) -> Self {
        Self { version_token: token, ..self.clone() }
    }
}

/// Edge encoders emit `null` for empty maps; treat it as empty.
pub(crate) fn null_as_default<'de, D, T>(d: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(d)?.unwrap_or_default())
}

pub mod prelude {
    pub use super::{
        DecodeError, Report, ResourceKey, ResourceKind, ResourceSnapshot, StatusBatch, VersionToken,
        CLUSTER_LABEL, DEFAULT_NAMESPACE, EDGE_VERSION_LABEL,
    };
}
