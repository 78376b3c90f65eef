//! Report envelope and status batch codec.
//!
//! ```text
//! Report      { "resourceKind": "daemonset", "body": "<base64 StatusBatch JSON>" }
//! StatusBatch { "updateMap": { "ns/name": ResourceSnapshot, .. }, "delMap": { .. } }
//! ```
//!
//! Decoding is all-or-nothing: a report either yields a complete batch or a
//! [`DecodeError`], never a partially populated one.

use std::collections::BTreeMap;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};

use crate::{null_as_default, ResourceKey, ResourceKind, ResourceSnapshot};

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed report envelope: {0}")]
    Envelope(#[source] serde_json::Error),
    #[error("unknown resource kind: {0:?}")]
    UnknownKind(String),
    #[error("report body is not valid base64: {0}")]
    Body(#[from] base64::DecodeError),
    #[error("malformed {kind} status batch: {source}")]
    Batch {
        kind: ResourceKind,
        #[source]
        source: serde_json::Error,
    },
    #[error("{kind} snapshot under key {key} has no name")]
    MissingName { kind: ResourceKind, key: ResourceKey },
}

/// A decoded report: kind tag plus the still-opaque body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub kind: ResourceKind,
    pub body: Vec<u8>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    resource_kind: String,
    #[serde(default)]
    body: String,
}

impl Report {
    pub fn new(kind: ResourceKind, body: Vec<u8>) -> Self { Self { kind, body } }

    /// Wrap a status batch into a report of the given kind.
    pub fn wrap(kind: ResourceKind, batch: &StatusBatch) -> Result<Self, serde_json::Error> {
        Ok(Self { kind, body: batch.encode()? })
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, DecodeError> {
        let env: Envelope = serde_json::from_slice(bytes).map_err(DecodeError::Envelope)?;
        let kind: ResourceKind = env.resource_kind.parse()?;
        let body = STANDARD.decode(env.body.as_bytes())?;
        Ok(Self { kind, body })
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(&Envelope {
            resource_kind: self.kind.as_str().to_string(),
            body: STANDARD.encode(&self.body),
        })
    }

    /// Decode the body as this report's kind of status batch.
    pub fn batch(&self) -> Result<StatusBatch, DecodeError> {
        StatusBatch::decode(self.kind, &self.body)
    }
}

/// Resources to create/update and resources to delete, keyed by `namespace/name`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusBatch {
    #[serde(default, deserialize_with = "null_as_default")]
    pub update_map: BTreeMap<ResourceKey, ResourceSnapshot>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub del_map: BTreeMap<ResourceKey, ResourceSnapshot>,
}

impl StatusBatch {
    pub fn decode(kind: ResourceKind, body: &[u8]) -> Result<Self, DecodeError> {
        let batch: StatusBatch =
            serde_json::from_slice(body).map_err(|source| DecodeError::Batch { kind, source })?;
        for (key, snap) in batch.update_map.iter().chain(batch.del_map.iter()) {
            if snap.name.is_empty() {
                return Err(DecodeError::MissingName { kind, key: key.clone() });
            }
        }
        Ok(batch)
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn is_empty(&self) -> bool { self.update_map.is_empty() && self.del_map.is_empty() }

    pub fn len(&self) -> usize { self.update_map.len() + self.del_map.len() }

    /// Keys present in both the update and the delete set.
    pub fn overlapping_keys(&self) -> Vec<&ResourceKey> {
        self.update_map.keys().filter(|k| self.del_map.contains_key(*k)).collect()
    }

    pub fn insert_update(&mut self, snap: ResourceSnapshot) {
        self.update_map.insert(snap.key(), snap);
    }

    pub fn insert_delete(&mut self, snap: ResourceSnapshot) {
        self.del_map.insert(snap.key(), snap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CLUSTER_LABEL, EDGE_VERSION_LABEL};

    fn sample_batch() -> StatusBatch {
        let mut b = StatusBatch::default();
        b.insert_update(
            ResourceSnapshot::new("test-namespace1", "test-name1")
                .with_label(CLUSTER_LABEL, "cluster1")
                .with_label(EDGE_VERSION_LABEL, "")
                .with_token("1")
                .with_spec(serde_json::json!({"selector": {"matchLabels": {"app": "x"}}})),
        );
        b.insert_delete(ResourceSnapshot::new("test-namespace1", "test-name2").with_token("3"));
        b
    }

    #[test]
    fn report_round_trips_through_envelope() {
        let report = Report::wrap(ResourceKind::DaemonSet, &sample_batch()).unwrap();
        let bytes = report.encode().unwrap();
        let back = Report::decode(&bytes).unwrap();
        assert_eq!(back, report);
        assert_eq!(back.batch().unwrap(), sample_batch());
    }

    #[test]
    fn envelope_uses_camel_case_and_base64_body() {
        let report = Report::new(ResourceKind::Deployment, b"{}".to_vec());
        let v: serde_json::Value = serde_json::from_slice(&report.encode().unwrap()).unwrap();
        assert_eq!(v["resourceKind"], "deployment");
        assert_eq!(v["body"], "e30=");
    }

    #[test]
    fn garbage_envelope_is_rejected() {
        assert!(matches!(Report::decode(&[1]), Err(DecodeError::Envelope(_))));
        assert!(matches!(Report::decode(b"{\"body\":\"\"}"), Err(DecodeError::Envelope(_))));
    }

    #[test]
    fn unknown_kind_is_a_decode_error() {
        let raw = br#"{"resourceKind":"statefulset","body":""}"#;
        assert!(matches!(Report::decode(raw), Err(DecodeError::UnknownKind(_))));
    }

    #[test]
    fn invalid_base64_body_is_rejected() {
        let raw = br#"{"resourceKind":"daemonset","body":"%%%"}"#;
        assert!(matches!(Report::decode(raw), Err(DecodeError::Body(_))));
    }

    #[test]
    fn null_maps_decode_as_empty() {
        let b = StatusBatch::decode(ResourceKind::DaemonSet, br#"{"updateMap":null,"delMap":null}"#).unwrap();
        assert!(b.is_empty());
        let b = StatusBatch::decode(ResourceKind::DaemonSet, b"{}").unwrap();
        assert_eq!(b.len(), 0);
    }

    #[test]
    fn nameless_snapshot_fails_the_whole_batch() {
        let body = br#"{"updateMap":{"ns/a":{"name":"a","namespace":"ns"}},"delMap":{"ns/":{"namespace":"ns"}}}"#;
        let err = StatusBatch::decode(ResourceKind::Deployment, body).unwrap_err();
        match err {
            DecodeError::MissingName { kind, key } => {
                assert_eq!(kind, ResourceKind::Deployment);
                assert_eq!(key.as_str(), "ns/");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn overlapping_keys_are_reported() {
        let mut b = sample_batch();
        b.insert_delete(ResourceSnapshot::new("test-namespace1", "test-name1"));
        let keys: Vec<_> = b.overlapping_keys().into_iter().map(|k| k.as_str().to_string()).collect();
        assert_eq!(keys, vec!["test-namespace1/test-name1".to_string()]);
    }
}
