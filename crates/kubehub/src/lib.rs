//! edgehub kubehub – Kubernetes-backed resource stores

#![forbid(unsafe_code)]

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use anyhow::{Context, Result};
use k8s_openapi::{
    api::apps::v1::{DaemonSet, Deployment},
    NamespaceResourceScope,
};
use kube::{
    api::{Api, DeleteParams, PostParams},
    Client, Resource,
};
use metrics::{counter, histogram};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use tracing::{debug, info};

use edgehub_core::{ResourceKind, ResourceSnapshot, VersionToken};
use edgehub_store::{ResourceStore, StoreError, StoreResult, StoreSet};

/// Client for the current kube context (kubeconfig or in-cluster).
pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from current context")
}

/// Stores for every reconciled kind, sharing one client.
pub fn store_set(client: Client) -> StoreSet {
    StoreSet::new(
        Arc::new(KubeStore::<DaemonSet>::new(client.clone())),
        Arc::new(KubeStore::<Deployment>::new(client)),
    )
}

/// Connect with the default client and build the store set.
pub async fn connect() -> Result<StoreSet> {
    let client = get_kube_client().await?;
    info!(kinds = ?ResourceKind::ALL, "kube stores ready");
    Ok(store_set(client))
}

/// `ResourceStore` over namespaced objects of type `K`.
pub struct KubeStore<K> {
    client: Client,
    _kind: PhantomData<fn() -> K>,
}

impl<K> KubeStore<K> {
    pub fn new(client: Client) -> Self { Self { client, _kind: PhantomData } }
}

impl<K> KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
{
    fn api(&self, namespace: &str) -> Api<K> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait::async_trait]
impl<K> ResourceStore for KubeStore<K>
where
    K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static,
{
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<ResourceSnapshot> {
        let t0 = std::time::Instant::now();
        let res = self.api(namespace).get(name).await;
        observe("get", t0);
        let obj = res.map_err(|e| classify(e, false))?;
        from_object(&obj).map_err(StoreError::backend)
    }

    async fn create(&self, snap: &ResourceSnapshot) -> StoreResult<()> {
        let obj: K = to_object(snap).map_err(StoreError::backend)?;
        let t0 = std::time::Instant::now();
        let res = self.api(snap.store_namespace()).create(&PostParams::default(), &obj).await;
        observe("create", t0);
        let created = res.map_err(|e| classify(e, false))?;
        debug!(kind = %K::kind(&()), ns = %snap.store_namespace(), name = %snap.name, rv = ?created.meta().resource_version, "created");
        Ok(())
    }

    async fn update(&self, snap: &ResourceSnapshot) -> StoreResult<()> {
        let obj: K = to_object(snap).map_err(StoreError::backend)?;
        let t0 = std::time::Instant::now();
        let res = self.api(snap.store_namespace()).replace(&snap.name, &PostParams::default(), &obj).await;
        observe("update", t0);
        let replaced = res.map_err(|e| classify(e, true))?;
        debug!(kind = %K::kind(&()), ns = %snap.store_namespace(), name = %snap.name, rv = ?replaced.meta().resource_version, "replaced");
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let t0 = std::time::Instant::now();
        let res = self.api(namespace).delete(name, &DeleteParams::default()).await;
        observe("delete", t0);
        res.map(|_| ()).map_err(|e| classify(e, false))
    }
}

fn observe(verb: &'static str, t0: std::time::Instant) {
    histogram!("edgehub_store_call_ms", t0.elapsed().as_secs_f64() * 1000.0, "verb" => verb);
}

/// Map a kube error onto the store taxonomy. 409 means a stale
/// resourceVersion only for replace; on create it is AlreadyExists.
fn classify(err: kube::Error, is_update: bool) -> StoreError {
    match err {
        kube::Error::Api(ae) if ae.code == 404 => StoreError::NotFound,
        kube::Error::Api(ae) if ae.code == 409 && is_update => {
            counter!("edgehub_kube_conflicts_total", 1u64);
            StoreError::Conflict
        }
        kube::Error::Api(ae) => StoreError::Backend(format!("{} ({}): {}", ae.reason, ae.code, ae.message)),
        other => StoreError::backend(other),
    }
}

/// Build a typed object from a snapshot: identity, labels and token go to
/// `metadata`, the opaque payload becomes `spec`.
pub fn to_object<K>(snap: &ResourceSnapshot) -> Result<K, serde_json::Error>
where
    K: Resource<DynamicType = ()> + DeserializeOwned,
{
    let mut meta = serde_json::Map::new();
    meta.insert("name".into(), Json::String(snap.name.clone()));
    meta.insert("namespace".into(), Json::String(snap.store_namespace().to_string()));
    if !snap.labels.is_empty() {
        meta.insert("labels".into(), serde_json::to_value(&snap.labels)?);
    }
    if !snap.version_token.is_empty() {
        meta.insert("resourceVersion".into(), Json::String(snap.version_token.to_string()));
    }
    let mut obj = serde_json::Map::new();
    obj.insert("apiVersion".into(), Json::String(K::api_version(&()).into_owned()));
    obj.insert("kind".into(), Json::String(K::kind(&()).into_owned()));
    obj.insert("metadata".into(), Json::Object(meta));
    if let Some(spec) = &snap.spec {
        obj.insert("spec".into(), spec.clone());
    }
    serde_json::from_value(Json::Object(obj))
}

/// Inverse of [`to_object`]; status and server-managed metadata are dropped.
pub fn from_object<K>(obj: &K) -> Result<ResourceSnapshot, serde_json::Error>
where
    K: Resource + Serialize,
{
    let meta = obj.meta();
    let spec = match serde_json::to_value(obj)? {
        Json::Object(mut map) => map.remove("spec"),
        _ => None,
    };
    Ok(ResourceSnapshot {
        name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        labels: meta.labels.clone().unwrap_or_default(),
        version_token: meta.resource_version.clone().map(VersionToken::from).unwrap_or_default(),
        spec,
    })
}
