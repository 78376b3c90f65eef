//! In-memory `ResourceStore` with Kubernetes-like optimistic concurrency.
//!
//! Every write bumps a numeric resource version. Calls are recorded in an
//! action log and faults can be scripted per verb, which makes this the test
//! double for the reconciler as well as a reference for store semantics.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use edgehub_core::{ResourceSnapshot, VersionToken};
use tracing::debug;

use crate::{ResourceStore, StoreError, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Get,
    Create,
    Update,
    Delete,
}

/// One recorded store call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Action {
    pub verb: Verb,
    pub namespace: String,
    pub name: String,
    /// Token carried by the written snapshot (create/update only).
    pub token: Option<VersionToken>,
}

impl Action {
    pub fn get(namespace: &str, name: &str) -> Self { Self::plain(Verb::Get, namespace, name) }
    pub fn delete(namespace: &str, name: &str) -> Self { Self::plain(Verb::Delete, namespace, name) }

    pub fn create(namespace: &str, name: &str, token: &str) -> Self {
        Self { token: Some(token.into()), ..Self::plain(Verb::Create, namespace, name) }
    }

    pub fn update(namespace: &str, name: &str, token: &str) -> Self {
        Self { token: Some(token.into()), ..Self::plain(Verb::Update, namespace, name) }
    }

    fn plain(verb: Verb, namespace: &str, name: &str) -> Self {
        Self { verb, namespace: namespace.to_string(), name: name.to_string(), token: None }
    }
}

/// Scripted behavior for the next call of a verb.
#[derive(Debug, Clone)]
pub enum Fault {
    /// Fail the call with this error and leave state untouched.
    Error(StoreError),
    /// Advance the stored version before serving the call, as a concurrent
    /// writer would have.
    ConcurrentWrite,
    /// Hold the call this long before serving it.
    Delay(Duration),
}

#[derive(Default)]
struct Inner {
    objects: BTreeMap<(String, String), ResourceSnapshot>,
    clock: u64,
    actions: Vec<Action>,
    faults: Vec<(Verb, Fault)>,
}

impl Inner {
    fn next_token(&mut self, current: Option<&VersionToken>) -> VersionToken {
        let cur = current.and_then(|t| t.as_str().parse::<u64>().ok()).unwrap_or(0);
        self.clock = self.clock.max(cur) + 1;
        VersionToken::new(self.clock.to_string())
    }

    fn take_fault(&mut self, verb: Verb) -> Option<Fault> {
        let idx = self.faults.iter().position(|(v, _)| *v == verb)?;
        Some(self.faults.remove(idx).1)
    }

    fn concurrent_write(&mut self, key: &(String, String)) {
        let current = self.objects.get(key).map(|o| o.version_token.clone());
        if let Some(current) = current {
            let next = self.next_token(Some(&current));
            if let Some(obj) = self.objects.get_mut(key) {
                debug!(ns = %key.0, name = %key.1, from = %current, to = %next, "simulated concurrent write");
                obj.version_token = next;
            }
        }
    }
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert an object as-is, keeping its version token. Not recorded.
    pub fn seed(&self, snap: ResourceSnapshot) {
        let mut g = self.lock();
        let key = (snap.store_namespace().to_string(), snap.name.clone());
        if let Ok(v) = snap.version_token.as_str().parse::<u64>() {
            g.clock = g.clock.max(v);
        }
        g.objects.insert(key, snap);
    }

    /// Script a fault for the next call of `verb`. Faults for the same verb
    /// are consumed in the order they were injected.
    pub fn inject(&self, verb: Verb, fault: Fault) {
        self.lock().faults.push((verb, fault));
    }

    pub fn object(&self, namespace: &str, name: &str) -> Option<ResourceSnapshot> {
        self.lock().objects.get(&(namespace.to_string(), name.to_string())).cloned()
    }

    pub fn len(&self) -> usize { self.lock().objects.len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn actions(&self) -> Vec<Action> { self.lock().actions.clone() }

    pub fn count(&self, verb: Verb) -> usize {
        self.lock().actions.iter().filter(|a| a.verb == verb).count()
    }

    pub fn clear_actions(&self) { self.lock().actions.clear(); }

    /// Record the call and resolve its scripted fault, if any. Delays are
    /// slept here, outside the lock.
    async fn begin(&self, action: Action) -> StoreResult<()> {
        let key = (action.namespace.clone(), action.name.clone());
        let fault = {
            let mut g = self.lock();
            let verb = action.verb;
            g.actions.push(action);
            g.take_fault(verb)
        };
        match fault {
            None => Ok(()),
            Some(Fault::Error(e)) => Err(e),
            Some(Fault::ConcurrentWrite) => {
                self.lock().concurrent_write(&key);
                Ok(())
            }
            Some(Fault::Delay(d)) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

#[async_trait::async_trait]
impl ResourceStore for MemoryStore {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<ResourceSnapshot> {
        self.begin(Action::get(namespace, name)).await?;
        self.object(namespace, name).ok_or(StoreError::NotFound)
    }

    async fn create(&self, snap: &ResourceSnapshot) -> StoreResult<()> {
        let ns = snap.store_namespace();
        self.begin(Action::create(ns, &snap.name, snap.version_token.as_str())).await?;
        let mut g = self.lock();
        let key = (ns.to_string(), snap.name.clone());
        if g.objects.contains_key(&key) {
            return Err(StoreError::Backend(format!("{}/{} already exists", ns, snap.name)));
        }
        let token = g.next_token(None);
        debug!(ns = %ns, name = %snap.name, version = %token, "created");
        g.objects.insert(key, snap.rebased(token));
        Ok(())
    }

    async fn update(&self, snap: &ResourceSnapshot) -> StoreResult<()> {
        let ns = snap.store_namespace();
        self.begin(Action::update(ns, &snap.name, snap.version_token.as_str())).await?;
        let mut g = self.lock();
        let key = (ns.to_string(), snap.name.clone());
        let current = match g.objects.get(&key) {
            Some(obj) => obj.version_token.clone(),
            None => return Err(StoreError::NotFound),
        };
        // An empty token is an unconditional write, as with Kubernetes.
        if !snap.version_token.is_empty() && snap.version_token != current {
            debug!(ns = %ns, name = %snap.name, sent = %snap.version_token, stored = %current, "update conflict");
            return Err(StoreError::Conflict);
        }
        let token = g.next_token(Some(&current));
        debug!(ns = %ns, name = %snap.name, version = %token, "updated");
        g.objects.insert(key, snap.rebased(token));
        Ok(())
    }

    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()> {
        self.begin(Action::delete(namespace, name)).await?;
        let mut g = self.lock();
        match g.objects.remove(&(namespace.to_string(), name.to_string())) {
            Some(_) => {
                debug!(ns = %namespace, name = %name, "deleted");
                Ok(())
            }
            None => Err(StoreError::NotFound),
        }
    }
}
