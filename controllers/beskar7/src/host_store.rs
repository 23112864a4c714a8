//! Host persistence seam for the claim coordinator
//!
//! The PhysicalHost object is the concurrency arbiter: all contention
//! resolves through conditional writes on its resource version. The
//! coordinator talks to hosts through [`HostStore`] so the kube-backed
//! store and the in-memory store used in tests share one conflict
//! contract: an update whose resource version is stale fails with
//! [`HostStoreError::Conflict`] and mutates nothing.

use async_trait::async_trait;
use crds::PhysicalHost;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use thiserror::Error;

use crate::error::is_conflict;

/// Errors surfaced by a host store.
#[derive(Debug, Error)]
pub enum HostStoreError {
    /// The write lost an optimistic-concurrency race; re-read and retry
    #[error("version conflict on {0}")]
    Conflict(String),

    /// Host does not exist (any more)
    #[error("host not found: {0}")]
    NotFound(String),

    /// Anything else the API returned
    #[error("host store error: {0}")]
    Api(String),
}

impl From<kube::Error> for HostStoreError {
    fn from(e: kube::Error) -> Self {
        if is_conflict(&e) {
            return HostStoreError::Conflict(e.to_string());
        }
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => HostStoreError::NotFound(e.to_string()),
            _ => HostStoreError::Api(e.to_string()),
        }
    }
}

/// Versioned read/write access to PhysicalHosts.
#[async_trait]
pub trait HostStore: Send + Sync {
    /// All hosts in the namespace.
    async fn list(&self, namespace: &str) -> Result<Vec<PhysicalHost>, HostStoreError>;

    /// Fresh read of one host, including its current resource version.
    async fn get(&self, namespace: &str, name: &str) -> Result<PhysicalHost, HostStoreError>;

    /// Replace spec and metadata, conditioned on the resource version
    /// carried inside `host`.
    async fn update(&self, host: &PhysicalHost) -> Result<PhysicalHost, HostStoreError>;

    /// Replace the status subresource, conditioned on the resource version
    /// carried inside `host`.
    async fn update_status(&self, host: &PhysicalHost) -> Result<PhysicalHost, HostStoreError>;
}

/// Host store backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeHostStore {
    client: Client,
}

impl std::fmt::Debug for KubeHostStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeHostStore").finish_non_exhaustive()
    }
}

impl KubeHostStore {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<PhysicalHost> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl HostStore for KubeHostStore {
    async fn list(&self, namespace: &str) -> Result<Vec<PhysicalHost>, HostStoreError> {
        let hosts = self.api(namespace).list(&ListParams::default()).await?;
        Ok(hosts.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<PhysicalHost, HostStoreError> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn update(&self, host: &PhysicalHost) -> Result<PhysicalHost, HostStoreError> {
        let namespace = host
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| HostStoreError::Api("host has no namespace".to_string()))?;
        let name = host
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| HostStoreError::Api("host has no name".to_string()))?;
        Ok(self
            .api(namespace)
            .replace(name, &PostParams::default(), host)
            .await?)
    }

    async fn update_status(&self, host: &PhysicalHost) -> Result<PhysicalHost, HostStoreError> {
        let namespace = host
            .metadata
            .namespace
            .as_deref()
            .ok_or_else(|| HostStoreError::Api("host has no namespace".to_string()))?;
        let name = host
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| HostStoreError::Api("host has no name".to_string()))?;
        let data = serde_json::to_vec(host)
            .map_err(|e| HostStoreError::Api(format!("serialize status: {e}")))?;
        Ok(self
            .api(namespace)
            .replace_status(name, &PostParams::default(), data)
            .await?)
    }
}

/// In-memory host store with real optimistic-concurrency semantics, for
/// coordinator and reconciler tests.
#[cfg(test)]
pub mod mem {
    use std::collections::BTreeMap;
    use std::sync::{Arc, Mutex, MutexGuard};

    use super::*;

    #[derive(Debug, Default, Clone)]
    pub struct InMemoryHostStore {
        hosts: Arc<Mutex<BTreeMap<String, PhysicalHost>>>,
    }

    impl InMemoryHostStore {
        pub fn new() -> Self {
            Self::default()
        }

        fn lock(&self) -> MutexGuard<'_, BTreeMap<String, PhysicalHost>> {
            match self.hosts.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            }
        }

        fn key(namespace: &str, name: &str) -> String {
            format!("{namespace}/{name}")
        }

        /// Seed a host; assigns resource version "1".
        pub fn insert(&self, mut host: PhysicalHost) {
            let key = Self::key(
                host.metadata.namespace.as_deref().unwrap_or_default(),
                host.metadata.name.as_deref().unwrap_or_default(),
            );
            host.metadata.resource_version = Some("1".to_string());
            self.lock().insert(key, host);
        }

        /// Direct snapshot without going through the trait.
        pub fn snapshot(&self, namespace: &str, name: &str) -> Option<PhysicalHost> {
            self.lock().get(&Self::key(namespace, name)).cloned()
        }

        fn bump_version(host: &mut PhysicalHost) {
            let next = host
                .metadata
                .resource_version
                .as_deref()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(0)
                + 1;
            host.metadata.resource_version = Some(next.to_string());
        }

        fn checked_write(
            &self,
            incoming: &PhysicalHost,
            merge: impl FnOnce(&mut PhysicalHost, &PhysicalHost),
        ) -> Result<PhysicalHost, HostStoreError> {
            let namespace = incoming.metadata.namespace.as_deref().unwrap_or_default();
            let name = incoming.metadata.name.as_deref().unwrap_or_default();
            let key = Self::key(namespace, name);

            let mut hosts = self.lock();
            let stored = hosts
                .get_mut(&key)
                .ok_or_else(|| HostStoreError::NotFound(key.clone()))?;

            if incoming.metadata.resource_version != stored.metadata.resource_version {
                return Err(HostStoreError::Conflict(key));
            }

            merge(stored, incoming);
            Self::bump_version(stored);
            Ok(stored.clone())
        }
    }

    // Each method yields once before touching state, like a real API
    // round-trip, so concurrent claim tests exercise true interleavings.
    #[async_trait]
    impl HostStore for InMemoryHostStore {
        async fn list(&self, namespace: &str) -> Result<Vec<PhysicalHost>, HostStoreError> {
            tokio::task::yield_now().await;
            let prefix = format!("{namespace}/");
            Ok(self
                .lock()
                .iter()
                .filter(|(k, _)| k.starts_with(&prefix))
                .map(|(_, h)| h.clone())
                .collect())
        }

        async fn get(&self, namespace: &str, name: &str) -> Result<PhysicalHost, HostStoreError> {
            tokio::task::yield_now().await;
            self.snapshot(namespace, name)
                .ok_or_else(|| HostStoreError::NotFound(Self::key(namespace, name)))
        }

        async fn update(&self, host: &PhysicalHost) -> Result<PhysicalHost, HostStoreError> {
            tokio::task::yield_now().await;
            self.checked_write(host, |stored, incoming| {
                stored.spec = incoming.spec.clone();
                stored.metadata.annotations = incoming.metadata.annotations.clone();
                stored.metadata.labels = incoming.metadata.labels.clone();
                stored.metadata.finalizers = incoming.metadata.finalizers.clone();
            })
        }

        async fn update_status(&self, host: &PhysicalHost) -> Result<PhysicalHost, HostStoreError> {
            tokio::task::yield_now().await;
            self.checked_write(host, |stored, incoming| {
                stored.status = incoming.status.clone();
            })
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use crate::test_utils::available_host;

        #[tokio::test]
        async fn stale_write_conflicts_and_mutates_nothing() {
            let store = InMemoryHostStore::new();
            store.insert(available_host("metal", "h-a"));

            let mut first = store.get("metal", "h-a").await.unwrap();
            let second = store.get("metal", "h-a").await.unwrap();

            first.spec.boot_iso_source = Some("https://images/a.iso".to_string());
            store.update(&first).await.unwrap();

            // `second` still carries version 1; its write must lose.
            let mut stale = second.clone();
            stale.spec.boot_iso_source = Some("https://images/b.iso".to_string());
            let err = store.update(&stale).await.unwrap_err();
            assert!(matches!(err, HostStoreError::Conflict(_)));

            let current = store.snapshot("metal", "h-a").unwrap();
            assert_eq!(
                current.spec.boot_iso_source.as_deref(),
                Some("https://images/a.iso")
            );
        }

        #[tokio::test]
        async fn status_and_spec_versions_share_one_token() {
            let store = InMemoryHostStore::new();
            store.insert(available_host("metal", "h-a"));

            let host = store.get("metal", "h-a").await.unwrap();
            let updated = store.update(&host).await.unwrap();
            assert_ne!(
                updated.metadata.resource_version,
                host.metadata.resource_version
            );

            // A status write against the pre-update version conflicts.
            let err = store.update_status(&host).await.unwrap_err();
            assert!(matches!(err, HostStoreError::Conflict(_)));
        }
    }
}
