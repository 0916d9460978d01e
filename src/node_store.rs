//! Node store facade over the cluster API.
//!
//! All Node reads and writes go through the [`NodeStore`] trait so the
//! reconciler can be exercised against an in-memory store. The production
//! implementation wraps `kube::Api<Node>` and owns the optimistic-concurrency
//! discipline: every write is a fetch, an in-place mutation, and a replace,
//! retried with backoff when the API reports a version conflict. Mutators
//! therefore run any number of times and must be idempotent.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config, ResourceExt};

use crate::error::{Error, Result};
use crate::retry::{retry_with_backoff, RetryConfig};

/// Mutation applied to a node under the conflict-retry discipline.
pub type NodeMutator<'a> = &'a (dyn Fn(&mut Node) + Send + Sync);

/// Storage interface for Node objects.
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// List every node in the cluster.
    async fn list_nodes(&self) -> Result<Vec<Node>>;

    /// Fetch a single node by name.
    async fn get_node(&self, name: &str) -> Result<Node>;

    /// Apply `mutate` to the named node and persist the result.
    ///
    /// The node's annotation and label maps are initialized before the
    /// mutator runs, so mutators may insert without checking for `None`.
    /// On a version conflict the node is re-fetched and the mutator re-run;
    /// mutators must be idempotent.
    async fn update_node(&self, name: &str, mutate: NodeMutator<'_>) -> Result<()>;

    /// Toggle the node's schedulability flag.
    async fn set_unschedulable(&self, name: &str, unschedulable: bool) -> Result<()> {
        self.update_node(name, &move |node: &mut Node| {
            node.spec.get_or_insert_with(Default::default).unschedulable = Some(unschedulable);
        })
        .await
    }
}

/// Create a kube client from an optional kubeconfig path, falling back to
/// the in-cluster service account environment.
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path)
                .map_err(|e| Error::Config(format!("failed to read kubeconfig: {e}")))?;
            let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| Error::Config(format!("failed to load kubeconfig: {e}")))?;
            Client::try_from(config)
                .map_err(|e| Error::Config(format!("failed to create client: {e}")))
        }
        None => Client::try_default()
            .await
            .map_err(|e| Error::Config(format!("failed to create client: {e}"))),
    }
}

/// Production [`NodeStore`] backed by the cluster API.
pub struct KubeNodeStore {
    api: Api<Node>,
    retry: RetryConfig,
}

impl KubeNodeStore {
    /// Create a store using the default conflict-retry budget.
    pub fn new(client: Client) -> Self {
        Self {
            api: Api::all(client),
            retry: RetryConfig::default(),
        }
    }
}

#[async_trait]
impl NodeStore for KubeNodeStore {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        let list = self
            .api
            .list(&ListParams::default())
            .await
            .map_err(Error::from_kube)?;
        Ok(list.items)
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.api.get(name).await.map_err(Error::from_kube)
    }

    async fn update_node(&self, name: &str, mutate: NodeMutator<'_>) -> Result<()> {
        retry_with_backoff(&self.retry, "update_node", Error::is_retryable, || async {
            let mut node = self.api.get(name).await.map_err(Error::from_kube)?;
            node.metadata.annotations.get_or_insert_with(BTreeMap::new);
            node.metadata.labels.get_or_insert_with(BTreeMap::new);
            mutate(&mut node);
            self.api
                .replace(name, &PostParams::default(), &node)
                .await
                .map_err(Error::from_kube)?;
            Ok(())
        })
        .await
    }
}

/// In-memory [`NodeStore`] for tests.
///
/// Nodes are listed in name order, which keeps admission-order assertions
/// deterministic. Every mutator is applied a second time to the already
/// mutated node; if the second application changes anything the store panics,
/// because such a mutator would corrupt state under conflict retries.
#[derive(Default)]
pub struct FakeNodeStore {
    nodes: Mutex<BTreeMap<String, Node>>,
    list_failures: AtomicUsize,
    update_count: AtomicUsize,
}

impl FakeNodeStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a node.
    pub fn add(&self, node: Node) {
        let name = node.name_any();
        self.nodes.lock().unwrap().insert(name, node);
    }

    /// Snapshot a node, if present.
    pub fn get(&self, name: &str) -> Option<Node> {
        self.nodes.lock().unwrap().get(name).cloned()
    }

    /// Make the next `n` list calls fail with a transient error.
    pub fn fail_next_lists(&self, n: usize) {
        self.list_failures.store(n, Ordering::SeqCst);
    }

    /// Number of updates applied so far.
    pub fn update_count(&self) -> usize {
        self.update_count.load(Ordering::SeqCst)
    }

    fn transient_error() -> Error {
        Error::from_kube(kube::Error::Api(kube::core::ErrorResponse {
            status: "Failure".to_string(),
            message: "injected server error".to_string(),
            reason: "ServerTimeout".to_string(),
            code: 500,
        }))
    }
}

#[async_trait]
impl NodeStore for FakeNodeStore {
    async fn list_nodes(&self) -> Result<Vec<Node>> {
        if self
            .list_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Self::transient_error());
        }
        Ok(self.nodes.lock().unwrap().values().cloned().collect())
    }

    async fn get_node(&self, name: &str) -> Result<Node> {
        self.get(name)
            .ok_or_else(|| Error::NotFound(format!("nodes \"{name}\" not found")))
    }

    async fn update_node(&self, name: &str, mutate: NodeMutator<'_>) -> Result<()> {
        let mut nodes = self.nodes.lock().unwrap();
        let node = nodes
            .get_mut(name)
            .ok_or_else(|| Error::NotFound(format!("nodes \"{name}\" not found")))?;
        node.metadata.annotations.get_or_insert_with(BTreeMap::new);
        node.metadata.labels.get_or_insert_with(BTreeMap::new);
        mutate(node);

        let mut reapplied = node.clone();
        mutate(&mut reapplied);
        assert_eq!(
            *node, reapplied,
            "mutator for node {name} is not idempotent"
        );

        self.update_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    fn node(name: &str) -> Node {
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fake_store_lists_in_name_order() {
        let store = FakeNodeStore::new();
        store.add(node("zeta"));
        store.add(node("alpha"));
        let names: Vec<_> = store
            .list_nodes()
            .await
            .unwrap()
            .iter()
            .map(ResourceExt::name_any)
            .collect();
        assert_eq!(names, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn fake_store_updates_initialize_maps() {
        let store = FakeNodeStore::new();
        store.add(node("worker-0"));
        store
            .update_node("worker-0", &|n| {
                n.metadata
                    .annotations
                    .as_mut()
                    .unwrap()
                    .insert("k".to_string(), "v".to_string());
            })
            .await
            .unwrap();
        let updated = store.get("worker-0").unwrap();
        assert_eq!(
            updated.annotations().get("k").map(String::as_str),
            Some("v")
        );
        assert_eq!(store.update_count(), 1);
    }

    #[tokio::test]
    async fn fake_store_reports_missing_nodes() {
        let store = FakeNodeStore::new();
        let err = store.update_node("ghost", &|_| {}).await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
        let err = store.get_node("ghost").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn fake_store_gets_by_name() {
        let store = FakeNodeStore::new();
        store.add(node("worker-0"));
        let fetched = store.get_node("worker-0").await.unwrap();
        assert_eq!(fetched.name_any(), "worker-0");
    }

    #[tokio::test]
    async fn fake_store_injects_transient_list_failures() {
        let store = FakeNodeStore::new();
        store.add(node("worker-0"));
        store.fail_next_lists(1);
        assert!(store.list_nodes().await.unwrap_err().is_retryable());
        assert_eq!(store.list_nodes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    #[should_panic(expected = "not idempotent")]
    async fn fake_store_rejects_non_idempotent_mutators() {
        let store = FakeNodeStore::new();
        store.add(node("worker-0"));
        let _ = store
            .update_node("worker-0", &|n| {
                let annotations = n.metadata.annotations.as_mut().unwrap();
                let next = annotations.len().to_string();
                annotations.insert(format!("counter-{next}"), next);
            })
            .await;
    }

    #[tokio::test]
    async fn set_unschedulable_round_trips() {
        let store = FakeNodeStore::new();
        store.add(node("worker-0"));
        store.set_unschedulable("worker-0", true).await.unwrap();
        let updated = store.get("worker-0").unwrap();
        assert_eq!(updated.spec.unwrap().unschedulable, Some(true));
        store.set_unschedulable("worker-0", false).await.unwrap();
        let updated = store.get("worker-0").unwrap();
        assert_eq!(updated.spec.unwrap().unschedulable, Some(false));
    }
}
