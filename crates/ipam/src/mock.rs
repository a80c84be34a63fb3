//! In-memory IpamStore for unit testing
//!
//! Behaves like the API server where the allocators depend on it:
//! - every write bumps `metadata.resourceVersion` and stale replaces fail with `Conflict`
//! - deleting an object that still has finalizers only sets `deletionTimestamp`;
//!   the object goes away once its last finalizer is removed
//! - creating an existing name fails with `AlreadyExists`
//!
//! BlockRequest writes are broadcast so a test can play the controller and
//! the watcher that feeds `NodeIpam::notify`.

use crate::error::StoreError;
use crate::store::IpamStore;
use crds::{AddressBlock, AddressPool, BlockRequest, BlockRequestStatus};
use k8s_openapi::api::core::v1::Node;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

/// BlockRequest change observed by the mock store
#[derive(Debug, Clone)]
pub enum RequestEvent {
    /// A request was created
    Created(BlockRequest),
    /// A request's status was written
    StatusUpdated(BlockRequest),
    /// A request was deleted
    Deleted(String),
}

/// Mock IpamStore for testing
#[derive(Clone)]
pub struct MockStore {
    pub(crate) pools: Arc<Mutex<BTreeMap<String, AddressPool>>>,
    pub(crate) blocks: Arc<Mutex<BTreeMap<String, AddressBlock>>>,
    pub(crate) requests: Arc<Mutex<BTreeMap<String, BlockRequest>>>,
    pub(crate) nodes: Arc<Mutex<BTreeMap<String, Node>>>,
    // Number of upcoming block replaces that fail with Conflict
    pub(crate) injected_conflicts: Arc<Mutex<u32>>,
    // Number of upcoming block deletes that fail
    pub(crate) injected_delete_failures: Arc<Mutex<u32>>,
    pub(crate) calls: Arc<AtomicU64>,
    pub(crate) next_version: Arc<AtomicU64>,
    pub(crate) events: broadcast::Sender<RequestEvent>,
}

impl Default for MockStore {
    fn default() -> Self {
        Self::new()
    }
}

fn now() -> Option<Time> {
    let ts = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
    serde_json::from_value(serde_json::Value::String(ts)).ok()
}

fn is_deleting(meta: &ObjectMeta) -> bool {
    meta.deletion_timestamp.is_some()
}

fn has_finalizers(meta: &ObjectMeta) -> bool {
    meta.finalizers.as_ref().is_some_and(|f| !f.is_empty())
}

fn matches_labels(meta: &ObjectMeta, filters: &[(&str, &str)]) -> bool {
    filters.iter().all(|(k, v)| {
        meta.labels
            .as_ref()
            .and_then(|labels| labels.get(*k))
            .is_some_and(|actual| actual == v)
    })
}

impl MockStore {
    /// Create a new, empty mock store
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            pools: Arc::new(Mutex::new(BTreeMap::new())),
            blocks: Arc::new(Mutex::new(BTreeMap::new())),
            requests: Arc::new(Mutex::new(BTreeMap::new())),
            nodes: Arc::new(Mutex::new(BTreeMap::new())),
            injected_conflicts: Arc::new(Mutex::new(0)),
            injected_delete_failures: Arc::new(Mutex::new(0)),
            calls: Arc::new(AtomicU64::new(0)),
            next_version: Arc::new(AtomicU64::new(1)),
            events,
        }
    }

    fn stamp(&self, meta: &mut ObjectMeta) {
        let version = self.next_version.fetch_add(1, Ordering::SeqCst);
        meta.resource_version = Some(version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
    }

    fn call(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of store operations served so far
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Subscribe to BlockRequest events
    pub fn subscribe(&self) -> broadcast::Receiver<RequestEvent> {
        self.events.subscribe()
    }

    /// Add an AddressPool to the mock store (for test setup)
    pub fn add_pool(&self, mut pool: AddressPool) {
        self.stamp(&mut pool.metadata);
        let name = pool.metadata.name.clone().unwrap_or_default();
        self.pools.lock().unwrap().insert(name, pool);
    }

    /// Add an AddressBlock to the mock store (for test setup)
    pub fn add_block(&self, mut block: AddressBlock) {
        self.stamp(&mut block.metadata);
        let name = block.metadata.name.clone().unwrap_or_default();
        self.blocks.lock().unwrap().insert(name, block);
    }

    /// Add a Node to the mock store (for test setup)
    pub fn add_node(&self, name: &str) {
        let mut node = Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        self.stamp(&mut node.metadata);
        self.nodes.lock().unwrap().insert(name.to_string(), node);
    }

    /// Remove a Node from the mock store
    pub fn remove_node(&self, name: &str) {
        self.nodes.lock().unwrap().remove(name);
    }

    /// Mark a pool for deletion; it goes away once its finalizers are removed
    pub fn delete_pool(&self, name: &str) {
        let mut pools = self.pools.lock().unwrap();
        let remove = match pools.get_mut(name) {
            Some(pool) if has_finalizers(&pool.metadata) => {
                pool.metadata.deletion_timestamp = now();
                false
            }
            Some(_) => true,
            None => false,
        };
        if remove {
            pools.remove(name);
        }
    }

    /// Make the next `n` block replaces fail with `Conflict`
    pub fn inject_conflicts(&self, n: u32) {
        *self.injected_conflicts.lock().unwrap() = n;
    }

    /// Make the next `n` block deletes fail
    pub fn inject_delete_failures(&self, n: u32) {
        *self.injected_delete_failures.lock().unwrap() = n;
    }

    /// Snapshot of a block, if present
    pub fn block(&self, name: &str) -> Option<AddressBlock> {
        self.blocks.lock().unwrap().get(name).cloned()
    }

    /// Names of all stored blocks
    pub fn block_names(&self) -> Vec<String> {
        self.blocks.lock().unwrap().keys().cloned().collect()
    }

    /// Snapshot of a pool, if present
    pub fn pool(&self, name: &str) -> Option<AddressPool> {
        self.pools.lock().unwrap().get(name).cloned()
    }

    /// Snapshot of a block request, if present
    pub fn block_request(&self, name: &str) -> Option<BlockRequest> {
        self.requests.lock().unwrap().get(name).cloned()
    }

    fn check_version(stored: &ObjectMeta, incoming: &ObjectMeta, kind: &str) -> Result<(), StoreError> {
        match (&incoming.resource_version, &stored.resource_version) {
            (Some(theirs), Some(ours)) if theirs != ours => Err(StoreError::Conflict(format!(
                "{} {} has been modified",
                kind,
                incoming.name.as_deref().unwrap_or_default()
            ))),
            _ => Ok(()),
        }
    }
}

#[async_trait::async_trait]
impl IpamStore for MockStore {
    async fn get_pool(&self, name: &str) -> Result<AddressPool, StoreError> {
        self.call();
        self.pools
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("AddressPool {} not found", name)))
    }

    async fn replace_pool(&self, pool: &AddressPool) -> Result<AddressPool, StoreError> {
        self.call();
        let name = pool.metadata.name.clone().unwrap_or_default();
        let mut pools = self.pools.lock().unwrap();
        let stored = pools
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(format!("AddressPool {} not found", name)))?;
        Self::check_version(&stored.metadata, &pool.metadata, "AddressPool")?;

        let mut updated = pool.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        self.stamp(&mut updated.metadata);
        if is_deleting(&updated.metadata) && !has_finalizers(&updated.metadata) {
            pools.remove(&name);
        } else {
            pools.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn list_blocks(&self, filters: &[(&str, &str)]) -> Result<Vec<AddressBlock>, StoreError> {
        self.call();
        Ok(self
            .blocks
            .lock()
            .unwrap()
            .values()
            .filter(|b| matches_labels(&b.metadata, filters))
            .cloned()
            .collect())
    }

    async fn get_block(&self, name: &str) -> Result<AddressBlock, StoreError> {
        self.call();
        self.blocks
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("AddressBlock {} not found", name)))
    }

    async fn create_block(&self, block: &AddressBlock) -> Result<AddressBlock, StoreError> {
        self.call();
        let name = block.metadata.name.clone().unwrap_or_default();
        let mut blocks = self.blocks.lock().unwrap();
        if blocks.contains_key(&name) {
            return Err(StoreError::AlreadyExists(format!("AddressBlock {} already exists", name)));
        }
        let mut created = block.clone();
        created.metadata.uid = None;
        self.stamp(&mut created.metadata);
        blocks.insert(name, created.clone());
        Ok(created)
    }

    async fn replace_block(&self, block: &AddressBlock) -> Result<AddressBlock, StoreError> {
        self.call();
        {
            let mut conflicts = self.injected_conflicts.lock().unwrap();
            if *conflicts > 0 {
                *conflicts -= 1;
                return Err(StoreError::Conflict("injected conflict".to_string()));
            }
        }

        let name = block.metadata.name.clone().unwrap_or_default();
        let mut blocks = self.blocks.lock().unwrap();
        let stored = blocks
            .get(&name)
            .ok_or_else(|| StoreError::NotFound(format!("AddressBlock {} not found", name)))?;
        Self::check_version(&stored.metadata, &block.metadata, "AddressBlock")?;

        let mut updated = block.clone();
        updated.metadata.deletion_timestamp = stored.metadata.deletion_timestamp.clone();
        updated.metadata.uid = stored.metadata.uid.clone();
        self.stamp(&mut updated.metadata);
        if is_deleting(&updated.metadata) && !has_finalizers(&updated.metadata) {
            blocks.remove(&name);
        } else {
            blocks.insert(name, updated.clone());
        }
        Ok(updated)
    }

    async fn delete_block(&self, name: &str) -> Result<(), StoreError> {
        self.call();
        {
            let mut failures = self.injected_delete_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                let err = serde_json::from_str::<u8>("injected delete failure").unwrap_err();
                return Err(StoreError::Serialization(err));
            }
        }

        let mut blocks = self.blocks.lock().unwrap();
        let block = blocks
            .get_mut(name)
            .ok_or_else(|| StoreError::NotFound(format!("AddressBlock {} not found", name)))?;
        if has_finalizers(&block.metadata) {
            if block.metadata.deletion_timestamp.is_none() {
                block.metadata.deletion_timestamp = now();
                self.stamp(&mut block.metadata);
            }
        } else {
            blocks.remove(name);
        }
        Ok(())
    }

    async fn get_block_request(&self, name: &str) -> Result<BlockRequest, StoreError> {
        self.call();
        self.requests
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("BlockRequest {} not found", name)))
    }

    async fn create_block_request(&self, request: &BlockRequest) -> Result<BlockRequest, StoreError> {
        self.call();
        let name = request.metadata.name.clone().unwrap_or_default();
        let created = {
            let mut requests = self.requests.lock().unwrap();
            if requests.contains_key(&name) {
                return Err(StoreError::AlreadyExists(format!("BlockRequest {} already exists", name)));
            }
            let mut created = request.clone();
            created.status = None;
            self.stamp(&mut created.metadata);
            requests.insert(name, created.clone());
            created
        };
        let _ = self.events.send(RequestEvent::Created(created.clone()));
        Ok(created)
    }

    async fn update_block_request_status(&self, name: &str, status: &BlockRequestStatus) -> Result<BlockRequest, StoreError> {
        self.call();
        let updated = {
            let mut requests = self.requests.lock().unwrap();
            let request = requests
                .get_mut(name)
                .ok_or_else(|| StoreError::NotFound(format!("BlockRequest {} not found", name)))?;
            request.status = Some(status.clone());
            self.stamp(&mut request.metadata);
            request.clone()
        };
        let _ = self.events.send(RequestEvent::StatusUpdated(updated.clone()));
        Ok(updated)
    }

    async fn delete_block_request(&self, name: &str) -> Result<(), StoreError> {
        self.call();
        self.requests
            .lock()
            .unwrap()
            .remove(name)
            .ok_or_else(|| StoreError::NotFound(format!("BlockRequest {} not found", name)))?;
        let _ = self.events.send(RequestEvent::Deleted(name.to_string()));
        Ok(())
    }

    async fn get_node(&self, name: &str) -> Result<Node, StoreError> {
        self.call();
        self.nodes
            .lock()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("Node {} not found", name)))
    }
}
