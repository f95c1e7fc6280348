use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use sha2::{Digest, Sha256};
use tokio::sync::OnceCell;
use tracing::debug;

use chainflow_core::error::Result;
use chainflow_core::instance::NodeInstance;
use chainflow_core::types::SessionId;

use crate::graph::NodeDefinition;

/// Identity of a cached instance.
///
/// Session-scoped nodes carry the session id, so their instances are never
/// shared across sessions. Everything else is shared by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub node_id: String,
    pub fingerprint: String,
    pub session: Option<SessionId>,
}

impl CacheKey {
    pub fn shared(node_id: impl Into<String>, fingerprint: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            fingerprint: fingerprint.into(),
            session: None,
        }
    }

    pub fn per_session(
        node_id: impl Into<String>,
        fingerprint: impl Into<String>,
        session: SessionId,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            fingerprint: fingerprint.into(),
            session: Some(session),
        }
    }
}

/// Fingerprint of a node's configuration: its type, selected output,
/// literals, and the fingerprints of what feeds each port.
///
/// `upstream` holds `(port, upstream fingerprint)` pairs in edge order.
pub fn fingerprint(node: &NodeDefinition, upstream: &[(String, String)]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(node.type_name().as_bytes());
    hasher.update([0]);
    hasher.update(node.selected_output.as_deref().unwrap_or("").as_bytes());
    hasher.update([0]);
    for (name, value) in &node.params {
        hasher.update(name.as_bytes());
        hasher.update([b'=']);
        hasher.update(value.to_string().as_bytes());
        hasher.update([0]);
    }
    for (port, upstream_fp) in upstream {
        hasher.update(port.as_bytes());
        hasher.update([b'<']);
        hasher.update(upstream_fp.as_bytes());
        hasher.update([0]);
    }
    format!("{:x}", hasher.finalize())
}

/// Process-wide cache of constructed node instances.
///
/// Each key owns a `OnceCell`, so concurrent requests for the same key
/// construct at most once. A failed or abandoned construction removes its
/// cell and the next request retries. Building a node under a new
/// fingerprint drops what was built for the old one.
#[derive(Default)]
pub struct InstanceCache {
    entries: Mutex<HashMap<CacheKey, Arc<OnceCell<NodeInstance>>>>,
}

impl InstanceCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn cell(&self, key: CacheKey) -> Arc<OnceCell<NodeInstance>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.entry(key).or_default().clone()
    }

    /// Return the cached instance for `key`, constructing it with `construct`
    /// when absent. The flag is true when this call constructed it.
    pub async fn get_or_create<F, Fut>(&self, key: CacheKey, construct: F) -> Result<(NodeInstance, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<NodeInstance>>,
    {
        let pending = PendingCell {
            cache: self,
            cell: self.cell(key.clone()),
            key,
        };
        let mut created = false;
        let instance = pending
            .cell
            .get_or_try_init(|| {
                created = true;
                construct()
            })
            .await?
            .clone();
        if created {
            self.supersede(&pending.key);
        }
        Ok((instance, created))
    }

    /// Remove `cell` if it is still empty and nobody else is waiting on it.
    fn discard(&self, key: &CacheKey, cell: &Arc<OnceCell<NodeInstance>>) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = entries.get(key).is_some_and(|current| {
            Arc::ptr_eq(current, cell) && !current.initialized() && Arc::strong_count(cell) <= 2
        });
        if idle {
            entries.remove(key);
        }
    }

    /// Drop entries of the same node and scope built under another fingerprint.
    fn supersede(&self, key: &CacheKey) {
        let stale = self.retain(|other| {
            other.node_id != key.node_id
                || other.session != key.session
                || other.fingerprint == key.fingerprint
        });
        if stale > 0 {
            debug!(node = %key.node_id, stale, "Dropped instances with an outdated configuration");
        }
    }

    pub fn get(&self, key: &CacheKey) -> Option<NodeInstance> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).and_then(|cell| cell.get().cloned())
    }

    /// Drop every instance scoped to `session`. Returns how many were removed.
    pub fn evict_session(&self, session: &SessionId) -> usize {
        self.retain(|key| key.session.as_ref() != Some(session))
    }

    /// Drop every instance of node `node_id`, in any session.
    pub fn evict_node(&self, node_id: &str) -> usize {
        self.retain(|key| key.node_id != node_id)
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.clear();
    }

    /// Number of constructed instances.
    pub fn len(&self) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.values().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep entries matching `keep`. Returns how many constructed instances
    /// were dropped; cells still under construction are not counted.
    fn retain(&self, keep: impl Fn(&CacheKey) -> bool) -> usize {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let mut dropped = 0;
        entries.retain(|key, cell| {
            if keep(key) {
                return true;
            }
            if cell.initialized() {
                dropped += 1;
            }
            false
        });
        dropped
    }
}

/// A cell this call is using. Dropping it while the cell is still empty,
/// after a failure or a cancelled construction, removes the cell.
struct PendingCell<'a> {
    cache: &'a InstanceCache,
    key: CacheKey,
    cell: Arc<OnceCell<NodeInstance>>,
}

impl Drop for PendingCell<'_> {
    fn drop(&mut self) {
        if !self.cell.initialized() {
            self.cache.discard(&self.key, &self.cell);
        }
    }
}
