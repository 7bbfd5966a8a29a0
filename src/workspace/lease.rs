use super::registry::RegistryShared;
use crate::shared::ids::{ExecutionId, NodeName};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Exclusive claim on one concrete workspace path of one node.
///
/// Clones share the same claim: releasing through any clone releases it for all of them,
/// and only the first release has an effect.
#[derive(Debug, Clone)]
pub struct Lease {
    inner: Arc<LeaseInner>,
}

#[derive(Debug)]
struct LeaseInner {
    lease_id: u64,
    node: NodeName,
    path: PathBuf,
    base_path: PathBuf,
    ordinal: u32,
    holder: String,
    acquired_at: i64,
    held: AtomicBool,
    registry: Weak<RegistryShared>,
}

pub(crate) struct LeaseParts {
    pub lease_id: u64,
    pub node: NodeName,
    pub path: PathBuf,
    pub base_path: PathBuf,
    pub ordinal: u32,
    pub holder: String,
    pub acquired_at: i64,
}

impl Lease {
    pub(crate) fn new(parts: LeaseParts, registry: &Arc<RegistryShared>) -> Self {
        Self {
            inner: Arc::new(LeaseInner {
                lease_id: parts.lease_id,
                node: parts.node,
                path: parts.path,
                base_path: parts.base_path,
                ordinal: parts.ordinal,
                holder: parts.holder,
                acquired_at: parts.acquired_at,
                held: AtomicBool::new(true),
                registry: Arc::downgrade(registry),
            }),
        }
    }

    #[cfg(test)]
    pub(crate) fn lease_id(&self) -> u64 {
        self.inner.lease_id
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn base_path(&self) -> &Path {
        &self.inner.base_path
    }

    pub fn ordinal(&self) -> u32 {
        self.inner.ordinal
    }

    pub fn node(&self) -> &NodeName {
        &self.inner.node
    }

    pub fn holder(&self) -> &str {
        &self.inner.holder
    }

    pub fn acquired_at(&self) -> i64 {
        self.inner.acquired_at
    }

    pub fn is_held(&self) -> bool {
        self.inner.held.load(Ordering::Acquire)
    }

    /// Returns `true` only for the call that actually freed the path.
    pub fn release(&self) -> bool {
        if self
            .inner
            .held
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(registry) = self.inner.registry.upgrade() {
            registry.free(&self.inner.path, self.inner.lease_id);
        }
        true
    }

    pub fn to_record(&self, execution_id: &ExecutionId) -> LeaseRecord {
        LeaseRecord {
            execution_id: execution_id.clone(),
            node: self.inner.node.clone(),
            path: self.inner.path.clone(),
            base_path: self.inner.base_path.clone(),
            ordinal: self.inner.ordinal,
            holder: self.inner.holder.clone(),
            acquired_at: self.inner.acquired_at,
        }
    }
}

/// Durable form of a held lease, kept with the owning execution's state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub execution_id: ExecutionId,
    pub node: NodeName,
    pub path: PathBuf,
    pub base_path: PathBuf,
    pub ordinal: u32,
    #[serde(default)]
    pub holder: String,
    pub acquired_at: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSnapshot {
    pub node: NodeName,
    pub path: PathBuf,
    pub base_path: PathBuf,
    pub ordinal: u32,
    pub holder: String,
    pub acquired_at: i64,
}
