use super::lease::{Lease, LeaseParts, LeaseRecord, LeaseSnapshot};
use crate::config::{Settings, DEFAULT_LEASE_SEPARATOR};
use crate::shared::errors::WorkspaceError;
use crate::shared::ids::NodeName;
use crate::shared::time::now_secs;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError};

#[derive(Debug)]
pub(crate) struct RegistryShared {
    node: NodeName,
    separator: String,
    state: Mutex<RegistryState>,
    freed: Condvar,
}

#[derive(Debug, Default)]
struct RegistryState {
    entries: BTreeMap<PathBuf, LeaseEntry>,
    next_lease_id: u64,
}

#[derive(Debug, Clone)]
struct LeaseEntry {
    lease_id: u64,
    base_path: PathBuf,
    ordinal: u32,
    holder: String,
    acquired_at: i64,
}

impl RegistryShared {
    fn lock(&self) -> MutexGuard<'_, RegistryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn free(&self, path: &Path, lease_id: u64) {
        let mut state = self.lock();
        let owned = state
            .entries
            .get(path)
            .is_some_and(|entry| entry.lease_id == lease_id);
        if owned {
            state.entries.remove(path);
            self.freed.notify_all();
        }
    }
}

impl RegistryState {
    fn insert(
        &mut self,
        node: &NodeName,
        path: PathBuf,
        base_path: PathBuf,
        ordinal: u32,
        holder: &str,
        acquired_at: i64,
    ) -> LeaseParts {
        self.next_lease_id += 1;
        let lease_id = self.next_lease_id;
        self.entries.insert(
            path.clone(),
            LeaseEntry {
                lease_id,
                base_path: base_path.clone(),
                ordinal,
                holder: holder.to_string(),
                acquired_at,
            },
        );
        LeaseParts {
            lease_id,
            node: node.clone(),
            path,
            base_path,
            ordinal,
            holder: holder.to_string(),
            acquired_at,
        }
    }
}

/// Leased workspace paths of a single node.
#[derive(Debug, Clone)]
pub struct LeaseRegistry {
    shared: Arc<RegistryShared>,
}

impl LeaseRegistry {
    pub fn new(node: NodeName, separator: impl Into<String>) -> Self {
        Self {
            shared: Arc::new(RegistryShared {
                node,
                separator: separator.into(),
                state: Mutex::new(RegistryState::default()),
                freed: Condvar::new(),
            }),
        }
    }

    pub fn node(&self) -> &NodeName {
        &self.shared.node
    }

    pub fn separator(&self) -> &str {
        &self.shared.separator
    }

    /// Leases the lowest free variant of `base_path`: the base itself, then `base@2`, `base@3`, ...
    pub fn allocate(&self, base_path: &Path, holder: &str) -> Result<Lease, WorkspaceError> {
        let mut state = self.shared.lock();
        let separator = &self.shared.separator;
        let ordinal = first_free_ordinal(1, |ordinal| {
            state
                .entries
                .contains_key(&suffixed_path(base_path, separator, ordinal))
        })
        .ok_or_else(|| WorkspaceError::OrdinalsExhausted {
            node: self.shared.node.to_string(),
            base: base_path.display().to_string(),
        })?;
        let path = suffixed_path(base_path, separator, ordinal);
        let parts = state.insert(
            &self.shared.node,
            path,
            base_path.to_path_buf(),
            ordinal,
            holder,
            now_secs(),
        );
        drop(state);
        Ok(self.lease_from(parts))
    }

    /// Leases exactly `path`, or returns `None` while another lease holds it.
    pub fn try_acquire(&self, path: &Path, holder: &str) -> Option<Lease> {
        let mut state = self.shared.lock();
        if state.entries.contains_key(path) {
            return None;
        }
        let parts = state.insert(
            &self.shared.node,
            path.to_path_buf(),
            path.to_path_buf(),
            1,
            holder,
            now_secs(),
        );
        drop(state);
        Some(self.lease_from(parts))
    }

    /// Leases exactly `path`, waiting for the current holder to release it.
    pub fn acquire(&self, path: &Path, holder: &str) -> Lease {
        let mut state = self.shared.lock();
        while state.entries.contains_key(path) {
            state = self
                .shared
                .freed
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
        let parts = state.insert(
            &self.shared.node,
            path.to_path_buf(),
            path.to_path_buf(),
            1,
            holder,
            now_secs(),
        );
        drop(state);
        self.lease_from(parts)
    }

    /// Re-registers a lease persisted before a restart.
    pub fn record(&self, record: &LeaseRecord) -> Result<Lease, WorkspaceError> {
        if record.node != self.shared.node {
            return Err(WorkspaceError::Configuration(format!(
                "lease record for node `{}` cannot be restored on node `{}`",
                record.node, self.shared.node
            )));
        }
        let mut state = self.shared.lock();
        if state.entries.contains_key(&record.path) {
            return Err(WorkspaceError::LeaseConflict {
                node: self.shared.node.to_string(),
                path: record.path.display().to_string(),
            });
        }
        let parts = state.insert(
            &self.shared.node,
            record.path.clone(),
            record.base_path.clone(),
            record.ordinal,
            &record.holder,
            record.acquired_at,
        );
        drop(state);
        Ok(self.lease_from(parts))
    }

    pub fn in_use(&self) -> Vec<LeaseSnapshot> {
        let state = self.shared.lock();
        state
            .entries
            .iter()
            .map(|(path, entry)| LeaseSnapshot {
                node: self.shared.node.clone(),
                path: path.clone(),
                base_path: entry.base_path.clone(),
                ordinal: entry.ordinal,
                holder: entry.holder.clone(),
                acquired_at: entry.acquired_at,
            })
            .collect()
    }

    pub fn ordinals_in_use(&self, base_path: &Path) -> BTreeSet<u32> {
        let state = self.shared.lock();
        state
            .entries
            .values()
            .filter(|entry| entry.base_path == base_path)
            .map(|entry| entry.ordinal)
            .collect()
    }

    pub fn is_in_use(&self, path: &Path) -> bool {
        self.shared.lock().entries.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.shared.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lease_from(&self, parts: LeaseParts) -> Lease {
        Lease::new(parts, &self.shared)
    }
}

fn first_free_ordinal(start: u32, mut taken: impl FnMut(u32) -> bool) -> Option<u32> {
    let mut ordinal = start;
    while taken(ordinal) {
        ordinal = ordinal.checked_add(1)?;
    }
    Some(ordinal)
}

pub fn suffixed_path(base_path: &Path, separator: &str, ordinal: u32) -> PathBuf {
    if ordinal <= 1 {
        return base_path.to_path_buf();
    }
    let mut raw = base_path.as_os_str().to_os_string();
    raw.push(separator);
    raw.push(ordinal.to_string());
    PathBuf::from(raw)
}

/// Process-wide set of per-node registries.
#[derive(Debug)]
pub struct WorkspaceLeases {
    separator: String,
    registries: Mutex<HashMap<NodeName, Arc<LeaseRegistry>>>,
}

impl Default for WorkspaceLeases {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE_SEPARATOR)
    }
}

impl WorkspaceLeases {
    pub fn new(separator: impl Into<String>) -> Self {
        Self {
            separator: separator.into(),
            registries: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self::new(settings.lease_separator.clone())
    }

    pub fn global() -> Arc<WorkspaceLeases> {
        static GLOBAL: OnceLock<Arc<WorkspaceLeases>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(WorkspaceLeases::default())))
    }

    pub fn separator(&self) -> &str {
        &self.separator
    }

    pub fn for_node(&self, node: &NodeName) -> Arc<LeaseRegistry> {
        let mut registries = self
            .registries
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        registries
            .entry(node.clone())
            .or_insert_with(|| Arc::new(LeaseRegistry::new(node.clone(), self.separator.clone())))
            .clone()
    }

    pub fn restore(&self, record: &LeaseRecord) -> Result<Lease, WorkspaceError> {
        self.for_node(&record.node).record(record)
    }
}
