use super::lease::{Lease, LeaseRecord};
use super::registry::WorkspaceLeases;
use crate::config::StatePaths;
use crate::shared::errors::WorkspaceError;
use crate::shared::fs_atomic::{atomic_write_file, remove_file_if_exists};
use crate::shared::ids::ExecutionId;
use crate::shared::logging::append_event_log;
use sha2::{Digest, Sha256};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct LeaseStore {
    paths: StatePaths,
}

#[derive(Debug, Clone)]
pub struct RecoveredLease {
    pub execution_id: ExecutionId,
    pub lease: Lease,
}

impl LeaseStore {
    pub fn new(paths: StatePaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &StatePaths {
        &self.paths
    }

    /// One file per held lease, so steps sharing an execution id never clobber each other.
    pub fn record_path(&self, record: &LeaseRecord) -> PathBuf {
        self.paths.leases_dir().join(record_file_name(record))
    }

    pub fn save(&self, record: &LeaseRecord) -> Result<(), WorkspaceError> {
        let path = self.record_path(record);
        let body = serde_json::to_vec_pretty(record).map_err(|e| json_error(&path, e))?;
        atomic_write_file(&path, &body).map_err(|e| io_error(&path, e))
    }

    pub fn load_for(&self, execution_id: &ExecutionId) -> Result<Vec<LeaseRecord>, WorkspaceError> {
        Ok(self
            .load_all()?
            .into_iter()
            .filter(|record| &record.execution_id == execution_id)
            .collect())
    }

    pub fn remove(&self, record: &LeaseRecord) -> Result<bool, WorkspaceError> {
        let path = self.record_path(record);
        remove_file_if_exists(&path).map_err(|e| io_error(&path, e))
    }

    /// Oldest lease first, so recovery hands contested paths to the earliest holder.
    pub fn load_all(&self) -> Result<Vec<LeaseRecord>, WorkspaceError> {
        let dir = self.paths.leases_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(io_error(&dir, err)),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|err| io_error(&dir, err))?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|v| v.to_str()) else {
                continue;
            };
            if name.starts_with('.') || !name.ends_with(".json") || !path.is_file() {
                continue;
            }
            let raw = fs::read_to_string(&path).map_err(|err| io_error(&path, err))?;
            let record: LeaseRecord =
                serde_json::from_str(&raw).map_err(|err| json_error(&path, err))?;
            records.push(record);
        }
        records.sort_by(|a, b| {
            a.acquired_at
                .cmp(&b.acquired_at)
                .then_with(|| a.execution_id.cmp(&b.execution_id))
        });
        Ok(records)
    }
}

/// Rebuilds in-memory registries from the durable records left by a previous process.
pub fn recover_leases(
    store: &LeaseStore,
    leases: &WorkspaceLeases,
) -> Result<Vec<RecoveredLease>, WorkspaceError> {
    let mut recovered = Vec::new();
    for record in store.load_all()? {
        match leases.restore(&record) {
            Ok(lease) => {
                append_event_log(
                    store.paths(),
                    "info",
                    "workspace.lease.recovered",
                    &format!(
                        "execution_id={} node={} path={}",
                        record.execution_id,
                        record.node,
                        record.path.display()
                    ),
                );
                recovered.push(RecoveredLease {
                    execution_id: record.execution_id,
                    lease,
                });
            }
            Err(err @ WorkspaceError::LeaseConflict { .. }) => {
                let removed = store.remove(&record)?;
                append_event_log(
                    store.paths(),
                    "warn",
                    "workspace.lease.recover_conflict",
                    &format!(
                        "execution_id={} removed={removed}: {err}",
                        record.execution_id
                    ),
                );
            }
            Err(err) => return Err(err),
        }
    }
    Ok(recovered)
}

fn record_file_name(record: &LeaseRecord) -> String {
    let mut hasher = Sha256::new();
    hasher.update(record.node.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(record.path.as_os_str().as_encoded_bytes());
    let digest = hasher.finalize();
    let hash = digest[..8]
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect::<String>();
    format!("{}_{hash}.json", record.execution_id.as_str())
}

fn io_error(path: &Path, source: std::io::Error) -> WorkspaceError {
    WorkspaceError::Io {
        path: path.display().to_string(),
        source,
    }
}

fn json_error(path: &Path, source: serde_json::Error) -> WorkspaceError {
    WorkspaceError::Json {
        path: path.display().to_string(),
        source,
    }
}
