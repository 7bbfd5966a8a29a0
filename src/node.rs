use crate::shared::ids::{JobName, NodeName};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    Pipeline,
    Project,
    /// Runs inside another job (matrix cells, inline sub-builds) and cannot own a workspace.
    Ephemeral,
}

impl JobKind {
    pub fn is_top_level(self) -> bool {
        matches!(self, JobKind::Pipeline | JobKind::Project)
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobKind::Pipeline => write!(f, "pipeline"),
            JobKind::Project => write!(f, "project"),
            JobKind::Ephemeral => write!(f, "ephemeral"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub full_name: JobName,
    pub kind: JobKind,
}

impl Job {
    pub fn new(full_name: JobName, kind: JobKind) -> Self {
        Self { full_name, kind }
    }

    pub fn pipeline(full_name: &str) -> Result<Self, String> {
        Ok(Self::new(JobName::parse(full_name)?, JobKind::Pipeline))
    }

    pub fn is_top_level(&self) -> bool {
        self.kind.is_top_level()
    }
}

impl std::fmt::Display for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} `{}`", self.kind, self.full_name)
    }
}

/// A machine that runs executions and owns a filesystem root.
pub trait ExecutionNode: Send + Sync {
    fn name(&self) -> &NodeName;

    fn is_online(&self) -> bool;

    /// `None` while the node is offline.
    fn root_dir(&self) -> Option<PathBuf>;

    /// Canonical per-job workspace; `None` while the node is offline.
    fn workspace_root_for(&self, job: &Job) -> Option<PathBuf>;

    fn labels(&self) -> BTreeSet<String> {
        BTreeSet::new()
    }
}

#[derive(Debug)]
pub struct LocalNode {
    name: NodeName,
    root_dir: PathBuf,
    workspace_dir: PathBuf,
    labels: BTreeSet<String>,
    online: AtomicBool,
}

impl LocalNode {
    pub fn new(name: NodeName, root_dir: impl Into<PathBuf>) -> Self {
        Self {
            name,
            root_dir: root_dir.into(),
            workspace_dir: PathBuf::from(crate::config::DEFAULT_NODE_WORKSPACE_DIR),
            labels: BTreeSet::new(),
            online: AtomicBool::new(true),
        }
    }

    pub fn with_workspace_dir(mut self, workspace_dir: &Path) -> Self {
        self.workspace_dir = workspace_dir.to_path_buf();
        self
    }

    pub fn with_labels(mut self, labels: impl IntoIterator<Item = String>) -> Self {
        self.labels = labels.into_iter().collect();
        self
    }

    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    pub fn workspace_root(&self) -> Option<PathBuf> {
        self.root_dir().map(|root| root.join(&self.workspace_dir))
    }
}

impl ExecutionNode for LocalNode {
    fn name(&self) -> &NodeName {
        &self.name
    }

    fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    fn root_dir(&self) -> Option<PathBuf> {
        if self.is_online() {
            Some(self.root_dir.clone())
        } else {
            None
        }
    }

    fn workspace_root_for(&self, job: &Job) -> Option<PathBuf> {
        self.workspace_root()
            .map(|root| root.join(job.full_name.as_str()))
    }

    fn labels(&self) -> BTreeSet<String> {
        self.labels.clone()
    }
}
