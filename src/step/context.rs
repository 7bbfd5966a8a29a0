use crate::shared::ids::NodeName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

/// Write-only console of one execution.
pub trait LogSink: Send + Sync {
    fn line(&self, line: &str);
}

#[derive(Debug, Clone)]
pub struct FileLogSink {
    path: PathBuf,
}

impl FileLogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl LogSink for FileLogSink {
    fn line(&self, line: &str) {
        if let Some(parent) = self.path.parent() {
            if fs::create_dir_all(parent).is_err() {
                return;
            }
        }
        let Ok(mut file) = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
        else {
            return;
        };
        let _ = writeln!(file, "{line}");
    }
}

#[derive(Debug, Default)]
pub struct BufferLogSink {
    lines: Mutex<Vec<String>>,
}

impl BufferLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl LogSink for BufferLogSink {
    fn line(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(line.to_string());
    }
}

/// Records which workspace a point of the execution graph ran in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceAction {
    pub flow_node_id: String,
    pub node: NodeName,
    pub path: PathBuf,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    pub recorded_at: i64,
}

pub trait ExecutionGraphNode: Send + Sync {
    fn id(&self) -> &str;

    fn attach(&self, action: WorkspaceAction);
}

#[derive(Debug)]
pub struct FlowNodeRecord {
    id: String,
    actions: Mutex<Vec<WorkspaceAction>>,
}

impl FlowNodeRecord {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            actions: Mutex::new(Vec::new()),
        }
    }

    pub fn actions(&self) -> Vec<WorkspaceAction> {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ExecutionGraphNode for FlowNodeRecord {
    fn id(&self) -> &str {
        &self.id
    }

    fn attach(&self, action: WorkspaceAction) {
        self.actions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(action);
    }
}
