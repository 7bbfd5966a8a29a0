use crate::node::{ExecutionNode, Job};
use crate::shared::errors::WorkspaceError;
use std::path::{Component, Path, PathBuf};

pub const TEMP_DIR_SUFFIX: &str = "tmp";

pub fn resolve_base_path(
    node: &dyn ExecutionNode,
    job: &Job,
    dir: Option<&str>,
) -> Result<PathBuf, WorkspaceError> {
    if !job.is_top_level() {
        return Err(WorkspaceError::Configuration(format!(
            "{job} must be a top-level job"
        )));
    }
    if !node.is_online() {
        return Err(node_unavailable(node));
    }

    let base = match dir {
        None => node
            .workspace_root_for(job)
            .ok_or_else(|| node_unavailable(node))?,
        Some(dir) => {
            let root = node.root_dir().ok_or_else(|| node_unavailable(node))?;
            root.join(dir)
        }
    };
    normalize_absolute_path(&base)
}

pub fn temp_dir_for(workspace: &Path, separator: &str) -> PathBuf {
    let mut raw = workspace.as_os_str().to_os_string();
    raw.push(separator);
    raw.push(TEMP_DIR_SUFFIX);
    PathBuf::from(raw)
}

pub fn normalize_absolute_path(path: &Path) -> Result<PathBuf, WorkspaceError> {
    if !path.is_absolute() {
        return Err(WorkspaceError::PathValidation {
            path: path.display().to_string(),
            reason: "path must be absolute".to_string(),
        });
    }

    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::RootDir => normalized.push(component.as_os_str()),
            Component::Normal(v) => normalized.push(v),
            Component::CurDir => {}
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(WorkspaceError::PathValidation {
                        path: path.display().to_string(),
                        reason: "path escapes filesystem root".to_string(),
                    });
                }
            }
            Component::Prefix(prefix) => normalized.push(prefix.as_os_str()),
        }
    }
    Ok(normalized)
}

fn node_unavailable(node: &dyn ExecutionNode) -> WorkspaceError {
    WorkspaceError::NodeUnavailable {
        node: node.name().to_string(),
    }
}
