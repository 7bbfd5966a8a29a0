use super::{default_state_root_path, ConfigError, StatePaths};
use crate::node::{ExecutionNode, LocalNode};
use crate::shared::ids::NodeName;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

pub const DEFAULT_LEASE_SEPARATOR: &str = "@";
pub const DEFAULT_NODE_WORKSPACE_DIR: &str = "workspace";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub state_root: Option<PathBuf>,
    #[serde(default = "default_lease_separator")]
    pub lease_separator: String,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeSettings>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NodeSettings {
    pub root_dir: PathBuf,
    #[serde(default = "default_workspace_dir")]
    pub workspace_dir: PathBuf,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default = "default_true")]
    pub online: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            state_root: None,
            lease_separator: default_lease_separator(),
            nodes: BTreeMap::new(),
        }
    }
}

impl Settings {
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(root) = &self.state_root {
            if !root.is_absolute() {
                return Err(ConfigError::Settings(
                    "`state_root` must be an absolute path".to_string(),
                ));
            }
        }

        if self.lease_separator.is_empty() {
            return Err(ConfigError::Settings(
                "`lease_separator` must be non-empty".to_string(),
            ));
        }
        if self
            .lease_separator
            .chars()
            .any(|ch| ch == '/' || ch == '\\' || ch.is_whitespace())
        {
            return Err(ConfigError::Settings(
                "`lease_separator` must not contain path separators or whitespace".to_string(),
            ));
        }

        for (name, node) in &self.nodes {
            NodeName::parse(name).map_err(|err| {
                ConfigError::Settings(format!("invalid node name `{name}`: {err}"))
            })?;
            if !node.root_dir.is_absolute() {
                return Err(ConfigError::Settings(format!(
                    "node `{name}` must use an absolute `root_dir`"
                )));
            }
            if !is_contained_relative(&node.workspace_dir) {
                return Err(ConfigError::Settings(format!(
                    "node `{name}` `workspace_dir` must be a relative path inside `root_dir`"
                )));
            }
            if node.labels.iter().any(|label| label.trim().is_empty()) {
                return Err(ConfigError::Settings(format!(
                    "node `{name}` labels must be non-empty"
                )));
            }
        }
        Ok(())
    }

    pub fn state_paths(&self) -> Result<StatePaths, ConfigError> {
        match &self.state_root {
            Some(root) => Ok(StatePaths::new(root)),
            None => Ok(StatePaths::new(default_state_root_path()?)),
        }
    }

    pub fn node(&self, name: &str) -> Result<Arc<LocalNode>, ConfigError> {
        let node = self
            .nodes
            .get(name)
            .ok_or_else(|| ConfigError::MissingNode {
                node: name.to_string(),
            })?;
        build_node(name, node)
    }

    pub fn build_nodes(&self) -> Result<BTreeMap<NodeName, Arc<LocalNode>>, ConfigError> {
        let mut nodes = BTreeMap::new();
        for (name, node) in &self.nodes {
            let built = build_node(name, node)?;
            nodes.insert(built.name().clone(), built);
        }
        Ok(nodes)
    }
}

fn build_node(name: &str, settings: &NodeSettings) -> Result<Arc<LocalNode>, ConfigError> {
    let node_name = NodeName::parse(name)
        .map_err(|err| ConfigError::Settings(format!("invalid node name `{name}`: {err}")))?;
    let node = LocalNode::new(node_name, &settings.root_dir)
        .with_workspace_dir(&settings.workspace_dir)
        .with_labels(settings.labels.iter().cloned());
    node.set_online(settings.online);
    Ok(Arc::new(node))
}

fn is_contained_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_) | Component::CurDir))
}

fn default_lease_separator() -> String {
    DEFAULT_LEASE_SEPARATOR.to_string()
}

fn default_workspace_dir() -> PathBuf {
    PathBuf::from(DEFAULT_NODE_WORKSPACE_DIR)
}

fn default_true() -> bool {
    true
}
