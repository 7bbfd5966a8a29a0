use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

pub const WORKSPACE_VAR: &str = "WORKSPACE";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EnvVars(BTreeMap<String, String>);

impl EnvVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Sets `key`, or removes it when `value` is empty.
    pub fn override_var(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if value.is_empty() {
            self.0.remove(&key);
        } else {
            self.0.insert(key, value);
        }
    }

    pub fn remove(&mut self, key: &str) -> Option<String> {
        self.0.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for EnvVars {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = EnvVars::new();
        for (key, value) in iter {
            env.override_var(key, value);
        }
        env
    }
}

/// Contributes variables to the environment of the work nested under a step.
pub trait EnvironmentExpander: Debug + Send + Sync {
    fn expand(&self, env: &mut EnvVars);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkspaceExpander {
    path: String,
}

impl WorkspaceExpander {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.display().to_string(),
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl EnvironmentExpander for WorkspaceExpander {
    fn expand(&self, env: &mut EnvVars) {
        env.override_var(WORKSPACE_VAR, self.path.clone());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VariableOverrides {
    overrides: Vec<(String, String)>,
}

impl VariableOverrides {
    pub fn new<K, V>(overrides: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            overrides: overrides
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

impl EnvironmentExpander for VariableOverrides {
    fn expand(&self, env: &mut EnvVars) {
        for (key, value) in &self.overrides {
            env.override_var(key.clone(), value.clone());
        }
    }
}

#[derive(Debug)]
struct MergedExpander {
    original: Arc<dyn EnvironmentExpander>,
    subsequent: Arc<dyn EnvironmentExpander>,
}

impl EnvironmentExpander for MergedExpander {
    fn expand(&self, env: &mut EnvVars) {
        self.original.expand(env);
        self.subsequent.expand(env);
    }
}

/// Layers `subsequent` over the enclosing overlay; `subsequent` wins on conflicts.
pub fn merge_expanders(
    original: Option<Arc<dyn EnvironmentExpander>>,
    subsequent: Arc<dyn EnvironmentExpander>,
) -> Arc<dyn EnvironmentExpander> {
    match original {
        Some(original) => Arc::new(MergedExpander {
            original,
            subsequent,
        }),
        None => subsequent,
    }
}

pub fn expand_environment(base: &EnvVars, expander: &dyn EnvironmentExpander) -> EnvVars {
    let mut env = base.clone();
    expander.expand(&mut env);
    env
}
