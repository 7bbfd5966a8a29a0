#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid yaml in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("settings validation failed: {0}")]
    Settings(String),
    #[error("node `{node}` is not configured in settings")]
    MissingNode { node: String },
    #[error("failed to resolve home directory for workspace-lease state root")]
    HomeDirectoryUnavailable,
}
