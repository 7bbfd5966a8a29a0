use crate::config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum WorkspaceError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("node `{node}` is offline")]
    NodeUnavailable { node: String },
    #[error("invalid workspace step arguments: {0}")]
    InvalidArguments(String),
    #[error("workspace path validation failed for `{path}`: {reason}")]
    PathValidation { path: String, reason: String },
    #[error("workspace step has already been started")]
    AlreadyStarted,
    #[error("workspace `{path}` on node `{node}` is already leased")]
    LeaseConflict { node: String, path: String },
    #[error("no free workspace ordinal left for `{base}` on node `{node}`")]
    OrdinalsExhausted { node: String, base: String },
    #[error("failed to start workspace body: {0}")]
    BodyStart(String),
    #[error("io error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("json error at {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl From<ConfigError> for WorkspaceError {
    fn from(value: ConfigError) -> Self {
        Self::Configuration(value.to_string())
    }
}
