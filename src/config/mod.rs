pub mod error;
pub mod load;
pub mod paths;
pub mod settings;

pub use error::ConfigError;
pub use load::load_global_settings;
pub use paths::{
    bootstrap_state_root, default_settings_path, default_state_root_path, StatePaths,
    DEFAULT_STATE_ROOT_DIR, SETTINGS_FILE_NAME,
};
pub use settings::{NodeSettings, Settings, DEFAULT_LEASE_SEPARATOR, DEFAULT_NODE_WORKSPACE_DIR};
