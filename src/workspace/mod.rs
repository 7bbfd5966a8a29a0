pub mod lease;
pub mod path_resolver;
pub mod registry;
pub mod store;

pub use lease::{Lease, LeaseRecord, LeaseSnapshot};
pub use path_resolver::{normalize_absolute_path, resolve_base_path, temp_dir_for, TEMP_DIR_SUFFIX};
pub use registry::{suffixed_path, LeaseRegistry, WorkspaceLeases};
pub use store::{recover_leases, LeaseStore, RecoveredLease};
