pub mod config;
pub mod node;
pub mod shared;
pub mod step;
pub mod workspace;
