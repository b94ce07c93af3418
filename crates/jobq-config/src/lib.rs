//! KDL configuration parsing for jobq.
//!
//! A single `jobq.kdl` file configures the database connection, the worker
//! loop and logging. Every setting has a default, so an empty file is valid.

pub mod error;
pub mod system;

pub use error::{ConfigError, ConfigResult};
pub use system::{
    DatabaseConfig, LogFormat, LoggingConfig, SystemConfig, WorkerConfig, load_system_config,
    parse_system_config,
};
