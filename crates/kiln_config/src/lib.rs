//! Parsing and validation of `kiln.toml` project configuration files.
//!
//! This crate reads the project configuration file and produces a strongly-typed
//! [`ProjectConfig`] with target declarations, tool paths and the
//! fingerprint-sensitive options each task runs with.

#![warn(missing_docs)]

pub mod error;
pub mod loader;
pub mod resolve;
pub mod types;

pub use error::ConfigError;
pub use loader::{load_config, load_config_from_str, CONFIG_FILE};
pub use resolve::{parse_build_args, parse_define_macro, resolve_jobs, resolve_task_options};
pub use types::*;
