//! Shared utilities for peerwarden components.
//!
//! Configuration loading and logging setup used by the engine and its
//! command-line front end.

pub mod config;
pub mod logging;

pub use config::{Config, ConfigError, ProbeKind};
