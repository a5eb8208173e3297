//! Shared building blocks for the Game Server Console daemon.
//!
//! This crate holds the parts with no I/O loop of their own: the path
//! confinement guard that every filesystem request must pass, the TOML
//! configuration layer, and the operation error taxonomy.

pub mod config;
pub mod errors;
pub mod paths;

pub use config::{Config, ConfigError};
pub use errors::OpError;
