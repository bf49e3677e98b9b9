//! Configuration management for quorum

pub mod config;
pub mod loader;
pub mod validator;

/// Re-export main types
pub use crate::config::*;
pub use loader::*;
pub use validator::*;
