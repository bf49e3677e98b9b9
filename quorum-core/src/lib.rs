//! Core types and errors shared by the quorum workspace

pub mod error;
pub mod types;

pub use error::*;
/// Re-export commonly used types
pub use types::*;
