//! Utility modules shared by the backup engines.

pub mod errors;
pub mod logger;

pub use errors::{BackupError, Result};
