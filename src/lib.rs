//! Core library for backing up and restoring Odoo instances. The same
//! engine code drives local and SSH targets through the
//! [`backend::ExecutionBackend`] trait; archives are self-describing
//! `.tar.gz` containers and restores pass through an explicit safety gate.

pub mod archive;
pub mod backend;
pub mod backup;
pub mod error;
pub mod pg;
pub mod progress;
pub mod restore;
pub mod secrets;
pub mod store;
pub mod types;

pub use error::{Error, Result};
