//! Strata Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, identifiers, block kinds and
//! configuration shared by the strata storage engine and its clients.

pub mod config;
pub mod error;
pub mod types;

pub use config::StorageConfig;
pub use error::{Error, Result};
pub use types::*;
