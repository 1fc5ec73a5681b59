//! Common utilities and types shared across RepSync crates.
//!
//! This module provides the workspace-wide error type and a handful of
//! small value types used by the storage and sync layers.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{now_millis, SensitiveString, UserId};
