//! Warden Shared Types and Utilities
//!
//! This crate contains the domain types, the error taxonomy, and the small
//! filesystem helpers shared by the supervisor and its control API.

pub mod types;
pub mod errors;
pub mod checksum;
pub mod fsutil;

pub use types::*;
pub use errors::*;
