//! Shared types and error definitions.
//!
//! - [`error`] - The unified [`Error`] enum and [`Result`] alias.
//! - [`types`] - Connection [`Address`], reply status and protocol constants.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::*;
