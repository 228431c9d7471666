//! Shared data model, error taxonomy, and request validation for the TEE
//! execution service.

pub mod error;
pub mod types;
pub mod validate;

pub use error::{Result, TeeError};
pub use types::*;
