//! HTTP middleware: bearer auth, request-id logging, panic recovery.

mod auth;
mod logging;
mod recovery;

pub use auth::BearerAuth;
pub use logging::{RequestId, RequestLogging};
pub use recovery::Recovery;
