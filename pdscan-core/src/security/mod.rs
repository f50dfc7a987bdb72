//! Credential protection.
//!
//! - Credentials are stored in `Zeroizing` containers for automatic memory clearing
//! - Connection strings are redacted by [`crate::error::redact_database_url`]
//!   before they reach logs, errors, events or reports

mod credentials;

pub use credentials::Credentials;
