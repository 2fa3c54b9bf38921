//! Subscription quota for a Claude OAuth login
//!
//! Reads the Claude CLI's OAuth credentials, sends a minimal probe to the
//! messages API, and parses the unified rate-limit headers into a
//! `QuotaInfo`. An expired access token is refreshed once, the rotated pair
//! is written back to the credential store, and the probe is retried.

pub mod error;
pub mod probe;
pub mod quota;
pub mod service;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use probe::{ProbeOutcome, QuotaProbe};
pub use quota::{QuotaInfo, format_remaining};
pub use service::{QuotaService, QuotaSource};
