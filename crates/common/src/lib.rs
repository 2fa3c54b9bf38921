//! Types shared by the quota monitor crates

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
