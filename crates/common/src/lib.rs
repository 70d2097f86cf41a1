//! Shared building blocks for the quota-pilot workspace
//!
//! `Secret` keeps refresh tokens and client secrets out of logs; `Error`
//! covers configuration loading in the binary.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
