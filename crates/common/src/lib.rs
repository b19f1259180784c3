//! Shared types for the Google Workspace bridge
//!
//! Holds the pieces every crate in the workspace needs: the `Secret` wrapper
//! used for client secrets and encryption keys, and the configuration error
//! that aborts startup.

mod error;
mod secret;

pub use error::{Error, Result};
pub use secret::Secret;
