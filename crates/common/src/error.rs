//! Configuration errors
//!
//! Every variant here is fatal at process startup. Per-call failures live in
//! `workspace_auth::Error` and `workspace_api::Error`.

use thiserror::Error;

/// Startup configuration error
#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl Error {
    /// Shorthand for a missing required setting.
    pub fn missing(setting: &str, env_var: &str) -> Self {
        Error::Config(format!("{setting} is required (set it in the config file or {env_var})"))
    }
}

/// Result alias using common Error
pub type Result<T> = std::result::Result<T, Error>;
