//! Configuration resolved from the environment.
//!
//! Each section follows the same shape: a `Default` impl carrying the
//! built-in values and a `resolve()` that overlays env vars on top.
//! [`Config::from_env`] loads `.env` files first.

pub(crate) mod helpers;
mod hooks;
mod plugins;

pub use hooks::{HookRule, HooksConfig};
pub use plugins::PluginsConfig;

use crate::error::ConfigError;

/// Top-level configuration.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub plugins: PluginsConfig,
    pub hooks: HooksConfig,
}

impl Config {
    /// Load `.env` files, then resolve every section from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        crate::bootstrap::load_dotenv();
        Self::resolve()
    }

    /// Resolve every section from the current process environment.
    pub fn resolve() -> Result<Self, ConfigError> {
        Ok(Self {
            plugins: PluginsConfig::resolve()?,
            hooks: HooksConfig::resolve()?,
        })
    }
}
