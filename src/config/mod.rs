//! Configuration for codeloop
//!
//! Loaded from YAML with a fallback chain:
//! 1. Explicit path
//! 2. .codeloop.yml in the current directory
//! 3. ~/.config/codeloop/codeloop.yml
//! 4. Defaults

use std::path::PathBuf;

use eyre::Result;

pub use self::global::{EngineConfig, GlobalConfig, LlmConfig, ToolsConfig, VmConfig};

mod global;

/// Project config file name
pub const PROJECT_CONFIG: &str = ".codeloop.yml";

/// Load and validate configuration from the standard search paths
pub fn load_config(explicit_path: Option<&PathBuf>) -> Result<GlobalConfig> {
    let config = GlobalConfig::load(explicit_path)?;
    config.validate()?;
    Ok(config)
}
