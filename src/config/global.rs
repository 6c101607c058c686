//! Global configuration
//!
//! Loaded from ~/.config/codeloop/codeloop.yml or .codeloop.yml

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::llm::anthropic::{DEFAULT_API_KEY_ENV, DEFAULT_MAX_TOKENS, DEFAULT_MODEL};
use crate::llm::{AnthropicConfig, DEFAULT_CONTEXT_SIZE};
use crate::runner::{ContextOptions, DEFAULT_LOOP_LIMIT, DEFAULT_TEMPERATURE, ExecutionConfig};
use crate::tools::DEFAULT_SLOW_TOOL_MS;
use crate::vm::{DEFAULT_MEMORY_LIMIT_BYTES, DEFAULT_TIMEOUT_MS, VmBackend, VmLimits};

use super::PROJECT_CONFIG;

const BYTES_PER_MB: usize = 1024 * 1024;

/// Global configuration for codeloop
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct GlobalConfig {
    /// Execution loop settings
    pub engine: EngineConfig,

    /// Sandbox settings
    pub vm: VmConfig,

    /// Tool bridge settings
    pub tools: ToolsConfig,

    /// Model provider settings
    pub llm: LlmConfig,
}

impl GlobalConfig {
    /// Load configuration with fallback chain
    ///
    /// Search order:
    /// 1. Explicit path if provided
    /// 2. .codeloop.yml in current directory
    /// 3. ~/.config/codeloop/codeloop.yml
    /// 4. Defaults
    pub fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        if let Some(path) = config_path {
            return Self::load_from_file(path)
                .context(format!("Failed to load config from {}", path.display()));
        }

        let project_config = PathBuf::from(PROJECT_CONFIG);
        if project_config.exists() {
            match Self::load_from_file(&project_config) {
                Ok(config) => {
                    log::info!("Loaded config from {}", PROJECT_CONFIG);
                    return Ok(config);
                }
                Err(e) => {
                    log::warn!("Failed to load {}: {}", PROJECT_CONFIG, e);
                }
            }
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_config = config_dir.join("codeloop").join("codeloop.yml");
            if user_config.exists() {
                match Self::load_from_file(&user_config) {
                    Ok(config) => {
                        log::info!("Loaded config from {}", user_config.display());
                        return Ok(config);
                    }
                    Err(e) => {
                        log::warn!("Failed to load {}: {}", user_config.display(), e);
                    }
                }
            }
        }

        log::info!("No config file found, using defaults");
        Ok(Self::default())
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path).context("Failed to read config file")?;
        let config: Self = serde_yaml::from_str(&content).context("Failed to parse config file")?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !(1..=100).contains(&self.engine.loop_limit) {
            eyre::bail!("engine.loop-limit must be between 1 and 100");
        }
        if !(0.0..=2.0).contains(&self.engine.temperature) {
            eyre::bail!("engine.temperature must be between 0 and 2");
        }
        if self.vm.timeout_ms == 0 {
            eyre::bail!("vm.timeout-ms must be > 0");
        }
        if self.vm.memory_limit_mb == 0 {
            eyre::bail!("vm.memory-limit-mb must be > 0");
        }
        if self.llm.max_tokens == 0 {
            eyre::bail!("llm.max-tokens must be > 0");
        }
        Ok(())
    }

    /// Model used by the execution loop
    pub fn model(&self) -> &str {
        self.engine.model.as_deref().unwrap_or(&self.llm.model)
    }

    pub fn context_options(&self) -> ContextOptions {
        ContextOptions::default()
            .with_loop_limit(self.engine.loop_limit)
            .with_temperature(self.engine.temperature)
            .with_model(self.model())
    }

    pub fn vm_limits(&self) -> VmLimits {
        VmLimits {
            timeout: Duration::from_millis(self.vm.timeout_ms),
            memory_limit_bytes: self.vm.memory_limit_mb * BYTES_PER_MB,
            slow_tool_threshold: Duration::from_millis(self.tools.slow_tool_warning_ms),
        }
    }

    pub fn execution_config(&self) -> ExecutionConfig {
        ExecutionConfig {
            backend: self.vm.backend,
            limits: self.vm_limits(),
            max_tokens: Some(self.llm.max_tokens),
        }
    }

    pub fn anthropic_config(&self) -> AnthropicConfig {
        AnthropicConfig {
            model: self.model().to_string(),
            max_tokens: self.llm.max_tokens,
            timeout: Duration::from_millis(self.llm.timeout_ms),
            api_key_env: self.llm.api_key_env.clone(),
            context_window: self.llm.context_window,
        }
    }
}

/// Execution loop settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Iterations allowed per attempt
    #[serde(rename = "loop-limit")]
    pub loop_limit: u32,

    pub temperature: f32,

    /// Overrides `llm.model` for the loop
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loop_limit: DEFAULT_LOOP_LIMIT,
            temperature: DEFAULT_TEMPERATURE,
            model: None,
        }
    }
}

/// Sandbox settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct VmConfig {
    pub backend: VmBackend,

    /// Wall-clock limit per execution in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    #[serde(rename = "memory-limit-mb")]
    pub memory_limit_mb: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            backend: VmBackend::default(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_BYTES / BYTES_PER_MB,
        }
    }
}

/// Tool bridge settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ToolsConfig {
    /// Calls running longer than this get a `tool_slow` trace
    #[serde(rename = "slow-tool-warning-ms")]
    pub slow_tool_warning_ms: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            slow_tool_warning_ms: DEFAULT_SLOW_TOOL_MS,
        }
    }
}

/// Model provider settings
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,

    #[serde(rename = "max-tokens")]
    pub max_tokens: u32,

    /// Timeout per LLM call in milliseconds
    #[serde(rename = "timeout-ms")]
    pub timeout_ms: u64,

    /// Environment variable holding the API key
    #[serde(rename = "api-key-env")]
    pub api_key_env: String,

    /// Context window in tokens
    #[serde(rename = "context-window")]
    pub context_window: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            max_tokens: DEFAULT_MAX_TOKENS,
            timeout_ms: 300_000, // 5 minutes
            api_key_env: DEFAULT_API_KEY_ENV.to_string(),
            context_window: DEFAULT_CONTEXT_SIZE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = GlobalConfig::default();
        assert_eq!(config.engine.loop_limit, 3);
        assert_eq!(config.engine.temperature, 0.7);
        assert_eq!(config.vm.timeout_ms, 60_000);
        assert_eq!(config.vm.memory_limit_mb, 32);
        assert_eq!(config.tools.slow_tool_warning_ms, 15_000);
        assert_eq!(config.llm.timeout_ms, 300_000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_config() {
        let config = GlobalConfig {
            engine: EngineConfig {
                loop_limit: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GlobalConfig {
            engine: EngineConfig {
                temperature: 2.5,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = GlobalConfig {
            vm: VmConfig {
                timeout_ms: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
engine:
  loop-limit: 5
vm:
  backend: isolated
  memory-limit-mb: 8
llm:
  model: claude-opus-4-20250514
"#;
        let config: GlobalConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.engine.loop_limit, 5);
        assert_eq!(config.vm.backend, VmBackend::Isolated);
        assert_eq!(config.vm.memory_limit_mb, 8);
        // Other fields keep their defaults
        assert_eq!(config.vm.timeout_ms, 60_000);
        assert_eq!(config.model(), "claude-opus-4-20250514");
    }

    #[test]
    fn test_engine_model_overrides_llm_model() {
        let mut config = GlobalConfig::default();
        config.engine.model = Some("claude-3-5-haiku-latest".to_string());
        assert_eq!(config.context_options().model, "claude-3-5-haiku-latest");
        assert_eq!(config.anthropic_config().model, "claude-3-5-haiku-latest");
    }

    #[test]
    fn test_conversions() {
        let config = GlobalConfig::default();
        let options = config.context_options();
        assert_eq!(options.loop_limit, 3);

        let execution = config.execution_config();
        assert_eq!(execution.backend, VmBackend::Inline);
        assert_eq!(execution.limits.timeout, Duration::from_secs(60));
        assert_eq!(execution.limits.memory_limit_bytes, 32 * 1024 * 1024);
        assert_eq!(execution.max_tokens, Some(8192));

        assert_eq!(config.anthropic_config().timeout, Duration::from_secs(300));
    }
}
