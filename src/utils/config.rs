//! Configuration loading with JSON file support and environment variable overrides.
//!
//! Pattern: `MOE_*` environment variables override config file values.
//! Example: `MOE_CAPACITY=32` overrides `dispatch.capacity`, and
//! `MOE_COMMUNICATION__A2A_BACKEND=external` overrides the exchange backend.

use crate::dispatch::DispatchConfig;
use crate::distributed::exchange::A2aBackend;
use crate::utils::error::{MoeError, Result};
use candle_core::DType;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::fs;
use std::path::Path;
use tracing::{debug, info, warn};

const ENV_PREFIX: &str = "MOE_";

/// Environment variable carrying the numeric all-to-all code
/// (0 skip, 1 standard, 2 external, +8 timing).
pub const LEGACY_A2A_ENV: &str = "A2A_TYPE";

/// Sparse dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchSettings {
    /// Total number of experts across the expert-parallel group
    #[serde(default = "default_num_global_experts")]
    pub num_global_experts: usize,

    /// Slots per expert bank
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// Feature width of every token
    #[serde(default = "default_model_dim")]
    pub model_dim: usize,

    /// Requested dispatch precision ("float32", "float16", "bfloat16", "float64")
    #[serde(default = "default_dtype")]
    pub dtype: String,

    /// Routing choices per token
    #[serde(default = "default_top_k")]
    pub top_k: usize,

    /// Tokens per worker per step (demo driver only)
    #[serde(default = "default_num_tokens")]
    pub num_tokens: usize,
}

/// Collective communication settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunicationConfig {
    /// All-to-all backend selected for the whole process
    #[serde(default)]
    pub a2a_backend: A2aBackend,

    /// Synchronize and time every all-to-all
    #[serde(default)]
    pub a2a_timing: bool,

    /// Number of in-process workers used by the demo driver
    #[serde(default = "default_world_size")]
    pub world_size: usize,
}

/// Complete configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MoeConfig {
    #[serde(default)]
    pub dispatch: DispatchSettings,

    #[serde(default)]
    pub communication: CommunicationConfig,

    /// Additional key-value configuration
    #[serde(default)]
    pub extra: HashMap<String, serde_json::Value>,
}

fn default_num_global_experts() -> usize { 4 }
fn default_capacity() -> usize { 64 }
fn default_model_dim() -> usize { 256 }
fn default_dtype() -> String { "float32".to_string() }
fn default_top_k() -> usize { 2 }
fn default_num_tokens() -> usize { 128 }
fn default_world_size() -> usize { 1 }

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            num_global_experts: default_num_global_experts(),
            capacity: default_capacity(),
            model_dim: default_model_dim(),
            dtype: default_dtype(),
            top_k: default_top_k(),
            num_tokens: default_num_tokens(),
        }
    }
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            a2a_backend: A2aBackend::default(),
            a2a_timing: false,
            world_size: default_world_size(),
        }
    }
}

/// Parse a precision name into a candle dtype.
pub fn parse_dtype(name: &str) -> Result<DType> {
    match name.to_lowercase().as_str() {
        "float32" | "f32" | "fp32" => Ok(DType::F32),
        "float16" | "f16" | "fp16" | "half" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float64" | "f64" | "double" => Ok(DType::F64),
        other => Err(MoeError::Config(format!("Unrecognized data type: {}", other))),
    }
}

impl DispatchSettings {
    /// Build the dispatcher configuration, validating the precision name.
    pub fn to_dispatch_config(&self) -> Result<DispatchConfig> {
        DispatchConfig::new(
            self.num_global_experts,
            self.capacity,
            self.model_dim,
            parse_dtype(&self.dtype)?,
        )
    }
}

impl CommunicationConfig {
    /// Communication settings from the environment only.
    ///
    /// `MOE_A2A_BACKEND` / `MOE_A2A_TIMING` take precedence over the numeric
    /// `A2A_TYPE` code.
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    /// Communication settings from explicit `(key, value)` pairs, read the
    /// same way as the environment.
    pub fn from_vars<I: IntoIterator<Item = (String, String)>>(vars: I) -> Self {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        let mut config = Self::default();
        if let Some((_, code)) = vars.iter().find(|(key, _)| key == LEGACY_A2A_ENV) {
            config.apply_legacy_code(code);
        }
        for (key, value) in &vars {
            if let Some(field) = key.strip_prefix(ENV_PREFIX) {
                let field = field.to_lowercase();
                let field = field.strip_prefix("communication__").unwrap_or(&field);
                config.apply_override(field, value);
            }
        }
        config
    }

    fn apply_legacy_code(&mut self, code: &str) {
        match code.trim().parse::<u32>() {
            Ok(code) => {
                let (backend, timing) = A2aBackend::from_code(code);
                self.a2a_backend = backend;
                self.a2a_timing = timing;
            }
            Err(_) => warn!(value = code, "Ignoring non-numeric {}", LEGACY_A2A_ENV),
        }
    }

    fn apply_override(&mut self, field: &str, value: &str) {
        match field {
            "a2a_backend" => match A2aBackend::parse(value) {
                Some(backend) => self.a2a_backend = backend,
                None => warn!(value = value, "Unknown all-to-all backend, keeping {:?}", self.a2a_backend),
            },
            "a2a_timing" => self.a2a_timing = parse_flag(value),
            "world_size" => if let Ok(v) = value.parse() { self.world_size = v; }
            _ => {}
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value.eq_ignore_ascii_case("true") || value == "1"
}

impl MoeConfig {
    /// Load configuration from a JSON file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&content)
            .map_err(|e| MoeError::Config(format!("Failed to parse config: {}", e)))?;

        info!(config_file = %path.display(), "Loaded configuration from file");
        Ok(config)
    }

    /// Load configuration with environment variable overrides.
    ///
    /// Nested keys use double underscore: `MOE_DISPATCH__CAPACITY`.
    pub fn from_file_with_env<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut config = Self::from_file(path)?;
        config.apply_overrides(env::vars());
        Ok(config)
    }

    /// Load configuration from environment only (no file).
    pub fn from_env() -> Self {
        Self::from_vars(env::vars())
    }

    /// Defaults overridden by explicit `MOE_*` / `A2A_TYPE` pairs.
    pub fn from_vars<I: IntoIterator<Item = (String, String)>>(vars: I) -> Self {
        let mut config = Self::default();
        config.apply_overrides(vars);
        config
    }

    fn apply_overrides<I: IntoIterator<Item = (String, String)>>(&mut self, vars: I) {
        let vars: Vec<(String, String)> = vars.into_iter().collect();
        if let Some((_, code)) = vars.iter().find(|(key, _)| key == LEGACY_A2A_ENV) {
            self.communication.apply_legacy_code(code);
        }

        for (key, value) in &vars {
            let Some(config_key) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let config_key = config_key.to_lowercase();
            let parts: Vec<&str> = config_key.split("__").collect();

            match parts.as_slice() {
                ["dispatch", field] => self.apply_dispatch_override(field, value),
                ["communication", field] => self.communication.apply_override(field, value),
                [field] => {
                    self.apply_dispatch_override(field, value);
                    self.communication.apply_override(field, value);
                }
                _ => {
                    debug!(key = %key, "Unknown config key pattern");
                }
            }
        }
    }

    fn apply_dispatch_override(&mut self, field: &str, value: &str) {
        match field {
            "num_global_experts" | "num_experts" => if let Ok(v) = value.parse() { self.dispatch.num_global_experts = v; }
            "capacity" => if let Ok(v) = value.parse() { self.dispatch.capacity = v; }
            "model_dim" => if let Ok(v) = value.parse() { self.dispatch.model_dim = v; }
            "dtype" => self.dispatch.dtype = value.to_string(),
            "top_k" | "top" => if let Ok(v) = value.parse() { self.dispatch.top_k = v; }
            "num_tokens" => if let Ok(v) = value.parse() { self.dispatch.num_tokens = v; }
            _ => {}
        }
    }

    /// Validate configuration consistency.
    pub fn validate(&self) -> Result<()> {
        self.dispatch.to_dispatch_config()?;

        let world_size = self.communication.world_size;
        if world_size == 0 {
            return Err(MoeError::Config("world_size must be at least 1".to_string()));
        }

        if self.dispatch.num_global_experts % world_size != 0 {
            return Err(MoeError::Config(format!(
                "num_global_experts ({}) must be divisible by world_size ({})",
                self.dispatch.num_global_experts, world_size
            )));
        }

        if self.dispatch.top_k == 0 || self.dispatch.top_k > self.dispatch.num_global_experts {
            return Err(MoeError::Config(format!(
                "top_k ({}) must be in 1..={}",
                self.dispatch.top_k, self.dispatch.num_global_experts
            )));
        }

        Ok(())
    }

    /// Save configuration to a JSON file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| MoeError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, json)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = MoeConfig::default();
        assert_eq!(config.dispatch.capacity, 64);
        assert_eq!(config.communication.a2a_backend, A2aBackend::Standard);
        assert!(!config.communication.a2a_timing);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_save_load() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("config.json");

        let mut config = MoeConfig::default();
        config.communication.a2a_backend = A2aBackend::External;
        config.save(&path)?;

        let loaded = MoeConfig::from_file(&path)?;
        assert_eq!(loaded.dispatch.model_dim, config.dispatch.model_dim);
        assert_eq!(loaded.communication.a2a_backend, A2aBackend::External);

        Ok(())
    }

    #[test]
    fn test_backend_from_json_name() -> Result<()> {
        let config: MoeConfig = serde_json::from_str(
            r#"{"communication": {"a2a_backend": "pass_through", "a2a_timing": true}}"#,
        )
        .map_err(|e| MoeError::Config(e.to_string()))?;
        assert_eq!(config.communication.a2a_backend, A2aBackend::PassThrough);
        assert!(config.communication.a2a_timing);
        assert_eq!(config.dispatch.top_k, 2);
        Ok(())
    }

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_env_override() {
        let config = MoeConfig::from_vars(vars(&[
            ("MOE_DISPATCH__CAPACITY", "16"),
            ("MOE_MODEL_DIM", "32"),
            ("PATH", "/usr/bin"),
        ]));
        assert_eq!(config.dispatch.capacity, 16);
        assert_eq!(config.dispatch.model_dim, 32);
        assert_eq!(config.communication.a2a_backend, CommunicationConfig::default().a2a_backend);
    }

    #[test]
    fn test_named_backend_beats_legacy_code() {
        // code 10 = external + timing
        let legacy = CommunicationConfig::from_vars(vars(&[("A2A_TYPE", "10")]));
        assert_eq!(legacy.a2a_backend, A2aBackend::External);
        assert!(legacy.a2a_timing);

        let config = MoeConfig::from_vars(vars(&[
            ("MOE_COMMUNICATION__A2A_BACKEND", "standard"),
            ("A2A_TYPE", "10"),
        ]));
        assert_eq!(config.communication.a2a_backend, A2aBackend::Standard);
        assert!(config.communication.a2a_timing);
    }

    #[test]
    fn test_parse_dtype() {
        assert_eq!(parse_dtype("float16").unwrap(), DType::F16);
        assert_eq!(parse_dtype("BF16").unwrap(), DType::BF16);
        assert!(matches!(parse_dtype("int8"), Err(MoeError::Config(_))));
    }

    #[test]
    fn test_validation() {
        let mut config = MoeConfig::default();
        config.communication.world_size = 3;
        assert!(config.validate().is_err());

        config.communication.world_size = 2;
        assert!(config.validate().is_ok());

        config.dispatch.capacity = 0;
        assert!(config.validate().is_err());
    }
}
