//! # Application configuration
//!
//! [`AppConfig`] is resolved from defaults, an optional YAML/JSON file and
//! `POLYCHAT_*` environment variables, in that order.

use crate::config::catalog::{ModelInfo, ModelParameters};
use crate::models::{COMMON_DEFAULT_ID, DefaultEntry};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, env, fmt, fs, path::Path, path::PathBuf, str::FromStr, time::Duration};
use url::Url;

/// Environment variable holding the provider API key.
pub const ENV_API_KEY: &str = "POLYCHAT_API_KEY";
/// Environment variable overriding the provider base URL.
pub const ENV_BASE_URL: &str = "POLYCHAT_BASE_URL";
/// Environment variable overriding the log level.
pub const ENV_LOG_LEVEL: &str = "POLYCHAT_LOG_LEVEL";
/// Environment variable overriding the log format (`text` or `json`).
pub const ENV_LOG_FORMAT: &str = "POLYCHAT_LOG_FORMAT";
/// Environment variable overriding the stall timeout in seconds.
pub const ENV_STALL_TIMEOUT_SECS: &str = "POLYCHAT_STALL_TIMEOUT_SECS";

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// Output format of the tracing subscriber.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("Invalid log format '{other}': expected 'text' or 'json'")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
        })
    }
}

/// Completion API connection settings.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the `OpenAI`-compatible API, without trailing `/chat/completions`
    pub base_url: String,

    /// Bearer token sent with every request
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Overall timeout for non-streaming requests (in seconds)
    pub request_timeout_secs: u64,

    /// Timeout for remote image downloads (in seconds)
    pub image_fetch_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            request_timeout_secs: 120,
            image_fetch_timeout_secs: 30,
        }
    }
}

impl ApiConfig {
    /// Timeout applied to non-streaming requests.
    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Timeout applied to image downloads.
    #[must_use]
    pub fn image_fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.image_fetch_timeout_secs)
    }
}

/// Run controller and reconciliation tuning.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct OrchestratorSettings {
    /// Time without any visible output before a run falls back (in seconds)
    pub stall_timeout_secs: u64,

    /// Quiet period before a changed message is persisted (in milliseconds)
    pub persist_debounce_ms: u64,

    /// Maximum number of generation lookup attempts
    pub lookup_attempts: u32,

    /// Delay before the second lookup attempt, doubled after each miss (in milliseconds)
    pub lookup_base_delay_ms: u64,

    /// Absolute tolerance, in USD, when comparing streamed and looked-up cost
    pub cost_tolerance: f64,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            stall_timeout_secs: 30,
            persist_debounce_ms: 500,
            lookup_attempts: 5,
            lookup_base_delay_ms: 500,
            cost_tolerance: 1e-6,
        }
    }
}

impl OrchestratorSettings {
    /// Quiet period before a stalled stream falls back.
    #[must_use]
    pub fn stall_timeout(&self) -> Duration {
        Duration::from_secs(self.stall_timeout_secs)
    }

    /// Debounce delay for streaming persistence writes.
    #[must_use]
    pub fn persist_debounce(&self) -> Duration {
        Duration::from_millis(self.persist_debounce_ms)
    }

    /// Delay before the second generation lookup.
    #[must_use]
    pub fn lookup_base_delay(&self) -> Duration {
        Duration::from_millis(self.lookup_base_delay_ms)
    }
}

/// Logging settings consumed by the CLI's tracing subscriber.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Output format
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
        }
    }
}

/// The main configuration structure for `polychat`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Completion API connection
    pub api: ApiConfig,

    /// Run controller tuning
    pub orchestrator: OrchestratorSettings,

    /// Logging
    pub logging: LoggingConfig,

    /// Model catalog keyed by model id
    pub models: HashMap<String, ModelInfo>,

    /// Per-model parameter overrides keyed by model id
    pub parameters: HashMap<String, ModelParameters>,

    /// Default entries, including the `common` base entry
    pub defaults: Vec<DefaultEntry>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl AppConfig {
    /// Generates a default configuration.
    #[must_use]
    pub fn with_defaults() -> Self {
        Self {
            api: ApiConfig::default(),
            orchestrator: OrchestratorSettings::default(),
            logging: LoggingConfig::default(),
            models: HashMap::new(),
            parameters: HashMap::new(),
            defaults: vec![DefaultEntry::common()],
        }
    }

    /// Per-user configuration file location (`config.yaml` in the platform config dir).
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("dev", "polychat", "polychat")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Loads the configuration from a file, environment variables, or defaults.
    ///
    /// # Arguments
    /// * `config_path` - Optional path to a `.yaml`, `.yml` or `.json` file.
    ///
    /// # Errors
    /// Returns an error when the file cannot be read or parsed, its extension is
    /// unsupported, or an environment override holds an invalid value.
    pub fn load_config(config_path: Option<PathBuf>) -> Result<Self, Box<dyn std::error::Error>> {
        Self::load_with_env(config_path, |key| env::var(key).ok())
    }

    fn load_with_env<F>(config_path: Option<PathBuf>, lookup: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match config_path {
            Some(path) => Self::from_file(&path)?,
            None => Self::with_defaults(),
        };

        config.apply_env_overrides(lookup)?;
        config.ensure_common_default();

        Ok(config)
    }

    fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let content = fs::read_to_string(path)?;
        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml" | "yml") => serde_yml::from_str(&content)?,
            Some("json") => serde_json::from_str(&content)?,
            _ => return Err("Unsupported configuration format. Use 'yaml' or 'json'.".into()),
        };
        Ok(config)
    }

    /// Applies environment overrides to values still at their default.
    ///
    /// # Errors
    /// Returns an error when an override cannot be parsed.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::with_defaults();

        if self.api.api_key.is_none() && let Some(key) = lookup(ENV_API_KEY).filter(|key| !key.trim().is_empty()) {
            self.api.api_key = Some(key);
        }
        if self.api.base_url == defaults.api.base_url && let Some(base_url) = lookup(ENV_BASE_URL) {
            self.api.base_url = base_url;
        }
        if self.logging.level == defaults.logging.level && let Some(level) = lookup(ENV_LOG_LEVEL) {
            self.logging.level = level;
        }
        if self.logging.format == defaults.logging.format && let Some(format) = lookup(ENV_LOG_FORMAT) {
            self.logging.format = format.parse()?;
        }
        if self.orchestrator.stall_timeout_secs == defaults.orchestrator.stall_timeout_secs
            && let Some(secs) = lookup(ENV_STALL_TIMEOUT_SECS)
        {
            self.orchestrator.stall_timeout_secs = secs.trim().parse().map_err(|_| {
                format!("Invalid {ENV_STALL_TIMEOUT_SECS} value: must be a whole number of seconds")
            })?;
        }

        Ok(())
    }

    fn ensure_common_default(&mut self) {
        if !self.defaults.iter().any(DefaultEntry::is_common) {
            self.defaults.insert(0, DefaultEntry::common());
        }
    }

    /// Catalog metadata for `model_id`, if known.
    #[must_use]
    pub fn model(&self, model_id: &str) -> Option<&ModelInfo> {
        self.models.get(model_id)
    }

    /// Parameter overrides for `model_id`, if any.
    #[must_use]
    pub fn parameters_for(&self, model_id: &str) -> Option<&ModelParameters> {
        self.parameters.get(model_id)
    }

    /// Validate the complete configuration.
    ///
    /// # Errors
    /// Returns every problem found, one message per entry.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        match Url::parse(&self.api.base_url) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(format!(
                "Unsupported base URL scheme '{}': use http or https",
                url.scheme()
            )),
            Err(err) => errors.push(format!("Invalid base URL '{}': {err}", self.api.base_url)),
        }

        if self.api.request_timeout_secs == 0 {
            errors.push("Request timeout must be greater than 0".to_string());
        }
        if self.orchestrator.stall_timeout_secs == 0 {
            errors.push("Stall timeout must be greater than 0".to_string());
        }
        if self.orchestrator.lookup_attempts == 0 {
            errors.push("Lookup attempts must be at least 1".to_string());
        }
        if !(self.orchestrator.cost_tolerance >= 0.0) {
            errors.push("Cost tolerance must be a non-negative number".to_string());
        }

        let common_count = self
            .defaults
            .iter()
            .filter(|entry| entry.id == COMMON_DEFAULT_ID)
            .count();
        if common_count != 1 {
            errors.push(format!(
                "Exactly one '{COMMON_DEFAULT_ID}' default entry is required, found {common_count}"
            ));
        }
        if let Some(common) = self.defaults.iter().find(|entry| entry.is_common()) && !common.pattern.is_empty() {
            errors.push(format!("The '{COMMON_DEFAULT_ID}' default entry must have an empty pattern"));
        }

        for (model_id, info) in &self.models {
            let pricing = info.pricing;
            if [pricing.prompt, pricing.completion, pricing.request, pricing.image]
                .iter()
                .any(|price| !(*price >= 0.0))
            {
                errors.push(format!("Model '{model_id}' has a negative or invalid price"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::catalog::ModelPricing;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_config_with_defaults() {
        let config = AppConfig::with_defaults();

        assert_eq!(config.api.base_url, DEFAULT_BASE_URL);
        assert_eq!(config.orchestrator.stall_timeout(), Duration::from_secs(30));
        assert_eq!(config.orchestrator.persist_debounce(), Duration::from_millis(500));
        assert_eq!(config.orchestrator.lookup_attempts, 5);
        assert_eq!(config.logging.format, LogFormat::Text);
        assert_eq!(config.defaults.len(), 1);
        assert!(config.defaults[0].is_common());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_overrides_apply_only_to_defaults() {
        let mut config = AppConfig::with_defaults();
        config.api.base_url = "http://localhost:9999/v1".to_string();

        config
            .apply_env_overrides(lookup_from(&[
                (ENV_BASE_URL, "https://example.invalid/api"),
                (ENV_API_KEY, "sk-test"),
                (ENV_LOG_FORMAT, "JSON"),
                (ENV_STALL_TIMEOUT_SECS, "5"),
            ]))
            .unwrap();

        assert_eq!(config.api.base_url, "http://localhost:9999/v1");
        assert_eq!(config.api.api_key.as_deref(), Some("sk-test"));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.orchestrator.stall_timeout_secs, 5);
    }

    #[test]
    fn test_env_override_rejects_invalid_timeout() {
        let mut config = AppConfig::with_defaults();
        let result = config.apply_env_overrides(lookup_from(&[(ENV_STALL_TIMEOUT_SECS, "soon")]));

        assert!(result.unwrap_err().to_string().contains(ENV_STALL_TIMEOUT_SECS));
    }

    #[test]
    fn test_load_config_with_environment_variables() {
        let config = AppConfig::load_with_env(
            None,
            lookup_from(&[(ENV_API_KEY, "sk-env"), (ENV_LOG_LEVEL, "debug")]),
        )
        .unwrap();

        assert_eq!(config.api.api_key.as_deref(), Some("sk-env"));
        assert_eq!(config.logging.level, "debug");
        assert!(config.defaults[0].is_common());
    }

    #[test]
    fn test_load_config_from_yaml_file() -> Result<(), Box<dyn std::error::Error>> {
        let temp_dir = TempDir::new()?;
        let config_file = temp_dir.path().join("polychat.yaml");

        let yaml_content = r#"
api:
  base_url: "http://127.0.0.1:8080/v1"
orchestrator:
  stall_timeout_secs: 12
models:
  openai/gpt-4o:
    name: "GPT-4o"
    output_modalities: ["text"]
    pricing:
      prompt: 0.000003
      completion: 0.000006
parameters:
  openai/gpt-4o:
    temperature: 0.4
defaults:
  - id: claude
    name: Claude
    pattern: "^anthropic/"
    temperature: 0.2
"#;
        fs::write(&config_file, yaml_content)?;

        let config = AppConfig::load_with_env(Some(config_file), lookup_from(&[]))?;

        assert_eq!(config.api.base_url, "http://127.0.0.1:8080/v1");
        assert_eq!(config.orchestrator.stall_timeout_secs, 12);
        assert_eq!(config.orchestrator.lookup_attempts, 5);
        let info = config.model("openai/gpt-4o").expect("model in catalog");
        assert_eq!(
            info.pricing,
            ModelPricing {
                prompt: 0.000_003,
                completion: 0.000_006,
                ..ModelPricing::default()
            }
        );
        assert_eq!(
            config.parameters_for("openai/gpt-4o").and_then(|p| p.temperature),
            Some(0.4)
        );
        // The common entry is restored when the file omits it.
        assert!(config.defaults[0].is_common());
        assert_eq!(config.defaults[1].overrides.temperature, Some(0.2));
        assert!(config.validate().is_ok());

        Ok(())
    }

    #[test]
    fn test_load_config_from_json_file() -> Result<(), Box<dyn std::error::Error>> {
        let temp_dir = TempDir::new()?;
        let config_file = temp_dir.path().join("polychat.json");
        fs::write(
            &config_file,
            r#"{"logging": {"level": "warn", "format": "json"}}"#,
        )?;

        let config = AppConfig::load_with_env(Some(config_file), lookup_from(&[]))?;

        assert_eq!(config.logging.level, "warn");
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.api.base_url, DEFAULT_BASE_URL);

        Ok(())
    }

    #[test]
    fn test_load_config_unsupported_format() {
        let temp_dir = TempDir::new().unwrap();
        let config_file = temp_dir.path().join("polychat.toml");
        fs::write(&config_file, "stall_timeout_secs = 3").unwrap();

        let result = AppConfig::load_config(Some(config_file));

        assert!(
            result
                .unwrap_err()
                .to_string()
                .contains("Unsupported configuration format")
        );
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = AppConfig::with_defaults();
        config.api.base_url = "ftp://example.com".to_string();
        config.orchestrator.stall_timeout_secs = 0;
        config.orchestrator.lookup_attempts = 0;
        config.defaults.push(DefaultEntry::common());

        let errors = config.validate().unwrap_err();

        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("scheme")));
        assert!(errors.iter().any(|e| e.contains("Stall timeout")));
        assert!(errors.iter().any(|e| e.contains("found 2")));
    }
}
