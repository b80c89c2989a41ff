//! Configuration Loader
//!
//! Environment-aware configuration loading. Layers, lowest precedence first:
//!
//! 1. `<config dir>/artpost.yaml` (required)
//! 2. `<config dir>/artpost.<environment>.yaml` (optional)
//! 3. `ARTPOST__<SECTION>__<KEY>` environment variables

use super::error::{ConfigResult, ConfigurationError};
use super::PublisherConfig;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BASE_FILE_STEM: &str = "artpost";
const ENV_PREFIX: &str = "ARTPOST";

/// Loaded, validated configuration plus where it came from
#[derive(Debug)]
pub struct ConfigManager {
    config: PublisherConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(Self::default_config_directory);
        let base_file = config_directory.join(format!("{BASE_FILE_STEM}.yaml"));

        if !base_file.is_file() {
            return Err(ConfigurationError::config_file_not_found(vec![base_file]));
        }

        debug!(
            environment = environment,
            directory = %config_directory.display(),
            "Loading publisher configuration"
        );

        let env_file = config_directory.join(format!("{BASE_FILE_STEM}.{environment}.yaml"));
        let config = Self::build_layers(&base_file, &env_file)?;
        config.validate()?;

        debug!(
            "Configuration loaded successfully: {}",
            serde_json::to_string_pretty(&Self::sanitize_config_for_logging(&config))
                .unwrap_or_else(|_| "[serialization error]".to_string())
        );

        info!(
            environment = environment,
            concurrency = config.queue.concurrency,
            circuit_breakers_enabled = config.circuit_breakers.enabled,
            "⚙️ Publisher configuration loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an in-memory configuration (tests, embedding)
    pub fn from_config(
        config: PublisherConfig,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory: Self::default_config_directory(),
        }))
    }

    fn build_layers(base_file: &Path, env_file: &Path) -> ConfigResult<PublisherConfig> {
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(base_file.to_path_buf()))
            .add_source(::config::File::from(env_file.to_path_buf()).required(false))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConfigurationError::load_error(base_file.display().to_string(), e))?;

        settings
            .try_deserialize::<PublisherConfig>()
            .map_err(|e| ConfigurationError::load_error(base_file.display().to_string(), e))
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Configuration as JSON with credentials masked
    pub fn debug_config(&self) -> serde_json::Value {
        Self::sanitize_config_for_logging(&self.config)
    }

    /// Detect environment from `ARTPOST_ENV`, then `APP_ENV`
    pub fn detect_environment() -> String {
        env::var("ARTPOST_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
    }

    fn default_config_directory() -> PathBuf {
        env::var("ARTPOST_CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("config"))
    }

    fn sanitize_config_for_logging(config: &PublisherConfig) -> serde_json::Value {
        let mut config_json = serde_json::json!(config);
        Self::sanitize_json_recursive(&mut config_json);
        config_json
    }

    /// Mask credentials embedded in URLs and secret-looking keys
    fn sanitize_json_recursive(value: &mut serde_json::Value) {
        const SENSITIVE_PATTERNS: [&str; 4] = ["password", "secret", "token", "url"];

        match value {
            serde_json::Value::Object(map) => {
                for (key, val) in map.iter_mut() {
                    let key_lower = key.to_lowercase();
                    let is_sensitive = SENSITIVE_PATTERNS
                        .iter()
                        .any(|pattern| key_lower.contains(pattern));

                    if is_sensitive {
                        if let serde_json::Value::String(s) = val {
                            *val = serde_json::Value::String(mask(s));
                        }
                    } else {
                        Self::sanitize_json_recursive(val);
                    }
                }
            }
            serde_json::Value::Array(items) => {
                for item in items {
                    Self::sanitize_json_recursive(item);
                }
            }
            _ => {}
        }
    }
}

fn mask(value: &str) -> String {
    if value.is_empty() {
        "[EMPTY]".to_string()
    } else if value.starts_with("${") {
        value.to_string()
    } else if value.len() > 4 {
        format!("[MASKED: {}***{}]", &value[..2], &value[value.len() - 2..])
    } else {
        "[MASKED]".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_missing_base_file_is_reported() {
        let dir = TempDir::new().unwrap();
        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(
            result,
            Err(ConfigurationError::ConfigFileNotFound { .. })
        ));
    }

    #[test]
    fn test_environment_file_overrides_base() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("artpost.yaml"),
            "queue:\n  concurrency: 2\n  max_attempts: 5\nrecovery:\n  batch_size: 50\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("artpost.test.yaml"),
            "queue:\n  concurrency: 1\n",
        )
        .unwrap();

        let manager =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
                .unwrap();

        assert_eq!(manager.environment(), "test");
        assert_eq!(manager.config().queue.concurrency, 1);
        assert_eq!(manager.config().queue.max_attempts, 5);
        assert_eq!(manager.config().recovery.batch_size, 50);
        // Untouched sections keep their defaults
        assert_eq!(manager.config().lock_cleanup.interval_seconds, 300);
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("artpost.yaml"), "queue:\n  concurrency: 0\n").unwrap();

        let result =
            ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
        assert!(matches!(result, Err(ConfigurationError::InvalidValue { .. })));
    }

    #[test]
    fn test_debug_config_masks_database_url() {
        let mut config = PublisherConfig::default();
        config.database.url = Some("postgresql://artpost:hunter2@db/artpost".to_string());
        let manager = ConfigManager::from_config(config, "test").unwrap();

        let dumped = manager.debug_config();
        let url = dumped["database"]["url"].as_str().unwrap();
        assert!(!url.contains("hunter2"));
        assert!(url.starts_with("[MASKED"));
    }
}
