use std::path::{Path, PathBuf};

use manifold_core::{GatewayError, Result};
use tracing::{info, warn};

use crate::schema::GatewayConfig;

/// Loads the gateway configuration from disk with env-var fallbacks.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Resolve the config path: explicit path > MANIFOLD_CONFIG env >
    /// ./manifold.toml.
    pub fn resolve_path(explicit: Option<&Path>) -> PathBuf {
        if let Some(p) = explicit {
            return p.to_path_buf();
        }
        if let Ok(p) = std::env::var("MANIFOLD_CONFIG") {
            return PathBuf::from(p);
        }
        PathBuf::from("manifold.toml")
    }

    /// Load the config from disk, falling back to defaults when the file is
    /// absent. Env overrides apply after parsing; validation warnings are
    /// logged, validation errors fail the load.
    pub fn load(path: Option<&Path>) -> Result<GatewayConfig> {
        let config_path = Self::resolve_path(path);
        let config = if config_path.exists() {
            info!(?config_path, "loading configuration");
            let raw = std::fs::read_to_string(&config_path)?;
            toml::from_str::<GatewayConfig>(&raw).map_err(|e| {
                GatewayError::config(format!("failed to parse {}: {e}", config_path.display()))
            })?
        } else {
            warn!(?config_path, "config file not found, using defaults");
            GatewayConfig::default()
        };

        let config = Self::apply_env_overrides(config);

        match config.validate() {
            Ok(warnings) => {
                for w in &warnings {
                    warn!("{w}");
                }
            }
            Err(e) => return Err(GatewayError::config(e)),
        }

        Ok(config)
    }

    /// Env vars fill in provider API keys the file leaves unset (file takes
    /// priority, env is the fallback) and may override the log level.
    fn apply_env_overrides(mut config: GatewayConfig) -> GatewayConfig {
        if let Ok(v) = std::env::var("MANIFOLD_LOG_LEVEL") {
            config.logging.level = v;
        }
        for (provider, env_key) in [
            ("openai", "OPENAI_API_KEY"),
            ("anthropic", "ANTHROPIC_API_KEY"),
            ("gemini", "GEMINI_API_KEY"),
            ("cerebras", "CEREBRAS_API_KEY"),
            ("mistral", "MISTRAL_API_KEY"),
        ] {
            if let Some(settings) = config.providers.get_mut(provider)
                && settings.api_key.is_none()
                && let Ok(v) = std::env::var(env_key)
            {
                settings.api_key = Some(v);
            }
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_file_uses_defaults() {
        let config = ConfigLoader::load(Some(Path::new("/nonexistent/manifold.toml"))).unwrap();
        assert_eq!(config.routing.max_retries, 3);
    }

    #[test]
    fn loads_file_and_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [routing]
            max_retries = 5

            [circuit_breaker]
            failure_threshold = 3
            sliding_window_size = 6
            "#
        )
        .unwrap();
        let config = ConfigLoader::load(Some(file.path())).unwrap();
        assert_eq!(config.routing.max_retries, 5);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
    }

    #[test]
    fn invalid_file_fails_load() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [circuit_breaker]
            failure_rate_threshold = 7.0
            "#
        )
        .unwrap();
        assert!(ConfigLoader::load(Some(file.path())).is_err());
    }
}
