use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::models::RunParameters;
use crate::pipeline::classification::OrchestratorSettings;

/// Application-level constants
pub const APP_NAME: &str = "cpra-filter";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    if cfg!(debug_assertions) {
        "cpra_filter=debug,tower_http=debug,info"
    } else {
        "cpra_filter=info,warn"
    }
}

/// Application data directory: `~/.cpra-filter/`.
pub fn app_data_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".cpra-filter"))
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{var}={value:?}: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },

    #[error("Cannot determine home directory; set CPRA_DB_PATH")]
    NoDataDir,
}

/// Process-wide settings, read once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub ollama_url: String,
    pub database_path: PathBuf,
    pub bind_addr: SocketAddr,
    pub cors_origin: String,
    pub generation_timeout: Duration,
    pub liveness_timeout: Duration,
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    pub default_concurrency: usize,
    pub inference_slots: usize,
    pub low_confidence_threshold: f64,
    pub confidence_level: f64,
    pub prompt_path: Option<PathBuf>,
    pub max_body_chars: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable source (tests pass a map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let database_path = match get("CPRA_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => app_data_dir().ok_or(ConfigError::NoDataDir)?.join("cpra.db"),
        };

        let config = Self {
            ollama_url: get("OLLAMA_BASE_URL").unwrap_or_else(|| "http://localhost:11434".into()),
            database_path,
            bind_addr: parse(&get, "CPRA_BIND", SocketAddr::from(([127, 0, 0, 1], 8000)))?,
            cors_origin: get("CPRA_CORS_ORIGIN").unwrap_or_else(|| "http://localhost:5173".into()),
            generation_timeout: Duration::from_secs(parse(&get, "CPRA_GENERATION_TIMEOUT_SECS", 120)?),
            liveness_timeout: Duration::from_secs(parse(&get, "CPRA_LIVENESS_TIMEOUT_SECS", 5)?),
            max_attempts: parse(&get, "CPRA_MAX_ATTEMPTS", 3)?,
            backoff_base: Duration::from_millis(parse(&get, "CPRA_BACKOFF_BASE_MS", 500)?),
            backoff_max: Duration::from_millis(parse(&get, "CPRA_BACKOFF_MAX_MS", 30_000)?),
            default_concurrency: parse(&get, "CPRA_CONCURRENCY", 4)?,
            inference_slots: parse(&get, "CPRA_INFERENCE_SLOTS", 8)?,
            low_confidence_threshold: parse(&get, "CPRA_LOW_CONFIDENCE", 0.65)?,
            confidence_level: parse(&get, "CPRA_CONFIDENCE_LEVEL", 0.95)?,
            prompt_path: get("CPRA_PROMPT_PATH").map(PathBuf::from),
            max_body_chars: parse(&get, "CPRA_MAX_BODY_CHARS", 8000)?,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let check = |ok: bool, var: &'static str, value: String, reason: &str| {
            if ok {
                Ok(())
            } else {
                Err(ConfigError::Invalid {
                    var,
                    value,
                    reason: reason.to_string(),
                })
            }
        };
        check(
            self.ollama_url.starts_with("http://") || self.ollama_url.starts_with("https://"),
            "OLLAMA_BASE_URL",
            self.ollama_url.clone(),
            "must be an http(s) URL",
        )?;
        check(
            !self.generation_timeout.is_zero(),
            "CPRA_GENERATION_TIMEOUT_SECS",
            "0".into(),
            "must be positive",
        )?;
        check(
            !self.liveness_timeout.is_zero(),
            "CPRA_LIVENESS_TIMEOUT_SECS",
            "0".into(),
            "must be positive",
        )?;
        check(
            (1..=10).contains(&self.max_attempts),
            "CPRA_MAX_ATTEMPTS",
            self.max_attempts.to_string(),
            "must be between 1 and 10",
        )?;
        check(
            self.backoff_base <= self.backoff_max,
            "CPRA_BACKOFF_BASE_MS",
            self.backoff_base.as_millis().to_string(),
            "must not exceed CPRA_BACKOFF_MAX_MS",
        )?;
        check(
            (1..=64).contains(&self.default_concurrency),
            "CPRA_CONCURRENCY",
            self.default_concurrency.to_string(),
            "must be between 1 and 64",
        )?;
        check(
            self.inference_slots >= 1,
            "CPRA_INFERENCE_SLOTS",
            self.inference_slots.to_string(),
            "must be at least 1",
        )?;
        check(
            self.default_concurrency <= self.inference_slots,
            "CPRA_CONCURRENCY",
            self.default_concurrency.to_string(),
            "must not exceed CPRA_INFERENCE_SLOTS",
        )?;
        check(
            (0.0..=1.0).contains(&self.low_confidence_threshold),
            "CPRA_LOW_CONFIDENCE",
            self.low_confidence_threshold.to_string(),
            "must lie within [0, 1]",
        )?;
        check(
            self.confidence_level > 0.0 && self.confidence_level < 1.0,
            "CPRA_CONFIDENCE_LEVEL",
            self.confidence_level.to_string(),
            "must lie strictly between 0 and 1",
        )?;
        check(
            self.max_body_chars >= 100,
            "CPRA_MAX_BODY_CHARS",
            self.max_body_chars.to_string(),
            "must be at least 100",
        )
    }

    pub fn default_parameters(&self) -> RunParameters {
        RunParameters {
            concurrency: self.default_concurrency,
            max_attempts: self.max_attempts,
            ..RunParameters::default()
        }
    }

    pub fn orchestrator_settings(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            generation_timeout: self.generation_timeout,
            base_delay: self.backoff_base,
            max_delay: self.backoff_max,
            low_confidence_threshold: self.low_confidence_threshold,
            default_parameters: self.default_parameters(),
        }
    }
}

fn parse<T>(get: &impl Fn(&str) -> Option<String>, var: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: Display,
{
    match get(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::Invalid {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(vars: &[(&str, &str)]) -> Result<AppConfig, ConfigError> {
        let mut map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        map.entry("CPRA_DB_PATH".into()).or_insert_with(|| "/tmp/cpra-test.db".into());
        AppConfig::from_lookup(|key| map.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.ollama_url, "http://localhost:11434");
        assert_eq!(config.bind_addr.to_string(), "127.0.0.1:8000");
        assert_eq!(config.generation_timeout, Duration::from_secs(120));
        assert_eq!(config.liveness_timeout, Duration::from_secs(5));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_base, Duration::from_millis(500));
        assert_eq!(config.backoff_max, Duration::from_secs(30));
        assert_eq!(config.default_concurrency, 4);
        assert_eq!(config.inference_slots, 8);
        assert_eq!(config.low_confidence_threshold, 0.65);
        assert_eq!(config.confidence_level, 0.95);
        assert_eq!(config.cors_origin, "http://localhost:5173");
        assert!(config.prompt_path.is_none());
    }

    #[test]
    fn overrides_are_read() {
        let config = config_from(&[
            ("OLLAMA_BASE_URL", "http://gpu-box:11434"),
            ("CPRA_CONCURRENCY", "8"),
            ("CPRA_MAX_ATTEMPTS", "5"),
            ("CPRA_PROMPT_PATH", "/etc/cpra/prompt.json"),
        ])
        .unwrap();
        assert_eq!(config.ollama_url, "http://gpu-box:11434");
        let params = config.default_parameters();
        assert_eq!(params.concurrency, 8);
        assert_eq!(params.max_attempts, 5);
        assert_eq!(config.orchestrator_settings().default_parameters, params);
        assert_eq!(config.prompt_path, Some(PathBuf::from("/etc/cpra/prompt.json")));
    }

    #[test]
    fn malformed_value_names_the_variable() {
        let err = config_from(&[("CPRA_CONCURRENCY", "many")]).unwrap_err();
        assert!(err.to_string().starts_with("CPRA_CONCURRENCY"));
    }

    #[test]
    fn out_of_range_values_rejected() {
        assert!(config_from(&[("CPRA_CONFIDENCE_LEVEL", "1.0")]).is_err());
        assert!(config_from(&[("CPRA_MAX_ATTEMPTS", "0")]).is_err());
        assert!(config_from(&[("CPRA_BACKOFF_BASE_MS", "60000")]).is_err());
        assert!(config_from(&[("OLLAMA_BASE_URL", "localhost:11434")]).is_err());
    }

    #[test]
    fn default_concurrency_fits_inference_slots() {
        let err = config_from(&[("CPRA_CONCURRENCY", "16")]).unwrap_err();
        assert!(err.to_string().contains("CPRA_INFERENCE_SLOTS"));
        let config = config_from(&[("CPRA_CONCURRENCY", "16"), ("CPRA_INFERENCE_SLOTS", "16")]).unwrap();
        assert_eq!(config.default_parameters().concurrency, 16);
    }

    #[test]
    fn data_dir_under_home() {
        if let (Some(dir), Some(home)) = (app_data_dir(), dirs::home_dir()) {
            assert!(dir.starts_with(home));
            assert!(dir.ends_with(".cpra-filter"));
        }
    }

    #[test]
    fn app_version_matches_cargo() {
        assert_eq!(APP_VERSION, "0.1.0");
    }
}
