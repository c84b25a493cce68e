use secrecy::SecretString;
use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;
use wayfinder_core::NavigationConfig;
use wayfinder_core::refiner::DEFAULT_API_BASE;
use wayfinder_core::routing::DEFAULT_OSRM_BASE_URL;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Backends for instruction refinement.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Provider {
    OpenAI,
    /// No language model; every instruction is the grounded template.
    Offline,
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub provider: Provider,
    pub openai_api_key: Option<SecretString>,
    pub refiner_api_base: String,
    pub chat_model: String,
    pub routing_base_url: String,
    pub log_level: Level,
    pub navigation: NavigationConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// This function will look for a `.env` file in the current directory
    /// and load the following variables:
    ///
    /// *   `BIND_ADDRESS`: The address and port to bind the server to. Defaults to "0.0.0.0:3000".
    /// *   `REFINER_PROVIDER`: "openai" or "offline". Defaults to "openai".
    /// *   `OPENAI_API_KEY`: Required if the provider is "openai".
    /// *   `REFINER_API_BASE`: (Optional) Base URL of an OpenAI-compatible API.
    /// *   `CHAT_MODEL`: (Optional) The model used to phrase instructions. Defaults to "gpt-4o".
    /// *   `ROUTING_BASE_URL`: (Optional) OSRM server. Defaults to the public demo server.
    /// *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    /// *   `MOVEMENT_THRESHOLD_M`, `ARRIVAL_THRESHOLD_M`, `REQUIRED_CONFIRMATIONS`,
    ///     `STRIDE_LENGTH_M`, `REFINER_TIMEOUT_MS`, `ROUTING_TIMEOUT_MS`,
    ///     `SESSION_IDLE_TTL_SECS`, `VISION_TTL_SECS`: (Optional) engine tunables.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Builds the configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let bind_address_str = lookup("BIND_ADDRESS").unwrap_or_else(|| "0.0.0.0:3000".to_string());
        let bind_address = bind_address_str
            .parse::<SocketAddr>()
            .map_err(|e| ConfigError::InvalidValue("BIND_ADDRESS".to_string(), e.to_string()))?;

        let provider_str = lookup("REFINER_PROVIDER").unwrap_or_else(|| "openai".to_string());
        let provider = match provider_str.to_lowercase().as_str() {
            "openai" => Provider::OpenAI,
            "offline" | "none" => Provider::Offline,
            other => {
                return Err(ConfigError::InvalidValue(
                    "REFINER_PROVIDER".to_string(),
                    format!("'{other}' is not one of: openai, offline"),
                ));
            }
        };

        let openai_api_key = lookup("OPENAI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .map(SecretString::from);

        // Validate that the required API key is present for the selected provider.
        if provider == Provider::OpenAI && openai_api_key.is_none() {
            return Err(ConfigError::MissingVar(
                "OPENAI_API_KEY must be set for 'openai' provider".to_string(),
            ));
        }

        let refiner_api_base =
            lookup("REFINER_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string());
        let chat_model = lookup("CHAT_MODEL").unwrap_or_else(|| "gpt-4o".to_string());
        let routing_base_url =
            lookup("ROUTING_BASE_URL").unwrap_or_else(|| DEFAULT_OSRM_BASE_URL.to_string());

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let defaults = NavigationConfig::default();
        let navigation = NavigationConfig {
            movement_threshold_m: parse_var(&lookup, "MOVEMENT_THRESHOLD_M", defaults.movement_threshold_m)?,
            arrival_threshold_m: parse_var(&lookup, "ARRIVAL_THRESHOLD_M", defaults.arrival_threshold_m)?,
            required_confirmations: parse_var(
                &lookup,
                "REQUIRED_CONFIRMATIONS",
                defaults.required_confirmations,
            )?,
            stride_length_m: parse_var(&lookup, "STRIDE_LENGTH_M", defaults.stride_length_m)?,
            refiner_timeout: Duration::from_millis(parse_var(
                &lookup,
                "REFINER_TIMEOUT_MS",
                defaults.refiner_timeout.as_millis() as u64,
            )?),
            routing_timeout: Duration::from_millis(parse_var(
                &lookup,
                "ROUTING_TIMEOUT_MS",
                defaults.routing_timeout.as_millis() as u64,
            )?),
            session_idle_ttl: Duration::from_secs(parse_var(
                &lookup,
                "SESSION_IDLE_TTL_SECS",
                defaults.session_idle_ttl.as_secs(),
            )?),
            vision_ttl: Duration::from_secs(parse_var(
                &lookup,
                "VISION_TTL_SECS",
                defaults.vision_ttl.as_secs(),
            )?),
            ..defaults
        };

        if navigation.stride_length_m <= 0.0 {
            return Err(ConfigError::InvalidValue(
                "STRIDE_LENGTH_M".to_string(),
                "must be greater than zero".to_string(),
            ));
        }
        if navigation.required_confirmations == 0 {
            return Err(ConfigError::InvalidValue(
                "REQUIRED_CONFIRMATIONS".to_string(),
                "must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            bind_address,
            provider,
            openai_api_key,
            refiner_api_base,
            chat_model,
            routing_base_url,
            log_level,
            navigation,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults_with_offline_provider() {
        let config = Config::from_lookup(lookup(&[("REFINER_PROVIDER", "offline")])).unwrap();

        assert_eq!(config.bind_address, "0.0.0.0:3000".parse().unwrap());
        assert_eq!(config.provider, Provider::Offline);
        assert_eq!(config.chat_model, "gpt-4o");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.navigation.movement_threshold_m, 8.0);
        assert_eq!(config.navigation.stride_length_m, 0.7);
        assert_eq!(config.navigation.refiner_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_openai_requires_key() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingVar(_)));

        let config = Config::from_lookup(lookup(&[("OPENAI_API_KEY", "sk-test")])).unwrap();
        assert_eq!(config.provider, Provider::OpenAI);
        assert!(config.openai_api_key.is_some());
    }

    #[test]
    fn test_tunables_override_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("REFINER_PROVIDER", "offline"),
            ("STRIDE_LENGTH_M", "0.8"),
            ("REQUIRED_CONFIRMATIONS", "3"),
            ("REFINER_TIMEOUT_MS", "1500"),
            ("BIND_ADDRESS", "127.0.0.1:8080"),
        ]))
        .unwrap();

        assert_eq!(config.navigation.stride_length_m, 0.8);
        assert_eq!(config.navigation.required_confirmations, 3);
        assert_eq!(config.navigation.refiner_timeout, Duration::from_millis(1500));
        assert_eq!(config.bind_address.port(), 8080);
    }

    #[test]
    fn test_invalid_values_are_reported() {
        let err = Config::from_lookup(lookup(&[
            ("REFINER_PROVIDER", "offline"),
            ("ARRIVAL_THRESHOLD_M", "far"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "ARRIVAL_THRESHOLD_M"));

        let err = Config::from_lookup(lookup(&[("REFINER_PROVIDER", "gemini")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(name, _) if name == "REFINER_PROVIDER"));

        let err = Config::from_lookup(lookup(&[
            ("REFINER_PROVIDER", "offline"),
            ("STRIDE_LENGTH_M", "0"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_, _)));
    }
}
