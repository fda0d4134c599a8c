// src/config.rs
use dotenvy::dotenv;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::{
    errors::{DispatchError, DispatchResult},
    services::{
        dispatch_service::DispatchSettings, geocoding_service::DEFAULT_GEOCODING_URL,
        routing_service::{EstimatorSettings, DEFAULT_DIRECTIONS_URL},
    },
};

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub redis_url: Option<String>,
    pub redis_prefix: String,
    pub google_maps_api_key: Option<String>,
    pub directions_url: String,
    pub geocoding_url: String,
    pub rate_per_km: f64,
    pub completion_grace: Duration,
    pub simulation_tick: Duration,
    pub simulate_positions: bool,
    pub provider_max_attempts: u32,
    pub provider_backoff: Duration,
    pub provider_timeout: Duration,
    pub log_level: String,
}

impl AppConfig {
    /// Environment, after loading `.env` if there is one.
    pub fn load() -> DispatchResult<Self> {
        dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> DispatchResult<Self> {
        // Blank values count as unset
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let text = |key: &str, default: &str| get(key).unwrap_or_else(|| default.to_string());

        let config = Self {
            bind_addr: text("BIND_ADDR", "0.0.0.0:3000"),
            redis_url: get("REDIS_URL"),
            redis_prefix: text("REDIS_PREFIX", "dispatch"),
            google_maps_api_key: get("GOOGLE_MAPS_API_KEY"),
            directions_url: text("DIRECTIONS_URL", DEFAULT_DIRECTIONS_URL),
            geocoding_url: text("GEOCODING_URL", DEFAULT_GEOCODING_URL),
            rate_per_km: parse_value(&get, "RATE_PER_KM", 5.0)?,
            completion_grace: Duration::from_millis(parse_value(&get, "COMPLETION_GRACE_MS", 2000)?),
            simulation_tick: Duration::from_millis(parse_value(&get, "SIMULATION_TICK_MS", 1000)?),
            simulate_positions: parse_value(&get, "SIMULATE_POSITIONS", true)?,
            provider_max_attempts: parse_value(&get, "PROVIDER_MAX_ATTEMPTS", 3)?,
            provider_backoff: Duration::from_millis(parse_value(&get, "PROVIDER_BACKOFF_MS", 250)?),
            provider_timeout: Duration::from_secs(parse_value(&get, "PROVIDER_TIMEOUT_SECS", 10)?),
            log_level: text("LOG_LEVEL", "info"),
        };

        if !config.rate_per_km.is_finite() || config.rate_per_km < 0.0 {
            return Err(DispatchError::InvalidConfiguration(format!(
                "RATE_PER_KM must be a non-negative number, got {}",
                config.rate_per_km
            )));
        }
        if config.provider_max_attempts == 0 {
            return Err(DispatchError::InvalidConfiguration(
                "PROVIDER_MAX_ATTEMPTS must be at least 1".to_string(),
            ));
        }

        Ok(config)
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            completion_grace: self.completion_grace,
            simulation_tick: self.simulation_tick,
            simulate_positions: self.simulate_positions,
        }
    }

    pub fn estimator_settings(&self) -> EstimatorSettings {
        EstimatorSettings {
            rate_per_km: self.rate_per_km,
            max_attempts: self.provider_max_attempts,
            backoff: self.provider_backoff,
        }
    }
}

fn parse_value<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> DispatchResult<T> {
    match get(key) {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| {
            DispatchError::InvalidConfiguration(format!("{} has an unreadable value: {}", key, raw))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_from(pairs: &[(&str, &str)]) -> DispatchResult<AppConfig> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let config = config_from(&[]).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:3000");
        assert!(config.redis_url.is_none());
        assert!(config.google_maps_api_key.is_none());
        assert_eq!(config.rate_per_km, 5.0);
        assert_eq!(config.completion_grace, Duration::from_millis(2000));
        assert_eq!(config.simulation_tick, Duration::from_secs(1));
        assert!(config.simulate_positions);
        assert_eq!(config.provider_max_attempts, 3);
        assert_eq!(config.log_level, "info");
        assert_eq!(config.directions_url, DEFAULT_DIRECTIONS_URL);
    }

    #[test]
    fn test_overrides() {
        let config = config_from(&[
            ("REDIS_URL", "redis://127.0.0.1/"),
            ("GOOGLE_MAPS_API_KEY", "  "),
            ("RATE_PER_KM", "7.5"),
            ("SIMULATE_POSITIONS", "false"),
            ("COMPLETION_GRACE_MS", "500"),
        ])
        .unwrap();

        assert_eq!(config.redis_url.as_deref(), Some("redis://127.0.0.1/"));
        assert!(config.google_maps_api_key.is_none());
        assert_eq!(config.estimator_settings().rate_per_km, 7.5);

        let settings = config.dispatch_settings();
        assert!(!settings.simulate_positions);
        assert_eq!(settings.completion_grace, Duration::from_millis(500));
    }

    #[test]
    fn test_unreadable_values_are_rejected() {
        let err = config_from(&[("SIMULATION_TICK_MS", "fast")]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidConfiguration(_)));

        let err = config_from(&[("RATE_PER_KM", "-1")]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidConfiguration(_)));

        let err = config_from(&[("PROVIDER_MAX_ATTEMPTS", "0")]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidConfiguration(_)));
    }
}
