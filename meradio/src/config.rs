//! Session configuration.
//!
//! Values come from [Config::default], optionally overlaid by a TOML file, then by `MERADIO_*` environment
//! variables. Everything is fixed once the session starts.
use std::{collections::BTreeMap, fs, path::Path, time::Duration};

use serde_derive::*;
use tracing::warn;

use crate::{
    error::{Error, Result},
    geo::Position,
    retry::RetryPolicy,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The WebSocket endpoint of the chat server.
    pub endpoint: String,
    /// Messages and peers farther away than this are not shown.
    pub radius_m: f64,
    /// Period of the location heartbeat.
    pub heartbeat_interval_ms: u64,
    pub retry: RetryConfig,
    /// Used whenever the location source fails.
    pub default_position: Position,
    /// Named coordinates that can replace live tracking.
    pub presets: BTreeMap<String, Position>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            endpoint: "ws://localhost:8000/ws".into(),
            radius_m: 1000.0,
            heartbeat_interval_ms: 10_000,
            retry: RetryConfig::default(),
            default_position: Position::new(-31.3740, -64.2852),
            presets: BTreeMap::from([
                ("rafael".to_string(), Position::new(-31.3718834, -64.2331584)),
                ("kiosko".to_string(), Position::new(-31.3684186, -64.238123)),
                ("q2".to_string(), Position::new(-31.270729, -64.4587293)),
            ]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
        }
    }
}

impl Config {
    /// Loads `path` (if given) and applies environment overrides, then validates the result.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|source| Error::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| Error::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from `lookup`. Values that fail to parse are logged and ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let var = |key: &str| {
            lookup(key)
                .map(|raw| raw.trim().to_string())
                .filter(|raw| !raw.is_empty())
        };

        if let Some(endpoint) = var("MERADIO_WS_URL") {
            self.endpoint = endpoint;
        }
        override_parsed(&var, "MERADIO_CHAT_RADIUS", &mut self.radius_m);
        override_parsed(&var, "MERADIO_LOCATION_UPDATE_INTERVAL_MS", &mut self.heartbeat_interval_ms);
        override_parsed(&var, "MERADIO_RETRY_BASE_DELAY_MS", &mut self.retry.base_delay_ms);
        override_parsed(&var, "MERADIO_RETRY_MAX_DELAY_MS", &mut self.retry.max_delay_ms);
        override_parsed(&var, "MERADIO_MAX_RECONNECT_ATTEMPTS", &mut self.retry.max_attempts);
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.trim().is_empty() {
            return Err(Error::InvalidConfig("endpoint must not be empty".into()));
        }
        if !self.radius_m.is_finite() || self.radius_m <= 0.0 {
            return Err(Error::InvalidConfig(format!(
                "radius_m must be a positive number, got {}",
                self.radius_m
            )));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(Error::InvalidConfig("heartbeat_interval_ms must be positive".into()));
        }
        if self.retry.base_delay_ms == 0 {
            return Err(Error::InvalidConfig("retry.base_delay_ms must be positive".into()));
        }
        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(Error::InvalidConfig(
                "retry.max_delay_ms must not be below retry.base_delay_ms".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            base_delay: Duration::from_millis(self.retry.base_delay_ms),
            max_delay: Duration::from_millis(self.retry.max_delay_ms),
            max_attempts: self.retry.max_attempts,
        }
    }

    pub fn preset(&self, name: &str) -> Result<Position> {
        self.presets
            .get(name)
            .copied()
            .ok_or_else(|| Error::UnknownPreset(name.to_string()))
    }
}

fn override_parsed<T>(var: &impl Fn(&str) -> Option<String>, key: &str, target: &mut T)
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    let Some(raw) = var(key) else {
        return;
    };
    match raw.parse() {
        Ok(value) => *target = value,
        Err(err) => warn!("invalid {key}, ignoring: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let config = Config::default();
        assert_eq!(config.radius_m, 1000.0);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(10));
        assert_eq!(config.retry_policy(), RetryPolicy::default());
        assert_eq!(config.preset("kiosko").unwrap(), Position::new(-31.3684186, -64.238123));
        config.validate().unwrap();
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            endpoint = "ws://chat.example:9000/ws"
            radius_m = 250.0

            [retry]
            max_attempts = 3

            [presets]
            plaza = { lat = -31.4167, lon = -64.1833 }
            "#,
        )
        .unwrap();
        assert_eq!(config.endpoint, "ws://chat.example:9000/ws");
        assert_eq!(config.radius_m, 250.0);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.base_delay_ms, 1_000);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
        assert_eq!(config.presets.len(), 1);
        assert!(matches!(config.preset("kiosko"), Err(Error::UnknownPreset(_))));
    }

    #[test]
    fn overrides_apply_and_bad_values_are_ignored() {
        let mut config = Config::default();
        config.apply_overrides(lookup(&[
            ("MERADIO_WS_URL", " ws://10.0.0.2:8000/ws "),
            ("MERADIO_CHAT_RADIUS", "not-a-number"),
            ("MERADIO_MAX_RECONNECT_ATTEMPTS", "7"),
            ("MERADIO_LOCATION_UPDATE_INTERVAL_MS", ""),
        ]));
        assert_eq!(config.endpoint, "ws://10.0.0.2:8000/ws");
        assert_eq!(config.radius_m, 1000.0);
        assert_eq!(config.retry.max_attempts, 7);
        assert_eq!(config.heartbeat_interval_ms, 10_000);
    }

    #[test]
    fn validation_rejects_nonsense() {
        let invalid = [
            Config {
                radius_m: 0.0,
                ..Config::default()
            },
            Config {
                radius_m: f64::NAN,
                ..Config::default()
            },
            Config {
                heartbeat_interval_ms: 0,
                ..Config::default()
            },
            Config {
                endpoint: " ".into(),
                ..Config::default()
            },
            Config {
                retry: RetryConfig {
                    base_delay_ms: 5_000,
                    max_delay_ms: 1_000,
                    max_attempts: 5,
                },
                ..Config::default()
            },
        ];
        for config in invalid {
            assert!(matches!(config.validate(), Err(Error::InvalidConfig(_))), "{config:?}");
        }
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = Config::load(Some(Path::new("/nonexistent/meradio.toml"))).unwrap_err();
        assert!(matches!(err, Error::ConfigRead { .. }));
    }
}
