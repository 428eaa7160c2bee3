use std::path::PathBuf;

use anyhow::Context;
use chrono_tz::Tz;
use tracing::warn;

use heating_common::RuntimeConfig;

use crate::clock::parse_timezone;

pub const ENV_CONFIG: &str = "HEATING_CONFIG";
pub const ENV_PERSISTENCE_FILE: &str = "HEATING_PERSISTENCE_FILE";
pub const ENV_HTTP_PORT: &str = "HEATING_HTTP_PORT";
pub const ENV_CHECK_INTERVAL: &str = "HEATING_CHECK_INTERVAL_SECS";
pub const ENV_TIMEZONE: &str = "HEATING_TIMEZONE";
pub const ENV_RUN_LOOP: &str = "HEATING_RUN_LOOP";

const DEFAULT_PERSISTENCE_FILE: &str = "./persistence.json";
const DEFAULT_HTTP_PORT: u16 = 8080;

#[derive(Debug, Clone)]
pub struct Settings {
    pub runtime: RuntimeConfig,
    pub persistence_file: PathBuf,
    pub http_port: u16,
    pub timezone: Tz,
}

impl Settings {
    /// Config file named by `HEATING_CONFIG` (if any), then environment
    /// overrides.
    pub async fn load() -> anyhow::Result<Self> {
        let file = match std::env::var(ENV_CONFIG) {
            Ok(path) => Some(
                tokio::fs::read_to_string(&path)
                    .await
                    .with_context(|| format!("failed to read config file {path}"))?,
            ),
            Err(_) => None,
        };
        Ok(Self::from_sources(file.as_deref(), |key| {
            std::env::var(key).ok()
        }))
    }

    pub fn from_sources(file: Option<&str>, env: impl Fn(&str) -> Option<String>) -> Self {
        let mut runtime = file
            .map(|text| {
                serde_json::from_str::<RuntimeConfig>(text).unwrap_or_else(|err| {
                    warn!("invalid config file, using defaults: {err}");
                    RuntimeConfig::default()
                })
            })
            .unwrap_or_default();

        if let Some(secs) = parsed(&env, ENV_CHECK_INTERVAL) {
            runtime.supervisor.check_interval_secs = secs;
        }
        if let Some(timezone) = env(ENV_TIMEZONE) {
            runtime.timezone = timezone;
        }
        if let Some(run) = env(ENV_RUN_LOOP).and_then(|value| parse_flag(&value)) {
            runtime.run_loop_on_startup = run;
        }
        runtime.sanitize();

        let timezone = parse_timezone(&runtime.timezone).unwrap_or_else(|| {
            warn!(timezone = %runtime.timezone, "unknown timezone, falling back to UTC");
            chrono_tz::UTC
        });

        Self {
            persistence_file: env(ENV_PERSISTENCE_FILE)
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_PERSISTENCE_FILE)),
            http_port: parsed(&env, ENV_HTTP_PORT).unwrap_or(DEFAULT_HTTP_PORT),
            runtime,
            timezone,
        }
    }
}

fn parsed<T: std::str::FromStr>(env: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    env(key).and_then(|value| value.trim().parse().ok())
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_without_sources() {
        let settings = Settings::from_sources(None, env(&[]));

        assert_eq!(settings.persistence_file, PathBuf::from("./persistence.json"));
        assert_eq!(settings.http_port, 8080);
        assert_eq!(settings.timezone, chrono_tz::Europe::London);
        assert!(settings.runtime.run_loop_on_startup);
    }

    #[test]
    fn environment_overrides_file() {
        let settings = Settings::from_sources(
            Some(r#"{"timezone": "Europe/Paris", "supervisor": {"check_interval_secs": 30}}"#),
            env(&[
                (ENV_CHECK_INTERVAL, "15"),
                (ENV_RUN_LOOP, "false"),
                (ENV_HTTP_PORT, "9090"),
            ]),
        );

        assert_eq!(settings.runtime.supervisor.check_interval_secs, 15);
        assert_eq!(settings.timezone, chrono_tz::Europe::Paris);
        assert!(!settings.runtime.run_loop_on_startup);
        assert_eq!(settings.http_port, 9090);
    }

    #[test]
    fn bad_timezone_falls_back_to_utc() {
        let settings = Settings::from_sources(None, env(&[(ENV_TIMEZONE, "Nowhere/Special")]));
        assert_eq!(settings.timezone, chrono_tz::UTC);
    }
}
