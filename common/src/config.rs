use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermostatConfig {
    /// Deadband below target before heating switches on.
    pub threshold: f64,
    /// Target used outside any period and while the program is disabled.
    pub minimum_target: f64,
    /// Next-period target assumed when the schedule is empty.
    pub room_temperature: f64,
    /// Boost never heats past this temperature.
    pub boost_ceiling: f64,
}

impl Default for ThermostatConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            minimum_target: 10.0,
            room_temperature: 22.0,
            boost_ceiling: 26.0,
        }
    }
}

impl ThermostatConfig {
    pub fn sanitize(&mut self) {
        let defaults = Self::default();
        if !self.threshold.is_finite() {
            self.threshold = defaults.threshold;
        }
        if !self.minimum_target.is_finite() {
            self.minimum_target = defaults.minimum_target;
        }
        if !self.room_temperature.is_finite() {
            self.room_temperature = defaults.room_temperature;
        }
        if !self.boost_ceiling.is_finite() {
            self.boost_ceiling = defaults.boost_ceiling;
        }
        self.threshold = self.threshold.clamp(0.1, 3.0);
        self.minimum_target = self.minimum_target.clamp(5.0, 16.0);
        self.room_temperature = self.room_temperature.clamp(15.0, 25.0);
        self.boost_ceiling = self.boost_ceiling.clamp(18.0, 30.0);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive sensor failures before a zone is disabled.
    pub max_errors: u32,
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            max_errors: 5,
            cooldown_secs: 15 * 60,
        }
    }
}

impl BreakerConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub temperature_ttl_secs: u64,
    pub relay_ttl_secs: u64,
    pub pushed_temperature_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            temperature_ttl_secs: 60,
            relay_ttl_secs: 10,
            pushed_temperature_ttl_secs: 120,
        }
    }
}

impl CacheConfig {
    pub fn temperature_ttl(&self) -> Duration {
        Duration::from_secs(self.temperature_ttl_secs)
    }

    pub fn relay_ttl(&self) -> Duration {
        Duration::from_secs(self.relay_ttl_secs)
    }

    pub fn pushed_temperature_ttl(&self) -> Duration {
        Duration::from_secs(self.pushed_temperature_ttl_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    pub check_interval_secs: u64,
    /// Consecutive failed cycles tolerated before the loop gives up.
    pub max_restarts: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            check_interval_secs: 60,
            max_restarts: 3,
        }
    }
}

impl SupervisorConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub thermostat: ThermostatConfig,
    pub breaker: BreakerConfig,
    pub cache: CacheConfig,
    pub supervisor: SupervisorConfig,
    pub request_timeout_ms: u64,
    pub timezone: String,
    pub run_loop_on_startup: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            thermostat: ThermostatConfig::default(),
            breaker: BreakerConfig::default(),
            cache: CacheConfig::default(),
            supervisor: SupervisorConfig::default(),
            request_timeout_ms: 5_000,
            timezone: "Europe/London".to_string(),
            run_loop_on_startup: true,
        }
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.thermostat.sanitize();
        self.breaker.max_errors = self.breaker.max_errors.max(1);
        self.supervisor.check_interval_secs = self.supervisor.check_interval_secs.clamp(1, 3_600);
        self.request_timeout_ms = self.request_timeout_ms.clamp(100, 60_000);
        if self.timezone.trim().is_empty() {
            self.timezone = Self::default().timezone;
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_config_fills_defaults() {
        let config: RuntimeConfig =
            serde_json::from_str(r#"{"thermostat": {"threshold": 1.0}, "timezone": "UTC"}"#)
                .unwrap();

        assert_eq!(config.thermostat.threshold, 1.0);
        assert_eq!(config.thermostat.minimum_target, 10.0);
        assert_eq!(config.breaker.max_errors, 5);
        assert_eq!(config.timezone, "UTC");
    }

    #[test]
    fn sanitize_clamps_out_of_range_values() {
        let mut config = RuntimeConfig {
            request_timeout_ms: 0,
            ..RuntimeConfig::default()
        };
        config.thermostat.threshold = f64::NAN;
        config.breaker.max_errors = 0;
        config.supervisor.check_interval_secs = 0;

        config.sanitize();

        assert_eq!(config.thermostat.threshold, 0.5);
        assert_eq!(config.breaker.max_errors, 1);
        assert_eq!(config.supervisor.check_interval_secs, 1);
        assert_eq!(config.request_timeout_ms, 100);
    }
}
