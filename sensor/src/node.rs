use std::{collections::HashMap, sync::Arc};

use tokio::{sync::Mutex, time::Instant};

use heating_common::node::round_tenth;

use crate::model::ThermalModel;

/// Pin level of a released relay. The boards are wired active-low.
pub const LEVEL_RELEASED: u8 = 1;
pub const LEVEL_ENERGIZED: u8 = 0;

#[derive(Debug, Clone)]
pub struct SimConfig {
    pub start_temperature: f64,
    pub heater_pin: u8,
    pub model: ThermalModel,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            start_temperature: 16.0,
            heater_pin: 1,
            model: ThermalModel::default(),
        }
    }
}

#[derive(Debug)]
struct SimInner {
    config: SimConfig,
    temperature: f64,
    last_step: Instant,
    pins: HashMap<u8, u8>,
    sensor_failing: bool,
}

impl SimInner {
    fn level(&self, pin: u8) -> u8 {
        self.pins.get(&pin).copied().unwrap_or(LEVEL_RELEASED)
    }

    fn advance(&mut self) {
        let now = Instant::now();
        let heating = self.level(self.config.heater_pin) == LEVEL_ENERGIZED;
        self.temperature = self
            .config
            .model
            .step(self.temperature, heating, now - self.last_step);
        self.last_step = now;
    }
}

/// One simulated board carrying a temperature sensor and a bank of relay
/// pins, one of which drives the room heater.
#[derive(Debug, Clone)]
pub struct SimNode {
    inner: Arc<Mutex<SimInner>>,
}

impl SimNode {
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimInner {
                temperature: config.start_temperature,
                config,
                last_step: Instant::now(),
                pins: HashMap::new(),
                sensor_failing: false,
            })),
        }
    }

    /// A node whose room stays at `temperature` whatever the relays do.
    pub fn fixed(temperature: f64) -> Self {
        Self::new(SimConfig {
            start_temperature: temperature,
            model: ThermalModel::frozen(),
            ..SimConfig::default()
        })
    }

    /// `None` while the sensor is set to fail.
    pub async fn read_temperature(&self) -> Option<f64> {
        let mut inner = self.inner.lock().await;
        if inner.sensor_failing {
            return None;
        }
        inner.advance();
        Some(round_tenth(inner.temperature))
    }

    pub async fn set_temperature(&self, temperature: f64) {
        let mut inner = self.inner.lock().await;
        inner.advance();
        inner.temperature = temperature;
    }

    pub async fn set_sensor_failing(&self, failing: bool) {
        self.inner.lock().await.sensor_failing = failing;
    }

    pub async fn set_pin(&self, pin: u8, level: u8) {
        let mut inner = self.inner.lock().await;
        // Settle the room under the old heater state first.
        inner.advance();
        inner.pins.insert(pin, level);
    }

    pub async fn pin_level(&self, pin: u8) -> u8 {
        self.inner.lock().await.level(pin)
    }

    pub async fn heater_on(&self) -> bool {
        let inner = self.inner.lock().await;
        inner.level(inner.config.heater_pin) == LEVEL_ENERGIZED
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn pins_default_to_released() {
        let node = SimNode::fixed(18.0);
        assert_eq!(node.pin_level(3).await, LEVEL_RELEASED);
        assert!(!node.heater_on().await);

        node.set_pin(1, LEVEL_ENERGIZED).await;
        assert!(node.heater_on().await);
    }

    #[tokio::test]
    async fn failing_sensor_has_no_reading() {
        let node = SimNode::fixed(18.0);
        node.set_sensor_failing(true).await;
        assert_eq!(node.read_temperature().await, None);

        node.set_sensor_failing(false).await;
        assert_eq!(node.read_temperature().await, Some(18.0));
    }

    #[tokio::test(start_paused = true)]
    async fn energized_heater_warms_the_room() {
        let node = SimNode::new(SimConfig::default());
        node.set_pin(1, LEVEL_ENERGIZED).await;

        tokio::time::advance(Duration::from_secs(1_800)).await;

        let temperature = node.read_temperature().await.unwrap();
        assert!(temperature > 16.0, "{temperature}");
    }
}
