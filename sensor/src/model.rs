use std::time::Duration;

use serde::{Deserialize, Serialize};

/// First-order room model: heat is added at a fixed rate while the heater
/// is energized, and the room relaxes towards ambient otherwise.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalModel {
    pub ambient: f64,
    /// Degrees gained per minute with the heater on.
    pub heat_rate: f64,
    /// Fraction of the gap to ambient lost per minute.
    pub loss_rate: f64,
}

impl Default for ThermalModel {
    fn default() -> Self {
        Self {
            ambient: 8.0,
            heat_rate: 0.15,
            loss_rate: 0.01,
        }
    }
}

impl ThermalModel {
    /// A room whose temperature never moves.
    pub fn frozen() -> Self {
        Self {
            ambient: 0.0,
            heat_rate: 0.0,
            loss_rate: 0.0,
        }
    }

    pub fn step(&self, temperature: f64, heating: bool, elapsed: Duration) -> f64 {
        let minutes = elapsed.as_secs_f64() / 60.0;
        let loss = (temperature - self.ambient) * (1.0 - (-self.loss_rate * minutes).exp());
        let gain = if heating { self.heat_rate * minutes } else { 0.0 };
        temperature - loss + gain
    }
}
