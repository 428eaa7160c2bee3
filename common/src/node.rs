use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CommunicationError, ValidationError};

/// Remote temperature sensor endpoint. `GET url` answers
/// `{"temperature": <number>}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorNode {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adjustment: Option<f64>,
}

impl SensorNode {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            adjustment: None,
        }
    }

    pub fn with_adjustment(mut self, adjustment: f64) -> Self {
        self.adjustment = Some(adjustment);
        self
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.url.trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "sensor.url" });
        }
        if matches!(self.adjustment, Some(adj) if !adj.is_finite()) {
            return Err(ValidationError::Malformed(
                "sensor.adjustment must be finite".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies the calibration offset and rounds to one decimal place.
    pub fn calibrate(&self, raw: f64) -> f64 {
        round_tenth(raw + self.adjustment.unwrap_or(0.0))
    }

    pub fn parse_reading(&self, body: &str) -> Result<f64, CommunicationError> {
        let reading: TemperatureReading =
            serde_json::from_str(body).map_err(|err| CommunicationError::Malformed {
                url: self.url.clone(),
                reason: err.to_string(),
            })?;
        Ok(self.calibrate(reading.temperature))
    }
}

/// Remote relay endpoints. Switching is a plain `GET` on `url_on`/`url_off`;
/// `url_status` answers a bare integer where `0` means energized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNode {
    pub url_on: String,
    pub url_off: String,
    pub url_status: String,
}

impl RelayNode {
    pub fn new(
        url_on: impl Into<String>,
        url_off: impl Into<String>,
        url_status: impl Into<String>,
    ) -> Self {
        Self {
            url_on: url_on.into(),
            url_off: url_off.into(),
            url_status: url_status.into(),
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        for (field, url) in [
            ("relay.url_on", &self.url_on),
            ("relay.url_off", &self.url_off),
            ("relay.url_status", &self.url_status),
        ] {
            if url.trim().is_empty() {
                return Err(ValidationError::EmptyField { field });
            }
        }
        Ok(())
    }

    pub fn switch_url(&self, on: bool) -> &str {
        if on {
            &self.url_on
        } else {
            &self.url_off
        }
    }

    /// `relay_on == !int(body)`.
    pub fn parse_status(&self, body: &str) -> Result<bool, CommunicationError> {
        let level = body
            .trim()
            .parse::<i64>()
            .map_err(|err| CommunicationError::Malformed {
                url: self.url_status.clone(),
                reason: format!("expected integer status, got {:?}: {err}", body.trim()),
            })?;
        Ok(level == 0)
    }
}

/// Body shared by the sensor contract and inbound telemetry pushes. Accepts
/// the temperature either as a JSON number or as a numeric string.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemperatureReading {
    #[serde(deserialize_with = "number_or_string")]
    pub temperature: f64,
}

fn number_or_string<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    let value = match Raw::deserialize(deserializer)? {
        Raw::Number(value) => value,
        Raw::Text(text) => text
            .trim()
            .parse::<f64>()
            .map_err(|_| serde::de::Error::custom(format!("not a number: {text:?}")))?,
    };

    if value.is_finite() {
        Ok(value)
    } else {
        Err(serde::de::Error::custom("temperature must be finite"))
    }
}

pub fn round_tenth(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
