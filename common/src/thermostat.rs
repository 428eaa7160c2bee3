use chrono::{DateTime, FixedOffset, Utc};
use thiserror::Error;

use crate::{config::ThermostatConfig, zone::Zone};

/// Live readings for one zone. Either may be missing when its node could not
/// be read; a rule that needs a missing value refuses to decide.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Readings {
    pub temperature: Option<f64>,
    pub relay_on: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecisionError {
    #[error("temperature reading unavailable")]
    MissingTemperature,
    #[error("relay state unavailable")]
    MissingRelayState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rule {
    Boost,
    Advance,
    ProgramDisabled,
    Schedule,
}

/// Evaluation order; the first rule that yields a decision wins.
pub const RULES: [Rule; 4] = [
    Rule::Boost,
    Rule::Advance,
    Rule::ProgramDisabled,
    Rule::Schedule,
];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Decision {
    pub heat: bool,
    pub rule: Rule,
    pub target: f64,
}

impl Rule {
    pub fn name(self) -> &'static str {
        match self {
            Self::Boost => "boost",
            Self::Advance => "advance",
            Self::ProgramDisabled => "program_disabled",
            Self::Schedule => "schedule",
        }
    }

    /// `Ok(None)` means the rule does not apply and evaluation moves on.
    pub fn evaluate(
        self,
        zone: &Zone,
        readings: Readings,
        now: DateTime<FixedOffset>,
        config: &ThermostatConfig,
    ) -> Result<Option<Decision>, DecisionError> {
        let now_utc = now.with_timezone(&Utc);
        match self {
            Self::Boost => {
                if !zone.boost_active(now_utc) {
                    return Ok(None);
                }
                let target = config.boost_ceiling;
                let temperature = require_temperature(readings)?;
                Ok((temperature < target).then_some(Decision {
                    heat: true,
                    rule: self,
                    target,
                }))
            }
            Self::Advance => {
                if !zone.advance_active(now_utc) {
                    return Ok(None);
                }
                let target = zone.schedule().next_target(now, config.room_temperature);
                let temperature = require_temperature(readings)?;
                Ok((temperature < target).then_some(Decision {
                    heat: true,
                    rule: self,
                    target,
                }))
            }
            Self::ProgramDisabled => Ok((!zone.program()).then_some(Decision {
                heat: false,
                rule: self,
                target: config.minimum_target,
            })),
            Self::Schedule => {
                let target = scheduled_target(zone, now, config);
                let temperature = require_temperature(readings)?;
                let relay_on = readings.relay_on.ok_or(DecisionError::MissingRelayState)?;
                Ok(Some(Decision {
                    heat: hysteresis(temperature, relay_on, target, config.threshold),
                    rule: self,
                    target,
                }))
            }
        }
    }
}

/// Decides whether the zone should be heating.
///
/// Expired overrides are not cleared here; callers run
/// [`Zone::expire_overrides`] first so the decision itself stays pure.
pub fn decide(
    zone: &Zone,
    readings: Readings,
    now: DateTime<FixedOffset>,
    config: &ThermostatConfig,
) -> Result<Decision, DecisionError> {
    for rule in RULES {
        if let Some(decision) = rule.evaluate(zone, readings, now, config)? {
            return Ok(decision);
        }
    }

    // The schedule rule always decides.
    Ok(Decision {
        heat: false,
        rule: Rule::Schedule,
        target: config.minimum_target,
    })
}

/// Turns off at the target and back on only below the deadband; anything in
/// between keeps the relay where it is.
pub fn hysteresis(temperature: f64, relay_on: bool, target: f64, threshold: f64) -> bool {
    if relay_on {
        temperature < target
    } else {
        temperature <= target - threshold
    }
}

pub fn scheduled_target(zone: &Zone, now: DateTime<FixedOffset>, config: &ThermostatConfig) -> f64 {
    zone.schedule().current_target(now, config.minimum_target)
}

fn require_temperature(readings: Readings) -> Result<f64, DecisionError> {
    readings.temperature.ok_or(DecisionError::MissingTemperature)
}
