use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, FixedOffset, Utc};

use crate::{
    cache::{Lookup, TtlCache},
    config::{BreakerConfig, ThermostatConfig},
    error::ValidationError,
    node::{RelayNode, SensorNode},
    record::{epoch_seconds, ZoneRecord},
    schedule::{Period, Schedule},
    thermostat,
    types::{ZoneId, ZoneStatus},
};

/// Circuit breaker state for the zone's sensor.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct BreakerState {
    pub error_count: u32,
    pub disabled: bool,
    pub disabled_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Admission {
    Active,
    /// Cooldown elapsed; the breaker was reset and the zone is retried.
    Readmitted,
    CoolingDown { remaining: Duration },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureOutcome {
    Counted { error_count: u32 },
    Tripped { error_count: u32 },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExpiredOverrides {
    pub boost: bool,
    pub advance: bool,
}

impl ExpiredOverrides {
    pub fn any(&self) -> bool {
        self.boost || self.advance
    }
}

/// One heating circuit. Every tracked mutation goes through a method that
/// marks the zone dirty; the owner flushes it with a store save.
#[derive(Debug, Clone, PartialEq)]
pub struct Zone {
    id: ZoneId,
    sensor: SensorNode,
    relay: RelayNode,
    schedule: Schedule,
    program: bool,
    advance: Option<DateTime<Utc>>,
    boost: Option<DateTime<Utc>>,
    breaker: BreakerState,
    temperature: TtlCache<f64>,
    dirty: bool,
}

impl Zone {
    pub fn new(id: ZoneId, sensor: SensorNode, relay: RelayNode) -> Result<Self, ValidationError> {
        if id.as_str().trim().is_empty() {
            return Err(ValidationError::EmptyField { field: "system_id" });
        }
        sensor.validate()?;
        relay.validate()?;

        Ok(Self {
            id,
            sensor,
            relay,
            schedule: Schedule::default(),
            program: false,
            advance: None,
            boost: None,
            breaker: BreakerState::default(),
            temperature: TtlCache::new(),
            dirty: false,
        })
    }

    pub fn from_record(record: ZoneRecord) -> Result<Self, ValidationError> {
        let mut zone = Self::new(record.system_id, record.sensor, record.relay)?;
        zone.schedule = Schedule::new(record.periods)?;
        zone.program = record.program;
        zone.advance = record.advance;
        zone.boost = record.boost;
        zone.breaker = BreakerState {
            error_count: record.error_count,
            disabled: record.disabled,
            disabled_at: record.disabled_at,
        };
        if let Some(temperature) = record.temperature {
            if !temperature.is_finite() {
                return Err(ValidationError::InvalidTemperature(temperature));
            }
        }
        zone.temperature = TtlCache::from_parts(record.temperature, record.temperature_expiry);
        Ok(zone)
    }

    pub fn to_record(&self) -> ZoneRecord {
        ZoneRecord {
            system_id: self.id.clone(),
            sensor: self.sensor.clone(),
            relay: self.relay.clone(),
            program: self.program,
            periods: self.schedule.periods().to_vec(),
            advance: self.advance,
            boost: self.boost,
            disabled: self.breaker.disabled,
            disabled_at: self.breaker.disabled_at,
            error_count: self.breaker.error_count,
            temperature: self.temperature.value().copied(),
            temperature_expiry: self.temperature.expiry(),
        }
    }

    pub fn id(&self) -> &ZoneId {
        &self.id
    }

    pub fn sensor(&self) -> &SensorNode {
        &self.sensor
    }

    pub fn relay(&self) -> &RelayNode {
        &self.relay
    }

    pub fn schedule(&self) -> &Schedule {
        &self.schedule
    }

    pub fn program(&self) -> bool {
        self.program
    }

    pub fn advance(&self) -> Option<DateTime<Utc>> {
        self.advance
    }

    pub fn boost(&self) -> Option<DateTime<Utc>> {
        self.boost
    }

    pub fn breaker(&self) -> BreakerState {
        self.breaker
    }

    pub fn cached_temperature(&self) -> &TtlCache<f64> {
        &self.temperature
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    pub fn set_sensor(&mut self, sensor: SensorNode) -> Result<bool, ValidationError> {
        sensor.validate()?;
        Ok(self.track(|zone| replace(&mut zone.sensor, sensor)))
    }

    pub fn set_relay(&mut self, relay: RelayNode) -> Result<bool, ValidationError> {
        relay.validate()?;
        Ok(self.track(|zone| replace(&mut zone.relay, relay)))
    }

    pub fn set_program(&mut self, enabled: bool) -> bool {
        self.track(|zone| replace(&mut zone.program, enabled))
    }

    pub fn set_advance(&mut self, until: Option<DateTime<Utc>>) -> bool {
        self.track(|zone| replace(&mut zone.advance, until))
    }

    pub fn set_boost(&mut self, until: Option<DateTime<Utc>>) -> bool {
        self.track(|zone| replace(&mut zone.boost, until))
    }

    pub fn add_period(&mut self, period: Period) -> Result<bool, ValidationError> {
        let changed = self.schedule.add_period(period)?;
        self.dirty |= changed;
        Ok(changed)
    }

    pub fn replace_periods(&mut self, periods: Vec<Period>) -> Result<bool, ValidationError> {
        let schedule = Schedule::new(periods)?;
        Ok(self.track(|zone| replace(&mut zone.schedule, schedule)))
    }

    pub fn remove_period(&mut self, id: &str) -> bool {
        self.track(|zone| zone.schedule.remove_period(id))
    }

    pub fn boost_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.boost, Some(until) if until > now)
    }

    pub fn advance_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.advance, Some(until) if until > now)
    }

    /// Clears overrides whose deadline has passed. Each clears exactly once.
    pub fn expire_overrides(&mut self, now: DateTime<Utc>) -> ExpiredOverrides {
        let mut expired = ExpiredOverrides::default();
        if matches!(self.boost, Some(until) if until <= now) {
            self.boost = None;
            expired.boost = true;
        }
        if matches!(self.advance, Some(until) if until <= now) {
            self.advance = None;
            expired.advance = true;
        }
        self.dirty |= expired.any();
        expired
    }

    /// Applies what a control tick owns to the stored copy of the zone: the
    /// temperature cache, the breaker and override expiry at `now`. Operator
    /// settings made while the tick ran are left alone.
    pub fn merge_tick_state(&mut self, ticked: &Zone, now: DateTime<Utc>) {
        self.expire_overrides(now);
        self.track(|zone| replace(&mut zone.temperature, ticked.temperature.clone()));
        self.track(|zone| replace(&mut zone.breaker, ticked.breaker));
    }

    /// Seeds the cache from a pushed reading, bypassing the next sensor pull.
    pub fn record_pushed_temperature(
        &mut self,
        temperature: f64,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<(), ValidationError> {
        if !temperature.is_finite() {
            return Err(ValidationError::InvalidTemperature(temperature));
        }
        self.temperature.fill(temperature, now, ttl);
        self.dirty = true;
        Ok(())
    }

    /// Reads the temperature through the zone's TTL cache, calling `fetch`
    /// only once the cached reading has expired.
    pub async fn temperature_or_fetch<F, Fut, E>(
        &mut self,
        now: DateTime<Utc>,
        ttl: Duration,
        fetch: F,
    ) -> Result<Lookup<f64>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<f64, E>>,
    {
        let lookup = self.temperature.get_or_fetch(now, ttl, fetch).await?;
        self.dirty |= lookup.is_fresh();
        Ok(lookup)
    }

    pub fn record_sensor_success(&mut self) {
        if self.breaker.error_count != 0 {
            self.breaker.error_count = 0;
            self.dirty = true;
        }
    }

    pub fn record_sensor_failure(
        &mut self,
        now: DateTime<Utc>,
        config: &BreakerConfig,
    ) -> FailureOutcome {
        self.breaker.error_count = self.breaker.error_count.saturating_add(1);
        self.dirty = true;

        let error_count = self.breaker.error_count;
        if error_count >= config.max_errors && !self.breaker.disabled {
            self.breaker.disabled = true;
            self.breaker.disabled_at = Some(now);
            FailureOutcome::Tripped { error_count }
        } else {
            FailureOutcome::Counted { error_count }
        }
    }

    /// Decides whether a disabled zone may run this cycle, resetting the
    /// breaker once the cooldown has elapsed.
    pub fn admission(&mut self, now: DateTime<Utc>, config: &BreakerConfig) -> Admission {
        if !self.breaker.disabled {
            return Admission::Active;
        }

        let cooldown = config.cooldown();
        // Records disabled without a timestamp have served their cooldown.
        let elapsed = match self.breaker.disabled_at {
            Some(at) => (now - at).to_std().unwrap_or(Duration::ZERO),
            None => cooldown,
        };

        if elapsed < cooldown {
            return Admission::CoolingDown {
                remaining: cooldown - elapsed,
            };
        }

        self.breaker = BreakerState::default();
        self.dirty = true;
        Admission::Readmitted
    }

    /// Target shown to operators; mirrors the decision rule order.
    pub fn display_target(&self, now: DateTime<FixedOffset>, config: &ThermostatConfig) -> f64 {
        let now_utc = now.with_timezone(&Utc);
        if self.boost_active(now_utc) {
            config.boost_ceiling
        } else if self.advance_active(now_utc) {
            self.schedule.next_target(now, config.room_temperature)
        } else if !self.program {
            config.minimum_target
        } else {
            thermostat::scheduled_target(self, now, config)
        }
    }

    pub fn status(&self, now: DateTime<FixedOffset>, config: &ThermostatConfig) -> ZoneStatus {
        ZoneStatus {
            system_id: self.id.clone(),
            program: self.program,
            temperature: self.temperature.value().copied(),
            target: self.display_target(now, config),
            is_within_period: self.schedule.current_period(now).is_some(),
            advance: self.advance.map(epoch_seconds::to_f64),
            boost: self.boost.map(epoch_seconds::to_f64),
            disabled: self.breaker.disabled,
            error_count: self.breaker.error_count,
            periods: self.schedule.periods().to_vec(),
        }
    }

    fn track(&mut self, mutate: impl FnOnce(&mut Self) -> bool) -> bool {
        let changed = mutate(self);
        self.dirty |= changed;
        changed
    }
}

fn replace<T: PartialEq>(slot: &mut T, value: T) -> bool {
    if *slot == value {
        false
    } else {
        *slot = value;
        true
    }
}
