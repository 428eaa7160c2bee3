use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use heating_common::{
    decide, CommunicationError, DecisionError, FailureOutcome, Readings, RelayNode, Rule,
    RuntimeConfig, Zone, ZoneId,
};

use crate::{
    clock::to_local,
    remote::{NodeClient, RemoteRelay, RemoteSensor},
    store::{LoadedZones, StoreError, ZoneStore},
};

/// A failure of the cycle machinery itself. Per-zone failures never
/// surface here.
#[derive(Debug, Error)]
pub enum CycleError {
    #[error("persistence store unavailable: {0}")]
    Store(#[from] StoreError),

    #[error("control cycle panicked: {0}")]
    Panicked(String),

    #[error("control cycle aborted")]
    Aborted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneOutcome {
    pub zone: ZoneId,
    pub heat: bool,
    /// Rule that decided; `None` when the zone fell back to off.
    pub rule: Option<Rule>,
    pub tripped: bool,
    pub relay_driven: bool,
    pub saved: bool,
}

impl ZoneOutcome {
    pub fn failed_safe(&self) -> bool {
        self.rule.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub zones: Vec<ZoneOutcome>,
    /// Zones held back by their circuit breaker.
    pub skipped: usize,
}

impl CycleReport {
    pub fn outcome(&self, id: &str) -> Option<&ZoneOutcome> {
        self.zones.iter().find(|outcome| outcome.zone.as_str() == id)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub switched_off: usize,
    pub failed: usize,
}

/// One pass over every zone, plus the relay switch-off used for cleanup.
#[async_trait]
pub trait Cycle: Send + Sync {
    async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError>;

    async fn switch_all_off(&self) -> CleanupReport;
}

pub struct ControlCycle {
    store: ZoneStore,
    sensor: RemoteSensor,
    relay: RemoteRelay,
    config: Arc<RuntimeConfig>,
    timezone: Tz,
    /// Every relay seen in a successful load. Cleanup falls back to these
    /// when the store cannot be read.
    known_relays: Mutex<HashMap<ZoneId, RelayNode>>,
}

impl ControlCycle {
    pub fn new(
        store: ZoneStore,
        client: Arc<dyn NodeClient>,
        config: Arc<RuntimeConfig>,
        timezone: Tz,
    ) -> Self {
        Self {
            store,
            sensor: RemoteSensor::new(client.clone()),
            relay: RemoteRelay::new(client, config.cache.relay_ttl()),
            config,
            timezone,
            known_relays: Mutex::new(HashMap::new()),
        }
    }

    pub async fn run_at(
        &self,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<CycleReport, CycleError> {
        if cancel.is_cancelled() {
            return Err(CycleError::Aborted);
        }

        let loaded = tokio::select! {
            () = cancel.cancelled() => return Err(CycleError::Aborted),
            loaded = self.store.load_all() => loaded?,
        };
        self.remember_relays(&loaded).await;

        let zones: Vec<Zone> = loaded.admitted(now, &self.config.breaker).collect();
        let skipped = loaded.len().saturating_sub(zones.len());
        debug!(zones = zones.len(), skipped, "control cycle starting");

        let work = join_all(zones.into_iter().map(|zone| self.process_zone(zone, now)));
        let outcomes = tokio::select! {
            () = cancel.cancelled() => {
                info!("control cycle cancelled; remaining zones retried next tick");
                return Err(CycleError::Aborted);
            }
            outcomes = work => outcomes,
        };

        Ok(CycleReport {
            zones: outcomes,
            skipped,
        })
    }

    async fn process_zone(&self, mut zone: Zone, now: DateTime<Utc>) -> ZoneOutcome {
        let id = zone.id().clone();
        let local = to_local(now, self.timezone);

        let expired = zone.expire_overrides(now);
        if expired.boost {
            info!(zone = %id, "boost expired");
        }
        if expired.advance {
            info!(zone = %id, "advance expired");
        }

        let sensor = zone.sensor().clone();
        let mut tripped = false;
        let (temperature, sensor_error) = match zone
            .temperature_or_fetch(now, self.config.cache.temperature_ttl(), || {
                self.sensor.read(&sensor)
            })
            .await
        {
            Ok(lookup) => {
                if lookup.is_fresh() {
                    zone.record_sensor_success();
                }
                (Some(lookup.into_value()), None)
            }
            Err(err) => {
                warn!(zone = %id, kind = err.kind(), error = %err, "temperature read failed");
                match zone.record_sensor_failure(now, &self.config.breaker) {
                    FailureOutcome::Tripped { error_count } => {
                        tripped = true;
                        warn!(zone = %id, error_count, "too many sensor failures; zone disabled");
                    }
                    FailureOutcome::Counted { error_count } => {
                        debug!(zone = %id, error_count, "sensor failure counted");
                    }
                }
                (None, Some(err))
            }
        };

        let (relay_on, relay_error) = match self.relay.status(&id, zone.relay(), now).await {
            Ok(lookup) => (Some(lookup.into_value()), None),
            Err(err) => {
                warn!(zone = %id, kind = err.kind(), error = %err, "relay status read failed");
                (None, Some(err))
            }
        };

        let readings = Readings {
            temperature,
            relay_on,
        };
        let decision = if tripped {
            None
        } else {
            match decide(&zone, readings, local, &self.config.thermostat) {
                Ok(decision) => Some(decision),
                Err(err) => {
                    let cause = match err {
                        DecisionError::MissingTemperature => sensor_error.as_ref(),
                        DecisionError::MissingRelayState => relay_error.as_ref(),
                    };
                    error!(
                        zone = %id,
                        error = %err,
                        cause = ?cause.map(CommunicationError::to_string),
                        "no decision possible; switching off"
                    );
                    None
                }
            }
        };

        let heat = decision.is_some_and(|decision| decision.heat);
        if let Some(decision) = decision {
            debug!(
                zone = %id,
                heat,
                rule = decision.rule.name(),
                target = decision.target,
                temperature = ?temperature,
                "decision"
            );
        }

        let relay_driven = match self.relay.set(&id, zone.relay(), heat).await {
            Ok(()) => true,
            Err(err) => {
                warn!(zone = %id, heat, kind = err.kind(), error = %err, "failed to drive relay");
                false
            }
        };

        let saved = if zone.is_dirty() {
            self.persist(&zone, now).await
        } else {
            false
        };

        ZoneOutcome {
            zone: id,
            heat,
            rule: decision.map(|decision| decision.rule),
            tripped,
            relay_driven,
            saved,
        }
    }

    /// Writes back only what the tick owns, on top of the stored record, so an
    /// operator change made during the tick survives.
    async fn persist(&self, ticked: &Zone, now: DateTime<Utc>) -> bool {
        let result = self
            .store
            .modify(ticked.id(), |stored| {
                stored.merge_tick_state(ticked, now);
                Ok(())
            })
            .await;

        match result {
            Ok(Some(_)) => true,
            Ok(None) => {
                debug!(zone = %ticked.id(), "zone removed during tick; nothing saved");
                false
            }
            Err(err) => {
                error!(zone = %ticked.id(), error = %err, "failed to persist zone");
                false
            }
        }
    }

    async fn remember_relays(&self, loaded: &LoadedZones) {
        let mut known = self.known_relays.lock().await;
        for record in loaded.relays() {
            known.insert(record.system_id, record.relay);
        }
    }
}

#[async_trait]
impl Cycle for ControlCycle {
    async fn run_once(&self, cancel: &CancellationToken) -> Result<CycleReport, CycleError> {
        self.run_at(Utc::now(), cancel).await
    }

    /// Switches off every relay in the store, disabled and invalid zones
    /// included, plus any relay seen earlier that the store no longer yields.
    async fn switch_all_off(&self) -> CleanupReport {
        match self.store.load_all().await {
            Ok(loaded) => self.remember_relays(&loaded).await,
            Err(err) => {
                warn!(error = %err, "cannot load zones for cleanup; using last known relays");
            }
        }
        let relays: Vec<(ZoneId, RelayNode)> = self
            .known_relays
            .lock()
            .await
            .iter()
            .map(|(id, relay)| (id.clone(), relay.clone()))
            .collect();

        let results = join_all(relays.iter().map(|(id, relay)| async move {
            let result = self.relay.set(id, relay, false).await;
            if let Err(err) = &result {
                warn!(zone = %id, error = %err, "failed to switch relay off during cleanup");
            }
            result.is_ok()
        }))
        .await;

        let switched_off = results.iter().filter(|ok| **ok).count();
        let report = CleanupReport {
            switched_off,
            failed: results.len() - switched_off,
        };
        info!(switched_off = report.switched_off, failed = report.failed, "all relays switched off");
        report
    }
}
