use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post, put},
    Json, Router,
};
use chrono::{DateTime, FixedOffset, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use heating_common::{
    record::epoch_seconds, Period, RelayNode, RuntimeConfig, SensorNode, TemperatureReading,
    ValidationError, Zone, ZoneId, ZoneStatus, ROUTE_SUPERVISOR, ROUTE_SUPERVISOR_START,
    ROUTE_SUPERVISOR_STOP, ROUTE_SYSTEM, ROUTE_SYSTEMS, ROUTE_SYSTEM_ADVANCE, ROUTE_SYSTEM_BOOST,
    ROUTE_SYSTEM_PERIOD, ROUTE_SYSTEM_PERIODS, ROUTE_SYSTEM_PROGRAM, ROUTE_SYSTEM_TEMPERATURE,
};

use crate::{
    clock::to_local,
    cycle::CleanupReport,
    store::{StoreError, ZoneStore},
    supervisor::{Supervisor, SupervisorStatus},
};

#[derive(Clone)]
pub struct ApiState {
    pub store: ZoneStore,
    pub supervisor: Arc<Supervisor>,
    pub config: Arc<RuntimeConfig>,
    pub timezone: Tz,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct ProgramUpdate {
    enabled: bool,
}

/// `end_time` in epoch seconds; `null` cancels the override.
#[derive(Debug, Deserialize)]
struct OverrideUpdate {
    end_time: Option<f64>,
}

/// Creates a zone or updates the given parts of an existing one. A new zone
/// needs both `sensor` and `relay`.
#[derive(Debug, Deserialize)]
struct SystemUpdate {
    system_id: ZoneId,
    sensor: Option<SensorNode>,
    relay: Option<RelayNode>,
    program: Option<bool>,
    periods: Option<Vec<Period>>,
}

#[derive(Debug, Serialize)]
struct StopResponse {
    #[serde(flatten)]
    status: SupervisorStatus,
    /// `null` when the relays had already been switched off for this run.
    cleanup: Option<CleanupReport>,
}

pub fn router(state: ApiState) -> Router {
    Router::new()
        .route(
            ROUTE_SYSTEMS,
            get(handle_list_systems).post(handle_configure_system),
        )
        .route(ROUTE_SYSTEM, get(handle_get_system))
        .route(ROUTE_SYSTEM_PROGRAM, put(handle_set_program))
        .route(ROUTE_SYSTEM_ADVANCE, put(handle_set_advance))
        .route(ROUTE_SYSTEM_BOOST, put(handle_set_boost))
        .route(
            ROUTE_SYSTEM_PERIODS,
            post(handle_add_period).put(handle_replace_periods),
        )
        .route(ROUTE_SYSTEM_PERIOD, delete(handle_delete_period))
        .route(ROUTE_SYSTEM_TEMPERATURE, post(handle_push_temperature))
        .route(ROUTE_SUPERVISOR, get(handle_get_supervisor))
        .route(ROUTE_SUPERVISOR_START, post(handle_start_supervisor))
        .route(ROUTE_SUPERVISOR_STOP, post(handle_stop_supervisor))
        .with_state(state)
}

async fn handle_list_systems(State(state): State<ApiState>) -> Response {
    match state.store.load_all().await {
        Ok(loaded) => {
            let now = state.local_now();
            let systems: Vec<ZoneStatus> = loaded
                .zones()
                .map(|zone| zone.status(now, &state.config.thermostat))
                .collect();
            Json(systems).into_response()
        }
        Err(err) => store_failure(err),
    }
}

async fn handle_configure_system(
    State(state): State<ApiState>,
    Json(update): Json<SystemUpdate>,
) -> Response {
    let SystemUpdate {
        system_id,
        sensor,
        relay,
        program,
        periods,
    } = update;

    let create = {
        let id = system_id.clone();
        let sensor = sensor.clone();
        let relay = relay.clone();
        move || -> Result<Zone, ValidationError> {
            let sensor = sensor.ok_or(ValidationError::EmptyField { field: "sensor" })?;
            let relay = relay.ok_or(ValidationError::EmptyField { field: "relay" })?;
            Zone::new(id, sensor, relay)
        }
    };
    let apply = |zone: &mut Zone| -> Result<(), ValidationError> {
        if let Some(sensor) = sensor {
            zone.set_sensor(sensor)?;
        }
        if let Some(relay) = relay {
            zone.set_relay(relay)?;
        }
        if let Some(program) = program {
            zone.set_program(program);
        }
        if let Some(periods) = periods {
            zone.replace_periods(periods)?;
        }
        Ok(())
    };

    match state.store.configure(&system_id, create, apply).await {
        Ok((zone, created)) => {
            let status = if created {
                StatusCode::CREATED
            } else {
                StatusCode::OK
            };
            (status, Json(zone.status(state.local_now(), &state.config.thermostat)))
                .into_response()
        }
        Err(StoreError::Rejected(err)) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
        Err(err) => store_failure(err),
    }
}

async fn handle_get_system(State(state): State<ApiState>, Path(id): Path<String>) -> Response {
    match state.store.get(&ZoneId::new(id)).await {
        Ok(Some(zone)) => state.status_response(&zone),
        Ok(None) => not_found(),
        Err(err) => store_failure(err),
    }
}

async fn handle_set_program(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(update): Json<ProgramUpdate>,
) -> Response {
    state
        .modify(id, |zone| {
            zone.set_program(update.enabled);
            Ok(())
        })
        .await
}

async fn handle_set_advance(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(update): Json<OverrideUpdate>,
) -> Response {
    let until = match override_deadline(&update) {
        Ok(until) => until,
        Err(response) => return response,
    };
    state
        .modify(id, |zone| {
            zone.set_advance(until);
            Ok(())
        })
        .await
}

async fn handle_set_boost(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(update): Json<OverrideUpdate>,
) -> Response {
    let until = match override_deadline(&update) {
        Ok(until) => until,
        Err(response) => return response,
    };
    state
        .modify(id, |zone| {
            zone.set_boost(until);
            Ok(())
        })
        .await
}

async fn handle_add_period(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(period): Json<Period>,
) -> Response {
    state
        .modify(id, |zone| zone.add_period(period).map(|_| ()))
        .await
}

async fn handle_replace_periods(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(periods): Json<Vec<Period>>,
) -> Response {
    state
        .modify(id, |zone| zone.replace_periods(periods).map(|_| ()))
        .await
}

async fn handle_delete_period(
    State(state): State<ApiState>,
    Path((id, period_id)): Path<(String, String)>,
) -> Response {
    let mut found = false;
    let response = state
        .modify(id, |zone| {
            found = zone.remove_period(&period_id);
            Ok(())
        })
        .await;

    if response.status().is_success() && !found {
        return error_response(StatusCode::NOT_FOUND, "Unknown period");
    }
    response
}

async fn handle_push_temperature(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(reading): Json<TemperatureReading>,
) -> Response {
    let ttl = state.config.cache.pushed_temperature_ttl();
    let now = Utc::now();
    let response = state
        .modify(id.clone(), |zone| {
            zone.record_pushed_temperature(reading.temperature, now, ttl)
        })
        .await;

    if response.status().is_success() {
        info!(zone = %id, temperature = reading.temperature, "temperature pushed");
        return StatusCode::NO_CONTENT.into_response();
    }
    response
}

async fn handle_get_supervisor(State(state): State<ApiState>) -> Response {
    Json(state.supervisor.status().await).into_response()
}

async fn handle_start_supervisor(State(state): State<ApiState>) -> Response {
    if !state.supervisor.start().await {
        return error_response(StatusCode::CONFLICT, "Control loop already running");
    }
    info!("control loop started by operator");
    Json(state.supervisor.status().await).into_response()
}

async fn handle_stop_supervisor(State(state): State<ApiState>) -> Response {
    let cleanup = state.supervisor.stop_and_cleanup().await;
    info!(cleaned_up = cleanup.is_some(), "control loop stopped by operator");
    Json(StopResponse {
        status: state.supervisor.status().await,
        cleanup,
    })
    .into_response()
}

impl ApiState {
    fn local_now(&self) -> DateTime<FixedOffset> {
        to_local(Utc::now(), self.timezone)
    }

    fn status_response(&self, zone: &Zone) -> Response {
        Json(zone.status(self.local_now(), &self.config.thermostat)).into_response()
    }

    async fn modify<F>(&self, id: String, update: F) -> Response
    where
        F: FnOnce(&mut Zone) -> Result<(), ValidationError>,
    {
        match self.store.modify(&ZoneId::new(id), update).await {
            Ok(Some(zone)) => self.status_response(&zone),
            Ok(None) => not_found(),
            Err(StoreError::Rejected(err)) => error_response(StatusCode::BAD_REQUEST, &err.to_string()),
            Err(err) => store_failure(err),
        }
    }
}

fn override_deadline(update: &OverrideUpdate) -> Result<Option<DateTime<Utc>>, Response> {
    match update.end_time {
        None => Ok(None),
        Some(secs) => epoch_seconds::from_f64(secs)
            .map(Some)
            .ok_or_else(|| error_response(StatusCode::BAD_REQUEST, "Invalid end_time")),
    }
}

fn not_found() -> Response {
    error_response(StatusCode::NOT_FOUND, "Unknown system")
}

fn store_failure(err: StoreError) -> Response {
    warn!(error = %err, "persistence store request failed");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "Failed to access persistence store")
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}
