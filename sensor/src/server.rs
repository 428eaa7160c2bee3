use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use serde::Deserialize;
use tracing::debug;

use heating_common::TemperatureReading;

use crate::node::{SimNode, LEVEL_ENERGIZED, LEVEL_RELEASED};

#[derive(Debug, Deserialize)]
struct PinQuery {
    pin: u8,
}

/// Sensor contract on `/` and `/temperature`; relay contract on
/// `/on`, `/off` and `/status`, each taking `?pin=`.
pub fn router(node: SimNode) -> Router {
    Router::new()
        .route("/", get(handle_temperature))
        .route("/temperature", get(handle_temperature))
        .route("/on", get(handle_pin_on))
        .route("/off", get(handle_pin_off))
        .route("/status", get(handle_pin_status))
        .with_state(node)
}

async fn handle_temperature(State(node): State<SimNode>) -> Response {
    match node.read_temperature().await {
        Some(temperature) => Json(TemperatureReading { temperature }).into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "sensor fault").into_response(),
    }
}

// `/on` drives the pin high, which releases an active-low relay.
async fn handle_pin_on(State(node): State<SimNode>, Query(query): Query<PinQuery>) -> Response {
    node.set_pin(query.pin, LEVEL_RELEASED).await;
    debug!(pin = query.pin, level = LEVEL_RELEASED, "pin set");
    StatusCode::OK.into_response()
}

async fn handle_pin_off(State(node): State<SimNode>, Query(query): Query<PinQuery>) -> Response {
    node.set_pin(query.pin, LEVEL_ENERGIZED).await;
    debug!(pin = query.pin, level = LEVEL_ENERGIZED, "pin set");
    StatusCode::OK.into_response()
}

async fn handle_pin_status(State(node): State<SimNode>, Query(query): Query<PinQuery>) -> Response {
    node.pin_level(query.pin).await.to_string().into_response()
}
