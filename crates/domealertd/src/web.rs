use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::net::TcpListener;
use tracing::{error, info};

use crate::config::{Config, DigitalSensor, OneWireSensor, SwitchSensor};
use crate::export::Exporter;
use crate::state::Export;

// ---------------------------------------------------------------------------
// Shared handler state
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct AppState {
    exporter: Exporter,
    sensors: Arc<SensorsResponse>,
}

impl AppState {
    pub fn new(exporter: Exporter, config: &Config) -> Self {
        Self {
            exporter,
            sensors: Arc::new(SensorsResponse {
                name: config.name.clone(),
                digital: config.digital.clone(),
                onewire: config.onewire.clone(),
                switches: config.switches.clone(),
            }),
        }
    }
}

#[derive(Serialize)]
struct MeasurementsResponse {
    #[serde(with = "time::serde::rfc3339")]
    date: OffsetDateTime,
    measurements: Export,
}

/// Descriptor metadata for display clients.
#[derive(Clone, Serialize)]
struct SensorsResponse {
    name: String,
    digital: Vec<DigitalSensor>,
    onewire: Vec<OneWireSensor>,
    switches: Vec<SwitchSensor>,
}

#[derive(Deserialize)]
struct RelayRequest {
    enabled: bool,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/measurements", get(api_measurements))
        .route("/api/sensors", get(api_sensors))
        .route("/api/relay", post(api_relay))
        .with_state(state)
}

async fn api_measurements(State(state): State<AppState>) -> impl IntoResponse {
    Json(MeasurementsResponse {
        date: OffsetDateTime::now_utc(),
        measurements: state.exporter.export().await,
    })
}

async fn api_sensors(State(state): State<AppState>) -> impl IntoResponse {
    Json(SensorsResponse::clone(&state.sensors))
}

async fn api_relay(State(state): State<AppState>, Json(req): Json<RelayRequest>) -> Response {
    let Some(switches) = state.exporter.switches() else {
        return (StatusCode::NOT_FOUND, "no switch bank configured").into_response();
    };
    match switches.set_relay(req.enabled).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            error!("relay write failed: {e}");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    info!("export api listening on http://{addr}");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================
