//! HTTP/JSON front-end for the chroma controller.
//!
//! A thin axum wrapper over the same control-core handles the command
//! link uses. Program uploads arrive as a JSON step list, are converted
//! to binary steps, and persisted so they survive a restart. Every step
//! from this path is time-terminated: volume is always stored as `+∞`.

use std::sync::Arc;

use axum::extract::{Form, Json, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use chroma_common::program::{Program, ProgramStep};
use chroma_common::consts::PORT_KEEP_CURRENT;
use chroma_common::storage::{save_program, StoragePaths};
use chroma_control::{DeviceHandle, ExecutorHandle, PumpCommand};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Shared state for all HTTP handlers.
#[derive(Clone)]
pub struct AppState {
    pub device: DeviceHandle,
    pub executor: ExecutorHandle,
    pub program: Arc<RwLock<Program>>,
    pub storage: Arc<StoragePaths>,
}

/// One program step as the browser UI sees it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepJson {
    #[serde(rename = "type")]
    pub step_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reagent: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pump_speed: Option<f32>,
    pub duration_ms: u64,
}

/// Convert a JSON step to its binary form.
///
/// A `wait` encodes as both ports "keep current" with zero flow; a
/// `flush` keeps the operator's ports. Unknown types yield `None` and
/// are skipped, matching the tolerant upload behaviour of the UI.
pub fn step_from_json(step: &StepJson) -> Option<ProgramStep> {
    let duration_s = step.duration_ms as f32 / 1000.0;
    match step.step_type.as_str() {
        "flush" => Some(ProgramStep::flush(
            step.reagent?,
            step.column?,
            step.pump_speed?,
            duration_s,
        )),
        "wait" => Some(ProgramStep::wait(duration_s)),
        _ => None,
    }
}

/// Convert a binary step back to its JSON form.
pub fn step_to_json(step: &ProgramStep) -> StepJson {
    let duration_ms = (step.duration * 1000.0) as u64;
    if step.flow_rate == 0.0 && step.reagent_port == PORT_KEEP_CURRENT {
        StepJson {
            step_type: "wait".to_string(),
            reagent: None,
            column: None,
            pump_speed: None,
            duration_ms,
        }
    } else {
        StepJson {
            step_type: "flush".to_string(),
            reagent: Some(step.reagent_port),
            column: Some(step.column_port),
            pump_speed: Some(step.flow_rate),
            duration_ms,
        }
    }
}

/// Build the API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(get_status))
        .route("/api/manual/valves", post(set_valves))
        .route("/api/manual/pump", post(set_pump))
        .route("/api/program/upload", post(upload_program))
        .route("/api/program/run", post(run_program))
        .route("/api/program/stop", post(stop_program))
        .route("/api/program/get", get(get_program))
        .with_state(state)
}

/// Bind and serve until the process exits.
pub async fn serve(bind_addr: &str, state: AppState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    info!(addr = bind_addr, "HTTP server listening");
    axum::serve(listener, router(state)).await
}

async fn get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.device.state())
}

#[derive(Debug, Deserialize)]
struct ValveForm {
    reagent_valve_id: u8,
    column_valve_id: u8,
}

async fn set_valves(
    State(state): State<AppState>,
    Form(form): Form<ValveForm>,
) -> impl IntoResponse {
    state
        .device
        .set_valves(form.reagent_valve_id, form.column_valve_id);
    "OK: Valve position set."
}

#[derive(Debug, Deserialize)]
struct PumpForm {
    pump_cmd: f32,
    acceleration: f32,
}

async fn set_pump(
    State(state): State<AppState>,
    Form(form): Form<PumpForm>,
) -> impl IntoResponse {
    state.device.set_pump(PumpCommand {
        flow_rate: form.pump_cmd,
        acceleration: form.acceleration,
    });
    "OK: Pump command sent."
}

async fn upload_program(
    State(state): State<AppState>,
    Json(steps): Json<Vec<StepJson>>,
) -> impl IntoResponse {
    let mut program = state.program.write();
    program.clear();
    let mut skipped = 0usize;
    for step_json in &steps {
        let Some(step) = step_from_json(step_json) else {
            skipped += 1;
            continue;
        };
        let idx = program.len();
        if program.write_at(idx, step).is_err() {
            warn!("uploaded program exceeds capacity; truncating");
            break;
        }
    }
    if skipped > 0 {
        warn!(skipped, "upload contained unrecognized step types");
    }
    info!(steps = program.len(), "program uploaded");

    if let Err(e) = save_program(&state.storage.program, &program) {
        warn!("failed to persist uploaded program: {e}");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Program loaded but not persisted",
        );
    }
    (StatusCode::OK, "Program uploaded and saved successfully")
}

async fn run_program(State(state): State<AppState>) -> impl IntoResponse {
    state.executor.start();
    "Program started"
}

async fn stop_program(State(state): State<AppState>) -> impl IntoResponse {
    state.executor.abort();
    "Program stopped"
}

async fn get_program(State(state): State<AppState>) -> impl IntoResponse {
    let program = state.program.read();
    let steps: Vec<StepJson> = program.iter().map(step_to_json).collect();
    Json(steps)
}
