use crate::db;
use crate::grading::{GradeCalculator, GradingConfig};
use crate::ipc::error::{respond, HandlerError, HandlerResult};
use crate::ipc::helpers::required_str;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::path::PathBuf;
use tracing::info;

fn grading_json(grading: &GradeCalculator) -> serde_json::Value {
    let cfg = grading.config();
    json!({
        "subjectMaxScores": cfg.subject_max_scores,
        "thresholds": cfg.thresholds,
        "totalMaxScore": grading.total_max_score(),
    })
}

fn handle_health(state: &mut AppState, _req: &Request) -> HandlerResult {
    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "workspacePath": state.workspace.as_ref().map(|p| p.to_string_lossy().to_string())
    }))
}

/// Opens the workspace database and loads its grading table. A bad grading
/// table fails the selection and leaves the previous state untouched.
fn handle_workspace_select(state: &mut AppState, req: &Request) -> HandlerResult {
    let path = PathBuf::from(required_str(req, "path")?);

    let cfg = GradingConfig::load_from_workspace(&path)
        .map_err(|e| HandlerError::ConfigInvalid(format!("{e:#}")))?;
    let grading = GradeCalculator::new(cfg).map_err(|e| {
        HandlerError::ConfigInvalid(format!("{}: {}", GradingConfig::FILE_NAME, e))
    })?;
    let conn = db::open_db(&path).map_err(|e| HandlerError::DbOpen(format!("{e:#}")))?;

    info!(
        workspace = %path.display(),
        total_max_score = grading.total_max_score(),
        "workspace selected"
    );
    state.workspace = Some(path.clone());
    state.db = Some(conn);
    state.grading = grading;
    Ok(json!({
        "workspacePath": path.to_string_lossy(),
        "grading": grading_json(&state.grading),
    }))
}

fn handle_grading_config(state: &mut AppState, _req: &Request) -> HandlerResult {
    Ok(grading_json(&state.grading))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "health" => handle_health(state, req),
        "workspace.select" => handle_workspace_select(state, req),
        "grading.config" => handle_grading_config(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
