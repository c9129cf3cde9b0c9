use crate::calc::{parse_filter, score_summary_report, subject_date_report};
use crate::ipc::error::{respond, HandlerResult};
use crate::ipc::helpers::db_conn;
use crate::ipc::types::{AppState, Request};
use crate::sheet::score_summary_sheet;
use serde_json::json;

fn handle_summary_scores(state: &mut AppState, req: &Request) -> HandlerResult {
    // Filter errors are reported before a workspace is required.
    let filter = parse_filter(req.params.get("filters"))?;
    let conn = db_conn(state)?;
    let summary = score_summary_report(conn, &filter, &state.grading)?;
    Ok(json!(summary))
}

fn handle_summary_subject_by_date(state: &mut AppState, req: &Request) -> HandlerResult {
    let filter = parse_filter(req.params.get("filters"))?;
    filter.require_subject()?;
    let conn = db_conn(state)?;
    let report = subject_date_report(conn, &filter)?;
    Ok(json!(report))
}

fn handle_summary_scores_sheet(state: &mut AppState, req: &Request) -> HandlerResult {
    let filter = parse_filter(req.params.get("filters"))?;
    let conn = db_conn(state)?;
    let summary = score_summary_report(conn, &filter, &state.grading)?;
    Ok(json!(score_summary_sheet(&summary)))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "summary.scores" => handle_summary_scores(state, req),
        "summary.subjectByDate" => handle_summary_subject_by_date(state, req),
        "summary.scoresSheet" => handle_summary_scores_sheet(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
