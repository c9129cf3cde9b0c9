use crate::calc::{parse_filter, push_filter_sql, Filter};
use crate::ipc::error::{respond, HandlerError, HandlerResult};
use crate::ipc::handlers::students::find_student;
use crate::ipc::handlers::teachers::find_teacher;
use crate::ipc::helpers::{
    body, db_conn, distinct_strings, optional_date, required_i64, required_str,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Record, RecordInput, RECORD_COLUMNS};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

fn find_record(conn: &Connection, id: i64) -> Result<Option<Record>, HandlerError> {
    let sql = format!("SELECT {} FROM records WHERE id = ?", RECORD_COLUMNS);
    Ok(conn.query_row(&sql, [id], Record::from_row).optional()?)
}

/// Validated record body whose student and teacher both exist.
fn record_body(conn: &Connection, req: &Request) -> Result<RecordInput, HandlerError> {
    let input = body::<RecordInput>(req, "record")?
        .normalized()
        .map_err(HandlerError::BadParams)?;
    if find_student(conn, &input.student_id)?.is_none() {
        return Err(HandlerError::ReferenceMissing(format!(
            "student {} does not exist",
            input.student_id
        )));
    }
    if find_teacher(conn, &input.teacher_id)?.is_none() {
        return Err(HandlerError::ReferenceMissing(format!(
            "teacher {} does not exist",
            input.teacher_id
        )));
    }
    Ok(input)
}

fn handle_records_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let filter = parse_filter(req.params.get("filters"))?;

    let mut sql = String::from(
        "SELECT r.id, r.student_id, r.subject, r.score, r.type, r.date, r.batch, r.teacher_id
         FROM records r
         JOIN students s ON s.student_id = r.student_id
         WHERE 1 = 1",
    );
    let mut binds: Vec<Value> = Vec::new();
    push_filter_sql(&filter, &mut sql, &mut binds);
    sql.push_str(" ORDER BY r.date, r.id");

    let mut stmt = conn.prepare(&sql)?;
    let records = stmt
        .query_map(params_from_iter(binds), Record::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "records": records }))
}

fn handle_records_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let id = required_i64(req, "recordId")?;
    let record = find_record(conn, id)?
        .ok_or_else(|| HandlerError::NotFound(format!("record {} not found", id)))?;
    Ok(json!(record))
}

fn handle_records_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let input = record_body(conn, req)?;
    conn.execute(
        "INSERT INTO records(student_id, subject, score, type, date, batch, teacher_id)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        (
            &input.student_id,
            &input.subject,
            input.score,
            &input.kind,
            &input.date,
            &input.batch,
            &input.teacher_id,
        ),
    )?;
    let id = conn.last_insert_rowid();
    info!(
        record_id = id,
        student_id = %input.student_id,
        subject = %input.subject,
        "record created"
    );
    let record = find_record(conn, id)?
        .ok_or_else(|| HandlerError::NotFound(format!("record {} not found", id)))?;
    Ok(json!(record))
}

fn handle_records_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let id = required_i64(req, "recordId")?;
    if find_record(conn, id)?.is_none() {
        return Err(HandlerError::NotFound(format!("record {} not found", id)));
    }
    let input = record_body(conn, req)?;
    conn.execute(
        "UPDATE records
         SET student_id = ?, subject = ?, score = ?, type = ?, date = ?, batch = ?, teacher_id = ?
         WHERE id = ?",
        (
            &input.student_id,
            &input.subject,
            input.score,
            &input.kind,
            &input.date,
            &input.batch,
            &input.teacher_id,
            id,
        ),
    )?;
    info!(record_id = id, "record updated");
    let record = find_record(conn, id)?
        .ok_or_else(|| HandlerError::NotFound(format!("record {} not found", id)))?;
    Ok(json!(record))
}

fn handle_records_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let id = required_i64(req, "recordId")?;
    let n = conn.execute("DELETE FROM records WHERE id = ?", [id])?;
    if n == 0 {
        return Err(HandlerError::NotFound(format!("record {} not found", id)));
    }
    info!(record_id = id, "record deleted");
    Ok(json!({ "deleted": id }))
}

fn handle_records_batches(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let batches = distinct_strings(
        conn,
        "SELECT DISTINCT batch FROM records WHERE batch IS NOT NULL ORDER BY batch",
        Vec::new(),
    )?;
    Ok(json!({ "batches": batches }))
}

/// Date-range predicate on `r.date`, both bounds inclusive. Validated like
/// any other record filter.
fn push_date_range(
    req: &Request,
    sql: &mut String,
    binds: &mut Vec<Value>,
) -> Result<(), HandlerError> {
    let range = Filter {
        start_date: optional_date(req, "startDate")?,
        end_date: optional_date(req, "endDate")?,
        ..Filter::default()
    };
    range.validate()?;
    push_filter_sql(&range, sql, binds);
    Ok(())
}

fn handle_records_grades(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let mut sql = String::from(
        "SELECT DISTINCT s.grade
         FROM records r
         JOIN students s ON s.student_id = r.student_id
         WHERE 1 = 1",
    );
    let mut binds = Vec::new();
    push_date_range(req, &mut sql, &mut binds)?;
    sql.push_str(" ORDER BY s.grade");
    let grades = distinct_strings(conn, &sql, binds)?;
    Ok(json!({ "grades": grades }))
}

fn handle_records_classes(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let grade = required_str(req, "grade")?;
    let mut sql = String::from(
        "SELECT DISTINCT s.class_name
         FROM records r
         JOIN students s ON s.student_id = r.student_id
         WHERE s.grade = ?",
    );
    let mut binds = vec![Value::Text(grade)];
    push_date_range(req, &mut sql, &mut binds)?;
    sql.push_str(" ORDER BY s.class_name");
    let classes = distinct_strings(conn, &sql, binds)?;
    Ok(json!({ "classes": classes }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "records.list" => handle_records_list(state, req),
        "records.get" => handle_records_get(state, req),
        "records.create" => handle_records_create(state, req),
        "records.update" => handle_records_update(state, req),
        "records.delete" => handle_records_delete(state, req),
        "records.batches" => handle_records_batches(state, req),
        "records.grades" => handle_records_grades(state, req),
        "records.classes" => handle_records_classes(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
