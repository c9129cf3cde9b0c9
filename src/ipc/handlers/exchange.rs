use crate::calc::{parse_filter, score_summary_report, subject_date_report, DATE_FORMAT};
use crate::ipc::error::{respond, HandlerError, HandlerResult};
use crate::ipc::handlers::students::find_student;
use crate::ipc::handlers::teachers::find_teacher;
use crate::ipc::helpers::{db_conn, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use crate::sheet::{
    parse_import_date, read_record_import, record_template_sheet, score_summary_sheet,
    subject_date_sheet, write_csv, ImportRow, TemplateStudent,
};
use rusqlite::{params_from_iter, types::Value, Connection};
use serde_json::json;
use std::path::PathBuf;
use tracing::{info, warn};

fn handle_export_score_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let filter = parse_filter(req.params.get("filters"))?;
    let out_path = PathBuf::from(required_str(req, "outPath")?);
    let conn = db_conn(state)?;

    let summary = score_summary_report(conn, &filter, &state.grading)?;
    if summary.students.is_empty() {
        return Err(HandlerError::NotFound("no records match the filters".into()));
    }
    let rows = write_csv(&score_summary_sheet(&summary), &out_path)?;
    info!(path = %out_path.display(), rows, "score summary exported");
    Ok(json!({ "path": out_path.to_string_lossy(), "rowCount": rows }))
}

fn handle_export_subject_summary(state: &mut AppState, req: &Request) -> HandlerResult {
    let filter = parse_filter(req.params.get("filters"))?;
    filter.require_subject()?;
    let out_path = PathBuf::from(required_str(req, "outPath")?);
    let conn = db_conn(state)?;

    let report = subject_date_report(conn, &filter)?;
    if report.students.is_empty() {
        return Err(HandlerError::NotFound(format!(
            "no {} records match the filters",
            report.subject
        )));
    }
    let rows = write_csv(&subject_date_sheet(&report), &out_path)?;
    info!(path = %out_path.display(), subject = %report.subject, rows, "subject summary exported");
    Ok(json!({ "path": out_path.to_string_lossy(), "rowCount": rows }))
}

fn class_names(req: &Request) -> Result<Vec<String>, HandlerError> {
    let Some(raw) = req.params.get("classNames") else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let list = raw
        .as_array()
        .ok_or_else(|| HandlerError::BadParams("classNames must be an array".into()))?;
    let mut out = Vec::with_capacity(list.len());
    for v in list {
        let name = v
            .as_str()
            .ok_or_else(|| HandlerError::BadParams("classNames must hold strings".into()))?
            .trim();
        if !name.is_empty() {
            out.push(name.to_string());
        }
    }
    Ok(out)
}

fn template_students(
    conn: &Connection,
    grade: Option<String>,
    classes: Vec<String>,
) -> Result<Vec<TemplateStudent>, HandlerError> {
    let mut sql = String::from("SELECT student_id, name, class_name FROM students WHERE 1 = 1");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(g) = grade {
        sql.push_str(" AND grade = ?");
        binds.push(Value::Text(g));
    }
    if !classes.is_empty() {
        let marks = vec!["?"; classes.len()].join(", ");
        sql.push_str(&format!(" AND class_name IN ({})", marks));
        binds.extend(classes.into_iter().map(Value::Text));
    }
    sql.push_str(" ORDER BY class_name, student_id");

    let mut stmt = conn.prepare(&sql)?;
    let students = stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(TemplateStudent {
                student_id: r.get(0)?,
                name: r.get(1)?,
                class_name: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(students)
}

fn handle_export_template(state: &mut AppState, req: &Request) -> HandlerResult {
    let grade = optional_str(req, "grade");
    let classes = class_names(req)?;
    let out_path = PathBuf::from(required_str(req, "outPath")?);
    let conn = db_conn(state)?;

    let students = template_students(conn, grade, classes)?;
    if students.is_empty() {
        return Err(HandlerError::NotFound("no students match the filters".into()));
    }
    let today = chrono::Local::now().date_naive();
    let rows = write_csv(&record_template_sheet(&students, today), &out_path)?;
    info!(path = %out_path.display(), rows, "record template exported");
    Ok(json!({ "path": out_path.to_string_lossy(), "rowCount": rows }))
}

/// Checked row ready for insert.
struct ImportedRecord {
    student_id: String,
    subject: String,
    score: Option<f64>,
    kind: Option<String>,
    date: String,
    batch: Option<String>,
    teacher_id: String,
}

fn check_import_row(conn: &Connection, row: ImportRow) -> Result<ImportedRecord, String> {
    if row.student_id.is_empty() {
        return Err("missing student id".into());
    }
    if row.subject.is_empty() {
        return Err("missing subject".into());
    }
    let date = parse_import_date(&row.date)
        .ok_or_else(|| format!("invalid date: {:?}", row.date))?
        .format(DATE_FORMAT)
        .to_string();
    let score = match row.score.as_deref() {
        None => None,
        Some(raw) => match raw.parse::<f64>() {
            Ok(v) if v.is_finite() => Some(v),
            _ => return Err(format!("invalid score: {:?}", raw)),
        },
    };
    let lookup = |e: HandlerError| e.to_string();
    if find_student(conn, &row.student_id).map_err(lookup)?.is_none() {
        return Err(format!("student {} does not exist", row.student_id));
    }
    if row.teacher_id.is_empty() {
        return Err("missing teacher id".into());
    }
    if find_teacher(conn, &row.teacher_id).map_err(lookup)?.is_none() {
        return Err(format!("teacher {} does not exist", row.teacher_id));
    }
    Ok(ImportedRecord {
        student_id: row.student_id,
        subject: row.subject,
        score,
        kind: row.kind,
        date,
        batch: row.batch,
        teacher_id: row.teacher_id,
    })
}

/// Imports every valid row in one transaction; invalid rows are reported
/// back and skipped.
fn handle_import_records(state: &mut AppState, req: &Request) -> HandlerResult {
    let in_path = PathBuf::from(required_str(req, "inPath")?);
    let conn = db_conn(state)?;
    let rows = read_record_import(&in_path)?;

    let mut accepted = Vec::new();
    let mut failed = Vec::new();
    for row in rows {
        let line = row.line;
        let student_id = row.student_id.clone();
        match check_import_row(conn, row) {
            Ok(r) => accepted.push(r),
            Err(reason) => {
                warn!(line, student_id = %student_id, reason = %reason, "import row rejected");
                failed.push(json!({
                    "line": line,
                    "studentId": student_id,
                    "reason": reason,
                }));
            }
        }
    }

    let tx = conn.unchecked_transaction()?;
    {
        let mut stmt = tx.prepare(
            "INSERT INTO records(student_id, subject, score, type, date, batch, teacher_id)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
        )?;
        for r in &accepted {
            stmt.execute((
                &r.student_id,
                &r.subject,
                r.score,
                &r.kind,
                &r.date,
                &r.batch,
                &r.teacher_id,
            ))?;
        }
    }
    tx.commit()?;

    info!(
        path = %in_path.display(),
        imported = accepted.len(),
        failed = failed.len(),
        "records imported"
    );
    Ok(json!({
        "importedCount": accepted.len(),
        "failedRecords": failed,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "exchange.exportScoreSummary" => handle_export_score_summary(state, req),
        "exchange.exportSubjectSummary" => handle_export_subject_summary(state, req),
        "exchange.exportTemplate" => handle_export_template(state, req),
        "exchange.importRecords" => handle_import_records(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
