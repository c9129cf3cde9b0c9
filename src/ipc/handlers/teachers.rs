use crate::ipc::error::{respond, HandlerError, HandlerResult};
use crate::ipc::helpers::{body, db_conn, distinct_strings, optional_str, required_str, Paging};
use crate::ipc::types::{AppState, Request};
use crate::model::{Teacher, TEACHER_COLUMNS};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

pub(crate) fn find_teacher(
    conn: &Connection,
    teacher_id: &str,
) -> Result<Option<Teacher>, HandlerError> {
    let sql = format!("SELECT {} FROM teachers WHERE teacher_id = ?", TEACHER_COLUMNS);
    Ok(conn
        .query_row(&sql, [teacher_id], Teacher::from_row)
        .optional()?)
}

fn teacher_body(req: &Request) -> Result<Teacher, HandlerError> {
    body::<Teacher>(req, "teacher")?
        .normalized()
        .map_err(HandlerError::BadParams)
}

fn not_found(teacher_id: &str) -> HandlerError {
    HandlerError::NotFound(format!("teacher {} not found", teacher_id))
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let paging = Paging::parse(req)?;

    let mut where_sql = String::new();
    let mut binds: Vec<Value> = Vec::new();
    if let Some(subject) = optional_str(req, "subject") {
        where_sql.push_str(" WHERE subject = ?");
        binds.push(Value::Text(subject));
    }

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM teachers{}", where_sql),
        params_from_iter(binds.iter()),
        |r| r.get(0),
    )?;
    let sql = format!(
        "SELECT {} FROM teachers{} ORDER BY teacher_id LIMIT ? OFFSET ?",
        TEACHER_COLUMNS, where_sql
    );
    binds.push(Value::Integer(paging.page_size));
    binds.push(Value::Integer(paging.offset()));
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(binds), Teacher::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "items": items,
        "total": total,
        "page": paging.page,
        "pageSize": paging.page_size,
    }))
}

fn handle_teachers_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let teacher_id = required_str(req, "teacherId")?;
    let teacher = find_teacher(conn, &teacher_id)?.ok_or_else(|| not_found(&teacher_id))?;
    Ok(json!(teacher))
}

fn handle_teachers_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let teacher = teacher_body(req)?;
    if find_teacher(conn, &teacher.teacher_id)?.is_some() {
        return Err(HandlerError::Conflict(format!(
            "teacher {} already exists",
            teacher.teacher_id
        )));
    }
    conn.execute(
        "INSERT INTO teachers(teacher_id, name, subject) VALUES(?, ?, ?)",
        (&teacher.teacher_id, &teacher.name, &teacher.subject),
    )?;
    info!(teacher_id = %teacher.teacher_id, "teacher created");
    Ok(json!(teacher))
}

fn handle_teachers_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let teacher_id = required_str(req, "teacherId")?;
    let teacher = teacher_body(req)?;
    if find_teacher(conn, &teacher_id)?.is_none() {
        return Err(not_found(&teacher_id));
    }
    if teacher.teacher_id != teacher_id && find_teacher(conn, &teacher.teacher_id)?.is_some() {
        return Err(HandlerError::Conflict(format!(
            "teacher {} already exists",
            teacher.teacher_id
        )));
    }
    conn.execute(
        "UPDATE teachers SET teacher_id = ?, name = ?, subject = ? WHERE teacher_id = ?",
        (&teacher.teacher_id, &teacher.name, &teacher.subject, &teacher_id),
    )?;
    info!(teacher_id = %teacher_id, new_teacher_id = %teacher.teacher_id, "teacher updated");
    Ok(json!(teacher))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let teacher_id = required_str(req, "teacherId")?;
    if find_teacher(conn, &teacher_id)?.is_none() {
        return Err(not_found(&teacher_id));
    }
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM records WHERE teacher_id = ?",
        [&teacher_id],
        |r| r.get(0),
    )?;
    if count > 0 {
        return Err(HandlerError::InUse {
            message: format!("teacher {} has {} records", teacher_id, count),
            count,
        });
    }
    conn.execute("DELETE FROM teachers WHERE teacher_id = ?", [&teacher_id])?;
    info!(teacher_id = %teacher_id, "teacher deleted");
    Ok(json!({ "deleted": teacher_id }))
}

fn handle_teachers_subjects(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let subjects = distinct_strings(
        conn,
        "SELECT DISTINCT subject FROM teachers ORDER BY subject",
        Vec::new(),
    )?;
    Ok(json!({ "subjects": subjects }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "teachers.list" => handle_teachers_list(state, req),
        "teachers.get" => handle_teachers_get(state, req),
        "teachers.create" => handle_teachers_create(state, req),
        "teachers.update" => handle_teachers_update(state, req),
        "teachers.delete" => handle_teachers_delete(state, req),
        "teachers.subjects" => handle_teachers_subjects(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
