use crate::ipc::error::{respond, HandlerError, HandlerResult};
use crate::ipc::helpers::{
    body, contains_pattern, db_conn, distinct_strings, optional_str, required_str, Paging,
};
use crate::ipc::types::{AppState, Request};
use crate::model::{Student, STUDENT_COLUMNS};
use rusqlite::{params_from_iter, types::Value, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;

pub(crate) fn find_student(
    conn: &Connection,
    student_id: &str,
) -> Result<Option<Student>, HandlerError> {
    let sql = format!("SELECT {} FROM students WHERE student_id = ?", STUDENT_COLUMNS);
    Ok(conn
        .query_row(&sql, [student_id], Student::from_row)
        .optional()?)
}

fn record_count(conn: &Connection, student_id: &str) -> Result<i64, HandlerError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM records WHERE student_id = ?",
        [student_id],
        |r| r.get(0),
    )?)
}

fn student_body(req: &Request) -> Result<Student, HandlerError> {
    body::<Student>(req, "student")?
        .normalized()
        .map_err(HandlerError::BadParams)
}

fn handle_students_list(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let paging = Paging::parse(req)?;

    let mut where_sql = String::from(" WHERE 1 = 1");
    let mut binds: Vec<Value> = Vec::new();
    if let Some(v) = optional_str(req, "grade") {
        where_sql.push_str(" AND grade = ?");
        binds.push(Value::Text(v));
    }
    if let Some(v) = optional_str(req, "className") {
        where_sql.push_str(" AND class_name = ?");
        binds.push(Value::Text(v));
    }
    if let Some(v) = optional_str(req, "group") {
        where_sql.push_str(" AND group_name = ?");
        binds.push(Value::Text(v));
    }
    if let Some(v) = optional_str(req, "studentId") {
        where_sql.push_str(" AND student_id LIKE ? ESCAPE '\\'");
        binds.push(Value::Text(contains_pattern(&v)));
    }
    if let Some(v) = optional_str(req, "name") {
        where_sql.push_str(" AND name LIKE ? ESCAPE '\\'");
        binds.push(Value::Text(contains_pattern(&v)));
    }

    let total: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM students{}", where_sql),
        params_from_iter(binds.iter()),
        |r| r.get(0),
    )?;

    let sql = format!(
        "SELECT {} FROM students{} ORDER BY grade, class_name, student_id LIMIT ? OFFSET ?",
        STUDENT_COLUMNS, where_sql
    );
    binds.push(Value::Integer(paging.page_size));
    binds.push(Value::Integer(paging.offset()));
    let mut stmt = conn.prepare(&sql)?;
    let items = stmt
        .query_map(params_from_iter(binds), Student::from_row)?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "items": items,
        "total": total,
        "page": paging.page,
        "pageSize": paging.page_size,
    }))
}

fn handle_students_get(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let student = find_student(conn, &student_id)?
        .ok_or_else(|| HandlerError::NotFound(format!("student {} not found", student_id)))?;
    Ok(json!(student))
}

fn handle_students_create(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student = student_body(req)?;
    if find_student(conn, &student.student_id)?.is_some() {
        return Err(HandlerError::Conflict(format!(
            "student {} already exists",
            student.student_id
        )));
    }
    conn.execute(
        &format!("INSERT INTO students({}) VALUES(?, ?, ?, ?, ?, ?)", STUDENT_COLUMNS),
        (
            &student.student_id,
            &student.name,
            &student.cohort,
            &student.class_name,
            &student.group,
            student.subjects_text(),
        ),
    )?;
    info!(student_id = %student.student_id, "student created");
    Ok(json!(student))
}

/// Replaces a student. The key may change; records follow it through the
/// foreign key's ON UPDATE CASCADE.
fn handle_students_update(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    let student = student_body(req)?;
    if find_student(conn, &student_id)?.is_none() {
        return Err(HandlerError::NotFound(format!("student {} not found", student_id)));
    }
    if student.student_id != student_id && find_student(conn, &student.student_id)?.is_some() {
        return Err(HandlerError::Conflict(format!(
            "student {} already exists",
            student.student_id
        )));
    }
    conn.execute(
        "UPDATE students
         SET student_id = ?, name = ?, grade = ?, class_name = ?, group_name = ?, subjects = ?
         WHERE student_id = ?",
        (
            &student.student_id,
            &student.name,
            &student.cohort,
            &student.class_name,
            &student.group,
            student.subjects_text(),
            &student_id,
        ),
    )?;
    info!(student_id = %student_id, new_student_id = %student.student_id, "student updated");
    Ok(json!(student))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let student_id = required_str(req, "studentId")?;
    if find_student(conn, &student_id)?.is_none() {
        return Err(HandlerError::NotFound(format!("student {} not found", student_id)));
    }
    let count = record_count(conn, &student_id)?;
    if count > 0 {
        return Err(HandlerError::InUse {
            message: format!("student {} has {} records", student_id, count),
            count,
        });
    }
    conn.execute("DELETE FROM students WHERE student_id = ?", [&student_id])?;
    info!(student_id = %student_id, "student deleted");
    Ok(json!({ "deleted": student_id }))
}

fn handle_students_grades(state: &mut AppState, _req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let grades = distinct_strings(
        conn,
        "SELECT DISTINCT grade FROM students ORDER BY grade",
        Vec::new(),
    )?;
    Ok(json!({ "grades": grades }))
}

fn handle_students_classes(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let grade = required_str(req, "grade")?;
    let classes = distinct_strings(
        conn,
        "SELECT DISTINCT class_name FROM students WHERE grade = ? ORDER BY class_name",
        vec![Value::Text(grade)],
    )?;
    Ok(json!({ "classes": classes }))
}

fn handle_students_groups(state: &mut AppState, req: &Request) -> HandlerResult {
    let conn = db_conn(state)?;
    let class_name = required_str(req, "className")?;
    let groups = distinct_strings(
        conn,
        "SELECT DISTINCT group_name FROM students
         WHERE class_name = ? AND group_name IS NOT NULL
         ORDER BY group_name",
        vec![Value::Text(class_name)],
    )?;
    Ok(json!({ "groups": groups }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    let result = match req.method.as_str() {
        "students.list" => handle_students_list(state, req),
        "students.get" => handle_students_get(state, req),
        "students.create" => handle_students_create(state, req),
        "students.update" => handle_students_update(state, req),
        "students.delete" => handle_students_delete(state, req),
        "students.grades" => handle_students_grades(state, req),
        "students.classes" => handle_students_classes(state, req),
        "students.groups" => handle_students_groups(state, req),
        _ => return None,
    };
    Some(respond(&req.id, result))
}
