use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "homework.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    init_schema(&conn)?;
    Ok(conn)
}

/// Creates tables and indexes if missing. Safe to run on every open.
pub fn init_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            student_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            grade TEXT NOT NULL,
            class_name TEXT NOT NULL,
            group_name TEXT,
            subjects TEXT
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_grade_class ON students(grade, class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            teacher_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            subject TEXT NOT NULL
        )",
        [],
    )?;

    // Key changes on students/teachers carry over to their records.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS records(
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            student_id TEXT NOT NULL,
            subject TEXT NOT NULL,
            score REAL,
            type TEXT,
            date TEXT NOT NULL,
            batch TEXT,
            teacher_id TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(student_id) ON UPDATE CASCADE,
            FOREIGN KEY(teacher_id) REFERENCES teachers(teacher_id) ON UPDATE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_student ON records(student_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_teacher ON records(teacher_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_records_subject_date ON records(subject, date)",
        [],
    )?;

    Ok(())
}
