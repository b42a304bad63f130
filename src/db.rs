use rusqlite::Connection;
use std::path::Path;

pub const DB_FILE_NAME: &str = "gradebook.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(DB_FILE_NAME);
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            period_label TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            national_id TEXT NOT NULL UNIQUE,
            name TEXT NOT NULL,
            email TEXT NOT NULL DEFAULT '',
            updated_at TEXT
        )",
        [],
    )?;

    // Existing workspaces may predate the email/updated_at columns.
    ensure_students_email(&conn)?;
    ensure_students_updated_at(&conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS enrollments(
            subject_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            PRIMARY KEY(subject_id, student_id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(student_id) REFERENCES students(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_enrollments_student ON enrollments(student_id)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS evaluations(
            id TEXT PRIMARY KEY,
            subject_id TEXT NOT NULL,
            corte INTEGER NOT NULL,
            name TEXT NOT NULL,
            percentage REAL NOT NULL,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_subject ON evaluations(subject_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_evaluations_subject_corte
         ON evaluations(subject_id, corte)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grades(
            id TEXT PRIMARY KEY,
            evaluation_id TEXT NOT NULL,
            student_id TEXT NOT NULL,
            score REAL,
            updated_at TEXT,
            FOREIGN KEY(evaluation_id) REFERENCES evaluations(id),
            FOREIGN KEY(student_id) REFERENCES students(id),
            UNIQUE(evaluation_id, student_id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_evaluation ON grades(evaluation_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_student ON grades(student_id)",
        [],
    )?;

    Ok(conn)
}

fn ensure_students_email(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "email")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE students ADD COLUMN email TEXT NOT NULL DEFAULT ''",
        [],
    )?;
    Ok(())
}

fn ensure_students_updated_at(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "students", "updated_at")? {
        return Ok(());
    }
    conn.execute("ALTER TABLE students ADD COLUMN updated_at TEXT", [])?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}
