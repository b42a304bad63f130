use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn subject_exists(conn: &Connection, subject_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM subjects WHERE id = ?", [subject_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, HandlerErr> {
    conn.query_row("SELECT 1 FROM students WHERE id = ?", [student_id], |r| {
        r.get::<_, i64>(0)
    })
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn enrollment_exists(
    conn: &Connection,
    subject_id: &str,
    student_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM enrollments WHERE subject_id = ? AND student_id = ?",
        (subject_id, student_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_enrollments_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.national_id, s.name, s.email
         FROM students s
         JOIN enrollments e ON e.student_id = s.id
         WHERE e.subject_id = ?
         ORDER BY s.name, s.national_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([&subject_id], |row| {
            let id: String = row.get(0)?;
            let national_id: String = row.get(1)?;
            let name: String = row.get(2)?;
            let email: String = row.get(3)?;
            Ok(json!({
                "studentId": id,
                "nationalId": national_id,
                "name": name,
                "email": email
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_enrollments_enroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }
    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return e.response(&req.id),
    }
    match enrollment_exists(conn, &subject_id, &student_id) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "already_enrolled",
                "student is already enrolled in this subject",
                None,
            )
        }
        Err(e) => return e.response(&req.id),
    }

    let evaluation_ids: Vec<String> = match conn
        .prepare("SELECT id FROM evaluations WHERE subject_id = ?")
        .and_then(|mut stmt| {
            stmt.query_map([&subject_id], |r| r.get::<_, String>(0))
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        }) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "INSERT INTO enrollments(subject_id, student_id) VALUES(?, ?)",
        (&subject_id, &student_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    // Materialize a not-graded placeholder for every existing evaluation so
    // the grade-row invariant holds for this student from here on.
    for evaluation_id in &evaluation_ids {
        let grade_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO grades(id, evaluation_id, student_id, score) VALUES(?, ?, ?, NULL)",
            (&grade_id, evaluation_id, &student_id),
        ) {
            let _ = tx.rollback();
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "grades" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({ "ok": true, "gradeRowsCreated": evaluation_ids.len() }),
    )
}

fn handle_enrollments_unenroll(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    match enrollment_exists(conn, &subject_id, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "enrollment not found", None),
        Err(e) => return e.response(&req.id),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM grades
         WHERE student_id = ?
           AND evaluation_id IN (SELECT id FROM evaluations WHERE subject_id = ?)",
        (&student_id, &subject_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    if let Err(e) = tx.execute(
        "DELETE FROM enrollments WHERE subject_id = ? AND student_id = ?",
        (&subject_id, &student_id),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "enrollments.list" => Some(handle_enrollments_list(state, req)),
        "enrollments.enroll" => Some(handle_enrollments_enroll(state, req)),
        "enrollments.unenroll" => Some(handle_enrollments_unenroll(state, req)),
        _ => None,
    }
}
