use crate::calc;
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

/// Numeric input is clamped onto the 0-20 scale; an explicit null clears
/// the cell back to not-graded.
fn resolve_score(value: Option<f64>) -> Result<Option<f64>, HandlerErr> {
    match value {
        None => Ok(None),
        Some(v) if !v.is_finite() => Err(HandlerErr {
            code: "bad_params",
            message: "score must be a finite number or null".to_string(),
            details: Some(json!({ "score": v })),
        }),
        Some(v) => Ok(Some(v.clamp(0.0, calc::MAX_SCORE))),
    }
}

fn evaluation_in_subject(
    conn: &Connection,
    subject_id: &str,
    evaluation_id: &str,
) -> Result<bool, HandlerErr> {
    conn.query_row(
        "SELECT 1 FROM evaluations WHERE id = ? AND subject_id = ?",
        (evaluation_id, subject_id),
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

fn student_enrolled(
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

fn upsert_grade(
    conn: &Connection,
    evaluation_id: &str,
    student_id: &str,
    score: Option<f64>,
) -> Result<(), HandlerErr> {
    let grade_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    conn.execute(
        "INSERT INTO grades(id, evaluation_id, student_id, score, updated_at)
         VALUES(?, ?, ?, ?, ?)
         ON CONFLICT(evaluation_id, student_id) DO UPDATE SET
           score = excluded.score,
           updated_at = excluded.updated_at",
        (&grade_id, evaluation_id, student_id, score, &now),
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: Some(json!({ "table": "grades" })),
    })?;
    Ok(())
}

fn handle_grades_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let ctx = calc::CalcContext {
        conn,
        subject_id: &subject_id,
    };
    match calc::compute_subject_gradebook(&ctx) {
        Ok(model) => ok(&req.id, json!(model)),
        Err(e) => err(
            &req.id,
            &e.code,
            e.message,
            e.details.map(|d| json!(d)).or(None),
        ),
    }
}

fn handle_grades_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let evaluation_id = match req.params.get("evaluationId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing evaluationId", None),
    };
    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let raw_score = match req.params.get("score") {
        None => return err(&req.id, "bad_params", "missing score (number or null)", None),
        Some(v) if v.is_null() => None,
        Some(v) => match v.as_f64() {
            Some(n) => Some(n),
            None => {
                return err(
                    &req.id,
                    "bad_params",
                    "score must be a number or null",
                    None,
                )
            }
        },
    };
    let score = match resolve_score(raw_score) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    match evaluation_in_subject(conn, &subject_id, &evaluation_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "evaluation not found", None),
        Err(e) => return e.response(&req.id),
    }
    match student_enrolled(conn, &subject_id, &student_id) {
        Ok(true) => {}
        Ok(false) => {
            return err(
                &req.id,
                "not_enrolled",
                "student is not enrolled in this subject",
                None,
            )
        }
        Err(e) => return e.response(&req.id),
    }

    if let Err(e) = upsert_grade(conn, &evaluation_id, &student_id, score) {
        return e.response(&req.id);
    }

    ok(&req.id, json!({ "ok": true, "score": score }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "grades.get" => Some(handle_grades_get(state, req)),
        "grades.update" => Some(handle_grades_update(state, req)),
        _ => None,
    }
}
