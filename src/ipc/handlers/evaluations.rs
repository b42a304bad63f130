use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::validate::{validate_evaluation, ProposedEvaluation};
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

fn load_existing(
    conn: &Connection,
    subject_id: &str,
) -> Result<Vec<calc::EvaluationDef>, HandlerErr> {
    calc::load_subject_evaluations(conn, subject_id).map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.message,
        details: None,
    })
}

fn validation_response(
    req: &Request,
    e: crate::validate::ValidationError,
) -> serde_json::Value {
    err(&req.id, e.code(), e.message(), e.details())
}

fn handle_evaluations_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let evaluations = match load_existing(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    ok(&req.id, json!({ "evaluations": evaluations }))
}

fn handle_evaluations_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let Some(corte) = req.params.get("corte").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing/invalid corte", None);
    };
    let name = req
        .params
        .get("name")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    let percentage = req.params.get("percentage").and_then(|v| v.as_f64());

    match subject_exists(conn, &subject_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    }

    let existing = match load_existing(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let proposed = ProposedEvaluation {
        name: &name,
        corte,
        percentage,
    };
    if let Err(e) = validate_evaluation(&proposed, &existing, None) {
        return validation_response(req, e);
    }
    let percentage = percentage.unwrap_or(0.0);
    let name = name.trim().to_string();

    let sort_order: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(sort_order), -1) + 1 FROM evaluations WHERE subject_id = ?",
        [&subject_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let enrolled_ids: Vec<String> = match conn
        .prepare("SELECT student_id FROM enrollments WHERE subject_id = ?")
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

    let evaluation_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO evaluations(id, subject_id, corte, name, percentage, sort_order)
         VALUES(?, ?, ?, ?, ?, ?)",
        (
            &evaluation_id,
            &subject_id,
            corte,
            &name,
            percentage,
            sort_order,
        ),
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    // Materialize a not-graded placeholder per enrolled student so the
    // grade-row invariant holds for the new column.
    for student_id in &enrolled_ids {
        let grade_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO grades(id, evaluation_id, student_id, score) VALUES(?, ?, ?, NULL)",
            (&grade_id, &evaluation_id, student_id),
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
        json!({
            "evaluationId": evaluation_id,
            "gradeRowsCreated": enrolled_ids.len()
        }),
    )
}

fn handle_evaluations_update(state: &mut AppState, req: &Request) -> serde_json::Value {
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
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let existing = match load_existing(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(current) = existing.iter().find(|e| e.evaluation_id == evaluation_id) else {
        return err(&req.id, "not_found", "evaluation not found", None);
    };

    // The budget checks run against the merged result, so a partial patch
    // is validated with the evaluation's stored values filled in.
    let name = match patch.get("name") {
        None => current.name.clone(),
        Some(v) => match v.as_str() {
            Some(s) => s.to_string(),
            None => return err(&req.id, "bad_params", "patch.name must be a string", None),
        },
    };
    let corte = match patch.get("corte") {
        None => current.corte,
        Some(v) => match v.as_i64() {
            Some(c) => c,
            None => return err(&req.id, "bad_params", "patch.corte must be an integer", None),
        },
    };
    let percentage = match patch.get("percentage") {
        None => Some(current.percentage),
        Some(v) => v.as_f64(),
    };

    let proposed = ProposedEvaluation {
        name: &name,
        corte,
        percentage,
    };
    if let Err(e) = validate_evaluation(&proposed, &existing, Some(evaluation_id.as_str())) {
        return validation_response(req, e);
    }
    let percentage = percentage.unwrap_or(0.0);
    let name = name.trim().to_string();

    let changed = match conn.execute(
        "UPDATE evaluations SET corte = ?, name = ?, percentage = ?
         WHERE id = ? AND subject_id = ?",
        (corte, &name, percentage, &evaluation_id, &subject_id),
    ) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "evaluations" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "evaluation not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_evaluations_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let exists: Option<i64> = match conn
        .query_row(
            "SELECT 1 FROM evaluations WHERE id = ? AND subject_id = ?",
            (&evaluation_id, &subject_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "evaluation not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute(
        "DELETE FROM grades WHERE evaluation_id = ?",
        [&evaluation_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM evaluations WHERE id = ?", [&evaluation_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "evaluations.list" => Some(handle_evaluations_list(state, req)),
        "evaluations.create" => Some(handle_evaluations_create(state, req)),
        "evaluations.update" => Some(handle_evaluations_update(state, req)),
        "evaluations.delete" => Some(handle_evaluations_delete(state, req)),
        _ => None,
    }
}
