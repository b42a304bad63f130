use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "subjects": [] }));
    };

    // Include counts so the UI can show a useful dashboard.
    // Correlated subqueries avoid double-counting from joins.
    let mut stmt = match conn.prepare(
        "SELECT
           su.id,
           su.name,
           su.period_label,
           (SELECT COUNT(*) FROM enrollments e WHERE e.subject_id = su.id) AS student_count,
           (SELECT COUNT(*) FROM evaluations ev WHERE ev.subject_id = su.id) AS evaluation_count
         FROM subjects su
         ORDER BY su.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let name: String = row.get(1)?;
            let period_label: String = row.get(2)?;
            let student_count: i64 = row.get(3)?;
            let evaluation_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "name": name,
                "periodLabel": period_label,
                "studentCount": student_count,
                "evaluationCount": evaluation_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subjects_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let period_label = match req.params.get("periodLabel").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing periodLabel", None),
    };
    if period_label.is_empty() {
        return err(&req.id, "bad_params", "periodLabel must not be empty", None);
    }

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, name, period_label) VALUES(?, ?, ?)",
        (&subject_id, &name, &period_label),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    ok(
        &req.id,
        json!({ "subjectId": subject_id, "name": name, "periodLabel": period_label }),
    )
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.name must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        set_parts.push("name = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("periodLabel") {
        let Some(s) = v.as_str() else {
            return err(
                &req.id,
                "bad_params",
                "patch.periodLabel must be a string",
                None,
            );
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "periodLabel must not be empty", None);
        }
        set_parts.push("period_label = ?".into());
        bind_values.push(Value::Text(s));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    let sql = format!("UPDATE subjects SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(subject_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "subjects" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "subject not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let subject_id = match req.params.get("subjectId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing subjectId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "subject not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    // Explicitly delete in dependency order (no ON DELETE CASCADE).
    if let Err(e) = tx.execute(
        "DELETE FROM grades
         WHERE evaluation_id IN (SELECT id FROM evaluations WHERE subject_id = ?)",
        [&subject_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM evaluations WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM enrollments WHERE subject_id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }

    if let Err(e) = tx.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "subjects" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.create" => Some(handle_subjects_create(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
