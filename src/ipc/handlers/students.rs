use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn national_id_taken(
    conn: &Connection,
    national_id: &str,
    excluding_student_id: Option<&str>,
) -> Result<bool, rusqlite::Error> {
    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM students WHERE national_id = ?",
            [national_id],
            |r| r.get(0),
        )
        .optional()?;
    Ok(match existing {
        Some(id) => excluding_student_id.map(|ex| ex != id).unwrap_or(true),
        None => false,
    })
}

fn handle_students_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "students": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT
           s.id,
           s.national_id,
           s.name,
           s.email,
           (SELECT COUNT(*) FROM enrollments e WHERE e.student_id = s.id) AS enrollment_count
         FROM students s
         ORDER BY s.name, s.national_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let national_id: String = row.get(1)?;
            let name: String = row.get(2)?;
            let email: String = row.get(3)?;
            let enrollment_count: i64 = row.get(4)?;
            Ok(json!({
                "id": id,
                "nationalId": national_id,
                "name": name,
                "email": email,
                "enrollmentCount": enrollment_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_students_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let national_id = match req.params.get("nationalId").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing nationalId", None),
    };
    if national_id.is_empty() {
        return err(&req.id, "bad_params", "nationalId must not be empty", None);
    }
    let name = match req.params.get("name").and_then(|v| v.as_str()) {
        Some(v) => v.trim().to_string(),
        None => return err(&req.id, "bad_params", "missing name", None),
    };
    if name.is_empty() {
        return err(&req.id, "bad_params", "name must not be empty", None);
    }
    let email = req
        .params
        .get("email")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .trim()
        .to_string();

    match national_id_taken(conn, &national_id, None) {
        Ok(false) => {}
        Ok(true) => {
            return err(
                &req.id,
                "duplicate_national_id",
                "a student with this national id already exists",
                Some(json!({ "nationalId": national_id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let student_id = Uuid::new_v4().to_string();
    let now = chrono::Utc::now().to_rfc3339();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, national_id, name, email, updated_at) VALUES(?, ?, ?, ?, ?)",
        (&student_id, &national_id, &name, &email, &now),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(
        &req.id,
        json!({ "studentId": student_id, "nationalId": national_id, "name": name }),
    )
}

fn handle_students_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("nationalId") {
        let Some(s) = v.as_str() else {
            return err(
                &req.id,
                "bad_params",
                "patch.nationalId must be a string",
                None,
            );
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "nationalId must not be empty", None);
        }
        match national_id_taken(conn, &s, Some(student_id.as_str())) {
            Ok(false) => {}
            Ok(true) => {
                return err(
                    &req.id,
                    "duplicate_national_id",
                    "a student with this national id already exists",
                    Some(json!({ "nationalId": s })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
        set_parts.push("national_id = ?".into());
        bind_values.push(Value::Text(s));
    }
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
    if let Some(v) = patch.get("email") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.email must be a string", None);
        };
        set_parts.push("email = ?".into());
        bind_values.push(Value::Text(s.trim().to_string()));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    set_parts.push("updated_at = ?".into());
    bind_values.push(Value::Text(chrono::Utc::now().to_rfc3339()));

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id.clone()));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_students_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let student_id = match req.params.get("studentId").and_then(|v| v.as_str()) {
        Some(v) => v.to_string(),
        None => return err(&req.id, "bad_params", "missing studentId", None),
    };

    let exists: Option<i64> = match conn
        .query_row("SELECT 1 FROM students WHERE id = ?", [&student_id], |r| {
            r.get(0)
        })
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exists.is_none() {
        return err(&req.id, "not_found", "student not found", None);
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    if let Err(e) = tx.execute("DELETE FROM grades WHERE student_id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "grades" })),
        );
    }
    if let Err(e) = tx.execute(
        "DELETE FROM enrollments WHERE student_id = ?",
        [&student_id],
    ) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "enrollments" })),
        );
    }
    if let Err(e) = tx.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        let _ = tx.rollback();
        return err(
            &req.id,
            "db_delete_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_students_list(state, req)),
        "students.create" => Some(handle_students_create(state, req)),
        "students.update" => Some(handle_students_update(state, req)),
        "students.delete" => Some(handle_students_delete(state, req)),
        _ => None,
    }
}
