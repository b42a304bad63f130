use crate::calc;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::json;
use std::path::{Path, PathBuf};

fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.to_string())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

fn calc_err(req: &Request, e: calc::CalcError) -> serde_json::Value {
    err(
        &req.id,
        &e.code,
        e.message,
        e.details.map(|d| json!(d)).or(None),
    )
}

fn load_gradebook(
    conn: &Connection,
    subject_id: &str,
) -> Result<calc::SubjectGradebook, calc::CalcError> {
    let ctx = calc::CalcContext { conn, subject_id };
    calc::compute_subject_gradebook(&ctx)
}

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn write_text_file(path: &Path, text: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, text)
}

/// Renders the gradebook model as CSV. Not-graded cells stay empty so they
/// can never be mistaken for an explicit 0.
fn gradebook_to_csv(model: &calc::SubjectGradebook) -> String {
    let mut csv = String::from("national_id,name,email");
    for e in &model.evaluations {
        csv.push(',');
        csv.push_str(&csv_quote(&format!(
            "{} (C{} {}%)",
            e.name, e.corte, e.percentage
        )));
    }
    for c in calc::CORTES {
        csv.push_str(&format!(",corte{}_sum,corte{}_grade", c, c));
    }
    csv.push_str(",final\n");

    for row in &model.students {
        csv.push_str(&format!(
            "{},{},{}",
            csv_quote(&row.national_id),
            csv_quote(&row.name),
            csv_quote(&row.email)
        ));
        for score in &row.scores {
            csv.push(',');
            if let Some(v) = score {
                csv.push_str(&format!("{}", v));
            }
        }
        for breakdown in &row.cortes {
            csv.push_str(&format!(
                ",{},{}",
                breakdown.weighted_sum, breakdown.normalized_grade
            ));
        }
        csv.push_str(&format!(",{}\n", row.final_grade));
    }
    csv
}

/// Plain-text grade report for one student, handed to the mail shell as-is.
fn email_body_for(model: &calc::SubjectGradebook, row: &calc::StudentRow) -> String {
    let mut body = format!(
        "Grade report for {} — {} ({})\n\nEvaluations:\n",
        row.name, model.subject.name, model.subject.period_label
    );
    for (i, e) in model.evaluations.iter().enumerate() {
        let value = match row.scores.get(i).copied().flatten() {
            Some(v) => format!("{} / 20", v),
            None => "not graded".to_string(),
        };
        body.push_str(&format!(
            "  [Corte {}] {} ({}%): {}\n",
            e.corte, e.name, e.percentage, value
        ));
    }
    body.push_str("\nCorte summary:\n");
    for breakdown in &row.cortes {
        let assigned = model
            .corte_totals
            .iter()
            .find(|t| t.corte == breakdown.corte)
            .map(|t| t.percentage_total);
        match assigned {
            Some(total) => body.push_str(&format!(
                "  Corte {}: accumulated {}, on the 0-20 scale {} ({}% assigned)\n",
                breakdown.corte, breakdown.weighted_sum, breakdown.normalized_grade, total
            )),
            None => body.push_str(&format!(
                "  Corte {}: no evaluations yet\n",
                breakdown.corte
            )),
        }
    }
    body.push_str(&format!("\nFinal grade: {} / 20\n", row.final_grade));
    body
}

fn handle_reports_subject_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let model = match load_gradebook(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let entries: Vec<calc::ScoreEntry> = model
        .students
        .iter()
        .map(|row| calc::ScoreEntry {
            label: row.name.clone(),
            score: row.final_grade,
        })
        .collect();
    let stats = calc::compute_statistics(&entries);

    ok(
        &req.id,
        json!({
            "subject": model.subject,
            "scope": "final",
            "stats": stats
        }),
    )
}

fn handle_reports_corte_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let corte = match req.params.get("corte").and_then(|v| v.as_i64()) {
        Some(c) if calc::CORTES.contains(&c) => c,
        _ => return err(&req.id, "bad_params", "corte must be 1, 2 or 3", None),
    };

    let model = match load_gradebook(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let entries: Vec<calc::ScoreEntry> = model
        .students
        .iter()
        .map(|row| {
            let grade = row
                .cortes
                .iter()
                .find(|b| b.corte == corte)
                .map(|b| b.normalized_grade)
                .unwrap_or(0.0);
            calc::ScoreEntry {
                label: row.name.clone(),
                score: grade,
            }
        })
        .collect();
    let stats = calc::compute_statistics(&entries);

    ok(
        &req.id,
        json!({
            "subject": model.subject,
            "scope": "corte",
            "corte": corte,
            "stats": stats
        }),
    )
}

fn handle_reports_export_csv(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };
    let out_path = match required_str(req, "outPath") {
        Ok(v) => PathBuf::from(v),
        Err(e) => return e,
    };

    let model = match load_gradebook(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let csv = gradebook_to_csv(&model);
    if let Err(e) = write_text_file(&out_path, &csv) {
        return err(
            &req.id,
            "file_write_failed",
            e.to_string(),
            Some(json!({ "path": out_path.to_string_lossy() })),
        );
    }

    ok(
        &req.id,
        json!({
            "ok": true,
            "rowsExported": model.students.len(),
            "path": out_path.to_string_lossy()
        }),
    )
}

fn handle_reports_email_bodies(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(v) => v,
        Err(e) => return e,
    };
    let subject_id = match required_str(req, "subjectId") {
        Ok(v) => v,
        Err(e) => return e,
    };

    let model = match load_gradebook(conn, &subject_id) {
        Ok(v) => v,
        Err(e) => return calc_err(req, e),
    };

    let subject_line = format!(
        "Grades — {} ({})",
        model.subject.name, model.subject.period_label
    );
    let messages: Vec<serde_json::Value> = model
        .students
        .iter()
        .map(|row| {
            json!({
                "studentId": row.student_id,
                "email": row.email,
                "subjectLine": subject_line,
                "body": email_body_for(&model, row)
            })
        })
        .collect();

    ok(&req.id, json!({ "messages": messages }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.subjectStats" => Some(handle_reports_subject_stats(state, req)),
        "reports.corteStats" => Some(handle_reports_corte_stats(state, req)),
        "reports.exportCsv" => Some(handle_reports_export_csv(state, req)),
        "reports.emailBodies" => Some(handle_reports_email_bodies(state, req)),
        _ => None,
    }
}
