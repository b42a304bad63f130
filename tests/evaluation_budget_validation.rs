use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_gradebookd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn gradebookd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    value
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> &str {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn evaluation_count(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    subject_id: &str,
) -> usize {
    let listed = request_ok(
        stdin,
        reader,
        id,
        "evaluations.list",
        json!({ "subjectId": subject_id }),
    );
    listed
        .get("evaluations")
        .and_then(|v| v.as_array())
        .map(|v| v.len())
        .unwrap_or(0)
}

#[test]
fn corte_budget_rejections_and_self_exclusion() {
    let workspace = temp_dir("gradebook-budget");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Algebra", "periodLabel": "2026-1" }),
    );
    let subject_id = created
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let quiz = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "evaluations.create",
        json!({ "subjectId": subject_id, "corte": 1, "name": "Quiz", "percentage": 20.0 }),
    );
    let quiz_id = quiz
        .get("evaluationId")
        .and_then(|v| v.as_str())
        .expect("evaluationId")
        .to_string();

    // Corte 1 caps at 30%; adding 25% on top of 20% must be rejected and
    // must leave the stored evaluation set unchanged.
    let rejected = request(
        &mut stdin,
        &mut reader,
        "4",
        "evaluations.create",
        json!({ "subjectId": subject_id, "corte": 1, "name": "Taller", "percentage": 25.0 }),
    );
    assert_eq!(rejected.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&rejected), "corte_budget_exceeded");
    let remaining = rejected
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("remaining"))
        .and_then(|v| v.as_f64())
        .expect("details.remaining");
    assert!((remaining - 10.0).abs() < 1e-9);
    assert_eq!(
        evaluation_count(&mut stdin, &mut reader, "5", &subject_id),
        1
    );

    // Editing the quiz must not double-count its own 20%.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "evaluations.update",
        json!({
            "subjectId": subject_id,
            "evaluationId": quiz_id,
            "patch": { "percentage": 25.0 }
        }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "evaluations.update",
        json!({
            "subjectId": subject_id,
            "evaluationId": quiz_id,
            "patch": { "percentage": 20.0 }
        }),
    );

    // Back at 20%: pushing the edit past the cap reports 10% headroom.
    let over_cap = request(
        &mut stdin,
        &mut reader,
        "8",
        "evaluations.update",
        json!({
            "subjectId": subject_id,
            "evaluationId": quiz_id,
            "patch": { "percentage": 35.0 }
        }),
    );
    assert_eq!(over_cap.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(error_code(&over_cap), "corte_budget_exceeded");
    let remaining = over_cap
        .get("error")
        .and_then(|e| e.get("details"))
        .and_then(|d| d.get("remaining"))
        .and_then(|v| v.as_f64())
        .expect("details.remaining");
    assert!((remaining - 10.0).abs() < 1e-9);
    let message = over_cap
        .get("error")
        .and_then(|e| e.get("message"))
        .and_then(|v| v.as_str())
        .expect("error.message");
    assert!(message.contains("10"), "message should report headroom: {}", message);

    // The rejected edit must not have been committed.
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "evaluations.list",
        json!({ "subjectId": subject_id }),
    );
    let stored_percentage = listed
        .get("evaluations")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .and_then(|e| e.get("percentage"))
        .and_then(|v| v.as_f64())
        .expect("stored percentage");
    assert!((stored_percentage - 20.0).abs() < 1e-9);

    drop(stdin);
    let _ = child.wait();
}

#[test]
fn missing_fields_and_bad_percentages_are_rejected() {
    let workspace = temp_dir("gradebook-budget-fields");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "subjects.create",
        json!({ "name": "Quimica", "periodLabel": "2026-1" }),
    );
    let subject_id = created
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let blank_name = request(
        &mut stdin,
        &mut reader,
        "3",
        "evaluations.create",
        json!({ "subjectId": subject_id, "corte": 1, "name": "   ", "percentage": 10.0 }),
    );
    assert_eq!(error_code(&blank_name), "missing_field");

    let no_percentage = request(
        &mut stdin,
        &mut reader,
        "4",
        "evaluations.create",
        json!({ "subjectId": subject_id, "corte": 1, "name": "Quiz" }),
    );
    assert_eq!(error_code(&no_percentage), "missing_field");

    let zero_percentage = request(
        &mut stdin,
        &mut reader,
        "5",
        "evaluations.create",
        json!({ "subjectId": subject_id, "corte": 1, "name": "Quiz", "percentage": 0.0 }),
    );
    assert_eq!(error_code(&zero_percentage), "invalid_percentage");

    assert_eq!(
        evaluation_count(&mut stdin, &mut reader, "6", &subject_id),
        0
    );

    drop(stdin);
    let _ = child.wait();
}
