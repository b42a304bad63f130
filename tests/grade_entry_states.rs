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

fn request_ok(
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
    assert!(
        value.get("ok").and_then(|v| v.as_bool()).unwrap_or(false),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn first_row(model: &serde_json::Value) -> serde_json::Value {
    model
        .get("students")
        .and_then(|v| v.as_array())
        .and_then(|v| v.first())
        .cloned()
        .expect("student row")
}

#[test]
fn scores_clamp_and_zero_stays_distinct_from_not_graded() {
    let workspace = temp_dir("gradebook-entry-states");
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
        json!({ "name": "Historia", "periodLabel": "2026-1" }),
    );
    let subject_id = created
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "nationalId": "V-010", "name": "Carla", "email": "carla@example.com" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.enroll",
        json!({ "subjectId": subject_id, "studentId": student_id }),
    );
    let quiz = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "evaluations.create",
        json!({ "subjectId": subject_id, "corte": 1, "name": "Quiz", "percentage": 30.0 }),
    );
    let quiz_id = quiz
        .get("evaluationId")
        .and_then(|v| v.as_str())
        .expect("evaluationId")
        .to_string();

    // Out-of-range input clamps onto the 0-20 scale instead of failing.
    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "grades.update",
        json!({
            "subjectId": subject_id,
            "evaluationId": quiz_id,
            "studentId": student_id,
            "score": 25.0
        }),
    );
    assert_eq!(updated.get("score").and_then(|v| v.as_f64()), Some(20.0));

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "grades.update",
        json!({
            "subjectId": subject_id,
            "evaluationId": quiz_id,
            "studentId": student_id,
            "score": -3.0
        }),
    );
    assert_eq!(updated.get("score").and_then(|v| v.as_f64()), Some(0.0));

    // An explicit zero is a graded cell.
    let model = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "grades.get",
        json!({ "subjectId": subject_id }),
    );
    let row = first_row(&model);
    assert_eq!(
        row.get("scores").and_then(|v| v.as_array()).expect("scores")[0].as_f64(),
        Some(0.0)
    );
    assert_eq!(row.get("gradedCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(row.get("notGradedCount").and_then(|v| v.as_u64()), Some(0));

    // Writing null clears the cell back to not-graded.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "grades.update",
        json!({
            "subjectId": subject_id,
            "evaluationId": quiz_id,
            "studentId": student_id,
            "score": null
        }),
    );
    let model = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "grades.get",
        json!({ "subjectId": subject_id }),
    );
    let row = first_row(&model);
    assert!(row.get("scores").and_then(|v| v.as_array()).expect("scores")[0].is_null());
    assert_eq!(row.get("gradedCount").and_then(|v| v.as_u64()), Some(0));
    assert_eq!(row.get("notGradedCount").and_then(|v| v.as_u64()), Some(1));

    // Both states produce the same weighted sums; only the tallies differ.
    let cortes = row.get("cortes").and_then(|v| v.as_array()).expect("cortes");
    assert_eq!(cortes[0].get("weightedSum").and_then(|v| v.as_f64()), Some(0.0));
    assert_eq!(
        row.get("finalGrade").and_then(|v| v.as_f64()),
        Some(0.0)
    );

    drop(stdin);
    let _ = child.wait();
}
