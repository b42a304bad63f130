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

fn gradebook(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    subject_id: &str,
) -> serde_json::Value {
    request_ok(
        stdin,
        reader,
        id,
        "grades.get",
        json!({ "subjectId": subject_id }),
    )
}

#[test]
fn enroll_and_add_evaluation_materialize_placeholder_rows() {
    let workspace = temp_dir("gradebook-cascade");
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
        json!({ "name": "Fisica", "periodLabel": "2026-1" }),
    );
    let subject_id = created
        .get("subjectId")
        .and_then(|v| v.as_str())
        .expect("subjectId")
        .to_string();

    let ana = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "nationalId": "V-001", "name": "Ana", "email": "ana@example.com" }),
    );
    let ana_id = ana
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    // Enrolling into a subject with no evaluations creates no grade rows.
    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "enrollments.enroll",
        json!({ "subjectId": subject_id, "studentId": ana_id }),
    );
    assert_eq!(
        enrolled.get("gradeRowsCreated").and_then(|v| v.as_u64()),
        Some(0)
    );

    // Adding an evaluation materializes one not-graded cell for Ana.
    let quiz = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "evaluations.create",
        json!({ "subjectId": subject_id, "corte": 1, "name": "Quiz", "percentage": 20.0 }),
    );
    assert_eq!(
        quiz.get("gradeRowsCreated").and_then(|v| v.as_u64()),
        Some(1)
    );
    let quiz_id = quiz
        .get("evaluationId")
        .and_then(|v| v.as_str())
        .expect("evaluationId")
        .to_string();

    let model = gradebook(&mut stdin, &mut reader, "6", &subject_id);
    let students = model
        .get("students")
        .and_then(|v| v.as_array())
        .expect("students");
    assert_eq!(students.len(), 1);
    let row = &students[0];
    assert_eq!(
        row.get("scores").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(1)
    );
    assert!(row.get("scores").and_then(|v| v.as_array()).expect("scores")[0].is_null());
    assert_eq!(row.get("notGradedCount").and_then(|v| v.as_u64()), Some(1));
    assert_eq!(row.get("gradedCount").and_then(|v| v.as_u64()), Some(0));

    // A second enrollment after the fact picks up the existing evaluation.
    let bruno = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "students.create",
        json!({ "nationalId": "V-002", "name": "Bruno", "email": "bruno@example.com" }),
    );
    let bruno_id = bruno
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let enrolled = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "enrollments.enroll",
        json!({ "subjectId": subject_id, "studentId": bruno_id }),
    );
    assert_eq!(
        enrolled.get("gradeRowsCreated").and_then(|v| v.as_u64()),
        Some(1)
    );

    let model = gradebook(&mut stdin, &mut reader, "9", &subject_id);
    assert_eq!(
        model
            .get("students")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(2)
    );

    // Unenrolling removes the student's row entirely.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "enrollments.unenroll",
        json!({ "subjectId": subject_id, "studentId": bruno_id }),
    );
    let model = gradebook(&mut stdin, &mut reader, "11", &subject_id);
    assert_eq!(
        model
            .get("students")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(1)
    );

    // Deleting the evaluation removes its column and cells.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "evaluations.delete",
        json!({ "subjectId": subject_id, "evaluationId": quiz_id }),
    );
    let model = gradebook(&mut stdin, &mut reader, "13", &subject_id);
    assert_eq!(
        model
            .get("evaluations")
            .and_then(|v| v.as_array())
            .map(|v| v.len()),
        Some(0)
    );
    let row = &model.get("students").and_then(|v| v.as_array()).expect("students")[0];
    assert_eq!(
        row.get("scores").and_then(|v| v.as_array()).map(|v| v.len()),
        Some(0)
    );

    drop(stdin);
    let _ = child.wait();
}
