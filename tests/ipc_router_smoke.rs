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
    let exe = env!("CARGO_BIN_EXE_campusd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn campusd");
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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("campus-router-smoke");
    let bundle_out = workspace.join("smoke-backup.campusbackup.zip");
    let csv_out = workspace.join("smoke-evaluations.csv");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(&mut stdin, &mut reader, "1", "health", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let created_teacher = request(
        &mut stdin,
        &mut reader,
        "3",
        "teachers.create",
        json!({ "lastName": "Smoke", "firstName": "Teacher" }),
    );
    let teacher_id = created_teacher
        .get("result")
        .and_then(|v| v.get("teacherId"))
        .and_then(|v| v.as_str())
        .expect("teacherId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "4", "teachers.list", json!({}));

    let created_student = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.create",
        json!({ "lastName": "Smoke", "firstName": "Student" }),
    );
    let student_id = created_student
        .get("result")
        .and_then(|v| v.get("studentId"))
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "6", "students.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "6a",
        "students.get",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "6b",
        "students.update",
        json!({ "studentId": student_id, "patch": { "firstName": "Updated" } }),
    );

    let created_assessment = request(
        &mut stdin,
        &mut reader,
        "7",
        "assessments.create",
        json!({ "teacherId": teacher_id, "title": "Smoke Essay", "totalMarks": 10.0 }),
    );
    let assessment_id = created_assessment
        .get("result")
        .and_then(|v| v.get("assessmentId"))
        .and_then(|v| v.as_str())
        .expect("assessmentId")
        .to_string();
    let _ = request(&mut stdin, &mut reader, "8", "assessments.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "8a",
        "assessments.get",
        json!({ "assessmentId": assessment_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "rubric.criteria.create",
        json!({
            "assessmentId": assessment_id,
            "title": "Content",
            "weightPercentage": 100.0,
            "levels": [
                { "name": "Full", "points": 4.0 },
                { "name": "Half", "points": 2.0 }
            ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "10",
        "rubric.get",
        json!({ "assessmentId": assessment_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "assessments.publish",
        json!({ "assessmentId": assessment_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "scoring.preview",
        json!({
            "totalMarks": 10.0,
            "criteria": [
                { "weightPercentage": 100.0, "selectedLevelPercentage": 50.0 }
            ]
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "13",
        "evaluations.list",
        json!({ "assessmentId": assessment_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "evaluations.stats",
        json!({ "assessmentId": assessment_id }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "15",
        "fees.create",
        json!({ "studentId": student_id, "title": "Lab fee", "amount": 25.0 }),
    );
    let _ = request(&mut stdin, &mut reader, "16", "fees.list", json!({}));

    let created_posting = request(
        &mut stdin,
        &mut reader,
        "17",
        "placements.postings.create",
        json!({ "company": "Acme", "title": "Intern" }),
    );
    let posting_id = created_posting
        .get("result")
        .and_then(|v| v.get("postingId"))
        .and_then(|v| v.as_str())
        .expect("postingId")
        .to_string();
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "placements.postings.list",
        json!({}),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "placements.apply",
        json!({ "postingId": posting_id, "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "placements.applications.list",
        json!({ "postingId": posting_id }),
    );

    let _ = request(&mut stdin, &mut reader, "21", "setup.get", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "setup.update",
        json!({ "section": "grading", "patch": { "showLevelPercents": true } }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "23",
        "backup.exportWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "outPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "24",
        "backup.importWorkspaceBundle",
        json!({
            "workspacePath": workspace.to_string_lossy(),
            "inPath": bundle_out.to_string_lossy()
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "exchange.exportEvaluationsCsv",
        json!({
            "assessmentId": assessment_id,
            "outPath": csv_out.to_string_lossy()
        }),
    );

    writeln!(
        stdin,
        "{}",
        json!({ "id": "26", "method": "unknown.method", "params": {} })
    )
    .expect("write unknown method");
    stdin.flush().expect("flush unknown method");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read unknown response");
    let unknown: serde_json::Value =
        serde_json::from_str(line.trim()).expect("parse unknown response");
    assert_eq!(unknown.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        unknown.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
