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

fn bad_params_message(resp: &serde_json::Value) -> &str {
    assert_eq!(
        resp.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params"),
        "expected bad_params: {}",
        resp
    );
    resp.pointer("/error/message")
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

#[test]
fn sections_start_with_defaults_and_reject_bad_patches() {
    let workspace = temp_dir("campus-setup-defaults");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let settings = request_ok(&mut stdin, &mut reader, "2", "setup.get", json!({}));
    assert_eq!(
        settings.get("grading"),
        Some(&json!({
            "scoreDecimalPlaces": 2,
            "requirePublishedForEvaluation": true,
            "showLevelPercents": true
        }))
    );
    assert_eq!(
        settings.get("fees"),
        Some(&json!({
            "currency": "USD",
            "receiptPrefix": "RCPT",
            "allowPartialPayments": true
        }))
    );
    assert_eq!(
        settings.get("placements"),
        Some(&json!({
            "maxActiveApplicationsPerStudent": 10,
            "autoCloseAfterDeadline": false
        }))
    );

    // A one-field patch must leave the section's other fields untouched.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "setup.update",
        json!({ "section": "grading", "patch": { "showLevelPercents": false } }),
    );
    let settings = request_ok(&mut stdin, &mut reader, "4", "setup.get", json!({}));
    assert_eq!(
        settings.pointer("/grading/showLevelPercents").and_then(|v| v.as_bool()),
        Some(false)
    );
    assert_eq!(
        settings
            .pointer("/grading/requirePublishedForEvaluation")
            .and_then(|v| v.as_bool()),
        Some(true)
    );
    assert_eq!(
        settings.pointer("/grading/scoreDecimalPlaces").and_then(|v| v.as_i64()),
        Some(2)
    );

    let pinned = request(
        &mut stdin,
        &mut reader,
        "5",
        "setup.update",
        json!({ "section": "grading", "patch": { "scoreDecimalPlaces": 3 } }),
    );
    assert_eq!(bad_params_message(&pinned), "scoreDecimalPlaces is fixed at 2");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "setup.update",
        json!({ "section": "grading", "patch": { "scoreDecimalPlaces": 2 } }),
    );

    let unknown_field = request(
        &mut stdin,
        &mut reader,
        "7",
        "setup.update",
        json!({ "section": "grading", "patch": { "theme": "dark" } }),
    );
    assert_eq!(bad_params_message(&unknown_field), "unknown grading field: theme");

    // Currency normalizes to uppercase; anything but 3 letters is refused.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "setup.update",
        json!({ "section": "fees", "patch": { "currency": "eur" } }),
    );
    let settings = request_ok(&mut stdin, &mut reader, "9", "setup.get", json!({}));
    assert_eq!(
        settings.pointer("/fees/currency").and_then(|v| v.as_str()),
        Some("EUR")
    );
    for (id, bad) in [("10", "toolong"), ("11", "U1")] {
        let resp = request(
            &mut stdin,
            &mut reader,
            id,
            "setup.update",
            json!({ "section": "fees", "patch": { "currency": bad } }),
        );
        assert_eq!(bad_params_message(&resp), "currency must be a 3-letter code");
    }
    let long_prefix = request(
        &mut stdin,
        &mut reader,
        "12",
        "setup.update",
        json!({ "section": "fees", "patch": { "receiptPrefix": "RECEIPTSTAMP" } }),
    );
    assert_eq!(
        bad_params_message(&long_prefix),
        "receiptPrefix length must be <= 10"
    );

    for (id, out_of_range) in [("13", 0), ("14", 51)] {
        let resp = request(
            &mut stdin,
            &mut reader,
            id,
            "setup.update",
            json!({
                "section": "placements",
                "patch": { "maxActiveApplicationsPerStudent": out_of_range }
            }),
        );
        assert_eq!(
            bad_params_message(&resp),
            "maxActiveApplicationsPerStudent must be in 1..=50"
        );
    }
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "setup.update",
        json!({
            "section": "placements",
            "patch": { "maxActiveApplicationsPerStudent": 25 }
        }),
    );
    let settings = request_ok(&mut stdin, &mut reader, "16", "setup.get", json!({}));
    assert_eq!(
        settings
            .pointer("/placements/maxActiveApplicationsPerStudent")
            .and_then(|v| v.as_i64()),
        Some(25)
    );

    let unknown_section = request(
        &mut stdin,
        &mut reader,
        "17",
        "setup.update",
        json!({ "section": "attendance", "patch": { "enabled": true } }),
    );
    assert_eq!(bad_params_message(&unknown_section), "unknown section");

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn every_knob_feeds_back_into_its_module() {
    let workspace = temp_dir("campus-setup-wiring");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "lastName": "Voss", "firstName": "Nils" }),
    );
    let teacher_id = teacher.get("teacherId").and_then(|v| v.as_str()).expect("teacherId");
    let student = request_ok(
        &mut stdin,
        &mut reader,
        "3",
        "students.create",
        json!({ "lastName": "Quinn", "firstName": "Rae" }),
    );
    let student_id = student
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string();

    let assessment = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "assessments.create",
        json!({ "teacherId": teacher_id, "title": "Field Report", "totalMarks": 10.0 }),
    );
    let assessment_id = assessment
        .get("assessmentId")
        .and_then(|v| v.as_str())
        .expect("assessmentId")
        .to_string();
    let criterion = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "rubric.criteria.create",
        json!({
            "assessmentId": assessment_id,
            "title": "Completeness",
            "weightPercentage": 100.0,
            "levels": [ { "name": "Done", "points": 5.0 } ]
        }),
    );
    let criterion_id = criterion
        .get("criterionId")
        .and_then(|v| v.as_str())
        .expect("criterionId")
        .to_string();
    let level_id = criterion
        .pointer("/levelIds/0")
        .and_then(|v| v.as_str())
        .expect("levelIds")
        .to_string();

    let selections = json!([{ "criterionId": criterion_id, "levelId": level_id }]);
    let gated = request(
        &mut stdin,
        &mut reader,
        "6",
        "evaluations.evaluate",
        json!({
            "assessmentId": assessment_id,
            "studentId": student_id,
            "evaluatedBy": "Voss, Nils",
            "selections": selections.clone()
        }),
    );
    assert_eq!(
        gated.pointer("/error/code").and_then(|v| v.as_str()),
        Some("conflict")
    );

    // Draft grading is allowed once the publish gate is switched off.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "setup.update",
        json!({
            "section": "grading",
            "patch": { "requirePublishedForEvaluation": false }
        }),
    );
    let evaluated = request_ok(
        &mut stdin,
        &mut reader,
        "8",
        "evaluations.evaluate",
        json!({
            "assessmentId": assessment_id,
            "studentId": student_id,
            "evaluatedBy": "Voss, Nils",
            "selections": selections
        }),
    );
    assert_eq!(evaluated.get("totalScore").and_then(|v| v.as_f64()), Some(10.0));

    let rubric = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "rubric.get",
        json!({ "assessmentId": assessment_id }),
    );
    assert_eq!(
        rubric.pointer("/criteria/0/levels/0/levelPercent").and_then(|v| v.as_f64()),
        Some(100.0)
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "setup.update",
        json!({ "section": "grading", "patch": { "showLevelPercents": false } }),
    );
    let rubric = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "rubric.get",
        json!({ "assessmentId": assessment_id }),
    );
    let level = rubric
        .pointer("/criteria/0/levels/0")
        .and_then(|v| v.as_object())
        .expect("first level");
    assert!(
        !level.contains_key("levelPercent"),
        "levelPercent still present: {:?}",
        level
    );
    assert_eq!(level.get("name").and_then(|v| v.as_str()), Some("Done"));

    // Receipts pick up the configured prefix.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "12",
        "setup.update",
        json!({ "section": "fees", "patch": { "receiptPrefix": "INV" } }),
    );
    let fee = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "fees.create",
        json!({ "studentId": student_id, "title": "Field Trip", "amount": 20.0 }),
    );
    let fee_id = fee.get("feeId").and_then(|v| v.as_str()).expect("feeId");
    let paid = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "fees.recordPayment",
        json!({ "feeId": fee_id, "amount": 20.0, "method": "cash" }),
    );
    assert_eq!(
        paid.get("receiptNo").and_then(|v| v.as_str()),
        Some("INV-000001")
    );

    let _ = std::fs::remove_dir_all(workspace);
}
