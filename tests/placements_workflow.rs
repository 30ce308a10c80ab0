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

fn create_student(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    last: &str,
    first: &str,
) -> String {
    let result = request_ok(
        stdin,
        reader,
        id,
        "students.create",
        json!({ "lastName": last, "firstName": first }),
    );
    result
        .get("studentId")
        .and_then(|v| v.as_str())
        .expect("studentId")
        .to_string()
}

fn posting_by_id<'a>(postings: &'a serde_json::Value, posting_id: &str) -> &'a serde_json::Value {
    postings
        .get("postings")
        .and_then(|v| v.as_array())
        .and_then(|ps| {
            ps.iter()
                .find(|p| p.get("id").and_then(|i| i.as_str()) == Some(posting_id))
        })
        .unwrap_or_else(|| panic!("posting {} missing from list", posting_id))
}

#[test]
fn applications_follow_the_status_ladder_and_closed_postings_refuse() {
    let workspace = temp_dir("campus-placements-lifecycle");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let alice = create_student(&mut stdin, &mut reader, "2", "Ash", "Alice");
    let bob = create_student(&mut stdin, &mut reader, "3", "Birch", "Bob");

    let bad_deadline = request(
        &mut stdin,
        &mut reader,
        "4",
        "placements.postings.create",
        json!({ "company": "Northwind", "title": "Lab Intern", "deadline": "12/31/2099" }),
    );
    assert_eq!(
        bad_deadline.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let lab = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "placements.postings.create",
        json!({
            "company": "Northwind",
            "title": "Lab Intern",
            "location": "Building 4",
            "deadline": "2099-12-31"
        }),
    );
    let lab_id = lab
        .get("postingId")
        .and_then(|v| v.as_str())
        .expect("postingId")
        .to_string();
    let data = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "placements.postings.create",
        json!({ "company": "Initech", "title": "Data Intern" }),
    );
    let data_id = data
        .get("postingId")
        .and_then(|v| v.as_str())
        .expect("postingId")
        .to_string();

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "placements.apply",
        json!({ "postingId": lab_id, "studentId": alice, "note": "portfolio attached" }),
    );
    let application_id = applied
        .get("applicationId")
        .and_then(|v| v.as_str())
        .expect("applicationId")
        .to_string();

    let duplicate = request(
        &mut stdin,
        &mut reader,
        "8",
        "placements.apply",
        json!({ "postingId": lab_id, "studentId": alice }),
    );
    assert_eq!(
        duplicate.pointer("/error/code").and_then(|v| v.as_str()),
        Some("conflict")
    );
    assert_eq!(
        duplicate.pointer("/error/message").and_then(|v| v.as_str()),
        Some("student has already applied to this posting")
    );

    let shortlisted = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "placements.applications.setStatus",
        json!({ "applicationId": application_id, "status": "shortlisted" }),
    );
    assert_eq!(
        shortlisted.get("status").and_then(|v| v.as_str()),
        Some("shortlisted")
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "placements.applications.setStatus",
        json!({ "applicationId": application_id, "status": "hired" }),
    );

    // hired is terminal.
    let backwards = request(
        &mut stdin,
        &mut reader,
        "11",
        "placements.applications.setStatus",
        json!({ "applicationId": application_id, "status": "applied" }),
    );
    assert_eq!(
        backwards.pointer("/error/code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );
    assert_eq!(
        backwards.pointer("/error/message").and_then(|v| v.as_str()),
        Some("cannot move application from hired to applied")
    );
    assert_eq!(
        backwards.pointer("/error/details/from").and_then(|v| v.as_str()),
        Some("hired")
    );
    assert_eq!(
        backwards.pointer("/error/details/to").and_then(|v| v.as_str()),
        Some("applied")
    );

    let unknown_status = request(
        &mut stdin,
        &mut reader,
        "12",
        "placements.applications.setStatus",
        json!({ "applicationId": application_id, "status": "archived" }),
    );
    assert_eq!(
        unknown_status.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );
    assert_eq!(
        unknown_status.pointer("/error/message").and_then(|v| v.as_str()),
        Some("unknown application status: archived")
    );

    let missing_app = request(
        &mut stdin,
        &mut reader,
        "13",
        "placements.applications.setStatus",
        json!({ "applicationId": "no-such-application", "status": "rejected" }),
    );
    assert_eq!(
        missing_app.pointer("/error/code").and_then(|v| v.as_str()),
        Some("not_found")
    );

    let by_posting = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "placements.applications.list",
        json!({ "postingId": lab_id }),
    );
    let applications = by_posting
        .get("applications")
        .and_then(|v| v.as_array())
        .expect("applications");
    assert_eq!(applications.len(), 1);
    assert_eq!(
        applications[0].get("status").and_then(|v| v.as_str()),
        Some("hired")
    );
    assert_eq!(
        applications[0].get("studentName").and_then(|v| v.as_str()),
        Some("Ash, Alice")
    );
    assert_eq!(
        applications[0].get("company").and_then(|v| v.as_str()),
        Some("Northwind")
    );
    assert_eq!(
        applications[0].get("note").and_then(|v| v.as_str()),
        Some("portfolio attached")
    );

    let hired_only = request_ok(
        &mut stdin,
        &mut reader,
        "15",
        "placements.applications.list",
        json!({ "status": "hired" }),
    );
    assert_eq!(
        hired_only
            .get("applications")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );
    let withdrawn_only = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "placements.applications.list",
        json!({ "status": "withdrawn" }),
    );
    assert_eq!(
        withdrawn_only
            .get("applications")
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(0)
    );

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "17",
        "placements.postings.close",
        json!({ "postingId": data_id }),
    );
    let reclose = request(
        &mut stdin,
        &mut reader,
        "18",
        "placements.postings.close",
        json!({ "postingId": data_id }),
    );
    assert_eq!(
        reclose.pointer("/error/code").and_then(|v| v.as_str()),
        Some("conflict")
    );
    assert_eq!(
        reclose.pointer("/error/message").and_then(|v| v.as_str()),
        Some("posting is already closed")
    );
    let closed_apply = request(
        &mut stdin,
        &mut reader,
        "19",
        "placements.apply",
        json!({ "postingId": data_id, "studentId": bob }),
    );
    assert_eq!(
        closed_apply.pointer("/error/message").and_then(|v| v.as_str()),
        Some("posting is closed")
    );

    let all = request_ok(
        &mut stdin,
        &mut reader,
        "20",
        "placements.postings.list",
        json!({}),
    );
    assert_eq!(
        all.get("postings").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(2)
    );
    assert_eq!(
        posting_by_id(&all, &lab_id)
            .get("applicationCount")
            .and_then(|v| v.as_i64()),
        Some(1)
    );
    assert_eq!(
        posting_by_id(&all, &data_id).get("active").and_then(|v| v.as_bool()),
        Some(false)
    );
    let active_only = request_ok(
        &mut stdin,
        &mut reader,
        "21",
        "placements.postings.list",
        json!({ "activeOnly": true }),
    );
    let active_postings = active_only
        .get("postings")
        .and_then(|v| v.as_array())
        .expect("postings");
    assert_eq!(active_postings.len(), 1);
    assert_eq!(
        active_postings[0].get("id").and_then(|v| v.as_str()),
        Some(lab_id.as_str())
    );

    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn application_limit_counts_only_active_and_deadlines_auto_close() {
    let workspace = temp_dir("campus-placements-limits");
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let bob = create_student(&mut stdin, &mut reader, "2", "Birch", "Bob");
    let cara = create_student(&mut stdin, &mut reader, "3", "Cole", "Cara");
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "4",
        "setup.update",
        json!({ "section": "placements", "patch": { "maxActiveApplicationsPerStudent": 1 } }),
    );

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "5",
        "placements.postings.create",
        json!({ "company": "Northwind", "title": "Lab Intern" }),
    );
    let first_id = first
        .get("postingId")
        .and_then(|v| v.as_str())
        .expect("postingId")
        .to_string();
    let second = request_ok(
        &mut stdin,
        &mut reader,
        "6",
        "placements.postings.create",
        json!({ "company": "Initech", "title": "Data Intern" }),
    );
    let second_id = second
        .get("postingId")
        .and_then(|v| v.as_str())
        .expect("postingId")
        .to_string();

    let applied = request_ok(
        &mut stdin,
        &mut reader,
        "7",
        "placements.apply",
        json!({ "postingId": first_id, "studentId": bob }),
    );
    let application_id = applied
        .get("applicationId")
        .and_then(|v| v.as_str())
        .expect("applicationId")
        .to_string();

    let limited = request(
        &mut stdin,
        &mut reader,
        "8",
        "placements.apply",
        json!({ "postingId": second_id, "studentId": bob }),
    );
    assert_eq!(
        limited.pointer("/error/code").and_then(|v| v.as_str()),
        Some("conflict")
    );
    assert_eq!(
        limited.pointer("/error/message").and_then(|v| v.as_str()),
        Some("student has reached the active application limit")
    );
    assert_eq!(
        limited.pointer("/error/details/limit").and_then(|v| v.as_i64()),
        Some(1)
    );

    // A rejected application frees the slot.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "9",
        "placements.applications.setStatus",
        json!({ "applicationId": application_id, "status": "rejected" }),
    );
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "10",
        "placements.apply",
        json!({ "postingId": second_id, "studentId": bob }),
    );

    let expired = request_ok(
        &mut stdin,
        &mut reader,
        "11",
        "placements.postings.create",
        json!({ "company": "Umbrella", "title": "Archivist", "deadline": "2000-01-01" }),
    );
    let expired_id = expired
        .get("postingId")
        .and_then(|v| v.as_str())
        .expect("postingId")
        .to_string();

    let late = request(
        &mut stdin,
        &mut reader,
        "12",
        "placements.apply",
        json!({ "postingId": expired_id, "studentId": cara }),
    );
    assert_eq!(
        late.pointer("/error/code").and_then(|v| v.as_str()),
        Some("conflict")
    );
    assert_eq!(
        late.pointer("/error/message").and_then(|v| v.as_str()),
        Some("posting deadline has passed")
    );
    assert_eq!(
        late.pointer("/error/details/deadline").and_then(|v| v.as_str()),
        Some("2000-01-01")
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "13",
        "placements.postings.list",
        json!({}),
    );
    assert_eq!(
        posting_by_id(&listed, &expired_id)
            .get("active")
            .and_then(|v| v.as_bool()),
        Some(true)
    );

    // With auto-close on, a late application also retires the posting.
    let _ = request_ok(
        &mut stdin,
        &mut reader,
        "14",
        "setup.update",
        json!({ "section": "placements", "patch": { "autoCloseAfterDeadline": true } }),
    );
    let late_again = request(
        &mut stdin,
        &mut reader,
        "15",
        "placements.apply",
        json!({ "postingId": expired_id, "studentId": cara }),
    );
    assert_eq!(
        late_again.pointer("/error/message").and_then(|v| v.as_str()),
        Some("posting deadline has passed")
    );
    let listed = request_ok(
        &mut stdin,
        &mut reader,
        "16",
        "placements.postings.list",
        json!({}),
    );
    assert_eq!(
        posting_by_id(&listed, &expired_id)
            .get("active")
            .and_then(|v| v.as_bool()),
        Some(false)
    );
    let after_close = request(
        &mut stdin,
        &mut reader,
        "17",
        "placements.apply",
        json!({ "postingId": expired_id, "studentId": cara }),
    );
    assert_eq!(
        after_close.pointer("/error/message").and_then(|v| v.as_str()),
        Some("posting is closed")
    );

    let _ = std::fs::remove_dir_all(workspace);
}
