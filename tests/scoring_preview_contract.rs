use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

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

// scoring.preview is a pure calculation; no workspace is ever selected here.
#[test]
fn preview_scores_without_a_workspace() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let result = request_ok(
        &mut stdin,
        &mut reader,
        "1",
        "scoring.preview",
        json!({
            "totalMarks": 10.0,
            "criteria": [
                { "weightPercentage": 50.0, "selectedLevelPercentage": 75.0 },
                { "weightPercentage": 30.0, "selectedLevelPercentage": 100.0 },
                { "weightPercentage": 20.0, "selectedLevelPercentage": 50.0 }
            ]
        }),
    );
    assert_eq!(result.get("totalScore").and_then(|v| v.as_f64()), Some(7.75));
    assert_eq!(result.get("outOf").and_then(|v| v.as_f64()), Some(10.0));
    let breakdown = result
        .get("breakdown")
        .and_then(|v| v.as_array())
        .expect("breakdown");
    assert_eq!(breakdown.len(), 3);
    assert_eq!(
        breakdown[0].get("weightPercentage").and_then(|v| v.as_f64()),
        Some(50.0)
    );
    assert_eq!(
        breakdown[0].get("contribution").and_then(|v| v.as_f64()),
        Some(3.75)
    );

    // Same input, same output.
    let again = request_ok(
        &mut stdin,
        &mut reader,
        "2",
        "scoring.preview",
        json!({
            "totalMarks": 10.0,
            "criteria": [
                { "weightPercentage": 50.0, "selectedLevelPercentage": 75.0 },
                { "weightPercentage": 30.0, "selectedLevelPercentage": 100.0 },
                { "weightPercentage": 20.0, "selectedLevelPercentage": 50.0 }
            ]
        }),
    );
    assert_eq!(result, again);
}

#[test]
fn preview_rejects_bad_weights_and_bad_params() {
    let (_child, mut stdin, mut reader) = spawn_sidecar();

    let short = request(
        &mut stdin,
        &mut reader,
        "1",
        "scoring.preview",
        json!({
            "totalMarks": 10.0,
            "criteria": [
                { "weightPercentage": 50.0, "selectedLevelPercentage": 75.0 },
                { "weightPercentage": 40.0, "selectedLevelPercentage": 100.0 }
            ]
        }),
    );
    assert_eq!(short.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert_eq!(
        short.pointer("/error/code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );
    assert!(
        short
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|m| m.contains("got 90"))
            .unwrap_or(false),
        "unexpected message: {}",
        short
    );
    assert_eq!(
        short.pointer("/error/details/totalWeight").and_then(|v| v.as_f64()),
        Some(90.0)
    );

    let empty = request(
        &mut stdin,
        &mut reader,
        "2",
        "scoring.preview",
        json!({ "totalMarks": 10.0, "criteria": [] }),
    );
    assert_eq!(
        empty.pointer("/error/code").and_then(|v| v.as_str()),
        Some("validation_failed")
    );
    assert_eq!(
        empty.pointer("/error/details/totalWeight").and_then(|v| v.as_f64()),
        Some(0.0)
    );

    let no_marks = request(
        &mut stdin,
        &mut reader,
        "3",
        "scoring.preview",
        json!({
            "criteria": [
                { "weightPercentage": 100.0, "selectedLevelPercentage": 50.0 }
            ]
        }),
    );
    assert_eq!(
        no_marks.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );

    let malformed = request(
        &mut stdin,
        &mut reader,
        "4",
        "scoring.preview",
        json!({
            "totalMarks": 10.0,
            "criteria": [ { "weight": 50.0 } ]
        }),
    );
    assert_eq!(
        malformed.pointer("/error/code").and_then(|v| v.as_str()),
        Some("bad_params")
    );
    assert!(
        malformed
            .pointer("/error/message")
            .and_then(|v| v.as_str())
            .map(|m| m.starts_with("invalid criteria"))
            .unwrap_or(false),
        "unexpected message: {}",
        malformed
    );
}
