use crate::ipc::error::err;
use crate::ipc::types::{AppState, Request};
use chrono::NaiveDate;
use rusqlite::{Connection, OptionalExtension};
use std::time::{SystemTime, UNIX_EPOCH};

pub fn db_conn<'a>(state: &'a AppState, req: &Request) -> Result<&'a Connection, serde_json::Value> {
    state
        .db
        .as_ref()
        .ok_or_else(|| err(&req.id, "no_workspace", "select a workspace first", None))
}

pub fn required_str(req: &Request, key: &str) -> Result<String, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|v| v.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing {}", key), None))
}

pub fn required_f64(req: &Request, key: &str) -> Result<f64, serde_json::Value> {
    req.params
        .get(key)
        .and_then(|v| v.as_f64())
        .ok_or_else(|| err(&req.id, "bad_params", format!("missing/invalid {}", key), None))
}

pub fn optional_str(req: &Request, key: &str) -> Option<String> {
    req.params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn optional_bool(req: &Request, key: &str) -> Option<bool> {
    req.params.get(key).and_then(|v| v.as_bool())
}

pub fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

/// Validates and canonicalizes a calendar field as `%Y-%m-%d`.
pub fn parse_iso_date(raw: &str) -> Result<String, String> {
    let trimmed = raw.trim();
    match NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        Ok(date) => Ok(date.format("%Y-%m-%d").to_string()),
        Err(_) => Err(format!("'{}' is not a valid YYYY-MM-DD date", trimmed)),
    }
}

pub fn today_iso() -> String {
    chrono::Local::now().date_naive().format("%Y-%m-%d").to_string()
}

pub fn student_exists(conn: &Connection, student_id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT 1 FROM students WHERE id = ? LIMIT 1",
        [student_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

pub fn teacher_exists(conn: &Connection, teacher_id: &str) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT 1 FROM teachers WHERE id = ? LIMIT 1",
        [teacher_id],
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
}

#[derive(Debug, Clone)]
pub struct AssessmentRow {
    pub id: String,
    pub teacher_id: String,
    pub title: String,
    pub subject: Option<String>,
    pub total_marks: f64,
    pub status: String,
}

pub fn get_assessment(
    conn: &Connection,
    assessment_id: &str,
) -> Result<Option<AssessmentRow>, rusqlite::Error> {
    conn.query_row(
        "SELECT id, teacher_id, title, subject, total_marks, status
         FROM assessments
         WHERE id = ?",
        [assessment_id],
        |r| {
            Ok(AssessmentRow {
                id: r.get(0)?,
                teacher_id: r.get(1)?,
                title: r.get(2)?,
                subject: r.get(3)?,
                total_marks: r.get(4)?,
                status: r.get(5)?,
            })
        },
    )
    .optional()
}
