use super::setup;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, now_ts, optional_bool, optional_str, parse_iso_date, required_str, student_exists,
    today_iso,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

const APPLICATION_STATUSES: [&str; 5] =
    ["applied", "shortlisted", "hired", "rejected", "withdrawn"];

fn transition_allowed(from: &str, to: &str) -> bool {
    matches!(
        (from, to),
        ("applied", "shortlisted")
            | ("applied", "rejected")
            | ("applied", "withdrawn")
            | ("shortlisted", "hired")
            | ("shortlisted", "rejected")
            | ("shortlisted", "withdrawn")
    )
}

fn handle_postings_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let active_only = optional_bool(req, "activeOnly").unwrap_or(false);
    let mut sql = String::from(
        "SELECT p.id, p.company, p.title, p.description, p.location, p.deadline, p.active,
                p.created_at,
                (SELECT COUNT(*) FROM job_applications a WHERE a.posting_id = p.id)
         FROM job_postings p",
    );
    if active_only {
        sql.push_str(" WHERE p.active = 1");
    }
    sql.push_str(" ORDER BY p.created_at, p.company");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let company: String = r.get(1)?;
            let title: String = r.get(2)?;
            let description: Option<String> = r.get(3)?;
            let location: Option<String> = r.get(4)?;
            let deadline: Option<String> = r.get(5)?;
            let active: i64 = r.get(6)?;
            let created_at: Option<String> = r.get(7)?;
            let application_count: i64 = r.get(8)?;
            Ok(json!({
                "id": id,
                "company": company,
                "title": title,
                "description": description,
                "location": location,
                "deadline": deadline,
                "active": active != 0,
                "createdAt": created_at,
                "applicationCount": application_count
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(postings) => ok(&req.id, json!({ "postings": postings })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_postings_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let company = match required_str(req, "company") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let description = optional_str(req, "description");
    let location = optional_str(req, "location");
    let deadline = match optional_str(req, "deadline") {
        Some(raw) => match parse_iso_date(&raw) {
            Ok(d) => Some(d),
            Err(msg) => return err(&req.id, "bad_params", msg, None),
        },
        None => None,
    };

    let posting_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO job_postings(id, company, title, description, location, deadline, active, created_at)
         VALUES(?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &posting_id,
            &company,
            &title,
            &description,
            &location,
            &deadline,
            now_ts(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "job_postings" })),
        );
    }

    ok(&req.id, json!({ "postingId": posting_id }))
}

fn handle_postings_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let posting_id = match required_str(req, "postingId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (key, column) in [("company", "company"), ("title", "title")] {
        if let Some(v) = patch.get(key) {
            let Some(s) = v.as_str() else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a string", key),
                    None,
                );
            };
            let s = s.trim().to_string();
            if s.is_empty() {
                return err(
                    &req.id,
                    "bad_params",
                    format!("{} must not be empty", key),
                    None,
                );
            }
            set_parts.push(format!("{} = ?", column));
            bind_values.push(Value::Text(s));
        }
    }
    for (key, column) in [("description", "description"), ("location", "location")] {
        if let Some(v) = patch.get(key) {
            if v.is_null() {
                set_parts.push(format!("{} = ?", column));
                bind_values.push(Value::Null);
            } else if let Some(s) = v.as_str() {
                let s = s.trim().to_string();
                set_parts.push(format!("{} = ?", column));
                bind_values.push(if s.is_empty() { Value::Null } else { Value::Text(s) });
            } else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("patch.{} must be a string or null", key),
                    None,
                );
            }
        }
    }
    if let Some(v) = patch.get("deadline") {
        if v.is_null() {
            set_parts.push("deadline = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            match parse_iso_date(s) {
                Ok(d) => {
                    set_parts.push("deadline = ?".into());
                    bind_values.push(Value::Text(d));
                }
                Err(msg) => return err(&req.id, "bad_params", msg, None),
            }
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.deadline must be a string or null",
                None,
            );
        }
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    let sql = format!("UPDATE job_postings SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(posting_id));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "job_postings" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "posting not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_postings_close(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let posting_id = match required_str(req, "postingId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let active: Option<i64> = match conn
        .query_row(
            "SELECT active FROM job_postings WHERE id = ?",
            [&posting_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(active) = active else {
        return err(&req.id, "not_found", "posting not found", None);
    };
    if active == 0 {
        return err(&req.id, "conflict", "posting is already closed", None);
    }

    if let Err(e) = conn.execute(
        "UPDATE job_postings SET active = 0 WHERE id = ?",
        [&posting_id],
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "job_postings" })),
        );
    }

    info!(posting = %posting_id, "posting closed");
    ok(&req.id, json!({ "ok": true }))
}

fn handle_apply(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let posting_id = match required_str(req, "postingId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let note = optional_str(req, "note");

    let posting: Option<(i64, Option<String>)> = match conn
        .query_row(
            "SELECT active, deadline FROM job_postings WHERE id = ?",
            [&posting_id],
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((active, deadline)) = posting else {
        return err(&req.id, "not_found", "posting not found", None);
    };
    if active == 0 {
        return err(&req.id, "conflict", "posting is closed", None);
    }
    let placements_cfg = setup::placements_config(conn);
    if let Some(deadline) = deadline.as_deref() {
        // ISO dates order lexicographically.
        if today_iso().as_str() > deadline {
            if placements_cfg.auto_close_after_deadline {
                let _ = conn.execute(
                    "UPDATE job_postings SET active = 0 WHERE id = ?",
                    [&posting_id],
                );
            }
            return err(
                &req.id,
                "conflict",
                "posting deadline has passed",
                Some(json!({ "deadline": deadline })),
            );
        }
    }

    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let active_applications: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM job_applications
         WHERE student_id = ? AND status IN ('applied', 'shortlisted')",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if active_applications >= placements_cfg.max_active_applications_per_student {
        return err(
            &req.id,
            "conflict",
            "student has reached the active application limit",
            Some(json!({ "limit": placements_cfg.max_active_applications_per_student })),
        );
    }

    let already = match conn
        .query_row(
            "SELECT 1 FROM job_applications WHERE posting_id = ? AND student_id = ? LIMIT 1",
            (&posting_id, &student_id),
            |r| r.get::<_, i64>(0),
        )
        .optional()
    {
        Ok(v) => v.is_some(),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if already {
        return err(
            &req.id,
            "conflict",
            "student has already applied to this posting",
            None,
        );
    }

    let application_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO job_applications(id, posting_id, student_id, status, note, applied_at, updated_at)
         VALUES(?, ?, ?, 'applied', ?, ?, ?)",
        (&application_id, &posting_id, &student_id, &note, &ts, &ts),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "job_applications" })),
        );
    }

    ok(&req.id, json!({ "applicationId": application_id }))
}

fn handle_applications_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let posting_id = optional_str(req, "postingId");
    let student_id = optional_str(req, "studentId");
    let status = optional_str(req, "status");
    if let Some(s) = status.as_deref() {
        if !APPLICATION_STATUSES.contains(&s) {
            return err(
                &req.id,
                "bad_params",
                format!("unknown application status: {}", s),
                None,
            );
        }
    }

    let mut sql = String::from(
        "SELECT a.id, a.posting_id, p.company, p.title, a.student_id,
                s.last_name, s.first_name, a.status, a.note, a.applied_at, a.updated_at
         FROM job_applications a
         JOIN job_postings p ON p.id = a.posting_id
         JOIN students s ON s.id = a.student_id",
    );
    let mut where_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(pid) = posting_id {
        where_parts.push("a.posting_id = ?");
        bind_values.push(Value::Text(pid));
    }
    if let Some(sid) = student_id {
        where_parts.push("a.student_id = ?");
        bind_values.push(Value::Text(sid));
    }
    if let Some(st) = status {
        where_parts.push("a.status = ?");
        bind_values.push(Value::Text(st));
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY a.applied_at, s.last_name, s.first_name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |r| {
            let id: String = r.get(0)?;
            let posting_id: String = r.get(1)?;
            let company: String = r.get(2)?;
            let posting_title: String = r.get(3)?;
            let student_id: String = r.get(4)?;
            let last_name: String = r.get(5)?;
            let first_name: String = r.get(6)?;
            let status: String = r.get(7)?;
            let note: Option<String> = r.get(8)?;
            let applied_at: Option<String> = r.get(9)?;
            let updated_at: Option<String> = r.get(10)?;
            Ok(json!({
                "id": id,
                "postingId": posting_id,
                "company": company,
                "postingTitle": posting_title,
                "studentId": student_id,
                "studentName": format!("{}, {}", last_name, first_name),
                "status": status,
                "note": note,
                "appliedAt": applied_at,
                "updatedAt": updated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(applications) => ok(&req.id, json!({ "applications": applications })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_applications_set_status(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let application_id = match required_str(req, "applicationId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let status = match required_str(req, "status") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !APPLICATION_STATUSES.contains(&status.as_str()) {
        return err(
            &req.id,
            "bad_params",
            format!("unknown application status: {}", status),
            None,
        );
    }

    let current: Option<String> = match conn
        .query_row(
            "SELECT status FROM job_applications WHERE id = ?",
            [&application_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(current) = current else {
        return err(&req.id, "not_found", "application not found", None);
    };

    if !transition_allowed(&current, &status) {
        return err(
            &req.id,
            "validation_failed",
            format!("cannot move application from {} to {}", current, status),
            Some(json!({ "from": current, "to": status })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE job_applications SET status = ?, updated_at = ? WHERE id = ?",
        (&status, now_ts(), &application_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "job_applications" })),
        );
    }

    info!(application = %application_id, from = %current, to = %status, "application status changed");
    ok(&req.id, json!({ "ok": true, "status": status }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "placements.postings.list" => Some(handle_postings_list(state, req)),
        "placements.postings.create" => Some(handle_postings_create(state, req)),
        "placements.postings.update" => Some(handle_postings_update(state, req)),
        "placements.postings.close" => Some(handle_postings_close(state, req)),
        "placements.apply" => Some(handle_apply(state, req)),
        "placements.applications.list" => Some(handle_applications_list(state, req)),
        "placements.applications.setStatus" => Some(handle_applications_set_status(state, req)),
        _ => None,
    }
}
