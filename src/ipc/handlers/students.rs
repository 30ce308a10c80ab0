use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_ts, optional_bool, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn student_row_json(row: &rusqlite::Row<'_>) -> Result<serde_json::Value, rusqlite::Error> {
    let id: String = row.get(0)?;
    let last_name: String = row.get(1)?;
    let first_name: String = row.get(2)?;
    let student_no: Option<String> = row.get(3)?;
    let email: Option<String> = row.get(4)?;
    let program: Option<String> = row.get(5)?;
    let year_level: Option<i64> = row.get(6)?;
    let active: i64 = row.get(7)?;

    let display_name = format!("{}, {}", last_name, first_name);
    Ok(json!({
        "id": id,
        "lastName": last_name,
        "firstName": first_name,
        "displayName": display_name,
        "studentNo": student_no,
        "email": email,
        "program": program,
        "yearLevel": year_level,
        "active": active != 0
    }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let active_only = optional_bool(req, "activeOnly").unwrap_or(false);
    let program = optional_str(req, "program");

    let mut sql = String::from(
        "SELECT id, last_name, first_name, student_no, email, program, year_level, active
         FROM students",
    );
    let mut where_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if active_only {
        where_parts.push("active = 1");
    }
    if let Some(p) = program {
        where_parts.push("program = ?");
        bind_values.push(Value::Text(p));
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY last_name, first_name");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), student_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(students) => ok(&req.id, json!({ "students": students })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row = conn
        .query_row(
            "SELECT id, last_name, first_name, student_no, email, program, year_level, active
             FROM students
             WHERE id = ?",
            [&student_id],
            |r| student_row_json(r),
        )
        .optional();

    match row {
        Ok(Some(student)) => ok(&req.id, json!({ "student": student })),
        Ok(None) => err(&req.id, "not_found", "student not found", None),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let last_name = match required_str(req, "lastName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let first_name = match required_str(req, "firstName") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_no = optional_str(req, "studentNo");
    let email = optional_str(req, "email");
    let program = optional_str(req, "program");
    let year_level = req.params.get("yearLevel").and_then(|v| v.as_i64());

    if let Some(no) = student_no.as_deref() {
        match student_no_taken(conn, no, None) {
            Ok(false) => {}
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    format!("student number '{}' is already in use", no),
                    None,
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let student_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO students(id, last_name, first_name, student_no, email, program, year_level, active, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, 1, ?)",
        (
            &student_id,
            &last_name,
            &first_name,
            &student_no,
            &email,
            &program,
            year_level,
            now_ts(),
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "students" })),
        );
    }

    ok(&req.id, json!({ "studentId": student_id }))
}

fn student_no_taken(
    conn: &Connection,
    student_no: &str,
    exclude_id: Option<&str>,
) -> Result<bool, rusqlite::Error> {
    match exclude_id {
        Some(id) => conn
            .query_row(
                "SELECT 1 FROM students WHERE student_no = ? AND id != ? LIMIT 1",
                (student_no, id),
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.is_some()),
        None => conn
            .query_row(
                "SELECT 1 FROM students WHERE student_no = ? LIMIT 1",
                [student_no],
                |r| r.get::<_, i64>(0),
            )
            .optional()
            .map(|v| v.is_some()),
    }
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for key in ["lastName", "firstName"] {
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
            let column = if key == "lastName" { "last_name" } else { "first_name" };
            set_parts.push(format!("{} = ?", column));
            bind_values.push(Value::Text(s));
        }
    }
    if let Some(v) = patch.get("studentNo") {
        if v.is_null() {
            set_parts.push("student_no = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            let s = s.trim().to_string();
            if !s.is_empty() {
                match student_no_taken(conn, &s, Some(&student_id)) {
                    Ok(false) => {}
                    Ok(true) => {
                        return err(
                            &req.id,
                            "conflict",
                            format!("student number '{}' is already in use", s),
                            None,
                        )
                    }
                    Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
                }
            }
            set_parts.push("student_no = ?".into());
            bind_values.push(if s.is_empty() { Value::Null } else { Value::Text(s) });
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.studentNo must be a string or null",
                None,
            );
        }
    }
    for (key, column) in [("email", "email"), ("program", "program")] {
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
    if let Some(v) = patch.get("yearLevel") {
        if v.is_null() {
            set_parts.push("year_level = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(n) = v.as_i64() {
            set_parts.push("year_level = ?".into());
            bind_values.push(Value::Integer(n));
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.yearLevel must be an integer or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("active") {
        let Some(b) = v.as_bool() else {
            return err(&req.id, "bad_params", "patch.active must be a boolean", None);
        };
        set_parts.push("active = ?".into());
        bind_values.push(Value::Integer(if b { 1 } else { 0 }));
    }

    if set_parts.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "patch must include at least one field",
            None,
        );
    }

    set_parts.push("updated_at = ?".into());
    bind_values.push(Value::Text(now_ts()));

    let sql = format!("UPDATE students SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(student_id));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let evaluation_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM evaluations WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let fee_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM fee_items WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let application_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM job_applications WHERE student_id = ?",
        [&student_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if evaluation_count > 0 || fee_count > 0 || application_count > 0 {
        return err(
            &req.id,
            "conflict",
            "student has linked records; remove them first",
            Some(json!({
                "evaluations": evaluation_count,
                "feeItems": fee_count,
                "applications": application_count
            })),
        );
    }

    let changed = match conn.execute("DELETE FROM students WHERE id = ?", [&student_id]) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "students" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "student not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.get" => Some(handle_get(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
