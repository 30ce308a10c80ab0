use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, now_ts, optional_bool, optional_str, required_str};
use crate::ipc::types::{AppState, Request};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn teacher_row_json(row: &rusqlite::Row<'_>) -> Result<serde_json::Value, rusqlite::Error> {
    let id: String = row.get(0)?;
    let last_name: String = row.get(1)?;
    let first_name: String = row.get(2)?;
    let email: Option<String> = row.get(3)?;
    let department: Option<String> = row.get(4)?;
    let active: i64 = row.get(5)?;

    let display_name = format!("{}, {}", last_name, first_name);
    Ok(json!({
        "id": id,
        "lastName": last_name,
        "firstName": first_name,
        "displayName": display_name,
        "email": email,
        "department": department,
        "active": active != 0
    }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let active_only = optional_bool(req, "activeOnly").unwrap_or(false);
    let sql = if active_only {
        "SELECT id, last_name, first_name, email, department, active
         FROM teachers
         WHERE active = 1
         ORDER BY last_name, first_name"
    } else {
        "SELECT id, last_name, first_name, email, department, active
         FROM teachers
         ORDER BY last_name, first_name"
    };

    let mut stmt = match conn.prepare(sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], teacher_row_json)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(teachers) => ok(&req.id, json!({ "teachers": teachers })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row = conn
        .query_row(
            "SELECT id, last_name, first_name, email, department, active
             FROM teachers
             WHERE id = ?",
            [&teacher_id],
            |r| teacher_row_json(r),
        )
        .optional();

    match row {
        Ok(Some(teacher)) => ok(&req.id, json!({ "teacher": teacher })),
        Ok(None) => err(&req.id, "not_found", "teacher not found", None),
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
    let email = optional_str(req, "email");
    let department = optional_str(req, "department");

    let teacher_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, last_name, first_name, email, department, active, updated_at)
         VALUES(?, ?, ?, ?, ?, 1, ?)",
        (&teacher_id, &last_name, &first_name, &email, &department, now_ts()),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "teachers" })),
        );
    }

    ok(&req.id, json!({ "teacherId": teacher_id }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    for (key, column) in [("lastName", "last_name"), ("firstName", "first_name")] {
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
    for (key, column) in [("email", "email"), ("department", "department")] {
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

    let sql = format!("UPDATE teachers SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(teacher_id));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "teachers" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let assessment_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM assessments WHERE teacher_id = ?",
        [&teacher_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assessment_count > 0 {
        return err(
            &req.id,
            "conflict",
            "teacher has linked assessments; remove them first",
            Some(json!({ "assessments": assessment_count })),
        );
    }

    let changed = match conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_delete_failed",
                e.to_string(),
                Some(json!({ "table": "teachers" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_list(state, req)),
        "teachers.get" => Some(handle_get(state, req)),
        "teachers.create" => Some(handle_create(state, req)),
        "teachers.update" => Some(handle_update(state, req)),
        "teachers.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
