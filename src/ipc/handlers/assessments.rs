use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{
    db_conn, get_assessment, now_ts, optional_str, required_f64, required_str, teacher_exists,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use tracing::info;
use uuid::Uuid;

fn assessment_json(row: &rusqlite::Row<'_>) -> Result<serde_json::Value, rusqlite::Error> {
    let id: String = row.get(0)?;
    let teacher_id: String = row.get(1)?;
    let title: String = row.get(2)?;
    let subject: Option<String> = row.get(3)?;
    let total_marks: f64 = row.get(4)?;
    let status: String = row.get(5)?;
    let created_at: Option<String> = row.get(6)?;
    let updated_at: Option<String> = row.get(7)?;

    Ok(json!({
        "id": id,
        "teacherId": teacher_id,
        "title": title,
        "subject": subject,
        "totalMarks": total_marks,
        "status": status,
        "createdAt": created_at,
        "updatedAt": updated_at
    }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let teacher_id = optional_str(req, "teacherId");
    let status = optional_str(req, "status");

    let mut sql = String::from(
        "SELECT a.id, a.teacher_id, a.title, a.subject, a.total_marks, a.status,
                a.created_at, a.updated_at,
                (SELECT COUNT(*) FROM rubric_criteria c WHERE c.assessment_id = a.id),
                (SELECT COUNT(*) FROM evaluations e WHERE e.assessment_id = a.id)
         FROM assessments a",
    );
    let mut where_parts: Vec<&str> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();
    if let Some(t) = teacher_id {
        where_parts.push("a.teacher_id = ?");
        bind_values.push(Value::Text(t));
    }
    if let Some(s) = status {
        if s != "draft" && s != "published" {
            return err(&req.id, "bad_params", "status must be draft or published", None);
        }
        where_parts.push("a.status = ?");
        bind_values.push(Value::Text(s));
    }
    if !where_parts.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&where_parts.join(" AND "));
    }
    sql.push_str(" ORDER BY a.created_at, a.title");

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map(params_from_iter(bind_values), |row| {
            let mut item = assessment_json(row)?;
            let criterion_count: i64 = row.get(8)?;
            let evaluation_count: i64 = row.get(9)?;
            if let Some(obj) = item.as_object_mut() {
                obj.insert("criterionCount".into(), json!(criterion_count));
                obj.insert("evaluationCount".into(), json!(evaluation_count));
            }
            Ok(item)
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(assessments) => ok(&req.id, json!({ "assessments": assessments })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let row = conn
        .query_row(
            "SELECT id, teacher_id, title, subject, total_marks, status, created_at, updated_at
             FROM assessments
             WHERE id = ?",
            [&assessment_id],
            |r| assessment_json(r),
        )
        .optional();
    let assessment = match row {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let criterion_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM rubric_criteria WHERE assessment_id = ?",
        [&assessment_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let weight_total: f64 = match conn.query_row(
        "SELECT COALESCE(SUM(weight_percentage), 0) FROM rubric_criteria WHERE assessment_id = ?",
        [&assessment_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let evaluation_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM evaluations WHERE assessment_id = ?",
        [&assessment_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "assessment": assessment,
            "criterionCount": criterion_count,
            "weightTotal": weight_total,
            "evaluationCount": evaluation_count
        }),
    )
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };

    let teacher_id = match required_str(req, "teacherId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let subject = optional_str(req, "subject");
    let total_marks = match required_f64(req, "totalMarks") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    if !total_marks.is_finite() || total_marks <= 0.0 {
        return err(
            &req.id,
            "validation_failed",
            "totalMarks must be greater than 0",
            Some(json!({ "totalMarks": total_marks })),
        );
    }

    match teacher_exists(conn, &teacher_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let assessment_id = Uuid::new_v4().to_string();
    let ts = now_ts();
    if let Err(e) = conn.execute(
        "INSERT INTO assessments(id, teacher_id, title, subject, total_marks, status, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, 'draft', ?, ?)",
        (&assessment_id, &teacher_id, &title, &subject, total_marks, &ts, &ts),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }

    ok(&req.id, json!({ "assessmentId": assessment_id }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assessment.status == "published" {
        return err(
            &req.id,
            "conflict",
            "assessment is published and can no longer be edited",
            None,
        );
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("title") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.title must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "title must not be empty", None);
        }
        set_parts.push("title = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("subject") {
        if v.is_null() {
            set_parts.push("subject = ?".into());
            bind_values.push(Value::Null);
        } else if let Some(s) = v.as_str() {
            let s = s.trim().to_string();
            set_parts.push("subject = ?".into());
            bind_values.push(if s.is_empty() { Value::Null } else { Value::Text(s) });
        } else {
            return err(
                &req.id,
                "bad_params",
                "patch.subject must be a string or null",
                None,
            );
        }
    }
    if let Some(v) = patch.get("totalMarks") {
        let Some(n) = v.as_f64() else {
            return err(&req.id, "bad_params", "patch.totalMarks must be a number", None);
        };
        if !n.is_finite() || n <= 0.0 {
            return err(
                &req.id,
                "validation_failed",
                "totalMarks must be greater than 0",
                Some(json!({ "totalMarks": n })),
            );
        }
        set_parts.push("total_marks = ?".into());
        bind_values.push(Value::Real(n));
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

    let sql = format!("UPDATE assessments SET {} WHERE id = ?", set_parts.join(", "));
    bind_values.push(Value::Text(assessment_id));

    if let Err(e) = conn.execute(&sql, params_from_iter(bind_values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }

    ok(&req.id, json!({ "ok": true }))
}

/// Collects every reason the rubric is not publishable. Empty means go.
fn publish_problems(
    conn: &Connection,
    assessment_id: &str,
) -> Result<(Vec<String>, f64), rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, title, weight_percentage FROM rubric_criteria
         WHERE assessment_id = ?
         ORDER BY idx",
    )?;
    let criteria = stmt
        .query_map([assessment_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, f64>(2)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut problems: Vec<String> = Vec::new();
    if criteria.is_empty() {
        problems.push("rubric has no criteria".to_string());
    }

    for (criterion_id, title, _) in &criteria {
        let level_count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM rubric_levels WHERE criterion_id = ?",
            [criterion_id],
            |r| r.get(0),
        )?;
        if level_count == 0 {
            problems.push(format!("criterion '{}' has no levels", title));
            continue;
        }
        let max_points: f64 = conn.query_row(
            "SELECT COALESCE(MAX(points), 0) FROM rubric_levels WHERE criterion_id = ?",
            [criterion_id],
            |r| r.get(0),
        )?;
        if max_points <= 0.0 {
            problems.push(format!("criterion '{}' has no level worth any points", title));
        }
    }

    let weight_total: f64 = criteria.iter().map(|(_, _, w)| *w).sum();
    if !criteria.is_empty() {
        if let Err(e) = scoring::validate_weight_sum(criteria.iter().map(|(_, _, w)| *w)) {
            problems.push(e.message);
        }
    }

    Ok((problems, weight_total))
}

fn handle_publish(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assessment.status == "published" {
        return err(&req.id, "conflict", "assessment is already published", None);
    }

    let (problems, weight_total) = match publish_problems(conn, &assessment_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if !problems.is_empty() {
        return err(
            &req.id,
            "validation_failed",
            format!("assessment failed publish validation: {}", problems.join("; ")),
            Some(json!({ "problems": problems, "weightTotal": weight_total })),
        );
    }

    if let Err(e) = conn.execute(
        "UPDATE assessments SET status = 'published', updated_at = ? WHERE id = ?",
        (now_ts(), &assessment_id),
    ) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "assessments" })),
        );
    }

    info!(assessment = %assessment_id, "assessment published");
    ok(&req.id, json!({ "ok": true, "status": "published" }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    match get_assessment(conn, &assessment_id) {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let evaluation_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM evaluations WHERE assessment_id = ?",
        [&assessment_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if evaluation_count > 0 {
        return err(
            &req.id,
            "conflict",
            "assessment has recorded evaluations; delete them first",
            Some(json!({ "evaluations": evaluation_count })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM rubric_levels
         WHERE criterion_id IN (SELECT id FROM rubric_criteria WHERE assessment_id = ?)",
        [&assessment_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "DELETE FROM rubric_criteria WHERE assessment_id = ?",
        [&assessment_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM assessments WHERE id = ?", [&assessment_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "assessments.list" => Some(handle_list(state, req)),
        "assessments.get" => Some(handle_get(state, req)),
        "assessments.create" => Some(handle_create(state, req)),
        "assessments.update" => Some(handle_update(state, req)),
        "assessments.publish" => Some(handle_publish(state, req)),
        "assessments.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
