use super::setup;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, get_assessment, now_ts, required_str};
use crate::ipc::types::{AppState, Request};
use crate::scoring;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

// Shift offset for re-slotting idx values without tripping UNIQUE(parent, idx).
const IDX_SHIFT: i64 = 1_000_000;

fn frozen_guard(req: &Request, status: &str) -> Option<serde_json::Value> {
    if status == "published" {
        return Some(err(
            &req.id,
            "conflict",
            "assessment is published and can no longer be edited",
            None,
        ));
    }
    None
}

fn criterion_assessment(
    conn: &Connection,
    criterion_id: &str,
) -> Result<Option<(String, String)>, rusqlite::Error> {
    conn.query_row(
        "SELECT a.id, a.status
         FROM rubric_criteria c
         JOIN assessments a ON a.id = c.assessment_id
         WHERE c.id = ?",
        [criterion_id],
        |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)),
    )
    .optional()
}

fn criterion_in_assessment(
    conn: &Connection,
    assessment_id: &str,
    criterion_id: &str,
) -> Result<bool, rusqlite::Error> {
    conn.query_row(
        "SELECT 1 FROM rubric_criteria WHERE id = ? AND assessment_id = ? LIMIT 1",
        (criterion_id, assessment_id),
        |r| r.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.is_some())
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

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, idx, title, weight_percentage FROM rubric_criteria
         WHERE assessment_id = ?
         ORDER BY idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let criteria_rows = match stmt
        .query_map([&assessment_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, i64>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, f64>(3)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut level_stmt = match conn.prepare(
        "SELECT id, idx, name, points FROM rubric_levels
         WHERE criterion_id = ?
         ORDER BY idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let show_level_percents = setup::grading_config(conn).show_level_percents;
    let mut weight_total = 0.0_f64;
    let mut criteria = Vec::with_capacity(criteria_rows.len());
    for (criterion_id, idx, title, weight) in criteria_rows {
        weight_total += weight;
        let levels = match level_stmt
            .query_map([&criterion_id], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, i64>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, f64>(3)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };

        let max_points = levels.iter().map(|(_, _, _, p)| *p).fold(0.0_f64, f64::max);
        let levels_json: Vec<serde_json::Value> = levels
            .into_iter()
            .map(|(id, idx, name, points)| {
                let mut level = json!({
                    "id": id,
                    "idx": idx,
                    "name": name,
                    "points": points
                });
                if show_level_percents {
                    if let Some(obj) = level.as_object_mut() {
                        obj.insert(
                            "levelPercent".into(),
                            json!(scoring::level_percent(points, max_points)),
                        );
                    }
                }
                level
            })
            .collect();

        criteria.push(json!({
            "id": criterion_id,
            "idx": idx,
            "title": title,
            "weightPercentage": weight,
            "levels": levels_json
        }));
    }

    ok(
        &req.id,
        json!({
            "assessment": {
                "id": assessment.id,
                "teacherId": assessment.teacher_id,
                "title": assessment.title,
                "subject": assessment.subject,
                "totalMarks": assessment.total_marks,
                "status": assessment.status
            },
            "criteria": criteria,
            "weightTotal": weight_total
        }),
    )
}

fn handle_criteria_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let title = match required_str(req, "title") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let weight = match req.params.get("weightPercentage").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid weightPercentage", None),
    };
    if !weight.is_finite() || weight < 0.0 {
        return err(
            &req.id,
            "validation_failed",
            "weightPercentage must be at least 0",
            Some(json!({ "weightPercentage": weight })),
        );
    }

    // Inline levels are validated up front so the insert is all-or-nothing.
    let mut inline_levels: Vec<(String, f64)> = Vec::new();
    if let Some(v) = req.params.get("levels") {
        let Some(items) = v.as_array() else {
            return err(&req.id, "bad_params", "levels must be an array", None);
        };
        for (i, item) in items.iter().enumerate() {
            let name = item
                .get("name")
                .and_then(|v| v.as_str())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty());
            let Some(name) = name else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("levels[{}].name must be a non-empty string", i),
                    None,
                );
            };
            let Some(points) = item.get("points").and_then(|v| v.as_f64()) else {
                return err(
                    &req.id,
                    "bad_params",
                    format!("levels[{}].points must be a number", i),
                    None,
                );
            };
            if !points.is_finite() || points < 0.0 {
                return err(
                    &req.id,
                    "validation_failed",
                    format!("levels[{}].points must be at least 0", i),
                    Some(json!({ "points": points })),
                );
            }
            inline_levels.push((name, points));
        }
    }

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = frozen_guard(req, &assessment.status) {
        return resp;
    }

    let idx: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(idx), -1) + 1 FROM rubric_criteria WHERE assessment_id = ?",
        [&assessment_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let criterion_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO rubric_criteria(id, assessment_id, idx, title, weight_percentage)
         VALUES(?, ?, ?, ?, ?)",
        (&criterion_id, &assessment_id, idx, &title, weight),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "rubric_criteria" })),
        );
    }

    let mut level_ids: Vec<String> = Vec::with_capacity(inline_levels.len());
    for (i, (name, points)) in inline_levels.iter().enumerate() {
        let level_id = Uuid::new_v4().to_string();
        if let Err(e) = tx.execute(
            "INSERT INTO rubric_levels(id, criterion_id, idx, name, points)
             VALUES(?, ?, ?, ?, ?)",
            (&level_id, &criterion_id, i as i64, name, points),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "rubric_levels" })),
            );
        }
        level_ids.push(level_id);
    }

    if let Err(e) = tx.execute(
        "UPDATE assessments SET updated_at = ? WHERE id = ?",
        (now_ts(), &assessment_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "criterionId": criterion_id, "levelIds": level_ids }))
}

fn handle_criteria_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let criterion_id = match required_str(req, "criterionId") {
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
    if let Some(resp) = frozen_guard(req, &assessment.status) {
        return resp;
    }
    match criterion_in_assessment(conn, &assessment_id, &criterion_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "criterion not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
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
    if let Some(v) = patch.get("weightPercentage") {
        let Some(n) = v.as_f64() else {
            return err(
                &req.id,
                "bad_params",
                "patch.weightPercentage must be a number",
                None,
            );
        };
        if !n.is_finite() || n < 0.0 {
            return err(
                &req.id,
                "validation_failed",
                "weightPercentage must be at least 0",
                Some(json!({ "weightPercentage": n })),
            );
        }
        set_parts.push("weight_percentage = ?".into());
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

    let sql = format!(
        "UPDATE rubric_criteria SET {} WHERE id = ? AND assessment_id = ?",
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(criterion_id));
    bind_values.push(Value::Text(assessment_id.clone()));

    if let Err(e) = conn.execute(&sql, params_from_iter(bind_values)) {
        return err(
            &req.id,
            "db_update_failed",
            e.to_string(),
            Some(json!({ "table": "rubric_criteria" })),
        );
    }
    if let Err(e) = conn.execute(
        "UPDATE assessments SET updated_at = ? WHERE id = ?",
        (now_ts(), &assessment_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_criteria_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let criterion_id = match required_str(req, "criterionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = frozen_guard(req, &assessment.status) {
        return resp;
    }

    let idx: Option<i64> = match conn
        .query_row(
            "SELECT idx FROM rubric_criteria WHERE id = ? AND assessment_id = ?",
            (&criterion_id, &assessment_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(idx) = idx else {
        return err(&req.id, "not_found", "criterion not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM rubric_levels WHERE criterion_id = ?",
        [&criterion_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "DELETE FROM rubric_criteria WHERE id = ?",
        [&criterion_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    // Keep idx contiguous. Two steps so UNIQUE(assessment_id, idx) never collides.
    if let Err(e) = tx.execute(
        "UPDATE rubric_criteria SET idx = idx + ? WHERE assessment_id = ? AND idx > ?",
        (IDX_SHIFT, &assessment_id, idx),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE rubric_criteria SET idx = idx - ? WHERE assessment_id = ? AND idx >= ?",
        (IDX_SHIFT + 1, &assessment_id, IDX_SHIFT),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE assessments SET updated_at = ? WHERE id = ?",
        (now_ts(), &assessment_id),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_levels_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let criterion_id = match required_str(req, "criterionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let name = match required_str(req, "name") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let points = match req.params.get("points").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid points", None),
    };
    if !points.is_finite() || points < 0.0 {
        return err(
            &req.id,
            "validation_failed",
            "points must be at least 0",
            Some(json!({ "points": points })),
        );
    }

    let status = match criterion_assessment(conn, &criterion_id) {
        Ok(Some((_, status))) => status,
        Ok(None) => return err(&req.id, "not_found", "criterion not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = frozen_guard(req, &status) {
        return resp;
    }

    let idx: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(idx), -1) + 1 FROM rubric_levels WHERE criterion_id = ?",
        [&criterion_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let level_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO rubric_levels(id, criterion_id, idx, name, points)
         VALUES(?, ?, ?, ?, ?)",
        (&level_id, &criterion_id, idx, &name, points),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "rubric_levels" })),
        );
    }

    ok(&req.id, json!({ "levelId": level_id }))
}

fn handle_levels_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let criterion_id = match required_str(req, "criterionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let level_id = match required_str(req, "levelId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing/invalid patch", None);
    };

    let status = match criterion_assessment(conn, &criterion_id) {
        Ok(Some((_, status))) => status,
        Ok(None) => return err(&req.id, "not_found", "criterion not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = frozen_guard(req, &status) {
        return resp;
    }

    let mut set_parts: Vec<String> = Vec::new();
    let mut bind_values: Vec<Value> = Vec::new();

    if let Some(v) = patch.get("name") {
        let Some(s) = v.as_str() else {
            return err(&req.id, "bad_params", "patch.name must be a string", None);
        };
        let s = s.trim().to_string();
        if s.is_empty() {
            return err(&req.id, "bad_params", "name must not be empty", None);
        }
        set_parts.push("name = ?".into());
        bind_values.push(Value::Text(s));
    }
    if let Some(v) = patch.get("points") {
        let Some(n) = v.as_f64() else {
            return err(&req.id, "bad_params", "patch.points must be a number", None);
        };
        if !n.is_finite() || n < 0.0 {
            return err(
                &req.id,
                "validation_failed",
                "points must be at least 0",
                Some(json!({ "points": n })),
            );
        }
        set_parts.push("points = ?".into());
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

    let sql = format!(
        "UPDATE rubric_levels SET {} WHERE id = ? AND criterion_id = ?",
        set_parts.join(", ")
    );
    bind_values.push(Value::Text(level_id));
    bind_values.push(Value::Text(criterion_id));

    let changed = match conn.execute(&sql, params_from_iter(bind_values)) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "db_update_failed",
                e.to_string(),
                Some(json!({ "table": "rubric_levels" })),
            )
        }
    };
    if changed == 0 {
        return err(&req.id, "not_found", "level not found", None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_levels_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let criterion_id = match required_str(req, "criterionId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let level_id = match required_str(req, "levelId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let status = match criterion_assessment(conn, &criterion_id) {
        Ok(Some((_, status))) => status,
        Ok(None) => return err(&req.id, "not_found", "criterion not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Some(resp) = frozen_guard(req, &status) {
        return resp;
    }

    let idx: Option<i64> = match conn
        .query_row(
            "SELECT idx FROM rubric_levels WHERE id = ? AND criterion_id = ?",
            (&level_id, &criterion_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(idx) = idx else {
        return err(&req.id, "not_found", "level not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM rubric_levels WHERE id = ?", [&level_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    // Keep idx contiguous. Same two-step shift as criteria.
    if let Err(e) = tx.execute(
        "UPDATE rubric_levels SET idx = idx + ? WHERE criterion_id = ? AND idx > ?",
        (IDX_SHIFT, &criterion_id, idx),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute(
        "UPDATE rubric_levels SET idx = idx - ? WHERE criterion_id = ? AND idx >= ?",
        (IDX_SHIFT + 1, &criterion_id, IDX_SHIFT),
    ) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "rubric.get" => Some(handle_get(state, req)),
        "rubric.criteria.create" => Some(handle_criteria_create(state, req)),
        "rubric.criteria.update" => Some(handle_criteria_update(state, req)),
        "rubric.criteria.delete" => Some(handle_criteria_delete(state, req)),
        "rubric.levels.create" => Some(handle_levels_create(state, req)),
        "rubric.levels.update" => Some(handle_levels_update(state, req)),
        "rubric.levels.delete" => Some(handle_levels_delete(state, req)),
        _ => None,
    }
}
