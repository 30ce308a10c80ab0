use super::setup;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_conn, get_assessment, now_ts, required_str, student_exists};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{self, CriterionScore};
use rusqlite::{Connection, OptionalExtension};
use serde::Deserialize;
use serde_json::json;
use std::collections::{HashMap, HashSet};
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectionInput {
    criterion_id: String,
    level_id: String,
}

#[derive(Debug)]
struct CriterionInfo {
    id: String,
    title: String,
    weight_percentage: f64,
}

#[derive(Debug)]
struct LevelInfo {
    name: String,
    points: f64,
}

/// Ordered criteria plus a per-criterion level lookup for one assessment.
fn load_rubric(
    conn: &Connection,
    assessment_id: &str,
) -> Result<(Vec<CriterionInfo>, HashMap<String, HashMap<String, LevelInfo>>), rusqlite::Error> {
    let mut stmt = conn.prepare(
        "SELECT id, title, weight_percentage FROM rubric_criteria
         WHERE assessment_id = ?
         ORDER BY idx",
    )?;
    let criteria = stmt
        .query_map([assessment_id], |r| {
            Ok(CriterionInfo {
                id: r.get(0)?,
                title: r.get(1)?,
                weight_percentage: r.get(2)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare(
        "SELECT l.criterion_id, l.id, l.name, l.points
         FROM rubric_levels l
         JOIN rubric_criteria c ON c.id = l.criterion_id
         WHERE c.assessment_id = ?",
    )?;
    let mut levels: HashMap<String, HashMap<String, LevelInfo>> = HashMap::new();
    let rows = stmt.query_map([assessment_id], |r| {
        Ok((
            r.get::<_, String>(0)?,
            r.get::<_, String>(1)?,
            r.get::<_, String>(2)?,
            r.get::<_, f64>(3)?,
        ))
    })?;
    for row in rows {
        let (criterion_id, level_id, name, points) = row?;
        levels
            .entry(criterion_id)
            .or_default()
            .insert(level_id, LevelInfo { name, points });
    }

    Ok((criteria, levels))
}

// Pure scorer surface; works with or without a workspace open.
fn handle_preview(_state: &mut AppState, req: &Request) -> serde_json::Value {
    let total_marks = match req.params.get("totalMarks").and_then(|v| v.as_f64()) {
        Some(v) => v,
        None => return err(&req.id, "bad_params", "missing/invalid totalMarks", None),
    };
    let Some(raw) = req.params.get("criteria") else {
        return err(&req.id, "bad_params", "missing criteria", None);
    };
    let criteria: Vec<CriterionScore> = match serde_json::from_value(raw.clone()) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("invalid criteria: {}", e),
                None,
            )
        }
    };

    match scoring::compute_rubric_score(total_marks, &criteria) {
        Ok(total_score) => {
            let breakdown: Vec<serde_json::Value> = criteria
                .iter()
                .map(|c| {
                    json!({
                        "weightPercentage": c.weight_percentage,
                        "selectedLevelPercentage": c.selected_level_percentage,
                        "contribution": scoring::weighted_contribution(total_marks, c)
                    })
                })
                .collect();
            ok(
                &req.id,
                json!({
                    "totalScore": total_score,
                    "outOf": total_marks,
                    "breakdown": breakdown
                }),
            )
        }
        Err(e) => err(&req.id, "validation_failed", e.message, e.details),
    }
}

fn handle_evaluate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let conn = match db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let evaluated_by = match required_str(req, "evaluatedBy") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let Some(raw_selections) = req.params.get("selections") else {
        return err(&req.id, "bad_params", "missing selections", None);
    };
    let selections: Vec<SelectionInput> = match serde_json::from_value(raw_selections.clone()) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "bad_params",
                format!("invalid selections: {}", e),
                None,
            )
        }
    };

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if assessment.status != "published" && setup::grading_config(conn).require_published_for_evaluation
    {
        return err(
            &req.id,
            "conflict",
            "assessment must be published before it can be graded",
            None,
        );
    }
    match student_exists(conn, &student_id) {
        Ok(true) => {}
        Ok(false) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let (criteria, levels) = match load_rubric(conn, &assessment_id) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // One selection per criterion: none missing, none duplicated, none foreign.
    let criterion_ids: HashSet<&str> = criteria.iter().map(|c| c.id.as_str()).collect();
    let mut chosen: HashMap<String, String> = HashMap::new();
    for sel in &selections {
        if !criterion_ids.contains(sel.criterion_id.as_str()) {
            return err(
                &req.id,
                "validation_failed",
                "selection references a criterion outside this rubric",
                Some(json!({ "criterionId": sel.criterion_id })),
            );
        }
        if chosen
            .insert(sel.criterion_id.clone(), sel.level_id.clone())
            .is_some()
        {
            return err(
                &req.id,
                "validation_failed",
                "duplicate selection for criterion",
                Some(json!({ "criterionId": sel.criterion_id })),
            );
        }
    }

    let mut scores: Vec<CriterionScore> = Vec::with_capacity(criteria.len());
    let mut breakdown: Vec<serde_json::Value> = Vec::with_capacity(criteria.len());
    for criterion in &criteria {
        let Some(level_id) = chosen.get(&criterion.id) else {
            return err(
                &req.id,
                "validation_failed",
                format!("missing selection for criterion '{}'", criterion.title),
                Some(json!({ "criterionId": criterion.id })),
            );
        };
        let criterion_levels = levels.get(&criterion.id);
        let Some(level) = criterion_levels.and_then(|m| m.get(level_id)) else {
            return err(
                &req.id,
                "validation_failed",
                "selected level does not belong to the criterion",
                Some(json!({ "criterionId": criterion.id, "levelId": level_id })),
            );
        };

        let max_points = criterion_levels
            .map(|m| m.values().map(|l| l.points).fold(0.0_f64, f64::max))
            .unwrap_or(0.0);
        let score = CriterionScore {
            weight_percentage: criterion.weight_percentage,
            selected_level_percentage: scoring::level_percent(level.points, max_points),
        };
        breakdown.push(json!({
            "criterionId": criterion.id,
            "criterionTitle": criterion.title,
            "weightPercentage": criterion.weight_percentage,
            "levelId": level_id,
            "levelName": level.name,
            "levelPercent": score.selected_level_percentage,
            "contribution": scoring::weighted_contribution(assessment.total_marks, &score)
        }));
        scores.push(score);
    }

    let total_score = match scoring::compute_rubric_score(assessment.total_marks, &scores) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "validation_failed", e.message, e.details),
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let ts = now_ts();
    if let Err(e) = tx.execute(
        "INSERT INTO evaluations(id, assessment_id, student_id, total_score, evaluated_by, evaluated_at)
         VALUES(?, ?, ?, ?, ?, ?)
         ON CONFLICT(assessment_id, student_id) DO UPDATE SET
             total_score = excluded.total_score,
             evaluated_by = excluded.evaluated_by,
             evaluated_at = excluded.evaluated_at",
        (
            Uuid::new_v4().to_string(),
            &assessment_id,
            &student_id,
            total_score,
            &evaluated_by,
            &ts,
        ),
    ) {
        return err(
            &req.id,
            "db_insert_failed",
            e.to_string(),
            Some(json!({ "table": "evaluations" })),
        );
    }

    let evaluation_id: String = match tx.query_row(
        "SELECT id FROM evaluations WHERE assessment_id = ? AND student_id = ?",
        (&assessment_id, &student_id),
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Re-evaluation replaces the previous selections wholesale.
    if let Err(e) = tx.execute(
        "DELETE FROM evaluation_selections WHERE evaluation_id = ?",
        [&evaluation_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    for criterion in &criteria {
        let Some(level_id) = chosen.get(&criterion.id) else {
            continue;
        };
        if let Err(e) = tx.execute(
            "INSERT INTO evaluation_selections(id, evaluation_id, criterion_id, level_id)
             VALUES(?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &evaluation_id,
                &criterion.id,
                level_id,
            ),
        ) {
            return err(
                &req.id,
                "db_insert_failed",
                e.to_string(),
                Some(json!({ "table": "evaluation_selections" })),
            );
        }
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    info!(
        assessment = %assessment_id,
        student = %student_id,
        score = total_score,
        "evaluation recorded"
    );
    ok(
        &req.id,
        json!({
            "evaluationId": evaluation_id,
            "totalScore": total_score,
            "outOf": assessment.total_marks,
            "breakdown": breakdown
        }),
    )
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
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let assessment = match get_assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let row = conn
        .query_row(
            "SELECT id, total_score, evaluated_by, evaluated_at
             FROM evaluations
             WHERE assessment_id = ? AND student_id = ?",
            (&assessment_id, &student_id),
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, f64>(1)?,
                    r.get::<_, Option<String>>(2)?,
                    r.get::<_, Option<String>>(3)?,
                ))
            },
        )
        .optional();
    let (evaluation_id, total_score, evaluated_by, evaluated_at) = match row {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "evaluation not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT c.id, c.title, c.weight_percentage, l.id, l.name, l.points,
                (SELECT MAX(points) FROM rubric_levels WHERE criterion_id = c.id)
         FROM evaluation_selections s
         JOIN rubric_criteria c ON c.id = s.criterion_id
         JOIN rubric_levels l ON l.id = s.level_id
         WHERE s.evaluation_id = ?
         ORDER BY c.idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total_marks = assessment.total_marks;
    let breakdown = stmt
        .query_map([&evaluation_id], |r| {
            let criterion_id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let weight: f64 = r.get(2)?;
            let level_id: String = r.get(3)?;
            let level_name: String = r.get(4)?;
            let points: f64 = r.get(5)?;
            let max_points: Option<f64> = r.get(6)?;

            let score = CriterionScore {
                weight_percentage: weight,
                selected_level_percentage: scoring::level_percent(
                    points,
                    max_points.unwrap_or(0.0),
                ),
            };
            Ok(json!({
                "criterionId": criterion_id,
                "criterionTitle": title,
                "weightPercentage": weight,
                "levelId": level_id,
                "levelName": level_name,
                "levelPercent": score.selected_level_percentage,
                "contribution": scoring::weighted_contribution(total_marks, &score)
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let breakdown = match breakdown {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "evaluationId": evaluation_id,
            "assessmentId": assessment_id,
            "studentId": student_id,
            "totalScore": total_score,
            "outOf": total_marks,
            "evaluatedBy": evaluated_by,
            "evaluatedAt": evaluated_at,
            "breakdown": breakdown
        }),
    )
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
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

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.student_id, s.last_name, s.first_name, e.total_score,
                e.evaluated_by, e.evaluated_at
         FROM evaluations e
         JOIN students s ON s.id = e.student_id
         WHERE e.assessment_id = ?
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([&assessment_id], |r| {
            let id: String = r.get(0)?;
            let student_id: String = r.get(1)?;
            let last_name: String = r.get(2)?;
            let first_name: String = r.get(3)?;
            let total_score: f64 = r.get(4)?;
            let evaluated_by: Option<String> = r.get(5)?;
            let evaluated_at: Option<String> = r.get(6)?;
            Ok(json!({
                "id": id,
                "studentId": student_id,
                "studentName": format!("{}, {}", last_name, first_name),
                "totalScore": total_score,
                "evaluatedBy": evaluated_by,
                "evaluatedAt": evaluated_at
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());

    match rows {
        Ok(evaluations) => ok(&req.id, json!({ "evaluations": evaluations })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_stats(state: &mut AppState, req: &Request) -> serde_json::Value {
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
        "SELECT total_score FROM evaluations WHERE assessment_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let scores = match stmt
        .query_map([&assessment_id], |r| r.get::<_, f64>(0))
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if scores.is_empty() {
        return ok(
            &req.id,
            json!({
                "count": 0,
                "mean": serde_json::Value::Null,
                "median": serde_json::Value::Null,
                "outOf": assessment.total_marks
            }),
        );
    }

    let mean = scores.iter().sum::<f64>() / scores.len() as f64;
    ok(
        &req.id,
        json!({
            "count": scores.len(),
            "mean": scoring::round_to_2dp(mean),
            "median": scoring::round_to_2dp(scoring::compute_median(&scores)),
            "outOf": assessment.total_marks
        }),
    )
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
    let student_id = match required_str(req, "studentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let evaluation_id: Option<String> = match conn
        .query_row(
            "SELECT id FROM evaluations WHERE assessment_id = ? AND student_id = ?",
            (&assessment_id, &student_id),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(evaluation_id) = evaluation_id else {
        return err(&req.id, "not_found", "evaluation not found", None);
    };

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM evaluation_selections WHERE evaluation_id = ?",
        [&evaluation_id],
    ) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.execute("DELETE FROM evaluations WHERE id = ?", [&evaluation_id]) {
        return err(&req.id, "db_delete_failed", e.to_string(), None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_commit_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "scoring.preview" => Some(handle_preview(state, req)),
        "evaluations.evaluate" => Some(handle_evaluate(state, req)),
        "evaluations.get" => Some(handle_get(state, req)),
        "evaluations.list" => Some(handle_list(state, req)),
        "evaluations.stats" => Some(handle_stats(state, req)),
        "evaluations.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
