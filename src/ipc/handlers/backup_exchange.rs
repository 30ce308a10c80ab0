use crate::backup;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers;
use crate::ipc::types::{AppState, Request};
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::info;

fn csv_quote(s: &str) -> String {
    if s.contains(',') || s.contains('"') || s.contains('\n') || s.contains('\r') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s.to_string()
    }
}

fn handle_backup_export_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let out_path = match helpers::required_str(req, "outPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let workspace_path = helpers::optional_str(req, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    if let Some(conn) = state.db.as_ref() {
        let _ = conn.execute_batch("PRAGMA wal_checkpoint(FULL)");
    }

    let out = PathBuf::from(&out_path);
    let export = match backup::export_workspace_bundle(&workspace_path, &out) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            )
        }
    };

    info!(bundle = %out_path, entries = export.entry_count, "workspace bundle exported");
    ok(
        &req.id,
        json!({
            "ok": true,
            "path": out_path,
            "bundleFormat": export.bundle_format,
            "entryCount": export.entry_count,
            "dbSha256": export.db_sha256
        }),
    )
}

fn handle_backup_import_workspace_bundle(state: &mut AppState, req: &Request) -> serde_json::Value {
    let in_path = match helpers::required_str(req, "inPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let workspace_path = helpers::optional_str(req, "workspacePath")
        .map(PathBuf::from)
        .or_else(|| state.workspace.clone());
    let Some(workspace_path) = workspace_path else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let src = PathBuf::from(&in_path);
    if !src.is_file() {
        return err(
            &req.id,
            "not_found",
            "bundle file not found",
            Some(json!({ "path": in_path })),
        );
    }
    if let Err(e) = std::fs::create_dir_all(&workspace_path) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": workspace_path.to_string_lossy() })),
        );
    }

    // Drop open handle before replacing the file.
    state.db = None;

    let import = match backup::import_workspace_bundle(&src, &workspace_path) {
        Ok(v) => v,
        Err(e) => {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": src.to_string_lossy() })),
            )
        }
    };

    match db::open_db(&workspace_path) {
        Ok(conn) => {
            state.workspace = Some(workspace_path.clone());
            state.db = Some(conn);
            info!(workspace = %workspace_path.display(), "workspace bundle imported");
            ok(
                &req.id,
                json!({
                    "ok": true,
                    "workspacePath": workspace_path.to_string_lossy(),
                    "bundleFormatDetected": import.bundle_format_detected
                }),
            )
        }
        Err(e) => err(&req.id, "db_open_failed", format!("{e:?}"), None),
    }
}

fn handle_exchange_export_evaluations_csv(
    state: &mut AppState,
    req: &Request,
) -> serde_json::Value {
    let conn = match helpers::db_conn(state, req) {
        Ok(c) => c,
        Err(resp) => return resp,
    };
    let assessment_id = match helpers::required_str(req, "assessmentId") {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let out_path = match helpers::required_str(req, "outPath") {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let assessment = match helpers::get_assessment(conn, &assessment_id) {
        Ok(Some(a)) => a,
        Ok(None) => return err(&req.id, "not_found", "assessment not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, title FROM rubric_criteria WHERE assessment_id = ? ORDER BY idx",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let criteria = match stmt
        .query_map([&assessment_id], |r| {
            Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, s.id, s.student_no, s.last_name, s.first_name, e.total_score, e.evaluated_at
         FROM evaluations e
         JOIN students s ON s.id = e.student_id
         WHERE e.assessment_id = ?
         ORDER BY s.last_name, s.first_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let evaluations = match stmt
        .query_map([&assessment_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, Option<String>>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, f64>(5)?,
                r.get::<_, Option<String>>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Level names keyed by (evaluation, criterion) so each sheet cell is one lookup.
    let mut stmt = match conn.prepare(
        "SELECT es.evaluation_id, es.criterion_id, l.name
         FROM evaluation_selections es
         JOIN rubric_levels l ON l.id = es.level_id
         JOIN evaluations e ON e.id = es.evaluation_id
         WHERE e.assessment_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let selections = match stmt
        .query_map([&assessment_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut level_names: HashMap<(String, String), String> = HashMap::new();
    for (evaluation_id, criterion_id, name) in selections {
        level_names.insert((evaluation_id, criterion_id), name);
    }

    let mut csv = String::from("student_id,student_no,student_name");
    for (_, title) in &criteria {
        csv.push(',');
        csv.push_str(&csv_quote(title));
    }
    csv.push_str(",total_score,out_of,evaluated_at\n");

    let rows_exported = evaluations.len();
    for (evaluation_id, student_id, student_no, last, first, total_score, evaluated_at) in
        evaluations
    {
        let display_name = format!("{}, {}", last, first);
        csv.push_str(&csv_quote(&student_id));
        csv.push(',');
        csv.push_str(&csv_quote(student_no.as_deref().unwrap_or("")));
        csv.push(',');
        csv.push_str(&csv_quote(&display_name));
        for (criterion_id, _) in &criteria {
            csv.push(',');
            let key = (evaluation_id.clone(), criterion_id.clone());
            if let Some(name) = level_names.get(&key) {
                csv.push_str(&csv_quote(name));
            }
        }
        csv.push_str(&format!(
            ",{},{},{}\n",
            total_score,
            assessment.total_marks,
            csv_quote(evaluated_at.as_deref().unwrap_or(""))
        ));
    }

    let out = PathBuf::from(&out_path);
    if let Some(parent) = out.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            return err(
                &req.id,
                "io_failed",
                e.to_string(),
                Some(json!({ "path": out_path })),
            );
        }
    }
    if let Err(e) = std::fs::write(&out, csv) {
        return err(
            &req.id,
            "io_failed",
            e.to_string(),
            Some(json!({ "path": out_path })),
        );
    }

    info!(assessment = %assessment_id, rows = rows_exported, "evaluation sheet exported");
    ok(
        &req.id,
        json!({ "ok": true, "rowsExported": rows_exported, "path": out_path }),
    )
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "backup.exportWorkspaceBundle" => Some(handle_backup_export_workspace_bundle(state, req)),
        "backup.importWorkspaceBundle" => Some(handle_backup_import_workspace_bundle(state, req)),
        "exchange.exportEvaluationsCsv" => Some(handle_exchange_export_evaluations_csv(state, req)),
        _ => None,
    }
}
