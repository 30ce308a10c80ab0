use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::Connection;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    Grading,
    Fees,
    Placements,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "grading" => Some(Self::Grading),
            "fees" => Some(Self::Fees),
            "placements" => Some(Self::Placements),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::Grading => "setup.grading",
            Self::Fees => "setup.fees",
            Self::Placements => "setup.placements",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::Grading => json!({
            "scoreDecimalPlaces": 2,
            "requirePublishedForEvaluation": true,
            "showLevelPercents": true
        }),
        SetupSection::Fees => json!({
            "currency": "USD",
            "receiptPrefix": "RCPT",
            "allowPartialPayments": true
        }),
        SetupSection::Placements => json!({
            "maxActiveApplicationsPerStudent": 10,
            "autoCloseAfterDeadline": false
        }),
    }
}

fn as_object_mut(value: &mut Value) -> Result<&mut Map<String, Value>, String> {
    value
        .as_object_mut()
        .ok_or_else(|| "internal setup object must be a JSON object".to_string())
}

fn parse_bool(v: &Value, key: &str) -> Result<bool, String> {
    v.as_bool()
        .ok_or_else(|| format!("{} must be boolean", key))
}

fn parse_i64_range(v: &Value, key: &str, min: i64, max: i64) -> Result<i64, String> {
    let n = v
        .as_i64()
        .ok_or_else(|| format!("{} must be integer", key))?;
    if !(min..=max).contains(&n) {
        return Err(format!("{} must be in {}..={}", key, min, max));
    }
    Ok(n)
}

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::Grading => match k.as_str() {
                // Pinned: the scorer always rounds to 2 decimal places.
                "scoreDecimalPlaces" => {
                    if v.as_i64() != Some(2) {
                        return Err("scoreDecimalPlaces is fixed at 2".into());
                    }
                }
                "requirePublishedForEvaluation" | "showLevelPercents" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown grading field: {}", k)),
            },
            SetupSection::Fees => match k.as_str() {
                "currency" => {
                    let s = parse_string_max(v, k, 3)?.to_ascii_uppercase();
                    if s.len() != 3 || !s.chars().all(|c| c.is_ascii_alphabetic()) {
                        return Err("currency must be a 3-letter code".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "receiptPrefix" => {
                    let s = parse_string_max(v, k, 10)?;
                    if s.is_empty() {
                        return Err("receiptPrefix must not be empty".into());
                    }
                    obj.insert(k.clone(), Value::String(s));
                }
                "allowPartialPayments" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown fees field: {}", k)),
            },
            SetupSection::Placements => match k.as_str() {
                "maxActiveApplicationsPerStudent" => {
                    obj.insert(k.clone(), Value::from(parse_i64_range(v, k, 1, 50)?));
                }
                "autoCloseAfterDeadline" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown placements field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values fall back to defaults.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Grading knobs as the evaluation handlers consume them.
pub struct GradingConfig {
    pub require_published_for_evaluation: bool,
    pub show_level_percents: bool,
}

pub fn grading_config(conn: &Connection) -> GradingConfig {
    let v = load_section(conn, SetupSection::Grading).unwrap_or_else(|_| default_section(SetupSection::Grading));
    GradingConfig {
        require_published_for_evaluation: v
            .get("requirePublishedForEvaluation")
            .and_then(|b| b.as_bool())
            .unwrap_or(true),
        show_level_percents: v
            .get("showLevelPercents")
            .and_then(|b| b.as_bool())
            .unwrap_or(true),
    }
}

pub struct FeesConfig {
    pub receipt_prefix: String,
    pub allow_partial_payments: bool,
}

pub fn fees_config(conn: &Connection) -> FeesConfig {
    let v = load_section(conn, SetupSection::Fees).unwrap_or_else(|_| default_section(SetupSection::Fees));
    FeesConfig {
        receipt_prefix: v
            .get("receiptPrefix")
            .and_then(|s| s.as_str())
            .unwrap_or("RCPT")
            .to_string(),
        allow_partial_payments: v
            .get("allowPartialPayments")
            .and_then(|b| b.as_bool())
            .unwrap_or(true),
    }
}

pub struct PlacementsConfig {
    pub max_active_applications_per_student: i64,
    pub auto_close_after_deadline: bool,
}

pub fn placements_config(conn: &Connection) -> PlacementsConfig {
    let v = load_section(conn, SetupSection::Placements)
        .unwrap_or_else(|_| default_section(SetupSection::Placements));
    PlacementsConfig {
        max_active_applications_per_student: v
            .get("maxActiveApplicationsPerStudent")
            .and_then(|n| n.as_i64())
            .unwrap_or(10),
        auto_close_after_deadline: v
            .get("autoCloseAfterDeadline")
            .and_then(|b| b.as_bool())
            .unwrap_or(false),
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let grading = match load_section(conn, SetupSection::Grading) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let fees = match load_section(conn, SetupSection::Fees) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let placements = match load_section(conn, SetupSection::Placements) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "grading": grading,
            "fees": fees,
            "placements": placements
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(patch_obj) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "patch must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, patch_obj) {
        return err(&req.id, "bad_params", msg, None);
    }
    if let Err(e) = db::settings_set_json(conn, section.key(), &current) {
        return err(&req.id, "db_update_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "setup.get" => Some(handle_setup_get(state, req)),
        "setup.update" => Some(handle_setup_update(state, req)),
        _ => None,
    }
}
