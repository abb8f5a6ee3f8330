use crate::access::{Actor, PERM_MANAGE_SCHOOL};
use crate::admission;
use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use serde_json::{json, Map, Value};

#[derive(Clone, Copy)]
enum SetupSection {
    School,
    Admissions,
}

impl SetupSection {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "school" => Some(Self::School),
            "admissions" => Some(Self::Admissions),
            _ => None,
        }
    }

    fn key(self) -> &'static str {
        match self {
            Self::School => "setup.school",
            Self::Admissions => "setup.admissions",
        }
    }
}

fn default_section(section: SetupSection) -> Value {
    match section {
        SetupSection::School => json!({
            "name": "",
            "academicYear": admission::academic_year_for(Utc::now().date_naive())
        }),
        SetupSection::Admissions => json!({
            "defaultRegistrationFee": 50000.0,
            "defaultTuitionFee": 150000.0,
            "requireReviewBeforeDecision": false
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

fn parse_string_max(v: &Value, key: &str, max_len: usize) -> Result<String, String> {
    let s = v.as_str().ok_or_else(|| format!("{} must be string", key))?;
    let s = s.trim();
    if s.len() > max_len {
        return Err(format!("{} length must be <= {}", key, max_len));
    }
    Ok(s.to_string())
}

fn parse_fee(v: &Value, key: &str) -> Result<f64, String> {
    let n = v
        .as_f64()
        .ok_or_else(|| format!("{} must be a number", key))?;
    admission::validate_fee(n, key)?;
    Ok(n)
}

fn parse_academic_year(v: &Value, key: &str) -> Result<String, String> {
    let s = parse_string_max(v, key, 16)?;
    let parts: Vec<&str> = s.split('-').collect();
    let valid = match parts.as_slice() {
        [start, end] if start.len() == 4 && end.len() == 4 => {
            match (start.parse::<i32>(), end.parse::<i32>()) {
                (Ok(a), Ok(b)) => b == a + 1,
                _ => false,
            }
        }
        _ => false,
    };
    if !valid {
        return Err(format!(
            "{} must be consecutive years, e.g. 2025-2026",
            key
        ));
    }
    Ok(s)
}

fn merge_section_patch(
    section: SetupSection,
    current: &mut Value,
    patch: &Map<String, Value>,
) -> Result<(), String> {
    let obj = as_object_mut(current)?;
    for (k, v) in patch {
        match section {
            SetupSection::School => match k.as_str() {
                "name" => {
                    obj.insert(k.clone(), Value::String(parse_string_max(v, k, 200)?));
                }
                "academicYear" => {
                    obj.insert(k.clone(), Value::String(parse_academic_year(v, k)?));
                }
                _ => return Err(format!("unknown school field: {}", k)),
            },
            SetupSection::Admissions => match k.as_str() {
                "defaultRegistrationFee" | "defaultTuitionFee" => {
                    obj.insert(k.clone(), Value::from(parse_fee(v, k)?));
                }
                "requireReviewBeforeDecision" => {
                    obj.insert(k.clone(), Value::Bool(parse_bool(v, k)?));
                }
                _ => return Err(format!("unknown admissions field: {}", k)),
            },
        }
    }
    Ok(())
}

fn load_section(conn: &rusqlite::Connection, section: SetupSection) -> anyhow::Result<Value> {
    let mut current = default_section(section);
    if let Some(saved) = db::settings_get_json(conn, section.key())? {
        if let Some(saved_obj) = saved.as_object() {
            // Best-effort apply: malformed historical values should not block setup UI.
            let _ = merge_section_patch(section, &mut current, saved_obj);
        }
    }
    Ok(current)
}

/// Academic year new candidatures default to when the caller does not name one.
pub(super) fn school_academic_year(conn: &rusqlite::Connection) -> anyhow::Result<String> {
    let school = load_section(conn, SetupSection::School)?;
    match school.get("academicYear").and_then(|v| v.as_str()) {
        Some(y) => Ok(y.to_string()),
        None => Ok(admission::academic_year_for(Utc::now().date_naive())),
    }
}

fn handle_setup_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let school = match load_section(conn, SetupSection::School) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let admissions = match load_section(conn, SetupSection::Admissions) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "school": school,
            "admissions": admissions
        }),
    )
}

fn handle_setup_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    if let Err(msg) = Actor::require(&req.params, PERM_MANAGE_SCHOOL) {
        return err(&req.id, "forbidden", msg, None);
    }
    let Some(section_raw) = req.params.get("section").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing section", None);
    };
    let Some(section) = SetupSection::parse(section_raw) else {
        return err(&req.id, "bad_params", "unknown section", None);
    };
    let Some(values) = req.params.get("values").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "values must be an object", None);
    };

    let mut current = match load_section(conn, section) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if let Err(msg) = merge_section_patch(section, &mut current, values) {
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
