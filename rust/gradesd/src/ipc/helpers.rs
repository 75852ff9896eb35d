use chrono::NaiveDate;
use serde_json::Value;

use crate::db::SqliteStore;
use crate::grade::GradeType;
use crate::ipc::error::{err, respond, HandlerErr};
use crate::ipc::types::{AppState, Request};

/// Runs `f` against the open workspace store.
pub fn with_store<F>(state: &mut AppState, req: &Request, f: F) -> Value
where
    F: FnOnce(&SqliteStore, &Value) -> Result<Value, HandlerErr>,
{
    let Some(store) = state.store.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    respond(&req.id, f(store, &req.params))
}

/// Required, non-blank string parameter.
pub fn str_param<'a>(params: &'a Value, key: &str) -> Result<&'a str, HandlerErr> {
    match params.get(key).and_then(|v| v.as_str()).map(str::trim) {
        Some(s) if !s.is_empty() => Ok(s),
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must not be empty"))),
        None => Err(HandlerErr::bad_params(format!("missing {key}"))),
    }
}

pub fn opt_str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub fn date_param(params: &Value, key: &str) -> Result<NaiveDate, HandlerErr> {
    let raw = str_param(params, key)?;
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
        HandlerErr::bad_params(format!("{key} must be a YYYY-MM-DD date"))
            .with_details(serde_json::json!({ key: raw }))
    })
}

pub fn grade_type_param(params: &Value, key: &str) -> Result<GradeType, HandlerErr> {
    let raw = str_param(params, key)?;
    GradeType::parse(raw).ok_or_else(|| {
        let allowed: Vec<&str> = GradeType::ALL.iter().map(|t| t.as_str()).collect();
        HandlerErr::bad_params(format!("{key} must be one of: {}", allowed.join(", ")))
    })
}

/// Positive integer with a default when absent.
pub fn positive_u32_param(params: &Value, key: &str, default: u32) -> Result<u32, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(default),
        Some(v) => v
            .as_u64()
            .and_then(|n| u32::try_from(n).ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| HandlerErr::bad_params(format!("{key} must be a positive integer"))),
    }
}

pub fn string_list_param(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(arr) = params.get(key).and_then(|v| v.as_array()) else {
        return Err(HandlerErr::bad_params(format!("missing {key}")));
    };
    arr.iter()
        .map(|v| {
            v.as_str()
                .map(str::to_string)
                .ok_or_else(|| HandlerErr::bad_params(format!("{key} must contain strings")))
        })
        .collect()
}

/// Grade cell input as typed. Numbers are accepted as-is, null clears the cell.
pub fn raw_grade_param(params: &Value, key: &str) -> Result<String, HandlerErr> {
    match params.get(key) {
        Some(Value::String(s)) => Ok(s.clone()),
        Some(Value::Number(n)) => Ok(n.to_string()),
        Some(Value::Null) => Ok(String::new()),
        Some(_) => Err(HandlerErr::bad_params(format!("{key} must be a string or number"))),
        None => Err(HandlerErr::bad_params(format!("missing {key}"))),
    }
}
