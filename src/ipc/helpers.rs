use crate::access::{self, Role};
use crate::ipc::error::{err, ok, HandlerErr};
use crate::ipc::types::{AppState, Request};
use chrono::{SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::Value;
use std::collections::HashSet;
use uuid::Uuid;

pub type HandlerResult = Result<Value, HandlerErr>;

/// Run `f` against the open workspace database and wrap the outcome in the
/// response envelope.
pub fn with_db(
    state: &mut AppState,
    req: &Request,
    f: impl FnOnce(&Connection, &Value) -> HandlerResult,
) -> Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    match f(conn, &req.params) {
        Ok(result) => ok(&req.id, result),
        Err(error) => error.response(&req.id),
    }
}

pub fn now_ts() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn get_required_str(params: &Value, key: &str) -> Result<String, HandlerErr> {
    let v = params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))?;
    if v.is_empty() {
        return Err(HandlerErr::bad_params(format!("{} must not be empty", key)));
    }
    Ok(v)
}

pub fn get_optional_str(params: &Value, key: &str) -> Result<Option<String>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.trim().to_string())),
        Some(_) => Err(HandlerErr::bad_params(format!(
            "{} must be string or null",
            key
        ))),
    }
}

pub fn get_optional_f64(params: &Value, key: &str) -> Result<Option<f64>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .filter(|n| n.is_finite())
            .map(Some)
            .ok_or_else(|| HandlerErr::bad_params(format!("{} must be a number", key))),
    }
}

pub fn get_optional_bool(params: &Value, key: &str) -> Result<Option<bool>, HandlerErr> {
    match params.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(HandlerErr::bad_params(format!("{} must be a boolean", key))),
    }
}

/// A list of ids. Missing means empty; duplicates and blanks are rejected.
pub fn get_id_list(params: &Value, key: &str) -> Result<Vec<String>, HandlerErr> {
    let Some(raw) = params.get(key) else {
        return Ok(Vec::new());
    };
    if raw.is_null() {
        return Ok(Vec::new());
    }
    let Some(items) = raw.as_array() else {
        return Err(HandlerErr::bad_params(format!("{} must be an array", key)));
    };
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(items.len());
    for item in items {
        let Some(s) = item.as_str().map(str::trim).filter(|s| !s.is_empty()) else {
            return Err(HandlerErr::bad_params(format!(
                "{} must contain non-empty strings",
                key
            )));
        };
        if !seen.insert(s.to_string()) {
            return Err(HandlerErr::bad_params(format!("{} lists {} twice", key, s)));
        }
        out.push(s.to_string());
    }
    Ok(out)
}

/// `params.patch`, defaulting to an empty object.
pub fn get_patch(params: &Value) -> Result<&serde_json::Map<String, Value>, HandlerErr> {
    params
        .get("patch")
        .and_then(|v| v.as_object())
        .ok_or_else(|| HandlerErr::bad_params("missing patch object"))
}

pub fn row_exists(conn: &Connection, table: &str, id: &str) -> Result<bool, HandlerErr> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", table);
    Ok(conn
        .query_row(&sql, [id], |r| r.get::<_, i64>(0))
        .optional()?
        .is_some())
}

pub fn require_row(conn: &Connection, table: &str, id: &str, what: &str) -> Result<(), HandlerErr> {
    if row_exists(conn, table, id)? {
        Ok(())
    } else {
        Err(HandlerErr::not_found(format!("{} not found", what)))
    }
}

pub fn require_role(
    conn: &Connection,
    user_id: &str,
    allowed: impl Fn(Role) -> bool,
    message: &str,
) -> Result<Role, HandlerErr> {
    let Some(role) = access::user_role(conn, user_id)? else {
        return Err(HandlerErr::not_found("user not found").with_details(serde_json::json!({
            "userId": user_id
        })));
    };
    if !allowed(role) {
        return Err(HandlerErr::forbidden(message));
    }
    Ok(role)
}

pub fn require_student(conn: &Connection, user_id: &str) -> Result<(), HandlerErr> {
    require_role(
        conn,
        user_id,
        |r| r == Role::Student,
        "user is not a student",
    )
    .map(|_| ())
}

/// Delete tests of one owner together with their attempts. Runs inside the
/// caller's transaction.
pub fn delete_tests_for_owner(
    conn: &Connection,
    kind: &str,
    owner_id: &str,
) -> Result<usize, HandlerErr> {
    conn.execute(
        "DELETE FROM attempts
         WHERE test_id IN (SELECT id FROM tests WHERE kind = ? AND owner_id = ?)",
        (kind, owner_id),
    )
    .map_err(|e| delete_failed(e, "attempts"))?;
    conn.execute(
        "DELETE FROM tests WHERE kind = ? AND owner_id = ?",
        (kind, owner_id),
    )
    .map_err(|e| delete_failed(e, "tests"))
}

pub fn insert_failed(e: rusqlite::Error, table: &str) -> HandlerErr {
    HandlerErr::new("db_insert_failed", e.to_string())
        .with_details(serde_json::json!({ "table": table }))
}

pub fn update_failed(e: rusqlite::Error, table: &str) -> HandlerErr {
    HandlerErr::new("db_update_failed", e.to_string())
        .with_details(serde_json::json!({ "table": table }))
}

pub fn delete_failed(e: rusqlite::Error, table: &str) -> HandlerErr {
    HandlerErr::new("db_delete_failed", e.to_string())
        .with_details(serde_json::json!({ "table": table }))
}

pub fn tx_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_tx_failed", e.to_string())
}

pub fn commit_failed(e: rusqlite::Error) -> HandlerErr {
    HandlerErr::new("db_commit_failed", e.to_string())
}
