use crate::access::Role;
use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    get_optional_str, get_patch, get_required_str, insert_failed, new_id, now_ts, update_failed,
    with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

fn user_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let id: String = r.get(0)?;
    let name: String = r.get(1)?;
    let email: String = r.get(2)?;
    let role: String = r.get(3)?;
    let created_at: String = r.get(4)?;
    Ok(json!({
        "id": id,
        "name": name,
        "email": email,
        "role": role,
        "createdAt": created_at,
    }))
}

fn parse_role(raw: &str) -> Result<Role, HandlerErr> {
    Role::parse(raw)
        .ok_or_else(|| HandlerErr::bad_params("role must be student, instructor or admin"))
}

fn load_user(conn: &Connection, user_id: &str) -> HandlerResult {
    conn.query_row(
        "SELECT id, name, email, role, created_at FROM users WHERE id = ?",
        [user_id],
        user_json,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("user not found"))
}

fn users_create(conn: &Connection, params: &Value) -> HandlerResult {
    let name = get_required_str(params, "name")?;
    let email = get_required_str(params, "email")?.to_lowercase();
    if !email.contains('@') {
        return Err(HandlerErr::bad_params("email must contain @"));
    }
    let role = parse_role(&get_required_str(params, "role")?)?;

    let taken: Option<String> = conn
        .query_row("SELECT id FROM users WHERE email = ?", [&email], |r| r.get(0))
        .optional()?;
    if let Some(existing) = taken {
        return Err(HandlerErr::conflict("email already registered")
            .with_details(json!({ "userId": existing })));
    }

    let user_id = new_id();
    conn.execute(
        "INSERT INTO users(id, name, email, role, created_at) VALUES(?, ?, ?, ?, ?)",
        (&user_id, &name, &email, role.as_str(), now_ts()),
    )
    .map_err(|e| insert_failed(e, "users"))?;

    Ok(json!({ "userId": user_id, "role": role.as_str() }))
}

fn users_list(conn: &Connection, params: &Value) -> HandlerResult {
    let role = match get_optional_str(params, "role")? {
        Some(r) if !r.is_empty() => Some(parse_role(&r)?),
        _ => None,
    };
    let mut stmt = conn.prepare(
        "SELECT id, name, email, role, created_at
         FROM users
         WHERE ?1 IS NULL OR role = ?1
         ORDER BY name, email",
    )?;
    let users = stmt
        .query_map([role.map(|r| r.as_str())], user_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "users": users }))
}

fn users_get(conn: &Connection, params: &Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    Ok(json!({ "user": load_user(conn, &user_id)? }))
}

fn users_update(conn: &Connection, params: &Value) -> HandlerResult {
    let user_id = get_required_str(params, "userId")?;
    let patch = Value::Object(get_patch(params)?.clone());
    load_user(conn, &user_id)?;

    if let Some(name) = get_optional_str(&patch, "name")? {
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        conn.execute("UPDATE users SET name = ? WHERE id = ?", (&name, &user_id))
            .map_err(|e| update_failed(e, "users"))?;
    }
    if let Some(role) = get_optional_str(&patch, "role")? {
        let role = parse_role(&role)?;
        conn.execute(
            "UPDATE users SET role = ? WHERE id = ?",
            (role.as_str(), &user_id),
        )
        .map_err(|e| update_failed(e, "users"))?;
    }

    Ok(json!({ "user": load_user(conn, &user_id)? }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "users.create" => Some(with_db(state, req, users_create)),
        "users.list" => Some(with_db(state, req, users_list)),
        "users.get" => Some(with_db(state, req, users_get)),
        "users.update" => Some(with_db(state, req, users_update)),
        _ => None,
    }
}
