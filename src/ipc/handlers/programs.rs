use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    commit_failed, delete_failed, delete_tests_for_owner, get_id_list, get_optional_str,
    get_patch, get_required_str, insert_failed, new_id, now_ts, require_row, row_exists,
    tx_failed, update_failed, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

fn set_program_courses(
    conn: &Connection,
    program_id: &str,
    course_ids: &[String],
) -> Result<(), HandlerErr> {
    for cid in course_ids {
        if !row_exists(conn, "courses", cid)? {
            return Err(HandlerErr::not_found("course not found")
                .with_details(json!({ "courseId": cid })));
        }
    }
    conn.execute(
        "DELETE FROM program_courses WHERE program_id = ?",
        [program_id],
    )
    .map_err(|e| delete_failed(e, "program_courses"))?;
    for (i, cid) in course_ids.iter().enumerate() {
        conn.execute(
            "INSERT INTO program_courses(program_id, course_id, sort_order) VALUES(?, ?, ?)",
            (program_id, cid, i as i64),
        )
        .map_err(|e| insert_failed(e, "program_courses"))?;
    }
    Ok(())
}

fn load_program(conn: &Connection, program_id: &str) -> HandlerResult {
    let row: Option<(String, Option<String>, String, String)> = conn
        .query_row(
            "SELECT title, description, created_at, updated_at FROM programs WHERE id = ?",
            [program_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
        )
        .optional()?;
    let Some((title, description, created_at, updated_at)) = row else {
        return Err(HandlerErr::not_found("program not found"));
    };

    let mut courses_stmt = conn.prepare(
        "SELECT c.id, c.title
         FROM program_courses pc
         JOIN courses c ON c.id = pc.course_id
         WHERE pc.program_id = ?
         ORDER BY pc.sort_order",
    )?;
    let courses = courses_stmt
        .query_map([program_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            Ok(json!({ "id": id, "title": title }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut tests_stmt = conn.prepare(
        "SELECT id, title, published
         FROM tests
         WHERE kind = 'final' AND owner_id = ?
         ORDER BY created_at, title",
    )?;
    let final_tests = tests_stmt
        .query_map([program_id], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let published: i64 = r.get(2)?;
            Ok(json!({ "id": id, "title": title, "published": published != 0 }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "id": program_id,
        "title": title,
        "description": description,
        "createdAt": created_at,
        "updatedAt": updated_at,
        "courses": courses,
        "finalTests": final_tests,
    }))
}

fn programs_create(conn: &Connection, params: &Value) -> HandlerResult {
    let title = get_required_str(params, "title")?;
    let description = get_optional_str(params, "description")?;
    let course_ids = get_id_list(params, "courseIds")?;

    let program_id = new_id();
    let now = now_ts();
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    tx.execute(
        "INSERT INTO programs(id, title, description, created_at, updated_at) VALUES(?, ?, ?, ?, ?)",
        (&program_id, &title, &description, &now, &now),
    )
    .map_err(|e| insert_failed(e, "programs"))?;
    set_program_courses(&tx, &program_id, &course_ids)?;
    tx.commit().map_err(commit_failed)?;

    Ok(json!({ "programId": program_id, "title": title }))
}

fn programs_list(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut stmt = conn.prepare(
        "SELECT
           p.id,
           p.title,
           (SELECT COUNT(*) FROM program_courses pc WHERE pc.program_id = p.id) AS course_count,
           (SELECT COUNT(*) FROM tests t WHERE t.kind = 'final' AND t.owner_id = p.id) AS final_test_count
         FROM programs p
         ORDER BY p.title",
    )?;
    let programs = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let course_count: i64 = r.get(2)?;
            let final_test_count: i64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "title": title,
                "courseCount": course_count,
                "finalTestCount": final_test_count,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "programs": programs }))
}

fn programs_get(conn: &Connection, params: &Value) -> HandlerResult {
    let program_id = get_required_str(params, "programId")?;
    Ok(json!({ "program": load_program(conn, &program_id)? }))
}

fn programs_update(conn: &Connection, params: &Value) -> HandlerResult {
    let program_id = get_required_str(params, "programId")?;
    let patch = Value::Object(get_patch(params)?.clone());
    require_row(conn, "programs", &program_id, "program")?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    if let Some(title) = get_optional_str(&patch, "title")? {
        if title.is_empty() {
            return Err(HandlerErr::bad_params("title must not be empty"));
        }
        tx.execute("UPDATE programs SET title = ? WHERE id = ?", (&title, &program_id))
            .map_err(|e| update_failed(e, "programs"))?;
    }
    if patch.get("description").is_some() {
        let description = get_optional_str(&patch, "description")?;
        tx.execute(
            "UPDATE programs SET description = ? WHERE id = ?",
            (&description, &program_id),
        )
        .map_err(|e| update_failed(e, "programs"))?;
    }
    if patch.get("courseIds").is_some() {
        let course_ids = get_id_list(&patch, "courseIds")?;
        set_program_courses(&tx, &program_id, &course_ids)?;
    }
    tx.execute(
        "UPDATE programs SET updated_at = ? WHERE id = ?",
        (now_ts(), &program_id),
    )
    .map_err(|e| update_failed(e, "programs"))?;
    tx.commit().map_err(commit_failed)?;

    Ok(json!({ "program": load_program(conn, &program_id)? }))
}

fn programs_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let program_id = get_required_str(params, "programId")?;
    require_row(conn, "programs", &program_id, "program")?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let final_tests_deleted = delete_tests_for_owner(&tx, "final", &program_id)?;
    for table in ["classroom_programs", "program_courses"] {
        tx.execute(
            &format!("DELETE FROM {} WHERE program_id = ?", table),
            [&program_id],
        )
        .map_err(|e| delete_failed(e, table))?;
    }
    tx.execute("DELETE FROM programs WHERE id = ?", [&program_id])
        .map_err(|e| delete_failed(e, "programs"))?;
    tx.commit().map_err(commit_failed)?;

    tracing::info!(program_id = %program_id, final_tests_deleted, "program deleted");
    Ok(json!({ "ok": true, "finalTestsDeleted": final_tests_deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "programs.create" => Some(with_db(state, req, programs_create)),
        "programs.list" => Some(with_db(state, req, programs_list)),
        "programs.get" => Some(with_db(state, req, programs_get)),
        "programs.update" => Some(with_db(state, req, programs_update)),
        "programs.delete" => Some(with_db(state, req, programs_delete)),
        _ => None,
    }
}
