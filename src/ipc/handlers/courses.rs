use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    commit_failed, delete_failed, delete_tests_for_owner, get_optional_str, get_patch,
    get_required_str, insert_failed, new_id, now_ts, require_row, tx_failed, update_failed,
    with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

fn load_course(conn: &Connection, course_id: &str) -> HandlerResult {
    conn.query_row(
        "SELECT
           c.id,
           c.title,
           c.description,
           c.created_at,
           c.updated_at,
           (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id),
           (SELECT COUNT(*) FROM tests t WHERE t.kind = 'quiz' AND t.owner_id = c.id)
         FROM courses c
         WHERE c.id = ?",
        [course_id],
        |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let description: Option<String> = r.get(2)?;
            let created_at: String = r.get(3)?;
            let updated_at: String = r.get(4)?;
            let enrollment_count: i64 = r.get(5)?;
            let quiz_count: i64 = r.get(6)?;
            Ok(json!({
                "id": id,
                "title": title,
                "description": description,
                "createdAt": created_at,
                "updatedAt": updated_at,
                "enrollmentCount": enrollment_count,
                "quizCount": quiz_count,
            }))
        },
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("course not found"))
}

fn courses_create(conn: &Connection, params: &Value) -> HandlerResult {
    let title = get_required_str(params, "title")?;
    let description = get_optional_str(params, "description")?;
    let course_id = new_id();
    let now = now_ts();
    conn.execute(
        "INSERT INTO courses(id, title, description, created_at, updated_at) VALUES(?, ?, ?, ?, ?)",
        (&course_id, &title, &description, &now, &now),
    )
    .map_err(|e| insert_failed(e, "courses"))?;
    Ok(json!({ "courseId": course_id, "title": title }))
}

fn courses_list(conn: &Connection, _params: &Value) -> HandlerResult {
    // Correlated subqueries keep the counts independent of each other.
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.title,
           (SELECT COUNT(*) FROM enrollments e WHERE e.course_id = c.id) AS enrollment_count,
           (SELECT COUNT(*) FROM program_courses pc WHERE pc.course_id = c.id) AS program_count
         FROM courses c
         ORDER BY c.title",
    )?;
    let courses = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let title: String = r.get(1)?;
            let enrollment_count: i64 = r.get(2)?;
            let program_count: i64 = r.get(3)?;
            Ok(json!({
                "id": id,
                "title": title,
                "enrollmentCount": enrollment_count,
                "programCount": program_count,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "courses": courses }))
}

fn courses_get(conn: &Connection, params: &Value) -> HandlerResult {
    let course_id = get_required_str(params, "courseId")?;
    Ok(json!({ "course": load_course(conn, &course_id)? }))
}

fn courses_update(conn: &Connection, params: &Value) -> HandlerResult {
    let course_id = get_required_str(params, "courseId")?;
    let patch = Value::Object(get_patch(params)?.clone());
    require_row(conn, "courses", &course_id, "course")?;

    if let Some(title) = get_optional_str(&patch, "title")? {
        if title.is_empty() {
            return Err(HandlerErr::bad_params("title must not be empty"));
        }
        conn.execute("UPDATE courses SET title = ? WHERE id = ?", (&title, &course_id))
            .map_err(|e| update_failed(e, "courses"))?;
    }
    if patch.get("description").is_some() {
        let description = get_optional_str(&patch, "description")?;
        conn.execute(
            "UPDATE courses SET description = ? WHERE id = ?",
            (&description, &course_id),
        )
        .map_err(|e| update_failed(e, "courses"))?;
    }
    conn.execute(
        "UPDATE courses SET updated_at = ? WHERE id = ?",
        (now_ts(), &course_id),
    )
    .map_err(|e| update_failed(e, "courses"))?;

    Ok(json!({ "course": load_course(conn, &course_id)? }))
}

fn courses_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let course_id = get_required_str(params, "courseId")?;
    require_row(conn, "courses", &course_id, "course")?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let quizzes_deleted = delete_tests_for_owner(&tx, "quiz", &course_id)?;
    for table in ["enrollments", "program_courses", "classroom_courses"] {
        tx.execute(
            &format!("DELETE FROM {} WHERE course_id = ?", table),
            [&course_id],
        )
        .map_err(|e| delete_failed(e, table))?;
    }
    tx.execute("DELETE FROM courses WHERE id = ?", [&course_id])
        .map_err(|e| delete_failed(e, "courses"))?;
    tx.commit().map_err(commit_failed)?;

    tracing::info!(course_id = %course_id, quizzes_deleted, "course deleted");
    Ok(json!({ "ok": true, "quizzesDeleted": quizzes_deleted }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "courses.create" => Some(with_db(state, req, courses_create)),
        "courses.list" => Some(with_db(state, req, courses_list)),
        "courses.get" => Some(with_db(state, req, courses_get)),
        "courses.update" => Some(with_db(state, req, courses_update)),
        "courses.delete" => Some(with_db(state, req, courses_delete)),
        _ => None,
    }
}
