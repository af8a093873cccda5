use crate::ipc::error::HandlerErr;
use crate::ipc::helpers::{
    delete_failed, get_optional_f64, get_optional_str, get_required_str, insert_failed, new_id,
    now_ts, require_row, require_student, update_failed, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Value};

const SELECT_ENROLLMENT: &str = "SELECT e.id, e.student_id, e.course_id, c.title, e.progress,
        e.status, e.enrolled_at, e.completed_at
 FROM enrollments e
 JOIN courses c ON c.id = e.course_id";

fn enrollment_json(r: &Row<'_>) -> rusqlite::Result<Value> {
    let id: String = r.get(0)?;
    let student_id: String = r.get(1)?;
    let course_id: String = r.get(2)?;
    let course_title: String = r.get(3)?;
    let progress: f64 = r.get(4)?;
    let status: String = r.get(5)?;
    let enrolled_at: String = r.get(6)?;
    let completed_at: Option<String> = r.get(7)?;
    Ok(json!({
        "id": id,
        "studentId": student_id,
        "courseId": course_id,
        "courseTitle": course_title,
        "progress": progress,
        "status": status,
        "enrolledAt": enrolled_at,
        "completedAt": completed_at,
    }))
}

fn load_enrollment(conn: &Connection, enrollment_id: &str) -> HandlerResult {
    conn.query_row(
        &format!("{} WHERE e.id = ?", SELECT_ENROLLMENT),
        [enrollment_id],
        enrollment_json,
    )
    .optional()?
    .ok_or_else(|| HandlerErr::not_found("enrollment not found"))
}

/// Insert an active enrollment unless one already exists. Returns whether a
/// row was created.
pub fn ensure_enrollment(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> Result<bool, HandlerErr> {
    let changed = conn
        .execute(
            "INSERT OR IGNORE INTO enrollments(id, student_id, course_id, progress, status, enrolled_at)
             VALUES(?, ?, ?, 0, 'active', ?)",
            (new_id(), student_id, course_id, now_ts()),
        )
        .map_err(|e| insert_failed(e, "enrollments"))?;
    Ok(changed > 0)
}

fn enrollments_create(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = get_required_str(params, "studentId")?;
    let course_id = get_required_str(params, "courseId")?;
    require_student(conn, &student_id)?;
    require_row(conn, "courses", &course_id, "course")?;

    let created = ensure_enrollment(conn, &student_id, &course_id)?;
    let enrollment = conn.query_row(
        &format!("{} WHERE e.student_id = ? AND e.course_id = ?", SELECT_ENROLLMENT),
        (&student_id, &course_id),
        enrollment_json,
    )?;
    Ok(json!({ "created": created, "enrollment": enrollment }))
}

fn enrollments_list(conn: &Connection, params: &Value) -> HandlerResult {
    let student_id = get_optional_str(params, "studentId")?.filter(|s| !s.is_empty());
    let course_id = get_optional_str(params, "courseId")?.filter(|s| !s.is_empty());
    let mut stmt = conn.prepare(&format!(
        "{} WHERE (?1 IS NULL OR e.student_id = ?1) AND (?2 IS NULL OR e.course_id = ?2)
         ORDER BY e.enrolled_at, c.title",
        SELECT_ENROLLMENT
    ))?;
    let enrollments = stmt
        .query_map((&student_id, &course_id), enrollment_json)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "enrollments": enrollments }))
}

fn enrollments_update_progress(conn: &Connection, params: &Value) -> HandlerResult {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let Some(progress) = get_optional_f64(params, "progress")? else {
        return Err(HandlerErr::bad_params("missing progress"));
    };
    let progress = progress.clamp(0.0, 100.0);
    let current = load_enrollment(conn, &enrollment_id)?;

    if progress >= 100.0 {
        let completed_at = current
            .get("completedAt")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(now_ts);
        conn.execute(
            "UPDATE enrollments SET progress = ?, status = 'completed', completed_at = ? WHERE id = ?",
            (progress, &completed_at, &enrollment_id),
        )
        .map_err(|e| update_failed(e, "enrollments"))?;
    } else {
        conn.execute(
            "UPDATE enrollments SET progress = ?, status = 'active', completed_at = NULL WHERE id = ?",
            (progress, &enrollment_id),
        )
        .map_err(|e| update_failed(e, "enrollments"))?;
    }

    Ok(json!({ "enrollment": load_enrollment(conn, &enrollment_id)? }))
}

fn enrollments_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let enrollment_id = get_required_str(params, "enrollmentId")?;
    let deleted = conn
        .execute("DELETE FROM enrollments WHERE id = ?", [&enrollment_id])
        .map_err(|e| delete_failed(e, "enrollments"))?;
    if deleted == 0 {
        return Err(HandlerErr::not_found("enrollment not found"));
    }
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "enrollments.create" => Some(with_db(state, req, enrollments_create)),
        "enrollments.list" => Some(with_db(state, req, enrollments_list)),
        "enrollments.updateProgress" => Some(with_db(state, req, enrollments_update_progress)),
        "enrollments.delete" => Some(with_db(state, req, enrollments_delete)),
        _ => None,
    }
}
