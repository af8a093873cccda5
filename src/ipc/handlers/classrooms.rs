use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::enrollments::ensure_enrollment;
use crate::ipc::helpers::{
    commit_failed, delete_failed, get_id_list, get_optional_str, get_patch, get_required_str,
    insert_failed, new_id, now_ts, require_role, require_row, require_student, tx_failed,
    update_failed, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};
use std::collections::BTreeSet;

fn check_instructor(conn: &Connection, instructor_id: Option<&str>) -> Result<(), HandlerErr> {
    if let Some(id) = instructor_id {
        require_role(
            conn,
            id,
            |r| r.can_grade(),
            "classroom instructor must be an instructor or admin",
        )?;
    }
    Ok(())
}

fn replace_links(
    conn: &Connection,
    table: &str,
    column: &str,
    target_table: &str,
    classroom_id: &str,
    ids: &[String],
) -> Result<(), HandlerErr> {
    for id in ids {
        require_row(conn, target_table, id, column.trim_end_matches("_id"))
            .map_err(|e| e.with_details(json!({ column: id })))?;
    }
    conn.execute(
        &format!("DELETE FROM {} WHERE classroom_id = ?", table),
        [classroom_id],
    )
    .map_err(|e| delete_failed(e, table))?;
    for id in ids {
        conn.execute(
            &format!("INSERT INTO {}(classroom_id, {}) VALUES(?, ?)", table, column),
            (classroom_id, id),
        )
        .map_err(|e| insert_failed(e, table))?;
    }
    Ok(())
}

fn linked_ids(conn: &Connection, sql: &str, classroom_id: &str) -> Result<Vec<String>, HandlerErr> {
    let mut stmt = conn.prepare(sql)?;
    let ids = stmt
        .query_map([classroom_id], |r| r.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(ids)
}

/// Every course a classroom grants: its own courses plus the courses of its
/// programs.
fn classroom_course_ids(
    conn: &Connection,
    classroom_id: &str,
) -> Result<BTreeSet<String>, HandlerErr> {
    let mut stmt = conn.prepare(
        "SELECT course_id FROM classroom_courses WHERE classroom_id = ?1
         UNION
         SELECT pc.course_id
         FROM classroom_programs cp
         JOIN program_courses pc ON pc.program_id = cp.program_id
         WHERE cp.classroom_id = ?1",
    )?;
    let ids = stmt
        .query_map([classroom_id], |r| r.get::<_, String>(0))?
        .collect::<Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

fn load_classroom(conn: &Connection, classroom_id: &str) -> HandlerResult {
    let row: Option<(String, Option<String>, String)> = conn
        .query_row(
            "SELECT name, instructor_id, created_at FROM classrooms WHERE id = ?",
            [classroom_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()?;
    let Some((name, instructor_id, created_at)) = row else {
        return Err(HandlerErr::not_found("classroom not found"));
    };

    let program_ids = linked_ids(
        conn,
        "SELECT program_id FROM classroom_programs WHERE classroom_id = ? ORDER BY program_id",
        classroom_id,
    )?;
    let course_ids = linked_ids(
        conn,
        "SELECT course_id FROM classroom_courses WHERE classroom_id = ? ORDER BY course_id",
        classroom_id,
    )?;

    let mut students_stmt = conn.prepare(
        "SELECT u.id, u.name, u.email
         FROM classroom_students cs
         JOIN users u ON u.id = cs.student_id
         WHERE cs.classroom_id = ?
         ORDER BY u.name, u.email",
    )?;
    let students = students_stmt
        .query_map([classroom_id], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let email: String = r.get(2)?;
            Ok(json!({ "id": id, "name": name, "email": email }))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(json!({
        "id": classroom_id,
        "name": name,
        "instructorId": instructor_id,
        "createdAt": created_at,
        "programIds": program_ids,
        "courseIds": course_ids,
        "students": students,
    }))
}

fn classrooms_create(conn: &Connection, params: &Value) -> HandlerResult {
    let name = get_required_str(params, "name")?;
    let instructor_id = get_optional_str(params, "instructorId")?.filter(|s| !s.is_empty());
    let program_ids = get_id_list(params, "programIds")?;
    let course_ids = get_id_list(params, "courseIds")?;
    check_instructor(conn, instructor_id.as_deref())?;

    let classroom_id = new_id();
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    tx.execute(
        "INSERT INTO classrooms(id, name, instructor_id, created_at) VALUES(?, ?, ?, ?)",
        (&classroom_id, &name, &instructor_id, now_ts()),
    )
    .map_err(|e| insert_failed(e, "classrooms"))?;
    replace_links(
        &tx,
        "classroom_programs",
        "program_id",
        "programs",
        &classroom_id,
        &program_ids,
    )?;
    replace_links(&tx, "classroom_courses", "course_id", "courses", &classroom_id, &course_ids)?;
    tx.commit().map_err(commit_failed)?;

    Ok(json!({ "classroomId": classroom_id, "name": name }))
}

fn classrooms_list(conn: &Connection, _params: &Value) -> HandlerResult {
    let mut stmt = conn.prepare(
        "SELECT
           c.id,
           c.name,
           c.instructor_id,
           (SELECT COUNT(*) FROM classroom_students s WHERE s.classroom_id = c.id) AS student_count,
           (SELECT COUNT(*) FROM classroom_programs p WHERE p.classroom_id = c.id) AS program_count,
           (SELECT COUNT(*) FROM classroom_courses k WHERE k.classroom_id = c.id) AS course_count
         FROM classrooms c
         ORDER BY c.name",
    )?;
    let classrooms = stmt
        .query_map([], |r| {
            let id: String = r.get(0)?;
            let name: String = r.get(1)?;
            let instructor_id: Option<String> = r.get(2)?;
            let student_count: i64 = r.get(3)?;
            let program_count: i64 = r.get(4)?;
            let course_count: i64 = r.get(5)?;
            Ok(json!({
                "id": id,
                "name": name,
                "instructorId": instructor_id,
                "studentCount": student_count,
                "programCount": program_count,
                "courseCount": course_count,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "classrooms": classrooms }))
}

fn classrooms_get(conn: &Connection, params: &Value) -> HandlerResult {
    let classroom_id = get_required_str(params, "classroomId")?;
    Ok(json!({ "classroom": load_classroom(conn, &classroom_id)? }))
}

fn classrooms_update(conn: &Connection, params: &Value) -> HandlerResult {
    let classroom_id = get_required_str(params, "classroomId")?;
    let patch = Value::Object(get_patch(params)?.clone());
    require_row(conn, "classrooms", &classroom_id, "classroom")?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    if let Some(name) = get_optional_str(&patch, "name")? {
        if name.is_empty() {
            return Err(HandlerErr::bad_params("name must not be empty"));
        }
        tx.execute("UPDATE classrooms SET name = ? WHERE id = ?", (&name, &classroom_id))
            .map_err(|e| update_failed(e, "classrooms"))?;
    }
    if patch.get("instructorId").is_some() {
        let instructor_id = get_optional_str(&patch, "instructorId")?.filter(|s| !s.is_empty());
        check_instructor(&tx, instructor_id.as_deref())?;
        tx.execute(
            "UPDATE classrooms SET instructor_id = ? WHERE id = ?",
            (&instructor_id, &classroom_id),
        )
        .map_err(|e| update_failed(e, "classrooms"))?;
    }
    if patch.get("programIds").is_some() {
        let ids = get_id_list(&patch, "programIds")?;
        replace_links(&tx, "classroom_programs", "program_id", "programs", &classroom_id, &ids)?;
    }
    if patch.get("courseIds").is_some() {
        let ids = get_id_list(&patch, "courseIds")?;
        replace_links(&tx, "classroom_courses", "course_id", "courses", &classroom_id, &ids)?;
    }
    tx.commit().map_err(commit_failed)?;

    Ok(json!({ "classroom": load_classroom(conn, &classroom_id)? }))
}

fn classrooms_assign_students(conn: &Connection, params: &Value) -> HandlerResult {
    let classroom_id = get_required_str(params, "classroomId")?;
    let student_ids = get_id_list(params, "studentIds")?;
    if student_ids.is_empty() {
        return Err(HandlerErr::bad_params("studentIds must not be empty"));
    }
    require_row(conn, "classrooms", &classroom_id, "classroom")?;
    for sid in &student_ids {
        require_student(conn, sid)?;
    }

    let course_ids = classroom_course_ids(conn, &classroom_id)?;
    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let mut assigned = 0_usize;
    let mut enrollments_created = 0_usize;
    for sid in &student_ids {
        assigned += tx
            .execute(
                "INSERT OR IGNORE INTO classroom_students(classroom_id, student_id) VALUES(?, ?)",
                (&classroom_id, sid),
            )
            .map_err(|e| insert_failed(e, "classroom_students"))?;
        for cid in &course_ids {
            if ensure_enrollment(&tx, sid, cid)? {
                enrollments_created += 1;
            }
        }
    }
    tx.commit().map_err(commit_failed)?;

    tracing::info!(
        classroom_id = %classroom_id,
        assigned,
        enrollments_created,
        "students assigned to classroom"
    );
    Ok(json!({
        "assigned": assigned,
        "enrollmentsCreated": enrollments_created,
    }))
}

fn classrooms_remove_student(conn: &Connection, params: &Value) -> HandlerResult {
    let classroom_id = get_required_str(params, "classroomId")?;
    let student_id = get_required_str(params, "studentId")?;
    let removed = conn
        .execute(
            "DELETE FROM classroom_students WHERE classroom_id = ? AND student_id = ?",
            (&classroom_id, &student_id),
        )
        .map_err(|e| delete_failed(e, "classroom_students"))?;
    if removed == 0 {
        return Err(HandlerErr::not_found("student is not in this classroom"));
    }
    Ok(json!({ "ok": true }))
}

fn classrooms_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let classroom_id = get_required_str(params, "classroomId")?;
    require_row(conn, "classrooms", &classroom_id, "classroom")?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    for table in ["classroom_students", "classroom_programs", "classroom_courses"] {
        tx.execute(
            &format!("DELETE FROM {} WHERE classroom_id = ?", table),
            [&classroom_id],
        )
        .map_err(|e| delete_failed(e, table))?;
    }
    tx.execute("DELETE FROM classrooms WHERE id = ?", [&classroom_id])
        .map_err(|e| delete_failed(e, "classrooms"))?;
    tx.commit().map_err(commit_failed)?;
    Ok(json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "classrooms.create" => Some(with_db(state, req, classrooms_create)),
        "classrooms.list" => Some(with_db(state, req, classrooms_list)),
        "classrooms.get" => Some(with_db(state, req, classrooms_get)),
        "classrooms.update" => Some(with_db(state, req, classrooms_update)),
        "classrooms.assignStudents" => Some(with_db(state, req, classrooms_assign_students)),
        "classrooms.removeStudent" => Some(with_db(state, req, classrooms_remove_student)),
        "classrooms.delete" => Some(with_db(state, req, classrooms_delete)),
        _ => None,
    }
}
