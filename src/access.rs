use rusqlite::{Connection, OptionalExtension};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Student,
    Instructor,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Student => "student",
            Role::Instructor => "instructor",
            Role::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "student" => Some(Role::Student),
            "instructor" | "teacher" => Some(Role::Instructor),
            "admin" => Some(Role::Admin),
            _ => None,
        }
    }

    pub fn can_grade(&self) -> bool {
        matches!(self, Role::Instructor | Role::Admin)
    }
}

pub fn user_role(conn: &Connection, user_id: &str) -> rusqlite::Result<Option<Role>> {
    let role: Option<String> = conn
        .query_row("SELECT role FROM users WHERE id = ?", [user_id], |r| r.get(0))
        .optional()?;
    Ok(role.as_deref().and_then(Role::parse))
}

/// A classroom that includes the program lists the student, or the student
/// is enrolled in one of the program's courses.
pub fn student_can_access_program(
    conn: &Connection,
    student_id: &str,
    program_id: &str,
) -> rusqlite::Result<bool> {
    let hit: i64 = conn.query_row(
        "SELECT EXISTS(
           SELECT 1
           FROM classroom_students cs
           JOIN classroom_programs cp ON cp.classroom_id = cs.classroom_id
           WHERE cs.student_id = ?1 AND cp.program_id = ?2
         ) OR EXISTS(
           SELECT 1
           FROM enrollments e
           JOIN program_courses pc ON pc.course_id = e.course_id
           WHERE e.student_id = ?1 AND pc.program_id = ?2
         )",
        (student_id, program_id),
        |r| r.get(0),
    )?;
    Ok(hit != 0)
}

/// Enrolled in the course, or in a classroom that includes it directly or
/// through one of its programs.
pub fn student_can_access_course(
    conn: &Connection,
    student_id: &str,
    course_id: &str,
) -> rusqlite::Result<bool> {
    let hit: i64 = conn.query_row(
        "SELECT EXISTS(
           SELECT 1 FROM enrollments WHERE student_id = ?1 AND course_id = ?2
         ) OR EXISTS(
           SELECT 1
           FROM classroom_students cs
           JOIN classroom_courses cc ON cc.classroom_id = cs.classroom_id
           WHERE cs.student_id = ?1 AND cc.course_id = ?2
         ) OR EXISTS(
           SELECT 1
           FROM classroom_students cs
           JOIN classroom_programs cp ON cp.classroom_id = cs.classroom_id
           JOIN program_courses pc ON pc.program_id = cp.program_id
           WHERE cs.student_id = ?1 AND pc.course_id = ?2
         )",
        (student_id, course_id),
        |r| r.get(0),
    )?;
    Ok(hit != 0)
}
