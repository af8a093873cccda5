use crate::access;
use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::assessments::{load_test, TestKind, TestRecord};
use crate::ipc::helpers::{
    get_optional_str, get_required_str, insert_failed, new_id, now_ts, require_student,
    update_failed, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{
    carry_manual_grades, redact_for_student, score_attempt, AttemptScore, AttemptStatus,
    QuestionOutcome,
};
use rusqlite::{Connection, OptionalExtension, Row};
use serde_json::{json, Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptView {
    Student,
    Instructor,
}

#[derive(Debug, Clone)]
pub struct AttemptRecord {
    pub id: String,
    pub test_id: String,
    pub student_id: String,
    pub answers: Map<String, Value>,
    pub outcomes: Vec<QuestionOutcome>,
    pub earned_points: f64,
    pub total_points: f64,
    pub score: f64,
    pub passed: Option<bool>,
    pub status: AttemptStatus,
    pub submitted_at: String,
    pub graded_at: Option<String>,
    pub graded_by: Option<String>,
    pub recalculated_at: Option<String>,
}

impl AttemptRecord {
    pub fn to_json(&self, view: AttemptView) -> Value {
        let mut outcomes = self.outcomes.clone();
        if view == AttemptView::Student {
            redact_for_student(&mut outcomes);
        }
        let mut v = json!({
            "id": self.id,
            "testId": self.test_id,
            "studentId": self.student_id,
            "earnedPoints": self.earned_points,
            "totalPoints": self.total_points,
            "score": self.score,
            "passed": self.passed,
            "status": self.status.as_str(),
            "submittedAt": self.submitted_at,
            "gradedAt": self.graded_at,
            "results": outcomes,
        });
        if view == AttemptView::Instructor {
            v["answers"] = Value::Object(self.answers.clone());
            v["gradedBy"] = json!(self.graded_by);
            v["recalculatedAt"] = json!(self.recalculated_at);
        }
        v
    }
}

const SELECT_ATTEMPT: &str = "SELECT id, test_id, student_id, answers_json, results_json,
        earned_points, total_points, score, passed, status, submitted_at, graded_at,
        graded_by, recalculated_at
 FROM attempts";

type RawAttempt = (
    String,
    String,
    String,
    String,
    String,
    f64,
    f64,
    f64,
    Option<bool>,
    String,
    String,
    Option<String>,
    Option<String>,
    Option<String>,
);

fn raw_attempt(r: &Row<'_>) -> rusqlite::Result<RawAttempt> {
    Ok((
        r.get(0)?,
        r.get(1)?,
        r.get(2)?,
        r.get(3)?,
        r.get(4)?,
        r.get(5)?,
        r.get(6)?,
        r.get(7)?,
        r.get(8)?,
        r.get(9)?,
        r.get(10)?,
        r.get(11)?,
        r.get(12)?,
        r.get(13)?,
    ))
}

fn decode_attempt(raw: RawAttempt) -> Result<AttemptRecord, HandlerErr> {
    let (
        id,
        test_id,
        student_id,
        answers_json,
        results_json,
        earned_points,
        total_points,
        score,
        passed,
        status,
        submitted_at,
        graded_at,
        graded_by,
        recalculated_at,
    ) = raw;
    let answers: Map<String, Value> = serde_json::from_str(&answers_json)?;
    let outcomes: Vec<QuestionOutcome> = serde_json::from_str(&results_json)?;
    let status = AttemptStatus::parse(&status).ok_or_else(|| {
        HandlerErr::new("bad_document", format!("unknown attempt status {}", status))
            .with_details(json!({ "attemptId": id }))
    })?;
    Ok(AttemptRecord {
        id,
        test_id,
        student_id,
        answers,
        outcomes,
        earned_points,
        total_points,
        score,
        passed,
        status,
        submitted_at,
        graded_at,
        graded_by,
        recalculated_at,
    })
}

pub fn load_attempt(conn: &Connection, attempt_id: &str) -> Result<AttemptRecord, HandlerErr> {
    let raw = conn
        .query_row(&format!("{} WHERE id = ?", SELECT_ATTEMPT), [attempt_id], raw_attempt)
        .optional()?
        .ok_or_else(|| HandlerErr::not_found("attempt not found"))?;
    decode_attempt(raw)
}

pub fn load_attempts_for_test(
    conn: &Connection,
    test_id: &str,
) -> Result<Vec<AttemptRecord>, HandlerErr> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE test_id = ? ORDER BY submitted_at, id",
        SELECT_ATTEMPT
    ))?;
    let raws = stmt
        .query_map([test_id], raw_attempt)?
        .collect::<Result<Vec<_>, _>>()?;
    raws.into_iter().map(decode_attempt).collect()
}

/// Persist a scoring run. `graded_at` is only kept while the attempt is
/// fully graded.
pub fn write_score(
    conn: &Connection,
    attempt_id: &str,
    scored: &AttemptScore,
    graded_at: Option<String>,
) -> Result<(), HandlerErr> {
    let graded_at = match scored.status {
        AttemptStatus::Graded => graded_at,
        AttemptStatus::PendingReview => None,
    };
    conn.execute(
        "UPDATE attempts
         SET results_json = ?, earned_points = ?, total_points = ?, score = ?, passed = ?,
             status = ?, graded_at = ?
         WHERE id = ?",
        rusqlite::params![
            serde_json::to_string(&scored.outcomes)?,
            scored.earned_points,
            scored.total_points,
            scored.score,
            scored.passed,
            scored.status.as_str(),
            graded_at,
            attempt_id,
        ],
    )
    .map_err(|e| update_failed(e, "attempts"))?;
    Ok(())
}

/// Rescore a stored attempt against the current test definition, keeping
/// manual grades that still apply. Returns whether anything changed.
pub fn rescore_attempt(
    conn: &Connection,
    test: &TestRecord,
    attempt: &AttemptRecord,
) -> Result<bool, HandlerErr> {
    let grades = carry_manual_grades(&attempt.outcomes, &test.questions);
    let scored = score_attempt(&test.questions, &attempt.answers, test.passing_score, &grades);
    let changed = scored.score != attempt.score
        || scored.earned_points != attempt.earned_points
        || scored.total_points != attempt.total_points
        || scored.passed != attempt.passed
        || scored.status != attempt.status
        || scored.outcomes != attempt.outcomes;

    let graded_at = attempt.graded_at.clone().unwrap_or_else(now_ts);
    write_score(conn, &attempt.id, &scored, Some(graded_at))?;
    conn.execute(
        "UPDATE attempts SET recalculated_at = ? WHERE id = ?",
        (now_ts(), &attempt.id),
    )
    .map_err(|e| update_failed(e, "attempts"))?;
    Ok(changed)
}

fn student_has_access(
    conn: &Connection,
    student_id: &str,
    test: &TestRecord,
) -> Result<bool, HandlerErr> {
    let allowed = match test.kind {
        TestKind::Final => access::student_can_access_program(conn, student_id, &test.owner_id)?,
        TestKind::Quiz => access::student_can_access_course(conn, student_id, &test.owner_id)?,
    };
    Ok(allowed)
}

fn attempts_submit(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_required_str(params, "testId")?;
    let student_id = get_required_str(params, "studentId")?;
    let Some(answers) = params.get("answers").and_then(|v| v.as_object()) else {
        return Err(HandlerErr::bad_params("answers must be an object keyed by question id"));
    };

    let test = load_test(conn, &test_id)?;
    if !test.published {
        return Err(HandlerErr::new("not_published", "test is not published"));
    }
    require_student(conn, &student_id)?;
    if !student_has_access(conn, &student_id, &test)? {
        return Err(HandlerErr::forbidden(match test.kind {
            TestKind::Final => "student has no access to this program",
            TestKind::Quiz => "student has no access to this course",
        }));
    }

    let unknown: Vec<&String> = answers
        .keys()
        .filter(|k| !test.questions.iter().any(|q| &q.id == *k))
        .collect();
    if !unknown.is_empty() {
        return Err(HandlerErr::bad_params("answers reference unknown questions")
            .with_details(json!({ "unknownQuestionIds": unknown })));
    }

    let (prior, passed_before): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(CASE WHEN passed = 1 THEN 1 ELSE 0 END), 0)
         FROM attempts
         WHERE test_id = ? AND student_id = ?",
        (&test_id, &student_id),
        |r| Ok((r.get(0)?, r.get(1)?)),
    )?;
    if test.kind == TestKind::Final && passed_before > 0 {
        return Err(HandlerErr::new("already_passed", "student already passed this final test"));
    }
    if let Some(max) = test.max_attempts {
        if prior >= max {
            return Err(HandlerErr::new("attempts_exhausted", "no attempts left for this test")
                .with_details(json!({ "maxAttempts": max, "attempts": prior })));
        }
    }

    let scored = score_attempt(&test.questions, answers, test.passing_score, &HashMap::new());
    let attempt_id = new_id();
    let now = now_ts();
    let graded_at = (scored.status == AttemptStatus::Graded).then(|| now.clone());
    conn.execute(
        "INSERT INTO attempts(id, test_id, student_id, answers_json, results_json, earned_points,
                              total_points, score, passed, status, submitted_at, graded_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            attempt_id,
            test_id,
            student_id,
            serde_json::to_string(answers)?,
            serde_json::to_string(&scored.outcomes)?,
            scored.earned_points,
            scored.total_points,
            scored.score,
            scored.passed,
            scored.status.as_str(),
            now,
            graded_at,
        ],
    )
    .map_err(|e| insert_failed(e, "attempts"))?;

    tracing::info!(
        attempt_id = %attempt_id,
        test_id = %test_id,
        score = scored.score,
        status = scored.status.as_str(),
        "attempt submitted"
    );
    let attempt = load_attempt(conn, &attempt_id)?;
    Ok(json!({
        "attemptId": attempt_id,
        "attempt": attempt.to_json(AttemptView::Student),
    }))
}

fn parse_view(params: &Value) -> Result<AttemptView, HandlerErr> {
    match get_optional_str(params, "view")?.as_deref() {
        None | Some("") | Some("student") => Ok(AttemptView::Student),
        Some("instructor") => Ok(AttemptView::Instructor),
        Some(_) => Err(HandlerErr::bad_params("view must be student or instructor")),
    }
}

fn attempts_get(conn: &Connection, params: &Value) -> HandlerResult {
    let attempt_id = get_required_str(params, "attemptId")?;
    let view = parse_view(params)?;
    Ok(json!({ "attempt": load_attempt(conn, &attempt_id)?.to_json(view) }))
}

fn attempts_list(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_optional_str(params, "testId")?.filter(|s| !s.is_empty());
    let student_id = get_optional_str(params, "studentId")?.filter(|s| !s.is_empty());
    let mut stmt = conn.prepare(
        "SELECT a.id, a.test_id, t.title, a.student_id, u.name, a.score, a.passed, a.status,
                a.submitted_at, a.graded_at
         FROM attempts a
         JOIN tests t ON t.id = a.test_id
         JOIN users u ON u.id = a.student_id
         WHERE (?1 IS NULL OR a.test_id = ?1) AND (?2 IS NULL OR a.student_id = ?2)
         ORDER BY a.submitted_at, a.id",
    )?;
    let attempts = stmt
        .query_map((&test_id, &student_id), |r| {
            let id: String = r.get(0)?;
            let test_id: String = r.get(1)?;
            let test_title: String = r.get(2)?;
            let student_id: String = r.get(3)?;
            let student_name: String = r.get(4)?;
            let score: f64 = r.get(5)?;
            let passed: Option<bool> = r.get(6)?;
            let status: String = r.get(7)?;
            let submitted_at: String = r.get(8)?;
            let graded_at: Option<String> = r.get(9)?;
            Ok(json!({
                "id": id,
                "testId": test_id,
                "testTitle": test_title,
                "studentId": student_id,
                "studentName": student_name,
                "score": score,
                "passed": passed,
                "status": status,
                "submittedAt": submitted_at,
                "gradedAt": graded_at,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "attempts": attempts }))
}

fn attempts_recalculate(conn: &Connection, params: &Value) -> HandlerResult {
    let attempt_id = get_required_str(params, "attemptId")?;
    let attempt = load_attempt(conn, &attempt_id)?;
    let test = load_test(conn, &attempt.test_id)?;
    let changed = rescore_attempt(conn, &test, &attempt)?;
    tracing::info!(attempt_id = %attempt_id, changed, "attempt recalculated");
    Ok(json!({
        "changed": changed,
        "attempt": load_attempt(conn, &attempt_id)?.to_json(AttemptView::Instructor),
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "attempts.submit" => Some(with_db(state, req, attempts_submit)),
        "attempts.get" => Some(with_db(state, req, attempts_get)),
        "attempts.list" => Some(with_db(state, req, attempts_list)),
        "attempts.recalculate" => Some(with_db(state, req, attempts_recalculate)),
        _ => None,
    }
}
