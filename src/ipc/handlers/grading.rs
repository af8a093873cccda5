use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::assessments::load_test;
use crate::ipc::handlers::attempts::{load_attempt, write_score, AttemptView};
use crate::ipc::helpers::{
    commit_failed, get_optional_str, get_required_str, now_ts, require_role, tx_failed,
    update_failed, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::scoring::{
    apply_manual_grades, carry_manual_grades, score_attempt, GradeInput, OutcomeStatus,
    QuestionOutcome,
};
use rusqlite::Connection;
use serde_json::{json, Value};

fn pending_questions(outcomes: &[QuestionOutcome]) -> Vec<Value> {
    outcomes
        .iter()
        .filter(|o| o.status == OutcomeStatus::PendingReview)
        .map(|o| {
            json!({
                "questionId": o.question_id,
                "questionType": o.question_type,
                "maxPoints": o.max_points,
                "answer": o.answer,
            })
        })
        .collect()
}

fn grading_pending(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_optional_str(params, "testId")?.filter(|s| !s.is_empty());
    let mut stmt = conn.prepare(
        "SELECT a.id, a.test_id, t.title, a.student_id, u.name, a.submitted_at, a.results_json
         FROM attempts a
         JOIN tests t ON t.id = a.test_id
         JOIN users u ON u.id = a.student_id
         WHERE a.status = 'pending_review' AND (?1 IS NULL OR a.test_id = ?1)
         ORDER BY a.submitted_at, a.id",
    )?;
    let rows = stmt
        .query_map([&test_id], |r| {
            Ok((
                r.get::<_, String>(0)?,
                r.get::<_, String>(1)?,
                r.get::<_, String>(2)?,
                r.get::<_, String>(3)?,
                r.get::<_, String>(4)?,
                r.get::<_, String>(5)?,
                r.get::<_, String>(6)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut attempts = Vec::with_capacity(rows.len());
    for (id, test_id, test_title, student_id, student_name, submitted_at, results_json) in rows {
        let outcomes: Vec<QuestionOutcome> = serde_json::from_str(&results_json)?;
        attempts.push(json!({
            "attemptId": id,
            "testId": test_id,
            "testTitle": test_title,
            "studentId": student_id,
            "studentName": student_name,
            "submittedAt": submitted_at,
            "pendingQuestions": pending_questions(&outcomes),
        }));
    }
    Ok(json!({ "attempts": attempts }))
}

fn grading_submit(conn: &Connection, params: &Value) -> HandlerResult {
    let attempt_id = get_required_str(params, "attemptId")?;
    let grader_id = get_required_str(params, "graderId")?;
    let Some(raw_grades) = params.get("grades").filter(|v| v.is_array()) else {
        return Err(HandlerErr::bad_params("grades must be an array"));
    };
    let grades: Vec<GradeInput> = serde_json::from_value(raw_grades.clone())
        .map_err(|e| HandlerErr::bad_params(format!("invalid grades: {e}")))?;
    require_role(
        conn,
        &grader_id,
        |r| r.can_grade(),
        "only instructors or admins can grade attempts",
    )?;

    let attempt = load_attempt(conn, &attempt_id)?;
    let test = load_test(conn, &attempt.test_id)?;
    let mut manual = carry_manual_grades(&attempt.outcomes, &test.questions);
    // Grading scores against the current definition; record it when that
    // differs from what the attempt was last scored against.
    let baseline = score_attempt(&test.questions, &attempt.answers, test.passing_score, &manual);
    let recalculated =
        baseline.outcomes != attempt.outcomes || baseline.total_points != attempt.total_points;
    let graded_at = now_ts();
    apply_manual_grades(
        &test.questions,
        &attempt.answers,
        &mut manual,
        &grades,
        &grader_id,
        &graded_at,
    )
    .map_err(|e| HandlerErr::new(e.code(), e.to_string()))?;
    let scored = score_attempt(&test.questions, &attempt.answers, test.passing_score, &manual);

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    write_score(&tx, &attempt_id, &scored, Some(graded_at.clone()))?;
    tx.execute(
        "UPDATE attempts SET graded_by = ? WHERE id = ?",
        (&grader_id, &attempt_id),
    )
    .map_err(|e| update_failed(e, "attempts"))?;
    if recalculated {
        tx.execute(
            "UPDATE attempts SET recalculated_at = ? WHERE id = ?",
            (&graded_at, &attempt_id),
        )
        .map_err(|e| update_failed(e, "attempts"))?;
    }
    tx.commit().map_err(commit_failed)?;

    tracing::info!(
        attempt_id = %attempt_id,
        grader_id = %grader_id,
        grades = grades.len(),
        score = scored.score,
        status = scored.status.as_str(),
        recalculated,
        "attempt graded"
    );
    Ok(json!({
        "attempt": load_attempt(conn, &attempt_id)?.to_json(AttemptView::Instructor),
        "remainingQuestionIds": scored.ungraded_question_ids(),
        "recalculated": recalculated,
    }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "grading.pending" => Some(with_db(state, req, grading_pending)),
        "grading.submit" => Some(with_db(state, req, grading_submit)),
        _ => None,
    }
}
