use crate::questions::{is_unanswered, AnswerMatch, Question};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use thiserror::Error;

/// Half-up rounding to one decimal place: `Int(10*x + 0.5) / 10`.
pub fn round_off_1_decimal(x: f64) -> f64 {
    ((10.0 * x) + 0.5).floor() / 10.0
}

fn percent(part: f64, whole: f64) -> f64 {
    if whole > 0.0 {
        round_off_1_decimal(100.0 * part / whole)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Correct,
    Incorrect,
    Unanswered,
    PendingReview,
    Graded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManualGrade {
    pub points: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feedback: Option<String>,
    pub graded_by: String,
    pub graded_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionOutcome {
    pub question_id: String,
    pub question_type: String,
    pub status: OutcomeStatus,
    pub max_points: f64,
    pub earned_points: f64,
    #[serde(default)]
    pub answer: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<Value>,
    #[serde(default)]
    pub hide_answer: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_grade: Option<ManualGrade>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Graded,
    PendingReview,
}

impl AttemptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptStatus::Graded => "graded",
            AttemptStatus::PendingReview => "pending_review",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "graded" => Some(AttemptStatus::Graded),
            "pending_review" => Some(AttemptStatus::PendingReview),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptScore {
    pub outcomes: Vec<QuestionOutcome>,
    pub earned_points: f64,
    pub total_points: f64,
    pub score: f64,
    pub passed: Option<bool>,
    pub status: AttemptStatus,
}

impl AttemptScore {
    pub fn ungraded_question_ids(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::PendingReview)
            .map(|o| o.question_id.clone())
            .collect()
    }
}

/// Score every question of a test against the submitted answers.
///
/// Manually graded questions use `manual_grades` when present; otherwise
/// they stay `pending_review` and contribute nothing until an instructor
/// grades them. Pass/fail is only decided once nothing is pending.
pub fn score_attempt(
    questions: &[Question],
    answers: &Map<String, Value>,
    passing_score: f64,
    manual_grades: &HashMap<String, ManualGrade>,
) -> AttemptScore {
    let mut outcomes = Vec::with_capacity(questions.len());
    let mut earned_points = 0.0_f64;
    let mut total_points = 0.0_f64;
    let mut pending = false;

    for q in questions {
        total_points += q.points;
        let answer = answers.get(&q.id);

        let (status, earned, manual_grade) = if is_unanswered(answer) {
            (OutcomeStatus::Unanswered, 0.0, None)
        } else {
            let answer = answer.unwrap_or(&Value::Null);
            match q.match_answer(answer) {
                AnswerMatch::Correct => (OutcomeStatus::Correct, q.points, None),
                AnswerMatch::Incorrect => (OutcomeStatus::Incorrect, 0.0, None),
                AnswerMatch::NeedsReview => match manual_grades.get(&q.id) {
                    Some(grade) => (
                        OutcomeStatus::Graded,
                        grade.points.clamp(0.0, q.points),
                        Some(grade.clone()),
                    ),
                    None => {
                        pending = true;
                        (OutcomeStatus::PendingReview, 0.0, None)
                    }
                },
            }
        };
        earned_points += earned;

        outcomes.push(QuestionOutcome {
            question_id: q.id.clone(),
            question_type: q.question_type().to_string(),
            status,
            max_points: q.points,
            earned_points: earned,
            answer: answer.cloned().unwrap_or(Value::Null),
            correct_answer: q.correct_answer_display(),
            hide_answer: q.hide_answer,
            manual_grade,
        });
    }

    let score = percent(earned_points, total_points);
    let status = if pending {
        AttemptStatus::PendingReview
    } else {
        AttemptStatus::Graded
    };
    let passed = match status {
        AttemptStatus::Graded => Some(score >= passing_score),
        AttemptStatus::PendingReview => None,
    };

    AttemptScore {
        outcomes,
        earned_points,
        total_points,
        score,
        passed,
        status,
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum GradeError {
    #[error("no grades supplied")]
    Empty,
    #[error("question not found in test: {0}")]
    UnknownQuestion(String),
    #[error("question {0} is scored automatically and cannot be graded manually")]
    NotManual(String),
    #[error("question {0} was not answered")]
    Unanswered(String),
    #[error("points for question {question_id} must be between 0 and {max}")]
    PointsOutOfRange { question_id: String, max: f64 },
    #[error("question {0} is graded more than once in the same request")]
    Duplicate(String),
}

impl GradeError {
    pub fn code(&self) -> &'static str {
        match self {
            GradeError::UnknownQuestion(_) => "not_found",
            _ => "bad_params",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeInput {
    pub question_id: String,
    pub points: f64,
    #[serde(default)]
    pub feedback: Option<String>,
}

/// Validate a batch of instructor grades and merge it over `existing`.
/// Nothing is merged unless every grade in the batch is valid.
pub fn apply_manual_grades(
    questions: &[Question],
    answers: &Map<String, Value>,
    existing: &mut HashMap<String, ManualGrade>,
    grades: &[GradeInput],
    grader_id: &str,
    graded_at: &str,
) -> Result<(), GradeError> {
    if grades.is_empty() {
        return Err(GradeError::Empty);
    }
    let mut seen = HashSet::new();
    for g in grades {
        let Some(q) = questions.iter().find(|q| q.id == g.question_id) else {
            return Err(GradeError::UnknownQuestion(g.question_id.clone()));
        };
        if !q.requires_manual_grading() {
            return Err(GradeError::NotManual(q.id.clone()));
        }
        if is_unanswered(answers.get(&q.id)) {
            return Err(GradeError::Unanswered(q.id.clone()));
        }
        if !g.points.is_finite() || g.points < 0.0 || g.points > q.points {
            return Err(GradeError::PointsOutOfRange {
                question_id: q.id.clone(),
                max: q.points,
            });
        }
        if !seen.insert(q.id.as_str()) {
            return Err(GradeError::Duplicate(q.id.clone()));
        }
    }

    for g in grades {
        let feedback = g
            .feedback
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string);
        existing.insert(
            g.question_id.clone(),
            ManualGrade {
                points: g.points,
                feedback,
                graded_by: grader_id.to_string(),
                graded_at: graded_at.to_string(),
            },
        );
    }
    Ok(())
}

/// Manual grades from a previous scoring run that still apply to the
/// current questions. Grades on questions that became auto-scored or were
/// removed are dropped; points are clamped to the current maximum.
pub fn carry_manual_grades(
    previous: &[QuestionOutcome],
    questions: &[Question],
) -> HashMap<String, ManualGrade> {
    let mut out = HashMap::new();
    for o in previous {
        let Some(grade) = &o.manual_grade else {
            continue;
        };
        let Some(q) = questions.iter().find(|q| q.id == o.question_id) else {
            continue;
        };
        if !q.requires_manual_grading() {
            continue;
        }
        let mut grade = grade.clone();
        grade.points = grade.points.clamp(0.0, q.points);
        out.insert(q.id.clone(), grade);
    }
    out
}

/// Remove correct answers the test author chose to hide from students.
pub fn redact_for_student(outcomes: &mut [QuestionOutcome]) {
    for o in outcomes.iter_mut() {
        if o.hide_answer {
            o.correct_answer = None;
        }
    }
}

fn compute_median(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(Ordering::Equal));
    let n = sorted.len();
    if n % 2 == 1 {
        sorted[n / 2]
    } else {
        (sorted[(n / 2) - 1] + sorted[n / 2]) / 2.0
    }
}

#[derive(Debug, Clone)]
pub struct StoredAttempt {
    pub student_id: String,
    pub status: AttemptStatus,
    pub score: f64,
    pub passed: Option<bool>,
    pub outcomes: Vec<QuestionOutcome>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QuestionStats {
    pub question_id: String,
    pub question_type: String,
    pub max_points: f64,
    pub correct_count: usize,
    pub incorrect_count: usize,
    pub unanswered_count: usize,
    pub pending_count: usize,
    pub graded_count: usize,
    pub average_points: f64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TestResultsSummary {
    pub attempt_count: usize,
    pub student_count: usize,
    pub graded_count: usize,
    pub pending_count: usize,
    pub average_score: f64,
    pub median_score: f64,
    pub pass_count: usize,
    pub pass_rate: f64,
    pub per_question: Vec<QuestionStats>,
}

pub fn summarize_attempts(
    questions: &[Question],
    attempts: &[StoredAttempt],
) -> TestResultsSummary {
    let students: HashSet<&str> = attempts.iter().map(|a| a.student_id.as_str()).collect();
    let graded_scores: Vec<f64> = attempts
        .iter()
        .filter(|a| a.status == AttemptStatus::Graded)
        .map(|a| a.score)
        .collect();
    let graded_count = graded_scores.len();
    let pass_count = attempts.iter().filter(|a| a.passed == Some(true)).count();
    let average_score = if graded_count > 0 {
        round_off_1_decimal(graded_scores.iter().sum::<f64>() / graded_count as f64)
    } else {
        0.0
    };

    let per_question = questions
        .iter()
        .map(|q| {
            let mut stats = QuestionStats {
                question_id: q.id.clone(),
                question_type: q.question_type().to_string(),
                max_points: q.points,
                correct_count: 0,
                incorrect_count: 0,
                unanswered_count: 0,
                pending_count: 0,
                graded_count: 0,
                average_points: 0.0,
            };
            let mut points_sum = 0.0_f64;
            let mut counted = 0_usize;
            for a in attempts {
                let Some(o) = a.outcomes.iter().find(|o| o.question_id == q.id) else {
                    continue;
                };
                match o.status {
                    OutcomeStatus::Correct => stats.correct_count += 1,
                    OutcomeStatus::Incorrect => stats.incorrect_count += 1,
                    OutcomeStatus::Unanswered => stats.unanswered_count += 1,
                    OutcomeStatus::PendingReview => stats.pending_count += 1,
                    OutcomeStatus::Graded => stats.graded_count += 1,
                }
                if o.status != OutcomeStatus::PendingReview {
                    points_sum += o.earned_points;
                    counted += 1;
                }
            }
            if counted > 0 {
                stats.average_points = round_off_1_decimal(points_sum / counted as f64);
            }
            stats
        })
        .collect();

    TestResultsSummary {
        attempt_count: attempts.len(),
        student_count: students.len(),
        graded_count,
        pending_count: attempts.len() - graded_count,
        average_score,
        median_score: round_off_1_decimal(compute_median(&graded_scores)),
        pass_count,
        pass_rate: percent(pass_count as f64, graded_count as f64),
        per_question,
    }
}
