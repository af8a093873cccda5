use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error, PartialEq)]
pub enum QuestionError {
    #[error("a test must contain at least one question")]
    Empty,
    #[error("question {index}: {message}")]
    Invalid { index: usize, message: String },
    #[error("duplicate question id: {0}")]
    DuplicateId(String),
    #[error("invalid questions: {0}")]
    Malformed(String),
}

impl QuestionError {
    pub fn code(&self) -> &'static str {
        "bad_params"
    }

    fn invalid(index: usize, message: impl Into<String>) -> Self {
        QuestionError::Invalid {
            index,
            message: message.into(),
        }
    }
}

fn default_points() -> f64 {
    1.0
}

/// One question of a final test or quiz, stored as part of the test document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    #[serde(default)]
    pub id: String,
    #[serde(alias = "prompt", alias = "text")]
    pub question: String,
    #[serde(default = "default_points")]
    pub points: f64,
    #[serde(default)]
    pub hide_answer: bool,
    #[serde(flatten)]
    pub body: QuestionBody,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QuestionBody {
    #[serde(alias = "multiple-choice")]
    MultipleChoice {
        options: Vec<String>,
        #[serde(rename = "correctAnswer")]
        correct_answer: Value,
    },
    #[serde(alias = "select-all-that-apply", alias = "select_all")]
    SelectAllThatApply {
        options: Vec<String>,
        #[serde(rename = "correctAnswers")]
        correct_answers: Vec<Value>,
    },
    #[serde(alias = "true-false", alias = "true_or_false")]
    TrueFalse {
        #[serde(rename = "correctAnswer")]
        correct_answer: Value,
    },
    #[serde(alias = "short-answer")]
    ShortAnswer {
        #[serde(
            rename = "correctAnswer",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        correct_answer: Option<String>,
        #[serde(
            rename = "acceptedAnswers",
            default,
            skip_serializing_if = "Vec::is_empty"
        )]
        accepted_answers: Vec<String>,
    },
    Essay {},
    #[serde(alias = "chronological-order")]
    ChronologicalOrder { items: Vec<String> },
}

/// Result of matching a non-empty answer against a question's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerMatch {
    Correct,
    Incorrect,
    NeedsReview,
}

/// Lowercase, trim and collapse runs of whitespace.
pub fn normalize_text(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Resolve an option reference to an index. Accepts option text, a numeric
/// index, or a single letter (`A` is the first option). Text wins so that
/// options which are themselves numbers or letters stay unambiguous.
pub fn resolve_option(options: &[String], value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n
            .as_u64()
            .map(|i| i as usize)
            .filter(|i| *i < options.len()),
        Value::String(s) => {
            let wanted = normalize_text(s);
            if wanted.is_empty() {
                return None;
            }
            if let Some(i) = options.iter().position(|o| normalize_text(o) == wanted) {
                return Some(i);
            }
            if let Ok(i) = wanted.parse::<usize>() {
                return (i < options.len()).then_some(i);
            }
            let mut chars = wanted.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_lowercase() => {
                    let i = (c as u8 - b'a') as usize;
                    (i < options.len()).then_some(i)
                }
                _ => None,
            }
        }
        _ => None,
    }
}

pub fn parse_bool(value: &Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(1) => Some(true),
            Some(0) => Some(false),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "t" | "yes" | "1" => Some(true),
            "false" | "f" | "no" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Missing, null, blank strings and empty lists all count as no answer.
pub fn is_unanswered(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(_) => false,
    }
}

fn answer_list(value: &Value) -> Vec<&Value> {
    match value {
        Value::Array(items) => items.iter().collect(),
        other => vec![other],
    }
}

fn answer_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn resolve_item(items: &[String], value: &Value) -> Option<usize> {
    if let Value::String(s) = value {
        let wanted = normalize_text(s);
        if let Some(i) = items.iter().position(|it| normalize_text(it) == wanted) {
            return Some(i);
        }
        return wanted.parse::<usize>().ok().filter(|i| *i < items.len());
    }
    value
        .as_u64()
        .map(|i| i as usize)
        .filter(|i| *i < items.len())
}

impl Question {
    pub fn question_type(&self) -> &'static str {
        match &self.body {
            QuestionBody::MultipleChoice { .. } => "multiple_choice",
            QuestionBody::SelectAllThatApply { .. } => "select_all_that_apply",
            QuestionBody::TrueFalse { .. } => "true_false",
            QuestionBody::ShortAnswer { .. } => "short_answer",
            QuestionBody::Essay {} => "essay",
            QuestionBody::ChronologicalOrder { .. } => "chronological_order",
        }
    }

    /// Essays always, short answers only when no key was provided.
    pub fn requires_manual_grading(&self) -> bool {
        match &self.body {
            QuestionBody::Essay {} => true,
            QuestionBody::ShortAnswer {
                correct_answer,
                accepted_answers,
            } => short_answer_keys(correct_answer, accepted_answers).is_empty(),
            _ => false,
        }
    }

    pub fn match_answer(&self, answer: &Value) -> AnswerMatch {
        let correct = match &self.body {
            QuestionBody::MultipleChoice {
                options,
                correct_answer,
            } => {
                let key = resolve_option(options, correct_answer);
                key.is_some() && key == resolve_option(options, answer)
            }
            QuestionBody::SelectAllThatApply {
                options,
                correct_answers,
            } => {
                let key: Option<HashSet<usize>> = correct_answers
                    .iter()
                    .map(|v| resolve_option(options, v))
                    .collect();
                let given: Option<HashSet<usize>> = answer_list(answer)
                    .into_iter()
                    .map(|v| resolve_option(options, v))
                    .collect();
                match (key, given) {
                    (Some(key), Some(given)) => !key.is_empty() && key == given,
                    _ => false,
                }
            }
            QuestionBody::TrueFalse { correct_answer } => {
                let key = parse_bool(correct_answer);
                key.is_some() && key == parse_bool(answer)
            }
            QuestionBody::ShortAnswer {
                correct_answer,
                accepted_answers,
            } => {
                let keys = short_answer_keys(correct_answer, accepted_answers);
                if keys.is_empty() {
                    return AnswerMatch::NeedsReview;
                }
                let Some(given) = answer_text(answer) else {
                    return AnswerMatch::Incorrect;
                };
                let given = normalize_text(&given);
                keys.iter().any(|k| *k == given)
            }
            QuestionBody::Essay {} => return AnswerMatch::NeedsReview,
            QuestionBody::ChronologicalOrder { items } => {
                let order: Option<Vec<usize>> = answer_list(answer)
                    .into_iter()
                    .map(|v| resolve_item(items, v))
                    .collect();
                order
                    .map(|o| o.len() == items.len() && o.iter().enumerate().all(|(i, v)| i == *v))
                    .unwrap_or(false)
            }
        };
        if correct {
            AnswerMatch::Correct
        } else {
            AnswerMatch::Incorrect
        }
    }

    /// The canonical correct answer as shown in results; `None` for
    /// manually graded questions.
    pub fn correct_answer_display(&self) -> Option<Value> {
        match &self.body {
            QuestionBody::MultipleChoice {
                options,
                correct_answer,
            } => resolve_option(options, correct_answer).map(|i| json!(options[i])),
            QuestionBody::SelectAllThatApply {
                options,
                correct_answers,
            } => {
                let mut idx: Vec<usize> = correct_answers
                    .iter()
                    .filter_map(|v| resolve_option(options, v))
                    .collect();
                idx.sort_unstable();
                idx.dedup();
                Some(json!(idx.iter().map(|i| &options[*i]).collect::<Vec<_>>()))
            }
            QuestionBody::TrueFalse { correct_answer } => {
                parse_bool(correct_answer).map(|b| json!(b))
            }
            QuestionBody::ShortAnswer {
                correct_answer,
                accepted_answers,
            } => correct_answer
                .as_deref()
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .or_else(|| {
                    accepted_answers
                        .iter()
                        .map(|s| s.trim())
                        .find(|s| !s.is_empty())
                })
                .map(|s| json!(s)),
            QuestionBody::Essay {} => None,
            QuestionBody::ChronologicalOrder { items } => Some(json!(items)),
        }
    }

    /// The question as presented to a test taker: no answer keys, and
    /// chronological items never in their canonical order.
    pub fn student_view(&self) -> Value {
        let mut view = json!({
            "id": self.id,
            "type": self.question_type(),
            "question": self.question,
            "points": self.points,
        });
        match &self.body {
            QuestionBody::MultipleChoice { options, .. }
            | QuestionBody::SelectAllThatApply { options, .. } => {
                view["options"] = json!(options);
            }
            QuestionBody::ChronologicalOrder { items } => {
                view["items"] = json!(scrambled_items(&self.id, items));
            }
            _ => {}
        }
        view
    }

    fn validate(&self, index: usize) -> Result<(), QuestionError> {
        if self.question.trim().is_empty() {
            return Err(QuestionError::invalid(index, "question text must not be empty"));
        }
        if !self.points.is_finite() || self.points <= 0.0 {
            return Err(QuestionError::invalid(index, "points must be a positive number"));
        }
        match &self.body {
            QuestionBody::MultipleChoice {
                options,
                correct_answer,
            } => {
                check_options(index, options)?;
                if resolve_option(options, correct_answer).is_none() {
                    return Err(QuestionError::invalid(
                        index,
                        "correctAnswer does not match any option",
                    ));
                }
            }
            QuestionBody::SelectAllThatApply {
                options,
                correct_answers,
            } => {
                check_options(index, options)?;
                if correct_answers.is_empty() {
                    return Err(QuestionError::invalid(index, "correctAnswers must not be empty"));
                }
                let mut seen = HashSet::new();
                for v in correct_answers {
                    let Some(i) = resolve_option(options, v) else {
                        return Err(QuestionError::invalid(
                            index,
                            format!("correctAnswers entry {} does not match any option", v),
                        ));
                    };
                    if !seen.insert(i) {
                        return Err(QuestionError::invalid(
                            index,
                            "correctAnswers lists the same option twice",
                        ));
                    }
                }
            }
            QuestionBody::TrueFalse { correct_answer } => {
                if parse_bool(correct_answer).is_none() {
                    return Err(QuestionError::invalid(
                        index,
                        "correctAnswer must be true or false",
                    ));
                }
            }
            QuestionBody::ShortAnswer { .. } | QuestionBody::Essay {} => {}
            QuestionBody::ChronologicalOrder { items } => {
                if items.len() < 2 {
                    return Err(QuestionError::invalid(index, "items must list at least 2 entries"));
                }
                let mut seen = HashSet::new();
                for it in items {
                    let key = normalize_text(it);
                    if key.is_empty() {
                        return Err(QuestionError::invalid(index, "items must not be blank"));
                    }
                    if !seen.insert(key) {
                        return Err(QuestionError::invalid(index, "items must be unique"));
                    }
                }
            }
        }
        Ok(())
    }
}

fn short_answer_keys(correct: &Option<String>, accepted: &[String]) -> Vec<String> {
    correct
        .iter()
        .chain(accepted.iter())
        .map(|s| normalize_text(s))
        .filter(|s| !s.is_empty())
        .collect()
}

fn check_options(index: usize, options: &[String]) -> Result<(), QuestionError> {
    if options.len() < 2 {
        return Err(QuestionError::invalid(index, "options must list at least 2 entries"));
    }
    if options.iter().any(|o| o.trim().is_empty()) {
        return Err(QuestionError::invalid(index, "options must not be blank"));
    }
    Ok(())
}

/// Deterministic presentation order: items sorted by a digest of the
/// question id and the item text, rotated once if that lands on the
/// canonical order.
pub fn scrambled_items(question_id: &str, items: &[String]) -> Vec<String> {
    let mut keyed: Vec<(Vec<u8>, usize)> = items
        .iter()
        .enumerate()
        .map(|(i, it)| {
            let mut h = Sha256::new();
            h.update(question_id.as_bytes());
            h.update(b"\x1f");
            h.update(it.as_bytes());
            (h.finalize().to_vec(), i)
        })
        .collect();
    keyed.sort();
    let mut order: Vec<usize> = keyed.into_iter().map(|(_, i)| i).collect();
    if order.len() > 1 && order.iter().enumerate().all(|(i, v)| i == *v) {
        order.rotate_left(1);
    }
    order.into_iter().map(|i| items[i].clone()).collect()
}

/// Assign ids where missing, then check every question and the id set.
pub fn validate_questions(questions: &mut [Question]) -> Result<(), QuestionError> {
    if questions.is_empty() {
        return Err(QuestionError::Empty);
    }
    let mut ids = HashSet::new();
    for (index, q) in questions.iter_mut().enumerate() {
        if q.id.trim().is_empty() {
            q.id = Uuid::new_v4().to_string();
        } else {
            q.id = q.id.trim().to_string();
        }
        q.validate(index)?;
        if !ids.insert(q.id.clone()) {
            return Err(QuestionError::DuplicateId(q.id.clone()));
        }
    }
    Ok(())
}

pub fn parse_questions(raw: &Value) -> Result<Vec<Question>, QuestionError> {
    let mut questions: Vec<Question> = serde_json::from_value(raw.clone())
        .map_err(|e| QuestionError::Malformed(e.to_string()))?;
    validate_questions(&mut questions)?;
    Ok(questions)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn q(raw: Value) -> Question {
        serde_json::from_value(raw).expect("parse question")
    }

    #[test]
    fn parses_hyphenated_type_aliases() {
        let sel = q(json!({
            "id": "q1",
            "type": "select-all-that-apply",
            "question": "Pick primes",
            "options": ["2", "4", "5"],
            "correctAnswers": ["2", "5"]
        }));
        assert_eq!(sel.question_type(), "select_all_that_apply");
        assert_eq!(sel.points, 1.0);
        assert!(!sel.hide_answer);

        let tf = q(json!({
            "type": "true-false",
            "question": "Sky is blue",
            "correctAnswer": "true",
            "hideAnswer": true,
            "points": 2
        }));
        assert_eq!(tf.question_type(), "true_false");
        assert!(tf.hide_answer);
        assert_eq!(tf.points, 2.0);
    }

    #[test]
    fn option_resolution_prefers_text_then_index_then_letter() {
        let opts = vec!["Paris".to_string(), "Rome".to_string(), "Oslo".to_string()];
        assert_eq!(resolve_option(&opts, &json!(" rome ")), Some(1));
        assert_eq!(resolve_option(&opts, &json!(2)), Some(2));
        assert_eq!(resolve_option(&opts, &json!("0")), Some(0));
        assert_eq!(resolve_option(&opts, &json!("c")), Some(2));
        assert_eq!(resolve_option(&opts, &json!("D")), None);
        assert_eq!(resolve_option(&opts, &json!(3)), None);

        let numeric = vec!["2".to_string(), "0".to_string()];
        assert_eq!(resolve_option(&numeric, &json!("0")), Some(1));
    }

    #[test]
    fn multiple_choice_accepts_text_or_index_answers() {
        let mc = q(json!({
            "id": "q1",
            "type": "multiple_choice",
            "question": "Capital of Italy?",
            "options": ["Paris", "Rome"],
            "correctAnswer": 1
        }));
        assert_eq!(mc.match_answer(&json!("Rome")), AnswerMatch::Correct);
        assert_eq!(mc.match_answer(&json!(1)), AnswerMatch::Correct);
        assert_eq!(mc.match_answer(&json!("B")), AnswerMatch::Correct);
        assert_eq!(mc.match_answer(&json!("Paris")), AnswerMatch::Incorrect);
        assert_eq!(mc.match_answer(&json!("Berlin")), AnswerMatch::Incorrect);
        assert_eq!(mc.correct_answer_display(), Some(json!("Rome")));
    }

    #[test]
    fn select_all_requires_exact_set() {
        let sel = q(json!({
            "id": "q2",
            "type": "select_all_that_apply",
            "question": "Even numbers",
            "options": ["1", "2", "3", "4"],
            "correctAnswers": ["2", "4"]
        }));
        assert_eq!(sel.match_answer(&json!(["4", "2"])), AnswerMatch::Correct);
        assert_eq!(sel.match_answer(&json!(["2"])), AnswerMatch::Incorrect);
        assert_eq!(sel.match_answer(&json!(["2", "4", "1"])), AnswerMatch::Incorrect);
        assert_eq!(sel.match_answer(&json!(["2", "4", "nine"])), AnswerMatch::Incorrect);
        assert_eq!(sel.correct_answer_display(), Some(json!(["2", "4"])));
    }

    #[test]
    fn true_false_accepts_string_forms() {
        let tf = q(json!({
            "id": "q3",
            "type": "true_false",
            "question": "Water is wet",
            "correctAnswer": true
        }));
        assert_eq!(tf.match_answer(&json!("True")), AnswerMatch::Correct);
        assert_eq!(tf.match_answer(&json!("yes")), AnswerMatch::Correct);
        assert_eq!(tf.match_answer(&json!(false)), AnswerMatch::Incorrect);
        assert_eq!(tf.match_answer(&json!("maybe")), AnswerMatch::Incorrect);
    }

    #[test]
    fn short_answer_auto_scores_only_with_a_key() {
        let keyed = q(json!({
            "id": "q4",
            "type": "short_answer",
            "question": "Largest planet",
            "correctAnswer": "Jupiter",
            "acceptedAnswers": ["planet jupiter"]
        }));
        assert!(!keyed.requires_manual_grading());
        assert_eq!(keyed.match_answer(&json!("  JUPITER ")), AnswerMatch::Correct);
        assert_eq!(keyed.match_answer(&json!("planet   Jupiter")), AnswerMatch::Correct);
        assert_eq!(keyed.match_answer(&json!("Saturn")), AnswerMatch::Incorrect);

        let open = q(json!({
            "id": "q5",
            "type": "short_answer",
            "question": "Explain gravity briefly"
        }));
        assert!(open.requires_manual_grading());
        assert_eq!(open.match_answer(&json!("mass attracts")), AnswerMatch::NeedsReview);

        let essay = q(json!({ "id": "q6", "type": "essay", "question": "Discuss" }));
        assert!(essay.requires_manual_grading());
        assert_eq!(essay.correct_answer_display(), None);
    }

    #[test]
    fn chronological_order_must_match_full_sequence() {
        let ch = q(json!({
            "id": "q7",
            "type": "chronological_order",
            "question": "Order these events",
            "items": ["Magna Carta", "French Revolution", "Moon landing"]
        }));
        assert_eq!(
            ch.match_answer(&json!(["magna carta", "French Revolution", "Moon landing"])),
            AnswerMatch::Correct
        );
        assert_eq!(ch.match_answer(&json!([0, 1, 2])), AnswerMatch::Correct);
        assert_eq!(
            ch.match_answer(&json!(["French Revolution", "Magna Carta", "Moon landing"])),
            AnswerMatch::Incorrect
        );
        assert_eq!(
            ch.match_answer(&json!(["Magna Carta", "French Revolution"])),
            AnswerMatch::Incorrect
        );
    }

    #[test]
    fn student_view_hides_keys_and_scrambles_items() {
        let ch = q(json!({
            "id": "q7",
            "type": "chronological_order",
            "question": "Order",
            "items": ["a", "b"]
        }));
        let view = ch.student_view();
        assert_eq!(view["items"], json!(["b", "a"]));
        assert!(view.get("correctAnswer").is_none());

        let mc = q(json!({
            "id": "q1",
            "type": "multiple_choice",
            "question": "Pick",
            "options": ["x", "y"],
            "correctAnswer": "y"
        }));
        let view = mc.student_view();
        assert_eq!(view["options"], json!(["x", "y"]));
        assert!(view.get("correctAnswer").is_none());
    }

    #[test]
    fn scrambled_items_is_deterministic_permutation() {
        let items: Vec<String> = (1..=6).map(|i| format!("event {i}")).collect();
        let a = scrambled_items("qx", &items);
        let b = scrambled_items("qx", &items);
        assert_eq!(a, b);
        assert_ne!(a, items);
        let mut sorted = a.clone();
        sorted.sort();
        let mut expected = items.clone();
        expected.sort();
        assert_eq!(sorted, expected);
    }

    #[test]
    fn validation_assigns_ids_and_rejects_bad_keys() {
        let mut ok = vec![
            q(json!({ "type": "essay", "question": "Discuss" })),
            q(json!({ "type": "essay", "question": "Discuss more" })),
        ];
        validate_questions(&mut ok).expect("valid");
        assert!(!ok[0].id.is_empty());
        assert_ne!(ok[0].id, ok[1].id);

        let mut bad_key = vec![q(json!({
            "type": "multiple_choice",
            "question": "Pick",
            "options": ["x", "y"],
            "correctAnswer": "z"
        }))];
        assert!(matches!(
            validate_questions(&mut bad_key),
            Err(QuestionError::Invalid { index: 0, .. })
        ));

        let mut zero_points = vec![q(json!({
            "type": "essay",
            "question": "Discuss",
            "points": 0
        }))];
        assert!(validate_questions(&mut zero_points).is_err());

        let mut dup = vec![
            q(json!({ "id": "same", "type": "essay", "question": "A" })),
            q(json!({ "id": "same", "type": "essay", "question": "B" })),
        ];
        assert_eq!(
            validate_questions(&mut dup),
            Err(QuestionError::DuplicateId("same".to_string()))
        );

        assert_eq!(validate_questions(&mut []), Err(QuestionError::Empty));
    }

    #[test]
    fn unanswered_covers_blank_forms() {
        assert!(is_unanswered(None));
        assert!(is_unanswered(Some(&Value::Null)));
        assert!(is_unanswered(Some(&json!("   "))));
        assert!(is_unanswered(Some(&json!([]))));
        assert!(!is_unanswered(Some(&json!(false))));
        assert!(!is_unanswered(Some(&json!(0))));
    }
}
