use crate::ipc::error::HandlerErr;
use crate::ipc::handlers::attempts::{load_attempts_for_test, rescore_attempt};
use crate::ipc::helpers::{
    commit_failed, delete_failed, get_optional_bool, get_optional_f64, get_optional_str,
    get_patch, get_required_str, insert_failed, new_id, now_ts, require_row, tx_failed,
    update_failed, with_db, HandlerResult,
};
use crate::ipc::types::{AppState, Request};
use crate::questions::{parse_questions, Question};
use crate::scoring::{summarize_attempts, StoredAttempt};
use rusqlite::{Connection, OptionalExtension};
use serde_json::{json, Value};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestKind {
    Final,
    Quiz,
}

impl TestKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TestKind::Final => "final",
            TestKind::Quiz => "quiz",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "final" | "final_test" => Some(TestKind::Final),
            "quiz" => Some(TestKind::Quiz),
            _ => None,
        }
    }

    fn owner_param(&self) -> &'static str {
        match self {
            TestKind::Final => "programId",
            TestKind::Quiz => "courseId",
        }
    }

    fn owner_table(&self) -> (&'static str, &'static str) {
        match self {
            TestKind::Final => ("programs", "program"),
            TestKind::Quiz => ("courses", "course"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TestRecord {
    pub id: String,
    pub kind: TestKind,
    pub owner_id: String,
    pub title: String,
    pub description: Option<String>,
    pub passing_score: f64,
    pub max_attempts: Option<i64>,
    pub published: bool,
    pub questions: Vec<Question>,
    pub created_at: String,
    pub updated_at: String,
}

impl TestRecord {
    fn header_json(&self) -> Value {
        json!({
            "id": self.id,
            "kind": self.kind.as_str(),
            "ownerId": self.owner_id,
            "title": self.title,
            "description": self.description,
            "passingScore": self.passing_score,
            "maxAttempts": self.max_attempts,
            "published": self.published,
            "totalPoints": self.questions.iter().map(|q| q.points).sum::<f64>(),
            "createdAt": self.created_at,
            "updatedAt": self.updated_at,
        })
    }

    /// Full definition including answer keys.
    pub fn instructor_json(&self) -> Value {
        let mut v = self.header_json();
        v["questions"] = json!(self.questions);
        v
    }

    pub fn student_json(&self) -> Value {
        let mut v = self.header_json();
        v["questions"] = Value::Array(self.questions.iter().map(Question::student_view).collect());
        v
    }
}

pub fn load_test(conn: &Connection, test_id: &str) -> Result<TestRecord, HandlerErr> {
    let row = conn
        .query_row(
            "SELECT kind, owner_id, title, description, passing_score, max_attempts, published,
                    questions_json, created_at, updated_at
             FROM tests WHERE id = ?",
            [test_id],
            |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, Option<String>>(3)?,
                    r.get::<_, f64>(4)?,
                    r.get::<_, Option<i64>>(5)?,
                    r.get::<_, i64>(6)?,
                    r.get::<_, String>(7)?,
                    r.get::<_, String>(8)?,
                    r.get::<_, String>(9)?,
                ))
            },
        )
        .optional()?;
    let Some((
        kind,
        owner_id,
        title,
        description,
        passing_score,
        max_attempts,
        published,
        questions_json,
        created_at,
        updated_at,
    )) = row
    else {
        return Err(HandlerErr::not_found("test not found"));
    };
    let kind = TestKind::parse(&kind).ok_or_else(|| {
        HandlerErr::new("bad_document", format!("unknown test kind {}", kind))
            .with_details(json!({ "testId": test_id }))
    })?;
    let questions: Vec<Question> = serde_json::from_str(&questions_json)?;
    Ok(TestRecord {
        id: test_id.to_string(),
        kind,
        owner_id,
        title,
        description,
        passing_score,
        max_attempts,
        published: published != 0,
        questions,
        created_at,
        updated_at,
    })
}

fn parse_kind(raw: &str) -> Result<TestKind, HandlerErr> {
    TestKind::parse(raw).ok_or_else(|| HandlerErr::bad_params("kind must be final or quiz"))
}

fn check_passing_score(v: f64) -> Result<f64, HandlerErr> {
    if !(0.0..=100.0).contains(&v) {
        return Err(HandlerErr::bad_params("passingScore must be between 0 and 100"));
    }
    Ok(v)
}

fn get_max_attempts(params: &Value) -> Result<Option<i64>, HandlerErr> {
    match params.get("maxAttempts") {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_i64() {
            Some(n) if n >= 1 => Ok(Some(n)),
            _ => Err(HandlerErr::bad_params("maxAttempts must be a whole number >= 1 or null")),
        },
    }
}

fn get_questions(params: &Value) -> Result<Vec<Question>, HandlerErr> {
    let Some(raw) = params.get("questions") else {
        return Err(HandlerErr::bad_params("missing questions"));
    };
    parse_questions(raw).map_err(|e| HandlerErr::new(e.code(), e.to_string()))
}

fn questions_json(questions: &[Question]) -> Result<String, HandlerErr> {
    Ok(serde_json::to_string(questions)?)
}

fn tests_create(conn: &Connection, params: &Value, default_passing_score: f64) -> HandlerResult {
    let kind = parse_kind(&get_required_str(params, "kind")?)?;
    let owner_id = match get_optional_str(params, kind.owner_param())? {
        Some(id) if !id.is_empty() => id,
        _ => get_required_str(params, "ownerId").map_err(|_| {
            HandlerErr::bad_params(format!("missing {}", kind.owner_param()))
        })?,
    };
    let (owner_table, owner_what) = kind.owner_table();
    require_row(conn, owner_table, &owner_id, owner_what)?;

    let title = get_required_str(params, "title")?;
    let description = get_optional_str(params, "description")?;
    let passing_score = match get_optional_f64(params, "passingScore")? {
        Some(v) => check_passing_score(v)?,
        None => default_passing_score,
    };
    let max_attempts = get_max_attempts(params)?;
    let published = get_optional_bool(params, "published")?.unwrap_or(false);
    let questions = get_questions(params)?;

    let test_id = new_id();
    let now = now_ts();
    conn.execute(
        "INSERT INTO tests(id, kind, owner_id, title, description, passing_score, max_attempts,
                           published, questions_json, created_at, updated_at)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            test_id,
            kind.as_str(),
            owner_id,
            title,
            description,
            passing_score,
            max_attempts,
            published as i64,
            questions_json(&questions)?,
            now,
            now,
        ],
    )
    .map_err(|e| insert_failed(e, "tests"))?;

    tracing::info!(
        test_id = %test_id,
        kind = kind.as_str(),
        questions = questions.len(),
        "test created"
    );
    Ok(json!({ "testId": test_id, "test": load_test(conn, &test_id)?.instructor_json() }))
}

fn tests_get(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_required_str(params, "testId")?;
    Ok(json!({ "test": load_test(conn, &test_id)?.instructor_json() }))
}

fn tests_student_view(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_required_str(params, "testId")?;
    let test = load_test(conn, &test_id)?;
    if !test.published {
        return Err(HandlerErr::new("not_published", "test is not published"));
    }
    Ok(json!({ "test": test.student_json() }))
}

fn tests_list(conn: &Connection, params: &Value) -> HandlerResult {
    let kind = match get_optional_str(params, "kind")? {
        Some(k) if !k.is_empty() => Some(parse_kind(&k)?),
        _ => None,
    };
    let owner_id = get_optional_str(params, "ownerId")?.filter(|s| !s.is_empty());
    let mut stmt = conn.prepare(
        "SELECT
           t.id,
           t.kind,
           t.owner_id,
           t.title,
           t.passing_score,
           t.max_attempts,
           t.published,
           (SELECT COUNT(*) FROM attempts a WHERE a.test_id = t.id) AS attempt_count
         FROM tests t
         WHERE (?1 IS NULL OR t.kind = ?1) AND (?2 IS NULL OR t.owner_id = ?2)
         ORDER BY t.created_at, t.title",
    )?;
    let tests = stmt
        .query_map((kind.map(|k| k.as_str()), &owner_id), |r| {
            let id: String = r.get(0)?;
            let kind: String = r.get(1)?;
            let owner_id: String = r.get(2)?;
            let title: String = r.get(3)?;
            let passing_score: f64 = r.get(4)?;
            let max_attempts: Option<i64> = r.get(5)?;
            let published: i64 = r.get(6)?;
            let attempt_count: i64 = r.get(7)?;
            Ok(json!({
                "id": id,
                "kind": kind,
                "ownerId": owner_id,
                "title": title,
                "passingScore": passing_score,
                "maxAttempts": max_attempts,
                "published": published != 0,
                "attemptCount": attempt_count,
            }))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(json!({ "tests": tests }))
}

fn tests_update(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_required_str(params, "testId")?;
    let patch = Value::Object(get_patch(params)?.clone());
    load_test(conn, &test_id)?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    if let Some(title) = get_optional_str(&patch, "title")? {
        if title.is_empty() {
            return Err(HandlerErr::bad_params("title must not be empty"));
        }
        tx.execute("UPDATE tests SET title = ? WHERE id = ?", (&title, &test_id))
            .map_err(|e| update_failed(e, "tests"))?;
    }
    if patch.get("description").is_some() {
        let description = get_optional_str(&patch, "description")?;
        tx.execute(
            "UPDATE tests SET description = ? WHERE id = ?",
            (&description, &test_id),
        )
        .map_err(|e| update_failed(e, "tests"))?;
    }
    if let Some(v) = get_optional_f64(&patch, "passingScore")? {
        tx.execute(
            "UPDATE tests SET passing_score = ? WHERE id = ?",
            (check_passing_score(v)?, &test_id),
        )
        .map_err(|e| update_failed(e, "tests"))?;
    }
    if patch.get("maxAttempts").is_some() {
        tx.execute(
            "UPDATE tests SET max_attempts = ? WHERE id = ?",
            (get_max_attempts(&patch)?, &test_id),
        )
        .map_err(|e| update_failed(e, "tests"))?;
    }
    if let Some(published) = get_optional_bool(&patch, "published")? {
        tx.execute(
            "UPDATE tests SET published = ? WHERE id = ?",
            (published as i64, &test_id),
        )
        .map_err(|e| update_failed(e, "tests"))?;
    }
    if patch.get("questions").is_some() {
        let questions = get_questions(&patch)?;
        tx.execute(
            "UPDATE tests SET questions_json = ? WHERE id = ?",
            (questions_json(&questions)?, &test_id),
        )
        .map_err(|e| update_failed(e, "tests"))?;
    }
    tx.execute(
        "UPDATE tests SET updated_at = ? WHERE id = ?",
        (now_ts(), &test_id),
    )
    .map_err(|e| update_failed(e, "tests"))?;
    tx.commit().map_err(commit_failed)?;

    // Existing attempts keep their stored scores until tests.recalculate.
    Ok(json!({ "test": load_test(conn, &test_id)?.instructor_json() }))
}

fn tests_delete(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_required_str(params, "testId")?;
    require_row(conn, "tests", &test_id, "test")?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let attempts_deleted = tx
        .execute("DELETE FROM attempts WHERE test_id = ?", [&test_id])
        .map_err(|e| delete_failed(e, "attempts"))?;
    tx.execute("DELETE FROM tests WHERE id = ?", [&test_id])
        .map_err(|e| delete_failed(e, "tests"))?;
    tx.commit().map_err(commit_failed)?;

    Ok(json!({ "ok": true, "attemptsDeleted": attempts_deleted }))
}

fn tests_results(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_required_str(params, "testId")?;
    let test = load_test(conn, &test_id)?;
    let stored: Vec<StoredAttempt> = load_attempts_for_test(conn, &test_id)?
        .into_iter()
        .map(|a| StoredAttempt {
            student_id: a.student_id,
            status: a.status,
            score: a.score,
            passed: a.passed,
            outcomes: a.outcomes,
        })
        .collect();
    let summary = summarize_attempts(&test.questions, &stored);
    Ok(json!({
        "testId": test.id,
        "title": test.title,
        "passingScore": test.passing_score,
        "summary": summary,
    }))
}

fn tests_recalculate(conn: &Connection, params: &Value) -> HandlerResult {
    let test_id = get_required_str(params, "testId")?;
    let test = load_test(conn, &test_id)?;
    let attempts = load_attempts_for_test(conn, &test_id)?;

    let tx = conn.unchecked_transaction().map_err(tx_failed)?;
    let mut changed = 0_usize;
    for attempt in &attempts {
        if rescore_attempt(&tx, &test, attempt)? {
            changed += 1;
        }
    }
    tx.commit().map_err(commit_failed)?;

    tracing::info!(test_id = %test_id, recalculated = attempts.len(), changed, "test recalculated");
    Ok(json!({ "recalculated": attempts.len(), "changed": changed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<Value> {
    match req.method.as_str() {
        "tests.create" => {
            let default_passing_score = state.config.default_passing_score;
            Some(with_db(state, req, |conn, params| {
                tests_create(conn, params, default_passing_score)
            }))
        }
        "tests.get" => Some(with_db(state, req, tests_get)),
        "tests.studentView" => Some(with_db(state, req, tests_student_view)),
        "tests.list" => Some(with_db(state, req, tests_list)),
        "tests.update" => Some(with_db(state, req, tests_update)),
        "tests.delete" => Some(with_db(state, req, tests_delete)),
        "tests.results" => Some(with_db(state, req, tests_results)),
        "tests.recalculate" => Some(with_db(state, req, tests_recalculate)),
        _ => None,
    }
}
