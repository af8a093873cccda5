use serde_json::json;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::time::{SystemTime, UNIX_EPOCH};

fn temp_dir(prefix: &str) -> PathBuf {
    let p = std::env::temp_dir().join(format!(
        "{}-{}",
        prefix,
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos()
    ));
    std::fs::create_dir_all(&p).expect("create temp dir");
    p
}

fn spawn_sidecar() -> (Child, ChildStdin, BufReader<ChildStdout>) {
    let exe = env!("CARGO_BIN_EXE_lmsd");
    let mut child = Command::new(exe)
        .env_remove("LMSD_WORKSPACE")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn lmsd");
    let stdin = child.stdin.take().expect("child stdin");
    let stdout = child.stdout.take().expect("child stdout");
    (child, stdin, BufReader::new(stdout))
}

fn request(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn request_ok(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> serde_json::Value {
    let value = request(stdin, reader, id, method, params);
    assert_eq!(
        value.get("ok").and_then(|v| v.as_bool()),
        Some(true),
        "{} failed: {}",
        method,
        value
    );
    value.get("result").cloned().unwrap_or_else(|| json!({}))
}

fn error_code(value: &serde_json::Value) -> String {
    value
        .get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string()
}

fn str_field(v: &serde_json::Value, key: &str) -> String {
    v.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing {} in {}", key, v))
        .to_string()
}

fn create_user(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    name: &str,
    role: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("user-{}", name),
        "users.create",
        json!({ "name": name, "email": format!("{}@school.test", name), "role": role }),
    );
    str_field(&res, "userId")
}

fn create_course(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    title: &str,
) -> String {
    let res = request_ok(
        stdin,
        reader,
        &format!("course-{}", title),
        "courses.create",
        json!({ "title": title }),
    );
    str_field(&res, "courseId")
}

fn enrollment_count(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    student_id: &str,
) -> usize {
    let res = request_ok(
        stdin,
        reader,
        "count",
        "enrollments.list",
        json!({ "studentId": student_id }),
    );
    res["enrollments"].as_array().map(|a| a.len()).unwrap_or(0)
}

#[test]
fn classroom_assignment_enrolls_students_in_all_granted_courses() {
    let workspace = temp_dir("lmsd-classrooms");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let s1 = create_user(&mut stdin, &mut reader, "ana", "student");
    let s2 = create_user(&mut stdin, &mut reader, "ben", "student");
    let teacher = create_user(&mut stdin, &mut reader, "cal", "instructor");

    let dup = request(
        &mut stdin,
        &mut reader,
        "dup",
        "users.create",
        json!({ "name": "Ana Again", "email": "ANA@school.test", "role": "student" }),
    );
    assert_eq!(error_code(&dup), "conflict");

    let c1 = create_course(&mut stdin, &mut reader, "Algebra");
    let c2 = create_course(&mut stdin, &mut reader, "Geometry");
    let c3 = create_course(&mut stdin, &mut reader, "Art");
    let program = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "p",
            "programs.create",
            json!({ "title": "Math", "courseIds": [c1, c2] }),
        ),
        "programId",
    );

    let bad_instructor = request(
        &mut stdin,
        &mut reader,
        "bi",
        "classrooms.create",
        json!({ "name": "Nope", "instructorId": s1 }),
    );
    assert_eq!(error_code(&bad_instructor), "forbidden");

    let classroom = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "room",
            "classrooms.create",
            json!({
                "name": "Period 1",
                "instructorId": teacher,
                "programIds": [program],
                "courseIds": [c3]
            }),
        ),
        "classroomId",
    );

    let not_students = request(
        &mut stdin,
        &mut reader,
        "ns",
        "classrooms.assignStudents",
        json!({ "classroomId": classroom, "studentIds": [s1, teacher] }),
    );
    assert_eq!(error_code(&not_students), "forbidden");
    assert_eq!(enrollment_count(&mut stdin, &mut reader, &s1), 0);

    let assigned = request_ok(
        &mut stdin,
        &mut reader,
        "a1",
        "classrooms.assignStudents",
        json!({ "classroomId": classroom, "studentIds": [s1, s2] }),
    );
    assert_eq!(assigned["assigned"], json!(2));
    assert_eq!(assigned["enrollmentsCreated"], json!(6));

    let unfiltered = request_ok(
        &mut stdin,
        &mut reader,
        "all",
        "enrollments.list",
        json!({ "studentId": "", "courseId": "" }),
    );
    assert_eq!(unfiltered["enrollments"].as_array().map(|a| a.len()), Some(6));

    let repeat = request_ok(
        &mut stdin,
        &mut reader,
        "a2",
        "classrooms.assignStudents",
        json!({ "classroomId": classroom, "studentIds": [s1] }),
    );
    assert_eq!(repeat["assigned"], json!(0));
    assert_eq!(repeat["enrollmentsCreated"], json!(0));

    let got = request_ok(
        &mut stdin,
        &mut reader,
        "get",
        "classrooms.get",
        json!({ "classroomId": classroom }),
    );
    assert_eq!(got["classroom"]["programIds"], json!([program]));
    assert_eq!(got["classroom"]["students"].as_array().map(|a| a.len()), Some(2));

    let listed = request_ok(&mut stdin, &mut reader, "list", "classrooms.list", json!({}));
    assert_eq!(listed["classrooms"][0]["studentCount"], json!(2));

    request_ok(
        &mut stdin,
        &mut reader,
        "rm",
        "classrooms.removeStudent",
        json!({ "classroomId": classroom, "studentId": s2 }),
    );
    assert_eq!(enrollment_count(&mut stdin, &mut reader, &s2), 3);
    let rm_again = request(
        &mut stdin,
        &mut reader,
        "rm2",
        "classrooms.removeStudent",
        json!({ "classroomId": classroom, "studentId": s2 }),
    );
    assert_eq!(error_code(&rm_again), "not_found");

    let updated = request_ok(
        &mut stdin,
        &mut reader,
        "upd",
        "classrooms.update",
        json!({
            "classroomId": classroom,
            "patch": { "instructorId": null, "courseIds": [] }
        }),
    );
    assert!(updated["classroom"]["instructorId"].is_null());
    assert_eq!(updated["classroom"]["courseIds"], json!([]));
    assert_eq!(updated["classroom"]["programIds"], json!([program]));

    let deleted_course = request_ok(
        &mut stdin,
        &mut reader,
        "dc",
        "courses.delete",
        json!({ "courseId": c1 }),
    );
    assert_eq!(deleted_course["ok"], json!(true));
    assert_eq!(enrollment_count(&mut stdin, &mut reader, &s1), 2);
    let program_after = request_ok(
        &mut stdin,
        &mut reader,
        "pg",
        "programs.get",
        json!({ "programId": program }),
    );
    assert_eq!(program_after["program"]["courses"].as_array().map(|a| a.len()), Some(1));

    request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "classrooms.delete",
        json!({ "classroomId": classroom }),
    );
    let gone = request(
        &mut stdin,
        &mut reader,
        "gone",
        "classrooms.get",
        json!({ "classroomId": classroom }),
    );
    assert_eq!(error_code(&gone), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn enrollment_progress_is_clamped_and_completion_tracked() {
    let workspace = temp_dir("lmsd-enrollments");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let student = create_user(&mut stdin, &mut reader, "dee", "student");
    let admin = create_user(&mut stdin, &mut reader, "eve", "admin");
    let course = create_course(&mut stdin, &mut reader, "Chemistry");

    let not_student = request(
        &mut stdin,
        &mut reader,
        "ns",
        "enrollments.create",
        json!({ "studentId": admin, "courseId": course }),
    );
    assert_eq!(error_code(&not_student), "forbidden");

    let first = request_ok(
        &mut stdin,
        &mut reader,
        "e1",
        "enrollments.create",
        json!({ "studentId": student, "courseId": course }),
    );
    assert_eq!(first["created"], json!(true));
    let enrollment_id = str_field(&first["enrollment"], "id");
    assert_eq!(first["enrollment"]["status"], json!("active"));

    let second = request_ok(
        &mut stdin,
        &mut reader,
        "e2",
        "enrollments.create",
        json!({ "studentId": student, "courseId": course }),
    );
    assert_eq!(second["created"], json!(false));
    assert_eq!(second["enrollment"]["id"], json!(enrollment_id));

    let over = request_ok(
        &mut stdin,
        &mut reader,
        "p1",
        "enrollments.updateProgress",
        json!({ "enrollmentId": enrollment_id, "progress": 140 }),
    );
    assert_eq!(over["enrollment"]["progress"].as_f64(), Some(100.0));
    assert_eq!(over["enrollment"]["status"], json!("completed"));
    let completed_at = str_field(&over["enrollment"], "completedAt");

    let still = request_ok(
        &mut stdin,
        &mut reader,
        "p2",
        "enrollments.updateProgress",
        json!({ "enrollmentId": enrollment_id, "progress": 100 }),
    );
    assert_eq!(still["enrollment"]["completedAt"], json!(completed_at));

    let reopened = request_ok(
        &mut stdin,
        &mut reader,
        "p3",
        "enrollments.updateProgress",
        json!({ "enrollmentId": enrollment_id, "progress": 40 }),
    );
    assert_eq!(reopened["enrollment"]["status"], json!("active"));
    assert!(reopened["enrollment"]["completedAt"].is_null());

    let under = request_ok(
        &mut stdin,
        &mut reader,
        "p4",
        "enrollments.updateProgress",
        json!({ "enrollmentId": enrollment_id, "progress": -5 }),
    );
    assert_eq!(under["enrollment"]["progress"].as_f64(), Some(0.0));

    let missing = request(
        &mut stdin,
        &mut reader,
        "p5",
        "enrollments.updateProgress",
        json!({ "enrollmentId": enrollment_id }),
    );
    assert_eq!(error_code(&missing), "bad_params");

    request_ok(
        &mut stdin,
        &mut reader,
        "del",
        "enrollments.delete",
        json!({ "enrollmentId": enrollment_id }),
    );
    let del_again = request(
        &mut stdin,
        &mut reader,
        "del2",
        "enrollments.delete",
        json!({ "enrollmentId": enrollment_id }),
    );
    assert_eq!(error_code(&del_again), "not_found");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn catalog_updates_and_cascading_deletes() {
    let workspace = temp_dir("lmsd-catalog");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    request_ok(
        &mut stdin,
        &mut reader,
        "ws",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let student = create_user(&mut stdin, &mut reader, "fay", "student");
    let renamed = request_ok(
        &mut stdin,
        &mut reader,
        "ru",
        "users.update",
        json!({ "userId": student, "patch": { "name": "Fay Q" } }),
    );
    assert_eq!(renamed["user"]["name"], json!("Fay Q"));
    assert_eq!(renamed["user"]["role"], json!("student"));
    let bad_role = request(
        &mut stdin,
        &mut reader,
        "br",
        "users.update",
        json!({ "userId": student, "patch": { "role": "janitor" } }),
    );
    assert_eq!(error_code(&bad_role), "bad_params");

    let c1 = create_course(&mut stdin, &mut reader, "Physics");
    let c2 = create_course(&mut stdin, &mut reader, "Optics");
    let course = request_ok(
        &mut stdin,
        &mut reader,
        "cu",
        "courses.update",
        json!({ "courseId": c1, "patch": { "description": "Mechanics first" } }),
    );
    assert_eq!(course["course"]["description"], json!("Mechanics first"));

    let program = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "p",
            "programs.create",
            json!({ "title": "Physical Science", "courseIds": [c1] }),
        ),
        "programId",
    );
    let reordered = request_ok(
        &mut stdin,
        &mut reader,
        "pu",
        "programs.update",
        json!({ "programId": program, "patch": { "courseIds": [c2, c1] } }),
    );
    let titles: Vec<&str> = reordered["program"]["courses"]
        .as_array()
        .expect("courses")
        .iter()
        .filter_map(|c| c["title"].as_str())
        .collect();
    assert_eq!(titles, vec!["Optics", "Physics"]);

    let missing_course = request(
        &mut stdin,
        &mut reader,
        "pm",
        "programs.update",
        json!({ "programId": program, "patch": { "courseIds": ["nope"] } }),
    );
    assert_eq!(error_code(&missing_course), "not_found");

    request_ok(
        &mut stdin,
        &mut reader,
        "e",
        "enrollments.create",
        json!({ "studentId": student, "courseId": c2 }),
    );
    let test_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "t",
            "tests.create",
            json!({
                "kind": "final",
                "programId": program,
                "title": "Physics Final",
                "published": true,
                "questions": [{
                    "id": "q",
                    "type": "true_false",
                    "question": "Light bends",
                    "correctAnswer": true
                }]
            }),
        ),
        "testId",
    );
    request_ok(
        &mut stdin,
        &mut reader,
        "s",
        "attempts.submit",
        json!({ "testId": test_id, "studentId": student, "answers": { "q": true } }),
    );
    let quiz_id = str_field(
        &request_ok(
            &mut stdin,
            &mut reader,
            "qz",
            "tests.create",
            json!({
                "kind": "quiz",
                "ownerId": c2,
                "title": "Lenses",
                "questions": [{ "type": "essay", "question": "Describe a lens" }]
            }),
        ),
        "testId",
    );
    let quiz_delete = request_ok(
        &mut stdin,
        &mut reader,
        "qd",
        "tests.delete",
        json!({ "testId": quiz_id }),
    );
    assert_eq!(quiz_delete["attemptsDeleted"], json!(0));

    let deleted = request_ok(
        &mut stdin,
        &mut reader,
        "pd",
        "programs.delete",
        json!({ "programId": program }),
    );
    assert_eq!(deleted["finalTestsDeleted"], json!(1));

    let attempts = request_ok(&mut stdin, &mut reader, "al", "attempts.list", json!({}));
    assert_eq!(attempts["attempts"], json!([]));
    let gone = request(&mut stdin, &mut reader, "tg", "tests.get", json!({ "testId": test_id }));
    assert_eq!(error_code(&gone), "not_found");
    // Courses outlive the program.
    let courses = request_ok(&mut stdin, &mut reader, "cl", "courses.list", json!({}));
    assert_eq!(courses["courses"].as_array().map(|a| a.len()), Some(2));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
