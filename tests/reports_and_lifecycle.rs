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
    let exe = env!("CARGO_BIN_EXE_dmshd");
    let mut child = Command::new(exe)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn dmshd");
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
    let payload = json!({ "id": id, "method": method, "params": params });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    serde_json::from_str(line.trim()).expect("parse response json")
}

fn result_str(resp: &serde_json::Value, key: &str) -> String {
    resp.get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{} in {}", key, resp))
        .to_string()
}

fn error_code(resp: &serde_json::Value) -> &str {
    resp.get("error")
        .and_then(|e| e.get("code"))
        .and_then(|v| v.as_str())
        .unwrap_or("")
}

fn seed_basics(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> (String, String, Vec<String>) {
    let _ = request(
        stdin,
        reader,
        "b1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request(
        stdin,
        reader,
        "b2",
        "teachers.create",
        json!({ "fullName": "Васильева Елена Николаевна" }),
    );
    let teacher_id = result_str(&teacher, "teacherId");
    let dept = request(
        stdin,
        reader,
        "b3",
        "departments.create",
        json!({
            "fullName": "Струнное отделение",
            "shortName": "струнное",
            "title": "струнные инструменты"
        }),
    );
    let department_id = result_str(&dept, "departmentId");

    let mut student_ids = Vec::new();
    for (i, (name, years, level)) in [
        ("Соколова Анна Дмитриевна", 7, 3),
        ("Фёдоров Михаил Андреевич", 5, 5),
    ]
    .iter()
    .enumerate()
    {
        let student = request(
            stdin,
            reader,
            &format!("b4-{}", i),
            "students.create",
            json!({
                "fullName": name,
                "departmentId": department_id,
                "leadTeacherId": teacher_id,
                "address": "г. Тверь",
                "studyYears": years,
                "classLevel": level,
                "admissionYear": 2020
            }),
        );
        student_ids.push(result_str(&student, "studentId"));
    }
    (department_id, teacher_id, student_ids)
}

#[test]
fn department_report_counts_must_match_active_roster() {
    let workspace = temp_dir("dmsh-dept-report");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (department_id, _teacher_id, _students) = seed_basics(&mut stdin, &mut reader, &workspace);

    // Two active students, counts summing to three.
    let short = request(
        &mut stdin,
        &mut reader,
        "1",
        "departments.report.create",
        json!({
            "departmentId": department_id,
            "term": 2,
            "academicYear": "2024-2025",
            "gotBest": 2,
            "gotGood": 1
        }),
    );
    assert_eq!(error_code(&short), "bad_params");
    assert_eq!(
        short
            .get("error")
            .and_then(|e| e.get("details"))
            .and_then(|d| d.get("rosterSize"))
            .and_then(|v| v.as_i64()),
        Some(2)
    );

    let created = request(
        &mut stdin,
        &mut reader,
        "2",
        "departments.report.create",
        json!({
            "departmentId": department_id,
            "term": 2,
            "academicYear": "2024-2025",
            "gotBest": 1,
            "gotGood": 1
        }),
    );
    assert_eq!(created.get("ok").and_then(|v| v.as_bool()), Some(true));
    // 2 of 2 at four-or-five: quality and quantity both 100.
    assert_eq!(
        created
            .get("result")
            .and_then(|v| v.get("quality"))
            .and_then(|v| v.as_i64()),
        Some(100)
    );

    // Same department, period and year is a duplicate.
    let dup = request(
        &mut stdin,
        &mut reader,
        "3",
        "departments.report.create",
        json!({
            "departmentId": department_id,
            "term": 2,
            "academicYear": "2024-2025",
            "gotBest": 2
        }),
    );
    assert_eq!(error_code(&dup), "already_exists");

    // The submitted period shows up in the department listing.
    let listed = request(
        &mut stdin,
        &mut reader,
        "4",
        "departments.list",
        json!({ "academicYear": "2024-2025" }),
    );
    assert_eq!(listed.get("ok").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn participation_names_exactly_one_performer() {
    let workspace = temp_dir("dmsh-participation");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_department_id, teacher_id, students) = seed_basics(&mut stdin, &mut reader, &workspace);

    let concert = request(
        &mut stdin,
        &mut reader,
        "1",
        "concerts.create",
        json!({
            "title": "Новогодний концерт",
            "teacherId": teacher_id,
            "date": "2024-12-26"
        }),
    );
    let concert_id = result_str(&concert, "eventId");
    let ensemble = request(
        &mut stdin,
        &mut reader,
        "2",
        "ensembles.create",
        json!({ "name": "Скерцо", "teacherId": teacher_id }),
    );
    let ensemble_id = result_str(&ensemble, "ensembleId");

    let neither = request(
        &mut stdin,
        &mut reader,
        "3",
        "concerts.participant.add",
        json!({ "concertId": concert_id }),
    );
    assert_eq!(error_code(&neither), "bad_params");

    let both = request(
        &mut stdin,
        &mut reader,
        "4",
        "concerts.participant.add",
        json!({
            "concertId": concert_id,
            "studentId": students[0],
            "ensembleId": ensemble_id
        }),
    );
    assert_eq!(error_code(&both), "bad_params");

    let solo = request(
        &mut stdin,
        &mut reader,
        "5",
        "concerts.participant.add",
        json!({ "concertId": concert_id, "studentId": students[0] }),
    );
    assert_eq!(solo.get("ok").and_then(|v| v.as_bool()), Some(true));

    let dup = request(
        &mut stdin,
        &mut reader,
        "6",
        "concerts.participant.add",
        json!({ "concertId": concert_id, "studentId": students[0] }),
    );
    assert_eq!(error_code(&dup), "already_exists");

    let group = request(
        &mut stdin,
        &mut reader,
        "7",
        "concerts.participant.add",
        json!({ "concertId": concert_id, "ensembleId": ensemble_id }),
    );
    assert_eq!(group.get("ok").and_then(|v| v.as_bool()), Some(true));

    // Contest entries default the result to "участник".
    let contest = request(
        &mut stdin,
        &mut reader,
        "8",
        "contests.create",
        json!({
            "title": "Городской конкурс",
            "teacherId": teacher_id,
            "date": "2025-02-14"
        }),
    );
    let contest_id = result_str(&contest, "eventId");
    let entry = request(
        &mut stdin,
        &mut reader,
        "9",
        "contests.participant.add",
        json!({ "contestId": contest_id, "studentId": students[1] }),
    );
    assert_eq!(entry.get("ok").and_then(|v| v.as_bool()), Some(true));

    // An ensemble with recorded performances cannot be deleted.
    let blocked = request(
        &mut stdin,
        &mut reader,
        "10",
        "ensembles.delete",
        json!({ "ensembleId": ensemble_id }),
    );
    assert_eq!(error_code(&blocked), "in_use");

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn level_up_only_inside_window_and_retires_final_year_students() {
    let workspace = temp_dir("dmsh-level-up");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_department_id, _teacher_id, students) = seed_basics(&mut stdin, &mut reader, &workspace);

    let closed = request(
        &mut stdin,
        &mut reader,
        "1",
        "students.level_up",
        json!({ "asOf": "2025-02-01" }),
    );
    assert_eq!(error_code(&closed), "level_up_window_closed");

    // Fixture has one mid-course student and one in the final year.
    let promoted = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.level_up",
        json!({ "asOf": "2025-06-02" }),
    );
    assert_eq!(
        promoted
            .get("result")
            .and_then(|v| v.get("promoted"))
            .and_then(|v| v.as_i64()),
        Some(2)
    );
    assert_eq!(
        promoted
            .get("result")
            .and_then(|v| v.get("finished"))
            .and_then(|v| v.as_i64()),
        Some(1)
    );
    let _ = students;

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn student_lifecycle_moves_between_status_groups() {
    let workspace = temp_dir("dmsh-lifecycle");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let (_department_id, _teacher_id, students) = seed_basics(&mut stdin, &mut reader, &workspace);

    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "students.limbo",
        json!({ "studentId": students[0] }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "students.graduate",
        json!({ "studentId": students[1], "certNo": "А-1042", "date": "2025-05-30" }),
    );

    let listed = request(&mut stdin, &mut reader, "3", "students.list", json!({}));
    let result = listed.get("result").expect("result");
    assert_eq!(
        result.get("active").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(0)
    );
    assert_eq!(
        result.get("onLeave").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );
    assert_eq!(
        result.get("graduated").and_then(|v| v.as_array()).map(|a| a.len()),
        Some(1)
    );

    let dismissed = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.dismiss",
        json!({
            "studentId": students[0],
            "date": "2025-06-10",
            "reason": "переезд"
        }),
    );
    assert_eq!(dismissed.get("ok").and_then(|v| v.as_bool()), Some(true));

    let relisted = request(&mut stdin, &mut reader, "5", "students.list", json!({}));
    assert_eq!(
        relisted
            .get("result")
            .and_then(|v| v.get("dismissed"))
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(1)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
