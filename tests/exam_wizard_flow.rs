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

struct Fixture {
    department_id: String,
    teacher_id: String,
    student_ids: Vec<String>,
    exam_type_id: String,
}

fn seed_department(
    stdin: &mut ChildStdin,
    reader: &mut BufReader<ChildStdout>,
    workspace: &PathBuf,
) -> Fixture {
    let _ = request(
        stdin,
        reader,
        "s1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request(
        stdin,
        reader,
        "s2",
        "teachers.create",
        json!({ "fullName": "Смирнова Ольга Викторовна" }),
    );
    let teacher_id = result_str(&teacher, "teacherId");
    let dept = request(
        stdin,
        reader,
        "s3",
        "departments.create",
        json!({
            "fullName": "Народное отделение",
            "shortName": "народное",
            "title": "народные инструменты"
        }),
    );
    let department_id = result_str(&dept, "departmentId");

    let mut student_ids = Vec::new();
    for (i, name) in ["Кузнецова Мария Ивановна", "Орлов Пётр Алексеевич"]
        .iter()
        .enumerate()
    {
        let student = request(
            stdin,
            reader,
            &format!("s4-{}", i),
            "students.create",
            json!({
                "fullName": name,
                "departmentId": department_id,
                "leadTeacherId": teacher_id,
                "address": "г. Тверь",
                "studyYears": 5,
                "admissionYear": 2023
            }),
        );
        student_ids.push(result_str(&student, "studentId"));
    }

    let exam_type = request(
        stdin,
        reader,
        "s5",
        "settings.exam_types.create",
        json!({ "name": "Переводной экзамен" }),
    );
    Fixture {
        department_id,
        teacher_id,
        student_ids,
        exam_type_id: result_str(&exam_type, "examTypeId"),
    }
}

#[test]
fn wizard_walks_three_stages_and_numbers_protocols_sequentially() {
    let workspace = temp_dir("dmsh-wizard-flow");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_department(&mut stdin, &mut reader, &workspace);

    let begin = request(
        &mut stdin,
        &mut reader,
        "1",
        "exams.wizard.begin",
        json!({
            "session": "ui-1",
            "examTypeId": fx.exam_type_id,
            "departmentId": fx.department_id,
            "discipline": "специальность",
            "date": "2024-12-18",
            "commissionMembers": "Смирнова О. В., Иванова А. П."
        }),
    );
    assert_eq!(
        begin.get("result").and_then(|v| v.get("stage")).and_then(|v| v.as_str()),
        Some("roster")
    );
    let roster = begin
        .get("result")
        .and_then(|v| v.get("roster"))
        .and_then(|v| v.as_array())
        .expect("roster array");
    assert_eq!(roster.len(), 2);

    let picked = request(
        &mut stdin,
        &mut reader,
        "2",
        "exams.wizard.roster",
        json!({ "session": "ui-1", "studentIds": fx.student_ids }),
    );
    assert_eq!(
        picked.get("result").and_then(|v| v.get("stage")).and_then(|v| v.as_str()),
        Some("grade")
    );

    let items: Vec<serde_json::Value> = fx
        .student_ids
        .iter()
        .map(|sid| {
            json!({
                "studentId": sid,
                "teacherId": fx.teacher_id,
                "program": "И. С. Бах. Маленькая прелюдия до минор",
                "grade": "5"
            })
        })
        .collect();
    let committed = request(
        &mut stdin,
        &mut reader,
        "3",
        "exams.wizard.grade",
        json!({ "session": "ui-1", "items": items }),
    );
    assert_eq!(
        committed
            .get("result")
            .and_then(|v| v.get("protocolNumber"))
            .and_then(|v| v.as_i64()),
        Some(1)
    );
    let exam_id = result_str(&committed, "examId");

    // Same year, second protocol takes the next number.
    let _ = request(
        &mut stdin,
        &mut reader,
        "4",
        "exams.wizard.begin",
        json!({
            "session": "ui-1",
            "examTypeId": fx.exam_type_id,
            "departmentId": fx.department_id,
            "discipline": "специальность",
            "date": "2025-04-22"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "exams.wizard.roster",
        json!({ "session": "ui-1", "studentIds": [fx.student_ids[0]] }),
    );
    let second = request(
        &mut stdin,
        &mut reader,
        "6",
        "exams.wizard.grade",
        json!({
            "session": "ui-1",
            "items": [{
                "studentId": fx.student_ids[0],
                "teacherId": fx.teacher_id,
                "program": "П. И. Чайковский. Старинная французская песенка",
                "grade": "4"
            }]
        }),
    );
    assert_eq!(
        second
            .get("result")
            .and_then(|v| v.get("protocolNumber"))
            .and_then(|v| v.as_i64()),
        Some(2)
    );

    let listed = request(
        &mut stdin,
        &mut reader,
        "7",
        "exams.list",
        json!({ "academicYear": "2024-2025" }),
    );
    let exams = listed
        .get("result")
        .and_then(|v| v.get("exams"))
        .and_then(|v| v.as_array())
        .expect("exams array");
    assert_eq!(exams.len(), 2);

    let viewed = request(
        &mut stdin,
        &mut reader,
        "8",
        "exams.view",
        json!({ "examId": exam_id }),
    );
    assert_eq!(viewed.get("ok").and_then(|v| v.as_bool()), Some(true));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn wizard_guards_stage_order_and_roster_membership() {
    let workspace = temp_dir("dmsh-wizard-guards");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();
    let fx = seed_department(&mut stdin, &mut reader, &workspace);

    // Grading before any wizard state exists.
    let premature = request(
        &mut stdin,
        &mut reader,
        "1",
        "exams.wizard.grade",
        json!({ "session": "cold", "items": [] }),
    );
    assert_eq!(error_code(&premature), "wizard_state_missing");

    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "exams.wizard.begin",
        json!({
            "session": "cold",
            "examTypeId": fx.exam_type_id,
            "departmentId": fx.department_id,
            "discipline": "сольфеджио",
            "date": "2024-10-10"
        }),
    );

    // Grading straight after metadata skips the roster stage.
    let skipped = request(
        &mut stdin,
        &mut reader,
        "3",
        "exams.wizard.grade",
        json!({ "session": "cold", "items": [] }),
    );
    assert_eq!(error_code(&skipped), "wizard_state_missing");

    // Students outside the department's active roster are rejected.
    let stranger = request(
        &mut stdin,
        &mut reader,
        "4",
        "exams.wizard.roster",
        json!({ "session": "cold", "studentIds": ["no-such-student"] }),
    );
    assert_eq!(error_code(&stranger), "bad_params");

    let _ = request(
        &mut stdin,
        &mut reader,
        "5",
        "exams.wizard.roster",
        json!({ "session": "cold", "studentIds": [fx.student_ids[0]] }),
    );

    // Items must cover exactly the selected students.
    let mismatch = request(
        &mut stdin,
        &mut reader,
        "6",
        "exams.wizard.grade",
        json!({
            "session": "cold",
            "items": [{
                "studentId": fx.student_ids[1],
                "teacherId": fx.teacher_id,
                "program": "гаммы",
                "grade": "4"
            }]
        }),
    );
    assert_eq!(error_code(&mismatch), "bad_params");

    // Failed commit keeps the staged state alive; a corrected submission lands.
    let fixed = request(
        &mut stdin,
        &mut reader,
        "7",
        "exams.wizard.grade",
        json!({
            "session": "cold",
            "items": [{
                "studentId": fx.student_ids[0],
                "teacherId": fx.teacher_id,
                "program": "гаммы",
                "grade": "4"
            }]
        }),
    );
    assert_eq!(fixed.get("ok").and_then(|v| v.as_bool()), Some(true));

    // Committed protocols clear the session.
    let again = request(
        &mut stdin,
        &mut reader,
        "8",
        "exams.wizard.grade",
        json!({ "session": "cold", "items": [] }),
    );
    assert_eq!(error_code(&again), "wizard_state_missing");

    // Cancel is a no-op for unknown sessions.
    let cancelled = request(
        &mut stdin,
        &mut reader,
        "9",
        "exams.wizard.cancel",
        json!({ "session": "cold" }),
    );
    assert_eq!(
        cancelled
            .get("result")
            .and_then(|v| v.get("cancelled"))
            .and_then(|v| v.as_bool()),
        Some(false)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
