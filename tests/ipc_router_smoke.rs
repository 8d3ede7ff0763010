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
    let payload = json!({
        "id": id,
        "method": method,
        "params": params,
    });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush request");

    let mut line = String::new();
    reader.read_line(&mut line).expect("read response line");
    assert!(!line.trim().is_empty(), "empty response for {}", method);
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse response json");
    assert_eq!(value.get("id").and_then(|v| v.as_str()), Some(id));
    if value.get("ok").and_then(|v| v.as_bool()) == Some(false) {
        let code = value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        assert_ne!(
            code, "not_implemented",
            "unexpected unknown method for {}",
            method
        );
    }
    value
}

fn result_str(resp: &serde_json::Value, key: &str) -> String {
    resp.get("result")
        .and_then(|v| v.get(key))
        .and_then(|v| v.as_str())
        .unwrap_or_else(|| panic!("missing result.{} in {}", key, resp))
        .to_string()
}

#[test]
fn router_dispatch_smoke_covers_handler_families() {
    let workspace = temp_dir("dmsh-router-smoke");
    let bundle_out = workspace.join("smoke-backup.dmshbackup.zip");

    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let health = request(&mut stdin, &mut reader, "1", "health", json!({}));
    assert_eq!(health.get("ok").and_then(|v| v.as_bool()), Some(true));

    let _ = request(
        &mut stdin,
        &mut reader,
        "2",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );

    let regions = request(&mut stdin, &mut reader, "3", "settings.regions.list", json!({}));
    assert_eq!(
        regions
            .get("result")
            .and_then(|v| v.get("regions"))
            .and_then(|v| v.as_array())
            .map(|a| a.len()),
        Some(91)
    );

    let teacher = request(
        &mut stdin,
        &mut reader,
        "4",
        "teachers.create",
        json!({ "fullName": "Иванова Анна Петровна" }),
    );
    let teacher_id = result_str(&teacher, "teacherId");
    assert_eq!(result_str(&teacher, "shortName"), "Иванова А. П.");

    let dept = request(
        &mut stdin,
        &mut reader,
        "5",
        "departments.create",
        json!({
            "fullName": "Фортепианное отделение",
            "shortName": "фортепиано",
            "title": "фортепиано"
        }),
    );
    let department_id = result_str(&dept, "departmentId");

    let student = request(
        &mut stdin,
        &mut reader,
        "6",
        "students.create",
        json!({
            "fullName": "Петров Иван Сергеевич",
            "departmentId": department_id,
            "leadTeacherId": teacher_id,
            "address": "г. Тверь, ул. Садовая, 3",
            "birthDate": "2015-03-12",
            "studyYears": 5,
            "admissionYear": 2024
        }),
    );
    let student_id = result_str(&student, "studentId");
    assert_eq!(result_str(&student, "shortName"), "Петров Иван");

    let _ = request(&mut stdin, &mut reader, "7", "students.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "students.view",
        json!({ "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "9",
        "students.update",
        json!({ "studentId": student_id, "patch": { "contactPhone": "+7 900 000-00-00" } }),
    );
    let _ = request(&mut stdin, &mut reader, "10", "departments.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "departments.view",
        json!({ "departmentId": department_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "12",
        "departments.summary",
        json!({ "term": 2, "academicYear": "2024-2025" }),
    );
    let _ = request(&mut stdin, &mut reader, "13", "teachers.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "14",
        "teachers.view",
        json!({ "teacherId": teacher_id }),
    );

    let subject = request(
        &mut stdin,
        &mut reader,
        "15",
        "settings.subjects.create",
        json!({ "title": "Сольфеджио" }),
    );
    let subject_id = result_str(&subject, "subjectId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "16",
        "teachers.report.create",
        json!({
            "teacherId": teacher_id,
            "subjectId": subject_id,
            "term": 2,
            "academicYear": "2024-2025",
            "gotBest": 3,
            "gotGood": 2
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "17",
        "settings.subjects.reports",
        json!({ "subjectId": subject_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "18",
        "teachers.lecture.create",
        json!({
            "teacherId": teacher_id,
            "respTeacherId": teacher_id,
            "title": "Работа над кантиленой",
            "date": "2024-11-20"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "19",
        "teachers.open_lesson.create",
        json!({
            "teacherId": teacher_id,
            "respTeacherId": teacher_id,
            "studentId": student_id,
            "title": "Открытый урок по специальности",
            "date": "2024-11-25"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "20",
        "teachers.course.create",
        json!({
            "teacherId": teacher_id,
            "title": "Курсы повышения квалификации",
            "certNo": "КПК-1042",
            "courseType": 1,
            "hours": 72,
            "startDate": "2024-10-01",
            "endDate": "2024-10-14"
        }),
    );

    let ensemble = request(
        &mut stdin,
        &mut reader,
        "21",
        "ensembles.create",
        json!({ "name": "Гармония", "teacherId": teacher_id }),
    );
    let ensemble_id = result_str(&ensemble, "ensembleId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "22",
        "ensembles.member.add",
        json!({ "ensembleId": ensemble_id, "studentId": student_id }),
    );
    let _ = request(&mut stdin, &mut reader, "23", "ensembles.list", json!({}));

    let concert = request(
        &mut stdin,
        &mut reader,
        "24",
        "concerts.create",
        json!({
            "title": "Отчётный концерт",
            "teacherId": teacher_id,
            "date": "2024-12-20"
        }),
    );
    let concert_id = result_str(&concert, "eventId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "25",
        "concerts.participant.add",
        json!({ "concertId": concert_id, "studentId": student_id }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "26",
        "contests.create",
        json!({
            "title": "Областной конкурс юных пианистов",
            "teacherId": teacher_id,
            "date": "2025-03-15",
            "place": "г. Тверь"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "27",
        "events.list",
        json!({ "academicYear": "2024-2025" }),
    );

    let _ = request(
        &mut stdin,
        &mut reader,
        "28",
        "method.assembly.create",
        json!({
            "title": "Методическое совещание",
            "description": "Подготовка к академическим концертам",
            "teacherId": teacher_id,
            "date": "2024-11-05"
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "29",
        "method.assemblies.list",
        json!({ "academicYear": "2024-2025" }),
    );
    let protocol = request(
        &mut stdin,
        &mut reader,
        "30",
        "method.protocol.create",
        json!({
            "attendees": "Иванова А. П., Смирнова О. В.",
            "secretaryId": teacher_id,
            "agenda": "Итоги первой четверти",
            "decisions": "Принять план мероприятий",
            "date": "2024-11-05"
        }),
    );
    assert_eq!(
        protocol
            .get("result")
            .and_then(|v| v.get("number"))
            .and_then(|v| v.as_i64()),
        Some(1)
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "31",
        "method.protocols.list",
        json!({ "academicYear": "2024-2025" }),
    );

    let types = request(
        &mut stdin,
        &mut reader,
        "32",
        "settings.exam_types.create",
        json!({ "name": "Академический концерт" }),
    );
    let _ = result_str(&types, "examTypeId");
    let _ = request(&mut stdin, &mut reader, "33", "settings.exam_types.list", json!({}));
    let _ = request(&mut stdin, &mut reader, "34", "settings.subjects.list", json!({}));
    let _ = request(
        &mut stdin,
        &mut reader,
        "35",
        "settings.school.set",
        json!({
            "fullTitle": "МБУ ДО «Детская музыкальная школа № 1»",
            "shortTitle": "ДМШ № 1",
            "regionId": 69
        }),
    );
    let _ = request(&mut stdin, &mut reader, "36", "settings.school.get", json!({}));

    let render = request(
        &mut stdin,
        &mut reader,
        "37",
        "reports.render",
        json!({ "text": "В школе [учеников] учащихся.", "asOf": "2024-12-10" }),
    );
    let fragments = render
        .get("result")
        .and_then(|v| v.get("fragments"))
        .and_then(|v| v.as_array())
        .expect("fragments array");
    assert!(fragments
        .iter()
        .any(|f| f.as_str().unwrap_or("").contains("1")));

    let _ = request(
        &mut stdin,
        &mut reader,
        "38",
        "exams.list",
        json!({ "academicYear": "2024-2025" }),
    );

    let backup = request(
        &mut stdin,
        &mut reader,
        "39",
        "backup.create",
        json!({ "outPath": bundle_out.to_string_lossy() }),
    );
    assert_eq!(
        backup
            .get("result")
            .and_then(|v| v.get("bundleFormat"))
            .and_then(|v| v.as_str()),
        Some("dmsh-workspace-v1")
    );
    assert!(bundle_out.is_file());

    let stopping = request(&mut stdin, &mut reader, "40", "shutdown", json!({}));
    assert_eq!(
        stopping
            .get("result")
            .and_then(|v| v.get("stopping"))
            .and_then(|v| v.as_bool()),
        Some(true)
    );

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn unknown_method_reports_not_implemented() {
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let payload = json!({ "id": "x", "method": "nope.none", "params": {} });
    writeln!(stdin, "{}", payload).expect("write request");
    stdin.flush().expect("flush");
    let mut line = String::new();
    reader.read_line(&mut line).expect("read response");
    let value: serde_json::Value = serde_json::from_str(line.trim()).expect("parse json");
    assert_eq!(
        value
            .get("error")
            .and_then(|e| e.get("code"))
            .and_then(|v| v.as_str()),
        Some("not_implemented")
    );

    drop(stdin);
    let _ = child.wait();
}
