use serde_json::json;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Write};
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

fn document_xml(path: &PathBuf) -> String {
    let f = File::open(path).expect("open docx");
    let mut archive = zip::ZipArchive::new(f).expect("open docx archive");
    let mut xml = String::new();
    archive
        .by_name("word/document.xml")
        .expect("document.xml entry")
        .read_to_string(&mut xml)
        .expect("read document.xml");
    xml
}

#[test]
fn generated_documents_carry_the_recorded_facts() {
    let workspace = temp_dir("dmsh-documents");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    let teacher = request(
        &mut stdin,
        &mut reader,
        "2",
        "teachers.create",
        json!({ "fullName": "Громова Татьяна Сергеевна" }),
    );
    let teacher_id = result_str(&teacher, "teacherId");
    let dept = request(
        &mut stdin,
        &mut reader,
        "3",
        "departments.create",
        json!({
            "fullName": "Хоровое отделение",
            "shortName": "хоровое",
            "title": "хоровое пение"
        }),
    );
    let department_id = result_str(&dept, "departmentId");
    let student = request(
        &mut stdin,
        &mut reader,
        "4",
        "students.create",
        json!({
            "fullName": "Белова Софья Максимовна",
            "departmentId": department_id,
            "leadTeacherId": teacher_id,
            "address": "г. Тверь, пр-т Победы, 12",
            "birthDate": "2014-09-01",
            "studyYears": 7,
            "admissionYear": 2022
        }),
    );
    let student_id = result_str(&student, "studentId");

    let title_out = workspace.join("title.docx");
    let title = request(
        &mut stdin,
        &mut reader,
        "5",
        "students.title_page.doc",
        json!({ "studentId": student_id, "outPath": title_out.to_string_lossy() }),
    );
    assert_eq!(
        result_str(&title, "filename"),
        "Личное_дело_Белова.docx"
    );
    let xml = document_xml(&title_out);
    assert!(xml.contains("Белова Софья Максимовна"));
    assert!(xml.contains("01.09.2014"));

    // An exam protocol rendered from a committed wizard run.
    let exam_type = request(
        &mut stdin,
        &mut reader,
        "6",
        "settings.exam_types.create",
        json!({ "name": "Академический концерт" }),
    );
    let exam_type_id = result_str(&exam_type, "examTypeId");
    let _ = request(
        &mut stdin,
        &mut reader,
        "7",
        "exams.wizard.begin",
        json!({
            "session": "doc",
            "examTypeId": exam_type_id,
            "departmentId": department_id,
            "discipline": "хор",
            "date": "2024-12-19",
            "commissionMembers": "Громова Т. С."
        }),
    );
    let _ = request(
        &mut stdin,
        &mut reader,
        "8",
        "exams.wizard.roster",
        json!({ "session": "doc", "studentIds": [student_id] }),
    );
    let committed = request(
        &mut stdin,
        &mut reader,
        "9",
        "exams.wizard.grade",
        json!({
            "session": "doc",
            "items": [{
                "studentId": student_id,
                "teacherId": teacher_id,
                "program": "Р. Шуман. Весёлый крестьянин",
                "grade": "5"
            }]
        }),
    );
    let exam_id = result_str(&committed, "examId");

    let protocol_out = workspace.join("protocol.docx");
    let protocol = request(
        &mut stdin,
        &mut reader,
        "10",
        "exams.protocol.doc",
        json!({ "examId": exam_id, "outPath": protocol_out.to_string_lossy() }),
    );
    assert_eq!(
        result_str(&protocol, "filename"),
        "Протокол_1_2024-2025.docx"
    );
    let xml = document_xml(&protocol_out);
    assert!(xml.contains("Весёлый крестьянин"));
    assert!(xml.contains("Громова Т. С."));

    // Events plan lists the concert under its display date.
    let _ = request(
        &mut stdin,
        &mut reader,
        "11",
        "concerts.create",
        json!({
            "title": "Весенний концерт хора",
            "teacherId": teacher_id,
            "date": "2025-04-18"
        }),
    );
    let plan_out = workspace.join("plan.docx");
    let plan = request(
        &mut stdin,
        &mut reader,
        "12",
        "events.plan.doc",
        json!({ "outPath": plan_out.to_string_lossy(), "academicYear": "2024-2025" }),
    );
    assert_eq!(
        result_str(&plan, "filename"),
        "План_мероприятий_2024-2025.docx"
    );
    let xml = document_xml(&plan_out);
    assert!(xml.contains("Весенний концерт хора"));
    assert!(xml.contains("18.04.2025"));

    // Tag templates render into a document too.
    let report_out = workspace.join("report.docx");
    let rendered = request(
        &mut stdin,
        &mut reader,
        "13",
        "reports.render.doc",
        json!({
            "text": "Отчёт за [учебный год]. Учащихся: [учеников].",
            "outPath": report_out.to_string_lossy(),
            "asOf": "2024-12-10"
        }),
    );
    assert_eq!(rendered.get("ok").and_then(|v| v.as_bool()), Some(true));
    let xml = document_xml(&report_out);
    assert!(xml.contains("Отчёт за 2024-2025"));

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}

#[test]
fn backup_bundle_packs_database_documents_and_manifest() {
    let workspace = temp_dir("dmsh-backup");
    let (mut child, mut stdin, mut reader) = spawn_sidecar();

    let _ = request(
        &mut stdin,
        &mut reader,
        "1",
        "workspace.select",
        json!({ "path": workspace.to_string_lossy() }),
    );
    // Drop a generated file into documents/ so it lands in the bundle.
    let doc_path = workspace.join("documents").join("note.docx");
    std::fs::write(&doc_path, b"placeholder").expect("write document");

    let bundle = workspace.join("bundle.dmshbackup.zip");
    let created = request(
        &mut stdin,
        &mut reader,
        "2",
        "backup.create",
        json!({ "outPath": bundle.to_string_lossy() }),
    );
    assert_eq!(
        created
            .get("result")
            .and_then(|v| v.get("entryCount"))
            .and_then(|v| v.as_i64()),
        Some(3)
    );

    let f = File::open(&bundle).expect("open bundle");
    let mut archive = zip::ZipArchive::new(f).expect("open zip archive");
    let mut manifest = String::new();
    archive
        .by_name("manifest.json")
        .expect("manifest entry")
        .read_to_string(&mut manifest)
        .expect("read manifest");
    assert!(manifest.contains("dmsh-workspace-v1"));
    assert!(manifest.contains("sha256"));
    assert!(archive.by_name("db/music_school.sqlite3").is_ok());
    assert!(archive.by_name("documents/note.docx").is_ok());

    drop(stdin);
    let _ = child.wait();
    let _ = std::fs::remove_dir_all(workspace);
}
