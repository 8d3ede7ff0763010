use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{as_of, date_param, db_err, str_param};
use crate::ipc::types::{AppState, ExamDraft, ExamWizard, Request};
use crate::period::{self, TERM_WHOLE_YEAR};
use crate::reports;
use crate::stats;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "exams": [] }));
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));
    let term = req
        .params
        .get("term")
        .and_then(|v| v.as_i64())
        .filter(|t| (1..=TERM_WHOLE_YEAR as i64).contains(t));

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.date, e.term, et.name, e.discipline, d.short_name,
                e.protocol_number,
                (SELECT COUNT(*) FROM exam_items i WHERE i.exam_id = e.id)
         FROM exams e
         JOIN exam_types et ON et.id = e.exam_type_id
         JOIN departments d ON d.id = e.department_id
         WHERE e.academic_year = ?1 AND (?2 IS NULL OR e.term = ?2)
         ORDER BY e.protocol_number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let exams = stmt
        .query_map((&academic_year, term), |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "date": row.get::<_, String>(1)?,
                "term": row.get::<_, Option<i64>>(2)?,
                "examType": row.get::<_, String>(3)?,
                "discipline": row.get::<_, String>(4)?,
                "departmentShortName": row.get::<_, String>(5)?,
                "protocolNumber": row.get::<_, i64>(6)?,
                "studentCount": row.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match exams {
        Ok(exams) => ok(
            &req.id,
            json!({ "exams": exams, "academicYear": academic_year }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_view(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(exam_id) = str_param(req, "examId") else {
        return err(&req.id, "bad_params", "missing examId", None);
    };

    let exam = conn
        .query_row(
            "SELECT e.date, e.term, et.name, e.discipline, d.short_name,
                    e.commission_members, e.academic_year, e.protocol_number
             FROM exams e
             JOIN exam_types et ON et.id = e.exam_type_id
             JOIN departments d ON d.id = e.department_id
             WHERE e.id = ?",
            [&exam_id],
            |row| {
                Ok(json!({
                    "id": exam_id,
                    "date": row.get::<_, String>(0)?,
                    "term": row.get::<_, Option<i64>>(1)?,
                    "examType": row.get::<_, String>(2)?,
                    "discipline": row.get::<_, String>(3)?,
                    "departmentShortName": row.get::<_, String>(4)?,
                    "commissionMembers": row.get::<_, Option<String>>(5)?,
                    "academicYear": row.get::<_, String>(6)?,
                    "protocolNumber": row.get::<_, i64>(7)?,
                }))
            },
        )
        .optional();
    let exam = match exam {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT i.id, s.short_name, s.class_level, s.study_years, t.short_name,
                i.program, i.grade
         FROM exam_items i
         JOIN students s ON s.id = i.student_id
         JOIN teachers t ON t.id = i.teacher_id
         WHERE i.exam_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let items = stmt
        .query_map([&exam_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let items = match items {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let grade_stats = stats::tally_grades(items.iter().map(|i| i.6.as_str()));
    let items: Vec<serde_json::Value> = items
        .iter()
        .map(|(id, short_name, class_level, study_years, teacher, program, grade)| {
            json!({
                "itemId": id,
                "studentShortName": short_name,
                "classLevel": class_level,
                "studyYears": study_years,
                "teacherShortName": teacher,
                "program": program,
                "grade": grade,
            })
        })
        .collect();

    ok(
        &req.id,
        json!({
            "exam": exam,
            "items": items,
            "stats": {
                "total": grade_stats.total,
                "grades": {
                    "1": grade_stats.counts[0],
                    "2": grade_stats.counts[1],
                    "3": grade_stats.counts[2],
                    "4": grade_stats.counts[3],
                    "5": grade_stats.counts[4],
                },
                "quality": grade_stats.quality,
                "quantity": grade_stats.quantity,
            },
        }),
    )
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(exam_id) = str_param(req, "examId") else {
        return err(&req.id, "bad_params", "missing examId", None);
    };

    let exists: Result<Option<i64>, _> = conn
        .query_row("SELECT 1 FROM exams WHERE id = ?", [&exam_id], |r| r.get(0))
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "exam not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute("DELETE FROM exam_items WHERE exam_id = ?", [&exam_id]) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_delete_failed", e, None);
    }
    if let Err(e) = tx.execute("DELETE FROM exams WHERE id = ?", [&exam_id]) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_delete_failed", e, None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deleted": true }))
}

fn handle_protocol_doc(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(exam_id), Some(out_path)) = (str_param(req, "examId"), str_param(req, "outPath"))
    else {
        return err(&req.id, "bad_params", "examId and outPath are required", None);
    };

    let meta: Result<Option<(i64, String)>, _> = conn
        .query_row(
            "SELECT protocol_number, academic_year FROM exams WHERE id = ?",
            [&exam_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional();
    let Some((protocol_number, academic_year)) = (match meta {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }) else {
        return err(&req.id, "not_found", "exam not found", None);
    };

    let doc = match reports::exam_protocol(conn, &exam_id) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:?}"), None),
    };
    match doc.build().and_then(|bytes| {
        std::fs::write(&out_path, bytes)?;
        Ok(())
    }) {
        Ok(()) => ok(
            &req.id,
            json!({
                "outPath": out_path,
                "filename": format!("Протокол_{}_{}.docx", protocol_number, academic_year),
            }),
        ),
        Err(e) => err(&req.id, "doc_failed", format!("{e:?}"), None),
    }
}

fn require_session(req: &Request) -> Result<String, serde_json::Value> {
    str_param(req, "session")
        .ok_or_else(|| err(&req.id, "bad_params", "missing session", None))
}

fn department_roster(
    conn: &rusqlite::Connection,
    department_id: &str,
) -> rusqlite::Result<Vec<serde_json::Value>> {
    let mut stmt = conn.prepare(
        "SELECT id, short_name, class_level, study_years, lead_teacher_id
         FROM students
         WHERE department_id = ? AND status_id = 1
         ORDER BY class_level, full_name",
    )?;
    let rows = stmt
        .query_map([department_id], |row| {
            Ok(json!({
                "studentId": row.get::<_, String>(0)?,
                "shortName": row.get::<_, Option<String>>(1)?,
                "classLevel": row.get::<_, i64>(2)?,
                "studyYears": row.get::<_, i64>(3)?,
                "leadTeacherId": row.get::<_, String>(4)?,
            }))
        })?
        .collect();
    rows
}

fn handle_wizard_begin(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(exam_type_id), Some(department_id), Some(discipline)) = (
        str_param(req, "examTypeId"),
        str_param(req, "departmentId"),
        str_param(req, "discipline"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "examTypeId, departmentId and discipline are required",
            None,
        );
    };
    let Some(date) = date_param(req, "date") else {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    };
    let commission_members = str_param(req, "commissionMembers").unwrap_or_default();

    for (table, id) in [("exam_types", &exam_type_id), ("departments", &department_id)] {
        let exists: Result<Option<i64>, _> = conn
            .query_row(&format!("SELECT 1 FROM {} WHERE id = ?", table), [id], |r| {
                r.get(0)
            })
            .optional();
        match exists {
            Ok(Some(_)) => {}
            Ok(None) => return err(&req.id, "not_found", format!("unknown {} id", table), None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let term = period::term(date);
    let academic_year = period::academic_year(date);
    let roster = match department_roster(conn, &department_id) {
        Ok(r) => r,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    state.wizards.insert(
        session,
        ExamWizard::Metadata(ExamDraft {
            date: date.format("%Y-%m-%d").to_string(),
            term,
            academic_year: academic_year.clone(),
            exam_type_id,
            discipline,
            department_id,
            commission_members,
        }),
    );
    ok(
        &req.id,
        json!({
            "stage": "roster",
            "term": term,
            "academicYear": academic_year,
            "roster": roster,
        }),
    )
}

fn handle_wizard_roster(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    // Stage guard: the metadata stage must have completed for this session.
    let draft = match state.wizards.get(&session) {
        Some(ExamWizard::Metadata(draft)) => draft.clone(),
        Some(ExamWizard::Roster { draft, .. }) => draft.clone(),
        None => {
            return err(
                &req.id,
                "wizard_state_missing",
                "begin the protocol wizard first",
                None,
            )
        }
    };

    let Some(ids) = req.params.get("studentIds").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing studentIds", None);
    };
    let student_ids: Vec<String> = ids
        .iter()
        .filter_map(|v| v.as_str())
        .map(String::from)
        .collect();
    if student_ids.is_empty() || student_ids.len() != ids.len() {
        return err(
            &req.id,
            "bad_params",
            "studentIds must be a non-empty string array",
            None,
        );
    }

    for student_id in &student_ids {
        let in_dept: Result<Option<i64>, _> = conn
            .query_row(
                "SELECT 1 FROM students
                 WHERE id = ? AND department_id = ? AND status_id = 1",
                (student_id, &draft.department_id),
                |r| r.get(0),
            )
            .optional();
        match in_dept {
            Ok(Some(_)) => {}
            Ok(None) => {
                return err(
                    &req.id,
                    "bad_params",
                    "student is not on the department's active roster",
                    Some(json!({ "studentId": student_id })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let count = student_ids.len();
    state
        .wizards
        .insert(session, ExamWizard::Roster { draft, student_ids });
    ok(
        &req.id,
        json!({ "stage": "grade", "selectedCount": count }),
    )
}

fn handle_wizard_grade(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (draft, student_ids) = match state.wizards.get(&session) {
        Some(ExamWizard::Roster { draft, student_ids }) => (draft.clone(), student_ids.clone()),
        Some(ExamWizard::Metadata(_)) => {
            return err(
                &req.id,
                "wizard_state_missing",
                "select the roster before grading",
                None,
            )
        }
        None => {
            return err(
                &req.id,
                "wizard_state_missing",
                "begin the protocol wizard first",
                None,
            )
        }
    };

    let Some(raw_items) = req.params.get("items").and_then(|v| v.as_array()) else {
        return err(&req.id, "bad_params", "missing items", None);
    };
    let mut items = Vec::new();
    for raw in raw_items {
        let (Some(student_id), Some(teacher_id), Some(program), Some(grade)) = (
            raw.get("studentId").and_then(|v| v.as_str()),
            raw.get("teacherId").and_then(|v| v.as_str()),
            raw.get("program").and_then(|v| v.as_str()),
            raw.get("grade").and_then(|v| v.as_str()),
        ) else {
            return err(
                &req.id,
                "bad_params",
                "each item needs studentId, teacherId, program and grade",
                None,
            );
        };
        items.push((
            student_id.to_string(),
            teacher_id.to_string(),
            program.to_string(),
            grade.to_string(),
        ));
    }
    // Every selected student is graded exactly once.
    if items.len() != student_ids.len()
        || !student_ids
            .iter()
            .all(|id| items.iter().any(|(sid, ..)| sid == id))
    {
        return err(
            &req.id,
            "bad_params",
            "items must cover exactly the selected students",
            None,
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Protocol numbers restart at 1 each academic year.
    let next_number: i64 = match tx.query_row(
        "SELECT COALESCE(MAX(protocol_number), 0) + 1 FROM exams WHERE academic_year = ?",
        [&draft.academic_year],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let exam_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO exams(id, date, term, exam_type_id, discipline, department_id,
             commission_members, academic_year, protocol_number)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &exam_id,
            &draft.date,
            draft.term,
            &draft.exam_type_id,
            &draft.discipline,
            &draft.department_id,
            &draft.commission_members,
            &draft.academic_year,
            next_number,
        ],
    ) {
        let _ = tx.rollback();
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "exams" })),
        );
    }
    for (student_id, teacher_id, program, grade) in &items {
        if let Err(e) = tx.execute(
            "INSERT INTO exam_items(id, exam_id, student_id, teacher_id, program, grade)
             VALUES(?, ?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                &exam_id,
                student_id,
                teacher_id,
                program,
                grade,
            ),
        ) {
            let _ = tx.rollback();
            return db_err(
                &req.id,
                "db_insert_failed",
                e,
                Some(json!({ "table": "exam_items" })),
            );
        }
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }

    // Staged state survives any failure above; only a committed protocol
    // clears it.
    state.wizards.remove(&session);
    ok(
        &req.id,
        json!({ "examId": exam_id, "protocolNumber": next_number }),
    )
}

fn handle_wizard_cancel(state: &mut AppState, req: &Request) -> serde_json::Value {
    let session = match require_session(req) {
        Ok(s) => s,
        Err(resp) => return resp,
    };
    let existed = state.wizards.remove(&session).is_some();
    ok(&req.id, json!({ "cancelled": existed }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "exams.list" => Some(handle_list(state, req)),
        "exams.view" => Some(handle_view(state, req)),
        "exams.delete" => Some(handle_delete(state, req)),
        "exams.protocol.doc" => Some(handle_protocol_doc(state, req)),
        "exams.wizard.begin" => Some(handle_wizard_begin(state, req)),
        "exams.wizard.roster" => Some(handle_wizard_roster(state, req)),
        "exams.wizard.grade" => Some(handle_wizard_grade(state, req)),
        "exams.wizard.cancel" => Some(handle_wizard_cancel(state, req)),
        _ => None,
    }
}
