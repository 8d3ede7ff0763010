use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{as_of, date_param, db_err, i64_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::period;
use crate::reports;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

/// Students sign with surname plus first name, not initials.
fn student_short_name(full_name: &str) -> String {
    full_name
        .split_whitespace()
        .take(2)
        .collect::<Vec<_>>()
        .join(" ")
}

fn student_json(row: &rusqlite::Row<'_>) -> rusqlite::Result<serde_json::Value> {
    Ok(json!({
        "id": row.get::<_, String>(0)?,
        "fullName": row.get::<_, String>(1)?,
        "shortName": row.get::<_, Option<String>>(2)?,
        "classLevel": row.get::<_, i64>(3)?,
        "studyYears": row.get::<_, i64>(4)?,
        "departmentId": row.get::<_, String>(5)?,
        "isDeepLevel": row.get::<_, i64>(6)? != 0,
        "isDismissed": row.get::<_, i64>(7)? != 0,
    }))
}

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(
            &req.id,
            json!({ "active": [], "graduated": [], "onLeave": [], "dismissed": [] }),
        );
    };

    let mut groups = serde_json::Map::new();
    for (key, status) in [
        ("active", db::STATUS_ACTIVE),
        ("graduated", db::STATUS_GRADUATED),
        ("onLeave", db::STATUS_ON_LEAVE),
        ("dismissed", db::STATUS_DISMISSED),
    ] {
        let mut stmt = match conn.prepare(
            "SELECT id, full_name, short_name, class_level, study_years,
                    department_id, is_deep_level, is_dismissed
             FROM students WHERE status_id = ?
             ORDER BY class_level, study_years, full_name",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([status], student_json)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => {
                groups.insert(key.to_string(), json!(v));
            }
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }
    groups.insert(
        "isLevelingWindow".to_string(),
        json!(period::can_level_up(as_of(req))),
    );
    ok(&req.id, serde_json::Value::Object(groups))
}

fn handle_view(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };

    let student = conn
        .query_row(
            "SELECT s.full_name, s.short_name, s.birth_date, s.department_id, d.short_name,
                    s.admission_year, s.study_years, s.class_level, s.status_id,
                    s.contact_phone, s.lead_teacher_id, t.short_name, s.address,
                    s.mother_full_name, s.mother_workplace, s.mother_occupation,
                    s.mother_contact_phone, s.father_full_name, s.father_workplace,
                    s.father_occupation, s.father_contact_phone,
                    s.is_deep_level, s.is_dismissed, s.dismission_date,
                    s.dismission_reason, s.cert_no
             FROM students s
             JOIN departments d ON d.id = s.department_id
             JOIN teachers t ON t.id = s.lead_teacher_id
             WHERE s.id = ?",
            [&student_id],
            |row| {
                Ok(json!({
                    "id": student_id,
                    "fullName": row.get::<_, String>(0)?,
                    "shortName": row.get::<_, Option<String>>(1)?,
                    "birthDate": row.get::<_, Option<String>>(2)?,
                    "departmentId": row.get::<_, String>(3)?,
                    "departmentShortName": row.get::<_, String>(4)?,
                    "admissionYear": row.get::<_, i64>(5)?,
                    "studyYears": row.get::<_, i64>(6)?,
                    "classLevel": row.get::<_, i64>(7)?,
                    "statusId": row.get::<_, i64>(8)?,
                    "contactPhone": row.get::<_, Option<String>>(9)?,
                    "leadTeacherId": row.get::<_, String>(10)?,
                    "leadTeacherShortName": row.get::<_, Option<String>>(11)?,
                    "address": row.get::<_, String>(12)?,
                    "motherFullName": row.get::<_, String>(13)?,
                    "motherWorkplace": row.get::<_, String>(14)?,
                    "motherOccupation": row.get::<_, String>(15)?,
                    "motherContactPhone": row.get::<_, String>(16)?,
                    "fatherFullName": row.get::<_, String>(17)?,
                    "fatherWorkplace": row.get::<_, String>(18)?,
                    "fatherOccupation": row.get::<_, String>(19)?,
                    "fatherContactPhone": row.get::<_, String>(20)?,
                    "isDeepLevel": row.get::<_, i64>(21)? != 0,
                    "isDismissed": row.get::<_, i64>(22)? != 0,
                    "dismissionDate": row.get::<_, Option<String>>(23)?,
                    "dismissionReason": row.get::<_, Option<String>>(24)?,
                    "certNo": row.get::<_, Option<String>>(25)?,
                }))
            },
        )
        .optional();
    let student = match student {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "student not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Memberships plus everything the student performed in, own name or as
    // part of an ensemble.
    let mut stmt = match conn.prepare(
        "SELECT e.id, e.name FROM ensembles e
         JOIN ensemble_members m ON m.ensemble_id = e.id
         WHERE m.student_id = ?",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let ensembles = stmt
        .query_map([&student_id], |row| {
            Ok(json!({ "id": row.get::<_, String>(0)?, "name": row.get::<_, String>(1)? }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let ensembles = match ensembles {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT c.title, c.date, e.name
         FROM concert_participations p
         JOIN concerts c ON c.id = p.concert_id
         LEFT JOIN ensembles e ON e.id = p.ensemble_id
         WHERE p.student_id = ?1
            OR p.ensemble_id IN (SELECT ensemble_id FROM ensemble_members WHERE student_id = ?1)
         ORDER BY c.date",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let concerts = stmt
        .query_map([&student_id], |row| {
            Ok(json!({
                "title": row.get::<_, String>(0)?,
                "date": row.get::<_, String>(1)?,
                "ensemble": row.get::<_, Option<String>>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let concerts = match concerts {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT c.title, c.date, p.result, e.name
         FROM contest_participations p
         JOIN contests c ON c.id = p.contest_id
         LEFT JOIN ensembles e ON e.id = p.ensemble_id
         WHERE p.student_id = ?1
            OR p.ensemble_id IN (SELECT ensemble_id FROM ensemble_members WHERE student_id = ?1)
         ORDER BY c.date",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let contests = stmt
        .query_map([&student_id], |row| {
            Ok(json!({
                "title": row.get::<_, String>(0)?,
                "date": row.get::<_, String>(1)?,
                "result": row.get::<_, String>(2)?,
                "ensemble": row.get::<_, Option<String>>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let contests = match contests {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "student": student,
            "ensembles": ensembles,
            "concerts": concerts,
            "contests": contests,
        }),
    )
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(full_name), Some(department_id), Some(lead_teacher_id), Some(address)) = (
        str_param(req, "fullName"),
        str_param(req, "departmentId"),
        str_param(req, "leadTeacherId"),
        str_param(req, "address"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "fullName, departmentId, leadTeacherId and address are required",
            None,
        );
    };
    let Some(study_years) = i64_param(req, "studyYears").filter(|y| *y > 0) else {
        return err(&req.id, "bad_params", "studyYears must be positive", None);
    };
    let admission_year = i64_param(req, "admissionYear")
        .unwrap_or_else(|| chrono::Datelike::year(&as_of(req)) as i64);
    let class_level = i64_param(req, "classLevel").unwrap_or(1);
    let birth_date = date_param(req, "birthDate").map(|d| d.format("%Y-%m-%d").to_string());
    let is_deep_level = req
        .params
        .get("isDeepLevel")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);
    let contact_phone = str_param(req, "contactPhone");

    let guardian = |name: &str| str_param(req, name).unwrap_or_else(|| "(не указано)".to_string());
    let student_id = Uuid::new_v4().to_string();
    let short = student_short_name(&full_name);
    if let Err(e) = conn.execute(
        "INSERT INTO students(
             id, full_name, short_name, birth_date, department_id,
             admission_year, study_years, class_level, status_id, contact_phone,
             lead_teacher_id, address,
             mother_full_name, mother_workplace, mother_occupation, mother_contact_phone,
             father_full_name, father_workplace, father_occupation, father_contact_phone,
             is_deep_level)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &student_id,
            &full_name,
            &short,
            &birth_date,
            &department_id,
            admission_year,
            study_years,
            class_level,
            &contact_phone,
            &lead_teacher_id,
            &address,
            guardian("motherFullName"),
            guardian("motherWorkplace"),
            guardian("motherOccupation"),
            guardian("motherContactPhone"),
            guardian("fatherFullName"),
            guardian("fatherWorkplace"),
            guardian("fatherOccupation"),
            guardian("fatherContactPhone"),
            is_deep_level as i64,
        ],
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "students" })),
        );
    }
    ok(
        &req.id,
        json!({ "studentId": student_id, "shortName": short }),
    )
}

const PATCHABLE: &[(&str, &str)] = &[
    ("fullName", "full_name"),
    ("birthDate", "birth_date"),
    ("departmentId", "department_id"),
    ("admissionYear", "admission_year"),
    ("studyYears", "study_years"),
    ("classLevel", "class_level"),
    ("statusId", "status_id"),
    ("contactPhone", "contact_phone"),
    ("leadTeacherId", "lead_teacher_id"),
    ("address", "address"),
    ("motherFullName", "mother_full_name"),
    ("motherWorkplace", "mother_workplace"),
    ("motherOccupation", "mother_occupation"),
    ("motherContactPhone", "mother_contact_phone"),
    ("fatherFullName", "father_full_name"),
    ("fatherWorkplace", "father_workplace"),
    ("fatherOccupation", "father_occupation"),
    ("fatherContactPhone", "father_contact_phone"),
    ("isDeepLevel", "is_deep_level"),
    ("certNo", "cert_no"),
];

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(patch) = req.params.get("patch").and_then(|v| v.as_object()) else {
        return err(&req.id, "bad_params", "missing patch object", None);
    };

    let mut sets = Vec::new();
    let mut values: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
    for (key, column) in PATCHABLE {
        let Some(value) = patch.get(*key) else {
            continue;
        };
        sets.push(format!("{} = ?", column));
        match value {
            serde_json::Value::Null => values.push(Box::new(None::<String>)),
            serde_json::Value::Bool(b) => values.push(Box::new(*b as i64)),
            serde_json::Value::Number(n) => values.push(Box::new(n.as_i64().unwrap_or(0))),
            serde_json::Value::String(s) => values.push(Box::new(s.clone())),
            _ => return err(&req.id, "bad_params", format!("invalid value for {key}"), None),
        }
    }
    if sets.is_empty() {
        return err(&req.id, "bad_params", "patch has no known fields", None);
    }
    // Keep the display name in sync when the full name changes.
    if let Some(serde_json::Value::String(full_name)) = patch.get("fullName") {
        sets.push("short_name = ?".to_string());
        values.push(Box::new(student_short_name(full_name)));
    }
    values.push(Box::new(student_id.clone()));

    let sql = format!("UPDATE students SET {} WHERE id = ?", sets.join(", "));
    let params = rusqlite::params_from_iter(values.iter().map(|v| v.as_ref()));
    match conn.execute(&sql, params) {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_dismiss(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(date) = date_param(req, "date") else {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    };
    let reason = str_param(req, "reason");

    let updated = conn.execute(
        "UPDATE students SET status_id = ?, is_dismissed = 1,
             dismission_date = ?, dismission_reason = ?
         WHERE id = ?",
        (
            db::STATUS_DISMISSED,
            date.format("%Y-%m-%d").to_string(),
            &reason,
            &student_id,
        ),
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_limbo(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    match conn.execute(
        "UPDATE students SET status_id = ? WHERE id = ?",
        (db::STATUS_ON_LEAVE, &student_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_graduate(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_id) = str_param(req, "studentId") else {
        return err(&req.id, "bad_params", "missing studentId", None);
    };
    let Some(cert_no) = str_param(req, "certNo") else {
        return err(&req.id, "bad_params", "missing certNo", None);
    };
    let date = date_param(req, "date").map(|d| d.format("%Y-%m-%d").to_string());

    let updated = conn.execute(
        "UPDATE students SET status_id = ?, cert_no = ?, dismission_date = ? WHERE id = ?",
        (db::STATUS_GRADUATED, &cert_no, &date, &student_id),
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", "student not found", None),
        Ok(_) => ok(&req.id, json!({ "studentId": student_id })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_level_up(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let as_of = as_of(req);
    if !period::can_level_up(as_of) {
        return err(
            &req.id,
            "level_up_window_closed",
            "level-up is only allowed in May and June",
            None,
        );
    }
    // academic_year in class_history stores the starting calendar year.
    let history_year: i64 = period::academic_year(as_of)
        .split('-')
        .next()
        .and_then(|y| y.parse().ok())
        .unwrap_or(0);

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };

    let students = {
        let mut stmt = match tx.prepare(
            "SELECT id, class_level, study_years FROM students WHERE status_id = 1",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        match rows {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    };

    let mut promoted = 0i64;
    let mut finished = 0i64;
    for (id, class_level, study_years) in &students {
        if class_level == study_years {
            if let Err(e) = tx.execute(
                "UPDATE students SET is_dismissed = 1 WHERE id = ?",
                [id],
            ) {
                let _ = tx.rollback();
                return db_err(&req.id, "db_update_failed", e, None);
            }
            finished += 1;
        }
        if let Err(e) = tx.execute(
            "INSERT INTO class_history(id, student_id, academic_year, class_level, next_class)
             VALUES(?, ?, ?, ?, ?)",
            (
                Uuid::new_v4().to_string(),
                id,
                history_year,
                class_level,
                class_level + 1,
            ),
        ) {
            let _ = tx.rollback();
            return db_err(&req.id, "db_insert_failed", e, None);
        }
        if let Err(e) = tx.execute(
            "UPDATE students SET class_level = class_level + 1 WHERE id = ?",
            [id],
        ) {
            let _ = tx.rollback();
            return db_err(&req.id, "db_update_failed", e, None);
        }
        promoted += 1;
    }

    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({ "promoted": promoted, "finished": finished }),
    )
}

fn handle_title_page_doc(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(student_id), Some(out_path)) =
        (str_param(req, "studentId"), str_param(req, "outPath"))
    else {
        return err(&req.id, "bad_params", "studentId and outPath are required", None);
    };

    let full_name: Option<String> = match conn
        .query_row(
            "SELECT full_name FROM students WHERE id = ?",
            [&student_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(full_name) = full_name else {
        return err(&req.id, "not_found", "student not found", None);
    };

    let doc = match reports::student_title_page(conn, &student_id) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:?}"), None),
    };
    match doc.build().and_then(|bytes| {
        std::fs::write(&out_path, bytes)?;
        Ok(())
    }) {
        Ok(()) => {
            let last_name = full_name.split_whitespace().next().unwrap_or("");
            ok(
                &req.id,
                json!({
                    "outPath": out_path,
                    "filename": format!("Личное_дело_{}.docx", last_name),
                }),
            )
        }
        Err(e) => err(&req.id, "doc_failed", format!("{e:?}"), None),
    }
}

fn handle_title_pages_doc(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(out_path) = str_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };

    let doc = match reports::all_title_pages(conn) {
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
                "filename": format!(
                    "Личные_дела_титул_{}.docx",
                    period::academic_year(as_of(req))
                ),
            }),
        ),
        Err(e) => err(&req.id, "doc_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "students.list" => Some(handle_list(state, req)),
        "students.view" => Some(handle_view(state, req)),
        "students.create" => Some(handle_create(state, req)),
        "students.update" => Some(handle_update(state, req)),
        "students.dismiss" => Some(handle_dismiss(state, req)),
        "students.limbo" => Some(handle_limbo(state, req)),
        "students.graduate" => Some(handle_graduate(state, req)),
        "students.level_up" => Some(handle_level_up(state, req)),
        "students.title_page.doc" => Some(handle_title_page_doc(state, req)),
        "students.title_pages.doc" => Some(handle_title_pages_doc(state, req)),
        _ => None,
    }
}
