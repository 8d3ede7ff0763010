use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{as_of, db_err, i64_param, str_param};
use crate::ipc::types::{AppState, Request};
use crate::period::{self, TERM_WHOLE_YEAR};
use crate::reports;
use crate::stats;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "departments": [] }));
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));

    let mut stmt = match conn.prepare(
        "SELECT
           d.id, d.full_name, d.short_name, d.title,
           (SELECT COUNT(*) FROM students s
            WHERE s.department_id = d.id AND s.status_id = 1) AS student_count
         FROM departments d
         ORDER BY d.short_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut departments = Vec::new();
    for (id, full_name, short_name, title, student_count) in rows {
        // Terms for which this department already filed a report this year.
        let mut stmt = match conn.prepare(
            "SELECT term FROM department_report_items
             WHERE department_id = ? AND academic_year = ?
             ORDER BY term",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let terms = stmt
            .query_map((&id, &academic_year), |row| row.get::<_, i64>(0))
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        let terms = match terms {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        departments.push(json!({
            "id": id,
            "fullName": full_name,
            "shortName": short_name,
            "title": title,
            "studentCount": student_count,
            "reportedTerms": terms,
        }));
    }

    ok(
        &req.id,
        json!({ "departments": departments, "academicYear": academic_year }),
    )
}

fn handle_view(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(req, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };

    let dept = conn
        .query_row(
            "SELECT full_name, short_name, title FROM departments WHERE id = ?",
            [&department_id],
            |row| {
                Ok(json!({
                    "id": department_id,
                    "fullName": row.get::<_, String>(0)?,
                    "shortName": row.get::<_, String>(1)?,
                    "title": row.get::<_, String>(2)?,
                }))
            },
        )
        .optional();
    let dept = match dept {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "department not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT id, full_name, class_level, study_years, is_deep_level
         FROM students
         WHERE department_id = ? AND status_id = 1
         ORDER BY class_level, full_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let students = stmt
        .query_map([&department_id], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "fullName": row.get::<_, String>(1)?,
                "classLevel": row.get::<_, i64>(2)?,
                "studyYears": row.get::<_, i64>(3)?,
                "isDeepLevel": row.get::<_, i64>(4)? != 0,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let students = match students {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT term, academic_year, total, got_best, got_good, got_avg, got_bad,
                quantity, quality
         FROM department_report_items
         WHERE department_id = ?
         ORDER BY academic_year, term",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let dept_reports = stmt
        .query_map([&department_id], |row| {
            Ok(json!({
                "term": row.get::<_, i64>(0)?,
                "academicYear": row.get::<_, String>(1)?,
                "total": row.get::<_, i64>(2)?,
                "gotBest": row.get::<_, i64>(3)?,
                "gotGood": row.get::<_, i64>(4)?,
                "gotAvg": row.get::<_, i64>(5)?,
                "gotBad": row.get::<_, i64>(6)?,
                "quantity": row.get::<_, Option<i64>>(7)?,
                "quality": row.get::<_, Option<i64>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let dept_reports = match dept_reports {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({ "department": dept, "students": students, "reports": dept_reports }),
    )
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(full_name), Some(short_name), Some(title)) = (
        str_param(req, "fullName"),
        str_param(req, "shortName"),
        str_param(req, "title"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "fullName, shortName and title are required",
            None,
        );
    };

    let department_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO departments(id, full_name, short_name, title) VALUES(?, ?, ?, ?)",
        (&department_id, &full_name, &short_name, &title),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "departments" })),
        );
    }
    ok(&req.id, json!({ "departmentId": department_id }))
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(req, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };
    let (Some(full_name), Some(short_name), Some(title)) = (
        str_param(req, "fullName"),
        str_param(req, "shortName"),
        str_param(req, "title"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "fullName, shortName and title are required",
            None,
        );
    };

    let updated = conn.execute(
        "UPDATE departments SET full_name = ?, short_name = ?, title = ? WHERE id = ?",
        (&full_name, &short_name, &title, &department_id),
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", "department not found", None),
        Ok(_) => ok(&req.id, json!({ "departmentId": department_id })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(req, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };

    let students: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM students WHERE department_id = ?",
        [&department_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if students > 0 {
        return err(
            &req.id,
            "in_use",
            "department still has students",
            Some(json!({ "studentCount": students })),
        );
    }

    match conn.execute("DELETE FROM departments WHERE id = ?", [&department_id]) {
        Ok(0) => err(&req.id, "not_found", "department not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, None),
    }
}

fn handle_report_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(department_id) = str_param(req, "departmentId") else {
        return err(&req.id, "bad_params", "missing departmentId", None);
    };
    let Some(term) = i64_param(req, "term").filter(|t| (1..=TERM_WHOLE_YEAR as i64).contains(t))
    else {
        return err(&req.id, "bad_params", "term must be 1..=5", None);
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));

    let got_best = i64_param(req, "gotBest").unwrap_or(0);
    let got_good = i64_param(req, "gotGood").unwrap_or(0);
    let got_avg = i64_param(req, "gotAvg").unwrap_or(0);
    let got_bad = i64_param(req, "gotBad").unwrap_or(0);
    if [got_best, got_good, got_avg, got_bad].iter().any(|n| *n < 0) {
        return err(&req.id, "bad_params", "counts must be non-negative", None);
    }

    let roster: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM students WHERE department_id = ? AND status_id = 1",
        [&department_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let total = got_best + got_good + got_avg + got_bad;
    if total != roster {
        return err(
            &req.id,
            "bad_params",
            format!(
                "counts sum to {}, department roster has {} active students",
                total, roster
            ),
            Some(json!({ "rosterSize": roster })),
        );
    }

    let (quality, quantity) = stats::percentages(
        total as usize,
        got_best as usize,
        got_good as usize,
        got_avg as usize,
    );
    let report_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO department_report_items(
             id, department_id, term, academic_year,
             total, got_best, got_good, got_avg, got_bad, quantity, quality)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &report_id,
            &department_id,
            term,
            &academic_year,
            total,
            got_best,
            got_good,
            got_avg,
            got_bad,
            quantity,
            quality,
        ),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "department_report_items" })),
        );
    }

    ok(
        &req.id,
        json!({
            "reportId": report_id,
            "quality": quality,
            "quantity": quantity,
            "academicYear": academic_year,
        }),
    )
}

fn handle_report_doc(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(department_id), Some(out_path)) =
        (str_param(req, "departmentId"), str_param(req, "outPath"))
    else {
        return err(&req.id, "bad_params", "departmentId and outPath are required", None);
    };
    let Some(term) = i64_param(req, "term").filter(|t| (1..=TERM_WHOLE_YEAR as i64).contains(t))
    else {
        return err(&req.id, "bad_params", "term must be 1..=5", None);
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));

    let short_name: Option<String> = match conn
        .query_row(
            "SELECT short_name FROM departments WHERE id = ?",
            [&department_id],
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some(short_name) = short_name else {
        return err(&req.id, "not_found", "department not found", None);
    };

    let doc = match reports::department_report(conn, &department_id, term as u32, &academic_year)
    {
        Ok(d) => d,
        Err(e) => {
            return err(
                &req.id,
                "not_found",
                format!("no report for that period: {e}"),
                None,
            )
        }
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
                    "Отчёт {} ({}).docx",
                    short_name,
                    period::term_title(term as u32)
                ),
            }),
        ),
        Err(e) => err(&req.id, "doc_failed", format!("{e:?}"), None),
    }
}

fn handle_students_doc(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(out_path) = str_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let department_id = str_param(req, "departmentId");

    if let Some(id) = &department_id {
        let exists: Result<Option<i64>, _> = conn
            .query_row("SELECT 1 FROM departments WHERE id = ?", [id], |r| r.get(0))
            .optional();
        match exists {
            Ok(Some(_)) => {}
            Ok(None) => return err(&req.id, "not_found", "department not found", None),
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    let doc = match reports::department_students(conn, department_id.as_deref(), as_of(req)) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:?}"), None),
    };
    match doc.build().and_then(|bytes| {
        std::fs::write(&out_path, bytes)?;
        Ok(())
    }) {
        Ok(()) => ok(
            &req.id,
            json!({ "outPath": out_path, "filename": "Список учеников.docx" }),
        ),
        Err(e) => err(&req.id, "doc_failed", format!("{e:?}"), None),
    }
}

fn handle_summary(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(term) = i64_param(req, "term").filter(|t| (1..=TERM_WHOLE_YEAR as i64).contains(t))
    else {
        return err(&req.id, "bad_params", "term must be 1..=5", None);
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));

    match reports::collect_term_summaries(conn, term as u32, &academic_year) {
        Ok(summaries) => ok(
            &req.id,
            json!({
                "term": term,
                "academicYear": academic_year,
                "departments": summaries,
            }),
        ),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "departments.list" => Some(handle_list(state, req)),
        "departments.view" => Some(handle_view(state, req)),
        "departments.create" => Some(handle_create(state, req)),
        "departments.update" => Some(handle_update(state, req)),
        "departments.delete" => Some(handle_delete(state, req)),
        "departments.report.create" => Some(handle_report_create(state, req)),
        "departments.report.doc" => Some(handle_report_doc(state, req)),
        "departments.students.doc" => Some(handle_students_doc(state, req)),
        "departments.summary" => Some(handle_summary(state, req)),
        _ => None,
    }
}
