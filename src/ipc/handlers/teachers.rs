use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{as_of, date_param, db_err, i64_param, short_name, str_param};
use crate::ipc::types::{AppState, Request};
use crate::period::{self, TERM_WHOLE_YEAR};
use crate::stats;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "teachers": [] }));
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));

    let mut stmt = match conn.prepare(
        "SELECT t.id, t.full_name, t.short_name, t.main_department_id, t.is_combining,
                (SELECT COUNT(*) FROM students s
                 WHERE s.lead_teacher_id = t.id AND s.status_id = 1) AS student_count
         FROM teachers t
         ORDER BY t.full_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, i64>(4)?,
                row.get::<_, i64>(5)?,
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut teachers = Vec::new();
    for (id, full_name, short, main_department_id, is_combining, student_count) in rows {
        let mut stmt = match conn.prepare(
            "SELECT term FROM class_report_items
             WHERE teacher_id = ? AND academic_year = ?
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
        teachers.push(json!({
            "id": id,
            "fullName": full_name,
            "shortName": short,
            "mainDepartmentId": main_department_id,
            "isCombining": is_combining != 0,
            "studentCount": student_count,
            "classReportTerms": terms,
        }));
    }
    ok(
        &req.id,
        json!({ "teachers": teachers, "academicYear": academic_year }),
    )
}

fn handle_view(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(teacher_id) = str_param(req, "teacherId") else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };

    let teacher = conn
        .query_row(
            "SELECT full_name, short_name, main_department_id, is_combining
             FROM teachers WHERE id = ?",
            [&teacher_id],
            |row| {
                Ok(json!({
                    "id": teacher_id,
                    "fullName": row.get::<_, String>(0)?,
                    "shortName": row.get::<_, Option<String>>(1)?,
                    "mainDepartmentId": row.get::<_, Option<String>>(2)?,
                    "isCombining": row.get::<_, i64>(3)? != 0,
                }))
            },
        )
        .optional();
    let teacher = match teacher {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "teacher not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    macro_rules! query_rows {
        ($sql:expr, $map:expr) => {{
            let mut stmt = match conn.prepare($sql) {
                Ok(s) => s,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            };
            match stmt
                .query_map([&teacher_id], $map)
                .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            {
                Ok(v) => v,
                Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
            }
        }};
    }

    let students = query_rows!(
        "SELECT id, full_name, class_level, study_years FROM students
         WHERE lead_teacher_id = ? AND status_id = 1
         ORDER BY class_level, full_name",
        |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "fullName": row.get::<_, String>(1)?,
                "classLevel": row.get::<_, i64>(2)?,
                "studyYears": row.get::<_, i64>(3)?,
            }))
        }
    );
    let subject_reports = query_rows!(
        "SELECT r.term, r.academic_year, sub.title, r.total, r.quantity, r.quality
         FROM report_items r JOIN subjects sub ON sub.id = r.subject_id
         WHERE r.teacher_id = ?
         ORDER BY r.academic_year, r.term",
        |row| {
            Ok(json!({
                "term": row.get::<_, i64>(0)?,
                "academicYear": row.get::<_, String>(1)?,
                "subject": row.get::<_, String>(2)?,
                "total": row.get::<_, i64>(3)?,
                "quantity": row.get::<_, Option<i64>>(4)?,
                "quality": row.get::<_, Option<i64>>(5)?,
            }))
        }
    );
    let class_reports = query_rows!(
        "SELECT term, academic_year, total, quantity, quality
         FROM class_report_items WHERE teacher_id = ?
         ORDER BY academic_year, term",
        |row| {
            Ok(json!({
                "term": row.get::<_, i64>(0)?,
                "academicYear": row.get::<_, String>(1)?,
                "total": row.get::<_, i64>(2)?,
                "quantity": row.get::<_, Option<i64>>(3)?,
                "quality": row.get::<_, Option<i64>>(4)?,
            }))
        }
    );
    let lectures = query_rows!(
        "SELECT date, title, term, academic_year FROM lecture_items
         WHERE teacher_id = ? ORDER BY date",
        |row| {
            Ok(json!({
                "date": row.get::<_, String>(0)?,
                "title": row.get::<_, String>(1)?,
                "term": row.get::<_, i64>(2)?,
                "academicYear": row.get::<_, String>(3)?,
            }))
        }
    );
    let open_lessons = query_rows!(
        "SELECT date, title, term, academic_year, student_id FROM open_lesson_items
         WHERE teacher_id = ? ORDER BY date",
        |row| {
            Ok(json!({
                "date": row.get::<_, String>(0)?,
                "title": row.get::<_, String>(1)?,
                "term": row.get::<_, i64>(2)?,
                "academicYear": row.get::<_, String>(3)?,
                "studentId": row.get::<_, Option<String>>(4)?,
            }))
        }
    );
    let courses = query_rows!(
        "SELECT course_type, title, hours, start_date, end_date, place, cert_no
         FROM teacher_courses WHERE teacher_id = ? ORDER BY start_date",
        |row| {
            Ok(json!({
                "courseType": row.get::<_, i64>(0)?,
                "title": row.get::<_, String>(1)?,
                "hours": row.get::<_, i64>(2)?,
                "startDate": row.get::<_, String>(3)?,
                "endDate": row.get::<_, String>(4)?,
                "place": row.get::<_, Option<String>>(5)?,
                "certNo": row.get::<_, String>(6)?,
            }))
        }
    );

    ok(
        &req.id,
        json!({
            "teacher": teacher,
            "students": students,
            "subjectReports": subject_reports,
            "classReports": class_reports,
            "lectures": lectures,
            "openLessons": open_lessons,
            "courses": courses,
        }),
    )
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(full_name) = str_param(req, "fullName") else {
        return err(&req.id, "bad_params", "missing fullName", None);
    };
    let main_department_id = str_param(req, "mainDepartmentId");
    let is_combining = req
        .params
        .get("isCombining")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let teacher_id = Uuid::new_v4().to_string();
    let short = short_name(&full_name);
    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, full_name, short_name, main_department_id, is_combining)
         VALUES(?, ?, ?, ?, ?)",
        (
            &teacher_id,
            &full_name,
            &short,
            &main_department_id,
            is_combining as i64,
        ),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "teachers" })),
        );
    }
    ok(
        &req.id,
        json!({ "teacherId": teacher_id, "shortName": short }),
    )
}

fn handle_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(teacher_id) = str_param(req, "teacherId") else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };
    let Some(full_name) = str_param(req, "fullName") else {
        return err(&req.id, "bad_params", "missing fullName", None);
    };
    let main_department_id = str_param(req, "mainDepartmentId");
    let is_combining = req
        .params
        .get("isCombining")
        .and_then(|v| v.as_bool())
        .unwrap_or(false);

    let short = short_name(&full_name);
    let updated = conn.execute(
        "UPDATE teachers SET full_name = ?, short_name = ?, main_department_id = ?,
             is_combining = ?
         WHERE id = ?",
        (
            &full_name,
            &short,
            &main_department_id,
            is_combining as i64,
            &teacher_id,
        ),
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", "teacher not found", None),
        Ok(_) => ok(&req.id, json!({ "teacherId": teacher_id, "shortName": short })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(teacher_id) = str_param(req, "teacherId") else {
        return err(&req.id, "bad_params", "missing teacherId", None);
    };

    // Dependents block deletion; the FK check would catch these too, but a
    // counted answer is more useful to the caller.
    let dependents: Result<i64, rusqlite::Error> = conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM students WHERE lead_teacher_id = ?1)
         + (SELECT COUNT(*) FROM exam_items WHERE teacher_id = ?1)
         + (SELECT COUNT(*) FROM report_items WHERE teacher_id = ?1)
         + (SELECT COUNT(*) FROM class_report_items WHERE teacher_id = ?1)
         + (SELECT COUNT(*) FROM ensembles WHERE teacher_id = ?1)",
        [&teacher_id],
        |r| r.get(0),
    );
    match dependents {
        Ok(0) => {}
        Ok(n) => {
            return err(
                &req.id,
                "in_use",
                "teacher is referenced by other records",
                Some(json!({ "dependentCount": n })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    match conn.execute("DELETE FROM teachers WHERE id = ?", [&teacher_id]) {
        Ok(0) => err(&req.id, "not_found", "teacher not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, None),
    }
}

fn report_counts(req: &Request) -> Result<(i64, i64, i64, i64), serde_json::Value> {
    let got_best = i64_param(req, "gotBest").unwrap_or(0);
    let got_good = i64_param(req, "gotGood").unwrap_or(0);
    let got_avg = i64_param(req, "gotAvg").unwrap_or(0);
    let got_bad = i64_param(req, "gotBad").unwrap_or(0);
    if [got_best, got_good, got_avg, got_bad].iter().any(|n| *n < 0) {
        return Err(err(&req.id, "bad_params", "counts must be non-negative", None));
    }
    Ok((got_best, got_good, got_avg, got_bad))
}

fn handle_report_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(teacher_id), Some(subject_id)) =
        (str_param(req, "teacherId"), str_param(req, "subjectId"))
    else {
        return err(&req.id, "bad_params", "teacherId and subjectId are required", None);
    };
    let Some(term) = i64_param(req, "term").filter(|t| (1..=TERM_WHOLE_YEAR as i64).contains(t))
    else {
        return err(&req.id, "bad_params", "term must be 1..=5", None);
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));
    let (got_best, got_good, got_avg, got_bad) = match report_counts(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let total = got_best + got_good + got_avg + got_bad;
    let (quality, quantity) = stats::percentages(
        total as usize,
        got_best as usize,
        got_good as usize,
        got_avg as usize,
    );

    let report_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO report_items(
             id, subject_id, teacher_id, term, academic_year,
             total, got_best, got_good, got_avg, got_bad, quantity, quality)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &report_id,
            &subject_id,
            &teacher_id,
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
            Some(json!({ "table": "report_items" })),
        );
    }
    ok(
        &req.id,
        json!({ "reportId": report_id, "quality": quality, "quantity": quantity }),
    )
}

fn handle_class_report_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(teacher_id), Some(department_id)) =
        (str_param(req, "teacherId"), str_param(req, "departmentId"))
    else {
        return err(
            &req.id,
            "bad_params",
            "teacherId and departmentId are required",
            None,
        );
    };
    let Some(term) = i64_param(req, "term").filter(|t| (1..=TERM_WHOLE_YEAR as i64).contains(t))
    else {
        return err(&req.id, "bad_params", "term must be 1..=5", None);
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));
    let (got_best, got_good, got_avg, got_bad) = match report_counts(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let total = got_best + got_good + got_avg + got_bad;
    let (quality, quantity) = stats::percentages(
        total as usize,
        got_best as usize,
        got_good as usize,
        got_avg as usize,
    );

    let report_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO class_report_items(
             id, teacher_id, department_id, term, academic_year,
             total, got_best, got_good, got_avg, got_bad, quantity, quality)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &report_id,
            &teacher_id,
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
            Some(json!({ "table": "class_report_items" })),
        );
    }
    ok(
        &req.id,
        json!({ "reportId": report_id, "quality": quality, "quantity": quantity }),
    )
}

/// Lectures and open lessons share the same shape; the open lesson adds an
/// optional demonstrating student.
fn handle_methodical_create(
    state: &mut AppState,
    req: &Request,
    with_student: bool,
) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(teacher_id), Some(resp_teacher_id), Some(title)) = (
        str_param(req, "teacherId"),
        str_param(req, "respTeacherId"),
        str_param(req, "title"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "teacherId, respTeacherId and title are required",
            None,
        );
    };
    let Some(date) = date_param(req, "date") else {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    };
    let Some(term) = period::term(date) else {
        return err(&req.id, "bad_params", "date falls outside the school year", None);
    };
    let academic_year = period::academic_year(date);
    let item_id = Uuid::new_v4().to_string();

    let result = if with_student {
        let student_id = str_param(req, "studentId");
        conn.execute(
            "INSERT INTO open_lesson_items(
                 id, term, academic_year, date, title, teacher_id, resp_teacher_id, student_id)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            (
                &item_id,
                term,
                &academic_year,
                date.format("%Y-%m-%d").to_string(),
                &title,
                &teacher_id,
                &resp_teacher_id,
                &student_id,
            ),
        )
    } else {
        conn.execute(
            "INSERT INTO lecture_items(
                 id, term, academic_year, date, title, teacher_id, resp_teacher_id)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            (
                &item_id,
                term,
                &academic_year,
                date.format("%Y-%m-%d").to_string(),
                &title,
                &teacher_id,
                &resp_teacher_id,
            ),
        )
    };
    match result {
        Ok(_) => ok(
            &req.id,
            json!({ "itemId": item_id, "term": term, "academicYear": academic_year }),
        ),
        Err(e) => db_err(&req.id, "db_insert_failed", e, None),
    }
}

fn handle_course_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(teacher_id), Some(title), Some(cert_no)) = (
        str_param(req, "teacherId"),
        str_param(req, "title"),
        str_param(req, "certNo"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "teacherId, title and certNo are required",
            None,
        );
    };
    let Some(course_type) = i64_param(req, "courseType") else {
        return err(&req.id, "bad_params", "missing courseType", None);
    };
    let Some(hours) = i64_param(req, "hours").filter(|h| *h > 0) else {
        return err(&req.id, "bad_params", "hours must be positive", None);
    };
    let (Some(start_date), Some(end_date)) =
        (date_param(req, "startDate"), date_param(req, "endDate"))
    else {
        return err(&req.id, "bad_params", "startDate and endDate must be YYYY-MM-DD", None);
    };
    if end_date < start_date {
        return err(&req.id, "bad_params", "endDate precedes startDate", None);
    }
    let place = str_param(req, "place");

    let course_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO teacher_courses(
             id, teacher_id, course_type, title, hours, start_date, end_date, place, cert_no)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        (
            &course_id,
            &teacher_id,
            course_type,
            &title,
            hours,
            start_date.format("%Y-%m-%d").to_string(),
            end_date.format("%Y-%m-%d").to_string(),
            &place,
            &cert_no,
        ),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "teacher_courses" })),
        );
    }
    ok(&req.id, json!({ "courseId": course_id }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.list" => Some(handle_list(state, req)),
        "teachers.view" => Some(handle_view(state, req)),
        "teachers.create" => Some(handle_create(state, req)),
        "teachers.update" => Some(handle_update(state, req)),
        "teachers.delete" => Some(handle_delete(state, req)),
        "teachers.report.create" => Some(handle_report_create(state, req)),
        "teachers.class_report.create" => Some(handle_class_report_create(state, req)),
        "teachers.lecture.create" => Some(handle_methodical_create(state, req, false)),
        "teachers.open_lesson.create" => Some(handle_methodical_create(state, req, true)),
        "teachers.course.create" => Some(handle_course_create(state, req)),
        _ => None,
    }
}
