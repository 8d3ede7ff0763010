use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_err, i64_param, str_param};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

const SCHOOL_ROW_ID: &str = "school";

fn handle_school_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let row: Result<Option<serde_json::Value>, _> = conn
        .query_row(
            "SELECT si.full_title, si.short_title, si.region_id, r.name, si.methodist_id, t.short_name
             FROM school_info si
             JOIN regions r ON r.id = si.region_id
             LEFT JOIN teachers t ON t.id = si.methodist_id
             WHERE si.id = ?",
            [SCHOOL_ROW_ID],
            |row| {
                Ok(json!({
                    "fullTitle": row.get::<_, String>(0)?,
                    "shortTitle": row.get::<_, String>(1)?,
                    "regionId": row.get::<_, i64>(2)?,
                    "regionName": row.get::<_, String>(3)?,
                    "methodistId": row.get::<_, Option<String>>(4)?,
                    "methodistShortName": row.get::<_, Option<String>>(5)?,
                }))
            },
        )
        .optional();
    match row {
        Ok(Some(school)) => ok(&req.id, json!({ "school": school })),
        Ok(None) => ok(&req.id, json!({ "school": serde_json::Value::Null })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_school_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(full_title), Some(short_title), Some(region_id)) = (
        str_param(req, "fullTitle"),
        str_param(req, "shortTitle"),
        i64_param(req, "regionId"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "fullTitle, shortTitle and regionId are required",
            None,
        );
    };
    let methodist_id = str_param(req, "methodistId");

    // The school record is a singleton, so setting it is always an upsert.
    if let Err(e) = conn.execute(
        "INSERT INTO school_info(id, full_title, short_title, region_id, methodist_id)
         VALUES(?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(id) DO UPDATE SET
             full_title = ?2, short_title = ?3, region_id = ?4, methodist_id = ?5",
        rusqlite::params![SCHOOL_ROW_ID, &full_title, &short_title, region_id, &methodist_id],
    ) {
        return db_err(
            &req.id,
            "db_update_failed",
            e,
            Some(json!({ "table": "school_info" })),
        );
    }
    ok(&req.id, json!({ "saved": true }))
}

fn handle_regions_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare("SELECT id, name FROM regions ORDER BY id") {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let regions = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, i64>(0)?,
                "name": row.get::<_, String>(1)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match regions {
        Ok(regions) => ok(&req.id, json!({ "regions": regions })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exam_types_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT et.id, et.name, (SELECT COUNT(*) FROM exams e WHERE e.exam_type_id = et.id)
         FROM exam_types et
         ORDER BY et.name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let types = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "name": row.get::<_, String>(1)?,
                "examCount": row.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match types {
        Ok(types) => ok(&req.id, json!({ "examTypes": types })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_exam_type_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(name) = str_param(req, "name") else {
        return err(&req.id, "bad_params", "missing name", None);
    };

    let type_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO exam_types(id, name) VALUES(?, ?)",
        (&type_id, &name),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "exam_types" })),
        );
    }
    ok(&req.id, json!({ "examTypeId": type_id }))
}

fn handle_exam_type_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(type_id) = str_param(req, "examTypeId") else {
        return err(&req.id, "bad_params", "missing examTypeId", None);
    };

    let exam_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM exams WHERE exam_type_id = ?",
        [&type_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if exam_count > 0 {
        return err(
            &req.id,
            "in_use",
            "exam type is referenced by recorded exams",
            Some(json!({ "examCount": exam_count })),
        );
    }

    match conn.execute("DELETE FROM exam_types WHERE id = ?", [&type_id]) {
        Ok(0) => err(&req.id, "not_found", "exam type not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, None),
    }
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT s.id, s.title, (SELECT COUNT(*) FROM report_items ri WHERE ri.subject_id = s.id)
         FROM subjects s
         ORDER BY s.title",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let subjects = stmt
        .query_map([], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "title": row.get::<_, String>(1)?,
                "reportCount": row.get::<_, i64>(2)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match subjects {
        Ok(subjects) => ok(&req.id, json!({ "subjects": subjects })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_subject_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(title) = str_param(req, "title") else {
        return err(&req.id, "bad_params", "missing title", None);
    };

    let subject_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, title) VALUES(?, ?)",
        (&subject_id, &title),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "subjects" })),
        );
    }
    ok(&req.id, json!({ "subjectId": subject_id }))
}

fn handle_subject_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(subject_id), Some(title)) = (str_param(req, "subjectId"), str_param(req, "title"))
    else {
        return err(&req.id, "bad_params", "subjectId and title are required", None);
    };

    match conn.execute(
        "UPDATE subjects SET title = ? WHERE id = ?",
        (&title, &subject_id),
    ) {
        Ok(0) => err(&req.id, "not_found", "subject not found", None),
        Ok(_) => ok(&req.id, json!({ "updated": true })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_subject_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(subject_id) = str_param(req, "subjectId") else {
        return err(&req.id, "bad_params", "missing subjectId", None);
    };

    let report_count: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM report_items WHERE subject_id = ?",
        [&subject_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if report_count > 0 {
        return err(
            &req.id,
            "in_use",
            "subject has submitted reports",
            Some(json!({ "reportCount": report_count })),
        );
    }

    match conn.execute("DELETE FROM subjects WHERE id = ?", [&subject_id]) {
        Ok(0) => err(&req.id, "not_found", "subject not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, None),
    }
}

fn handle_subject_reports(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(subject_id) = str_param(req, "subjectId") else {
        return err(&req.id, "bad_params", "missing subjectId", None);
    };

    let title: Result<Option<String>, _> = conn
        .query_row("SELECT title FROM subjects WHERE id = ?", [&subject_id], |r| {
            r.get(0)
        })
        .optional();
    let title = match title {
        Ok(Some(t)) => t,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT ri.academic_year, ri.term, t.short_name, ri.total,
                ri.got_best, ri.got_good, ri.got_avg, ri.got_bad,
                ri.quality, ri.quantity
         FROM report_items ri
         JOIN teachers t ON t.id = ri.teacher_id
         WHERE ri.subject_id = ?
         ORDER BY ri.academic_year, ri.term, t.short_name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let reports = stmt
        .query_map([&subject_id], |row| {
            Ok(json!({
                "academicYear": row.get::<_, String>(0)?,
                "term": row.get::<_, i64>(1)?,
                "teacherShortName": row.get::<_, Option<String>>(2)?,
                "total": row.get::<_, i64>(3)?,
                "gotBest": row.get::<_, i64>(4)?,
                "gotGood": row.get::<_, i64>(5)?,
                "gotAvg": row.get::<_, i64>(6)?,
                "gotBad": row.get::<_, i64>(7)?,
                "quality": row.get::<_, Option<i64>>(8)?,
                "quantity": row.get::<_, Option<i64>>(9)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match reports {
        Ok(reports) => ok(&req.id, json!({ "title": title, "reports": reports })),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "settings.school.get" => Some(handle_school_get(state, req)),
        "settings.school.set" => Some(handle_school_set(state, req)),
        "settings.regions.list" => Some(handle_regions_list(state, req)),
        "settings.exam_types.list" => Some(handle_exam_types_list(state, req)),
        "settings.exam_types.create" => Some(handle_exam_type_create(state, req)),
        "settings.exam_types.delete" => Some(handle_exam_type_delete(state, req)),
        "settings.subjects.list" => Some(handle_subjects_list(state, req)),
        "settings.subjects.create" => Some(handle_subject_create(state, req)),
        "settings.subjects.update" => Some(handle_subject_update(state, req)),
        "settings.subjects.delete" => Some(handle_subject_delete(state, req)),
        "settings.subjects.reports" => Some(handle_subject_reports(state, req)),
        _ => None,
    }
}
