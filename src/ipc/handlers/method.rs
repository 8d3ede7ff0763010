use crate::db;
use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{as_of, date_param, db_err, str_param};
use crate::ipc::types::{AppState, Request};
use crate::period;
use rusqlite::OptionalExtension;
use serde_json::json;
use std::path::Path;
use uuid::Uuid;

fn handle_assemblies_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "assemblies": [] }));
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));

    let mut stmt = match conn.prepare(
        "SELECT a.id, a.term, a.date, a.title, a.description, t.short_name
         FROM method_assemblies a
         JOIN teachers t ON t.id = a.teacher_id
         WHERE a.academic_year = ?
         ORDER BY a.date",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let assemblies = stmt
        .query_map([&academic_year], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "term": row.get::<_, i64>(1)?,
                "date": row.get::<_, String>(2)?,
                "title": row.get::<_, String>(3)?,
                "description": row.get::<_, String>(4)?,
                "teacherShortName": row.get::<_, Option<String>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match assemblies {
        Ok(assemblies) => ok(
            &req.id,
            json!({ "assemblies": assemblies, "academicYear": academic_year }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_assembly_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(title), Some(description), Some(teacher_id)) = (
        str_param(req, "title"),
        str_param(req, "description"),
        str_param(req, "teacherId"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "title, description and teacherId are required",
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

    let assembly_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO method_assemblies(id, term, academic_year, date, title, description, teacher_id)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &assembly_id,
            term,
            &academic_year,
            date.format("%Y-%m-%d").to_string(),
            &title,
            &description,
            &teacher_id,
        ],
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "method_assemblies" })),
        );
    }
    ok(
        &req.id,
        json!({ "assemblyId": assembly_id, "term": term, "academicYear": academic_year }),
    )
}

fn handle_protocols_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "protocols": [] }));
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));

    let mut stmt = match conn.prepare(
        "SELECT p.id, p.term, p.date, p.attendees, p.number, t.short_name,
                p.agenda, p.decisions, p.protocol_file
         FROM method_assembly_protocols p
         JOIN teachers t ON t.id = p.secretary_id
         WHERE p.academic_year = ?
         ORDER BY p.number",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let protocols = stmt
        .query_map([&academic_year], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "term": row.get::<_, i64>(1)?,
                "date": row.get::<_, String>(2)?,
                "attendees": row.get::<_, String>(3)?,
                "number": row.get::<_, i64>(4)?,
                "secretaryShortName": row.get::<_, Option<String>>(5)?,
                "agenda": row.get::<_, String>(6)?,
                "decisions": row.get::<_, String>(7)?,
                "protocolFile": row.get::<_, Option<String>>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match protocols {
        Ok(protocols) => ok(
            &req.id,
            json!({ "protocols": protocols, "academicYear": academic_year }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

fn handle_protocol_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(attendees), Some(secretary_id), Some(agenda), Some(decisions)) = (
        str_param(req, "attendees"),
        str_param(req, "secretaryId"),
        str_param(req, "agenda"),
        str_param(req, "decisions"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "attendees, secretaryId, agenda and decisions are required",
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

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    // Protocol numbering restarts each academic year.
    let number: i64 = match tx.query_row(
        "SELECT COALESCE(MAX(number), 0) + 1 FROM method_assembly_protocols
         WHERE academic_year = ?",
        [&academic_year],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    // Attachments are copied into the workspace under a deterministic name so
    // the row can always find its file.
    let protocol_file = match str_param(req, "attachmentPath") {
        Some(src) => {
            let src = Path::new(&src);
            let ext = src
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("pdf")
                .to_string();
            let name = format!("protocol-{}-{}.{}", academic_year, number, ext);
            let dst = db::protocols_dir(&workspace).join(&name);
            if let Err(e) = std::fs::copy(src, &dst) {
                return err(
                    &req.id,
                    "bad_params",
                    format!("cannot copy attachment: {}", e),
                    None,
                );
            }
            Some(name)
        }
        None => None,
    };

    let protocol_id = Uuid::new_v4().to_string();
    if let Err(e) = tx.execute(
        "INSERT INTO method_assembly_protocols(
             id, term, academic_year, date, attendees, number, secretary_id,
             agenda, decisions, protocol_file)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            &protocol_id,
            term,
            &academic_year,
            date.format("%Y-%m-%d").to_string(),
            &attendees,
            number,
            &secretary_id,
            &agenda,
            &decisions,
            &protocol_file,
        ],
    ) {
        let _ = tx.rollback();
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "method_assembly_protocols" })),
        );
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(
        &req.id,
        json!({
            "protocolId": protocol_id,
            "number": number,
            "academicYear": academic_year,
            "protocolFile": protocol_file,
        }),
    )
}

fn handle_protocol_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(workspace) = state.workspace.clone() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(protocol_id) = str_param(req, "protocolId") else {
        return err(&req.id, "bad_params", "missing protocolId", None);
    };

    let protocol_file: Result<Option<Option<String>>, _> = conn
        .query_row(
            "SELECT protocol_file FROM method_assembly_protocols WHERE id = ?",
            [&protocol_id],
            |r| r.get(0),
        )
        .optional();
    let protocol_file = match protocol_file {
        Ok(Some(v)) => v,
        Ok(None) => return err(&req.id, "not_found", "protocol not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Some(name) = &protocol_file {
        let path = db::protocols_dir(&workspace).join(name);
        if path.is_file() {
            if let Err(e) = std::fs::remove_file(&path) {
                return err(
                    &req.id,
                    "doc_failed",
                    format!("cannot remove attachment: {}", e),
                    None,
                );
            }
        }
    }

    match conn.execute(
        "DELETE FROM method_assembly_protocols WHERE id = ?",
        [&protocol_id],
    ) {
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "method.assemblies.list" => Some(handle_assemblies_list(state, req)),
        "method.assembly.create" => Some(handle_assembly_create(state, req)),
        "method.protocols.list" => Some(handle_protocols_list(state, req)),
        "method.protocol.create" => Some(handle_protocol_create(state, req)),
        "method.protocol.delete" => Some(handle_protocol_delete(state, req)),
        _ => None,
    }
}
