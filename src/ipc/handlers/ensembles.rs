use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{db_err, str_param};
use crate::ipc::types::{AppState, Request};
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "ensembles": [] }));
    };

    let mut stmt = match conn.prepare(
        "SELECT e.id, e.name, t.short_name
         FROM ensembles e
         JOIN teachers t ON t.id = e.teacher_id
         ORDER BY e.name",
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
            ))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let rows = match rows {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut ensembles = Vec::new();
    for (id, name, leader) in rows {
        let mut stmt = match conn.prepare(
            "SELECT s.id, s.short_name, s.class_level, s.study_years
             FROM ensemble_members m
             JOIN students s ON s.id = m.student_id
             WHERE m.ensemble_id = ?
             ORDER BY s.class_level, s.full_name",
        ) {
            Ok(s) => s,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        let members = stmt
            .query_map([&id], |row| {
                Ok(json!({
                    "studentId": row.get::<_, String>(0)?,
                    "shortName": row.get::<_, Option<String>>(1)?,
                    "classLevel": row.get::<_, i64>(2)?,
                    "studyYears": row.get::<_, i64>(3)?,
                }))
            })
            .and_then(|it| it.collect::<Result<Vec<_>, _>>());
        let members = match members {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        ensembles.push(json!({
            "id": id,
            "name": name,
            "leaderShortName": leader,
            "members": members,
        }));
    }
    ok(&req.id, json!({ "ensembles": ensembles }))
}

fn handle_create(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(name), Some(teacher_id)) = (str_param(req, "name"), str_param(req, "teacherId"))
    else {
        return err(&req.id, "bad_params", "name and teacherId are required", None);
    };

    let ensemble_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO ensembles(id, name, teacher_id) VALUES(?, ?, ?)",
        (&ensemble_id, &name, &teacher_id),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "ensembles" })),
        );
    }
    ok(&req.id, json!({ "ensembleId": ensemble_id }))
}

fn handle_member_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(ensemble_id), Some(student_id)) =
        (str_param(req, "ensembleId"), str_param(req, "studentId"))
    else {
        return err(
            &req.id,
            "bad_params",
            "ensembleId and studentId are required",
            None,
        );
    };

    if let Err(e) = conn.execute(
        "INSERT INTO ensemble_members(ensemble_id, student_id) VALUES(?, ?)",
        (&ensemble_id, &student_id),
    ) {
        // Composite PK collision means the student is already a member.
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "ensemble_members" })),
        );
    }
    ok(&req.id, json!({ "added": true }))
}

fn handle_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(ensemble_id) = str_param(req, "ensembleId") else {
        return err(&req.id, "bad_params", "missing ensembleId", None);
    };

    let exists: Result<Option<i64>, _> = conn
        .query_row("SELECT 1 FROM ensembles WHERE id = ?", [&ensemble_id], |r| {
            r.get(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "ensemble not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let participations: i64 = match conn.query_row(
        "SELECT
           (SELECT COUNT(*) FROM concert_participations WHERE ensemble_id = ?1)
         + (SELECT COUNT(*) FROM contest_participations WHERE ensemble_id = ?1)",
        [&ensemble_id],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if participations > 0 {
        return err(
            &req.id,
            "in_use",
            "ensemble has recorded performances",
            Some(json!({ "participationCount": participations })),
        );
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM ensemble_members WHERE ensemble_id = ?",
        [&ensemble_id],
    ) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_delete_failed", e, None);
    }
    if let Err(e) = tx.execute("DELETE FROM ensembles WHERE id = ?", [&ensemble_id]) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_delete_failed", e, None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deleted": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "ensembles.list" => Some(handle_list(state, req)),
        "ensembles.create" => Some(handle_create(state, req)),
        "ensembles.member.add" => Some(handle_member_add(state, req)),
        "ensembles.delete" => Some(handle_delete(state, req)),
        _ => None,
    }
}
