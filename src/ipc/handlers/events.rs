use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{as_of, date_param, db_err, str_param};
use crate::ipc::types::{AppState, Request};
use crate::period;
use crate::reports;
use rusqlite::OptionalExtension;
use serde_json::json;
use uuid::Uuid;

fn handle_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return ok(&req.id, json!({ "concerts": [], "contests": [] }));
    };
    let academic_year = str_param(req, "academicYear");

    let mut stmt = match conn.prepare(
        "SELECT c.id, c.term, c.academic_year, c.date, c.place, c.title,
                t.short_name, c.has_passed,
                (SELECT COUNT(*) FROM concert_participations p WHERE p.concert_id = c.id)
         FROM concerts c
         JOIN teachers t ON t.id = c.teacher_id
         WHERE ?1 IS NULL OR c.academic_year = ?1
         ORDER BY c.date",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let concerts = stmt
        .query_map([&academic_year], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "term": row.get::<_, i64>(1)?,
                "academicYear": row.get::<_, String>(2)?,
                "date": row.get::<_, String>(3)?,
                "place": row.get::<_, String>(4)?,
                "title": row.get::<_, String>(5)?,
                "teacherShortName": row.get::<_, Option<String>>(6)?,
                "hasPassed": row.get::<_, i64>(7)? != 0,
                "participantCount": row.get::<_, i64>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    let concerts = match concerts {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let mut stmt = match conn.prepare(
        "SELECT c.id, c.term, c.academic_year, c.date, c.place, c.title,
                t.short_name,
                (SELECT COUNT(*) FROM contest_participations p WHERE p.contest_id = c.id)
         FROM contests c
         JOIN teachers t ON t.id = c.teacher_id
         WHERE ?1 IS NULL OR c.academic_year = ?1
         ORDER BY c.date",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let contests = stmt
        .query_map([&academic_year], |row| {
            Ok(json!({
                "id": row.get::<_, String>(0)?,
                "term": row.get::<_, i64>(1)?,
                "academicYear": row.get::<_, String>(2)?,
                "date": row.get::<_, String>(3)?,
                "place": row.get::<_, String>(4)?,
                "title": row.get::<_, String>(5)?,
                "teacherShortName": row.get::<_, Option<String>>(6)?,
                "participantCount": row.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>());
    match contests {
        Ok(contests) => ok(
            &req.id,
            json!({ "concerts": concerts, "contests": contests }),
        ),
        Err(e) => err(&req.id, "db_query_failed", e.to_string(), None),
    }
}

/// Concerts and contests share creation shape; the event's term and academic
/// year come from its own date.
fn handle_event_create(state: &mut AppState, req: &Request, table: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(title), Some(teacher_id)) = (str_param(req, "title"), str_param(req, "teacherId"))
    else {
        return err(&req.id, "bad_params", "title and teacherId are required", None);
    };
    let Some(date) = date_param(req, "date") else {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    };
    let Some(term) = period::term(date) else {
        return err(&req.id, "bad_params", "date falls outside the school year", None);
    };
    let place = str_param(req, "place").unwrap_or_else(|| "ДМШ".to_string());
    let academic_year = period::academic_year(date);

    let event_id = Uuid::new_v4().to_string();
    let result = if table == "concerts" {
        let has_passed = req
            .params
            .get("hasPassed")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        conn.execute(
            "INSERT INTO concerts(id, term, academic_year, date, place, title, teacher_id, has_passed)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &event_id,
                term,
                &academic_year,
                date.format("%Y-%m-%d").to_string(),
                &place,
                &title,
                &teacher_id,
                has_passed as i64,
            ],
        )
    } else {
        conn.execute(
            "INSERT INTO contests(id, term, academic_year, date, place, title, teacher_id)
             VALUES(?, ?, ?, ?, ?, ?, ?)",
            rusqlite::params![
                &event_id,
                term,
                &academic_year,
                date.format("%Y-%m-%d").to_string(),
                &place,
                &title,
                &teacher_id,
            ],
        )
    };
    match result {
        Ok(_) => ok(
            &req.id,
            json!({ "eventId": event_id, "term": term, "academicYear": academic_year }),
        ),
        Err(e) => db_err(&req.id, "db_insert_failed", e, Some(json!({ "table": table }))),
    }
}

fn handle_concert_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(concert_id) = str_param(req, "concertId") else {
        return err(&req.id, "bad_params", "missing concertId", None);
    };
    let (Some(title), Some(teacher_id)) = (str_param(req, "title"), str_param(req, "teacherId"))
    else {
        return err(&req.id, "bad_params", "title and teacherId are required", None);
    };
    let Some(date) = date_param(req, "date") else {
        return err(&req.id, "bad_params", "date must be YYYY-MM-DD", None);
    };
    let Some(term) = period::term(date) else {
        return err(&req.id, "bad_params", "date falls outside the school year", None);
    };
    let place = str_param(req, "place").unwrap_or_else(|| "ДМШ".to_string());

    let updated = conn.execute(
        "UPDATE concerts SET term = ?, academic_year = ?, date = ?, place = ?, title = ?,
             teacher_id = ?
         WHERE id = ?",
        rusqlite::params![
            term,
            period::academic_year(date),
            date.format("%Y-%m-%d").to_string(),
            &place,
            &title,
            &teacher_id,
            &concert_id,
        ],
    );
    match updated {
        Ok(0) => err(&req.id, "not_found", "concert not found", None),
        Ok(_) => ok(&req.id, json!({ "concertId": concert_id })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_concert_complete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(concert_id) = str_param(req, "concertId") else {
        return err(&req.id, "bad_params", "missing concertId", None);
    };
    match conn.execute(
        "UPDATE concerts SET has_passed = 1 WHERE id = ?",
        [&concert_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "concert not found", None),
        Ok(_) => ok(&req.id, json!({ "concertId": concert_id })),
        Err(e) => db_err(&req.id, "db_update_failed", e, None),
    }
}

fn handle_concert_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(concert_id) = str_param(req, "concertId") else {
        return err(&req.id, "bad_params", "missing concertId", None);
    };

    let exists: Result<Option<i64>, _> = conn
        .query_row("SELECT 1 FROM concerts WHERE id = ?", [&concert_id], |r| {
            r.get(0)
        })
        .optional();
    match exists {
        Ok(Some(_)) => {}
        Ok(None) => return err(&req.id, "not_found", "concert not found", None),
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let tx = match conn.unchecked_transaction() {
        Ok(t) => t,
        Err(e) => return err(&req.id, "db_tx_failed", e.to_string(), None),
    };
    if let Err(e) = tx.execute(
        "DELETE FROM concert_participations WHERE concert_id = ?",
        [&concert_id],
    ) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_delete_failed", e, None);
    }
    if let Err(e) = tx.execute("DELETE FROM concerts WHERE id = ?", [&concert_id]) {
        let _ = tx.rollback();
        return db_err(&req.id, "db_delete_failed", e, None);
    }
    if let Err(e) = tx.commit() {
        return err(&req.id, "db_tx_failed", e.to_string(), None);
    }
    ok(&req.id, json!({ "deleted": true }))
}

/// Exactly one of studentId/ensembleId; both or neither get a specific
/// message rather than the raw constraint error.
fn participant_refs(req: &Request) -> Result<(Option<String>, Option<String>), serde_json::Value> {
    let student_id = str_param(req, "studentId");
    let ensemble_id = str_param(req, "ensembleId");
    match (&student_id, &ensemble_id) {
        (None, None) => Err(err(
            &req.id,
            "bad_params",
            "either a student or an ensemble must be named",
            None,
        )),
        (Some(_), Some(_)) => Err(err(
            &req.id,
            "bad_params",
            "a participation names a student or an ensemble, not both",
            None,
        )),
        _ => Ok((student_id, ensemble_id)),
    }
}

fn handle_concert_participant_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(concert_id) = str_param(req, "concertId") else {
        return err(&req.id, "bad_params", "missing concertId", None);
    };
    let (student_id, ensemble_id) = match participant_refs(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };

    let participation_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO concert_participations(id, concert_id, student_id, ensemble_id)
         VALUES(?, ?, ?, ?)",
        (&participation_id, &concert_id, &student_id, &ensemble_id),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "concert_participations" })),
        );
    }
    ok(&req.id, json!({ "participationId": participation_id }))
}

fn handle_concert_participant_remove(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(participation_id) = str_param(req, "participationId") else {
        return err(&req.id, "bad_params", "missing participationId", None);
    };
    match conn.execute(
        "DELETE FROM concert_participations WHERE id = ?",
        [&participation_id],
    ) {
        Ok(0) => err(&req.id, "not_found", "participation not found", None),
        Ok(_) => ok(&req.id, json!({ "deleted": true })),
        Err(e) => db_err(&req.id, "db_delete_failed", e, None),
    }
}

fn handle_contest_participant_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(contest_id) = str_param(req, "contestId") else {
        return err(&req.id, "bad_params", "missing contestId", None);
    };
    let (student_id, ensemble_id) = match participant_refs(req) {
        Ok(v) => v,
        Err(resp) => return resp,
    };
    let result = str_param(req, "result").unwrap_or_else(|| "участник".to_string());

    let participation_id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO contest_participations(id, contest_id, student_id, ensemble_id, result)
         VALUES(?, ?, ?, ?, ?)",
        (
            &participation_id,
            &contest_id,
            &student_id,
            &ensemble_id,
            &result,
        ),
    ) {
        return db_err(
            &req.id,
            "db_insert_failed",
            e,
            Some(json!({ "table": "contest_participations" })),
        );
    }
    ok(&req.id, json!({ "participationId": participation_id }))
}

fn handle_plan_doc(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(out_path) = str_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };
    let academic_year =
        str_param(req, "academicYear").unwrap_or_else(|| period::academic_year(as_of(req)));

    let doc = match reports::events_plan(conn, &academic_year) {
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
                "filename": format!("План_мероприятий_{}.docx", academic_year),
            }),
        ),
        Err(e) => err(&req.id, "doc_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "events.list" => Some(handle_list(state, req)),
        "concerts.create" => Some(handle_event_create(state, req, "concerts")),
        "concerts.update" => Some(handle_concert_update(state, req)),
        "concerts.complete" => Some(handle_concert_complete(state, req)),
        "concerts.delete" => Some(handle_concert_delete(state, req)),
        "concerts.participant.add" => Some(handle_concert_participant_add(state, req)),
        "concerts.participant.remove" => Some(handle_concert_participant_remove(state, req)),
        "contests.create" => Some(handle_event_create(state, req, "contests")),
        "contests.participant.add" => Some(handle_contest_participant_add(state, req)),
        "events.plan.doc" => Some(handle_plan_doc(state, req)),
        _ => None,
    }
}
