use crate::ipc::error::{err, ok};
use crate::ipc::helpers::{as_of, str_param};
use crate::ipc::types::{AppState, Request};
use crate::reports;
use crate::tags;
use serde_json::json;

// Template text is taken verbatim, untrimmed, so indentation written into
// the template survives into the rendered document.
fn text_param(req: &Request) -> Option<String> {
    req.params
        .get("text")
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

fn handle_render(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(text) = text_param(req) else {
        return err(&req.id, "bad_params", "missing text", None);
    };

    match tags::expand(conn, &text, as_of(req)) {
        Ok(paragraphs) => ok(&req.id, json!({ "fragments": tags::to_html(&paragraphs) })),
        Err(e) => err(&req.id, "db_query_failed", format!("{e:?}"), None),
    }
}

fn handle_render_doc(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(text) = text_param(req) else {
        return err(&req.id, "bad_params", "missing text", None);
    };
    let Some(out_path) = str_param(req, "outPath") else {
        return err(&req.id, "bad_params", "missing outPath", None);
    };

    let doc = match reports::template_document(conn, &text, as_of(req)) {
        Ok(d) => d,
        Err(e) => return err(&req.id, "db_query_failed", format!("{e:?}"), None),
    };
    match doc.build().and_then(|bytes| {
        std::fs::write(&out_path, bytes)?;
        Ok(())
    }) {
        Ok(()) => ok(&req.id, json!({ "outPath": out_path })),
        Err(e) => err(&req.id, "doc_failed", format!("{e:?}"), None),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "reports.render" => Some(handle_render(state, req)),
        "reports.render.doc" => Some(handle_render_doc(state, req)),
        _ => None,
    }
}
