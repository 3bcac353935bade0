use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

#[derive(Debug, Clone)]
struct SubjectKey {
    class: String,
    section: String,
    term: String,
    name: String,
}

fn parse_subject_key(params: &serde_json::Value) -> Result<SubjectKey, HandlerErr> {
    let get = |key: &str| -> Result<String, HandlerErr> {
        params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr {
                code: "bad_params",
                message: format!("missing {}", key),
                details: None,
            })
    };
    Ok(SubjectKey {
        class: get("class")?,
        section: get("section")?,
        term: get("term")?,
        name: get("name")?,
    })
}

fn find_subject_id(conn: &Connection, key: &SubjectKey) -> Result<Option<String>, HandlerErr> {
    conn.query_row(
        "SELECT id FROM subjects WHERE class = ? AND section = ? AND term = ? AND name = ?",
        (&key.class, &key.section, &key.term, &key.name),
        |r| r.get(0),
    )
    .optional()
    .map_err(|e| HandlerErr {
        code: "db_query_failed",
        message: e.to_string(),
        details: None,
    })
}

fn handle_subjects_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT class, section, term, name, full_marks, passing_marks
         FROM subjects
         ORDER BY class, section, term, name",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([], |r| {
            Ok(json!({
                "class": r.get::<_, String>(0)?,
                "section": r.get::<_, String>(1)?,
                "term": r.get::<_, String>(2)?,
                "name": r.get::<_, String>(3)?,
                "fullMarks": r.get::<_, f64>(4)?,
                "passingMarks": r.get::<_, Option<f64>>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "subjects": rows }))
}

fn handle_subjects_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let key = match parse_subject_key(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(full_marks) = req.params.get("fullMarks").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing fullMarks", None);
    };
    let Some(passing_marks) = req.params.get("passingMarks").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing passingMarks", None);
    };

    match find_subject_id(conn, &key) {
        Ok(Some(_)) => {
            return err(
                &req.id,
                "conflict",
                "subject already exists for this class/section/term",
                None,
            )
        }
        Ok(None) => {}
        Err(e) => return e.response(&req.id),
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO subjects(id, class, section, term, name, full_marks, passing_marks)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            key.class,
            key.section,
            key.term,
            key.name,
            full_marks,
            passing_marks
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(original) = req.params.get("original") else {
        return err(&req.id, "bad_params", "missing original", None);
    };
    let Some(updated) = req.params.get("updated") else {
        return err(&req.id, "bad_params", "missing updated", None);
    };

    let original_key = match parse_subject_key(original) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let updated_key = match parse_subject_key(updated) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(full_marks) = updated.get("fullMarks").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing updated.fullMarks", None);
    };
    let passing_marks = updated.get("passingMarks").and_then(|v| v.as_f64());

    let subject_id = match find_subject_id(conn, &original_key) {
        Ok(Some(id)) => id,
        Ok(None) => return err(&req.id, "not_found", "subject not found", None),
        Err(e) => return e.response(&req.id),
    };

    match find_subject_id(conn, &updated_key) {
        Ok(Some(other)) if other != subject_id => {
            return err(
                &req.id,
                "conflict",
                "another subject already uses the updated key",
                None,
            )
        }
        Ok(_) => {}
        Err(e) => return e.response(&req.id),
    }

    if let Err(e) = conn.execute(
        "UPDATE subjects
         SET class = ?, section = ?, term = ?, name = ?, full_marks = ?, passing_marks = ?
         WHERE id = ?",
        rusqlite::params![
            updated_key.class,
            updated_key.section,
            updated_key.term,
            updated_key.name,
            full_marks,
            passing_marks,
            subject_id
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_subjects_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let key = match parse_subject_key(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let deleted = match conn.execute(
        "DELETE FROM subjects WHERE class = ? AND section = ? AND term = ? AND name = ?",
        (&key.class, &key.section, &key.term, &key.name),
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if deleted == 0 {
        return err(&req.id, "not_found", "subject not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "subjects.list" => Some(handle_subjects_list(state, req)),
        "subjects.add" => Some(handle_subjects_add(state, req)),
        "subjects.update" => Some(handle_subjects_update(state, req)),
        "subjects.delete" => Some(handle_subjects_delete(state, req)),
        _ => None,
    }
}
