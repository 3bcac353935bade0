use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use sha2::{Digest, Sha256};
use uuid::Uuid;

fn password_digest(password: &str) -> String {
    format!("{:x}", Sha256::digest(password.as_bytes()))
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// One teacher per (class, section); `exclude` skips the teacher being
/// updated so a no-op move does not collide with itself.
fn class_section_taken(
    conn: &Connection,
    class: &str,
    section: &str,
    exclude: Option<i64>,
) -> rusqlite::Result<bool> {
    let taken: Option<i64> = match exclude {
        Some(teacher_id) => conn
            .query_row(
                "SELECT teacher_id FROM teachers
                 WHERE class = ? AND section = ? AND teacher_id != ?",
                rusqlite::params![class, section, teacher_id],
                |r| r.get(0),
            )
            .optional()?,
        None => conn
            .query_row(
                "SELECT teacher_id FROM teachers WHERE class = ? AND section = ?",
                (class, section),
                |r| r.get(0),
            )
            .optional()?,
    };
    Ok(taken.is_some())
}

fn handle_teachers_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(name), Some(class), Some(section), Some(password)) = (
        get_required_str(&req.params, "name"),
        get_required_str(&req.params, "class"),
        get_required_str(&req.params, "section"),
        get_required_str(&req.params, "password"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "name, class, section, and password are required",
            None,
        );
    };

    match class_section_taken(conn, &class, &section, None) {
        Ok(true) => {
            return err(
                &req.id,
                "conflict",
                "a teacher already exists for this class and section",
                None,
            )
        }
        Ok(false) => {}
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    }

    let next_id: i64 = match conn.query_row(
        "SELECT COALESCE(MAX(teacher_id), 0) + 1 FROM teachers",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if let Err(e) = conn.execute(
        "INSERT INTO teachers(id, teacher_id, name, class, section, password_digest)
         VALUES(?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            next_id,
            name,
            class,
            section,
            password_digest(&password)
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "id": next_id }))
}

fn handle_teachers_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT teacher_id, name, class, section FROM teachers ORDER BY teacher_id",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "name": r.get::<_, String>(1)?,
                "class": r.get::<_, String>(2)?,
                "section": r.get::<_, String>(3)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "teachers": rows }))
}

fn handle_teachers_update(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(teacher_id) = req.params.get("id").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing id", None);
    };

    let existing: Option<(String, String, String)> = match conn
        .query_row(
            "SELECT name, class, section FROM teachers WHERE teacher_id = ?",
            [teacher_id],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let Some((current_name, current_class, current_section)) = existing else {
        return err(&req.id, "not_found", "teacher not found", None);
    };

    let name = get_required_str(&req.params, "name").unwrap_or(current_name);
    let class = get_required_str(&req.params, "class").unwrap_or(current_class.clone());
    let section = get_required_str(&req.params, "section").unwrap_or(current_section.clone());

    if class != current_class || section != current_section {
        match class_section_taken(conn, &class, &section, Some(teacher_id)) {
            Ok(true) => {
                return err(
                    &req.id,
                    "conflict",
                    "a teacher already exists for this class and section",
                    None,
                )
            }
            Ok(false) => {}
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        }
    }

    if let Err(e) = conn.execute(
        "UPDATE teachers SET name = ?, class = ?, section = ? WHERE teacher_id = ?",
        rusqlite::params![name, class, section, teacher_id],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    if let Some(password) = get_required_str(&req.params, "password") {
        if let Err(e) = conn.execute(
            "UPDATE teachers SET password_digest = ? WHERE teacher_id = ?",
            rusqlite::params![password_digest(&password), teacher_id],
        ) {
            return err(&req.id, "db_insert_failed", e.to_string(), None);
        }
    }

    ok(&req.id, json!({ "ok": true }))
}

fn handle_teachers_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(teacher_id) = req.params.get("id").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing id", None);
    };

    let deleted = match conn.execute(
        "DELETE FROM teachers WHERE teacher_id = ?",
        [teacher_id],
    ) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    if deleted == 0 {
        return err(&req.id, "not_found", "teacher not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_teachers_login(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(name), Some(class), Some(section), Some(password)) = (
        get_required_str(&req.params, "name"),
        get_required_str(&req.params, "class"),
        get_required_str(&req.params, "section"),
        get_required_str(&req.params, "password"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "name, class, section, and password are required",
            None,
        );
    };

    let row: Option<(i64, String)> = match conn
        .query_row(
            "SELECT teacher_id, password_digest FROM teachers
             WHERE name = ? AND class = ? AND section = ?",
            (&name, &class, &section),
            |r| Ok((r.get(0)?, r.get(1)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    match row {
        Some((teacher_id, digest)) if digest == password_digest(&password) => ok(
            &req.id,
            json!({
                "teacher": {
                    "id": teacher_id,
                    "name": name,
                    "class": class,
                    "section": section,
                }
            }),
        ),
        _ => err(
            &req.id,
            "unauthorized",
            "invalid credentials or teacher not found",
            None,
        ),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "teachers.add" => Some(handle_teachers_add(state, req)),
        "teachers.list" => Some(handle_teachers_list(state, req)),
        "teachers.update" => Some(handle_teachers_update(state, req)),
        "teachers.delete" => Some(handle_teachers_delete(state, req)),
        "teachers.login" => Some(handle_teachers_login(state, req)),
        _ => None,
    }
}
