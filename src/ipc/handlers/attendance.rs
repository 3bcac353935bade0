use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params_from_iter, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

fn get_required_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn handle_attendance_mark(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(name), Some(class), Some(section), Some(roll_number)) = (
        get_required_str(&req.params, "name"),
        get_required_str(&req.params, "class"),
        get_required_str(&req.params, "section"),
        get_required_str(&req.params, "rollNumber"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "name, class, section, and rollNumber are required",
            None,
        );
    };

    let now = Utc::now();
    let day = now.format("%Y-%m-%d").to_string();

    // One entry per student per calendar day.
    let existing: Option<String> = match conn
        .query_row(
            "SELECT id FROM attendance_log
             WHERE class = ? AND section = ? AND roll_number = ? AND day = ?",
            (&class, &section, &roll_number, &day),
            |r| r.get(0),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if existing.is_some() {
        return ok(&req.id, json!({ "marked": false, "alreadyMarked": true }));
    }

    if let Err(e) = conn.execute(
        "INSERT INTO attendance_log(id, name, class, section, roll_number, day, timestamp, status)
         VALUES(?, ?, ?, ?, ?, ?, ?, 'Present')",
        rusqlite::params![
            Uuid::new_v4().to_string(),
            name,
            class,
            section,
            roll_number,
            day,
            now.to_rfc3339()
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "marked": true, "alreadyMarked": false }))
}

fn handle_attendance_summary_today(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    // Distinct students across all terms, not result rows.
    let total_students: i64 = match conn.query_row(
        "SELECT COUNT(DISTINCT class || '\u{1f}' || section || '\u{1f}' || roll_number)
         FROM student_results",
        [],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let day = Utc::now().format("%Y-%m-%d").to_string();
    let present_today: i64 = match conn.query_row(
        "SELECT COUNT(*) FROM attendance_log WHERE day = ? AND status = 'Present'",
        [&day],
        |r| r.get(0),
    ) {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(
        &req.id,
        json!({
            "totalStudents": total_students,
            "presentToday": present_today,
            "absentToday": (total_students - present_today).max(0),
        }),
    )
}

fn handle_attendance_report(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let (Some(start_date), Some(end_date)) = (
        get_required_str(&req.params, "startDate"),
        get_required_str(&req.params, "endDate"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "startDate and endDate are required",
            None,
        );
    };

    let mut clauses = vec!["day >= ?", "day <= ?"];
    let mut binds: Vec<Value> = vec![Value::Text(start_date), Value::Text(end_date)];
    if let Some(class) = get_required_str(&req.params, "class") {
        clauses.push("class = ?");
        binds.push(Value::Text(class));
    }
    if let Some(section) = get_required_str(&req.params, "section") {
        clauses.push("section = ?");
        binds.push(Value::Text(section));
    }

    let sql = format!(
        "SELECT name, class, section, roll_number, day, timestamp, status
         FROM attendance_log
         WHERE {}
         ORDER BY timestamp DESC",
        clauses.join(" AND ")
    );
    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map(params_from_iter(binds), |r| {
            Ok(json!({
                "name": r.get::<_, String>(0)?,
                "class": r.get::<_, String>(1)?,
                "section": r.get::<_, String>(2)?,
                "rollNumber": r.get::<_, String>(3)?,
                "day": r.get::<_, String>(4)?,
                "timestamp": r.get::<_, String>(5)?,
                "status": r.get::<_, String>(6)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "entries": rows }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "attendance.mark" => Some(handle_attendance_mark(state, req)),
        "attendance.summaryToday" => Some(handle_attendance_summary_today(state, req)),
        "attendance.report" => Some(handle_attendance_report(state, req)),
        _ => None,
    }
}
