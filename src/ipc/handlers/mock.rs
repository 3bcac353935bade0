use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

const DEFAULT_DURATION_MINUTES: i64 = 5;
const DEFAULT_CORRECT_MARK: f64 = 3.0;
const DEFAULT_INCORRECT_MARK: f64 = -1.0;
/// Repeat submissions from the same student inside this window are
/// acknowledged but not stored again.
const DUPLICATE_RESULT_WINDOW_SECS: i64 = 60;

struct HandlerErr {
    code: &'static str,
    message: String,
    details: Option<serde_json::Value>,
}

impl HandlerErr {
    fn bad_params(message: impl Into<String>) -> Self {
        Self {
            code: "bad_params",
            message: message.into(),
            details: None,
        }
    }

    fn db(e: impl std::fmt::Display) -> Self {
        Self {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        }
    }

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

struct QuestionInput {
    class: String,
    section: String,
    subject: String,
    chapter: String,
    question: serde_json::Value,
    options: serde_json::Value,
    correct_answer: i64,
}

fn parse_question(entry: &serde_json::Value) -> Result<QuestionInput, HandlerErr> {
    let get = |key: &str| -> Result<String, HandlerErr> {
        entry
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
    };

    let question = entry
        .get("question")
        .cloned()
        .filter(|v| !v.is_null())
        .ok_or_else(|| HandlerErr::bad_params("missing question"))?;
    let options = entry
        .get("options")
        .cloned()
        .filter(|v| v.as_array().map(|a| !a.is_empty()).unwrap_or(false))
        .ok_or_else(|| HandlerErr::bad_params("options must be a non-empty array"))?;
    let option_count = options.as_array().map(|a| a.len()).unwrap_or(0) as i64;
    let correct_answer = entry
        .get("correctAnswer")
        .and_then(|v| v.as_i64())
        .ok_or_else(|| HandlerErr::bad_params("missing correctAnswer"))?;
    if correct_answer < 0 || correct_answer >= option_count {
        return Err(HandlerErr::bad_params(
            "correctAnswer must index into options",
        ));
    }

    Ok(QuestionInput {
        class: get("class")?,
        section: get("section")?,
        subject: get("subject")?,
        chapter: get("chapter")?,
        question,
        options,
        correct_answer,
    })
}

/// The practice bank and the board-competitive (BCST) bank share one shape
/// and live in parallel tables.
const MOCK_BANK: &str = "mock_questions";
const BCST_BANK: &str = "bcst_questions";

fn next_question_id(conn: &Connection, table: &str) -> Result<i64, HandlerErr> {
    conn.query_row(
        &format!("SELECT COALESCE(MAX(id), 0) + 1 FROM {}", table),
        [],
        |r| r.get(0),
    )
    .map_err(HandlerErr::db)
}

fn insert_question(
    conn: &Connection,
    table: &str,
    id: i64,
    q: &QuestionInput,
) -> Result<(), HandlerErr> {
    conn.execute(
        &format!(
            "INSERT INTO {}(id, class, section, subject, chapter, question, options, correct_answer)
             VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
            table
        ),
        rusqlite::params![
            id,
            q.class,
            q.section,
            q.subject,
            q.chapter,
            q.question.to_string(),
            q.options.to_string(),
            q.correct_answer
        ],
    )
    .map_err(|e| HandlerErr {
        code: "db_insert_failed",
        message: e.to_string(),
        details: None,
    })?;
    Ok(())
}

fn parse_json_column(raw: String) -> serde_json::Value {
    serde_json::from_str(&raw).unwrap_or(serde_json::Value::Null)
}

fn handle_questions_list(state: &mut AppState, req: &Request, table: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(&format!(
        "SELECT id, class, section, subject, chapter, question, options, correct_answer
         FROM {} ORDER BY id",
        table
    )) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, i64>(0)?,
                "class": r.get::<_, String>(1)?,
                "section": r.get::<_, String>(2)?,
                "subject": r.get::<_, String>(3)?,
                "chapter": r.get::<_, String>(4)?,
                "question": parse_json_column(r.get::<_, String>(5)?),
                "options": parse_json_column(r.get::<_, String>(6)?),
                "correctAnswer": r.get::<_, i64>(7)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "questions": rows }))
}

fn handle_questions_add(state: &mut AppState, req: &Request, table: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let q = match parse_question(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let id = match next_question_id(conn, table) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Err(e) = insert_question(conn, table, id, &q) {
        return e.response(&req.id);
    }
    ok(&req.id, json!({ "id": id }))
}

fn handle_questions_bulk_add(state: &mut AppState, req: &Request, table: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(entries) = req.params.get("questions").and_then(|v| v.as_array()) else {
        return err(
            &req.id,
            "bad_params",
            "questions must be a non-empty array",
            None,
        );
    };
    if entries.is_empty() {
        return err(
            &req.id,
            "bad_params",
            "questions must be a non-empty array",
            None,
        );
    }

    let mut parsed = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        match parse_question(entry) {
            Ok(q) => parsed.push(q),
            Err(e) => {
                return err(
                    &req.id,
                    "bad_params",
                    format!("question at index {}: {}", i, e.message),
                    None,
                )
            }
        }
    }

    let mut id = match next_question_id(conn, table) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let mut ids = Vec::with_capacity(parsed.len());
    for q in &parsed {
        if let Err(e) = insert_question(conn, table, id, q) {
            return e.response(&req.id);
        }
        ids.push(id);
        id += 1;
    }

    ok(&req.id, json!({ "added": ids.len(), "ids": ids }))
}

fn handle_questions_delete(state: &mut AppState, req: &Request, table: &str) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(id) = req.params.get("id").and_then(|v| v.as_i64()) else {
        return err(&req.id, "bad_params", "missing id", None);
    };

    let deleted = match conn.execute(&format!("DELETE FROM {} WHERE id = ?", table), [id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "question not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_settings_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let row: Option<(i64, f64, f64)> = match conn
        .query_row(
            "SELECT duration, correct_mark, incorrect_mark FROM mock_settings WHERE singleton = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    let (duration, correct_mark, incorrect_mark) = match row {
        Some(v) => v,
        None => {
            // Bootstrap the singleton on first read.
            if let Err(e) = conn.execute(
                "INSERT INTO mock_settings(singleton, duration, correct_mark, incorrect_mark)
                 VALUES(1, ?, ?, ?)",
                rusqlite::params![
                    DEFAULT_DURATION_MINUTES,
                    DEFAULT_CORRECT_MARK,
                    DEFAULT_INCORRECT_MARK
                ],
            ) {
                return err(&req.id, "db_insert_failed", e.to_string(), None);
            }
            (
                DEFAULT_DURATION_MINUTES,
                DEFAULT_CORRECT_MARK,
                DEFAULT_INCORRECT_MARK,
            )
        }
    };

    ok(
        &req.id,
        json!({
            "duration": duration,
            "correctMark": correct_mark,
            "incorrectMark": incorrect_mark,
        }),
    )
}

fn handle_settings_set(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let current: Option<(i64, f64, f64)> = match conn
        .query_row(
            "SELECT duration, correct_mark, incorrect_mark FROM mock_settings WHERE singleton = 1",
            [],
            |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)),
        )
        .optional()
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let (cur_duration, cur_correct, cur_incorrect) = current.unwrap_or((
        DEFAULT_DURATION_MINUTES,
        DEFAULT_CORRECT_MARK,
        DEFAULT_INCORRECT_MARK,
    ));

    let duration = req
        .params
        .get("duration")
        .and_then(|v| v.as_i64())
        .unwrap_or(cur_duration);
    let correct_mark = req
        .params
        .get("correctMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(cur_correct);
    let incorrect_mark = req
        .params
        .get("incorrectMark")
        .and_then(|v| v.as_f64())
        .unwrap_or(cur_incorrect);

    if duration <= 0 {
        return err(&req.id, "bad_params", "duration must be positive", None);
    }

    if let Err(e) = conn.execute(
        "INSERT INTO mock_settings(singleton, duration, correct_mark, incorrect_mark)
         VALUES(1, ?1, ?2, ?3)
         ON CONFLICT(singleton) DO UPDATE SET
            duration = ?1, correct_mark = ?2, incorrect_mark = ?3",
        rusqlite::params![duration, correct_mark, incorrect_mark],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(
        &req.id,
        json!({
            "duration": duration,
            "correctMark": correct_mark,
            "incorrectMark": incorrect_mark,
        }),
    )
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, student_details, answers, score, questions, timestamp
         FROM mock_results ORDER BY timestamp DESC",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "studentDetails": parse_json_column(r.get::<_, String>(1)?),
                "answers": parse_json_column(r.get::<_, String>(2)?),
                "score": parse_json_column(r.get::<_, String>(3)?),
                "questions": parse_json_column(r.get::<_, String>(4)?),
                "timestamp": r.get::<_, String>(5)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "results": rows }))
}

fn handle_results_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(student_details) = req.params.get("studentDetails").filter(|v| !v.is_null()) else {
        return err(&req.id, "bad_params", "missing studentDetails", None);
    };
    let Some(answers) = req.params.get("answers").filter(|v| v.is_array()) else {
        return err(&req.id, "bad_params", "missing answers", None);
    };
    let Some(score) = req.params.get("score").filter(|v| !v.is_null()) else {
        return err(&req.id, "bad_params", "missing score", None);
    };
    let Some(questions) = req.params.get("questions").filter(|v| v.is_array()) else {
        return err(&req.id, "bad_params", "missing questions", None);
    };

    let now = Utc::now();
    let student_ref = student_details.get("id").map(|v| match v.as_str() {
        Some(s) => s.to_string(),
        None => v.to_string(),
    });

    if let Some(student_ref) = &student_ref {
        let latest: Option<String> = match conn
            .query_row(
                "SELECT timestamp FROM mock_results
                 WHERE student_ref = ? ORDER BY timestamp DESC LIMIT 1",
                [student_ref],
                |r| r.get(0),
            )
            .optional()
        {
            Ok(v) => v,
            Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
        };
        if let Some(ts) = latest.and_then(|t| DateTime::parse_from_rfc3339(&t).ok()) {
            let age = now.signed_duration_since(ts.with_timezone(&Utc));
            if age.num_seconds() < DUPLICATE_RESULT_WINDOW_SECS {
                return ok(&req.id, json!({ "duplicate": true }));
            }
        }
    }

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO mock_results(id, student_ref, student_details, answers, score, questions, timestamp)
         VALUES(?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            student_ref,
            student_details.to_string(),
            answers.to_string(),
            score.to_string(),
            questions.to_string(),
            now.to_rfc3339()
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "id": id, "duplicate": false }))
}

fn handle_notices_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let mut stmt = match conn.prepare(
        "SELECT id, class_name, section, subject, chapter, date, time, instructions, timestamp
         FROM mock_notices ORDER BY date, time",
    ) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let rows = match stmt
        .query_map([], |r| {
            Ok(json!({
                "id": r.get::<_, String>(0)?,
                "className": r.get::<_, String>(1)?,
                "section": r.get::<_, String>(2)?,
                "subject": r.get::<_, String>(3)?,
                "chapter": r.get::<_, String>(4)?,
                "date": r.get::<_, String>(5)?,
                "time": r.get::<_, String>(6)?,
                "instructions": r.get::<_, Option<String>>(7)?,
                "timestamp": r.get::<_, String>(8)?,
            }))
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };

    ok(&req.id, json!({ "notices": rows }))
}

fn handle_notices_add(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let get = |key: &str| {
        req.params
            .get(key)
            .and_then(|v| v.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
    };
    let (Some(class_name), Some(section), Some(subject), Some(chapter), Some(date), Some(time)) = (
        get("className"),
        get("section"),
        get("subject"),
        get("chapter"),
        get("date"),
        get("time"),
    ) else {
        return err(
            &req.id,
            "bad_params",
            "className, section, subject, chapter, date, and time are required",
            None,
        );
    };

    let id = Uuid::new_v4().to_string();
    if let Err(e) = conn.execute(
        "INSERT INTO mock_notices(id, class_name, section, subject, chapter, date, time, instructions, timestamp)
         VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?)",
        rusqlite::params![
            id,
            class_name,
            section,
            subject,
            chapter,
            date,
            time,
            get("instructions"),
            Utc::now().to_rfc3339()
        ],
    ) {
        return err(&req.id, "db_insert_failed", e.to_string(), None);
    }

    ok(&req.id, json!({ "id": id }))
}

fn handle_notices_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let Some(id) = req.params.get("id").and_then(|v| v.as_str()) else {
        return err(&req.id, "bad_params", "missing id", None);
    };

    let deleted = match conn.execute("DELETE FROM mock_notices WHERE id = ?", [id]) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    if deleted == 0 {
        return err(&req.id, "not_found", "notice not found", None);
    }
    ok(&req.id, json!({ "ok": true }))
}

fn handle_notices_clear(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let cleared = match conn.execute("DELETE FROM mock_notices", []) {
        Ok(n) => n,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    ok(&req.id, json!({ "cleared": cleared }))
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "mock.questions.list" => Some(handle_questions_list(state, req, MOCK_BANK)),
        "mock.questions.add" => Some(handle_questions_add(state, req, MOCK_BANK)),
        "mock.questions.bulkAdd" => Some(handle_questions_bulk_add(state, req, MOCK_BANK)),
        "mock.questions.delete" => Some(handle_questions_delete(state, req, MOCK_BANK)),
        "mock.bcstQuestions.list" => Some(handle_questions_list(state, req, BCST_BANK)),
        "mock.bcstQuestions.bulkAdd" => Some(handle_questions_bulk_add(state, req, BCST_BANK)),
        "mock.bcstQuestions.delete" => Some(handle_questions_delete(state, req, BCST_BANK)),
        "mock.settings.get" => Some(handle_settings_get(state, req)),
        "mock.settings.set" => Some(handle_settings_set(state, req)),
        "mock.results.list" => Some(handle_results_list(state, req)),
        "mock.results.save" => Some(handle_results_save(state, req)),
        "mock.notices.list" => Some(handle_notices_list(state, req)),
        "mock.notices.add" => Some(handle_notices_add(state, req)),
        "mock.notices.delete" => Some(handle_notices_delete(state, req)),
        "mock.notices.clear" => Some(handle_notices_clear(state, req)),
        _ => None,
    }
}
