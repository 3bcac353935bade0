use crate::db::{self, SqliteResultStore, RESULT_COLUMNS};
use crate::engine::{EngineError, ResultStore};
use crate::ipc::error::{err, ok};
use crate::ipc::types::{AppState, Request};
use crate::rank::{CoScholasticGrade, RankPolicy, ResultRecord, SubjectMark};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::json;
use uuid::Uuid;

/// Column order used when normalizing the fixed-key marks-map variant into
/// an ordered subject list.
const FIXED_SUBJECT_ORDER: [&str; 7] = [
    "english", "hindi", "math", "science", "social", "gk", "computer",
];

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

    fn response(self, id: &str) -> serde_json::Value {
        err(id, self.code, self.message, self.details)
    }
}

fn get_required_str(params: &serde_json::Value, key: &str) -> Result<String, HandlerErr> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| HandlerErr::bad_params(format!("missing {}", key)))
}

fn get_optional_str(params: &serde_json::Value, key: &str) -> Option<String> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Teacher-scoped callers may only touch records in their own class/section.
fn teacher_scope(params: &serde_json::Value) -> Result<Option<(String, String)>, HandlerErr> {
    if params.get("role").and_then(|v| v.as_str()) != Some("teacher") {
        return Ok(None);
    }
    let class = get_required_str(params, "teacherClass")?;
    let section = get_required_str(params, "teacherSection")?;
    Ok(Some((class, section)))
}

fn parse_subjects(params: &serde_json::Value) -> Result<Vec<SubjectMark>, HandlerErr> {
    if let Some(arr) = params.get("subjects").and_then(|v| v.as_array()) {
        let mut subjects = Vec::with_capacity(arr.len());
        for entry in arr {
            let name = entry
                .get("name")
                .and_then(|v| v.as_str())
                .unwrap_or("")
                .to_string();
            // Non-numeric marks flow through as NaN so the engine can report
            // the entry instead of the request dying here.
            let marks = entry.get("marks").and_then(|v| v.as_f64()).unwrap_or(f64::NAN);
            subjects.push(SubjectMark { name, marks });
        }
        return Ok(subjects);
    }

    if let Some(map) = params.get("marks").and_then(|v| v.as_object()) {
        let mut subjects = Vec::with_capacity(map.len());
        for key in FIXED_SUBJECT_ORDER {
            if let Some(v) = map.get(key) {
                subjects.push(SubjectMark {
                    name: key.to_string(),
                    marks: v.as_f64().unwrap_or(f64::NAN),
                });
            }
        }
        let mut extras: Vec<&String> = map
            .keys()
            .filter(|k| !FIXED_SUBJECT_ORDER.contains(&k.as_str()))
            .collect();
        extras.sort();
        for key in extras {
            subjects.push(SubjectMark {
                name: key.clone(),
                marks: map.get(key).and_then(|v| v.as_f64()).unwrap_or(f64::NAN),
            });
        }
        return Ok(subjects);
    }

    Err(HandlerErr::bad_params(
        "missing subjects[] or marks object",
    ))
}

fn parse_co_scholastic(params: &serde_json::Value) -> Vec<CoScholasticGrade> {
    params
        .get("coScholastic")
        .and_then(|v| v.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|entry| {
                    let name = entry.get("name").and_then(|v| v.as_str())?;
                    let grade = entry.get("grade").and_then(|v| v.as_str())?;
                    Some(CoScholasticGrade {
                        name: name.to_string(),
                        grade: grade.to_string(),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_rank_policy(params: &serde_json::Value) -> Result<RankPolicy, HandlerErr> {
    match params.get("rankPolicy") {
        None => Ok(RankPolicy::default()),
        Some(v) if v.is_null() => Ok(RankPolicy::default()),
        Some(v) => serde_json::from_value(v.clone())
            .map_err(|e| HandlerErr::bad_params(format!("invalid rankPolicy: {}", e))),
    }
}

/// Resolve the record's surrogate id: an explicit id must exist; otherwise
/// the natural key (class, section, rollNumber, examTerm) reuses the stored
/// id or a fresh one is minted.
fn resolve_identity(
    conn: &Connection,
    params: &serde_json::Value,
    record: &ResultRecord,
) -> Result<String, HandlerErr> {
    if let Some(id) = get_optional_str(params, "id") {
        let exists: Option<String> = conn
            .query_row("SELECT id FROM student_results WHERE id = ?", [&id], |r| {
                r.get(0)
            })
            .optional()
            .map_err(|e| HandlerErr {
                code: "db_query_failed",
                message: e.to_string(),
                details: None,
            })?;
        return exists.ok_or(HandlerErr {
            code: "not_found",
            message: "no result to update for the given id".to_string(),
            details: Some(json!({ "id": id })),
        });
    }

    let existing: Option<String> = conn
        .query_row(
            "SELECT id FROM student_results
             WHERE class = ? AND section = ? AND roll_number = ? AND exam_term = ?",
            (
                &record.class,
                &record.section,
                &record.roll_number,
                &record.exam_term,
            ),
            |r| r.get(0),
        )
        .optional()
        .map_err(|e| HandlerErr {
            code: "db_query_failed",
            message: e.to_string(),
            details: None,
        })?;
    Ok(existing.unwrap_or_else(|| Uuid::new_v4().to_string()))
}

fn engine_error_response(id: &str, e: EngineError) -> serde_json::Value {
    match e {
        EngineError::Validation { message } => err(id, "bad_params", message, None),
        EngineError::NotFound { id: rid } => err(
            id,
            "not_found",
            "result not found",
            Some(json!({ "id": rid })),
        ),
        EngineError::Conflict { message } => err(id, "conflict", message, None),
        EngineError::Store { message } => err(id, "db_query_failed", message, None),
        EngineError::PartialWrite { written, failed } => err(
            id,
            "partial_write",
            "some rank updates were not persisted",
            Some(json!({ "written": written, "failed": failed })),
        ),
    }
}

fn record_json(record: &ResultRecord) -> serde_json::Value {
    serde_json::to_value(record).unwrap_or_else(|_| json!({}))
}

fn handle_results_save(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };

    let scope = match teacher_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let class = match get_required_str(&req.params, "class") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let section = match get_required_str(&req.params, "section") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    if let Some((teacher_class, teacher_section)) = &scope {
        if *teacher_class != class || *teacher_section != section {
            return err(
                &req.id,
                "unauthorized",
                "teachers may only save results for their own class",
                Some(json!({ "class": class, "section": section })),
            );
        }
    }

    let name = match get_required_str(&req.params, "name") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let roll_number = match get_required_str(&req.params, "rollNumber") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let dob = match get_required_str(&req.params, "dob") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let exam_term = match get_required_str(&req.params, "examTerm") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let Some(full_marks) = req.params.get("fullMarks").and_then(|v| v.as_f64()) else {
        return err(&req.id, "bad_params", "missing fullMarks", None);
    };

    let subjects = match parse_subjects(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let policy = match parse_rank_policy(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut record = ResultRecord {
        id: String::new(),
        name,
        father_name: get_optional_str(&req.params, "fatherName"),
        mother_name: get_optional_str(&req.params, "motherName"),
        roll_number,
        dob,
        class,
        section,
        exam_term,
        academic_session: get_optional_str(&req.params, "academicSession"),
        attendance: get_optional_str(&req.params, "attendance"),
        discipline: get_optional_str(&req.params, "discipline"),
        full_marks,
        subjects,
        co_scholastic: parse_co_scholastic(&req.params),
        total: 0.0,
        percent: 0.0,
        pass_fail: String::new(),
        failed_subjects: 0,
        rank: 0,
    };

    record.id = match resolve_identity(conn, &req.params, &record) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let store = SqliteResultStore { conn };
    match state.engine.on_save(&store, record, &policy) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "record": record_json(&outcome.record),
                "written": outcome.written,
                "issues": outcome.issues,
            }),
        ),
        Err(e) => engine_error_response(&req.id, e),
    }
}

fn handle_results_get(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let id = match get_required_str(&req.params, "id") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let scope = match teacher_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let store = SqliteResultStore { conn };
    let record = match store.find_by_id(&id) {
        Ok(Some(r)) => r,
        Ok(None) => {
            return err(
                &req.id,
                "not_found",
                "result not found",
                Some(json!({ "id": id })),
            )
        }
        Err(e) => return err(&req.id, "db_query_failed", e.message, None),
    };

    if let Some((teacher_class, teacher_section)) = &scope {
        if record.class != *teacher_class || record.section != *teacher_section {
            return err(
                &req.id,
                "unauthorized",
                "teachers may only view results for their own class",
                None,
            );
        }
    }

    ok(&req.id, json!({ "record": record_json(&record) }))
}

fn handle_results_list(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let scope = match teacher_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let mut clauses: Vec<&'static str> = Vec::new();
    let mut binds: Vec<Value> = Vec::new();

    if let Some((teacher_class, teacher_section)) = scope {
        clauses.push("class = ?");
        binds.push(Value::Text(teacher_class));
        clauses.push("section = ?");
        binds.push(Value::Text(teacher_section));
    } else {
        if let Some(class) = get_optional_str(&req.params, "class") {
            clauses.push("class = ?");
            binds.push(Value::Text(class));
        }
        if let Some(section) = get_optional_str(&req.params, "section") {
            clauses.push("section = ?");
            binds.push(Value::Text(section));
        }
        if let Some(name) = get_optional_str(&req.params, "name") {
            clauses.push("name LIKE ? COLLATE NOCASE");
            binds.push(Value::Text(format!("%{}%", name)));
        }
        if let Some(dob) = get_optional_str(&req.params, "dob") {
            clauses.push("dob = ?");
            binds.push(Value::Text(dob));
        }
    }
    if let Some(roll) = get_optional_str(&req.params, "rollNumber") {
        clauses.push("roll_number = ?");
        binds.push(Value::Text(roll));
    }
    if let Some(term) = get_optional_str(&req.params, "examTerm") {
        clauses.push("exam_term = ?");
        binds.push(Value::Text(term));
    }

    let where_sql = if clauses.is_empty() {
        String::new()
    } else {
        format!(" WHERE {}", clauses.join(" AND "))
    };
    let sql = format!(
        "SELECT {} FROM student_results{} ORDER BY rank = 0, rank, rowid",
        RESULT_COLUMNS, where_sql
    );

    let mut stmt = match conn.prepare(&sql) {
        Ok(s) => s,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    let mut records = match stmt
        .query_map(params_from_iter(binds), db::result_from_row)
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())
    {
        Ok(v) => v,
        Err(e) => return err(&req.id, "db_query_failed", e.to_string(), None),
    };
    for record in &mut records {
        if let Err(e) = db::attach_result_children(conn, record) {
            return err(&req.id, "db_query_failed", e.to_string(), None);
        }
    }

    let out: Vec<serde_json::Value> = records.iter().map(record_json).collect();
    ok(&req.id, json!({ "results": out }))
}

fn handle_results_delete(state: &mut AppState, req: &Request) -> serde_json::Value {
    let Some(conn) = state.db.as_ref() else {
        return err(&req.id, "no_workspace", "select a workspace first", None);
    };
    let id = match get_required_str(&req.params, "id") {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let scope = match teacher_scope(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };
    let policy = match parse_rank_policy(&req.params) {
        Ok(v) => v,
        Err(e) => return e.response(&req.id),
    };

    let store = SqliteResultStore { conn };
    if let Some((teacher_class, teacher_section)) = &scope {
        match store.find_by_id(&id) {
            Ok(Some(record)) => {
                if record.class != *teacher_class || record.section != *teacher_section {
                    return err(
                        &req.id,
                        "unauthorized",
                        "teachers may only delete results for their own class",
                        None,
                    );
                }
            }
            Ok(None) => {
                return err(
                    &req.id,
                    "not_found",
                    "result not found",
                    Some(json!({ "id": id })),
                )
            }
            Err(e) => return err(&req.id, "db_query_failed", e.message, None),
        }
    }

    match state.engine.on_delete(&store, &id, &policy) {
        Ok(outcome) => ok(
            &req.id,
            json!({
                "deleted": record_json(&outcome.deleted),
                "written": outcome.written,
            }),
        ),
        Err(e) => engine_error_response(&req.id, e),
    }
}

pub fn try_handle(state: &mut AppState, req: &Request) -> Option<serde_json::Value> {
    match req.method.as_str() {
        "results.save" => Some(handle_results_save(state, req)),
        "results.get" => Some(handle_results_get(state, req)),
        "results.list" => Some(handle_results_list(state, req)),
        "results.delete" => Some(handle_results_delete(state, req)),
        _ => None,
    }
}
