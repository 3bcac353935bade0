use crate::engine::{ResultStore, StoreError};
use crate::rank::{CoScholasticGrade, GroupKey, ResultRecord, SubjectMark};
use rusqlite::{Connection, OptionalExtension, Row};
use std::path::Path;

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join("schoold.sqlite3");
    let conn = Connection::open(db_path)?;
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_results(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            father_name TEXT,
            mother_name TEXT,
            roll_number TEXT NOT NULL,
            dob TEXT NOT NULL,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            exam_term TEXT NOT NULL,
            academic_session TEXT,
            attendance TEXT,
            discipline TEXT,
            full_marks REAL NOT NULL,
            total REAL NOT NULL DEFAULT 0,
            percent REAL NOT NULL DEFAULT 0,
            pass_fail TEXT NOT NULL DEFAULT 'Fail',
            failed_subjects INTEGER NOT NULL DEFAULT 0,
            rank INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            UNIQUE(class, section, roll_number, exam_term)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_student_results_group
         ON student_results(class, section, exam_term)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_subjects(
            result_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            name TEXT NOT NULL,
            marks REAL NOT NULL,
            PRIMARY KEY(result_id, idx),
            FOREIGN KEY(result_id) REFERENCES student_results(id) ON DELETE CASCADE
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS result_co_scholastic(
            result_id TEXT NOT NULL,
            idx INTEGER NOT NULL,
            name TEXT NOT NULL,
            grade TEXT NOT NULL,
            PRIMARY KEY(result_id, idx),
            FOREIGN KEY(result_id) REFERENCES student_results(id) ON DELETE CASCADE
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            term TEXT NOT NULL,
            name TEXT NOT NULL,
            full_marks REAL NOT NULL,
            passing_marks REAL,
            UNIQUE(class, section, term, name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            teacher_id INTEGER NOT NULL UNIQUE,
            name TEXT NOT NULL,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            password_digest TEXT NOT NULL,
            UNIQUE(class, section)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS attendance_log(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            roll_number TEXT NOT NULL,
            day TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'Present',
            UNIQUE(class, section, roll_number, day)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_attendance_log_day ON attendance_log(day)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mock_questions(
            id INTEGER PRIMARY KEY,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            subject TEXT NOT NULL,
            chapter TEXT NOT NULL,
            question TEXT NOT NULL,
            options TEXT NOT NULL,
            correct_answer INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS bcst_questions(
            id INTEGER PRIMARY KEY,
            class TEXT NOT NULL,
            section TEXT NOT NULL,
            subject TEXT NOT NULL,
            chapter TEXT NOT NULL,
            question TEXT NOT NULL,
            options TEXT NOT NULL,
            correct_answer INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mock_settings(
            singleton INTEGER PRIMARY KEY CHECK(singleton = 1),
            duration INTEGER NOT NULL,
            correct_mark REAL NOT NULL,
            incorrect_mark REAL NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mock_results(
            id TEXT PRIMARY KEY,
            student_ref TEXT,
            student_details TEXT NOT NULL,
            answers TEXT NOT NULL,
            score TEXT NOT NULL,
            questions TEXT NOT NULL,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_mock_results_student ON mock_results(student_ref)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS mock_notices(
            id TEXT PRIMARY KEY,
            class_name TEXT NOT NULL,
            section TEXT NOT NULL,
            subject TEXT NOT NULL,
            chapter TEXT NOT NULL,
            date TEXT NOT NULL,
            time TEXT NOT NULL,
            instructions TEXT,
            timestamp TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

pub const RESULT_COLUMNS: &str =
    "id, name, father_name, mother_name, roll_number, dob, class, section, exam_term,
     academic_session, attendance, discipline, full_marks, total, percent, pass_fail,
     failed_subjects, rank";

/// Maps one student_results row; subjects and co-scholastic grades are
/// loaded separately via `attach_result_children`.
pub fn result_from_row(row: &Row<'_>) -> rusqlite::Result<ResultRecord> {
    Ok(ResultRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        father_name: row.get(2)?,
        mother_name: row.get(3)?,
        roll_number: row.get(4)?,
        dob: row.get(5)?,
        class: row.get(6)?,
        section: row.get(7)?,
        exam_term: row.get(8)?,
        academic_session: row.get(9)?,
        attendance: row.get(10)?,
        discipline: row.get(11)?,
        full_marks: row.get(12)?,
        total: row.get(13)?,
        percent: row.get(14)?,
        pass_fail: row.get(15)?,
        failed_subjects: row.get(16)?,
        rank: row.get(17)?,
        subjects: Vec::new(),
        co_scholastic: Vec::new(),
    })
}

pub fn attach_result_children(
    conn: &Connection,
    record: &mut ResultRecord,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(
        "SELECT name, marks FROM result_subjects WHERE result_id = ? ORDER BY idx",
    )?;
    record.subjects = stmt
        .query_map([&record.id], |r| {
            Ok(SubjectMark {
                name: r.get(0)?,
                marks: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    let mut stmt = conn.prepare(
        "SELECT name, grade FROM result_co_scholastic WHERE result_id = ? ORDER BY idx",
    )?;
    record.co_scholastic = stmt
        .query_map([&record.id], |r| {
            Ok(CoScholasticGrade {
                name: r.get(0)?,
                grade: r.get(1)?,
            })
        })
        .and_then(|it| it.collect::<Result<Vec<_>, _>>())?;

    Ok(())
}

/// `ResultStore` over the workspace database. Peer groups are returned in
/// rowid (insertion) order, which is what makes the engine's stable
/// tie-break reproducible between calls.
pub struct SqliteResultStore<'a> {
    pub conn: &'a Connection,
}

impl ResultStore for SqliteResultStore<'_> {
    fn find_by_group(&self, key: &GroupKey) -> Result<Vec<ResultRecord>, StoreError> {
        let sql = format!(
            "SELECT {} FROM student_results
             WHERE class = ? AND section = ? AND exam_term = ?
             ORDER BY rowid",
            RESULT_COLUMNS
        );
        let mut stmt = self
            .conn
            .prepare(&sql)
            .map_err(|e| StoreError::new(e.to_string()))?;
        let mut records = stmt
            .query_map((&key.class, &key.section, &key.exam_term), result_from_row)
            .and_then(|it| it.collect::<Result<Vec<_>, _>>())
            .map_err(|e| StoreError::new(e.to_string()))?;
        for record in &mut records {
            attach_result_children(self.conn, record)
                .map_err(|e| StoreError::new(e.to_string()))?;
        }
        Ok(records)
    }

    fn find_by_id(&self, id: &str) -> Result<Option<ResultRecord>, StoreError> {
        let sql = format!("SELECT {} FROM student_results WHERE id = ?", RESULT_COLUMNS);
        let record = self
            .conn
            .query_row(&sql, [id], result_from_row)
            .optional()
            .map_err(|e| StoreError::new(e.to_string()))?;
        match record {
            Some(mut r) => {
                attach_result_children(self.conn, &mut r)
                    .map_err(|e| StoreError::new(e.to_string()))?;
                Ok(Some(r))
            }
            None => Ok(None),
        }
    }

    fn save(&self, record: &ResultRecord) -> Result<(), StoreError> {
        let created_at = chrono::Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO student_results(
                    id, name, father_name, mother_name, roll_number, dob, class, section,
                    exam_term, academic_session, attendance, discipline, full_marks,
                    total, percent, pass_fail, failed_subjects, rank, created_at
                 ) VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
                 ON CONFLICT(id) DO UPDATE SET
                    name = excluded.name,
                    father_name = excluded.father_name,
                    mother_name = excluded.mother_name,
                    roll_number = excluded.roll_number,
                    dob = excluded.dob,
                    class = excluded.class,
                    section = excluded.section,
                    exam_term = excluded.exam_term,
                    academic_session = excluded.academic_session,
                    attendance = excluded.attendance,
                    discipline = excluded.discipline,
                    full_marks = excluded.full_marks,
                    total = excluded.total,
                    percent = excluded.percent,
                    pass_fail = excluded.pass_fail,
                    failed_subjects = excluded.failed_subjects,
                    rank = excluded.rank",
                rusqlite::params![
                    record.id,
                    record.name,
                    record.father_name,
                    record.mother_name,
                    record.roll_number,
                    record.dob,
                    record.class,
                    record.section,
                    record.exam_term,
                    record.academic_session,
                    record.attendance,
                    record.discipline,
                    record.full_marks,
                    record.total,
                    record.percent,
                    record.pass_fail,
                    record.failed_subjects,
                    record.rank,
                    created_at,
                ],
            )
            .map_err(|e| StoreError::new(e.to_string()))?;

        self.conn
            .execute(
                "DELETE FROM result_subjects WHERE result_id = ?",
                [&record.id],
            )
            .map_err(|e| StoreError::new(e.to_string()))?;
        for (idx, subject) in record.subjects.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO result_subjects(result_id, idx, name, marks) VALUES(?, ?, ?, ?)",
                    rusqlite::params![record.id, idx as i64, subject.name, subject.marks],
                )
                .map_err(|e| StoreError::new(e.to_string()))?;
        }

        self.conn
            .execute(
                "DELETE FROM result_co_scholastic WHERE result_id = ?",
                [&record.id],
            )
            .map_err(|e| StoreError::new(e.to_string()))?;
        for (idx, entry) in record.co_scholastic.iter().enumerate() {
            self.conn
                .execute(
                    "INSERT INTO result_co_scholastic(result_id, idx, name, grade) VALUES(?, ?, ?, ?)",
                    rusqlite::params![record.id, idx as i64, entry.name, entry.grade],
                )
                .map_err(|e| StoreError::new(e.to_string()))?;
        }

        Ok(())
    }

    fn delete_by_id(&self, id: &str) -> Result<(), StoreError> {
        self.conn
            .execute("DELETE FROM student_results WHERE id = ?", [id])
            .map_err(|e| StoreError::new(e.to_string()))?;
        Ok(())
    }
}
