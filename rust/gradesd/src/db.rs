use chrono::{NaiveDate, Utc};
use rusqlite::types::{Type, Value};
use rusqlite::{params_from_iter, Connection, OptionalExtension, Row};
use serde::Serialize;
use std::path::Path;
use uuid::Uuid;

use crate::context::{ContextKey, EvaluationContext};
use crate::grade::{GradeRecord, GradeStatus, GradeType, GradeValue};
use crate::store::{
    ClassSubject, GradeStore, NewGrade, StoreError, Student, Teacher, TeacherFilter,
};

pub const DB_FILE_NAME: &str = "gradesd.sqlite3";

pub fn open_db(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let conn = Connection::open(workspace.join(DB_FILE_NAME))?;
    ensure_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
pub fn open_in_memory() -> anyhow::Result<Connection> {
    let conn = Connection::open_in_memory()?;
    ensure_schema(&conn)?;
    Ok(conn)
}

fn ensure_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute("PRAGMA foreign_keys = ON", [])?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS classes(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS students(
            id TEXT PRIMARY KEY,
            class_id TEXT NOT NULL,
            last_name TEXT NOT NULL,
            first_name TEXT NOT NULL,
            matricule TEXT,
            sort_order INTEGER NOT NULL,
            FOREIGN KEY(class_id) REFERENCES classes(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_students_class_sort ON students(class_id, sort_order)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS subjects(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS teachers(
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS teacher_subjects(
            teacher_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            PRIMARY KEY(teacher_id, subject_id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_subjects(
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            teacher_id TEXT,
            coefficient INTEGER NOT NULL DEFAULT 1,
            PRIMARY KEY(class_id, subject_id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;

    // description is '' when absent so the evaluation index stays unique.
    conn.execute(
        "CREATE TABLE IF NOT EXISTS student_grades(
            id TEXT PRIMARY KEY,
            student_id TEXT NOT NULL,
            class_id TEXT NOT NULL,
            subject_id TEXT NOT NULL,
            term_id TEXT NOT NULL,
            teacher_id TEXT NOT NULL,
            value REAL NOT NULL,
            type TEXT NOT NULL,
            weight INTEGER NOT NULL DEFAULT 1,
            description TEXT NOT NULL DEFAULT '',
            grade_date TEXT NOT NULL,
            status TEXT NOT NULL DEFAULT 'draft',
            rejection_reason TEXT,
            submitted_at TEXT,
            validated_at TEXT,
            validated_by TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY(student_id) REFERENCES students(id),
            FOREIGN KEY(class_id) REFERENCES classes(id),
            FOREIGN KEY(subject_id) REFERENCES subjects(id),
            FOREIGN KEY(teacher_id) REFERENCES teachers(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE UNIQUE INDEX IF NOT EXISTS ux_student_grades_evaluation ON student_grades(
            class_id, subject_id, term_id, type, description, grade_date, student_id
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_class_subject_term
         ON student_grades(class_id, subject_id, term_id)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_grades_status ON student_grades(status)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_validations(
            id TEXT PRIMARY KEY,
            grade_id TEXT NOT NULL,
            action TEXT NOT NULL,
            previous_value REAL,
            new_value REAL,
            comment TEXT,
            actor_id TEXT,
            created_at TEXT NOT NULL,
            FOREIGN KEY(grade_id) REFERENCES student_grades(id)
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_validations_grade ON grade_validations(grade_id)",
        [],
    )?;

    Ok(())
}

const GRADE_COLUMNS: &str = "id, student_id, class_id, subject_id, term_id, teacher_id, value,
    type, weight, description, grade_date, status, rejection_reason, submitted_at,
    validated_at, created_at, updated_at";

fn conversion_err(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn grade_from_row(row: &Row<'_>) -> rusqlite::Result<GradeRecord> {
    let type_raw: String = row.get(7)?;
    let grade_type =
        GradeType::parse(&type_raw).ok_or_else(|| conversion_err(7, format!("grade type {type_raw}")))?;
    let weight: i64 = row.get(8)?;
    let description: String = row.get(9)?;
    let date_raw: String = row.get(10)?;
    let grade_date = NaiveDate::parse_from_str(&date_raw, "%Y-%m-%d")
        .map_err(|e| conversion_err(10, format!("grade date {date_raw}: {e}")))?;
    let status_raw: String = row.get(11)?;
    let status = GradeStatus::parse(&status_raw)
        .ok_or_else(|| conversion_err(11, format!("grade status {status_raw}")))?;

    Ok(GradeRecord {
        id: row.get(0)?,
        student_id: row.get(1)?,
        class_id: row.get(2)?,
        subject_id: row.get(3)?,
        term_id: row.get(4)?,
        teacher_id: row.get(5)?,
        value: row.get(6)?,
        grade_type,
        weight: u32::try_from(weight).map_err(|e| conversion_err(8, e.to_string()))?,
        description: if description.is_empty() {
            None
        } else {
            Some(description)
        },
        grade_date,
        status,
        rejection_reason: row.get(12)?,
        submitted_at: row.get(13)?,
        validated_at: row.get(14)?,
        created_at: row.get(15)?,
        updated_at: row.get(16)?,
    })
}

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(",")
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeValidationEntry {
    pub id: String,
    pub grade_id: String,
    pub action: String,
    pub previous_value: Option<f64>,
    pub new_value: Option<f64>,
    pub comment: Option<String>,
    pub actor_id: Option<String>,
    pub created_at: String,
}

/// Decision of the approval step that follows submission.
#[derive(Debug, Clone, PartialEq)]
pub enum ReviewDecision {
    Validate,
    Reject { reason: String },
    Reopen,
}

impl ReviewDecision {
    fn target(&self) -> GradeStatus {
        match self {
            ReviewDecision::Validate => GradeStatus::Validated,
            ReviewDecision::Reject { .. } => GradeStatus::Rejected,
            ReviewDecision::Reopen => GradeStatus::Draft,
        }
    }

    fn action(&self) -> &'static str {
        match self {
            ReviewDecision::Validate => "validated",
            ReviewDecision::Reject { .. } => "rejected",
            ReviewDecision::Reopen => "reopened",
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewReport {
    pub updated: Vec<String>,
    pub skipped: Vec<ReviewSkip>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewSkip {
    pub grade_id: String,
    pub reason: String,
}

/// Optional narrowing of the approval queue.
#[derive(Debug, Clone, Default)]
pub struct PendingValidationFilter {
    pub term_id: Option<String>,
    pub class_id: Option<String>,
    pub subject_id: Option<String>,
}

/// One batch waiting for approval: submitted grades of a class, subject,
/// term and teacher.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingValidation {
    pub class_id: String,
    pub class_name: String,
    pub subject_id: String,
    pub subject_name: String,
    pub term_id: String,
    pub teacher_id: String,
    pub teacher_name: String,
    pub pending_count: i64,
    pub submitted_at: Option<String>,
}

pub struct SqliteStore {
    conn: Connection,
}

impl SqliteStore {
    pub fn new(conn: Connection) -> Self {
        SqliteStore { conn }
    }

    pub fn create_class(&self, name: &str) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute("INSERT INTO classes(id, name) VALUES(?, ?)", (&id, name))?;
        Ok(id)
    }

    pub fn list_classes(&self) -> Result<Vec<(String, String, i64)>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT c.id, c.name,
               (SELECT COUNT(*) FROM students s WHERE s.class_id = c.id)
             FROM classes c
             ORDER BY c.name",
        )?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn create_student(
        &self,
        class_id: &str,
        first_name: &str,
        last_name: &str,
        matricule: Option<&str>,
    ) -> Result<Student, StoreError> {
        let class_exists: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM classes WHERE id = ?", [class_id], |r| r.get(0))
            .optional()?;
        if class_exists.is_none() {
            return Err(StoreError::NotFound("class".to_string()));
        }
        let sort_order: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(sort_order) + 1, 0) FROM students WHERE class_id = ?",
            [class_id],
            |r| r.get(0),
        )?;
        let id = Uuid::new_v4().to_string();
        self.conn.execute(
            "INSERT INTO students(id, class_id, last_name, first_name, matricule, sort_order)
             VALUES(?, ?, ?, ?, ?, ?)",
            (&id, class_id, last_name, first_name, matricule, sort_order),
        )?;
        Ok(Student {
            id,
            class_id: class_id.to_string(),
            first_name: first_name.to_string(),
            last_name: last_name.to_string(),
            matricule: matricule.map(str::to_string),
            sort_order,
        })
    }

    pub fn create_subject(&self, name: &str) -> Result<String, StoreError> {
        let id = Uuid::new_v4().to_string();
        self.conn
            .execute("INSERT INTO subjects(id, name) VALUES(?, ?)", (&id, name))?;
        Ok(id)
    }

    pub fn create_teacher(&self, name: &str, subject_ids: &[String]) -> Result<Teacher, StoreError> {
        let id = Uuid::new_v4().to_string();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute("INSERT INTO teachers(id, name) VALUES(?, ?)", (&id, name))?;
        for subject_id in subject_ids {
            tx.execute(
                "INSERT OR IGNORE INTO teacher_subjects(teacher_id, subject_id) VALUES(?, ?)",
                (&id, subject_id),
            )?;
        }
        tx.commit()?;
        Ok(Teacher {
            id,
            name: name.to_string(),
            subject_ids: subject_ids.to_vec(),
        })
    }

    pub fn upsert_class_subject(
        &self,
        class_id: &str,
        subject_id: &str,
        teacher_id: Option<&str>,
        coefficient: i64,
    ) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO class_subjects(class_id, subject_id, teacher_id, coefficient)
             VALUES(?, ?, ?, ?)
             ON CONFLICT(class_id, subject_id) DO UPDATE SET
               teacher_id = excluded.teacher_id,
               coefficient = excluded.coefficient",
            (class_id, subject_id, teacher_id, coefficient),
        )?;
        Ok(())
    }

    pub fn get_grade(&self, id: &str) -> Result<GradeRecord, StoreError> {
        let sql = format!("SELECT {GRADE_COLUMNS} FROM student_grades WHERE id = ?");
        self.conn
            .query_row(&sql, [id], grade_from_row)
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("grade {id}")))
    }

    pub fn list_grades(
        &self,
        class_id: &str,
        subject_id: &str,
        term_id: &str,
    ) -> Result<Vec<GradeRecord>, StoreError> {
        let sql = format!(
            "SELECT {GRADE_COLUMNS} FROM student_grades
             WHERE class_id = ? AND subject_id = ? AND term_id = ?
             ORDER BY grade_date, created_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map((class_id, subject_id, term_id), grade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Validated grades of a class and term, optionally for one subject.
    pub fn validated_grades(
        &self,
        class_id: &str,
        term_id: &str,
        subject_id: Option<&str>,
    ) -> Result<Vec<GradeRecord>, StoreError> {
        let mut sql = format!(
            "SELECT {GRADE_COLUMNS} FROM student_grades
             WHERE class_id = ? AND term_id = ? AND status = 'validated'"
        );
        let mut binds = vec![
            Value::Text(class_id.to_string()),
            Value::Text(term_id.to_string()),
        ];
        if let Some(s) = subject_id {
            sql.push_str(" AND subject_id = ?");
            binds.push(Value::Text(s.to_string()));
        }
        sql.push_str(" ORDER BY subject_id, type, grade_date");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(binds), grade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Submitted grades grouped into approval batches, most recently
    /// submitted batch first.
    pub fn pending_validations(
        &self,
        filter: &PendingValidationFilter,
    ) -> Result<Vec<PendingValidation>, StoreError> {
        let mut sql = String::from(
            "SELECT g.class_id, c.name, g.subject_id, s.name, g.term_id,
                    g.teacher_id, t.name, COUNT(*), MIN(g.submitted_at)
             FROM student_grades g
             JOIN classes c ON c.id = g.class_id
             JOIN subjects s ON s.id = g.subject_id
             JOIN teachers t ON t.id = g.teacher_id
             WHERE g.status = 'submitted'",
        );
        let mut binds: Vec<Value> = Vec::new();
        for (column, value) in [
            ("g.term_id", &filter.term_id),
            ("g.class_id", &filter.class_id),
            ("g.subject_id", &filter.subject_id),
        ] {
            if let Some(v) = value {
                sql.push_str(&format!(" AND {column} = ?"));
                binds.push(Value::Text(v.clone()));
            }
        }
        sql.push_str(
            " GROUP BY g.class_id, c.name, g.subject_id, s.name, g.term_id, g.teacher_id, t.name
              ORDER BY MIN(g.submitted_at) DESC",
        );

        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(binds), |r| {
                Ok(PendingValidation {
                    class_id: r.get(0)?,
                    class_name: r.get(1)?,
                    subject_id: r.get(2)?,
                    subject_name: r.get(3)?,
                    term_id: r.get(4)?,
                    teacher_id: r.get(5)?,
                    teacher_name: r.get(6)?,
                    pending_count: r.get(7)?,
                    submitted_at: r.get(8)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Applies the approval decision to every id whose status allows it.
    pub fn review_grades(
        &self,
        grade_ids: &[String],
        decision: &ReviewDecision,
        actor_id: Option<&str>,
    ) -> Result<ReviewReport, StoreError> {
        let target = decision.target();
        let now = now_ts();
        let mut report = ReviewReport::default();
        let tx = self.conn.unchecked_transaction()?;

        for id in grade_ids {
            let status: Option<String> = tx
                .query_row("SELECT status FROM student_grades WHERE id = ?", [id], |r| {
                    r.get(0)
                })
                .optional()?;
            let Some(status) = status.as_deref().and_then(GradeStatus::parse) else {
                report.skipped.push(ReviewSkip {
                    grade_id: id.clone(),
                    reason: "grade not found".to_string(),
                });
                continue;
            };
            if !status.can_transition_to(target) {
                report.skipped.push(ReviewSkip {
                    grade_id: id.clone(),
                    reason: format!("cannot go from {} to {}", status.as_str(), target.as_str()),
                });
                continue;
            }

            match decision {
                ReviewDecision::Validate => tx.execute(
                    "UPDATE student_grades
                     SET status = 'validated', validated_at = ?, validated_by = ?,
                         rejection_reason = NULL, updated_at = ?
                     WHERE id = ?",
                    (&now, actor_id, &now, id),
                )?,
                ReviewDecision::Reject { reason } => tx.execute(
                    "UPDATE student_grades
                     SET status = 'rejected', rejection_reason = ?, updated_at = ?
                     WHERE id = ?",
                    (reason, &now, id),
                )?,
                ReviewDecision::Reopen => tx.execute(
                    "UPDATE student_grades
                     SET status = 'draft', rejection_reason = NULL, updated_at = ?
                     WHERE id = ?",
                    (&now, id),
                )?,
            };
            let comment = match decision {
                ReviewDecision::Reject { reason } => Some(reason.as_str()),
                _ => None,
            };
            insert_audit(&tx, id, decision.action(), None, None, comment, actor_id, &now)?;
            report.updated.push(id.clone());
        }

        tx.commit()?;
        Ok(report)
    }

    pub fn grade_history(&self, grade_id: &str) -> Result<Vec<GradeValidationEntry>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, grade_id, action, previous_value, new_value, comment, actor_id, created_at
             FROM grade_validations
             WHERE grade_id = ?
             ORDER BY created_at DESC, rowid DESC",
        )?;
        let rows = stmt
            .query_map([grade_id], |r| {
                Ok(GradeValidationEntry {
                    id: r.get(0)?,
                    grade_id: r.get(1)?,
                    action: r.get(2)?,
                    previous_value: r.get(3)?,
                    new_value: r.get(4)?,
                    comment: r.get(5)?,
                    actor_id: r.get(6)?,
                    created_at: r.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn grades_for_students(
        &self,
        key: &ContextKey,
        student_ids: &[&str],
    ) -> Result<Vec<GradeRecord>, StoreError> {
        if student_ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT {GRADE_COLUMNS} FROM student_grades
             WHERE class_id = ? AND subject_id = ? AND term_id = ? AND type = ?
               AND description = ? AND grade_date = ? AND student_id IN ({})
             ORDER BY created_at",
            placeholders(student_ids.len())
        );
        let mut binds = key_binds(key);
        binds.extend(student_ids.iter().map(|s| Value::Text((*s).to_string())));
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(binds), grade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn key_binds(key: &ContextKey) -> Vec<Value> {
    vec![
        Value::Text(key.class_id.clone()),
        Value::Text(key.subject_id.clone()),
        Value::Text(key.term_id.clone()),
        Value::Text(key.grade_type.as_str().to_string()),
        Value::Text(key.description_text().to_string()),
        Value::Text(key.grade_date.format("%Y-%m-%d").to_string()),
    ]
}

#[allow(clippy::too_many_arguments)]
fn insert_audit(
    conn: &Connection,
    grade_id: &str,
    action: &str,
    previous_value: Option<f64>,
    new_value: Option<f64>,
    comment: Option<&str>,
    actor_id: Option<&str>,
    created_at: &str,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO grade_validations(
            id, grade_id, action, previous_value, new_value, comment, actor_id, created_at
         ) VALUES(?, ?, ?, ?, ?, ?, ?, ?)",
        (
            Uuid::new_v4().to_string(),
            grade_id,
            action,
            previous_value,
            new_value,
            comment,
            actor_id,
            created_at,
        ),
    )?;
    Ok(())
}

impl GradeStore for SqliteStore {
    fn update_grade(&self, id: &str, value: GradeValue) -> Result<GradeRecord, StoreError> {
        let current = self.get_grade(id)?;
        if !current.status.is_editable() {
            return Err(StoreError::Immutable {
                id: id.to_string(),
                status: current.status,
            });
        }
        let now = now_ts();
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            "UPDATE student_grades SET value = ?, updated_at = ? WHERE id = ?",
            (value.get(), &now, id),
        )?;
        insert_audit(
            &tx,
            id,
            "edited",
            Some(current.value),
            Some(value.get()),
            None,
            Some(&current.teacher_id),
            &now,
        )?;
        tx.commit()?;
        self.get_grade(id)
    }

    fn create_bulk_grades(
        &self,
        ctx: &EvaluationContext,
        grades: &[NewGrade],
    ) -> Result<Vec<GradeRecord>, StoreError> {
        let teacher_id = ctx
            .teacher_id()
            .ok_or_else(|| StoreError::NotFound("teacher assignment".to_string()))?;
        let key = ctx.key();
        let grade_date = key.grade_date.format("%Y-%m-%d").to_string();
        let now = now_ts();

        let tx = self.conn.unchecked_transaction()?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO student_grades(
                    id, student_id, class_id, subject_id, term_id, teacher_id, value, type,
                    weight, description, grade_date, status, created_at, updated_at
                 ) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 'draft', ?, ?)
                 ON CONFLICT(class_id, subject_id, term_id, type, description, grade_date, student_id)
                 DO UPDATE SET
                   value = excluded.value,
                   weight = excluded.weight,
                   teacher_id = excluded.teacher_id,
                   updated_at = excluded.updated_at
                 WHERE student_grades.status IN ('draft', 'rejected')",
            )?;
            for g in grades {
                stmt.execute((
                    Uuid::new_v4().to_string(),
                    &g.student_id,
                    &key.class_id,
                    &key.subject_id,
                    &key.term_id,
                    teacher_id,
                    g.value.get(),
                    key.grade_type.as_str(),
                    i64::from(ctx.weight()),
                    key.description_text(),
                    &grade_date,
                    &now,
                    &now,
                ))?;
            }
        }
        tx.commit()?;

        let student_ids: Vec<&str> = grades.iter().map(|g| g.student_id.as_str()).collect();
        self.grades_for_students(key, &student_ids)
    }

    fn submit_grades_for_validation(&self, grade_ids: &[String]) -> Result<usize, StoreError> {
        let now = now_ts();
        let tx = self.conn.unchecked_transaction()?;
        let mut moved = 0;
        for id in grade_ids {
            let teacher_id: Option<String> = tx
                .query_row(
                    "SELECT teacher_id FROM student_grades WHERE id = ? AND status = 'draft'",
                    [id],
                    |r| r.get(0),
                )
                .optional()?;
            let Some(teacher_id) = teacher_id else {
                continue;
            };
            tx.execute(
                "UPDATE student_grades
                 SET status = 'submitted', submitted_at = ?, updated_at = ?
                 WHERE id = ? AND status = 'draft'",
                (&now, &now, id),
            )?;
            insert_audit(&tx, id, "submitted", None, None, None, Some(&teacher_id), &now)?;
            moved += 1;
        }
        tx.commit()?;
        Ok(moved)
    }

    fn delete_draft_grades(&self, key: &ContextKey) -> Result<usize, StoreError> {
        let filter = "class_id = ? AND subject_id = ? AND term_id = ? AND type = ?
             AND description = ? AND grade_date = ? AND status = 'draft'";
        let tx = self.conn.unchecked_transaction()?;
        tx.execute(
            &format!(
                "DELETE FROM grade_validations
                 WHERE grade_id IN (SELECT id FROM student_grades WHERE {filter})"
            ),
            params_from_iter(key_binds(key)),
        )?;
        let deleted = tx.execute(
            &format!("DELETE FROM student_grades WHERE {filter}"),
            params_from_iter(key_binds(key)),
        )?;
        tx.commit()?;
        Ok(deleted)
    }

    fn assign_teacher(
        &self,
        class_id: &str,
        subject_id: &str,
        teacher_id: &str,
    ) -> Result<(), StoreError> {
        let teacher: Option<i64> = self
            .conn
            .query_row("SELECT 1 FROM teachers WHERE id = ?", [teacher_id], |r| r.get(0))
            .optional()?;
        if teacher.is_none() {
            return Err(StoreError::NotFound(format!("teacher {teacher_id}")));
        }
        let changed = self.conn.execute(
            "UPDATE class_subjects SET teacher_id = ? WHERE class_id = ? AND subject_id = ?",
            (teacher_id, class_id, subject_id),
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound("class subject".to_string()));
        }
        Ok(())
    }

    fn list_teachers(&self, filter: &TeacherFilter) -> Result<Vec<Teacher>, StoreError> {
        let (sql, binds) = match &filter.subject_id {
            Some(subject_id) => (
                "SELECT t.id, t.name FROM teachers t
                 WHERE EXISTS (
                   SELECT 1 FROM teacher_subjects ts
                   WHERE ts.teacher_id = t.id AND ts.subject_id = ?
                 )
                 ORDER BY t.name",
                vec![Value::Text(subject_id.clone())],
            ),
            None => ("SELECT t.id, t.name FROM teachers t ORDER BY t.name", Vec::new()),
        };
        let mut stmt = self.conn.prepare(sql)?;
        let heads = stmt
            .query_map(params_from_iter(binds), |r| {
                Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let needle = filter
            .search
            .as_deref()
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty());

        let mut subj_stmt = self
            .conn
            .prepare("SELECT subject_id FROM teacher_subjects WHERE teacher_id = ? ORDER BY subject_id")?;
        let mut out = Vec::with_capacity(heads.len());
        for (id, name) in heads {
            if let Some(n) = needle.as_deref() {
                if !name.to_lowercase().contains(n) {
                    continue;
                }
            }
            let subject_ids = subj_stmt
                .query_map([&id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            out.push(Teacher {
                id,
                name,
                subject_ids,
            });
        }
        Ok(out)
    }

    fn list_class_subjects(&self, class_id: &str) -> Result<Vec<ClassSubject>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT cs.class_id, cs.subject_id, s.name, cs.teacher_id, t.name, cs.coefficient
             FROM class_subjects cs
             JOIN subjects s ON s.id = cs.subject_id
             LEFT JOIN teachers t ON t.id = cs.teacher_id
             WHERE cs.class_id = ?
             ORDER BY s.name",
        )?;
        let rows = stmt
            .query_map([class_id], |r| {
                Ok(ClassSubject {
                    class_id: r.get(0)?,
                    subject_id: r.get(1)?,
                    subject_name: r.get(2)?,
                    teacher_id: r.get(3)?,
                    teacher_name: r.get(4)?,
                    coefficient: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn list_students(&self, class_id: &str) -> Result<Vec<Student>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, class_id, first_name, last_name, matricule, sort_order
             FROM students
             WHERE class_id = ?
             ORDER BY sort_order, last_name",
        )?;
        let rows = stmt
            .query_map([class_id], |r| {
                Ok(Student {
                    id: r.get(0)?,
                    class_id: r.get(1)?,
                    first_name: r.get(2)?,
                    last_name: r.get(3)?,
                    matricule: r.get(4)?,
                    sort_order: r.get(5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn grades_for_context(&self, key: &ContextKey) -> Result<Vec<GradeRecord>, StoreError> {
        let sql = format!(
            "SELECT {GRADE_COLUMNS} FROM student_grades
             WHERE class_id = ? AND subject_id = ? AND term_id = ? AND type = ?
               AND description = ? AND grade_date = ?
             ORDER BY created_at"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt
            .query_map(params_from_iter(key_binds(key)), grade_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}
