use serde::Serialize;

use crate::context::{ContextKey, EvaluationContext};
use crate::grade::{GradeRecord, GradeStatus, GradeValue};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("grade {id} is {status:?} and cannot be changed")]
    Immutable { id: String, status: GradeStatus },
    #[error(transparent)]
    Db(#[from] rusqlite::Error),
}

impl StoreError {
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "not_found",
            StoreError::Immutable { .. } => "immutable_grade",
            StoreError::Db(_) => "persistence_failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewGrade {
    pub student_id: String,
    pub value: GradeValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Student {
    pub id: String,
    pub class_id: String,
    pub first_name: String,
    pub last_name: String,
    pub matricule: Option<String>,
    pub sort_order: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Teacher {
    pub id: String,
    pub name: String,
    pub subject_ids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct TeacherFilter {
    /// Only teachers qualified for this subject.
    pub subject_id: Option<String>,
    /// Case-insensitive name fragment.
    pub search: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassSubject {
    pub class_id: String,
    pub subject_id: String,
    pub subject_name: String,
    pub teacher_id: Option<String>,
    pub teacher_name: Option<String>,
    pub coefficient: i64,
}

/// Persistence collaborator of the grade-entry workflow.
///
/// The workflow only talks to storage through this trait; every call is a
/// single round trip and may fail without side effects on the caller.
pub trait GradeStore {
    /// Value-only update. Status is left untouched.
    fn update_grade(&self, id: &str, value: GradeValue) -> Result<GradeRecord, StoreError>;

    /// Creates one `draft` row per entry in a single batch. Existing rows of the
    /// same evaluation are overwritten while they are still editable.
    fn create_bulk_grades(
        &self,
        ctx: &EvaluationContext,
        grades: &[NewGrade],
    ) -> Result<Vec<GradeRecord>, StoreError>;

    /// `draft -> submitted` for the given ids. Returns how many rows moved.
    fn submit_grades_for_validation(&self, grade_ids: &[String]) -> Result<usize, StoreError>;

    /// Deletes the `draft` rows of one evaluation. Returns how many were deleted.
    fn delete_draft_grades(&self, key: &ContextKey) -> Result<usize, StoreError>;

    fn assign_teacher(
        &self,
        class_id: &str,
        subject_id: &str,
        teacher_id: &str,
    ) -> Result<(), StoreError>;

    fn list_teachers(&self, filter: &TeacherFilter) -> Result<Vec<Teacher>, StoreError>;

    fn list_class_subjects(&self, class_id: &str) -> Result<Vec<ClassSubject>, StoreError>;

    fn list_students(&self, class_id: &str) -> Result<Vec<Student>, StoreError>;

    fn grades_for_context(&self, key: &ContextKey) -> Result<Vec<GradeRecord>, StoreError>;
}
