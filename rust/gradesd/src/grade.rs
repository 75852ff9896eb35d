use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::context::ContextKey;
use crate::validate::ValidationError;

pub const GRADE_MIN: f64 = 0.0;
pub const GRADE_MAX: f64 = 20.0;
/// Grades are entered in quarter points.
pub const GRADE_STEPS_PER_POINT: f64 = 4.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeStatus {
    Draft,
    Submitted,
    Validated,
    Rejected,
}

impl GradeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            GradeStatus::Draft => "draft",
            GradeStatus::Submitted => "submitted",
            GradeStatus::Validated => "validated",
            GradeStatus::Rejected => "rejected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(GradeStatus::Draft),
            "submitted" => Some(GradeStatus::Submitted),
            "validated" => Some(GradeStatus::Validated),
            "rejected" => Some(GradeStatus::Rejected),
            _ => None,
        }
    }

    /// Only drafts and rejected grades accept value edits.
    pub fn is_editable(self) -> bool {
        matches!(self, GradeStatus::Draft | GradeStatus::Rejected)
    }

    /// Single-step transitions of the grade life cycle. No transition skips a state.
    pub fn can_transition_to(self, next: GradeStatus) -> bool {
        matches!(
            (self, next),
            (GradeStatus::Draft, GradeStatus::Submitted)
                | (GradeStatus::Submitted, GradeStatus::Validated)
                | (GradeStatus::Submitted, GradeStatus::Rejected)
                | (GradeStatus::Rejected, GradeStatus::Draft)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GradeType {
    Quiz,
    Test,
    Exam,
    Participation,
    Homework,
    Project,
}

impl GradeType {
    pub const ALL: [GradeType; 6] = [
        GradeType::Quiz,
        GradeType::Test,
        GradeType::Exam,
        GradeType::Participation,
        GradeType::Homework,
        GradeType::Project,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            GradeType::Quiz => "quiz",
            GradeType::Test => "test",
            GradeType::Exam => "exam",
            GradeType::Participation => "participation",
            GradeType::Homework => "homework",
            GradeType::Project => "project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        GradeType::ALL.into_iter().find(|t| t.as_str() == s)
    }
}

/// A grade value that passed range and granularity checks.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize)]
#[serde(transparent)]
pub struct GradeValue(f64);

impl GradeValue {
    pub fn new(value: f64) -> Result<Self, ValidationError> {
        if !value.is_finite() {
            return Err(ValidationError::NotANumber {
                input: value.to_string(),
            });
        }
        if !(GRADE_MIN..=GRADE_MAX).contains(&value) {
            return Err(ValidationError::OutOfRange { value });
        }
        if (value * GRADE_STEPS_PER_POINT).fract() != 0.0 {
            return Err(ValidationError::NotQuarterPoint { value });
        }
        Ok(GradeValue(value))
    }

    pub fn get(self) -> f64 {
        self.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeRecord {
    pub id: String,
    pub student_id: String,
    pub class_id: String,
    pub subject_id: String,
    pub term_id: String,
    pub teacher_id: String,
    pub value: f64,
    #[serde(rename = "type")]
    pub grade_type: GradeType,
    pub weight: u32,
    pub description: Option<String>,
    pub grade_date: NaiveDate,
    pub status: GradeStatus,
    pub rejection_reason: Option<String>,
    pub submitted_at: Option<String>,
    pub validated_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl GradeRecord {
    pub fn belongs_to(&self, key: &ContextKey) -> bool {
        self.class_id == key.class_id
            && self.subject_id == key.subject_id
            && self.term_id == key.term_id
            && self.grade_type == key.grade_type
            && self.description == key.description
            && self.grade_date == key.grade_date
    }
}
