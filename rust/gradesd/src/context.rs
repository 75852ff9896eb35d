use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::grade::GradeType;

/// Identity of one grading exercise. Pending edits and the statistics view are
/// keyed by this value; a different key means a different buffer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextKey {
    pub class_id: String,
    pub subject_id: String,
    pub term_id: String,
    #[serde(rename = "type")]
    pub grade_type: GradeType,
    pub description: Option<String>,
    pub grade_date: NaiveDate,
}

impl ContextKey {
    pub fn new(
        class_id: impl Into<String>,
        subject_id: impl Into<String>,
        term_id: impl Into<String>,
        grade_type: GradeType,
        description: Option<&str>,
        grade_date: NaiveDate,
    ) -> Self {
        ContextKey {
            class_id: class_id.into(),
            subject_id: subject_id.into(),
            term_id: term_id.into(),
            grade_type,
            description: normalize_description(description),
            grade_date,
        }
    }

    /// Description as stored; the store keeps "" for "no description".
    pub fn description_text(&self) -> &str {
        self.description.as_deref().unwrap_or("")
    }
}

/// Blank descriptions and missing descriptions are the same evaluation.
pub fn normalize_description(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EvaluationContext {
    #[serde(flatten)]
    key: ContextKey,
    teacher_id: Option<String>,
    weight: u32,
}

impl EvaluationContext {
    pub fn new(key: ContextKey, teacher_id: Option<String>, weight: u32) -> Result<Self, String> {
        if weight == 0 {
            return Err("weight must be a positive integer".to_string());
        }
        let teacher_id = teacher_id.filter(|t| !t.trim().is_empty());
        Ok(EvaluationContext {
            key,
            teacher_id,
            weight,
        })
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    pub fn teacher_id(&self) -> Option<&str> {
        self.teacher_id.as_deref()
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Same evaluation, new grading teacher. The key is unchanged so buffered
    /// edits stay attached.
    pub fn with_teacher(&self, teacher_id: impl Into<String>) -> Self {
        EvaluationContext {
            key: self.key.clone(),
            teacher_id: Some(teacher_id.into()),
            weight: self.weight,
        }
    }
}
