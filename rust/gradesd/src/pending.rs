use std::collections::BTreeMap;

use crate::context::ContextKey;
use crate::grade::GradeValue;

/// Unsaved `studentId -> value` edits for exactly one evaluation.
///
/// A buffer is never re-keyed: a new evaluation gets a new buffer.
#[derive(Debug, Clone)]
pub struct PendingChanges {
    key: ContextKey,
    values: BTreeMap<String, GradeValue>,
}

impl PendingChanges {
    pub fn new(key: ContextKey) -> Self {
        PendingChanges {
            key,
            values: BTreeMap::new(),
        }
    }

    pub fn key(&self) -> &ContextKey {
        &self.key
    }

    /// Last write wins.
    pub fn upsert(&mut self, student_id: &str, value: GradeValue) -> Option<GradeValue> {
        self.values.insert(student_id.to_string(), value)
    }

    pub fn remove(&mut self, student_id: &str) -> Option<GradeValue> {
        self.values.remove(student_id)
    }

    pub fn get(&self, student_id: &str) -> Option<GradeValue> {
        self.values.get(student_id).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, GradeValue)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }
}
