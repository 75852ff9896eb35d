use serde::Serialize;

use crate::grade::GradeValue;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid grade: {input:?} is not a number")]
    NotANumber { input: String },
    #[error("invalid grade: {value} is outside 0..20")]
    OutOfRange { value: f64 },
    #[error("invalid grade: {value} is not a multiple of 0.25")]
    NotQuarterPoint { value: f64 },
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        "invalid_grade"
    }
}

/// Parses raw grade input. `Ok(None)` means "no value yet".
pub fn validate(raw: &str) -> Result<Option<GradeValue>, ValidationError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    let parsed = trimmed
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| ValidationError::NotANumber {
            input: trimmed.to_string(),
        })?;
    GradeValue::new(parsed).map(Some)
}

/// Input state of one grade cell: the text as typed and the error on display.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeInput {
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl GradeInput {
    #[cfg(test)]
    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Validates `raw` and hands an accepted value to `on_accept`.
    ///
    /// Empty input clears the error without calling back. Invalid input keeps
    /// the text, records the error and returns it.
    pub fn commit<F>(&mut self, raw: &str, on_accept: F) -> Result<(), ValidationError>
    where
        F: FnOnce(GradeValue),
    {
        self.text = raw.to_string();
        match validate(raw) {
            Ok(None) => {
                self.error = None;
                Ok(())
            }
            Ok(Some(v)) => {
                self.error = None;
                on_accept(v);
                Ok(())
            }
            Err(e) => {
                self.error = Some(e.to_string());
                Err(e)
            }
        }
    }
}
