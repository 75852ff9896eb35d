use serde::Serialize;
use std::collections::BTreeMap;

use crate::grade::{GradeRecord, GradeType};

pub const PASS_THRESHOLD: f64 = 10.0;
pub const HONOURS_THRESHOLD: f64 = 15.0;

/// Two-decimal rounding used for every displayed statistic.
pub fn round_2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeStatistics {
    pub count: usize,
    /// Unrounded; callers round for display.
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub below10: usize,
    pub above15: usize,
}

impl GradeStatistics {
    /// Share of grades at or above the pass mark, as a whole percentage.
    pub fn pass_rate(&self) -> u32 {
        if self.count == 0 {
            return 0;
        }
        let passed = (self.count - self.below10) as f64;
        (passed / self.count as f64 * 100.0).round() as u32
    }
}

pub fn compute_statistics<I>(values: I) -> GradeStatistics
where
    I: IntoIterator<Item = f64>,
{
    let mut count = 0usize;
    let mut sum = 0.0;
    let mut min = f64::INFINITY;
    let mut max = f64::NEG_INFINITY;
    let mut below10 = 0usize;
    let mut above15 = 0usize;

    for v in values {
        count += 1;
        sum += v;
        min = min.min(v);
        max = max.max(v);
        if v < PASS_THRESHOLD {
            below10 += 1;
        }
        if v >= HONOURS_THRESHOLD {
            above15 += 1;
        }
    }

    if count == 0 {
        return GradeStatistics::default();
    }

    GradeStatistics {
        count,
        average: sum / count as f64,
        min,
        max,
        below10,
        above15,
    }
}

/// Sample standard deviation; undefined below two values.
fn sample_std_dev(values: &[f64]) -> Option<f64> {
    if values.len() < 2 {
        return None;
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(var.sqrt())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ClassStatisticsRow {
    pub subject_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subject_name: Option<String>,
    pub grade_type: GradeType,
    pub count: usize,
    pub average: f64,
    pub min: f64,
    pub max: f64,
    pub std_dev: Option<f64>,
    pub below10: usize,
    pub above15: usize,
}

/// Per (subject, type) statistics of already validated grades.
///
/// Records in any other status are ignored.
pub fn class_statistics(records: &[GradeRecord]) -> Vec<ClassStatisticsRow> {
    let mut groups: BTreeMap<(&str, GradeType), Vec<f64>> = BTreeMap::new();
    for r in records
        .iter()
        .filter(|r| r.status == crate::grade::GradeStatus::Validated)
    {
        groups
            .entry((r.subject_id.as_str(), r.grade_type))
            .or_default()
            .push(r.value);
    }

    groups
        .into_iter()
        .map(|((subject_id, grade_type), values)| {
            let stats = compute_statistics(values.iter().copied());
            ClassStatisticsRow {
                subject_id: subject_id.to_string(),
                subject_name: None,
                grade_type,
                count: stats.count,
                average: round_2(stats.average),
                min: stats.min,
                max: stats.max,
                std_dev: sample_std_dev(&values).map(round_2),
                below10: stats.below10,
                above15: stats.above15,
            }
        })
        .collect()
}

/// `Σ(value·weight) / Σweight`, or `None` when nothing carries weight.
pub fn weighted_average<I>(entries: I) -> Option<f64>
where
    I: IntoIterator<Item = (f64, u32)>,
{
    let mut num = 0.0;
    let mut den = 0u64;
    for (value, weight) in entries {
        num += value * f64::from(weight);
        den += u64::from(weight);
    }
    if den == 0 {
        None
    } else {
        Some(num / den as f64)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StudentAverage {
    pub student_id: String,
    pub average: f64,
    pub total_weight: u64,
    pub grade_count: usize,
}

/// Weighted average per student over validated grades.
pub fn student_averages(records: &[GradeRecord]) -> Vec<StudentAverage> {
    let mut by_student: BTreeMap<&str, Vec<(f64, u32)>> = BTreeMap::new();
    for r in records
        .iter()
        .filter(|r| r.status == crate::grade::GradeStatus::Validated)
    {
        by_student
            .entry(r.student_id.as_str())
            .or_default()
            .push((r.value, r.weight));
    }

    by_student
        .into_iter()
        .filter_map(|(student_id, entries)| {
            let average = weighted_average(entries.iter().copied())?;
            Some(StudentAverage {
                student_id: student_id.to_string(),
                average: round_2(average),
                total_weight: entries.iter().map(|(_, w)| u64::from(*w)).sum(),
                grade_count: entries.len(),
            })
        })
        .collect()
}
