//! Summarizing transforms

use super::{name_matches, Transform};
use crate::models::{Matrix, Series, Severity, TransformationResult};
use serde::{Deserialize, Serialize};

/// Keeps only the highest-valued point of each series
///
/// Ties go to the most recent point. With `acrossSeries` the whole matrix
/// collapses into a single one-point series.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HighestValue {
    #[serde(default)]
    pub across_series: bool,
}

fn highest<'a>(points: impl Iterator<Item = &'a TransformationResult>) -> Option<&'a TransformationResult> {
    points.fold(None, |best, p| match best {
        Some(b) if b.value > p.value => Some(b),
        _ => Some(p),
    })
}

impl Transform for HighestValue {
    fn transform(&self, matrix: &[Series]) -> Matrix {
        let per_series: Vec<&TransformationResult> =
            matrix.iter().filter_map(|s| highest(s.iter())).collect();

        if self.across_series {
            highest(per_series.into_iter())
                .map(|p| vec![vec![p.clone()]])
                .unwrap_or_default()
        } else {
            per_series.into_iter().map(|p| vec![p.clone()]).collect()
        }
    }
}

/// Reclassifies points as INFO with a fixed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InfoStatus {
    pub message: String,
    #[serde(default)]
    pub apply_to_metric_name: Option<String>,
}

impl Transform for InfoStatus {
    fn transform(&self, matrix: &[Series]) -> Matrix {
        matrix
            .iter()
            .map(|series| {
                series
                    .iter()
                    .map(|p| {
                        if name_matches(&self.apply_to_metric_name, &p.name) {
                            p.classified_with_message(Severity::Info, self.message.clone())
                        } else {
                            p.clone()
                        }
                    })
                    .collect()
            })
            .collect()
    }
}
