//! Stateless per-point threshold classification

use super::{format_value, name_matches, ComparisonType, Transform};
use crate::models::{Matrix, Series, Severity, TransformationResult};
use serde::{Deserialize, Serialize};

/// Classifies each point against critical, warning and info thresholds
///
/// Thresholds are checked from most to least severe and the first hit wins.
/// Without a comparison type every point is reclassified as OK.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdTransform {
    #[serde(rename = "type", default)]
    pub comparison: Option<ComparisonType>,
    #[serde(default)]
    pub critical_threshold: Option<f64>,
    #[serde(default)]
    pub warning_threshold: Option<f64>,
    #[serde(default)]
    pub info_threshold: Option<f64>,
    #[serde(default)]
    pub apply_to_metric_name: Option<String>,
}

impl ThresholdTransform {
    pub fn classify(&self, point: &TransformationResult) -> TransformationResult {
        if !name_matches(&self.apply_to_metric_name, &point.name) {
            return point.clone();
        }

        let Some(comparison) = self.comparison else {
            return point.classified(Severity::Ok);
        };

        let tiers = [
            (Severity::Crit, self.critical_threshold),
            (Severity::Warn, self.warning_threshold),
            (Severity::Info, self.info_threshold),
        ];

        for (severity, threshold) in tiers {
            let Some(threshold) = threshold else { continue };
            if comparison.hits(point.value, threshold) {
                let message = format!(
                    "{}: {} value {} is {} threshold {}",
                    severity.code(),
                    point.name,
                    format_value(point.original_value),
                    comparison,
                    format_value(threshold)
                );
                return point.classified_with_message(severity, message);
            }
        }

        point.classified(Severity::Ok)
    }
}

impl Transform for ThresholdTransform {
    fn transform(&self, matrix: &[Series]) -> Matrix {
        matrix
            .iter()
            .map(|series| series.iter().map(|p| self.classify(p)).collect())
            .collect()
    }
}
