//! Transforms applied to the extracted matrix
//!
//! Every transform is a pure function from a matrix to a new matrix. The
//! threshold transforms classify points into [`Severity`] levels:
//! - `threshold`: each point on its own
//! - `inertiaThreshold` / `thresholdMetForDuration`: a whole series reduced
//!   to its current status, taking into account how long the condition held
//! - `highestValue` / `infoStatus`: summarizing helpers

mod inertia;
mod summary;
mod threshold;

pub use inertia::{InertiaThreshold, ThresholdMetForDuration};
pub use summary::{HighestValue, InfoStatus};
pub use threshold::ThresholdTransform;

use crate::models::{Matrix, Series, Severity};
use serde::{Deserialize, Serialize};

/// A pure matrix-to-matrix function
pub trait Transform: Send + Sync {
    fn transform(&self, matrix: &[Series]) -> Matrix;
}

/// Direction used to decide whether a value hits a threshold
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ComparisonType {
    GreaterThanOrEqual,
    LessThanOrEqual,
}

impl ComparisonType {
    pub fn hits(&self, value: f64, threshold: f64) -> bool {
        match self {
            ComparisonType::GreaterThanOrEqual => value >= threshold,
            ComparisonType::LessThanOrEqual => value <= threshold,
        }
    }

    pub fn symbol(&self) -> &'static str {
        match self {
            ComparisonType::GreaterThanOrEqual => ">=",
            ComparisonType::LessThanOrEqual => "<=",
        }
    }
}

impl std::fmt::Display for ComparisonType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ComparisonType::GreaterThanOrEqual => write!(f, "GREATER_THAN_OR_EQUAL"),
            ComparisonType::LessThanOrEqual => write!(f, "LESS_THAN_OR_EQUAL"),
        }
    }
}

/// Transform configuration, tagged by `_type`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "_type", rename_all = "camelCase")]
pub enum TransformSpec {
    Threshold(ThresholdTransform),
    InertiaThreshold(InertiaThreshold),
    ThresholdMetForDuration(ThresholdMetForDuration),
    HighestValue(HighestValue),
    InfoStatus(InfoStatus),
}

impl TransformSpec {
    pub fn as_transform(&self) -> &dyn Transform {
        match self {
            TransformSpec::Threshold(t) => t,
            TransformSpec::InertiaThreshold(t) => t,
            TransformSpec::ThresholdMetForDuration(t) => t,
            TransformSpec::HighestValue(t) => t,
            TransformSpec::InfoStatus(t) => t,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            TransformSpec::Threshold(_) => "threshold",
            TransformSpec::InertiaThreshold(_) => "inertiaThreshold",
            TransformSpec::ThresholdMetForDuration(_) => "thresholdMetForDuration",
            TransformSpec::HighestValue(_) => "highestValue",
            TransformSpec::InfoStatus(_) => "infoStatus",
        }
    }
}

/// Run the transforms in order, feeding each one the previous output
pub fn apply_chain(specs: &[TransformSpec], matrix: Matrix) -> Matrix {
    specs
        .iter()
        .fold(matrix, |acc, spec| spec.as_transform().transform(&acc))
}

/// True when the filter is unset or equals the metric name
pub(crate) fn name_matches(filter: &Option<String>, name: &str) -> bool {
    filter.as_deref().map(|f| f == name).unwrap_or(true)
}

/// Values in messages keep two decimals
pub(crate) fn format_value(value: f64) -> String {
    format!("{value:.2}")
}

/// Render an elapsed duration as `DDdays HHh:MMm:SSs`, dropping zero days
pub fn format_elapsed(elapsed: chrono::Duration) -> String {
    let total = elapsed.num_seconds().max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    if days > 0 {
        format!("{days:02}days {hours:02}h:{minutes:02}m:{seconds:02}s")
    } else {
        format!("{hours:02}h:{minutes:02}m:{seconds:02}s")
    }
}

/// Highest severity present in a matrix, by classified value
pub fn worst_severity(matrix: &[Series]) -> Severity {
    matrix
        .iter()
        .flatten()
        .map(|p| match p.value {
            v if v >= Severity::Crit.value() => Severity::Crit,
            v if v >= Severity::Warn.value() => Severity::Warn,
            v if v >= Severity::Info.value() => Severity::Info,
            _ => Severity::Ok,
        })
        .max()
        .unwrap_or(Severity::Ok)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TransformationResult;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_format_elapsed_without_days() {
        assert_eq!(format_elapsed(chrono::Duration::seconds(3_723)), "01h:02m:03s");
        assert_eq!(format_elapsed(chrono::Duration::zero()), "00h:00m:00s");
    }

    #[test]
    fn test_format_elapsed_with_days() {
        let d = chrono::Duration::days(2) + chrono::Duration::seconds(3_723);
        assert_eq!(format_elapsed(d), "02days 01h:02m:03s");
    }

    #[test]
    fn test_unknown_transform_tag_rejected() {
        let result: Result<TransformSpec, _> =
            serde_json::from_str(r#"{"_type": "movingAverage", "window": 3}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_chain_applies_in_order() {
        let specs: Vec<TransformSpec> = serde_json::from_str(
            r#"[
                {"_type": "threshold", "type": "GREATER_THAN_OR_EQUAL", "criticalThreshold": 10, "warningThreshold": 5},
                {"_type": "highestValue", "acrossSeries": true}
            ]"#,
        )
        .unwrap();

        let t = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let matrix = vec![
            vec![TransformationResult::new(t, "a", 6.0)],
            vec![TransformationResult::new(t, "b", 12.0)],
        ];

        let out = apply_chain(&specs, matrix);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0][0].name, "b");
        assert_eq!(out[0][0].value, Severity::Crit.value());
        assert_eq!(worst_severity(&out), Severity::Crit);
    }
}
