//! Time-windowed threshold classification
//!
//! A series is reduced to one point describing its current status. A level
//! is only raised once the threshold has been met continuously for that
//! level's window, measured back from the most recent point.

use super::{format_elapsed, format_value, name_matches, ComparisonType, Transform};
use crate::models::{Matrix, Series, Severity, TransformationResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Raises CRIT after `criticalInertiaMillis` and WARN after `warnInertiaMillis`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InertiaThreshold {
    #[serde(rename = "type")]
    pub comparison: ComparisonType,
    pub threshold: f64,
    pub critical_inertia_millis: u64,
    #[serde(default)]
    pub warn_inertia_millis: Option<u64>,
    #[serde(default)]
    pub apply_to_metric_name: Option<String>,
}

/// Like [`InertiaThreshold`] with an additional INFO window; every window is optional
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdMetForDuration {
    #[serde(rename = "type")]
    pub comparison: ComparisonType,
    pub threshold: f64,
    #[serde(default)]
    pub critical_duration_millis: Option<u64>,
    #[serde(default)]
    pub warn_duration_millis: Option<u64>,
    #[serde(default)]
    pub info_duration_millis: Option<u64>,
    #[serde(default)]
    pub apply_to_metric_name: Option<String>,
}

/// Windows after which each level is raised
#[derive(Debug, Clone, Copy, Default)]
struct Windows {
    critical: Option<Duration>,
    warn: Option<Duration>,
    info: Option<Duration>,
}

fn millis(ms: u64) -> Duration {
    Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

fn at_or_before(time: DateTime<Utc>, cutoff: Option<DateTime<Utc>>) -> bool {
    cutoff.map(|c| time <= c).unwrap_or(false)
}

/// Walk a time-ascending series backward from its most recent point
///
/// Returns `None` for an empty series.
fn classify_window(
    series: &[TransformationResult],
    comparison: ComparisonType,
    threshold: f64,
    windows: Windows,
) -> Option<TransformationResult> {
    let latest = series.last()?;
    let t0 = latest.time;
    let cutoff = |window: Option<Duration>| window.and_then(|d| t0.checked_sub_signed(d));
    let crit_cutoff = cutoff(windows.critical);
    let warn_cutoff = cutoff(windows.warn);
    let info_cutoff = cutoff(windows.info);

    let raise = |severity: Severity, since: DateTime<Utc>| {
        let message = format!(
            "{}: {} {} {} for {} (current value {})",
            severity.code(),
            latest.name,
            comparison.symbol(),
            format_value(threshold),
            format_elapsed(t0 - since),
            format_value(latest.original_value)
        );
        latest.classified_with_message(severity, message)
    };

    let mut warn_eligible = false;
    let mut info_eligible = false;

    for point in series.iter().rev() {
        if !comparison.hits(point.value, threshold) {
            return Some(if at_or_before(point.time, warn_cutoff) {
                raise(Severity::Warn, point.time)
            } else if at_or_before(point.time, info_cutoff) {
                raise(Severity::Info, point.time)
            } else {
                point.classified(Severity::Ok)
            });
        }

        if at_or_before(point.time, crit_cutoff) {
            return Some(raise(Severity::Crit, point.time));
        }
        warn_eligible |= at_or_before(point.time, warn_cutoff);
        info_eligible |= at_or_before(point.time, info_cutoff);
    }

    // History shorter than the critical window: settle for the best tier reached
    let oldest = series[0].time;
    Some(if warn_eligible {
        raise(Severity::Warn, oldest)
    } else if info_eligible {
        raise(Severity::Info, oldest)
    } else {
        latest.classified(Severity::Ok)
    })
}

fn reduce_matrix(
    matrix: &[Series],
    filter: &Option<String>,
    reduce: impl Fn(&[TransformationResult]) -> Option<TransformationResult>,
) -> Matrix {
    matrix
        .iter()
        .filter_map(|series| {
            let latest = series.last()?;
            if !name_matches(filter, &latest.name) {
                return Some(series.clone());
            }
            reduce(series).map(|point| vec![point])
        })
        .collect()
}

impl InertiaThreshold {
    pub fn classify(&self, series: &[TransformationResult]) -> Option<TransformationResult> {
        let windows = Windows {
            critical: Some(millis(self.critical_inertia_millis)),
            warn: self.warn_inertia_millis.map(millis),
            info: None,
        };
        classify_window(series, self.comparison, self.threshold, windows)
    }
}

impl Transform for InertiaThreshold {
    fn transform(&self, matrix: &[Series]) -> Matrix {
        reduce_matrix(matrix, &self.apply_to_metric_name, |s| self.classify(s))
    }
}

impl ThresholdMetForDuration {
    pub fn classify(&self, series: &[TransformationResult]) -> Option<TransformationResult> {
        let windows = Windows {
            critical: self.critical_duration_millis.map(millis),
            warn: self.warn_duration_millis.map(millis),
            info: self.info_duration_millis.map(millis),
        };
        classify_window(series, self.comparison, self.threshold, windows)
    }
}

impl Transform for ThresholdMetForDuration {
    fn transform(&self, matrix: &[Series]) -> Matrix {
        reduce_matrix(matrix, &self.apply_to_metric_name, |s| self.classify(s))
    }
}
