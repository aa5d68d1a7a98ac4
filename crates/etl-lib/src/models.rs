//! Core data models for the ETL pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A list of independent series, each ordered ascending by time
pub type Matrix = Vec<Series>;

/// One time-ordered series of points (last element = most recent)
pub type Series = Vec<TransformationResult>;

/// Anything that can be stored in a [`crate::cache::Cache`]
pub trait Cacheable {
    /// Stable key the value is stored under
    fn cache_key(&self) -> String;
}

/// Alert severity assigned by the threshold transforms
///
/// The numeric value of a classified point is the severity's ordinal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Ok,
    Info,
    Warn,
    Crit,
}

impl Severity {
    /// Numeric value written into a classified point
    pub fn value(&self) -> f64 {
        match self {
            Severity::Ok => 0.0,
            Severity::Info => 1.0,
            Severity::Warn => 2.0,
            Severity::Crit => 3.0,
        }
    }

    /// Short code stored as the point's message code
    pub fn code(&self) -> &'static str {
        match self {
            Severity::Ok => "OK",
            Severity::Info => "INFO",
            Severity::Warn => "WARN",
            Severity::Crit => "CRIT",
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Metadata carried alongside every point
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_code: Option<String>,
    #[serde(default)]
    pub messages: Vec<String>,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
}

/// A data point as it flows from extract, through transforms, into load
///
/// Transforms never modify a point in place; the `with_*` methods return
/// an updated copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationResult {
    pub time: DateTime<Utc>,
    pub name: String,
    pub value: f64,
    pub original_value: f64,
    #[serde(default)]
    pub metadata: ResultMetadata,
}

impl TransformationResult {
    /// Create a freshly extracted point (value and original value are equal)
    pub fn new(time: DateTime<Utc>, name: impl Into<String>, value: f64) -> Self {
        Self {
            time,
            name: name.into(),
            value,
            original_value: value,
            metadata: ResultMetadata::default(),
        }
    }

    /// Attach tags at extraction time
    pub fn with_tags(mut self, tags: BTreeMap<String, String>) -> Self {
        self.metadata.tags = tags;
        self
    }

    /// Copy with a new value, keeping the original value and metadata
    pub fn with_value(&self, value: f64) -> Self {
        Self {
            value,
            ..self.clone()
        }
    }

    /// Copy with an extra message appended
    pub fn with_message(&self, message: impl Into<String>) -> Self {
        let mut copy = self.clone();
        copy.metadata.messages.push(message.into());
        copy
    }

    /// Copy reclassified to the given severity
    pub fn classified(&self, severity: Severity) -> Self {
        let mut copy = self.with_value(severity.value());
        copy.metadata.message_code = Some(severity.code().to_string());
        copy
    }

    /// Copy reclassified to the given severity with an explanation appended
    pub fn classified_with_message(&self, severity: Severity, message: impl Into<String>) -> Self {
        let mut copy = self.classified(severity);
        copy.metadata.messages.push(message.into());
        copy
    }
}

/// One raw point as read from a configuration or an HTTP response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointDocument {
    pub time: DateTime<Utc>,
    pub value: f64,
}

/// One raw series: `{name, tags?, points: [{time, value}]}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesDocument {
    pub name: String,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub points: Vec<PointDocument>,
}

impl SeriesDocument {
    /// Convert into a time-ascending series of extracted points
    pub fn into_series(self) -> Series {
        let mut points = self.points;
        points.sort_by_key(|p| p.time);

        points
            .into_iter()
            .map(|p| TransformationResult::new(p.time, self.name.clone(), p.value).with_tags(self.tags.clone()))
            .collect()
    }
}
