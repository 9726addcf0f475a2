//! Task record model: stored document <-> in-memory task.
//!
//! Document field names follow the producer's schema:
//! `deadline`, `mqttMessage`, `mqttTopic`, `status`.
//!
//! Decode policy:
//! - missing fields fall back to defaults (`None` / empty string / `Unknown`)
//! - a present field with the wrong shape fails the whole record with
//!   `RecordError::Malformed`; the dispatch loop skips such documents and
//!   leaves them pending.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use super::TaskRef;

/// Raw document as held by a store (field name -> JSON value).
pub type Document = serde_json::Map<String, Value>;

pub(crate) const FIELD_STATUS: &str = "status";
pub(crate) const FIELD_DEADLINE: &str = "deadline";

/// Task status.
///
/// `Pending -> Processed` is the only transition this system performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processed,

    /// Missing or unrecognised status string. Never eligible for dispatch.
    #[default]
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processed => "processed",
            TaskStatus::Unknown => "unknown",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scheduled unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TaskRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline: Option<DateTime<Utc>>,

    /// Opaque payload, delivered verbatim.
    #[serde(rename = "mqttMessage", default)]
    pub message: String,

    #[serde(rename = "mqttTopic", default)]
    pub topic: String,

    #[serde(default)]
    pub status: TaskStatus,
}

/// RecordError は document -> TaskRecord の変換エラー
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("malformed task document: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl TaskRecord {
    /// A freshly produced task (`status = pending`).
    pub fn pending(
        deadline: DateTime<Utc>,
        topic: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            deadline: Some(deadline),
            message: message.into(),
            topic: topic.into(),
            status: TaskStatus::Pending,
        }
    }

    /// `status == pending AND deadline <= now`
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.deadline.is_some_and(|deadline| deadline <= now)
    }

    pub fn from_document(document: &Document) -> Result<Self, RecordError> {
        Ok(serde_json::from_value(Value::Object(document.clone()))?)
    }

    pub fn to_document(&self) -> Document {
        match serde_json::to_value(self) {
            Ok(Value::Object(document)) => document,
            _ => Document::new(),
        }
    }
}

/// A document yielded by a due-task query, with the reference needed for the
/// later status update.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDocument {
    pub reference: TaskRef,
    pub fields: Document,
}

impl TaskDocument {
    pub fn new(reference: TaskRef, fields: Document) -> Self {
        Self { reference, fields }
    }

    pub fn decode(&self) -> Result<TaskRecord, RecordError> {
        TaskRecord::from_document(&self.fields)
    }
}

/// Raw `status` string of a document, if present.
pub(crate) fn document_status(document: &Document) -> Option<&str> {
    document.get(FIELD_STATUS).and_then(Value::as_str)
}

/// Parsed `deadline` of a document, if present and a valid RFC 3339 timestamp.
pub(crate) fn document_deadline(document: &Document) -> Option<DateTime<Utc>> {
    document
        .get(FIELD_DEADLINE)
        .and_then(Value::as_str)
        .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
        .map(|deadline| deadline.with_timezone(&Utc))
}

/// Store-side eligibility filter, evaluated on the raw document.
pub(crate) fn document_is_due(document: &Document, now: DateTime<Utc>) -> bool {
    document_status(document) == Some(TaskStatus::Pending.as_str())
        && document_deadline(document).is_some_and(|deadline| deadline <= now)
}
