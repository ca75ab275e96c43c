//! Versioned progress record decoding.
//!
//! Each persisted schema version has its own variant. Decoding dispatches on
//! the `version` field and `upgrade` walks older variants forward by filling
//! defaulted fields; existing fields keep their meaning.

use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use thiserror::Error;

use crate::models::progress::deserialize_progress;
use crate::models::{LessonFields, ProgressRecord, SyncStatus, SCHEMA_VERSION};

#[derive(Error, Debug)]
pub enum SchemaError {
    #[error("Malformed record JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Record is not a JSON object")]
    NotAnObject,
}

/// Records written before schema versioning settled: no `version` or an
/// older one. Only `progress` is required.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyRecord {
    #[serde(deserialize_with = "deserialize_progress")]
    pub progress: u8,
    #[serde(default)]
    pub is_completed: bool,
    #[serde(default)]
    pub is_locked: Option<bool>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, with = "chrono::serde::ts_milliseconds_option")]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub sync_status: Option<SyncStatus>,
    #[serde(default)]
    pub last_accessed_lesson: Option<String>,
    #[serde(flatten)]
    pub lesson: LessonFields,
}

impl LegacyRecord {
    fn upgrade(self, now: DateTime<Utc>, ttl: Duration) -> ProgressRecord {
        let timestamp = self.timestamp.unwrap_or(now);
        ProgressRecord {
            progress: self.progress,
            is_completed: self.is_completed,
            is_locked: self.is_locked.unwrap_or(false),
            timestamp,
            expires_at: self.expires_at.unwrap_or(timestamp + ttl),
            version: SCHEMA_VERSION.to_string(),
            sync_status: self.sync_status.unwrap_or_default(),
            last_accessed_lesson: self.last_accessed_lesson,
            lesson: self.lesson,
        }
    }
}

#[derive(Debug, Clone)]
pub enum VersionedRecord {
    Legacy(LegacyRecord),
    V1(ProgressRecord),
}

impl VersionedRecord {
    pub fn decode(raw: &str) -> Result<Self, SchemaError> {
        let value: serde_json::Value = serde_json::from_str(raw)?;
        if !value.is_object() {
            return Err(SchemaError::NotAnObject);
        }

        let version = value.get("version").and_then(|v| v.as_str());
        if version == Some(SCHEMA_VERSION) {
            Ok(VersionedRecord::V1(serde_json::from_value(value)?))
        } else {
            Ok(VersionedRecord::Legacy(serde_json::from_value(value)?))
        }
    }

    /// Version string as stored, `None` for unversioned legacy records.
    pub fn stored_version(&self) -> Option<&str> {
        match self {
            VersionedRecord::Legacy(record) => record.version.as_deref(),
            VersionedRecord::V1(record) => Some(record.version.as_str()),
        }
    }

    pub fn is_current(&self) -> bool {
        matches!(self, VersionedRecord::V1(_))
    }

    /// Bring the record up to the current schema. `ttl` fills a missing
    /// expiry relative to the record's own timestamp.
    pub fn upgrade(self, now: DateTime<Utc>, ttl: Duration) -> ProgressRecord {
        match self {
            VersionedRecord::Legacy(record) => record.upgrade(now, ttl),
            VersionedRecord::V1(record) => record,
        }
    }
}
