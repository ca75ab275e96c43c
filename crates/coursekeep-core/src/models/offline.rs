//! Bookkeeping for course content downloaded for offline use.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum AssetKind {
    Image,
    Audio,
    Video,
}

/// One downloaded media file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct AssetInfo {
    pub url: String,
    #[serde(rename = "type")]
    pub kind: AssetKind,
    /// Bytes.
    pub size: u64,
}

/// What is stored offline for one course, keyed by `course_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct StorageMeta {
    pub course_id: String,
    #[serde(default)]
    pub unit_ids: Vec<String>,
    #[serde(default)]
    pub lesson_ids: Vec<String>,
    #[serde(default)]
    pub assets: Vec<AssetInfo>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub last_accessed: DateTime<Utc>,
    pub priority: u32,
}

impl StorageMeta {
    pub fn new(course_id: impl Into<String>, last_accessed: DateTime<Utc>) -> Self {
        Self {
            course_id: course_id.into(),
            unit_ids: Vec::new(),
            lesson_ids: Vec::new(),
            assets: Vec::new(),
            last_accessed,
            priority: 0,
        }
    }

    /// Total bytes of the course's downloaded assets.
    pub fn asset_bytes(&self) -> u64 {
        self.assets.iter().map(|a| a.size).sum()
    }
}
