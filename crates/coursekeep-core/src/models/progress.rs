//! Progress records for the course → unit → lesson hierarchy.
//!
//! Records are persisted as camelCase JSON with millisecond epoch timestamps
//! so they stay readable by the web client that shares the same store.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Separator between ancestor ids in composite unit/lesson ids.
pub const ID_SEPARATOR: char = '_';

/// Current persisted schema version.
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum progress value.
pub const MAX_PROGRESS: u8 = 100;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Entity id must not be empty")]
    Empty,

    #[error("Entity id segment '{0}' contains the '_' separator")]
    ContainsSeparator(String),

    #[error("Unknown entity type: {0}")]
    UnknownType(String),
}

/// Level of a node in the content hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Course,
    Unit,
    Lesson,
}

impl EntityType {
    pub const ALL: [EntityType; 3] = [EntityType::Course, EntityType::Unit, EntityType::Lesson];

    /// Namespace prefix used in storage keys.
    pub fn prefix(&self) -> &'static str {
        match self {
            EntityType::Course => "course",
            EntityType::Unit => "unit",
            EntityType::Lesson => "lesson",
        }
    }

    /// Type of this entity's parent, if it has one.
    pub fn parent(&self) -> Option<EntityType> {
        match self {
            EntityType::Course => None,
            EntityType::Unit => Some(EntityType::Course),
            EntityType::Lesson => Some(EntityType::Unit),
        }
    }

    /// Type of this entity's children, if it has any.
    pub fn child(&self) -> Option<EntityType> {
        match self {
            EntityType::Course => Some(EntityType::Unit),
            EntityType::Unit => Some(EntityType::Lesson),
            EntityType::Lesson => None,
        }
    }

    /// Number of id segments a well-formed id of this type carries.
    pub fn depth(&self) -> usize {
        match self {
            EntityType::Course => 1,
            EntityType::Unit => 2,
            EntityType::Lesson => 3,
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

impl std::str::FromStr for EntityType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "course" => Ok(EntityType::Course),
            "unit" => Ok(EntityType::Unit),
            "lesson" => Ok(EntityType::Lesson),
            other => Err(KeyError::UnknownType(other.to_string())),
        }
    }
}

/// Identity of one node: its type plus its composite id
/// (`courseId`, `courseId_unitId` or `courseId_unitId_lessonId`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    #[serde(rename = "type")]
    pub entity_type: EntityType,
    pub id: String,
}

impl EntityKey {
    /// Wrap an already composed id without validating it.
    pub fn new(entity_type: EntityType, id: impl Into<String>) -> Self {
        Self {
            entity_type,
            id: id.into(),
        }
    }

    pub fn course(course_id: &str) -> Result<Self, KeyError> {
        Ok(Self::new(EntityType::Course, compose(&[course_id])?))
    }

    pub fn unit(course_id: &str, unit_id: &str) -> Result<Self, KeyError> {
        Ok(Self::new(EntityType::Unit, compose(&[course_id, unit_id])?))
    }

    pub fn lesson(course_id: &str, unit_id: &str, lesson_id: &str) -> Result<Self, KeyError> {
        Ok(Self::new(
            EntityType::Lesson,
            compose(&[course_id, unit_id, lesson_id])?,
        ))
    }

    /// The immediate parent: the id with its last segment removed.
    /// Courses and ids without a separator have no parent.
    pub fn parent(&self) -> Option<EntityKey> {
        let parent_type = self.entity_type.parent()?;
        let (parent_id, _) = self.id.rsplit_once(ID_SEPARATOR)?;
        if parent_id.is_empty() {
            return None;
        }
        Some(EntityKey::new(parent_type, parent_id))
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.id)
    }
}

fn compose(segments: &[&str]) -> Result<String, KeyError> {
    for segment in segments {
        if segment.is_empty() {
            return Err(KeyError::Empty);
        }
        if segment.contains(ID_SEPARATOR) {
            return Err(KeyError::ContainsSeparator(segment.to_string()));
        }
    }
    Ok(segments.join(&ID_SEPARATOR.to_string()))
}

/// Replication state of a record relative to the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    #[default]
    Pending,
    Synced,
    Error,
}

/// One recorded answer to a practice question.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct AnswerEntry {
    #[cfg_attr(feature = "ts", ts(type = "unknown"))]
    pub answer: serde_json::Value,
    pub is_correct: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Bookmark {
    pub position: f64,
    pub label: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
pub struct Note {
    pub position: f64,
    pub text: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub timestamp: DateTime<Utc>,
}

/// Extension fields only meaningful on lesson records.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct LessonFields {
    /// Playback position in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_position: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_muted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_fullscreen: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_verse_index: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_position: Option<f64>,
    #[serde(
        default,
        with = "chrono::serde::ts_milliseconds_option",
        skip_serializing_if = "Option::is_none"
    )]
    #[cfg_attr(feature = "ts", ts(type = "number | null"))]
    pub last_updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub answers: BTreeMap<String, AnswerEntry>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub bookmarks: Vec<Bookmark>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<Note>,
}

impl LessonFields {
    pub fn is_empty(&self) -> bool {
        *self == LessonFields::default()
    }
}

/// The persisted unit of truth for one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS), ts(export))]
#[serde(rename_all = "camelCase")]
pub struct ProgressRecord {
    #[serde(deserialize_with = "deserialize_progress")]
    pub progress: u8,
    pub is_completed: bool,
    #[serde(default)]
    pub is_locked: bool,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub timestamp: DateTime<Utc>,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    #[cfg_attr(feature = "ts", ts(type = "number"))]
    pub expires_at: DateTime<Utc>,
    pub version: String,
    #[serde(default)]
    pub sync_status: SyncStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed_lesson: Option<String>,
    #[serde(flatten)]
    pub lesson: LessonFields,
}

impl ProgressRecord {
    /// Defaults synthesized for a key that has never been written.
    pub fn empty(now: DateTime<Utc>, expires_at: DateTime<Utc>) -> Self {
        Self {
            progress: 0,
            is_completed: false,
            is_locked: false,
            timestamp: now,
            expires_at,
            version: SCHEMA_VERSION.to_string(),
            sync_status: SyncStatus::Pending,
            last_accessed_lesson: None,
            lesson: LessonFields::default(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Clamp any progress input into `0..=100`.
pub fn clamp_progress(value: i64) -> u8 {
    value.clamp(0, MAX_PROGRESS as i64) as u8
}

/// Accept any JSON number for `progress`. Older writers stored unrounded
/// averages such as `33.333333333333336`.
pub(crate) fn deserialize_progress<'de, D>(deserializer: D) -> Result<u8, D::Error>
where
    D: serde::Deserializer<'de>,
{
    use serde::de;

    struct ProgressVisitor;

    impl<'de> de::Visitor<'de> for ProgressVisitor {
        type Value = u8;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a progress number")
        }

        fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E> {
            Ok(v.min(MAX_PROGRESS as u64) as u8)
        }

        fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E> {
            Ok(clamp_progress(v))
        }

        fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            if v.is_nan() {
                return Err(E::custom("progress is NaN"));
            }
            Ok(v.round().clamp(0.0, MAX_PROGRESS as f64) as u8)
        }
    }

    deserializer.deserialize_any(ProgressVisitor)
}

/// A partial update merged over the existing record by `save_progress`.
///
/// `None` keeps the stored value. Collections (`answers`, `bookmarks`,
/// `notes`) replace the stored collection wholesale when present.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressPatch {
    pub progress: Option<i64>,
    pub is_completed: Option<bool>,
    pub is_locked: Option<bool>,
    pub expires_at: Option<DateTime<Utc>>,
    pub last_accessed_lesson: Option<String>,
    pub current_position: Option<f64>,
    pub volume: Option<f64>,
    pub is_muted: Option<bool>,
    pub is_fullscreen: Option<bool>,
    pub current_verse_index: Option<u32>,
    pub scroll_position: Option<f64>,
    pub last_updated: Option<DateTime<Utc>>,
    pub answers: Option<BTreeMap<String, AnswerEntry>>,
    pub bookmarks: Option<Vec<Bookmark>>,
    pub notes: Option<Vec<Note>>,
}

impl ProgressPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn progress(mut self, progress: i64) -> Self {
        self.progress = Some(progress);
        self
    }

    pub fn completed(mut self, is_completed: bool) -> Self {
        self.is_completed = Some(is_completed);
        self
    }

    pub fn locked(mut self, is_locked: bool) -> Self {
        self.is_locked = Some(is_locked);
        self
    }

    pub fn expires_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn last_accessed_lesson(mut self, lesson_id: impl Into<String>) -> Self {
        self.last_accessed_lesson = Some(lesson_id.into());
        self
    }

    /// Whether the patch touches any lesson-only extension field.
    pub fn has_lesson_fields(&self) -> bool {
        self.current_position.is_some()
            || self.volume.is_some()
            || self.is_muted.is_some()
            || self.is_fullscreen.is_some()
            || self.current_verse_index.is_some()
            || self.scroll_position.is_some()
            || self.last_updated.is_some()
            || self.answers.is_some()
            || self.bookmarks.is_some()
            || self.notes.is_some()
    }

    /// Merge this patch over `base`. Does not stamp timestamps or version;
    /// the store does that.
    pub fn apply(self, base: ProgressRecord, entity_type: EntityType) -> ProgressRecord {
        let mut record = base;
        if let Some(progress) = self.progress {
            record.progress = clamp_progress(progress);
        }
        if let Some(is_completed) = self.is_completed {
            record.is_completed = is_completed;
        }
        if let Some(is_locked) = self.is_locked {
            record.is_locked = is_locked;
        }
        if let Some(expires_at) = self.expires_at {
            record.expires_at = expires_at;
        }
        if self.last_accessed_lesson.is_some() {
            record.last_accessed_lesson = self.last_accessed_lesson;
        }

        // Extension fields belong to lessons only.
        if entity_type != EntityType::Lesson {
            return record;
        }
        let lesson = &mut record.lesson;
        if self.current_position.is_some() {
            lesson.current_position = self.current_position;
        }
        if self.volume.is_some() {
            lesson.volume = self.volume;
        }
        if self.is_muted.is_some() {
            lesson.is_muted = self.is_muted;
        }
        if self.is_fullscreen.is_some() {
            lesson.is_fullscreen = self.is_fullscreen;
        }
        if self.current_verse_index.is_some() {
            lesson.current_verse_index = self.current_verse_index;
        }
        if self.scroll_position.is_some() {
            lesson.scroll_position = self.scroll_position;
        }
        if self.last_updated.is_some() {
            lesson.last_updated = self.last_updated;
        }
        if let Some(answers) = self.answers {
            lesson.answers = answers;
        }
        if let Some(bookmarks) = self.bookmarks {
            lesson.bookmarks = bookmarks;
        }
        if let Some(notes) = self.notes {
            lesson.notes = notes;
        }
        record
    }
}

/// Player/reader state saved when a learner leaves a lesson.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LessonState {
    pub current_position: Option<f64>,
    pub volume: Option<f64>,
    pub is_muted: Option<bool>,
    pub is_fullscreen: Option<bool>,
    pub current_verse_index: Option<u32>,
    pub scroll_position: Option<f64>,
}

impl From<LessonState> for ProgressPatch {
    fn from(state: LessonState) -> Self {
        ProgressPatch {
            current_position: state.current_position,
            volume: state.volume,
            is_muted: state.is_muted,
            is_fullscreen: state.is_fullscreen,
            current_verse_index: state.current_verse_index,
            scroll_position: state.scroll_position,
            ..ProgressPatch::default()
        }
    }
}
