use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, TimeZone, Utc};
use serde_json::json;

use super::*;
use crate::clock::ManualClock;
use crate::storage::MemoryStore;

fn clock() -> Arc<ManualClock> {
    Arc::new(ManualClock::new(
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
    ))
}

fn open(backend: &Arc<MemoryStore>, clock: &Arc<ManualClock>) -> ProgressStore {
    ProgressStore::new(backend.clone(), clock.clone(), StoreConfig::synchronous())
}

fn lesson(store: &ProgressStore, id: &str, progress: i64, done: bool) {
    store.save_progress(
        EntityType::Lesson,
        id,
        ProgressPatch::new().progress(progress).completed(done),
    );
}

// -------------------------------------------------------------------------
// Reads and writes
// -------------------------------------------------------------------------

#[test]
fn test_save_then_get_merges_over_defaults() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    store.save_progress(EntityType::Course, "c1", ProgressPatch::new().progress(40));
    let record = store.get_progress(EntityType::Course, "c1").unwrap();

    assert_eq!(record.progress, 40);
    assert!(!record.is_completed);
    assert!(!record.is_locked);
    assert_eq!(record.timestamp, clock.now());
    assert_eq!(record.expires_at, clock.now() + Duration::days(730));
    assert_eq!(record.version, SCHEMA_VERSION);
    assert_eq!(record.sync_status, SyncStatus::Pending);
    assert!(backend.get("course_c1").unwrap().is_some());
}

#[test]
fn test_progress_is_clamped() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    for (input, stored) in [(-20, 0), (0, 0), (55, 55), (100, 100), (1_000, 100)] {
        store.save_progress(EntityType::Course, "c1", ProgressPatch::new().progress(input));
        assert_eq!(
            store.get_progress(EntityType::Course, "c1").unwrap().progress,
            stored
        );
    }
}

#[test]
fn test_later_write_keeps_earlier_fields() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    store.save_progress(EntityType::Unit, "c1_u1", ProgressPatch::new().locked(true));
    clock.advance(Duration::seconds(30));
    store.save_progress(EntityType::Unit, "c1_u1", ProgressPatch::new().progress(10));

    let record = store.get_progress(EntityType::Unit, "c1_u1").unwrap();
    assert!(record.is_locked);
    assert_eq!(record.progress, 10);
    assert_eq!(record.timestamp, clock.now());
}

#[test]
fn test_explicit_completion_is_kept() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    store.save_progress(
        EntityType::Course,
        "c1",
        ProgressPatch::new().progress(20).completed(true),
    );
    let record = store.get_progress(EntityType::Course, "c1").unwrap();
    assert!(record.is_completed);
    assert_eq!(record.progress, 20);
}

#[test]
fn test_namespace_prefix() {
    let backend = Arc::new(MemoryStore::new());
    let config = StoreConfig {
        namespace: Some("tajweed".to_string()),
        ..StoreConfig::synchronous()
    };
    let store = ProgressStore::new(backend.clone(), clock(), config);

    lesson(&store, "c1_u1_l1", 100, true);
    assert!(backend.get("tajweed_lesson_c1_u1_l1").unwrap().is_some());
    assert!(backend.get("tajweed_unit_c1_u1").unwrap().is_some());
    assert_eq!(store.storage_key(EntityType::Course, "c1"), "tajweed_course_c1");

    // Keys outside the namespace are invisible
    backend.set("lesson_other_u_l", "{}").unwrap();
    assert_eq!(store.debug_dump().len(), 3);
}

// -------------------------------------------------------------------------
// Expiry, corruption, migration
// -------------------------------------------------------------------------

#[test]
fn test_expired_record_is_absent_and_purged() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    store.save_progress(EntityType::Course, "c1", ProgressPatch::new().progress(10));
    clock.advance(Duration::days(731));

    assert!(store.debug_dump().contains_key("course_c1"));
    assert!(store.get_progress(EntityType::Course, "c1").is_none());
    assert!(store.debug_dump().is_empty());
}

#[test]
fn test_explicit_expiry_is_honoured() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    let soon = clock.now() + Duration::minutes(5);
    store.save_progress(EntityType::Course, "c1", ProgressPatch::new().expires_at(soon));
    assert_eq!(
        store.get_progress(EntityType::Course, "c1").unwrap().expires_at,
        soon
    );

    clock.advance(Duration::minutes(6));
    assert_eq!(store.clear_expired_data(), 1);
    assert!(backend.get("course_c1").unwrap().is_none());
}

#[test]
fn test_sweep_on_open() {
    let backend = Arc::new(MemoryStore::new());
    backend
        .set(
            "unit_c1_u1",
            r#"{"progress":5,"isCompleted":false,"timestamp":1,"expiresAt":2,"version":"1.0.0"}"#,
        )
        .unwrap();

    let _store = open(&backend, &clock());
    assert!(backend.is_empty());
}

#[test]
fn test_corrupt_record_reads_as_absent_and_is_purged() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    backend.set("lesson_c1_u1_l1", "{definitely not json").unwrap();
    assert!(store.get_progress(EntityType::Lesson, "c1_u1_l1").is_none());
    assert!(backend.get("lesson_c1_u1_l1").unwrap().is_none());
}

#[test]
fn test_legacy_record_is_migrated_on_read() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    backend
        .set(
            "lesson_c1_u1_l1",
            r#"{"progress":66.66666666666667,"isCompleted":false,"timestamp":1699999999000,"expiresAt":1800000000000,"currentPosition":12.5}"#,
        )
        .unwrap();

    let record = store.get_progress(EntityType::Lesson, "c1_u1_l1").unwrap();
    assert_eq!(record.progress, 67);
    assert_eq!(record.version, SCHEMA_VERSION);
    assert!(!record.is_locked);
    assert_eq!(record.lesson.current_position, Some(12.5));

    // Reading does not rewrite the stored value
    let raw = backend.get("lesson_c1_u1_l1").unwrap().unwrap();
    assert!(!raw.contains("\"version\""));
}

// -------------------------------------------------------------------------
// Aggregation
// -------------------------------------------------------------------------

#[test]
fn test_unit_aggregate_after_cascade() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    lesson(&store, "c1_u1_l1", 100, true);
    lesson(&store, "c1_u1_l2", 50, false);
    lesson(&store, "c1_u1_l3", 0, false);

    let unit = store.get_progress(EntityType::Unit, "c1_u1").unwrap();
    assert_eq!(unit.progress, 50);
    assert!(!unit.is_completed);

    // And one level further up
    let course = store.get_progress(EntityType::Course, "c1").unwrap();
    assert_eq!(course.progress, 50);
    assert!(!course.is_completed);
}

#[test]
fn test_completion_ripples_to_course() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    lesson(&store, "c1_u1_l1", 100, true);
    lesson(&store, "c1_u2_l1", 40, false);
    assert_eq!(store.get_progress(EntityType::Course, "c1").unwrap().progress, 70);

    lesson(&store, "c1_u2_l1", 100, true);
    let course = store.get_progress(EntityType::Course, "c1").unwrap();
    assert_eq!(course.progress, 100);
    assert!(course.is_completed);
}

#[test]
fn test_recompute_without_children_leaves_parent_alone() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    let unit = EntityKey::new(EntityType::Unit, "c9_u9");
    assert!(store.recompute(&unit).is_none());
    assert!(store.get_progress(EntityType::Unit, "c9_u9").is_none());

    store.save_progress(EntityType::Unit, "c9_u9", ProgressPatch::new().progress(30));
    let before = store.get_progress(EntityType::Unit, "c9_u9").unwrap();
    clock.advance(Duration::minutes(1));
    assert!(store.recompute(&unit).is_none());
    assert_eq!(store.get_progress(EntityType::Unit, "c9_u9").unwrap(), before);
}

#[test]
fn test_unit_prefix_does_not_match_longer_ids() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    lesson(&store, "c1_u1_l1", 20, false);
    lesson(&store, "c1_u10_l1", 100, true);

    assert_eq!(store.get_progress(EntityType::Unit, "c1_u1").unwrap().progress, 20);
    assert_eq!(store.get_progress(EntityType::Unit, "c1_u10").unwrap().progress, 100);
}

#[test]
fn test_expired_children_do_not_count() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    let soon = clock.now() + Duration::minutes(1);
    store.save_progress(
        EntityType::Lesson,
        "c1_u1_l1",
        ProgressPatch::new().progress(0).expires_at(soon),
    );
    lesson(&store, "c1_u1_l2", 80, false);
    clock.advance(Duration::minutes(2));

    let summary = store
        .recompute(&EntityKey::new(EntityType::Unit, "c1_u1"))
        .unwrap();
    assert_eq!(summary.total_items, 1);
    assert_eq!(summary.progress, 80);
}

#[test]
fn test_course_write_has_no_parent() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    store.save_progress(EntityType::Course, "c1", ProgressPatch::new().progress(10));
    assert_eq!(backend.len(), 1);
}

// -------------------------------------------------------------------------
// Lesson extensions
// -------------------------------------------------------------------------

#[test]
fn test_save_answer_preserves_other_answers() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    lesson(&store, "c1_u1_l1", 30, false);
    store.save_answer("c1_u1_l1", "q1", json!("a"), true);
    store.save_answer("c1_u1_l1", "q2", json!({"choice": 3}), false);

    let record = store.get_progress(EntityType::Lesson, "c1_u1_l1").unwrap();
    assert_eq!(record.lesson.answers.len(), 2);
    assert!(record.lesson.answers["q1"].is_correct);
    assert_eq!(record.lesson.answers["q2"].answer, json!({"choice": 3}));
    // Progress untouched
    assert_eq!(record.progress, 30);
}

#[test]
fn test_bookmarks_notes_and_state() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    store.add_bookmark("c1_u1_l1", 12.0, "Intro");
    store.add_bookmark("c1_u1_l1", 48.5, "Madd rules");
    store.add_note("c1_u1_l1", 20.0, "Practice this");
    store.save_lesson_state(
        "c1_u1_l1",
        LessonState {
            current_position: Some(50.0),
            volume: Some(0.4),
            is_muted: Some(false),
            ..LessonState::default()
        },
    );

    let record = store.get_progress(EntityType::Lesson, "c1_u1_l1").unwrap();
    let labels: Vec<&str> = record.lesson.bookmarks.iter().map(|b| b.label.as_str()).collect();
    assert_eq!(labels, vec!["Intro", "Madd rules"]);
    assert_eq!(record.lesson.notes[0].text, "Practice this");
    assert_eq!(record.lesson.current_position, Some(50.0));
    assert_eq!(record.lesson.volume, Some(0.4));
    assert_eq!(record.lesson.last_updated, Some(clock.now()));
}

#[test]
fn test_lesson_fields_dropped_on_units() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    store.save_progress(
        EntityType::Unit,
        "c1_u1",
        ProgressPatch {
            volume: Some(0.2),
            ..ProgressPatch::new().progress(5)
        },
    );
    let record = store.get_progress(EntityType::Unit, "c1_u1").unwrap();
    assert_eq!(record.progress, 5);
    assert!(record.lesson.is_empty());
}

// -------------------------------------------------------------------------
// Failure handling
// -------------------------------------------------------------------------

#[test]
fn test_quota_error_sweeps_and_retries() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    backend
        .set(
            "lesson_old_u_l",
            r#"{"progress":5,"isCompleted":false,"timestamp":1,"expiresAt":2,"version":"1.0.0"}"#,
        )
        .unwrap();
    backend.fail_next_writes(1);

    store.save_progress(EntityType::Course, "c1", ProgressPatch::new().progress(10));

    assert_eq!(store.get_progress(EntityType::Course, "c1").unwrap().progress, 10);
    assert!(backend.get("lesson_old_u_l").unwrap().is_none());
}

#[test]
fn test_failed_retry_is_swallowed() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());
    let mut changes = store.progress_changes();

    backend.fail_next_writes(2);
    lesson(&store, "c1_u1_l1", 100, true);

    assert!(store.get_progress(EntityType::Lesson, "c1_u1_l1").is_none());
    // Nothing durable, so nothing published and no parent created
    assert!(changes.try_recv().is_none());
    assert!(store.get_progress(EntityType::Unit, "c1_u1").is_none());
}

#[test]
fn test_real_quota_pressure_recovers_space() {
    let backend = Arc::new(MemoryStore::with_quota(400));
    let clock = clock();
    let store = open(&backend, &clock);

    let soon = clock.now() + Duration::minutes(1);
    store.save_progress(EntityType::Course, "old", ProgressPatch::new().expires_at(soon));
    let used = backend.used_bytes();
    assert!(used > 0 && used < 400);
    clock.advance(Duration::minutes(2));

    // Records are ~155 bytes: the third only fits once the expired one is gone.
    store.save_progress(EntityType::Course, "new1", ProgressPatch::new().progress(1));
    store.save_progress(EntityType::Course, "new2", ProgressPatch::new().progress(2));

    assert!(store.get_progress(EntityType::Course, "old").is_none());
    assert!(store.get_progress(EntityType::Course, "new1").is_some());
}

// -------------------------------------------------------------------------
// Change notification
// -------------------------------------------------------------------------

#[test]
fn test_save_publishes_change() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());
    assert!(store.latest_change().is_none());

    let mut changes = store.progress_changes();
    lesson(&store, "c1_u1_l1", 100, true);

    let published: Vec<(EntityType, String)> = changes
        .drain()
        .into_iter()
        .map(|c| (c.entity_type, c.id))
        .collect();
    assert_eq!(
        published,
        vec![
            (EntityType::Lesson, "c1_u1_l1".to_string()),
            (EntityType::Unit, "c1_u1".to_string()),
            (EntityType::Course, "c1".to_string()),
        ]
    );
    assert_eq!(store.latest_change().unwrap().entity_type, EntityType::Course);
}

#[test]
fn test_external_write_is_republished() {
    let tab_a = Arc::new(MemoryStore::new());
    let tab_b = Arc::new(tab_a.connect());
    let clock = clock();

    let store_a = open(&tab_a, &clock);
    let store_b = open(&tab_b, &clock);
    let mut b_changes = store_b.progress_changes();

    lesson(&store_a, "c1_u1_l1", 60, false);
    assert_eq!(store_b.drain_external_changes(), 3);

    let change = b_changes.try_recv().unwrap();
    assert_eq!(change.entity_type, EntityType::Lesson);
    assert_eq!(change.id, "c1_u1_l1");
    assert_eq!(change.data.progress, 60);
}

#[test]
fn test_malformed_external_write_is_dropped() {
    let tab_a = Arc::new(MemoryStore::new());
    let tab_b = Arc::new(tab_a.connect());
    let store_b = open(&tab_b, &clock());
    let mut b_changes = store_b.progress_changes();

    tab_a.set("lesson_c1_u1_l1", "<html>").unwrap();
    tab_a.set("appCache", "{}").unwrap();
    tab_a.remove("lesson_c1_u1_l1").unwrap();

    assert_eq!(store_b.drain_external_changes(), 0);
    assert!(b_changes.try_recv().is_none());
    assert!(store_b.latest_change().is_none());
}

// -------------------------------------------------------------------------
// Sync bookkeeping
// -------------------------------------------------------------------------

#[test]
fn test_sync_status_updates_do_not_cascade() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    lesson(&store, "c1_u1_l1", 10, false);
    assert_eq!(store.pending_sync().len(), 3);

    let before = store.get_progress(EntityType::Lesson, "c1_u1_l1").unwrap();
    clock.advance(Duration::minutes(1));
    assert!(store.set_sync_status(EntityType::Lesson, "c1_u1_l1", SyncStatus::Synced));
    assert!(!store.set_sync_status(EntityType::Lesson, "missing", SyncStatus::Synced));

    let after = store.get_progress(EntityType::Lesson, "c1_u1_l1").unwrap();
    assert_eq!(after.sync_status, SyncStatus::Synced);
    assert_eq!(after.timestamp, before.timestamp);

    let pending = store.pending_sync();
    assert_eq!(pending.len(), 2);
    assert!(!pending.contains(&EntityKey::new(EntityType::Lesson, "c1_u1_l1")));
}

#[test]
fn test_clear_progress_and_clear_all() {
    let backend = Arc::new(MemoryStore::new());
    let store = open(&backend, &clock());

    lesson(&store, "c1_u1_l1", 10, false);
    backend.set("appCache", "{}").unwrap();

    store.clear_progress(EntityType::Lesson, "c1_u1_l1");
    assert!(store.get_progress(EntityType::Lesson, "c1_u1_l1").is_none());

    assert_eq!(store.clear_all(), 2);
    // Foreign keys survive
    assert_eq!(backend.keys().unwrap(), vec!["appCache".to_string()]);
}

#[test]
fn test_expired_keys_helper() {
    let backend = Arc::new(MemoryStore::new());
    let clock = clock();
    let store = open(&backend, &clock);

    let soon = clock.now() + Duration::minutes(1);
    store.save_progress(EntityType::Course, "a", ProgressPatch::new().expires_at(soon));
    store.save_progress(EntityType::Course, "b", ProgressPatch::new());
    clock.advance(Duration::minutes(2));

    assert_eq!(expired_keys(&store.debug_dump(), clock.now()), vec!["course_a"]);
}

// -------------------------------------------------------------------------
// Deferred cascades
// -------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_deferred_cascade_coalesces_sibling_writes() {
    let backend = Arc::new(MemoryStore::new());
    let config = StoreConfig {
        cascade_delay: Some(StdDuration::from_millis(20)),
        ..StoreConfig::default()
    };
    let store = ProgressStore::new(backend.clone(), clock(), config);
    let mut changes = store.progress_changes();

    lesson(&store, "c1_u1_l1", 100, true);
    lesson(&store, "c1_u1_l2", 50, false);
    lesson(&store, "c1_u1_l3", 0, false);

    // Nothing recomputed before the delay runs out
    tokio::time::advance(StdDuration::from_millis(10)).await;
    assert!(store.get_progress(EntityType::Unit, "c1_u1").is_none());

    // The paused clock jumps to the worker's deadline once everything idles
    store.settle().await;

    let unit = store.get_progress(EntityType::Unit, "c1_u1").unwrap();
    assert_eq!(unit.progress, 50);
    assert!(!unit.is_completed);
    assert_eq!(store.get_progress(EntityType::Course, "c1").unwrap().progress, 50);

    let unit_events = changes
        .drain()
        .into_iter()
        .filter(|c| c.entity_type == EntityType::Unit)
        .count();
    assert_eq!(unit_events, 1);
}

#[tokio::test]
async fn test_settle_without_pending_work_returns() {
    let backend = Arc::new(MemoryStore::new());
    let store = ProgressStore::new(backend, clock(), StoreConfig::default());
    tokio::time::timeout(StdDuration::from_secs(1), store.settle())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_listener_republishes_remote_writes() {
    let tab_a = Arc::new(MemoryStore::new());
    let tab_b = Arc::new(tab_a.connect());
    let clock = clock();

    let store_a = ProgressStore::new(tab_a.clone(), clock.clone(), StoreConfig::default());
    let store_b = ProgressStore::new(tab_b.clone(), clock.clone(), StoreConfig::default());
    let mut b_changes = store_b.progress_changes();

    store_a.save_progress(EntityType::Course, "c1", ProgressPatch::new().progress(70));

    let change = tokio::time::timeout(StdDuration::from_secs(1), b_changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(change.id, "c1");
    assert_eq!(change.data.progress, 70);
}
