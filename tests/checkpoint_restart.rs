// tests/checkpoint_restart.rs
//
// Durable round trip: run a few ticks, checkpoint to a FileStore in a temp dir, then
// rehydrate a brand-new scheduler state from the same directory.

use std::sync::Arc;
use std::time::Duration;

use catalog_watch::acquire::{RateGate, Scheduler, SchedulerState};
use catalog_watch::checkpoint::{
    section, Checkpoint, CheckpointWriter, DurableStore, FileStore, WriteQueue, WriteReport,
};
use catalog_watch::fanout::LiveFanout;
use catalog_watch::upstream::providers::fixture::FixtureUpstream;
use catalog_watch::upstream::{CatalogItem, Event, FetchOutcome};
use catalog_watch::SchedulerConfig;
use chrono::{TimeZone, Utc};
use tempfile::tempdir;

fn catalog() -> Vec<CatalogItem> {
    (1..=4)
        .map(|id| CatalogItem {
            id,
            name: format!("item-{id}"),
        })
        .collect()
}

#[tokio::test]
async fn restart_resumes_from_file_checkpoint() {
    let dir = tempdir().expect("tempdir");
    let now = Utc.with_ymd_and_hms(2025, 10, 2, 9, 0, 0).unwrap();
    let cfg = SchedulerConfig {
        daily_quota: 1_000,
        ..SchedulerConfig::default()
    };

    let up = Arc::new(FixtureUpstream::new(catalog()));
    up.script(
        1,
        FetchOutcome::Success(vec![Event {
            timestamp: 1_700,
            body: "hello".into(),
        }]),
    );
    up.script(2, FetchOutcome::Failure { status: 404 });

    let mut state = SchedulerState::fresh(&cfg, now);
    state.cursor.replace_catalog(catalog());
    let mut sched = Scheduler::new(
        state,
        up,
        RateGate::spawn(100, Duration::from_millis(1)),
        LiveFanout::default(),
        Duration::from_secs(1),
    );
    sched.tick(now).await; // 1 committed
    sched.tick(now).await; // 2 errored
    sched.push_hint(vec![3], now);

    let store: Arc<dyn DurableStore> = Arc::new(FileStore::new(dir.path()));
    let mut writer = CheckpointWriter::new(WriteQueue::spawn(store.clone()));
    let report = writer.write_if_needed(&sched.state().snapshot(now)).await;
    assert_eq!(report, WriteReport::Written { failed: 0 });
    for name in [
        section::EVENTS,
        section::ERRORS,
        section::CURSOR,
        section::HINTS,
        section::QUOTA,
    ] {
        assert!(
            dir.path().join(format!("{name}.json")).exists(),
            "missing section file {name}"
        );
    }

    // fresh process
    let reopened = FileStore::new(dir.path());
    let saved = Checkpoint::load(&reopened).await;
    let restored = SchedulerState::from_checkpoint(saved, &cfg, now);

    assert_eq!(restored.store.newest(1), Some(1_700));
    assert!(restored.cursor.is_errored(2));
    assert_eq!(restored.cursor.current().map(|it| it.id), Some(3));
    assert_eq!(restored.hints.get(3), Some(now.timestamp()));
    // 998 left at checkpoint time, minus the restart margin
    assert_eq!(restored.governor.remaining(), 998 - cfg.quota_safety_margin);
}

#[tokio::test]
async fn corrupt_section_on_disk_does_not_block_startup() {
    let dir = tempdir().expect("tempdir");
    std::fs::write(dir.path().join("quota.json"), b"{ truncated").expect("write");
    std::fs::write(dir.path().join("errors.json"), b"[7, 8]").expect("write");

    let saved = Checkpoint::load(&FileStore::new(dir.path())).await;
    assert!(saved.quota.is_none());
    assert_eq!(saved.errors.len(), 2);

    let state = SchedulerState::from_checkpoint(saved, &SchedulerConfig::default(), Utc::now());
    assert_eq!(
        state.governor.remaining(),
        SchedulerConfig::default().daily_quota,
        "unreadable quota means a fresh epoch"
    );
}
