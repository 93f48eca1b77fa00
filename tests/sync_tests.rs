use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fusion_sync_rs::classify::ClassifierRules;
use fusion_sync_rs::collector::CollectorSettings;
use fusion_sync_rs::provider::{FetchError, PageSource};
use fusion_sync_rs::state::{PartialPolicy, SyncConfig, SyncController, Trigger};
use fusion_sync_rs::types::{Cursor, Item, Page, RunOutcome};
use tokio::sync::Semaphore;

fn fast() -> CollectorSettings {
    CollectorSettings {
        page_size: 2,
        page_delay: Duration::ZERO,
        initial_backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
        ..CollectorSettings::default()
    }
}

fn speaker(id: &str) -> Item {
    Item::new(id)
        .with_attribute("InformaCastDeviceType", "IPSpeaker")
        .with_description(format!("Speaker {id}"))
}

fn controller(source: Arc<dyn PageSource>, policy: PartialPolicy) -> SyncController {
    SyncController::new(
        SyncConfig {
            source,
            settings: fast(),
            rules_path: None,
            policy,
        },
        ClassifierRules::default(),
    )
}

async fn settle(sync: &SyncController) {
    tokio::time::timeout(Duration::from_secs(5), sync.wait_idle())
        .await
        .expect("run finishes");
}

/// Every fetch waits for a permit, so tests control when pages arrive.
/// Serves a full page at offset 0 and a short last page after it.
struct Gated {
    gate: Semaphore,
}

#[async_trait::async_trait]
impl PageSource for Gated {
    async fn fetch_page(&self, cursor: &Cursor, _limit: usize) -> Result<Page, FetchError> {
        self.gate.acquire().await.expect("gate open").forget();
        match cursor {
            Cursor::Offset(0) => Ok(Page::new(vec![speaker("1"), speaker("2")])),
            _ => Ok(Page::new(vec![speaker("3")])),
        }
    }
}

/// First call serves one speaker, later calls fail.
struct FailsAfterFirst {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl PageSource for FailsAfterFirst {
    async fn fetch_page(&self, _cursor: &Cursor, _limit: usize) -> Result<Page, FetchError> {
        match self.calls.fetch_add(1, Ordering::SeqCst) {
            0 => Ok(Page::new(vec![speaker("1")])),
            _ => Err(FetchError::Network("connection reset".into())),
        }
    }
}

/// Serves its items as the first page, then an empty one.
struct Fixed(Vec<Item>);

#[async_trait::async_trait]
impl PageSource for Fixed {
    async fn fetch_page(&self, cursor: &Cursor, _limit: usize) -> Result<Page, FetchError> {
        match cursor {
            Cursor::Offset(0) => Ok(Page::new(self.0.clone())),
            _ => Ok(Page::default()),
        }
    }
}

#[tokio::test]
async fn second_trigger_while_running_is_a_noop() {
    let source = Arc::new(Gated {
        gate: Semaphore::new(0),
    });
    let sync = controller(source.clone(), PartialPolicy::Publish);

    let first = sync.trigger().await;
    assert!(first.started());
    assert_eq!(first.progress().run, 1);

    let second = sync.trigger().await;
    match &second {
        Trigger::AlreadyRunning(p) => {
            assert_eq!(p.run, 1);
            assert!(p.is_running);
        }
        other => panic!("expected no-op, got {other:?}"),
    }

    source.gate.add_permits(10);
    settle(&sync).await;

    let progress = sync.progress().await;
    assert_eq!(progress.run, 1);
    assert!(!progress.is_running);
    assert_eq!(progress.outcome, Some(RunOutcome::Completed));
    assert_eq!(sync.latest().await.expect("published").run, 1);
}

#[tokio::test]
async fn restart_supersedes_in_flight_run() {
    let source = Arc::new(Gated {
        gate: Semaphore::new(0),
    });
    let sync = controller(source.clone(), PartialPolicy::Publish);

    assert!(sync.trigger().await.started());
    let restarted = sync.restart().await;
    assert!(restarted.started());
    assert_eq!(restarted.progress().run, 2);
    assert_eq!(restarted.progress().scanned, 0);

    source.gate.add_permits(10);
    settle(&sync).await;
    // Give the superseded run a chance to try writing.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let progress = sync.progress().await;
    assert_eq!(progress.run, 2);
    assert_eq!(progress.outcome, Some(RunOutcome::Completed));
    assert_eq!(sync.latest().await.expect("published").run, 2);
}

#[tokio::test]
async fn new_run_resets_counts_atomically() {
    let sync = controller(
        Arc::new(Fixed(vec![speaker("1"), speaker("2")])),
        PartialPolicy::Publish,
    );
    assert!(sync.trigger().await.started());
    settle(&sync).await;
    let done = sync.progress().await;
    assert_eq!(done.scanned, 2);
    assert_eq!(done.cursor.as_deref(), Some("2"));
    assert!(done.last_completed.is_some());

    let second = sync.trigger().await;
    let p = second.progress();
    assert!(p.is_running);
    assert_eq!(p.run, 2);
    assert_eq!(p.scanned, 0);
    assert_eq!(p.matched, 0);
    assert_eq!(p.outcome, None);
    assert!(!p.truncated);
    assert_eq!(p.last_completed, done.last_completed);
    settle(&sync).await;
}

#[tokio::test]
async fn discard_policy_keeps_previous_result() {
    let sync = controller(
        Arc::new(FailsAfterFirst {
            calls: AtomicUsize::new(0),
        }),
        PartialPolicy::Discard,
    );

    sync.trigger().await;
    settle(&sync).await;
    assert_eq!(sync.latest().await.expect("first run published").run, 1);

    sync.trigger().await;
    settle(&sync).await;
    let progress = sync.progress().await;
    assert_eq!(progress.outcome, Some(RunOutcome::Aborted));
    assert!(progress.truncated);
    assert!(progress.error.as_deref().unwrap_or("").contains("connection reset"));

    let latest = sync.latest().await.expect("previous result kept");
    assert_eq!(latest.run, 1);
    assert!(!latest.result.truncated());
}

#[tokio::test]
async fn publish_policy_flags_partial_result() {
    let sync = controller(
        Arc::new(FailsAfterFirst {
            calls: AtomicUsize::new(0),
        }),
        PartialPolicy::Publish,
    );

    sync.trigger().await;
    settle(&sync).await;
    sync.trigger().await;
    settle(&sync).await;

    let latest = sync.latest().await.expect("published");
    assert_eq!(latest.run, 2);
    assert!(latest.result.truncated());
    assert_eq!(latest.result.outcome, RunOutcome::Aborted);
}

#[tokio::test]
async fn cancel_stops_run_between_pages() {
    let source = Arc::new(Gated {
        gate: Semaphore::new(0),
    });
    let sync = controller(source.clone(), PartialPolicy::Publish);

    sync.trigger().await;
    assert!(sync.cancel().await);
    source.gate.add_permits(10);
    settle(&sync).await;

    let progress = sync.progress().await;
    assert_eq!(progress.outcome, Some(RunOutcome::Cancelled));
    assert!(progress.truncated);
    assert!(!sync.cancel().await);
}

#[tokio::test]
async fn rules_file_is_reread_each_run() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.toml");
    std::fs::write(&path, "include_types = [\"horn\"]\ninclude_descriptions = []\n").unwrap();

    let items = vec![
        Item::new("h").with_attribute("InformaCastDeviceType", "Outdoor Horn"),
        Item::new("s").with_attribute("InformaCastDeviceType", "IPSpeaker"),
    ];
    let sync = SyncController::new(
        SyncConfig {
            source: Arc::new(Fixed(items)),
            settings: fast(),
            rules_path: Some(path.clone()),
            policy: PartialPolicy::Publish,
        },
        ClassifierRules::default(),
    );

    sync.trigger().await;
    settle(&sync).await;
    let ids: Vec<String> = sync.latest().await.unwrap().devices().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["h"]);

    std::fs::write(&path, "include_types = [\"speaker\"]\n").unwrap();
    sync.trigger().await;
    settle(&sync).await;
    let ids: Vec<String> = sync.latest().await.unwrap().devices().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["s"]);

    // A broken edit keeps the last good rules.
    std::fs::write(&path, "include_types = ").unwrap();
    sync.trigger().await;
    settle(&sync).await;
    let ids: Vec<String> = sync.latest().await.unwrap().devices().into_iter().map(|d| d.id).collect();
    assert_eq!(ids, vec!["s"]);
}
