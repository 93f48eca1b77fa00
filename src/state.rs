use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ::time::{format_description::well_known, OffsetDateTime};
use clap::ValueEnum;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::classify::{self, ClassificationFilter, ClassifierRules};
use crate::collector::{self, CollectorSettings, PageProgress, ProgressSink};
use crate::provider::PageSource;
use crate::types::{CollectionResult, DeviceRecord, Item, Progress};

/// What to do with the result of a run that ended early.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum PartialPolicy {
    /// Replace the previous result; it is flagged truncated.
    #[default]
    Publish,
    /// Keep the previous result.
    Discard,
}

/// A published collection result together with the rules that produced it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub run: u64,
    pub completed_at: String,
    pub rules: ClassifierRules,
    pub result: CollectionResult,
}

impl Snapshot {
    pub fn devices(&self) -> Vec<DeviceRecord> {
        self.result
            .items
            .iter()
            .map(|item| DeviceRecord::from_item(item, &self.rules))
            .collect()
    }
}

/// Outcome of a trigger request.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    Started(Progress),
    AlreadyRunning(Progress),
}

impl Trigger {
    pub fn started(&self) -> bool {
        matches!(self, Trigger::Started(_))
    }

    pub fn progress(&self) -> &Progress {
        match self {
            Trigger::Started(p) | Trigger::AlreadyRunning(p) => p,
        }
    }
}

/// Fixed inputs shared by every run.
pub struct SyncConfig {
    pub source: Arc<dyn PageSource>,
    pub settings: CollectorSettings,
    /// Re-read at the start of each run when set.
    pub rules_path: Option<PathBuf>,
    pub policy: PartialPolicy,
}

/// Owner of all shared sync state; cheap to clone.
///
/// Every read and write of progress and results goes through one lock.
/// Each run carries a generation number and may only write while it is
/// still the current generation.
#[derive(Clone)]
pub struct SyncController {
    inner: Arc<RwLock<SyncState>>,
    idle: Arc<Notify>,
    config: Arc<SyncConfig>,
}

#[derive(Debug)]
struct SyncState {
    generation: u64,
    progress: Progress,
    latest: Option<Arc<Snapshot>>,
    cancel: Option<CancellationToken>,
    rules: ClassifierRules,
}

impl SyncController {
    pub fn new(config: SyncConfig, rules: ClassifierRules) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SyncState {
                generation: 0,
                progress: Progress::default(),
                latest: None,
                cancel: None,
                rules,
            })),
            idle: Arc::new(Notify::new()),
            config: Arc::new(config),
        }
    }

    /// Start a run unless one is already in flight.
    pub async fn trigger(&self) -> Trigger {
        self.start(false).await
    }

    /// Cancel any in-flight run and start a fresh one.
    pub async fn restart(&self) -> Trigger {
        self.start(true).await
    }

    async fn start(&self, restart: bool) -> Trigger {
        let mut s = self.inner.write().await;
        if s.progress.is_running {
            if !restart {
                debug!(run = s.progress.run, "run already in flight, trigger ignored");
                return Trigger::AlreadyRunning(s.progress.clone());
            }
            if let Some(cancel) = s.cancel.take() {
                info!(run = s.progress.run, "cancelling in-flight run for restart");
                cancel.cancel();
            }
        }

        s.generation += 1;
        let run = s.generation;
        let cancel = CancellationToken::new();
        s.cancel = Some(cancel.clone());
        let last_completed = s.progress.last_completed.take();
        // Counters reset in the same critical section that flips `is_running`.
        s.progress = Progress {
            run,
            is_running: true,
            started_at: Some(now_rfc3339()),
            last_completed,
            ..Progress::default()
        };
        let progress = s.progress.clone();
        drop(s);

        let this = self.clone();
        tokio::spawn(async move { this.run(run, cancel).await });
        Trigger::Started(progress)
    }

    /// Signal the in-flight run, if any, to stop. Returns whether one was running.
    pub async fn cancel(&self) -> bool {
        let s = self.inner.read().await;
        match &s.cancel {
            Some(cancel) => {
                info!(run = s.progress.run, "cancelling in-flight run");
                cancel.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn progress(&self) -> Progress {
        self.inner.read().await.progress.clone()
    }

    /// The most recently published result.
    pub async fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner.read().await.latest.clone()
    }

    /// Wait until no run is in flight.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if !self.inner.read().await.progress.is_running {
                return;
            }
            notified.await;
        }
    }

    /// Trigger a run every `every`, skipping ticks while one is in flight.
    pub fn spawn_refresh(&self, every: Duration) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately; startup sync is separate.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if !this.trigger().await.started() {
                    debug!("scheduled refresh skipped, run in flight");
                }
            }
        })
    }

    async fn run(&self, run: u64, cancel: CancellationToken) {
        let rules = self.current_rules().await;
        let filter = ClassificationFilter::new(&rules);
        let sink = RunSink {
            state: self.inner.clone(),
            run,
        };
        info!(run, "collection run started");
        let result = collector::collect(
            self.config.source.as_ref(),
            &self.config.settings,
            |item: &Item| filter.classify(item),
            &cancel,
            &sink,
        )
        .await;
        self.finish(run, rules, result).await;
    }

    async fn current_rules(&self) -> ClassifierRules {
        if let Some(path) = &self.config.rules_path {
            match classify::load_rules_from_path(path) {
                Ok(rules) => {
                    self.inner.write().await.rules = rules.clone();
                    return rules;
                }
                Err(err) => warn!(
                    path = %path.display(),
                    error = %format!("{err:#}"),
                    "keeping previous classifier rules"
                ),
            }
        }
        self.inner.read().await.rules.clone()
    }

    async fn finish(&self, run: u64, rules: ClassifierRules, result: CollectionResult) {
        let mut s = self.inner.write().await;
        if s.generation != run {
            debug!(run, current = s.generation, "dropping result of superseded run");
            return;
        }

        let now = now_rfc3339();
        s.cancel = None;
        s.progress.is_running = false;
        s.progress.cursor = Some(result.cursor.to_string());
        s.progress.scanned = result.summary.scanned;
        s.progress.matched = result.summary.matched;
        s.progress.last_completed = Some(now.clone());
        s.progress.outcome = Some(result.outcome);
        s.progress.truncated = result.truncated();
        s.progress.error = result.error.clone();

        if !result.truncated() || self.config.policy == PartialPolicy::Publish {
            s.latest = Some(Arc::new(Snapshot {
                run,
                completed_at: now,
                rules,
                result,
            }));
        } else {
            warn!(run, outcome = ?result.outcome, "run ended early, previous result kept");
        }
        drop(s);
        self.idle.notify_waiters();
    }
}

/// Writes per-page progress into the shared state while `run` is current.
struct RunSink {
    state: Arc<RwLock<SyncState>>,
    run: u64,
}

#[async_trait::async_trait]
impl ProgressSink for RunSink {
    async fn publish(&self, page: PageProgress) {
        let mut s = self.state.write().await;
        if s.generation != self.run {
            return;
        }
        s.progress.cursor = Some(page.cursor.to_string());
        s.progress.scanned = page.scanned;
        s.progress.matched = page.matched;
    }
}

fn now_rfc3339() -> String {
    OffsetDateTime::now_utc()
        .format(&well_known::Rfc3339)
        .unwrap_or_else(|_| String::from("1970-01-01T00:00:00Z"))
}
