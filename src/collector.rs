use std::time::Duration;

use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::pagination::{Advance, PaginationStrategy};
use crate::provider::{FetchError, PageSource};
use crate::types::{CollectionResult, Cursor, Record, RunOutcome};

#[derive(Debug, Clone)]
pub struct CollectorSettings {
    pub page_size: usize,
    /// Ceiling on items received in one run, duplicates included.
    pub max_items: u64,
    pub page_delay: Duration,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Consecutive rate-limit responses tolerated before giving up.
    pub max_rate_limit_retries: u32,
    pub strategy: PaginationStrategy,
}

impl Default for CollectorSettings {
    fn default() -> Self {
        Self {
            page_size: 100,
            max_items: 30_000,
            page_delay: Duration::from_millis(100),
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(60),
            max_rate_limit_retries: 20,
            strategy: PaginationStrategy::Auto,
        }
    }
}

/// Counters published after each page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageProgress {
    /// Position the next page is read from.
    pub cursor: Cursor,
    pub scanned: u64,
    pub matched: u64,
}

/// Receives incremental progress from a running collection.
#[async_trait::async_trait]
pub trait ProgressSink: Send + Sync {
    async fn publish(&self, progress: PageProgress);
}

/// Sink that drops every update.
pub struct NoProgress;

#[async_trait::async_trait]
impl ProgressSink for NoProgress {
    async fn publish(&self, _progress: PageProgress) {}
}

/// Enumerate every page of `source`, folding items that pass `filter` into the result.
///
/// Never fails: faults end the run early and the partial result is returned
/// with an outcome other than [`RunOutcome::Completed`].
pub async fn collect<S, T, F>(
    source: &S,
    settings: &CollectorSettings,
    filter: F,
    cancel: &CancellationToken,
    sink: &dyn ProgressSink,
) -> CollectionResult<T>
where
    S: PageSource<T> + ?Sized,
    T: Record,
    F: Fn(&T) -> bool,
{
    let page_size = settings.page_size.max(1);
    let mut result = CollectionResult::default();
    let mut cursor = Cursor::default();
    let mut position = Cursor::default();
    let mut backoff = Backoff::new(settings.initial_backoff, settings.max_backoff);
    let mut throttled = 0u32;

    let outcome = loop {
        if cancel.is_cancelled() {
            break RunOutcome::Cancelled;
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => break RunOutcome::Cancelled,
            fetched = source.fetch_page(&cursor, page_size) => fetched,
        };
        let page = match fetched {
            Ok(page) => page,
            Err(FetchError::RateLimited { retry_after }) => {
                throttled += 1;
                if throttled > settings.max_rate_limit_retries {
                    warn!(%cursor, throttled, "giving up after repeated rate limiting");
                    result.error = Some(format!("rate limited {throttled} times in a row"));
                    break RunOutcome::Aborted;
                }
                let wait = backoff.next(retry_after);
                info!(%cursor, wait_ms = wait.as_millis() as u64, "rate limited, backing off");
                if !pause(wait, cancel).await {
                    break RunOutcome::Cancelled;
                }
                continue;
            }
            Err(err) => {
                warn!(%cursor, error = %err, "page fetch failed, keeping partial result");
                result.error = Some(err.to_string());
                break RunOutcome::Aborted;
            }
        };
        throttled = 0;
        backoff.reset();
        result.summary.pages += 1;

        let advance = settings.strategy.advance(&cursor, &page, page_size);
        let received = page.data.len();
        let mut taken = 0u64;
        // Set when an item of this page was left unabsorbed.
        let mut hit_ceiling = false;
        for item in page.data {
            if result.received() >= settings.max_items {
                hit_ceiling = true;
                break;
            }
            let matched = filter(&item);
            result.absorb(item, matched);
            taken += 1;
        }
        debug!(%cursor, received, scanned = result.summary.scanned, "page absorbed");

        position = match &advance {
            Advance::Next(next) if !hit_ceiling => next.clone(),
            _ => cursor.advanced_by(taken),
        };
        sink.publish(PageProgress {
            cursor: position.clone(),
            scanned: result.summary.scanned,
            matched: result.summary.matched,
        })
        .await;

        let next = match advance {
            Advance::Done if !hit_ceiling => break RunOutcome::Completed,
            Advance::Next(next) if !hit_ceiling && result.received() < settings.max_items => next,
            _ => {
                warn!(
                    max_items = settings.max_items,
                    scanned = result.summary.scanned,
                    "item ceiling reached before end of data, result truncated"
                );
                break RunOutcome::Truncated;
            }
        };
        if matches!(next, Cursor::Token(_)) && next == cursor {
            warn!(%cursor, "provider repeated the cursor it was given");
            result.error = Some(format!("provider repeated cursor {cursor}"));
            break RunOutcome::Aborted;
        }
        cursor = next;

        if !pause(settings.page_delay, cancel).await {
            break RunOutcome::Cancelled;
        }
    };

    result.cursor = position;
    result.outcome = outcome;
    info!(
        ?outcome,
        scanned = result.summary.scanned,
        matched = result.summary.matched,
        pages = result.summary.pages,
        "collection finished"
    );
    result
}

/// Sleep unless cancelled first. Returns `false` on cancellation.
async fn pause(duration: Duration, cancel: &CancellationToken) -> bool {
    if duration.is_zero() {
        return !cancel.is_cancelled();
    }
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = time::sleep(duration) => true,
    }
}

/// Exponential backoff capped at `max`.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Next wait. A provider hint wins over the computed delay, within the cap.
    fn next(&mut self, hint: Option<Duration>) -> Duration {
        let computed = self.current.min(self.max);
        self.current = self.current.saturating_mul(2).min(self.max);
        hint.unwrap_or(computed).min(self.max)
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}
