//! Per-scope interval aggregation.
//!
//! Producers enqueue completed transactions; a single worker per scope
//! merges them into the active [`IntervalBuffer`] and hands every closed
//! buffer to a spawned flush task that writes level-0 rows and the level-1
//! needs-rollup marker.

pub mod accumulator;
pub mod buffer;
pub mod collector;
pub mod event;

use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregate::Aggregate;
use crate::clock::{adjusted_ttl, bucket_end, millis, Clock};
use crate::config::{AggregationConfig, RollupConfig};
use crate::export::health::HealthMetrics;
use crate::store::{MarkerKind, Store};

pub use accumulator::IntervalAccumulator;
pub use buffer::{BufferLimits, IntervalBuffer, SharedAccumulator};
pub use event::CompletedTransaction;

use event::PendingTransaction;

/// Events drained per wakeup before the worker re-evaluates idle state.
const DRAIN_BATCH: usize = 256;

/// Attempts at writing the level-1 marker after a successful level-0 write.
const MARKER_WRITE_ATTEMPTS: usize = 2;

/// Tunables for one scope's aggregator.
#[derive(Clone, Copy, Debug)]
pub struct AggregatorSettings {
    pub interval_millis: i64,
    pub idle_margin: Duration,
    pub max_clock_lead_millis: i64,
    pub queue_capacity: usize,
    pub limits: BufferLimits,
}

impl AggregatorSettings {
    pub fn from_config(aggregation: &AggregationConfig, rollup: &RollupConfig) -> Self {
        Self {
            interval_millis: rollup.base_interval_millis(),
            idle_margin: aggregation.idle_margin,
            max_clock_lead_millis: millis(aggregation.max_clock_lead),
            queue_capacity: aggregation.queue_capacity,
            limits: BufferLimits {
                statements: aggregation.statement_limits(),
                max_transaction_names_per_type: aggregation.max_transaction_names_per_type,
            },
        }
    }
}

/// Collaborators shared by every scope's aggregator.
pub struct AggregatorContext<S> {
    pub store: Arc<S>,
    pub rollup: Arc<RollupConfig>,
    pub settings: AggregatorSettings,
    pub clock: Arc<dyn Clock>,
    pub health: Option<Arc<HealthMetrics>>,
}

impl<S> Clone for AggregatorContext<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            rollup: Arc::clone(&self.rollup),
            settings: self.settings,
            clock: Arc::clone(&self.clock),
            health: self.health.clone(),
        }
    }
}

/// Interval aggregator of a single scope.
///
/// `enqueue` never blocks on downstream I/O: a full queue drops the event.
pub struct IntervalAggregator {
    scope: Arc<str>,
    clock: Arc<dyn Clock>,
    max_clock_lead_millis: i64,
    tx: mpsc::Sender<PendingTransaction>,
    /// Serializes capture-time assignment with the push onto the queue.
    enqueue_lock: Arc<Mutex<()>>,
    active: Arc<ArcSwapOption<IntervalBuffer>>,
    health: Option<Arc<HealthMetrics>>,
    cancel: CancellationToken,
    worker: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IntervalAggregator {
    /// Spawns the scope's worker. Must be called within a tokio runtime.
    pub fn start<S: Store>(
        scope: &str,
        ctx: AggregatorContext<S>,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::channel(ctx.settings.queue_capacity.max(1));
        let scope: Arc<str> = Arc::from(scope);
        let enqueue_lock = Arc::new(Mutex::new(()));
        let active = Arc::new(ArcSwapOption::empty());

        let worker = IntervalWorker {
            scope: Arc::clone(&scope),
            settings: ctx.settings,
            enqueue_lock: Arc::clone(&enqueue_lock),
            active: Arc::clone(&active),
            last_closed_end: None,
            in_flight: Vec::new(),
            ctx: Arc::new(ctx.clone()),
        };
        let worker_cancel = cancel.clone();
        let handle = tokio::spawn(async move { worker.run(rx, worker_cancel).await });

        info!(
            scope = %scope,
            interval_ms = ctx.settings.interval_millis,
            queue_capacity = ctx.settings.queue_capacity,
            "interval aggregator started",
        );

        Self {
            scope,
            clock: ctx.clock,
            max_clock_lead_millis: ctx.settings.max_clock_lead_millis,
            tx,
            enqueue_lock,
            active,
            health: ctx.health,
            cancel,
            worker: tokio::sync::Mutex::new(Some(handle)),
        }
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    /// Enqueues `txn` stamped with the current clock time.
    ///
    /// Returns whether the transaction was accepted.
    pub fn enqueue(&self, txn: CompletedTransaction) -> bool {
        let _guard = self.enqueue_lock.lock();
        let capture_time = self.clock.now_millis();
        self.push(capture_time, txn)
    }

    /// Enqueues `txn` with a producer-supplied capture time. A time that
    /// falls into an already closed bucket is counted in the next open one.
    /// A time further than `max_clock_lead` ahead of the clock is replaced by
    /// the clock time.
    pub fn enqueue_at(&self, capture_time: i64, txn: CompletedTransaction) -> bool {
        let _guard = self.enqueue_lock.lock();
        let now = self.clock.now_millis();
        let capture_time = if capture_time > now.saturating_add(self.max_clock_lead_millis) {
            warn!(
                scope = %self.scope,
                capture_time,
                now,
                "capture time too far ahead of clock, using clock time",
            );
            now
        } else {
            capture_time
        };
        self.push(capture_time, txn)
    }

    /// Snapshot of the open interval for the given key, if it has data.
    pub fn live_snapshot(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
    ) -> Option<Aggregate> {
        let active = self.active.load_full()?;
        match active.snapshot(transaction_type, transaction_name)? {
            Ok(aggregate) => Some(aggregate),
            Err(e) => {
                warn!(
                    scope = %self.scope,
                    transaction_type,
                    error = %e,
                    "live snapshot failed",
                );
                None
            }
        }
    }

    /// Bucket end of the open interval, if any.
    pub fn active_bucket_end(&self) -> Option<i64> {
        self.active.load().as_ref().map(|b| b.bucket_end())
    }

    /// Stops the worker after it has merged queued events, flushed the
    /// open interval and waited for in-flight flushes.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let worker = { self.worker.lock().await.take() };
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!(scope = %self.scope, error = %e, "aggregator worker join failed");
            }
        }
    }

    fn push(&self, capture_time: i64, transaction: CompletedTransaction) -> bool {
        let pending = PendingTransaction {
            capture_time,
            transaction,
        };
        match self.tx.try_send(pending) {
            Ok(()) => {
                if let Some(h) = &self.health {
                    h.transactions_received.inc();
                }
                true
            }
            Err(TrySendError::Full(_)) => {
                if let Some(h) = &self.health {
                    h.transactions_dropped.inc();
                }
                warn!(scope = %self.scope, "aggregation queue full, dropping transaction");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(scope = %self.scope, "aggregator stopped, dropping transaction");
                false
            }
        }
    }
}

enum Received {
    Event(PendingTransaction),
    Idle,
    Closed,
}

/// Single consumer of one scope's queue. Owns bucket-closing decisions.
struct IntervalWorker<S> {
    scope: Arc<str>,
    settings: AggregatorSettings,
    enqueue_lock: Arc<Mutex<()>>,
    active: Arc<ArcSwapOption<IntervalBuffer>>,
    last_closed_end: Option<i64>,
    in_flight: Vec<JoinHandle<()>>,
    ctx: Arc<AggregatorContext<S>>,
}

impl<S: Store> IntervalWorker<S> {
    async fn run(mut self, mut rx: mpsc::Receiver<PendingTransaction>, cancel: CancellationToken) {
        loop {
            let wait = self.idle_wait();
            tokio::select! {
                biased;

                _ = cancel.cancelled() => break,

                received = next_event(&mut rx, wait) => match received {
                    Received::Event(pending) => {
                        self.process(pending);
                        for _ in 1..DRAIN_BATCH {
                            match rx.try_recv() {
                                Ok(pending) => self.process(pending),
                                Err(_) => break,
                            }
                        }
                    }
                    Received::Idle => self.check_idle(&mut rx),
                    Received::Closed => break,
                },
            }
        }

        rx.close();
        while let Ok(pending) = rx.try_recv() {
            self.process(pending);
        }
        self.close_active();

        for handle in self.in_flight.drain(..) {
            if let Err(e) = handle.await {
                warn!(scope = %self.scope, error = %e, "flush task join failed");
            }
        }
        debug!(scope = %self.scope, "interval aggregator stopped");
    }

    /// How long to wait for the next event before re-checking the open
    /// bucket. `None` waits indefinitely when nothing is open.
    fn idle_wait(&self) -> Option<Duration> {
        let active = self.active.load();
        let active = active.as_ref()?;
        let remaining = active
            .bucket_end()
            .saturating_sub(self.ctx.clock.now_millis())
            .max(0);
        Some(Duration::from_millis(remaining as u64) + self.settings.idle_margin)
    }

    fn process(&mut self, pending: PendingTransaction) {
        let interval = self.settings.interval_millis;
        let mut target = bucket_end(pending.capture_time, interval);
        if let Some(closed) = self.last_closed_end {
            if target <= closed {
                debug!(
                    scope = %self.scope,
                    capture_time = pending.capture_time,
                    closed_bucket_end = closed,
                    "late transaction counted in the next open bucket",
                );
                target = closed.saturating_add(interval);
            }
        }

        let buffer = match self.active.load_full() {
            Some(active) if target <= active.bucket_end() => active,
            Some(_) => {
                self.close_active();
                self.open(target)
            }
            None => self.open(target),
        };

        if !buffer.add(&pending.transaction) {
            if let Some(h) = &self.ctx.health {
                h.name_overflow.inc();
            }
        }
    }

    /// Closes the open bucket if its end has passed and, with producers
    /// locked out, the queue is still empty.
    fn check_idle(&mut self, rx: &mut mpsc::Receiver<PendingTransaction>) {
        let Some(active_end) = self.active.load().as_ref().map(|b| b.bucket_end()) else {
            return;
        };

        let next = {
            let _guard = self.enqueue_lock.lock();
            match rx.try_recv() {
                Ok(pending) => Some(pending),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => {
                    if self.ctx.clock.now_millis() <= active_end {
                        return;
                    }
                    None
                }
            }
        };

        match next {
            Some(pending) => self.process(pending),
            None => {
                debug!(scope = %self.scope, bucket_end = active_end, "closing idle interval");
                self.close_active();
            }
        }
    }

    fn open(&mut self, bucket_end: i64) -> Arc<IntervalBuffer> {
        let buffer = Arc::new(IntervalBuffer::new(bucket_end, self.settings.limits));
        self.active.store(Some(Arc::clone(&buffer)));
        buffer
    }

    fn close_active(&mut self) {
        let Some(buffer) = self.active.swap(None) else {
            return;
        };
        self.last_closed_end = Some(buffer.bucket_end());
        if buffer.is_empty() {
            return;
        }

        self.in_flight.retain(|h| !h.is_finished());
        let ctx = Arc::clone(&self.ctx);
        let scope = Arc::clone(&self.scope);
        self.in_flight
            .push(tokio::spawn(flush_interval(ctx, scope, buffer)));
    }
}

async fn next_event(
    rx: &mut mpsc::Receiver<PendingTransaction>,
    wait: Option<Duration>,
) -> Received {
    let received = match wait {
        None => rx.recv().await,
        Some(wait) => match tokio::time::timeout(wait, rx.recv()).await {
            Ok(received) => received,
            Err(_) => return Received::Idle,
        },
    };
    match received {
        Some(pending) => Received::Event(pending),
        None => Received::Closed,
    }
}

/// Writes a closed interval as level-0 rows, then the level-1 marker.
///
/// A failed level-0 write is logged and the interval is dropped. The marker
/// write is retried once with the same token; if both attempts fail the
/// level-0 rows stay in the store but are never rolled up.
async fn flush_interval<S: Store>(
    ctx: Arc<AggregatorContext<S>>,
    scope: Arc<str>,
    buffer: Arc<IntervalBuffer>,
) {
    let started = Instant::now();
    let capture_time = buffer.bucket_end();
    let collected = collector::collect(&buffer);
    drop(buffer);

    let batch = collected.batch;
    if batch.is_empty() {
        return;
    }

    let ttl = adjusted_ttl(
        ctx.rollup.ttl(0).unwrap_or_default(),
        capture_time,
        ctx.clock.now_millis(),
    );
    if let Err(e) = ctx
        .store
        .store_aggregates(&scope, 0, capture_time, ttl, &batch)
        .await
    {
        if let Some(h) = &ctx.health {
            h.flush_errors.inc();
        }
        error!(
            scope = %scope,
            bucket_end = capture_time,
            error = %e,
            "interval flush failed, dropping interval",
        );
        return;
    }

    if let Some(next_interval) = ctx.rollup.interval_millis(1) {
        let marker_end = bucket_end(capture_time, next_interval);
        let keys = batch.transaction_types();
        let token = Uuid::new_v4();
        for attempt in 1..=MARKER_WRITE_ATTEMPTS {
            match ctx
                .store
                .write_needs_rollup(&scope, MarkerKind::Aggregate, 1, marker_end, token, &keys)
                .await
            {
                Ok(()) => break,
                Err(e) if attempt < MARKER_WRITE_ATTEMPTS => {
                    warn!(
                        scope = %scope,
                        bucket_end = capture_time,
                        attempt,
                        error = %e,
                        "writing needs-rollup marker failed, retrying",
                    );
                }
                Err(e) => {
                    if let Some(h) = &ctx.health {
                        h.flush_errors.inc();
                    }
                    error!(
                        scope = %scope,
                        bucket_end = capture_time,
                        error = %e,
                        "writing needs-rollup marker failed, interval will not be rolled up",
                    );
                }
            }
        }
    }

    let records = batch.overall.len() + batch.transactions.len();
    if let Some(h) = &ctx.health {
        h.intervals_flushed.inc();
        h.aggregate_records_written.inc_by(records as f64);
        h.flush_duration.observe(started.elapsed().as_secs_f64());
    }
    debug!(
        scope = %scope,
        bucket_end = capture_time,
        records,
        skipped = collected.skipped,
        elapsed_ms = millis(started.elapsed()),
        "interval flushed",
    );
}

/// Multi-scope front: one [`IntervalAggregator`] per scope, started on
/// first use.
pub struct Aggregators<S> {
    ctx: AggregatorContext<S>,
    scopes: DashMap<String, Arc<IntervalAggregator>>,
    cancel: CancellationToken,
}

impl<S: Store> Aggregators<S> {
    pub fn new(ctx: AggregatorContext<S>, cancel: CancellationToken) -> Self {
        Self {
            ctx,
            scopes: DashMap::new(),
            cancel,
        }
    }

    /// Returns the aggregator for `scope`, starting it if needed.
    pub fn scope(&self, scope: &str) -> Arc<IntervalAggregator> {
        if let Some(existing) = self.scopes.get(scope) {
            return Arc::clone(existing.value());
        }
        Arc::clone(
            self.scopes
                .entry(scope.to_string())
                .or_insert_with(|| {
                    Arc::new(IntervalAggregator::start(
                        scope,
                        self.ctx.clone(),
                        self.cancel.child_token(),
                    ))
                })
                .value(),
        )
    }

    pub fn enqueue(&self, scope: &str, txn: CompletedTransaction) -> bool {
        self.scope(scope).enqueue(txn)
    }

    pub fn enqueue_at(&self, scope: &str, capture_time: i64, txn: CompletedTransaction) -> bool {
        self.scope(scope).enqueue_at(capture_time, txn)
    }

    pub fn live_snapshot(
        &self,
        scope: &str,
        transaction_type: &str,
        transaction_name: Option<&str>,
    ) -> Option<Aggregate> {
        let aggregator = Arc::clone(self.scopes.get(scope)?.value());
        aggregator.live_snapshot(transaction_type, transaction_name)
    }

    /// Scopes with a running aggregator, sorted.
    pub fn scope_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.scopes.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Shuts down every scope's aggregator, flushing open intervals.
    pub async fn shutdown(&self) {
        let aggregators: Vec<_> = self
            .scopes
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for aggregator in aggregators {
            aggregator.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::aggregate::Subtable;
    use crate::clock::ManualClock;
    use crate::config::RollupLevelConfig;
    use crate::store::memory::InMemoryStore;

    const MS: i64 = 1_000_000;

    fn rollup() -> RollupConfig {
        RollupConfig::with_levels(vec![
            RollupLevelConfig::new(Duration::from_secs(60), Duration::from_secs(86_400)),
            RollupLevelConfig::new(Duration::from_secs(300), Duration::from_secs(86_400)),
        ])
    }

    fn context(
        store: Arc<InMemoryStore>,
        clock: Arc<dyn Clock>,
    ) -> AggregatorContext<InMemoryStore> {
        let rollup = rollup();
        AggregatorContext {
            store,
            settings: AggregatorSettings::from_config(&AggregationConfig::default(), &rollup),
            rollup: Arc::new(rollup),
            clock,
            health: None,
        }
    }

    #[tokio::test]
    async fn test_events_across_boundary_flush_separately() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let aggregator = IntervalAggregator::start(
            "agent-1",
            context(Arc::clone(&store), clock),
            CancellationToken::new(),
        );

        assert!(aggregator.enqueue_at(10_000, CompletedTransaction::new("Web", "/a", 10 * MS)));
        assert!(aggregator.enqueue_at(50_000, CompletedTransaction::new("Web", "/a", 20 * MS)));
        assert!(aggregator.enqueue_at(70_000, CompletedTransaction::new("Web", "/a", 30 * MS)));
        aggregator.shutdown().await;

        let first = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", None, 0, 60_000)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);
        let agg = Aggregate::from_rows(60_000, first);
        assert_eq!(agg.transaction_count, 2);
        assert_eq!(agg.total_duration_nanos, 30 * MS);

        let second = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", None, 60_000, 120_000)
            .await
            .unwrap();
        let agg = Aggregate::from_rows(120_000, second);
        assert_eq!(agg.transaction_count, 1);

        let markers = store
            .read_needs_rollup("agent-1", MarkerKind::Aggregate, 1)
            .await
            .unwrap();
        assert_eq!(markers.len(), 2);
        assert!(markers.iter().all(|m| m.bucket_end == 300_000));
        assert_eq!(markers[0].keys, BTreeSet::from(["Web".to_string()]));
    }

    #[tokio::test]
    async fn test_late_event_does_not_reopen_closed_bucket() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(0));
        let aggregator = IntervalAggregator::start(
            "agent-1",
            context(Arc::clone(&store), clock),
            CancellationToken::new(),
        );

        aggregator.enqueue_at(10_000, CompletedTransaction::new("Web", "/a", MS));
        aggregator.enqueue_at(70_000, CompletedTransaction::new("Web", "/a", MS));
        aggregator.enqueue_at(20_000, CompletedTransaction::new("Web", "/a", MS));
        aggregator.shutdown().await;

        let first = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", None, 0, 60_000)
            .await
            .unwrap();
        assert_eq!(Aggregate::from_rows(60_000, first).transaction_count, 1);
        let second = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", None, 60_000, 120_000)
            .await
            .unwrap();
        assert_eq!(Aggregate::from_rows(120_000, second).transaction_count, 2);
    }

    #[tokio::test]
    async fn test_enqueue_uses_clock_for_capture_time() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(125_000));
        let aggregator = IntervalAggregator::start(
            "agent-1",
            context(Arc::clone(&store), clock),
            CancellationToken::new(),
        );

        aggregator.enqueue(CompletedTransaction::new("Web", "/a", MS));
        aggregator.shutdown().await;

        let rows = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", Some("/a"), 120_000, 180_000)
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_capture_time_near_max_does_not_stop_worker() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = IntervalAggregator::start(
            "agent-1",
            context(Arc::clone(&store), Arc::new(ManualClock::new(30_000))),
            CancellationToken::new(),
        );

        assert!(aggregator.enqueue_at(i64::MAX - 10, CompletedTransaction::new("Web", "/a", MS)));
        assert!(aggregator.enqueue_at(1_000, CompletedTransaction::new("Web", "/a", MS)));
        aggregator.shutdown().await;

        let rows = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", None, 0, 60_000)
            .await
            .unwrap();
        assert_eq!(Aggregate::from_rows(60_000, rows).transaction_count, 2);
    }

    #[tokio::test]
    async fn test_far_future_capture_time_uses_clock_bucket() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = IntervalAggregator::start(
            "agent-1",
            context(Arc::clone(&store), Arc::new(ManualClock::new(30_000))),
            CancellationToken::new(),
        );

        let ten_days = 10 * 24 * 60 * 60 * 1000;
        aggregator.enqueue_at(ten_days, CompletedTransaction::new("Web", "/a", MS));
        aggregator.enqueue_at(70_000, CompletedTransaction::new("Web", "/a", MS));
        aggregator.shutdown().await;

        let first = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", None, 0, 60_000)
            .await
            .unwrap();
        assert_eq!(Aggregate::from_rows(60_000, first).transaction_count, 1);
        let second = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", None, 60_000, 120_000)
            .await
            .unwrap();
        assert_eq!(Aggregate::from_rows(120_000, second).transaction_count, 1);
        let future = store
            .read_for_rollup("agent-1", Subtable::Summary, 0, "Web", None, 120_000, i64::MAX)
            .await
            .unwrap();
        assert!(future.is_empty());
    }

    #[tokio::test]
    async fn test_enqueue_after_shutdown_is_rejected() {
        let store = Arc::new(InMemoryStore::new());
        let aggregator = IntervalAggregator::start(
            "agent-1",
            context(store, Arc::new(ManualClock::new(0))),
            CancellationToken::new(),
        );
        aggregator.shutdown().await;
        assert!(!aggregator.enqueue(CompletedTransaction::new("Web", "/a", MS)));
    }

    #[tokio::test]
    async fn test_aggregators_route_by_scope() {
        let store = Arc::new(InMemoryStore::new());
        let aggregators = Aggregators::new(
            context(Arc::clone(&store), Arc::new(ManualClock::new(0))),
            CancellationToken::new(),
        );

        aggregators.enqueue_at("a", 1_000, CompletedTransaction::new("Web", "/x", MS));
        aggregators.enqueue_at("b", 1_000, CompletedTransaction::new("Web", "/x", MS));
        aggregators.enqueue_at("b", 2_000, CompletedTransaction::new("Web", "/y", MS));
        assert_eq!(aggregators.scope_names(), vec!["a".to_string(), "b".to_string()]);
        assert!(aggregators.live_snapshot("missing", "Web", None).is_none());
        aggregators.shutdown().await;

        let scopes = store.list_scopes().await.unwrap();
        assert_eq!(scopes, vec!["a".to_string(), "b".to_string()]);
        let b = store
            .read_for_rollup("b", Subtable::Summary, 0, "Web", None, 0, 60_000)
            .await
            .unwrap();
        assert_eq!(Aggregate::from_rows(60_000, b).transaction_count, 2);
    }
}
