use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::aggregate::{Aggregate, HistogramError, StatementLimits, LIMIT_EXCEEDED_BUCKET};

use super::accumulator::IntervalAccumulator;
use super::event::CompletedTransaction;

/// An accumulator behind its own lock.
pub type SharedAccumulator = Arc<Mutex<IntervalAccumulator>>;

/// Bounds applied to one open interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferLimits {
    pub statements: StatementLimits,
    pub max_transaction_names_per_type: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            statements: StatementLimits::default(),
            max_transaction_names_per_type: 500,
        }
    }
}

/// The accumulator set of one open interval of one scope.
///
/// Holds an overall accumulator per transaction type and one per
/// (type, name). Only the scope's worker adds to it; live readers and the
/// flush task go through each accumulator's own lock.
pub struct IntervalBuffer {
    bucket_end: i64,
    limits: BufferLimits,
    overall: DashMap<String, SharedAccumulator>,
    transactions: DashMap<(String, String), SharedAccumulator>,
    names_per_type: DashMap<String, usize>,
    name_overflow_warned: AtomicBool,
    name_overflows: AtomicU64,
}

impl IntervalBuffer {
    pub fn new(bucket_end: i64, limits: BufferLimits) -> Self {
        Self {
            bucket_end,
            limits,
            overall: DashMap::with_capacity(4),
            transactions: DashMap::with_capacity(64),
            names_per_type: DashMap::with_capacity(4),
            name_overflow_warned: AtomicBool::new(false),
            name_overflows: AtomicU64::new(0),
        }
    }

    /// Inclusive end of the bucket this set accumulates, epoch ms.
    pub fn bucket_end(&self) -> i64 {
        self.bucket_end
    }

    /// Merges `txn` into the overall and per-name accumulators of its type.
    ///
    /// Returns `false` when the name cap for the type was hit and the
    /// transaction was recorded under the overflow name instead.
    pub fn add(&self, txn: &CompletedTransaction) -> bool {
        let overall = Arc::clone(
            self.overall
                .entry(txn.transaction_type.clone())
                .or_insert_with(|| self.new_accumulator())
                .value(),
        );
        overall.lock().add(txn);

        let (named, within_cap) = self.named_accumulator(txn);
        named.lock().add(txn);
        within_cap
    }

    /// Looks up the accumulator for `transaction_type` and optional name.
    pub fn accumulator(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
    ) -> Option<SharedAccumulator> {
        match transaction_name {
            None => self
                .overall
                .get(transaction_type)
                .map(|e| Arc::clone(e.value())),
            Some(name) => self
                .transactions
                .get(&(transaction_type.to_string(), name.to_string()))
                .map(|e| Arc::clone(e.value())),
        }
    }

    /// Snapshot of one accumulator, taken under its lock.
    pub fn snapshot(
        &self,
        transaction_type: &str,
        transaction_name: Option<&str>,
    ) -> Option<Result<Aggregate, HistogramError>> {
        let acc = self.accumulator(transaction_type, transaction_name)?;
        let snapshot = acc.lock().snapshot(self.bucket_end);
        Some(snapshot)
    }

    pub fn is_empty(&self) -> bool {
        self.overall.is_empty()
    }

    /// Transactions recorded under the overflow name because of the cap.
    pub fn name_overflows(&self) -> u64 {
        self.name_overflows.load(Ordering::Relaxed)
    }

    pub(crate) fn overall_entries(&self) -> Vec<(String, SharedAccumulator)> {
        let mut entries: Vec<_> = self
            .overall
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub(crate) fn transaction_entries(&self) -> Vec<((String, String), SharedAccumulator)> {
        let mut entries: Vec<_> = self
            .transactions
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    fn named_accumulator(&self, txn: &CompletedTransaction) -> (SharedAccumulator, bool) {
        let key = (
            txn.transaction_type.clone(),
            txn.transaction_name.clone(),
        );
        if let Some(existing) = self.transactions.get(&key) {
            return (Arc::clone(existing.value()), true);
        }

        let within_cap = {
            let mut names = self
                .names_per_type
                .entry(txn.transaction_type.clone())
                .or_insert(0);
            if *names < self.limits.max_transaction_names_per_type {
                *names += 1;
                true
            } else {
                false
            }
        };

        let key = if within_cap {
            key
        } else {
            self.name_overflows.fetch_add(1, Ordering::Relaxed);
            if !self.name_overflow_warned.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    transaction_type = %txn.transaction_type,
                    limit = self.limits.max_transaction_names_per_type,
                    "transaction name cap reached, recording further names as overflow",
                );
            }
            (txn.transaction_type.clone(), LIMIT_EXCEEDED_BUCKET.to_string())
        };

        let acc = Arc::clone(
            self.transactions
                .entry(key)
                .or_insert_with(|| self.new_accumulator())
                .value(),
        );
        (acc, within_cap)
    }

    fn new_accumulator(&self) -> SharedAccumulator {
        Arc::new(Mutex::new(IntervalAccumulator::new(self.limits.statements)))
    }
}

impl std::fmt::Debug for IntervalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IntervalBuffer")
            .field("bucket_end", &self.bucket_end)
            .field("types", &self.overall.len())
            .field("transactions", &self.transactions.len())
            .finish()
    }
}
