use crate::aggregate::{
    AdaptiveHistogram, Aggregate, HistogramError, ProfileNode, StatementCollector,
    StatementLimits, StatementSample, ThreadStats, TimerNode,
};

use super::event::CompletedTransaction;

/// Mutable statistics for one (type, name?) pair within one open interval.
///
/// Not internally synchronized: callers hold the lock that wraps this
/// particular instance for every call, including [`snapshot`].
///
/// [`snapshot`]: IntervalAccumulator::snapshot
#[derive(Debug)]
pub struct IntervalAccumulator {
    total_duration_nanos: i64,
    transaction_count: i64,
    error_count: i64,
    async_transactions: bool,
    main_thread_root_timer: TimerNode,
    aux_thread_root_timer: TimerNode,
    async_timers: TimerNode,
    main_thread_stats: ThreadStats,
    aux_thread_stats: ThreadStats,
    duration_histogram: AdaptiveHistogram,
    queries: StatementCollector,
    service_calls: StatementCollector,
    main_thread_profile: Option<ProfileNode>,
    aux_thread_profile: Option<ProfileNode>,
}

impl IntervalAccumulator {
    pub fn new(limits: StatementLimits) -> Self {
        Self {
            total_duration_nanos: 0,
            transaction_count: 0,
            error_count: 0,
            async_transactions: false,
            main_thread_root_timer: TimerNode::synthetic_root(),
            aux_thread_root_timer: TimerNode::synthetic_root(),
            async_timers: TimerNode::synthetic_root(),
            main_thread_stats: ThreadStats::default(),
            aux_thread_stats: ThreadStats::default(),
            duration_histogram: AdaptiveHistogram::new(),
            queries: StatementCollector::new(limits),
            service_calls: StatementCollector::new(limits),
            main_thread_profile: None,
            aux_thread_profile: None,
        }
    }

    /// Merges every measurement of `txn`. Call exactly once per transaction.
    pub fn add(&mut self, txn: &CompletedTransaction) {
        self.add_transaction(txn.duration_nanos, txn.error);
        self.async_transactions |= txn.async_transaction;
        if let Some(root) = &txn.main_thread_root_timer {
            self.merge_timer_tree(root);
        }
        for timer in &txn.aux_thread_root_timers {
            self.merge_aux_timer_tree(timer);
        }
        for timer in &txn.async_timers {
            self.merge_async_timer(timer);
        }
        self.merge_thread_stats(&txn.main_thread_stats, &txn.aux_thread_stats);
        self.merge_queries(&txn.queries);
        self.merge_service_calls(&txn.service_calls);
        if let Some(profile) = &txn.main_thread_profile {
            self.merge_profile(profile);
        }
        if let Some(profile) = &txn.aux_thread_profile {
            self.merge_aux_profile(profile);
        }
    }

    pub fn add_transaction(&mut self, duration_nanos: i64, is_error: bool) {
        self.total_duration_nanos = self.total_duration_nanos.saturating_add(duration_nanos);
        self.transaction_count += 1;
        if is_error {
            self.error_count += 1;
        }
        self.duration_histogram.add(duration_nanos);
    }

    pub fn merge_timer_tree(&mut self, root_timer: &TimerNode) {
        self.main_thread_root_timer.merge_child(root_timer);
    }

    pub fn merge_aux_timer_tree(&mut self, root_timer: &TimerNode) {
        self.aux_thread_root_timer.merge_child(root_timer);
    }

    pub fn merge_async_timer(&mut self, timer: &TimerNode) {
        self.async_timers.merge_child(timer);
    }

    pub fn merge_thread_stats(&mut self, main: &ThreadStats, aux: &ThreadStats) {
        self.main_thread_stats.merge(main);
        self.aux_thread_stats.merge(aux);
    }

    pub fn merge_queries(&mut self, queries: &[StatementSample]) {
        for query in queries {
            self.queries.add_sample(query);
        }
    }

    pub fn merge_service_calls(&mut self, calls: &[StatementSample]) {
        for call in calls {
            self.service_calls.add_sample(call);
        }
    }

    pub fn merge_profile(&mut self, profile: &ProfileNode) {
        self.main_thread_profile
            .get_or_insert_with(ProfileNode::synthetic_root)
            .merge(profile);
    }

    pub fn merge_aux_profile(&mut self, profile: &ProfileNode) {
        self.aux_thread_profile
            .get_or_insert_with(ProfileNode::synthetic_root)
            .merge(profile);
    }

    pub fn transaction_count(&self) -> i64 {
        self.transaction_count
    }

    /// Full texts of truncated statements seen so far, keyed by digest.
    pub fn full_texts(&self) -> impl Iterator<Item = (&String, &String)> {
        self.queries
            .full_texts()
            .iter()
            .chain(self.service_calls.full_texts().iter())
    }

    /// Copies current state into an immutable record. Does not mutate.
    pub fn snapshot(&self, capture_time: i64) -> Result<Aggregate, HistogramError> {
        Ok(Aggregate {
            capture_time,
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
            error_count: self.error_count,
            async_transactions: self.async_transactions,
            main_thread_root_timer: self.main_thread_root_timer.clone(),
            aux_thread_root_timer: self.aux_thread_root_timer.clone(),
            async_timers: self.async_timers.clone(),
            main_thread_stats: self.main_thread_stats,
            aux_thread_stats: self.aux_thread_stats,
            duration_histogram: self.duration_histogram.encode()?,
            queries: self.queries.entries(),
            service_calls: self.service_calls.entries(),
            main_thread_profile: self.main_thread_profile.clone(),
            aux_thread_profile: self.aux_thread_profile.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{StackFrame, ThreadState};

    const MS: i64 = 1_000_000;

    fn accumulator() -> IntervalAccumulator {
        IntervalAccumulator::new(StatementLimits::default())
    }

    #[test]
    fn test_three_transactions_snapshot() {
        let mut acc = accumulator();
        acc.add_transaction(10 * MS, false);
        acc.add_transaction(20 * MS, false);
        acc.add_transaction(30 * MS, false);

        let agg = acc.snapshot(60_000).unwrap();
        assert_eq!(agg.capture_time, 60_000);
        assert_eq!(agg.transaction_count, 3);
        assert_eq!(agg.total_duration_nanos, 60 * MS);
        assert_eq!(agg.error_count, 0);
        assert_eq!(agg.histogram().unwrap().percentile(50.0), 20 * MS);
    }

    #[test]
    fn test_snapshot_does_not_mutate() {
        let mut acc = accumulator();
        acc.add(&CompletedTransaction::new("Web", "/a", 5 * MS).with_error());

        let first = acc.snapshot(1_000).unwrap();
        let second = acc.snapshot(1_000).unwrap();
        assert_eq!(first, second);

        acc.add_transaction(MS, false);
        let third = acc.snapshot(1_000).unwrap();
        assert_eq!(third.transaction_count, 2);
        assert_eq!(third.error_count, 1);
    }

    #[test]
    fn test_add_merges_all_sections() {
        let mut acc = accumulator();
        let profile = ProfileNode::synthetic_root().with_child(
            ProfileNode::new(StackFrame::new("Worker", "run"), 2).with_state(ThreadState::Runnable),
        );
        let txn = CompletedTransaction::new("Web", "/orders", 8 * MS)
            .with_root_timer(
                TimerNode::new("http request", 8 * MS, 1)
                    .with_child(TimerNode::new("jdbc query", 3 * MS, 2)),
            )
            .with_query(StatementSample::new("sql", "select * from orders", 3 * MS, 2).with_rows(10))
            .with_service_call(StatementSample::new("http", "GET /inventory", MS, 1))
            .with_thread_stats(ThreadStats {
                cpu_nanos: Some(4 * MS),
                ..Default::default()
            })
            .with_profile(profile);

        acc.add(&txn);
        acc.add(&txn);

        let agg = acc.snapshot(60_000).unwrap();
        let http = agg.main_thread_root_timer.find_child("http request").unwrap();
        assert_eq!(http.count, 2);
        assert_eq!(http.find_child("jdbc query").unwrap().count, 4);
        assert_eq!(agg.queries.len(), 1);
        assert_eq!(agg.queries[0].execution_count, 4);
        assert_eq!(agg.queries[0].total_rows, Some(20));
        assert_eq!(agg.service_calls[0].total_duration_nanos, 2 * MS);
        assert_eq!(agg.main_thread_stats.cpu_nanos, Some(8 * MS));
        assert_eq!(agg.main_thread_stats.blocked_nanos, None);
        assert_eq!(agg.aux_thread_stats, ThreadStats::default());
        assert_eq!(agg.main_thread_profile.unwrap().children[0].sample_count, 4);
        assert!(agg.aux_thread_profile.is_none());
    }

    #[test]
    fn test_timer_siblings_match_by_name_only() {
        let mut acc = accumulator();
        acc.merge_timer_tree(&TimerNode::new("a", 1, 1));
        acc.merge_timer_tree(&TimerNode::new("b", 1, 1));
        acc.merge_timer_tree(&TimerNode::new("a", 5, 1));

        let agg = acc.snapshot(0).unwrap();
        assert_eq!(agg.main_thread_root_timer.children.len(), 2);
        assert_eq!(
            agg.main_thread_root_timer.find_child("a").unwrap().total_duration_nanos,
            6
        );
    }

    #[test]
    fn test_async_flag_is_sticky() {
        let mut acc = accumulator();
        let mut txn = CompletedTransaction::new("Web", "/a", MS);
        txn.async_transaction = true;
        acc.add(&txn);
        acc.add(&CompletedTransaction::new("Web", "/a", MS));
        assert!(acc.snapshot(0).unwrap().async_transactions);
    }

    #[test]
    fn test_full_texts_collected_from_long_statements() {
        let mut acc = IntervalAccumulator::new(StatementLimits {
            truncate_chars: 8,
            ..Default::default()
        });
        acc.merge_queries(&[StatementSample::new("sql", "select * from t", 1, 1)]);
        let texts: Vec<_> = acc.full_texts().map(|(_, t)| t.clone()).collect();
        assert_eq!(texts, vec!["select * from t".to_string()]);
    }
}
