use crate::aggregate::{ProfileNode, StatementSample, ThreadStats, TimerNode};

/// Measurements of one completed transaction, as handed over by a producer.
#[derive(Clone, Debug, Default)]
pub struct CompletedTransaction {
    pub transaction_type: String,
    pub transaction_name: String,
    pub duration_nanos: i64,
    pub error: bool,
    pub async_transaction: bool,
    /// Real root timer of the main thread (not a synthetic root).
    pub main_thread_root_timer: Option<TimerNode>,
    pub aux_thread_root_timers: Vec<TimerNode>,
    pub async_timers: Vec<TimerNode>,
    pub main_thread_stats: ThreadStats,
    pub aux_thread_stats: ThreadStats,
    pub queries: Vec<StatementSample>,
    pub service_calls: Vec<StatementSample>,
    /// Sampled main-thread stacks under a synthetic root.
    pub main_thread_profile: Option<ProfileNode>,
    pub aux_thread_profile: Option<ProfileNode>,
}

impl CompletedTransaction {
    pub fn new(
        transaction_type: impl Into<String>,
        transaction_name: impl Into<String>,
        duration_nanos: i64,
    ) -> Self {
        Self {
            transaction_type: transaction_type.into(),
            transaction_name: transaction_name.into(),
            duration_nanos,
            ..Default::default()
        }
    }

    pub fn with_error(mut self) -> Self {
        self.error = true;
        self
    }

    pub fn with_root_timer(mut self, timer: TimerNode) -> Self {
        self.main_thread_root_timer = Some(timer);
        self
    }

    pub fn with_query(mut self, query: StatementSample) -> Self {
        self.queries.push(query);
        self
    }

    pub fn with_service_call(mut self, call: StatementSample) -> Self {
        self.service_calls.push(call);
        self
    }

    pub fn with_thread_stats(mut self, stats: ThreadStats) -> Self {
        self.main_thread_stats = stats;
        self
    }

    pub fn with_profile(mut self, profile: ProfileNode) -> Self {
        self.main_thread_profile = Some(profile);
        self
    }
}

/// A transaction waiting in a scope's producer queue.
#[derive(Debug)]
pub(crate) struct PendingTransaction {
    pub capture_time: i64,
    pub transaction: CompletedTransaction,
}
