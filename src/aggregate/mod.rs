//! Aggregate records and the building blocks they are made of.
//!
//! An [`Aggregate`] summarizes every transaction of one type (and optionally
//! one name) inside one bucket. Storage splits it into independent
//! [`SubtableRow`]s so that each sub-table can be rolled up on its own.

pub mod histogram;
pub mod profile;
pub mod statement;
pub mod thread_stats;
pub mod timer;

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub use histogram::{AdaptiveHistogram, HistogramError};
pub use profile::{ProfileNode, StackFrame, ThreadState};
pub use statement::{StatementCollector, StatementEntry, StatementLimits, StatementSample};
pub use thread_stats::ThreadStats;
pub use timer::TimerNode;

/// Name used for the catch-all entry once a distinct-name cap is reached.
pub const LIMIT_EXCEEDED_BUCKET: &str = "LIMIT EXCEEDED BUCKET";

/// Storage sub-tables an aggregate is decomposed into.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Subtable {
    Summary,
    ErrorSummary,
    Overview,
    Histogram,
    Throughput,
    Queries,
    ServiceCalls,
    MainThreadProfile,
    AuxThreadProfile,
}

impl Subtable {
    pub const ALL: [Subtable; 9] = [
        Subtable::Summary,
        Subtable::ErrorSummary,
        Subtable::Overview,
        Subtable::Histogram,
        Subtable::Throughput,
        Subtable::Queries,
        Subtable::ServiceCalls,
        Subtable::MainThreadProfile,
        Subtable::AuxThreadProfile,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Summary => "summary",
            Self::ErrorSummary => "error_summary",
            Self::Overview => "overview",
            Self::Histogram => "histogram",
            Self::Throughput => "throughput",
            Self::Queries => "queries",
            Self::ServiceCalls => "service_calls",
            Self::MainThreadProfile => "main_thread_profile",
            Self::AuxThreadProfile => "aux_thread_profile",
        }
    }
}

impl std::fmt::Display for Subtable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryRow {
    pub total_duration_nanos: i64,
    pub transaction_count: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorSummaryRow {
    pub error_count: i64,
    pub transaction_count: i64,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThroughputRow {
    pub transaction_count: i64,
    pub error_count: i64,
}

/// Totals, timer trees and thread statistics.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverviewRow {
    pub total_duration_nanos: i64,
    pub transaction_count: i64,
    pub async_transactions: bool,
    pub main_thread_root_timer: TimerNode,
    pub aux_thread_root_timer: TimerNode,
    pub async_timers: TimerNode,
    pub main_thread_stats: ThreadStats,
    pub aux_thread_stats: ThreadStats,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistogramRow {
    pub transaction_count: i64,
    pub encoded: Vec<u8>,
}

/// One stored sub-table row of an aggregate.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "subtable", content = "row", rename_all = "snake_case")]
pub enum SubtableRow {
    Summary(SummaryRow),
    ErrorSummary(ErrorSummaryRow),
    Overview(OverviewRow),
    Histogram(HistogramRow),
    Throughput(ThroughputRow),
    Queries(Vec<StatementEntry>),
    ServiceCalls(Vec<StatementEntry>),
    MainThreadProfile(ProfileNode),
    AuxThreadProfile(ProfileNode),
}

impl SubtableRow {
    pub fn subtable(&self) -> Subtable {
        match self {
            Self::Summary(_) => Subtable::Summary,
            Self::ErrorSummary(_) => Subtable::ErrorSummary,
            Self::Overview(_) => Subtable::Overview,
            Self::Histogram(_) => Subtable::Histogram,
            Self::Throughput(_) => Subtable::Throughput,
            Self::Queries(_) => Subtable::Queries,
            Self::ServiceCalls(_) => Subtable::ServiceCalls,
            Self::MainThreadProfile(_) => Subtable::MainThreadProfile,
            Self::AuxThreadProfile(_) => Subtable::AuxThreadProfile,
        }
    }
}

/// Immutable summary of one (type, name?) pair over one bucket.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Aggregate {
    /// Bucket end, epoch milliseconds. Inclusive.
    pub capture_time: i64,
    pub total_duration_nanos: i64,
    pub transaction_count: i64,
    pub error_count: i64,
    pub async_transactions: bool,
    pub main_thread_root_timer: TimerNode,
    pub aux_thread_root_timer: TimerNode,
    pub async_timers: TimerNode,
    pub main_thread_stats: ThreadStats,
    pub aux_thread_stats: ThreadStats,
    /// Encoded [`AdaptiveHistogram`] of transaction durations.
    pub duration_histogram: Vec<u8>,
    pub queries: Vec<StatementEntry>,
    pub service_calls: Vec<StatementEntry>,
    pub main_thread_profile: Option<ProfileNode>,
    pub aux_thread_profile: Option<ProfileNode>,
}

impl Aggregate {
    /// Decodes the duration histogram.
    pub fn histogram(&self) -> Result<AdaptiveHistogram, HistogramError> {
        AdaptiveHistogram::decode(&self.duration_histogram)
    }

    /// Splits the aggregate into the rows written per sub-table. The error
    /// summary and the optional sections are only emitted when non-empty.
    pub fn to_rows(&self) -> Vec<SubtableRow> {
        let mut rows = Vec::with_capacity(Subtable::ALL.len());
        rows.push(SubtableRow::Summary(SummaryRow {
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
        }));
        if self.error_count > 0 {
            rows.push(SubtableRow::ErrorSummary(ErrorSummaryRow {
                error_count: self.error_count,
                transaction_count: self.transaction_count,
            }));
        }
        rows.push(SubtableRow::Overview(OverviewRow {
            total_duration_nanos: self.total_duration_nanos,
            transaction_count: self.transaction_count,
            async_transactions: self.async_transactions,
            main_thread_root_timer: self.main_thread_root_timer.clone(),
            aux_thread_root_timer: self.aux_thread_root_timer.clone(),
            async_timers: self.async_timers.clone(),
            main_thread_stats: self.main_thread_stats,
            aux_thread_stats: self.aux_thread_stats,
        }));
        rows.push(SubtableRow::Histogram(HistogramRow {
            transaction_count: self.transaction_count,
            encoded: self.duration_histogram.clone(),
        }));
        rows.push(SubtableRow::Throughput(ThroughputRow {
            transaction_count: self.transaction_count,
            error_count: self.error_count,
        }));
        if !self.queries.is_empty() {
            rows.push(SubtableRow::Queries(self.queries.clone()));
        }
        if !self.service_calls.is_empty() {
            rows.push(SubtableRow::ServiceCalls(self.service_calls.clone()));
        }
        if let Some(profile) = &self.main_thread_profile {
            rows.push(SubtableRow::MainThreadProfile(profile.clone()));
        }
        if let Some(profile) = &self.aux_thread_profile {
            rows.push(SubtableRow::AuxThreadProfile(profile.clone()));
        }
        rows
    }

    /// Reassembles an aggregate from the rows stored for one bucket.
    pub fn from_rows(capture_time: i64, rows: impl IntoIterator<Item = SubtableRow>) -> Self {
        let mut agg = Aggregate {
            capture_time,
            main_thread_root_timer: TimerNode::synthetic_root(),
            aux_thread_root_timer: TimerNode::synthetic_root(),
            async_timers: TimerNode::synthetic_root(),
            ..Default::default()
        };
        for row in rows {
            match row {
                SubtableRow::Summary(r) => {
                    agg.total_duration_nanos = r.total_duration_nanos;
                    agg.transaction_count = r.transaction_count;
                }
                SubtableRow::ErrorSummary(r) => agg.error_count = r.error_count,
                SubtableRow::Overview(r) => {
                    agg.async_transactions = r.async_transactions;
                    agg.main_thread_root_timer = r.main_thread_root_timer;
                    agg.aux_thread_root_timer = r.aux_thread_root_timer;
                    agg.async_timers = r.async_timers;
                    agg.main_thread_stats = r.main_thread_stats;
                    agg.aux_thread_stats = r.aux_thread_stats;
                }
                SubtableRow::Histogram(r) => agg.duration_histogram = r.encoded,
                SubtableRow::Throughput(_) => {}
                SubtableRow::Queries(entries) => agg.queries = entries,
                SubtableRow::ServiceCalls(entries) => agg.service_calls = entries,
                SubtableRow::MainThreadProfile(p) => agg.main_thread_profile = Some(p),
                SubtableRow::AuxThreadProfile(p) => agg.aux_thread_profile = Some(p),
            }
        }
        agg
    }
}

/// Rows for one (type, name?) key.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AggregateRecord {
    pub transaction_type: String,
    /// `None` for the overall record of the type.
    pub transaction_name: Option<String>,
    pub rows: Vec<SubtableRow>,
}

impl AggregateRecord {
    pub fn new(transaction_type: &str, transaction_name: Option<&str>, aggregate: &Aggregate) -> Self {
        Self {
            transaction_type: transaction_type.to_string(),
            transaction_name: transaction_name.map(str::to_string),
            rows: aggregate.to_rows(),
        }
    }
}

/// Everything written for one bucket of one scope at one level.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct AggregateBatch {
    pub overall: Vec<AggregateRecord>,
    pub transactions: Vec<AggregateRecord>,
    /// Full texts of truncated statements, keyed by SHA-256 hex digest.
    pub full_texts: BTreeMap<String, String>,
}

impl AggregateBatch {
    pub fn is_empty(&self) -> bool {
        self.overall.is_empty() && self.transactions.is_empty()
    }

    pub fn records(&self) -> impl Iterator<Item = &AggregateRecord> {
        self.overall.iter().chain(self.transactions.iter())
    }

    /// Distinct transaction types present in the batch.
    pub fn transaction_types(&self) -> BTreeSet<String> {
        self.records()
            .map(|r| r.transaction_type.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_aggregate() -> Aggregate {
        let mut histogram = AdaptiveHistogram::new();
        histogram.add(10);
        histogram.add(20);
        Aggregate {
            capture_time: 60_000,
            total_duration_nanos: 30,
            transaction_count: 2,
            error_count: 1,
            main_thread_root_timer: TimerNode::synthetic_root()
                .with_child(TimerNode::new("http request", 30, 2)),
            aux_thread_root_timer: TimerNode::synthetic_root(),
            async_timers: TimerNode::synthetic_root(),
            duration_histogram: histogram.encode().unwrap(),
            queries: vec![StatementEntry {
                statement_type: "sql".to_string(),
                text: "select 1".to_string(),
                full_text_sha256: None,
                total_duration_nanos: 5,
                execution_count: 1,
                total_rows: Some(1),
            }],
            ..Default::default()
        }
    }

    #[test]
    fn test_to_rows_skips_empty_sections() {
        let mut agg = sample_aggregate();
        agg.error_count = 0;
        agg.queries.clear();

        let subtables: Vec<_> = agg.to_rows().iter().map(SubtableRow::subtable).collect();
        assert_eq!(
            subtables,
            vec![
                Subtable::Summary,
                Subtable::Overview,
                Subtable::Histogram,
                Subtable::Throughput,
            ]
        );
    }

    #[test]
    fn test_rows_reassemble_into_aggregate() {
        let agg = sample_aggregate();
        let rebuilt = Aggregate::from_rows(agg.capture_time, agg.to_rows());
        assert_eq!(rebuilt, agg);
    }

    #[test]
    fn test_row_json_is_tagged_by_subtable() {
        let row = SubtableRow::Throughput(ThroughputRow {
            transaction_count: 3,
            error_count: 1,
        });
        let json = serde_json::to_string(&row).unwrap();
        assert!(json.contains("\"subtable\":\"throughput\""));
        let back: SubtableRow = serde_json::from_str(&json).unwrap();
        assert_eq!(back, row);
    }

    #[test]
    fn test_batch_transaction_types() {
        let agg = sample_aggregate();
        let batch = AggregateBatch {
            overall: vec![
                AggregateRecord::new("Web", None, &agg),
                AggregateRecord::new("Background", None, &agg),
            ],
            transactions: vec![AggregateRecord::new("Web", Some("/home"), &agg)],
            full_texts: BTreeMap::new(),
        };
        let types: Vec<_> = batch.transaction_types().into_iter().collect();
        assert_eq!(types, vec!["Background".to_string(), "Web".to_string()]);
        assert_eq!(batch.records().count(), 3);
    }
}
