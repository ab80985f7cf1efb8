use tracing::warn;

use crate::aggregate::{
    AdaptiveHistogram, ErrorSummaryRow, HistogramError, HistogramRow, OverviewRow, ProfileNode,
    StatementCollector, StatementEntry, StatementLimits, Subtable, SubtableRow, SummaryRow,
    ThroughputRow, TimerNode,
};

/// Result of merging the source rows of one sub-table.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct MergedSubtable {
    /// `None` when nothing worth writing remains, e.g. an error summary
    /// with zero errors.
    pub row: Option<SubtableRow>,
    /// Histogram rows skipped because they could not be decoded.
    pub decode_errors: usize,
}

impl MergedSubtable {
    fn of(row: SubtableRow) -> Self {
        Self {
            row: Some(row),
            decode_errors: 0,
        }
    }
}

/// Merges same-sub-table rows of finer buckets into one coarser row.
#[derive(Clone, Copy, Debug)]
pub struct RollupMerger {
    limits: StatementLimits,
}

impl RollupMerger {
    pub fn new(limits: StatementLimits) -> Self {
        Self { limits }
    }

    /// Merges `rows` of `subtable`. Rows belonging to another sub-table are
    /// ignored.
    ///
    /// Fails only if the merged histogram cannot be re-encoded.
    pub fn merge(
        &self,
        subtable: Subtable,
        rows: &[SubtableRow],
    ) -> Result<MergedSubtable, HistogramError> {
        if rows.is_empty() {
            return Ok(MergedSubtable::default());
        }

        let merged = match subtable {
            Subtable::Summary => MergedSubtable::of(SubtableRow::Summary(merge_summary(rows))),
            Subtable::ErrorSummary => {
                let merged = merge_error_summary(rows);
                MergedSubtable {
                    row: (merged.error_count > 0).then_some(SubtableRow::ErrorSummary(merged)),
                    decode_errors: 0,
                }
            }
            Subtable::Throughput => {
                MergedSubtable::of(SubtableRow::Throughput(merge_throughput(rows)))
            }
            Subtable::Overview => MergedSubtable::of(SubtableRow::Overview(merge_overview(rows))),
            Subtable::Histogram => return merge_histograms(rows),
            Subtable::Queries => {
                let entries = self.merge_statements(rows.iter().filter_map(|r| match r {
                    SubtableRow::Queries(entries) => Some(entries),
                    _ => None,
                }));
                MergedSubtable {
                    row: (!entries.is_empty()).then_some(SubtableRow::Queries(entries)),
                    decode_errors: 0,
                }
            }
            Subtable::ServiceCalls => {
                let entries = self.merge_statements(rows.iter().filter_map(|r| match r {
                    SubtableRow::ServiceCalls(entries) => Some(entries),
                    _ => None,
                }));
                MergedSubtable {
                    row: (!entries.is_empty()).then_some(SubtableRow::ServiceCalls(entries)),
                    decode_errors: 0,
                }
            }
            Subtable::MainThreadProfile => MergedSubtable {
                row: merge_profiles(rows.iter().filter_map(|r| match r {
                    SubtableRow::MainThreadProfile(p) => Some(p),
                    _ => None,
                }))
                .map(SubtableRow::MainThreadProfile),
                decode_errors: 0,
            },
            Subtable::AuxThreadProfile => MergedSubtable {
                row: merge_profiles(rows.iter().filter_map(|r| match r {
                    SubtableRow::AuxThreadProfile(p) => Some(p),
                    _ => None,
                }))
                .map(SubtableRow::AuxThreadProfile),
                decode_errors: 0,
            },
        };
        Ok(merged)
    }

    fn merge_statements<'a>(
        &self,
        lists: impl Iterator<Item = &'a Vec<StatementEntry>>,
    ) -> Vec<StatementEntry> {
        let mut collector = StatementCollector::new(self.limits);
        for entries in lists {
            for entry in entries {
                collector.add_entry(entry);
            }
        }
        collector.entries()
    }
}

fn merge_summary(rows: &[SubtableRow]) -> SummaryRow {
    let mut out = SummaryRow::default();
    for row in rows {
        if let SubtableRow::Summary(r) = row {
            out.total_duration_nanos = out
                .total_duration_nanos
                .saturating_add(r.total_duration_nanos);
            out.transaction_count += r.transaction_count;
        }
    }
    out
}

fn merge_error_summary(rows: &[SubtableRow]) -> ErrorSummaryRow {
    let mut out = ErrorSummaryRow::default();
    for row in rows {
        if let SubtableRow::ErrorSummary(r) = row {
            out.error_count += r.error_count;
            out.transaction_count += r.transaction_count;
        }
    }
    out
}

fn merge_throughput(rows: &[SubtableRow]) -> ThroughputRow {
    let mut out = ThroughputRow::default();
    for row in rows {
        if let SubtableRow::Throughput(r) = row {
            out.transaction_count += r.transaction_count;
            out.error_count += r.error_count;
        }
    }
    out
}

fn merge_overview(rows: &[SubtableRow]) -> OverviewRow {
    let mut out = OverviewRow {
        main_thread_root_timer: TimerNode::synthetic_root(),
        aux_thread_root_timer: TimerNode::synthetic_root(),
        async_timers: TimerNode::synthetic_root(),
        ..Default::default()
    };
    for row in rows {
        let SubtableRow::Overview(r) = row else {
            continue;
        };
        out.total_duration_nanos = out
            .total_duration_nanos
            .saturating_add(r.total_duration_nanos);
        out.transaction_count += r.transaction_count;
        out.async_transactions |= r.async_transactions;
        out.main_thread_root_timer.merge(&r.main_thread_root_timer);
        out.aux_thread_root_timer.merge(&r.aux_thread_root_timer);
        out.async_timers.merge(&r.async_timers);
        out.main_thread_stats.merge(&r.main_thread_stats);
        out.aux_thread_stats.merge(&r.aux_thread_stats);
    }
    out
}

fn merge_histograms(rows: &[SubtableRow]) -> Result<MergedSubtable, HistogramError> {
    let mut histogram = AdaptiveHistogram::new();
    let mut transaction_count = 0;
    let mut merged_rows = 0;
    let mut decode_errors = 0;

    for row in rows {
        let SubtableRow::Histogram(r) = row else {
            continue;
        };
        // Decode separately so a corrupt row cannot leave partial values behind.
        match AdaptiveHistogram::decode(&r.encoded) {
            Ok(source) => {
                histogram.merge(&source)?;
                transaction_count += r.transaction_count;
                merged_rows += 1;
            }
            Err(e) => {
                warn!(error = %e, "skipping histogram row that failed to decode");
                decode_errors += 1;
            }
        }
    }

    if merged_rows == 0 {
        return Ok(MergedSubtable {
            row: None,
            decode_errors,
        });
    }

    Ok(MergedSubtable {
        row: Some(SubtableRow::Histogram(HistogramRow {
            transaction_count,
            encoded: histogram.encode()?,
        })),
        decode_errors,
    })
}

fn merge_profiles<'a>(profiles: impl Iterator<Item = &'a ProfileNode>) -> Option<ProfileNode> {
    let mut merged: Option<ProfileNode> = None;
    for profile in profiles {
        merged
            .get_or_insert_with(ProfileNode::synthetic_root)
            .merge(profile);
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{StackFrame, ThreadStats, LIMIT_EXCEEDED_BUCKET};

    fn merger() -> RollupMerger {
        RollupMerger::new(StatementLimits::default())
    }

    fn histogram_row(values: &[i64]) -> SubtableRow {
        let mut h = AdaptiveHistogram::new();
        for v in values {
            h.add(*v);
        }
        SubtableRow::Histogram(HistogramRow {
            transaction_count: values.len() as i64,
            encoded: h.encode().unwrap(),
        })
    }

    fn entry(text: &str, duration: i64) -> StatementEntry {
        StatementEntry {
            statement_type: "sql".to_string(),
            text: text.to_string(),
            full_text_sha256: None,
            total_duration_nanos: duration,
            execution_count: 1,
            total_rows: None,
        }
    }

    #[test]
    fn test_summary_and_throughput_sum() {
        let rows = vec![
            SubtableRow::Summary(SummaryRow {
                total_duration_nanos: 10,
                transaction_count: 1,
            }),
            SubtableRow::Summary(SummaryRow {
                total_duration_nanos: 30,
                transaction_count: 2,
            }),
        ];
        let merged = merger().merge(Subtable::Summary, &rows).unwrap();
        assert_eq!(
            merged.row,
            Some(SubtableRow::Summary(SummaryRow {
                total_duration_nanos: 40,
                transaction_count: 3,
            }))
        );

        let rows = vec![
            SubtableRow::Throughput(ThroughputRow {
                transaction_count: 4,
                error_count: 1,
            }),
            SubtableRow::Throughput(ThroughputRow {
                transaction_count: 6,
                error_count: 0,
            }),
        ];
        let merged = merger().merge(Subtable::Throughput, &rows).unwrap();
        assert_eq!(
            merged.row,
            Some(SubtableRow::Throughput(ThroughputRow {
                transaction_count: 10,
                error_count: 1,
            }))
        );
    }

    #[test]
    fn test_empty_input_produces_nothing() {
        for subtable in Subtable::ALL {
            assert_eq!(merger().merge(subtable, &[]).unwrap(), MergedSubtable::default());
        }
    }

    #[test]
    fn test_overview_merges_trees_and_stats() {
        let a = OverviewRow {
            total_duration_nanos: 10,
            transaction_count: 1,
            async_transactions: false,
            main_thread_root_timer: TimerNode::synthetic_root()
                .with_child(TimerNode::new("http", 10, 1)),
            main_thread_stats: ThreadStats {
                cpu_nanos: Some(5),
                ..Default::default()
            },
            ..Default::default()
        };
        let b = OverviewRow {
            total_duration_nanos: 20,
            transaction_count: 1,
            async_transactions: true,
            main_thread_root_timer: TimerNode::synthetic_root()
                .with_child(TimerNode::new("http", 20, 1))
                .with_child(TimerNode::new("jdbc", 4, 2)),
            ..Default::default()
        };

        let merged = merger()
            .merge(
                Subtable::Overview,
                &[SubtableRow::Overview(a), SubtableRow::Overview(b)],
            )
            .unwrap();
        let Some(SubtableRow::Overview(row)) = merged.row else {
            panic!("expected overview row");
        };
        assert_eq!(row.total_duration_nanos, 30);
        assert!(row.async_transactions);
        assert_eq!(row.main_thread_root_timer.children.len(), 2);
        assert_eq!(row.main_thread_root_timer.find_child("http").unwrap().count, 2);
        assert_eq!(row.main_thread_stats.cpu_nanos, Some(5));
        assert_eq!(row.main_thread_stats.blocked_nanos, None);
    }

    #[test]
    fn test_error_summary_dropped_when_zero() {
        let rows = vec![SubtableRow::ErrorSummary(ErrorSummaryRow {
            error_count: 0,
            transaction_count: 3,
        })];
        assert!(merger()
            .merge(Subtable::ErrorSummary, &rows)
            .unwrap()
            .row
            .is_none());
    }

    #[test]
    fn test_histograms_merge_and_skip_corrupt_rows() {
        let rows = vec![
            histogram_row(&[10, 20]),
            SubtableRow::Histogram(HistogramRow {
                transaction_count: 5,
                encoded: vec![0, 0, 0, 9],
            }),
            histogram_row(&[30]),
        ];
        let merged = merger().merge(Subtable::Histogram, &rows).unwrap();
        assert_eq!(merged.decode_errors, 1);

        let Some(SubtableRow::Histogram(row)) = merged.row else {
            panic!("expected histogram row");
        };
        assert_eq!(row.transaction_count, 3);
        let mut h = AdaptiveHistogram::decode(&row.encoded).unwrap();
        assert_eq!(h.count(), 3);
        assert_eq!(h.percentile(50.0), 20);
    }

    #[test]
    fn test_all_corrupt_histograms_yield_no_row() {
        let rows = vec![SubtableRow::Histogram(HistogramRow {
            transaction_count: 1,
            encoded: vec![1, 2],
        })];
        let merged = merger().merge(Subtable::Histogram, &rows).unwrap();
        assert!(merged.row.is_none());
        assert_eq!(merged.decode_errors, 1);
    }

    #[test]
    fn test_statements_merge_and_cap() {
        let limited = RollupMerger::new(StatementLimits {
            max_per_type: 1,
            hard_limit_multiplier: 4,
            ..Default::default()
        });
        let rows = vec![
            SubtableRow::Queries(vec![entry("a", 10), entry("b", 3)]),
            SubtableRow::Queries(vec![entry("a", 5), entry("c", 1)]),
        ];
        let Some(SubtableRow::Queries(entries)) =
            limited.merge(Subtable::Queries, &rows).unwrap().row
        else {
            panic!("expected queries row");
        };
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].text, "a");
        assert_eq!(entries[0].total_duration_nanos, 15);
        assert_eq!(entries[0].execution_count, 2);
        assert_eq!(entries[1].text, LIMIT_EXCEEDED_BUCKET);
        assert_eq!(entries[1].total_duration_nanos, 4);
    }

    #[test]
    fn test_profiles_tree_merge() {
        let frame = StackFrame::new("Worker", "run");
        let tree = |n| ProfileNode::synthetic_root().with_child(ProfileNode::new(frame.clone(), n));
        let rows = vec![
            SubtableRow::AuxThreadProfile(tree(2)),
            SubtableRow::AuxThreadProfile(tree(3)),
        ];
        let Some(SubtableRow::AuxThreadProfile(merged)) =
            merger().merge(Subtable::AuxThreadProfile, &rows).unwrap().row
        else {
            panic!("expected profile row");
        };
        assert_eq!(merged.find_child(&frame, None).unwrap().sample_count, 5);
    }
}
