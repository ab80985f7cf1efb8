use std::collections::BTreeMap;

use tracing::warn;

use crate::aggregate::{AggregateBatch, AggregateRecord};

use super::accumulator::IntervalAccumulator;
use super::buffer::IntervalBuffer;

/// Result of snapshotting a closed interval.
#[derive(Debug, Default)]
pub struct CollectedInterval {
    pub batch: AggregateBatch,
    /// Records that failed to snapshot and were left out.
    pub skipped: usize,
}

/// Snapshots every accumulator of `buffer` into a storable batch.
///
/// Each accumulator is locked only while its own snapshot is taken. A record
/// whose histogram cannot be encoded is logged and skipped; the rest of the
/// batch is kept. Full statement texts are gathered from the overall and the
/// per-name accumulators, whose statement caps fill independently.
pub fn collect(buffer: &IntervalBuffer) -> CollectedInterval {
    let capture_time = buffer.bucket_end();
    let mut out = CollectedInterval::default();
    let mut full_texts = BTreeMap::new();

    for (transaction_type, acc) in buffer.overall_entries() {
        let acc = acc.lock();
        match acc.snapshot(capture_time) {
            Ok(aggregate) => {
                out.batch
                    .overall
                    .push(AggregateRecord::new(&transaction_type, None, &aggregate));
                gather_full_texts(&mut full_texts, &acc);
            }
            Err(e) => {
                warn!(
                    transaction_type = %transaction_type,
                    error = %e,
                    "skipping overall aggregate that failed to snapshot",
                );
                out.skipped += 1;
            }
        }
    }

    for ((transaction_type, transaction_name), acc) in buffer.transaction_entries() {
        let acc = acc.lock();
        match acc.snapshot(capture_time) {
            Ok(aggregate) => {
                out.batch.transactions.push(AggregateRecord::new(
                    &transaction_type,
                    Some(&transaction_name),
                    &aggregate,
                ));
                gather_full_texts(&mut full_texts, &acc);
            }
            Err(e) => {
                warn!(
                    transaction_type = %transaction_type,
                    transaction_name = %transaction_name,
                    error = %e,
                    "skipping transaction aggregate that failed to snapshot",
                );
                out.skipped += 1;
            }
        }
    }

    out.batch.full_texts = full_texts;
    out
}

fn gather_full_texts(full_texts: &mut BTreeMap<String, String>, acc: &IntervalAccumulator) {
    for (digest, text) in acc.full_texts() {
        full_texts
            .entry(digest.clone())
            .or_insert_with(|| text.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{StatementLimits, StatementSample, Subtable, SubtableRow};
    use crate::interval::buffer::BufferLimits;
    use crate::interval::event::CompletedTransaction;

    #[test]
    fn test_collect_builds_overall_and_named_records() {
        let buffer = IntervalBuffer::new(
            120_000,
            BufferLimits {
                statements: StatementLimits {
                    truncate_chars: 10,
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        buffer.add(
            &CompletedTransaction::new("Web", "/orders", 100)
                .with_query(StatementSample::new("sql", "select * from orders", 40, 1)),
        );
        buffer.add(&CompletedTransaction::new("Web", "/users", 50).with_error());
        buffer.add(&CompletedTransaction::new("Background", "reindex", 500));

        let collected = collect(&buffer);
        assert_eq!(collected.skipped, 0);

        let batch = collected.batch;
        assert_eq!(batch.overall.len(), 2);
        assert_eq!(batch.transactions.len(), 3);
        assert_eq!(batch.overall[0].transaction_type, "Background");
        assert!(batch.overall.iter().all(|r| r.transaction_name.is_none()));

        let web = &batch.overall[1];
        let subtables: Vec<_> = web.rows.iter().map(|r| r.subtable()).collect();
        assert!(subtables.contains(&Subtable::ErrorSummary));
        assert!(subtables.contains(&Subtable::Queries));

        assert_eq!(batch.full_texts.len(), 1);
        assert_eq!(
            batch.full_texts.values().next().map(String::as_str),
            Some("select * from orders")
        );
    }

    #[test]
    fn test_collect_keeps_full_texts_of_named_records() {
        let buffer = IntervalBuffer::new(
            60_000,
            BufferLimits {
                statements: StatementLimits {
                    max_per_type: 1,
                    hard_limit_multiplier: 1,
                    truncate_chars: 8,
                },
                ..Default::default()
            },
        );
        buffer.add(
            &CompletedTransaction::new("Web", "/a", 100)
                .with_query(StatementSample::new("sql", "select * from aaa", 40, 1)),
        );
        buffer.add(
            &CompletedTransaction::new("Web", "/b", 100)
                .with_query(StatementSample::new("sql", "select * from bbb", 40, 1)),
        );

        let batch = collect(&buffer).batch;
        let digests: Vec<String> = batch
            .records()
            .flat_map(|record| record.rows.iter())
            .filter_map(|row| match row {
                SubtableRow::Queries(entries) => Some(entries),
                _ => None,
            })
            .flatten()
            .filter_map(|entry| entry.full_text_sha256.clone())
            .collect();

        assert!(digests.len() >= 2);
        for digest in &digests {
            assert!(batch.full_texts.contains_key(digest), "missing text for {digest}");
        }
        let texts: Vec<&str> = batch.full_texts.values().map(String::as_str).collect();
        assert!(texts.contains(&"select * from bbb"));
    }

    #[test]
    fn test_collect_empty_buffer() {
        let buffer = IntervalBuffer::new(60_000, BufferLimits::default());
        let collected = collect(&buffer);
        assert!(collected.batch.is_empty());
        assert_eq!(collected.skipped, 0);
    }
}
