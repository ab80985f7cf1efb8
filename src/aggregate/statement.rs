use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::thread_stats::sum_nullable;
use super::LIMIT_EXCEEDED_BUCKET;

/// Aggregated statistics for one statement text within a statement type.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementEntry {
    pub statement_type: String,
    /// Statement text, truncated when longer than the configured limit.
    pub text: String,
    /// SHA-256 hex digest of the full text, present only when truncated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_text_sha256: Option<String>,
    pub total_duration_nanos: i64,
    pub execution_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<i64>,
}

/// One statement as measured by a single transaction, untruncated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StatementSample {
    pub statement_type: String,
    pub text: String,
    pub total_duration_nanos: i64,
    pub execution_count: i64,
    pub total_rows: Option<i64>,
}

impl StatementSample {
    pub fn new(
        statement_type: impl Into<String>,
        text: impl Into<String>,
        total_duration_nanos: i64,
        execution_count: i64,
    ) -> Self {
        Self {
            statement_type: statement_type.into(),
            text: text.into(),
            total_duration_nanos,
            execution_count,
            total_rows: None,
        }
    }

    pub fn with_rows(mut self, rows: i64) -> Self {
        self.total_rows = Some(rows);
        self
    }
}

/// Bounds applied to statement collection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatementLimits {
    /// Entries kept per statement type when a snapshot is taken.
    pub max_per_type: usize,
    /// Distinct entries allowed per type while building, as a multiple of
    /// `max_per_type`.
    pub hard_limit_multiplier: usize,
    /// Texts longer than this many characters are truncated and digested.
    pub truncate_chars: usize,
}

impl StatementLimits {
    fn hard_limit(&self) -> usize {
        self.max_per_type
            .saturating_mul(self.hard_limit_multiplier)
            .max(1)
    }
}

impl Default for StatementLimits {
    fn default() -> Self {
        Self {
            max_per_type: 500,
            hard_limit_multiplier: 2,
            truncate_chars: 120,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct StatementKey {
    text: String,
    digest: Option<String>,
}

#[derive(Clone, Copy, Debug, Default)]
struct StatementTotals {
    duration_nanos: i64,
    count: i64,
    rows: Option<i64>,
}

impl StatementTotals {
    fn add(&mut self, duration_nanos: i64, count: i64, rows: Option<i64>) {
        self.duration_nanos = self.duration_nanos.saturating_add(duration_nanos);
        self.count = self.count.saturating_add(count);
        self.rows = sum_nullable(self.rows, rows);
    }
}

/// Per-type statement statistics with a hard cap on distinct entries.
#[derive(Clone, Debug)]
pub struct StatementCollector {
    limits: StatementLimits,
    by_type: HashMap<String, HashMap<StatementKey, StatementTotals>>,
    full_texts: HashMap<String, String>,
    dropped: u64,
    warned: bool,
}

impl StatementCollector {
    pub fn new(limits: StatementLimits) -> Self {
        Self {
            limits,
            by_type: HashMap::new(),
            full_texts: HashMap::new(),
            dropped: 0,
            warned: false,
        }
    }

    /// Adds an untruncated sample, truncating and digesting long texts.
    pub fn add_sample(&mut self, sample: &StatementSample) {
        let (text, digest) = truncate_text(&sample.text, self.limits.truncate_chars);
        let key = StatementKey {
            text,
            digest: digest.clone(),
        };
        let accepted = self.accumulate(
            &sample.statement_type,
            key,
            sample.total_duration_nanos,
            sample.execution_count,
            sample.total_rows,
        );
        if let (true, Some(digest)) = (accepted, digest) {
            self.full_texts
                .entry(digest)
                .or_insert_with(|| sample.text.clone());
        }
    }

    /// Adds an already-aggregated entry, e.g. one read back for rollup.
    pub fn add_entry(&mut self, entry: &StatementEntry) {
        let key = StatementKey {
            text: entry.text.clone(),
            digest: entry.full_text_sha256.clone(),
        };
        self.accumulate(
            &entry.statement_type,
            key,
            entry.total_duration_nanos,
            entry.execution_count,
            entry.total_rows,
        );
    }

    /// Entries per type, longest total duration first, cut to
    /// `max_per_type` with the remainder folded into one overflow entry.
    pub fn entries(&self) -> Vec<StatementEntry> {
        let sorted_types: BTreeMap<_, _> = self.by_type.iter().collect();
        let mut out = Vec::new();

        for (statement_type, statements) in sorted_types {
            let mut overflow: Option<StatementTotals> = None;
            let mut regular = Vec::with_capacity(statements.len());
            for (key, totals) in statements {
                if key.digest.is_none() && key.text == LIMIT_EXCEEDED_BUCKET {
                    overflow
                        .get_or_insert_with(StatementTotals::default)
                        .add(totals.duration_nanos, totals.count, totals.rows);
                } else {
                    regular.push((key, totals));
                }
            }

            regular.sort_by(|a, b| {
                b.1.duration_nanos
                    .cmp(&a.1.duration_nanos)
                    .then_with(|| a.0.text.cmp(&b.0.text))
                    .then_with(|| a.0.digest.cmp(&b.0.digest))
            });

            for (idx, (key, totals)) in regular.into_iter().enumerate() {
                if idx >= self.limits.max_per_type {
                    overflow
                        .get_or_insert_with(StatementTotals::default)
                        .add(totals.duration_nanos, totals.count, totals.rows);
                    continue;
                }
                out.push(StatementEntry {
                    statement_type: statement_type.clone(),
                    text: key.text.clone(),
                    full_text_sha256: key.digest.clone(),
                    total_duration_nanos: totals.duration_nanos,
                    execution_count: totals.count,
                    total_rows: totals.rows,
                });
            }

            if let Some(totals) = overflow {
                out.push(StatementEntry {
                    statement_type: statement_type.clone(),
                    text: LIMIT_EXCEEDED_BUCKET.to_string(),
                    full_text_sha256: None,
                    total_duration_nanos: totals.duration_nanos,
                    execution_count: totals.count,
                    total_rows: totals.rows,
                });
            }
        }

        out
    }

    /// Full texts of truncated statements, keyed by digest.
    pub fn full_texts(&self) -> &HashMap<String, String> {
        &self.full_texts
    }

    /// Number of distinct-statement samples dropped at the hard cap.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }

    fn accumulate(
        &mut self,
        statement_type: &str,
        key: StatementKey,
        duration_nanos: i64,
        count: i64,
        rows: Option<i64>,
    ) -> bool {
        let hard_limit = self.limits.hard_limit();
        let statements = self.by_type.entry(statement_type.to_string()).or_default();

        if let Some(totals) = statements.get_mut(&key) {
            totals.add(duration_nanos, count, rows);
            return true;
        }

        if statements.len() >= hard_limit {
            self.dropped += 1;
            if !self.warned {
                self.warned = true;
                tracing::warn!(
                    statement_type,
                    hard_limit,
                    "distinct statement cap reached, dropping further statements",
                );
            }
            return false;
        }

        let mut totals = StatementTotals::default();
        totals.add(duration_nanos, count, rows);
        statements.insert(key, totals);
        true
    }
}

/// Truncates `text` to `max_chars` characters. Returns the SHA-256 hex
/// digest of the full text when truncation happened.
pub fn truncate_text(text: &str, max_chars: usize) -> (String, Option<String>) {
    match text.char_indices().nth(max_chars) {
        None => (text.to_string(), None),
        Some((cut, _)) => (text[..cut].to_string(), Some(sha256_hex(text))),
    }
}

fn sha256_hex(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest.iter() {
        let _ = write!(out, "{byte:02x}");
    }
    out
}
