use hdrhistogram::serialization::{Deserializer, Serializer, V2DeflateSerializer};
use hdrhistogram::Histogram;
use thiserror::Error;

/// Maximum number of raw samples held before upgrading to the compressed form.
pub const RAW_VALUES_LIMIT: usize = 1024;

/// Precision of the compressed form, in significant decimal digits.
pub const SIGNIFICANT_DIGITS: u8 = 2;

const MODE_RAW: i32 = 0;
const MODE_COMPRESSED: i32 = 1;

/// Errors produced while decoding or combining encoded histograms.
#[derive(Debug, Error)]
pub enum HistogramError {
    #[error("histogram payload truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("negative raw value count {count}")]
    NegativeCount { count: i32 },

    #[error("{extra} trailing bytes after histogram payload")]
    TrailingBytes { extra: usize },

    #[error("unknown histogram encoding mode {mode}")]
    UnknownMode { mode: i32 },

    #[error("decoding compressed histogram: {detail}")]
    Deserialize { detail: String },

    #[error("encoding compressed histogram: {detail}")]
    Serialize { detail: String },

    #[error("merging compressed histograms: {detail}")]
    Merge { detail: String },
}

/// Latency distribution that starts as raw samples and upgrades to a
/// bucketed HDR histogram once the raw cap would be exceeded.
///
/// The upgrade is one-way. Percentiles in raw mode are exact; in compressed
/// mode they carry the 2-significant-digit error bound of the HDR buckets.
#[derive(Clone, Debug)]
pub struct AdaptiveHistogram {
    repr: Repr,
}

#[derive(Clone, Debug)]
enum Repr {
    Raw { values: Vec<i64>, sorted: bool },
    Compressed(Box<Histogram<u64>>),
}

impl AdaptiveHistogram {
    pub fn new() -> Self {
        Self {
            repr: Repr::Raw {
                values: Vec::new(),
                sorted: true,
            },
        }
    }

    /// Records one value.
    pub fn add(&mut self, value: i64) {
        match &mut self.repr {
            Repr::Raw { values, sorted } => {
                if values.len() < RAW_VALUES_LIMIT {
                    values.push(value);
                    *sorted = false;
                    return;
                }
            }
            Repr::Compressed(h) => {
                h.saturating_record(clamp_value(value));
                return;
            }
        }

        self.upgrade().saturating_record(clamp_value(value));
    }

    /// Merges `other` into `self`. The result is compressed if either side is.
    pub fn merge(&mut self, other: &AdaptiveHistogram) -> Result<(), HistogramError> {
        match &other.repr {
            Repr::Raw { values, .. } => {
                for &value in values {
                    self.add(value);
                }
                Ok(())
            }
            Repr::Compressed(theirs) => self.merge_compressed(theirs),
        }
    }

    /// Decodes `bytes` straight into whichever representation is live.
    pub fn merge_encoded(&mut self, bytes: &[u8]) -> Result<(), HistogramError> {
        let mode = read_i32(bytes, 0)?;
        match mode {
            MODE_RAW => {
                let count = read_i32(bytes, 4)?;
                if count < 0 {
                    return Err(HistogramError::NegativeCount { count });
                }
                let count = count as usize;
                let needed = 8 + count * 8;
                if bytes.len() < needed {
                    return Err(HistogramError::Truncated {
                        needed,
                        available: bytes.len(),
                    });
                }
                if bytes.len() > needed {
                    return Err(HistogramError::TrailingBytes {
                        extra: bytes.len() - needed,
                    });
                }
                for chunk in bytes[8..needed].chunks_exact(8) {
                    let mut raw = [0u8; 8];
                    raw.copy_from_slice(chunk);
                    self.add(i64::from_be_bytes(raw));
                }
                Ok(())
            }
            MODE_COMPRESSED => {
                // V2 deflate header: cookie, then the compressed payload
                // length. A short header is left to the deserializer.
                if let Ok(payload_len) = read_i32(bytes, 8) {
                    let needed = 12 + payload_len.max(0) as usize;
                    if bytes.len() > needed {
                        return Err(HistogramError::TrailingBytes {
                            extra: bytes.len() - needed,
                        });
                    }
                }
                let mut reader = &bytes[4..];
                let mut theirs: Histogram<u64> = Deserializer::new()
                    .deserialize(&mut reader)
                    .map_err(|e| HistogramError::Deserialize {
                        detail: format!("{e:?}"),
                    })?;
                theirs.auto(true);
                self.merge_compressed(&theirs)
            }
            mode => Err(HistogramError::UnknownMode { mode }),
        }
    }

    /// Builds a histogram from its wire encoding.
    pub fn decode(bytes: &[u8]) -> Result<Self, HistogramError> {
        let mut histogram = Self::new();
        histogram.merge_encoded(bytes)?;
        Ok(histogram)
    }

    /// Encodes as `[i32 mode][payload]`, big-endian.
    pub fn encode(&self) -> Result<Vec<u8>, HistogramError> {
        match &self.repr {
            Repr::Raw { values, .. } => {
                let mut out = Vec::with_capacity(8 + values.len() * 8);
                out.extend_from_slice(&MODE_RAW.to_be_bytes());
                out.extend_from_slice(&(values.len() as i32).to_be_bytes());
                for value in values {
                    out.extend_from_slice(&value.to_be_bytes());
                }
                Ok(out)
            }
            Repr::Compressed(h) => {
                let mut out = Vec::with_capacity(256);
                out.extend_from_slice(&MODE_COMPRESSED.to_be_bytes());
                V2DeflateSerializer::new()
                    .serialize(h.as_ref(), &mut out)
                    .map_err(|e| HistogramError::Serialize {
                        detail: format!("{e:?}"),
                    })?;
                Ok(out)
            }
        }
    }

    /// Value at percentile `p` (0..=100). Returns 0 when empty.
    pub fn percentile(&mut self, p: f64) -> i64 {
        match &mut self.repr {
            Repr::Raw { values, sorted } => {
                if values.is_empty() {
                    return 0;
                }
                if !*sorted {
                    values.sort_unstable();
                    *sorted = true;
                }
                let count = values.len() as i64;
                let index = ((count as f64) * p / 100.0).ceil() as i64 - 1;
                values[index.clamp(0, count - 1) as usize]
            }
            Repr::Compressed(h) => {
                if h.len() == 0 {
                    return 0;
                }
                h.value_at_percentile(p).min(i64::MAX as u64) as i64
            }
        }
    }

    /// Number of recorded values.
    pub fn count(&self) -> u64 {
        match &self.repr {
            Repr::Raw { values, .. } => values.len() as u64,
            Repr::Compressed(h) => h.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_compressed(&self) -> bool {
        matches!(self.repr, Repr::Compressed(_))
    }

    /// Largest recorded value; the bucket's highest equivalent once compressed.
    pub fn max(&self) -> i64 {
        match &self.repr {
            Repr::Raw { values, .. } => values.iter().copied().max().unwrap_or(0),
            Repr::Compressed(h) => h.max().min(i64::MAX as u64) as i64,
        }
    }

    fn merge_compressed(&mut self, theirs: &Histogram<u64>) -> Result<(), HistogramError> {
        self.upgrade()
            .add(theirs)
            .map_err(|e| HistogramError::Merge {
                detail: format!("{e:?}"),
            })
    }

    /// Switches to the compressed form, replaying buffered raw values, and
    /// returns the live HDR histogram.
    fn upgrade(&mut self) -> &mut Histogram<u64> {
        if let Repr::Raw { values, .. } = &mut self.repr {
            let mut h = new_compressed();
            for &value in values.iter() {
                h.saturating_record(clamp_value(value));
            }
            self.repr = Repr::Compressed(Box::new(h));
        }
        match &mut self.repr {
            Repr::Compressed(h) => h,
            Repr::Raw { .. } => unreachable!("histogram upgraded above"),
        }
    }
}

impl Default for AdaptiveHistogram {
    fn default() -> Self {
        Self::new()
    }
}

#[allow(clippy::expect_used)]
fn new_compressed() -> Histogram<u64> {
    Histogram::new(SIGNIFICANT_DIGITS).expect("2 significant digits is a valid HDR precision")
}

fn clamp_value(value: i64) -> u64 {
    value.max(0) as u64
}

fn read_i32(bytes: &[u8], offset: usize) -> Result<i32, HistogramError> {
    let end = offset + 4;
    let slice = bytes.get(offset..end).ok_or(HistogramError::Truncated {
        needed: end,
        available: bytes.len(),
    })?;
    let mut raw = [0u8; 4];
    raw.copy_from_slice(slice);
    Ok(i32::from_be_bytes(raw))
}
