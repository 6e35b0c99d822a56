//! Dictionary and sequence model
//!
//! A sequence is an in-flight transactional batch: per-sequence dictionary,
//! running timestamp with delta reconstruction, and a streaming MAC over the
//! exact wire bytes of the sequence body. Samples are handed to the sink as
//! they decode; the whole batch stands or falls with the `SIG` check.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::crypto::hash::{HashAlgorithm, HashError, HmacCtx};

/// Sequence-level errors; these abort the in-flight sequence but (except for
/// malformed sample shapes, which are framing-class) leave the session usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequenceError {
    /// seqid not strictly greater than the last committed id
    NotMonotonic(u64),
    ZeroTimeDivisor,
    ZeroUnitDivisor,
    EmptyName,
    UnknownDataFormat(u32),
    UnknownDictIndex(u32),
    /// Format-1 span below zero while the policy rejects those
    NegativeSpan,
    /// Sample count exceeded the advertised per-sequence cap
    TooManySamples,
    /// Sample fields do not match the sequence's data format
    MalformedSample,
    /// Timestamp arithmetic left the representable range
    TimestampOverflow,
}

impl std::fmt::Display for SequenceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotMonotonic(seqid) => write!(f, "sequence id {} is not monotonic", seqid),
            Self::ZeroTimeDivisor => write!(f, "time divisor is zero"),
            Self::ZeroUnitDivisor => write!(f, "unit divisor is zero"),
            Self::EmptyName => write!(f, "dictionary name is empty"),
            Self::UnknownDataFormat(fmt) => write!(f, "unknown data format {}", fmt),
            Self::UnknownDictIndex(idx) => write!(f, "unknown dictionary index {}", idx),
            Self::NegativeSpan => write!(f, "negative span"),
            Self::TooManySamples => write!(f, "sample count exceeds sequence limit"),
            Self::MalformedSample => write!(f, "sample line does not match data format"),
            Self::TimestampOverflow => write!(f, "timestamp overflow"),
        }
    }
}

impl std::error::Error for SequenceError {}

/// Sensor metadata for one dictionary index, scoped to a single sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DictEntry {
    pub unit: String,
    pub unit_divisor: i64,
    pub name: String,
}

/// A sample timestamp as the exact rational `numer / divisor`.
///
/// The client chooses the fixed-point scale; carrying both parts preserves
/// it. Conversion to floating point is the sink's call, not ours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScaledTime {
    pub numer: i64,
    pub divisor: i64,
}

impl ScaledTime {
    pub fn to_f64(self) -> f64 {
        self.numer as f64 / self.divisor as f64
    }
}

/// A decoded sample as handed to the sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub seqid: u64,
    pub dict_idx: u32,
    pub time: ScaledTime,
    /// Zero under data format 0
    pub span: i64,
    /// Values stay as transmitted ASCII; `NaN`, `+Inf`, `-Inf` are legal
    pub values: Vec<String>,
    pub unit: String,
    pub unit_divisor: i64,
    pub name: String,
}

/// Data formats officially defined by the protocol.
const FORMAT_PLAIN: u32 = 0;
const FORMAT_SPAN: u32 = 1;

/// One in-flight sequence: identity, running timestamp, dictionary and the
/// ingestion policy it was begun under.
#[derive(Debug)]
pub struct Sequence {
    seqid: u64,
    time_divisor: i64,
    data_format: u32,
    running_timestamp: i64,
    dict: HashMap<u32, DictEntry>,
    sample_count: u32,
    max_samples: Option<u32>,
    reject_negative_span: bool,
}

impl Sequence {
    /// Validate the `SEQ` parameters and open a sequence.
    ///
    /// `last_committed` is the session's last successfully committed id;
    /// the new id must be strictly greater.
    pub fn begin(
        seqid: u64,
        basetime: i64,
        time_divisor: i64,
        data_format: u32,
        last_committed: Option<u64>,
        max_samples: Option<u32>,
        reject_negative_span: bool,
    ) -> Result<Self, SequenceError> {
        if let Some(last) = last_committed {
            if seqid <= last {
                return Err(SequenceError::NotMonotonic(seqid));
            }
        }
        if time_divisor == 0 {
            return Err(SequenceError::ZeroTimeDivisor);
        }
        if data_format != FORMAT_PLAIN && data_format != FORMAT_SPAN {
            return Err(SequenceError::UnknownDataFormat(data_format));
        }

        Ok(Self {
            seqid,
            time_divisor,
            data_format,
            running_timestamp: basetime,
            dict: HashMap::new(),
            sample_count: 0,
            max_samples,
            reject_negative_span,
        })
    }

    pub fn seqid(&self) -> u64 {
        self.seqid
    }

    /// Define or redefine a dictionary index. Redefinition within the same
    /// sequence replaces the prior entry.
    pub fn put_dict_entry(
        &mut self,
        idx: u32,
        unit: String,
        unit_divisor: i64,
        name: String,
    ) -> Result<(), SequenceError> {
        if unit_divisor == 0 {
            return Err(SequenceError::ZeroUnitDivisor);
        }
        if name.is_empty() {
            return Err(SequenceError::EmptyName);
        }
        self.dict.insert(
            idx,
            DictEntry {
                unit,
                unit_divisor,
                name,
            },
        );
        Ok(())
    }

    /// Decode one data line's fields (everything after the index) into a
    /// sample, advancing the running timestamp.
    pub fn ingest_sample(&mut self, idx: u32, rest: &[String]) -> Result<Sample, SequenceError> {
        let (delta_str, span_str, values) = match self.data_format {
            FORMAT_PLAIN => {
                // idx,delta_t,value
                if rest.len() != 2 {
                    return Err(SequenceError::MalformedSample);
                }
                (&rest[0], None, &rest[1..])
            }
            FORMAT_SPAN => {
                // idx,delta_t,span,value1[,value2...]
                if rest.len() < 3 {
                    return Err(SequenceError::MalformedSample);
                }
                (&rest[0], Some(&rest[1]), &rest[2..])
            }
            other => return Err(SequenceError::UnknownDataFormat(other)),
        };

        let delta: i64 = delta_str
            .parse()
            .map_err(|_| SequenceError::MalformedSample)?;
        let span: i64 = match span_str {
            Some(s) => s.parse().map_err(|_| SequenceError::MalformedSample)?,
            None => 0,
        };
        if span < 0 && self.reject_negative_span {
            return Err(SequenceError::NegativeSpan);
        }

        if let Some(max) = self.max_samples {
            if self.sample_count >= max {
                return Err(SequenceError::TooManySamples);
            }
        }

        let entry = self
            .dict
            .get(&idx)
            .ok_or(SequenceError::UnknownDictIndex(idx))?;

        self.running_timestamp = self
            .running_timestamp
            .checked_add(delta)
            .ok_or(SequenceError::TimestampOverflow)?;
        self.sample_count += 1;

        Ok(Sample {
            seqid: self.seqid,
            dict_idx: idx,
            time: ScaledTime {
                numer: self.running_timestamp,
                divisor: self.time_divisor,
            },
            span,
            values: values.to_vec(),
            unit: entry.unit.clone(),
            unit_divisor: entry.unit_divisor,
            name: entry.name.clone(),
        })
    }
}

/// Streaming MAC over a sequence body.
///
/// Covers exactly `[first byte of the SEQ line, first byte of the SIG line)`:
/// seeded with the raw challenge-token bytes, then fed every covered line
/// verbatim plus its LF. The SIG line itself is never fed.
pub struct SequenceMac {
    mac: HmacCtx,
}

impl SequenceMac {
    pub fn begin(
        algorithm: HashAlgorithm,
        key: &[u8],
        token_raw: &[u8],
    ) -> Result<Self, HashError> {
        let mut mac = HmacCtx::new(algorithm, key)?;
        mac.update(token_raw);
        Ok(Self { mac })
    }

    /// Feed one covered line (without its LF); the LF is appended here so
    /// the MAC sees the exact wire bytes.
    pub fn feed_line(&mut self, line: &[u8]) {
        self.mac.update(line);
        self.mac.update(b"\n");
    }

    pub fn finalize(self) -> Vec<u8> {
        self.mac.finalize()
    }
}
