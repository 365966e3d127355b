//! The unit of ingestion: a single typed measurement moving from the wire to a fold.

use std::collections::BTreeMap;

use thiserror::Error;

use crate::wire;

/// The kind of Prometheus metric a sample contributes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleKind {
    Counter,
    Gauge,
    Histogram,
    HistogramLinear,
}

impl SampleKind {
    /// Parses the short wire symbol (`c`, `g`, `h`, `hl`) used by the original aggregator.
    pub fn parse(symbol: &str) -> Option<SampleKind> {
        match symbol {
            "c" => Some(SampleKind::Counter),
            "g" => Some(SampleKind::Gauge),
            "h" => Some(SampleKind::Histogram),
            "hl" => Some(SampleKind::HistogramLinear),
            _ => None,
        }
    }

    /// Whether this kind is backed by a histogram distribution once a vector is created.
    pub fn is_histogram(self) -> bool {
        matches!(self, SampleKind::Histogram | SampleKind::HistogramLinear)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            SampleKind::Counter => "counter",
            SampleKind::Gauge => "gauge",
            SampleKind::Histogram => "histogram",
            SampleKind::HistogramLinear => "histogram-linear",
        }
    }
}

/// A single measurement, decoded from the wire and ready to be folded into a vector.
#[derive(Debug, Clone)]
pub struct Sample {
    pub service: String,
    pub name: String,
    pub kind_raw: String,
    pub labels: BTreeMap<String, String>,
    pub value: f64,
    /// Bucket boundaries for `histogram`, `[start, width, count]` for `histogram-linear`.
    pub histogram_def: Vec<String>,
}

/// A sample that failed validation before it could touch any vector state.
///
/// Never propagates past the folding task: it is counted and logged at `debug` per the
/// error taxonomy, and the registry/vector it would have touched is left unchanged.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidSample {
    #[error("empty service name")]
    EmptyService,
    #[error("service name {0:?} is reserved for self-metrics")]
    ReservedServiceName(String),
    #[error("empty metric name")]
    EmptyName,
    #[error("unknown sample kind {0:?}")]
    UnknownKind(String),
    #[error("non-finite value")]
    NonFiniteValue,
    #[error("negative counter increment")]
    NegativeCounterValue,
    #[error("histogram definition has no buckets")]
    EmptyHistogramBuckets,
    #[error("histogram bucket bound is not a finite number: {0:?}")]
    BadHistogramBound(String),
    #[error("histogram-linear definition must be [start, width, count], got {0} fields")]
    BadLinearArity(usize),
    #[error("histogram-linear count must be greater than zero")]
    ZeroLinearCount,
}

impl Sample {
    /// Converts the wire message into a domain sample. No validation happens here: unknown
    /// kinds and malformed histogram definitions are surfaced later, in the folding task,
    /// per the spec's error taxonomy (decode errors are frame-level, not sample-level).
    pub fn from_wire(msg: wire::Sample) -> Sample {
        Sample {
            service: msg.service,
            name: msg.name,
            kind_raw: msg.kind,
            labels: msg.labels.into_iter().collect(),
            value: msg.value,
            histogram_def: msg.histogram_def,
        }
    }

    /// Validates structural invariants that hold regardless of kind.
    pub fn validate_common(&self) -> Result<SampleKind, InvalidSample> {
        if self.service.trim().is_empty() {
            return Err(InvalidSample::EmptyService);
        }
        if self.name.trim().is_empty() {
            return Err(InvalidSample::EmptyName);
        }
        if !self.value.is_finite() {
            return Err(InvalidSample::NonFiniteValue);
        }
        let kind = SampleKind::parse(&self.kind_raw)
            .ok_or_else(|| InvalidSample::UnknownKind(self.kind_raw.clone()))?;
        if kind == SampleKind::Counter && self.value < 0.0 {
            return Err(InvalidSample::NegativeCounterValue);
        }
        Ok(kind)
    }

    /// Parses `histogram_def` into explicit bucket boundaries, expanding `histogram-linear`'s
    /// `[start, width, count]` form per the same convention as the Prometheus client's
    /// `LinearBuckets` helper.
    pub fn resolve_buckets(&self, kind: SampleKind) -> Result<Vec<f64>, InvalidSample> {
        match kind {
            SampleKind::Histogram => {
                if self.histogram_def.is_empty() {
                    return Err(InvalidSample::EmptyHistogramBuckets);
                }
                self.histogram_def
                    .iter()
                    .map(|s| {
                        s.parse::<f64>()
                            .ok()
                            .filter(|v| v.is_finite())
                            .ok_or_else(|| InvalidSample::BadHistogramBound(s.clone()))
                    })
                    .collect()
            }
            SampleKind::HistogramLinear => {
                if self.histogram_def.len() != 3 {
                    return Err(InvalidSample::BadLinearArity(self.histogram_def.len()));
                }
                let start: f64 = self.histogram_def[0]
                    .parse()
                    .map_err(|_| InvalidSample::BadHistogramBound(self.histogram_def[0].clone()))?;
                let width: f64 = self.histogram_def[1]
                    .parse()
                    .map_err(|_| InvalidSample::BadHistogramBound(self.histogram_def[1].clone()))?;
                let count: usize = self.histogram_def[2]
                    .parse()
                    .map_err(|_| InvalidSample::BadHistogramBound(self.histogram_def[2].clone()))?;
                if count == 0 {
                    return Err(InvalidSample::ZeroLinearCount);
                }
                Ok((0..count).map(|i| start + width * i as f64).collect())
            }
            SampleKind::Counter | SampleKind::Gauge => Ok(Vec::new()),
        }
    }
}
