use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fmt, time::SystemTime};

/// Tag dimensions of a sample. Ordered so that two tag sets with the same
/// pairs always compare and hash equal regardless of insertion order.
pub type Tags = BTreeMap<String, String>;

/// The three supported metric kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// A distribution of observed values (supports percentile queries).
    Trend,
    /// The fraction of boolean-true observations over all observations.
    Rate,
    /// A monotonically increasing total.
    Counter,
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MetricKind::Trend => "trend",
            MetricKind::Rate => "rate",
            MetricKind::Counter => "counter",
        };
        f.write_str(s)
    }
}

/// A `Sample` is a single observed measurement produced by the system under test.
///
/// Samples are the most granular level of data. They are created by the
/// scenario runner, consumed by the [`crate::Aggregator`], and never mutated
/// afterwards.
///
/// Rate samples carry `1.0` for a true observation and `0.0` for a false one;
/// the [`Sample::rate`] constructor takes care of that.
///
/// ## Example
/// ```rust
/// use stampede::metric::{MetricKind, Sample};
///
/// let sample = Sample::trend("http_req_duration", 12.5).with_tag("step", "search");
/// assert_eq!(sample.kind, MetricKind::Trend);
/// assert_eq!(sample.tags["step"], "search");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub metric_name: String,
    pub kind: MetricKind,
    pub value: f64,
    pub tags: Tags,
    pub timestamp: SystemTime,
}

impl Sample {
    pub fn new(metric_name: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        Self {
            metric_name: metric_name.into(),
            kind,
            value,
            tags: Tags::new(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn trend(metric_name: impl Into<String>, value: f64) -> Self {
        Self::new(metric_name, MetricKind::Trend, value)
    }

    pub fn rate(metric_name: impl Into<String>, ok: bool) -> Self {
        Self::new(metric_name, MetricKind::Rate, if ok { 1.0 } else { 0.0 })
    }

    pub fn counter(metric_name: impl Into<String>, increment: f64) -> Self {
        Self::new(metric_name, MetricKind::Counter, increment)
    }

    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Adds every tag of `tags` that the sample does not already define.
    pub fn with_base_tags(mut self, tags: &Tags) -> Self {
        for (k, v) in tags {
            self.tags.entry(k.clone()).or_insert_with(|| v.clone());
        }
        self
    }

    /// Identity of the series this sample belongs to.
    pub fn series_key(&self) -> SeriesKey {
        SeriesKey {
            name: self.metric_name.clone(),
            tags: self.tags.clone(),
        }
    }
}

/// Series identity: metric name plus the full tag set.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SeriesKey {
    pub name: String,
    pub tags: Tags,
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.tags.is_empty() {
            return Ok(());
        }
        f.write_str("{")?;
        for (i, (k, v)) in self.tags.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v}")?;
        }
        f.write_str("}")
    }
}

/// Names of the metrics emitted by the engine itself.
pub mod names {
    pub const HTTP_REQS: &str = "http_reqs";
    pub const HTTP_REQ_DURATION: &str = "http_req_duration";
    pub const HTTP_REQ_SUCCESS: &str = "http_req_success";
    pub const ITERATIONS: &str = "iterations";
    pub const ITERATION_DURATION: &str = "iteration_duration";
    pub const ERRORS: &str = "errors";
    pub const UNEXPECTED_RESPONSE_SHAPE: &str = "unexpected_response_shape";
}
