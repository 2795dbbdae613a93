use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime};

use crate::metric::{MetricKind, SeriesKey, Tags};

/// Derived statistics of a trend series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TrendSummary {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    pub avg: f64,
    pub p50: f64,
    pub p90: f64,
    pub p95: f64,
    pub p99: f64,
}

/// Derived statistics of a rate series. `rate` is always in `[0, 1]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct RateSummary {
    pub passes: u64,
    pub total: u64,
    pub rate: f64,
}

/// Derived statistics of a counter series.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CounterSummary {
    pub total: f64,
    /// Average increments per second over the aggregator's lifetime.
    pub per_second: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SeriesSummary {
    Trend(TrendSummary),
    Rate(RateSummary),
    Counter(CounterSummary),
}

impl SeriesSummary {
    pub fn kind(&self) -> MetricKind {
        match self {
            SeriesSummary::Trend(_) => MetricKind::Trend,
            SeriesSummary::Rate(_) => MetricKind::Rate,
            SeriesSummary::Counter(_) => MetricKind::Counter,
        }
    }

    pub fn as_trend(&self) -> Option<&TrendSummary> {
        match self {
            SeriesSummary::Trend(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_rate(&self) -> Option<&RateSummary> {
        match self {
            SeriesSummary::Rate(r) => Some(r),
            _ => None,
        }
    }

    pub fn counter_total(&self) -> Option<f64> {
        match self {
            SeriesSummary::Counter(c) => Some(c.total),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SeriesSnapshot {
    pub key: SeriesKey,
    pub value: SeriesSummary,
}

/// A read-only, point-in-time copy of every metric series of a run.
///
/// Owns its data: later recordings never show up in an existing summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    /// Time since the aggregator was created.
    pub elapsed: Duration,
    /// Wall-clock instant the snapshot was taken.
    pub captured_at: SystemTime,
    /// Series sorted by name, then by tag set.
    pub series: Vec<SeriesSnapshot>,
}

impl RunSummary {
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// The series with exactly this name and tag set.
    pub fn get(&self, name: &str, tags: &Tags) -> Option<&SeriesSnapshot> {
        self.series
            .iter()
            .find(|s| s.key.name == name && &s.key.tags == tags)
    }

    /// Every series with this name, across all tag sets.
    pub fn by_name<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a SeriesSnapshot> + 'a {
        self.series.iter().filter(move |s| s.key.name == name)
    }

    /// Sum of a counter over all of its tag sets. Zero when absent.
    pub fn counter_total(&self, name: &str) -> f64 {
        self.by_name(name)
            .filter_map(|s| s.value.counter_total())
            .sum()
    }

    /// Rate of a metric over all of its tag sets.
    pub fn rate(&self, name: &str) -> Option<f64> {
        let (passes, total) = self
            .by_name(name)
            .filter_map(|s| s.value.as_rate())
            .fold((0u64, 0u64), |(p, t), r| (p + r.passes, t + r.total));
        (total > 0).then(|| passes as f64 / total as f64)
    }

    /// Number of trend observations over all tag sets of a metric.
    pub fn trend_count(&self, name: &str) -> u64 {
        self.by_name(name)
            .filter_map(|s| s.value.as_trend())
            .map(|t| t.count)
            .sum()
    }
}
