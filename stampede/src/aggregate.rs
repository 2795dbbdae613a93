use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use std::{
    fmt::Debug,
    time::{Instant, SystemTime},
};

use crate::{
    error::MetricError,
    metric::{MetricKind, Sample, SeriesKey, Tags},
    summary::{CounterSummary, RateSummary, RunSummary, SeriesSnapshot, SeriesSummary, TrendSummary},
};

/// The `Aggregate` trait defines how raw sample values are collected and combined
/// into an intermediate, mergeable representation that preserves the information
/// necessary for later analysis.
///
/// Aggregates store compact raw data (counts, sums, histograms). Derived values such
/// as averages or percentiles are produced by [`Aggregate::summarize`] only when a
/// snapshot is requested, never on the recording hot path.
///
/// # Implementor notes
/// - `merge` must be **associative** and **commutative** so that merging order does not
///   affect results when combining partial aggregates.
/// - Counts and totals must never decrease.
pub trait Aggregate
where
    Self: Send + Sync + Debug + Clone,
{
    /// The read-only projection handed out in snapshots.
    type Summary;

    /// Create a new, empty instance of the aggregate.
    fn new() -> Self;

    /// Incorporate a single value into the aggregate.
    fn consume(&mut self, value: f64);

    /// Combine two aggregates into one.
    fn merge(&mut self, other: Self);

    /// Derive the final statistics.
    fn summarize(&self) -> Self::Summary;
}

/// Trend values are stored in the histogram in thousandths of their unit
/// (microseconds for millisecond latencies).
const TREND_SCALE: f64 = 1_000.0;
/// Three significant digits bound the relative error of any recorded
/// quantile to 0.1%.
const TREND_SIGFIGS: u8 = 3;

fn new_histogram() -> Histogram<u64> {
    // only fails on an invalid precision
    let mut histogram =
        Histogram::new(TREND_SIGFIGS).expect("3 significant figures is a valid HDR precision");
    histogram.auto(true);
    histogram
}

/// Distribution of observed values.
///
/// Keeps exact count, sum, min and max plus an auto-resizing HDR histogram for
/// percentile queries. Negative values are recorded into the exact fields but
/// land in the histogram's zero bucket; quantiles are clamped to `[min, max]`.
#[derive(Debug, Clone)]
pub struct TrendAggregate {
    pub count: u64,
    pub sum: f64,
    pub min: f64,
    pub max: f64,
    histogram: Histogram<u64>,
}

impl TrendAggregate {
    fn quantile(&self, q: f64) -> f64 {
        let raw = self.histogram.value_at_quantile(q) as f64 / TREND_SCALE;
        raw.clamp(self.min, self.max)
    }
}

impl Aggregate for TrendAggregate {
    type Summary = TrendSummary;

    fn new() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            histogram: new_histogram(),
        }
    }

    fn consume(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;
        self.min = self.min.min(value);
        self.max = self.max.max(value);
        let scaled = (value.max(0.0) * TREND_SCALE).round() as u64;
        // `record` grows the histogram; `saturating_record` would not
        if let Err(e) = self.histogram.record(scaled) {
            tracing::warn!("Trend value {value} not recorded in histogram: {e}");
        }
    }

    fn merge(&mut self, other: Self) {
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        if let Err(e) = self.histogram.add(&other.histogram) {
            tracing::warn!("Failed to merge trend histograms: {e}");
        }
    }

    fn summarize(&self) -> TrendSummary {
        if self.count == 0 {
            return TrendSummary::default();
        }
        TrendSummary {
            count: self.count,
            sum: self.sum,
            min: self.min,
            max: self.max,
            avg: self.sum / self.count as f64,
            p50: self.quantile(0.50),
            p90: self.quantile(0.90),
            p95: self.quantile(0.95),
            p99: self.quantile(0.99),
        }
    }
}

/// Fraction of true observations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateAggregate {
    pub passes: u64,
    pub total: u64,
}

impl Aggregate for RateAggregate {
    type Summary = RateSummary;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.total += 1;
        if value != 0.0 {
            self.passes += 1;
        }
    }

    fn merge(&mut self, other: Self) {
        self.passes += other.passes;
        self.total += other.total;
    }

    fn summarize(&self) -> RateSummary {
        let rate = if self.total == 0 {
            0.0
        } else {
            self.passes as f64 / self.total as f64
        };
        RateSummary {
            passes: self.passes,
            total: self.total,
            rate,
        }
    }
}

/// Monotonic running total.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CounterAggregate {
    pub total: f64,
    pub updates: u64,
}

impl Aggregate for CounterAggregate {
    type Summary = CounterSummary;

    fn new() -> Self {
        Self::default()
    }

    fn consume(&mut self, value: f64) {
        self.total += value;
        self.updates += 1;
    }

    fn merge(&mut self, other: Self) {
        self.total += other.total;
        self.updates += other.updates;
    }

    fn summarize(&self) -> CounterSummary {
        CounterSummary {
            total: self.total,
            per_second: 0.0,
        }
    }
}

/// State of one `(metric_name, tag-set)` series.
#[derive(Debug, Clone)]
pub enum Series {
    Trend(TrendAggregate),
    Rate(RateAggregate),
    Counter(CounterAggregate),
}

impl Series {
    pub fn new(kind: MetricKind) -> Self {
        match kind {
            MetricKind::Trend => Series::Trend(TrendAggregate::new()),
            MetricKind::Rate => Series::Rate(RateAggregate::new()),
            MetricKind::Counter => Series::Counter(CounterAggregate::new()),
        }
    }

    pub fn kind(&self) -> MetricKind {
        match self {
            Series::Trend(_) => MetricKind::Trend,
            Series::Rate(_) => MetricKind::Rate,
            Series::Counter(_) => MetricKind::Counter,
        }
    }

    /// Folds `other` into this series. Returns `other`'s kind when the kinds differ.
    fn merge(&mut self, other: Series) -> Result<(), MetricKind> {
        match (self, other) {
            (Series::Trend(a), Series::Trend(b)) => a.merge(b),
            (Series::Rate(a), Series::Rate(b)) => a.merge(b),
            (Series::Counter(a), Series::Counter(b)) => a.merge(b),
            (_, other) => return Err(other.kind()),
        }
        Ok(())
    }

    /// Returns the existing kind when `kind` does not match this series.
    fn consume(&mut self, kind: MetricKind, value: f64) -> Result<(), MetricKind> {
        match (self, kind) {
            (Series::Trend(t), MetricKind::Trend) => t.consume(value),
            (Series::Rate(r), MetricKind::Rate) => r.consume(value),
            (Series::Counter(c), MetricKind::Counter) => c.consume(value),
            (s, _) => return Err(s.kind()),
        }
        Ok(())
    }

    fn summarize(&self, elapsed_secs: f64) -> SeriesSummary {
        match self {
            Series::Trend(t) => SeriesSummary::Trend(t.summarize()),
            Series::Rate(r) => SeriesSummary::Rate(r.summarize()),
            Series::Counter(c) => {
                let mut summary = c.summarize();
                if elapsed_secs > 0.0 {
                    summary.per_second = summary.total / elapsed_secs;
                }
                SeriesSummary::Counter(summary)
            }
        }
    }
}

/// Thread-safe store of every metric series of one run.
///
/// Series live in a sharded concurrent map and each one sits behind its own
/// mutex, so concurrent [`Aggregator::record`] calls on different series
/// never wait on each other and calls on the same series are serialized
/// without losing updates.
///
/// An `Aggregator` belongs to exactly one run; share it with `Arc`.
#[derive(Debug)]
pub struct Aggregator {
    series: DashMap<SeriesKey, Mutex<Series>>,
    started: Instant,
}

impl Default for Aggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Aggregator {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            started: Instant::now(),
        }
    }

    /// Fold one sample into its series, creating the series on first use.
    pub fn record(&self, sample: Sample) -> Result<(), MetricError> {
        let Sample {
            metric_name,
            kind,
            value,
            tags,
            ..
        } = sample;

        if !value.is_finite() {
            return Err(MetricError::NonFinite { name: metric_name });
        }
        if kind == MetricKind::Counter && value < 0.0 {
            return Err(MetricError::NegativeIncrement {
                name: metric_name,
                value,
            });
        }

        let key = SeriesKey {
            name: metric_name,
            tags,
        };
        let mismatch = |existing: MetricKind, name: String| MetricError::KindMismatch {
            name,
            existing,
            attempted: kind,
        };

        // Fast path: only a shard read lock is held while the series mutex is taken.
        if let Some(series) = self.series.get(&key) {
            return series
                .lock()
                .consume(kind, value)
                .map_err(|existing| mismatch(existing, key.name.clone()));
        }

        let name = key.name.clone();
        let series = self
            .series
            .entry(key)
            .or_insert_with(|| Mutex::new(Series::new(kind)));
        let result = series.lock().consume(kind, value);
        result.map_err(|existing| mismatch(existing, name))
    }

    /// Number of distinct series recorded so far.
    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    /// Every series of `name` whose tags contain `filter`, merged into one.
    ///
    /// `Ok(None)` when no series matches. Mixing kinds under one name is a
    /// [`MetricError::KindMismatch`].
    pub fn merged(&self, name: &str, filter: &Tags) -> Result<Option<SeriesSummary>, MetricError> {
        let mut merged: Option<Series> = None;
        let matching = self.series.iter().filter(|entry| {
            let key = entry.key();
            key.name == name && filter.iter().all(|(k, v)| key.tags.get(k) == Some(v))
        });
        for entry in matching {
            let series = entry.value().lock().clone();
            merged = Some(match merged.take() {
                None => series,
                Some(mut acc) => {
                    acc.merge(series).map_err(|attempted| MetricError::KindMismatch {
                        name: name.to_string(),
                        existing: acc.kind(),
                        attempted,
                    })?;
                    acc
                }
            });
        }
        let elapsed_secs = self.started.elapsed().as_secs_f64();
        Ok(merged.map(|series| series.summarize(elapsed_secs)))
    }

    /// Point-in-time copy of every series, sorted by series key.
    pub fn snapshot(&self) -> RunSummary {
        let elapsed = self.started.elapsed();
        let elapsed_secs = elapsed.as_secs_f64();
        let mut series: Vec<SeriesSnapshot> = self
            .series
            .iter()
            .map(|entry| SeriesSnapshot {
                key: entry.key().clone(),
                value: entry.value().lock().summarize(elapsed_secs),
            })
            .collect();
        series.sort_by(|a, b| a.key.cmp(&b.key));

        RunSummary {
            elapsed,
            captured_at: SystemTime::now(),
            series,
        }
    }
}
