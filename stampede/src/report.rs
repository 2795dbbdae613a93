//! End-of-run summary and the reporters that publish it.
use async_trait::async_trait;
use serde::Serialize;
use std::{
    fmt::{self, Display},
    path::PathBuf,
    time::Duration,
};

use crate::{
    error::{Error, Result},
    executor::ExecutionReport,
    metric::Tags,
    summary::{RunSummary, SeriesSummary},
    threshold::ThresholdResult,
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Row {
    pub metric: String,
    /// Tags of the series minus the tags shared by every series.
    pub tags: Tags,
    pub value: SeriesSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdRow {
    pub expression: String,
    pub observed: Option<f64>,
    pub passed: bool,
}

impl From<&ThresholdResult> for ThresholdRow {
    fn from(result: &ThresholdResult) -> Self {
        Self {
            expression: result.threshold.source.clone(),
            observed: result.observed,
            passed: result.passed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ExecutionLine {
    pub peak_vus: u64,
    pub vus_spawned: u64,
    pub iterations: u64,
    pub hard_cancelled: bool,
}

/// Read-only projection of a [`RunSummary`] for humans and machines.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SummaryReport {
    pub elapsed: Duration,
    /// Tags carried by every series (`host`, `test_type`, ...).
    pub common_tags: Tags,
    pub rows: Vec<Row>,
    pub execution: Option<ExecutionLine>,
    pub thresholds: Vec<ThresholdRow>,
}

impl From<RunSummary> for SummaryReport {
    fn from(summary: RunSummary) -> Self {
        let mut common: Option<Tags> = None;
        for series in &summary.series {
            common = Some(match common {
                None => series.key.tags.clone(),
                Some(tags) => tags
                    .into_iter()
                    .filter(|(k, v)| series.key.tags.get(k) == Some(v))
                    .collect(),
            });
        }
        let common_tags = common.unwrap_or_default();

        let rows = summary
            .series
            .into_iter()
            .map(|series| Row {
                tags: series
                    .key
                    .tags
                    .into_iter()
                    .filter(|(k, _)| !common_tags.contains_key(k))
                    .collect(),
                metric: series.key.name,
                value: series.value,
            })
            .collect();

        Self {
            elapsed: summary.elapsed,
            common_tags,
            rows,
            execution: None,
            thresholds: Vec::new(),
        }
    }
}

impl SummaryReport {
    pub fn with_execution(mut self, execution: &ExecutionReport) -> Self {
        self.execution = Some(ExecutionLine {
            peak_vus: execution.peak_vus,
            vus_spawned: execution.vus_spawned,
            iterations: execution.iterations,
            hard_cancelled: execution.hard_cancelled,
        });
        self
    }

    pub fn with_thresholds(mut self, results: &[ThresholdResult]) -> Self {
        self.thresholds = results.iter().map(ThresholdRow::from).collect();
        self
    }
}

fn format_tags(tags: &Tags) -> String {
    if tags.is_empty() {
        return String::new();
    }
    let inner: Vec<String> = tags.iter().map(|(k, v)| format!("{k}={v}")).collect();
    format!("{{{}}}", inner.join(","))
}

fn format_value(value: &SeriesSummary) -> String {
    match value {
        SeriesSummary::Trend(t) => format!(
            "avg={:.2} min={:.2} med={:.2} max={:.2} p(90)={:.2} p(95)={:.2} p(99)={:.2} count={}",
            t.avg, t.min, t.p50, t.max, t.p90, t.p95, t.p99, t.count
        ),
        SeriesSummary::Rate(r) => format!(
            "{:.2}% ✓ {} ✗ {}",
            r.rate * 100.0,
            r.passes,
            r.total - r.passes
        ),
        SeriesSummary::Counter(c) => format!("{} {:.2}/s", c.total, c.per_second),
    }
}

impl Display for SummaryReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "  run time: {}", humantime::format_duration(round_millis(self.elapsed)))?;
        if !self.common_tags.is_empty() {
            write!(f, "  {}", format_tags(&self.common_tags))?;
        }
        writeln!(f)?;
        if let Some(e) = &self.execution {
            write!(
                f,
                "  vus: peak={} spawned={}  iterations: {}",
                e.peak_vus, e.vus_spawned, e.iterations
            )?;
            if e.hard_cancelled {
                write!(f, "  (in-flight iterations cancelled)")?;
            }
            writeln!(f)?;
        }
        writeln!(f)?;

        let labels: Vec<String> = self.rows.iter().map(|r| format_tags(&r.tags)).collect();
        let width = labels.iter().map(|l| l.chars().count()).max().unwrap_or(0) + 4;

        let mut previous: Option<&str> = None;
        for (row, label) in self.rows.iter().zip(&labels) {
            if previous != Some(row.metric.as_str()) {
                writeln!(f, "  {}", row.metric)?;
                previous = Some(row.metric.as_str());
            }
            let label = if label.is_empty() { "*" } else { label.as_str() };
            writeln!(f, "    {label:.<width$}: {}", format_value(&row.value))?;
        }

        if !self.thresholds.is_empty() {
            writeln!(f)?;
            writeln!(f, "  thresholds")?;
            for t in &self.thresholds {
                let mark = if t.passed { '✓' } else { '✗' };
                match t.observed {
                    Some(v) => writeln!(f, "    {mark} {} (observed: {v:.2})", t.expression)?,
                    None => writeln!(f, "    {mark} {} (no data)", t.expression)?,
                }
            }
        }
        Ok(())
    }
}

fn round_millis(d: Duration) -> Duration {
    Duration::from_millis(d.as_millis() as u64)
}

/// Publishes a finished report somewhere.
#[async_trait]
pub trait Reporter {
    async fn report(&self, report: &SummaryReport) -> Result<()>;
}

/// Prints the aligned text table.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdoutReporter;

#[async_trait]
impl Reporter for StdoutReporter {
    async fn report(&self, report: &SummaryReport) -> Result<()> {
        println!("{report}");
        Ok(())
    }
}

/// Writes the report as pretty JSON, to a file when a path is set.
#[derive(Debug, Clone, Default)]
pub struct JsonReporter {
    pub path: Option<PathBuf>,
}

impl JsonReporter {
    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
        }
    }
}

#[async_trait]
impl Reporter for JsonReporter {
    async fn report(&self, report: &SummaryReport) -> Result<()> {
        let json = serde_json::to_string_pretty(report)
            .map_err(|e| Error::export(format!("report serialization failed: {e}")))?;
        match &self.path {
            Some(path) => {
                tokio::fs::write(path, json).await.map_err(|e| {
                    Error::export(format!("cannot write report to {}: {e}", path.display()))
                })?;
                tracing::info!("Report written to {}", path.display());
            }
            None => println!("{json}"),
        }
        Ok(())
    }
}
