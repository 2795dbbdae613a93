//! Optional pass/fail gate evaluated once every VU has finished.
//!
//! Thresholds use the k6 syntax: the metric expression may carry a tag filter
//! (`search_latency{type:no-index}`) and each condition is
//! `<stat> <op> <value>`, e.g. `p(95)<500`, `avg<=200`, `rate>0.95`, `count<10`.
use serde::Serialize;
use std::fmt;

use crate::{
    aggregate::Aggregator,
    error::{Error, Result},
    metric::Tags,
    summary::SeriesSummary,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stat {
    Avg,
    Min,
    Max,
    Med,
    P90,
    P95,
    P99,
    Rate,
    Count,
}

impl Stat {
    fn parse(raw: &str) -> Result<Self> {
        let stat = match raw {
            "avg" => Stat::Avg,
            "min" => Stat::Min,
            "max" => Stat::Max,
            "med" | "p(50)" => Stat::Med,
            "p(90)" => Stat::P90,
            "p(95)" => Stat::P95,
            "p(99)" => Stat::P99,
            "rate" => Stat::Rate,
            "count" => Stat::Count,
            other => return Err(Error::config(format!("unsupported threshold statistic {other}"))),
        };
        Ok(stat)
    }

    /// The observed value of this statistic, `None` if it does not apply to the series kind.
    fn observe(&self, value: &SeriesSummary) -> Option<f64> {
        match (self, value) {
            (Stat::Avg, SeriesSummary::Trend(t)) => Some(t.avg),
            (Stat::Min, SeriesSummary::Trend(t)) => Some(t.min),
            (Stat::Max, SeriesSummary::Trend(t)) => Some(t.max),
            (Stat::Med, SeriesSummary::Trend(t)) => Some(t.p50),
            (Stat::P90, SeriesSummary::Trend(t)) => Some(t.p90),
            (Stat::P95, SeriesSummary::Trend(t)) => Some(t.p95),
            (Stat::P99, SeriesSummary::Trend(t)) => Some(t.p99),
            (Stat::Count, SeriesSummary::Trend(t)) => Some(t.count as f64),
            (Stat::Rate, SeriesSummary::Rate(r)) => Some(r.rate),
            (Stat::Count, SeriesSummary::Rate(r)) => Some(r.total as f64),
            (Stat::Count, SeriesSummary::Counter(c)) => Some(c.total),
            (Stat::Rate, SeriesSummary::Counter(c)) => Some(c.per_second),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Op {
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
}

impl Op {
    fn holds(&self, observed: f64, limit: f64) -> bool {
        match self {
            Op::Lt => observed < limit,
            Op::Le => observed <= limit,
            Op::Gt => observed > limit,
            Op::Ge => observed >= limit,
            Op::Eq => observed == limit,
            Op::Ne => observed != limit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Threshold {
    pub metric: String,
    pub tags: Tags,
    pub stat: Stat,
    pub op: Op,
    pub limit: f64,
    /// The expression as written, used in reports.
    pub source: String,
}

impl fmt::Display for Threshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.source)
    }
}

/// Splits `name{k:v,k2:v2}` into its name and tag filter.
fn parse_metric_expr(raw: &str) -> Result<(String, Tags)> {
    let raw = raw.trim();
    let Some(open) = raw.find('{') else {
        return Ok((raw.to_string(), Tags::new()));
    };
    let Some(inner) = raw[open + 1..].strip_suffix('}') else {
        return Err(Error::config(format!("unterminated tag filter in {raw}")));
    };
    let mut tags = Tags::new();
    for pair in inner.split(',').filter(|p| !p.trim().is_empty()) {
        let (k, v) = pair
            .split_once(':')
            .ok_or_else(|| Error::config(format!("tag filter {pair} in {raw} is not key:value")))?;
        tags.insert(k.trim().to_string(), v.trim().to_string());
    }
    Ok((raw[..open].trim().to_string(), tags))
}

fn parse_condition(raw: &str) -> Result<(Stat, Op, f64)> {
    // two-character operators first so `<=` is not read as `<`
    const OPS: [(&str, Op); 6] = [
        ("<=", Op::Le),
        (">=", Op::Ge),
        ("==", Op::Eq),
        ("!=", Op::Ne),
        ("<", Op::Lt),
        (">", Op::Gt),
    ];
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    let (pos, token, op) = OPS
        .iter()
        .filter_map(|(token, op)| compact.find(token).map(|pos| (pos, *token, *op)))
        .min_by_key(|(pos, token, _)| (*pos, usize::MAX - token.len()))
        .ok_or_else(|| Error::config(format!("threshold {raw} has no comparison operator")))?;

    let stat = Stat::parse(&compact[..pos])?;
    let limit: f64 = compact[pos + token.len()..]
        .parse()
        .map_err(|_| Error::config(format!("threshold {raw} has a non-numeric limit")))?;
    Ok((stat, op, limit))
}

impl Threshold {
    pub fn parse(metric_expr: &str, condition: &str) -> Result<Self> {
        let (metric, tags) = parse_metric_expr(metric_expr)?;
        if metric.is_empty() {
            return Err(Error::config(format!("threshold {metric_expr} has no metric name")));
        }
        let (stat, op, limit) = parse_condition(condition)?;
        Ok(Self {
            metric,
            tags,
            stat,
            op,
            limit,
            source: format!("{}: {}", metric_expr.trim(), condition.trim()),
        })
    }

    /// Merges every series matching the metric and tag filter, then checks the
    /// statistic of the merged series, the way k6 does across tag sets.
    ///
    /// A metric that recorded nothing passes: there is nothing to violate.
    pub fn evaluate(&self, aggregator: &Aggregator) -> ThresholdResult {
        let (observed, passed) = match aggregator.merged(&self.metric, &self.tags) {
            Ok(None) => (None, true),
            Ok(Some(merged)) => match self.stat.observe(&merged) {
                Some(value) => (Some(value), self.op.holds(value, self.limit)),
                None => {
                    tracing::warn!(
                        "Threshold {} does not apply to {} metric {}",
                        self.source,
                        merged.kind(),
                        self.metric
                    );
                    (None, false)
                }
            },
            Err(e) => {
                tracing::warn!("Threshold {} cannot be evaluated: {e}", self.source);
                (None, false)
            }
        };

        ThresholdResult {
            threshold: self.clone(),
            observed,
            passed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThresholdResult {
    pub threshold: Threshold,
    /// The statistic over all matching series; `None` without data.
    pub observed: Option<f64>,
    pub passed: bool,
}

pub fn evaluate_all(thresholds: &[Threshold], aggregator: &Aggregator) -> Vec<ThresholdResult> {
    thresholds.iter().map(|t| t.evaluate(aggregator)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Sample;

    #[test]
    fn parses_k6_expressions() {
        let t = Threshold::parse("search_latency_ms{type:no-index}", "p(95)<500").unwrap();
        assert_eq!(t.metric, "search_latency_ms");
        assert_eq!(t.tags["type"], "no-index");
        assert_eq!((t.stat, t.op, t.limit), (Stat::P95, Op::Lt, 500.0));

        let t = Threshold::parse("search_success_rate", "rate >= 0.95").unwrap();
        assert_eq!((t.stat, t.op, t.limit), (Stat::Rate, Op::Ge, 0.95));

        let t = Threshold::parse("errors", "count!=0").unwrap();
        assert_eq!((t.stat, t.op), (Stat::Count, Op::Ne));
    }

    #[test]
    fn rejects_malformed_expressions() {
        assert!(Threshold::parse("x", "p(42)<1").is_err());
        assert!(Threshold::parse("x", "avg 1").is_err());
        assert!(Threshold::parse("x", "avg<fast").is_err());
        assert!(Threshold::parse("x{type", "avg<1").is_err());
        assert!(Threshold::parse("x{type}", "avg<1").is_err());
        assert!(Threshold::parse("{type:a}", "avg<1").is_err());
    }

    #[test]
    fn evaluates_against_matching_series_only() {
        let agg = Aggregator::new();
        for v in [100.0, 200.0, 300.0] {
            agg.record(Sample::trend("latency", v).with_tag("type", "with-index"))
                .unwrap();
        }
        agg.record(Sample::trend("latency", 5_000.0).with_tag("type", "no-index"))
            .unwrap();

        let fast = Threshold::parse("latency{type:with-index}", "max<500").unwrap();
        assert!(fast.evaluate(&agg).passed);

        let all = Threshold::parse("latency", "max<500").unwrap();
        let result = all.evaluate(&agg);
        assert!(!result.passed);
        assert_eq!(result.observed, Some(5_000.0));
    }

    #[test]
    fn rate_and_count_thresholds() {
        let agg = Aggregator::new();
        for ok in [true, true, true, false] {
            agg.record(Sample::rate("success", ok)).unwrap();
        }
        agg.record(Sample::counter("errors", 1.0)).unwrap();

        let results = evaluate_all(
            &[
                Threshold::parse("success", "rate>0.95").unwrap(),
                Threshold::parse("success", "rate>=0.75").unwrap(),
                Threshold::parse("errors", "count<1").unwrap(),
                Threshold::parse("missing", "count<1").unwrap(),
            ],
            &agg,
        );
        let passed: Vec<bool> = results.iter().map(|r| r.passed).collect();
        assert_eq!(passed, [false, true, false, true]);
        assert_eq!(results[3].observed, None);
    }

    #[test]
    fn rate_spans_status_tags() {
        let agg = Aggregator::new();
        for _ in 0..999 {
            agg.record(Sample::rate("search_success", true).with_tag("status", "200"))
                .unwrap();
        }
        agg.record(Sample::rate("search_success", false).with_tag("status", "500"))
            .unwrap();

        let result = Threshold::parse("search_success", "rate>0.95").unwrap().evaluate(&agg);
        assert!(result.passed);
        assert_eq!(result.observed, Some(0.999));

        let failed_only = Threshold::parse("search_success{status:500}", "rate>0.95").unwrap();
        assert!(!failed_only.evaluate(&agg).passed);
    }

    #[test]
    fn percentiles_span_status_tags() {
        let agg = Aggregator::new();
        for i in 0..97 {
            agg.record(Sample::trend("search_latency", 100.0 + i as f64).with_tag("status", "200"))
                .unwrap();
        }
        for _ in 0..3 {
            agg.record(Sample::trend("search_latency", 2_000.0).with_tag("status", "500"))
                .unwrap();
        }

        let result = Threshold::parse("search_latency", "p(95)<500").unwrap().evaluate(&agg);
        assert!(result.passed, "{:?}", result.observed);
        let p99 = Threshold::parse("search_latency", "p(99)<500").unwrap().evaluate(&agg);
        assert!(!p99.passed);
    }

    #[test]
    fn stat_that_does_not_apply_fails() {
        let agg = Aggregator::new();
        agg.record(Sample::counter("errors", 1.0)).unwrap();
        let t = Threshold::parse("errors", "p(95)<1").unwrap();
        assert!(!t.evaluate(&agg).passed);
    }
}
