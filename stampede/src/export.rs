//! Prometheus remote-write exporter.
//!
//! Every interval the exporter snapshots the aggregator, flattens each series
//! into gauge-like time series (`<name>_p95`, `<name>_rate`, `<name>_total`, ...)
//! and pushes them as a snappy-compressed protobuf `WriteRequest`. Values are
//! cumulative, so a failed push loses nothing: the next one carries the full state.
use prost::Message;
use reqwest::{Client, header};
use serde::Serialize;
use std::{
    collections::BTreeMap,
    sync::Arc,
    time::{Duration, UNIX_EPOCH},
};
use tokio::{sync::watch::Receiver, task::JoinHandle, time::MissedTickBehavior};
use url::Url;

use crate::{
    aggregate::Aggregator,
    config::RemoteWriteConfig,
    error::{Error, Result},
    summary::{RunSummary, SeriesSnapshot, SeriesSummary},
};

/// Wire types of the remote-write 0.1.0 protocol (`prometheus/prompb`).
pub mod proto {
    #[derive(Clone, PartialEq, prost::Message)]
    pub struct WriteRequest {
        #[prost(message, repeated, tag = "1")]
        pub timeseries: Vec<TimeSeries>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct TimeSeries {
        /// Sorted by name, `__name__` included.
        #[prost(message, repeated, tag = "1")]
        pub labels: Vec<Label>,
        #[prost(message, repeated, tag = "2")]
        pub samples: Vec<Sample>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Label {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub value: String,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Sample {
        #[prost(double, tag = "1")]
        pub value: f64,
        /// Milliseconds since the Unix epoch.
        #[prost(int64, tag = "2")]
        pub timestamp: i64,
    }
}

use proto::{Label, TimeSeries, WriteRequest};

const REMOTE_WRITE_VERSION: &str = "0.1.0";

/// Replaces characters Prometheus does not accept in names with `_`.
fn sanitize(raw: &str, allow_colon: bool) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || (allow_colon && c == ':') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if out.is_empty() || out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn flatten(series: &SeriesSnapshot) -> Vec<(&'static str, f64)> {
    match &series.value {
        SeriesSummary::Trend(t) => vec![
            ("count", t.count as f64),
            ("sum", t.sum),
            ("min", t.min),
            ("max", t.max),
            ("avg", t.avg),
            ("p50", t.p50),
            ("p90", t.p90),
            ("p95", t.p95),
            ("p99", t.p99),
        ],
        SeriesSummary::Rate(r) => vec![
            ("rate", r.rate),
            ("passes", r.passes as f64),
            ("total", r.total as f64),
        ],
        SeriesSummary::Counter(c) => vec![("total", c.total)],
    }
}

/// Label set of a series. Names are sanitized; a name that collides with an
/// earlier one or uses the reserved `__` prefix is dropped, since Prometheus
/// rejects the whole write otherwise.
fn labels_for(series: &SeriesSnapshot) -> Vec<Label> {
    let mut labels: BTreeMap<String, &str> = BTreeMap::new();
    for (key, value) in &series.key.tags {
        let name = sanitize(key, false);
        if name.starts_with("__") || labels.contains_key(&name) {
            tracing::debug!("Dropping tag {key} of {}: label {name} is reserved or taken", series.key);
            continue;
        }
        labels.insert(name, value);
    }
    labels
        .into_iter()
        .map(|(name, value)| Label {
            name,
            value: value.to_string(),
        })
        .collect()
}

/// Flattens a snapshot into remote-write time series, one sample each.
pub fn encode(summary: &RunSummary) -> WriteRequest {
    let timestamp = summary
        .captured_at
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default();

    let timeseries = summary
        .series
        .iter()
        .flat_map(|series| {
            let name = sanitize(&series.key.name, true);
            let tags = labels_for(series);

            flatten(series).into_iter().map(move |(suffix, value)| {
                let mut labels = tags.clone();
                labels.push(Label {
                    name: "__name__".to_string(),
                    value: format!("{name}_{suffix}"),
                });
                labels.sort_by(|a, b| a.name.cmp(&b.name));
                TimeSeries {
                    labels,
                    samples: vec![proto::Sample { value, timestamp }],
                }
            })
        })
        .collect();

    WriteRequest { timeseries }
}

/// Outcome of an exporter task.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExportStats {
    pub flushes: u64,
    pub failures: u64,
    /// Time series sent by the last successful push.
    pub series_written: u64,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct RemoteWriteExporter {
    url: Url,
    interval: Duration,
    client: Client,
}

impl RemoteWriteExporter {
    pub fn new(config: &RemoteWriteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(concat!("stampede/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            url: config.url.clone(),
            interval: config.interval,
            client,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }

    /// Pushes one snapshot. Returns how many time series were written.
    pub async fn push(&self, summary: &RunSummary) -> Result<usize> {
        let request = encode(summary);
        if request.timeseries.is_empty() {
            return Ok(0);
        }
        let written = request.timeseries.len();
        let body = snap::raw::Encoder::new()
            .compress_vec(&request.encode_to_vec())
            .map_err(|e| Error::export(format!("snappy compression failed: {e}")))?;

        let response = self
            .client
            .post(self.url.clone())
            .header(header::CONTENT_ENCODING, "snappy")
            .header(header::CONTENT_TYPE, "application/x-protobuf")
            .header("X-Prometheus-Remote-Write-Version", REMOTE_WRITE_VERSION)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(Error::export(format!("{} answered {status}: {text}", self.url)));
        }
        Ok(written)
    }

    async fn flush(&self, aggregator: &Aggregator, stats: &mut ExportStats) {
        if aggregator.is_empty() {
            return;
        }
        match self.push(&aggregator.snapshot()).await {
            Ok(written) => {
                stats.flushes += 1;
                stats.series_written = written as u64;
                tracing::debug!("Remote write: {written} series sent to {}", self.url);
            }
            Err(e) => {
                stats.failures += 1;
                tracing::warn!("Remote write to {} failed: {e}", self.url);
                stats.last_error = Some(e.to_string());
            }
        }
    }

    /// Flushes on every interval until `shutdown` fires, then flushes once more.
    pub fn spawn(self, aggregator: Arc<Aggregator>, mut shutdown: Receiver<bool>) -> JoinHandle<ExportStats> {
        tokio::spawn(async move {
            let mut stats = ExportStats::default();
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // the first tick completes immediately
            ticker.tick().await;

            tracing::info!("Exporting to {} every {:?}", self.url, self.interval);
            loop {
                // the watch guard from `wait_for` must not live across the flush
                let stop = tokio::select! {
                    _ = ticker.tick() => false,
                    _ = shutdown.wait_for(|b| *b) => true,
                };
                if stop {
                    break;
                }
                self.flush(&aggregator, &mut stats).await;
            }

            self.flush(&aggregator, &mut stats).await;
            tracing::info!(
                "Exporter stopped after {} flushes, {} failures",
                stats.flushes,
                stats.failures
            );
            stats
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metric::Sample;
    use tokio::sync::watch;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{header, method, path},
    };

    fn aggregator() -> Arc<Aggregator> {
        let agg = Arc::new(Aggregator::new());
        for v in [10.0, 20.0, 30.0] {
            agg.record(Sample::trend("search_latency", v).with_tag("test_type", "no-index"))
                .unwrap();
        }
        agg.record(Sample::rate("search_success", true)).unwrap();
        agg.record(Sample::counter("http_reqs", 3.0).with_tag("step-name", "search"))
            .unwrap();
        agg
    }

    fn config(url: &str, interval: Duration) -> RemoteWriteConfig {
        RemoteWriteConfig::builder()
            .url(Url::parse(url).unwrap())
            .interval(interval)
            .timeout(Duration::from_secs(1))
            .build()
    }

    fn names(request: &WriteRequest) -> Vec<String> {
        request
            .timeseries
            .iter()
            .filter_map(|ts| ts.labels.iter().find(|l| l.name == "__name__"))
            .map(|l| l.value.clone())
            .collect()
    }

    #[test]
    fn flattens_each_kind() {
        let request = encode(&aggregator().snapshot());
        let names = names(&request);
        assert_eq!(request.timeseries.len(), 9 + 3 + 1);
        for expected in [
            "search_latency_p95",
            "search_latency_count",
            "search_success_rate",
            "http_reqs_total",
        ] {
            assert!(names.iter().any(|n| n == expected), "{expected} missing in {names:?}");
        }

        let total = request
            .timeseries
            .iter()
            .find(|ts| ts.labels.iter().any(|l| l.value == "http_reqs_total"))
            .unwrap();
        assert_eq!(total.samples[0].value, 3.0);
        assert!(total.samples[0].timestamp > 0);
        // label names are sanitized, values are not
        assert!(total.labels.iter().any(|l| l.name == "step_name" && l.value == "search"));
    }

    #[test]
    fn labels_are_sorted() {
        for ts in encode(&aggregator().snapshot()).timeseries {
            assert!(ts.labels.windows(2).all(|w| w[0].name <= w[1].name));
        }
    }

    #[test]
    fn colliding_and_reserved_labels_are_dropped() {
        let agg = Aggregator::new();
        agg.record(
            Sample::counter("http_reqs", 1.0)
                .with_tag("step-name", "search")
                .with_tag("step_name", "get")
                .with_tag("__name__", "spoofed")
                .with_tag("method", "GET"),
        )
        .unwrap();
        let request = encode(&agg.snapshot());
        let labels: Vec<(&str, &str)> = request.timeseries[0]
            .labels
            .iter()
            .map(|l| (l.name.as_str(), l.value.as_str()))
            .collect();
        // tags iterate in key order, so `step-name` claims the label first
        assert_eq!(
            labels,
            [
                ("__name__", "http_reqs_total"),
                ("method", "GET"),
                ("step_name", "search"),
            ]
        );
    }

    #[test]
    fn sanitizes_names() {
        assert_eq!(sanitize("http.req-duration", true), "http_req_duration");
        assert_eq!(sanitize("ns:metric", true), "ns:metric");
        assert_eq!(sanitize("ns:label", false), "ns_label");
        assert_eq!(sanitize("95th", false), "_95th");
    }

    #[tokio::test]
    async fn pushes_snappy_protobuf() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/write"))
            .and(header("content-encoding", "snappy"))
            .and(header("content-type", "application/x-protobuf"))
            .and(header("x-prometheus-remote-write-version", "0.1.0"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let exporter = RemoteWriteExporter::new(&config(
            &format!("{}/api/v1/write", server.uri()),
            Duration::from_secs(5),
        ))
        .unwrap();
        let written = exporter.push(&aggregator().snapshot()).await.unwrap();
        assert_eq!(written, 13);

        let received = server.received_requests().await.unwrap();
        let raw = snap::raw::Decoder::new()
            .decompress_vec(&received[0].body)
            .unwrap();
        let decoded = WriteRequest::decode(raw.as_slice()).unwrap();
        assert_eq!(decoded.timeseries.len(), 13);
    }

    #[tokio::test]
    async fn rejected_push_is_an_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_string("out of order sample"))
            .mount(&server)
            .await;

        let exporter = RemoteWriteExporter::new(&config(&server.uri(), Duration::from_secs(5))).unwrap();
        let err = exporter.push(&aggregator().snapshot()).await.unwrap_err();
        assert!(matches!(err, Error::Export(msg) if msg.contains("out of order")));
    }

    #[tokio::test]
    async fn final_flush_on_shutdown() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let exporter = RemoteWriteExporter::new(&config(&server.uri(), Duration::from_secs(3_600))).unwrap();
        let (tx, rx) = watch::channel(false);
        let task = exporter.spawn(aggregator(), rx);
        tx.send(true).unwrap();

        let stats = task.await.unwrap();
        assert_eq!((stats.flushes, stats.failures), (1, 0));
        assert_eq!(stats.series_written, 13);
    }

    #[tokio::test]
    async fn unreachable_endpoint_never_touches_the_aggregator() {
        let agg = aggregator();
        let before = agg.snapshot();

        let exporter =
            RemoteWriteExporter::new(&config("http://127.0.0.1:9/write", Duration::from_millis(20))).unwrap();
        let (tx, rx) = watch::channel(false);
        let task = exporter.spawn(agg.clone(), rx);
        tokio::time::sleep(Duration::from_millis(100)).await;
        tx.send(true).unwrap();

        let stats = task.await.unwrap();
        assert!(stats.failures >= 1);
        assert_eq!(stats.flushes, 0);
        assert!(stats.last_error.is_some());
        let after = agg.snapshot();
        assert_eq!(after.series.len(), before.series.len());
        assert_eq!(after.counter_total("http_reqs"), 3.0);
        assert_eq!(after.trend_count("search_latency"), 3);
        assert_eq!(after.rate("search_success"), before.rate("search_success"));
    }
}
