//! Data-driven HTTP scenario.
//!
//! A [`ScenarioSpec`] is an ordered list of [`Step`]s. Each step issues one
//! request built from a [`RequestTemplate`], checks its status against a
//! [`StatusPredicate`], and may fan out into dependent [`FollowUp`] calls whose
//! variables are extracted from the step's JSON response body.
//!
//! For every call the scenario records:
//! - `http_reqs` (counter), `http_req_duration` (trend, ms), `http_req_success` (rate)
//! - `errors{kind=transport|http_status}` (counter) when the call failed
//! - `<prefix>_latency`, `<prefix>_success`, `<prefix>_errors` when the step sets a metric prefix
//!
//! A response body that cannot feed a follow-up records
//! `unexpected_response_shape{reason=...}` instead of an error.
use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, header::HeaderName};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    collections::BTreeMap,
    time::{Duration, Instant},
};
use url::Url;

use super::{
    CallOutcome, CallRecord, IterationContext, IterationOutcome, Scenario, ScenarioError,
    template::{self, Vars},
};
use crate::{
    config::{RunConfig, duration_str},
    error::{Error, Result},
    metric::{Sample, names},
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpMethod {
    #[default]
    Get,
    Post,
    Put,
    Patch,
    Delete,
    Head,
}

impl From<HttpMethod> for Method {
    fn from(m: HttpMethod) -> Self {
        match m {
            HttpMethod::Get => Method::GET,
            HttpMethod::Post => Method::POST,
            HttpMethod::Put => Method::PUT,
            HttpMethod::Patch => Method::PATCH,
            HttpMethod::Delete => Method::DELETE,
            HttpMethod::Head => Method::HEAD,
        }
    }
}

/// Which status codes count as success. Defaults to any 2xx.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPredicate {
    #[default]
    Success,
    Exact(u16),
    OneOf(Vec<u16>),
    Range { min: u16, max: u16 },
}

impl StatusPredicate {
    pub fn accepts(&self, status: u16) -> bool {
        match self {
            StatusPredicate::Success => (200..300).contains(&status),
            StatusPredicate::Exact(s) => *s == status,
            StatusPredicate::OneOf(list) => list.contains(&status),
            StatusPredicate::Range { min, max } => (*min..=*max).contains(&status),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestTemplate {
    #[serde(default)]
    pub method: HttpMethod,
    /// Path relative to the run's host (`/user/get/{id}`) or an absolute URL.
    pub path: String,
    /// Query parameters, in order; values are templates.
    #[serde(default)]
    pub query: Vec<(String, String)>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// JSON body; every string inside is a template. Sent with `Content-Type: application/json`.
    #[serde(default)]
    pub body: Option<Value>,
    /// Overrides the client-wide request timeout.
    #[serde(default, with = "duration_str::option")]
    pub timeout: Option<Duration>,
}

impl RequestTemplate {
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn post_json(path: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            path: path.into(),
            body: Some(body),
            ..Default::default()
        }
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }
}

/// How dependent calls get their input from a prior response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Extract {
    /// The body must be an array; one call per element carrying `field`,
    /// in response order, with `{field}` bound to the element's value.
    EachItem { field: String },
    /// One call with `{var}` bound to the value at a JSON pointer (`/user/id`).
    Pointer { pointer: String, var: String },
}

/// Why a body could not feed a dependent call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ShapeError {
    InvalidJson,
    NotArray,
    MissingField(String),
    MissingPointer(String),
}

impl ShapeError {
    fn reason(&self) -> &'static str {
        match self {
            ShapeError::InvalidJson => "invalid_json",
            ShapeError::NotArray => "not_array",
            ShapeError::MissingField(_) => "missing_field",
            ShapeError::MissingPointer(_) => "missing_pointer",
        }
    }
}

type Extracted = Vec<std::result::Result<(String, String), ShapeError>>;

impl Extract {
    /// Outer error: the body as a whole has the wrong shape.
    /// Inner errors: individual array elements without the field.
    fn apply(&self, body: &[u8]) -> std::result::Result<Extracted, ShapeError> {
        let json: Value = serde_json::from_slice(body).map_err(|_| ShapeError::InvalidJson)?;
        match self {
            Extract::EachItem { field } => {
                let items = json.as_array().ok_or(ShapeError::NotArray)?;
                Ok(items
                    .iter()
                    .map(|item| {
                        item.get(field)
                            .and_then(template::json_scalar)
                            .map(|v| (field.clone(), v))
                            .ok_or_else(|| ShapeError::MissingField(field.clone()))
                    })
                    .collect())
            }
            Extract::Pointer { pointer, var } => {
                let value = json
                    .pointer(pointer)
                    .and_then(template::json_scalar)
                    .ok_or_else(|| ShapeError::MissingPointer(pointer.clone()))?;
                Ok(vec![Ok((var.clone(), value))])
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FollowUp {
    pub name: String,
    pub extract: Extract,
    pub request: RequestTemplate,
    #[serde(default)]
    pub expect: StatusPredicate,
    #[serde(default)]
    pub metric_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub request: RequestTemplate,
    #[serde(default)]
    pub expect: StatusPredicate,
    /// Emits `<prefix>_latency`, `<prefix>_success` and `<prefix>_errors` for this step.
    #[serde(default)]
    pub metric_prefix: Option<String>,
    #[serde(default)]
    pub follow: Vec<FollowUp>,
}

impl Step {
    pub fn new(name: impl Into<String>, request: RequestTemplate) -> Self {
        Self {
            name: name.into(),
            request,
            expect: StatusPredicate::default(),
            metric_prefix: None,
            follow: Vec::new(),
        }
    }
}

/// A scenario as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    pub name: String,
    /// Finite ordered parameter sets; VU `n` uses set `n mod len`.
    #[serde(default)]
    pub parameters: Vec<BTreeMap<String, String>>,
    pub steps: Vec<Step>,
}

impl ScenarioSpec {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("invalid scenario: {e}")))
    }

    fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::config(format!("scenario {} has no steps", self.name)));
        }
        let templates = self.steps.iter().flat_map(|s| {
            std::iter::once((&s.name, &s.request)).chain(s.follow.iter().map(|f| (&f.name, &f.request)))
        });
        for (name, request) in templates {
            if name.trim().is_empty() {
                return Err(Error::config(format!("scenario {} has an unnamed step", self.name)));
            }
            for header in request.headers.keys() {
                HeaderName::from_bytes(header.as_bytes()).map_err(|e| {
                    Error::config(format!("step {name}: invalid header name {header}: {e}"))
                })?;
            }
        }
        Ok(())
    }
}

/// A rendered request, ready to send.
struct Prepared {
    method: Method,
    url: Url,
    request: RequestBuilder,
}

/// What came back from one call.
struct CallResponse {
    record: CallRecord,
    body: Option<Vec<u8>>,
}

/// Executes a [`ScenarioSpec`] against a target host.
#[derive(Debug, Clone)]
pub struct HttpScenario {
    spec: ScenarioSpec,
    base_url: Url,
    client: Client,
}

impl HttpScenario {
    /// Builds the scenario with a client configured from the run config.
    pub fn new(spec: ScenarioSpec, config: &RunConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .user_agent(concat!("stampede/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Self::with_client(spec, config.host_url()?, client)
    }

    pub fn with_client(spec: ScenarioSpec, base_url: Url, client: Client) -> Result<Self> {
        spec.validate()?;
        Ok(Self {
            spec,
            base_url,
            client,
        })
    }

    pub fn spec(&self) -> &ScenarioSpec {
        &self.spec
    }

    /// Parameter set of `vu_id` plus the `vu` and `iter` built-ins.
    fn vars_for(&self, ctx: &IterationContext) -> Vars {
        let mut vars = Vars::new();
        if !self.spec.parameters.is_empty() {
            let idx = (ctx.vu_id % self.spec.parameters.len() as u64) as usize;
            vars.extend(self.spec.parameters[idx].clone());
        }
        vars.insert("vu".to_string(), ctx.vu_id.to_string());
        vars.insert("iter".to_string(), ctx.iteration.to_string());
        vars
    }

    /// Absolute templates (`https://...`) are used as-is, anything else is
    /// joined to the base URL. Placeholder values never change that choice.
    fn url_for(&self, path: &str, vars: &Vars) -> std::result::Result<Url, ScenarioError> {
        let rendered = template::render_path(path, vars)?;
        let raw = if path.contains("://") {
            rendered
        } else {
            let base = self.base_url.as_str().trim_end_matches('/');
            format!("{base}/{}", rendered.trim_start_matches('/'))
        };
        Url::parse(&raw).map_err(|e| ScenarioError::InvalidUrl {
            url: raw,
            reason: e.to_string(),
        })
    }

    /// Renders a template into a request without sending anything.
    fn prepare(&self, template: &RequestTemplate, vars: &Vars) -> std::result::Result<Prepared, ScenarioError> {
        let url = self.url_for(&template.path, vars)?;
        let method: Method = template.method.into();
        let query = template
            .query
            .iter()
            .map(|(k, v)| Ok((k.clone(), template::render(v, vars)?)))
            .collect::<std::result::Result<Vec<_>, ScenarioError>>()?;

        let mut request = self.client.request(method.clone(), url.clone());
        if !query.is_empty() {
            request = request.query(&query);
        }
        for (name, value) in &template.headers {
            request = request.header(name.as_str(), template::render(value, vars)?);
        }
        if let Some(body) = &template.body {
            request = request.json(&template::render_json(body, vars)?);
        }
        if let Some(timeout) = template.timeout {
            request = request.timeout(timeout);
        }
        Ok(Prepared { method, url, request })
    }

    async fn call(
        &self,
        ctx: &IterationContext,
        step: &str,
        template: &RequestTemplate,
        expect: &StatusPredicate,
        metric_prefix: Option<&str>,
        vars: &Vars,
    ) -> std::result::Result<CallResponse, ScenarioError> {
        let prepared = self.prepare(template, vars)?;
        Ok(self.send(ctx, step, prepared, expect, metric_prefix).await)
    }

    async fn send(
        &self,
        ctx: &IterationContext,
        step: &str,
        prepared: Prepared,
        expect: &StatusPredicate,
        metric_prefix: Option<&str>,
    ) -> CallResponse {
        let Prepared { method, url, request } = prepared;
        let start = Instant::now();
        let response = match request.send().await {
            Ok(resp) => {
                let status = resp.status().as_u16();
                resp.bytes().await.map(|body| (status, body.to_vec()))
            }
            Err(e) => Err(e),
        };
        let duration = start.elapsed();

        let (status, body, outcome) = match response {
            Ok((status, body)) if expect.accepts(status) => (Some(status), Some(body), CallOutcome::Success),
            Ok((status, body)) => (Some(status), Some(body), CallOutcome::UnexpectedStatus { status }),
            Err(e) => {
                let reason = if e.is_timeout() {
                    "timeout"
                } else if e.is_connect() {
                    "connect"
                } else {
                    "request"
                };
                tracing::debug!("VU {} step {step} transport error: {e}", ctx.vu_id);
                (None, None, CallOutcome::Transport { reason: reason.to_string() })
            }
        };

        let record = CallRecord {
            step: step.to_string(),
            method: method.to_string(),
            url: url.to_string(),
            status,
            duration,
            outcome,
        };
        self.record_call(ctx, &record, metric_prefix);
        CallResponse { record, body }
    }

    fn record_call(&self, ctx: &IterationContext, call: &CallRecord, metric_prefix: Option<&str>) {
        let ok = call.outcome.is_success();
        let millis = call.duration.as_secs_f64() * 1_000.0;
        let status = call.status.unwrap_or(0).to_string();
        let tagged = |s: Sample| {
            s.with_tag("step", call.step.as_str())
                .with_tag("method", call.method.as_str())
                .with_tag("status", status.as_str())
        };
        let rec = &ctx.recorder;

        rec.record(tagged(Sample::counter(names::HTTP_REQS, 1.0)));
        rec.record(tagged(Sample::trend(names::HTTP_REQ_DURATION, millis)));
        rec.record(tagged(Sample::rate(names::HTTP_REQ_SUCCESS, ok)));

        let failure = match &call.outcome {
            CallOutcome::Success => None,
            CallOutcome::UnexpectedStatus { .. } => Some(("http_status", None)),
            CallOutcome::Transport { reason } => Some(("transport", Some(reason.as_str()))),
        };
        if let Some((kind, reason)) = failure {
            let mut error = tagged(Sample::counter(names::ERRORS, 1.0)).with_tag("kind", kind);
            if let Some(reason) = reason {
                error = error.with_tag("reason", reason);
            }
            rec.record(error);
        }

        if let Some(prefix) = metric_prefix {
            rec.record(tagged(Sample::trend(format!("{prefix}_latency"), millis)));
            rec.record(tagged(Sample::rate(format!("{prefix}_success"), ok)));
            if !ok {
                rec.record(tagged(Sample::counter(format!("{prefix}_errors"), 1.0)));
            }
        }
    }

    fn record_shape(&self, ctx: &IterationContext, step: &str, follow: &str, error: &ShapeError) {
        tracing::debug!(
            "VU {} step {step}: response cannot feed {follow}: {error:?}",
            ctx.vu_id
        );
        ctx.recorder.record(
            Sample::counter(names::UNEXPECTED_RESPONSE_SHAPE, 1.0)
                .with_tag("step", step)
                .with_tag("follow", follow)
                .with_tag("reason", error.reason()),
        );
    }

    async fn run_follow_up(
        &self,
        ctx: &IterationContext,
        step: &Step,
        follow: &FollowUp,
        body: &[u8],
        vars: &Vars,
        outcome: &mut IterationOutcome,
    ) {
        let extracted = match follow.extract.apply(body) {
            Ok(extracted) => extracted,
            Err(shape) => {
                self.record_shape(ctx, &step.name, &follow.name, &shape);
                outcome.unexpected_shapes += 1;
                outcome
                    .skipped
                    .push(format!("{}: {} body {}", follow.name, step.name, shape.reason()));
                return;
            }
        };

        for item in extracted {
            let (var, value) = match item {
                Ok(binding) => binding,
                Err(shape) => {
                    self.record_shape(ctx, &step.name, &follow.name, &shape);
                    outcome.unexpected_shapes += 1;
                    outcome
                        .skipped
                        .push(format!("{}: element {}", follow.name, shape.reason()));
                    continue;
                }
            };
            let mut vars = vars.clone();
            vars.insert(var, value);
            let prepared = match self.prepare(&follow.request, &vars) {
                Ok(prepared) => prepared,
                Err(e) => {
                    tracing::debug!("VU {} cannot build {} request: {e}", ctx.vu_id, follow.name);
                    ctx.recorder.record(
                        Sample::counter(names::ERRORS, 1.0)
                            .with_tag("step", follow.name.as_str())
                            .with_tag("kind", "request_build"),
                    );
                    outcome.skipped.push(format!("{}: {e}", follow.name));
                    continue;
                }
            };
            let response = self
                .send(
                    ctx,
                    &follow.name,
                    prepared,
                    &follow.expect,
                    follow.metric_prefix.as_deref(),
                )
                .await;
            outcome.calls.push(response.record);
        }
    }
}

#[async_trait]
impl Scenario for HttpScenario {
    fn name(&self) -> &str {
        &self.spec.name
    }

    async fn run(&self, ctx: &IterationContext) -> std::result::Result<IterationOutcome, ScenarioError> {
        let vars = self.vars_for(ctx);
        let mut outcome = IterationOutcome::default();

        for step in &self.spec.steps {
            let response = self
                .call(
                    ctx,
                    &step.name,
                    &step.request,
                    &step.expect,
                    step.metric_prefix.as_deref(),
                    &vars,
                )
                .await?;
            let succeeded = response.record.outcome.is_success();
            outcome.calls.push(response.record);

            if step.follow.is_empty() {
                continue;
            }
            let body = match response.body {
                Some(body) if succeeded => body,
                _ => {
                    for follow in &step.follow {
                        outcome
                            .skipped
                            .push(format!("{}: prerequisite {} failed", follow.name, step.name));
                    }
                    continue;
                }
            };
            for follow in &step.follow {
                self.run_follow_up(ctx, step, follow, &body, &vars, &mut outcome)
                    .await;
            }
        }
        Ok(outcome)
    }

    /// Any HTTP answer from the host counts as reachable, whatever the status.
    async fn probe(&self) -> Result<()> {
        match self
            .client
            .get(self.base_url.clone())
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => {
                tracing::info!("Target {} answered probe with {}", self.base_url, resp.status());
                Ok(())
            }
            Err(e) => Err(Error::unreachable(self.base_url.as_str(), e)),
        }
    }
}
