//! Run configuration.
//!
//! A [`RunConfig`] is built once, from JSON (k6-style human durations such as
//! `"30s"` or `"1m"`) or from its typed builder, optionally overlaid with
//! environment overrides, and validated before any VU starts.
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, env, time::Duration};
use typed_builder::TypedBuilder;
use url::Url;

use crate::{
    error::{Error, Result},
    executor::{Stage, StageSchedule},
    metric::Tags,
    threshold::Threshold,
};

/// Environment variable holding the target host.
pub const ENV_TEST_HOST: &str = "TEST_HOST";
/// Environment variable holding the free-form test type tag.
pub const ENV_TEST_TYPE: &str = "TEST_TYPE";
/// Environment variables holding the remote-write endpoint, in lookup order.
pub const ENV_REMOTE_WRITE_URL: [&str; 2] = ["K6_PROMETHEUS_RW_SERVER_URL", "REMOTE_WRITE_URL"];

pub const DEFAULT_HOST: &str = "http://app:6000";
pub const DEFAULT_TEST_TYPE: &str = "unknown";

/// Serde adapter for `Duration` written as a human string (`"1m30s"`).
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer, de::Error};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*d).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(raw.trim()).map_err(D::Error::custom)
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
            match d {
                Some(d) => super::serialize(d, s),
                None => s.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| humantime::parse_duration(raw.trim()).map_err(D::Error::custom))
                .transpose()
        }
    }
}

/// How many VUs run over time.
///
/// Either an explicit stage list or the `{concurrency, duration}` shorthand,
/// which is equivalent to a single flat stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoadProfile {
    Stages {
        #[serde(default)]
        start_target: u64,
        stages: Vec<Stage>,
    },
    Fixed {
        concurrency: u64,
        #[serde(with = "duration_str")]
        duration: Duration,
    },
}

impl LoadProfile {
    pub fn stages(stages: Vec<Stage>) -> Self {
        LoadProfile::Stages {
            start_target: 0,
            stages,
        }
    }

    pub fn fixed(concurrency: u64, duration: Duration) -> Self {
        LoadProfile::Fixed {
            concurrency,
            duration,
        }
    }

    pub fn schedule(&self) -> StageSchedule {
        match self {
            LoadProfile::Stages {
                start_target,
                stages,
            } => StageSchedule::new(*start_target, stages.clone()),
            LoadProfile::Fixed {
                concurrency,
                duration,
            } => StageSchedule::constant(*concurrency, *duration),
        }
    }
}

/// Pause a VU takes between two iterations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinkTime {
    #[default]
    None,
    Fixed(#[serde(with = "duration_str")] Duration),
    /// Uniformly drawn from `[min, max]` on every iteration.
    Jittered {
        #[serde(with = "duration_str")]
        min: Duration,
        #[serde(with = "duration_str")]
        max: Duration,
    },
}

impl ThinkTime {
    pub fn sample(&self) -> Duration {
        match *self {
            ThinkTime::None => Duration::ZERO,
            ThinkTime::Fixed(d) => d,
            ThinkTime::Jittered { min, max } if min >= max => min,
            ThinkTime::Jittered { min, max } => rand::thread_rng().gen_range(min..=max),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct RemoteWriteConfig {
    pub url: Url,
    /// Flush interval, independent of the scheduling tick.
    #[serde(default = "default_flush_interval", with = "duration_str")]
    #[builder(default = default_flush_interval())]
    pub interval: Duration,
    #[serde(default = "default_push_timeout", with = "duration_str")]
    #[builder(default = default_push_timeout())]
    pub timeout: Duration,
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_push_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_test_type() -> String {
    DEFAULT_TEST_TYPE.to_string()
}

fn default_tick() -> Duration {
    Duration::from_secs(1)
}

fn default_graceful_stop() -> Duration {
    Duration::from_secs(30)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_probe() -> bool {
    true
}

/// Everything a run needs besides the scenario itself.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
pub struct RunConfig {
    /// Target host; a missing scheme defaults to `http://`.
    #[serde(default = "default_host")]
    #[builder(default = default_host(), setter(into))]
    pub host: String,
    /// Free-form tag attached to every sample (`no-index`, `with-index`, ...).
    #[serde(default = "default_test_type")]
    #[builder(default = default_test_type(), setter(into))]
    pub test_type: String,
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub remote_write: Option<RemoteWriteConfig>,
    pub load: LoadProfile,
    #[serde(default)]
    #[builder(default)]
    pub think_time: ThinkTime,
    /// Interval at which the pool size is reconciled with the schedule.
    #[serde(default = "default_tick", with = "duration_str")]
    #[builder(default = default_tick())]
    pub tick: Duration,
    /// How long in-flight iterations may run after the last stage or a stop.
    #[serde(default = "default_graceful_stop", with = "duration_str")]
    #[builder(default = default_graceful_stop())]
    pub graceful_stop: Duration,
    #[serde(default = "default_request_timeout", with = "duration_str")]
    #[builder(default = default_request_timeout())]
    pub request_timeout: Duration,
    /// Check that the target answers before starting any VU.
    #[serde(default = "default_probe")]
    #[builder(default = true)]
    pub probe: bool,
    /// `metric{tag:value}` -> conditions such as `p(95)<500` or `rate>0.95`.
    #[serde(default)]
    #[builder(default)]
    pub thresholds: BTreeMap<String, Vec<String>>,
}

impl RunConfig {
    pub fn from_json(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| Error::config(format!("invalid run config: {e}")))
    }

    /// Overlay `TEST_HOST`, `TEST_TYPE` and the remote-write URL from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|key| env::var(key).ok())
    }

    /// Overlay overrides from any key lookup; empty values are ignored.
    pub fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let lookup = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(host) = lookup(ENV_TEST_HOST) {
            self.host = host;
        }
        if let Some(test_type) = lookup(ENV_TEST_TYPE) {
            self.test_type = test_type;
        }
        if let Some(raw) = ENV_REMOTE_WRITE_URL.iter().find_map(|k| lookup(*k)) {
            let url = Url::parse(&raw)
                .map_err(|e| Error::config(format!("invalid remote-write url {raw}: {e}")))?;
            match &mut self.remote_write {
                Some(rw) => rw.url = url,
                None => self.remote_write = Some(RemoteWriteConfig::builder().url(url).build()),
            }
        }
        Ok(self)
    }

    /// The host as a URL, `http://` assumed when no scheme is given.
    pub fn host_url(&self) -> Result<Url> {
        let host = self.host.trim();
        let raw = if host.contains("://") {
            host.to_string()
        } else {
            format!("http://{host}")
        };
        let url = Url::parse(&raw).map_err(|e| Error::config(format!("invalid host {host}: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(Error::config(format!("unsupported scheme in host {host}")));
        }
        Ok(url)
    }

    pub fn schedule(&self) -> StageSchedule {
        self.load.schedule().with_graceful_stop(self.graceful_stop)
    }

    /// Tags attached to every sample of the run.
    pub fn base_tags(&self) -> Tags {
        Tags::from([
            ("host".to_string(), self.host.clone()),
            ("test_type".to_string(), self.test_type.clone()),
        ])
    }

    pub fn parsed_thresholds(&self) -> Result<Vec<Threshold>> {
        self.thresholds
            .iter()
            .flat_map(|(metric, conditions)| conditions.iter().map(move |c| Threshold::parse(metric, c)))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        self.host_url()?;

        if self.test_type.trim().is_empty() {
            return Err(Error::config("test_type must not be empty"));
        }
        if self.tick.is_zero() {
            return Err(Error::config("tick must be greater than zero"));
        }
        if self.request_timeout.is_zero() {
            return Err(Error::config("request_timeout must be greater than zero"));
        }

        match &self.load {
            LoadProfile::Stages { stages, .. } if stages.is_empty() => {
                return Err(Error::config("at least one stage is required"));
            }
            LoadProfile::Fixed { concurrency: 0, .. } => {
                return Err(Error::config("fixed concurrency must be at least 1"));
            }
            _ => {}
        }
        if self.schedule().total_duration().is_zero() {
            return Err(Error::config("total stage duration must be greater than zero"));
        }

        if let ThinkTime::Jittered { min, max } = self.think_time {
            if min > max {
                return Err(Error::config(format!(
                    "think_time min ({min:?}) is greater than max ({max:?})"
                )));
            }
        }

        if let Some(rw) = &self.remote_write {
            if !matches!(rw.url.scheme(), "http" | "https") {
                return Err(Error::config(format!("unsupported remote-write url {}", rw.url)));
            }
            if rw.interval.is_zero() {
                return Err(Error::config("remote-write interval must be greater than zero"));
            }
        }

        self.parsed_thresholds()?;
        Ok(())
    }
}
