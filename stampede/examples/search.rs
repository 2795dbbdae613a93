//! Ramp from 1 to 1000 VUs searching users by name prefix.
//!
//! ```sh
//! TEST_HOST=localhost:6000 TEST_TYPE=with-index \
//! K6_PROMETHEUS_RW_SERVER_URL=http://localhost:9090/api/v1/write \
//!     cargo run --example search
//! ```
use std::{collections::BTreeMap, time::Duration};

use stampede::{
    LoadTest, Reporter, RunConfig,
    config::{LoadProfile, ThinkTime},
    executor::Stage,
    report::StdoutReporter,
    scenario::{RequestTemplate, ScenarioSpec, StatusPredicate, Step},
};
use tracing_subscriber::EnvFilter;

fn name_prefixes() -> Vec<BTreeMap<String, String>> {
    [("Ив", "Ив"), ("Ал", "Ал"), ("Сер", "Сер")]
        .into_iter()
        .map(|(first, second)| {
            BTreeMap::from([
                ("first".to_string(), first.to_string()),
                ("second".to_string(), second.to_string()),
            ])
        })
        .collect()
}

#[tokio::main]
async fn main() -> stampede::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::builder()
        .load(LoadProfile::stages(vec![
            Stage::new(Duration::from_secs(30), 1),
            Stage::new(Duration::from_secs(60), 10),
            Stage::new(Duration::from_secs(60), 100),
            Stage::new(Duration::from_secs(60), 1000),
            Stage::new(Duration::from_secs(30), 0),
        ]))
        .think_time(ThinkTime::Fixed(Duration::from_millis(100)))
        .thresholds(BTreeMap::from([
            ("search_latency".to_string(), vec!["p(95)<500".to_string()]),
            ("search_success".to_string(), vec!["rate>0.95".to_string()]),
        ]))
        .build()
        .apply_env()?;

    let spec = ScenarioSpec {
        name: "search".into(),
        parameters: name_prefixes(),
        steps: vec![Step {
            expect: StatusPredicate::Exact(200),
            metric_prefix: Some("search".into()),
            ..Step::new(
                "search",
                RequestTemplate::get("/user/search")
                    .with_query("first_name", "{first}")
                    .with_query("last_name", "{second}"),
            )
        }],
    };

    let test = LoadTest::http(config, spec)?;
    let stop = test.stop_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            stop.stop();
        }
    });

    let outcome = test.run().await?;
    StdoutReporter.report(&outcome.report()).await?;
    Ok(())
}
