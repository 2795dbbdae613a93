//! Search users, then fetch every hit by id.
use std::{collections::BTreeMap, time::Duration};

use stampede::{
    LoadTest, Reporter, RunConfig,
    config::{LoadProfile, ThinkTime},
    executor::Stage,
    report::{JsonReporter, StdoutReporter},
    scenario::{Extract, FollowUp, RequestTemplate, ScenarioSpec, StatusPredicate, Step},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> stampede::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::builder()
        .load(LoadProfile::stages(vec![
            Stage::new(Duration::from_secs(60), 50),
            Stage::new(Duration::from_secs(180), 200),
            Stage::new(Duration::from_secs(60), 0),
        ]))
        .think_time(ThinkTime::Jittered {
            min: Duration::from_millis(50),
            max: Duration::from_millis(150),
        })
        .build()
        .apply_env()?;

    let spec = ScenarioSpec {
        name: "search_and_get".into(),
        parameters: ["Ив", "Ал", "Сер"]
            .into_iter()
            .map(|prefix| {
                BTreeMap::from([
                    ("first".to_string(), prefix.to_string()),
                    ("second".to_string(), prefix.to_string()),
                ])
            })
            .collect(),
        steps: vec![Step {
            expect: StatusPredicate::Exact(200),
            metric_prefix: Some("search".into()),
            follow: vec![FollowUp {
                name: "get".into(),
                extract: Extract::EachItem { field: "id".into() },
                request: RequestTemplate::get("/user/get/{id}"),
                expect: StatusPredicate::Exact(200),
                metric_prefix: Some("get".into()),
            }],
            ..Step::new(
                "search",
                RequestTemplate::get("/user/search")
                    .with_query("first_name", "{first}")
                    .with_query("last_name", "{second}"),
            )
        }],
    };

    let outcome = LoadTest::http(config, spec)?.run().await?;
    let report = outcome.report();
    StdoutReporter.report(&report).await?;
    if let Ok(path) = std::env::var("REPORT_JSON") {
        JsonReporter::file(path).report(&report).await?;
    }
    Ok(())
}
