//! 100 VUs registering users for four minutes.
use std::time::Duration;

use serde_json::json;
use stampede::{
    LoadTest, Reporter, RunConfig,
    config::LoadProfile,
    report::StdoutReporter,
    scenario::{RequestTemplate, ScenarioSpec, StatusPredicate, Step},
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> stampede::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = RunConfig::builder()
        .load(LoadProfile::fixed(100, Duration::from_secs(240)))
        .build()
        .apply_env()?;

    let mut register = RequestTemplate::post_json(
        "/user/register",
        json!({
            "first_name": "User_{vu}",
            "second_name": "Last_{iter}",
            "birthdate": "1990-01-01",
            "biography": "write (/user/register) test",
            "city": "Saratov",
            "password": "$2a$12$XH4BS2zgGgpJs4hiu9p17OwxHxoWto21DLHkzo6JQH67U/3wi.LEW"
        }),
    );
    // registration hashes the password server side and can be very slow under load
    register.timeout = Some(Duration::from_secs(600));

    let spec = ScenarioSpec {
        name: "register".into(),
        parameters: vec![],
        steps: vec![Step {
            expect: StatusPredicate::Exact(200),
            metric_prefix: Some("register".into()),
            ..Step::new("register", register)
        }],
    };

    let outcome = LoadTest::http(config, spec)?.run().await?;
    StdoutReporter.report(&outcome.report()).await?;
    Ok(())
}
