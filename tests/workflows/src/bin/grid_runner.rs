use std::process;

use anyhow::{Context as _, Result};
use grid_testing_core::scenario::{ScenarioDriver, ScenarioResult};
use grid_tests_workflows::{init_tracing, scenario_from_env};
use tracing::{info, warn};

#[tokio::main(flavor = "current_thread")]
async fn main() {
    init_tracing();

    match run().await {
        Ok(result) if result.passed => {}
        Ok(_) => process::exit(1),
        Err(err) => {
            warn!("grid runner failed: {err:#}");
            process::exit(2);
        }
    }
}

async fn run() -> Result<ScenarioResult> {
    let scenario = scenario_from_env()?;
    info!(scenario = scenario.name(), "running scenario");

    let result = ScenarioDriver::from_env().run(&scenario).await;

    let report = serde_json::to_string_pretty(&result).context("serializing scenario result")?;
    println!("{report}");
    Ok(result)
}
