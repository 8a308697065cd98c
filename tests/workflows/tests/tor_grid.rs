//! End-to-end runs against a real `tahoe` and a running Chutney Tor network.
//!
//! `GRID_TOR_CONTROL_PORT` selects the Tor client used by introducers, and
//! `GRID_TAHOE_BIN` the node executable.

use anyhow::Result;
use grid_testing_core::{
    constants::OBJECT_CAPABILITY_TEXT,
    scenario::{ScenarioBuilder, ScenarioDriver},
};
use grid_tests_workflows::init_tracing;
use serial_test::serial;

#[tokio::test]
#[serial]
#[ignore = "requires tahoe and a running Chutney network"]
async fn onion_service_storage() -> Result<()> {
    init_tracing();
    let scenario = ScenarioBuilder::onion_service_storage().build()?;

    let result = ScenarioDriver::from_env().run(&scenario).await;

    result.ensure_passed()?;
    assert_eq!(result.round_trips.len(), 2);
    Ok(())
}

#[tokio::test]
#[serial]
#[ignore = "requires tahoe and a running Chutney network"]
async fn anonymous_client() -> Result<()> {
    init_tracing();
    let scenario = ScenarioBuilder::anonymous_client()
        .with_content(format!(
            "{OBJECT_CAPABILITY_TEXT} A capability describes a transferable right to perform \
             one (or more) operations on a given object."
        ))
        .build()?;

    let result = ScenarioDriver::from_env().run(&scenario).await;

    result.ensure_passed()?;
    Ok(())
}
