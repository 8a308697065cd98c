//! Scenario model and driver.

mod definition;
mod driver;
mod result;

pub use definition::{
    ANONYMOUS_CLIENT, IntroducerSource, ONION_SERVICE_STORAGE, Scenario, ScenarioBuildError,
    ScenarioBuilder, Transfer,
};
pub use driver::{Deployment, ScenarioDriver, ScenarioError};
pub use result::{NodeReport, ScenarioFailed, ScenarioResult, ScenarioStage};
