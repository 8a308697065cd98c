use std::{fmt, path::PathBuf, time::Duration};

use serde::Serialize;
use thiserror::Error;

use crate::{
    nodes::{NodeHandle, NodeKind, ReadinessState},
    roundtrip::RoundTripOutcome,
};

/// Step of a scenario run at which a failure happened.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScenarioStage {
    Setup,
    Introducer,
    Launch,
    Readiness,
    RoundTrip,
    Deadline,
}

impl fmt::Display for ScenarioStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Setup => "setup",
            Self::Introducer => "introducer",
            Self::Launch => "launch",
            Self::Readiness => "readiness",
            Self::RoundTrip => "round-trip",
            Self::Deadline => "deadline",
        })
    }
}

/// Per-node summary taken just before teardown.
#[derive(Clone, Debug, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub kind: NodeKind,
    pub web_port: u16,
    pub state: ReadinessState,
    pub dir: PathBuf,
}

impl NodeReport {
    pub(crate) fn from_handle(handle: &NodeHandle) -> Self {
        Self {
            name: handle.name().to_owned(),
            kind: handle.kind(),
            web_port: handle.ports().web,
            state: handle.state(),
            dir: handle.dir().to_path_buf(),
        }
    }
}

#[derive(Debug, Error)]
#[error("scenario '{scenario}' failed at {stage}: {message}")]
pub struct ScenarioFailed {
    pub scenario: String,
    pub stage: ScenarioStage,
    pub message: String,
}

/// Outcome of one scenario run, as handed to reporters.
#[derive(Clone, Debug, Serialize)]
pub struct ScenarioResult {
    pub scenario: String,
    pub passed: bool,
    pub failed_stage: Option<ScenarioStage>,
    pub error: Option<String>,
    pub diagnostics: Option<String>,
    pub nodes: Vec<NodeReport>,
    pub round_trips: Vec<RoundTripOutcome>,
    /// Set when the working directory was kept for inspection.
    pub work_dir: Option<PathBuf>,
    #[serde(serialize_with = "serialize_millis")]
    pub elapsed: Duration,
}

impl ScenarioResult {
    pub fn ensure_passed(&self) -> Result<(), ScenarioFailed> {
        if self.passed {
            return Ok(());
        }
        Err(ScenarioFailed {
            scenario: self.scenario.clone(),
            stage: self.failed_stage.unwrap_or(ScenarioStage::Setup),
            message: self.error.clone().unwrap_or_default(),
        })
    }
}

fn serialize_millis<S: serde::Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failed() -> ScenarioResult {
        ScenarioResult {
            scenario: "onion-service-storage".into(),
            passed: false,
            failed_stage: Some(ScenarioStage::Readiness),
            error: Some("node 'carol' did not become ready".into()),
            diagnostics: Some("[stderr] tor bootstrap 10%".into()),
            nodes: Vec::new(),
            round_trips: Vec::new(),
            work_dir: Some(PathBuf::from("/tmp/grid-scenario-x")),
            elapsed: Duration::from_millis(1500),
        }
    }

    #[test]
    fn json_shape_for_reporters() {
        let value = serde_json::to_value(failed()).unwrap();
        assert_eq!(value["passed"], false);
        assert_eq!(value["failed_stage"], "readiness");
        assert_eq!(value["elapsed"], 1500);
        assert_eq!(value["work_dir"], "/tmp/grid-scenario-x");
    }

    #[test]
    fn ensure_passed_reports_stage() {
        let err = failed().ensure_passed().unwrap_err();
        assert_eq!(err.stage, ScenarioStage::Readiness);
        assert!(err.to_string().contains("failed at readiness"));
    }
}
