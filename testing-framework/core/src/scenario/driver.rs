use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use futures::future::{join_all, try_join_all};
use thiserror::Error;
use tokio::time::{Instant, timeout};
use tracing::{error, info, warn};

use super::{
    definition::{IntroducerSource, Scenario},
    result::{NodeReport, ScenarioResult, ScenarioStage},
};
use crate::{
    adjust_timeout,
    constants::{DAEMON_TERMINATE_GRACE, readiness_poll_interval},
    nodes::{
        HttpStatusFactory, IntroducerError, IntroducerHandle, NodeEnvironment, NodeHandle,
        NodeOrchestrator, NodeReadyError, SpawnNodeError, StatusSourceFactory, create_tempdir,
        introducer::launch_introducer, persist_tempdir, should_persist_tempdir,
    },
    process::TahoeCommand,
    readiness::ReadinessCriterion,
    roundtrip::{CapabilityRoundTrip, RoundTripError, RoundTripOutcome},
};

const SCRATCH_DIR: &str = "scratch";

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("failed to create scenario directory: {0}")]
    WorkDir(#[source] io::Error),
    #[error(transparent)]
    Introducer(#[from] IntroducerError),
    #[error(transparent)]
    Launch(#[from] SpawnNodeError),
    #[error(transparent)]
    Readiness(#[from] NodeReadyError),
    #[error("node '{name}' is not part of the deployment")]
    MissingNode { name: String },
    #[error("round trip {upload} -> {download} failed: {source}")]
    RoundTrip {
        upload: String,
        download: String,
        #[source]
        source: RoundTripError,
    },
    #[error("scenario did not finish within {limit:?}")]
    Deadline { limit: Duration },
}

impl ScenarioError {
    #[must_use]
    pub const fn stage(&self) -> ScenarioStage {
        match self {
            Self::WorkDir(_) => ScenarioStage::Setup,
            Self::Introducer(_) => ScenarioStage::Introducer,
            Self::Launch(_) => ScenarioStage::Launch,
            Self::Readiness(_) => ScenarioStage::Readiness,
            Self::MissingNode { .. } | Self::RoundTrip { .. } => ScenarioStage::RoundTrip,
            Self::Deadline { .. } => ScenarioStage::Deadline,
        }
    }

    /// Subprocess output or byte dumps attached to the failure.
    #[must_use]
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            Self::Introducer(err) => err.diagnostics(),
            Self::Launch(err) => err.diagnostics(),
            Self::Readiness(err) => err.output().map(str::to_owned),
            Self::RoundTrip { source, .. } => source.diagnostics(),
            Self::WorkDir(_) | Self::MissingNode { .. } | Self::Deadline { .. } => None,
        }
    }
}

/// Everything a scenario has started. Stopped as a unit by
/// [`Deployment::teardown`]; dropping it kills any remaining daemons.
#[derive(Default)]
pub struct Deployment {
    introducer: Option<IntroducerHandle>,
    nodes: Vec<NodeHandle>,
}

impl Deployment {
    #[must_use]
    pub fn nodes(&self) -> &[NodeHandle] {
        &self.nodes
    }

    #[must_use]
    pub const fn introducer(&self) -> Option<&IntroducerHandle> {
        self.introducer.as_ref()
    }

    #[must_use]
    pub fn node(&self, name: &str) -> Option<&NodeHandle> {
        self.nodes.iter().find(|node| node.name() == name)
    }

    /// Stop every node, then the introducer.
    pub async fn teardown(&mut self) {
        let grace = adjust_timeout(DAEMON_TERMINATE_GRACE);
        join_all(self.nodes.iter_mut().map(|node| node.shutdown(grace))).await;
        if let Some(introducer) = self.introducer.as_mut() {
            introducer.shutdown(grace).await;
        }
    }
}

/// Runs scenarios against the node CLI.
pub struct ScenarioDriver {
    tahoe: TahoeCommand,
    status: Arc<dyn StatusSourceFactory>,
}

impl ScenarioDriver {
    #[must_use]
    pub fn new(tahoe: TahoeCommand) -> Self {
        Self {
            tahoe,
            status: Arc::new(HttpStatusFactory),
        }
    }

    /// Driver using the node executable resolved from the environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::new(TahoeCommand::resolve())
    }

    #[must_use]
    pub fn with_status_factory(mut self, status: Arc<dyn StatusSourceFactory>) -> Self {
        self.status = status;
        self
    }

    /// Run `scenario` to completion. Every daemon started is stopped before
    /// this returns, whatever the outcome.
    pub async fn run(&self, scenario: &Scenario) -> ScenarioResult {
        let started = Instant::now();
        info!(scenario = scenario.name(), nodes = scenario.nodes().len(), "scenario starting");

        let root = match create_tempdir() {
            Ok(root) => root,
            Err(source) => {
                let err = ScenarioError::WorkDir(source);
                error!(scenario = scenario.name(), error = %err, "scenario setup failed");
                return failure(scenario, &err, Vec::new(), None, started.elapsed());
            }
        };

        let mut deployment = Deployment::default();
        let execution = self.execute(scenario, root.path(), &mut deployment);
        let outcome = match scenario.deadline() {
            Some(limit) => timeout(limit, execution)
                .await
                .unwrap_or(Err(ScenarioError::Deadline { limit })),
            None => execution.await,
        };

        let nodes = deployment.nodes().iter().map(NodeReport::from_handle).collect();
        deployment.teardown().await;

        let keep = scenario.keep_workdir() || should_persist_tempdir() || outcome.is_err();
        let work_dir = keep.then(|| persist_tempdir(root, scenario.name()));
        let elapsed = started.elapsed();

        match outcome {
            Ok(round_trips) => {
                info!(scenario = scenario.name(), elapsed_ms = elapsed.as_millis(), "scenario passed");
                ScenarioResult {
                    scenario: scenario.name().to_owned(),
                    passed: true,
                    failed_stage: None,
                    error: None,
                    diagnostics: None,
                    nodes,
                    round_trips,
                    work_dir,
                    elapsed,
                }
            }
            Err(err) => {
                error!(
                    scenario = scenario.name(),
                    stage = %err.stage(),
                    error = %err,
                    work_dir = ?work_dir,
                    "scenario failed"
                );
                failure(scenario, &err, nodes, work_dir, elapsed)
            }
        }
    }

    async fn execute(
        &self,
        scenario: &Scenario,
        root: &Path,
        deployment: &mut Deployment,
    ) -> Result<Vec<RoundTripOutcome>, ScenarioError> {
        let introducer_furl = match scenario.introducer() {
            IntroducerSource::Existing(furl) => furl.trim().to_owned(),
            IntroducerSource::Launch(spec) => {
                let introducer = launch_introducer(&self.tahoe, root, spec).await?;
                let furl = introducer.furl().to_owned();
                deployment.introducer = Some(introducer);
                furl
            }
        };

        let env = NodeEnvironment {
            tahoe: self.tahoe.clone(),
            root: root.to_path_buf(),
            introducer_furl,
            status: Arc::clone(&self.status),
        };

        // Collect every node that did start so teardown sees it, then report
        // the first failure.
        let launches = join_all(scenario.nodes().iter().map(|spec| {
            let env = &env;
            async move {
                let mut orchestrator = NodeOrchestrator::new(spec.clone());
                let launch = orchestrator.launch(env).await;
                (orchestrator, launch)
            }
        }))
        .await;
        let mut orchestrators = Vec::with_capacity(launches.len());
        let mut first_failure = None;
        for (orchestrator, launch) in launches {
            match launch {
                Ok(handle) => {
                    deployment.nodes.push(handle);
                    orchestrators.push(orchestrator);
                }
                Err(err) => {
                    warn!(error = %err, "node did not launch");
                    if first_failure.is_none() {
                        first_failure = Some(err);
                    }
                }
            }
        }
        if let Some(err) = first_failure {
            return Err(err.into());
        }

        // One deadline for the whole gate; thresholds are per node.
        let deadline = Instant::now() + adjust_timeout(scenario.readiness_timeout());
        let poll_interval = scenario.poll_interval().unwrap_or_else(readiness_poll_interval);
        try_join_all(orchestrators.iter_mut().zip(deployment.nodes.iter_mut()).map(
            |(orchestrator, node)| {
                let min_peers = scenario.min_peers_for(orchestrator.spec());
                let criterion =
                    ReadinessCriterion::new(min_peers, deadline).with_poll_interval(poll_interval);
                async move { orchestrator.await_ready(node, &criterion).await }
            },
        ))
        .await?;
        info!(scenario = scenario.name(), "all nodes ready");

        let trip = CapabilityRoundTrip::new(self.tahoe.clone(), scratch_dir(root));
        let mut outcomes = Vec::with_capacity(scenario.transfers().len());
        for transfer in scenario.transfers() {
            let upload = node(deployment, &transfer.upload)?;
            let download = node(deployment, &transfer.download)?;
            let outcome = trip
                .round_trip(upload, download, scenario.content())
                .await
                .map_err(|source| ScenarioError::RoundTrip {
                    upload: transfer.upload.clone(),
                    download: transfer.download.clone(),
                    source,
                })?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }
}

fn node<'a>(deployment: &'a Deployment, name: &str) -> Result<&'a NodeHandle, ScenarioError> {
    deployment.node(name).ok_or_else(|| ScenarioError::MissingNode {
        name: name.to_owned(),
    })
}

fn scratch_dir(root: &Path) -> PathBuf {
    root.join(SCRATCH_DIR)
}

fn failure(
    scenario: &Scenario,
    err: &ScenarioError,
    nodes: Vec<NodeReport>,
    work_dir: Option<PathBuf>,
    elapsed: Duration,
) -> ScenarioResult {
    ScenarioResult {
        scenario: scenario.name().to_owned(),
        passed: false,
        failed_stage: Some(err.stage()),
        error: Some(err.to_string()),
        diagnostics: err.diagnostics(),
        nodes,
        round_trips: Vec::new(),
        work_dir,
        elapsed,
    }
}
