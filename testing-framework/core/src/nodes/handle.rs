use std::{
    path::{Path, PathBuf},
    process::ExitStatus,
    sync::Arc,
    time::Duration,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use super::{NodeKind, NodePorts, status::StatusSource};
use crate::{
    process::{DaemonError, DaemonHandle},
    readiness::{self, ReadinessCriterion, ReadinessError, ReadinessOutcome},
};

/// Last known readiness of a launched node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    NotReady,
    Ready,
    Failed,
}

#[derive(Debug, Error)]
pub enum NodeReadyError {
    #[error("node '{node}' did not become ready: {source}")]
    Readiness {
        node: String,
        #[source]
        source: ReadinessError,
        output: String,
    },
    #[error("node '{node}' exited with {status} before becoming ready")]
    DaemonExited {
        node: String,
        status: ExitStatus,
        output: String,
    },
    #[error("node '{node}' daemon could not be awaited: {source}")]
    Daemon {
        node: String,
        #[source]
        source: DaemonError,
    },
    #[error("node '{node}' already failed its readiness check")]
    AlreadyFailed { node: String },
}

impl NodeReadyError {
    /// Tail of the daemon's output captured when the error was raised.
    #[must_use]
    pub fn output(&self) -> Option<&str> {
        match self {
            Self::Readiness { output, .. } | Self::DaemonExited { output, .. } => Some(output),
            Self::Daemon { .. } | Self::AlreadyFailed { .. } => None,
        }
    }
}

/// A running node daemon plus the status source used to judge readiness.
pub struct NodeHandle {
    name: String,
    kind: NodeKind,
    dir: PathBuf,
    ports: NodePorts,
    daemon: DaemonHandle,
    status: Arc<dyn StatusSource>,
    state: ReadinessState,
}

enum ReadyRace {
    Gate(Result<ReadinessOutcome, ReadinessError>),
    Exited(Result<ExitStatus, DaemonError>),
}

impl NodeHandle {
    pub(crate) fn new(
        name: String,
        kind: NodeKind,
        dir: PathBuf,
        ports: NodePorts,
        daemon: DaemonHandle,
        status: Arc<dyn StatusSource>,
    ) -> Self {
        Self {
            name,
            kind,
            dir,
            ports,
            daemon,
            status,
            state: ReadinessState::NotReady,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn kind(&self) -> NodeKind {
        self.kind
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub const fn ports(&self) -> &NodePorts {
        &self.ports
    }

    #[must_use]
    pub const fn state(&self) -> ReadinessState {
        self.state
    }

    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state == ReadinessState::Ready
    }

    #[must_use]
    pub fn daemon(&self) -> &DaemonHandle {
        &self.daemon
    }

    #[must_use]
    pub fn output_tail(&self) -> String {
        self.daemon.output().tail_text()
    }

    /// Wait for the node to satisfy `criterion`.
    ///
    /// Once the node is `Ready`, further calls return at once without
    /// querying. A daemon that exits while waiting fails the node.
    pub async fn await_ready(
        &mut self,
        criterion: &ReadinessCriterion,
    ) -> Result<ReadinessOutcome, NodeReadyError> {
        match self.state {
            ReadinessState::Ready => return Ok(ReadinessOutcome::immediate()),
            ReadinessState::Failed => {
                return Err(NodeReadyError::AlreadyFailed {
                    node: self.name.clone(),
                });
            }
            ReadinessState::NotReady => {}
        }

        let status = Arc::clone(&self.status);
        let race = tokio::select! {
            biased;
            gate = readiness::await_ready(status.as_ref(), criterion) => ReadyRace::Gate(gate),
            exit = self.daemon.wait_exit() => ReadyRace::Exited(exit),
        };

        let result = match race {
            ReadyRace::Gate(Ok(outcome)) => Ok(outcome),
            ReadyRace::Gate(Err(source)) => Err(NodeReadyError::Readiness {
                node: self.name.clone(),
                source,
                output: self.output_tail(),
            }),
            ReadyRace::Exited(Ok(status)) => Err(NodeReadyError::DaemonExited {
                node: self.name.clone(),
                status,
                output: self.output_tail(),
            }),
            ReadyRace::Exited(Err(source)) => Err(NodeReadyError::Daemon {
                node: self.name.clone(),
                source,
            }),
        };

        match &result {
            Ok(outcome) => {
                self.state = ReadinessState::Ready;
                info!(
                    node = %self.name,
                    peers = ?outcome.observed_peers,
                    waited_ms = outcome.waited.as_millis(),
                    "node ready"
                );
            }
            Err(err) => {
                self.state = ReadinessState::Failed;
                warn!(node = %self.name, error = %err, "node failed readiness");
            }
        }
        result
    }

    /// Stop the daemon. The node directory is left in place.
    pub async fn shutdown(&mut self, grace: Duration) -> Option<ExitStatus> {
        info!(node = %self.name, "stopping node");
        self.daemon.terminate(grace).await
    }
}
