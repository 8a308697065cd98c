use std::{
    fmt,
    path::{Path, PathBuf},
    sync::Arc,
};

use thiserror::Error;
use tracing::{debug, info, warn};

use super::{
    NodeHandle, NodeKind, NodePorts, NodeSpec,
    config::{self, ConfigWriteError},
    handle::NodeReadyError,
    status::{StatusError, StatusSourceFactory},
};
use crate::{
    constants::{DEFAULT_INTRODUCER_NAME, ONION_EXTERNAL_PORT, ONION_PRIVATE_KEY_FILE},
    process::{ProcessError, ProcessResult, TahoeCommand, run, spawn_daemon},
    readiness::{ReadinessCriterion, ReadinessOutcome},
};

/// Lifecycle of one node from spec to readiness.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeStage {
    Uninitialized,
    Configuring,
    Launching,
    AwaitingReadiness,
    Ready,
    Failed,
}

impl fmt::Display for NodeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Uninitialized => "uninitialized",
            Self::Configuring => "configuring",
            Self::Launching => "launching",
            Self::AwaitingReadiness => "awaiting-readiness",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum SpawnNodeError {
    #[error("node '{node}' cannot be launched from stage {stage}")]
    InvalidStage { node: String, stage: NodeStage },
    #[error("node '{node}': port base {base} leaves no room for derived ports")]
    Ports { node: String, base: u16 },
    #[error("node '{node}': invalid share encoding")]
    Shares { node: String },
    #[error("node '{node}': failed to prepare {path}: {source}")]
    WorkDir {
        node: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("node '{node}': create-node could not be started: {source}")]
    CreateLaunch {
        node: String,
        #[source]
        source: ProcessError,
    },
    #[error("node '{node}': create-node failed ({})", result.status())]
    CreateFailed {
        node: String,
        result: Box<ProcessResult>,
    },
    #[error("node '{node}': configuration failed: {source}")]
    Configure {
        node: String,
        #[source]
        source: ConfigWriteError,
    },
    #[error("node '{node}': daemon could not be started: {source}")]
    Launch {
        node: String,
        #[source]
        source: ProcessError,
    },
    #[error("node '{node}': no status source: {source}")]
    Status {
        node: String,
        #[source]
        source: StatusError,
    },
}

impl SpawnNodeError {
    /// Captured output relevant to the failure, if any.
    #[must_use]
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            Self::CreateFailed { result, .. } => Some(result.diagnostics()),
            _ => None,
        }
    }
}

/// Shared inputs for launching nodes within one scenario.
#[derive(Clone)]
pub struct NodeEnvironment {
    pub tahoe: TahoeCommand,
    /// Parent of every node directory.
    pub root: PathBuf,
    pub introducer_furl: String,
    pub status: Arc<dyn StatusSourceFactory>,
}

impl NodeEnvironment {
    #[must_use]
    pub fn node_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Drives a single [`NodeSpec`] through creation, configuration and launch.
pub struct NodeOrchestrator {
    spec: NodeSpec,
    stage: NodeStage,
}

impl NodeOrchestrator {
    #[must_use]
    pub const fn new(spec: NodeSpec) -> Self {
        Self {
            spec,
            stage: NodeStage::Uninitialized,
        }
    }

    #[must_use]
    pub const fn spec(&self) -> &NodeSpec {
        &self.spec
    }

    #[must_use]
    pub const fn stage(&self) -> NodeStage {
        self.stage
    }

    fn transition(&mut self, next: NodeStage) {
        info!(node = %self.spec.name, from = %self.stage, to = %next, "node stage");
        self.stage = next;
    }

    /// Create, configure and start the node, leaving it in
    /// [`NodeStage::AwaitingReadiness`].
    pub async fn launch(&mut self, env: &NodeEnvironment) -> Result<NodeHandle, SpawnNodeError> {
        if self.stage != NodeStage::Uninitialized {
            return Err(SpawnNodeError::InvalidStage {
                node: self.spec.name.clone(),
                stage: self.stage,
            });
        }
        match self.launch_stages(env).await {
            Ok(handle) => Ok(handle),
            Err(err) => {
                warn!(node = %self.spec.name, error = %err, "node launch failed");
                self.transition(NodeStage::Failed);
                Err(err)
            }
        }
    }

    /// Run the readiness gate for the node this orchestrator launched and
    /// record the outcome as [`NodeStage::Ready`] or [`NodeStage::Failed`].
    pub async fn await_ready(
        &mut self,
        handle: &mut NodeHandle,
        criterion: &ReadinessCriterion,
    ) -> Result<ReadinessOutcome, NodeReadyError> {
        let result = handle.await_ready(criterion).await;
        let next = if result.is_ok() {
            NodeStage::Ready
        } else {
            NodeStage::Failed
        };
        if self.stage != next {
            self.transition(next);
        }
        result
    }

    async fn launch_stages(&mut self, env: &NodeEnvironment) -> Result<NodeHandle, SpawnNodeError> {
        self.transition(NodeStage::Configuring);
        let name = self.spec.name.clone();
        let ports = self.spec.ports().ok_or_else(|| SpawnNodeError::Ports {
            node: name.clone(),
            base: self.spec.port_base,
        })?;
        if !self.spec.shares.is_valid() {
            return Err(SpawnNodeError::Shares { node: name });
        }
        tokio::fs::create_dir_all(&env.root)
            .await
            .map_err(|source| SpawnNodeError::WorkDir {
                node: name.clone(),
                path: env.root.clone(),
                source,
            })?;
        let dir = env.node_dir(&name);
        debug!(node = %name, dir = %dir.display(), ?ports, "derived node layout");

        self.transition(NodeStage::Launching);
        let create = env
            .tahoe
            .command(["create-node"])
            .args(create_node_flags(&self.spec, &ports, &env.introducer_furl))
            .arg(&dir);
        let result = run(&create)
            .await
            .map_err(|source| SpawnNodeError::CreateLaunch {
                node: name.clone(),
                source,
            })?;
        if !result.success() {
            return Err(SpawnNodeError::CreateFailed {
                node: name,
                result: Box::new(result),
            });
        }
        configure_node(&dir, &self.spec, &ports, &env.introducer_furl).map_err(|source| {
            SpawnNodeError::Configure {
                node: name.clone(),
                source,
            }
        })?;

        let daemon = spawn_daemon(name.clone(), &env.tahoe.command(["run"]).arg(&dir))
            .map_err(|source| SpawnNodeError::Launch {
                node: name.clone(),
                source,
            })?;
        let status = env
            .status
            .status_source(&name, &ports)
            .map_err(|source| SpawnNodeError::Status {
                node: name.clone(),
                source,
            })?;
        self.transition(NodeStage::AwaitingReadiness);

        Ok(NodeHandle::new(name, self.spec.kind, dir, ports, daemon, status))
    }
}

/// Flags for `create-node`, excluding the target directory.
#[must_use]
pub fn create_node_flags(spec: &NodeSpec, ports: &NodePorts, introducer_furl: &str) -> Vec<String> {
    let mut flags = vec![
        format!("--nickname={}", spec.name),
        format!("--webport=tcp:{}:interface=localhost", ports.web),
        format!("--introducer={}", introducer_furl.trim()),
        format!("--shares-needed={}", spec.shares.needed),
        format!("--shares-happy={}", spec.shares.happy),
        format!("--shares-total={}", spec.shares.total),
    ];
    if let (NodeKind::Normal, Some(storage)) = (spec.kind, ports.storage) {
        flags.extend([
            "--hostname=localhost".to_owned(),
            format!("--port=tcp:{storage}:interface=localhost"),
            format!("--location=tcp:localhost:{storage}"),
        ]);
    } else {
        let control = spec
            .anonymity
            .map_or(ports.control, |anonymity| anonymity.tor_control_port);
        flags.extend([
            "--hide-ip".to_owned(),
            format!("--tor-control-port=tcp:localhost:{control}"),
            "--listen=tor".to_owned(),
        ]);
    }
    flags
}

fn configure_node(
    dir: &Path,
    spec: &NodeSpec,
    ports: &NodePorts,
    introducer_furl: &str,
) -> Result<(), ConfigWriteError> {
    config::write_introducer_reference(dir, DEFAULT_INTRODUCER_NAME, introducer_furl)?;
    if spec.kind.is_anonymous() {
        let (control, external) = spec.anonymity.map_or(
            (ports.control, ONION_EXTERNAL_PORT),
            |anonymity| (anonymity.tor_control_port, anonymity.onion_external_port),
        );
        config::set_config_value(dir, "tor", "onion", "true")?;
        config::set_config_value(dir, "tor", "onion.external_port", &external.to_string())?;
        config::set_config_value(
            dir,
            "tor",
            "control.port",
            &format!("tcp:port={control}:host=127.0.0.1"),
        )?;
        config::set_config_value(dir, "tor", "onion.private_key_file", ONION_PRIVATE_KEY_FILE)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nodes::{ShareEncoding, status::HttpStatusFactory};

    const FURL: &str = "pb://abc@tor:xyz.onion:3457/introducer";

    #[test]
    fn anonymous_flags_route_through_tor() {
        let spec = NodeSpec::anonymous("carol", 8008);
        let flags = create_node_flags(&spec, &spec.ports().unwrap(), FURL);

        assert_eq!(
            flags,
            [
                "--nickname=carol",
                "--webport=tcp:10008:interface=localhost",
                "--introducer=pb://abc@tor:xyz.onion:3457/introducer",
                "--shares-needed=1",
                "--shares-happy=1",
                "--shares-total=2",
                "--hide-ip",
                "--tor-control-port=tcp:localhost:8008",
                "--listen=tor",
            ]
        );
    }

    #[test]
    fn normal_flags_listen_on_storage_port() {
        let spec = NodeSpec::normal("alice", 9100).with_shares(ShareEncoding {
            needed: 2,
            happy: 3,
            total: 4,
        });
        let flags = create_node_flags(&spec, &spec.ports().unwrap(), &format!("{FURL}\n"));

        assert!(flags.contains(&format!("--introducer={FURL}")));
        assert!(flags.contains(&"--shares-happy=3".to_owned()));
        assert!(flags.contains(&"--port=tcp:10100:interface=localhost".to_owned()));
        assert!(flags.contains(&"--location=tcp:localhost:10100".to_owned()));
        assert!(!flags.iter().any(|f| f == "--hide-ip"));
    }

    #[test]
    fn anonymous_node_gets_tor_section() {
        let dir = tempfile::tempdir().unwrap();
        let spec = NodeSpec::anonymous("dave", 8009);
        configure_node(dir.path(), &spec, &spec.ports().unwrap(), FURL).unwrap();

        let get = |key| config::get_config_value(dir.path(), "tor", key).unwrap();
        assert_eq!(get("onion").as_deref(), Some("true"));
        assert_eq!(get("onion.external_port").as_deref(), Some("3457"));
        assert_eq!(get("control.port").as_deref(), Some("tcp:port=8009:host=127.0.0.1"));
        assert_eq!(get("onion.private_key_file").as_deref(), Some(ONION_PRIVATE_KEY_FILE));

        let introducers = config::read_introducers(dir.path()).unwrap();
        assert_eq!(introducers.introducers[DEFAULT_INTRODUCER_NAME].furl, FURL);
    }

    #[test]
    fn normal_node_has_no_tor_section() {
        let dir = tempfile::tempdir().unwrap();
        let spec = NodeSpec::normal("alice", 9100);
        configure_node(dir.path(), &spec, &spec.ports().unwrap(), FURL).unwrap();

        assert_eq!(config::get_config_value(dir.path(), "tor", "onion").unwrap(), None);
    }

    #[tokio::test]
    async fn failed_launch_moves_to_failed_stage() {
        let root = tempfile::tempdir().unwrap();
        let env = NodeEnvironment {
            tahoe: TahoeCommand::new("grid-tahoe-that-does-not-exist"),
            root: root.path().to_path_buf(),
            introducer_furl: FURL.to_owned(),
            status: Arc::new(HttpStatusFactory),
        };
        let mut orchestrator = NodeOrchestrator::new(NodeSpec::normal("alice", 9100));

        let err = orchestrator.launch(&env).await.err().unwrap();

        assert!(matches!(err, SpawnNodeError::CreateLaunch { .. }));
        assert_eq!(orchestrator.stage(), NodeStage::Failed);
        assert!(matches!(
            orchestrator.launch(&env).await,
            Err(SpawnNodeError::InvalidStage { stage: NodeStage::Failed, .. })
        ));
    }

    #[tokio::test]
    async fn overflowing_port_base_is_rejected_before_launch() {
        let root = tempfile::tempdir().unwrap();
        let env = NodeEnvironment {
            tahoe: TahoeCommand::new("unused"),
            root: root.path().to_path_buf(),
            introducer_furl: FURL.to_owned(),
            status: Arc::new(HttpStatusFactory),
        };
        let mut orchestrator = NodeOrchestrator::new(NodeSpec::normal("alice", 65000));

        assert!(matches!(
            orchestrator.launch(&env).await,
            Err(SpawnNodeError::Ports { base: 65000, .. })
        ));
    }

    #[cfg(unix)]
    mod lifecycle {
        use std::time::Duration;

        use super::*;
        use crate::nodes::{
            NodePorts,
            status::{StatusSource, StatusSourceFactory},
        };

        /// `create-node` makes the directory; `run` idles unless told to exit.
        const FAKE_TAHOE: &str = r#"
cmd="$1"
shift
for last; do :; done
case "$cmd" in
  create-node) mkdir -p "$last/private" ;;
  run)
    [ -n "$EXIT_ON_RUN" ] && exit 3
    exec sleep 600 ;;
esac
"#;

        struct Peers(usize);

        #[async_trait::async_trait]
        impl StatusSource for Peers {
            async fn connected_peers(&self) -> Result<usize, StatusError> {
                Ok(self.0)
            }

            fn describe(&self) -> String {
                format!("peers({})", self.0)
            }
        }

        struct PeersFactory(usize);

        impl StatusSourceFactory for PeersFactory {
            fn status_source(
                &self,
                _node: &str,
                _ports: &NodePorts,
            ) -> Result<Arc<dyn StatusSource>, StatusError> {
                Ok(Arc::new(Peers(self.0)))
            }
        }

        fn environment(root: &Path, peers: usize, vars: &[&str]) -> NodeEnvironment {
            let script = root.join("tahoe.sh");
            std::fs::write(&script, FAKE_TAHOE).unwrap();
            NodeEnvironment {
                tahoe: TahoeCommand::new("env")
                    .with_prefix_args(vars)
                    .with_prefix_args([PathBuf::from("sh"), script]),
                root: root.join("nodes"),
                introducer_furl: FURL.to_owned(),
                status: Arc::new(PeersFactory(peers)),
            }
        }

        fn criterion(min_peers: usize, timeout: Duration) -> ReadinessCriterion {
            ReadinessCriterion::within(min_peers, timeout).with_poll_interval(Duration::from_millis(20))
        }

        #[tokio::test]
        async fn connected_node_reaches_ready_stage() {
            let root = tempfile::tempdir().unwrap();
            let env = environment(root.path(), 2, &[]);
            let mut orchestrator = NodeOrchestrator::new(NodeSpec::anonymous("carol", 8008));

            let mut handle = orchestrator.launch(&env).await.unwrap();
            assert_eq!(orchestrator.stage(), NodeStage::AwaitingReadiness);

            let outcome = orchestrator
                .await_ready(&mut handle, &criterion(2, Duration::from_secs(10)))
                .await
                .unwrap();

            assert_eq!(outcome.observed_peers, Some(2));
            assert_eq!(orchestrator.stage(), NodeStage::Ready);
            assert!(handle.is_ready());
            handle.shutdown(Duration::from_secs(5)).await;
        }

        #[tokio::test]
        async fn unmet_threshold_moves_node_to_failed_stage() {
            let root = tempfile::tempdir().unwrap();
            let env = environment(root.path(), 1, &[]);
            let mut orchestrator = NodeOrchestrator::new(NodeSpec::anonymous("carol", 8008));
            let mut handle = orchestrator.launch(&env).await.unwrap();

            let err = orchestrator
                .await_ready(&mut handle, &criterion(2, Duration::from_millis(200)))
                .await
                .unwrap_err();

            assert!(matches!(err, NodeReadyError::Readiness { .. }));
            assert_eq!(orchestrator.stage(), NodeStage::Failed);
            handle.shutdown(Duration::from_secs(5)).await;
        }

        #[tokio::test]
        async fn exited_daemon_moves_node_to_failed_stage() {
            let root = tempfile::tempdir().unwrap();
            let env = environment(root.path(), 0, &["EXIT_ON_RUN=1"]);
            let mut orchestrator = NodeOrchestrator::new(NodeSpec::normal("alice", 9100));
            let mut handle = orchestrator.launch(&env).await.unwrap();

            let err = orchestrator
                .await_ready(&mut handle, &criterion(2, Duration::from_secs(30)))
                .await
                .unwrap_err();

            assert!(matches!(err, NodeReadyError::DaemonExited { .. }));
            assert_eq!(orchestrator.stage(), NodeStage::Failed);
        }
    }
}
