pub mod config;
pub mod handle;
pub mod introducer;
pub mod orchestrator;
pub mod status;

use std::{io, path::PathBuf};

use grid_testing_env as tf_env;
use serde::Serialize;
use tempfile::TempDir;
use tracing::debug;

pub use handle::{NodeHandle, NodeReadyError, ReadinessState};
pub use introducer::{IntroducerError, IntroducerHandle, IntroducerListener, IntroducerSpec};
pub use orchestrator::{NodeEnvironment, NodeOrchestrator, NodeStage, SpawnNodeError};
pub use status::{HttpStatusClient, HttpStatusFactory, StatusError, StatusSource, StatusSourceFactory};

use crate::constants::{ONION_EXTERNAL_PORT, STORAGE_PORT_OFFSET, WEB_PORT_OFFSET};

const SCENARIO_DIR_PREFIX: &str = "grid-scenario-";

/// Whether a node publishes itself directly or only through Tor.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Normal,
    Anonymous,
}

impl NodeKind {
    #[must_use]
    pub const fn is_anonymous(self) -> bool {
        matches!(self, Self::Anonymous)
    }
}

/// Ports a node owns, all derived from one base.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct NodePorts {
    /// Tor control port for anonymous nodes; otherwise just the base.
    pub control: u16,
    pub web: u16,
    /// Storage listener; normal nodes only.
    pub storage: Option<u16>,
}

impl NodePorts {
    /// Returns `None` when an offset overflows the port range.
    #[must_use]
    pub fn derive(base: u16, kind: NodeKind) -> Option<Self> {
        let web = base.checked_add(WEB_PORT_OFFSET)?;
        let storage = match kind {
            NodeKind::Normal => Some(base.checked_add(STORAGE_PORT_OFFSET)?),
            NodeKind::Anonymous => None,
        };
        Some(Self {
            control: base,
            web,
            storage,
        })
    }

    /// Ports this node binds locally. The control port of an anonymous node
    /// belongs to the Tor daemon and is shared, so it is not listed.
    pub fn bound(&self) -> impl Iterator<Item = u16> + '_ {
        std::iter::once(self.web).chain(self.storage)
    }
}

/// Erasure coding parameters passed to `create-node`.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct ShareEncoding {
    pub needed: u8,
    pub happy: u8,
    pub total: u8,
}

impl Default for ShareEncoding {
    fn default() -> Self {
        Self {
            needed: 1,
            happy: 1,
            total: 2,
        }
    }
}

impl ShareEncoding {
    /// `1 <= needed <= total` and `1 <= happy <= total`.
    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.total > 0
            && self.needed > 0
            && self.happy > 0
            && self.needed <= self.total
            && self.happy <= self.total
    }
}

/// Onion service settings for an anonymous node.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
pub struct AnonymitySettings {
    pub tor_control_port: u16,
    pub onion_external_port: u16,
}

impl AnonymitySettings {
    #[must_use]
    pub const fn new(tor_control_port: u16) -> Self {
        Self {
            tor_control_port,
            onion_external_port: ONION_EXTERNAL_PORT,
        }
    }
}

/// Everything needed to create and launch one node.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct NodeSpec {
    pub name: String,
    pub kind: NodeKind,
    pub port_base: u16,
    pub shares: ShareEncoding,
    pub anonymity: Option<AnonymitySettings>,
    /// Peers this node must see before it counts as ready. `None` defers to
    /// the scenario.
    pub min_peers: Option<usize>,
}

impl NodeSpec {
    /// Normal node listening on `port_base + 1000` for storage.
    #[must_use]
    pub fn normal(name: impl Into<String>, port_base: u16) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Normal,
            port_base,
            shares: ShareEncoding::default(),
            anonymity: None,
            min_peers: None,
        }
    }

    /// Anonymous node whose base is the Tor control port.
    #[must_use]
    pub fn anonymous(name: impl Into<String>, tor_control_port: u16) -> Self {
        Self {
            name: name.into(),
            kind: NodeKind::Anonymous,
            port_base: tor_control_port,
            shares: ShareEncoding::default(),
            anonymity: Some(AnonymitySettings::new(tor_control_port)),
            min_peers: None,
        }
    }

    #[must_use]
    pub const fn with_shares(mut self, shares: ShareEncoding) -> Self {
        self.shares = shares;
        self
    }

    /// Gate this node on its own peer count. Zero passes the gate as soon as
    /// the daemon is launched.
    #[must_use]
    pub const fn with_min_peers(mut self, min_peers: usize) -> Self {
        self.min_peers = Some(min_peers);
        self
    }

    #[must_use]
    pub fn ports(&self) -> Option<NodePorts> {
        NodePorts::derive(self.port_base, self.kind)
    }
}

/// Create the root directory for one scenario run, under `GRID_WORK_ROOT`
/// when set.
pub fn create_tempdir() -> io::Result<TempDir> {
    let mut builder = tempfile::Builder::new();
    builder.prefix(SCENARIO_DIR_PREFIX);
    match tf_env::grid_work_root() {
        Some(root) => {
            std::fs::create_dir_all(&root)?;
            builder.tempdir_in(root)
        }
        None => builder.tempdir(),
    }
}

#[must_use]
pub fn should_persist_tempdir() -> bool {
    tf_env::grid_tests_keep_tempdir()
}

/// Detach the directory from `TempDir` cleanup and return its path.
pub fn persist_tempdir(dir: TempDir, label: &str) -> PathBuf {
    let path = dir.keep();
    debug!(label, path = %path.display(), "keeping scenario directory");
    path
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normal_node_ports_follow_offsets() {
        let ports = NodePorts::derive(9008, NodeKind::Normal).unwrap();
        assert_eq!(
            ports,
            NodePorts {
                control: 9008,
                web: 11008,
                storage: Some(10008),
            }
        );
        assert_eq!(ports.bound().collect::<Vec<_>>(), vec![11008, 10008]);
    }

    #[test]
    fn anonymous_node_has_no_storage_listener() {
        let spec = NodeSpec::anonymous("carol", 8008);
        let ports = spec.ports().unwrap();
        assert_eq!(ports.web, 10008);
        assert_eq!(ports.storage, None);
        assert_eq!(ports.bound().collect::<Vec<_>>(), vec![10008]);
        assert_eq!(
            spec.anonymity.map(|a| a.onion_external_port),
            Some(ONION_EXTERNAL_PORT)
        );
    }

    #[test]
    fn overflowing_base_has_no_ports() {
        assert!(NodePorts::derive(u16::MAX - 10, NodeKind::Anonymous).is_none());
    }

    #[test]
    fn share_encoding_validation() {
        assert!(ShareEncoding::default().is_valid());
        assert!(!ShareEncoding { needed: 3, happy: 1, total: 2 }.is_valid());
        assert!(!ShareEncoding { needed: 0, happy: 0, total: 0 }.is_valid());
    }
}
