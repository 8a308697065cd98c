use std::{
    collections::{HashMap, HashSet},
    time::Duration,
};

use thiserror::Error;
use tracing::debug;

use crate::{
    constants::{DEFAULT_MIN_PEERS, OBJECT_CAPABILITY_TEXT, readiness_timeout, tor_control_port},
    nodes::{IntroducerListener, IntroducerSpec, NodeSpec, ShareEncoding},
};

/// Anonymous storage nodes in the onion-service scenario, by Tor control port.
const ONION_STORAGE_NODES: [(&str, u16); 2] = [("carol", 8008), ("dave", 8009)];
const ANONYMOUS_CLIENT_NODE: (&str, u16) = ("anonymoose", 8008);
const NORMAL_CLIENT_NODE: (&str, u16) = ("alice", 9100);
/// Storage nodes backing the anonymous client; each takes the next base up.
const STORAGE_NODE_BASE: u16 = 9200;
const STORAGE_NODE_PREFIX: &str = "storage";
const ANONYMOUS_CLIENT_STORAGE_NODES: usize = 5;

pub const ONION_SERVICE_STORAGE: &str = "onion-service-storage";
pub const ANONYMOUS_CLIENT: &str = "anonymous-client";

#[derive(Debug, Error)]
pub enum ScenarioBuildError {
    #[error("scenario has no nodes")]
    NoNodes,
    #[error("invalid node name '{name}'")]
    InvalidName { name: String },
    #[error("node name '{name}' is used more than once")]
    DuplicateName { name: String },
    #[error("node '{node}': port base {base} leaves no room for derived ports")]
    PortOverflow { node: String, base: u16 },
    #[error("port {port} is claimed by both '{first}' and '{second}'")]
    PortConflict {
        port: u16,
        first: String,
        second: String,
    },
    #[error("node '{node}': share encoding {needed}/{happy}/{total} is invalid")]
    InvalidShares {
        node: String,
        needed: u8,
        happy: u8,
        total: u8,
    },
    #[error("transfer references unknown node '{name}'")]
    UnknownNode { name: String },
}

/// Where nodes get their introducer fURL from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum IntroducerSource {
    /// An introducer already running outside the scenario.
    Existing(String),
    /// An introducer launched as part of the scenario.
    Launch(IntroducerSpec),
}

/// One upload-then-download check.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transfer {
    pub upload: String,
    pub download: String,
}

/// Validated scenario description consumed by the driver.
#[derive(Clone, Debug)]
pub struct Scenario {
    name: String,
    introducer: IntroducerSource,
    nodes: Vec<NodeSpec>,
    transfers: Vec<Transfer>,
    min_peers: usize,
    readiness_timeout: Duration,
    poll_interval: Option<Duration>,
    content: Vec<u8>,
    deadline: Option<Duration>,
    keep_workdir: bool,
}

impl Scenario {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn introducer(&self) -> &IntroducerSource {
        &self.introducer
    }

    #[must_use]
    pub fn nodes(&self) -> &[NodeSpec] {
        &self.nodes
    }

    #[must_use]
    pub fn transfers(&self) -> &[Transfer] {
        &self.transfers
    }

    #[must_use]
    pub const fn min_peers(&self) -> usize {
        self.min_peers
    }

    /// Peer threshold for `node`: its own override, else the scenario's.
    #[must_use]
    pub fn min_peers_for(&self, node: &NodeSpec) -> usize {
        node.min_peers.unwrap_or(self.min_peers)
    }

    #[must_use]
    pub const fn readiness_timeout(&self) -> Duration {
        self.readiness_timeout
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Option<Duration> {
        self.poll_interval
    }

    #[must_use]
    pub fn content(&self) -> &[u8] {
        &self.content
    }

    #[must_use]
    pub const fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    #[must_use]
    pub const fn keep_workdir(&self) -> bool {
        self.keep_workdir
    }
}

/// Builder used by callers to describe the desired scenario.
#[derive(Clone, Debug)]
pub struct ScenarioBuilder {
    name: String,
    introducer: IntroducerSource,
    nodes: Vec<NodeSpec>,
    transfers: Vec<Transfer>,
    shares: Option<ShareEncoding>,
    min_peers: usize,
    readiness_timeout: Duration,
    poll_interval: Option<Duration>,
    content: Vec<u8>,
    deadline: Option<Duration>,
    keep_workdir: bool,
}

impl ScenarioBuilder {
    /// Empty scenario that launches a plain TCP introducer.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            introducer: IntroducerSource::Launch(IntroducerSpec::tcp()),
            nodes: Vec::new(),
            transfers: Vec::new(),
            shares: None,
            min_peers: DEFAULT_MIN_PEERS,
            readiness_timeout: readiness_timeout(),
            poll_interval: None,
            content: OBJECT_CAPABILITY_TEXT.as_bytes().to_vec(),
            deadline: None,
            keep_workdir: false,
        }
    }

    /// Two anonymous nodes behind a Tor introducer, each uploading for the
    /// other to read.
    #[must_use]
    pub fn onion_service_storage() -> Self {
        let [(carol, carol_port), (dave, dave_port)] = ONION_STORAGE_NODES;
        Self::new(ONION_SERVICE_STORAGE)
            .with_introducer(IntroducerSource::Launch(IntroducerSpec::tor(tor_control_port())))
            .with_node(NodeSpec::anonymous(carol, carol_port))
            .with_node(NodeSpec::anonymous(dave, dave_port))
            .with_transfer(carol, dave)
            .with_transfer(dave, carol)
    }

    /// A normal node and an anonymous node sharing a plain introducer with
    /// five storage nodes; the anonymous node reads what the normal one
    /// uploaded. Only the anonymous node waits for peers.
    #[must_use]
    pub fn anonymous_client() -> Self {
        let (normal, normal_base) = NORMAL_CLIENT_NODE;
        let (anonymous, control_port) = ANONYMOUS_CLIENT_NODE;
        Self::new(ANONYMOUS_CLIENT)
            .with_storage_nodes(ANONYMOUS_CLIENT_STORAGE_NODES)
            .with_node(NodeSpec::normal(normal, normal_base).with_min_peers(0))
            .with_node(NodeSpec::anonymous(anonymous, control_port))
            .with_transfer(normal, anonymous)
    }

    /// Preset by name, as accepted from `GRID_SCENARIO`.
    #[must_use]
    pub fn preset(name: &str) -> Option<Self> {
        match name {
            ONION_SERVICE_STORAGE => Some(Self::onion_service_storage()),
            ANONYMOUS_CLIENT => Some(Self::anonymous_client()),
            _ => None,
        }
    }

    #[must_use]
    pub fn with_introducer(mut self, source: IntroducerSource) -> Self {
        self.introducer = source;
        self
    }

    /// Use an already running introducer.
    #[must_use]
    pub fn with_introducer_furl(self, furl: impl Into<String>) -> Self {
        self.with_introducer(IntroducerSource::Existing(furl.into()))
    }

    #[must_use]
    pub fn with_node(mut self, node: NodeSpec) -> Self {
        self.nodes.push(node);
        self
    }

    /// Add `count` normal nodes named `storage0..`, on consecutive port bases
    /// from 9200. They are not gated on peers.
    #[must_use]
    pub fn with_storage_nodes(mut self, count: usize) -> Self {
        let first = self
            .nodes
            .iter()
            .filter(|node| node.name.starts_with(STORAGE_NODE_PREFIX))
            .count();
        for index in first..first + count {
            let offset = u16::try_from(index).unwrap_or(u16::MAX);
            let base = STORAGE_NODE_BASE.saturating_add(offset);
            self.nodes.push(
                NodeSpec::normal(format!("{STORAGE_NODE_PREFIX}{index}"), base).with_min_peers(0),
            );
        }
        self
    }

    #[must_use]
    pub fn with_transfer(mut self, upload: impl Into<String>, download: impl Into<String>) -> Self {
        self.transfers.push(Transfer {
            upload: upload.into(),
            download: download.into(),
        });
        self
    }

    /// Share encoding applied to every node at build time.
    #[must_use]
    pub const fn with_shares(mut self, shares: ShareEncoding) -> Self {
        self.shares = Some(shares);
        self
    }

    #[must_use]
    pub const fn with_min_peers(mut self, min_peers: usize) -> Self {
        self.min_peers = min_peers;
        self
    }

    #[must_use]
    pub const fn with_readiness_timeout(mut self, timeout: Duration) -> Self {
        self.readiness_timeout = timeout;
        self
    }

    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval);
        self
    }

    #[must_use]
    pub fn with_content(mut self, content: impl Into<Vec<u8>>) -> Self {
        self.content = content.into();
        self
    }

    /// Bound the whole run; on expiry the driver tears down and reports.
    #[must_use]
    pub const fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    #[must_use]
    pub const fn keep_workdir(mut self, keep: bool) -> Self {
        self.keep_workdir = keep;
        self
    }

    pub fn build(self) -> Result<Scenario, ScenarioBuildError> {
        let Self {
            name,
            introducer,
            mut nodes,
            transfers,
            shares,
            min_peers,
            readiness_timeout,
            poll_interval,
            content,
            deadline,
            keep_workdir,
        } = self;

        if nodes.is_empty() {
            return Err(ScenarioBuildError::NoNodes);
        }
        if let Some(shares) = shares {
            for node in &mut nodes {
                node.shares = shares;
            }
        }

        let mut names = HashSet::new();
        if let IntroducerSource::Launch(spec) = &introducer {
            names.insert(spec.name.as_str());
        }
        let mut claimed: HashMap<u16, &str> = HashMap::new();
        if let IntroducerSource::Launch(spec) = &introducer {
            claim(&mut claimed, spec.web_port, &spec.name)?;
            if let IntroducerListener::Tcp { port } = spec.listener {
                claim(&mut claimed, port, &spec.name)?;
            }
        }

        for node in &nodes {
            validate_name(&node.name)?;
            if !names.insert(node.name.as_str()) {
                return Err(ScenarioBuildError::DuplicateName {
                    name: node.name.clone(),
                });
            }
            let shares = node.shares;
            if !shares.is_valid() {
                return Err(ScenarioBuildError::InvalidShares {
                    node: node.name.clone(),
                    needed: shares.needed,
                    happy: shares.happy,
                    total: shares.total,
                });
            }
            let ports = node.ports().ok_or_else(|| ScenarioBuildError::PortOverflow {
                node: node.name.clone(),
                base: node.port_base,
            })?;
            for port in ports.bound() {
                claim(&mut claimed, port, &node.name)?;
            }
        }

        for transfer in &transfers {
            for name in [&transfer.upload, &transfer.download] {
                if !nodes.iter().any(|node| &node.name == name) {
                    return Err(ScenarioBuildError::UnknownNode { name: name.clone() });
                }
            }
        }

        debug!(
            scenario = %name,
            nodes = nodes.len(),
            transfers = transfers.len(),
            min_peers,
            "scenario built"
        );

        Ok(Scenario {
            name,
            introducer,
            nodes,
            transfers,
            min_peers,
            readiness_timeout,
            poll_interval,
            content,
            deadline,
            keep_workdir,
        })
    }
}

fn validate_name(name: &str) -> Result<(), ScenarioBuildError> {
    let usable = !name.is_empty()
        && name != "."
        && name != ".."
        && !name.contains(['/', '\\'])
        && !name.chars().any(char::is_whitespace);
    if usable {
        Ok(())
    } else {
        Err(ScenarioBuildError::InvalidName {
            name: name.to_owned(),
        })
    }
}

fn claim<'a>(
    claimed: &mut HashMap<u16, &'a str>,
    port: u16,
    owner: &'a str,
) -> Result<(), ScenarioBuildError> {
    match claimed.insert(port, owner) {
        Some(first) => Err(ScenarioBuildError::PortConflict {
            port,
            first: first.to_owned(),
            second: owner.to_owned(),
        }),
        None => Ok(()),
    }
}
