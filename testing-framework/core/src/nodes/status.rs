use std::{collections::HashSet, sync::Arc};

use reqwest::{Client, Url};
use serde::Deserialize;
use thiserror::Error;

use super::NodePorts;
use crate::constants::STATUS_QUERY_TIMEOUT;

#[derive(Debug, Error)]
pub enum StatusError {
    #[error("invalid status url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("status surface unavailable: {message}")]
    Unavailable { message: String },
}

/// Pull interface onto a running node's connection status.
#[async_trait::async_trait]
pub trait StatusSource: Send + Sync {
    /// Number of distinct peers the node currently reports as connected.
    async fn connected_peers(&self) -> Result<usize, StatusError>;

    /// Short description used in logs.
    fn describe(&self) -> String;
}

/// Builds a status source for each launched node.
pub trait StatusSourceFactory: Send + Sync {
    fn status_source(
        &self,
        node: &str,
        ports: &NodePorts,
    ) -> Result<Arc<dyn StatusSource>, StatusError>;
}

/// Welcome page JSON (`/?t=json`), reduced to what readiness needs.
#[derive(Debug, Default, Deserialize)]
pub struct WelcomeStatus {
    #[serde(default)]
    pub servers: Vec<ServerStatus>,
}

#[derive(Debug, Deserialize)]
pub struct ServerStatus {
    #[serde(default)]
    pub nodeid: Option<String>,
    #[serde(default)]
    pub connection_status: String,
}

impl ServerStatus {
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.connection_status.starts_with("Connected")
    }
}

impl WelcomeStatus {
    /// Distinct connected servers. Entries without a node id are counted
    /// individually.
    #[must_use]
    pub fn connected_peers(&self) -> usize {
        let mut ids = HashSet::new();
        let mut unnamed = 0;
        for server in self.servers.iter().filter(|s| s.is_connected()) {
            match server.nodeid.as_deref() {
                Some(id) => {
                    ids.insert(id);
                }
                None => unnamed += 1,
            }
        }
        ids.len() + unnamed
    }
}

/// Queries a node's web port for its welcome JSON.
pub struct HttpStatusClient {
    client: Client,
    url: Url,
}

impl HttpStatusClient {
    pub fn new(base: Url) -> Result<Self, StatusError> {
        let mut url = base;
        url.set_query(Some("t=json"));
        let client = Client::builder().timeout(STATUS_QUERY_TIMEOUT).build()?;
        Ok(Self { client, url })
    }

    /// Client for a node listening on `127.0.0.1:<web_port>`.
    pub fn for_web_port(web_port: u16) -> Result<Self, StatusError> {
        let raw = format!("http://127.0.0.1:{web_port}/");
        let base = Url::parse(&raw).map_err(|source| StatusError::InvalidUrl {
            url: raw,
            message: source.to_string(),
        })?;
        Self::new(base)
    }

    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }

    pub async fn fetch(&self) -> Result<WelcomeStatus, StatusError> {
        let status = self
            .client
            .get(self.url.clone())
            .send()
            .await?
            .error_for_status()?
            .json::<WelcomeStatus>()
            .await?;
        Ok(status)
    }
}

#[async_trait::async_trait]
impl StatusSource for HttpStatusClient {
    async fn connected_peers(&self) -> Result<usize, StatusError> {
        Ok(self.fetch().await?.connected_peers())
    }

    fn describe(&self) -> String {
        self.url.to_string()
    }
}

/// Default factory: HTTP status on each node's web port.
#[derive(Clone, Copy, Debug, Default)]
pub struct HttpStatusFactory;

impl StatusSourceFactory for HttpStatusFactory {
    fn status_source(
        &self,
        _node: &str,
        ports: &NodePorts,
    ) -> Result<Arc<dyn StatusSource>, StatusError> {
        Ok(Arc::new(HttpStatusClient::for_web_port(ports.web)?))
    }
}
