use std::{
    io,
    path::{Path, PathBuf},
    process::ExitStatus,
    time::Duration,
};

use thiserror::Error;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use super::config::{self, ConfigWriteError};
use crate::{
    adjust_timeout,
    constants::{
        DEFAULT_INTRODUCER_TCP_PORT, DEFAULT_INTRODUCER_WEB_PORT, INTRODUCER_FURL_POLL_INTERVAL,
        INTRODUCER_FURL_TIMEOUT, INTRODUCER_READY_TEXT, INTRODUCER_STARTUP_TIMEOUT,
    },
    process::{DaemonError, DaemonHandle, ProcessError, ProcessResult, TahoeCommand, run, spawn_daemon},
};

/// fURL file written by a running introducer.
pub const INTRODUCER_FURL_FILE: &str = "private/introducer.furl";

#[derive(Debug, Error)]
pub enum IntroducerError {
    #[error("failed to prepare introducer directory {path}: {source}")]
    WorkDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("create-introducer could not be started: {0}")]
    CreateLaunch(#[source] ProcessError),
    #[error("create-introducer failed ({})", result.status())]
    CreateFailed { result: Box<ProcessResult> },
    #[error("introducer configuration failed: {0}")]
    Configure(#[from] ConfigWriteError),
    #[error("introducer daemon could not be started: {0}")]
    Launch(#[source] ProcessError),
    #[error("introducer did not start: {source}")]
    Startup {
        #[source]
        source: DaemonError,
        output: String,
    },
    #[error("introducer fURL not written to {path} within {timeout:?}")]
    FurlMissing { path: PathBuf, timeout: Duration },
    #[error("failed to read introducer fURL from {path}: {source}")]
    FurlRead {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl IntroducerError {
    #[must_use]
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            Self::CreateFailed { result } => Some(result.diagnostics()),
            Self::Startup { output, .. } => Some(output.clone()),
            _ => None,
        }
    }
}

/// How the introducer is reachable by the grid.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntroducerListener {
    /// Plain TCP on localhost.
    Tcp { port: u16 },
    /// Onion service allocated through the given Tor control port.
    Tor { control_port: u16 },
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IntroducerSpec {
    /// Directory name under the scenario root, also used as nickname.
    pub name: String,
    pub listener: IntroducerListener,
    pub web_port: u16,
}

impl IntroducerSpec {
    #[must_use]
    pub fn tcp() -> Self {
        Self {
            name: "introducer".to_owned(),
            listener: IntroducerListener::Tcp {
                port: DEFAULT_INTRODUCER_TCP_PORT,
            },
            web_port: DEFAULT_INTRODUCER_WEB_PORT,
        }
    }

    #[must_use]
    pub fn tor(control_port: u16) -> Self {
        Self {
            name: "introducer-tor".to_owned(),
            listener: IntroducerListener::Tor { control_port },
            web_port: DEFAULT_INTRODUCER_WEB_PORT,
        }
    }

    /// Flags for `create-introducer`, excluding the target directory.
    #[must_use]
    pub fn create_flags(&self) -> Vec<String> {
        match self.listener {
            IntroducerListener::Tor { control_port } => vec![
                format!("--tor-control-port=tcp:localhost:{control_port}"),
                "--hide-ip".to_owned(),
                "--listen=tor".to_owned(),
            ],
            IntroducerListener::Tcp { port } => vec![
                "--hostname=localhost".to_owned(),
                format!("--port=tcp:{port}:interface=localhost"),
                format!("--location=tcp:localhost:{port}"),
            ],
        }
    }
}

/// A running introducer and the fURL nodes use to reach it.
pub struct IntroducerHandle {
    dir: PathBuf,
    furl: String,
    daemon: DaemonHandle,
}

impl IntroducerHandle {
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    #[must_use]
    pub fn furl(&self) -> &str {
        &self.furl
    }

    #[must_use]
    pub fn daemon(&self) -> &DaemonHandle {
        &self.daemon
    }

    pub async fn shutdown(&mut self, grace: Duration) -> Option<ExitStatus> {
        self.daemon.terminate(grace).await
    }
}

/// Create, configure and start an introducer under `root`, then wait for it
/// to publish its fURL.
pub async fn launch_introducer(
    tahoe: &TahoeCommand,
    root: &Path,
    spec: &IntroducerSpec,
) -> Result<IntroducerHandle, IntroducerError> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|source| IntroducerError::WorkDir {
            path: root.to_path_buf(),
            source,
        })?;
    let dir = root.join(&spec.name);
    info!(dir = %dir.display(), listener = ?spec.listener, "creating introducer");

    let create = tahoe
        .command(["create-introducer"])
        .args(spec.create_flags())
        .arg(&dir);
    let result = run(&create).await.map_err(IntroducerError::CreateLaunch)?;
    if !result.success() {
        return Err(IntroducerError::CreateFailed {
            result: Box::new(result),
        });
    }

    config::set_config_value(&dir, "node", "nickname", &spec.name)?;
    config::set_config_value(
        &dir,
        "node",
        "web.port",
        &format!("tcp:{}:interface=localhost", spec.web_port),
    )?;

    let mut daemon = spawn_daemon(spec.name.clone(), &tahoe.command(["run"]).arg(&dir))
        .map_err(IntroducerError::Launch)?;

    // Onion address allocation can take tens of seconds.
    if let Err(source) = daemon
        .wait_for_output(INTRODUCER_READY_TEXT, adjust_timeout(INTRODUCER_STARTUP_TIMEOUT))
        .await
    {
        return Err(IntroducerError::Startup {
            source,
            output: daemon.output().tail_text(),
        });
    }

    let furl = read_furl(&dir.join(INTRODUCER_FURL_FILE), adjust_timeout(INTRODUCER_FURL_TIMEOUT)).await?;
    info!(furl = %furl, "introducer ready");

    Ok(IntroducerHandle { dir, furl, daemon })
}

/// Poll for a non-empty fURL file.
async fn read_furl(path: &Path, wait: Duration) -> Result<String, IntroducerError> {
    let deadline = Instant::now() + wait;
    loop {
        match tokio::fs::read_to_string(path).await {
            Ok(contents) if !contents.trim().is_empty() => return Ok(contents.trim().to_owned()),
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(IntroducerError::FurlRead {
                    path: path.to_path_buf(),
                    source,
                });
            }
        }
        if Instant::now() >= deadline {
            return Err(IntroducerError::FurlMissing {
                path: path.to_path_buf(),
                timeout: wait,
            });
        }
        debug!(path = %path.display(), "introducer fURL not written yet");
        sleep(INTRODUCER_FURL_POLL_INTERVAL).await;
    }
}
