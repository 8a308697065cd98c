//! Upload through one node, download through another, compare bytes.

use std::{
    fmt, io,
    path::{Path, PathBuf},
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use crate::{
    nodes::NodeHandle,
    process::{ProcessError, ProcessResult, StderrMode, TahoeCommand, run},
};

const GOLD_FILE_PREFIX: &str = "gold-";

/// Opaque content identifier printed by `put`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Capability(String);

impl Capability {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Last whitespace-delimited token of `put`'s stdout.
#[must_use]
pub fn parse_capability(stdout: &[u8]) -> Option<Capability> {
    String::from_utf8_lossy(stdout)
        .split_whitespace()
        .last()
        .map(|token| Capability(token.to_owned()))
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferStep {
    Put,
    Get,
}

impl fmt::Display for TransferStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Put => "put",
            Self::Get => "get",
        })
    }
}

#[derive(Debug, Error)]
pub enum RoundTripError {
    #[error("node '{node}' is not ready")]
    NodeNotReady { node: String },
    #[error("failed to write upload content to {path}: {source}")]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{step} could not be started: {source}")]
    Launch {
        step: TransferStep,
        #[source]
        source: ProcessError,
    },
    #[error("{step} failed ({})", result.status())]
    CommandFailed {
        step: TransferStep,
        result: Box<ProcessResult>,
    },
    #[error("no capability in put output")]
    CapabilityParse { result: Box<ProcessResult> },
    #[error(
        "downloaded content differs from upload for {capability} \
         ({} bytes expected, {} bytes received)",
        expected.len(),
        actual.len()
    )]
    IntegrityMismatch {
        capability: Capability,
        expected: Vec<u8>,
        actual: Vec<u8>,
    },
}

impl RoundTripError {
    /// Output or byte dumps that explain the failure.
    #[must_use]
    pub fn diagnostics(&self) -> Option<String> {
        match self {
            Self::CommandFailed { result, .. } | Self::CapabilityParse { result } => {
                Some(result.diagnostics())
            }
            Self::IntegrityMismatch {
                expected, actual, ..
            } => Some(format!(
                "expected: {:?}\n  hex: {}\nactual: {:?}\n  hex: {}",
                String::from_utf8_lossy(expected),
                hex::encode(expected),
                String::from_utf8_lossy(actual),
                hex::encode(actual),
            )),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct RoundTripOutcome {
    pub capability: Capability,
    pub bytes: usize,
}

/// Runs put/get pairs through the node CLI.
pub struct CapabilityRoundTrip {
    tahoe: TahoeCommand,
    scratch: PathBuf,
}

impl CapabilityRoundTrip {
    /// Upload files are written under `scratch`.
    #[must_use]
    pub fn new(tahoe: TahoeCommand, scratch: impl Into<PathBuf>) -> Self {
        Self {
            tahoe,
            scratch: scratch.into(),
        }
    }

    /// Upload `content` via `upload` and read it back via `download`. Both
    /// nodes must have passed their readiness gate.
    pub async fn round_trip(
        &self,
        upload: &NodeHandle,
        download: &NodeHandle,
        content: &[u8],
    ) -> Result<RoundTripOutcome, RoundTripError> {
        for node in [upload, download] {
            if !node.is_ready() {
                return Err(RoundTripError::NodeNotReady {
                    node: node.name().to_owned(),
                });
            }
        }
        info!(from = upload.name(), to = download.name(), bytes = content.len(), "round trip");
        self.round_trip_dirs(upload.dir(), download.dir(), content).await
    }

    /// Round trip between two node directories.
    pub async fn round_trip_dirs(
        &self,
        upload_dir: &Path,
        download_dir: &Path,
        content: &[u8],
    ) -> Result<RoundTripOutcome, RoundTripError> {
        let gold = self.persist(content).await?;

        let put = self
            .tahoe
            .command(["-d"])
            .arg(upload_dir)
            .arg("put")
            .arg(gold.path());
        let result = run(&put).await.map_err(|source| RoundTripError::Launch {
            step: TransferStep::Put,
            source,
        })?;
        if !result.success() {
            return Err(RoundTripError::CommandFailed {
                step: TransferStep::Put,
                result: Box::new(result),
            });
        }
        let Some(capability) = parse_capability(result.stdout()) else {
            return Err(RoundTripError::CapabilityParse {
                result: Box::new(result),
            });
        };
        debug!(capability = %capability, "uploaded");

        let get = self
            .tahoe
            .command(["-d"])
            .arg(download_dir)
            .arg("get")
            .arg(capability.as_str())
            .stderr(StderrMode::Inherit);
        let result = run(&get).await.map_err(|source| RoundTripError::Launch {
            step: TransferStep::Get,
            source,
        })?;
        if !result.success() {
            return Err(RoundTripError::CommandFailed {
                step: TransferStep::Get,
                result: Box::new(result),
            });
        }

        let recovered = result.stdout().trim_ascii_end();
        if content.trim_ascii_end() != recovered {
            return Err(RoundTripError::IntegrityMismatch {
                capability,
                expected: content.to_vec(),
                actual: result.stdout().to_vec(),
            });
        }

        info!(capability = %capability, bytes = recovered.len(), "round trip verified");
        Ok(RoundTripOutcome {
            capability,
            bytes: recovered.len(),
        })
    }

    async fn persist(&self, content: &[u8]) -> Result<tempfile::NamedTempFile, RoundTripError> {
        let persist_err = |source: io::Error| RoundTripError::Persist {
            path: self.scratch.clone(),
            source,
        };
        tokio::fs::create_dir_all(&self.scratch)
            .await
            .map_err(persist_err)?;
        let gold = tempfile::Builder::new()
            .prefix(GOLD_FILE_PREFIX)
            .tempfile_in(&self.scratch)
            .map_err(persist_err)?;
        tokio::fs::write(gold.path(), content)
            .await
            .map_err(persist_err)?;
        Ok(gold)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_is_last_token() {
        let cap = parse_capability(b"200 OK\nURI:CHK:abc:def:1:2:58\n  \n").unwrap();
        assert_eq!(cap.as_str(), "URI:CHK:abc:def:1:2:58");
        assert!(parse_capability(b" \n\t").is_none());
    }

    #[test]
    fn mismatch_diagnostics_show_hex() {
        let err = RoundTripError::IntegrityMismatch {
            capability: Capability("URI:LIT:x".into()),
            expected: b"ab".to_vec(),
            actual: b"ac".to_vec(),
        };
        let text = err.diagnostics().unwrap();
        assert!(text.contains("6162"));
        assert!(text.contains("6163"));
    }

    #[cfg(unix)]
    mod cli {
        use std::ffi::OsStr;

        use super::*;

        /// Stand-in CLI: `put` stores a copy under a derived name, `get`
        /// prints it back with `GET_SUFFIX` appended.
        const FAKE_TAHOE: &str = r#"
store="$(dirname "$0")/store"
mkdir -p "$store"
[ "$1" = "-d" ] && shift 2
case "$1" in
  put)
    [ -n "$FAIL_PUT" ] && { echo "upload refused" >&2; exit 2; }
    cap="URI:CHK:$(cksum < "$2" | cut -d' ' -f1)"
    cp "$2" "$store/$cap"
    [ -n "$SILENT_PUT" ] && exit 0
    echo "200 OK"
    echo "$cap" ;;
  get)
    cat "$store/$2" || exit 1
    printf '%s' "$GET_SUFFIX" ;;
esac
"#;

        fn fake(env: &[(&str, &str)]) -> (tempfile::TempDir, CapabilityRoundTrip) {
            let dir = tempfile::tempdir().unwrap();
            let script = dir.path().join("tahoe.sh");
            std::fs::write(&script, FAKE_TAHOE).unwrap();
            let mut tahoe = TahoeCommand::new("env");
            tahoe = tahoe.with_prefix_args(env.iter().map(|(k, v)| format!("{k}={v}")));
            tahoe = tahoe.with_prefix_args([OsStr::new("sh"), script.as_os_str()]);
            let trip = CapabilityRoundTrip::new(tahoe, dir.path().join("scratch"));
            (dir, trip)
        }

        #[tokio::test]
        async fn content_survives_round_trip() {
            let (dir, trip) = fake(&[("GET_SUFFIX", "\n\n")]);
            let content = b"The object-capability model is a computer security model.\n";

            let outcome = trip
                .round_trip_dirs(&dir.path().join("a"), &dir.path().join("b"), content)
                .await
                .unwrap();

            assert!(outcome.capability.as_str().starts_with("URI:CHK:"));
            assert_eq!(outcome.bytes, content.len() - 1);
        }

        #[tokio::test]
        async fn altered_download_is_a_mismatch() {
            let (dir, trip) = fake(&[("GET_SUFFIX", "tampered")]);

            let err = trip
                .round_trip_dirs(&dir.path().join("a"), &dir.path().join("b"), b"payload")
                .await
                .unwrap_err();

            match err {
                RoundTripError::IntegrityMismatch { expected, actual, .. } => {
                    assert_eq!(expected, b"payload");
                    assert_eq!(actual, b"payloadtampered");
                }
                other => panic!("unexpected error: {other}"),
            }
        }

        #[tokio::test]
        async fn failed_put_carries_stderr() {
            let (dir, trip) = fake(&[("FAIL_PUT", "1")]);

            let err = trip
                .round_trip_dirs(&dir.path().join("a"), &dir.path().join("b"), b"payload")
                .await
                .unwrap_err();

            assert!(matches!(
                err,
                RoundTripError::CommandFailed {
                    step: TransferStep::Put,
                    ..
                }
            ));
            assert!(err.diagnostics().unwrap().contains("upload refused"));
        }

        #[tokio::test]
        async fn put_without_capability_is_a_parse_error() {
            let (dir, trip) = fake(&[("SILENT_PUT", "1")]);

            let err = trip
                .round_trip_dirs(&dir.path().join("a"), &dir.path().join("b"), b"payload")
                .await
                .unwrap_err();

            assert!(matches!(err, RoundTripError::CapabilityParse { .. }));
        }
    }
}
