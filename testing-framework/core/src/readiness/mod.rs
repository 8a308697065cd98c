//! Readiness gate: poll a node's status surface until it reports a minimum
//! number of connected peers or a deadline passes.
//!
//! A single observation at or above the threshold is accepted as final. Peer
//! counts are assumed not to flap for the duration of one scenario; if the
//! status surface ever proves flaky this is the place to add a re-check.

use std::time::Duration;

use thiserror::Error;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::{
    constants::{DEFAULT_READINESS_POLL_INTERVAL, MIN_READINESS_POLL_INTERVAL},
    nodes::status::StatusSource,
};

#[derive(Debug, Error)]
pub enum ReadinessError {
    #[error(
        "timed out waiting for {min_peers} connected peers after {polls} polls \
         (last observed: {last_observed:?})"
    )]
    Timeout {
        min_peers: usize,
        last_observed: Option<usize>,
        polls: u32,
        last_error: Option<String>,
    },
}

impl ReadinessError {
    #[must_use]
    pub const fn last_observed(&self) -> Option<usize> {
        match self {
            Self::Timeout { last_observed, .. } => *last_observed,
        }
    }

    /// Most recent status query failure, if any.
    #[must_use]
    pub fn last_error(&self) -> Option<&str> {
        match self {
            Self::Timeout { last_error, .. } => last_error.as_deref(),
        }
    }
}

/// Minimum distinct-peer count and the absolute deadline for reaching it.
///
/// A plain value: the poll interval defaults to
/// [`DEFAULT_READINESS_POLL_INTERVAL`] and is only changed through
/// [`Self::with_poll_interval`].
#[derive(Clone, Debug)]
pub struct ReadinessCriterion {
    min_peers: usize,
    deadline: Instant,
    poll_interval: Duration,
}

impl ReadinessCriterion {
    #[must_use]
    pub fn new(min_peers: usize, deadline: Instant) -> Self {
        Self {
            min_peers,
            deadline,
            poll_interval: DEFAULT_READINESS_POLL_INTERVAL,
        }
    }

    /// Deadline `timeout` from now.
    #[must_use]
    pub fn within(min_peers: usize, timeout: Duration) -> Self {
        Self::new(min_peers, Instant::now() + timeout)
    }

    /// Override the spacing between queries; clamped to a small minimum.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(MIN_READINESS_POLL_INTERVAL);
        self
    }

    #[must_use]
    pub const fn min_peers(&self) -> usize {
        self.min_peers
    }

    #[must_use]
    pub const fn deadline(&self) -> Instant {
        self.deadline
    }

    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }
}

/// Successful gate passage.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReadinessOutcome {
    /// Count that satisfied the gate; `None` when no query was needed.
    pub observed_peers: Option<usize>,
    pub polls: u32,
    pub waited: Duration,
}

impl ReadinessOutcome {
    pub(crate) const fn immediate() -> Self {
        Self {
            observed_peers: None,
            polls: 0,
            waited: Duration::ZERO,
        }
    }
}

/// Poll `source` until it reports at least `criterion.min_peers()` peers.
///
/// Query failures are not fatal; they are treated as "no observation" until
/// the deadline. A deadline at or before the call fails without querying.
pub async fn await_ready(
    source: &dyn StatusSource,
    criterion: &ReadinessCriterion,
) -> Result<ReadinessOutcome, ReadinessError> {
    let started = Instant::now();
    let min_peers = criterion.min_peers();

    if criterion.deadline() <= started {
        warn!(
            status = %source.describe(),
            min_peers,
            "readiness deadline already passed; not polling"
        );
        return Err(ReadinessError::Timeout {
            min_peers,
            last_observed: None,
            polls: 0,
            last_error: None,
        });
    }

    if min_peers == 0 {
        return Ok(ReadinessOutcome::immediate());
    }

    debug!(
        status = %source.describe(),
        min_peers,
        poll_ms = criterion.poll_interval().as_millis(),
        "polling for readiness"
    );

    let mut polls = 0u32;
    let mut last_observed = None;
    let mut last_error = None;

    let gate = timeout_at(criterion.deadline(), async {
        loop {
            polls += 1;
            match source.connected_peers().await {
                Ok(peers) => {
                    last_observed = Some(peers);
                    if peers >= min_peers {
                        return peers;
                    }
                    debug!(status = %source.describe(), peers, min_peers, "not enough peers yet");
                }
                Err(err) => {
                    debug!(status = %source.describe(), error = %err, "status query failed");
                    last_error = Some(err.to_string());
                }
            }
            sleep(criterion.poll_interval()).await;
        }
    })
    .await;

    match gate {
        Ok(peers) => {
            let waited = started.elapsed();
            info!(
                status = %source.describe(),
                peers,
                polls,
                waited_ms = waited.as_millis(),
                "readiness threshold reached"
            );
            Ok(ReadinessOutcome {
                observed_peers: Some(peers),
                polls,
                waited,
            })
        }
        Err(_) => {
            warn!(
                status = %source.describe(),
                min_peers,
                last_observed = ?last_observed,
                polls,
                "readiness deadline elapsed"
            );
            Err(ReadinessError::Timeout {
                min_peers,
                last_observed,
                polls,
                last_error,
            })
        }
    }
}
