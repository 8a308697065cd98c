use std::time::Duration;

use grid_testing_env as tf_env;

/// Default spacing between status queries while awaiting readiness.
pub const DEFAULT_READINESS_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Lower bound for the readiness poll interval; the poller never busy-loops.
pub const MIN_READINESS_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Default readiness deadline for a freshly launched node.
pub const DEFAULT_READINESS_TIMEOUT: Duration = Duration::from_secs(600);

/// Default number of connected storage servers required before a node is
/// considered ready.
pub const DEFAULT_MIN_PEERS: usize = 2;

/// Upper bound on a single status query.
pub const STATUS_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Offset from a node's port base to its web (status) port.
pub const WEB_PORT_OFFSET: u16 = 2000;

/// Offset from a node's port base to its storage listener (normal nodes).
pub const STORAGE_PORT_OFFSET: u16 = 1000;

/// External port of the onion service published by anonymous nodes.
pub const ONION_EXTERNAL_PORT: u16 = 3457;

/// Onion service key location, relative to the node directory.
pub const ONION_PRIVATE_KEY_FILE: &str = "private/tor_onion.privkey";

/// Introducer nickname used in `private/introducers.yaml`.
pub const DEFAULT_INTRODUCER_NAME: &str = "default";

/// Line printed by an introducer daemon once it accepts connections.
pub const INTRODUCER_READY_TEXT: &str = "introducer running";

/// Tor control port of the Chutney client node in the `basic` network.
pub const DEFAULT_TOR_CONTROL_PORT: u16 = 8008;

pub const DEFAULT_INTRODUCER_WEB_PORT: u16 = 4561;
pub const DEFAULT_INTRODUCER_TCP_PORT: u16 = 4562;

/// Allocating an onion address can take tens of seconds.
pub const INTRODUCER_STARTUP_TIMEOUT: Duration = Duration::from_secs(180);
pub const INTRODUCER_FURL_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const INTRODUCER_FURL_TIMEOUT: Duration = Duration::from_secs(60);

/// Time a terminated daemon gets to be reaped before teardown moves on.
pub const DAEMON_TERMINATE_GRACE: Duration = Duration::from_secs(10);

/// Time given to output drain tasks to flush after the daemon exits.
pub const DAEMON_DRAIN_SETTLE: Duration = Duration::from_millis(500);

/// Lines of daemon output retained per daemon for diagnostics.
pub const DAEMON_OUTPUT_TAIL_LINES: usize = 200;

/// Content uploaded by the stock scenarios.
pub const OBJECT_CAPABILITY_TEXT: &str =
    "The object-capability model is a computer security model.";

/// Resolve the readiness poll interval from `GRID_READINESS_POLL_MS`, falling
/// back to the default.
pub fn readiness_poll_interval() -> Duration {
    tf_env::grid_readiness_poll_interval()
        .unwrap_or(DEFAULT_READINESS_POLL_INTERVAL)
        .max(MIN_READINESS_POLL_INTERVAL)
}

/// Resolve the readiness deadline from `GRID_READINESS_TIMEOUT_SECS`, falling
/// back to the default.
pub fn readiness_timeout() -> Duration {
    tf_env::grid_readiness_timeout().unwrap_or(DEFAULT_READINESS_TIMEOUT)
}

/// Resolve the Tor control port from `GRID_TOR_CONTROL_PORT`, falling back to
/// the Chutney default.
pub fn tor_control_port() -> u16 {
    tf_env::grid_tor_control_port().unwrap_or(DEFAULT_TOR_CONTROL_PORT)
}
