use std::{env, path::PathBuf, time::Duration};

#[must_use]
pub fn slow_test_env() -> bool {
    env::var("SLOW_TEST_ENV").is_ok_and(|s| s == "true")
}

#[must_use]
pub fn debug_tracing() -> bool {
    env::var("GRID_TESTS_TRACING").is_ok_and(|val| val.eq_ignore_ascii_case("true"))
}

#[must_use]
pub fn grid_tests_keep_tempdir() -> bool {
    env::var("GRID_TESTS_KEEP_TEMPDIR").is_ok()
}

/// Parent directory for scenario working directories. Defaults to the system
/// temp dir when unset.
#[must_use]
pub fn grid_work_root() -> Option<PathBuf> {
    env::var_os("GRID_WORK_ROOT").map(PathBuf::from)
}

#[must_use]
pub fn grid_readiness_poll_interval() -> Option<Duration> {
    env::var("GRID_READINESS_POLL_MS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[must_use]
pub fn grid_readiness_timeout() -> Option<Duration> {
    env::var("GRID_READINESS_TIMEOUT_SECS")
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}

#[must_use]
pub fn grid_introducer_furl() -> Option<String> {
    env::var("GRID_INTRODUCER_FURL")
        .ok()
        .filter(|furl| !furl.trim().is_empty())
}

#[must_use]
pub fn grid_tor_control_port() -> Option<u16> {
    env::var("GRID_TOR_CONTROL_PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
}

#[must_use]
pub fn grid_scenario() -> Option<String> {
    env::var("GRID_SCENARIO").ok()
}

#[must_use]
pub fn rust_log() -> Option<String> {
    env::var("RUST_LOG").ok()
}
