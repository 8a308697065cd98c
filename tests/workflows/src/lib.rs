use anyhow::{Context as _, Result, anyhow};
use grid_testing_core::scenario::{ONION_SERVICE_STORAGE, Scenario, ScenarioBuilder};
use grid_testing_env as tf_env;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt};

const DEFAULT_LOG_FILTER: &str = "info";
const DEBUG_LOG_FILTER: &str = "grid_testing_core=debug,info";

/// Install a fmt subscriber honouring `RUST_LOG`, or `GRID_TESTS_TRACING=true`
/// for harness debug output. Safe to call repeatedly.
pub fn init_tracing() {
    let fallback = if tf_env::debug_tracing() {
        DEBUG_LOG_FILTER
    } else {
        DEFAULT_LOG_FILTER
    };
    let filter = tf_env::rust_log()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(fallback));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

/// Preset named by `GRID_SCENARIO` (default: onion service storage), pointed
/// at `GRID_INTRODUCER_FURL` when one is given.
pub fn scenario_builder_from_env() -> Result<ScenarioBuilder> {
    let name = tf_env::grid_scenario().unwrap_or_else(|| ONION_SERVICE_STORAGE.to_owned());
    let mut builder =
        ScenarioBuilder::preset(&name).ok_or_else(|| anyhow!("unknown scenario '{name}'"))?;
    if let Some(furl) = tf_env::grid_introducer_furl() {
        info!(furl = %furl, "using existing introducer");
        builder = builder.with_introducer_furl(furl);
    }
    Ok(builder)
}

pub fn scenario_from_env() -> Result<Scenario> {
    scenario_builder_from_env()?
        .build()
        .context("building scenario from environment")
}

#[cfg(test)]
mod tests {
    use grid_testing_core::scenario::{ANONYMOUS_CLIENT, IntroducerSource};
    use serial_test::serial;

    use super::*;

    fn with_env<T>(vars: &[(&str, &str)], f: impl FnOnce() -> T) -> T {
        for (key, value) in vars {
            // SAFETY: env-touching tests are serialised.
            unsafe { std::env::set_var(key, value) };
        }
        let out = f();
        for (key, _) in vars {
            unsafe { std::env::remove_var(key) };
        }
        out
    }

    #[test]
    #[serial]
    fn unknown_scenario_name_is_rejected() {
        let err = with_env(&[("GRID_SCENARIO", "no-such-scenario")], scenario_builder_from_env)
            .unwrap_err();
        assert!(err.to_string().contains("no-such-scenario"));
    }

    #[test]
    #[serial]
    fn introducer_furl_replaces_launched_introducer() {
        let scenario = with_env(
            &[
                ("GRID_SCENARIO", ANONYMOUS_CLIENT),
                ("GRID_INTRODUCER_FURL", "pb://tub@tcp:localhost:4562/swiss"),
            ],
            scenario_from_env,
        )
        .unwrap();

        assert_eq!(scenario.name(), ANONYMOUS_CLIENT);
        assert_eq!(
            scenario.introducer(),
            &IntroducerSource::Existing("pb://tub@tcp:localhost:4562/swiss".into())
        );
    }
}
