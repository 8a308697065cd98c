use std::{
    env,
    ffi::{OsStr, OsString},
    path::PathBuf,
};

use tracing::{debug, info};

use super::runner::CommandSpec;

pub struct BinaryConfig {
    pub env_var: &'static str,
    pub binary_name: &'static str,
}

/// Node executable, overridable through `GRID_TAHOE_BIN`.
pub const TAHOE_BINARY: BinaryConfig = BinaryConfig {
    env_var: "GRID_TAHOE_BIN",
    binary_name: "tahoe",
};

pub struct BinaryResolver;

impl BinaryResolver {
    pub fn resolve_path(config: &BinaryConfig) -> PathBuf {
        if let Some(path) = env::var_os(config.env_var) {
            let resolved = PathBuf::from(path);

            info!(
                env = config.env_var,
                binary = config.binary_name,
                path = %resolved.display(),
                "resolved binary from env override"
            );
            return resolved;
        }
        if let Some(path) = Self::which_on_path(config.binary_name) {
            info!(
                binary = config.binary_name,
                path = %path.display(),
                "resolved binary from PATH"
            );
            return path;
        }

        // Left bare so that spawning reports a launch error naming the binary.
        debug!(
            binary = config.binary_name,
            "binary not found on PATH; using bare name"
        );
        PathBuf::from(config.binary_name)
    }

    fn which_on_path(bin: &str) -> Option<PathBuf> {
        let path_env = env::var_os("PATH")?;
        env::split_paths(&path_env)
            .map(|p| p.join(bin))
            .find(|candidate| candidate.is_file())
    }
}

/// How to invoke the node CLI: a program plus any leading arguments, e.g.
/// `python -b -m allmydata.scripts.runner`.
#[derive(Clone, Debug)]
pub struct TahoeCommand {
    program: PathBuf,
    prefix_args: Vec<OsString>,
}

impl TahoeCommand {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            prefix_args: Vec::new(),
        }
    }

    /// Resolve the executable from the environment or `PATH`.
    #[must_use]
    pub fn resolve() -> Self {
        Self::new(BinaryResolver::resolve_path(&TAHOE_BINARY))
    }

    #[must_use]
    pub fn with_prefix_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.prefix_args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    #[must_use]
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Build a command spec for `<program> <prefix..> <args..>`.
    #[must_use]
    pub fn command<I, S>(&self, args: I) -> CommandSpec
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        CommandSpec::new(&self.program)
            .args(&self.prefix_args)
            .args(args)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_places_prefix_before_args() {
        let tahoe = TahoeCommand::new("python3").with_prefix_args(["-m", "allmydata.scripts.runner"]);
        let spec = tahoe.command(["put", "/tmp/gold"]);

        assert_eq!(spec.program(), &PathBuf::from("python3"));
        let args: Vec<_> = spec.get_args().iter().map(|a| a.to_string_lossy().into_owned()).collect();
        assert_eq!(args, ["-m", "allmydata.scripts.runner", "put", "/tmp/gold"]);
    }

    #[test]
    fn unresolvable_binary_falls_back_to_bare_name() {
        let config = BinaryConfig {
            env_var: "GRID_TEST_BINARY_THAT_IS_NEVER_SET",
            binary_name: "grid-binary-that-does-not-exist",
        };
        assert_eq!(
            BinaryResolver::resolve_path(&config),
            PathBuf::from("grid-binary-that-does-not-exist")
        );
    }
}
