use std::{
    borrow::Cow,
    ffi::{OsStr, OsString},
    fmt, io,
    path::PathBuf,
    process::{ExitStatus, Stdio},
};

use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to launch '{program}': {source}")]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to collect output of '{program}': {source}")]
    Io {
        program: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Whether a command's standard error is captured or passed through to the
/// harness's own stderr.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum StderrMode {
    #[default]
    Capture,
    Inherit,
}

/// Description of an external invocation. The ambient environment is always
/// inherited; `env` only adds to it.
#[derive(Clone, Debug)]
pub struct CommandSpec {
    program: PathBuf,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    stderr: StderrMode,
}

impl CommandSpec {
    #[must_use]
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            stderr: StderrMode::default(),
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_owned()));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_owned(), value.as_ref().to_owned()));
        self
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub const fn stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    #[must_use]
    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    #[must_use]
    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub(crate) fn to_command(&self) -> Command {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k, v)))
            .stdin(Stdio::null())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }
        command
    }

    pub(crate) fn stderr_stdio(&self) -> Stdio {
        match self.stderr {
            StderrMode::Capture => Stdio::piped(),
            StderrMode::Inherit => Stdio::inherit(),
        }
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Terminal outcome of a one-shot invocation.
#[derive(Clone, Debug)]
pub struct ProcessResult {
    command: String,
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Option<Vec<u8>>,
}

impl ProcessResult {
    #[must_use]
    pub fn command(&self) -> &str {
        &self.command
    }

    #[must_use]
    pub const fn status(&self) -> ExitStatus {
        self.status
    }

    #[must_use]
    pub fn success(&self) -> bool {
        self.status.success()
    }

    #[must_use]
    pub fn stdout(&self) -> &[u8] {
        &self.stdout
    }

    /// `None` when stderr was passed through instead of captured.
    #[must_use]
    pub fn stderr(&self) -> Option<&[u8]> {
        self.stderr.as_deref()
    }

    #[must_use]
    pub fn stdout_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.stdout)
    }

    #[must_use]
    pub fn stderr_lossy(&self) -> Option<Cow<'_, str>> {
        self.stderr.as_deref().map(String::from_utf8_lossy)
    }

    /// Human-readable report of the command, its exit status and output.
    #[must_use]
    pub fn diagnostics(&self) -> String {
        let stderr = self
            .stderr_lossy()
            .map_or_else(|| "<not captured>".to_owned(), Cow::into_owned);
        format!(
            "command: {}\nexit status: {}\nstdout:\n{}\nstderr:\n{}",
            self.command,
            self.status,
            self.stdout_lossy(),
            stderr
        )
    }
}

/// Run a command to completion, draining stdout (and stderr when captured)
/// concurrently so a chatty child cannot block on a full pipe.
///
/// A non-zero exit is not an error here; callers decide what it means.
pub async fn run(spec: &CommandSpec) -> Result<ProcessResult, ProcessError> {
    let mut command = spec.to_command();
    command.stdout(Stdio::piped()).stderr(spec.stderr_stdio());

    debug!(command = %spec, "running command");

    let child = command.spawn().map_err(|source| ProcessError::Launch {
        program: spec.program.clone(),
        source,
    })?;

    let output = child
        .wait_with_output()
        .await
        .map_err(|source| ProcessError::Io {
            program: spec.program.clone(),
            source,
        })?;

    debug!(
        command = %spec,
        status = %output.status,
        stdout_bytes = output.stdout.len(),
        "command finished"
    );

    let stderr = match spec.stderr {
        StderrMode::Capture => Some(output.stderr),
        StderrMode::Inherit => None,
    };

    Ok(ProcessResult {
        command: spec.to_string(),
        status: output.status,
        stdout: output.stdout,
        stderr,
    })
}
