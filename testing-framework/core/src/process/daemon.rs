use std::{
    collections::VecDeque,
    io,
    process::{ExitStatus, Stdio},
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, BufReader},
    process::Child,
    sync::broadcast::{self, error::RecvError},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use super::runner::{CommandSpec, ProcessError};
use crate::constants::{DAEMON_DRAIN_SETTLE, DAEMON_OUTPUT_TAIL_LINES};

const LINE_CHANNEL_CAPACITY: usize = 1024;
const DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("daemon '{label}' exited with {status} before printing '{needle}'")]
    ExitedBeforeOutput {
        label: String,
        status: ExitStatus,
        needle: String,
    },
    #[error("daemon '{label}' did not print '{needle}' within {timeout:?}")]
    OutputTimeout {
        label: String,
        needle: String,
        timeout: Duration,
    },
    #[error("failed to wait on daemon '{label}': {source}")]
    Wait {
        label: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Clone, Debug)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Bounded record of a daemon's output plus a live feed of new lines.
#[derive(Clone)]
pub struct OutputSink {
    inner: Arc<SinkInner>,
}

struct SinkInner {
    tail: Mutex<VecDeque<OutputLine>>,
    capacity: usize,
    lines: broadcast::Sender<OutputLine>,
}

impl OutputSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (lines, _) = broadcast::channel(LINE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(SinkInner {
                tail: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity: capacity.max(1),
                lines,
            }),
        }
    }

    fn push(&self, stream: OutputStream, text: String) {
        let line = OutputLine { stream, text };
        {
            let mut tail = self
                .inner
                .tail
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if tail.len() == self.inner.capacity {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        // No subscribers is the common case.
        let _ = self.inner.lines.send(line);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<OutputLine> {
        self.inner.lines.subscribe()
    }

    /// Most recent lines, oldest first.
    #[must_use]
    pub fn tail(&self) -> Vec<OutputLine> {
        self.inner
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    #[must_use]
    pub fn tail_text(&self) -> String {
        self.tail()
            .into_iter()
            .map(|line| match line.stream {
                OutputStream::Stdout => line.text,
                OutputStream::Stderr => format!("[stderr] {}", line.text),
            })
            .collect::<Vec<_>>()
            .join("\n")
    }

    #[must_use]
    pub fn contains(&self, needle: &str) -> bool {
        self.inner
            .tail
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .any(|line| line.text.contains(needle))
    }
}

/// A long-running child process. Dropping the handle kills the process.
pub struct DaemonHandle {
    label: String,
    child: Child,
    pid: Option<u32>,
    output: OutputSink,
    drains: Vec<JoinHandle<()>>,
    exit_status: Option<ExitStatus>,
}

/// Spawn a daemon whose stdout and stderr are drained continuously into an
/// [`OutputSink`]. Returns as soon as the process is started.
pub fn spawn_daemon(
    label: impl Into<String>,
    spec: &CommandSpec,
) -> Result<DaemonHandle, ProcessError> {
    let label = label.into();
    let mut command = spec.to_command();
    command.stdout(Stdio::piped()).stderr(Stdio::piped());

    debug!(daemon = %label, command = %spec, "spawning daemon");

    let mut child = command.spawn().map_err(|source| ProcessError::Launch {
        program: spec.program().clone(),
        source,
    })?;

    let output = OutputSink::new(DAEMON_OUTPUT_TAIL_LINES);
    let mut drains = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        drains.push(drain(stdout, OutputStream::Stdout, output.clone(), label.clone()));
    }
    if let Some(stderr) = child.stderr.take() {
        drains.push(drain(stderr, OutputStream::Stderr, output.clone(), label.clone()));
    }

    let pid = child.id();
    info!(daemon = %label, pid = ?pid, "daemon started");

    Ok(DaemonHandle {
        label,
        child,
        pid,
        output,
        drains,
        exit_status: None,
    })
}

fn drain<R>(reader: R, stream: OutputStream, sink: OutputSink, label: String) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&buf).trim_end().to_owned();
                    debug!(daemon = %label, ?stream, "{text}");
                    sink.push(stream, text);
                }
                Err(err) => {
                    warn!(daemon = %label, ?stream, error = %err, "daemon output read failed");
                    break;
                }
            }
        }
    })
}

impl DaemonHandle {
    #[must_use]
    pub fn label(&self) -> &str {
        &self.label
    }

    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    #[must_use]
    pub fn output(&self) -> &OutputSink {
        &self.output
    }

    /// Exit status if the process has already terminated.
    pub fn try_exit_status(&mut self) -> Option<ExitStatus> {
        if self.exit_status.is_none() {
            self.exit_status = self.child.try_wait().ok().flatten();
        }
        self.exit_status
    }

    /// Check if the daemon process is still running.
    pub fn is_running(&mut self) -> bool {
        self.try_exit_status().is_none()
    }

    /// Resolve when the process exits. Cancel-safe.
    pub async fn wait_exit(&mut self) -> Result<ExitStatus, DaemonError> {
        if let Some(status) = self.exit_status {
            return Ok(status);
        }
        let status = self.child.wait().await.map_err(|source| DaemonError::Wait {
            label: self.label.clone(),
            source,
        })?;
        self.exit_status = Some(status);
        settle_drains(&self.drains).await;
        Ok(status)
    }

    /// Wait until a line containing `needle` appears on either stream.
    pub async fn wait_for_output(
        &mut self,
        needle: &str,
        wait: Duration,
    ) -> Result<(), DaemonError> {
        // Subscribe before inspecting the tail so no line slips between the two.
        let mut lines = self.output.subscribe();
        if self.output.contains(needle) {
            return Ok(());
        }

        let Self {
            label,
            child,
            output,
            drains,
            exit_status,
            ..
        } = self;

        let watch = async {
            let mut feed_open = true;
            loop {
                tokio::select! {
                    line = lines.recv(), if feed_open => match line {
                        Ok(line) if line.text.contains(needle) => return Ok(()),
                        Ok(_) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            debug!(daemon = %label, skipped, "output watcher lagged");
                            if output.contains(needle) {
                                return Ok(());
                            }
                        }
                        Err(RecvError::Closed) => feed_open = false,
                    },
                    status = child.wait() => {
                        let status = match status {
                            Ok(status) => status,
                            Err(source) => {
                                return Err(DaemonError::Wait {
                                    label: label.clone(),
                                    source,
                                });
                            }
                        };
                        *exit_status = Some(status);
                        settle_drains(drains).await;
                        if output.contains(needle) {
                            return Ok(());
                        }
                        return Err(DaemonError::ExitedBeforeOutput {
                            label: label.clone(),
                            status,
                            needle: needle.to_owned(),
                        });
                    }
                }
            }
        };

        match timeout(wait, watch).await {
            Ok(result) => result,
            Err(_) => Err(DaemonError::OutputTimeout {
                label: label.clone(),
                needle: needle.to_owned(),
                timeout: wait,
            }),
        }
    }

    /// Kill the daemon and reap it within `grace`. Returns the exit status when
    /// the process was reaped.
    pub async fn terminate(&mut self, grace: Duration) -> Option<ExitStatus> {
        if self.try_exit_status().is_none() {
            kill_child(&mut self.child, &self.label);
            match timeout(grace, self.child.wait()).await {
                Ok(Ok(status)) => self.exit_status = Some(status),
                Ok(Err(err)) => {
                    warn!(daemon = %self.label, error = %err, "failed to reap daemon");
                }
                Err(_) => {
                    warn!(daemon = %self.label, grace = ?grace, "daemon not reaped within grace period");
                }
            }
        }

        settle_drains(&self.drains).await;
        for task in &self.drains {
            task.abort();
        }

        info!(daemon = %self.label, status = ?self.exit_status, "daemon stopped");
        self.exit_status
    }
}

impl Drop for DaemonHandle {
    fn drop(&mut self) {
        if self.exit_status.is_none() {
            kill_child(&mut self.child, &self.label);
        }
        for task in &self.drains {
            task.abort();
        }
    }
}

/// Give drain tasks a moment to flush what the exited process wrote.
async fn settle_drains(drains: &[JoinHandle<()>]) {
    let _ = timeout(DAEMON_DRAIN_SETTLE, async {
        while !drains.iter().all(JoinHandle::is_finished) {
            sleep(DRAIN_CHECK_INTERVAL).await;
        }
    })
    .await;
}

fn kill_child(child: &mut Child, label: &str) {
    debug!(daemon = %label, "killing daemon process");
    if let Err(err) = child.start_kill() {
        debug!(daemon = %label, error = %err, "kill signal not delivered");
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::process::runner::CommandSpec;

    fn sh(script: &str) -> CommandSpec {
        CommandSpec::new("sh").arg("-c").arg(script)
    }

    #[tokio::test]
    async fn chatty_daemon_is_drained_while_running() {
        // Well beyond a 64 KiB pipe buffer; the last line only arrives if the
        // earlier ones were consumed.
        let script = "i=0; while [ $i -lt 20000 ]; do echo \"line $i\"; i=$((i+1)); done; \
                      echo done-writing; exec sleep 600";
        let mut daemon = spawn_daemon("chatty", &sh(script)).unwrap();

        daemon
            .wait_for_output("done-writing", Duration::from_secs(30))
            .await
            .unwrap();
        assert!(daemon.is_running());
        assert!(daemon.output().tail().len() <= DAEMON_OUTPUT_TAIL_LINES);

        let status = daemon.terminate(Duration::from_secs(5)).await;
        assert!(status.is_some_and(|s| !s.success()));
        assert!(!daemon.is_running());
    }

    #[tokio::test]
    async fn wait_for_output_reports_early_exit() {
        let mut daemon = spawn_daemon("quitter", &sh("echo starting; exit 4")).unwrap();

        let err = daemon
            .wait_for_output("introducer running", Duration::from_secs(10))
            .await
            .unwrap_err();
        match err {
            DaemonError::ExitedBeforeOutput { status, .. } => assert_eq!(status.code(), Some(4)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn wait_for_output_times_out() {
        let mut daemon = spawn_daemon("silent", &sh("exec sleep 600")).unwrap();

        let err = daemon
            .wait_for_output("never printed", Duration::from_millis(200))
            .await
            .unwrap_err();
        assert!(matches!(err, DaemonError::OutputTimeout { .. }));

        daemon.terminate(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn stderr_lines_are_captured_and_tagged() {
        let mut daemon =
            spawn_daemon("noisy", &sh("echo oops >&2; echo ready; exec sleep 600")).unwrap();

        daemon
            .wait_for_output("ready", Duration::from_secs(10))
            .await
            .unwrap();
        // stderr may land after stdout; give the drain a moment.
        daemon.terminate(Duration::from_secs(5)).await;
        assert!(daemon.output().tail_text().contains("[stderr] oops"));
    }

    #[tokio::test]
    async fn missing_daemon_binary_is_a_launch_error() {
        let err = spawn_daemon("ghost", &CommandSpec::new("/nonexistent/grid-daemon"))
            .err()
            .unwrap();
        assert!(matches!(err, ProcessError::Launch { .. }));
    }

    #[test]
    fn sink_keeps_only_the_most_recent_lines() {
        let sink = OutputSink::new(2);
        sink.push(OutputStream::Stdout, "one".into());
        sink.push(OutputStream::Stdout, "two".into());
        sink.push(OutputStream::Stdout, "three".into());

        assert_eq!(sink.tail_text(), "two\nthree");
        assert!(!sink.contains("one"));
    }
}
