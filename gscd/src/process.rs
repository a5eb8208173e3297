//! Supervision of the single game server child process.
//!
//! The bridge owns the child's lifecycle and pipes. The child's stdout and
//! stderr share one pipe, so the transcript preserves the child's own
//! interleaving of the two streams; each run gets exactly one reader task
//! doing line reads off that pipe, and decoded lines flow through the
//! [`OutputHub`] in production order. Everything else (start/stop/write/
//! tail) runs on caller tasks and is safe concurrently with the reader.

use std::os::fd::OwnedFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use encoding_rs::Encoding;
use gsc_common::OpError;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::transcript::OutputHub;

/// Lifecycle of the supervised process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    NotStarted,
    Running,
    Stopped,
}

impl RunState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Stopped => "stopped",
        }
    }
}

struct BridgeInner {
    state: RunState,
    stdin: Option<ChildStdin>,
    child: Option<Child>,
    /// Bumped per spawn so the reader task from a previous run can never flip
    /// the state of the current one. The [`OutputHub`] holds the same number
    /// and refuses publishes tagged with a superseded generation.
    generation: u64,
}

/// Bridge between one child process and any number of console observers.
pub struct ProcessBridge {
    command: Vec<String>,
    working_dir: PathBuf,
    encoding: &'static Encoding,
    hub: OutputHub,
    inner: Mutex<BridgeInner>,
}

impl ProcessBridge {
    pub fn new(
        command: Vec<String>,
        working_dir: PathBuf,
        encoding: &'static Encoding,
        transcript_limit: usize,
    ) -> Self {
        Self {
            command,
            working_dir,
            encoding,
            hub: OutputHub::new(transcript_limit),
            inner: Mutex::new(BridgeInner {
                state: RunState::NotStarted,
                stdin: None,
                child: None,
                generation: 0,
            }),
        }
    }

    /// Spawn the child if it is not already running.
    ///
    /// A call while Running is a no-op: no second process, no transcript
    /// reset. Spawn failure leaves the state untouched.
    pub async fn start(self: &Arc<Self>) -> Result<(), OpError> {
        let mut inner = self.inner.lock().await;
        if inner.state == RunState::Running {
            debug!("start requested while already running; ignoring");
            return Ok(());
        }

        let (program, args) = self
            .command
            .split_first()
            .ok_or(OpError::Validation("server command is empty"))?;

        // One pipe carries both output streams: the write end is handed to
        // the child twice (stdout and stderr), so lines land in the order
        // the child wrote them.
        let (output_tx, output_rx) = pipe::pipe().map_err(OpError::SpawnFailed)?;
        let stdout_fd: OwnedFd = output_tx.into_blocking_fd().map_err(OpError::SpawnFailed)?;
        let stderr_fd = stdout_fd.try_clone().map_err(OpError::SpawnFailed)?;

        // The parent's write ends live only for this statement; once the
        // child (and anything it forked) lets go of its copies, the reader
        // sees end-of-stream.
        let mut child = Command::new(program)
            .args(args)
            .current_dir(&self.working_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::from(stdout_fd))
            .stderr(Stdio::from(stderr_fd))
            .kill_on_drop(true)
            .spawn()
            .map_err(OpError::SpawnFailed)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| OpError::SpawnFailed(std::io::Error::other("stdin pipe missing")))?;

        inner.generation += 1;
        let generation = inner.generation;
        self.hub.reset_for(generation);
        inner.state = RunState::Running;
        inner.stdin = Some(stdin);
        inner.child = Some(child);
        drop(inner);

        info!(command = %self.command.join(" "), "server process started");

        // End-of-stream on the merged pipe marks the run Stopped and reaps
        // the child.
        let bridge = Arc::clone(self);
        tokio::spawn(async move {
            bridge.read_output(output_rx, generation).await;
            bridge.mark_stopped(generation).await;
        });
        Ok(())
    }

    /// Ask the child to shut down: a literal `stop` line on stdin, then
    /// SIGTERM so a server without a console handler still gets a shutdown
    /// it can act on. Does not wait for exit; the state flips to Stopped
    /// when the reader sees end-of-stream. No-op unless Running.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state != RunState::Running {
            return;
        }
        if let Some(stdin) = inner.stdin.as_mut() {
            let line = self.encode_line("stop");
            if stdin.write_all(&line).await.is_ok() {
                let _ = stdin.flush().await;
            }
        }
        if let Some(child) = inner.child.as_ref() {
            match child.id() {
                Some(pid) => {
                    if !send_terminate(pid) {
                        warn!(pid, "terminate signal was not delivered");
                    }
                }
                None => debug!("server process already reaped"),
            }
        }
        info!("server process stop requested");
    }

    /// Write one command line to the child's stdin, in its native encoding,
    /// flushed immediately. Fails with `NotRunning` when there is no live
    /// process.
    pub async fn write(&self, text: &str) -> Result<(), OpError> {
        let mut inner = self.inner.lock().await;
        if inner.state != RunState::Running {
            return Err(OpError::NotRunning);
        }
        let stdin = inner.stdin.as_mut().ok_or(OpError::NotRunning)?;
        let line = self.encode_line(text);
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    pub async fn state(&self) -> RunState {
        self.inner.lock().await.state
    }

    pub async fn is_running(&self) -> bool {
        self.state().await == RunState::Running
    }

    /// Most recent `max_bytes` of this run's transcript.
    pub fn transcript_tail(&self, max_bytes: usize) -> String {
        self.hub.tail(max_bytes)
    }

    /// Tail snapshot plus a live subscription starting exactly after it.
    pub fn subscribe_with_tail(&self, max_bytes: usize) -> (String, broadcast::Receiver<String>) {
        self.hub.subscribe_with_tail(max_bytes)
    }

    /// Transcript size in bytes.
    pub fn transcript_len(&self) -> usize {
        self.hub.len()
    }

    /// Broadcast console chatter (command echoes) to live observers without
    /// recording it in the transcript.
    pub fn broadcast_notice(&self, text: &str) {
        self.hub.broadcast_only(text);
    }

    fn encode_line(&self, text: &str) -> Vec<u8> {
        let (encoded, _, _) = self.encoding.encode(text);
        let mut line = encoded.into_owned();
        line.push(b'\n');
        line
    }

    /// Line-buffered read loop over the merged output pipe. Decode failures
    /// drop the line and keep reading; a malformed sequence never ends the
    /// stream. Stops once the hub reports the run superseded.
    async fn read_output<R>(&self, pipe: R, generation: u64)
    where
        R: tokio::io::AsyncRead + Unpin,
    {
        let mut reader = BufReader::new(pipe);
        let mut buf = Vec::with_capacity(1024);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => {
                    debug!("child output pipe reached end of stream");
                    break;
                }
                Ok(_) => {
                    match self
                        .encoding
                        .decode_without_bom_handling_and_without_replacement(&buf)
                    {
                        Some(text) => {
                            if !self.hub.publish_from(generation, &text) {
                                debug!("superseded run still had buffered output; stopping");
                                break;
                            }
                        }
                        None => {
                            warn!(len = buf.len(), "dropping undecodable output line");
                        }
                    }
                }
                Err(err) => {
                    warn!(error = %err, "read error on child output pipe");
                    break;
                }
            }
        }
    }

    /// Transition this generation's run to Stopped and reap the child.
    async fn mark_stopped(&self, generation: u64) {
        let child = {
            let mut inner = self.inner.lock().await;
            if inner.generation != generation || inner.state != RunState::Running {
                return;
            }
            inner.state = RunState::Stopped;
            inner.stdin = None;
            inner.child.take()
        };
        if let Some(mut child) = child {
            match child.wait().await {
                Ok(status) => info!(%status, "server process exited"),
                Err(err) => warn!(error = %err, "failed to reap server process"),
            }
        }
    }
}

/// Deliver SIGTERM to `pid`. `kill_on_drop` on the child remains the hard
/// backstop if the daemon itself goes down.
fn send_terminate(pid: u32) -> bool {
    match std::process::Command::new("kill")
        .arg("-TERM")
        .arg(pid.to_string())
        .output()
    {
        Ok(output) => output.status.success(),
        Err(err) => {
            warn!(pid, error = %err, "failed to run kill");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::sleep;

    fn bridge_for(command: &[&str]) -> Arc<ProcessBridge> {
        Arc::new(ProcessBridge::new(
            command.iter().map(|s| s.to_string()).collect(),
            std::env::temp_dir(),
            encoding_rs::UTF_8,
            1 << 20,
        ))
    }

    async fn wait_for_state(bridge: &ProcessBridge, wanted: RunState) {
        for _ in 0..500 {
            if bridge.state().await == wanted {
                return;
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("state never became {wanted:?}");
    }

    async fn wait_for_output(bridge: &ProcessBridge, needle: &str) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !bridge.transcript_tail(1 << 20).contains(needle) {
            assert!(
                tokio::time::Instant::now() < deadline,
                "never saw {needle:?} in transcript"
            );
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn write_before_start_is_not_running() {
        let bridge = bridge_for(&["cat"]);
        assert_eq!(bridge.state().await, RunState::NotStarted);
        assert!(matches!(bridge.write("ping").await, Err(OpError::NotRunning)));
    }

    #[tokio::test]
    async fn spawn_failure_leaves_state_not_started() {
        let bridge = bridge_for(&["/definitely/not/a/binary"]);
        let err = bridge.start().await.unwrap_err();
        assert!(matches!(err, OpError::SpawnFailed(_)));
        assert_eq!(bridge.state().await, RunState::NotStarted);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn echo_round_trip_through_cat() {
        let bridge = bridge_for(&["cat"]);
        bridge.start().await.unwrap();
        assert!(bridge.is_running().await);

        let (tail, mut rx) = bridge.subscribe_with_tail(1 << 20);
        assert!(tail.is_empty());

        bridge.write("ping").await.unwrap();
        let chunk = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for echo")
            .unwrap();
        assert_eq!(chunk, "ping\n");
        assert_eq!(bridge.transcript_tail(1 << 20), "ping\n");

        bridge.stop().await;
        wait_for_state(&bridge, RunState::Stopped).await;
        assert!(matches!(bridge.write("late").await, Err(OpError::NotRunning)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn start_while_running_keeps_transcript() {
        let bridge = bridge_for(&["cat"]);
        bridge.start().await.unwrap();

        bridge.write("X").await.unwrap();
        wait_for_output(&bridge, "X").await;

        // Second start is a no-op: same process, history intact.
        bridge.start().await.unwrap();
        assert!(bridge.transcript_tail(1 << 20).contains('X'));
        assert!(bridge.is_running().await);

        bridge.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn restart_resets_transcript() {
        let bridge = bridge_for(&["sh", "-c", "echo first; exec cat"]);
        bridge.start().await.unwrap();
        wait_for_output(&bridge, "first").await;

        bridge.stop().await;
        wait_for_state(&bridge, RunState::Stopped).await;

        bridge.start().await.unwrap();
        // New run prints "first" again; wait for it to prove the reader is
        // alive, then check the old run's copy is gone.
        wait_for_output(&bridge, "first").await;
        assert_eq!(bridge.transcript_tail(1 << 20).matches("first").count(), 1);

        bridge.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stdout_and_stderr_interleave_in_write_order() {
        let bridge = bridge_for(&["sh", "-c", "echo out; echo err 1>&2; echo last"]);
        bridge.start().await.unwrap();

        // Both streams feed the same pipe, so the transcript carries the
        // exact write order, not a per-stream shuffle.
        wait_for_state(&bridge, RunState::Stopped).await;
        assert_eq!(bridge.transcript_tail(1 << 20), "out\nerr\nlast\n");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn stop_lets_the_child_shut_down_cleanly() {
        // The child installs a TERM handler and also honors a literal
        // `stop` line; a hard kill would produce neither message.
        let bridge = bridge_for(&[
            "sh",
            "-c",
            "trap 'echo caught-term; exit 0' TERM; echo ready; \
             while read line; do \
               if [ \"$line\" = stop ]; then echo graceful; exit 0; fi; \
             done",
        ]);
        bridge.start().await.unwrap();
        wait_for_output(&bridge, "ready").await;

        bridge.stop().await;
        wait_for_state(&bridge, RunState::Stopped).await;

        let tail = bridge.transcript_tail(1 << 20);
        assert!(
            tail.contains("graceful") || tail.contains("caught-term"),
            "child had no chance to exit cleanly: {tail:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn malformed_bytes_drop_one_line_not_the_stream() {
        // Middle line is invalid UTF-8; the lines around it must survive.
        let bridge = bridge_for(&[
            "sh",
            "-c",
            r"printf 'good-one\n\377\376\n'; printf 'good-two\n'; sleep 5",
        ]);
        bridge.start().await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let tail = bridge.transcript_tail(1 << 20);
            if tail.contains("good-one") && tail.contains("good-two") {
                assert!(!tail.contains('\u{FFFD}'));
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "valid lines missing");
            sleep(Duration::from_millis(10)).await;
        }
        bridge.stop().await;
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_exit_transitions_to_stopped() {
        let bridge = bridge_for(&["sh", "-c", "echo done"]);
        bridge.start().await.unwrap();

        wait_for_state(&bridge, RunState::Stopped).await;
        assert_eq!(bridge.transcript_tail(64), "done\n");
    }

    #[tokio::test]
    async fn stop_when_not_running_is_a_no_op() {
        let bridge = bridge_for(&["cat"]);
        bridge.stop().await;
        assert_eq!(bridge.state().await, RunState::NotStarted);
    }
}
