/// Server process lifecycle: spawn the target binary with piped stdio,
/// write it newline-delimited JSON requests, and guarantee teardown.
use crate::config::ServerConfig;
use crate::mux::LineMux;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, Command};

/// Errors that can occur while driving the server process.
#[derive(Debug)]
pub enum ProbeError {
    /// Failed to spawn the server binary.
    Spawn { source: std::io::Error },
    /// A stdio pipe was not captured after spawn.
    MissingPipe { stream: &'static str },
    /// Failed to serialize a request payload.
    Encode { source: serde_json::Error },
    /// Failed to write a request to the server's stdin.
    Write { source: std::io::Error },
}

impl std::fmt::Display for ProbeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProbeError::Spawn { source } => {
                write!(f, "failed to spawn server process: {}", source)
            }
            ProbeError::MissingPipe { stream } => {
                write!(f, "server process has no {} pipe", stream)
            }
            ProbeError::Encode { source } => {
                write!(f, "failed to encode request payload: {}", source)
            }
            ProbeError::Write { source } => {
                write!(f, "failed to write to server stdin: {}", source)
            }
        }
    }
}

impl std::error::Error for ProbeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ProbeError::Spawn { source } => Some(source),
            ProbeError::MissingPipe { .. } => None,
            ProbeError::Encode { source } => Some(source),
            ProbeError::Write { source } => Some(source),
        }
    }
}

/// A spawned server with its stdin handle and multiplexed output streams.
///
/// stdout is the primary stream (protocol responses), stderr the diagnostic
/// one (logs). The streams stay owned by the mux; dropping `ServerProcess`
/// without calling `shutdown` leaves the child to the kernel, so callers
/// must route all exit paths through `shutdown`.
pub struct ServerProcess {
    child: Child,
    stdin: ChildStdin,
    pub mux: LineMux,
    pid: u32,
}

impl ServerProcess {
    /// Spawn the configured command in its own process group (via
    /// `process_group(0)`) so teardown can kill the whole group.
    pub fn spawn(config: &ServerConfig, quantum: Duration) -> Result<Self, ProbeError> {
        let mut cmd = Command::new(&config.command);
        cmd.args(&config.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);
        for (key, value) in &config.env {
            cmd.env(key, value);
        }

        tracing::info!(
            command = %config.command,
            args = ?config.args,
            "spawning server process"
        );

        let mut child = cmd.spawn().map_err(|e| ProbeError::Spawn { source: e })?;

        let stdin = child
            .stdin
            .take()
            .ok_or(ProbeError::MissingPipe { stream: "stdin" })?;
        let stdout = child
            .stdout
            .take()
            .ok_or(ProbeError::MissingPipe { stream: "stdout" })?;
        let stderr = child
            .stderr
            .take()
            .ok_or(ProbeError::MissingPipe { stream: "stderr" })?;

        let pid = child.id().unwrap_or(0);
        tracing::info!(pid, "server process started");

        Ok(Self {
            child,
            stdin,
            mux: LineMux::new(stdout, stderr, quantum),
            pid,
        })
    }

    /// Write one request as a single JSON line and flush.
    pub async fn send(&mut self, payload: &serde_json::Value) -> Result<(), ProbeError> {
        let mut buf = serde_json::to_vec(payload).map_err(|e| ProbeError::Encode { source: e })?;
        buf.push(b'\n');
        self.stdin
            .write_all(&buf)
            .await
            .map_err(|e| ProbeError::Write { source: e })?;
        self.stdin
            .flush()
            .await
            .map_err(|e| ProbeError::Write { source: e })
    }

    /// Non-blocking exit check. `Some(status)` once the server has exited.
    pub fn try_exit(&mut self) -> Option<std::process::ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                tracing::warn!(error = %e, "failed to poll server exit status");
                None
            }
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Terminate the server: SIGTERM to the process group, wait up to
    /// `grace`, SIGKILL if it refuses to die. Never fails; a process that
    /// already exited makes the signals no-ops.
    pub async fn shutdown(mut self, grace: Duration) {
        if self.pid == 0 {
            // No usable pgid; just reap whatever is there.
            let _ = self.child.wait().await;
            return;
        }
        let pgid = Pid::from_raw(self.pid as i32);
        let _ = signal::killpg(pgid, Signal::SIGTERM);

        match tokio::time::timeout(grace, self.child.wait()).await {
            Ok(Ok(status)) => {
                tracing::info!(pid = self.pid, code = ?status.code(), "server process exited");
            }
            Ok(Err(e)) => {
                tracing::warn!(pid = self.pid, error = %e, "failed to reap server process");
            }
            Err(_) => {
                tracing::warn!(pid = self.pid, "server ignored SIGTERM, sending SIGKILL");
                let _ = signal::killpg(pgid, Signal::SIGKILL);
                let _ = self.child.wait().await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mux::StreamTag;
    use serde_json::json;
    use std::collections::BTreeMap;

    fn sh(script: &str) -> ServerConfig {
        ServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            env: BTreeMap::new(),
        }
    }

    const QUANTUM: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_spawn_failure() {
        let config = ServerConfig {
            command: "nonexistent-binary-xyz".to_string(),
            args: vec![],
            env: BTreeMap::new(),
        };
        let Err(err) = ServerProcess::spawn(&config, QUANTUM) else {
            panic!("spawn of a nonexistent binary must fail");
        };
        assert!(matches!(err, ProbeError::Spawn { .. }));
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn test_send_and_echo_roundtrip() {
        // cat echoes each stdin line straight back on stdout.
        let mut server = ServerProcess::spawn(&sh("exec cat"), QUANTUM).unwrap();
        let payload = json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"});
        server.send(&payload).await.unwrap();

        let event = server.mux.read_one(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.source, StreamTag::Primary);
        assert_eq!(
            serde_json::from_str::<serde_json::Value>(&event.text).unwrap(),
            payload
        );

        server.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_stderr_surfaces_as_diagnostic() {
        let mut server =
            ServerProcess::spawn(&sh("echo 'starting up' >&2; sleep 5"), QUANTUM).unwrap();

        let event = server.mux.read_one(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.source, StreamTag::Diagnostic);
        assert_eq!(event.text, "starting up");

        server.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_env_passed_to_child() {
        let mut env = BTreeMap::new();
        env.insert("PROBE_TEST_VAR".to_string(), "hello-env".to_string());
        let config = ServerConfig {
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo \"$PROBE_TEST_VAR\"".to_string()],
            env,
        };
        let mut server = ServerProcess::spawn(&config, QUANTUM).unwrap();

        let event = server.mux.read_one(Duration::from_secs(5)).await.unwrap();
        assert_eq!(event.text, "hello-env");

        server.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_try_exit_detects_early_death() {
        let mut server = ServerProcess::spawn(&sh("exit 3"), QUANTUM).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        let status = server.try_exit().expect("server should have exited");
        assert_eq!(status.code(), Some(3));

        server.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_try_exit_none_while_running() {
        let mut server = ServerProcess::spawn(&sh("sleep 5"), QUANTUM).unwrap();
        assert!(server.try_exit().is_none());
        server.shutdown(Duration::from_secs(2)).await;
    }

    #[tokio::test]
    async fn test_shutdown_kills_stubborn_process() {
        // Traps SIGTERM and restarts its sleep, so only SIGKILL ends it.
        let server =
            ServerProcess::spawn(&sh("trap '' TERM; while :; do sleep 60; done"), QUANTUM)
                .unwrap();
        let start = std::time::Instant::now();
        server.shutdown(Duration::from_millis(300)).await;
        // Grace period plus the kill, well under the sleep.
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_output_after_exit_still_readable() {
        let mut server = ServerProcess::spawn(&sh("echo last-words"), QUANTUM).unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(server.try_exit().is_some());

        // Pipes outlive the process; buffered output is still delivered.
        let event = server.mux.read_one(Duration::from_secs(2)).await.unwrap();
        assert_eq!(event.text, "last-words");

        server.shutdown(Duration::from_secs(1)).await;
    }
}
