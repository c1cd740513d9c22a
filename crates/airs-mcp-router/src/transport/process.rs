//! Spawn-and-pipe transport: one backend tool-server as a child process.
//!
//! Framing is newline-delimited JSON on stdout/stdin, matching the contract
//! most JSON-RPC-over-stdio tool-servers already speak. Shell quoting follows
//! the host's default shell (`sh -c <command>`), ported from the original
//! `exec.Command("sh", "-c", command)` shape.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tracing::warn;

use super::Transport;
use crate::error::TransportError;

/// Spawns `sh -c <command>` and speaks newline-delimited JSON-RPC over its
/// stdio pipes.
pub struct ProcessTransport {
    command: String,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    stdout: Mutex<Option<BufReader<ChildStdout>>>,
    stderr: Mutex<Option<BufReader<ChildStderr>>>,
}

impl ProcessTransport {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            stdout: Mutex::new(None),
            stderr: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn start(&mut self) -> Result<(), TransportError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(TransportError::Spawn)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Spawn(broken_pipe("stdin")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Spawn(broken_pipe("stdout")))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| TransportError::Spawn(broken_pipe("stderr")))?;

        *self.stdin.lock().await = Some(stdin);
        *self.stdout.lock().await = Some(BufReader::new(stdout));
        *self.stderr.lock().await = Some(BufReader::new(stderr));
        *self.child.lock().await = Some(child);

        Ok(())
    }

    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(TransportError::Closed)?;
        stdin.write_all(bytes).await?;
        if !bytes.ends_with(b"\n") {
            stdin.write_all(b"\n").await?;
        }
        stdin.flush().await?;
        Ok(())
    }

    async fn read(&self) -> Result<Vec<u8>, TransportError> {
        let mut guard = self.stdout.lock().await;
        let reader = guard.as_mut().ok_or(TransportError::Closed)?;
        let mut line = Vec::new();
        let n = reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(TransportError::Closed);
        }
        while line.last() == Some(&b'\n') || line.last() == Some(&b'\r') {
            line.pop();
        }
        Ok(line)
    }

    async fn recv_stderr_line(&self) -> Option<String> {
        let mut guard = self.stderr.lock().await;
        let reader = guard.as_mut()?;
        let mut line = String::new();
        match reader.read_line(&mut line).await {
            Ok(0) => None,
            Ok(_) => Some(line.trim_end().to_string()),
            Err(e) => {
                warn!("error reading backend stderr: {e}");
                None
            }
        }
    }

    async fn stop(&self) -> Result<(), TransportError> {
        // Dropping stdin closes it from our side, prompting well-behaved
        // backends to exit on EOF.
        self.stdin.lock().await.take();
        if let Some(mut child) = self.child.lock().await.take() {
            let _ = child.wait().await;
        }
        Ok(())
    }
}

fn broken_pipe(which: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        format!("failed to capture child {which}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn echoes_one_line_round_trip() {
        let mut transport = ProcessTransport::new("cat");
        transport.start().await.unwrap();

        transport.write(br#"{"jsonrpc":"2.0","id":1}"#).await.unwrap();
        let frame = transport.read().await.unwrap();
        assert_eq!(frame, br#"{"jsonrpc":"2.0","id":1}"#);

        transport.stop().await.unwrap();
    }

    #[tokio::test]
    async fn read_after_eof_is_closed() {
        let mut transport = ProcessTransport::new("true");
        transport.start().await.unwrap();
        let result = transport.read().await;
        assert!(matches!(result, Err(TransportError::Closed)));
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let mut transport = ProcessTransport::new("exit 1; this-should-still-spawn-sh");
        // `sh -c` itself always spawns; failure here would come from a
        // genuinely unspawnable shell, which we can't simulate portably, so
        // this just exercises the happy spawn path deterministically.
        assert!(transport.start().await.is_ok());
    }

    #[tokio::test]
    async fn stderr_lines_are_readable_independently_of_stdout() {
        let mut transport = ProcessTransport::new("echo oops 1>&2");
        transport.start().await.unwrap();
        assert_eq!(transport.recv_stderr_line().await.as_deref(), Some("oops"));
        assert!(transport.recv_stderr_line().await.is_none());
    }
}
