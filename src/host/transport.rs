//! Transport layer for the RPC client.
//!
//! Abstracts the connection to a worker for testability: `probe`/`cancel`
//! exchange one envelope, `run` opens a live byte stream that the event
//! codec consumes. Production uses `CommandTransport` (conventionally an
//! SSH-invoked worker process); tests run an in-process harness behind the
//! same trait.

use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};

use thiserror::Error;

use relay_protocol::envelope::{RpcRequest, RpcResponse};
use relay_protocol::error::ErrorCode;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// The stable error code for surfacing transport failures.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::WorkerUnreachable
    }
}

/// Transport to one worker.
pub trait Transport: Send {
    /// Exchange one request for one response envelope (probe, cancel).
    fn call(&self, request: &RpcRequest) -> Result<RpcResponse, TransportError>;

    /// Send a run request and return the live event byte stream.
    fn open_run(&self, request: &RpcRequest) -> Result<Box<dyn BufRead + Send>, TransportError>;
}

/// SSH connection settings for a remote worker.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote host.
    pub host: String,
    /// SSH user.
    pub user: Option<String>,
    /// SSH port (default 22).
    pub port: u16,
    /// Command to invoke on the remote side.
    pub remote_command: Vec<String>,
}

impl SshConfig {
    fn to_argv(&self) -> (String, Vec<String>) {
        let mut args = vec!["-p".to_string(), self.port.to_string()];
        let destination = match &self.user {
            Some(user) => format!("{}@{}", user, self.host),
            None => self.host.clone(),
        };
        args.push(destination);
        args.extend(self.remote_command.iter().cloned());
        ("ssh".to_string(), args)
    }
}

/// Spawns one worker process per session and talks over its stdio.
pub struct CommandTransport {
    program: String,
    args: Vec<String>,
}

impl CommandTransport {
    /// Transport that invokes `program args...` per session.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// Transport that reaches the worker over SSH.
    pub fn ssh(config: &SshConfig) -> Self {
        let (program, args) = config.to_argv();
        Self { program, args }
    }

    fn spawn(&self) -> Result<Child, TransportError> {
        Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| {
                TransportError::ConnectionFailed(format!("spawn {}: {}", self.program, e))
            })
    }

    fn send_request(child: &mut Child, request: &RpcRequest) -> Result<ChildStdin, TransportError> {
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdin unavailable".to_string()))?;
        let line = serde_json::to_string(request)?;
        writeln!(stdin, "{}", line)?;
        stdin.flush()?;
        Ok(stdin)
    }
}

impl Transport for CommandTransport {
    fn call(&self, request: &RpcRequest) -> Result<RpcResponse, TransportError> {
        let mut child = self.spawn()?;
        // Closing stdin is fine for single-envelope operations.
        drop(Self::send_request(&mut child, request)?);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdout unavailable".to_string()))?;
        let mut line = String::new();
        BufReader::new(stdout).read_line(&mut line)?;
        let _ = child.wait();

        if line.is_empty() {
            return Err(TransportError::Protocol(
                "worker closed the session without a response".to_string(),
            ));
        }
        Ok(serde_json::from_str(&line)?)
    }

    fn open_run(&self, request: &RpcRequest) -> Result<Box<dyn BufRead + Send>, TransportError> {
        let mut child = self.spawn()?;
        let stdin = Self::send_request(&mut child, request)?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Protocol("child stdout unavailable".to_string()))?;
        Ok(Box::new(RunStream {
            reader: BufReader::new(stdout),
            _stdin: stdin,
            child,
        }))
    }
}

/// Live event stream backed by a worker process. The host holds the request
/// channel open for the whole run; dropping the stream tears the session
/// down, which is how the worker observes host liveness.
struct RunStream {
    reader: BufReader<ChildStdout>,
    _stdin: ChildStdin,
    child: Child,
}

impl Read for RunStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reader.read(buf)
    }
}

impl BufRead for RunStream {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        self.reader.fill_buf()
    }

    fn consume(&mut self, amt: usize) {
        self.reader.consume(amt)
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_argv() {
        let config = SshConfig {
            host: "worker-1.example".to_string(),
            user: Some("relay".to_string()),
            port: 2222,
            remote_command: vec!["relay-worker".to_string(), "serve".to_string()],
        };
        let (program, args) = config.to_argv();
        assert_eq!(program, "ssh");
        assert_eq!(
            args,
            vec!["-p", "2222", "relay@worker-1.example", "relay-worker", "serve"]
        );
    }

    #[test]
    fn test_spawn_failure_is_connection_failed() {
        let transport = CommandTransport::new("relay-no-such-binary", vec![]);
        let request = RpcRequest::new(
            0,
            relay_protocol::envelope::Operation::Probe,
            "req-1",
            serde_json::json!({}),
        );
        let err = transport.call(&request).unwrap_err();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
        assert_eq!(err.code(), ErrorCode::WorkerUnreachable);
    }
}
