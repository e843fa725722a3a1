//! IPC client for talking to the daemon over its Unix socket.
//!
//! `send` returns the raw response. The typed helpers unwrap the expected
//! variant and turn `IpcResponse::Error` into [`IpcError::Remote`].

use std::io;
use std::path::Path;
use std::time::Duration;

use protocol::{
    decode_line, encode_line, InvocationSummary, Payload, ProcessStateInfo, SessionSummary,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 5;

/// A client for communicating with the daemon via IPC.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    /// Connect to the daemon at the specified socket path.
    ///
    /// Fails when nothing listens on `path`, which usually means the daemon
    /// is not running.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(
            stream,
            Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        ))
    }

    /// Connect to the daemon with a custom timeout for the connect and for
    /// each later request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection timed out"))??;
        Ok(Self::from_stream(stream, timeout))
    }

    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        }
    }

    /// Set the timeout for operations.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Send a request to the daemon and wait for a response.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "operation timed out"))?
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        let line = encode_line(&request)?;
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;

        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;
        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(decode_line(&line)?)
    }

    /// Like `send`, but a daemon-side error becomes `Err`.
    async fn call(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        match self.send(request).await? {
            IpcResponse::Error { kind, message } => Err(IpcError::Remote { kind, message }),
            other => Ok(other),
        }
    }

    /// Returns `true` if the daemon responds with a Pong.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    /// Get the current status of the daemon.
    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.call(IpcRequest::Status).await
    }

    /// Request the daemon to stop.
    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.call(IpcRequest::Stop).await
    }

    /// List all registered sessions.
    pub async fn list_sessions(&mut self) -> Result<Vec<SessionSummary>, IpcError> {
        match self.call(IpcRequest::ListSessions).await? {
            IpcResponse::Sessions { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    /// Describe one session.
    pub async fn get_session(&mut self, session_id: &str) -> Result<SessionSummary, IpcError> {
        let request = IpcRequest::GetSession {
            session_id: session_id.to_string(),
        };
        match self.call(request).await? {
            IpcResponse::Session { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    /// Start a session with default environment, directory and size.
    pub async fn create_session(&mut self, argv: Vec<String>) -> Result<String, IpcError> {
        let request = IpcRequest::CreateSession {
            argv,
            env: Vec::new(),
            cwd: None,
            rows: None,
            cols: None,
        };
        self.create_session_with(request).await
    }

    /// Start a session from a fully specified `CreateSession` request.
    pub async fn create_session_with(&mut self, request: IpcRequest) -> Result<String, IpcError> {
        match self.call(request).await? {
            IpcResponse::SessionCreated { session_id, .. } => Ok(session_id),
            other => Err(unexpected(other)),
        }
    }

    /// Submit a command line; returns the invocation.
    pub async fn submit(
        &mut self,
        session_id: &str,
        text: &str,
    ) -> Result<InvocationSummary, IpcError> {
        let request = IpcRequest::Submit {
            session_id: session_id.to_string(),
            text: text.to_string(),
        };
        match self.call(request).await? {
            IpcResponse::Invocation { invocation } => Ok(invocation),
            other => Err(unexpected(other)),
        }
    }

    /// Look up a previously submitted command.
    pub async fn get_invocation(
        &mut self,
        session_id: &str,
        invocation_id: &str,
    ) -> Result<InvocationSummary, IpcError> {
        let request = IpcRequest::GetInvocation {
            session_id: session_id.to_string(),
            invocation_id: invocation_id.to_string(),
        };
        match self.call(request).await? {
            IpcResponse::Invocation { invocation } => Ok(invocation),
            other => Err(unexpected(other)),
        }
    }

    /// Write raw bytes to the session's terminal.
    pub async fn write(&mut self, session_id: &str, data: &[u8]) -> Result<(), IpcError> {
        let request = IpcRequest::Write {
            session_id: session_id.to_string(),
            data: Payload::from(data),
        };
        self.expect_ack(request).await
    }

    /// Read output from `cursor`; returns the bytes and the next cursor.
    pub async fn drain(
        &mut self,
        session_id: &str,
        cursor: u64,
        max_bytes: Option<usize>,
    ) -> Result<(Vec<u8>, u64), IpcError> {
        let request = IpcRequest::Drain {
            session_id: session_id.to_string(),
            cursor,
            max_bytes,
        };
        match self.call(request).await? {
            IpcResponse::Output { data, cursor } => Ok((data.into_bytes(), cursor)),
            other => Err(unexpected(other)),
        }
    }

    /// Change the session's terminal size.
    pub async fn resize(&mut self, session_id: &str, rows: u16, cols: u16) -> Result<(), IpcError> {
        let request = IpcRequest::Resize {
            session_id: session_id.to_string(),
            rows,
            cols,
        };
        self.expect_ack(request).await
    }

    /// Forward a signal by number.
    pub async fn signal(&mut self, session_id: &str, signal: i32) -> Result<(), IpcError> {
        let request = IpcRequest::Signal {
            session_id: session_id.to_string(),
            signal,
        };
        self.expect_ack(request).await
    }

    /// Terminate a session; returns the final process state.
    pub async fn terminate(
        &mut self,
        session_id: &str,
        force: bool,
    ) -> Result<ProcessStateInfo, IpcError> {
        let request = IpcRequest::Terminate {
            session_id: session_id.to_string(),
            force,
        };
        match self.call(request).await? {
            IpcResponse::Terminated { process, .. } => Ok(process),
            other => Err(unexpected(other)),
        }
    }

    async fn expect_ack(&mut self, request: IpcRequest) -> Result<(), IpcError> {
        match self.call(request).await? {
            IpcResponse::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(response: IpcResponse) -> IpcError {
    IpcError::UnexpectedResponse(format!("{:?}", response))
}
