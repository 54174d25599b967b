//! IPC client for the daemon's command surface.

use std::io;
use std::path::Path;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

use protocol::{CreateSessionRequest, SessionEvent};

use super::messages::{IpcRequest, IpcResponse};
use super::server::IpcError;

/// Default timeout for client operations.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Client side of a command-surface connection.
pub struct IpcClient {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
    timeout: Duration,
}

impl IpcClient {
    fn from_stream(stream: UnixStream, timeout: Duration) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
            timeout,
        }
    }

    /// Connects to the daemon. Fails when no daemon is listening.
    pub async fn connect(path: &Path) -> Result<Self, IpcError> {
        let stream = UnixStream::connect(path).await?;
        Ok(Self::from_stream(stream, DEFAULT_TIMEOUT))
    }

    /// Connects with `timeout` applied to the connect and to every request.
    pub async fn connect_with_timeout(path: &Path, timeout: Duration) -> Result<Self, IpcError> {
        let stream = tokio::time::timeout(timeout, UnixStream::connect(path))
            .await
            .map_err(|_| timed_out("connection timed out"))??;
        Ok(Self::from_stream(stream, timeout))
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    /// Sends a request and waits for its response.
    ///
    /// Fire-and-forget requests (`Write`, `Resize`) are sent with
    /// [`notify`](Self::notify) instead and return `Ack` here without
    /// reading.
    pub async fn send(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        if !request.expects_response() {
            self.notify(request).await?;
            return Ok(IpcResponse::Ack);
        }
        tokio::time::timeout(self.timeout, self.send_internal(request))
            .await
            .map_err(|_| timed_out("operation timed out"))?
    }

    /// Sends a request without waiting for a response.
    pub async fn notify(&mut self, request: IpcRequest) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(&request)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn send_internal(&mut self, request: IpcRequest) -> Result<IpcResponse, IpcError> {
        self.notify(request).await?;
        self.read_response().await
    }

    async fn read_response(&mut self) -> Result<IpcResponse, IpcError> {
        let mut line = String::new();
        let bytes_read = self.reader.read_line(&mut line).await?;

        if bytes_read == 0 {
            return Err(IpcError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "daemon closed connection",
            )));
        }

        Ok(serde_json::from_str(line.trim())?)
    }

    /// Returns `true` if the daemon answers with `Pong`.
    pub async fn ping(&mut self) -> Result<bool, IpcError> {
        let response = self.send(IpcRequest::Ping).await?;
        Ok(matches!(response, IpcResponse::Pong))
    }

    pub async fn status(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Status).await
    }

    pub async fn stop(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Stop).await
    }

    pub async fn list_sessions(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::ListSessions).await
    }

    pub async fn create_session(&mut self, request: CreateSessionRequest) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::CreateSession(request)).await
    }

    pub async fn write(&mut self, terminal_id: &str, data: &[u8]) -> Result<(), IpcError> {
        self.notify(IpcRequest::Write {
            terminal_id: terminal_id.to_string(),
            data: data.to_vec(),
        })
        .await
    }

    pub async fn resize(&mut self, terminal_id: &str, cols: u16, rows: u16) -> Result<(), IpcError> {
        self.notify(IpcRequest::Resize {
            terminal_id: terminal_id.to_string(),
            cols,
            rows,
        })
        .await
    }

    pub async fn kill(&mut self, terminal_id: &str) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::Kill {
            terminal_id: terminal_id.to_string(),
        })
        .await
    }

    pub async fn load_groups(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::LoadGroups).await
    }

    pub async fn detect_install_paths(&mut self) -> Result<IpcResponse, IpcError> {
        self.send(IpcRequest::DetectInstallPaths).await
    }

    /// Subscribes this connection to session events. Use
    /// [`next_event`](Self::next_event) afterwards.
    pub async fn subscribe(&mut self) -> Result<(), IpcError> {
        match self.send(IpcRequest::Subscribe).await? {
            IpcResponse::Subscribed => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    /// Waits for the next pushed event. Non-event responses that arrive in
    /// between are skipped.
    pub async fn next_event(&mut self) -> Result<SessionEvent, IpcError> {
        loop {
            match self.read_response().await? {
                IpcResponse::Event(event) => return Ok(event),
                other => tracing::debug!(response = ?other, "Skipping non-event response"),
            }
        }
    }
}

fn timed_out(message: &str) -> IpcError {
    IpcError::Io(io::Error::new(io::ErrorKind::TimedOut, message.to_string()))
}

fn unexpected(response: IpcResponse) -> IpcError {
    IpcError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("unexpected response: {:?}", response),
    ))
}
