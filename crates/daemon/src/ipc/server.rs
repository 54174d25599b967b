//! IPC server for the command surface over a Unix domain socket.
//!
//! The server accepts connections from UI and CLI clients. Each connection
//! carries newline-delimited JSON requests and responses; subscribed
//! connections also receive pushed events.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// Listener for command-surface connections.
pub struct IpcServer {
    listener: UnixListener,
}

impl IpcServer {
    /// Binds to `path`, creating parent directories and replacing a stale
    /// socket file. The socket is made accessible to the owner only.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        tracing::debug!("IPC server listening on {:?}", path);

        Ok(Self { listener })
    }

    /// Waits for the next client.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// A connection to an IPC client.
///
/// This struct wraps a Unix stream and provides methods for reading
/// requests and sending responses using JSON newline-delimited protocol.
pub struct IpcConnection {
    reader: RequestReader,
    writer: ResponseWriter,
}

/// Read half of a connection.
pub struct RequestReader {
    inner: BufReader<tokio::io::ReadHalf<UnixStream>>,
}

/// Write half of a connection.
pub struct ResponseWriter {
    inner: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    /// Create a new IPC connection from a Unix stream.
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: RequestReader {
                inner: BufReader::new(read_half),
            },
            writer: ResponseWriter { inner: write_half },
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        self.reader.read_request().await
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        self.writer.send_response(response).await
    }

    /// Splits the connection so that requests can be read while responses
    /// and pushed events are written from another task.
    pub fn split(self) -> (RequestReader, ResponseWriter) {
        (self.reader, self.writer)
    }
}

impl RequestReader {
    /// Read the next request. Returns `None` on disconnect. Blank lines are
    /// skipped.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        loop {
            let mut line = String::new();
            let bytes_read = self.inner.read_line(&mut line).await?;
            if bytes_read == 0 {
                return Ok(None);
            }
            if line.trim().is_empty() {
                continue;
            }
            let request = serde_json::from_str(line.trim())?;
            return Ok(Some(request));
        }
    }
}

impl ResponseWriter {
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.inner.write_all(json.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }
}

/// Errors that can occur during IPC communication.
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A JSON serialization/deserialization error occurred.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
