//! IPC server accepting CLI connections on a Unix Domain Socket.
//!
//! One request and one response per line, both JSON. The socket file is
//! created owner-only since anything that can connect can spawn shells.

use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};

use nix::sys::stat::{umask, Mode};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};

use super::messages::{IpcRequest, IpcResponse};

/// Longest request line accepted, newline included.
pub const MAX_REQUEST_BYTES: u64 = 64 * 1024;

/// A server that listens for IPC connections on a Unix Domain Socket.
pub struct IpcServer {
    listener: UnixListener,
    path: PathBuf,
}

impl IpcServer {
    /// Bind the server to the specified socket path.
    ///
    /// Parent directories are created as needed and a leftover socket file
    /// from a previous run is replaced. The directory holding the socket is
    /// restricted to the owner, and the socket is never reachable by others,
    /// not even between creation and the final chmod.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or belongs to
    /// another user, the stale socket cannot be removed, or the socket cannot
    /// be bound.
    pub async fn bind(path: &Path) -> Result<Self, io::Error> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            secure_socket_dir(parent)?;
        }

        if path.exists() {
            std::fs::remove_file(path)?;
        }

        // umask is process-wide; it is restored right after the socket exists.
        let previous = umask(Mode::from_bits_truncate(0o177));
        let bound = UnixListener::bind(path);
        umask(previous);
        let listener = bound?;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;

        tracing::debug!(path = %path.display(), "IPC socket bound");

        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    /// The socket path this server is bound to.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Accept a new incoming connection.
    pub async fn accept(&self) -> Result<IpcConnection, io::Error> {
        let (stream, _addr) = self.listener.accept().await?;
        Ok(IpcConnection::new(stream))
    }
}

/// Creates `dir` if needed and makes sure only the current user can enter it.
fn secure_socket_dir(dir: &Path) -> Result<(), io::Error> {
    if !dir.exists() {
        std::fs::create_dir_all(dir)?;
    }

    let metadata = std::fs::metadata(dir)?;
    if metadata.uid() != nix::unistd::getuid().as_raw() {
        return Err(io::Error::new(
            io::ErrorKind::PermissionDenied,
            format!("socket directory {} is owned by another user", dir.display()),
        ));
    }
    if metadata.permissions().mode() & 0o077 != 0 {
        tracing::debug!(path = %dir.display(), "Restricting socket directory to owner");
        std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
    }
    Ok(())
}

/// A connection to an IPC client.
pub struct IpcConnection {
    reader: BufReader<tokio::io::ReadHalf<UnixStream>>,
    writer: tokio::io::WriteHalf<UnixStream>,
}

impl IpcConnection {
    fn new(stream: UnixStream) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);
        Self {
            reader: BufReader::new(read_half),
            writer: write_half,
        }
    }

    /// Read the next request from the client.
    ///
    /// Returns `None` if the client has disconnected.
    ///
    /// # Errors
    ///
    /// Returns an error if the line cannot be read, exceeds
    /// [`MAX_REQUEST_BYTES`], or is not a valid request.
    pub async fn read_request(&mut self) -> Result<Option<IpcRequest>, IpcError> {
        let mut line = String::new();
        let bytes_read = (&mut self.reader)
            .take(MAX_REQUEST_BYTES)
            .read_line(&mut line)
            .await?;

        if bytes_read == 0 {
            return Ok(None);
        }
        if !line.ends_with('\n') && bytes_read as u64 >= MAX_REQUEST_BYTES {
            return Err(IpcError::RequestTooLarge(MAX_REQUEST_BYTES));
        }

        let request = serde_json::from_str(line.trim())?;
        Ok(Some(request))
    }

    /// Send a response to the client.
    pub async fn send_response(&mut self, response: &IpcResponse) -> Result<(), IpcError> {
        let mut json = serde_json::to_string(response)?;
        json.push('\n');

        self.writer.write_all(json.as_bytes()).await?;
        self.writer.flush().await?;

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

    /// A request line exceeded the size limit.
    #[error("request exceeds {0} bytes")]
    RequestTooLarge(u64),
}
