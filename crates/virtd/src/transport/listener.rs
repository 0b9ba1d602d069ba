//! Unix socket listener.

use std::fs;
use std::io;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::{UnixListener as StdUnixListener, UnixStream as StdUnixStream};

use camino::{Utf8Path, Utf8PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tracing::{info, warn};

use super::{LISTENER_TARGET, ListenerError};

/// Listener bound to a filesystem socket path.
///
/// A stale socket file left by a previous run is removed before binding; a
/// socket some other process still answers on is an error. The socket file is
/// removed again when the listener is dropped.
#[derive(Debug)]
pub struct SocketListener {
    path: Utf8PathBuf,
    listener: UnixListener,
}

impl SocketListener {
    /// Binds `path`. Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ListenerError`] when the path is occupied or cannot be bound.
    pub fn bind(path: &Utf8Path) -> Result<Self, ListenerError> {
        remove_stale_socket(path)?;
        let listener = StdUnixListener::bind(path).map_err(|source| ListenerError::Bind {
            path: path.to_string(),
            source,
        })?;
        let registered = listener
            .set_nonblocking(true)
            .and_then(|()| UnixListener::from_std(listener));
        let listener = match registered {
            Ok(listener) => listener,
            Err(source) => {
                remove_socket_file(path);
                return Err(ListenerError::Register {
                    path: path.to_string(),
                    source,
                });
            }
        };
        info!(target: LISTENER_TARGET, socket = %path, "socket listener bound");
        Ok(Self {
            path: path.to_owned(),
            listener,
        })
    }

    /// Socket path.
    #[must_use]
    pub fn path(&self) -> &Utf8Path {
        &self.path
    }

    /// Waits for the next client.
    ///
    /// # Errors
    ///
    /// Propagates accept failures.
    pub async fn accept(&self) -> io::Result<UnixStream> {
        self.listener.accept().await.map(|(stream, _)| stream)
    }
}

impl Drop for SocketListener {
    fn drop(&mut self) {
        remove_socket_file(&self.path);
    }
}

fn remove_stale_socket(path: &Utf8Path) -> Result<(), ListenerError> {
    if !path.exists() {
        return Ok(());
    }
    let metadata = fs::symlink_metadata(path).map_err(|source| ListenerError::Metadata {
        path: path.to_string(),
        source,
    })?;
    if !metadata.file_type().is_socket() {
        return Err(ListenerError::NotSocket {
            path: path.to_string(),
        });
    }
    match StdUnixStream::connect(path) {
        Ok(_stream) => Err(ListenerError::InUse {
            path: path.to_string(),
        }),
        Err(error)
            if matches!(
                error.kind(),
                io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
            ) =>
        {
            fs::remove_file(path).map_err(|source| ListenerError::Cleanup {
                path: path.to_string(),
                source,
            })
        }
        Err(source) => Err(ListenerError::LivenessCheck {
            path: path.to_string(),
            source,
        }),
    }
}

fn remove_socket_file(path: &Utf8Path) {
    if let Err(error) = fs::remove_file(path)
        && error.kind() != io::ErrorKind::NotFound
    {
        warn!(
            target: LISTENER_TARGET,
            error = %error,
            path = %path,
            "failed to remove unix socket file"
        );
    }
}
