//! Unix socket transport.
//!
//! The supervisor binds one [`Endpoint`] per session; the worker connects
//! to it and both sides talk through a framed [`Channel`].

use crate::error::{BridgeError, BridgeResult};
use crate::protocol::{CodecError, Frame, FrameCodec, MAX_FRAME_LEN};
use futures::{SinkExt, StreamExt};
use std::path::{Path, PathBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::codec::Framed;
use tracing::debug;

/// Listening socket owned by the supervisor
///
/// The socket file is removed when the endpoint is dropped.
#[derive(Debug)]
pub struct Endpoint {
    path: PathBuf,
    listener: UnixListener,
    max_frame_len: usize,
}

impl Endpoint {
    /// Bind a socket at `path`, replacing a leftover socket file
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be bound
    pub fn bind(path: &Path) -> BridgeResult<Self> {
        match std::fs::remove_file(path) {
            Ok(()) => debug!(path = %path.display(), "Removed leftover socket file"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(BridgeError::io("remove leftover socket")(e)),
        }
        let listener =
            UnixListener::bind(path).map_err(BridgeError::io(format!("bind {}", path.display())))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
                .map_err(BridgeError::io("restrict socket permissions"))?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            listener,
            max_frame_len: MAX_FRAME_LEN,
        })
    }

    /// Set the frame limit for accepted channels
    #[must_use]
    pub fn with_max_frame_len(mut self, max_frame_len: usize) -> Self {
        self.max_frame_len = max_frame_len;
        self
    }

    /// Socket path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the next connection
    ///
    /// # Errors
    ///
    /// Returns error if accepting fails
    pub async fn accept(&self) -> BridgeResult<Channel> {
        let (stream, _) = self
            .listener
            .accept()
            .await
            .map_err(BridgeError::io("accept worker connection"))?;
        Ok(Channel::from_stream(stream, self.max_frame_len))
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Framed, bidirectional connection
#[derive(Debug)]
pub struct Channel {
    framed: Framed<UnixStream, FrameCodec>,
    beats: u64,
}

impl Channel {
    /// Connect to an endpoint
    ///
    /// # Errors
    ///
    /// Returns error if the socket cannot be reached
    pub async fn connect(path: &Path, max_frame_len: usize) -> BridgeResult<Self> {
        let stream = UnixStream::connect(path)
            .await
            .map_err(BridgeError::io(format!("connect {}", path.display())))?;
        Ok(Self::from_stream(stream, max_frame_len))
    }

    /// Wrap an established stream
    #[must_use]
    pub fn from_stream(stream: UnixStream, max_frame_len: usize) -> Self {
        Self {
            framed: Framed::new(stream, FrameCodec::with_max_length(max_frame_len)),
            beats: 0,
        }
    }

    /// Frame limit in bytes
    #[must_use]
    pub fn max_frame_len(&self) -> usize {
        self.framed.codec().max_length()
    }

    /// Send one frame
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::FrameTooLarge`] without writing anything if
    /// the frame exceeds the limit, or an I/O error if it cannot be written
    pub async fn send(&mut self, frame: Frame) -> BridgeResult<()> {
        self.framed.send(frame).await.map_err(codec_error)
    }

    /// Receive the next frame; `None` once the peer has closed the socket
    ///
    /// Cancel safe.
    ///
    /// # Errors
    ///
    /// Returns error if reading fails
    pub async fn recv(&mut self) -> BridgeResult<Option<Frame>> {
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => Err(codec_error(e)),
            None => Ok(None),
        }
    }

    /// Send a heartbeat with the next heartbeat counter
    ///
    /// # Errors
    ///
    /// Returns error if the frame cannot be written
    pub async fn heartbeat(&mut self) -> BridgeResult<u64> {
        self.beats += 1;
        self.send(Frame::beat(self.beats)).await?;
        Ok(self.beats)
    }
}

fn codec_error(e: CodecError) -> BridgeError {
    match e {
        CodecError::Io(source) => BridgeError::Io {
            context: "socket".to_string(),
            source,
        },
        CodecError::FrameTooLong { len, max } => BridgeError::FrameTooLarge { len, max },
        other => BridgeError::Protocol(other.to_string()),
    }
}
