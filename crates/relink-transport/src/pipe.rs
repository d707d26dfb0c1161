//! Local inter-process carrier over a named bidirectional pipe endpoint.
//!
//! The agent side owns the endpoint: the first send binds it at a fixed
//! path and blocks until a companion process connects, then every message
//! travels as one frame (see [`crate::frame`]). The endpoint is made
//! world-accessible on a best-effort basis so a peer running under a
//! different account can connect; the agent-id check on inbound frames is
//! what rejects traffic that is not addressed to this agent.

use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;

use bytes::{Buf, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::config::PipeConfig;
use crate::error::{Result, TransportError};
use crate::frame::{self, FRAME_HEADER_LEN};

/// Outcome of draining the OS buffer without blocking.
enum Drain {
    /// No more bytes available right now.
    Idle,
    /// The peer closed its end.
    Eof,
    /// The endpoint itself failed.
    Fatal(std::io::Error),
}

/// Carrier acting as the server side of a local pipe endpoint.
pub struct PipeCarrier {
    config: PipeConfig,
    agent_id: u32,
    listener: Option<UnixListener>,
    stream: Option<UnixStream>,
    readbuf: BytesMut,
    connected: bool,
}

impl PipeCarrier {
    /// Build a carrier; the endpoint is created lazily on the first send.
    pub fn new(config: PipeConfig, agent_id: u32) -> Self {
        PipeCarrier {
            config,
            agent_id,
            listener: None,
            stream: None,
            readbuf: BytesMut::new(),
            connected: false,
        }
    }

    /// Whether a peer is believed to be attached.
    pub fn connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// Send one framed message.
    ///
    /// The first call creates the endpoint and blocks until a peer
    /// connects. Once a peer is attached, a write failure meaning "peer
    /// gone" tears the stream down and fails; any other write failure is
    /// logged and reported as success, since the caller will observe the
    /// real state on its next recv.
    pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let frame = frame::encode(self.agent_id, payload)?;

        if self.stream.is_none() {
            let listener = self.ensure_listener()?;
            let (stream, _) = listener.accept().await?;
            debug!("pipe peer connected");
            self.stream = Some(stream);
            return self.write_frame(&frame).await.map_err(TransportError::Io);
        }

        match self.write_frame(&frame).await {
            Ok(()) => Ok(()),
            Err(e) if peer_gone(&e) => {
                warn!(error = %e, "pipe peer went away");
                self.stream = None;
                self.readbuf.clear();
                self.connected = false;
                Err(TransportError::PeerDisconnected)
            }
            Err(e) => {
                // The caller detects a real failure on the next recv.
                warn!(error = %e, "pipe write failed, continuing");
                Ok(())
            }
        }
    }

    /// Retrieve one already-arrived framed message.
    ///
    /// Returns `Ok(None)` when no complete frame header is buffered yet.
    /// A frame carrying a foreign agent id, or any read failure, marks the
    /// session disconnected and fails.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(stream) = self.stream.as_mut() else {
            self.connected = false;
            return Err(TransportError::PeerDisconnected);
        };

        let outcome = loop {
            match stream.try_read_buf(&mut self.readbuf) {
                Ok(0) => break Drain::Eof,
                Ok(_) => continue,
                Err(e) if e.kind() == ErrorKind::WouldBlock => break Drain::Idle,
                Err(e) => break Drain::Fatal(e),
            }
        };
        match outcome {
            Drain::Idle => {}
            Drain::Eof => {
                self.stream = None;
                self.readbuf.clear();
                self.connected = false;
                return Err(TransportError::PeerDisconnected);
            }
            Drain::Fatal(e) => {
                self.connected = false;
                return Err(e.into());
            }
        }

        if self.readbuf.len() < FRAME_HEADER_LEN {
            if !self.readbuf.is_empty() {
                debug!(buffered = self.readbuf.len(), "incomplete frame header on the pipe");
            }
            return Ok(None);
        }

        let header = frame::decode_header(&self.readbuf)?;
        if header.agent_id != self.agent_id {
            warn!(
                agent_id = header.agent_id,
                "rejecting frame addressed to another agent"
            );
            self.readbuf.clear();
            self.connected = false;
            return Err(TransportError::ForeignFrame {
                expected: self.agent_id,
                got: header.agent_id,
            });
        }
        self.readbuf.advance(FRAME_HEADER_LEN);

        let len = header.payload_len as usize;
        let mut payload = vec![0u8; len];
        let have = len.min(self.readbuf.len());
        payload[..have].copy_from_slice(&self.readbuf[..have]);
        self.readbuf.advance(have);

        if have < len {
            if let Some(stream) = self.stream.as_mut() {
                if let Err(e) = stream.read_exact(&mut payload[have..]).await {
                    warn!(error = %e, expected = len, "failed to read the frame payload");
                    self.readbuf.clear();
                    self.connected = false;
                    return Err(e.into());
                }
            }
        }

        Ok(Some(payload))
    }

    /// Bind the endpoint, replacing any stale socket file, and loosen its
    /// permissions so lower-privileged peers are not blocked. The loosening
    /// is best-effort: a failure only tightens connectivity.
    fn ensure_listener(&mut self) -> Result<&UnixListener> {
        if self.listener.is_none() {
            if self.config.path.exists() {
                if let Err(e) = std::fs::remove_file(&self.config.path) {
                    warn!(
                        path = %self.config.path.display(),
                        error = %e,
                        "could not remove stale pipe endpoint"
                    );
                }
            }

            let listener =
                UnixListener::bind(&self.config.path).map_err(|e| TransportError::SessionOpen {
                    reason: format!("bind {}: {e}", self.config.path.display()),
                })?;

            let perms = std::fs::Permissions::from_mode(0o666);
            if let Err(e) = std::fs::set_permissions(&self.config.path, perms) {
                warn!(error = %e, "could not loosen pipe endpoint permissions");
            }

            debug!(path = %self.config.path.display(), "pipe endpoint created");
            self.listener = Some(listener);
        }

        self.listener
            .as_ref()
            .ok_or_else(|| TransportError::SessionOpen {
                reason: "pipe endpoint missing".to_string(),
            })
    }

    async fn write_frame(&mut self, frame: &[u8]) -> std::io::Result<()> {
        let Some(stream) = self.stream.as_mut() else {
            return Err(std::io::Error::new(ErrorKind::NotConnected, "no pipe stream"));
        };
        stream.write_all(frame).await?;
        stream.flush().await
    }
}

fn peer_gone(e: &std::io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    const AGENT_ID: u32 = 0x4C4E4B01;

    fn sock_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("relink-pipe-{tag}-{}.sock", std::process::id()))
    }

    fn carrier(path: &PathBuf) -> PipeCarrier {
        PipeCarrier::new(PipeConfig { path: path.clone() }, AGENT_ID)
    }

    async fn connect_when_ready(path: &PathBuf) -> UnixStream {
        for _ in 0..200 {
            if path.exists() {
                if let Ok(stream) = UnixStream::connect(path).await {
                    return stream;
                }
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("pipe endpoint never appeared at {}", path.display());
    }

    async fn read_one_frame(stream: &mut UnixStream) -> (u32, Vec<u8>) {
        let mut header = [0u8; FRAME_HEADER_LEN];
        stream.read_exact(&mut header).await.unwrap();
        let header = frame::decode_header(&header).unwrap();
        let mut payload = vec![0u8; header.payload_len as usize];
        stream.read_exact(&mut payload).await.unwrap();
        (header.agent_id, payload)
    }

    #[tokio::test]
    async fn test_first_send_waits_for_peer_and_frames_message() {
        let path = sock_path("first-send");
        let mut carrier = carrier(&path);

        let peer = {
            let path = path.clone();
            tokio::spawn(async move {
                let mut stream = connect_when_ready(&path).await;
                read_one_frame(&mut stream).await
            })
        };

        carrier.send(b"hello controller").await.unwrap();
        let (id, payload) = peer.await.unwrap();
        assert_eq!(id, AGENT_ID);
        assert_eq!(payload, b"hello controller");

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o666);

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_stale_endpoint_is_replaced() {
        let path = sock_path("stale");
        std::fs::write(&path, b"stale").unwrap();

        let mut carrier = carrier(&path);
        let peer = {
            let path = path.clone();
            tokio::spawn(async move {
                let mut stream = connect_when_ready(&path).await;
                read_one_frame(&mut stream).await
            })
        };

        carrier.send(b"fresh").await.unwrap();
        let (_, payload) = peer.await.unwrap();
        assert_eq!(payload, b"fresh");

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_recv_round_trip() {
        let path = sock_path("recv");
        let mut carrier = carrier(&path);

        let peer = {
            let path = path.clone();
            tokio::spawn(async move {
                let mut stream = connect_when_ready(&path).await;
                let _ = read_one_frame(&mut stream).await;
                let job = frame::encode(AGENT_ID, b"run this").unwrap();
                stream.write_all(&job).await.unwrap();
                stream.flush().await.unwrap();
                // Hold the connection open until the test is done with it.
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
        };

        carrier.send(b"hello").await.unwrap();

        let payload = loop {
            match carrier.recv().await.unwrap() {
                Some(payload) => break payload,
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        };
        assert_eq!(payload, b"run this");

        peer.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_recv_with_nothing_buffered() {
        let path = sock_path("idle");
        let mut carrier = carrier(&path);

        let peer = {
            let path = path.clone();
            tokio::spawn(async move {
                let mut stream = connect_when_ready(&path).await;
                let _ = read_one_frame(&mut stream).await;
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
        };

        carrier.send(b"hello").await.unwrap();
        assert_eq!(carrier.recv().await.unwrap(), None);

        peer.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_recv_rejects_foreign_frame() {
        let path = sock_path("foreign");
        let mut carrier = carrier(&path);

        let peer = {
            let path = path.clone();
            tokio::spawn(async move {
                let mut stream = connect_when_ready(&path).await;
                let _ = read_one_frame(&mut stream).await;
                let foreign = frame::encode(AGENT_ID + 1, b"not yours").unwrap();
                stream.write_all(&foreign).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
        };

        carrier.send(b"hello").await.unwrap();
        carrier.set_connected(true);

        let err = loop {
            match carrier.recv().await {
                Ok(None) => tokio::time::sleep(Duration::from_millis(5)).await,
                Ok(Some(_)) => panic!("foreign frame must be rejected"),
                Err(e) => break e,
            }
        };
        assert!(matches!(
            err,
            TransportError::ForeignFrame { expected: AGENT_ID, .. }
        ));
        assert!(!carrier.connected());

        peer.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_recv_reassembles_split_frame() {
        let path = sock_path("split");
        let mut carrier = carrier(&path);

        let peer = {
            let path = path.clone();
            tokio::spawn(async move {
                let mut stream = connect_when_ready(&path).await;
                let _ = read_one_frame(&mut stream).await;
                let job = frame::encode(AGENT_ID, &[0xA5u8; 64]).unwrap();
                stream.write_all(&job[..20]).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_millis(50)).await;
                stream.write_all(&job[20..]).await.unwrap();
                stream.flush().await.unwrap();
                tokio::time::sleep(Duration::from_secs(5)).await;
            })
        };

        carrier.send(b"hello").await.unwrap();

        let payload = loop {
            match carrier.recv().await.unwrap() {
                Some(payload) => break payload,
                None => tokio::time::sleep(Duration::from_millis(5)).await,
            }
        };
        assert_eq!(payload, vec![0xA5u8; 64]);

        peer.abort();
        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_send_detects_departed_peer() {
        let path = sock_path("departed");
        let mut carrier = carrier(&path);

        let peer = {
            let path = path.clone();
            tokio::spawn(async move {
                let mut stream = connect_when_ready(&path).await;
                let _ = read_one_frame(&mut stream).await;
                // Peer drops the connection.
            })
        };

        carrier.send(b"hello").await.unwrap();
        carrier.set_connected(true);
        peer.await.unwrap();

        let mut result = Ok(());
        for _ in 0..10 {
            result = carrier.send(b"ping").await;
            if result.is_err() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(matches!(result, Err(TransportError::PeerDisconnected)));
        assert!(!carrier.connected());

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn test_recv_without_peer_fails() {
        let path = sock_path("no-peer");
        let mut carrier = carrier(&path);
        let err = carrier.recv().await.unwrap_err();
        assert!(matches!(err, TransportError::PeerDisconnected));
    }
}
