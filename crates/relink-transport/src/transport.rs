//! Carrier-agnostic transport facade.
//!
//! One `Transport` is constructed at startup from config and owned by the
//! top-level agent loop; it selects the carrier, performs the bootstrap
//! handshake and hands envelopes back and forth. Send and recv take
//! `&mut self`, so attempts on one transport never overlap.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::cipher::PayloadCipher;
use crate::config::{CarrierConfig, TransportConfig};
use crate::error::{Result, TransportError};
use crate::http::HttpCarrier;
use crate::identity::IdentityGuard;
use crate::pipe::PipeCarrier;

enum Carrier {
    Http(HttpCarrier),
    Pipe(PipeCarrier),
}

/// Transport context: the configured carrier plus its collaborators.
pub struct Transport {
    agent_id: u32,
    carrier: Carrier,
    cipher: Arc<dyn PayloadCipher>,
}

impl Transport {
    /// Build the transport for the configured carrier.
    pub fn new(
        config: TransportConfig,
        cipher: Arc<dyn PayloadCipher>,
        guard: Arc<dyn IdentityGuard>,
    ) -> Result<Self> {
        let carrier = match config.carrier {
            CarrierConfig::Http(http) => Carrier::Http(HttpCarrier::new(http, guard)?),
            CarrierConfig::Pipe(pipe) => Carrier::Pipe(PipeCarrier::new(pipe, config.agent_id)),
        };
        Ok(Transport {
            agent_id: config.agent_id,
            carrier,
            cipher,
        })
    }

    /// Bootstrap handshake.
    ///
    /// HTTP: sends `hello`, unwraps the response with the cipher and
    /// requires the leading word to be this agent's id — anything else
    /// means we are talking to something that does not know us. Pipe: a
    /// successful first send is itself sufficient, since it only completes
    /// once a peer has attached.
    pub async fn init(&mut self, hello: &[u8]) -> Result<()> {
        match &mut self.carrier {
            Carrier::Http(http) => {
                let response = http
                    .send(hello, true)
                    .await?
                    .ok_or(TransportError::HandshakeRejected)?;

                let mut response = response;
                self.cipher.apply(&mut response);

                let echoed = response
                    .get(0..4)
                    .map(|bytes| u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
                if echoed != Some(self.agent_id) {
                    warn!(?echoed, "controller handshake did not echo our id");
                    return Err(TransportError::HandshakeRejected);
                }

                http.set_connected(true);
                debug!("controller handshake accepted");
                Ok(())
            }
            Carrier::Pipe(pipe) => {
                pipe.send(hello).await?;
                pipe.set_connected(true);
                debug!("pipe handshake sent");
                Ok(())
            }
        }
    }

    /// Hand one envelope to the active carrier.
    ///
    /// With `want_response`, the HTTP carrier returns the response body
    /// (owned by the caller); without it, the body is discarded. The pipe
    /// carrier always returns `None` — its responses arrive separately via
    /// [`recv`](Self::recv).
    pub async fn send(&mut self, data: &[u8], want_response: bool) -> Result<Option<Vec<u8>>> {
        match &mut self.carrier {
            Carrier::Http(http) => http.send(data, want_response).await,
            Carrier::Pipe(pipe) => pipe.send(data).await.map(|_| None),
        }
    }

    /// Retrieve one already-arrived message from the pipe carrier;
    /// `Ok(None)` means nothing has arrived yet. Unsupported on HTTP.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        match &mut self.carrier {
            Carrier::Pipe(pipe) => pipe.recv().await,
            Carrier::Http(_) => Err(TransportError::Unsupported),
        }
    }

    /// Whether the session is considered live.
    pub fn connected(&self) -> bool {
        match &self.carrier {
            Carrier::Http(http) => http.connected(),
            Carrier::Pipe(pipe) => pipe.connected(),
        }
    }

    /// Whether the pipe-style recv surface is available.
    pub fn supports_recv(&self) -> bool {
        matches!(self.carrier, Carrier::Pipe(_))
    }

    /// False iff the carrier has run out of usable destinations; the
    /// decision to give up belongs to the caller.
    pub fn hosts_alive(&self) -> bool {
        match &self.carrier {
            Carrier::Http(http) => http.hosts_alive(),
            Carrier::Pipe(_) => true,
        }
    }
}
