//! One client's session: a tunnel agent, its subdomain id, the grace timer
//! and the proxy operations that move public traffic onto borrowed sockets.
//!
//! A session reaps itself when no tunnel socket shows up within the grace
//! period, measured from construction and re-armed every time the agent goes
//! offline. The reaper runs as a plain tokio task; it never keeps the
//! process alive on its own.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::agent::{AgentEvent, TunnelAgent};
use crate::http_head::{write_raw_status, RequestHead};

/// How long a session may sit without any tunnel socket before it is reaped.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_millis(1000);

struct SessionInner {
    id: String,
    secret: Option<String>,
    agent: TunnelAgent,
    closed: AtomicBool,
}

/// A subdomain id bound to one [`TunnelAgent`].
#[derive(Clone)]
pub struct ClientSession {
    inner: Arc<SessionInner>,
}

impl ClientSession {
    /// Wrap `agent` in a session and start the grace reaper.
    ///
    /// `events` must be the receiver returned by [`TunnelAgent::new`] for
    /// this agent. `on_reap` fires at most once, when the grace period
    /// elapses with no socket online; the caller uses it to drop the session
    /// from its registry.
    pub fn new<F>(
        id: String,
        secret: Option<String>,
        agent: TunnelAgent,
        events: mpsc::UnboundedReceiver<AgentEvent>,
        grace: Duration,
        on_reap: F,
    ) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let session = Self {
            inner: Arc::new(SessionInner {
                id,
                secret,
                agent,
                closed: AtomicBool::new(false),
            }),
        };
        session.spawn_reaper(events, grace, on_reap);
        session
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn agent(&self) -> &TunnelAgent {
        &self.inner.agent
    }

    pub fn connected_sockets(&self) -> usize {
        self.inner.agent.connected_sockets()
    }

    /// The grace timer starts armed so a client that never dials back is
    /// reaped; `Online` disarms it and every `Offline` re-arms it.
    fn spawn_reaper<F>(&self, mut events: mpsc::UnboundedReceiver<AgentEvent>, grace: Duration, on_reap: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let id = self.inner.id.clone();
        tokio::spawn(async move {
            let mut deadline = Some(Instant::now() + grace);
            let reap = loop {
                match deadline {
                    Some(at) => {
                        tokio::select! {
                            _ = tokio::time::sleep_until(at) => break true,
                            event = events.recv() => match event {
                                Some(AgentEvent::Online) => deadline = None,
                                Some(AgentEvent::Offline) => deadline = Some(Instant::now() + grace),
                                Some(AgentEvent::Closed) | None => break false,
                            },
                        }
                    }
                    None => match events.recv().await {
                        Some(AgentEvent::Online) => {}
                        Some(AgentEvent::Offline) => deadline = Some(Instant::now() + grace),
                        Some(AgentEvent::Closed) | None => break false,
                    },
                }
            };
            if reap {
                info!(client = %id, "no tunnel socket within grace period, reaping session");
                on_reap();
            }
        });
    }

    /// Forward one public HTTP connection through a borrowed tunnel socket.
    ///
    /// The request head is rewritten byte-for-byte (method, path and headers
    /// verbatim) followed by whatever body bytes were buffered, then both
    /// directions stream until either side closes. If the tunnel fails
    /// before producing any response byte the caller gets a 502; after that
    /// the response is simply cut short.
    pub async fn proxy_http_request(&self, head: &RequestHead, buffered: &[u8], mut public: TcpStream) {
        debug!(client = %self.inner.id, method = %head.method, path = %head.path, "proxying request");

        let tunnel = match self.inner.agent.checkout().await {
            Ok(t) => t,
            Err(e) => {
                debug!(client = %self.inner.id, error = %e, "no tunnel socket for request");
                let _ = write_raw_status(
                    &mut public,
                    502,
                    "Bad Gateway",
                    "text/plain",
                    "tunnel unavailable",
                )
                .await;
                return;
            }
        };

        let mut request = head.to_bytes();
        request.extend_from_slice(&buffered[head.header_len..]);

        let (mut tunnel_read, mut tunnel_write) = tokio::io::split(tunnel);
        if tunnel_write.write_all(&request).await.is_err() {
            let _ = write_raw_status(
                &mut public,
                502,
                "Bad Gateway",
                "text/plain",
                "tunnel write failed",
            )
            .await;
            return;
        }

        // Set the moment any response byte is relayed; checked after the
        // pump regardless of which direction ended it, so a tunnel that
        // dies while the client is still streaming its body (write failure
        // rather than read EOF) still surfaces a 502.
        let response_started = AtomicBool::new(false);

        let tunnel_ended = {
            let (mut public_read, mut public_write) = public.split();

            // Resolves true when the tunnel side gave out, false when the
            // public client did.
            let client_to_tunnel = async {
                let mut buf = [0u8; 8192];
                loop {
                    match public_read.read(&mut buf).await {
                        Ok(0) | Err(_) => break false,
                        Ok(n) => {
                            if tunnel_write.write_all(&buf[..n]).await.is_err() {
                                break true;
                            }
                        }
                    }
                }
            };

            let tunnel_to_client = async {
                let mut buf = [0u8; 8192];
                loop {
                    match tunnel_read.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            response_started.store(true, Ordering::Relaxed);
                            if public_write.write_all(&buf[..n]).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            };

            tokio::select! {
                tunnel_write_failed = client_to_tunnel => tunnel_write_failed,
                _ = tunnel_to_client => true,
            }
        };

        if tunnel_ended && !response_started.load(Ordering::Relaxed) {
            // Tunnel died before a single response byte; the caller can
            // still be told.
            let _ = write_raw_status(
                &mut public,
                502,
                "Bad Gateway",
                "text/plain",
                "tunnel closed before responding",
            )
            .await;
        }
        let _ = public.shutdown().await;
    }

    /// Forward an HTTP upgrade (e.g. WebSocket) through a borrowed socket.
    ///
    /// The handshake is reconstructed from the raw header list, so casing
    /// and ordering reach the client byte-for-byte, then the two sockets are
    /// spliced with close propagation in both directions. Borrow failure
    /// ends the public socket without a response.
    pub async fn proxy_http_upgrade(&self, head: &RequestHead, buffered: &[u8], mut public: TcpStream) {
        debug!(client = %self.inner.id, path = %head.path, "proxying upgrade");

        let mut tunnel = match self.inner.agent.checkout().await {
            Ok(t) => t,
            Err(e) => {
                debug!(client = %self.inner.id, error = %e, "no tunnel socket for upgrade");
                let _ = public.shutdown().await;
                return;
            }
        };

        let mut handshake = head.to_bytes();
        handshake.extend_from_slice(&buffered[head.header_len..]);
        if tunnel.write_all(&handshake).await.is_err() {
            let _ = public.shutdown().await;
            return;
        }

        match tokio::io::copy_bidirectional(&mut public, &mut tunnel).await {
            Ok((up, down)) => {
                debug!(client = %self.inner.id, up, down, "upgrade connection closed");
            }
            Err(e) => {
                debug!(client = %self.inner.id, error = %e, "upgrade connection errored");
            }
        }
    }

    /// Weak identity check gating the kill endpoint.
    ///
    /// Compares the `name` claim of the stored secret against the supplied
    /// bearer token, decoding both as JWT payloads *without* verifying
    /// signatures. This is a same-logical-identity check, not
    /// authentication. Any decode failure, a missing claim, or an absent
    /// stored secret yields `false`.
    pub fn is_authorized(&self, bearer_token: &str) -> bool {
        let Some(secret) = self.inner.secret.as_deref() else {
            return false;
        };
        match (jwt_name_claim(secret), jwt_name_claim(bearer_token)) {
            (Some(expected), Some(supplied)) => expected == supplied,
            _ => false,
        }
    }

    /// Destroy the agent and mark the session closed. Returns `true` the
    /// first time, `false` on every later call.
    pub fn close(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.inner.agent.destroy();
        info!(client = %self.inner.id, "session closed");
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}

/// Pull the `name` claim out of an *unverified* JWT payload.
fn jwt_name_claim(token: &str) -> Option<String> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("name")?.as_str().map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port_alloc::PortAllocator;
    use std::net::{IpAddr, Ipv4Addr};

    fn unsigned_jwt(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).unwrap());
        format!("{header}.{payload}.sig")
    }

    fn session_with_secret(secret: Option<String>) -> ClientSession {
        let ports = Arc::new(PortAllocator::new(None).unwrap());
        let (agent, events) =
            TunnelAgent::new("authtest", IpAddr::V4(Ipv4Addr::LOCALHOST), 2, ports);
        ClientSession::new(
            "authtest".to_string(),
            secret,
            agent,
            events,
            Duration::from_secs(60),
            || {},
        )
    }

    #[tokio::test]
    async fn test_is_authorized_matching_name() {
        let secret = unsigned_jwt(&serde_json::json!({ "name": "alice" }));
        let session = session_with_secret(Some(secret));

        let token = unsigned_jwt(&serde_json::json!({ "name": "alice", "iat": 1 }));
        assert!(session.is_authorized(&token));
    }

    #[tokio::test]
    async fn test_is_authorized_mismatched_name() {
        let secret = unsigned_jwt(&serde_json::json!({ "name": "alice" }));
        let session = session_with_secret(Some(secret));

        let token = unsigned_jwt(&serde_json::json!({ "name": "bob" }));
        assert!(!session.is_authorized(&token));
    }

    #[tokio::test]
    async fn test_is_authorized_rejects_garbage() {
        let secret = unsigned_jwt(&serde_json::json!({ "name": "alice" }));
        let session = session_with_secret(Some(secret));

        assert!(!session.is_authorized("not-a-jwt"));
        assert!(!session.is_authorized("a.b.c"));
        assert!(!session.is_authorized(""));
    }

    #[tokio::test]
    async fn test_is_authorized_without_secret() {
        let session = session_with_secret(None);
        let token = unsigned_jwt(&serde_json::json!({ "name": "alice" }));
        assert!(!session.is_authorized(&token));
    }

    #[tokio::test]
    async fn test_is_authorized_missing_name_claim() {
        let secret = unsigned_jwt(&serde_json::json!({ "sub": "alice" }));
        let session = session_with_secret(Some(secret));
        let token = unsigned_jwt(&serde_json::json!({ "sub": "alice" }));
        assert!(!session.is_authorized(&token));
    }

    #[tokio::test]
    async fn test_close_fires_once() {
        let session = session_with_secret(None);
        assert!(!session.is_closed());
        assert!(session.close());
        assert!(!session.close());
        assert!(session.is_closed());
    }
}
