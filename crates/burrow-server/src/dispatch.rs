//! Public ingress: one TCP listener for all tunnel and admin traffic.
//!
//! Each connection's request head is sniffed once. Requests whose `Host`
//! carries a subdomain of the base domain are handed to the matching client
//! session (as a plain request or an upgrade); everything else is replayed
//! into the admin router over the same socket.

use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tower::Service;
use tracing::{debug, error, info};

use burrow_core::http_head::{read_request_head, write_raw_status};
use burrow_core::ClientRegistry;

#[derive(Debug, Error)]
pub enum IngressError {
    #[error("failed to bind public listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// The public listener plus everything needed to route a connection.
pub struct IngressServer {
    domain: String,
    registry: Arc<ClientRegistry>,
    admin: Router,
    listener: TcpListener,
}

impl IngressServer {
    pub async fn bind(
        addr: SocketAddr,
        domain: String,
        registry: Arc<ClientRegistry>,
        admin: Router,
    ) -> Result<Self, IngressError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| IngressError::Bind { addr, source })?;
        info!(%addr, domain = %domain, "public ingress listening");
        Ok(Self {
            domain,
            registry,
            admin,
            listener,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IngressError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept public connections until the task is dropped.
    pub async fn run(self) -> Result<(), IngressError> {
        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let domain = self.domain.clone();
                    let registry = self.registry.clone();
                    let admin = self.admin.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, peer, domain, registry, admin).await;
                    });
                }
                Err(e) => {
                    error!(error = %e, "failed to accept public connection");
                }
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    domain: String,
    registry: Arc<ClientRegistry>,
    admin: Router,
) {
    let (head, buffered) = match read_request_head(&mut stream).await {
        Ok(Some(parts)) => parts,
        Ok(None) => return,
        Err(e) => {
            debug!(%peer, error = %e, "unreadable request head");
            let _ = write_raw_status(&mut stream, 400, "Bad Request", "text/plain", "malformed request").await;
            return;
        }
    };

    let Some(host) = head.host() else {
        debug!(%peer, "request without Host header");
        let _ = write_raw_status(
            &mut stream,
            400,
            "Bad Request",
            "text/plain",
            "Host header is required",
        )
        .await;
        return;
    };

    let client_id = client_id_from_host(host, &domain);
    match client_id {
        None => serve_admin(stream, buffered, admin).await,
        Some(id) => match registry.get_client(&id) {
            Some(session) => {
                if head.is_upgrade() {
                    session.proxy_http_upgrade(&head, &buffered, stream).await;
                } else {
                    session.proxy_http_request(&head, &buffered, stream).await;
                }
            }
            None => {
                debug!(%peer, client = %id, "request for unknown client");
                if !head.is_upgrade() {
                    let _ = write_raw_status(
                        &mut stream,
                        404,
                        "Not Found",
                        "application/json",
                        r#"{"message":"Client not found"}"#,
                    )
                    .await;
                }
                // Upgrades to unknown clients are closed without a response.
            }
        },
    }
}

/// Subdomain label below `domain` in a Host header, port stripped.
///
/// `foo.example.com` yields `foo`; for deeper names the leftmost label wins.
/// The bare domain and hosts outside it yield `None` (admin traffic).
fn client_id_from_host(host: &str, domain: &str) -> Option<String> {
    let hostname = host.split(':').next().unwrap_or(host).to_ascii_lowercase();
    let domain = domain.to_ascii_lowercase();

    let labels = hostname.strip_suffix(&domain)?.strip_suffix('.')?;
    if labels.is_empty() {
        return None;
    }
    labels.split('.').next().map(str::to_owned)
}

/// Serve the already-sniffed connection with the admin router, replaying the
/// buffered head bytes so hyper sees the request from its first byte.
async fn serve_admin(stream: TcpStream, buffered: Vec<u8>, admin: Router) {
    let io = TokioIo::new(ReplayStream::new(stream, buffered));
    let service = service_fn(move |request: hyper::Request<Incoming>| {
        let mut router = admin.clone();
        router.call(request.map(Body::new))
    });

    if let Err(e) = hyper::server::conn::http1::Builder::new()
        .serve_connection(io, service)
        .await
    {
        debug!(error = %e, "admin connection ended with error");
    }
}

/// A socket whose first reads are served from an in-memory prefix, used to
/// hand an already-sniffed connection to an HTTP server.
struct ReplayStream {
    stream: TcpStream,
    prefix: Vec<u8>,
    offset: usize,
}

impl ReplayStream {
    fn new(stream: TcpStream, prefix: Vec<u8>) -> Self {
        Self {
            stream,
            prefix,
            offset: 0,
        }
    }
}

impl AsyncRead for ReplayStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        if self.offset < self.prefix.len() && buf.remaining() > 0 {
            let n = (self.prefix.len() - self.offset).min(buf.remaining());
            let start = self.offset;
            buf.put_slice(&self.prefix[start..start + n]);
            self.offset += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for ReplayStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_from_subdomain() {
        assert_eq!(
            client_id_from_host("myapp.example.com", "example.com"),
            Some("myapp".to_string())
        );
        assert_eq!(
            client_id_from_host("myapp.example.com:8080", "example.com"),
            Some("myapp".to_string())
        );
        assert_eq!(
            client_id_from_host("MyApp.Example.COM", "example.com"),
            Some("myapp".to_string())
        );
    }

    #[test]
    fn test_client_id_deep_subdomain_uses_leftmost_label() {
        assert_eq!(
            client_id_from_host("a.b.example.com", "example.com"),
            Some("a".to_string())
        );
    }

    #[test]
    fn test_bare_domain_is_admin_traffic() {
        assert_eq!(client_id_from_host("example.com", "example.com"), None);
        assert_eq!(client_id_from_host("example.com:8080", "example.com"), None);
    }

    #[test]
    fn test_foreign_hosts_are_admin_traffic() {
        assert_eq!(client_id_from_host("other.net", "example.com"), None);
        // A suffix match without a dot boundary is not a subdomain
        assert_eq!(client_id_from_host("fooexample.com", "example.com"), None);
    }
}
