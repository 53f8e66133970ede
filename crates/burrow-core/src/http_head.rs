//! HTTP/1.x request head parsing for the ingress data path.
//!
//! The dispatcher only needs the request line and headers to route a
//! connection; everything after the head is relayed verbatim. Header names
//! keep their original casing and order so a proxied request (in particular a
//! WebSocket handshake) can be reconstructed byte-for-byte.

use std::io;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum number of headers to parse.
const MAX_HEADERS: usize = 100;

/// Upper bound on the request line plus headers.
const MAX_HEAD_BYTES: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum HeadError {
    #[error("io error while reading request head: {0}")]
    Io(#[from] io::Error),

    #[error("malformed request head: {0}")]
    Malformed(String),

    #[error("request head exceeds {MAX_HEAD_BYTES} bytes")]
    TooLarge,

    #[error("connection closed before the request head was complete")]
    Truncated,
}

/// A parsed request line and header block, with raw header casing and order.
#[derive(Debug, Clone)]
pub struct RequestHead {
    pub method: String,
    pub path: String,
    /// Minor HTTP/1.x version (0 or 1).
    pub version: u8,
    pub headers: Vec<(String, String)>,
    /// Bytes consumed by the head, including the terminating `\r\n\r\n`.
    pub header_len: usize,
}

impl RequestHead {
    /// Parse a head out of `buf`. Returns `Ok(None)` while the head is still
    /// incomplete.
    pub fn parse(buf: &[u8]) -> Result<Option<Self>, HeadError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);

        match req.parse(buf) {
            Ok(httparse::Status::Complete(header_len)) => {
                let method = req.method.unwrap_or("").to_string();
                let path = req.path.unwrap_or("").to_string();
                let version = req.version.unwrap_or(1);

                let parsed = req
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).to_string(),
                        )
                    })
                    .collect();

                Ok(Some(Self {
                    method,
                    path,
                    version,
                    headers: parsed,
                    header_len,
                }))
            }
            Ok(httparse::Status::Partial) => Ok(None),
            Err(e) => Err(HeadError::Malformed(e.to_string())),
        }
    }

    /// First `Host` header value, if present.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("host"))
            .map(|(_, value)| value.as_str())
    }

    /// Whether this request asks for a protocol upgrade (e.g. WebSocket).
    pub fn is_upgrade(&self) -> bool {
        let connection_upgrade = self.headers.iter().any(|(name, value)| {
            name.eq_ignore_ascii_case("connection") && value.to_ascii_lowercase().contains("upgrade")
        });
        let has_upgrade = self
            .headers
            .iter()
            .any(|(name, _)| name.eq_ignore_ascii_case("upgrade"));
        connection_upgrade && has_upgrade
    }

    /// Serialize the head back to wire form, preserving header casing and
    /// order: `METHOD PATH HTTP/1.V\r\nName: value\r\n...\r\n\r\n`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header_len);
        out.extend_from_slice(
            format!("{} {} HTTP/1.{}\r\n", self.method, self.path, self.version).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        out
    }
}

/// Read from `stream` until a full request head is buffered.
///
/// Returns the parsed head together with everything read so far (the head
/// bytes plus any body prefix that arrived in the same segments). `Ok(None)`
/// means the peer closed the connection before sending anything.
pub async fn read_request_head<S>(stream: &mut S) -> Result<Option<(RequestHead, Vec<u8>)>, HeadError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(HeadError::Truncated);
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(head) = RequestHead::parse(&buf)? {
            return Ok(Some((head, buf)));
        }
        if buf.len() > MAX_HEAD_BYTES {
            return Err(HeadError::TooLarge);
        }
    }
}

/// Write a minimal one-shot HTTP/1.1 response straight onto a socket.
///
/// For error paths on connections that never reach a proxied backend
/// (missing host, unknown client, dead tunnel).
pub async fn write_raw_status<W>(
    writer: &mut W,
    status: u16,
    reason: &str,
    content_type: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    writer.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_request() {
        let head = RequestHead::parse(b"GET /path HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .unwrap()
            .unwrap();
        assert_eq!(head.method, "GET");
        assert_eq!(head.path, "/path");
        assert_eq!(head.version, 1);
        assert_eq!(head.host(), Some("example.com"));
        assert!(!head.is_upgrade());
    }

    #[test]
    fn test_parse_partial_request() {
        assert!(RequestHead::parse(b"GET /path HTTP/1.1\r\nHost: exa")
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_malformed_request() {
        assert!(RequestHead::parse(b"not http at all\r\n\r\n").is_err());
    }

    #[test]
    fn test_upgrade_detection() {
        let head = RequestHead::parse(
            b"GET /chat HTTP/1.1\r\nHost: a.example.com\r\nConnection: keep-alive, Upgrade\r\nUpgrade: websocket\r\n\r\n",
        )
        .unwrap()
        .unwrap();
        assert!(head.is_upgrade());
    }

    #[test]
    fn test_to_bytes_preserves_casing_and_order() {
        let raw = b"GET /chat HTTP/1.1\r\nHoSt: a.example.com\r\nUpGrAdE: websocket\r\nConNecTion: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZQ==\r\n\r\n";
        let head = RequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(head.to_bytes(), raw.to_vec());
    }

    #[test]
    fn test_header_len_marks_body_start() {
        let raw = b"POST /api HTTP/1.1\r\nHost: x.example.com\r\nContent-Length: 5\r\n\r\nhello";
        let head = RequestHead::parse(raw).unwrap().unwrap();
        assert_eq!(&raw[head.header_len..], b"hello");
    }

    #[tokio::test]
    async fn test_read_request_head_across_segments() {
        let (mut client, mut server) = tokio::io::duplex(256);

        tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            client.write_all(b"GET / HTTP/1.1\r\nHo").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            client
                .write_all(b"st: example.com\r\n\r\npartial-body")
                .await
                .unwrap();
        });

        let (head, buffered) = read_request_head(&mut server).await.unwrap().unwrap();
        assert_eq!(head.host(), Some("example.com"));
        assert_eq!(&buffered[head.header_len..], b"partial-body");
    }

    #[tokio::test]
    async fn test_read_request_head_on_immediate_close() {
        let (client, mut server) = tokio::io::duplex(256);
        drop(client);
        assert!(read_request_head(&mut server).await.unwrap().is_none());
    }
}
