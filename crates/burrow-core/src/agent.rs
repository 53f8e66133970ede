//! Per-client tunnel socket pool.
//!
//! A [`TunnelAgent`] owns a TCP acceptor that receives reverse connections
//! dialed by the remote client, parks them in an idle pool, and hands them
//! out one at a time to the proxy path via [`TunnelAgent::checkout`]. A
//! borrow that arrives before any socket parks as a waiter and is satisfied,
//! FIFO, by the next admitted socket. Waiters are always completed from a
//! separate task, never from inside the call that queued them.
//!
//! Lifecycle events ([`AgentEvent`]) are pushed to the owning session:
//! `Online` on the 0 to 1 socket transition, `Offline` when the last socket
//! drops, `Closed` when the agent is destroyed.

use std::collections::VecDeque;
use std::io;
use std::net::IpAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::port_alloc::{ExhaustedRange, PortAllocator};

/// Default cap on concurrently connected tunnel sockets per client.
pub const DEFAULT_MAX_TCP_SOCKETS: usize = 10;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("tunnel agent is closed")]
    AgentClosed,

    #[error("tunnel agent already started")]
    AlreadyStarted,

    #[error(transparent)]
    ExhaustedRange(#[from] ExhaustedRange),

    #[error("failed to bind tunnel acceptor: {0}")]
    Bind(#[source] io::Error),
}

/// Lifecycle notifications consumed by the owning session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentEvent {
    /// At least one tunnel socket is connected (0 to N transition).
    Online,
    /// The last tunnel socket dropped (N to 0 transition).
    Offline,
    /// The agent was destroyed; no more borrows will succeed.
    Closed,
}

/// An idle socket parked in the pool. The socket itself lives in a holder
/// task that watches for the remote end hanging up; claiming it through
/// `claim` transfers ownership to a borrower.
struct IdleSlot {
    id: u64,
    claim: oneshot::Sender<oneshot::Sender<TcpStream>>,
}

struct AgentState {
    started: bool,
    closed: bool,
    listen_port: Option<u16>,
    connected: usize,
    available: VecDeque<IdleSlot>,
    waiters: VecDeque<oneshot::Sender<TcpStream>>,
    next_socket_id: u64,
}

struct AgentInner {
    id: String,
    bind_ip: IpAddr,
    max_sockets: usize,
    ports: Arc<PortAllocator>,
    state: Mutex<AgentState>,
    events: mpsc::UnboundedSender<AgentEvent>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

/// Pool of reverse tunnel sockets for one client.
#[derive(Clone)]
pub struct TunnelAgent {
    inner: Arc<AgentInner>,
}

impl TunnelAgent {
    /// Create an agent for `id`. The returned receiver carries the agent's
    /// lifecycle events and is normally consumed by the owning session.
    pub fn new(
        id: &str,
        bind_ip: IpAddr,
        max_sockets: usize,
        ports: Arc<PortAllocator>,
    ) -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(AgentInner {
            id: id.to_string(),
            bind_ip,
            max_sockets,
            ports,
            state: Mutex::new(AgentState {
                started: false,
                closed: false,
                listen_port: None,
                connected: 0,
                available: VecDeque::new(),
                waiters: VecDeque::new(),
                next_socket_id: 0,
            }),
            events,
            accept_task: Mutex::new(None),
        });
        (Self { inner }, events_rx)
    }

    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Bind the acceptor and start admitting reverse connections.
    ///
    /// The port comes from the shared allocator when a range is configured,
    /// otherwise the OS assigns an ephemeral one. Returns the bound port.
    pub async fn listen(&self) -> Result<u16, AgentError> {
        {
            let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.closed {
                return Err(AgentError::AgentClosed);
            }
            if st.started {
                return Err(AgentError::AlreadyStarted);
            }
            st.started = true;
        }

        let acquired = self.inner.ports.acquire(&self.inner.id)?;
        let bind_port = acquired.unwrap_or(0);
        let listener = match TcpListener::bind((self.inner.bind_ip, bind_port)).await {
            Ok(l) => l,
            Err(e) => {
                if let Some(port) = acquired {
                    self.inner.ports.release(port);
                }
                return Err(AgentError::Bind(e));
            }
        };
        let port = listener.local_addr().map_err(AgentError::Bind)?.port();

        {
            let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            st.listen_port = Some(port);
        }

        info!(client = %self.inner.id, port, "tunnel acceptor listening");

        let inner = self.inner.clone();
        let handle = tokio::spawn(accept_loop(inner, listener));
        *self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner()) = Some(handle);

        Ok(port)
    }

    /// Borrow a tunnel socket.
    ///
    /// Hands out the oldest idle socket if one is available, otherwise parks
    /// until the remote client dials a new connection in. Fails immediately
    /// with [`AgentError::AgentClosed`] once the agent is destroyed; parked
    /// borrows fail the same way when destruction drains them.
    pub async fn checkout(&self) -> Result<TunnelStream, AgentError> {
        loop {
            let attempt = {
                let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
                if st.closed {
                    return Err(AgentError::AgentClosed);
                }
                match st.available.pop_front() {
                    Some(slot) => Attempt::Claim(slot),
                    None => {
                        let (tx, rx) = oneshot::channel();
                        st.waiters.push_back(tx);
                        Attempt::Wait(rx)
                    }
                }
            };

            match attempt {
                Attempt::Claim(slot) => {
                    let (reply_tx, reply_rx) = oneshot::channel();
                    if slot.claim.send(reply_tx).is_err() {
                        // Holder noticed the socket dying first; try another.
                        continue;
                    }
                    match reply_rx.await {
                        Ok(stream) => {
                            trace!(client = %self.inner.id, "handed out idle tunnel socket");
                            return Ok(TunnelStream::new(stream, self.inner.clone()));
                        }
                        Err(_) => continue,
                    }
                }
                Attempt::Wait(rx) => {
                    trace!(client = %self.inner.id, "no idle tunnel socket, parking borrower");
                    return match rx.await {
                        Ok(stream) => Ok(TunnelStream::new(stream, self.inner.clone())),
                        Err(_) => Err(AgentError::AgentClosed),
                    };
                }
            }
        }
    }

    /// Return a borrowed socket to the pool.
    ///
    /// For borrowers that end up not consuming the socket; the proxy path
    /// itself treats borrowed sockets as single-use. The socket goes to the
    /// oldest waiter if any, otherwise back into the idle pool.
    pub fn checkin(&self, mut socket: TunnelStream) {
        let Some(stream) = socket.stream.take() else {
            return;
        };
        let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.closed {
            self.inner.drop_connected(&mut st);
            return;
        }
        self.inner.place(&mut st, stream);
    }

    /// Number of currently connected tunnel sockets (idle plus handed out).
    pub fn connected_sockets(&self) -> usize {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .connected
    }

    pub fn listen_port(&self) -> Option<u16> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listen_port
    }

    /// Close the acceptor, fail every parked borrower, release the listen
    /// port and emit [`AgentEvent::Closed`]. Idempotent.
    pub fn destroy(&self) {
        let (waiters, idle, port) = {
            let mut st = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
            if st.closed {
                return;
            }
            st.closed = true;
            (
                std::mem::take(&mut st.waiters),
                std::mem::take(&mut st.available),
                st.listen_port,
            )
        };

        if let Some(handle) = self
            .inner
            .accept_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            handle.abort();
        }

        // The listen port goes back to the pool exactly when the acceptor
        // closes, never earlier (a misbehaving tunnel socket must not free a
        // port that is still bound).
        if let Some(port) = port {
            self.inner.ports.release(port);
        }

        // Dropping the waiter senders completes every parked checkout with
        // AgentClosed; dropping the idle slots shuts their holder tasks down.
        drop(waiters);
        drop(idle);

        let _ = self.inner.events.send(AgentEvent::Closed);
        info!(client = %self.inner.id, "tunnel agent destroyed");
    }
}

enum Attempt {
    Claim(IdleSlot),
    Wait(oneshot::Receiver<TcpStream>),
}

impl AgentInner {
    /// Admit a freshly accepted reverse connection.
    fn admit(self: &Arc<Self>, stream: TcpStream) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if st.closed {
            return;
        }
        if st.connected >= self.max_sockets {
            debug!(
                client = %self.id,
                max = self.max_sockets,
                "tunnel socket limit reached, rejecting connection"
            );
            return;
        }

        st.connected += 1;
        if st.connected == 1 {
            info!(client = %self.id, "client online");
            let _ = self.events.send(AgentEvent::Online);
        }

        self.place(&mut st, stream);
    }

    /// Hand `stream` to the oldest live waiter, or park it in the idle pool.
    fn place(self: &Arc<Self>, st: &mut AgentState, mut stream: TcpStream) {
        while let Some(waiter) = st.waiters.pop_front() {
            match waiter.send(stream) {
                Ok(()) => return,
                // Borrower gave up before a socket arrived; try the next one.
                Err(s) => stream = s,
            }
        }

        let sid = st.next_socket_id;
        st.next_socket_id += 1;
        let (claim_tx, claim_rx) = oneshot::channel();
        st.available.push_back(IdleSlot {
            id: sid,
            claim: claim_tx,
        });
        tokio::spawn(hold_idle(self.clone(), sid, stream, claim_rx));
    }

    /// An idle socket died or was discarded before delivery.
    fn forget_idle(&self, sid: u64) {
        let mut st = self.state.lock().unwrap_or_else(|e| e.into_inner());
        st.available.retain(|slot| slot.id != sid);
        self.drop_connected(&mut st);
    }

    fn drop_connected(&self, st: &mut AgentState) {
        st.connected = st.connected.saturating_sub(1);
        if st.connected == 0 && !st.closed {
            info!(client = %self.id, "client offline");
            let _ = self.events.send(AgentEvent::Offline);
        }
    }
}

async fn accept_loop(inner: Arc<AgentInner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                trace!(client = %inner.id, %peer, "reverse connection accepted");
                inner.admit(stream);
            }
            Err(e) => match e.kind() {
                // Routine for remote clients going away mid-handshake.
                io::ErrorKind::ConnectionReset
                | io::ErrorKind::ConnectionAborted
                | io::ErrorKind::TimedOut => continue,
                _ => {
                    warn!(client = %inner.id, error = %e, "tunnel acceptor error");
                }
            },
        }
    }
}

enum IdleOutcome {
    Claimed(oneshot::Sender<TcpStream>),
    ClaimDropped,
    Dead,
    EarlyData,
}

/// Owns an idle socket until it is claimed by a borrower or the remote end
/// hangs up. A socket that sends bytes before being borrowed keeps them in
/// the kernel buffer for whoever claims it.
async fn hold_idle(
    inner: Arc<AgentInner>,
    sid: u64,
    stream: TcpStream,
    mut claim_rx: oneshot::Receiver<oneshot::Sender<TcpStream>>,
) {
    let mut monitor = true;
    loop {
        let outcome = if monitor {
            let mut probe = [0u8; 1];
            tokio::select! {
                biased;
                claimed = &mut claim_rx => match claimed {
                    Ok(reply) => IdleOutcome::Claimed(reply),
                    Err(_) => IdleOutcome::ClaimDropped,
                },
                peeked = stream.peek(&mut probe) => match peeked {
                    Ok(0) | Err(_) => IdleOutcome::Dead,
                    Ok(_) => IdleOutcome::EarlyData,
                },
            }
        } else {
            match (&mut claim_rx).await {
                Ok(reply) => IdleOutcome::Claimed(reply),
                Err(_) => IdleOutcome::ClaimDropped,
            }
        };

        match outcome {
            IdleOutcome::Claimed(reply) => {
                if reply.send(stream).is_err() {
                    // The borrower vanished between claiming and receiving.
                    inner.forget_idle(sid);
                }
                return;
            }
            IdleOutcome::ClaimDropped | IdleOutcome::Dead => {
                inner.forget_idle(sid);
                return;
            }
            IdleOutcome::EarlyData => {
                monitor = false;
            }
        }
    }
}

/// A borrowed tunnel socket. Dropping it counts the socket as closed and may
/// take the agent offline.
pub struct TunnelStream {
    stream: Option<TcpStream>,
    agent: Arc<AgentInner>,
}

impl TunnelStream {
    fn new(stream: TcpStream, agent: Arc<AgentInner>) -> Self {
        Self {
            stream: Some(stream),
            agent,
        }
    }

    pub fn peer_addr(&self) -> Option<std::net::SocketAddr> {
        self.stream.as_ref().and_then(|s| s.peer_addr().ok())
    }
}

impl Drop for TunnelStream {
    fn drop(&mut self) {
        if self.stream.is_some() {
            let mut st = self.agent.state.lock().unwrap_or_else(|e| e.into_inner());
            self.agent.drop_connected(&mut st);
        }
    }
}

fn gone() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "tunnel socket already taken")
}

impl AsyncRead for TunnelStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(s) => Pin::new(s).poll_read(cx, buf),
            None => Poll::Ready(Err(gone())),
        }
    }
}

impl AsyncWrite for TunnelStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        data: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.stream.as_mut() {
            Some(s) => Pin::new(s).poll_write(cx, data),
            None => Poll::Ready(Err(gone())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(s) => Pin::new(s).poll_flush(cx),
            None => Poll::Ready(Err(gone())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.stream.as_mut() {
            Some(s) => Pin::new(s).poll_shutdown(cx),
            None => Poll::Ready(Err(gone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn test_agent(max: usize) -> (TunnelAgent, mpsc::UnboundedReceiver<AgentEvent>) {
        let ports = Arc::new(PortAllocator::new(None).unwrap());
        TunnelAgent::new("test-client", IpAddr::V4(Ipv4Addr::LOCALHOST), max, ports)
    }

    #[tokio::test]
    async fn test_listen_twice_fails() {
        let (agent, _events) = test_agent(2);
        agent.listen().await.unwrap();
        assert!(matches!(
            agent.listen().await,
            Err(AgentError::AlreadyStarted)
        ));
    }

    #[tokio::test]
    async fn test_checkout_after_destroy_fails_immediately() {
        let (agent, _events) = test_agent(2);
        agent.listen().await.unwrap();
        agent.destroy();
        assert!(matches!(
            agent.checkout().await,
            Err(AgentError::AgentClosed)
        ));
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent_and_releases_port() {
        let ports = Arc::new(PortAllocator::new(Some("29500:29500")).unwrap());
        let (agent, _events) = TunnelAgent::new(
            "test-client",
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            2,
            ports.clone(),
        );
        let port = agent.listen().await.unwrap();
        assert_eq!(port, 29500);
        assert!(ports.acquire("other").is_err());

        agent.destroy();
        agent.destroy();
        assert_eq!(ports.acquire("other").unwrap(), Some(29500));
    }

    #[tokio::test]
    async fn test_stats_start_at_zero() {
        let (agent, _events) = test_agent(2);
        assert_eq!(agent.connected_sockets(), 0);
        assert_eq!(agent.listen_port(), None);
        let port = agent.listen().await.unwrap();
        assert_eq!(agent.listen_port(), Some(port));
    }
}
