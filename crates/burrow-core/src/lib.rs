//! Core of the burrow relay: per-client tunnel socket pools and their lifecycle.
//!
//! A remote client behind NAT dials one or more long-lived TCP connections
//! into a per-client acceptor. Those connections ("tunnel sockets") are pooled
//! by a [`TunnelAgent`] and borrowed, one at a time, to carry public HTTP
//! requests back to the client. A [`ClientSession`] owns one agent plus the
//! grace timer that reaps clients which never connect (or drop all sockets),
//! and the [`ClientRegistry`] maps subdomain ids to live sessions.

pub mod agent;
pub mod http_head;
pub mod port_alloc;
pub mod registry;
pub mod session;

pub use agent::{AgentError, AgentEvent, TunnelAgent, TunnelStream, DEFAULT_MAX_TCP_SOCKETS};
pub use http_head::{read_request_head, HeadError, RequestHead};
pub use port_alloc::{ExhaustedRange, PortAllocator, PortRangeError};
pub use registry::{ClientRegistry, NewClient, RegistryConfig};
pub use session::{ClientSession, DEFAULT_GRACE_PERIOD};
