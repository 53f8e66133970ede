//! Process-wide map from subdomain id to live client session.
//!
//! The registry creates sessions (allocating their acceptor port through the
//! shared [`PortAllocator`]), looks them up for the dispatcher, and removes
//! them when they are killed or reaped. Ids are reserved in the map *before*
//! the acceptor starts so two concurrent requests can never race the same
//! label.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use rand::seq::SliceRandom;
use tracing::{info, warn};

use crate::agent::{AgentError, TunnelAgent, DEFAULT_MAX_TCP_SOCKETS};
use crate::port_alloc::PortAllocator;
use crate::session::{ClientSession, DEFAULT_GRACE_PERIOD};

/// Word lists for random human-readable ids, `{adj}-{adj}-{animal}`.
static ADJECTIVES: &[&str] = &[
    "angry", "bitter", "breezy", "calm", "clever", "cloudy", "cuddly", "dusty", "eager", "fancy",
    "fuzzy", "gentle", "giant", "happy", "hungry", "itchy", "jolly", "lucky", "mighty", "nifty",
    "odd", "polite", "proud", "quick", "quiet", "rotten", "shiny", "sleepy", "tame", "witty",
];
static ANIMALS: &[&str] = &[
    "badger", "beaver", "bobcat", "coyote", "donkey", "falcon", "ferret", "gopher", "heron",
    "impala", "jackal", "lizard", "marmot", "monkey", "osprey", "otter", "panda", "rabbit",
    "racoon", "shrimp", "spider", "toucan", "turtle", "walrus", "weasel", "wombat",
];

/// Registry-wide settings applied to every session it creates.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Cap on concurrent tunnel sockets per client.
    pub max_tcp_sockets: usize,
    /// Shared JWT whose `name` claim gates the kill endpoint.
    pub secret: Option<String>,
    /// Address tunnel acceptors bind on.
    pub bind_ip: IpAddr,
    /// Grace period before a socketless session is reaped.
    pub grace: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_tcp_sockets: DEFAULT_MAX_TCP_SOCKETS,
            secret: None,
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            grace: DEFAULT_GRACE_PERIOD,
        }
    }
}

/// What a newly created client needs to dial back.
#[derive(Debug, Clone)]
pub struct NewClient {
    pub id: String,
    /// Port of the per-client tunnel acceptor.
    pub port: u16,
    pub max_conn_count: usize,
}

pub struct ClientRegistry {
    clients: RwLock<HashMap<String, ClientSession>>,
    ports: Arc<PortAllocator>,
    config: RegistryConfig,
    tunnels: AtomicUsize,
}

impl ClientRegistry {
    pub fn new(ports: Arc<PortAllocator>, config: RegistryConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            ports,
            config,
            tunnels: AtomicUsize::new(0),
        })
    }

    /// Create a session and start its tunnel acceptor.
    ///
    /// An empty or already-taken requested id is replaced with a random
    /// human-readable one. Choosing the id and inserting the session happen
    /// under one lock, so a concurrent request for the same label sees it as
    /// taken before the acceptor even starts; if the acceptor then fails the
    /// entry is removed again and the error surfaces.
    pub async fn new_client(
        self: &Arc<Self>,
        requested_id: Option<&str>,
    ) -> Result<NewClient, AgentError> {
        let (id, session) = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());

            let id = match requested_id {
                Some(id) if !id.is_empty() && !clients.contains_key(id) => id.to_string(),
                _ => random_unused_id(&clients),
            };

            let (agent, events) = TunnelAgent::new(
                &id,
                self.config.bind_ip,
                self.config.max_tcp_sockets,
                self.ports.clone(),
            );

            let registry = Arc::downgrade(self);
            let reap_id = id.clone();
            let session = ClientSession::new(
                id.clone(),
                self.config.secret.clone(),
                agent,
                events,
                self.config.grace,
                move || {
                    if let Some(registry) = registry.upgrade() {
                        registry.remove_client(&reap_id);
                    }
                },
            );

            clients.insert(id.clone(), session.clone());
            (id, session)
        };

        match session.agent().listen().await {
            Ok(port) => {
                self.tunnels.fetch_add(1, Ordering::SeqCst);
                info!(client = %id, port, "client registered");
                Ok(NewClient {
                    id,
                    port,
                    max_conn_count: self.config.max_tcp_sockets,
                })
            }
            Err(e) => {
                warn!(client = %id, error = %e, "failed to start tunnel acceptor");
                let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
                clients.remove(&id);
                drop(clients);
                session.close();
                Err(e)
            }
        }
    }

    /// Remove and close a session. Idempotent; unknown ids are a no-op.
    pub fn remove_client(&self, id: &str) -> bool {
        let session = {
            let mut clients = self.clients.write().unwrap_or_else(|e| e.into_inner());
            clients.remove(id)
        };
        let Some(session) = session else {
            return false;
        };

        if let Some(port) = session.agent().listen_port() {
            self.ports.release(port);
        }
        self.tunnels.fetch_sub(1, Ordering::SeqCst);
        session.close();
        info!(client = %id, "client removed");
        true
    }

    pub fn has_client(&self, id: &str) -> bool {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(id)
    }

    pub fn get_client(&self, id: &str) -> Option<ClientSession> {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Number of live tunnels, kept equal to the size of the id map.
    pub fn tunnel_count(&self) -> usize {
        self.tunnels.load(Ordering::SeqCst)
    }

    pub fn client_count(&self) -> usize {
        self.clients
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn max_tcp_sockets(&self) -> usize {
        self.config.max_tcp_sockets
    }
}

fn random_unused_id(clients: &HashMap<String, ClientSession>) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let candidate = format!(
            "{}-{}-{}",
            ADJECTIVES.choose(&mut rng).unwrap_or(&"quick"),
            ADJECTIVES.choose(&mut rng).unwrap_or(&"shiny"),
            ANIMALS.choose(&mut rng).unwrap_or(&"wombat"),
        );
        if !clients.contains_key(&candidate) {
            return candidate;
        }
    }
}
