//! Integration tests for session lifecycle: the grace timer and registry
//! cleanup.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use burrow_core::{ClientRegistry, PortAllocator, RegistryConfig};
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};

fn test_registry(grace_ms: u64) -> Arc<ClientRegistry> {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let ports = Arc::new(PortAllocator::new(None).unwrap());
    ClientRegistry::new(
        ports,
        RegistryConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            grace: Duration::from_millis(grace_ms),
            ..RegistryConfig::default()
        },
    )
}

async fn dial(port: u16) -> TcpStream {
    let addr: SocketAddr = (Ipv4Addr::LOCALHOST, port).into();
    TcpStream::connect(addr).await.unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_session_reaped_when_no_socket_connects() {
    let registry = test_registry(200);

    registry.new_client(Some("lonely-client")).await.unwrap();
    assert!(registry.has_client("lonely-client"));
    assert_eq!(registry.tunnel_count(), 1);

    sleep(Duration::from_millis(600)).await;
    assert!(!registry.has_client("lonely-client"));
    assert_eq!(registry.tunnel_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connecting_cancels_grace_and_dropping_rearms_it() {
    let registry = test_registry(300);

    let info = registry.new_client(Some("busy-client")).await.unwrap();

    // Dial back inside the grace window: the reaper stands down.
    let socket = dial(info.port).await;
    sleep(Duration::from_millis(600)).await;
    assert!(registry.has_client("busy-client"));

    // Dropping the only socket re-arms the timer; the session goes away
    // one grace period later.
    drop(socket);
    sleep(Duration::from_millis(700)).await;
    assert!(!registry.has_client("busy-client"));
    assert_eq!(registry.tunnel_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_remove_client_closes_tunnel_sockets() {
    let registry = test_registry(60_000);

    let info = registry.new_client(Some("doomed-client")).await.unwrap();
    let mut socket = dial(info.port).await;
    sleep(Duration::from_millis(50)).await;

    let session = registry.get_client("doomed-client").unwrap();
    assert_eq!(session.connected_sockets(), 1);

    assert!(registry.remove_client("doomed-client"));
    assert!(session.is_closed());

    // The remote end observes its tunnel socket closing.
    let mut buf = [0u8; 1];
    let n = timeout(Duration::from_secs(1), socket.read(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(n, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_reaped_session_frees_its_port() {
    let ports = Arc::new(PortAllocator::new(Some("29700:29700")).unwrap());
    let registry = ClientRegistry::new(
        ports,
        RegistryConfig {
            bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            grace: Duration::from_millis(200),
            ..RegistryConfig::default()
        },
    );

    let first = registry.new_client(Some("first-tenant")).await.unwrap();
    assert_eq!(first.port, 29700);

    // Let the grace reaper take it down, then the port is reusable.
    sleep(Duration::from_millis(600)).await;
    assert!(!registry.has_client("first-tenant"));

    let second = registry.new_client(Some("second-tenant")).await.unwrap();
    assert_eq!(second.port, 29700);
}
