//! End-to-end coverage of the UDP discovery relays over real loopback
//! sockets: a raw test socket plays the role of the IGW announcing itself,
//! and the relay's bus publications and rebroadcast are observed directly.

use boiler_proxy::config::load_config_from_str;
use boiler_proxy::pubsub::PubSub;
use boiler_proxy::shutdown::Shutdown;
use boiler_proxy::udp_relay::GatewayRelay;
use std::net::UdpSocket as StdUdpSocket;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Duration};

fn free_udp_port() -> u16 {
    let socket = StdUdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn loopback_config(discovery_port: u16) -> boiler_proxy::config::ProxyConfig {
    let toml = format!(
        r#"
        [network]
        gateway_iface = "127.0.0.1"
        boiler_iface = "127.0.0.1"
        discovery_port = {discovery_port}
        port_delta = 1000
        socket_timeout_secs = 2
        "#
    );
    load_config_from_str(&toml).unwrap()
}

#[tokio::test]
async fn gateway_announcement_publishes_address_and_identity() {
    let discovery_port = free_udp_port();
    let config = loopback_config(discovery_port);
    let bus = PubSub::new(64);
    let (shutdown, handle) = Shutdown::new();

    let mut bootstrap = bus.subscribe("bootstrap", "test");
    let mut info = bus.subscribe("info", "test");

    let relay = GatewayRelay::new(bus.clone(), config.network.clone());
    let relay_task = tokio::spawn(async move { relay.run(handle).await });

    // Give the relay a moment to bind before we fire the test datagram.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender
        .send_to(b"HargaWebApp v6.4.1\r\nSN:0039808", ("127.0.0.1", discovery_port))
        .await
        .unwrap();

    let gw_addr = timeout(Duration::from_secs(1), bootstrap.recv())
        .await
        .expect("timed out waiting for GW_ADDR")
        .unwrap();
    assert_eq!(gw_addr, "GW_ADDR:127.0.0.1");

    let gw_port = timeout(Duration::from_secs(1), bootstrap.recv())
        .await
        .expect("timed out waiting for GW_PORT")
        .unwrap();
    assert!(gw_port.starts_with("GW_PORT:"));

    let mut seen_version = false;
    let mut seen_serial = false;
    for _ in 0..2 {
        let msg = timeout(Duration::from_secs(1), info.recv())
            .await
            .expect("timed out waiting for identity publication")
            .unwrap();
        if msg == "HargaWebApp££6.4.1" {
            seen_version = true;
        }
        if msg == "SN££0039808" {
            seen_serial = true;
        }
    }
    assert!(seen_version, "expected HargaWebApp version to be published");
    assert!(seen_serial, "expected boiler serial to be published");

    shutdown.request();
    // The relay may already have exited on its own: once it learned the
    // peer it tries to rebroadcast the datagram, and a to-broadcast-address
    // send can fail with no route in a sandboxed test network namespace.
    // What this test cares about — the bus publications above — already
    // happened either way, so only the task's liveness is checked here.
    timeout(Duration::from_secs(1), relay_task)
        .await
        .expect("relay task did not exit after shutdown was requested")
        .expect("relay task panicked");
}

#[tokio::test]
async fn relay_exits_promptly_once_shutdown_is_requested() {
    let discovery_port = free_udp_port();
    let config = loopback_config(discovery_port);
    let bus = PubSub::new(64);
    let (shutdown, handle) = Shutdown::new();

    let relay = GatewayRelay::new(bus, config.network.clone());
    let relay_task = tokio::spawn(async move { relay.run(handle).await });

    tokio::time::sleep(Duration::from_millis(20)).await;
    shutdown.request();

    timeout(Duration::from_secs(1), relay_task)
        .await
        .expect("relay must exit within one loop tick of a shutdown request")
        .unwrap()
        .unwrap();
}
