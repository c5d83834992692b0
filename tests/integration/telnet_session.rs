//! End-to-end coverage of one `TelnetProxy` session over real loopback TCP
//! sockets: a mock IGW client and a mock boiler server drive `service()`
//! through a login handshake and an explicit session end.

use boiler_proxy::config::load_config_from_str;
use boiler_proxy::pubsub::PubSub;
use boiler_proxy::shutdown::Shutdown;
use boiler_proxy::telnet_proxy::{SessionEnd, TelnetProxy};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{timeout, Duration};

/// Binds an ephemeral loopback listener and returns one end accepted by it
/// and the other end connected to it.
async fn pair() -> (TcpStream, TcpStream) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connect = TcpStream::connect(addr);
    let (accept, connect) = tokio::join!(listener.accept(), connect);
    (accept.unwrap().0, connect.unwrap())
}

/// Reads until the accumulated bytes end with `\r\n`. The proxy forwards
/// bytes transparently as they arrive, so this does not assume anything
/// about how the underlying TCP stream happened to segment a response.
async fn read_line(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer closed before sending a full line");
        buf.extend_from_slice(&chunk[..n]);
        if buf.ends_with(b"\r\n") {
            return boiler_proxy::latin1::decode(&buf);
        }
    }
}

/// Reads (accumulating across as many reads as needed) until the decoded
/// buffer contains `needle`, then returns everything read so far.
async fn read_until_contains(stream: &mut TcpStream, needle: &str) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 256];
    loop {
        let text = boiler_proxy::latin1::decode(&buf);
        if text.contains(needle) {
            return text;
        }
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer closed before sending the expected content");
        buf.extend_from_slice(&chunk[..n]);
    }
}

#[tokio::test]
async fn login_handshake_publishes_credentials_and_queries_boiler_config() {
    let (igw_proxy_side, mut igw_client) = pair().await;
    let (aux_proxy_side, aux_client) = pair().await;
    let (boiler_proxy_side, mut boiler_mock) = pair().await;

    let config = load_config_from_str("").unwrap();
    let bus = PubSub::new(256);
    let mut track = bus.subscribe("track", "test-track");
    let mut bootstrap = bus.subscribe("bootstrap", "test-bootstrap");
    let mut info = bus.subscribe("info", "test-info");
    let reconnect_sub = bus.subscribe("bootstrap", "test-reconnect");

    let proxy = TelnetProxy::new(bus.clone(), config.network.clone(), config.analyser.clone());
    let (shutdown, handle) = Shutdown::new();

    let service_task = tokio::spawn(async move {
        proxy
            .service(igw_proxy_side, aux_proxy_side, boiler_proxy_side, reconnect_sub, handle)
            .await
    });

    // Boiler mock: answers the login handshake, then the fixed config batch.
    let boiler_mock_task = tokio::spawn(async move {
        let login_token_req = read_line(&mut boiler_mock).await;
        assert_eq!(login_token_req, "$login token\r\n");
        boiler_mock.write_all(b"$3313C1F2\r\n").await.unwrap();

        let login_key_req = read_line(&mut boiler_mock).await;
        assert_eq!(login_key_req, "$login key 137171BD\r\n");
        boiler_mock
            .write_all(b"zclient login (7421)\r\n$ack\r\n")
            .await
            .unwrap();

        for _ in 0..6 {
            let _query = read_line(&mut boiler_mock).await;
            boiler_mock.write_all(b"$0\r\n").await.unwrap();
        }
        boiler_mock
    });

    igw_client.write_all(b"$login token\r\n").await.unwrap();
    let token_resp = read_line(&mut igw_client).await;
    assert_eq!(token_resp, "$3313C1F2\r\n");

    igw_client
        .write_all(b"$login key 137171BD\r\n")
        .await
        .unwrap();
    let key_resp = read_until_contains(&mut igw_client, "$ack").await;
    assert!(key_resp.contains("zclient login (7421)"));
    assert!(key_resp.ends_with("$ack\r\n"));

    let mut saw_key = false;
    let mut saw_token = false;
    for _ in 0..2 {
        let msg = timeout(Duration::from_secs(1), info.recv())
            .await
            .expect("timed out waiting for a login credential publication")
            .unwrap();
        if msg == "KEY££137171BD" {
            saw_key = true;
        }
        if msg == "TOKEN££3313C1F2" {
            saw_token = true;
        }
    }
    assert!(saw_key, "expected KEY££137171BD to be published");
    assert!(saw_token, "expected TOKEN££3313C1F2 to be published");

    let boiler_config = timeout(Duration::from_secs(2), bootstrap.recv())
        .await
        .expect("timed out waiting for BoilerConfig publication")
        .unwrap();
    assert!(boiler_config.starts_with("BoilerConfig:"));

    let mut saw_login_ack_on_track = false;
    for _ in 0..2 {
        let track_msg = timeout(Duration::from_secs(1), track.recv())
            .await
            .expect("timed out waiting for a track publication")
            .unwrap();
        if track_msg.contains("zclient login") {
            saw_login_ack_on_track = true;
        }
    }
    assert!(saw_login_ack_on_track, "expected the login ack response to be mirrored on track");

    let _boiler_mock = timeout(Duration::from_secs(2), boiler_mock_task)
        .await
        .expect("boiler mock task timed out")
        .unwrap();

    drop(shutdown);
    drop(igw_client);
    drop(aux_client);
    let _ = timeout(Duration::from_secs(1), service_task).await;
}

#[tokio::test]
async fn igw_clear_ends_the_session_without_waiting_for_the_boiler_ack() {
    let (igw_proxy_side, mut igw_client) = pair().await;
    let (aux_proxy_side, _aux_client) = pair().await;
    let (boiler_proxy_side, mut boiler_mock) = pair().await;

    let config = load_config_from_str("").unwrap();
    let bus = PubSub::new(64);
    let reconnect_sub = bus.subscribe("bootstrap", "test-reconnect");
    let proxy = TelnetProxy::new(bus, config.network.clone(), config.analyser.clone());
    let (_shutdown, handle) = Shutdown::new();

    let service_task = tokio::spawn(async move {
        proxy
            .service(igw_proxy_side, aux_proxy_side, boiler_proxy_side, reconnect_sub, handle)
            .await
    });

    igw_client.write_all(b"$igw clear\r\n").await.unwrap();

    // The boiler mock intentionally never answers — the session must end
    // anyway, without blocking on an acknowledgement (Resolved Question F).
    let forwarded = read_line(&mut boiler_mock).await;
    assert_eq!(forwarded, "$igw clear\r\n");

    let result = timeout(Duration::from_secs(1), service_task)
        .await
        .expect("service() must return immediately after $igw clear, not wait for an ack")
        .unwrap();
    assert_eq!(result, SessionEnd::IgwClearRequested);
}
