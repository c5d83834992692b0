//! Dual TCP "telnet" proxy interposed between the IGW and the boiler.
//!
//! One [`TelnetProxy`] instance services exactly one IGW session (§4.4): it
//! discovers the boiler, accepts the IGW's control connection and the local
//! actuator's auxiliary connection, opens its own connection to the boiler,
//! then runs a single cooperative loop that forwards bytes in both
//! directions while feeding them through the [`Analyser`] to drive telemetry
//! extraction and session-lifecycle detection.

use crate::analyser::{Analyser, CommandState, Mode};
use crate::config::{AnalyserConfig, NetworkConfig};
use crate::latin1;
use crate::network_data::NetworkData;
use crate::pubsub::{PubSub, Subscription};
use crate::shutdown::ShutdownHandle;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

const BOOTSTRAP_CHANNEL: &str = "bootstrap";
const SYSTEM_CHANNEL: &str = "system";
const RESTART_REQUESTED: &str = "RESTART_REQUESTED";

/// Fixed parameter-discovery batch issued right after login completes.
/// Not derived from the boiler's full catalogue — the proxy has no prior
/// knowledge of what parameters exist before its first session.
const BOILER_CONFIG_QUERIES: &[&str] = &[
    "$par get PR001\r\n", // Mode Boiler
    "$par get PR011\r\n", // Mode Zone 1
    "$par get PR012\r\n", // Mode Zone 2
    "$par get PR040\r\n", // demarrage tampon
    "$par get 4\r\n",     // Temp. ambiante jour
    "$par get 5\r\n",     // Temp. ambiante de reduit
];

/// How long a newly accepted listener keeps replacing its accepted socket
/// with a fresher one before handing it to `service()` (§4.4: "a stale
/// accepted socket is discarded and replaced transparently").
const ACCEPT_REPLACEMENT_GRACE: Duration = Duration::from_millis(200);

/// How long the IGW side sleeps before re-checking `service_lock` once it
/// finds the lock held, rather than blocking on it (§4.4, §5).
const SERVICE_LOCK_POLL_DELAY: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum TelnetProxyError {
    #[error("failed to bind listener on port {port}: {source}")]
    Bind { port: u16, #[source] source: std::io::Error },
    #[error("failed to accept connection: {0}")]
    Accept(#[source] std::io::Error),
    #[error("failed to connect to boiler at {addr}: {source}")]
    Connect { addr: IpAddr, #[source] source: std::io::Error },
}

/// Why a servicing session ended. Every variant results in one
/// `RESTART_REQUESTED` publication; the orchestrator does not distinguish
/// further.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEnd {
    /// `$igw clear` was seen in an IGW request (Resolved Question F: we do
    /// not wait for the boiler's acknowledgement).
    IgwClearRequested,
    /// The Analyser's stricter signal also fired (kept for a future caller
    /// that wants to wait for the ack; does not change current behaviour).
    SessionEndAcked,
    /// The IGW's control socket hit EOF or a socket error.
    IgwDisconnected,
    /// The boiler's socket hit EOF or a socket error.
    BoilerDisconnected,
    /// The auxiliary socket hit EOF or a socket error.
    AuxiliaryDisconnected,
    /// A fresh IGW discovery broadcast arrived on the bus mid-session.
    IgwReannounced,
    /// Shutdown was requested externally (orchestrator teardown).
    ShutdownRequested,
}

/// Which side most recently sent a request whose response is outstanding.
/// There is at most one in-flight request per caller (§3 SessionState).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requester {
    None,
    Igw,
    Auxiliary,
}

/// Mutable per-session dialog state (§3 SessionState).
struct SessionState {
    mode: Mode,
    command_state: CommandState,
    buffer: Vec<u8>,
    session_end_requested: bool,
    requester: Requester,
    session_active: bool,
}

impl SessionState {
    fn new() -> Self {
        SessionState {
            mode: Mode::Ready,
            command_state: CommandState::Idle,
            buffer: Vec::new(),
            session_end_requested: false,
            requester: Requester::None,
            session_active: false,
        }
    }
}

pub struct TelnetProxy {
    bus: PubSub,
    network: NetworkConfig,
    analyser_config: AnalyserConfig,
    /// Serialises the IGW-side and auxiliary-side request flows so the
    /// last-writer routing heuristic stays correct (§5). Shared with the
    /// out-of-scope actuator; held only across one auxiliary round trip.
    service_lock: Arc<Mutex<()>>,
}

impl TelnetProxy {
    pub fn new(bus: PubSub, network: NetworkConfig, analyser_config: AnalyserConfig) -> Self {
        TelnetProxy {
            bus,
            network,
            analyser_config,
            service_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Subscribes to `bootstrap` and blocks until the boiler's IP is known.
    /// Stays subscribed afterward — a second `GW_ADDR`/`GW_PORT` pair on the
    /// same channel later signals a reconnect (Trigger 3).
    pub async fn discover(
        &self,
        shutdown: &mut ShutdownHandle,
    ) -> Option<(IpAddr, Subscription)> {
        let mut sub = self.bus.subscribe(BOOTSTRAP_CHANNEL, "telnet-proxy-discover");
        let mut network_data = NetworkData::new();
        loop {
            if let Some(addr) = network_data.boiler_addr {
                info!(boiler = %addr, "telnet proxy discovered the boiler");
                return Some((addr, sub));
            }
            tokio::select! {
                biased;
                () = shutdown.requested() => return None,
                msg = sub.recv() => {
                    let Ok(msg) = msg else { return None };
                    network_data.apply_bootstrap_message(&msg);
                }
            }
        }
    }

    /// Binds the IGW listener (the vendor's well-known control port) and
    /// the auxiliary listener (local actuator port), then accepts one
    /// connection on each, replacing a stale accepted socket with a fresher
    /// one that arrives within the grace window.
    pub async fn bind_listen_accept(
        &self,
        shutdown: &mut ShutdownHandle,
    ) -> Result<Option<(TcpStream, TcpStream)>, TelnetProxyError> {
        let igw_listener = TcpListener::bind(("0.0.0.0", self.network.boiler_tcp_port))
            .await
            .map_err(|source| TelnetProxyError::Bind { port: self.network.boiler_tcp_port, source })?;
        let aux_listener = TcpListener::bind(("0.0.0.0", self.network.auxiliary_tcp_port))
            .await
            .map_err(|source| TelnetProxyError::Bind { port: self.network.auxiliary_tcp_port, source })?;

        info!(
            igw_port = self.network.boiler_tcp_port,
            aux_port = self.network.auxiliary_tcp_port,
            "telnet proxy listening"
        );

        let Some((igw_stream, igw_peer)) = accept_replacing_stale(&igw_listener, shutdown).await else {
            return Ok(None);
        };
        let Some((aux_stream, _)) = accept_replacing_stale(&aux_listener, shutdown).await else {
            return Ok(None);
        };
        // NetworkData's gateway TCP source port (§3) is observed only once
        // the IGW's control connection is actually accepted, unlike the UDP
        // peer fields which come from the discovery broadcast.
        self.bus
            .publish(BOOTSTRAP_CHANNEL, format!("GWT_PORT:{}", igw_peer.port()));
        Ok(Some((igw_stream, aux_stream)))
    }

    /// Opens the outbound TCP connection to the boiler.
    pub async fn connect(&self, boiler_addr: IpAddr) -> Result<TcpStream, TelnetProxyError> {
        TcpStream::connect((boiler_addr, self.network.boiler_tcp_port))
            .await
            .map_err(|source| TelnetProxyError::Connect { addr: boiler_addr, source })
    }

    /// Runs the main loop until the session ends. Returns exactly once.
    pub async fn service(
        &self,
        mut igw: TcpStream,
        mut aux: TcpStream,
        mut boiler: TcpStream,
        mut reconnect_sub: Subscription,
        mut shutdown: ShutdownHandle,
    ) -> SessionEnd {
        let mut analyser = Analyser::new(
            self.bus.clone(),
            self.analyser_config.scan_period,
            &self.analyser_config.telemetry_map,
        );
        let mut state = SessionState::new();
        let mut igw_buf = vec![0u8; self.network.buffer_size];
        let mut aux_buf = vec![0u8; self.network.buffer_size];
        let mut boiler_buf = vec![0u8; self.network.buffer_size];
        // Held only across one auxiliary request/response pair (§5): taken
        // when the auxiliary side writes to the boiler, released once that
        // request's response has been routed back.
        let mut aux_lock: Option<OwnedMutexGuard<()>> = None;

        let end = 'session: loop {
            tokio::select! {
                biased;
                () = shutdown.requested() => {
                    info!("telnet proxy session shutting down");
                    break 'session SessionEnd::ShutdownRequested;
                }
                msg = reconnect_sub.recv() => {
                    let Ok(msg) = msg else { continue };
                    if state.session_active && (msg.starts_with("GW_ADDR:") || msg.starts_with("GW_PORT:")) {
                        info!("fresh IGW announcement observed mid-session, triggering restart");
                        break 'session SessionEnd::IgwReannounced;
                    }
                }
                ready = igw.readable() => {
                    if ready.is_err() {
                        break 'session SessionEnd::IgwDisconnected;
                    }
                    if self.service_lock.try_lock().is_err() {
                        debug!("IGW socket paused: auxiliary round trip in flight");
                        tokio::time::sleep(SERVICE_LOCK_POLL_DELAY).await;
                        continue;
                    }
                    match igw.try_read(&mut igw_buf) {
                        Ok(0) => break 'session SessionEnd::IgwDisconnected,
                        Ok(n) => {
                            let chunk = &igw_buf[..n];
                            let outcome = analyser.parse_request(chunk);
                            if outcome.state == CommandState::LoginToken {
                                state.session_active = true;
                            }
                            state.command_state = outcome.state;
                            // The invariant: every IGW byte is forwarded before any
                            // state update derived from it is published.
                            if let Err(e) = boiler.write_all(chunk).await {
                                warn!(error = %e, "failed forwarding IGW request to boiler");
                                break 'session SessionEnd::BoilerDisconnected;
                            }
                            state.requester = Requester::Igw;
                            if outcome.session_end_requested {
                                state.session_end_requested = true;
                                info!("$igw clear observed, ending session without waiting for ack");
                                break 'session SessionEnd::IgwClearRequested;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            warn!(error = %e, "IGW socket error");
                            break 'session SessionEnd::IgwDisconnected;
                        }
                    }
                }
                ready = aux.readable() => {
                    if ready.is_err() {
                        break 'session SessionEnd::AuxiliaryDisconnected;
                    }
                    match aux.try_read(&mut aux_buf) {
                        Ok(0) => break 'session SessionEnd::AuxiliaryDisconnected,
                        Ok(n) => {
                            let chunk = &aux_buf[..n];
                            // Pause IGW request processing for this round trip
                            // so the "last writer is expected reader" routing
                            // heuristic stays correct.
                            aux_lock = Some(self.service_lock.clone().lock_owned().await);
                            if let Err(e) = boiler.write_all(chunk).await {
                                warn!(error = %e, "failed forwarding auxiliary request to boiler");
                                aux_lock = None;
                                break 'session SessionEnd::BoilerDisconnected;
                            }
                            state.requester = Requester::Auxiliary;
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            warn!(error = %e, "auxiliary socket error");
                            break 'session SessionEnd::AuxiliaryDisconnected;
                        }
                    }
                }
                ready = boiler.readable() => {
                    if ready.is_err() {
                        break 'session SessionEnd::BoilerDisconnected;
                    }
                    match boiler.try_read(&mut boiler_buf) {
                        Ok(0) => break 'session SessionEnd::BoilerDisconnected,
                        Ok(n) => {
                            let chunk = &boiler_buf[..n];
                            route_response(&mut igw, &mut aux, chunk, state.requester).await;

                            // Streaming "pm" telemetry can interleave with an
                            // outstanding auxiliary response (§4.4); its
                            // completion must not be mistaken for the
                            // auxiliary round trip finishing.
                            let was_streaming = state.mode == Mode::Streaming || chunk.starts_with(b"pm");

                            let outcome = analyser.process_response_chunk(
                                chunk,
                                state.mode,
                                state.command_state,
                                state.session_end_requested,
                                &mut state.buffer,
                            );
                            state.mode = outcome.mode;
                            state.command_state = outcome.state;

                            // Release the pause once the auxiliary's own
                            // response has been fully reassembled, not on
                            // every raw chunk — a multi-chunk response must
                            // keep the IGW side paused until it's whole.
                            if !was_streaming && state.requester == Requester::Auxiliary && outcome.mode == Mode::Ready {
                                aux_lock = None;
                            }

                            if outcome.session_end_complete {
                                info!("boiler acknowledged $igw clear");
                                break 'session SessionEnd::SessionEndAcked;
                            }
                            if outcome.login_done {
                                info!("login complete, querying boiler configuration");
                                query_boiler_config(&self.bus, &mut boiler).await;
                            }
                        }
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(e) => {
                            warn!(error = %e, "boiler socket error");
                            break 'session SessionEnd::BoilerDisconnected;
                        }
                    }
                }
            }
        };

        // Every trigger except an externally requested shutdown needs the
        // orchestrator to rebuild the pipeline; publish once here rather than
        // at each exit point above, since the message is the same in every
        // case (§4.6: "published by whichever component detected session end").
        if end != SessionEnd::ShutdownRequested {
            self.bus.publish(SYSTEM_CHANNEL, RESTART_REQUESTED);
        }
        end
    }
}

/// Routes one boiler response chunk to its expected recipient. Streaming
/// `pm` telemetry always goes to the IGW regardless of requester. When the
/// auxiliary side was the requester, the response is also echoed to the IGW
/// (§9 Open Question — preserved, unresolved: it is unclear whether the IGW
/// relies on this echo).
async fn route_response(igw: &mut TcpStream, aux: &mut TcpStream, chunk: &[u8], requester: Requester) {
    if chunk.starts_with(b"pm") {
        if let Err(e) = igw.write_all(chunk).await {
            warn!(error = %e, "failed forwarding pm response to IGW");
        }
        return;
    }
    match requester {
        Requester::Igw | Requester::None => {
            if let Err(e) = igw.write_all(chunk).await {
                warn!(error = %e, "failed forwarding response to IGW");
            }
        }
        Requester::Auxiliary => {
            if let Err(e) = aux.write_all(chunk).await {
                warn!(error = %e, "failed forwarding response to auxiliary caller");
            }
            if let Err(e) = igw.write_all(chunk).await {
                warn!(error = %e, "failed echoing auxiliary response to IGW");
            }
        }
    }
}

/// Issues the fixed boiler-configuration query batch and concatenates the
/// CRLF-terminated responses into one `BoilerConfig:<raw>` message.
async fn query_boiler_config(bus: &PubSub, boiler: &mut TcpStream) {
    let mut message = String::from("BoilerConfig:");
    for cmd in BOILER_CONFIG_QUERIES {
        if let Err(e) = boiler.write_all(cmd.as_bytes()).await {
            warn!(error = %e, command = cmd, "failed sending boiler config query");
            continue;
        }
        let mut resp = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            match boiler.read(&mut chunk).await {
                Ok(0) => break,
                Ok(n) => {
                    resp.extend_from_slice(&chunk[..n]);
                    if resp.ends_with(b"\r\n") {
                        break;
                    }
                }
                Err(e) => {
                    warn!(error = %e, command = cmd, "failed reading boiler config response");
                    break;
                }
            }
        }
        if !resp.is_empty() {
            message.push_str(&latin1::decode(&resp));
        }
    }
    bus.publish(BOOTSTRAP_CHANNEL, message);
}

/// Accepts on `listener`, then keeps replacing the accepted connection with
/// a fresher one for [`ACCEPT_REPLACEMENT_GRACE`] before settling — a stale
/// accepted socket never gets serviced if a second connection beat it in.
async fn accept_replacing_stale(
    listener: &TcpListener,
    shutdown: &mut ShutdownHandle,
) -> Option<(TcpStream, std::net::SocketAddr)> {
    let mut current = tokio::select! {
        biased;
        () = shutdown.requested() => return None,
        accepted = listener.accept() => match accepted {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "accept error");
                return None;
            }
        },
    };
    loop {
        match tokio::time::timeout(ACCEPT_REPLACEMENT_GRACE, listener.accept()).await {
            Ok(Ok(newer)) => {
                debug!("replacing stale accepted socket with a fresher one");
                current = newer;
            }
            _ => break,
        }
    }
    Some(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pubsub::PubSub;
    use tokio::io::AsyncReadExt as _;
    use tokio::net::TcpListener;
    use tokio::time::timeout;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let connect = TcpStream::connect(addr);
        let (accept, connect) = tokio::join!(listener.accept(), connect);
        (accept.unwrap().0, connect.unwrap())
    }

    #[tokio::test]
    async fn pm_response_always_routes_to_igw_even_with_aux_requester() {
        let (mut igw_server, mut igw_client) = pair().await;
        let (mut aux_server, mut aux_client) = pair().await;
        route_response(&mut igw_server, &mut aux_server, b"pm 1 2 3\r\n", Requester::Auxiliary).await;

        let mut buf = [0u8; 64];
        let n = igw_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pm 1 2 3\r\n");

        // the auxiliary caller got nothing — pm is IGW-only.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let mut probe = [0u8; 1];
        assert!(matches!(
            aux_client.try_read(&mut probe),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock
        ));
    }

    #[tokio::test]
    async fn auxiliary_response_is_echoed_to_igw() {
        let (mut igw_server, mut igw_client) = pair().await;
        let (mut aux_server, mut aux_client) = pair().await;
        route_response(&mut igw_server, &mut aux_server, b"$ack\r\n", Requester::Auxiliary).await;

        let mut buf = [0u8; 64];
        let n = aux_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$ack\r\n");
        let n = igw_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$ack\r\n");
    }

    #[tokio::test]
    async fn igw_requester_response_goes_only_to_igw() {
        let (mut igw_server, mut igw_client) = pair().await;
        let (mut aux_server, _aux_client) = pair().await;
        route_response(&mut igw_server, &mut aux_server, b"$3313C1F2\r\n", Requester::Igw).await;

        let mut buf = [0u8; 64];
        let n = igw_client.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"$3313C1F2\r\n");
    }

    #[tokio::test]
    async fn bind_listen_accept_publishes_gwt_port_once_igw_connects() {
        let bus = PubSub::new(64);
        let mut bootstrap = bus.subscribe("bootstrap", "test-gwt-port");
        let toml = r#"
            [network]
            boiler_tcp_port = 0
            auxiliary_tcp_port = 0
        "#;
        let cfg = crate::config::load_config_from_str(toml).unwrap();
        // Port 0 lets the OS pick an ephemeral port; re-read it so the test
        // client can actually connect.
        let probe = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        let igw_port = probe.local_addr().unwrap().port();
        drop(probe);
        let mut network = cfg.network.clone();
        network.boiler_tcp_port = igw_port;
        let aux_probe = tokio::net::TcpListener::bind("0.0.0.0:0").await.unwrap();
        network.auxiliary_tcp_port = aux_probe.local_addr().unwrap().port();
        drop(aux_probe);

        let proxy = TelnetProxy::new(bus.clone(), network.clone(), cfg.analyser);
        let (_shutdown, mut handle) = crate::shutdown::Shutdown::new();

        let accept_task = tokio::spawn(async move { proxy.bind_listen_accept(&mut handle).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let _igw_client = TcpStream::connect(("127.0.0.1", network.boiler_tcp_port))
            .await
            .unwrap();
        let _aux_client = TcpStream::connect(("127.0.0.1", network.auxiliary_tcp_port))
            .await
            .unwrap();

        let result = timeout(Duration::from_secs(1), accept_task)
            .await
            .expect("bind_listen_accept did not return")
            .unwrap()
            .unwrap();
        assert!(result.is_some());

        let gwt_port_msg = timeout(Duration::from_secs(1), bootstrap.recv())
            .await
            .expect("timed out waiting for GWT_PORT")
            .unwrap();
        assert!(gwt_port_msg.starts_with("GWT_PORT:"));
    }

    #[tokio::test]
    async fn discover_blocks_until_boiler_address_is_published() {
        let bus = PubSub::new(64);
        let cfg = crate::config::load_config_from_str("").unwrap();
        let proxy = TelnetProxy::new(bus.clone(), cfg.network, cfg.analyser);
        let (shutdown, handle) = crate::shutdown::Shutdown::new();

        let discover = tokio::spawn(async move {
            let mut handle = handle;
            proxy.discover(&mut handle).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.publish("bootstrap", "BL_ADDR:10.0.0.8");
        let result = discover.await.unwrap();
        assert!(result.is_some());
        drop(shutdown);
    }

    #[tokio::test]
    async fn session_end_by_disconnect_publishes_restart_requested() {
        let (igw_proxy_side, igw_client) = pair().await;
        let (aux_proxy_side, _aux_client) = pair().await;
        let (boiler_proxy_side, _boiler_mock) = pair().await;

        let config = crate::config::load_config_from_str("").unwrap();
        let bus = PubSub::new(64);
        let mut system = bus.subscribe("system", "test-system");
        let reconnect_sub = bus.subscribe("bootstrap", "test-reconnect");
        let proxy = TelnetProxy::new(bus, config.network, config.analyser);
        let (_shutdown, handle) = crate::shutdown::Shutdown::new();

        let service_task = tokio::spawn(async move {
            proxy
                .service(igw_proxy_side, aux_proxy_side, boiler_proxy_side, reconnect_sub, handle)
                .await
        });

        // The IGW side hangs up without sending anything: an orchestrator
        // watching only the `system` channel (as it does in production, via
        // a single `system_sub.recv()` rather than joining this task
        // directly) must still learn the session ended.
        drop(igw_client);

        let end = timeout(Duration::from_secs(1), service_task)
            .await
            .expect("service() did not return after IGW disconnect")
            .unwrap();
        assert_eq!(end, SessionEnd::IgwDisconnected);

        let restart_msg = timeout(Duration::from_secs(1), system.recv())
            .await
            .expect("service() must publish RESTART_REQUESTED on the system channel so the orchestrator's session-end wait can resolve")
            .unwrap();
        assert_eq!(restart_msg, "RESTART_REQUESTED");
    }

    #[tokio::test]
    async fn shutdown_requested_end_does_not_publish_restart_requested() {
        let (igw_proxy_side, _igw_client) = pair().await;
        let (aux_proxy_side, _aux_client) = pair().await;
        let (boiler_proxy_side, _boiler_mock) = pair().await;

        let config = crate::config::load_config_from_str("").unwrap();
        let bus = PubSub::new(64);
        let mut system = bus.subscribe("system", "test-system");
        let reconnect_sub = bus.subscribe("bootstrap", "test-reconnect");
        let proxy = TelnetProxy::new(bus, config.network, config.analyser);
        let (shutdown, handle) = crate::shutdown::Shutdown::new();

        let service_task = tokio::spawn(async move {
            proxy
                .service(igw_proxy_side, aux_proxy_side, boiler_proxy_side, reconnect_sub, handle)
                .await
        });

        shutdown.request();
        let end = timeout(Duration::from_secs(1), service_task)
            .await
            .expect("service() did not return after shutdown request")
            .unwrap();
        assert_eq!(end, SessionEnd::ShutdownRequested);

        // An externally requested shutdown is already driving the
        // orchestrator directly; no self-announcement should follow it.
        let nothing = system.listen(Duration::from_millis(50)).await.unwrap();
        assert!(nothing.is_none());
    }

    #[tokio::test]
    async fn igw_request_is_paused_while_an_auxiliary_round_trip_is_in_flight() {
        let (igw_proxy_side, mut igw_client) = pair().await;
        let (aux_proxy_side, mut aux_client) = pair().await;
        let (boiler_proxy_side, mut boiler_mock) = pair().await;

        let config = crate::config::load_config_from_str("").unwrap();
        let bus = PubSub::new(64);
        let reconnect_sub = bus.subscribe("bootstrap", "test-reconnect");
        let proxy = TelnetProxy::new(bus, config.network, config.analyser);
        let (_shutdown, handle) = crate::shutdown::Shutdown::new();

        let service_task = tokio::spawn(async move {
            proxy
                .service(igw_proxy_side, aux_proxy_side, boiler_proxy_side, reconnect_sub, handle)
                .await
        });

        // The auxiliary side writes first and claims the lock; give the
        // service loop a moment to pick it up and forward it to the boiler
        // before the IGW side writes its own request.
        aux_client.write_all(b"$par get PR001\r\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        igw_client.write_all(b"$apiversion\r\n").await.unwrap();

        let mut buf = [0u8; 64];
        let n = timeout(Duration::from_secs(1), boiler_mock.read(&mut buf))
            .await
            .expect("boiler never received the auxiliary request")
            .unwrap();
        assert_eq!(&buf[..n], b"$par get PR001\r\n");

        // While the auxiliary's response is still outstanding, the IGW
        // request must not have reached the boiler yet.
        tokio::time::sleep(Duration::from_millis(100)).await;
        let mut probe = [0u8; 1];
        assert!(
            matches!(boiler_mock.try_read(&mut probe), Err(e) if e.kind() == std::io::ErrorKind::WouldBlock),
            "IGW request reached the boiler before the auxiliary round trip finished"
        );

        // Answering the auxiliary request releases the pause; the
        // previously withheld IGW request can now land on the boiler.
        boiler_mock.write_all(b"$ack\r\n").await.unwrap();
        let n = timeout(Duration::from_secs(1), boiler_mock.read(&mut buf))
            .await
            .expect("boiler never received the IGW request after the lock was released")
            .unwrap();
        assert_eq!(&buf[..n], b"$apiversion\r\n");

        drop(igw_client);
        let _ = timeout(Duration::from_secs(1), service_task).await;
    }
}
