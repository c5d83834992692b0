//! The two UDP discovery/broadcast relays.
//!
//! Both sides share one behavioural template (§4.3): subscribe to the
//! discovery channel before binding, wait for the first inbound datagram to
//! learn the peer, bind the outbound socket exactly once, then forward every
//! subsequent datagram to the opposite segment while publishing whatever
//! protocol-level identifiers the payload carries.

use crate::config::NetworkConfig;
use crate::latin1;
use crate::network_data::NetworkData;
use crate::pubsub::PubSub;
use crate::shutdown::ShutdownHandle;
use crate::socket_manager::{SocketError, UnboundSocket};
use std::net::IpAddr;
use tracing::{debug, info, warn};

const BOOTSTRAP_CHANNEL: &str = "bootstrap";
const INFO_CHANNEL: &str = "info";

/// 13 bytes in: `HargaWebApp v<version>`.
const WEBAPP_TAG_OFFSET: usize = 13;
/// 3 bytes in: `SN:<serial>`.
const SERIAL_TAG_OFFSET: usize = 3;
/// Boiler announcement magic prefix.
const BOILER_MAGIC: &[u8] = b"\x00\x02HSV";
const BOILER_HW_ID_RANGE: std::ops::Range<usize> = 2..32;
const BOILER_SYS_CODE_LEN: usize = 16;

/// Relays the IGW's UDP discovery broadcasts onto the boiler segment.
pub struct GatewayRelay {
    bus: PubSub,
    network: NetworkConfig,
}

impl GatewayRelay {
    pub fn new(bus: PubSub, network: NetworkConfig) -> Self {
        GatewayRelay { bus, network }
    }

    /// Runs until `shutdown` is requested or an unrecoverable socket error
    /// occurs. A receive timeout is not an error at this layer — it simply
    /// means no traffic arrived this tick.
    pub async fn run(self, mut shutdown: ShutdownHandle) -> Result<(), SocketError> {
        let inbound = UnboundSocket::create(
            &self.network.gateway_iface,
            &self.network.boiler_iface,
            true,
            self.network.socket_timeout,
        )?;
        // Resolved Question G: the gateway-side inbound bind always uses
        // delta = 0, never the configured delta, even under same-host
        // detection — this is preserved exactly as observed upstream.
        let inbound = inbound.bind_with_delta(self.network.discovery_port, 0)?;

        let mut outbound: Option<UnboundSocket> = Some(UnboundSocket::create(
            &self.network.gateway_iface,
            &self.network.boiler_iface,
            true,
            self.network.socket_timeout,
        )?);
        let mut bound_outbound = None;

        let mut buf = vec![0u8; self.network.buffer_size];
        loop {
            tokio::select! {
                biased;
                () = shutdown.requested() => {
                    info!("gateway relay shutting down");
                    return Ok(());
                }
                result = inbound.receive(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(v) => v,
                        Err(SocketError::Timeout) => continue,
                        Err(e) => {
                            warn!(error = %e, "gateway relay receive error");
                            return Err(e);
                        }
                    };
                    let datagram = &buf[..len];

                    if bound_outbound.is_none() {
                        self.bus.publish(BOOTSTRAP_CHANNEL, format!("GW_ADDR:{}", peer.ip()));
                        self.bus.publish(BOOTSTRAP_CHANNEL, format!("GW_PORT:{}", peer.port()));
                        let unbound = outbound.take().expect("outbound socket created once");
                        let manager = unbound.bind_with_delta(peer.port(), self.network.port_delta)?;
                        bound_outbound = Some(manager);
                        info!(peer = %peer, "gateway announced itself");
                    }

                    self.publish_gateway_identifiers(datagram);

                    if let Some(manager) = &bound_outbound {
                        manager
                            .send_with_delta(
                                datagram,
                                broadcast_addr(),
                                self.network.discovery_port,
                                self.network.port_delta,
                            )
                            .await?;
                    }
                }
            }
        }
    }

    fn publish_gateway_identifiers(&self, datagram: &[u8]) {
        let text = latin1::decode(datagram);
        if let Some(pos) = text.find("HargaWebApp") {
            if let Some(rest) = text.get(pos + WEBAPP_TAG_OFFSET..) {
                let version = first_line(rest);
                self.bus.publish(INFO_CHANNEL, format!("HargaWebApp££{version}"));
            }
        }
        if let Some(pos) = text.find("SN:") {
            if let Some(rest) = text.get(pos + SERIAL_TAG_OFFSET..) {
                let serial = first_line(rest);
                self.bus.publish(INFO_CHANNEL, format!("SN££{serial}"));
            }
        }
    }
}

/// Relays the boiler's UDP announcements onto the IGW segment. Its inbound
/// bind depends on the gateway-side relay having already published the
/// IGW's discovery port, so it blocks on the bus before doing anything else.
pub struct BoilerRelay {
    bus: PubSub,
    network: NetworkConfig,
}

impl BoilerRelay {
    pub fn new(bus: PubSub, network: NetworkConfig) -> Self {
        BoilerRelay { bus, network }
    }

    pub async fn run(self, mut shutdown: ShutdownHandle) -> Result<(), SocketError> {
        let Some((gateway_addr, gateway_port)) = self.wait_for_gateway_peer(&mut shutdown).await
        else {
            return Ok(());
        };

        let inbound = UnboundSocket::create(
            &self.network.boiler_iface,
            &self.network.gateway_iface,
            true,
            self.network.socket_timeout,
        )?;
        let inbound = inbound.bind_with_delta(gateway_port, -self.network.port_delta)?;

        let mut outbound: Option<UnboundSocket> = Some(UnboundSocket::create(
            &self.network.boiler_iface,
            &self.network.gateway_iface,
            true,
            self.network.socket_timeout,
        )?);
        let mut bound_outbound = None;

        let mut buf = vec![0u8; self.network.buffer_size];
        loop {
            tokio::select! {
                biased;
                () = shutdown.requested() => {
                    info!("boiler relay shutting down");
                    return Ok(());
                }
                result = inbound.receive(&mut buf) => {
                    let (len, peer) = match result {
                        Ok(v) => v,
                        Err(SocketError::Timeout) => continue,
                        Err(e) => {
                            warn!(error = %e, "boiler relay receive error");
                            return Err(e);
                        }
                    };
                    let datagram = &buf[..len];

                    if bound_outbound.is_none() {
                        self.bus.publish(BOOTSTRAP_CHANNEL, format!("BL_ADDR:{}", peer.ip()));
                        self.bus.publish(BOOTSTRAP_CHANNEL, format!("BL_PORT:{}", peer.port()));
                        let unbound = outbound.take().expect("outbound socket created once");
                        let manager = unbound.bind_with_delta(peer.port(), -self.network.port_delta)?;
                        bound_outbound = Some(manager);
                        info!(peer = %peer, "boiler announced itself");
                    }

                    self.publish_boiler_identifiers(datagram);

                    if let Some(manager) = &bound_outbound {
                        manager
                            .send_with_delta(
                                datagram,
                                gateway_addr,
                                gateway_port,
                                -self.network.port_delta,
                            )
                            .await?;
                    }
                }
            }
        }
    }

    /// Subscribes to `bootstrap` before anything else starts (satisfying the
    /// startup-order dependency in §4.6), blocks until both `GW_ADDR:<ip>`
    /// and `GW_PORT:<port>` have been observed, then unsubscribes — the
    /// boiler side has no further use for the channel once its own peer is
    /// known (§4.3).
    async fn wait_for_gateway_peer(&self, shutdown: &mut ShutdownHandle) -> Option<(IpAddr, u16)> {
        let mut sub = self.bus.subscribe(BOOTSTRAP_CHANNEL, "boiler-relay-discover");
        let mut network_data = NetworkData::new();
        loop {
            if network_data.is_gateway_known() {
                return Some((
                    network_data.gateway_addr.expect("checked by is_gateway_known"),
                    network_data.gateway_udp_port.expect("checked by is_gateway_known"),
                ));
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

    fn publish_boiler_identifiers(&self, datagram: &[u8]) {
        if !datagram.starts_with(BOILER_MAGIC) || datagram.len() < BOILER_SYS_CODE_LEN {
            return;
        }
        if let Some(hw_id) = datagram.get(BOILER_HW_ID_RANGE) {
            // Extracted and logged, never published — nothing downstream
            // consumes it (§9 Resolved Question H).
            debug!(hw_id = %latin1::decode(hw_id), "boiler hardware identity observed");
        }
        let sys_code = &datagram[datagram.len() - BOILER_SYS_CODE_LEN..];
        self.bus
            .publish(INFO_CHANNEL, format!("SYS££{}", latin1::decode(sys_code)));
    }
}

fn first_line(s: &str) -> &str {
    s.split(['\r', '\n']).next().unwrap_or(s).trim()
}

fn broadcast_addr() -> IpAddr {
    IpAddr::V4(std::net::Ipv4Addr::new(255, 255, 255, 255))
}
