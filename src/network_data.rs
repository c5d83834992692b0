//! Shared peer-identity state, populated incrementally from `bootstrap`
//! discovery messages and read by the TelnetProxy and Analyser.
//!
//! Every field starts empty and is filled in exactly once per session, as the
//! two UDP relays observe their respective peers' first datagrams. Once set,
//! a field is treated as stable for the rest of the session — the struct is
//! never mutated after both peers have announced themselves.

use std::net::IpAddr;

/// Addresses and ports learned from the discovery broadcasts of both peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NetworkData {
    pub gateway_addr: Option<IpAddr>,
    pub gateway_udp_port: Option<u16>,
    pub gateway_tcp_port: Option<u16>,
    pub boiler_addr: Option<IpAddr>,
    pub boiler_udp_port: Option<u16>,
}

impl NetworkData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_gateway_known(&self) -> bool {
        self.gateway_addr.is_some() && self.gateway_udp_port.is_some()
    }

    pub fn is_boiler_known(&self) -> bool {
        self.boiler_addr.is_some() && self.boiler_udp_port.is_some()
    }

    /// Fold one `bootstrap` channel message into the struct. Unrecognised
    /// lines are ignored; this mirrors the bus's own "unknown is a no-op"
    /// failure semantics rather than treating them as parse errors.
    pub fn apply_bootstrap_message(&mut self, message: &str) {
        if let Some(value) = message.strip_prefix("GW_ADDR:") {
            self.gateway_addr = value.trim().parse().ok();
        } else if let Some(value) = message.strip_prefix("GW_PORT:") {
            self.gateway_udp_port = value.trim().parse().ok();
        } else if let Some(value) = message.strip_prefix("GWT_PORT:") {
            self.gateway_tcp_port = value.trim().parse().ok();
        } else if let Some(value) = message.strip_prefix("BL_ADDR:") {
            self.boiler_addr = value.trim().parse().ok();
        } else if let Some(value) = message.strip_prefix("BL_PORT:") {
            self.boiler_udp_port = value.trim().parse().ok();
        }
    }
}
