//! Agent identity attached to every exported datagram

use std::net::{IpAddr, Ipv4Addr};

/// Default sub-agent id
pub const DEFAULT_SUB_AGENT_ID: u32 = 1;

/// Largest datagram a single UDP packet can carry
pub const MAX_DATAGRAM_LEN: usize = 65507;

/// Bytes of a one-sample datagram around its raw header, IPv4 agent
pub const DATAGRAM_OVERHEAD_IPV4: usize = 92;

/// Bytes of a one-sample datagram around its raw header, IPv6 agent
pub const DATAGRAM_OVERHEAD_IPV6: usize = 104;

/// Fixed identity of this sampling agent
///
/// Set once at startup and shared read-only with the encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AgentIdentity {
    /// Address of this host as reported to the collector
    pub address: IpAddr,

    /// Distinguishes several agents running on the same host
    pub sub_agent_id: u32,
}

impl AgentIdentity {
    pub fn new(address: IpAddr) -> Self {
        Self {
            address,
            sub_agent_id: DEFAULT_SUB_AGENT_ID,
        }
    }

    pub fn with_sub_agent_id(mut self, sub_agent_id: u32) -> Self {
        self.sub_agent_id = sub_agent_id;
        self
    }

    /// Datagram bytes spent on everything except the raw header
    pub fn datagram_overhead(&self) -> usize {
        match self.address {
            IpAddr::V4(_) => DATAGRAM_OVERHEAD_IPV4,
            IpAddr::V6(_) => DATAGRAM_OVERHEAD_IPV6,
        }
    }

    /// Largest raw header that still fits one UDP datagram once padded to 4 bytes
    pub fn max_header_bytes(&self) -> u32 {
        ((MAX_DATAGRAM_LEN - self.datagram_overhead()) & !3) as u32
    }
}

impl Default for AgentIdentity {
    fn default() -> Self {
        Self::new(IpAddr::V4(Ipv4Addr::LOCALHOST))
    }
}
