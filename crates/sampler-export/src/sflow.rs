//! sFlow v5 datagram encoder
//!
//! Each flow sample becomes one datagram carrying a single flow sample with a
//! single raw packet header record. All fields are XDR: big-endian 32-bit
//! words, opaque data padded to a multiple of four bytes.

use sampler_core::agent::MAX_DATAGRAM_LEN;
use sampler_core::plugins::{EncodePlugin, PluginError, PluginInfo, PluginResult};
use sampler_core::{AgentIdentity, FlowSampleRecord, SFLOW_VERSION};
use std::net::IpAddr;
use std::time::Instant;

/// Sample data format: standard flow sample
const FORMAT_FLOW_SAMPLE: u32 = 1;

/// Flow data format: raw packet header
const FORMAT_RAW_PACKET_HEADER: u32 = 1;

/// Agent address type values
const ADDRESS_TYPE_IPV4: u32 = 1;
const ADDRESS_TYPE_IPV6: u32 = 2;

/// Fixed part of a flow sample body, before its records
const FLOW_SAMPLE_FIXED_LEN: usize = 8 * 4;

/// Fixed part of a raw packet header record body, before the header bytes
const RAW_HEADER_FIXED_LEN: usize = 4 * 4;

/// Encodes flow samples as sFlow v5 datagrams
pub struct SflowEncoder {
    /// Datagram sequence number, separate from the sample sequence number
    datagram_sequence: u32,
    boot: Instant,
}

impl SflowEncoder {
    pub fn new() -> Self {
        Self {
            datagram_sequence: 1,
            boot: Instant::now(),
        }
    }

    fn uptime_ms(&self) -> u32 {
        self.boot.elapsed().as_millis() as u32
    }
}

impl Default for SflowEncoder {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u32(out: &mut Vec<u8>, value: u32) {
    out.extend_from_slice(&value.to_be_bytes());
}

fn padded_len(len: usize) -> usize {
    (len + 3) & !3
}

fn put_opaque(out: &mut Vec<u8>, data: &[u8]) {
    out.extend_from_slice(data);
    out.resize(out.len() + padded_len(data.len()) - data.len(), 0);
}

fn put_agent_address(out: &mut Vec<u8>, address: &IpAddr) {
    match address {
        IpAddr::V4(v4) => {
            put_u32(out, ADDRESS_TYPE_IPV4);
            out.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            put_u32(out, ADDRESS_TYPE_IPV6);
            out.extend_from_slice(&v6.octets());
        }
    }
}

impl PluginInfo for SflowEncoder {
    fn name(&self) -> &str {
        "sflow-v5"
    }

    fn version(&self) -> &str {
        env!("CARGO_PKG_VERSION")
    }

    fn description(&self) -> &str {
        "Encodes flow samples as sFlow version 5 datagrams"
    }
}

impl EncodePlugin for SflowEncoder {
    fn encode(
        &mut self,
        agent: &AgentIdentity,
        record: &FlowSampleRecord,
        out: &mut Vec<u8>,
    ) -> PluginResult<()> {
        let header_len = record.raw_header.len();
        if u64::from(record.stripped_bytes) + header_len as u64 != u64::from(record.frame_length) {
            return Err(PluginError::EncodeFailed(format!(
                "Sample {} is inconsistent: {} header + {} stripped != {} frame bytes",
                record.sequence_number, header_len, record.stripped_bytes, record.frame_length
            )));
        }

        let record_len = RAW_HEADER_FIXED_LEN + padded_len(header_len);
        let sample_len = FLOW_SAMPLE_FIXED_LEN + 8 + record_len;
        let datagram_len = agent.datagram_overhead() + padded_len(header_len);
        if datagram_len > MAX_DATAGRAM_LEN {
            return Err(PluginError::EncodeFailed(format!(
                "Datagram of {} bytes exceeds the {} byte limit",
                datagram_len, MAX_DATAGRAM_LEN
            )));
        }

        out.reserve(datagram_len);

        // Datagram header
        put_u32(out, SFLOW_VERSION);
        put_agent_address(out, &agent.address);
        put_u32(out, agent.sub_agent_id);
        put_u32(out, self.datagram_sequence);
        put_u32(out, self.uptime_ms());
        put_u32(out, 1);

        // Flow sample
        put_u32(out, FORMAT_FLOW_SAMPLE);
        put_u32(out, sample_len as u32);
        put_u32(out, record.sequence_number);
        // Source id type 0 (ifIndex) in the top byte
        put_u32(out, record.source_id & 0x00ff_ffff);
        put_u32(out, record.sampling_rate);
        put_u32(out, record.sample_pool);
        put_u32(out, record.drops);
        put_u32(out, record.source_id);
        put_u32(out, 0);
        put_u32(out, 1);

        // Raw packet header record
        put_u32(out, FORMAT_RAW_PACKET_HEADER);
        put_u32(out, record_len as u32);
        put_u32(out, record.protocol.wire_value());
        put_u32(out, record.frame_length);
        put_u32(out, record.stripped_bytes);
        put_u32(out, header_len as u32);
        put_opaque(out, &record.raw_header);

        self.datagram_sequence = self.datagram_sequence.wrapping_add(1);

        Ok(())
    }
}
