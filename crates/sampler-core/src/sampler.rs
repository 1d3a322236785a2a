//! Sampling and truncation engine
//!
//! The [`Sampler`] decides which observed frames become flow samples and
//! builds the [`FlowSampleRecord`] for each one. Selection is a fixed-phase
//! modulo test on the count of observed frames: with a rate of N, the Nth,
//! 2Nth, 3Nth, ... frames are sampled regardless of their content.

use std::num::NonZeroU32;

/// Default sampling rate (one frame in every 256)
pub const DEFAULT_SAMPLING_RATE: u32 = 256;

/// Default number of header bytes retained per sample
pub const DEFAULT_CAPTURE_LIMIT: u32 = 256;

/// A raw link-layer frame as handed over by a capture source
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedFrame {
    /// Frame bytes, starting at the link-layer header
    pub data: Vec<u8>,

    /// True on-wire length of the frame
    pub length: u32,
}

impl CapturedFrame {
    /// Frame whose true length is the number of captured bytes
    pub fn new(data: Vec<u8>) -> Self {
        let length = u32::try_from(data.len()).unwrap_or(u32::MAX);
        Self { data, length }
    }

    /// Frame from a source that already cut the bytes short of the true length
    pub fn with_length(data: Vec<u8>, length: u32) -> Self {
        Self { data, length }
    }
}

/// Protocol of the bytes carried in a sampled header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HeaderProtocol {
    /// ISO 8802-3 / Ethernet
    #[default]
    Ethernet,
}

impl HeaderProtocol {
    /// sFlow `header_protocol` value
    pub fn wire_value(self) -> u32 {
        match self {
            HeaderProtocol::Ethernet => 1,
        }
    }
}

/// One sampled frame, ready for encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowSampleRecord {
    /// Sample sequence number, assigned in emission order starting at 0
    pub sequence_number: u32,

    /// Sampling rate in effect when the sample was taken
    pub sampling_rate: u32,

    /// Frames observed so far, including this one (low 32 bits)
    pub sample_pool: u32,

    /// Frames lost before reaching the sampler
    pub drops: u32,

    /// Interface index the frame was observed on, 0 if unknown
    pub source_id: u32,

    /// Link-layer protocol of `raw_header`
    pub protocol: HeaderProtocol,

    /// True length of the frame
    pub frame_length: u32,

    /// Bytes removed from the end of the frame
    pub stripped_bytes: u32,

    /// Retained prefix of the frame
    pub raw_header: Vec<u8>,
}

impl FlowSampleRecord {
    /// Length of the retained header
    pub fn header_length(&self) -> u32 {
        self.raw_header.len() as u32
    }
}

/// Per-process sampling state
///
/// A `Sampler` must have exactly one owner: sequence numbers are only gapless
/// if every frame goes through the same instance, one call at a time.
#[derive(Debug, Clone)]
pub struct Sampler {
    sampling_rate: NonZeroU32,
    capture_limit: u32,
    source_id: u32,
    frame_counter: u64,
    sequence_number: u32,
}

impl Sampler {
    pub fn new(sampling_rate: NonZeroU32, capture_limit: u32) -> Self {
        Self {
            sampling_rate,
            capture_limit,
            source_id: 0,
            frame_counter: 0,
            sequence_number: 0,
        }
    }

    /// Set the interface index reported in every sample
    pub fn with_source_id(mut self, source_id: u32) -> Self {
        self.source_id = source_id;
        self
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate.get()
    }

    pub fn capture_limit(&self) -> u32 {
        self.capture_limit
    }

    /// Frames observed since start
    pub fn frames_observed(&self) -> u64 {
        self.frame_counter
    }

    /// Sequence number the next emitted sample will carry
    pub fn next_sequence_number(&self) -> u32 {
        self.sequence_number
    }

    /// Samples emitted since start (modulo 2^32)
    pub fn samples_emitted(&self) -> u32 {
        self.sequence_number
    }

    /// Observe the next frame, returning a sample if it is selected.
    ///
    /// Skipped frames only advance the frame counter.
    pub fn observe(&mut self, frame: &CapturedFrame) -> Option<FlowSampleRecord> {
        self.frame_counter = self.frame_counter.wrapping_add(1);

        if self.frame_counter % u64::from(self.sampling_rate.get()) != 0 {
            return None;
        }

        // Never slice past the bytes actually held; the true length may exceed them.
        let available = u32::try_from(frame.data.len()).unwrap_or(u32::MAX);
        let retained = frame.length.min(self.capture_limit).min(available);
        let stripped_bytes = frame.length - retained;

        let record = FlowSampleRecord {
            sequence_number: self.sequence_number,
            sampling_rate: self.sampling_rate.get(),
            sample_pool: self.frame_counter as u32,
            drops: 0,
            source_id: self.source_id,
            protocol: HeaderProtocol::Ethernet,
            frame_length: frame.length,
            stripped_bytes,
            raw_header: frame.data[..retained as usize].to_vec(),
        };

        self.sequence_number = self.sequence_number.wrapping_add(1);

        Some(record)
    }
}

impl Default for Sampler {
    fn default() -> Self {
        Self::new(
            NonZeroU32::new(DEFAULT_SAMPLING_RATE).unwrap_or(NonZeroU32::MIN),
            DEFAULT_CAPTURE_LIMIT,
        )
    }
}
