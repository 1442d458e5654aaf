//! PCM packet framing
//!
//! Packet layout (all fields big-endian):
//!
//! ```text
//! ┌─────────┬──────────┬───────────┬─────────────┬──────────┬───────┬─────────────┬──────────────┐
//! │ magic   │ sequence │ timestamp │ sample rate │ channels │ flags │ sample count│ i16 samples… │
//! │ u32     │ u32      │ u32       │ u32         │ u8       │ u8    │ u16         │ interleaved  │
//! └─────────┴──────────┴───────────┴─────────────┴──────────┴───────┴─────────────┴──────────────┘
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::audio::AudioChunk;
use crate::error::NetworkError;

/// "PCM1"
pub const PCM_MAGIC: u32 = 0x5043_4D31;

/// Size of the fixed packet header
pub const HEADER_LEN: usize = 20;

/// Set on the final packet of a chunk
pub const FLAG_END_OF_CHUNK: u8 = 0x01;

/// Decoded packet header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub sequence: u32,
    pub timestamp: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub flags: u8,
    pub sample_count: u16,
}

/// Frames chunks into packets, numbering them per endpoint.
#[derive(Debug, Clone)]
pub struct PacketFramer {
    sequence: u32,
    max_packet: Option<usize>,
}

impl PacketFramer {
    /// `max_packet` bounds each packet for datagram transports; `None`
    /// sends one packet per chunk.
    pub fn new(max_packet: Option<usize>) -> Self {
        Self {
            sequence: 0,
            max_packet,
        }
    }

    /// Samples (per channel) that fit in one packet
    fn samples_per_packet(&self, channels: u8) -> usize {
        let frame_bytes = 2 * channels as usize;
        match self.max_packet {
            Some(max) => ((max.saturating_sub(HEADER_LEN)) / frame_bytes).clamp(1, u16::MAX as usize),
            None => u16::MAX as usize,
        }
    }

    /// Frame a chunk, converting samples to network byte order.
    pub fn frame(&mut self, chunk: &AudioChunk) -> Vec<Bytes> {
        let channels = chunk.channels() as usize;
        let per_packet = self.samples_per_packet(chunk.channels());
        let total = chunk.sample_count();
        let mut packets = Vec::with_capacity(total.div_ceil(per_packet));

        let mut offset = 0;
        while offset < total {
            let count = per_packet.min(total - offset);
            let last = offset + count == total;
            let timestamp = chunk
                .timestamp()
                .wrapping_add((offset as u64 * 1000 / chunk.sample_rate() as u64) as u32);

            let mut buf = BytesMut::with_capacity(HEADER_LEN + count * channels * 2);
            buf.put_u32(PCM_MAGIC);
            buf.put_u32(self.sequence);
            buf.put_u32(timestamp);
            buf.put_u32(chunk.sample_rate());
            buf.put_u8(chunk.channels());
            buf.put_u8(if last { FLAG_END_OF_CHUNK } else { 0 });
            buf.put_u16(count as u16);
            for sample in &chunk.pcm()[offset * channels..(offset + count) * channels] {
                buf.put_i16(*sample);
            }

            packets.push(buf.freeze());
            self.sequence = self.sequence.wrapping_add(1);
            offset += count;
        }

        packets
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence(&self) -> u32 {
        self.sequence
    }
}

/// Parse one packet back into its header and native-order samples.
pub fn decode_packet(packet: &[u8]) -> Result<(PacketHeader, Vec<i16>), NetworkError> {
    if packet.len() < HEADER_LEN {
        return Err(NetworkError::ReceiveFailed(format!(
            "short packet: {} bytes",
            packet.len()
        )));
    }

    let mut buf = packet;
    if buf.get_u32() != PCM_MAGIC {
        return Err(NetworkError::ReceiveFailed("bad magic".into()));
    }
    let header = PacketHeader {
        sequence: buf.get_u32(),
        timestamp: buf.get_u32(),
        sample_rate: buf.get_u32(),
        channels: buf.get_u8(),
        flags: buf.get_u8(),
        sample_count: buf.get_u16(),
    };

    let expected = header.sample_count as usize * header.channels as usize;
    if buf.remaining() != expected * 2 {
        return Err(NetworkError::ReceiveFailed(format!(
            "payload holds {} bytes, header announces {}",
            buf.remaining(),
            expected * 2
        )));
    }

    let mut samples = Vec::with_capacity(expected);
    while buf.has_remaining() {
        samples.push(buf.get_i16());
    }
    Ok((header, samples))
}
