//! Datagram decoder: frames split across fixed-size packets.
//!
//! Wire format, all little-endian:
//!
//! | offset | size | field               |
//! |--------|------|---------------------|
//! | 0      | 4    | magic `0x4652_504B` |
//! | 4      | 4    | frame number        |
//! | 8      | 2    | packet number       |
//! | 10     | 2    | packets per frame   |
//! | 12     | 4    | payload size        |
//! | 16     | ...  | payload             |
//!
//! Payload `k` lands at slot offset `k * payload_size`; only the last packet
//! of a frame may be shorter.

use crate::decoder::{
    DecoderCore, FrameDecoder, FrameLayout, FrameReceiveState, MessageBuffer, CONFIG_PREFIX,
    PACKET_LOG_TARGET,
};
use crate::transport::TransportKind;
use daq_core::limits::MAX_DATAGRAM_BYTES;
use daq_core::{join_key, DaqError, ParamMessage, Result};
use tracing::{debug, error, trace, warn};

/// Packet header magic ("FRPK").
pub const PACKET_MAGIC: u32 = 0x4652_504B;

/// Bytes of header preceding each packet payload.
pub const PACKET_HEADER_SIZE: usize = 16;

/// Parsed packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    /// Frame this packet belongs to
    pub frame_number: u32,
    /// Index of this packet within the frame
    pub packet_number: u16,
    /// Packets making up the frame
    pub packets_per_frame: u16,
    /// Bytes of payload following the header
    pub payload_size: u32,
}

impl PacketHeader {
    /// Parse the header at the start of `datagram`. `None` if short or bad magic.
    #[must_use]
    pub fn parse(datagram: &[u8]) -> Option<Self> {
        let header: &[u8; PACKET_HEADER_SIZE] = datagram.get(..PACKET_HEADER_SIZE)?.try_into().ok()?;
        let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        if magic != PACKET_MAGIC {
            return None;
        }
        Some(Self {
            frame_number: u32::from_le_bytes([header[4], header[5], header[6], header[7]]),
            packet_number: u16::from_le_bytes([header[8], header[9]]),
            packets_per_frame: u16::from_le_bytes([header[10], header[11]]),
            payload_size: u32::from_le_bytes([header[12], header[13], header[14], header[15]]),
        })
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut out = [0u8; PACKET_HEADER_SIZE];
        out[0..4].copy_from_slice(&PACKET_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.frame_number.to_le_bytes());
        out[8..10].copy_from_slice(&self.packet_number.to_le_bytes());
        out[10..12].copy_from_slice(&self.packets_per_frame.to_le_bytes());
        out[12..16].copy_from_slice(&self.payload_size.to_le_bytes());
        out
    }
}

/// Packet geometry of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketLayout {
    /// Packets making up a frame
    pub packets_per_frame: u16,
    /// Payload bytes of every packet but the last
    pub payload_size: u32,
}

impl PacketLayout {
    /// Evenly split `frame_size` bytes over `packets_per_frame` packets.
    #[must_use]
    pub fn for_frame(frame_size: usize, packets_per_frame: u16) -> Self {
        let packets = usize::from(packets_per_frame.max(1));
        Self {
            packets_per_frame: packets_per_frame.max(1),
            payload_size: u32::try_from(frame_size.div_ceil(packets)).unwrap_or(u32::MAX),
        }
    }

    /// Check the geometry covers exactly `frame_size` bytes.
    pub fn validate(&self, frame_size: usize) -> std::result::Result<(), String> {
        let packets = usize::from(self.packets_per_frame);
        let payload = self.payload_size as usize;
        if packets == 0 || payload == 0 {
            return Err("packets_per_frame and payload_size must be non-zero".to_string());
        }
        let full = (packets - 1).checked_mul(payload);
        match full {
            Some(full) if full < frame_size && frame_size <= full + payload => Ok(()),
            _ => Err(format!(
                "{packets} packets of {payload} bytes do not cover a {frame_size}-byte frame"
            )),
        }
    }

    /// Payload bytes expected in packet `packet`.
    #[must_use]
    pub fn expected_payload(&self, packet: u16, frame_size: usize) -> usize {
        let payload = self.payload_size as usize;
        if packet + 1 == self.packets_per_frame {
            frame_size.saturating_sub(usize::from(packet) * payload)
        } else {
            payload
        }
    }

    /// Slot offset of packet `packet`.
    #[must_use]
    pub fn offset(&self, packet: u16) -> usize {
        usize::from(packet) * self.payload_size as usize
    }
}

/// Split a frame into wire packets, for senders and simulators.
#[must_use]
pub fn packetize(frame_number: u32, data: &[u8], layout: &PacketLayout) -> Vec<Vec<u8>> {
    data.chunks(layout.payload_size.max(1) as usize)
        .take(usize::from(layout.packets_per_frame))
        .enumerate()
        .map(|(k, payload)| {
            let header = PacketHeader {
                frame_number,
                packet_number: k as u16,
                packets_per_frame: layout.packets_per_frame,
                payload_size: payload.len() as u32,
            };
            let mut packet = Vec::with_capacity(PACKET_HEADER_SIZE + payload.len());
            packet.extend_from_slice(&header.to_bytes());
            packet.extend_from_slice(payload);
            packet
        })
        .collect()
}

/// Frame decoder for packetised datagram transports (UDP).
pub struct PacketFrameDecoder {
    core: DecoderCore,
    layout: PacketLayout,
    packet_buf: Vec<u8>,
}

impl PacketFrameDecoder {
    /// Wrap `core`, splitting its current frame layout into `packets_per_frame` packets.
    #[must_use]
    pub fn new(core: DecoderCore, packets_per_frame: u16) -> Self {
        let frame_size = core.layout().frame_size().unwrap_or(0);
        Self {
            layout: PacketLayout::for_frame(frame_size, packets_per_frame),
            core,
            packet_buf: vec![0u8; MAX_DATAGRAM_BYTES],
        }
    }

    /// Current packet geometry.
    #[must_use]
    pub fn packet_layout(&self) -> PacketLayout {
        self.layout
    }

    fn check_packet(&self, header: &PacketHeader, payload_len: usize, frame_size: usize) -> Option<String> {
        if header.packets_per_frame != self.layout.packets_per_frame {
            return Some(format!(
                "packets_per_frame {} does not match configured {}",
                header.packets_per_frame, self.layout.packets_per_frame
            ));
        }
        if header.packet_number >= header.packets_per_frame {
            return Some(format!(
                "packet number {} out of range for {} packets",
                header.packet_number, header.packets_per_frame
            ));
        }
        let expected = self.layout.expected_payload(header.packet_number, frame_size);
        if header.payload_size as usize != payload_len || payload_len != expected {
            return Some(format!(
                "payload size {} (header {}) does not match expected {expected}",
                payload_len, header.payload_size
            ));
        }
        None
    }
}

impl FrameDecoder for PacketFrameDecoder {
    fn decoder_type(&self) -> &'static str {
        "packet"
    }

    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DecoderCore {
        &mut self.core
    }

    fn transport_kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    fn frame_header_size(&self) -> usize {
        PACKET_HEADER_SIZE
    }

    fn get_next_message_buffer(&mut self) -> Result<MessageBuffer<'_>> {
        Ok(MessageBuffer::Local(&mut self.packet_buf))
    }

    fn process_message(&mut self, bytes_received: usize) -> FrameReceiveState {
        let datagram_len = bytes_received.min(self.packet_buf.len());
        let Some(header) = PacketHeader::parse(&self.packet_buf[..datagram_len]) else {
            let _entered = self.core.span().enter();
            debug!(bytes_received, "Ignoring datagram without a valid packet header");
            return FrameReceiveState::Invalid;
        };
        self.core.counters_mut().packets_received += 1;
        if self.core.config().enable_packet_logging {
            trace!(
                target: PACKET_LOG_TARGET,
                decoder = self.core.name(),
                frame_number = header.frame_number,
                packet_number = header.packet_number,
                packets_per_frame = header.packets_per_frame,
                payload_size = header.payload_size,
                "packet"
            );
        }

        let frame_number = u64::from(header.frame_number);
        let frame_size = self.core.layout().frame_size().unwrap_or(0);
        let payload_len = datagram_len - PACKET_HEADER_SIZE;

        if let Some(reason) = self.check_packet(&header, payload_len, frame_size) {
            let discarded = self.core.discard_frame(frame_number);
            let _entered = self.core.span().enter();
            warn!(frame_number, discarded, reason = %reason, "Malformed packet");
            return FrameReceiveState::Invalid;
        }
        if self.core.was_completed(frame_number) {
            let _entered = self.core.span().enter();
            debug!(
                frame_number,
                packet_number = header.packet_number,
                "Packet for already completed frame"
            );
            return FrameReceiveState::Invalid;
        }
        if self.core.was_dropped(frame_number) {
            return FrameReceiveState::Incomplete;
        }

        let Some(slot_id) = self
            .core
            .begin_frame(frame_number, u32::from(header.packets_per_frame))
        else {
            return FrameReceiveState::Incomplete;
        };

        let packet = usize::from(header.packet_number);
        if self
            .core
            .mapped_mut(frame_number)
            .is_some_and(|entry| entry.has_packet(packet))
        {
            self.core.counters_mut().packets_duplicate += 1;
            return FrameReceiveState::Incomplete;
        }

        let offset = self.layout.offset(header.packet_number);
        let payload = &self.packet_buf[PACKET_HEADER_SIZE..datagram_len];
        if let Err(err) = self.core.write_slot(slot_id, offset, payload) {
            self.core.discard_frame(frame_number);
            let _entered = self.core.span().enter();
            error!(frame_number, error = %err, "Failed to write packet into slot");
            return FrameReceiveState::Invalid;
        }

        let complete = self
            .core
            .mapped_mut(frame_number)
            .is_some_and(|entry| entry.mark_packet(packet));
        if !complete {
            return FrameReceiveState::Incomplete;
        }
        match self.core.complete_frame(frame_number) {
            Ok(()) => FrameReceiveState::Complete,
            Err(err) => {
                let _entered = self.core.span().enter();
                error!(frame_number, error = %err, "Failed to release completed frame");
                FrameReceiveState::Invalid
            }
        }
    }

    fn configure_variant(&mut self, layout: &FrameLayout, params: &ParamMessage) -> Result<()> {
        let frame_size = layout.frame_size().unwrap_or(0);
        let ppf_key = join_key(CONFIG_PREFIX, "packets_per_frame");
        let payload_key = join_key(CONFIG_PREFIX, "payload_size");

        let packets_per_frame = match params.get_u64(&ppf_key)? {
            Some(n) => u16::try_from(n)
                .map_err(|_| DaqError::malformed_parameter(&ppf_key, format!("{n} exceeds u16")))?,
            None => self.layout.packets_per_frame,
        };
        let staged = match params.get_u64(&payload_key)? {
            Some(n) => PacketLayout {
                packets_per_frame,
                payload_size: u32::try_from(n)
                    .map_err(|_| DaqError::malformed_parameter(&payload_key, format!("{n} exceeds u32")))?,
            },
            None => {
                let kept = PacketLayout {
                    packets_per_frame,
                    payload_size: self.layout.payload_size,
                };
                if kept.validate(frame_size).is_ok() {
                    kept
                } else {
                    PacketLayout::for_frame(frame_size, packets_per_frame)
                }
            }
        };
        staged
            .validate(frame_size)
            .map_err(|reason| DaqError::malformed_parameter(&payload_key, reason))?;
        if staged.payload_size as usize + PACKET_HEADER_SIZE > MAX_DATAGRAM_BYTES {
            return Err(DaqError::malformed_parameter(
                &payload_key,
                format!("payload of {} bytes exceeds datagram limit", staged.payload_size),
            ));
        }
        self.layout = staged;
        Ok(())
    }

    fn request_variant_configuration(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "packets_per_frame"), self.layout.packets_per_frame);
        msg.set(&join_key(prefix, "payload_size"), self.layout.payload_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::{unbounded, Receiver};
    use daq_core::Frame;
    use daq_pool::SharedBufferPool;
    use std::time::{Duration, Instant};

    /// 8x8 raw8 frames (64 bytes) in 4 packets of 16 bytes.
    fn decoder(slots: usize) -> (PacketFrameDecoder, Receiver<Frame>) {
        let pool = SharedBufferPool::anonymous(64, slots).unwrap();
        let (tx, rx) = unbounded();
        let mut decoder = PacketFrameDecoder::new(DecoderCore::new("packet", pool, tx), 4);
        let mut params = ParamMessage::new();
        params.set("decoder_config/pixel_type", "raw8");
        params.set("decoder_config/dimensions", vec![8, 8]);
        params.set("decoder_config/packets_per_frame", 4);
        decoder.init(&params).unwrap();
        for id in 0..slots {
            decoder.push_empty_buffer(id);
        }
        (decoder, rx)
    }

    fn feed(decoder: &mut PacketFrameDecoder, packet: &[u8]) -> FrameReceiveState {
        let mut buf = decoder.get_next_message_buffer().unwrap();
        buf[..packet.len()].copy_from_slice(packet);
        drop(buf);
        decoder.process_message(packet.len())
    }

    fn frame_data(seed: u8) -> Vec<u8> {
        (0..64).map(|i| seed.wrapping_add(i)).collect()
    }

    #[test]
    fn test_header_parse() {
        let header = PacketHeader {
            frame_number: 9,
            packet_number: 2,
            packets_per_frame: 4,
            payload_size: 16,
        };
        assert_eq!(PacketHeader::parse(&header.to_bytes()), Some(header));
        assert_eq!(PacketHeader::parse(&[0u8; 16]), None);
        assert_eq!(PacketHeader::parse(&header.to_bytes()[..10]), None);
    }

    #[test]
    fn test_layout_validation() {
        assert!(PacketLayout { packets_per_frame: 4, payload_size: 16 }.validate(64).is_ok());
        assert!(PacketLayout { packets_per_frame: 4, payload_size: 20 }.validate(64).is_ok());
        assert!(PacketLayout { packets_per_frame: 4, payload_size: 10 }.validate(64).is_err());
        assert!(PacketLayout { packets_per_frame: 4, payload_size: 32 }.validate(64).is_err());
        assert_eq!(PacketLayout::for_frame(100, 3).payload_size, 34);
    }

    #[test]
    fn test_complete_frame_delivered_once() {
        let (mut decoder, rx) = decoder(2);
        let data = frame_data(1);
        let packets = packetize(0, &data, &decoder.packet_layout());
        assert_eq!(packets.len(), 4);

        let states: Vec<_> = packets.iter().rev().map(|p| feed(&mut decoder, p)).collect();
        assert_eq!(states[..3], [FrameReceiveState::Incomplete; 3]);
        assert_eq!(states[3], FrameReceiveState::Complete);

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.data(), data.as_slice());
        assert_eq!(frame.metadata().packets_received, 4);
        assert!(!frame.metadata().incomplete);
        assert!(rx.try_recv().is_err());
        assert_eq!(decoder.get_num_mapped_buffers(), 0);
        assert_eq!(decoder.core().counters().frames_received, 1);
    }

    #[test]
    fn test_duplicate_of_completed_frame_is_invalid() {
        let (mut decoder, rx) = decoder(2);
        let packets = packetize(3, &frame_data(0), &decoder.packet_layout());
        for packet in &packets {
            feed(&mut decoder, packet);
        }
        assert_eq!(feed(&mut decoder, &packets[1]), FrameReceiveState::Invalid);
        assert_eq!(rx.len(), 1);
        assert_eq!(decoder.get_num_mapped_buffers(), 0);
    }

    #[test]
    fn test_duplicate_within_frame_counted() {
        let (mut decoder, _rx) = decoder(2);
        let packets = packetize(3, &frame_data(0), &decoder.packet_layout());
        feed(&mut decoder, &packets[0]);
        assert_eq!(feed(&mut decoder, &packets[0]), FrameReceiveState::Incomplete);
        assert_eq!(decoder.core().counters().packets_duplicate, 1);
    }

    #[test]
    fn test_missing_packets_time_out() {
        let (mut decoder, rx) = decoder(2);
        let packets = packetize(5, &frame_data(0), &decoder.packet_layout());
        feed(&mut decoder, &packets[0]);
        feed(&mut decoder, &packets[2]);

        let later = Instant::now() + Duration::from_millis(decoder.core().frame_timeout_ms() + 5);
        assert_eq!(decoder.core_mut().monitor_buffers_at(later), 1);

        let frame = rx.try_recv().unwrap();
        assert!(frame.metadata().incomplete);
        assert_eq!(decoder.core().frames_timedout(), 1);
        assert_eq!(decoder.core().counters().packets_lost, 2);
        assert_eq!(decoder.get_num_mapped_buffers(), 0);
    }

    #[test]
    fn test_malformed_packet_discards_open_frame() {
        let (mut decoder, rx) = decoder(2);
        let packets = packetize(1, &frame_data(0), &decoder.packet_layout());
        feed(&mut decoder, &packets[0]);
        assert_eq!(decoder.get_num_empty_buffers(), 1);

        let mut bad = packets[1].clone();
        bad[8..10].copy_from_slice(&9u16.to_le_bytes());
        assert_eq!(feed(&mut decoder, &bad), FrameReceiveState::Invalid);
        assert_eq!(decoder.get_num_mapped_buffers(), 0);
        assert_eq!(decoder.get_num_empty_buffers(), 2);
        assert_eq!(decoder.core().counters().frames_invalid, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_malformed_packet_without_open_frame() {
        let (mut decoder, _rx) = decoder(2);
        let mut bad = packetize(1, &frame_data(0), &decoder.packet_layout())[0].clone();
        bad.truncate(20);
        assert_eq!(feed(&mut decoder, &bad), FrameReceiveState::Invalid);
        assert_eq!(decoder.core().counters().frames_invalid, 0);
        assert_eq!(decoder.get_num_empty_buffers(), 2);
        assert_eq!(feed(&mut decoder, &[1, 2, 3]), FrameReceiveState::Invalid);
    }

    #[test]
    fn test_drop_policy_skips_whole_frame() {
        let (mut decoder, rx) = decoder(1);
        let mut params = ParamMessage::new();
        params.set("decoder_config/empty_buffer_policy", "drop");
        decoder.configure(&params).unwrap();
        decoder.drop_all_buffers();

        for packet in packetize(1, &frame_data(0), &decoder.packet_layout()) {
            assert_eq!(feed(&mut decoder, &packet), FrameReceiveState::Incomplete);
        }
        assert_eq!(decoder.core().counters().frames_dropped, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_configure_rejects_bad_packet_geometry() {
        let (mut decoder, _rx) = decoder(1);
        let mut params = ParamMessage::new();
        params.set("decoder_config/payload_size", 8);
        params.set("decoder_config/frame_timeout_ms", 5);
        assert!(decoder.configure(&params).is_err());
        assert_eq!(decoder.packet_layout().payload_size, 16);
        assert_ne!(decoder.core().frame_timeout_ms(), 5);
    }

    #[test]
    fn test_status_and_configuration() {
        let (decoder, _rx) = decoder(3);
        let mut msg = ParamMessage::new();
        decoder.request_configuration("decoder_config", &mut msg);
        assert_eq!(msg.get_u64("decoder_config/packets_per_frame").unwrap(), Some(4));
        assert_eq!(msg.get_u64("decoder_config/payload_size").unwrap(), Some(16));

        let mut status = ParamMessage::new();
        decoder.get_status("decoder", &mut status);
        assert_eq!(status.get_str("decoder/decoder_type").unwrap(), Some("packet"));
        assert_eq!(status.get_u64("decoder/empty_buffers").unwrap(), Some(3));
        assert_eq!(status.get_u64("decoder/frame_buffer_size").unwrap(), Some(64));
    }
}
