//! Stream decoder: length-prefixed frames over a byte stream (TCP).
//!
//! Each frame is preceded by a 16-byte little-endian header:
//! `magic: u32 = 0x4652_5354`, `frame_number: u32`, `payload_len: u32`,
//! `reserved: u32`. The payload is received directly into the frame's slot.

use crate::decoder::{DecoderCore, FrameDecoder, FrameReceiveState, MessageBuffer, PACKET_LOG_TARGET};
use crate::transport::TransportKind;
use daq_core::limits::MAX_FRAME_BYTES;
use daq_core::Result;
use daq_pool::SlotId;
use tracing::{debug, error, trace, warn};

/// Stream frame header magic ("FRST").
pub const STREAM_MAGIC: u32 = 0x4652_5354;

/// Bytes of header preceding each frame payload.
pub const STREAM_HEADER_SIZE: usize = 16;

/// Parsed stream frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamHeader {
    /// Frame number
    pub frame_number: u32,
    /// Bytes of payload following the header
    pub payload_len: u32,
}

impl StreamHeader {
    /// Parse a header. `None` if short or bad magic.
    #[must_use]
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let word = |i: usize| -> Option<u32> {
            let b = bytes.get(i * 4..i * 4 + 4)?;
            Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        };
        if word(0)? != STREAM_MAGIC {
            return None;
        }
        Some(Self {
            frame_number: word(1)?,
            payload_len: word(2)?,
        })
    }

    /// Encode to wire bytes.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; STREAM_HEADER_SIZE] {
        let mut out = [0u8; STREAM_HEADER_SIZE];
        out[0..4].copy_from_slice(&STREAM_MAGIC.to_le_bytes());
        out[4..8].copy_from_slice(&self.frame_number.to_le_bytes());
        out[8..12].copy_from_slice(&self.payload_len.to_le_bytes());
        out
    }
}

/// Header plus payload, as a sender writes it.
#[must_use]
pub fn encode_stream_frame(frame_number: u32, payload: &[u8]) -> Vec<u8> {
    let header = StreamHeader {
        frame_number,
        payload_len: payload.len() as u32,
    };
    let mut out = Vec::with_capacity(STREAM_HEADER_SIZE + payload.len());
    out.extend_from_slice(&header.to_bytes());
    out.extend_from_slice(payload);
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PayloadTarget {
    /// Mapped slot; the frame completes when the payload is in.
    Slot(SlotId),
    /// No slot was available; bytes go to scratch.
    Dropped,
    /// Duplicate or mis-sized frame; bytes go to scratch.
    Discarded,
    /// The timeout monitor released the frame mid-payload; the rest is skipped.
    Released,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamState {
    Header {
        filled: usize,
    },
    Payload {
        frame_number: u64,
        target: PayloadTarget,
        len: usize,
        filled: usize,
    },
}

/// Frame decoder for byte-stream transports.
pub struct StreamFrameDecoder {
    core: DecoderCore,
    header_buf: [u8; STREAM_HEADER_SIZE],
    state: StreamState,
}

impl StreamFrameDecoder {
    /// Wrap `core`.
    #[must_use]
    pub fn new(core: DecoderCore) -> Self {
        Self {
            core,
            header_buf: [0u8; STREAM_HEADER_SIZE],
            state: StreamState::Header { filled: 0 },
        }
    }

    fn begin_payload(&mut self) -> FrameReceiveState {
        let Some(header) = StreamHeader::parse(&self.header_buf) else {
            let _entered = self.core.span().enter();
            warn!("Stream header has bad magic - resynchronising on next header");
            return FrameReceiveState::Invalid;
        };
        self.core.counters_mut().packets_received += 1;
        if self.core.config().enable_packet_logging {
            trace!(
                target: PACKET_LOG_TARGET,
                decoder = self.core.name(),
                frame_number = header.frame_number,
                payload_len = header.payload_len,
                "stream header"
            );
        }

        let frame_number = u64::from(header.frame_number);
        let len = header.payload_len as usize;
        if len > MAX_FRAME_BYTES {
            let _entered = self.core.span().enter();
            warn!(frame_number, len, "Stream payload exceeds frame limit");
            return FrameReceiveState::Invalid;
        }

        let frame_size = self.core.layout().frame_size().unwrap_or(0);
        let target = if len != frame_size {
            let _entered = self.core.span().enter();
            warn!(frame_number, len, frame_size, "Stream payload size mismatch");
            PayloadTarget::Discarded
        } else if self.core.was_completed(frame_number) {
            let _entered = self.core.span().enter();
            debug!(frame_number, "Stream frame already completed");
            PayloadTarget::Discarded
        } else {
            match self.core.begin_frame(frame_number, 1) {
                Some(slot_id) => PayloadTarget::Slot(slot_id),
                None => PayloadTarget::Dropped,
            }
        };

        self.state = StreamState::Payload {
            frame_number,
            target,
            len,
            filled: 0,
        };
        if len == 0 {
            return self.finish_payload(frame_number, target);
        }
        FrameReceiveState::Incomplete
    }

    /// Stop writing into a slot the core no longer maps to this frame.
    fn detach_released_frame(&mut self) {
        let StreamState::Payload {
            frame_number,
            target: PayloadTarget::Slot(slot_id),
            len,
            filled,
        } = self.state
        else {
            return;
        };
        if self.core.mapped_mut(frame_number).is_some() {
            return;
        }
        let _entered = self.core.span().enter();
        debug!(
            frame_number,
            slot_id,
            remaining = len - filled,
            "Frame released before payload finished - skipping remainder"
        );
        self.state = StreamState::Payload {
            frame_number,
            target: PayloadTarget::Released,
            len,
            filled,
        };
    }

    fn finish_payload(&mut self, frame_number: u64, target: PayloadTarget) -> FrameReceiveState {
        self.state = StreamState::Header { filled: 0 };
        match target {
            PayloadTarget::Slot(_) => {
                if let Some(entry) = self.core.mapped_mut(frame_number) {
                    entry.mark_packet(0);
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
            PayloadTarget::Dropped | PayloadTarget::Released => FrameReceiveState::Incomplete,
            PayloadTarget::Discarded => FrameReceiveState::Invalid,
        }
    }
}

impl FrameDecoder for StreamFrameDecoder {
    fn decoder_type(&self) -> &'static str {
        "stream"
    }

    fn core(&self) -> &DecoderCore {
        &self.core
    }

    fn core_mut(&mut self) -> &mut DecoderCore {
        &mut self.core
    }

    fn transport_kind(&self) -> TransportKind {
        TransportKind::Stream
    }

    fn frame_header_size(&self) -> usize {
        STREAM_HEADER_SIZE
    }

    fn get_next_message_buffer(&mut self) -> Result<MessageBuffer<'_>> {
        self.detach_released_frame();
        match self.state {
            StreamState::Header { filled } => Ok(MessageBuffer::Local(&mut self.header_buf[filled..])),
            StreamState::Payload {
                target: PayloadTarget::Slot(slot_id),
                len,
                filled,
                ..
            } => self.core.slot_buffer(slot_id, filled..len),
            StreamState::Payload { len, filled, .. } => {
                Ok(MessageBuffer::Local(self.core.scratch_buffer(len - filled)))
            }
        }
    }

    fn process_message(&mut self, bytes_received: usize) -> FrameReceiveState {
        if bytes_received == 0 {
            return FrameReceiveState::Incomplete;
        }
        self.detach_released_frame();
        match self.state {
            StreamState::Header { filled } => {
                let filled = (filled + bytes_received).min(STREAM_HEADER_SIZE);
                if filled < STREAM_HEADER_SIZE {
                    self.state = StreamState::Header { filled };
                    return FrameReceiveState::Incomplete;
                }
                self.state = StreamState::Header { filled: 0 };
                self.begin_payload()
            }
            StreamState::Payload {
                frame_number,
                target,
                len,
                filled,
            } => {
                let filled = (filled + bytes_received).min(len);
                if filled < len {
                    self.state = StreamState::Payload {
                        frame_number,
                        target,
                        len,
                        filled,
                    };
                    return FrameReceiveState::Incomplete;
                }
                self.finish_payload(frame_number, target)
            }
        }
    }

    /// Forget the partial header or payload; an open frame gives its slot back.
    fn reset(&mut self) {
        if let StreamState::Payload {
            frame_number,
            target: PayloadTarget::Slot(_),
            ..
        } = self.state
        {
            self.core.discard_frame(frame_number);
        }
        self.state = StreamState::Header { filled: 0 };
    }
}
