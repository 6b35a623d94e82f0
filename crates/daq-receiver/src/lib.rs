//! Frame reassembly from network input into shared-memory slots.
//!
//! - [`decoder`]: [`DecoderCore`] buffer bookkeeping and the [`FrameDecoder`] trait
//! - [`packet`]: UDP-style packetised frames ([`PacketFrameDecoder`])
//! - [`stream`]: TCP-style length-prefixed frames ([`StreamFrameDecoder`])
//! - [`transport`]: UDP, TCP and in-memory [`MessageTransport`]s
//! - [`service`]: the [`FrameReceiver`] receive thread and its command channel
//!
//! # Example
//!
//! ```
//! use daq_pool::SharedBufferPool;
//! use daq_receiver::{DecoderCore, FrameDecoder, PacketFrameDecoder};
//!
//! let pool = SharedBufferPool::anonymous(256 * 256 * 2, 4).unwrap();
//! let (ready_tx, _ready_rx) = crossbeam_channel::bounded(4);
//! let mut decoder = PacketFrameDecoder::new(DecoderCore::new("rx", pool, ready_tx), 16);
//! for slot in 0..4 {
//!     decoder.push_empty_buffer(slot);
//! }
//! assert_eq!(decoder.get_num_empty_buffers(), 4);
//! ```

pub mod decoder;
pub mod packet;
pub mod service;
pub mod stream;
pub mod transport;

pub use decoder::{
    DecoderConfig, DecoderCore, DecoderCounters, EmptyBufferPolicy, FrameDecoder, FrameLayout,
    FrameReceiveState, MessageBuffer, CONFIG_PREFIX, PACKET_LOG_TARGET,
};
pub use packet::{packetize, PacketFrameDecoder, PacketHeader, PacketLayout};
pub use service::{FrameReceiver, ReceiverCommand, ReceiverSettings};
pub use stream::{encode_stream_frame, StreamFrameDecoder, StreamHeader};
pub use transport::{ChannelTransport, MessageTransport, TcpTransport, TransportKind, UdpTransport};

use serde::{Deserialize, Serialize};

/// Decoder variants selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
    /// [`PacketFrameDecoder`] over UDP
    #[default]
    Packet,
    /// [`StreamFrameDecoder`] over TCP
    Stream,
}

/// Build a decoder of `kind` around `core`.
///
/// `packets_per_frame` only applies to the packet variant.
#[must_use]
pub fn build_decoder(kind: DecoderKind, core: DecoderCore, packets_per_frame: u16) -> Box<dyn FrameDecoder> {
    match kind {
        DecoderKind::Packet => Box::new(PacketFrameDecoder::new(core, packets_per_frame)),
        DecoderKind::Stream => Box::new(StreamFrameDecoder::new(core)),
    }
}
