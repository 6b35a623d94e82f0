//! Protocol-independent frame reassembly.
//!
//! [`DecoderCore`] owns the buffer bookkeeping every decoder shares:
//!
//! ```text
//!   push_empty_buffer ──> EmptyBufferQueue ──begin_frame──> FrameBufferMap
//!          ^                                                     │
//!          │                              complete / timeout     │
//!   release channel <── SlotLease dropped <── Frame <────────────┘
//! ```
//!
//! A slot id is in exactly one place at a time: the empty queue, the map of
//! frames being filled, or a lease held by a completed [`Frame`]. The decoder
//! never pushes a completed frame's slot back itself; the slot comes back on
//! the release channel once the last reference to the frame is dropped.
//!
//! Transport variants implement [`FrameDecoder`]: they supply the next receive
//! buffer and interpret what arrived in it, calling into the core to start,
//! fill, complete or discard frames.

#![allow(unsafe_code)]

use crate::transport::TransportKind;
use crossbeam_channel::{Receiver, Sender};
use daq_core::limits::{
    COMPLETED_FRAME_HISTORY, DEFAULT_EMPTY_BUFFER_TIMEOUT_MS, DEFAULT_FRAME_TIMEOUT_MS,
};
use daq_core::{join_key, DaqError, DataBlock, Frame, FrameMetadata, ParamMessage, PixelType, Result};
use daq_pool::{PoolError, SharedBufferPool, SlotId, SlotViewMut};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::ops::{Deref, DerefMut, Range};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn, Span};

/// Parameter namespace for decoder settings.
pub const CONFIG_PREFIX: &str = "decoder_config";

/// Tracing target for per-packet logs.
pub const PACKET_LOG_TARGET: &str = "packet_log";

/// Outcome of processing one received message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameReceiveState {
    /// More data is needed before a frame can be released
    Incomplete,
    /// A frame was completed and emitted
    Complete,
    /// A frame was emitted with data missing
    CompleteMissingFrames,
    /// The message was malformed or belonged to a finished frame
    Invalid,
}

/// What to do when a new frame arrives and the empty queue is dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "lowercase")]
pub enum EmptyBufferPolicy {
    /// Wait on the release channel up to `timeout_ms`, then drop the frame.
    Block {
        /// Longest wait for a released slot
        timeout_ms: u64,
    },
    /// Drop the frame immediately.
    Drop,
}

impl Default for EmptyBufferPolicy {
    fn default() -> Self {
        Self::Block {
            timeout_ms: DEFAULT_EMPTY_BUFFER_TIMEOUT_MS,
        }
    }
}

impl EmptyBufferPolicy {
    /// Configuration name (`block` or `drop`).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Block { .. } => "block",
            Self::Drop => "drop",
        }
    }

    fn timeout_ms(&self) -> u64 {
        match self {
            Self::Block { timeout_ms } => *timeout_ms,
            Self::Drop => DEFAULT_EMPTY_BUFFER_TIMEOUT_MS,
        }
    }
}

/// Settings common to all decoders.
#[derive(Debug, Clone, PartialEq)]
pub struct DecoderConfig {
    /// Log every packet header on the `packet_log` target
    pub enable_packet_logging: bool,
    /// Age after which an incomplete frame is released
    pub frame_timeout_ms: u64,
    /// Behaviour when no empty slot is available
    pub empty_buffer_policy: EmptyBufferPolicy,
    /// Stamped on every emitted frame
    pub acquisition_id: String,
}

impl Default for DecoderConfig {
    fn default() -> Self {
        Self {
            enable_packet_logging: false,
            frame_timeout_ms: DEFAULT_FRAME_TIMEOUT_MS,
            empty_buffer_policy: EmptyBufferPolicy::default(),
            acquisition_id: String::new(),
        }
    }
}

impl DecoderConfig {
    /// Return a copy with the `decoder_config/` keys of `params` applied.
    ///
    /// Missing keys keep their values; a mistyped key fails the whole update.
    pub fn updated(&self, params: &ParamMessage) -> Result<Self> {
        let key = |name: &str| join_key(CONFIG_PREFIX, name);

        let enable_packet_logging = params.get_bool(&key("enable_packet_logging"))?;
        let frame_timeout_ms = params.get_u64(&key("frame_timeout_ms"))?;
        let policy_name = params.get_str(&key("empty_buffer_policy"))?;
        let policy_timeout = params.get_u64(&key("empty_buffer_timeout_ms"))?;
        let acquisition_id = params.get_str(&key("acquisition_id"))?;

        let timeout_ms = policy_timeout.unwrap_or_else(|| self.empty_buffer_policy.timeout_ms());
        let empty_buffer_policy = match policy_name.unwrap_or(self.empty_buffer_policy.name()) {
            "block" => EmptyBufferPolicy::Block { timeout_ms },
            "drop" => EmptyBufferPolicy::Drop,
            other => {
                return Err(DaqError::malformed_parameter(
                    key("empty_buffer_policy"),
                    format!("expected 'block' or 'drop', got '{other}'"),
                ))
            }
        };

        Ok(Self {
            enable_packet_logging: enable_packet_logging.unwrap_or(self.enable_packet_logging),
            frame_timeout_ms: frame_timeout_ms.unwrap_or(self.frame_timeout_ms),
            empty_buffer_policy,
            acquisition_id: acquisition_id.map_or_else(|| self.acquisition_id.clone(), str::to_string),
        })
    }

    fn write(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "enable_packet_logging"), self.enable_packet_logging);
        msg.set(&join_key(prefix, "frame_timeout_ms"), self.frame_timeout_ms);
        msg.set(&join_key(prefix, "empty_buffer_policy"), self.empty_buffer_policy.name());
        msg.set(
            &join_key(prefix, "empty_buffer_timeout_ms"),
            self.empty_buffer_policy.timeout_ms(),
        );
        msg.set(&join_key(prefix, "acquisition_id"), self.acquisition_id.as_str());
    }
}

/// Geometry of the frames a decoder produces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameLayout {
    /// Dataset frames are assigned to
    pub dataset_name: String,
    /// Pixel encoding
    pub pixel_type: PixelType,
    /// Per-axis dimensions
    pub dimensions: Vec<usize>,
}

impl Default for FrameLayout {
    fn default() -> Self {
        Self {
            dataset_name: "data".to_string(),
            pixel_type: PixelType::Raw16,
            dimensions: vec![256, 256],
        }
    }
}

impl FrameLayout {
    /// Bytes per frame, or `None` if the dimensions overflow.
    #[must_use]
    pub fn frame_size(&self) -> Option<usize> {
        self.dimensions
            .iter()
            .try_fold(self.pixel_type.size(), |acc, &d| acc.checked_mul(d))
    }

    /// Return a copy with `decoder_config/{dataset,pixel_type,dimensions}` applied.
    pub fn updated(&self, params: &ParamMessage) -> Result<Self> {
        let key = |name: &str| join_key(CONFIG_PREFIX, name);
        let mut layout = self.clone();

        if let Some(name) = params.get_str(&key("dataset"))? {
            layout.dataset_name = name.to_string();
        }
        if let Some(name) = params.get_str(&key("pixel_type"))? {
            layout.pixel_type = PixelType::from_name(name).ok_or_else(|| {
                DaqError::malformed_parameter(key("pixel_type"), format!("unknown pixel type '{name}'"))
            })?;
        }
        if let Some(value) = params.get(&key("dimensions")) {
            let dims = value
                .as_array()
                .and_then(|items| {
                    items
                        .iter()
                        .map(|v| v.as_u64().and_then(|d| usize::try_from(d).ok()))
                        .collect::<Option<Vec<_>>>()
                })
                .ok_or_else(|| {
                    DaqError::malformed_parameter(key("dimensions"), "expected array of unsigned integers")
                })?;
            layout.dimensions = dims;
        }

        match layout.frame_size() {
            Some(size) if size > 0 => Ok(layout),
            _ => Err(DaqError::malformed_parameter(
                key("dimensions"),
                format!("frame size of {:?} is zero or overflows", layout.dimensions),
            )),
        }
    }

    fn write(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "dataset"), self.dataset_name.as_str());
        msg.set(
            &join_key(prefix, "pixel_type"),
            serde_json::to_value(self.pixel_type).unwrap_or_default(),
        );
        msg.set(&join_key(prefix, "dimensions"), self.dimensions.clone());
    }

    fn metadata(&self, frame_number: u64) -> FrameMetadata {
        FrameMetadata::new(
            frame_number,
            self.dataset_name.as_str(),
            self.pixel_type,
            self.dimensions.clone(),
        )
    }
}

/// Decoder counters reported in status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecoderCounters {
    /// Frames emitted (complete or timed out)
    pub frames_received: u64,
    /// Frames released by the timeout monitor
    pub frames_timedout: u64,
    /// Frames discarded because no empty slot was available
    pub frames_dropped: u64,
    /// Open frames discarded before completion
    pub frames_invalid: u64,
    /// Messages with a valid header
    pub packets_received: u64,
    /// Packets missing from timed-out frames
    pub packets_lost: u64,
    /// Repeated packets within a frame being filled
    pub packets_duplicate: u64,
}

/// A frame being filled: its slot, start time and packet bitmap.
#[derive(Debug, Clone)]
pub struct MappedFrame {
    slot_id: SlotId,
    started: Instant,
    received: Vec<bool>,
    packets_received: u32,
}

impl MappedFrame {
    fn new(slot_id: SlotId, packets_expected: u32, started: Instant) -> Self {
        Self {
            slot_id,
            started,
            received: vec![false; packets_expected as usize],
            packets_received: 0,
        }
    }

    /// Slot the frame is written into.
    #[must_use]
    pub fn slot_id(&self) -> SlotId {
        self.slot_id
    }

    /// Packets the frame consists of.
    #[must_use]
    pub fn packets_expected(&self) -> u32 {
        self.received.len() as u32
    }

    /// Distinct packets that arrived.
    #[must_use]
    pub fn packets_received(&self) -> u32 {
        self.packets_received
    }

    /// True if `packet` was already recorded.
    #[must_use]
    pub fn has_packet(&self, packet: usize) -> bool {
        self.received.get(packet).copied().unwrap_or(false)
    }

    /// Record `packet`; returns true once every packet has arrived.
    pub fn mark_packet(&mut self, packet: usize) -> bool {
        if let Some(seen) = self.received.get_mut(packet) {
            if !*seen {
                *seen = true;
                self.packets_received += 1;
            }
        }
        self.is_complete()
    }

    /// True once every packet has arrived.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.packets_received as usize == self.received.len()
    }
}

/// Receive buffer handed to a transport: decoder-local memory or a slot range.
pub enum MessageBuffer<'a> {
    /// Packet or header buffer owned by the decoder
    Local(&'a mut [u8]),
    /// Byte range inside a mapped slot (zero-copy receive)
    Slot {
        /// Write view of the slot
        view: SlotViewMut<'a>,
        /// Range still to be filled
        range: Range<usize>,
    },
}

impl Deref for MessageBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Local(buf) => buf,
            Self::Slot { view, range } => &view[range.clone()],
        }
    }
}

impl DerefMut for MessageBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        match self {
            Self::Local(buf) => buf,
            Self::Slot { view, range } => &mut view[range.clone()],
        }
    }
}

/// Buffer bookkeeping shared by all decoder variants.
pub struct DecoderCore {
    name: String,
    pool: SharedBufferPool,
    layout: FrameLayout,
    config: DecoderConfig,
    counters: DecoderCounters,
    empty_buffers: VecDeque<SlotId>,
    frame_buffer_map: BTreeMap<u64, MappedFrame>,
    completed: VecDeque<u64>,
    dropped: VecDeque<u64>,
    scratch: Vec<u8>,
    ready: Sender<Frame>,
    release_tx: Sender<SlotId>,
    release_rx: Receiver<SlotId>,
    span: Span,
}

impl DecoderCore {
    /// Create a core writing into `pool` and emitting frames on `ready`.
    pub fn new(name: impl Into<String>, pool: SharedBufferPool, ready: Sender<Frame>) -> Self {
        let name = name.into();
        let (release_tx, release_rx) = crossbeam_channel::unbounded();
        let span = tracing::info_span!("decoder", name = %name);
        Self {
            name,
            pool,
            layout: FrameLayout::default(),
            config: DecoderConfig::default(),
            counters: DecoderCounters::default(),
            empty_buffers: VecDeque::new(),
            frame_buffer_map: BTreeMap::new(),
            completed: VecDeque::with_capacity(COMPLETED_FRAME_HISTORY),
            dropped: VecDeque::new(),
            scratch: Vec::new(),
            ready,
            release_tx,
            release_rx,
            span,
        }
    }

    /// Decoder instance name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current settings.
    #[must_use]
    pub fn config(&self) -> &DecoderConfig {
        &self.config
    }

    /// Current frame geometry.
    #[must_use]
    pub fn layout(&self) -> &FrameLayout {
        &self.layout
    }

    /// Counter snapshot.
    #[must_use]
    pub fn counters(&self) -> &DecoderCounters {
        &self.counters
    }

    /// Counters, for variants recording packet-level events.
    pub fn counters_mut(&mut self) -> &mut DecoderCounters {
        &mut self.counters
    }

    /// The slot pool frames are written into.
    #[must_use]
    pub fn pool(&self) -> &SharedBufferPool {
        &self.pool
    }

    /// The component span; entered while the decoder works.
    #[must_use]
    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Sender half of the release channel, for leases issued elsewhere.
    #[must_use]
    pub fn release_sender(&self) -> Sender<SlotId> {
        self.release_tx.clone()
    }

    /// Validate `params` and return the resulting settings without applying them.
    pub fn stage_configuration(&self, params: &ParamMessage) -> Result<(DecoderConfig, FrameLayout)> {
        let config = self.config.updated(params)?;
        let layout = self.layout.updated(params)?;
        if let Some(size) = layout.frame_size() {
            if size > self.pool.slot_size() {
                return Err(DaqError::malformed_parameter(
                    join_key(CONFIG_PREFIX, "dimensions"),
                    format!("frame size {size} exceeds slot size {}", self.pool.slot_size()),
                ));
            }
        }
        Ok((config, layout))
    }

    /// Apply settings produced by [`stage_configuration`](Self::stage_configuration).
    pub fn commit_configuration(&mut self, (config, layout): (DecoderConfig, FrameLayout)) {
        let _entered = self.span.enter();
        if layout != self.layout && !self.frame_buffer_map.is_empty() {
            warn!(
                mapped = self.frame_buffer_map.len(),
                "Frame layout changed while frames are in flight"
            );
        }
        info!(
            frame_timeout_ms = config.frame_timeout_ms,
            enable_packet_logging = config.enable_packet_logging,
            empty_buffer_policy = config.empty_buffer_policy.name(),
            acquisition_id = %config.acquisition_id,
            "Decoder configured"
        );
        self.config = config;
        self.layout = layout;
    }

    /// Validate and apply `params` in one step.
    pub fn configure(&mut self, params: &ParamMessage) -> Result<()> {
        let staged = self.stage_configuration(params)?;
        self.commit_configuration(staged);
        Ok(())
    }

    /// Add a slot to the tail of the empty queue.
    pub fn push_empty_buffer(&mut self, id: SlotId) {
        self.empty_buffers.push_back(id);
    }

    /// Depth of the empty queue.
    #[must_use]
    pub fn num_empty_buffers(&self) -> usize {
        self.empty_buffers.len()
    }

    /// Frames currently being filled.
    #[must_use]
    pub fn num_mapped_buffers(&self) -> usize {
        self.frame_buffer_map.len()
    }

    /// Configured frame timeout.
    #[must_use]
    pub fn frame_timeout_ms(&self) -> u64 {
        self.config.frame_timeout_ms
    }

    /// Frames released by the timeout monitor so far.
    #[must_use]
    pub fn frames_timedout(&self) -> u64 {
        self.counters.frames_timedout
    }

    /// Move released slot ids from the release channel to the empty queue.
    pub fn reclaim_released_buffers(&mut self) -> usize {
        let before = self.empty_buffers.len();
        self.empty_buffers.extend(self.release_rx.try_iter());
        self.empty_buffers.len() - before
    }

    /// Entry for a frame being filled.
    pub fn mapped_mut(&mut self, frame_number: u64) -> Option<&mut MappedFrame> {
        self.frame_buffer_map.get_mut(&frame_number)
    }

    /// True if `frame_number` was recently emitted.
    #[must_use]
    pub fn was_completed(&self, frame_number: u64) -> bool {
        self.completed.contains(&frame_number)
    }

    /// True if `frame_number` was recently dropped for lack of a slot.
    #[must_use]
    pub fn was_dropped(&self, frame_number: u64) -> bool {
        self.dropped.contains(&frame_number)
    }

    /// Slot for `frame_number`, mapping a new one from the empty queue if needed.
    ///
    /// Returns `None` when no slot could be obtained under the empty-buffer
    /// policy; the frame is then counted as dropped.
    pub fn begin_frame(&mut self, frame_number: u64, packets_expected: u32) -> Option<SlotId> {
        if let Some(entry) = self.frame_buffer_map.get(&frame_number) {
            return Some(entry.slot_id);
        }
        match self.take_empty_buffer() {
            Some(slot_id) => {
                self.frame_buffer_map.insert(
                    frame_number,
                    MappedFrame::new(slot_id, packets_expected, Instant::now()),
                );
                Some(slot_id)
            }
            None => {
                self.note_dropped(frame_number);
                None
            }
        }
    }

    fn take_empty_buffer(&mut self) -> Option<SlotId> {
        if let Some(id) = self.empty_buffers.pop_front() {
            return Some(id);
        }
        self.reclaim_released_buffers();
        if let Some(id) = self.empty_buffers.pop_front() {
            return Some(id);
        }
        match self.config.empty_buffer_policy {
            EmptyBufferPolicy::Drop => None,
            EmptyBufferPolicy::Block { timeout_ms } => self
                .release_rx
                .recv_timeout(Duration::from_millis(timeout_ms))
                .ok(),
        }
    }

    fn note_dropped(&mut self, frame_number: u64) {
        let _entered = self.span.enter();
        self.counters.frames_dropped += 1;
        warn!(
            frame_number,
            policy = self.config.empty_buffer_policy.name(),
            frames_dropped = self.counters.frames_dropped,
            "No empty buffer available - dropping frame"
        );
        if self.dropped.len() == COMPLETED_FRAME_HISTORY {
            self.dropped.pop_front();
        }
        self.dropped.push_back(frame_number);
    }

    fn remember_completed(&mut self, frame_number: u64) {
        if self.completed.len() == COMPLETED_FRAME_HISTORY {
            self.completed.pop_front();
        }
        self.completed.push_back(frame_number);
    }

    /// Copy `data` into a mapped slot at `offset`.
    pub fn write_slot(&self, slot_id: SlotId, offset: usize, data: &[u8]) -> Result<()> {
        // SAFETY: the slot is mapped to an in-flight frame of this decoder; no
        // lease exists for it and nothing else writes it.
        let mut view = unsafe { self.pool.address_of_mut(slot_id)? };
        let slot_size = view.len();
        let end = offset
            .checked_add(data.len())
            .filter(|&end| end <= slot_size)
            .ok_or(PoolError::LengthExceedsSlot {
                len: offset.saturating_add(data.len()),
                slot_size,
            })?;
        view[offset..end].copy_from_slice(data);
        Ok(())
    }

    /// Receive buffer covering `range` of a mapped slot.
    pub fn slot_buffer(&self, slot_id: SlotId, range: Range<usize>) -> Result<MessageBuffer<'_>> {
        // SAFETY: see write_slot.
        let view = unsafe { self.pool.address_of_mut(slot_id)? };
        if range.end > view.len() || range.start > range.end {
            return Err(PoolError::LengthExceedsSlot {
                len: range.end,
                slot_size: view.len(),
            }
            .into());
        }
        Ok(MessageBuffer::Slot { view, range })
    }

    /// Throwaway buffer for data of dropped or discarded frames.
    pub fn scratch_buffer(&mut self, len: usize) -> &mut [u8] {
        if self.scratch.len() < len {
            self.scratch.resize(len, 0);
        }
        &mut self.scratch[..len]
    }

    /// Emit a fully received frame.
    pub fn complete_frame(&mut self, frame_number: u64) -> Result<()> {
        self.release_frame(frame_number, false)
    }

    fn release_frame(&mut self, frame_number: u64, timed_out: bool) -> Result<()> {
        let Some(slot_id) = self.frame_buffer_map.get(&frame_number).map(|e| e.slot_id) else {
            return Ok(());
        };
        let leased = self
            .layout
            .frame_size()
            .ok_or_else(|| {
                DaqError::malformed_parameter(join_key(CONFIG_PREFIX, "dimensions"), "frame size overflows")
            })
            .and_then(|len| Ok(self.pool.lease(slot_id, len, Some(self.release_tx.clone()))?));
        let Some(entry) = self.frame_buffer_map.remove(&frame_number) else {
            return Ok(());
        };
        self.remember_completed(frame_number);

        let lease = match leased {
            Ok(lease) => lease,
            Err(err) => {
                // The slot never reached a frame; keep it in circulation.
                self.empty_buffers.push_back(entry.slot_id);
                self.counters.frames_invalid += 1;
                let _entered = self.span.enter();
                error!(
                    frame_number,
                    slot_id = entry.slot_id,
                    error = %err,
                    "Could not lease slot for frame - slot returned to empty queue"
                );
                return Err(err);
            }
        };

        let mut metadata = self.layout.metadata(frame_number);
        metadata.acquisition_id = self.config.acquisition_id.clone();
        metadata.packets_expected = entry.packets_expected();
        metadata.packets_received = entry.packets_received;
        metadata.incomplete = timed_out;
        let frame = Frame::new(metadata, DataBlock::from_slot(lease))?;

        self.counters.frames_received += 1;
        let _entered = self.span.enter();
        debug!(
            frame_number,
            slot_id = entry.slot_id,
            incomplete = timed_out,
            "Frame ready"
        );
        if self.ready.send(frame).is_err() {
            warn!(frame_number, "Ready output closed - frame discarded");
        }
        Ok(())
    }

    /// Discard an open frame (malformed message, dropped connection), returning its slot.
    ///
    /// Returns false if no frame with that number was open.
    pub fn discard_frame(&mut self, frame_number: u64) -> bool {
        match self.frame_buffer_map.remove(&frame_number) {
            Some(entry) => {
                self.empty_buffers.push_back(entry.slot_id);
                self.counters.frames_invalid += 1;
                let _entered = self.span.enter();
                warn!(
                    frame_number,
                    slot_id = entry.slot_id,
                    "Discarding open frame"
                );
                true
            }
            None => false,
        }
    }

    /// Release frames older than the frame timeout, as of now.
    pub fn monitor_buffers(&mut self) -> usize {
        self.monitor_buffers_at(Instant::now())
    }

    /// Release frames older than the frame timeout as of `now`.
    ///
    /// Each timed-out frame is emitted marked incomplete and counted once in
    /// `frames_timedout`. Returns the number released.
    pub fn monitor_buffers_at(&mut self, now: Instant) -> usize {
        let timeout = Duration::from_millis(self.config.frame_timeout_ms);
        let expired: Vec<(u64, u32)> = self
            .frame_buffer_map
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.started) > timeout)
            .map(|(&frame_number, entry)| {
                (
                    frame_number,
                    entry.packets_expected() - entry.packets_received,
                )
            })
            .collect();

        for &(frame_number, missing) in &expired {
            self.counters.frames_timedout += 1;
            self.counters.packets_lost += u64::from(missing);
            {
                let _entered = self.span.enter();
                warn!(
                    frame_number,
                    packets_missing = missing,
                    frame_timeout_ms = self.config.frame_timeout_ms,
                    "Frame timed out - releasing incomplete"
                );
            }
            if let Err(err) = self.release_frame(frame_number, true) {
                let _entered = self.span.enter();
                error!(frame_number, error = %err, "Failed to release timed-out frame");
            }
        }
        expired.len()
    }

    /// Forget every slot id held in the empty queue or the frame map.
    ///
    /// Used after the slot pool is re-carved. Mapped frames are lost.
    pub fn drop_all_buffers(&mut self) {
        let _entered = self.span.enter();
        if !self.empty_buffers.is_empty() {
            info!(
                count = self.empty_buffers.len(),
                "Dropping buffers from empty buffer queue"
            );
            self.empty_buffers.clear();
        }
        let pending = self.release_rx.try_iter().count();
        if pending > 0 {
            info!(count = pending, "Dropping released buffers not yet reclaimed");
        }
        if !self.frame_buffer_map.is_empty() {
            warn!(
                count = self.frame_buffer_map.len(),
                "Dropping unreleased buffers from decoder - possible data loss"
            );
            self.frame_buffer_map.clear();
        }
    }

    /// Write settings under `prefix`.
    pub fn request_configuration(&self, prefix: &str, msg: &mut ParamMessage) {
        self.config.write(prefix, msg);
        self.layout.write(prefix, msg);
    }

    /// Write counters and queue depths under `prefix`.
    pub fn status(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "name"), self.name.as_str());
        msg.set(&join_key(prefix, "empty_buffers"), self.empty_buffers.len());
        msg.set(&join_key(prefix, "mapped_buffers"), self.frame_buffer_map.len());
        msg.set(&join_key(prefix, "frame_timeout_ms"), self.config.frame_timeout_ms);
        if let Ok(serde_json::Value::Object(counters)) = serde_json::to_value(&self.counters) {
            for (key, value) in counters {
                msg.set(&join_key(prefix, &key), value);
            }
        }
    }
}

/// A transport-specific decoder built on a [`DecoderCore`].
///
/// The receive loop alternates between [`get_next_message_buffer`] and
/// [`process_message`]: the transport fills the buffer, then the decoder
/// interprets the bytes received.
///
/// [`get_next_message_buffer`]: FrameDecoder::get_next_message_buffer
/// [`process_message`]: FrameDecoder::process_message
pub trait FrameDecoder: Send {
    /// Short variant name, e.g. `packet`.
    fn decoder_type(&self) -> &'static str;

    /// Shared state.
    fn core(&self) -> &DecoderCore;

    /// Shared state, mutable.
    fn core_mut(&mut self) -> &mut DecoderCore;

    /// Transport framing this decoder expects.
    fn transport_kind(&self) -> TransportKind;

    /// Bytes of wire header preceding each message's payload.
    fn frame_header_size(&self) -> usize;

    /// Buffer the transport should receive the next message into.
    fn get_next_message_buffer(&mut self) -> Result<MessageBuffer<'_>>;

    /// Interpret `bytes_received` bytes written into the last buffer.
    fn process_message(&mut self, bytes_received: usize) -> FrameReceiveState;

    /// Validate and apply variant settings given the staged frame layout.
    fn configure_variant(&mut self, _layout: &FrameLayout, _params: &ParamMessage) -> Result<()> {
        Ok(())
    }

    /// Write variant settings under `prefix`.
    fn request_variant_configuration(&self, _prefix: &str, _msg: &mut ParamMessage) {}

    /// Forget partially received transport state.
    fn reset(&mut self) {}

    /// Bytes of payload per frame.
    fn frame_buffer_size(&self) -> usize {
        self.core().layout().frame_size().unwrap_or(0)
    }

    /// Apply initial settings. Defaults apply for absent keys.
    fn init(&mut self, params: &ParamMessage) -> Result<()> {
        self.configure(params)
    }

    /// Apply `decoder_config/` settings; on error nothing changes.
    fn configure(&mut self, params: &ParamMessage) -> Result<()> {
        let staged = self.core().stage_configuration(params)?;
        self.configure_variant(&staged.1, params)?;
        self.core_mut().commit_configuration(staged);
        Ok(())
    }

    /// See [`DecoderCore::push_empty_buffer`].
    fn push_empty_buffer(&mut self, id: SlotId) {
        self.core_mut().push_empty_buffer(id);
    }

    /// See [`DecoderCore::num_empty_buffers`].
    fn get_num_empty_buffers(&self) -> usize {
        self.core().num_empty_buffers()
    }

    /// See [`DecoderCore::num_mapped_buffers`].
    fn get_num_mapped_buffers(&self) -> usize {
        self.core().num_mapped_buffers()
    }

    /// See [`DecoderCore::monitor_buffers`].
    fn monitor_buffers(&mut self) -> usize {
        self.core_mut().monitor_buffers()
    }

    /// Drop every held slot and any partial transport state.
    fn drop_all_buffers(&mut self) {
        self.reset();
        self.core_mut().drop_all_buffers();
    }

    /// Write all settings under `prefix`.
    fn request_configuration(&self, prefix: &str, msg: &mut ParamMessage) {
        self.core().request_configuration(prefix, msg);
        self.request_variant_configuration(prefix, msg);
    }

    /// Write counters and identity under `prefix`.
    fn get_status(&self, prefix: &str, msg: &mut ParamMessage) {
        self.core().status(prefix, msg);
        msg.set(&join_key(prefix, "decoder_type"), self.decoder_type());
        msg.set(&join_key(prefix, "frame_buffer_size"), self.frame_buffer_size());
        msg.set(&join_key(prefix, "version"), env!("CARGO_PKG_VERSION"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::unbounded;
    use tracing_test::traced_test;

    fn make_core(slots: usize) -> (DecoderCore, Receiver<Frame>) {
        let pool = SharedBufferPool::anonymous(64, slots).unwrap();
        let (tx, rx) = unbounded();
        let mut core = DecoderCore::new("test", pool, tx);
        let mut params = ParamMessage::new();
        params.set("decoder_config/dimensions", vec![4, 4]);
        params.set("decoder_config/pixel_type", "raw8");
        core.configure(&params).unwrap();
        (core, rx)
    }

    #[test]
    fn test_empty_buffers_fifo() {
        let (mut core, _rx) = make_core(4);
        for id in [2, 0, 3, 1] {
            core.push_empty_buffer(id);
        }
        assert_eq!(core.num_empty_buffers(), 4);
        let order: Vec<_> = (0..4).map(|n| core.begin_frame(n, 1).unwrap()).collect();
        assert_eq!(order, vec![2, 0, 3, 1]);
        assert_eq!(core.num_mapped_buffers(), 4);
        assert_eq!(core.num_empty_buffers(), 0);
    }

    #[test]
    fn test_defaults_and_partial_configure() {
        let (mut core, _rx) = make_core(1);
        assert_eq!(core.frame_timeout_ms(), DEFAULT_FRAME_TIMEOUT_MS);
        assert!(!core.config().enable_packet_logging);

        let mut params = ParamMessage::new();
        params.set("decoder_config/frame_timeout_ms", 50);
        params.set("decoder_config/unknown", "ignored");
        core.configure(&params).unwrap();
        assert_eq!(core.frame_timeout_ms(), 50);
        assert!(!core.config().enable_packet_logging);
    }

    #[test]
    fn test_malformed_configure_keeps_prior_state() {
        let (mut core, _rx) = make_core(1);
        let mut params = ParamMessage::new();
        params.set("decoder_config/frame_timeout_ms", 10);
        params.set("decoder_config/empty_buffer_policy", "sometimes");
        let err = core.configure(&params).unwrap_err();
        assert!(err.is_configuration());
        assert_eq!(core.frame_timeout_ms(), DEFAULT_FRAME_TIMEOUT_MS);
    }

    #[test]
    fn test_layout_must_fit_slot() {
        let (mut core, _rx) = make_core(1);
        let mut params = ParamMessage::new();
        params.set("decoder_config/dimensions", vec![16, 16]);
        assert!(core.configure(&params).is_err());
        assert_eq!(core.layout().dimensions, vec![4, 4]);
    }

    #[test]
    #[traced_test]
    fn test_failed_lease_returns_slot_to_empty_queue() {
        let (mut core, rx) = make_core(4);
        core.push_empty_buffer(3);
        assert_eq!(core.begin_frame(9, 1), Some(3));

        // Re-carving leaves slot 3 out of range, so leasing it fails.
        core.pool.configure(64, 2).unwrap();
        assert!(core.complete_frame(9).is_err());

        assert_eq!(core.num_mapped_buffers(), 0);
        assert_eq!(core.num_empty_buffers(), 1);
        assert_eq!(core.counters().frames_invalid, 1);
        assert!(rx.try_recv().is_err());
        assert!(logs_contain("slot returned to empty queue"));
    }

    #[test]
    fn test_complete_frame_hands_slot_to_frame() {
        let (mut core, rx) = make_core(2);
        core.push_empty_buffer(1);
        let slot = core.begin_frame(7, 1).unwrap();
        core.write_slot(slot, 0, &[9; 16]).unwrap();
        core.mapped_mut(7).unwrap().mark_packet(0);
        core.complete_frame(7).unwrap();

        let frame = rx.try_recv().unwrap();
        assert_eq!(frame.frame_number(), 7);
        assert_eq!(frame.data(), &[9; 16]);
        assert_eq!(frame.block().slot_id(), Some(1));
        assert_eq!(core.num_empty_buffers(), 0);
        assert_eq!(core.num_mapped_buffers(), 0);
        assert!(core.was_completed(7));

        drop(frame);
        assert_eq!(core.reclaim_released_buffers(), 1);
        assert_eq!(core.num_empty_buffers(), 1);
    }

    #[test]
    fn test_timeout_releases_incomplete_frame_once() {
        let (mut core, rx) = make_core(1);
        core.push_empty_buffer(0);
        core.begin_frame(3, 4).unwrap();
        core.mapped_mut(3).unwrap().mark_packet(1);

        assert_eq!(core.monitor_buffers_at(Instant::now()), 0);
        let later = Instant::now() + Duration::from_millis(DEFAULT_FRAME_TIMEOUT_MS + 1);
        assert_eq!(core.monitor_buffers_at(later), 1);
        assert_eq!(core.monitor_buffers_at(later), 0);

        assert_eq!(core.frames_timedout(), 1);
        assert_eq!(core.counters().packets_lost, 3);
        assert_eq!(core.num_mapped_buffers(), 0);

        let frame = rx.try_recv().unwrap();
        assert!(frame.metadata().incomplete);
        assert_eq!(frame.metadata().packets_received, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_drop_policy_counts_dropped_frame() {
        let (mut core, _rx) = make_core(1);
        let mut params = ParamMessage::new();
        params.set("decoder_config/empty_buffer_policy", "drop");
        core.configure(&params).unwrap();

        let started = Instant::now();
        assert!(core.begin_frame(1, 1).is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(core.counters().frames_dropped, 1);
        assert!(core.was_dropped(1));
    }

    #[test]
    fn test_block_policy_waits_for_release() {
        let (mut core, rx) = make_core(1);
        core.push_empty_buffer(0);
        core.begin_frame(1, 1).unwrap();
        core.complete_frame(1).unwrap();
        let frame = rx.try_recv().unwrap();

        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            drop(frame);
        });
        let mut params = ParamMessage::new();
        params.set("decoder_config/empty_buffer_timeout_ms", 2000);
        core.configure(&params).unwrap();

        assert_eq!(core.begin_frame(2, 1), Some(0));
        releaser.join().unwrap();
        assert_eq!(core.counters().frames_dropped, 0);
    }

    #[test]
    fn test_block_policy_gives_up() {
        let (mut core, _rx) = make_core(1);
        let mut params = ParamMessage::new();
        params.set("decoder_config/empty_buffer_timeout_ms", 10);
        core.configure(&params).unwrap();
        assert!(core.begin_frame(1, 1).is_none());
        assert_eq!(core.counters().frames_dropped, 1);
    }

    #[test]
    fn test_discard_returns_slot() {
        let (mut core, _rx) = make_core(1);
        core.push_empty_buffer(0);
        core.begin_frame(5, 2).unwrap();
        assert!(core.discard_frame(5));
        assert!(!core.discard_frame(5));
        assert_eq!(core.num_empty_buffers(), 1);
        assert_eq!(core.counters().frames_invalid, 1);
    }

    #[test]
    #[traced_test]
    fn test_drop_all_buffers_warns_on_mapped() {
        let (mut core, _rx) = make_core(4);
        for id in 0..4 {
            core.push_empty_buffer(id);
        }
        core.begin_frame(1, 2).unwrap();
        core.drop_all_buffers();

        assert_eq!(core.num_empty_buffers(), 0);
        assert_eq!(core.num_mapped_buffers(), 0);
        assert!(logs_contain("possible data loss"));
    }

    #[test]
    fn test_request_configuration_round_trips() {
        let (mut core, _rx) = make_core(1);
        let mut params = ParamMessage::new();
        params.set("decoder_config/frame_timeout_ms", 42);
        params.set("decoder_config/acquisition_id", "run7");
        core.configure(&params).unwrap();

        let mut reply = ParamMessage::new();
        core.request_configuration(CONFIG_PREFIX, &mut reply);
        assert_eq!(reply.get_u64("decoder_config/frame_timeout_ms").unwrap(), Some(42));
        assert_eq!(reply.get_str("decoder_config/acquisition_id").unwrap(), Some("run7"));
        assert_eq!(reply.get_str("decoder_config/pixel_type").unwrap(), Some("raw8"));

        let (mut other, _rx2) = make_core(1);
        other.configure(&reply).unwrap();
        assert_eq!(other.config(), core.config());
        assert_eq!(other.layout(), core.layout());
    }

    #[test]
    fn test_status_reports_counters() {
        let (mut core, _rx) = make_core(2);
        core.push_empty_buffer(0);
        core.push_empty_buffer(1);
        core.begin_frame(1, 1).unwrap();

        let mut status = ParamMessage::new();
        core.status("decoder", &mut status);
        assert_eq!(status.get_u64("decoder/empty_buffers").unwrap(), Some(1));
        assert_eq!(status.get_u64("decoder/mapped_buffers").unwrap(), Some(1));
        assert_eq!(status.get_u64("decoder/frames_timedout").unwrap(), Some(0));
    }
}
