//! Live view tap: forwards every frame and copies every Nth to subscribers.
//!
//! Subscribers receive zero-copy [`Bytes`] views of the frame data. Delivery
//! uses `try_send`, so a slow subscriber loses tap frames instead of stalling
//! the pipeline. A tapped view keeps the frame's data block alive until the
//! subscriber drops it.

use crate::plugin::{FrameOutput, FramePlugin};
use bytes::Bytes;
use daq_core::limits::DEFAULT_LIVE_VIEW_DEPTH;
use daq_core::{join_key, Frame, ParamMessage, Result};
use std::any::Any;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// One tapped frame.
#[derive(Debug, Clone)]
pub struct LiveFrame {
    /// Frame index
    pub frame_number: u64,
    /// Per-axis dimensions
    pub dimensions: Vec<usize>,
    /// Frame bytes
    pub data: Bytes,
}

struct Subscriber {
    id: u64,
    tx: mpsc::Sender<LiveFrame>,
    dropped: u64,
}

/// Live view stage.
pub struct LiveView {
    name: String,
    frame_frequency: u64,
    frame_count: u64,
    subscribers: Vec<Subscriber>,
    next_id: u64,
    frames_tapped: u64,
    frames_dropped: u64,
}

impl LiveView {
    /// Plugin type name.
    pub const TYPE: &'static str = "live_view";

    /// Tap for stage `name`, delivering every frame until configured.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            frame_frequency: 1,
            frame_count: 0,
            subscribers: Vec::new(),
            next_id: 0,
            frames_tapped: 0,
            frames_dropped: 0,
        }
    }

    /// Register a subscriber with room for `capacity` undelivered frames.
    pub fn subscribe(&mut self, capacity: usize) -> mpsc::Receiver<LiveFrame> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.next_id += 1;
        debug!(stage = %self.name, subscriber = self.next_id, capacity, "Live view subscriber added");
        self.subscribers.push(Subscriber {
            id: self.next_id,
            tx,
            dropped: 0,
        });
        rx
    }

    /// Register a subscriber with the default queue depth.
    pub fn subscribe_default(&mut self) -> mpsc::Receiver<LiveFrame> {
        self.subscribe(DEFAULT_LIVE_VIEW_DEPTH)
    }

    /// Connected subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn should_tap(&mut self) -> bool {
        let count = self.frame_count;
        self.frame_count += 1;
        self.frame_frequency != 0 && count % self.frame_frequency == 0
    }

    fn tap(&mut self, frame: &Frame) {
        if self.subscribers.is_empty() || !self.should_tap() {
            return;
        }
        let live = LiveFrame {
            frame_number: frame.frame_number(),
            dimensions: frame.metadata().dimensions.clone(),
            data: frame.to_bytes(),
        };
        self.frames_tapped += 1;
        let mut dropped = 0;
        self.subscribers.retain_mut(|sub| match sub.tx.try_send(live.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                sub.dropped += 1;
                dropped += 1;
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!(subscriber = sub.id, "Live view subscriber gone");
                false
            }
        });
        if dropped > 0 {
            trace!(stage = %self.name, frame_number = live.frame_number, dropped, "Live view subscriber full");
            self.frames_dropped += dropped;
        }
    }
}

impl FramePlugin for LiveView {
    fn plugin_type(&self) -> &'static str {
        Self::TYPE
    }

    fn process_frame(&mut self, frame: Frame, out: &mut FrameOutput) -> Result<()> {
        self.tap(&frame);
        out.push(frame);
        Ok(())
    }

    fn process_end_of_acquisition(&mut self, _out: &mut FrameOutput) -> Result<()> {
        self.frame_count = 0;
        Ok(())
    }

    fn configure(&mut self, params: &ParamMessage) -> Result<()> {
        if let Some(frequency) = params.get_u64("frame_frequency")? {
            self.frame_frequency = frequency;
        }
        Ok(())
    }

    fn request_configuration(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "frame_frequency"), self.frame_frequency);
    }

    fn status(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "subscribers"), self.subscribers.len());
        msg.set(&join_key(prefix, "frames_tapped"), self.frames_tapped);
        msg.set(&join_key(prefix, "frames_dropped"), self.frames_dropped);
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
