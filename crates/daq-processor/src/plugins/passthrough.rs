use crate::plugin::{FrameOutput, FramePlugin};
use daq_core::{join_key, Frame, ParamMessage, Result};
use std::any::Any;
use tracing::trace;

/// Observer stage: counts frames and forwards them unchanged.
#[derive(Debug)]
pub struct Passthrough {
    name: String,
    frames_seen: u64,
    bytes_seen: u64,
    last_frame: Option<u64>,
    acquisitions_ended: u64,
}

impl Passthrough {
    /// Plugin type name.
    pub const TYPE: &'static str = "passthrough";

    /// New observer for stage `name`.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            frames_seen: 0,
            bytes_seen: 0,
            last_frame: None,
            acquisitions_ended: 0,
        }
    }

    /// Frames seen so far.
    #[must_use]
    pub fn frames_seen(&self) -> u64 {
        self.frames_seen
    }

    /// Number of the most recent frame.
    #[must_use]
    pub fn last_frame(&self) -> Option<u64> {
        self.last_frame
    }
}

impl FramePlugin for Passthrough {
    fn plugin_type(&self) -> &'static str {
        Self::TYPE
    }

    fn process_frame(&mut self, frame: Frame, out: &mut FrameOutput) -> Result<()> {
        trace!(stage = %self.name, frame_number = frame.frame_number(), "Passing frame through");
        self.frames_seen += 1;
        self.bytes_seen += frame.data().len() as u64;
        self.last_frame = Some(frame.frame_number());
        out.push(frame);
        Ok(())
    }

    fn process_end_of_acquisition(&mut self, _out: &mut FrameOutput) -> Result<()> {
        self.acquisitions_ended += 1;
        Ok(())
    }

    fn status(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&join_key(prefix, "frames_seen"), self.frames_seen);
        msg.set(&join_key(prefix, "bytes_seen"), self.bytes_seen);
        msg.set(&join_key(prefix, "acquisitions_ended"), self.acquisitions_ended);
        if let Some(last) = self.last_frame {
            msg.set(&join_key(prefix, "last_frame"), last);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
