//! The frame-callback capability every pipeline stage implements.

use daq_core::{Frame, ParamMessage, Result};
use std::any::Any;

/// Frames a plugin hands to its downstream stages.
///
/// A plugin may push its input back (pass through), push a replacement, push
/// several frames, or push nothing (terminate the chain). Every pushed frame
/// goes to every downstream stage.
#[derive(Default)]
pub struct FrameOutput {
    frames: Vec<Frame>,
}

impl FrameOutput {
    /// Empty output.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `frame` for forwarding.
    pub fn push(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    /// Frames queued so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if nothing will be forwarded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Take the queued frames in push order.
    pub fn drain(&mut self) -> std::vec::Drain<'_, Frame> {
        self.frames.drain(..)
    }
}

/// A processing stage.
///
/// Implementations are independent types created through a
/// [`PluginRegistry`](crate::PluginRegistry) factory. The stage worker calls
/// `process_frame` for every frame in its queue, one at a time; the controller
/// calls the configuration and status methods between frames.
pub trait FramePlugin: Send {
    /// Registry name of the plugin type.
    fn plugin_type(&self) -> &'static str;

    /// Handle one frame.
    ///
    /// The frame is owned by the call. Dropping it without pushing it releases
    /// this stage's reference to the underlying data block.
    fn process_frame(&mut self, frame: Frame, out: &mut FrameOutput) -> Result<()>;

    /// The current acquisition has ended. Runs after every frame queued before it.
    fn process_end_of_acquisition(&mut self, _out: &mut FrameOutput) -> Result<()> {
        Ok(())
    }

    /// Apply settings. Unknown keys are ignored, missing keys keep current values.
    ///
    /// On error the plugin keeps its previous settings.
    fn configure(&mut self, _params: &ParamMessage) -> Result<()> {
        Ok(())
    }

    /// Report settings under `prefix`.
    fn request_configuration(&self, _prefix: &str, _msg: &mut ParamMessage) {}

    /// Report counters under `prefix`.
    fn status(&self, _prefix: &str, _msg: &mut ParamMessage) {}

    /// Typed access for callers that know the concrete plugin.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
