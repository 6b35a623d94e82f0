//! One pipeline stage: a plugin, a bounded input queue and a worker thread.

use crate::plugin::{FrameOutput, FramePlugin};
use crossbeam_channel::{Receiver, Sender, TrySendError};
use daq_core::{DaqError, Frame, ParamMessage, Result};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn, Span};

/// Items flowing through a stage queue.
pub enum StageMessage {
    /// A frame to process
    Frame(Frame),
    /// The acquisition ended; follows every frame sent before it
    EndOfAcquisition,
    /// Finish and exit the worker
    Stop,
}

/// Per-stage counters, updated by the worker and read by the controller.
#[derive(Debug, Default)]
pub struct StageCounters {
    frames_processed: AtomicU64,
    frames_forwarded: AtomicU64,
    frames_discarded: AtomicU64,
    process_errors: AtomicU64,
}

/// Point-in-time copy of [`StageCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StageStats {
    /// Frames handed to the plugin
    pub frames_processed: u64,
    /// Frames the plugin pushed downstream
    pub frames_forwarded: u64,
    /// Frames dropped unprocessed during a hard stop
    pub frames_discarded: u64,
    /// `process_frame` or end-of-acquisition failures
    pub process_errors: u64,
}

impl StageCounters {
    /// Current values.
    #[must_use]
    pub fn snapshot(&self) -> StageStats {
        StageStats {
            frames_processed: self.frames_processed.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_discarded: self.frames_discarded.load(Ordering::Relaxed),
            process_errors: self.process_errors.load(Ordering::Relaxed),
        }
    }
}

/// A named edge to a downstream stage queue.
#[derive(Clone)]
pub(crate) struct Downstream {
    pub(crate) name: String,
    pub(crate) tx: Sender<StageMessage>,
}

/// Enqueue `msg` on `to`, blocking while the queue is full.
///
/// A full queue is logged once per send so backpressure shows up in the logs.
/// Returns false if the receiving stage has exited.
pub(crate) fn enqueue(to: &str, tx: &Sender<StageMessage>, msg: StageMessage) -> bool {
    match tx.try_send(msg) {
        Ok(()) => true,
        Err(TrySendError::Full(msg)) => {
            warn!(stage = to, capacity = ?tx.capacity(), "Stage queue full - applying backpressure");
            if tx.send(msg).is_err() {
                warn!(stage = to, "Stage queue closed while waiting");
                return false;
            }
            true
        }
        Err(TrySendError::Disconnected(_)) => {
            warn!(stage = to, "Stage queue closed - message dropped");
            false
        }
    }
}

struct Worker {
    name: String,
    plugin: Arc<Mutex<Box<dyn FramePlugin>>>,
    rx: Receiver<StageMessage>,
    downstream: Arc<RwLock<Vec<Downstream>>>,
    counters: Arc<StageCounters>,
    discard: Arc<AtomicBool>,
    span: Span,
}

impl Worker {
    fn run(self) {
        let span = self.span.clone();
        let _entered = span.enter();
        debug!(stage = %self.name, "Stage worker started");

        let mut discarded = 0u64;
        while let Ok(msg) = self.rx.recv() {
            match msg {
                StageMessage::Frame(frame) => {
                    if self.discard.load(Ordering::Acquire) {
                        discarded += 1;
                        self.counters.frames_discarded.fetch_add(1, Ordering::Relaxed);
                        continue;
                    }
                    self.process(frame);
                }
                StageMessage::EndOfAcquisition => self.end_of_acquisition(),
                StageMessage::Stop => break,
            }
        }

        if discarded > 0 {
            warn!(discarded, "Frames discarded on hard stop");
        }
        debug!(stage = %self.name, "Stage worker stopped");
    }

    fn process(&self, frame: Frame) {
        let frame_number = frame.frame_number();
        let mut out = FrameOutput::new();
        let result = self.plugin.lock().process_frame(frame, &mut out);
        self.counters.frames_processed.fetch_add(1, Ordering::Relaxed);
        if let Err(err) = result {
            self.counters.process_errors.fetch_add(1, Ordering::Relaxed);
            warn!(frame_number, error = %err, "Plugin failed to process frame");
        }
        self.forward(&mut out);
    }

    fn end_of_acquisition(&self) {
        let mut out = FrameOutput::new();
        if let Err(err) = self.plugin.lock().process_end_of_acquisition(&mut out) {
            self.counters.process_errors.fetch_add(1, Ordering::Relaxed);
            warn!(error = %err, "Plugin failed at end of acquisition");
        }
        self.forward(&mut out);
        for next in self.downstream_snapshot() {
            enqueue(&next.name, &next.tx, StageMessage::EndOfAcquisition);
        }
    }

    fn forward(&self, out: &mut FrameOutput) {
        if out.is_empty() {
            return;
        }
        let downstream = self.downstream_snapshot();
        for frame in out.drain() {
            self.counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
            for next in &downstream {
                enqueue(&next.name, &next.tx, StageMessage::Frame(frame.clone()));
            }
        }
    }

    fn downstream_snapshot(&self) -> Vec<Downstream> {
        self.downstream.read().clone()
    }
}

/// Controller-side handle to a running stage.
pub struct Stage {
    name: String,
    plugin_type: String,
    plugin: Arc<Mutex<Box<dyn FramePlugin>>>,
    tx: Sender<StageMessage>,
    downstream: Arc<RwLock<Vec<Downstream>>>,
    counters: Arc<StageCounters>,
    handle: Option<JoinHandle<()>>,
}

impl Stage {
    /// Start a worker for `plugin` with an input queue of `queue_depth` frames.
    pub(crate) fn spawn(
        name: &str,
        plugin: Box<dyn FramePlugin>,
        queue_depth: usize,
        discard: Arc<AtomicBool>,
    ) -> Result<Self> {
        if queue_depth == 0 {
            return Err(DaqError::malformed_parameter(
                format!("{name}/queue_depth"),
                "must be at least 1",
            ));
        }
        let plugin_type = plugin.plugin_type().to_string();
        let plugin = Arc::new(Mutex::new(plugin));
        let (tx, rx) = crossbeam_channel::bounded(queue_depth);
        let downstream = Arc::new(RwLock::new(Vec::new()));
        let counters = Arc::new(StageCounters::default());

        let worker = Worker {
            name: name.to_string(),
            plugin: Arc::clone(&plugin),
            rx,
            downstream: Arc::clone(&downstream),
            counters: Arc::clone(&counters),
            discard,
            span: tracing::info_span!("stage", name, plugin = %plugin_type),
        };
        let handle = std::thread::Builder::new()
            .name(format!("stage-{name}"))
            .spawn(move || worker.run())?;
        info!(stage = name, plugin = %plugin_type, queue_depth, "Stage started");

        Ok(Self {
            name: name.to_string(),
            plugin_type,
            plugin,
            tx,
            downstream,
            counters,
            handle: Some(handle),
        })
    }

    /// Stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registry name of the stage's plugin.
    #[must_use]
    pub fn plugin_type(&self) -> &str {
        &self.plugin_type
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> StageStats {
        self.counters.snapshot()
    }

    /// Messages waiting in the input queue.
    #[must_use]
    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    /// Names of connected downstream stages.
    #[must_use]
    pub fn downstream_names(&self) -> Vec<String> {
        self.downstream.read().iter().map(|d| d.name.clone()).collect()
    }

    pub(crate) fn sender(&self) -> Sender<StageMessage> {
        self.tx.clone()
    }

    pub(crate) fn add_downstream(&self, next: Downstream) {
        let mut downstream = self.downstream.write();
        if !downstream.iter().any(|d| d.name == next.name) {
            downstream.push(next);
        }
    }

    pub(crate) fn remove_downstream(&self, name: &str) -> bool {
        let mut downstream = self.downstream.write();
        let before = downstream.len();
        downstream.retain(|d| d.name != name);
        downstream.len() != before
    }

    /// Enqueue a frame, blocking while the queue is full.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if enqueue(&self.name, &self.tx, StageMessage::Frame(frame)) {
            Ok(())
        } else {
            Err(DaqError::ChannelClosed(format!("stage '{}' stopped", self.name)))
        }
    }

    pub(crate) fn end_of_acquisition(&self) {
        enqueue(&self.name, &self.tx, StageMessage::EndOfAcquisition);
    }

    /// Apply settings to the plugin.
    pub fn configure(&self, params: &ParamMessage) -> Result<()> {
        self.plugin.lock().configure(params)
    }

    /// Plugin settings plus the stage's plugin type, under `prefix`.
    pub fn request_configuration(&self, prefix: &str, msg: &mut ParamMessage) {
        msg.set(&daq_core::join_key(prefix, "plugin_type"), self.plugin_type.as_str());
        self.plugin.lock().request_configuration(prefix, msg);
    }

    /// Stage counters and plugin status under `prefix`.
    pub fn status(&self, prefix: &str, msg: &mut ParamMessage) {
        let key = |k: &str| daq_core::join_key(prefix, k);
        let stats = self.stats();
        msg.set(&key("plugin_type"), self.plugin_type.as_str());
        msg.set(&key("frames_processed"), stats.frames_processed);
        msg.set(&key("frames_forwarded"), stats.frames_forwarded);
        msg.set(&key("frames_discarded"), stats.frames_discarded);
        msg.set(&key("process_errors"), stats.process_errors);
        msg.set(&key("queue_depth"), self.queue_depth());
        msg.set(&key("downstream"), self.downstream_names());
        self.plugin.lock().status(prefix, msg);
    }

    /// Run `f` on the plugin if it is a `P`.
    pub fn with_plugin<P: FramePlugin + 'static, R>(&self, f: impl FnOnce(&mut P) -> R) -> Option<R> {
        let mut plugin = self.plugin.lock();
        plugin.as_any_mut().downcast_mut::<P>().map(f)
    }

    /// Queue a stop behind pending messages and wait for the worker.
    pub(crate) fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        enqueue(&self.name, &self.tx, StageMessage::Stop);
        handle
            .join()
            .map_err(|_| DaqError::WorkerPanicked(format!("stage-{}", self.name)))
    }
}

impl Drop for Stage {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(stage = %self.name, error = %err, "Stage worker did not stop cleanly");
        }
    }
}
