//! Stage graph built by name from a [`PluginRegistry`].
//!
//! ```text
//!  decoder ready channel ──► feeder ──► [entry] ──► [stage] ──► [sink]
//!                                           └─────► [stage] ──► [sink]
//! ```
//!
//! Every stage runs its plugin on a dedicated thread behind a bounded queue.
//! A full queue blocks the sender, so a slow sink stalls its upstream stages,
//! then the feeder, then the decoder's ready channel, and finally the decoder
//! runs out of empty slots.

use crate::registry::PluginRegistry;
use crate::stage::{enqueue, Downstream, Stage, StageMessage, StageStats};
use crate::FramePlugin;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use daq_core::{DaqError, Frame, ParamMessage, Result};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{error, info, warn};

const FEEDER_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How [`Pipeline::shutdown`] treats frames still queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ShutdownMode {
    /// Process everything already queued, upstream stages first.
    #[default]
    Drain,
    /// Drop queued frames; each stage counts and logs what it dropped.
    Discard,
}

struct SourceFeeder {
    entries: Vec<String>,
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

fn run_feeder(
    source: Receiver<Frame>,
    targets: Vec<Downstream>,
    stop: Arc<AtomicBool>,
    discard: Arc<AtomicBool>,
) {
    let deliver = |frame: Frame| {
        for target in &targets {
            enqueue(&target.name, &target.tx, StageMessage::Frame(frame.clone()));
        }
    };
    loop {
        if stop.load(Ordering::Acquire) {
            if !discard.load(Ordering::Acquire) {
                source.try_iter().for_each(&deliver);
            }
            break;
        }
        match source.recv_timeout(FEEDER_POLL_INTERVAL) {
            Ok(frame) => deliver(frame),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                info!("Frame source closed");
                break;
            }
        }
    }
}

/// A directed acyclic graph of named stages.
pub struct Pipeline {
    registry: Arc<PluginRegistry>,
    stages: BTreeMap<String, Stage>,
    edges: BTreeMap<String, BTreeSet<String>>,
    sources: Vec<SourceFeeder>,
    discard: Arc<AtomicBool>,
}

impl Pipeline {
    /// Empty pipeline creating plugins from `registry`.
    #[must_use]
    pub fn new(registry: Arc<PluginRegistry>) -> Self {
        Self {
            registry,
            stages: BTreeMap::new(),
            edges: BTreeMap::new(),
            sources: Vec::new(),
            discard: Arc::new(AtomicBool::new(false)),
        }
    }

    /// The registry stages are created from.
    #[must_use]
    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Create a stage running a new `plugin_type` plugin.
    pub fn add_stage(&mut self, name: &str, plugin_type: &str, queue_depth: usize) -> Result<()> {
        if self.stages.contains_key(name) {
            return Err(DaqError::DuplicateStage(name.to_string()));
        }
        let plugin = self.registry.create(plugin_type, name)?;
        self.insert_stage(name, plugin, queue_depth)
    }

    /// Add a stage around a plugin built outside the registry.
    pub fn add_stage_with(
        &mut self,
        name: &str,
        plugin: Box<dyn FramePlugin>,
        queue_depth: usize,
    ) -> Result<()> {
        if self.stages.contains_key(name) {
            return Err(DaqError::DuplicateStage(name.to_string()));
        }
        self.insert_stage(name, plugin, queue_depth)
    }

    fn insert_stage(&mut self, name: &str, plugin: Box<dyn FramePlugin>, queue_depth: usize) -> Result<()> {
        let stage = Stage::spawn(name, plugin, queue_depth, Arc::clone(&self.discard))?;
        self.stages.insert(name.to_string(), stage);
        self.edges.insert(name.to_string(), BTreeSet::new());
        Ok(())
    }

    fn stage(&self, name: &str) -> Result<&Stage> {
        self.stages
            .get(name)
            .ok_or_else(|| DaqError::UnknownStage(name.to_string()))
    }

    /// Stage names, sorted.
    #[must_use]
    pub fn stage_names(&self) -> Vec<&str> {
        self.stages.keys().map(String::as_str).collect()
    }

    /// Number of stages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// True if no stages were added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    fn reachable(&self, from: &str, to: &str) -> bool {
        let mut pending = vec![from];
        let mut seen = BTreeSet::new();
        while let Some(node) = pending.pop() {
            if node == to {
                return true;
            }
            if !seen.insert(node) {
                continue;
            }
            if let Some(next) = self.edges.get(node) {
                pending.extend(next.iter().map(String::as_str));
            }
        }
        false
    }

    /// Send everything `from` forwards to `to` as well.
    ///
    /// Rejects unknown names and any edge that would close a cycle.
    pub fn connect(&mut self, from: &str, to: &str) -> Result<()> {
        let upstream = self.stage(from)?;
        let downstream = self.stage(to)?;
        if self.reachable(to, from) {
            return Err(DaqError::InvalidStageGraph(format!(
                "connecting '{from}' to '{to}' would create a cycle"
            )));
        }
        upstream.add_downstream(Downstream {
            name: to.to_string(),
            tx: downstream.sender(),
        });
        self.edges
            .entry(from.to_string())
            .or_default()
            .insert(to.to_string());
        info!(from, to, "Stages connected");
        Ok(())
    }

    /// Remove the edge `from` → `to`. Returns false if it did not exist.
    pub fn disconnect(&mut self, from: &str, to: &str) -> Result<bool> {
        let upstream = self.stage(from)?;
        self.stage(to)?;
        let removed = upstream.remove_downstream(to);
        if let Some(next) = self.edges.get_mut(from) {
            next.remove(to);
        }
        if removed {
            info!(from, to, "Stages disconnected");
        }
        Ok(removed)
    }

    /// Feed frames from `source` (a decoder's ready channel) into `entry_stages`.
    ///
    /// The feeder thread runs until the source closes or the pipeline shuts down.
    pub fn attach_source(&mut self, source: Receiver<Frame>, entry_stages: &[&str]) -> Result<()> {
        let mut targets = Vec::with_capacity(entry_stages.len());
        for name in entry_stages {
            targets.push(Downstream {
                name: (*name).to_string(),
                tx: self.stage(name)?.sender(),
            });
        }
        let entries: Vec<String> = targets.iter().map(|t| t.name.clone()).collect();
        let stop = Arc::new(AtomicBool::new(false));
        let handle = {
            let stop = Arc::clone(&stop);
            let discard = Arc::clone(&self.discard);
            std::thread::Builder::new()
                .name("pipeline-feeder".to_string())
                .spawn(move || run_feeder(source, targets, stop, discard))?
        };
        info!(entries = ?entries, "Frame source attached");
        self.sources.push(SourceFeeder { entries, stop, handle });
        Ok(())
    }

    /// A sender whose frames go to `entry`, for producers that are not channels.
    pub fn entry_sender(&self, entry: &str) -> Result<StageSender> {
        let stage = self.stage(entry)?;
        Ok(StageSender {
            name: entry.to_string(),
            tx: stage.sender(),
        })
    }

    /// Enqueue a frame on `entry`, blocking while its queue is full.
    pub fn send(&self, entry: &str, frame: Frame) -> Result<()> {
        self.stage(entry)?.send(frame)
    }

    /// Apply `params` to the plugin of stage `name`.
    pub fn configure_stage(&self, name: &str, params: &ParamMessage) -> Result<()> {
        self.stage(name)?.configure(params)
    }

    /// Configure several stages from one message keyed by stage name.
    ///
    /// Every named stage must exist and carry a settings object before any
    /// is touched. If a stage rejects its settings, stages already updated
    /// get their previous settings back, so the update applies fully or not
    /// at all.
    pub fn configure(&self, params: &ParamMessage) -> Result<()> {
        let root = params.as_value();
        let mut targets = Vec::new();
        for (name, value) in root.as_object().into_iter().flatten() {
            let stage = self.stage(name)?;
            let Some(sub) = params.subtree(name) else {
                return Err(DaqError::malformed_parameter(
                    name.as_str(),
                    format!("expected stage settings object, got {value}"),
                ));
            };
            targets.push((name, stage, sub));
        }

        let mut applied: Vec<(&String, &Stage, ParamMessage)> = Vec::with_capacity(targets.len());
        for (name, stage, sub) in targets {
            let mut previous = ParamMessage::new();
            stage.request_configuration("", &mut previous);
            if let Err(err) = stage.configure(&sub) {
                warn!(stage = %name, error = %err, "Stage rejected settings - restoring configured stages");
                for (name, stage, previous) in applied.into_iter().rev() {
                    if let Err(restore) = stage.configure(&previous) {
                        error!(stage = %name, error = %restore, "Failed to restore stage settings");
                    }
                }
                return Err(err);
            }
            applied.push((name, stage, previous));
        }
        Ok(())
    }

    /// Settings of stage `name` under its name.
    pub fn stage_configuration(&self, name: &str) -> Result<ParamMessage> {
        let mut msg = ParamMessage::new();
        self.stage(name)?.request_configuration(name, &mut msg);
        Ok(msg)
    }

    /// Settings of every stage, keyed by stage name.
    #[must_use]
    pub fn request_configuration(&self) -> ParamMessage {
        let mut msg = ParamMessage::new();
        for (name, stage) in &self.stages {
            stage.request_configuration(name, &mut msg);
        }
        msg
    }

    /// Status of stage `name` under its name.
    pub fn stage_status(&self, name: &str) -> Result<ParamMessage> {
        let mut msg = ParamMessage::new();
        self.stage(name)?.status(name, &mut msg);
        Ok(msg)
    }

    /// Counters of stage `name`.
    pub fn stage_stats(&self, name: &str) -> Result<StageStats> {
        Ok(self.stage(name)?.stats())
    }

    /// Status of every stage, keyed by stage name.
    #[must_use]
    pub fn status(&self) -> ParamMessage {
        let mut msg = ParamMessage::new();
        for (name, stage) in &self.stages {
            stage.status(name, &mut msg);
        }
        msg
    }

    /// Run `f` on the plugin of stage `name` if it is a `P`.
    ///
    /// `Ok(None)` means the stage exists but runs a different plugin type.
    pub fn with_plugin<P: FramePlugin + 'static, R>(
        &self,
        name: &str,
        f: impl FnOnce(&mut P) -> R,
    ) -> Result<Option<R>> {
        Ok(self.stage(name)?.with_plugin(f))
    }

    fn entry_points(&self) -> Vec<&str> {
        let fed: BTreeSet<&str> = self.edges.values().flatten().map(String::as_str).collect();
        self.stages
            .keys()
            .map(String::as_str)
            .filter(|name| !fed.contains(name))
            .collect()
    }

    /// Mark the end of the current acquisition.
    ///
    /// The marker enters every stage without an upstream stage and travels
    /// behind the frames already queued, so sinks see it after the last frame.
    pub fn end_of_acquisition(&self) {
        for name in self.entry_points() {
            if let Some(stage) = self.stages.get(name) {
                stage.end_of_acquisition();
            }
        }
    }

    /// Stage names with every upstream stage before its downstream stages.
    fn topological_order(&self) -> Vec<String> {
        let mut in_degree: BTreeMap<&str, usize> =
            self.stages.keys().map(|k| (k.as_str(), 0)).collect();
        for next in self.edges.values().flatten() {
            if let Some(d) = in_degree.get_mut(next.as_str()) {
                *d += 1;
            }
        }
        let mut ready: VecDeque<&str> = in_degree
            .iter()
            .filter(|(_, &d)| d == 0)
            .map(|(&k, _)| k)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());
        while let Some(node) = ready.pop_front() {
            order.push(node.to_string());
            for next in self.edges.get(node).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next.as_str()) {
                    *d -= 1;
                    if *d == 0 {
                        ready.push_back(next.as_str());
                    }
                }
            }
        }
        order
    }

    /// Stop feeders and stages, returning each stage's final counters.
    ///
    /// Stages are stopped in topological order, so with [`ShutdownMode::Drain`]
    /// each stage's stop marker lands behind everything its upstream stages
    /// forwarded.
    pub fn shutdown(&mut self, mode: ShutdownMode) -> Result<BTreeMap<String, StageStats>> {
        let mut report = BTreeMap::new();
        if self.stages.is_empty() && self.sources.is_empty() {
            return Ok(report);
        }
        info!(?mode, stages = self.stages.len(), "Pipeline shutting down");
        if mode == ShutdownMode::Discard {
            self.discard.store(true, Ordering::Release);
        }

        let mut first_error = None;
        for feeder in self.sources.drain(..) {
            feeder.stop.store(true, Ordering::Release);
            if feeder.handle.join().is_err() {
                error!(entries = ?feeder.entries, "Feeder thread panicked");
                first_error.get_or_insert(DaqError::WorkerPanicked("pipeline-feeder".to_string()));
            }
        }

        for name in self.topological_order() {
            if let Some(mut stage) = self.stages.remove(&name) {
                if let Err(err) = stage.stop() {
                    error!(stage = %name, error = %err, "Stage did not stop cleanly");
                    first_error.get_or_insert(err);
                }
                report.insert(name, stage.stats());
            }
        }
        // Only reachable if the graph was somehow cyclic.
        if !self.stages.is_empty() {
            warn!(remaining = self.stages.len(), "Stopping stages outside topological order");
            self.stages.clear();
        }
        self.edges.clear();
        self.discard.store(false, Ordering::Release);
        first_error.map_or(Ok(report), Err)
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if let Err(err) = self.shutdown(ShutdownMode::Drain) {
            error!(error = %err, "Pipeline did not shut down cleanly");
        }
    }
}

/// Producer handle for one entry stage.
#[derive(Clone)]
pub struct StageSender {
    name: String,
    tx: Sender<StageMessage>,
}

impl StageSender {
    /// Enqueue a frame, blocking while the stage queue is full.
    pub fn send(&self, frame: Frame) -> Result<()> {
        if enqueue(&self.name, &self.tx, StageMessage::Frame(frame)) {
            Ok(())
        } else {
            Err(DaqError::ChannelClosed(format!("stage '{}' stopped", self.name)))
        }
    }
}
