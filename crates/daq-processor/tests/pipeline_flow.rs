//! Multi-stage pipelines running on real worker threads.

use crossbeam_channel::{unbounded, Receiver, Sender};
use daq_core::{
    CompressionType, DaqError, DataBlock, Frame, FrameMetadata, ParamMessage, PixelType, Result,
};
use daq_pool::{DataBlockPool, SharedBufferPool};
use daq_processor::plugins::{self, decompress, AcquisitionFiles, Compression, IndexEntry};
use daq_processor::{FrameOutput, FramePlugin, Pipeline, PluginRegistry, ShutdownMode};
use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

/// Sink handing every frame back to the test.
struct Collector {
    tx: Sender<Frame>,
}

impl FramePlugin for Collector {
    fn plugin_type(&self) -> &'static str {
        "collector"
    }

    fn process_frame(&mut self, frame: Frame, _out: &mut FrameOutput) -> Result<()> {
        let _ = self.tx.send(frame);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Holds each frame until the test releases it.
struct Gate {
    open: Receiver<()>,
}

impl FramePlugin for Gate {
    fn plugin_type(&self) -> &'static str {
        "gate"
    }

    fn process_frame(&mut self, frame: Frame, out: &mut FrameOutput) -> Result<()> {
        let _ = self.open.recv();
        out.push(frame);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Fails on odd frame numbers.
struct Picky;

impl FramePlugin for Picky {
    fn plugin_type(&self) -> &'static str {
        "picky"
    }

    fn process_frame(&mut self, frame: Frame, out: &mut FrameOutput) -> Result<()> {
        if frame.frame_number() % 2 == 1 {
            return Err(DaqError::plugin("picky", "odd frame"));
        }
        out.push(frame);
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn registry() -> PluginRegistry {
    let mut registry = PluginRegistry::new();
    plugins::register_builtin_plugins(&mut registry, &DataBlockPool::unbounded()).unwrap();
    registry
}

fn collector_pipeline(registry: PluginRegistry) -> (Pipeline, Receiver<Frame>) {
    let (tx, rx) = unbounded();
    let mut pipeline = Pipeline::new(Arc::new(registry));
    pipeline
        .add_stage_with("sink", Box::new(Collector { tx }), 8)
        .unwrap();
    (pipeline, rx)
}

fn frame(number: u64, acquisition: &str) -> Frame {
    let data: Vec<u8> = (0..32u16 * 32).flat_map(|i| (i / 64).to_le_bytes()).collect();
    let mut meta = FrameMetadata::new(number, "data", PixelType::Raw16, vec![32, 32]);
    meta.acquisition_id = acquisition.to_string();
    Frame::new(meta, DataBlock::from_vec(data)).unwrap()
}

#[test]
fn test_compressed_frame_reaches_sink_and_slot_is_released() {
    let (mut pipeline, sink_rx) = collector_pipeline(registry());
    pipeline.add_stage("observe", "passthrough", 8).unwrap();
    pipeline.add_stage("compress", "compression", 8).unwrap();
    pipeline.connect("observe", "compress").unwrap();
    pipeline.connect("compress", "sink").unwrap();

    let slots = SharedBufferPool::anonymous(2048, 1).unwrap();
    let (release_tx, release_rx) = unbounded();
    let lease = slots.lease(0, 2048, Some(release_tx)).unwrap();
    let mut meta = FrameMetadata::new(5, "data", PixelType::Raw16, vec![32, 32]);
    meta.acquisition_id = "acq".to_string();
    let input = Frame::new(meta, DataBlock::from_slot(lease)).unwrap();
    pipeline.send("observe", input).unwrap();

    let output = sink_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(output.frame_number(), 5);
    assert_eq!(output.metadata().compression, CompressionType::ShuffleLz4);
    assert_ne!(output.data().len(), 2048);
    assert_eq!(decompress(output.data()).unwrap(), vec![0u8; 2048]);

    // The sink holds only the compressed copy; the slot went back.
    assert_eq!(release_rx.recv_timeout(WAIT).unwrap(), 0);
    assert_eq!(slots.outstanding_leases(), 0);

    let status = pipeline.stage_status("observe").unwrap();
    assert_eq!(status.get_u64("observe/frames_seen").unwrap(), Some(1));
    pipeline.shutdown(ShutdownMode::Drain).unwrap();
}

#[test]
fn test_compression_settings_change_at_next_acquisition() {
    let (mut pipeline, sink_rx) = collector_pipeline(registry());
    pipeline.add_stage("compress", "compression", 8).unwrap();
    pipeline.connect("compress", "sink").unwrap();

    pipeline.send("compress", frame(0, "first")).unwrap();
    let first = sink_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(first.metadata().compression, CompressionType::ShuffleLz4);

    let mut params = ParamMessage::new();
    params.set("compress/shuffle", false);
    pipeline.configure(&params).unwrap();
    let config = pipeline.stage_configuration("compress").unwrap();
    assert_eq!(config.get_bool("compress/shuffle").unwrap(), Some(false));

    pipeline.send("compress", frame(1, "first")).unwrap();
    pipeline.send("compress", frame(0, "second")).unwrap();
    let same = sink_rx.recv_timeout(WAIT).unwrap();
    let next = sink_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(same.metadata().compression, CompressionType::ShuffleLz4);
    assert_eq!(next.metadata().compression, CompressionType::Lz4);

    let applied = pipeline
        .with_plugin("compress", |c: &mut Compression| c.current_settings().shuffle)
        .unwrap();
    assert_eq!(applied, Some(false));
    pipeline.shutdown(ShutdownMode::Drain).unwrap();
}

#[test]
fn test_multi_stage_configure_is_all_or_nothing() {
    let mut pipeline = Pipeline::new(Arc::new(registry()));
    pipeline.add_stage("a_view", "live_view", 4).unwrap();
    pipeline.add_stage("b_compress", "compression", 4).unwrap();
    let frequency = |p: &Pipeline| {
        p.stage_configuration("a_view")
            .unwrap()
            .get_u64("a_view/frame_frequency")
            .unwrap()
    };

    let mut params = ParamMessage::new();
    params.set("a_view/frame_frequency", 7);
    params.set("missing/frame_frequency", 3);
    let err = pipeline.configure(&params).unwrap_err();
    assert!(matches!(err, DaqError::UnknownStage(_)));
    assert_eq!(frequency(&pipeline), Some(1));

    let mut params = ParamMessage::new();
    params.set("a_view/frame_frequency", 7);
    params.set("b_compress", 5);
    assert!(pipeline.configure(&params).unwrap_err().is_configuration());
    assert_eq!(frequency(&pipeline), Some(1));

    let mut params = ParamMessage::new();
    params.set("a_view/frame_frequency", 7);
    params.set("b_compress/compression_level", 1000);
    assert!(pipeline.configure(&params).unwrap_err().is_configuration());
    assert_eq!(frequency(&pipeline), Some(1));

    params.set("b_compress/compression_level", 2);
    pipeline.configure(&params).unwrap();
    assert_eq!(frequency(&pipeline), Some(7));
    let compress = pipeline.stage_configuration("b_compress").unwrap();
    assert_eq!(compress.get_u64("b_compress/compression_level").unwrap(), Some(2));
    pipeline.shutdown(ShutdownMode::Drain).unwrap();
}

#[test]
fn test_unknown_plugin_leaves_pipeline_unchanged() {
    let mut pipeline = Pipeline::new(Arc::new(registry()));
    pipeline.add_stage("a", "passthrough", 4).unwrap();

    let err = pipeline.add_stage("b", "UnknownName", 4).unwrap_err();
    assert!(matches!(err, DaqError::UnknownPluginName(_)));
    assert!(err.is_configuration());
    assert_eq!(pipeline.stage_names(), vec!["a"]);
    assert_eq!(pipeline.registry().len(), 4);

    assert!(matches!(
        pipeline.add_stage("a", "passthrough", 4),
        Err(DaqError::DuplicateStage(_))
    ));
}

#[test]
fn test_cycles_and_unknown_endpoints_rejected() {
    let mut pipeline = Pipeline::new(Arc::new(registry()));
    for name in ["a", "b", "c"] {
        pipeline.add_stage(name, "passthrough", 4).unwrap();
    }
    pipeline.connect("a", "b").unwrap();
    pipeline.connect("b", "c").unwrap();

    assert!(matches!(pipeline.connect("c", "a"), Err(DaqError::InvalidStageGraph(_))));
    assert!(matches!(pipeline.connect("b", "b"), Err(DaqError::InvalidStageGraph(_))));
    assert!(matches!(pipeline.connect("a", "zzz"), Err(DaqError::UnknownStage(_))));

    assert!(pipeline.disconnect("b", "c").unwrap());
    pipeline.connect("c", "a").unwrap();
}

#[test]
fn test_fan_out_shares_one_block() {
    let registry = registry();
    let (tx_left, rx_left) = unbounded();
    let (tx_right, rx_right) = unbounded();
    let mut pipeline = Pipeline::new(Arc::new(registry));
    pipeline.add_stage("split", "passthrough", 4).unwrap();
    pipeline.add_stage_with("left", Box::new(Collector { tx: tx_left }), 4).unwrap();
    pipeline.add_stage_with("right", Box::new(Collector { tx: tx_right }), 4).unwrap();
    pipeline.connect("split", "left").unwrap();
    pipeline.connect("split", "right").unwrap();

    pipeline.send("split", frame(3, "acq")).unwrap();
    let left = rx_left.recv_timeout(WAIT).unwrap();
    let right = rx_right.recv_timeout(WAIT).unwrap();
    assert!(Arc::ptr_eq(left.block(), right.block()));

    let stats = pipeline.stage_stats("split").unwrap();
    assert_eq!(stats.frames_forwarded, 1);
    pipeline.shutdown(ShutdownMode::Drain).unwrap();
}

#[test]
fn test_plugin_errors_are_counted_and_stage_keeps_running() {
    let (mut pipeline, sink_rx) = collector_pipeline(registry());
    pipeline.add_stage_with("picky", Box::new(Picky), 8).unwrap();
    pipeline.connect("picky", "sink").unwrap();

    for n in 0..4 {
        pipeline.send("picky", frame(n, "acq")).unwrap();
    }
    let report = pipeline.shutdown(ShutdownMode::Drain).unwrap();
    let received: Vec<u64> = sink_rx.try_iter().map(|f| f.frame_number()).collect();
    assert_eq!(received, vec![0, 2]);
    assert_eq!(report["picky"].frames_processed, 4);
    assert_eq!(report["picky"].process_errors, 2);
    assert_eq!(report["picky"].frames_forwarded, 2);
}

#[test]
fn test_end_of_acquisition_follows_frames_to_file_writer() {
    let dir = tempfile::tempdir().unwrap();
    let mut pipeline = Pipeline::new(Arc::new(registry()));
    pipeline.add_stage("observe", "passthrough", 2).unwrap();
    pipeline.add_stage("writer", "file_writer", 2).unwrap();
    pipeline.connect("observe", "writer").unwrap();

    let mut params = ParamMessage::new();
    params.set("file_path", dir.path().display().to_string());
    pipeline.configure_stage("writer", &params).unwrap();

    for n in 0..10 {
        pipeline.send("observe", frame(n, "run7")).unwrap();
    }
    pipeline.end_of_acquisition();
    let report = pipeline.shutdown(ShutdownMode::Drain).unwrap();
    assert_eq!(report["writer"].frames_processed, 10);

    let files = AcquisitionFiles::new(dir.path(), "run7", "data");
    let index: Vec<IndexEntry> = std::fs::read_to_string(&files.index)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(index.len(), 10);
    assert_eq!(index[9].frame_number, 9);
    assert_eq!(std::fs::metadata(&files.raw).unwrap().len(), 10 * 2048);
    let sidecar: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(&files.meta).unwrap()).unwrap();
    assert_eq!(sidecar["frames_written"], 10);
}

#[test]
fn test_attached_source_feeds_entry_stage() {
    let (mut pipeline, sink_rx) = collector_pipeline(registry());
    pipeline.add_stage("observe", "passthrough", 2).unwrap();
    pipeline.connect("observe", "sink").unwrap();

    let (ready_tx, ready_rx) = crossbeam_channel::bounded(2);
    pipeline.attach_source(ready_rx, &["observe"]).unwrap();
    for n in 0..6 {
        ready_tx.send(frame(n, "acq")).unwrap();
    }
    drop(ready_tx);

    let numbers: Vec<u64> = (0..6)
        .map(|_| sink_rx.recv_timeout(WAIT).unwrap().frame_number())
        .collect();
    assert_eq!(numbers, vec![0, 1, 2, 3, 4, 5]);
    assert!(matches!(
        pipeline.attach_source(unbounded().1, &["nope"]),
        Err(DaqError::UnknownStage(_))
    ));
    pipeline.shutdown(ShutdownMode::Drain).unwrap();
}

#[test]
fn test_discard_shutdown_counts_dropped_frames() {
    let (mut pipeline, sink_rx) = collector_pipeline(registry());
    let (open_tx, open_rx) = unbounded();
    pipeline.add_stage_with("gate", Box::new(Gate { open: open_rx }), 8).unwrap();
    pipeline.connect("gate", "sink").unwrap();

    for n in 0..5 {
        pipeline.send("gate", frame(n, "acq")).unwrap();
    }
    // Let the first frame through the gate, then close it behind the rest.
    open_tx.send(()).unwrap();
    let first = sink_rx.recv_timeout(WAIT).unwrap();
    assert_eq!(first.frame_number(), 0);

    let opener = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        drop(open_tx);
    });
    let report = pipeline.shutdown(ShutdownMode::Discard).unwrap();
    opener.join().unwrap();

    // Frame 1 may already be inside the gate when the stop arrives.
    let gate = report["gate"];
    assert_eq!(gate.frames_processed + gate.frames_discarded, 5);
    assert!(gate.frames_discarded >= 3);
    let sink = report["sink"];
    assert_eq!(sink.frames_processed + sink.frames_discarded, gate.frames_forwarded);
}
