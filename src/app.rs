//! Composition root: builds the slot region, decoder, receive thread and
//! pipeline from configuration and routes control messages between them.

use crate::config::FrameDaqConfig;
use anyhow::{Context, Result};
use daq_core::{verbs, ControlMessage, DaqError, ParamMessage};
use daq_pool::{DataBlockPool, SharedBufferPool};
use daq_processor::{plugins, Pipeline, PluginRegistry, ShutdownMode, StageStats};
use daq_receiver::{
    build_decoder, DecoderCore, DecoderKind, FrameDecoder, FrameReceiver, MessageTransport, ReceiverSettings,
    TcpTransport, UdpTransport,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Parameter subtree routed to the pipeline.
pub const PLUGINS_PREFIX: &str = "plugins";

/// A running receiver and pipeline.
pub struct FrameDaqApp {
    slots: SharedBufferPool,
    block_pool: DataBlockPool,
    receiver: FrameReceiver,
    pipeline: Pipeline,
}

impl FrameDaqApp {
    /// Start with the network transport named in the configuration.
    pub fn start(config: &FrameDaqConfig) -> Result<Self> {
        let bind = config.receiver.bind.as_str();
        let transport: Box<dyn MessageTransport> = match config.receiver.decoder {
            DecoderKind::Packet => Box::new(
                UdpTransport::bind(bind).with_context(|| format!("Failed to bind UDP {bind}"))?,
            ),
            DecoderKind::Stream => Box::new(
                TcpTransport::bind(bind).with_context(|| format!("Failed to listen on TCP {bind}"))?,
            ),
        };
        Self::start_with_transport(config, transport)
    }

    /// Start with a caller-supplied transport.
    pub fn start_with_transport(
        config: &FrameDaqConfig,
        transport: Box<dyn MessageTransport>,
    ) -> Result<Self> {
        let geometry = &config.shared_buffer;
        let slots = match &geometry.path {
            Some(path) => SharedBufferPool::create(path, geometry.slot_size, geometry.slot_count)
                .with_context(|| format!("Failed to map shared buffer at {}", path.display()))?,
            None => SharedBufferPool::anonymous(geometry.slot_size, geometry.slot_count)
                .context("Failed to map anonymous shared buffer")?,
        };
        let block_pool = DataBlockPool::new(config.block_pool.high_water_bytes);

        let mut registry = PluginRegistry::new();
        plugins::register_builtin_plugins(&mut registry, &block_pool)?;
        let mut pipeline = Pipeline::new(Arc::new(registry));
        for stage in &config.pipeline.stages {
            pipeline
                .add_stage(&stage.name, &stage.plugin, stage.queue_depth)
                .with_context(|| format!("Failed to create stage '{}'", stage.name))?;
            pipeline
                .configure_stage(&stage.name, &stage.plugin_params()?)
                .with_context(|| format!("Failed to configure stage '{}'", stage.name))?;
        }
        for edge in &config.pipeline.connections {
            pipeline.connect(&edge.from, &edge.to)?;
        }

        let receiver_config = &config.receiver;
        let (ready_tx, ready_rx) = crossbeam_channel::bounded(receiver_config.ready_queue_depth);
        let core = DecoderCore::new(config.application.name.as_str(), slots.clone(), ready_tx);
        let mut decoder = build_decoder(receiver_config.decoder, core, receiver_config.packets_per_frame);
        decoder
            .init(&receiver_config.decoder_params()?)
            .context("Invalid decoder settings")?;

        let entries: Vec<&str> = config.pipeline.entry.iter().map(String::as_str).collect();
        if entries.is_empty() {
            warn!("No entry stages configured - completed frames are released immediately");
        }
        pipeline.attach_source(ready_rx, &entries)?;

        let settings = ReceiverSettings {
            name: config.application.name.clone(),
            monitor_interval: Duration::from_millis(receiver_config.monitor_interval_ms),
        };
        let receiver = FrameReceiver::spawn(decoder, transport, settings)?;
        let queued = receiver.push_empty_buffers((0..slots.slot_count()).collect())?;

        info!(
            slots = queued,
            slot_size = slots.slot_size(),
            stages = pipeline.len(),
            decoder = ?receiver_config.decoder,
            "Frame receiver started"
        );
        Ok(Self {
            slots,
            block_pool,
            receiver,
            pipeline,
        })
    }

    /// The processing pipeline.
    #[must_use]
    pub fn pipeline(&self) -> &Pipeline {
        &self.pipeline
    }

    /// The receive thread handle.
    #[must_use]
    pub fn receiver(&self) -> &FrameReceiver {
        &self.receiver
    }

    /// The slot region frames are received into.
    #[must_use]
    pub fn slots(&self) -> &SharedBufferPool {
        &self.slots
    }

    /// Apply `decoder_config/` keys to the decoder and `plugins/<stage>/` keys
    /// to the pipeline.
    pub fn configure(&self, params: &ParamMessage) -> daq_core::Result<()> {
        if params.has(daq_receiver::CONFIG_PREFIX) {
            self.receiver.configure(params.clone())?;
        }
        if let Some(stages) = params.subtree(PLUGINS_PREFIX) {
            self.pipeline.configure(&stages)?;
        }
        Ok(())
    }

    /// Decoder and stage settings.
    pub fn request_configuration(&self) -> daq_core::Result<ParamMessage> {
        let mut msg = self.receiver.request_configuration()?;
        let mut stages = ParamMessage::new();
        stages.set(PLUGINS_PREFIX, self.pipeline.request_configuration().as_value());
        msg.merge(&stages);
        Ok(msg)
    }

    /// Decoder, pool and stage counters.
    pub fn status(&self) -> daq_core::Result<ParamMessage> {
        let mut msg = self.receiver.status()?;
        msg.set("shared_buffer/slot_count", self.slots.slot_count());
        msg.set("shared_buffer/slot_size", self.slots.slot_size());
        msg.set("shared_buffer/outstanding_leases", self.slots.outstanding_leases());
        msg.set("block_pool/allocated_bytes", self.block_pool.allocated_bytes());
        msg.set("block_pool/free_blocks", self.block_pool.free_blocks());
        msg.set("block_pool/total_allocations", self.block_pool.total_allocations());
        let mut stages = ParamMessage::new();
        stages.set(PLUGINS_PREFIX, self.pipeline.status().as_value());
        msg.merge(&stages);
        Ok(msg)
    }

    /// Close the current acquisition in every stage.
    pub fn end_of_acquisition(&self) {
        self.pipeline.end_of_acquisition();
    }

    /// Serve one control request. `shutdown` is acknowledged here; stopping
    /// is up to the caller.
    pub fn handle_control(&self, msg: &ControlMessage) -> ControlMessage {
        let result = match msg.msg_val.as_str() {
            verbs::CONFIGURE => self.configure(&msg.params).map(|()| ParamMessage::new()),
            verbs::REQUEST_CONFIGURATION => self.request_configuration(),
            verbs::STATUS => self.status(),
            verbs::END_OF_ACQUISITION => {
                self.end_of_acquisition();
                Ok(ParamMessage::new())
            }
            verbs::SHUTDOWN => Ok(ParamMessage::new()),
            other => Err(DaqError::MalformedMessage(format!("unknown command '{other}'"))),
        };
        match result {
            Ok(params) => msg.ack(params),
            Err(err) => {
                warn!(command = %msg.msg_val, id = msg.id, error = %err, "Control request rejected");
                msg.nack(&err.to_string())
            }
        }
    }

    /// Parse a JSON request and encode the reply.
    pub fn handle_control_json(&self, text: &str) -> daq_core::Result<(ControlMessage, String)> {
        let request = ControlMessage::from_json(text)?;
        let reply = self.handle_control(&request);
        let encoded = reply.to_json()?;
        Ok((request, encoded))
    }

    /// Stop the receive thread, then the pipeline. Returns final stage counters.
    pub fn shutdown(mut self, mode: ShutdownMode) -> Result<BTreeMap<String, StageStats>> {
        if mode == ShutdownMode::Discard {
            self.receiver.drop_all_buffers()?;
        }
        self.receiver.shutdown().context("Receive thread did not stop cleanly")?;
        let report = self.pipeline.shutdown(mode)?;
        for (stage, stats) in &report {
            info!(
                stage = %stage,
                processed = stats.frames_processed,
                forwarded = stats.frames_forwarded,
                discarded = stats.frames_discarded,
                errors = stats.process_errors,
                "Stage stopped"
            );
        }
        info!(
            allocated_bytes = self.block_pool.allocated_bytes(),
            outstanding_leases = self.slots.outstanding_leases(),
            "Frame receiver stopped"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use daq_receiver::{ChannelTransport, TransportKind};
    use tracing_test::traced_test;

    fn small_config() -> FrameDaqConfig {
        let mut config = FrameDaqConfig::default();
        config.shared_buffer.slot_size = 64;
        config.shared_buffer.slot_count = 2;
        config.receiver.packets_per_frame = 4;
        config.receiver.params.insert("pixel_type".into(), "raw8".into());
        config
            .receiver
            .params
            .insert("dimensions".into(), serde_json::json!([8, 8]));
        config
    }

    fn start(config: &FrameDaqConfig) -> FrameDaqApp {
        let (_tx, transport) = ChannelTransport::pair(TransportKind::Datagram);
        FrameDaqApp::start_with_transport(config, Box::new(transport)).unwrap()
    }

    #[test]
    #[traced_test]
    fn test_empty_pipeline_warns() {
        let app = start(&small_config());
        assert!(app.pipeline().is_empty());
        assert!(logs_contain("No entry stages configured"));
        app.shutdown(ShutdownMode::Drain).unwrap();
    }

    #[test]
    #[traced_test]
    fn test_unknown_command_is_rejected() {
        let app = start(&small_config());
        let reply = app.handle_control(&ControlMessage::command("reticulate", 9));
        assert_eq!(reply.msg_type, daq_core::MessageType::Nack);
        assert_eq!(reply.id, 9);
        assert!(logs_contain("Control request rejected"));
        app.shutdown(ShutdownMode::Drain).unwrap();
    }

    #[test]
    fn test_status_reports_pool_geometry() {
        let app = start(&small_config());
        let status = app.status().unwrap();
        assert_eq!(status.get_u64("shared_buffer/slot_size").unwrap(), Some(64));
        assert_eq!(status.get_u64("shared_buffer/outstanding_leases").unwrap(), Some(0));
        assert_eq!(status.get_str("decoder/decoder_type").unwrap(), Some("packet"));
        app.shutdown(ShutdownMode::Discard).unwrap();
    }

    #[test]
    fn test_decoder_settings_outside_slot_rejected() {
        let mut config = small_config();
        config
            .receiver
            .params
            .insert("dimensions".into(), serde_json::json!([64, 64]));
        let (_tx, transport) = ChannelTransport::pair(TransportKind::Datagram);
        assert!(FrameDaqApp::start_with_transport(&config, Box::new(transport)).is_err());
    }
}
