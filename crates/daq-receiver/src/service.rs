//! Receive thread: owns a decoder and a transport, serves controller commands.
//!
//! The loop has three duties, in order of priority:
//!
//! 1. Apply pending controller commands (cold path)
//! 2. Reclaim released slots and run the timeout monitor once per interval
//! 3. Receive one message into the decoder's buffer and process it (hot path)
//!
//! A lost stream connection resets the decoder, so a partially received frame
//! gives its slot back before the next peer's bytes arrive.
//!
//! Transport reads time out after one monitor interval, so a frame is released
//! at most one interval after its timeout expires even when no data arrives.

use crate::decoder::{FrameDecoder, CONFIG_PREFIX};
use crate::transport::MessageTransport;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use daq_core::limits::DEFAULT_MONITOR_INTERVAL;
use daq_core::{verbs, ControlMessage, DaqError, ParamMessage, Result};
use daq_pool::SlotId;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, trace, warn, Span};

const COMMAND_QUEUE_CAPACITY: usize = 16;

/// Receive thread settings.
#[derive(Debug, Clone)]
pub struct ReceiverSettings {
    /// Thread and span name
    pub name: String,
    /// Timeout monitor cadence and transport read timeout
    pub monitor_interval: Duration,
}

impl Default for ReceiverSettings {
    fn default() -> Self {
        Self {
            name: "receiver".to_string(),
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
        }
    }
}

/// Commands from the controller to the receive thread.
pub enum ReceiverCommand {
    /// Apply decoder settings
    Configure {
        /// Parameters with `decoder_config/` keys
        params: ParamMessage,
        /// Outcome
        reply: Sender<Result<()>>,
    },
    /// Report decoder settings
    RequestConfiguration {
        /// Settings under `decoder_config/`
        reply: Sender<ParamMessage>,
    },
    /// Report decoder counters
    Status {
        /// Counters under `decoder/`
        reply: Sender<ParamMessage>,
    },
    /// Hand slots to the empty queue
    PushEmptyBuffers {
        /// Slot ids, queued in order
        ids: Vec<SlotId>,
        /// Resulting queue depth
        reply: Sender<usize>,
    },
    /// Forget every held slot
    DropAllBuffers {
        /// Completion signal
        reply: Sender<()>,
    },
    /// Stop the thread
    Shutdown,
}

struct ReceiveLoop {
    decoder: Box<dyn FrameDecoder>,
    transport: Box<dyn MessageTransport>,
    commands: Receiver<ReceiverCommand>,
    interval: Duration,
    span: Span,
}

impl ReceiveLoop {
    fn run(mut self) {
        let span = self.span.clone();
        let _entered = span.enter();
        info!(
            decoder = self.decoder.decoder_type(),
            transport = %self.transport.describe(),
            "Receive thread started"
        );

        let mut next_monitor = Instant::now() + self.interval;
        let mut transport_open = true;
        loop {
            if self.process_commands() {
                break;
            }

            self.decoder.core_mut().reclaim_released_buffers();
            let now = Instant::now();
            if now >= next_monitor {
                self.decoder.monitor_buffers();
                next_monitor = now + self.interval;
            }

            if !transport_open {
                std::thread::sleep(self.interval);
                continue;
            }

            let received = match self.decoder.get_next_message_buffer() {
                Ok(mut buf) => Some(self.transport.receive(&mut buf)),
                Err(err) => {
                    error!(error = %err, "No receive buffer available - resetting decoder");
                    None
                }
            };
            let Some(received) = received else {
                self.decoder.reset();
                std::thread::sleep(self.interval);
                continue;
            };
            match received {
                Ok(Some(n)) => {
                    let state = self.decoder.process_message(n);
                    trace!(bytes = n, ?state, "Message processed");
                }
                Ok(None) => {}
                Err(DaqError::ChannelClosed(reason)) => {
                    info!(%reason, "Transport closed");
                    transport_open = false;
                }
                Err(DaqError::ConnectionLost(reason)) => {
                    info!(%reason, "Peer disconnected - discarding partial frame");
                    self.decoder.reset();
                }
                Err(err) => warn!(error = %err, "Transport receive failed"),
            }
        }
        info!("Receive thread stopped");
    }

    /// Returns true when shutdown was requested.
    fn process_commands(&mut self) -> bool {
        loop {
            let command = match self.commands.try_recv() {
                Ok(command) => command,
                Err(TryRecvError::Empty) => return false,
                Err(TryRecvError::Disconnected) => {
                    info!("Controller handle dropped");
                    return true;
                }
            };
            match command {
                ReceiverCommand::Configure { params, reply } => {
                    let result = self.decoder.configure(&params);
                    if let Err(err) = &result {
                        warn!(error = %err, "Decoder configuration rejected");
                    }
                    let _ = reply.send(result);
                }
                ReceiverCommand::RequestConfiguration { reply } => {
                    let mut msg = ParamMessage::new();
                    self.decoder.request_configuration(CONFIG_PREFIX, &mut msg);
                    let _ = reply.send(msg);
                }
                ReceiverCommand::Status { reply } => {
                    let mut msg = ParamMessage::new();
                    self.decoder.get_status("decoder", &mut msg);
                    msg.set("receiver/transport", self.transport.describe());
                    let _ = reply.send(msg);
                }
                ReceiverCommand::PushEmptyBuffers { ids, reply } => {
                    for id in ids {
                        self.decoder.push_empty_buffer(id);
                    }
                    let _ = reply.send(self.decoder.get_num_empty_buffers());
                }
                ReceiverCommand::DropAllBuffers { reply } => {
                    self.decoder.drop_all_buffers();
                    let _ = reply.send(());
                }
                ReceiverCommand::Shutdown => {
                    info!("Shutdown command received");
                    return true;
                }
            }
        }
    }
}

/// Handle to a running receive thread.
pub struct FrameReceiver {
    name: String,
    commands: Sender<ReceiverCommand>,
    handle: Option<JoinHandle<()>>,
}

impl FrameReceiver {
    /// Start the receive thread.
    ///
    /// Fails if the decoder and transport disagree on framing.
    pub fn spawn(
        decoder: Box<dyn FrameDecoder>,
        mut transport: Box<dyn MessageTransport>,
        settings: ReceiverSettings,
    ) -> Result<Self> {
        if decoder.transport_kind() != transport.kind() {
            return Err(DaqError::malformed_parameter(
                "receiver/transport",
                format!(
                    "{} decoder needs a {:?} transport, got {:?}",
                    decoder.decoder_type(),
                    decoder.transport_kind(),
                    transport.kind()
                ),
            ));
        }
        transport.set_read_timeout(settings.monitor_interval)?;

        let (tx, rx) = crossbeam_channel::bounded(COMMAND_QUEUE_CAPACITY);
        let receive_loop = ReceiveLoop {
            decoder,
            transport,
            commands: rx,
            interval: settings.monitor_interval,
            span: tracing::info_span!("receiver", name = %settings.name),
        };
        let handle = std::thread::Builder::new()
            .name(settings.name.clone())
            .spawn(move || receive_loop.run())?;

        Ok(Self {
            name: settings.name,
            commands: tx,
            handle: Some(handle),
        })
    }

    /// Receiver name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    fn request<T>(&self, make: impl FnOnce(Sender<T>) -> ReceiverCommand) -> Result<T> {
        let (reply_tx, reply_rx) = crossbeam_channel::bounded(1);
        self.commands
            .send(make(reply_tx))
            .map_err(|_| DaqError::ChannelClosed(format!("receiver '{}' stopped", self.name)))?;
        reply_rx
            .recv()
            .map_err(|_| DaqError::ChannelClosed(format!("receiver '{}' stopped", self.name)))
    }

    /// Apply decoder settings.
    pub fn configure(&self, params: ParamMessage) -> Result<()> {
        self.request(|reply| ReceiverCommand::Configure { params, reply })?
    }

    /// Current decoder settings under `decoder_config/`.
    pub fn request_configuration(&self) -> Result<ParamMessage> {
        self.request(|reply| ReceiverCommand::RequestConfiguration { reply })
    }

    /// Decoder counters under `decoder/`.
    pub fn status(&self) -> Result<ParamMessage> {
        self.request(|reply| ReceiverCommand::Status { reply })
    }

    /// Queue slots for incoming frames; returns the queue depth.
    pub fn push_empty_buffers(&self, ids: Vec<SlotId>) -> Result<usize> {
        self.request(|reply| ReceiverCommand::PushEmptyBuffers { ids, reply })
    }

    /// Drop every slot the decoder holds.
    pub fn drop_all_buffers(&self) -> Result<()> {
        self.request(|reply| ReceiverCommand::DropAllBuffers { reply })
    }

    /// Serve a control channel request and build the reply.
    pub fn handle_control(&self, msg: &ControlMessage) -> ControlMessage {
        let result = match msg.msg_val.as_str() {
            verbs::CONFIGURE => self
                .configure(msg.params.clone())
                .map(|()| ParamMessage::new()),
            verbs::REQUEST_CONFIGURATION => self.request_configuration(),
            verbs::STATUS => self.status(),
            other => Err(DaqError::MalformedMessage(format!("unknown command '{other}'"))),
        };
        match result {
            Ok(params) => msg.ack(params),
            Err(err) => msg.nack(&err.to_string()),
        }
    }

    /// Stop the thread and wait for it.
    pub fn shutdown(mut self) -> Result<()> {
        self.stop()
    }

    fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.handle.take() else {
            return Ok(());
        };
        let _ = self.commands.send(ReceiverCommand::Shutdown);
        handle
            .join()
            .map_err(|_| DaqError::WorkerPanicked(self.name.clone()))
    }
}

impl Drop for FrameReceiver {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            error!(receiver = %self.name, error = %err, "Receive thread did not stop cleanly");
        }
    }
}
