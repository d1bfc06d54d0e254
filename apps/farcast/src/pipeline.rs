//! Command bus between the negotiation layer and the media pipelines.
//!
//! The pipelines themselves (capture, encode, webrtcbin) live in the
//! embedding media runtime; this module only owns the typed command stream
//! the negotiation layer drives them with, plus the backchannel the runtime
//! uses to surface locally generated SDP offers and ICE candidates. Because
//! commands are delivered in order, a `add_turn_server` queued before
//! `start` lands in the initial offer's server list, while one delivered to
//! a live pipeline is an additive relay update.

use rtc_credentials::TurnUri;
use tokio::sync::mpsc;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
}

impl StreamKind {
    pub fn label(self) -> &'static str {
        match self {
            StreamKind::Video => "video",
            StreamKind::Audio => "audio",
        }
    }
}

/// Operations the negotiation layer invokes on a pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineCommand {
    Start { audio_only: bool },
    Stop,
    SetVideoBitrate(u32),
    SetAudioBitrate(u32),
    SetFramerate(u32),
    SendRemoteResolution { res: String },
    AddTurnServer(TurnUri),
    SendCursorData(String),
    SendGpuStats {
        load: f64,
        memory_total: u64,
        memory_used: u64,
    },
    SendSystemStats {
        cpu_percent: f64,
        mem_total: u64,
        mem_used: u64,
    },
    SendPing(f64),
    SendLatency(f64),
    SetSdp { kind: String, sdp: String },
    SetIce {
        sdp_mline_index: u32,
        candidate: String,
    },
}

/// What a running pipeline reports back while negotiating.
#[derive(Debug, Clone, PartialEq)]
pub enum PipelineEvent {
    Sdp { kind: String, sdp: String },
    Ice {
        sdp_mline_index: u32,
        candidate: String,
    },
}

pub type PipelineEvents = mpsc::UnboundedReceiver<PipelineEvent>;

/// Consumer side handed to the embedding media runtime: it drains commands
/// and pushes negotiation events back.
pub struct PipelineBus {
    pub commands: mpsc::UnboundedReceiver<PipelineCommand>,
    pub events: mpsc::UnboundedSender<PipelineEvent>,
}

/// The negotiation layer's handle on one pipeline.
#[derive(Clone)]
pub struct PipelineHandle {
    kind: StreamKind,
    commands: mpsc::UnboundedSender<PipelineCommand>,
}

/// Creates one pipeline seam: the handle the negotiation layer keeps, the
/// event stream the supervisor pumps, and the bus the media runtime drives.
pub fn pipeline(kind: StreamKind) -> (PipelineHandle, PipelineEvents, PipelineBus) {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    (
        PipelineHandle {
            kind,
            commands: command_tx,
        },
        event_rx,
        PipelineBus {
            commands: command_rx,
            events: event_tx,
        },
    )
}

impl PipelineHandle {
    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn start(&self, audio_only: bool) {
        self.send(PipelineCommand::Start { audio_only });
    }

    pub fn stop(&self) {
        self.send(PipelineCommand::Stop);
    }

    pub fn set_video_bitrate(&self, bitrate: u32) {
        self.send(PipelineCommand::SetVideoBitrate(bitrate));
    }

    pub fn set_audio_bitrate(&self, bitrate: u32) {
        self.send(PipelineCommand::SetAudioBitrate(bitrate));
    }

    pub fn set_framerate(&self, framerate: u32) {
        self.send(PipelineCommand::SetFramerate(framerate));
    }

    pub fn send_remote_resolution(&self, res: &str) {
        self.send(PipelineCommand::SendRemoteResolution { res: res.to_string() });
    }

    pub fn add_turn_server(&self, uri: &TurnUri) {
        self.send(PipelineCommand::AddTurnServer(uri.clone()));
    }

    pub fn send_cursor_data(&self, data: &str) {
        self.send(PipelineCommand::SendCursorData(data.to_string()));
    }

    pub fn send_gpu_stats(&self, load: f64, memory_total: u64, memory_used: u64) {
        self.send(PipelineCommand::SendGpuStats {
            load,
            memory_total,
            memory_used,
        });
    }

    pub fn send_system_stats(&self, cpu_percent: f64, mem_total: u64, mem_used: u64) {
        self.send(PipelineCommand::SendSystemStats {
            cpu_percent,
            mem_total,
            mem_used,
        });
    }

    pub fn send_ping(&self, timestamp: f64) {
        self.send(PipelineCommand::SendPing(timestamp));
    }

    pub fn send_latency(&self, latency_ms: f64) {
        self.send(PipelineCommand::SendLatency(latency_ms));
    }

    pub fn set_sdp(&self, kind: &str, sdp: &str) {
        self.send(PipelineCommand::SetSdp {
            kind: kind.to_string(),
            sdp: sdp.to_string(),
        });
    }

    pub fn set_ice(&self, sdp_mline_index: u32, candidate: &str) {
        self.send(PipelineCommand::SetIce {
            sdp_mline_index,
            candidate: candidate.to_string(),
        });
    }

    fn send(&self, command: PipelineCommand) {
        if self.commands.send(command).is_err() {
            debug!(
                target: "pipeline",
                pipeline = self.kind.label(),
                "pipeline bus is gone; dropping command"
            );
        }
    }
}

/// Default bus consumer for deployments where the media runtime attaches
/// elsewhere: logs every command and keeps the event channel open.
pub fn attach_log_drain(bus: PipelineBus) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let PipelineBus {
            mut commands,
            events,
        } = bus;
        // Keep the sender alive so supervisor pumps stay parked instead of
        // observing a closed channel.
        let _events = events;
        while let Some(command) = commands.recv().await {
            debug!(target: "pipeline", command = ?command, "pipeline command drained");
        }
    })
}
