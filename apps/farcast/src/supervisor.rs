//! Session life-cycle supervision.
//!
//! The supervisor binds the two signaling channels to their pipelines and
//! restarts the whole negotiation cycle forever: connect both channels, let
//! the audio loop run concurrently, block on the video loop, stop both
//! pipelines, go again. One viewer disconnect therefore tears down and
//! rebuilds both sessions atomically, and no pipeline state leaks across
//! iterations.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use rtc_credentials::RtcCredentials;
use tokio::sync::{Mutex as AsyncMutex, mpsc, watch};
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::display::DisplayControl;
use crate::pipeline::{PipelineEvent, PipelineEvents, PipelineHandle};
use crate::signaling::{ChannelExit, SessionMeta, SessionNotice, SignalingChannel, SignalingError};

/// Delay before reconnecting after the relay could not be reached.
pub const RESTART_BACKOFF: Duration = Duration::from_secs(2);

const MIN_SCALE: f64 = 0.75;
const MAX_SCALE: f64 = 2.5;
const BASE_DPI: f64 = 96.0;
const BASE_CURSOR_SIZE: f64 = 16.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Negotiating,
    Active,
    Restarting,
}

/// Latest decoded descriptor, shared with the transport layer so
/// newly-joining viewers receive current STUN/TURN URIs wholesale.
#[derive(Clone, Default)]
pub struct PublishedDescriptor {
    inner: Arc<RwLock<Option<RtcCredentials>>>,
}

impl PublishedDescriptor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, credentials: RtcCredentials) {
        if let Ok(mut guard) = self.inner.write() {
            *guard = Some(credentials);
        }
    }

    pub fn current(&self) -> Option<RtcCredentials> {
        self.inner.read().ok().and_then(|guard| guard.clone())
    }
}

#[derive(Debug, Clone, Default)]
pub struct SupervisorOptions {
    pub enable_resize: bool,
    /// `None` supervises forever; tests inject small caps for deterministic
    /// termination.
    pub iteration_limit: Option<u64>,
}

pub struct SessionSupervisor {
    video_config: ChannelConfig,
    audio_config: ChannelConfig,
    video: PipelineHandle,
    audio: PipelineHandle,
    video_events: Arc<AsyncMutex<PipelineEvents>>,
    audio_events: Arc<AsyncMutex<PipelineEvents>>,
    credentials: Option<mpsc::UnboundedReceiver<RtcCredentials>>,
    published: PublishedDescriptor,
    display: Arc<dyn DisplayControl>,
    enable_resize: bool,
    iteration_limit: Option<u64>,
    state_tx: watch::Sender<SupervisorState>,
}

impl SessionSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        video_config: ChannelConfig,
        audio_config: ChannelConfig,
        video: (PipelineHandle, PipelineEvents),
        audio: (PipelineHandle, PipelineEvents),
        credentials: mpsc::UnboundedReceiver<RtcCredentials>,
        published: PublishedDescriptor,
        display: Arc<dyn DisplayControl>,
        options: SupervisorOptions,
    ) -> Self {
        let (state_tx, _) = watch::channel(SupervisorState::Idle);
        Self {
            video_config,
            audio_config,
            video: video.0,
            audio: audio.0,
            video_events: Arc::new(AsyncMutex::new(video.1)),
            audio_events: Arc::new(AsyncMutex::new(audio.1)),
            credentials: Some(credentials),
            published,
            display,
            enable_resize: options.enable_resize,
            iteration_limit: options.iteration_limit,
            state_tx,
        }
    }

    /// Observable state for tests and operators.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state_tx.subscribe()
    }

    /// Supervises until the iteration limit (if any) is reached. Signaling
    /// failures restart the cycle after a short backoff; nothing recoverable
    /// escapes this loop.
    pub async fn run(mut self) {
        let credential_pump = self.credentials.take().map(|rx| {
            spawn_credential_pump(
                rx,
                self.video.clone(),
                self.audio.clone(),
                self.published.clone(),
            )
        });

        let mut iterations: u64 = 0;
        loop {
            if let Some(limit) = self.iteration_limit {
                if iterations >= limit {
                    break;
                }
            }
            iterations += 1;
            self.set_state(SupervisorState::Negotiating);
            info!(target: "supervisor", iteration = iterations, "starting negotiation cycle");
            match self.run_cycle().await {
                Ok(exit) => {
                    debug!(target: "supervisor", exit = ?exit, "negotiation cycle ended");
                }
                Err(err) => {
                    warn!(
                        target: "supervisor",
                        error = %err,
                        "could not reach the signaling relay; backing off"
                    );
                    self.set_state(SupervisorState::Restarting);
                    self.video.stop();
                    self.audio.stop();
                    tokio::time::sleep(RESTART_BACKOFF).await;
                }
            }
        }

        if let Some(pump) = credential_pump {
            pump.abort();
        }
        self.set_state(SupervisorState::Idle);
    }

    /// One negotiation cycle: both channels up, audio loop concurrent,
    /// video loop awaited, then the boundary teardown with exactly one
    /// `stop()` per pipeline.
    async fn run_cycle(&mut self) -> Result<ChannelExit, SignalingError> {
        let video_channel = Arc::new(SignalingChannel::connect(self.video_config.clone()).await?);
        let audio_channel = Arc::new(SignalingChannel::connect(self.audio_config.clone()).await?);

        let (session_tx, mut session_rx) = mpsc::unbounded_channel::<SessionNotice>();

        let video_pump = spawn_sdp_pump(Arc::clone(&self.video_events), Arc::clone(&video_channel));
        let audio_pump = spawn_sdp_pump(Arc::clone(&self.audio_events), Arc::clone(&audio_channel));

        let mut audio_run = tokio::spawn({
            let channel = Arc::clone(&audio_channel);
            let pipeline = self.audio.clone();
            let sessions = session_tx.clone();
            async move { channel.run(&pipeline, &sessions).await }
        });
        let mut video_run = tokio::spawn({
            let channel = Arc::clone(&video_channel);
            let pipeline = self.video.clone();
            let sessions = session_tx.clone();
            async move { channel.run(&pipeline, &sessions).await }
        });
        drop(session_tx);

        let mut sessions_closed = false;
        let mut audio_done = false;
        let mut audio_stopped = false;
        let exit = loop {
            tokio::select! {
                notice = session_rx.recv(), if !sessions_closed => {
                    match notice {
                        Some(notice) => self.route_session(notice),
                        None => sessions_closed = true,
                    }
                }
                exit = &mut video_run => break exit,
                exit = &mut audio_run, if !audio_done => {
                    audio_done = true;
                    match exit {
                        Ok(reason) => info!(
                            target: "supervisor",
                            reason = ?reason,
                            "audio signaling loop ended; stopping audio pipeline"
                        ),
                        Err(err) => warn!(
                            target: "supervisor",
                            error = %err,
                            "audio signaling task failed; stopping audio pipeline"
                        ),
                    }
                    self.audio.stop();
                    audio_stopped = true;
                }
            }
        };

        // Iteration boundary. Pipelines first, then the signaling tasks; the
        // channels themselves close when the Arcs drop.
        self.set_state(SupervisorState::Restarting);
        self.video.stop();
        if !audio_stopped {
            self.audio.stop();
        }
        if !audio_done {
            audio_run.abort();
        }
        video_pump.abort();
        audio_pump.abort();

        match exit {
            Ok(reason) => Ok(reason),
            Err(err) => {
                warn!(target: "supervisor", error = %err, "video signaling task failed");
                Ok(ChannelExit::Fault(err.to_string()))
            }
        }
    }

    /// Starts the pipeline owned by the session's peer id; anything else is
    /// a routing error with no side effects.
    fn route_session(&mut self, notice: SessionNotice) {
        let SessionNotice { peer_id, meta } = notice;
        if peer_id == self.video_config.remote_peer_id {
            info!(target: "supervisor", peer = peer_id, meta = ?meta, "video session established");
            if self.enable_resize {
                if let Some(meta) = &meta {
                    self.apply_viewport(meta);
                }
            }
            self.video.start(false);
            self.set_state(SupervisorState::Active);
        } else if peer_id == self.audio_config.remote_peer_id {
            info!(target: "supervisor", peer = peer_id, "audio session established");
            self.audio.start(true);
            self.set_state(SupervisorState::Active);
        } else {
            error!(
                target: "supervisor",
                peer = peer_id,
                "session established for unknown peer id; no pipeline started"
            );
        }
    }

    /// Applies viewer viewport metadata before the pipeline starts, so the
    /// first frame already matches the viewer's window.
    fn apply_viewport(&self, meta: &SessionMeta) {
        if let Some(res) = &meta.res {
            if self.display.resize(res) {
                self.video.send_remote_resolution(res);
            } else {
                warn!(target: "supervisor", res, "display resize failed");
            }
        }
        if let Some(scale) = meta.scale {
            if !(MIN_SCALE..=MAX_SCALE).contains(&scale) {
                error!(target: "supervisor", scale, "requested scale ratio out of bounds");
                return;
            }
            let dpi = (BASE_DPI * scale) as u32;
            info!(target: "supervisor", dpi, "applying viewer DPI");
            if !self.display.set_dpi(dpi) {
                error!(target: "supervisor", dpi, "failed to set DPI");
            }
            let cursor_size = (BASE_CURSOR_SIZE * scale) as u32;
            if !self.display.set_cursor_size(cursor_size) {
                error!(target: "supervisor", cursor_size, "failed to set cursor size");
            }
        }
    }

    fn set_state(&self, state: SupervisorState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(target: "supervisor", from = ?previous, to = ?state, "state transition");
        }
    }
}

/// Forwards locally generated SDP/ICE from one pipeline to its channel for
/// the duration of a cycle.
fn spawn_sdp_pump(
    events: Arc<AsyncMutex<PipelineEvents>>,
    channel: Arc<SignalingChannel>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut events = events.lock().await;
        while let Some(event) = events.recv().await {
            let sent = match event {
                PipelineEvent::Sdp { kind, sdp } => channel.send_sdp(&kind, &sdp),
                PipelineEvent::Ice {
                    sdp_mline_index,
                    candidate,
                } => channel.send_ice(sdp_mline_index, &candidate),
            };
            if sent.is_err() {
                debug!(
                    target: "supervisor",
                    channel = channel.config().kind.label(),
                    "signaling writer gone; pipeline bus pump parked"
                );
                break;
            }
        }
    })
}

/// Applies refreshed credentials for the lifetime of the supervisor: live
/// pipelines get each relay additively, the published document is replaced
/// wholesale, and in-flight negotiations are never touched.
fn spawn_credential_pump(
    mut credentials: mpsc::UnboundedReceiver<RtcCredentials>,
    video: PipelineHandle,
    audio: PipelineHandle,
    published: PublishedDescriptor,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(refreshed) = credentials.recv().await {
            info!(
                target: "supervisor",
                stun = refreshed.stun_uris.len(),
                turn = refreshed.turn_uris.len(),
                "applying refreshed RTC credentials"
            );
            for uri in &refreshed.turn_uris {
                video.add_turn_server(uri);
                audio.add_turn_server(uri);
            }
            published.publish(refreshed);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{audio_channel, signaling_url, video_channel};
    use crate::pipeline::{PipelineCommand, StreamKind, pipeline};
    use std::sync::Mutex;
    use std::time::Instant;
    use tokio::sync::mpsc::UnboundedReceiver;
    use tokio::time::timeout;

    struct RecordingDisplay {
        calls: Mutex<Vec<String>>,
    }

    impl RecordingDisplay {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl DisplayControl for RecordingDisplay {
        fn resize(&self, res: &str) -> bool {
            self.calls.lock().unwrap().push(format!("resize {res}"));
            true
        }

        fn set_dpi(&self, dpi: u32) -> bool {
            self.calls.lock().unwrap().push(format!("dpi {dpi}"));
            true
        }

        fn set_cursor_size(&self, size: u32) -> bool {
            self.calls.lock().unwrap().push(format!("cursor {size}"));
            true
        }
    }

    struct Harness {
        supervisor: SessionSupervisor,
        video_commands: UnboundedReceiver<PipelineCommand>,
        audio_commands: UnboundedReceiver<PipelineCommand>,
        display: Arc<RecordingDisplay>,
        credentials: mpsc::UnboundedSender<RtcCredentials>,
        published: PublishedDescriptor,
    }

    fn harness(enable_resize: bool, iteration_limit: Option<u64>) -> Harness {
        let url = signaling_url("127.0.0.1", 1, false).unwrap();
        let (video, video_events, video_bus) = pipeline(StreamKind::Video);
        let (audio, audio_events, audio_bus) = pipeline(StreamKind::Audio);
        let display = RecordingDisplay::new();
        let published = PublishedDescriptor::new();
        let (cred_tx, cred_rx) = mpsc::unbounded_channel();
        let supervisor = SessionSupervisor::new(
            video_channel(&url, None),
            audio_channel(&url, None),
            (video, video_events),
            (audio, audio_events),
            cred_rx,
            published.clone(),
            display.clone(),
            SupervisorOptions {
                enable_resize,
                iteration_limit,
            },
        );
        Harness {
            supervisor,
            video_commands: video_bus.commands,
            audio_commands: audio_bus.commands,
            display,
            credentials: cred_tx,
            published,
        }
    }

    #[tokio::test]
    async fn video_session_applies_viewport_before_start() {
        let mut h = harness(true, None);
        h.supervisor.route_session(SessionNotice {
            peer_id: h.supervisor.video_config.remote_peer_id,
            meta: Some(SessionMeta {
                res: Some("1920x1080".into()),
                scale: Some(1.25),
            }),
        });

        assert_eq!(
            h.video_commands.recv().await,
            Some(PipelineCommand::SendRemoteResolution {
                res: "1920x1080".into()
            })
        );
        assert_eq!(
            h.video_commands.recv().await,
            Some(PipelineCommand::Start { audio_only: false })
        );
        assert_eq!(
            h.display.calls(),
            vec!["resize 1920x1080", "dpi 120", "cursor 20"]
        );
    }

    #[tokio::test]
    async fn audio_session_starts_audio_only() {
        let mut h = harness(false, None);
        h.supervisor.route_session(SessionNotice {
            peer_id: h.supervisor.audio_config.remote_peer_id,
            meta: None,
        });
        assert_eq!(
            h.audio_commands.recv().await,
            Some(PipelineCommand::Start { audio_only: true })
        );
    }

    #[tokio::test]
    async fn unknown_peer_starts_nothing() {
        let mut h = harness(true, None);
        h.supervisor.route_session(SessionNotice {
            peer_id: 99,
            meta: Some(SessionMeta {
                res: Some("640x480".into()),
                scale: Some(1.0),
            }),
        });
        assert!(h.video_commands.try_recv().is_err());
        assert!(h.audio_commands.try_recv().is_err());
        assert!(h.display.calls().is_empty());
    }

    #[tokio::test]
    async fn out_of_bounds_scale_changes_nothing() {
        let mut h = harness(true, None);
        h.supervisor.route_session(SessionNotice {
            peer_id: h.supervisor.video_config.remote_peer_id,
            meta: Some(SessionMeta {
                res: None,
                scale: Some(3.0),
            }),
        });
        assert_eq!(
            h.video_commands.recv().await,
            Some(PipelineCommand::Start { audio_only: false })
        );
        assert!(h.display.calls().is_empty());
    }

    #[tokio::test]
    async fn resize_disabled_ignores_viewport_meta() {
        let mut h = harness(false, None);
        h.supervisor.route_session(SessionNotice {
            peer_id: h.supervisor.video_config.remote_peer_id,
            meta: Some(SessionMeta {
                res: Some("1920x1080".into()),
                scale: Some(1.5),
            }),
        });
        assert_eq!(
            h.video_commands.recv().await,
            Some(PipelineCommand::Start { audio_only: false })
        );
        assert!(h.display.calls().is_empty());
    }

    #[tokio::test]
    async fn credential_pump_feeds_both_pipelines_and_publishes() {
        let mut h = harness(false, None);
        let refreshed = rtc_credentials::decode(
            r#"{"iceServers": [{"urls": ["turn:relay:3478?transport=udp"], "username": "u", "credential": "c"}]}"#,
        )
        .unwrap();

        let rx = h.supervisor.credentials.take().unwrap();
        let pump = spawn_credential_pump(
            rx,
            h.supervisor.video.clone(),
            h.supervisor.audio.clone(),
            h.published.clone(),
        );
        h.credentials.send(refreshed.clone()).unwrap();

        let expected = PipelineCommand::AddTurnServer(refreshed.turn_uris[0].clone());
        assert_eq!(h.video_commands.recv().await, Some(expected.clone()));
        assert_eq!(h.audio_commands.recv().await, Some(expected));
        // The published document is replaced wholesale.
        timeout(Duration::from_secs(1), async {
            while h.published.current() != Some(refreshed.clone()) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("published descriptor updates");
        pump.abort();
    }

    #[tokio::test]
    async fn run_honors_iteration_limit_and_returns_to_idle() {
        // The relay endpoint is unreachable, so each iteration takes the
        // connect-failure path and backs off once.
        let h = harness(false, Some(1));
        let mut state = h.supervisor.state();
        let started = Instant::now();
        timeout(Duration::from_secs(10), h.supervisor.run())
            .await
            .expect("bounded supervisor run finishes");
        assert!(started.elapsed() >= RESTART_BACKOFF);
        assert_eq!(*state.borrow_and_update(), SupervisorState::Idle);
    }

    #[tokio::test]
    async fn failed_cycle_still_stops_both_pipelines_exactly_once() {
        let mut h = harness(false, Some(1));
        timeout(Duration::from_secs(10), h.supervisor.run())
            .await
            .expect("bounded supervisor run finishes");

        let mut video_stops = 0;
        while let Ok(command) = h.video_commands.try_recv() {
            if command == PipelineCommand::Stop {
                video_stops += 1;
            }
        }
        let mut audio_stops = 0;
        while let Ok(command) = h.audio_commands.try_recv() {
            if command == PipelineCommand::Stop {
                audio_stops += 1;
            }
        }
        assert_eq!(video_stops, 1);
        assert_eq!(audio_stops, 1);
    }
}
