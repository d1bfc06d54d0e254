//! Client for the signaling relay.
//!
//! One [`SignalingChannel`] owns one websocket to the relay and one logical
//! `(local_id, remote_peer_id)` session. The relay speaks a small text
//! dialect: `HELLO <id>` to register (acknowledged with a bare `HELLO`),
//! `SESSION <peer>` to request session setup (`SESSION_OK`, optionally
//! followed by viewer metadata JSON), `ERROR ...` replies, and raw JSON
//! envelopes for SDP and ICE exchange. The channel translates all of it
//! into [`SignalingEvent`]s; the only error it absorbs itself is the
//! relay's transient "peer not connected" reply, retried on a fixed
//! backoff.

use std::sync::Mutex;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use crate::config::ChannelConfig;
use crate::pipeline::PipelineHandle;

/// Backoff between session setup attempts while the peer is absent.
pub const PEER_RETRY_DELAY: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum SignalingError {
    /// The relay reported that the requested peer has not joined yet.
    /// Expected while the viewer is still loading; retried, never fatal.
    #[error("peer {0} is not connected to the signaling relay")]
    PeerAbsent(u32),

    #[error("signaling transport failure: {0}")]
    Transport(String),

    #[error("unexpected signaling reply: {0}")]
    Protocol(String),

    #[error("signaling connection closed")]
    Closed,
}

/// Viewer metadata carried on session establishment.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    #[serde(default)]
    pub res: Option<String>,
    #[serde(default)]
    pub scale: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    /// The relay acknowledged our registration.
    Registered,
    /// Session with the configured peer is established.
    Session { meta: Option<SessionMeta> },
    Sdp { kind: String, sdp: String },
    Ice {
        sdp_mline_index: u32,
        candidate: String,
    },
    /// Transient: the peer has not joined the relay yet.
    PeerAbsent,
    /// Fatal for this attempt.
    Fault(String),
    Disconnected,
}

/// Session establishment notice routed up to the session supervisor.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionNotice {
    pub peer_id: u32,
    pub meta: Option<SessionMeta>,
}

/// Why a channel's message loop ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelExit {
    Disconnected,
    Fault(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SdpEnvelope {
    sdp: SdpPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SdpPayload {
    #[serde(rename = "type")]
    kind: String,
    sdp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IceEnvelope {
    ice: IcePayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IcePayload {
    candidate: String,
    #[serde(rename = "sdpMLineIndex")]
    sdp_mline_index: u32,
}

#[derive(Debug)]
pub struct SignalingChannel {
    config: ChannelConfig,
    send_tx: mpsc::UnboundedSender<Message>,
    events: AsyncMutex<mpsc::UnboundedReceiver<SignalingEvent>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl SignalingChannel {
    /// Connects the websocket, registers `local_id` with the relay and
    /// starts the reader/writer tasks.
    pub async fn connect(config: ChannelConfig) -> Result<Self, SignalingError> {
        let mut request = config
            .url
            .as_str()
            .into_client_request()
            .map_err(|err| SignalingError::Transport(format!("invalid relay url: {err}")))?;
        if let Some((user, password)) = &config.basic_auth {
            let token = BASE64_STANDARD.encode(format!("{user}:{password}"));
            let value = HeaderValue::from_str(&format!("Basic {token}"))
                .map_err(|_| SignalingError::Transport("invalid basic auth credentials".into()))?;
            request.headers_mut().insert("authorization", value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| SignalingError::Transport(format!("websocket connect failed: {err}")))?;
        debug!(
            target: "signaling",
            channel = config.kind.label(),
            url = %config.url,
            "signaling websocket connected"
        );
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (send_tx, mut send_rx) = mpsc::unbounded_channel::<Message>();
        let (event_tx, event_rx) = mpsc::unbounded_channel::<SignalingEvent>();

        let writer = tokio::spawn(async move {
            while let Some(message) = send_rx.recv().await {
                if ws_write.send(message).await.is_err() {
                    break;
                }
            }
        });

        let channel_label = config.kind.label();
        let reader = tokio::spawn(async move {
            while let Some(message) = ws_read.next().await {
                match message {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_relay_message(channel_label, &text) {
                            if event_tx.send(event).is_err() {
                                break;
                            }
                        }
                    }
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            target: "signaling",
                            channel = channel_label,
                            "signaling websocket error: {err}"
                        );
                        let _ = event_tx.send(SignalingEvent::Fault(err.to_string()));
                        return;
                    }
                }
            }
            let _ = event_tx.send(SignalingEvent::Disconnected);
        });

        let channel = Self {
            config,
            send_tx,
            events: AsyncMutex::new(event_rx),
            tasks: Mutex::new(vec![writer, reader]),
        };
        channel.send_raw(format!("HELLO {}", channel.config.local_id))?;
        Ok(channel)
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Asks the relay to set up a session with the configured peer.
    pub fn setup_call(&self) -> Result<(), SignalingError> {
        info!(
            target: "signaling",
            channel = self.config.kind.label(),
            peer = self.config.remote_peer_id,
            "requesting session setup"
        );
        self.send_raw(format!("SESSION {}", self.config.remote_peer_id))
    }

    pub fn send_sdp(&self, kind: &str, sdp: &str) -> Result<(), SignalingError> {
        let envelope = SdpEnvelope {
            sdp: SdpPayload {
                kind: kind.to_string(),
                sdp: sdp.to_string(),
            },
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|err| SignalingError::Protocol(format!("serialize sdp failed: {err}")))?;
        self.send_raw(text)
    }

    pub fn send_ice(&self, sdp_mline_index: u32, candidate: &str) -> Result<(), SignalingError> {
        let envelope = IceEnvelope {
            ice: IcePayload {
                candidate: candidate.to_string(),
                sdp_mline_index,
            },
        };
        let text = serde_json::to_string(&envelope)
            .map_err(|err| SignalingError::Protocol(format!("serialize ice failed: {err}")))?;
        self.send_raw(text)
    }

    fn send_raw(&self, text: String) -> Result<(), SignalingError> {
        self.send_tx
            .send(Message::Text(text))
            .map_err(|_| SignalingError::Closed)
    }

    /// The channel's message loop: registration kicks off session setup, a
    /// missing peer is retried every [`PEER_RETRY_DELAY`], inbound SDP/ICE
    /// goes straight to the bound pipeline, session establishment is routed
    /// up for the supervisor to act on, and anything fatal ends the loop
    /// with its reason.
    pub async fn run(
        &self,
        pipeline: &PipelineHandle,
        sessions: &mpsc::UnboundedSender<SessionNotice>,
    ) -> ChannelExit {
        let mut events = self.events.lock().await;
        loop {
            let Some(event) = events.recv().await else {
                return ChannelExit::Disconnected;
            };
            match event {
                SignalingEvent::Registered => {
                    if self.setup_call().is_err() {
                        return ChannelExit::Disconnected;
                    }
                }
                SignalingEvent::PeerAbsent => {
                    let condition = SignalingError::PeerAbsent(self.config.remote_peer_id);
                    debug!(
                        target: "signaling",
                        channel = self.config.kind.label(),
                        "{condition}; retrying session setup in {}s",
                        PEER_RETRY_DELAY.as_secs()
                    );
                    tokio::time::sleep(PEER_RETRY_DELAY).await;
                    if self.setup_call().is_err() {
                        return ChannelExit::Disconnected;
                    }
                }
                SignalingEvent::Session { meta } => {
                    let notice = SessionNotice {
                        peer_id: self.config.remote_peer_id,
                        meta,
                    };
                    if sessions.send(notice).is_err() {
                        return ChannelExit::Disconnected;
                    }
                }
                SignalingEvent::Sdp { kind, sdp } => pipeline.set_sdp(&kind, &sdp),
                SignalingEvent::Ice {
                    sdp_mline_index,
                    candidate,
                } => pipeline.set_ice(sdp_mline_index, &candidate),
                SignalingEvent::Fault(reason) => {
                    error!(
                        target: "signaling",
                        channel = self.config.kind.label(),
                        "signaling error: {reason}"
                    );
                    return ChannelExit::Fault(reason);
                }
                SignalingEvent::Disconnected => {
                    info!(
                        target: "signaling",
                        channel = self.config.kind.label(),
                        "signaling relay disconnected"
                    );
                    return ChannelExit::Disconnected;
                }
            }
        }
    }
}

impl Drop for SignalingChannel {
    fn drop(&mut self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}

fn parse_relay_message(channel: &'static str, text: &str) -> Option<SignalingEvent> {
    if text == "HELLO" {
        return Some(SignalingEvent::Registered);
    }
    if let Some(rest) = text.strip_prefix("SESSION_OK") {
        let rest = rest.trim();
        let meta = if rest.is_empty() {
            None
        } else {
            match serde_json::from_str::<SessionMeta>(rest) {
                Ok(meta) => Some(meta),
                Err(err) => {
                    warn!(
                        target: "signaling",
                        channel,
                        "ignoring unparseable session metadata: {err}"
                    );
                    None
                }
            }
        };
        return Some(SignalingEvent::Session { meta });
    }
    if let Some(rest) = text.strip_prefix("ERROR") {
        let detail = rest.trim();
        if detail.starts_with("peer") {
            return Some(SignalingEvent::PeerAbsent);
        }
        return Some(SignalingEvent::Fault(detail.to_string()));
    }
    if text.starts_with('{') {
        if let Ok(SdpEnvelope { sdp }) = serde_json::from_str::<SdpEnvelope>(text) {
            return Some(SignalingEvent::Sdp {
                kind: sdp.kind,
                sdp: sdp.sdp,
            });
        }
        if let Ok(IceEnvelope { ice }) = serde_json::from_str::<IceEnvelope>(text) {
            return Some(SignalingEvent::Ice {
                sdp_mline_index: ice.sdp_mline_index,
                candidate: ice.candidate,
            });
        }
        warn!(target: "signaling", channel, "ignoring unrecognized JSON message");
        return None;
    }
    warn!(target: "signaling", channel, message = text, "ignoring unrecognized relay message");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hello_means_registered() {
        assert_eq!(
            parse_relay_message("video", "HELLO"),
            Some(SignalingEvent::Registered)
        );
    }

    #[test]
    fn session_ok_without_meta() {
        assert_eq!(
            parse_relay_message("video", "SESSION_OK"),
            Some(SignalingEvent::Session { meta: None })
        );
    }

    #[test]
    fn session_ok_with_viewport_meta() {
        let event = parse_relay_message(
            "video",
            r#"SESSION_OK {"res": "1920x1080", "scale": 1.25}"#,
        );
        assert_eq!(
            event,
            Some(SignalingEvent::Session {
                meta: Some(SessionMeta {
                    res: Some("1920x1080".into()),
                    scale: Some(1.25),
                })
            })
        );
    }

    #[test]
    fn peer_errors_are_transient() {
        assert_eq!(
            parse_relay_message("video", "ERROR peer '1' not found"),
            Some(SignalingEvent::PeerAbsent)
        );
    }

    #[test]
    fn other_errors_are_faults() {
        assert_eq!(
            parse_relay_message("video", "ERROR invalid message"),
            Some(SignalingEvent::Fault("invalid message".into()))
        );
    }

    #[test]
    fn sdp_and_ice_envelopes_parse() {
        assert_eq!(
            parse_relay_message("video", r#"{"sdp": {"type": "answer", "sdp": "v=0"}}"#),
            Some(SignalingEvent::Sdp {
                kind: "answer".into(),
                sdp: "v=0".into()
            })
        );
        assert_eq!(
            parse_relay_message(
                "video",
                r#"{"ice": {"candidate": "candidate:1", "sdpMLineIndex": 0}}"#
            ),
            Some(SignalingEvent::Ice {
                sdp_mline_index: 0,
                candidate: "candidate:1".into()
            })
        );
    }

    #[test]
    fn garbage_is_dropped() {
        assert_eq!(parse_relay_message("video", "WAT"), None);
        assert_eq!(parse_relay_message("video", "{\"neither\": true}"), None);
    }
}
