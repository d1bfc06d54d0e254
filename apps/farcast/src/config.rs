//! Channel wiring for the two signaling sessions a gateway owns.

use url::Url;

use crate::pipeline::StreamKind;

/// Fixed peer identities: the host registers as 0/2, the viewer's video and
/// audio endpoints join as 1/3.
pub const VIDEO_LOCAL_ID: u32 = 0;
pub const VIDEO_PEER_ID: u32 = 1;
pub const AUDIO_LOCAL_ID: u32 = 2;
pub const AUDIO_PEER_ID: u32 = 3;

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub kind: StreamKind,
    pub url: Url,
    pub local_id: u32,
    pub remote_peer_id: u32,
    pub basic_auth: Option<(String, String)>,
}

/// Derives the relay websocket endpoint from the configured host address.
pub fn signaling_url(host: &str, port: u16, https: bool) -> Result<Url, url::ParseError> {
    let scheme = if https { "wss" } else { "ws" };
    Url::parse(&format!("{scheme}://{host}:{port}/ws"))
}

pub fn video_channel(url: &Url, basic_auth: Option<(String, String)>) -> ChannelConfig {
    ChannelConfig {
        kind: StreamKind::Video,
        url: url.clone(),
        local_id: VIDEO_LOCAL_ID,
        remote_peer_id: VIDEO_PEER_ID,
        basic_auth,
    }
}

pub fn audio_channel(url: &Url, basic_auth: Option<(String, String)>) -> ChannelConfig {
    ChannelConfig {
        kind: StreamKind::Audio,
        url: url.clone(),
        local_id: AUDIO_LOCAL_ID,
        remote_peer_id: AUDIO_PEER_ID,
        basic_auth,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signaling_url_picks_scheme_from_https_flag() {
        assert_eq!(
            signaling_url("127.0.0.1", 8080, false).unwrap().as_str(),
            "ws://127.0.0.1:8080/ws"
        );
        assert_eq!(
            signaling_url("gateway.example.com", 443, true).unwrap().as_str(),
            "wss://gateway.example.com:443/ws"
        );
    }

    #[test]
    fn channel_pairs_use_the_fixed_ids() {
        let url = signaling_url("127.0.0.1", 8080, false).unwrap();
        let video = video_channel(&url, None);
        let audio = audio_channel(&url, None);
        assert_eq!((video.local_id, video.remote_peer_id), (0, 1));
        assert_eq!((audio.local_id, audio.remote_peer_id), (2, 3));
        assert_eq!(video.kind, StreamKind::Video);
        assert_eq!(audio.kind, StreamKind::Audio);
    }
}
