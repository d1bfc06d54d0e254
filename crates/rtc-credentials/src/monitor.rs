//! Credential source adapters and the monitor supervisor that owns them.
//!
//! The pollers use blocking sleep-based scheduling and the file adapter a
//! blocking watch primitive, so all of them live on dedicated worker
//! threads. Results cross back into the negotiation loop over an injected
//! channel sender; nothing here ever runs handler code on the loop's
//! context directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use notify::event::{AccessKind, AccessMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::descriptor::{self, RtcCredentials};
use crate::error::CredentialError;
use crate::rest::RestCredentialClient;
use crate::source::{CredentialSettings, CredentialSource, TurnEndpoint};

/// Fine-grained scheduling tick for the pollers.
const POLL_TICK: Duration = Duration::from_millis(500);

/// Regenerates an ephemeral-credential descriptor from the shared secret on
/// a wall-clock-aligned period.
pub struct HmacPoller {
    pub endpoint: TurnEndpoint,
    pub shared_secret: String,
    pub username: String,
    pub period: Duration,
    pub enabled: bool,
}

impl HmacPoller {
    pub fn spawn(self, events: mpsc::UnboundedSender<RtcCredentials>) -> PollerHandle {
        let HmacPoller {
            endpoint,
            shared_secret,
            username,
            period,
            enabled,
        } = self;
        spawn_poller("hmac", enabled, period, events, move || {
            let stamped = descriptor::ephemeral_username(&username, descriptor::EPHEMERAL_TTL);
            let raw = descriptor::encode_hmac(
                &endpoint.host,
                endpoint.port,
                &shared_secret,
                &stamped,
                endpoint.protocol,
                endpoint.tls,
            )?;
            descriptor::decode(&raw)
        })
    }
}

/// Re-fetches the descriptor from the credential web service on a
/// wall-clock-aligned period.
pub struct RestPoller {
    pub uri: String,
    pub username: String,
    pub auth_header_name: String,
    pub period: Duration,
    pub enabled: bool,
}

impl RestPoller {
    pub fn spawn(
        self,
        events: mpsc::UnboundedSender<RtcCredentials>,
    ) -> Result<PollerHandle, CredentialError> {
        let RestPoller {
            uri,
            username,
            auth_header_name,
            period,
            enabled,
        } = self;
        let client = RestCredentialClient::new(uri, username, auth_header_name)?;
        Ok(spawn_poller("rest", enabled, period, events, move || {
            client.fetch()
        }))
    }
}

/// Re-reads one descriptor file whenever it is closed after a write.
/// Read or parse failures are logged; there is no retry until the file is
/// written again.
pub struct FileWatchAdapter {
    pub path: PathBuf,
    pub enabled: bool,
}

impl FileWatchAdapter {
    pub fn spawn(
        self,
        events: mpsc::UnboundedSender<RtcCredentials>,
    ) -> Result<Option<WatchHandle>, CredentialError> {
        if !self.enabled {
            return Ok(None);
        }
        let path = self.path.clone();
        let mut watcher = notify::recommended_watcher(
            move |event: Result<notify::Event, notify::Error>| match event {
                Ok(event)
                    if matches!(
                        event.kind,
                        EventKind::Access(AccessKind::Close(AccessMode::Write))
                    ) =>
                {
                    tracing::info!(
                        target: "credentials",
                        path = %path.display(),
                        "descriptor file rewritten"
                    );
                    match reload(&path) {
                        Ok(creds) => {
                            let _ = events.send(creds);
                        }
                        Err(err) => tracing::warn!(
                            target: "credentials",
                            path = %path.display(),
                            error = %err,
                            "could not reload descriptor file"
                        ),
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    tracing::warn!(target: "credentials", error = %err, "descriptor file watcher error")
                }
            },
        )?;
        watcher.watch(&self.path, RecursiveMode::NonRecursive)?;
        Ok(Some(WatchHandle { _watcher: watcher }))
    }
}

fn reload(path: &Path) -> Result<RtcCredentials, CredentialError> {
    let raw = std::fs::read_to_string(path)?;
    descriptor::decode(&raw)
}

fn spawn_poller<F>(
    name: &'static str,
    enabled: bool,
    period: Duration,
    events: mpsc::UnboundedSender<RtcCredentials>,
    refresh: F,
) -> PollerHandle
where
    F: Fn() -> Result<RtcCredentials, CredentialError> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let period_secs = period.as_secs().max(1);
    let thread = thread::spawn(move || {
        // The 500ms tick crosses each wall-clock second twice; remember the
        // last fired second so a matching second refreshes exactly once.
        let mut last_fired = 0u64;
        while !flag.load(Ordering::Relaxed) {
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or(Duration::ZERO)
                .as_secs();
            if enabled && now % period_secs == 0 && now != last_fired {
                last_fired = now;
                match refresh() {
                    Ok(creds) => {
                        if events.send(creds).is_err() {
                            break;
                        }
                    }
                    Err(err) => tracing::warn!(
                        target: "credentials",
                        monitor = name,
                        error = %err,
                        "credential refresh failed; schedule unchanged"
                    ),
                }
            }
            thread::sleep(POLL_TICK);
        }
        tracing::info!(target: "credentials", monitor = name, "credential monitor stopped");
    });
    PollerHandle {
        stop,
        thread: Some(thread),
    }
}

/// Running poller worker. Stopping is observed at the next tick, so it can
/// lag by up to one tick interval.
pub struct PollerHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl PollerHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                tracing::warn!(target: "credentials", "credential monitor thread panicked");
            }
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Running file watcher; dropping it stops the watch.
pub struct WatchHandle {
    _watcher: RecommendedWatcher,
}

/// Owns all three adapters. Every adapter is constructed whichever source
/// was selected; only the one matching the resolved source does real work,
/// which keeps the selection in [`CredentialSource::resolve`] instead of
/// scattered conditionals.
pub struct CredentialMonitor {
    settings: CredentialSettings,
    source: CredentialSource,
    period: Duration,
    events: mpsc::UnboundedSender<RtcCredentials>,
    pollers: Vec<PollerHandle>,
    watcher: Option<WatchHandle>,
}

impl CredentialMonitor {
    pub fn new(
        settings: CredentialSettings,
        source: CredentialSource,
        period: Duration,
        events: mpsc::UnboundedSender<RtcCredentials>,
    ) -> Self {
        Self {
            settings,
            source,
            period,
            events,
            pollers: Vec::new(),
            watcher: None,
        }
    }

    pub fn start(&mut self) -> Result<(), CredentialError> {
        let endpoint = self.settings.turn_endpoint().unwrap_or_default();
        let hmac = HmacPoller {
            endpoint: endpoint.clone(),
            shared_secret: self.settings.turn_shared_secret.clone(),
            username: self.settings.web_username.clone(),
            period: self.period,
            enabled: matches!(self.source, CredentialSource::Hmac { .. }),
        };
        self.pollers.push(hmac.spawn(self.events.clone()));

        let rest = RestPoller {
            uri: self.settings.web_uri.clone(),
            username: self.settings.web_username.clone(),
            auth_header_name: self.settings.auth_header_name.clone(),
            period: self.period,
            enabled: matches!(self.source, CredentialSource::Rest { .. }),
        };
        self.pollers.push(rest.spawn(self.events.clone())?);

        let watch = FileWatchAdapter {
            path: self.settings.descriptor_path.clone(),
            enabled: matches!(self.source, CredentialSource::StaticFile { .. }),
        };
        self.watcher = watch.spawn(self.events.clone())?;
        Ok(())
    }

    /// Ordered teardown: pollers first (each observed at its next tick),
    /// then the watcher.
    pub fn stop(&mut self) {
        for poller in &mut self.pollers {
            poller.stop();
        }
        self.pollers.clear();
        self.watcher = None;
    }
}

impl Drop for CredentialMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::TurnProtocol;
    use std::fs;
    use std::io::Write;
    use tokio::time::timeout;

    fn relay_endpoint() -> TurnEndpoint {
        TurnEndpoint {
            host: "relay".into(),
            port: 3478,
            protocol: TurnProtocol::Udp,
            tls: false,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn enabled_hmac_poller_fires_on_the_period() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = HmacPoller {
            endpoint: relay_endpoint(),
            shared_secret: "secret".into(),
            username: "gateway-1".into(),
            period: Duration::from_secs(1),
            enabled: true,
        }
        .spawn(tx);

        let creds = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("poller should fire within one period")
            .expect("channel open");
        assert_eq!(creds.turn_uris.len(), 1);
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_poller_never_fires() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = HmacPoller {
            endpoint: relay_endpoint(),
            shared_secret: "secret".into(),
            username: "gateway-1".into(),
            period: Duration::from_secs(1),
            enabled: false,
        }
        .spawn(tx);

        let fired = timeout(Duration::from_millis(1600), rx.recv()).await;
        assert!(fired.is_err(), "disabled adapter invoked its callback");
        handle.stop();
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn stopped_poller_stays_quiet() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut handle = HmacPoller {
            endpoint: relay_endpoint(),
            shared_secret: "secret".into(),
            username: "gateway-1".into(),
            period: Duration::from_secs(1),
            enabled: true,
        }
        .spawn(tx);
        handle.stop();
        while rx.try_recv().is_ok() {}
        let fired = timeout(Duration::from_millis(1200), rx.recv()).await;
        assert!(matches!(fired, Err(_) | Ok(None)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_watcher_fires_on_close_after_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtc.json");
        fs::write(&path, "{}").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watch = FileWatchAdapter {
            path: path.clone(),
            enabled: true,
        }
        .spawn(tx)
        .unwrap()
        .expect("enabled watcher starts");

        {
            let mut file = fs::File::create(&path).unwrap();
            file.write_all(
                br#"{"iceServers": [{"urls": ["stun:example.com:3478"]}]}"#,
            )
            .unwrap();
        }

        let creds = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher should observe the rewrite")
            .expect("channel open");
        assert_eq!(creds.stun_uris[0].to_string(), "stun://example.com:3478");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn file_watcher_swallows_parse_failures_until_next_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtc.json");
        fs::write(&path, "{}").unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _watch = FileWatchAdapter {
            path: path.clone(),
            enabled: true,
        }
        .spawn(tx)
        .unwrap()
        .expect("enabled watcher starts");

        fs::write(&path, "not json").unwrap();
        let fired = timeout(Duration::from_millis(800), rx.recv()).await;
        assert!(fired.is_err(), "malformed rewrite must not deliver credentials");

        fs::write(
            &path,
            r#"{"iceServers": [{"urls": ["stun:example.com:3478"]}]}"#,
        )
        .unwrap();
        let creds = timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("valid rewrite delivers again")
            .expect("channel open");
        assert_eq!(creds.stun_uris.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn disabled_watcher_is_not_started() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rtc.json");
        fs::write(&path, "{}").unwrap();

        let (tx, _rx) = mpsc::unbounded_channel();
        let watch = FileWatchAdapter {
            path,
            enabled: false,
        }
        .spawn(tx)
        .unwrap();
        assert!(watch.is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn monitor_spawns_only_the_selected_adapter_as_active() {
        let settings = CredentialSettings {
            descriptor_path: PathBuf::from("/nonexistent/rtc.json"),
            turn_host: "relay".into(),
            turn_port: Some(3478),
            turn_shared_secret: "secret".into(),
            web_uri: "http://127.0.0.1:1".into(),
            web_username: "gateway-1".into(),
            auth_header_name: "x-auth-user".into(),
            ..CredentialSettings::default()
        };
        let source = CredentialSource::resolve(&settings).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut monitor =
            CredentialMonitor::new(settings, source, Duration::from_secs(1), tx);
        monitor.start().unwrap();

        // HMAC was selected, so credentials arrive and they are generated,
        // not fetched (the web uri points nowhere routable).
        let creds = timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("active adapter fires")
            .expect("channel open");
        assert_eq!(creds.turn_uris.len(), 1);
        monitor.stop();
    }
}
