use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use farcast::config::{audio_channel, signaling_url, video_channel};
use farcast::display::NoopDisplay;
use farcast::pipeline::{self, StreamKind};
use farcast::supervisor::{PublishedDescriptor, SessionSupervisor, SupervisorOptions};
use farcast::telemetry;
use rtc_credentials::{
    CredentialMonitor, CredentialSettings, CredentialSource, DEFAULT_DESCRIPTOR, TurnProtocol,
};

#[derive(Parser, Debug)]
#[command(
    name = "farcast",
    about = "Remote-media streaming gateway: signaling negotiation and NAT-traversal credential supervision"
)]
struct Cli {
    /// Signaling relay host.
    #[arg(long, env = "FARCAST_SIGNALING_HOST", default_value = "127.0.0.1")]
    signaling_host: String,

    #[arg(long, env = "FARCAST_SIGNALING_PORT", default_value_t = 8080)]
    signaling_port: u16,

    /// Connect to the relay over TLS (wss).
    #[arg(long, env = "FARCAST_ENABLE_HTTPS", default_value_t = false, action = clap::ArgAction::Set)]
    enable_https: bool,

    #[arg(long, env = "FARCAST_ENABLE_BASIC_AUTH", default_value_t = false, action = clap::ArgAction::Set)]
    enable_basic_auth: bool,

    #[arg(long, env = "FARCAST_BASIC_AUTH_USER", default_value = "")]
    basic_auth_user: String,

    #[arg(long, env = "FARCAST_BASIC_AUTH_PASSWORD", default_value = "")]
    basic_auth_password: String,

    /// Descriptor JSON used instead of any credential service when present;
    /// watched for rewrites.
    #[arg(long, env = "FARCAST_RTC_CONFIG_JSON", default_value = "/tmp/rtc.json")]
    rtc_config_json: PathBuf,

    /// TURN host for generated descriptors (shared-secret or legacy
    /// credentials).
    #[arg(long, env = "FARCAST_TURN_HOST", default_value = "")]
    turn_host: String,

    #[arg(long, env = "FARCAST_TURN_PORT")]
    turn_port: Option<u16>,

    /// Relay transport for clients: "udp" or "tcp".
    #[arg(long, env = "FARCAST_TURN_PROTOCOL", default_value = "udp")]
    turn_protocol: String,

    #[arg(long, env = "FARCAST_TURN_TLS", default_value_t = false, action = clap::ArgAction::Set)]
    turn_tls: bool,

    /// Shared secret for locally generated ephemeral TURN credentials.
    #[arg(long, env = "FARCAST_TURN_SHARED_SECRET", default_value = "")]
    turn_shared_secret: String,

    /// Legacy static TURN credentials.
    #[arg(long, env = "FARCAST_TURN_USERNAME", default_value = "")]
    turn_username: String,

    #[arg(long, env = "FARCAST_TURN_PASSWORD", default_value = "")]
    turn_password: String,

    /// Credential web service base URI, e.g. http://localhost:8081.
    #[arg(long, env = "FARCAST_CREDENTIAL_WEB_URI", default_value = "")]
    credential_web_uri: String,

    /// Username presented to the credential web service and baked into
    /// ephemeral usernames; defaults to farcast-<hostname>.
    #[arg(long, env = "FARCAST_CREDENTIAL_WEB_USERNAME")]
    credential_web_username: Option<String>,

    /// Header the credential web service reads the username from.
    #[arg(long, env = "FARCAST_AUTH_HEADER_NAME", default_value = "x-auth-user")]
    auth_header_name: String,

    /// Seconds between credential refreshes.
    #[arg(long, env = "FARCAST_CREDENTIAL_PERIOD", default_value_t = 60)]
    credential_period: u64,

    /// Resize the host display to the viewer's viewport on session start.
    #[arg(long, env = "FARCAST_ENABLE_RESIZE", default_value_t = false, action = clap::ArgAction::Set)]
    enable_resize: bool,

    #[arg(long, env = "FARCAST_FRAMERATE", default_value_t = 30)]
    framerate: u32,

    #[arg(long, env = "FARCAST_VIDEO_BITRATE", default_value_t = 2000)]
    video_bitrate: u32,

    #[arg(long, env = "FARCAST_AUDIO_BITRATE", default_value_t = 64000)]
    audio_bitrate: u32,

    /// Sidecar file indicating the streamed app is ready.
    #[arg(
        long,
        env = "FARCAST_APP_READY_FILE",
        default_value = "/var/run/appconfig/appready"
    )]
    app_ready_file: PathBuf,

    /// Skip waiting for the app-ready file.
    #[arg(long, env = "FARCAST_APP_AUTO_INIT", default_value_t = true, action = clap::ArgAction::Set)]
    app_auto_init: bool,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("❌ {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    wait_for_app_ready(&cli.app_ready_file, cli.app_auto_init).await;

    let web_username = cli.credential_web_username.clone().unwrap_or_else(|| {
        format!(
            "farcast-{}",
            std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".into())
        )
    });
    let settings = CredentialSettings {
        descriptor_path: cli.rtc_config_json.clone(),
        turn_host: cli.turn_host.clone(),
        turn_port: cli.turn_port,
        turn_protocol: TurnProtocol::from_name(&cli.turn_protocol),
        turn_tls: cli.turn_tls,
        turn_shared_secret: cli.turn_shared_secret.clone(),
        turn_username: cli.turn_username.clone(),
        turn_password: cli.turn_password.clone(),
        web_uri: cli.credential_web_uri.clone(),
        web_username,
        auth_header_name: cli.auth_header_name.clone(),
    };
    let source = CredentialSource::resolve(&settings)?;

    // The REST source blocks; resolve the startup descriptor off the loop
    // and fall back to the STUN-only default if the service is unreachable.
    let initial = {
        let source = source.clone();
        tokio::task::spawn_blocking(move || source.initial_credentials())
            .await
            .context("credential startup task failed")?
    };
    let initial = match initial {
        Ok(credentials) => credentials,
        Err(err) if matches!(source, CredentialSource::Rest { .. }) => {
            warn!(
                target: "gateway",
                error = %err,
                "credential service unavailable; using default STUN-only descriptor"
            );
            rtc_credentials::decode(DEFAULT_DESCRIPTOR)?
        }
        Err(err) => return Err(err.into()),
    };
    info!(
        target: "gateway",
        stun = initial.stun_uris.len(),
        turn = initial.turn_uris.len(),
        "initial RTC credentials ready"
    );

    let published = PublishedDescriptor::new();
    published.publish(initial.clone());

    let (video, video_events, video_bus) = pipeline::pipeline(StreamKind::Video);
    let (audio, audio_events, audio_bus) = pipeline::pipeline(StreamKind::Audio);
    let _video_drain = pipeline::attach_log_drain(video_bus);
    let _audio_drain = pipeline::attach_log_drain(audio_bus);

    // Queued ahead of the first start, so the initial offer carries them.
    for uri in &initial.turn_uris {
        video.add_turn_server(uri);
        audio.add_turn_server(uri);
    }
    video.set_framerate(cli.framerate);
    video.set_video_bitrate(cli.video_bitrate);
    audio.set_audio_bitrate(cli.audio_bitrate);

    let (credential_tx, credential_rx) = mpsc::unbounded_channel();
    let mut monitor = CredentialMonitor::new(
        settings,
        source,
        Duration::from_secs(cli.credential_period.max(1)),
        credential_tx,
    );
    monitor.start()?;

    let (telemetry_tx, telemetry_rx) = mpsc::unbounded_channel();
    let mut system_monitor = telemetry::spawn_system_monitor(
        Duration::from_secs(1),
        true,
        Box::new(telemetry::proc_system_sample),
        telemetry_tx.clone(),
    );
    // GPU sampling needs a vendor integration; the monitor stays idle until
    // one is wired in.
    let mut gpu_monitor = telemetry::spawn_gpu_monitor(
        Duration::from_secs(1),
        false,
        Box::new(|| None),
        telemetry_tx,
    );
    let telemetry_pump = telemetry::spawn_telemetry_pump(telemetry_rx, video.clone());

    let url = signaling_url(&cli.signaling_host, cli.signaling_port, cli.enable_https)
        .context("invalid signaling relay address")?;
    let basic_auth = (cli.enable_basic_auth && !cli.basic_auth_password.is_empty())
        .then(|| (cli.basic_auth_user.clone(), cli.basic_auth_password.clone()));

    let supervisor = SessionSupervisor::new(
        video_channel(&url, basic_auth.clone()),
        audio_channel(&url, basic_auth),
        (video.clone(), video_events),
        (audio.clone(), audio_events),
        credential_rx,
        published.clone(),
        Arc::new(NoopDisplay),
        SupervisorOptions {
            enable_resize: cli.enable_resize,
            iteration_limit: None,
        },
    );
    let mut supervisor_task = tokio::spawn(supervisor.run());

    let failed;
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!(target: "gateway", "shutdown signal received");
            supervisor_task.abort();
            failed = false;
        }
        result = &mut supervisor_task => {
            failed = result.is_err();
            if let Err(err) = result {
                error!(target: "gateway", error = %err, "session supervisor failed");
            }
        }
    }

    // Mandatory order: pipelines, then worker threads, then the signaling
    // transports (which die with the supervisor's tasks).
    video.stop();
    audio.stop();
    system_monitor.stop();
    gpu_monitor.stop();
    monitor.stop();
    telemetry_pump.abort();

    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn init_tracing(debug: bool) {
    let default_level = if debug { "debug" } else { "info" };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Blocks startup until the sidecar reports the streamed app is up, unless
/// auto-init is on.
async fn wait_for_app_ready(ready_file: &Path, auto_init: bool) {
    if auto_init {
        return;
    }
    info!(target: "gateway", path = %ready_file.display(), "waiting for streaming app ready");
    while !ready_file.exists() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }
}
