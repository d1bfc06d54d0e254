//! Host telemetry monitors.
//!
//! Sampling itself belongs to the platform integration (injected closures);
//! this module owns the scheduling: worker threads run the sampler on a
//! period and hand results across to the negotiation loop over a channel,
//! where a pump forwards them to the video pipeline's stats channel along
//! with a ping carrying the send timestamp.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::mpsc;
use tracing::debug;

use crate::pipeline::PipelineHandle;

pub type SystemSampler = Box<dyn Fn() -> Option<SystemSample> + Send>;
pub type GpuSampler = Box<dyn Fn() -> Option<GpuSample> + Send>;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SystemSample {
    pub cpu_percent: f64,
    pub mem_total: u64,
    pub mem_used: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GpuSample {
    pub load: f64,
    pub memory_total: u64,
    pub memory_used: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TelemetryEvent {
    System {
        sample: SystemSample,
        /// Unix timestamp of the sample, doubling as the ping payload.
        timestamp: f64,
    },
    Gpu(GpuSample),
}

/// Running telemetry worker; stopping is observed at the next period tick.
pub struct TelemetryHandle {
    stop: Arc<AtomicBool>,
    thread: Option<thread::JoinHandle<()>>,
}

impl TelemetryHandle {
    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for TelemetryHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

pub fn spawn_system_monitor(
    period: Duration,
    enabled: bool,
    sampler: SystemSampler,
    events: mpsc::UnboundedSender<TelemetryEvent>,
) -> TelemetryHandle {
    spawn_worker(period, move || {
        if !enabled {
            return None;
        }
        let sample = sampler()?;
        Some(TelemetryEvent::System {
            sample,
            timestamp: unix_now(),
        })
    }, events)
}

pub fn spawn_gpu_monitor(
    period: Duration,
    enabled: bool,
    sampler: GpuSampler,
    events: mpsc::UnboundedSender<TelemetryEvent>,
) -> TelemetryHandle {
    spawn_worker(period, move || {
        if !enabled {
            return None;
        }
        sampler().map(TelemetryEvent::Gpu)
    }, events)
}

fn spawn_worker<F>(
    period: Duration,
    tick: F,
    events: mpsc::UnboundedSender<TelemetryEvent>,
) -> TelemetryHandle
where
    F: Fn() -> Option<TelemetryEvent> + Send + 'static,
{
    let stop = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&stop);
    let thread = thread::spawn(move || {
        while !flag.load(Ordering::Relaxed) {
            if let Some(event) = tick() {
                if events.send(event).is_err() {
                    break;
                }
            }
            thread::sleep(period);
        }
    });
    TelemetryHandle {
        stop,
        thread: Some(thread),
    }
}

/// Forwards telemetry onto the video pipeline's stats channel.
pub fn spawn_telemetry_pump(
    mut events: mpsc::UnboundedReceiver<TelemetryEvent>,
    video: PipelineHandle,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                TelemetryEvent::System { sample, timestamp } => {
                    video.send_system_stats(sample.cpu_percent, sample.mem_total, sample.mem_used);
                    video.send_ping(timestamp);
                }
                TelemetryEvent::Gpu(sample) => {
                    video.send_gpu_stats(sample.load, sample.memory_total, sample.memory_used);
                }
            }
        }
        debug!(target: "telemetry", "telemetry channel closed; pump exiting");
    })
}

fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs_f64()
}

/// Minimal /proc-backed sampler for Linux hosts without a platform
/// integration: load average scaled by core count, MemTotal/MemAvailable.
pub fn proc_system_sample() -> Option<SystemSample> {
    let loadavg = std::fs::read_to_string("/proc/loadavg").ok()?;
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let cores = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
    let cpu_percent = parse_loadavg(&loadavg).map(|load| (load / cores as f64) * 100.0)?;
    let (mem_total, mem_used) = parse_meminfo(&meminfo)?;
    Some(SystemSample {
        cpu_percent,
        mem_total,
        mem_used,
    })
}

fn parse_loadavg(contents: &str) -> Option<f64> {
    contents.split_whitespace().next()?.parse().ok()
}

/// Returns (total, used) in bytes from /proc/meminfo kB fields.
fn parse_meminfo(contents: &str) -> Option<(u64, u64)> {
    let mut total = None;
    let mut available = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = rest.split_whitespace().next()?.parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = rest.split_whitespace().next()?.parse::<u64>().ok();
        }
    }
    let total_kb = total?;
    let available_kb = available?;
    Some((total_kb * 1024, total_kb.saturating_sub(available_kb) * 1024))
}
