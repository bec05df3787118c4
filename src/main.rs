//! Vigilo daemon: watch cameras, report debounced motion with a snapshot.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use color_eyre::{eyre::eyre, Result};
use tokio::time::Instant;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use vigilo::capture::pattern::{TestPatternHandle, PATTERN_SCHEME};
use vigilo::capture::{Frame, FrameGeometry, FrameSource, SourceHandle, TestPatternSource};
use vigilo::config::{CaptureConfig, Config, SourceConfig};
use vigilo::error::{AcquisitionError, AcquisitionFailure};
use vigilo::notify::{caption, ChannelSink, LogSink, MotionEvent, NotificationSink};
use vigilo::session::RunnerOptions;
use vigilo::{ConfigHandle, Supervisor};

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Parser)]
#[command(name = "vigilo", version, about = "Camera motion watcher")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "VIGILO_CONFIG")]
    config: Option<PathBuf>,

    /// Extra source ids to watch (device path or pattern://name)
    #[arg(short, long = "source")]
    sources: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    let registry = tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("vigilo=info")))
        .with(tracing_subscriber::fmt::layer().with_timer(tracing_subscriber::fmt::time::uptime()));
    #[cfg(feature = "profiling")]
    let registry = registry.with(tracing_tracy::TracyLayer::default());
    registry.init();

    info!("Vigilo launching...");

    let args = Args::parse();
    let mut config = Config::load(args.config.as_deref())?;
    for id in args.sources {
        if !config.sources.iter().any(|s| s.id == id) {
            config.sources.push(SourceConfig { id, label: None });
        }
    }
    config.validate()?;
    if config.sources.is_empty() {
        return Err(eyre!("No sources configured; pass --source or add [[sources]]"));
    }

    let detection = ConfigHandle::new(config.detection.clone());
    let (sink, events) = ChannelSink::bounded(config.notify.channel_capacity);
    let options = RunnerOptions {
        jpeg_quality: config.snapshot.jpeg_quality,
        max_consecutive_failures: (config.capture.max_consecutive_failures > 0)
            .then_some(config.capture.max_consecutive_failures),
    };
    let supervisor = Supervisor::new(
        DeviceSource::new(&config.capture),
        detection.clone(),
        Arc::new(sink),
        options,
    );

    let delivery = tokio::spawn(deliver_events(
        events,
        config.notify.caption_prefix.clone(),
        config.notify.output_dir.clone(),
    ));

    for source in &config.sources {
        let name = source.label.as_deref().unwrap_or(&source.id);
        match supervisor.activate(&source.id).await {
            Ok(status) => info!("Watching {} ({:?})", name, status.geometry),
            Err(e) => error!("Could not start {}: {}", name, e),
        }
    }
    if supervisor.list().await.is_empty() {
        supervisor.shutdown().await;
        return Err(eyre!("No source could be opened"));
    }

    run_until_shutdown(&supervisor, args.config.as_deref()).await?;

    for status in supervisor.shutdown().await {
        info!(
            "{}: {} ticks, {} events, {} suppressed, {} failures",
            status.source_id,
            status.stats.ticks,
            status.stats.events_emitted,
            status.stats.events_suppressed,
            status.stats.acquisition_failures
        );
    }
    drop(supervisor);
    let _ = delivery.await;

    info!("Vigilo shutting down");
    Ok(())
}

async fn run_until_shutdown(
    supervisor: &Supervisor<DeviceSource>,
    config_path: Option<&Path>,
) -> Result<()> {
    #[cfg(unix)]
    let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut status_tick = tokio::time::interval(STATUS_LOG_INTERVAL);

    loop {
        #[cfg(unix)]
        let reload = hangup.recv();
        #[cfg(not(unix))]
        let reload = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received");
                return Ok(());
            }
            _ = reload => reload_detection(supervisor.config(), config_path),
            _ = status_tick.tick() => log_statuses(supervisor).await,
        }
    }
}

/// Re-read the file and publish its detection section; sessions pick it up next tick.
fn reload_detection(handle: &ConfigHandle, config_path: Option<&Path>) {
    match Config::load(config_path).and_then(|config| handle.store(config.detection)) {
        Ok(()) => info!("Detection settings reloaded: {:?}", handle.load()),
        Err(e) => warn!("Ignoring configuration reload: {}", e),
    }
}

async fn log_statuses(supervisor: &Supervisor<DeviceSource>) {
    let window = supervisor.config().load().motion_active();
    let now = Instant::now();
    for status in supervisor.list().await {
        info!(
            source = %status.source_id,
            state = ?status.state,
            motion_active = status.motion_active(now, window),
            ticks = status.stats.ticks,
            overruns = status.stats.overruns,
            events = status.stats.events_emitted,
            "Status"
        );
    }
}

/// Drain the event queue: log a caption and optionally keep the snapshot on disk.
async fn deliver_events(
    events: flume::Receiver<MotionEvent>,
    caption_prefix: String,
    output_dir: Option<PathBuf>,
) {
    let log = LogSink::new(caption_prefix.clone());
    while let Ok(event) = events.recv_async().await {
        if let Some(dir) = &output_dir {
            let name: String = event
                .source_id
                .chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
                .collect();
            let path = dir.join(format!("{}-{:08}.jpg", name, event.sequence));
            match tokio::fs::write(&path, &event.snapshot).await {
                Ok(()) => info!("{} -> {}", caption(&event, &caption_prefix), path.display()),
                Err(e) => warn!("Failed to write {}: {}", path.display(), e),
            }
        }
        log.notify(event);
    }
}

/// Routes `pattern://` ids to the synthetic source and everything else to V4L2.
struct DeviceSource {
    pattern: TestPatternSource,
    #[cfg(feature = "v4l2")]
    v4l2: vigilo::capture::V4l2Source,
}

impl DeviceSource {
    fn new(capture: &CaptureConfig) -> Self {
        let pattern = vigilo::capture::TestPattern {
            geometry: FrameGeometry::new(capture.width, capture.height),
            ..Default::default()
        };
        Self {
            pattern: TestPatternSource::new(pattern),
            #[cfg(feature = "v4l2")]
            v4l2: vigilo::capture::V4l2Source {
                width: capture.width,
                height: capture.height,
                format: capture.format,
                buffer_count: capture.buffer_count,
                frame_timeout: capture.frame_timeout(),
            },
        }
    }
}

enum DeviceHandle {
    Pattern(TestPatternHandle),
    #[cfg(feature = "v4l2")]
    V4l2(vigilo::capture::v4l2::V4l2Handle),
}

impl FrameSource for DeviceSource {
    type Handle = DeviceHandle;

    async fn open(&self, source_id: &str) -> Result<Self::Handle, AcquisitionError> {
        if source_id.starts_with(PATTERN_SCHEME) {
            return self.pattern.open(source_id).await.map(DeviceHandle::Pattern);
        }

        #[cfg(feature = "v4l2")]
        {
            self.v4l2.open(source_id).await.map(DeviceHandle::V4l2)
        }
        #[cfg(not(feature = "v4l2"))]
        {
            Err(AcquisitionError::Unavailable {
                source_id: source_id.to_string(),
                reason: "built without the v4l2 feature".into(),
            })
        }
    }
}

impl SourceHandle for DeviceHandle {
    fn geometry(&self) -> FrameGeometry {
        match self {
            DeviceHandle::Pattern(h) => h.geometry(),
            #[cfg(feature = "v4l2")]
            DeviceHandle::V4l2(h) => h.geometry(),
        }
    }

    async fn acquire_frame(&mut self) -> Result<Frame, AcquisitionFailure> {
        match self {
            DeviceHandle::Pattern(h) => h.acquire_frame().await,
            #[cfg(feature = "v4l2")]
            DeviceHandle::V4l2(h) => h.acquire_frame().await,
        }
    }

    async fn close(self) {
        match self {
            DeviceHandle::Pattern(h) => h.close().await,
            #[cfg(feature = "v4l2")]
            DeviceHandle::V4l2(h) => h.close().await,
        }
    }
}
