use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod analysis;
mod builders;
mod camera_session;
mod config;
mod errors;
mod ffmpeg_source;
mod frame_store;
mod handlers;
mod http_source;
mod motion_state;
mod mqtt;
mod notifier;
mod overlay;
mod stream;
mod supervisor;
mod transcoder;
mod video_source;

use analysis::{DiffAnalyzer, MotionAnalyzer};
use builders::CameraSessionBuilder;
use config::{CameraConfig, Config, DebugViewConfig, LoggingConfig};
use frame_store::FrameStore;
use mqtt::{MqttHandle, MqttPublisher};
use notifier::build_notifier;
use supervisor::{SessionFactory, SessionSupervisor};
use video_source::open_source;

#[derive(Parser, Debug)]
#[command(author, version, about = "Motion detection server for multiple network cameras")]
struct Args {
    /// Configuration file (.toml, .yaml/.yml or .json)
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Load and validate the configuration, print the cameras and exit
    #[arg(long)]
    check: bool,
}

/// Camera as seen by the HTTP layer.
#[derive(Debug, Clone)]
pub struct CameraEntry {
    pub name: String,
    pub description: String,
    pub debug_views: DebugViewConfig,
}

impl From<&CameraConfig> for CameraEntry {
    fn from(camera: &CameraConfig) -> Self {
        Self {
            name: camera.name.clone(),
            description: camera.description.clone(),
            debug_views: camera.debug_views,
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub store: FrameStore,
    pub cameras: Arc<Vec<CameraEntry>>,
    pub placeholder: Bytes,
    pub frame_interval: Duration,
    pub shutdown: CancellationToken,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {}", args.config))?;
    init_tracing(&config.logging);

    if args.check {
        print_cameras(&config);
        return Ok(());
    }

    info!(
        "Starting motion detection server on {}:{} with {} cameras",
        config.server.host,
        config.server.port,
        config.enabled_cameras().count()
    );

    let store = FrameStore::new();
    for camera in config.enabled_cameras() {
        store.register(&camera.name).await;
    }

    let mqtt_handle = start_mqtt(&config)?;

    let factory: SessionFactory = {
        let store = store.clone();
        let analyzer: Arc<dyn MotionAnalyzer> = Arc::new(DiffAnalyzer::default());
        let notifications_enabled = config.notifications_enabled;
        Arc::new(move |camera: Arc<CameraConfig>| {
            let notifier = build_notifier(&camera, notifications_enabled, mqtt_handle.as_ref());
            let source = open_source(&camera)?;
            CameraSessionBuilder::new()
                .source(source)
                .config(camera)
                .store(store.clone())
                .analyzer(analyzer.clone())
                .notifier(notifier)
                .build()
        })
    };

    let mut supervisor = SessionSupervisor::new(factory);
    supervisor.start_all(config.enabled_cameras().cloned());
    info!("Supervising cameras: {}", supervisor.camera_ids().join(", "));
    let shutdown = supervisor.cancellation_token();

    let placeholder = handlers::load_placeholder(&config.server)
        .context("Failed to prepare placeholder image")?;

    let state = AppState {
        store,
        cameras: Arc::new(config.enabled_cameras().map(CameraEntry::from).collect()),
        placeholder,
        frame_interval: config.server.frame_interval(),
        shutdown: shutdown.clone(),
    };
    let app = handlers::router(state, config.server.cors_allow_origin.as_deref());

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on http://{}", addr);

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await;

    for (camera_id, stats) in supervisor.shutdown().await {
        info!("Camera '{}' final stats: {:?}", camera_id, stats);
    }

    served.context("HTTP server error")?;
    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    // RUST_LOG wins over the configured filter
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&logging.filter))
        .unwrap_or_else(|e| {
            eprintln!("Invalid log filter '{}': {}, using 'info'", logging.filter, e);
            EnvFilter::new("info")
        });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .init();
}

fn start_mqtt(config: &Config) -> Result<Option<MqttHandle>> {
    let Some(mqtt_config) = &config.mqtt else {
        return Ok(None);
    };
    if !mqtt_config.enabled {
        info!("MQTT disabled in configuration");
        return Ok(None);
    }
    if !config.notifications_enabled {
        warn!("Notifications are disabled, not connecting to MQTT broker");
        return Ok(None);
    }

    let publisher = MqttPublisher::new(mqtt_config.clone())
        .context("Failed to set up MQTT client")?;
    Ok(Some(publisher.start()))
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
        info!("Received Ctrl+C, shutting down");
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = shutdown.cancelled() => {}
    }
    shutdown.cancel();
}

fn print_cameras(config: &Config) {
    println!("Configuration OK: {} cameras", config.cameras.len());
    for camera in &config.cameras {
        println!(
            "  {} ({}){}",
            camera.name,
            camera.description,
            if camera.enabled { "" } else { " [disabled]" }
        );
        println!("    source:    {}", camera.redacted_source_url());
        println!(
            "    detection: {} (min_area {}, frame_skip {}, update_reference {}s, notify {}s)",
            if camera.detection.enabled { "on" } else { "off" },
            camera.detection.min_area,
            camera.detection.frame_skip,
            camera.detection.update_reference_seconds,
            camera.detection.notify_seconds
        );
        println!(
            "    notify:    email {}, mqtt {}",
            if camera.email.enabled { "on" } else { "off" },
            if camera.mqtt.enabled { "on" } else { "off" }
        );
    }
}
