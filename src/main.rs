//! Accident detection pipeline daemon.

use std::sync::Arc;

use accident_stream::bus::EventBus;
use accident_stream::config::Config;
use accident_stream::pipeline::{InferenceEngine, MultiStreamDetector};
use accident_stream::session::SessionCoordinator;
use accident_stream::web;
use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera accident detection pipeline")]
struct CliArgs {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Enable verbose (debug) logging.
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let filter = if args.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    gstreamer::init()?;

    info!(config_path = %args.config, "loading configuration");
    let config = match Config::from_file(&args.config) {
        Ok(config) => config,
        Err(e) => {
            info!(error = %e, "no usable config file, falling back to defaults");
            Config::default()
        }
    };

    if config.cameras.is_empty() {
        info!("no cameras configured, exiting");
        return Ok(());
    }

    let bus = Arc::new(EventBus::new());
    let engine = InferenceEngine::from_config(&config.engine)?;
    let detector = MultiStreamDetector::start(
        bus.clone(),
        engine,
        config.engine.batch_size,
        config.engine.poll_ms,
        config.engine.decision_threshold,
    );
    let coordinator = SessionCoordinator::new(bus.clone(), detector);

    let session_id = format!("s-{}", std::process::id());
    let mut sessions = Vec::new();
    for camera in &config.cameras {
        info!(camera_id = %camera.camera_id, source = %camera.source, "starting camera session");
        match coordinator
            .start_camera(
                camera.camera_id.clone(),
                camera.source.clone(),
                camera.simulate_realtime,
                config.resampler.target_fps,
                session_id.clone(),
                config.aggregator.clone(),
            )
            .await
        {
            Ok(session) => sessions.push(session),
            Err(e) => error!(camera_id = %camera.camera_id, error = %e, "failed to start camera session, skipping"),
        }
    }

    let web_config = Arc::new(config);
    let web_bus = bus.clone();
    let web_handle = tokio::spawn(async move {
        if let Err(e) = web::run_server(web_config, web_bus).await {
            error!(error = %e, "HTTP boundary exited with an error");
        }
    });

    info!("pipeline running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    web_handle.abort();
    coordinator.stop_all(sessions).await;

    Ok(())
}
