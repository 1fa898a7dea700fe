use anyhow::{Context, Result};
use attend_core::eyes::ContrastEyeDetector;
use attend_core::scrfd::ScrfdBackend;
use attend_core::{AttendanceCore, SystemClock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::EnvFilter;
use zbus::object_server::SignalEmitter;

mod config;
mod dbus_interface;
mod engine;

use config::Config;
use dbus_interface::{AttendanceService, BUS_NAME, OBJECT_PATH};
use engine::Capture;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("attendd starting");

    let config = Arc::new(Config::load()?);

    let detector = ScrfdBackend::load(&config.model_path)
        .with_context(|| format!("loading detector {}", config.model_path.display()))?;
    let eyes = ContrastEyeDetector::with_min_stddev(config.eye_min_stddev);
    let core = AttendanceCore::open(
        config.core.clone(),
        Arc::new(SystemClock),
        Box::new(detector),
        Box::new(eyes),
    )
    .context("opening attendance data")?;
    let core = Arc::new(core);
    tracing::info!(
        enrolled = core.identities().len(),
        recognition = core.recognition_available(),
        "core ready"
    );

    let capture = Arc::new(Capture::new(
        core.clone(),
        Duration::from_millis(config.frame_interval_ms),
    ));
    let mut results = capture.subscribe();

    let service = AttendanceService::new(core.clone(), capture.clone(), config.clone());
    let conn = zbus::connection::Builder::session()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("registering on the session bus")?;

    let emitter = SignalEmitter::new(&conn, OBJECT_PATH)?.into_owned();
    let forward = tokio::spawn(async move {
        loop {
            match results.recv().await {
                Ok(result) if !result.faces.is_empty() => {
                    let Ok(json) = serde_json::to_string(&result) else {
                        continue;
                    };
                    if let Err(e) = AttendanceService::frame_processed(&emitter, &json).await {
                        tracing::debug!(error = %e, "frame signal not sent");
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => tracing::debug!(skipped = n, "signal forwarder lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "attendd ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("attendd shutting down");

    forward.abort();
    let stopper = capture.clone();
    tokio::task::spawn_blocking(move || stopper.stop()).await?;
    if let Err(e) = core.save() {
        tracing::error!(error = %e, "failed to save gallery on shutdown");
    }

    Ok(())
}
