use anyhow::{bail, Context, Result};
use attend_hw::{Camera, CameraSettings, FrameSource};
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::time::Duration;

#[zbus::proxy(
    interface = "org.campus.Attendance1",
    default_service = "org.campus.Attendance",
    default_path = "/org/campus/Attendance1"
)]
trait Attendance {
    fn start_session(&self) -> zbus::Result<String>;
    fn stop_session(&self) -> zbus::Result<String>;
    fn latest_frame(&self) -> zbus::Result<String>;
    fn capture_sample(&self) -> zbus::Result<String>;
    fn clear_samples(&self) -> zbus::Result<String>;
    fn enroll(&self, identity_id: &str, display_name: &str, department: &str)
        -> zbus::Result<String>;
    fn import_folder(&self, path: &str) -> zbus::Result<String>;
    fn scan_fingerprint(&self) -> zbus::Result<String>;
    fn scan_qr(&self, payload: &str) -> zbus::Result<String>;
    fn daily_qr(&self, identity_id: &str) -> zbus::Result<String>;
    fn mark(&self) -> zbus::Result<String>;
    fn reset(&self) -> zbus::Result<String>;
    fn attempt(&self) -> zbus::Result<String>;
    fn today(&self) -> zbus::Result<String>;
    fn anomalies(&self, count: u32) -> zbus::Result<String>;
    fn status(&self) -> zbus::Result<String>;
}

#[derive(Parser)]
#[command(name = "attend", about = "Campus attendance CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the capture session
    Start,
    /// Stop the capture session and release the camera
    Stop,
    /// Show the last processed frame
    Latest,
    /// Print recognition results as frames arrive
    Watch {
        /// Poll interval in milliseconds
        #[arg(long, default_value_t = 500)]
        interval: u64,
    },
    /// Buffer the current frame as an enrollment sample
    Sample,
    /// Drop all buffered samples
    ClearSamples,
    /// Enroll an identity from the buffered samples
    Enroll {
        id: String,
        name: String,
        #[arg(short, long, default_value = "")]
        department: String,
    },
    /// Enroll every person folder under a directory
    Import { path: PathBuf },
    /// Simulate a fingerprint scan for the current attempt
    Fingerprint,
    /// Verify a scanned QR payload for the current attempt
    Qr { payload: String },
    /// Print today's QR payload for an identity
    DailyQr { id: String },
    /// Commit the current attempt
    Mark,
    /// Clear the current attempt and liveness
    Reset,
    /// Show the current attempt
    Attempt,
    /// List today's attendance
    Today,
    /// Show recent anomalies
    Anomalies {
        #[arg(short = 'n', long, default_value_t = 10)]
        count: u32,
    },
    /// Show daemon status
    Status,
    /// List V4L2 capture devices
    Devices,
    /// Run camera diagnostics without the daemon
    Test {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(short, long, default_value_t = 10)]
        frames: u32,
    },
}

/// Print a daemon reply; fail when it reports `success: false`.
fn show(reply: &str) -> Result<()> {
    let v: Value = serde_json::from_str(reply).context("daemon returned invalid JSON")?;
    let message = v["message"].as_str().unwrap_or_default();
    if v["success"].as_bool() != Some(true) {
        bail!("{message}");
    }
    println!("{message}");
    if let Some(data) = v.get("data") {
        println!("{}", serde_json::to_string_pretty(data)?);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Devices => return list_devices(),
        Commands::Test { device, frames } => return camera_test(&device, frames),
        _ => {}
    }

    let conn = zbus::Connection::session()
        .await
        .context("cannot reach the session bus")?;
    tracing::debug!(unique_name = ?conn.unique_name(), "connected to session bus");
    let proxy = AttendanceProxy::new(&conn).await?;

    let reply = match cli.command {
        Commands::Start => proxy.start_session().await?,
        Commands::Stop => proxy.stop_session().await?,
        Commands::Latest => proxy.latest_frame().await?,
        Commands::Watch { interval } => return watch(&proxy, interval).await,
        Commands::Sample => proxy.capture_sample().await?,
        Commands::ClearSamples => proxy.clear_samples().await?,
        Commands::Enroll {
            id,
            name,
            department,
        } => proxy.enroll(&id, &name, &department).await?,
        Commands::Import { path } => {
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("no such directory: {}", path.display()))?;
            proxy.import_folder(&path.to_string_lossy()).await?
        }
        Commands::Fingerprint => proxy.scan_fingerprint().await?,
        Commands::Qr { payload } => proxy.scan_qr(&payload).await?,
        Commands::DailyQr { id } => proxy.daily_qr(&id).await?,
        Commands::Mark => proxy.mark().await?,
        Commands::Reset => proxy.reset().await?,
        Commands::Attempt => proxy.attempt().await?,
        Commands::Today => proxy.today().await?,
        Commands::Anomalies { count } => proxy.anomalies(count).await?,
        Commands::Status => proxy.status().await?,
        Commands::Devices | Commands::Test { .. } => bail!("local command"),
    };
    show(&reply)
}

async fn watch(proxy: &AttendanceProxy<'_>, interval_ms: u64) -> Result<()> {
    let mut last = None;
    loop {
        let v: Value = serde_json::from_str(&proxy.latest_frame().await?)?;
        let seq = v["data"]["sequence"].as_u64();
        if seq.is_some() && seq != last {
            last = seq;
            let blinks = v["data"]["liveness"]["blink_count"].as_u64().unwrap_or(0);
            let faces = v["data"]["faces"].as_array().cloned().unwrap_or_default();
            let names: Vec<String> = faces
                .iter()
                .map(|f| match f["identity_id"].as_str() {
                    Some(id) => format!("{id} ({}%)", f["confidence"]),
                    None => "unknown".to_string(),
                })
                .collect();
            println!(
                "frame {:>6}  blinks {}  faces [{}]",
                seq.unwrap_or(0),
                blinks,
                names.join(", ")
            );
        }
        tokio::time::sleep(Duration::from_millis(interval_ms)).await;
    }
}

fn list_devices() -> Result<()> {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
    }
    for d in devices {
        println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
    }
    Ok(())
}

fn camera_test(device: &str, frames: u32) -> Result<()> {
    println!("Running camera diagnostics on {device}...");
    let mut camera = Camera::open(device, &CameraSettings::default())?;
    println!("Negotiated {}x{}", camera.width, camera.height);
    let mut dark = 0;
    for _ in 0..frames {
        let Some(frame) = camera.read()? else {
            break;
        };
        if frame.is_dark {
            dark += 1;
        }
        println!(
            "seq {:>5}  brightness {:>6.1}{}",
            frame.sequence,
            frame.avg_brightness(),
            if frame.is_dark { "  (dark)" } else { "" }
        );
    }
    println!("{frames} frames read, {dark} dark");
    Ok(())
}
