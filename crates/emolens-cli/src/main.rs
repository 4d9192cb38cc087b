use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use emolens_core::{AnalyticsSnapshot, DetectionResult, SessionState};
use emolens_hw::{DeviceProvider, StillImageProvider, V4lProvider};
use emolens_session::{CaptureOutcome, Config, DetectionBackend, EmotionSession, HttpBackend};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};

#[derive(Parser)]
#[command(name = "emolens", about = "Facial emotion detection client")]
struct Cli {
    /// Print session state as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List V4L2 capture devices
    Devices,
    #[command(flatten)]
    Session(SessionCommand),
}

/// Commands that talk to the detection service.
#[derive(Subcommand)]
enum SessionCommand {
    /// Capture one frame from the camera and classify it
    Detect,
    /// Stream from the camera; press Enter to capture
    Live {
        /// Capture automatically every interval instead of on Enter
        #[arg(long)]
        real_time: bool,
    },
    /// Classify an image file
    Upload {
        path: PathBuf,
    },
    /// Show session analytics
    Analytics,
    /// Reset the session analytics on the server
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Devices => list_devices(cli.json),
        Commands::Session(command) => run(command, cli.json).await,
    }
}

async fn run(command: SessionCommand, json: bool) -> Result<()> {
    let config = Config::load()?;
    tracing::debug!(?config, "loaded config");
    let session = open_session(&config)?;

    match command {
        SessionCommand::Detect => {
            session.start_camera().await?;
            let outcome = session.capture().await;
            session.stop_camera().await?;
            report_capture(&session, outcome, json)?;
        }
        SessionCommand::Live { real_time } => run_live(&session, real_time, json).await?,
        SessionCommand::Upload { path } => {
            let outcome = session.upload_path(&path).await?;
            report_capture(&session, outcome, json)?;
        }
        SessionCommand::Analytics => {
            if !session.refresh_analytics().await {
                anyhow::bail!("analytics unavailable from {}", config.api_url);
            }
            print_analytics(&session.state(), json)?;
        }
        SessionCommand::Reset => {
            session.reset_session().await?;
            println!("Session reset.");
            print_analytics(&session.state(), json)?;
        }
    }

    session.shutdown();
    Ok(())
}

fn open_session(config: &Config) -> Result<EmotionSession> {
    let provider: Box<dyn DeviceProvider> = match &config.camera_image {
        Some(path) => Box::new(
            StillImageProvider::from_path(path)
                .with_context(|| format!("loading still camera image {}", path.display()))?,
        ),
        None => Box::new(V4lProvider::new(config.camera_device.clone())),
    };
    let backend: Arc<dyn DetectionBackend> = Arc::new(HttpBackend::new(&config.api_url, config.request_timeout())?);
    Ok(EmotionSession::new(config, provider, backend)?)
}

fn list_devices(json: bool) -> Result<()> {
    let devices = emolens_hw::v4l2::list_devices();
    if json {
        let list: Vec<_> = devices
            .iter()
            .map(|d| {
                serde_json::json!({
                    "path": d.path,
                    "name": d.name,
                    "driver": d.driver,
                    "width": d.width,
                    "height": d.height,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&list)?);
        return Ok(());
    }

    if devices.is_empty() {
        println!("No capture devices found.");
    }
    for d in &devices {
        println!("{}  {} ({}) {}x{}", d.path, d.name, d.driver, d.width, d.height);
    }
    Ok(())
}

async fn run_live(session: &EmotionSession, real_time: bool, json: bool) -> Result<()> {
    let info = session.start_camera().await?;
    tracing::info!(?info, "camera streaming");
    if real_time {
        session.enable_real_time()?;
        println!("Real-time detection on. Ctrl-C to stop.");
    } else {
        println!("Press Enter to capture. Ctrl-C to stop.");
    }

    let mut updates = session.subscribe();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = !real_time;
    let mut shown = session.state().detection;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line(), if stdin_open => match line? {
                Some(_) => {
                    if session.capture().await == CaptureOutcome::Busy {
                        println!("Still analyzing the previous capture.");
                    }
                }
                None => stdin_open = false,
            },
            changed = updates.changed() => {
                if changed.is_err() {
                    break;
                }
                let state = updates.borrow_and_update().clone();
                if !state.is_loading && state.detection != shown {
                    print_state(&state, json)?;
                    shown = state.detection;
                }
            }
        }
    }

    session.stop_camera().await?;
    Ok(())
}

fn report_capture(session: &EmotionSession, outcome: CaptureOutcome, json: bool) -> Result<()> {
    let state = session.state();
    match outcome {
        CaptureOutcome::Applied | CaptureOutcome::Superseded => print_state(&state, json),
        CaptureOutcome::Busy => anyhow::bail!("another capture is still in flight"),
        CaptureOutcome::CameraNotStreaming => anyhow::bail!("{}", state.error_message),
    }
}

fn print_state(state: &SessionState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(state)?);
        return Ok(());
    }
    print_detection(&state.detection);
    Ok(())
}

fn print_detection(detection: &DetectionResult) {
    if detection.is_error() {
        println!("Error: {}", detection.error);
        return;
    }
    if detection.primary_emotion.is_empty() {
        return;
    }

    match detection.primary_confidence {
        Some(confidence) => println!("{} ({confidence:.1}%)", detection.primary_emotion),
        None => println!("{}", detection.primary_emotion),
    }
    for overlay in emolens_core::render_overlays(&detection.faces, Default::default()) {
        let r = overlay.rect;
        println!(
            "  {:<18} at {:.1}%,{:.1}% size {:.1}%x{:.1}%",
            overlay.label, r.left_pct, r.top_pct, r.width_pct, r.height_pct
        );
    }
    for (emotion, score) in &detection.all_emotions {
        println!("  {emotion:<10} {score:>5.1}%");
    }
}

fn print_analytics(state: &SessionState, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(&state.analytics)?);
        return Ok(());
    }
    match &state.analytics {
        Some(snapshot) => print_snapshot(snapshot),
        None => println!("No data available yet."),
    }
    Ok(())
}

fn print_snapshot(snapshot: &AnalyticsSnapshot) {
    let stats = &snapshot.session_stats;
    println!("Total predictions: {}", stats.total_predictions);
    println!("Session duration:  {}m", stats.duration_minutes);
    if let Some(dominant) = &snapshot.dominant_emotion {
        println!("Dominant emotion:  {dominant}");
    }

    let distribution = snapshot.distribution();
    if !distribution.is_empty() {
        println!("Distribution:");
        for (emotion, pct) in distribution {
            println!("  {emotion:<10} {pct:>5.1}%");
        }
    }

    let recent = snapshot.latest(5);
    if !recent.is_empty() {
        println!("Recent:");
        for entry in recent {
            let when = entry
                .timestamp
                .map(|t| t.format("%H:%M:%S").to_string())
                .unwrap_or_default();
            println!("  {when:>8}  {:<10} {:.1}%", entry.emotion, entry.confidence);
        }
    }
}
