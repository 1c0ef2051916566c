use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use sweep_core::{Calibration, FaceDetector, GrayImage, PoseSample, ScrfdDetector};
use sweep_hw::{select_device, CameraBackend, CaptureController, V4l2Backend};
use sweep_liveness::{
    CapturedArtifact, Config, DbusFaceRegistry, DryRunRegistry, FaceRegistry, LivenessCapture, PipelineEvent,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "sweep", about = "Head-sweep liveness capture")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List capture devices
    Devices,
    /// Run a liveness capture and register the face
    Capture {
        /// User the face is registered for
        #[arg(short, long)]
        user: String,
        /// Device node to use instead of the automatic choice
        #[arg(short, long)]
        device: Option<String>,
        /// Skip the registry; accept every capture
        #[arg(long)]
        dry_run: bool,
        /// Write the still, the video and a JSON summary here
        #[arg(long)]
        save_dir: Option<PathBuf>,
    },
    /// Run camera and detector diagnostics
    Test {
        #[arg(short, long)]
        device: Option<String>,
        /// Frames to sample
        #[arg(short, long, default_value_t = 30)]
        frames: usize,
    },
    /// Print the effective calibration as TOML
    Calibration,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Devices => list_devices().await,
        Commands::Capture {
            user,
            device,
            dry_run,
            save_dir,
        } => capture(&config, user, device, dry_run, save_dir).await,
        Commands::Test { device, frames } => diagnose(&config, device, frames).await,
        Commands::Calibration => {
            let calibration = Calibration::load_or_default(config.calibration_path.as_deref())?;
            print!("{}", calibration.to_toml_string()?);
            Ok(())
        }
    }
}

fn backend(device: Option<String>) -> V4l2Backend {
    match device {
        Some(path) => V4l2Backend::with_device(path),
        None => V4l2Backend::new(),
    }
}

async fn list_devices() -> Result<()> {
    let devices = V4l2Backend::new().enumerate().await?;
    if devices.is_empty() {
        println!("No capture devices found");
        return Ok(());
    }
    let preferred = select_device(&devices).map(|d| d.id.clone());
    for device in &devices {
        let marker = if Some(&device.id) == preferred.as_ref() { "*" } else { " " };
        println!("{marker} {}\t{}", device.id, device.label);
    }
    Ok(())
}

async fn capture(
    config: &Config,
    user: String,
    device: Option<String>,
    dry_run: bool,
    save_dir: Option<PathBuf>,
) -> Result<()> {
    let calibration = Calibration::load_or_default(config.calibration_path.as_deref())?;
    let detector = ScrfdDetector::from_model_dir(&config.model_dir)
        .with_context(|| format!("loading detector from {}", config.model_dir.display()))?;
    let registry: Arc<dyn FaceRegistry> = if dry_run {
        Arc::new(DryRunRegistry)
    } else {
        Arc::new(DbusFaceRegistry::connect(config.registry_bus, config.registry_timeout).await?)
    };

    let controller = CaptureController::new(Arc::new(backend(device)), config.capture_options());
    let capture = LivenessCapture::builder(controller, Box::new(detector), registry)
        .config(config.clone())
        .calibration(calibration)
        .user_id(user)
        .build();

    let mut events = capture.subscribe();
    let mut progress = capture.watch_progress();
    let printer = tokio::spawn(async move {
        let mut last_instruction = "";
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(PipelineEvent::SegmentCompleted { index, direction }) => {
                        println!("  segment {}/8 done ({direction:?})", index + 1);
                    }
                    Ok(PipelineEvent::FaceLost { .. }) => println!("  face lost, move back into view"),
                    Ok(PipelineEvent::VerificationComplete) => println!("  sweep complete"),
                    Ok(_) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {}
                    Err(_) => break,
                },
                changed = progress.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let instruction = progress.borrow_and_update().instruction;
                    if instruction != last_instruction && !instruction.is_empty() {
                        println!("{instruction}");
                        last_instruction = instruction;
                    }
                }
            }
        }
    });

    let outcome = tokio::select! {
        result = capture.run() => Some(result),
        _ = tokio::signal::ctrl_c() => None,
    };
    let Some(result) = outcome else {
        capture.cancel().await;
        printer.abort();
        println!("Capture cancelled");
        return Ok(());
    };
    printer.abort();

    if let (Some(dir), Some(artifact)) = (save_dir.as_deref(), capture.artifact()) {
        save_artifact(dir, &artifact)?;
        println!("Saved capture to {}", dir.display());
    }

    match result {
        Ok(success) => {
            println!(
                "Registered face {} (confidence {:.0})",
                success.face_id, success.confidence
            );
            Ok(())
        }
        Err(e) => anyhow::bail!("{e}"),
    }
}

fn save_artifact(dir: &Path, artifact: &CapturedArtifact) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let stem = artifact.id.to_string();

    let still = dir.join(format!("{stem}.jpg"));
    std::fs::write(&still, &artifact.still_jpeg).with_context(|| format!("writing {}", still.display()))?;

    if let Some(video) = &artifact.video {
        let video_path = dir.join(format!("{stem}.mjpeg"));
        std::fs::write(&video_path, &video.data).with_context(|| format!("writing {}", video_path.display()))?;
    }

    let summary = dir.join(format!("{stem}.json"));
    std::fs::write(&summary, serde_json::to_vec_pretty(&artifact.summary())?)
        .with_context(|| format!("writing {}", summary.display()))?;
    Ok(())
}

/// Open the camera, sample `frames` frames, and report brightness, detection
/// and raw pose ranges for calibration work.
async fn diagnose(config: &Config, device: Option<String>, frames: usize) -> Result<()> {
    let calibration = Calibration::load_or_default(config.calibration_path.as_deref())?;
    let controller = CaptureController::new(Arc::new(backend(device)), config.capture_options());

    println!("Opening camera...");
    let started = tokio::time::Instant::now();
    let session = controller.acquire(&CancellationToken::new()).await?;
    println!(
        "  {} ({}) ready in {} ms",
        session.device.label,
        session.device.id,
        started.elapsed().as_millis()
    );

    let mut detector = match ScrfdDetector::from_model_dir(&config.model_dir) {
        Ok(detector) => Some(detector),
        Err(e) => {
            println!("  detector unavailable: {e}");
            None
        }
    };

    let Some(mut feed) = controller.frames(session.id) else {
        anyhow::bail!("camera closed before sampling");
    };
    let mut dark = 0usize;
    let mut detected = 0usize;
    let mut poses: Vec<PoseSample> = Vec::new();

    for _ in 0..frames {
        let changed = tokio::time::timeout(Duration::from_secs(2), feed.changed()).await;
        if !matches!(changed, Ok(Ok(()))) {
            println!("  stream stalled");
            break;
        }
        let Some(frame) = feed.borrow_and_update().clone() else {
            continue;
        };
        if frame.is_dark() {
            dark += 1;
        }
        let Some(detector) = detector.as_mut() else {
            continue;
        };

        let luma = frame.luma();
        let image = GrayImage {
            data: &luma,
            width: frame.width,
            height: frame.height,
            captured_at: frame.timestamp,
        };
        let faces = tokio::task::block_in_place(|| detector.detect(&image, config.min_detection_confidence))?;
        let Some(best) = faces.into_iter().max_by(|a, b| a.confidence.total_cmp(&b.confidence)) else {
            continue;
        };
        detected += 1;
        if let Some(landmarks) = &best.landmarks {
            let estimate = sweep_core::estimate(landmarks, PoseSample::default(), &calibration.pose);
            if !estimate.degenerate {
                poses.push(estimate.raw);
            }
        }
    }
    controller.close(session.id).await;

    println!("  frames sampled: {frames}, dark: {dark}, with face: {detected}");
    if let Some((yaw, pitch)) = pose_ranges(&poses) {
        println!("  raw yaw   {:>7.1} .. {:>7.1}", yaw.0, yaw.1);
        println!("  raw pitch {:>7.1} .. {:>7.1}", pitch.0, pitch.1);
    }
    Ok(())
}

fn pose_ranges(poses: &[PoseSample]) -> Option<((f32, f32), (f32, f32))> {
    let first = poses.first()?;
    let init = ((first.yaw, first.yaw), (first.pitch, first.pitch));
    Some(poses.iter().fold(init, |((ylo, yhi), (plo, phi)), p| {
        ((ylo.min(p.yaw), yhi.max(p.yaw)), (plo.min(p.pitch), phi.max(p.pitch)))
    }))
}
