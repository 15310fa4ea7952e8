//! stream_probe - run inference against one source from the command line
//!
//! Opens a configured camera, an ad-hoc URL, a video file or a still image,
//! prints one JSON line per emitted frame, and optionally writes annotated
//! JPEG snapshots and the first frame in its transport encoding.

use anyhow::{anyhow, Context, Result};
use clap::{ArgGroup, Parser};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use camstream::{
    codec,
    config::AppConfig,
    detect::run_detector,
    ingest::CameraSettings,
    prepare_source, BackendRegistry, DetectionResult, Frame, PreparedSource, RateLimiter,
    SessionEnd, SourceKind, StreamSession,
};

const URL_CAMERA_ID: &str = "cli";

#[derive(Parser, Debug)]
#[command(author, version, about)]
#[command(group(ArgGroup::new("source").required(true).args(["camera", "url", "video", "image"])))]
struct Args {
    /// JSON config file (same layout as camstreamd).
    #[arg(long, env = "CAMSTREAM_CONFIG")]
    config: Option<PathBuf>,
    /// Configured camera id.
    #[arg(long)]
    camera: Option<String>,
    /// Source URI (rtsp://, rtsps://, stub://).
    #[arg(long)]
    url: Option<String>,
    /// Local video file.
    #[arg(long)]
    video: Option<PathBuf>,
    /// Local image file.
    #[arg(long)]
    image: Option<PathBuf>,
    /// Stop after this many seconds (0 runs until the source ends or Ctrl-C).
    #[arg(long, default_value_t = 10)]
    seconds: u64,
    /// Inference rate override.
    #[arg(long)]
    fps: Option<u32>,
    /// Reconnect budget override.
    #[arg(long)]
    reset_attempts: Option<u32>,
    /// Reconnect delay override, in seconds.
    #[arg(long)]
    reset_delay: Option<u64>,
    /// Detector backend override.
    #[arg(long)]
    backend: Option<String>,
    /// Directory for annotated JPEG snapshots of every emitted frame.
    #[arg(long, value_name = "DIR")]
    snapshot_dir: Option<PathBuf>,
    /// Write the first frame as transport JSON to this file.
    #[arg(long, value_name = "FILE")]
    emit_json: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = AppConfig::load_from(args.config.as_deref())?;
    if let Some(fps) = args.fps {
        config.stream.target_fps = fps;
    }
    if let Some(attempts) = args.reset_attempts {
        config.stream.reset_attempts = attempts;
    }
    if let Some(delay) = args.reset_delay {
        config.stream.reset_delay = Duration::from_secs(delay);
    }
    if let Some(backend) = &args.backend {
        config.backend = backend.clone();
    }

    let kind = if let Some(camera) = &args.camera {
        SourceKind::Stream(camera.to_lowercase())
    } else if let Some(url) = &args.url {
        config
            .cameras
            .insert(URL_CAMERA_ID.to_string(), CameraSettings::from_url(url.clone()));
        SourceKind::Stream(URL_CAMERA_ID.to_string())
    } else if let Some(video) = &args.video {
        SourceKind::Video(video.clone())
    } else if let Some(image) = &args.image {
        SourceKind::Image(image.clone())
    } else {
        return Err(anyhow!("one of --camera, --url, --video or --image is required"));
    };

    let label = match &kind {
        SourceKind::Stream(camera) => camera.clone(),
        SourceKind::Video(path) | SourceKind::Image(path) => path.display().to_string(),
    };
    let registry = BackendRegistry::builtin(&config.backend, config.model.clone())?;
    let backend = registry.instantiate_default()?;
    if let Some(dir) = &args.snapshot_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create snapshot dir {}", dir.display()))?;
    }

    match prepare_source(&kind, &config.cameras, config.stream.reconnect_policy())? {
        PreparedSource::Still(frame) => {
            let detections = run_detector(&backend, &frame)?;
            report(&args, 1, frame, &detections, config.stream.jpeg_quality)?;
        }
        PreparedSource::Live(source) => {
            let mut session = StreamSession::new(
                label,
                source,
                RateLimiter::from_fps(config.stream.target_fps),
                backend,
            );
            session.start()?;

            let (tx, rx) = mpsc::channel::<()>();
            let ctrlc_handle = session.handle();
            ctrlc::set_handler(move || ctrlc_handle.stop())
                .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;
            if args.seconds > 0 {
                let timer_handle = session.handle();
                let limit = Duration::from_secs(args.seconds);
                thread::spawn(move || {
                    if rx.recv_timeout(limit).is_err() {
                        timer_handle.stop();
                    }
                });
            }

            let quality = config.stream.jpeg_quality;
            let end = session.run(|emission| {
                report(
                    &args,
                    emission.sequence,
                    emission.frame,
                    &emission.detections,
                    quality,
                )
            });
            let _ = tx.send(());

            let stats = session.source_stats();
            log::info!(
                "source {} {} after {} frames ({} reconnects, {} failures)",
                stats.uri,
                match end {
                    SessionEnd::Stopped => "stopped",
                    SessionEnd::Exhausted => "ended",
                },
                stats.frames_read,
                stats.reconnects,
                stats.failures
            );
        }
    }
    Ok(())
}

fn report(
    args: &Args,
    sequence: u64,
    mut frame: Frame,
    detections: &DetectionResult,
    quality: u8,
) -> Result<()> {
    println!(
        "{}",
        json!({
            "sequence": sequence,
            "shape": frame.shape().as_array(),
            "processing_time": detections.processing_time,
            "results": detections.results,
        })
    );

    if sequence == 1 {
        if let Some(path) = &args.emit_json {
            let encoded = codec::encode(&frame);
            std::fs::write(path, serde_json::to_vec(&encoded)?)
                .with_context(|| format!("write {}", path.display()))?;
        }
    }
    if let Some(dir) = &args.snapshot_dir {
        frame.draw_detections(detections);
        write_snapshot(dir, sequence, &frame.encode_jpeg(quality)?)?;
    }
    Ok(())
}

fn write_snapshot(dir: &Path, sequence: u64, jpeg: &[u8]) -> Result<()> {
    let path = dir.join(format!("frame_{:06}.jpg", sequence));
    std::fs::write(&path, jpeg).with_context(|| format!("write {}", path.display()))
}
