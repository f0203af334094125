use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use faceon_core::detector::ScrfdDetector;
use faceon_core::identity::DEFAULT_MORPH_DURATION;
use faceon_core::library;
use faceon_core::recognizer::ArcFaceEmbedder;
use faceon_core::swapper::{InswapperModel, Synthesizer};
use faceon_core::{FaceSwapPipeline, Raster, RunMode, SharedControls};
use faceon_hw::Camera;
use std::path::{Path, PathBuf};
use std::time::Instant;

// D-Bus proxy for the daemon's control surface.
#[zbus::proxy(
    interface = "org.faceon.FaceOn1",
    default_service = "org.faceon.FaceOn1",
    default_path = "/org/faceon/FaceOn1"
)]
trait FaceOn {
    async fn set_mode(&self, mode: &str) -> zbus::Result<()>;
    async fn mode(&self) -> zbus::Result<String>;
    async fn set_tunable(&self, name: &str, value: f64) -> zbus::Result<()>;
    async fn tunables(&self) -> zbus::Result<String>;
    async fn select_source(&self, slot: &str, index: u32) -> zbus::Result<String>;
    async fn scroll_source(&self, slot: &str, delta: i32) -> zbus::Result<u32>;
    async fn list_sources(&self) -> zbus::Result<String>;
    async fn scroll_archetype(&self, delta: i32) -> zbus::Result<i64>;
    async fn reset_morph(&self) -> zbus::Result<()>;
    async fn set_paused(&self, paused: bool) -> zbus::Result<()>;
    async fn save_blend(&self) -> zbus::Result<String>;
    async fn status(&self) -> zbus::Result<String>;
    async fn shutdown(&self) -> zbus::Result<()>;
}

#[derive(Parser)]
#[command(name = "faceon", about = "FaceOn live face swap control CLI")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Set the processing mode
    Mode {
        /// off, pixelate, swap, blend, morph or archetype (omit to print the current mode)
        mode: Option<String>,
    },
    /// Set a tunable (e.g. mask_feather 61)
    Set {
        name: String,
        #[arg(allow_negative_numbers = true)]
        value: f64,
    },
    /// Print all tunables
    Tunables,
    /// Select a source by index for slot a or b
    Select { slot: String, index: u32 },
    /// Move a slot's selection, wrapping around the roster
    Scroll {
        slot: String,
        #[arg(allow_negative_numbers = true)]
        delta: i32,
    },
    /// List loaded sources
    Sources,
    /// Move the archetype index
    Archetype {
        #[arg(allow_negative_numbers = true)]
        delta: i32,
    },
    /// Restart the morph cycle
    ResetMorph,
    /// Freeze on the current frame
    Pause,
    /// Resume live capture
    Resume,
    /// Save the current blend as a new source (blend mode only)
    SaveBlend,
    /// Show daemon status
    Status,
    /// Stop the daemon
    Shutdown,
    /// Swap the first face of SOURCE onto every face in TARGET, offline
    SwapImage {
        source: PathBuf,
        target: PathBuf,
        #[arg(short, long)]
        output: PathBuf,
        /// Directory containing det_10g.onnx, w600k_r50.onnx and inswapper_128.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
    /// Run camera diagnostics (bypasses the daemon)
    CameraTest {
        #[arg(short, long, default_value = "/dev/video0")]
        device: String,
        #[arg(long, default_value_t = 30)]
        frames: usize,
        /// Save the last frame as an image
        #[arg(long)]
        save: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::SwapImage {
            source,
            target,
            output,
            model_dir,
        } => {
            let model_dir = model_dir.unwrap_or_else(default_model_dir);
            tokio::task::spawn_blocking(move || swap_image(&source, &target, &output, &model_dir)).await?
        }
        Commands::CameraTest { device, frames, save } => {
            tokio::task::spawn_blocking(move || camera_test(&device, frames, save.as_deref())).await?
        }
        command => control(command).await,
    }
}

async fn control(command: Commands) -> Result<()> {
    let conn = zbus::Connection::session().await?;
    let proxy = FaceOnProxy::new(&conn)
        .await
        .context("cannot reach faceond on the session bus")?;

    match command {
        Commands::Mode { mode: Some(mode) } => {
            proxy.set_mode(&mode).await?;
            println!("mode: {}", proxy.mode().await?);
        }
        Commands::Mode { mode: None } => println!("{}", proxy.mode().await?),
        Commands::Set { name, value } => {
            proxy.set_tunable(&name, value).await?;
            println!("{name} = {value}");
        }
        Commands::Tunables => print_json(&proxy.tunables().await?)?,
        Commands::Select { slot, index } => {
            let name = proxy.select_source(&slot, index).await?;
            println!("{slot}: [{index}] {name}");
        }
        Commands::Scroll { slot, delta } => {
            let index = proxy.scroll_source(&slot, delta).await?;
            println!("{slot}: [{index}]");
        }
        Commands::Sources => {
            let list: serde_json::Value = serde_json::from_str(&proxy.list_sources().await?)?;
            let entries = list.as_array().map(Vec::as_slice).unwrap_or_default();
            if entries.is_empty() {
                println!("No sources loaded");
            }
            for entry in entries {
                let marker = match (entry["selected_a"].as_bool(), entry["selected_b"].as_bool()) {
                    (Some(true), Some(true)) => "AB",
                    (Some(true), _) => "A ",
                    (_, Some(true)) => " B",
                    _ => "  ",
                };
                println!(
                    "{marker} {:>3}  {}  ({})",
                    entry["index"].as_u64().unwrap_or_default(),
                    entry["name"].as_str().unwrap_or_default(),
                    entry["kind"].as_str().unwrap_or_default()
                );
            }
        }
        Commands::Archetype { delta } => println!("archetype: {}", proxy.scroll_archetype(delta).await?),
        Commands::ResetMorph => proxy.reset_morph().await?,
        Commands::Pause => proxy.set_paused(true).await?,
        Commands::Resume => proxy.set_paused(false).await?,
        Commands::SaveBlend => println!("saved: {}", proxy.save_blend().await?),
        Commands::Status => print_json(&proxy.status().await?)?,
        Commands::Shutdown => proxy.shutdown().await?,
        Commands::SwapImage { .. } | Commands::CameraTest { .. } => bail!("offline command sent to daemon"),
    }
    Ok(())
}

fn print_json(text: &str) -> Result<()> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}

fn default_model_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("FACEON_MODEL_DIR") {
        return PathBuf::from(dir);
    }
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceon/models")
}

fn swap_image(source: &Path, target: &Path, output: &Path, model_dir: &Path) -> Result<()> {
    tracing::debug!(model_dir = %model_dir.display(), "loading models");
    let model = |name: &str| model_dir.join(name).to_string_lossy().into_owned();
    let mut detector = ScrfdDetector::load(&model("det_10g.onnx"))?;
    let mut embedder = ArcFaceEmbedder::load(&model("w600k_r50.onnx"))?;
    let swapper = InswapperModel::load(&model("inswapper_128.onnx"), None)?;

    let controls = SharedControls::new(RunMode::Swap, Default::default());
    let mouth_y_offset = controls.tunables().mouth_y_offset;
    let face = library::process_image(source, &mut detector, &mut embedder, mouth_y_offset)?;
    println!("Source: {} (score {:.2})", face.name, face.face.as_ref().map_or(0.0, |f| f.score));
    controls.roster().replace(vec![face]);

    let target_image = image::open(target)
        .with_context(|| format!("reading {}", target.display()))?
        .to_rgb8();
    let frame = Raster::from_rgb_image(target_image);

    let mut pipeline = FaceSwapPipeline::new(
        Box::new(detector),
        Synthesizer::new(Box::new(swapper)),
        1,
        DEFAULT_MORPH_DURATION,
    );
    let start = Instant::now();
    let swapped = pipeline.process_frame(&frame, &controls);
    println!("Swapped in {:.0} ms", start.elapsed().as_secs_f64() * 1000.0);

    let Some(rgb) = swapped.to_rgb_image() else {
        bail!("pipeline returned a {}-channel frame", swapped.channels());
    };
    rgb.save(output)
        .with_context(|| format!("writing {}", output.display()))?;
    println!("Wrote {}", output.display());
    Ok(())
}

fn camera_test(device: &str, frames: usize, save: Option<&Path>) -> Result<()> {
    println!("Available capture devices:");
    for info in Camera::list_devices() {
        println!("  {}  {} ({}, {})", info.path, info.name, info.driver, info.bus);
    }

    let mut camera = Camera::open(device, 1280, 720)?;
    println!(
        "Opened {device}: {}x{} {:?}",
        camera.width,
        camera.height,
        camera.pixel_format()
    );

    let start = Instant::now();
    let mut last = None;
    for _ in 0..frames {
        let frame = camera.capture_frame()?;
        last = Some(frame);
    }
    let elapsed = start.elapsed().as_secs_f64();
    if frames > 0 && elapsed > 0.0 {
        println!("Captured {frames} frames in {elapsed:.2}s ({:.1} fps)", frames as f64 / elapsed);
    }

    if let Some(frame) = last {
        println!("Last frame: seq {} brightness {:.1}", frame.sequence, frame.avg_brightness());
        if let Some(path) = save {
            let Some(rgb) = frame.image.to_rgb_image() else {
                bail!("captured frame is not 3-channel");
            };
            rgb.save(path)
                .with_context(|| format!("writing {}", path.display()))?;
            println!("Saved {}", path.display());
        }
    }
    Ok(())
}
