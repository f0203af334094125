use faceon_core::detector::{DetectorError, ScrfdDetector};
use faceon_core::library;
use faceon_core::raster::RasterError;
use faceon_core::recognizer::{ArcFaceEmbedder, RecognizerError};
use faceon_core::swapper::{InswapperModel, SwapError, Synthesizer};
use faceon_core::{FaceSwapPipeline, Raster, SharedControls};
use faceon_hw::{Camera, CameraError, FrameSource, OutputSink, RawVideoSink, SinkError};
use image::imageops::FilterType;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;

use crate::config::Config;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("camera error: {0}")]
    Camera(#[from] CameraError),
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("swapper error: {0}")]
    Swapper(#[from] SwapError),
    #[error("output sink error: {0}")]
    Sink(#[from] SinkError),
    #[error("output conversion failed: {0}")]
    Raster(#[from] RasterError),
    #[error("failed to spawn render thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("render thread panicked")]
    Panicked,
}

/// Handle to the render thread.
pub struct EngineHandle {
    thread: JoinHandle<Result<(), EngineError>>,
}

impl EngineHandle {
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Wait for the render loop to exit and return its outcome.
    pub fn join(self) -> Result<(), EngineError> {
        self.thread.join().map_err(|_| EngineError::Panicked)?
    }
}

/// Open the camera, load all three models, open the sink and load the
/// source roster, then start the render loop on a dedicated OS thread.
///
/// Any resource failure aborts startup; nothing is retried.
pub fn spawn_engine(config: &Config, controls: Arc<SharedControls>) -> Result<EngineHandle, EngineError> {
    let mut camera = Camera::open(&config.camera_device, config.capture_width, config.capture_height)?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    if config.warmup_frames > 0 {
        tracing::info!(count = config.warmup_frames, "discarding warmup frames");
        camera.warm_up(config.warmup_frames)?;
    }

    let scrfd_path = config.scrfd_model_path();
    let mut detector = ScrfdDetector::load(&scrfd_path)?;
    tracing::info!(path = %scrfd_path, "SCRFD detector loaded");

    let arcface_path = config.arcface_model_path();
    let mut embedder = ArcFaceEmbedder::load(&arcface_path)?;
    tracing::info!(path = %arcface_path, "ArcFace recognizer loaded");

    let inswapper_path = config.inswapper_model_path();
    let swapper = InswapperModel::load(&inswapper_path, Some(&config.emap_cache))?;
    tracing::info!(path = %inswapper_path, "inswapper loaded");

    tracing::info!(path = %config.sink_path.display(), "opening output sink (a FIFO blocks until read)");
    let sink = RawVideoSink::open(&config.sink_path, config.sink_width, config.sink_height, config.sink_fps)?;

    let sources = library::bootstrap_sources(
        &config.sources_dir,
        &config.embeddings_dir,
        &mut detector,
        &mut embedder,
        controls.tunables().mouth_y_offset,
    );
    controls.roster().replace(sources);

    let pipeline = FaceSwapPipeline::new(
        Box::new(detector),
        Synthesizer::new(Box::new(swapper)),
        config.detection_interval,
        config.morph_duration(),
    );

    let mirror = config.mirror;
    let thread = std::thread::Builder::new()
        .name("faceon-render".into())
        .spawn(move || {
            let mut camera = camera;
            let mut sink = sink;
            let mut pipeline = pipeline;
            render_loop(&mut camera, &mut pipeline, &mut sink, &controls, mirror)
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { thread })
}

/// Capture → mirror → pipeline → resize/convert → publish, until the
/// controls stop the run or capture/output fails.
///
/// On exit, for whatever reason, the running flag is cleared so the
/// control surface and the daemon's main task notice.
pub fn render_loop(
    source: &mut dyn FrameSource,
    pipeline: &mut FaceSwapPipeline,
    sink: &mut dyn OutputSink,
    controls: &SharedControls,
    mirror: bool,
) -> Result<(), EngineError> {
    tracing::info!("render loop started");
    let result = run_frames(source, pipeline, sink, controls, mirror);
    match &result {
        Ok(()) => tracing::info!(frames = controls.frames_rendered(), "render loop stopped"),
        Err(e) => tracing::error!(error = %e, "render loop failed"),
    }
    controls.stop();
    result
}

fn run_frames(
    source: &mut dyn FrameSource,
    pipeline: &mut FaceSwapPipeline,
    sink: &mut dyn OutputSink,
    controls: &SharedControls,
    mirror: bool,
) -> Result<(), EngineError> {
    let mut last_frame: Option<Raster> = None;

    while controls.is_running() {
        let frame = match last_frame.take() {
            Some(frame) if controls.is_paused() => frame,
            _ => {
                let mut image = source.capture()?.image;
                if mirror {
                    image.flip_horizontal();
                }
                image
            }
        };

        let rendered = pipeline.process_frame(&frame, controls);
        let output = prepare_output(&rendered, sink.width(), sink.height())?;
        sink.publish(&output)?;
        controls.record_frame();
        last_frame = Some(frame);
    }
    Ok(())
}

/// Resize a BGR frame to the sink's exact size and convert to BGRA.
pub fn prepare_output(frame: &Raster, width: u32, height: u32) -> Result<Raster, RasterError> {
    if frame.width() == width && frame.height() == height {
        frame.to_bgra()
    } else {
        frame.resized(width, height, FilterType::Triangle)?.to_bgra()
    }
}
