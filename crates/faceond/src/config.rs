use anyhow::{bail, Context, Result};
use faceon_core::identity::DEFAULT_MORPH_DURATION;
use faceon_core::{RunMode, TunableSnapshot};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Initial mode and tunables, the `[tunables]` table of the config file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunableConfig {
    pub mode: RunMode,
    #[serde(flatten)]
    pub values: TunableSnapshot,
}

/// Daemon configuration, loaded from TOML with `FACEON_*` overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// V4L2 capture device path.
    pub camera_device: String,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Flip frames horizontally before processing.
    pub mirror: bool,
    /// Frames discarded at startup while exposure settles.
    pub warmup_frames: usize,
    /// Directory containing the ONNX model files.
    pub model_dir: PathBuf,
    /// Per-source cache files (`<stem>.safetensors`).
    pub embeddings_dir: PathBuf,
    /// Cached latent projection extracted from the swap model.
    pub emap_cache: PathBuf,
    /// Source photos scanned at startup.
    pub sources_dir: PathBuf,
    /// Run the detector every N frames.
    pub detection_interval: u32,
    pub morph_duration_secs: f64,
    /// FIFO or v4l2loopback node receiving BGRA frames.
    pub sink_path: PathBuf,
    pub sink_width: u32,
    pub sink_height: u32,
    pub sink_fps: u32,
    pub tunables: TunableConfig,
}

impl Default for Config {
    fn default() -> Self {
        let data_dir = data_dir();
        Self {
            camera_device: "/dev/video0".to_string(),
            capture_width: 1280,
            capture_height: 720,
            mirror: true,
            warmup_frames: 4,
            model_dir: data_dir.join("models"),
            embeddings_dir: data_dir.join("embeddings"),
            emap_cache: data_dir.join("emap").join("emap_cache.safetensors"),
            sources_dir: data_dir.join("sources"),
            detection_interval: 1,
            morph_duration_secs: DEFAULT_MORPH_DURATION.as_secs_f64(),
            sink_path: PathBuf::from("/dev/video10"),
            sink_width: 1920,
            sink_height: 1080,
            sink_fps: 30,
            tunables: TunableConfig::default(),
        }
    }
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
        .join("faceon")
}

/// `FACEON_CONFIG`, else `$XDG_CONFIG_HOME/faceon/faceond.toml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("FACEON_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("faceon")
        .join("faceond.toml")
}

impl Config {
    /// Load the config file (if present), apply environment overrides and validate.
    pub fn load() -> Result<Self> {
        let path = default_config_path();
        let mut config = Self::from_file(&path)?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML file. A missing file yields the defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => {
                let config = Self::from_toml(&text).with_context(|| format!("parsing {}", path.display()))?;
                tracing::info!(path = %path.display(), "loaded config file");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Apply `FACEON_*` overrides. `lookup` is `std::env::var` in production.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(v) = lookup("FACEON_CAMERA_DEVICE") {
            self.camera_device = v;
        }
        override_parsed(&lookup, "FACEON_CAPTURE_WIDTH", &mut self.capture_width)?;
        override_parsed(&lookup, "FACEON_CAPTURE_HEIGHT", &mut self.capture_height)?;
        if let Some(v) = lookup("FACEON_MIRROR") {
            self.mirror = v != "0" && !v.eq_ignore_ascii_case("false");
        }
        override_parsed(&lookup, "FACEON_WARMUP_FRAMES", &mut self.warmup_frames)?;
        override_path(&lookup, "FACEON_MODEL_DIR", &mut self.model_dir);
        override_path(&lookup, "FACEON_EMBEDDINGS_DIR", &mut self.embeddings_dir);
        override_path(&lookup, "FACEON_EMAP_CACHE", &mut self.emap_cache);
        override_path(&lookup, "FACEON_SOURCES_DIR", &mut self.sources_dir);
        override_parsed(&lookup, "FACEON_DETECTION_INTERVAL", &mut self.detection_interval)?;
        override_parsed(&lookup, "FACEON_MORPH_DURATION_SECS", &mut self.morph_duration_secs)?;
        override_path(&lookup, "FACEON_SINK_PATH", &mut self.sink_path);
        override_parsed(&lookup, "FACEON_SINK_WIDTH", &mut self.sink_width)?;
        override_parsed(&lookup, "FACEON_SINK_HEIGHT", &mut self.sink_height)?;
        override_parsed(&lookup, "FACEON_SINK_FPS", &mut self.sink_fps)?;
        if let Some(v) = lookup("FACEON_MODE") {
            self.tunables.mode = v.parse().map_err(|e| anyhow::anyhow!("FACEON_MODE: {e}"))?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.detection_interval == 0 {
            bail!("detection_interval must be at least 1");
        }
        if !self.morph_duration_secs.is_finite() || self.morph_duration_secs <= 0.0 {
            bail!("morph_duration_secs must be positive, got {}", self.morph_duration_secs);
        }
        if self.sink_width == 0 || self.sink_height == 0 {
            bail!("sink size must be non-zero, got {}x{}", self.sink_width, self.sink_height);
        }
        if self.capture_width == 0 || self.capture_height == 0 {
            bail!("capture size must be non-zero");
        }
        Ok(())
    }

    pub fn morph_duration(&self) -> Duration {
        Duration::from_secs_f64(self.morph_duration_secs)
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join("det_10g.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join("w600k_r50.onnx")
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the inswapper model.
    pub fn inswapper_model_path(&self) -> String {
        self.model_dir
            .join("inswapper_128.onnx")
            .to_string_lossy()
            .into_owned()
    }
}

fn override_parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut T) -> Result<()>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(v) = lookup(key) {
        *slot = v
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{key}={v:?}: {e}"))?;
    }
    Ok(())
}

fn override_path(lookup: &impl Fn(&str) -> Option<String>, key: &str, slot: &mut PathBuf) {
    if let Some(v) = lookup(key) {
        *slot = PathBuf::from(v);
    }
}
