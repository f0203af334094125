//! State shared between the render loop and the control surface.
//!
//! Every tunable is an independent atomic scalar. The render loop takes a
//! [`TunableSnapshot`] once per frame; a snapshot taken while a client is
//! writing several tunables may mix old and new values across fields. That
//! is acceptable: each field is meaningful on its own and no invariant spans
//! two fields. A single field is never torn.
//!
//! Source selections are `Arc<SourceFace>` swapped wholesale under a lock,
//! so the loop never sees a partially updated face.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;

use crate::compositor::{AffineNudge, CompositeParams};
use crate::mask::MaskParams;
use crate::types::{ActiveIdentity, SourceFace};

#[derive(Error, Debug, PartialEq)]
pub enum ControlError {
    #[error("unknown mode {0:?} (expected off, pixelate, swap, blend, morph or archetype)")]
    UnknownMode(String),
    #[error("unknown tunable {0:?}")]
    UnknownTunable(String),
    #[error("invalid value {value} for {name}: {reason}")]
    InvalidValue {
        name: &'static str,
        value: f64,
        reason: &'static str,
    },
    #[error("unknown source slot {0:?} (expected a or b)")]
    UnknownSlot(String),
    #[error("no sources loaded")]
    EmptyRoster,
    #[error("source index {index} out of range (roster has {len})")]
    IndexOutOfRange { index: usize, len: usize },
}

/// What the render loop does with each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum RunMode {
    #[default]
    Off = 0,
    Pixelate = 1,
    Swap = 2,
    Blend = 3,
    Morph = 4,
    Archetype = 5,
}

impl RunMode {
    pub const ALL: [RunMode; 6] = [
        RunMode::Off,
        RunMode::Pixelate,
        RunMode::Swap,
        RunMode::Blend,
        RunMode::Morph,
        RunMode::Archetype,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RunMode::Off => "off",
            RunMode::Pixelate => "pixelate",
            RunMode::Swap => "swap",
            RunMode::Blend => "blend",
            RunMode::Morph => "morph",
            RunMode::Archetype => "archetype",
        }
    }

    fn from_u8(v: u8) -> RunMode {
        RunMode::ALL.get(v as usize).copied().unwrap_or_default()
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunMode {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RunMode::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ControlError::UnknownMode(s.to_string()))
    }
}

/// `f32` stored as its bit pattern.
#[derive(Debug, Default)]
pub struct AtomicF32(AtomicU32);

impl AtomicF32 {
    pub fn new(v: f32) -> Self {
        Self(AtomicU32::new(v.to_bits()))
    }

    pub fn load(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }

    pub fn store(&self, v: f32) {
        self.0.store(v.to_bits(), Ordering::Relaxed)
    }
}

/// Plain-value copy of all tunables, as read for one frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TunableSnapshot {
    pub roi_margin: i32,
    pub mask_feather: i32,
    pub mask_core_tightness: i32,
    pub mask_expansion: i32,
    pub affine_x: f32,
    pub affine_y: f32,
    pub affine_scale: f32,
    pub mouth_y_offset: f32,
    pub blend_alpha: f32,
}

impl Default for TunableSnapshot {
    fn default() -> Self {
        Self {
            roi_margin: 76,
            mask_feather: 101,
            mask_core_tightness: 41,
            mask_expansion: -50,
            affine_x: 0.0,
            affine_y: 0.0,
            affine_scale: 1.0,
            mouth_y_offset: -20.0,
            blend_alpha: 0.5,
        }
    }
}

impl TunableSnapshot {
    /// Every field by its [`TUNABLE_NAMES`] name.
    pub fn entries(&self) -> [(&'static str, f64); 9] {
        [
            ("roi_margin", self.roi_margin as f64),
            ("mask_feather", self.mask_feather as f64),
            ("mask_core_tightness", self.mask_core_tightness as f64),
            ("mask_expansion", self.mask_expansion as f64),
            ("affine_x", self.affine_x as f64),
            ("affine_y", self.affine_y as f64),
            ("affine_scale", self.affine_scale as f64),
            ("mouth_y_offset", self.mouth_y_offset as f64),
            ("blend_alpha", self.blend_alpha as f64),
        ]
    }

    pub fn composite_params(&self) -> CompositeParams {
        CompositeParams {
            roi_margin: self.roi_margin,
            mask: MaskParams {
                expansion: self.mask_expansion,
                feather: self.mask_feather,
                core_tightness: self.mask_core_tightness,
            },
            nudge: AffineNudge {
                scale: self.affine_scale,
                dx: self.affine_x,
                dy: self.affine_y,
            },
        }
    }
}

/// Names accepted by [`SharedControls::set_tunable`].
pub const TUNABLE_NAMES: [&str; 9] = [
    "roi_margin",
    "mask_feather",
    "mask_core_tightness",
    "mask_expansion",
    "affine_x",
    "affine_y",
    "affine_scale",
    "mouth_y_offset",
    "blend_alpha",
];

#[derive(Debug)]
struct Tunables {
    roi_margin: AtomicI32,
    mask_feather: AtomicI32,
    mask_core_tightness: AtomicI32,
    mask_expansion: AtomicI32,
    affine_x: AtomicF32,
    affine_y: AtomicF32,
    affine_scale: AtomicF32,
    mouth_y_offset: AtomicF32,
    blend_alpha: AtomicF32,
}

impl Tunables {
    fn new(s: &TunableSnapshot) -> Self {
        Self {
            roi_margin: AtomicI32::new(s.roi_margin),
            mask_feather: AtomicI32::new(s.mask_feather),
            mask_core_tightness: AtomicI32::new(s.mask_core_tightness),
            mask_expansion: AtomicI32::new(s.mask_expansion),
            affine_x: AtomicF32::new(s.affine_x),
            affine_y: AtomicF32::new(s.affine_y),
            affine_scale: AtomicF32::new(s.affine_scale),
            mouth_y_offset: AtomicF32::new(s.mouth_y_offset),
            blend_alpha: AtomicF32::new(s.blend_alpha),
        }
    }

    fn snapshot(&self) -> TunableSnapshot {
        TunableSnapshot {
            roi_margin: self.roi_margin.load(Ordering::Relaxed),
            mask_feather: self.mask_feather.load(Ordering::Relaxed),
            mask_core_tightness: self.mask_core_tightness.load(Ordering::Relaxed),
            mask_expansion: self.mask_expansion.load(Ordering::Relaxed),
            affine_x: self.affine_x.load(),
            affine_y: self.affine_y.load(),
            affine_scale: self.affine_scale.load(),
            mouth_y_offset: self.mouth_y_offset.load(),
            blend_alpha: self.blend_alpha.load(),
        }
    }
}

/// Which of the two source selections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Slot {
    A,
    B,
}

impl FromStr for Slot {
    type Err = ControlError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "a" => Ok(Slot::A),
            "b" => Ok(Slot::B),
            _ => Err(ControlError::UnknownSlot(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
struct Selection {
    index: usize,
    face: Arc<SourceFace>,
}

/// The loaded source faces and the A/B selections.
#[derive(Debug, Default)]
pub struct SourceRoster {
    sources: RwLock<Arc<Vec<Arc<SourceFace>>>>,
    selected_a: RwLock<Option<Selection>>,
    selected_b: RwLock<Option<Selection>>,
}

impl SourceRoster {
    /// Install a new roster. A selects index 0, B index 1 (or 0 with a
    /// single source).
    pub fn replace(&self, faces: Vec<SourceFace>) {
        let list: Vec<Arc<SourceFace>> = faces.into_iter().map(Arc::new).collect();
        let a = list.first().map(|f| Selection {
            index: 0,
            face: f.clone(),
        });
        let b_index = usize::from(list.len() > 1);
        let b = list.get(b_index).map(|f| Selection {
            index: b_index,
            face: f.clone(),
        });
        *write(&self.sources) = Arc::new(list);
        *write(&self.selected_a) = a;
        *write(&self.selected_b) = b;
    }

    /// Current list. Cheap: clones the outer `Arc` only.
    pub fn sources(&self) -> Arc<Vec<Arc<SourceFace>>> {
        read(&self.sources).clone()
    }

    pub fn len(&self) -> usize {
        read(&self.sources).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Append a source, returning its index. Existing selections are kept.
    pub fn push(&self, face: SourceFace) -> usize {
        let mut guard = write(&self.sources);
        let mut list: Vec<Arc<SourceFace>> = (**guard).clone();
        list.push(Arc::new(face));
        let index = list.len() - 1;
        *guard = Arc::new(list);
        drop(guard);

        // First source ever: select it in both slots.
        if index == 0 {
            let sources = self.sources();
            for slot in [&self.selected_a, &self.selected_b] {
                *write(slot) = Some(Selection {
                    index: 0,
                    face: sources[0].clone(),
                });
            }
        }
        index
    }

    pub fn select(&self, slot: Slot, index: usize) -> Result<Arc<SourceFace>, ControlError> {
        let sources = self.sources();
        let face = sources.get(index).cloned().ok_or(ControlError::IndexOutOfRange {
            index,
            len: sources.len(),
        })?;
        *write(self.slot(slot)) = Some(Selection {
            index,
            face: face.clone(),
        });
        Ok(face)
    }

    /// Move a selection by `delta`, wrapping in both directions.
    pub fn scroll(&self, slot: Slot, delta: i64) -> Result<usize, ControlError> {
        let len = self.len();
        if len == 0 {
            return Err(ControlError::EmptyRoster);
        }
        let current = self.selected_index(slot).unwrap_or(0) as i64;
        let index = (current + delta).rem_euclid(len as i64) as usize;
        self.select(slot, index)?;
        Ok(index)
    }

    pub fn selected(&self, slot: Slot) -> Option<Arc<SourceFace>> {
        read(self.slot(slot)).as_ref().map(|s| s.face.clone())
    }

    pub fn selected_index(&self, slot: Slot) -> Option<usize> {
        read(self.slot(slot)).as_ref().map(|s| s.index)
    }

    fn slot(&self, slot: Slot) -> &RwLock<Option<Selection>> {
        match slot {
            Slot::A => &self.selected_a,
            Slot::B => &self.selected_b,
        }
    }
}

// A panic while holding one of these locks cannot leave the data half
// written (every write is a single assignment), so poisoning is ignored.
fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Everything the control surface may change while the loop runs.
#[derive(Debug)]
pub struct SharedControls {
    mode: AtomicU8,
    running: AtomicBool,
    paused: AtomicBool,
    tunables: Tunables,
    archetype_index: AtomicI64,
    morph_reset: AtomicBool,
    frames: AtomicU64,
    roster: SourceRoster,
    active: RwLock<Option<Arc<ActiveIdentity>>>,
}

impl Default for SharedControls {
    fn default() -> Self {
        Self::new(RunMode::Off, TunableSnapshot::default())
    }
}

impl SharedControls {
    pub fn new(mode: RunMode, tunables: TunableSnapshot) -> Self {
        Self {
            mode: AtomicU8::new(mode as u8),
            running: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            tunables: Tunables::new(&tunables),
            archetype_index: AtomicI64::new(0),
            morph_reset: AtomicBool::new(false),
            frames: AtomicU64::new(0),
            roster: SourceRoster::default(),
            active: RwLock::new(None),
        }
    }

    pub fn mode(&self) -> RunMode {
        RunMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn set_mode(&self, mode: RunMode) {
        let previous = self.mode.swap(mode as u8, Ordering::AcqRel);
        if previous != mode as u8 {
            tracing::info!(from = %RunMode::from_u8(previous), to = %mode, "mode changed");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask the render loop to exit after the frame in flight.
    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Release);
    }

    pub fn tunables(&self) -> TunableSnapshot {
        self.tunables.snapshot()
    }

    /// Set one tunable by name. Integer tunables are rounded.
    pub fn set_tunable(&self, name: &str, value: f64) -> Result<(), ControlError> {
        let t = &self.tunables;
        let int = |name: &'static str| -> Result<i32, ControlError> {
            if !value.is_finite() || value.abs() > 10_000.0 {
                return Err(ControlError::InvalidValue {
                    name,
                    value,
                    reason: "must be a finite pixel count within ±10000",
                });
            }
            Ok(value.round() as i32)
        };
        let float = |name: &'static str| -> Result<f32, ControlError> {
            if !value.is_finite() {
                return Err(ControlError::InvalidValue {
                    name,
                    value,
                    reason: "must be finite",
                });
            }
            Ok(value as f32)
        };

        match name {
            "roi_margin" => {
                let v = int("roi_margin")?;
                if v < 0 {
                    return Err(ControlError::InvalidValue {
                        name: "roi_margin",
                        value,
                        reason: "must not be negative",
                    });
                }
                t.roi_margin.store(v, Ordering::Relaxed)
            }
            "mask_feather" => t.mask_feather.store(int("mask_feather")?, Ordering::Relaxed),
            "mask_core_tightness" => t
                .mask_core_tightness
                .store(int("mask_core_tightness")?.max(0), Ordering::Relaxed),
            "mask_expansion" => t.mask_expansion.store(int("mask_expansion")?, Ordering::Relaxed),
            "affine_x" => t.affine_x.store(float("affine_x")?),
            "affine_y" => t.affine_y.store(float("affine_y")?),
            "affine_scale" => {
                let v = float("affine_scale")?;
                if v <= 0.0 {
                    return Err(ControlError::InvalidValue {
                        name: "affine_scale",
                        value,
                        reason: "must be positive",
                    });
                }
                t.affine_scale.store(v)
            }
            "mouth_y_offset" => t.mouth_y_offset.store(float("mouth_y_offset")?),
            "blend_alpha" => t.blend_alpha.store(float("blend_alpha")?.clamp(0.0, 1.0)),
            other => return Err(ControlError::UnknownTunable(other.to_string())),
        }
        tracing::debug!(name, value, "tunable updated");
        Ok(())
    }

    /// Set every tunable from a snapshot, validating each like
    /// [`set_tunable`](Self::set_tunable). Stops at the first invalid field.
    pub fn apply_tunables(&self, snapshot: &TunableSnapshot) -> Result<(), ControlError> {
        for (name, value) in snapshot.entries() {
            self.set_tunable(name, value)?;
        }
        Ok(())
    }

    pub fn archetype_index(&self) -> i64 {
        self.archetype_index.load(Ordering::Relaxed)
    }

    /// Move the archetype index by `delta`. It free-scrolls; the pipeline
    /// wraps it against the projection's row count.
    pub fn scroll_archetype(&self, delta: i64) -> i64 {
        self.archetype_index.fetch_add(delta, Ordering::Relaxed) + delta
    }

    pub fn request_morph_reset(&self) {
        self.morph_reset.store(true, Ordering::Release);
    }

    /// Consume a pending morph reset request.
    pub fn take_morph_reset(&self) -> bool {
        self.morph_reset.swap(false, Ordering::AcqRel)
    }

    pub fn record_frame(&self) {
        self.frames.fetch_add(1, Ordering::Relaxed);
    }

    pub fn frames_rendered(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    pub fn roster(&self) -> &SourceRoster {
        &self.roster
    }

    /// Record the identity used for the latest frame (`None` when no
    /// identity was active).
    pub fn publish_active(&self, identity: Option<ActiveIdentity>) {
        *write(&self.active) = identity.map(Arc::new);
    }

    pub fn active_identity(&self) -> Option<Arc<ActiveIdentity>> {
        read(&self.active).clone()
    }

    pub fn status(&self) -> StatusReport {
        let roster = self.roster();
        StatusReport {
            mode: self.mode(),
            running: self.is_running(),
            paused: self.is_paused(),
            frames_rendered: self.frames_rendered(),
            sources: roster.len(),
            selected_a: roster.selected(Slot::A).map(|f| f.name.clone()),
            selected_b: roster.selected(Slot::B).map(|f| f.name.clone()),
            archetype_index: self.archetype_index(),
        }
    }
}

/// Summary for status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub mode: RunMode,
    pub running: bool,
    pub paused: bool,
    pub frames_rendered: u64,
    pub sources: usize,
    pub selected_a: Option<String>,
    pub selected_b: Option<String>,
    pub archetype_index: i64,
}
