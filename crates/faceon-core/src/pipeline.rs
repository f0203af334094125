//! Per-frame orchestration: detection → identity → synthesis → compositing.

use std::time::{Duration, Instant};

use crate::compositor;
use crate::controls::{RunMode, SharedControls, Slot, TunableSnapshot};
use crate::identity::{self, MorphState};
use crate::inference::{BoxError, FaceDetector};
use crate::raster::Raster;
use crate::swapper::Synthesizer;
use crate::types::{ActiveIdentity, DetectedFace};

/// Decorator that runs detection every N frames and reuses the last result
/// in between. An empty cache forces a fresh detection regardless of the
/// interval.
///
/// Frames that need no faces must be reported through [`skip_frame`] so
/// the count stays in frames and a cache never outlives the frames it
/// was detected on.
///
/// [`skip_frame`]: IntervalDetector::skip_frame
pub struct IntervalDetector {
    inner: Box<dyn FaceDetector>,
    interval: u64,
    frame_count: u64,
    last_faces: Vec<DetectedFace>,
}

impl IntervalDetector {
    /// `interval` below 1 is treated as 1 (detect every frame).
    pub fn new(inner: Box<dyn FaceDetector>, interval: u32) -> Self {
        Self {
            inner,
            interval: u64::from(interval.max(1)),
            frame_count: 0,
            last_faces: Vec::new(),
        }
    }

    /// Count a frame rendered without detection and drop the cached faces.
    pub fn skip_frame(&mut self) {
        self.frame_count += 1;
        self.last_faces.clear();
    }
}

impl FaceDetector for IntervalDetector {
    fn detect(&mut self, frame: &Raster) -> Result<Vec<DetectedFace>, BoxError> {
        let due = self.frame_count % self.interval == 0;
        self.frame_count += 1;
        if due || self.last_faces.is_empty() {
            self.last_faces = self.inner.detect(frame)?;
        }
        Ok(self.last_faces.clone())
    }
}

/// Owns the models and the per-run state (detection cache, morph timer).
pub struct FaceSwapPipeline {
    detector: IntervalDetector,
    synthesizer: Synthesizer,
    morph: MorphState,
}

impl FaceSwapPipeline {
    pub fn new(
        detector: Box<dyn FaceDetector>,
        synthesizer: Synthesizer,
        detection_interval: u32,
        morph_duration: Duration,
    ) -> Self {
        Self {
            detector: IntervalDetector::new(detector, detection_interval),
            synthesizer,
            morph: MorphState::new(morph_duration, Instant::now()),
        }
    }

    pub fn synthesizer(&self) -> &Synthesizer {
        &self.synthesizer
    }

    #[cfg(test)]
    fn morph_pair(&self) -> (usize, usize) {
        self.morph.pair()
    }

    pub fn process_frame(&mut self, frame: &Raster, controls: &SharedControls) -> Raster {
        self.process_frame_at(frame, controls, Instant::now())
    }

    /// Render one frame with the controls as they are right now.
    ///
    /// Mode and tunables are read once up front, so a change made mid-frame
    /// shows up on the next frame. Any per-face failure leaves that face
    /// untouched.
    pub fn process_frame_at(&mut self, frame: &Raster, controls: &SharedControls, now: Instant) -> Raster {
        let mode = controls.mode();
        let tunables = controls.tunables();
        if controls.take_morph_reset() {
            self.morph.reset(now);
            tracing::debug!("morph reset");
        }

        let mut out = frame.clone();
        match mode {
            RunMode::Off => {
                controls.publish_active(None);
                self.detector.skip_frame();
            }
            RunMode::Pixelate => {
                controls.publish_active(None);
                let faces = self.detect(frame);
                compositor::pixelate(&mut out, &faces);
            }
            _ => {
                let identity = self.resolve_identity(mode, &tunables, controls, now);
                controls.publish_active(identity.clone());
                match identity {
                    Some(identity) => {
                        let faces = self.detect(frame);
                        self.swap_faces(&mut out, &faces, &identity, &tunables);
                    }
                    None => self.detector.skip_frame(),
                }
            }
        }
        out
    }

    /// The identity a synthesizing mode conditions on this frame, if any.
    pub fn resolve_identity(
        &mut self,
        mode: RunMode,
        tunables: &TunableSnapshot,
        controls: &SharedControls,
        now: Instant,
    ) -> Option<ActiveIdentity> {
        let roster = controls.roster();
        match mode {
            RunMode::Off | RunMode::Pixelate => None,
            RunMode::Swap => roster.selected(Slot::A).map(|a| identity::direct(&a)),
            RunMode::Blend => {
                let a = roster.selected(Slot::A)?;
                let b = roster.selected(Slot::B)?;
                Some(identity::blend(&a, &b, tunables.blend_alpha))
            }
            RunMode::Morph => self.morph.advance(now, &roster.sources()),
            RunMode::Archetype => {
                identity::archetype(self.synthesizer.latent_projection(), controls.archetype_index())
            }
        }
    }

    fn detect(&mut self, frame: &Raster) -> Vec<DetectedFace> {
        match self.detector.detect(frame) {
            Ok(faces) => faces,
            Err(e) => {
                tracing::warn!(error = %e, "detection failed; frame passes through");
                Vec::new()
            }
        }
    }

    fn swap_faces(
        &mut self,
        out: &mut Raster,
        faces: &[DetectedFace],
        identity: &ActiveIdentity,
        tunables: &TunableSnapshot,
    ) {
        let params = tunables.composite_params();
        for face in faces {
            let (fake, forward) = match self
                .synthesizer
                .synthesize(out, face, identity, tunables.mouth_y_offset)
            {
                Ok(result) => result,
                Err(e) => {
                    tracing::debug!(error = %e, score = face.score, "no swap for face this frame");
                    continue;
                }
            };
            let Some(inverse) = forward.invert() else {
                tracing::debug!("singular alignment matrix; skipping face");
                continue;
            };
            compositor::composite(out, &fake, &inverse, &face.bbox, &params);
        }
    }
}
