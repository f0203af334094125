//! Identity blender.
//!
//! Turns the current source selection into the single embedding the swap
//! synthesizer is conditioned on. None of these functions touch the stored
//! [`SourceFace`] values; each produces a fresh [`ActiveIdentity`].

use ndarray::Array2;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::types::{ActiveIdentity, IdentityEmbedding, SourceFace, SourceKind};

pub const DEFAULT_MORPH_DURATION: Duration = Duration::from_secs(3);

/// Use the source's normalized embedding unchanged.
pub fn direct(source: &SourceFace) -> ActiveIdentity {
    ActiveIdentity {
        embedding: IdentityEmbedding::new(source.embedding.normalized().to_vec()),
        kind: source.kind,
    }
}

/// `(1 - alpha) * a + alpha * b` over the normalized embeddings.
///
/// The result is not renormalized; the synthesizer normalizes on its own.
/// `alpha` is clamped to [0, 1].
pub fn blend(a: &SourceFace, b: &SourceFace, alpha: f32) -> ActiveIdentity {
    ActiveIdentity {
        embedding: IdentityEmbedding::new(lerp(a.embedding.normalized(), b.embedding.normalized(), alpha)),
        kind: SourceKind::Blended,
    }
}

fn lerp(a: &[f32], b: &[f32], alpha: f32) -> Vec<f32> {
    let alpha = alpha.clamp(0.0, 1.0);
    if alpha == 0.0 {
        return a.to_vec();
    }
    if alpha == 1.0 {
        return b.to_vec();
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| (1.0 - alpha) * x + alpha * y)
        .collect()
}

/// Row `index` of the latent projection, wrapping in both directions.
///
/// Returns `None` for an empty matrix.
pub fn archetype(projection: &Array2<f32>, index: i64) -> Option<ActiveIdentity> {
    let rows = projection.nrows();
    if rows == 0 {
        return None;
    }
    let row = index.rem_euclid(rows as i64) as usize;
    Some(ActiveIdentity {
        embedding: IdentityEmbedding::new(projection.row(row).to_vec()),
        kind: SourceKind::Archetype,
    })
}

/// Timed morph through the source list.
///
/// Persists across mode switches; only [`MorphState::reset`] rewinds it.
#[derive(Debug, Clone)]
pub struct MorphState {
    idx_a: usize,
    idx_b: usize,
    started: Instant,
    duration: Duration,
}

impl MorphState {
    pub fn new(duration: Duration, now: Instant) -> Self {
        Self {
            idx_a: 0,
            idx_b: 1,
            started: now,
            duration,
        }
    }

    pub fn pair(&self) -> (usize, usize) {
        (self.idx_a, self.idx_b)
    }

    pub fn reset(&mut self, now: Instant) {
        self.idx_a = 0;
        self.idx_b = 1;
        self.started = now;
    }

    /// Ramp factor in [0, 1] at `now`.
    pub fn alpha(&self, now: Instant) -> f32 {
        if self.duration.is_zero() {
            return 1.0;
        }
        let elapsed = now.saturating_duration_since(self.started);
        (elapsed.as_secs_f32() / self.duration.as_secs_f32()).min(1.0)
    }

    /// Blend of the current pair at `now`, advancing the pair once the ramp
    /// completes.
    ///
    /// A ramp reaching 1.0 yields source B in full, then `(a, b)` becomes
    /// `(b, (b + 1) mod n)` and the timer restarts at `now`. With fewer than
    /// two sources there is nothing to morph and `None` comes back.
    pub fn advance(&mut self, now: Instant, sources: &[Arc<SourceFace>]) -> Option<ActiveIdentity> {
        let n = sources.len();
        if n < 2 {
            return None;
        }
        // The roster may have shrunk since the last frame.
        if self.idx_a >= n || self.idx_b >= n {
            self.idx_a %= n;
            self.idx_b = (self.idx_a + 1) % n;
        }

        let alpha = self.alpha(now);
        let embedding = lerp(
            sources[self.idx_a].embedding.normalized(),
            sources[self.idx_b].embedding.normalized(),
            alpha,
        );

        if alpha >= 1.0 {
            self.idx_a = self.idx_b;
            self.idx_b = (self.idx_b + 1) % n;
            self.started = now;
            tracing::debug!(a = self.idx_a, b = self.idx_b, "morph advanced to next pair");
        }

        Some(ActiveIdentity {
            embedding: IdentityEmbedding::new(embedding),
            kind: SourceKind::Morphed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::source_with_embedding;

    fn unit(dim: usize, hot: usize) -> Vec<f32> {
        let mut v = vec![0.0; dim];
        v[hot] = 1.0;
        v
    }

    #[test]
    fn test_direct_is_normalized() {
        let src = source_with_embedding("a", vec![3.0, 4.0]);
        let id = direct(&src);
        assert_eq!(id.embedding.raw(), &[0.6, 0.8]);
        assert_eq!(id.kind, SourceKind::Photo);
    }

    #[test]
    fn test_blend_endpoints_are_exact() {
        let a = source_with_embedding("a", vec![0.6, 0.8, 0.0]);
        let b = source_with_embedding("b", vec![0.0, 0.0, 2.0]);
        assert_eq!(blend(&a, &b, 0.0).embedding.raw(), a.embedding.normalized());
        assert_eq!(blend(&a, &b, 1.0).embedding.raw(), b.embedding.normalized());
    }

    #[test]
    fn test_blend_is_linear_in_alpha() {
        let a = source_with_embedding("a", unit(4, 0));
        let b = source_with_embedding("b", unit(4, 1));
        for alpha in [0.25f32, 0.5, 0.75] {
            let out = blend(&a, &b, alpha);
            let raw = out.embedding.raw();
            assert!((raw[0] - (1.0 - alpha)).abs() < 1e-6);
            assert!((raw[1] - alpha).abs() < 1e-6);
            assert_eq!(raw[2], 0.0);
            assert_eq!(out.kind, SourceKind::Blended);
        }
    }

    #[test]
    fn test_blend_is_not_renormalized() {
        let a = source_with_embedding("a", unit(2, 0));
        let b = source_with_embedding("b", unit(2, 1));
        let out = blend(&a, &b, 0.5);
        let norm: f32 = out.embedding.raw().iter().map(|x| x * x).sum::<f32>().sqrt();
        assert!((norm - 0.5f32.sqrt()).abs() < 1e-6, "norm = {norm}");
    }

    #[test]
    fn test_blend_does_not_touch_sources() {
        let a = source_with_embedding("a", vec![2.0, 0.0]);
        let b = source_with_embedding("b", vec![0.0, 2.0]);
        let _ = blend(&a, &b, 0.3);
        assert_eq!(a.embedding.raw(), &[2.0, 0.0]);
        assert_eq!(b.embedding.raw(), &[0.0, 2.0]);
    }

    #[test]
    fn test_morph_cycles_back_after_three_transitions() {
        let sources: Vec<Arc<SourceFace>> = (0..3)
            .map(|i| Arc::new(source_with_embedding(&format!("s{i}"), unit(3, i))))
            .collect();
        let d = Duration::from_millis(500);
        let t0 = Instant::now();
        let mut morph = MorphState::new(d, t0);
        assert_eq!(morph.pair(), (0, 1));

        morph.advance(t0 + d, &sources).unwrap();
        assert_eq!(morph.pair(), (1, 2));
        morph.advance(t0 + d * 2, &sources).unwrap();
        assert_eq!(morph.pair(), (2, 0));
        morph.advance(t0 + d * 3, &sources).unwrap();
        assert_eq!(morph.pair(), (0, 1));
    }

    #[test]
    fn test_morph_midpoint_blends_pair() {
        let sources = vec![
            Arc::new(source_with_embedding("a", unit(2, 0))),
            Arc::new(source_with_embedding("b", unit(2, 1))),
        ];
        let d = Duration::from_secs(2);
        let t0 = Instant::now();
        let mut morph = MorphState::new(d, t0);
        let id = morph.advance(t0 + Duration::from_secs(1), &sources).unwrap();
        assert!((id.embedding.raw()[0] - 0.5).abs() < 1e-5);
        assert!((id.embedding.raw()[1] - 0.5).abs() < 1e-5);
        assert_eq!(id.kind, SourceKind::Morphed);
        assert_eq!(morph.pair(), (0, 1), "pair must not advance mid-ramp");
    }

    #[test]
    fn test_morph_needs_two_sources() {
        let sources = vec![Arc::new(source_with_embedding("a", unit(2, 0)))];
        let t0 = Instant::now();
        let mut morph = MorphState::new(DEFAULT_MORPH_DURATION, t0);
        assert!(morph.advance(t0, &sources).is_none());
    }

    #[test]
    fn test_morph_reset_rewinds_pair() {
        let sources: Vec<Arc<SourceFace>> = (0..3)
            .map(|i| Arc::new(source_with_embedding("s", unit(3, i))))
            .collect();
        let d = Duration::from_millis(10);
        let t0 = Instant::now();
        let mut morph = MorphState::new(d, t0);
        morph.advance(t0 + d, &sources);
        assert_eq!(morph.pair(), (1, 2));
        morph.reset(t0 + d);
        assert_eq!(morph.pair(), (0, 1));
        assert_eq!(morph.alpha(t0 + d), 0.0);
    }

    #[test]
    fn test_archetype_wraps_both_directions() {
        let m = Array2::from_shape_fn((4, 2), |(r, c)| (r * 10 + c) as f32);
        assert_eq!(archetype(&m, 1).unwrap().embedding.raw(), &[10.0, 11.0]);
        assert_eq!(archetype(&m, 5).unwrap().embedding.raw(), &[10.0, 11.0]);
        assert_eq!(archetype(&m, -1).unwrap().embedding.raw(), &[30.0, 31.0]);
        assert_eq!(archetype(&m, -4).unwrap().embedding.raw(), &[0.0, 1.0]);
        assert!(archetype(&m, 0).unwrap().is_archetype());
    }

    #[test]
    fn test_archetype_empty_matrix() {
        let m = Array2::<f32>::zeros((0, 8));
        assert!(archetype(&m, 3).is_none());
    }
}
