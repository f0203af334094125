use faceon_core::library::{self, LibraryError};
use faceon_core::{RunMode, SharedControls, Slot, SourceKind};
use serde::Serialize;
use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use zbus::interface;

pub const BUS_NAME: &str = "org.faceon.FaceOn1";
pub const OBJECT_PATH: &str = "/org/faceon/FaceOn1";

/// D-Bus control surface for the render daemon.
///
/// Bus name: org.faceon.FaceOn1
/// Object path: /org/faceon/FaceOn1
///
/// Handlers only read and write [`SharedControls`]; the render loop picks
/// changes up on its next frame.
pub struct FaceOnService {
    controls: Arc<SharedControls>,
    embeddings_dir: PathBuf,
}

impl FaceOnService {
    pub fn new(controls: Arc<SharedControls>, embeddings_dir: PathBuf) -> Self {
        Self {
            controls,
            embeddings_dir,
        }
    }
}

fn invalid_args(e: impl Display) -> zbus::fdo::Error {
    zbus::fdo::Error::InvalidArgs(e.to_string())
}

fn failed(e: impl Display) -> zbus::fdo::Error {
    zbus::fdo::Error::Failed(e.to_string())
}

#[interface(name = "org.faceon.FaceOn1")]
impl FaceOnService {
    /// Switch the processing mode (off, pixelate, swap, blend, morph, archetype).
    async fn set_mode(&self, mode: &str) -> zbus::fdo::Result<()> {
        let mode: RunMode = mode.parse().map_err(invalid_args)?;
        self.controls.set_mode(mode);
        Ok(())
    }

    async fn mode(&self) -> String {
        self.controls.mode().to_string()
    }

    /// Set one tunable by name.
    async fn set_tunable(&self, name: &str, value: f64) -> zbus::fdo::Result<()> {
        tracing::info!(name, value, "set_tunable requested");
        self.controls.set_tunable(name, value).map_err(invalid_args)
    }

    /// All tunables as a JSON object.
    async fn tunables(&self) -> zbus::fdo::Result<String> {
        serde_json::to_string(&self.controls.tunables()).map_err(failed)
    }

    /// Select a source by roster index for slot "a" or "b". Returns its name.
    async fn select_source(&self, slot: &str, index: u32) -> zbus::fdo::Result<String> {
        let slot: Slot = slot.parse().map_err(invalid_args)?;
        let face = self
            .controls
            .roster()
            .select(slot, index as usize)
            .map_err(invalid_args)?;
        tracing::info!(?slot, index, name = %face.name, "source selected");
        Ok(face.name.clone())
    }

    /// Move a slot's selection by `delta`, wrapping around the roster.
    /// Returns the new index.
    async fn scroll_source(&self, slot: &str, delta: i32) -> zbus::fdo::Result<u32> {
        let slot: Slot = slot.parse().map_err(invalid_args)?;
        let index = self
            .controls
            .roster()
            .scroll(slot, i64::from(delta))
            .map_err(invalid_args)?;
        Ok(index as u32)
    }

    /// The roster as a JSON array.
    async fn list_sources(&self) -> zbus::fdo::Result<String> {
        list_sources_json(&self.controls).map_err(failed)
    }

    /// Move the archetype index by `delta`. Returns the new (unwrapped) index.
    async fn scroll_archetype(&self, delta: i32) -> i64 {
        self.controls.scroll_archetype(i64::from(delta))
    }

    /// Restart the morph from the first pair.
    async fn reset_morph(&self) {
        self.controls.request_morph_reset();
    }

    async fn set_paused(&self, paused: bool) {
        tracing::info!(paused, "set_paused requested");
        self.controls.set_paused(paused);
    }

    /// Persist the current blend as a new source. Returns its name.
    async fn save_blend(&self) -> zbus::fdo::Result<String> {
        save_current_blend(&self.controls, &self.embeddings_dir).map_err(|e| match e {
            SaveBlendError::NotBlending | SaveBlendError::NoActiveBlend => invalid_args(e),
            SaveBlendError::Library(_) => failed(e),
        })
    }

    /// Daemon status as JSON.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let report = self.controls.status();
        let mut value = serde_json::to_value(&report).map_err(failed)?;
        if let Some(obj) = value.as_object_mut() {
            obj.insert("version".into(), env!("CARGO_PKG_VERSION").into());
        }
        Ok(value.to_string())
    }

    /// Stop the render loop and exit the daemon.
    async fn shutdown(&self) {
        tracing::info!("shutdown requested");
        self.controls.stop();
    }
}

#[derive(Error, Debug)]
pub enum SaveBlendError {
    #[error("save blend is only available in blend mode")]
    NotBlending,
    #[error("no blend has been rendered yet")]
    NoActiveBlend,
    #[error(transparent)]
    Library(#[from] LibraryError),
}

/// Save the blend the loop last rendered and append it to the roster.
pub fn save_current_blend(controls: &SharedControls, embeddings_dir: &Path) -> Result<String, SaveBlendError> {
    if controls.mode() != RunMode::Blend {
        return Err(SaveBlendError::NotBlending);
    }
    let roster = controls.roster();
    let active = controls
        .active_identity()
        .filter(|identity| identity.kind == SourceKind::Blended)
        .ok_or(SaveBlendError::NoActiveBlend)?;
    let (Some(a), Some(b)) = (roster.selected(Slot::A), roster.selected(Slot::B)) else {
        return Err(SaveBlendError::NoActiveBlend);
    };

    let blend = library::save_blend(embeddings_dir, &a, &b, &active)?;
    let name = blend.name.clone();
    let index = roster.push(blend);
    tracing::info!(name = %name, index, "blend added to roster");
    Ok(name)
}

#[derive(Serialize)]
struct SourceEntry<'a> {
    index: usize,
    name: &'a str,
    kind: SourceKind,
    selected_a: bool,
    selected_b: bool,
}

pub fn list_sources_json(controls: &SharedControls) -> serde_json::Result<String> {
    let roster = controls.roster();
    let sources = roster.sources();
    let a = roster.selected_index(Slot::A);
    let b = roster.selected_index(Slot::B);
    let entries: Vec<SourceEntry<'_>> = sources
        .iter()
        .enumerate()
        .map(|(index, face)| SourceEntry {
            index,
            name: &face.name,
            kind: face.kind,
            selected_a: a == Some(index),
            selected_b: b == Some(index),
        })
        .collect();
    serde_json::to_string(&entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use faceon_core::{ActiveIdentity, IdentityEmbedding, SourceFace};

    fn source(name: &str, raw: Vec<f32>) -> SourceFace {
        SourceFace {
            face: None,
            embedding: IdentityEmbedding::new(raw),
            thumbnail: None,
            name: name.to_string(),
            kind: SourceKind::Photo,
        }
    }

    fn controls_with_two() -> SharedControls {
        let controls = SharedControls::default();
        controls.roster().replace(vec![
            source("Ada Lovelace", vec![1.0, 0.0]),
            source("Grace Hopper", vec![0.0, 1.0]),
        ]);
        controls
    }

    #[test]
    fn test_list_sources_json() {
        let controls = controls_with_two();
        let json: serde_json::Value = serde_json::from_str(&list_sources_json(&controls).unwrap()).unwrap();
        let list = json.as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["name"], "Ada Lovelace");
        assert_eq!(list[0]["kind"], "photo");
        assert_eq!(list[0]["selected_a"], true);
        assert_eq!(list[1]["selected_b"], true);
        assert_eq!(list[1]["selected_a"], false);
    }

    #[test]
    fn test_save_blend_requires_blend_mode() {
        let dir = tempfile::tempdir().unwrap();
        let controls = controls_with_two();
        controls.set_mode(RunMode::Swap);
        assert!(matches!(
            save_current_blend(&controls, dir.path()),
            Err(SaveBlendError::NotBlending)
        ));
    }

    #[test]
    fn test_save_blend_requires_rendered_blend() {
        let dir = tempfile::tempdir().unwrap();
        let controls = controls_with_two();
        controls.set_mode(RunMode::Blend);
        assert!(matches!(
            save_current_blend(&controls, dir.path()),
            Err(SaveBlendError::NoActiveBlend)
        ));
    }

    #[test]
    fn test_save_blend_appends_to_roster() {
        let dir = tempfile::tempdir().unwrap();
        let controls = controls_with_two();
        controls.set_mode(RunMode::Blend);
        controls.publish_active(Some(ActiveIdentity {
            embedding: IdentityEmbedding::new(vec![0.5, 0.5]),
            kind: SourceKind::Blended,
        }));

        let name = save_current_blend(&controls, dir.path()).unwrap();
        assert_eq!(name, "Ada Hopper");
        assert_eq!(controls.roster().len(), 3);
        assert!(dir.path().join("Ada Hopper.safetensors").exists());

        let second = save_current_blend(&controls, dir.path()).unwrap();
        assert_eq!(second, "Ada Hopper_1");
        assert_eq!(controls.roster().len(), 4);
    }
}
