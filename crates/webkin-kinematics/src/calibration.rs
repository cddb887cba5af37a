//! Persisted per-joint calibration overrides.
//!
//! Overrides sit on top of whatever the tree document declares: applying the
//! store rewrites the matching joint fields after every load, and editing an
//! override writes both the live joint and the JSON file at
//! `<config>/webkin/axis_overrides.json`.
//!
//! Entries whose joints are missing from the current tree are kept — tree
//! shapes churn during development, and a reload of the older shape picks
//! them up again.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{error, warn};
use webkin_types::{NodeDoc, WebkinError};

use crate::tree::{find_original_axis_params, KinematicTree};

/// File name of the persisted override map.
pub const OVERRIDES_FILE: &str = "axis_overrides.json";

/// Partial calibration for one joint; absent fields mean "use the tree's
/// declared value or the type default".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct AxisOverride {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slider_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slider_max: Option<f64>,
}

impl AxisOverride {
    /// Merge `patch` into `self`, field by field; `None` fields of the patch
    /// leave the existing value alone.
    pub fn merge(&mut self, patch: AxisOverride) {
        if let Some(v) = patch.axis_offset {
            self.axis_offset = Some(v);
        }
        if let Some(v) = patch.axis_scale {
            self.axis_scale = Some(v);
        }
        if let Some(v) = patch.slider_min {
            self.slider_min = Some(v);
        }
        if let Some(v) = patch.slider_max {
            self.slider_max = Some(v);
        }
    }

    fn write_to(&self, node: &mut crate::tree::Node) {
        if let Some(v) = self.axis_offset {
            node.axis_offset = v;
        }
        if let Some(v) = self.axis_scale {
            node.axis_scale = v;
        }
        if let Some(v) = self.slider_min {
            node.slider_min = v;
        }
        if let Some(v) = self.slider_max {
            node.slider_max = v;
        }
    }
}

/// The override map plus the file it persists to.
#[derive(Debug)]
pub struct CalibrationStore {
    path: PathBuf,
    overrides: BTreeMap<String, AxisOverride>,
}

impl CalibrationStore {
    /// Load the store from `path`.
    ///
    /// A missing file is an empty map; a file that fails to parse is logged
    /// and ignored (the server starts with no overrides rather than not at
    /// all).
    pub fn load(path: PathBuf) -> Self {
        let overrides = match fs::read_to_string(&path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "failed to parse overrides file, starting empty");
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        };
        Self { path, overrides }
    }

    /// An empty store persisting to `path`.
    pub fn empty(path: PathBuf) -> Self {
        Self {
            path,
            overrides: BTreeMap::new(),
        }
    }

    /// The current override map.
    pub fn overrides(&self) -> &BTreeMap<String, AxisOverride> {
        &self.overrides
    }

    /// Atomically overwrite the file: write a sibling temp file, then rename
    /// over the target. Creates the parent directory when absent.
    pub fn save(&self) -> Result<(), WebkinError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let raw = serde_json::to_string_pretty(&self.overrides)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, raw)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// [`save`][Self::save], demoted to a log line: a write failure leaves
    /// the in-memory map authoritative for the process lifetime.
    fn persist(&self) {
        if let Err(e) = self.save() {
            warn!(path = %self.path.display(), error = %e, "failed to persist overrides");
        }
    }

    /// Write every stored override into the matching joints of `tree`.
    /// Names missing from the tree are skipped.
    pub fn apply_to(&self, tree: &mut KinematicTree) {
        for (name, entry) in &self.overrides {
            match tree.joint_mut(name) {
                Some(node) => entry.write_to(node),
                None => {
                    warn!(joint = %name, "stored override has no matching joint in current tree");
                }
            }
        }
    }

    /// Derive the offset that zeroes the named joint at its current
    /// coordinate (`axis_offset := −coord`), apply it, and persist.
    ///
    /// Returns the new offset.
    pub fn set_zero(
        &mut self,
        tree: &mut KinematicTree,
        name: &str,
    ) -> Result<f64, WebkinError> {
        let node = tree
            .joint_mut(name)
            .ok_or_else(|| WebkinError::UnknownJoint(name.to_string()))?;
        let offset = -node.coord;
        node.axis_offset = offset;
        self.overrides
            .entry(name.to_string())
            .or_default()
            .axis_offset = Some(offset);
        self.persist();
        Ok(offset)
    }

    /// Merge a partial override into the named joint and the map; persist.
    pub fn set_override(
        &mut self,
        tree: &mut KinematicTree,
        name: &str,
        patch: AxisOverride,
    ) -> Result<(), WebkinError> {
        let node = tree
            .joint_mut(name)
            .ok_or_else(|| WebkinError::UnknownJoint(name.to_string()))?;
        patch.write_to(node);
        self.overrides
            .entry(name.to_string())
            .or_default()
            .merge(patch);
        self.persist();
        Ok(())
    }

    /// Drop every override and persist the empty map, without touching any
    /// tree.
    pub fn clear(&mut self) {
        self.overrides.clear();
        self.persist();
    }

    /// Drop every override, persist the empty map, and rebuild the tree from
    /// the original document so declared values come back.
    ///
    /// Note the rebuild also resets joint coordinates to the document state,
    /// exactly as any other tree load does.
    pub fn clear_all(
        &mut self,
        tree: &mut KinematicTree,
        original: &NodeDoc,
    ) -> Result<(), WebkinError> {
        self.clear();
        *tree = KinematicTree::from_doc(original)?;
        self.apply_to(tree); // no-op on the now-empty map
        Ok(())
    }

    /// Drop one override, persist, and restore the joint's declared
    /// parameters from the original document.
    pub fn clear_one(
        &mut self,
        tree: &mut KinematicTree,
        original: &NodeDoc,
        name: &str,
    ) -> Result<(), WebkinError> {
        if tree.joint(name).is_none() {
            return Err(WebkinError::UnknownJoint(name.to_string()));
        }
        self.overrides.remove(name);
        self.persist();
        if let Some(params) = find_original_axis_params(original, name) {
            let node = tree.joint_mut(name).expect("joint checked above");
            node.axis_offset = params.axis_offset;
            node.axis_scale = params.axis_scale;
            node.slider_min = params.slider_min;
            node.slider_max = params.slider_max;
        }
        Ok(())
    }
}

/// Default location of the overrides file:
/// `$XDG_CONFIG_HOME/webkin/axis_overrides.json`, falling back to
/// `$HOME/.config/webkin/axis_overrides.json`.
pub fn default_store_path() -> PathBuf {
    let config_home = std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
            Path::new(&home).join(".config")
        });
    config_home.join("webkin").join(OVERRIDES_FILE)
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::f64::consts::FRAC_PI_2;

    fn rotator_tree() -> (NodeDoc, KinematicTree) {
        let doc = NodeDoc::from_value(&json!({
            "name": "root",
            "type": "transform",
            "model": null,
            "children": [
                {"name": "j", "type": "rotator", "axis": [0, 0, 1],
                 "axis_scale": 2.0, "model": null}
            ]
        }))
        .unwrap();
        let mut tree = KinematicTree::from_doc(&doc).unwrap();
        tree.update_forward();
        (doc, tree)
    }

    fn store_in(dir: &tempfile::TempDir) -> CalibrationStore {
        CalibrationStore::load(dir.path().join(OVERRIDES_FILE))
    }

    #[test]
    fn missing_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(&dir);
        assert!(store.overrides().is_empty());
    }

    #[test]
    fn garbage_file_loads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(OVERRIDES_FILE);
        fs::write(&path, "{not json").unwrap();
        let store = CalibrationStore::load(path);
        assert!(store.overrides().is_empty());
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut tree) = rotator_tree();
        let mut store = store_in(&dir);
        store
            .set_override(
                &mut tree,
                "j",
                AxisOverride {
                    axis_offset: Some(0.5),
                    ..Default::default()
                },
            )
            .unwrap();

        let reloaded = store_in(&dir);
        assert_eq!(reloaded.overrides()["j"].axis_offset, Some(0.5));
        assert_eq!(reloaded.overrides()["j"].axis_scale, None);
    }

    #[test]
    fn save_creates_parent_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("webkin").join(OVERRIDES_FILE);
        let store = CalibrationStore::empty(path.clone());
        store.save().unwrap();
        assert!(path.exists());
    }

    #[test]
    fn set_zero_makes_effective_coord_zero() {
        // After set_zero the effective coordinate is zero no matter the
        // scale.
        let (_, mut tree) = rotator_tree();
        tree.set_joint_coord("j", FRAC_PI_2);
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        let offset = store.set_zero(&mut tree, "j").unwrap();
        assert!((offset + FRAC_PI_2).abs() < 1e-12);
        assert!(tree.joint("j").unwrap().effective_coord().abs() < 1e-12);
        assert_eq!(store.overrides()["j"].axis_offset, Some(offset));
    }

    #[test]
    fn set_zero_unknown_joint_errors() {
        let (_, mut tree) = rotator_tree();
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let err = store.set_zero(&mut tree, "ghost").unwrap_err();
        assert!(matches!(err, WebkinError::UnknownJoint(_)));
    }

    #[test]
    fn override_merge_is_partial() {
        // Setting only axis_scale leaves axis_offset alone.
        let (_, mut tree) = rotator_tree();
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        store
            .set_override(
                &mut tree,
                "j",
                AxisOverride {
                    axis_offset: Some(0.3),
                    ..Default::default()
                },
            )
            .unwrap();
        store
            .set_override(
                &mut tree,
                "j",
                AxisOverride {
                    axis_scale: Some(4.0),
                    ..Default::default()
                },
            )
            .unwrap();

        let entry = store.overrides()["j"];
        assert_eq!(entry.axis_offset, Some(0.3));
        assert_eq!(entry.axis_scale, Some(4.0));
        let node = tree.joint("j").unwrap();
        assert_eq!(node.axis_offset, 0.3);
        assert_eq!(node.axis_scale, 4.0);
    }

    #[test]
    fn apply_to_skips_unknown_joints() {
        let (_, mut tree) = rotator_tree();
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store.overrides.insert(
            "ghost".to_string(),
            AxisOverride {
                axis_offset: Some(1.0),
                ..Default::default()
            },
        );
        store.overrides.insert(
            "j".to_string(),
            AxisOverride {
                axis_offset: Some(0.2),
                ..Default::default()
            },
        );
        store.apply_to(&mut tree);
        assert_eq!(tree.joint("j").unwrap().axis_offset, 0.2);
        // Stale entry survives for future tree shapes.
        assert!(store.overrides().contains_key("ghost"));
    }

    #[test]
    fn clear_all_restores_declared_values() {
        // After clear_all the joint carries document values again.
        let (doc, mut tree) = rotator_tree();
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        store
            .set_override(
                &mut tree,
                "j",
                AxisOverride {
                    axis_offset: Some(9.0),
                    axis_scale: Some(9.0),
                    slider_min: Some(-9.0),
                    slider_max: Some(9.0),
                },
            )
            .unwrap();

        store.clear_all(&mut tree, &doc).unwrap();
        let node = tree.joint("j").unwrap();
        assert_eq!(node.axis_offset, 0.0);
        assert_eq!(node.axis_scale, 2.0); // declared in the document
        assert_eq!(node.slider_min, -180.0); // type default
        assert!(store.overrides().is_empty());
    }

    #[test]
    fn clear_one_restores_only_named_joint() {
        // Deleting one override brings back the document value and
        // leaves others untouched.
        let doc = NodeDoc::from_value(&json!({
            "name": "root",
            "type": "transform",
            "model": null,
            "children": [
                {"name": "a", "type": "rotator", "axis": [0, 0, 1], "model": null},
                {"name": "b", "type": "rotator", "axis": [0, 0, 1], "model": null}
            ]
        }))
        .unwrap();
        let mut tree = KinematicTree::from_doc(&doc).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);

        for name in ["a", "b"] {
            store
                .set_override(
                    &mut tree,
                    name,
                    AxisOverride {
                        axis_offset: Some(1.0),
                        ..Default::default()
                    },
                )
                .unwrap();
        }

        store.clear_one(&mut tree, &doc, "a").unwrap();
        assert_eq!(tree.joint("a").unwrap().axis_offset, 0.0);
        assert_eq!(tree.joint("b").unwrap().axis_offset, 1.0);
        assert!(!store.overrides().contains_key("a"));
        assert!(store.overrides().contains_key("b"));
    }

    #[test]
    fn clear_one_unknown_joint_errors() {
        let (doc, mut tree) = rotator_tree();
        let dir = tempfile::tempdir().unwrap();
        let mut store = store_in(&dir);
        let err = store.clear_one(&mut tree, &doc, "ghost").unwrap_err();
        assert!(matches!(err, WebkinError::UnknownJoint(_)));
    }

    #[test]
    fn persisted_file_is_flat_object() {
        let dir = tempfile::tempdir().unwrap();
        let (_, mut tree) = rotator_tree();
        let mut store = store_in(&dir);
        store
            .set_override(
                &mut tree,
                "j",
                AxisOverride {
                    slider_max: Some(90.0),
                    ..Default::default()
                },
            )
            .unwrap();

        let raw = fs::read_to_string(dir.path().join(OVERRIDES_FILE)).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["j"]["slider_max"], 90.0);
        assert!(value["j"].get("axis_offset").is_none());
    }
}
