//! `webkin-bundle` – K3D scene bundle loader.
//!
//! A `.k3d` file is a zip archive holding `k3d.json` (the scene description)
//! plus the STL meshes it references. Loading extracts the meshes into a
//! scoped temp directory, converts the scene into the server's tree-document
//! format, and rewrites model references to the `/k3d/models/…` routes the
//! HTTP surface serves them from. A directory with the same layout can be
//! loaded in place, with meshes served from the directory itself.
//!
//! The extraction directory lives exactly as long as the [`K3dBundle`]:
//! dropping the bundle (or loading a new one over it) removes it.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};
use tempfile::TempDir;
use tracing::{debug, info};
use webkin_types::WebkinError;

/// Route prefix under which the HTTP surface exposes extracted models.
pub const MODELS_ROUTE_PREFIX: &str = "/k3d/models/";

/// A loaded scene bundle: converted tree document plus a models directory.
#[derive(Debug)]
pub struct K3dBundle {
    tree_doc: Value,
    camera_pose: Value,
    models_dir: PathBuf,
    /// Present for zip loads; ties the extracted files' lifetime to the
    /// bundle.
    _temp: Option<TempDir>,
}

impl K3dBundle {
    /// Load a `.k3d` zip archive, extracting meshes into a fresh temp
    /// directory.
    pub fn load_file(path: &Path) -> Result<Self, WebkinError> {
        let file = fs::File::open(path)
            .map_err(|e| WebkinError::Bundle(format!("open {}: {e}", path.display())))?;
        let mut archive = zip::ZipArchive::new(file)
            .map_err(|e| WebkinError::Bundle(format!("read archive {}: {e}", path.display())))?;

        let temp = TempDir::with_prefix("webkin_k3d_")
            .map_err(|e| WebkinError::Bundle(format!("create temp dir: {e}")))?;
        let models_dir = temp.path().join("models");
        fs::create_dir_all(&models_dir)?;

        let mut k3d_json: Option<String> = None;
        for i in 0..archive.len() {
            let mut entry = archive
                .by_index(i)
                .map_err(|e| WebkinError::Bundle(format!("archive entry {i}: {e}")))?;
            let Some(basename) = Path::new(entry.name())
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
            else {
                continue;
            };

            if basename == "k3d.json" {
                let mut content = String::new();
                std::io::Read::read_to_string(&mut entry, &mut content)?;
                k3d_json = Some(content);
            } else if basename.to_ascii_lowercase().ends_with(".stl") {
                let out_path = models_dir.join(&basename);
                let mut out = fs::File::create(&out_path)?;
                std::io::copy(&mut entry, &mut out)?;
                debug!(model = %basename, "extracted");
            }
        }

        let raw = k3d_json
            .ok_or_else(|| WebkinError::Bundle("k3d.json not found in archive".to_string()))?;
        let raw: Value = serde_json::from_str(&raw)
            .map_err(|e| WebkinError::Bundle(format!("parse k3d.json: {e}")))?;
        let (tree_doc, camera_pose) = convert_scene(&raw);
        info!(path = %path.display(), "loaded k3d bundle");

        Ok(Self {
            tree_doc,
            camera_pose,
            models_dir,
            _temp: Some(temp),
        })
    }

    /// Load an unpacked bundle directory containing `k3d.json`; meshes are
    /// served from the directory itself.
    pub fn load_directory(path: &Path) -> Result<Self, WebkinError> {
        let k3d_path = path.join("k3d.json");
        let raw = fs::read_to_string(&k3d_path)
            .map_err(|e| WebkinError::Bundle(format!("read {}: {e}", k3d_path.display())))?;
        let raw: Value = serde_json::from_str(&raw)
            .map_err(|e| WebkinError::Bundle(format!("parse k3d.json: {e}")))?;
        let (tree_doc, camera_pose) = convert_scene(&raw);
        info!(path = %path.display(), "loaded k3d directory");

        Ok(Self {
            tree_doc,
            camera_pose,
            models_dir: path.to_path_buf(),
            _temp: None,
        })
    }

    /// The converted tree document.
    pub fn tree_doc(&self) -> &Value {
        &self.tree_doc
    }

    /// Camera pose declared by the bundle, `Null` when absent.
    pub fn camera_pose(&self) -> &Value {
        &self.camera_pose
    }

    /// Directory holding the bundle's mesh files.
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Resolve a model file by bare name.
    ///
    /// Only plain basenames resolve; anything that could escape the models
    /// directory is rejected, and missing files return `None`.
    pub fn model_path(&self, filename: &str) -> Option<PathBuf> {
        if filename.contains('/') || filename.contains('\\') || filename.contains("..") {
            return None;
        }
        let path = self.models_dir.join(filename);
        path.is_file().then_some(path)
    }
}

/// Convert a raw `k3d.json` value into `(tree document, camera pose)`.
///
/// The kinematic tree may sit at the top level or under a `k3d` key;
/// `scaleDict` maps mesh paths to per-model scale factors.
fn convert_scene(raw: &Value) -> (Value, Value) {
    let mut scale_dict = HashMap::new();
    if let Some(dict) = raw.get("scaleDict").and_then(Value::as_object) {
        for (key, value) in dict {
            scale_dict.insert(key.clone(), value.as_f64().unwrap_or(1.0));
        }
    }
    let camera_pose = raw.get("cameraPose").cloned().unwrap_or(Value::Null);
    let tree = raw.get("k3d").unwrap_or(raw);
    (convert_node(tree, &scale_dict), camera_pose)
}

fn convert_node(node: &Value, scale_dict: &HashMap<String, f64>) -> Value {
    let mut out = Map::new();
    out.insert(
        "name".to_string(),
        node.get("name").cloned().unwrap_or_else(|| "unnamed".into()),
    );
    out.insert(
        "type".to_string(),
        node.get("type").cloned().unwrap_or_else(|| "transform".into()),
    );

    if let Some(pose) = node.get("pose") {
        let mut pose_out = Map::new();
        pose_out.insert(
            "position".to_string(),
            convert_components(pose.get("position"), 3),
        );
        pose_out.insert(
            "orientation".to_string(),
            convert_components(pose.get("orientation"), 4),
        );
        out.insert("pose".to_string(), Value::Object(pose_out));
    }

    if let Some(axis) = node.get("axis") {
        out.insert("axis".to_string(), convert_components(Some(axis), 3));
    }

    // Declared calibration passes through untouched when present.
    for key in ["axis_offset", "axis_scale", "slider_min", "slider_max"] {
        if let Some(value) = node.get(key) {
            out.insert(key.to_string(), value.clone());
        }
    }

    if let Some(model) = node.get("model") {
        out.insert("model".to_string(), convert_model(model, scale_dict));
    }

    let children: Vec<Value> = node
        .get("children")
        .and_then(Value::as_array)
        .map(|list| {
            list.iter()
                .map(|child| convert_node(child, scale_dict))
                .collect()
        })
        .unwrap_or_default();
    out.insert("children".to_string(), Value::Array(children));

    Value::Object(out)
}

fn convert_model(model: &Value, scale_dict: &HashMap<String, f64>) -> Value {
    match model.get("type").and_then(Value::as_str) {
        Some("file") => {
            let stl_path = model.get("path").and_then(Value::as_str).unwrap_or("");
            let scale = scale_dict.get(stl_path).copied().unwrap_or(1.0);
            let mut out = Map::new();
            out.insert("type".to_string(), "stl".into());
            out.insert(
                "path".to_string(),
                format!("{MODELS_ROUTE_PREFIX}{stl_path}").into(),
            );
            out.insert("scale".to_string(), scale.into());
            Value::Object(out)
        }
        Some("none") => {
            let mut out = Map::new();
            out.insert("type".to_string(), "none".into());
            Value::Object(out)
        }
        // Unknown model types pass through to the client verbatim.
        _ => model.clone(),
    }
}

/// Fixed-length numeric array with per-element laxity: missing or short
/// arrays become zeros (`w` defaults to 1), numbers written with a comma
/// decimal separator are accepted.
fn convert_components(value: Option<&Value>, len: usize) -> Value {
    let list = value.and_then(Value::as_array);
    let mut out = Vec::with_capacity(len);
    for i in 0..len {
        let default = if len == 4 && i == 3 { 1.0 } else { 0.0 };
        let number = match list.and_then(|l| l.get(i)) {
            Some(v) => parse_number(v).unwrap_or(default),
            None => default,
        };
        out.push(Value::from(number));
    }
    Value::Array(out)
}

/// Parse a JSON number, or a string that contains one — some exporters write
/// `"0,5"` with a comma decimal separator.
fn parse_number(value: &Value) -> Option<f64> {
    if let Some(n) = value.as_f64() {
        return Some(n);
    }
    value.as_str()?.replace(',', ".").parse().ok()
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn sample_k3d_json() -> String {
        json!({
            "scaleDict": {"arm.stl": 0.001},
            "cameraPose": {"position": [0, 0, 5]},
            "k3d": {
                "name": "root",
                "type": "transform",
                "pose": {"position": [0, 0, 0], "orientation": [0, 0, 0, 1]},
                "model": {"type": "none"},
                "children": [
                    {
                        "name": "arm",
                        "type": "rotator",
                        "axis": ["0,5", 0, 1],
                        "pose": {"position": [1, 0, 0]},
                        "model": {"type": "file", "path": "arm.stl"}
                    }
                ]
            }
        })
        .to_string()
    }

    fn write_bundle(dir: &Path) -> PathBuf {
        let path = dir.join("scene.k3d");
        let file = fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        let options = zip::write::SimpleFileOptions::default();
        zip.start_file("k3d.json", options).unwrap();
        zip.write_all(sample_k3d_json().as_bytes()).unwrap();
        zip.start_file("arm.stl", options).unwrap();
        zip.write_all(b"solid arm\nendsolid arm\n").unwrap();
        zip.finish().unwrap();
        path
    }

    #[test]
    fn load_file_extracts_models_and_converts_doc() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = K3dBundle::load_file(&write_bundle(dir.path())).unwrap();

        let doc = bundle.tree_doc();
        assert_eq!(doc["name"], "root");
        let arm = &doc["children"][0];
        assert_eq!(arm["model"]["type"], "stl");
        assert_eq!(arm["model"]["path"], "/k3d/models/arm.stl");
        assert_eq!(arm["model"]["scale"], 0.001);
        // Comma decimal separator in the axis.
        assert_eq!(arm["axis"][0], 0.5);

        assert!(bundle.model_path("arm.stl").is_some());
        assert_eq!(bundle.camera_pose()["position"][2], 5.0);
    }

    #[test]
    fn temp_dir_is_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let bundle = K3dBundle::load_file(&write_bundle(dir.path())).unwrap();
        let models_dir = bundle.models_dir().to_path_buf();
        assert!(models_dir.exists());
        drop(bundle);
        assert!(!models_dir.exists());
    }

    #[test]
    fn archive_without_k3d_json_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.k3d");
        let file = fs::File::create(&path).unwrap();
        let mut zip = zip::ZipWriter::new(file);
        zip.start_file("readme.txt", zip::write::SimpleFileOptions::default())
            .unwrap();
        zip.write_all(b"nothing here").unwrap();
        zip.finish().unwrap();

        let err = K3dBundle::load_file(&path).unwrap_err();
        assert!(matches!(err, WebkinError::Bundle(_)));
    }

    #[test]
    fn load_directory_serves_models_in_place() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("k3d.json"), sample_k3d_json()).unwrap();
        fs::write(dir.path().join("arm.stl"), b"solid arm\nendsolid arm\n").unwrap();

        let bundle = K3dBundle::load_directory(dir.path()).unwrap();
        assert_eq!(bundle.models_dir(), dir.path());
        assert!(bundle.model_path("arm.stl").is_some());
        assert!(bundle.model_path("missing.stl").is_none());
    }

    #[test]
    fn model_path_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("k3d.json"), sample_k3d_json()).unwrap();
        let bundle = K3dBundle::load_directory(dir.path()).unwrap();
        assert!(bundle.model_path("../k3d.json").is_none());
        assert!(bundle.model_path("sub/dir.stl").is_none());
    }

    #[test]
    fn top_level_tree_without_k3d_key() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("k3d.json"),
            json!({"name": "solo", "type": "transform"}).to_string(),
        )
        .unwrap();
        let bundle = K3dBundle::load_directory(dir.path()).unwrap();
        assert_eq!(bundle.tree_doc()["name"], "solo");
    }

    #[test]
    fn short_orientation_defaults_w_to_one() {
        assert_eq!(
            convert_components(Some(&json!([0, 0])), 4),
            json!([0.0, 0.0, 0.0, 1.0])
        );
        assert_eq!(convert_components(None, 3), json!([0.0, 0.0, 0.0]));
    }
}
