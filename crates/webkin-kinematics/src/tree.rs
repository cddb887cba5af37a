//! The kinematic tree engine.
//!
//! Nodes live in an arena (`Vec<Node>` in document preorder) with parent
//! links; a `name → index` map gives O(1) joint addressing without reference
//! cycles. The forward pass is a single walk over the arena: preorder
//! guarantees every parent's global pose is written before its children read
//! it.
//!
//! Invariant maintained throughout: for every node `N` with parent `P`,
//! `global(N) = global(P) · local(N) · joint(N)`, the root composing against
//! the identity.

use std::collections::{HashMap, HashSet};

use serde_json::{Map, Value};
use webkin_types::{NodeDoc, NodeKind, Pose, Quat, Vec3, WebkinError};

/// Calibration parameters as a tree document declares them (or the type
/// defaults, where it is silent).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisParams {
    pub axis_offset: f64,
    pub axis_scale: f64,
    pub slider_min: f64,
    pub slider_max: f64,
}

/// One arena node.
#[derive(Debug, Clone)]
pub struct Node {
    pub name: String,
    pub kind: NodeKind,
    pub local_pose: Pose,
    pub axis: Vec3,
    /// Raw joint coordinate as last published; meaningless for transforms.
    pub coord: f64,
    pub axis_offset: f64,
    pub axis_scale: f64,
    pub slider_min: f64,
    pub slider_max: f64,
    /// Opaque blob forwarded to clients.
    pub model: Value,
    pub parent: Option<usize>,
    pub global_pose: Pose,
}

impl Node {
    /// Effective joint value: `(coord + axis_offset) · axis_scale`.
    ///
    /// The offset is added before scaling so that zeroing a joint
    /// (`axis_offset := −coord`) lands exactly on zero whatever the scale.
    pub fn effective_coord(&self) -> f64 {
        (self.coord + self.axis_offset) * self.axis_scale
    }

    /// Transform contributed by the joint's current coordinate.
    pub fn joint_transform(&self) -> Pose {
        let eff = self.effective_coord();
        match self.kind {
            NodeKind::Rotator => {
                Pose::new(Vec3::zero(), Quat::from_axis_angle(self.axis, eff))
            }
            NodeKind::Actuator => Pose::new(self.axis.scaled(eff), Quat::identity()),
            NodeKind::Transform => Pose::identity(),
        }
    }
}

/// The authoritative forward-kinematics state.
///
/// An empty tree (before the first load) is valid and snapshots to an empty
/// scene.
#[derive(Debug, Default)]
pub struct KinematicTree {
    nodes: Vec<Node>,
    joints: HashMap<String, usize>,
}

impl KinematicTree {
    /// Build a tree from a parsed document.
    ///
    /// Joint coordinates start at zero; calibration fields take the
    /// document's declared values or the type defaults. Fails with
    /// [`WebkinError::DuplicateName`] when two nodes share a name (the
    /// document parse has already rejected malformed nodes).
    pub fn from_doc(doc: &NodeDoc) -> Result<Self, WebkinError> {
        let mut tree = Self::default();
        let mut seen = HashSet::new();
        tree.push_subtree(doc, None, &mut seen)?;
        Ok(tree)
    }

    fn push_subtree(
        &mut self,
        doc: &NodeDoc,
        parent: Option<usize>,
        seen: &mut HashSet<String>,
    ) -> Result<(), WebkinError> {
        if !seen.insert(doc.name.clone()) {
            return Err(WebkinError::DuplicateName(doc.name.clone()));
        }
        if doc.kind.is_joint() && doc.axis.is_none() {
            return Err(WebkinError::MalformedTree(format!(
                "{} node '{}' has no axis",
                doc.kind.as_str(),
                doc.name
            )));
        }

        let (default_min, default_max) = doc.kind.default_slider_limits();
        let idx = self.nodes.len();
        self.nodes.push(Node {
            name: doc.name.clone(),
            kind: doc.kind,
            local_pose: doc.pose,
            axis: doc.axis.unwrap_or_else(|| Vec3::new(0.0, 0.0, 1.0)),
            coord: 0.0,
            axis_offset: doc.axis_offset.unwrap_or(0.0),
            axis_scale: doc.axis_scale.unwrap_or(1.0),
            slider_min: doc.slider_min.unwrap_or(default_min),
            slider_max: doc.slider_max.unwrap_or(default_max),
            model: doc.model.clone(),
            parent,
            global_pose: Pose::identity(),
        });
        if doc.kind.is_joint() {
            self.joints.insert(doc.name.clone(), idx);
        }

        for child in &doc.children {
            self.push_subtree(child, Some(idx), seen)?;
        }
        Ok(())
    }

    /// Whether a load has populated this tree yet.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Look up a joint node by name.
    pub fn joint(&self, name: &str) -> Option<&Node> {
        self.joints.get(name).map(|&i| &self.nodes[i])
    }

    /// Mutable joint lookup.
    pub fn joint_mut(&mut self, name: &str) -> Option<&mut Node> {
        let idx = *self.joints.get(name)?;
        Some(&mut self.nodes[idx])
    }

    /// Set one joint coordinate; unknown names are ignored.
    ///
    /// Publishers may send a superset of joints while a tree swap is in
    /// flight, so an unknown name is not an error.
    pub fn set_joint_coord(&mut self, name: &str, value: f64) {
        if let Some(node) = self.joint_mut(name) {
            node.coord = value;
        }
    }

    /// Set many joint coordinates at once.
    pub fn set_joint_coords(&mut self, coords: &HashMap<String, f64>) {
        for (name, value) in coords {
            self.set_joint_coord(name, *value);
        }
    }

    /// Recompute every node's global pose in one preorder traversal.
    pub fn update_forward(&mut self) {
        for i in 0..self.nodes.len() {
            let parent_pose = match self.nodes[i].parent {
                Some(p) => self.nodes[p].global_pose,
                None => Pose::identity(),
            };
            let node = &mut self.nodes[i];
            node.global_pose = parent_pose
                .compose(node.local_pose)
                .compose(node.joint_transform());
        }
    }

    /// Scene snapshot `{name: {pose, model}}` in document order.
    pub fn scene_snapshot(&self) -> Map<String, Value> {
        let mut out = Map::with_capacity(self.nodes.len());
        for node in &self.nodes {
            let mut entry = Map::with_capacity(2);
            entry.insert(
                "pose".to_string(),
                // Non-finite poses (a joint driven past f64 range) degrade to
                // null rather than failing the snapshot.
                serde_json::to_value(node.global_pose).unwrap_or(Value::Null),
            );
            entry.insert("model".to_string(), node.model.clone());
            out.insert(node.name.clone(), Value::Object(entry));
        }
        out
    }

    /// Joint metadata `{name: {type, slider_min, slider_max, axis_scale,
    /// axis_offset}}` in document order.
    pub fn joints_info(&self) -> Map<String, Value> {
        let mut out = Map::new();
        for node in self.nodes.iter().filter(|n| n.kind.is_joint()) {
            let mut entry = Map::with_capacity(5);
            entry.insert("type".to_string(), Value::from(node.kind.as_str()));
            entry.insert("slider_min".to_string(), Value::from(node.slider_min));
            entry.insert("slider_max".to_string(), Value::from(node.slider_max));
            entry.insert("axis_scale".to_string(), Value::from(node.axis_scale));
            entry.insert("axis_offset".to_string(), Value::from(node.axis_offset));
            out.insert(node.name.clone(), Value::Object(entry));
        }
        out
    }

    /// Joint names in document order.
    pub fn joint_names(&self) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|n| n.kind.is_joint())
            .map(|n| n.name.clone())
            .collect()
    }

    /// All nodes in document order.
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }
}

/// Declared calibration parameters of a joint in the original document.
///
/// Used to restore a joint after its override is deleted; pure over the
/// document, independent of the live tree.
pub fn find_original_axis_params(doc: &NodeDoc, name: &str) -> Option<AxisParams> {
    let node = doc.find(name)?;
    if !node.kind.is_joint() {
        return None;
    }
    let (default_min, default_max) = node.kind.default_slider_limits();
    Some(AxisParams {
        axis_offset: node.axis_offset.unwrap_or(0.0),
        axis_scale: node.axis_scale.unwrap_or(1.0),
        slider_min: node.slider_min.unwrap_or(default_min),
        slider_max: node.slider_max.unwrap_or(default_max),
    })
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
