//! The kinematic tree document.
//!
//! A tree arrives as recursive JSON (over MQTT/Crow, REST, or a K3D bundle)
//! and is parsed into [`NodeDoc`] before the engine builds its runtime
//! representation from it. The document is also what `GET /api/tree` returns
//! and what calibration clearing restores declared values from, so it is kept
//! around verbatim after a load.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::WebkinError;
use crate::math::{Pose, Vec3};

/// Slider range declared for rotators when the document says nothing.
pub const ROTATOR_SLIDER_LIMIT: f64 = 180.0;
/// Slider range declared for actuators when the document says nothing.
pub const ACTUATOR_SLIDER_LIMIT: f64 = 1000.0;

/// Closed set of node variants.
///
/// The only behavioral difference between them is the joint transform each
/// one contributes; see `webkin-kinematics`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    /// Static node; contributes only its local pose.
    Transform,
    /// Revolute joint rotating about its axis.
    Rotator,
    /// Prismatic joint translating along its axis.
    Actuator,
}

impl NodeKind {
    /// Whether this variant is driven by a joint coordinate.
    pub fn is_joint(self) -> bool {
        matches!(self, NodeKind::Rotator | NodeKind::Actuator)
    }

    /// The wire tag for this variant.
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::Transform => "transform",
            NodeKind::Rotator => "rotator",
            NodeKind::Actuator => "actuator",
        }
    }

    /// Type-default `(slider_min, slider_max)` for joints; zero for
    /// transforms, which ignore calibration.
    pub fn default_slider_limits(self) -> (f64, f64) {
        match self {
            NodeKind::Rotator => (-ROTATOR_SLIDER_LIMIT, ROTATOR_SLIDER_LIMIT),
            NodeKind::Actuator => (-ACTUATOR_SLIDER_LIMIT, ACTUATOR_SLIDER_LIMIT),
            NodeKind::Transform => (0.0, 0.0),
        }
    }
}

/// One node of the tree document.
///
/// `model` is opaque: the server forwards it to clients verbatim and never
/// inspects it beyond the bundle loader's path rewriting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDoc {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: NodeKind,
    #[serde(default)]
    pub pose: Pose,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis: Option<Vec3>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis_offset: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub axis_scale: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slider_min: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slider_max: Option<f64>,
    #[serde(default)]
    pub model: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<NodeDoc>,
}

impl NodeDoc {
    /// Parse a raw JSON document.
    ///
    /// Fails with [`WebkinError::MalformedTree`] when required fields are
    /// missing or a type tag is unknown. Name uniqueness is checked later,
    /// when the engine builds its joint lookup.
    pub fn from_value(value: &Value) -> Result<Self, WebkinError> {
        serde_json::from_value(value.clone())
            .map_err(|e| WebkinError::MalformedTree(e.to_string()))
    }

    /// Depth-first lookup by node name.
    pub fn find(&self, name: &str) -> Option<&NodeDoc> {
        if self.name == name {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find(name))
    }
}
