//! Rigid-body math kernel.
//!
//! `Vec3`, `Quat`, and `Pose` are the only geometric currency of the server:
//! every node's rest pose, joint transform, and computed global pose is a
//! [`Pose`], and pose composition is the single operation the forward pass is
//! built from.
//!
//! All arithmetic is `f64` and allocation-free; composition of equal inputs
//! is bit-reproducible.

use serde::{Deserialize, Serialize};

// ────────────────────────────────────────────────────────────────────────────
// Vec3
// ────────────────────────────────────────────────────────────────────────────

/// A 3-D vector, serialized on the wire as `[x, y, z]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 3]", into = "[f64; 3]")]
pub struct Vec3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vec3 {
    /// Create a new vector.
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    /// The zero vector.
    pub fn zero() -> Self {
        Self::new(0.0, 0.0, 0.0)
    }

    /// Component-wise sum.
    pub fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }

    /// Multiply every component by `scalar`.
    pub fn scaled(self, scalar: f64) -> Self {
        Self::new(self.x * scalar, self.y * scalar, self.z * scalar)
    }
}

impl Default for Vec3 {
    fn default() -> Self {
        Self::zero()
    }
}

impl From<[f64; 3]> for Vec3 {
    fn from([x, y, z]: [f64; 3]) -> Self {
        Self::new(x, y, z)
    }
}

impl From<Vec3> for [f64; 3] {
    fn from(v: Vec3) -> Self {
        [v.x, v.y, v.z]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Quat
// ────────────────────────────────────────────────────────────────────────────

/// A rotation quaternion in `(x, y, z, w)` component order, serialized on the
/// wire as `[x, y, z, w]`.
///
/// Wire inputs are normalized on entry (a zero-norm array falls back to the
/// identity), so every quaternion read from a document or a message is unit.
/// [`Quat::from_axis_angle`] does **not** renormalize its axis; callers that
/// want unit axes must pass them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(from = "[f64; 4]", into = "[f64; 4]")]
pub struct Quat {
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub w: f64,
}

impl Quat {
    /// Create a quaternion from raw components, without normalization.
    pub fn new(x: f64, y: f64, z: f64, w: f64) -> Self {
        Self { x, y, z, w }
    }

    /// The identity rotation.
    pub fn identity() -> Self {
        Self::new(0.0, 0.0, 0.0, 1.0)
    }

    /// Hamilton product: `self` followed-by-composition with `rhs`.
    pub fn mul(self, rhs: Self) -> Self {
        Self::new(
            self.w * rhs.x + self.x * rhs.w + self.y * rhs.z - self.z * rhs.y,
            self.w * rhs.y - self.x * rhs.z + self.y * rhs.w + self.z * rhs.x,
            self.w * rhs.z + self.x * rhs.y - self.y * rhs.x + self.z * rhs.w,
            self.w * rhs.w - self.x * rhs.x - self.y * rhs.y - self.z * rhs.z,
        )
    }

    /// Rotate a vector via the sandwich `q · (v, 0) · q*`.
    pub fn rotate_vec(self, v: Vec3) -> Vec3 {
        let qv = Self::new(v.x, v.y, v.z, 0.0);
        let conj = Self::new(-self.x, -self.y, -self.z, self.w);
        let r = self.mul(qv).mul(conj);
        Vec3::new(r.x, r.y, r.z)
    }

    /// Rotation of `angle` radians about `axis`.
    ///
    /// The axis is used as given; a non-unit axis yields a non-unit result.
    pub fn from_axis_angle(axis: Vec3, angle: f64) -> Self {
        let half = angle / 2.0;
        let s = half.sin();
        Self::new(axis.x * s, axis.y * s, axis.z * s, half.cos())
    }

    /// Unit-length copy; a zero-norm quaternion becomes the identity.
    pub fn normalized(self) -> Self {
        let n = (self.x * self.x + self.y * self.y + self.z * self.z + self.w * self.w).sqrt();
        if n == 0.0 {
            return Self::identity();
        }
        Self::new(self.x / n, self.y / n, self.z / n, self.w / n)
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::identity()
    }
}

impl From<[f64; 4]> for Quat {
    fn from([x, y, z, w]: [f64; 4]) -> Self {
        Self::new(x, y, z, w).normalized()
    }
}

impl From<Quat> for [f64; 4] {
    fn from(q: Quat) -> Self {
        [q.x, q.y, q.z, q.w]
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Pose
// ────────────────────────────────────────────────────────────────────────────

/// A rigid transform: position plus orientation.
///
/// Composition is non-commutative: `a.compose(b)` applies `b` in `a`'s frame,
/// i.e. `(p_a + q_a · p_b, q_a · q_b)`.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Pose {
    #[serde(default)]
    pub position: Vec3,
    #[serde(default)]
    pub orientation: Quat,
}

impl Pose {
    /// Create a pose from a position and orientation.
    pub fn new(position: Vec3, orientation: Quat) -> Self {
        Self {
            position,
            orientation,
        }
    }

    /// The identity pose `(0, identity)`.
    pub fn identity() -> Self {
        Self::new(Vec3::zero(), Quat::identity())
    }

    /// Compose two poses: `self` applied first, then `other` in `self`'s
    /// frame.
    pub fn compose(self, other: Self) -> Self {
        Self::new(
            self.position.add(self.orientation.rotate_vec(other.position)),
            self.orientation.mul(other.orientation),
        )
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::{FRAC_PI_2, FRAC_1_SQRT_2};

    #[test]
    fn identity_rotate_is_noop() {
        let q = Quat::identity();
        let v = Vec3::new(1.0, 2.0, 3.0);
        let r = q.rotate_vec(v);
        assert!((r.x - 1.0).abs() < 1e-12);
        assert!((r.y - 2.0).abs() < 1e-12);
        assert!((r.z - 3.0).abs() < 1e-12);
    }

    #[test]
    fn quarter_turn_about_z_rotates_x_to_y() {
        let q = Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), FRAC_PI_2);
        let r = q.rotate_vec(Vec3::new(1.0, 0.0, 0.0));
        assert!(r.x.abs() < 1e-12, "x should be ~0, got {}", r.x);
        assert!((r.y - 1.0).abs() < 1e-12, "y should be ~1, got {}", r.y);
        assert!(r.z.abs() < 1e-12);
    }

    #[test]
    fn axis_angle_components_match_half_angle_formula() {
        let q = Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), FRAC_PI_2);
        assert!((q.z - FRAC_1_SQRT_2).abs() < 1e-12);
        assert!((q.w - FRAC_1_SQRT_2).abs() < 1e-12);
        assert!(q.x.abs() < 1e-12);
        assert!(q.y.abs() < 1e-12);
    }

    #[test]
    fn axis_angle_does_not_renormalize_axis() {
        let unit = Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), 1.0);
        let doubled = Quat::from_axis_angle(Vec3::new(0.0, 0.0, 2.0), 1.0);
        assert!((doubled.z - 2.0 * unit.z).abs() < 1e-12);
        assert!((doubled.w - unit.w).abs() < 1e-12);
    }

    #[test]
    fn compose_translations_add() {
        let a = Pose::new(Vec3::new(1.0, 0.0, 0.0), Quat::identity());
        let b = Pose::new(Vec3::new(2.0, 0.0, 0.0), Quat::identity());
        let c = a.compose(b);
        assert!((c.position.x - 3.0).abs() < 1e-12);
    }

    #[test]
    fn compose_rotates_child_position() {
        // Parent rotated 90° about Z carries a child 1 m along local +X to
        // world +Y.
        let parent = Pose::new(
            Vec3::zero(),
            Quat::from_axis_angle(Vec3::new(0.0, 0.0, 1.0), FRAC_PI_2),
        );
        let child = Pose::new(Vec3::new(1.0, 0.0, 0.0), Quat::identity());
        let c = parent.compose(child);
        assert!(c.position.x.abs() < 1e-12);
        assert!((c.position.y - 1.0).abs() < 1e-12);
    }

    #[test]
    fn compose_identity_is_noop() {
        let p = Pose::new(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::from_axis_angle(Vec3::new(0.0, 1.0, 0.0), 0.3),
        );
        let left = Pose::identity().compose(p);
        let right = p.compose(Pose::identity());
        assert_eq!(left, p);
        assert_eq!(right, p);
    }

    #[test]
    fn vec3_wire_roundtrip() {
        let v: Vec3 = serde_json::from_str("[1.5, -2.0, 0.25]").unwrap();
        assert_eq!(v, Vec3::new(1.5, -2.0, 0.25));
        assert_eq!(serde_json::to_string(&v).unwrap(), "[1.5,-2.0,0.25]");
    }

    #[test]
    fn quat_wire_input_is_normalized() {
        let q: Quat = serde_json::from_str("[0.0, 0.0, 0.0, 2.0]").unwrap();
        assert_eq!(q, Quat::identity());
    }

    #[test]
    fn quat_zero_norm_input_falls_back_to_identity() {
        let q: Quat = serde_json::from_str("[0.0, 0.0, 0.0, 0.0]").unwrap();
        assert_eq!(q, Quat::identity());
    }

    #[test]
    fn pose_wire_shape() {
        let p = Pose::new(Vec3::new(1.0, 0.0, 0.0), Quat::identity());
        let json = serde_json::to_value(&p).unwrap();
        assert_eq!(json["position"][0], 1.0);
        assert_eq!(json["orientation"][3], 1.0);
    }
}
