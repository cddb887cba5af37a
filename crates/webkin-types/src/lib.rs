//! `webkin-types` – shared vocabulary of the WebKin server.
//!
//! # Modules
//!
//! - [`math`] – `Vec3` / `Quat` / `Pose`: the `f64` rigid-body kernel the
//!   forward-kinematics pass is built from.
//! - [`doc`] – the recursive tree document (`NodeDoc`, `NodeKind`) as it
//!   travels over MQTT/Crow, REST, and K3D bundles.
//! - [`error`] – [`WebkinError`], the workspace-wide error enum.

pub mod doc;
pub mod error;
pub mod math;

pub use doc::{NodeDoc, NodeKind, ACTUATOR_SLIDER_LIMIT, ROTATOR_SLIDER_LIMIT};
pub use error::WebkinError;
pub use math::{Pose, Quat, Vec3};
