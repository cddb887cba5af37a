//! `webkin-kinematics` – the forward-kinematics engine.
//!
//! # Modules
//!
//! - [`tree`] – arena-based [`KinematicTree`]: tree load, joint addressing,
//!   the forward pass, and scene/joint snapshots.
//! - [`calibration`] – [`CalibrationStore`]: per-joint overrides persisted to
//!   `axis_overrides.json` and applied on top of every loaded tree.

pub mod calibration;
pub mod tree;

pub use calibration::{default_store_path, AxisOverride, CalibrationStore, OVERRIDES_FILE};
pub use tree::{find_original_axis_params, AxisParams, KinematicTree, Node};
