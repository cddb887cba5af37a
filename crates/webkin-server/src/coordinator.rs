//! The scene coordinator.
//!
//! One value owns everything mutable: the kinematic tree, the document it
//! was loaded from, the calibration store, the WebSocket client registry,
//! and the z-up flag. A single mutex (the scene lock) guards all of it, and
//! every mutation runs its full cycle — apply, forward pass, message
//! composition, per-client enqueue — inside one critical section, so no
//! client ever observes a partially updated tree and any two updates reach
//! every client in the same serialization order.
//!
//! Coarse locking is deliberate: the forward pass is O(nodes) over small
//! trees, and sends are non-blocking channel enqueues, so nothing suspends
//! while the lock is held.

use std::collections::HashMap;
use std::sync::Mutex;

use axum::extract::ws::Message;
use serde_json::{json, Value};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};
use uuid::Uuid;

use webkin_ingest::IngestHandler;
use webkin_kinematics::{AxisOverride, CalibrationStore, KinematicTree};
use webkin_types::{NodeDoc, WebkinError};

/// Authoritative scene state behind the scene lock.
struct SceneState {
    tree: KinematicTree,
    /// Original document as loaded: raw for `GET /api/tree`, parsed for
    /// restoring declared calibration values.
    doc: Option<LoadedDoc>,
    overrides: CalibrationStore,
    clients: HashMap<Uuid, UnboundedSender<Message>>,
    z_up: bool,
}

struct LoadedDoc {
    raw: Value,
    parsed: NodeDoc,
}

/// Single entry point for every tree, joint, override, and client mutation.
pub struct Coordinator {
    state: Mutex<SceneState>,
}

impl Coordinator {
    /// Create a coordinator with an empty tree.
    pub fn new(overrides: CalibrationStore, z_up: bool) -> Self {
        Self {
            state: Mutex::new(SceneState {
                tree: KinematicTree::default(),
                doc: None,
                overrides,
                clients: HashMap::new(),
                z_up,
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SceneState> {
        self.state.lock().expect("scene lock poisoned")
    }

    /// Replace the tree from a raw document.
    ///
    /// Known calibration overrides are re-applied before the first forward
    /// pass, then every client receives a `scene_init`. On failure the
    /// previous tree stays in place and nothing is broadcast.
    pub fn load_tree(&self, raw: Value) -> Result<Vec<String>, WebkinError> {
        let mut st = self.lock();
        let parsed = NodeDoc::from_value(&raw)?;
        let mut tree = KinematicTree::from_doc(&parsed)?;
        st.overrides.apply_to(&mut tree);
        tree.update_forward();

        st.tree = tree;
        st.doc = Some(LoadedDoc { raw, parsed });
        let joints = st.tree.joint_names();
        info!(joints = ?joints, "tree loaded");

        let msg = scene_init_message(&st);
        broadcast(&mut st, msg);
        Ok(joints)
    }

    /// Apply a joint-coordinate batch and broadcast a `scene_update`.
    /// Unknown joint names are ignored.
    pub fn set_joint_coords(&self, coords: &HashMap<String, f64>) {
        let mut st = self.lock();
        st.tree.set_joint_coords(coords);
        st.tree.update_forward();
        let msg = scene_update_message(&st);
        broadcast(&mut st, msg);
    }

    /// Zero the named joint at its current coordinate; persists the derived
    /// offset and broadcasts. Returns the new offset.
    pub fn set_zero(&self, name: &str) -> Result<f64, WebkinError> {
        let mut st = self.lock();
        let st = &mut *st;
        let offset = st.overrides.set_zero(&mut st.tree, name)?;
        st.tree.update_forward();
        let msg = scene_update_message(st);
        broadcast(st, msg);
        Ok(offset)
    }

    /// Merge a partial calibration override into the named joint; persists
    /// and broadcasts.
    pub fn set_override(&self, name: &str, patch: AxisOverride) -> Result<(), WebkinError> {
        let mut st = self.lock();
        let st = &mut *st;
        st.overrides.set_override(&mut st.tree, name, patch)?;
        st.tree.update_forward();
        let msg = scene_update_message(st);
        broadcast(st, msg);
        Ok(())
    }

    /// Drop every override and restore the tree to its declared state.
    ///
    /// The restore is a reload of the original document, so clients receive
    /// a `scene_init`. With no document loaded the file is still cleared.
    pub fn clear_overrides(&self) -> Result<(), WebkinError> {
        let mut st = self.lock();
        let st = &mut *st;
        match &st.doc {
            Some(doc) => {
                st.overrides.clear_all(&mut st.tree, &doc.parsed)?;
                st.tree.update_forward();
                let msg = scene_init_message(st);
                broadcast(st, msg);
            }
            None => st.overrides.clear(),
        }
        Ok(())
    }

    /// Drop one override and restore that joint's declared parameters;
    /// broadcasts a `scene_update`.
    pub fn clear_override(&self, name: &str) -> Result<(), WebkinError> {
        let mut st = self.lock();
        let st = &mut *st;
        let doc = st
            .doc
            .as_ref()
            .ok_or_else(|| WebkinError::UnknownJoint(name.to_string()))?;
        st.overrides.clear_one(&mut st.tree, &doc.parsed, name)?;
        st.tree.update_forward();
        let msg = scene_update_message(st);
        broadcast(st, msg);
        Ok(())
    }

    /// The current override map as `{"overrides": {...}}`.
    pub fn overrides_json(&self) -> Value {
        let st = self.lock();
        json!({
            "overrides": serde_json::to_value(st.overrides.overrides())
                .unwrap_or(Value::Null)
        })
    }

    /// The current scene snapshot.
    pub fn scene_json(&self) -> Value {
        Value::Object(self.lock().tree.scene_snapshot())
    }

    /// The original tree document, if one has been loaded.
    pub fn tree_doc(&self) -> Option<Value> {
        self.lock().doc.as_ref().map(|d| d.raw.clone())
    }

    /// Register a WebSocket client and hand it its `scene_init`.
    pub fn register_client(&self, tx: UnboundedSender<Message>) -> Uuid {
        let mut st = self.lock();
        let init = scene_init_message(&st);
        let id = Uuid::new_v4();
        if tx.send(Message::Text(init.into())).is_err() {
            debug!(client = %id, "client closed before scene_init");
        }
        st.clients.insert(id, tx);
        info!(client = %id, total = st.clients.len(), "client connected");
        id
    }

    /// Remove a client after its socket closed.
    pub fn unregister_client(&self, id: Uuid) {
        let mut st = self.lock();
        st.clients.remove(&id);
        info!(client = %id, total = st.clients.len(), "client disconnected");
    }

    /// Number of registered clients.
    pub fn client_count(&self) -> usize {
        self.lock().clients.len()
    }
}

impl IngestHandler for Coordinator {
    fn on_tree(&self, doc: Value) {
        match self.load_tree(doc) {
            Ok(joints) => info!(count = joints.len(), "tree received from transport"),
            Err(e) => warn!(error = %e, "transport tree rejected, keeping previous"),
        }
    }

    fn on_joints(&self, joints: HashMap<String, f64>) {
        self.set_joint_coords(&joints);
    }
}

fn scene_init_message(st: &SceneState) -> String {
    json!({
        "type": "scene_init",
        "nodes": Value::Object(st.tree.scene_snapshot()),
        "joints": st.tree.joint_names(),
        "jointsInfo": Value::Object(st.tree.joints_info()),
        "zUp": st.z_up,
    })
    .to_string()
}

fn scene_update_message(st: &SceneState) -> String {
    json!({
        "type": "scene_update",
        "nodes": Value::Object(st.tree.scene_snapshot()),
        "jointsInfo": Value::Object(st.tree.joints_info()),
    })
    .to_string()
}

/// Enqueue `text` to every client. A failed enqueue means the receiver task
/// is gone; the handle is dropped and the broadcast continues.
fn broadcast(st: &mut SceneState, text: String) {
    let mut dead = Vec::new();
    for (id, tx) in &st.clients {
        if tx.send(Message::Text(text.clone().into())).is_err() {
            dead.push(*id);
        }
    }
    for id in dead {
        st.clients.remove(&id);
        debug!(client = %id, "dropped dead client during broadcast");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Tests
// ────────────────────────────────────────────────────────────────────────────
