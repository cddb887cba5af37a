//! `webkin-ingest` – transport adapters feeding the scene coordinator.
//!
//! The server never speaks MQTT or Crow directly. It hands an
//! [`IngestHandler`] to one adapter and receives uniform callbacks:
//!
//! - `on_tree(doc)` – a full kinematic tree document arrived.
//! - `on_joints(map)` – a batch of joint coordinates arrived.
//!
//! Both adapters implement the same [`Ingest`] lifecycle, decode identical
//! JSON payloads on their own transport task, and drop undecodable messages
//! without tearing down the subscription. The handler's entry points take
//! the scene lock themselves, so callbacks may fire from any task at any
//! time.
//!
//! # Modules
//!
//! - [`mqtt`] – [`MqttIngest`]: topic broker adapter over `rumqttc`.
//! - [`crow`] – [`CrowIngest`]: datagram pub/sub adapter over UDP.

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, warn};
use webkin_types::WebkinError;

pub mod crow;
pub mod mqtt;

pub use crow::{CrowConfig, CrowIngest};
pub use mqtt::{MqttConfig, MqttIngest};

/// Receiver of decoded transport traffic.
///
/// Implemented by the scene coordinator; both callbacks are re-entrant-safe
/// and may be invoked from any transport task.
pub trait IngestHandler: Send + Sync {
    /// A complete tree document was published.
    fn on_tree(&self, doc: Value);

    /// A joint-coordinate batch was published.
    fn on_joints(&self, joints: HashMap<String, f64>);
}

/// Uniform adapter lifecycle.
#[async_trait]
pub trait Ingest: Send {
    /// Open the transport and start delivering callbacks.
    ///
    /// A broker that is unreachable right now is not an error: adapters log
    /// and keep retrying in the background, and the server serves its
    /// fallback content meanwhile.
    async fn connect(&mut self) -> Result<(), WebkinError>;

    /// Stop the transport tasks and close the endpoint.
    async fn disconnect(&mut self);

    /// Whether the transport currently has a live broker session.
    fn is_connected(&self) -> bool;
}

/// Decode a payload for `topic` and invoke the matching callback.
///
/// Parse failures are logged and swallowed: one bad packet must not take the
/// subscription down.
pub(crate) fn route_payload(
    handler: &dyn IngestHandler,
    tree_topic: &str,
    joints_topic: &str,
    topic: &str,
    payload: &[u8],
) {
    let parsed: Value = match serde_json::from_slice(payload) {
        Ok(v) => v,
        Err(e) => {
            warn!(%topic, error = %e, "dropping undecodable payload");
            return;
        }
    };

    if topic == tree_topic {
        handler.on_tree(parsed);
    } else if topic == joints_topic {
        match decode_joints(&parsed) {
            Some(joints) => handler.on_joints(joints),
            None => debug!(%topic, "joints payload carried no joints"),
        }
    } else {
        debug!(%topic, "message on unsubscribed topic");
    }
}

/// Extract the `{"joints": {name: value}}` map; `None` when the key is
/// missing or empty. Non-numeric values coerce to zero, matching the lenient
/// numeric handling everywhere else on the wire.
fn decode_joints(payload: &Value) -> Option<HashMap<String, f64>> {
    let map = payload.get("joints")?.as_object()?;
    if map.is_empty() {
        return None;
    }
    Some(
        map.iter()
            .map(|(k, v)| (k.clone(), v.as_f64().unwrap_or(0.0)))
            .collect(),
    )
}
