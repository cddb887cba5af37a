//! Datagram pub/sub adapter ("Crow").
//!
//! The crowker broker relays datagrams per topic. The adapter opens an
//! ephemeral UDP endpoint and sends subscribe frames:
//!
//! ```text
//! subscribe: [0x01] [qos: u8] [ack_ms: u16 le] [topic_len: u8] [topic]
//! publish:   [0x02] [topic_len: u8] [topic] [payload]
//! ```
//!
//! The tree topic subscribes reliably (qos 1, ack 100 ms) and a keepalive
//! re-sends that subscription every 2 s so a restarted broker re-learns the
//! endpoint; the joints topic is unreliable (qos 0, ack 50 ms) because
//! updates are frequent and lossy is acceptable.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::{lookup_host, UdpSocket};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use webkin_types::WebkinError;

use crate::{route_payload, Ingest, IngestHandler};

const FRAME_SUBSCRIBE: u8 = 0x01;
const FRAME_PUBLISH: u8 = 0x02;

const TREE_QOS: u8 = 1;
const TREE_ACK_MS: u16 = 100;
const JOINTS_QOS: u8 = 0;
const JOINTS_ACK_MS: u16 = 50;

/// Interval between keepalive re-subscriptions of the tree topic.
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(2);

/// Crowker endpoint and topic pair.
#[derive(Debug, Clone)]
pub struct CrowConfig {
    pub crowker_addr: String,
    pub joints_topic: String,
    pub tree_topic: String,
}

/// Crow datagram implementation of [`Ingest`].
pub struct CrowIngest {
    config: CrowConfig,
    handler: Arc<dyn IngestHandler>,
    socket: Option<Arc<UdpSocket>>,
    recv_task: Option<JoinHandle<()>>,
    keepalive_task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
}

impl CrowIngest {
    /// Create an adapter delivering callbacks to `handler`.
    pub fn new(config: CrowConfig, handler: Arc<dyn IngestHandler>) -> Self {
        Self {
            config,
            handler,
            socket: None,
            recv_task: None,
            keepalive_task: None,
            connected: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Ingest for CrowIngest {
    async fn connect(&mut self) -> Result<(), WebkinError> {
        let broker: SocketAddr = lookup_host(self.config.crowker_addr.as_str())
            .await
            .map_err(|e| WebkinError::Transport(format!("resolve crowker address: {e}")))?
            .next()
            .ok_or_else(|| {
                WebkinError::Transport(format!(
                    "crowker address '{}' resolved to nothing",
                    self.config.crowker_addr
                ))
            })?;

        let socket = Arc::new(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| WebkinError::Transport(format!("open udp endpoint: {e}")))?,
        );

        // Initial subscriptions; delivery to a dead broker fails silently,
        // the keepalive repairs it.
        send_subscribe(&socket, broker, &self.config.tree_topic, TREE_QOS, TREE_ACK_MS).await;
        send_subscribe(
            &socket,
            broker,
            &self.config.joints_topic,
            JOINTS_QOS,
            JOINTS_ACK_MS,
        )
        .await;
        info!(
            crowker = %broker,
            tree = %self.config.tree_topic,
            joints = %self.config.joints_topic,
            "crow subscribed"
        );

        let recv_socket = Arc::clone(&socket);
        let config = self.config.clone();
        let handler = Arc::clone(&self.handler);
        self.recv_task = Some(tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                match recv_socket.recv_from(&mut buf).await {
                    Ok((len, _peer)) => match decode_publish(&buf[..len]) {
                        Some((topic, payload)) => {
                            route_payload(
                                handler.as_ref(),
                                &config.tree_topic,
                                &config.joints_topic,
                                topic,
                                payload,
                            );
                        }
                        None => debug!("dropping malformed crow frame"),
                    },
                    Err(e) => {
                        warn!(error = %e, "crow receive error");
                        break;
                    }
                }
            }
        }));

        let keepalive_socket = Arc::clone(&socket);
        let tree_topic = self.config.tree_topic.clone();
        self.keepalive_task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(KEEPALIVE_PERIOD);
            ticker.tick().await; // immediate first tick already covered above
            loop {
                ticker.tick().await;
                send_subscribe(&keepalive_socket, broker, &tree_topic, TREE_QOS, TREE_ACK_MS)
                    .await;
            }
        }));

        self.socket = Some(socket);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&mut self) {
        if let Some(task) = self.keepalive_task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(task) = self.recv_task.take() {
            task.abort();
            let _ = task.await;
        }
        self.socket = None;
        self.connected.store(false, Ordering::SeqCst);
        info!("crow disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}

async fn send_subscribe(socket: &UdpSocket, broker: SocketAddr, topic: &str, qos: u8, ack_ms: u16) {
    let frame = encode_subscribe(topic, qos, ack_ms);
    if let Err(e) = socket.send_to(&frame, broker).await {
        warn!(%topic, error = %e, "crow subscribe send failed");
    }
}

/// Build a subscribe frame.
fn encode_subscribe(topic: &str, qos: u8, ack_ms: u16) -> Vec<u8> {
    let topic = topic.as_bytes();
    let mut frame = Vec::with_capacity(5 + topic.len());
    frame.push(FRAME_SUBSCRIBE);
    frame.push(qos);
    frame.extend_from_slice(&ack_ms.to_le_bytes());
    frame.push(topic.len() as u8);
    frame.extend_from_slice(topic);
    frame
}

/// Split a publish frame into `(topic, payload)`; `None` when the frame is
/// truncated or not a publish.
fn decode_publish(frame: &[u8]) -> Option<(&str, &[u8])> {
    let (&kind, rest) = frame.split_first()?;
    if kind != FRAME_PUBLISH {
        return None;
    }
    let (&topic_len, rest) = rest.split_first()?;
    if rest.len() < topic_len as usize {
        return None;
    }
    let (topic, payload) = rest.split_at(topic_len as usize);
    Some((std::str::from_utf8(topic).ok()?, payload))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::RecordingHandler;

    fn make_config(addr: &str) -> CrowConfig {
        CrowConfig {
            crowker_addr: addr.to_string(),
            joints_topic: "robot/joints".to_string(),
            tree_topic: "robot/joints/tree".to_string(),
        }
    }

    fn encode_publish(topic: &str, payload: &[u8]) -> Vec<u8> {
        let mut frame = vec![FRAME_PUBLISH, topic.len() as u8];
        frame.extend_from_slice(topic.as_bytes());
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn subscribe_frame_layout() {
        let frame = encode_subscribe("robot/joints/tree", TREE_QOS, TREE_ACK_MS);
        assert_eq!(frame[0], FRAME_SUBSCRIBE);
        assert_eq!(frame[1], 1);
        assert_eq!(u16::from_le_bytes([frame[2], frame[3]]), 100);
        assert_eq!(frame[4] as usize, "robot/joints/tree".len());
        assert_eq!(&frame[5..], b"robot/joints/tree");
    }

    #[test]
    fn publish_frame_roundtrip() {
        let frame = encode_publish("robot/joints", br#"{"joints": {"a": 1.0}}"#);
        let (topic, payload) = decode_publish(&frame).unwrap();
        assert_eq!(topic, "robot/joints");
        assert_eq!(payload, br#"{"joints": {"a": 1.0}}"#);
    }

    #[test]
    fn truncated_frames_are_rejected() {
        assert!(decode_publish(&[]).is_none());
        assert!(decode_publish(&[FRAME_PUBLISH]).is_none());
        assert!(decode_publish(&[FRAME_PUBLISH, 10, b'a']).is_none());
        assert!(decode_publish(&[FRAME_SUBSCRIBE, 1, b'a']).is_none());
    }

    #[tokio::test]
    async fn unresolvable_address_is_a_transport_error() {
        let mut adapter = CrowIngest::new(
            make_config("not an address"),
            Arc::new(RecordingHandler::default()),
        );
        let err = adapter.connect().await.unwrap_err();
        assert!(matches!(err, WebkinError::Transport(_)));
        assert!(!adapter.is_connected());
    }

    #[tokio::test]
    async fn delivers_datagrams_to_handler() {
        // Stand in for the crowker with a plain UDP socket: capture the
        // subscribe frames, then push a publish frame back.
        let broker = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let broker_addr = broker.local_addr().unwrap();

        let handler = Arc::new(RecordingHandler::default());
        let mut adapter = CrowIngest::new(
            make_config(&broker_addr.to_string()),
            Arc::clone(&handler) as Arc<dyn IngestHandler>,
        );
        adapter.connect().await.unwrap();
        assert!(adapter.is_connected());

        // Two initial subscriptions arrive at the broker.
        let mut buf = [0u8; 1024];
        let (len, client_addr) = broker.recv_from(&mut buf).await.unwrap();
        assert_eq!(buf[0], FRAME_SUBSCRIBE);
        assert!(len > 5);
        let _ = broker.recv_from(&mut buf).await.unwrap();

        // Publish a joints frame back at the adapter's endpoint.
        let frame = encode_publish("robot/joints", br#"{"joints": {"elbow": 2.0}}"#);
        broker.send_to(&frame, client_addr).await.unwrap();

        // The receive task runs concurrently; poll briefly.
        for _ in 0..50 {
            if !handler.joints.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let joints = handler.joints.lock().unwrap();
        assert_eq!(joints.len(), 1, "joints callback should have fired");
        assert_eq!(joints[0]["elbow"], 2.0);
        drop(joints);

        adapter.disconnect().await;
        assert!(!adapter.is_connected());
    }
}
