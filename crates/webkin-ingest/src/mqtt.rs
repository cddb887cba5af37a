//! Topic-broker adapter over MQTT.
//!
//! Subscribes to the tree and joints topics and re-subscribes on every
//! ConnAck, so broker restarts recover without intervention. The tree topic
//! is usually published retained by the robot, which means a freshly
//! connected server receives the current tree immediately.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tokio::task::JoinHandle;
use tracing::{info, warn};
use webkin_types::WebkinError;

use crate::{route_payload, Ingest, IngestHandler};

/// Delay before re-polling the event loop after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Broker endpoint and topic pair.
#[derive(Debug, Clone)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub joints_topic: String,
    pub tree_topic: String,
}

/// MQTT implementation of [`Ingest`].
pub struct MqttIngest {
    config: MqttConfig,
    handler: Arc<dyn IngestHandler>,
    client: Option<AsyncClient>,
    task: Option<JoinHandle<()>>,
    connected: Arc<AtomicBool>,
    running: Arc<AtomicBool>,
}

impl MqttIngest {
    /// Create an adapter delivering callbacks to `handler`.
    pub fn new(config: MqttConfig, handler: Arc<dyn IngestHandler>) -> Self {
        Self {
            config,
            handler,
            client: None,
            task: None,
            connected: Arc::new(AtomicBool::new(false)),
            running: Arc::new(AtomicBool::new(false)),
        }
    }
}

#[async_trait]
impl Ingest for MqttIngest {
    async fn connect(&mut self) -> Result<(), WebkinError> {
        let mut options = MqttOptions::new(
            "webkin",
            self.config.broker_host.clone(),
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(60));

        let (client, mut eventloop) = AsyncClient::new(options, 32);
        self.client = Some(client.clone());
        self.running.store(true, Ordering::SeqCst);

        let config = self.config.clone();
        let handler = Arc::clone(&self.handler);
        let connected = Arc::clone(&self.connected);
        let running = Arc::clone(&self.running);

        self.task = Some(tokio::spawn(async move {
            while running.load(Ordering::SeqCst) {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        connected.store(true, Ordering::SeqCst);
                        info!(
                            host = %config.broker_host,
                            port = config.broker_port,
                            "mqtt connected, subscribing"
                        );
                        // Tree updates are rare and must arrive; joint
                        // updates are frequent and lossy is acceptable.
                        if let Err(e) = client
                            .subscribe(config.tree_topic.as_str(), QoS::AtLeastOnce)
                            .await
                        {
                            warn!(topic = %config.tree_topic, error = %e, "subscribe failed");
                        }
                        if let Err(e) = client
                            .subscribe(config.joints_topic.as_str(), QoS::AtMostOnce)
                            .await
                        {
                            warn!(topic = %config.joints_topic, error = %e, "subscribe failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        route_payload(
                            handler.as_ref(),
                            &config.tree_topic,
                            &config.joints_topic,
                            &publish.topic,
                            &publish.payload,
                        );
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        connected.store(false, Ordering::SeqCst);
                        warn!("mqtt broker disconnected, will reconnect");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        connected.store(false, Ordering::SeqCst);
                        if !running.load(Ordering::SeqCst) {
                            break;
                        }
                        warn!(error = %e, "mqtt connection error, retrying");
                        tokio::time::sleep(RECONNECT_DELAY).await;
                    }
                }
            }
        }));

        Ok(())
    }

    async fn disconnect(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(client) = self.client.take() {
            let _ = client.disconnect().await;
        }
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        self.connected.store(false, Ordering::SeqCst);
        info!("mqtt disconnected");
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }
}
