use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde::Serialize;
use tokio::time::Duration;
use tracing::{error, info, warn};

use crate::config::MqttConfig;
use crate::errors::{MotionError, Result};
use crate::notifier::{MotionEvent, Notifier};

pub struct MqttPublisher {
    client: AsyncClient,
    eventloop: EventLoop,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        // Parse the broker URL to extract host and port
        let url = url::Url::parse(&config.broker_url)
            .map_err(|e| MotionError::mqtt(format!("Invalid MQTT broker URL '{}': {}", config.broker_url, e)))?;

        let host = url.host_str()
            .ok_or_else(|| MotionError::mqtt(format!("No host found in MQTT broker URL: {}", config.broker_url)))?;

        let port = url.port().unwrap_or(1883);

        info!("Connecting to MQTT broker at {}:{}", host, port);

        let mut mqtt_options = MqttOptions::new(&config.client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));

        if let Some(username) = &config.username {
            if let Some(password) = &config.password {
                mqtt_options.set_credentials(username, password);
            }
        }

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok(Self { client, eventloop, config })
    }

    /// Drive the connection on a background task and hand out a cloneable
    /// publishing handle.
    pub fn start(mut self) -> MqttHandle {
        let handle = MqttHandle {
            client: self.client.clone(),
            config: self.config.clone(),
        };

        tokio::spawn(async move {
            loop {
                match self.eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("Connected to MQTT broker");
                    }
                    Ok(Event::Incoming(Packet::Disconnect)) => {
                        warn!("Disconnected from MQTT broker");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT connection error: {}", e);
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    }
                }
            }
        });

        handle
    }
}

#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    config: MqttConfig,
}

impl MqttHandle {
    fn qos(&self) -> QoS {
        qos_from_level(self.config.qos)
    }

    pub fn base_topic(&self) -> &str {
        &self.config.base_topic
    }

    pub async fn publish_json<T: Serialize>(&self, topic: &str, payload: &T) -> Result<()> {
        let payload = serde_json::to_vec(payload)?;
        self.client
            .publish(topic, self.qos(), self.config.retain, payload)
            .await?;
        Ok(())
    }
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

pub fn motion_topic(base_topic: &str, camera: &str, topic_name: Option<&str>) -> String {
    match topic_name {
        Some(topic) => topic.to_string(),
        None => format!("{}/cameras/{}/motion", base_topic, camera),
    }
}

/// Publishes motion events as JSON to `<base_topic>/cameras/<name>/motion`
/// (or the camera's own topic).
pub struct MqttNotifier {
    handle: MqttHandle,
    topic: String,
}

impl MqttNotifier {
    pub fn new(handle: MqttHandle, camera: &str, topic_name: Option<&str>) -> Self {
        let topic = motion_topic(handle.base_topic(), camera, topic_name);
        Self { handle, topic }
    }
}

#[async_trait]
impl Notifier for MqttNotifier {
    async fn notify(&self, event: &MotionEvent) -> Result<()> {
        self.handle.publish_json(&self.topic, event).await
    }

    fn name(&self) -> &'static str {
        "mqtt"
    }
}
