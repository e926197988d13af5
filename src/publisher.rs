//! Broker publisher for telemetry frames
//!
//! Wraps a rumqttc client with a spawned event loop. Publish failures are the
//! caller's to log and ignore; a lost broker must never fail a poll tick.

use async_trait::async_trait;
use rumqttc::{AsyncClient, MqttOptions, QoS, Transport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::config::Config;
use crate::error::{Result, TankSrvError};
use crate::frame::TelemetryFrame;

/// Publish seam between the poller and the broker.
#[async_trait]
pub trait FramePublisher: Send + Sync {
    async fn publish_frame(&self, frame: &TelemetryFrame) -> Result<()>;
}

pub struct MqttPublisher {
    client: AsyncClient,
    namespace: String,
    qos: QoS,
    retain: bool,
    connected: Arc<AtomicBool>,
}

fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        2 => QoS::ExactlyOnce,
        _ => QoS::AtLeastOnce,
    }
}

impl MqttPublisher {
    /// Create the client and spawn its event loop.
    pub fn connect(config: &Config) -> Self {
        let client_id = format!("tanksrv-{}", config.site_id);
        let mut options = MqttOptions::new(client_id, &config.mqtt_host, config.mqtt_port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&config.mqtt_username, &config.mqtt_password) {
            options.set_credentials(username, password);
        }
        if config.mqtt_tls {
            options.set_transport(Transport::tls_with_default_config());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);
        let connected = Arc::new(AtomicBool::new(false));

        let flag = connected.clone();
        let host = config.mqtt_host.clone();
        tokio::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(event) => {
                        flag.store(true, Ordering::Relaxed);
                        debug!("mqtt event: {event:?}");
                    },
                    Err(e) => {
                        flag.store(false, Ordering::Relaxed);
                        error!("mqtt connection error ({host}): {e}");
                        // rumqttc reconnects on the next poll; pace the loop.
                        tokio::time::sleep(Duration::from_secs(5)).await;
                    },
                }
            }
        });

        info!(
            host = %config.mqtt_host,
            port = config.mqtt_port,
            "mqtt publisher started"
        );

        MqttPublisher {
            client,
            namespace: config.mqtt_namespace.clone(),
            qos: qos_from_level(config.mqtt_qos),
            retain: false,
            connected,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            error!("error disconnecting from mqtt broker: {e}");
        }
    }

    fn topic_for(&self, frame: &TelemetryFrame) -> String {
        format!(
            "{}/{}/{}/{}/telemetry",
            self.namespace, frame.site_id, frame.tank_id, frame.device_id
        )
    }
}

#[async_trait]
impl FramePublisher for MqttPublisher {
    async fn publish_frame(&self, frame: &TelemetryFrame) -> Result<()> {
        let topic = self.topic_for(frame);
        let payload = serde_json::to_vec(frame)?;
        self.client
            .publish(&topic, self.qos, self.retain, payload)
            .await
            .map_err(|e| TankSrvError::PublishError(format!("publish to {topic} failed: {e}")))?;
        debug!(%topic, "frame published");
        Ok(())
    }
}
