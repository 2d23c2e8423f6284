//! MQTT transport for control requests and subscriber frames.

use heapsync_proto::{parse_broker_url, TopicScheme};
use rumqttc::{AsyncClient, EventLoop, MqttOptions, QoS};
use std::time::Duration;
use tokio::sync::mpsc;

/// An encoded message waiting to go out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outgoing {
    /// Destination topic
    pub topic: String,
    /// Encoded message
    pub payload: Vec<u8>,
}

/// MQTT client wrapper for the server.
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
    topic_scheme: TopicScheme,
}

impl MqttTransport {
    /// Create a new transport.
    ///
    /// # Errors
    ///
    /// Returns error if the broker URL is invalid.
    pub fn new(
        mqtt_broker: &str,
        client_id: &str,
        topic_scheme: TopicScheme,
    ) -> Result<(Self, EventLoop), ReplicationError> {
        let (host, port) = parse_broker_url(mqtt_broker)
            .map_err(|e| ReplicationError::InvalidBrokerUrl(e.to_string()))?;

        let mut mqtt_options = MqttOptions::new(client_id, host, port);
        mqtt_options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqtt_options, 100);

        Ok((
            Self {
                client,
                topic_scheme,
            },
            eventloop,
        ))
    }

    /// Subscribe to subscribe/unsubscribe requests for every heap.
    ///
    /// # Errors
    ///
    /// Returns error if subscription fails.
    pub async fn subscribe_control(&self) -> Result<(), ReplicationError> {
        for topic in self.topic_scheme.control_wildcards() {
            tracing::info!(topic = %topic, "Subscribing to control topic");
            self.client
                .subscribe(&topic, QoS::AtLeastOnce)
                .await
                .map_err(|e| ReplicationError::Subscribe(e.to_string()))?;
        }
        Ok(())
    }

    /// Publish one message.
    ///
    /// # Errors
    ///
    /// Returns error if publish fails.
    pub async fn publish(&self, outgoing: Outgoing) -> Result<(), ReplicationError> {
        tracing::debug!(
            topic = %outgoing.topic,
            payload_len = outgoing.payload.len(),
            "Publishing frame"
        );

        self.client
            .publish(outgoing.topic, QoS::AtLeastOnce, false, outgoing.payload)
            .await
            .map_err(|e| ReplicationError::Publish(e.to_string()))
    }

    /// Publish everything sent to `outbox` until every sender is gone.
    pub async fn drain(self, mut outbox: mpsc::Receiver<Outgoing>) {
        while let Some(outgoing) = outbox.recv().await {
            let topic = outgoing.topic.clone();
            if let Err(err) = self.publish(outgoing).await {
                tracing::warn!(error = %err, topic = %topic, "Failed to publish frame");
            }
        }
    }
}

/// Errors for replication operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ReplicationError {
    /// Subscription failed
    #[error("subscription error: {0}")]
    Subscribe(String),
    /// Invalid MQTT broker URL
    #[error("{0}")]
    InvalidBrokerUrl(String),
    /// Publish failed
    #[error("publish error: {0}")]
    Publish(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unsupported_broker_scheme() {
        let result = MqttTransport::new("http://localhost", "test", TopicScheme::default());
        assert!(matches!(result, Err(ReplicationError::InvalidBrokerUrl(_))));
    }
}
