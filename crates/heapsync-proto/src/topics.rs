//! MQTT topic scheme.
//!
//! Topic structure: `heapsync/v1/{tenant}/{heap_id}/{message_type}`
//!
//! Heap ids are percent-encoded so that `/`, `+` and `#` never reach the
//! broker as topic syntax.

use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// Protocol version for topic scheme.
pub const PROTOCOL_VERSION: &str = "v1";

/// Default MQTT port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'/')
    .add(b'+')
    .add(b'#')
    .add(b'%');

/// Topic scheme configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicScheme {
    /// Tenant identifier
    pub tenant: String,
    /// Topic prefix (default: "heapsync")
    pub prefix: String,
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("default")
    }
}

impl TopicScheme {
    /// Create a topic scheme for `tenant`.
    #[must_use]
    pub fn new(tenant: impl Into<String>) -> Self {
        Self {
            tenant: tenant.into(),
            prefix: "heapsync".to_string(),
        }
    }

    fn tenant_base(&self) -> String {
        format!("{}/{}/{}", self.prefix, PROTOCOL_VERSION, self.tenant)
    }

    fn base(&self, heap_id: &str) -> String {
        format!(
            "{}/{}",
            self.tenant_base(),
            utf8_percent_encode(heap_id, SEGMENT)
        )
    }

    /// Topic clients publish [`SubscribeRequest`](crate::SubscribeRequest)s to.
    #[must_use]
    pub fn subscribe(&self, heap_id: &str) -> String {
        format!("{}/subscribe", self.base(heap_id))
    }

    /// Topic clients publish [`UnsubscribeRequest`](crate::UnsubscribeRequest)s to.
    #[must_use]
    pub fn unsubscribe(&self, heap_id: &str) -> String {
        format!("{}/unsubscribe", self.base(heap_id))
    }

    /// Topic carrying one subscriber's frames.
    #[must_use]
    pub fn frames(&self, heap_id: &str, subscriber_id: Uuid) -> String {
        format!("{}/sub/{subscriber_id}", self.base(heap_id))
    }

    /// Wildcards covering every heap's control topics.
    #[must_use]
    pub fn control_wildcards(&self) -> [String; 2] {
        let base = self.tenant_base();
        [format!("{base}/+/subscribe"), format!("{base}/+/unsubscribe")]
    }

    /// Parse a topic to extract components.
    ///
    /// Returns `(heap_id, message_type)` if valid.
    #[must_use]
    pub fn parse(&self, topic: &str) -> Option<(String, MessageType)> {
        let expected_prefix = format!("{}/", self.tenant_base());
        let remainder = topic.strip_prefix(&expected_prefix)?;
        let parts: Vec<&str> = remainder.split('/').collect();

        let heap_id = percent_decode_str(parts.first()?)
            .decode_utf8()
            .ok()?
            .into_owned();
        let msg_type = match parts.get(1..)? {
            ["subscribe"] => MessageType::Subscribe,
            ["unsubscribe"] => MessageType::Unsubscribe,
            ["sub", id] => MessageType::Frames(Uuid::parse_str(id).ok()?),
            _ => return None,
        };

        Some((heap_id, msg_type))
    }
}

/// Message types in the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Subscribe request
    Subscribe,
    /// Unsubscribe request
    Unsubscribe,
    /// Frames for one subscriber
    Frames(Uuid),
}

/// Parse a broker address into host and port.
///
/// Accepts `tcp://host[:port]`, `mqtt://host[:port]` or bare `host[:port]`;
/// the port defaults to 1883.
///
/// # Errors
///
/// Returns [`BrokerUrlError`] for unsupported schemes, missing hosts or bad
/// ports.
pub fn parse_broker_url(input: &str) -> Result<(String, u16), BrokerUrlError> {
    let invalid = |reason: String| BrokerUrlError(format!("{input}: {reason}"));

    if input.contains("://") {
        let url = Url::parse(input).map_err(|e| invalid(e.to_string()))?;
        match url.scheme() {
            "tcp" | "mqtt" => {}
            scheme => return Err(invalid(format!("unsupported scheme '{scheme}'"))),
        }
        let host = url
            .host_str()
            .ok_or_else(|| invalid("missing host".into()))?;
        return Ok((host.to_string(), url.port().unwrap_or(DEFAULT_MQTT_PORT)));
    }

    let mut parts = input.split(':');
    let host = parts
        .next()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| invalid("missing host".into()))?;
    let port = match parts.next() {
        None => DEFAULT_MQTT_PORT,
        Some(port) => port
            .parse()
            .map_err(|_| invalid(format!("invalid port '{port}'")))?,
    };
    if parts.next().is_some() {
        return Err(invalid("too many ':' separators".into()));
    }
    Ok((host.to_string(), port))
}

/// An unusable MQTT broker address.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid MQTT broker URL: {0}")]
pub struct BrokerUrlError(String);
