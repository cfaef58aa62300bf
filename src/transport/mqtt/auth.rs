//! Authentication over the message broker
//!
//! Connects to the auth broker with the system key and secret, subscribes to
//! the per-user reply topic and waits for a binary reply carrying a session
//! token, the user id and optionally a broker address to use from then on.

use super::client::{MqttConnection, DISCONNECT_QUIESCE};
use super::connection::{ConnectOptions, MqttError, MqttTls};
use crate::config::MqttSection;
use bytes::Buf;
use rumqttc::QoS;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Parameters of one broker-based login
#[derive(Clone, Default)]
pub struct MqttAuthRequest {
    pub username: String,
    pub password: String,
    /// Reply topic; defaults to `{system_key}/{username}`
    pub reply_topic: Option<String>,
    /// Overrides `mqtt.auth_reply_timeout_secs`
    pub reply_timeout: Option<Duration>,
    pub tls: Option<MqttTls>,
}

impl MqttAuthRequest {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            ..Self::default()
        }
    }

    pub fn reply_topic_for(&self, system_key: &str) -> String {
        self.reply_topic
            .clone()
            .unwrap_or_else(|| format!("{system_key}/{}", self.username))
    }
}

impl std::fmt::Debug for MqttAuthRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttAuthRequest")
            .field("username", &self.username)
            .field("reply_topic", &self.reply_topic)
            .field("reply_timeout", &self.reply_timeout)
            .field("tls", &self.tls)
            .finish_non_exhaustive()
    }
}

/// Decoded reply of the auth broker
#[derive(Clone, PartialEq, Eq)]
pub struct MqttAuthReply {
    pub token: String,
    pub user_id: String,
    /// Broker the client should use from now on
    pub broker_address: Option<String>,
}

impl MqttAuthReply {
    /// Parse consecutive big-endian u16 length-prefixed fields: token,
    /// user id, then an optional broker address
    pub fn parse(payload: &[u8]) -> Result<Self, MqttError> {
        let mut cursor = payload;

        let token = read_field(&mut cursor, "token")?;
        if token.is_empty() {
            return Err(MqttError::MalformedAuthReply(
                "token field is empty".to_string(),
            ));
        }
        let user_id = read_field(&mut cursor, "user id")?;

        let broker_address = if cursor.has_remaining() {
            Some(read_field(&mut cursor, "broker address")?).filter(|addr| !addr.is_empty())
        } else {
            None
        };

        if cursor.has_remaining() {
            debug!(
                trailing = cursor.remaining(),
                "Ignoring trailing bytes in MQTT auth reply"
            );
        }

        Ok(Self {
            token,
            user_id,
            broker_address,
        })
    }
}

impl std::fmt::Debug for MqttAuthReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttAuthReply")
            .field("user_id", &self.user_id)
            .field("broker_address", &self.broker_address)
            .finish_non_exhaustive()
    }
}

fn read_field(cursor: &mut &[u8], name: &str) -> Result<String, MqttError> {
    if cursor.remaining() < 2 {
        return Err(MqttError::MalformedAuthReply(format!(
            "missing length prefix for {name}"
        )));
    }
    let len = usize::from(cursor.get_u16());
    if cursor.remaining() < len {
        return Err(MqttError::MalformedAuthReply(format!(
            "{name} declares {len} bytes but only {} remain",
            cursor.remaining()
        )));
    }

    let value = String::from_utf8(cursor[..len].to_vec())
        .map_err(|_| MqttError::MalformedAuthReply(format!("{name} is not valid UTF-8")))?;
    cursor.advance(len);
    Ok(value)
}

/// Log in through the auth broker at `auth_addr` (`host:port`)
pub async fn authenticate_via_broker(
    auth_addr: &str,
    system_key: &str,
    system_secret: &str,
    request: &MqttAuthRequest,
    timing: &MqttSection,
) -> Result<MqttAuthReply, MqttError> {
    let reply_topic = request.reply_topic_for(system_key);
    let reply_timeout = request
        .reply_timeout
        .unwrap_or_else(|| timing.auth_reply_timeout());

    // The auth broker reads the login from the client id
    let mut options = ConnectOptions::new(
        auth_addr,
        format!("{}:{}", request.username, request.password),
        system_key,
        system_secret,
    );
    options.connect_timeout = timing.connect_timeout();
    options.keep_alive = timing.keep_alive();
    options.ack_timeout = timing.ack_timeout();
    options.tls = request.tls.clone();
    options.auto_reconnect = false;

    debug!(broker = %auth_addr, reply_topic = %reply_topic, "Starting MQTT authentication");
    let connection = MqttConnection::connect(options).await?;

    let outcome = await_reply(&connection, &reply_topic, reply_timeout).await;

    if let Err(e) = connection.disconnect(DISCONNECT_QUIESCE).await {
        warn!("Failed to close MQTT auth connection: {}", e);
    }

    let reply = outcome?;
    info!(
        user_id = %reply.user_id,
        redirected = reply.broker_address.is_some(),
        "Authenticated over MQTT"
    );
    Ok(reply)
}

async fn await_reply(
    connection: &MqttConnection,
    reply_topic: &str,
    reply_timeout: Duration,
) -> Result<MqttAuthReply, MqttError> {
    let mut replies = connection.subscribe(reply_topic, QoS::ExactlyOnce).await?;

    match tokio::time::timeout(reply_timeout, replies.recv()).await {
        Ok(Some(record)) => MqttAuthReply::parse(&record.payload),
        // Channels close when the connection drops
        Ok(None) => Err(MqttError::ConnectionLost(match connection.state() {
            super::ConnectionState::Disconnected(reason) => reason,
            other => format!("reply channel closed in state {other:?}"),
        })),
        Err(_) => Err(MqttError::timeout("MQTT auth reply", reply_timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn encode(fields: &[&str]) -> Vec<u8> {
        let mut payload = Vec::new();
        for field in fields {
            payload.extend_from_slice(&(field.len() as u16).to_be_bytes());
            payload.extend_from_slice(field.as_bytes());
        }
        payload
    }

    #[test]
    fn test_parse_all_fields() {
        let payload = encode(&["tok-123", "user-9", "broker.example.com:1883"]);
        let reply = MqttAuthReply::parse(&payload).unwrap();
        assert_eq!(reply.token, "tok-123");
        assert_eq!(reply.user_id, "user-9");
        assert_eq!(
            reply.broker_address.as_deref(),
            Some("broker.example.com:1883")
        );
    }

    #[test]
    fn test_parse_without_address() {
        let reply = MqttAuthReply::parse(&encode(&["tok", "uid"])).unwrap();
        assert_eq!(reply.broker_address, None);

        let reply = MqttAuthReply::parse(&encode(&["tok", "uid", ""])).unwrap();
        assert_eq!(reply.broker_address, None);
    }

    #[test]
    fn test_declared_length_exceeding_buffer_fails() {
        let mut payload = encode(&["tok"]);
        payload.extend_from_slice(&100u16.to_be_bytes());
        payload.extend_from_slice(b"short");

        let err = MqttAuthReply::parse(&payload).unwrap_err();
        assert!(matches!(err, MqttError::MalformedAuthReply(_)));
        assert!(err.to_string().contains("user id"));
    }

    #[test]
    fn test_truncated_prefix_fails() {
        assert!(MqttAuthReply::parse(&[]).is_err());
        assert!(MqttAuthReply::parse(&[0x00]).is_err());

        let mut payload = encode(&["tok", "uid"]);
        payload.push(0x01);
        assert!(MqttAuthReply::parse(&payload).is_err());
    }

    #[test]
    fn test_empty_token_rejected() {
        assert!(MqttAuthReply::parse(&encode(&["", "uid"])).is_err());
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let payload = [0x00, 0x02, 0xff, 0xfe, 0x00, 0x00];
        assert!(matches!(
            MqttAuthReply::parse(&payload),
            Err(MqttError::MalformedAuthReply(_))
        ));
    }

    #[test]
    fn test_default_reply_topic() {
        let request = MqttAuthRequest::new("alice@example.com", "pw");
        assert_eq!(request.reply_topic_for("sys-key"), "sys-key/alice@example.com");

        let request = MqttAuthRequest {
            reply_topic: Some("custom/replies".to_string()),
            ..MqttAuthRequest::new("alice", "pw")
        };
        assert_eq!(request.reply_topic_for("sys-key"), "custom/replies");
    }

    #[test]
    fn test_debug_hides_token_and_password() {
        let request = MqttAuthRequest::new("alice", "hunter2");
        assert!(!format!("{request:?}").contains("hunter2"));

        let reply = MqttAuthReply::parse(&encode(&["secret-token", "uid"])).unwrap();
        assert!(!format!("{reply:?}").contains("secret-token"));
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(payload in prop::collection::vec(any::<u8>(), 0..256)) {
            let _ = MqttAuthReply::parse(&payload);
        }

        #[test]
        fn prop_well_formed_round_trips(
            token in "[A-Za-z0-9._-]{1,64}",
            user_id in "[a-f0-9]{0,32}",
            address in proptest::option::of("[a-z.]{1,20}:[0-9]{2,5}"),
        ) {
            let mut fields = vec![token.as_str(), user_id.as_str()];
            if let Some(address) = &address {
                fields.push(address.as_str());
            }
            let reply = MqttAuthReply::parse(&encode(&fields)).unwrap();
            prop_assert_eq!(reply.token, token);
            prop_assert_eq!(reply.user_id, user_id);
            prop_assert_eq!(reply.broker_address, address);
        }
    }
}
