//! Pure connection state management for the MQTT connection manager
//!
//! This module contains the connection state machine, the error type of the
//! MQTT layer, connect options and the pure translation of those options into
//! broker-library settings.

use crate::error::ErrorKind;
use bytes::Bytes;
use rand::Rng;
use rumqttc::{
    LastWill as BrokerLastWill, MqttOptions, NetworkOptions, QoS, TlsConfiguration,
    Transport as RumqttcTransport,
};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Length of a generated client identifier in random bytes
pub const CLIENT_ID_BYTES: usize = 10;

/// Default keep-alive interval when none is configured
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

/// Connection state for the MQTT connection manager
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionState {
    /// Constructed, connect not yet issued
    Unconnected,
    /// Connect issued, waiting for CONNACK
    Connecting,
    /// CONNACK received, ready for operations
    Connected,
    /// Transport dropped, broker library is reconnecting (attempt count)
    Reconnecting(u32),
    /// Transport dropped or connect failed and no reconnect will happen
    Disconnected(String),
    /// Closed by an explicit disconnect (terminal)
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// True once no further traffic can flow on this connection
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected(_) | ConnectionState::Closed
        )
    }
}

/// MQTT layer errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Connection failed: {0}")]
    ConnectionFailedStr(String),
    #[error("Connection lost: {0}")]
    ConnectionLost(String),
    #[error("Connection closed")]
    ConnectionClosed,
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker address: {0}")]
    InvalidBrokerAddress(String),
    #[error("Invalid topic '{topic}': {reason}")]
    InvalidTopic { topic: String, reason: String },
    #[error("Invalid TLS settings: {0}")]
    InvalidTls(String),
    #[error("Invalid QoS level: {0}")]
    InvalidQos(u8),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
    #[error("MQTTClient is uninitialized")]
    Uninitialized,
    #[error("Timed out waiting for {operation} after {after_secs}s")]
    Timeout {
        operation: &'static str,
        after_secs: u64,
    },
    #[error("Malformed MQTT auth reply: {0}")]
    MalformedAuthReply(String),
}

impl MqttError {
    /// Classify this error into the SDK taxonomy
    pub fn kind(&self) -> ErrorKind {
        match self {
            MqttError::ConnectionFailed(_)
            | MqttError::ConnectionFailedStr(_)
            | MqttError::ConnectionLost(_)
            | MqttError::ConnectionClosed
            | MqttError::PublishFailed(_)
            | MqttError::SubscriptionFailed(_)
            | MqttError::NotConnected { .. } => ErrorKind::Transport,
            MqttError::InvalidBrokerAddress(_)
            | MqttError::InvalidTopic { .. }
            | MqttError::InvalidTls(_)
            | MqttError::InvalidQos(_) => ErrorKind::InvalidInput,
            MqttError::Uninitialized | MqttError::MalformedAuthReply(_) => ErrorKind::Protocol,
            MqttError::Timeout { .. } => ErrorKind::Timeout,
        }
    }

    pub(crate) fn timeout(operation: &'static str, after: Duration) -> Self {
        MqttError::Timeout {
            operation,
            after_secs: after.as_secs(),
        }
    }
}

/// TLS material for a broker connection, all PEM encoded
#[derive(Clone, Default)]
pub struct MqttTls {
    /// CA bundle used to verify the broker; `None` uses the library defaults
    pub ca_pem: Option<Vec<u8>>,
    pub client_cert_pem: Option<Vec<u8>>,
    pub client_key_pem: Option<Vec<u8>>,
}

impl MqttTls {
    pub fn with_ca(ca_pem: impl Into<Vec<u8>>) -> Self {
        Self {
            ca_pem: Some(ca_pem.into()),
            ..Self::default()
        }
    }

    /// Attach a client certificate and key for mutual TLS
    pub fn with_client_auth(
        mut self,
        cert_pem: impl Into<Vec<u8>>,
        key_pem: impl Into<Vec<u8>>,
    ) -> Self {
        self.client_cert_pem = Some(cert_pem.into());
        self.client_key_pem = Some(key_pem.into());
        self
    }

    pub fn has_client_auth(&self) -> bool {
        self.client_cert_pem.is_some() && self.client_key_pem.is_some()
    }

    fn into_transport(self) -> Result<RumqttcTransport, MqttError> {
        let client_auth = match (self.client_cert_pem, self.client_key_pem) {
            (Some(cert), Some(key)) => Some((cert, key)),
            (None, None) => None,
            _ => {
                return Err(MqttError::InvalidTls(
                    "client certificate and key must be supplied together".to_string(),
                ))
            }
        };

        match (self.ca_pem, client_auth) {
            (Some(ca), client_auth) => Ok(RumqttcTransport::tls_with_config(
                TlsConfiguration::Simple {
                    ca,
                    alpn: None,
                    client_auth,
                },
            )),
            (None, None) => Ok(RumqttcTransport::tls_with_default_config()),
            (None, Some(_)) => Err(MqttError::InvalidTls(
                "client certificate requires a CA certificate".to_string(),
            )),
        }
    }
}

// Never print key material
impl fmt::Debug for MqttTls {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MqttTls")
            .field("ca_pem", &self.ca_pem.as_ref().map(|ca| ca.len()))
            .field("client_auth", &self.has_client_auth())
            .finish()
    }
}

/// Message the broker publishes on the client's behalf after an unclean disconnect
#[derive(Debug, Clone, PartialEq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
}

impl LastWill {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>, qos: QoS, retain: bool) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        }
    }
}

/// Handler invoked whenever a CONNACK is received
pub type ConnectHandler = Arc<dyn Fn() + Send + Sync>;
/// Handler invoked with the reason whenever an established connection drops
pub type ConnectionLostHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional on-connect / on-connection-lost callback pair
#[derive(Clone, Default)]
pub struct ConnectionCallbacks {
    pub on_connect: Option<ConnectHandler>,
    pub on_connection_lost: Option<ConnectionLostHandler>,
}

impl ConnectionCallbacks {
    pub fn on_connect(mut self, handler: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(handler));
        self
    }

    pub fn on_connection_lost(mut self, handler: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_connection_lost = Some(Arc::new(handler));
        self
    }

    pub(crate) fn fire_connect(&self) {
        if let Some(handler) = &self.on_connect {
            handler();
        }
    }

    pub(crate) fn fire_connection_lost(&self, reason: &str) {
        if let Some(handler) = &self.on_connection_lost {
            handler(reason);
        }
    }
}

impl fmt::Debug for ConnectionCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionCallbacks")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_connection_lost", &self.on_connection_lost.is_some())
            .finish()
    }
}

/// Everything needed to open one broker connection
#[derive(Clone)]
pub struct ConnectOptions {
    /// Broker `host:port`
    pub broker_addr: String,
    pub client_id: String,
    pub username: String,
    pub password: String,
    pub connect_timeout: Duration,
    pub keep_alive: Duration,
    /// Bound on waiting for PUBACK/PUBCOMP
    pub ack_timeout: Duration,
    pub tls: Option<MqttTls>,
    pub last_will: Option<LastWill>,
    pub auto_reconnect: bool,
    pub callbacks: ConnectionCallbacks,
}

impl ConnectOptions {
    pub fn new(
        broker_addr: impl Into<String>,
        client_id: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            client_id: client_id.into(),
            username: username.into(),
            password: password.into(),
            connect_timeout: Duration::from_secs(30),
            keep_alive: DEFAULT_KEEP_ALIVE,
            ack_timeout: Duration::from_secs(10),
            tls: None,
            last_will: None,
            auto_reconnect: true,
            callbacks: ConnectionCallbacks::default(),
        }
    }

    /// `tls://host:port` when TLS is configured, `tcp://host:port` otherwise
    pub fn broker_url(&self) -> String {
        let scheme = if self.tls.is_some() { "tls" } else { "tcp" };
        format!("{scheme}://{}", self.broker_addr)
    }
}

impl fmt::Debug for ConnectOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectOptions")
            .field("broker_addr", &self.broker_addr)
            .field("client_id", &self.client_id)
            .field("connect_timeout", &self.connect_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("tls", &self.tls)
            .field("last_will", &self.last_will)
            .field("auto_reconnect", &self.auto_reconnect)
            .finish_non_exhaustive()
    }
}

/// Pure function to translate connect options into broker-library options
pub fn configure_mqtt_options(options: &ConnectOptions) -> Result<MqttOptions, MqttError> {
    let broker_url = options.broker_url();
    let url =
        Url::parse(&broker_url).map_err(|_| MqttError::InvalidBrokerAddress(broker_url.clone()))?;

    let host = url
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| MqttError::InvalidBrokerAddress(broker_url.clone()))?;
    let port = url
        .port()
        .unwrap_or(if options.tls.is_some() { 8883 } else { 1883 });

    let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
    mqtt_options.set_credentials(options.username.clone(), options.password.clone());
    mqtt_options.set_keep_alive(options.keep_alive);
    mqtt_options.set_clean_session(true);

    // Platform payloads can be well above the 10KB library default
    mqtt_options.set_max_packet_size(256 * 1024, 256 * 1024);

    if let Some(will) = &options.last_will {
        mqtt_options.set_last_will(BrokerLastWill::new(
            will.topic.clone(),
            will.payload.to_vec(),
            will.qos,
            will.retain,
        ));
    }

    if let Some(tls) = options.tls.clone() {
        mqtt_options.set_transport(tls.into_transport()?);
    }

    Ok(mqtt_options)
}

/// Socket-level options: the TCP/TLS connect is bounded by the caller's
/// connect timeout, in whole seconds and never below one
pub fn configure_network_options(options: &ConnectOptions) -> NetworkOptions {
    let mut network_options = NetworkOptions::new();
    network_options.set_connection_timeout(options.connect_timeout.as_secs().max(1));
    network_options
}

/// Map a numeric QoS level onto the broker-library type
pub fn parse_qos(level: u8) -> Result<QoS, MqttError> {
    match level {
        0 => Ok(QoS::AtMostOnce),
        1 => Ok(QoS::AtLeastOnce),
        2 => Ok(QoS::ExactlyOnce),
        other => Err(MqttError::InvalidQos(other)),
    }
}

/// Random client identifier: 10 random bytes, upper-case hex
pub fn new_client_id() -> String {
    let bytes: [u8; CLIENT_ID_BYTES] = rand::thread_rng().gen();
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
