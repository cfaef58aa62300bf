//! MQTT connection manager, subscription multiplexer and broker-based login
//!
//! The module is split into focused sub-modules:
//!
//! - [`connection`] - Pure connection state, options and error types
//! - [`message_handler`] - Pure event routing and acknowledgment pairing
//! - [`subscriptions`] - Topic filters and per-subscription channels
//! - [`client`] - Impure I/O: the broker client and its event loop task
//! - [`auth`] - Authentication over the auth broker
//!
//! # Usage
//!
//! ```rust,no_run
//! use cb_sdk::transport::mqtt::{ConnectOptions, MqttConnection, QoS, DISCONNECT_QUIESCE};
//!
//! # tokio_test::block_on(async {
//! let options = ConnectOptions::new("localhost:1883", "my-client", "token", "system-key");
//! let connection = MqttConnection::connect(options).await?;
//!
//! let mut updates = connection.subscribe("sensors/+/temp", QoS::AtLeastOnce).await?;
//! connection.publish("sensors/1/temp", "21.5", QoS::AtLeastOnce, false).await?;
//! if let Some(record) = updates.recv().await {
//!     println!("{} -> {:?}", record.topic, record.payload);
//! }
//! connection.disconnect(DISCONNECT_QUIESCE).await?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod auth;
pub mod client;
pub mod connection;
pub mod message_handler;
pub mod subscriptions;

// Re-export public types for convenience
pub use auth::{authenticate_via_broker, MqttAuthReply, MqttAuthRequest};
pub use client::{MqttConnection, DISCONNECT_QUIESCE, SUBSCRIBE_ACK_WAIT, UNSUBSCRIBE_ACK_WAIT};
pub use connection::{
    new_client_id, parse_qos, ConnectOptions, ConnectionCallbacks, ConnectionState, LastWill,
    MqttError, MqttTls,
};
pub use message_handler::{AckKind, AckStatus, EventRoute, MessageHandler};
pub use rumqttc::QoS;
pub use subscriptions::{
    topic_matches, validate_filter, PublishRecord, TopicPath, SUBSCRIPTION_CHANNEL_CAPACITY,
};
