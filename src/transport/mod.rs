//! Transport layer
//!
//! MQTT messaging used by the role clients. HTTP dispatch lives in
//! [`crate::http`].

pub mod mqtt;

pub use mqtt::{ConnectionState, MqttConnection, MqttError};
