//! ClearBlade platform SDK core
//!
//! Shared infrastructure for talking to a ClearBlade IoT platform as a
//! developer, an end user or a device:
//! - Credential resolution and HTTP request dispatch for all three roles
//! - Response decoding into a tagged body and non-200 normalization
//! - MQTT connection management with acknowledgment tracking and reconnect
//! - Per-topic subscription channels
//! - Token login over the message broker
//!
//! # Quick Start
//!
//! ```no_run
//! use cb_sdk::prelude::*;
//! use bytes::Bytes;
//!
//! # async fn run() -> cb_sdk::SdkResult<()> {
//! let user = UserClient::new(
//!     SdkConfig::default(),
//!     "system-key",
//!     "system-secret",
//!     "user@example.com",
//!     "password",
//! )?;
//! user.authenticate().await?;
//!
//! // Any platform endpoint, credentials attached
//! let collections = user.get("/api/v/1/collectionmanagement", &[]).await?;
//! println!("{:?}", collections.body);
//!
//! user.initialize_mqtt(MqttInit::new()).await?;
//! let mut readings = user.subscribe("sensors/+/temp", QoS::AtLeastOnce).await?;
//! user.publish("sensors/a/temp", Bytes::from_static(b"21.5"), QoS::AtLeastOnce)
//!     .await?;
//! if let Some(record) = readings.recv().await {
//!     println!("{} -> {:?}", record.topic, record.payload);
//! }
//! user.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod observability;
pub mod roles;
pub mod transport;

pub use config::{ConfigError, SdkConfig};
pub use error::{ErrorKind, SdkError, SdkResult};
pub use http::{Request, Response, ResponseBody};
pub use roles::{AdminClient, Api, DeviceClient, Messaging, Role, RoleClient, UserClient};

/// Everything a typical caller needs
pub mod prelude {
    pub use crate::config::SdkConfig;
    pub use crate::error::{ErrorKind, SdkError, SdkResult};
    pub use crate::http::{Request, Response, ResponseBody};
    pub use crate::roles::{
        AdminClient, Api, DeviceClient, Messaging, MqttInit, Role, RoleClient, UserClient,
    };
    pub use crate::transport::mqtt::{
        ConnectionCallbacks, ConnectionState, LastWill, MqttAuthRequest, MqttTls, PublishRecord,
        QoS,
    };
}
