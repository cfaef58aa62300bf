//! MQTT surface of the role clients
//!
//! Each role owns at most one broker connection. Its session token is the
//! MQTT username and the system key is the password.

use super::device::DeviceClient;
use super::RoleClient;
use crate::error::{SdkError, SdkResult};
use crate::mqtt_span;
use crate::transport::mqtt::{
    authenticate_via_broker, new_client_id, ConnectOptions, ConnectionCallbacks, ConnectionState,
    LastWill, MqttAuthReply, MqttAuthRequest, MqttConnection, MqttTls, PublishRecord, QoS,
    DISCONNECT_QUIESCE,
};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn, Instrument};

/// Settings for [`Messaging::initialize_mqtt`]
#[derive(Debug, Clone)]
pub struct MqttInit {
    /// Random 20-character id when unset
    pub client_id: Option<String>,
    /// Password override; defaults to the role's own system key
    pub system_key: Option<String>,
    /// Defaults to `mqtt.connect_timeout_secs`
    pub connect_timeout: Option<Duration>,
    pub tls: Option<MqttTls>,
    pub last_will: Option<LastWill>,
    pub auto_reconnect: bool,
    pub callbacks: ConnectionCallbacks,
}

impl Default for MqttInit {
    fn default() -> Self {
        Self {
            client_id: None,
            system_key: None,
            connect_timeout: None,
            tls: None,
            last_will: None,
            auto_reconnect: true,
            callbacks: ConnectionCallbacks::default(),
        }
    }
}

impl MqttInit {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.client_id = Some(client_id.into());
        self
    }

    pub fn system_key(mut self, system_key: impl Into<String>) -> Self {
        self.system_key = Some(system_key.into());
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    pub fn tls(mut self, tls: MqttTls) -> Self {
        self.tls = Some(tls);
        self
    }

    pub fn last_will(mut self, last_will: LastWill) -> Self {
        self.last_will = Some(last_will);
        self
    }

    pub fn without_auto_reconnect(mut self) -> Self {
        self.auto_reconnect = false;
        self
    }

    pub fn callbacks(mut self, callbacks: ConnectionCallbacks) -> Self {
        self.callbacks = callbacks;
        self
    }
}

/// Publish/subscribe operations on every role client
#[async_trait]
pub trait Messaging: RoleClient {
    /// Connect to the role's broker, replacing any existing connection
    async fn initialize_mqtt(&self, init: MqttInit) -> SdkResult<()>;

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> SdkResult<()>;

    async fn publish_retained(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> SdkResult<()>;

    async fn subscribe(&self, filter: &str, qos: QoS) -> SdkResult<mpsc::Receiver<PublishRecord>>;

    /// Stops delivery and closes the filter's channel
    async fn unsubscribe(&self, filter: &str) -> SdkResult<()>;

    /// Close the connection; later MQTT calls fail until re-initialized
    async fn disconnect(&self) -> SdkResult<()>;

    /// `Unconnected` when no connection is held
    async fn mqtt_state(&self) -> ConnectionState;

    /// Log in through the auth broker, then store the token and the
    /// redirected broker address
    async fn authenticate_mqtt(&self, request: MqttAuthRequest) -> SdkResult<MqttAuthReply>;
}

#[async_trait]
impl<T: RoleClient + ?Sized> Messaging for T {
    async fn initialize_mqtt(&self, init: MqttInit) -> SdkResult<()> {
        let token = self
            .token()
            .await
            .ok_or(SdkError::NoCredentials { role: self.role() })?;
        let password = match init.system_key.clone() {
            Some(key) => key,
            None => self
                .system_key()
                .map(str::to_string)
                .ok_or_else(|| SdkError::invalid_input("A system key is required to connect to the broker"))?,
        };
        let broker_addr = self.core().endpoints().await.mqtt_addr;

        open_connection(self, broker_addr, token, password, init).await
    }

    async fn publish(&self, topic: &str, payload: Bytes, qos: QoS) -> SdkResult<()> {
        self.publish_retained(topic, payload, qos, false).await
    }

    async fn publish_retained(
        &self,
        topic: &str,
        payload: Bytes,
        qos: QoS,
        retain: bool,
    ) -> SdkResult<()> {
        let connection = self.core().mqtt().await?;
        connection.publish(topic, payload, qos, retain).await?;
        Ok(())
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> SdkResult<mpsc::Receiver<PublishRecord>> {
        let connection = self.core().mqtt().await?;
        Ok(connection.subscribe(filter, qos).await?)
    }

    async fn unsubscribe(&self, filter: &str) -> SdkResult<()> {
        let connection = self.core().mqtt().await?;
        connection.unsubscribe(filter).await?;
        Ok(())
    }

    async fn disconnect(&self) -> SdkResult<()> {
        let connection = self.core().replace_mqtt(None).await.ok_or(
            crate::transport::mqtt::MqttError::Uninitialized,
        )?;
        connection.disconnect(DISCONNECT_QUIESCE).await?;
        info!(role = %self.role(), "MQTT connection closed");
        Ok(())
    }

    async fn mqtt_state(&self) -> ConnectionState {
        match self.core().mqtt().await {
            Ok(connection) => connection.state(),
            Err(_) => ConnectionState::Unconnected,
        }
    }

    async fn authenticate_mqtt(&self, request: MqttAuthRequest) -> SdkResult<MqttAuthReply> {
        let (system_key, system_secret) = match (self.system_key(), self.system_secret()) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => (key, secret),
            _ => {
                return Err(SdkError::invalid_input(
                    "MQTT authentication needs a system key and secret",
                ))
            }
        };

        let _gate = self.core().auth_guard().await;
        let auth_addr = self.core().endpoints().await.mqtt_auth_addr;
        let reply = authenticate_via_broker(
            &auth_addr,
            system_key,
            system_secret,
            &request,
            &self.core().config().mqtt,
        )
        .instrument(mqtt_span!(operation = "authenticate", role = %self.role()))
        .await?;

        self.set_token(reply.token.clone()).await;
        if let Some(addr) = &reply.broker_address {
            self.core().set_mqtt_addr(addr.clone()).await;
            info!(broker = %addr, "Broker address redirected by MQTT authentication");
        }
        Ok(reply)
    }
}

async fn open_connection<R: RoleClient + ?Sized>(
    role: &R,
    broker_addr: String,
    username: String,
    password: String,
    init: MqttInit,
) -> SdkResult<()> {
    let timing = &role.core().config().mqtt;
    let mut options = ConnectOptions::new(
        broker_addr,
        init.client_id.unwrap_or_else(new_client_id),
        username,
        password,
    );
    options.connect_timeout = init.connect_timeout.unwrap_or_else(|| timing.connect_timeout());
    options.keep_alive = timing.keep_alive();
    options.ack_timeout = timing.ack_timeout();
    options.tls = init.tls;
    options.last_will = init.last_will;
    options.auto_reconnect = init.auto_reconnect;
    options.callbacks = init.callbacks;

    let span = mqtt_span!(
        operation = "connect",
        role = %role.role(),
        broker = %options.broker_url()
    );
    let connection = MqttConnection::connect(options).instrument(span).await?;
    info!(
        role = %role.role(),
        client_id = %connection.client_id(),
        broker = %connection.broker_addr(),
        "MQTT initialized"
    );

    if let Some(previous) = role.core().replace_mqtt(Some(Arc::new(connection))).await {
        if let Err(e) = previous.disconnect(DISCONNECT_QUIESCE).await {
            warn!("Failed to close replaced MQTT connection: {}", e);
        }
    }
    Ok(())
}

/// `host:port` with the port swapped for the mutual-TLS one
fn mtls_broker_addr(mqtt_addr: &str, mtls_port: &str) -> SdkResult<String> {
    match mqtt_addr.split(':').collect::<Vec<_>>().as_slice() {
        [host, _port] if !host.is_empty() => Ok(format!("{host}:{mtls_port}")),
        _ => Err(SdkError::invalid_input(format!(
            "Invalid mqtt addr '{mqtt_addr}', expected host:port"
        ))),
    }
}

impl DeviceClient {
    /// Connect on the broker's mutual-TLS port; `init.tls` must carry the
    /// client certificate
    pub async fn initialize_mqtt_with_mtls(&self, username: &str, init: MqttInit) -> SdkResult<()> {
        if init.tls.is_none() {
            return Err(SdkError::invalid_input(
                "TLS settings are required for an mTLS broker connection",
            ));
        }
        let endpoints = self.core().endpoints().await;
        let broker_addr = mtls_broker_addr(&endpoints.mqtt_addr, &endpoints.mtls_port)?;
        let password = match init.system_key.clone() {
            Some(key) => key,
            None => self.system_key().unwrap_or_default().to_string(),
        };

        open_connection(self, broker_addr, username.to_string(), password, init).await
    }
}
