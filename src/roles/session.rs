//! State shared by every role client

use crate::config::{PlatformSection, SdkConfig};
use crate::error::SdkResult;
use crate::http::{Dispatcher, EdgeProxy};
use crate::transport::mqtt::{MqttConnection, MqttError};
use chrono::{DateTime, TimeZone, Utc};
use std::fmt;
use std::sync::Arc;
use tokio::sync::{Mutex, MutexGuard, RwLock};

/// Tokens issued by the platform
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Session {
    pub token: Option<String>,
    pub refresh_token: Option<String>,
    /// Seconds since the Unix epoch
    pub expires_at: Option<i64>,
}

impl Session {
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Self::default()
        }
    }

    pub fn expires_at_utc(&self) -> Option<DateTime<Utc>> {
        self.expires_at
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "<redacted>"),
            )
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Dispatcher, endpoints and mutable session state of one role client.
///
/// Session reads never wait on a login in progress for longer than the
/// final write; `auth_gate` only serializes logins against each other.
pub struct ClientCore {
    config: SdkConfig,
    dispatcher: Dispatcher,
    endpoints: RwLock<PlatformSection>,
    pub(crate) session: RwLock<Session>,
    auth_gate: Mutex<()>,
    pub(crate) edge_proxy: RwLock<Option<EdgeProxy>>,
    mqtt: RwLock<Option<Arc<MqttConnection>>>,
}

impl ClientCore {
    pub fn new(config: SdkConfig) -> SdkResult<Self> {
        Self::with_session(config, Session::default())
    }

    pub fn with_session(config: SdkConfig, session: Session) -> SdkResult<Self> {
        config.validate()?;
        let dispatcher = Dispatcher::new(&config.http)?;
        Ok(Self {
            endpoints: RwLock::new(config.platform.clone()),
            config,
            dispatcher,
            session: RwLock::new(session),
            auth_gate: Mutex::new(()),
            edge_proxy: RwLock::new(None),
            mqtt: RwLock::new(None),
        })
    }

    pub fn config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Current endpoints; the broker address may have been redirected
    pub async fn endpoints(&self) -> PlatformSection {
        self.endpoints.read().await.clone()
    }

    pub async fn set_mqtt_addr(&self, addr: impl Into<String>) {
        self.endpoints.write().await.mqtt_addr = addr.into();
    }

    pub async fn session(&self) -> Session {
        self.session.read().await.clone()
    }

    pub(crate) async fn update_session(&self, update: impl FnOnce(&mut Session)) {
        let mut session = self.session.write().await;
        update(&mut session);
    }

    /// Held for the whole of a login or token refresh
    pub(crate) async fn auth_guard(&self) -> MutexGuard<'_, ()> {
        self.auth_gate.lock().await
    }

    pub(crate) async fn mqtt(&self) -> Result<Arc<MqttConnection>, MqttError> {
        self.mqtt.read().await.clone().ok_or(MqttError::Uninitialized)
    }

    pub(crate) async fn has_mqtt(&self) -> bool {
        self.mqtt.read().await.is_some()
    }

    /// Install a connection, returning the one it replaces
    pub(crate) async fn replace_mqtt(
        &self,
        connection: Option<Arc<MqttConnection>>,
    ) -> Option<Arc<MqttConnection>> {
        std::mem::replace(&mut *self.mqtt.write().await, connection)
    }
}

impl fmt::Debug for ClientCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCore")
            .field("http_addr", &self.config.platform.http_addr)
            .finish_non_exhaustive()
    }
}
