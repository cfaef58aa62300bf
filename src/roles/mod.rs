//! Role clients
//!
//! A platform caller is a developer ([`AdminClient`]), an end user
//! ([`UserClient`]) or a provisioned device ([`DeviceClient`]). They differ in
//! how they log in and which token header they present; everything else goes
//! through the [`RoleClient`] capability set, so the dispatcher and the MQTT
//! surface ([`Messaging`]) are written once for all three.

pub mod admin;
pub mod device;
pub mod messaging;
pub mod session;
pub mod user;

pub use admin::{AdminAuthResponse, AdminClient, VerifyAuthenticationParams};
pub use device::{DeviceAuthResponse, DeviceClient};
pub use messaging::{Messaging, MqttInit};
pub use session::{ClientCore, Session};
pub use user::{UserAuthResponse, UserClient};

use crate::error::{SdkError, SdkResult};
use crate::http::credentials::{DEVICE_TOKEN_HEADER, DEV_TOKEN_HEADER, USER_TOKEN_HEADER};
use crate::http::{
    normalize, resolve_credentials, CredentialSet, CredentialSource, EdgeProxy, MtlsTransport,
    Request, Response,
};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::info;

/// Caller identity kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Admin,
    User,
    Device,
}

impl Role {
    pub fn token_header(self) -> &'static str {
        match self {
            Role::Admin => DEV_TOKEN_HEADER,
            Role::User => USER_TOKEN_HEADER,
            Role::Device => DEVICE_TOKEN_HEADER,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Admin => write!(f, "admin"),
            Role::User => write!(f, "user"),
            Role::Device => write!(f, "device"),
        }
    }
}

/// What the dispatcher needs from a caller
#[async_trait]
pub trait RoleClient: Send + Sync {
    fn role(&self) -> Role;

    fn core(&self) -> &ClientCore;

    /// Base path of this role's own endpoints (`/admin`, `/api/v/1/user`, ...)
    fn preamble(&self) -> String;

    fn system_key(&self) -> Option<&str>;

    fn system_secret(&self) -> Option<&str>;

    /// Client-certificate transport every request of this role goes through
    fn mtls_transport(&self) -> Option<Arc<MtlsTransport>> {
        None
    }

    async fn credentials(&self) -> SdkResult<CredentialSet> {
        let session = self.core().session.read().await;
        resolve_credentials(
            self.role(),
            CredentialSource {
                token: session.token.as_deref(),
                system_key: self.system_key(),
                system_secret: self.system_secret(),
            },
        )
    }

    async fn token(&self) -> Option<String> {
        self.core().session.read().await.token.clone()
    }

    async fn set_token(&self, token: String) {
        self.core()
            .update_session(|session| session.token = Some(token))
            .await;
    }

    async fn refresh_token(&self) -> Option<String> {
        self.core().session.read().await.refresh_token.clone()
    }

    /// Token expiry in seconds since the Unix epoch
    async fn expires_at(&self) -> Option<i64> {
        self.core().session.read().await.expires_at
    }

    /// Route every following request to `edge_name`
    async fn start_proxy_to_edge(&self, system_key: &str, edge_name: &str) -> SdkResult<()> {
        let proxy = EdgeProxy::new(system_key, edge_name)?;
        info!(role = %self.role(), edge = %edge_name, "Proxying requests to edge");
        *self.core().edge_proxy.write().await = Some(proxy);
        Ok(())
    }

    async fn stop_proxy_to_edge(&self) -> SdkResult<()> {
        match self.core().edge_proxy.write().await.take() {
            Some(proxy) => {
                info!(role = %self.role(), edge = %proxy.edge_name, "Stopped proxying to edge");
                Ok(())
            }
            None => Err(SdkError::invalid_input("No edge proxy is active")),
        }
    }

    async fn edge_proxy(&self) -> Option<EdgeProxy> {
        self.core().edge_proxy.read().await.clone()
    }
}

/// Verb helpers available on every role client.
///
/// `dispatch` returns whatever the platform answered; the others turn any
/// status but 200 into [`SdkError::Domain`].
#[async_trait]
pub trait Api: RoleClient {
    async fn dispatch(&self, request: Request) -> SdkResult<Response>;

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> SdkResult<Response>;

    async fn post(&self, path: &str, body: Value) -> SdkResult<Response>;

    async fn put(&self, path: &str, body: Value) -> SdkResult<Response>;

    async fn delete(&self, path: &str, query: &[(&str, &str)]) -> SdkResult<Response>;

    async fn delete_with_body(&self, path: &str, body: Value) -> SdkResult<Response>;
}

fn with_query(mut request: Request, query: &[(&str, &str)]) -> Request {
    for (name, value) in query {
        request = request.query(*name, *value);
    }
    request
}

#[async_trait]
impl<T: RoleClient + ?Sized> Api for T {
    async fn dispatch(&self, request: Request) -> SdkResult<Response> {
        self.core().dispatcher().dispatch(self, request).await
    }

    async fn get(&self, path: &str, query: &[(&str, &str)]) -> SdkResult<Response> {
        normalize(self.dispatch(with_query(Request::get(path), query)).await)
    }

    async fn post(&self, path: &str, body: Value) -> SdkResult<Response> {
        normalize(self.dispatch(Request::post(path).json(body)).await)
    }

    async fn put(&self, path: &str, body: Value) -> SdkResult<Response> {
        normalize(self.dispatch(Request::put(path).json(body)).await)
    }

    async fn delete(&self, path: &str, query: &[(&str, &str)]) -> SdkResult<Response> {
        normalize(self.dispatch(with_query(Request::delete(path), query)).await)
    }

    async fn delete_with_body(&self, path: &str, body: Value) -> SdkResult<Response> {
        normalize(self.dispatch(Request::delete(path).json(body)).await)
    }
}

/// Pull a non-empty string field out of an auth response
pub(crate) fn required_token(body: &serde_json::Map<String, Value>, field: &str) -> SdkResult<String> {
    match body.get(field).and_then(Value::as_str) {
        Some(token) if !token.is_empty() => Ok(token.to_string()),
        _ => Err(SdkError::unexpected_response(
            "Token not present in response from platform",
        )),
    }
}

/// `expires_at` arrives as a JSON number, integral or not
pub(crate) fn expiry_seconds(body: &serde_json::Map<String, Value>) -> Option<i64> {
    body.get("expires_at").and_then(|value| {
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|secs| secs as i64))
    })
}
