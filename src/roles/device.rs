//! Provisioned device client

use super::session::{ClientCore, Session};
use super::{required_token, Api, Role, RoleClient};
use crate::config::SdkConfig;
use crate::error::{SdkError, SdkResult};
use crate::http::{resolve_credentials, CredentialSet, CredentialSource, MtlsTransport};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::info;

const DEVICE_PREAMBLE: &str = "/api/v/2/devices";

/// Body of a device login response; the platform returns the device record
/// alongside the token
#[derive(Clone)]
pub struct DeviceAuthResponse {
    pub device_token: String,
    pub body: Map<String, Value>,
}

impl fmt::Debug for DeviceAuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fields: Vec<&str> = self.body.keys().map(String::as_str).collect();
        f.debug_struct("DeviceAuthResponse")
            .field("fields", &fields)
            .finish_non_exhaustive()
    }
}

/// Device registered in one system
pub struct DeviceClient {
    core: ClientCore,
    system_key: String,
    system_secret: Option<String>,
    device_name: String,
    active_key: Option<String>,
    mtls: Option<Arc<MtlsTransport>>,
}

impl DeviceClient {
    pub fn new(
        config: SdkConfig,
        system_key: impl Into<String>,
        system_secret: impl Into<String>,
        device_name: impl Into<String>,
        active_key: impl Into<String>,
    ) -> SdkResult<Self> {
        Ok(Self {
            core: ClientCore::new(config)?,
            system_key: system_key.into(),
            system_secret: Some(system_secret.into()),
            device_name: device_name.into(),
            active_key: Some(active_key.into()),
            mtls: None,
        })
    }

    /// Service account device with a pre-issued token
    pub fn with_token(
        config: SdkConfig,
        system_key: impl Into<String>,
        system_secret: impl Into<String>,
        device_name: impl Into<String>,
        token: impl Into<String>,
    ) -> SdkResult<Self> {
        Ok(Self {
            core: ClientCore::with_session(config, Session::with_token(token))?,
            system_key: system_key.into(),
            system_secret: Some(system_secret.into()),
            device_name: device_name.into(),
            active_key: None,
            mtls: None,
        })
    }

    /// Device identified by a client certificate. Every request goes to the
    /// mutual-TLS port.
    pub fn with_mtls(
        config: SdkConfig,
        system_key: impl Into<String>,
        device_name: impl Into<String>,
        cert_pem: &[u8],
        key_pem: &[u8],
    ) -> SdkResult<Self> {
        let transport = MtlsTransport::from_pem(cert_pem, key_pem, &config.http)?;
        Ok(Self {
            core: ClientCore::new(config)?,
            system_key: system_key.into(),
            system_secret: None,
            device_name: device_name.into(),
            active_key: None,
            mtls: Some(Arc::new(transport)),
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn is_mtls(&self) -> bool {
        self.mtls.is_some()
    }

    /// Log in with the device's active key and store the device token
    pub async fn authenticate(&self) -> SdkResult<DeviceAuthResponse> {
        let _gate = self.core.auth_guard().await;

        let mut body = json!({"deviceName": self.device_name});
        if let Some(active_key) = &self.active_key {
            body["activeKey"] = Value::String(active_key.clone());
        }

        let path = format!("{DEVICE_PREAMBLE}/{}/auth", self.system_key);
        let response = self.post(&path, body).await?.into_object()?;
        let device_token = required_token(&response, "deviceToken")?;
        self.set_token(device_token.clone()).await;

        info!(device = %self.device_name, "Device authenticated");
        Ok(DeviceAuthResponse {
            device_token,
            body: response,
        })
    }

    /// Forget the device token; the platform keeps no device sessions
    pub async fn logout(&self) -> SdkResult<()> {
        self.core.update_session(Session::clear).await;
        Ok(())
    }
}

#[async_trait]
impl RoleClient for DeviceClient {
    fn role(&self) -> Role {
        Role::Device
    }

    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn preamble(&self) -> String {
        DEVICE_PREAMBLE.to_string()
    }

    fn system_key(&self) -> Option<&str> {
        Some(&self.system_key)
    }

    fn system_secret(&self) -> Option<&str> {
        self.system_secret.as_deref()
    }

    fn mtls_transport(&self) -> Option<Arc<MtlsTransport>> {
        self.mtls.clone()
    }

    /// The client certificate identifies an mTLS device, so it may present
    /// no headers at all
    async fn credentials(&self) -> SdkResult<CredentialSet> {
        let session = self.core.session.read().await;
        let resolved = resolve_credentials(
            Role::Device,
            CredentialSource {
                token: session.token.as_deref(),
                system_key: Some(&self.system_key),
                system_secret: self.system_secret.as_deref(),
            },
        );
        match resolved {
            Err(SdkError::NoCredentials { .. }) if self.mtls.is_some() => Ok(CredentialSet::new()),
            other => other,
        }
    }
}

impl fmt::Debug for DeviceClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceClient")
            .field("system_key", &self.system_key)
            .field("device_name", &self.device_name)
            .field("mtls", &self.mtls.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::credentials::{DEVICE_TOKEN_HEADER, SYSTEM_KEY_HEADER, SYSTEM_SECRET_HEADER};

    #[tokio::test]
    async fn test_device_presents_every_mechanism() {
        let device =
            DeviceClient::with_token(SdkConfig::default(), "key", "secret", "dev-1", "dtok")
                .unwrap();
        let creds = device.credentials().await.unwrap();
        assert_eq!(
            creds.names(),
            vec![DEVICE_TOKEN_HEADER, SYSTEM_KEY_HEADER, SYSTEM_SECRET_HEADER]
        );
    }

    #[tokio::test]
    async fn test_logout_is_local() {
        let device =
            DeviceClient::with_token(SdkConfig::default(), "key", "secret", "dev-1", "dtok")
                .unwrap();
        device.logout().await.unwrap();
        assert_eq!(device.token().await, None);

        // Key pair still works after logout
        let creds = device.credentials().await.unwrap();
        assert_eq!(creds.names(), vec![SYSTEM_KEY_HEADER, SYSTEM_SECRET_HEADER]);
    }

    #[tokio::test]
    async fn test_device_without_secret_or_token_fails() {
        let device = DeviceClient {
            core: ClientCore::new(SdkConfig::default()).unwrap(),
            system_key: "key".to_string(),
            system_secret: None,
            device_name: "dev-1".to_string(),
            active_key: None,
            mtls: None,
        };
        let err = device.credentials().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoCredentials);
    }

    #[test]
    fn test_mtls_device_rejects_bad_pem() {
        let err = DeviceClient::with_mtls(SdkConfig::default(), "key", "dev-1", b"nope", b"nope")
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Transport);
    }
}
