//! Developer (administrative) client

use super::session::{ClientCore, Session};
use super::{required_token, Api, Role, RoleClient};
use crate::config::SdkConfig;
use crate::error::{SdkError, SdkResult};
use crate::http::Request;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use tracing::info;

const ADMIN_PREAMBLE: &str = "/admin";

/// Body of a developer login response
#[derive(Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AdminAuthResponse {
    pub dev_token: String,
    pub is_two_factor: bool,
    pub next_step_url: String,
    pub intermediate_token: String,
    pub two_factor_method: String,
    pub otp_id: String,
    pub otp_issued: String,
}

impl fmt::Debug for AdminAuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminAuthResponse")
            .field("is_two_factor", &self.is_two_factor)
            .field("next_step_url", &self.next_step_url)
            .field("two_factor_method", &self.two_factor_method)
            .field("otp_id", &self.otp_id)
            .field("otp_issued", &self.otp_issued)
            .finish_non_exhaustive()
    }
}

/// Second step of a two-factor login
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct VerifyAuthenticationParams {
    pub code: String,
    pub two_factor_method: String,
    pub otp_id: String,
    pub otp_issued: String,
}

impl From<&AdminAuthResponse> for VerifyAuthenticationParams {
    fn from(response: &AdminAuthResponse) -> Self {
        Self {
            code: String::new(),
            two_factor_method: response.two_factor_method.clone(),
            otp_id: response.otp_id.clone(),
            otp_issued: response.otp_issued.clone(),
        }
    }
}

/// Developer account client
pub struct AdminClient {
    core: ClientCore,
    email: String,
    password: String,
    system_key: Option<String>,
    system_secret: Option<String>,
}

impl AdminClient {
    pub fn new(
        config: SdkConfig,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> SdkResult<Self> {
        Ok(Self {
            core: ClientCore::new(config)?,
            email: email.into(),
            password: password.into(),
            system_key: None,
            system_secret: None,
        })
    }

    /// Client for an already issued developer token
    pub fn with_token(
        config: SdkConfig,
        token: impl Into<String>,
        email: impl Into<String>,
    ) -> SdkResult<Self> {
        Ok(Self {
            core: ClientCore::with_session(config, Session::with_token(token))?,
            email: email.into(),
            password: String::new(),
            system_key: None,
            system_secret: None,
        })
    }

    /// Attach a system key and secret, used when no token is held and as the
    /// MQTT password
    pub fn with_system(mut self, system_key: impl Into<String>, system_secret: impl Into<String>) -> Self {
        self.system_key = Some(system_key.into());
        self.system_secret = Some(system_secret.into());
        self
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    /// Log in with email and password.
    ///
    /// When the account uses two-factor login the stored token is the
    /// intermediate one; finish with [`AdminClient::verify_authentication`].
    pub async fn authenticate(&self) -> SdkResult<AdminAuthResponse> {
        let _gate = self.core.auth_guard().await;

        let request = Request::post(format!("{ADMIN_PREAMBLE}/auth"))
            .anonymous()
            .json(json!({"email": self.email, "password": self.password}));
        let auth: AdminAuthResponse = self.dispatch(request).await?.normalize()?.deserialize()?;

        let token = if auth.is_two_factor {
            &auth.intermediate_token
        } else {
            &auth.dev_token
        };
        if token.is_empty() {
            return Err(SdkError::unexpected_response(
                "Token not present in response from platform",
            ));
        }

        let token = token.clone();
        self.core
            .update_session(|session| session.token = Some(token))
            .await;

        info!(
            email = %self.email,
            two_factor = auth.is_two_factor,
            "Developer authenticated"
        );
        Ok(auth)
    }

    /// Complete a two-factor login with the one-time code
    pub async fn verify_authentication(&self, params: VerifyAuthenticationParams) -> SdkResult<()> {
        let _gate = self.core.auth_guard().await;

        let body = serde_json::to_value(&params)?;
        let response = self
            .post(&format!("{ADMIN_PREAMBLE}/auth/verify"), body)
            .await?
            .into_object()?;
        let token = required_token(&response, "dev_token")?;
        self.core
            .update_session(|session| session.token = Some(token))
            .await;

        info!(email = %self.email, "Developer two-factor verification succeeded");
        Ok(())
    }

    /// Whether the platform still accepts the current credentials
    pub async fn check_auth(&self) -> SdkResult<bool> {
        check_auth(self).await
    }

    /// Invalidate the token on the platform and forget it locally
    pub async fn logout(&self) -> SdkResult<()> {
        logout(self).await
    }
}

/// POST `{preamble}/checkauth`. An explicit `is_authenticated: true` wins
/// over the status code.
pub(crate) async fn check_auth<R: RoleClient + ?Sized>(role: &R) -> SdkResult<bool> {
    let response = role
        .dispatch(Request::post(format!("{}/checkauth", role.preamble())))
        .await?;
    let authenticated = response
        .body
        .as_object()
        .and_then(|body| body.get("is_authenticated"))
        .and_then(serde_json::Value::as_bool)
        .unwrap_or(false);
    if authenticated {
        return Ok(true);
    }
    response.normalize()?;
    Ok(false)
}

/// POST `{preamble}/logout`, then clear the session
pub(crate) async fn logout<R: RoleClient + ?Sized>(role: &R) -> SdkResult<()> {
    role.dispatch(Request::post(format!("{}/logout", role.preamble())))
        .await?
        .normalize()?;
    role.core().update_session(Session::clear).await;
    info!(role = %role.role(), "Logged out");
    Ok(())
}

impl RoleClient for AdminClient {
    fn role(&self) -> Role {
        Role::Admin
    }

    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn preamble(&self) -> String {
        ADMIN_PREAMBLE.to_string()
    }

    fn system_key(&self) -> Option<&str> {
        self.system_key.as_deref()
    }

    fn system_secret(&self) -> Option<&str> {
        self.system_secret.as_deref()
    }
}

impl fmt::Debug for AdminClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminClient")
            .field("email", &self.email)
            .field("system_key", &self.system_key)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_response_defaults_missing_fields() {
        let response: AdminAuthResponse =
            serde_json::from_str(r#"{"dev_token":"tok"}"#).unwrap();
        assert_eq!(response.dev_token, "tok");
        assert!(!response.is_two_factor);
        assert!(!format!("{response:?}").contains("tok\""));
    }

    #[test]
    fn test_verify_params_from_pending_login() {
        let pending = AdminAuthResponse {
            is_two_factor: true,
            intermediate_token: "inter".to_string(),
            two_factor_method: "email".to_string(),
            otp_id: "otp-1".to_string(),
            otp_issued: "2024-01-01T00:00:00Z".to_string(),
            ..AdminAuthResponse::default()
        };
        let mut params = VerifyAuthenticationParams::from(&pending);
        params.code = "123456".to_string();

        let body = serde_json::to_value(&params).unwrap();
        assert_eq!(body["otp_id"], "otp-1");
        assert_eq!(body["code"], "123456");
        assert_eq!(body["two_factor_method"], "email");
    }

    #[tokio::test]
    async fn test_admin_with_token_resolves_one_header() {
        let admin = AdminClient::with_token(SdkConfig::default(), "dev-tok", "a@b.c")
            .unwrap()
            .with_system("key", "secret");
        let creds = admin.credentials().await.unwrap();
        assert_eq!(creds.len(), 1);
        assert_eq!(creds.get("ClearBlade-DevToken"), Some("dev-tok"));
    }

    #[tokio::test]
    async fn test_admin_without_anything_has_no_credentials() {
        let admin = AdminClient::new(SdkConfig::default(), "a@b.c", "pw").unwrap();
        let err = admin.credentials().await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::NoCredentials);
    }
}
