//! End-user client

use super::session::{ClientCore, Session};
use super::{expiry_seconds, required_token, Api, Role, RoleClient};
use crate::config::SdkConfig;
use crate::error::{SdkError, SdkResult};
use crate::http::Request;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::fmt;
use tracing::info;

const USER_PREAMBLE: &str = "/api/v/1/user";

/// Tokens issued by a user login or refresh
#[derive(Clone, PartialEq, Eq)]
pub struct UserAuthResponse {
    pub user_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
}

impl UserAuthResponse {
    fn from_body(body: &Map<String, Value>) -> SdkResult<Self> {
        Ok(Self {
            user_token: required_token(body, "user_token")?,
            refresh_token: body
                .get("refresh_token")
                .and_then(Value::as_str)
                .map(str::to_string),
            expires_at: expiry_seconds(body),
        })
    }
}

impl fmt::Debug for UserAuthResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserAuthResponse")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// End user of one system
pub struct UserClient {
    core: ClientCore,
    system_key: String,
    system_secret: String,
    email: String,
    password: String,
}

impl UserClient {
    pub fn new(
        config: SdkConfig,
        system_key: impl Into<String>,
        system_secret: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> SdkResult<Self> {
        Self::build(
            config,
            Session::default(),
            system_key,
            system_secret,
            email,
            password,
        )
    }

    /// Service account: the token is issued out of band and never refreshed
    pub fn with_token(
        config: SdkConfig,
        system_key: impl Into<String>,
        system_secret: impl Into<String>,
        email: impl Into<String>,
        token: impl Into<String>,
    ) -> SdkResult<Self> {
        Self::build(
            config,
            Session::with_token(token),
            system_key,
            system_secret,
            email,
            String::new(),
        )
    }

    /// Resume a session persisted by the caller
    pub fn with_refresh_token(
        config: SdkConfig,
        system_key: impl Into<String>,
        system_secret: impl Into<String>,
        email: impl Into<String>,
        token: impl Into<String>,
        refresh_token: impl Into<String>,
        expires_at: i64,
    ) -> SdkResult<Self> {
        let session = Session {
            token: Some(token.into()),
            refresh_token: Some(refresh_token.into()),
            expires_at: Some(expires_at),
        };
        Self::build(config, session, system_key, system_secret, email, String::new())
    }

    fn build(
        config: SdkConfig,
        session: Session,
        system_key: impl Into<String>,
        system_secret: impl Into<String>,
        email: impl Into<String>,
        password: impl Into<String>,
    ) -> SdkResult<Self> {
        Ok(Self {
            core: ClientCore::with_session(config, session)?,
            system_key: system_key.into(),
            system_secret: system_secret.into(),
            email: email.into(),
            password: password.into(),
        })
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub async fn authenticate(&self) -> SdkResult<UserAuthResponse> {
        self.authenticate_with_options(HashMap::new()).await
    }

    /// Log in; `options` are sent alongside the email and password
    pub async fn authenticate_with_options(
        &self,
        options: HashMap<String, String>,
    ) -> SdkResult<UserAuthResponse> {
        let _gate = self.core.auth_guard().await;

        let mut body: Map<String, Value> = options
            .into_iter()
            .map(|(key, value)| (key, Value::String(value)))
            .collect();
        body.insert("email".to_string(), Value::String(self.email.clone()));
        body.insert("password".to_string(), Value::String(self.password.clone()));

        let response = self
            .post(&format!("{USER_PREAMBLE}/auth"), Value::Object(body))
            .await?
            .into_object()?;
        let auth = UserAuthResponse::from_body(&response)?;
        self.store(&auth, false).await;

        info!(email = %self.email, "User authenticated");
        Ok(auth)
    }

    /// Trade the refresh token for a new access token
    pub async fn refresh_authentication(&self) -> SdkResult<UserAuthResponse> {
        let _gate = self.core.auth_guard().await;

        let session = self.core.session().await;
        let refresh_token = session
            .refresh_token
            .ok_or_else(|| SdkError::invalid_input("No refresh token to refresh with"))?;

        let body = json!({
            "refresh_token": refresh_token,
            "access_token": session.token.unwrap_or_default(),
            "grant_type": "refresh_token",
        });
        let response = self
            .post(&format!("{USER_PREAMBLE}/auth"), body)
            .await?
            .into_object()?;
        let auth = UserAuthResponse::from_body(&response)?;
        self.store(&auth, true).await;

        info!(email = %self.email, "User token refreshed");
        Ok(auth)
    }

    /// Log in as the system's anonymous user
    pub async fn auth_anon(&self) -> SdkResult<()> {
        let _gate = self.core.auth_guard().await;

        let response = self
            .dispatch(Request::post(format!("{USER_PREAMBLE}/anon")))
            .await?
            .normalize()?
            .into_object()?;
        let token = required_token(&response, "user_token")?;
        self.set_token(token).await;

        info!("Anonymous user authenticated");
        Ok(())
    }

    pub async fn check_auth(&self) -> SdkResult<bool> {
        super::admin::check_auth(self).await
    }

    pub async fn logout(&self) -> SdkResult<()> {
        super::admin::logout(self).await
    }

    /// A refresh keeps the previous refresh token and expiry when the
    /// platform omits them
    async fn store(&self, auth: &UserAuthResponse, keep_missing: bool) {
        let auth = auth.clone();
        self.core
            .update_session(move |session| {
                session.token = Some(auth.user_token);
                if auth.refresh_token.is_some() || !keep_missing {
                    session.refresh_token = auth.refresh_token;
                }
                if auth.expires_at.is_some() || !keep_missing {
                    session.expires_at = auth.expires_at;
                }
            })
            .await;
    }
}

impl RoleClient for UserClient {
    fn role(&self) -> Role {
        Role::User
    }

    fn core(&self) -> &ClientCore {
        &self.core
    }

    fn preamble(&self) -> String {
        USER_PREAMBLE.to_string()
    }

    fn system_key(&self) -> Option<&str> {
        Some(&self.system_key)
    }

    fn system_secret(&self) -> Option<&str> {
        Some(&self.system_secret)
    }
}

impl fmt::Debug for UserClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UserClient")
            .field("system_key", &self.system_key)
            .field("email", &self.email)
            .finish_non_exhaustive()
    }
}
