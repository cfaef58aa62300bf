//! Credential resolution
//!
//! Every role proves its identity with an ordered set of headers. Admin and
//! User present exactly one mechanism (token, else key and secret). Device
//! presents every mechanism it has, since provisioning flows may need both.

use crate::error::{SdkError, SdkResult};
use crate::roles::Role;
use std::fmt;

pub const DEV_TOKEN_HEADER: &str = "ClearBlade-DevToken";
pub const USER_TOKEN_HEADER: &str = "ClearBlade-UserToken";
pub const DEVICE_TOKEN_HEADER: &str = "ClearBlade-DeviceToken";
pub const SYSTEM_KEY_HEADER: &str = "ClearBlade-SystemKey";
pub const SYSTEM_SECRET_HEADER: &str = "ClearBlade-SystemSecret";

pub const EDGE_SYSTEM_KEY_HEADER: &str = "Clearblade-Systemkey";
pub const EDGE_NAME_HEADER: &str = "Clearblade-Edge";

/// Ordered header pairs proving identity on one request
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialSet {
    headers: Vec<(&'static str, String)>,
}

impl CredentialSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, name: &'static str, value: impl Into<String>) {
        self.headers.push((name, value.into()));
    }

    pub fn headers(&self) -> &[(&'static str, String)] {
        &self.headers
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(header, _)| header.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.headers.iter().map(|(name, _)| *name).collect()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }
}

// Header values are secrets
impl fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialSet")
            .field("headers", &self.names())
            .finish()
    }
}

/// Identity material a role currently holds
#[derive(Clone, Copy, Default)]
pub struct CredentialSource<'a> {
    pub token: Option<&'a str>,
    pub system_key: Option<&'a str>,
    pub system_secret: Option<&'a str>,
}

fn present(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Build the credential headers for `role`
pub fn resolve_credentials(role: Role, source: CredentialSource<'_>) -> SdkResult<CredentialSet> {
    let token = present(source.token);
    let key_pair = match (present(source.system_key), present(source.system_secret)) {
        (Some(key), Some(secret)) => Some((key, secret)),
        _ => None,
    };

    let mut credentials = CredentialSet::new();
    match role {
        Role::Admin | Role::User => {
            if let Some(token) = token {
                credentials.push(role.token_header(), token);
            } else if let Some((key, secret)) = key_pair {
                credentials.push(SYSTEM_KEY_HEADER, key);
                credentials.push(SYSTEM_SECRET_HEADER, secret);
            }
        }
        Role::Device => {
            if let Some(token) = token {
                credentials.push(role.token_header(), token);
            }
            if let Some((key, secret)) = key_pair {
                credentials.push(SYSTEM_KEY_HEADER, key);
                credentials.push(SYSTEM_SECRET_HEADER, secret);
            }
        }
    }

    if credentials.is_empty() {
        return Err(SdkError::NoCredentials { role });
    }
    Ok(credentials)
}

/// Routes requests to a specific edge instead of the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EdgeProxy {
    pub system_key: String,
    pub edge_name: String,
}

impl EdgeProxy {
    pub fn new(system_key: &str, edge_name: &str) -> SdkResult<Self> {
        if system_key.is_empty() || edge_name.is_empty() {
            return Err(SdkError::invalid_input(
                "Both system key and edge name are required to proxy to an edge",
            ));
        }
        Ok(Self {
            system_key: system_key.to_string(),
            edge_name: edge_name.to_string(),
        })
    }

    pub fn headers(&self) -> [(&'static str, &str); 2] {
        [
            (EDGE_SYSTEM_KEY_HEADER, self.system_key.as_str()),
            (EDGE_NAME_HEADER, self.edge_name.as_str()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    fn source<'a>(
        token: Option<&'a str>,
        key: Option<&'a str>,
        secret: Option<&'a str>,
    ) -> CredentialSource<'a> {
        CredentialSource {
            token,
            system_key: key,
            system_secret: secret,
        }
    }

    #[test]
    fn test_admin_token_only() {
        let creds = resolve_credentials(Role::Admin, source(Some("dev-tok"), None, None)).unwrap();
        assert_eq!(creds.headers(), &[(DEV_TOKEN_HEADER, "dev-tok".to_string())]);
    }

    #[test]
    fn test_token_takes_precedence_for_admin_and_user() {
        for role in [Role::Admin, Role::User] {
            let creds =
                resolve_credentials(role, source(Some("tok"), Some("key"), Some("secret"))).unwrap();
            assert_eq!(creds.len(), 1);
            assert_eq!(creds.get(role.token_header()), Some("tok"));
            assert_eq!(creds.get(SYSTEM_KEY_HEADER), None);
        }
    }

    #[test]
    fn test_user_key_pair_fallback() {
        let creds = resolve_credentials(Role::User, source(None, Some("key"), Some("secret"))).unwrap();
        assert_eq!(creds.names(), vec![SYSTEM_KEY_HEADER, SYSTEM_SECRET_HEADER]);
        assert_eq!(creds.get(SYSTEM_SECRET_HEADER), Some("secret"));
    }

    #[test]
    fn test_device_accumulates_everything() {
        let creds =
            resolve_credentials(Role::Device, source(Some("dtok"), Some("key"), Some("secret")))
                .unwrap();
        assert_eq!(
            creds.names(),
            vec![DEVICE_TOKEN_HEADER, SYSTEM_KEY_HEADER, SYSTEM_SECRET_HEADER]
        );

        let creds = resolve_credentials(Role::Device, source(Some("dtok"), None, None)).unwrap();
        assert_eq!(creds.names(), vec![DEVICE_TOKEN_HEADER]);
    }

    #[test]
    fn test_nothing_present_fails() {
        for role in [Role::Admin, Role::User, Role::Device] {
            let err = resolve_credentials(role, source(None, None, None)).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::NoCredentials);
        }
    }

    #[test]
    fn test_half_a_key_pair_is_not_enough() {
        let err = resolve_credentials(Role::User, source(None, Some("key"), None)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCredentials);

        let err = resolve_credentials(Role::Device, source(Some(""), None, Some("secret"))).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NoCredentials);
    }

    #[test]
    fn test_debug_hides_values() {
        let creds = resolve_credentials(Role::Admin, source(Some("very-secret"), None, None)).unwrap();
        let rendered = format!("{creds:?}");
        assert!(rendered.contains(DEV_TOKEN_HEADER));
        assert!(!rendered.contains("very-secret"));
    }

    #[test]
    fn test_edge_proxy() {
        let proxy = EdgeProxy::new("sys", "edge-1").unwrap();
        assert_eq!(
            proxy.headers(),
            [(EDGE_SYSTEM_KEY_HEADER, "sys"), (EDGE_NAME_HEADER, "edge-1")]
        );

        assert_eq!(
            EdgeProxy::new("", "edge-1").unwrap_err().kind(),
            ErrorKind::InvalidInput
        );
        assert!(EdgeProxy::new("sys", "").is_err());
    }
}
