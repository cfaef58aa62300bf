//! HTTP request dispatch
//!
//! One shared `reqwest::Client` serves every role. Roles plug in through
//! [`RoleClient`]: the dispatcher asks them for credentials, the edge proxy
//! target and an optional client-certificate transport, and knows nothing
//! else about them.

use super::request::Request;
use super::response::{Response, ResponseBody};
use crate::config::HttpSection;
use crate::error::{SdkError, SdkResult};
use crate::request_span;
use crate::roles::RoleClient;
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use std::fmt;
use tracing::{debug, Instrument};
use url::Url;

/// Client-certificate transport used for mutual-TLS requests
#[derive(Clone)]
pub struct MtlsTransport {
    client: reqwest::Client,
}

impl MtlsTransport {
    /// Build from PEM-encoded certificate and private key
    pub fn from_pem(cert_pem: &[u8], key_pem: &[u8], config: &HttpSection) -> SdkResult<Self> {
        let mut identity_pem = Vec::with_capacity(cert_pem.len() + key_pem.len() + 1);
        identity_pem.extend_from_slice(key_pem);
        identity_pem.push(b'\n');
        identity_pem.extend_from_slice(cert_pem);

        let identity = reqwest::Identity::from_pem(&identity_pem)
            .map_err(|e| SdkError::Tls(format!("invalid client certificate or key: {e}")))?;

        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .identity(identity)
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| SdkError::Tls(format!("failed to build mTLS client: {e}")))?;

        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl fmt::Debug for MtlsTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsTransport").finish_non_exhaustive()
    }
}

/// Executes platform requests on behalf of a role
#[derive(Debug, Clone)]
pub struct Dispatcher {
    client: reqwest::Client,
}

impl Dispatcher {
    pub fn new(config: &HttpSection) -> SdkResult<Self> {
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .build()
            .map_err(|e| SdkError::Tls(format!("failed to build HTTP client: {e}")))?;

        Ok(Self { client })
    }

    /// Execute `request` as `role`.
    ///
    /// Credentials are resolved before any I/O. Any status comes back as a
    /// [`Response`]; judging it is left to the caller (see
    /// [`super::response::normalize`]).
    pub async fn dispatch<R>(&self, role: &R, request: Request) -> SdkResult<Response>
    where
        R: RoleClient + ?Sized,
    {
        let span = request_span!(
            role = %role.role(),
            method = %request.method,
            path = %request.path
        );
        self.dispatch_inner(role, request).instrument(span).await
    }

    async fn dispatch_inner<R>(&self, role: &R, request: Request) -> SdkResult<Response>
    where
        R: RoleClient + ?Sized,
    {
        let edge_proxy = role.edge_proxy().await;
        let credentials = if request.anonymous {
            None
        } else {
            Some(role.credentials().await?)
        };

        let mtls = request.mtls.clone().or_else(|| role.mtls_transport());
        let endpoints = role.core().endpoints().await;
        let mtls_port = match mtls {
            Some(_) => Some(parse_port(&endpoints.mtls_port)?),
            None => None,
        };
        let url = build_url(&endpoints.http_addr, mtls_port, &request.path, &request.query)?;

        let client = match &mtls {
            Some(transport) => transport.client(),
            None => &self.client,
        };

        let mut builder = client
            .request(request.method.clone(), url)
            .header(ACCEPT, "application/json");
        if let Some(proxy) = &edge_proxy {
            for (name, value) in proxy.headers() {
                builder = builder.header(name, value);
            }
        }
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(credentials) = &credentials {
            for (name, value) in credentials.headers() {
                builder = builder.header(*name, value.as_str());
            }
        }
        if let Some(body) = &request.body {
            builder = builder
                .header(CONTENT_TYPE, "application/json")
                .body(serde_json::to_vec(body)?);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let bytes = response.bytes().await?;

        let body = if request.raw {
            ResponseBody::raw(&bytes)
        } else {
            ResponseBody::decode(&bytes)
        };

        debug!(
            status = status,
            body_len = bytes.len(),
            mtls = mtls.is_some(),
            edge = edge_proxy.is_some(),
            "Platform request completed"
        );

        Ok(Response::new(status, body))
    }
}

fn parse_port(port: &str) -> SdkResult<u16> {
    port.parse::<u16>()
        .map_err(|_| SdkError::invalid_input(format!("invalid mTLS port '{port}'")))
}

/// `{base}{path}?{query}`, with the port swapped for mTLS requests
pub(crate) fn build_url(
    base: &str,
    port: Option<u16>,
    path: &str,
    query: &[(String, String)],
) -> SdkResult<Url> {
    let mut url = Url::parse(&format!("{}{}", base.trim_end_matches('/'), path))?;

    if let Some(port) = port {
        url.set_port(Some(port))
            .map_err(|_| SdkError::invalid_input(format!("cannot set port on '{base}'")))?;
    }

    if !query.is_empty() {
        url.query_pairs_mut()
            .extend_pairs(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    }

    Ok(url)
}
