use super::dispatcher::MtlsTransport;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;

/// One HTTP call against the platform
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<Value>,
    /// Extra headers, sent alongside credentials and edge-proxy headers
    pub headers: Vec<(String, String)>,
    /// Skip credential resolution (login calls)
    pub anonymous: bool,
    /// Keep the body as text instead of decoding JSON
    pub raw: bool,
    /// Client-certificate transport for this call only
    pub mtls: Option<Arc<MtlsTransport>>,
}

impl Request {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            anonymous: false,
            raw: false,
            mtls: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(Method::POST, path)
    }

    pub fn put(path: impl Into<String>) -> Self {
        Self::new(Method::PUT, path)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    pub fn query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((name.into(), value.into()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    pub fn raw(mut self) -> Self {
        self.raw = true;
        self
    }

    pub fn with_mtls(mut self, transport: Arc<MtlsTransport>) -> Self {
        self.mtls = Some(transport);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder() {
        let request = Request::post("/api/v/1/user/auth")
            .query("limit", "10")
            .json(json!({"email": "a@b.c"}))
            .header("X-Trace", "1")
            .anonymous();

        assert_eq!(request.method, Method::POST);
        assert_eq!(request.path, "/api/v/1/user/auth");
        assert_eq!(request.query, vec![("limit".to_string(), "10".to_string())]);
        assert_eq!(request.body, Some(json!({"email": "a@b.c"})));
        assert!(request.anonymous);
        assert!(!request.raw);
        assert!(request.mtls.is_none());
    }
}
