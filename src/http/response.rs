//! Response decoding and normalization
//!
//! The platform answers with a JSON object, a JSON list, or free text. The
//! shape is only known at runtime, so bodies decode into [`ResponseBody`] and
//! callers match on the variant.

use crate::error::{SdkError, SdkResult};
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fmt;

/// Decoded response body
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    /// Zero-length body; decoding was never attempted
    Empty,
    Object(Map<String, Value>),
    List(Vec<Value>),
    /// Anything that is not a JSON object or list, verbatim
    Raw(String),
}

impl ResponseBody {
    /// Decode once: object or list, else the raw text. Only the first JSON
    /// value counts; anything after it is ignored.
    pub fn decode(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            return ResponseBody::Empty;
        }
        match serde_json::Deserializer::from_slice(bytes)
            .into_iter::<Value>()
            .next()
        {
            Some(Ok(Value::Object(map))) => ResponseBody::Object(map),
            Some(Ok(Value::Array(list))) => ResponseBody::List(list),
            _ => ResponseBody::Raw(String::from_utf8_lossy(bytes).into_owned()),
        }
    }

    /// Keep the body as text
    pub fn raw(bytes: &[u8]) -> Self {
        if bytes.is_empty() {
            ResponseBody::Empty
        } else {
            ResponseBody::Raw(String::from_utf8_lossy(bytes).into_owned())
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, ResponseBody::Empty)
    }

    pub fn as_object(&self) -> Option<&Map<String, Value>> {
        match self {
            ResponseBody::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            ResponseBody::List(list) => Some(list),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&str> {
        match self {
            ResponseBody::Raw(text) => Some(text),
            _ => None,
        }
    }

    /// The body as a JSON value (`Null` when empty, a string when raw)
    pub fn into_value(self) -> Value {
        match self {
            ResponseBody::Empty => Value::Null,
            ResponseBody::Object(map) => Value::Object(map),
            ResponseBody::List(list) => Value::Array(list),
            ResponseBody::Raw(text) => Value::String(text),
        }
    }

    fn shape(&self) -> &'static str {
        match self {
            ResponseBody::Empty => "an empty body",
            ResponseBody::Object(_) => "an object",
            ResponseBody::List(_) => "a list",
            ResponseBody::Raw(_) => "raw text",
        }
    }
}

/// Stringified body, as surfaced in error messages
impl fmt::Display for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResponseBody::Empty => Ok(()),
            ResponseBody::Raw(text) => f.write_str(text),
            ResponseBody::Object(map) => {
                write!(f, "{}", Value::Object(map.clone()))
            }
            ResponseBody::List(list) => write!(f, "{}", Value::Array(list.clone())),
        }
    }
}

/// Status code plus decoded body
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: ResponseBody,
}

impl Response {
    pub fn new(status: u16, body: ResponseBody) -> Self {
        Self { status, body }
    }

    /// Exactly 200 counts as success
    pub fn is_success(&self) -> bool {
        self.status == 200
    }

    /// Non-success becomes a domain error carrying the raw body text
    pub fn normalize(self) -> SdkResult<Self> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(SdkError::Domain {
                status: self.status,
                body: self.body.to_string(),
            })
        }
    }

    pub fn into_object(self) -> SdkResult<Map<String, Value>> {
        match self.body {
            ResponseBody::Object(map) => Ok(map),
            other => Err(SdkError::unexpected_response(format!(
                "expected an object, got {}",
                other.shape()
            ))),
        }
    }

    pub fn into_list(self) -> SdkResult<Vec<Value>> {
        match self.body {
            ResponseBody::List(list) => Ok(list),
            other => Err(SdkError::unexpected_response(format!(
                "expected a list, got {}",
                other.shape()
            ))),
        }
    }

    pub fn into_raw(self) -> SdkResult<String> {
        match self.body {
            ResponseBody::Raw(text) => Ok(text),
            ResponseBody::Empty => Ok(String::new()),
            other => Err(SdkError::unexpected_response(format!(
                "expected raw text, got {}",
                other.shape()
            ))),
        }
    }

    /// Deserialize an object or list body into `T`
    pub fn deserialize<T: DeserializeOwned>(self) -> SdkResult<T> {
        match self.body {
            ResponseBody::Object(_) | ResponseBody::List(_) => {
                Ok(serde_json::from_value(self.body.into_value())?)
            }
            other => Err(SdkError::unexpected_response(format!(
                "cannot deserialize {}",
                other.shape()
            ))),
        }
    }
}

/// Post-filter for a dispatch result: transport errors pass through, a
/// non-200 status becomes [`SdkError::Domain`]
pub fn normalize(result: SdkResult<Response>) -> SdkResult<Response> {
    result.and_then(Response::normalize)
}
