//! HTTP side of the SDK: credentials, dispatch and response handling

pub mod credentials;
pub mod dispatcher;
pub mod request;
pub mod response;

pub use credentials::{resolve_credentials, CredentialSet, CredentialSource, EdgeProxy};
pub use dispatcher::{Dispatcher, MtlsTransport};
pub use request::Request;
pub use response::{normalize, Response, ResponseBody};
