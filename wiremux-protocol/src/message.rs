//! JSON message types for handshakes, batches and control frames.
//!
//! Every frame is one JSON object. The field that identifies the frame type
//! (`heartbeat`, `status`, `handshake`, `close`) is declared first so that the
//! serialized form always starts with it.

use crate::error::ErrorCode;
use crate::{DEFAULT_DATA_FORMAT, PROTOCOL_NAME, PROTOCOL_VERSION};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Default method for logical requests.
pub const DEFAULT_METHOD: &str = "POST";

/// Default path for logical requests.
pub const DEFAULT_PATH: &str = "/";

fn default_method() -> String {
    DEFAULT_METHOD.to_string()
}

fn default_path() -> String {
    DEFAULT_PATH.to_string()
}

fn default_data_format() -> String {
    DEFAULT_DATA_FORMAT.to_string()
}

/// Accepts `null` wherever a list is expected.
fn null_as_empty<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// HTTP-style header. Duplicates are allowed and order is preserved.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

impl Header {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Query string parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryParam {
    pub name: String,
    pub value: String,
}

impl QueryParam {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// Returns the first header whose name matches, ignoring ASCII case.
pub fn find_header<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|h| h.name.eq_ignore_ascii_case(name))
        .map(|h| h.value.as_str())
}

/// A logical request carried inside a batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    /// Correlation identifier. Assigned by the dispatcher when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,

    #[serde(default = "default_path")]
    pub path: String,

    #[serde(default = "default_method")]
    pub method: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub headers: Vec<Header>,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub query_string: Vec<QueryParam>,

    #[serde(default = "default_data_format")]
    pub data_format: String,

    /// A JSON `null` body is the same as no body and decodes as `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_body: Option<Value>,
}

impl Default for Request {
    fn default() -> Self {
        Self {
            uuid: None,
            path: default_path(),
            method: default_method(),
            headers: Vec::new(),
            query_string: Vec::new(),
            data_format: default_data_format(),
            message_body: None,
        }
    }
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new("GET", path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new("POST", path)
    }

    pub fn with_uuid(mut self, uuid: impl Into<String>) -> Self {
        self.uuid = Some(uuid.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    pub fn with_query(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_string.push(QueryParam::new(name, value));
        self
    }

    pub fn with_data_format(mut self, data_format: impl Into<String>) -> Self {
        self.data_format = data_format.into();
        self
    }

    /// Sets the body. `null` clears it.
    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.message_body = Some(body.into()).filter(|body| !body.is_null());
        self
    }

    /// Returns the correlation identifier, if assigned.
    pub fn id(&self) -> Option<&str> {
        self.uuid.as_deref()
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// All values of a query parameter, in wire order.
    pub fn query(&self, name: &str) -> Vec<&str> {
        self.query_string
            .iter()
            .filter(|q| q.name == name)
            .map(|q| q.value.as_str())
            .collect()
    }

    /// Returns the body if it is a JSON string.
    pub fn body_str(&self) -> Option<&str> {
        self.message_body.as_ref().and_then(Value::as_str)
    }
}

/// A logical response, correlated to its request by `uuid`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub uuid: String,

    #[serde(default)]
    pub path: String,

    pub status_code: u16,

    #[serde(default)]
    pub reason_phrase: String,

    #[serde(default, deserialize_with = "null_as_empty")]
    pub headers: Vec<Header>,

    /// A JSON `null` body is the same as no body and decodes as `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_body: Option<Value>,

    /// Marks the final response of its batch.
    #[serde(default)]
    pub last: bool,
}

impl Response {
    pub fn new(
        uuid: impl Into<String>,
        status_code: u16,
        reason_phrase: impl Into<String>,
    ) -> Self {
        Self {
            uuid: uuid.into(),
            path: String::new(),
            status_code,
            reason_phrase: reason_phrase.into(),
            headers: Vec::new(),
            message_body: None,
            last: false,
        }
    }

    pub fn ok(uuid: impl Into<String>, body: impl Into<Value>) -> Self {
        Self::new(uuid, 200, "OK").with_body(body)
    }

    /// Response for a call that failed with a session-level code.
    pub fn from_code(uuid: impl Into<String>, code: ErrorCode) -> Self {
        Self::new(uuid, code.status_code(), code.reason_phrase())
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push(Header::new(name, value));
        self
    }

    /// Sets the body. `null` clears it.
    pub fn with_body(mut self, body: impl Into<Value>) -> Self {
        self.message_body = Some(body.into()).filter(|body| !body.is_null());
        self
    }

    /// Returns whether the status is in the 2xx range.
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    /// Returns the body if it is a JSON string.
    pub fn body_str(&self) -> Option<&str> {
        self.message_body.as_ref().and_then(Value::as_str)
    }
}

/// Batch of logical requests, in dispatch order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMessage {
    pub identity: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub requests: Vec<Request>,
}

impl RequestMessage {
    pub fn new(identity: impl Into<String>, requests: Vec<Request>) -> Self {
        Self {
            identity: identity.into(),
            requests,
        }
    }
}

/// Batch of logical responses, in completion order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub identity: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub responses: Vec<Response>,
}

impl ResponseMessage {
    pub fn new(identity: impl Into<String>, responses: Vec<Response>) -> Self {
        Self {
            identity: identity.into(),
            responses,
        }
    }

    /// Envelope carrying exactly one response.
    pub fn single(identity: impl Into<String>, response: Response) -> Self {
        Self::new(identity, vec![response])
    }
}

/// Connection bootstrap request.
///
/// The optional request-like fields describe a call the server may run on the
/// client's behalf when the session is established.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    pub protocol_name: String,
    pub protocol_version: String,
    #[serde(default = "default_data_format")]
    pub data_format: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub headers: Vec<Header>,
    #[serde(
        default,
        deserialize_with = "null_as_empty",
        skip_serializing_if = "Vec::is_empty"
    )]
    pub query_string: Vec<QueryParam>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_body: Option<Value>,
}

impl Default for Handshake {
    fn default() -> Self {
        Self {
            protocol_name: PROTOCOL_NAME.to_string(),
            protocol_version: PROTOCOL_VERSION.to_string(),
            data_format: default_data_format(),
            uuid: None,
            path: None,
            method: None,
            headers: Vec::new(),
            query_string: Vec::new(),
            message_body: None,
        }
    }
}

impl Handshake {
    /// Builds a handshake that delegates the given request to the server.
    pub fn from_request(request: &Request) -> Self {
        Self {
            data_format: request.data_format.clone(),
            uuid: request.uuid.clone(),
            path: Some(request.path.clone()),
            method: Some(request.method.clone()),
            headers: request.headers.clone(),
            query_string: request.query_string.clone(),
            message_body: request.message_body.clone(),
            ..Default::default()
        }
    }

    /// Trimmed data format; some clients pad it with whitespace.
    pub fn data_format(&self) -> &str {
        self.data_format.trim()
    }
}

/// Wire wrapper for [`Handshake`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandshakeMessage {
    pub handshake: Handshake,
}

impl HandshakeMessage {
    pub fn new(handshake: Handshake) -> Self {
        Self { handshake }
    }
}

/// Status code and reason phrase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Status {
    pub status_code: u16,
    #[serde(default)]
    pub reason_phrase: String,
}

impl Status {
    pub fn new(status_code: u16, reason_phrase: impl Into<String>) -> Self {
        Self {
            status_code,
            reason_phrase: reason_phrase.into(),
        }
    }
}

/// Session-level status: handshake answer or protocol error report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMessage {
    pub status: Status,
    #[serde(default)]
    pub identity: String,
}

impl StatusMessage {
    pub fn new(status: Status, identity: impl Into<String>) -> Self {
        Self {
            status,
            identity: identity.into(),
        }
    }

    /// Successful handshake answer carrying the issued identity.
    pub fn ok(identity: impl Into<String>) -> Self {
        Self::new(Status::new(200, "OK"), identity)
    }

    pub fn from_code(code: ErrorCode, identity: impl Into<String>) -> Self {
        Self::new(
            Status::new(code.status_code(), code.reason_phrase()),
            identity,
        )
    }

    pub fn status_code(&self) -> u16 {
        self.status.status_code
    }

    /// Any code below 400 counts as success.
    pub fn is_success(&self) -> bool {
        self.status.status_code < 400
    }
}

/// Keep-alive frame. Carries no correlation data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Monotonic marker.
    pub heartbeat: String,
    #[serde(default)]
    pub identity: String,
}

impl Heartbeat {
    pub fn new(marker: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            heartbeat: marker.into(),
            identity: identity.into(),
        }
    }
}

/// Voluntary termination notice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Close {
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub identity: String,
}

/// Wire wrapper for [`Close`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CloseMessage {
    pub close: Close,
}

impl CloseMessage {
    pub fn new(reason: impl Into<String>, identity: impl Into<String>) -> Self {
        Self {
            close: Close {
                reason: reason.into(),
                identity: identity.into(),
            },
        }
    }

    pub fn identity(&self) -> &str {
        &self.close.identity
    }
}
