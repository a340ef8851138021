/// Stratum v1 protocol message types and serialization
///
/// Line-delimited JSON-RPC. Client requests are parsed into the closed
/// `ClientMessage` enum; responses carry errors as `[code, message, data]`.

use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::{json, Value};

use crate::error::{ProtocolError, ShareRejection};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StratumRequest {
    /// Request ID
    #[serde(default)]
    pub id: Value,

    /// Method name
    pub method: String,

    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

impl StratumRequest {
    pub fn parse(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StratumResponse {
    pub id: Value,
    pub result: Value,
    pub error: Option<StratumError>,
}

impl StratumResponse {
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            id,
            result,
            error: None,
        }
    }

    pub fn error(id: Value, error: StratumError) -> Self {
        Self {
            id,
            result: Value::Null,
            error: Some(error),
        }
    }
}

/// Server-initiated message (`id` is always null)
#[derive(Debug, Clone, Serialize)]
pub struct StratumNotification {
    pub id: Value,
    pub method: &'static str,
    pub params: Value,
}

impl StratumNotification {
    pub fn notify(params: Value) -> Self {
        Self {
            id: Value::Null,
            method: "mining.notify",
            params,
        }
    }

    pub fn set_difficulty(difficulty: f64) -> Self {
        Self {
            id: Value::Null,
            method: "mining.set_difficulty",
            params: json!([difficulty]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StratumError {
    pub code: i32,
    pub message: String,
    pub data: Option<Value>,
}

impl Serialize for StratumError {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut triple = serializer.serialize_tuple(3)?;
        triple.serialize_element(&self.code)?;
        triple.serialize_element(&self.message)?;
        triple.serialize_element(&self.data)?;
        triple.end()
    }
}

impl StratumError {
    /// Standard error codes
    pub const OTHER: i32 = 20;
    pub const INVALID_METHOD: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    /// Job not found (stale)
    pub const JOB_NOT_FOUND: i32 = 21;

    /// Invalid share
    pub const DUPLICATE_SHARE: i32 = 22;
    pub const LOW_DIFFICULTY: i32 = 23;

    /// Not authorized
    pub const UNAUTHORIZED: i32 = 24;
    pub const NOT_SUBSCRIBED: i32 = 25;

    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn unknown_method(method: &str) -> Self {
        Self::new(Self::INVALID_METHOD, format!("Unsupported method {}", method))
    }
}

impl From<&ShareRejection> for StratumError {
    fn from(rejection: &ShareRejection) -> Self {
        Self::new(rejection.code(), rejection.to_string())
    }
}

impl From<&ProtocolError> for StratumError {
    fn from(err: &ProtocolError) -> Self {
        let code = match err {
            ProtocolError::InvalidParams { .. } | ProtocolError::Malformed(_) => {
                Self::INVALID_PARAMS
            }
            ProtocolError::OutOfOrder { method, .. } if *method == "mining.submit" => {
                Self::UNAUTHORIZED
            }
            ProtocolError::OutOfOrder { .. } => Self::NOT_SUBSCRIBED,
            ProtocolError::InvalidWorkerName(_) => Self::UNAUTHORIZED,
            ProtocolError::LineTooLong(_) => Self::OTHER,
        };
        Self::new(code, err.to_string())
    }
}

/// `mining.submit` params, kept as the hex strings the miner sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitParams {
    pub worker: String,
    pub job_id: String,
    pub extranonce2: String,
    pub ntime: String,
    pub nonce: String,
}

/// Every client request the pool understands
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    Subscribe { user_agent: Option<String> },
    Authorize { username: String },
    Submit(SubmitParams),
    /// Anything else; answered with an error, connection kept
    Unsupported(String),
}

fn str_param(params: &[Value], idx: usize, method: &'static str) -> Result<String, ProtocolError> {
    params
        .get(idx)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| ProtocolError::invalid_params(method, format!("param {} must be a string", idx)))
}

impl ClientMessage {
    pub fn from_request(req: &StratumRequest) -> Result<Self, ProtocolError> {
        let empty = Vec::new();
        let params = match &req.params {
            Value::Array(items) => items,
            Value::Null => &empty,
            _ => {
                return Err(ProtocolError::Malformed("params must be an array".to_string()));
            }
        };

        match req.method.as_str() {
            "mining.subscribe" => Ok(Self::Subscribe {
                user_agent: params.first().and_then(Value::as_str).map(str::to_string),
            }),
            "mining.authorize" => Ok(Self::Authorize {
                username: str_param(params, 0, "mining.authorize")?,
            }),
            "mining.submit" => {
                if params.len() < 5 {
                    return Err(ProtocolError::invalid_params(
                        "mining.submit",
                        format!("expected 5 params, got {}", params.len()),
                    ));
                }
                Ok(Self::Submit(SubmitParams {
                    worker: str_param(params, 0, "mining.submit")?,
                    job_id: str_param(params, 1, "mining.submit")?,
                    extranonce2: str_param(params, 2, "mining.submit")?,
                    ntime: str_param(params, 3, "mining.submit")?,
                    nonce: str_param(params, 4, "mining.submit")?,
                }))
            }
            other => Ok(Self::Unsupported(other.to_string())),
        }
    }
}

/// Serialize any message as one newline-terminated line
pub fn to_line<T: Serialize>(msg: &T) -> String {
    let mut line = serde_json::to_string(msg).unwrap_or_else(|_| "{}".to_string());
    line.push('\n');
    line
}
