//! JSON message types for requests and responses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Operations a worker can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    /// Verify a password against an existing hash.
    Compare,
    /// Produce a new hash for a password.
    Hash,
}

impl Operation {
    /// Lowercase name used in logs and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Compare => "compare",
            Operation::Hash => "hash",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Operation {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "compare" => Ok(Operation::Compare),
            "hash" => Ok(Operation::Hash),
            _ => Err(ValidationError::UnknownOperation(s.to_string())),
        }
    }
}

/// Request shape violations, detected before anything touches the network.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("password is required")]
    MissingPassword,

    #[error("hash is required")]
    MissingHash,

    #[error("hash is only valid for COMPARE")]
    UnexpectedHash,

    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

/// Request message.
#[derive(Clone, Serialize, Deserialize)]
pub struct Request {
    /// Correlation id, unique among the in-flight requests of one connection.
    pub id: String,

    pub operation: Operation,

    /// Plaintext password. Never logged.
    pub password: String,

    /// Existing hash, present iff `operation` is COMPARE.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    /// Opaque caller trace context, carried as hex on the wire.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "hex_bytes")]
    pub trace_context: Option<Vec<u8>>,
}

impl Request {
    /// Creates a HASH request.
    pub fn hash(id: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            operation: Operation::Hash,
            password: password.into(),
            hash: None,
            trace_context: None,
        }
    }

    /// Creates a COMPARE request.
    pub fn compare(
        id: impl Into<String>,
        password: impl Into<String>,
        hash: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            operation: Operation::Compare,
            password: password.into(),
            hash: Some(hash.into()),
            trace_context: None,
        }
    }

    pub fn with_trace_context(mut self, trace_context: Option<Vec<u8>>) -> Self {
        self.trace_context = trace_context;
        self
    }

    /// Checks that the request carries exactly what its operation needs.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.password.is_empty() {
            return Err(ValidationError::MissingPassword);
        }
        match (self.operation, self.hash.as_deref()) {
            (Operation::Compare, None) | (Operation::Compare, Some("")) => {
                Err(ValidationError::MissingHash)
            }
            (Operation::Hash, Some(_)) => Err(ValidationError::UnexpectedHash),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Request")
            .field("id", &self.id)
            .field("operation", &self.operation)
            .field("password", &"<redacted>")
            .field("hash", &self.hash.as_ref().map(|_| "<redacted>"))
            .field("trace_context", &self.trace_context.is_some())
            .finish()
    }
}

/// Response message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    /// Id of the request this response answers.
    pub request_id: String,

    /// COMPARE: whether the password matched. HASH: whether hashing succeeded.
    #[serde(default)]
    pub success: bool,

    /// The new hash, for HASH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,

    /// Set when the server declined to process the request.
    #[serde(default, skip_serializing_if = "is_false")]
    pub busy: bool,
}

fn is_false(b: &bool) -> bool {
    !*b
}

impl Response {
    /// Successful HASH.
    pub fn hashed(request_id: impl Into<String>, hash: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: true,
            hash: Some(hash.into()),
            busy: false,
        }
    }

    /// COMPARE outcome.
    pub fn compared(request_id: impl Into<String>, matched: bool) -> Self {
        Self {
            request_id: request_id.into(),
            success: matched,
            hash: None,
            busy: false,
        }
    }

    /// The worker could not complete the operation.
    pub fn failed(request_id: impl Into<String>) -> Self {
        Self::compared(request_id, false)
    }

    /// The server declined the request.
    pub fn busy(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            success: false,
            hash: None,
            busy: true,
        }
    }
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_str(&hex::encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: Option<String> = Option::deserialize(deserializer)?;
        s.map(|s| hex::decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
