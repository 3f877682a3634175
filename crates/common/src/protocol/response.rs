// Operation results reported by the remote store.
//
// A response carries optional data plus a list of structured failures. Any
// reported failure fails the whole operation; partial data is discarded.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// One structured failure reported by the store (e.g. "annotation not found").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ServiceError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub path: Vec<String>,
}

impl ServiceError {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into(), code: None, path: Vec::new() }
    }

    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for ServiceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.code {
            Some(code) => write!(f, "{code}: {}", self.message),
            None => f.write_str(&self.message),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ResponseError {
    #[error("remote store reported {} error(s): {}", .0.len(), join_messages(.0))]
    Service(Vec<ServiceError>),
    #[error("remote store returned no data")]
    MissingData,
}

fn join_messages(errors: &[ServiceError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// Envelope for a single store operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Response<T> {
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ServiceError>,
}

impl<T> Response<T> {
    pub fn ok(data: T) -> Self {
        Self { data: Some(data), errors: Vec::new() }
    }

    pub fn failed(errors: Vec<ServiceError>) -> Self {
        Self { data: None, errors }
    }

    /// Data if no errors were reported; `None` data is allowed.
    pub fn into_result(self) -> Result<Option<T>, ResponseError> {
        if self.errors.is_empty() {
            Ok(self.data)
        } else {
            Err(ResponseError::Service(self.errors))
        }
    }

    /// Data if no errors were reported and data is present.
    pub fn into_data(self) -> Result<T, ResponseError> {
        self.into_result()?.ok_or(ResponseError::MissingData)
    }
}
