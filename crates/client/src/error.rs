// Error types for the sync core.
//
// Remote failures, index failures and session precondition failures all end
// up as `SyncError`. None of them is fatal: the change that failed is dropped
// and the error is handed to the embedding application.

use std::path::PathBuf;

use annosync_common::protocol::response::{ResponseError, ServiceError};
use thiserror::Error;

/// Failures talking to the remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RemoteError {
    /// Network failure, dropped connection, closed change feed.
    #[error("remote transport failure: {0}")]
    Transport(String),
    /// The store answered with something the client cannot use.
    #[error("malformed remote response: {0}")]
    Protocol(String),
    /// The store reported one or more failures for the operation.
    #[error("remote store rejected the operation: {}", join_service_errors(.0))]
    Application(Vec<ServiceError>),
}

fn join_service_errors(errors: &[ServiceError]) -> String {
    errors.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

impl RemoteError {
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(vec![ServiceError::new(message)])
    }
}

impl From<ResponseError> for RemoteError {
    fn from(error: ResponseError) -> Self {
        match error {
            ResponseError::Service(errors) => Self::Application(errors),
            ResponseError::MissingData => Self::Protocol(error.to_string()),
        }
    }
}

/// Failures of the local annotation index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("failed to create index directory `{}`: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open annotation index at `{}`: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: rusqlite::Error,
    },
    #[error("failed to apply index migration v{version}: {source}")]
    Migration {
        version: i64,
        #[source]
        source: rusqlite::Error,
    },
    #[error("annotation index failed while {action}: {source}")]
    Query {
        action: &'static str,
        #[source]
        source: rusqlite::Error,
    },
    #[error("stored page number {0} is out of range")]
    InvalidPageNumber(i64),
}

/// Attach a short description of what the index was doing to a sqlite error.
pub(crate) trait QueryContext<T> {
    fn query_context(self, action: &'static str) -> Result<T, IndexError>;
}

impl<T> QueryContext<T> for rusqlite::Result<T> {
    fn query_context(self, action: &'static str) -> Result<T, IndexError> {
        self.map_err(|source| IndexError::Query { action, source })
    }
}

/// Anything that can go wrong while synchronizing one change.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("login failed: {0}")]
    Auth(#[source] RemoteError),
    #[error("no user is logged in")]
    NotLoggedIn,
    #[error("no document is open")]
    NoOpenDocument,
    #[error("annotation `{annotation_id}` is invalid: {reason}")]
    InvalidAnnotation { annotation_id: String, reason: &'static str },
}

impl SyncError {
    pub(crate) fn invalid(annotation_id: &str, reason: &'static str) -> Self {
        Self::InvalidAnnotation { annotation_id: annotation_id.to_string(), reason }
    }

    /// Whether the error came from the local index rather than the network.
    pub fn is_persistence(&self) -> bool {
        matches!(self, Self::Index(_))
    }
}
