// Remote store contract.
//
// The sync core only needs a handful of operations from the authoritative
// annotation store plus a per-user change feed. How those travel over the
// wire is up to the implementation.

pub mod loopback;

use annosync_common::protocol::annotations::{
    AnnotationChanged, EditAnnotationInput, NewAnnotationInput, RemoteAnnotation,
};
use annosync_common::types::{Credentials, User};
use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::RemoteError;

pub use loopback::{LoopbackStore, RemoteOperation};

pub type RemoteResult<T> = std::result::Result<T, RemoteError>;

/// Push events for one user. Ends when the store drops the subscription.
pub type ChangeFeed = mpsc::Receiver<RemoteResult<AnnotationChanged>>;

/// Capacity of change feed channels handed out by in-process stores.
pub const CHANGE_FEED_CAPACITY: usize = 256;

/// A successful login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginGrant {
    pub user: User,
    pub token: String,
}

/// The authoritative annotation store.
///
/// Every call except `login` is authenticated with the token from a
/// `LoginGrant`. Any reported failure fails the whole call.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn login(&self, credentials: &Credentials) -> RemoteResult<LoginGrant>;

    /// The store assigns the server id.
    async fn create_annotation(
        &self,
        token: &str,
        input: NewAnnotationInput,
    ) -> RemoteResult<RemoteAnnotation>;

    async fn edit_annotation(
        &self,
        token: &str,
        server_id: &str,
        input: EditAnnotationInput,
    ) -> RemoteResult<RemoteAnnotation>;

    async fn delete_annotation(&self, token: &str, server_id: &str)
        -> RemoteResult<RemoteAnnotation>;

    async fn connect_user_to_document(&self, token: &str, document_id: &str) -> RemoteResult<()>;

    async fn disconnect_user_from_document(
        &self,
        token: &str,
        document_id: &str,
    ) -> RemoteResult<()>;

    async fn fetch_document_annotations(
        &self,
        token: &str,
        document_id: &str,
    ) -> RemoteResult<Vec<RemoteAnnotation>>;

    async fn subscribe_annotation_changes(
        &self,
        token: &str,
        user_id: &str,
    ) -> RemoteResult<ChangeFeed>;
}
