// In-process remote store.
//
// Keeps accounts, sessions, document connections and annotations in memory
// and fans change events out to the subscribers of every user connected to
// the affected document, the originator included. Used by tests and by
// embedders that want a local-only session.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use annosync_common::protocol::annotations::{
    AnnotationAction, AnnotationChanged, EditAnnotationInput, NewAnnotationInput, RemoteAnnotation,
};
use annosync_common::protocol::response::{Response, ServiceError};
use annosync_common::types::{Credentials, User, UserKind};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use super::{ChangeFeed, LoginGrant, RemoteResult, RemoteStore, CHANGE_FEED_CAPACITY};
use crate::error::RemoteError;

/// Operations of the remote store, for call accounting and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteOperation {
    Login,
    CreateAnnotation,
    EditAnnotation,
    DeleteAnnotation,
    ConnectUser,
    DisconnectUser,
    FetchAnnotations,
    Subscribe,
}

#[derive(Debug)]
struct Account {
    user: User,
    password: String,
}

type FeedSender = mpsc::Sender<RemoteResult<AnnotationChanged>>;

#[derive(Debug, Default)]
struct LoopbackState {
    accounts: HashMap<String, Account>,
    users: HashMap<String, User>,
    sessions: HashMap<String, String>,
    connections: HashMap<String, HashSet<String>>,
    annotations: HashMap<String, RemoteAnnotation>,
    subscribers: HashMap<String, Vec<FeedSender>>,
    injected: HashMap<RemoteOperation, RemoteError>,
    calls: HashMap<RemoteOperation, usize>,
}

impl LoopbackState {
    /// Forget feeds whose receiver is gone.
    fn prune_closed_feeds(&mut self) {
        self.subscribers.retain(|_, senders| {
            senders.retain(|sender| !sender.is_closed());
            !senders.is_empty()
        });
    }
}

#[derive(Debug, Default)]
pub struct LoopbackStore {
    state: Mutex<LoopbackState>,
}

impl LoopbackStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a password account and return its user.
    pub fn register_user(
        &self,
        email: impl Into<String>,
        password: impl Into<String>,
        user_name: impl Into<String>,
    ) -> User {
        let email = email.into();
        let user = User {
            id: Uuid::new_v4().to_string(),
            user_name: Some(user_name.into()),
            email: Some(email.clone()),
            kind: UserKind::Standard,
        };

        let mut state = self.lock();
        state.users.insert(user.id.clone(), user.clone());
        state.accounts.insert(email, Account { user: user.clone(), password: password.into() });
        user
    }

    /// Seed an annotation as if another client had created it earlier.
    pub fn seed_annotation(&self, input: NewAnnotationInput) -> RemoteAnnotation {
        let stored = RemoteAnnotation::from_input(Uuid::new_v4().to_string(), input);
        self.lock().annotations.insert(stored.id.clone(), stored.clone());
        stored
    }

    /// Fail the next call of `operation` with `error`.
    pub fn fail_next(&self, operation: RemoteOperation, error: RemoteError) {
        self.lock().injected.insert(operation, error);
    }

    /// Deliver an arbitrary change event to every subscriber of `user_id`.
    pub async fn push_to_user(&self, user_id: &str, changed: AnnotationChanged) -> usize {
        let senders = self.lock().subscribers.get(user_id).cloned().unwrap_or_default();
        deliver(&senders, Ok(changed)).await
    }

    /// Deliver a feed error to every subscriber of `user_id`.
    pub async fn push_error_to_user(&self, user_id: &str, error: RemoteError) -> usize {
        let senders = self.lock().subscribers.get(user_id).cloned().unwrap_or_default();
        deliver(&senders, Err(error)).await
    }

    /// Drop every subscription, ending the change feeds.
    pub fn close_feeds(&self) {
        self.lock().subscribers.clear();
    }

    pub fn call_count(&self, operation: RemoteOperation) -> usize {
        self.lock().calls.get(&operation).copied().unwrap_or_default()
    }

    /// Feeds currently registered for `user_id`, closed ones not yet pruned
    /// included.
    pub fn feed_count(&self, user_id: &str) -> usize {
        self.lock().subscribers.get(user_id).map_or(0, Vec::len)
    }

    pub fn annotations_for(&self, document_id: &str) -> Vec<RemoteAnnotation> {
        let mut annotations: Vec<_> = self
            .lock()
            .annotations
            .values()
            .filter(|annotation| annotation.document_id == document_id)
            .cloned()
            .collect();
        annotations.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        annotations
    }

    pub fn is_connected(&self, user_id: &str, document_id: &str) -> bool {
        self.lock().connections.get(document_id).is_some_and(|users| users.contains(user_id))
    }

    fn lock(&self) -> MutexGuard<'_, LoopbackState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record the call and take any injected failure for it.
    fn begin(&self, operation: RemoteOperation) -> RemoteResult<MutexGuard<'_, LoopbackState>> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_default() += 1;
        match state.injected.remove(&operation) {
            Some(error) => Err(error),
            None => Ok(state),
        }
    }

    /// Resolve a token to a user id and check the user is connected to
    /// `document_id`.
    fn authorize_member(
        state: &LoopbackState,
        token: &str,
        document_id: &str,
    ) -> Result<String, ServiceError> {
        let user_id = Self::authorize(state, token)?;
        let connected =
            state.connections.get(document_id).is_some_and(|users| users.contains(&user_id));
        if connected {
            Ok(user_id)
        } else {
            Err(ServiceError::new("membership ignored").with_code("FORBIDDEN"))
        }
    }

    fn authorize(state: &LoopbackState, token: &str) -> Result<String, ServiceError> {
        state
            .sessions
            .get(token)
            .cloned()
            .ok_or_else(|| ServiceError::new("invalid session token").with_code("UNAUTHENTICATED"))
    }

    fn change_recipients(state: &mut LoopbackState, document_id: &str) -> Vec<FeedSender> {
        state.prune_closed_feeds();
        state
            .connections
            .get(document_id)
            .into_iter()
            .flatten()
            .filter_map(|user_id| state.subscribers.get(user_id))
            .flatten()
            .cloned()
            .collect()
    }

    async fn broadcast(
        &self,
        recipients: Vec<FeedSender>,
        annotation: &RemoteAnnotation,
        action: AnnotationAction,
    ) {
        let changed = AnnotationChanged {
            document_id: Some(annotation.document_id.clone()),
            annotation: annotation.clone(),
            action,
        };
        let delivered = deliver(&recipients, Ok(changed)).await;
        debug!(server_id = %annotation.id, ?action, delivered, "loopback change fanned out");
    }
}

async fn deliver(senders: &[FeedSender], item: RemoteResult<AnnotationChanged>) -> usize {
    let mut delivered = 0;
    for sender in senders {
        if sender.send(item.clone()).await.is_ok() {
            delivered += 1;
        }
    }
    delivered
}

fn respond<T>(result: Result<T, ServiceError>) -> Response<T> {
    match result {
        Ok(data) => Response::ok(data),
        Err(error) => Response::failed(vec![error]),
    }
}

fn not_found(server_id: &str) -> ServiceError {
    ServiceError::new(format!("annotation `{server_id}` not found")).with_code("NOT_FOUND")
}

#[async_trait]
impl RemoteStore for LoopbackStore {
    async fn login(&self, credentials: &Credentials) -> RemoteResult<LoginGrant> {
        let mut state = self.begin(RemoteOperation::Login)?;

        let user = match credentials {
            Credentials::Password { email, password } => match state.accounts.get(email) {
                Some(account) if account.password == *password => Ok(account.user.clone()),
                _ => Err(
                    ServiceError::new("invalid email or password").with_code("UNAUTHENTICATED")
                ),
            },
            Credentials::Anonymous { user_name } => {
                let user = User {
                    id: Uuid::new_v4().to_string(),
                    user_name: Some(user_name.clone()),
                    email: None,
                    kind: UserKind::Anonymous,
                };
                state.users.insert(user.id.clone(), user.clone());
                Ok(user)
            }
            Credentials::Token { token } => Self::authorize(&state, token).and_then(|user_id| {
                state
                    .users
                    .get(&user_id)
                    .cloned()
                    .ok_or_else(|| ServiceError::new("unknown user").with_code("UNAUTHENTICATED"))
            }),
        };

        let grant = user.map(|user| {
            let token = Uuid::new_v4().to_string();
            state.sessions.insert(token.clone(), user.id.clone());
            LoginGrant { user, token }
        });
        Ok(respond(grant).into_data()?)
    }

    async fn create_annotation(
        &self,
        token: &str,
        input: NewAnnotationInput,
    ) -> RemoteResult<RemoteAnnotation> {
        let (response, recipients) = {
            let mut state = self.begin(RemoteOperation::CreateAnnotation)?;
            match Self::authorize_member(&state, token, &input.document_id) {
                Ok(_) => {
                    let stored = RemoteAnnotation::from_input(Uuid::new_v4().to_string(), input);
                    state.annotations.insert(stored.id.clone(), stored.clone());
                    let recipients = Self::change_recipients(&mut state, &stored.document_id);
                    (Response::ok(stored), recipients)
                }
                Err(error) => (Response::failed(vec![error]), Vec::new()),
            }
        };

        let created = response.into_data()?;
        self.broadcast(recipients, &created, AnnotationAction::Add).await;
        Ok(created)
    }

    async fn edit_annotation(
        &self,
        token: &str,
        server_id: &str,
        input: EditAnnotationInput,
    ) -> RemoteResult<RemoteAnnotation> {
        let (response, recipients) = {
            let mut state = self.begin(RemoteOperation::EditAnnotation)?;
            let document_id = state.annotations.get(server_id).map(|a| a.document_id.clone());
            let result = document_id
                .ok_or_else(|| not_found(server_id))
                .and_then(|document_id| Self::authorize_member(&state, token, &document_id));

            match result {
                Ok(_) => {
                    let edited = state.annotations.get_mut(server_id).map(|stored| {
                        stored.apply_edit(input);
                        stored.clone()
                    });
                    let recipients = edited
                        .as_ref()
                        .map(|edited| Self::change_recipients(&mut state, &edited.document_id))
                        .unwrap_or_default();
                    (respond(edited.ok_or_else(|| not_found(server_id))), recipients)
                }
                Err(error) => (Response::failed(vec![error]), Vec::new()),
            }
        };

        let edited = response.into_data()?;
        self.broadcast(recipients, &edited, AnnotationAction::Edit).await;
        Ok(edited)
    }

    async fn delete_annotation(
        &self,
        token: &str,
        server_id: &str,
    ) -> RemoteResult<RemoteAnnotation> {
        let (response, recipients) = {
            let mut state = self.begin(RemoteOperation::DeleteAnnotation)?;
            let document_id = state.annotations.get(server_id).map(|a| a.document_id.clone());
            let result = document_id
                .ok_or_else(|| not_found(server_id))
                .and_then(|document_id| Self::authorize_member(&state, token, &document_id));

            match result {
                Ok(_) => {
                    let removed = state.annotations.remove(server_id);
                    let recipients = removed
                        .as_ref()
                        .map(|removed| Self::change_recipients(&mut state, &removed.document_id))
                        .unwrap_or_default();
                    (respond(removed.ok_or_else(|| not_found(server_id))), recipients)
                }
                Err(error) => (Response::failed(vec![error]), Vec::new()),
            }
        };

        let removed = response.into_data()?;
        self.broadcast(recipients, &removed, AnnotationAction::Delete).await;
        Ok(removed)
    }

    async fn connect_user_to_document(&self, token: &str, document_id: &str) -> RemoteResult<()> {
        let mut state = self.begin(RemoteOperation::ConnectUser)?;
        let result = Self::authorize(&state, token).map(|user_id| {
            state.connections.entry(document_id.to_string()).or_default().insert(user_id);
        });
        Ok(respond(result).into_data()?)
    }

    async fn disconnect_user_from_document(
        &self,
        token: &str,
        document_id: &str,
    ) -> RemoteResult<()> {
        let mut state = self.begin(RemoteOperation::DisconnectUser)?;
        let result = Self::authorize(&state, token).map(|user_id| {
            if let Some(users) = state.connections.get_mut(document_id) {
                users.remove(&user_id);
            }
        });
        Ok(respond(result).into_data()?)
    }

    async fn fetch_document_annotations(
        &self,
        token: &str,
        document_id: &str,
    ) -> RemoteResult<Vec<RemoteAnnotation>> {
        {
            let state = self.begin(RemoteOperation::FetchAnnotations)?;
            respond(Self::authorize(&state, token)).into_data()?;
        }
        Ok(self.annotations_for(document_id))
    }

    async fn subscribe_annotation_changes(
        &self,
        token: &str,
        user_id: &str,
    ) -> RemoteResult<ChangeFeed> {
        let mut state = self.begin(RemoteOperation::Subscribe)?;
        let result = Self::authorize(&state, token).and_then(|session_user| {
            if session_user == user_id {
                Ok(())
            } else {
                Err(ServiceError::new("cannot subscribe for another user").with_code("FORBIDDEN"))
            }
        });
        respond(result).into_data()?;

        let (sender, receiver) = mpsc::channel(CHANGE_FEED_CAPACITY);
        state.prune_closed_feeds();
        state.subscribers.entry(user_id.to_string()).or_default().push(sender);
        Ok(receiver)
    }
}
