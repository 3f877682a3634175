// Session context and the client handle embedders hold.
//
// `SyncClient` owns the engine, the current session and the single change
// feed subscription of the logged-in user. Viewer entry points spawn one task
// per change; every failure ends up on the error channel returned by `new`.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};

use annosync_common::event::{ChangeKind, SyncEvent};
use annosync_common::protocol::annotations::RemoteAnnotation;
use annosync_common::types::{Annotation, Credentials, User};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::engine::SyncEngine;
use crate::error::{RemoteError, SyncError};
use crate::remote::{ChangeFeed, RemoteStore};
use crate::store::AnnotationIndex;
use crate::viewer::HostViewer;

// ── Session context ─────────────────────────────────────────────────

/// Who is logged in and which document is open. Passed explicitly to every
/// engine operation.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct SessionContext {
    pub user: Option<User>,
    pub auth_token: Option<String>,
    pub document_id: Option<String>,
}

impl SessionContext {
    pub fn logged_in(user: User, auth_token: impl Into<String>) -> Self {
        Self { user: Some(user), auth_token: Some(auth_token.into()), document_id: None }
    }

    pub fn with_document(mut self, document_id: impl Into<String>) -> Self {
        self.document_id = Some(document_id.into());
        self
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user.as_ref().map(|user| user.id.as_str())
    }

    pub fn is_logged_in(&self) -> bool {
        self.user.is_some() && self.auth_token.is_some()
    }

    /// The current user and auth token.
    pub fn credentials(&self) -> Result<(&User, &str), SyncError> {
        match (&self.user, &self.auth_token) {
            (Some(user), Some(token)) => Ok((user, token.as_str())),
            _ => Err(SyncError::NotLoggedIn),
        }
    }

    pub fn open_document(&self) -> Result<&str, SyncError> {
        self.document_id.as_deref().ok_or(SyncError::NoOpenDocument)
    }
}

// Keeps the auth token out of logs.
impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("user", &self.user)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("document_id", &self.document_id)
            .finish()
    }
}

// ── Error sink ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct ErrorSink {
    tx: mpsc::UnboundedSender<SyncError>,
}

impl ErrorSink {
    fn report(&self, operation: &'static str, error: SyncError) {
        warn!(operation, %error, "sync operation failed");
        // Nobody listening is fine; the error has been logged.
        let _ = self.tx.send(error);
    }
}

// ── Subscription ────────────────────────────────────────────────────

/// The running change feed task of one logged-in user.
pub struct SubscriptionHandle {
    user_id: String,
    shutdown_tx: broadcast::Sender<()>,
    task: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    fn spawn(
        user_id: String,
        feed: ChangeFeed,
        engine: Arc<SyncEngine>,
        session: Arc<RwLock<SessionContext>>,
        errors: ErrorSink,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(run_subscription(feed, engine, session, errors, shutdown_rx));
        info!(user_id = %user_id, "change feed subscription started");
        Self { user_id, shutdown_tx, task: Some(task) }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_finished(&self) -> bool {
        self.task.as_ref().map_or(true, JoinHandle::is_finished)
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Shut down and wait for the task to exit.
    pub async fn stop(mut self) {
        self.shutdown();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!(user_id = %self.user_id, "change feed subscription stopped");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

async fn run_subscription(
    mut feed: ChangeFeed,
    engine: Arc<SyncEngine>,
    session: Arc<RwLock<SessionContext>>,
    errors: ErrorSink,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = shutdown_rx.recv() => break,
            item = feed.recv() => match item {
                Some(Ok(changed)) => {
                    let snapshot = read(&session).clone();
                    if let Err(error) = engine.apply_change(&snapshot, changed) {
                        errors.report("apply_change", error);
                    }
                }
                Some(Err(error)) => errors.report("change_feed", error.into()),
                None => {
                    errors.report(
                        "change_feed",
                        RemoteError::Transport("change feed closed by remote store".into()).into(),
                    );
                    break;
                }
            }
        }
    }
    debug!("change feed loop exited");
}

// ── Client ──────────────────────────────────────────────────────────

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct SyncClient {
    engine: Arc<SyncEngine>,
    remote: Arc<dyn RemoteStore>,
    session: Arc<RwLock<SessionContext>>,
    subscription: Mutex<Option<SubscriptionHandle>>,
    errors: ErrorSink,
}

impl SyncClient {
    /// Build a client. The receiver yields every error the client's tasks
    /// run into.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        index: Box<dyn AnnotationIndex>,
        viewer: Arc<dyn HostViewer>,
    ) -> (Self, mpsc::UnboundedReceiver<SyncError>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Arc::new(SyncEngine::new(index, remote.clone(), viewer));
        let client = Self {
            engine,
            remote,
            session: Arc::new(RwLock::new(SessionContext::default())),
            subscription: Mutex::new(None),
            errors: ErrorSink { tx },
        };
        (client, rx)
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    /// A snapshot of the current session.
    pub fn session(&self) -> SessionContext {
        read(&self.session).clone()
    }

    pub fn is_subscribed(&self) -> bool {
        lock(&self.subscription).as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Log in and start the user's change feed subscription, replacing any
    /// previous one. The old subscription is stopped before the new feed is
    /// opened so no push is applied twice.
    pub async fn login(&self, credentials: &Credentials) -> Result<User, SyncError> {
        let grant = self.remote.login(credentials).await.map_err(SyncError::Auth)?;

        self.stop_subscription().await;
        self.engine.forget_pending_echoes();
        let feed = self.remote.subscribe_annotation_changes(&grant.token, &grant.user.id).await?;
        *write(&self.session) = SessionContext::logged_in(grant.user.clone(), grant.token);

        let handle = SubscriptionHandle::spawn(
            grant.user.id.clone(),
            feed,
            self.engine.clone(),
            self.session.clone(),
            self.errors.clone(),
        );
        *lock(&self.subscription) = Some(handle);

        info!(user_id = %grant.user.id, kind = ?grant.user.kind, "logged in");
        Ok(grant.user)
    }

    /// End the session: disconnect from the open document in the background,
    /// stop the subscription, forget the session and clear the index.
    pub async fn logout(&self) -> Result<usize, SyncError> {
        let (token, document_id) = {
            let session = read(&self.session);
            (session.auth_token.clone(), session.document_id.clone())
        };
        if let (Some(token), Some(document_id)) = (token, document_id) {
            let remote = self.remote.clone();
            let errors = self.errors.clone();
            tokio::spawn(async move {
                if let Err(error) = remote.disconnect_user_from_document(&token, &document_id).await
                {
                    errors.report("disconnect_user_from_document", error.into());
                }
            });
        }

        self.stop_subscription().await;
        *write(&self.session) = SessionContext::default();
        let cleared = self.engine.reset()?;
        info!(cleared, "logged out");
        Ok(cleared)
    }

    /// Open a document: connect to it, fetch its annotations, run the initial
    /// load and deliver the batch to the viewer. The session switches to the
    /// document once connected; if a later step fails the previously open
    /// document is restored.
    pub async fn open_document(&self, document_id: &str) -> Result<usize, SyncError> {
        let token = read(&self.session).credentials()?.1.to_string();
        self.remote.connect_user_to_document(&token, document_id).await?;

        let previous = write(&self.session).document_id.replace(document_id.to_string());
        match self.load_document(&token, document_id).await {
            Ok(()) => {
                info!(document_id, "document opened");
                self.document_loaded()
            }
            Err(error) => {
                debug!(document_id, previous = ?previous, "restoring previously open document");
                write(&self.session).document_id = previous;
                Err(error)
            }
        }
    }

    async fn load_document(&self, token: &str, document_id: &str) -> Result<(), SyncError> {
        let fetched = self.remote.fetch_document_annotations(token, document_id).await?;
        let annotations = fetched.iter().map(RemoteAnnotation::to_annotation).collect();
        self.engine.initial_load(document_id, annotations)?;
        Ok(())
    }

    /// The viewer is ready for the initial batch.
    pub fn document_loaded(&self) -> Result<usize, SyncError> {
        self.engine.document_loaded(&self.session())
    }

    pub fn local_annotation_added(&self, annotation: Annotation) -> JoinHandle<()> {
        self.handle_event(SyncEvent::local(ChangeKind::Added, annotation))
    }

    pub fn local_annotation_modified(&self, annotation: Annotation) -> JoinHandle<()> {
        self.handle_event(SyncEvent::local(ChangeKind::Modified, annotation))
    }

    pub fn local_annotation_removed(&self, annotation: Annotation) -> JoinHandle<()> {
        self.handle_event(SyncEvent::local(ChangeKind::Removed, annotation))
    }

    /// Apply an origin-tagged event on its own task, against the session as
    /// it is now. Abort the handle to cancel it.
    pub fn handle_event(&self, event: SyncEvent) -> JoinHandle<()> {
        let engine = self.engine.clone();
        let session = self.session();
        let errors = self.errors.clone();
        tokio::spawn(async move {
            if let Err(error) = engine.apply(&session, &event).await {
                errors.report(operation_name(&event), error);
            }
        })
    }

    async fn stop_subscription(&self) {
        let previous = lock(&self.subscription).take();
        if let Some(handle) = previous {
            handle.stop().await;
        }
    }
}

fn operation_name(event: &SyncEvent) -> &'static str {
    use annosync_common::event::Origin;

    match (event.origin(), event.kind()) {
        (Origin::Local, ChangeKind::Added) => "local_add",
        (Origin::Local, ChangeKind::Modified) => "local_modify",
        (Origin::Local, ChangeKind::Removed) => "local_remove",
        (Origin::Remote, ChangeKind::Added) => "remote_add",
        (Origin::Remote, ChangeKind::Modified) => "remote_modify",
        (Origin::Remote, ChangeKind::Removed) => "remote_remove",
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use annosync_common::protocol::annotations::{EditAnnotationInput, NewAnnotationInput};
    use chrono::Utc;
    use tokio::sync::mpsc::UnboundedReceiver;

    use super::*;
    use crate::remote::{LoopbackStore, RemoteOperation};
    use crate::store::SqliteAnnotationIndex;
    use crate::viewer::{ChannelViewer, ViewerUpdate};

    struct Harness {
        client: SyncClient,
        store: Arc<LoopbackStore>,
        errors: UnboundedReceiver<SyncError>,
        updates: UnboundedReceiver<ViewerUpdate>,
    }

    fn harness() -> Harness {
        let store = Arc::new(LoopbackStore::new());
        store.register_user("ann@example.com", "secret", "ann");
        let (viewer, updates) = ChannelViewer::new();
        let index = SqliteAnnotationIndex::open_in_memory().expect("index should open");
        let (client, errors) = SyncClient::new(store.clone(), Box::new(index), Arc::new(viewer));
        Harness { client, store, errors, updates }
    }

    fn ann() -> Credentials {
        Credentials::Password { email: "ann@example.com".into(), password: "secret".into() }
    }

    async fn eventually(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition was not met in time");
    }

    fn seed(store: &LoopbackStore, annotation_id: &str, page: u32) -> RemoteAnnotation {
        let now = Utc::now();
        store.seed_annotation(NewAnnotationInput {
            annotation_id: annotation_id.into(),
            document_id: "d1".into(),
            author_id: None,
            page_number: page,
            xfdf: "<ink/>".into(),
            in_reply_to: None,
            created_at: now,
            updated_at: now,
        })
    }

    #[tokio::test]
    async fn login_sets_user_and_starts_subscription() {
        let h = harness();

        let user = h.client.login(&ann()).await.expect("login should succeed");

        let session = h.client.session();
        assert_eq!(session.user_id(), Some(user.id.as_str()));
        assert!(session.auth_token.is_some());
        assert!(h.client.is_subscribed());
        assert_eq!(h.store.call_count(RemoteOperation::Subscribe), 1);
    }

    #[tokio::test]
    async fn failed_login_is_an_auth_error_and_leaves_session_empty() {
        let h = harness();

        let error = h
            .client
            .login(&Credentials::Password { email: "ann@example.com".into(), password: "x".into() })
            .await
            .expect_err("wrong password");

        assert!(matches!(error, SyncError::Auth(RemoteError::Application(_))));
        assert!(!h.client.session().is_logged_in());
        assert!(!h.client.is_subscribed());
    }

    #[tokio::test]
    async fn open_document_requires_login() {
        let h = harness();
        let error = h.client.open_document("d1").await.expect_err("not logged in");
        assert!(matches!(error, SyncError::NotLoggedIn));
        assert_eq!(h.store.call_count(RemoteOperation::ConnectUser), 0);
    }

    #[tokio::test]
    async fn open_document_connects_and_delivers_existing_annotations() {
        let mut h = harness();
        let seeded = seed(&h.store, "a1", 3);
        let user = h.client.login(&ann()).await.expect("login");

        let delivered = h.client.open_document("d1").await.expect("open");

        assert_eq!(delivered, 1);
        assert!(h.store.is_connected(&user.id, "d1"));
        let mapped = h
            .client
            .engine()
            .with_index(|index| index.lookup_server_id("a1", "d1", 3))
            .expect("lookup");
        assert_eq!(mapped, Some(seeded.id));
        match h.updates.try_recv().expect("initial batch") {
            ViewerUpdate::InitialBatch { document_id, annotations } => {
                assert_eq!(document_id, "d1");
                assert_eq!(annotations.len(), 1);
            }
            other => panic!("expected initial batch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn local_add_is_indexed_when_confirmation_arrives() {
        let mut h = harness();
        h.client.login(&ann()).await.expect("login");
        h.client.open_document("d1").await.expect("open");

        h.client
            .local_annotation_added(Annotation::new("a1", "d1", "<x/>").with_page(2))
            .await
            .expect("task should not panic");

        let engine = h.client.engine().clone();
        eventually(|| {
            engine.with_index(|index| index.lookup_page_number("a1", "d1")).ok().flatten()
                == Some(2)
        })
        .await;
        assert!(h.errors.try_recv().is_err());
    }

    #[tokio::test]
    async fn failures_reach_the_error_channel() {
        let mut h = harness();
        h.client.login(&ann()).await.expect("login");
        h.client.open_document("d1").await.expect("open");
        h.store
            .fail_next(RemoteOperation::CreateAnnotation, RemoteError::Transport("offline".into()));

        h.client
            .local_annotation_added(Annotation::new("a1", "d1", "<x/>").with_page(1))
            .await
            .expect("task should not panic");

        let error = h.errors.try_recv().expect("error should be reported");
        assert!(matches!(error, SyncError::Remote(RemoteError::Transport(_))));
    }

    #[tokio::test]
    async fn local_change_without_login_is_reported() {
        let mut h = harness();

        h.client
            .local_annotation_removed(Annotation::new("a1", "d1", "<x/>"))
            .await
            .expect("task should not panic");

        assert!(matches!(h.errors.try_recv(), Ok(SyncError::NotLoggedIn)));
    }

    #[tokio::test]
    async fn foreign_changes_reach_the_viewer_once_after_relogin() {
        let mut h = harness();
        h.client.login(&ann()).await.expect("first login");
        h.client.login(&ann()).await.expect("second login");
        h.client.open_document("d1").await.expect("open");
        h.updates.try_recv().expect("initial batch");

        h.store.register_user("bob@example.com", "secret", "bob");
        let bob = h
            .store
            .login(&Credentials::Password {
                email: "bob@example.com".into(),
                password: "secret".into(),
            })
            .await
            .expect("bob login");
        h.store.connect_user_to_document(&bob.token, "d1").await.expect("bob connect");
        let input = NewAnnotationInput {
            annotation_id: "b1".into(),
            document_id: "d1".into(),
            author_id: Some(bob.user.id.clone()),
            page_number: 4,
            xfdf: "<ink/>".into(),
            in_reply_to: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        h.store.create_annotation(&bob.token, input).await.expect("bob create");

        let mut received = Vec::new();
        eventually(|| {
            while let Ok(update) = h.updates.try_recv() {
                received.push(update);
            }
            !received.is_empty()
        })
        .await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(update) = h.updates.try_recv() {
            received.push(update);
        }

        assert_eq!(received.len(), 1, "only the live subscription may deliver");
        match &received[0] {
            ViewerUpdate::Change(event) => {
                assert_eq!(event.kind(), ChangeKind::Added);
                assert_eq!(event.annotation().page_number, Some(4));
            }
            other => panic!("expected a change, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn failed_open_keeps_the_previous_document() {
        let h = harness();
        h.client.login(&ann()).await.expect("login");
        h.client.open_document("d1").await.expect("open d1");

        h.store.fail_next(RemoteOperation::ConnectUser, RemoteError::Transport("offline".into()));
        let error = h.client.open_document("d2").await.expect_err("connect fails");
        assert!(matches!(error, SyncError::Remote(RemoteError::Transport(_))));
        assert_eq!(h.client.session().document_id.as_deref(), Some("d1"));

        h.store
            .fail_next(RemoteOperation::FetchAnnotations, RemoteError::Transport("offline".into()));
        h.client.open_document("d2").await.expect_err("fetch fails");
        assert_eq!(h.client.session().document_id.as_deref(), Some("d1"));
    }

    #[tokio::test]
    async fn relogin_replaces_the_feed_instead_of_adding_one() {
        let h = harness();
        let user = h.client.login(&ann()).await.expect("first login");
        h.client.login(&ann()).await.expect("second login");

        let store = h.store.clone();
        let user_id = user.id.clone();
        eventually(move || store.feed_count(&user_id) == 1).await;
        assert_eq!(h.store.call_count(RemoteOperation::Subscribe), 2);
    }

    #[tokio::test]
    async fn foreign_edit_reaches_viewer_after_an_echo_was_lost() {
        let mut h = harness();
        let user = h.client.login(&ann()).await.expect("login");
        h.client.open_document("d1").await.expect("open");
        h.updates.try_recv().expect("initial batch");

        h.client
            .local_annotation_added(Annotation::new("a1", "d1", "<x/>").with_page(1))
            .await
            .expect("add task");
        let engine = h.client.engine().clone();
        eventually(|| {
            engine.with_index(|index| index.lookup_page_number("a1", "d1")).ok().flatten()
                == Some(1)
        })
        .await;

        // The feed dies, so the echo of this edit never arrives.
        h.store.close_feeds();
        let client = &h.client;
        eventually(|| !client.is_subscribed()).await;
        h.client
            .local_annotation_modified(Annotation::new("a1", "d1", "<y/>").with_page(3))
            .await
            .expect("modify task");

        h.client.login(&ann()).await.expect("login again");
        assert_eq!(h.client.engine().pending_echoes(), 0);
        h.client.open_document("d1").await.expect("reopen");
        h.updates.try_recv().expect("initial batch after reopen");

        h.store.register_user("bob@example.com", "secret", "bob");
        let bob = h
            .store
            .login(&Credentials::Password {
                email: "bob@example.com".into(),
                password: "secret".into(),
            })
            .await
            .expect("bob login");
        h.store.connect_user_to_document(&bob.token, "d1").await.expect("bob connect");
        let server_id = h
            .client
            .engine()
            .with_index(|index| index.lookup_server_id("a1", "d1", 3))
            .expect("lookup")
            .expect("mapping");
        let edit =
            EditAnnotationInput { xfdf: "<z/>".into(), page_number: 7, updated_at: Utc::now() };
        h.store.edit_annotation(&bob.token, &server_id, edit).await.expect("bob edit");

        let update = tokio::time::timeout(Duration::from_secs(2), h.updates.recv())
            .await
            .expect("viewer update should arrive")
            .expect("viewer channel open");
        match update {
            ViewerUpdate::Change(event) => {
                assert_eq!(event.kind(), ChangeKind::Modified);
                assert_eq!(event.annotation().page_number, Some(7));
            }
            other => panic!("expected a change, got {other:?}"),
        }
        assert!(h.store.is_connected(&user.id, "d1"));
    }

    #[tokio::test]
    async fn logout_disconnects_clears_index_and_cancels_subscription() {
        let h = harness();
        seed(&h.store, "a1", 1);
        let user = h.client.login(&ann()).await.expect("login");
        h.client.open_document("d1").await.expect("open");

        let cleared = h.client.logout().await.expect("logout");

        assert_eq!(cleared, 1);
        assert!(!h.client.session().is_logged_in());
        assert!(!h.client.is_subscribed());
        let store = h.store.clone();
        eventually(|| !store.is_connected(&user.id, "d1")).await;
        assert_eq!(h.store.call_count(RemoteOperation::DisconnectUser), 1);
    }

    #[tokio::test]
    async fn closed_feed_is_reported_and_ends_subscription() {
        let mut h = harness();
        h.client.login(&ann()).await.expect("login");

        h.store.close_feeds();

        let client = &h.client;
        eventually(|| !client.is_subscribed()).await;
        assert!(matches!(h.errors.try_recv(), Ok(SyncError::Remote(RemoteError::Transport(_)))));
    }

    #[test]
    fn session_debug_redacts_token() {
        let session = SessionContext::logged_in(User::new("u1"), "very-secret");
        let rendered = format!("{session:?}");
        assert!(!rendered.contains("very-secret"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn session_gates_report_missing_state() {
        let empty = SessionContext::default();
        assert!(matches!(empty.credentials(), Err(SyncError::NotLoggedIn)));
        assert!(matches!(empty.open_document(), Err(SyncError::NoOpenDocument)));

        let open = SessionContext::logged_in(User::new("u1"), "t").with_document("d1");
        assert_eq!(open.open_document().expect("document"), "d1");
        assert_eq!(open.credentials().expect("credentials").1, "t");
    }
}
