// Sync engine: sends viewer edits to the remote store and applies the
// store's change feed to the local index and the viewer.
//
// Local-origin changes go to the store only. Remote-origin changes go to the
// index and the viewer only. A remote change this engine itself caused (an
// echo) still updates the index but is not shown to the viewer again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use annosync_common::event::{ChangeKind, Origin, SyncEvent};
use annosync_common::protocol::annotations::{
    AnnotationChanged, EditAnnotationInput, NewAnnotationInput, RemoteAnnotation,
};
use annosync_common::types::Annotation;
use chrono::{DateTime, Utc};
use tracing::{debug, info};

use crate::error::{RemoteError, SyncError};
use crate::remote::RemoteStore;
use crate::session::SessionContext;
use crate::store::{AnnotationIndex, LocalAnnotationRecord};
use crate::viewer::HostViewer;

/// What happens after a remote call fails. Only `Never` exists: a failed
/// change is reported and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryPolicy {
    #[default]
    Never,
}

// ── Echo filter ─────────────────────────────────────────────────────

/// What identifies the store's push of a change this engine requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum EchoKey {
    /// A create or edit, by the `updated_at` stamp sent with the request.
    Written {
        kind: ChangeKind,
        document_id: String,
        annotation_id: String,
        updated_at: DateTime<Utc>,
    },
    /// A delete. A server id is deleted at most once.
    Deleted { server_id: String },
}

impl EchoKey {
    fn written(
        kind: ChangeKind,
        document_id: &str,
        annotation_id: &str,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self::Written {
            kind,
            document_id: document_id.to_string(),
            annotation_id: annotation_id.to_string(),
            updated_at,
        }
    }

    fn deleted(server_id: &str) -> Self {
        Self::Deleted { server_id: server_id.to_string() }
    }

    /// The key an incoming push would match.
    fn of_push(kind: ChangeKind, document_id: &str, pushed: &RemoteAnnotation) -> Self {
        match kind {
            ChangeKind::Removed => Self::deleted(&pushed.id),
            ChangeKind::Added | ChangeKind::Modified => {
                Self::written(kind, document_id, &pushed.annotation_id, pushed.updated_at)
            }
        }
    }
}

/// Outstanding expectations of pushes caused by this engine's own requests.
#[derive(Debug, Default)]
struct EchoFilter {
    expected: HashSet<EchoKey>,
}

impl EchoFilter {
    /// Consume the expectation matching `key`. Returns whether the push was
    /// an echo.
    fn consume(&mut self, key: &EchoKey) -> bool {
        self.expected.remove(key)
    }

    fn len(&self) -> usize {
        self.expected.len()
    }

    fn clear(&mut self) -> usize {
        let cleared = self.expected.len();
        self.expected.clear();
        cleared
    }
}

/// The echo expectation of one in-flight request. Dropping it before `keep`
/// withdraws the expectation, so a failed or cancelled request never hides a
/// later push.
struct PendingEcho<'a> {
    echoes: &'a Mutex<EchoFilter>,
    key: Option<EchoKey>,
}

impl<'a> PendingEcho<'a> {
    fn register(echoes: &'a Mutex<EchoFilter>, key: EchoKey) -> Self {
        lock(echoes).expected.insert(key.clone());
        Self { echoes, key: Some(key) }
    }

    /// The request went through; leave the expectation for its push.
    fn keep(mut self) {
        self.key = None;
    }
}

impl Drop for PendingEcho<'_> {
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            lock(self.echoes).consume(&key);
        }
    }
}

// ── Engine ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
struct InitialBatch {
    document_id: String,
    annotations: Vec<Annotation>,
}

pub struct SyncEngine {
    index: Mutex<Box<dyn AnnotationIndex>>,
    remote: Arc<dyn RemoteStore>,
    viewer: Arc<dyn HostViewer>,
    pending_batch: Mutex<Option<InitialBatch>>,
    echoes: Mutex<EchoFilter>,
    retry: RetryPolicy,
}

fn lock<T: ?Sized>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SyncEngine {
    pub fn new(
        index: Box<dyn AnnotationIndex>,
        remote: Arc<dyn RemoteStore>,
        viewer: Arc<dyn HostViewer>,
    ) -> Self {
        Self {
            index: Mutex::new(index),
            remote,
            viewer,
            pending_batch: Mutex::new(None),
            echoes: Mutex::new(EchoFilter::default()),
            retry: RetryPolicy::Never,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Read-only access to the index.
    pub fn with_index<T>(&self, read: impl FnOnce(&dyn AnnotationIndex) -> T) -> T {
        let index = lock(&self.index);
        read(&**index)
    }

    /// Number of pushes still expected as echoes of this engine's requests.
    pub fn pending_echoes(&self) -> usize {
        lock(&self.echoes).len()
    }

    /// Drop every echo expectation. Pushes that were never delivered (a
    /// closed feed, a replaced subscription) leave expectations behind.
    pub fn forget_pending_echoes(&self) -> usize {
        let forgotten = lock(&self.echoes).clear();
        if forgotten > 0 {
            debug!(forgotten, "forgot pending echo expectations");
        }
        forgotten
    }

    /// Route an origin-tagged event to the matching operation.
    pub async fn apply(
        &self,
        session: &SessionContext,
        event: &SyncEvent,
    ) -> Result<(), SyncError> {
        let annotation = event.annotation();
        match (event.origin(), event.kind()) {
            (Origin::Local, ChangeKind::Added) => {
                self.local_add(session, annotation).await.map(drop)
            }
            (Origin::Local, ChangeKind::Modified) => {
                self.local_modify(session, annotation).await.map(drop)
            }
            (Origin::Local, ChangeKind::Removed) => {
                self.local_remove(session, annotation).await.map(drop)
            }
            (Origin::Remote, ChangeKind::Added) => self.remote_added(session, annotation),
            (Origin::Remote, ChangeKind::Modified) => self.remote_modified(session, annotation),
            (Origin::Remote, ChangeKind::Removed) => self.remote_removed(session, annotation),
        }
    }

    // ── Local changes ───────────────────────────────────────────────

    /// Send a viewer-created annotation to the store.
    ///
    /// The index is not written here; the record is created when the store's
    /// add push for this annotation arrives.
    pub async fn local_add(
        &self,
        session: &SessionContext,
        annotation: &Annotation,
    ) -> Result<RemoteAnnotation, SyncError> {
        let (user, token) = session.credentials()?;
        let document_id = target_document(session, annotation)?;
        if !annotation.is_valid_for_add() {
            return Err(SyncError::invalid(&annotation.annotation_id, "missing id or payload"));
        }
        let page_number = annotation
            .resolved_page()
            .ok_or_else(|| SyncError::invalid(&annotation.annotation_id, "no page number"))?;

        let now = Utc::now();
        let input = NewAnnotationInput {
            annotation_id: annotation.annotation_id.clone(),
            document_id: document_id.clone(),
            author_id: Some(user.id.clone()),
            page_number,
            xfdf: annotation.xfdf.clone(),
            in_reply_to: None,
            created_at: now,
            updated_at: now,
        };

        let echo = PendingEcho::register(
            &self.echoes,
            EchoKey::written(ChangeKind::Added, &document_id, &annotation.annotation_id, now),
        );
        let created = self
            .remote
            .create_annotation(token, input)
            .await
            .map_err(|error| self.give_up("create_annotation", error))?;
        echo.keep();

        debug!(
            annotation_id = %annotation.annotation_id,
            server_id = %created.id,
            page_number,
            "annotation created remotely"
        );
        Ok(created)
    }

    /// Send an edit of an indexed annotation. Returns `None` when the
    /// annotation has no server mapping yet; the change is dropped.
    pub async fn local_modify(
        &self,
        session: &SessionContext,
        annotation: &Annotation,
    ) -> Result<Option<RemoteAnnotation>, SyncError> {
        let (_, token) = session.credentials()?;
        let document_id = target_document(session, annotation)?;

        let Some((stored_page, server_id)) =
            self.mapping(&annotation.annotation_id, &document_id)?
        else {
            debug!(
                annotation_id = %annotation.annotation_id,
                document_id = %document_id,
                "dropping local modify without server mapping"
            );
            return Ok(None);
        };

        let page_number = annotation.resolved_page().unwrap_or(stored_page);
        let updated_at = Utc::now();
        let input = EditAnnotationInput { xfdf: annotation.xfdf.clone(), page_number, updated_at };

        let echo = PendingEcho::register(
            &self.echoes,
            EchoKey::written(
                ChangeKind::Modified,
                &document_id,
                &annotation.annotation_id,
                updated_at,
            ),
        );
        let edited = self
            .remote
            .edit_annotation(token, &server_id, input)
            .await
            .map_err(|error| self.give_up("edit_annotation", error))?;
        echo.keep();

        lock(&self.index).update_page_number(
            &annotation.annotation_id,
            &server_id,
            &document_id,
            page_number,
        )?;
        debug!(
            annotation_id = %annotation.annotation_id,
            server_id = %server_id,
            page_number,
            "annotation edited remotely"
        );
        Ok(Some(edited))
    }

    /// Delete an indexed annotation from the store. Returns `None` when the
    /// annotation has no server mapping; nothing is sent.
    pub async fn local_remove(
        &self,
        session: &SessionContext,
        annotation: &Annotation,
    ) -> Result<Option<RemoteAnnotation>, SyncError> {
        let (_, token) = session.credentials()?;
        let document_id = target_document(session, annotation)?;

        let Some((stored_page, server_id)) =
            self.mapping(&annotation.annotation_id, &document_id)?
        else {
            debug!(
                annotation_id = %annotation.annotation_id,
                document_id = %document_id,
                "dropping local remove without server mapping"
            );
            return Ok(None);
        };

        let echo = PendingEcho::register(&self.echoes, EchoKey::deleted(&server_id));
        let removed = self
            .remote
            .delete_annotation(token, &server_id)
            .await
            .map_err(|error| self.give_up("delete_annotation", error))?;
        echo.keep();

        lock(&self.index).remove(&annotation.annotation_id, &document_id, stored_page)?;
        debug!(
            annotation_id = %annotation.annotation_id,
            server_id = %server_id,
            "annotation deleted remotely"
        );
        Ok(Some(removed))
    }

    // ── Remote changes ──────────────────────────────────────────────

    /// Apply one push from the change feed. Pushes of this engine's own
    /// requests update the index but are not shown to the viewer again.
    pub fn apply_change(
        &self,
        session: &SessionContext,
        changed: AnnotationChanged,
    ) -> Result<(), SyncError> {
        let Some(kind) = changed.action.change_kind() else {
            debug!(
                action = ?changed.action,
                server_id = %changed.annotation.id,
                "ignoring non-annotation change"
            );
            return Ok(());
        };

        let document_id = changed
            .document_id
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| changed.annotation.document_id.clone());
        let echo = lock(&self.echoes)
            .consume(&EchoKey::of_push(kind, &document_id, &changed.annotation));

        let mut annotation = changed.annotation.to_annotation();
        annotation.document_id = document_id;

        match kind {
            ChangeKind::Added => self.index_added(&annotation)?,
            ChangeKind::Modified => self.index_modified(&annotation)?,
            ChangeKind::Removed => self.index_removed(&annotation)?,
        }

        if echo {
            debug!(
                annotation_id = %annotation.annotation_id,
                %kind,
                "suppressing echo of local change"
            );
        } else {
            self.notify_viewer(session, kind, &annotation);
        }
        Ok(())
    }

    /// A server-confirmed annotation. This is where index records are made.
    pub fn remote_added(
        &self,
        session: &SessionContext,
        annotation: &Annotation,
    ) -> Result<(), SyncError> {
        self.index_added(annotation)?;
        self.notify_viewer(session, ChangeKind::Added, annotation);
        Ok(())
    }

    /// A remote edit. Unknown annotations are merged into the index.
    pub fn remote_modified(
        &self,
        session: &SessionContext,
        annotation: &Annotation,
    ) -> Result<(), SyncError> {
        self.index_modified(annotation)?;
        self.notify_viewer(session, ChangeKind::Modified, annotation);
        Ok(())
    }

    /// A remote delete. The stored page wins over the pushed one.
    pub fn remote_removed(
        &self,
        session: &SessionContext,
        annotation: &Annotation,
    ) -> Result<(), SyncError> {
        self.index_removed(annotation)?;
        self.notify_viewer(session, ChangeKind::Removed, annotation);
        Ok(())
    }

    fn index_added(&self, annotation: &Annotation) -> Result<(), SyncError> {
        let record = confirmed_record(annotation)?;
        let outcome = lock(&self.index).put(&record)?;
        debug!(
            annotation_id = %record.annotation_id,
            document_id = %record.document_id,
            ?outcome,
            "indexed remote add"
        );
        Ok(())
    }

    fn index_modified(&self, annotation: &Annotation) -> Result<(), SyncError> {
        let record = confirmed_record(annotation)?;
        let mut index = lock(&self.index);
        match index.lookup_page_number(&record.annotation_id, &record.document_id)? {
            None => {
                index.put(&record)?;
            }
            Some(_) => {
                let server_id = record.server_id.as_deref().unwrap_or_default();
                index.update_page_number(
                    &record.annotation_id,
                    server_id,
                    &record.document_id,
                    record.page_number,
                )?;
            }
        }
        Ok(())
    }

    fn index_removed(&self, annotation: &Annotation) -> Result<(), SyncError> {
        let mut index = lock(&self.index);
        let page_number = index
            .lookup_page_number(&annotation.annotation_id, &annotation.document_id)?
            .or_else(|| annotation.resolved_page());
        if let Some(page_number) = page_number {
            index.remove(&annotation.annotation_id, &annotation.document_id, page_number)?;
        }
        Ok(())
    }

    // ── Initial load ────────────────────────────────────────────────

    /// Index and stash the opened document's existing annotations. Invalid
    /// entries are dropped. Returns the number kept.
    pub fn initial_load(
        &self,
        document_id: &str,
        annotations: Vec<Annotation>,
    ) -> Result<usize, SyncError> {
        let (valid, invalid): (Vec<_>, Vec<_>) =
            annotations.into_iter().partition(Annotation::is_valid_for_add);
        if !invalid.is_empty() {
            debug!(
                document_id,
                dropped = invalid.len(),
                "dropping invalid annotations from initial load"
            );
        }

        {
            let mut index = lock(&self.index);
            for annotation in &valid {
                if let (Some(server_id), Some(page_number)) =
                    (annotation.confirmed_server_id(), annotation.resolved_page())
                {
                    index.put(&LocalAnnotationRecord::new(
                        annotation.annotation_id.as_str(),
                        Some(server_id.to_string()),
                        document_id,
                        page_number,
                    ))?;
                }
            }
        }

        let kept = valid.len();
        *lock(&self.pending_batch) =
            Some(InitialBatch { document_id: document_id.to_string(), annotations: valid });
        info!(document_id, annotations = kept, "initial load prepared");
        Ok(kept)
    }

    /// The viewer is ready: hand it the stashed batch for the open document.
    /// Returns the number of annotations delivered.
    pub fn document_loaded(&self, session: &SessionContext) -> Result<usize, SyncError> {
        let document_id = session.open_document()?;
        let batch = lock(&self.pending_batch).take();

        match batch {
            Some(batch) if batch.document_id == document_id => {
                let delivered = batch.annotations.len();
                self.viewer.load_initial_annotations(document_id, batch.annotations);
                Ok(delivered)
            }
            Some(batch) => {
                debug!(
                    stale_document_id = %batch.document_id,
                    document_id,
                    "discarding initial batch for a document that is no longer open"
                );
                Ok(0)
            }
            None => {
                debug!(document_id, "no initial batch pending");
                Ok(0)
            }
        }
    }

    /// Forget everything tied to the ended session, index included.
    pub fn reset(&self) -> Result<usize, SyncError> {
        self.forget_pending_echoes();
        lock(&self.pending_batch).take();
        Ok(lock(&self.index).clear()?)
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Stored page and server id for an annotation, if both are known.
    fn mapping(
        &self,
        annotation_id: &str,
        document_id: &str,
    ) -> Result<Option<(u32, String)>, SyncError> {
        let index = lock(&self.index);
        let Some(page_number) = index.lookup_page_number(annotation_id, document_id)? else {
            return Ok(None);
        };
        let server_id = index.lookup_server_id(annotation_id, document_id, page_number)?;
        Ok(server_id.map(|server_id| (page_number, server_id)))
    }

    fn notify_viewer(&self, session: &SessionContext, kind: ChangeKind, annotation: &Annotation) {
        if session.document_id.as_deref() != Some(annotation.document_id.as_str()) {
            debug!(
                annotation_id = %annotation.annotation_id,
                document_id = %annotation.document_id,
                %kind,
                "change is for a document that is not open"
            );
            return;
        }

        match kind {
            ChangeKind::Added => self.viewer.remote_annotation_added(annotation),
            ChangeKind::Modified => self.viewer.remote_annotation_modified(annotation),
            ChangeKind::Removed => self.viewer.remote_annotation_removed(annotation),
        }
    }

    fn give_up(&self, operation: &'static str, error: RemoteError) -> SyncError {
        match self.retry {
            RetryPolicy::Never => {
                debug!(operation, %error, "remote call failed, not retrying");
                SyncError::Remote(error)
            }
        }
    }
}

/// The document a local change applies to: the annotation's own, or the open
/// one when the viewer left it blank. A document must be open either way.
fn target_document(session: &SessionContext, annotation: &Annotation) -> Result<String, SyncError> {
    let open_document = session.open_document()?;
    if annotation.document_id.is_empty() {
        Ok(open_document.to_string())
    } else {
        Ok(annotation.document_id.clone())
    }
}

fn confirmed_record(annotation: &Annotation) -> Result<LocalAnnotationRecord, SyncError> {
    let server_id = annotation
        .confirmed_server_id()
        .ok_or_else(|| SyncError::invalid(&annotation.annotation_id, "no server id"))?;
    let page_number = annotation
        .resolved_page()
        .ok_or_else(|| SyncError::invalid(&annotation.annotation_id, "no page number"))?;

    Ok(LocalAnnotationRecord::new(
        annotation.annotation_id.as_str(),
        Some(server_id.to_string()),
        annotation.document_id.as_str(),
        page_number,
    ))
}
