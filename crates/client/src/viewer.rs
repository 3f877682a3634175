// Host viewer contract: where remote changes and the initial batch land.

use annosync_common::event::{ChangeKind, SyncEvent};
use annosync_common::types::Annotation;
use tokio::sync::mpsc;

/// Callbacks into the document viewer that renders annotations.
///
/// Called from engine tasks; implementations must not block.
pub trait HostViewer: Send + Sync {
    fn remote_annotation_added(&self, annotation: &Annotation);

    fn remote_annotation_modified(&self, annotation: &Annotation);

    fn remote_annotation_removed(&self, annotation: &Annotation);

    /// The opened document's existing annotations, already filtered.
    fn load_initial_annotations(&self, document_id: &str, annotations: Vec<Annotation>);
}

/// What a `ChannelViewer` forwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ViewerUpdate {
    Change(SyncEvent),
    InitialBatch { document_id: String, annotations: Vec<Annotation> },
}

/// Forwards viewer callbacks over an unbounded channel, for embedders that
/// drive the viewer from their own event loop.
#[derive(Debug, Clone)]
pub struct ChannelViewer {
    tx: mpsc::UnboundedSender<ViewerUpdate>,
}

impl ChannelViewer {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ViewerUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, update: ViewerUpdate) {
        // A closed receiver means nobody is rendering anymore.
        let _ = self.tx.send(update);
    }

    fn forward_change(&self, kind: ChangeKind, annotation: &Annotation) {
        self.forward(ViewerUpdate::Change(SyncEvent::remote(kind, annotation.clone())));
    }
}

impl HostViewer for ChannelViewer {
    fn remote_annotation_added(&self, annotation: &Annotation) {
        self.forward_change(ChangeKind::Added, annotation);
    }

    fn remote_annotation_modified(&self, annotation: &Annotation) {
        self.forward_change(ChangeKind::Modified, annotation);
    }

    fn remote_annotation_removed(&self, annotation: &Annotation) {
        self.forward_change(ChangeKind::Removed, annotation);
    }

    fn load_initial_annotations(&self, document_id: &str, annotations: Vec<Annotation>) {
        self.forward(ViewerUpdate::InitialBatch {
            document_id: document_id.to_string(),
            annotations,
        });
    }
}
