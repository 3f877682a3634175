// Origin-tagged annotation change events.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::Annotation;

/// Which side produced a change. Local changes go to the remote store only;
/// remote changes go to the index and the viewer only.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Remote,
}

impl fmt::Display for Origin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Remote => f.write_str("remote"),
        }
    }
}

/// The kind of change without its payload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Added => f.write_str("added"),
            Self::Modified => f.write_str("modified"),
            Self::Removed => f.write_str("removed"),
        }
    }
}

/// A single annotation change flowing through the sync engine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncEvent {
    Added { origin: Origin, annotation: Annotation },
    Modified { origin: Origin, annotation: Annotation },
    Removed { origin: Origin, annotation: Annotation },
}

impl SyncEvent {
    pub fn new(kind: ChangeKind, origin: Origin, annotation: Annotation) -> Self {
        match kind {
            ChangeKind::Added => Self::Added { origin, annotation },
            ChangeKind::Modified => Self::Modified { origin, annotation },
            ChangeKind::Removed => Self::Removed { origin, annotation },
        }
    }

    pub fn local(kind: ChangeKind, annotation: Annotation) -> Self {
        Self::new(kind, Origin::Local, annotation)
    }

    pub fn remote(kind: ChangeKind, annotation: Annotation) -> Self {
        Self::new(kind, Origin::Remote, annotation)
    }

    pub fn kind(&self) -> ChangeKind {
        match self {
            Self::Added { .. } => ChangeKind::Added,
            Self::Modified { .. } => ChangeKind::Modified,
            Self::Removed { .. } => ChangeKind::Removed,
        }
    }

    pub fn origin(&self) -> Origin {
        match self {
            Self::Added { origin, .. }
            | Self::Modified { origin, .. }
            | Self::Removed { origin, .. } => *origin,
        }
    }

    pub fn annotation(&self) -> &Annotation {
        match self {
            Self::Added { annotation, .. }
            | Self::Modified { annotation, .. }
            | Self::Removed { annotation, .. } => annotation,
        }
    }

    pub fn into_annotation(self) -> Annotation {
        match self {
            Self::Added { annotation, .. }
            | Self::Modified { annotation, .. }
            | Self::Removed { annotation, .. } => annotation,
        }
    }
}
