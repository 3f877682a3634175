// Annotation operations and the change feed payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::ChangeKind;
use crate::types::Annotation;

/// Create request. The store assigns the server id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct NewAnnotationInput {
    pub annotation_id: String,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    pub page_number: u32,
    pub xfdf: String,
    /// Reply threading; always unset for viewer-originated annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Edit request, addressed by server id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EditAnnotationInput {
    pub xfdf: String,
    pub page_number: u32,
    pub updated_at: DateTime<Utc>,
}

/// An annotation as stored by the remote store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteAnnotation {
    pub id: String,
    pub annotation_id: String,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    pub page_number: u32,
    pub xfdf: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RemoteAnnotation {
    pub fn from_input(id: impl Into<String>, input: NewAnnotationInput) -> Self {
        Self {
            id: id.into(),
            annotation_id: input.annotation_id,
            document_id: input.document_id,
            author_id: input.author_id,
            page_number: input.page_number,
            xfdf: input.xfdf,
            in_reply_to: input.in_reply_to,
            created_at: input.created_at,
            updated_at: input.updated_at,
        }
    }

    pub fn apply_edit(&mut self, edit: EditAnnotationInput) {
        self.xfdf = edit.xfdf;
        self.page_number = edit.page_number;
        self.updated_at = edit.updated_at;
    }

    /// The shared representation, carrying the server id and explicit page.
    pub fn to_annotation(&self) -> Annotation {
        Annotation {
            annotation_id: self.annotation_id.clone(),
            server_id: Some(self.id.clone()),
            document_id: self.document_id.clone(),
            author_id: self.author_id.clone(),
            page_number: Some(self.page_number),
            xfdf: self.xfdf.clone(),
        }
    }
}

/// Action carried by a change feed event.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationAction {
    Add,
    Edit,
    Delete,
    Invite,
    MarkAsRead,
}

impl AnnotationAction {
    /// The annotation change this action represents. Membership and read
    /// receipts are not annotation changes.
    pub fn change_kind(self) -> Option<ChangeKind> {
        match self {
            Self::Add => Some(ChangeKind::Added),
            Self::Edit => Some(ChangeKind::Modified),
            Self::Delete => Some(ChangeKind::Removed),
            Self::Invite | Self::MarkAsRead => None,
        }
    }
}

/// Server push: one annotation changed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AnnotationChanged {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_id: Option<String>,
    pub annotation: RemoteAnnotation,
    pub action: AnnotationAction,
}

impl AnnotationChanged {
    pub fn from_json(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }
}
