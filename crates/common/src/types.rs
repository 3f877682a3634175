// Core domain types shared across all annosync crates.

use serde::{Deserialize, Serialize};

use crate::xfdf;

/// Whether an account is registered or a throwaway guest.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum UserKind {
    #[default]
    Standard,
    Anonymous,
}

/// A user known to the remote annotation store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub kind: UserKind,
}

impl User {
    pub fn new(id: impl Into<String>) -> Self {
        Self { id: id.into(), user_name: None, email: None, kind: UserKind::Standard }
    }
}

/// The ways a session can be established against the remote store.
#[derive(Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum Credentials {
    Password { email: String, password: String },
    Anonymous { user_name: String },
    Token { token: String },
}

// Keeps passwords and tokens out of logs.
impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Password { email, .. } => {
                f.debug_struct("Password").field("email", email).finish_non_exhaustive()
            }
            Self::Anonymous { user_name } => {
                f.debug_struct("Anonymous").field("user_name", user_name).finish()
            }
            Self::Token { .. } => f.debug_struct("Token").finish_non_exhaustive(),
        }
    }
}

/// A user-authored markup object attached to a page of a document.
///
/// `annotation_id` is assigned by the viewer and stays stable across edits;
/// `server_id` is assigned by the remote store once a create round-trip
/// completes. `xfdf` is opaque to the sync core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Annotation {
    pub annotation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub document_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,
    /// 1-based page number. When absent the page is read from the XFDF.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_number: Option<u32>,
    #[serde(default)]
    pub xfdf: String,
}

impl Annotation {
    pub fn new(
        annotation_id: impl Into<String>,
        document_id: impl Into<String>,
        xfdf: impl Into<String>,
    ) -> Self {
        Self {
            annotation_id: annotation_id.into(),
            server_id: None,
            document_id: document_id.into(),
            author_id: None,
            page_number: None,
            xfdf: xfdf.into(),
        }
    }

    pub fn with_page(mut self, page_number: u32) -> Self {
        self.page_number = Some(page_number);
        self
    }

    pub fn with_server_id(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = Some(server_id.into());
        self
    }

    pub fn with_author(mut self, author_id: impl Into<String>) -> Self {
        self.author_id = Some(author_id.into());
        self
    }

    /// The explicit page number, or the one embedded in the XFDF payload.
    pub fn resolved_page(&self) -> Option<u32> {
        self.page_number.or_else(|| xfdf::page_number(&self.xfdf))
    }

    /// Whether the annotation can be handed to a viewer or the store as a new
    /// annotation.
    pub fn is_valid_for_add(&self) -> bool {
        !self.annotation_id.trim().is_empty() && !self.xfdf.trim().is_empty()
    }

    /// Server id, treating an empty string as unassigned.
    pub fn confirmed_server_id(&self) -> Option<&str> {
        self.server_id.as_deref().filter(|id| !id.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_page_prefers_explicit_field() {
        let annotation =
            Annotation::new("a1", "d1", r#"<square page="0" name="a1"/>"#).with_page(7);
        assert_eq!(annotation.resolved_page(), Some(7));
    }

    #[test]
    fn resolved_page_falls_back_to_xfdf() {
        let annotation = Annotation::new("a1", "d1", r#"<square page="4" name="a1"/>"#);
        assert_eq!(annotation.resolved_page(), Some(5));
    }

    #[test]
    fn resolved_page_is_none_without_any_source() {
        let annotation = Annotation::new("a1", "d1", "<square/>");
        assert_eq!(annotation.resolved_page(), None);
    }

    #[test]
    fn validity_requires_id_and_payload() {
        assert!(Annotation::new("a1", "d1", "<ink/>").is_valid_for_add());
        assert!(!Annotation::new("", "d1", "<ink/>").is_valid_for_add());
        assert!(!Annotation::new("   ", "d1", "<ink/>").is_valid_for_add());
        assert!(!Annotation::new("a1", "d1", "").is_valid_for_add());
    }

    #[test]
    fn empty_server_id_counts_as_unconfirmed() {
        let annotation = Annotation::new("a1", "d1", "<ink/>").with_server_id("");
        assert_eq!(annotation.confirmed_server_id(), None);
        let annotation = annotation.with_server_id("s1");
        assert_eq!(annotation.confirmed_server_id(), Some("s1"));
    }

    #[test]
    fn annotation_json_omits_unset_optionals() {
        let annotation = Annotation::new("a1", "d1", "<ink/>");
        let json = serde_json::to_value(&annotation).expect("annotation should serialize");
        assert_eq!(
            json,
            serde_json::json!({ "annotation_id": "a1", "document_id": "d1", "xfdf": "<ink/>" })
        );
    }

    #[test]
    fn credentials_debug_hides_secrets() {
        let creds =
            Credentials::Password { email: "a@example.com".into(), password: "hunter2".into() };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("a@example.com"));
        assert!(!rendered.contains("hunter2"));

        let token = Credentials::Token { token: "tok-secret".into() };
        assert!(!format!("{token:?}").contains("tok-secret"));
    }

    #[test]
    fn user_kind_defaults_to_standard_when_missing() {
        let user: User = serde_json::from_str(r#"{"id":"u1"}"#).expect("user should parse");
        assert_eq!(user.kind, UserKind::Standard);
        assert_eq!(user, User::new("u1"));
    }
}
