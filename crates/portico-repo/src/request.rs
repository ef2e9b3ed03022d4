use chrono::{DateTime, Utc};
use portico_docid::DocId;

/// The request side of one document pull.
#[derive(Debug, Clone)]
pub struct DocRequest {
    doc_id: DocId,
    head_only: bool,
    if_modified_since: Option<DateTime<Utc>>,
    supports_no_content: bool,
}

impl DocRequest {
    pub fn new(
        doc_id: DocId,
        head_only: bool,
        if_modified_since: Option<DateTime<Utc>>,
        supports_no_content: bool,
    ) -> Self {
        Self {
            doc_id,
            head_only,
            if_modified_since,
            supports_no_content,
        }
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// True for HEAD requests: the repository may skip producing the
    /// body, though writing one is harmless (it is discarded).
    pub fn is_head(&self) -> bool {
        self.head_only
    }

    /// When the caller last saw this document, from
    /// `If-Modified-Since`.
    pub fn last_access_time(&self) -> Option<DateTime<Utc>> {
        self.if_modified_since
    }

    /// Whether the document changed after the caller's copy. HTTP
    /// dates have second precision, so the comparison truncates.
    pub fn has_changed_since_last_access(&self, last_modified: DateTime<Utc>) -> bool {
        match self.if_modified_since {
            None => true,
            Some(last_access) => last_modified.timestamp() > last_access.timestamp(),
        }
    }

    /// Whether an unchanged document may be answered with 204 instead
    /// of 304. Only callers that advertise support get 204s.
    pub fn can_respond_with_no_content(&self, last_modified: DateTime<Utc>) -> bool {
        self.supports_no_content && !self.has_changed_since_last_access(last_modified)
    }
}
