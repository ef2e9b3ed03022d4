use crate::Metadata;
use chrono::{DateTime, Utc};
use portico_acl::Acl;
use portico_docid::DocId;
use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordAction {
    Add,
    Delete,
}

/// One entry of a metadata-and-url feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    doc_id: DocId,
    action: RecordAction,
    last_modified: Option<DateTime<Utc>>,
    display_url: Option<Url>,
    crawl_immediately: bool,
    crawl_once: bool,
    lock: bool,
    metadata: Option<Metadata>,
}

impl Record {
    pub fn builder<D: Into<DocId>>(doc_id: D) -> RecordBuilder {
        RecordBuilder::new(doc_id)
    }

    /// Shorthand for the common case of announcing one crawlable id.
    pub fn add<D: Into<DocId>>(doc_id: D) -> Record {
        RecordBuilder::new(doc_id).build()
    }

    /// Shorthand for announcing a deletion.
    pub fn delete<D: Into<DocId>>(doc_id: D) -> Record {
        RecordBuilder::new(doc_id)
            .action(RecordAction::Delete)
            .build()
    }

    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    pub fn action(&self) -> RecordAction {
        self.action
    }

    pub fn last_modified(&self) -> Option<&DateTime<Utc>> {
        self.last_modified.as_ref()
    }

    pub fn display_url(&self) -> Option<&Url> {
        self.display_url.as_ref()
    }

    pub fn crawl_immediately(&self) -> bool {
        self.crawl_immediately
    }

    pub fn crawl_once(&self) -> bool {
        self.crawl_once
    }

    pub fn lock(&self) -> bool {
        self.lock
    }

    pub fn metadata(&self) -> Option<&Metadata> {
        self.metadata.as_ref()
    }
}

#[derive(Debug, Clone)]
pub struct RecordBuilder {
    record: Record,
}

impl RecordBuilder {
    pub fn new<D: Into<DocId>>(doc_id: D) -> Self {
        Self {
            record: Record {
                doc_id: doc_id.into(),
                action: RecordAction::Add,
                last_modified: None,
                display_url: None,
                crawl_immediately: false,
                crawl_once: false,
                lock: false,
                metadata: None,
            },
        }
    }

    pub fn action(mut self, action: RecordAction) -> Self {
        self.record.action = action;
        self
    }

    pub fn last_modified(mut self, when: DateTime<Utc>) -> Self {
        self.record.last_modified = Some(when);
        self
    }

    pub fn display_url(mut self, url: Url) -> Self {
        self.record.display_url = Some(url);
        self
    }

    pub fn crawl_immediately(mut self, yes: bool) -> Self {
        self.record.crawl_immediately = yes;
        self
    }

    pub fn crawl_once(mut self, yes: bool) -> Self {
        self.record.crawl_once = yes;
        self
    }

    pub fn lock(mut self, yes: bool) -> Self {
        self.record.lock = yes;
        self
    }

    pub fn metadata(mut self, metadata: Metadata) -> Self {
        self.record.metadata = if metadata.is_empty() {
            None
        } else {
            Some(metadata)
        };
        self
    }

    pub fn build(self) -> Record {
        self.record
    }
}

/// A named-resource entry: an ACL published under a document id (plus
/// an optional fragment distinguishing several ACLs on one document).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclItem {
    pub doc_id: DocId,
    pub fragment: Option<String>,
    pub acl: Acl,
}

impl AclItem {
    pub fn new(doc_id: DocId, acl: Acl) -> Self {
        Self {
            doc_id,
            fragment: None,
            acl,
        }
    }

    pub fn with_fragment(doc_id: DocId, fragment: &str, acl: Acl) -> Self {
        Self {
            doc_id,
            fragment: Some(fragment.to_string()),
            acl,
        }
    }
}

/// Anything that can appear in a metadata-and-url feed's `<group>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeedItem {
    Record(Record),
    Acl(AclItem),
}

impl From<Record> for FeedItem {
    fn from(record: Record) -> Self {
        Self::Record(record)
    }
}

impl From<AclItem> for FeedItem {
    fn from(item: AclItem) -> Self {
        Self::Acl(item)
    }
}
