//! Document identifiers and the codec that maps them to and from
//! the URLs that the search appliance crawls.
use serde::{Deserialize, Serialize};

mod codec;

pub use codec::{CodecError, DocIdCodec};

/// An opaque identifier for a document, chosen by the repository.
/// Identifiers compare as raw byte sequences; they may contain `/`,
/// `.`, `!` or anything else. [`DocIdCodec`] is responsible for
/// carrying them safely inside a URL.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocId(String);

impl DocId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        Self(id.into())
    }

    pub fn unique_id(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "{}", self.0)
    }
}

impl std::fmt::Debug for DocId {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(fmt, "DocId({:?})", self.0)
    }
}

impl From<&str> for DocId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for DocId {
    fn from(id: String) -> Self {
        Self(id)
    }
}
