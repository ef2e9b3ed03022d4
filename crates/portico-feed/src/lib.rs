//! Feed files and their delivery.
//!
//! The appliance discovers documents by being POSTed XML "feeds": a
//! metadata-and-url feed lists document URLs with per-document
//! attributes and ACLs, a group-definitions feed carries group
//! memberships. This crate builds both dialects, re-parses them (the
//! round-trip is how the emission is tested), and submits them as the
//! appliance's peculiar `boundary=<<` multipart POST.
use thiserror::Error;

mod archive;
mod builder;
mod metadata;
mod parser;
mod record;
mod submit;

pub use archive::FeedArchive;
pub use builder::{FeedBuilder, FeedWorkarounds, FEEDS_DTD_PUBLIC_ID};
pub use metadata::Metadata;
pub use parser::{FeedParser, ParsedFeed, ParsedGroupFeed};
pub use record::{AclItem, FeedItem, Record, RecordAction, RecordBuilder};
pub use submit::{validate_datasource, FeedClient, FeedSubmitter, GroupFeedType, SubmitError};

#[derive(Error, Debug)]
pub enum FeedError {
    #[error(transparent)]
    Codec(#[from] portico_docid::CodecError),
    #[error("error writing feed XML: {0}")]
    Write(#[from] std::io::Error),
    #[error("malformed feed XML: {0}")]
    Xml(#[from] quick_xml::Error),
    #[error("malformed attribute in feed XML: {0}")]
    Attr(#[from] quick_xml::events::attributes::AttrError),
    #[error("feed principal {0:?} is empty or surrounded by whitespace")]
    IllFormedPrincipal(String),
    #[error("group definition key {0:?} is not a group")]
    NotAGroup(String),
    #[error("unexpected feed structure: {0}")]
    Structure(String),
}
