use crate::{AclItem, FeedError, FeedItem, Metadata, Record, RecordAction, RecordBuilder};
use chrono::{DateTime, Utc};
use portico_acl::{Acl, AclBuilder, InheritanceType, Principal};
use portico_docid::{DocId, DocIdCodec};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use std::sync::Arc;
use url::Url;

/// The feed read back out of a metadata-and-url document.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedFeed {
    pub datasource: String,
    pub feed_type: String,
    pub items: Vec<FeedItem>,
}

/// The group memberships read back out of an xmlgroups document.
#[derive(Debug, PartialEq, Eq)]
pub struct ParsedGroupFeed {
    pub memberships: Vec<(Principal, Vec<Principal>)>,
    pub case_sensitive: bool,
}

/// Reads the two feed dialects back into the items that produced
/// them. This is primarily how [`crate::FeedBuilder`]'s emission is
/// verified, but it is also what the batch-authorization endpoint uses
/// for its own XML shim.
pub struct FeedParser {
    codec: Arc<DocIdCodec>,
}

struct PendingAcl {
    doc_id: DocId,
    fragment: Option<String>,
    builder: AclBuilder,
    inheritance_type: InheritanceType,
    case_sensitive: bool,
}

#[derive(Default)]
struct PendingPrincipal {
    access: Option<String>,
    scope: String,
    namespace: String,
    case_insensitive: bool,
    name: String,
}

impl PendingAcl {
    fn add_principal(&mut self, pending: PendingPrincipal) -> Result<(), FeedError> {
        if pending.case_insensitive {
            self.case_sensitive = false;
        }
        let scope = pending.scope.to_ascii_lowercase();
        let principal = if scope == "group" {
            Principal::group_in_namespace(pending.name, pending.namespace)
        } else {
            Principal::user_in_namespace(pending.name, pending.namespace)
        };
        let builder = std::mem::take(&mut self.builder);
        self.builder = match (pending.access.as_deref(), scope.as_str()) {
            (Some("permit"), "user") => builder.permit_user(principal),
            (Some("deny"), "user") => builder.deny_user(principal),
            (Some("permit"), "group") => builder.permit_group(principal),
            (Some("deny"), "group") => builder.deny_group(principal),
            (access, scope) => {
                return Err(FeedError::Structure(format!(
                    "unsupported principal access/scope {access:?}/{scope:?}"
                )))
            }
        };
        Ok(())
    }

    fn into_item(self) -> Result<AclItem, FeedError> {
        let acl = self
            .builder
            .inheritance_type(self.inheritance_type)
            .case_sensitive(self.case_sensitive)
            .build()
            .map_err(|err| FeedError::Structure(err.to_string()))?;
        Ok(AclItem {
            doc_id: self.doc_id,
            fragment: self.fragment,
            acl,
        })
    }
}

impl FeedParser {
    pub fn new(codec: Arc<DocIdCodec>) -> Self {
        Self { codec }
    }

    pub fn parse_metadata_and_url(&self, xml: &str) -> Result<ParsedFeed, FeedError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut datasource = String::new();
        let mut feed_type = String::new();
        let mut items: Vec<FeedItem> = Vec::new();
        let mut stack: Vec<String> = Vec::new();
        let mut record: Option<RecordBuilder> = None;
        let mut metadata: Option<Metadata> = None;
        let mut acl: Option<PendingAcl> = None;
        let mut principal: Option<PendingPrincipal> = None;
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = local_name(&e);
                    match name.as_str() {
                        "record" => record = Some(self.record_from_attrs(&e)?),
                        "metadata" => metadata = Some(Metadata::new()),
                        "acl" => acl = Some(self.acl_from_attrs(&e)?),
                        "principal" => principal = Some(principal_from_attrs(&e)?),
                        _ => {}
                    }
                    stack.push(name);
                }
                Event::Empty(e) => match e.name().as_ref() {
                    b"record" => {
                        items.push(FeedItem::Record(self.record_from_attrs(&e)?.build()))
                    }
                    b"acl" => items.push(FeedItem::Acl(self.acl_from_attrs(&e)?.into_item()?)),
                    b"meta" => {
                        if let Some(metadata) = metadata.as_mut() {
                            add_meta(metadata, &e)?;
                        }
                    }
                    _ => {}
                },
                Event::Text(e) => {
                    let text = e.unescape()?;
                    match stack.last().map(String::as_str) {
                        Some("datasource") => datasource = text.to_string(),
                        Some("feedtype") => feed_type = text.to_string(),
                        Some("principal") => {
                            if let Some(principal) = principal.as_mut() {
                                principal.name.push_str(&text);
                            }
                        }
                        _ => {}
                    }
                }
                Event::End(e) => {
                    stack.pop();
                    match e.name().as_ref() {
                        b"record" => {
                            if let Some(builder) = record.take() {
                                let builder = match metadata.take().filter(|m| !m.is_empty()) {
                                    Some(m) => builder.metadata(m),
                                    None => builder,
                                };
                                items.push(FeedItem::Record(builder.build()));
                            }
                        }
                        b"principal" => {
                            if let (Some(pending), Some(acl)) = (principal.take(), acl.as_mut()) {
                                acl.add_principal(pending)?;
                            }
                        }
                        b"acl" => {
                            if let Some(pending) = acl.take() {
                                items.push(FeedItem::Acl(pending.into_item()?));
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(ParsedFeed {
            datasource,
            feed_type,
            items,
        })
    }

    pub fn parse_group_definitions(&self, xml: &str) -> Result<ParsedGroupFeed, FeedError> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);
        let mut memberships: Vec<(Principal, Vec<Principal>)> = Vec::new();
        let mut case_sensitive = true;
        let mut stack: Vec<String> = Vec::new();
        let mut group: Option<Principal> = None;
        let mut members: Vec<Principal> = Vec::new();
        let mut in_members = false;
        let mut principal: Option<PendingPrincipal> = None;
        loop {
            match reader.read_event()? {
                Event::Start(e) => {
                    let name = local_name(&e);
                    match name.as_str() {
                        "members" => in_members = true,
                        "principal" => principal = Some(principal_from_attrs(&e)?),
                        _ => {}
                    }
                    stack.push(name);
                }
                Event::Text(e) => {
                    if stack.last().map(String::as_str) == Some("principal") {
                        if let Some(principal) = principal.as_mut() {
                            principal.name.push_str(&e.unescape()?);
                        }
                    }
                }
                Event::End(e) => {
                    stack.pop();
                    match e.name().as_ref() {
                        b"members" => in_members = false,
                        b"principal" => {
                            if let Some(pending) = principal.take() {
                                if pending.case_insensitive {
                                    case_sensitive = false;
                                }
                                let scope = pending.scope.to_ascii_lowercase();
                                let parsed = if scope == "group" {
                                    Principal::group_in_namespace(
                                        pending.name,
                                        pending.namespace,
                                    )
                                } else {
                                    Principal::user_in_namespace(pending.name, pending.namespace)
                                };
                                if in_members {
                                    members.push(parsed);
                                } else {
                                    group = Some(parsed);
                                }
                            }
                        }
                        b"membership" => {
                            let group = group.take().ok_or_else(|| {
                                FeedError::Structure("membership without a group".to_string())
                            })?;
                            memberships.push((group, std::mem::take(&mut members)));
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
        }
        Ok(ParsedGroupFeed {
            memberships,
            case_sensitive,
        })
    }

    fn decode_with_fragment(&self, raw: &str) -> Result<(DocId, Option<String>), FeedError> {
        if self.codec.is_doc_id_url() {
            return Ok((self.codec.decode(raw)?, None));
        }
        let url = Url::parse(raw)
            .map_err(|err| FeedError::Structure(format!("bad feed URL {raw:?}: {err}")))?;
        let fragment = url.query().map(str::to_string);
        Ok((self.codec.decode(url.path())?, fragment))
    }

    fn record_from_attrs(&self, e: &BytesStart) -> Result<RecordBuilder, FeedError> {
        let mut doc_id = None;
        let mut display_url = None;
        let mut delete = false;
        let mut last_modified = None;
        let mut lock = false;
        let mut crawl_immediately = false;
        let mut crawl_once = false;
        for attr in e.attributes() {
            let attr = attr?;
            let value = attr.unescape_value()?.to_string();
            match attr.key.as_ref() {
                b"url" => doc_id = Some(self.codec.decode(&value)?),
                b"displayurl" => {
                    display_url = Some(Url::parse(&value).map_err(|err| {
                        FeedError::Structure(format!("bad displayurl {value:?}: {err}"))
                    })?);
                }
                b"action" => delete = value == "delete",
                b"last-modified" => {
                    last_modified = Some(
                        DateTime::parse_from_rfc2822(&value)
                            .map_err(|err| {
                                FeedError::Structure(format!(
                                    "bad last-modified {value:?}: {err}"
                                ))
                            })?
                            .with_timezone(&Utc),
                    );
                }
                b"lock" => lock = value == "true",
                b"crawl-immediately" => crawl_immediately = value == "true",
                b"crawl-once" => crawl_once = value == "true",
                _ => {}
            }
        }
        let doc_id =
            doc_id.ok_or_else(|| FeedError::Structure("record without a url".to_string()))?;
        let mut builder = Record::builder(doc_id)
            .lock(lock)
            .crawl_immediately(crawl_immediately)
            .crawl_once(crawl_once);
        if delete {
            builder = builder.action(RecordAction::Delete);
        }
        if let Some(url) = display_url {
            builder = builder.display_url(url);
        }
        if let Some(when) = last_modified {
            builder = builder.last_modified(when);
        }
        Ok(builder)
    }

    fn acl_from_attrs(&self, e: &BytesStart) -> Result<PendingAcl, FeedError> {
        let mut target = None;
        let mut inherit: Option<(DocId, Option<String>)> = None;
        let mut inheritance_type = InheritanceType::LeafNode;
        for attr in e.attributes() {
            let attr = attr?;
            let value = attr.unescape_value()?.to_string();
            match attr.key.as_ref() {
                b"url" => target = Some(self.decode_with_fragment(&value)?),
                b"inherit-from" => inherit = Some(self.decode_with_fragment(&value)?),
                b"inheritance-type" => {
                    inheritance_type = InheritanceType::from_wire_name(&value).ok_or_else(|| {
                        FeedError::Structure(format!("unknown inheritance-type {value:?}"))
                    })?;
                }
                _ => {}
            }
        }
        let (doc_id, fragment) =
            target.ok_or_else(|| FeedError::Structure("acl without a url".to_string()))?;
        let mut builder = Acl::builder();
        if let Some((parent, parent_fragment)) = inherit {
            builder = match parent_fragment {
                Some(fragment) => builder.inherit_from_fragment(parent, &fragment),
                None => builder.inherit_from(parent),
            };
        }
        Ok(PendingAcl {
            doc_id,
            fragment,
            builder,
            inheritance_type,
            case_sensitive: true,
        })
    }
}

fn local_name(e: &BytesStart) -> String {
    String::from_utf8_lossy(e.name().as_ref()).to_string()
}

fn add_meta(metadata: &mut Metadata, e: &BytesStart) -> Result<(), FeedError> {
    let mut name = None;
    let mut content = None;
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.to_string();
        match attr.key.as_ref() {
            b"name" => name = Some(value),
            b"content" => content = Some(value),
            _ => {}
        }
    }
    match (name, content) {
        (Some(name), Some(content)) => {
            metadata.add(name, content);
            Ok(())
        }
        _ => Err(FeedError::Structure(
            "meta element without name/content".to_string(),
        )),
    }
}

fn principal_from_attrs(e: &BytesStart) -> Result<PendingPrincipal, FeedError> {
    let mut pending = PendingPrincipal {
        namespace: portico_acl::DEFAULT_NAMESPACE.to_string(),
        ..Default::default()
    };
    for attr in e.attributes() {
        let attr = attr?;
        let value = attr.unescape_value()?.to_string();
        match attr.key.as_ref() {
            b"access" => pending.access = Some(value),
            b"scope" => pending.scope = value,
            b"namespace" => pending.namespace = value,
            b"case-sensitivity-type" => {
                pending.case_insensitive =
                    value.eq_ignore_ascii_case("everything-case-insensitive")
                        || value == "EVERYTHING_CASE_INSENSITIVE";
            }
            _ => {}
        }
    }
    Ok(pending)
}
