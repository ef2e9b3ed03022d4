use crate::{AclItem, FeedError, FeedItem, Record, RecordAction};
use chrono::{DateTime, Utc};
use portico_acl::{InheritanceType, Principal, DEFAULT_NAMESPACE};
use portico_docid::DocIdCodec;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;
use std::collections::BTreeMap;
use std::sync::Arc;
use url::Url;

pub const FEEDS_DTD_PUBLIC_ID: &str = "-//Google//DTD GSA Feeds//EN";

/// Dates in feeds are RFC-822 in GMT, e.g. `Mon, 15 Nov 2010 14:05:00 +0000`.
pub(crate) fn format_rfc822(when: &DateTime<Utc>) -> String {
    when.format("%a, %d %b %Y %H:%M:%S %z").to_string()
}

/// Knobs for known appliance parser quirks. All default off.
#[derive(Debug, Clone, Default)]
pub struct FeedWorkarounds {
    /// Emit `<record ...> </record>` instead of a self-closing record;
    /// some appliance releases drop self-closed records.
    pub filler_in_record: bool,
    /// Stamp `authmethod="httpsso"` on every record so serving-time
    /// security applies.
    pub httpsso_authmethod: bool,
    /// Force the `crawl-immediately` attribute on or off for every
    /// record, overriding the per-record value.
    pub crawl_immediately_override: Option<bool>,
    /// Likewise for `crawl-once`.
    pub crawl_once_override: Option<bool>,
}

/// Serializes batches of feed items into the appliance's XML dialects.
pub struct FeedBuilder {
    codec: Arc<DocIdCodec>,
    workarounds: FeedWorkarounds,
    comments: Vec<String>,
}

impl FeedBuilder {
    pub fn new(codec: Arc<DocIdCodec>) -> Self {
        Self {
            codec,
            workarounds: FeedWorkarounds::default(),
            comments: Vec::new(),
        }
    }

    pub fn with_workarounds(mut self, workarounds: FeedWorkarounds) -> Self {
        self.workarounds = workarounds;
        self
    }

    pub fn add_comment<S: Into<String>>(&mut self, comment: S) {
        self.comments.push(comment.into());
    }

    /// The metadata-and-url dialect: a `<gsafeed>` with a header naming
    /// the datasource and a `<group>` of records and ACLs. The group is
    /// present even when empty.
    pub fn metadata_and_url_feed(
        &self,
        datasource: &str,
        items: &[FeedItem],
    ) -> Result<String, FeedError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write_prolog(&mut writer, "gsafeed")?;
        writer.write_event(Event::Start(BytesStart::new("gsafeed")))?;
        writer.write_event(Event::Start(BytesStart::new("header")))?;
        write_text_element(&mut writer, "datasource", datasource)?;
        write_text_element(&mut writer, "feedtype", "metadata-and-url")?;
        writer.write_event(Event::End(BytesEnd::new("header")))?;
        if items.is_empty() {
            writer.write_event(Event::Empty(BytesStart::new("group")))?;
        } else {
            writer.write_event(Event::Start(BytesStart::new("group")))?;
            for item in items {
                match item {
                    FeedItem::Record(record) => self.write_record(&mut writer, record)?,
                    FeedItem::Acl(acl_item) => self.write_acl(&mut writer, acl_item)?,
                }
            }
            writer.write_event(Event::End(BytesEnd::new("group")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("gsafeed")))?;
        finish(writer)
    }

    /// The group-definitions dialect: `<xmlgroups>` of `<membership>`
    /// entries. Members are emitted sorted so identical inputs yield
    /// identical bytes.
    pub fn group_definitions_feed(
        &self,
        groups: &BTreeMap<Principal, Vec<Principal>>,
        case_sensitive: bool,
    ) -> Result<String, FeedError> {
        let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);
        self.write_prolog(&mut writer, "xmlgroups")?;
        if groups.is_empty() {
            writer.write_event(Event::Empty(BytesStart::new("xmlgroups")))?;
            return finish(writer);
        }
        writer.write_event(Event::Start(BytesStart::new("xmlgroups")))?;
        for (group, members) in groups {
            if !group.is_well_formed() {
                return Err(FeedError::IllFormedPrincipal(group.name().to_string()));
            }
            if !group.is_group() {
                return Err(FeedError::NotAGroup(group.name().to_string()));
            }
            writer.write_event(Event::Start(BytesStart::new("membership")))?;
            let mut start = BytesStart::new("principal");
            start.push_attribute(("namespace", group.namespace()));
            start.push_attribute(("scope", "GROUP"));
            writer.write_event(Event::Start(start))?;
            writer.write_event(Event::Text(BytesText::new(group.name())))?;
            writer.write_event(Event::End(BytesEnd::new("principal")))?;
            writer.write_event(Event::Start(BytesStart::new("members")))?;
            let mut members = members.clone();
            members.sort();
            members.dedup();
            for member in &members {
                if !member.is_well_formed() {
                    return Err(FeedError::IllFormedPrincipal(member.name().to_string()));
                }
                let mut start = BytesStart::new("principal");
                start.push_attribute((
                    "case-sensitivity-type",
                    if case_sensitive {
                        "EVERYTHING_CASE_SENSITIVE"
                    } else {
                        "EVERYTHING_CASE_INSENSITIVE"
                    },
                ));
                start.push_attribute(("namespace", member.namespace()));
                start.push_attribute(("scope", if member.is_group() { "GROUP" } else { "USER" }));
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::Text(BytesText::new(member.name())))?;
                writer.write_event(Event::End(BytesEnd::new("principal")))?;
            }
            writer.write_event(Event::End(BytesEnd::new("members")))?;
            writer.write_event(Event::End(BytesEnd::new("membership")))?;
        }
        writer.write_event(Event::End(BytesEnd::new("xmlgroups")))?;
        finish(writer)
    }

    fn write_prolog(&self, writer: &mut Writer<Vec<u8>>, root: &str) -> Result<(), FeedError> {
        writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))?;
        writer.write_event(Event::DocType(BytesText::from_escaped(format!(
            "{root} PUBLIC \"{FEEDS_DTD_PUBLIC_ID}\" \"\""
        ))))?;
        // At least one comment always precedes the root element: some
        // appliance parsers choke on a document whose root follows the
        // DOCTYPE directly.
        if self.comments.is_empty() {
            writer.write_event(Event::Comment(BytesText::new("generated by portico")))?;
        } else {
            for comment in &self.comments {
                writer.write_event(Event::Comment(BytesText::new(comment)))?;
            }
        }
        Ok(())
    }

    fn encode_with_fragment(
        &self,
        doc_id: &portico_docid::DocId,
        fragment: Option<&str>,
    ) -> Result<Url, FeedError> {
        let mut url = self.codec.encode(doc_id)?;
        // The appliance strips real URI fragments during normalization,
        // so a fragment travels as the query string instead.
        if let Some(fragment) = fragment {
            url.set_query(Some(fragment));
        }
        Ok(url)
    }

    fn write_record(&self, writer: &mut Writer<Vec<u8>>, record: &Record) -> Result<(), FeedError> {
        let url = self.codec.encode(record.doc_id())?;
        let mut start = BytesStart::new("record");
        start.push_attribute(("url", url.as_str()));
        if let Some(display) = record.display_url() {
            start.push_attribute(("displayurl", display.as_str()));
        }
        if record.action() == RecordAction::Delete {
            start.push_attribute(("action", "delete"));
        }
        start.push_attribute(("mimetype", "text/plain"));
        if let Some(last_modified) = record.last_modified() {
            start.push_attribute(("last-modified", format_rfc822(last_modified).as_str()));
        }
        if record.lock() {
            start.push_attribute(("lock", "true"));
        }
        let crawl_immediately = self
            .workarounds
            .crawl_immediately_override
            .unwrap_or_else(|| record.crawl_immediately());
        if crawl_immediately {
            start.push_attribute(("crawl-immediately", "true"));
        }
        let crawl_once = self
            .workarounds
            .crawl_once_override
            .unwrap_or_else(|| record.crawl_once());
        if crawl_once {
            start.push_attribute(("crawl-once", "true"));
        }
        if self.workarounds.httpsso_authmethod {
            start.push_attribute(("authmethod", "httpsso"));
        }
        match record.metadata().filter(|m| !m.is_empty()) {
            Some(metadata) => {
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::Start(BytesStart::new("metadata")))?;
                for (name, content) in metadata.iter() {
                    let mut meta = BytesStart::new("meta");
                    meta.push_attribute(("content", content));
                    meta.push_attribute(("name", name));
                    writer.write_event(Event::Empty(meta))?;
                }
                writer.write_event(Event::End(BytesEnd::new("metadata")))?;
                writer.write_event(Event::End(BytesEnd::new("record")))?;
            }
            None if self.workarounds.filler_in_record => {
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::Text(BytesText::new(" ")))?;
                writer.write_event(Event::End(BytesEnd::new("record")))?;
            }
            None => {
                writer.write_event(Event::Empty(start))?;
            }
        }
        Ok(())
    }

    fn write_acl(&self, writer: &mut Writer<Vec<u8>>, item: &AclItem) -> Result<(), FeedError> {
        let url = self.encode_with_fragment(&item.doc_id, item.fragment.as_deref())?;
        let mut start = BytesStart::new("acl");
        start.push_attribute(("url", url.as_str()));
        if item.acl.inheritance_type() != InheritanceType::LeafNode {
            start.push_attribute(("inheritance-type", item.acl.inheritance_type().wire_name()));
        }
        if let Some(parent) = item.acl.inherit_from() {
            let parent_url = self.encode_with_fragment(parent, item.acl.inherit_fragment())?;
            start.push_attribute(("inherit-from", parent_url.as_str()));
        }
        let members = [
            (item.acl.permit_users(), "permit", "user"),
            (item.acl.deny_users(), "deny", "user"),
            (item.acl.permit_groups(), "permit", "group"),
            (item.acl.deny_groups(), "deny", "group"),
        ];
        if members.iter().all(|(list, _, _)| list.is_empty()) {
            writer.write_event(Event::Empty(start))?;
            return Ok(());
        }
        writer.write_event(Event::Start(start))?;
        for (list, access, scope) in members {
            for principal in list {
                if !principal.is_well_formed() {
                    return Err(FeedError::IllFormedPrincipal(principal.name().to_string()));
                }
                let mut start = BytesStart::new("principal");
                start.push_attribute(("access", access));
                if !item.acl.is_case_sensitive() {
                    start.push_attribute((
                        "case-sensitivity-type",
                        "everything-case-insensitive",
                    ));
                }
                if principal.namespace() != DEFAULT_NAMESPACE {
                    start.push_attribute(("namespace", principal.namespace()));
                }
                start.push_attribute(("scope", scope));
                writer.write_event(Event::Start(start))?;
                writer.write_event(Event::Text(BytesText::new(principal.name())))?;
                writer.write_event(Event::End(BytesEnd::new("principal")))?;
            }
        }
        writer.write_event(Event::End(BytesEnd::new("acl")))?;
        Ok(())
    }
}

fn write_text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    text: &str,
) -> Result<(), FeedError> {
    writer.write_event(Event::Start(BytesStart::new(name)))?;
    writer.write_event(Event::Text(BytesText::new(text)))?;
    writer.write_event(Event::End(BytesEnd::new(name)))?;
    Ok(())
}

fn finish(writer: Writer<Vec<u8>>) -> Result<String, FeedError> {
    let mut bytes = writer.into_inner();
    bytes.push(b'\n');
    String::from_utf8(bytes)
        .map_err(|err| FeedError::Structure(format!("feed XML is not UTF-8: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Metadata;
    use chrono::TimeZone;
    use maplit::btreemap;
    use portico_acl::Acl;
    use portico_docid::DocId;

    fn codec() -> Arc<DocIdCodec> {
        Arc::new(
            DocIdCodec::new(Url::parse("http://localhost:5678/doc/").unwrap(), false).unwrap(),
        )
    }

    #[test]
    fn empty_feed_keeps_the_group() {
        let feed = FeedBuilder::new(codec())
            .metadata_and_url_feed("testing", &[])
            .unwrap();
        assert!(feed.starts_with("<?xml version=\"1.0\" encoding=\"UTF-8\"?>"));
        assert!(feed.contains(
            "<!DOCTYPE gsafeed PUBLIC \"-//Google//DTD GSA Feeds//EN\" \"\">"
        ));
        assert!(feed.contains("<!--generated by portico-->"));
        assert!(feed.contains("<datasource>testing</datasource>"));
        assert!(feed.contains("<feedtype>metadata-and-url</feedtype>"));
        assert!(feed.contains("<group/>"));
    }

    #[test]
    fn record_attributes() {
        let when = Utc.with_ymd_and_hms(2010, 11, 15, 14, 5, 0).unwrap();
        let record = Record::builder("a&b")
            .last_modified(when)
            .display_url(Url::parse("http://display.example/x").unwrap())
            .lock(true)
            .crawl_immediately(true)
            .build();
        let feed = FeedBuilder::new(codec())
            .metadata_and_url_feed("testing", &[record.into()])
            .unwrap();
        assert!(feed.contains("url=\"http://localhost:5678/doc/a&amp;b\""));
        assert!(feed.contains("displayurl=\"http://display.example/x\""));
        assert!(feed.contains("mimetype=\"text/plain\""));
        assert!(feed.contains("last-modified=\"Mon, 15 Nov 2010 14:05:00 +0000\""));
        assert!(feed.contains("lock=\"true\""));
        assert!(feed.contains("crawl-immediately=\"true\""));
        assert!(!feed.contains("action="));
        assert!(!feed.contains("authmethod"));
    }

    #[test]
    fn delete_and_metadata() {
        let mut metadata = Metadata::new();
        metadata.add("author", "alice");
        let items: Vec<FeedItem> = vec![
            Record::delete("gone").into(),
            Record::builder("kept").metadata(metadata).build().into(),
        ];
        let feed = FeedBuilder::new(codec())
            .metadata_and_url_feed("testing", &items)
            .unwrap();
        assert!(feed.contains("action=\"delete\""));
        assert!(feed.contains("<metadata>"));
        assert!(feed.contains("<meta content=\"alice\" name=\"author\"/>"));
    }

    #[test]
    fn workarounds_apply() {
        let workarounds = FeedWorkarounds {
            filler_in_record: true,
            httpsso_authmethod: true,
            crawl_immediately_override: Some(false),
            crawl_once_override: Some(true),
        };
        let record = Record::builder("doc").crawl_immediately(true).build();
        let feed = FeedBuilder::new(codec())
            .with_workarounds(workarounds)
            .metadata_and_url_feed("testing", &[record.into()])
            .unwrap();
        assert!(feed.contains("> </record>"));
        assert!(feed.contains("authmethod=\"httpsso\""));
        assert!(!feed.contains("crawl-immediately"));
        assert!(feed.contains("crawl-once=\"true\""));
    }

    #[test]
    fn custom_comments_replace_the_placeholder() {
        let mut builder = FeedBuilder::new(codec());
        builder.add_comment("one");
        builder.add_comment("two");
        let feed = builder.metadata_and_url_feed("testing", &[]).unwrap();
        assert!(feed.contains("<!--one-->"));
        assert!(feed.contains("<!--two-->"));
        assert!(!feed.contains("generated by portico"));
    }

    #[test]
    fn acl_item_emission() {
        use portico_acl::InheritanceType;
        let acl = Acl::builder()
            .permit_user(Principal::user("alice"))
            .deny_group(Principal::group_in_namespace("eng", "LocalNs"))
            .case_sensitive(false)
            .inheritance_type(InheritanceType::ParentOverrides)
            .inherit_from_fragment(DocId::new("folder"), "sub")
            .build()
            .unwrap();
        let item = AclItem::with_fragment(DocId::new("doc"), "leaf", acl);
        let feed = FeedBuilder::new(codec())
            .metadata_and_url_feed("testing", &[item.into()])
            .unwrap();
        assert!(feed.contains("<acl url=\"http://localhost:5678/doc/doc?leaf\""));
        assert!(feed.contains("inheritance-type=\"parent-overrides\""));
        assert!(feed.contains("inherit-from=\"http://localhost:5678/doc/folder?sub\""));
        assert!(feed.contains(
            "<principal access=\"permit\" case-sensitivity-type=\"everything-case-insensitive\" scope=\"user\">alice</principal>"
        ));
        assert!(feed.contains(
            "case-sensitivity-type=\"everything-case-insensitive\" namespace=\"LocalNs\" scope=\"group\">eng</principal>"
        ));
    }

    #[test]
    fn group_definitions_shape() {
        let groups = btreemap! {
            Principal::group("eng") => vec![
                Principal::user("zoe"),
                Principal::user("abe"),
                Principal::group("subteam"),
            ],
        };
        let feed = FeedBuilder::new(codec())
            .group_definitions_feed(&groups, true)
            .unwrap();
        assert!(feed.contains(
            "<!DOCTYPE xmlgroups PUBLIC \"-//Google//DTD GSA Feeds//EN\" \"\">"
        ));
        assert!(feed.contains("<principal namespace=\"Default\" scope=\"GROUP\">eng</principal>"));
        // Members are sorted: abe before zoe.
        let abe = feed.find(">abe<").unwrap();
        let zoe = feed.find(">zoe<").unwrap();
        assert!(abe < zoe);
        assert!(feed.contains("case-sensitivity-type=\"EVERYTHING_CASE_SENSITIVE\""));
        assert!(feed.contains("scope=\"USER\">abe</principal>"));
        assert!(feed.contains("scope=\"GROUP\">subteam</principal>"));
    }

    #[test]
    fn group_definitions_reject_bad_principals() {
        let groups = btreemap! { Principal::user("not-a-group") => vec![] };
        assert!(matches!(
            FeedBuilder::new(codec()).group_definitions_feed(&groups, true),
            Err(FeedError::NotAGroup(_))
        ));

        let groups = btreemap! {
            Principal::group("eng") => vec![Principal::user(" padded ")],
        };
        assert!(matches!(
            FeedBuilder::new(codec()).group_definitions_feed(&groups, true),
            Err(FeedError::IllFormedPrincipal(_))
        ));
    }
}
