use chrono::{DateTime, Utc};
use portico_acl::Acl;
use portico_feed::Metadata;
use std::collections::BTreeMap;
use thiserror::Error;
use url::Url;

/// Body bytes are buffered until this many are pending, then the head
/// is committed and the chunk streamed. Small documents therefore
/// stay entirely in the buffer until the repository returns, which
/// keeps a late state violation recoverable as a clean 500.
pub const BODY_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseState {
    Setup,
    NotModified,
    NotFound,
    NoContent,
    SendBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseStatus {
    #[default]
    Ok,
    NotModified,
    NotFound,
    NoContent,
}

/// Serving-time crawl control for one document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransmissionDecision {
    AsIs,
    DoNotIndex,
    DoNotIndexContent,
}

impl TransmissionDecision {
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::AsIs => "as-is",
            Self::DoNotIndex => "do-not-index",
            Self::DoNotIndexContent => "do-not-index-content",
        }
    }
}

/// Everything the server needs to emit status and headers, gathered
/// while the response is still in Setup.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResponseHead {
    pub status: ResponseStatus,
    pub content_type: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
    pub display_url: Option<Url>,
    pub metadata: Metadata,
    pub acl: Option<Acl>,
    /// Extra ACLs published under this document's id, keyed by
    /// fragment.
    pub named_resources: BTreeMap<String, Acl>,
    pub anchors: Vec<(Option<String>, Url)>,
    pub no_index: bool,
    pub no_follow: bool,
    pub no_archive: bool,
    pub crawl_once: bool,
    pub lock: bool,
    pub transmission_decision: Option<TransmissionDecision>,
    pub params: BTreeMap<String, String>,
}

#[derive(Error, Debug)]
pub enum ResponseError {
    #[error("response is already {state:?}; {operation} is only legal during setup")]
    IllegalState {
        state: ResponseState,
        operation: &'static str,
    },
    #[error("repository finished without producing a response")]
    NoOutput,
    #[error("response transport failure: {0}")]
    Transport(anyhow::Error),
}

/// Where committed heads and body bytes go. The server supplies an
/// HTTP-backed implementation; tests record into memory.
pub trait ResponseTransport: Send {
    fn commit(&mut self, head: ResponseHead) -> anyhow::Result<()>;
    fn write_body(&mut self, chunk: &[u8]) -> anyhow::Result<()>;
}

/// The response side of one document pull: a small state machine.
///
/// States are `{Setup, NotModified, NotFound, NoContent, SendBody}`,
/// starting in Setup. The `respond_*` methods are terminal; `output`
/// moves to SendBody and hands back a writer. Every attribute setter
/// is legal only during Setup. Misuse is an [`ResponseError::IllegalState`],
/// which the server surfaces as a 500 and an invariant-breach log
/// line.
pub struct DocResponse {
    state: ResponseState,
    head: ResponseHead,
    committed: bool,
    buffer: Vec<u8>,
    transport: Box<dyn ResponseTransport>,
}

impl DocResponse {
    pub fn new(transport: Box<dyn ResponseTransport>) -> Self {
        Self {
            state: ResponseState::Setup,
            head: ResponseHead::default(),
            committed: false,
            buffer: Vec::new(),
            transport,
        }
    }

    pub fn state(&self) -> ResponseState {
        self.state
    }

    pub fn respond_not_modified(&mut self) -> Result<(), ResponseError> {
        self.terminal(
            ResponseState::NotModified,
            ResponseStatus::NotModified,
            "respond_not_modified",
        )
    }

    pub fn respond_not_found(&mut self) -> Result<(), ResponseError> {
        self.terminal(
            ResponseState::NotFound,
            ResponseStatus::NotFound,
            "respond_not_found",
        )
    }

    pub fn respond_no_content(&mut self) -> Result<(), ResponseError> {
        self.terminal(
            ResponseState::NoContent,
            ResponseStatus::NoContent,
            "respond_no_content",
        )
    }

    /// Move to SendBody and return the body writer. The head commits
    /// lazily: nothing reaches the transport until enough bytes are
    /// buffered or the response is finished.
    pub fn output(&mut self) -> Result<ResponseBody<'_>, ResponseError> {
        match self.state {
            ResponseState::Setup | ResponseState::SendBody => {
                self.state = ResponseState::SendBody;
                Ok(ResponseBody { response: self })
            }
            state => Err(ResponseError::IllegalState {
                state,
                operation: "output",
            }),
        }
    }

    pub fn set_content_type(&mut self, content_type: &str) -> Result<(), ResponseError> {
        self.head_mut("set_content_type")?.content_type = Some(content_type.to_string());
        Ok(())
    }

    pub fn set_last_modified(&mut self, when: DateTime<Utc>) -> Result<(), ResponseError> {
        self.head_mut("set_last_modified")?.last_modified = Some(when);
        Ok(())
    }

    pub fn add_metadata(&mut self, name: &str, value: &str) -> Result<(), ResponseError> {
        self.head_mut("add_metadata")?.metadata.add(name, value);
        Ok(())
    }

    pub fn set_acl(&mut self, acl: Acl) -> Result<(), ResponseError> {
        self.head_mut("set_acl")?.acl = Some(acl);
        Ok(())
    }

    pub fn put_named_resource(&mut self, fragment: &str, acl: Acl) -> Result<(), ResponseError> {
        self.head_mut("put_named_resource")?
            .named_resources
            .insert(fragment.to_string(), acl);
        Ok(())
    }

    pub fn set_display_url(&mut self, url: Url) -> Result<(), ResponseError> {
        self.head_mut("set_display_url")?.display_url = Some(url);
        Ok(())
    }

    pub fn add_anchor(&mut self, text: Option<String>, url: Url) -> Result<(), ResponseError> {
        self.head_mut("add_anchor")?.anchors.push((text, url));
        Ok(())
    }

    pub fn set_no_index(&mut self, yes: bool) -> Result<(), ResponseError> {
        self.head_mut("set_no_index")?.no_index = yes;
        Ok(())
    }

    pub fn set_no_follow(&mut self, yes: bool) -> Result<(), ResponseError> {
        self.head_mut("set_no_follow")?.no_follow = yes;
        Ok(())
    }

    pub fn set_no_archive(&mut self, yes: bool) -> Result<(), ResponseError> {
        self.head_mut("set_no_archive")?.no_archive = yes;
        Ok(())
    }

    pub fn set_crawl_once(&mut self, yes: bool) -> Result<(), ResponseError> {
        self.head_mut("set_crawl_once")?.crawl_once = yes;
        Ok(())
    }

    pub fn set_lock(&mut self, yes: bool) -> Result<(), ResponseError> {
        self.head_mut("set_lock")?.lock = yes;
        Ok(())
    }

    pub fn set_transmission_decision(
        &mut self,
        decision: TransmissionDecision,
    ) -> Result<(), ResponseError> {
        self.head_mut("set_transmission_decision")?.transmission_decision = Some(decision);
        Ok(())
    }

    pub fn set_param(&mut self, key: &str, value: &str) -> Result<(), ResponseError> {
        self.head_mut("set_param")?
            .params
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Called by the server once the repository returns. A response
    /// still in Setup is an invariant breach; a SendBody response
    /// flushes whatever is buffered (committing a 200 head even for a
    /// zero-byte body).
    pub fn finish(mut self) -> Result<ResponseState, ResponseError> {
        match self.state {
            ResponseState::Setup => Err(ResponseError::NoOutput),
            ResponseState::SendBody => {
                self.flush_buffer()?;
                Ok(ResponseState::SendBody)
            }
            state => Ok(state),
        }
    }

    fn head_mut(&mut self, operation: &'static str) -> Result<&mut ResponseHead, ResponseError> {
        if self.state != ResponseState::Setup {
            return Err(ResponseError::IllegalState {
                state: self.state,
                operation,
            });
        }
        Ok(&mut self.head)
    }

    fn terminal(
        &mut self,
        state: ResponseState,
        status: ResponseStatus,
        operation: &'static str,
    ) -> Result<(), ResponseError> {
        if self.state != ResponseState::Setup {
            return Err(ResponseError::IllegalState {
                state: self.state,
                operation,
            });
        }
        self.state = state;
        let mut head = std::mem::take(&mut self.head);
        head.status = status;
        self.transport
            .commit(head)
            .map_err(ResponseError::Transport)?;
        self.committed = true;
        Ok(())
    }

    fn flush_buffer(&mut self) -> Result<(), ResponseError> {
        if !self.committed {
            let head = std::mem::take(&mut self.head);
            self.transport
                .commit(head)
                .map_err(ResponseError::Transport)?;
            self.committed = true;
        }
        if !self.buffer.is_empty() {
            let chunk = std::mem::take(&mut self.buffer);
            self.transport
                .write_body(&chunk)
                .map_err(ResponseError::Transport)?;
        }
        Ok(())
    }
}

/// `std::io::Write` view over a [`DocResponse`] in SendBody.
pub struct ResponseBody<'a> {
    response: &'a mut DocResponse,
}

impl std::io::Write for ResponseBody<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.response.buffer.extend_from_slice(buf);
        if self.response.buffer.len() >= BODY_CHUNK_SIZE {
            self.response
                .flush_buffer()
                .map_err(std::io::Error::other)?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingInner {
        heads: Vec<ResponseHead>,
        body: Vec<u8>,
    }

    #[derive(Clone, Default)]
    struct Recording(Arc<Mutex<RecordingInner>>);

    impl Recording {
        fn heads(&self) -> Vec<ResponseHead> {
            self.0.lock().unwrap().heads.clone()
        }

        fn body(&self) -> Vec<u8> {
            self.0.lock().unwrap().body.clone()
        }
    }

    impl ResponseTransport for Recording {
        fn commit(&mut self, head: ResponseHead) -> anyhow::Result<()> {
            self.0.lock().unwrap().heads.push(head);
            Ok(())
        }

        fn write_body(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
            self.0.lock().unwrap().body.extend_from_slice(chunk);
            Ok(())
        }
    }

    fn response() -> (DocResponse, Recording) {
        let recording = Recording::default();
        (DocResponse::new(Box::new(recording.clone())), recording)
    }

    #[test]
    fn terminal_states_commit_immediately() {
        let (mut resp, rec) = response();
        resp.respond_not_modified().unwrap();
        assert_eq!(resp.state(), ResponseState::NotModified);
        assert_eq!(rec.heads()[0].status, ResponseStatus::NotModified);

        let (mut resp, rec) = response();
        resp.respond_not_found().unwrap();
        assert_eq!(rec.heads()[0].status, ResponseStatus::NotFound);

        let (mut resp, rec) = response();
        resp.respond_no_content().unwrap();
        assert_eq!(rec.heads()[0].status, ResponseStatus::NoContent);
    }

    #[test]
    fn small_body_commits_on_finish() {
        let (mut resp, rec) = response();
        resp.set_content_type("text/plain").unwrap();
        resp.output().unwrap().write_all(b"hello").unwrap();
        assert!(rec.heads().is_empty(), "head must not commit early");
        let state = resp.finish().unwrap();
        assert_eq!(state, ResponseState::SendBody);
        let heads = rec.heads();
        assert_eq!(heads.len(), 1);
        assert_eq!(heads[0].status, ResponseStatus::Ok);
        assert_eq!(heads[0].content_type.as_deref(), Some("text/plain"));
        assert_eq!(rec.body(), b"hello");
    }

    #[test]
    fn large_body_streams_in_chunks() {
        let (mut resp, rec) = response();
        let chunk = vec![b'x'; BODY_CHUNK_SIZE + 17];
        resp.output().unwrap().write_all(&chunk).unwrap();
        // The first chunk already hit the transport.
        assert_eq!(rec.heads().len(), 1);
        assert_eq!(rec.body().len(), BODY_CHUNK_SIZE + 17);
        resp.finish().unwrap();
        assert_eq!(rec.body().len(), BODY_CHUNK_SIZE + 17);
    }

    #[test]
    fn zero_byte_body_still_commits() {
        let (mut resp, rec) = response();
        resp.output().unwrap();
        resp.finish().unwrap();
        assert_eq!(rec.heads().len(), 1);
        assert!(rec.body().is_empty());
    }

    #[test]
    fn output_then_not_modified_is_an_illegal_state() {
        // A repository that writes and then claims not-modified must
        // produce an invariant breach with nothing on the wire.
        let (mut resp, rec) = response();
        resp.output().unwrap().write_all(b"oops").unwrap();
        let err = resp.respond_not_modified().unwrap_err();
        assert!(matches!(
            err,
            ResponseError::IllegalState {
                state: ResponseState::SendBody,
                operation: "respond_not_modified"
            }
        ));
        assert!(rec.heads().is_empty());
        assert!(rec.body().is_empty());
    }

    #[test]
    fn not_modified_then_output_is_an_illegal_state() {
        let (mut resp, _rec) = response();
        resp.respond_not_modified().unwrap();
        assert!(matches!(
            resp.output(),
            Err(ResponseError::IllegalState { .. })
        ));
    }

    #[test]
    fn setters_fail_outside_setup() {
        let (mut resp, _rec) = response();
        resp.respond_not_found().unwrap();
        assert!(resp.set_content_type("text/html").is_err());
        assert!(resp.add_metadata("k", "v").is_err());
        assert!(resp.set_lock(true).is_err());
        assert!(resp.respond_no_content().is_err());
    }

    #[test]
    fn untouched_response_is_a_breach() {
        let (resp, rec) = response();
        assert!(matches!(resp.finish(), Err(ResponseError::NoOutput)));
        assert!(rec.heads().is_empty());
    }

    #[test]
    fn head_carries_the_setup_attributes() {
        use portico_acl::Principal;
        let (mut resp, rec) = response();
        resp.add_metadata("author", "alice").unwrap();
        resp.set_acl(
            Acl::builder()
                .permit_user(Principal::user("alice"))
                .build()
                .unwrap(),
        )
        .unwrap();
        resp.add_anchor(
            Some("next".to_string()),
            Url::parse("http://localhost/doc/next").unwrap(),
        )
        .unwrap();
        resp.set_no_index(true).unwrap();
        resp.set_crawl_once(true).unwrap();
        resp.set_transmission_decision(TransmissionDecision::DoNotIndexContent)
            .unwrap();
        resp.output().unwrap().write_all(b"body").unwrap();
        resp.finish().unwrap();
        let head = rec.heads().remove(0);
        assert_eq!(head.metadata.values_of("author").collect::<Vec<_>>(), ["alice"]);
        assert!(head.acl.is_some());
        assert_eq!(head.anchors.len(), 1);
        assert!(head.no_index && head.crawl_once);
        assert!(!head.no_follow);
        assert_eq!(
            head.transmission_decision,
            Some(TransmissionDecision::DoNotIndexContent)
        );
    }
}
