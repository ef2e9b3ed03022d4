use crate::http_server::AppState;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use portico_acl::Acl;
use portico_docid::{DocId, DocIdCodec};
use portico_repo::{
    DocRequest, DocResponse, ResponseHead, ResponseStatus, ResponseTransport,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, OwnedSemaphorePermit};

/// Bytes escaped inside `X-Gsa-External-Metadata` values: the pair
/// separators themselves, percent, and anything that cannot live in a
/// header.
const META_VALUE_SET: &AsciiSet = &CONTROLS.add(b' ').add(b'%').add(b'=').add(b',');

fn pct(value: &str) -> String {
    utf8_percent_encode(value, META_VALUE_SET).to_string()
}

/// What the repository committed for one request, handed from the
/// repository task to the HTTP handler.
pub struct CommittedHead {
    pub head: ResponseHead,
    pub body_rx: Option<mpsc::UnboundedReceiver<Vec<u8>>>,
}

/// [`ResponseTransport`] over channels: the head goes out once on a
/// oneshot, body chunks follow on an unbounded channel.
pub struct ChannelTransport {
    head_tx: Option<oneshot::Sender<CommittedHead>>,
    body_tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
}

impl ChannelTransport {
    pub fn new(head_tx: oneshot::Sender<CommittedHead>) -> Self {
        Self {
            head_tx: Some(head_tx),
            body_tx: None,
        }
    }
}

impl ResponseTransport for ChannelTransport {
    fn commit(&mut self, head: ResponseHead) -> anyhow::Result<()> {
        let tx = self
            .head_tx
            .take()
            .ok_or_else(|| anyhow::anyhow!("response head committed twice"))?;
        let body_rx = if head.status == ResponseStatus::Ok {
            let (body_tx, body_rx) = mpsc::unbounded_channel();
            self.body_tx = Some(body_tx);
            Some(body_rx)
        } else {
            None
        };
        tx.send(CommittedHead { head, body_rx })
            .map_err(|_| anyhow::anyhow!("request handler went away"))
    }

    fn write_body(&mut self, chunk: &[u8]) -> anyhow::Result<()> {
        let tx = self
            .body_tx
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("body write before head commit"))?;
        tx.send(chunk.to_vec())
            .map_err(|_| anyhow::anyhow!("client disconnected"))
    }
}

pub async fn handle_doc(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    serve_doc(&state, peer, &method, uri.path(), &headers, false).await
}

/// `/heartbeat/X` is internally a HEAD for `/doc/X`; whatever comes
/// back is stripped of appliance-only headers.
pub async fn handle_heartbeat(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let heartbeat_path = state.config.str_value("server.heartbeatPath");
    let doc_path = state.config.str_value("server.docIdPath");
    let rewritten = match uri.path().strip_prefix(heartbeat_path) {
        Some(rest) => format!("{doc_path}{rest}"),
        None => uri.path().to_string(),
    };
    let mut response = serve_doc(&state, peer, &method, &rewritten, &headers, true).await;
    let gsa_headers: Vec<HeaderName> = response
        .headers()
        .keys()
        .filter(|name| name.as_str().starts_with("x-gsa"))
        .cloned()
        .collect();
    for name in gsa_headers {
        response.headers_mut().remove(name);
    }
    response
}

async fn serve_doc(
    state: &AppState,
    peer: SocketAddr,
    method: &Method,
    path: &str,
    headers: &HeaderMap,
    force_head: bool,
) -> Response {
    let started = std::time::Instant::now();
    if method != Method::GET && method != Method::HEAD {
        return simple(StatusCode::METHOD_NOT_ALLOWED, "only GET and HEAD");
    }
    let Some(permit) = state.limiter.acquire().await else {
        tracing::warn!("request for {path:?} rejected: worker pool saturated");
        return simple(StatusCode::SERVICE_UNAVAILABLE, "try again later");
    };
    if portico_server_lifecycle::is_shutting_down() {
        return simple(StatusCode::SERVICE_UNAVAILABLE, "shutting down");
    }
    let from_appliance = state.trusted.is_trusted(peer.ip());
    let doc_id = match state.codec.decode(path) {
        Ok(doc_id) => doc_id,
        Err(err) => {
            tracing::debug!("request path {path:?} does not decode: {err}");
            state.journal.record_request(None, from_appliance);
            return simple(StatusCode::NOT_FOUND, "no such document");
        }
    };
    state.journal.record_request(Some(&doc_id), from_appliance);
    if !from_appliance && !state.mark_all_docs_public {
        tracing::debug!("denying {peer} access to {doc_id:?}");
        return simple(
            StatusCode::FORBIDDEN,
            "only the appliance may retrieve documents",
        );
    }

    let if_modified_since = headers
        .get(header::IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| DateTime::parse_from_rfc2822(value).ok())
        .map(|when| when.with_timezone(&Utc));
    let head_only = force_head || method == Method::HEAD;
    let request = DocRequest::new(doc_id.clone(), head_only, if_modified_since, from_appliance);

    let (head_tx, mut head_rx) = oneshot::channel();
    let transport = ChannelTransport::new(head_tx);
    let repo = state.repo.clone();
    let mut task = tokio::spawn(async move {
        let mut response = DocResponse::new(Box::new(transport));
        match repo.get_doc_content(&request, &mut response).await {
            Ok(()) => response.finish().map(|_| ()).map_err(anyhow::Error::from),
            Err(err) => Err(err),
        }
    });
    let abort = task.abort_handle();
    let watchdog = state.watchdog;
    let watched_id = doc_id.clone();
    tokio::spawn(async move {
        tokio::time::sleep(watchdog).await;
        if !abort.is_finished() {
            tracing::error!("watchdog expired serving {watched_id:?}; tearing request down");
            abort.abort();
        }
    });

    tokio::select! {
        biased;
        committed = &mut head_rx => match committed {
            Ok(committed) => {
                state.journal.record_request_latency(started.elapsed());
                build_response(state, committed, from_appliance, head_only, permit)
            }
            // The repository finished (or died) without committing a
            // head; the join result says how.
            Err(_) => failure_response(task.await, &doc_id),
        },
        joined = &mut task => failure_response(joined, &doc_id),
    }
}

fn failure_response(
    joined: Result<anyhow::Result<()>, tokio::task::JoinError>,
    doc_id: &DocId,
) -> Response {
    match joined {
        Ok(Ok(())) => {
            tracing::error!("{doc_id:?}: repository returned without producing a response");
        }
        Ok(Err(err)) => {
            tracing::error!("{doc_id:?}: {err:#}");
        }
        Err(join) if join.is_cancelled() => {
            tracing::error!("{doc_id:?}: request torn down by the watchdog");
        }
        Err(join) => {
            tracing::error!("{doc_id:?}: repository task panicked: {join}");
        }
    }
    simple(StatusCode::INTERNAL_SERVER_ERROR, "error serving document")
}

fn build_response(
    state: &AppState,
    committed: CommittedHead,
    from_appliance: bool,
    head_only: bool,
    permit: OwnedSemaphorePermit,
) -> Response {
    let CommittedHead { head, body_rx } = committed;
    let status = match head.status {
        ResponseStatus::Ok => StatusCode::OK,
        ResponseStatus::NotModified => StatusCode::NOT_MODIFIED,
        ResponseStatus::NotFound => StatusCode::NOT_FOUND,
        ResponseStatus::NoContent => StatusCode::NO_CONTENT,
    };
    let mut builder = Response::builder().status(status);
    if head.status == ResponseStatus::Ok {
        if let Some(headers) = builder.headers_mut() {
            emit_headers(&head, from_appliance, &state.codec, headers);
        }
    }
    let body = match body_rx {
        Some(rx) if !head_only => stream_body(rx, permit),
        _ => Body::empty(),
    };
    builder.body(body).unwrap_or_else(|err| {
        tracing::error!("could not assemble response: {err}");
        simple(StatusCode::INTERNAL_SERVER_ERROR, "error serving document")
    })
}

fn stream_body(rx: mpsc::UnboundedReceiver<Vec<u8>>, permit: OwnedSemaphorePermit) -> Body {
    // The permit rides along with the stream so a slow download keeps
    // its worker slot occupied.
    let stream = futures::stream::unfold((rx, permit), |(mut rx, permit)| async move {
        rx.recv()
            .await
            .map(|chunk| (Ok::<_, std::convert::Infallible>(Bytes::from(chunk)), (rx, permit)))
    });
    Body::from_stream(stream)
}

fn emit_headers(
    head: &ResponseHead,
    from_appliance: bool,
    codec: &Arc<DocIdCodec>,
    headers: &mut HeaderMap,
) {
    let meta_header = HeaderName::from_static("x-gsa-external-metadata");
    let mut append = |name: &HeaderName, value: String| match HeaderValue::from_str(&value) {
        Ok(value) => {
            headers.append(name.clone(), value);
        }
        Err(_) => tracing::warn!("dropping unrepresentable header value {value:?}"),
    };

    if let Some(content_type) = &head.content_type {
        append(&header::CONTENT_TYPE, content_type.clone());
    }
    if let Some(last_modified) = &head.last_modified {
        append(
            &header::LAST_MODIFIED,
            last_modified.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
        );
    }
    for (name, value) in head.metadata.iter() {
        append(&meta_header, format!("{}={}", pct(name), pct(value)));
    }
    if let Some(display_url) = &head.display_url {
        append(
            &meta_header,
            format!("google:displayurl={}", pct(display_url.as_str())),
        );
    }
    // ACLs only mean something to the appliance; for anyone else they
    // would leak the security model of the repository.
    if from_appliance {
        if let Some(acl) = &head.acl {
            for (name, value) in acl_metadata_pairs(acl, codec) {
                append(&meta_header, format!("{name}={}", pct(&value)));
            }
        }
    }
    let anchor_header = HeaderName::from_static("x-gsa-external-anchor");
    for (text, url) in &head.anchors {
        let value = match text {
            Some(text) => format!("{}={}", pct(text), url),
            None => url.to_string(),
        };
        append(&anchor_header, value);
    }
    let robots = HeaderName::from_static("x-robots-tag");
    if head.no_index {
        append(&robots, "noindex".to_string());
    }
    if head.no_follow {
        append(&robots, "nofollow".to_string());
    }
    if head.no_archive {
        append(&robots, "noarchive".to_string());
    }
    if head.crawl_once {
        append(&HeaderName::from_static("x-gsa-crawl-once"), "true".to_string());
    }
    if head.lock {
        append(&HeaderName::from_static("x-gsa-lock"), "true".to_string());
    }
    if let Some(decision) = head.transmission_decision {
        append(
            &HeaderName::from_static("x-gsa-transmission-decision"),
            decision.wire_name().to_string(),
        );
    }
}

/// The `google:acl*` metadata pairs describing one ACL.
fn acl_metadata_pairs(acl: &Acl, codec: &Arc<DocIdCodec>) -> Vec<(&'static str, String)> {
    let mut pairs: Vec<(&'static str, String)> = Vec::new();
    for user in acl.permit_users() {
        pairs.push(("google:aclusers", user.name().to_string()));
    }
    for user in acl.deny_users() {
        pairs.push(("google:acldenyusers", user.name().to_string()));
    }
    for group in acl.permit_groups() {
        pairs.push(("google:aclgroups", group.name().to_string()));
    }
    for group in acl.deny_groups() {
        pairs.push(("google:acldenygroups", group.name().to_string()));
    }
    if let Some(parent) = acl.inherit_from() {
        match codec.encode(parent) {
            Ok(mut url) => {
                if let Some(fragment) = acl.inherit_fragment() {
                    url.set_query(Some(fragment));
                }
                pairs.push(("google:aclinheritfrom", url.to_string()));
            }
            Err(err) => {
                tracing::warn!("cannot encode ACL parent {parent:?}: {err}");
            }
        }
    }
    pairs.push((
        "google:aclinheritancetype",
        acl.inheritance_type().wire_name().to_string(),
    ));
    if !acl.is_case_sensitive() {
        pairs.push((
            "google:aclcasesensitivity",
            "everything-case-insensitive".to_string(),
        ));
    }
    pairs
}

fn simple(status: StatusCode, message: &'static str) -> Response {
    (status, message).into_response()
}
