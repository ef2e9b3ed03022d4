use crate::dashboard::SessionMap;
use crate::http_server::{AppState, RequestLimiter, ServerState, TrustedHosts};
use crate::journal::Journal;
use crate::pusher::Pusher;
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::Request;
use axum::response::Response;
use axum::Router;
use portico_docid::DocIdCodec;
use portico_feed::{
    FeedArchive, FeedBuilder, FeedClient, GroupFeedType, SubmitError,
};
use portico_repo::{ExponentialBackoffHandler, Repository};
use std::net::SocketAddr;
use std::sync::Arc;
use tower::ServiceExt;
use url::Url;

pub(crate) const GSA_PEER: &str = "10.0.0.7:19000";
pub(crate) const OTHER_PEER: &str = "10.9.9.9:40000";

pub(crate) struct NullFeedClient;

#[async_trait]
impl FeedClient for NullFeedClient {
    async fn send_metadata_and_url(&self, _: &str, _: &str) -> Result<(), SubmitError> {
        Ok(())
    }

    async fn send_group_definitions(
        &self,
        _: &str,
        _: GroupFeedType,
        _: &str,
    ) -> Result<(), SubmitError> {
        Ok(())
    }
}

pub(crate) fn test_codec() -> Arc<DocIdCodec> {
    Arc::new(DocIdCodec::new(Url::parse("http://localhost:5678/doc/").unwrap(), false).unwrap())
}

pub(crate) fn test_state(repo: Arc<dyn Repository>, extra: &[(&str, &str)]) -> AppState {
    let mut pairs: Vec<(&str, &str)> = vec![("gsa.hostname", "10.0.0.7")];
    pairs.extend_from_slice(extra);
    let config = Arc::new(portico_server_common::Config::of(pairs));
    let codec = test_codec();
    let journal = Arc::new(Journal::new(1000));
    let pusher = Arc::new(Pusher::new(
        Arc::new(NullFeedClient),
        FeedBuilder::new(codec.clone()),
        FeedArchive::new(None),
        journal.clone(),
        "testing".to_string(),
        100,
        Arc::new(ExponentialBackoffHandler::default()),
    ));
    let mark_all_docs_public = config.bool_value("adaptor.markAllDocsAsPublic").unwrap();
    let watchdog = config.duration_secs("adaptor.docContentTimeoutSecs").unwrap();
    Arc::new(ServerState {
        config,
        codec,
        repo,
        journal,
        pusher,
        trusted: TrustedHosts::of(vec![
            "10.0.0.7".parse().unwrap(),
            "127.0.0.1".parse().unwrap(),
        ]),
        mark_all_docs_public,
        watchdog,
        limiter: RequestLimiter::new(16, 16),
        sessions: SessionMap::default(),
    })
}

pub(crate) async fn send(
    router: &Router,
    method: &str,
    path: &str,
    peer: &str,
    headers: &[(&str, &str)],
    body: &str,
) -> Response {
    let mut builder = Request::builder().method(method).uri(path);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    let mut request = builder.body(Body::from(body.to_string())).unwrap();
    let peer: SocketAddr = peer.parse().unwrap();
    request.extensions_mut().insert(ConnectInfo(peer));
    router.clone().oneshot(request).await.unwrap()
}

pub(crate) async fn body_string(response: Response) -> String {
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    String::from_utf8_lossy(&bytes).to_string()
}

pub(crate) fn header_values(response: &Response, name: &str) -> Vec<String> {
    response
        .headers()
        .get_all(name)
        .iter()
        .map(|value| value.to_str().unwrap().to_string())
        .collect()
}
