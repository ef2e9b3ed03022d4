//! The contract between the framework and a repository adaptor.
//!
//! A repository implements [`Repository`]; the framework hands it a
//! pusher for announcing document ids, and per-request [`DocRequest`]
//! / [`DocResponse`] handles for serving content. Everything else —
//! listeners, feeds, scheduling, authorization plumbing — lives in
//! the server crates.
use async_trait::async_trait;
use portico_acl::{AuthnIdentity, AuthzStatus, BatchRetriever};
use portico_docid::{DocId, DocIdCodec};
use portico_server_common::Config;
use std::collections::HashMap;
use std::sync::Arc;

mod push;
mod request;
mod response;

pub use portico_server_lifecycle::StartupError;
pub use push::{DocIdPusher, ExponentialBackoffHandler, PushErrorHandler, RetryDecision};
pub use request::DocRequest;
pub use response::{
    DocResponse, ResponseBody, ResponseError, ResponseHead, ResponseState, ResponseStatus,
    ResponseTransport, TransmissionDecision, BODY_CHUNK_SIZE,
};

/// Everything a repository gets to keep from initialization.
#[derive(Clone)]
pub struct RepositoryContext {
    pub config: Arc<Config>,
    pub pusher: Arc<dyn DocIdPusher>,
    pub codec: Arc<DocIdCodec>,
}

/// The repository-specific half of an adaptor.
///
/// Implementations must be cheap to share: the server calls
/// `get_doc_content` concurrently from many worker tasks.
#[async_trait]
pub trait Repository: Send + Sync + 'static {
    /// Bring the repository connection up. Transient failures are
    /// retried by the startup loop with growing backoff; permanent
    /// ones abort the daemon.
    async fn init(&self, context: RepositoryContext) -> Result<(), StartupError>;

    /// Push every known document id. Runs on the full-listing
    /// schedule and optionally at startup.
    async fn get_doc_ids(&self, pusher: &dyn DocIdPusher) -> anyhow::Result<()>;

    /// Serve one document through the response handle.
    async fn get_doc_content(
        &self,
        request: &DocRequest,
        response: &mut DocResponse,
    ) -> anyhow::Result<()>;

    /// Whether [`Repository::get_modified_doc_ids`] does anything;
    /// gates the incremental polling task.
    fn supports_incremental(&self) -> bool {
        false
    }

    /// Push recently changed ids. Called every incremental poll
    /// period when [`Repository::supports_incremental`] is true.
    async fn get_modified_doc_ids(&self, _pusher: &dyn DocIdPusher) -> anyhow::Result<()> {
        Ok(())
    }

    /// Late-bound authorization for the batch authz endpoint. None
    /// means every request is answered Indeterminate.
    fn authorizer(&self) -> Option<Arc<dyn Authorizer>> {
        None
    }

    /// Release repository resources during shutdown.
    async fn destroy(&self) {}
}

/// Decides, for an authenticated identity, which of the given
/// documents it may see.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn is_authorized(
        &self,
        identity: &AuthnIdentity,
        ids: &[DocId],
    ) -> anyhow::Result<HashMap<DocId, AuthzStatus>>;
}

/// An [`Authorizer`] for repositories whose security is fully
/// described by ACL chains: fetch the chains through a
/// [`BatchRetriever`] and fold them.
pub struct AclBatchAuthorizer {
    retriever: Arc<dyn BatchRetriever>,
}

impl AclBatchAuthorizer {
    pub fn new(retriever: Arc<dyn BatchRetriever>) -> Self {
        Self { retriever }
    }
}

#[async_trait]
impl Authorizer for AclBatchAuthorizer {
    async fn is_authorized(
        &self,
        identity: &AuthnIdentity,
        ids: &[DocId],
    ) -> anyhow::Result<HashMap<DocId, AuthzStatus>> {
        portico_acl::is_authorized_batch(identity, ids, self.retriever.as_ref()).await
    }
}
