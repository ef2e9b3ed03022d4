use async_trait::async_trait;
use portico_acl::{Acl, Principal};
use portico_docid::DocId;
use portico_feed::{GroupFeedType, Record, SubmitError};
use std::collections::BTreeMap;
use std::time::Duration;

/// What to do about a failed feed submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { backoff: Duration },
    GiveUp,
}

/// Retry policy for feed pushes: a pure function of the error and the
/// 1-origin attempt count. The pusher sleeps the returned backoff
/// (watching for shutdown) before trying the batch again.
pub trait PushErrorHandler: Send + Sync {
    fn handle(&self, error: &SubmitError, attempt: u32) -> RetryDecision;
}

/// The default policy: exponential backoff with a cap, giving up
/// after a bounded number of tries.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffHandler {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_tries: u32,
}

impl Default for ExponentialBackoffHandler {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(300),
            max_tries: 12,
        }
    }
}

impl PushErrorHandler for ExponentialBackoffHandler {
    fn handle(&self, _error: &SubmitError, attempt: u32) -> RetryDecision {
        if attempt >= self.max_tries {
            return RetryDecision::GiveUp;
        }
        let doublings = attempt.saturating_sub(1).min(16);
        let backoff = self
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff);
        RetryDecision::Retry { backoff }
    }
}

/// The push contract handed to repository code.
///
/// Every method submits in batches, applies the error handler per
/// batch, and returns the first item that could not be delivered
/// (None when everything went out). A per-call handler overrides the
/// process default.
#[async_trait]
pub trait DocIdPusher: Send + Sync {
    async fn push_records(
        &self,
        records: Vec<Record>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> anyhow::Result<Option<Record>>;

    /// Convenience wrapper over [`DocIdPusher::push_records`] for
    /// repositories that only know ids.
    async fn push_doc_ids(
        &self,
        ids: Vec<DocId>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> anyhow::Result<Option<DocId>> {
        let records = ids.into_iter().map(Record::add).collect();
        Ok(self
            .push_records(records, handler)
            .await?
            .map(|record| record.doc_id().clone()))
    }

    /// Publish ACLs under their own ids (named resources).
    async fn push_named_resources(
        &self,
        resources: BTreeMap<DocId, Acl>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> anyhow::Result<Option<DocId>>;

    /// Publish group memberships to `source` (the connector's feed
    /// name when None).
    async fn push_group_definitions(
        &self,
        groups: BTreeMap<Principal, Vec<Principal>>,
        case_sensitive: bool,
        feed_type: GroupFeedType,
        source: Option<&str>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> anyhow::Result<Option<Principal>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transport_error() -> SubmitError {
        SubmitError::FailedToConnect {
            url: url::Url::parse("http://gsa.example.com:19900/xmlfeed").unwrap(),
            reason: "connection refused".to_string(),
        }
    }

    #[test]
    fn backoff_doubles_to_the_cap() {
        let handler = ExponentialBackoffHandler {
            initial_backoff: Duration::from_secs(2),
            max_backoff: Duration::from_secs(10),
            max_tries: 6,
        };
        let err = transport_error();
        let backoffs: Vec<Duration> = (1..6)
            .map(|attempt| match handler.handle(&err, attempt) {
                RetryDecision::Retry { backoff } => backoff,
                RetryDecision::GiveUp => panic!("gave up at attempt {attempt}"),
            })
            .collect();
        assert_eq!(
            backoffs,
            vec![
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(8),
                Duration::from_secs(10),
                Duration::from_secs(10),
            ]
        );
        assert_eq!(handler.handle(&err, 6), RetryDecision::GiveUp);
    }
}
