use crate::journal::{Journal, PushStatus};
use async_trait::async_trait;
use portico_acl::{Acl, Principal};
use portico_docid::DocId;
use portico_feed::{
    AclItem, FeedArchive, FeedBuilder, FeedClient, FeedItem, GroupFeedType, Record,
};
use portico_repo::{DocIdPusher, PushErrorHandler, Repository, RetryDecision};
use portico_server_lifecycle::{Activity, ShutdownSubscription};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Result of asking for a full listing push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FullPushOutcome {
    Completed(PushStatus),
    /// Another full push holds the process-wide slot; nothing was
    /// queued. Ask again later.
    AlreadyRunning,
}

enum FeedKind {
    MetadataAndUrl,
    Groups(GroupFeedType),
}

enum SendOutcome {
    Sent,
    GaveUp,
}

/// Drives the repository → appliance data plane.
///
/// Items are cut into batches of at most `max_urls`; each batch is
/// one feed, submitted in input order. A failing batch is retried
/// under the error handler's policy; on give-up the call returns the
/// first item of that batch and later batches are not attempted.
/// Direct pushes serialize on a process-wide lock, and at most one
/// full listing crawl runs at a time.
pub struct Pusher {
    client: Arc<dyn FeedClient>,
    builder: FeedBuilder,
    archive: FeedArchive,
    journal: Arc<Journal>,
    datasource: String,
    max_urls: usize,
    default_handler: Arc<dyn PushErrorHandler>,
    push_lock: tokio::sync::Mutex<()>,
    full_push_running: AtomicBool,
    pushed_since_start: AtomicBool,
}

impl Pusher {
    pub fn new(
        client: Arc<dyn FeedClient>,
        builder: FeedBuilder,
        archive: FeedArchive,
        journal: Arc<Journal>,
        datasource: String,
        max_urls: usize,
        default_handler: Arc<dyn PushErrorHandler>,
    ) -> Self {
        Self {
            client,
            builder,
            archive,
            journal,
            datasource,
            max_urls,
            default_handler,
            push_lock: tokio::sync::Mutex::new(()),
            full_push_running: AtomicBool::new(false),
            pushed_since_start: AtomicBool::new(false),
        }
    }

    pub fn is_full_push_running(&self) -> bool {
        self.full_push_running.load(Ordering::SeqCst)
    }

    /// Run one full listing crawl: the repository enumerates every id
    /// through this pusher. Only one can run at a time process-wide;
    /// an overlapping request returns [`FullPushOutcome::AlreadyRunning`]
    /// immediately rather than queueing.
    pub async fn run_full_push(&self, repo: &dyn Repository) -> FullPushOutcome {
        if self.full_push_running.swap(true, Ordering::SeqCst) {
            return FullPushOutcome::AlreadyRunning;
        }
        self.pushed_since_start.store(false, Ordering::SeqCst);
        self.journal.record_full_push_start();
        tracing::info!("full listing push starting");
        let status = match repo.get_doc_ids(self).await {
            Ok(()) => PushStatus::Success,
            Err(err) => {
                let yielded = self.pushed_since_start.load(Ordering::SeqCst);
                if !yielded || portico_server_lifecycle::is_shutting_down() {
                    tracing::warn!("full listing push interrupted: {err:#}");
                    PushStatus::Interruption
                } else {
                    tracing::error!("full listing push failed: {err:#}");
                    PushStatus::Failure
                }
            }
        };
        tracing::info!("full listing push finished: {status:?}");
        self.journal.record_full_push_end(status);
        self.full_push_running.store(false, Ordering::SeqCst);
        FullPushOutcome::Completed(status)
    }

    async fn push_items(
        &self,
        items: Vec<FeedItem>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> anyhow::Result<Option<FeedItem>> {
        let _serialize = self.push_lock.lock().await;
        if portico_server_lifecycle::is_shutting_down() {
            anyhow::bail!("push interrupted: shutting down");
        }
        let _activity = Activity::get_opt("feed push".to_string());
        self.pushed_since_start.store(true, Ordering::SeqCst);
        let handler = handler.unwrap_or_else(|| self.default_handler.as_ref());
        let batches = items.len().div_ceil(self.max_urls);
        for (index, batch) in items.chunks(self.max_urls).enumerate() {
            let xml = self.builder.metadata_and_url_feed(&self.datasource, batch)?;
            tracing::debug!(
                "submitting feed {}/{batches} with {} items",
                index + 1,
                batch.len()
            );
            match self
                .submit_with_retry(&self.datasource, FeedKind::MetadataAndUrl, &xml, handler)
                .await?
            {
                SendOutcome::Sent => {
                    self.journal
                        .record_ids_pushed(batch.iter().map(|item| match item {
                            FeedItem::Record(record) => record.doc_id().clone(),
                            FeedItem::Acl(acl_item) => acl_item.doc_id.clone(),
                        }));
                }
                SendOutcome::GaveUp => return Ok(batch.first().cloned()),
            }
        }
        Ok(None)
    }

    async fn submit_with_retry(
        &self,
        datasource: &str,
        kind: FeedKind,
        xml: &str,
        handler: &dyn PushErrorHandler,
    ) -> anyhow::Result<SendOutcome> {
        let mut attempt: u32 = 1;
        loop {
            let result = match kind {
                FeedKind::MetadataAndUrl => {
                    self.client.send_metadata_and_url(datasource, xml).await
                }
                FeedKind::Groups(feed_type) => {
                    self.client
                        .send_group_definitions(datasource, feed_type, xml)
                        .await
                }
            };
            match result {
                Ok(()) => {
                    self.archive.save(datasource, xml, false);
                    return Ok(SendOutcome::Sent);
                }
                Err(err) if err.is_transport() => match handler.handle(&err, attempt) {
                    RetryDecision::Retry { backoff } => {
                        tracing::warn!(
                            "feed submission attempt {attempt} failed: {err}; \
                             retrying in {backoff:?}"
                        );
                        if !sleep_or_shutdown(backoff).await {
                            anyhow::bail!("push interrupted: shutting down");
                        }
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => {
                        tracing::warn!(
                            "feed submission failed after {attempt} attempts: {err}; giving up"
                        );
                        self.archive.save(datasource, xml, true);
                        return Ok(SendOutcome::GaveUp);
                    }
                },
                Err(err) => {
                    self.archive.save(datasource, xml, true);
                    return Err(err.into());
                }
            }
        }
    }
}

async fn sleep_or_shutdown(backoff: Duration) -> bool {
    match ShutdownSubscription::try_get() {
        Some(mut subscription) => tokio::select! {
            _ = tokio::time::sleep(backoff) => true,
            _ = subscription.shutting_down() => false,
        },
        None => {
            tokio::time::sleep(backoff).await;
            true
        }
    }
}

#[async_trait]
impl DocIdPusher for Pusher {
    async fn push_records(
        &self,
        records: Vec<Record>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> anyhow::Result<Option<Record>> {
        let items = records.into_iter().map(FeedItem::from).collect();
        Ok(match self.push_items(items, handler).await? {
            Some(FeedItem::Record(record)) => Some(record),
            _ => None,
        })
    }

    async fn push_named_resources(
        &self,
        resources: BTreeMap<DocId, Acl>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> anyhow::Result<Option<DocId>> {
        let items = resources
            .into_iter()
            .map(|(doc_id, acl)| AclItem::new(doc_id, acl).into())
            .collect();
        Ok(match self.push_items(items, handler).await? {
            Some(FeedItem::Acl(item)) => Some(item.doc_id),
            _ => None,
        })
    }

    async fn push_group_definitions(
        &self,
        groups: BTreeMap<Principal, Vec<Principal>>,
        case_sensitive: bool,
        feed_type: GroupFeedType,
        source: Option<&str>,
        handler: Option<&dyn PushErrorHandler>,
    ) -> anyhow::Result<Option<Principal>> {
        let _serialize = self.push_lock.lock().await;
        if portico_server_lifecycle::is_shutting_down() {
            anyhow::bail!("push interrupted: shutting down");
        }
        let _activity = Activity::get_opt("group definitions push".to_string());
        let handler = handler.unwrap_or_else(|| self.default_handler.as_ref());
        let datasource = source.unwrap_or(&self.datasource);
        let entries: Vec<(Principal, Vec<Principal>)> = groups.into_iter().collect();
        for (index, chunk) in entries.chunks(self.max_urls).enumerate() {
            let map: BTreeMap<Principal, Vec<Principal>> = chunk.iter().cloned().collect();
            let xml = self.builder.group_definitions_feed(&map, case_sensitive)?;
            // Only the first feed of a REPLACE may wipe the source's
            // existing definitions; the remainder of the same push
            // appends to it.
            let kind = match (feed_type, index) {
                (GroupFeedType::Replace, 0) => GroupFeedType::Replace,
                _ => GroupFeedType::Incremental,
            };
            match self
                .submit_with_retry(datasource, FeedKind::Groups(kind), &xml, handler)
                .await?
            {
                SendOutcome::Sent => {}
                SendOutcome::GaveUp => {
                    return Ok(chunk.first().map(|(group, _)| group.clone()))
                }
            }
        }
        Ok(None)
    }
}
