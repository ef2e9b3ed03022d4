use crate::dashboard::SessionMap;
use crate::http_server::{self, RequestLimiter, ServerState, TrustedHosts};
use crate::journal::Journal;
use crate::pusher::Pusher;
use anyhow::Context;
use portico_docid::DocIdCodec;
use portico_feed::{validate_datasource, FeedArchive, FeedBuilder, FeedSubmitter, FeedWorkarounds};
use portico_repo::{ExponentialBackoffHandler, Repository, RepositoryContext};
use portico_server_common::Config;
use portico_server_lifecycle::{LifeCycle, StartupOutcome, StartupRetry};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

static INSTANCE_RUNNING: AtomicBool = AtomicBool::new(false);

const STOP_GRACE: Duration = Duration::from_secs(3);

/// Two-phase daemon bring-up around one repository.
///
/// `daemon_init` validates configuration, builds the shared state and
/// binds/serves both listeners; `daemon_start` then runs repository
/// initialization in the retry loop and starts the schedulers.
/// `stop` drains the listeners and destroys the repository.
/// [`Application::run`] wires the phases to process signals and turns
/// the result into an exit code.
pub struct Application {
    config: Arc<Config>,
    repo: Arc<dyn Repository>,
    state: Option<crate::http_server::AppState>,
    doc_handle: axum_server::Handle,
    dashboard_handle: axum_server::Handle,
}

impl Application {
    pub fn new(config: Config, repo: Arc<dyn Repository>) -> Self {
        Self {
            config: Arc::new(config),
            repo,
            state: None,
            doc_handle: axum_server::Handle::new(),
            dashboard_handle: axum_server::Handle::new(),
        }
    }

    pub fn state(&self) -> Option<&crate::http_server::AppState> {
        self.state.as_ref()
    }

    /// Phase one: validate config, build state, bind sockets, start
    /// listeners. No repository code runs yet.
    pub async fn daemon_init(&mut self) -> anyhow::Result<()> {
        if self.state.is_some() {
            anyhow::bail!("daemon_init called twice");
        }
        let config = &self.config;
        config.validate()?;
        let datasource = config.str_value("feed.name").to_string();
        validate_datasource(&datasource).context("feed.name")?;

        let secure = config.bool_value("server.secure")?;
        let scheme = if secure { "https" } else { "http" };
        let port = config.u16_value("server.port")?;
        let base_url = Url::parse(&format!(
            "{scheme}://{}:{port}{}",
            config.require("server.hostname")?,
            config.str_value("server.docIdPath"),
        ))
        .context("assembling the base document URL")?;
        let codec = Arc::new(DocIdCodec::new(base_url, config.bool_value("docId.isUrl")?)?);

        let journal = Arc::new(Journal::new(config.usize_value("journal.maxUniqueIds")?));
        let submitter = FeedSubmitter::new(
            config.require("gsa.hostname")?,
            secure,
            config.bool_value("feed.gzip")?,
        )?;
        let workarounds = FeedWorkarounds {
            filler_in_record: config.bool_value("feed.fillerInRecord")?,
            httpsso_authmethod: config.bool_value("feed.httpSsoAuthMethod")?,
            crawl_immediately_override: config.opt_bool_value("feed.crawlImmediatelyBitEnabled")?,
            crawl_once_override: config.opt_bool_value("feed.noRecrawlBitEnabled")?,
        };
        let builder = FeedBuilder::new(codec.clone()).with_workarounds(workarounds);
        let archive = FeedArchive::new(
            config
                .opt_value("feed.archiveDirectory")
                .map(std::path::PathBuf::from),
        );
        let pusher = Arc::new(Pusher::new(
            Arc::new(submitter),
            builder,
            archive,
            journal.clone(),
            datasource,
            config.u64_value("feed.maxUrls")? as usize,
            Arc::new(ExponentialBackoffHandler::default()),
        ));

        let state: crate::http_server::AppState = Arc::new(ServerState {
            config: self.config.clone(),
            codec,
            repo: self.repo.clone(),
            journal,
            pusher,
            trusted: TrustedHosts::resolve(
                config.require("gsa.hostname")?,
                config.str_value("server.fullAccessHosts"),
            ),
            mark_all_docs_public: config.bool_value("adaptor.markAllDocsAsPublic")?,
            watchdog: config.duration_secs("adaptor.docContentTimeoutSecs")?,
            limiter: RequestLimiter::new(
                config.usize_value("server.maxWorkerThreads")?,
                config.usize_value("server.queueCapacity")?,
            ),
            sessions: SessionMap::default(),
        });

        let doc_listener = http_server::bind(port)?;
        let dashboard_listener = http_server::bind(config.u16_value("server.dashboardPort")?)?;
        http_server::serve(
            doc_listener,
            http_server::doc_router(state.clone()),
            self.doc_handle.clone(),
        )?;
        http_server::serve(
            dashboard_listener,
            http_server::dashboard_router(state.clone()),
            self.dashboard_handle.clone(),
        )?;
        tracing::info!(
            "listening for documents on :{port}, dashboard on :{}",
            config.u16_value("server.dashboardPort")?
        );
        self.state = Some(state);
        Ok(())
    }

    /// Phase two: repository init under the startup retry loop, then
    /// the schedulers and (optionally) a startup full push.
    pub async fn daemon_start(&self) -> anyhow::Result<StartupOutcome> {
        let state = self
            .state
            .as_ref()
            .context("daemon_start before daemon_init")?;
        let context = RepositoryContext {
            config: self.config.clone(),
            pusher: state.pusher.clone(),
            codec: state.codec.clone(),
        };
        let repo = self.repo.clone();
        let outcome = StartupRetry::default()
            .run(|| {
                let repo = repo.clone();
                let context = context.clone();
                async move { repo.init(context).await }
            })
            .await;
        if !matches!(outcome, StartupOutcome::Started) {
            return Ok(outcome);
        }

        if self.config.bool_value("adaptor.pushDocIdsOnStartup")? {
            let pusher = state.pusher.clone();
            let repo = self.repo.clone();
            tokio::spawn(async move {
                pusher.run_full_push(repo.as_ref()).await;
            });
        }
        tokio::spawn(crate::scheduler::run_full_listing_schedule(
            state.pusher.clone(),
            self.repo.clone(),
            self.config.time_of_day("adaptor.fullListingSchedule")?,
        ));
        if self.repo.supports_incremental() {
            tokio::spawn(crate::scheduler::run_incremental_polling(
                state.pusher.clone(),
                self.repo.clone(),
                self.config.duration_secs("adaptor.incrementalPollPeriodSecs")?,
            ));
        }
        Ok(StartupOutcome::Started)
    }

    /// Stop accepting, give in-flight requests a grace period, then
    /// release the repository.
    pub async fn stop(&self, grace: Duration) {
        self.doc_handle.graceful_shutdown(Some(grace));
        self.dashboard_handle.graceful_shutdown(Some(grace));
        self.repo.destroy().await;
    }

    /// The whole daemon life: init, start, wait for a shutdown
    /// signal, stop. Returns the process exit code.
    pub async fn run(config: Config, repo: Arc<dyn Repository>) -> anyhow::Result<u8> {
        if INSTANCE_RUNNING.swap(true, Ordering::SeqCst) {
            anyhow::bail!("an Application instance is already running in this process");
        }
        let mut life_cycle = LifeCycle::new();
        let mut app = Application::new(config, repo);
        app.daemon_init().await?;

        let app = Arc::new(app);
        let startup = {
            let app = app.clone();
            tokio::spawn(async move {
                let outcome = match app.daemon_start().await {
                    Ok(outcome) => outcome,
                    Err(err) => {
                        tracing::error!("startup failed: {err:#}");
                        LifeCycle::request_shutdown().await;
                        return 1u8;
                    }
                };
                match outcome {
                    StartupOutcome::Started => 0,
                    StartupOutcome::ShutDown => 0,
                    StartupOutcome::Failed(err) => {
                        tracing::error!("startup failed permanently: {err}");
                        LifeCycle::request_shutdown().await;
                        1
                    }
                }
            })
        };

        life_cycle.wait_for_shutdown().await;
        app.stop(STOP_GRACE).await;
        tracing::info!("shutdown complete");
        let code = startup.await.unwrap_or(1);
        INSTANCE_RUNNING.store(false, Ordering::SeqCst);
        Ok(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Once;

    static LIFECYCLE: Once = Once::new();

    fn ensure_lifecycle() {
        LIFECYCLE.call_once(|| {
            std::mem::forget(LifeCycle::new());
        });
    }

    struct StubRepo;

    #[async_trait]
    impl Repository for StubRepo {
        async fn init(
            &self,
            context: RepositoryContext,
        ) -> Result<(), portico_repo::StartupError> {
            // The context carries the layered config through to
            // repository code.
            assert_eq!(context.config.value("myrepo.root"), Some("/srv/files"));
            Ok(())
        }

        async fn get_doc_ids(
            &self,
            _pusher: &dyn portico_repo::DocIdPusher,
        ) -> anyhow::Result<()> {
            Ok(())
        }

        async fn get_doc_content(
            &self,
            _request: &portico_repo::DocRequest,
            _response: &mut portico_repo::DocResponse,
        ) -> anyhow::Result<()> {
            anyhow::bail!("not used")
        }
    }

    fn test_config() -> Config {
        Config::of([
            ("gsa.hostname", "127.0.0.1"),
            ("server.hostname", "localhost"),
            // Ephemeral ports so tests never collide.
            ("server.port", "0"),
            ("server.dashboardPort", "0"),
            ("adaptor.pushDocIdsOnStartup", "false"),
            ("myrepo.root", "/srv/files"),
        ])
    }

    #[tokio::test]
    async fn init_and_start_bring_the_daemon_up() {
        ensure_lifecycle();
        let mut app = Application::new(test_config(), Arc::new(StubRepo));
        app.daemon_init().await.unwrap();
        // Second phase runs repository init and the schedulers.
        let outcome = app.daemon_start().await.unwrap();
        assert!(matches!(outcome, StartupOutcome::Started));
        app.stop(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn double_init_is_refused() {
        ensure_lifecycle();
        let mut app = Application::new(test_config(), Arc::new(StubRepo));
        app.daemon_init().await.unwrap();
        let err = app.daemon_init().await.unwrap_err();
        assert!(err.to_string().contains("twice"));
        app.stop(Duration::from_millis(10)).await;
    }

    #[tokio::test]
    async fn bad_feed_name_fails_init() {
        let mut app = Application::new(
            Config::of([
                ("gsa.hostname", "127.0.0.1"),
                ("feed.name", "not valid!"),
                ("server.port", "0"),
                ("server.dashboardPort", "0"),
            ]),
            Arc::new(StubRepo),
        );
        assert!(app.daemon_init().await.is_err());
    }
}
