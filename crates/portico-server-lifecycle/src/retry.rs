use crate::ShutdownSubscription;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;

/// How a repository failed to come up.
///
/// Transient failures (the backend is rebooting, a credential service
/// is briefly unreachable) are retried by [`StartupRetry`]; permanent
/// ones (bad configuration, unsupported backend version) abort the
/// daemon.
#[derive(Debug, Error)]
pub enum StartupError {
    #[error("transient startup failure: {0}")]
    Transient(anyhow::Error),
    #[error("permanent startup failure: {0}")]
    Permanent(anyhow::Error),
}

impl StartupError {
    pub fn transient<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Transient(err.into())
    }

    pub fn permanent<E: Into<anyhow::Error>>(err: E) -> Self {
        Self::Permanent(err.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

/// Why [`StartupRetry::run`] returned.
#[derive(Debug)]
pub enum StartupOutcome {
    /// Initialization succeeded.
    Started,
    /// A permanent error; the process should exit non-zero.
    Failed(StartupError),
    /// Shutdown was requested while waiting to retry.
    ShutDown,
}

/// Runs repository initialization until it sticks.
///
/// Failures back off exponentially, doubling from `initial_backoff`
/// up to `max_backoff`; every backoff sleep also listens for process
/// shutdown so a stuck repository cannot hold the daemon hostage.
pub struct StartupRetry {
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for StartupRetry {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(8),
            max_backoff: Duration::from_secs(3600),
        }
    }
}

impl StartupRetry {
    pub fn with_backoff(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
        }
    }

    pub async fn run<F, Fut>(&self, mut init: F) -> StartupOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<(), StartupError>>,
    {
        let mut shutdown = ShutdownSubscription::get();
        let mut backoff = self.initial_backoff;
        let mut attempt: u32 = 1;
        loop {
            if crate::is_shutting_down() {
                return StartupOutcome::ShutDown;
            }
            match init().await {
                Ok(()) => {
                    tracing::info!("initialization complete");
                    return StartupOutcome::Started;
                }
                Err(err) if err.is_permanent() => {
                    tracing::error!("giving up on initialization: {err}");
                    return StartupOutcome::Failed(err);
                }
                Err(err) => {
                    tracing::warn!(
                        "initialization attempt {attempt} failed: {err}; \
                         retrying in {backoff:?}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.shutting_down() => {
                            return StartupOutcome::ShutDown;
                        }
                    }
                    backoff = (backoff * 2).min(self.max_backoff);
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LifeCycle;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Once;

    static INIT: Once = Once::new();

    // The life cycle globals may only be initialized once per process;
    // every test that needs a shutdown subscription funnels through
    // here.
    fn ensure_lifecycle() {
        INIT.call_once(|| {
            std::mem::forget(LifeCycle::new());
        });
    }

    #[tokio::test]
    async fn retries_until_success() {
        ensure_lifecycle();
        let attempts = AtomicU32::new(0);
        let retry = StartupRetry::with_backoff(Duration::from_millis(1), Duration::from_millis(4));
        let outcome = retry
            .run(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(StartupError::transient(anyhow::anyhow!("backend not up")))
                } else {
                    Ok(())
                }
            })
            .await;
        assert!(matches!(outcome, StartupOutcome::Started));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn permanent_failure_short_circuits() {
        ensure_lifecycle();
        let attempts = AtomicU32::new(0);
        let retry = StartupRetry::with_backoff(Duration::from_millis(1), Duration::from_millis(4));
        let outcome = retry
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(StartupError::permanent(anyhow::anyhow!("bad credentials")))
            })
            .await;
        assert!(matches!(outcome, StartupOutcome::Failed(_)));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
