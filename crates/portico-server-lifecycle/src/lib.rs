//! Process life cycle management: graceful shutdown, and the retry
//! loop that brings a repository up.
//!
//! See <https://tokio.rs/tokio/topics/shutdown> for the general shape.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{LazyLock, Mutex, OnceLock};
use std::time::Duration;
use tokio::signal::unix::SignalKind;
use tokio::sync::mpsc::{Receiver as MPSCReceiver, Sender as MPSCSender};
use tokio::sync::watch::{Receiver as WatchReceiver, Sender as WatchSender};
use uuid::Uuid;

mod retry;

pub use retry::{StartupError, StartupOutcome, StartupRetry};

static ACTIVE: OnceLock<Mutex<Option<Activity>>> = OnceLock::new();
static SHUTTING_DOWN: AtomicBool = AtomicBool::new(false);
static STOPPING: OnceLock<ShutdownState> = OnceLock::new();

static ACTIVE_LABELS: LazyLock<Mutex<HashMap<Uuid, String>>> = LazyLock::new(Mutex::default);

/// Represents some activity which cannot be ruthlessly interrupted:
/// a feed push in flight, a document being served. Obtain one via
/// [`Activity::get`] and hold it for the duration of the work. While
/// any Activity instances are alive,
/// [`LifeCycle::wait_for_shutdown`] cannot complete.
pub struct Activity {
    tx: MPSCSender<()>,
    uuid: Uuid,
}

impl std::fmt::Debug for Activity {
    fn fmt(&self, fmt: &mut std::fmt::Formatter) -> std::fmt::Result {
        fmt.debug_struct("Activity").finish()
    }
}

impl Drop for Activity {
    fn drop(&mut self) {
        ACTIVE_LABELS.lock().unwrap().remove(&self.uuid);
    }
}

impl Activity {
    /// Obtain an Activity instance.
    /// If None is returned then the process is shutting down
    /// and no new activity can be initiated.
    pub fn get_opt(label: String) -> Option<Self> {
        let uuid = Uuid::new_v4();
        let active = ACTIVE.get()?.lock().unwrap();
        let activity = active.as_ref()?;
        ACTIVE_LABELS.lock().unwrap().insert(uuid, label);
        Some(Activity {
            tx: activity.tx.clone(),
            uuid,
        })
    }

    /// Obtain an Activity instance.
    /// Returns Err if the process is shutting down and no new
    /// activity can be initiated.
    pub fn get(label: String) -> anyhow::Result<Self> {
        Self::get_opt(label).ok_or_else(|| anyhow::anyhow!("shutting down"))
    }

    /// Returns true if the process is shutting down.
    pub fn is_shutting_down(&self) -> bool {
        SHUTTING_DOWN.load(Ordering::Relaxed)
    }
}

pub fn is_shutting_down() -> bool {
    SHUTTING_DOWN.load(Ordering::Relaxed)
}

/// A short rendering of the outstanding activities, for the periodic
/// still-waiting report.
fn outstanding_activities() -> (usize, String) {
    let labels = ACTIVE_LABELS.lock().unwrap();
    let mut summary: String = labels
        .values()
        .take(10)
        .map(String::as_str)
        .collect::<Vec<&str>>()
        .join(", ");
    if labels.len() > 10 {
        summary.push_str(&format!(" (and {} others)", labels.len() - 10));
    }
    (labels.len(), summary)
}

struct ShutdownState {
    tx: WatchSender<()>,
    rx: WatchReceiver<()>,
    request_shutdown_tx: MPSCSender<()>,
    stop_requested: AtomicBool,
}

/// ShutdownSubscription can be used by code that is idling. Select on
/// your timeout and [`ShutdownSubscription::shutting_down`] to wake up
/// when either the timeout expires or the process is about to stop.
pub struct ShutdownSubscription {
    rx: WatchReceiver<()>,
}

impl ShutdownSubscription {
    /// Obtain a shutdown subscription.
    pub fn get() -> Self {
        Self {
            rx: STOPPING.get().unwrap().rx.clone(),
        }
    }

    /// As [`ShutdownSubscription::get`], but None when no
    /// [`LifeCycle`] has been created in this process.
    pub fn try_get() -> Option<Self> {
        STOPPING.get().map(|state| Self {
            rx: state.rx.clone(),
        })
    }

    /// Await the shutdown of the process.
    pub async fn shutting_down(&mut self) {
        self.rx.changed().await.ok();
    }
}

/// The LifeCycle struct represents the life cycle of this server
/// process. Creating an instance of it prepares the global state of
/// the process and allows other code to work with [`Activity`] and
/// [`ShutdownSubscription`].
pub struct LifeCycle {
    activity_rx: MPSCReceiver<()>,
    request_shutdown_rx: MPSCReceiver<()>,
}

impl LifeCycle {
    /// Initialize the process life cycle.
    /// May be called only once; will panic if called multiple times.
    pub fn new() -> Self {
        let (activity_tx, activity_rx) = tokio::sync::mpsc::channel(1);
        let uuid = Uuid::new_v4();
        ACTIVE_LABELS
            .lock()
            .unwrap()
            .insert(uuid, "Root LifeCycle".to_string());
        ACTIVE
            .set(Mutex::new(Some(Activity {
                tx: activity_tx,
                uuid,
            })))
            .map_err(|_| ())
            .unwrap();

        let (request_shutdown_tx, request_shutdown_rx) = tokio::sync::mpsc::channel(1);

        let (tx, rx) = tokio::sync::watch::channel(());
        STOPPING
            .set(ShutdownState {
                tx,
                rx,
                request_shutdown_tx,
                stop_requested: AtomicBool::new(false),
            })
            .map_err(|_| ())
            .unwrap();

        Self {
            activity_rx,
            request_shutdown_rx,
        }
    }

    /// Request that we shut down the process.
    /// This will cause the wait_for_shutdown method on the process
    /// LifeCycle instance to wake up and initiate the shutdown
    /// procedure.
    pub async fn request_shutdown() {
        tracing::debug!("shutdown has been requested");
        if let Some(state) = STOPPING.get() {
            if state.stop_requested.compare_exchange(
                false,
                true,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) == Ok(false)
            {
                state.request_shutdown_tx.send(()).await.ok();
            }
        } else {
            tracing::error!("request_shutdown: STOPPING channel is unavailable");
        }
    }

    /// Wait for a shutdown request, then propagate that state to
    /// running tasks, and then wait for those tasks to complete
    /// before returning to the caller.
    ///
    /// Shutdown is triggered by SIGTERM, ctrl-c, or
    /// [`LifeCycle::request_shutdown`]. SIGHUP is *not* a shutdown:
    /// configuration is fixed for the life of the process and the log
    /// filter is changed through the dashboard, so it is acknowledged
    /// and ignored rather than inherited as a stop signal.
    pub async fn wait_for_shutdown(&mut self) {
        tracing::debug!("Waiting for interrupt");
        let mut sig_term =
            tokio::signal::unix::signal(SignalKind::terminate()).expect("listen for SIGTERM");
        let mut sig_hup =
            tokio::signal::unix::signal(SignalKind::hangup()).expect("listen for SIGHUP");

        loop {
            tokio::select! {
                _ = sig_term.recv() => break,
                _ = tokio::signal::ctrl_c() => break,
                _ = self.request_shutdown_rx.recv() => break,
                _ = sig_hup.recv() => {
                    tracing::info!(
                        "SIGHUP ignored: restart to pick up configuration changes, \
                         or adjust the log filter via the dashboard"
                    );
                }
            }
        }
        tracing::debug!("wait_for_shutdown: shutdown requested!");
        tracing::info!(
            "Shutdown requested, please wait while running feed pushes wrap up \
             and in-flight document requests complete."
        );
        // Signal that we are stopping
        tracing::debug!("Signal tasks that we are stopping");
        SHUTTING_DOWN.store(true, Ordering::SeqCst);
        ACTIVE.get().map(|a| a.lock().unwrap().take());
        STOPPING.get().map(|s| s.tx.send(()).ok());
        // Wait for all pending activity to finish
        tracing::debug!("Waiting for tasks to wrap up");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(15)) => {
                    let (count, summary) = outstanding_activities();
                    tracing::info!("Still waiting for {count} pending activities... {summary}");
                }
                _ = self.activity_rx.recv() => {
                    return
                }
            }
        }
    }
}
