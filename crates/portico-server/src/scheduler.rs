use crate::pusher::{FullPushOutcome, Pusher};
use chrono::{DateTime, NaiveTime, Utc};
use portico_repo::Repository;
use portico_server_common::TimeOfDay;
use portico_server_lifecycle::ShutdownSubscription;
use std::sync::Arc;
use std::time::Duration;

/// The next UTC instant strictly after `now` matching the scheduled
/// time of day.
pub fn next_occurrence(now: DateTime<Utc>, at: TimeOfDay) -> DateTime<Utc> {
    let time = NaiveTime::from_hms_opt(at.hour, at.minute, at.second).unwrap_or(NaiveTime::MIN);
    let today = now.date_naive().and_time(time).and_utc();
    if today > now {
        today
    } else {
        (now.date_naive() + chrono::Days::new(1)).and_time(time).and_utc()
    }
}

/// Run the daily full-listing push until shutdown. An occurrence that
/// lands while a push is still running is skipped, not queued.
pub async fn run_full_listing_schedule(
    pusher: Arc<Pusher>,
    repo: Arc<dyn Repository>,
    schedule: TimeOfDay,
) {
    let mut shutdown = ShutdownSubscription::get();
    loop {
        let now = Utc::now();
        let next = next_occurrence(now, schedule);
        let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
        tracing::debug!("next scheduled full push at {next} ({wait:?} from now)");
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                match pusher.run_full_push(repo.as_ref()).await {
                    FullPushOutcome::AlreadyRunning => {
                        tracing::warn!("scheduled full push skipped: one is already running");
                    }
                    FullPushOutcome::Completed(status) => {
                        tracing::info!("scheduled full push completed: {status:?}");
                    }
                }
            }
            _ = shutdown.shutting_down() => return,
        }
    }
}

/// Poll the repository for recently changed ids until shutdown.
pub async fn run_incremental_polling(
    pusher: Arc<Pusher>,
    repo: Arc<dyn Repository>,
    period: Duration,
) {
    let mut shutdown = ShutdownSubscription::get();
    loop {
        tokio::select! {
            _ = tokio::time::sleep(period) => {
                if let Err(err) = repo.get_modified_doc_ids(pusher.as_ref()).await {
                    tracing::warn!("incremental listing failed: {err:#}");
                }
            }
            _ = shutdown.shutting_down() => return,
        }
    }
}
