use chrono::{DateTime, Utc};
use dashmap::DashSet;
use parking_lot::Mutex;
use portico_docid::DocId;
use prometheus::IntCounter;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::LazyLock;
use std::time::Duration;

static IDS_PUSHED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "portico_ids_pushed_total",
        "total number of document ids pushed to the appliance"
    )
    .unwrap()
});

static REQUESTS_SERVED: LazyLock<IntCounter> = LazyLock::new(|| {
    prometheus::register_int_counter!(
        "portico_doc_requests_total",
        "total number of document requests received"
    )
    .unwrap()
});

/// How the most recent full push ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum PushStatus {
    Success,
    /// The push was cut short (shutdown, or the repository failed
    /// before yielding anything).
    Interruption,
    Failure,
}

/// A sum over a sliding window, kept as per-second buckets.
struct SlidingWindow {
    span: Duration,
    buckets: Mutex<VecDeque<(u64, u64, u64)>>, // (second, count, value sum)
}

impl SlidingWindow {
    fn new(span: Duration) -> Self {
        Self {
            span,
            buckets: Mutex::new(VecDeque::new()),
        }
    }

    fn now_second() -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }

    fn add(&self, value: u64) {
        let second = Self::now_second();
        let mut buckets = self.buckets.lock();
        match buckets.back_mut() {
            Some((s, count, sum)) if *s == second => {
                *count += 1;
                *sum += value;
            }
            _ => buckets.push_back((second, 1, value)),
        }
        let horizon = second.saturating_sub(self.span.as_secs());
        while buckets.front().is_some_and(|(s, _, _)| *s < horizon) {
            buckets.pop_front();
        }
    }

    /// (event count, value sum) over the window.
    fn totals(&self) -> (u64, u64) {
        let horizon = Self::now_second().saturating_sub(self.span.as_secs());
        let buckets = self.buckets.lock();
        buckets
            .iter()
            .filter(|(s, _, _)| *s >= horizon)
            .fold((0, 0), |(c, v), (_, count, sum)| (c + count, v + sum))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct WindowSnapshot {
    pub requests: u64,
    pub avg_latency_millis: u64,
}

/// Everything the dashboard shows about one running process.
#[derive(Debug, Clone, Serialize)]
pub struct JournalSnapshot {
    pub ids_pushed_total: u64,
    pub ids_pushed_unique: u64,
    pub gsa_requests_total: u64,
    pub other_requests_total: u64,
    pub requests_unique: u64,
    pub last_minute: WindowSnapshot,
    pub last_hour: WindowSnapshot,
    pub last_day: WindowSnapshot,
    pub last_full_push_start: Option<DateTime<Utc>>,
    pub last_full_push_end: Option<DateTime<Utc>>,
    pub last_push_status: Option<PushStatus>,
}

/// Process-wide operational counters.
///
/// Unique-id tracking is capped: past `max_unique_ids` distinct ids
/// the sets stop growing and the unique counts go stale, trading
/// accuracy for bounded memory on enormous repositories.
pub struct Journal {
    max_unique_ids: usize,
    ids_pushed_total: AtomicU64,
    ids_pushed_unique: DashSet<DocId>,
    gsa_requests_total: AtomicU64,
    other_requests_total: AtomicU64,
    requests_unique: DashSet<DocId>,
    minute: SlidingWindow,
    hour: SlidingWindow,
    day: SlidingWindow,
    last_full_push_start: Mutex<Option<DateTime<Utc>>>,
    last_full_push_end: Mutex<Option<DateTime<Utc>>>,
    last_push_status: Mutex<Option<PushStatus>>,
}

impl Journal {
    pub fn new(max_unique_ids: usize) -> Self {
        Self {
            max_unique_ids,
            ids_pushed_total: AtomicU64::new(0),
            ids_pushed_unique: DashSet::new(),
            gsa_requests_total: AtomicU64::new(0),
            other_requests_total: AtomicU64::new(0),
            requests_unique: DashSet::new(),
            minute: SlidingWindow::new(Duration::from_secs(60)),
            hour: SlidingWindow::new(Duration::from_secs(60 * 60)),
            day: SlidingWindow::new(Duration::from_secs(60 * 60 * 24)),
            last_full_push_start: Mutex::new(None),
            last_full_push_end: Mutex::new(None),
            last_push_status: Mutex::new(None),
        }
    }

    pub fn record_ids_pushed(&self, ids: impl Iterator<Item = DocId>) {
        let mut n = 0;
        for id in ids {
            n += 1;
            if self.ids_pushed_unique.len() < self.max_unique_ids {
                self.ids_pushed_unique.insert(id);
            }
        }
        self.ids_pushed_total.fetch_add(n, Ordering::Relaxed);
        IDS_PUSHED.inc_by(n);
    }

    pub fn record_request(&self, doc_id: Option<&DocId>, from_appliance: bool) {
        if from_appliance {
            self.gsa_requests_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.other_requests_total.fetch_add(1, Ordering::Relaxed);
        }
        REQUESTS_SERVED.inc();
        if let Some(doc_id) = doc_id {
            if self.requests_unique.len() < self.max_unique_ids {
                self.requests_unique.insert(doc_id.clone());
            }
        }
    }

    pub fn record_request_latency(&self, latency: Duration) {
        let millis = latency.as_millis() as u64;
        self.minute.add(millis);
        self.hour.add(millis);
        self.day.add(millis);
    }

    pub fn record_full_push_start(&self) {
        *self.last_full_push_start.lock() = Some(Utc::now());
    }

    pub fn record_full_push_end(&self, status: PushStatus) {
        *self.last_full_push_end.lock() = Some(Utc::now());
        *self.last_push_status.lock() = Some(status);
    }

    pub fn last_push_status(&self) -> Option<PushStatus> {
        *self.last_push_status.lock()
    }

    pub fn snapshot(&self) -> JournalSnapshot {
        let window = |w: &SlidingWindow| {
            let (count, sum) = w.totals();
            WindowSnapshot {
                requests: count,
                avg_latency_millis: if count == 0 { 0 } else { sum / count },
            }
        };
        JournalSnapshot {
            ids_pushed_total: self.ids_pushed_total.load(Ordering::Relaxed),
            ids_pushed_unique: self.ids_pushed_unique.len() as u64,
            gsa_requests_total: self.gsa_requests_total.load(Ordering::Relaxed),
            other_requests_total: self.other_requests_total.load(Ordering::Relaxed),
            requests_unique: self.requests_unique.len() as u64,
            last_minute: window(&self.minute),
            last_hour: window(&self.hour),
            last_day: window(&self.day),
            last_full_push_start: *self.last_full_push_start.lock(),
            last_full_push_end: *self.last_full_push_end.lock(),
            last_push_status: *self.last_push_status.lock(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pushed_id_accounting() {
        let journal = Journal::new(1000);
        journal.record_ids_pushed([DocId::new("a"), DocId::new("b")].into_iter());
        journal.record_ids_pushed([DocId::new("a")].into_iter());
        let snap = journal.snapshot();
        assert_eq!(snap.ids_pushed_total, 3);
        assert_eq!(snap.ids_pushed_unique, 2);
    }

    #[test]
    fn request_accounting_splits_by_origin() {
        let journal = Journal::new(1000);
        let id = DocId::new("doc");
        journal.record_request(Some(&id), true);
        journal.record_request(Some(&id), true);
        journal.record_request(None, false);
        journal.record_request_latency(Duration::from_millis(30));
        journal.record_request_latency(Duration::from_millis(50));
        let snap = journal.snapshot();
        assert_eq!(snap.gsa_requests_total, 2);
        assert_eq!(snap.other_requests_total, 1);
        assert_eq!(snap.requests_unique, 1);
        assert_eq!(snap.last_minute.requests, 2);
        assert_eq!(snap.last_minute.avg_latency_millis, 40);
        assert_eq!(snap.last_day.requests, 2);
    }

    #[test]
    fn unique_tracking_is_bounded() {
        let journal = Journal::new(3);
        journal.record_ids_pushed((0..10).map(|n| DocId::new(format!("doc{n}"))));
        let snap = journal.snapshot();
        assert_eq!(snap.ids_pushed_total, 10);
        assert!(snap.ids_pushed_unique <= 4);
    }

    #[test]
    fn push_status_is_remembered() {
        let journal = Journal::new(10);
        assert!(journal.last_push_status().is_none());
        journal.record_full_push_start();
        journal.record_full_push_end(PushStatus::Interruption);
        let snap = journal.snapshot();
        assert!(snap.last_full_push_start.is_some());
        assert_eq!(snap.last_push_status, Some(PushStatus::Interruption));
    }
}
