use chrono::Utc;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// Optionally keeps a copy of every feed that leaves the process.
///
/// When no directory is configured this is a no-op. Archiving is best
/// effort: an unwritable directory is logged, never fatal, because the
/// feed itself already left (or failed) independently.
pub struct FeedArchive {
    dir: Option<PathBuf>,
    sequence: AtomicU64,
}

impl FeedArchive {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self {
            dir,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.dir.is_some()
    }

    pub fn save(&self, datasource: &str, xml: &str, failed: bool) {
        let Some(dir) = &self.dir else {
            return;
        };
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let stamp = Utc::now().format("%Y%m%d%H%M%S");
        let prefix = if failed { "FAILED-" } else { "" };
        let path = dir.join(format!("{prefix}{datasource}-{stamp}-{seq}.xml"));
        if let Err(err) = std::fs::write(&path, xml) {
            tracing::warn!("could not archive feed to {}: {err}", path.display());
        }
    }
}
