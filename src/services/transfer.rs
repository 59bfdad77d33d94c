//! Transfer tracker
//!
//! Ephemeral progress of in-flight firmware downloads. Each download owns a
//! [`TransferGuard`]; dropping the guard removes its entry whatever the
//! outcome of the transfer was.

use log::{info, warn};
use serde::Serialize;
use std::{
    collections::{BTreeMap, HashMap},
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

pub const PUBLISH_INTERVAL: Duration = Duration::from_millis(250);

const KIB: u64 = 1024;
const MIB: u64 = 1024 * 1024;

/// Human readable size: `B`, `KB` with one decimal, `MB` with two
pub fn format_size(bytes: u64) -> String {
    if bytes < KIB {
        format!("{bytes} B")
    } else if bytes < MIB {
        format!("{:.1} KB", bytes as f64 / KIB as f64)
    } else {
        format!("{:.2} MB", bytes as f64 / MIB as f64)
    }
}

pub fn format_speed(bytes: u64, elapsed: Duration) -> String {
    let secs = elapsed.as_secs_f64();
    let per_second = if secs > 0.0 {
        (bytes as f64 / secs) as u64
    } else {
        0
    };

    format!("{}/s", format_size(per_second))
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct TransferProgress {
    pub mac: String,
    pub ip: String,
    pub percent: u8,
    pub speed: String,
    pub downloaded: u64,
    pub total: u64,
}

struct Entry {
    id: u64,
    progress: TransferProgress,
}

#[derive(Default)]
pub struct TransferTracker {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
}

impl TransferTracker {
    /// Register a transfer under `key` and return the guard that owns it
    ///
    /// A second transfer for the same key replaces the visible entry; each
    /// guard only ever removes its own entry.
    pub fn start(
        self: &Arc<Self>,
        key: &str,
        mac: &str,
        ip: &str,
        total: u64,
    ) -> TransferGuard {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let progress = TransferProgress {
            mac: mac.to_string(),
            ip: ip.to_string(),
            percent: 0,
            speed: format_speed(0, Duration::ZERO),
            downloaded: 0,
            total,
        };

        self.lock().insert(key.to_string(), Entry { id, progress });

        let now = Instant::now();
        TransferGuard {
            tracker: Arc::clone(self),
            key: key.to_string(),
            id,
            mac: mac.to_string(),
            ip: ip.to_string(),
            total,
            sent: 0,
            started: now,
            last_publish: now,
            completed: false,
        }
    }

    pub fn snapshot(&self) -> BTreeMap<String, TransferProgress> {
        self.lock()
            .iter()
            .map(|(key, entry)| (key.clone(), entry.progress.clone()))
            .collect()
    }

    pub fn get(&self, key: &str) -> Option<TransferProgress> {
        self.lock().get(key).map(|entry| entry.progress.clone())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn publish(&self, key: &str, id: u64, progress: TransferProgress) {
        if let Some(entry) = self.lock().get_mut(key).filter(|entry| entry.id == id) {
            entry.progress = progress;
        }
    }

    fn remove(&self, key: &str, id: u64) {
        let mut entries = self.lock();
        if entries.get(key).is_some_and(|entry| entry.id == id) {
            entries.remove(key);
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Progress handle of one download, removes its tracker entry on drop
pub struct TransferGuard {
    tracker: Arc<TransferTracker>,
    key: String,
    id: u64,
    mac: String,
    ip: String,
    total: u64,
    sent: u64,
    started: Instant,
    last_publish: Instant,
    completed: bool,
}

impl TransferGuard {
    /// Account for `bytes` handed to the client
    ///
    /// Progress becomes visible at most once per [`PUBLISH_INTERVAL`].
    pub fn record(&mut self, bytes: usize) {
        self.sent += bytes as u64;

        let now = Instant::now();
        if now.duration_since(self.last_publish) < PUBLISH_INTERVAL {
            return;
        }
        self.last_publish = now;
        self.tracker.publish(&self.key, self.id, self.progress(now));
    }

    /// Mark the transfer as fully delivered
    pub fn complete(&mut self) {
        self.completed = true;

        let elapsed = self.started.elapsed();
        info!(
            "transfer to {} complete: {} in {:.1}s ({})",
            self.key,
            format_size(self.sent),
            elapsed.as_secs_f64(),
            format_speed(self.sent, elapsed)
        );
    }

    pub fn sent(&self) -> u64 {
        self.sent
    }

    fn progress(&self, now: Instant) -> TransferProgress {
        let percent = match self.total {
            0 => 100,
            total => (self.sent.saturating_mul(100) / total).min(100) as u8,
        };

        TransferProgress {
            mac: self.mac.clone(),
            ip: self.ip.clone(),
            percent,
            speed: format_speed(self.sent, now.duration_since(self.started)),
            downloaded: self.sent,
            total: self.total,
        }
    }
}

impl Drop for TransferGuard {
    fn drop(&mut self) {
        if !self.completed {
            warn!(
                "transfer to {} ({}) interrupted after {}/{} bytes",
                self.key, self.ip, self.sent, self.total
            );
        }
        self.tracker.remove(&self.key, self.id);
    }
}
