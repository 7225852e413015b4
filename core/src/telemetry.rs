use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "input_core=info,runner_container=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters shared by the claim forwarders, the commit loop and the run loop.
#[derive(Debug, Default)]
pub struct InputMetrics {
    records_forwarded: AtomicU64,
    callback_failures: AtomicU64,
    positions_submitted: AtomicU64,
    positions_dropped: AtomicU64,
    duplicate_positions: AtomicU64,
    commits: AtomicU64,
    commit_failures: AtomicU64,
    sessions_started: AtomicU64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub records_forwarded: u64,
    pub callback_failures: u64,
    pub positions_submitted: u64,
    pub positions_dropped: u64,
    pub duplicate_positions: u64,
    pub commits: u64,
    pub commit_failures: u64,
    pub sessions_started: u64,
}

impl InputMetrics {
    pub fn record_forwarded(&self) {
        self.records_forwarded.fetch_add(1, Ordering::Relaxed);
    }

    pub fn callback_failed(&self) {
        self.callback_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn position_submitted(&self) {
        self.positions_submitted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn position_dropped(&self) {
        self.positions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn duplicate_position(&self) {
        self.duplicate_positions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn committed(&self) {
        self.commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn commit_failed(&self) {
        self.commit_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_started(&self) {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            records_forwarded: self.records_forwarded.load(Ordering::Relaxed),
            callback_failures: self.callback_failures.load(Ordering::Relaxed),
            positions_submitted: self.positions_submitted.load(Ordering::Relaxed),
            positions_dropped: self.positions_dropped.load(Ordering::Relaxed),
            duplicate_positions: self.duplicate_positions.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            commit_failures: self.commit_failures.load(Ordering::Relaxed),
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
        }
    }
}
