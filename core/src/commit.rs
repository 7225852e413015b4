//! Offset commits driven by the host's "lowest processed position" reports.
//!
//! The host calls in with a [`PendingPosition`] whenever it likes, often on a
//! timer and often with no new progress. Reports go through a bounded queue so
//! the host is never blocked for longer than the submit timeout, and a single
//! [`CommitLoop`] per group session turns them into broker commits.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, mpsc};
use tracing::{debug, info, warn};

use crate::errors::KafkaError;
use crate::position;
use crate::source::GroupSession;
use crate::telemetry::InputMetrics;

/// The lowest position the host has fully processed, across all partitions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingPosition {
    /// Event id of the record the host has processed up to.
    pub event_id: u64,
    /// Encoded `topic:partition:offset` list.
    pub gtid: String,
}

#[derive(Debug)]
pub(crate) enum CommitSignal {
    Position(PendingPosition),
    Shutdown,
}

type SharedReceiver = Arc<AsyncMutex<mpsc::Receiver<CommitSignal>>>;

pub struct OffsetCommitQueue {
    sender: mpsc::Sender<CommitSignal>,
    receiver: SharedReceiver,
    submit_timeout: Duration,
    metrics: Arc<InputMetrics>,
}

impl OffsetCommitQueue {
    pub fn new(capacity: usize, submit_timeout: Duration, metrics: Arc<InputMetrics>) -> Self {
        let (sender, receiver) = mpsc::channel(capacity);
        Self {
            sender,
            receiver: Arc::new(AsyncMutex::new(receiver)),
            submit_timeout,
            metrics,
        }
    }

    /// Hands a position to the commit loop, or the shutdown sentinel for `None`.
    ///
    /// Waits at most the submit timeout for room in the queue. A position that
    /// still does not fit is dropped: the host reports again later with an
    /// equal or newer position, so losing one report only delays a commit.
    pub async fn submit(&self, position: Option<PendingPosition>) {
        let signal = match position {
            Some(position) => {
                self.metrics.position_submitted();
                CommitSignal::Position(position)
            }
            None => CommitSignal::Shutdown,
        };

        if let Err(e) = self.sender.send_timeout(signal, self.submit_timeout).await {
            self.metrics.position_dropped();
            warn!(
                timeout_ms = self.submit_timeout.as_millis() as u64,
                error = %e,
                "Commit queue full, dropping position"
            );
        }
    }

    /// Enqueues the shutdown sentinel if there is room, without waiting.
    pub fn try_shutdown(&self) {
        if self.sender.try_send(CommitSignal::Shutdown).is_err() {
            debug!("Commit queue full, shutdown sentinel not enqueued");
        }
    }

    pub(crate) fn commit_loop(&self, max_consecutive_failures: u32) -> CommitLoop {
        CommitLoop {
            receiver: Arc::clone(&self.receiver),
            max_consecutive_failures,
            metrics: Arc::clone(&self.metrics),
        }
    }
}

pub struct CommitLoop {
    receiver: SharedReceiver,
    max_consecutive_failures: u32,
    metrics: Arc<InputMetrics>,
}

impl CommitLoop {
    /// Drains the queue into broker commits until the session ends.
    ///
    /// Returns an error only after `max_consecutive_failures` commit sequences
    /// in a row have failed; in that case the session is cancelled too.
    pub async fn run(self, session: Arc<dyn GroupSession>) -> Result<(), KafkaError> {
        let cancel = session.cancellation();

        // A previous session's loop may still hold the receiver while it winds down.
        let mut receiver = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            receiver = self.receiver.lock() => receiver,
        };

        info!("Commit loop starting");
        let mut last_event_id: u64 = 0;
        let mut consecutive_failures: u32 = 0;

        loop {
            let signal = tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Session ended, commit loop exiting");
                    return Ok(());
                }
                signal = receiver.recv() => signal,
            };

            let pending = match signal {
                Some(CommitSignal::Position(pending)) => pending,
                Some(CommitSignal::Shutdown) | None => {
                    debug!("Commit queue shut down, commit loop exiting");
                    return Ok(());
                }
            };

            // The host re-sends the same floor position while nothing moves.
            // Event ids can be reset to a lower value, so only equality counts.
            if pending.event_id == last_event_id {
                self.metrics.duplicate_position();
                continue;
            }

            let outcome = commit_position(session.as_ref(), &pending, &self.metrics);
            last_event_id = pending.event_id;

            match outcome {
                Ok(()) => consecutive_failures = 0,
                Err(e) => {
                    consecutive_failures += 1;
                    if self.max_consecutive_failures > 0
                        && consecutive_failures >= self.max_consecutive_failures
                    {
                        warn!(
                            consecutive_failures,
                            error = %e,
                            "Offset commits keep failing, ending group session"
                        );
                        cancel.cancel();
                        return Err(KafkaError::OffsetCommit {
                            reason: format!(
                                "{consecutive_failures} consecutive commit failures, last: {e}"
                            ),
                        });
                    }
                }
            }
        }
    }
}

// Marks and commits each decoded partition in turn; a failure on one
// partition does not stop the others. Returns the last failure, if any.
fn commit_position(
    session: &dyn GroupSession,
    pending: &PendingPosition,
    metrics: &InputMetrics,
) -> Result<(), KafkaError> {
    let mut last_error = None;

    for position in position::decode(&pending.gtid) {
        let offset = position.commit_offset();
        session.mark_offset(&position.topic, position.partition, offset);
        match session.commit() {
            Ok(()) => {
                metrics.committed();
                debug!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset,
                    event_id = pending.event_id,
                    "Committed offset"
                );
            }
            Err(e) => {
                metrics.commit_failed();
                warn!(
                    topic = %position.topic,
                    partition = position.partition,
                    offset,
                    error = %e,
                    "Offset commit failed"
                );
                last_error = Some(e);
            }
        }
    }

    match last_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}
