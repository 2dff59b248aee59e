/// Comparison progress reporting -- lightweight messages sent from the
/// engine threads to whoever is watching (CLI spinner, log forwarder, tests).
use crate::model::{Side, Stage};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// Capacity of the progress channel. Messages beyond this are dropped rather
/// than blocking a scanner thread.
pub const PROGRESS_CHANNEL_CAPACITY: usize = 1_024;

/// Progress updates from the comparison engine.
///
/// Messages carry only counters and status; the indices and snapshots
/// themselves are returned by the comparison call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompareProgress {
    /// A stage began for one image (or for both when `side` is `None`).
    StageStarted { side: Option<Side>, stage: Stage },
    /// Periodic update while a tree is being listed.
    EntriesListed {
        side: Side,
        entries: u64,
        current_path: String,
    },
    /// Periodic update while file content is digested.
    FilesHashed { side: Side, hashed: u64, total: u64 },
    /// A unit of work failed or timed out. The comparison continues.
    UnitFailed {
        side: Option<Side>,
        stage: Stage,
        label: String,
        reason: String,
    },
    /// The comparison finished and a report is available.
    Complete { duration: Duration, partial: bool },
    /// The comparison was aborted by the caller.
    Cancelled,
}

/// Create a bounded progress channel.
pub fn progress_channel() -> (Sender<CompareProgress>, Receiver<CompareProgress>) {
    bounded(PROGRESS_CHANNEL_CAPACITY)
}

/// Optional, non-blocking progress sender.
#[derive(Debug, Clone, Default)]
pub struct ProgressSink {
    tx: Option<Sender<CompareProgress>>,
}

impl ProgressSink {
    pub fn new(tx: Sender<CompareProgress>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything.
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Send without blocking. A full or disconnected channel drops the message.
    pub fn send(&self, message: CompareProgress) {
        if let Some(tx) = &self.tx {
            let _ = tx.try_send(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_channel_drops_instead_of_blocking() {
        let (tx, rx) = bounded(1);
        let sink = ProgressSink::new(tx);
        sink.send(CompareProgress::Cancelled);
        sink.send(CompareProgress::Cancelled);
        assert_eq!(rx.try_iter().count(), 1);
    }

    #[test]
    fn disabled_sink_is_silent() {
        ProgressSink::disabled().send(CompareProgress::Cancelled);
    }
}
