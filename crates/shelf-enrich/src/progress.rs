//! Progress events and the broadcast channel that carries them.
//!
//! The aggregator emits a `ProgressEvent` for every merged entity. Events flow
//! through a `tokio::sync::broadcast` channel to any number of subscribers
//! (progress bar, JSON log). With no subscriber, events are dropped.

use serde::{Deserialize, Serialize};

/// A progress event emitted while a job runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub job_id: String,
    /// Monotonically increasing sequence number.
    pub seq: u64,
    pub event: ProgressEventKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ProgressEventKind {
    /// Dispatch is about to begin.
    JobStarted { total: usize, pool_width: usize },
    /// One entity's result was written into the dataset.
    EntityMerged {
        index: usize,
        key: String,
        title: String,
        success: bool,
        reason: Option<String>,
        done: usize,
        failed: usize,
    },
    /// Every dispatched entity was merged.
    JobComplete {
        done: usize,
        failed: usize,
        elapsed_ms: u64,
    },
    /// A non-fatal warning.
    Warning { message: String },
}

pub type ProgressSender = tokio::sync::broadcast::Sender<ProgressEvent>;

pub type ProgressReceiver = tokio::sync::broadcast::Receiver<ProgressEvent>;

/// Create a progress channel. Slow subscribers lag rather than block the job.
pub fn channel() -> (ProgressSender, ProgressReceiver) {
    tokio::sync::broadcast::channel(1024)
}

/// Emit an event, ignoring the error returned when nobody listens.
pub fn emit(tx: &Option<ProgressSender>, job_id: &str, seq: &mut u64, event: ProgressEventKind) {
    if let Some(ref sender) = tx {
        *seq += 1;
        let _ = sender.send(ProgressEvent {
            job_id: job_id.to_string(),
            seq: *seq,
            event,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ProgressEvent {
            job_id: "job-1".to_string(),
            seq: 3,
            event: ProgressEventKind::EntityMerged {
                index: 2,
                key: "40042001".to_string(),
                title: "Children of Blood and Bone".to_string(),
                success: true,
                reason: None,
                done: 3,
                failed: 0,
            },
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"EntityMerged\""));
        assert!(json.contains("40042001"));
    }

    #[test]
    fn test_emit_increments_seq() {
        let (tx, mut rx) = channel();
        let tx = Some(tx);
        let mut seq = 0;
        emit(&tx, "job", &mut seq, ProgressEventKind::JobStarted { total: 2, pool_width: 1 });
        emit(&tx, "job", &mut seq, ProgressEventKind::Warning { message: "w".into() });
        assert_eq!(seq, 2);
        assert_eq!(rx.try_recv().unwrap().seq, 1);
        assert_eq!(rx.try_recv().unwrap().seq, 2);
    }

    #[test]
    fn test_emit_without_receivers() {
        let (tx, rx) = channel();
        drop(rx);
        let mut seq = 0;
        emit(&Some(tx), "job", &mut seq, ProgressEventKind::Warning { message: "x".into() });
        assert_eq!(seq, 1);
    }

    #[test]
    fn test_emit_none_sender() {
        let mut seq = 0;
        emit(&None, "job", &mut seq, ProgressEventKind::Warning { message: "x".into() });
        assert_eq!(seq, 0);
    }
}
