/// Progress events and conflict queries sent from a worker to the interactive side

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use tracing::debug;

/// Number of events a worker can queue before it waits for the reader
pub const EVENT_CHANNEL_DEPTH: usize = 64;

/// Answer to a conflict query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Replace the existing item, or proceed despite the problem
    Overwrite,
    /// Leave this entry alone and continue with the next
    Skip,
    /// Stop the whole job
    Cancel,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Decision::Overwrite => "overwrite",
            Decision::Skip => "skip",
            Decision::Cancel => "cancel",
        };
        f.write_str(s)
    }
}

/// What a conflict query is about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    /// The destination already has an item with this name
    NameCollision,
    /// A path component is longer than the destination allows
    PathTooLong,
    /// The destination cannot store the resource fork
    ResourceForkIgnored,
    /// File attributes could not be set on the destination
    AttributeFailure,
}

impl ConflictKind {
    /// Choices offered for this kind, in display order
    pub fn choices(self) -> &'static [Decision] {
        &[Decision::Overwrite, Decision::Skip, Decision::Cancel]
    }

    /// Label for the `Overwrite` choice
    pub fn proceed_label(self) -> &'static str {
        match self {
            ConflictKind::NameCollision => "overwrite",
            ConflictKind::PathTooLong => "shorten",
            ConflictKind::ResourceForkIgnored | ConflictKind::AttributeFailure => "continue",
        }
    }
}

/// Request for a decision, answered exactly once
///
/// Dropping a query without answering it counts as [`Decision::Cancel`].
#[derive(Debug)]
pub struct ConflictQuery {
    kind: ConflictKind,
    path: String,
    message: String,
    reply: SyncSender<Decision>,
}

impl ConflictQuery {
    /// What the query is about
    pub fn kind(&self) -> ConflictKind {
        self.kind
    }

    /// Entry the query concerns
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Message for the user
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Choices the user may pick from
    pub fn choices(&self) -> &'static [Decision] {
        self.kind.choices()
    }

    /// Deliver the decision to the waiting worker
    pub fn answer(self, decision: Decision) {
        if self.reply.send(decision).is_err() {
            debug!(path = %self.path, "worker stopped before the answer arrived");
        }
    }
}

/// Progress report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Percentage of entries processed
    pub percent: u8,
    /// Entry being processed
    pub path: String,
    /// Entries processed so far
    pub processed: usize,
}

/// Everything a worker sends, in order
#[derive(Debug)]
pub enum WorkerEvent {
    /// Progress update
    Progress(ProgressEvent),
    /// A decision is needed; the worker waits for the answer
    Query(ConflictQuery),
}

/// Cooperative cancellation request, checked once per entry
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    /// Create an unset flag
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Worker end of the event channel
#[derive(Debug)]
pub struct WorkerChannel {
    events: SyncSender<WorkerEvent>,
    cancel: CancelFlag,
}

/// Create a connected worker channel and event receiver
pub fn channel(cancel: CancelFlag) -> (WorkerChannel, Receiver<WorkerEvent>) {
    let (events, receiver) = mpsc::sync_channel(EVENT_CHANNEL_DEPTH);
    (WorkerChannel { events, cancel }, receiver)
}

impl WorkerChannel {
    /// Has cancellation been requested?
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Send a progress event; a vanished reader is ignored
    pub fn progress(&self, processed: usize, total: usize, path: &str) {
        let percent = if total == 0 {
            100
        } else {
            (processed.min(total) * 100 / total) as u8
        };
        let event = ProgressEvent {
            percent,
            path: path.to_string(),
            processed,
        };
        let _ = self.events.send(WorkerEvent::Progress(event));
    }

    /// Post a query and wait for the decision
    ///
    /// If the reader has gone away, or drops the query, the answer is
    /// [`Decision::Cancel`].
    pub fn ask(&self, kind: ConflictKind, path: &str, message: String) -> Decision {
        let (reply, answer) = mpsc::sync_channel(1);
        let query = ConflictQuery {
            kind,
            path: path.to_string(),
            message,
            reply,
        };
        if self.events.send(WorkerEvent::Query(query)).is_err() {
            return Decision::Cancel;
        }
        let decision = answer.recv().unwrap_or(Decision::Cancel);
        debug!(path, ?kind, %decision, "conflict resolved");
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_query_answered_once() {
        let (worker, events) = channel(CancelFlag::new());
        let handle = thread::spawn(move || {
            worker.progress(1, 4, "A");
            worker.ask(ConflictKind::NameCollision, "B", "B exists".to_string())
        });

        match events.recv().unwrap() {
            WorkerEvent::Progress(p) => assert_eq!((p.percent, p.path.as_str()), (25, "A")),
            other => panic!("unexpected {:?}", other),
        }
        match events.recv().unwrap() {
            WorkerEvent::Query(q) => {
                assert_eq!(q.kind(), ConflictKind::NameCollision);
                assert_eq!(q.choices().len(), 3);
                q.answer(Decision::Skip);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(handle.join().unwrap(), Decision::Skip);
    }

    #[test]
    fn test_dropped_query_cancels() {
        let (worker, events) = channel(CancelFlag::new());
        let handle = thread::spawn(move || worker.ask(ConflictKind::PathTooLong, "X", String::new()));
        drop(events.recv().unwrap());
        assert_eq!(handle.join().unwrap(), Decision::Cancel);
    }

    #[test]
    fn test_missing_reader_cancels() {
        let (worker, events) = channel(CancelFlag::new());
        drop(events);
        assert_eq!(worker.ask(ConflictKind::NameCollision, "X", String::new()), Decision::Cancel);
    }

    #[test]
    fn test_cancel_flag_shared() {
        let flag = CancelFlag::new();
        let (worker, _events) = channel(flag.clone());
        assert!(!worker.is_cancelled());
        flag.cancel();
        assert!(worker.is_cancelled());
    }
}
