/// Background transfer jobs between host files and containers
///
/// A job is submitted against a node of a [`ContainerTree`]. Submission
/// marks every owner between the node and its root as busy, then runs the
/// job on its own thread. The worker reports progress and asks for
/// decisions over a bounded channel; the thread that owns the tree reads
/// [`WorkerEvent`]s from the [`JobHandle`] and answers each
/// [`ConflictQuery`] exactly once.

/// Progress events and conflict queries
pub mod channel;
/// Host-side naming and text conversion
pub mod host;
mod lock;
mod worker;

pub use channel::{
    CancelFlag, ConflictKind, ConflictQuery, Decision, ProgressEvent, WorkerEvent,
    EVENT_CHANNEL_DEPTH,
};
pub use host::PreserveMode;

use crate::error::{ContainerError, Result};
use crate::tree::{Container, ContainerTree, NodeId};
use lock::JobLock;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{info, warn};

/// What a job does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferKind {
    /// Copy host files into the container unchanged
    Add {
        /// Host files and directories
        host_paths: Vec<PathBuf>,
    },
    /// Copy host files in as Apple II text
    Import {
        /// Host files and directories
        host_paths: Vec<PathBuf>,
    },
    /// Copy entries out to host files unchanged
    Extract {
        /// Entries to copy; empty means everything
        entries: Vec<String>,
        /// Host directory receiving the files
        dest_dir: PathBuf,
    },
    /// Copy entries out, converting Apple II text to host text
    Export {
        /// Entries to copy; empty means everything
        entries: Vec<String>,
        /// Host directory receiving the files
        dest_dir: PathBuf,
    },
}

impl TransferKind {
    /// Does the job modify the container?
    pub fn writes_container(&self) -> bool {
        matches!(self, TransferKind::Add { .. } | TransferKind::Import { .. })
    }

    /// Short name for messages
    pub fn name(&self) -> &'static str {
        match self {
            TransferKind::Add { .. } => "add",
            TransferKind::Import { .. } => "import",
            TransferKind::Extract { .. } => "extract",
            TransferKind::Export { .. } => "export",
        }
    }
}

/// Behavior flags for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferFlags {
    /// Descend into host directories
    pub recurse: bool,
    /// Compress archive entries
    pub compress: bool,
    /// Drop directory components from names
    pub strip_paths: bool,
    /// How ProDOS attributes are kept on the host
    pub preserve: PreserveMode,
    /// Read filesystem files without translation
    pub raw: bool,
}

impl Default for TransferFlags {
    fn default() -> Self {
        Self {
            recurse: true,
            compress: true,
            strip_paths: false,
            preserve: PreserveMode::None,
            raw: false,
        }
    }
}

/// One transfer request
#[derive(Debug, Clone)]
pub struct TransferJob {
    /// What to do
    pub kind: TransferKind,
    /// Directory inside the container that added files go into
    pub target_dir: String,
    /// Behavior flags
    pub flags: TransferFlags,
    progress: Arc<AtomicUsize>,
}

impl TransferJob {
    /// Create a job with the given flags, targeting the container's root
    pub fn new(kind: TransferKind, flags: TransferFlags) -> Self {
        Self {
            kind,
            target_dir: String::new(),
            flags,
            progress: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Put added files into `dir`, components separated by '/'
    pub fn with_target_dir<S: Into<String>>(mut self, dir: S) -> Self {
        self.target_dir = dir.into();
        self
    }

    /// Entries processed so far; never decreases
    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Acquire)
    }

    pub(crate) fn advance(&self) -> usize {
        self.progress.fetch_add(1, Ordering::AcqRel) + 1
    }
}

/// A per-entry failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryError {
    /// Entry or host path
    pub path: String,
    /// What went wrong
    pub message: String,
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.path, self.message)
    }
}

/// Result of a finished job
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferOutcome {
    /// Entries written (zero after a rollback)
    pub completed: usize,
    /// Entries skipped by decision
    pub skipped: usize,
    /// Entries that failed
    pub failed: usize,
    /// The job was cancelled
    pub cancelled: bool,
    /// An archive transaction was discarded
    pub rolled_back: bool,
    /// Changes were saved through to the host file
    pub saved: bool,
    /// Failures in the order they happened
    pub errors: Vec<EntryError>,
}

impl TransferOutcome {
    /// Finished without failures or cancellation
    pub fn is_success(&self) -> bool {
        !self.cancelled && self.failed == 0
    }

    pub(crate) fn fail<E: fmt::Display>(&mut self, path: &str, err: E) {
        warn!(path, error = %err, "transfer failed");
        self.failed += 1;
        self.errors.push(EntryError {
            path: path.to_string(),
            message: err.to_string(),
        });
    }
}

/// A running job
#[derive(Debug)]
pub struct JobHandle {
    node: NodeId,
    events: Receiver<WorkerEvent>,
    cancel: CancelFlag,
    progress: Arc<AtomicUsize>,
    thread: JoinHandle<Result<TransferOutcome>>,
}

impl JobHandle {
    /// Node the job runs against
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Events from the worker; the receiver disconnects when the job ends
    pub fn events(&self) -> &Receiver<WorkerEvent> {
        &self.events
    }

    /// Ask the worker to stop before the next entry
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Shared cancel flag, for handing to other threads
    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    /// Entries processed so far
    pub fn progress(&self) -> usize {
        self.progress.load(Ordering::Acquire)
    }

    /// Has the worker thread finished?
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    fn join(self) -> Result<TransferOutcome> {
        drop(self.events);
        self.thread
            .join()
            .map_err(|_| ContainerError::invariant("transfer worker panicked"))?
    }
}

impl ContainerTree {
    /// Start a transfer job against `node`
    ///
    /// Fails with [`ContainerError::Busy`] if another job holds any owner
    /// between `node` and its root.
    pub fn submit(&mut self, node: NodeId, job: TransferJob) -> Result<JobHandle> {
        let chain = self.update_chain(node)?;
        if job.kind.writes_container() && self.is_read_only(node)? {
            return Err(ContainerError::ReadOnly(self.name(node)?.to_string()));
        }
        let label = self.inspect(node, |container| match container {
            Container::Archive(_) | Container::FileSystem(_) => Ok(()),
            other => Err(other.type_label()),
        })?;
        if let Err(label) = label {
            return Err(ContainerError::unsupported(format!(
                "cannot {} with a {}",
                job.kind.name(),
                label
            )));
        }

        let lock = JobLock::acquire(self.owner_flags(&chain)?)?;
        let cores = chain
            .iter()
            .map(|&n| self.core(n))
            .collect::<Result<Vec<_>>>()?;

        let cancel = CancelFlag::new();
        let (worker_channel, events) = channel::channel(cancel.clone());
        let progress = job.progress.clone();
        info!(job = job.kind.name(), node = %self.name(node)?, "starting transfer");
        let thread = thread::Builder::new()
            .name(format!("transfer-{}", job.kind.name()))
            .spawn(move || {
                let _lock = lock;
                worker::run(job, cores, worker_channel)
            })?;

        Ok(JobHandle {
            node,
            events,
            cancel,
            progress,
            thread,
        })
    }

    /// Wait for a job to end and refresh the nodes it touched
    pub fn complete_job(&mut self, handle: JobHandle) -> Result<TransferOutcome> {
        let node = handle.node;
        let outcome = handle.join()?;
        if let Ok(chain) = self.update_chain(node) {
            for id in chain {
                self.refresh_status(id);
            }
        }
        info!(
            completed = outcome.completed,
            skipped = outcome.skipped,
            failed = outcome.failed,
            cancelled = outcome.cancelled,
            "transfer finished"
        );
        Ok(outcome)
    }
}
