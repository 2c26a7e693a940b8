/// Container tree: an arena of nested containers and the streams they own

/// Recursive discovery of nested containers
pub mod builder;
/// Heuristic filter for nested candidates
pub mod filter;
/// Node contents and lifecycle types
pub mod node;
pub(crate) mod update;

pub use builder::{DepthPolicy, ScanOptions, TreeBuilder, MAX_NESTING_DEPTH};
pub use filter::nested_candidate;
pub use node::{
    Container, NodeCore, NodeState, NodeStatus, Origin, Ownership, PendingNode, SharedCore,
};

use crate::error::{ContainerError, Result};
use crate::format::extension_of;
use crate::io::SharedStream;
use std::fs::OpenOptions;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};
use tracing::{debug, error, info, warn};

/// Handle to a node in a [`ContainerTree`]
///
/// Handles stay valid until the node is detached; after that they are
/// rejected with [`ContainerError::StaleNode`], even if the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// Change notification for whoever displays the tree
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeEvent {
    /// A node was attached
    NodeAdded {
        /// The new node
        node: NodeId,
        /// Its parent, or `None` for a root
        parent: Option<NodeId>,
    },
    /// A node was detached
    NodeRemoved {
        /// The removed node
        node: NodeId,
    },
    /// A node's status or read-only flag changed
    StatusChanged {
        /// The node
        node: NodeId,
        /// New status
        status: NodeStatus,
        /// New read-only flag
        read_only: bool,
    },
}

/// Snapshot of a node for display
#[derive(Debug, Clone)]
pub struct NodeInfo {
    /// Type label
    pub label: String,
    /// Display name
    pub name: String,
    /// Status from validity notes
    pub status: NodeStatus,
    /// Writes are refused
    pub read_only: bool,
    /// Lifecycle state
    pub state: NodeState,
    /// Node owns its backing stream
    pub owns_stream: bool,
    /// Parent node
    pub parent: Option<NodeId>,
    /// Child nodes
    pub children: Vec<NodeId>,
    /// Validity notes, formatted
    pub notes: Vec<String>,
}

struct Entry {
    label: String,
    name: String,
    status: NodeStatus,
    read_only: bool,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    core: SharedCore,
    busy: Option<Arc<AtomicBool>>,
}

struct Slot {
    generation: u32,
    entry: Option<Entry>,
}

/// Arena of container nodes
///
/// The tree is owned by a single thread. Transfer jobs get their own handles
/// to node cores and mark the owners they use as busy; anything the tree
/// does to a busy node fails with [`ContainerError::Busy`] instead of
/// blocking.
pub struct ContainerTree {
    slots: Vec<Slot>,
    free: Vec<u32>,
    roots: Vec<NodeId>,
    events: Vec<TreeEvent>,
    options: ScanOptions,
}

fn try_lock<'a>(core: &'a SharedCore, name: &str) -> Result<MutexGuard<'a, NodeCore>> {
    match core.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::WouldBlock) => Err(ContainerError::Busy(name.to_string())),
        Err(TryLockError::Poisoned(_)) => Err(ContainerError::invariant(format!("node {} is poisoned", name))),
    }
}

impl ContainerTree {
    /// Create an empty tree that opens files with `options`
    pub fn new(options: ScanOptions) -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            roots: Vec::new(),
            events: Vec::new(),
            options,
        }
    }

    /// Scan options used when opening
    pub fn options(&self) -> ScanOptions {
        self.options
    }

    /// Change the scan options for later opens
    pub fn set_options(&mut self, options: ScanOptions) {
        self.options = options;
    }

    /// Open a host file and attach it as a new root
    ///
    /// The file is opened for writing when permissions allow; otherwise it
    /// is opened read-only and the root is marked read-only.
    pub fn open_file<P: AsRef<Path>>(&mut self, path: P) -> Result<NodeId> {
        let path = path.as_ref();
        let (file, writable) = match OpenOptions::new().read(true).write(true).open(path) {
            Ok(file) => (file, true),
            Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
                (OpenOptions::new().read(true).open(path)?, false)
            }
            Err(e) => return Err(e.into()),
        };

        let hint = path.to_string_lossy();
        let ext = extension_of(&hint);
        let origin = Origin::Host {
            path: Some(path.to_path_buf()),
        };
        let pending = TreeBuilder::new(self.options).build(SharedStream::new(file), &hint, &ext, origin)?;
        info!(path = %path.display(), nodes = pending.node_count(), "opened");
        let id = self.attach(pending, None)?;
        if !writable {
            self.force_read_only(id);
        }
        Ok(id)
    }

    /// Identify an in-memory stream and attach it as a new root
    pub fn open_stream(&mut self, stream: SharedStream, name: &str) -> Result<NodeId> {
        let ext = extension_of(name);
        let pending =
            TreeBuilder::new(self.options).build(stream, name, &ext, Origin::Host { path: None })?;
        self.attach(pending, None)
    }

    /// Insert a built subtree under `parent`, or as a root
    ///
    /// Children of a read-only node are read-only too.
    pub fn attach(&mut self, pending: PendingNode, parent: Option<NodeId>) -> Result<NodeId> {
        let inherited = match parent {
            Some(p) => self.entry(p)?.read_only,
            None => false,
        };
        let id = self.insert(pending, parent, inherited);
        match parent {
            Some(p) => self.entry_mut(p)?.children.push(id),
            None => self.roots.push(id),
        }
        Ok(id)
    }

    fn insert(&mut self, pending: PendingNode, parent: Option<NodeId>, inherited: bool) -> NodeId {
        let PendingNode {
            label,
            name,
            core,
            children,
        } = pending;
        let status = NodeStatus::from_notes(core.container.notes());
        let read_only = inherited || core.container.is_read_only();
        let busy = core.ownership.as_ref().map(|o| o.busy.clone());

        let entry = Entry {
            label,
            name,
            status,
            read_only,
            parent,
            children: Vec::new(),
            core: Arc::new(Mutex::new(core)),
            busy,
        };
        let id = match self.free.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                slot.entry = Some(entry);
                NodeId {
                    index,
                    generation: slot.generation,
                }
            }
            None => {
                self.slots.push(Slot {
                    generation: 0,
                    entry: Some(entry),
                });
                NodeId {
                    index: self.slots.len() as u32 - 1,
                    generation: 0,
                }
            }
        };
        self.events.push(TreeEvent::NodeAdded { node: id, parent });

        let child_ids: Vec<NodeId> = children
            .into_iter()
            .map(|child| self.insert(child, Some(id), read_only))
            .collect();
        if let Some(entry) = self.slots[id.index as usize].entry.as_mut() {
            entry.children = child_ids;
        }
        id
    }

    fn entry(&self, id: NodeId) -> Result<&Entry> {
        self.slots
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .ok_or(ContainerError::StaleNode)
    }

    fn entry_mut(&mut self, id: NodeId) -> Result<&mut Entry> {
        self.slots
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(ContainerError::StaleNode)
    }

    fn force_read_only(&mut self, id: NodeId) {
        for node in self.subtree(id) {
            if let Ok(entry) = self.entry_mut(node) {
                if !entry.read_only {
                    entry.read_only = true;
                    let event = TreeEvent::StatusChanged {
                        node,
                        status: entry.status,
                        read_only: true,
                    };
                    self.events.push(event);
                }
            }
        }
    }

    /// Node and all its descendants, children before parents
    fn subtree(&self, id: NodeId) -> Vec<NodeId> {
        let mut out = Vec::new();
        self.collect_post_order(id, &mut out);
        out
    }

    fn collect_post_order(&self, id: NodeId, out: &mut Vec<NodeId>) {
        if let Ok(entry) = self.entry(id) {
            for &child in &entry.children {
                self.collect_post_order(child, out);
            }
            out.push(id);
        }
    }

    /// Node and its ancestors, from the node up to its root
    pub(crate) fn update_chain(&self, id: NodeId) -> Result<Vec<NodeId>> {
        let mut chain = vec![id];
        let mut current = self.entry(id)?.parent;
        while let Some(parent) = current {
            chain.push(parent);
            current = self.entry(parent)?.parent;
        }
        Ok(chain)
    }

    pub(crate) fn core(&self, id: NodeId) -> Result<SharedCore> {
        Ok(self.entry(id)?.core.clone())
    }

    /// Busy flags of the owners among `ids`
    pub(crate) fn owner_flags(&self, ids: &[NodeId]) -> Result<Vec<(String, Arc<AtomicBool>)>> {
        let mut flags = Vec::new();
        for &id in ids {
            let entry = self.entry(id)?;
            if let Some(busy) = &entry.busy {
                flags.push((entry.name.clone(), busy.clone()));
            }
        }
        Ok(flags)
    }

    fn check_idle(&self, ids: &[NodeId]) -> Result<()> {
        for (name, busy) in self.owner_flags(ids)? {
            if busy.load(Ordering::Acquire) {
                return Err(ContainerError::Busy(name));
            }
        }
        Ok(())
    }

    /// Remove a node and its subtree, releasing the streams they own
    ///
    /// Fails without changing anything if a node in the subtree has unsaved
    /// changes or is in use by a transfer job.
    pub fn detach(&mut self, id: NodeId) -> Result<()> {
        let doomed = self.subtree(id);
        if doomed.is_empty() {
            return Err(ContainerError::StaleNode);
        }
        self.check_idle(&doomed)?;
        for &node in &doomed {
            let entry = self.entry(node)?;
            let core = try_lock(&entry.core, &entry.name)?;
            if core.state == NodeState::Dirty {
                warn!(node = %entry.name, "refusing to close a node with unsaved changes");
                return Err(ContainerError::UnsavedChanges(entry.name.clone()));
            }
        }

        let parent = self.entry(id)?.parent;
        match parent {
            Some(p) => self.entry_mut(p)?.children.retain(|&c| c != id),
            None => self.roots.retain(|&r| r != id),
        }
        for node in doomed {
            let slot = &mut self.slots[node.index as usize];
            if let Some(entry) = slot.entry.take() {
                if let Ok(mut core) = entry.core.lock() {
                    core.state = NodeState::Closed;
                }
                debug!(node = %entry.name, "closed");
            }
            self.free.push(node.index);
            self.events.push(TreeEvent::NodeRemoved { node });
        }
        Ok(())
    }

    /// Detach every root
    ///
    /// Every root is attempted; the first failure is returned.
    pub fn close_all(&mut self) -> Result<()> {
        let mut result = Ok(());
        for root in self.roots.clone() {
            if let Err(e) = self.detach(root) {
                error!(error = %e, "unable to close tree");
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }

    /// Write pending changes of `id` through every owner up to the host file
    pub fn save_updates(&mut self, id: NodeId, compress: bool) -> Result<()> {
        let chain = self.update_chain(id)?;
        self.check_idle(&chain)?;

        let cores: Vec<(String, SharedCore)> = chain
            .iter()
            .map(|&n| self.entry(n).map(|e| (e.name.clone(), e.core.clone())))
            .collect::<Result<_>>()?;
        {
            let mut guards = Vec::with_capacity(cores.len());
            for (name, core) in &cores {
                guards.push(try_lock(core, name)?);
            }
            let mut refs: Vec<&mut NodeCore> = guards.iter_mut().map(|g| &mut **g).collect();
            update::propagate(&mut refs, compress)?;
        }
        self.mark_views_saved(id);
        for node in chain {
            self.refresh_status(node);
        }
        Ok(())
    }

    /// Views under `id` share its stream, so saving it saves them
    fn mark_views_saved(&self, id: NodeId) {
        let Ok(entry) = self.entry(id) else {
            return;
        };
        for &child in &entry.children {
            let Ok(child_entry) = self.entry(child) else {
                continue;
            };
            if child_entry.busy.is_some() {
                continue;
            }
            if let Ok(mut core) = child_entry.core.try_lock() {
                if core.state == NodeState::Dirty {
                    core.state = NodeState::Saved;
                }
            }
            self.mark_views_saved(child);
        }
    }

    /// Record an edit made to a node's contents
    pub fn mark_dirty(&mut self, id: NodeId) -> Result<()> {
        let entry = self.entry(id)?;
        try_lock(&entry.core, &entry.name)?.mark_dirty();
        Ok(())
    }

    /// Run `f` on a node's container for reading
    pub fn inspect<R>(&self, id: NodeId, f: impl FnOnce(&Container) -> R) -> Result<R> {
        let entry = self.entry(id)?;
        let core = try_lock(&entry.core, &entry.name)?;
        Ok(f(&core.container))
    }

    /// Run `f` on a node's container for writing and mark the node dirty
    ///
    /// The change is not durable until [`ContainerTree::save_updates`].
    pub fn edit<R>(&mut self, id: NodeId, f: impl FnOnce(&mut Container) -> Result<R>) -> Result<R> {
        let chain = self.update_chain(id)?;
        self.check_idle(&chain)?;
        let entry = self.entry(id)?;
        if entry.read_only {
            return Err(ContainerError::ReadOnly(entry.name.clone()));
        }
        let result = {
            let mut core = try_lock(&entry.core, &entry.name)?;
            let result = f(&mut core.container)?;
            core.mark_dirty();
            result
        };
        self.refresh_status(id);
        Ok(result)
    }

    /// Recompute a node's status from its notes, queuing an event on change
    pub fn refresh_status(&mut self, id: NodeId) {
        let Ok(entry) = self.entry_mut(id) else {
            return;
        };
        let Ok(core) = entry.core.try_lock() else {
            return;
        };
        let status = NodeStatus::from_notes(core.container.notes());
        let read_only = entry.read_only || core.container.is_read_only();
        drop(core);
        if status != entry.status || read_only != entry.read_only {
            entry.status = status;
            entry.read_only = read_only;
            self.events.push(TreeEvent::StatusChanged {
                node: id,
                status,
                read_only,
            });
        }
    }

    /// Drain queued change notifications
    pub fn take_events(&mut self) -> Vec<TreeEvent> {
        std::mem::take(&mut self.events)
    }

    /// Root nodes in the order they were opened
    pub fn roots(&self) -> &[NodeId] {
        &self.roots
    }

    /// Children of a node
    pub fn children(&self, id: NodeId) -> Result<&[NodeId]> {
        Ok(&self.entry(id)?.children)
    }

    /// Parent of a node
    pub fn parent(&self, id: NodeId) -> Result<Option<NodeId>> {
        Ok(self.entry(id)?.parent)
    }

    /// Nearest node, starting with `id` itself, that owns a stream
    pub fn owner_of(&self, id: NodeId) -> Result<NodeId> {
        for node in self.update_chain(id)? {
            if self.entry(node)?.busy.is_some() {
                return Ok(node);
            }
        }
        Err(ContainerError::invariant("node has no owning ancestor"))
    }

    /// Display name of a node
    pub fn name(&self, id: NodeId) -> Result<&str> {
        Ok(&self.entry(id)?.name)
    }

    /// Status of a node
    pub fn status(&self, id: NodeId) -> Result<NodeStatus> {
        Ok(self.entry(id)?.status)
    }

    /// Is the node read-only?
    pub fn is_read_only(&self, id: NodeId) -> Result<bool> {
        Ok(self.entry(id)?.read_only)
    }

    /// Lifecycle state of a node
    pub fn state(&self, id: NodeId) -> Result<NodeState> {
        let entry = self.entry(id)?;
        Ok(try_lock(&entry.core, &entry.name)?.state)
    }

    /// How many times updates were saved through a node
    pub fn save_count(&self, id: NodeId) -> Result<u32> {
        let entry = self.entry(id)?;
        Ok(try_lock(&entry.core, &entry.name)?.save_count)
    }

    /// Snapshot of a node
    pub fn info(&self, id: NodeId) -> Result<NodeInfo> {
        let entry = self.entry(id)?;
        let core = try_lock(&entry.core, &entry.name)?;
        Ok(NodeInfo {
            label: entry.label.clone(),
            name: entry.name.clone(),
            status: entry.status,
            read_only: entry.read_only,
            state: core.state,
            owns_stream: core.ownership.is_some(),
            parent: entry.parent,
            children: entry.children.clone(),
            notes: core.container.notes().iter().map(|n| n.to_string()).collect(),
        })
    }

    /// Find a node by display names, starting with a root's name
    ///
    /// Names are compared without regard to case.
    pub fn find_node_by_path(&self, names: &[&str]) -> Option<NodeId> {
        let (first, rest) = names.split_first()?;
        let mut current = self.find_named(&self.roots, first)?;
        for name in rest {
            current = self.find_named(&self.entry(current).ok()?.children, name)?;
        }
        Some(current)
    }

    fn find_named(&self, ids: &[NodeId], name: &str) -> Option<NodeId> {
        ids.iter().copied().find(|&id| {
            self.entry(id)
                .map(|e| e.name.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })
    }

    /// Number of live nodes
    pub fn node_count(&self) -> usize {
        self.slots.iter().filter(|s| s.entry.is_some()).count()
    }

    /// Length of the longest root-to-leaf path (0 for an empty tree)
    pub fn depth(&self) -> usize {
        self.roots.iter().map(|&r| self.depth_of(r)).max().unwrap_or(0)
    }

    fn depth_of(&self, id: NodeId) -> usize {
        match self.entry(id) {
            Ok(entry) => 1 + entry.children.iter().map(|&c| self.depth_of(c)).max().unwrap_or(0),
            Err(_) => 0,
        }
    }
}

impl Default for ContainerTree {
    fn default() -> Self {
        Self::new(ScanOptions::default())
    }
}

impl Drop for ContainerTree {
    fn drop(&mut self) {
        for slot in &self.slots {
            let Some(entry) = &slot.entry else {
                continue;
            };
            if let Ok(core) = entry.core.try_lock() {
                if core.state == NodeState::Dirty {
                    error!(node = %entry.name, "tree dropped with unsaved changes");
                }
            }
        }
    }
}
