/// Saving changes up the ownership chain

use super::node::{Container, NodeCore, NodeState, Origin};
use crate::archive::Part;
use crate::error::{ContainerError, Result};
use tracing::debug;

/// Write `data` back into the entry or file of `container` that `origin` names
fn write_back(container: &mut Container, origin: &Origin, data: Vec<u8>) -> Result<()> {
    if container.is_read_only() {
        return Err(ContainerError::ReadOnly(container.type_label()));
    }
    match origin {
        Origin::ArchiveEntry { name, part } => {
            let archive = container
                .as_archive_mut()
                .ok_or_else(|| ContainerError::invariant("archive entry origin under a non-archive"))?;
            let index = archive
                .find_entry(name)
                .ok_or_else(|| ContainerError::FileNotFound(name.clone()))?;
            if !archive.in_transaction() {
                archive.start_transaction()?;
            }
            archive.replace_part(index, *part, data)
        }
        Origin::FileSystemFile { path } => {
            let fs = container
                .as_filesystem_mut()
                .ok_or_else(|| ContainerError::invariant("filesystem file origin under a non-filesystem"))?;
            let entry = fs
                .find(path)?
                .ok_or_else(|| ContainerError::FileNotFound(path.clone()))?;
            let rsrc = match entry.rsrc_len {
                Some(_) => Some(fs.read_fork(path, Part::RsrcFork, false)?),
                None => None,
            };
            fs.replace_file(path, &entry.attributes, &data, rsrc.as_deref())?;
            Ok(())
        }
        Origin::Host { .. } => Err(ContainerError::invariant("host origin has no parent container")),
    }
}

/// Flush `chain[0]` and carry its bytes up through each owner to a host file
///
/// `chain` runs from the node being saved to the root. Each owner whose
/// stream came from a parent entry or file has its bytes written back into
/// that parent, which is then flushed in turn.
pub(crate) fn propagate(chain: &mut [&mut NodeCore], compress: bool) -> Result<()> {
    if chain.is_empty() {
        return Err(ContainerError::invariant("empty update chain"));
    }

    let mut pending: Option<(Origin, Vec<u8>)> = None;
    let mut reached = 0;
    for (i, core) in chain.iter_mut().enumerate() {
        reached = i;
        if let Some((origin, data)) = pending.take() {
            write_back(&mut core.container, &origin, data)?;
            core.state = NodeState::Dirty;
        }
        core.container.flush(compress)?;

        if let Some(ownership) = &core.ownership {
            ownership.stream.flush()?;
            if ownership.origin.is_host() {
                break;
            }
            debug!(origin = ?ownership.origin, "carrying update to parent");
            pending = Some((ownership.origin.clone(), ownership.stream.read_all()?));
        }
    }
    if pending.is_some() {
        return Err(ContainerError::invariant("update chain ends without a host owner"));
    }

    for (i, core) in chain.iter_mut().enumerate().take(reached + 1) {
        if i == 0 || core.state == NodeState::Dirty {
            core.state = NodeState::Saved;
        }
    }
    chain[0].save_count += 1;
    Ok(())
}
