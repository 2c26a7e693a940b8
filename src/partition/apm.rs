/// Apple Partition Map reading and writing

use super::{MapKind, Partition, PartitionMap};
use crate::error::{ContainerError, Result};
use crate::io::{ChunkAccess, BLOCK_SIZE};
use crate::notes::Notes;
use tracing::debug;

const DDR_SIGNATURE: &[u8] = b"ER";
const ENTRY_SIGNATURE: &[u8] = b"PM";
const NAME_LEN: usize = 32;

/// Partition types that never hold a volume
const SKIPPED_TYPES: &[&str] = &["Apple_partition_map", "Apple_Free", "Apple_Void"];
const SKIPPED_PREFIXES: &[&str] = &["Apple_Driver", "Apple_Patches"];

fn be_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn be_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

fn c_string(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

fn is_skipped(type_name: &str) -> bool {
    SKIPPED_TYPES.iter().any(|t| t.eq_ignore_ascii_case(type_name))
        || SKIPPED_PREFIXES.iter().any(|p| type_name.starts_with(p))
}

/// Does block 0 hold a driver descriptor record?
pub fn probe(chunks: &ChunkAccess) -> bool {
    if chunks.block_count() < 2 {
        return false;
    }
    match (chunks.read_block_vec(0), chunks.read_block_vec(1)) {
        (Ok(ddr), Ok(first)) => ddr.starts_with(DDR_SIGNATURE) && first.starts_with(ENTRY_SIGNATURE),
        _ => false,
    }
}

/// Read the partition map
pub fn read(chunks: &ChunkAccess) -> Result<PartitionMap> {
    let ddr = chunks.read_block_vec(0)?;
    if !ddr.starts_with(DDR_SIGNATURE) {
        return Err(ContainerError::invalid_format("no Apple Partition Map"));
    }
    let block_size = be_u16(&ddr, 2) as usize;
    if block_size != BLOCK_SIZE {
        return Err(ContainerError::unsupported(format!(
            "partition map block size {}",
            block_size
        )));
    }

    let mut notes = Notes::new();
    let first = chunks.read_block_vec(1)?;
    if !first.starts_with(ENTRY_SIGNATURE) {
        return Err(ContainerError::parse(BLOCK_SIZE as u64, "bad partition entry signature"));
    }
    let map_entries = be_u32(&first, 4).min(chunks.block_count().saturating_sub(1));

    let mut partitions = Vec::new();
    for index in 1..=map_entries {
        let entry = chunks.read_block_vec(index)?;
        if !entry.starts_with(ENTRY_SIGNATURE) {
            notes.warning(format!("partition entry {} has a bad signature", index));
            break;
        }
        let start = be_u32(&entry, 8);
        let count = be_u32(&entry, 12);
        let name = c_string(&entry[16..16 + NAME_LEN]);
        let type_name = c_string(&entry[48..48 + NAME_LEN]);

        if is_skipped(&type_name) {
            continue;
        }
        if count == 0 || start.checked_add(count).map_or(true, |end| end > chunks.block_count()) {
            notes.error(format!(
                "partition '{}' ({}+{}) extends past the end of the disk",
                name, start, count
            ));
            notes.mark_dubious();
            continue;
        }
        partitions.push(Partition::new(name, type_name, start, chunks.sub_range(start, count)?));
    }

    debug!(count = partitions.len(), "read Apple Partition Map");
    Ok(PartitionMap::new(MapKind::Apm, partitions, notes))
}

/// A partition to lay out with [`write`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Partition name
    pub name: String,
    /// Partition type, such as "Apple_PRODOS"
    pub type_name: String,
    /// Length in blocks
    pub block_count: u32,
}

/// Write a partition map and return the start block of each partition
///
/// Partitions are placed back to back after the map itself.
pub fn write(chunks: &ChunkAccess, specs: &[PartitionSpec]) -> Result<Vec<u32>> {
    let map_entries = specs.len() as u32 + 1;
    let mut next = 1 + map_entries;
    let mut starts = Vec::with_capacity(specs.len());
    for spec in specs {
        starts.push(next);
        next += spec.block_count;
    }
    if next > chunks.block_count() {
        return Err(ContainerError::DiskFull);
    }

    let mut ddr = vec![0u8; BLOCK_SIZE];
    ddr[..2].copy_from_slice(DDR_SIGNATURE);
    ddr[2..4].copy_from_slice(&(BLOCK_SIZE as u16).to_be_bytes());
    ddr[4..8].copy_from_slice(&chunks.block_count().to_be_bytes());
    chunks.write_block(0, &ddr)?;

    let map_self = ("Apple", "Apple_partition_map", 1, map_entries);
    let entries = std::iter::once(map_self).chain(
        specs
            .iter()
            .zip(&starts)
            .map(|(s, &start)| (s.name.as_str(), s.type_name.as_str(), start, s.block_count)),
    );
    for (i, (name, type_name, start, count)) in entries.enumerate() {
        let mut block = vec![0u8; BLOCK_SIZE];
        block[..2].copy_from_slice(ENTRY_SIGNATURE);
        block[4..8].copy_from_slice(&map_entries.to_be_bytes());
        block[8..12].copy_from_slice(&start.to_be_bytes());
        block[12..16].copy_from_slice(&count.to_be_bytes());
        let name = name.as_bytes();
        block[16..16 + name.len().min(NAME_LEN)].copy_from_slice(&name[..name.len().min(NAME_LEN)]);
        let type_name = type_name.as_bytes();
        block[48..48 + type_name.len().min(NAME_LEN)]
            .copy_from_slice(&type_name[..type_name.len().min(NAME_LEN)]);
        chunks.write_block(1 + i as u32, &block)?;
    }

    Ok(starts)
}
