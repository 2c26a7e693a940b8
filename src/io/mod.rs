/// Byte streams and block access shared between containers

/// Block access with sector ordering
pub mod chunk;
/// Stream trait, shared streams and temporary streams
pub mod stream;

pub use chunk::{ChunkAccess, BLOCK_SIZE};
pub use stream::{temp_stream, ByteStream, SharedReader, SharedStream, SPOOL_LIMIT};
