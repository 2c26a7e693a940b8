/// Stream abstractions used as backing storage for containers
///
/// Every opened container sits on top of a [`SharedStream`]. Exactly one tree
/// node owns a given stream; containers that are only views into it (a
/// filesystem inside a disk image, a partition inside a partition map) hold
/// clones of the handle but never close it themselves.

use std::fs::File;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use tempfile::SpooledTempFile;

/// Extracted streams stay in memory up to this size, then spill to a temp file
pub const SPOOL_LIMIT: usize = 1024 * 1024;

/// A seekable, writable, resizable byte stream
pub trait ByteStream: Read + Write + Seek + Send {
    /// Truncate or extend the stream
    fn set_len(&mut self, len: u64) -> io::Result<()>;
}

impl ByteStream for File {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        File::set_len(self, len)
    }
}

impl ByteStream for Cursor<Vec<u8>> {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        self.get_mut().resize(len as usize, 0);
        if self.position() > len {
            self.set_position(len);
        }
        Ok(())
    }
}

impl ByteStream for SpooledTempFile {
    fn set_len(&mut self, len: u64) -> io::Result<()> {
        SpooledTempFile::set_len(self, len)
    }
}

/// Reference-counted handle to a stream
///
/// All positional access goes through [`SharedStream::read_at`] and
/// [`SharedStream::write_at`], so clones never disturb each other's position.
#[derive(Clone)]
pub struct SharedStream {
    inner: Arc<Mutex<Box<dyn ByteStream>>>,
}

impl std::fmt::Debug for SharedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedStream")
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}

impl SharedStream {
    /// Wrap a stream
    pub fn new<S: ByteStream + 'static>(stream: S) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Box::new(stream))),
        }
    }

    /// Create an in-memory stream holding `data`
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::new(Cursor::new(data))
    }

    fn lock(&self) -> io::Result<MutexGuard<'_, Box<dyn ByteStream>>> {
        self.inner
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "stream lock poisoned"))
    }

    /// Current length in bytes
    pub fn len(&self) -> io::Result<u64> {
        let mut stream = self.lock()?;
        stream.seek(SeekFrom::End(0))
    }

    /// Is the stream empty?
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Fill `buf` from `offset`
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut stream = self.lock()?;
        stream.seek(SeekFrom::Start(offset))?;
        stream.read_exact(buf)
    }

    /// Read up to `buf.len()` bytes from `offset`, returning the count read
    pub fn read_some_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let mut stream = self.lock()?;
        stream.seek(SeekFrom::Start(offset))?;
        let mut total = 0;
        while total < buf.len() {
            let n = stream.read(&mut buf[total..])?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }

    /// Write all of `buf` at `offset`
    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut stream = self.lock()?;
        stream.seek(SeekFrom::Start(offset))?;
        stream.write_all(buf)
    }

    /// Read the whole stream
    pub fn read_all(&self) -> io::Result<Vec<u8>> {
        let mut stream = self.lock()?;
        stream.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        stream.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Replace the stream contents with `data`
    pub fn replace_contents(&self, data: &[u8]) -> io::Result<()> {
        let mut stream = self.lock()?;
        stream.seek(SeekFrom::Start(0))?;
        stream.write_all(data)?;
        stream.set_len(data.len() as u64)?;
        stream.flush()
    }

    /// Flush buffered writes
    pub fn flush(&self) -> io::Result<()> {
        self.lock()?.flush()
    }

    /// Do both handles refer to the same stream?
    pub fn same_stream(&self, other: &SharedStream) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of live handles to this stream
    pub fn handle_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }
}

/// Copy `data` into a new, independently owned temporary stream
///
/// Small streams live in memory; large ones spill to a temp file that is
/// deleted when the last handle goes away.
pub fn temp_stream(data: &[u8]) -> io::Result<SharedStream> {
    let mut spool = SpooledTempFile::new(SPOOL_LIMIT);
    spool.write_all(data)?;
    spool.seek(SeekFrom::Start(0))?;
    Ok(SharedStream::new(spool))
}

/// `Read + Seek` view of a window of a shared stream
pub struct SharedReader {
    stream: SharedStream,
    start: u64,
    len: u64,
    pos: u64,
}

impl SharedReader {
    /// View the whole stream
    pub fn new(stream: SharedStream) -> io::Result<Self> {
        let len = stream.len()?;
        Ok(Self {
            stream,
            start: 0,
            len,
            pos: 0,
        })
    }

    /// View `len` bytes starting at `start`
    pub fn window(stream: SharedStream, start: u64, len: u64) -> Self {
        Self {
            stream,
            start,
            len,
            pos: 0,
        }
    }
}

impl Read for SharedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pos >= self.len {
            return Ok(0);
        }
        let remaining = (self.len - self.pos).min(buf.len() as u64) as usize;
        let n = self
            .stream
            .read_some_at(self.start + self.pos, &mut buf[..remaining])?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for SharedReader {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => p as i128,
            SeekFrom::End(d) => self.len as i128 + d as i128,
            SeekFrom::Current(d) => self.pos as i128 + d as i128,
        };
        if target < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start of stream",
            ));
        }
        self.pos = target as u64;
        Ok(self.pos)
    }
}
