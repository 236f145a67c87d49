//! Byte sources handed to the runtime when it loads an assembly image or its debug file.
//!
//! A [`Backend`] is a read-only byte container. [`Physical`] maps a file with `memmap2` so
//! large images are paged in on demand; [`Memory`] owns a buffer. [`AssemblyStream`] puts a
//! cursor on top of either and implements [`Read`] and [`Seek`].

use std::{
    fmt, fs,
    io::{self, Read, Seek, SeekFrom},
    path::{Path, PathBuf},
};

use memmap2::Mmap;

use crate::{Error, Result};

/// Read-only access to a byte container.
pub trait Backend: Send + Sync {
    /// Returns `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidArgument`] if the range is out of bounds.
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]>;

    /// Returns the whole buffer.
    fn data(&self) -> &[u8];

    /// Returns the buffer length.
    fn len(&self) -> usize;

    /// Returns `true` if the buffer is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn checked_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8]> {
    offset
        .checked_add(len)
        .filter(|end| *end <= data.len())
        .map(|end| &data[offset..end])
        .ok_or_else(|| {
            Error::InvalidArgument(format!(
                "range {}+{} is outside a {} byte buffer",
                offset,
                len,
                data.len()
            ))
        })
}

/// A memory-mapped file.
#[derive(Debug)]
pub struct Physical {
    data: Mmap,
    path: PathBuf,
}

impl Physical {
    /// Maps the file at `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] if the file cannot be opened or mapped.
    pub fn new(path: impl AsRef<Path>) -> Result<Physical> {
        let path = path.as_ref();
        let file = fs::File::open(path)?;
        // The mapping is read-only and never handed out mutably.
        let data = unsafe { Mmap::map(&file) }?;
        Ok(Physical {
            data,
            path: path.to_path_buf(),
        })
    }

    /// The mapped file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Backend for Physical {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        checked_slice(&self.data, offset, len)
    }

    fn data(&self) -> &[u8] {
        self.data.as_ref()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// An owned in-memory buffer.
#[derive(Debug)]
pub struct Memory {
    data: Vec<u8>,
}

impl Memory {
    /// Wraps `data`.
    pub fn new(data: Vec<u8>) -> Memory {
        Memory { data }
    }
}

impl Backend for Memory {
    fn data_slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        checked_slice(&self.data, offset, len)
    }

    fn data(&self) -> &[u8] {
        self.data.as_slice()
    }

    fn len(&self) -> usize {
        self.data.len()
    }
}

/// A seekable reader over a [`Backend`].
pub struct AssemblyStream {
    backend: Box<dyn Backend>,
    position: u64,
}

impl AssemblyStream {
    /// Wraps any backend, positioned at the start.
    pub fn new(backend: Box<dyn Backend>) -> Self {
        Self {
            backend,
            position: 0,
        }
    }

    /// Opens a file through a memory mapping.
    ///
    /// # Errors
    ///
    /// See [`Physical::new`].
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Box::new(Physical::new(path)?)))
    }

    /// Streams an owned buffer.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        Self::new(Box::new(Memory::new(data)))
    }

    /// Total length in bytes.
    pub fn len(&self) -> u64 {
        self.backend.len() as u64
    }

    /// True for an empty stream.
    pub fn is_empty(&self) -> bool {
        self.backend.is_empty()
    }

    /// Current cursor position.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// The whole underlying buffer, independent of the cursor.
    pub fn data(&self) -> &[u8] {
        self.backend.data()
    }
}

impl Read for AssemblyStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let data = self.backend.data();
        let start = usize::try_from(self.position)
            .unwrap_or(usize::MAX)
            .min(data.len());
        let count = buf.len().min(data.len() - start);
        buf[..count].copy_from_slice(&data[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }
}

impl Seek for AssemblyStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
            SeekFrom::End(delta) => self.len().checked_add_signed(delta),
        };
        match target {
            Some(position) => {
                self.position = position;
                Ok(position)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the stream",
            )),
        }
    }
}

impl fmt::Debug for AssemblyStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssemblyStream")
            .field("len", &self.len())
            .field("position", &self.position)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_backend() {
        let mut data = vec![0xCC_u8; 1048];
        data[10..15].copy_from_slice(&[0xBB; 5]);
        let memory = Memory::new(data);

        assert_eq!(memory.len(), 1048);
        assert_eq!(memory.data()[42], 0xCC);
        assert_eq!(memory.data_slice(10, 5).unwrap(), &[0xBB; 5]);
        assert!(memory.data_slice(1040, 10).is_err());
        assert!(memory.data_slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn test_physical_backend() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"MZ\x90\x00rest").unwrap();
        file.flush().unwrap();

        let physical = Physical::new(file.path()).unwrap();
        assert_eq!(physical.len(), 8);
        assert_eq!(physical.data_slice(0, 2).unwrap(), b"MZ");
        assert!(physical.data_slice(4, 5).is_err());
        assert_eq!(physical.path(), file.path());
    }

    #[test]
    fn test_physical_missing_file() {
        assert!(matches!(
            Physical::new("/nonexistent/image.dll"),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_stream_read_seek() {
        let mut stream = AssemblyStream::from_bytes(b"0123456789".to_vec());
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"0123");

        assert_eq!(stream.seek(SeekFrom::End(-2)).unwrap(), 8);
        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"89");

        assert_eq!(stream.seek(SeekFrom::Current(-5)).unwrap(), 5);
        assert!(stream.seek(SeekFrom::Current(-6)).is_err());

        stream.seek(SeekFrom::Start(100)).unwrap();
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }
}
