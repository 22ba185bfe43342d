//! Positioned file I/O and the mapped backing behind the allocator.
//!
//! The allocator sees one contiguous logical byte range regardless of
//! whether the file on disk is plaintext (memory-mapped directly) or
//! encrypted (decrypted page by page into an in-memory image).

#![allow(unsafe_code)]

use std::fs::{File, OpenOptions};
use std::io::IoSlice;
use std::path::Path;
use std::sync::Arc;

use memmap2::MmapMut;

use crate::encryption::{EncryptedMapping, MappingRegistry};
use crate::error::{CoreError, Result};

/// Trait for performing positioned file I/O operations.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Writes multiple buffers to the file at the specified offset.
    fn writev_at(&self, mut off: u64, bufs: &[IoSlice<'_>]) -> Result<()> {
        for slice in bufs {
            if slice.is_empty() {
                continue;
            }
            self.write_at(off, slice)?;
            off = off
                .checked_add(slice.len() as u64)
                .ok_or(CoreError::InvalidArgument("writev offset overflow".into()))?;
        }
        Ok(())
    }
    /// Synchronizes all file data and metadata to disk.
    fn sync_all(&self) -> Result<()>;
    /// Returns the current length of the file in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to the specified length.
    fn truncate(&self, len: u64) -> Result<()>;
}

/// Standard file-backed [`FileIo`] implementation.
#[derive(Clone)]
pub struct StdFileIo {
    file: Arc<File>,
}

impl StdFileIo {
    /// Opens a file in read-write mode, creating it when absent.
    pub fn open_rw(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self {
            file: Arc::new(file),
        })
    }

    /// Wraps an already opened file handle.
    pub fn from_file(file: File) -> Self {
        Self {
            file: Arc::new(file),
        }
    }

    /// Borrow of the underlying handle, for mapping.
    pub fn file(&self) -> &File {
        &self.file
    }
}

#[cfg(unix)]
impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        let mut read = 0;
        while read < dst.len() {
            let n = self.file.read_at(&mut dst[read..], off + read as u64)?;
            if n == 0 {
                // Reads past EOF come back zeroed, matching an
                // ftruncate-grown region.
                dst[read..].fill(0);
                return Ok(());
            }
            read += n;
        }
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(src, off)?;
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }
}

#[cfg(not(unix))]
impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut read = 0;
        while read < dst.len() {
            let n = self.file.seek_read(&mut dst[read..], off + read as u64)?;
            if n == 0 {
                dst[read..].fill(0);
                return Ok(());
            }
            read += n;
        }
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut written = 0;
        while written < src.len() {
            written += self.file.seek_write(&src[written..], off + written as u64)?;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }
}

/// Plaintext backing: the file mapped read-write.
pub struct PlainMapping {
    io: StdFileIo,
    map: Option<MmapMut>,
    len: u64,
}

impl PlainMapping {
    fn attach(io: StdFileIo) -> Result<Self> {
        let len = io.len()?;
        let map = if len > 0 {
            Some(unsafe { MmapMut::map_mut(io.file())? })
        } else {
            None
        };
        Ok(Self { io, map, len })
    }

    fn remap(&mut self) -> Result<()> {
        self.len = self.io.len()?;
        self.map = if self.len > 0 {
            Some(unsafe { MmapMut::map_mut(self.io.file())? })
        } else {
            None
        };
        Ok(())
    }
}

/// The contiguous logical byte range the allocator reads refs from.
///
/// `Plain` maps the file directly. `Encrypted` keeps a decrypted image in
/// memory and routes writes through the authenticated page writer.
pub enum Backing {
    /// Direct memory map of a plaintext file.
    Plain(PlainMapping),
    /// Decrypt-on-attach image of an encrypted file.
    Encrypted(EncryptedMapping),
}

impl Backing {
    /// Attaches to `path`, choosing the backend by presence of a key.
    pub fn attach(path: impl AsRef<Path>, key: Option<[u8; 64]>) -> Result<Self> {
        Self::attach_registered(path, key, None)
    }

    /// Attaches with an optional coherence registry shared between the
    /// process's mappings of this encrypted file.
    pub fn attach_registered(
        path: impl AsRef<Path>,
        key: Option<[u8; 64]>,
        registry: Option<Arc<MappingRegistry>>,
    ) -> Result<Self> {
        let io = StdFileIo::open_rw(path)?;
        match key {
            None => Ok(Backing::Plain(PlainMapping::attach(io)?)),
            Some(key) => Ok(Backing::Encrypted(EncryptedMapping::attach_registered(
                io, &key, registry,
            )?)),
        }
    }

    /// Picks up pages invalidated by sibling mappings. Called when a
    /// transaction binds a snapshot.
    pub fn refresh(&mut self) -> Result<()> {
        match self {
            Backing::Plain(_) => Ok(()),
            Backing::Encrypted(e) => e.refresh(),
        }
    }

    /// Logical length of the backed range.
    pub fn len(&self) -> u64 {
        match self {
            Backing::Plain(p) => p.len,
            Backing::Encrypted(e) => e.logical_len(),
        }
    }

    /// True when nothing has been written yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Borrows `len` bytes at logical offset `off`.
    pub fn read(&self, off: u64, len: usize) -> Result<&[u8]> {
        let end = off
            .checked_add(len as u64)
            .ok_or_else(|| CoreError::Corruption("ref range overflow".into()))?;
        if end > self.len() {
            return Err(CoreError::Corruption(format!(
                "ref {off}+{len} beyond mapped end {}",
                self.len()
            )));
        }
        match self {
            Backing::Plain(p) => {
                let map = p
                    .map
                    .as_ref()
                    .ok_or_else(|| CoreError::Corruption("read from empty mapping".into()))?;
                Ok(&map[off as usize..end as usize])
            }
            Backing::Encrypted(e) => e.read(off, len),
        }
    }

    /// Borrows `len` bytes at logical offset `off` mutably. Callers must
    /// only target regions no live snapshot can observe.
    pub fn read_mut(&mut self, off: u64, len: usize) -> Result<&mut [u8]> {
        let end = off
            .checked_add(len as u64)
            .ok_or_else(|| CoreError::Corruption("ref range overflow".into()))?;
        if end > self.len() {
            return Err(CoreError::Corruption(format!(
                "ref {off}+{len} beyond mapped end {}",
                self.len()
            )));
        }
        match self {
            Backing::Plain(p) => {
                let map = p
                    .map
                    .as_mut()
                    .ok_or_else(|| CoreError::Corruption("write to empty mapping".into()))?;
                Ok(&mut map[off as usize..end as usize])
            }
            Backing::Encrypted(e) => e.read_mut(off, len),
        }
    }

    /// Writes `data` at logical offset `off`. Only the committing writer
    /// calls this; readers never mutate the backing.
    pub fn write(&mut self, off: u64, data: &[u8]) -> Result<()> {
        match self {
            Backing::Plain(p) => {
                let end = off as usize + data.len();
                let map = p
                    .map
                    .as_mut()
                    .ok_or_else(|| CoreError::Corruption("write to empty mapping".into()))?;
                if end > map.len() {
                    return Err(CoreError::Corruption("write beyond mapped end".into()));
                }
                map[off as usize..end].copy_from_slice(data);
                Ok(())
            }
            Backing::Encrypted(e) => e.write(off, data),
        }
    }

    /// Grows the logical range to `new_len` and refreshes the view.
    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        match self {
            Backing::Plain(p) => {
                if new_len < p.len {
                    return Err(CoreError::InvalidArgument(
                        "backing never shrinks inside a transaction".into(),
                    ));
                }
                p.io.truncate(new_len)?;
                p.remap()
            }
            Backing::Encrypted(e) => e.set_logical_len(new_len),
        }
    }

    /// Pushes buffered writes to the file. `fsync` additionally forces them
    /// to stable storage; the encrypted backend writes its dirty pages
    /// either way, since readers attach from the file.
    pub fn flush(&mut self, fsync: bool) -> Result<()> {
        match self {
            Backing::Plain(p) => {
                if fsync {
                    if let Some(map) = p.map.as_ref() {
                        map.flush()?;
                    }
                    p.io.sync_all()?;
                }
                Ok(())
            }
            Backing::Encrypted(e) => e.flush(fsync),
        }
    }

    /// Full write-back plus fsync.
    pub fn sync(&mut self) -> Result<()> {
        self.flush(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_at_past_eof_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let io = StdFileIo::open_rw(dir.path().join("io.bin")).unwrap();
        io.write_at(0, b"abc").unwrap();
        let mut buf = [0xffu8; 8];
        io.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(&buf[3..], &[0; 5]);
    }

    #[test]
    fn plain_backing_grow_and_rw() {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("plain.tsra"), None).unwrap();
        assert!(backing.is_empty());
        backing.grow(4096).unwrap();
        backing.write(100, &[7u8; 16]).unwrap();
        assert_eq!(backing.read(100, 16).unwrap(), &[7u8; 16]);
        backing.sync().unwrap();
    }
}
