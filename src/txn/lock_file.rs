//! The shared lock file: `SharedInfo` and the read-lock ring buffer.
//!
//! `<dbfile>.lock` is memory-mapped by every database handle on the file.
//! It carries a fixed prelude (magic, format version, crc, session salt)
//! and a ring of `(version, salt, reader_count, top_ref, file_size)`
//! entries, one per live snapshot. Readers pin a snapshot by incrementing
//! its entry; the writer publishes a new entry at commit and reaps entries
//! nobody reads anymore.
//!
//! Mutual exclusion is two-level: an in-process `parking_lot` mutex
//! serializes threads, and an fcntl byte-range lock serializes processes.
//! Crash recovery relies on the OS dropping fcntl locks with the process.

#![allow(unsafe_code)]

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use memmap2::MmapMut;
use parking_lot::Mutex;
use rand::RngCore;
use tracing::{debug, warn};

use crate::error::{CoreError, Result};

/// Lock files this process already holds open, by canonical path.
///
/// POSIX fcntl locks neither conflict within one process nor survive any
/// of the process's fds to the file being closed, so each path must be
/// backed by exactly one `LockFile` per process. The registry enforces
/// that: constructed on first open, entries dropped with the last handle,
/// guarded by a single mutex.
fn open_registry() -> &'static Mutex<HashMap<PathBuf, std::sync::Weak<LockFile>>> {
    static REGISTRY: OnceLock<Mutex<HashMap<PathBuf, std::sync::Weak<LockFile>>>> = OnceLock::new();
    REGISTRY.get_or_init(|| Mutex::new(HashMap::new()))
}

const MAGIC: &[u8; 4] = b"TSLK";
const LOCK_FORMAT_VERSION: u16 = 1;

const OFF_MAGIC: usize = 0;
const OFF_FORMAT: usize = 4;
const OFF_CRC: usize = 8;
const OFF_SALT: usize = 12;
const OFF_INIT: usize = 16;
const OFF_NEWEST: usize = 24;
const ENTRIES_OFF: usize = 32;

const ENTRY_SIZE: usize = 32;
const ENT_VERSION: usize = 0;
const ENT_TOP: usize = 8;
const ENT_FILE_SIZE: usize = 16;
const ENT_COUNT: usize = 24;
const ENT_SALT: usize = 28;

/// Number of ring slots; bounds the count of concurrently pinned snapshots.
pub const RING_CAPACITY: usize = 64;

const FILE_SIZE: usize = ENTRIES_OFF + RING_CAPACITY * ENTRY_SIZE;

/// Byte the control (ring mutation) fcntl lock covers.
const CTRL_LOCK_BYTE: i64 = 0;
/// Byte the writer fcntl lock covers.
const WRITER_LOCK_BYTE: i64 = 1;
/// Byte every live handle keeps shared-locked; an exclusive probe on it
/// succeeding means nobody else has the file open, so a leftover ring from
/// a crashed process is reinitialized instead of trusted.
const SEAL_LOCK_BYTE: i64 = 2;

/// One pinned-snapshot record handed to transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingEntry {
    /// Snapshot version.
    pub version: u64,
    /// Top array ref of the snapshot.
    pub top_ref: u64,
    /// Logical file size of the snapshot.
    pub file_size: u64,
    /// Session salt the entry was created under.
    pub salt: u32,
}

/// Shared-state coordinator over the lock file.
///
/// The in-process control mutex owns the mapping: every ring access goes
/// through it, paired with the cross-process fcntl range.
#[derive(Debug)]
pub struct LockFile {
    file: File,
    map: Mutex<MmapMut>,
    session_salt: u32,
    registry_path: PathBuf,
    /// In-process half of the writer mutex. Lives here because fcntl locks
    /// cannot serialize threads of one process, and every handle on a path
    /// shares this instance.
    writer_mutex: std::sync::Arc<Mutex<()>>,
}

impl LockFile {
    /// Opens or initializes the lock file next to the database, returning
    /// the process-wide shared handle for this path.
    ///
    /// `current_version`/`current_top`/`current_size` describe the committed
    /// snapshot found in the database header; they seed the ring when this
    /// handle is the sole opener (first ever, or first after every previous
    /// opener died and left a stale ring behind).
    pub fn open(
        path: &Path,
        current_version: u64,
        current_top: u64,
        current_size: u64,
    ) -> Result<std::sync::Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let registry_path = std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());

        let mut registry = open_registry().lock();
        if let Some(existing) = registry.get(&registry_path).and_then(|w| w.upgrade()) {
            return Ok(existing);
        }

        let existing_len = file.metadata()?.len();
        if existing_len < FILE_SIZE as u64 {
            file.set_len(FILE_SIZE as u64)?;
        }
        let mut map = unsafe { MmapMut::map_mut(&file)? };

        fcntl_lock(&file, CTRL_LOCK_BYTE)?;
        let init_done = u32::from_le_bytes(map[OFF_INIT..OFF_INIT + 4].try_into().unwrap()) == 1;
        // An exclusive probe on the seal byte succeeding means no other
        // process holds the file; whatever the ring says is leftovers.
        let sole_opener = fcntl_try_exclusive(&file, SEAL_LOCK_BYTE)?;
        let session_salt;
        if !init_done || sole_opener {
            let mut salt_bytes = [0u8; 4];
            rand::rngs::OsRng.fill_bytes(&mut salt_bytes);
            session_salt = u32::from_le_bytes(salt_bytes).max(1);
            map[..FILE_SIZE].fill(0);
            map[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(MAGIC);
            map[OFF_FORMAT..OFF_FORMAT + 2].copy_from_slice(&LOCK_FORMAT_VERSION.to_le_bytes());
            let crc = crc32fast::hash(&map[..OFF_CRC]);
            map[OFF_CRC..OFF_CRC + 4].copy_from_slice(&crc.to_le_bytes());
            map[OFF_SALT..OFF_SALT + 4].copy_from_slice(&session_salt.to_le_bytes());
            map[OFF_NEWEST..OFF_NEWEST + 8].copy_from_slice(&current_version.to_le_bytes());
            write_entry(
                &mut map,
                0,
                RingEntry {
                    version: current_version,
                    top_ref: current_top,
                    file_size: current_size,
                    salt: session_salt,
                },
                0,
            );
            map[OFF_INIT..OFF_INIT + 4].copy_from_slice(&1u32.to_le_bytes());
            map.flush()?;
            debug!(
                version = current_version,
                stale = init_done,
                "initialized lock file"
            );
        } else {
            if &map[OFF_MAGIC..OFF_MAGIC + 4] != MAGIC {
                fcntl_unlock(&file, CTRL_LOCK_BYTE)?;
                return Err(CoreError::IncompatibleLockFile("bad magic".into()));
            }
            let fmt = u16::from_le_bytes(map[OFF_FORMAT..OFF_FORMAT + 2].try_into().unwrap());
            if fmt != LOCK_FORMAT_VERSION {
                fcntl_unlock(&file, CTRL_LOCK_BYTE)?;
                return Err(CoreError::IncompatibleLockFile(format!(
                    "lock file format {fmt}, expected {LOCK_FORMAT_VERSION}"
                )));
            }
            let crc = crc32fast::hash(&map[..OFF_CRC]);
            if crc != u32::from_le_bytes(map[OFF_CRC..OFF_CRC + 4].try_into().unwrap()) {
                fcntl_unlock(&file, CTRL_LOCK_BYTE)?;
                return Err(CoreError::IncompatibleLockFile("prelude crc mismatch".into()));
            }
            session_salt = u32::from_le_bytes(map[OFF_SALT..OFF_SALT + 4].try_into().unwrap());
        }
        // Keep the seal shared-locked for this handle's lifetime so later
        // openers know the ring is live.
        fcntl_shared(&file, SEAL_LOCK_BYTE)?;
        fcntl_unlock(&file, CTRL_LOCK_BYTE)?;

        let lf = std::sync::Arc::new(Self {
            file,
            map: Mutex::new(map),
            session_salt,
            registry_path: registry_path.clone(),
            writer_mutex: std::sync::Arc::new(Mutex::new(())),
        });
        registry.insert(registry_path, std::sync::Arc::downgrade(&lf));
        Ok(lf)
    }

    /// Salt of the session that initialized the ring. Detects stale reader
    /// entries after file replacement.
    pub fn session_salt(&self) -> u32 {
        self.session_salt
    }

    fn with_ctrl<R>(&self, f: impl FnOnce(&mut RingView<'_>) -> Result<R>) -> Result<R> {
        let mut map = self.map.lock();
        fcntl_lock(&self.file, CTRL_LOCK_BYTE)?;
        let mut view = RingView {
            map: &mut map[..FILE_SIZE],
        };
        let out = f(&mut view);
        fcntl_unlock(&self.file, CTRL_LOCK_BYTE)?;
        out
    }

    /// Newest published version.
    pub fn newest_version(&self) -> Result<u64> {
        self.with_ctrl(|v| Ok(v.newest()))
    }

    /// Pins the newest snapshot; increments its reader count.
    pub fn grab_latest(&self) -> Result<RingEntry> {
        self.with_ctrl(|v| {
            let newest = v.newest();
            let slot = v
                .find(newest)
                .ok_or_else(|| CoreError::Corruption("newest version missing from ring".into()))?;
            v.add_reader(slot, 1);
            Ok(v.entry(slot))
        })
    }

    /// Pins a specific version, failing with `BadVersion` when reaped.
    pub fn grab_version(&self, version: u64, salt: u32) -> Result<RingEntry> {
        self.with_ctrl(|v| {
            let slot = v.find(version).ok_or(CoreError::BadVersion(version))?;
            let entry = v.entry(slot);
            if salt != 0 && entry.salt != salt {
                return Err(CoreError::BadVersion(version));
            }
            v.add_reader(slot, 1);
            Ok(entry)
        })
    }

    /// Releases a pinned snapshot.
    pub fn release(&self, version: u64) -> Result<()> {
        self.with_ctrl(|v| {
            if let Some(slot) = v.find(version) {
                v.add_reader(slot, -1);
            } else {
                warn!(version, "released a version the ring no longer tracks");
            }
            Ok(())
        })
    }

    /// Publishes a committed snapshot and reaps dead entries. Caller holds
    /// the writer lock.
    pub fn publish(&self, entry_version: u64, top_ref: u64, file_size: u64) -> Result<()> {
        let salt = self.session_salt;
        self.with_ctrl(|v| {
            let newest = v.newest();
            // Reap: zero-reader entries older than the one being replaced.
            for slot in 0..RING_CAPACITY {
                let e = v.entry(slot);
                if e.version != 0 && e.version < newest && v.readers(slot) == 0 {
                    v.clear(slot);
                }
            }
            let free = (0..RING_CAPACITY)
                .find(|&s| v.entry(s).version == 0)
                .ok_or(CoreError::OutOfMemory("read-lock ring is full"))?;
            v.write(
                free,
                RingEntry {
                    version: entry_version,
                    top_ref,
                    file_size,
                    salt,
                },
                0,
            );
            v.set_newest(entry_version);
            Ok(())
        })
    }

    /// Smallest version still pinned by a reader; the newest version when
    /// nobody reads. Freed regions at versions <= this are reusable.
    pub fn oldest_live_version(&self) -> Result<u64> {
        self.with_ctrl(|v| {
            let mut oldest = u64::MAX;
            for slot in 0..RING_CAPACITY {
                let e = v.entry(slot);
                if e.version != 0 && v.readers(slot) > 0 {
                    oldest = oldest.min(e.version);
                }
            }
            Ok(if oldest == u64::MAX { v.newest() } else { oldest })
        })
    }

    /// The in-process writer mutex shared by every handle on this path.
    pub fn writer_mutex(&self) -> &std::sync::Arc<Mutex<()>> {
        &self.writer_mutex
    }

    /// Acquires the cross-process writer lock. The in-process mutex is
    /// handled by the caller.
    pub fn lock_writer_file(&self) -> Result<()> {
        fcntl_lock(&self.file, WRITER_LOCK_BYTE)
    }

    /// Releases the cross-process writer lock.
    pub fn unlock_writer_file(&self) -> Result<()> {
        fcntl_unlock(&self.file, WRITER_LOCK_BYTE)
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        let mut registry = open_registry().lock();
        // Only remove a dead entry: a new handle for the same path may have
        // replaced ours already.
        if let Some(w) = registry.get(&self.registry_path) {
            if w.upgrade().is_none() {
                registry.remove(&self.registry_path);
            }
        }
    }
}

/// Raw view over the mapped ring, valid only under the control locks.
struct RingView<'a> {
    map: &'a mut [u8],
}

impl RingView<'_> {
    fn newest(&self) -> u64 {
        u64::from_le_bytes(self.map[OFF_NEWEST..OFF_NEWEST + 8].try_into().unwrap())
    }

    fn set_newest(&mut self, v: u64) {
        self.map[OFF_NEWEST..OFF_NEWEST + 8].copy_from_slice(&v.to_le_bytes());
    }

    fn entry(&self, slot: usize) -> RingEntry {
        let off = ENTRIES_OFF + slot * ENTRY_SIZE;
        let e = &self.map[off..off + ENTRY_SIZE];
        RingEntry {
            version: u64::from_le_bytes(e[ENT_VERSION..ENT_VERSION + 8].try_into().unwrap()),
            top_ref: u64::from_le_bytes(e[ENT_TOP..ENT_TOP + 8].try_into().unwrap()),
            file_size: u64::from_le_bytes(e[ENT_FILE_SIZE..ENT_FILE_SIZE + 8].try_into().unwrap()),
            salt: u32::from_le_bytes(e[ENT_SALT..ENT_SALT + 4].try_into().unwrap()),
        }
    }

    fn readers(&self, slot: usize) -> u32 {
        let off = ENTRIES_OFF + slot * ENTRY_SIZE + ENT_COUNT;
        u32::from_le_bytes(self.map[off..off + 4].try_into().unwrap())
    }

    fn add_reader(&mut self, slot: usize, delta: i64) {
        let off = ENTRIES_OFF + slot * ENTRY_SIZE + ENT_COUNT;
        let cur = u32::from_le_bytes(self.map[off..off + 4].try_into().unwrap());
        let next = (cur as i64 + delta).max(0) as u32;
        self.map[off..off + 4].copy_from_slice(&next.to_le_bytes());
    }

    fn find(&self, version: u64) -> Option<usize> {
        (0..RING_CAPACITY).find(|&s| self.entry(s).version == version)
    }

    fn clear(&mut self, slot: usize) {
        let off = ENTRIES_OFF + slot * ENTRY_SIZE;
        self.map[off..off + ENTRY_SIZE].fill(0);
    }

    fn write(&mut self, slot: usize, e: RingEntry, readers: u32) {
        write_entry_into(self.map, slot, e, readers);
    }
}

fn write_entry(map: &mut MmapMut, slot: usize, e: RingEntry, readers: u32) {
    write_entry_into(&mut map[..], slot, e, readers);
}

fn write_entry_into(map: &mut [u8], slot: usize, e: RingEntry, readers: u32) {
    let off = ENTRIES_OFF + slot * ENTRY_SIZE;
    map[off + ENT_VERSION..off + ENT_VERSION + 8].copy_from_slice(&e.version.to_le_bytes());
    map[off + ENT_TOP..off + ENT_TOP + 8].copy_from_slice(&e.top_ref.to_le_bytes());
    map[off + ENT_FILE_SIZE..off + ENT_FILE_SIZE + 8].copy_from_slice(&e.file_size.to_le_bytes());
    map[off + ENT_COUNT..off + ENT_COUNT + 4].copy_from_slice(&readers.to_le_bytes());
    map[off + ENT_SALT..off + ENT_SALT + 4].copy_from_slice(&e.salt.to_le_bytes());
}

#[cfg(unix)]
fn fcntl_lock(file: &File, byte: i64) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let lock = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: byte,
        l_len: 1,
        l_pid: 0,
    };
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &lock) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(CoreError::Io(err));
    }
}

/// Non-blocking exclusive probe; true when the range was free.
#[cfg(unix)]
fn fcntl_try_exclusive(file: &File, byte: i64) -> Result<bool> {
    use std::os::unix::io::AsRawFd;
    let lock = libc::flock {
        l_type: libc::F_WRLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: byte,
        l_len: 1,
        l_pid: 0,
    };
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
    if rc == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(code) if code == libc::EACCES || code == libc::EAGAIN => Ok(false),
        _ => Err(CoreError::Io(err)),
    }
}

/// Takes (or downgrades to) a shared lock on the range.
#[cfg(unix)]
fn fcntl_shared(file: &File, byte: i64) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let lock = libc::flock {
        l_type: libc::F_RDLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: byte,
        l_len: 1,
        l_pid: 0,
    };
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLKW, &lock) };
        if rc == 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() == std::io::ErrorKind::Interrupted {
            continue;
        }
        return Err(CoreError::Io(err));
    }
}

#[cfg(not(unix))]
fn fcntl_try_exclusive(_file: &File, _byte: i64) -> Result<bool> {
    Ok(false)
}

#[cfg(not(unix))]
fn fcntl_shared(_file: &File, _byte: i64) -> Result<()> {
    Ok(())
}

#[cfg(unix)]
fn fcntl_unlock(file: &File, byte: i64) -> Result<()> {
    use std::os::unix::io::AsRawFd;
    let lock = libc::flock {
        l_type: libc::F_UNLCK as i16,
        l_whence: libc::SEEK_SET as i16,
        l_start: byte,
        l_len: 1,
        l_pid: 0,
    };
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), libc::F_SETLK, &lock) };
    if rc == 0 {
        Ok(())
    } else {
        Err(CoreError::Io(std::io::Error::last_os_error()))
    }
}

#[cfg(not(unix))]
fn fcntl_lock(_file: &File, _byte: i64) -> Result<()> {
    Ok(())
}

#[cfg(not(unix))]
fn fcntl_unlock(_file: &File, _byte: i64) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_fresh(dir: &tempfile::TempDir) -> std::sync::Arc<LockFile> {
        LockFile::open(&dir.path().join("db.lock"), 1, 0, 24).unwrap()
    }

    #[test]
    fn init_publishes_seed_version() {
        let dir = tempfile::tempdir().unwrap();
        let lf = open_fresh(&dir);
        assert_eq!(lf.newest_version().unwrap(), 1);
        let e = lf.grab_latest().unwrap();
        assert_eq!(e.version, 1);
        assert_eq!(e.file_size, 24);
        lf.release(1).unwrap();
    }

    #[test]
    fn grab_specific_and_bad_version() {
        let dir = tempfile::tempdir().unwrap();
        let lf = open_fresh(&dir);
        lf.publish(2, 1024, 4096).unwrap();
        let e = lf.grab_version(2, 0).unwrap();
        assert_eq!(e.top_ref, 1024);
        assert!(matches!(
            lf.grab_version(99, 0),
            Err(CoreError::BadVersion(99))
        ));
        lf.release(2).unwrap();
    }

    #[test]
    fn reap_skips_pinned_versions() {
        let dir = tempfile::tempdir().unwrap();
        let lf = open_fresh(&dir);
        let pinned = lf.grab_latest().unwrap();
        lf.publish(2, 100, 4096).unwrap();
        lf.publish(3, 200, 4096).unwrap();
        // Version 1 still pinned, so it must survive both publishes.
        assert_eq!(lf.grab_version(pinned.version, 0).unwrap().version, 1);
        lf.release(1).unwrap();
        lf.release(1).unwrap();
        assert_eq!(lf.oldest_live_version().unwrap(), 3);
        lf.publish(4, 300, 4096).unwrap();
        assert!(matches!(
            lf.grab_version(1, 0),
            Err(CoreError::BadVersion(1))
        ));
    }

    #[test]
    fn oldest_live_tracks_readers() {
        let dir = tempfile::tempdir().unwrap();
        let lf = open_fresh(&dir);
        let _r1 = lf.grab_latest().unwrap();
        lf.publish(2, 100, 4096).unwrap();
        let _r2 = lf.grab_latest().unwrap();
        assert_eq!(lf.oldest_live_version().unwrap(), 1);
        lf.release(1).unwrap();
        assert_eq!(lf.oldest_live_version().unwrap(), 2);
        lf.release(2).unwrap();
    }

    #[test]
    fn reopen_attaches_to_existing_ring() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("db.lock");
        let lf = LockFile::open(&path, 1, 0, 24).unwrap();
        lf.publish(2, 64, 128).unwrap();
        let salt = lf.session_salt();
        let lf2 = LockFile::open(&path, 1, 0, 24).unwrap();
        assert_eq!(lf2.session_salt(), salt);
        assert_eq!(lf2.newest_version().unwrap(), 2);
    }
}
