//! Database handle and MVCC transactions.
//!
//! One writer, many readers. Readers pin a snapshot version through the
//! lock-file ring buffer and observe a frozen top ref for their whole
//! lifetime. The writer serializes on a two-level mutex (in-process
//! parking_lot, cross-process fcntl), stages all changes in the slab, and
//! publishes with the crash-safe two-slot header swap:
//!
//! 1. write the slab and sync the data pages;
//! 2. stage the new top ref in the inactive header slot and sync;
//! 3. flip the selector byte and sync;
//! 4. publish the version in the ring and wake waiters.
//!
//! A crash before (3) leaves the previous snapshot current with the new
//! data orphaned; a crash after leaves the new snapshot durable. Readers
//! never see a mix because the selector flip is a single byte.

pub mod lock_file;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Condvar, Mutex, RawMutex};
use tracing::{debug, info, warn};

use crate::alloc::{Backing, FileHeader, FreeRegion, Ref, SlabAlloc, HEADER_SIZE, NULL_REF};
use crate::collections::{Dictionary, List, Set};
use crate::column::ColumnType;
use crate::encryption;
use crate::error::{CoreError, Result};
use crate::group::{self, Group};
use crate::keys::{attrs, ColKey, ObjKey, TableKey};
use crate::query::Query;
use crate::sidecar;
use crate::table;

use lock_file::{LockFile, RingEntry};

/// Identifies a snapshot: the version number plus the lock-file session
/// salt, which detects stale entries after file replacement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VersionId {
    /// Snapshot version; 0 means "latest".
    pub version: u64,
    /// Session salt; 0 skips the check.
    pub salt: u32,
}

impl VersionId {
    /// The newest committed snapshot.
    pub fn latest() -> Self {
        Self::default()
    }

    /// A specific snapshot.
    pub fn new(version: u64, salt: u32) -> Self {
        Self { version, salt }
    }
}

/// How hard commits push bytes to stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DurabilityLevel {
    /// fsync data and header on every commit.
    Full,
    /// Skip fsync; crash safety degrades to "whatever the OS flushed".
    Unsafe,
}

/// Options for [`Database::open`].
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// 64-byte key: AES key in the first half, HMAC key in the second.
    pub encryption_key: Option<[u8; 64]>,
    /// Allow upgrading older file formats in place.
    pub allow_upgrade: bool,
    /// Commit durability.
    pub durability: DurabilityLevel,
    /// Required history type; see [`crate::history`].
    pub history_type: u64,
}

impl Default for DbOptions {
    fn default() -> Self {
        Self {
            encryption_key: None,
            allow_upgrade: true,
            durability: DurabilityLevel::Full,
            history_type: group::HIST_NONE,
        }
    }
}

/// Stage of a transaction's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactStage {
    /// No snapshot bound (after commit/rollback).
    Ready,
    /// Read-only, bound to a pinned snapshot.
    Reading,
    /// The writer; may mutate.
    Writing,
    /// Read-only and immutable; safe to share across threads.
    Frozen,
}

#[derive(Debug)]
struct DbInner {
    db_path: PathBuf,
    options: DbOptions,
    lock: Arc<LockFile>,
    version_signal: Mutex<u64>,
    version_cv: Condvar,
    wait_enabled: AtomicBool,
    crypt_registry: Option<Arc<encryption::MappingRegistry>>,
}

/// Handle to one database file. Cheap to clone; all clones share the lock
/// file and writer mutex.
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DbInner>,
}

impl Database {
    /// Opens (creating if absent) the database at `path`.
    pub fn open(path: impl AsRef<Path>, options: DbOptions) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let result = Self::open_inner(&path, options);
        match &result {
            Ok(_) => sidecar::log_lock_attempt(&path, true),
            Err(e) => {
                if e.is_fatal_at_open() {
                    sidecar::log_lock_attempt(&path, false);
                }
            }
        }
        result
    }

    fn open_inner(path: &Path, options: DbOptions) -> Result<Self> {
        sidecar::prepare(path);
        if let Some(key) = &options.encryption_key {
            encryption::verify_key_fingerprint(path, key)?;
        }

        let crypt_registry = options
            .encryption_key
            .map(|_| Arc::new(encryption::MappingRegistry::new()));

        let mut backing = Backing::attach_registered(
            path,
            options.encryption_key,
            crypt_registry.clone(),
        )?;
        if backing.is_empty() {
            backing.grow(HEADER_SIZE as u64)?;
            let mut hdr_bytes = [0u8; HEADER_SIZE];
            FileHeader::new().write(&mut hdr_bytes)?;
            backing.write(0, &hdr_bytes)?;
            backing.sync()?;
            info!(path = %path.display(), "created database file");
        }

        let header = FileHeader::read(backing.read(0, HEADER_SIZE)?)?
            .ok_or_else(|| CoreError::InvalidDatabase("header never initialized".into()))?;
        if header.format_version < crate::alloc::CURRENT_FILE_FORMAT && !options.allow_upgrade {
            return Err(CoreError::FileFormatUpgradeRequired(header.format_version));
        }

        let top = header.current_top();
        let alloc = SlabAlloc::new(backing);
        let (stored_version, stored_htype, _) = Group::load_version_info(&alloc, top)?;
        if top != NULL_REF && stored_htype != options.history_type {
            return Err(CoreError::IncompatibleHistories {
                stored: stored_htype,
                requested: options.history_type,
            });
        }
        let logical_size = Group::load_logical_size(&alloc, top)?;
        // A freshly created file has no commits yet; it publishes as
        // version 1 with an empty group.
        let seed_version = if top == NULL_REF { 1 } else { stored_version };

        let lock = LockFile::open(
            &lock_file_path(path),
            seed_version,
            top,
            logical_size,
            )?;

        let newest = lock.newest_version()?;
        Ok(Self {
            inner: Arc::new(DbInner {
                db_path: path.to_path_buf(),
                options,
                lock,
                version_signal: Mutex::new(newest),
                version_cv: Condvar::new(),
                wait_enabled: AtomicBool::new(true),
                crypt_registry,
            }),
        })
    }

    fn attach_snapshot(&self, entry: RingEntry, stage: TransactStage) -> Result<Transaction> {
        let backing = Backing::attach_registered(
            &self.inner.db_path,
            self.inner.options.encryption_key,
            self.inner.crypt_registry.clone(),
        )?;
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(entry.file_size)?;
        let group = Group::attach(&alloc, entry.top_ref)?;
        Ok(Transaction {
            db: self.inner.clone(),
            stage,
            version: entry.version,
            salt: entry.salt,
            top_ref: entry.top_ref,
            alloc,
            group,
            carry_free: Vec::new(),
            writer_guard: None,
            writer_file_locked: false,
            read_pinned: true,
        })
    }

    /// Starts a read transaction on `vid` (or the latest snapshot).
    pub fn start_read(&self, vid: VersionId) -> Result<Transaction> {
        let entry = if vid.version == 0 {
            self.inner.lock.grab_latest()?
        } else {
            self.inner.lock.grab_version(vid.version, vid.salt)?
        };
        self.attach_snapshot(entry, TransactStage::Reading)
    }

    /// Starts a frozen transaction: read-only, immutable, thread-safe.
    pub fn start_frozen(&self, vid: VersionId) -> Result<Transaction> {
        let entry = if vid.version == 0 {
            self.inner.lock.grab_latest()?
        } else {
            self.inner.lock.grab_version(vid.version, vid.salt)?
        };
        self.attach_snapshot(entry, TransactStage::Frozen)
    }

    /// Starts the write transaction, blocking on the writer mutex. Binds to
    /// the latest committed snapshot.
    pub fn start_write(&self) -> Result<Transaction> {
        let guard = self.inner.lock.writer_mutex().lock_arc();
        self.inner.lock.lock_writer_file()?;
        let entry = self.inner.lock.grab_latest()?;
        let mut tx = self.attach_snapshot(entry, TransactStage::Writing)?;
        tx.writer_guard = Some(guard);
        tx.writer_file_locked = true;
        tx.load_free_lists()?;
        Ok(tx)
    }

    /// Blocks until a version newer than `tx`'s is published, or until
    /// [`Self::wait_for_change_release`]. Returns true when a newer version
    /// exists.
    pub fn wait_for_change(&self, tx: &Transaction) -> Result<bool> {
        let mut latest = self.inner.version_signal.lock();
        loop {
            if !self.inner.wait_enabled.load(Ordering::Acquire) {
                return Ok(self.inner.lock.newest_version()? > tx.version);
            }
            // Commits in other processes don't signal our condvar; refresh
            // from the ring on every wakeup.
            let newest = self.inner.lock.newest_version()?;
            if newest > *latest {
                *latest = newest;
            }
            if *latest > tx.version {
                return Ok(true);
            }
            self.inner
                .version_cv
                .wait_for(&mut latest, Duration::from_millis(50));
        }
    }

    /// Releases every thread blocked in [`Self::wait_for_change`]. Further
    /// waits return immediately until [`Self::enable_wait_for_change`].
    pub fn wait_for_change_release(&self) {
        self.inner.wait_enabled.store(false, Ordering::Release);
        let _g = self.inner.version_signal.lock();
        self.inner.version_cv.notify_all();
    }

    /// Re-enables [`Self::wait_for_change`] after a release.
    pub fn enable_wait_for_change(&self) {
        self.inner.wait_enabled.store(true, Ordering::Release);
    }

    /// Newest committed version.
    pub fn newest_version(&self) -> Result<u64> {
        self.inner.lock.newest_version()
    }

    /// Session salt of the lock file, for building [`VersionId`]s.
    pub fn session_salt(&self) -> u32 {
        self.inner.lock.session_salt()
    }

    /// Path of the database file.
    pub fn path(&self) -> &Path {
        &self.inner.db_path
    }
}

/// Path of the lock file next to the database file.
pub fn lock_file_path(db_path: &Path) -> PathBuf {
    let mut name = db_path.file_name().unwrap_or_default().to_os_string();
    name.push(".lock");
    db_path.with_file_name(name)
}

/// One transaction: a group bound to a pinned snapshot.
pub struct Transaction {
    db: Arc<DbInner>,
    stage: TransactStage,
    version: u64,
    salt: u32,
    top_ref: Ref,
    alloc: SlabAlloc,
    group: Group,
    /// Free regions not yet reusable; carried into the next commit's
    /// persisted list.
    carry_free: Vec<FreeRegion>,
    writer_guard: Option<ArcMutexGuard<RawMutex, ()>>,
    writer_file_locked: bool,
    read_pinned: bool,
}

impl Transaction {
    /// The stage this transaction is in.
    pub fn stage(&self) -> TransactStage {
        self.stage
    }

    /// The snapshot this transaction observes.
    pub fn version(&self) -> VersionId {
        VersionId {
            version: self.version,
            salt: self.salt,
        }
    }

    /// The bound group.
    pub fn group(&self) -> &Group {
        &self.group
    }

    /// Read access to group and allocator together, for accessors and
    /// queries.
    pub fn parts(&self) -> (&Group, &SlabAlloc) {
        (&self.group, &self.alloc)
    }

    /// Write access to group and allocator together.
    pub fn parts_mut(&mut self) -> Result<(&mut Group, &mut SlabAlloc)> {
        self.ensure_writing()?;
        Ok((&mut self.group, &mut self.alloc))
    }

    fn ensure_writing(&self) -> Result<()> {
        if self.stage != TransactStage::Writing {
            return Err(CoreError::WrongTransactState(
                "operation requires a write transaction",
            ));
        }
        Ok(())
    }

    fn load_free_lists(&mut self) -> Result<()> {
        let regions = Group::load_free_list(&self.alloc, self.top_ref)?;
        let oldest = self.db.lock.oldest_live_version()?;
        let (ready, carry): (Vec<_>, Vec<_>) =
            regions.into_iter().partition(|r| r.version <= oldest);
        debug!(
            ready = ready.len(),
            pinned = carry.len(),
            oldest_live = oldest,
            "loaded free lists"
        );
        self.alloc.set_free_ready(ready);
        self.carry_free = carry;
        Ok(())
    }

    // -- schema ----------------------------------------------------------

    /// Adds a table.
    pub fn add_table(&mut self, name: &str) -> Result<TableKey> {
        self.ensure_writing()?;
        self.group.add_table(&mut self.alloc, name)
    }

    /// Removes a table and its storage.
    pub fn remove_table(&mut self, tk: TableKey) -> Result<()> {
        self.ensure_writing()?;
        self.group.remove_table(&mut self.alloc, tk)
    }

    /// Table key by name.
    pub fn table_key(&self, name: &str) -> Option<TableKey> {
        self.group.table_key_by_name(name)
    }

    /// Keys of all live tables.
    pub fn table_keys(&self) -> Vec<TableKey> {
        self.group.table_keys()
    }

    /// Adds a value column.
    pub fn add_column(&mut self, tk: TableKey, name: &str, ty: ColumnType) -> Result<ColKey> {
        self.add_column_with(tk, name, ty, 0)
    }

    /// Adds a value column with attribute bits (nullable, primary key).
    pub fn add_column_with(
        &mut self,
        tk: TableKey,
        name: &str,
        ty: ColumnType,
        attr_bits: u8,
    ) -> Result<ColKey> {
        self.ensure_writing()?;
        if attr_bits & (attrs::STRONG | attrs::BACKLINK) != 0 {
            return Err(CoreError::InvalidArgument(
                "link attributes require a link column".into(),
            ));
        }
        self.group
            .state_mut(tk)?
            .add_column(&mut self.alloc, name, ty, attr_bits, table::ColumnTarget::None)
    }

    /// Adds a link column targeting `target`, with its hidden backlink.
    pub fn add_link_column(
        &mut self,
        tk: TableKey,
        name: &str,
        target: TableKey,
        strong: bool,
    ) -> Result<ColKey> {
        self.ensure_writing()?;
        table::add_link_column(&mut self.group, &mut self.alloc, tk, name, target, strong)
    }

    /// Adds a List/Set column whose entries are links into `target`.
    pub fn add_object_collection_column(
        &mut self,
        tk: TableKey,
        name: &str,
        ty: ColumnType,
        target: TableKey,
    ) -> Result<ColKey> {
        self.ensure_writing()?;
        table::add_object_collection_column(&mut self.group, &mut self.alloc, tk, name, ty, target)
    }

    /// Column key by name.
    pub fn column_key(&self, tk: TableKey, name: &str) -> Result<Option<ColKey>> {
        Ok(self.group.state(tk)?.col_by_name(name))
    }

    // -- objects ---------------------------------------------------------

    /// Creates an object in `tk`.
    pub fn create_object(&mut self, tk: TableKey) -> Result<ObjKey> {
        self.ensure_writing()?;
        let key = self.group.state_mut(tk)?.create_object(&mut self.alloc)?;
        self.group.bump_content_version();
        Ok(key)
    }

    /// Creates an object with a unique integer primary key.
    pub fn create_object_with_pk(&mut self, tk: TableKey, pk: i64) -> Result<ObjKey> {
        self.ensure_writing()?;
        let key = self
            .group
            .state_mut(tk)?
            .create_object_with_pk(&mut self.alloc, pk)?;
        self.group.bump_content_version();
        Ok(key)
    }

    /// Removes an object, cascading per link policies.
    pub fn remove_object(&mut self, tk: TableKey, key: ObjKey) -> Result<()> {
        self.ensure_writing()?;
        table::remove_object(&mut self.group, &mut self.alloc, tk, key)
    }

    /// Replaces an object with a tombstone (sync-style removal).
    pub fn invalidate_object(&mut self, tk: TableKey, key: ObjKey) -> Result<()> {
        self.ensure_writing()?;
        table::invalidate_object(&mut self.group, &mut self.alloc, tk, key)
    }

    /// Number of rows in `tk`.
    pub fn row_count(&self, tk: TableKey) -> Result<usize> {
        self.group.state(tk)?.row_count(&self.alloc)
    }

    /// True when the object exists.
    pub fn has_object(&self, tk: TableKey, key: ObjKey) -> Result<bool> {
        Ok(self.group.state(tk)?.row_of(&self.alloc, key)?.is_some())
    }

    /// All object keys of `tk` in row order.
    pub fn object_keys(&self, tk: TableKey) -> Result<Vec<ObjKey>> {
        self.group.state(tk)?.object_keys(&self.alloc)
    }

    // -- cells -----------------------------------------------------------

    /// Reads an int cell.
    pub fn get_int(&self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<Option<i64>> {
        self.group.state(tk)?.get_int(&self.alloc, key, ck)
    }

    /// Writes an int cell.
    pub fn set_int(&mut self, tk: TableKey, key: ObjKey, ck: ColKey, v: i64) -> Result<()> {
        self.ensure_writing()?;
        self.group
            .state_mut(tk)?
            .set_int(&mut self.alloc, key, ck, v)?;
        self.group.bump_content_version();
        Ok(())
    }

    /// Reads a bool cell.
    pub fn get_bool(&self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<bool> {
        self.group.state(tk)?.get_bool(&self.alloc, key, ck)
    }

    /// Writes a bool cell.
    pub fn set_bool(&mut self, tk: TableKey, key: ObjKey, ck: ColKey, v: bool) -> Result<()> {
        self.ensure_writing()?;
        self.group
            .state_mut(tk)?
            .set_bool(&mut self.alloc, key, ck, v)?;
        self.group.bump_content_version();
        Ok(())
    }

    /// Reads a string cell.
    pub fn get_string(&self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<Option<String>> {
        self.group.state(tk)?.get_string(&self.alloc, key, ck)
    }

    /// Writes a string cell.
    pub fn set_string(&mut self, tk: TableKey, key: ObjKey, ck: ColKey, v: &str) -> Result<()> {
        self.ensure_writing()?;
        self.group
            .state_mut(tk)?
            .set_string(&mut self.alloc, key, ck, v)?;
        self.group.bump_content_version();
        Ok(())
    }

    /// Nulls a nullable cell.
    pub fn set_null(&mut self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<()> {
        self.ensure_writing()?;
        self.group
            .state_mut(tk)?
            .set_null(&mut self.alloc, key, ck)?;
        self.group.bump_content_version();
        Ok(())
    }

    /// True when the cell is null.
    pub fn is_null(&self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<bool> {
        self.group.state(tk)?.is_null(&self.alloc, key, ck)
    }

    /// Reads a link cell; the bool flags a tombstoned target.
    pub fn get_link(&self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<Option<(ObjKey, bool)>> {
        self.group.state(tk)?.get_link(&self.alloc, key, ck)
    }

    /// Writes a link cell, maintaining the target backlink.
    pub fn set_link(
        &mut self,
        tk: TableKey,
        key: ObjKey,
        ck: ColKey,
        target: Option<ObjKey>,
    ) -> Result<()> {
        self.ensure_writing()?;
        table::set_link(&mut self.group, &mut self.alloc, tk, key, ck, target)
    }

    // -- collections -----------------------------------------------------

    /// Binds a list accessor.
    pub fn list(&self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<List> {
        List::attach(&self.group, &self.alloc, tk, key, ck)
    }

    /// Binds a set accessor.
    pub fn set(&self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<Set> {
        Set::attach(&self.group, &self.alloc, tk, key, ck)
    }

    /// Binds a dictionary accessor.
    pub fn dictionary(&self, tk: TableKey, key: ObjKey, ck: ColKey) -> Result<Dictionary> {
        Dictionary::attach(&self.group, &self.alloc, tk, key, ck)
    }

    /// Starts a query on `tk`.
    pub fn query(&self, tk: TableKey) -> Query {
        Query::new(tk)
    }

    // -- lifecycle -------------------------------------------------------

    /// Commits and returns the new version. The transaction ends.
    pub fn commit(mut self) -> Result<u64> {
        let v = self.do_commit()?;
        self.release_everything();
        self.stage = TransactStage::Ready;
        Ok(v)
    }

    /// Commits, then continues as a read transaction on the new version.
    pub fn commit_and_continue_as_read(&mut self) -> Result<u64> {
        let new_version = self.do_commit()?;
        // Pin the fresh snapshot before releasing anything.
        let entry = self.db.lock.grab_version(new_version, 0)?;
        self.db.lock.release(self.version)?;
        self.version = entry.version;
        self.salt = entry.salt;
        self.top_ref = entry.top_ref;
        self.alloc.bind(entry.file_size)?;
        self.group = Group::attach(&self.alloc, entry.top_ref)?;
        self.release_writer_locks();
        self.stage = TransactStage::Reading;
        Ok(new_version)
    }

    /// Discards all tentative changes. The transaction ends.
    pub fn rollback(mut self) -> Result<()> {
        self.ensure_writing()?;
        self.alloc.reset_free_space_tracking();
        self.release_everything();
        self.stage = TransactStage::Ready;
        Ok(())
    }

    /// Discards tentative changes and continues reading the snapshot the
    /// write was based on.
    pub fn rollback_and_continue_as_read(&mut self) -> Result<()> {
        self.ensure_writing()?;
        self.alloc.reset_free_space_tracking();
        self.carry_free.clear();
        self.group = Group::attach(&self.alloc, self.top_ref)?;
        self.release_writer_locks();
        self.stage = TransactStage::Reading;
        Ok(())
    }

    /// Upgrades a read transaction to the write transaction, rebinding to
    /// the latest snapshot when newer commits landed in between.
    pub fn promote_to_write(&mut self) -> Result<()> {
        if self.stage != TransactStage::Reading {
            return Err(CoreError::WrongTransactState(
                "promote requires a read transaction",
            ));
        }
        let guard = self.db.lock.writer_mutex().lock_arc();
        self.db.lock.lock_writer_file()?;
        self.writer_guard = Some(guard);
        self.writer_file_locked = true;

        let entry = self.db.lock.grab_latest()?;
        if entry.version != self.version {
            self.db.lock.release(self.version)?;
            self.version = entry.version;
            self.salt = entry.salt;
            self.top_ref = entry.top_ref;
            self.alloc.bind(entry.file_size)?;
            self.group = Group::attach(&self.alloc, entry.top_ref)?;
        } else {
            // Already newest; drop the extra pin.
            self.db.lock.release(entry.version)?;
        }
        self.stage = TransactStage::Writing;
        self.load_free_lists()
    }

    fn do_commit(&mut self) -> Result<u64> {
        self.ensure_writing()?;
        let new_version = self.version + 1;

        // Free the superseded snapshot's top-level shells. Deferred reuse
        // keeps them readable for older snapshots.
        group::free_top_shells(&mut self.alloc, self.top_ref)?;

        // Seal the free list: nothing below may allocate from it, and the
        // flush itself is free-free by construction.
        let mut regions = std::mem::take(&mut self.carry_free);
        regions.extend_from_slice(self.alloc.remaining_free_ready());
        self.alloc.set_free_ready(Vec::new());
        let mut current = self.alloc.take_free_current();
        for r in &mut current {
            r.version = new_version;
        }
        regions.extend(current);

        let (top_ref, logical_size) = self.group.flush(&mut self.alloc, new_version, &regions)?;
        let leftover = self.alloc.take_free_current();
        if !leftover.is_empty() {
            // The flush is built not to free; anything here would be space
            // missing from the just-written free list.
            warn!(regions = leftover.len(), "commit flush released storage late; leaking it");
        }

        let sync = self.db.options.durability == DurabilityLevel::Full;
        self.alloc.flush_slab(sync)?;

        // Two-slot header swap: stage the new top, sync, flip, sync.
        let mut header = FileHeader::read(self.alloc.backing().read(0, HEADER_SIZE)?)?
            .ok_or_else(|| CoreError::InvalidDatabase("header vanished".into()))?;
        let staging = header.staging_slot();
        header.top_refs[staging] = top_ref;
        let mut bytes = [0u8; HEADER_SIZE];
        header.write(&mut bytes)?;
        self.alloc.backing_mut().write(0, &bytes)?;
        self.alloc.backing_mut().flush(sync)?;
        header.selector = staging as u8;
        header.write(&mut bytes)?;
        self.alloc.backing_mut().write(0, &bytes)?;
        self.alloc.backing_mut().flush(sync)?;

        self.db.lock.publish(new_version, top_ref, logical_size)?;
        self.alloc.adopt_commit(logical_size);
        self.top_ref = top_ref;

        {
            let mut latest = self.db.version_signal.lock();
            if new_version > *latest {
                *latest = new_version;
            }
            self.db.version_cv.notify_all();
        }
        debug!(version = new_version, top_ref, logical_size, "committed");
        Ok(new_version)
    }

    fn release_writer_locks(&mut self) {
        if self.writer_file_locked {
            let _ = self.db.lock.unlock_writer_file();
            self.writer_file_locked = false;
        }
        self.writer_guard = None;
    }

    fn release_everything(&mut self) {
        if self.read_pinned {
            let _ = self.db.lock.release(self.version);
            self.read_pinned = false;
        }
        self.release_writer_locks();
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        // An unfinished write rolls back implicitly: nothing was published,
        // and the slab dies with the allocator.
        self.release_everything();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_tmp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("test.tsra"), DbOptions::default()).unwrap();
        (dir, db)
    }

    #[test]
    fn fresh_db_reads_as_version_one() {
        let (_dir, db) = open_tmp();
        let tx = db.start_read(VersionId::latest()).unwrap();
        assert_eq!(tx.version().version, 1);
        assert!(tx.table_keys().is_empty());
    }

    #[test]
    fn commit_bumps_version_by_one() {
        let (_dir, db) = open_tmp();
        let mut tx = db.start_write().unwrap();
        tx.add_table("t").unwrap();
        let v2 = tx.commit().unwrap();
        assert_eq!(v2, 2);
        let mut tx = db.start_write().unwrap();
        tx.add_table("u").unwrap();
        assert_eq!(tx.commit().unwrap(), 3);
    }

    #[test]
    fn mutation_on_read_tx_is_wrong_state() {
        let (_dir, db) = open_tmp();
        let mut tx = db.start_read(VersionId::latest()).unwrap();
        assert!(matches!(
            tx.add_table("t"),
            Err(CoreError::WrongTransactState(_))
        ));
    }

    #[test]
    fn reader_keeps_its_snapshot_across_commit() {
        let (_dir, db) = open_tmp();
        let reader = db.start_read(VersionId::latest()).unwrap();

        let mut writer = db.start_write().unwrap();
        let tk = writer.add_table("t").unwrap();
        let ck = writer.add_column(tk, "n", ColumnType::Int).unwrap();
        let obj = writer.create_object(tk).unwrap();
        writer.set_int(tk, obj, ck, 5).unwrap();
        writer.commit().unwrap();

        // The old reader still sees the empty group.
        assert!(reader.table_key("t").is_none());

        let fresh = db.start_read(VersionId::latest()).unwrap();
        let tk2 = fresh.table_key("t").unwrap();
        let keys = fresh.object_keys(tk2).unwrap();
        assert_eq!(keys.len(), 1);
        assert_eq!(fresh.get_int(tk2, keys[0], ck).unwrap(), Some(5));
    }

    #[test]
    fn rollback_discards_changes() {
        let (_dir, db) = open_tmp();
        let mut tx = db.start_write().unwrap();
        tx.add_table("gone").unwrap();
        tx.rollback().unwrap();
        let tx = db.start_read(VersionId::latest()).unwrap();
        assert!(tx.table_key("gone").is_none());
    }

    #[test]
    fn reopen_preserves_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("persist.tsra");
        {
            let db = Database::open(&path, DbOptions::default()).unwrap();
            let mut tx = db.start_write().unwrap();
            let tk = tx.add_table("t").unwrap();
            let ck = tx.add_column(tk, "n", ColumnType::Int).unwrap();
            let obj = tx.create_object(tk).unwrap();
            tx.set_int(tk, obj, ck, 1234).unwrap();
            tx.commit().unwrap();
        }
        // The previous handle is gone, so the leftover ring is detected as
        // stale and reseeded from the header.
        let db = Database::open(&path, DbOptions::default()).unwrap();
        let tx = db.start_read(VersionId::latest()).unwrap();
        let tk = tx.table_key("t").unwrap();
        let keys = tx.object_keys(tk).unwrap();
        let ck = tx.column_key(tk, "n").unwrap().unwrap();
        assert_eq!(tx.get_int(tk, keys[0], ck).unwrap(), Some(1234));
    }

    #[test]
    fn promote_and_continue_transitions() {
        let (_dir, db) = open_tmp();
        let mut tx = db.start_write().unwrap();
        tx.add_table("a").unwrap();
        let v = tx.commit_and_continue_as_read().unwrap();
        assert_eq!(tx.stage(), TransactStage::Reading);
        assert_eq!(tx.version().version, v);

        tx.promote_to_write().unwrap();
        assert_eq!(tx.stage(), TransactStage::Writing);
        tx.add_table("b").unwrap();
        tx.rollback_and_continue_as_read().unwrap();
        assert_eq!(tx.stage(), TransactStage::Reading);
        assert!(tx.table_key("b").is_none());
        assert!(tx.table_key("a").is_some());
    }

    #[test]
    fn bad_version_after_reap() {
        let (_dir, db) = open_tmp();
        for i in 0..3 {
            let mut tx = db.start_write().unwrap();
            tx.add_table(&format!("t{i}")).unwrap();
            tx.commit().unwrap();
        }
        // Version 1 had no readers; later publishes reaped it.
        assert!(matches!(
            db.start_read(VersionId::new(1, 0)),
            Err(CoreError::BadVersion(1))
        ));
    }
}
