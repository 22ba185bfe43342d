//! Replication history: the changeset log external sync consumes.
//!
//! The engine persists the history ref in the same top array as the data
//! roots, so a commit moves both atomically: replaying the changesets
//! between two versions against the older snapshot always reproduces the
//! newer one.
//!
//! [`InFileHistory`] is the provided implementation: an in-file log of
//! opaque changeset blobs keyed by the version whose commit produced them.

use std::collections::VecDeque;

use crate::alloc::{Ref, SlabAlloc, NULL_REF};
use crate::array::{blob, flags, tag_int, untag_int, Array};
use crate::error::{CoreError, Result};
use crate::tree::Tree;
use crate::txn::{Transaction, VersionId};

/// History type tag for the in-file changeset log.
pub const HIST_IN_FILE: u64 = 1;

/// One recorded changeset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changeset {
    /// Version whose commit produced this changeset.
    pub version: u64,
    /// Opaque replication payload.
    pub data: Vec<u8>,
}

/// Iterator over recorded changesets, oldest first.
pub struct ChangesetIter {
    items: VecDeque<Changeset>,
}

impl Iterator for ChangesetIter {
    type Item = Changeset;

    fn next(&mut self) -> Option<Changeset> {
        self.items.pop_front()
    }
}

/// Hooks through which an external collaborator records and reads
/// changesets around the core's commit sequence.
pub trait History {
    /// Called when a write transaction begins. `history_was_updated` flags
    /// that another writer advanced the log since this history instance
    /// last saw it.
    fn initiate_transact(
        &mut self,
        tx: &mut Transaction,
        base_version: u64,
        history_was_updated: bool,
    ) -> Result<()>;

    /// Called immediately before the commit writes the top array; persists
    /// the pending changeset and returns the version the commit will
    /// publish.
    fn prepare_commit(&mut self, tx: &mut Transaction) -> Result<u64>;

    /// Called after the commit became durable.
    fn finalize_commit(&mut self);

    /// Called when the transaction rolls back instead.
    fn abort_transact(&mut self);

    /// Changesets for versions in `(from, to]`, oldest first.
    fn get_changesets(&self, tx: &Transaction, from: u64, to: u64) -> Result<ChangesetIter>;

    /// Records how far the sync client has progressed; returns the version
    /// the progress was recorded against.
    fn set_sync_progress(&mut self, tx: &mut Transaction, progress: u64) -> Result<VersionId>;

    /// Rebinds internal state to a history ref observed in a foreign
    /// snapshot (used after advancing over someone else's commits).
    fn update_from_ref(&mut self, history_ref: Ref, version: u64) -> Result<()>;
}

const HIST_VERSIONS: usize = 0;
const HIST_BLOBS: usize = 1;
const HIST_PROGRESS: usize = 2;
const HIST_SLOTS: usize = 3;

/// Changeset log stored inside the database file.
pub struct InFileHistory {
    pending: Option<Vec<u8>>,
    base_version: u64,
    last_seen_ref: Ref,
}

impl InFileHistory {
    /// New, unbound history instance.
    pub fn new() -> Self {
        Self {
            pending: None,
            base_version: 0,
            last_seen_ref: NULL_REF,
        }
    }

    /// Queues the changeset the current write transaction will publish.
    pub fn set_changeset(&mut self, data: Vec<u8>) {
        self.pending = Some(data);
    }

    fn load_log(alloc: &SlabAlloc, root: Ref) -> Result<Option<(Tree, Tree, u64)>> {
        if root == NULL_REF {
            return Ok(None);
        }
        let top = Array::from_ref(root);
        if top.size(alloc)? < HIST_SLOTS {
            return Err(CoreError::Corruption("history root too small".into()));
        }
        Ok(Some((
            Tree::from_ref(top.get(alloc, HIST_VERSIONS)? as u64, false),
            Tree::from_ref(top.get(alloc, HIST_BLOBS)? as u64, true),
            untag_int(top.get(alloc, HIST_PROGRESS)?),
        )))
    }

    fn store_log(
        alloc: &mut SlabAlloc,
        old_root: Ref,
        versions: &Tree,
        blobs: &Tree,
        progress: u64,
    ) -> Result<Ref> {
        if old_root != NULL_REF {
            Array::from_ref(old_root).destroy(alloc)?;
        }
        let mut top = Array::create(alloc, flags::HAS_REFS, 64, HIST_SLOTS)?;
        top.push(alloc, versions.root_ref() as i64)?;
        top.push(alloc, blobs.root_ref() as i64)?;
        top.push(alloc, tag_int(progress))?;
        Ok(top.ref_())
    }
}

impl Default for InFileHistory {
    fn default() -> Self {
        Self::new()
    }
}

impl History for InFileHistory {
    fn initiate_transact(
        &mut self,
        tx: &mut Transaction,
        base_version: u64,
        _history_was_updated: bool,
    ) -> Result<()> {
        let (group, _alloc) = tx.parts_mut()?;
        group.history_type = HIST_IN_FILE;
        self.base_version = base_version;
        self.pending = None;
        Ok(())
    }

    fn prepare_commit(&mut self, tx: &mut Transaction) -> Result<u64> {
        let new_version = tx.version().version + 1;
        let data = self.pending.clone().unwrap_or_default();
        let (group, alloc) = tx.parts_mut()?;
        let root = group.history_ref;
        let (mut versions, mut blobs, progress) = match Self::load_log(alloc, root)? {
            Some(log) => log,
            None => (
                Tree::create(alloc, false)?,
                Tree::create(alloc, true)?,
                0,
            ),
        };
        versions.push(alloc, new_version as i64)?;
        let blob_ref = blob::create(alloc, &data)?;
        blobs.push(alloc, blob_ref as i64)?;
        let new_root = Self::store_log(alloc, root, &versions, &blobs, progress)?;
        group.history_type = HIST_IN_FILE;
        group.history_ref = new_root;
        self.last_seen_ref = new_root;
        Ok(new_version)
    }

    fn finalize_commit(&mut self) {
        self.pending = None;
    }

    fn abort_transact(&mut self) {
        self.pending = None;
    }

    fn get_changesets(&self, tx: &Transaction, from: u64, to: u64) -> Result<ChangesetIter> {
        let (group, alloc) = tx.parts();
        let mut items = VecDeque::new();
        if let Some((versions, blobs, _)) = Self::load_log(alloc, group.history_ref)? {
            let n = versions.size(alloc)?;
            for i in 0..n {
                let v = versions.get(alloc, i)? as u64;
                if v > from && v <= to {
                    let r = blobs.get(alloc, i)? as u64;
                    items.push_back(Changeset {
                        version: v,
                        data: blob::data(alloc, r)?.to_vec(),
                    });
                }
            }
        }
        Ok(ChangesetIter { items })
    }

    fn set_sync_progress(&mut self, tx: &mut Transaction, progress: u64) -> Result<VersionId> {
        let version = tx.version();
        let (group, alloc) = tx.parts_mut()?;
        let root = group.history_ref;
        let (versions, blobs, _) = match Self::load_log(alloc, root)? {
            Some(log) => log,
            None => (Tree::create(alloc, false)?, Tree::create(alloc, true)?, 0),
        };
        let new_root = Self::store_log(alloc, root, &versions, &blobs, progress)?;
        group.history_ref = new_root;
        self.last_seen_ref = new_root;
        Ok(version)
    }

    fn update_from_ref(&mut self, history_ref: Ref, version: u64) -> Result<()> {
        self.last_seen_ref = history_ref;
        self.base_version = version;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::{Database, DbOptions};

    fn history_opts() -> DbOptions {
        DbOptions {
            history_type: HIST_IN_FILE,
            ..DbOptions::default()
        }
    }

    #[test]
    fn changesets_replay_in_version_order() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("hist.tsra"), history_opts()).unwrap();
        let mut hist = InFileHistory::new();

        for payload in [b"first".to_vec(), b"second".to_vec(), b"third".to_vec()] {
            let mut tx = db.start_write().unwrap();
            let base = tx.version().version;
            hist.initiate_transact(&mut tx, base, false).unwrap();
            hist.set_changeset(payload);
            let prepared = hist.prepare_commit(&mut tx).unwrap();
            let committed = tx.commit().unwrap();
            assert_eq!(prepared, committed);
            hist.finalize_commit();
        }

        let tx = db.start_read(VersionId::latest()).unwrap();
        let got: Vec<Changeset> = hist.get_changesets(&tx, 1, u64::MAX).unwrap().collect();
        assert_eq!(got.len(), 3);
        assert_eq!(got[0].data, b"first");
        assert_eq!(got[2].data, b"third");
        assert!(got.windows(2).all(|w| w[0].version < w[1].version));

        // Bounded range excludes both endpoints correctly: (from, to].
        let partial: Vec<Changeset> = hist
            .get_changesets(&tx, got[0].version, got[1].version)
            .unwrap()
            .collect();
        assert_eq!(partial.len(), 1);
        assert_eq!(partial[0].data, b"second");
    }

    #[test]
    fn history_type_mismatch_rejected_at_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mismatch.tsra");
        {
            let db = Database::open(&path, history_opts()).unwrap();
            let mut hist = InFileHistory::new();
            let mut tx = db.start_write().unwrap();
            hist.initiate_transact(&mut tx, 1, false).unwrap();
            hist.set_changeset(b"x".to_vec());
            hist.prepare_commit(&mut tx).unwrap();
            tx.commit().unwrap();
        }
        let err = Database::open(&path, DbOptions::default()).unwrap_err();
        assert!(matches!(err, CoreError::IncompatibleHistories { .. }));
    }

    #[test]
    fn abort_discards_pending() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(dir.path().join("abort.tsra"), history_opts()).unwrap();
        let mut hist = InFileHistory::new();
        let mut tx = db.start_write().unwrap();
        hist.initiate_transact(&mut tx, 1, false).unwrap();
        hist.set_changeset(b"doomed".to_vec());
        hist.abort_transact();
        tx.rollback().unwrap();

        let mut tx = db.start_write().unwrap();
        hist.initiate_transact(&mut tx, 1, false).unwrap();
        hist.prepare_commit(&mut tx).unwrap();
        tx.commit().unwrap();
        let tx = db.start_read(VersionId::latest()).unwrap();
        let all: Vec<Changeset> = hist.get_changesets(&tx, 0, u64::MAX).unwrap().collect();
        assert_eq!(all.len(), 1);
        assert!(all[0].data.is_empty());
    }
}
