//! Page-level encryption: AES-256-CBC data pages authenticated with
//! HMAC-SHA-224, arranged so plaintext never reaches disk.
//!
//! Every 4 KiB data page is encrypted independently. Each run of 64 data
//! pages is preceded by one 4 KiB metadata page holding an IV table with
//! 64 entries of `{iv1, hmac1, iv2, hmac2}`: the current and the previous
//! authentication state of the corresponding data page. A write bumps
//! `iv1` (skipping 0, which means "never written"), re-encrypting until
//! the first four bytes of the new HMAC differ from the old one so crash
//! recovery can always tell the two apart, then persists the table entry
//! before the ciphertext. A torn write is therefore recoverable: if
//! `hmac1` rejects the data on read, `hmac2` is tried, and a match there
//! restores the previous page state in memory.
//!
//! The 64-byte key splits into the AES key (first half) and the HMAC key
//! (second half).

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use hmac::{Hmac, Mac};
use parking_lot::Mutex;
use sha2::{Digest, Sha224, Sha256};
use tracing::{debug, error, warn};

use crate::alloc::file_map::{FileIo, StdFileIo};
use crate::error::{CoreError, Result};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;
type HmacSha224 = Hmac<Sha224>;

/// Size of one encryption page.
pub const PAGE_SIZE: usize = 4096;

/// Data pages covered by one metadata page.
pub const PAGES_PER_META: usize = 64;

/// Bytes of one IV-table entry.
pub const IV_ENTRY_SIZE: usize = 64;

const HMAC_SIZE: usize = 28;

/// One IV-table entry: current and previous (IV, HMAC) pairs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IvEntry {
    /// Current IV counter; 0 means the page was never written.
    pub iv1: u32,
    /// HMAC of the current ciphertext.
    pub hmac1: [u8; HMAC_SIZE],
    /// Previous IV counter.
    pub iv2: u32,
    /// HMAC of the previous ciphertext.
    pub hmac2: [u8; HMAC_SIZE],
}

impl IvEntry {
    fn zero() -> Self {
        Self {
            iv1: 0,
            hmac1: [0; HMAC_SIZE],
            iv2: 0,
            hmac2: [0; HMAC_SIZE],
        }
    }

    fn decode(b: &[u8]) -> Self {
        let mut e = Self::zero();
        e.iv1 = u32::from_le_bytes(b[0..4].try_into().unwrap());
        e.hmac1.copy_from_slice(&b[4..32]);
        e.iv2 = u32::from_le_bytes(b[32..36].try_into().unwrap());
        e.hmac2.copy_from_slice(&b[36..64]);
        e
    }

    fn encode(&self) -> [u8; IV_ENTRY_SIZE] {
        let mut b = [0u8; IV_ENTRY_SIZE];
        b[0..4].copy_from_slice(&self.iv1.to_le_bytes());
        b[4..32].copy_from_slice(&self.hmac1);
        b[32..36].copy_from_slice(&self.iv2.to_le_bytes());
        b[36..64].copy_from_slice(&self.hmac2);
        b
    }
}

/// Physical file offset of logical data page `idx`.
///
/// Every 65th physical page is a metadata page, and the first page of the
/// file is one, so data page 0 lives at physical 4096.
pub fn data_page_offset(idx: u64) -> u64 {
    idx * PAGE_SIZE as u64 + (idx / PAGES_PER_META as u64 + 1) * PAGE_SIZE as u64
}

/// Physical file offset of the IV-table entry for data page `idx`.
pub fn iv_entry_offset(idx: u64) -> u64 {
    let meta_block = idx / PAGES_PER_META as u64;
    let meta_index = idx % PAGES_PER_META as u64;
    meta_block * (PAGES_PER_META as u64 + 1) * PAGE_SIZE as u64 + meta_index * IV_ENTRY_SIZE as u64
}

/// Physical size needed for `pages` data pages.
pub fn physical_size(pages: u64) -> u64 {
    if pages == 0 {
        return 0;
    }
    data_page_offset(pages - 1) + PAGE_SIZE as u64
}

/// Outcome of a page read.
#[derive(Debug, PartialEq, Eq)]
pub enum PageRead {
    /// Plaintext recovered into the destination buffer.
    Ok,
    /// Page was never written (or is ftruncate-grown zeroes); destination
    /// is zero-filled.
    Uninitialized,
}

/// Runs one raw I/O operation of the page handler under its fault policy:
/// a transient failure is retried once (positioned I/O re-derives the file
/// view on each attempt, this handler's analog of remapping first), and a
/// second failure terminates the process. This path stands in for a fault
/// handler, which cannot safely unwind.
fn retry_or_abort(page: u64, what: &str, mut op: impl FnMut() -> Result<()>) -> Result<()> {
    let first = match op() {
        Ok(()) => return Ok(()),
        Err(e) => e,
    };
    if !matches!(first, CoreError::Io(_)) {
        return Err(first);
    }
    warn!(page, what, error = %first, "page I/O failed; remapping and retrying once");
    match op() {
        Ok(()) => Ok(()),
        Err(second) => {
            error!(page, what, error = %second, "page I/O failed after retry; terminating");
            std::process::abort();
        }
    }
}

/// Stateless-per-page AES/HMAC engine plus the cached IV table.
pub struct PageCryptor {
    aes_key: [u8; 32],
    hmac_key: [u8; 32],
    iv_buffer: Vec<IvEntry>,
    iv_loaded: Vec<bool>,
}

impl PageCryptor {
    /// Builds a cryptor from the 64-byte database key.
    pub fn new(key: &[u8; 64]) -> Self {
        let mut aes_key = [0u8; 32];
        let mut hmac_key = [0u8; 32];
        aes_key.copy_from_slice(&key[..32]);
        hmac_key.copy_from_slice(&key[32..]);
        Self {
            aes_key,
            hmac_key,
            iv_buffer: Vec::new(),
            iv_loaded: Vec::new(),
        }
    }

    /// Grows the cached IV table to cover `pages` data pages, rounded up to
    /// a whole table span. Never shrinks on truncation; stale tail entries
    /// are overwritten on the next growth.
    pub fn set_file_size(&mut self, pages: u64) {
        let spans = (pages as usize + PAGES_PER_META - 1) / PAGES_PER_META;
        let want = spans * PAGES_PER_META;
        if want > self.iv_buffer.len() {
            self.iv_buffer.resize(want, IvEntry::zero());
            self.iv_loaded.resize(want, false);
        }
    }

    fn entry(&mut self, io: &StdFileIo, idx: u64) -> Result<IvEntry> {
        self.set_file_size(idx + 1);
        let i = idx as usize;
        if !self.iv_loaded[i] {
            let mut raw = [0u8; IV_ENTRY_SIZE];
            retry_or_abort(idx, "iv table read", || {
                io.read_at(iv_entry_offset(idx), &mut raw)
            })?;
            self.iv_buffer[i] = IvEntry::decode(&raw);
            self.iv_loaded[i] = true;
        }
        Ok(self.iv_buffer[i])
    }

    fn iv_bytes(iv: u32, idx: u64) -> [u8; 16] {
        let mut b = [0u8; 16];
        b[0..4].copy_from_slice(&iv.to_le_bytes());
        b[4..12].copy_from_slice(&idx.to_le_bytes());
        b
    }

    fn crypt_encrypt(&self, idx: u64, iv: u32, plain: &[u8]) -> Vec<u8> {
        let enc = Aes256CbcEnc::new(&self.aes_key.into(), &Self::iv_bytes(iv, idx).into());
        enc.encrypt_padded_vec_mut::<NoPadding>(plain)
    }

    fn crypt_decrypt(&self, idx: u64, iv: u32, cipher: &[u8]) -> Result<Vec<u8>> {
        let dec = Aes256CbcDec::new(&self.aes_key.into(), &Self::iv_bytes(iv, idx).into());
        dec.decrypt_padded_vec_mut::<NoPadding>(cipher)
            .map_err(|_| CoreError::DecryptionFailed(idx))
    }

    fn hmac(&self, data: &[u8]) -> [u8; HMAC_SIZE] {
        let mut mac =
            HmacSha224::new_from_slice(&self.hmac_key).expect("hmac accepts any key length");
        mac.update(data);
        let out = mac.finalize().into_bytes();
        let mut h = [0u8; HMAC_SIZE];
        h.copy_from_slice(&out);
        h
    }

    /// Constant-time-ish HMAC comparison.
    fn check_hmac(&self, data: &[u8], expect: &[u8; HMAC_SIZE]) -> bool {
        let got = self.hmac(data);
        let mut diff = 0u8;
        for i in 0..HMAC_SIZE {
            diff |= got[i] ^ expect[i];
        }
        diff == 0
    }

    /// Reads and authenticates data page `idx` into `dst`.
    pub fn read_page(&mut self, io: &StdFileIo, idx: u64, dst: &mut [u8]) -> Result<PageRead> {
        debug_assert_eq!(dst.len(), PAGE_SIZE);
        let entry = self.entry(io, idx)?;
        if entry.iv1 == 0 {
            dst.fill(0);
            return Ok(PageRead::Uninitialized);
        }
        let mut cipher = vec![0u8; PAGE_SIZE];
        retry_or_abort(idx, "data page read", || {
            io.read_at(data_page_offset(idx), &mut cipher)
        })?;

        if self.check_hmac(&cipher, &entry.hmac1) {
            let plain = self.crypt_decrypt(idx, entry.iv1, &cipher)?;
            dst.copy_from_slice(&plain);
            return Ok(PageRead::Ok);
        }
        if entry.iv2 != 0 && self.check_hmac(&cipher, &entry.hmac2) {
            // Crash landed between the IV-table write and the data write:
            // the data on disk is still the previous version. Restore the
            // previous slot as current, in memory only.
            warn!(page = idx, "recovered page from previous IV slot");
            let i = idx as usize;
            self.iv_buffer[i].iv1 = entry.iv2;
            self.iv_buffer[i].hmac1 = entry.hmac2;
            let plain = self.crypt_decrypt(idx, entry.iv2, &cipher)?;
            dst.copy_from_slice(&plain);
            return Ok(PageRead::Ok);
        }
        if cipher.iter().all(|&b| b == 0) {
            // An ftruncate-grown region reads as zeroes; not an error.
            dst.fill(0);
            return Ok(PageRead::Uninitialized);
        }
        Err(CoreError::DecryptionFailed(idx))
    }

    /// Computes the next write of page `idx` without touching the file:
    /// returns the staged IV-table entry and the ciphertext. The caller
    /// writes the entry, syncs, then writes the ciphertext.
    pub fn stage_write(&mut self, io: &StdFileIo, idx: u64, plain: &[u8]) -> Result<StagedWrite> {
        debug_assert_eq!(plain.len(), PAGE_SIZE);
        let mut entry = self.entry(io, idx)?;
        entry.iv2 = entry.iv1;
        entry.hmac2 = entry.hmac1;
        let cipher = loop {
            entry.iv1 = entry.iv1.wrapping_add(1);
            if entry.iv1 == 0 {
                entry.iv1 = 1;
            }
            let cipher = self.crypt_encrypt(idx, entry.iv1, plain);
            entry.hmac1 = self.hmac(&cipher);
            // Recovery must be able to tell the slots apart by their first
            // four bytes.
            if entry.hmac1[..4] != entry.hmac2[..4] || entry.iv2 == 0 {
                break cipher;
            }
        };
        let i = idx as usize;
        self.iv_buffer[i] = entry;
        self.iv_loaded[i] = true;
        Ok(StagedWrite {
            meta_offset: iv_entry_offset(idx),
            meta_bytes: entry.encode(),
            data_offset: data_page_offset(idx),
            ciphertext: cipher,
        })
    }

    /// Writes one page with the full crash-safe ordering: entry, sync,
    /// ciphertext.
    pub fn write_page(&mut self, io: &StdFileIo, idx: u64, plain: &[u8], sync: bool) -> Result<()> {
        let staged = self.stage_write(io, idx, plain)?;
        retry_or_abort(idx, "iv table write", || {
            io.write_at(staged.meta_offset, &staged.meta_bytes)
        })?;
        if sync {
            retry_or_abort(idx, "iv table sync", || io.sync_all())?;
        }
        retry_or_abort(idx, "data page write", || {
            io.write_at(staged.data_offset, &staged.ciphertext)
        })?;
        if sync {
            retry_or_abort(idx, "data page sync", || io.sync_all())?;
        }
        Ok(())
    }
}

/// A staged page write: metadata first, then ciphertext.
pub struct StagedWrite {
    /// Where the IV-table entry goes.
    pub meta_offset: u64,
    /// Encoded entry.
    pub meta_bytes: [u8; IV_ENTRY_SIZE],
    /// Where the ciphertext goes.
    pub data_offset: u64,
    /// Encrypted page.
    pub ciphertext: Vec<u8>,
}

/// In-process coherence between multiple mappings of one encrypted file:
/// a writer marks pages unreadable in every sibling mapping, which
/// re-fetches them on its next refresh.
#[derive(Debug)]
pub struct MappingRegistry {
    next_id: AtomicU64,
    members: Mutex<Vec<(u64, Arc<Mutex<BTreeSet<u64>>>)>>,
}

impl MappingRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            members: Mutex::new(Vec::new()),
        }
    }

    fn register(&self, stale: Arc<Mutex<BTreeSet<u64>>>) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.members.lock().push((id, stale));
        id
    }

    fn unregister(&self, id: u64) {
        self.members.lock().retain(|(i, _)| *i != id);
    }

    fn mark_unreadable(&self, from: u64, pages: &BTreeSet<u64>) {
        for (id, stale) in self.members.lock().iter() {
            if *id != from {
                stale.lock().extend(pages.iter().copied());
            }
        }
    }
}

impl Default for MappingRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Decrypt-on-attach view of an encrypted file, presenting one contiguous
/// plaintext byte range to the allocator.
pub struct EncryptedMapping {
    io: StdFileIo,
    cryptor: PageCryptor,
    buf: Vec<u8>,
    dirty: BTreeSet<u64>,
    registry: Option<Arc<MappingRegistry>>,
    registry_id: u64,
    stale: Arc<Mutex<BTreeSet<u64>>>,
}

impl EncryptedMapping {
    /// Attaches and decrypts the whole committed range.
    pub fn attach(io: StdFileIo, key: &[u8; 64]) -> Result<Self> {
        Self::attach_registered(io, key, None)
    }

    /// Attaches with a coherence registry shared by sibling mappings.
    pub fn attach_registered(
        io: StdFileIo,
        key: &[u8; 64],
        registry: Option<Arc<MappingRegistry>>,
    ) -> Result<Self> {
        let mut cryptor = PageCryptor::new(key);
        let physical = io.len()?;
        let pages = pages_for_physical(physical);
        cryptor.set_file_size(pages);
        let mut buf = vec![0u8; (pages as usize) * PAGE_SIZE];
        for p in 0..pages {
            let dst = &mut buf[p as usize * PAGE_SIZE..(p as usize + 1) * PAGE_SIZE];
            cryptor.read_page(&io, p, dst)?;
        }
        let stale = Arc::new(Mutex::new(BTreeSet::new()));
        let registry_id = registry
            .as_ref()
            .map(|r| r.register(stale.clone()))
            .unwrap_or(0);
        debug!(pages, "attached encrypted mapping");
        Ok(Self {
            io,
            cryptor,
            buf,
            dirty: BTreeSet::new(),
            registry,
            registry_id,
            stale,
        })
    }

    /// Logical length of the decrypted view.
    pub fn logical_len(&self) -> u64 {
        self.buf.len() as u64
    }

    /// Re-reads pages siblings have overwritten since the last refresh.
    pub fn refresh(&mut self) -> Result<()> {
        let pages: Vec<u64> = std::mem::take(&mut *self.stale.lock()).into_iter().collect();
        for p in pages {
            let start = p as usize * PAGE_SIZE;
            if start >= self.buf.len() {
                continue;
            }
            let dst = &mut self.buf[start..start + PAGE_SIZE];
            self.cryptor.iv_loaded[p as usize] = false;
            self.cryptor.read_page(&self.io, p, dst)?;
        }
        Ok(())
    }

    /// Borrows plaintext.
    pub fn read(&self, off: u64, len: usize) -> Result<&[u8]> {
        let end = off as usize + len;
        if end > self.buf.len() {
            return Err(CoreError::Corruption("encrypted read beyond end".into()));
        }
        Ok(&self.buf[off as usize..end])
    }

    /// Borrows plaintext mutably, marking the covered pages dirty.
    pub fn read_mut(&mut self, off: u64, len: usize) -> Result<&mut [u8]> {
        let end = off as usize + len;
        if end > self.buf.len() {
            return Err(CoreError::Corruption("encrypted write beyond end".into()));
        }
        self.mark_dirty(off, len as u64);
        Ok(&mut self.buf[off as usize..end])
    }

    /// Copies plaintext in, marking the covered pages dirty.
    pub fn write(&mut self, off: u64, data: &[u8]) -> Result<()> {
        let end = off as usize + data.len();
        if end > self.buf.len() {
            return Err(CoreError::Corruption("encrypted write beyond end".into()));
        }
        self.buf[off as usize..end].copy_from_slice(data);
        self.mark_dirty(off, data.len() as u64);
        Ok(())
    }

    fn mark_dirty(&mut self, off: u64, len: u64) {
        let first = off / PAGE_SIZE as u64;
        let last = (off + len.max(1) - 1) / PAGE_SIZE as u64;
        for p in first..=last {
            self.dirty.insert(p);
        }
    }

    /// Grows the logical view to `new_len` (rounded up to whole pages) and
    /// the physical file to match.
    pub fn set_logical_len(&mut self, new_len: u64) -> Result<()> {
        let pages = (new_len + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
        let cur_pages = self.buf.len() as u64 / PAGE_SIZE as u64;
        if pages <= cur_pages {
            return Ok(());
        }
        self.buf.resize(pages as usize * PAGE_SIZE, 0);
        self.cryptor.set_file_size(pages);
        let phys = physical_size(pages);
        if self.io.len()? < phys {
            self.io.truncate(phys)?;
        }
        Ok(())
    }

    /// Encrypts and writes every dirty page: all IV-table entries first,
    /// one sync, then all ciphertexts, one sync. Per-page recovery via the
    /// dual slots is unaffected by the batching. Without `fsync` the writes
    /// still happen (readers attach from the file) but nothing is forced to
    /// stable storage.
    pub fn flush(&mut self, fsync: bool) -> Result<()> {
        if self.dirty.is_empty() {
            if fsync {
                retry_or_abort(0, "file sync", || self.io.sync_all())?;
            }
            return Ok(());
        }
        let dirty = std::mem::take(&mut self.dirty);
        let mut staged = Vec::with_capacity(dirty.len());
        for &p in &dirty {
            let start = p as usize * PAGE_SIZE;
            let plain = self.buf[start..start + PAGE_SIZE].to_vec();
            staged.push(self.cryptor.stage_write(&self.io, p, &plain)?);
        }
        for (s, &p) in staged.iter().zip(dirty.iter()) {
            retry_or_abort(p, "iv table write", || {
                self.io.write_at(s.meta_offset, &s.meta_bytes)
            })?;
        }
        if fsync {
            retry_or_abort(0, "iv table sync", || self.io.sync_all())?;
        }
        for (s, &p) in staged.iter().zip(dirty.iter()) {
            retry_or_abort(p, "data page write", || {
                self.io.write_at(s.data_offset, &s.ciphertext)
            })?;
        }
        if fsync {
            retry_or_abort(0, "data page sync", || self.io.sync_all())?;
        }
        if let Some(registry) = &self.registry {
            registry.mark_unreadable(self.registry_id, &dirty);
        }
        Ok(())
    }

    /// Full write-back plus fsync.
    pub fn sync(&mut self) -> Result<()> {
        self.flush(true)
    }
}

impl Drop for EncryptedMapping {
    fn drop(&mut self) {
        if let Some(registry) = &self.registry {
            registry.unregister(self.registry_id);
        }
    }
}

/// Number of whole data pages a physical file of `physical` bytes holds.
fn pages_for_physical(physical: u64) -> u64 {
    if physical == 0 {
        return 0;
    }
    let span = (PAGES_PER_META as u64 + 1) * PAGE_SIZE as u64;
    let full_spans = physical / span;
    let rem = physical % span;
    let rem_data = rem.saturating_sub(PAGE_SIZE as u64) / PAGE_SIZE as u64;
    full_spans * PAGES_PER_META as u64 + rem_data
}

/// Verifies the 64-byte key against the fingerprint sidecar next to the
/// database, creating the fingerprint on first use. A mismatch aborts with
/// a message telling the operator whether to suspect the key or the file.
pub fn verify_key_fingerprint(db_path: &Path, key: &[u8; 64]) -> Result<()> {
    let dir = db_path.parent().unwrap_or_else(|| Path::new("."));
    let fp_path = dir.join("encryption_key_fingerprint");
    let fingerprint = hex(&Sha256::digest(key));
    match std::fs::read_to_string(&fp_path) {
        Ok(stored) => {
            if stored.trim() != fingerprint {
                return Err(CoreError::InvalidDatabase(format!(
                    "encryption key fingerprint mismatch for {}: either the key is wrong \
                     or the files in this directory belong to a different key",
                    db_path.display()
                )));
            }
            Ok(())
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            std::fs::write(&fp_path, fingerprint)?;
            Ok(())
        }
        Err(e) => Err(CoreError::Io(e)),
    }
}

fn hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 64] {
        let mut key = [0u8; 64];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i * 7 + 3) as u8;
        }
        key
    }

    fn test_io(dir: &tempfile::TempDir, name: &str) -> StdFileIo {
        StdFileIo::open_rw(dir.path().join(name)).unwrap()
    }

    #[test]
    fn offset_mapping_layout() {
        // First physical page is metadata.
        assert_eq!(data_page_offset(0), 4096);
        assert_eq!(data_page_offset(63), 64 * 4096);
        // Page 64 skips the second metadata page.
        assert_eq!(data_page_offset(64), 66 * 4096);
        assert_eq!(iv_entry_offset(0), 0);
        assert_eq!(iv_entry_offset(1), 64);
        assert_eq!(iv_entry_offset(64), 65 * 4096);
        // Round-trip through physical sizing.
        assert_eq!(pages_for_physical(physical_size(1)), 1);
        assert_eq!(pages_for_physical(physical_size(64)), 64);
        assert_eq!(pages_for_physical(physical_size(65)), 65);
        assert_eq!(pages_for_physical(physical_size(200)), 200);
    }

    #[test]
    fn page_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let io = test_io(&dir, "page.enc");
        io.truncate(physical_size(2)).unwrap();
        let mut cryptor = PageCryptor::new(&test_key());

        let mut plain = vec![0u8; PAGE_SIZE];
        for (i, b) in plain.iter_mut().enumerate() {
            *b = (i % 251) as u8;
        }
        cryptor.write_page(&io, 0, &plain, true).unwrap();

        // On-disk bytes differ from plaintext.
        let mut raw = vec![0u8; PAGE_SIZE];
        io.read_at(data_page_offset(0), &mut raw).unwrap();
        assert_ne!(raw, plain);

        // A fresh cryptor (fresh IV cache) decrypts it.
        let mut cryptor2 = PageCryptor::new(&test_key());
        let mut out = vec![0u8; PAGE_SIZE];
        assert_eq!(cryptor2.read_page(&io, 0, &mut out).unwrap(), PageRead::Ok);
        assert_eq!(out, plain);
    }

    #[test]
    fn unwritten_page_is_uninitialized() {
        let dir = tempfile::tempdir().unwrap();
        let io = test_io(&dir, "fresh.enc");
        io.truncate(physical_size(3)).unwrap();
        let mut cryptor = PageCryptor::new(&test_key());
        let mut out = vec![0xffu8; PAGE_SIZE];
        assert_eq!(
            cryptor.read_page(&io, 2, &mut out).unwrap(),
            PageRead::Uninitialized
        );
        assert!(out.iter().all(|&b| b == 0));
    }

    #[test]
    fn torn_write_recovers_previous_plaintext() {
        let dir = tempfile::tempdir().unwrap();
        let io = test_io(&dir, "torn.enc");
        io.truncate(physical_size(1)).unwrap();
        let mut cryptor = PageCryptor::new(&test_key());

        let old = vec![0x11u8; PAGE_SIZE];
        cryptor.write_page(&io, 0, &old, true).unwrap();

        // Simulate a crash between the IV-table write and the data write:
        // stage a new version and persist only the metadata.
        let new = vec![0x22u8; PAGE_SIZE];
        let staged = cryptor.stage_write(&io, 0, &new).unwrap();
        io.write_at(staged.meta_offset, &staged.meta_bytes).unwrap();
        io.sync_all().unwrap();
        // Ciphertext never written.

        let mut reopened = PageCryptor::new(&test_key());
        let mut out = vec![0u8; PAGE_SIZE];
        assert_eq!(reopened.read_page(&io, 0, &mut out).unwrap(), PageRead::Ok);
        assert_eq!(out, old);
    }

    #[test]
    fn corrupt_both_slots_fails() {
        let dir = tempfile::tempdir().unwrap();
        let io = test_io(&dir, "corrupt.enc");
        io.truncate(physical_size(1)).unwrap();
        let mut cryptor = PageCryptor::new(&test_key());
        cryptor.write_page(&io, 0, &vec![7u8; PAGE_SIZE], true).unwrap();
        cryptor.write_page(&io, 0, &vec![8u8; PAGE_SIZE], true).unwrap();

        // Flip ciphertext bytes so neither hmac validates.
        let mut raw = vec![0u8; PAGE_SIZE];
        io.read_at(data_page_offset(0), &mut raw).unwrap();
        raw[0] ^= 0xff;
        raw[100] ^= 0xff;
        io.write_at(data_page_offset(0), &raw).unwrap();

        let mut reopened = PageCryptor::new(&test_key());
        let mut out = vec![0u8; PAGE_SIZE];
        assert!(matches!(
            reopened.read_page(&io, 0, &mut out),
            Err(CoreError::DecryptionFailed(0))
        ));
    }

    #[test]
    fn iv_skips_zero_and_hmac_prefixes_differ() {
        let dir = tempfile::tempdir().unwrap();
        let io = test_io(&dir, "iv.enc");
        io.truncate(physical_size(1)).unwrap();
        let mut cryptor = PageCryptor::new(&test_key());
        let plain = vec![1u8; PAGE_SIZE];
        for _ in 0..3 {
            cryptor.write_page(&io, 0, &plain, false).unwrap();
        }
        let mut raw = [0u8; IV_ENTRY_SIZE];
        io.read_at(iv_entry_offset(0), &mut raw).unwrap();
        let entry = IvEntry::decode(&raw);
        assert!(entry.iv1 != 0);
        assert_ne!(entry.hmac1[..4], entry.hmac2[..4]);
    }

    #[test]
    fn mapping_roundtrip_and_coherence() {
        let dir = tempfile::tempdir().unwrap();
        let key = test_key();
        let registry = Arc::new(MappingRegistry::new());
        let path = dir.path().join("map.enc");

        let mut a = EncryptedMapping::attach_registered(
            StdFileIo::open_rw(&path).unwrap(),
            &key,
            Some(registry.clone()),
        )
        .unwrap();
        a.set_logical_len(3 * PAGE_SIZE as u64).unwrap();

        let mut b = EncryptedMapping::attach_registered(
            StdFileIo::open_rw(&path).unwrap(),
            &key,
            Some(registry.clone()),
        )
        .unwrap();
        b.set_logical_len(3 * PAGE_SIZE as u64).unwrap();

        a.write(10, b"sealed payload").unwrap();
        a.sync().unwrap();

        // Sibling mapping was marked unreadable and re-fetches on refresh.
        b.refresh().unwrap();
        assert_eq!(b.read(10, 14).unwrap(), b"sealed payload");
    }

    #[test]
    fn fingerprint_mismatch_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let db = dir.path().join("enc.tsra");
        let key = test_key();
        verify_key_fingerprint(&db, &key).unwrap();
        verify_key_fingerprint(&db, &key).unwrap();
        let mut other = key;
        other[0] ^= 1;
        assert!(matches!(
            verify_key_fingerprint(&db, &other),
            Err(CoreError::InvalidDatabase(_))
        ));
    }
}
