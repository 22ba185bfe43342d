//! On-disk file header with the dual top-ref slots.

use crate::error::{CoreError, Result};

const MAGIC: &[u8; 4] = b"TSRA";

/// Size of the fixed header region at offset 0.
pub const HEADER_SIZE: usize = 24;

/// Current file format version written by this library.
pub const CURRENT_FILE_FORMAT: u16 = 1;

const HDR_TOP_SLOT_0: usize = 0;
const HDR_TOP_SLOT_1: usize = 8;
const HDR_MAGIC: usize = 16;
const HDR_FORMAT: usize = 20;
const HDR_FLAGS: usize = 23;

/// Decoded view of the header region.
///
/// Two top-ref slots are kept so a commit can stage the new top ref next to
/// the old one and switch between them with a single byte write. The flags
/// byte's bit 0 selects the current slot.
#[derive(Debug, Clone)]
pub struct FileHeader {
    /// The two persisted top-ref slots.
    pub top_refs: [u64; 2],
    /// File format version found in the header.
    pub format_version: u16,
    /// Which slot is current (0 or 1).
    pub selector: u8,
}

impl FileHeader {
    /// Header for a freshly initialized file with no committed top yet.
    pub fn new() -> Self {
        Self {
            top_refs: [0, 0],
            format_version: CURRENT_FILE_FORMAT,
            selector: 0,
        }
    }

    /// Decodes the header region. Returns `None` for an all-zero region
    /// (freshly created, never committed file).
    pub fn read(data: &[u8]) -> Result<Option<Self>> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::InvalidDatabase(
                "file shorter than header".into(),
            ));
        }
        if data[..HEADER_SIZE].iter().all(|&b| b == 0) {
            return Ok(None);
        }
        if &data[HDR_MAGIC..HDR_MAGIC + 4] != MAGIC {
            return Err(CoreError::InvalidDatabase("header magic mismatch".into()));
        }
        let format_version = u16::from_le_bytes([data[HDR_FORMAT], data[HDR_FORMAT + 1]]);
        if format_version > CURRENT_FILE_FORMAT {
            return Err(CoreError::InvalidDatabase(format!(
                "file format {format_version} is newer than this library"
            )));
        }
        let top_refs = [
            u64::from_le_bytes(data[HDR_TOP_SLOT_0..HDR_TOP_SLOT_0 + 8].try_into().unwrap()),
            u64::from_le_bytes(data[HDR_TOP_SLOT_1..HDR_TOP_SLOT_1 + 8].try_into().unwrap()),
        ];
        Ok(Some(Self {
            top_refs,
            format_version,
            selector: data[HDR_FLAGS] & 1,
        }))
    }

    /// Encodes the full header region.
    pub fn write(&self, data: &mut [u8]) -> Result<()> {
        if data.len() < HEADER_SIZE {
            return Err(CoreError::InvalidDatabase(
                "header region shorter than expected".into(),
            ));
        }
        data[..HEADER_SIZE].fill(0);
        data[HDR_TOP_SLOT_0..HDR_TOP_SLOT_0 + 8].copy_from_slice(&self.top_refs[0].to_le_bytes());
        data[HDR_TOP_SLOT_1..HDR_TOP_SLOT_1 + 8].copy_from_slice(&self.top_refs[1].to_le_bytes());
        data[HDR_MAGIC..HDR_MAGIC + 4].copy_from_slice(MAGIC);
        data[HDR_FORMAT..HDR_FORMAT + 2].copy_from_slice(&self.format_version.to_le_bytes());
        data[HDR_FLAGS] = self.selector & 1;
        Ok(())
    }

    /// Ref stored in the current slot.
    pub fn current_top(&self) -> u64 {
        self.top_refs[self.selector as usize]
    }

    /// Index of the slot a commit should stage the next top ref into.
    pub fn staging_slot(&self) -> usize {
        (self.selector ^ 1) as usize
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut hdr = FileHeader::new();
        hdr.top_refs = [24, 1032];
        hdr.selector = 1;
        let mut buf = [0u8; HEADER_SIZE];
        hdr.write(&mut buf).unwrap();
        let back = FileHeader::read(&buf).unwrap().expect("non-empty header");
        assert_eq!(back.top_refs, [24, 1032]);
        assert_eq!(back.selector, 1);
        assert_eq!(back.current_top(), 1032);
        assert_eq!(back.staging_slot(), 0);
    }

    #[test]
    fn all_zero_is_uninitialized() {
        let buf = [0u8; HEADER_SIZE];
        assert!(FileHeader::read(&buf).unwrap().is_none());
    }

    #[test]
    fn bad_magic_rejected() {
        let mut buf = [0u8; HEADER_SIZE];
        buf[16..20].copy_from_slice(b"NOPE");
        assert!(matches!(
            FileHeader::read(&buf),
            Err(CoreError::InvalidDatabase(_))
        ));
    }
}
