//! Raw byte blobs sharing the array node header.
//!
//! A blob is a node whose payload is uninterpreted bytes; `size` counts
//! bytes instead of elements. Strings, changesets, and dictionary entries
//! are stored this way.

use crate::alloc::{Ref, SlabAlloc};
use crate::array::{flags, NodeHeader, HEADER_SIZE};
use crate::error::{CoreError, Result};

/// Largest blob a single node can carry (24-bit size field).
pub const MAX_BLOB_SIZE: usize = (1 << 24) - 1;

/// Allocates a blob node holding `data`.
pub fn create(alloc: &mut SlabAlloc, data: &[u8]) -> Result<Ref> {
    if data.len() > MAX_BLOB_SIZE {
        return Err(CoreError::InvalidArgument(format!(
            "blob of {} bytes exceeds node limit",
            data.len()
        )));
    }
    let cap = data.len().max(8).next_power_of_two();
    let r = alloc.alloc((HEADER_SIZE + cap) as u64)?;
    NodeHeader {
        flags: flags::BLOB,
        width: 8,
        size: data.len(),
        capacity: cap,
    }
    .write(alloc, r)?;
    let payload = alloc.translate_mut(r + HEADER_SIZE as u64, cap)?;
    payload[..data.len()].copy_from_slice(data);
    payload[data.len()..].fill(0);
    Ok(r)
}

/// Borrows the blob's bytes.
pub fn data(alloc: &SlabAlloc, r: Ref) -> Result<&[u8]> {
    let hdr = NodeHeader::read(alloc, r)?;
    if hdr.flags & flags::BLOB == 0 {
        return Err(CoreError::Corruption(format!("ref {r} is not a blob")));
    }
    let payload = alloc.translate(r + HEADER_SIZE as u64, hdr.capacity)?;
    Ok(&payload[..hdr.size])
}

/// Frees the blob node.
pub fn destroy(alloc: &mut SlabAlloc, r: Ref) -> Result<()> {
    let hdr = NodeHeader::read(alloc, r)?;
    alloc.free(r, hdr.node_bytes() as u64);
    Ok(())
}

/// Replaces the blob's contents, returning the (possibly moved) ref.
pub fn replace(alloc: &mut SlabAlloc, r: Ref, new_data: &[u8]) -> Result<Ref> {
    destroy(alloc, r)?;
    create(alloc, new_data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::Backing;
    use crate::alloc::SlabAlloc;

    #[test]
    fn roundtrip_and_replace() {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("blob.tsra"), None).unwrap();
        backing.grow(crate::alloc::HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(crate::alloc::HEADER_SIZE as u64).unwrap();

        let r = create(&mut alloc, b"hello").unwrap();
        assert_eq!(data(&alloc, r).unwrap(), b"hello");
        let r2 = replace(&mut alloc, r, b"a longer payload than before").unwrap();
        assert_eq!(data(&alloc, r2).unwrap(), b"a longer payload than before");
    }

    #[test]
    fn empty_blob() {
        let dir = tempfile::tempdir().unwrap();
        let mut backing = Backing::attach(dir.path().join("blob2.tsra"), None).unwrap();
        backing.grow(crate::alloc::HEADER_SIZE as u64).unwrap();
        let mut alloc = SlabAlloc::new(backing);
        alloc.bind(crate::alloc::HEADER_SIZE as u64).unwrap();

        let r = create(&mut alloc, b"").unwrap();
        assert_eq!(data(&alloc, r).unwrap(), b"");
    }
}
