//! Data-driven description of the host memory a snapshot covers.
//!
//! A [`RegionCatalog`] is a flat list of top-level [`RegionDescriptor`]s at
//! fixed addresses. Each region may contain pointers to further regions whose
//! location is only known at runtime; those are described by
//! [`PointerRegion`]s, recursively. All memory traffic goes through a
//! [`MemoryAccessor`], so nothing here touches raw pointers.

use serde::{Deserialize, Serialize};

use crate::network::codec;
use crate::NetplayError;

/// Read and write access to the host's address space.
pub trait MemoryAccessor {
    /// Copies `buf.len()` bytes starting at `address` into `buf`.
    fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), NetplayError>;

    /// Copies `bytes` to `address`.
    fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), NetplayError>;

    /// Reads a pointer-sized value at `address`. Zero means null.
    fn read_pointer(&self, address: usize) -> Result<usize, NetplayError>;
}

/// A region reached through a pointer stored inside its parent.
///
/// The live address is `read_pointer(parent + src_offset) + dst_offset`. When
/// the stored pointer is null the whole subtree is saved as zeros and skipped
/// on restore.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointerRegion {
    /// Where the pointer lives, relative to the parent's start.
    pub src_offset: usize,
    /// Added to the pointer's value to find this region's start.
    pub dst_offset: usize,
    /// Bytes covered at the pointed-to address.
    pub size: usize,
    /// Pointers stored inside this region.
    pub children: Vec<PointerRegion>,
}

impl PointerRegion {
    /// A leaf pointer region.
    #[must_use]
    pub fn new(src_offset: usize, dst_offset: usize, size: usize) -> Self {
        Self {
            src_offset,
            dst_offset,
            size,
            children: Vec::new(),
        }
    }

    /// Adds a nested pointer region.
    #[must_use]
    pub fn with_child(mut self, child: PointerRegion) -> Self {
        self.children.push(child);
        self
    }

    /// Bytes this region and everything below it occupy in a snapshot.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.size + self.children.iter().map(Self::total_size).sum::<usize>()
    }

    fn resolve(&self, parent: usize, memory: &dyn MemoryAccessor) -> Result<Option<usize>, NetplayError> {
        let pointer = memory.read_pointer(parent + self.src_offset)?;
        Ok((pointer != 0).then(|| pointer + self.dst_offset))
    }
}

/// A region at a fixed address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionDescriptor {
    /// First byte of the region.
    pub address: usize,
    /// Bytes covered.
    pub size: usize,
    /// Pointers stored inside this region.
    pub children: Vec<PointerRegion>,
}

impl RegionDescriptor {
    /// A region without pointers.
    #[must_use]
    pub fn new(address: usize, size: usize) -> Self {
        Self {
            address,
            size,
            children: Vec::new(),
        }
    }

    /// Adds a pointer region stored inside this one.
    #[must_use]
    pub fn with_child(mut self, child: PointerRegion) -> Self {
        self.children.push(child);
        self
    }

    /// Bytes this region and its pointer subtrees occupy in a snapshot.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.size + self.children.iter().map(PointerRegion::total_size).sum::<usize>()
    }

    fn end(&self) -> usize {
        self.address + self.size
    }
}

/// The full list of regions captured by every snapshot.
///
/// ```
/// use rollback_netplay::{PointerRegion, RegionCatalog, RegionDescriptor};
///
/// let mut catalog = RegionCatalog::new();
/// catalog.push(RegionDescriptor::new(0x200, 8));
/// catalog.push(RegionDescriptor::new(0x100, 16).with_child(PointerRegion::new(0, 0, 4)));
/// catalog.push(RegionDescriptor::new(0x110, 16));
/// catalog.optimize();
/// assert_eq!(catalog.regions().len(), 2);
/// assert_eq!(catalog.total_size(), 16 + 4 + 16 + 8);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RegionCatalog {
    regions: Vec<RegionDescriptor>,
}

impl RegionCatalog {
    /// An empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a catalog from a list of regions.
    #[must_use]
    pub fn from_regions(regions: Vec<RegionDescriptor>) -> Self {
        Self { regions }
    }

    /// Decodes a catalog produced by [`RegionCatalog::to_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, NetplayError> {
        Ok(codec::decode_value(bytes)?)
    }

    /// Encodes the catalog with the crate codec.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NetplayError> {
        Ok(codec::encode(self)?)
    }

    /// Appends a region.
    pub fn push(&mut self, region: RegionDescriptor) {
        self.regions.push(region);
    }

    /// The regions, in snapshot order.
    #[must_use]
    pub fn regions(&self) -> &[RegionDescriptor] {
        &self.regions
    }

    /// Returns `true` if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Bytes one snapshot needs.
    #[must_use]
    pub fn total_size(&self) -> usize {
        self.regions.iter().map(RegionDescriptor::total_size).sum()
    }

    /// Sorts regions by address and merges those that are back to back.
    ///
    /// The second region's pointers are rebased onto the merged region, so
    /// the snapshot covers exactly the same bytes as before.
    pub fn optimize(&mut self) {
        let mut sorted = std::mem::take(&mut self.regions);
        sorted.sort_by_key(|region| region.address);

        let mut merged: Vec<RegionDescriptor> = Vec::with_capacity(sorted.len());
        for region in sorted {
            match merged.last_mut() {
                Some(previous) if previous.end() == region.address => {
                    let shift = previous.size;
                    previous.size += region.size;
                    previous
                        .children
                        .extend(region.children.into_iter().map(|mut child| {
                            child.src_offset += shift;
                            child
                        }));
                },
                _ => merged.push(region),
            }
        }
        self.regions = merged;
    }

    /// Checks that every pointer lies inside its parent.
    pub fn validate(&self) -> Result<(), NetplayError> {
        fn check(children: &[PointerRegion], parent_size: usize) -> Result<(), NetplayError> {
            for child in children {
                if child.src_offset >= parent_size {
                    return Err(NetplayError::InvalidRequest {
                        info: format!(
                            "pointer at offset {} lies outside its {}-byte parent",
                            child.src_offset, parent_size
                        ),
                    });
                }
                check(&child.children, child.size)?;
            }
            Ok(())
        }

        if self.regions.is_empty() {
            return Err(NetplayError::InvalidRequest {
                info: "region catalog is empty".to_owned(),
            });
        }
        for region in &self.regions {
            check(&region.children, region.size)?;
        }
        Ok(())
    }

    /// Copies every region's live bytes into `dump`, depth first.
    pub(crate) fn save_into(
        &self,
        memory: &dyn MemoryAccessor,
        mut dump: &mut [u8],
    ) -> Result<(), NetplayError> {
        for region in &self.regions {
            save_node(Some(region.address), region.size, &region.children, memory, &mut dump)?;
        }
        finished(dump.len())
    }

    /// Writes `dump` back over every region, depth first.
    ///
    /// Child pointers are resolved after their parent is restored, so they
    /// follow the restored pointer values.
    pub(crate) fn load_from(
        &self,
        memory: &mut dyn MemoryAccessor,
        mut dump: &[u8],
    ) -> Result<(), NetplayError> {
        for region in &self.regions {
            load_node(Some(region.address), region.size, &region.children, memory, &mut dump)?;
        }
        finished(dump.len())
    }
}

fn finished(remaining: usize) -> Result<(), NetplayError> {
    if remaining == 0 {
        Ok(())
    } else {
        Err(NetplayError::InternalError {
            context: format!("snapshot slot has {} unused bytes", remaining),
        })
    }
}

fn slot_overrun(len: usize) -> NetplayError {
    NetplayError::InternalError {
        context: format!("snapshot slot too small for a {}-byte region", len),
    }
}

fn save_node(
    address: Option<usize>,
    size: usize,
    children: &[PointerRegion],
    memory: &dyn MemoryAccessor,
    dump: &mut &mut [u8],
) -> Result<(), NetplayError> {
    if dump.len() < size {
        return Err(slot_overrun(size));
    }
    let (head, tail) = std::mem::take(dump).split_at_mut(size);
    *dump = tail;

    match address {
        Some(address) => memory.read(address, head)?,
        None => head.fill(0),
    }

    for child in children {
        let child_address = match address {
            Some(address) => child.resolve(address, memory)?,
            None => None,
        };
        save_node(child_address, child.size, &child.children, memory, dump)?;
    }
    Ok(())
}

fn load_node(
    address: Option<usize>,
    size: usize,
    children: &[PointerRegion],
    memory: &mut dyn MemoryAccessor,
    dump: &mut &[u8],
) -> Result<(), NetplayError> {
    if dump.len() < size {
        return Err(slot_overrun(size));
    }
    let current: &[u8] = *dump;
    let (head, tail) = current.split_at(size);
    *dump = tail;

    if let Some(address) = address {
        memory.write(address, head)?;
    }

    for child in children {
        let child_address = match address {
            Some(address) => child.resolve(address, &*memory)?,
            None => None,
        };
        load_node(child_address, child.size, &child.children, memory, dump)?;
    }
    Ok(())
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;

    /// Little-endian 64-bit pointers over a flat byte vector.
    struct FlatMemory(Vec<u8>);

    impl MemoryAccessor for FlatMemory {
        fn read(&self, address: usize, buf: &mut [u8]) -> Result<(), NetplayError> {
            let src = self.0.get(address..address + buf.len()).ok_or(NetplayError::MemoryAccess {
                address,
                len: buf.len(),
            })?;
            buf.copy_from_slice(src);
            Ok(())
        }

        fn write(&mut self, address: usize, bytes: &[u8]) -> Result<(), NetplayError> {
            let dst = self
                .0
                .get_mut(address..address + bytes.len())
                .ok_or(NetplayError::MemoryAccess {
                    address,
                    len: bytes.len(),
                })?;
            dst.copy_from_slice(bytes);
            Ok(())
        }

        fn read_pointer(&self, address: usize) -> Result<usize, NetplayError> {
            let mut raw = [0u8; 8];
            self.read(address, &mut raw)?;
            Ok(u64::from_le_bytes(raw) as usize)
        }
    }

    fn put_pointer(memory: &mut FlatMemory, at: usize, value: usize) {
        memory.0[at..at + 8].copy_from_slice(&(value as u64).to_le_bytes());
    }

    #[test]
    fn optimize_merges_adjacent_and_rebases_children() {
        let mut catalog = RegionCatalog::from_regions(vec![
            RegionDescriptor::new(0x40, 8).with_child(PointerRegion::new(2, 0, 4)),
            RegionDescriptor::new(0x30, 16),
            RegionDescriptor::new(0x80, 4),
        ]);
        let before = catalog.total_size();
        catalog.optimize();

        assert_eq!(catalog.total_size(), before);
        assert_eq!(catalog.regions().len(), 2);
        let first = &catalog.regions()[0];
        assert_eq!((first.address, first.size), (0x30, 24));
        assert_eq!(first.children[0].src_offset, 18);
    }

    #[test]
    fn validate_rejects_empty_and_out_of_bounds_pointers() {
        assert!(RegionCatalog::new().validate().is_err());

        let bad = RegionCatalog::from_regions(vec![
            RegionDescriptor::new(0, 8).with_child(PointerRegion::new(8, 0, 4))
        ]);
        assert!(matches!(
            bad.validate(),
            Err(NetplayError::InvalidRequest { .. })
        ));
    }

    #[test]
    fn catalog_survives_codec() {
        let catalog = RegionCatalog::from_regions(vec![RegionDescriptor::new(0x10, 4)
            .with_child(PointerRegion::new(0, 8, 12).with_child(PointerRegion::new(4, 0, 2)))]);
        let bytes = catalog.to_bytes().unwrap();
        assert_eq!(RegionCatalog::from_bytes(&bytes).unwrap(), catalog);
    }

    #[test]
    fn pointer_chase_save_and_load() {
        let mut memory = FlatMemory(vec![0; 128]);
        // Region at 0..16 holds a pointer at offset 8 to 64; the child covers 64+4..64+8.
        put_pointer(&mut memory, 8, 64);
        memory.0[68..72].copy_from_slice(&[1, 2, 3, 4]);

        let catalog = RegionCatalog::from_regions(vec![
            RegionDescriptor::new(0, 16).with_child(PointerRegion::new(8, 4, 4))
        ]);
        let mut dump = vec![0u8; catalog.total_size()];
        catalog.save_into(&memory, &mut dump).unwrap();
        assert_eq!(&dump[16..], &[1, 2, 3, 4]);

        memory.0[68..72].copy_from_slice(&[9, 9, 9, 9]);
        catalog.load_from(&mut memory, &dump).unwrap();
        assert_eq!(&memory.0[68..72], &[1, 2, 3, 4]);
    }

    #[test]
    fn null_pointer_saves_zeros_and_skips_restore() {
        let mut memory = FlatMemory(vec![0xAA; 64]);
        put_pointer(&mut memory, 0, 0);

        let catalog = RegionCatalog::from_regions(vec![
            RegionDescriptor::new(0, 8).with_child(PointerRegion::new(0, 0, 4))
        ]);
        let mut dump = vec![0xFFu8; catalog.total_size()];
        catalog.save_into(&memory, &mut dump).unwrap();
        assert_eq!(&dump[8..], &[0, 0, 0, 0]);

        catalog.load_from(&mut memory, &dump).unwrap();
        assert!(memory.0[8..].iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn wrong_slot_size_is_an_internal_error() {
        let memory = FlatMemory(vec![0; 16]);
        let catalog = RegionCatalog::from_regions(vec![RegionDescriptor::new(0, 8)]);
        let mut short = vec![0u8; 4];
        assert!(matches!(
            catalog.save_into(&memory, &mut short),
            Err(NetplayError::InternalError { .. })
        ));
    }
}
