//! Read-only structural access to HFS+ and HFSX volumes: the volume
//! header, the three B-tree files (catalog, extents overflow, attributes),
//! fork streams over fragmented files, decmpfs decompression and journal
//! inspection.
//!
//! Nothing here writes to the device. Callers share one [`hfsal::Device`]
//! per volume; every logical operation opens its own session over it and
//! releases it on return.

pub mod attributes;
pub mod btree;
pub mod catalog;
pub mod compression;
pub mod extents;
pub mod fork;
pub mod journal;
pub mod resource_fork;
pub mod unicode;
pub mod volume;

#[cfg(test)]
pub(crate) mod testutil;

pub use attributes::Attributes;
pub use catalog::Catalog;
pub use extents::{ExtentsOverflow, ForkType};
pub use fork::ForkStream;
pub use journal::Journal;
pub use volume::{CatalogNodeId, ExtentDescriptor, ForkData, VolumeHeader};

use hfsal::{Device, Error, Result};
use volume::{
    MasterDirectoryBlock, ALLOCATION_FILE_CNID, ROOT_FOLDER_CNID, SIGNATURE_HFS,
    SIGNATURE_HFSX, SIGNATURE_HFS_PLUS, VOLUME_HEADER_LEN, VOLUME_HEADER_OFFSET,
};

/// An opened volume: the parsed header plus the device it came from.
/// Immutable once opened; all tree and fork sessions borrow from it.
pub struct HfsVolume<D: Device> {
    device: D,
    header: VolumeHeader,
    /// Byte offset of the volume within the device. Nonzero when the
    /// volume sits inside a partition or a classic HFS wrapper; it absorbs
    /// the wrapper's `allocationBlockStart * physicalBlockSize` term, so
    /// allocation block 0 is always at `fs_offset`.
    fs_offset: u64,
    signature: u16,
}

impl<D: Device> HfsVolume<D> {
    pub fn open(device: D) -> Result<Self> {
        Self::open_at(device, 0)
    }

    /// Open the volume found at `offset` bytes into the device (e.g. a
    /// partition start). A classic HFS wrapper with an embedded HFS+
    /// volume is followed transparently; bare classic HFS is not handled.
    pub fn open_at(device: D, offset: u64) -> Result<Self> {
        let mut fs_offset = offset;
        let mut redirected = false;

        loop {
            let mut block = [0u8; VOLUME_HEADER_LEN];
            device.read_exact_at(fs_offset + VOLUME_HEADER_OFFSET, &mut block)?;

            match hfsal::read_u16_be(&block, 0) {
                SIGNATURE_HFS_PLUS | SIGNATURE_HFSX => {
                    let header = VolumeHeader::parse(&block)?;
                    let signature = header.signature;
                    return Ok(Self {
                        device,
                        header,
                        fs_offset,
                        signature,
                    });
                }
                SIGNATURE_HFS => {
                    let mdb = MasterDirectoryBlock::parse(&block)?;
                    if !mdb.has_embedded_volume() || redirected {
                        return Err(Error::Unsupported(
                            "classic HFS volume without an embedded HFS+ volume",
                        ));
                    }
                    log::debug!(
                        "redirecting into embedded HFS+ volume at +{} bytes",
                        mdb.embedded_volume_offset()
                    );
                    fs_offset += mdb.embedded_volume_offset();
                    redirected = true;
                }
                _ => return Err(Error::Unsupported("no HFS volume signature found")),
            }
        }
    }

    pub fn header(&self) -> &VolumeHeader {
        &self.header
    }

    pub fn fs_offset(&self) -> u64 {
        self.fs_offset
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn is_hfsx(&self) -> bool {
        self.signature == SIGNATURE_HFSX
    }

    /// A fork stream built from the inline extents alone. This is the
    /// bootstrap path for the extents overflow file's own fork, which by
    /// construction cannot have overflow records.
    pub(crate) fn bootstrap_fork_stream(&self, fork: &ForkData) -> ForkStream<'_, D> {
        ForkStream::new(
            &self.device,
            fork.inline_extents().collect(),
            fork.logical_size,
            self.header.block_size,
            self.fs_offset,
        )
    }

    /// A fork stream over the complete extent list of a fork, consulting
    /// the extents overflow tree when the inline extents fall short.
    pub fn fork_stream(
        &self,
        file_id: CatalogNodeId,
        fork: &ForkData,
        fork_type: ForkType,
    ) -> Result<ForkStream<'_, D>> {
        let extents = self.extents_overflow().all_extents(file_id, fork, fork_type)?;
        Ok(ForkStream::new(
            &self.device,
            extents,
            fork.logical_size,
            self.header.block_size,
            self.fs_offset,
        ))
    }

    pub fn catalog(&self) -> Catalog<'_, D> {
        Catalog::new(self)
    }

    pub fn extents_overflow(&self) -> ExtentsOverflow<'_, D> {
        ExtentsOverflow::new(self)
    }

    /// `None` when the volume carries no attributes file at all.
    pub fn attributes(&self) -> Option<Attributes<'_, D>> {
        if self.header.attributes_file.extents[0].block_count == 0 {
            return None;
        }
        Some(Attributes::new(self))
    }

    /// The journal's informational model, or `None` when the volume is not
    /// journaled.
    pub fn journal(&self) -> Result<Option<Journal<'_, D>>> {
        Journal::load(self)
    }

    /// Whether an allocation block is marked used in the allocation file.
    pub fn block_in_use(&self, block: u32) -> Result<bool> {
        let fork = self.header.allocation_file;
        let stream = self.fork_stream(ALLOCATION_FILE_CNID, &fork, ForkType::Data)?;

        let mut byte = [0u8];
        stream.read_exact_at(u64::from(block / 8), &mut byte)?;
        Ok(byte[0] & (1 << (7 - (block % 8))) != 0)
    }

    /// The volume name, read from the root folder's thread record.
    pub fn volume_name(&self) -> Result<Option<String>> {
        let thread = self.catalog().thread_for(ROOT_FOLDER_CNID)?;
        Ok(thread.map(|t| t.name.to_string_lossy()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ImageBuilder, TEST_BLOCK_SIZE};
    use hfsal::BasicDevice;
    use std::io::Cursor;

    fn minimal_image() -> Vec<u8> {
        let mut builder = ImageBuilder::new();
        let catalog = builder.place(&testutil::empty_tree_file(512));
        let extents = builder.place(&testutil::empty_tree_file(512));
        builder.finish(
            volume::SIGNATURE_HFS_PLUS,
            testutil::fork_data(catalog.block_count as u64 * 512, &[catalog]),
            testutil::fork_data(extents.block_count as u64 * 512, &[extents]),
            ForkData::default(),
        )
    }

    #[test]
    fn open_plain_volume() {
        let volume = testutil::volume_from(minimal_image());
        assert_eq!(volume.header().block_size, TEST_BLOCK_SIZE);
        assert!(!volume.is_hfsx());
        assert!(volume.attributes().is_none());
        assert!(volume.journal().unwrap().is_none());
    }

    #[test]
    fn open_rejects_garbage() {
        let image = vec![0u8; 4096];
        let result = HfsVolume::open(BasicDevice::new(Cursor::new(image)));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn open_follows_hfs_wrapper() {
        let inner = minimal_image();

        // Wrapper MDB: allocation blocks of 512 starting at physical block
        // 16, embedded volume at allocation block 4.
        let embed_offset = 16 * 512 + 4 * 512;
        let mut image = vec![0u8; embed_offset + inner.len()];
        let mdb = &mut image[1024..1536];
        mdb[0..2].copy_from_slice(&volume::SIGNATURE_HFS.to_be_bytes());
        mdb[20..24].copy_from_slice(&512u32.to_be_bytes()); // drAlBlkSiz
        mdb[28..30].copy_from_slice(&16u16.to_be_bytes()); // drAlBlSt
        mdb[124..126].copy_from_slice(&volume::SIGNATURE_HFS_PLUS.to_be_bytes());
        mdb[126..128].copy_from_slice(&4u16.to_be_bytes());
        mdb[128..130].copy_from_slice(&64u16.to_be_bytes());
        image[embed_offset..].copy_from_slice(&inner);

        let volume = HfsVolume::open(BasicDevice::new(Cursor::new(image))).unwrap();
        assert_eq!(volume.fs_offset(), embed_offset as u64);
        assert_eq!(volume.header().block_size, TEST_BLOCK_SIZE);
    }

    #[test]
    fn open_rejects_bare_classic_hfs() {
        let mut image = vec![0u8; 4096];
        image[1024..1026].copy_from_slice(&volume::SIGNATURE_HFS.to_be_bytes());
        let result = HfsVolume::open(BasicDevice::new(Cursor::new(image)));
        assert!(matches!(result, Err(Error::Unsupported(_))));
    }

    #[test]
    fn allocation_bitmap_lookup() {
        let mut builder = ImageBuilder::new();
        let catalog = builder.place(&testutil::empty_tree_file(512));
        let extents = builder.place(&testutil::empty_tree_file(512));
        // Bitmap: blocks 0..16 used (0xFF, 0xFF), block 17 used.
        let bitmap = builder.place(&[0xFF, 0xFF, 0b0100_0000]);
        let mut image = builder.finish(
            volume::SIGNATURE_HFS_PLUS,
            testutil::fork_data(catalog.block_count as u64 * 512, &[catalog]),
            testutil::fork_data(extents.block_count as u64 * 512, &[extents]),
            ForkData::default(),
        );

        // Patch the allocation file fork into the header by hand.
        let allocation = testutil::encode_fork_data(&testutil::fork_data(512, &[bitmap]));
        image[1024 + 112..1024 + 112 + 80].copy_from_slice(&allocation);

        let volume = testutil::volume_from(image);
        assert!(volume.block_in_use(0).unwrap());
        assert!(volume.block_in_use(15).unwrap());
        assert!(!volume.block_in_use(16).unwrap());
        assert!(volume.block_in_use(17).unwrap());
        assert!(!volume.block_in_use(18).unwrap());
    }
}
