//! The volume header and the fork/extent descriptors embedded in it.
//! Every field of these structures is stored big-endian.

use bitflags::bitflags;
use scroll::Pread;

use hfsal::{parsing, Error, Result};

/// Byte offset of the volume header from the start of the volume.
pub const VOLUME_HEADER_OFFSET: u64 = 1024;
pub const VOLUME_HEADER_LEN: usize = 512;

/// "H+"
pub const SIGNATURE_HFS_PLUS: u16 = 0x482B;
/// "HX"
pub const SIGNATURE_HFSX: u16 = 0x4858;
/// "BD", a classic HFS Master Directory Block (possibly wrapping an
/// embedded HFS+ volume).
pub const SIGNATURE_HFS: u16 = 0x4244;

/// The sector size the volume header offsets are expressed in.
pub const PHYSICAL_BLOCK_SIZE: u32 = 512;

pub type CatalogNodeId = u32;

/// Reserved catalog node IDs.
pub const ROOT_PARENT_CNID: CatalogNodeId = 1;
pub const ROOT_FOLDER_CNID: CatalogNodeId = 2;
pub const EXTENTS_FILE_CNID: CatalogNodeId = 3;
pub const CATALOG_FILE_CNID: CatalogNodeId = 4;
pub const BAD_BLOCK_FILE_CNID: CatalogNodeId = 5;
pub const ALLOCATION_FILE_CNID: CatalogNodeId = 6;
pub const STARTUP_FILE_CNID: CatalogNodeId = 7;
pub const ATTRIBUTES_FILE_CNID: CatalogNodeId = 8;
pub const FIRST_USER_CNID: CatalogNodeId = 16;

/// A contiguous run of allocation blocks.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq, Pread)]
pub struct ExtentDescriptor {
    pub start_block: u32,
    pub block_count: u32,
}

impl ExtentDescriptor {
    pub const LEN: usize = 8;

    /// A zeroed pair terminates a partially filled inline extent array.
    pub fn is_unused(&self) -> bool {
        self.start_block == 0 && self.block_count == 0
    }
}

/// The 8 inline extent slots of a fork.
pub type ExtentRecord = [ExtentDescriptor; 8];

pub const EXTENT_RECORD_LEN: usize = 8 * ExtentDescriptor::LEN;

pub fn parse_extent_record(bytes: &[u8], offset: &mut usize) -> ExtentRecord {
    let mut record = ExtentRecord::default();
    for slot in record.iter_mut() {
        slot.start_block = parsing::read_u32_be(bytes, offset);
        slot.block_count = parsing::read_u32_be(bytes, offset);
    }
    record
}

/// Size and placement of one fork (data or resource).
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ForkData {
    pub logical_size: u64,
    pub clump_size: u32,
    pub total_blocks: u32,
    pub extents: ExtentRecord,
}

impl ForkData {
    pub const LEN: usize = 16 + EXTENT_RECORD_LEN;

    pub fn parse(bytes: &[u8], offset: &mut usize) -> Self {
        Self {
            logical_size: parsing::read_u64_be(bytes, offset),
            clump_size: parsing::read_u32_be(bytes, offset),
            total_blocks: parsing::read_u32_be(bytes, offset),
            extents: parse_extent_record(bytes, offset),
        }
    }

    /// The inline extents up to the first unused slot.
    pub fn inline_extents(&self) -> impl Iterator<Item = ExtentDescriptor> + '_ {
        self.extents
            .iter()
            .copied()
            .take_while(|extent| !extent.is_unused())
    }

    pub fn inline_block_count(&self) -> u64 {
        self.inline_extents()
            .map(|extent| u64::from(extent.block_count))
            .sum()
    }
}

bitflags! {
    pub struct VolumeAttributes: u32 {
        const HARDWARE_LOCK = 1 << 7;
        const UNMOUNTED = 1 << 8;
        const SPARED_BLOCKS = 1 << 9;
        const NO_CACHE_REQUIRED = 1 << 10;
        const BOOT_VOLUME_INCONSISTENT = 1 << 11;
        const CATALOG_NODE_IDS_REUSED = 1 << 12;
        const JOURNALED = 1 << 13;
        const SOFTWARE_LOCK = 1 << 15;
    }
}

#[derive(Clone, Copy, Debug)]
pub struct VolumeHeader {
    pub signature: u16,
    pub version: u16,
    pub attributes: u32,
    pub last_mounted_version: u32,
    pub journal_info_block: u32,

    pub create_date: u32,
    pub modify_date: u32,
    pub backup_date: u32,
    pub checked_date: u32,

    pub file_count: u32,
    pub folder_count: u32,

    pub block_size: u32,
    pub total_blocks: u32,
    pub free_blocks: u32,

    pub next_allocation: u32,
    pub rsrc_clump_size: u32,
    pub data_clump_size: u32,
    pub next_catalog_id: CatalogNodeId,

    pub write_count: u32,
    pub encodings_bitmap: u64,

    pub finder_info: [u32; 8],

    pub allocation_file: ForkData,
    pub extents_file: ForkData,
    pub catalog_file: ForkData,
    pub attributes_file: ForkData,
    pub startup_file: ForkData,
}

impl VolumeHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < VOLUME_HEADER_LEN {
            return Err(Error::Parse("volume header buffer too short"));
        }

        let mut offset = 0;
        let signature = parsing::read_u16_be(bytes, &mut offset);
        let version = parsing::read_u16_be(bytes, &mut offset);
        let attributes = parsing::read_u32_be(bytes, &mut offset);
        let last_mounted_version = parsing::read_u32_be(bytes, &mut offset);
        let journal_info_block = parsing::read_u32_be(bytes, &mut offset);

        let create_date = parsing::read_u32_be(bytes, &mut offset);
        let modify_date = parsing::read_u32_be(bytes, &mut offset);
        let backup_date = parsing::read_u32_be(bytes, &mut offset);
        let checked_date = parsing::read_u32_be(bytes, &mut offset);

        let file_count = parsing::read_u32_be(bytes, &mut offset);
        let folder_count = parsing::read_u32_be(bytes, &mut offset);

        let block_size = parsing::read_u32_be(bytes, &mut offset);
        let total_blocks = parsing::read_u32_be(bytes, &mut offset);
        let free_blocks = parsing::read_u32_be(bytes, &mut offset);

        let next_allocation = parsing::read_u32_be(bytes, &mut offset);
        let rsrc_clump_size = parsing::read_u32_be(bytes, &mut offset);
        let data_clump_size = parsing::read_u32_be(bytes, &mut offset);
        let next_catalog_id = parsing::read_u32_be(bytes, &mut offset);

        let write_count = parsing::read_u32_be(bytes, &mut offset);
        let encodings_bitmap = parsing::read_u64_be(bytes, &mut offset);

        let mut finder_info = [0u32; 8];
        for slot in finder_info.iter_mut() {
            *slot = parsing::read_u32_be(bytes, &mut offset);
        }

        let allocation_file = ForkData::parse(bytes, &mut offset);
        let extents_file = ForkData::parse(bytes, &mut offset);
        let catalog_file = ForkData::parse(bytes, &mut offset);
        let attributes_file = ForkData::parse(bytes, &mut offset);
        let startup_file = ForkData::parse(bytes, &mut offset);

        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(Error::Corrupt("allocation block size is not a power of two"));
        }

        Ok(Self {
            signature,
            version,
            attributes,
            last_mounted_version,
            journal_info_block,
            create_date,
            modify_date,
            backup_date,
            checked_date,
            file_count,
            folder_count,
            block_size,
            total_blocks,
            free_blocks,
            next_allocation,
            rsrc_clump_size,
            data_clump_size,
            next_catalog_id,
            write_count,
            encodings_bitmap,
            finder_info,
            allocation_file,
            extents_file,
            catalog_file,
            attributes_file,
            startup_file,
        })
    }

    pub fn attribute_flags(&self) -> VolumeAttributes {
        VolumeAttributes::from_bits_truncate(self.attributes)
    }

    pub fn is_journaled(&self) -> bool {
        self.attribute_flags().contains(VolumeAttributes::JOURNALED)
    }
}

/// The few Master Directory Block fields needed to find an HFS+ volume
/// embedded in a classic HFS wrapper.
#[derive(Clone, Copy, Debug)]
pub struct MasterDirectoryBlock {
    pub signature: u16,
    pub allocation_block_size: u32,
    pub allocation_block_start: u16,
    pub embed_signature: u16,
    pub embed_extent: ExtentDescriptor,
}

impl MasterDirectoryBlock {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 160 {
            return Err(Error::Parse("master directory block buffer too short"));
        }

        let embed_start = u32::from(hfsal::read_u16_be(bytes, 126));
        let embed_count = u32::from(hfsal::read_u16_be(bytes, 128));

        Ok(Self {
            signature: hfsal::read_u16_be(bytes, 0),
            allocation_block_size: hfsal::read_u32_be(bytes, 20),
            allocation_block_start: hfsal::read_u16_be(bytes, 28),
            embed_signature: hfsal::read_u16_be(bytes, 124),
            embed_extent: ExtentDescriptor {
                start_block: embed_start,
                block_count: embed_count,
            },
        })
    }

    pub fn has_embedded_volume(&self) -> bool {
        self.embed_signature == SIGNATURE_HFS_PLUS && !self.embed_extent.is_unused()
    }

    /// Byte offset of the embedded HFS+ volume from the start of the
    /// wrapper volume.
    pub fn embedded_volume_offset(&self) -> u64 {
        u64::from(self.allocation_block_start) * u64::from(PHYSICAL_BLOCK_SIZE)
            + u64::from(self.embed_extent.start_block) * u64::from(self.allocation_block_size)
    }

    pub fn embedded_volume_len(&self) -> u64 {
        u64::from(self.embed_extent.block_count) * u64::from(self.allocation_block_size)
    }
}
