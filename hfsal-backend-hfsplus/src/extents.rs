//! The extents overflow tree: additional extents for forks whose inline
//! extent slots ran out, and the resolver that produces a fork's complete
//! extent list.

use std::cmp::Ordering;

use scroll::Pread;

use hfsal::{Device, Error, Result};

use crate::btree::{self, Key, Record, TreeSession};
use crate::volume::{ExtentDescriptor, ForkData, EXTENT_RECORD_LEN};
use crate::HfsVolume;

/// Which of a file's two forks a key refers to.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ForkType {
    Data,
    Resource,
}

impl ForkType {
    pub fn to_raw(self) -> u8 {
        match self {
            ForkType::Data => 0x00,
            ForkType::Resource => 0xFF,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(ForkType::Data),
            0xFF => Some(ForkType::Resource),
            _ => None,
        }
    }
}

/// The stored key length: fork type, pad, file ID and start block. The key
/// occupies 12 bytes on disk including the length field itself.
pub const EXTENT_KEY_LENGTH: u16 = 10;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ExtentKey {
    pub fork_type: u8,
    pub file_id: u32,
    pub start_block: u32,
}

impl ExtentKey {
    pub fn new(fork_type: ForkType, file_id: u32, start_block: u32) -> Self {
        Self {
            fork_type: fork_type.to_raw(),
            file_id,
            start_block,
        }
    }
}

impl Key for ExtentKey {
    type Ctx = ();

    fn parse(bytes: &[u8], _ctx: ()) -> Result<(Self, usize)> {
        if bytes.len() < 12 {
            return Err(Error::Parse("extent key truncated"));
        }
        let key_length = hfsal::read_u16_be(bytes, 0);
        if key_length != EXTENT_KEY_LENGTH {
            return Err(Error::Corrupt("extent key with unexpected length"));
        }

        Ok((
            Self {
                fork_type: hfsal::read_u8(bytes, 2),
                file_id: hfsal::read_u32_be(bytes, 4),
                start_block: hfsal::read_u32_be(bytes, 8),
            },
            12,
        ))
    }

    fn cmp_key(&self, other: &Self) -> Ordering {
        self.file_id
            .cmp(&other.file_id)
            .then(self.fork_type.cmp(&other.fork_type))
            .then(self.start_block.cmp(&other.start_block))
    }
}

/// The payload of an extents overflow leaf record: 8 more extent slots.
pub fn parse_extent_leaf_data(data: &[u8]) -> Result<[ExtentDescriptor; 8]> {
    if data.len() < EXTENT_RECORD_LEN {
        return Err(Error::Corrupt("extent leaf record shorter than 8 descriptors"));
    }

    let mut record = <[ExtentDescriptor; 8]>::default();
    let mut offset = 0;
    for slot in record.iter_mut() {
        *slot = data
            .gread_with(&mut offset, scroll::BE)
            .map_err(|_: scroll::Error| Error::Parse("extent descriptor truncated"))?;
    }
    Ok(record)
}

/// Lookups against the extents overflow file. The overflow file's own fork
/// is read through its inline extents alone; it cannot overflow itself.
pub struct ExtentsOverflow<'v, D: Device> {
    volume: &'v HfsVolume<D>,
}

impl<'v, D: Device> ExtentsOverflow<'v, D> {
    pub(crate) fn new(volume: &'v HfsVolume<D>) -> Self {
        Self { volume }
    }

    fn open_session(&self) -> Result<TreeSession<'v, D>> {
        let stream = self
            .volume
            .bootstrap_fork_stream(&self.volume.header().extents_file);
        TreeSession::open(stream)
    }

    /// The overflow record with exactly this key, or `None`.
    pub fn overflow_extents(
        &self,
        fork_type: ForkType,
        file_id: u32,
        start_block: u32,
    ) -> Result<Option<[ExtentDescriptor; 8]>> {
        let session = self.open_session()?;
        let key = ExtentKey::new(fork_type, file_id, start_block);

        let record: Option<Record<ExtentKey>> = btree::find_exact(&session, (), &key)?;
        match record {
            Some(record) => Ok(Some(parse_extent_leaf_data(&record.data)?)),
            None => Ok(None),
        }
    }

    /// The complete, ordered extent list of a fork.
    ///
    /// If the inline extents already cover the fork's logical size they are
    /// returned as-is. Otherwise overflow records are chained, each keyed
    /// by the number of blocks accumulated so far; an expected record that
    /// is missing means the volume contradicts itself and is reported as
    /// corruption, never as a silently short list.
    pub fn all_extents(
        &self,
        file_id: u32,
        fork: &ForkData,
        fork_type: ForkType,
    ) -> Result<Vec<ExtentDescriptor>> {
        let block_size = u64::from(self.volume.header().block_size);

        let mut extents: Vec<ExtentDescriptor> = fork.inline_extents().collect();
        let mut total_blocks: u64 = extents.iter().map(|e| u64::from(e.block_count)).sum();

        if total_blocks * block_size >= fork.logical_size {
            return Ok(extents);
        }

        let session = self.open_session()?;
        while total_blocks * block_size < fork.logical_size {
            if total_blocks > u64::from(u32::max_value()) {
                return Err(Error::Corrupt("fork extent chain exceeds the block address space"));
            }
            let key = ExtentKey::new(fork_type, file_id, total_blocks as u32);

            let record: Record<ExtentKey> = match btree::find_exact(&session, (), &key)? {
                Some(record) => record,
                None => {
                    log::warn!(
                        "missing overflow extent record for file {} at block {}",
                        file_id,
                        total_blocks
                    );
                    return Err(Error::Corrupt(
                        "missing overflow extent record for an uncovered fork range",
                    ));
                }
            };

            let before = total_blocks;
            for extent in parse_extent_leaf_data(&record.data)?.iter() {
                if extent.is_unused() {
                    break;
                }
                extents.push(*extent);
                total_blocks += u64::from(extent.block_count);
            }

            if total_blocks == before {
                return Err(Error::Corrupt("empty overflow extent record in a fork chain"));
            }
        }

        Ok(extents)
    }
}
