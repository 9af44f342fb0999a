//! The attributes tree: named extended attributes per CNID, inline or
//! spilled into their own extent chains.

use std::cmp::Ordering;

use hfsal::{Device, Error, Result};

use crate::btree::{self, Key, KeyedNode, NodeKind, Record, TreeSession};
use crate::fork::ForkStream;
use crate::unicode::HfsUniStr;
use crate::volume::{
    parse_extent_record, CatalogNodeId, ExtentDescriptor, ExtentRecord, ForkData,
    ATTRIBUTES_FILE_CNID, EXTENT_RECORD_LEN,
};
use crate::{ForkType, HfsVolume};

pub const ATTR_INLINE_DATA: u32 = 0x10;
pub const ATTR_FORK_DATA: u32 = 0x20;
pub const ATTR_EXTENTS: u32 = 0x30;

#[derive(Clone, Debug)]
pub struct AttributeKey {
    pub file_id: CatalogNodeId,
    /// Starting allocation block for extent-continuation records; 0 for
    /// the attribute's first (defining) record.
    pub start_block: u32,
    pub name: HfsUniStr,
}

impl AttributeKey {
    pub fn new(file_id: CatalogNodeId, start_block: u32, name: HfsUniStr) -> Self {
        Self {
            file_id,
            start_block,
            name,
        }
    }
}

impl Key for AttributeKey {
    type Ctx = ();

    fn parse(bytes: &[u8], _ctx: ()) -> Result<(Self, usize)> {
        if bytes.len() < 14 {
            return Err(Error::Parse("attribute key truncated"));
        }
        let key_length = hfsal::read_u16_be(bytes, 0) as usize;
        if key_length < 12 || bytes.len() < 2 + key_length {
            return Err(Error::Corrupt("attribute key length out of bounds"));
        }

        let file_id = hfsal::read_u32_be(bytes, 4);
        let start_block = hfsal::read_u32_be(bytes, 8);
        let mut offset = 12;
        let name = HfsUniStr::parse(bytes, &mut offset)?;

        Ok((
            Self {
                file_id,
                start_block,
                name,
            },
            2 + key_length + (key_length & 1),
        ))
    }

    /// File, then name, then start block, so that the records of one
    /// attribute cluster together with the defining record first.
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.file_id
            .cmp(&other.file_id)
            .then_with(|| self.name.units.cmp(&other.name.units))
            .then(self.start_block.cmp(&other.start_block))
    }
}

/// The payload variants of an attribute leaf record.
#[derive(Clone, Debug)]
pub enum AttributeRecordData {
    /// The whole value, embedded in the record.
    Inline(Vec<u8>),
    /// The value lives in its own fork; the first 8 extents are here.
    Fork(ForkData),
    /// Continuation extents for a fork-backed value.
    Extents(ExtentRecord),
}

impl AttributeRecordData {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 8 {
            return Err(Error::Corrupt("attribute record data truncated"));
        }
        match hfsal::read_u32_be(data, 0) {
            ATTR_INLINE_DATA => {
                if data.len() < 16 {
                    return Err(Error::Corrupt("inline attribute record truncated"));
                }
                let size = hfsal::read_u32_be(data, 12) as usize;
                if data.len() < 16 + size {
                    return Err(Error::Corrupt("inline attribute data extends past record"));
                }
                Ok(AttributeRecordData::Inline(data[16..16 + size].to_vec()))
            }
            ATTR_FORK_DATA => {
                if data.len() < 8 + ForkData::LEN {
                    return Err(Error::Corrupt("fork attribute record truncated"));
                }
                let mut offset = 8;
                Ok(AttributeRecordData::Fork(ForkData::parse(data, &mut offset)))
            }
            ATTR_EXTENTS => {
                if data.len() < 8 + EXTENT_RECORD_LEN {
                    return Err(Error::Corrupt("extent attribute record truncated"));
                }
                let mut offset = 8;
                Ok(AttributeRecordData::Extents(parse_extent_record(
                    data,
                    &mut offset,
                )))
            }
            _ => Err(Error::Unsupported("unknown attribute record type")),
        }
    }
}

/// One attribute leaf: its key plus parsed payload.
#[derive(Clone, Debug)]
pub struct AttributeLeaf {
    pub key: AttributeKey,
    pub data: AttributeRecordData,
}

/// Attribute operations against one volume.
pub struct Attributes<'v, D: Device> {
    volume: &'v HfsVolume<D>,
}

impl<'v, D: Device> Attributes<'v, D> {
    pub(crate) fn new(volume: &'v HfsVolume<D>) -> Self {
        Self { volume }
    }

    fn open_session(&self) -> Result<TreeSession<'v, D>> {
        let stream = self.volume.fork_stream(
            ATTRIBUTES_FILE_CNID,
            &self.volume.header().attributes_file,
            ForkType::Data,
        )?;
        TreeSession::open(stream)
    }

    /// Every attribute record of a CNID, including extent continuations.
    pub fn list_records(&self, file_id: CatalogNodeId) -> Result<Vec<AttributeLeaf>> {
        let session = self.open_session()?;

        let search = AttributeKey::new(file_id, 0, HfsUniStr::default());
        let end = AttributeKey::new(file_id + 1, 0, HfsUniStr::default());

        let mut raw: Vec<Record<AttributeKey>> = Vec::new();
        if let Some(root) = session.root_node() {
            self.collect_records(&session, root, &search, &end, &mut raw)?;
        }

        raw.iter()
            .map(|record| {
                Ok(AttributeLeaf {
                    key: record.key.clone(),
                    data: AttributeRecordData::parse(&record.data)?,
                })
            })
            .collect()
    }

    fn collect_records(
        &self,
        session: &TreeSession<'v, D>,
        node_number: u32,
        search: &AttributeKey,
        end: &AttributeKey,
        out: &mut Vec<Record<AttributeKey>>,
    ) -> Result<()> {
        let node: KeyedNode<AttributeKey> = session.read_keyed_node(node_number, ())?;

        match node.kind {
            NodeKind::Leaf => {
                let before = out.len();
                let mut matches = Vec::new();
                let found = btree::find_le_records(&node, search, end, true, &mut matches);
                out.extend(matches.into_iter().cloned());
                if !found {
                    // The leaf contributed only the closest-predecessor
                    // convenience record; it is not ours, drop it again.
                    out.truncate(before);
                }
                Ok(())
            }
            NodeKind::Index => {
                let mut subtrees = Vec::new();
                btree::find_le_records(&node, search, end, false, &mut subtrees);
                let pointers: Vec<u32> = subtrees
                    .iter()
                    .map(|record| record.index_pointer())
                    .collect::<Result<_>>()?;
                for pointer in pointers {
                    self.collect_records(session, pointer, search, end, out)?;
                }
                Ok(())
            }
            _ => Err(Error::Corrupt("attributes descent reached a non-keyed node")),
        }
    }

    /// The attribute names of a CNID (defining records only).
    pub fn list_names(&self, file_id: CatalogNodeId) -> Result<Vec<String>> {
        Ok(self
            .list_records(file_id)?
            .into_iter()
            .filter(|leaf| leaf.key.start_block == 0)
            .map(|leaf| leaf.key.name.to_string_lossy())
            .collect())
    }

    /// The full value of one named attribute, or `None` when the CNID has
    /// no such attribute.
    pub fn read(&self, file_id: CatalogNodeId, name: &str) -> Result<Option<Vec<u8>>> {
        let name_units: Vec<u16> = name.encode_utf16().collect();
        let records: Vec<AttributeLeaf> = self
            .list_records(file_id)?
            .into_iter()
            .filter(|leaf| leaf.key.name.units == name_units)
            .collect();

        let first = match records.iter().find(|leaf| leaf.key.start_block == 0) {
            Some(first) => first,
            None => return Ok(None),
        };

        match &first.data {
            AttributeRecordData::Inline(bytes) => Ok(Some(bytes.clone())),
            AttributeRecordData::Fork(fork) => {
                let extents = self.attribute_extents(fork, &records)?;
                let stream = ForkStream::new(
                    self.volume.device(),
                    extents,
                    fork.logical_size,
                    self.volume.header().block_size,
                    self.volume.fs_offset(),
                );
                let mut value = vec![0u8; fork.logical_size as usize];
                stream.read_exact_at(0, &mut value)?;
                Ok(Some(value))
            }
            AttributeRecordData::Extents(_) => Err(Error::Corrupt(
                "attribute defining record has extent-continuation type",
            )),
        }
    }

    /// Resolve the complete extent list of a fork-backed attribute value,
    /// chaining continuation records the same way file forks chain
    /// overflow records.
    fn attribute_extents(
        &self,
        fork: &ForkData,
        records: &[AttributeLeaf],
    ) -> Result<Vec<ExtentDescriptor>> {
        let block_size = u64::from(self.volume.header().block_size);

        let mut extents: Vec<ExtentDescriptor> = fork.inline_extents().collect();
        let mut total_blocks: u64 = extents.iter().map(|e| u64::from(e.block_count)).sum();

        while total_blocks * block_size < fork.logical_size {
            let continuation = records
                .iter()
                .find(|leaf| u64::from(leaf.key.start_block) == total_blocks);

            let continuation = match continuation {
                Some(leaf) => leaf,
                None => {
                    return Err(Error::Corrupt(
                        "missing extent-continuation record for an attribute fork",
                    ))
                }
            };

            let more = match &continuation.data {
                AttributeRecordData::Extents(extent_record) => extent_record,
                _ => {
                    return Err(Error::Corrupt(
                        "attribute continuation record is not of extent type",
                    ))
                }
            };

            let before = total_blocks;
            for extent in more.iter() {
                if extent.is_unused() {
                    break;
                }
                extents.push(*extent);
                total_blocks += u64::from(extent.block_count);
            }
            if total_blocks == before {
                return Err(Error::Corrupt("empty extent-continuation attribute record"));
            }
        }

        Ok(extents)
    }
}
