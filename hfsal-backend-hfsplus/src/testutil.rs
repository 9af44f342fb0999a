//! Builders for synthetic nodes, trees and whole volume images, shared by
//! the unit tests of several modules. Everything here writes structures
//! that the crate itself only ever reads.

use std::cmp::Ordering;
use std::io::Cursor;

use hfsal::{BasicDevice, Device};

use crate::btree::{Key, NODE_DESCRIPTOR_LEN};
use crate::fork::ForkStream;
use crate::volume::{
    ExtentDescriptor, ForkData, EXTENT_RECORD_LEN, PHYSICAL_BLOCK_SIZE, VOLUME_HEADER_OFFSET,
};

pub(crate) const NODE_SIZE: usize = 512;
pub(crate) const TEST_BLOCK_SIZE: u32 = 512;

pub(crate) fn put_u16(buf: &mut Vec<u8>, value: u16) {
    buf.extend_from_slice(&value.to_be_bytes());
}
pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) {
    buf.extend_from_slice(&value.to_be_bytes());
}
pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_be_bytes());
}

/// A minimal keyed-record type for engine-level tests: a u32 key with the
/// standard 16-bit length prefix.
#[derive(Clone, Debug)]
pub(crate) struct TestKey(pub u32);

impl Key for TestKey {
    type Ctx = ();

    fn parse(bytes: &[u8], _ctx: ()) -> hfsal::Result<(Self, usize)> {
        let key_length = hfsal::read_u16_be(bytes, 0) as usize;
        let value = hfsal::read_u32_be(bytes, 2);
        Ok((TestKey(value), 2 + key_length + (key_length & 1)))
    }

    fn cmp_key(&self, other: &Self) -> Ordering {
        self.0.cmp(&other.0)
    }
}

impl TestKey {
    pub fn record(key: u32, data: &[u8]) -> Vec<u8> {
        let mut bytes = Vec::new();
        put_u16(&mut bytes, 4);
        put_u32(&mut bytes, key);
        bytes.extend_from_slice(data);
        if bytes.len() % 2 != 0 {
            bytes.push(0);
        }
        bytes
    }

    pub fn index_record(key: u32, child: u32) -> Vec<u8> {
        Self::record(key, &child.to_be_bytes())
    }
}

/// Assemble one raw node: descriptor, record data, trailing offset table.
pub(crate) fn build_node(kind: i8, height: u8, records: &[Vec<u8>], node_size: usize) -> Vec<u8> {
    let mut node = vec![0u8; node_size];
    node[0..4].copy_from_slice(&0u32.to_be_bytes()); // fwd link
    node[4..8].copy_from_slice(&0u32.to_be_bytes()); // bwd link
    node[8] = kind as u8;
    node[9] = height;
    node[10..12].copy_from_slice(&(records.len() as u16).to_be_bytes());

    let mut offset = NODE_DESCRIPTOR_LEN;
    for (i, record) in records.iter().enumerate() {
        let slot = node_size - 2 * (i + 1);
        node[slot..slot + 2].copy_from_slice(&(offset as u16).to_be_bytes());
        node[offset..offset + record.len()].copy_from_slice(record);
        offset += record.len();
    }
    // Free-space offset, bounding the last record.
    let slot = node_size - 2 * (records.len() + 1);
    node[slot..slot + 2].copy_from_slice(&(offset as u16).to_be_bytes());

    node
}

/// The header node (node 0) of a tree file.
pub(crate) fn build_header_node(
    root: u32,
    node_size: usize,
    key_compare_type: u8,
    tree_depth: u16,
) -> Vec<u8> {
    let mut header_record = Vec::new();
    put_u16(&mut header_record, tree_depth);
    put_u32(&mut header_record, root);
    put_u32(&mut header_record, 0); // leafRecords
    put_u32(&mut header_record, 0); // firstLeafNode
    put_u32(&mut header_record, 0); // lastLeafNode
    put_u16(&mut header_record, node_size as u16);
    put_u16(&mut header_record, 520); // maxKeyLength
    put_u32(&mut header_record, 16); // totalNodes
    put_u32(&mut header_record, 8); // freeNodes
    put_u16(&mut header_record, 0);
    put_u32(&mut header_record, 0); // clumpSize
    header_record.push(0); // btreeType
    header_record.push(key_compare_type);
    put_u32(&mut header_record, 0); // attributes
    header_record.extend_from_slice(&[0u8; 64]); // reserved

    let user_data = vec![0u8; 128];
    let map_record = vec![0u8; 64];
    build_node(1, 0, &[header_record, user_data, map_record], node_size)
}

/// A complete tree file with the header node at node 0 and the given nodes
/// at their node numbers.
pub(crate) fn tree_file_with(
    node_size: usize,
    root: u32,
    key_compare_type: u8,
    nodes: &[(u32, Vec<u8>)],
) -> Vec<u8> {
    let max_node = nodes.iter().map(|(n, _)| *n).max().unwrap_or(0);
    let mut file = vec![0u8; (max_node as usize + 1) * node_size];

    let depth = nodes.len().min(u16::max_value() as usize) as u16;
    let header = build_header_node(root, node_size, key_compare_type, depth);
    file[..node_size].copy_from_slice(&header);

    for (number, node) in nodes {
        assert_eq!(node.len(), node_size);
        let at = *number as usize * node_size;
        file[at..at + node_size].copy_from_slice(node);
    }
    file
}

pub(crate) fn tree_file(root: u32, nodes: &[(u32, Vec<u8>)]) -> Vec<u8> {
    tree_file_with(NODE_SIZE, root, crate::unicode::KEY_COMPARE_CASE_FOLDING, nodes)
}

/// A fork stream spanning an entire device with a single extent.
pub(crate) fn whole_device_fork<D: Device>(device: &D) -> ForkStream<'_, D> {
    let len = device.len().unwrap();
    let blocks = hfsal::div_round_up(len, u64::from(TEST_BLOCK_SIZE)) as u32;
    ForkStream::new(
        device,
        vec![ExtentDescriptor {
            start_block: 0,
            block_count: blocks,
        }],
        len,
        TEST_BLOCK_SIZE,
        0,
    )
}

pub(crate) fn fork_data(logical_size: u64, extents: &[ExtentDescriptor]) -> ForkData {
    assert!(extents.len() <= 8);
    let mut fork = ForkData::default();
    fork.logical_size = logical_size;
    fork.total_blocks = extents.iter().map(|e| e.block_count).sum();
    fork.extents[..extents.len()].copy_from_slice(extents);
    fork
}

pub(crate) fn encode_fork_data(fork: &ForkData) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(ForkData::LEN);
    put_u64(&mut bytes, fork.logical_size);
    put_u32(&mut bytes, fork.clump_size);
    put_u32(&mut bytes, fork.total_blocks);
    for extent in &fork.extents {
        put_u32(&mut bytes, extent.start_block);
        put_u32(&mut bytes, extent.block_count);
    }
    bytes
}

/// Grows a volume image block by block. Blocks 0 and 1 are the reserved
/// boot area; the volume header goes into block 2 on `finish`.
pub(crate) struct ImageBuilder {
    image: Vec<u8>,
}

impl ImageBuilder {
    pub fn new() -> Self {
        Self {
            image: vec![0u8; 3 * TEST_BLOCK_SIZE as usize],
        }
    }

    pub fn next_block(&self) -> u32 {
        (self.image.len() / TEST_BLOCK_SIZE as usize) as u32
    }

    /// Leave a hole, to force fragmentation.
    pub fn skip_blocks(&mut self, count: u32) {
        self.image
            .resize(self.image.len() + (count * TEST_BLOCK_SIZE) as usize, 0);
    }

    /// Append `data` at the next block boundary, returning the extent that
    /// covers it.
    pub fn place(&mut self, data: &[u8]) -> ExtentDescriptor {
        let start_block = self.next_block();
        let blocks = hfsal::div_round_up(data.len() as u64, u64::from(TEST_BLOCK_SIZE)) as u32;
        self.image.extend_from_slice(data);
        self.image
            .resize((start_block + blocks) as usize * TEST_BLOCK_SIZE as usize, 0);
        ExtentDescriptor {
            start_block,
            block_count: blocks,
        }
    }

    pub fn finish(
        mut self,
        signature: u16,
        catalog: ForkData,
        extents: ForkData,
        attributes: ForkData,
    ) -> Vec<u8> {
        let total_blocks = self.next_block();
        let mut header = Vec::with_capacity(512);
        put_u16(&mut header, signature);
        put_u16(&mut header, 4); // version
        put_u32(&mut header, 0); // attributes
        put_u32(&mut header, 0); // lastMountedVersion
        put_u32(&mut header, 0); // journalInfoBlock
        for _ in 0..4 {
            put_u32(&mut header, 0); // dates
        }
        put_u32(&mut header, 0); // fileCount
        put_u32(&mut header, 0); // folderCount
        put_u32(&mut header, TEST_BLOCK_SIZE); // blockSize
        put_u32(&mut header, total_blocks);
        put_u32(&mut header, 0); // freeBlocks
        put_u32(&mut header, total_blocks); // nextAllocation
        put_u32(&mut header, 0); // rsrcClumpSize
        put_u32(&mut header, 0); // dataClumpSize
        put_u32(&mut header, 128); // nextCatalogID
        put_u32(&mut header, 1); // writeCount
        put_u64(&mut header, 0); // encodingsBitmap
        header.extend_from_slice(&[0u8; 32]); // finderInfo

        header.extend_from_slice(&encode_fork_data(&ForkData::default())); // allocation
        header.extend_from_slice(&encode_fork_data(&extents));
        header.extend_from_slice(&encode_fork_data(&catalog));
        header.extend_from_slice(&encode_fork_data(&attributes));
        header.extend_from_slice(&encode_fork_data(&ForkData::default())); // startup
        header.resize(512, 0);

        let at = VOLUME_HEADER_OFFSET as usize;
        self.image[at..at + 512].copy_from_slice(&header);
        debug_assert_eq!(u64::from(PHYSICAL_BLOCK_SIZE), 512);
        self.image
    }
}

/// An empty tree: just a header node with no root.
pub(crate) fn empty_tree_file(node_size: usize) -> Vec<u8> {
    tree_file_with(node_size, 0, crate::unicode::KEY_COMPARE_CASE_FOLDING, &[])
}

// --- catalog record encoders ---

pub(crate) fn name_units(name: &str) -> Vec<u16> {
    name.encode_utf16().collect()
}

pub(crate) fn catalog_key_bytes(parent: u32, name: &str) -> Vec<u8> {
    let units = name_units(name);
    let key_length = 4 + 2 + 2 * units.len();
    let mut bytes = Vec::new();
    put_u16(&mut bytes, key_length as u16);
    put_u32(&mut bytes, parent);
    put_u16(&mut bytes, units.len() as u16);
    for unit in units {
        put_u16(&mut bytes, unit);
    }
    bytes
}

fn bsd_info(file_mode: u16, special: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    put_u32(&mut bytes, 501); // ownerID
    put_u32(&mut bytes, 20); // groupID
    bytes.push(0); // adminFlags
    bytes.push(0); // ownerFlags
    put_u16(&mut bytes, file_mode);
    put_u32(&mut bytes, special);
    bytes
}

pub(crate) fn folder_record(folder_id: u32, valence: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    put_u16(&mut bytes, 1); // kHFSPlusFolderRecord
    put_u16(&mut bytes, 0); // flags
    put_u32(&mut bytes, valence);
    put_u32(&mut bytes, folder_id);
    for _ in 0..5 {
        put_u32(&mut bytes, 0); // dates
    }
    bytes.extend_from_slice(&bsd_info(0o040755, 0));
    bytes.extend_from_slice(&[0u8; 32]); // userInfo + finderInfo
    put_u32(&mut bytes, 0); // textEncoding
    put_u32(&mut bytes, 0); // reserved
    assert_eq!(bytes.len(), 88);
    bytes
}

pub(crate) struct FileSpec {
    pub file_id: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
    pub file_mode: u16,
    pub special: u32,
    pub finder_type: [u8; 4],
    pub finder_creator: [u8; 4],
    pub flags: u16,
}

impl FileSpec {
    pub fn plain(file_id: u32, data_fork: ForkData) -> Self {
        Self {
            file_id,
            data_fork,
            resource_fork: ForkData::default(),
            file_mode: 0o100644,
            special: 0,
            finder_type: [0; 4],
            finder_creator: [0; 4],
            flags: 0,
        }
    }

    pub fn symlink(file_id: u32, data_fork: ForkData) -> Self {
        Self {
            file_mode: 0o120755,
            ..Self::plain(file_id, data_fork)
        }
    }

    pub fn hard_link(file_id: u32, inode_num: u32) -> Self {
        Self {
            special: inode_num,
            finder_type: *b"hlnk",
            finder_creator: *b"hfs+",
            ..Self::plain(file_id, ForkData::default())
        }
    }
}

pub(crate) fn file_record(spec: &FileSpec) -> Vec<u8> {
    let mut bytes = Vec::new();
    put_u16(&mut bytes, 2); // kHFSPlusFileRecord
    put_u16(&mut bytes, spec.flags);
    put_u32(&mut bytes, 0); // reserved1
    put_u32(&mut bytes, spec.file_id);
    for _ in 0..5 {
        put_u32(&mut bytes, 0); // dates
    }
    bytes.extend_from_slice(&bsd_info(spec.file_mode, spec.special));
    bytes.extend_from_slice(&spec.finder_type);
    bytes.extend_from_slice(&spec.finder_creator);
    put_u16(&mut bytes, 0); // finderFlags
    bytes.extend_from_slice(&[0u8; 6]); // location + reserved
    bytes.extend_from_slice(&[0u8; 16]); // extended finder info
    put_u32(&mut bytes, 0); // textEncoding
    put_u32(&mut bytes, 0); // reserved2
    bytes.extend_from_slice(&encode_fork_data(&spec.data_fork));
    bytes.extend_from_slice(&encode_fork_data(&spec.resource_fork));
    assert_eq!(bytes.len(), 248);
    bytes
}

pub(crate) fn thread_record(record_type: u16, parent: u32, name: &str) -> Vec<u8> {
    let units = name_units(name);
    let mut bytes = Vec::new();
    put_u16(&mut bytes, record_type); // 3 = folder thread, 4 = file thread
    put_u16(&mut bytes, 0); // reserved
    put_u32(&mut bytes, parent);
    put_u16(&mut bytes, units.len() as u16);
    for unit in units {
        put_u16(&mut bytes, unit);
    }
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }
    bytes
}

pub(crate) fn rec(key: Vec<u8>, data: Vec<u8>) -> Vec<u8> {
    let mut bytes = key;
    bytes.extend_from_slice(&data);
    if bytes.len() % 2 != 0 {
        bytes.push(0);
    }
    bytes
}

// --- extents overflow encoders ---

pub(crate) fn extent_key_bytes(fork_type: u8, file_id: u32, start_block: u32) -> Vec<u8> {
    let mut bytes = Vec::new();
    put_u16(&mut bytes, 10);
    bytes.push(fork_type);
    bytes.push(0); // pad
    put_u32(&mut bytes, file_id);
    put_u32(&mut bytes, start_block);
    bytes
}

pub(crate) fn extent_data_bytes(extents: &[ExtentDescriptor]) -> Vec<u8> {
    assert!(extents.len() <= 8);
    let mut bytes = Vec::with_capacity(EXTENT_RECORD_LEN);
    for i in 0..8 {
        let extent = extents.get(i).copied().unwrap_or_default();
        put_u32(&mut bytes, extent.start_block);
        put_u32(&mut bytes, extent.block_count);
    }
    bytes
}

// --- attribute encoders ---

pub(crate) fn attr_key_bytes(file_id: u32, start_block: u32, name: &str) -> Vec<u8> {
    let units = name_units(name);
    let key_length = 12 + 2 * units.len();
    let mut bytes = Vec::new();
    put_u16(&mut bytes, key_length as u16);
    put_u16(&mut bytes, 0); // pad
    put_u32(&mut bytes, file_id);
    put_u32(&mut bytes, start_block);
    put_u16(&mut bytes, units.len() as u16);
    for unit in units {
        put_u16(&mut bytes, unit);
    }
    bytes
}

pub(crate) fn attr_inline_bytes(data: &[u8]) -> Vec<u8> {
    let mut bytes = Vec::new();
    put_u32(&mut bytes, 0x10); // kHFSPlusAttrInlineData
    put_u64(&mut bytes, 0); // reserved
    put_u32(&mut bytes, data.len() as u32);
    bytes.extend_from_slice(data);
    bytes
}

pub(crate) fn attr_fork_bytes(fork: &ForkData) -> Vec<u8> {
    let mut bytes = Vec::new();
    put_u32(&mut bytes, 0x20); // kHFSPlusAttrForkData
    put_u32(&mut bytes, 0); // reserved
    bytes.extend_from_slice(&encode_fork_data(fork));
    bytes
}

pub(crate) fn attr_extents_bytes(extents: &[ExtentDescriptor]) -> Vec<u8> {
    let mut bytes = Vec::new();
    put_u32(&mut bytes, 0x30); // kHFSPlusAttrExtents
    put_u32(&mut bytes, 0); // reserved
    bytes.extend_from_slice(&extent_data_bytes(extents));
    bytes
}

pub(crate) fn volume_from(
    image: Vec<u8>,
) -> crate::HfsVolume<BasicDevice<Cursor<Vec<u8>>>> {
    crate::HfsVolume::open(BasicDevice::new(Cursor::new(image))).unwrap()
}
