//! Generic B-tree node decoding and search, shared by the catalog, extents
//! overflow and attributes trees.
//!
//! A node is `node_size` bytes (a power of two recorded once per tree in
//! the header record). It starts with a 14-byte descriptor and ends with a
//! backward-growing table of 16-bit record offsets; entry `i` from the end
//! is the offset of record `i`, and one extra entry past the last record
//! holds the free-space offset, which bounds the final record.

use std::cmp::Ordering;

use scroll::Pread;

use hfsal::{Device, Error, Result};

use crate::fork::ForkStream;

pub const NODE_DESCRIPTOR_LEN: usize = 14;
pub const HEADER_RECORD_LEN: usize = 42;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum NodeKind {
    Leaf,
    Index,
    Header,
    Map,
}

impl NodeKind {
    pub fn from_raw(raw: i8) -> Option<Self> {
        match raw {
            -1 => Some(NodeKind::Leaf),
            0 => Some(NodeKind::Index),
            1 => Some(NodeKind::Header),
            2 => Some(NodeKind::Map),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Pread)]
pub struct NodeDescriptor {
    pub forward_link: u32,
    pub backward_link: u32,
    pub kind_raw: i8,
    pub height: u8,
    pub num_records: u16,
    pub reserved: u16,
}

impl NodeDescriptor {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        bytes
            .pread_with(0, scroll::BE)
            .map_err(|_: scroll::Error| Error::Parse("node descriptor truncated"))
    }

    pub fn kind(&self) -> Result<NodeKind> {
        NodeKind::from_raw(self.kind_raw)
            .ok_or(Error::Corrupt("unknown b-tree node type tag"))
    }
}

/// The tree-wide header record, stored as record 0 of node 0.
#[derive(Clone, Copy, Debug, Pread)]
pub struct HeaderRecord {
    pub tree_depth: u16,
    pub root_node: u32,
    pub leaf_records: u32,
    pub first_leaf_node: u32,
    pub last_leaf_node: u32,
    pub node_size: u16,
    pub max_key_length: u16,
    pub total_nodes: u32,
    pub free_nodes: u32,
    pub reserved: u16,
    pub clump_size: u32,
    pub btree_type: u8,
    pub key_compare_type: u8,
    pub attributes: u32,
}

impl HeaderRecord {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let this: Self = bytes
            .pread_with(0, scroll::BE)
            .map_err(|_: scroll::Error| Error::Parse("b-tree header record truncated"))?;

        if this.node_size == 0 || !this.node_size.is_power_of_two() {
            return Err(Error::Corrupt("b-tree node size is not a power of two"));
        }
        Ok(this)
    }
}

/// A key with a total order, parsed from the front of a record.
pub trait Key: Clone {
    /// Per-tree parsing context (the catalog needs the volume's name
    /// ordering; the other trees need nothing).
    type Ctx: Copy;

    /// Parse the key, including its length prefix. Returns the key and the
    /// number of bytes consumed up to the start of the record data (the
    /// length field plus the key bytes, padded to a 2-byte boundary).
    fn parse(bytes: &[u8], ctx: Self::Ctx) -> Result<(Self, usize)>;

    fn cmp_key(&self, other: &Self) -> Ordering;
}

/// One keyed record: the parsed key plus its raw data bytes.
#[derive(Clone, Debug)]
pub struct Record<K> {
    pub key: K,
    pub data: Vec<u8>,
}

impl<K> Record<K> {
    /// The child node number, for records of index nodes.
    pub fn index_pointer(&self) -> Result<u32> {
        if self.data.len() < 4 {
            return Err(Error::Corrupt("index record data shorter than a node pointer"));
        }
        Ok(hfsal::read_u32_be(&self.data, 0))
    }
}

/// An index or leaf node with its records decoded.
#[derive(Clone, Debug)]
pub struct KeyedNode<K> {
    pub descriptor: NodeDescriptor,
    pub kind: NodeKind,
    pub records: Vec<Record<K>>,
}

impl<K: Key> KeyedNode<K> {
    pub fn parse(bytes: &[u8], ctx: K::Ctx) -> Result<Self> {
        let descriptor = NodeDescriptor::parse(bytes)?;
        let kind = descriptor.kind()?;
        match kind {
            NodeKind::Index | NodeKind::Leaf => {}
            _ => return Err(Error::Corrupt("expected an index or leaf node")),
        }

        let num_records = descriptor.num_records;
        let mut records = Vec::with_capacity(num_records as usize);
        for i in 0..num_records {
            let (start, end) = record_bounds(bytes, num_records, i)?;
            let record_bytes = &bytes[start..end];
            let (key, key_len) = K::parse(record_bytes, ctx)?;
            // An odd-length key at the very end of a record has no pad
            // byte to consume.
            let data_start = key_len.min(record_bytes.len());
            records.push(Record {
                key,
                data: record_bytes[data_start..].to_vec(),
            });
        }

        Ok(Self {
            descriptor,
            kind,
            records,
        })
    }
}

/// Bounds of record `index` within a raw node, taken from the trailing
/// offset table.
pub fn record_bounds(node: &[u8], num_records: u16, index: u16) -> Result<(usize, usize)> {
    debug_assert!(index < num_records);

    let node_size = node.len();
    let offset_at = |i: u16| -> Result<usize> {
        let slot = node_size
            .checked_sub(2 * (usize::from(i) + 1))
            .ok_or(Error::Corrupt("record offset table runs off the node"))?;
        Ok(usize::from(hfsal::read_u16_be(node, slot)))
    };

    let start = offset_at(index)?;
    let end = offset_at(index + 1)?;

    let table_start = node_size
        .checked_sub(2 * (usize::from(num_records) + 1))
        .ok_or(Error::Corrupt("record offset table runs off the node"))?;
    if start < NODE_DESCRIPTOR_LEN || end < start || end > table_start {
        return Err(Error::Corrupt("record offsets out of order"));
    }
    Ok((start, end))
}

/// The record with the largest key `<=` the search key, or `None` when
/// every key in the node is greater.
pub fn find_le_record<'n, K: Key>(node: &'n KeyedNode<K>, search: &K) -> Option<&'n Record<K>> {
    let mut best: Option<&Record<K>> = None;
    for record in &node.records {
        if record.key.cmp_key(search) != Ordering::Greater
            && best.map_or(true, |b| record.key.cmp_key(&b.key) == Ordering::Greater)
        {
            best = Some(record);
        }
    }
    best
}

/// Collect the records with `min_inclusive <= key < max_exclusive` into
/// `out`, in node order. Returns whether any in-range record was found.
///
/// The record with the largest key below `min_inclusive` is additionally
/// prepended: always when `strict` is false (index-node descent needs the
/// subtree just before the range), and only on a miss when `strict` is
/// true (a best-effort closest predecessor for leaf scans).
pub fn find_le_records<'n, K: Key>(
    node: &'n KeyedNode<K>,
    min_inclusive: &K,
    max_exclusive: &K,
    strict: bool,
    out: &mut Vec<&'n Record<K>>,
) -> bool {
    let mut found = false;
    let mut predecessor: Option<&Record<K>> = None;
    let insert_at = out.len();

    for record in &node.records {
        if record.key.cmp_key(min_inclusive) == Ordering::Less {
            if predecessor.map_or(true, |p| record.key.cmp_key(&p.key) == Ordering::Greater) {
                predecessor = Some(record);
            }
        } else if record.key.cmp_key(max_exclusive) == Ordering::Less {
            out.push(record);
            found = true;
        }
    }

    if let Some(predecessor) = predecessor {
        if !found || !strict {
            out.insert(insert_at, predecessor);
        }
    }

    found
}

/// One opened B-tree: the fork stream positioned over the tree file plus
/// the header state read at open time. Dropped at the end of the logical
/// operation, releasing the stream.
pub struct TreeSession<'a, D: Device> {
    stream: ForkStream<'a, D>,
    pub descriptor: NodeDescriptor,
    pub header: HeaderRecord,
}

impl<'a, D: Device> TreeSession<'a, D> {
    pub fn open(stream: ForkStream<'a, D>) -> Result<Self> {
        let mut head = [0u8; NODE_DESCRIPTOR_LEN + HEADER_RECORD_LEN];
        stream.read_exact_at(0, &mut head)?;

        let descriptor = NodeDescriptor::parse(&head)?;
        if descriptor.kind()? != NodeKind::Header {
            return Err(Error::Corrupt("node 0 of a b-tree file is not a header node"));
        }
        let header = HeaderRecord::parse(&head[NODE_DESCRIPTOR_LEN..])?;

        Ok(Self {
            stream,
            descriptor,
            header,
        })
    }

    pub fn node_size(&self) -> usize {
        usize::from(self.header.node_size)
    }

    /// The root node number, or `None` for an empty tree.
    pub fn root_node(&self) -> Option<u32> {
        match self.header.root_node {
            0 => None,
            n => Some(n),
        }
    }

    pub fn read_node(&self, node_number: u32) -> Result<Vec<u8>> {
        let node_size = self.node_size();
        let mut bytes = vec![0u8; node_size];
        self.stream
            .read_exact_at(u64::from(node_number) * node_size as u64, &mut bytes)?;
        Ok(bytes)
    }

    pub fn read_keyed_node<K: Key>(&self, node_number: u32, ctx: K::Ctx) -> Result<KeyedNode<K>> {
        KeyedNode::parse(&self.read_node(node_number)?, ctx)
    }
}

/// Exact-match descent from the root: at each index node follow the child
/// of the largest key `<=` the search key, then scan the reached leaf for
/// equality. A miss is `None`, never an error; a malformed node on the
/// descent path is.
pub fn find_exact<K: Key, D: Device>(
    session: &TreeSession<D>,
    ctx: K::Ctx,
    search: &K,
) -> Result<Option<Record<K>>> {
    let root = match session.root_node() {
        Some(root) => root,
        None => return Ok(None),
    };

    let mut node_bytes = session.read_node(root)?;
    let mut descriptor = NodeDescriptor::parse(&node_bytes)?;

    while descriptor.kind()? == NodeKind::Index {
        let node: KeyedNode<K> = KeyedNode::parse(&node_bytes, ctx)?;
        let matching = match find_le_record(&node, search) {
            Some(record) => record,
            None => return Ok(None),
        };

        node_bytes = session.read_node(matching.index_pointer()?)?;
        descriptor = NodeDescriptor::parse(&node_bytes)?;
    }

    if descriptor.kind()? != NodeKind::Leaf {
        return Err(Error::Corrupt("expected a leaf node at the bottom of the descent"));
    }

    let leaf: KeyedNode<K> = KeyedNode::parse(&node_bytes, ctx)?;
    Ok(leaf
        .records
        .iter()
        .find(|record| record.key.cmp_key(search) == Ordering::Equal)
        .cloned())
}
