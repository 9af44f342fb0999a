//! The catalog tree: folder/file records keyed by `(parentID, nodeName)`,
//! directory listing, path resolution with link following, and reverse
//! path reconstruction through thread records.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use hfsal::{Device, Error, Result};

use crate::btree::{self, Key, KeyedNode, NodeKind, Record, TreeSession};
use crate::extents::ForkType;
use crate::unicode::{HfsUniStr, NameOrder, KEY_COMPARE_BINARY};
use crate::volume::{CatalogNodeId, ForkData, CATALOG_FILE_CNID, ROOT_FOLDER_CNID, ROOT_PARENT_CNID};
use crate::HfsVolume;

pub const FOLDER_RECORD: u16 = 0x0001;
pub const FILE_RECORD: u16 = 0x0002;
pub const FOLDER_THREAD_RECORD: u16 = 0x0003;
pub const FILE_THREAD_RECORD: u16 = 0x0004;

/// The root-level folder holding hard link targets (`iNode<N>` files).
/// The name starts with four NUL code units so it sorts first and stays
/// out of sight.
pub const PRIVATE_METADATA_DIR: &str = "\0\0\0\0HFS+ Private Data";

const S_IFMT: u16 = 0o170000;
const S_IFLNK: u16 = 0o120000;

/// Maximum symlink target we are willing to read.
const MAX_LINK_TARGET_LEN: u64 = 4096;

#[derive(Clone, Debug)]
pub struct CatalogKey {
    pub parent_id: CatalogNodeId,
    pub name: HfsUniStr,
    order: NameOrder,
}

impl CatalogKey {
    pub fn new(parent_id: CatalogNodeId, name: HfsUniStr, order: NameOrder) -> Self {
        Self {
            parent_id,
            name,
            order,
        }
    }
}

impl Key for CatalogKey {
    type Ctx = NameOrder;

    fn parse(bytes: &[u8], order: NameOrder) -> Result<(Self, usize)> {
        if bytes.len() < 8 {
            return Err(Error::Parse("catalog key truncated"));
        }
        let key_length = hfsal::read_u16_be(bytes, 0) as usize;
        if key_length < 6 || bytes.len() < 2 + key_length {
            return Err(Error::Corrupt("catalog key length out of bounds"));
        }

        let parent_id = hfsal::read_u32_be(bytes, 2);
        let mut offset = 6;
        let name = HfsUniStr::parse(bytes, &mut offset)?;

        Ok((
            Self {
                parent_id,
                name,
                order,
            },
            2 + key_length + (key_length & 1),
        ))
    }

    fn cmp_key(&self, other: &Self) -> Ordering {
        self.parent_id
            .cmp(&other.parent_id)
            .then_with(|| self.order.compare(&self.name.units, &other.name.units))
    }
}

/// The BSD permission block carried by file and folder records.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct BsdInfo {
    pub owner_id: u32,
    pub group_id: u32,
    pub admin_flags: u8,
    pub owner_flags: u8,
    pub file_mode: u16,
    /// Union field: inode number for hard links, link count for indirect
    /// nodes, raw device for device special files.
    pub special: u32,
}

impl BsdInfo {
    fn parse(bytes: &[u8], offset: &mut usize) -> Self {
        use hfsal::parsing;
        Self {
            owner_id: parsing::read_u32_be(bytes, offset),
            group_id: parsing::read_u32_be(bytes, offset),
            admin_flags: parsing::read_u8(bytes, offset),
            owner_flags: parsing::read_u8(bytes, offset),
            file_mode: parsing::read_u16_be(bytes, offset),
            special: parsing::read_u32_be(bytes, offset),
        }
    }
}

/// The finder info fields we care about; the rest stays opaque.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct FinderFileInfo {
    pub file_type: [u8; 4],
    pub creator: [u8; 4],
    pub finder_flags: u16,
}

#[derive(Clone, Copy, Debug)]
pub struct FolderRecord {
    pub flags: u16,
    pub valence: u32,
    pub folder_id: CatalogNodeId,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: BsdInfo,
    pub text_encoding: u32,
}

impl FolderRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 88 {
            return Err(Error::Corrupt("catalog folder record truncated"));
        }
        let mut offset = 32;
        Ok(Self {
            flags: hfsal::read_u16_be(data, 2),
            valence: hfsal::read_u32_be(data, 4),
            folder_id: hfsal::read_u32_be(data, 8),
            create_date: hfsal::read_u32_be(data, 12),
            content_mod_date: hfsal::read_u32_be(data, 16),
            attribute_mod_date: hfsal::read_u32_be(data, 20),
            access_date: hfsal::read_u32_be(data, 24),
            backup_date: hfsal::read_u32_be(data, 28),
            permissions: BsdInfo::parse(data, &mut offset),
            text_encoding: hfsal::read_u32_be(data, 80),
        })
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FileRecord {
    pub flags: u16,
    pub file_id: CatalogNodeId,
    pub create_date: u32,
    pub content_mod_date: u32,
    pub attribute_mod_date: u32,
    pub access_date: u32,
    pub backup_date: u32,
    pub permissions: BsdInfo,
    pub user_info: FinderFileInfo,
    pub text_encoding: u32,
    pub data_fork: ForkData,
    pub resource_fork: ForkData,
}

impl FileRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 248 {
            return Err(Error::Corrupt("catalog file record truncated"));
        }
        let mut bsd_offset = 32;
        let mut fork_offset = 88;
        let data_fork = ForkData::parse(data, &mut fork_offset);
        let resource_fork = ForkData::parse(data, &mut fork_offset);

        let mut file_type = [0u8; 4];
        file_type.copy_from_slice(&data[48..52]);
        let mut creator = [0u8; 4];
        creator.copy_from_slice(&data[52..56]);

        Ok(Self {
            flags: hfsal::read_u16_be(data, 2),
            file_id: hfsal::read_u32_be(data, 8),
            create_date: hfsal::read_u32_be(data, 12),
            content_mod_date: hfsal::read_u32_be(data, 16),
            attribute_mod_date: hfsal::read_u32_be(data, 20),
            access_date: hfsal::read_u32_be(data, 24),
            backup_date: hfsal::read_u32_be(data, 28),
            permissions: BsdInfo::parse(data, &mut bsd_offset),
            user_info: FinderFileInfo {
                file_type,
                creator,
                finder_flags: hfsal::read_u16_be(data, 56),
            },
            text_encoding: hfsal::read_u32_be(data, 80),
            data_fork,
            resource_fork,
        })
    }

    pub fn fork(&self, fork_type: ForkType) -> &ForkData {
        match fork_type {
            ForkType::Data => &self.data_fork,
            ForkType::Resource => &self.resource_fork,
        }
    }

    pub fn is_symlink(&self) -> bool {
        self.permissions.file_mode & S_IFMT == S_IFLNK
    }

    pub fn is_hard_link(&self) -> bool {
        &self.user_info.file_type == b"hlnk" && &self.user_info.creator == b"hfs+"
    }

    pub fn hard_link_inode(&self) -> CatalogNodeId {
        self.permissions.special
    }

    /// UF_COMPRESSED: the data fork content lives in the `com.apple.decmpfs`
    /// attribute (and possibly the resource fork) instead.
    pub fn is_compressed(&self) -> bool {
        self.permissions.owner_flags & 0x20 != 0
    }
}

#[derive(Clone, Debug)]
pub struct ThreadRecord {
    pub parent_id: CatalogNodeId,
    pub name: HfsUniStr,
}

impl ThreadRecord {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 10 {
            return Err(Error::Corrupt("catalog thread record truncated"));
        }
        let parent_id = hfsal::read_u32_be(data, 4);
        let mut offset = 8;
        let name = HfsUniStr::parse(data, &mut offset)?;
        Ok(Self { parent_id, name })
    }
}

/// The tagged union stored in catalog leaf records.
#[derive(Clone, Debug)]
pub enum CatalogRecordData {
    Folder(FolderRecord),
    File(FileRecord),
    FolderThread(ThreadRecord),
    FileThread(ThreadRecord),
}

impl CatalogRecordData {
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < 2 {
            return Err(Error::Corrupt("catalog record data shorter than its type tag"));
        }
        match hfsal::read_u16_be(data, 0) {
            FOLDER_RECORD => Ok(CatalogRecordData::Folder(FolderRecord::parse(data)?)),
            FILE_RECORD => Ok(CatalogRecordData::File(FileRecord::parse(data)?)),
            FOLDER_THREAD_RECORD => {
                Ok(CatalogRecordData::FolderThread(ThreadRecord::parse(data)?))
            }
            FILE_THREAD_RECORD => Ok(CatalogRecordData::FileThread(ThreadRecord::parse(data)?)),
            _ => Err(Error::Corrupt("unknown catalog record type")),
        }
    }

    pub fn is_thread(&self) -> bool {
        matches!(
            self,
            CatalogRecordData::FolderThread(_) | CatalogRecordData::FileThread(_)
        )
    }

    pub fn as_folder(&self) -> Option<&FolderRecord> {
        match self {
            CatalogRecordData::Folder(folder) => Some(folder),
            _ => None,
        }
    }

    pub fn as_file(&self) -> Option<&FileRecord> {
        match self {
            CatalogRecordData::File(file) => Some(file),
            _ => None,
        }
    }

    /// The CNID this record describes, for file and folder records.
    pub fn cnid(&self) -> Option<CatalogNodeId> {
        match self {
            CatalogRecordData::Folder(folder) => Some(folder.folder_id),
            CatalogRecordData::File(file) => Some(file.file_id),
            _ => None,
        }
    }
}

/// One catalog leaf record: its key (location and name) plus the parsed
/// record data.
#[derive(Clone, Debug)]
pub struct CatalogLeaf {
    pub key: CatalogKey,
    pub record: CatalogRecordData,
}

impl CatalogLeaf {
    fn from_record(record: &Record<CatalogKey>) -> Result<Self> {
        Ok(Self {
            key: record.key.clone(),
            record: CatalogRecordData::parse(&record.data)?,
        })
    }

    pub fn name(&self) -> String {
        self.key.name.to_string_lossy()
    }
}

/// Catalog operations against one volume. Each call opens its own session
/// (fork stream + header state) and drops it on return.
pub struct Catalog<'v, D: Device> {
    volume: &'v HfsVolume<D>,
}

impl<'v, D: Device> Catalog<'v, D> {
    pub(crate) fn new(volume: &'v HfsVolume<D>) -> Self {
        Self { volume }
    }

    fn open_session(&self) -> Result<(TreeSession<'v, D>, NameOrder)> {
        let stream = self.volume.fork_stream(
            CATALOG_FILE_CNID,
            &self.volume.header().catalog_file,
            ForkType::Data,
        )?;
        let session = TreeSession::open(stream)?;

        // Only HFSX catalogs may opt into binary name ordering.
        let order = if self.volume.is_hfsx()
            && session.header.key_compare_type == KEY_COMPARE_BINARY
        {
            NameOrder::Binary
        } else {
            NameOrder::CaseFolding
        };
        Ok((session, order))
    }

    /// Exact lookup of `(parent_id, name)`.
    pub fn get_record(
        &self,
        parent_id: CatalogNodeId,
        name: &HfsUniStr,
    ) -> Result<Option<CatalogLeaf>> {
        let (session, order) = self.open_session()?;
        let key = CatalogKey::new(parent_id, name.clone(), order);

        match btree::find_exact(&session, order, &key)? {
            Some(record) => Ok(Some(CatalogLeaf::from_record(&record)?)),
            None => Ok(None),
        }
    }

    /// Lookup of a folder's child by name.
    pub fn get_child(&self, folder_id: CatalogNodeId, name: &str) -> Result<Option<CatalogLeaf>> {
        self.get_record(folder_id, &HfsUniStr::from(name))
    }

    /// The thread record of a CNID, mapping it back to `(parent, name)`.
    pub fn thread_for(&self, cnid: CatalogNodeId) -> Result<Option<ThreadRecord>> {
        let leaf = match self.get_record(cnid, &HfsUniStr::default())? {
            Some(leaf) => leaf,
            None => return Ok(None),
        };
        match leaf.record {
            CatalogRecordData::FolderThread(thread) | CatalogRecordData::FileThread(thread) => {
                Ok(Some(thread))
            }
            _ => Err(Error::Corrupt("record at (cnid, \"\") is not a thread record")),
        }
    }

    /// The root folder record, found through the root folder's thread.
    pub fn root_folder(&self) -> Result<Option<CatalogLeaf>> {
        let thread = match self.thread_for(ROOT_FOLDER_CNID)? {
            Some(thread) => thread,
            None => return Ok(None),
        };
        self.get_record(thread.parent_id, &thread.name)
    }

    /// All file and folder records whose parent is `folder_id`, via a
    /// targeted index descent: at each index node only the subtrees that
    /// can contain keys with this parent are visited.
    pub fn list_children(&self, folder_id: CatalogNodeId) -> Result<Vec<CatalogLeaf>> {
        let (session, order) = self.open_session()?;
        let mut children = Vec::new();
        if let Some(root) = session.root_node() {
            self.collect_children(&session, order, root, folder_id, &mut children)?;
        }
        Ok(children)
    }

    fn collect_children(
        &self,
        session: &TreeSession<'v, D>,
        order: NameOrder,
        node_number: u32,
        folder_id: CatalogNodeId,
        out: &mut Vec<CatalogLeaf>,
    ) -> Result<()> {
        let node: KeyedNode<CatalogKey> = session.read_keyed_node(node_number, order)?;

        match node.kind {
            NodeKind::Index => {
                // The largest key strictly below the folder points at the
                // subtree that may straddle the boundary; every key with
                // the folder itself as parent points at a subtree of
                // children.
                let mut largest_below: Option<&Record<CatalogKey>> = None;
                let mut matching: Vec<&Record<CatalogKey>> = Vec::new();

                for record in &node.records {
                    if record.key.parent_id < folder_id {
                        if largest_below
                            .map_or(true, |l| record.key.cmp_key(&l.key) == Ordering::Greater)
                        {
                            largest_below = Some(record);
                        }
                    } else if record.key.parent_id == folder_id {
                        matching.push(record);
                    }
                }

                let mut subtrees = Vec::with_capacity(matching.len() + 1);
                if let Some(record) = largest_below {
                    subtrees.push(record.index_pointer()?);
                }
                for record in matching {
                    subtrees.push(record.index_pointer()?);
                }

                for subtree in subtrees {
                    self.collect_children(session, order, subtree, folder_id, out)?;
                }
                Ok(())
            }
            NodeKind::Leaf => {
                for record in &node.records {
                    if record.key.parent_id != folder_id {
                        continue;
                    }
                    let leaf = CatalogLeaf::from_record(record)?;
                    // The folder's own thread record shares the parent ID;
                    // it is not a child.
                    if !leaf.record.is_thread() {
                        out.push(leaf);
                    }
                }
                Ok(())
            }
            _ => Err(Error::Corrupt("catalog descent reached a non-keyed node")),
        }
    }

    /// The folder record containing `leaf`, reconstructed through the
    /// parent's thread record. `None` for the root folder.
    pub fn parent_of(&self, leaf: &CatalogLeaf) -> Result<Option<CatalogLeaf>> {
        if leaf.key.parent_id == ROOT_PARENT_CNID {
            return Ok(None);
        }
        let thread = match self.thread_for(leaf.key.parent_id)? {
            Some(thread) => thread,
            None => return Err(Error::Corrupt("missing thread record for a parent folder")),
        };
        self.get_record(thread.parent_id, &thread.name)
    }

    /// The records from the root down to the record with this CNID, both
    /// inclusive.
    pub fn path_to(&self, cnid: CatalogNodeId) -> Result<Option<Vec<CatalogLeaf>>> {
        let thread = match self.thread_for(cnid)? {
            Some(thread) => thread,
            None => return Ok(None),
        };
        let leaf = match self.get_record(thread.parent_id, &thread.name)? {
            Some(leaf) => leaf,
            None => return Ok(None),
        };

        let mut path = vec![leaf];
        loop {
            let head = &path[0];
            match self.parent_of(head)? {
                Some(parent) => path.insert(0, parent),
                None => break,
            }
        }
        Ok(Some(path))
    }

    /// Walk `components` from the root, following symbolic and hard links
    /// on the way. Any miss, broken link or link cycle resolves to `None`.
    pub fn resolve_path(&self, components: &[&str]) -> Result<Option<CatalogLeaf>> {
        let owned: Vec<String> = components.iter().map(|c| (*c).to_string()).collect();
        let mut visited = HashSet::new();
        self.resolve_components(ROOT_FOLDER_CNID, &owned, &mut visited)
    }

    /// Convenience wrapper splitting a POSIX-style path on `/`.
    pub fn resolve_posix_path(&self, path: &str) -> Result<Option<CatalogLeaf>> {
        let components: Vec<&str> = path.split('/').filter(|c| !c.is_empty()).collect();
        self.resolve_path(&components)
    }

    fn folder_record_of(&self, folder_id: CatalogNodeId) -> Result<Option<CatalogLeaf>> {
        let thread = match self.thread_for(folder_id)? {
            Some(thread) => thread,
            None => return Ok(None),
        };
        self.get_record(thread.parent_id, &thread.name)
    }

    fn resolve_components(
        &self,
        start_folder: CatalogNodeId,
        components: &[String],
        visited: &mut HashSet<String>,
    ) -> Result<Option<CatalogLeaf>> {
        let mut current_folder = start_folder;
        let mut current: Option<CatalogLeaf> = None;

        for (i, component) in components.iter().enumerate() {
            match component.as_str() {
                "" | "." => continue,
                ".." => {
                    let thread = match self.thread_for(current_folder)? {
                        Some(thread) => thread,
                        None => return Ok(None),
                    };
                    current_folder = thread.parent_id.max(ROOT_FOLDER_CNID);
                    current = None;
                    continue;
                }
                _ => {}
            }

            let child = match self.get_child(current_folder, component)? {
                Some(child) => child,
                None => return Ok(None),
            };
            let child = match self.resolve_links(child, current_folder, visited)? {
                Some(child) => child,
                None => return Ok(None),
            };

            match &child.record {
                CatalogRecordData::Folder(folder) => current_folder = folder.folder_id,
                CatalogRecordData::File(_) if i + 1 < components.len() => {
                    // A file in the middle of the path cannot be descended
                    // into.
                    return Ok(None);
                }
                CatalogRecordData::File(_) => {}
                _ => return Ok(None),
            }
            current = Some(child);
        }

        match current {
            Some(leaf) => Ok(Some(leaf)),
            // The path named a folder only through "." / ".." / the root.
            None => self.folder_record_of(current_folder),
        }
    }

    /// Follow hard links and symlinks until a plain record is reached.
    /// Cycles are caught by remembering every link target already taken.
    fn resolve_links(
        &self,
        mut leaf: CatalogLeaf,
        containing_folder: CatalogNodeId,
        visited: &mut HashSet<String>,
    ) -> Result<Option<CatalogLeaf>> {
        loop {
            let file = match leaf.record.as_file() {
                Some(file) => *file,
                None => return Ok(Some(leaf)),
            };

            if file.is_hard_link() {
                let metadata_dir =
                    match self.get_child(ROOT_FOLDER_CNID, PRIVATE_METADATA_DIR)? {
                        Some(dir) => dir,
                        None => return Ok(None),
                    };
                let metadata_id = match leaf_folder_id(&metadata_dir) {
                    Some(id) => id,
                    None => return Ok(None),
                };

                let inode_name = format!("iNode{}", file.hard_link_inode());
                if !visited.insert(format!("{}:{}", metadata_id, inode_name)) {
                    return Ok(None);
                }
                leaf = match self.get_child(metadata_id, &inode_name)? {
                    Some(target) => target,
                    None => return Ok(None),
                };
                continue;
            }

            if file.is_symlink() {
                let target = self.read_link_target(&file)?;
                let key = if target.starts_with('/') {
                    target.clone()
                } else {
                    format!("{}:{}", containing_folder, target)
                };
                if !visited.insert(key) {
                    // Already followed this link on the current walk: a
                    // cycle, reported as absence rather than looping.
                    return Ok(None);
                }

                let components: Vec<String> =
                    target.split('/').map(|c| c.to_string()).collect();
                let start = if target.starts_with('/') {
                    ROOT_FOLDER_CNID
                } else {
                    containing_folder
                };
                return self.resolve_components(start, &components, visited);
            }

            return Ok(Some(leaf));
        }
    }

    /// The absolute POSIX path stored in a symlink's data fork.
    fn read_link_target(&self, file: &FileRecord) -> Result<String> {
        let size = file.data_fork.logical_size.min(MAX_LINK_TARGET_LEN) as usize;
        let stream = self
            .volume
            .fork_stream(file.file_id, &file.data_fork, ForkType::Data)?;
        let mut bytes = vec![0u8; size];
        stream.read_exact_at(0, &mut bytes)?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Total logical size of every file under a folder, both forks.
    /// Cooperatively cancellable: the flag is checked between child visits
    /// and a raised flag yields `None` at the next boundary.
    pub fn recursive_size(
        &self,
        folder_id: CatalogNodeId,
        cancel: &AtomicBool,
    ) -> Result<Option<u64>> {
        let mut total = 0u64;
        let mut pending = vec![folder_id];

        while let Some(folder) = pending.pop() {
            for child in self.list_children(folder)? {
                if cancel.load(AtomicOrdering::Relaxed) {
                    return Ok(None);
                }
                match &child.record {
                    CatalogRecordData::File(file) => {
                        total += file.data_fork.logical_size + file.resource_fork.logical_size;
                    }
                    CatalogRecordData::Folder(folder) => pending.push(folder.folder_id),
                    _ => {}
                }
            }
        }
        Ok(Some(total))
    }
}

fn leaf_folder_id(leaf: &CatalogLeaf) -> Option<CatalogNodeId> {
    leaf.record.as_folder().map(|folder| folder.folder_id)
}
