//! Read-only inspection of the HFS+ journal: the info block, the journal
//! header and the pending transactions' block lists. No replay is ever
//! attempted; this is a structural model of what sits in the ring buffer.
//!
//! The info block is big-endian like the rest of the volume, but the
//! journal header and block lists are written in the byte order of the
//! machine that created them, flagged by the header's endian marker.

use bitflags::bitflags;
use scroll::Pread;

use hfsal::{Device, Error, Result};

use crate::HfsVolume;

pub const JOURNAL_HEADER_MAGIC: u32 = 0x4A4E_4C78; // "JNLx"
pub const ENDIAN_MAGIC: u32 = 0x1234_5678;

pub const JOURNAL_HEADER_LEN: usize = 44;
pub const JOURNAL_INFO_BLOCK_LEN: usize = 52;
pub const BLOCK_LIST_HEADER_LEN: usize = 16;
pub const BLOCK_INFO_LEN: usize = 16;

bitflags! {
    pub struct JournalInfoFlags: u32 {
        /// The journal data lives inside this volume, at `offset`.
        const IN_FS = 0x0000_0001;
        /// The journal data lives on another device.
        const ON_OTHER_DEVICE = 0x0000_0002;
        /// The journal has never been initialized; its contents are noise.
        const NEEDS_INIT = 0x0000_0004;
    }
}

/// The journal info block pointed at by the volume header.
#[derive(Clone, Copy, Debug)]
pub struct JournalInfoBlock {
    pub flags: u32,
    pub device_signature: [u32; 8],
    /// Byte offset of the journal from the start of the volume (or of the
    /// other device when `ON_OTHER_DEVICE` is set).
    pub offset: u64,
    pub size: u64,
}

impl JournalInfoBlock {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < JOURNAL_INFO_BLOCK_LEN {
            return Err(Error::Parse("journal info block truncated"));
        }
        let mut device_signature = [0u32; 8];
        for (i, slot) in device_signature.iter_mut().enumerate() {
            *slot = hfsal::read_u32_be(bytes, 4 + 4 * i);
        }
        Ok(Self {
            flags: hfsal::read_u32_be(bytes, 0),
            device_signature,
            offset: hfsal::read_u64_be(bytes, 36),
            size: hfsal::read_u64_be(bytes, 44),
        })
    }

    pub fn flag_bits(&self) -> JournalInfoFlags {
        JournalInfoFlags::from_bits_truncate(self.flags)
    }

    pub fn needs_init(&self) -> bool {
        self.flag_bits().contains(JournalInfoFlags::NEEDS_INIT)
    }

    pub fn in_fs(&self) -> bool {
        self.flag_bits().contains(JournalInfoFlags::IN_FS)
    }
}

#[derive(Clone, Copy, Debug, Pread)]
pub struct JournalHeader {
    pub magic: u32,
    pub endian: u32,
    /// Ring-buffer bounds of pending transaction data, as byte offsets
    /// from the start of the journal.
    pub start: u64,
    pub end: u64,
    pub size: u64,
    pub blhdr_size: u32,
    pub checksum: u32,
    pub jhdr_size: u32,
}

impl JournalHeader {
    /// Parse the header, detecting its byte order from the magic.
    pub fn parse(bytes: &[u8]) -> Result<(Self, scroll::Endian)> {
        if bytes.len() < JOURNAL_HEADER_LEN {
            return Err(Error::Parse("journal header truncated"));
        }

        let endian = if hfsal::read_u32_be(bytes, 0) == JOURNAL_HEADER_MAGIC {
            scroll::BE
        } else if hfsal::read_u32_le(bytes, 0) == JOURNAL_HEADER_MAGIC {
            scroll::LE
        } else {
            return Err(Error::Corrupt("bad journal header magic"));
        };

        let header: JournalHeader = bytes
            .pread_with(0, endian)
            .map_err(|_: scroll::Error| Error::Parse("journal header truncated"))?;

        if header.endian != ENDIAN_MAGIC {
            return Err(Error::Corrupt("journal endian marker does not match its magic"));
        }
        if header.checksum != Self::calculate_checksum(bytes) {
            return Err(Error::Corrupt("journal header checksum mismatch"));
        }
        Ok((header, endian))
    }

    /// Apple's additive journal checksum over the header with the checksum
    /// field zeroed.
    pub fn calculate_checksum(bytes: &[u8]) -> u32 {
        let mut cksum: u32 = 0;
        for (i, &byte) in bytes[..JOURNAL_HEADER_LEN].iter().enumerate() {
            let byte = if (36..40).contains(&i) { 0 } else { byte };
            cksum = (cksum << 8) ^ cksum.wrapping_add(u32::from(byte));
        }
        !cksum
    }

    /// A clean journal has no pending transaction data.
    pub fn is_clean(&self) -> bool {
        self.start == self.end
    }
}

/// One run of contiguous blocks recorded in a block list.
#[derive(Clone, Copy, Debug, Pread)]
pub struct BlockInfo {
    pub bnum: u64,
    pub bsize: u32,
    pub next: u32,
}

/// One block list: its header fields plus the per-block runs.
#[derive(Clone, Debug)]
pub struct BlockList {
    pub max_blocks: u16,
    pub num_blocks: u16,
    pub bytes_used: u32,
    pub checksum: u32,
    pub blocks: Vec<BlockInfo>,
}

impl BlockList {
    pub fn parse(bytes: &[u8], endian: scroll::Endian) -> Result<Self> {
        let max_blocks: u16 = bytes
            .pread_with(0, endian)
            .map_err(|_: scroll::Error| Error::Parse("block list header truncated"))?;
        let num_blocks: u16 = bytes
            .pread_with(2, endian)
            .map_err(|_: scroll::Error| Error::Parse("block list header truncated"))?;
        let bytes_used: u32 = bytes
            .pread_with(4, endian)
            .map_err(|_: scroll::Error| Error::Parse("block list header truncated"))?;
        let checksum: u32 = bytes
            .pread_with(8, endian)
            .map_err(|_: scroll::Error| Error::Parse("block list header truncated"))?;

        if usize::from(num_blocks) * BLOCK_INFO_LEN + BLOCK_LIST_HEADER_LEN > bytes.len() {
            return Err(Error::Corrupt("block list claims more entries than fit its header"));
        }

        let mut blocks = Vec::with_capacity(num_blocks.into());
        let mut offset = BLOCK_LIST_HEADER_LEN;
        for _ in 0..num_blocks {
            let info: BlockInfo = bytes
                .gread_with(&mut offset, endian)
                .map_err(|_: scroll::Error| Error::Parse("block info truncated"))?;
            blocks.push(info);
        }

        Ok(Self {
            max_blocks,
            num_blocks,
            bytes_used,
            checksum,
            blocks,
        })
    }

    /// The first entry is bookkeeping, not a data run; its `next` field
    /// chains block lists of one transaction.
    pub fn continues_transaction(&self) -> bool {
        self.blocks.first().map_or(false, |info| info.next != 0)
    }
}

/// An ordered group of block lists committed together.
#[derive(Clone, Debug)]
pub struct Transaction {
    pub block_lists: Vec<BlockList>,
}

/// The journal of one volume: info block always, header and transactions
/// when the journal data is present and initialized.
pub struct Journal<'v, D: Device> {
    volume: &'v HfsVolume<D>,
    pub info: JournalInfoBlock,
    header: Option<(JournalHeader, scroll::Endian)>,
}

impl<'v, D: Device> Journal<'v, D> {
    /// `None` when the volume is not journaled at all.
    pub(crate) fn load(volume: &'v HfsVolume<D>) -> Result<Option<Self>> {
        if !volume.header().is_journaled() {
            return Ok(None);
        }

        let block_size = u64::from(volume.header().block_size);
        let info_offset =
            volume.fs_offset() + u64::from(volume.header().journal_info_block) * block_size;

        let mut info_bytes = [0u8; JOURNAL_INFO_BLOCK_LEN];
        volume.device().read_exact_at(info_offset, &mut info_bytes)?;
        let info = JournalInfoBlock::parse(&info_bytes)?;

        // An uninitialized journal, or one on a device we cannot see, is
        // reported through the info block alone.
        let header = if info.needs_init() || !info.in_fs() {
            None
        } else {
            let mut header_bytes = [0u8; JOURNAL_HEADER_LEN];
            volume
                .device()
                .read_exact_at(volume.fs_offset() + info.offset, &mut header_bytes)?;
            Some(JournalHeader::parse(&header_bytes)?)
        };

        Ok(Some(Self {
            volume,
            info,
            header,
        }))
    }

    pub fn header(&self) -> Option<&JournalHeader> {
        self.header.as_ref().map(|(header, _)| header)
    }

    /// Whether the journal has no pending transactions. An uninitialized
    /// journal is trivially clean.
    pub fn is_clean(&self) -> bool {
        match &self.header {
            Some((header, _)) => header.is_clean(),
            None => true,
        }
    }

    /// Read from the journal's ring buffer, wrapping within the data area
    /// `[jhdr_size, size)`.
    fn read_ring(&self, header: &JournalHeader, mut pos: u64, buf: &mut [u8]) -> Result<u64> {
        let journal_base = self.volume.fs_offset() + self.info.offset;
        let mut done = 0usize;

        while done < buf.len() {
            if pos >= header.size {
                pos = u64::from(header.jhdr_size);
            }
            let until_wrap = (header.size - pos) as usize;
            let n = until_wrap.min(buf.len() - done);
            self.volume
                .device()
                .read_exact_at(journal_base + pos, &mut buf[done..done + n])?;
            done += n;
            pos += n as u64;
        }
        Ok(pos)
    }

    /// The pending transactions, each an ordered list of block lists. No
    /// data is replayed or even read; only the block lists themselves are
    /// decoded.
    pub fn pending_transactions(&self) -> Result<Vec<Transaction>> {
        let (header, endian) = match &self.header {
            Some((header, endian)) => (*header, *endian),
            None => return Ok(Vec::new()),
        };
        if header.is_clean() {
            return Ok(Vec::new());
        }

        let mut transactions = Vec::new();
        let mut current = Vec::new();
        let mut pos = header.start;
        let mut list_bytes = vec![0u8; header.blhdr_size as usize];

        while pos != header.end {
            let after = self.read_ring(&header, pos, &mut list_bytes)?;
            let list = BlockList::parse(&list_bytes, endian)?;

            if list.bytes_used < header.blhdr_size {
                return Err(Error::Corrupt("block list shorter than its own header"));
            }

            let continues = list.continues_transaction();
            // Skip over the header and the data blocks it covers.
            let advance = u64::from(list.bytes_used) - u64::from(header.blhdr_size);
            current.push(list);
            if !continues {
                transactions.push(Transaction {
                    block_lists: std::mem::replace(&mut current, Vec::new()),
                });
            }

            pos = after;
            let mut remaining = advance;
            while remaining > 0 {
                if pos >= header.size {
                    pos = u64::from(header.jhdr_size);
                }
                let step = remaining.min(header.size - pos);
                pos += step;
                remaining -= step;
            }
            if pos >= header.size {
                pos = u64::from(header.jhdr_size);
            }
        }

        if !current.is_empty() {
            log::warn!("journal ended mid-transaction; reporting the partial tail");
            transactions.push(Transaction {
                block_lists: current,
            });
        }
        Ok(transactions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, ImageBuilder};
    use crate::volume::{ForkData, SIGNATURE_HFS_PLUS};

    const BLHDR_SIZE: u32 = 128;
    const JHDR_SIZE: u32 = 512;
    const JOURNAL_SIZE: u64 = 8192;

    fn le_header(start: u64, end: u64) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&JOURNAL_HEADER_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&ENDIAN_MAGIC.to_le_bytes());
        bytes.extend_from_slice(&start.to_le_bytes());
        bytes.extend_from_slice(&end.to_le_bytes());
        bytes.extend_from_slice(&JOURNAL_SIZE.to_le_bytes());
        bytes.extend_from_slice(&BLHDR_SIZE.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes()); // checksum slot
        bytes.extend_from_slice(&JHDR_SIZE.to_le_bytes());

        let checksum = JournalHeader::calculate_checksum(&bytes);
        bytes[36..40].copy_from_slice(&checksum.to_le_bytes());
        bytes
    }

    /// A block list with one data run of `data_len` bytes following it.
    fn le_block_list(data_len: u32, next: u32) -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&4u16.to_le_bytes()); // max_blocks
        bytes.extend_from_slice(&2u16.to_le_bytes()); // num_blocks
        bytes.extend_from_slice(&(BLHDR_SIZE + data_len).to_le_bytes()); // bytes_used
        bytes.extend_from_slice(&0u32.to_le_bytes()); // checksum
        // binfo[0]: bookkeeping entry carrying the continuation marker.
        bytes.extend_from_slice(&0u64.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.extend_from_slice(&next.to_le_bytes());
        // binfo[1]: one run of data blocks.
        bytes.extend_from_slice(&1000u64.to_le_bytes());
        bytes.extend_from_slice(&data_len.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        bytes.resize(BLHDR_SIZE as usize, 0);
        bytes
    }

    /// A journaled volume whose journal region is `journal` at byte
    /// offset `offset` within the volume.
    fn journaled_volume(journal: &[u8], journal_offset: u64) -> Vec<u8> {
        let mut builder = ImageBuilder::new();
        let catalog_tree = testutil::empty_tree_file(512);
        let catalog = builder.place(&catalog_tree);
        let extents_tree = testutil::empty_tree_file(512);
        let extents = builder.place(&extents_tree);

        let mut info = Vec::new();
        info.extend_from_slice(&JournalInfoFlags::IN_FS.bits().to_be_bytes());
        info.extend_from_slice(&[0u8; 32]); // device signature
        info.extend_from_slice(&journal_offset.to_be_bytes());
        info.extend_from_slice(&(journal.len() as u64).to_be_bytes());
        let info_extent = builder.place(&info);

        while u64::from(builder.next_block()) * 512 < journal_offset {
            builder.skip_blocks(1);
        }
        assert_eq!(u64::from(builder.next_block()) * 512, journal_offset);
        builder.place(journal);

        let mut image = builder.finish(
            SIGNATURE_HFS_PLUS,
            testutil::fork_data(catalog_tree.len() as u64, &[catalog]),
            testutil::fork_data(extents_tree.len() as u64, &[extents]),
            ForkData::default(),
        );

        // Set the journaled attribute and the info block pointer.
        let attributes = 1u32 << 13;
        image[1024 + 4..1024 + 8].copy_from_slice(&attributes.to_be_bytes());
        image[1024 + 12..1024 + 16].copy_from_slice(&info_extent.start_block.to_be_bytes());
        image
    }

    fn build_journal(header: Vec<u8>, lists: &[Vec<u8>]) -> Vec<u8> {
        let mut journal = vec![0u8; JOURNAL_SIZE as usize];
        journal[..header.len()].copy_from_slice(&header);
        let mut pos = JHDR_SIZE as usize;
        for list in lists {
            journal[pos..pos + list.len()].copy_from_slice(list);
            // The data blocks themselves follow; leave them zeroed.
            let used = hfsal::read_u32_le(list, 4) as usize;
            pos += used;
        }
        journal
    }

    #[test]
    fn clean_journal() {
        let journal = build_journal(le_header(1024, 1024), &[]);
        let image = journaled_volume(&journal, 4096);
        let volume = testutil::volume_from(image);

        let journal = volume.journal().unwrap().unwrap();
        assert!(journal.info.in_fs());
        assert!(journal.is_clean());
        assert!(journal.pending_transactions().unwrap().is_empty());
    }

    #[test]
    fn pending_transactions_grouped_by_continuation() {
        // Three block lists: the first two belong to one transaction, the
        // third stands alone. Data runs of 512 bytes follow each header.
        let start = u64::from(JHDR_SIZE);
        let lists = vec![
            le_block_list(512, 1),
            le_block_list(512, 1),
            le_block_list(512, 0),
        ];
        let end = start + 3 * (u64::from(BLHDR_SIZE) + 512);
        let journal = build_journal(le_header(start, end), &lists);
        let image = journaled_volume(&journal, 4096);
        let volume = testutil::volume_from(image);

        let journal = volume.journal().unwrap().unwrap();
        assert!(!journal.is_clean());

        let transactions = journal.pending_transactions().unwrap();
        assert_eq!(transactions.len(), 2);
        assert_eq!(transactions[0].block_lists.len(), 2);
        assert_eq!(transactions[1].block_lists.len(), 1);
        assert_eq!(transactions[0].block_lists[0].num_blocks, 2);
        assert_eq!(transactions[0].block_lists[0].blocks[1].bsize, 512);
    }

    #[test]
    fn checksum_mismatch_is_corrupt() {
        let mut header = le_header(1024, 1024);
        header[37] ^= 0xFF; // corrupt the stored checksum
        let journal = build_journal(header, &[]);
        let image = journaled_volume(&journal, 4096);
        let volume = testutil::volume_from(image);

        assert!(matches!(volume.journal(), Err(Error::Corrupt(_))));
    }

    #[test]
    fn big_endian_journal_header() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&JOURNAL_HEADER_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&ENDIAN_MAGIC.to_be_bytes());
        bytes.extend_from_slice(&1024u64.to_be_bytes());
        bytes.extend_from_slice(&1024u64.to_be_bytes());
        bytes.extend_from_slice(&JOURNAL_SIZE.to_be_bytes());
        bytes.extend_from_slice(&BLHDR_SIZE.to_be_bytes());
        bytes.extend_from_slice(&0u32.to_be_bytes());
        bytes.extend_from_slice(&JHDR_SIZE.to_be_bytes());
        let checksum = JournalHeader::calculate_checksum(&bytes);
        bytes[36..40].copy_from_slice(&checksum.to_be_bytes());

        let (header, endian) = JournalHeader::parse(&bytes).unwrap();
        assert_eq!(endian, scroll::BE);
        assert_eq!(header.size, JOURNAL_SIZE);
        assert!(header.is_clean());
    }

    #[test]
    fn uninitialized_journal_has_no_header() {
        let mut builder = ImageBuilder::new();
        let catalog_tree = testutil::empty_tree_file(512);
        let catalog = builder.place(&catalog_tree);
        let extents_tree = testutil::empty_tree_file(512);
        let extents = builder.place(&extents_tree);

        let mut info = Vec::new();
        info.extend_from_slice(
            &(JournalInfoFlags::IN_FS | JournalInfoFlags::NEEDS_INIT)
                .bits()
                .to_be_bytes(),
        );
        info.extend_from_slice(&[0u8; 32]);
        info.extend_from_slice(&4096u64.to_be_bytes());
        info.extend_from_slice(&JOURNAL_SIZE.to_be_bytes());
        let info_extent = builder.place(&info);

        let mut image = builder.finish(
            SIGNATURE_HFS_PLUS,
            testutil::fork_data(catalog_tree.len() as u64, &[catalog]),
            testutil::fork_data(extents_tree.len() as u64, &[extents]),
            ForkData::default(),
        );
        image[1024 + 4..1024 + 8].copy_from_slice(&(1u32 << 13).to_be_bytes());
        image[1024 + 12..1024 + 16].copy_from_slice(&info_extent.start_block.to_be_bytes());

        let volume = testutil::volume_from(image);
        let journal = volume.journal().unwrap().unwrap();
        assert!(journal.info.needs_init());
        assert!(journal.header().is_none());
        assert!(journal.is_clean());
        assert!(journal.pending_transactions().unwrap().is_empty());
    }
}
