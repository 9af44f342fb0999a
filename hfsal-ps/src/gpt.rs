//! The GUID Partition Table: primary and backup header plus entry
//! arrays, decoded leniently and validated as a whole.
//!
//! The backup header is not a byte copy of the primary: its current/backup
//! LBAs are swapped and its `partitionEntryLBA` points at the backup entry
//! array, so its CRC differs too. Only the two entry arrays are required
//! to be byte-identical. All fields are little-endian.

use quick_error::quick_error;
use scroll::Pread;
use uuid::Uuid;

use hfsal::Device;

pub const GPT_SIGNATURE: &[u8; 8] = b"EFI PART";
pub const HEADER_LEN: usize = 92;
pub const ENTRY_LEN: usize = 128;

/// Block sizes probed for the header when the device cannot tell us its
/// own. Images in particular carry no reliable block size metadata.
pub const PROBED_BLOCK_SIZES: [u32; 4] = [512, 1024, 2048, 4096];

quick_error! {
    #[derive(Debug)]
    pub enum GptError {
        Io(err: std::io::Error) {
            from()
            description("i/o error reading the partition table")
            display("i/o error reading the partition table: {}", err)
        }
        NoHeader {
            description("no GPT header found at any probed block size")
        }
        HeaderTooLarge {
            description("GPT header larger than its block")
        }
        EntryCountOutOfRange {
            description("GPT entry count out of range")
        }
    }
}

#[derive(Clone, Copy, Debug, Pread)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: u32,
    pub header_size: u32,
    pub header_crc32: u32,
    pub reserved: u32,
    pub current_lba: u64,
    pub backup_lba: u64,
    pub first_usable_lba: u64,
    pub last_usable_lba: u64,
    pub disk_guid: [u8; 16],
    pub partition_entry_lba: u64,
    pub number_of_entries: u32,
    pub size_of_entry: u32,
    pub entry_array_crc32: u32,
}

impl GptHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let header: GptHeader = bytes.pread_with(0, scroll::LE).ok()?;
        Some(header)
    }

    /// Structural plausibility, before any checksum is consulted.
    pub fn is_valid(&self) -> bool {
        &self.signature == GPT_SIGNATURE
            && self.header_size >= HEADER_LEN as u32
            && self.size_of_entry == ENTRY_LEN as u32
    }

    /// CRC-32 over the header's own bytes with the checksum field zeroed.
    pub fn calculate_crc32(&self, raw_header: &[u8]) -> u32 {
        let size = (self.header_size as usize).min(raw_header.len());
        let mut bytes = raw_header[..size].to_vec();
        if bytes.len() >= 20 {
            bytes[16..20].copy_from_slice(&[0; 4]);
        }
        crc::crc32::checksum_ieee(&bytes)
    }

    /// Whether `other` describes this header's mirror location and disk.
    pub fn is_valid_backup(&self, other: &GptHeader) -> bool {
        self.current_lba == other.backup_lba
            && self.backup_lba == other.current_lba
            && self.disk_guid == other.disk_guid
    }

    pub fn disk_guid(&self) -> Uuid {
        guid_from_mixed_endian(&self.disk_guid)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Pread)]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attribute_bits: u64,
    pub name: [u8; 72],
}

impl GptEntry {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        bytes.pread_with(0, scroll::LE).ok()
    }

    pub fn is_used(&self) -> bool {
        self.type_guid != [0u8; 16]
    }

    pub fn type_guid(&self) -> Uuid {
        guid_from_mixed_endian(&self.type_guid)
    }

    pub fn unique_guid(&self) -> Uuid {
        guid_from_mixed_endian(&self.unique_guid)
    }

    /// The partition name: UTF-16LE up to the first NUL.
    pub fn name(&self) -> String {
        let units: Vec<u16> = self
            .name
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .take_while(|&unit| unit != 0)
            .collect();
        String::from_utf16_lossy(&units)
    }

    pub fn start_offset(&self, block_size: u32) -> u64 {
        self.first_lba * u64::from(block_size)
    }

    pub fn length(&self, block_size: u32) -> u64 {
        (self.last_lba + 1 - self.first_lba) * u64::from(block_size)
    }
}

/// The first three GUID fields are little-endian on disk, the rest is a
/// plain byte sequence.
fn guid_from_mixed_endian(bytes: &[u8; 16]) -> Uuid {
    let d1 = hfsal::read_u32_le(bytes, 0);
    let d2 = hfsal::read_u16_le(bytes, 4);
    let d3 = hfsal::read_u16_le(bytes, 6);
    let mut d4 = [0u8; 8];
    d4.copy_from_slice(&bytes[8..16]);
    Uuid::from_fields(d1, d2, d3, &d4).unwrap_or_else(|_| Uuid::nil())
}

/// Both copies of the table, fully decoded. A table can decode and still
/// be invalid; validity is a computed property, not a parse-time failure.
#[derive(Clone, Debug)]
pub struct GuidPartitionTable {
    pub block_size: u32,
    pub header: GptHeader,
    pub backup_header: Option<GptHeader>,
    raw_primary_header: Vec<u8>,
    raw_backup_header: Vec<u8>,
    entries_raw: Vec<u8>,
    backup_entries_raw: Vec<u8>,
}

// A backstop against absurd entry counts when reading damaged tables.
const MAX_ENTRIES: u32 = 4096;

impl GuidPartitionTable {
    /// Probe for the primary header at block sizes of 512 through 4096,
    /// then read both copies. Backup problems degrade validity rather than
    /// failing the read.
    pub fn read<D: Device>(device: &D, offset: u64) -> Result<Self, GptError> {
        let (block_size, header, raw_primary_header) = Self::probe_header(device, offset)?;

        if !header.is_valid() {
            // Decoded something with the right signature that is still
            // structurally off; report it as a table that will never
            // validate rather than an error.
            return Ok(Self {
                block_size,
                header,
                backup_header: None,
                raw_primary_header,
                raw_backup_header: Vec::new(),
                entries_raw: Vec::new(),
                backup_entries_raw: Vec::new(),
            });
        }

        let entries_raw = Self::read_entries(device, offset, block_size, &header)?;

        let mut backup_header = None;
        let mut raw_backup_header = Vec::new();
        let mut backup_entries_raw = Vec::new();
        match Self::read_backup(device, offset, block_size, &header) {
            Ok(Some((backup, raw, entries))) => {
                backup_header = Some(backup);
                raw_backup_header = raw;
                backup_entries_raw = entries;
            }
            Ok(None) => {}
            Err(err) => {
                log::warn!("failed to read the backup GPT: {}", err);
            }
        }

        Ok(Self {
            block_size,
            header,
            backup_header,
            raw_primary_header,
            raw_backup_header,
            entries_raw,
            backup_entries_raw,
        })
    }

    fn probe_header<D: Device>(
        device: &D,
        offset: u64,
    ) -> Result<(u32, GptHeader, Vec<u8>), GptError> {
        let mut last_error: Option<GptError> = None;

        for &block_size in &PROBED_BLOCK_SIZES {
            let mut block = vec![0u8; block_size as usize];
            if let Err(err) = device.read_exact_at(offset + u64::from(block_size), &mut block) {
                last_error = Some(err.into());
                continue;
            }
            if let Some(header) = GptHeader::parse(&block) {
                if &header.signature == GPT_SIGNATURE {
                    return Ok((block_size, header, block));
                }
            }
        }

        Err(last_error.unwrap_or(GptError::NoHeader))
    }

    fn read_entries<D: Device>(
        device: &D,
        offset: u64,
        block_size: u32,
        header: &GptHeader,
    ) -> Result<Vec<u8>, GptError> {
        if header.number_of_entries > MAX_ENTRIES {
            return Err(GptError::EntryCountOutOfRange);
        }
        let mut raw = vec![0u8; header.number_of_entries as usize * ENTRY_LEN];
        device.read_exact_at(
            offset + header.partition_entry_lba * u64::from(block_size),
            &mut raw,
        )?;
        Ok(raw)
    }

    fn read_backup<D: Device>(
        device: &D,
        offset: u64,
        block_size: u32,
        header: &GptHeader,
    ) -> Result<Option<(GptHeader, Vec<u8>, Vec<u8>)>, GptError> {
        let mut block = vec![0u8; block_size as usize];
        device.read_exact_at(offset + header.backup_lba * u64::from(block_size), &mut block)?;

        let backup = match GptHeader::parse(&block) {
            Some(backup) if backup.is_valid() => backup,
            _ => return Ok(None),
        };

        let entries = Self::read_entries(device, offset, block_size, &backup)?;
        Ok(Some((backup, block, entries)))
    }

    pub fn entries(&self) -> Vec<GptEntry> {
        self.entries_raw
            .chunks_exact(ENTRY_LEN)
            .filter_map(GptEntry::parse)
            .collect()
    }

    pub fn backup_entries(&self) -> Vec<GptEntry> {
        self.backup_entries_raw
            .chunks_exact(ENTRY_LEN)
            .filter_map(GptEntry::parse)
            .collect()
    }

    pub fn used_entries(&self) -> Vec<GptEntry> {
        self.entries()
            .into_iter()
            .filter(GptEntry::is_used)
            .collect()
    }

    /// Full cross-validation, as a computed property: both headers present
    /// and plausible, both header CRCs and both entry-array CRCs correct,
    /// the two entry arrays byte-identical, and each header describing the
    /// other's location. A decodable table can still report `false` here.
    pub fn is_valid(&self) -> bool {
        let backup = match &self.backup_header {
            Some(backup) => backup,
            None => return false,
        };

        let primary_ok = self.header.is_valid()
            && self.header.header_crc32 == self.header.calculate_crc32(&self.raw_primary_header)
            && self.header.entry_array_crc32 == crc::crc32::checksum_ieee(&self.entries_raw);

        let backup_ok = backup.is_valid()
            && backup.header_crc32 == backup.calculate_crc32(&self.raw_backup_header)
            && backup.entry_array_crc32 == crc::crc32::checksum_ieee(&self.backup_entries_raw);

        let arrays_equal =
            self.entries_raw == self.backup_entries_raw && !self.entries_raw.is_empty();

        let mirrored =
            self.header.is_valid_backup(backup) && backup.is_valid_backup(&self.header);

        primary_ok && backup_ok && arrays_equal && mirrored
    }
}
