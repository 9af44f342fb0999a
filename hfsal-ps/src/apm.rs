//! The Apple Partition Map: the Driver Descriptor Record in block 0 and
//! one 512-byte partition record per block from block 1 on. All fields
//! are big-endian.

use bitflags::bitflags;
use quick_error::quick_error;

use hfsal::Device;

pub const DDR_SIGNATURE: u16 = 0x4552; // "ER"
pub const APM_SIGNATURE: u16 = 0x504D; // "PM"
pub const APM_OLD_SIGNATURE: u16 = 0x5453; // "TS"

pub const PARTITION_RECORD_LEN: usize = 512;

quick_error! {
    #[derive(Debug)]
    pub enum ApmError {
        Io(err: std::io::Error) {
            from()
            description("i/o error reading the partition map")
            display("i/o error reading the partition map: {}", err)
        }
        InvalidEntry(index: usize) {
            description("partition map entry without a valid signature")
            display("partition map entry {} has no valid signature", index)
        }
        RedundantFieldMismatch(index: usize) {
            description("partition map entries disagree on their shared fields")
            display("partition map entry {} disagrees with entry 0 on shared fields", index)
        }
    }
}

/// Block 0 of an APM disk: identifies the device block size the map is
/// laid out in.
#[derive(Clone, Copy, Debug)]
pub struct DriverDescriptorRecord {
    pub signature: u16,
    pub block_size: u16,
    pub block_count: u32,
}

impl DriverDescriptorRecord {
    pub fn parse(bytes: &[u8]) -> Self {
        Self {
            signature: hfsal::read_u16_be(bytes, 0),
            block_size: hfsal::read_u16_be(bytes, 2),
            block_count: hfsal::read_u32_be(bytes, 4),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.signature == DDR_SIGNATURE && self.block_size >= 512
    }
}

bitflags! {
    pub struct PartitionStatus: u32 {
        const VALID = 0x0000_0001;
        const ALLOCATED = 0x0000_0002;
        const IN_USE = 0x0000_0004;
        const BOOTABLE = 0x0000_0008;
        const READABLE = 0x0000_0010;
        const WRITABLE = 0x0000_0020;
        const OS_PIC_CODE = 0x0000_0040;
        const OS_SPECIFIC_1 = 0x0000_0080;
        const OS_SPECIFIC_2 = 0x0000_0100;
    }
}

/// The well-known APM partition type strings.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PartitionType {
    PartitionMap,
    Driver,
    Driver43,
    Mfs,
    HfsContainer,
    Hfsx,
    UnixSvr2,
    Prodos,
    Empty,
    Unknown,
}

impl PartitionType {
    pub fn from_type_string(type_string: &str) -> Self {
        match type_string {
            "Apple_partition_map" => PartitionType::PartitionMap,
            "Apple_Driver" => PartitionType::Driver,
            "Apple_Driver43" => PartitionType::Driver43,
            "Apple_MFS" => PartitionType::Mfs,
            "Apple_HFS" => PartitionType::HfsContainer,
            "Apple_HFSX" => PartitionType::Hfsx,
            "Apple_Unix_SVR2" => PartitionType::UnixSvr2,
            "Apple_PRODOS" => PartitionType::Prodos,
            "Apple_Free" | "Apple_Scratch" => PartitionType::Empty,
            _ => PartitionType::Unknown,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ApmPartition {
    pub signature: u16,
    pub signature_pad: u16,
    pub map_block_count: u32,
    pub partition_start: u32,
    pub partition_block_count: u32,
    pub name: [u8; 32],
    pub partition_type: [u8; 32],
    pub data_start: u32,
    pub data_count: u32,
    pub status: u32,
    pub boot_start: u32,
    pub boot_size: u32,
    pub boot_address: u32,
    pub boot_entry: u32,
    pub boot_checksum: u32,
    pub processor: [u8; 16],
}

impl ApmPartition {
    pub fn parse(bytes: &[u8]) -> Self {
        let mut name = [0u8; 32];
        name.copy_from_slice(&bytes[16..48]);
        let mut partition_type = [0u8; 32];
        partition_type.copy_from_slice(&bytes[48..80]);
        let mut processor = [0u8; 16];
        processor.copy_from_slice(&bytes[120..136]);

        Self {
            signature: hfsal::read_u16_be(bytes, 0),
            signature_pad: hfsal::read_u16_be(bytes, 2),
            map_block_count: hfsal::read_u32_be(bytes, 4),
            partition_start: hfsal::read_u32_be(bytes, 8),
            partition_block_count: hfsal::read_u32_be(bytes, 12),
            name,
            partition_type,
            data_start: hfsal::read_u32_be(bytes, 80),
            data_count: hfsal::read_u32_be(bytes, 84),
            status: hfsal::read_u32_be(bytes, 88),
            boot_start: hfsal::read_u32_be(bytes, 92),
            boot_size: hfsal::read_u32_be(bytes, 96),
            boot_address: hfsal::read_u32_be(bytes, 100),
            boot_entry: hfsal::read_u32_be(bytes, 108),
            boot_checksum: hfsal::read_u32_be(bytes, 116),
            processor,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.signature == APM_SIGNATURE || self.signature == APM_OLD_SIGNATURE
    }

    pub fn status_flags(&self) -> PartitionStatus {
        PartitionStatus::from_bits_truncate(self.status)
    }

    pub fn name_string(&self) -> String {
        null_terminated_ascii(&self.name)
    }

    pub fn type_string(&self) -> String {
        null_terminated_ascii(&self.partition_type)
    }

    pub fn partition_type(&self) -> PartitionType {
        PartitionType::from_type_string(&self.type_string())
    }

    /// Byte offset of the partition's data area on the device.
    pub fn start_offset(&self, block_size: u32) -> u64 {
        (u64::from(self.partition_start) + u64::from(self.data_start)) * u64::from(block_size)
    }

    /// Byte length of the partition's data area. A zero data count falls
    /// back to what the partition and boot bounds imply.
    pub fn length(&self, block_size: u32) -> u64 {
        let data_start = u64::from(self.data_start);
        let mut data_blocks = u64::from(self.data_count);

        if data_blocks == 0 {
            let partition_blocks = u64::from(self.partition_block_count);
            let boot_start = u64::from(self.boot_start);
            let end = if boot_start > data_start {
                boot_start
            } else {
                partition_blocks
            };
            data_blocks = end - data_start;
        }
        data_blocks * u64::from(block_size)
    }
}

fn null_terminated_ascii(bytes: &[u8]) -> String {
    let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[..end].iter().map(|&b| b as char).collect()
}

/// A fully decoded partition map.
#[derive(Clone, Debug)]
pub struct ApplePartitionMap {
    pub block_size: u32,
    pub partitions: Vec<ApmPartition>,
}

impl ApplePartitionMap {
    /// Read the map at `offset` bytes into the device. Every record must
    /// carry a valid signature and agree with the first record on the
    /// redundant `(signature, signaturePad, mapBlockCount)` fields; any
    /// mismatch is a hard failure, not a skippable entry.
    pub fn read<D: Device>(device: &D, offset: u64) -> Result<Self, ApmError> {
        let mut block = [0u8; PARTITION_RECORD_LEN];
        device.read_exact_at(offset, &mut block)?;
        let ddr = DriverDescriptorRecord::parse(&block);
        let block_size = if ddr.is_valid() {
            u32::from(ddr.block_size)
        } else {
            512
        };

        let mut partitions: Vec<ApmPartition> = Vec::new();
        let mut shared: Option<(u16, u16, u32)> = None;

        loop {
            match shared {
                None => {}
                Some((_, _, map_block_count)) => {
                    if partitions.len() as u32 >= map_block_count {
                        break;
                    }
                }
            }

            let record_offset = offset + u64::from(block_size) * (partitions.len() as u64 + 1);
            device.read_exact_at(record_offset, &mut block)?;
            let partition = ApmPartition::parse(&block);

            if !partition.is_valid() {
                log::debug!("invalid partition map entry at index {}", partitions.len());
                return Err(ApmError::InvalidEntry(partitions.len()));
            }

            let fields = (
                partition.signature,
                partition.signature_pad,
                partition.map_block_count,
            );
            match shared {
                None => shared = Some(fields),
                Some(expected) if expected != fields => {
                    return Err(ApmError::RedundantFieldMismatch(partitions.len()));
                }
                Some(_) => {}
            }

            partitions.push(partition);
        }

        Ok(Self {
            block_size,
            partitions,
        })
    }

    /// An empty partition system is not a partition system.
    pub fn is_valid(&self) -> bool {
        !self.partitions.is_empty() && self.partitions.iter().all(ApmPartition::is_valid)
    }
}
