//! Partition system decoding for Apple-adjacent disks: the Apple
//! Partition Map and the GUID Partition Table, both with the validation
//! the on-disk formats call for. Decoding is read-only.

pub mod apm;
pub mod gpt;

pub use apm::{ApmError, ApplePartitionMap};
pub use gpt::{GptError, GuidPartitionTable};

use hfsal::Device;
use quick_error::quick_error;

/// One partition, reduced to what a volume opener needs.
#[derive(Clone, Debug)]
pub struct PartitionInfo {
    pub name: Option<String>,
    /// Byte offset of the partition's data on the device.
    pub start_offset: u64,
    pub length: u64,
}

/// A decoded partition system of either kind.
#[derive(Clone, Debug)]
pub enum PartitionSystem {
    Apm(ApplePartitionMap),
    Gpt(GuidPartitionTable),
}

quick_error! {
    #[derive(Debug)]
    pub enum DetectError {
        Io(err: std::io::Error) {
            from()
            description("i/o error while probing for a partition system")
            display("i/o error while probing for a partition system: {}", err)
        }
        Apm(err: ApmError) {
            from()
            description("apple partition map error")
            display("apple partition map error: {}", err)
        }
        Gpt(err: GptError) {
            from()
            description("guid partition table error")
            display("guid partition table error: {}", err)
        }
        NoPartitionSystem {
            description("no recognized partition system on the device")
        }
    }
}

impl PartitionSystem {
    /// Probe for a partition system at `offset`: GPT first (it is the more
    /// specific signature), then APM.
    pub fn detect<D: Device>(device: &D, offset: u64) -> Result<Self, DetectError> {
        match GuidPartitionTable::read(device, offset) {
            Ok(table) => return Ok(PartitionSystem::Gpt(table)),
            Err(GptError::NoHeader) => {}
            Err(err) => {
                log::debug!("GPT probe failed: {}", err);
            }
        }

        let mut block = [0u8; 2];
        device.read_exact_at(offset, &mut block)?;
        if hfsal::read_u16_be(&block, 0) == apm::DDR_SIGNATURE {
            return Ok(PartitionSystem::Apm(ApplePartitionMap::read(device, offset)?));
        }
        // Some APM images lack the driver descriptor; probe block 1 for a
        // partition record signature.
        device.read_exact_at(offset + 512, &mut block)?;
        match hfsal::read_u16_be(&block, 0) {
            apm::APM_SIGNATURE | apm::APM_OLD_SIGNATURE => {
                return Ok(PartitionSystem::Apm(ApplePartitionMap::read(device, offset)?));
            }
            _ => {}
        }

        Err(DetectError::NoPartitionSystem)
    }

    pub fn is_valid(&self) -> bool {
        match self {
            PartitionSystem::Apm(map) => map.is_valid(),
            PartitionSystem::Gpt(table) => table.is_valid(),
        }
    }

    /// The used partitions in on-disk order.
    pub fn partitions(&self) -> Vec<PartitionInfo> {
        match self {
            PartitionSystem::Apm(map) => map
                .partitions
                .iter()
                .map(|partition| PartitionInfo {
                    name: Some(partition.name_string()),
                    start_offset: partition.start_offset(map.block_size),
                    length: partition.length(map.block_size),
                })
                .collect(),
            PartitionSystem::Gpt(table) => table
                .used_entries()
                .iter()
                .map(|entry| PartitionInfo {
                    name: Some(entry.name()),
                    start_offset: entry.start_offset(table.block_size),
                    length: entry.length(table.block_size),
                })
                .collect(),
        }
    }
}
