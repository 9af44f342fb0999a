//! Just enough classic resource-fork decoding to locate a resource by
//! type: the fork header, the resource map's type list and reference
//! lists. Used to find the `cmpf` stream of decmpfs-compressed files.

use hfsal::{Device, Error, Result};

use crate::fork::ForkStream;

#[derive(Clone, Copy, Debug)]
pub struct ResourceForkHeader {
    pub data_offset: u32,
    pub map_offset: u32,
    pub data_length: u32,
    pub map_length: u32,
}

impl ResourceForkHeader {
    pub const LEN: usize = 16;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(Error::Parse("resource fork header truncated"));
        }
        Ok(Self {
            data_offset: hfsal::read_u32_be(bytes, 0),
            map_offset: hfsal::read_u32_be(bytes, 4),
            data_length: hfsal::read_u32_be(bytes, 8),
            map_length: hfsal::read_u32_be(bytes, 12),
        })
    }
}

/// One entry of a type's reference list.
#[derive(Clone, Copy, Debug)]
pub struct ResourceRef {
    pub resource_type: [u8; 4],
    pub id: u16,
    pub attributes: u8,
    /// Offset of the resource's data (its length-prefixed blob) from the
    /// start of the fork's data area.
    pub data_offset: u32,
}

/// Where a resource's payload bytes live within the fork.
#[derive(Clone, Copy, Debug)]
pub struct ResourceSlice {
    pub offset: u64,
    pub length: u64,
}

pub fn list_resources<D: Device>(fork: &ForkStream<D>) -> Result<Vec<ResourceRef>> {
    let mut header_bytes = [0u8; ResourceForkHeader::LEN];
    fork.read_exact_at(0, &mut header_bytes)?;
    let header = ResourceForkHeader::parse(&header_bytes)?;

    if header.map_length < 30 {
        return Err(Error::Corrupt("resource map too small"));
    }
    let mut map = vec![0u8; header.map_length as usize];
    fork.read_exact_at(u64::from(header.map_offset), &mut map)?;

    // The map: 16 reserved bytes, a handle, a file reference number and
    // the map attributes precede the two list offsets.
    let type_list_offset = hfsal::read_u16_be(&map, 24) as usize;
    if type_list_offset + 2 > map.len() {
        return Err(Error::Corrupt("resource type list outside the map"));
    }

    // Counts in resource maps are stored minus one.
    let type_count = hfsal::read_u16_be(&map, type_list_offset).wrapping_add(1) as usize;

    let mut resources = Vec::new();
    for i in 0..type_count {
        let entry = type_list_offset + 2 + 8 * i;
        if entry + 8 > map.len() {
            return Err(Error::Corrupt("resource type entry outside the map"));
        }

        let mut resource_type = [0u8; 4];
        resource_type.copy_from_slice(&map[entry..entry + 4]);
        let instance_count = hfsal::read_u16_be(&map, entry + 4).wrapping_add(1) as usize;
        let ref_list_offset =
            type_list_offset + hfsal::read_u16_be(&map, entry + 6) as usize;

        for j in 0..instance_count {
            let reference = ref_list_offset + 12 * j;
            if reference + 12 > map.len() {
                return Err(Error::Corrupt("resource reference outside the map"));
            }

            let data_offset = (u32::from(map[reference + 5]) << 16)
                | (u32::from(map[reference + 6]) << 8)
                | u32::from(map[reference + 7]);
            resources.push(ResourceRef {
                resource_type,
                id: hfsal::read_u16_be(&map, reference),
                attributes: map[reference + 4],
                data_offset,
            });
        }
    }
    Ok(resources)
}

/// The unique resource of the given type. More than one instance is
/// unsupported (the decmpfs contract allows exactly one `cmpf`).
pub fn find_resource<D: Device>(
    fork: &ForkStream<D>,
    fourcc: &[u8; 4],
) -> Result<Option<ResourceRef>> {
    let matching: Vec<ResourceRef> = list_resources(fork)?
        .into_iter()
        .filter(|r| &r.resource_type == fourcc)
        .collect();

    match matching.len() {
        0 => Ok(None),
        1 => Ok(Some(matching[0])),
        _ => Err(Error::Unsupported("more than one resource instance of this type")),
    }
}

/// Resolve a reference to the absolute position and length of its payload
/// within the fork.
pub fn resource_data_slice<D: Device>(
    fork: &ForkStream<D>,
    reference: &ResourceRef,
) -> Result<ResourceSlice> {
    let mut header_bytes = [0u8; ResourceForkHeader::LEN];
    fork.read_exact_at(0, &mut header_bytes)?;
    let header = ResourceForkHeader::parse(&header_bytes)?;

    let blob_offset = u64::from(header.data_offset) + u64::from(reference.data_offset);
    let mut length_bytes = [0u8; 4];
    fork.read_exact_at(blob_offset, &mut length_bytes)?;

    Ok(ResourceSlice {
        offset: blob_offset + 4,
        length: u64::from(u32::from_be_bytes(length_bytes)),
    })
}

/// Test-support builder: assemble a resource fork from `(type, payload)`
/// pairs, mirroring what the decoder expects.
#[cfg(test)]
pub(crate) fn build_resource_fork(resources: &[([u8; 4], Vec<u8>)]) -> Vec<u8> {
    let mut data_area = Vec::new();
    let mut data_offsets = Vec::new();
    for (_, payload) in resources {
        data_offsets.push(data_area.len() as u32);
        data_area.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        data_area.extend_from_slice(payload);
    }

    // Group references by type, preserving first-seen type order.
    let mut types: Vec<([u8; 4], Vec<u32>)> = Vec::new();
    for ((fourcc, _), offset) in resources.iter().zip(&data_offsets) {
        match types.iter_mut().find(|(t, _)| t == fourcc) {
            Some((_, offsets)) => offsets.push(*offset),
            None => types.push((*fourcc, vec![*offset])),
        }
    }

    let type_list_offset = 28usize;
    let mut type_entries = Vec::new();
    let mut ref_lists = Vec::new();
    let ref_list_base = 2 + 8 * types.len();
    for (fourcc, offsets) in &types {
        type_entries.extend_from_slice(fourcc);
        type_entries.extend_from_slice(&((offsets.len() as u16) - 1).to_be_bytes());
        type_entries
            .extend_from_slice(&((ref_list_base + ref_lists.len()) as u16).to_be_bytes());
        for offset in offsets {
            let mut entry = Vec::new();
            entry.extend_from_slice(&0u16.to_be_bytes()); // id
            entry.extend_from_slice(&(-1i16).to_be_bytes()); // no name
            entry.push(0); // attributes
            entry.extend_from_slice(&offset.to_be_bytes()[1..4]);
            entry.extend_from_slice(&0u32.to_be_bytes()); // handle
            ref_lists.extend_from_slice(&entry);
        }
    }

    let mut map = vec![0u8; 24];
    map.extend_from_slice(&(type_list_offset as u16).to_be_bytes());
    map.extend_from_slice(&0u16.to_be_bytes()); // name list offset (unused)
    map.extend_from_slice(&((types.len() as u16).wrapping_sub(1)).to_be_bytes());
    map.extend_from_slice(&type_entries);
    map.extend_from_slice(&ref_lists);

    let data_offset = 256u32; // standard header-to-data gap
    let mut fork = vec![0u8; data_offset as usize];
    fork[0..4].copy_from_slice(&data_offset.to_be_bytes());
    fork[8..12].copy_from_slice(&(data_area.len() as u32).to_be_bytes());
    fork.extend_from_slice(&data_area);

    let map_offset = fork.len() as u32;
    fork[4..8].copy_from_slice(&map_offset.to_be_bytes());
    fork[12..16].copy_from_slice(&(map.len() as u32).to_be_bytes());
    fork.extend_from_slice(&map);

    fork
}
