//! decmpfs ("fpmc") compressed data: the attribute header, inline
//! payloads, and the block-indexed seekable stream stored in a `cmpf`
//! resource. All decmpfs fields are little-endian, unlike the rest of the
//! volume.

use std::io::prelude::*;

use flate2::read::ZlibDecoder;

use hfsal::{Device, Error, Result};

use crate::catalog::FileRecord;
use crate::fork::ForkStream;
use crate::resource_fork;
use crate::{ForkType, HfsVolume};

pub const DECMPFS_XATTR_NAME: &str = "com.apple.decmpfs";

pub const COMPRESSION_TYPE_INLINE: u32 = 3;
pub const COMPRESSION_TYPE_RESOURCE: u32 = 4;

/// Low nibble of a chunk's flag byte marking it as stored uncompressed.
const RAW_CHUNK_FLAG: u8 = 0x0F;

#[derive(Clone, Copy, Debug)]
pub struct DecmpfsHeader {
    pub compression_type: u32,
    pub uncompressed_size: u64,
}

impl DecmpfsHeader {
    pub const LEN: usize = 16;

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::LEN {
            return Err(Error::Parse("decmpfs header truncated"));
        }
        if &bytes[0..4] != b"fpmc" {
            return Err(Error::Corrupt("bad decmpfs magic"));
        }
        Ok(Self {
            compression_type: hfsal::read_u32_le(bytes, 4),
            uncompressed_size: hfsal::read_u64_le(bytes, 8),
        })
    }
}

/// Decode an inline-compressed attribute value: the decmpfs header
/// followed by either a raw tail (flag low nibble 0x0F) or one zlib
/// stream inflating to the declared size.
pub fn decode_inline(attr: &[u8]) -> Result<Vec<u8>> {
    let header = DecmpfsHeader::parse(attr)?;
    if header.compression_type != COMPRESSION_TYPE_INLINE {
        return Err(Error::Unsupported("not an inline decmpfs payload"));
    }

    let size = header.uncompressed_size as usize;
    let payload = &attr[DecmpfsHeader::LEN..];

    if size == 0 {
        return Ok(Vec::new());
    }
    if payload.is_empty() {
        return Err(Error::Corrupt("inline decmpfs payload is empty"));
    }

    if payload[0] & 0x0F == RAW_CHUNK_FLAG {
        let raw = &payload[1..];
        if raw.len() != size {
            log::warn!(
                "inline decmpfs raw data length {} does not match declared size {}",
                raw.len(),
                size
            );
        }
        if raw.len() < size {
            return Err(Error::Corrupt("inline decmpfs raw data shorter than declared"));
        }
        return Ok(raw[..size].to_vec());
    }

    let mut out = Vec::with_capacity(size);
    ZlibDecoder::new(payload)
        .read_to_end(&mut out)
        .map_err(|_| Error::Corrupt("invalid compressed data in decmpfs attribute"))?;
    if out.len() != size {
        return Err(Error::Corrupt("inline decmpfs data inflated to the wrong size"));
    }
    Ok(out)
}

/// The seekable decoder over a `cmpf` resource: a chunk count, a table of
/// `(offset, length)` pairs relative to the resource payload, then
/// independently decodable chunks.
///
/// Chunk boundaries in decompressed space are only known once a chunk has
/// been decoded, so forward reads are cheap and backward seeks recompute
/// from the start of the target chunk. While every chunk seen so far has
/// decompressed to the same size the chunk for an offset is found by
/// division; once sizes diverge, lookups fall back to the recorded
/// boundary table.
pub struct CompressedResourceStream<'a, D: Device> {
    fork: ForkStream<'a, D>,
    /// Start of the resource payload within the fork.
    base: u64,
    uncompressed_size: u64,
    chunk_table: Vec<(u32, u32)>,
    /// Decompressed start offsets of the chunks decoded so far, plus the
    /// running end boundary: `boundaries[i]` is where chunk `i` starts.
    boundaries: Vec<u64>,
    uniform_chunk_size: Option<u64>,
    cached: Option<(usize, Vec<u8>)>,
}

impl<'a, D: Device> CompressedResourceStream<'a, D> {
    pub fn open(
        fork: ForkStream<'a, D>,
        base: u64,
        limit: u64,
        uncompressed_size: u64,
    ) -> Result<Self> {
        let mut count_bytes = [0u8; 4];
        fork.read_exact_at(base, &mut count_bytes)?;
        let chunk_count = u32::from_le_bytes(count_bytes) as usize;

        if 4 + chunk_count as u64 * 8 > limit {
            return Err(Error::Corrupt("cmpf chunk table extends past the resource"));
        }

        let mut table_bytes = vec![0u8; chunk_count * 8];
        fork.read_exact_at(base + 4, &mut table_bytes)?;

        let mut chunk_table = Vec::with_capacity(chunk_count);
        for i in 0..chunk_count {
            let offset = hfsal::read_u32_le(&table_bytes, 8 * i);
            let length = hfsal::read_u32_le(&table_bytes, 8 * i + 4);
            if u64::from(offset) + u64::from(length) > limit {
                return Err(Error::Corrupt("cmpf chunk extends past the resource"));
            }
            chunk_table.push((offset, length));
        }

        Ok(Self {
            fork,
            base,
            uncompressed_size,
            chunk_table,
            boundaries: vec![0],
            uniform_chunk_size: None,
            cached: None,
        })
    }

    pub fn len(&self) -> u64 {
        self.uncompressed_size
    }

    pub fn is_empty(&self) -> bool {
        self.uncompressed_size == 0
    }

    fn processed(&self) -> usize {
        self.boundaries.len() - 1
    }

    fn decode_chunk(&self, index: usize) -> Result<Vec<u8>> {
        let (offset, length) = self.chunk_table[index];
        if length == 0 {
            return Err(Error::Corrupt("zero-length cmpf chunk"));
        }

        let mut flag = [0u8];
        self.fork.read_exact_at(self.base + u64::from(offset), &mut flag)?;

        if flag[0] & 0x0F == RAW_CHUNK_FLAG {
            let mut raw = vec![0u8; length as usize - 1];
            self.fork
                .read_exact_at(self.base + u64::from(offset) + 1, &mut raw)?;
            return Ok(raw);
        }

        let mut compressed = vec![0u8; length as usize];
        self.fork
            .read_exact_at(self.base + u64::from(offset), &mut compressed)?;

        let mut out = Vec::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut out)
            .map_err(|_| Error::Corrupt("invalid compressed data in cmpf chunk"))?;
        Ok(out)
    }

    /// Decode the next not-yet-seen chunk, extending the boundary table.
    fn advance(&mut self) -> Result<()> {
        let index = self.processed();
        let data = self.decode_chunk(index)?;
        let len = data.len() as u64;

        if index == 0 {
            self.uniform_chunk_size = Some(len);
        } else if self.uniform_chunk_size != Some(len) {
            self.uniform_chunk_size = None;
        }

        let end = self.boundaries[index] + len;
        self.boundaries.push(end);
        self.cached = Some((index, data));
        Ok(())
    }

    /// The chunk containing decompressed offset `pos`, decoding forward as
    /// needed. `None` when the stream ends before `pos`.
    fn chunk_containing(&mut self, pos: u64) -> Result<Option<usize>> {
        loop {
            let known_end = *self.boundaries.last().unwrap_or(&0);
            if pos < known_end {
                if let Some(uniform) = self.uniform_chunk_size {
                    return Ok(Some((pos / uniform) as usize));
                }
                let index = match self.boundaries.binary_search(&pos) {
                    Ok(i) => i,
                    Err(i) => i - 1,
                };
                return Ok(Some(index));
            }

            if self.processed() == self.chunk_table.len() {
                return Ok(None);
            }
            self.advance()?;
        }
    }

    fn chunk_data(&mut self, index: usize) -> Result<Vec<u8>> {
        if let Some((cached_index, data)) = &self.cached {
            if *cached_index == index {
                return Ok(data.clone());
            }
        }
        let data = self.decode_chunk(index)?;
        self.cached = Some((index, data.clone()));
        Ok(data)
    }

    /// Read at a decompressed offset. Short reads happen only at the end
    /// of the stream; running out of chunks before the declared size is
    /// corruption.
    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        if pos >= self.uncompressed_size {
            return Ok(0);
        }
        let wanted = ((self.uncompressed_size - pos).min(buf.len() as u64)) as usize;

        let mut done = 0;
        while done < wanted {
            let at = pos + done as u64;
            let index = match self.chunk_containing(at)? {
                Some(index) => index,
                None => {
                    return Err(Error::Corrupt(
                        "cmpf chunks end before the declared uncompressed size",
                    ))
                }
            };

            let data = self.chunk_data(index)?;
            let offset_in_chunk = (at - self.boundaries[index]) as usize;
            if offset_in_chunk >= data.len() {
                return Err(Error::Corrupt("cmpf chunk boundary bookkeeping is inconsistent"));
            }

            let n = (data.len() - offset_in_chunk).min(wanted - done);
            buf[done..done + n].copy_from_slice(&data[offset_in_chunk..offset_in_chunk + n]);
            done += n;
        }
        Ok(done)
    }

    pub fn read_exact_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<()> {
        if self.read_at(pos, buf)? != buf.len() {
            return Err(Error::Corrupt("read past end of compressed stream"));
        }
        Ok(())
    }
}

/// The decompressed data of a decmpfs-compressed file, either fully
/// inflated up front (inline variant) or wrapped in the seekable resource
/// decoder.
pub enum CompressedData<'v, D: Device> {
    Inline(Vec<u8>),
    Resource(CompressedResourceStream<'v, D>),
}

impl<'v, D: Device> CompressedData<'v, D> {
    pub fn len(&self) -> u64 {
        match self {
            CompressedData::Inline(data) => data.len() as u64,
            CompressedData::Resource(stream) => stream.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn read_at(&mut self, pos: u64, buf: &mut [u8]) -> Result<usize> {
        match self {
            CompressedData::Inline(data) => {
                if pos >= data.len() as u64 {
                    return Ok(0);
                }
                let start = pos as usize;
                let n = (data.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&data[start..start + n]);
                Ok(n)
            }
            CompressedData::Resource(stream) => stream.read_at(pos, buf),
        }
    }
}

/// Open the decompressed view of a compressed file's data fork, keyed off
/// its `com.apple.decmpfs` attribute. `None` when the file carries no such
/// attribute (i.e. is not compressed).
pub fn open_compressed<'v, D: Device>(
    volume: &'v HfsVolume<D>,
    file: &FileRecord,
) -> Result<Option<CompressedData<'v, D>>> {
    let attributes = match volume.attributes() {
        Some(attributes) => attributes,
        None => return Ok(None),
    };
    let attr = match attributes.read(file.file_id, DECMPFS_XATTR_NAME)? {
        Some(attr) => attr,
        None => return Ok(None),
    };

    let header = DecmpfsHeader::parse(&attr)?;
    match header.compression_type {
        COMPRESSION_TYPE_INLINE => Ok(Some(CompressedData::Inline(decode_inline(&attr)?))),
        COMPRESSION_TYPE_RESOURCE => {
            let fork =
                volume.fork_stream(file.file_id, &file.resource_fork, ForkType::Resource)?;
            let reference = match resource_fork::find_resource(&fork, b"cmpf")? {
                Some(reference) => reference,
                None => {
                    return Err(Error::Corrupt(
                        "compressed file's resource fork has no cmpf resource",
                    ))
                }
            };
            let slice = resource_fork::resource_data_slice(&fork, &reference)?;
            let stream = CompressedResourceStream::open(
                fork,
                slice.offset,
                slice.length,
                header.uncompressed_size,
            )?;
            Ok(Some(CompressedData::Resource(stream)))
        }
        other => {
            log::debug!("unknown decmpfs compression type {}", other);
            Err(Error::Unsupported("unknown decmpfs compression type"))
        }
    }
}
