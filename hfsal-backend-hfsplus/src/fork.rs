//! Random access to a fork's logical byte range through its extent list.

use std::io::{self, prelude::*, SeekFrom};

use hfsal::Device;

use crate::volume::ExtentDescriptor;

/// A seekable byte stream over one fork, stitching reads across extent
/// boundaries. The stream spans `[0, logical_size)`; seeking past the end
/// is legal and reads there return EOF rather than failing.
pub struct ForkStream<'a, D: Device> {
    device: &'a D,
    extents: Vec<ExtentDescriptor>,
    logical_size: u64,
    block_size: u32,
    /// Byte offset of allocation block 0 on the device: the volume start
    /// plus `allocationBlockStart * physicalBlockSize` for wrapped volumes.
    base_offset: u64,
    pos: u64,
}

impl<'a, D: Device> ForkStream<'a, D> {
    pub fn new(
        device: &'a D,
        extents: Vec<ExtentDescriptor>,
        logical_size: u64,
        block_size: u32,
        base_offset: u64,
    ) -> Self {
        Self {
            device,
            extents,
            logical_size,
            block_size,
            base_offset,
            pos: 0,
        }
    }

    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    pub fn position(&self) -> u64 {
        self.pos
    }

    pub fn seek_to(&mut self, pos: u64) {
        self.pos = pos;
    }

    /// Read at an absolute fork offset, without touching the stream
    /// position. Returns the number of bytes read, which is shorter than
    /// the buffer only when the read runs into end-of-fork.
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        if offset >= self.logical_size {
            return Ok(0);
        }

        let readable = (self.logical_size - offset).min(buf.len() as u64) as usize;
        let buf = &mut buf[..readable];

        let block_size = u64::from(self.block_size);
        let mut done = 0usize;

        while done < readable {
            let logical = offset + done as u64;

            // Locate the extent containing `logical` by walking the list;
            // extent lists are short in practice.
            let mut span_start = 0u64;
            let mut located = None;
            for extent in &self.extents {
                let span_len = u64::from(extent.block_count) * block_size;
                if logical < span_start + span_len {
                    located = Some((extent, logical - span_start));
                    break;
                }
                span_start += span_len;
            }

            let (extent, offset_in_extent) = located.ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "fork extents do not cover the fork's logical size",
                )
            })?;

            let extent_len = u64::from(extent.block_count) * block_size;
            let chunk = ((extent_len - offset_in_extent) as usize).min(readable - done);
            let physical =
                self.base_offset + u64::from(extent.start_block) * block_size + offset_in_extent;

            self.device
                .read_exact_at(physical, &mut buf[done..done + chunk])?;
            done += chunk;
        }

        Ok(done)
    }

    pub fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let read = self.read_at(offset, buf)?;
        if read != buf.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of fork",
            ));
        }
        Ok(())
    }
}

impl<'a, D: Device> Read for ForkStream<'a, D> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let read = self.read_at(self.pos, buf)?;
        self.pos += read as u64;
        Ok(read)
    }
}

impl<'a, D: Device> Seek for ForkStream<'a, D> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => Some(offset),
            SeekFrom::End(delta) => end_offset(self.logical_size, delta),
            SeekFrom::Current(delta) => end_offset(self.pos, delta),
        };

        match new_pos {
            Some(p) => {
                self.pos = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek to a negative offset",
            )),
        }
    }
}

fn end_offset(base: u64, delta: i64) -> Option<u64> {
    if delta >= 0 {
        base.checked_add(delta as u64)
    } else {
        base.checked_sub(delta.unsigned_abs())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hfsal::BasicDevice;
    use std::io::Cursor;

    const BLOCK: u32 = 16;

    fn fragmented_device() -> (BasicDevice<Cursor<Vec<u8>>>, Vec<ExtentDescriptor>, Vec<u8>) {
        // 16 blocks of 16 bytes. The fork occupies blocks 2..4 and 7..10,
        // in that logical order.
        let mut image = vec![0u8; 16 * BLOCK as usize];
        let mut expected = Vec::new();
        let mut fill = |block: usize, tag: u8, expected: &mut Vec<u8>| {
            for i in 0..BLOCK as usize {
                image[block * BLOCK as usize + i] = tag.wrapping_add(i as u8);
            }
            expected.extend((0..BLOCK as u8).map(|i| tag.wrapping_add(i)));
        };
        fill(2, 0x10, &mut expected);
        fill(3, 0x30, &mut expected);
        fill(7, 0x50, &mut expected);
        fill(8, 0x70, &mut expected);
        fill(9, 0x90, &mut expected);

        let extents = vec![
            ExtentDescriptor { start_block: 2, block_count: 2 },
            ExtentDescriptor { start_block: 7, block_count: 3 },
        ];
        (BasicDevice::new(Cursor::new(image)), extents, expected)
    }

    #[test]
    fn stitches_reads_across_extents() {
        let (device, extents, expected) = fragmented_device();
        let fork = ForkStream::new(&device, extents, expected.len() as u64, BLOCK, 0);

        let mut all = vec![0u8; expected.len()];
        assert_eq!(fork.read_at(0, &mut all).unwrap(), expected.len());
        assert_eq!(all, expected);

        // A read crossing the extent boundary at logical offset 32.
        let mut cross = [0u8; 8];
        fork.read_exact_at(28, &mut cross).unwrap();
        assert_eq!(&cross, &expected[28..36]);
    }

    #[test]
    fn eof_semantics() {
        let (device, extents, expected) = fragmented_device();
        let size = expected.len() as u64;
        let mut fork = ForkStream::new(&device, extents, size, BLOCK, 0);

        // Truncated read at the tail.
        let mut buf = [0u8; 10];
        assert_eq!(fork.read_at(size - 4, &mut buf).unwrap(), 4);

        // Seeking past the end is legal; the read simply returns 0.
        fork.seek(SeekFrom::Start(size + 100)).unwrap();
        assert_eq!(fork.read(&mut buf).unwrap(), 0);

        assert!(fork.seek(SeekFrom::Current(-1000)).is_err());
    }

    #[test]
    fn logical_size_caps_physical_blocks() {
        // Fork of 20 bytes backed by 2 blocks (32 bytes allocated).
        let (device, extents, expected) = fragmented_device();
        let fork = ForkStream::new(&device, extents[..1].to_vec(), 20, BLOCK, 0);

        let mut buf = [0u8; 32];
        assert_eq!(fork.read_at(0, &mut buf).unwrap(), 20);
        assert_eq!(&buf[..20], &expected[..20]);
    }

    #[test]
    fn missing_extent_coverage_is_an_error() {
        let (device, extents, _) = fragmented_device();
        // Logical size claims more than the extents can cover.
        let fork = ForkStream::new(&device, extents[..1].to_vec(), 1000, BLOCK, 0);
        let mut buf = [0u8; 64];
        assert!(fork.read_at(0, &mut buf).is_err());
    }
}
