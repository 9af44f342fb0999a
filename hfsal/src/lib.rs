//! Shared primitives for read-only access to Apple disk structures: a
//! device abstraction, endian-explicit byte readers and the common error
//! taxonomy used by the backend crates.

use std::io::{self, prelude::*, SeekFrom};
use std::sync::Mutex;
use std::{fmt, mem, ops};

pub use uuid::Uuid;

pub fn read_u8(block: &[u8], offset: usize) -> u8 {
    block[offset]
}
pub fn read_u16_be(block: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; mem::size_of::<u16>()];
    bytes.copy_from_slice(&block[offset..offset + mem::size_of::<u16>()]);
    u16::from_be_bytes(bytes)
}
pub fn read_u32_be(block: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; mem::size_of::<u32>()];
    bytes.copy_from_slice(&block[offset..offset + mem::size_of::<u32>()]);
    u32::from_be_bytes(bytes)
}
pub fn read_u64_be(block: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; mem::size_of::<u64>()];
    bytes.copy_from_slice(&block[offset..offset + mem::size_of::<u64>()]);
    u64::from_be_bytes(bytes)
}
pub fn read_u16_le(block: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; mem::size_of::<u16>()];
    bytes.copy_from_slice(&block[offset..offset + mem::size_of::<u16>()]);
    u16::from_le_bytes(bytes)
}
pub fn read_u32_le(block: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; mem::size_of::<u32>()];
    bytes.copy_from_slice(&block[offset..offset + mem::size_of::<u32>()]);
    u32::from_le_bytes(bytes)
}
pub fn read_u64_le(block: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; mem::size_of::<u64>()];
    bytes.copy_from_slice(&block[offset..offset + mem::size_of::<u64>()]);
    u64::from_le_bytes(bytes)
}
pub fn read_uuid(block: &[u8], offset: usize) -> Uuid {
    uuid::Builder::from_slice(&block[offset..offset + 16])
        .unwrap()
        .build()
}

/// Cursor-style variants of the flat readers, for sequential decoding.
pub mod parsing {
    pub fn read_u8(block: &[u8], offset: &mut usize) -> u8 {
        let ret = super::read_u8(block, *offset);
        *offset += 1;
        ret
    }
    pub fn read_u16_be(block: &[u8], offset: &mut usize) -> u16 {
        let ret = super::read_u16_be(block, *offset);
        *offset += 2;
        ret
    }
    pub fn read_u32_be(block: &[u8], offset: &mut usize) -> u32 {
        let ret = super::read_u32_be(block, *offset);
        *offset += 4;
        ret
    }
    pub fn read_u64_be(block: &[u8], offset: &mut usize) -> u64 {
        let ret = super::read_u64_be(block, *offset);
        *offset += 8;
        ret
    }
    pub fn read_u16_le(block: &[u8], offset: &mut usize) -> u16 {
        let ret = super::read_u16_le(block, *offset);
        *offset += 2;
        ret
    }
    pub fn read_u32_le(block: &[u8], offset: &mut usize) -> u32 {
        let ret = super::read_u32_le(block, *offset);
        *offset += 4;
        ret
    }
    pub fn read_u64_le(block: &[u8], offset: &mut usize) -> u64 {
        let ret = super::read_u64_le(block, *offset);
        *offset += 8;
        ret
    }
    pub fn skip(offset: &mut usize, amount: usize) -> &mut usize {
        *offset += amount;
        offset
    }
}

/// A read-only random-access byte source, typically a disk image file or a
/// raw device.
///
/// All reads are positioned, so that a seek and the following read form one
/// atomic operation from the caller's point of view. Implementations on
/// seek-based handles must serialize internally.
pub trait Device {
    /// Read exactly `buf.len()` bytes at `offset`, failing on EOF.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()>;

    /// The total length of the device, in bytes.
    fn len(&self) -> io::Result<u64>;
}

impl<'a, D: Device + ?Sized> Device for &'a D {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        (**self).read_exact_at(offset, buf)
    }
    fn len(&self) -> io::Result<u64> {
        (**self).len()
    }
}

/// Adapts any `Read + Seek` handle into a [`Device`] by locking around each
/// seek+read pair.
pub struct BasicDevice<R> {
    inner: Mutex<R>,
}

impl<R> BasicDevice<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner: Mutex::new(inner),
        }
    }
    pub fn into_inner(self) -> R {
        match self.inner.into_inner() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

impl<R> fmt::Debug for BasicDevice<R> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "(device)")
    }
}

impl<R: Read + Seek> Device for BasicDevice<R> {
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.seek(SeekFrom::Start(offset))?;
        guard.read_exact(buf)
    }
    fn len(&self) -> io::Result<u64> {
        let mut guard = match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.seek(SeekFrom::End(0))
    }
}

/// The error taxonomy shared by all decoding layers.
///
/// "Key not found" and similar legitimate misses are never errors; they are
/// expressed as `Option::None` by the operations that can miss. `Corrupt`
/// means the on-disk structures contradict themselves and the operation
/// cannot produce a trustworthy result.
#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    Parse(&'static str),
    Corrupt(&'static str),
    Unsupported(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "i/o error: {}", err),
            Error::Parse(msg) => write!(f, "parse error: {}", msg),
            Error::Corrupt(msg) => write!(f, "corrupt structure: {}", msg),
            Error::Unsupported(msg) => write!(f, "unsupported: {}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub fn div_round_up<T>(numer: T, denom: T) -> T
where
    T: ops::Add<Output = T>
        + Copy
        + ops::Div<Output = T>
        + ops::Rem<Output = T>
        + From<u8>
        + PartialEq,
{
    if numer % denom != T::from(0u8) {
        numer / denom + T::from(1u8)
    } else {
        numer / denom
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn endian_readers() {
        let bytes = [0x12, 0x34, 0x56, 0x78, 0x9A, 0xBC, 0xDE, 0xF0];
        assert_eq!(read_u16_be(&bytes, 0), 0x1234);
        assert_eq!(read_u16_le(&bytes, 0), 0x3412);
        assert_eq!(read_u32_be(&bytes, 2), 0x5678_9ABC);
        assert_eq!(read_u32_le(&bytes, 2), 0xBC9A_7856);
        assert_eq!(read_u64_be(&bytes, 0), 0x1234_5678_9ABC_DEF0);

        let mut offset = 0;
        assert_eq!(parsing::read_u16_be(&bytes, &mut offset), 0x1234);
        parsing::skip(&mut offset, 2);
        assert_eq!(parsing::read_u32_be(&bytes, &mut offset), 0x9ABC_DEF0);
        assert_eq!(offset, 8);
    }

    #[test]
    fn basic_device_positioned_reads() {
        let data: Vec<u8> = (0..=255).collect();
        let device = BasicDevice::new(Cursor::new(data));

        let mut buf = [0u8; 4];
        device.read_exact_at(16, &mut buf).unwrap();
        assert_eq!(buf, [16, 17, 18, 19]);

        // Reads are independently positioned; a second read does not depend
        // on where the first one left the handle.
        device.read_exact_at(0, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3]);

        assert_eq!(device.len().unwrap(), 256);
        assert!(device.read_exact_at(254, &mut buf).is_err());
    }

    #[test]
    fn div_round_up_works() {
        assert_eq!(div_round_up(10u32, 5u32), 2);
        assert_eq!(div_round_up(11u32, 5u32), 3);
        assert_eq!(div_round_up(1u64, 4096u64), 1);
        assert_eq!(div_round_up(0u64, 4096u64), 0);
    }
}
