//! Fixed-width byte codecs shared by inode keys and record-structured payloads.

use crate::fs::errors::FsError;

const U64_SIZE: usize = 8;
const U32_SIZE: usize = 4;

/// Record layout: [flags:1][key:8 BE][value_len:4 BE][value][crc32:4 BE]
const HEADER_SIZE: usize = 13;
const META_SIZE: usize = 17;

/// Bit position of the tombstone flag.
const TOMBSTONED_BIT: u8 = 1;

pub fn u64_to_bytes(v: u64) -> [u8; U64_SIZE] {
    v.to_be_bytes()
}

pub fn bytes_to_u64(data: &[u8]) -> Result<u64, FsError> {
    let bytes: [u8; U64_SIZE] = data
        .try_into()
        .map_err(|_| FsError::Decode(format!("expected 8 bytes, got {}", data.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

pub fn u32_to_bytes(v: u32) -> [u8; U32_SIZE] {
    v.to_be_bytes()
}

pub fn bytes_to_u32(data: &[u8]) -> Result<u32, FsError> {
    let bytes: [u8; U32_SIZE] = data
        .try_into()
        .map_err(|_| FsError::Decode(format!("expected 4 bytes, got {}", data.len())))?;
    Ok(u32::from_be_bytes(bytes))
}

/// Framed key/value record with a flag byte and a trailing CRC32 (IEEE) over
/// everything that precedes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub flags: u8,
    pub key: u64,
    pub value: Vec<u8>,
}

impl Record {
    pub fn new(key: u64, value: Vec<u8>) -> Self {
        Self {
            flags: 0,
            key,
            value,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.flags & (1 << TOMBSTONED_BIT) != 0
    }

    pub fn tombstone(&mut self) {
        self.flags |= 1 << TOMBSTONED_BIT;
    }

    pub fn untombstone(&mut self) {
        self.flags &= !(1 << TOMBSTONED_BIT);
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(META_SIZE + self.value.len());
        buf.push(self.flags);
        buf.extend_from_slice(&u64_to_bytes(self.key));
        buf.extend_from_slice(&u32_to_bytes(self.value.len() as u32));
        buf.extend_from_slice(&self.value);
        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&u32_to_bytes(crc));
        buf
    }

    pub fn decode(data: &[u8]) -> Result<Self, FsError> {
        if data.len() < META_SIZE {
            return Err(FsError::Decode(format!(
                "record too short: {} bytes",
                data.len()
            )));
        }
        let flags = data[0];
        let key = bytes_to_u64(&data[1..9])?;
        let value_len = bytes_to_u32(&data[9..HEADER_SIZE])? as usize;
        let value_end = HEADER_SIZE + value_len;
        if data.len() < value_end + U32_SIZE {
            return Err(FsError::Decode(format!(
                "record truncated: want {} bytes, got {}",
                value_end + U32_SIZE,
                data.len()
            )));
        }
        let value = data[HEADER_SIZE..value_end].to_vec();
        let stored = bytes_to_u32(&data[value_end..value_end + U32_SIZE])?;
        let computed = crc32fast::hash(&data[..value_end]);
        if stored != computed {
            return Err(FsError::Decode(format!(
                "CRC check failed {computed} != {stored}"
            )));
        }
        Ok(Self { flags, key, value })
    }
}
