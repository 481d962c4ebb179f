//! Wire format serialization/deserialization
//!
//! Little-endian integers and CompactSize length prefixes, matching the
//! node's network and disk encoding byte for byte.

pub mod block;
pub mod transaction;
pub mod varint;

pub use block::{
    block_hash, deserialize_auxpow, deserialize_block, deserialize_block_header,
    deserialize_header_with_auxpow, pow_hash, serialize_auxpow, serialize_block,
    serialize_block_header, serialize_header_with_auxpow,
};
pub use transaction::{deserialize_transaction, serialize_transaction, transaction_size, txid};
pub use varint::{decode_varint, encode_varint};

use crate::error::SerializationError;
use crate::types::Hash;

/// Largest length prefix accepted for any vector
pub const MAX_VECTOR_SIZE: u64 = 0x0200_0000;

/// Cursor over a byte slice that fails cleanly on short input
pub struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Reader { data, pos: 0 }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn read_bytes(&mut self, n: usize) -> Result<&'a [u8], SerializationError> {
        if self.remaining() < n {
            return Err(SerializationError::UnexpectedEof {
                needed: n,
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    pub fn read_u8(&mut self) -> Result<u8, SerializationError> {
        Ok(self.read_bytes(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16, SerializationError> {
        let b = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, SerializationError> {
        let b = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&mut self) -> Result<i32, SerializationError> {
        Ok(self.read_u32()? as i32)
    }

    pub fn read_u64(&mut self) -> Result<u64, SerializationError> {
        let b = self.read_bytes(8)?;
        let mut buf = [0u8; 8];
        buf.copy_from_slice(b);
        Ok(u64::from_le_bytes(buf))
    }

    pub fn read_i64(&mut self) -> Result<i64, SerializationError> {
        Ok(self.read_u64()? as i64)
    }

    pub fn read_hash(&mut self) -> Result<Hash, SerializationError> {
        let mut hash = [0u8; 32];
        hash.copy_from_slice(self.read_bytes(32)?);
        Ok(hash)
    }

    pub fn read_varint(&mut self) -> Result<u64, SerializationError> {
        let (value, used) = decode_varint(&self.data[self.pos..])?;
        self.pos += used;
        Ok(value)
    }

    /// Length prefix bounded by [`MAX_VECTOR_SIZE`]
    pub fn read_length(&mut self) -> Result<usize, SerializationError> {
        let len = self.read_varint()?;
        if len > MAX_VECTOR_SIZE {
            return Err(SerializationError::OversizedVector(len));
        }
        Ok(len as usize)
    }

    pub fn read_var_bytes(&mut self) -> Result<Vec<u8>, SerializationError> {
        let len = self.read_length()?;
        Ok(self.read_bytes(len)?.to_vec())
    }

    pub fn read_hash_vec(&mut self) -> Result<Vec<Hash>, SerializationError> {
        let len = self.read_length()?;
        let mut out = Vec::with_capacity(len.min(1024));
        for _ in 0..len {
            out.push(self.read_hash()?);
        }
        Ok(out)
    }

    /// Fail if anything is left over
    pub fn finish(&self) -> Result<(), SerializationError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(SerializationError::TrailingBytes(n)),
        }
    }
}

pub fn write_var_bytes(out: &mut Vec<u8>, bytes: &[u8]) {
    out.extend_from_slice(&encode_varint(bytes.len() as u64));
    out.extend_from_slice(bytes);
}

pub fn write_hash_vec(out: &mut Vec<u8>, hashes: &[Hash]) {
    out.extend_from_slice(&encode_varint(hashes.len() as u64));
    for h in hashes {
        out.extend_from_slice(h);
    }
}
