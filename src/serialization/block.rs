//! Block header, AuxPoW and block wire format
//!
//! A block is the 80-byte header, the AuxPoW when the header's AuxPoW
//! version bit is set, then the transaction vector.

use super::transaction::{read_transaction, write_transaction};
use super::{write_hash_vec, Reader};
use crate::auxpow::version_has_auxpow;
use crate::crypto::{scrypt_pow_hash, sha256d};
use crate::error::{Result, SerializationError};
use crate::serialization::varint::encode_varint;
use crate::types::{AuxPow, Block, BlockHeader, Hash};

/// Serialized header length
pub const HEADER_SIZE: usize = 80;

pub fn serialize_block_header(header: &BlockHeader) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_SIZE);
    write_header(&mut out, header);
    out
}

fn write_header(out: &mut Vec<u8>, header: &BlockHeader) {
    out.extend_from_slice(&header.version.to_le_bytes());
    out.extend_from_slice(&header.prev_block_hash);
    out.extend_from_slice(&header.merkle_root);
    out.extend_from_slice(&header.timestamp.to_le_bytes());
    out.extend_from_slice(&header.bits.to_le_bytes());
    out.extend_from_slice(&header.nonce.to_le_bytes());
}

/// Deserialize exactly 80 bytes into a header
pub fn deserialize_block_header(data: &[u8]) -> std::result::Result<BlockHeader, SerializationError> {
    let mut reader = Reader::new(data);
    let header = read_header(&mut reader)?;
    reader.finish()?;
    Ok(header)
}

fn read_header(r: &mut Reader<'_>) -> std::result::Result<BlockHeader, SerializationError> {
    Ok(BlockHeader {
        version: r.read_i32()?,
        prev_block_hash: r.read_hash()?,
        merkle_root: r.read_hash()?,
        timestamp: r.read_u32()?,
        bits: r.read_u32()?,
        nonce: r.read_u32()?,
    })
}

pub fn serialize_auxpow(auxpow: &AuxPow) -> Vec<u8> {
    let mut out = Vec::new();
    write_auxpow(&mut out, auxpow);
    out
}

fn write_auxpow(out: &mut Vec<u8>, auxpow: &AuxPow) {
    write_transaction(out, &auxpow.coinbase_tx);
    out.extend_from_slice(&auxpow.parent_hash);
    write_hash_vec(out, &auxpow.merkle_branch);
    out.extend_from_slice(&auxpow.index.to_le_bytes());
    write_hash_vec(out, &auxpow.chain_merkle_branch);
    out.extend_from_slice(&auxpow.chain_index.to_le_bytes());
    write_header(out, &auxpow.parent_block);
}

pub fn deserialize_auxpow(data: &[u8]) -> std::result::Result<AuxPow, SerializationError> {
    let mut reader = Reader::new(data);
    let auxpow = read_auxpow(&mut reader)?;
    reader.finish()?;
    Ok(auxpow)
}

fn read_auxpow(r: &mut Reader<'_>) -> std::result::Result<AuxPow, SerializationError> {
    Ok(AuxPow {
        coinbase_tx: read_transaction(r)?,
        parent_hash: r.read_hash()?,
        merkle_branch: r.read_hash_vec()?,
        index: r.read_i32()?,
        chain_merkle_branch: r.read_hash_vec()?,
        chain_index: r.read_i32()?,
        parent_block: read_header(r)?,
    })
}

/// Header followed by its AuxPoW, as relayed in `headers` messages.
///
/// When the AuxPoW bit is set but the block carries none, an empty
/// proof is written so the result still decodes.
pub fn serialize_header_with_auxpow(header: &BlockHeader, auxpow: Option<&AuxPow>) -> Vec<u8> {
    let mut out = serialize_block_header(header);
    if version_has_auxpow(header.version) {
        match auxpow {
            Some(a) => write_auxpow(&mut out, a),
            None => write_auxpow(&mut out, &AuxPow::default()),
        }
    }
    out
}

pub fn deserialize_header_with_auxpow(
    data: &[u8],
) -> std::result::Result<(BlockHeader, Option<AuxPow>), SerializationError> {
    let mut reader = Reader::new(data);
    let header = read_header(&mut reader)?;
    let auxpow = if version_has_auxpow(header.version) {
        Some(read_auxpow(&mut reader)?)
    } else {
        None
    };
    reader.finish()?;
    Ok((header, auxpow))
}

pub fn serialize_block(block: &Block) -> Vec<u8> {
    let mut out = serialize_header_with_auxpow(&block.header, block.auxpow.as_ref());
    out.extend_from_slice(&encode_varint(block.transactions.len() as u64));
    for tx in &block.transactions {
        write_transaction(&mut out, tx);
    }
    out
}

pub fn deserialize_block(data: &[u8]) -> std::result::Result<Block, SerializationError> {
    let mut reader = Reader::new(data);
    let header = read_header(&mut reader)?;
    let auxpow = if version_has_auxpow(header.version) {
        Some(read_auxpow(&mut reader)?)
    } else {
        None
    };
    let count = reader.read_length()?;
    let mut transactions = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        transactions.push(read_transaction(&mut reader)?);
    }
    reader.finish()?;
    Ok(Block {
        header,
        auxpow,
        transactions,
    })
}

/// Block identity: SHA256d of the 80-byte header
pub fn block_hash(header: &BlockHeader) -> Hash {
    sha256d(&serialize_block_header(header))
}

/// Proof-of-work hash: scrypt of the 80-byte header
pub fn pow_hash(header: &BlockHeader) -> Result<Hash> {
    scrypt_pow_hash(&serialize_block_header(header))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Transaction, TransactionInput, TransactionOutput, OutPoint};

    fn coinbase() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint::null(),
                script_sig: vec![0x01, 0x01],
                sequence: 0xffffffff,
            }],
            outputs: vec![TransactionOutput {
                value: 50,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_header_is_80_bytes() {
        let header = BlockHeader {
            version: 0x00620004,
            prev_block_hash: [1; 32],
            merkle_root: [2; 32],
            timestamp: 3,
            bits: 0x207fffff,
            nonce: 5,
        };
        let bytes = serialize_block_header(&header);
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(deserialize_block_header(&bytes).unwrap(), header);
    }

    #[test]
    fn test_null_auxpow_header_layout() {
        // Version 0x100: AuxPoW bit only. Every other field zero.
        let mut data = vec![0u8; 80];
        data[1] = 1;
        // Null coinbase: version, no inputs, no outputs, lock time
        data.extend_from_slice(&[0, 0, 0, 0, 0, 0, 0, 0, 0, 0]);
        data.extend_from_slice(&[0u8; 32]);
        data.push(0);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.push(0);
        data.extend_from_slice(&[0, 0, 0, 0]);
        data.extend_from_slice(&[0u8; 80]);
        assert_eq!(data.len(), 80 + 10 + 32 + 1 + 4 + 1 + 4 + 80);

        let (header, auxpow) = deserialize_header_with_auxpow(&data).unwrap();
        assert_eq!(header.version, 0x100);
        let auxpow = auxpow.unwrap();
        assert!(auxpow.coinbase_tx.inputs.is_empty());
        assert!(auxpow.merkle_branch.is_empty());
        assert_eq!(auxpow.parent_block, BlockHeader::default());

        assert_eq!(serialize_header_with_auxpow(&header, Some(&auxpow)), data);
    }

    #[test]
    fn test_non_aux_header_has_no_proof() {
        let header = BlockHeader {
            version: 0x00620002,
            ..Default::default()
        };
        let bytes = serialize_header_with_auxpow(&header, None);
        assert_eq!(bytes.len(), 80);
        let (_, auxpow) = deserialize_header_with_auxpow(&bytes).unwrap();
        assert!(auxpow.is_none());
    }

    #[test]
    fn test_block_roundtrip_with_auxpow() {
        let block = Block {
            header: BlockHeader {
                version: 0x00620104,
                ..Default::default()
            },
            auxpow: Some(AuxPow {
                coinbase_tx: coinbase(),
                merkle_branch: vec![[9; 32]],
                ..Default::default()
            }),
            transactions: vec![coinbase()],
        };
        let bytes = serialize_block(&block);
        assert_eq!(deserialize_block(&bytes).unwrap(), block);
    }

    #[test]
    fn test_missing_auxpow_serializes_empty_proof() {
        let block = Block {
            header: BlockHeader {
                version: 0x00620104,
                ..Default::default()
            },
            auxpow: None,
            transactions: vec![coinbase()],
        };
        let decoded = deserialize_block(&serialize_block(&block)).unwrap();
        assert_eq!(decoded.auxpow, Some(AuxPow::default()));
    }
}
