//! Transaction wire format

use super::{write_var_bytes, Reader};
use crate::crypto::sha256d;
use crate::error::SerializationError;
use crate::serialization::varint::encode_varint;
use crate::types::{Hash, OutPoint, Transaction, TransactionInput, TransactionOutput};

/// Serialize a transaction: version, inputs, outputs, lock time
pub fn serialize_transaction(tx: &Transaction) -> Vec<u8> {
    let mut out = Vec::with_capacity(10 + tx.inputs.len() * 41 + tx.outputs.len() * 9);
    write_transaction(&mut out, tx);
    out
}

pub(crate) fn write_transaction(out: &mut Vec<u8>, tx: &Transaction) {
    out.extend_from_slice(&tx.version.to_le_bytes());

    out.extend_from_slice(&encode_varint(tx.inputs.len() as u64));
    for input in &tx.inputs {
        out.extend_from_slice(&input.prevout.hash);
        out.extend_from_slice(&input.prevout.index.to_le_bytes());
        write_var_bytes(out, &input.script_sig);
        out.extend_from_slice(&input.sequence.to_le_bytes());
    }

    out.extend_from_slice(&encode_varint(tx.outputs.len() as u64));
    for output in &tx.outputs {
        out.extend_from_slice(&output.value.to_le_bytes());
        write_var_bytes(out, &output.script_pubkey);
    }

    out.extend_from_slice(&tx.lock_time.to_le_bytes());
}

/// Deserialize exactly one transaction from `data`
pub fn deserialize_transaction(data: &[u8]) -> Result<Transaction, SerializationError> {
    let mut reader = Reader::new(data);
    let tx = read_transaction(&mut reader)?;
    reader.finish()?;
    Ok(tx)
}

pub(crate) fn read_transaction(r: &mut Reader<'_>) -> Result<Transaction, SerializationError> {
    let version = r.read_i32()?;

    let input_count = r.read_length()?;
    let mut inputs = Vec::with_capacity(input_count.min(1024));
    for _ in 0..input_count {
        let hash = r.read_hash()?;
        let index = r.read_u32()?;
        let script_sig = r.read_var_bytes()?;
        let sequence = r.read_u32()?;
        inputs.push(TransactionInput {
            prevout: OutPoint { hash, index },
            script_sig,
            sequence,
        });
    }

    let output_count = r.read_length()?;
    let mut outputs = Vec::with_capacity(output_count.min(1024));
    for _ in 0..output_count {
        let value = r.read_i64()?;
        let script_pubkey = r.read_var_bytes()?;
        outputs.push(TransactionOutput {
            value,
            script_pubkey,
        });
    }

    let lock_time = r.read_u32()?;

    Ok(Transaction {
        version,
        inputs,
        outputs,
        lock_time,
    })
}

/// Transaction id: SHA256d of the serialization (internal byte order)
pub fn txid(tx: &Transaction) -> Hash {
    sha256d(&serialize_transaction(tx))
}

pub fn transaction_size(tx: &Transaction) -> usize {
    serialize_transaction(tx).len()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_tx() -> Transaction {
        Transaction {
            version: 2,
            inputs: vec![TransactionInput {
                prevout: OutPoint {
                    hash: [0xab; 32],
                    index: 3,
                },
                script_sig: vec![0x51],
                sequence: 0xfffffffe,
            }],
            outputs: vec![TransactionOutput {
                value: 5000,
                script_pubkey: vec![0x76, 0xa9],
            }],
            lock_time: 17,
        }
    }

    #[test]
    fn test_serialize_layout() {
        let bytes = serialize_transaction(&sample_tx());
        // 4 version + 1 count + 36 outpoint + 2 script + 4 seq + 1 count + 8 value + 3 script + 4 locktime
        assert_eq!(bytes.len(), 63);
        assert_eq!(&bytes[0..4], &[2, 0, 0, 0]);
        assert_eq!(&bytes[59..63], &[17, 0, 0, 0]);
    }

    #[test]
    fn test_deserialize_matches_serialize() {
        let tx = sample_tx();
        let decoded = deserialize_transaction(&serialize_transaction(&tx)).unwrap();
        assert_eq!(decoded, tx);
        assert_eq!(txid(&decoded), txid(&tx));
    }

    #[test]
    fn test_deserialize_rejects_trailing_bytes() {
        let mut bytes = serialize_transaction(&sample_tx());
        bytes.push(0);
        assert_eq!(
            deserialize_transaction(&bytes),
            Err(SerializationError::TrailingBytes(1))
        );
    }

    #[test]
    fn test_deserialize_truncated() {
        let bytes = serialize_transaction(&sample_tx());
        assert!(deserialize_transaction(&bytes[..bytes.len() - 1]).is_err());
    }
}
