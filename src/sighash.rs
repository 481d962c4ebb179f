//! Signature hashing
//!
//! Two digests: the original one (SIGHASH_SINGLE bug included), and the
//! replay-protected FORKID digest that commits to the spent amount.

use crate::crypto::sha256d;
use crate::flags::{ScriptFlags, SCRIPT_ENABLE_SIGHASH_FORKID};
use crate::opcodes::OP_CODESEPARATOR;
use crate::script::ScriptIter;
use crate::serialization::{encode_varint, write_var_bytes};
use crate::types::{Amount, Hash, Transaction, TransactionOutput};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

/// Fork value mixed into the upper bits of FORKID hash types
pub const FORK_VALUE: u32 = 0;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SigHashType(pub u32);

impl SigHashType {
    /// Hash type byte appended to a signature
    pub fn from_signature(sig: &[u8]) -> Option<Self> {
        sig.last().map(|b| SigHashType(*b as u32))
    }

    pub fn base_type(self) -> u32 {
        self.0 & 0x1f
    }

    pub fn has_forkid(self) -> bool {
        (self.0 & SIGHASH_FORKID) != 0
    }

    pub fn has_anyone_can_pay(self) -> bool {
        (self.0 & SIGHASH_ANYONECANPAY) != 0
    }

    /// ALL, NONE or SINGLE once FORKID and ANYONECANPAY are masked off
    pub fn is_defined(self) -> bool {
        let base = self.0 & !(SIGHASH_FORKID | SIGHASH_ANYONECANPAY);
        (SIGHASH_ALL..=SIGHASH_SINGLE).contains(&base)
    }
}

/// Per-transaction midstate of the FORKID digest, shared by all inputs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PrecomputedSighash {
    pub hash_prevouts: Hash,
    pub hash_sequence: Hash,
    pub hash_outputs: Hash,
}

impl PrecomputedSighash {
    pub fn new(tx: &Transaction) -> Self {
        let mut prevouts = Vec::with_capacity(tx.inputs.len() * 36);
        let mut sequences = Vec::with_capacity(tx.inputs.len() * 4);
        for input in &tx.inputs {
            prevouts.extend_from_slice(&input.prevout.hash);
            prevouts.extend_from_slice(&input.prevout.index.to_le_bytes());
            sequences.extend_from_slice(&input.sequence.to_le_bytes());
        }
        let mut outputs = Vec::new();
        for output in &tx.outputs {
            write_output(&mut outputs, output);
        }
        PrecomputedSighash {
            hash_prevouts: sha256d(&prevouts),
            hash_sequence: sha256d(&sequences),
            hash_outputs: sha256d(&outputs),
        }
    }
}

fn write_output(out: &mut Vec<u8>, output: &TransactionOutput) {
    out.extend_from_slice(&output.value.to_le_bytes());
    write_var_bytes(out, &output.script_pubkey);
}

/// SignatureHash: 𝒯𝒳 × ℕ × 𝕊 × ℤ × ℕ → ℍ
///
/// The FORKID digest is used only when the hash type carries the FORKID
/// bit and the flags enable it; everything else takes the original digest
/// over the full hash type.
pub fn signature_hash(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: SigHashType,
    amount: Amount,
    flags: ScriptFlags,
    cache: Option<&PrecomputedSighash>,
) -> Hash {
    if hash_type.has_forkid() && (flags & SCRIPT_ENABLE_SIGHASH_FORKID) != 0 {
        let owned;
        let cache = match cache {
            Some(c) => c,
            None => {
                owned = PrecomputedSighash::new(tx);
                &owned
            }
        };
        forkid_signature_hash(script_code, tx, input_index, hash_type, amount, cache)
    } else {
        legacy_signature_hash(script_code, tx, input_index, hash_type)
    }
}

/// Original digest. Out-of-range SIGHASH_SINGLE signs the constant 1.
pub fn legacy_signature_hash(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: SigHashType,
) -> Hash {
    let mut one = [0u8; 32];
    one[0] = 1;
    if input_index >= tx.inputs.len() {
        return one;
    }
    let hash_single = hash_type.base_type() == SIGHASH_SINGLE;
    let hash_none = hash_type.base_type() == SIGHASH_NONE;
    if hash_single && input_index >= tx.outputs.len() {
        return one;
    }
    let anyone_can_pay = hash_type.has_anyone_can_pay();
    let script_code = strip_code_separators(script_code);

    let mut out = Vec::with_capacity(256);
    out.extend_from_slice(&tx.version.to_le_bytes());

    let signing: Vec<usize> = if anyone_can_pay {
        vec![input_index]
    } else {
        (0..tx.inputs.len()).collect()
    };
    out.extend_from_slice(&encode_varint(signing.len() as u64));
    for idx in signing {
        let input = &tx.inputs[idx];
        out.extend_from_slice(&input.prevout.hash);
        out.extend_from_slice(&input.prevout.index.to_le_bytes());
        if idx == input_index {
            write_var_bytes(&mut out, &script_code);
        } else {
            out.push(0);
        }
        if idx != input_index && (hash_single || hash_none) {
            out.extend_from_slice(&0u32.to_le_bytes());
        } else {
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
    }

    let output_count = if hash_none {
        0
    } else if hash_single {
        input_index + 1
    } else {
        tx.outputs.len()
    };
    out.extend_from_slice(&encode_varint(output_count as u64));
    for idx in 0..output_count {
        if hash_single && idx != input_index {
            out.extend_from_slice(&(-1i64).to_le_bytes());
            out.push(0);
        } else {
            write_output(&mut out, &tx.outputs[idx]);
        }
    }

    out.extend_from_slice(&tx.lock_time.to_le_bytes());
    out.extend_from_slice(&hash_type.0.to_le_bytes());
    sha256d(&out)
}

/// Replay-protected digest committing to the spent amount
pub fn forkid_signature_hash(
    script_code: &[u8],
    tx: &Transaction,
    input_index: usize,
    hash_type: SigHashType,
    amount: Amount,
    cache: &PrecomputedSighash,
) -> Hash {
    let zero = [0u8; 32];
    let base = hash_type.base_type();
    let anyone_can_pay = hash_type.has_anyone_can_pay();

    let hash_prevouts = if anyone_can_pay {
        zero
    } else {
        cache.hash_prevouts
    };
    let hash_sequence = if !anyone_can_pay && base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        cache.hash_sequence
    } else {
        zero
    };
    let hash_outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        cache.hash_outputs
    } else if base == SIGHASH_SINGLE && input_index < tx.outputs.len() {
        let mut single = Vec::new();
        write_output(&mut single, &tx.outputs[input_index]);
        sha256d(&single)
    } else {
        zero
    };

    let mut out = Vec::with_capacity(160 + script_code.len());
    out.extend_from_slice(&tx.version.to_le_bytes());
    out.extend_from_slice(&hash_prevouts);
    out.extend_from_slice(&hash_sequence);
    if let Some(input) = tx.inputs.get(input_index) {
        out.extend_from_slice(&input.prevout.hash);
        out.extend_from_slice(&input.prevout.index.to_le_bytes());
        write_var_bytes(&mut out, script_code);
        out.extend_from_slice(&amount.to_le_bytes());
        out.extend_from_slice(&input.sequence.to_le_bytes());
    }
    out.extend_from_slice(&hash_outputs);
    out.extend_from_slice(&tx.lock_time.to_le_bytes());
    let full_type = (hash_type.0 & 0xff) | (FORK_VALUE << 8);
    out.extend_from_slice(&full_type.to_le_bytes());
    sha256d(&out)
}

/// Script code with every OP_CODESEPARATOR removed
fn strip_code_separators(script: &[u8]) -> Vec<u8> {
    if !script.contains(&OP_CODESEPARATOR) {
        return script.to_vec();
    }
    let mut out = Vec::with_capacity(script.len());
    let mut last = 0;
    let mut iter = ScriptIter::new(script);
    while let Some((start, item)) = iter.next() {
        match item {
            Ok(instr) if instr.opcode == OP_CODESEPARATOR => {
                out.extend_from_slice(&script[last..start]);
                last = iter.position();
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    out.extend_from_slice(&script[last..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{OutPoint, TransactionInput};

    fn two_in_one_out() -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![
                TransactionInput {
                    prevout: OutPoint { hash: [1; 32], index: 0 },
                    script_sig: vec![],
                    sequence: 0xffffffff,
                },
                TransactionInput {
                    prevout: OutPoint { hash: [2; 32], index: 1 },
                    script_sig: vec![],
                    sequence: 0xfffffffe,
                },
            ],
            outputs: vec![TransactionOutput {
                value: 1000,
                script_pubkey: vec![0x51],
            }],
            lock_time: 0,
        }
    }

    #[test]
    fn test_hash_type_defined() {
        assert!(SigHashType(0x01).is_defined());
        assert!(SigHashType(0x41).is_defined());
        assert!(SigHashType(0xc3).is_defined());
        assert!(!SigHashType(0x00).is_defined());
        assert!(!SigHashType(0x04).is_defined());
        assert!(!SigHashType(0x21).is_defined());
    }

    #[test]
    fn test_single_bug_returns_one() {
        let tx = two_in_one_out();
        let h = legacy_signature_hash(&[0x51], &tx, 1, SigHashType(SIGHASH_SINGLE));
        let mut one = [0u8; 32];
        one[0] = 1;
        assert_eq!(h, one);
    }

    #[test]
    fn test_forkid_commits_to_amount() {
        let tx = two_in_one_out();
        let flags = SCRIPT_ENABLE_SIGHASH_FORKID;
        let t = SigHashType(SIGHASH_ALL | SIGHASH_FORKID);
        let a = signature_hash(&[0x51], &tx, 0, t, 100, flags, None);
        let b = signature_hash(&[0x51], &tx, 0, t, 101, flags, None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_forkid_bit_ignored_without_flag() {
        let tx = two_in_one_out();
        let t = SigHashType(SIGHASH_ALL | SIGHASH_FORKID);
        let a = signature_hash(&[0x51], &tx, 0, t, 100, 0, None);
        let b = signature_hash(&[0x51], &tx, 0, t, 999, 0, None);
        assert_eq!(a, b);
        assert_eq!(a, legacy_signature_hash(&[0x51], &tx, 0, t));
        assert_ne!(a, legacy_signature_hash(&[0x51], &tx, 0, SigHashType(SIGHASH_ALL)));
    }

    #[test]
    fn test_precomputed_matches_fresh() {
        let tx = two_in_one_out();
        let cache = PrecomputedSighash::new(&tx);
        let t = SigHashType(SIGHASH_ALL | SIGHASH_FORKID);
        let flags = SCRIPT_ENABLE_SIGHASH_FORKID;
        assert_eq!(
            signature_hash(&[0x51], &tx, 1, t, 5, flags, Some(&cache)),
            signature_hash(&[0x51], &tx, 1, t, 5, flags, None)
        );
    }

    #[test]
    fn test_code_separators_stripped() {
        assert_eq!(strip_code_separators(&[0x51, 0xab, 0x52]), vec![0x51, 0x52]);
        // 0xab inside a push is data
        assert_eq!(strip_code_separators(&[0x01, 0xab, 0xab]), vec![0x01, 0xab]);
    }
}
