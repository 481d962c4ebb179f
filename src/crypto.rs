//! Hash primitives used by consensus

use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use ripemd::Ripemd160;
use scrypt::Params as ScryptParams;
use sha1::Sha1;
use sha2::{Digest, Sha256};

use crate::error::{ConsensusError, Result};
use crate::types::Hash;

/// SHA256(x)
pub fn sha256(data: &[u8]) -> Hash {
    let digest = Sha256::digest(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

/// SHA256(SHA256(x))
pub fn sha256d(data: &[u8]) -> Hash {
    sha256d::Hash::hash(data).into_inner()
}

/// SHA256(SHA256(a || b)), the merkle tree node hash
pub fn hash_pair(left: &Hash, right: &Hash) -> Hash {
    let mut engine = sha256d::Hash::engine();
    engine.input(left);
    engine.input(right);
    sha256d::Hash::from_engine(engine).into_inner()
}

/// RIPEMD160(SHA256(x))
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let digest = Ripemd160::digest(Sha256::digest(data));
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

pub fn ripemd160(data: &[u8]) -> [u8; 20] {
    let digest = Ripemd160::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

pub fn sha1(data: &[u8]) -> [u8; 20] {
    let digest = Sha1::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Scrypt(N=1024, r=1, p=1) over a serialized 80-byte header, salted with itself.
///
/// This is the proof-of-work hash of both our headers and AuxPoW parents.
pub fn scrypt_pow_hash(header: &[u8]) -> Result<Hash> {
    let params = ScryptParams::new(10, 1, 1, 32)
        .map_err(|e| ConsensusError::InvalidProofOfWork(format!("scrypt params: {}", e)))?;
    let mut out = [0u8; 32];
    scrypt::scrypt(header, header, &params, &mut out)
        .map_err(|e| ConsensusError::InvalidProofOfWork(format!("scrypt output: {}", e)))?;
    Ok(out)
}

/// Merkle root of the given leaves, duplicating the last node on odd levels.
///
/// Returns the root and whether two identical siblings were hashed
/// together anywhere in the tree (the CVE-2012-2459 mutation).
pub fn merkle_root_with_mutation(leaves: &[Hash]) -> (Hash, bool) {
    if leaves.is_empty() {
        return ([0u8; 32], false);
    }
    let mut level = leaves.to_vec();
    let mut mutated = false;
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let left = &pair[0];
            let right = pair.get(1).unwrap_or(left);
            if pair.len() == 2 && left == right {
                mutated = true;
            }
            next.push(hash_pair(left, right));
        }
        level = next;
    }
    (level[0], mutated)
}

pub fn merkle_root(leaves: &[Hash]) -> Hash {
    merkle_root_with_mutation(leaves).0
}
