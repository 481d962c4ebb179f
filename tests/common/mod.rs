//! Helpers shared by the integration tests

#![allow(dead_code)]

use abc_consensus::serialization::txid;
use abc_consensus::*;
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

pub fn engine(config: NodeConfig) -> Consensus {
    Consensus::new(config).unwrap()
}

/// Mine `count` blocks one minute apart, each paying `payout`
pub fn mine_blocks(consensus: &Consensus, count: u32, payout: &[u8]) -> Vec<BlockInfo> {
    (0..count)
        .map(|_| {
            let time = consensus.tip().time as i64 + 60;
            consensus.generate_block(payout.to_vec(), time).unwrap()
        })
        .collect()
}

pub fn block_at(consensus: &Consensus, height: Height) -> Block {
    let hash = consensus.chain().block_hash_at(height).unwrap();
    consensus.chain().block(&hash).unwrap()
}

pub fn coinbase_outpoint(consensus: &Consensus, height: Height) -> OutPoint {
    OutPoint {
        hash: txid(&block_at(consensus, height).transactions[0]),
        index: 0,
    }
}

/// One-input spend paying OP_TRUE, padded past the minimum size
pub fn spend(prevout: OutPoint, script_sig: Vec<u8>, value: Amount) -> Transaction {
    Transaction {
        version: 2,
        inputs: vec![TransactionInput {
            prevout,
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![
            TransactionOutput {
                value,
                script_pubkey: vec![0x51],
            },
            TransactionOutput {
                value: 0,
                script_pubkey: [vec![0x6a, 0x40], vec![0xab; 64]].concat(),
            },
        ],
        lock_time: 0,
    }
}

/// Direct push of up to 75 bytes
pub fn push(data: &[u8]) -> Vec<u8> {
    assert!(data.len() <= 75);
    let mut out = vec![data.len() as u8];
    out.extend_from_slice(data);
    out
}

fn secret(seed: u8) -> SecretKey {
    let mut bytes = [0x22u8; 32];
    bytes[31] = seed;
    SecretKey::from_slice(&bytes).unwrap()
}

pub fn pubkey(seed: u8) -> Vec<u8> {
    PublicKey::from_secret_key(&Secp256k1::new(), &secret(seed))
        .serialize()
        .to_vec()
}

/// P2PK: <pubkey> OP_CHECKSIG
pub fn p2pk(seed: u8) -> Vec<u8> {
    let mut script = push(&pubkey(seed));
    script.push(0xac);
    script
}

/// DER ECDSA signature over `digest` with the hash type byte appended
pub fn sign(seed: u8, digest: &Hash, hash_type: u8) -> Vec<u8> {
    let message = Message::from_digest_slice(digest).unwrap();
    let mut sig = Secp256k1::new()
        .sign_ecdsa(&message, &secret(seed))
        .serialize_der()
        .to_vec();
    sig.push(hash_type);
    sig
}
