//! Chain-level behavior: maturity, determinism, snapshots and events

mod common;

use abc_consensus::crypto::merkle_root;
use abc_consensus::mining::{create_block, solve_block};
use abc_consensus::serialization::{serialize_block, txid};
use abc_consensus::transaction::{encode_bip34_height, is_spendable_at};
use abc_consensus::*;
use common::*;
use proptest::prelude::*;
use secp256k1::{PublicKey, Secp256k1, SecretKey};

// ============================================================================
// COINBASE MATURITY
// ============================================================================

#[test]
fn test_maturity_boundary_on_a_live_chain() {
    let consensus = engine(NodeConfig::regtest());
    mine_blocks(&consensus, 101, &[0x51]);
    let outpoint = coinbase_outpoint(&consensus, 1);

    assert!(!consensus.is_mature(&outpoint, 100));
    assert!(consensus.is_mature(&outpoint, 101));
    assert!(!consensus.is_mature(&coinbase_outpoint(&consensus, 2), 101));
}

/// Mine `tx` on the tip without asking the mempool first
fn submit_with(consensus: &Consensus, tx: Transaction) -> Option<String> {
    let time = consensus.tip().time as i64 + 60;
    let mut block = create_block(consensus.chain(), vec![], vec![0x51], time).unwrap();
    block.transactions.push(tx);
    let txids: Vec<Hash> = block.transactions.iter().map(txid).collect();
    block.header.merkle_root = merkle_root(&txids);
    solve_block(&mut block.header, consensus.params()).unwrap();
    consensus.submit_block(&serialize_block(&block))
}

/// Rejected at `depth - 1` through both the mempool and a block, then
/// accepted and mined one block later
fn assert_spendable_from(consensus: &Consensus, tx: &Transaction, depth: i64) {
    let expected = format!(
        "bad-txns-premature-spend-of-coinbase, tried to spend coinbase at depth {}",
        depth - 1
    );
    let height = consensus.tip().height;

    let err = consensus.accept_transaction(tx).unwrap_err();
    assert_eq!(err, TxRejection::PrematureCoinbaseSpend { depth: depth - 1 });
    assert_eq!(err.to_string(), expected);
    assert_eq!(submit_with(consensus, tx.clone()), Some(expected));
    assert_eq!(consensus.tip().height, height);

    mine_blocks(consensus, 1, &[0x51]);
    consensus.accept_transaction(tx).unwrap();
    let mined = mine_blocks(consensus, 1, &[0x51]);
    let block = consensus.chain().block(&mined[0].hash).unwrap();
    assert_eq!(block.transactions.len(), 2);
    assert_eq!(txid(&block.transactions[1]), txid(tx));
    assert_eq!(consensus.mempool_size(), 0);
}

#[test]
fn test_maturity_across_the_digishield_upgrade() {
    let consensus = engine(NodeConfig::regtest());
    assert_eq!(consensus.params().digishield_height, 1450);

    // A coinbase from before the upgrade keeps the 100-block maturity once
    // the chain is past it
    mine_blocks(&consensus, 1498, &[0x51]);
    let early = spend(coinbase_outpoint(&consensus, 1400), vec![], 9_000_000);
    assert_spendable_from(&consensus, &early, 100);
    assert_eq!(consensus.tip().height, 1500);

    // One created at the upgrade height needs 240
    mine_blocks(&consensus, 188, &[0x51]);
    let late = spend(coinbase_outpoint(&consensus, 1450), vec![], 9_000_000);
    assert_spendable_from(&consensus, &late, 240);
    assert_eq!(consensus.tip().height, 1690);
}

proptest! {
    #[test]
    fn prop_regtest_maturity_boundary(coin_height in 0u32..3000, depth in 0u32..400) {
        let params = ChainParams::regtest();
        let required = if coin_height >= params.digishield_height { 240 } else { 100 };
        let coin = Coin {
            value: COIN,
            script_pubkey: vec![0x51],
            height: coin_height,
            is_coinbase: true,
        };
        prop_assert_eq!(
            is_spendable_at(&params, &coin, coin_height + depth),
            depth >= required
        );

        let plain = Coin { is_coinbase: false, ..coin };
        prop_assert!(is_spendable_at(&params, &plain, coin_height));
    }
}

// ============================================================================
// DETERMINISM
// ============================================================================

#[test]
fn test_two_chains_with_the_same_clock_agree() {
    let a = engine(NodeConfig::regtest());
    let b = engine(NodeConfig::regtest());
    let mined_a = mine_blocks(&a, 100, &[0x51]);
    let mined_b = mine_blocks(&b, 100, &[0x51]);

    assert_eq!(mined_a, mined_b);
    assert_eq!(a.tip(), b.tip());
    assert_eq!(a.tip().height, 100);

    let dir = tempfile::tempdir().unwrap();
    let snap_a = a.dump_snapshot(&dir.path().join("a.dat"), "latest").unwrap();
    let snap_b = b.dump_snapshot(&dir.path().join("b.dat"), "latest").unwrap();
    assert_eq!(snap_a.txoutset_hash, snap_b.txoutset_hash);
    assert_eq!(snap_a.coins_written, 100);
    assert_eq!(snap_a.nchaintx, 101);
}

/// Clock of the fixed regtest chain checkpointed by the assumeutxo data
const DETERMINISTIC_MOCKTIME: u32 = 1_598_887_952;

/// Coinbase of the fixed chain: BIP34 height and `/EB1.0/` in the
/// script_sig, the whole subsidy paid to `<pubkey> OP_CHECKSIG`
fn deterministic_coinbase(height: Height, pubkey: &[u8]) -> Transaction {
    let mut script_sig = encode_bip34_height(height);
    script_sig.extend(push(b"/EB1.0/"));
    let mut script_pubkey = push(pubkey);
    script_pubkey.push(0xac);
    Transaction {
        version: 2,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![TransactionOutput {
            value: (50 * COIN) >> (height / 150),
            script_pubkey,
        }],
        lock_time: 0,
    }
}

/// Extend the fixed chain by `count` coinbase-only blocks, one second apart
fn mine_deterministic(consensus: &Consensus, count: u32, pubkey: &[u8]) {
    for _ in 0..count {
        let tip = consensus.tip();
        let height = tip.height + 1;
        let coinbase = deterministic_coinbase(height, pubkey);
        let mut block = Block {
            header: BlockHeader {
                version: 0x0062_0004,
                prev_block_hash: tip.hash,
                merkle_root: merkle_root(&[txid(&coinbase)]),
                timestamp: DETERMINISTIC_MOCKTIME + height - 1,
                bits: 0x207f_ffff,
                nonce: 0,
            },
            auxpow: None,
            transactions: vec![coinbase],
        };
        solve_block(&mut block.header, consensus.params()).unwrap();
        assert_eq!(consensus.submit_block(&serialize_block(&block)), None);
    }
}

#[test]
fn test_deterministic_chain_checkpoints() {
    let mut key = [0u8; 32];
    key[31] = 1;
    let secret = SecretKey::from_slice(&key).unwrap();
    let pubkey = PublicKey::from_secret_key(&Secp256k1::new(), &secret).serialize();
    let consensus = engine(NodeConfig::regtest());

    mine_deterministic(&consensus, 100, &pubkey);
    assert_eq!(
        hash_to_hex(&consensus.tip().hash),
        "70d4a03faae27910b308632943adf66e9ba5ca4e0b287a71a1e2fcc77031544d"
    );

    mine_deterministic(&consensus, 10, &pubkey);
    assert_eq!(consensus.tip().height, 110);
    assert_eq!(
        hash_to_hex(&consensus.tip().hash),
        "d5a3182b833dca6d0c9bad770890080c2639f077e0e880c5ab16f1ba3a27b740"
    );

    let dir = tempfile::tempdir().unwrap();
    let info = consensus
        .dump_snapshot(&dir.path().join("utxo-110.dat"), "latest")
        .unwrap();
    assert_eq!(info.base_height, 110);
    assert_eq!(info.coins_written, 110);
    assert_eq!(
        hash_to_hex(&info.txoutset_hash),
        "d3858189516e1fc5cb5f65d5a967d47565dba120983c368b5a77e74cc96cd0bb"
    );
}

// ============================================================================
// SNAPSHOTS
// ============================================================================

#[test]
fn test_rollback_snapshot_matches_chain_at_that_height() {
    let long = engine(NodeConfig::regtest());
    let short = engine(NodeConfig::regtest());
    mine_blocks(&long, 115, &[0x51]);
    mine_blocks(&short, 110, &[0x51]);

    let dir = tempfile::tempdir().unwrap();
    let rollback = long
        .dump_snapshot(&dir.path().join("rollback.dat"), "rollback")
        .unwrap();
    let latest = short
        .dump_snapshot(&dir.path().join("latest.dat"), "latest")
        .unwrap();

    assert_eq!(rollback.base_height, 110);
    assert_eq!(rollback.base_hash, short.tip().hash);
    assert_eq!(rollback.txoutset_hash, latest.txoutset_hash);
    assert_eq!(rollback.coins_written, latest.coins_written);
    assert_eq!(rollback.nchaintx, latest.nchaintx);

    // Rolling back for the dump leaves the live chain alone
    assert_eq!(long.tip().height, 115);

    let loaded = snapshot::load_snapshot(&rollback.path, long.params()).unwrap();
    loaded.verify(&latest.txoutset_hash).unwrap();
    short.chain().with_utxos(|utxos, _| assert_eq!(&loaded.coins, utxos));
}

#[test]
fn test_snapshot_argument_errors() {
    let consensus = engine(NodeConfig::regtest());
    mine_blocks(&consensus, 1, &[0x51]);
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("utxo.dat");

    let err = consensus.dump_snapshot(&path, "everything").unwrap_err();
    assert_eq!(
        err.to_string(),
        "Invalid snapshot type \"everything\" specified. Please specify \"rollback\" or \"latest\""
    );
    assert!(matches!(
        consensus.dump_snapshot(&path, "rollback"),
        Err(SnapshotError::NoRollbackTarget(1))
    ));

    consensus.dump_snapshot(&path, "latest").unwrap();
    assert!(matches!(
        consensus.dump_snapshot(&path, "latest"),
        Err(SnapshotError::PathExists(_))
    ));
}

// ============================================================================
// EVENTS
// ============================================================================

#[test]
fn test_event_stream_through_invalidation() {
    let consensus = engine(NodeConfig::regtest());
    let events = consensus.subscribe();
    let mined = mine_blocks(&consensus, 3, &[0x51]);

    consensus.invalidate_block(&mined[1].hash).unwrap();
    assert_eq!(consensus.tip().height, 1);

    let seen: Vec<(&'static str, Height)> = events
        .try_iter()
        .map(|e| (e.kind(), e.block().height))
        .collect();
    assert_eq!(
        seen,
        vec![
            ("CONNECTED", 1),
            ("CONNECTED", 2),
            ("CONNECTED", 3),
            ("DISCONNECTED", 3),
            ("INVALIDATED", 2),
        ]
    );

    let finalized = consensus.finalize_block(&mined[0].hash).unwrap();
    assert_eq!(finalized.height, 1);
    match events.try_recv().unwrap() {
        ChainEvent::Finalized(info) => assert_eq!(info, mined[0]),
        other => panic!("unexpected event {:?}", other),
    }
}

#[test]
fn test_invalidated_chain_can_be_rebuilt() {
    let consensus = engine(NodeConfig::regtest());
    let mined = mine_blocks(&consensus, 2, &[0x51]);
    let old_tip = mined[1].hash;

    consensus.invalidate_block(&old_tip).unwrap();
    assert!(consensus.chain().is_invalid(&old_tip));

    // A different payout gives a different block at the same height
    let replacement = mine_blocks(&consensus, 1, &[0x52]);
    assert_eq!(replacement[0].height, 2);
    assert_ne!(replacement[0].hash, old_tip);
    assert_eq!(consensus.tip().hash, replacement[0].hash);
}
