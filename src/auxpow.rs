//! Merge-mining (AuxPoW) verification and header version layout
//!
//! A merge-mined header proves its work through a parent chain block. The
//! parent's coinbase commits to a chain merkle root, the root commits to
//! our block hash, and the parent header's scrypt hash must meet our
//! target.

use tracing::warn;

use crate::constants::*;
use crate::crypto::hash_pair;
use crate::error::{AuxPowError, ConsensusError, Result};
use crate::params::ChainParams;
use crate::pow::check_proof_of_work;
use crate::serialization::{block_hash, pow_hash, txid};
use crate::types::*;

/// Largest chain ID a version can carry
pub const MAX_ALLOWED_CHAIN_ID: u32 = 0xffff;

// ============================================================================
// VERSION LAYOUT
// ============================================================================

/// Whether the AuxPoW bit is set
pub fn version_has_auxpow(version: i32) -> bool {
    version & VERSION_AUXPOW_BIT != 0
}

/// Chain ID carried in the upper 16 bits
pub fn version_chain_id(version: i32) -> u32 {
    (version as u32) >> VERSION_CHAIN_ID_SHIFT
}

/// Base version in the low byte
pub fn version_low_bits(version: i32) -> i32 {
    version & 0xff
}

/// Pre-merge-mining versions that carry no chain ID
pub fn version_is_legacy(version: i32) -> bool {
    version == 1 || version == 2
}

/// MakeVersionWithChainId: ℕ × ℕ → ℤ ∪ {⊥}
///
/// Fails when the chain ID exceeds 16 bits or the low bits exceed a byte.
pub fn make_version_with_chain_id(chain_id: u32, low_bits: u32) -> Result<i32> {
    if chain_id > MAX_ALLOWED_CHAIN_ID {
        return Err(ConsensusError::ConsensusRuleViolation(format!(
            "chain ID {:#x} does not fit in a block version",
            chain_id
        )));
    }
    if low_bits > 0xff {
        return Err(ConsensusError::ConsensusRuleViolation(format!(
            "low version bits {:#x} overlap the AuxPoW flag",
            low_bits
        )));
    }
    Ok(((chain_id << VERSION_CHAIN_ID_SHIFT) | low_bits) as i32)
}

/// Set or clear the AuxPoW bit, leaving every other bit alone
pub fn version_with_auxpow(version: i32, has_auxpow: bool) -> i32 {
    if has_auxpow {
        version | VERSION_AUXPOW_BIT
    } else {
        version & !VERSION_AUXPOW_BIT
    }
}

// ============================================================================
// MERKLE COMMITMENTS
// ============================================================================

/// ExpectedChainIndex: ℕ × ℕ × ℕ → ℕ
///
/// Slot our chain must occupy in a chain merkle tree of height h:
/// 1. r = nonce · 1103515245 + 12345
/// 2. r = (r + chain_id) · 1103515245 + 12345
/// 3. return r mod 2^h
///
/// All arithmetic wraps at 32 bits.
pub fn expected_chain_index(nonce: u32, chain_id: u32, merkle_height: u32) -> u32 {
    let mut rand = nonce;
    rand = rand.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    rand = rand.wrapping_add(chain_id);
    rand = rand.wrapping_mul(1_103_515_245).wrapping_add(12_345);
    if merkle_height >= 32 {
        return rand;
    }
    rand % (1u32 << merkle_height)
}

/// Fold `hash` up a merkle branch. The bits of `index` say on which side
/// each branch hash sits. An index of -1 yields the zero hash.
pub fn merkle_root_for_branch(hash: &Hash, branch: &[Hash], index: i32) -> Hash {
    if index == -1 {
        return [0u8; 32];
    }
    let mut current = *hash;
    let mut index = index;
    for sibling in branch {
        current = if index & 1 != 0 {
            hash_pair(sibling, &current)
        } else {
            hash_pair(&current, sibling)
        };
        index >>= 1;
    }
    current
}

/// Tree size and nonce committed after the chain root in a parent coinbase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergeMineCommitment {
    pub tree_size: u32,
    pub nonce: u32,
}

/// Locate the chain merkle root in a parent coinbase script.
///
/// `chain_root` is in internal byte order. The script carries it
/// byte-reversed. One scan records the first root match and the first
/// two prefix matches, then the outcome is decided in this order:
///
/// | root | prefixes | placement                      | result |
/// |------|----------|--------------------------------|--------|
/// | none | any      |                                | missing root |
/// | yes  | ≥ 2      |                                | multiple prefixes |
/// | yes  | 1        | prefix end != root start       | prefix misplaced |
/// | yes  | 0        | root starts after byte 20      | root too late |
/// | yes  | ok       | < 8 bytes follow the root      | missing size and nonce |
pub fn parse_merge_mine_coinbase(
    script_sig: &[u8],
    chain_root: &Hash,
) -> std::result::Result<MergeMineCommitment, AuxPowError> {
    let mut root_be = *chain_root;
    root_be.reverse();

    let mut root_pos = None;
    let mut prefixes = [None; 2];
    for pos in 0..script_sig.len() {
        let rest = &script_sig[pos..];
        if root_pos.is_none() && rest.starts_with(&root_be) {
            root_pos = Some(pos);
        }
        if rest.starts_with(&MERGE_MINE_PREFIX) {
            if prefixes[0].is_none() {
                prefixes[0] = Some(pos);
            } else if prefixes[1].is_none() {
                prefixes[1] = Some(pos);
            }
        }
    }

    let root_pos = root_pos.ok_or(AuxPowError::MissingChainMerkleRoot)?;
    match prefixes {
        [Some(_), Some(_)] => return Err(AuxPowError::MultipleMergeMinePrefixes),
        [Some(prefix), None] => {
            if prefix + MERGE_MINE_PREFIX.len() != root_pos {
                return Err(AuxPowError::MergeMinePrefixMisplaced);
            }
        }
        _ => {
            if root_pos > MAX_CHAIN_MERKLE_ROOT_OFFSET {
                return Err(AuxPowError::ChainMerkleRootTooLate);
            }
        }
    }

    let tail = &script_sig[root_pos + 32..];
    if tail.len() < 8 {
        return Err(AuxPowError::MissingTreeSizeAndNonce);
    }
    Ok(MergeMineCommitment {
        tree_size: u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]),
        nonce: u32::from_le_bytes([tail[4], tail[5], tail[6], tail[7]]),
    })
}

// ============================================================================
// PROOF CHECKS
// ============================================================================

/// CheckAuxPow: 𝒜 × ℍ × ℕ → {valid, ⊥}
///
/// Verify that `auxpow` commits to `block_hash` for chain `chain_id`.
/// Checks run in this order and stop at the first failure:
/// 1. auxpow.index = 0
/// 2. strict chain ID ⟹ parent chain ID ≠ chain_id
/// 3. |chain branch| ≤ 30
/// 4. coinbase branch folds to the parent merkle root
/// 5. coinbase has an input
/// 6. parent coinbase script carries the chain root (see
///    [`parse_merge_mine_coinbase`])
/// 7. committed tree size = 2^|chain branch|
/// 8. chain_index = expected_chain_index(nonce, chain_id, |chain branch|)
///
/// The parent header's proof of work is checked by [`check_header_pow`].
pub fn check_auxpow(
    auxpow: &AuxPow,
    block_hash: &Hash,
    chain_id: u32,
    params: &ChainParams,
) -> std::result::Result<(), AuxPowError> {
    if auxpow.index != 0 {
        return Err(AuxPowError::NonZeroIndex);
    }

    if params.strict_chain_id && version_chain_id(auxpow.parent_block.version) == chain_id {
        return Err(AuxPowError::ParentHasOurChainId);
    }

    if auxpow.chain_merkle_branch.len() > MAX_CHAIN_MERKLE_BRANCH_LENGTH {
        return Err(AuxPowError::ChainMerkleBranchTooLong);
    }

    let chain_root = merkle_root_for_branch(
        block_hash,
        &auxpow.chain_merkle_branch,
        auxpow.chain_index,
    );

    let coinbase_hash = txid(&auxpow.coinbase_tx);
    if merkle_root_for_branch(&coinbase_hash, &auxpow.merkle_branch, auxpow.index)
        != auxpow.parent_block.merkle_root
    {
        return Err(AuxPowError::MerkleRootIncorrect);
    }

    let script_sig = match auxpow.coinbase_tx.inputs.first() {
        Some(input) => &input.script_sig,
        None => return Err(AuxPowError::CoinbaseMissingInput),
    };

    let commitment = parse_merge_mine_coinbase(script_sig, &chain_root)?;

    let merkle_height = auxpow.chain_merkle_branch.len() as u32;
    if commitment.tree_size != 1u32 << merkle_height {
        return Err(AuxPowError::MerkleBranchSizeMismatch);
    }

    if auxpow.chain_index as u32 != expected_chain_index(commitment.nonce, chain_id, merkle_height)
    {
        return Err(AuxPowError::WrongChainIndex);
    }

    Ok(())
}

/// CheckHeaderPow: ℋ × 𝒜? → {valid, ⊥}
///
/// 1. strict chain ID ∧ ¬legacy(version) ⟹ chain ID = ours
/// 2. no AuxPoW: AuxPoW bit clear and scrypt(header) ≤ target(bits)
/// 3. AuxPoW: bit set, [`check_auxpow`] against our block hash, and
///    scrypt(parent header) ≤ target(bits)
pub fn check_header_pow(
    header: &BlockHeader,
    auxpow: Option<&AuxPow>,
    params: &ChainParams,
) -> std::result::Result<(), AuxPowError> {
    let result = check_header_pow_inner(header, auxpow, params);
    if let Err(e) = &result {
        warn!("{}", e);
    }
    result
}

fn check_header_pow_inner(
    header: &BlockHeader,
    auxpow: Option<&AuxPow>,
    params: &ChainParams,
) -> std::result::Result<(), AuxPowError> {
    let chain_id = version_chain_id(header.version);
    if params.strict_chain_id
        && !version_is_legacy(header.version)
        && chain_id != params.auxpow_chain_id
    {
        return Err(AuxPowError::WrongChainId {
            got: chain_id,
            expected: params.auxpow_chain_id,
            version: header.version,
        });
    }

    match auxpow {
        None => {
            if version_has_auxpow(header.version) {
                return Err(AuxPowError::MissingAuxPow);
            }
            let hash = pow_hash(header).map_err(|_| AuxPowError::NonAuxProofOfWork)?;
            if !check_proof_of_work(&hash, header.bits, params) {
                return Err(AuxPowError::NonAuxProofOfWork);
            }
        }
        Some(auxpow) => {
            if !version_has_auxpow(header.version) {
                return Err(AuxPowError::UnexpectedAuxPow);
            }
            check_auxpow(auxpow, &block_hash(header), chain_id, params)?;
            let parent_hash =
                pow_hash(&auxpow.parent_block).map_err(|_| AuxPowError::ParentProofOfWork)?;
            if !check_proof_of_work(&parent_hash, header.bits, params) {
                return Err(AuxPowError::ParentProofOfWork);
            }
        }
    }
    Ok(())
}

/// Wrap `header` in a minimal AuxPoW: a parent coinbase committing to the
/// header's hash with an empty chain branch, in a single-transaction
/// parent block. The parent header still has to be solved.
pub fn build_auxpow(header: &BlockHeader, parent_version: i32) -> AuxPow {
    let mut root_be = block_hash(header);
    root_be.reverse();

    let mut script_sig = MERGE_MINE_PREFIX.to_vec();
    script_sig.extend_from_slice(&root_be);
    script_sig.extend_from_slice(&1u32.to_le_bytes());
    script_sig.extend_from_slice(&0u32.to_le_bytes());

    let coinbase_tx = Transaction {
        version: 1,
        inputs: vec![TransactionInput {
            prevout: OutPoint::null(),
            script_sig,
            sequence: SEQUENCE_FINAL,
        }],
        outputs: vec![],
        lock_time: 0,
    };

    let parent_block = BlockHeader {
        version: parent_version,
        merkle_root: txid(&coinbase_tx),
        bits: header.bits,
        ..Default::default()
    };

    AuxPow {
        coinbase_tx,
        parent_hash: [0u8; 32],
        merkle_branch: vec![],
        index: 0,
        chain_merkle_branch: vec![],
        chain_index: 0,
        parent_block,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serialization::deserialize_header_with_auxpow;
    use proptest::prelude::*;

    // Mainnet block 700000, merge-mined at chain index 56
    const HEADER_700000: &str = concat!(
        "020162000c1194ac4c5d3826887eb8d97dc4ae02a25af30d5b504720febe4e047627217ec9",
        "224c3a9a91e4018801d1da0b981e0445b3812413e32ef891e3d7772a5ef17ea43e4e5566d7",
        "051b0000000001000000010000000000000000000000000000000000000000000000000000",
        "000000000000ffffffff57034bdd0be4b883e5bda9e7a59ee4bb99e9b1bcfabe6d6d1f0e6e",
        "c774ba83111dfe17e85be8e292092395050340aee13909bb5169f949114000000000000000",
        "031f881c0000000f4d696e65642062792061327468726565ffffffff0100f2052a01000000",
        "1976a914aa3750aa18b8a0f3f0590731e1fab934856680cf88ac0000000010ba25eadde6eb",
        "39add569420d1fcb08df83df645f7f148a2d230500000000000346f64bde86fb0444949f57",
        "4b2752ec82bafd7aa3599365e810638f87b2032e8d4124586ac0c16abc93a866107624236c",
        "a8ec933991e0f1db424e1f5cac260e412515793c469236b0f308345ef47b28ae0c45d4f953",
        "02a0e3ba84a970cf8252630000000006eb27cdf762126701d420dae67f9e0117751b098bc7",
        "9f207d505edb385ec73ae46c4127661ba7d68c453b449868e6135a6ac0d9351a3e40d7dd58",
        "767531de67ee31284c19194806e9c00943e05a9d1a79e17fa0c9b79bef9027ad2ca0bdf99e",
        "abfe2d8f99be8b35640357d1af6ec9884840d0a9d91dbac1a8334df680016151ffc154ad6a",
        "9b6e61c74b83dedd12a907e63a9c425fa1b199388196cb078c44d0c3a9a43398b7a93b294a",
        "6c16b6e352b15a50cd7ce001de6d0cc82cb3e6c179f908380000000200000016e121811e18",
        "8728f2aa586df32525412d76f9777cb7395ba20b5c40b3210711365ad72ba0e3d75af58431",
        "d47bb16febd0366b775faf384128e7740a99edd898c73e4e558ab0011b19215530",
    );

    // Mainnet block 800000, chain index 40
    const HEADER_800000: &str = concat!(
        "020162001bcb8498f1f6e084b81754f04ebefe123dac7f908bda324b7a4d3aa10c4d889139",
        "c8fcf6f95419dfd3d16fd1256db0b9f0ffa653a3b275067e3560cd72622990bd19ae553ab4",
        "061b0000000001000000010000000000000000000000000000000000000000000000000000",
        "000000000000ffffffff640337810ce4b883e5bda9e7a59ee4bb99e9b1bcfabe6d6d5c10b6",
        "060a131b10b9b2bbc56580f8d134d7328244350cc4b445037a51e15b0840000000f09f909f",
        "00000000000000000000000000000000000000000000000000000000000000000000000000",
        "0000001101f0ac0a2a010000001976a914aa3750aa18b8a0f3f0590731e1fab934856680cf",
        "88ac2f08c93853c72fd016e289473fea98933fd2484885cd036aad1891138b990100000000",
        "000340bf1ca21e44fec1f0c4d51f1913bfec389dc42a4e50abeb90dc6a7b71a20693603bd3",
        "b9048e8d0b5a34b67b7142314233914975936c989850b44fb36a3623aadfbbcb57b6d3e00f",
        "9e0b38153c403775974f5cba60e179a4d19f82992e2bfa6900000000065d01f4d3c900798b",
        "5a0a9955c4a710bd18b5a8efe95275d52ed9dd383c7040f6463ceed131958d98aee29089d1",
        "cf38b9728b224512e51ca3a8b1189d5ed03d0709b68fd6e328528f2a29ec7fb077c834fbf0",
        "f14c371fafcfb27444017fbf5b26fdb884bed8ad6a4bded36fc89ed8b05a6c6c0ae1cfd5fe",
        "37eb3021b32a1e29042b7a2e142329e7d0d0bffcb5cc338621a576b49d4d32991000b8d4ac",
        "793bc1f522c5c55826f53583f4924086f9a6f3ef3adca07aafd832d3ed883b7fcad80e8d28",
        "00000003000000340b110b4bb8169d370bb5a37a64d0eeb7f01952d92f50115d866b688406",
        "b6204ff1897acd7d56c25b954db1379243723414ae007be32ec19685cbc848b0987bbe19ae",
        "550a7f011bdd117b68",
    );

    fn parse(hex_header: &str) -> (BlockHeader, AuxPow) {
        let bytes = hex::decode(hex_header).unwrap();
        let (header, auxpow) = deserialize_header_with_auxpow(&bytes).unwrap();
        (header, auxpow.unwrap())
    }

    fn test_root() -> Hash {
        let mut root = [0u8; 32];
        for (i, b) in root.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        root
    }

    fn root_be(root: &Hash) -> Vec<u8> {
        let mut be = root.to_vec();
        be.reverse();
        be
    }

    /// Parent coinbase whose script is exactly `script_sig`
    fn coinbase_with_script(script_sig: Vec<u8>) -> Transaction {
        Transaction {
            version: 1,
            inputs: vec![TransactionInput {
                prevout: OutPoint {
                    hash: [0u8; 32],
                    index: 0,
                },
                script_sig,
                sequence: 0,
            }],
            outputs: vec![],
            lock_time: 0,
        }
    }

    /// A well-formed proof for `child` with a zeroed chain branch of
    /// height `height` at `chain_index`, committing `tree_size` and `nonce`
    fn auxpow_for(child: &Hash, height: usize, chain_index: i32, tree_size: u32, nonce: u32) -> AuxPow {
        let chain_branch = vec![[0u8; 32]; height];
        let root = merkle_root_for_branch(child, &chain_branch, chain_index);
        let mut script = MERGE_MINE_PREFIX.to_vec();
        script.extend(root_be(&root));
        script.extend_from_slice(&tree_size.to_le_bytes());
        script.extend_from_slice(&nonce.to_le_bytes());
        let coinbase_tx = coinbase_with_script(script);
        let merkle_branch = vec![[0u8; 32]; 5];
        let parent_root = merkle_root_for_branch(&txid(&coinbase_tx), &merkle_branch, 0);
        AuxPow {
            coinbase_tx,
            merkle_branch,
            chain_merkle_branch: chain_branch,
            chain_index,
            parent_block: BlockHeader {
                merkle_root: parent_root,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn all_params() -> Vec<ChainParams> {
        vec![ChainParams::main(), ChainParams::test(), ChainParams::regtest()]
    }

    // ============================================================================
    // VERSION LAYOUT
    // ============================================================================

    #[test]
    fn test_make_version_with_chain_id() {
        assert_eq!(make_version_with_chain_id(0, 0).unwrap(), 0);
        assert_eq!(make_version_with_chain_id(1, 0).unwrap(), 0x10000);
        assert_eq!(make_version_with_chain_id(AUXPOW_CHAIN_ID, 0).unwrap(), 0x620000);
        assert_eq!(make_version_with_chain_id(AUXPOW_CHAIN_ID, 0xab).unwrap(), 0x6200ab);
        assert_eq!(
            make_version_with_chain_id(MAX_ALLOWED_CHAIN_ID, 0).unwrap() as u32,
            0xffff0000
        );
        assert!(make_version_with_chain_id(MAX_ALLOWED_CHAIN_ID + 1, 0).is_err());
        assert!(make_version_with_chain_id(0x10000, 0x100).is_err());
        assert!(make_version_with_chain_id(0, 0x100).is_err());
    }

    #[test]
    fn test_version_with_auxpow() {
        assert_eq!(version_with_auxpow(0, false), 0);
        assert_eq!(version_with_auxpow(0x1ab, false), 0xab);
        assert_eq!(version_with_auxpow(0x620100, false), 0x620000);
        assert_eq!(version_with_auxpow(0xab, true), 0x1ab);
        assert_eq!(version_with_auxpow(0x6200ab, true), 0x6201ab);
        assert_eq!(version_with_auxpow(0xffff01ab_u32 as i32, true), 0xffff01ab_u32 as i32);
    }

    #[test]
    fn test_version_fields() {
        assert_eq!(version_low_bits(0x100), 0);
        assert_eq!(version_low_bits(0x6201ab), 0xab);
        assert_eq!(version_low_bits(0xffff01ab_u32 as i32), 0xab);
        assert_eq!(version_chain_id(0xab), 0);
        assert_eq!(version_chain_id(0x6201ab), AUXPOW_CHAIN_ID);
        assert_eq!(version_chain_id(0xffff0100_u32 as i32), 0xffff);
        assert!(!version_has_auxpow(0x6200ab));
        assert!(version_has_auxpow(0x100));
        assert!(version_has_auxpow(0xffff01ab_u32 as i32));
    }

    #[test]
    fn test_legacy_versions() {
        assert!(!version_is_legacy(0));
        assert!(version_is_legacy(1));
        assert!(version_is_legacy(2));
        assert!(!version_is_legacy(3));
        assert!(!version_is_legacy(0x100));
        assert!(!version_is_legacy(0x6200ab));
    }

    // ============================================================================
    // EXPECTED INDEX AND BRANCHES
    // ============================================================================

    #[test]
    fn test_expected_chain_index_mainnet_blocks() {
        assert_eq!(expected_chain_index(0, AUXPOW_CHAIN_ID, 5), 24);
        assert_eq!(expected_chain_index(0x77654e2f, AUXPOW_CHAIN_ID, 6), 63);
        assert_eq!(expected_chain_index(0x9f909ff0, AUXPOW_CHAIN_ID, 6), 40);
        assert_eq!(expected_chain_index(0, AUXPOW_CHAIN_ID, 11), 1080);
    }

    #[test]
    fn test_expected_chain_index_empty_tree() {
        for nonce in [0u32, 1, 0xdeadbeef, u32::MAX] {
            assert_eq!(expected_chain_index(nonce, AUXPOW_CHAIN_ID, 0), 0);
        }
    }

    proptest! {
        #[test]
        fn prop_chain_index_within_tree(nonce: u32, chain_id in 0u32..0x10000, height in 0u32..=30) {
            prop_assert!(expected_chain_index(nonce, chain_id, height) < (1u32 << height));
        }
    }

    #[test]
    fn test_merkle_root_for_branch() {
        let leaf = [7u8; 32];
        let sibling = [9u8; 32];
        assert_eq!(merkle_root_for_branch(&leaf, &[], 0), leaf);
        assert_eq!(merkle_root_for_branch(&leaf, &[sibling], 0), hash_pair(&leaf, &sibling));
        assert_eq!(merkle_root_for_branch(&leaf, &[sibling], 1), hash_pair(&sibling, &leaf));
        assert_eq!(merkle_root_for_branch(&leaf, &[sibling], -1), [0u8; 32]);
    }

    // ============================================================================
    // COINBASE PARSING
    // ============================================================================

    #[test]
    fn test_parse_missing_root() {
        assert_eq!(
            parse_merge_mine_coinbase(&[], &test_root()),
            Err(AuxPowError::MissingChainMerkleRoot)
        );
        // Internal byte order is not a match
        assert_eq!(
            parse_merge_mine_coinbase(&test_root(), &test_root()),
            Err(AuxPowError::MissingChainMerkleRoot)
        );
    }

    #[test]
    fn test_parse_multiple_prefixes() {
        let root = test_root();
        for count in [2, 3, 5, 10] {
            let mut script = root_be(&root);
            for _ in 0..count {
                script.push(4);
                script.extend_from_slice(&MERGE_MINE_PREFIX);
            }
            assert_eq!(
                parse_merge_mine_coinbase(&script, &root),
                Err(AuxPowError::MultipleMergeMinePrefixes)
            );
        }
    }

    #[test]
    fn test_parse_prefix_must_precede_root() {
        let root = test_root();
        let mut script = root_be(&root);
        script.extend_from_slice(&MERGE_MINE_PREFIX);
        assert_eq!(
            parse_merge_mine_coinbase(&script, &root),
            Err(AuxPowError::MergeMinePrefixMisplaced)
        );

        for pad in 1..100 {
            let mut script = MERGE_MINE_PREFIX.to_vec();
            script.extend(vec![0u8; pad]);
            script.extend(root_be(&root));
            assert_eq!(
                parse_merge_mine_coinbase(&script, &root),
                Err(AuxPowError::MergeMinePrefixMisplaced)
            );
        }
    }

    #[test]
    fn test_parse_root_offset_without_prefix() {
        let root = test_root();
        for pad in 0..=100 {
            let mut script = vec![0u8; pad];
            script.extend(root_be(&root));
            let expected = if pad <= MAX_CHAIN_MERKLE_ROOT_OFFSET {
                AuxPowError::MissingTreeSizeAndNonce
            } else {
                AuxPowError::ChainMerkleRootTooLate
            };
            assert_eq!(parse_merge_mine_coinbase(&script, &root), Err(expected));
        }
    }

    #[test]
    fn test_parse_short_tail() {
        let root = test_root();
        let mut script = MERGE_MINE_PREFIX.to_vec();
        script.extend(root_be(&root));
        script.extend([0u8; 7]);
        assert_eq!(
            parse_merge_mine_coinbase(&script, &root),
            Err(AuxPowError::MissingTreeSizeAndNonce)
        );
    }

    #[test]
    fn test_parse_success() {
        let root = test_root();
        let tail = [1u8, 2, 3, 4, 5, 6, 7, 8, 0xff, 0xff, 0xff];
        for pad in 0..=100 {
            let mut with_prefix = vec![0u8; pad];
            with_prefix.extend_from_slice(&MERGE_MINE_PREFIX);
            with_prefix.extend(root_be(&root));
            with_prefix.extend_from_slice(&tail);
            let parsed = parse_merge_mine_coinbase(&with_prefix, &root).unwrap();
            assert_eq!(parsed.tree_size, 0x04030201);
            assert_eq!(parsed.nonce, 0x08070605);

            let mut without_prefix = vec![0u8; pad];
            without_prefix.extend(root_be(&root));
            without_prefix.extend_from_slice(&tail);
            let parsed = parse_merge_mine_coinbase(&without_prefix, &root);
            if pad <= MAX_CHAIN_MERKLE_ROOT_OFFSET {
                assert_eq!(
                    parsed,
                    Ok(MergeMineCommitment {
                        tree_size: 0x04030201,
                        nonce: 0x08070605
                    })
                );
            } else {
                assert_eq!(parsed, Err(AuxPowError::ChainMerkleRootTooLate));
            }
        }
    }

    // ============================================================================
    // CHECK ORDER
    // ============================================================================

    #[test]
    fn test_nonzero_index_always_rejected() {
        for index in [1, 2, 100, -1, i32::MAX] {
            let auxpow = AuxPow {
                index,
                ..Default::default()
            };
            for params in all_params() {
                assert_eq!(
                    check_auxpow(&auxpow, &[0u8; 32], 0, &params),
                    Err(AuxPowError::NonZeroIndex)
                );
            }
        }
    }

    #[test]
    fn test_chain_branch_too_long() {
        for len in 31..40 {
            let auxpow = AuxPow {
                chain_merkle_branch: vec![[0u8; 32]; len],
                ..Default::default()
            };
            for params in all_params() {
                assert_eq!(
                    check_auxpow(&auxpow, &[0u8; 32], 1, &params),
                    Err(AuxPowError::ChainMerkleBranchTooLong)
                );
            }
        }
    }

    #[test]
    fn test_parent_with_our_chain_id() {
        for chain_id in [0u32, 1, 2, 0xffff, AUXPOW_CHAIN_ID] {
            let auxpow = AuxPow {
                chain_merkle_branch: vec![[0u8; 32]; 31],
                parent_block: BlockHeader {
                    version: make_version_with_chain_id(chain_id, 0).unwrap(),
                    ..Default::default()
                },
                ..Default::default()
            };
            let hash = [0u8; 32];
            assert_eq!(
                check_auxpow(&auxpow, &hash, chain_id, &ChainParams::main()),
                Err(AuxPowError::ParentHasOurChainId)
            );
            assert_eq!(
                check_auxpow(&auxpow, &hash, chain_id, &ChainParams::regtest()),
                Err(AuxPowError::ParentHasOurChainId)
            );
            // Not enforced on testnet
            assert_eq!(
                check_auxpow(&auxpow, &hash, chain_id, &ChainParams::test()),
                Err(AuxPowError::ChainMerkleBranchTooLong)
            );
        }
    }

    #[test]
    fn test_merkle_root_incorrect() {
        let auxpow = AuxPow {
            merkle_branch: vec![[0u8; 32]; 3],
            parent_block: BlockHeader {
                merkle_root: [0xab; 32],
                ..Default::default()
            },
            ..Default::default()
        };
        for params in all_params() {
            assert_eq!(
                check_auxpow(&auxpow, &[0u8; 32], 1, &params),
                Err(AuxPowError::MerkleRootIncorrect)
            );
        }
    }

    #[test]
    fn test_coinbase_missing_input() {
        let mut auxpow = AuxPow {
            merkle_branch: vec![[0u8; 32]; 7],
            ..Default::default()
        };
        auxpow.parent_block.merkle_root =
            merkle_root_for_branch(&txid(&auxpow.coinbase_tx), &auxpow.merkle_branch, 0);
        for params in all_params() {
            assert_eq!(
                check_auxpow(&auxpow, &[0u8; 32], 1, &params),
                Err(AuxPowError::CoinbaseMissingInput)
            );
        }
    }

    #[test]
    fn test_tree_size_mismatch() {
        let child = test_root();
        for chain_index in 0..128 {
            let auxpow = auxpow_for(&child, 7, chain_index, 0x04030201, 0x08070605);
            for params in all_params() {
                assert_eq!(
                    check_auxpow(&auxpow, &child, 1, &params),
                    Err(AuxPowError::MerkleBranchSizeMismatch)
                );
            }
        }
    }

    #[test]
    fn test_exactly_one_chain_index_accepted() {
        let child = test_root();
        let expected = expected_chain_index(0x08070605, AUXPOW_CHAIN_ID, 7);
        assert_eq!(expected, 69);
        for chain_index in 0..128 {
            let auxpow = auxpow_for(&child, 7, chain_index, 1 << 7, 0x08070605);
            for params in all_params() {
                let result = check_auxpow(&auxpow, &child, AUXPOW_CHAIN_ID, &params);
                if chain_index as u32 == expected {
                    assert_eq!(result, Ok(()));
                } else {
                    assert_eq!(result, Err(AuxPowError::WrongChainIndex));
                }
            }
        }
    }

    #[test]
    fn test_declared_index_mismatch_hits_root_search() {
        // Commit the root for index 1 but declare index 0
        let child = test_root();
        let mut auxpow = auxpow_for(&child, 1, 1, 2, 0);
        auxpow.chain_index = 0;
        assert_eq!(
            check_auxpow(&auxpow, &child, AUXPOW_CHAIN_ID, &ChainParams::regtest()),
            Err(AuxPowError::MissingChainMerkleRoot)
        );
    }

    // ============================================================================
    // MAINNET HEADERS
    // ============================================================================

    #[test]
    fn test_mainnet_block_700000() {
        let (header, auxpow) = parse(HEADER_700000);
        let hash = block_hash(&header);
        assert_eq!(
            hash_to_hex(&hash),
            "eac853ae22d59a498386241a3de69a36739ccc9e0a6acfd617b64c5ea4a0f4b3"
        );
        let root = merkle_root_for_branch(&hash, &auxpow.chain_merkle_branch, auxpow.chain_index);
        let parsed = parse_merge_mine_coinbase(&auxpow.coinbase_tx.inputs[0].script_sig, &root).unwrap();
        assert_eq!(parsed.tree_size, 64);
        assert_eq!(parsed.nonce, 0);
        assert_eq!(
            expected_chain_index(parsed.nonce, version_chain_id(header.version), 6),
            56
        );
        assert_eq!(
            check_auxpow(&auxpow, &hash, version_chain_id(header.version), &ChainParams::main()),
            Ok(())
        );
    }

    #[test]
    fn test_mainnet_block_800000() {
        let (header, auxpow) = parse(HEADER_800000);
        let hash = block_hash(&header);
        assert_eq!(
            hash_to_hex(&hash),
            "773fbb34e1bfe82467eb24cda8769dfdcd13a5b4dac4c8f9f6534c40301f7fbf"
        );
        let root = merkle_root_for_branch(&hash, &auxpow.chain_merkle_branch, auxpow.chain_index);
        let parsed = parse_merge_mine_coinbase(&auxpow.coinbase_tx.inputs[0].script_sig, &root).unwrap();
        assert_eq!(parsed.tree_size, 64);
        assert_eq!(parsed.nonce, 2677055472);
        assert_eq!(auxpow.chain_index, 40);
        assert_eq!(
            check_auxpow(&auxpow, &hash, AUXPOW_CHAIN_ID, &ChainParams::main()),
            Ok(())
        );
    }

    // ============================================================================
    // HEADER PROOF OF WORK
    // ============================================================================

    fn solve(header: &mut BlockHeader, params: &ChainParams) {
        while !check_proof_of_work(&pow_hash(header).unwrap(), header.bits, params) {
            header.nonce += 1;
        }
    }

    #[test]
    fn test_header_versions_under_strict_chain_id() {
        let params = ChainParams::regtest();
        let mut header = BlockHeader {
            bits: 0x207fffff,
            ..Default::default()
        };
        for (version, ok) in [(0, false), (1, true), (2, true), (3, false)] {
            header.version = version;
            solve(&mut header, &params);
            assert_eq!(check_header_pow(&header, None, &params).is_ok(), ok, "{}", version);
        }
        for low in [0, 1, 4, 0xff, 0x1000, 0xffff] {
            header.version = version_with_auxpow(0x620000 | low, false);
            solve(&mut header, &params);
            assert!(check_header_pow(&header, None, &params).is_ok());
        }
    }

    #[test]
    fn test_wrong_chain_id_message() {
        let params = ChainParams::regtest();
        let header = BlockHeader {
            version: 0x00630004,
            bits: 0x207fffff,
            ..Default::default()
        };
        let err = check_header_pow(&header, None, &params).unwrap_err();
        assert_eq!(
            err.to_string(),
            "block does not have our chain ID (got 63, expected 62, full nVersion 630004)"
        );
    }

    #[test]
    fn test_auxpow_bit_without_proof() {
        let params = ChainParams::regtest();
        let header = BlockHeader {
            version: 0x00620104,
            bits: 0x207fffff,
            ..Default::default()
        };
        assert_eq!(
            check_header_pow(&header, None, &params),
            Err(AuxPowError::MissingAuxPow)
        );
        let plain = BlockHeader {
            version: 0x00620004,
            ..header
        };
        let auxpow = build_auxpow(&plain, 0x00000004);
        assert_eq!(
            check_header_pow(&plain, Some(&auxpow), &params),
            Err(AuxPowError::UnexpectedAuxPow)
        );
    }

    #[test]
    fn test_built_auxpow_passes_once_parent_is_solved() {
        let params = ChainParams::regtest();
        let header = BlockHeader {
            version: 0x00620104,
            prev_block_hash: params.genesis_hash(),
            bits: 0x207fffff,
            timestamp: 1_700_000_000,
            ..Default::default()
        };
        let mut auxpow = build_auxpow(&header, 0x00000004);
        assert_eq!(check_auxpow(&auxpow, &block_hash(&header), AUXPOW_CHAIN_ID, &params), Ok(()));

        // Parent nonce that misses the target
        auxpow.parent_block.nonce = 0;
        while check_proof_of_work(&pow_hash(&auxpow.parent_block).unwrap(), header.bits, &params) {
            auxpow.parent_block.nonce += 1;
        }
        assert_eq!(
            check_header_pow(&header, Some(&auxpow), &params),
            Err(AuxPowError::ParentProofOfWork)
        );

        solve(&mut auxpow.parent_block, &params);
        assert_eq!(check_header_pow(&header, Some(&auxpow), &params), Ok(()));
    }
}
