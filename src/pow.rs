//! Proof of work: compact targets, difficulty retargeting and chain work
//!
//! Targets are 256-bit unsigned integers. Headers carry them in the
//! 32-bit "compact" floating encoding.

use primitive_types::U256;

use crate::error::{ConsensusError, Result};
use crate::params::ChainParams;
use crate::types::*;

/// The fields of a header the difficulty rules look at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderInfo {
    pub height: Height,
    pub time: i64,
    pub bits: u32,
}

/// Difficulty parameters in force after a block at some height
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DaaParams {
    pub allow_min_difficulty: bool,
    pub digishield: bool,
    pub target_timespan: i64,
    pub min_timespan: i64,
    pub max_timespan: i64,
}

/// Retarget rules after the block at `height`.
///
/// Digishield clamps each step to [¾T, 1½T]. Before it, the lower clamp
/// widens for the early chain: T/16 up to height 5000, T/8 up to 10000,
/// then T/4. The upper clamp is always 4T.
pub fn daa_params_at(params: &ChainParams, height: Height) -> DaaParams {
    let digishield = params.digishield_active(height);
    let target_timespan = params.target_timespan(height);
    let (min_timespan, max_timespan) = if digishield {
        (
            target_timespan - target_timespan / 4,
            target_timespan + target_timespan / 2,
        )
    } else if height > 10_000 {
        (target_timespan / 4, target_timespan * 4)
    } else if height > 5_000 {
        (target_timespan / 8, target_timespan * 4)
    } else {
        (target_timespan / 16, target_timespan * 4)
    };
    DaaParams {
        allow_min_difficulty: params.allow_min_difficulty_at(height),
        digishield,
        target_timespan,
        min_timespan,
        max_timespan,
    }
}

// ============================================================================
// COMPACT ENCODING
// ============================================================================

/// Decoded compact target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompactTarget {
    pub target: U256,
    pub negative: bool,
    pub overflow: bool,
}

/// SetCompact: ℕ₃₂ → U256 × 𝔹 × 𝔹
///
/// bits = size (8 bits) ‖ sign (1 bit) ‖ mantissa (23 bits), and
/// target = mantissa · 256^(size − 3).
pub fn compact_to_target(bits: u32) -> CompactTarget {
    let size = bits >> 24;
    let mut word = bits & 0x007f_ffff;

    let negative = word != 0 && (bits & 0x0080_0000) != 0;
    let overflow = word != 0
        && (size > 34 || (word > 0xff && size > 33) || (word > 0xffff && size > 32));
    if overflow {
        return CompactTarget {
            target: U256::zero(),
            negative,
            overflow,
        };
    }

    let target = if size <= 3 {
        word >>= 8 * (3 - size);
        U256::from(word)
    } else {
        U256::from(word) << (8 * (size - 3) as usize)
    };
    CompactTarget {
        target,
        negative,
        overflow,
    }
}

/// GetCompact: U256 → ℕ₃₂
pub fn target_to_compact(target: U256) -> u32 {
    let mut size = (target.bits() + 7) / 8;
    let mantissa = if size <= 3 {
        target.low_u64() << (8 * (3 - size))
    } else {
        (target >> (8 * (size - 3))).low_u64()
    };
    let mut compact = mantissa as u32;

    // Keep the sign bit clear by moving a byte into the exponent
    if compact & 0x0080_0000 != 0 {
        compact >>= 8;
        size += 1;
    }
    compact | ((size as u32) << 24)
}

/// Target encoded by `bits`, if it is positive, in range and no easier
/// than the network's limit
pub fn derive_target(bits: u32, pow_limit: U256) -> Option<U256> {
    let decoded = compact_to_target(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() || decoded.target > pow_limit
    {
        return None;
    }
    Some(decoded.target)
}

/// CheckProofOfWork: ℍ × ℕ₃₂ → {true, false}
///
/// The hash, read as a little-endian integer, must not exceed the target.
pub fn check_proof_of_work(hash: &Hash, bits: u32, params: &ChainParams) -> bool {
    match derive_target(bits, params.pow_limit) {
        Some(target) => U256::from_little_endian(hash) <= target,
        None => false,
    }
}

/// Expected number of hashes to meet `bits`: 2²⁵⁶ / (target + 1)
pub fn block_proof(bits: u32) -> U256 {
    let decoded = compact_to_target(bits);
    if decoded.negative || decoded.overflow || decoded.target.is_zero() {
        return U256::zero();
    }
    // 2^256 / (t + 1) = (~t / (t + 1)) + 1
    (!decoded.target / (decoded.target + U256::one())) + U256::one()
}

// ============================================================================
// RETARGETING
// ============================================================================

/// Min-difficulty rule: a block more than two spacings after its parent
/// may use the easiest target
fn allow_min_difficulty_for_block(
    prev: &HeaderInfo,
    new_block_time: i64,
    params: &ChainParams,
    daa: &DaaParams,
) -> bool {
    daa.allow_min_difficulty && new_block_time > prev.time + params.target_spacing * 2
}

fn ancestor<'a>(chain: &'a [HeaderInfo], height: Height) -> Result<&'a HeaderInfo> {
    let base = chain.first().map(|h| h.height).unwrap_or(0);
    height
        .checked_sub(base)
        .and_then(|offset| chain.get(offset as usize))
        .ok_or_else(|| {
            ConsensusError::InvalidProofOfWork(format!("no header at height {}", height))
        })
}

/// GetNextWorkRequired: ℋ* × ℤ → ℕ₃₂
///
/// `chain` is a contiguous run of headers in height order ending at the
/// parent of the new block. It must reach back one adjustment interval
/// whenever a retarget happens.
///
/// 1. No-retargeting networks keep the parent's bits
/// 2. Min-difficulty rule applies → pow limit
/// 3. Interval I = 1 under digishield, else T / spacing. If
///    (h + 1) mod I ≠ 0, keep the parent's bits (on min-difficulty
///    networks, the last bits not produced by the min-difficulty rule)
/// 4. Span back I blocks (I − 1 for the first retarget after genesis),
///    actual = t_prev − t_first
/// 5. Digishield: actual ← T + (actual − T) / 8
/// 6. Clamp to [min, max], target ← target · actual / T, capped at the limit
pub fn get_next_work_required(
    chain: &[HeaderInfo],
    new_block_time: i64,
    params: &ChainParams,
) -> Result<u32> {
    let prev = chain.last().ok_or_else(|| {
        ConsensusError::InvalidProofOfWork("no parent header".to_string())
    })?;

    if params.pow_no_retargeting {
        return Ok(prev.bits);
    }

    let limit_bits = target_to_compact(params.pow_limit);
    let daa = daa_params_at(params, prev.height);

    if allow_min_difficulty_for_block(prev, new_block_time, params, &daa) {
        return Ok(limit_bits);
    }

    let default_interval = params.target_timespan(prev.height) / params.target_spacing;
    let interval = if daa.digishield { 1 } else { default_interval };
    let next_height = prev.height as i64 + 1;

    if next_height % interval != 0 {
        if daa.allow_min_difficulty {
            let mut index = chain.len() - 1;
            while index > 0 {
                let header = &chain[index];
                if default_interval > 0 && header.height as i64 % default_interval == 0 {
                    break;
                }
                if header.bits != limit_bits {
                    break;
                }
                index -= 1;
            }
            return Ok(chain[index].bits);
        }
        return Ok(prev.bits);
    }

    let blocks_to_go_back = if next_height == interval {
        interval - 1
    } else {
        interval
    };
    let first_height = prev.height as i64 - blocks_to_go_back;
    if first_height < 0 {
        return Err(ConsensusError::InvalidProofOfWork(format!(
            "retarget window starts below genesis at {}",
            first_height
        )));
    }
    let first = ancestor(chain, first_height as Height)?;

    let actual = prev.time - first.time;
    let mut modulated = actual;
    if daa.digishield {
        modulated = daa.target_timespan + (modulated - daa.target_timespan) / 8;
    }
    modulated = modulated.clamp(daa.min_timespan, daa.max_timespan);

    let old = compact_to_target(prev.bits).target;
    let mut new = old.saturating_mul(U256::from(modulated as u64)) / U256::from(daa.target_timespan as u64);
    if new > params.pow_limit {
        new = params.pow_limit;
    }
    Ok(target_to_compact(new))
}

/// PermittedDifficultyTransition: ℕ × ℕ₃₂ × ℕ₃₂ → {true, false}
///
/// Whether a header at `height` may move from `old_bits` to `new_bits`,
/// judged without the timestamps: the new target must lie between the
/// rounded results of the smallest and largest allowed timespans.
pub fn permitted_difficulty_transition(
    params: &ChainParams,
    height: Height,
    old_bits: u32,
    new_bits: u32,
) -> bool {
    let prev_height = height.saturating_sub(1);
    let daa = daa_params_at(params, prev_height);

    if daa.allow_min_difficulty || params.pow_no_retargeting {
        return true;
    }
    if old_bits == new_bits {
        return true;
    }
    if !params.digishield_active(prev_height)
        && height as i64 % params.difficulty_adjustment_interval(prev_height) != 0
    {
        return false;
    }

    let observed = match derive_target(new_bits, params.pow_limit) {
        Some(target) => target,
        None => return false,
    };

    let old = compact_to_target(old_bits).target;
    let bound = |timespan: i64| {
        let mut target =
            old.saturating_mul(U256::from(timespan as u64)) / U256::from(daa.target_timespan as u64);
        if target > params.pow_limit {
            target = params.pow_limit;
        }
        compact_to_target(target_to_compact(target)).target
    };

    if bound(daa.max_timespan) < observed {
        return false;
    }
    if bound(daa.min_timespan) > observed {
        return false;
    }
    true
}
