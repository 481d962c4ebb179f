//! Block subsidy and coinbase reward splits

use crate::constants::*;
use crate::params::{ChainParams, Network};
use crate::types::*;

/// Height from which every network pays the flat inflation reward
const CONSTANT_REWARD_HALVINGS: Height = 6;

/// GetBlockSubsidy: ℕ × ℍ → ℤ
///
/// Regtest: 50 · C · 2^(−⌊h/150⌋), zero after 64 halvings.
///
/// Main and test networks, with H = 100 000 and k = ⌊h/H⌋:
/// 1. h < digishield height: 1 + U(1, (10⁶ ≫ k) − 1) coins, where U is
///    drawn from an MT19937 seeded with hex digits 7..14 of the previous
///    block hash
/// 2. h < 6H: (500 000 · C) ≫ k
/// 3. otherwise 10 000 · C
pub fn block_subsidy(height: Height, params: &ChainParams, prev_hash: &Hash) -> Amount {
    let halvings = height / params.subsidy_halving_interval;

    if params.network == Network::Regtest {
        if halvings >= 64 {
            return 0;
        }
        return INITIAL_SUBSIDY >> halvings;
    }

    if !params.digishield_active(height) {
        let max_reward = (1_000_000u32 >> halvings.min(31)).saturating_sub(1);
        if max_reward < 1 {
            return COIN;
        }
        let mut rng = Mt19937::new(subsidy_seed(prev_hash));
        let draw = uniform_int(&mut rng, 1, max_reward);
        (1 + draw as Amount) * COIN
    } else if halvings < CONSTANT_REWARD_HALVINGS {
        (500_000 * COIN) >> halvings
    } else {
        10_000 * COIN
    }
}

/// Largest subsidy a block at `height` can claim, whatever its parent
pub fn max_block_subsidy(height: Height, params: &ChainParams) -> Amount {
    let halvings = height / params.subsidy_halving_interval;
    if params.network != Network::Regtest && !params.digishield_active(height) {
        return (1_000_000 >> halvings.min(31)) * COIN;
    }
    block_subsidy(height, params, &[0u8; 32])
}

/// Seven hex digits of the displayed previous block hash, starting at the
/// eighth
fn subsidy_seed(prev_hash: &Hash) -> u32 {
    let hex = hash_to_hex(prev_hash);
    u32::from_str_radix(&hex[7..14], 16).unwrap_or(0)
}

/// Miner fund share of a block reward
pub fn miner_fund_amount(reward: Amount, params: &ChainParams) -> Amount {
    reward * params.miner_fund_ratio / 100
}

/// Staking reward share of a block reward
pub fn staking_reward_amount(reward: Amount, params: &ChainParams) -> Amount {
    reward * params.staking_reward_ratio / 100
}

/// 32-bit Mersenne Twister as seeded with a single integer
struct Mt19937 {
    state: [u32; 624],
    index: usize,
}

impl Mt19937 {
    fn new(seed: u32) -> Self {
        let mut state = [0u32; 624];
        state[0] = seed;
        for i in 1..624 {
            let prev = state[i - 1];
            state[i] = 1_812_433_253u32
                .wrapping_mul(prev ^ (prev >> 30))
                .wrapping_add(i as u32);
        }
        Mt19937 { state, index: 624 }
    }

    fn twist(&mut self) {
        for i in 0..624 {
            let y = (self.state[i] & 0x8000_0000) | (self.state[(i + 1) % 624] & 0x7fff_ffff);
            let mut next = self.state[(i + 397) % 624] ^ (y >> 1);
            if y & 1 != 0 {
                next ^= 0x9908_b0df;
            }
            self.state[i] = next;
        }
        self.index = 0;
    }

    fn next_u32(&mut self) -> u32 {
        if self.index >= 624 {
            self.twist();
        }
        let mut y = self.state[self.index];
        self.index += 1;
        y ^= y >> 11;
        y ^= (y << 7) & 0x9d2c_5680;
        y ^= (y << 15) & 0xefc6_0000;
        y ^= y >> 18;
        y
    }
}

/// Uniform integer in [low, high] by bucketed rejection sampling.
///
/// Reproduces `boost::random::uniform_int_distribution` over a 32-bit
/// engine (`detail::generate_uniform_int`, the brange > range branch):
/// the engine range is cut into range + 1 equal buckets and draws past
/// the last full bucket are rejected.
fn uniform_int(rng: &mut Mt19937, low: u32, high: u32) -> u32 {
    let range = high - low;
    if range == u32::MAX {
        return rng.next_u32();
    }
    let buckets = range as u64 + 1;
    let mut bucket_size = u32::MAX as u64 / buckets;
    if u32::MAX as u64 % buckets == range as u64 {
        bucket_size += 1;
    }
    loop {
        let result = rng.next_u32() as u64 / bucket_size;
        if result <= range as u64 {
            return result as u32 + low;
        }
    }
}
