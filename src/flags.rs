//! Script verification flags and the rule-set tables
//!
//! A rule set is nothing more than two flag masks: what a block must
//! satisfy and what the mempool additionally asks for. The interpreter
//! only ever looks at flags.

use crate::params::ChainParams;
use crate::types::{Height, RuleSet};

pub type ScriptFlags = u32;

pub const SCRIPT_VERIFY_NONE: ScriptFlags = 0;
pub const SCRIPT_VERIFY_P2SH: ScriptFlags = 1 << 0;
/// Strict signature, hash type and public key encoding
pub const SCRIPT_VERIFY_STRICTENC: ScriptFlags = 1 << 1;
pub const SCRIPT_VERIFY_DERSIG: ScriptFlags = 1 << 2;
pub const SCRIPT_VERIFY_LOW_S: ScriptFlags = 1 << 3;
/// CHECKMULTISIG dummy must be empty
pub const SCRIPT_VERIFY_NULLDUMMY: ScriptFlags = 1 << 4;
pub const SCRIPT_VERIFY_SIGPUSHONLY: ScriptFlags = 1 << 5;
pub const SCRIPT_VERIFY_MINIMALDATA: ScriptFlags = 1 << 6;
pub const SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS: ScriptFlags = 1 << 7;
pub const SCRIPT_VERIFY_CLEANSTACK: ScriptFlags = 1 << 8;
pub const SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY: ScriptFlags = 1 << 9;
pub const SCRIPT_VERIFY_CHECKSEQUENCEVERIFY: ScriptFlags = 1 << 10;
/// OP_IF/NOTIF argument must be empty or exactly [0x01]
pub const SCRIPT_VERIFY_MINIMALIF: ScriptFlags = 1 << 13;
/// Failed signature checks require an empty signature
pub const SCRIPT_VERIFY_NULLFAIL: ScriptFlags = 1 << 14;
pub const SCRIPT_ENABLE_SIGHASH_FORKID: ScriptFlags = 1 << 16;
/// Non-null CHECKMULTISIG dummy is a bitfield selecting Schnorr-signed keys
pub const SCRIPT_ENABLE_SCHNORR_MULTISIG: ScriptFlags = 1 << 21;
pub const SCRIPT_ENFORCE_SIGCHECKS: ScriptFlags = 1 << 22;
/// Dogecoin script semantics: disabled splice/bitwise opcodes, no
/// CHECKDATASIG or REVERSEBYTES, no Schnorr signatures
pub const SCRIPT_LEGACY_RULES: ScriptFlags = 1 << 24;

/// Mandatory and standard masks of one rule set
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleTable {
    pub rule_set: RuleSet,
    pub mandatory: ScriptFlags,
    pub standard: ScriptFlags,
}

const LEGACY_MANDATORY: ScriptFlags = SCRIPT_VERIFY_P2SH | SCRIPT_LEGACY_RULES;

const MODERN_MANDATORY: ScriptFlags = SCRIPT_VERIFY_P2SH
    | SCRIPT_VERIFY_STRICTENC
    | SCRIPT_VERIFY_DERSIG
    | SCRIPT_VERIFY_LOW_S
    | SCRIPT_VERIFY_NULLFAIL
    | SCRIPT_ENABLE_SIGHASH_FORKID
    | SCRIPT_ENABLE_SCHNORR_MULTISIG
    | SCRIPT_VERIFY_CLEANSTACK
    | SCRIPT_VERIFY_SIGPUSHONLY
    | SCRIPT_ENFORCE_SIGCHECKS;

pub const LEGACY_RULES: RuleTable = RuleTable {
    rule_set: RuleSet::Legacy,
    mandatory: LEGACY_MANDATORY,
    standard: LEGACY_MANDATORY
        | SCRIPT_VERIFY_STRICTENC
        | SCRIPT_VERIFY_NULLDUMMY
        | SCRIPT_VERIFY_MINIMALIF
        | SCRIPT_VERIFY_DERSIG
        | SCRIPT_VERIFY_LOW_S
        | SCRIPT_VERIFY_NULLFAIL
        | SCRIPT_VERIFY_MINIMALDATA
        | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
        | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
        | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY,
};

pub const MODERN_RULES: RuleTable = RuleTable {
    rule_set: RuleSet::Modern,
    mandatory: MODERN_MANDATORY,
    standard: MODERN_MANDATORY
        | SCRIPT_VERIFY_MINIMALDATA
        | SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS
        | SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY
        | SCRIPT_VERIFY_CHECKSEQUENCEVERIFY,
};

pub fn rule_table(rule_set: RuleSet) -> &'static RuleTable {
    match rule_set {
        RuleSet::Legacy => &LEGACY_RULES,
        RuleSet::Modern => &MODERN_RULES,
    }
}

/// Soft-fork flags active for a block at `height`
pub fn deployment_flags(params: &ChainParams, height: Height) -> ScriptFlags {
    let mut flags = SCRIPT_VERIFY_NONE;
    if height >= params.bip66_height {
        flags |= SCRIPT_VERIFY_DERSIG;
    }
    if height >= params.bip65_height {
        flags |= SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY;
    }
    if height >= params.csv_height {
        flags |= SCRIPT_VERIFY_CHECKSEQUENCEVERIFY;
    }
    flags
}

/// Flags every input of a block at `height` must pass
pub fn block_script_flags(rule_set: RuleSet, params: &ChainParams, height: Height) -> ScriptFlags {
    rule_table(rule_set).mandatory | deployment_flags(params, height)
}

/// (standard, mandatory) flags for a transaction entering the mempool
/// when the next block is at `next_height`
pub fn mempool_script_flags(
    rule_set: RuleSet,
    params: &ChainParams,
    next_height: Height,
) -> (ScriptFlags, ScriptFlags) {
    let mandatory = block_script_flags(rule_set, params, next_height);
    (rule_table(rule_set).standard | mandatory, mandatory)
}
