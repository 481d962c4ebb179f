//! Script execution engine
//!
//! One interpreter for both rule sets; the flags from [`crate::flags`]
//! decide which opcodes exist and which encodings are enforced.

use tracing::trace;

use crate::constants::*;
use crate::crypto::{hash160, ripemd160, sha1, sha256, sha256d};
use crate::error::ScriptError;
use crate::flags::*;
use crate::opcodes::*;
use crate::sighash::{signature_hash, PrecomputedSighash, SigHashType};
use crate::signature::{
    check_data_signature_encoding, check_pubkey_encoding, check_transaction_ecdsa_signature_encoding,
    check_transaction_schnorr_signature_encoding, check_transaction_signature_encoding,
    verify_signature, SCHNORR_SIGNATURE_SIZE,
};
use crate::types::*;

type StackItem = Vec<u8>;

// ============================================================================
// INSTRUCTION DECODING
// ============================================================================

/// One decoded instruction; `data` is empty for non-push opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction<'a> {
    pub opcode: u8,
    pub data: &'a [u8],
}

/// Iterator over `(offset, instruction)`; yields one error and stops on a
/// truncated push
pub struct ScriptIter<'a> {
    script: &'a [u8],
    pos: usize,
    done: bool,
}

impl<'a> ScriptIter<'a> {
    pub fn new(script: &'a [u8]) -> Self {
        ScriptIter {
            script,
            pos: 0,
            done: false,
        }
    }

    /// Offset of the next instruction
    pub fn position(&self) -> usize {
        self.pos
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], ScriptError> {
        if self.pos + n > self.script.len() {
            return Err(ScriptError::BadOpcode);
        }
        let out = &self.script[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    fn read_instruction(&mut self) -> Result<Instruction<'a>, ScriptError> {
        let opcode = self.take(1)?[0];
        let len = match opcode {
            0x01..=0x4b => opcode as usize,
            OP_PUSHDATA1 => self.take(1)?[0] as usize,
            OP_PUSHDATA2 => {
                let b = self.take(2)?;
                u16::from_le_bytes([b[0], b[1]]) as usize
            }
            OP_PUSHDATA4 => {
                let b = self.take(4)?;
                u32::from_le_bytes([b[0], b[1], b[2], b[3]]) as usize
            }
            _ => 0,
        };
        let data = self.take(len)?;
        Ok(Instruction { opcode, data })
    }
}

impl<'a> Iterator for ScriptIter<'a> {
    type Item = (usize, Result<Instruction<'a>, ScriptError>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.pos >= self.script.len() {
            return None;
        }
        let start = self.pos;
        let item = self.read_instruction();
        if item.is_err() {
            self.done = true;
        }
        Some((start, item))
    }
}

/// Push-only: every instruction is a push or a small integer
pub fn is_push_only(script: &[u8]) -> bool {
    ScriptIter::new(script).all(|(_, item)| matches!(item, Ok(i) if is_push(i.opcode)))
}

/// OP_HASH160 <20 bytes> OP_EQUAL
pub fn is_p2sh(script_pubkey: &[u8]) -> bool {
    script_pubkey.len() == 23
        && script_pubkey[0] == OP_HASH160
        && script_pubkey[1] == 0x14
        && script_pubkey[22] == OP_EQUAL
}

/// Whether `data` was pushed with the shortest possible opcode
pub fn check_minimal_push(data: &[u8], opcode: u8) -> bool {
    if data.is_empty() {
        return opcode == OP_0;
    }
    if data.len() == 1 && (1..=16).contains(&data[0]) {
        return false;
    }
    if data.len() == 1 && data[0] == 0x81 {
        return false;
    }
    if data.len() <= 75 {
        return opcode as usize == data.len();
    }
    if data.len() <= 255 {
        return opcode == OP_PUSHDATA1;
    }
    if data.len() <= 65535 {
        return opcode == OP_PUSHDATA2;
    }
    true
}

/// Push `data` using the shortest encoding
pub fn push_data(script: &mut Vec<u8>, data: &[u8]) {
    if data.is_empty() {
        script.push(OP_0);
    } else if data.len() == 1 && (1..=16).contains(&data[0]) {
        script.push(OP_1 + data[0] - 1);
    } else if data.len() == 1 && data[0] == 0x81 {
        script.push(OP_1NEGATE);
    } else if data.len() <= 75 {
        script.push(data.len() as u8);
        script.extend_from_slice(data);
    } else if data.len() <= 255 {
        script.push(OP_PUSHDATA1);
        script.push(data.len() as u8);
        script.extend_from_slice(data);
    } else if data.len() <= 65535 {
        script.push(OP_PUSHDATA2);
        script.extend_from_slice(&(data.len() as u16).to_le_bytes());
        script.extend_from_slice(data);
    } else {
        script.push(OP_PUSHDATA4);
        script.extend_from_slice(&(data.len() as u32).to_le_bytes());
        script.extend_from_slice(data);
    }
}

/// Push a script number using the shortest encoding
pub fn push_int(script: &mut Vec<u8>, n: i64) {
    if n == -1 || (1..=16).contains(&n) {
        script.push((OP_1 as i64 + n - 1) as u8);
    } else if n == 0 {
        script.push(OP_0);
    } else {
        push_data(script, &script_num_to_vec(n));
    }
}

/// Remove every push of exactly `sig` from `script`
fn find_and_delete(script: &[u8], sig: &[u8]) -> Vec<u8> {
    if sig.is_empty() {
        return script.to_vec();
    }
    let mut pattern = Vec::with_capacity(sig.len() + 5);
    push_data(&mut pattern, sig);
    let mut out = Vec::with_capacity(script.len());
    let mut iter = ScriptIter::new(script);
    let mut last = 0;
    while let Some((start, item)) = iter.next() {
        if item.is_err() {
            break;
        }
        let end = iter.position();
        if script[start..end] == pattern[..] {
            out.extend_from_slice(&script[last..start]);
            last = end;
        }
    }
    out.extend_from_slice(&script[last..]);
    out
}

// ============================================================================
// SCRIPT NUMBERS
// ============================================================================

/// Decode a script number of at most `max_len` bytes
pub fn decode_script_num(data: &[u8], require_minimal: bool, max_len: usize) -> Result<i64, ScriptError> {
    if data.len() > max_len {
        return Err(ScriptError::Unknown);
    }
    if require_minimal && !is_minimally_encoded(data, max_len) {
        return Err(ScriptError::MinimalData);
    }
    if data.is_empty() {
        return Ok(0);
    }
    let mut result: i64 = 0;
    for (i, byte) in data.iter().enumerate() {
        result |= (*byte as i64) << (8 * i);
    }
    let last = data[data.len() - 1];
    if (last & 0x80) != 0 {
        result &= !(0x80i64 << (8 * (data.len() - 1)));
        result = -result;
    }
    Ok(result)
}

pub fn is_minimally_encoded(data: &[u8], max_len: usize) -> bool {
    if data.len() > max_len {
        return false;
    }
    if let Some(&last) = data.last() {
        if (last & 0x7f) == 0 && (data.len() <= 1 || (data[data.len() - 2] & 0x80) == 0) {
            return false;
        }
    }
    true
}

/// Strip redundant sign/padding bytes in place; returns whether anything changed
pub fn minimally_encode(data: &mut Vec<u8>) -> bool {
    let Some(&last) = data.last() else {
        return false;
    };
    if (last & 0x7f) != 0 {
        return false;
    }
    if data.len() == 1 {
        data.clear();
        return true;
    }
    if (data[data.len() - 2] & 0x80) != 0 {
        return false;
    }
    let mut i = data.len() - 1;
    while i > 0 {
        if data[i - 1] != 0 {
            if (data[i - 1] & 0x80) != 0 {
                data[i] = last;
                i += 1;
            } else {
                data[i - 1] |= last;
            }
            data.truncate(i);
            return true;
        }
        i -= 1;
    }
    data.clear();
    true
}

pub fn script_num_to_vec(value: i64) -> Vec<u8> {
    if value == 0 {
        return Vec::new();
    }
    let negative = value < 0;
    let mut abs = value.unsigned_abs();
    let mut result = Vec::new();
    while abs > 0 {
        result.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if let Some(last) = result.last_mut() {
        if (*last & 0x80) != 0 {
            result.push(if negative { 0x80 } else { 0 });
        } else if negative {
            *last |= 0x80;
        }
    }
    result
}

pub fn cast_to_bool(data: &[u8]) -> bool {
    for (index, byte) in data.iter().enumerate() {
        if *byte != 0 {
            return !(index == data.len() - 1 && *byte == 0x80);
        }
    }
    false
}

fn bool_to_vec(value: bool) -> StackItem {
    if value {
        vec![1]
    } else {
        Vec::new()
    }
}

// ============================================================================
// SIGNATURE CHECKER
// ============================================================================

/// Transaction context a script is evaluated in
pub struct TransactionSignatureChecker<'a> {
    pub tx: &'a Transaction,
    pub input_index: usize,
    pub amount: Amount,
    pub precomputed: Option<&'a PrecomputedSighash>,
}

impl<'a> TransactionSignatureChecker<'a> {
    pub fn new(tx: &'a Transaction, input_index: usize, amount: Amount) -> Self {
        TransactionSignatureChecker {
            tx,
            input_index,
            amount,
            precomputed: None,
        }
    }

    pub fn with_precomputed(mut self, precomputed: &'a PrecomputedSighash) -> Self {
        self.precomputed = Some(precomputed);
        self
    }

    /// CheckSig: 𝕊 × 𝕊 × 𝕊 → {true, false}
    ///
    /// Errors only under legacy rules, where a Schnorr-sized signature is
    /// never valid and always a failed non-null signature.
    fn check_sig(&self, sig: &[u8], pubkey: &[u8], script_code: &[u8], flags: ScriptFlags) -> Result<bool, ScriptError> {
        let Some((&hash_byte, raw)) = sig.split_last() else {
            return Ok(false);
        };
        if (flags & SCRIPT_LEGACY_RULES) != 0 && raw.len() == SCHNORR_SIGNATURE_SIZE {
            return Err(ScriptError::SigNullFail);
        }
        let hash_type = SigHashType(hash_byte as u32);
        let forkid_digest = hash_type.has_forkid() && (flags & SCRIPT_ENABLE_SIGHASH_FORKID) != 0;
        let script_code = if forkid_digest {
            script_code.to_vec()
        } else {
            find_and_delete(script_code, sig)
        };
        let digest = signature_hash(
            &script_code,
            self.tx,
            self.input_index,
            hash_type,
            self.amount,
            flags,
            self.precomputed,
        );
        Ok(verify_signature(raw, pubkey, &digest))
    }

    fn check_lock_time(&self, lock_time: i64) -> bool {
        let tx_lock_time = self.tx.lock_time as i64;
        let threshold = LOCKTIME_THRESHOLD as i64;
        if !((tx_lock_time < threshold && lock_time < threshold)
            || (tx_lock_time >= threshold && lock_time >= threshold))
        {
            return false;
        }
        if lock_time > tx_lock_time {
            return false;
        }
        match self.tx.inputs.get(self.input_index) {
            Some(input) => input.sequence != SEQUENCE_FINAL,
            None => false,
        }
    }

    fn check_sequence(&self, sequence: i64) -> bool {
        let Some(input) = self.tx.inputs.get(self.input_index) else {
            return false;
        };
        let tx_sequence = input.sequence as i64;
        if self.tx.version < 2 {
            return false;
        }
        if (tx_sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64) != 0 {
            return false;
        }
        let mask = (SEQUENCE_LOCKTIME_TYPE_FLAG | SEQUENCE_LOCKTIME_MASK) as i64;
        let tx_masked = tx_sequence & mask;
        let masked = sequence & mask;
        let type_flag = SEQUENCE_LOCKTIME_TYPE_FLAG as i64;
        if !((tx_masked < type_flag && masked < type_flag)
            || (tx_masked >= type_flag && masked >= type_flag))
        {
            return false;
        }
        masked <= tx_masked
    }
}

// ============================================================================
// EVALUATION
// ============================================================================

fn pop(stack: &mut Vec<StackItem>) -> Result<StackItem, ScriptError> {
    stack.pop().ok_or(ScriptError::InvalidStackOperation)
}

fn top(stack: &[StackItem], depth: usize) -> Result<&StackItem, ScriptError> {
    if depth == 0 || depth > stack.len() {
        return Err(ScriptError::InvalidStackOperation);
    }
    Ok(&stack[stack.len() - depth])
}

fn require(stack: &[StackItem], n: usize) -> Result<(), ScriptError> {
    if stack.len() < n {
        Err(ScriptError::InvalidStackOperation)
    } else {
        Ok(())
    }
}

fn is_disabled(opcode: u8, flags: ScriptFlags) -> bool {
    is_always_disabled(opcode) || ((flags & SCRIPT_LEGACY_RULES) != 0 && is_legacy_disabled(opcode))
}

fn is_removed(opcode: u8, flags: ScriptFlags) -> bool {
    (flags & SCRIPT_LEGACY_RULES) != 0 && is_legacy_removed(opcode)
}

/// EvalScript: 𝕊 × 𝒮𝒯 × ℕ → 𝒮𝒯 ∪ {⊥}
///
/// 1. Reject scripts over 10 000 bytes
/// 2. For each instruction: enforce push size and op count, fail on
///    disabled opcodes even when not executing, execute when every
///    enclosing branch is taken
/// 3. Enforce stack + altstack ≤ 1000 after each step
/// 4. Fail on unbalanced IF/ENDIF
///
/// Returns the number of signature checks performed.
pub fn eval_script(
    script: &[u8],
    stack: &mut Vec<StackItem>,
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
) -> Result<u32, ScriptError> {
    if script.len() > MAX_SCRIPT_SIZE {
        return Err(ScriptError::ScriptSize);
    }
    let require_minimal = (flags & SCRIPT_VERIFY_MINIMALDATA) != 0;
    let mut altstack: Vec<StackItem> = Vec::new();
    let mut exec_stack: Vec<bool> = Vec::new();
    let mut op_count = 0usize;
    let mut sig_checks = 0u32;
    let mut code_start = 0usize;

    let mut iter = ScriptIter::new(script);
    while let Some((_, item)) = iter.next() {
        let Instruction { opcode, data } = item?;
        let exec = exec_stack.iter().all(|v| *v);

        if data.len() > MAX_SCRIPT_ELEMENT_SIZE {
            return Err(ScriptError::PushSize);
        }
        if counts_towards_op_limit(opcode) {
            op_count += 1;
            if op_count > MAX_SCRIPT_OPS {
                return Err(ScriptError::OpCount);
            }
        }
        if is_disabled(opcode, flags) {
            return Err(ScriptError::DisabledOpcode);
        }

        if exec && opcode <= OP_PUSHDATA4 {
            if require_minimal && !check_minimal_push(data, opcode) {
                return Err(ScriptError::MinimalData);
            }
            stack.push(data.to_vec());
        } else if exec || (OP_IF..=OP_ENDIF).contains(&opcode) {
            if is_removed(opcode, flags) {
                return Err(ScriptError::BadOpcode);
            }
            match opcode {
                OP_1NEGATE | OP_1..=OP_16 => {
                    let n = opcode as i64 - (OP_1 as i64 - 1);
                    stack.push(script_num_to_vec(n));
                }

                // Control
                OP_NOP => {}
                OP_CHECKLOCKTIMEVERIFY => {
                    if (flags & SCRIPT_VERIFY_CHECKLOCKTIMEVERIFY) == 0 {
                        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let lock_time = decode_script_num(top(stack, 1)?, require_minimal, 5)?;
                        if lock_time < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if !checker.check_lock_time(lock_time) {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_CHECKSEQUENCEVERIFY => {
                    if (flags & SCRIPT_VERIFY_CHECKSEQUENCEVERIFY) == 0 {
                        if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                            return Err(ScriptError::DiscourageUpgradableNops);
                        }
                    } else {
                        let sequence = decode_script_num(top(stack, 1)?, require_minimal, 5)?;
                        if sequence < 0 {
                            return Err(ScriptError::NegativeLocktime);
                        }
                        if (sequence & SEQUENCE_LOCKTIME_DISABLE_FLAG as i64) == 0
                            && !checker.check_sequence(sequence)
                        {
                            return Err(ScriptError::UnsatisfiedLocktime);
                        }
                    }
                }
                OP_NOP1 | OP_NOP4..=OP_NOP10 => {
                    if (flags & SCRIPT_VERIFY_DISCOURAGE_UPGRADABLE_NOPS) != 0 {
                        return Err(ScriptError::DiscourageUpgradableNops);
                    }
                }
                OP_IF | OP_NOTIF => {
                    let mut value = false;
                    if exec {
                        let cond = stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                        if (flags & SCRIPT_VERIFY_MINIMALIF) != 0
                            && (cond.len() > 1 || (cond.len() == 1 && cond[0] != 1))
                        {
                            return Err(ScriptError::MinimalIf);
                        }
                        value = cast_to_bool(&cond);
                        if opcode == OP_NOTIF {
                            value = !value;
                        }
                    }
                    exec_stack.push(value);
                }
                OP_ELSE => {
                    let last = exec_stack.last_mut().ok_or(ScriptError::UnbalancedConditional)?;
                    *last = !*last;
                }
                OP_ENDIF => {
                    exec_stack.pop().ok_or(ScriptError::UnbalancedConditional)?;
                }
                OP_VERIFY => {
                    if !cast_to_bool(top(stack, 1)?) {
                        return Err(ScriptError::Verify);
                    }
                    stack.pop();
                }
                OP_RETURN => return Err(ScriptError::OpReturn),

                // Stack ops
                OP_TOALTSTACK => altstack.push(pop(stack)?),
                OP_FROMALTSTACK => {
                    let v = altstack.pop().ok_or(ScriptError::InvalidAltstackOperation)?;
                    stack.push(v);
                }
                OP_2DROP => {
                    require(stack, 2)?;
                    stack.truncate(stack.len() - 2);
                }
                OP_2DUP => {
                    let a = top(stack, 2)?.clone();
                    let b = top(stack, 1)?.clone();
                    stack.push(a);
                    stack.push(b);
                }
                OP_3DUP => {
                    let a = top(stack, 3)?.clone();
                    let b = top(stack, 2)?.clone();
                    let c = top(stack, 1)?.clone();
                    stack.extend([a, b, c]);
                }
                OP_2OVER => {
                    let a = top(stack, 4)?.clone();
                    let b = top(stack, 3)?.clone();
                    stack.extend([a, b]);
                }
                OP_2ROT => {
                    require(stack, 6)?;
                    let at = stack.len() - 6;
                    let moved: Vec<StackItem> = stack.drain(at..at + 2).collect();
                    stack.extend(moved);
                }
                OP_2SWAP => {
                    require(stack, 4)?;
                    let n = stack.len();
                    stack.swap(n - 4, n - 2);
                    stack.swap(n - 3, n - 1);
                }
                OP_IFDUP => {
                    let v = top(stack, 1)?.clone();
                    if cast_to_bool(&v) {
                        stack.push(v);
                    }
                }
                OP_DEPTH => stack.push(script_num_to_vec(stack.len() as i64)),
                OP_DROP => {
                    pop(stack)?;
                }
                OP_DUP => {
                    let v = top(stack, 1)?.clone();
                    stack.push(v);
                }
                OP_NIP => {
                    require(stack, 2)?;
                    let n = stack.len();
                    stack.remove(n - 2);
                }
                OP_OVER => {
                    let v = top(stack, 2)?.clone();
                    stack.push(v);
                }
                OP_PICK | OP_ROLL => {
                    let n = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    if n < 0 || n as usize >= stack.len() {
                        return Err(ScriptError::InvalidStackOperation);
                    }
                    let idx = stack.len() - 1 - n as usize;
                    let v = if opcode == OP_ROLL {
                        stack.remove(idx)
                    } else {
                        stack[idx].clone()
                    };
                    stack.push(v);
                }
                OP_ROT => {
                    require(stack, 3)?;
                    let n = stack.len();
                    stack[n - 3..].rotate_left(1);
                }
                OP_SWAP => {
                    require(stack, 2)?;
                    let n = stack.len();
                    stack.swap(n - 2, n - 1);
                }
                OP_TUCK => {
                    require(stack, 2)?;
                    let v = top(stack, 1)?.clone();
                    let n = stack.len();
                    stack.insert(n - 2, v);
                }

                // Splice ops
                OP_CAT => {
                    require(stack, 2)?;
                    let b = pop(stack)?;
                    let a = stack.last_mut().ok_or(ScriptError::InvalidStackOperation)?;
                    if a.len() + b.len() > MAX_SCRIPT_ELEMENT_SIZE {
                        return Err(ScriptError::PushSize);
                    }
                    a.extend_from_slice(&b);
                }
                OP_SPLIT => {
                    require(stack, 2)?;
                    let pos = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    let data = pop(stack)?;
                    if pos < 0 || pos as usize > data.len() {
                        return Err(ScriptError::InvalidSplitRange);
                    }
                    let (left, right) = data.split_at(pos as usize);
                    stack.push(left.to_vec());
                    stack.push(right.to_vec());
                }
                OP_NUM2BIN => {
                    require(stack, 2)?;
                    let size = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    if size < 0 || size as usize > MAX_SCRIPT_ELEMENT_SIZE {
                        return Err(ScriptError::PushSize);
                    }
                    let size = size as usize;
                    let mut raw = pop(stack)?;
                    minimally_encode(&mut raw);
                    if raw.len() > size {
                        return Err(ScriptError::ImpossibleEncoding);
                    }
                    let mut sign = 0u8;
                    if let Some(last) = raw.last_mut() {
                        sign = *last & 0x80;
                        *last &= 0x7f;
                    }
                    raw.resize(size, 0);
                    if let Some(last) = raw.last_mut() {
                        *last |= sign;
                    }
                    stack.push(raw);
                }
                OP_BIN2NUM => {
                    let v = stack.last_mut().ok_or(ScriptError::InvalidStackOperation)?;
                    minimally_encode(v);
                    if !is_minimally_encoded(v, MAX_SCRIPT_NUM_LENGTH) {
                        return Err(ScriptError::InvalidNumberRange);
                    }
                }
                OP_SIZE => {
                    let len = top(stack, 1)?.len();
                    stack.push(script_num_to_vec(len as i64));
                }
                OP_REVERSEBYTES => {
                    stack
                        .last_mut()
                        .ok_or(ScriptError::InvalidStackOperation)?
                        .reverse();
                }

                // Bitwise logic
                OP_AND | OP_OR | OP_XOR => {
                    require(stack, 2)?;
                    let b = pop(stack)?;
                    let a = stack.last_mut().ok_or(ScriptError::InvalidStackOperation)?;
                    if a.len() != b.len() {
                        return Err(ScriptError::InvalidOperandSize);
                    }
                    for (x, y) in a.iter_mut().zip(b.iter()) {
                        match opcode {
                            OP_AND => *x &= *y,
                            OP_OR => *x |= *y,
                            _ => *x ^= *y,
                        }
                    }
                }
                OP_EQUAL | OP_EQUALVERIFY => {
                    require(stack, 2)?;
                    let b = pop(stack)?;
                    let a = pop(stack)?;
                    let equal = a == b;
                    if opcode == OP_EQUALVERIFY {
                        if !equal {
                            return Err(ScriptError::EqualVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(equal));
                    }
                }

                // Numeric
                OP_1ADD | OP_1SUB | OP_NEGATE | OP_ABS | OP_NOT | OP_0NOTEQUAL => {
                    let n = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    let r = match opcode {
                        OP_1ADD => n + 1,
                        OP_1SUB => n - 1,
                        OP_NEGATE => -n,
                        OP_ABS => n.abs(),
                        OP_NOT => (n == 0) as i64,
                        _ => (n != 0) as i64,
                    };
                    stack.push(script_num_to_vec(r));
                }
                OP_ADD | OP_SUB | OP_DIV | OP_MOD | OP_BOOLAND | OP_BOOLOR | OP_NUMEQUAL
                | OP_NUMEQUALVERIFY | OP_NUMNOTEQUAL | OP_LESSTHAN | OP_GREATERTHAN
                | OP_LESSTHANOREQUAL | OP_GREATERTHANOREQUAL | OP_MIN | OP_MAX => {
                    require(stack, 2)?;
                    let b = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    let a = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    let r = match opcode {
                        OP_ADD => a + b,
                        OP_SUB => a - b,
                        OP_DIV => {
                            if b == 0 {
                                return Err(ScriptError::DivByZero);
                            }
                            a / b
                        }
                        OP_MOD => {
                            if b == 0 {
                                return Err(ScriptError::ModByZero);
                            }
                            a % b
                        }
                        OP_BOOLAND => (a != 0 && b != 0) as i64,
                        OP_BOOLOR => (a != 0 || b != 0) as i64,
                        OP_NUMEQUAL | OP_NUMEQUALVERIFY => (a == b) as i64,
                        OP_NUMNOTEQUAL => (a != b) as i64,
                        OP_LESSTHAN => (a < b) as i64,
                        OP_GREATERTHAN => (a > b) as i64,
                        OP_LESSTHANOREQUAL => (a <= b) as i64,
                        OP_GREATERTHANOREQUAL => (a >= b) as i64,
                        OP_MIN => a.min(b),
                        _ => a.max(b),
                    };
                    if opcode == OP_NUMEQUALVERIFY {
                        if r == 0 {
                            return Err(ScriptError::NumEqualVerify);
                        }
                    } else {
                        stack.push(script_num_to_vec(r));
                    }
                }
                OP_WITHIN => {
                    require(stack, 3)?;
                    let max = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    let min = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    let x = decode_script_num(&pop(stack)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
                    stack.push(bool_to_vec(min <= x && x < max));
                }

                // Crypto
                OP_RIPEMD160 => {
                    let v = pop(stack)?;
                    stack.push(ripemd160(&v).to_vec());
                }
                OP_SHA1 => {
                    let v = pop(stack)?;
                    stack.push(sha1(&v).to_vec());
                }
                OP_SHA256 => {
                    let v = pop(stack)?;
                    stack.push(sha256(&v).to_vec());
                }
                OP_HASH160 => {
                    let v = pop(stack)?;
                    stack.push(hash160(&v).to_vec());
                }
                OP_HASH256 => {
                    let v = pop(stack)?;
                    stack.push(sha256d(&v).to_vec());
                }
                OP_CODESEPARATOR => code_start = iter.position(),
                OP_CHECKSIG | OP_CHECKSIGVERIFY => {
                    require(stack, 2)?;
                    let pubkey = pop(stack)?;
                    let sig = pop(stack)?;
                    check_transaction_signature_encoding(&sig, flags)?;
                    check_pubkey_encoding(&pubkey, flags)?;
                    let success = checker.check_sig(&sig, &pubkey, &script[code_start..], flags)?;
                    if !success && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 && !sig.is_empty() {
                        return Err(ScriptError::SigNullFail);
                    }
                    if !sig.is_empty() {
                        sig_checks += 1;
                    }
                    if opcode == OP_CHECKSIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckSigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(success));
                    }
                }
                OP_CHECKDATASIG | OP_CHECKDATASIGVERIFY => {
                    require(stack, 3)?;
                    let pubkey = pop(stack)?;
                    let message = pop(stack)?;
                    let sig = pop(stack)?;
                    check_data_signature_encoding(&sig, flags)?;
                    check_pubkey_encoding(&pubkey, flags)?;
                    let mut success = false;
                    if !sig.is_empty() {
                        sig_checks += 1;
                        success = verify_signature(&sig, &pubkey, &sha256(&message));
                    }
                    if !success && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 && !sig.is_empty() {
                        return Err(ScriptError::SigNullFail);
                    }
                    if opcode == OP_CHECKDATASIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckDataSigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(success));
                    }
                }
                OP_CHECKMULTISIG | OP_CHECKMULTISIGVERIFY => {
                    let (success, checks) = eval_checkmultisig(
                        stack,
                        &script[code_start..],
                        flags,
                        require_minimal,
                        &mut op_count,
                        checker,
                    )?;
                    sig_checks += checks;
                    if opcode == OP_CHECKMULTISIGVERIFY {
                        if !success {
                            return Err(ScriptError::CheckMultisigVerify);
                        }
                    } else {
                        stack.push(bool_to_vec(success));
                    }
                }

                _ => {
                    trace!(opcode, "bad opcode");
                    return Err(ScriptError::BadOpcode);
                }
            }
        }

        if stack.len() + altstack.len() > MAX_STACK_SIZE {
            return Err(ScriptError::StackSize);
        }
    }

    if !exec_stack.is_empty() {
        return Err(ScriptError::UnbalancedConditional);
    }
    Ok(sig_checks)
}

/// CHECKMULTISIG in both modes.
///
/// Stack layout, top first: key count, keys, signature count, signatures,
/// dummy. A non-empty dummy under Schnorr multisig is a bitfield naming
/// which keys signed; otherwise signatures are matched to keys in order.
fn eval_checkmultisig(
    stack: &mut Vec<StackItem>,
    script_code: &[u8],
    flags: ScriptFlags,
    require_minimal: bool,
    op_count: &mut usize,
    checker: &TransactionSignatureChecker<'_>,
) -> Result<(bool, u32), ScriptError> {
    let mut i = 1usize;
    let key_count = decode_script_num(top(stack, i)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
    if key_count < 0 || key_count as usize > MAX_PUBKEYS_PER_MULTISIG {
        return Err(ScriptError::PubkeyCount);
    }
    let key_count = key_count as usize;
    *op_count += key_count;
    if *op_count > MAX_SCRIPT_OPS {
        return Err(ScriptError::OpCount);
    }
    i += 1;
    let first_key = i;
    i += key_count;

    let sig_count = decode_script_num(top(stack, i)?, require_minimal, MAX_SCRIPT_NUM_LENGTH)?;
    if sig_count < 0 || sig_count as usize > key_count {
        return Err(ScriptError::SigCount);
    }
    let sig_count = sig_count as usize;
    i += 1;
    let first_sig = i;
    i += sig_count;
    let dummy_depth = i;
    require(stack, dummy_depth)?;

    let keys: Vec<StackItem> = (0..key_count)
        .map(|k| stack[stack.len() - first_key - k].clone())
        .collect();
    let sigs: Vec<StackItem> = (0..sig_count)
        .map(|k| stack[stack.len() - first_sig - k].clone())
        .collect();
    let dummy = stack[stack.len() - dummy_depth].clone();

    let mut sig_checks = 0u32;
    let success;

    if (flags & SCRIPT_ENABLE_SCHNORR_MULTISIG) != 0 && !dummy.is_empty() {
        let bitfield = decode_bitfield(&dummy, key_count)?;
        if bitfield.count_ones() as usize != sig_count {
            return Err(ScriptError::InvalidBitCount);
        }
        let mut key_idx = 0usize;
        for sig in &sigs {
            while (bitfield >> key_idx) & 1 == 0 {
                key_idx += 1;
            }
            let key = &keys[key_idx];
            check_transaction_schnorr_signature_encoding(sig, flags)?;
            check_pubkey_encoding(key, flags)?;
            if !checker.check_sig(sig, key, script_code, flags)? {
                return Err(ScriptError::SigNullFail);
            }
            sig_checks += 1;
            key_idx += 1;
        }
        success = true;
    } else {
        if (flags & SCRIPT_VERIFY_NULLDUMMY) != 0 && !dummy.is_empty() {
            return Err(ScriptError::SigNullDummy);
        }
        let mut ok = true;
        let mut sig_idx = 0usize;
        let mut key_idx = 0usize;
        while ok && sig_idx < sig_count {
            let sig = &sigs[sig_idx];
            let key = &keys[key_idx];
            check_transaction_ecdsa_signature_encoding(sig, flags)?;
            check_pubkey_encoding(key, flags)?;
            if checker.check_sig(sig, key, script_code, flags)? {
                sig_idx += 1;
            }
            key_idx += 1;
            if sig_count - sig_idx > key_count - key_idx {
                ok = false;
            }
        }
        if sigs.iter().any(|s| !s.is_empty()) {
            sig_checks += key_count as u32;
        }
        success = ok;
        if !success && (flags & SCRIPT_VERIFY_NULLFAIL) != 0 && sigs.iter().any(|s| !s.is_empty()) {
            return Err(ScriptError::SigNullFail);
        }
    }

    stack.truncate(stack.len() - dummy_depth);
    Ok((success, sig_checks))
}

/// Bitfield of `size` bits, little-endian; no bits past `size` may be set
fn decode_bitfield(dummy: &[u8], size: usize) -> Result<u32, ScriptError> {
    if dummy.len() != (size + 7) / 8 {
        return Err(ScriptError::BitfieldSize);
    }
    let mut bitfield = 0u32;
    for (i, byte) in dummy.iter().enumerate() {
        bitfield |= (*byte as u32) << (8 * i);
    }
    if size < 32 && (bitfield >> size) != 0 {
        return Err(ScriptError::BitRange);
    }
    Ok(bitfield)
}

// ============================================================================
// VERIFICATION
// ============================================================================

/// VerifyScript: 𝕊 × 𝕊 × ℕ × 𝒞 → {⊤} ∪ 𝓔
///
/// 1. SIGPUSHONLY: script_sig must be push-only
/// 2. Evaluate script_sig, then script_pubkey on the resulting stack
/// 3. Top element must be true
/// 4. P2SH: evaluate the serialized redeem script on a copy of the
///    script_sig stack
/// 5. CLEANSTACK: exactly one element left
pub fn verify_script(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
) -> Result<(), ScriptError> {
    verify_script_with_sigchecks(script_sig, script_pubkey, flags, checker).map(|_| ())
}

/// [`verify_script`], also returning the signature checks performed
pub fn verify_script_with_sigchecks(
    script_sig: &[u8],
    script_pubkey: &[u8],
    flags: ScriptFlags,
    checker: &TransactionSignatureChecker<'_>,
) -> Result<u32, ScriptError> {
    if (flags & SCRIPT_VERIFY_SIGPUSHONLY) != 0 && !is_push_only(script_sig) {
        return Err(ScriptError::SigPushOnly);
    }

    let mut stack: Vec<StackItem> = Vec::new();
    let mut sig_checks = eval_script(script_sig, &mut stack, flags, checker)?;
    let stack_copy = if (flags & SCRIPT_VERIFY_P2SH) != 0 {
        stack.clone()
    } else {
        Vec::new()
    };
    sig_checks += eval_script(script_pubkey, &mut stack, flags, checker)?;

    match stack.last() {
        Some(v) if cast_to_bool(v) => {}
        _ => return Err(ScriptError::EvalFalse),
    }

    if (flags & SCRIPT_VERIFY_P2SH) != 0 && is_p2sh(script_pubkey) {
        if !is_push_only(script_sig) {
            return Err(ScriptError::SigPushOnly);
        }
        stack = stack_copy;
        let redeem_script = pop(&mut stack)?;
        sig_checks += eval_script(&redeem_script, &mut stack, flags, checker)?;
        match stack.last() {
            Some(v) if cast_to_bool(v) => {}
            _ => return Err(ScriptError::EvalFalse),
        }
    }

    if (flags & SCRIPT_VERIFY_CLEANSTACK) != 0 && stack.len() != 1 {
        return Err(ScriptError::CleanStack);
    }

    Ok(sig_checks)
}
