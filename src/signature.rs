//! Signature and public key encodings, ECDSA and Schnorr verification
//!
//! A 64-byte signature (65 with the hash type byte) is Schnorr; anything
//! else is DER-encoded ECDSA.

use std::sync::OnceLock;

use k256::elliptic_curve::ff::PrimeField;
use k256::elliptic_curve::group::Group;
use k256::elliptic_curve::ops::Reduce;
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{FieldBytes, FieldElement, ProjectivePoint, PublicKey as SchnorrPublicKey, Scalar, U256};
use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, VerifyOnly};

use crate::crypto::sha256;
use crate::error::ScriptError;
use crate::flags::*;
use crate::sighash::{SigHashType, SIGHASH_FORKID};

pub const SCHNORR_SIGNATURE_SIZE: usize = 64;

fn secp() -> &'static Secp256k1<VerifyOnly> {
    static CTX: OnceLock<Secp256k1<VerifyOnly>> = OnceLock::new();
    CTX.get_or_init(Secp256k1::verification_only)
}

/// Strict DER (BIP66) over a signature without its hash type byte
pub fn is_valid_der_encoding(sig: &[u8]) -> bool {
    let len = sig.len();
    if !(8..=72).contains(&len) {
        return false;
    }
    if sig[0] != 0x30 || sig[1] as usize != len - 2 {
        return false;
    }
    let len_r = sig[3] as usize;
    if 5 + len_r >= len {
        return false;
    }
    let len_s = sig[5 + len_r] as usize;
    if len_r + len_s + 6 != len {
        return false;
    }
    if sig[2] != 0x02 || len_r == 0 || (sig[4] & 0x80) != 0 {
        return false;
    }
    if len_r > 1 && sig[4] == 0x00 && (sig[5] & 0x80) == 0 {
        return false;
    }
    if sig[len_r + 4] != 0x02 || len_s == 0 || (sig[len_r + 6] & 0x80) != 0 {
        return false;
    }
    if len_s > 1 && sig[len_r + 6] == 0x00 && (sig[len_r + 7] & 0x80) == 0 {
        return false;
    }
    true
}

/// Whether the S value is already in the lower half of the order
pub fn is_low_s(sig: &[u8]) -> bool {
    match Signature::from_der_lax(sig) {
        Ok(parsed) => {
            let mut normalized = parsed;
            normalized.normalize_s();
            normalized == parsed
        }
        Err(_) => false,
    }
}

/// Encoding rules on a raw signature (no hash type byte)
fn check_raw_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if sig.len() == SCHNORR_SIGNATURE_SIZE {
        return Ok(());
    }
    if (flags & (SCRIPT_VERIFY_DERSIG | SCRIPT_VERIFY_LOW_S | SCRIPT_VERIFY_STRICTENC)) != 0
        && !is_valid_der_encoding(sig)
    {
        return Err(ScriptError::SigDer);
    }
    if (flags & SCRIPT_VERIFY_LOW_S) != 0 && !is_low_s(sig) {
        return Err(ScriptError::SigHighS);
    }
    Ok(())
}

fn check_sighash_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_STRICTENC) == 0 {
        return Ok(());
    }
    let hash_type = SigHashType::from_signature(sig).ok_or(ScriptError::SigHashType)?;
    if !hash_type.is_defined() {
        return Err(ScriptError::SigHashType);
    }
    let forkid_enabled = (flags & SCRIPT_ENABLE_SIGHASH_FORKID) != 0;
    match (forkid_enabled, hash_type.has_forkid()) {
        (false, true) => Err(ScriptError::IllegalForkId),
        (true, false) => Err(ScriptError::MustUseForkId),
        _ => Ok(()),
    }
}

/// Signature (with hash type) as consumed by CHECKSIG
pub fn check_transaction_signature_encoding(
    sig: &[u8],
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    if sig.is_empty() {
        return Ok(());
    }
    check_raw_signature_encoding(&sig[..sig.len() - 1], flags)?;
    check_sighash_encoding(sig, flags)
}

/// Signature in a legacy-mode CHECKMULTISIG: Schnorr-sized signatures refused
pub fn check_transaction_ecdsa_signature_encoding(
    sig: &[u8],
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    if sig.len() == SCHNORR_SIGNATURE_SIZE + 1 {
        return Err(ScriptError::SigBadLength);
    }
    check_transaction_signature_encoding(sig, flags)
}

/// Signature in a bitfield CHECKMULTISIG: only Schnorr accepted
pub fn check_transaction_schnorr_signature_encoding(
    sig: &[u8],
    flags: ScriptFlags,
) -> Result<(), ScriptError> {
    if sig.len() != SCHNORR_SIGNATURE_SIZE + 1 {
        return Err(ScriptError::SigNonSchnorr);
    }
    check_sighash_encoding(sig, flags)
}

/// Signature as consumed by CHECKDATASIG (no hash type byte)
pub fn check_data_signature_encoding(sig: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if sig.is_empty() {
        return Ok(());
    }
    check_raw_signature_encoding(sig, flags)
}

pub fn is_compressed_or_uncompressed_pubkey(pubkey: &[u8]) -> bool {
    match pubkey.len() {
        33 => pubkey[0] == 0x02 || pubkey[0] == 0x03,
        65 => pubkey[0] == 0x04,
        _ => false,
    }
}

pub fn check_pubkey_encoding(pubkey: &[u8], flags: ScriptFlags) -> Result<(), ScriptError> {
    if (flags & SCRIPT_VERIFY_STRICTENC) != 0 && !is_compressed_or_uncompressed_pubkey(pubkey) {
        return Err(ScriptError::PubkeyType);
    }
    Ok(())
}

/// ECDSA verification with lax DER parsing and S normalization
pub fn verify_ecdsa(sig: &[u8], pubkey: &[u8], msg: &[u8; 32]) -> bool {
    let Ok(key) = PublicKey::from_slice(pubkey) else {
        return false;
    };
    let Ok(mut parsed) = Signature::from_der_lax(sig) else {
        return false;
    };
    parsed.normalize_s();
    let Ok(message) = Message::from_digest_slice(msg) else {
        return false;
    };
    secp().verify_ecdsa(&message, &parsed, &key).is_ok()
}

/// Schnorr challenge e = H(r || compressed(P) || m) mod n
fn schnorr_challenge(r: &[u8], compressed_pubkey: &[u8], msg: &[u8; 32]) -> Scalar {
    let mut preimage = Vec::with_capacity(32 + 33 + 32);
    preimage.extend_from_slice(r);
    preimage.extend_from_slice(compressed_pubkey);
    preimage.extend_from_slice(msg);
    let digest = sha256(&preimage);
    <Scalar as Reduce<U256>>::reduce_bytes(&FieldBytes::from(digest))
}

fn is_quadratic_residue(y: &[u8]) -> bool {
    let mut bytes = FieldBytes::default();
    bytes.copy_from_slice(y);
    let element = FieldElement::from_bytes(&bytes);
    if bool::from(element.is_none()) {
        return false;
    }
    let element = element.unwrap_or(FieldElement::ZERO);
    bool::from(element.sqrt().is_some())
}

/// Schnorr verification over secp256k1 with a quadratic-residue R.
///
/// 1. r < p and s < n
/// 2. R = s·G − e·P with e = H(r || P || m)
/// 3. R is not infinity, R.y is a square, and R.x = r
pub fn verify_schnorr(sig: &[u8], pubkey: &[u8], msg: &[u8; 32]) -> bool {
    if sig.len() != SCHNORR_SIGNATURE_SIZE {
        return false;
    }
    let Ok(key) = SchnorrPublicKey::from_sec1_bytes(pubkey) else {
        return false;
    };
    let (r_bytes, s_bytes) = sig.split_at(32);

    let mut r_field = FieldBytes::default();
    r_field.copy_from_slice(r_bytes);
    if bool::from(FieldElement::from_bytes(&r_field).is_none()) {
        return false;
    }
    let mut s_field = FieldBytes::default();
    s_field.copy_from_slice(s_bytes);
    let s = Scalar::from_repr(s_field);
    if bool::from(s.is_none()) {
        return false;
    }
    let s = s.unwrap_or(Scalar::ZERO);

    let compressed = key.as_affine().to_encoded_point(true);
    let e = schnorr_challenge(r_bytes, compressed.as_bytes(), msg);

    let point = ProjectivePoint::GENERATOR * s - key.to_projective() * e;
    if bool::from(point.is_identity()) {
        return false;
    }
    let encoded = point.to_affine().to_encoded_point(false);
    let (Some(x), Some(y)) = (encoded.x(), encoded.y()) else {
        return false;
    };
    is_quadratic_residue(y) && x.as_slice() == r_bytes
}

/// Verify a transaction signature (hash type already stripped)
pub fn verify_signature(sig: &[u8], pubkey: &[u8], msg: &[u8; 32]) -> bool {
    if sig.len() == SCHNORR_SIGNATURE_SIZE {
        verify_schnorr(sig, pubkey, msg)
    } else {
        verify_ecdsa(sig, pubkey, msg)
    }
}

/// Whether a hash type requests the replay-protected digest
pub fn uses_forkid(sig: &[u8]) -> bool {
    sig.last().map_or(false, |b| (*b as u32 & SIGHASH_FORKID) != 0)
}


#[cfg(test)]
mod tests {
    use super::test_keys::*;
    use super::*;

    // ============================================================================
    // ENCODING TESTS
    // ============================================================================

    #[test]
    fn test_der_encoding_of_real_signature() {
        let sig = sign_ecdsa(1, &[7u8; 32]);
        assert!(is_valid_der_encoding(&sig));
        assert!(is_low_s(&sig));
    }

    #[test]
    fn test_der_encoding_rejects_garbage() {
        assert!(!is_valid_der_encoding(&[]));
        assert!(!is_valid_der_encoding(&[0x30; 10]));
        let mut sig = sign_ecdsa(1, &[7u8; 32]);
        sig[0] = 0x31;
        assert!(!is_valid_der_encoding(&sig));
    }

    #[test]
    fn test_strictenc_hash_types() {
        let mut sig = sign_ecdsa(1, &[7u8; 32]);
        sig.push(0x21);
        assert_eq!(
            check_transaction_signature_encoding(&sig, SCRIPT_VERIFY_STRICTENC),
            Err(ScriptError::SigHashType)
        );
        assert!(check_transaction_signature_encoding(&sig, SCRIPT_VERIFY_NONE).is_ok());

        *sig.last_mut().unwrap() = 0x41;
        assert_eq!(
            check_transaction_signature_encoding(&sig, SCRIPT_VERIFY_STRICTENC),
            Err(ScriptError::IllegalForkId)
        );
        *sig.last_mut().unwrap() = 0x01;
        assert_eq!(
            check_transaction_signature_encoding(
                &sig,
                SCRIPT_VERIFY_STRICTENC | SCRIPT_ENABLE_SIGHASH_FORKID
            ),
            Err(ScriptError::MustUseForkId)
        );
    }

    #[test]
    fn test_multisig_signature_shapes() {
        let schnorr = vec![1u8; 65];
        assert_eq!(
            check_transaction_ecdsa_signature_encoding(&schnorr, SCRIPT_VERIFY_NONE),
            Err(ScriptError::SigBadLength)
        );
        let mut ecdsa = sign_ecdsa(2, &[1u8; 32]);
        ecdsa.push(0x41);
        assert_eq!(
            check_transaction_schnorr_signature_encoding(&ecdsa, SCRIPT_VERIFY_NONE),
            Err(ScriptError::SigNonSchnorr)
        );
    }

    #[test]
    fn test_pubkey_type() {
        assert!(check_pubkey_encoding(&pubkey(1), SCRIPT_VERIFY_STRICTENC).is_ok());
        assert_eq!(
            check_pubkey_encoding(&[0x05; 33], SCRIPT_VERIFY_STRICTENC),
            Err(ScriptError::PubkeyType)
        );
        assert!(check_pubkey_encoding(&[0x05; 33], SCRIPT_VERIFY_NONE).is_ok());
    }

    // ============================================================================
    // VERIFICATION TESTS
    // ============================================================================

    #[test]
    fn test_ecdsa_verify() {
        let msg = [9u8; 32];
        let sig = sign_ecdsa(3, &msg);
        assert!(verify_ecdsa(&sig, &pubkey(3), &msg));
        assert!(!verify_ecdsa(&sig, &pubkey(4), &msg));
        assert!(!verify_ecdsa(&sig, &pubkey(3), &[8u8; 32]));
    }

    #[test]
    fn test_schnorr_verify() {
        let msg = [5u8; 32];
        let sig = sign_schnorr(3, &msg);
        assert_eq!(sig.len(), SCHNORR_SIGNATURE_SIZE);
        assert!(verify_schnorr(&sig, &pubkey(3), &msg));
        assert!(verify_signature(&sig, &pubkey(3), &msg));
        assert!(!verify_schnorr(&sig, &pubkey(4), &msg));
        assert!(!verify_schnorr(&sig, &pubkey(3), &[6u8; 32]));
    }

    #[test]
    fn test_schnorr_rejects_out_of_range_r() {
        let mut sig = sign_schnorr(3, &[5u8; 32]);
        for b in sig[..32].iter_mut() {
            *b = 0xff;
        }
        assert!(!verify_schnorr(&sig, &pubkey(3), &[5u8; 32]));
    }
}
