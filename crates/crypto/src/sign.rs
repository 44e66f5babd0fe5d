use k256::ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use tracing::debug;
use wom_core::{codes, Address, WomError};

use crate::hash::{decode_hex, keccak256};

/// Hash of `message` under the Ethereum personal-message prefix.
pub fn eth_message_hash(message: &[u8]) -> [u8; 32] {
    let mut prefixed = format!("\x19Ethereum Signed Message:\n{}", message.len()).into_bytes();
    prefixed.extend_from_slice(message);
    keccak256(&prefixed)
}

/// Account address of a secp256k1 public key.
pub fn address_of(key: &VerifyingKey) -> Address {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut bytes = [0u8; 20];
    bytes.copy_from_slice(&digest[12..]);
    Address::from_bytes(bytes)
}

/// Recover the signer of a personal message from a 65-byte `r || s || v`
/// signature. `v` may be 0/1 or 27/28.
pub fn recover_address(message: &[u8], signature: &[u8]) -> Result<Address, WomError> {
    let invalid = || WomError::authorization(codes::INVALID_SIGNED_MESSAGE);
    if signature.len() < 65 {
        return Err(invalid());
    }

    let mut v = signature[64];
    if v < 27 {
        v += 27;
    }
    let recovery_byte = v.checked_sub(27).filter(|b| *b <= 1).ok_or_else(invalid)?;

    let mut sig = Signature::from_slice(&signature[..64]).map_err(|_| invalid())?;
    let mut recovery_id = RecoveryId::from_byte(recovery_byte).ok_or_else(invalid)?;
    if let Some(normalized) = sig.normalize_s() {
        sig = normalized;
        recovery_id = RecoveryId::new(!recovery_id.is_y_odd(), recovery_id.is_x_reduced());
    }

    let key = VerifyingKey::recover_from_prehash(&eth_message_hash(message), &sig, recovery_id)
        .map_err(|_| invalid())?;
    Ok(address_of(&key))
}

/// Check that `signature` (hex) over `raw_message` recovers to `address`.
pub fn verify_signed_message(
    address: &Address,
    signature: &str,
    raw_message: &str,
) -> Result<(), WomError> {
    if address.is_zero() {
        return Err(WomError::authorization(codes::EMPTY_DEED_MANAGER_ADDRESS));
    }
    if signature.trim().is_empty() || raw_message.trim().is_empty() {
        return Err(WomError::authorization(codes::EMPTY_SIGNED_MESSAGE));
    }
    let bytes = decode_hex(signature)
        .ok_or_else(|| WomError::authorization(codes::INVALID_SIGNED_MESSAGE))?;
    let recovered = recover_address(raw_message.as_bytes(), &bytes)?;
    if recovered != *address {
        debug!(expected = %address, recovered = %recovered, "signed message address mismatch");
        return Err(WomError::authorization(codes::INVALID_SIGNED_MESSAGE));
    }
    Ok(())
}

/// secp256k1 key producing Ethereum personal-message signatures.
pub struct EthSigner {
    key: SigningKey,
}

impl EthSigner {
    pub fn random() -> Self {
        Self {
            key: SigningKey::random(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8]) -> Result<Self, WomError> {
        let key = SigningKey::from_slice(bytes)
            .map_err(|_| WomError::parsing(codes::MALFORMED_PAYLOAD))?;
        Ok(Self { key })
    }

    pub fn address(&self) -> Address {
        address_of(self.key.verifying_key())
    }

    /// Sign `message` and return `0x`-hex `r || s || v` with `v` in 27/28.
    pub fn sign_message(&self, message: &[u8]) -> Result<String, WomError> {
        let (signature, recovery_id) = self
            .key
            .sign_prehash_recoverable(&eth_message_hash(message))
            .map_err(|_| WomError::authorization(codes::INVALID_SIGNED_MESSAGE))?;
        let mut bytes = signature.to_bytes().to_vec();
        bytes.push(27 + recovery_id.to_byte());
        Ok(format!("0x{}", hex::encode(bytes)))
    }
}
