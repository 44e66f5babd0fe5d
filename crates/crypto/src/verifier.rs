//! Report signature verification.
//!
//! A report's identity is `keccak256(signature)`. The signature must recover to
//! the reporting hub over the canonical JSON of the payload.

use tracing::warn;
use wom_core::{codes, HubReportData, HubReportVerifiableData, WomError};

use crate::hash::{decode_hex, keccak_hex};
use crate::sign::{recover_address, EthSigner};

/// Outcome of verifying a signed report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    Valid,
    InvalidHash,
    InvalidSignature,
}

impl Verification {
    pub fn is_valid(&self) -> bool {
        *self == Self::Valid
    }
}

/// Stateless verifier for signed hub reports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignatureVerifier;

impl SignatureVerifier {
    pub fn new() -> Self {
        Self
    }

    /// Verify hash and signature of a report.
    pub fn verify(&self, report: &HubReportVerifiableData) -> Verification {
        let Some(signature) = decode_hex(&report.signature) else {
            return Verification::InvalidSignature;
        };
        if signature.len() < 65 {
            return Verification::InvalidSignature;
        }
        if !keccak_hex(&signature).eq_ignore_ascii_case(report.hash.trim()) {
            return Verification::InvalidHash;
        }
        let Ok(raw_message) = report.data.canonical_json() else {
            return Verification::InvalidSignature;
        };
        match recover_address(raw_message.as_bytes(), &signature) {
            Ok(recovered) if recovered == report.data.hub_address => Verification::Valid,
            _ => Verification::InvalidSignature,
        }
    }

    /// Verify a report, mapping every failure to its authorization code.
    pub fn ensure_valid(&self, report: &HubReportVerifiableData) -> Result<(), WomError> {
        if report.data.hub_address.is_zero() {
            return Err(WomError::authorization(codes::EMPTY_HUB_ADDRESS));
        }
        if report.signature.trim().is_empty() {
            return Err(WomError::authorization(codes::EMPTY_SIGNED_MESSAGE));
        }
        match self.verify(report) {
            Verification::Valid => Ok(()),
            Verification::InvalidHash => {
                warn!(hub = %report.data.hub_address, hash = %report.hash, "report hash mismatch");
                Err(WomError::authorization(codes::WRONG_SIGNATURE_HASH))
            }
            Verification::InvalidSignature => {
                warn!(hub = %report.data.hub_address, hash = %report.hash, "report signature mismatch");
                Err(WomError::authorization(codes::INVALID_SIGNED_MESSAGE))
            }
        }
    }
}

/// Sign a payload as its hub would, producing the verification wrapper.
pub fn sign_report(signer: &EthSigner, data: HubReportData) -> Result<HubReportVerifiableData, WomError> {
    let raw_message = data.canonical_json()?;
    let signature = signer.sign_message(raw_message.as_bytes())?;
    let bytes = decode_hex(&signature)
        .ok_or_else(|| WomError::authorization(codes::INVALID_SIGNED_MESSAGE))?;
    Ok(HubReportVerifiableData {
        data,
        hash: keccak_hex(&bytes),
        signature,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use wom_core::Address;

    fn payload(hub: Address) -> HubReportData {
        HubReportData {
            hub_address: hub,
            deed_id: 1,
            from_date: 1_000,
            to_date: 2_000,
            period_type: "WEEK".into(),
            users_count: 10,
            participants_count: 5,
            recipients_count: 3,
            achievements_count: 40,
            reward_token_address: Address::from_bytes([7u8; 20]),
            reward_token_network_id: 137,
            hub_reward_amount: 12.5,
            transactions: ["0xAA".to_string()].into_iter().collect(),
        }
    }

    #[test]
    fn test_valid_report() {
        let signer = EthSigner::random();
        let report = sign_report(&signer, payload(signer.address())).unwrap();
        assert_eq!(SignatureVerifier::new().verify(&report), Verification::Valid);
        assert!(SignatureVerifier::new().ensure_valid(&report).is_ok());
    }

    #[test]
    fn test_hash_mismatch() {
        let signer = EthSigner::random();
        let mut report = sign_report(&signer, payload(signer.address())).unwrap();
        report.hash = keccak_hex(b"other");
        assert_eq!(SignatureVerifier::new().verify(&report), Verification::InvalidHash);
        let err = SignatureVerifier::new().ensure_valid(&report).unwrap_err();
        assert_eq!(err.code(), codes::WRONG_SIGNATURE_HASH);
    }

    #[test]
    fn test_hash_is_case_insensitive() {
        let signer = EthSigner::random();
        let mut report = sign_report(&signer, payload(signer.address())).unwrap();
        report.hash = report.hash.to_uppercase().replacen("0X", "0x", 1);
        assert!(SignatureVerifier::new().verify(&report).is_valid());
    }

    #[test]
    fn test_tampered_payload() {
        let signer = EthSigner::random();
        let mut report = sign_report(&signer, payload(signer.address())).unwrap();
        report.data.achievements_count += 1;
        assert_eq!(SignatureVerifier::new().verify(&report), Verification::InvalidSignature);
    }

    #[test]
    fn test_signed_by_another_wallet() {
        let hub = EthSigner::random();
        let intruder = EthSigner::random();
        let report = sign_report(&intruder, payload(hub.address())).unwrap();
        let err = SignatureVerifier::new().ensure_valid(&report).unwrap_err();
        assert_eq!(err.code(), codes::INVALID_SIGNED_MESSAGE);
    }

    #[test]
    fn test_transaction_case_does_not_change_signature() {
        let signer = EthSigner::random();
        let mut report = sign_report(&signer, payload(signer.address())).unwrap();
        report.data.transactions = ["0xaa".to_string()].into_iter().collect();
        assert!(SignatureVerifier::new().verify(&report).is_valid());
    }

    #[test]
    fn test_empty_signature() {
        let signer = EthSigner::random();
        let mut report = sign_report(&signer, payload(signer.address())).unwrap();
        report.signature = String::new();
        let err = SignatureVerifier::new().ensure_valid(&report).unwrap_err();
        assert_eq!(err.code(), codes::EMPTY_SIGNED_MESSAGE);
    }
}
