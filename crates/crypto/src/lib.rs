//! WoM Crypto
//!
//! Keccak hashing, Ethereum personal-message signatures and the report
//! signature verifier.

pub mod hash;
pub mod merkle;
pub mod sign;
pub mod verifier;

pub use hash::{decode_hex, keccak256, keccak_hex};
pub use merkle::compute_merkle_root;
pub use sign::{eth_message_hash, recover_address, verify_signed_message, EthSigner};
pub use verifier::{sign_report, SignatureVerifier, Verification};
