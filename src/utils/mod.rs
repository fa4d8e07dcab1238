//! Utility functions and helpers
//!
//! Hashing, signing, Base58 and bincode helpers shared by the ledger,
//! the wallet and the peer protocol.

pub mod crypto;
pub mod serialization;

pub use crypto::{
    base58_decode, base58_encode, current_timestamp, ecdsa_p256_sha256_sign_digest,
    ecdsa_p256_sha256_sign_verify, new_key_pair, public_key_coordinates, ripemd160_digest,
    sha256_digest, PUBLIC_KEY_LEN, SIGNATURE_LEN,
};

pub use serialization::{deserialize, serialize};
