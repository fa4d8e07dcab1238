use crate::error::{BlockchainError, Result};
use crate::utils::{
    base58_decode, base58_encode, new_key_pair, public_key_coordinates, ripemd160_digest,
    sha256_digest,
};
use serde::{Deserialize, Serialize};

const VERSION: u8 = 0x00;
pub const ADDRESS_CHECK_SUM_LEN: usize = 4;
const PUB_KEY_HASH_LEN: usize = 20;

/// A P-256 key pair: the PKCS#8 document plus the raw `X || Y` public key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Wallet {
    pkcs8: Vec<u8>,
    public_key: Vec<u8>,
}

impl Wallet {
    pub fn new() -> Result<Wallet> {
        let pkcs8 = new_key_pair()?;
        let public_key = public_key_coordinates(&pkcs8)?;
        Ok(Wallet { pkcs8, public_key })
    }

    /// Base58Check of `version || RIPEMD160(SHA256(public_key))`
    pub fn get_address(&self) -> String {
        convert_address(&hash_pub_key(self.public_key.as_slice()))
    }

    pub fn get_public_key(&self) -> &[u8] {
        self.public_key.as_slice()
    }

    pub fn get_pkcs8(&self) -> &[u8] {
        self.pkcs8.as_slice()
    }
}

/// The lock hash outputs are locked to
pub fn hash_pub_key(pub_key: &[u8]) -> Vec<u8> {
    ripemd160_digest(sha256_digest(pub_key).as_slice())
}

fn checksum(payload: &[u8]) -> Vec<u8> {
    let second_sha = sha256_digest(sha256_digest(payload).as_slice());
    second_sha[0..ADDRESS_CHECK_SUM_LEN].to_vec()
}

pub fn validate_address(address: &str) -> bool {
    address_to_pub_key_hash(address).is_ok()
}

/// Decodes an address back to its lock hash, checking length and checksum
pub fn address_to_pub_key_hash(address: &str) -> Result<Vec<u8>> {
    let payload = base58_decode(address)?;
    if payload.len() != 1 + PUB_KEY_HASH_LEN + ADDRESS_CHECK_SUM_LEN {
        return Err(BlockchainError::InvalidAddress(format!(
            "{address}: unexpected length"
        )));
    }

    let (versioned_hash, actual_checksum) = payload.split_at(payload.len() - ADDRESS_CHECK_SUM_LEN);
    if checksum(versioned_hash) != actual_checksum {
        return Err(BlockchainError::InvalidAddress(format!(
            "{address}: checksum mismatch"
        )));
    }
    Ok(versioned_hash[1..].to_vec())
}

pub fn convert_address(pub_hash_key: &[u8]) -> String {
    let mut payload: Vec<u8> = vec![VERSION];
    payload.extend(pub_hash_key);
    let checksum = checksum(payload.as_slice());
    payload.extend(checksum.as_slice());
    base58_encode(payload.as_slice())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_round_trip() {
        let wallet = Wallet::new().unwrap();
        let address = wallet.get_address();

        assert!(validate_address(&address));
        assert_eq!(
            address_to_pub_key_hash(&address).unwrap(),
            hash_pub_key(wallet.get_public_key())
        );
        assert_eq!(wallet.get_public_key().len(), 64);
    }

    #[test]
    fn test_corrupted_address_rejected() {
        let wallet = Wallet::new().unwrap();
        let mut payload = base58_decode(&wallet.get_address()).unwrap();
        let last = payload.len() - 1;
        payload[last] ^= 0x01;

        let tampered = base58_encode(&payload);
        assert!(!validate_address(&tampered));
        assert!(matches!(
            address_to_pub_key_hash(&tampered),
            Err(BlockchainError::InvalidAddress(_))
        ));
        assert!(!validate_address("not-an-address"));
        assert!(!validate_address(""));
    }
}
