// Value transfer: inputs consume earlier outputs, outputs lock value to a public key hash.
// Signing and verification never touch the store; callers hand in the previous
// transactions each input refers to, keyed by hex transaction id.

use crate::error::{BlockchainError, Result};
use crate::storage::UTXOSet;
use crate::utils::{
    deserialize, ecdsa_p256_sha256_sign_digest, ecdsa_p256_sha256_sign_verify, serialize,
    sha256_digest,
};
use crate::wallet::{address_to_pub_key_hash, hash_pub_key, Wallet};
use data_encoding::HEXLOWER;
use log::warn;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

/// Reward paid by every coinbase transaction
pub const SUBSIDY: i64 = 10;

/// Output index carried by the single input of a coinbase transaction
pub const COINBASE_OUTPUT_INDEX: i64 = -1;

/// Previous transactions an input set refers to, keyed by hex id
pub type PrevTransactions = HashMap<String, Transaction>;

/// A reference to one earlier output plus the proof that the spender owns it
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXInput {
    txid: Vec<u8>,
    vout: i64,
    signature: Vec<u8>,
    pub_key: Vec<u8>,
}

impl TXInput {
    /// An unsigned input spending output `vout` of transaction `txid`
    pub fn new(txid: &[u8], vout: usize) -> TXInput {
        TXInput {
            txid: txid.to_vec(),
            vout: vout as i64,
            signature: vec![],
            pub_key: vec![],
        }
    }

    pub fn get_txid(&self) -> &[u8] {
        self.txid.as_slice()
    }

    pub fn get_vout(&self) -> i64 {
        self.vout
    }

    /// The referenced output index, `None` for the coinbase placeholder
    pub fn output_index(&self) -> Option<usize> {
        usize::try_from(self.vout).ok()
    }

    pub fn get_signature(&self) -> &[u8] {
        self.signature.as_slice()
    }

    pub fn get_pub_key(&self) -> &[u8] {
        self.pub_key.as_slice()
    }

    pub fn set_pub_key(&mut self, pub_key: &[u8]) {
        self.pub_key = pub_key.to_vec();
    }

    /// Whether the public key carried by this input hashes to `pub_key_hash`
    pub fn uses_key(&self, pub_key_hash: &[u8]) -> bool {
        hash_pub_key(self.pub_key.as_slice()).eq(pub_key_hash)
    }
}

/// Value locked to the RIPEMD160(SHA256(pubkey)) of its owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct TXOutput {
    value: i64,
    pub_key_hash: Vec<u8>,
}

impl TXOutput {
    /// Locks `value` to the owner of `address`
    pub fn new(value: i64, address: &str) -> Result<TXOutput> {
        let pub_key_hash = address_to_pub_key_hash(address)?;
        TXOutput::new_locked(value, &pub_key_hash)
    }

    /// Locks `value` directly to a public key hash
    pub fn new_locked(value: i64, pub_key_hash: &[u8]) -> Result<TXOutput> {
        if value <= 0 {
            return Err(BlockchainError::Transaction(
                "Output value must be positive".to_string(),
            ));
        }
        Ok(TXOutput {
            value,
            pub_key_hash: pub_key_hash.to_vec(),
        })
    }

    pub fn get_value(&self) -> i64 {
        self.value
    }

    pub fn get_pub_key_hash(&self) -> &[u8] {
        self.pub_key_hash.as_slice()
    }

    pub fn is_locked_with_key(&self, pub_key_hash: &[u8]) -> bool {
        self.pub_key_hash.eq(pub_key_hash)
    }
}

/// Surviving outputs of one transaction, keyed by their original output index.
///
/// Spent indices are removed rather than shifted so a `(txid, index)` pair
/// keeps pointing at the same output after partial spends.
#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct TXOutputs {
    outputs: BTreeMap<usize, TXOutput>,
}

impl TXOutputs {
    pub fn new() -> TXOutputs {
        TXOutputs::default()
    }

    /// Every output of a freshly mined transaction, indices `0..n`
    pub fn from_outputs(outputs: &[TXOutput]) -> TXOutputs {
        TXOutputs {
            outputs: outputs.iter().cloned().enumerate().collect(),
        }
    }

    pub fn insert(&mut self, index: usize, output: TXOutput) {
        self.outputs.insert(index, output);
    }

    pub fn remove(&mut self, index: usize) -> Option<TXOutput> {
        self.outputs.remove(&index)
    }

    pub fn get(&self, index: usize) -> Option<&TXOutput> {
        self.outputs.get(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &TXOutput)> {
        self.outputs.iter().map(|(idx, out)| (*idx, out))
    }

    pub fn len(&self) -> usize {
        self.outputs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outputs.is_empty()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<TXOutputs> {
        deserialize(bytes)
    }
}

#[derive(
    Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct Transaction {
    id: Vec<u8>,
    vin: Vec<TXInput>,
    vout: Vec<TXOutput>,
}

impl Transaction {
    /// Builds a transaction and assigns `id = SHA256(serialize(tx with blank id))`
    pub fn new(vin: Vec<TXInput>, vout: Vec<TXOutput>) -> Result<Transaction> {
        if vin.is_empty() || vout.is_empty() {
            return Err(BlockchainError::Transaction(
                "Transaction needs at least one input and one output".to_string(),
            ));
        }
        let mut tx = Transaction {
            id: vec![],
            vin,
            vout,
        };
        tx.id = tx.hash()?;
        Ok(tx)
    }

    /// Reward transaction paying [`SUBSIDY`] to `to`.
    ///
    /// The single input has no previous transaction and index -1; `data` rides in
    /// its public key slot. An empty `data` is replaced by random bytes so that
    /// repeated rewards to one address still get distinct ids.
    pub fn new_coinbase_tx(to: &str, data: &str) -> Result<Transaction> {
        let txout = TXOutput::new(SUBSIDY, to)?;
        let payload = if data.is_empty() {
            Uuid::new_v4().as_bytes().to_vec()
        } else {
            data.as_bytes().to_vec()
        };
        let tx_input = TXInput {
            txid: vec![],
            vout: COINBASE_OUTPUT_INDEX,
            signature: vec![],
            pub_key: payload,
        };
        Transaction::new(vec![tx_input], vec![txout])
    }

    /// Spends outputs owned by `wallet` to pay `amount` to `to`, returning change
    /// to the wallet. Fails with `InsufficientFunds` when the index cannot cover it.
    pub fn new_utxo_transaction(
        wallet: &Wallet,
        to: &str,
        amount: i64,
        utxo_set: &UTXOSet,
    ) -> Result<Transaction> {
        if amount <= 0 {
            return Err(BlockchainError::Transaction(
                "Amount must be positive".to_string(),
            ));
        }

        let to_pub_key_hash = address_to_pub_key_hash(to)?;
        let from_pub_key_hash = hash_pub_key(wallet.get_public_key());
        let (accumulated, valid_outputs) =
            utxo_set.find_spendable_outputs(from_pub_key_hash.as_slice(), amount)?;

        if accumulated < amount {
            return Err(BlockchainError::InsufficientFunds {
                required: amount,
                available: accumulated,
            });
        }

        let mut inputs = vec![];
        for (txid_hex, outs) in valid_outputs {
            let txid = HEXLOWER.decode(txid_hex.as_bytes()).map_err(|e| {
                BlockchainError::Transaction(format!("Invalid transaction ID: {e}"))
            })?;
            for out in outs {
                let mut input = TXInput::new(txid.as_slice(), out);
                input.set_pub_key(wallet.get_public_key());
                inputs.push(input);
            }
        }

        let mut outputs = vec![TXOutput::new_locked(amount, &to_pub_key_hash)?];
        if accumulated > amount {
            outputs.push(TXOutput::new_locked(
                accumulated - amount,
                &from_pub_key_hash,
            )?);
        }

        let mut tx = Transaction::new(inputs, outputs)?;
        utxo_set
            .get_blockchain()
            .sign_transaction(&mut tx, wallet.get_pkcs8())?;
        Ok(tx)
    }

    pub fn is_coinbase(&self) -> bool {
        self.vin.len() == 1
            && self.vin[0].txid.is_empty()
            && self.vin[0].vout == COINBASE_OUTPUT_INDEX
    }

    /// Copy with every signature and public key cleared
    fn trimmed_copy(&self) -> Transaction {
        let vin = self
            .vin
            .iter()
            .map(|input| TXInput {
                txid: input.txid.clone(),
                vout: input.vout,
                signature: vec![],
                pub_key: vec![],
            })
            .collect();
        Transaction {
            id: self.id.clone(),
            vin,
            vout: self.vout.clone(),
        }
    }

    /// Digest signed for input `idx`: the trimmed copy with that input's public key
    /// slot temporarily holding the lock hash of the output it spends.
    fn signing_digest(tx_copy: &mut Transaction, idx: usize, lock_hash: &[u8]) -> Result<Vec<u8>> {
        tx_copy.vin[idx].signature = vec![];
        tx_copy.vin[idx].pub_key = lock_hash.to_vec();
        let digest = tx_copy.hash();
        tx_copy.vin[idx].pub_key = vec![];
        digest
    }

    fn previous_output<'a>(
        input: &TXInput,
        prev_txs: &'a PrevTransactions,
    ) -> Result<Option<&'a TXOutput>> {
        let txid_hex = HEXLOWER.encode(input.get_txid());
        let prev_tx = prev_txs.get(&txid_hex).ok_or_else(|| {
            BlockchainError::Transaction(format!(
                "Previous transaction {txid_hex} is missing; the ledger is inconsistent"
            ))
        })?;
        Ok(input
            .output_index()
            .and_then(|index| prev_tx.vout.get(index)))
    }

    /// Signs every input with `pkcs8`. A coinbase transaction is left untouched.
    pub fn sign(&mut self, pkcs8: &[u8], prev_txs: &PrevTransactions) -> Result<()> {
        if self.is_coinbase() {
            return Ok(());
        }

        let mut tx_copy = self.trimmed_copy();
        for idx in 0..self.vin.len() {
            let lock_hash = Transaction::previous_output(&self.vin[idx], prev_txs)?
                .ok_or_else(|| {
                    BlockchainError::Transaction(format!(
                        "Input {idx} spends an output that does not exist"
                    ))
                })?
                .get_pub_key_hash()
                .to_vec();

            let digest = Transaction::signing_digest(&mut tx_copy, idx, &lock_hash)?;
            self.vin[idx].signature = ecdsa_p256_sha256_sign_digest(pkcs8, &digest)?;
        }
        Ok(())
    }

    /// Checks every input's signature against the digest it was signed over.
    ///
    /// Returns `Ok(false)` for a bad signature, a key that does not own the spent
    /// output, or a dangling output index. A previous transaction absent from
    /// `prev_txs` is an error, not a verification failure.
    pub fn verify(&self, prev_txs: &PrevTransactions) -> Result<bool> {
        if self.is_coinbase() {
            return Ok(true);
        }

        let mut tx_copy = self.trimmed_copy();
        for (idx, vin) in self.vin.iter().enumerate() {
            let prev_output = match Transaction::previous_output(vin, prev_txs)? {
                Some(out) => out,
                None => {
                    warn!(
                        "Input {idx} of {} references a missing output",
                        HEXLOWER.encode(self.get_id())
                    );
                    return Ok(false);
                }
            };

            if !vin.uses_key(prev_output.get_pub_key_hash()) {
                return Ok(false);
            }

            let digest =
                Transaction::signing_digest(&mut tx_copy, idx, prev_output.get_pub_key_hash())?;
            if !ecdsa_p256_sha256_sign_verify(
                vin.pub_key.as_slice(),
                vin.signature.as_slice(),
                digest.as_slice(),
            ) {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn hash(&self) -> Result<Vec<u8>> {
        let tx_copy = Transaction {
            id: vec![],
            vin: self.vin.clone(),
            vout: self.vout.clone(),
        };
        Ok(sha256_digest(tx_copy.serialize()?.as_slice()))
    }

    pub fn get_id(&self) -> &[u8] {
        self.id.as_slice()
    }

    pub fn get_vin(&self) -> &[TXInput] {
        self.vin.as_slice()
    }

    pub fn get_vout(&self) -> &[TXOutput] {
        self.vout.as_slice()
    }

    pub fn serialize(&self) -> Result<Vec<u8>> {
        serialize(self)
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Transaction> {
        deserialize(bytes)
    }

    #[cfg(test)]
    pub(crate) fn vout_mut(&mut self) -> &mut Vec<TXOutput> {
        &mut self.vout
    }

    #[cfg(test)]
    pub(crate) fn vin_mut(&mut self) -> &mut Vec<TXInput> {
        &mut self.vin
    }
}
