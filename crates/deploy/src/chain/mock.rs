//! In-memory chain used by tests.
//!
//! Contracts have no real code. Their observable state is modelled with
//! [`Effect`]s: a mined call whose selector has a registered effect writes a
//! value that later `eth_call`s to a getter can read back.

use std::{
    collections::{HashMap, HashSet},
    sync::{Mutex, MutexGuard},
};

use alloy_core::primitives::{Address, B256, Bytes, Selector, U256, keccak256};

use super::{ChainClient, PreparedTx, Receipt, TxRequest, TxStatus};
use crate::{
    abi::{self, AbiArg},
    error::ChainError,
};

const WORD: usize = 32;

/// Chain id used by [`MockChain::default`], matching a local dev node.
pub const MOCK_CHAIN_ID: u64 = 31337;

/// State written when a call with a given selector is mined.
#[derive(Debug, Clone)]
pub struct Effect {
    getter: String,
    key_args: Vec<usize>,
    value: EffectValue,
}

#[derive(Debug, Clone)]
enum EffectValue {
    True,
    Arg(usize),
}

impl Effect {
    /// After the call, `getter()` returns `true`.
    pub fn flag(getter: &str) -> Self {
        Self {
            getter: getter.to_string(),
            key_args: vec![],
            value: EffectValue::True,
        }
    }

    /// After the call, `getter()` returns the call's argument at `index`.
    pub fn store(getter: &str, index: usize) -> Self {
        Self {
            getter: getter.to_string(),
            key_args: vec![],
            value: EffectValue::Arg(index),
        }
    }

    /// After the call, `getter(arg[key])` returns `true`.
    pub fn mark(getter: &str, key: usize) -> Self {
        Self {
            getter: getter.to_string(),
            key_args: vec![key],
            value: EffectValue::True,
        }
    }

    /// After the call, `getter(arg[key])` returns the argument at `value`.
    pub fn store_keyed(getter: &str, key: usize, value: usize) -> Self {
        Self {
            getter: getter.to_string(),
            key_args: vec![key],
            value: EffectValue::Arg(value),
        }
    }

    /// Computes the storage slot (view calldata) and value written by `input`.
    fn apply(&self, input: &[u8]) -> Option<(Vec<u8>, Vec<u8>)> {
        let word = |index: usize| input.get(4 + index * WORD..4 + (index + 1) * WORD);

        let mut slot = abi::selector(&self.getter).to_vec();
        for index in &self.key_args {
            slot.extend_from_slice(word(*index)?);
        }

        let value = match self.value {
            EffectValue::True => abi::encode_params(&[AbiArg::Bool(true)]),
            EffectValue::Arg(index) => word(index)?.to_vec(),
        };

        Some((slot, value))
    }
}

#[derive(Default)]
struct MockState {
    tx_count: u64,
    nonce: u64,
    code: HashMap<Address, Bytes>,
    storage: HashMap<(Address, Vec<u8>), Vec<u8>>,
    balances: HashMap<Address, U256>,
    effects: HashMap<Selector, Vec<Effect>>,
    receipts: HashMap<B256, Receipt>,
    pending: HashMap<B256, TxRequest>,
    sent: Vec<TxRequest>,
    failing: HashMap<Selector, usize>,
    fail_at: HashSet<u64>,
    hold_next: bool,
    lose_next_reply: bool,
}

/// An in-memory [`ChainClient`].
pub struct MockChain {
    chain_id: u64,
    state: Mutex<MockState>,
}

impl Default for MockChain {
    fn default() -> Self {
        Self::new(MOCK_CHAIN_ID)
    }
}

impl MockChain {
    pub fn new(chain_id: u64) -> Self {
        Self {
            chain_id,
            state: Mutex::new(MockState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only happens after a panicking test thread.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register the state written by calls to `signature`.
    pub fn with_effect(self, signature: &str, effect: Effect) -> Self {
        self.state()
            .effects
            .entry(abi::selector(signature))
            .or_default()
            .push(effect);
        self
    }

    /// The next `times` transactions calling `signature` revert.
    pub fn fail_method(&self, signature: &str, times: usize) {
        self.state()
            .failing
            .insert(abi::selector(signature), times);
    }

    /// The `n`-th transaction sent from now on (1-based) reverts.
    pub fn fail_nth_transaction(&self, n: u64) {
        let mut state = self.state();
        let target = state.tx_count + n;
        state.fail_at.insert(target);
    }

    /// The next transaction is broadcast but stays unmined.
    pub fn hold_next_transaction(&self) {
        self.state().hold_next = true;
    }

    /// The next broadcast reaches the chain but its reply is lost, as with a
    /// transport timeout after the node accepted the transaction.
    pub fn lose_next_reply(&self) {
        self.state().lose_next_reply = true;
    }

    /// Mine every held transaction.
    pub fn mine_pending(&self) {
        let mut state = self.state();
        let pending = std::mem::take(&mut state.pending);
        for (hash, tx) in pending {
            Self::mine(&mut state, hash, tx, false);
        }
    }

    /// Forget every held transaction, as a node evicting its mempool would.
    pub fn drop_pending(&self) {
        self.state().pending.clear();
    }

    pub fn transaction_count(&self) -> usize {
        self.state().sent.len()
    }

    /// Number of broadcast contract creations.
    pub fn deployment_count(&self) -> usize {
        self.state().sent.iter().filter(|tx| tx.to.is_none()).count()
    }

    /// Number of broadcast transactions calling `signature`.
    pub fn calls_to(&self, signature: &str) -> usize {
        let selector = abi::selector(signature);
        self.state()
            .sent
            .iter()
            .filter(|tx| tx.to.is_some() && tx.input.starts_with(selector.as_slice()))
            .count()
    }

    fn mine(state: &mut MockState, tx_hash: B256, tx: TxRequest, revert: bool) {
        let selector = tx
            .input
            .get(..4)
            .map(Selector::from_slice)
            .filter(|_| tx.to.is_some());

        let forced = selector.is_some_and(|selector| match state.failing.get_mut(&selector) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        });
        let success = !(revert || forced);

        let mut contract_address = None;
        if success {
            match tx.to {
                None => {
                    let address = Address::from_word(keccak256(tx_hash));
                    state.code.insert(address, tx.input.clone());
                    contract_address = Some(address);
                }
                Some(to) => {
                    let effects = selector
                        .and_then(|selector| state.effects.get(&selector))
                        .cloned()
                        .unwrap_or_default();
                    for effect in effects {
                        if let Some((slot, value)) = effect.apply(&tx.input) {
                            state.storage.insert((to, slot), value);
                        }
                    }
                    if !tx.value.is_zero() {
                        *state.balances.entry(to).or_default() += tx.value;
                    }
                }
            }
        }

        let receipt = Receipt {
            tx_hash,
            success,
            contract_address,
            block_number: Some(state.tx_count),
        };
        state.receipts.insert(tx_hash, receipt);
    }
}

impl ChainClient for MockChain {
    fn chain_id(&self) -> u64 {
        self.chain_id
    }

    async fn prepare_transaction(&self, tx: TxRequest) -> Result<PreparedTx, ChainError> {
        let mut state = self.state();
        state.nonce += 1;
        let mut material = tx.from.to_vec();
        material.extend_from_slice(&state.nonce.to_be_bytes());
        Ok(PreparedTx {
            request: tx,
            tx_hash: Some(keccak256(material)),
            raw: None,
        })
    }

    async fn broadcast(&self, tx: PreparedTx) -> Result<B256, ChainError> {
        let mut state = self.state();
        state.tx_count += 1;
        let count = state.tx_count;
        let tx_hash = tx.tx_hash.unwrap_or_else(|| keccak256(count.to_be_bytes()));
        let revert = state.fail_at.remove(&count);
        state.sent.push(tx.request.clone());

        if std::mem::take(&mut state.hold_next) {
            state.pending.insert(tx_hash, tx.request);
        } else {
            Self::mine(&mut state, tx_hash, tx.request, revert);
        }

        if std::mem::take(&mut state.lose_next_reply) {
            return Err(ChainError::Transport {
                method: "eth_sendRawTransaction".to_string(),
                source: anyhow::anyhow!("operation timed out"),
            });
        }
        Ok(tx_hash)
    }

    async fn transaction_status(&self, tx_hash: B256) -> Result<TxStatus, ChainError> {
        let state = self.state();
        if let Some(receipt) = state.receipts.get(&tx_hash) {
            return Ok(TxStatus::Confirmed(receipt.clone()));
        }
        Ok(if state.pending.contains_key(&tx_hash) {
            TxStatus::Pending
        } else {
            TxStatus::Unknown
        })
    }

    async fn wait_for_receipt(&self, tx_hash: B256) -> Result<Receipt, ChainError> {
        self.state()
            .receipts
            .get(&tx_hash)
            .cloned()
            .ok_or(ChainError::Timeout(tx_hash))
    }

    async fn call(&self, to: Address, input: Bytes) -> Result<Bytes, ChainError> {
        let state = self.state();
        if !state.code.contains_key(&to) {
            return Ok(Bytes::new());
        }
        Ok(state
            .storage
            .get(&(to, input.to_vec()))
            .cloned()
            .unwrap_or_else(|| vec![0u8; WORD])
            .into())
    }

    async fn code_at(&self, address: Address) -> Result<Bytes, ChainError> {
        Ok(self.state().code.get(&address).cloned().unwrap_or_default())
    }

    async fn balance_of(&self, address: Address) -> Result<U256, ChainError> {
        Ok(self
            .state()
            .balances
            .get(&address)
            .copied()
            .unwrap_or_default())
    }
}
