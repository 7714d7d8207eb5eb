//! Adapter boundary between the client core and the chain.
//!
//! A [`WalletProvider`] stands in for the user's wallet: it hands out accounts,
//! reports the active network and pushes change notifications. Binding it to a
//! contract address yields a [`LotteryContract`], which exposes the raw read and
//! write surface of the lottery contract without interpreting any of it.

pub use alloy_primitives::{
    Address,
    B256,
    U256,
};
use std::{
    fmt,
    future::Future,
    sync::Arc,
};
use tokio::sync::mpsc;

pub type NetworkId = u64;
pub type TxHash = B256;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ChainError {
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("rpc error {code}: {message}")]
    Rpc { code: i64, message: String },
    #[error("malformed response: {0}")]
    Decode(String),
    #[error("transaction {0} reverted")]
    Reverted(TxHash),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WalletEvent {
    AccountsChanged(Vec<Address>),
    NetworkChanged(NetworkId),
}

/// Raw per-round result as stored by the contract.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDrawResult {
    pub timestamp: u64,
    pub winning_numbers: [u8; 5],
    pub prize_tiers: Vec<U256>,
    pub winner_counts: Vec<u64>,
}

pub trait WalletProvider: Send + Sync + 'static {
    type Contract: LotteryContract;

    fn request_accounts(
        &self,
    ) -> impl Future<Output = Result<Vec<Address>, ChainError>> + Send;

    fn network_id(&self) -> impl Future<Output = Result<NetworkId, ChainError>> + Send;

    fn switch_network(
        &self,
        network: NetworkId,
    ) -> impl Future<Output = Result<(), ChainError>> + Send;

    /// Open the account/network notification stream. Called once per session
    /// controller lifetime.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<WalletEvent>;

    fn bind(&self, contract: Address) -> Self::Contract;
}

/// Round parameters returned together by the contract's details getter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LotteryDetails {
    pub entrance_fee: U256,
    pub jackpot: U256,
    /// All zeros until the first draw has happened.
    pub previous_draw: [u8; 5],
    pub round_start_at: u64,
    pub last_draw_at: u64,
    pub draw_interval: u64,
}

pub trait LotteryContract: Send + Sync + 'static {
    fn lottery_details(
        &self,
    ) -> impl Future<Output = Result<LotteryDetails, ChainError>> + Send;

    fn player_count(&self) -> impl Future<Output = Result<u32, ChainError>> + Send;

    fn phase(&self) -> impl Future<Output = Result<u8, ChainError>> + Send;

    fn seconds_to_next_draw(
        &self,
    ) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn current_round_id(&self) -> impl Future<Output = Result<u64, ChainError>> + Send;

    fn draw_result(
        &self,
        round_id: u64,
    ) -> impl Future<Output = Result<RawDrawResult, ChainError>> + Send;

    /// Resolves once the transaction is mined.
    fn submit_ticket(
        &self,
        from: Address,
        numbers: [u8; 5],
        value: U256,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;

    fn withdraw_contract_balance(
        &self,
        from: Address,
    ) -> impl Future<Output = Result<TxHash, ChainError>> + Send;
}

/// Identifies one published [`ChainHandle`]. Every new handle gets a fresh one,
/// so in-flight work can tell whether the wiring it started on is still current.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Generation(pub(crate) u64);

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Live, revocable capability to use the lottery contract as one account on
/// one network.
pub struct ChainHandle<C> {
    generation: Generation,
    account: Address,
    network: NetworkId,
    contract: Arc<C>,
}

impl<C> ChainHandle<C> {
    pub(crate) fn new(
        generation: Generation,
        account: Address,
        network: NetworkId,
        contract: C,
    ) -> Self {
        Self {
            generation,
            account,
            network,
            contract: Arc::new(contract),
        }
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn account(&self) -> Address {
        self.account
    }

    pub fn network(&self) -> NetworkId {
        self.network
    }

    pub fn contract(&self) -> &C {
        &self.contract
    }
}

impl<C> Clone for ChainHandle<C> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            account: self.account,
            network: self.network,
            contract: Arc::clone(&self.contract),
        }
    }
}

impl<C> fmt::Debug for ChainHandle<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainHandle")
            .field("generation", &self.generation)
            .field("account", &self.account)
            .field("network", &self.network)
            .finish_non_exhaustive()
    }
}

/// Current generation of an optional handle, for staleness checks.
pub fn generation_of<C>(handle: Option<&ChainHandle<C>>) -> Option<Generation> {
    handle.map(ChainHandle::generation)
}
