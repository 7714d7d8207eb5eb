//! In-memory wallet and contract used by unit and integration tests.

use crate::{
    chain::{
        Address,
        B256,
        ChainError,
        ChainHandle,
        Generation,
        LotteryContract,
        LotteryDetails,
        NetworkId,
        RawDrawResult,
        TxHash,
        U256,
        WalletEvent,
        WalletProvider,
    },
    session::SessionSettings,
    sync::{
        LotterySnapshot,
        Phase,
    },
};
use std::{
    collections::{
        HashMap,
        HashSet,
    },
    sync::{
        Arc,
        Mutex,
        atomic::{
            AtomicUsize,
            Ordering,
        },
    },
};
use tokio::sync::{
    Semaphore,
    mpsc,
};

pub const ONE_HUNDREDTH_ETHER: u64 = 10_000_000_000_000_000;

pub fn alice() -> Address {
    Address::repeat_byte(0xa1)
}

pub fn bob() -> Address {
    Address::repeat_byte(0xb0)
}

pub fn operator() -> Address {
    Address::repeat_byte(0x0e)
}

pub fn lottery_address() -> Address {
    Address::repeat_byte(0x55)
}

pub fn settings(required_network: NetworkId) -> SessionSettings {
    SessionSettings {
        required_network,
        contract: lottery_address(),
        operator: Some(operator()),
    }
}

pub fn draw(timestamp: u64, winning_numbers: [u8; 5]) -> RawDrawResult {
    RawDrawResult {
        timestamp,
        winning_numbers,
        prize_tiers: vec![U256::from(500u64), U256::from(50u64), U256::from(5u64)],
        winner_counts: vec![0, 1, 4],
    }
}

#[derive(Clone, Debug)]
pub struct FakeLotteryState {
    pub entrance_fee: U256,
    pub jackpot: U256,
    pub player_count: u32,
    pub phase: u8,
    pub round_start_at: u64,
    pub last_draw_at: u64,
    pub draw_interval: u64,
    pub seconds_to_next_draw: u64,
    pub last_winning_numbers: [u8; 5],
    pub current_round_id: u64,
    pub draws: HashMap<u64, RawDrawResult>,
    pub failing_rounds: HashSet<u64>,
    pub read_error: Option<ChainError>,
    pub submit_error: Option<ChainError>,
}

impl Default for FakeLotteryState {
    fn default() -> Self {
        Self {
            entrance_fee: U256::from(ONE_HUNDREDTH_ETHER),
            jackpot: U256::from(1_500_000_000_000_000_000u64),
            player_count: 3,
            phase: 0,
            round_start_at: 1_700_000_000,
            last_draw_at: 1_700_000_000,
            draw_interval: 3_600,
            seconds_to_next_draw: 45,
            last_winning_numbers: [0; 5],
            current_round_id: 1,
            draws: HashMap::new(),
            failing_rounds: HashSet::new(),
            read_error: None,
            submit_error: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RecordedSubmission {
    pub from: Address,
    pub numbers: [u8; 5],
    pub value: U256,
}

/// Lottery contract held in memory. Clones share state, so a test can keep one
/// copy while the session binds another.
#[derive(Clone, Default)]
pub struct FakeLottery {
    state: Arc<Mutex<FakeLotteryState>>,
    submissions: Arc<Mutex<Vec<RecordedSubmission>>>,
    withdrawals: Arc<Mutex<Vec<Address>>>,
    refresh_cycles: Arc<AtomicUsize>,
    gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
}

impl FakeLottery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, f: impl FnOnce(&mut FakeLotteryState)) {
        f(&mut self.state.lock().unwrap());
    }

    pub fn submissions(&self) -> Vec<RecordedSubmission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn withdrawals(&self) -> Vec<Address> {
        self.withdrawals.lock().unwrap().clone()
    }

    /// Number of times the round details were read, i.e. refresh cycles started.
    pub fn refresh_cycles(&self) -> usize {
        self.refresh_cycles.load(Ordering::SeqCst)
    }

    /// Hold every subsequent details read until [`FakeLottery::release`].
    pub fn hold_reads(&self) {
        *self.gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release(&self, reads: usize) {
        if let Some(gate) = self.gate.lock().unwrap().as_ref() {
            gate.add_permits(reads);
        }
    }

    pub fn open_gate(&self) {
        let gate = self.gate.lock().unwrap().take();
        if let Some(gate) = gate {
            gate.add_permits(Semaphore::MAX_PERMITS / 2);
        }
    }

    fn read<T>(&self, f: impl FnOnce(&FakeLotteryState) -> T) -> Result<T, ChainError> {
        let state = self.state.lock().unwrap();
        match &state.read_error {
            Some(err) => Err(err.clone()),
            None => Ok(f(&state)),
        }
    }

    async fn pass_gate(&self) {
        let gate = self.gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
    }
}

impl LotteryContract for FakeLottery {
    async fn lottery_details(&self) -> Result<LotteryDetails, ChainError> {
        self.refresh_cycles.fetch_add(1, Ordering::SeqCst);
        self.pass_gate().await;
        self.read(|s| LotteryDetails {
            entrance_fee: s.entrance_fee,
            jackpot: s.jackpot,
            previous_draw: s.last_winning_numbers,
            round_start_at: s.round_start_at,
            last_draw_at: s.last_draw_at,
            draw_interval: s.draw_interval,
        })
    }

    async fn player_count(&self) -> Result<u32, ChainError> {
        self.read(|s| s.player_count)
    }

    async fn phase(&self) -> Result<u8, ChainError> {
        self.read(|s| s.phase)
    }

    async fn seconds_to_next_draw(&self) -> Result<u64, ChainError> {
        self.read(|s| s.seconds_to_next_draw)
    }

    async fn current_round_id(&self) -> Result<u64, ChainError> {
        self.read(|s| s.current_round_id)
    }

    async fn draw_result(&self, round_id: u64) -> Result<RawDrawResult, ChainError> {
        let state = self.state.lock().unwrap();
        if state.failing_rounds.contains(&round_id) {
            return Err(ChainError::Rpc {
                code: -32000,
                message: format!("round {round_id} unavailable"),
            });
        }
        state
            .draws
            .get(&round_id)
            .cloned()
            .ok_or_else(|| ChainError::Decode(format!("no draw stored for {round_id}")))
    }

    async fn submit_ticket(
        &self,
        from: Address,
        numbers: [u8; 5],
        value: U256,
    ) -> Result<TxHash, ChainError> {
        self.submissions.lock().unwrap().push(RecordedSubmission {
            from,
            numbers,
            value,
        });
        match self.state.lock().unwrap().submit_error.clone() {
            Some(err) => Err(err),
            None => Ok(B256::repeat_byte(0x77)),
        }
    }

    async fn withdraw_contract_balance(&self, from: Address) -> Result<TxHash, ChainError> {
        self.withdrawals.lock().unwrap().push(from);
        Ok(B256::repeat_byte(0x88))
    }
}

#[derive(Debug, Default)]
struct FakeWalletState {
    accounts: Vec<Address>,
    network: NetworkId,
    request_error: Option<ChainError>,
    switch_error: Option<ChainError>,
    subscribers: Vec<mpsc::UnboundedSender<WalletEvent>>,
}

/// Wallet double that grants a fixed account list and lets tests fire
/// account/network notifications.
#[derive(Clone)]
pub struct FakeWallet {
    state: Arc<Mutex<FakeWalletState>>,
    lottery: FakeLottery,
}

impl FakeWallet {
    pub fn new(accounts: Vec<Address>, network: NetworkId, lottery: FakeLottery) -> Self {
        let state = FakeWalletState {
            accounts,
            network,
            ..FakeWalletState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            lottery,
        }
    }

    pub fn network(&self) -> NetworkId {
        self.state.lock().unwrap().network
    }

    pub fn set_network(&self, network: NetworkId) {
        self.state.lock().unwrap().network = network;
    }

    pub fn fail_requests(&self, err: ChainError) {
        self.state.lock().unwrap().request_error = Some(err);
    }

    pub fn reject_switch(&self, err: ChainError) {
        self.state.lock().unwrap().switch_error = Some(err);
    }

    pub fn subscriptions(&self) -> usize {
        self.state.lock().unwrap().subscribers.len()
    }

    pub fn emit(&self, event: WalletEvent) {
        let state = self.state.lock().unwrap();
        for subscriber in &state.subscribers {
            let _ = subscriber.send(event.clone());
        }
    }
}

impl WalletProvider for FakeWallet {
    type Contract = FakeLottery;

    async fn request_accounts(&self) -> Result<Vec<Address>, ChainError> {
        let state = self.state.lock().unwrap();
        match &state.request_error {
            Some(err) => Err(err.clone()),
            None => Ok(state.accounts.clone()),
        }
    }

    async fn network_id(&self) -> Result<NetworkId, ChainError> {
        Ok(self.state.lock().unwrap().network)
    }

    async fn switch_network(&self, network: NetworkId) -> Result<(), ChainError> {
        let mut state = self.state.lock().unwrap();
        if let Some(err) = &state.switch_error {
            return Err(err.clone());
        }
        state.network = network;
        Ok(())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<WalletEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state.lock().unwrap().subscribers.push(tx);
        rx
    }

    fn bind(&self, _contract: Address) -> FakeLottery {
        self.lottery.clone()
    }
}

pub fn chain_handle(
    generation: u64,
    account: Address,
    network: NetworkId,
    lottery: FakeLottery,
) -> ChainHandle<FakeLottery> {
    ChainHandle::new(Generation(generation), account, network, lottery)
}

pub fn snapshot(generation: u64, seconds_to_next_draw: u64) -> LotterySnapshot {
    let last_draw_at = chrono::DateTime::from_timestamp(1_700_000_000, 0).unwrap();
    LotterySnapshot {
        phase: Phase::Open,
        entrance_fee_wei: U256::from(ONE_HUNDREDTH_ETHER),
        player_count: 3,
        jackpot_wei: U256::from(1_500_000_000_000_000_000u64),
        round_start_at: last_draw_at,
        last_draw_at,
        draw_interval_secs: 3_600,
        last_winning_numbers: None,
        seconds_to_next_draw,
        generation: Generation(generation),
        fetched_at: chrono::Utc::now(),
    }
}
