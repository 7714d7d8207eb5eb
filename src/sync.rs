use crate::chain::{
    ChainError,
    ChainHandle,
    Generation,
    LotteryContract,
    U256,
    generation_of,
};
use chrono::{
    DateTime,
    Duration as ChronoDuration,
    Utc,
};
use futures::{
    FutureExt,
    future::BoxFuture,
};
use std::{
    fmt,
    sync::{
        Arc,
        atomic::{
            AtomicBool,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::{
        mpsc,
        oneshot,
        watch,
    },
    task::JoinHandle,
    time::{
        self,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
    warn,
};

const WEI_PER_ETHER: u64 = 1_000_000_000_000_000_000;
const ETHER_DECIMALS: usize = 18;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Open,
    Calculating,
    Closed,
}

impl TryFrom<u8> for Phase {
    type Error = SyncError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Phase::Open),
            1 => Ok(Phase::Calculating),
            2 => Ok(Phase::Closed),
            other => Err(SyncError::UnknownPhase(other)),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Phase::Open => "Open",
            Phase::Calculating => "Calculating",
            Phase::Closed => "Closed",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("no chain handle, wallet is not connected")]
    NotConnected,
    #[error("contract read failed: {0}")]
    Read(#[from] ChainError),
    #[error("contract reported unknown phase {0}")]
    UnknownPhase(u8),
    #[error("contract reported invalid winning numbers {0:?}")]
    InvalidNumbers([u8; 5]),
    #[error("contract reported unrepresentable timestamp {0}")]
    InvalidTimestamp(u64),
}

/// One consistent view of the lottery, read in a single refresh cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LotterySnapshot {
    pub phase: Phase,
    pub entrance_fee_wei: U256,
    pub player_count: u32,
    pub jackpot_wei: U256,
    pub round_start_at: DateTime<Utc>,
    pub last_draw_at: DateTime<Utc>,
    pub draw_interval_secs: u64,
    pub last_winning_numbers: Option<[u8; 5]>,
    pub seconds_to_next_draw: u64,
    pub generation: Generation,
    pub fetched_at: DateTime<Utc>,
}

impl LotterySnapshot {
    pub fn entrance_fee_ether(&self) -> String {
        format_ether(self.entrance_fee_wei, ETHER_DECIMALS)
    }

    pub fn jackpot_ether(&self) -> String {
        format_ether(self.jackpot_wei, 2)
    }

    /// Local time the next draw is due, as reported when this snapshot was read.
    pub fn draw_deadline(&self) -> DateTime<Utc> {
        let remaining = i64::try_from(self.seconds_to_next_draw).unwrap_or(i64::MAX);
        ChronoDuration::try_seconds(remaining)
            .and_then(|remaining| self.fetched_at.checked_add_signed(remaining))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

/// Render a wei amount in ether, truncated to `max_decimals` fractional digits
/// with trailing zeros removed.
pub fn format_ether(wei: U256, max_decimals: usize) -> String {
    let one_ether = U256::from(WEI_PER_ETHER);
    let whole = wei / one_ether;
    let fractional = wei % one_ether;
    let digits = format!("{:0>width$}", fractional.to_string(), width = ETHER_DECIMALS);
    let shown = &digits[..max_decimals.min(ETHER_DECIMALS)];
    let shown = shown.trim_end_matches('0');
    if shown.is_empty() {
        format!("{}", whole)
    } else {
        format!("{}.{}", whole, shown)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RefreshOutcome {
    Published(Arc<LotterySnapshot>),
    /// Another cycle was already in flight.
    Skipped,
    /// The handle changed while reading, the result was dropped.
    Discarded,
}

type Snapshots = watch::Sender<Option<Arc<LotterySnapshot>>>;

/// Reads lottery state through the current chain handle and publishes it as
/// a single replaceable snapshot.
pub struct StateSynchronizer<C> {
    handles: watch::Receiver<Option<ChainHandle<C>>>,
    snapshots: Arc<Snapshots>,
    in_flight: Arc<AtomicBool>,
}

impl<C> Clone for StateSynchronizer<C> {
    fn clone(&self) -> Self {
        Self {
            handles: self.handles.clone(),
            snapshots: Arc::clone(&self.snapshots),
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

impl<C: LotteryContract> StateSynchronizer<C> {
    pub fn new(handles: watch::Receiver<Option<ChainHandle<C>>>) -> Self {
        let (snapshots, _) = watch::channel(None);
        Self {
            handles,
            snapshots: Arc::new(snapshots),
            in_flight: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<LotterySnapshot>>> {
        self.snapshots.subscribe()
    }

    pub fn latest(&self) -> Option<Arc<LotterySnapshot>> {
        self.snapshots.borrow().clone()
    }

    /// Run one refresh cycle against the current handle.
    pub async fn refresh(&self) -> Result<RefreshOutcome, SyncError> {
        let current = self.handles.borrow().clone();
        let handle = current.ok_or(SyncError::NotConnected)?;
        let Some(_in_flight) = InFlight::acquire(&self.in_flight) else {
            debug!("refresh already in flight, skipping");
            return Ok(RefreshOutcome::Skipped);
        };

        let snapshot = read_snapshot(&handle).await?;

        let still_current = generation_of(self.handles.borrow().as_ref());
        if still_current != Some(snapshot.generation) {
            debug!(
                generation = %snapshot.generation,
                "discarding snapshot read through a stale handle"
            );
            return Ok(RefreshOutcome::Discarded);
        }
        let snapshot = Arc::new(snapshot);
        self.snapshots.send_replace(Some(Arc::clone(&snapshot)));
        Ok(RefreshOutcome::Published(snapshot))
    }

    /// Spawn the polling task. It refreshes every `period`, immediately
    /// whenever a new handle is published, and on request.
    pub fn start_polling(&self, period: Duration) -> Poller {
        let (requests, requests_rx) = RefreshRequester::channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(poll_loop(self.clone(), period, requests_rx, shutdown_rx));
        info!(period_secs = period.as_secs(), "lottery polling started");
        Poller {
            requests,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    fn clear(&self) {
        let previous = self.snapshots.send_replace(None);
        if previous.is_some() {
            debug!("snapshot cleared");
        }
    }

    fn cycle(&self) -> BoxFuture<'static, Result<RefreshOutcome, SyncError>> {
        let sync = self.clone();
        async move { sync.refresh().await }.boxed()
    }
}

struct InFlight(Arc<AtomicBool>);

impl InFlight {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| InFlight(Arc::clone(flag)))
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

async fn read_snapshot<C: LotteryContract>(
    handle: &ChainHandle<C>,
) -> Result<LotterySnapshot, SyncError> {
    let contract = handle.contract();
    let (details, player_count, phase, seconds_to_next_draw) = tokio::try_join!(
        contract.lottery_details(),
        contract.player_count(),
        contract.phase(),
        contract.seconds_to_next_draw(),
    )?;

    Ok(LotterySnapshot {
        phase: Phase::try_from(phase)?,
        entrance_fee_wei: details.entrance_fee,
        player_count,
        jackpot_wei: details.jackpot,
        round_start_at: timestamp(details.round_start_at)?,
        last_draw_at: timestamp(details.last_draw_at)?,
        draw_interval_secs: details.draw_interval,
        last_winning_numbers: winning_numbers_from(details.previous_draw)?,
        seconds_to_next_draw,
        generation: handle.generation(),
        fetched_at: Utc::now(),
    })
}

pub(crate) fn timestamp(secs: u64) -> Result<DateTime<Utc>, SyncError> {
    i64::try_from(secs)
        .ok()
        .and_then(|secs| DateTime::from_timestamp(secs, 0))
        .ok_or(SyncError::InvalidTimestamp(secs))
}

/// All zeros means no draw has happened yet.
fn winning_numbers_from(numbers: [u8; 5]) -> Result<Option<[u8; 5]>, SyncError> {
    if numbers == [0; 5] {
        return Ok(None);
    }
    if numbers.iter().all(|n| (1..=36).contains(n)) {
        Ok(Some(numbers))
    } else {
        Err(SyncError::InvalidNumbers(numbers))
    }
}

/// Cloneable way to ask a running [`Poller`] for an immediate refresh.
#[derive(Clone, Debug)]
pub struct RefreshRequester(mpsc::UnboundedSender<()>);

impl RefreshRequester {
    pub(crate) fn channel() -> (Self, mpsc::UnboundedReceiver<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self(tx), rx)
    }

    /// Returns false once the poller has stopped.
    pub fn request(&self) -> bool {
        self.0.send(()).is_ok()
    }
}

pub struct Poller {
    requests: RefreshRequester,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Poller {
    pub fn request_refresh(&self) -> bool {
        self.requests.request()
    }

    pub fn requester(&self) -> RefreshRequester {
        self.requests.clone()
    }

    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
        info!("lottery polling stopped");
    }
}

impl Drop for Poller {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn poll_loop<C: LotteryContract>(
    sync: StateSynchronizer<C>,
    period: Duration,
    mut requests: mpsc::UnboundedReceiver<()>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut handles = sync.handles.clone();
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut pending: Option<BoxFuture<'static, Result<RefreshOutcome, SyncError>>> = None;

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            changed = handles.changed() => {
                if changed.is_err() {
                    break;
                }
                pending = None;
                let generation = generation_of(handles.borrow_and_update().as_ref());
                match generation {
                    Some(generation) => {
                        debug!(%generation, "new chain handle, refreshing now");
                        pending = Some(sync.cycle());
                        ticker.reset();
                    }
                    None => {
                        debug!("chain handle withdrawn, polling paused");
                        sync.clear();
                    }
                }
            }
            _ = ticker.tick() => {
                start_cycle(&sync, &handles, &mut pending, "poll tick");
            }
            Some(()) = requests.recv() => {
                start_cycle(&sync, &handles, &mut pending, "refresh request");
            }
            result = wait_pending(&mut pending) => {
                pending = None;
                report(result);
            }
        }
    }
}

fn start_cycle<C: LotteryContract>(
    sync: &StateSynchronizer<C>,
    handles: &watch::Receiver<Option<ChainHandle<C>>>,
    pending: &mut Option<BoxFuture<'static, Result<RefreshOutcome, SyncError>>>,
    trigger: &'static str,
) {
    if pending.is_some() {
        debug!(trigger, "refresh in flight, skipped");
        return;
    }
    if handles.borrow().is_none() {
        return;
    }
    *pending = Some(sync.cycle());
}

async fn wait_pending<T>(pending: &mut Option<BoxFuture<'static, T>>) -> T {
    match pending.as_mut() {
        Some(future) => future.await,
        None => std::future::pending().await,
    }
}

fn report(result: Result<RefreshOutcome, SyncError>) {
    match result {
        Ok(RefreshOutcome::Published(snapshot)) => debug!(
            generation = %snapshot.generation,
            phase = %snapshot.phase,
            players = snapshot.player_count,
            "snapshot published"
        ),
        Ok(RefreshOutcome::Skipped) => debug!("refresh skipped"),
        Ok(RefreshOutcome::Discarded) => debug!("stale refresh discarded"),
        Err(err) => warn!(%err, "lottery refresh failed"),
    }
}
