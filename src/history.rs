use crate::{
    chain::{
        ChainError,
        ChainHandle,
        Generation,
        LotteryContract,
        RawDrawResult,
        U256,
    },
    sync::timestamp,
};
use chrono::{
    DateTime,
    Utc,
};
use futures::future::join_all;
use tracing::{
    info,
    warn,
};

/// Most rounds a single load will fetch.
pub const HISTORY_DEPTH: usize = 10;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum HistoryError {
    #[error("could not read the current round id: {0}")]
    RoundId(ChainError),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrawSummary {
    pub round_id: u64,
    pub drawn_at: Option<DateTime<Utc>>,
    pub winning_numbers: [u8; 5],
    pub prize_tiers: Vec<U256>,
    pub winner_counts: Vec<u64>,
}

impl DrawSummary {
    fn from_raw(round_id: u64, raw: RawDrawResult) -> Self {
        Self {
            round_id,
            drawn_at: timestamp(raw.timestamp).ok(),
            winning_numbers: raw.winning_numbers,
            prize_tiers: raw.prize_tiers,
            winner_counts: raw.winner_counts,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DrawRecord {
    Drawn(DrawSummary),
    Failed { round_id: u64, error: ChainError },
}

impl DrawRecord {
    pub fn round_id(&self) -> u64 {
        match self {
            DrawRecord::Drawn(summary) => summary.round_id,
            DrawRecord::Failed { round_id, .. } => *round_id,
        }
    }
}

/// Loaded history together with the handle generation it was read through.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct History {
    pub generation: Generation,
    pub records: Vec<DrawRecord>,
}

pub struct HistoryLoader<C> {
    handle: ChainHandle<C>,
}

impl<C: LotteryContract> HistoryLoader<C> {
    pub fn new(handle: ChainHandle<C>) -> Self {
        Self { handle }
    }

    /// Fetch the last `n` completed rounds, newest first. A round that fails
    /// to load stays in place as [`DrawRecord::Failed`].
    pub async fn load_recent(&self, n: usize) -> Result<History, HistoryError> {
        let contract = self.handle.contract();
        let current = contract.current_round_id().await.map_err(|err| {
            warn!(%err, "history unavailable");
            HistoryError::RoundId(err)
        })?;

        let depth = n.min(HISTORY_DEPTH) as u64;
        let rounds: Vec<u64> = (1..=depth)
            .map_while(|back| current.checked_sub(back).filter(|round| *round >= 1))
            .collect();

        let fetches = rounds.iter().map(|&round_id| async move {
            match contract.draw_result(round_id).await {
                Ok(raw) => DrawRecord::Drawn(DrawSummary::from_raw(round_id, raw)),
                Err(error) => {
                    warn!(round_id, %error, "draw result unavailable");
                    DrawRecord::Failed { round_id, error }
                }
            }
        });
        let records = join_all(fetches).await;
        info!(
            current_round = current,
            loaded = records.len(),
            "draw history loaded"
        );
        Ok(History {
            generation: self.handle.generation(),
            records,
        })
    }
}
