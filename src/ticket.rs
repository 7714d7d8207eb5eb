use crate::{
    chain::{
        ChainError,
        ChainHandle,
        LotteryContract,
        TxHash,
        U256,
    },
    sync::LotterySnapshot,
};
use itertools::Itertools;
use rand::{
    Rng,
    seq::SliceRandom,
};
use std::collections::BTreeSet;
use tracing::{
    error,
    info,
};

pub const TICKET_SIZE: usize = 5;
pub const LOWEST_NUMBER: u8 = 1;
pub const HIGHEST_NUMBER: u8 = 36;

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TicketError {
    #[error("a ticket needs exactly 5 numbers, {0} selected")]
    InvalidSelection(usize),
    #[error("not ready to submit: {0}")]
    NotReady(&'static str),
    #[error("ticket submission failed: {0}")]
    SubmissionFailed(ChainError),
}

/// Numbers the player has picked so far, kept sorted.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TicketDraft(BTreeSet<u8>);

impl TicketDraft {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn numbers(&self) -> Vec<u8> {
        self.0.iter().copied().collect()
    }

    fn as_ticket(&self) -> Option<[u8; TICKET_SIZE]> {
        self.numbers().try_into().ok()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub tx_hash: TxHash,
    pub numbers: [u8; TICKET_SIZE],
    pub paid_wei: U256,
}

#[derive(Debug, Default)]
pub struct TicketComposer {
    draft: TicketDraft,
}

impl TicketComposer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn draft(&self) -> &TicketDraft {
        &self.draft
    }

    /// Ascending view of the current selection.
    pub fn numbers(&self) -> Vec<u8> {
        self.draft.numbers()
    }

    /// Add `number` if absent and there is room, remove it if present.
    /// Anything else is ignored.
    pub fn toggle(&mut self, number: u8) {
        if !(LOWEST_NUMBER..=HIGHEST_NUMBER).contains(&number) {
            return;
        }
        if !self.draft.0.remove(&number) && self.draft.len() < TICKET_SIZE {
            self.draft.0.insert(number);
        }
    }

    pub fn quick_pick(&mut self) {
        self.quick_pick_with(&mut rand::rng());
    }

    /// Replace the selection with five distinct numbers drawn uniformly.
    pub fn quick_pick_with<R: Rng + ?Sized>(&mut self, rng: &mut R) {
        let mut pool: Vec<u8> = (LOWEST_NUMBER..=HIGHEST_NUMBER).collect();
        let (picked, _) = pool.partial_shuffle(rng, TICKET_SIZE);
        self.draft = TicketDraft(picked.iter().copied().collect());
    }

    pub fn clear(&mut self) {
        self.draft = TicketDraft::default();
    }

    /// Pay the entrance fee and enter the drafted numbers, ascending. The
    /// draft is only cleared once the transaction is confirmed.
    pub async fn submit<C: LotteryContract>(
        &mut self,
        handle: Option<&ChainHandle<C>>,
        snapshot: Option<&LotterySnapshot>,
    ) -> Result<Submission, TicketError> {
        let numbers = self
            .draft
            .as_ticket()
            .ok_or(TicketError::InvalidSelection(self.draft.len()))?;
        let handle = handle.ok_or(TicketError::NotReady("wallet not connected"))?;
        let snapshot = snapshot.ok_or(TicketError::NotReady("entrance fee not known yet"))?;
        if snapshot.generation != handle.generation() {
            return Err(TicketError::NotReady("lottery state is still loading"));
        }

        let fee = snapshot.entrance_fee_wei;
        info!(
            account = %handle.account(),
            numbers = %numbers.iter().join(","),
            fee_wei = %fee,
            "submitting ticket"
        );
        match handle
            .contract()
            .submit_ticket(handle.account(), numbers, fee)
            .await
        {
            Ok(tx_hash) => {
                info!(%tx_hash, "ticket confirmed");
                self.clear();
                Ok(Submission {
                    tx_hash,
                    numbers,
                    paid_wei: fee,
                })
            }
            Err(err) => {
                error!(%err, "ticket submission failed");
                Err(TicketError::SubmissionFailed(err))
            }
        }
    }
}
