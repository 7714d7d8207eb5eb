use crate::sync::{
    LotterySnapshot,
    RefreshRequester,
};
use chrono::{
    DateTime,
    Utc,
};
use std::{
    sync::Arc,
    time::Duration,
};
use tokio::{
    sync::watch,
    task::JoinHandle,
    time::{
        self,
        Instant,
        MissedTickBehavior,
    },
};
use tracing::{
    debug,
    info,
};

const SECOND: Duration = Duration::from_secs(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Tick {
    /// Nothing to count, either unseeded or already halted at zero.
    Idle,
    Remaining(u64),
    /// This tick reached zero.
    Elapsed,
}

/// Local seconds-to-draw counter. Remote state always wins: every seed
/// replaces whatever the clock had counted down to.
#[derive(Clone, Debug, Default)]
pub struct CountdownClock {
    remaining: Option<u64>,
}

impl CountdownClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(&mut self, seconds: u64) {
        self.remaining = Some(seconds);
    }

    /// Seed from an absolute deadline. Partial seconds round up, a deadline in
    /// the past seeds zero.
    pub fn seed_until(&mut self, deadline: DateTime<Utc>, now: DateTime<Utc>) {
        let millis = (deadline - now).num_milliseconds().max(0) as u64;
        self.seed(millis.div_ceil(1_000));
    }

    pub fn clear(&mut self) {
        self.remaining = None;
    }

    pub fn remaining(&self) -> Option<u64> {
        self.remaining
    }

    pub fn tick(&mut self) -> Tick {
        match self.remaining {
            None | Some(0) => Tick::Idle,
            Some(1) => {
                self.remaining = Some(0);
                Tick::Elapsed
            }
            Some(n) => {
                self.remaining = Some(n - 1);
                Tick::Remaining(n - 1)
            }
        }
    }
}

/// Drives a [`CountdownClock`] from the published snapshots on a one second
/// timer and asks for a resync when the draw time is reached.
pub struct Countdown {
    remaining: watch::Receiver<Option<u64>>,
    task: JoinHandle<()>,
}

impl Countdown {
    pub fn spawn(
        snapshots: watch::Receiver<Option<Arc<LotterySnapshot>>>,
        resync: RefreshRequester,
    ) -> Self {
        let (remaining_tx, remaining) = watch::channel(None);
        let task = tokio::spawn(countdown_loop(snapshots, remaining_tx, resync));
        Self { remaining, task }
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<u64>> {
        self.remaining.clone()
    }

    pub fn remaining(&self) -> Option<u64> {
        *self.remaining.borrow()
    }
}

impl Drop for Countdown {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn countdown_loop(
    mut snapshots: watch::Receiver<Option<Arc<LotterySnapshot>>>,
    remaining: watch::Sender<Option<u64>>,
    resync: RefreshRequester,
) {
    let mut clock = CountdownClock::new();
    let mut ticker = time::interval_at(Instant::now() + SECOND, SECOND);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    let initial = snapshots.borrow_and_update().clone();
    reseed(&mut clock, initial.as_deref());
    remaining.send_replace(clock.remaining());

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                reseed(&mut clock, snapshot.as_deref());
                ticker.reset();
                remaining.send_replace(clock.remaining());
            }
            _ = ticker.tick() => match clock.tick() {
                Tick::Idle => {}
                Tick::Remaining(seconds) => {
                    remaining.send_replace(Some(seconds));
                }
                Tick::Elapsed => {
                    remaining.send_replace(Some(0));
                    info!("draw time reached, requesting resync");
                    if !resync.request() {
                        debug!("poller gone, resync request dropped");
                    }
                }
            },
        }
    }
}

fn reseed(clock: &mut CountdownClock, snapshot: Option<&LotterySnapshot>) {
    match snapshot {
        Some(snapshot) => clock.seed_until(snapshot.draw_deadline(), Utc::now()),
        None => clock.clear(),
    }
}
