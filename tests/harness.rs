#![allow(non_snake_case)]

use fantasy_five::{
    chain::{
        ChainError,
        U256,
        WalletEvent,
    },
    client::{
        AppConfig,
        AppController,
        AppFeeds,
        NetworkTarget,
    },
    history::DrawRecord,
    session::{
        SessionController,
        SessionStatus,
    },
    sync::{
        RefreshOutcome,
        StateSynchronizer,
        SyncError,
    },
    test_helpers::{
        FakeLottery,
        FakeWallet,
        ONE_HUNDREDTH_ETHER,
        RecordedSubmission,
        alice,
        bob,
        draw,
        operator,
        settings,
    },
};
use std::time::Duration;
use tempdir::TempDir;
use tokio::time;

const SEPOLIA: u64 = 11_155_111;
const MAINNET: u64 = 1;
const POLL: Duration = Duration::from_secs(30);

type App = AppController<FakeWallet>;
type Feeds = AppFeeds<FakeWallet>;

fn app(wallet: &FakeWallet) -> (App, Feeds) {
    AppController::new(Some(wallet.clone()), settings(SEPOLIA), POLL, None)
}

fn lottery_with_rounds(current: u64) -> FakeLottery {
    let lottery = FakeLottery::new();
    lottery.update(|s| {
        s.current_round_id = current;
        for round in 1..current {
            s.draws.insert(round, draw(1_700_000_000 + round * 3_600, [3, 9, 14, 22, 30]));
        }
    });
    lottery
}

async fn settle() {
    time::sleep(Duration::from_millis(10)).await;
}

// Does what the run loop does with handle and history updates.
async fn pump(controller: &mut App, feeds: &mut Feeds) {
    settle().await;
    if feeds.handles.has_changed().unwrap_or(false) {
        let handle = feeds.handles.borrow_and_update().clone();
        controller.on_handle_changed(handle);
        settle().await;
    }
    while let Ok(loaded) = feeds.history.try_recv() {
        controller.ingest_history(loaded);
    }
}

async fn deliver_next_wallet_event(controller: &mut App) {
    let event = controller
        .next_wallet_event()
        .await
        .expect("wallet subscription open");
    controller.handle_wallet_event(event).await;
}

fn current_generation(feeds: &Feeds) -> Option<String> {
    feeds
        .handles
        .borrow()
        .as_ref()
        .map(|handle| handle.generation().to_string())
}

#[tokio::test(start_paused = true)]
async fn submit_ticket__after_first_poll__pays_entrance_fee_once() {
    // given
    let lottery = FakeLottery::new();
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);
    controller.connect().await;
    pump(&mut controller, &mut feeds).await;
    for n in [36, 7, 19, 2, 11] {
        controller.toggle(n);
    }

    // when
    controller.submit_ticket().await;

    // then
    assert_eq!(
        lottery.submissions(),
        vec![RecordedSubmission {
            from: alice(),
            numbers: [2, 7, 11, 19, 36],
            value: U256::from(ONE_HUNDREDTH_ETHER),
        }]
    );
    assert!(controller.draft().is_empty());
    assert!(
        controller.status().starts_with("Ticket 2 7 11 19 36 entered"),
        "{}",
        controller.status()
    );
    assert!(controller.errors().is_empty());
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn submit_ticket__before_first_snapshot__sends_nothing() {
    // given
    let lottery = FakeLottery::new();
    lottery.hold_reads();
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);
    controller.connect().await;
    pump(&mut controller, &mut feeds).await;
    controller.quick_pick();

    // when
    controller.submit_ticket().await;

    // then
    assert!(lottery.submissions().is_empty());
    assert_eq!(controller.draft().len(), 5);
    assert!(controller.status().contains("not ready"), "{}", controller.status());
    lottery.open_gate();
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn submit_ticket__reverted__reports_error_and_keeps_draft() {
    // given
    let lottery = FakeLottery::new();
    lottery.update(|s| s.submit_error = Some(ChainError::Transport("nonce too low".into())));
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);
    controller.connect().await;
    pump(&mut controller, &mut feeds).await;
    for n in 1..=5 {
        controller.toggle(n);
    }

    // when
    controller.submit_ticket().await;

    // then
    assert_eq!(controller.draft(), vec![1, 2, 3, 4, 5]);
    assert_eq!(controller.errors().len(), 1);
    assert!(controller.errors()[0].contains("nonce too low"));
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn accounts_changed__to_none__disconnects_and_clears_everything() {
    // given
    let lottery = lottery_with_rounds(3);
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);
    controller.connect().await;
    pump(&mut controller, &mut feeds).await;
    assert!(controller.view().snapshot.is_some());
    assert!(controller.history().is_some());
    controller.toggle(4);
    controller.toggle(8);

    // when
    wallet.emit(WalletEvent::AccountsChanged(Vec::new()));
    deliver_next_wallet_event(&mut controller).await;
    pump(&mut controller, &mut feeds).await;

    // then
    let view = controller.view();
    assert_eq!(view.session.status, SessionStatus::Disconnected);
    assert_eq!(view.session.address, None);
    assert!(view.snapshot.is_none());
    assert!(view.history.is_none());
    assert!(view.draft.is_empty());
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn accounts_changed__during_poll__never_publishes_the_old_accounts_state() {
    // given
    let lottery = FakeLottery::new();
    lottery.hold_reads();
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);
    controller.connect().await;
    settle().await;
    assert_eq!(lottery.refresh_cycles(), 1);

    // when
    wallet.emit(WalletEvent::AccountsChanged(vec![bob()]));
    deliver_next_wallet_event(&mut controller).await;
    pump(&mut controller, &mut feeds).await;
    let before_release = controller.view().snapshot;
    lottery.open_gate();
    settle().await;

    // then
    assert!(before_release.is_none());
    let view = controller.view();
    assert_eq!(view.session.address, Some(bob()));
    assert_eq!(
        view.snapshot.map(|snap| snap.generation.to_string()),
        current_generation(&feeds)
    );
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn ingest_history__loaded_through_replaced_handle__is_discarded() {
    // given
    let lottery = lottery_with_rounds(4);
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);
    controller.connect().await;
    settle().await;
    let first = feeds.handles.borrow_and_update().clone();
    controller.on_handle_changed(first);
    wallet.emit(WalletEvent::AccountsChanged(vec![bob()]));
    deliver_next_wallet_event(&mut controller).await;
    settle().await;

    // when
    let stale = feeds.history.try_recv().expect("first load finished");
    controller.ingest_history(stale);

    // then
    assert!(controller.history().is_none());

    // when
    pump(&mut controller, &mut feeds).await;

    // then
    let rounds: Vec<u64> = controller
        .history()
        .expect("history for the new handle")
        .iter()
        .map(DrawRecord::round_id)
        .collect();
    assert_eq!(rounds, vec![3, 2, 1]);
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn connect__wrong_network__can_be_fixed_by_switching() {
    // given
    let lottery = FakeLottery::new();
    let wallet = FakeWallet::new(vec![alice()], MAINNET, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);

    // when
    controller.connect().await;

    // then
    assert_eq!(controller.session().status, SessionStatus::WrongNetwork);
    assert!(controller.errors()[0].contains("press n"));

    // when
    controller.switch_network().await;
    pump(&mut controller, &mut feeds).await;

    // then
    assert_eq!(controller.session().status, SessionStatus::Connected);
    assert_eq!(wallet.network(), SEPOLIA);
    assert!(controller.view().snapshot.is_some());
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn withdraw__operator_and_player__only_operator_succeeds() {
    // given
    let lottery = FakeLottery::new();
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);
    controller.connect().await;
    pump(&mut controller, &mut feeds).await;

    // when
    controller.withdraw().await;

    // then
    assert!(lottery.withdrawals().is_empty());
    assert!(controller.errors()[0].contains("operator"));

    // when
    wallet.emit(WalletEvent::AccountsChanged(vec![operator()]));
    deliver_next_wallet_event(&mut controller).await;
    pump(&mut controller, &mut feeds).await;
    controller.withdraw().await;

    // then
    assert!(controller.view().is_operator);
    assert_eq!(lottery.withdrawals(), vec![operator()]);
    assert!(controller.status().starts_with("Contract balance withdrawn"));
    controller.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn countdown__after_first_poll__counts_down_every_second() {
    // given
    let lottery = FakeLottery::new();
    lottery.update(|s| s.seconds_to_next_draw = 600);
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let (mut controller, mut feeds) = app(&wallet);
    controller.connect().await;
    pump(&mut controller, &mut feeds).await;
    let start = controller.view().countdown.expect("countdown seeded");

    // when
    time::sleep(Duration::from_secs(3)).await;

    // then
    let later = controller.view().countdown.expect("countdown running");
    assert!(later < start, "{later} should be below {start}");
    assert!(start <= 600);
    controller.shutdown().await;
}

#[tokio::test]
async fn refresh__after_wallet_drops_every_account__is_not_connected() {
    // given
    let lottery = FakeLottery::new();
    let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
    let mut session = SessionController::new(Some(wallet.clone()), settings(SEPOLIA));
    session.connect().await.unwrap();
    let synchronizer = StateSynchronizer::new(session.watch_handle());
    assert!(matches!(
        synchronizer.refresh().await,
        Ok(RefreshOutcome::Published(_))
    ));

    // when
    wallet.emit(WalletEvent::AccountsChanged(Vec::new()));
    let event = session.next_wallet_event().await.expect("wallet subscription open");
    session.handle_wallet_event(event).await.unwrap();
    let cycles_before = lottery.refresh_cycles();

    // then
    assert_eq!(session.status(), SessionStatus::Disconnected);
    assert_eq!(synchronizer.refresh().await, Err(SyncError::NotConnected));
    assert_eq!(lottery.refresh_cycles(), cycles_before);
}

#[test]
fn session_settings__nothing_recorded__fails_without_creating_the_store() {
    // given
    let root = TempDir::new("deployments").unwrap();
    let config = AppConfig {
        network: NetworkTarget::Local {
            url: "http://127.0.0.1:8545".to_string(),
        },
        contract: None,
        operator: None,
        poll_interval: POLL,
        deployments_dir: root.path().join(".deployments"),
    };

    // when
    let result = config.session_settings();

    // then
    let err = result.unwrap_err().to_string();
    assert!(err.contains("No lottery contract"), "{err}");
    assert!(!root.path().join(".deployments").exists());
}
