use crate::{
    chain::{
        Address,
        ChainHandle,
        Generation,
        NetworkId,
        WalletEvent,
        WalletProvider,
        generation_of,
    },
    countdown::Countdown,
    deployment::{
        DeploymentEnv,
        DeploymentStore,
    },
    history::{
        DrawRecord,
        HISTORY_DEPTH,
        History,
        HistoryError,
        HistoryLoader,
    },
    rpc::JsonRpcWallet,
    session::{
        Session,
        SessionController,
        SessionError,
        SessionSettings,
        SessionStatus,
    },
    sync::{
        LotterySnapshot,
        Poller,
        StateSynchronizer,
    },
    ticket::{
        TicketComposer,
        TicketError,
    },
    ui,
};
use color_eyre::eyre::{
    Result,
    WrapErr,
    eyre,
};
use itertools::Itertools;
use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{
    mpsc,
    watch,
};
use tracing::{
    debug,
    info,
    warn,
};

pub const DEFAULT_SEPOLIA_RPC_URL: &str = "https://rpc.sepolia.org";
pub const DEFAULT_LOCAL_RPC_URL: &str = "http://127.0.0.1:8545";
pub const SEPOLIA_CHAIN_ID: NetworkId = 11_155_111;
pub const LOCAL_CHAIN_ID: NetworkId = 31_337;
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NetworkTarget {
    Sepolia { url: String },
    Local { url: String },
}

impl NetworkTarget {
    pub fn url(&self) -> &str {
        match self {
            NetworkTarget::Sepolia { url } | NetworkTarget::Local { url } => url,
        }
    }

    pub fn chain_id(&self) -> NetworkId {
        match self {
            NetworkTarget::Sepolia { .. } => SEPOLIA_CHAIN_ID,
            NetworkTarget::Local { .. } => LOCAL_CHAIN_ID,
        }
    }

    pub fn env(&self) -> DeploymentEnv {
        match self {
            NetworkTarget::Sepolia { .. } => DeploymentEnv::Sepolia,
            NetworkTarget::Local { .. } => DeploymentEnv::Local,
        }
    }

    pub fn explorer_url(&self, contract: Address) -> Option<String> {
        match self {
            NetworkTarget::Sepolia { .. } => {
                Some(format!("https://sepolia.etherscan.io/address/{contract}"))
            }
            NetworkTarget::Local { .. } => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub network: NetworkTarget,
    pub contract: Option<Address>,
    pub operator: Option<Address>,
    pub poll_interval: Duration,
    pub deployments_dir: PathBuf,
}

impl AppConfig {
    /// Fill in contract and operator from the deployment store where no flag
    /// set them.
    pub fn session_settings(&self) -> Result<SessionSettings> {
        let latest = if self.contract.is_some() && self.operator.is_some() {
            None
        } else {
            DeploymentStore::open(&self.deployments_dir, self.network.env()).latest()?
        };
        let contract = self
            .contract
            .or(latest.as_ref().map(|record| record.contract))
            .ok_or_else(|| {
                eyre!(
                    "No lottery contract for {}; pass --contract or record a deployment under {}",
                    self.network.env(),
                    self.deployments_dir.display()
                )
            })?;
        let operator = self
            .operator
            .or(latest.and_then(|record| record.operator));
        Ok(SessionSettings {
            required_network: self.network.chain_id(),
            contract,
            operator,
        })
    }
}

/// Everything the dashboard renders, captured at one point in time.
#[derive(Clone, Debug)]
pub struct AppView {
    pub session: Session,
    pub required_network: NetworkId,
    pub contract: Address,
    pub explorer_url: Option<String>,
    pub is_operator: bool,
    pub snapshot: Option<Arc<LotterySnapshot>>,
    pub countdown: Option<u64>,
    pub draft: Vec<u8>,
    pub history: Option<Vec<DrawRecord>>,
    pub status: String,
    pub errors: Vec<String>,
}

type Handle<W> = ChainHandle<<W as WalletProvider>::Contract>;
pub type HistoryResult = (Generation, Result<History, HistoryError>);

pub struct AppController<W: WalletProvider> {
    session: SessionController<W>,
    sync: StateSynchronizer<W::Contract>,
    poller: Poller,
    countdown: Countdown,
    composer: TicketComposer,
    history: Option<Vec<DrawRecord>>,
    history_tx: mpsc::UnboundedSender<HistoryResult>,
    explorer_url: Option<String>,
    status: String,
    errors: Vec<String>,
}

/// Channels the run loop selects on next to the controller itself.
pub struct AppFeeds<W: WalletProvider> {
    pub handles: watch::Receiver<Option<Handle<W>>>,
    pub snapshots: watch::Receiver<Option<Arc<LotterySnapshot>>>,
    pub countdown: watch::Receiver<Option<u64>>,
    pub history: mpsc::UnboundedReceiver<HistoryResult>,
}

impl<W: WalletProvider> AppController<W> {
    /// Must be called inside a tokio runtime; starts polling and the
    /// countdown right away.
    pub fn new(
        wallet: Option<W>,
        settings: SessionSettings,
        poll_interval: Duration,
        explorer_url: Option<String>,
    ) -> (Self, AppFeeds<W>) {
        let session = SessionController::new(wallet, settings);
        let sync = StateSynchronizer::new(session.watch_handle());
        let poller = sync.start_polling(poll_interval);
        let countdown = Countdown::spawn(sync.subscribe(), poller.requester());
        let (history_tx, history_rx) = mpsc::unbounded_channel();
        let feeds = AppFeeds {
            handles: session.watch_handle(),
            snapshots: sync.subscribe(),
            countdown: countdown.subscribe(),
            history: history_rx,
        };
        let controller = Self {
            session,
            sync,
            poller,
            countdown,
            composer: TicketComposer::new(),
            history: None,
            history_tx,
            explorer_url,
            status: String::from("Press c to connect your wallet"),
            errors: Vec::new(),
        };
        (controller, feeds)
    }

    pub fn view(&self) -> AppView {
        AppView {
            session: self.session.session(),
            required_network: self.session.settings().required_network,
            contract: self.session.settings().contract,
            explorer_url: self.explorer_url.clone(),
            is_operator: self.session.is_operator(),
            snapshot: self.sync.latest(),
            countdown: self.countdown.remaining(),
            draft: self.composer.numbers(),
            history: self.history.clone(),
            status: self.status.clone(),
            errors: self.errors.clone(),
        }
    }

    pub fn session(&self) -> Session {
        self.session.session()
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn draft(&self) -> Vec<u8> {
        self.composer.numbers()
    }

    pub fn history(&self) -> Option<&[DrawRecord]> {
        self.history.as_deref()
    }

    pub async fn connect(&mut self) {
        self.set_status("Connecting wallet...");
        match self.session.connect().await {
            Ok(()) => self.set_status("Wallet connected"),
            Err(err) => self.session_failed(err),
        }
    }

    pub async fn switch_network(&mut self) {
        match self.session.switch_network().await {
            Ok(()) => self.set_status("Switched network"),
            Err(err) => self.session_failed(err),
        }
    }

    pub fn disconnect(&mut self) {
        self.session.disconnect();
        self.set_status("Wallet disconnected");
    }

    pub async fn next_wallet_event(&mut self) -> Option<WalletEvent> {
        self.session.next_wallet_event().await
    }

    pub async fn handle_wallet_event(&mut self, event: WalletEvent) {
        if let Err(err) = self.session.handle_wallet_event(event).await {
            self.session_failed(err);
        }
    }

    pub fn toggle(&mut self, number: u8) {
        self.composer.toggle(number);
    }

    pub fn quick_pick(&mut self) {
        self.composer.quick_pick();
        self.set_status("Quick pick ready");
    }

    pub fn clear_draft(&mut self) {
        self.composer.clear();
    }

    pub async fn submit_ticket(&mut self) {
        let handle = self.session.handle();
        let snapshot = self.sync.latest();
        self.set_status("Submitting ticket...");
        match self
            .composer
            .submit(handle.as_ref(), snapshot.as_deref())
            .await
        {
            Ok(submission) => {
                let numbers = submission.numbers.iter().join(" ");
                self.set_status(format!(
                    "Ticket {numbers} entered (tx {})",
                    submission.tx_hash
                ));
                self.poller.request_refresh();
            }
            Err(err @ TicketError::SubmissionFailed(_)) => {
                self.push_error(err.to_string());
            }
            Err(err) => self.set_status(err.to_string()),
        }
    }

    pub fn request_refresh(&mut self) {
        self.poller.request_refresh();
        if let Some(handle) = self.session.handle() {
            self.load_history(handle);
        }
        self.set_status("Refreshing lottery state...");
    }

    pub async fn withdraw(&mut self) {
        match self.session.withdraw_contract_balance().await {
            Ok(tx_hash) => {
                self.set_status(format!("Contract balance withdrawn (tx {tx_hash})"));
                self.poller.request_refresh();
            }
            Err(err) => self.push_error(err.to_string()),
        }
    }

    /// React to a new or withdrawn chain handle.
    pub fn on_handle_changed(&mut self, handle: Option<Handle<W>>) {
        self.history = None;
        match handle {
            Some(handle) => self.load_history(handle),
            None => {
                if self.session.status() == SessionStatus::Disconnected {
                    self.composer.clear();
                }
            }
        }
    }

    pub fn ingest_history(&mut self, (generation, result): HistoryResult) {
        let current = generation_of(self.session.handle().as_ref());
        if current != Some(generation) {
            debug!(%generation, "discarding history for a stale handle");
            return;
        }
        match result {
            Ok(history) => self.history = Some(history.records),
            Err(err) => {
                self.history = Some(Vec::new());
                self.push_error(err.to_string());
            }
        }
    }

    pub async fn shutdown(mut self) {
        self.session.disconnect();
        self.poller.stop().await;
        info!("controller shut down");
    }

    fn load_history(&self, handle: Handle<W>) {
        let tx = self.history_tx.clone();
        tokio::spawn(async move {
            let generation = handle.generation();
            let result = HistoryLoader::new(handle).load_recent(HISTORY_DEPTH).await;
            let _ = tx.send((generation, result));
        });
    }

    fn session_failed(&mut self, err: SessionError) {
        let hint = match err {
            SessionError::WrongNetwork { .. } | SessionError::SwitchFailed(_) => {
                " (press n to switch network)"
            }
            _ => "",
        };
        self.push_error(format!("{err}{hint}"));
    }

    fn set_status(&mut self, message: impl Into<String>) {
        self.status = message.into();
        self.errors.clear();
    }

    fn push_error(&mut self, message: impl Into<String>) {
        let message = message.into();
        warn!(error = %message, "action failed");
        self.errors.push(message);
    }
}

pub async fn run_app(config: AppConfig) -> Result<()> {
    let settings = config
        .session_settings()
        .wrap_err("resolving lottery contract failed")?;
    let wallet = match JsonRpcWallet::new(config.network.url()) {
        Ok(wallet) => Some(wallet),
        Err(err) => {
            warn!(%err, url = config.network.url(), "wallet endpoint unusable");
            None
        }
    };
    let explorer_url = config.network.explorer_url(settings.contract);
    info!(
        contract = %settings.contract,
        network = settings.required_network,
        "starting fantasy-five client"
    );
    let (controller, feeds) =
        AppController::new(wallet, settings, config.poll_interval, explorer_url);
    let mut ui_state = ui::UiState::default();
    let mut input_events = ui::input_event_stream();

    ui::terminal_enter(&mut ui_state)?;
    info!("UI ready");
    let res = run_loop(controller, feeds, &mut ui_state, &mut input_events).await;
    ui::terminal_exit()?;
    res
}

async fn run_loop<W: WalletProvider>(
    mut controller: AppController<W>,
    mut feeds: AppFeeds<W>,
    ui_state: &mut ui::UiState,
    input_events: &mut ui::InputEvents,
) -> Result<()> {
    ui::draw(ui_state, &controller.view()).wrap_err("initial draw failed")?;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = controller.next_wallet_event() => {
                let Some(event) = event else {
                    warn!("wallet event subscription closed");
                    continue;
                };
                controller.handle_wallet_event(event).await;
            }
            changed = feeds.handles.changed() => {
                if changed.is_err() {
                    break;
                }
                let handle = feeds.handles.borrow_and_update().clone();
                controller.on_handle_changed(handle);
            }
            changed = feeds.snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                feeds.snapshots.borrow_and_update();
            }
            changed = feeds.countdown.changed() => {
                if changed.is_err() {
                    break;
                }
                feeds.countdown.borrow_and_update();
            }
            Some(loaded) = feeds.history.recv() => {
                controller.ingest_history(loaded);
            }
            raw_ev = ui::next_raw_event(input_events) => {
                let Some(intent) = ui::interpret_event(ui_state, raw_ev?) else {
                    continue;
                };
                match intent {
                    ui::UserEvent::Quit => break,
                    ui::UserEvent::Redraw => {}
                    ui::UserEvent::Connect => controller.connect().await,
                    ui::UserEvent::SwitchNetwork => controller.switch_network().await,
                    ui::UserEvent::Disconnect => controller.disconnect(),
                    ui::UserEvent::Toggle(number) => controller.toggle(number),
                    ui::UserEvent::QuickPick => controller.quick_pick(),
                    ui::UserEvent::Clear => controller.clear_draft(),
                    ui::UserEvent::Submit => {
                        let mut pending = controller.view();
                        pending.status = String::from("Waiting for confirmation...");
                        ui::draw(ui_state, &pending).wrap_err("draw before submit failed")?;
                        controller.submit_ticket().await;
                    }
                    ui::UserEvent::Refresh => controller.request_refresh(),
                    ui::UserEvent::Withdraw => controller.withdraw().await,
                }
            }
        }
        ui::draw(ui_state, &controller.view()).wrap_err("draw failed")?;
    }
    controller.shutdown().await;
    Ok(())
}
