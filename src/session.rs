use crate::chain::{
    Address,
    ChainError,
    ChainHandle,
    Generation,
    LotteryContract,
    NetworkId,
    TxHash,
    WalletEvent,
    WalletProvider,
};
use std::sync::Arc;
use tokio::sync::{
    mpsc,
    watch,
};
use tracing::{
    debug,
    info,
    warn,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SessionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    WrongNetwork,
    Error,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no wallet provider available")]
    NoProvider,
    #[error("wallet granted no accounts")]
    NoAccounts,
    #[error("wallet is on network {actual}, expected {expected}")]
    WrongNetwork {
        expected: NetworkId,
        actual: NetworkId,
    },
    #[error("network switch failed: {0}")]
    SwitchFailed(ChainError),
    #[error("wallet provider error: {0}")]
    ProviderError(ChainError),
    #[error("operation not available while {0:?}")]
    InvalidState(SessionStatus),
    #[error("only the contract operator may do this")]
    Unauthorized,
    #[error("withdrawal failed: {0}")]
    WithdrawFailed(ChainError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Session {
    pub status: SessionStatus,
    pub address: Option<Address>,
    pub network_id: Option<NetworkId>,
    pub last_error: Option<SessionError>,
}

#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub required_network: NetworkId,
    pub contract: Address,
    pub operator: Option<Address>,
}

type Handle<W> = ChainHandle<<W as WalletProvider>::Contract>;

/// Owns the single wallet connection of the process.
///
/// The session value and the current [`ChainHandle`] are published through
/// `watch` channels; everything else observes them read-only. The handle is
/// always withdrawn before the session leaves `Connected` and only published
/// together with the transition into it.
pub struct SessionController<W: WalletProvider> {
    wallet: Option<Arc<W>>,
    settings: SessionSettings,
    session: watch::Sender<Session>,
    handle: watch::Sender<Option<Handle<W>>>,
    events: Option<mpsc::UnboundedReceiver<WalletEvent>>,
    next_generation: u64,
}

impl<W: WalletProvider> SessionController<W> {
    pub fn new(wallet: Option<W>, settings: SessionSettings) -> Self {
        let events = wallet.as_ref().map(WalletProvider::subscribe);
        let (session, _) = watch::channel(Session::default());
        let (handle, _) = watch::channel(None);
        Self {
            wallet: wallet.map(Arc::new),
            settings,
            session,
            handle,
            events,
            next_generation: 0,
        }
    }

    pub fn session(&self) -> Session {
        self.session.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.session.borrow().status
    }

    pub fn handle(&self) -> Option<Handle<W>> {
        self.handle.borrow().clone()
    }

    pub fn watch_handle(&self) -> watch::Receiver<Option<Handle<W>>> {
        self.handle.subscribe()
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn is_operator(&self) -> bool {
        let session = self.session.borrow();
        session.status == SessionStatus::Connected
            && self.settings.operator.is_some()
            && session.address == self.settings.operator
    }

    pub async fn connect(&mut self) -> Result<(), SessionError> {
        self.invalidate_handle();
        self.session.send_modify(|session| {
            session.status = SessionStatus::Connecting;
            session.last_error = None;
        });
        info!("connecting wallet");

        match self.establish().await {
            Ok(handle) => {
                info!(
                    account = %handle.account(),
                    network = handle.network(),
                    generation = %handle.generation(),
                    "wallet connected"
                );
                self.publish(handle);
                Ok(())
            }
            Err(err) => {
                self.fail(err.clone());
                Err(err)
            }
        }
    }

    /// Ask the wallet to move to the required network, then reconnect.
    pub async fn switch_network(&mut self) -> Result<(), SessionError> {
        let status = self.status();
        if status != SessionStatus::WrongNetwork {
            return Err(SessionError::InvalidState(status));
        }
        let wallet = self.wallet.clone().ok_or(SessionError::NoProvider)?;
        let required = self.settings.required_network;
        info!(network = required, "requesting network switch");
        if let Err(err) = wallet.switch_network(required).await {
            warn!(%err, "network switch rejected");
            let err = SessionError::SwitchFailed(err);
            self.session.send_modify(|session| {
                session.status = SessionStatus::WrongNetwork;
                session.last_error = Some(err.clone());
            });
            return Err(err);
        }
        self.connect().await
    }

    pub fn disconnect(&mut self) {
        self.invalidate_handle();
        self.session.send_replace(Session::default());
        info!("wallet disconnected");
    }

    /// Next notification from the wallet subscription. Pending forever when no
    /// wallet is configured or once the subscription has closed.
    pub async fn next_wallet_event(&mut self) -> Option<WalletEvent> {
        let Some(events) = self.events.as_mut() else {
            return std::future::pending().await;
        };
        let event = events.recv().await;
        if event.is_none() {
            warn!("wallet event subscription closed");
            self.events = None;
        }
        event
    }

    pub async fn handle_wallet_event(
        &mut self,
        event: WalletEvent,
    ) -> Result<(), SessionError> {
        match event {
            WalletEvent::AccountsChanged(accounts) => {
                self.accounts_changed(&accounts);
                Ok(())
            }
            WalletEvent::NetworkChanged(network) => {
                info!(network, "wallet network changed");
                if self.status() == SessionStatus::Disconnected {
                    self.session
                        .send_modify(|session| session.network_id = Some(network));
                    return Ok(());
                }
                self.connect().await
            }
        }
    }

    pub async fn withdraw_contract_balance(&self) -> Result<TxHash, SessionError> {
        let status = self.status();
        let handle = self.handle().ok_or(SessionError::InvalidState(status))?;
        if !self.is_operator() {
            return Err(SessionError::Unauthorized);
        }
        info!(operator = %handle.account(), "withdrawing contract balance");
        handle
            .contract()
            .withdraw_contract_balance(handle.account())
            .await
            .map_err(SessionError::WithdrawFailed)
    }

    async fn establish(&mut self) -> Result<Handle<W>, SessionError> {
        let wallet = self.wallet.clone().ok_or(SessionError::NoProvider)?;
        let accounts = wallet
            .request_accounts()
            .await
            .map_err(SessionError::ProviderError)?;
        let account = *accounts.first().ok_or(SessionError::NoAccounts)?;
        let network = wallet
            .network_id()
            .await
            .map_err(SessionError::ProviderError)?;
        self.session.send_modify(|session| {
            session.address = Some(account);
            session.network_id = Some(network);
        });

        let expected = self.settings.required_network;
        if network != expected {
            return Err(SessionError::WrongNetwork {
                expected,
                actual: network,
            });
        }
        Ok(self.bind(&wallet, account, network))
    }

    fn accounts_changed(&mut self, accounts: &[Address]) {
        let Some(&account) = accounts.first() else {
            info!("wallet reports no accounts");
            self.disconnect();
            return;
        };
        if self.session.borrow().address == Some(account) {
            return;
        }
        info!(%account, "wallet account changed");

        let rebind = match (self.status(), &self.wallet) {
            (SessionStatus::Connected, Some(wallet)) => {
                self.handle.borrow().as_ref().map(|h| (wallet.clone(), h.network()))
            }
            _ => None,
        };
        match rebind {
            Some((wallet, network)) => {
                self.invalidate_handle();
                let handle = self.bind(&wallet, account, network);
                self.session
                    .send_modify(|session| session.address = Some(account));
                self.publish(handle);
            }
            None => {
                self.session
                    .send_modify(|session| session.address = Some(account));
            }
        }
    }

    fn bind(&mut self, wallet: &W, account: Address, network: NetworkId) -> Handle<W> {
        self.next_generation += 1;
        let contract = wallet.bind(self.settings.contract);
        ChainHandle::new(Generation(self.next_generation), account, network, contract)
    }

    fn publish(&mut self, handle: Handle<W>) {
        self.session.send_modify(|session| {
            session.status = SessionStatus::Connected;
            session.address = Some(handle.account());
            session.network_id = Some(handle.network());
            session.last_error = None;
        });
        self.handle.send_replace(Some(handle));
    }

    fn invalidate_handle(&mut self) {
        let previous = self.handle.send_replace(None);
        if let Some(previous) = previous {
            debug!(generation = %previous.generation(), "chain handle invalidated");
        }
    }

    fn fail(&mut self, err: SessionError) {
        warn!(%err, "wallet connection failed");
        let status = match err {
            SessionError::WrongNetwork { .. } | SessionError::SwitchFailed(_) => {
                SessionStatus::WrongNetwork
            }
            _ => SessionStatus::Error,
        };
        self.session.send_modify(|session| {
            session.status = status;
            if matches!(err, SessionError::NoProvider | SessionError::NoAccounts) {
                session.address = None;
            }
            session.last_error = Some(err);
        });
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]
    use super::*;
    use crate::test_helpers::{
        FakeLottery,
        FakeWallet,
        alice,
        bob,
        operator,
        settings,
    };

    const SEPOLIA: NetworkId = 11_155_111;

    fn controller(wallet: FakeWallet) -> SessionController<FakeWallet> {
        SessionController::new(Some(wallet), settings(SEPOLIA))
    }

    #[tokio::test]
    async fn connect__granted_account_on_required_network__publishes_handle() {
        // given
        let wallet = FakeWallet::new(vec![alice()], SEPOLIA, FakeLottery::new());
        let mut session = controller(wallet);

        // when
        session.connect().await.unwrap();

        // then
        let state = session.session();
        assert_eq!(state.status, SessionStatus::Connected);
        assert_eq!(state.address, Some(alice()));
        assert_eq!(state.network_id, Some(SEPOLIA));
        let handle = session.handle().unwrap();
        assert_eq!(handle.account(), alice());
    }

    #[tokio::test]
    async fn connect__without_wallet__fails_with_no_provider() {
        // given
        let mut session: SessionController<FakeWallet> =
            SessionController::new(None, settings(SEPOLIA));

        // when
        let result = session.connect().await;

        // then
        assert_eq!(result, Err(SessionError::NoProvider));
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.handle().is_none());
    }

    #[tokio::test]
    async fn connect__wallet_grants_no_accounts__fails_with_no_accounts() {
        // given
        let wallet = FakeWallet::new(vec![], SEPOLIA, FakeLottery::new());
        let mut session = controller(wallet);

        // when
        let result = session.connect().await;

        // then
        assert_eq!(result, Err(SessionError::NoAccounts));
        assert_eq!(session.status(), SessionStatus::Error);
        assert!(session.handle().is_none());
    }

    #[tokio::test]
    async fn connect__wallet_on_other_network__enters_wrong_network_without_handle() {
        // given
        let wallet = FakeWallet::new(vec![alice()], 1, FakeLottery::new());
        let mut session = controller(wallet);

        // when
        let result = session.connect().await;

        // then
        assert_eq!(
            result,
            Err(SessionError::WrongNetwork {
                expected: SEPOLIA,
                actual: 1
            })
        );
        let state = session.session();
        assert_eq!(state.status, SessionStatus::WrongNetwork);
        assert_eq!(state.network_id, Some(1));
        assert!(session.handle().is_none());
    }

    #[tokio::test]
    async fn connect__provider_failure__enters_error_state() {
        // given
        let wallet = FakeWallet::new(vec![alice()], SEPOLIA, FakeLottery::new());
        wallet.fail_requests(ChainError::Transport("connection refused".into()));
        let mut session = controller(wallet);

        // when
        let result = session.connect().await;

        // then
        assert!(matches!(result, Err(SessionError::ProviderError(_))));
        assert_eq!(session.status(), SessionStatus::Error);
    }

    #[tokio::test]
    async fn switch_network__wallet_accepts__reenters_connected() {
        // given
        let wallet = FakeWallet::new(vec![alice()], 1, FakeLottery::new());
        let mut session = controller(wallet.clone());
        let _ = session.connect().await;

        // when
        session.switch_network().await.unwrap();

        // then
        assert_eq!(session.status(), SessionStatus::Connected);
        assert_eq!(wallet.network(), SEPOLIA);
        assert!(session.handle().is_some());
    }

    #[tokio::test]
    async fn switch_network__wallet_rejects__stays_wrong_network_with_switch_failed() {
        // given
        let wallet = FakeWallet::new(vec![alice()], 1, FakeLottery::new());
        wallet.reject_switch(ChainError::Rpc {
            code: 4902,
            message: "unrecognized chain".into(),
        });
        let mut session = controller(wallet);
        let _ = session.connect().await;

        // when
        let result = session.switch_network().await;

        // then
        assert!(matches!(result, Err(SessionError::SwitchFailed(_))));
        let state = session.session();
        assert_eq!(state.status, SessionStatus::WrongNetwork);
        assert!(matches!(state.last_error, Some(SessionError::SwitchFailed(_))));
        assert!(session.handle().is_none());
    }

    #[tokio::test]
    async fn switch_network__while_connected__is_rejected() {
        // given
        let wallet = FakeWallet::new(vec![alice()], SEPOLIA, FakeLottery::new());
        let mut session = controller(wallet);
        session.connect().await.unwrap();

        // when
        let result = session.switch_network().await;

        // then
        assert_eq!(
            result,
            Err(SessionError::InvalidState(SessionStatus::Connected))
        );
    }

    #[tokio::test]
    async fn handle_wallet_event__zero_accounts__disconnects_and_drops_handle() {
        // given
        let wallet = FakeWallet::new(vec![alice()], SEPOLIA, FakeLottery::new());
        let mut session = controller(wallet);
        session.connect().await.unwrap();

        // when
        session
            .handle_wallet_event(WalletEvent::AccountsChanged(vec![]))
            .await
            .unwrap();

        // then
        assert_eq!(session.session(), Session::default());
        assert!(session.handle().is_none());
    }

    #[tokio::test]
    async fn handle_wallet_event__new_account__rebinds_with_fresh_generation() {
        // given
        let wallet = FakeWallet::new(vec![alice()], SEPOLIA, FakeLottery::new());
        let mut session = controller(wallet);
        session.connect().await.unwrap();
        let before = session.handle().unwrap().generation();

        // when
        session
            .handle_wallet_event(WalletEvent::AccountsChanged(vec![bob()]))
            .await
            .unwrap();

        // then
        let handle = session.handle().unwrap();
        assert_eq!(handle.account(), bob());
        assert_ne!(handle.generation(), before);
        assert_eq!(session.session().address, Some(bob()));
        assert_eq!(session.status(), SessionStatus::Connected);
    }

    #[tokio::test]
    async fn handle_wallet_event__network_changed_away__invalidates_handle() {
        // given
        let wallet = FakeWallet::new(vec![alice()], SEPOLIA, FakeLottery::new());
        let mut session = controller(wallet.clone());
        session.connect().await.unwrap();

        // when
        wallet.set_network(1);
        let result = session
            .handle_wallet_event(WalletEvent::NetworkChanged(1))
            .await;

        // then
        assert!(matches!(result, Err(SessionError::WrongNetwork { .. })));
        assert_eq!(session.status(), SessionStatus::WrongNetwork);
        assert!(session.handle().is_none());
    }

    #[tokio::test]
    async fn next_wallet_event__emitted_by_wallet__is_delivered_once_subscribed() {
        // given
        let wallet = FakeWallet::new(vec![alice()], SEPOLIA, FakeLottery::new());
        let mut session = controller(wallet.clone());

        // when
        wallet.emit(WalletEvent::NetworkChanged(5));

        // then
        let event = session.next_wallet_event().await;
        assert_eq!(event, Some(WalletEvent::NetworkChanged(5)));
        assert_eq!(wallet.subscriptions(), 1);
    }

    #[tokio::test]
    async fn withdraw_contract_balance__non_operator__is_unauthorized() {
        // given
        let lottery = FakeLottery::new();
        let wallet = FakeWallet::new(vec![alice()], SEPOLIA, lottery.clone());
        let mut session = controller(wallet);
        session.connect().await.unwrap();

        // when
        let result = session.withdraw_contract_balance().await;

        // then
        assert_eq!(result, Err(SessionError::Unauthorized));
        assert!(lottery.withdrawals().is_empty());
    }

    #[tokio::test]
    async fn withdraw_contract_balance__operator__sends_single_call() {
        // given
        let lottery = FakeLottery::new();
        let wallet = FakeWallet::new(vec![operator()], SEPOLIA, lottery.clone());
        let mut session = controller(wallet);
        session.connect().await.unwrap();

        // when
        session.withdraw_contract_balance().await.unwrap();

        // then
        assert_eq!(lottery.withdrawals(), vec![operator()]);
    }
}
