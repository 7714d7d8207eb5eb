//! JSON-RPC implementation of the wallet and contract boundary.
//!
//! Talks HTTP JSON-RPC 2.0 to a wallet-backed node (a local dev node or a
//! signing proxy exposing `eth_requestAccounts`/`eth_sendTransaction`).
//! Account and network notifications are synthesised by polling.

use crate::chain::{
    Address,
    ChainError,
    LotteryContract,
    LotteryDetails,
    NetworkId,
    RawDrawResult,
    TxHash,
    U256,
    WalletEvent,
    WalletProvider,
};
use alloy_primitives::Bytes;
use alloy_sol_types::{
    SolCall,
    sol,
};
use serde::{
    Deserialize,
    de::DeserializeOwned,
};
use serde_json::{
    Value,
    json,
};
use std::{
    future::Future,
    sync::{
        Arc,
        atomic::{
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};
use tokio::{
    sync::mpsc,
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

const METHOD_NOT_FOUND: i64 = -32601;
const DEFAULT_WATCH_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_RECEIPT_INTERVAL: Duration = Duration::from_secs(2);

sol! {
    interface IFantasyFive {
        function viewLotteryState() external view returns (uint8);
        function getLotteryDetails() external view returns (
            uint256 entranceFee,
            uint256 jackpot,
            uint8[5] previousDraw,
            uint256 roundStartTimestamp,
            uint256 lastDrawTimestamp,
            uint256 intervalForDraw
        );
        function getCurrentDrawPlayerDetails() external view returns (
            address[] players,
            uint256 numberOfPlayers
        );
        /// Seconds remaining, not an absolute time.
        function timestampForNextDraw() external view returns (uint256);
        function currentRoundId() external view returns (uint256);
        function getDrawResult(uint256 roundId) external view returns (
            uint256 timestamp,
            uint8[5] winningNumbers,
            uint256[] prizeTiers,
            uint256[] winnerCounts
        );
        function submitTicket(address player, uint8[5] numbers) external payable;
        function withdrawContractBalance() external;
    }
}

#[derive(Clone, Debug)]
pub struct RpcTransport {
    url: reqwest::Url,
    http: reqwest::Client,
    next_id: Arc<AtomicU64>,
}

impl RpcTransport {
    pub fn new(url: &str) -> Result<Self, ChainError> {
        let url = reqwest::Url::parse(url)
            .map_err(|err| ChainError::Transport(format!("invalid rpc url {url}: {err}")))?;
        let http = reqwest::Client::builder()
            .build()
            .map_err(|err| ChainError::Transport(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            url,
            http,
            next_id: Arc::new(AtomicU64::new(1)),
        })
    }

    pub async fn request<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<T, ChainError> {
        self.request_optional(method, params)
            .await?
            .ok_or_else(|| ChainError::Decode(format!("{method} returned null")))
    }

    /// Like [`RpcTransport::request`] but maps a `null` result to `None`.
    pub async fn request_optional<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Value,
    ) -> Result<Option<T>, ChainError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let res = self
            .http
            .post(self.url.clone())
            .json(&payload)
            .send()
            .await
            .map_err(|err| ChainError::Transport(format!("{method} request failed: {err}")))?;
        let status = res.status();
        let bytes = res.bytes().await.map_err(|err| {
            ChainError::Transport(format!("failed to read {method} response body: {err}"))
        })?;
        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes);
            return Err(ChainError::Transport(format!(
                "node responded with {status} to {method}: {body}"
            )));
        }
        let response: RpcResponse = serde_json::from_slice(&bytes)
            .map_err(|err| ChainError::Decode(format!("invalid {method} envelope: {err}")))?;
        response.into_result(method)
    }
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    error: Option<RpcErrorDto>,
}

#[derive(Deserialize)]
struct RpcErrorDto {
    code: i64,
    message: String,
}

impl RpcResponse {
    fn into_result<T: DeserializeOwned>(self, method: &str) -> Result<Option<T>, ChainError> {
        if let Some(error) = self.error {
            return Err(ChainError::Rpc {
                code: error.code,
                message: error.message,
            });
        }
        if self.result.is_null() {
            return Ok(None);
        }
        serde_json::from_value(self.result)
            .map(Some)
            .map_err(|err| ChainError::Decode(format!("invalid {method} result: {err}")))
    }
}

/// Parse a JSON-RPC hex quantity such as `"0xaa36a7"`.
pub fn parse_quantity(raw: &str) -> Result<u64, ChainError> {
    let digits = raw
        .strip_prefix("0x")
        .ok_or_else(|| ChainError::Decode(format!("quantity without 0x prefix: {raw}")))?;
    u64::from_str_radix(digits, 16)
        .map_err(|err| ChainError::Decode(format!("invalid quantity {raw}: {err}")))
}

pub struct JsonRpcWallet {
    transport: RpcTransport,
    watch_interval: Duration,
    receipt_interval: Duration,
}

impl JsonRpcWallet {
    pub fn new(url: &str) -> Result<Self, ChainError> {
        Ok(Self {
            transport: RpcTransport::new(url)?,
            watch_interval: DEFAULT_WATCH_INTERVAL,
            receipt_interval: DEFAULT_RECEIPT_INTERVAL,
        })
    }
}

async fn accounts(transport: &RpcTransport) -> Result<Vec<Address>, ChainError> {
    transport.request("eth_accounts", json!([])).await
}

async fn chain_id(transport: &RpcTransport) -> Result<NetworkId, ChainError> {
    let raw: String = transport.request("eth_chainId", json!([])).await?;
    parse_quantity(&raw)
}

impl WalletProvider for JsonRpcWallet {
    type Contract = RpcLottery;

    async fn request_accounts(&self) -> Result<Vec<Address>, ChainError> {
        match self
            .transport
            .request("eth_requestAccounts", json!([]))
            .await
        {
            Err(ChainError::Rpc {
                code: METHOD_NOT_FOUND,
                ..
            }) => {
                debug!("eth_requestAccounts unsupported, falling back to eth_accounts");
                accounts(&self.transport).await
            }
            other => other,
        }
    }

    async fn network_id(&self) -> Result<NetworkId, ChainError> {
        chain_id(&self.transport).await
    }

    async fn switch_network(&self, network: NetworkId) -> Result<(), ChainError> {
        let params = json!([{ "chainId": format!("{network:#x}") }]);
        self.transport
            .request_optional::<Value>("wallet_switchEthereumChain", params)
            .await
            .map(|_| ())
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<WalletEvent> {
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_wallet(
            self.transport.clone(),
            self.watch_interval,
            events,
        ));
        rx
    }

    fn bind(&self, contract: Address) -> RpcLottery {
        RpcLottery {
            transport: self.transport.clone(),
            address: contract,
            receipt_interval: self.receipt_interval,
        }
    }
}

/// Poll accounts and chain id, emitting an event whenever either differs from
/// the last observation. The first observation only sets the baseline.
async fn watch_wallet(
    transport: RpcTransport,
    period: Duration,
    events: mpsc::UnboundedSender<WalletEvent>,
) {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_accounts: Option<Vec<Address>> = None;
    let mut last_network: Option<NetworkId> = None;

    loop {
        ticker.tick().await;
        if events.is_closed() {
            break;
        }
        match accounts(&transport).await {
            Ok(current) => {
                if last_accounts.as_ref().is_some_and(|last| *last != current) {
                    let _ = events.send(WalletEvent::AccountsChanged(current.clone()));
                }
                last_accounts = Some(current);
            }
            Err(err) => debug!(%err, "account poll failed"),
        }
        match chain_id(&transport).await {
            Ok(current) => {
                if last_network.is_some_and(|last| last != current) {
                    let _ = events.send(WalletEvent::NetworkChanged(current));
                }
                last_network = Some(current);
            }
            Err(err) => debug!(%err, "chain id poll failed"),
        }
    }
    debug!("wallet watcher stopped");
}

pub struct RpcLottery {
    transport: RpcTransport,
    address: Address,
    receipt_interval: Duration,
}

#[derive(Deserialize)]
struct ReceiptDto {
    status: Option<String>,
}

impl RpcLottery {
    async fn call<C: SolCall + Send>(&self, call: C) -> Result<C::Return, ChainError> {
        let data = Bytes::from(call.abi_encode());
        let params = json!([{ "to": self.address, "data": data }, "latest"]);
        let raw: Bytes = self.transport.request("eth_call", params).await?;
        C::abi_decode_returns(&raw, true)
            .map_err(|err| ChainError::Decode(format!("{}: {err}", C::SIGNATURE)))
    }

    async fn transact<C: SolCall + Send>(
        &self,
        from: Address,
        call: C,
        value: U256,
    ) -> Result<TxHash, ChainError> {
        let tx = json!({
            "from": from,
            "to": self.address,
            "data": Bytes::from(call.abi_encode()),
            "value": value,
        });
        let hash: TxHash = self
            .transport
            .request("eth_sendTransaction", json!([tx]))
            .await?;
        info!(%hash, method = C::SIGNATURE, "transaction sent, awaiting receipt");
        let transport = &self.transport;
        wait_for_receipt(hash, self.receipt_interval, move || {
            transport.request_optional("eth_getTransactionReceipt", json!([hash]))
        })
        .await
    }
}

/// Poll until the receipt of a sent transaction shows up. The value has already
/// left the wallet, so a failed poll only means the outcome is not known yet.
async fn wait_for_receipt<F, Fut>(
    hash: TxHash,
    period: Duration,
    mut fetch: F,
) -> Result<TxHash, ChainError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<ReceiptDto>, ChainError>>,
{
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        match fetch().await {
            Ok(Some(receipt)) => return receipt_outcome(hash, receipt.status.as_deref()),
            Ok(None) => {}
            Err(err) => warn!(%hash, %err, "receipt poll failed, transaction still pending"),
        }
    }
}

/// Only an explicit zero status is a revert.
fn receipt_outcome(hash: TxHash, status: Option<&str>) -> Result<TxHash, ChainError> {
    match status.map(parse_quantity) {
        Some(Ok(0)) => Err(ChainError::Reverted(hash)),
        Some(Err(err)) => {
            warn!(%hash, %err, "unreadable receipt status, treating transaction as mined");
            Ok(hash)
        }
        _ => Ok(hash),
    }
}

fn lottery_details(
    details: IFantasyFive::getLotteryDetailsReturn,
) -> Result<LotteryDetails, ChainError> {
    Ok(LotteryDetails {
        entrance_fee: details.entranceFee,
        jackpot: details.jackpot,
        previous_draw: details.previousDraw,
        round_start_at: to_u64(details.roundStartTimestamp, "round start timestamp")?,
        last_draw_at: to_u64(details.lastDrawTimestamp, "last draw timestamp")?,
        draw_interval: to_u64(details.intervalForDraw, "draw interval")?,
    })
}

fn to_u64(value: U256, what: &str) -> Result<u64, ChainError> {
    u64::try_from(value).map_err(|_| ChainError::Decode(format!("{what} out of range: {value}")))
}

impl LotteryContract for RpcLottery {
    async fn lottery_details(&self) -> Result<LotteryDetails, ChainError> {
        lottery_details(self.call(IFantasyFive::getLotteryDetailsCall {}).await?)
    }

    async fn player_count(&self) -> Result<u32, ChainError> {
        let players = self
            .call(IFantasyFive::getCurrentDrawPlayerDetailsCall {})
            .await?
            .numberOfPlayers;
        u32::try_from(players)
            .map_err(|_| ChainError::Decode(format!("player count out of range: {players}")))
    }

    async fn phase(&self) -> Result<u8, ChainError> {
        Ok(self.call(IFantasyFive::viewLotteryStateCall {}).await?._0)
    }

    async fn seconds_to_next_draw(&self) -> Result<u64, ChainError> {
        let secs = self.call(IFantasyFive::timestampForNextDrawCall {}).await?._0;
        to_u64(secs, "seconds to next draw")
    }

    async fn current_round_id(&self) -> Result<u64, ChainError> {
        let id = self.call(IFantasyFive::currentRoundIdCall {}).await?._0;
        to_u64(id, "round id")
    }

    async fn draw_result(&self, round_id: u64) -> Result<RawDrawResult, ChainError> {
        let result = self
            .call(IFantasyFive::getDrawResultCall {
                roundId: U256::from(round_id),
            })
            .await?;
        let winner_counts = result
            .winnerCounts
            .into_iter()
            .map(|count| to_u64(count, "winner count"))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(RawDrawResult {
            timestamp: to_u64(result.timestamp, "draw timestamp")?,
            winning_numbers: result.winningNumbers,
            prize_tiers: result.prizeTiers,
            winner_counts,
        })
    }

    async fn submit_ticket(
        &self,
        from: Address,
        numbers: [u8; 5],
        value: U256,
    ) -> Result<TxHash, ChainError> {
        let call = IFantasyFive::submitTicketCall {
            player: from,
            numbers,
        };
        self.transact(from, call, value).await
    }

    async fn withdraw_contract_balance(&self, from: Address) -> Result<TxHash, ChainError> {
        self.transact(from, IFantasyFive::withdrawContractBalanceCall {}, U256::ZERO)
            .await
    }
}
