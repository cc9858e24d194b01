//! # REST + WebSocket API
//!
//! Builds the axum router that exposes the escrow ledger over HTTP.
//! All endpoints share application state through axum's `State` extractor.
//!
//! ## Endpoints
//!
//! | Method | Path             | Description                         |
//! |--------|------------------|-------------------------------------|
//! | GET    | `/health`        | Liveness probe                      |
//! | GET    | `/status`        | Deployment and ledger summary       |
//! | GET    | `/balance`       | Escrowed funds and custody balance  |
//! | GET    | `/listings/:id`  | Listing record by asset id          |
//! | GET    | `/assets/:id`    | Title registry entry by asset id    |
//! | POST   | `/rpc`           | JSON-RPC 2.0 gateway                |
//! | GET    | `/ws`            | WebSocket for live escrow events    |
//!
//! The ledger sits behind a single mutex. Every handler takes the lock in a
//! synchronous section and releases it before yielding.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::{Method, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use keystone_contracts::{
    Address, AssetId, AssetRegistry, Bank, BankError, DevnetLedger, EscrowError, EventRecord,
    Listing, RegistryError,
};

use crate::metrics::SharedMetrics;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// The ledger shared by every handler.
pub type SharedLedger = Arc<Mutex<DevnetLedger>>;

/// Shared application state available to all request handlers.
///
/// Cheap to clone. Everything is behind `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// Network identifier (e.g., "devnet").
    pub network: String,
    /// The escrow ledger with its registry and bank.
    pub ledger: SharedLedger,
    /// Broadcast channel for journaled escrow events.
    pub event_tx: broadcast::Sender<EventRecord>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/balance", get(balance_handler))
        .route("/listings/:id", get(listing_handler))
        .route("/assets/:id", get(asset_handler))
        .route("/rpc", post(rpc_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// JSON-RPC Types
// ---------------------------------------------------------------------------

/// A JSON-RPC 2.0 request envelope.
#[derive(Debug, Deserialize)]
pub struct JsonRpcRequest {
    /// Protocol version. Must be "2.0".
    pub jsonrpc: String,
    /// The method to invoke.
    pub method: String,
    /// Named method parameters.
    pub params: Option<serde_json::Value>,
    /// Request identifier. Echoed back in the response.
    pub id: serde_json::Value,
}

/// A JSON-RPC 2.0 response envelope.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Protocol version. Always "2.0".
    pub jsonrpc: String,
    /// The result on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    /// The error on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
    /// Request identifier, echoed from the request.
    pub id: serde_json::Value,
}

/// A JSON-RPC 2.0 error object.
#[derive(Debug, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Numeric error code.
    pub code: i32,
    /// Short human-readable error description.
    pub message: String,
    /// Optional structured error data.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// JSON-RPC error codes.
pub mod codes {
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;

    pub const UNAUTHORIZED: i32 = -32010;
    pub const INVALID_TERMS: i32 = -32011;
    pub const INSUFFICIENT_PAYMENT: i32 = -32012;
    pub const NOT_READY: i32 = -32013;
    pub const TRANSFER_FAILED: i32 = -32014;
    pub const NOT_LISTED: i32 = -32015;
    pub const ALREADY_LISTED: i32 = -32016;
    pub const UNKNOWN_ASSET: i32 = -32017;
    pub const AMOUNT_OVERFLOW: i32 = -32018;
    pub const REGISTRY_ERROR: i32 = -32020;
    pub const BANK_ERROR: i32 = -32021;
}

impl JsonRpcError {
    fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }
}

/// A failed ledger, registry, or bank call.
#[derive(Debug)]
enum CallError {
    Escrow(EscrowError),
    Registry(RegistryError),
    Bank(BankError),
}

impl From<EscrowError> for CallError {
    fn from(err: EscrowError) -> Self {
        CallError::Escrow(err)
    }
}

impl From<RegistryError> for CallError {
    fn from(err: RegistryError) -> Self {
        CallError::Registry(err)
    }
}

impl From<BankError> for CallError {
    fn from(err: BankError) -> Self {
        CallError::Bank(err)
    }
}

impl CallError {
    /// Metric label and `data.kind` of the error.
    fn kind(&self) -> &'static str {
        match self {
            CallError::Escrow(err) => match err {
                EscrowError::Unauthorized { .. } => "unauthorized",
                EscrowError::InvalidTerms(_) => "invalid_terms",
                EscrowError::InsufficientPayment { .. } => "insufficient_payment",
                EscrowError::NotReady { .. } => "not_ready",
                EscrowError::TransferFailed(_) => "transfer_failed",
                EscrowError::NotListed(_) => "not_listed",
                EscrowError::AlreadyListed(_) => "already_listed",
                EscrowError::UnknownAsset(_) => "unknown_asset",
                EscrowError::AmountOverflow => "amount_overflow",
            },
            CallError::Registry(RegistryError::UnknownAsset(_)) => "unknown_asset",
            CallError::Registry(_) => "registry",
            CallError::Bank(_) => "bank",
        }
    }

    fn code(&self) -> i32 {
        match self {
            CallError::Escrow(err) => match err {
                EscrowError::Unauthorized { .. } => codes::UNAUTHORIZED,
                EscrowError::InvalidTerms(_) => codes::INVALID_TERMS,
                EscrowError::InsufficientPayment { .. } => codes::INSUFFICIENT_PAYMENT,
                EscrowError::NotReady { .. } => codes::NOT_READY,
                EscrowError::TransferFailed(_) => codes::TRANSFER_FAILED,
                EscrowError::NotListed(_) => codes::NOT_LISTED,
                EscrowError::AlreadyListed(_) => codes::ALREADY_LISTED,
                EscrowError::UnknownAsset(_) => codes::UNKNOWN_ASSET,
                EscrowError::AmountOverflow => codes::AMOUNT_OVERFLOW,
            },
            CallError::Registry(RegistryError::UnknownAsset(_)) => codes::UNKNOWN_ASSET,
            CallError::Registry(_) => codes::REGISTRY_ERROR,
            CallError::Bank(_) => codes::BANK_ERROR,
        }
    }

    fn into_rpc(self) -> JsonRpcError {
        let mut data = serde_json::json!({ "kind": self.kind() });
        match &self {
            CallError::Escrow(EscrowError::NotReady { unmet }) => {
                data["unmet"] = serde_json::json!(unmet);
            }
            CallError::Escrow(EscrowError::InsufficientPayment { required, provided }) => {
                data["required"] = serde_json::json!(required);
                data["provided"] = serde_json::json!(provided);
            }
            _ => {}
        }
        let message = match &self {
            CallError::Escrow(err) => err.to_string(),
            CallError::Registry(err) => err.to_string(),
            CallError::Bank(err) => err.to_string(),
        };
        JsonRpcError::new(self.code(), message).with_data(data)
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC Parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MintParams {
    caller: Address,
    uri: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegistryApproveParams {
    caller: Address,
    operator: Address,
    asset_id: AssetId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AssetParams {
    asset_id: AssetId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreditParams {
    account: Address,
    amount: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountParams {
    account: Address,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListParams {
    caller: Address,
    asset_id: AssetId,
    buyer: Address,
    purchase_price: u64,
    escrow_amount: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PaymentParams {
    caller: Address,
    asset_id: AssetId,
    value: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InspectionParams {
    caller: Address,
    asset_id: AssetId,
    passed: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallParams {
    caller: Address,
    asset_id: AssetId,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApprovalParams {
    asset_id: AssetId,
    party: Address,
}

/// Deserializes named params. Missing params parse as an empty object.
fn parse_params<T: DeserializeOwned>(params: Option<serde_json::Value>) -> Result<T, JsonRpcError> {
    let value = params.unwrap_or_else(|| serde_json::Value::Object(Default::default()));
    serde_json::from_value(value)
        .map_err(|e| JsonRpcError::new(codes::INVALID_PARAMS, format!("Invalid params: {e}")))
}

fn to_result<T: Serialize>(value: T) -> Result<serde_json::Value, JsonRpcError> {
    serde_json::to_value(value)
        .map_err(|e| JsonRpcError::new(codes::INTERNAL_ERROR, format!("Internal error: {e}")))
}

// ---------------------------------------------------------------------------
// Response Types
// ---------------------------------------------------------------------------

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    /// Node software version.
    pub version: String,
    /// Network identifier.
    pub network: String,
    /// The ledger's custody address.
    pub ledger: Address,
    /// Title registry address.
    pub nft_address: Address,
    /// Configured seller.
    pub seller: Address,
    /// Configured inspector.
    pub inspector: Address,
    /// Configured lender.
    pub lender: Address,
    /// Listing records, including terminal ones.
    pub listings: u64,
    /// Pending listings.
    pub open_listings: u64,
    /// Length of the event journal.
    pub events: u64,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

/// Response payload for `GET /balance`.
#[derive(Debug, Serialize, Deserialize)]
pub struct BalanceResponse {
    /// Funds held for pending listings.
    pub escrow_balance: u64,
    /// Actual balance of the custody account.
    pub custody_balance: u64,
    /// Whether `escrow_balance <= custody_balance`.
    pub custody_verified: bool,
}

/// Response payload for `GET /assets/:id`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AssetResponse {
    pub asset_id: AssetId,
    pub owner: Address,
    pub uri: String,
    pub approved: Option<Address>,
    /// Whether the asset currently sits in escrow.
    pub listed: bool,
}

/// Generic error body returned by REST endpoints on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

fn not_found(message: String) -> axum::response::Response {
    (StatusCode::NOT_FOUND, Json(ErrorResponse { error: message })).into_response()
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: returns 200 if the node is alive.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

/// `GET /status`: deployment parameters and ledger counters.
async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ledger = state.ledger.lock();
    let (listings, open_listings) = ledger
        .listings()
        .fold((0u64, 0u64), |(all, open), listing| {
            (all + 1, open + u64::from(listing.is_listed()))
        });

    let resp = StatusResponse {
        version: state.version.clone(),
        network: state.network.clone(),
        ledger: ledger.address(),
        nft_address: ledger.nft_address(),
        seller: ledger.seller(),
        inspector: ledger.inspector(),
        lender: ledger.lender(),
        listings,
        open_listings,
        events: ledger.events().len() as u64,
        timestamp: chrono::Utc::now().to_rfc3339(),
    };
    Json(resp)
}

/// `GET /balance`: escrowed funds against the custody account.
async fn balance_handler(State(state): State<AppState>) -> impl IntoResponse {
    let ledger = state.ledger.lock();
    Json(BalanceResponse {
        escrow_balance: ledger.get_balance(),
        custody_balance: ledger.custody_balance(),
        custody_verified: ledger.verify_custody(),
    })
}

/// `GET /listings/:id`: the listing record, 404 if the asset was never listed.
async fn listing_handler(
    Path(asset_id): Path<AssetId>,
    State(state): State<AppState>,
) -> axum::response::Response {
    let listing: Option<Listing> = state.ledger.lock().listing(asset_id).cloned();
    match listing {
        Some(listing) => (StatusCode::OK, Json(listing)).into_response(),
        None => not_found(format!("Listing not found for asset {}", asset_id)),
    }
}

/// `GET /assets/:id`: the registry entry, 404 if the asset was never minted.
async fn asset_handler(
    Path(asset_id): Path<AssetId>,
    State(state): State<AppState>,
) -> axum::response::Response {
    let asset = {
        let ledger = state.ledger.lock();
        let registry = ledger.registry();
        match (
            registry.owner_of(asset_id),
            registry.token_uri(asset_id),
            registry.get_approved(asset_id),
        ) {
            (Ok(owner), Ok(uri), Ok(approved)) => Some(AssetResponse {
                asset_id,
                owner,
                uri: uri.to_string(),
                approved,
                listed: ledger.is_listed(asset_id),
            }),
            _ => None,
        }
    };

    match asset {
        Some(asset) => (StatusCode::OK, Json(asset)).into_response(),
        None => not_found(format!("Asset not found: {}", asset_id)),
    }
}

/// `POST /rpc`: JSON-RPC 2.0 gateway.
///
/// Routes method calls to the ledger. Unknown methods return error code
/// -32601 (Method not found).
async fn rpc_handler(
    State(state): State<AppState>,
    Json(req): Json<JsonRpcRequest>,
) -> impl IntoResponse {
    if req.jsonrpc != "2.0" {
        return Json(JsonRpcResponse {
            jsonrpc: "2.0".into(),
            result: None,
            error: Some(JsonRpcError::new(
                codes::INVALID_REQUEST,
                "Invalid Request: jsonrpc must be \"2.0\"",
            )),
            id: req.id,
        });
    }

    let timer = state.metrics.rpc_latency_seconds.start_timer();
    let outcome = dispatch(&state, &req.method, req.params);
    timer.observe_duration();

    let (result, error) = match outcome {
        Ok(value) => (Some(value), None),
        Err(err) => {
            tracing::debug!(method = %req.method, code = err.code, "rpc call failed: {}", err.message);
            (None, Some(err))
        }
    };

    Json(JsonRpcResponse {
        jsonrpc: "2.0".into(),
        result,
        error,
        id: req.id,
    })
}

/// Resolves one JSON-RPC method against the ledger.
fn dispatch(
    state: &AppState,
    method: &str,
    params: Option<serde_json::Value>,
) -> Result<serde_json::Value, JsonRpcError> {
    match method {
        // -- Title registry --------------------------------------------------
        "registry_mint" => {
            let p: MintParams = parse_params(params)?;
            execute(state, |ledger| Ok(ledger.mint_title(p.caller, &p.uri)?))
        }
        "registry_approve" => {
            let p: RegistryApproveParams = parse_params(params)?;
            execute(state, |ledger| {
                Ok(ledger.approve_title(p.caller, p.operator, p.asset_id)?)
            })
        }
        "registry_ownerOf" => {
            let p: AssetParams = parse_params(params)?;
            let owner = state
                .ledger
                .lock()
                .registry()
                .owner_of(p.asset_id)
                .map_err(|e| CallError::from(e).into_rpc())?;
            to_result(owner)
        }

        // -- Bank ------------------------------------------------------------
        "bank_credit" => {
            let p: CreditParams = parse_params(params)?;
            execute(state, |ledger| Ok(ledger.fund(p.account, p.amount)?))
        }
        "bank_balanceOf" => {
            let p: AccountParams = parse_params(params)?;
            to_result(state.ledger.lock().bank().balance_of(&p.account))
        }

        // -- Escrow mutations ------------------------------------------------
        "escrow_list" => {
            let p: ListParams = parse_params(params)?;
            execute(state, |ledger| {
                Ok(ledger.list(
                    p.caller,
                    p.asset_id,
                    p.buyer,
                    p.purchase_price,
                    p.escrow_amount,
                )?)
            })
        }
        "escrow_depositEarnest" => {
            let p: PaymentParams = parse_params(params)?;
            execute(state, |ledger| {
                Ok(ledger.deposit_earnest(p.caller, p.asset_id, p.value)?)
            })
        }
        "escrow_contribute" => {
            let p: PaymentParams = parse_params(params)?;
            execute(state, |ledger| {
                Ok(ledger.contribute(p.caller, p.asset_id, p.value)?)
            })
        }
        "escrow_updateInspectionStatus" => {
            let p: InspectionParams = parse_params(params)?;
            execute(state, |ledger| {
                Ok(ledger.update_inspection_status(p.caller, p.asset_id, p.passed)?)
            })
        }
        "escrow_approveSale" => {
            let p: CallParams = parse_params(params)?;
            execute(state, |ledger| Ok(ledger.approve_sale(p.caller, p.asset_id)?))
        }
        "escrow_finalizeSale" => {
            let p: CallParams = parse_params(params)?;
            execute(state, |ledger| Ok(ledger.finalize_sale(p.caller, p.asset_id)?))
        }
        "escrow_cancelSale" => {
            let p: CallParams = parse_params(params)?;
            execute(state, |ledger| Ok(ledger.cancel_sale(p.caller, p.asset_id)?))
        }

        // -- Escrow queries --------------------------------------------------
        "escrow_isListed" => {
            let p: AssetParams = parse_params(params)?;
            to_result(state.ledger.lock().is_listed(p.asset_id))
        }
        "escrow_buyer" => {
            let p: AssetParams = parse_params(params)?;
            to_result(state.ledger.lock().buyer(p.asset_id))
        }
        // `purchasePrise` is the legacy spelling, kept as an alias.
        "escrow_purchasePrice" | "escrow_purchasePrise" => {
            let p: AssetParams = parse_params(params)?;
            to_result(state.ledger.lock().purchase_price(p.asset_id))
        }
        "escrow_escrowAmount" => {
            let p: AssetParams = parse_params(params)?;
            to_result(state.ledger.lock().escrow_amount(p.asset_id))
        }
        "escrow_inspectionPassed" => {
            let p: AssetParams = parse_params(params)?;
            to_result(state.ledger.lock().inspection_passed(p.asset_id))
        }
        "escrow_approval" => {
            let p: ApprovalParams = parse_params(params)?;
            to_result(state.ledger.lock().approval(p.asset_id, &p.party))
        }
        "escrow_getBalance" => to_result(state.ledger.lock().get_balance()),
        "escrow_nftAddress" => to_result(state.ledger.lock().nft_address()),
        "escrow_seller" => to_result(state.ledger.lock().seller()),
        "escrow_inspector" => to_result(state.ledger.lock().inspector()),
        "escrow_lender" => to_result(state.ledger.lock().lender()),

        _ => Err(JsonRpcError::new(
            codes::METHOD_NOT_FOUND,
            format!("Method not found: {}", method),
        )),
    }
}

/// Runs a state-mutating call under the ledger lock.
///
/// On success, events the call journaled are fed to the metrics and
/// broadcast to WebSocket subscribers after the lock is released. On
/// failure, the rejection is counted by kind.
fn execute<T: Serialize>(
    state: &AppState,
    call: impl FnOnce(&mut DevnetLedger) -> Result<T, CallError>,
) -> Result<serde_json::Value, JsonRpcError> {
    let (outcome, events, custody) = {
        let mut ledger = state.ledger.lock();
        let from = ledger.events().len() as u64;
        let outcome = call(&mut *ledger);
        let events = ledger.events_since(from).to_vec();
        (outcome, events, ledger.custody_balance())
    };

    state.metrics.set_custody_balance(custody);

    match outcome {
        Ok(value) => {
            for record in events {
                state.metrics.observe_event(&record.event);
                // No subscribers is not an error.
                let _ = state.event_tx.send(record);
            }
            to_result(value)
        }
        Err(err) => {
            state
                .metrics
                .rejected_calls_total
                .with_label_values(&[err.kind()])
                .inc();
            Err(err.into_rpc())
        }
    }
}

/// `GET /ws`: WebSocket upgrade for live event streaming.
///
/// Clients receive JSON-encoded [`EventRecord`] messages as the ledger
/// journals them. Client messages are ignored.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
}

/// Drives a single WebSocket connection, forwarding broadcast events
/// until the client disconnects or the channel is closed.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState) {
    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(record) => {
                        let payload = match serde_json::to_string(&record) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, DEVNET_BUYER_LABEL};
    use crate::metrics::NodeMetrics;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use keystone_contracts::EscrowEvent;
    use serde_json::json;
    use tower::ServiceExt;

    fn test_app_state() -> AppState {
        let ledger = NodeConfig::devnet().deploy().expect("devnet deploy");
        let (event_tx, _) = broadcast::channel(64);

        AppState {
            version: "0.1.0-test".into(),
            network: "devnet".into(),
            ledger: Arc::new(Mutex::new(ledger)),
            event_tx,
            metrics: Arc::new(NodeMetrics::new()),
        }
    }

    fn buyer() -> Address {
        Address::from_label(DEVNET_BUYER_LABEL)
    }

    async fn get(router: &Router, path: &str) -> (StatusCode, Vec<u8>) {
        let req = Request::builder().uri(path).body(Body::empty()).unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let status = resp.status();
        let body = resp
            .into_body()
            .collect()
            .await
            .unwrap()
            .to_bytes()
            .to_vec();
        (status, body)
    }

    /// Sends a JSON-RPC call and returns the decoded response.
    async fn rpc(router: &Router, method: &str, params: serde_json::Value) -> JsonRpcResponse {
        let body = json!({ "jsonrpc": "2.0", "method": method, "params": params, "id": 1 });
        let req = Request::builder()
            .method("POST")
            .uri("/rpc")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn rpc_ok(router: &Router, method: &str, params: serde_json::Value) -> serde_json::Value {
        let resp = rpc(router, method, params).await;
        assert!(resp.error.is_none(), "{method} failed: {:?}", resp.error);
        resp.result.unwrap()
    }

    /// Mints a title to the seller, approves the ledger, and lists it for
    /// the devnet buyer at price 10 with earnest 5.
    async fn mint_and_list(router: &Router, state: &AppState) -> AssetId {
        let (seller, ledger) = {
            let l = state.ledger.lock();
            (l.seller(), l.address())
        };
        let asset_id = rpc_ok(
            router,
            "registry_mint",
            json!({ "caller": seller, "uri": "ipfs://title" }),
        )
        .await
        .as_u64()
        .unwrap();
        rpc_ok(
            router,
            "registry_approve",
            json!({ "caller": seller, "operator": ledger, "assetId": asset_id }),
        )
        .await;
        rpc_ok(
            router,
            "escrow_list",
            json!({
                "caller": seller,
                "assetId": asset_id,
                "buyer": buyer(),
                "purchasePrice": 10,
                "escrowAmount": 5
            }),
        )
        .await;
        asset_id
    }

    #[tokio::test]
    async fn health_endpoint_returns_ok() {
        let router = create_router(test_app_state());
        let (status, body) = get(&router, "/health").await;

        assert_eq!(status, StatusCode::OK);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn status_reports_deployment() {
        let state = test_app_state();
        let seller = state.ledger.lock().seller();
        let router = create_router(state);
        let (status, body) = get(&router, "/status").await;

        assert_eq!(status, StatusCode::OK);
        let resp: StatusResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.seller, seller);
        assert_eq!(resp.listings, 0);
        assert_eq!(resp.network, "devnet");
    }

    #[tokio::test]
    async fn full_sale_over_rpc() {
        let state = test_app_state();
        let mut events = state.event_tx.subscribe();
        let router = create_router(state.clone());
        let (seller, inspector, lender) = {
            let l = state.ledger.lock();
            (l.seller(), l.inspector(), l.lender())
        };

        let id = mint_and_list(&router, &state).await;
        assert_eq!(rpc_ok(&router, "escrow_isListed", json!({ "assetId": id })).await, true);

        rpc_ok(
            &router,
            "escrow_depositEarnest",
            json!({ "caller": buyer(), "assetId": id, "value": 5 }),
        )
        .await;
        rpc_ok(
            &router,
            "escrow_updateInspectionStatus",
            json!({ "caller": inspector, "assetId": id, "passed": true }),
        )
        .await;
        for party in [buyer(), seller, lender] {
            rpc_ok(
                &router,
                "escrow_approveSale",
                json!({ "caller": party, "assetId": id }),
            )
            .await;
        }
        rpc_ok(
            &router,
            "escrow_contribute",
            json!({ "caller": lender, "assetId": id, "value": 5 }),
        )
        .await;
        assert_eq!(rpc_ok(&router, "escrow_getBalance", json!({})).await, 10);

        rpc_ok(
            &router,
            "escrow_finalizeSale",
            json!({ "caller": seller, "assetId": id }),
        )
        .await;

        let owner = rpc_ok(&router, "registry_ownerOf", json!({ "assetId": id })).await;
        assert_eq!(owner, json!(buyer()));
        assert_eq!(rpc_ok(&router, "escrow_getBalance", json!({})).await, 0);
        assert_eq!(
            rpc_ok(&router, "bank_balanceOf", json!({ "account": seller })).await,
            10
        );

        // Listed, deposit, inspection, three approvals, contribution, finalize.
        let mut received = Vec::new();
        while let Ok(record) = events.try_recv() {
            received.push(record.event);
        }
        assert_eq!(received.len(), 8);
        assert!(matches!(received[0], EscrowEvent::Listed { .. }));
        assert!(matches!(received[7], EscrowEvent::SaleFinalized { .. }));

        assert_eq!(state.metrics.listings_created_total.get(), 1);
        assert_eq!(state.metrics.sales_finalized_total.get(), 1);
        assert_eq!(state.metrics.open_listings.get(), 0);
    }

    #[tokio::test]
    async fn unauthorized_deposit_maps_to_error_code() {
        let state = test_app_state();
        let router = create_router(state.clone());
        let id = mint_and_list(&router, &state).await;
        let lender = state.ledger.lock().lender();

        let resp = rpc(
            &router,
            "escrow_depositEarnest",
            json!({ "caller": lender, "assetId": id, "value": 5 }),
        )
        .await;

        let err = resp.error.unwrap();
        assert_eq!(err.code, codes::UNAUTHORIZED);
        assert_eq!(err.data.unwrap()["kind"], "unauthorized");
        assert_eq!(rpc_ok(&router, "escrow_getBalance", json!({})).await, 0);
        assert_eq!(
            state
                .metrics
                .rejected_calls_total
                .with_label_values(&["unauthorized"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn premature_finalize_lists_unmet_conditions() {
        let state = test_app_state();
        let router = create_router(state.clone());
        let id = mint_and_list(&router, &state).await;
        let seller = state.ledger.lock().seller();

        let resp = rpc(
            &router,
            "escrow_finalizeSale",
            json!({ "caller": seller, "assetId": id }),
        )
        .await;

        let err = resp.error.unwrap();
        assert_eq!(err.code, codes::NOT_READY);
        let unmet = err.data.unwrap()["unmet"].as_array().unwrap().len();
        assert_eq!(unmet, 5);
    }

    #[tokio::test]
    async fn purchase_price_alias_matches() {
        let state = test_app_state();
        let router = create_router(state.clone());
        let id = mint_and_list(&router, &state).await;

        let price = rpc_ok(&router, "escrow_purchasePrice", json!({ "assetId": id })).await;
        let alias = rpc_ok(&router, "escrow_purchasePrise", json!({ "assetId": id })).await;
        assert_eq!(price, 10);
        assert_eq!(alias, price);

        let unknown = rpc_ok(&router, "escrow_buyer", json!({ "assetId": 999 })).await;
        assert!(unknown.is_null());
    }

    #[tokio::test]
    async fn malformed_params_are_rejected() {
        let router = create_router(test_app_state());

        let resp = rpc(&router, "escrow_approveSale", json!({ "assetId": 1 })).await;
        assert_eq!(resp.error.unwrap().code, codes::INVALID_PARAMS);

        let resp = rpc(
            &router,
            "escrow_approveSale",
            json!({ "caller": "not-an-address", "assetId": 1 }),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, codes::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_method_and_bad_version() {
        let router = create_router(test_app_state());

        let resp = rpc(&router, "escrow_selfDestruct", json!({})).await;
        assert_eq!(resp.error.unwrap().code, codes::METHOD_NOT_FOUND);

        let body = json!({ "jsonrpc": "1.0", "method": "escrow_seller", "id": 7 });
        let req = Request::builder()
            .method("POST")
            .uri("/rpc")
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap();
        let resp = router.clone().oneshot(req).await.unwrap();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let resp: JsonRpcResponse = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(resp.error.unwrap().code, codes::INVALID_REQUEST);
        assert_eq!(resp.id, json!(7));
    }

    #[tokio::test]
    async fn listing_and_asset_endpoints() {
        let state = test_app_state();
        let router = create_router(state.clone());

        let (status, _) = get(&router, "/listings/1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = get(&router, "/assets/1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let id = mint_and_list(&router, &state).await;
        let custody = state.ledger.lock().address();

        let (status, body) = get(&router, &format!("/listings/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        let listing: Listing = serde_json::from_slice(&body).unwrap();
        assert_eq!(listing.buyer, buyer());
        assert_eq!(listing.purchase_price, 10);

        let (status, body) = get(&router, &format!("/assets/{id}")).await;
        assert_eq!(status, StatusCode::OK);
        let asset: AssetResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(asset.owner, custody);
        assert!(asset.listed);
        assert_eq!(asset.uri, "ipfs://title");
    }

    #[tokio::test]
    async fn balance_endpoint_tracks_custody() {
        let state = test_app_state();
        let router = create_router(state.clone());
        let id = mint_and_list(&router, &state).await;
        rpc_ok(
            &router,
            "escrow_depositEarnest",
            json!({ "caller": buyer(), "assetId": id, "value": 7 }),
        )
        .await;

        let (status, body) = get(&router, "/balance").await;
        assert_eq!(status, StatusCode::OK);
        let resp: BalanceResponse = serde_json::from_slice(&body).unwrap();
        assert_eq!(resp.escrow_balance, 7);
        assert_eq!(resp.custody_balance, 7);
        assert!(resp.custody_verified);
        assert_eq!(state.metrics.custody_balance.get(), 7);
    }

    #[tokio::test]
    async fn custody_account_is_refused_by_registry_and_bank_methods() {
        let state = test_app_state();
        let router = create_router(state.clone());
        let id = mint_and_list(&router, &state).await;
        rpc_ok(
            &router,
            "escrow_depositEarnest",
            json!({ "caller": buyer(), "assetId": id, "value": 5 }),
        )
        .await;
        let custody = state.ledger.lock().address();
        let thief = Address::from_label("thief");

        let resp = rpc(
            &router,
            "registry_approve",
            json!({ "caller": custody, "operator": thief, "assetId": id }),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, codes::REGISTRY_ERROR);

        let resp = rpc(
            &router,
            "bank_credit",
            json!({ "account": custody, "amount": 1 }),
        )
        .await;
        assert_eq!(resp.error.unwrap().code, codes::BANK_ERROR);

        let owner = rpc_ok(&router, "registry_ownerOf", json!({ "assetId": id })).await;
        assert_eq!(owner, json!(custody));
        let ledger = state.ledger.lock();
        assert_eq!(ledger.custody_balance(), 5);
        assert!(ledger.verify_custody());
        assert!(ledger.is_listed(id));
    }
}
