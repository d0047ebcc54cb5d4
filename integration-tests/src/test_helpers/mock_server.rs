//! One axum server standing in for the fee endpoint, the public relays and
//! an esplora instance.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bitcoin::consensus::encode::{deserialize, serialize};
use bitcoin::{OutPoint, Transaction, Txid};
use serde_json::{json, Value};
use tokio::net::TcpListener;

#[derive(Default)]
pub struct ServerState {
    fee_down: AtomicBool,
    /// Relays accept but the explorer never learns about the transaction.
    hide_relayed: AtomicBool,
    failing_relays: Mutex<HashSet<String>>,
    relayed: Mutex<Vec<(String, Transaction)>>,
    known: Mutex<HashMap<Txid, Vec<u8>>>,
    spent: Mutex<HashSet<OutPoint>>,
}

impl ServerState {
    pub fn set_fee_down(&self, down: bool) {
        self.fee_down.store(down, Ordering::SeqCst);
    }

    pub fn set_hide_relayed(&self, hide: bool) {
        self.hide_relayed.store(hide, Ordering::SeqCst);
    }

    pub fn fail_relay(&self, name: &str) {
        self.failing_relays.lock().unwrap().insert(name.to_string());
    }

    pub fn mark_spent(&self, outpoint: OutPoint) {
        self.spent.lock().unwrap().insert(outpoint);
    }

    /// (relay name, transaction) in arrival order.
    pub fn relayed(&self) -> Vec<(String, Transaction)> {
        self.relayed.lock().unwrap().clone()
    }

    fn accept(&self, relay: &str, raw_hex: &str) -> Response {
        if self.failing_relays.lock().unwrap().contains(relay) {
            return (StatusCode::SERVICE_UNAVAILABLE, "relay unavailable").into_response();
        }
        let Ok(bytes) = hex::decode(raw_hex.trim()) else {
            return (StatusCode::BAD_REQUEST, "invalid hex").into_response();
        };
        let Ok(tx) = deserialize::<Transaction>(&bytes) else {
            return (StatusCode::BAD_REQUEST, "invalid transaction").into_response();
        };
        let txid = tx.compute_txid();
        if !self.hide_relayed.load(Ordering::SeqCst) {
            self.known.lock().unwrap().insert(txid, serialize(&tx));
        }
        self.relayed.lock().unwrap().push((relay.to_string(), tx));
        (StatusCode::OK, txid.to_string()).into_response()
    }
}

pub struct MockServer {
    pub base_url: String,
    pub state: Arc<ServerState>,
}

impl MockServer {
    pub async fn start() -> Self {
        let state = Arc::new(ServerState::default());
        let app = Router::new()
            .route("/fees", get(fees))
            .route("/relay/raw/:name", post(relay_raw))
            .route("/relay/json/:name", post(relay_json))
            .route("/esplora/tx", post(esplora_broadcast))
            .route("/esplora/tx/:txid/raw", get(esplora_raw_tx))
            .route("/esplora/tx/:txid/outspend/:vout", get(esplora_outspend))
            .with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tracing::debug!("mock server listening on {addr}");
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }
}

async fn fees(State(state): State<Arc<ServerState>>) -> Response {
    if state.fee_down.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    Json(json!({
        "fastestFee": 25,
        "halfHourFee": 12,
        "hourFee": 6,
        "economyFee": 3,
        "minimumFee": 1
    }))
    .into_response()
}

async fn relay_raw(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    body: String,
) -> Response {
    state.accept(&name, &body)
}

async fn relay_json(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    match body.get("tx").and_then(Value::as_str) {
        Some(raw_hex) => state.accept(&name, raw_hex),
        None => (StatusCode::BAD_REQUEST, "missing tx").into_response(),
    }
}

async fn esplora_broadcast(State(state): State<Arc<ServerState>>, body: String) -> Response {
    state.accept("esplora", &body)
}

async fn esplora_raw_tx(
    State(state): State<Arc<ServerState>>,
    Path(txid): Path<String>,
) -> Response {
    let Ok(txid) = Txid::from_str(&txid) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    match state.known.lock().unwrap().get(&txid) {
        Some(raw) => (StatusCode::OK, raw.clone()).into_response(),
        None => (StatusCode::NOT_FOUND, "Transaction not found").into_response(),
    }
}

async fn esplora_outspend(
    State(state): State<Arc<ServerState>>,
    Path((txid, vout)): Path<(String, u32)>,
) -> Response {
    let Ok(txid) = Txid::from_str(&txid) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let spent = state
        .spent
        .lock()
        .unwrap()
        .contains(&OutPoint::new(txid, vout));
    Json(json!({ "spent": spent })).into_response()
}
