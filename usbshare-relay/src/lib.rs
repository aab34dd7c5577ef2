//! USB-share relay server library.
//!
//! A host machine that owns USB devices and any number of clients behind
//! NAT register here under a shared pairing key; the relay pairs them,
//! keeps the device catalog in sync and forwards traffic between the two
//! sides. The library carries the whole broker so integration tests can
//! drive exactly what the binary runs.

pub mod devices;
pub mod registry;
pub mod router;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio::time::interval;
use usbshare_proto::relay::{ParseError, RelayMessage};
use uuid::Uuid;
use warp::ws::{Message, WebSocket};
use warp::Filter;

use devices::DeviceAccess;
use registry::{ConnId, Registry, Tx, Unbound};

/// Keepalive probe interval in seconds.
pub const PING_INTERVAL_SECS: u64 = 20;

/// A connection silent for longer than this is treated as gone.
pub const PING_TIMEOUT_SECS: u64 = 20;

/// Shared relay state: the registry behind one lock plus the device
/// access provider. Created at server start, dropped at shutdown.
pub struct State {
    pub registry: Mutex<Registry>,
    pub devices: Arc<dyn DeviceAccess>,
    /// Keepalive probe cadence; also how often the sweeper scans.
    pub ping_interval: Duration,
    /// Silence longer than this counts as a dead peer.
    pub ping_timeout: Duration,
    next_conn_id: AtomicU64,
}

impl State {
    pub fn new(devices: Arc<dyn DeviceAccess>) -> Self {
        Self::with_keepalive(
            devices,
            Duration::from_secs(PING_INTERVAL_SECS),
            Duration::from_secs(PING_TIMEOUT_SECS),
        )
    }

    /// As [`State::new`] but with explicit keepalive timing.
    pub fn with_keepalive(
        devices: Arc<dyn DeviceAccess>,
        ping_interval: Duration,
        ping_timeout: Duration,
    ) -> Self {
        Self {
            registry: Mutex::new(Registry::default()),
            devices,
            ping_interval,
            ping_timeout,
            next_conn_id: AtomicU64::new(1),
        }
    }
}

/// Per-connection context threaded through the router.
pub struct ConnCtx {
    pub id: ConnId,
    /// Stable identifier handed to the device access provider.
    pub client_id: String,
    pub tx: Tx,
}

/// The relay's full route set: banner, health check and the single
/// websocket endpoint (roles are declared in-band by the first
/// registration message, not by path).
pub fn routes(
    state: Arc<State>,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    let with_state = warp::any().map(move || state.clone());

    let hello = warp::path::end().map(|| "usbshare relay is active");
    let healthz = warp::path!("healthz").map(|| "ok");

    let ws = warp::path!("ws")
        .and(warp::ws())
        .and(with_state)
        .map(|ws: warp::ws::Ws, state: Arc<State>| {
            ws.on_upgrade(move |socket| handle_connection(socket, state))
        });

    hello.or(healthz).or(ws)
}

/// One task per connection: writer pump, keepalive pings, and the inbound
/// message loop. Every exit path funnels through `cleanup_connection`.
pub async fn handle_connection(ws: WebSocket, state: Arc<State>) {
    let id = state.next_conn_id.fetch_add(1, Ordering::Relaxed);
    let client_id = Uuid::new_v4().to_string();

    let (mut ws_tx, mut ws_rx) = ws.split();
    // Outbound channel is unbounded: a slow receiver buffers without limit.
    // Known gap, there is no backpressure anywhere in this protocol.
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();

    let writer = tokio::task::spawn(async move {
        while let Some(msg) = out_rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    {
        let mut reg = state.registry.lock().await;
        reg.attach(id, out_tx.clone(), client_id.clone());
    }
    let conn = ConnCtx {
        id,
        client_id,
        tx: out_tx.clone(),
    };
    log::debug!("conn {}: accepted (client_id={})", id, conn.client_id);

    let ping_tx = out_tx.clone();
    let ping_every = state.ping_interval;
    let pinger = tokio::spawn(async move {
        let mut ticker = interval(ping_every);
        loop {
            ticker.tick().await;
            if ping_tx.send(Message::ping(Vec::new())).is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(m) => m,
            Err(_) => break,
        };
        if msg.is_close() {
            break;
        }
        if msg.is_pong() {
            state.registry.lock().await.touch(id);
            continue;
        }
        if !(msg.is_text() || msg.is_binary()) {
            continue;
        }
        state.registry.lock().await.touch(id);

        let raw = match std::str::from_utf8(msg.as_bytes()) {
            Ok(s) => s.to_string(),
            Err(_) => {
                log::warn!("conn {}: dropping non-utf8 frame", id);
                continue;
            }
        };

        let parsed = match RelayMessage::from_json(&raw) {
            Ok(m) => m,
            Err(e @ ParseError::UnknownType(_)) => {
                log::info!("conn {}: {}", id, e);
                continue;
            }
            Err(e) => {
                log::warn!("conn {}: dropping message: {}", id, e);
                continue;
            }
        };

        match router::dispatch(&state, &conn, &raw, parsed).await {
            Ok(()) => {}
            Err(e) if e.replies_to_sender() => {
                router::send(
                    &conn.tx,
                    &RelayMessage::Error {
                        message: e.to_string(),
                    },
                );
            }
            Err(e) => log::warn!("conn {}: dropped message: {}", id, e),
        }
    }

    teardown_connection(&state, conn.id, &conn.client_id).await;
    pinger.abort();
    writer.abort();
    log::debug!("conn {} closed", id);
}

/// Unconditional, idempotent teardown: drop the registry binding, cascade
/// a host's session away, and release any forwarding the connection held.
/// Runs for normal closes, protocol errors, network failures and keepalive
/// expiry alike; repeated calls are no-ops past the first.
async fn teardown_connection(state: &State, id: ConnId, client_id: &str) {
    let unbound = {
        let mut reg = state.registry.lock().await;
        reg.detach(id)
    };

    match unbound {
        Some(Unbound::Host { key, client_txs }) => {
            // Best-effort notification, no retry: a crashed client mid-fanout
            // does not block the rest.
            router::broadcast(&client_txs, &RelayMessage::HostDisconnected);
            log::info!(
                "conn {}: host for key {} disconnected, session dissolved ({} clients notified)",
                id,
                key,
                client_txs.len()
            );
        }
        Some(Unbound::Client { key }) => {
            log::info!("conn {}: client left key {}", id, key);
        }
        None => {}
    }

    if state.devices.stop_forwarding(client_id).await {
        log::info!("conn {}: released device forwarding", id);
    }
}

/// Background task reclaiming connections that missed the keepalive
/// window. A blackholed peer never completes a close handshake and its
/// read loop never returns, so the sweeper runs the full teardown itself
/// rather than waiting for the connection's own task; the close frame is
/// still queued for peers that are merely slow. The loop's later teardown
/// call finds nothing left to do.
pub async fn liveness_sweeper(state: Arc<State>) {
    let mut ticker = interval(state.ping_interval);
    loop {
        ticker.tick().await;
        let stale = {
            let reg = state.registry.lock().await;
            reg.stale_connections(state.ping_timeout)
        };
        for (id, tx, client_id) in stale {
            log::warn!("conn {}: no pong within timeout, closing", id);
            let _ = tx.send(Message::close());
            teardown_connection(&state, id, &client_id).await;
        }
    }
}
