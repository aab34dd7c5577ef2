//! Message routing: resolve the sender, dispatch by declared type.
//!
//! Every handler returns through one `Result`; the connection loop turns
//! `UnknownKey` into an `error` reply and logs everything else, so reply
//! behavior lives in exactly one place instead of per-handler catch arms.

use usbshare_proto::relay::RelayMessage;
use warp::ws::Message;

use crate::registry::{RegistryError, Role, Tx};
use crate::{ConnCtx, State};

/// Dispatch one parsed message. `raw` is the original received text,
/// forwarded untouched for the opaque-payload message kinds.
pub async fn dispatch(
    state: &State,
    conn: &ConnCtx,
    raw: &str,
    msg: RelayMessage,
) -> Result<(), RegistryError> {
    match msg {
        RelayMessage::HostConnect { key } => host_connect(state, conn, &key).await,
        RelayMessage::ClientConnect { key } => client_connect(state, conn, &key).await,
        RelayMessage::Relay { .. } => relay_opaque(state, conn, raw).await,
        RelayMessage::DeviceListUpdate { devices } => {
            let key = require_role(state, conn, Role::Host).await?;
            let txs = {
                let mut reg = state.registry.lock().await;
                reg.replace_catalog(&key, devices)
            };
            forward_raw(&txs, raw);
            log::info!("conn {}: catalog replaced for key {}", conn.id, key);
            Ok(())
        }
        RelayMessage::ShareDevice { device_id, .. } => {
            let key = require_role(state, conn, Role::Host).await?;
            let txs = {
                let mut reg = state.registry.lock().await;
                reg.share_device(&key, &device_id)
            };
            broadcast(&txs, &RelayMessage::DeviceAvailable { device_id });
            Ok(())
        }
        RelayMessage::UnshareDevice { device_id, .. } => {
            let key = require_role(state, conn, Role::Host).await?;
            let txs = {
                let mut reg = state.registry.lock().await;
                reg.unshare_device(&key, &device_id)
            };
            if let Some(txs) = txs {
                broadcast(&txs, &RelayMessage::DeviceUnavailable { device_id });
            }
            Ok(())
        }
        RelayMessage::RequestDevice { .. } | RelayMessage::StopSharing { .. } => {
            let key = require_role(state, conn, Role::Client).await?;
            let host = state.registry.lock().await.host_tx(&key);
            if let Some(host) = host {
                forward_raw(&[host], raw);
            }
            Ok(())
        }
        RelayMessage::ConnectDevice { key, device_id } => {
            {
                let reg = state.registry.lock().await;
                if !reg.session_exists(&key) {
                    return Err(RegistryError::UnknownKey);
                }
            }
            let success = state
                .devices
                .start_forwarding(&device_id, &conn.client_id)
                .await;
            send(&conn.tx, &RelayMessage::DeviceConnectionStatus { success });
            Ok(())
        }
        RelayMessage::DisconnectDevice { .. } => {
            let success = state.devices.stop_forwarding(&conn.client_id).await;
            send(&conn.tx, &RelayMessage::DeviceDisconnected { success });
            Ok(())
        }
        RelayMessage::UsbData { .. } => relay_opaque(state, conn, raw).await,
        // Relay-originated notification types arriving inbound are dropped.
        other => {
            log::debug!(
                "conn {}: ignoring relay-originated message type {:?}",
                conn.id,
                tag_of(&other)
            );
            Ok(())
        }
    }
}

async fn host_connect(state: &State, conn: &ConnCtx, key: &str) -> Result<(), RegistryError> {
    let displaced = {
        let mut reg = state.registry.lock().await;
        reg.register_host(conn.id, key)?
    };

    if let Some(old) = displaced {
        log::info!("conn {}: displacing previous host for key {}", conn.id, key);
        if let Some(host_tx) = old.host_tx {
            let _ = host_tx.send(Message::close());
        }
        broadcast(&old.client_txs, &RelayMessage::HostDisconnected);
    }

    // The freshly queried device list rides along in the ack; the catalog
    // itself stays empty until the host reports one.
    let devices = state.devices.list_host_devices().await;
    send(
        &conn.tx,
        &RelayMessage::RegistrationSuccess {
            message: "Successfully registered as host".to_string(),
            devices: if devices.is_empty() {
                None
            } else {
                Some(devices)
            },
        },
    );
    log::info!("conn {}: host registered with key {}", conn.id, key);
    Ok(())
}

async fn client_connect(state: &State, conn: &ConnCtx, key: &str) -> Result<(), RegistryError> {
    let catalog = {
        let mut reg = state.registry.lock().await;
        reg.register_client(conn.id, key)?
    };
    send(
        &conn.tx,
        &RelayMessage::RegistrationSuccess {
            message: "Successfully registered as client".to_string(),
            devices: None,
        },
    );
    if !catalog.is_empty() {
        send(&conn.tx, &RelayMessage::DeviceList { devices: catalog });
    }
    log::info!("conn {}: client joined key {}", conn.id, key);
    Ok(())
}

/// Host sender fans out to every client; client sender goes to the host.
async fn relay_opaque(state: &State, conn: &ConnCtx, raw: &str) -> Result<(), RegistryError> {
    let reg = state.registry.lock().await;
    let (key, role) = reg.resolve(conn.id).ok_or(RegistryError::NotInSession)?;
    match role {
        Role::Host => {
            let txs = reg.client_txs(&key);
            drop(reg);
            forward_raw(&txs, raw);
        }
        Role::Client => {
            let host = reg.host_tx(&key);
            drop(reg);
            if let Some(host) = host {
                forward_raw(&[host], raw);
            }
        }
    }
    Ok(())
}

/// Resolve the sender and insist on `role`.
async fn require_role(state: &State, conn: &ConnCtx, role: Role) -> Result<String, RegistryError> {
    let reg = state.registry.lock().await;
    let (key, actual) = reg.resolve(conn.id).ok_or(RegistryError::NotInSession)?;
    if actual != role {
        return Err(RegistryError::RoleMismatch(role));
    }
    Ok(key)
}

pub(crate) fn send(tx: &Tx, msg: &RelayMessage) {
    let _ = tx.send(Message::text(msg.to_json()));
}

/// Best-effort fan-out; a gone receiver never blocks the rest.
pub(crate) fn broadcast(txs: &[Tx], msg: &RelayMessage) {
    let text = msg.to_json();
    for tx in txs {
        let _ = tx.send(Message::text(text.clone()));
    }
}

/// Forward the original wire text without re-encoding.
fn forward_raw(txs: &[Tx], raw: &str) {
    for tx in txs {
        let _ = tx.send(Message::text(raw.to_string()));
    }
}

fn tag_of(msg: &RelayMessage) -> &'static str {
    match msg {
        RelayMessage::RegistrationSuccess { .. } => "registration_success",
        RelayMessage::Error { .. } => "error",
        RelayMessage::HostDisconnected => "host_disconnected",
        RelayMessage::DeviceAvailable { .. } => "device_available",
        RelayMessage::DeviceUnavailable { .. } => "device_unavailable",
        RelayMessage::DeviceList { .. } => "device_list",
        RelayMessage::DeviceConnectionStatus { .. } => "device_connection_status",
        RelayMessage::DeviceDisconnected { .. } => "device_disconnected",
        _ => "other",
    }
}
