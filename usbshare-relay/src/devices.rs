//! Device access provider: the relay's view of the host-side USB tooling.
//!
//! The relay itself never touches hardware. Everything device-shaped goes
//! through [`DeviceAccess`]; the production implementation shells out to
//! the usbip utilities. Failures cross this boundary as booleans, never as
//! errors: a busy device or a missing tool must not take a session down.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::Mutex;
use usbshare_proto::device::DeviceEntry;

#[async_trait]
pub trait DeviceAccess: Send + Sync {
    /// Enumerate sharable devices on the host machine. Queried once at
    /// host registration time; an empty list is not an error.
    async fn list_host_devices(&self) -> Vec<DeviceEntry>;

    /// Begin forwarding `device_id` to the connection identified by
    /// `client_id`.
    async fn start_forwarding(&self, device_id: &str, client_id: &str) -> bool;

    /// Stop whatever forwarding `client_id` holds.
    async fn stop_forwarding(&self, client_id: &str) -> bool;
}

/// Production provider driving the usbip command-line tools.
pub struct UsbipTools {
    /// client_id -> device currently bound for that client.
    active: Mutex<HashMap<String, String>>,
}

impl UsbipTools {
    pub fn new() -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Probe for the usbip binary so a misconfigured host is reported at
    /// startup instead of on the first forwarding attempt.
    pub async fn ensure_tools(&self) -> bool {
        run_usbip(&["version"]).await.is_some()
    }

    async fn bind_device(&self, device_id: &str) -> bool {
        run_usbip(&["bind", "-b", device_id]).await.is_some()
    }

    async fn unbind_device(&self, device_id: &str) -> bool {
        run_usbip(&["unbind", "-b", device_id]).await.is_some()
    }
}

impl Default for UsbipTools {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DeviceAccess for UsbipTools {
    async fn list_host_devices(&self) -> Vec<DeviceEntry> {
        match run_usbip(&["list", "-l"]).await {
            Some(output) => parse_device_listing(&output),
            None => Vec::new(),
        }
    }

    async fn start_forwarding(&self, device_id: &str, client_id: &str) -> bool {
        if !self.bind_device(device_id).await {
            return false;
        }
        let mut active = self.active.lock().await;
        active.insert(client_id.to_string(), device_id.to_string());
        log::info!("forwarding {} to client {}", device_id, client_id);
        true
    }

    async fn stop_forwarding(&self, client_id: &str) -> bool {
        let device_id = {
            let active = self.active.lock().await;
            active.get(client_id).cloned()
        };
        let Some(device_id) = device_id else {
            return false;
        };
        if !self.unbind_device(&device_id).await {
            return false;
        }
        self.active.lock().await.remove(client_id);
        log::info!("stopped forwarding {} for client {}", device_id, client_id);
        true
    }
}

/// Run one usbip subcommand, returning its stdout on success.
async fn run_usbip(args: &[&str]) -> Option<String> {
    match Command::new("usbip").args(args).output().await {
        Ok(out) if out.status.success() => Some(String::from_utf8_lossy(&out.stdout).into_owned()),
        Ok(out) => {
            log::error!("usbip {:?} exited with {}", args, out.status);
            None
        }
        Err(e) => {
            log::error!("failed to run usbip {:?}: {}", args, e);
            None
        }
    }
}

/// Parse `usbip list -l` output. A `busid` line opens a new device record
/// with the id taken from after the colon; following `key: value` lines
/// attach metadata until the next `busid` line.
pub fn parse_device_listing(output: &str) -> Vec<DeviceEntry> {
    let mut devices = Vec::new();
    let mut current: Option<DeviceEntry> = None;

    for line in output.lines() {
        let line = line.trim();
        if line.starts_with("busid") {
            if let Some(done) = current.take() {
                devices.push(done);
            }
            let id = line
                .split_once(':')
                .map(|(_, rest)| rest.trim())
                .unwrap_or("")
                .to_string();
            current = Some(DeviceEntry {
                id,
                info: BTreeMap::new(),
            });
        } else if let Some((k, v)) = line.split_once(':') {
            // Metadata before the first busid line has no device to attach to.
            if let Some(dev) = current.as_mut() {
                dev.info.insert(k.trim().to_string(), v.trim().to_string());
            }
        }
    }
    if let Some(done) = current {
        devices.push(done);
    }
    devices
}
