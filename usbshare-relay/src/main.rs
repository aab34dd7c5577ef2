use std::net::SocketAddr;
use std::sync::Arc;

use warp::Filter;

use usbshare_relay::devices::{DeviceAccess, UsbipTools};
use usbshare_relay::{liveness_sweeper, routes, State};

#[tokio::main]
async fn main() {
    env_logger::init();

    let listen: SocketAddr = std::env::var("USBSHARE_RELAY_LISTEN")
        .unwrap_or_else(|_| "0.0.0.0:8765".to_string())
        .parse()
        .expect("invalid USBSHARE_RELAY_LISTEN (expected host:port)");

    let usbip = UsbipTools::new();
    if !usbip.ensure_tools().await {
        log::error!("usbip tools not found; device listing and forwarding will fail");
    }
    let devices: Arc<dyn DeviceAccess> = Arc::new(usbip);

    let state = Arc::new(State::new(devices));
    tokio::spawn(liveness_sweeper(state.clone()));

    let routes = routes(state)
        .with(warp::cors().allow_any_origin())
        .with(warp::log("usbshare_relay"));

    log::info!("usbshare-relay listening on {}", listen);
    warp::serve(routes).run(listen).await;
}
