use futures::StreamExt;
use tauri::ipc::Channel;
use tauri::{async_runtime, command, AppHandle, Runtime};
use tracing::{debug, warn};

use crate::error::Result;
use crate::get_bridge;
use crate::models::{DeviceRecord, ScanEvent};

/// Starts a scan. Resolves with the known devices (if asked for) and streams
/// discoveries on `on_event` until the scan stops.
#[command]
pub(crate) async fn start_scan<R: Runtime>(
    _app: AppHandle<R>,
    return_bonded_devices: bool,
    on_event: Channel<ScanEvent>,
) -> Result<Vec<DeviceRecord>> {
    let bridge = get_bridge()?;
    let session = bridge.start_scan(return_bonded_devices).await?;
    let mut events = session.events;
    async_runtime::spawn(async move {
        while let Some(event) = events.next().await {
            let name = event.name();
            if let Err(e) = on_event.send(event) {
                warn!("failed to send {name} to the front-end: {e}");
            }
        }
        debug!("scan event forwarding finished");
    });
    Ok(session.known_devices)
}

#[command]
pub(crate) async fn stop_scan<R: Runtime>(_app: AppHandle<R>) -> Result<()> {
    get_bridge()?.stop_scan().await
}

#[command]
pub(crate) async fn request_permissions<R: Runtime>(_app: AppHandle<R>) -> Result<()> {
    get_bridge()?.request_permissions().await
}

pub fn commands<R: Runtime>() -> impl Fn(tauri::ipc::Invoke<R>) -> bool {
    tauri::generate_handler![start_scan, stop_scan, request_permissions]
}
