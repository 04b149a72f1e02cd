use std::sync::Arc;

use once_cell::sync::OnceCell;
use tauri::{
    async_runtime,
    plugin::{Builder, PluginApi, TauriPlugin},
    AppHandle, Runtime,
};
use tracing::error;

pub use bridge::{BridgeCallbacks, DiscoveryBridge, ScanEvents, ScanSession};
pub use capabilities::{Capabilities, Permission};
pub use error::{Error, Result};
pub use host::{HostContext, Prompt};
pub use models::*;

mod bridge;
mod capabilities;
mod commands;
#[cfg(desktop)]
mod desktop;
mod error;
mod host;
#[cfg(mobile)]
mod mobile;
mod models;

static BRIDGE: OnceCell<DiscoveryBridge> = OnceCell::new();

/// Initializes the plugin.
///
/// A missing `plugins.scan-bluetooth` section arrives as `None`.
pub fn init<R: Runtime>() -> TauriPlugin<R, Option<Config>> {
    Builder::<R, Option<Config>>::new("scan-bluetooth")
        .invoke_handler(commands::commands())
        .setup(|app, api| {
            let config = api.config().clone().unwrap_or_default();
            let bridge = BRIDGE.get_or_init(|| DiscoveryBridge::new(config));
            bridge.initialize(attach_host(app, api)?);
            Ok(())
        })
        .on_drop(|_app| {
            if let Some(bridge) = BRIDGE.get() {
                async_runtime::block_on(bridge.shutdown());
            }
        })
        .build()
}

#[cfg(desktop)]
fn attach_host<R: Runtime>(
    _app: &AppHandle<R>,
    _api: PluginApi<R, Option<Config>>,
) -> Result<Arc<dyn HostContext>> {
    Ok(Arc::new(async_runtime::block_on(desktop::init())))
}

#[cfg(mobile)]
fn attach_host<R: Runtime>(
    app: &AppHandle<R>,
    api: PluginApi<R, Option<Config>>,
) -> Result<Arc<dyn HostContext>> {
    Ok(Arc::new(mobile::init(app, api)?))
}

pub fn get_bridge() -> Result<&'static DiscoveryBridge> {
    let bridge = BRIDGE.get().ok_or(Error::NotInitialized)?;
    if !bridge.is_initialized() {
        error!("scan-bluetooth used before setup or after shutdown");
        return Err(Error::NotInitialized);
    }
    Ok(bridge)
}
