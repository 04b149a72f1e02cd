use std::collections::HashSet;
use std::hash::Hash;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::{future, Stream, StreamExt};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::bridge::BridgeCallbacks;
use crate::capabilities::{Capabilities, Permission};
use crate::error::{Error, Result};
use crate::host::{HostContext, Prompt};
use crate::models::{DeviceKind, RadioState, RawDevice};

async fn get_central() -> Result<Option<Adapter>> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;
    Ok(adapters.into_iter().next())
}

/// Host backed by the first btleplug adapter. A machine without an adapter
/// still gets a host, reporting the radio as unsupported.
pub struct BtleplugHost {
    adapter: Option<Adapter>,
    scanning: AtomicBool,
    listen_handle: Mutex<Option<JoinHandle<()>>>,
}

pub async fn init() -> BtleplugHost {
    BtleplugHost::from_central(get_central().await)
}

impl BtleplugHost {
    /// A failing platform stack (no BlueZ, no system bus) counts as missing
    /// hardware instead of failing plugin setup.
    fn from_central(central: Result<Option<Adapter>>) -> Self {
        let adapter = match central {
            Ok(Some(adapter)) => Some(adapter),
            Ok(None) => {
                debug!("no bluetooth adapters found");
                None
            }
            Err(e) => {
                error!("bluetooth manager unavailable: {e}");
                None
            }
        };
        Self {
            adapter,
            scanning: AtomicBool::new(false),
            listen_handle: Mutex::new(None),
        }
    }

    fn adapter(&self) -> Result<&Adapter> {
        self.adapter.as_ref().ok_or(Error::NoBluetooth)
    }

    fn listen_handle(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.listen_handle
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

async fn to_raw(peripheral: &Peripheral) -> Result<RawDevice> {
    #[cfg(target_vendor = "apple")]
    let address = peripheral.id().to_string();
    #[cfg(not(target_vendor = "apple"))]
    let address = peripheral.address().to_string();
    let name = peripheral.properties().await?.and_then(|p| p.local_name);
    Ok(RawDevice {
        name,
        address,
        kind: DeviceKind::Le,
    })
}

/// Passes each id through once. The adapter cache turns repeat sightings
/// into updates, so every registration tracks what it already reported.
fn first_sightings<I, S>(ids: S) -> impl Stream<Item = I>
where
    I: Hash + Eq + Clone,
    S: Stream<Item = I>,
{
    let mut seen = HashSet::new();
    ids.filter(move |id| future::ready(seen.insert(id.clone())))
}

async fn listen_discoveries(adapter: Adapter, callbacks: BridgeCallbacks) {
    let events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            error!("failed to get adapter events: {e}");
            return;
        }
    };
    let ids = events.filter_map(|event| {
        future::ready(match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => Some(id),
            _ => None,
        })
    });
    let mut ids = Box::pin(first_sightings(ids));
    while let Some(id) = ids.next().await {
        let device = match adapter.peripheral(&id).await {
            Ok(p) => to_raw(&p).await,
            Err(e) => Err(e.into()),
        };
        match device {
            Ok(device) => callbacks.device_found(device),
            Err(e) => error!("Failed to add device: {e}"),
        }
    }
    trace!("adapter event stream ended");
}

#[async_trait]
impl HostContext for BtleplugHost {
    fn capabilities(&self) -> Capabilities {
        Capabilities::desktop()
    }

    async fn radio_state(&self) -> Result<RadioState> {
        match &self.adapter {
            Some(adapter) => Ok(adapter.adapter_state().await?.into()),
            None => Ok(RadioState::Unsupported),
        }
    }

    async fn permission_granted(&self, _permission: Permission) -> Result<bool> {
        Ok(true)
    }

    async fn location_enabled(&self) -> Result<bool> {
        Ok(true)
    }

    async fn request(&self, prompt: Prompt, _callbacks: BridgeCallbacks) -> Result<()> {
        Err(Error::PromptUnsupported(prompt.label()))
    }

    fn register_receiver(&self, callbacks: BridgeCallbacks) -> Result<()> {
        let adapter = self.adapter()?.clone();
        let handle = tokio::spawn(listen_discoveries(adapter, callbacks));
        if let Some(previous) = self.listen_handle().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    fn unregister_receiver(&self) -> Result<()> {
        let handle = self
            .listen_handle()
            .take()
            .ok_or(Error::ReceiverNotRegistered)?;
        handle.abort();
        Ok(())
    }

    async fn is_discovering(&self) -> Result<bool> {
        Ok(self.scanning.load(Ordering::Acquire))
    }

    async fn start_discovery(&self) -> Result<()> {
        self.adapter()?.start_scan(ScanFilter::default()).await?;
        self.scanning.store(true, Ordering::Release);
        Ok(())
    }

    async fn cancel_discovery(&self) -> Result<()> {
        let Some(adapter) = &self.adapter else {
            return Ok(());
        };
        if self.scanning.swap(false, Ordering::AcqRel) {
            adapter.stop_scan().await?;
        }
        Ok(())
    }

    /// Connected peripherals stand in for bonded devices.
    async fn bonded_devices(&self) -> Result<Vec<RawDevice>> {
        let mut devices = vec![];
        for p in self.adapter()?.peripherals().await? {
            if p.is_connected().await? {
                devices.push(to_raw(&p).await?);
            }
        }
        Ok(devices)
    }
}
