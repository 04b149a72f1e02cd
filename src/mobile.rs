use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tauri::{
    ipc::{Channel, InvokeResponseBody},
    plugin::{PluginApi, PluginHandle},
    AppHandle, Runtime,
};
use tracing::{debug, error, trace};

use crate::bridge::BridgeCallbacks;
use crate::capabilities::{Capabilities, Permission};
use crate::error::{Error, Result};
use crate::host::{HostContext, Prompt, REQUEST_PERMISSIONS};
use crate::models::{RadioState, RawDevice};

#[cfg(target_os = "ios")]
tauri::ios_plugin_binding!(init_plugin_scan_bluetooth);

#[cfg(target_os = "android")]
const PLUGIN_IDENTIFIER: &str = "app.tauri.scanbluetooth";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlatformInfo {
    platform: String,
    #[serde(default)]
    api_level: u32,
}

#[derive(Deserialize)]
struct BoolResult {
    result: bool,
}

#[derive(Deserialize)]
struct StateResult {
    state: RadioState,
}

#[derive(Deserialize)]
struct DevicesResult {
    result: Vec<RawDevice>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptAnswer {
    request_code: i32,
    #[serde(default)]
    accepted: bool,
    #[serde(default)]
    grants: Vec<bool>,
}

#[derive(Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum ReceiverEvent {
    DeviceFound { device: RawDevice },
    DiscoveryFinished,
}

// initializes the Kotlin or Swift plugin classes
pub fn init<R: Runtime, C: DeserializeOwned>(
    _app: &AppHandle<R>,
    api: PluginApi<R, C>,
) -> Result<NativeHost<R>> {
    #[cfg(target_os = "android")]
    let handle = api.register_android_plugin(PLUGIN_IDENTIFIER, "ScanBluetoothPlugin")?;
    #[cfg(target_os = "ios")]
    let handle = api.register_ios_plugin(init_plugin_scan_bluetooth)?;

    let info: PlatformInfo = handle.run_mobile_plugin("platform_info", serde_json::Value::Null)?;
    let capabilities = match info.platform.as_str() {
        "android" => Capabilities::android(info.api_level),
        _ => Capabilities::apple(),
    };
    debug!("native platform {} (api {})", info.platform, info.api_level);
    Ok(NativeHost {
        handle,
        capabilities,
    })
}

/// Host implemented by the native plugin shipped with the app.
pub struct NativeHost<R: Runtime> {
    handle: PluginHandle<R>,
    capabilities: Capabilities,
}

impl<R: Runtime> NativeHost<R> {
    fn run<T: DeserializeOwned>(&self, command: &str, payload: impl Serialize) -> Result<T> {
        Ok(self.handle.run_mobile_plugin(command, payload)?)
    }

    fn run_unit(&self, command: &str) -> Result<()> {
        self.run::<serde_json::Value>(command, serde_json::Value::Null)?;
        Ok(())
    }
}

fn on_prompt_answer(
    callbacks: &BridgeCallbacks,
    response: InvokeResponseBody,
) -> std::result::Result<(), tauri::Error> {
    let answer = match response.deserialize::<PromptAnswer>() {
        Ok(answer) => answer,
        Err(e) => {
            error!("failed to deserialize prompt answer: {:?}", e);
            return Err(tauri::Error::from(e));
        }
    };
    let handled = if answer.request_code == REQUEST_PERMISSIONS {
        callbacks.permissions_result(answer.request_code, &answer.grants)
    } else {
        callbacks.activity_result(answer.request_code, answer.accepted)
    };
    if !handled {
        debug!("ignored answer for request {}", answer.request_code);
    }
    Ok(())
}

fn on_receiver_event(
    callbacks: &BridgeCallbacks,
    response: InvokeResponseBody,
) -> std::result::Result<(), tauri::Error> {
    match response.deserialize::<ReceiverEvent>() {
        Ok(ReceiverEvent::DeviceFound { device }) => {
            trace!("device: {device:?}");
            callbacks.device_found(device);
        }
        Ok(ReceiverEvent::DiscoveryFinished) => callbacks.discovery_finished(),
        Err(e) => {
            error!("failed to deserialize receiver event: {:?}", e);
            return Err(tauri::Error::from(e));
        }
    }
    Ok(())
}

#[async_trait]
impl<R: Runtime> HostContext for NativeHost<R> {
    fn capabilities(&self) -> Capabilities {
        self.capabilities.clone()
    }

    async fn radio_state(&self) -> Result<RadioState> {
        let res: StateResult = self.run("radio_state", serde_json::Value::Null)?;
        Ok(res.state)
    }

    async fn permission_granted(&self, permission: Permission) -> Result<bool> {
        let res: BoolResult = self.run(
            "permission_granted",
            serde_json::json!({ "permission": permission }),
        )?;
        Ok(res.result)
    }

    async fn location_enabled(&self) -> Result<bool> {
        let res: BoolResult = self.run("location_enabled", serde_json::Value::Null)?;
        Ok(res.result)
    }

    async fn request(&self, prompt: Prompt, callbacks: BridgeCallbacks) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct RequestParams {
            request_code: i32,
            prompt: Prompt,
            on_result: Channel,
        }
        let on_result = Channel::new(move |response| on_prompt_answer(&callbacks, response));
        self.run::<serde_json::Value>(
            "request",
            RequestParams {
                request_code: prompt.request_code(),
                prompt,
                on_result,
            },
        )?;
        Ok(())
    }

    fn register_receiver(&self, callbacks: BridgeCallbacks) -> Result<()> {
        #[derive(Serialize)]
        #[serde(rename_all = "camelCase")]
        struct ReceiverParams {
            on_event: Channel,
        }
        let on_event = Channel::new(move |response| on_receiver_event(&callbacks, response));
        self.run::<serde_json::Value>("register_receiver", ReceiverParams { on_event })?;
        Ok(())
    }

    fn unregister_receiver(&self) -> Result<()> {
        let res: BoolResult = self.run("unregister_receiver", serde_json::Value::Null)?;
        if !res.result {
            return Err(Error::ReceiverNotRegistered);
        }
        Ok(())
    }

    async fn is_discovering(&self) -> Result<bool> {
        let res: BoolResult = self.run("is_discovering", serde_json::Value::Null)?;
        Ok(res.result)
    }

    async fn start_discovery(&self) -> Result<()> {
        self.run_unit("start_discovery")
    }

    async fn cancel_discovery(&self) -> Result<()> {
        self.run_unit("cancel_discovery")
    }

    async fn bonded_devices(&self) -> Result<Vec<RawDevice>> {
        let res: DevicesResult = self.run("bonded_devices", serde_json::Value::Null)?;
        Ok(res.result)
    }
}
