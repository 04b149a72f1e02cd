use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::Stream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, error, info, trace, warn};

use crate::capabilities::Capabilities;
use crate::error::{Error, Result};
use crate::host::{
    HostContext, Prompt, REQUEST_ENABLE_BLUETOOTH, REQUEST_LOCATION, REQUEST_PERMISSIONS,
};
use crate::models::{Config, DeviceRecord, RadioState, RawDevice, ScanEvent};

/// Events of a single scan session. Ends after its `ScanStopped`.
pub type ScanEvents = Pin<Box<dyn Stream<Item = ScanEvent> + Send>>;

/// Result of a successful `start_scan`.
pub struct ScanSession {
    pub known_devices: Vec<DeviceRecord>,
    pub events: ScanEvents,
}

#[derive(Clone)]
struct Attached {
    host: Arc<dyn HostContext>,
    capabilities: Capabilities,
}

struct Pending {
    request_code: i32,
    reply: oneshot::Sender<bool>,
}

struct Session {
    id: u64,
    events: mpsc::UnboundedSender<ScanEvent>,
    timer: Option<JoinHandle<()>>,
}

struct Inner {
    config: Config,
    attached: Mutex<Option<Attached>>,
    busy: AtomicBool,
    pending: Mutex<Option<Pending>>,
    session: Mutex<Option<Session>>,
    next_session: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held for the whole precondition chain; clears the prompt slot on release.
struct BusyGuard<'a>(&'a Inner);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        lock(&self.0.pending).take();
        self.0.busy.store(false, Ordering::Release);
    }
}

/// Translates scan requests into host radio operations and streams the
/// discovered devices back.
///
/// Only one permission/radio negotiation runs at a time; a second request
/// while one is pending fails with [`Error::Busy`].
#[derive(Clone)]
pub struct DiscoveryBridge {
    inner: Arc<Inner>,
}

impl DiscoveryBridge {
    pub fn new(config: Config) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                attached: Mutex::new(None),
                busy: AtomicBool::new(false),
                pending: Mutex::new(None),
                session: Mutex::new(None),
                next_session: AtomicU64::new(1),
            }),
        }
    }

    /// Attaches the host. Re-attaching replaces the previous host.
    pub fn initialize(&self, host: Arc<dyn HostContext>) {
        let capabilities = host.capabilities().with_config(&self.inner.config);
        info!("bridge attached: {capabilities:?}");
        *lock(&self.inner.attached) = Some(Attached { host, capabilities });
    }

    /// Stops any running scan, interrupts a pending request and detaches the host.
    pub async fn shutdown(&self) {
        let Some(attached) = lock(&self.inner.attached).clone() else {
            return;
        };
        if let Err(e) = self.stop_session(&attached.host, None).await {
            warn!("failed to stop discovery during shutdown: {e}");
        }
        if lock(&self.inner.pending).take().is_some() {
            debug!("dropping pending request");
        }
        lock(&self.inner.attached).take();
        info!("bridge detached");
    }

    pub fn is_initialized(&self) -> bool {
        lock(&self.inner.attached).is_some()
    }

    pub fn is_scanning(&self) -> bool {
        lock(&self.inner.session).is_some()
    }

    pub fn callbacks(&self) -> BridgeCallbacks {
        BridgeCallbacks {
            inner: Arc::downgrade(&self.inner),
            session: None,
        }
    }

    /// Callbacks that only act on scan session `id`.
    fn session_callbacks(&self, id: u64) -> BridgeCallbacks {
        BridgeCallbacks {
            session: Some(id),
            ..self.callbacks()
        }
    }

    /// Validates the preconditions, then (re)starts discovery.
    ///
    /// With `return_bonded_devices` the devices already known to the OS are
    /// returned immediately; everything else arrives on the session's events.
    pub async fn start_scan(&self, return_bonded_devices: bool) -> Result<ScanSession> {
        let Attached { host, capabilities } = self.attached()?;
        let _busy = self.acquire()?;
        self.validate(&host, &capabilities).await?;

        if self.is_scanning() || host.is_discovering().await? {
            debug!("discovery already running, restarting it");
            self.stop_session(&host, None).await?;
        }

        let known_devices = if return_bonded_devices {
            host.bonded_devices()
                .await?
                .into_iter()
                .map(|d| DeviceRecord::from_raw(d, capabilities.tag_le_names))
                .collect()
        } else {
            vec![]
        };

        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.inner.next_session.fetch_add(1, Ordering::Relaxed);
        host.register_receiver(self.session_callbacks(id))?;
        *lock(&self.inner.session) = Some(Session {
            id,
            events: tx,
            timer: None,
        });
        if let Err(e) = host.start_discovery().await {
            error!("failed to start discovery: {e}");
            lock(&self.inner.session).take();
            if let Err(e) = host.unregister_receiver() {
                warn!("{e}");
            }
            return Err(e);
        }
        info!("scan {id} started, {} known devices", known_devices.len());

        if let Some(timeout) = capabilities.scan_timeout {
            let callbacks = self.callbacks();
            let timer = tokio::spawn(async move {
                sleep(timeout).await;
                callbacks.scan_timed_out(id).await;
            });
            let mut session = lock(&self.inner.session);
            match session.as_mut() {
                Some(s) if s.id == id => s.timer = Some(timer),
                _ => timer.abort(),
            }
        }

        Ok(ScanSession {
            known_devices,
            events: Box::pin(UnboundedReceiverStream::new(rx)),
        })
    }

    /// Cancels discovery and closes the running session, if any.
    pub async fn stop_scan(&self) -> Result<()> {
        let Attached { host, .. } = self.attached()?;
        if !self.stop_session(&host, None).await? {
            debug!("stop requested without a running scan");
        }
        Ok(())
    }

    /// Runs the precondition chain without scanning.
    pub async fn request_permissions(&self) -> Result<()> {
        let Attached { host, capabilities } = self.attached()?;
        let _busy = self.acquire()?;
        self.validate(&host, &capabilities).await
    }

    fn attached(&self) -> Result<Attached> {
        lock(&self.inner.attached)
            .clone()
            .ok_or(Error::NotInitialized)
    }

    fn acquire(&self) -> Result<BusyGuard<'_>> {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::Busy)?;
        Ok(BusyGuard(&self.inner))
    }

    async fn validate(&self, host: &Arc<dyn HostContext>, caps: &Capabilities) -> Result<()> {
        loop {
            match host.radio_state().await? {
                RadioState::PoweredOn => {}
                RadioState::Unsupported => return Err(Error::NoBluetooth),
                RadioState::PoweredOff if caps.can_prompt_enable => {
                    if self.negotiate(host, Prompt::EnableRadio).await? {
                        continue;
                    }
                    return Err(Error::BluetoothDisabled);
                }
                RadioState::PoweredOff => return Err(Error::BluetoothOff),
                state => warn!("radio state is {state:?}, trying anyway"),
            }

            let mut missing = vec![];
            for permission in &caps.permissions {
                if !host.permission_granted(*permission).await? {
                    missing.push(*permission);
                }
            }
            if !missing.is_empty() {
                debug!("missing permissions: {missing:?}");
                if self
                    .negotiate(host, Prompt::Permissions(caps.permissions.clone()))
                    .await?
                {
                    continue;
                }
                return Err(Error::NoPermission);
            }

            if caps.location_gate && !host.location_enabled().await? {
                if self.negotiate(host, Prompt::LocationService).await?
                    && host.location_enabled().await?
                {
                    continue;
                }
                return Err(Error::NoGps);
            }

            return Ok(());
        }
    }

    async fn negotiate(&self, host: &Arc<dyn HostContext>, prompt: Prompt) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        let request_code = prompt.request_code();
        {
            let mut pending = lock(&self.inner.pending);
            if pending.is_some() {
                return Err(Error::Busy);
            }
            *pending = Some(Pending {
                request_code,
                reply: tx,
            });
        }
        debug!("waiting for {} prompt ({request_code})", prompt.label());
        if let Err(e) = host.request(prompt, self.callbacks()).await {
            lock(&self.inner.pending).take();
            return Err(e);
        }
        let answer = rx.await.map_err(|_| Error::Interrupted)?;
        debug!("request {request_code} answered: {answer}");
        Ok(answer)
    }

    /// Cancels discovery and closes the session. With `only`, a session with
    /// another id is left running. Returns whether a session was closed.
    async fn stop_session(&self, host: &Arc<dyn HostContext>, only: Option<u64>) -> Result<bool> {
        let session = take_session(&self.inner, only);
        if only.is_some() && session.is_none() {
            return Ok(false);
        }
        let cancelled = host.cancel_discovery().await;
        let closed = session.is_some();
        if let Some(session) = session {
            finish(session, host.as_ref());
        }
        cancelled.map(|_| closed)
    }
}

fn take_session(inner: &Inner, only: Option<u64>) -> Option<Session> {
    let mut slot = lock(&inner.session);
    let matches = match only {
        Some(id) => slot.as_ref().is_some_and(|s| s.id == id),
        None => true,
    };
    if matches {
        slot.take()
    } else {
        None
    }
}

fn finish(session: Session, host: &dyn HostContext) {
    if let Some(timer) = session.timer {
        timer.abort();
    }
    // receiver gone means the app stopped listening
    let _ = session.events.send(ScanEvent::ScanStopped);
    if let Err(e) = host.unregister_receiver() {
        warn!("{e}");
    }
    info!("scan {} stopped", session.id);
}

/// Weak handle through which the host reports back to the bridge.
///
/// Handles given to a discovery receiver are bound to the scan session they
/// were registered for; reports from an older registration are ignored.
#[derive(Clone)]
pub struct BridgeCallbacks {
    inner: Weak<Inner>,
    session: Option<u64>,
}

impl BridgeCallbacks {
    pub fn device_found(&self, device: RawDevice) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let tag_le = lock(&inner.attached)
            .as_ref()
            .is_some_and(|a| a.capabilities.tag_le_names);
        let session = lock(&inner.session);
        let Some(session) = session
            .as_ref()
            .filter(|s| self.session.map_or(true, |id| id == s.id))
        else {
            trace!("dropping {} outside of its scan", device.address);
            return;
        };
        let record = DeviceRecord::from_raw(device, tag_le);
        trace!("device: {record:?}");
        let _ = session.events.send(ScanEvent::NewDevice(record));
    }

    /// Discovery ended on its own.
    pub fn discovery_finished(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let Some(session) = take_session(&inner, self.session) else {
            trace!("discovery finished for a scan that is already closed");
            return;
        };
        let host = lock(&inner.attached).as_ref().map(|a| a.host.clone());
        match host {
            Some(host) => finish(session, host.as_ref()),
            None => {
                let _ = session.events.send(ScanEvent::ScanStopped);
            }
        }
    }

    /// Answer to an enable-radio or location prompt. Returns whether the
    /// request code belonged to the pending prompt.
    pub fn activity_result(&self, request_code: i32, accepted: bool) -> bool {
        match request_code {
            REQUEST_ENABLE_BLUETOOTH | REQUEST_LOCATION => self.resolve(request_code, accepted),
            _ => false,
        }
    }

    /// Answer to a permission prompt; granted only if every permission was.
    pub fn permissions_result(&self, request_code: i32, grants: &[bool]) -> bool {
        if request_code != REQUEST_PERMISSIONS {
            return false;
        }
        let granted = !grants.is_empty() && grants.iter().all(|g| *g);
        self.resolve(request_code, granted)
    }

    fn resolve(&self, request_code: i32, answer: bool) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut pending = lock(&inner.pending);
        if pending.as_ref().map(|p| p.request_code) != Some(request_code) {
            warn!("no pending request {request_code}");
            return false;
        }
        if let Some(p) = pending.take() {
            let _ = p.reply.send(answer);
        }
        true
    }

    async fn scan_timed_out(&self, id: u64) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        {
            let mut session = lock(&inner.session);
            match session.as_mut() {
                // this task is the timer, it must not abort itself
                Some(s) if s.id == id => drop(s.timer.take()),
                _ => return,
            }
        }
        info!("scan {id} timed out");
        let bridge = DiscoveryBridge { inner };
        let Ok(Attached { host, .. }) = bridge.attached() else {
            return;
        };
        if let Err(e) = bridge.stop_session(&host, Some(id)).await {
            warn!("failed to stop timed out scan: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio_stream::StreamExt;

    use super::*;
    use crate::capabilities::Permission;
    use crate::models::DeviceKind;

    type Prompts = mpsc::UnboundedReceiver<(Prompt, BridgeCallbacks)>;

    struct ScriptedHost {
        caps: Capabilities,
        state: Mutex<RadioState>,
        granted: AtomicBool,
        location: AtomicBool,
        discovering: AtomicBool,
        bonded: Vec<RawDevice>,
        receiver: Mutex<Option<BridgeCallbacks>>,
        prompts: mpsc::UnboundedSender<(Prompt, BridgeCallbacks)>,
        fail_start: AtomicBool,
        starts: AtomicUsize,
        cancels: AtomicUsize,
    }

    impl ScriptedHost {
        fn new(caps: Capabilities) -> (Arc<Self>, Prompts) {
            let (tx, rx) = mpsc::unbounded_channel();
            let host = Arc::new(Self {
                caps,
                state: Mutex::new(RadioState::PoweredOn),
                granted: AtomicBool::new(true),
                location: AtomicBool::new(true),
                discovering: AtomicBool::new(false),
                bonded: vec![
                    RawDevice {
                        name: Some("Headset".into()),
                        address: "00:00:00:00:00:01".into(),
                        kind: DeviceKind::Classic,
                    },
                    RawDevice {
                        name: None,
                        address: "00:00:00:00:00:02".into(),
                        kind: DeviceKind::Le,
                    },
                ],
                receiver: Mutex::new(None),
                prompts: tx,
                fail_start: AtomicBool::new(false),
                starts: AtomicUsize::new(0),
                cancels: AtomicUsize::new(0),
            });
            (host, rx)
        }

        fn set_state(&self, state: RadioState) {
            *lock(&self.state) = state;
        }

        fn registered(&self) -> bool {
            lock(&self.receiver).is_some()
        }

        fn receiver(&self) -> BridgeCallbacks {
            lock(&self.receiver).clone().expect("receiver registered")
        }
    }

    #[async_trait]
    impl HostContext for ScriptedHost {
        fn capabilities(&self) -> Capabilities {
            self.caps.clone()
        }

        async fn radio_state(&self) -> Result<RadioState> {
            Ok(*lock(&self.state))
        }

        async fn permission_granted(&self, _permission: Permission) -> Result<bool> {
            Ok(self.granted.load(Ordering::SeqCst))
        }

        async fn location_enabled(&self) -> Result<bool> {
            Ok(self.location.load(Ordering::SeqCst))
        }

        async fn request(&self, prompt: Prompt, callbacks: BridgeCallbacks) -> Result<()> {
            let _ = self.prompts.send((prompt, callbacks));
            Ok(())
        }

        fn register_receiver(&self, callbacks: BridgeCallbacks) -> Result<()> {
            *lock(&self.receiver) = Some(callbacks);
            Ok(())
        }

        fn unregister_receiver(&self) -> Result<()> {
            lock(&self.receiver)
                .take()
                .map(|_| ())
                .ok_or(Error::ReceiverNotRegistered)
        }

        async fn is_discovering(&self) -> Result<bool> {
            Ok(self.discovering.load(Ordering::SeqCst))
        }

        async fn start_discovery(&self) -> Result<()> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self.fail_start.load(Ordering::SeqCst) {
                return Err(btleplug::Error::RuntimeError("adapter busy".into()).into());
            }
            self.discovering.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn cancel_discovery(&self) -> Result<()> {
            self.cancels.fetch_add(1, Ordering::SeqCst);
            self.discovering.store(false, Ordering::SeqCst);
            Ok(())
        }

        async fn bonded_devices(&self) -> Result<Vec<RawDevice>> {
            Ok(self.bonded.clone())
        }
    }

    fn attach(caps: Capabilities) -> (DiscoveryBridge, Arc<ScriptedHost>, Prompts) {
        let (host, prompts) = ScriptedHost::new(caps);
        let bridge = DiscoveryBridge::new(Config::default());
        bridge.initialize(host.clone());
        (bridge, host, prompts)
    }

    fn found(name: &str, address: &str) -> RawDevice {
        RawDevice {
            name: Some(name.into()),
            address: address.into(),
            kind: DeviceKind::Classic,
        }
    }

    async fn assert_open(events: &mut ScanEvents) {
        let next = tokio::time::timeout(Duration::from_millis(20), events.next()).await;
        assert!(next.is_err(), "expected an open session, got {next:?}");
    }

    #[tokio::test]
    async fn scan_streams_devices_until_stopped() {
        let (bridge, host, _prompts) = attach(Capabilities::android(30));

        let mut session = bridge.start_scan(false).await.unwrap();
        assert!(session.known_devices.is_empty());
        assert_eq!(host.starts.load(Ordering::SeqCst), 1);
        assert!(host.registered());

        let receiver = host.receiver();
        receiver.device_found(found("Speaker", "AA:AA:AA:AA:AA:AA"));
        receiver.device_found(found("Speaker", "AA:AA:AA:AA:AA:AA"));
        for _ in 0..2 {
            assert_eq!(
                session.events.next().await,
                Some(ScanEvent::NewDevice(DeviceRecord {
                    name: "Speaker".into(),
                    address: "AA:AA:AA:AA:AA:AA".into(),
                }))
            );
        }

        bridge.stop_scan().await.unwrap();
        receiver.device_found(found("Late", "BB:BB:BB:BB:BB:BB"));
        assert_eq!(session.events.next().await, Some(ScanEvent::ScanStopped));
        assert_eq!(session.events.next().await, None);
        assert!(!host.registered());
        assert!(!bridge.is_scanning());
    }

    #[tokio::test]
    async fn returns_bonded_devices_when_asked() {
        let (bridge, _host, _prompts) = attach(Capabilities::android(30));
        let session = bridge.start_scan(true).await.unwrap();
        assert_eq!(
            session.known_devices,
            vec![
                DeviceRecord {
                    name: "Headset".into(),
                    address: "00:00:00:00:00:01".into(),
                },
                DeviceRecord {
                    name: "00:00:00:00:00:02-LE".into(),
                    address: "00:00:00:00:00:02".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn stop_without_scan_is_a_no_op() {
        let (bridge, host, _prompts) = attach(Capabilities::android(30));
        bridge.stop_scan().await.unwrap();
        bridge.stop_scan().await.unwrap();
        assert_eq!(host.cancels.load(Ordering::SeqCst), 2);
        assert!(!host.registered());
    }

    #[tokio::test]
    async fn declined_enable_prompt_fails_without_scanning() {
        let (bridge, host, mut prompts) = attach(Capabilities::android(30));
        host.set_state(RadioState::PoweredOff);

        let scan = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_scan(true).await.map(|s| s.known_devices) }
        });
        let (prompt, callbacks) = prompts.recv().await.unwrap();
        assert_eq!(prompt, Prompt::EnableRadio);
        assert!(callbacks.activity_result(REQUEST_ENABLE_BLUETOOTH, false));

        let err = scan.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "error_bluetooth_disabled");
        assert_eq!(host.starts.load(Ordering::SeqCst), 0);
        assert!(!host.registered());
    }

    #[tokio::test]
    async fn accepted_enable_prompt_resumes_the_scan() {
        let (bridge, host, mut prompts) = attach(Capabilities::android(30));
        host.set_state(RadioState::PoweredOff);

        let scan = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_scan(false).await.map(|s| s.known_devices) }
        });
        let (_, callbacks) = prompts.recv().await.unwrap();
        host.set_state(RadioState::PoweredOn);
        assert!(callbacks.activity_result(REQUEST_ENABLE_BLUETOOTH, true));

        assert!(scan.await.unwrap().unwrap().is_empty());
        assert_eq!(host.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn denied_permissions_fail_without_registration() {
        let (bridge, host, mut prompts) = attach(Capabilities::android(30));
        host.granted.store(false, Ordering::SeqCst);

        let scan = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_scan(false).await.map(|_| ()) }
        });
        let (prompt, callbacks) = prompts.recv().await.unwrap();
        assert_eq!(
            prompt,
            Prompt::Permissions(vec![
                Permission::AccessFineLocation,
                Permission::Bluetooth,
                Permission::BluetoothAdmin,
            ])
        );
        assert!(callbacks.permissions_result(REQUEST_PERMISSIONS, &[true, false, true]));

        let err = scan.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "error_no_permission");
        assert!(!host.registered());
        assert_eq!(host.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn granted_permissions_then_location_prompt() {
        let (bridge, host, mut prompts) = attach(Capabilities::android(29));
        host.granted.store(false, Ordering::SeqCst);
        host.location.store(false, Ordering::SeqCst);

        let request = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.request_permissions().await }
        });

        let (_, callbacks) = prompts.recv().await.unwrap();
        host.granted.store(true, Ordering::SeqCst);
        assert!(callbacks.permissions_result(REQUEST_PERMISSIONS, &[true, true, true]));

        let (prompt, callbacks) = prompts.recv().await.unwrap();
        assert_eq!(prompt, Prompt::LocationService);
        assert!(callbacks.activity_result(REQUEST_LOCATION, true));

        // accepted but the service is still off
        let err = request.await.unwrap().unwrap_err();
        assert_eq!(err.code(), "error_no_gps");
        assert_eq!(host.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn android_12_skips_the_location_gate() {
        let (bridge, host, _prompts) = attach(Capabilities::android(31));
        host.location.store(false, Ordering::SeqCst);
        bridge.request_permissions().await.unwrap();
    }

    #[tokio::test]
    async fn second_request_while_pending_is_busy() {
        let (bridge, host, mut prompts) = attach(Capabilities::android(30));
        host.set_state(RadioState::PoweredOff);

        let first = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_scan(false).await.map(|_| ()) }
        });
        let (_, callbacks) = prompts.recv().await.unwrap();

        let err = bridge.start_scan(false).await.err().unwrap();
        assert_eq!(err.code(), "error_busy");
        let err = bridge.request_permissions().await.unwrap_err();
        assert_eq!(err.code(), "error_busy");

        assert!(callbacks.activity_result(REQUEST_ENABLE_BLUETOOTH, false));
        assert_eq!(first.await.unwrap().unwrap_err().code(), "error_bluetooth_disabled");

        // slot released once the first request resolved
        host.set_state(RadioState::PoweredOn);
        bridge.start_scan(false).await.unwrap();
    }

    #[tokio::test]
    async fn unmatched_request_codes_are_not_handled() {
        let (bridge, host, mut prompts) = attach(Capabilities::android(30));
        host.set_state(RadioState::PoweredOff);

        let scan = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_scan(false).await.map(|_| ()) }
        });
        let (_, callbacks) = prompts.recv().await.unwrap();
        assert!(!callbacks.activity_result(42, true));
        assert!(!callbacks.activity_result(REQUEST_LOCATION, true));
        assert!(!callbacks.permissions_result(REQUEST_PERMISSIONS, &[true]));
        assert!(callbacks.activity_result(REQUEST_ENABLE_BLUETOOTH, false));
        assert!(scan.await.unwrap().is_err());
    }

    #[tokio::test]
    async fn apple_radio_states_fail_fast() {
        let (bridge, host, _prompts) = attach(Capabilities::apple());
        host.set_state(RadioState::PoweredOff);
        assert_eq!(
            bridge.start_scan(false).await.err().unwrap().code(),
            "error_bt_off"
        );
        host.set_state(RadioState::Unsupported);
        assert_eq!(
            bridge.start_scan(false).await.err().unwrap().code(),
            "error_no_bt"
        );
        assert_eq!(host.starts.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn apple_scan_stops_after_timeout() {
        let (bridge, host, _prompts) = attach(Capabilities::apple());
        let mut session = bridge.start_scan(false).await.unwrap();

        tokio::time::sleep(Duration::from_secs(14)).await;
        assert!(bridge.is_scanning());

        assert_eq!(session.events.next().await, Some(ScanEvent::ScanStopped));
        assert_eq!(session.events.next().await, None);
        assert_eq!(host.cancels.load(Ordering::SeqCst), 1);
        assert!(!host.registered());

        // explicit stop afterwards emits nothing more
        bridge.stop_scan().await.unwrap();
        assert_eq!(session.events.next().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn stale_timer_leaves_new_session_running() {
        let (bridge, _host, _prompts) = attach(Capabilities::apple());
        let mut first = bridge.start_scan(false).await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        let mut second = bridge.start_scan(false).await.unwrap();
        assert_eq!(first.events.next().await, Some(ScanEvent::ScanStopped));
        assert_eq!(first.events.next().await, None);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_open(&mut second.events).await;
        assert!(bridge.is_scanning());
    }

    #[tokio::test]
    async fn restarting_closes_the_previous_session() {
        let (bridge, host, _prompts) = attach(Capabilities::android(30));
        let mut first = bridge.start_scan(false).await.unwrap();
        let mut second = bridge.start_scan(false).await.unwrap();

        assert_eq!(first.events.next().await, Some(ScanEvent::ScanStopped));
        assert_eq!(first.events.next().await, None);
        assert_eq!(host.starts.load(Ordering::SeqCst), 2);

        host.receiver().device_found(found("Speaker", "AA"));
        assert!(matches!(
            second.events.next().await,
            Some(ScanEvent::NewDevice(_))
        ));
    }

    #[tokio::test]
    async fn late_reports_from_a_previous_receiver_are_ignored() {
        let (bridge, host, _prompts) = attach(Capabilities::android(30));
        let mut first = bridge.start_scan(false).await.unwrap();
        let stale = host.receiver();
        let mut second = bridge.start_scan(false).await.unwrap();
        assert_eq!(first.events.next().await, Some(ScanEvent::ScanStopped));

        // the cancelled discovery reports its end after the restart
        stale.discovery_finished();
        stale.device_found(found("Ghost", "CC:CC:CC:CC:CC:CC"));
        assert!(bridge.is_scanning());
        assert!(host.registered());
        assert_open(&mut second.events).await;

        host.receiver().discovery_finished();
        assert_eq!(second.events.next().await, Some(ScanEvent::ScanStopped));
        assert_eq!(second.events.next().await, None);
    }

    #[tokio::test]
    async fn failed_discovery_start_rolls_back() {
        let (bridge, host, _prompts) = attach(Capabilities::android(30));
        host.fail_start.store(true, Ordering::SeqCst);

        let err = bridge.start_scan(false).await.err().unwrap();
        assert_eq!(err.code(), "error_platform");
        assert!(!bridge.is_scanning());
        assert!(!host.registered());

        // nothing is left half-open for the next attempt
        host.fail_start.store(false, Ordering::SeqCst);
        bridge.start_scan(false).await.unwrap();
        assert!(host.registered());
    }

    #[tokio::test]
    async fn natural_completion_stops_once() {
        let (bridge, host, _prompts) = attach(Capabilities::android(30));
        let mut session = bridge.start_scan(false).await.unwrap();
        let receiver = host.receiver();

        receiver.discovery_finished();
        receiver.discovery_finished();
        bridge.stop_scan().await.unwrap();

        assert_eq!(session.events.next().await, Some(ScanEvent::ScanStopped));
        assert_eq!(session.events.next().await, None);
        assert!(!host.registered());
    }

    #[tokio::test]
    async fn shutdown_interrupts_pending_request() {
        let (bridge, host, mut prompts) = attach(Capabilities::android(30));
        host.set_state(RadioState::PoweredOff);

        let scan = tokio::spawn({
            let bridge = bridge.clone();
            async move { bridge.start_scan(false).await.map(|_| ()) }
        });
        let _ = prompts.recv().await.unwrap();
        bridge.shutdown().await;

        assert_eq!(scan.await.unwrap().unwrap_err().code(), "error_interrupted");
        assert!(!bridge.is_initialized());
        assert_eq!(
            bridge.stop_scan().await.unwrap_err().code(),
            "error_not_initialized"
        );
    }

    #[tokio::test]
    async fn operations_require_initialization() {
        let bridge = DiscoveryBridge::new(Config::default());
        assert_eq!(
            bridge.start_scan(false).await.err().unwrap().code(),
            "error_not_initialized"
        );
        assert_eq!(
            bridge.request_permissions().await.unwrap_err().code(),
            "error_not_initialized"
        );
    }
}
