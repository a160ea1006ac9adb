//! The bridge itself: owns the scan, the subscription session and the retry
//! policy, and applies decoded button actions on the host.
//!
//! All work runs as jobs on one dispatch gate. The public operations only
//! enqueue, so they can be called from anywhere, and their effects keep the
//! order the calls were made in.

use std::sync::{Arc, Weak};

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::config::SharedPreferences;
use crate::core::decoder::{DecodeOptions, Decoded, LocalActionSink, decode};
use crate::core::dispatch::Dispatcher;
use crate::core::scanner::{PeripheralScanner, ScanHandler};
use crate::core::subscription::{SubscriptionCallback, SubscriptionManager};
use crate::core::transport::{GattConnection, GattTransport, PeripheralInfo, TransportError};
use crate::error::{ConnectionError, SubscriptionError};

/// The status should be brought to the user's attention
pub const STATUS_IMPORTANT: u8 = 0x01;
/// The status may make noise (sound, vibration)
pub const STATUS_NOISE: u8 = 0x02;
/// The status should offer a retry affordance
pub const STATUS_RETRY: u8 = 0x04;

/// Status surface of the bridge, implemented by the embedding layer
///
/// `update_status` replaces the previously shown status. `on_shutdown` means
/// the bridge finished stopping and the embedder may release it. Called from
/// gate jobs; implementations must not block.
pub trait PresentationSink: Send + Sync {
    fn update_status(&self, message: &str, flags: u8);
    fn on_shutdown(&self);
}

/// Platform oddities the bridge works around
#[derive(Debug, Clone, Copy, Default)]
pub struct HostQuirks {
    /// The host cannot flip ringer modes; ringer substitution swallows the
    /// mute command instead of falling back to a mute toggle
    pub ringer_toggle_unsupported: bool,
}

struct Session {
    started: bool,
    /// Set once an error made the link untrustworthy; teardown then runs
    /// forced instead of waiting for completions
    failed: bool,
    /// Number of stop requests since the bridge started
    stopping: u32,
    retries: u32,
    peripheral: Option<PeripheralInfo>,
    scanner: Option<PeripheralScanner>,
    connection: Option<Arc<dyn GattConnection>>,
    subscription: Option<SubscriptionManager>,
}

struct BridgeCore {
    transport: Arc<dyn GattTransport>,
    preferences: SharedPreferences,
    actions: Arc<dyn LocalActionSink>,
    presentation: Arc<dyn PresentationSink>,
    quirks: HostQuirks,
    dispatcher: Dispatcher,
    /// Only touched from gate jobs
    session: Mutex<Session>,
}

/// Control channel to the remote control
#[derive(Clone)]
pub struct RemoteBridge {
    core: Arc<BridgeCore>,
}

impl RemoteBridge {
    pub fn new(
        transport: Arc<dyn GattTransport>,
        preferences: SharedPreferences,
        actions: Arc<dyn LocalActionSink>,
        presentation: Arc<dyn PresentationSink>,
        quirks: HostQuirks,
    ) -> Self {
        let core = Arc::new(BridgeCore {
            transport,
            preferences,
            actions,
            presentation,
            quirks,
            dispatcher: Dispatcher::new(),
            session: Mutex::new(Session {
                started: false,
                failed: false,
                stopping: 0,
                retries: 0,
                peripheral: None,
                scanner: None,
                connection: None,
                subscription: None,
            }),
        });
        Self { core }
    }

    /// Starts scanning for the remote control. Idempotent while running.
    pub fn start(&self) {
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.do_start().await;
        });
    }

    /// Begins a graceful stop, or forces it on the second call: the first
    /// request stops the scan and unsubscribes step by step, a repeated
    /// request tears the connection down without waiting.
    pub fn stop_if_started(&self) {
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.do_stop_if_started().await;
        });
    }

    /// Tears the current session down and tries again, rescanning when no
    /// peripheral is known yet
    pub fn retry(&self) {
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.do_retry().await;
        });
    }

    /// Stops the dispatch gate. Only call after the presentation sink saw
    /// `on_shutdown`; jobs still queued are dropped.
    pub fn shutdown(&self) {
        self.core.dispatcher.shutdown();
    }
}

impl BridgeCore {
    async fn do_start(self: &Arc<Self>) {
        {
            let mut session = self.session.lock().await;
            if session.started {
                debug!("Already started");
                return;
            }
            session.started = true;
            session.stopping = 0;
        }
        info!("Starting the remote control bridge");
        self.presentation
            .update_status("Scanning for the remote control", 0);
        self.start_scan().await;
    }

    async fn start_scan(self: &Arc<Self>) {
        let bonded_only = self.preferences.bonded_only().await;
        let handler = Arc::new(BridgeScanEvents {
            core: Arc::downgrade(self),
            dispatcher: self.dispatcher.clone(),
        });
        let scanner = PeripheralScanner::start(self.transport.clone(), bonded_only, handler);
        self.session.lock().await.scanner = Some(scanner);
    }

    async fn handle_peripheral_found(self: &Arc<Self>, peripheral: PeripheralInfo) {
        {
            let mut session = self.session.lock().await;
            if let Some(scanner) = session.scanner.take() {
                scanner.stop();
            }
            session.peripheral = Some(peripheral);
        }
        self.subscribe().await;
    }

    async fn handle_scan_failed(&self, error: TransportError) {
        self.session.lock().await.scanner = None;
        self.presentation.update_status(
            &format!("Scan failed: {}", error),
            STATUS_IMPORTANT | STATUS_NOISE,
        );
    }

    /// Opens a fresh subscription session to the remembered peripheral
    async fn subscribe(self: &Arc<Self>) {
        let peripheral = self.session.lock().await.peripheral.clone();
        let Some(peripheral) = peripheral else {
            self.presentation
                .update_status("No remote control found", STATUS_IMPORTANT | STATUS_NOISE);
            return;
        };
        self.presentation
            .update_status(&format!("Connecting to {}", peripheral.label()), 0);
        let local_name = self.transport.local_name().unwrap_or_else(|| {
            debug!("No local adapter name, sending an empty name");
            String::new()
        });
        let delay = self.preferences.gatt_delay().await;
        let manager = {
            let mut session = self.session.lock().await;
            session.retries = 0;
            session.failed = false;
            let manager = SubscriptionManager::new(
                self.subscription_callback(),
                &local_name,
                self.dispatcher.clone(),
                delay,
            );
            session.subscription = Some(manager.clone());
            manager
        };
        self.connect(peripheral, manager).await;
    }

    async fn connect(self: &Arc<Self>, peripheral: PeripheralInfo, manager: SubscriptionManager) {
        match self
            .transport
            .connect(&peripheral.id, manager.transport_sink())
            .await
        {
            Ok(connection) => {
                manager.bind_connection(connection.clone()).await;
                self.session.lock().await.connection = Some(connection);
            }
            Err(e) => {
                warn!("Connection request for {} rejected: {}", peripheral.id, e);
                self.handle_connection_error(ConnectionError::ConnectRejected)
                    .await;
            }
        }
    }

    fn subscription_callback(self: &Arc<Self>) -> Arc<dyn SubscriptionCallback> {
        Arc::new(BridgeSessionEvents {
            core: Arc::downgrade(self),
            dispatcher: self.dispatcher.clone(),
        })
    }

    async fn do_stop_if_started(&self) {
        let stopping = {
            let mut session = self.session.lock().await;
            if !session.started {
                debug!("Not started, nothing to stop");
                return;
            }
            session.stopping += 1;
            session.stopping
        };
        if stopping == 1 {
            info!("Stopping the remote control bridge");
            if let Some(scanner) = self.session.lock().await.scanner.take() {
                scanner.stop();
            }
            self.unsubscribe().await;
        } else {
            // A repeated stop request does not wait for the graceful walk.
            info!("Stop requested again, tearing down");
            self.unhook().await;
            self.handle_unhooked().await;
        }
    }

    async fn unsubscribe(&self) {
        let (subscription, failed) = {
            let session = self.session.lock().await;
            (session.subscription.clone(), session.failed)
        };
        let Some(subscription) = subscription else {
            // Nothing ever subscribed; complete the stop directly.
            self.handle_subscription_changed(false).await;
            return;
        };
        if failed {
            // The link is not trusted to deliver completions anymore.
            subscription.set_callback(None).await;
            subscription.unsubscribe_from_notifications(true).await;
            self.handle_subscription_changed(false).await;
        } else {
            subscription.unsubscribe_from_notifications(false).await;
        }
    }

    /// Boxed so the connection-error path can re-enter it: a rejected
    /// attempt comes back here through [`BridgeCore::handle_connection_error`].
    fn do_retry(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let core = self.clone();
        async move {
            let (connection, subscription) = {
                let session = core.session.lock().await;
                (session.connection.clone(), session.subscription.clone())
            };
            let (connection, subscription) = match (connection, subscription) {
                (Some(connection), Some(subscription)) => (connection, subscription),
                (_, remnant) => {
                    // Never got a full session: tear down whatever remains
                    // and start over.
                    if let Some(subscription) = remnant {
                        subscription.set_callback(None).await;
                        subscription.unsubscribe_from_notifications(true).await;
                    }
                    core.unhook().await;
                    if core.session.lock().await.peripheral.is_some() {
                        // Paced like a reconnect, so a transport that keeps
                        // rejecting connects is not hammered in a tight loop.
                        let interval = core.preferences.retry_interval().await;
                        let step = core.clone();
                        core.dispatcher.dispatch_after(interval, async move {
                            step.subscribe().await;
                        });
                    } else {
                        core.presentation
                            .update_status("Scanning for the remote control", 0);
                        core.start_scan().await;
                    }
                    return;
                }
            };
            let (retries, label) = {
                let mut session = core.session.lock().await;
                session.retries += 1;
                session.failed = false;
                (
                    session.retries,
                    session.peripheral.as_ref().map(|p| p.label().to_string()),
                )
            };
            let message = match label {
                Some(label) => format!("Reconnecting to {} (attempt {})", label, retries),
                None => format!("Reconnecting to the remote control (attempt {})", retries),
            };
            core.presentation.update_status(&message, 0);
            subscription.set_callback(None).await;
            subscription.unsubscribe_from_notifications(true).await;
            subscription.reset(core.subscription_callback()).await;
            let interval = core.preferences.retry_interval().await;
            let step = core.clone();
            core.dispatcher.dispatch_after(interval, async move {
                if connection.reconnect().await.is_err() {
                    warn!("Reconnect rejected, subscribing from scratch");
                    step.subscribe().await;
                }
            });
        }
        .boxed()
    }

    async fn handle_connection_error(self: &Arc<Self>, error: ConnectionError) {
        if self.preferences.auto_retry().await {
            info!("Connection error, retrying automatically: {}", error);
            self.do_retry().await;
            return;
        }
        let label = {
            let mut session = self.session.lock().await;
            session.failed = true;
            session
                .peripheral
                .as_ref()
                .map(|p| p.label().to_string())
                .unwrap_or_else(|| String::from("Remote control"))
        };
        self.presentation.update_status(
            &format!("{}: {}", label, error),
            STATUS_IMPORTANT | STATUS_NOISE | STATUS_RETRY,
        );
    }

    async fn handle_subscription_error(&self, error: SubscriptionError) {
        self.session.lock().await.failed = true;
        self.presentation
            .update_status(&error.to_string(), STATUS_IMPORTANT | STATUS_NOISE);
    }

    async fn handle_subscription_changed(&self, subscribed: bool) {
        if subscribed {
            let (label, retries) = {
                let session = self.session.lock().await;
                (
                    session.peripheral.as_ref().map(|p| p.label().to_string()),
                    session.retries,
                )
            };
            let label = label.unwrap_or_else(|| String::from("the remote control"));
            let message = if retries > 0 {
                format!("Connected to {} after {} retries", label, retries)
            } else {
                format!("Connected to {}", label)
            };
            self.presentation.update_status(&message, STATUS_IMPORTANT);
            return;
        }
        self.unhook().await;
        let stopping = self.session.lock().await.stopping;
        if stopping > 0 {
            self.handle_unhooked().await;
        } else {
            self.presentation.update_status("Remote control detached", 0);
        }
    }

    /// Detaches the session callback and drops the connection
    async fn unhook(&self) {
        let (subscription, connection) = {
            let mut session = self.session.lock().await;
            (session.subscription.take(), session.connection.take())
        };
        if let Some(subscription) = subscription {
            subscription.set_callback(None).await;
        }
        if let Some(connection) = connection {
            connection.close().await;
        }
    }

    async fn handle_unhooked(&self) {
        info!("Remote control bridge stopped");
        self.session.lock().await.started = false;
        self.presentation.on_shutdown();
    }

    async fn handle_notification(&self, value: u8) {
        let options = DecodeOptions {
            toggle_ringer: self.preferences.toggle_ringer().await,
            ringer_toggle_unsupported: self.quirks.ringer_toggle_unsupported,
        };
        match decode(value, &options) {
            Decoded::Stop => {
                info!("Remote control requested a stop");
                self.do_stop_if_started().await;
            }
            Decoded::Actions(actions) => {
                for action in actions {
                    debug!("Applying {:?}", action);
                    if let Err(e) = self.actions.apply(action) {
                        warn!("Local action failed: {:#}", e);
                    }
                }
            }
        }
    }
}

/// Feeds scan results back into the gate
struct BridgeScanEvents {
    core: Weak<BridgeCore>,
    dispatcher: Dispatcher,
}

impl ScanHandler for BridgeScanEvents {
    fn on_peripheral_found(&self, peripheral: PeripheralInfo) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        self.dispatcher.dispatch(async move {
            core.handle_peripheral_found(peripheral).await;
        });
    }

    fn on_scan_failed(&self, error: TransportError) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        self.dispatcher.dispatch(async move {
            core.handle_scan_failed(error).await;
        });
    }
}

/// Feeds session events back into the gate, so the subscription manager
/// never runs bridge code on its own call stack
struct BridgeSessionEvents {
    core: Weak<BridgeCore>,
    dispatcher: Dispatcher,
}

impl SubscriptionCallback for BridgeSessionEvents {
    fn on_connection_error(&self, error: ConnectionError) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        self.dispatcher.dispatch(async move {
            core.handle_connection_error(error).await;
        });
    }

    fn on_error(&self, error: SubscriptionError) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        self.dispatcher.dispatch(async move {
            core.handle_subscription_error(error).await;
        });
    }

    fn on_subscription_changed(&self, subscribed: bool) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        self.dispatcher.dispatch(async move {
            core.handle_subscription_changed(subscribed).await;
        });
    }

    fn on_notification(&self, value: u8) {
        let Some(core) = self.core.upgrade() else {
            return;
        };
        self.dispatcher.dispatch(async move {
            core.handle_notification(value).await;
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Preferences;
    use crate::core::constants::{UUID_NOTIFY_CHAR, STOP};
    use crate::core::decoder::LocalAction;
    use crate::core::transport::{
        GattStatus, LinkState, ScanEvent, ScanStream, TransportEventSink,
    };
    use futures_util::StreamExt;
    use futures_util::stream;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use uuid::Uuid;

    #[derive(Debug, Clone, PartialEq)]
    enum Op {
        Discover,
        SetNotification(Uuid, bool),
        WriteDescriptor(Uuid, Vec<u8>),
        WriteCharacteristic(Uuid, Vec<u8>),
        Reconnect,
        Close,
    }

    #[derive(Default)]
    struct MockConnection {
        ops: StdMutex<Vec<Op>>,
        reject_reconnect: AtomicBool,
    }

    impl MockConnection {
        fn ops(&self) -> Vec<Op> {
            self.ops.lock().unwrap().clone()
        }

        fn count(&self, matches: impl Fn(&Op) -> bool) -> usize {
            self.ops.lock().unwrap().iter().filter(|op| matches(op)).count()
        }
    }

    #[async_trait::async_trait]
    impl GattConnection for MockConnection {
        async fn discover_services(&self) -> Result<(), TransportError> {
            self.ops.lock().unwrap().push(Op::Discover);
            Ok(())
        }

        async fn set_characteristic_notification(
            &self,
            characteristic: Uuid,
            enable: bool,
        ) -> Result<(), TransportError> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::SetNotification(characteristic, enable));
            Ok(())
        }

        async fn write_descriptor(
            &self,
            characteristic: Uuid,
            _descriptor: Uuid,
            value: &[u8],
        ) -> Result<(), TransportError> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::WriteDescriptor(characteristic, value.to_vec()));
            Ok(())
        }

        async fn write_characteristic(
            &self,
            characteristic: Uuid,
            value: &[u8],
        ) -> Result<(), TransportError> {
            self.ops
                .lock()
                .unwrap()
                .push(Op::WriteCharacteristic(characteristic, value.to_vec()));
            Ok(())
        }

        async fn reconnect(&self) -> Result<(), TransportError> {
            self.ops.lock().unwrap().push(Op::Reconnect);
            if self.reject_reconnect.load(Ordering::SeqCst) {
                return Err(TransportError::Rejected);
            }
            Ok(())
        }

        async fn close(&self) {
            self.ops.lock().unwrap().push(Op::Close);
        }
    }

    struct MockTransport {
        scans: StdMutex<VecDeque<Vec<ScanEvent>>>,
        scan_calls: AtomicUsize,
        connect_calls: AtomicUsize,
        reject_connect: AtomicBool,
        connection: Arc<MockConnection>,
        sinks: StdMutex<Vec<Arc<dyn TransportEventSink>>>,
    }

    impl MockTransport {
        fn new(scans: Vec<Vec<ScanEvent>>) -> Arc<Self> {
            Arc::new(Self {
                scans: StdMutex::new(scans.into()),
                scan_calls: AtomicUsize::new(0),
                connect_calls: AtomicUsize::new(0),
                reject_connect: AtomicBool::new(false),
                connection: Arc::new(MockConnection::default()),
                sinks: StdMutex::new(Vec::new()),
            })
        }

        fn last_sink(&self) -> Arc<dyn TransportEventSink> {
            self.sinks
                .lock()
                .unwrap()
                .last()
                .cloned()
                .expect("no connection was made")
        }
    }

    #[async_trait::async_trait]
    impl GattTransport for MockTransport {
        async fn scan(&self) -> Result<ScanStream, TransportError> {
            self.scan_calls.fetch_add(1, Ordering::SeqCst);
            let batch = self.scans.lock().unwrap().pop_front().unwrap_or_default();
            Ok(stream::iter(batch).chain(stream::pending()).boxed())
        }

        async fn connect(
            &self,
            _peripheral_id: &str,
            events: Arc<dyn TransportEventSink>,
        ) -> Result<Arc<dyn GattConnection>, TransportError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.reject_connect.load(Ordering::SeqCst) {
                return Err(TransportError::Rejected);
            }
            self.sinks.lock().unwrap().push(events);
            Ok(self.connection.clone())
        }

        fn local_name(&self) -> Option<String> {
            Some(String::from("Living Room"))
        }
    }

    #[derive(Default)]
    struct RecordingPresentation {
        statuses: StdMutex<Vec<(String, u8)>>,
        shutdowns: AtomicUsize,
    }

    impl RecordingPresentation {
        fn statuses(&self) -> Vec<(String, u8)> {
            self.statuses.lock().unwrap().clone()
        }

        fn shutdowns(&self) -> usize {
            self.shutdowns.load(Ordering::SeqCst)
        }
    }

    impl PresentationSink for RecordingPresentation {
        fn update_status(&self, message: &str, flags: u8) {
            self.statuses
                .lock()
                .unwrap()
                .push((message.to_string(), flags));
        }

        fn on_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct RecordingActions {
        applied: StdMutex<Vec<LocalAction>>,
    }

    impl RecordingActions {
        fn applied(&self) -> Vec<LocalAction> {
            self.applied.lock().unwrap().clone()
        }
    }

    impl LocalActionSink for RecordingActions {
        fn apply(&self, action: LocalAction) -> anyhow::Result<()> {
            self.applied.lock().unwrap().push(action);
            Ok(())
        }
    }

    struct Harness {
        bridge: RemoteBridge,
        transport: Arc<MockTransport>,
        presentation: Arc<RecordingPresentation>,
        actions: Arc<RecordingActions>,
        preferences: SharedPreferences,
    }

    fn test_preferences() -> Preferences {
        Preferences {
            gatt_delay_ms: 8,
            retry_interval_ms: 64,
            ..Preferences::default()
        }
    }

    fn remote() -> ScanEvent {
        ScanEvent::Peripheral(PeripheralInfo::new(
            Some(String::from("Salon Remote")),
            String::from("peripheral-1"),
            true,
        ))
    }

    fn harness_with(preferences: Preferences, scans: Vec<Vec<ScanEvent>>) -> Harness {
        let _ = env_logger::builder().is_test(true).try_init();
        let transport = MockTransport::new(scans);
        let presentation = Arc::new(RecordingPresentation::default());
        let actions = Arc::new(RecordingActions::default());
        let preferences = SharedPreferences::in_memory(preferences);
        let bridge = RemoteBridge::new(
            transport.clone(),
            preferences.clone(),
            actions.clone(),
            presentation.clone(),
            HostQuirks::default(),
        );
        Harness {
            bridge,
            transport,
            presentation,
            actions,
            preferences,
        }
    }

    fn harness() -> Harness {
        harness_with(test_preferences(), vec![vec![remote()]])
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    /// Walks the transport events of a successful subscription
    async fn drive_to_subscribed(h: &Harness) {
        h.bridge.start();
        settle().await;
        let sink = h.transport.last_sink();
        sink.on_connection_state_change(GattStatus::Success, LinkState::Connected);
        settle().await;
        sink.on_services_discovered(GattStatus::Success);
        settle().await;
        sink.on_descriptor_write(UUID_NOTIFY_CHAR, GattStatus::Success);
        settle().await;
    }

    #[tokio::test(start_paused = true)]
    async fn start_scans_connects_and_subscribes() {
        let h = harness();
        drive_to_subscribed(&h).await;

        let statuses = h.presentation.statuses();
        assert_eq!(statuses[0].0, "Scanning for the remote control");
        assert_eq!(statuses[1].0, "Connecting to Salon Remote");
        // The subscribed status names the device and asks for attention.
        assert_eq!(
            statuses.last(),
            Some(&(String::from("Connected to Salon Remote"), STATUS_IMPORTANT))
        );
        // The subscribed session streams the host name.
        assert_eq!(
            h.transport
                .connection
                .count(|op| matches!(op, Op::WriteCharacteristic(..))),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn notification_bytes_become_local_actions() {
        let h = harness();
        drive_to_subscribed(&h).await;
        let sink = h.transport.last_sink();

        sink.on_characteristic_changed(UUID_NOTIFY_CHAR, &[0x08]);
        settle().await;
        assert_eq!(h.actions.applied(), vec![LocalAction::VolumeUp]);

        // Preference edits apply to the next notification.
        h.preferences
            .update(|p| p.toggle_ringer = true)
            .await
            .unwrap();
        sink.on_characteristic_changed(UUID_NOTIFY_CHAR, &[0x20]);
        settle().await;
        assert_eq!(
            h.actions.applied(),
            vec![LocalAction::VolumeUp, LocalAction::ToggleRinger]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn the_stop_byte_shuts_the_bridge_down() {
        let h = harness();
        drive_to_subscribed(&h).await;
        let sink = h.transport.last_sink();

        sink.on_characteristic_changed(UUID_NOTIFY_CHAR, &[STOP]);
        settle().await;
        // The graceful walk disabled notifications and waits for completion.
        assert_eq!(
            h.transport
                .connection
                .count(|op| matches!(op, Op::SetNotification(_, false))),
            1
        );
        assert_eq!(h.presentation.shutdowns(), 0);

        sink.on_descriptor_write(UUID_NOTIFY_CHAR, GattStatus::Success);
        settle().await;
        assert_eq!(h.presentation.shutdowns(), 1);
        assert_eq!(h.transport.connection.count(|op| matches!(op, Op::Close)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_second_stop_request_does_not_wait() {
        let h = harness();
        drive_to_subscribed(&h).await;

        h.bridge.stop_if_started();
        settle().await;
        assert_eq!(h.presentation.shutdowns(), 0);

        h.bridge.stop_if_started();
        settle().await;
        assert_eq!(h.presentation.shutdowns(), 1);
        assert_eq!(h.transport.connection.count(|op| matches!(op, Op::Close)), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn a_failed_session_stops_without_waiting_for_completions() {
        let h = harness();
        drive_to_subscribed(&h).await;
        let sink = h.transport.last_sink();

        sink.on_connection_state_change(GattStatus::Error(8), LinkState::Disconnected);
        settle().await;
        let (message, flags) = h.presentation.statuses().last().cloned().unwrap();
        assert!(message.starts_with("Salon Remote:"), "got {:?}", message);
        assert_eq!(flags, STATUS_IMPORTANT | STATUS_NOISE | STATUS_RETRY);

        // One stop suffices: the walk runs forced and the teardown completes
        // without any descriptor completion arriving.
        h.bridge.stop_if_started();
        settle().await;
        assert_eq!(h.presentation.shutdowns(), 1);
        assert_eq!(
            h.transport
                .connection
                .count(|op| matches!(op, Op::SetNotification(_, false))),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn retrying_twice_counts_and_paces_two_reconnects() {
        let h = harness();
        drive_to_subscribed(&h).await;

        h.bridge.retry();
        settle().await;
        h.bridge.retry();
        settle().await;

        let statuses = h.presentation.statuses();
        assert!(
            statuses
                .iter()
                .any(|(m, _)| m == "Reconnecting to Salon Remote (attempt 1)")
        );
        assert!(
            statuses
                .iter()
                .any(|(m, _)| m == "Reconnecting to Salon Remote (attempt 2)")
        );
        assert_eq!(
            h.transport.connection.count(|op| matches!(op, Op::Reconnect)),
            2
        );

        // The re-established session reports how many attempts it took.
        let sink = h.transport.last_sink();
        sink.on_connection_state_change(GattStatus::Success, LinkState::Connected);
        settle().await;
        sink.on_services_discovered(GattStatus::Success);
        settle().await;
        sink.on_descriptor_write(UUID_NOTIFY_CHAR, GattStatus::Success);
        settle().await;
        assert_eq!(
            h.presentation.statuses().last().map(|(m, _)| m.clone()),
            Some(String::from("Connected to Salon Remote after 2 retries"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn a_rejected_reconnect_falls_back_to_a_fresh_session() {
        let h = harness();
        drive_to_subscribed(&h).await;
        h.transport
            .connection
            .reject_reconnect
            .store(true, Ordering::SeqCst);

        h.bridge.retry();
        settle().await;

        // A second transport connection was opened for the fresh session.
        assert_eq!(h.transport.sinks.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_without_a_session_reuses_the_remembered_device() {
        let h = harness();
        drive_to_subscribed(&h).await;
        h.bridge.core.session.lock().await.subscription = None;

        h.bridge.retry();
        settle().await;

        // No rescan: the remembered peripheral gets a fresh session directly.
        assert_eq!(h.transport.scan_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.transport.sinks.lock().unwrap().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn auto_retry_reconnects_instead_of_surfacing_errors() {
        let mut preferences = test_preferences();
        preferences.auto_retry = true;
        let h = harness_with(preferences, vec![vec![remote()]]);
        drive_to_subscribed(&h).await;
        let sink = h.transport.last_sink();

        sink.on_connection_state_change(GattStatus::Error(8), LinkState::Disconnected);
        settle().await;

        assert!(
            h.presentation
                .statuses()
                .iter()
                .all(|(_, flags)| flags & STATUS_RETRY == 0)
        );
        assert_eq!(
            h.transport.connection.count(|op| matches!(op, Op::Reconnect)),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn auto_retry_paces_rejected_connects_by_the_retry_interval() {
        let mut preferences = test_preferences();
        preferences.auto_retry = true;
        let h = harness_with(preferences, vec![vec![remote()]]);
        h.transport.reject_connect.store(true, Ordering::SeqCst);

        h.bridge.start();
        settle().await;

        // 200ms at a 64ms interval: the initial attempt plus three paced
        // retries, not a tight reject/retry spin.
        assert_eq!(h.transport.connect_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn a_rejected_connect_is_surfaced_with_a_retry_affordance() {
        let h = harness();
        h.transport.reject_connect.store(true, Ordering::SeqCst);

        h.bridge.start();
        settle().await;

        let (message, flags) = h.presentation.statuses().last().cloned().unwrap();
        assert!(message.contains("could not connect"), "got {:?}", message);
        assert_eq!(flags, STATUS_IMPORTANT | STATUS_NOISE | STATUS_RETRY);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_a_failed_scan_scans_again() {
        let h = harness_with(
            test_preferences(),
            vec![vec![ScanEvent::Failed { code: 2 }], vec![remote()]],
        );

        h.bridge.start();
        settle().await;
        assert_eq!(
            h.presentation.statuses().last().map(|(m, _)| m.clone()),
            Some(String::from("Scan failed: code 2"))
        );

        h.bridge.retry();
        settle().await;
        assert_eq!(h.transport.scan_calls.load(Ordering::SeqCst), 2);
        // The second scan found the remote and a connection was opened.
        assert_eq!(h.transport.sinks.lock().unwrap().len(), 1);
    }
}
