//! Subscription lifecycle over the remote control's characteristics
//! One `SubscriptionManager` drives one session: service discovery, walking
//! the subscription set (backlog in, subscribed out), streaming the chunked
//! host name, and the reverse unsubscribe walk. Transport completions arrive
//! through the sink returned by [`SubscriptionManager::transport_sink`], which
//! marshals every event onto the dispatch gate before any state is touched.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;
use log::{debug, info, warn};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::chunk::ChunkedNameBuffer;
use crate::core::constants::{
    DEFAULT_MTU, DISABLE_NOTIFICATION_VALUE, ENABLE_NOTIFICATION_VALUE, SUBSCRIPTION_UUIDS,
    UUID_CLIENT_CHARACTERISTIC_CONFIG, UUID_NAME_CHAR, UUID_NOTIFY_CHAR,
};
use crate::core::dispatch::Dispatcher;
use crate::core::transport::{
    GattConnection, GattStatus, LinkState, TransportError, TransportEventSink,
};
use crate::error::{ConnectionError, SubscriptionError};

/// Lifecycle phase of a subscription session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connected,
    Subscribing,
    Subscribed,
    Unsubscribing,
    Unsubscribed,
}

/// Status and error events produced by the subscription manager
///
/// Invoked from gate jobs; implementations must not block and should hand
/// follow-up work back to the gate.
pub trait SubscriptionCallback: Send + Sync {
    fn on_connection_error(&self, error: ConnectionError);
    fn on_error(&self, error: SubscriptionError);
    fn on_subscription_changed(&self, subscribed: bool);
    fn on_notification(&self, value: u8);
}

struct Inner {
    state: SessionState,
    backlog: VecDeque<Uuid>,
    subscribed: VecDeque<Uuid>,
    mtu: usize,
    name: ChunkedNameBuffer,
    connection: Option<Arc<dyn GattConnection>>,
}

struct SessionCore {
    /// Session state; only mutated from gate jobs
    inner: Mutex<Inner>,
    /// The detachable status sink; swapped from outside the gate as well
    callback: Mutex<Option<Arc<dyn SubscriptionCallback>>>,
    dispatcher: Dispatcher,
    /// Pause before each radio operation
    delay: Duration,
}

/// Drives one subscribe/unsubscribe session with the remote control
#[derive(Clone)]
pub struct SubscriptionManager {
    core: Arc<SessionCore>,
}

impl SubscriptionManager {
    /// Creates a manager for a fresh session. `local_name` is this host's
    /// adapter name, streamed to the remote control once subscribed.
    pub fn new(
        callback: Arc<dyn SubscriptionCallback>,
        local_name: &str,
        dispatcher: Dispatcher,
        delay: Duration,
    ) -> Self {
        let core = Arc::new(SessionCore {
            inner: Mutex::new(Inner {
                state: SessionState::Disconnected,
                backlog: VecDeque::new(),
                subscribed: VecDeque::new(),
                mtu: DEFAULT_MTU,
                name: ChunkedNameBuffer::new(local_name),
                connection: None,
            }),
            callback: Mutex::new(Some(callback)),
            dispatcher,
            delay,
        });
        Self { core }
    }

    /// The event sink to hand to [`GattTransport::connect`]
    ///
    /// [`GattTransport::connect`]: crate::core::transport::GattTransport::connect
    pub fn transport_sink(&self) -> Arc<dyn TransportEventSink> {
        Arc::new(SessionEvents {
            core: self.core.clone(),
        })
    }

    /// Attaches the connection handle the session operates on
    pub async fn bind_connection(&self, connection: Arc<dyn GattConnection>) {
        self.core.inner.lock().await.connection = Some(connection);
    }

    /// Swaps the status sink; `None` detaches it. Detaching is the only
    /// cancellation primitive: queued and delayed work still runs but drops
    /// its events instead of delivering them.
    pub async fn set_callback(&self, callback: Option<Arc<dyn SubscriptionCallback>>) {
        let previous = {
            let mut guard = self.core.callback.lock().await;
            std::mem::replace(&mut *guard, callback)
        };
        drop(previous);
    }

    /// Re-arms the manager for a reconnect: fresh callback binding, state back
    /// to disconnected, queues and connection left as they are.
    pub async fn reset(&self, callback: Arc<dyn SubscriptionCallback>) {
        self.set_callback(Some(callback)).await;
        self.core.inner.lock().await.state = SessionState::Disconnected;
    }

    /// Walks the subscribed set, toggling notifications back off.
    ///
    /// Non-forced, each step is paced by the configured delay and driven by
    /// the previous step's completion. Forced, the walk runs to the end on the
    /// calling context, ignoring rejected toggles; used for teardown when the
    /// link may already be gone.
    pub async fn unsubscribe_from_notifications(&self, force: bool) {
        self.core.continue_unsubscribe(force).await;
    }
}

impl SessionCore {
    async fn connection(&self) -> Option<Arc<dyn GattConnection>> {
        self.inner.lock().await.connection.clone()
    }

    async fn callback(&self) -> Option<Arc<dyn SubscriptionCallback>> {
        self.callback.lock().await.clone()
    }

    async fn connection_error(&self, error: ConnectionError) {
        match self.callback().await {
            Some(callback) => callback.on_connection_error(error),
            None => info!("Callback is detached, dropping: {}", error),
        }
    }

    async fn error(&self, error: SubscriptionError) {
        match self.callback().await {
            Some(callback) => callback.on_error(error),
            None => info!("Callback is detached, dropping: {}", error),
        }
    }

    async fn notify_subscription_changed(&self, subscribed: bool) {
        match self.callback().await {
            Some(callback) => callback.on_subscription_changed(subscribed),
            None => info!(
                "Callback is detached, dropping subscription change ({})",
                subscribed
            ),
        }
    }

    async fn notify_notification(&self, value: u8) {
        match self.callback().await {
            Some(callback) => callback.on_notification(value),
            None => debug!("Callback is detached, dropping notification {:#04x}", value),
        }
    }

    async fn handle_connection_state_change(self: &Arc<Self>, status: GattStatus, link: LinkState) {
        let state = self.inner.lock().await.state;
        if state == SessionState::Disconnected {
            if status.is_success() && link == LinkState::Connected {
                debug!("Link established, requesting service discovery");
                let core = self.clone();
                self.dispatcher.dispatch_after(self.delay, async move {
                    core.begin_discovery().await;
                });
            } else if !status.is_success() {
                self.connection_error(ConnectionError::ConnectFailed { status })
                    .await;
            }
            // A clean disconnect before anything started carries no information.
        } else if !(status.is_success() && link == LinkState::Connected) {
            self.connection_error(ConnectionError::LinkLost { status, link })
                .await;
        }
    }

    async fn begin_discovery(&self) {
        let Some(connection) = self.connection().await else {
            warn!("No connection while requesting service discovery");
            return;
        };
        match connection.discover_services().await {
            Ok(()) => {
                self.inner.lock().await.state = SessionState::Connected;
            }
            Err(e) => {
                warn!("Service discovery request rejected: {}", e);
                self.connection_error(ConnectionError::DiscoveryRejected)
                    .await;
            }
        }
    }

    async fn handle_services_discovered(self: &Arc<Self>, status: GattStatus) {
        {
            let mut inner = self.inner.lock().await;
            inner.backlog.clear();
            inner.subscribed.clear();
            if status.is_success() {
                inner.backlog.extend(SUBSCRIPTION_UUIDS);
            }
        }
        if status.is_success() {
            self.continue_subscribe().await;
        } else {
            self.error(SubscriptionError::DiscoveryFailed { status })
                .await;
        }
    }

    /// Takes the next backlog entry and schedules its notification toggle, or
    /// finishes the subscribe phase and starts the host name transfer.
    fn continue_subscribe(self: &Arc<Self>) -> BoxFuture<'static, ()> {
        let core = self.clone();
        async move {
            let next = {
                let mut inner = core.inner.lock().await;
                match inner.backlog.pop_front() {
                    Some(uuid) => {
                        inner.state = SessionState::Subscribing;
                        Some(uuid)
                    }
                    None => {
                        inner.state = SessionState::Subscribed;
                        inner.name.reset();
                        None
                    }
                }
            };
            match next {
                Some(uuid) => {
                    debug!("Enabling notifications for {}", uuid);
                    let step = core.clone();
                    core.dispatcher.dispatch_after(core.delay, async move {
                        if !step.toggle_subscription(uuid, true).await {
                            // A rejected characteristic must not stall the rest
                            // of the set.
                            step.continue_subscribe().await;
                        }
                    });
                }
                None => {
                    info!("Subscribed to notifications");
                    core.notify_subscription_changed(true).await;
                    let step = core.clone();
                    core.dispatcher.dispatch_after(core.delay, async move {
                        step.send_name_chunk().await;
                    });
                }
            }
        }
        .boxed()
    }

    /// Takes the next subscribed entry and toggles it off, or finishes the
    /// unsubscribe phase. See [`SubscriptionManager::unsubscribe_from_notifications`]
    /// for the force semantics.
    fn continue_unsubscribe(self: &Arc<Self>, force: bool) -> BoxFuture<'static, ()> {
        let core = self.clone();
        async move {
            let next = {
                let mut inner = core.inner.lock().await;
                if inner.connection.is_none() {
                    warn!("No connection while unsubscribing");
                    return;
                }
                match inner.subscribed.pop_front() {
                    Some(uuid) => {
                        inner.state = SessionState::Unsubscribing;
                        Some(uuid)
                    }
                    None => {
                        inner.state = SessionState::Unsubscribed;
                        None
                    }
                }
            };
            let Some(uuid) = next else {
                info!("Unsubscribed from notifications");
                core.notify_subscription_changed(false).await;
                return;
            };
            if force {
                let _ = core.toggle_subscription(uuid, false).await;
                core.continue_unsubscribe(true).await;
            } else {
                let step = core.clone();
                core.dispatcher.dispatch_after(core.delay, async move {
                    if !step.toggle_subscription(uuid, false).await {
                        step.continue_unsubscribe(false).await;
                    }
                });
            }
        }
        .boxed()
    }

    /// Issues the notification toggle and descriptor write for one
    /// characteristic. Errors are surfaced only when enabling; the forced
    /// teardown path stays silent.
    async fn toggle_subscription(&self, uuid: Uuid, enable: bool) -> bool {
        let Some(connection) = self.connection().await else {
            warn!("No connection while toggling notifications for {}", uuid);
            return false;
        };
        if let Err(e) = connection
            .set_characteristic_notification(uuid, enable)
            .await
        {
            warn!("Could not toggle notifications for {}: {}", uuid, e);
            if enable {
                self.error(toggle_error(e, uuid)).await;
            }
            return false;
        }
        let value = if enable {
            ENABLE_NOTIFICATION_VALUE
        } else {
            DISABLE_NOTIFICATION_VALUE
        };
        if let Err(e) = connection
            .write_descriptor(uuid, UUID_CLIENT_CHARACTERISTIC_CONFIG, &value)
            .await
        {
            warn!(
                "Could not write the configuration descriptor for {}: {}",
                uuid, e
            );
            if enable {
                self.error(SubscriptionError::DescriptorWriteRejected { uuid })
                    .await;
            }
            return false;
        }
        true
    }

    async fn handle_descriptor_write(self: &Arc<Self>, characteristic: Uuid, status: GattStatus) {
        let state = {
            let mut inner = self.inner.lock().await;
            if SUBSCRIPTION_UUIDS.contains(&characteristic) {
                if status.is_success() {
                    match inner.state {
                        SessionState::Subscribing => {
                            // Front insertion so the unsubscribe walk runs in
                            // reverse subscribe order.
                            inner.subscribed.push_front(characteristic);
                            info!("Subscribed to {}", characteristic);
                        }
                        SessionState::Unsubscribing => {
                            info!("Unsubscribed from {}", characteristic);
                        }
                        _ => {}
                    }
                } else {
                    warn!(
                        "Descriptor write for {} failed ({})",
                        characteristic, status
                    );
                }
            }
            inner.state
        };
        match state {
            SessionState::Subscribing => self.continue_subscribe().await,
            SessionState::Unsubscribing => self.continue_unsubscribe(false).await,
            _ => {}
        }
    }

    /// Sends the next host name chunk, if any remains
    async fn send_name_chunk(&self) {
        let (connection, frame) = {
            let mut inner = self.inner.lock().await;
            if !inner.name.has_more() {
                debug!("Host name transfer complete");
                return;
            }
            let Some(connection) = inner.connection.clone() else {
                warn!("No connection while sending the host name");
                return;
            };
            let mtu = inner.mtu;
            (connection, inner.name.next_chunk(mtu))
        };
        if let Err(e) = connection.write_characteristic(UUID_NAME_CHAR, &frame).await {
            warn!("Host name chunk rejected: {}", e);
            self.inner.lock().await.name.rewind(frame.len());
            self.error(SubscriptionError::NameTransferFailed).await;
        }
    }

    async fn handle_characteristic_write(self: &Arc<Self>, characteristic: Uuid, status: GattStatus) {
        if !status.is_success() {
            warn!("Failed to write {} ({})", characteristic, status);
            return;
        }
        if characteristic == UUID_NAME_CHAR {
            let core = self.clone();
            self.dispatcher.dispatch_after(self.delay, async move {
                core.send_name_chunk().await;
            });
        }
    }

    async fn handle_characteristic_changed(&self, characteristic: Uuid, value: Vec<u8>) {
        if characteristic != UUID_NOTIFY_CHAR {
            warn!("Notification from unknown characteristic {}", characteristic);
            return;
        }
        let Some(first) = value.first().copied() else {
            warn!("Empty notification payload");
            return;
        };
        self.notify_notification(first).await;
    }

    async fn handle_mtu_changed(&self, mtu: usize, status: GattStatus) {
        if status.is_success() {
            info!("MTU changed to {}", mtu);
            self.inner.lock().await.mtu = mtu;
        } else {
            warn!("MTU change failed ({})", status);
        }
    }
}

fn toggle_error(error: TransportError, uuid: Uuid) -> SubscriptionError {
    match error {
        TransportError::ServiceNotFound(_) => SubscriptionError::ServiceNotFound,
        TransportError::CharacteristicNotFound(c) => {
            SubscriptionError::CharacteristicNotFound { uuid: c }
        }
        _ => SubscriptionError::NotificationToggleRejected { uuid },
    }
}

/// Marshals transport callbacks onto the dispatch gate
struct SessionEvents {
    core: Arc<SessionCore>,
}

impl TransportEventSink for SessionEvents {
    fn on_connection_state_change(&self, status: GattStatus, link: LinkState) {
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.handle_connection_state_change(status, link).await;
        });
    }

    fn on_mtu_changed(&self, mtu: usize, status: GattStatus) {
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.handle_mtu_changed(mtu, status).await;
        });
    }

    fn on_services_discovered(&self, status: GattStatus) {
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.handle_services_discovered(status).await;
        });
    }

    fn on_characteristic_write(&self, characteristic: Uuid, status: GattStatus) {
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.handle_characteristic_write(characteristic, status).await;
        });
    }

    fn on_descriptor_write(&self, characteristic: Uuid, status: GattStatus) {
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.handle_descriptor_write(characteristic, status).await;
        });
    }

    fn on_characteristic_changed(&self, characteristic: Uuid, value: &[u8]) {
        let value = value.to_vec();
        let core = self.core.clone();
        self.core.dispatcher.dispatch(async move {
            core.handle_characteristic_changed(characteristic, value).await;
        });
    }
}
