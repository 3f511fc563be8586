//! [`FanoutHub`] – the set of connected realtime clients.
//!
//! The hub sits between the transport-agnostic core and the WebSocket edge:
//!
//! | Entry point | Effect |
//! |---|---|
//! | [`FanoutHub::on_client_connect`] | register, then send a fresh snapshot to that client only |
//! | [`FanoutHub::on_client_action`] | run the action, reply to the sender with a `controlResponse` |
//! | [`FanoutHub::on_read_request`] | send a fresh snapshot to that client only |
//! | [`FanoutHub::on_point_changed`] | broadcast a `sensorUpdate` to every registered client |
//! | [`FanoutHub::on_client_disconnect`] | deregister |
//!
//! Registration, deregistration and broadcast all happen under one lock, so
//! a broadcast reaches exactly the clients registered at that moment and a
//! client never receives anything after its disconnect was processed.
//!
//! A new client's first frame is always its snapshot.  Broadcasts that race
//! with the snapshot read are held back and delivered right after it.
//!
//! Actions and snapshots run on their own task.  The action timeout only
//! bounds how long the client waits for its acknowledgement; a write already
//! handed to the session is never cancelled.  The session's request timeout
//! still decides whether the upstream call itself failed.
//!
//! Each client has a bounded outbound buffer.  A client that stops reading
//! loses broadcasts once its buffer is full rather than slowing everyone
//! else down.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_middleware::ControlDispatcher;
use gantry_types::{Action, ControlAck, GantryError, SensorReading, ServerMessage, SessionState};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outbound frames buffered per client before broadcasts start dropping.
pub const CLIENT_BUFFER: usize = 256;

/// Default upper bound for one action or snapshot, end to end.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Acknowledgement bound for a session with the given request timeout: room
/// for one request queued ahead plus our own.
pub fn action_timeout_for(request_timeout: Duration) -> Duration {
    (request_timeout * 2).max(DEFAULT_ACTION_TIMEOUT)
}

pub type ClientId = Uuid;

/// What the hub needs from the core.  Implemented by [`ControlDispatcher`];
/// tests substitute their own.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn execute(&self, action: Action) -> Result<(), GantryError>;

    async fn read_sensors(&self) -> Result<Vec<SensorReading>, GantryError>;

    fn session_state(&self) -> SessionState;
}

#[async_trait]
impl ControlPlane for ControlDispatcher {
    async fn execute(&self, action: Action) -> Result<(), GantryError> {
        ControlDispatcher::execute(self, action).await.map(|_| ())
    }

    async fn read_sensors(&self) -> Result<Vec<SensorReading>, GantryError> {
        ControlDispatcher::read_sensors(self).await
    }

    fn session_state(&self) -> SessionState {
        ControlDispatcher::session_state(self)
    }
}

struct ClientEntry {
    tx: mpsc::Sender<ServerMessage>,
    connected_at: DateTime<Utc>,
    /// Broadcasts held until the connect-time snapshot is queued.
    held: Option<Vec<SensorReading>>,
}

struct HubInner {
    control: Arc<dyn ControlPlane>,
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    action_timeout: Duration,
}

/// A newly registered client: its id and the frames addressed to it.
pub struct ClientHandle {
    pub id: ClientId,
    pub rx: mpsc::Receiver<ServerMessage>,
}

/// Shared fan-out hub.  Clones share the client set.
#[derive(Clone)]
pub struct FanoutHub {
    inner: Arc<HubInner>,
}

impl FanoutHub {
    pub fn new(control: Arc<dyn ControlPlane>) -> Self {
        Self::with_action_timeout(control, DEFAULT_ACTION_TIMEOUT)
    }

    pub fn with_action_timeout(control: Arc<dyn ControlPlane>, action_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(HubInner {
                control,
                clients: Mutex::new(HashMap::new()),
                action_timeout,
            }),
        }
    }

    fn clients(&self) -> MutexGuard<'_, HashMap<ClientId, ClientEntry>> {
        self.inner.clients.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn session_state(&self) -> SessionState {
        self.inner.control.session_state()
    }

    pub fn client_count(&self) -> usize {
        self.clients().len()
    }

    /// When `client` connected, if it is still registered.
    pub fn connected_at(&self, client: ClientId) -> Option<DateTime<Utc>> {
        self.clients().get(&client).map(|c| c.connected_at)
    }

    /// Register a client, then send it a fresh snapshot.  The snapshot is
    /// the client's first frame; updates broadcast meanwhile follow it.
    pub async fn on_client_connect(&self) -> ClientHandle {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        let total = {
            let mut clients = self.clients();
            clients.insert(
                id,
                ClientEntry {
                    tx,
                    connected_at: Utc::now(),
                    held: Some(Vec::new()),
                },
            );
            clients.len()
        };
        info!(client = %id, clients = total, "client connected");

        let snapshot = self.snapshot_message(id).await;
        let mut clients = self.clients();
        if let Some(entry) = clients.get_mut(&id) {
            let held = entry.held.take().unwrap_or_default();
            // Fresh channel: the snapshot plus at most CLIENT_BUFFER - 1 held
            // updates always fit.
            let frames = std::iter::once(snapshot)
                .chain(held.into_iter().map(ServerMessage::SensorUpdate));
            for frame in frames {
                if entry.tx.try_send(frame).is_err() {
                    debug!(client = %id, "initial frame dropped");
                }
            }
        }
        drop(clients);
        ClientHandle { id, rx }
    }

    /// Fresh snapshot for `client` only: `sensorData`, or `sensorDataError`
    /// when the read fails.
    pub async fn on_read_request(&self, client: ClientId) {
        let message = self.snapshot_message(client).await;
        self.send_to(client, message).await;
    }

    async fn snapshot_message(&self, client: ClientId) -> ServerMessage {
        match self.snapshot().await {
            Ok(readings) => ServerMessage::SensorData(readings),
            Err(e) => {
                warn!(client = %client, error = %e, "sensor snapshot failed");
                ServerMessage::SensorDataError {
                    error: e.kind().to_string(),
                }
            }
        }
    }

    /// Read every sensor through the core, waiting at most the action
    /// timeout for the answer.
    pub async fn snapshot(&self) -> Result<Vec<SensorReading>, GantryError> {
        let control = Arc::clone(&self.inner.control);
        self.detached("sensor snapshot", async move { control.read_sensors().await })
            .await
    }

    /// Parse and run `action`, waiting at most the action timeout for the
    /// outcome.  On timeout the write still runs to completion.
    pub async fn execute(&self, action: &str) -> Result<Action, GantryError> {
        let action: Action = action.parse()?;
        let control = Arc::clone(&self.inner.control);
        self.detached(action.as_str(), async move { control.execute(action).await })
            .await
            .map(|()| action)
    }

    /// Run `work` on its own task and wait for it up to the action timeout.
    /// Expiry abandons the wait, not the task.
    async fn detached<T, F>(&self, what: &str, work: F) -> Result<T, GantryError>
    where
        T: Send + 'static,
        F: Future<Output = Result<T, GantryError>> + Send + 'static,
    {
        let limit = self.inner.action_timeout;
        let mut task = tokio::spawn(work);
        match timeout(limit, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(GantryError::Transport(format!("{what} task failed: {e}"))),
            Err(_) => {
                warn!(operation = what, timeout = ?limit, "no outcome in time; left running");
                Err(GantryError::Timeout(format!("{what} exceeded {limit:?}")))
            }
        }
    }

    /// Run `action` for `client` and reply to that client only.  Every
    /// request gets exactly one `controlResponse`.
    pub async fn on_client_action(&self, client: ClientId, action: &str) -> ControlAck {
        let ack = match self.execute(action).await {
            Ok(_) => ControlAck::ok(action),
            Err(e) => {
                warn!(client = %client, action, error = %e, "control request failed");
                ControlAck::failed(action, e.kind())
            }
        };
        self.send_to(client, ServerMessage::ControlResponse(ack.clone()))
            .await;
        ack
    }

    /// Broadcast a point change to every registered client.  Returns how
    /// many clients it was queued for.
    pub fn on_point_changed(&self, reading: SensorReading) -> usize {
        let mut clients = self.clients();
        let mut delivered = 0;
        for (id, client) in clients.iter_mut() {
            if let Some(held) = client.held.as_mut() {
                if held.len() + 1 < CLIENT_BUFFER {
                    held.push(reading.clone());
                    delivered += 1;
                } else {
                    warn!(client = %id, sensor = %reading.sensor, "client not ready; update dropped");
                }
                continue;
            }
            match client.tx.try_send(ServerMessage::SensorUpdate(reading.clone())) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client = %id, sensor = %reading.sensor, "client lagging; update dropped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(client = %id, "client channel closed");
                }
            }
        }
        delivered
    }

    pub fn on_client_disconnect(&self, client: ClientId) {
        let removed = {
            let mut clients = self.clients();
            clients.remove(&client).map(|entry| (entry, clients.len()))
        };
        if let Some((entry, remaining)) = removed {
            let seconds = (Utc::now() - entry.connected_at).num_seconds();
            info!(client = %client, connected_secs = seconds, clients = remaining, "client disconnected");
        }
    }

    /// Forward point changes from the subscription engine until the channel
    /// closes.
    pub async fn run(self, mut notifications: mpsc::Receiver<SensorReading>) {
        while let Some(reading) = notifications.recv().await {
            let delivered = self.on_point_changed(reading);
            debug!(clients = delivered, "point change broadcast");
        }
        debug!("notification channel closed; hub pump stopped");
    }

    async fn send_to(&self, client: ClientId, message: ServerMessage) {
        let tx = self.clients().get(&client).map(|c| c.tx.clone());
        match tx {
            Some(tx) => {
                if tx.send(message).await.is_err() {
                    debug!(client = %client, "reply dropped; client gone");
                }
            }
            None => debug!(client = %client, "reply dropped; client not registered"),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted control plane.
    pub(crate) struct FakeControl {
        pub state: Mutex<SessionState>,
        pub sensors: Mutex<Vec<SensorReading>>,
        pub fail_with: Mutex<Option<GantryError>>,
        pub executed: Mutex<Vec<Action>>,
        pub reads: AtomicUsize,
        pub delay: Duration,
        pub read_delay: Duration,
    }

    impl FakeControl {
        pub(crate) fn connected() -> Self {
            Self {
                state: Mutex::new(SessionState::Connected),
                sensors: Mutex::new(
                    ["I1", "I2", "I3", "I4", "I5", "I6"]
                        .into_iter()
                        .map(|s| SensorReading::new(s, false))
                        .collect(),
                ),
                fail_with: Mutex::new(None),
                executed: Mutex::new(Vec::new()),
                reads: AtomicUsize::new(0),
                delay: Duration::ZERO,
                read_delay: Duration::ZERO,
            }
        }

        pub(crate) fn degraded() -> Self {
            let fake = Self::connected();
            *fake.state.lock().unwrap() = SessionState::Degraded;
            fake
        }

        fn gate(&self) -> Result<(), GantryError> {
            if *self.state.lock().unwrap() != SessionState::Connected {
                return Err(GantryError::SessionUnavailable);
            }
            match self.fail_with.lock().unwrap().clone() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl ControlPlane for FakeControl {
        async fn execute(&self, action: Action) -> Result<(), GantryError> {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.gate()?;
            self.executed.lock().unwrap().push(action);
            Ok(())
        }

        async fn read_sensors(&self) -> Result<Vec<SensorReading>, GantryError> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            if !self.read_delay.is_zero() {
                tokio::time::sleep(self.read_delay).await;
            }
            self.gate()?;
            Ok(self.sensors.lock().unwrap().clone())
        }

        fn session_state(&self) -> SessionState {
            *self.state.lock().unwrap()
        }
    }

    fn hub(control: FakeControl) -> (FanoutHub, Arc<FakeControl>) {
        let control = Arc::new(control);
        (FanoutHub::new(control.clone()), control)
    }

    #[tokio::test]
    async fn connect_sends_snapshot_to_new_client_only() {
        let (hub, control) = hub(FakeControl::connected());
        let mut first = hub.on_client_connect().await;
        let mut second = hub.on_client_connect().await;

        for client in [&mut first, &mut second] {
            match client.rx.recv().await.unwrap() {
                ServerMessage::SensorData(readings) => {
                    let names: Vec<&str> = readings.iter().map(|r| r.sensor.as_str()).collect();
                    assert_eq!(names, ["I1", "I2", "I3", "I4", "I5", "I6"]);
                }
                other => panic!("expected snapshot, got {other:?}"),
            }
            // Exactly one snapshot each.
            assert!(client.rx.try_recv().is_err());
        }
        assert_eq!(control.reads.load(Ordering::SeqCst), 2);
        assert_eq!(hub.client_count(), 2);
        assert!(hub.connected_at(first.id).is_some());
    }

    #[tokio::test]
    async fn failed_snapshot_sends_error_and_keeps_client() {
        let (hub, _control) = hub(FakeControl::degraded());
        let mut client = hub.on_client_connect().await;
        assert_eq!(
            client.rx.recv().await.unwrap(),
            ServerMessage::SensorDataError {
                error: "SessionUnavailable".to_string()
            }
        );
        assert_eq!(hub.client_count(), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_client_including_the_actor() {
        let (hub, _control) = hub(FakeControl::connected());
        let mut a = hub.on_client_connect().await;
        let mut b = hub.on_client_connect().await;
        a.rx.recv().await.unwrap();
        b.rx.recv().await.unwrap();

        hub.on_client_action(a.id, "open-claw").await;
        assert_eq!(hub.on_point_changed(SensorReading::new("I5", true)), 2);

        assert_eq!(
            a.rx.recv().await.unwrap(),
            ServerMessage::ControlResponse(ControlAck::ok("open-claw"))
        );
        let update = ServerMessage::SensorUpdate(SensorReading::new("I5", true));
        assert_eq!(a.rx.recv().await.unwrap(), update);
        assert_eq!(b.rx.recv().await.unwrap(), update);
        // The acknowledgement went to the actor only.
        assert!(b.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn late_client_misses_earlier_broadcast_but_sees_fresh_snapshot() {
        let (hub, control) = hub(FakeControl::connected());
        let mut early = hub.on_client_connect().await;
        early.rx.recv().await.unwrap();

        control.sensors.lock().unwrap()[0].value = true;
        hub.on_point_changed(SensorReading::new("I1", true));

        let mut late = hub.on_client_connect().await;
        match late.rx.recv().await.unwrap() {
            ServerMessage::SensorData(readings) => assert!(readings[0].value),
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(late.rx.try_recv().is_err());
        assert!(matches!(
            early.rx.recv().await.unwrap(),
            ServerMessage::SensorUpdate(_)
        ));
    }

    #[tokio::test]
    async fn no_broadcast_after_disconnect() {
        let (hub, _control) = hub(FakeControl::connected());
        let mut client = hub.on_client_connect().await;
        client.rx.recv().await.unwrap();

        hub.on_client_disconnect(client.id);
        assert_eq!(hub.client_count(), 0);
        assert_eq!(hub.on_point_changed(SensorReading::new("I2", true)), 0);
        assert!(client.rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn degraded_session_yields_session_unavailable_ack() {
        let (hub, control) = hub(FakeControl::connected());
        let mut client = hub.on_client_connect().await;
        client.rx.recv().await.unwrap();
        *control.state.lock().unwrap() = SessionState::Degraded;

        let ack = hub.on_client_action(client.id, "move-right").await;
        assert_eq!(ack, ControlAck::failed("move-right", "SessionUnavailable"));
        assert_eq!(
            client.rx.recv().await.unwrap(),
            ServerMessage::ControlResponse(ack)
        );
    }

    #[tokio::test]
    async fn unknown_action_is_rejected_without_executing() {
        let (hub, control) = hub(FakeControl::connected());
        let client = hub.on_client_connect().await;
        let ack = hub.on_client_action(client.id, "self-destruct").await;
        assert_eq!(ack, ControlAck::failed("self-destruct", "InvalidAction"));
        assert!(control.executed.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn write_rejection_is_reported_by_kind() {
        let (hub, control) = hub(FakeControl::connected());
        *control.fail_with.lock().unwrap() = Some(GantryError::WriteRejected {
            action: Action::MoveUp,
            node_id: gantry_types::NodeId::string(3, "O3"),
            status: gantry_types::StatusCode::BAD_NOT_WRITABLE,
        });
        let client = hub.on_client_connect().await;
        let ack = hub.on_client_action(client.id, "move-up").await;
        assert_eq!(ack.error.as_deref(), Some("WriteRejected"));
        assert!(!ack.success);
    }

    #[tokio::test]
    async fn repeated_action_executes_each_time() {
        let (hub, control) = hub(FakeControl::connected());
        let client = hub.on_client_connect().await;
        hub.on_client_action(client.id, "move-left").await;
        hub.on_client_action(client.id, "move-left").await;
        assert_eq!(
            *control.executed.lock().unwrap(),
            vec![Action::MoveLeft, Action::MoveLeft]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn slow_action_times_out_with_an_ack_but_still_completes() {
        let control = Arc::new(FakeControl {
            delay: Duration::from_secs(30),
            ..FakeControl::connected()
        });
        let hub = FanoutHub::with_action_timeout(control.clone(), Duration::from_secs(2));
        let client = hub.on_client_connect().await;
        let ack = hub.on_client_action(client.id, "close-claw").await;
        assert_eq!(ack, ControlAck::failed("close-claw", "Timeout"));
        assert!(control.executed.lock().unwrap().is_empty());

        // The write was not cancelled with the wait.
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(*control.executed.lock().unwrap(), vec![Action::CloseClaw]);
    }

    #[tokio::test(start_paused = true)]
    async fn write_outliving_the_ack_still_reaches_the_plc() {
        use gantry_hal::{PointRegistry, SimPlc};
        use gantry_middleware::{SessionConfig, SessionManager, SubscriptionEngine};

        let registry = PointRegistry::new(3);
        let plc = SimPlc::new(registry.clone());
        let (tx, _readings) = mpsc::channel(64);
        let engine = SubscriptionEngine::new(registry.clone(), Default::default(), tx);
        let config = SessionConfig {
            request_timeout: Duration::from_secs(10),
            ..SessionConfig::default()
        };
        let session = SessionManager::new(Arc::new(plc.clone()), engine, config);
        session.start();
        session
            .watch_state()
            .wait_for(|s| *s == SessionState::Connected)
            .await
            .unwrap();

        let dispatcher = ControlDispatcher::new(session.clone(), registry);
        let hub = FanoutHub::new(Arc::new(dispatcher));
        let client = hub.on_client_connect().await;
        plc.set_latency(Duration::from_secs(6));

        let ack = hub.on_client_action(client.id, "open-claw").await;
        assert_eq!(ack, ControlAck::failed("open-claw", "Timeout"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(plc.write_log().len(), 1);
        assert_eq!(session.state(), SessionState::Connected);
        session.close().await;
    }

    #[test]
    fn action_timeout_covers_a_queued_request() {
        assert_eq!(action_timeout_for(Duration::from_secs(1)), DEFAULT_ACTION_TIMEOUT);
        assert_eq!(
            action_timeout_for(Duration::from_secs(10)),
            Duration::from_secs(20)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_is_first_even_when_updates_race_it() {
        let control = Arc::new(FakeControl {
            read_delay: Duration::from_millis(100),
            ..FakeControl::connected()
        });
        let hub = FanoutHub::new(control);
        let connecting = tokio::spawn({
            let hub = hub.clone();
            async move { hub.on_client_connect().await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(hub.client_count(), 1);
        assert_eq!(hub.on_point_changed(SensorReading::new("I4", true)), 1);

        let mut client = connecting.await.unwrap();
        assert!(matches!(
            client.rx.recv().await.unwrap(),
            ServerMessage::SensorData(_)
        ));
        assert_eq!(
            client.rx.recv().await.unwrap(),
            ServerMessage::SensorUpdate(SensorReading::new("I4", true))
        );
    }

    #[tokio::test]
    async fn run_pumps_notifications_until_closed() {
        let (hub, _control) = hub(FakeControl::connected());
        let mut client = hub.on_client_connect().await;
        client.rx.recv().await.unwrap();

        let (tx, rx) = mpsc::channel(4);
        let pump = tokio::spawn(hub.clone().run(rx));
        tx.send(SensorReading::new("I3", true)).await.unwrap();
        drop(tx);
        pump.await.unwrap();

        assert_eq!(
            client.rx.recv().await.unwrap(),
            ServerMessage::SensorUpdate(SensorReading::new("I3", true))
        );
    }

    #[tokio::test]
    async fn lagging_client_drops_updates_without_blocking_others() {
        let (hub, _control) = hub(FakeControl::connected());
        let stuck = hub.on_client_connect().await;
        let mut live = hub.on_client_connect().await;
        live.rx.recv().await.unwrap();

        // The stuck client still holds its unread snapshot.
        for _ in 0..CLIENT_BUFFER {
            hub.on_point_changed(SensorReading::new("I1", true));
            live.rx.recv().await.unwrap();
        }
        assert_eq!(hub.on_point_changed(SensorReading::new("I1", false)), 1);
        assert_eq!(stuck.rx.len(), CLIENT_BUFFER);
    }
}
