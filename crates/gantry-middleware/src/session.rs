//! [`SessionManager`] – sole owner of the upstream connection and session.
//!
//! # State machine
//!
//! ```text
//! Disconnected ──start──▶ Connecting ──▶ Connected
//!                              ▲             │ link fault
//!                              │             ▼
//!                              └──────── Degraded
//! ```
//!
//! A background supervisor task drives the machine.  It connects with
//! bounded timeouts and exponential backoff, opens the session, starts
//! monitoring through the [`SubscriptionEngine`], and then waits for a fault:
//! the transport reporting the link lost, or a read/write failing with a
//! link-level error.  A fault moves the session to `Degraded` at once, tears
//! the old session down best-effort and reconnects.
//!
//! When the retry budget is exhausted the supervisor gives up and the
//! session stays `Disconnected`; every request keeps failing fast with
//! [`GantryError::SessionUnavailable`].
//!
//! # Serialization
//!
//! The live connection, session and subscription sit behind one async mutex.
//! Session creation, writes, reads and teardown all take it, so no two of
//! them ever touch the session concurrently.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_hal::{Connection, ProtocolSession, ReadResult, Transport};
use gantry_types::{GantryError, NodeId, SessionState, StatusCode};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout, timeout_at};
use tracing::{debug, error, info, warn};

use crate::subscription::{Subscription, SubscriptionEngine};

/// Timeouts, retry budget and backoff for the upstream session.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    pub session_timeout: Duration,
    /// Upper bound for a single read or write round trip.
    pub request_timeout: Duration,
    /// Consecutive failed attempts before giving up.  `0` retries forever.
    pub retry_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    /// Upper bound for [`SessionManager::close`].
    pub shutdown_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            session_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(3),
            retry_attempts: 10,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(3),
        }
    }
}

impl SessionConfig {
    /// Delay before retrying after failed attempt number `attempt` (1-based):
    /// `initial_backoff * 2^(attempt - 1)`, capped at `max_backoff`.
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Internals
// ────────────────────────────────────────────────────────────────────────────

struct Live {
    connection: Box<dyn Connection>,
    session: Arc<dyn ProtocolSession>,
    subscription: Option<Subscription>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    engine: SubscriptionEngine,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    live: tokio::sync::Mutex<Option<Live>>,
    shutdown: watch::Sender<bool>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    #[cfg(test)]
    transitions: Mutex<Vec<SessionState>>,
}

impl Inner {
    fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            info!(from = %previous, to = %next, "session state changed");
            self.record(next);
        }
    }

    #[cfg(test)]
    fn record(&self, state: SessionState) {
        self.transitions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(state);
    }

    #[cfg(not(test))]
    fn record(&self, _state: SessionState) {}

    fn endpoint(&self) -> &str {
        self.transport.endpoint()
    }

    /// Open a connection, a session and the subscription, in that order.
    /// Anything opened before a failing step is released again.
    async fn try_establish(&self) -> Result<(), GantryError> {
        let cfg = &self.config;
        let mut connection = timeout(cfg.connect_timeout, self.transport.connect())
            .await
            .map_err(|_| GantryError::Connection {
                endpoint: self.endpoint().to_string(),
                details: format!("timed out after {:?}", cfg.connect_timeout),
            })??;

        let session: Arc<dyn ProtocolSession> =
            match timeout(cfg.session_timeout, connection.create_session()).await {
                Ok(Ok(session)) => Arc::from(session),
                Ok(Err(e)) => {
                    release_connection(connection.as_mut()).await;
                    return Err(e);
                }
                Err(_) => {
                    release_connection(connection.as_mut()).await;
                    return Err(GantryError::Session(format!(
                        "timed out after {:?}",
                        cfg.session_timeout
                    )));
                }
            };

        let subscription = match self.engine.start_monitoring(&session).await {
            Ok(subscription) => subscription,
            Err(e) => {
                release_session(session.as_ref()).await;
                release_connection(connection.as_mut()).await;
                return Err(e);
            }
        };

        *self.live.lock().await = Some(Live {
            connection,
            session,
            subscription: Some(subscription),
        });
        self.set_state(SessionState::Connected);
        Ok(())
    }

    /// Retry [`Self::try_establish`] with backoff until it succeeds or the
    /// retry budget runs out.
    async fn establish(&self) -> Result<(), GantryError> {
        let budget = self.config.retry_attempts;
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            match self.try_establish().await {
                Ok(()) => {
                    info!(endpoint = %self.endpoint(), attempt, "session established");
                    return Ok(());
                }
                Err(e) if budget != 0 && attempt >= budget => return Err(e),
                Err(e) => {
                    let delay = self.config.backoff_delay(attempt);
                    warn!(
                        endpoint = %self.endpoint(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "session setup failed; retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Best-effort teardown: terminate the subscription, close the session,
    /// disconnect.  Every step runs even if an earlier one failed.
    async fn teardown(&self) {
        let Some(mut live) = self.live.lock().await.take() else {
            return;
        };
        if let Some(subscription) = live.subscription.take() {
            if let Err(e) = subscription.terminate(live.session.as_ref()).await {
                warn!(error = %e, "subscription termination failed");
            }
        }
        release_session(live.session.as_ref()).await;
        release_connection(live.connection.as_mut()).await;
        debug!(endpoint = %self.endpoint(), "session torn down");
    }

    async fn supervise(self: Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        let mut states = self.state.subscribe();
        loop {
            self.set_state(SessionState::Connecting);
            let established = tokio::select! {
                result = self.establish() => result,
                _ = shutdown.wait_for(|stop| *stop) => return,
            };
            if let Err(e) = established {
                error!(
                    endpoint = %self.endpoint(),
                    error = %e,
                    "retry budget exhausted; serving without an upstream session"
                );
                self.set_state(SessionState::Disconnected);
                return;
            }

            let session = match self.live.lock().await.as_ref() {
                Some(live) => Arc::clone(&live.session),
                None => continue,
            };
            tokio::select! {
                _ = session.link_lost() => warn!(endpoint = %self.endpoint(), "upstream link lost"),
                _ = states.wait_for(|s| *s != SessionState::Connected) => {
                    warn!(endpoint = %self.endpoint(), "upstream fault reported")
                }
                _ = shutdown.wait_for(|stop| *stop) => return,
            }

            self.set_state(SessionState::Degraded);
            self.teardown().await;
        }
    }

    /// Move a connected session to `Degraded`, which wakes the supervisor.
    fn report_fault(&self, error: &GantryError) {
        let degraded = self.state.send_if_modified(|state| {
            if *state == SessionState::Connected {
                *state = SessionState::Degraded;
                true
            } else {
                false
            }
        });
        if degraded {
            self.record(SessionState::Degraded);
            warn!(error = %error, "session degraded");
        }
    }
}

async fn release_session(session: &dyn ProtocolSession) {
    if let Err(e) = session.close().await {
        warn!(error = %e, "session close failed");
    }
}

async fn release_connection(connection: &mut dyn Connection) {
    if let Err(e) = connection.disconnect().await {
        warn!(error = %e, "disconnect failed");
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Public handle
// ────────────────────────────────────────────────────────────────────────────

/// Injectable handle to the single upstream session.  Clones share it.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        transport: Arc<dyn Transport>,
        engine: SubscriptionEngine,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Disconnected);
        let (shutdown, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                transport,
                engine,
                config,
                state,
                live: tokio::sync::Mutex::new(None),
                shutdown,
                supervisor: Mutex::new(None),
                #[cfg(test)]
                transitions: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Spawn the supervisor.  Calling it again while it runs does nothing.
    pub fn start(&self) {
        let mut supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if supervisor.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        info!(endpoint = %self.inner.endpoint(), "starting session supervisor");
        *supervisor = Some(tokio::spawn(Arc::clone(&self.inner).supervise()));
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn endpoint(&self) -> &str {
        self.inner.endpoint()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.inner.config
    }

    fn ensure_connected(&self) -> Result<(), GantryError> {
        if self.state() == SessionState::Connected {
            Ok(())
        } else {
            Err(GantryError::SessionUnavailable)
        }
    }

    /// Read `nodes` on the live session.
    ///
    /// Fails fast with [`GantryError::SessionUnavailable`] unless connected.
    /// Link-level failures degrade the session before being returned.
    pub async fn read(&self, nodes: &[NodeId]) -> Result<Vec<ReadResult>, GantryError> {
        self.ensure_connected()?;
        let live = self.inner.live.lock().await;
        self.ensure_connected()?;
        let session = live
            .as_ref()
            .map(|l| Arc::clone(&l.session))
            .ok_or(GantryError::SessionUnavailable)?;

        let result = match timeout(self.inner.config.request_timeout, session.read(nodes)).await {
            Ok(result) => result,
            Err(_) => Err(GantryError::Timeout(format!(
                "read of {} nodes exceeded {:?}",
                nodes.len(),
                self.inner.config.request_timeout
            ))),
        };
        drop(live);
        self.check(result)
    }

    /// Submit one batched write on the live session.  Per-entry statuses are
    /// returned as-is; interpreting them is up to the caller.
    pub async fn write(&self, values: &[(NodeId, bool)]) -> Result<Vec<StatusCode>, GantryError> {
        self.ensure_connected()?;
        let live = self.inner.live.lock().await;
        self.ensure_connected()?;
        let session = live
            .as_ref()
            .map(|l| Arc::clone(&l.session))
            .ok_or(GantryError::SessionUnavailable)?;

        let result = match timeout(self.inner.config.request_timeout, session.write(values)).await
        {
            Ok(result) => result,
            Err(_) => Err(GantryError::Timeout(format!(
                "write of {} values exceeded {:?}",
                values.len(),
                self.inner.config.request_timeout
            ))),
        };
        drop(live);
        self.check(result)
    }

    fn check<T>(&self, result: Result<T, GantryError>) -> Result<T, GantryError> {
        if let Err(e) = &result {
            if e.is_link_fault() {
                self.report_fault(e.clone());
            }
        }
        result
    }

    /// Report a link-level fault observed outside the manager.  Only has an
    /// effect while connected.
    pub fn report_fault(&self, error: GantryError) {
        self.inner.report_fault(&error);
    }

    /// Stop the supervisor and tear the session down.  Both steps share one
    /// deadline, the configured shutdown timeout from now.  Never fails;
    /// problems are logged.
    pub async fn close(&self) {
        let limit = self.inner.config.shutdown_timeout;
        let deadline = Instant::now() + limit;
        self.inner.shutdown.send_replace(true);

        let supervisor = self
            .inner
            .supervisor
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(mut handle) = supervisor {
            if timeout_at(deadline, &mut handle).await.is_err() {
                warn!("session supervisor did not stop in time; aborting it");
                handle.abort();
            }
        }

        if timeout_at(deadline, self.inner.teardown()).await.is_err() {
            warn!(timeout = ?limit, "session teardown timed out");
        }
        self.inner.set_state(SessionState::Disconnected);
        info!(endpoint = %self.inner.endpoint(), "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_hal::{PointRegistry, SimPlc};
    use gantry_types::{PointName, SensorId, SensorReading};
    use tokio::sync::mpsc;

    fn fast_config() -> SessionConfig {
        SessionConfig {
            connect_timeout: Duration::from_millis(200),
            session_timeout: Duration::from_millis(200),
            request_timeout: Duration::from_millis(200),
            retry_attempts: 0,
            initial_backoff: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            shutdown_timeout: Duration::from_millis(500),
        }
    }

    fn manager(plc: &SimPlc, config: SessionConfig) -> (SessionManager, mpsc::Receiver<SensorReading>) {
        let (tx, rx) = mpsc::channel(64);
        let engine = SubscriptionEngine::new(PointRegistry::new(3), Default::default(), tx);
        (SessionManager::new(Arc::new(plc.clone()), engine, config), rx)
    }

    async fn wait_for(manager: &SessionManager, target: SessionState) {
        let mut rx = manager.watch_state();
        timeout(Duration::from_secs(5), rx.wait_for(|s| *s == target))
            .await
            .expect("state not reached in time")
            .expect("state channel closed");
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let cfg = SessionConfig {
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(1000),
            ..SessionConfig::default()
        };
        assert_eq!(cfg.backoff_delay(1), Duration::from_millis(100));
        assert_eq!(cfg.backoff_delay(2), Duration::from_millis(200));
        assert_eq!(cfg.backoff_delay(4), Duration::from_millis(800));
        assert_eq!(cfg.backoff_delay(5), Duration::from_millis(1000));
        assert_eq!(cfg.backoff_delay(u32::MAX), Duration::from_millis(1000));
    }

    #[tokio::test]
    async fn requests_fail_fast_before_start() {
        let plc = SimPlc::new(PointRegistry::new(3));
        let (manager, _rx) = manager(&plc, fast_config());
        assert_eq!(manager.state(), SessionState::Disconnected);
        let err = manager.read(&[NodeId::string(3, "I1")]).await.unwrap_err();
        assert_eq!(err, GantryError::SessionUnavailable);
    }

    #[tokio::test]
    async fn start_connects_and_monitors_every_sensor() {
        let plc = SimPlc::new(PointRegistry::new(3));
        let (manager, mut rx) = manager(&plc, fast_config());
        manager.start();
        wait_for(&manager, SessionState::Connected).await;
        assert_eq!(plc.monitored_items(), 6);

        // Initial values of all six sensors come through the channel.
        let mut seen = Vec::new();
        for _ in 0..6 {
            seen.push(rx.recv().await.unwrap().sensor);
        }
        seen.sort();
        assert_eq!(seen, ["I1", "I2", "I3", "I4", "I5", "I6"]);

        let results = manager.read(&[NodeId::string(3, "I4")]).await.unwrap();
        assert_eq!(results[0].value, Some(false));
        manager.close().await;
    }

    #[tokio::test]
    async fn retries_refused_connects_and_rejected_sessions() {
        let plc = SimPlc::new(PointRegistry::new(3));
        plc.fail_next_connects(2);
        plc.reject_next_sessions(1);
        let (manager, _rx) = manager(&plc, fast_config());
        manager.start();
        wait_for(&manager, SessionState::Connected).await;
        assert_eq!(plc.connect_count(), 4);
        manager.close().await;
    }

    #[tokio::test]
    async fn exhausted_retry_budget_ends_disconnected() {
        let plc = SimPlc::new(PointRegistry::new(3));
        plc.set_reachable(false);
        let config = SessionConfig {
            retry_attempts: 3,
            ..fast_config()
        };
        let (manager, _rx) = manager(&plc, config);
        manager.start();
        wait_for(&manager, SessionState::Connecting).await;
        wait_for(&manager, SessionState::Disconnected).await;
        assert_eq!(plc.connect_count(), 3);
        assert_eq!(
            manager.write(&[(NodeId::string(3, "O1"), true)]).await,
            Err(GantryError::SessionUnavailable)
        );
    }

    #[tokio::test]
    async fn reconnects_after_link_loss() {
        let plc = SimPlc::new(PointRegistry::new(3));
        let (manager, _rx) = manager(&plc, fast_config());
        manager.start();
        wait_for(&manager, SessionState::Connected).await;

        plc.set_reachable(false);
        plc.drop_link();
        let mut rx = manager.watch_state();
        timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| matches!(s, SessionState::Degraded | SessionState::Connecting)),
        )
        .await
        .unwrap()
        .unwrap();
        let err = manager
            .write(&[(NodeId::string(3, "O1"), true)])
            .await
            .unwrap_err();
        assert_eq!(err, GantryError::SessionUnavailable);

        plc.set_reachable(true);
        wait_for(&manager, SessionState::Connected).await;
        assert!(manager.read(&[NodeId::string(3, "I1")]).await.is_ok());
        assert_eq!(plc.monitored_items(), 6);
        manager.close().await;
    }

    fn transitions(manager: &SessionManager) -> Vec<SessionState> {
        manager.inner.transitions.lock().unwrap().clone()
    }

    #[tokio::test]
    async fn link_loss_walks_degraded_then_connecting() {
        use SessionState::*;

        let plc = SimPlc::new(PointRegistry::new(3));
        let (manager, _rx) = manager(&plc, fast_config());
        manager.start();
        wait_for(&manager, Connected).await;

        plc.set_reachable(false);
        plc.drop_link();
        wait_for(&manager, Connecting).await;
        // Held down: retries stay inside Connecting.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(manager.state(), Connecting);

        plc.set_reachable(true);
        wait_for(&manager, Connected).await;
        manager.close().await;

        assert_eq!(
            transitions(&manager),
            [Connecting, Connected, Degraded, Connecting, Connected, Disconnected]
        );
    }

    #[tokio::test]
    async fn slow_write_times_out_and_degrades() {
        let plc = SimPlc::new(PointRegistry::new(3));
        let (manager, _rx) = manager(&plc, fast_config());
        manager.start();
        wait_for(&manager, SessionState::Connected).await;

        let mut states = manager.watch_state();
        states.borrow_and_update();
        plc.set_latency(Duration::from_secs(1));
        let err = manager
            .write(&[(NodeId::string(3, "O1"), true)])
            .await
            .unwrap_err();
        assert!(matches!(err, GantryError::Timeout(_)));
        // The fault was reported, so the state left Connected.
        timeout(Duration::from_secs(1), states.changed())
            .await
            .unwrap()
            .unwrap();

        plc.set_latency(Duration::ZERO);
        wait_for(&manager, SessionState::Connected).await;
        manager.close().await;

        use SessionState::*;
        assert_eq!(
            transitions(&manager),
            [Connecting, Connected, Degraded, Connecting, Connected, Disconnected]
        );
    }

    #[tokio::test]
    async fn close_tears_everything_down() {
        let plc = SimPlc::new(PointRegistry::new(3));
        let (manager, _rx) = manager(&plc, fast_config());
        manager.start();
        wait_for(&manager, SessionState::Connected).await;

        manager.close().await;
        assert_eq!(manager.state(), SessionState::Disconnected);
        assert_eq!(plc.monitored_items(), 0);
        assert_eq!(
            manager.read(&[NodeId::string(3, "I1")]).await,
            Err(GantryError::SessionUnavailable)
        );
        // Changes after close reach no monitored item.
        plc.set_sensor(SensorId::I1, true);
        assert!(plc.value(PointName::Sensor(SensorId::I1)));
        assert_eq!(plc.monitored_items(), 0);
    }

    #[tokio::test]
    async fn close_while_unreachable_returns_promptly() {
        let plc = SimPlc::new(PointRegistry::new(3));
        plc.set_reachable(false);
        let (manager, _rx) = manager(&plc, fast_config());
        manager.start();
        wait_for(&manager, SessionState::Connecting).await;
        timeout(Duration::from_secs(2), manager.close())
            .await
            .expect("close must be bounded");
        assert_eq!(manager.state(), SessionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn close_shares_one_deadline_between_supervisor_and_teardown() {
        let plc = SimPlc::new(PointRegistry::new(3));
        let config = SessionConfig {
            request_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(1),
            ..fast_config()
        };
        let (manager, _rx) = manager(&plc, config);
        manager.start();
        wait_for(&manager, SessionState::Connected).await;

        // A slow write holds the live session, so teardown cannot start.
        plc.set_latency(Duration::from_secs(8));
        let writer = manager.clone();
        tokio::spawn(async move { writer.write(&[(NodeId::string(3, "O1"), true)]).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The supervisor is now stuck in its own teardown.
        manager.report_fault(GantryError::Transport("link reset".to_string()));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let started = Instant::now();
        manager.close().await;
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");
        assert!(elapsed < Duration::from_millis(1100), "{elapsed:?}");
        assert_eq!(manager.state(), SessionState::Disconnected);
    }
}
