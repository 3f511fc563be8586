//! In-process gantry simulator for running and testing without a PLC.
//!
//! [`SimPlc`] implements the [`Transport`] traits against twelve in-memory
//! boolean points.  Writing an actuator drives the paired limit switches
//! after a configurable travel time, the way the test rig's PLC program does:
//!
//! | Asserted actuator | Action | Limit switch set | Limit switch cleared |
//! |---|---|---|---|
//! | `O1` | move-right | `I2` | `I1` |
//! | `O2` | move-left | `I1` | `I2` |
//! | `O3` | move-down | `I4` | `I3` |
//! | `O4` | move-up | `I3` | `I4` |
//! | `O5` | open-claw | `I5` | `I6` |
//! | `O6` | close-claw | `I6` | `I5` |
//!
//! Monitored items only see real value changes, plus the current value when
//! the item is created.
//!
//! # Fault injection
//!
//! Every handle shares the same state, so a test keeps a clone of the
//! simulator and pokes it while the bridge runs: refuse connections, reject
//! sessions or individual writes, add latency, drop the link, or flip a
//! sensor as if something outside the bridge moved the gantry.
//!
//! # Example
//!
//! ```rust
//! use gantry_hal::registry::PointRegistry;
//! use gantry_hal::sim::SimPlc;
//! use gantry_types::{PointName, SensorId};
//!
//! let plc = SimPlc::new(PointRegistry::new(3));
//! plc.set_sensor(SensorId::I5, true);
//! assert!(plc.value(PointName::Sensor(SensorId::I5)));
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use gantry_types::{ActuatorId, GantryError, NodeId, PointName, SensorId, StatusCode};
use tokio::sync::watch;
use tracing::debug;

use crate::queue::{QueueSink, monitored_queue};
use crate::registry::PointRegistry;
use crate::transport::{
    Connection, DataChange, MonitoredItem, MonitoringParams, ProtocolSession, ReadResult,
    SubscriptionHandle, Transport,
};

/// Endpoint address reported by the simulator.
pub const SIM_ENDPOINT: &str = "sim://gantry";

// ────────────────────────────────────────────────────────────────────────────
// Shared state
// ────────────────────────────────────────────────────────────────────────────

struct Monitor {
    session: u32,
    subscription: u32,
    node_id: NodeId,
    sink: QueueSink,
}

struct SimState {
    values: HashMap<NodeId, bool>,
    monitors: Vec<Monitor>,
    travel_time: Duration,
    latency: Duration,
    reachable: bool,
    failing_connects: u32,
    rejected_sessions: u32,
    write_faults: HashMap<NodeId, StatusCode>,
    write_log: Vec<Vec<(NodeId, bool)>>,
    connects: u32,
    next_id: u32,
}

impl SimState {
    /// Store `value` and notify monitors when it differs from the current one.
    fn apply(&mut self, node: &NodeId, value: bool) {
        if self.values.get(node) == Some(&value) {
            return;
        }
        self.values.insert(node.clone(), value);
        let now = Utc::now();
        // Monitors whose consumer has gone away are pruned here.
        self.monitors.retain(|m| {
            if &m.node_id != node {
                return true;
            }
            m.sink.push(DataChange {
                node_id: node.clone(),
                value,
                source_timestamp: now,
            })
        });
    }

    fn next_id(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }
}

struct SimInner {
    endpoint: String,
    registry: PointRegistry,
    /// Link generation.  Bumped by [`SimPlc::drop_link`]; connections and
    /// sessions from an older generation are dead.
    link: watch::Sender<u64>,
    state: Mutex<SimState>,
}

impl SimInner {
    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn generation(&self) -> u64 {
        *self.link.borrow()
    }

    /// Drive the limit switches for an asserted actuator.
    fn settle(&self, state: &mut SimState, actuator: ActuatorId) {
        let reached = limit_switch(actuator);
        state.apply(self.registry.sensor_node(reached), true);
        state.apply(self.registry.sensor_node(reached.paired()), false);
    }
}

/// Limit switch that closes once `actuator` has finished its travel.
fn limit_switch(actuator: ActuatorId) -> SensorId {
    match actuator {
        ActuatorId::O1 => SensorId::I2,
        ActuatorId::O2 => SensorId::I1,
        ActuatorId::O3 => SensorId::I4,
        ActuatorId::O4 => SensorId::I3,
        ActuatorId::O5 => SensorId::I5,
        ActuatorId::O6 => SensorId::I6,
    }
}

// ────────────────────────────────────────────────────────────────────────────
// SimPlc
// ────────────────────────────────────────────────────────────────────────────

/// Simulated PLC endpoint.  Clones share state.
#[derive(Clone)]
pub struct SimPlc {
    inner: Arc<SimInner>,
}

impl SimPlc {
    /// Create a simulator exposing every point in `registry`, all `false`,
    /// with instant travel.
    pub fn new(registry: PointRegistry) -> Self {
        let values = PointName::all()
            .map(|p| (registry.node(p).clone(), false))
            .collect();
        let (link, _) = watch::channel(0);
        Self {
            inner: Arc::new(SimInner {
                endpoint: SIM_ENDPOINT.to_string(),
                registry,
                link,
                state: Mutex::new(SimState {
                    values,
                    monitors: Vec::new(),
                    travel_time: Duration::ZERO,
                    latency: Duration::ZERO,
                    reachable: true,
                    failing_connects: 0,
                    rejected_sessions: 0,
                    write_faults: HashMap::new(),
                    write_log: Vec::new(),
                    connects: 0,
                    next_id: 0,
                }),
            }),
        }
    }

    /// Delay between an actuator write and the matching limit switch change.
    pub fn with_travel_time(self, travel_time: Duration) -> Self {
        self.inner.lock().travel_time = travel_time;
        self
    }

    /// Add a fixed delay to every read and write.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.lock().latency = latency;
    }

    /// While `false`, every connect attempt is refused.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.lock().reachable = reachable;
    }

    /// Refuse the next `n` connect attempts.
    pub fn fail_next_connects(&self, n: u32) {
        self.inner.lock().failing_connects = n;
    }

    /// Reject the next `n` session creations.
    pub fn reject_next_sessions(&self, n: u32) {
        self.inner.lock().rejected_sessions = n;
    }

    /// Answer every write to `node` with `status` instead of applying it.
    pub fn reject_writes_to(&self, node: NodeId, status: StatusCode) {
        self.inner.lock().write_faults.insert(node, status);
    }

    pub fn clear_write_faults(&self) {
        self.inner.lock().write_faults.clear();
    }

    /// Break the current link.  Open connections and sessions start failing
    /// with transport errors and every monitored item queue is closed.
    pub fn drop_link(&self) {
        let monitors = std::mem::take(&mut self.inner.lock().monitors);
        drop(monitors);
        self.inner.link.send_modify(|generation| *generation += 1);
        debug!(endpoint = %self.inner.endpoint, "sim link dropped");
    }

    /// Change a sensor as if the gantry had been moved externally.
    pub fn set_sensor(&self, sensor: SensorId, value: bool) {
        let node = self.inner.registry.sensor_node(sensor).clone();
        self.inner.lock().apply(&node, value);
    }

    pub fn value(&self, point: PointName) -> bool {
        let node = self.inner.registry.node(point);
        self.inner.lock().values.get(node).copied().unwrap_or(false)
    }

    /// Every write batch accepted so far, in arrival order.
    pub fn write_log(&self) -> Vec<Vec<(NodeId, bool)>> {
        self.inner.lock().write_log.clone()
    }

    pub fn connect_count(&self) -> u32 {
        self.inner.lock().connects
    }

    /// Number of live monitored items across all sessions.
    pub fn monitored_items(&self) -> usize {
        self.inner.lock().monitors.len()
    }
}

#[async_trait]
impl Transport for SimPlc {
    fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    async fn connect(&self) -> Result<Box<dyn Connection>, GantryError> {
        let mut state = self.inner.lock();
        state.connects += 1;
        if !state.reachable || state.failing_connects > 0 {
            state.failing_connects = state.failing_connects.saturating_sub(1);
            return Err(GantryError::Connection {
                endpoint: self.inner.endpoint.clone(),
                details: "connection refused".to_string(),
            });
        }
        Ok(Box::new(SimConnection {
            plc: self.clone(),
            generation: self.inner.generation(),
            open: true,
        }))
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection and session
// ────────────────────────────────────────────────────────────────────────────

struct SimConnection {
    plc: SimPlc,
    generation: u64,
    open: bool,
}

#[async_trait]
impl Connection for SimConnection {
    async fn create_session(&mut self) -> Result<Box<dyn ProtocolSession>, GantryError> {
        if !self.open {
            return Err(GantryError::Session("connection is closed".to_string()));
        }
        if self.plc.inner.generation() != self.generation {
            return Err(GantryError::Session("link dropped".to_string()));
        }
        let mut state = self.plc.inner.lock();
        if state.rejected_sessions > 0 {
            state.rejected_sessions -= 1;
            return Err(GantryError::Session("session rejected by endpoint".to_string()));
        }
        let id = state.next_id();
        Ok(Box::new(SimSession {
            plc: self.plc.clone(),
            id,
            generation: self.generation,
            closed: AtomicBool::new(false),
        }))
    }

    async fn disconnect(&mut self) -> Result<(), GantryError> {
        self.open = false;
        Ok(())
    }
}

struct SimSession {
    plc: SimPlc,
    id: u32,
    generation: u64,
    closed: AtomicBool,
}

impl SimSession {
    fn check(&self) -> Result<(), GantryError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(GantryError::Session("session is closed".to_string()));
        }
        if self.plc.inner.generation() != self.generation {
            return Err(GantryError::Transport("connection reset by peer".to_string()));
        }
        Ok(())
    }

    async fn round_trip(&self) -> Result<(), GantryError> {
        self.check()?;
        let latency = self.plc.inner.lock().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
            self.check()?;
        }
        Ok(())
    }
}

#[async_trait]
impl ProtocolSession for SimSession {
    async fn read(&self, nodes: &[NodeId]) -> Result<Vec<ReadResult>, GantryError> {
        self.round_trip().await?;
        let state = self.plc.inner.lock();
        Ok(nodes
            .iter()
            .map(|node| match state.values.get(node) {
                Some(value) => ReadResult {
                    node_id: node.clone(),
                    value: Some(*value),
                    status: StatusCode::GOOD,
                },
                None => ReadResult {
                    node_id: node.clone(),
                    value: None,
                    status: StatusCode::BAD_NODE_ID_UNKNOWN,
                },
            })
            .collect())
    }

    async fn write(&self, values: &[(NodeId, bool)]) -> Result<Vec<StatusCode>, GantryError> {
        self.round_trip().await?;
        let inner = &self.plc.inner;
        let mut state = inner.lock();

        let mut statuses = Vec::with_capacity(values.len());
        let mut asserted = Vec::new();
        for (node, value) in values {
            let status = match state.write_faults.get(node) {
                Some(status) => *status,
                None => match inner.registry.lookup(node) {
                    Some(PointName::Actuator(a)) => {
                        if *value {
                            asserted.push(a);
                        }
                        StatusCode::GOOD
                    }
                    Some(PointName::Sensor(_)) => StatusCode::BAD_NOT_WRITABLE,
                    None => StatusCode::BAD_NODE_ID_UNKNOWN,
                },
            };
            if status.is_good() {
                state.apply(node, *value);
            }
            statuses.push(status);
        }
        state.write_log.push(values.to_vec());

        let travel_time = state.travel_time;
        if travel_time.is_zero() {
            for actuator in asserted {
                inner.settle(&mut state, actuator);
            }
        } else if !asserted.is_empty() {
            let plc = self.plc.clone();
            tokio::spawn(async move {
                tokio::time::sleep(travel_time).await;
                let mut state = plc.inner.lock();
                for actuator in asserted {
                    plc.inner.settle(&mut state, actuator);
                }
            });
        }

        Ok(statuses)
    }

    async fn subscribe(
        &self,
        nodes: &[NodeId],
        params: &MonitoringParams,
    ) -> Result<SubscriptionHandle, GantryError> {
        self.check()?;
        let mut state = self.plc.inner.lock();
        if let Some(missing) = nodes.iter().find(|n| !state.values.contains_key(*n)) {
            return Err(GantryError::Subscription(format!(
                "cannot monitor {missing}: {}",
                StatusCode::BAD_NODE_ID_UNKNOWN
            )));
        }

        let subscription = state.next_id();
        let now = Utc::now();
        let mut items = Vec::with_capacity(nodes.len());
        for node in nodes {
            let (sink, queue) = monitored_queue(params.queue_size);
            let current = state.values.get(node).copied().unwrap_or(false);
            sink.push(DataChange {
                node_id: node.clone(),
                value: current,
                source_timestamp: now,
            });
            state.monitors.push(Monitor {
                session: self.id,
                subscription,
                node_id: node.clone(),
                sink,
            });
            items.push(MonitoredItem {
                node_id: node.clone(),
                queue,
            });
        }

        Ok(SubscriptionHandle {
            id: subscription,
            items,
        })
    }

    async fn unsubscribe(&self, subscription_id: u32) -> Result<(), GantryError> {
        self.check()?;
        let mut state = self.plc.inner.lock();
        let before = state.monitors.len();
        state.monitors.retain(|m| m.subscription != subscription_id);
        if state.monitors.len() == before {
            return Err(GantryError::Subscription(format!(
                "unknown subscription {subscription_id}"
            )));
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), GantryError> {
        let result = self.check();
        self.closed.store(true, Ordering::SeqCst);
        self.plc
            .inner
            .lock()
            .monitors
            .retain(|m| m.session != self.id);
        result
    }

    async fn link_lost(&self) {
        let generation = self.generation;
        let mut rx = self.plc.inner.link.subscribe();
        // The sender lives as long as the simulator, so this only returns on
        // a generation change.
        let _ = rx.wait_for(|current| *current != generation).await;
    }
}
