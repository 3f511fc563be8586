//! Subscription engine: one subscription, one monitored item per sensor.
//!
//! [`SubscriptionEngine::start_monitoring`] subscribes to every sensor in the
//! [`PointRegistry`] and spawns a forwarding task that drains the per-item
//! queues, maps node ids back to point names and publishes
//! [`SensorReading`]s on an mpsc channel to the fan-out hub.
//!
//! # Ordering
//!
//! Items are merged fairly, so there is no ordering across points.  Within a
//! point, notifications carrying an older source timestamp than one already
//! forwarded are discarded.
//!
//! # Backpressure
//!
//! The hub channel is bounded.  When the hub falls behind, the forwarding
//! task stops draining and the per-item queues start discarding their oldest
//! entries, so the hub always ends up with the latest value of each point.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::stream::{self, BoxStream};
use gantry_hal::{DataChange, MonitoredItem, MonitoringParams, PointRegistry, ProtocolSession};
use gantry_types::{GantryError, NodeId, SensorReading};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Creates subscriptions on a session and forwards their notifications.
#[derive(Clone)]
pub struct SubscriptionEngine {
    registry: PointRegistry,
    params: MonitoringParams,
    notifications: mpsc::Sender<SensorReading>,
}

impl SubscriptionEngine {
    pub fn new(
        registry: PointRegistry,
        params: MonitoringParams,
        notifications: mpsc::Sender<SensorReading>,
    ) -> Self {
        Self {
            registry,
            params,
            notifications,
        }
    }

    pub fn params(&self) -> &MonitoringParams {
        &self.params
    }

    /// Subscribe to every sensor point on `session` and start forwarding.
    ///
    /// # Errors
    ///
    /// [`GantryError::Subscription`] when the endpoint refuses the
    /// subscription or any monitored item.  Link faults pass through as-is.
    pub async fn start_monitoring(
        &self,
        session: &Arc<dyn ProtocolSession>,
    ) -> Result<Subscription, GantryError> {
        let nodes = self.registry.sensor_nodes();
        let handle = session
            .subscribe(&nodes, &self.params)
            .await
            .map_err(|e| match e {
                GantryError::Subscription(_) => e,
                e if e.is_link_fault() => e,
                e => GantryError::Subscription(e.to_string()),
            })?;

        info!(
            subscription_id = handle.id,
            items = handle.items.len(),
            sampling_ms = self.params.sampling_interval.as_millis() as u64,
            "monitoring started"
        );
        let task = tokio::spawn(forward(
            handle.items,
            self.registry.clone(),
            self.notifications.clone(),
        ));
        Ok(Subscription {
            id: handle.id,
            task,
        })
    }
}

/// A live subscription.  Dropping it stops forwarding; [`Self::terminate`]
/// also removes it from the endpoint.
pub struct Subscription {
    id: u32,
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Stop forwarding, then delete the subscription on `session`.
    pub async fn terminate(self, session: &dyn ProtocolSession) -> Result<(), GantryError> {
        self.task.abort();
        session.unsubscribe(self.id).await?;
        debug!(subscription_id = self.id, "subscription terminated");
        Ok(())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn item_stream(item: MonitoredItem) -> BoxStream<'static, DataChange> {
    stream::unfold(item.queue, |mut queue| async move {
        queue.recv().await.map(|change| (change, queue))
    })
    .boxed()
}

/// Drain every item queue until they all close or the hub goes away.
async fn forward(
    items: Vec<MonitoredItem>,
    registry: PointRegistry,
    notifications: mpsc::Sender<SensorReading>,
) {
    let mut merged = stream::select_all(items.into_iter().map(item_stream));
    let mut last_seen: HashMap<NodeId, DateTime<Utc>> = HashMap::new();

    while let Some(change) = merged.next().await {
        if let Some(previous) = last_seen.get(&change.node_id) {
            if change.source_timestamp < *previous {
                debug!(node_id = %change.node_id, "discarding out-of-order notification");
                continue;
            }
        }
        last_seen.insert(change.node_id.clone(), change.source_timestamp);

        let reading = SensorReading::new(registry.reverse(&change.node_id), change.value);
        debug!(sensor = %reading.sensor, value = reading.value, "point changed");
        if notifications.send(reading).await.is_err() {
            debug!("notification receiver closed");
            return;
        }
    }
    debug!("all monitored items closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use gantry_hal::SimPlc;
    use gantry_hal::queue::monitored_queue;
    use gantry_hal::{Connection, Transport};
    use gantry_types::SensorId;

    fn change(name: &str, value: bool, at: DateTime<Utc>) -> DataChange {
        DataChange {
            node_id: NodeId::string(3, name),
            value,
            source_timestamp: at,
        }
    }

    #[tokio::test]
    async fn forward_maps_names_and_drops_stale_notifications() {
        let (sink, queue) = monitored_queue(10);
        let items = vec![MonitoredItem {
            node_id: NodeId::string(3, "I2"),
            queue,
        }];
        let now = Utc::now();
        sink.push(change("I2", true, now));
        sink.push(change("I2", false, now - ChronoDuration::milliseconds(5)));
        sink.push(change("I2", false, now + ChronoDuration::milliseconds(5)));
        drop(sink);

        let (tx, mut rx) = mpsc::channel(10);
        forward(items, PointRegistry::new(3), tx).await;

        assert_eq!(rx.recv().await, Some(SensorReading::new("I2", true)));
        assert_eq!(rx.recv().await, Some(SensorReading::new("I2", false)));
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn forward_passes_unmapped_nodes_through_raw() {
        let (sink, queue) = monitored_queue(1);
        let raw = NodeId::new("ns=7;i=42");
        let items = vec![MonitoredItem {
            node_id: raw.clone(),
            queue,
        }];
        sink.push(DataChange {
            node_id: raw,
            value: true,
            source_timestamp: Utc::now(),
        });
        drop(sink);

        let (tx, mut rx) = mpsc::channel(1);
        forward(items, PointRegistry::new(3), tx).await;
        assert_eq!(rx.recv().await.unwrap().sensor, "ns=7;i=42");
    }

    #[tokio::test]
    async fn start_monitoring_forwards_sensor_changes() {
        let registry = PointRegistry::new(3);
        let plc = SimPlc::new(registry.clone());
        let mut conn = plc.connect().await.unwrap();
        let session: Arc<dyn ProtocolSession> = Arc::from(conn.create_session().await.unwrap());

        let (tx, mut rx) = mpsc::channel(16);
        let engine = SubscriptionEngine::new(registry, MonitoringParams::default(), tx);
        let subscription = engine.start_monitoring(&session).await.unwrap();
        assert_eq!(plc.monitored_items(), 6);

        // Six initial values first.
        for _ in 0..6 {
            assert!(!rx.recv().await.unwrap().value);
        }
        plc.set_sensor(SensorId::I6, true);
        assert_eq!(rx.recv().await, Some(SensorReading::new("I6", true)));

        subscription.terminate(session.as_ref()).await.unwrap();
        assert_eq!(plc.monitored_items(), 0);
    }

    #[tokio::test]
    async fn refused_subscription_is_a_subscription_error() {
        // Registry pointing I1 at a node the simulator does not expose.
        let mut overrides = std::collections::BTreeMap::new();
        overrides.insert("I1".to_string(), "ns=3;s=\"Missing\"".to_string());
        let registry = PointRegistry::from_config(3, &overrides).unwrap();
        let plc = SimPlc::new(PointRegistry::new(3));
        let mut conn = plc.connect().await.unwrap();
        let session: Arc<dyn ProtocolSession> = Arc::from(conn.create_session().await.unwrap());

        let (tx, _rx) = mpsc::channel(1);
        let engine = SubscriptionEngine::new(registry, MonitoringParams::default(), tx);
        let err = engine.start_monitoring(&session).await.err().unwrap();
        assert!(matches!(err, GantryError::Subscription(_)));
    }
}
