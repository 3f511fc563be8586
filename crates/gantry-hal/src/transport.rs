//! Transport seam between the bridge core and an automation endpoint.
//!
//! The core never talks to a protocol library directly.  It drives three
//! object-safe traits, mirroring the lifecycle of a client connection:
//!
//! | Trait | Lifetime | Operations |
//! |---|---|---|
//! | [`Transport`] | process | open a connection to the endpoint |
//! | [`Connection`] | one link | open a session, disconnect |
//! | [`ProtocolSession`] | one session | read, write, subscribe, close |
//!
//! Implementations:
//!
//! - [`SimPlc`][crate::sim::SimPlc] – in-process gantry simulator.
//! - `OpcUaTransport` (feature `opcua`) – a real OPC UA client.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gantry_types::{GantryError, NodeId, StatusCode};

use crate::queue::NotificationQueue;

/// One value change reported by a monitored item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChange {
    pub node_id: NodeId,
    pub value: bool,
    pub source_timestamp: DateTime<Utc>,
}

/// Result of reading one node.  `value` is `None` when the status is not good.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResult {
    pub node_id: NodeId,
    pub value: Option<bool>,
    pub status: StatusCode,
}

/// Parameters used when creating a subscription and its monitored items.
#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringParams {
    pub publishing_interval: Duration,
    pub lifetime_count: u32,
    pub max_keep_alive_count: u32,
    pub max_notifications_per_publish: u32,
    pub priority: u8,
    pub sampling_interval: Duration,
    /// Per-item queue depth.  Overflow always discards the oldest entry.
    pub queue_size: usize,
}

impl Default for MonitoringParams {
    fn default() -> Self {
        Self {
            publishing_interval: Duration::from_millis(1000),
            lifetime_count: 100,
            max_keep_alive_count: 10,
            max_notifications_per_publish: 10,
            priority: 10,
            sampling_interval: Duration::from_millis(500),
            queue_size: 10,
        }
    }
}

/// Consumer side of one monitored item.
pub struct MonitoredItem {
    pub node_id: NodeId,
    pub queue: NotificationQueue,
}

/// A created subscription: its protocol id plus one monitored item per
/// requested node, in request order.
pub struct SubscriptionHandle {
    pub id: u32,
    pub items: Vec<MonitoredItem>,
}

/// Factory for connections to one endpoint.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Endpoint address, used in logs and connection errors.
    fn endpoint(&self) -> &str;

    /// Open a transport-level connection.
    ///
    /// Fails with [`GantryError::Connection`] when the endpoint refuses.
    async fn connect(&self) -> Result<Box<dyn Connection>, GantryError>;
}

/// An established link to the endpoint.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Negotiate a session on this link.
    ///
    /// Fails with [`GantryError::Session`] when the endpoint rejects it.
    async fn create_session(&mut self) -> Result<Box<dyn ProtocolSession>, GantryError>;

    async fn disconnect(&mut self) -> Result<(), GantryError>;
}

/// An open session.  All calls may suspend on network I/O.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Read boolean values.  One result per node, in request order.
    async fn read(&self, nodes: &[NodeId]) -> Result<Vec<ReadResult>, GantryError>;

    /// Submit one batched write.  One status per entry, in request order.
    async fn write(&self, values: &[(NodeId, bool)]) -> Result<Vec<StatusCode>, GantryError>;

    /// Create one subscription with a monitored item per node.
    async fn subscribe(
        &self,
        nodes: &[NodeId],
        params: &MonitoringParams,
    ) -> Result<SubscriptionHandle, GantryError>;

    async fn unsubscribe(&self, subscription_id: u32) -> Result<(), GantryError>;

    async fn close(&self) -> Result<(), GantryError>;

    /// Resolves once the link under this session has failed.
    async fn link_lost(&self);
}
