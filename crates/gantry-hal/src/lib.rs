//! `gantry-hal` – protocol abstraction for the gantry PLC.
//!
//! Everything the bridge core needs to know about the automation endpoint
//! lives behind the traits in [`transport`].  The core itself never names a
//! protocol library.
//!
//! # Modules
//!
//! - [`registry`] – fixed mapping between point names and node ids.
//! - [`transport`] – connection, session and subscription traits.
//! - [`queue`] – bounded drop-oldest queue behind each monitored item.
//! - [`sim`] – in-process simulated PLC with fault injection.
//! - `opcua_transport` (feature `opcua`) – OPC UA client transport.

pub mod queue;
pub mod registry;
pub mod sim;
pub mod transport;

#[cfg(feature = "opcua")]
pub mod opcua_transport;

pub use registry::PointRegistry;
pub use sim::SimPlc;
pub use transport::{
    Connection, DataChange, MonitoredItem, MonitoringParams, ProtocolSession, ReadResult,
    SubscriptionHandle, Transport,
};

#[cfg(feature = "opcua")]
pub use opcua_transport::OpcUaTransport;
