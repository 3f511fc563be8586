//! `gantry-middleware` – the bridge core.
//!
//! Owns the single upstream session and turns it into two flows: point
//! changes going out to the fan-out hub, and actions coming in as batched
//! writes.
//!
//! # Modules
//!
//! - [`session`] – [`SessionManager`], connect/reconnect state machine with
//!   backoff and best-effort teardown.
//! - [`subscription`] – [`SubscriptionEngine`], monitored items for every
//!   sensor, forwarded over a channel.
//! - [`dispatcher`] – [`ControlDispatcher`], action write plans and sensor
//!   snapshots.

pub mod dispatcher;
pub mod session;
pub mod subscription;

pub use dispatcher::{ControlDispatcher, WriteAck};
pub use session::{SessionConfig, SessionManager};
pub use subscription::{Subscription, SubscriptionEngine};
