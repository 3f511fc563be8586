//! `gantry-cockpit` – client fan-out for the gantry controller
//!
//! Boots a lightweight HTTP + WebSocket server (default port `4000`) that:
//!
//! 1. **Pushes** a full sensor snapshot to every browser as soon as its
//!    WebSocket opens, then streams every point change to all connected
//!    clients as `sensorUpdate` frames.
//!
//! 2. **Accepts** upstream frames from the browser:
//!    - `control` with an action name → executes it through the
//!      [`ControlDispatcher`] and answers that client alone with a
//!      `controlResponse`.
//!    - `readAllSensors` → answers that client with a fresh `sensorData`
//!      snapshot (or `sensorDataError`).
//!
//! 3. **Serves** the same operations over plain JSON HTTP for scripts and
//!    health checks.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use gantry_cockpit::{CockpitServer, ControlPlane, FanoutHub};
//!
//! async fn serve(control: Arc<dyn ControlPlane>) {
//!     let hub = FanoutHub::new(control);
//!     CockpitServer::new(hub)
//!         .run()
//!         .await
//!         .expect("cockpit server failed");
//! }
//! ```
//!
//! [`ControlDispatcher`]: gantry_middleware::ControlDispatcher

pub mod hub;
pub mod server;

pub use hub::{
    CLIENT_BUFFER, ClientHandle, ClientId, ControlPlane, DEFAULT_ACTION_TIMEOUT, FanoutHub,
    action_timeout_for,
};
pub use server::{BoundCockpit, CockpitServer, DEFAULT_PORT};
