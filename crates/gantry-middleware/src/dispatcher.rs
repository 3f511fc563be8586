//! [`ControlDispatcher`] – turns actions into batched actuator writes and
//! takes sensor snapshots.
//!
//! Every action writes its fixed two-entry plan in a single batch: the
//! asserted actuator first, its complementary actuator released second.  If
//! any entry comes back with a non-good status the whole action fails with
//! the first bad status.  Nothing is rolled back; the PLC program interlocks
//! the actuator pairs.

use gantry_hal::PointRegistry;
use gantry_types::{Action, GantryError, NodeId, SensorId, SensorReading, SessionState, StatusCode};
use tracing::{info, instrument, warn};

use crate::session::SessionManager;

/// Successful execution of an action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteAck {
    pub action: Action,
    /// The batch as written, in request order.
    pub writes: Vec<(NodeId, bool)>,
}

#[derive(Clone)]
pub struct ControlDispatcher {
    session: SessionManager,
    registry: PointRegistry,
}

impl ControlDispatcher {
    pub fn new(session: SessionManager, registry: PointRegistry) -> Self {
        Self { session, registry }
    }

    pub fn session_state(&self) -> SessionState {
        self.session.state()
    }

    /// The node-level batch `action` writes.
    pub fn plan(&self, action: Action) -> Vec<(NodeId, bool)> {
        action
            .write_plan()
            .iter()
            .map(|(actuator, value)| (self.registry.actuator_node(*actuator).clone(), *value))
            .collect()
    }

    /// Execute `action` as one batched write.
    ///
    /// # Errors
    ///
    /// * [`GantryError::SessionUnavailable`] when the session is not
    ///   connected; nothing is written.
    /// * [`GantryError::WriteRejected`] carrying the first non-good status.
    /// * [`GantryError::Timeout`] / [`GantryError::Transport`] when the
    ///   request itself failed.
    #[instrument(skip_all, fields(action = %action))]
    pub async fn execute(&self, action: Action) -> Result<WriteAck, GantryError> {
        let writes = self.plan(action);
        let statuses = self.session.write(&writes).await?;

        for (i, (node_id, _)) in writes.iter().enumerate() {
            let status = statuses
                .get(i)
                .copied()
                .unwrap_or(StatusCode::BAD_UNEXPECTED_ERROR);
            if !status.is_good() {
                warn!(node_id = %node_id, status = %status, "write rejected");
                return Err(GantryError::WriteRejected {
                    action,
                    node_id: node_id.clone(),
                    status,
                });
            }
        }

        info!("action executed");
        Ok(WriteAck { action, writes })
    }

    /// Fresh read of every sensor, in `I1..I6` order.
    ///
    /// Fails with [`GantryError::ReadRejected`] if any sensor cannot be read
    /// as a boolean.
    pub async fn read_sensors(&self) -> Result<Vec<SensorReading>, GantryError> {
        let nodes = self.registry.sensor_nodes();
        let results = self.session.read(&nodes).await?;

        SensorId::ALL
            .iter()
            .zip(nodes)
            .map(|(sensor, node_id)| {
                let result = results.iter().find(|r| r.node_id == node_id);
                match result {
                    Some(r) if r.status.is_good() => match r.value {
                        Some(value) => Ok(SensorReading::new(sensor.as_str(), value)),
                        None => Err(GantryError::ReadRejected {
                            node_id,
                            status: StatusCode::BAD_TYPE_MISMATCH,
                        }),
                    },
                    Some(r) => Err(GantryError::ReadRejected {
                        node_id,
                        status: r.status,
                    }),
                    None => Err(GantryError::ReadRejected {
                        node_id,
                        status: StatusCode::BAD_UNEXPECTED_ERROR,
                    }),
                }
            })
            .collect()
    }
}
