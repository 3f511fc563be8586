//! [`PointRegistry`] – fixed mapping between logical point names and
//! protocol node identifiers.
//!
//! The registry is keyed by the closed [`SensorId`] / [`ActuatorId`]
//! enumerations, so every point always has a node id once construction has
//! succeeded.  Construction is the only place a misconfiguration can surface;
//! after that the forward lookups are infallible.
//!
//! # Reverse lookups
//!
//! [`PointRegistry::reverse`] never fails.  A notification for a node id the
//! registry does not know is forwarded under the raw identifier so the
//! notification path keeps running.

use std::collections::{BTreeMap, HashMap};

use gantry_types::{ActuatorId, GantryError, NodeId, PointName, SensorId};

/// Immutable lookup table for the twelve gantry points.
#[derive(Debug, Clone)]
pub struct PointRegistry {
    sensors: [NodeId; 6],
    actuators: [NodeId; 6],
    by_node: HashMap<NodeId, PointName>,
}

impl PointRegistry {
    /// Registry using the PLC's default addressing: `ns=<namespace>;s="<name>"`
    /// for every point.
    pub fn new(namespace: u16) -> Self {
        let sensors = SensorId::ALL.map(|s| NodeId::string(namespace, s.as_str()));
        let actuators = ActuatorId::ALL.map(|a| NodeId::string(namespace, a.as_str()));
        let by_node = index(&sensors, &actuators);
        Self {
            sensors,
            actuators,
            by_node,
        }
    }

    /// Registry with per-point node id overrides on top of the default
    /// addressing.
    ///
    /// # Errors
    ///
    /// * [`GantryError::UnknownPoint`] when an override key is not one of
    ///   `I1..I6` / `O1..O6`.
    /// * [`GantryError::Config`] when two points end up on the same node id.
    pub fn from_config(
        namespace: u16,
        overrides: &BTreeMap<String, String>,
    ) -> Result<Self, GantryError> {
        let mut registry = Self::new(namespace);

        for (name, node) in overrides {
            match name.parse::<PointName>()? {
                PointName::Sensor(s) => registry.sensors[s as usize] = NodeId::new(node.clone()),
                PointName::Actuator(a) => {
                    registry.actuators[a as usize] = NodeId::new(node.clone())
                }
            }
        }

        registry.by_node = index(&registry.sensors, &registry.actuators);
        if registry.by_node.len() != SensorId::ALL.len() + ActuatorId::ALL.len() {
            let mut seen = HashMap::new();
            for point in PointName::all() {
                let node = registry.node(point);
                if let Some(previous) = seen.insert(node.clone(), point) {
                    return Err(GantryError::Config(format!(
                        "points {previous} and {point} share node id {node}"
                    )));
                }
            }
        }

        Ok(registry)
    }

    /// Resolve a logical point name (`"I1"`, `"O4"`, …) to its node id.
    pub fn resolve(&self, name: &str) -> Result<&NodeId, GantryError> {
        let point = name.parse::<PointName>()?;
        Ok(self.node(point))
    }

    /// Logical name for `node_id`, or the raw identifier when unmapped.
    pub fn reverse(&self, node_id: &NodeId) -> String {
        match self.lookup(node_id) {
            Some(point) => point.as_str().to_string(),
            None => node_id.as_str().to_string(),
        }
    }

    pub fn lookup(&self, node_id: &NodeId) -> Option<PointName> {
        self.by_node.get(node_id).copied()
    }

    pub fn node(&self, point: PointName) -> &NodeId {
        match point {
            PointName::Sensor(s) => self.sensor_node(s),
            PointName::Actuator(a) => self.actuator_node(a),
        }
    }

    pub fn sensor_node(&self, sensor: SensorId) -> &NodeId {
        &self.sensors[sensor as usize]
    }

    pub fn actuator_node(&self, actuator: ActuatorId) -> &NodeId {
        &self.actuators[actuator as usize]
    }

    /// Sensor points in snapshot order (`I1..I6`).
    pub fn sensors(&self) -> impl Iterator<Item = (SensorId, &NodeId)> {
        SensorId::ALL.into_iter().zip(self.sensors.iter())
    }

    /// Node ids of every sensor, in snapshot order.
    pub fn sensor_nodes(&self) -> Vec<NodeId> {
        self.sensors.to_vec()
    }
}

fn index(sensors: &[NodeId; 6], actuators: &[NodeId; 6]) -> HashMap<NodeId, PointName> {
    let mut by_node = HashMap::with_capacity(12);
    for (s, node) in SensorId::ALL.into_iter().zip(sensors) {
        by_node.insert(node.clone(), PointName::Sensor(s));
    }
    for (a, node) in ActuatorId::ALL.into_iter().zip(actuators) {
        by_node.insert(node.clone(), PointName::Actuator(a));
    }
    by_node
}
