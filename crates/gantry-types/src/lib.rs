use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Readable limit-switch inputs on the PLC.
///
/// Paired by axis: `I1`/`I2` horizontal, `I3`/`I4` vertical, `I5`/`I6` claw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SensorId {
    I1,
    I2,
    I3,
    I4,
    I5,
    I6,
}

impl SensorId {
    /// Every sensor, in snapshot order.
    pub const ALL: [SensorId; 6] = [
        SensorId::I1,
        SensorId::I2,
        SensorId::I3,
        SensorId::I4,
        SensorId::I5,
        SensorId::I6,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            SensorId::I1 => "I1",
            SensorId::I2 => "I2",
            SensorId::I3 => "I3",
            SensorId::I4 => "I4",
            SensorId::I5 => "I5",
            SensorId::I6 => "I6",
        }
    }

    /// The other sensor on the same axis.
    pub fn paired(self) -> SensorId {
        match self {
            SensorId::I1 => SensorId::I2,
            SensorId::I2 => SensorId::I1,
            SensorId::I3 => SensorId::I4,
            SensorId::I4 => SensorId::I3,
            SensorId::I5 => SensorId::I6,
            SensorId::I6 => SensorId::I5,
        }
    }
}

impl fmt::Display for SensorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Writable coil outputs on the PLC, paired the same way as [`SensorId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ActuatorId {
    O1,
    O2,
    O3,
    O4,
    O5,
    O6,
}

impl ActuatorId {
    pub const ALL: [ActuatorId; 6] = [
        ActuatorId::O1,
        ActuatorId::O2,
        ActuatorId::O3,
        ActuatorId::O4,
        ActuatorId::O5,
        ActuatorId::O6,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActuatorId::O1 => "O1",
            ActuatorId::O2 => "O2",
            ActuatorId::O3 => "O3",
            ActuatorId::O4 => "O4",
            ActuatorId::O5 => "O5",
            ActuatorId::O6 => "O6",
        }
    }

    /// The complementary actuator that must never be asserted together with
    /// this one.
    pub fn paired(self) -> ActuatorId {
        match self {
            ActuatorId::O1 => ActuatorId::O2,
            ActuatorId::O2 => ActuatorId::O1,
            ActuatorId::O3 => ActuatorId::O4,
            ActuatorId::O4 => ActuatorId::O3,
            ActuatorId::O5 => ActuatorId::O6,
            ActuatorId::O6 => ActuatorId::O5,
        }
    }
}

impl fmt::Display for ActuatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a point is read (sensor) or written (actuator).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Sensor,
    Actuator,
}

/// Any logical point name known to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointName {
    Sensor(SensorId),
    Actuator(ActuatorId),
}

impl PointName {
    pub fn as_str(self) -> &'static str {
        match self {
            PointName::Sensor(s) => s.as_str(),
            PointName::Actuator(a) => a.as_str(),
        }
    }

    pub fn direction(self) -> Direction {
        match self {
            PointName::Sensor(_) => Direction::Sensor,
            PointName::Actuator(_) => Direction::Actuator,
        }
    }

    /// All twelve points, sensors first.
    pub fn all() -> impl Iterator<Item = PointName> {
        SensorId::ALL
            .into_iter()
            .map(PointName::Sensor)
            .chain(ActuatorId::ALL.into_iter().map(PointName::Actuator))
    }
}

impl fmt::Display for PointName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PointName {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PointName::all()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| GantryError::UnknownPoint(s.to_string()))
    }
}

/// Protocol-level node identifier, e.g. `ns=3;s="I1"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Build the string-identifier form used by the PLC: `ns=<ns>;s="<name>"`.
    pub fn string(namespace: u16, identifier: &str) -> Self {
        Self(format!("ns={namespace};s=\"{identifier}\""))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Per-operation result code returned by the endpoint.
///
/// Follows the usual automation-protocol layout: the two top bits carry the
/// severity (`00` good, `01` uncertain, `10` bad).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0);
    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    pub const BAD_COMMUNICATION_ERROR: StatusCode = StatusCode(0x8005_0000);
    pub const BAD_TIMEOUT: StatusCode = StatusCode(0x800A_0000);
    pub const BAD_SESSION_CLOSED: StatusCode = StatusCode(0x8026_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_NOT_WRITABLE: StatusCode = StatusCode(0x803B_0000);
    pub const BAD_TYPE_MISMATCH: StatusCode = StatusCode(0x8074_0000);

    pub fn is_good(self) -> bool {
        self.0 & 0xC000_0000 == 0
    }

    pub fn is_bad(self) -> bool {
        self.0 & 0x8000_0000 != 0
    }

    fn name(self) -> Option<&'static str> {
        Some(match self {
            StatusCode::GOOD => "Good",
            StatusCode::BAD_UNEXPECTED_ERROR => "BadUnexpectedError",
            StatusCode::BAD_COMMUNICATION_ERROR => "BadCommunicationError",
            StatusCode::BAD_TIMEOUT => "BadTimeout",
            StatusCode::BAD_SESSION_CLOSED => "BadSessionClosed",
            StatusCode::BAD_NODE_ID_UNKNOWN => "BadNodeIdUnknown",
            StatusCode::BAD_NOT_WRITABLE => "BadNotWritable",
            StatusCode::BAD_TYPE_MISMATCH => "BadTypeMismatch",
            _ => return None,
        })
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{name} (0x{:08X})", self.0),
            None => write!(f, "0x{:08X}", self.0),
        }
    }
}

/// Physical commands a client may request.
///
/// Each action carries a fixed two-write plan: one actuator asserted and its
/// complementary actuator released in the same batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Action {
    MoveLeft,
    MoveRight,
    MoveUp,
    MoveDown,
    OpenClaw,
    CloseClaw,
}

impl Action {
    pub const ALL: [Action; 6] = [
        Action::MoveLeft,
        Action::MoveRight,
        Action::MoveUp,
        Action::MoveDown,
        Action::OpenClaw,
        Action::CloseClaw,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Action::MoveLeft => "move-left",
            Action::MoveRight => "move-right",
            Action::MoveUp => "move-up",
            Action::MoveDown => "move-down",
            Action::OpenClaw => "open-claw",
            Action::CloseClaw => "close-claw",
        }
    }

    /// The actuator this action asserts.
    pub fn asserted(self) -> ActuatorId {
        match self {
            Action::MoveRight => ActuatorId::O1,
            Action::MoveLeft => ActuatorId::O2,
            Action::MoveDown => ActuatorId::O3,
            Action::MoveUp => ActuatorId::O4,
            Action::OpenClaw => ActuatorId::O5,
            Action::CloseClaw => ActuatorId::O6,
        }
    }

    /// Ordered write plan: the asserted actuator first, its complement second.
    pub fn write_plan(self) -> [(ActuatorId, bool); 2] {
        let on = self.asserted();
        [(on, true), (on.paired(), false)]
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = GantryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Action::ALL
            .into_iter()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| GantryError::InvalidAction(s.to_string()))
    }
}

/// Lifecycle of the single upstream session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    /// A transport fault was observed; no reads or writes are accepted until
    /// the session has been rebuilt.
    Degraded,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Disconnected => "Disconnected",
            SessionState::Connecting => "Connecting",
            SessionState::Connected => "Connected",
            SessionState::Degraded => "Degraded",
        };
        f.write_str(s)
    }
}

/// One sensor value as seen by clients: `{sensor, value}`.
///
/// `sensor` is a plain string because notifications for node ids missing
/// from the registry are forwarded under the raw identifier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorReading {
    pub sensor: String,
    pub value: bool,
}

impl SensorReading {
    pub fn new(sensor: impl Into<String>, value: bool) -> Self {
        Self {
            sensor: sensor.into(),
            value,
        }
    }
}

/// Result of a control request, sent back to the requesting client only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlAck {
    pub success: bool,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlAck {
    pub fn ok(action: impl Into<String>) -> Self {
        Self {
            success: true,
            action: action.into(),
            error: None,
        }
    }

    pub fn failed(action: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            action: action.into(),
            error: Some(error.into()),
        }
    }
}

/// Frames pushed to realtime clients, encoded as `{"event": …, "data": …}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ServerMessage {
    /// Full sensor snapshot, sent on connect and on request.
    SensorData(Vec<SensorReading>),
    /// A single point changed upstream.
    SensorUpdate(SensorReading),
    /// A snapshot could not be read.
    SensorDataError { error: String },
    ControlResponse(ControlAck),
}

/// Frames accepted from realtime clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum ClientMessage {
    /// The action is kept as sent so an unknown name can be echoed back.
    Control { action: String },
    ReadAllSensors,
}

/// Error taxonomy for the bridge.
///
/// Lifecycle errors (`Connection`, `Session`, `Subscription`) are recovered
/// inside the session manager; clients only ever see `SessionUnavailable`,
/// `WriteRejected`, `InvalidAction` or `Timeout` on their own requests.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GantryError {
    #[error("Connection Error on {endpoint}: {details}")]
    Connection { endpoint: String, details: String },

    #[error("Session Error: {0}")]
    Session(String),

    #[error("Subscription Error: {0}")]
    Subscription(String),

    #[error("Unknown Point: {0}")]
    UnknownPoint(String),

    #[error("Write Rejected for {action} on {node_id}: {status}")]
    WriteRejected {
        action: Action,
        node_id: NodeId,
        status: StatusCode,
    },

    #[error("Read Rejected on {node_id}: {status}")]
    ReadRejected { node_id: NodeId, status: StatusCode },

    #[error("Session Unavailable")]
    SessionUnavailable,

    #[error("Transport Fault: {0}")]
    Transport(String),

    #[error("Timed Out: {0}")]
    Timeout(String),

    #[error("Invalid Action: {0}")]
    InvalidAction(String),

    #[error("Configuration Error: {0}")]
    Config(String),

    #[error("Serialization Error: {0}")]
    Serialization(String),
}

impl GantryError {
    /// Stable taxonomy name, used as the `error` string sent to clients.
    pub fn kind(&self) -> &'static str {
        match self {
            GantryError::Connection { .. } => "ConnectionError",
            GantryError::Session(_) => "SessionError",
            GantryError::Subscription(_) => "SubscriptionError",
            GantryError::UnknownPoint(_) => "UnknownPoint",
            GantryError::WriteRejected { .. } => "WriteRejected",
            GantryError::ReadRejected { .. } => "ReadRejected",
            GantryError::SessionUnavailable => "SessionUnavailable",
            GantryError::Transport(_) => "TransportError",
            GantryError::Timeout(_) => "Timeout",
            GantryError::InvalidAction(_) => "InvalidAction",
            GantryError::Config(_) => "ConfigError",
            GantryError::Serialization(_) => "SerializationError",
        }
    }

    /// `true` when the error means the link to the endpoint can no longer be
    /// trusted and the session must be rebuilt.
    pub fn is_link_fault(&self) -> bool {
        matches!(self, GantryError::Transport(_) | GantryError::Timeout(_))
    }
}
