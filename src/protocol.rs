//! Wire protocol spoken by the rover controller
//!
//! The controller speaks a line-oriented text protocol: a handful of control
//! tokens plus telemetry lines of ten comma-separated integers. These values
//! mirror the firmware definitions to stay protocol compatible.

use serde::{Deserialize, Serialize};

/// Identification token sent after open so the controller can tell control
/// clients apart from telemetry producers.
pub const IDENT_TOKEN: &str = "MOBILE";

/// Prefix for outbound movement commands (`motor_ct:<command>`).
pub const MOTOR_COMMAND_PREFIX: &str = "motor_ct:";

/// Sent by the controller when its server side is up.
pub const READY_TOKEN: &str = "ESP32_READY";

/// Acknowledges our identification token.
pub const IDENTIFIED_TOKEN: &str = "MOBILE_IDENTIFIED";

/// Substring acknowledging a motor command.
pub const MOTOR_ACK_TOKEN: &str = "MOTOR_CMD_OK";

/// Optional prefix on inbound telemetry lines.
pub const SENSOR_PREFIX: &str = "sensor_data:";

/// Number of sensor fields in one telemetry frame.
pub const FRAME_FIELDS: usize = 10;

/// One decoded telemetry record: two ultrasonic rangers, two gas sensors,
/// and two three-axis IMUs, in the fixed wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryFrame {
    pub us1: i32,
    pub us2: i32,
    pub gas1: i32,
    pub gas2: i32,
    pub imu1x: i32,
    pub imu1y: i32,
    pub imu1z: i32,
    pub imu2x: i32,
    pub imu2y: i32,
    pub imu2z: i32,
}

impl TelemetryFrame {
    /// Decode one telemetry line.
    ///
    /// Strips the optional `sensor_data:` prefix, splits on commas, and
    /// parses each token as an integer. Tokens that fail to parse are
    /// skipped. Returns `None` unless at least ten values survive; extra
    /// values beyond the first ten are ignored.
    pub fn parse(line: &str) -> Option<Self> {
        let data = line.strip_prefix(SENSOR_PREFIX).unwrap_or(line);

        let values: Vec<i32> = data
            .split(',')
            .filter_map(|token| token.trim().parse().ok())
            .collect();

        if values.len() < FRAME_FIELDS {
            return None;
        }

        Some(Self {
            us1: values[0],
            us2: values[1],
            gas1: values[2],
            gas2: values[3],
            imu1x: values[4],
            imu1y: values[5],
            imu1z: values[6],
            imu2x: values[7],
            imu2y: values[8],
            imu2z: values[9],
        })
    }
}

/// Classification of one inbound line from the controller.
///
/// Control tokens are diagnostics only; only `Telemetry` reaches data
/// subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RobotMessage {
    /// `ESP32_READY` — the controller's server side is up
    Ready,
    /// `MOBILE_IDENTIFIED` — the controller acknowledged our identification
    Identified,
    /// Contains `MOTOR_CMD_OK` — a motor command was accepted
    MotorAck,
    /// A decodable telemetry line
    Telemetry(TelemetryFrame),
    /// Anything else; dropped
    Unrecognized,
}

impl RobotMessage {
    /// Classify a trimmed inbound line.
    pub fn classify(message: &str) -> Self {
        if message == READY_TOKEN {
            return Self::Ready;
        }
        if message == IDENTIFIED_TOKEN {
            return Self::Identified;
        }
        if message.contains(MOTOR_ACK_TOKEN) {
            return Self::MotorAck;
        }
        match TelemetryFrame::parse(message) {
            Some(frame) => Self::Telemetry(frame),
            None => Self::Unrecognized,
        }
    }
}
