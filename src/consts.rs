/// Number of view ids available per owner. View id = owner * `MAX_SUBIDS` + sub id.
pub const MAX_SUBIDS: i32 = 1000;

pub const DEFAULT_DIRECTORY_ADDRESS: &str = "127.0.0.1:5055";
pub const DEFAULT_APP_VERSION: &str = "1.0";

/// Outgoing queue flushes per second.
pub const DEFAULT_SEND_RATE: f64 = 20.0;
/// Serialization passes per second.
pub const DEFAULT_SERIALIZATION_RATE: f64 = 10.0;
/// Seconds between acks-only sends while the message queue is paused.
pub const DEFAULT_KEEP_ALIVE_INTERVAL_SEC: f64 = 0.1;

pub const DEFAULT_FLOAT_PRECISION: f32 = 0.01;
/// Squared distance below which two vectors are considered equal.
pub const DEFAULT_VECTOR_PRECISION: f32 = 0.000_099;
pub const DEFAULT_ANGLE_PRECISION_DEG: f32 = 1.0;

pub(crate) const INVALID_ACTOR_ID: i32 = -1;
pub(crate) const ROOM_OWNER_ID: i32 = 0;
