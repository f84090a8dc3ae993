//! Client-side session and replication engine for room-based multiplayer games.
//!
//! A [`Session`] authenticates with a directory server, is handed over to the session server
//! hosting its room, and from then on keeps the room's actors, master client, replicated objects,
//! RPCs and synchronized view state consistent with the other participants.
//!
//! The session is driven by the host calling [`Session::tick`] and talks to the servers through a
//! [`PeerTransport`]. [`loopback`] provides in-process servers for tests and demos.

mod consts;
mod error;

pub mod actor;
pub mod bytes;
pub mod loopback;
pub mod notification;
pub mod protocol;
pub mod registry;
pub mod room;
pub mod rpc;
pub mod session;
pub mod sync;
pub mod transport;
pub mod value;
pub mod view;

pub use crate::actor::{Actor, ActorDirectory, ActorId};
pub use crate::consts::{
    DEFAULT_ANGLE_PRECISION_DEG, DEFAULT_APP_VERSION, DEFAULT_DIRECTORY_ADDRESS,
    DEFAULT_FLOAT_PRECISION, DEFAULT_KEEP_ALIVE_INTERVAL_SEC, DEFAULT_SEND_RATE,
    DEFAULT_SERIALIZATION_RATE, DEFAULT_VECTOR_PRECISION, MAX_SUBIDS,
};
pub use crate::error::{Error, Result};
pub use crate::notification::{Diagnostic, JoinFailure, Notification, OperationFailure};
pub use crate::protocol::{CacheOp, DisconnectCause, RaiseEventOptions, ReceiverGroup, StatusCode};
pub use crate::registry::{InstantiatedObject, InstantiationRecord, PrefabPool};
pub use crate::room::{Room, RoomOptions};
pub use crate::rpc::{
    ArgKind, Continuation, RpcBehavior, RpcContext, RpcInfo, RpcShortcuts, RpcTarget, Signature,
};
pub use crate::session::{Session, SessionConfig, SessionState};
pub use crate::sync::SyncPrecision;
pub use crate::transport::{Delivery, PeerTransport};
pub use crate::value::{Properties, Quaternion, Value, Vector3};
pub use crate::view::{Observed, SyncMode, View, ViewComponents, ViewId};
