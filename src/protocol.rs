//! Wire-level constants and the message shapes exchanged with the peer transport.
//!
//! All codes are stable across the protocol; changing any of them breaks interoperability.

use crate::value::{Params, Value};
use crate::ActorId;

pub mod op {
    pub const AUTHENTICATE: u8 = 230;
    pub const JOIN_LOBBY: u8 = 229;
    pub const LEAVE_LOBBY: u8 = 228;
    pub const CREATE_GAME: u8 = 227;
    pub const JOIN_GAME: u8 = 226;
    pub const JOIN_RANDOM_GAME: u8 = 225;
    pub const CHANGE_GROUPS: u8 = 248;
    pub const SET_PROPERTIES: u8 = 252;
    pub const RAISE_EVENT: u8 = 253;
    pub const LEAVE: u8 = 254;
}

pub mod event {
    /// Cache directives that act on whole actors or the whole room.
    pub const CACHE_SLICE_ALL: u8 = 0;
    pub const RPC: u8 = 200;
    pub const SEND_SERIALIZE: u8 = 201;
    pub const INSTANTIATION: u8 = 202;
    pub const CLOSE_CONNECTION: u8 = 203;
    pub const DESTROY: u8 = 204;
    pub const SEND_SERIALIZE_RELIABLE: u8 = 206;
    pub const DESTROY_PLAYER: u8 = 207;
    pub const ASSIGN_MASTER: u8 = 208;
    pub const PROPERTIES_CHANGED: u8 = 253;
    pub const LEAVE: u8 = 254;
    pub const JOIN: u8 = 255;

    /// Events below this code belong to the application.
    pub const FIRST_RESERVED: u8 = 200;
}

pub mod param {
    pub const ADDRESS: u8 = 230;
    pub const USER_ID: u8 = 225;
    pub const APPLICATION_ID: u8 = 224;
    pub const SECRET: u8 = 221;
    pub const APP_VERSION: u8 = 220;
    pub const ADD: u8 = 238;
    pub const REMOVE: u8 = 239;
    pub const GROUP: u8 = 240;
    pub const CLEANUP_CACHE_ON_LEAVE: u8 = 241;
    pub const CODE: u8 = 244;
    pub const DATA: u8 = 245;
    pub const RECEIVER_GROUP: u8 = 246;
    pub const CACHE: u8 = 247;
    pub const GAME_PROPERTIES: u8 = 248;
    pub const PLAYER_PROPERTIES: u8 = 249;
    pub const BROADCAST: u8 = 250;
    pub const PROPERTIES: u8 = 251;
    pub const ACTOR_LIST: u8 = 252;
    pub const TARGET_ACTOR_NR: u8 = 253;
    pub const ACTOR_NR: u8 = 254;
    pub const ROOM_NAME: u8 = 255;
}

/// Well-known keys inside room and actor property tables.
pub mod prop {
    pub const MAX_PLAYERS: &str = "255";
    pub const IS_VISIBLE: &str = "254";
    pub const IS_OPEN: &str = "253";
    pub const PLAYER_COUNT: &str = "252";
    pub const CLEANUP_CACHE_ON_LEAVE: &str = "249";
    pub const PLAYER_NAME: &str = "255";
}

pub mod return_code {
    pub const OK: i16 = 0;
    pub const OPERATION_NOT_ALLOWED: i16 = -2;
    pub const INVALID_AUTHENTICATION: i16 = 32767;
    pub const GAME_ID_ALREADY_EXISTS: i16 = 32766;
    pub const GAME_FULL: i16 = 32765;
    pub const GAME_CLOSED: i16 = 32764;
    pub const NO_RANDOM_MATCH_FOUND: i16 = 32760;
    pub const GAME_DOES_NOT_EXIST: i16 = 32758;
    pub const MAX_CCU_REACHED: i16 = 32757;
    pub const INVALID_REGION: i16 = 32756;
    pub const CUSTOM_AUTHENTICATION_FAILED: i16 = 32755;
}

/// How the server's event cache treats a raised event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum CacheOp {
    #[default]
    DoNotCache = 0,
    AddToRoomCache = 4,
    /// Cached on behalf of the room: kept when the sender leaves.
    AddToRoomCacheGlobal = 5,
    RemoveFromRoomCache = 6,
}

impl CacheOp {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::DoNotCache),
            4 => Some(Self::AddToRoomCache),
            5 => Some(Self::AddToRoomCacheGlobal),
            6 => Some(Self::RemoveFromRoomCache),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ReceiverGroup {
    #[default]
    Others = 0,
    All = 1,
    MasterClient = 2,
}

impl ReceiverGroup {
    pub fn from_u8(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Others),
            1 => Some(Self::All),
            2 => Some(Self::MasterClient),
            _ => None,
        }
    }
}

/// Targeting and caching of a raised event.
///
/// `target_actors` takes precedence over `receivers` when set. For cache removals it acts as
/// a filter on the sender of the cached events instead.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RaiseEventOptions {
    pub cache: CacheOp,
    pub receivers: ReceiverGroup,
    pub target_actors: Option<Vec<ActorId>>,
    pub interest_group: u8,
}

impl RaiseEventOptions {
    pub fn others() -> Self {
        Self::default()
    }
    pub fn all() -> Self {
        Self {
            receivers: ReceiverGroup::All,
            ..Self::default()
        }
    }
    pub fn cached(mut self, cache: CacheOp) -> Self {
        self.cache = cache;
        self
    }
    pub fn group(mut self, interest_group: u8) -> Self {
        self.interest_group = interest_group;
        self
    }
    pub fn to(mut self, actors: Vec<ActorId>) -> Self {
        self.target_actors = Some(actors);
        self
    }
    pub fn receivers(mut self, receivers: ReceiverGroup) -> Self {
        self.receivers = receivers;
        self
    }
}

/// Connection status changes reported by the peer transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    Connect,
    Disconnect,
    ExceptionOnConnect,
    Exception,
    TimeoutDisconnect,
    DisconnectByServer,
    DisconnectByServerUserLimit,
    DisconnectByServerLogic,
}

/// Why a connection ended or could not be established.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectCause {
    ClientRequest,
    Disconnect,
    ExceptionOnConnect,
    Exception,
    Timeout,
    DisconnectByServer,
    DisconnectByServerUserLimit,
    DisconnectByServerLogic,
    InvalidAuthentication,
    MaxCcuReached,
    InvalidRegion,
    ClosedByMaster,
}

impl From<StatusCode> for DisconnectCause {
    fn from(code: StatusCode) -> Self {
        match code {
            StatusCode::Connect | StatusCode::Disconnect => DisconnectCause::Disconnect,
            StatusCode::ExceptionOnConnect => DisconnectCause::ExceptionOnConnect,
            StatusCode::Exception => DisconnectCause::Exception,
            StatusCode::TimeoutDisconnect => DisconnectCause::Timeout,
            StatusCode::DisconnectByServer => DisconnectCause::DisconnectByServer,
            StatusCode::DisconnectByServerUserLimit => DisconnectCause::DisconnectByServerUserLimit,
            StatusCode::DisconnectByServerLogic => DisconnectCause::DisconnectByServerLogic,
        }
    }
}

/// Correlated reply to an operation previously sent with `send_operation`.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationResponse {
    pub code: u8,
    pub return_code: i16,
    pub debug_message: Option<String>,
    pub params: Params,
}

impl OperationResponse {
    pub fn ok(code: u8, params: Params) -> Self {
        Self {
            code,
            return_code: return_code::OK,
            debug_message: None,
            params,
        }
    }
    pub fn failed(code: u8, return_code: i16, message: impl Into<String>) -> Self {
        Self {
            code,
            return_code,
            debug_message: Some(message.into()),
            params: Params::new(),
        }
    }
    pub fn is_ok(&self) -> bool {
        self.return_code == return_code::OK
    }
    pub fn get(&self, param: u8) -> Option<&Value> {
        self.params.get(&param)
    }
}

/// Event pushed by the server. `sender` is the originating actor, 0 for the server itself.
#[derive(Debug, Clone, PartialEq)]
pub struct EventData {
    pub code: u8,
    pub sender: ActorId,
    pub params: Params,
}

impl EventData {
    pub fn get(&self, param: u8) -> Option<&Value> {
        self.params.get(&param)
    }
    /// The application payload of the event.
    pub fn content(&self) -> Option<&Value> {
        self.params.get(&param::DATA)
    }
}
