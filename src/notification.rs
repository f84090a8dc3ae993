use crate::protocol::{return_code, DisconnectCause};
use crate::rpc::RpcDropReason;
use crate::value::{Properties, Value};
use crate::view::ViewId;
use crate::ActorId;

/// Why a create, join or random join was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinFailure {
    RoomFull,
    RoomClosed,
    RoomNotFound,
    RoomAlreadyExists,
    NoMatchFound,
    Other(i16),
}

impl From<i16> for JoinFailure {
    fn from(code: i16) -> Self {
        match code {
            return_code::GAME_FULL => JoinFailure::RoomFull,
            return_code::GAME_CLOSED => JoinFailure::RoomClosed,
            return_code::GAME_DOES_NOT_EXIST => JoinFailure::RoomNotFound,
            return_code::GAME_ID_ALREADY_EXISTS => JoinFailure::RoomAlreadyExists,
            return_code::NO_RANDOM_MATCH_FOUND => JoinFailure::NoMatchFound,
            other => JoinFailure::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationFailure {
    pub kind: JoinFailure,
    pub message: String,
}

/// Recoverable protocol and consistency problems. Logged and reported, never fatal.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    DuplicateActor(ActorId),
    ViewIdCollision(ViewId),
    ViewCountMismatch {
        prefab: String,
        expected: usize,
        actual: usize,
    },
    UnknownPrefab(String),
    UnresolvableMaster(ActorId),
    RpcDropped {
        view_id: ViewId,
        method: String,
        reason: RpcDropReason,
    },
    MalformedEvent {
        code: u8,
        reason: String,
    },
    /// Instantiation records were still pending when the room was cleaned up.
    PendingInstantiations(usize),
    SnapshotNotReady(ViewId),
    DestroyUnknownObject(ViewId),
}

/// Everything the session reports to the host, delivered through `on_notification`.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    ConnectedToDirectory,
    JoinedLobby,
    LeftLobby,
    CreatedRoom,
    JoinedRoom,
    LeftRoom,
    CreateRoomFailed(OperationFailure),
    JoinRoomFailed(OperationFailure),
    JoinRandomFailed(OperationFailure),
    CustomAuthenticationFailed(String),
    /// Refused by the server during authentication.
    ConnectionFailed(DisconnectCause),
    /// The transport failed while connecting.
    FailedToConnect(DisconnectCause),
    /// The transport failed after the connection was established.
    ConnectionLost(DisconnectCause),
    Disconnected,
    ActorJoined(ActorId),
    ActorLeft(ActorId),
    MasterClientSwitched(ActorId),
    ActorPropertiesChanged {
        actor: ActorId,
        changed: Properties,
    },
    RoomPropertiesChanged(Properties),
    ObjectInstantiated(ViewId),
    ObjectDestroyed(ViewId),
    CustomEvent {
        code: u8,
        sender: ActorId,
        content: Value,
    },
    Diagnostic(Diagnostic),
}

impl From<Diagnostic> for Notification {
    fn from(d: Diagnostic) -> Self {
        Notification::Diagnostic(d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn return_codes_map_to_failures() {
        assert_eq!(JoinFailure::from(return_code::GAME_FULL), JoinFailure::RoomFull);
        assert_eq!(JoinFailure::from(return_code::GAME_CLOSED), JoinFailure::RoomClosed);
        assert_eq!(
            JoinFailure::from(return_code::NO_RANDOM_MATCH_FOUND),
            JoinFailure::NoMatchFound
        );
        assert_eq!(JoinFailure::from(-7), JoinFailure::Other(-7));
    }
}
