use thiserror::Error;

use crate::session::SessionState;
use crate::{ActorId, ViewId};

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("operation not allowed in state {0:?}")]
    InvalidState(SessionState),
    #[error("transport refused to connect to {0}")]
    ConnectFailed(String),
    #[error("transport failed: {0}")]
    Transport(String),
    #[error("not in a room")]
    NotInRoom,
    #[error("event code {0} is reserved")]
    ReservedEventCode(u8),
    #[error("only the master client may do this")]
    NotMasterClient,
    #[error("actor {0} is not in the room")]
    UnknownActor(ActorId),
    #[error("actor {0} is already the master client")]
    AlreadyMaster(ActorId),
    #[error("no free view id left for owner {0}")]
    ViewIdsExhausted(ActorId),
    #[error("view {0} is not registered")]
    UnknownView(ViewId),
    #[error("no network-instantiated object with id {0}")]
    UnknownObject(ViewId),
    #[error("prefab `{0}` could not be resolved")]
    UnknownPrefab(String),
    #[error("prefab `{prefab}` has {actual} views but {expected} view ids were sent")]
    ViewCountMismatch {
        prefab: String,
        expected: usize,
        actual: usize,
    },
    #[error("actor {actor} may not destroy object {instantiation_id}")]
    DestroyNotAllowed {
        actor: ActorId,
        instantiation_id: ViewId,
    },
    #[error("view {0} has not received a full snapshot yet")]
    SnapshotNotReady(ViewId),
    #[error("snapshot for view {view_id} has {actual} fields, expected {expected}")]
    SnapshotLengthMismatch {
        view_id: ViewId,
        expected: usize,
        actual: usize,
    },
    #[error("malformed event {code}: {reason}")]
    MalformedEvent { code: u8, reason: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;
