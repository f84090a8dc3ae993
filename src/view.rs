use std::collections::HashSet;
use std::fmt;

use crate::consts::{MAX_SUBIDS, ROOM_OWNER_ID};
use crate::rpc::RpcBehavior;
use crate::value::Value;
use crate::ActorId;

pub type ViewId = i32;

/// Owner encoded in a view id. Room-owned views have owner 0.
pub fn owner_of(view_id: ViewId) -> ActorId {
    view_id / MAX_SUBIDS
}

pub fn sub_id_of(view_id: ViewId) -> i32 {
    view_id % MAX_SUBIDS
}

/// How a view's observed state is synchronized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncMode {
    #[default]
    Off,
    Unreliable,
    ReliableDeltaCompressed,
}

/// The host-side object whose state a view synchronizes.
pub trait Observed {
    /// Gathers the current serializable fields, in a stable order.
    fn write_fields(&mut self) -> Vec<Value>;
    /// Applies a full field vector received from the owner.
    fn read_fields(&mut self, fields: &[Value]);
}

/// What the host attaches to a view: its observed state and its RPC handlers.
#[derive(Default)]
pub struct ViewComponents {
    pub sync_mode: SyncMode,
    pub observed: Option<Box<dyn Observed>>,
    pub behaviors: Vec<RpcBehavior>,
}

impl ViewComponents {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn observe(mut self, sync_mode: SyncMode, observed: impl Observed + 'static) -> Self {
        self.sync_mode = sync_mode;
        self.observed = Some(Box::new(observed));
        self
    }
    pub fn behavior(mut self, behavior: RpcBehavior) -> Self {
        self.behaviors.push(behavior);
        self
    }
}

impl fmt::Debug for ViewComponents {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewComponents")
            .field("sync_mode", &self.sync_mode)
            .field("observed", &self.observed.is_some())
            .field("behaviors", &self.behaviors.len())
            .finish()
    }
}

/// A handle to one network-replicated object.
pub struct View {
    pub(crate) id: ViewId,
    pub(crate) owner_id: ActorId,
    pub(crate) group: u8,
    pub(crate) instantiation_id: ViewId,
    pub(crate) level_prefix: i16,
    pub(crate) active: bool,
    pub(crate) sync_mode: SyncMode,
    pub(crate) observed: Option<Box<dyn Observed>>,
    pub(crate) behaviors: Vec<RpcBehavior>,
    pub(crate) last_sent: Option<Vec<Value>>,
    pub(crate) last_received: Option<Vec<Value>>,
}

impl View {
    pub fn new(id: ViewId, components: ViewComponents) -> Self {
        Self {
            id,
            owner_id: owner_of(id),
            group: 0,
            instantiation_id: -1,
            level_prefix: 0,
            active: true,
            sync_mode: components.sync_mode,
            observed: components.observed,
            behaviors: components.behaviors,
            last_sent: None,
            last_received: None,
        }
    }
    pub fn with_group(mut self, group: u8) -> Self {
        self.group = group;
        self
    }
    pub fn with_level_prefix(mut self, prefix: i16) -> Self {
        self.level_prefix = prefix;
        self
    }
    pub(crate) fn with_instantiation_id(mut self, instantiation_id: ViewId) -> Self {
        self.instantiation_id = instantiation_id;
        self
    }
    pub fn id(&self) -> ViewId {
        self.id
    }
    pub fn owner_id(&self) -> ActorId {
        self.owner_id
    }
    pub fn is_room_owned(&self) -> bool {
        self.owner_id == ROOM_OWNER_ID
    }
    pub fn group(&self) -> u8 {
        self.group
    }
    pub fn instantiation_id(&self) -> ViewId {
        self.instantiation_id
    }
    pub fn is_instantiated(&self) -> bool {
        self.instantiation_id > 0
    }
    pub fn level_prefix(&self) -> i16 {
        self.level_prefix
    }
    pub fn sync_mode(&self) -> SyncMode {
        self.sync_mode
    }
    pub fn set_sync_mode(&mut self, mode: SyncMode) {
        if mode != self.sync_mode {
            self.last_sent = None;
        }
        self.sync_mode = mode;
    }
    pub fn is_active(&self) -> bool {
        self.active
    }
    /// Inactive views are skipped by the serialization pass.
    pub fn set_active(&mut self, active: bool) {
        self.active = active;
    }
    pub fn last_sent(&self) -> Option<&[Value]> {
        self.last_sent.as_deref()
    }
    pub fn last_received(&self) -> Option<&[Value]> {
        self.last_received.as_deref()
    }
    /// True if `actor` produces this view's snapshots: the owner, or the master for room-owned views.
    pub(crate) fn is_controlled_by(&self, actor: ActorId, master: Option<ActorId>) -> bool {
        if self.is_room_owned() {
            master == Some(actor)
        } else {
            self.owner_id == actor
        }
    }
}

impl fmt::Debug for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("View")
            .field("id", &self.id)
            .field("owner_id", &self.owner_id)
            .field("group", &self.group)
            .field("instantiation_id", &self.instantiation_id)
            .field("sync_mode", &self.sync_mode)
            .field("active", &self.active)
            .finish_non_exhaustive()
    }
}

/// Interest groups the local client sends to and receives from. Group 0 is always on.
#[derive(Debug, Default, Clone)]
pub struct InterestGroups {
    receiving: HashSet<u8>,
    blocked_sending: HashSet<u8>,
}

impl InterestGroups {
    pub fn is_receiving(&self, group: u8) -> bool {
        group == 0 || self.receiving.contains(&group)
    }
    pub fn is_sending(&self, group: u8) -> bool {
        group == 0 || !self.blocked_sending.contains(&group)
    }
    /// Returns true if the setting changed.
    pub fn set_receiving(&mut self, group: u8, enabled: bool) -> bool {
        if group == 0 {
            return false;
        }
        if enabled {
            self.receiving.insert(group)
        } else {
            self.receiving.remove(&group)
        }
    }
    pub fn set_sending(&mut self, group: u8, enabled: bool) -> bool {
        if group == 0 {
            return false;
        }
        if enabled {
            self.blocked_sending.remove(&group)
        } else {
            self.blocked_sending.insert(group)
        }
    }
    pub fn clear(&mut self) {
        self.receiving.clear();
        self.blocked_sending.clear();
    }
}
