use crate::protocol::prop;
use crate::value::{merge_properties, Properties, Value};

/// Parameters of a room to be created.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomOptions {
    pub max_players: u8,
    pub is_visible: bool,
    pub is_open: bool,
    /// Remove a leaving actor's cached events and objects. Fixed for the room's lifetime.
    pub auto_cleanup: bool,
    pub properties: Properties,
}

impl Default for RoomOptions {
    fn default() -> Self {
        Self {
            max_players: 0,
            is_visible: true,
            is_open: true,
            auto_cleanup: true,
            properties: Properties::new(),
        }
    }
}

impl RoomOptions {
    pub fn max_players(mut self, max_players: u8) -> Self {
        self.max_players = max_players;
        self
    }
    pub fn visible(mut self, is_visible: bool) -> Self {
        self.is_visible = is_visible;
        self
    }
    pub fn open(mut self, is_open: bool) -> Self {
        self.is_open = is_open;
        self
    }
    pub fn auto_cleanup(mut self, auto_cleanup: bool) -> Self {
        self.auto_cleanup = auto_cleanup;
        self
    }
    pub fn property(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
    /// Game properties as sent with a create operation.
    pub fn wire_properties(&self) -> Properties {
        let mut props = self.properties.clone();
        props.insert(prop::MAX_PLAYERS.into(), Value::Byte(self.max_players));
        props.insert(prop::IS_VISIBLE.into(), Value::Bool(self.is_visible));
        props.insert(prop::IS_OPEN.into(), Value::Bool(self.is_open));
        props.insert(
            prop::CLEANUP_CACHE_ON_LEAVE.into(),
            Value::Bool(self.auto_cleanup),
        );
        props
    }
}

/// The room the client is currently in.
#[derive(Debug, Clone, PartialEq)]
pub struct Room {
    name: String,
    is_visible: bool,
    is_open: bool,
    max_players: u8,
    auto_cleanup: bool,
    properties: Properties,
}

impl Room {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            is_visible: true,
            is_open: true,
            max_players: 0,
            auto_cleanup: true,
            properties: Properties::new(),
        }
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn is_visible(&self) -> bool {
        self.is_visible
    }
    pub fn is_open(&self) -> bool {
        self.is_open
    }
    /// Zero means unlimited.
    pub fn max_players(&self) -> u8 {
        self.max_players
    }
    pub fn auto_cleanup(&self) -> bool {
        self.auto_cleanup
    }
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
    /// Applies a property update as received from the server. Well-known keys update the
    /// room attributes; the cleanup flag cannot change after creation.
    pub fn merge_properties(&mut self, update: &Properties) {
        let mut custom = update.clone();
        if let Some(v) = custom.remove(prop::MAX_PLAYERS).and_then(|v| v.as_byte()) {
            self.max_players = v;
        }
        if let Some(v) = custom.remove(prop::IS_VISIBLE).and_then(|v| v.as_bool()) {
            self.is_visible = v;
        }
        if let Some(v) = custom.remove(prop::IS_OPEN).and_then(|v| v.as_bool()) {
            self.is_open = v;
        }
        custom.remove(prop::PLAYER_COUNT);
        custom.remove(prop::CLEANUP_CACHE_ON_LEAVE);
        merge_properties(&mut self.properties, &custom);
    }
    /// Builds the room from the full property table of a join response.
    pub(crate) fn from_join(name: impl Into<String>, props: &Properties) -> Self {
        let mut room = Room::new(name);
        if let Some(v) = props.get(prop::CLEANUP_CACHE_ON_LEAVE).and_then(Value::as_bool) {
            room.auto_cleanup = v;
        }
        room.merge_properties(props);
        room
    }
}
