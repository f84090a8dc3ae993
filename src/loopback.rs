//! In-process directory and session servers.
//!
//! A [`LoopbackNetwork`] plays both servers for any number of [`LoopbackTransport`]s sharing it.
//! Deliveries are queued immediately and picked up on the client's next poll. Every operation,
//! response and event crosses the [`Bytes`](crate::bytes::Bytes) codec on its way.

use std::{
    cell::RefCell,
    collections::{BTreeMap, HashSet, VecDeque},
    rc::Rc,
};

use crate::{
    bytes,
    consts::DEFAULT_DIRECTORY_ADDRESS,
    error::{Error, Result},
    protocol::{
        event, op, param, prop, return_code, CacheOp, EventData, OperationResponse,
        RaiseEventOptions, ReceiverGroup, StatusCode,
    },
    transport::{Delivery, PeerTransport},
    value::{merge_properties, Params, Properties, Table, Value},
    ActorId,
};

pub const DIRECTORY_ADDRESS: &str = DEFAULT_DIRECTORY_ADDRESS;
pub const SESSION_ADDRESS: &str = "127.0.0.1:5056";

pub type PeerId = usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Directory,
    Session,
}

#[derive(Debug, Default)]
struct Peer {
    inbox: VecDeque<Delivery>,
    endpoint: Option<Endpoint>,
    authenticated: bool,
    room: Option<(String, ActorId)>,
}

#[derive(Debug)]
struct Member {
    peer: PeerId,
    properties: Properties,
    groups: HashSet<u8>,
}

#[derive(Debug, Clone)]
struct CachedEvent {
    code: u8,
    sender: ActorId,
    content: Value,
    global: bool,
}

#[derive(Debug, Default)]
struct LoopbackRoom {
    properties: Properties,
    next_actor: ActorId,
    members: BTreeMap<ActorId, Member>,
    cache: Vec<CachedEvent>,
    master: Option<ActorId>,
}

impl LoopbackRoom {
    fn new(properties: Properties) -> Self {
        Self {
            properties,
            next_actor: 1,
            ..Self::default()
        }
    }
    fn flag(&self, key: &str) -> bool {
        self.properties
            .get(key)
            .and_then(Value::as_bool)
            .unwrap_or(true)
    }
    fn is_full(&self) -> bool {
        let max = self
            .properties
            .get(prop::MAX_PLAYERS)
            .and_then(Value::as_byte)
            .unwrap_or(0);
        max > 0 && self.members.len() >= max as usize
    }
    fn join_failure(&self) -> Option<(i16, &'static str)> {
        if !self.flag(prop::IS_OPEN) {
            Some((return_code::GAME_CLOSED, "room is closed"))
        } else if self.is_full() {
            Some((return_code::GAME_FULL, "room is full"))
        } else {
            None
        }
    }
    fn wire_properties(&self) -> Properties {
        let mut props = self.properties.clone();
        props.insert(
            prop::PLAYER_COUNT.to_owned(),
            Value::Byte(self.members.len() as u8),
        );
        props
    }
    fn matches(&self, filter: &Properties) -> bool {
        self.flag(prop::IS_OPEN)
            && self.flag(prop::IS_VISIBLE)
            && !self.is_full()
            && filter
                .iter()
                .all(|(key, value)| self.properties.get(key) == Some(value))
    }
}

/// True if every entry of `filter` is present in `content`.
fn table_contains(content: &Value, filter: &Value) -> bool {
    match (content.as_table(), filter.as_table()) {
        (Some(content), Some(filter)) => filter.iter().all(|(k, v)| content.get(k) == Some(v)),
        (_, None) => filter.is_null(),
        (None, Some(_)) => false,
    }
}

fn wire(params: &Params) -> Result<Params> {
    let buf = bytes::to_vec(params)?;
    Ok(bytes::from_slice(&buf)?)
}

/// Both servers plus the peers connected to them.
#[derive(Debug)]
pub struct LoopbackNetwork {
    app_id: String,
    peers: Vec<Peer>,
    secrets: HashSet<String>,
    rooms: BTreeMap<String, LoopbackRoom>,
    room_counter: u32,
    auth_failure: Option<(i16, String)>,
    time_ms: i32,
}

impl LoopbackNetwork {
    pub fn new(app_id: impl Into<String>) -> Self {
        Self {
            app_id: app_id.into(),
            peers: Vec::new(),
            secrets: HashSet::new(),
            rooms: BTreeMap::new(),
            room_counter: 0,
            auth_failure: None,
            time_ms: 0,
        }
    }
    pub fn shared(app_id: impl Into<String>) -> Rc<RefCell<Self>> {
        Rc::new(RefCell::new(Self::new(app_id)))
    }
    /// Makes every following directory authentication fail with `code`.
    pub fn fail_authentication(&mut self, code: i16, message: impl Into<String>) {
        self.auth_failure = Some((code, message.into()));
    }
    pub fn advance_time(&mut self, ms: i32) {
        self.time_ms = self.time_ms.wrapping_add(ms);
    }
    pub fn room_names(&self) -> Vec<String> {
        self.rooms.keys().cloned().collect()
    }
    pub fn cached_event_count(&self, room: &str) -> usize {
        self.rooms.get(room).map_or(0, |r| r.cache.len())
    }
    /// Cuts `peer` off as a transport fault would: it leaves its room and receives `status`.
    pub fn drop_peer(&mut self, peer: PeerId, status: StatusCode) {
        log::debug!("dropping peer {peer} with {status:?}");
        self.leave_room(peer);
        if let Some(p) = self.peers.get_mut(peer) {
            p.endpoint = None;
            p.authenticated = false;
            p.inbox.push_back(Delivery::StatusChanged(status));
        }
    }

    fn add_peer(&mut self) -> PeerId {
        self.peers.push(Peer::default());
        self.peers.len() - 1
    }
    fn push(&mut self, peer: PeerId, delivery: Delivery) {
        if let Some(p) = self.peers.get_mut(peer) {
            p.inbox.push_back(delivery);
        }
    }
    fn respond(&mut self, peer: PeerId, resp: OperationResponse) -> Result<()> {
        let resp = OperationResponse {
            params: wire(&resp.params)?,
            ..resp
        };
        self.push(peer, Delivery::OperationResponse(resp));
        Ok(())
    }
    fn send_event(&mut self, peer: PeerId, code: u8, sender: ActorId, params: Params) -> Result<()> {
        let params = wire(&params)?;
        self.push(
            peer,
            Delivery::Event(EventData {
                code,
                sender,
                params,
            }),
        );
        Ok(())
    }

    fn connect(&mut self, peer: PeerId, address: &str) -> bool {
        let Some(p) = self.peers.get_mut(peer) else {
            return false;
        };
        let endpoint = match address {
            DIRECTORY_ADDRESS => Endpoint::Directory,
            SESSION_ADDRESS => Endpoint::Session,
            _ => {
                p.inbox
                    .push_back(Delivery::StatusChanged(StatusCode::ExceptionOnConnect));
                return true;
            }
        };
        p.endpoint = Some(endpoint);
        p.authenticated = false;
        p.inbox.push_back(Delivery::StatusChanged(StatusCode::Connect));
        true
    }
    fn disconnect(&mut self, peer: PeerId) {
        self.leave_room(peer);
        if let Some(p) = self.peers.get_mut(peer) {
            p.endpoint = None;
            p.authenticated = false;
            p.inbox.push_back(Delivery::StatusChanged(StatusCode::Disconnect));
        }
    }

    fn receive(&mut self, peer: PeerId, code: u8, buf: &[u8]) -> Result<()> {
        let params: Params = bytes::from_slice(buf)?;
        let Some(p) = self.peers.get(peer) else {
            return Err(Error::Transport(format!("unknown peer {peer}")));
        };
        let Some(endpoint) = p.endpoint else {
            return Err(Error::Transport("not connected".into()));
        };
        if !p.authenticated && code != op::AUTHENTICATE {
            return self.respond(
                peer,
                OperationResponse::failed(code, return_code::OPERATION_NOT_ALLOWED, "not authenticated"),
            );
        }
        match endpoint {
            Endpoint::Directory => self.on_directory_operation(peer, code, params),
            Endpoint::Session => self.on_session_operation(peer, code, params),
        }
    }

    fn on_directory_operation(&mut self, peer: PeerId, code: u8, params: Params) -> Result<()> {
        let room_name = params.get(&param::ROOM_NAME).and_then(Value::as_str);
        let resp = match code {
            op::AUTHENTICATE => {
                let app_id = params.get(&param::APPLICATION_ID).and_then(Value::as_str);
                if let Some((code, message)) = self.auth_failure.clone() {
                    OperationResponse::failed(op::AUTHENTICATE, code, message)
                } else if app_id != Some(self.app_id.as_str()) {
                    OperationResponse::failed(
                        op::AUTHENTICATE,
                        return_code::INVALID_AUTHENTICATION,
                        "unknown application id",
                    )
                } else {
                    let secret = format!("secret-{peer}-{}", self.secrets.len());
                    self.secrets.insert(secret.clone());
                    self.peers[peer].authenticated = true;
                    let mut out = Params::new();
                    out.insert(param::SECRET, Value::String(secret));
                    OperationResponse::ok(op::AUTHENTICATE, out)
                }
            }
            op::JOIN_LOBBY | op::LEAVE_LOBBY => OperationResponse::ok(code, Params::new()),
            op::CREATE_GAME => {
                let name = match room_name {
                    Some(name) => name.to_owned(),
                    None => {
                        self.room_counter += 1;
                        format!("room-{}", self.room_counter)
                    }
                };
                if self.rooms.contains_key(&name) {
                    OperationResponse::failed(code, return_code::GAME_ID_ALREADY_EXISTS, "room exists")
                } else {
                    Self::redirect(code, &name)
                }
            }
            op::JOIN_GAME => match room_name.map(|name| (name, self.rooms.get(name))) {
                Some((name, Some(room))) => match room.join_failure() {
                    Some((rc, message)) => OperationResponse::failed(code, rc, message),
                    None => Self::redirect(code, name),
                },
                _ => OperationResponse::failed(code, return_code::GAME_DOES_NOT_EXIST, "no such room"),
            },
            op::JOIN_RANDOM_GAME => {
                let filter = params
                    .get(&param::GAME_PROPERTIES)
                    .and_then(Value::as_dict)
                    .cloned()
                    .unwrap_or_default();
                match self.rooms.iter().find(|(_, room)| room.matches(&filter)) {
                    Some((name, _)) => Self::redirect(code, name),
                    None => OperationResponse::failed(
                        code,
                        return_code::NO_RANDOM_MATCH_FOUND,
                        "no open room matches",
                    ),
                }
            }
            _ => OperationResponse::failed(code, return_code::OPERATION_NOT_ALLOWED, "not on the directory"),
        };
        self.respond(peer, resp)
    }

    fn redirect(code: u8, name: &str) -> OperationResponse {
        let mut out = Params::new();
        out.insert(param::ADDRESS, Value::from(SESSION_ADDRESS));
        out.insert(param::ROOM_NAME, Value::from(name));
        OperationResponse::ok(code, out)
    }

    fn on_session_operation(&mut self, peer: PeerId, code: u8, params: Params) -> Result<()> {
        match code {
            op::AUTHENTICATE => {
                let secret = params.get(&param::SECRET).and_then(Value::as_str);
                let resp = if secret.map_or(false, |s| self.secrets.contains(s)) {
                    self.peers[peer].authenticated = true;
                    OperationResponse::ok(code, Params::new())
                } else {
                    OperationResponse::failed(code, return_code::INVALID_AUTHENTICATION, "bad secret")
                };
                self.respond(peer, resp)
            }
            op::CREATE_GAME | op::JOIN_GAME => self.on_join(peer, code, params),
            op::LEAVE => {
                self.leave_room(peer);
                self.respond(peer, OperationResponse::ok(code, Params::new()))
            }
            op::RAISE_EVENT => self.on_raise_event(peer, params),
            op::SET_PROPERTIES => self.on_set_properties(peer, params),
            op::CHANGE_GROUPS => {
                if let Some((name, actor)) = self.peers[peer].room.clone() {
                    let member = self
                        .rooms
                        .get_mut(&name)
                        .and_then(|room| room.members.get_mut(&actor));
                    if let Some(member) = member {
                        let groups = |key: u8| {
                            params
                                .get(&key)
                                .and_then(Value::as_array)
                                .unwrap_or_default()
                                .iter()
                                .filter_map(Value::as_byte)
                                .collect::<Vec<_>>()
                        };
                        for group in groups(param::REMOVE) {
                            member.groups.remove(&group);
                        }
                        member.groups.extend(groups(param::ADD));
                    }
                }
                self.respond(peer, OperationResponse::ok(code, Params::new()))
            }
            _ => self.respond(
                peer,
                OperationResponse::failed(code, return_code::OPERATION_NOT_ALLOWED, "not on the session server"),
            ),
        }
    }

    fn on_join(&mut self, peer: PeerId, code: u8, params: Params) -> Result<()> {
        let Some(name) = params.get(&param::ROOM_NAME).and_then(Value::as_str).map(str::to_owned) else {
            return self.respond(
                peer,
                OperationResponse::failed(code, return_code::GAME_DOES_NOT_EXIST, "no room name"),
            );
        };
        if code == op::CREATE_GAME {
            if self.rooms.contains_key(&name) {
                return self.respond(
                    peer,
                    OperationResponse::failed(code, return_code::GAME_ID_ALREADY_EXISTS, "room exists"),
                );
            }
            let mut props = params
                .get(&param::GAME_PROPERTIES)
                .and_then(Value::as_dict)
                .cloned()
                .unwrap_or_default();
            if let Some(cleanup) = params.get(&param::CLEANUP_CACHE_ON_LEAVE).and_then(Value::as_bool) {
                props.insert(prop::CLEANUP_CACHE_ON_LEAVE.to_owned(), Value::Bool(cleanup));
            }
            log::debug!("loopback session server created room {name}");
            self.rooms.insert(name.clone(), LoopbackRoom::new(props));
        }
        let Some(room) = self.rooms.get_mut(&name) else {
            return self.respond(
                peer,
                OperationResponse::failed(code, return_code::GAME_DOES_NOT_EXIST, "no such room"),
            );
        };
        if let Some((rc, message)) = room.join_failure() {
            return self.respond(peer, OperationResponse::failed(code, rc, message));
        }
        // actor numbers key the player property table
        if i16::try_from(room.next_actor).is_err() {
            return self.respond(
                peer,
                OperationResponse::failed(code, return_code::OPERATION_NOT_ALLOWED, "actor numbers exhausted"),
            );
        }

        let actor = room.next_actor;
        room.next_actor += 1;
        let properties = params
            .get(&param::PLAYER_PROPERTIES)
            .and_then(Value::as_dict)
            .cloned()
            .unwrap_or_default();
        room.members.insert(
            actor,
            Member {
                peer,
                properties: properties.clone(),
                groups: HashSet::new(),
            },
        );
        room.master = room.members.keys().next().copied();

        let actor_ids: Vec<i32> = room.members.keys().copied().collect();
        let player_props: Table = room
            .members
            .iter()
            .filter_map(|(&id, member)| {
                let key = i16::try_from(id).ok()?;
                Some((key, Value::Dict(member.properties.clone())))
            })
            .collect();
        let mut out = Params::new();
        out.insert(param::ACTOR_NR, Value::Int(actor));
        out.insert(param::ROOM_NAME, Value::from(name.as_str()));
        out.insert(param::GAME_PROPERTIES, Value::Dict(room.wire_properties()));
        out.insert(param::ACTOR_LIST, Value::IntArray(actor_ids.clone()));
        out.insert(param::PLAYER_PROPERTIES, Value::Table(player_props));

        let others: Vec<PeerId> = room
            .members
            .iter()
            .filter(|&(&id, _)| id != actor)
            .map(|(_, m)| m.peer)
            .collect();
        let cache = room.cache.clone();
        self.peers[peer].room = Some((name, actor));
        self.respond(peer, OperationResponse::ok(code, out))?;

        for other in others {
            let mut ev = Params::new();
            ev.insert(param::ACTOR_NR, Value::Int(actor));
            ev.insert(param::PLAYER_PROPERTIES, Value::Dict(properties.clone()));
            ev.insert(param::ACTOR_LIST, Value::IntArray(actor_ids.clone()));
            self.send_event(other, event::JOIN, actor, ev)?;
        }
        for cached in cache {
            let params = Self::event_params(cached.sender, &cached.content);
            self.send_event(peer, cached.code, cached.sender, params)?;
        }
        Ok(())
    }

    fn event_params(sender: ActorId, content: &Value) -> Params {
        let mut params = Params::new();
        params.insert(param::ACTOR_NR, Value::Int(sender));
        if !content.is_null() {
            params.insert(param::DATA, content.clone());
        }
        params
    }

    fn leave_room(&mut self, peer: PeerId) {
        let Some((name, actor)) = self.peers.get_mut(peer).and_then(|p| p.room.take()) else {
            return;
        };
        let Some(room) = self.rooms.get_mut(&name) else {
            return;
        };
        room.members.remove(&actor);
        if room.flag(prop::CLEANUP_CACHE_ON_LEAVE) {
            room.cache.retain(|e| e.global || e.sender != actor);
        }
        if room.master == Some(actor) {
            room.master = room.members.keys().next().copied();
        }
        log::debug!("actor {actor} left loopback room {name}");
        if room.members.is_empty() {
            self.rooms.remove(&name);
            return;
        }
        let others: Vec<PeerId> = room.members.values().map(|m| m.peer).collect();
        for other in others {
            let mut ev = Params::new();
            ev.insert(param::ACTOR_NR, Value::Int(actor));
            if let Err(e) = self.send_event(other, event::LEAVE, actor, ev) {
                log::error!("failed to deliver leave event: {e}");
            }
        }
    }

    fn on_raise_event(&mut self, peer: PeerId, params: Params) -> Result<()> {
        let Some((name, sender)) = self.peers[peer].room.clone() else {
            return self.respond(
                peer,
                OperationResponse::failed(op::RAISE_EVENT, return_code::OPERATION_NOT_ALLOWED, "not in a room"),
            );
        };
        let Some(room) = self.rooms.get_mut(&name) else {
            return Ok(());
        };
        let code = params.get(&param::CODE).and_then(Value::as_byte).unwrap_or(0);
        let content = params.get(&param::DATA).cloned().unwrap_or_default();
        let options = RaiseEventOptions {
            cache: params
                .get(&param::CACHE)
                .and_then(Value::as_byte)
                .and_then(CacheOp::from_u8)
                .unwrap_or_default(),
            receivers: params
                .get(&param::RECEIVER_GROUP)
                .and_then(Value::as_byte)
                .and_then(ReceiverGroup::from_u8)
                .unwrap_or_default(),
            target_actors: params
                .get(&param::ACTOR_LIST)
                .and_then(Value::as_int_array)
                .map(<[i32]>::to_vec),
            interest_group: params.get(&param::GROUP).and_then(Value::as_byte).unwrap_or(0),
        };

        if code == event::ASSIGN_MASTER {
            let new_master = content
                .as_table()
                .and_then(|t| t.get(&1))
                .and_then(Value::as_int)
                .filter(|id| room.members.contains_key(id));
            if let Some(id) = new_master {
                room.master = Some(id);
            }
        }

        match options.cache {
            CacheOp::RemoveFromRoomCache => {
                let targets = options.target_actors.as_deref();
                let from_target = |e: &CachedEvent| targets.map_or(true, |t| t.contains(&e.sender));
                let before = room.cache.len();
                if code == event::CACHE_SLICE_ALL {
                    // room-global events only go with a full wipe
                    room.cache
                        .retain(|e| !from_target(e) || (e.global && targets.is_some()));
                } else {
                    room.cache.retain(|e| {
                        !(e.code == code && from_target(e) && table_contains(&e.content, &content))
                    });
                }
                log::trace!("removed {} cached events", before - room.cache.len());
                return Ok(());
            }
            CacheOp::AddToRoomCache | CacheOp::AddToRoomCacheGlobal => room.cache.push(CachedEvent {
                code,
                sender,
                content: content.clone(),
                global: options.cache == CacheOp::AddToRoomCacheGlobal,
            }),
            CacheOp::DoNotCache => {}
        }

        let recipients: Vec<PeerId> = room
            .members
            .iter()
            .filter(|&(&id, _)| match &options.target_actors {
                Some(targets) => targets.contains(&id),
                None => match options.receivers {
                    ReceiverGroup::Others => id != sender,
                    ReceiverGroup::All => true,
                    ReceiverGroup::MasterClient => room.master == Some(id),
                },
            })
            .filter(|(_, m)| options.interest_group == 0 || m.groups.contains(&options.interest_group))
            .map(|(_, m)| m.peer)
            .collect();
        let params = Self::event_params(sender, &content);
        for recipient in recipients {
            self.send_event(recipient, code, sender, params.clone())?;
        }
        Ok(())
    }

    fn on_set_properties(&mut self, peer: PeerId, params: Params) -> Result<()> {
        let Some((name, sender)) = self.peers[peer].room.clone() else {
            return self.respond(
                peer,
                OperationResponse::failed(op::SET_PROPERTIES, return_code::OPERATION_NOT_ALLOWED, "not in a room"),
            );
        };
        let Some(room) = self.rooms.get_mut(&name) else {
            return Ok(());
        };
        let update = params
            .get(&param::PROPERTIES)
            .and_then(Value::as_dict)
            .cloned()
            .unwrap_or_default();
        let target = params.get(&param::ACTOR_NR).and_then(Value::as_int).unwrap_or(0);
        if target > 0 {
            let Some(member) = room.members.get_mut(&target) else {
                return self.respond(
                    peer,
                    OperationResponse::failed(op::SET_PROPERTIES, return_code::OPERATION_NOT_ALLOWED, "unknown actor"),
                );
            };
            merge_properties(&mut member.properties, &update);
        } else {
            merge_properties(&mut room.properties, &update);
        }
        let broadcast = params.get(&param::BROADCAST).and_then(Value::as_bool).unwrap_or(false);
        let others: Vec<PeerId> = if broadcast {
            room.members
                .iter()
                .filter(|&(&id, _)| id != sender)
                .map(|(_, m)| m.peer)
                .collect()
        } else {
            Vec::new()
        };
        self.respond(peer, OperationResponse::ok(op::SET_PROPERTIES, Params::new()))?;
        for other in others {
            let mut ev = Params::new();
            ev.insert(param::PROPERTIES, Value::Dict(update.clone()));
            ev.insert(param::TARGET_ACTOR_NR, Value::Int(target));
            ev.insert(param::ACTOR_NR, Value::Int(sender));
            self.send_event(other, event::PROPERTIES_CHANGED, sender, ev)?;
        }
        Ok(())
    }
}

/// A [`PeerTransport`] attached to a shared [`LoopbackNetwork`].
pub struct LoopbackTransport {
    network: Rc<RefCell<LoopbackNetwork>>,
    peer: PeerId,
}

impl LoopbackTransport {
    pub fn new(network: &Rc<RefCell<LoopbackNetwork>>) -> Self {
        let peer = network.borrow_mut().add_peer();
        Self {
            network: Rc::clone(network),
            peer,
        }
    }
    pub fn peer(&self) -> PeerId {
        self.peer
    }
}

impl PeerTransport for LoopbackTransport {
    type IntoError = Error;

    fn connect(&mut self, address: &str, _app_id: &str) -> bool {
        self.network.borrow_mut().connect(self.peer, address)
    }
    fn disconnect(&mut self) {
        self.network.borrow_mut().disconnect(self.peer)
    }
    fn send_operation(&mut self, code: u8, params: Params, _reliable: bool) -> Result<()> {
        let buf = bytes::to_vec(&params)?;
        self.network.borrow_mut().receive(self.peer, code, &buf)
    }
    fn raise_event(
        &mut self,
        code: u8,
        content: Value,
        reliable: bool,
        options: &RaiseEventOptions,
    ) -> Result<()> {
        let mut params = Params::new();
        params.insert(param::CODE, Value::Byte(code));
        if !content.is_null() {
            params.insert(param::DATA, content);
        }
        if options.cache != CacheOp::DoNotCache {
            params.insert(param::CACHE, Value::Byte(options.cache as u8));
        }
        if options.receivers != ReceiverGroup::Others {
            params.insert(param::RECEIVER_GROUP, Value::Byte(options.receivers as u8));
        }
        if let Some(targets) = &options.target_actors {
            params.insert(param::ACTOR_LIST, Value::IntArray(targets.clone()));
        }
        if options.interest_group != 0 {
            params.insert(param::GROUP, Value::Byte(options.interest_group));
        }
        self.send_operation(op::RAISE_EVENT, params, reliable)
    }
    fn poll(&mut self) -> Option<Delivery> {
        self.network
            .borrow_mut()
            .peers
            .get_mut(self.peer)?
            .inbox
            .pop_front()
    }
    fn server_time(&self) -> i32 {
        self.network.borrow().time_ms
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use crate::{
        consts::ROOM_OWNER_ID,
        notification::{Diagnostic, JoinFailure, Notification, OperationFailure},
        protocol::DisconnectCause,
        registry::{InstantiationRecord, PrefabPool},
        room::RoomOptions,
        rpc::{ArgKind, RpcBehavior, RpcDropReason, RpcTarget, Signature},
        session::{Session, SessionConfig, SessionState},
        value::{Quaternion, Vector3},
        view::{Observed, SyncMode, ViewComponents, ViewId},
    };

    use super::*;

    const APP_ID: &str = "loopback-test";
    const DELTA: f64 = 0.1;

    type TestSession = Session<LoopbackTransport, Vec<Notification>>;
    type Fields = Rc<RefCell<Vec<Value>>>;
    type HitLog = Rc<RefCell<Vec<(ActorId, i32)>>>;

    fn enable_logging() {
        // Uncomment this to enable logging

        // static LOGGER_CELL: std::sync::OnceLock<()> = std::sync::OnceLock::new();
        // LOGGER_CELL.get_or_init(|| {
        //     env_logger::Builder::new()
        //         .filter(None, log::LevelFilter::Debug)
        //         .init();
        // });
    }

    struct SharedFields(Fields);

    impl Observed for SharedFields {
        fn write_fields(&mut self) -> Vec<Value> {
            self.0.borrow().clone()
        }
        fn read_fields(&mut self, fields: &[Value]) {
            *self.0.borrow_mut() = fields.to_vec();
        }
    }

    /// Builds "cube" (one synchronized view with a `hit(int)` handler) and "pair" (two views,
    /// or one with `short_pair`).
    #[derive(Default, Clone)]
    struct TestPool {
        fields: Rc<RefCell<HashMap<ViewId, Fields>>>,
        hits: HitLog,
        destroyed: Rc<RefCell<Vec<ViewId>>>,
        short_pair: bool,
    }

    impl TestPool {
        fn fields(&self, view_id: ViewId) -> Fields {
            Rc::clone(&self.fields.borrow()[&view_id])
        }
        fn hits(&self) -> Vec<(ActorId, i32)> {
            self.hits.borrow().clone()
        }
    }

    impl PrefabPool for TestPool {
        fn view_count(&self, prefab: &str) -> Option<usize> {
            match prefab {
                "cube" => Some(1),
                "pair" => Some(if self.short_pair { 1 } else { 2 }),
                _ => None,
            }
        }
        fn instantiate(&mut self, record: &InstantiationRecord) -> Vec<ViewComponents> {
            record
                .view_ids
                .iter()
                .map(|&id| {
                    let fields = Fields::default();
                    self.fields.borrow_mut().insert(id, Rc::clone(&fields));
                    let hits = Rc::clone(&self.hits);
                    let behavior = RpcBehavior::new("Target").method(
                        "hit",
                        Signature::ExactWithInfo(vec![ArgKind::Int]),
                        move |ctx| {
                            let damage = ctx.args[0].as_int().unwrap();
                            hits.borrow_mut().push((ctx.info.sender, damage));
                            None
                        },
                    );
                    ViewComponents::new()
                        .observe(SyncMode::ReliableDeltaCompressed, SharedFields(fields))
                        .behavior(behavior)
                })
                .collect()
        }
        fn destroy(&mut self, instantiation_id: ViewId, _view_ids: &[ViewId]) {
            self.destroyed.borrow_mut().push(instantiation_id);
        }
    }

    fn new_session(network: &Rc<RefCell<LoopbackNetwork>>, name: &str, pool: TestPool) -> TestSession {
        let cfg = SessionConfig::with_context(Vec::new())
            .app_id(APP_ID)
            .player_name(name)
            .prefab_pool(pool)
            .on_notification(|n, log: &mut Vec<Notification>| log.push(n.clone()));
        Session::with_config(LoopbackTransport::new(network), cfg)
    }

    fn pump_until<F>(sessions: &mut [&mut TestSession], time: &mut f64, mut done: F)
    where
        F: FnMut(&[&mut TestSession]) -> bool,
    {
        for _ in 0..500 {
            for session in sessions.iter_mut() {
                session.tick(*time);
            }
            *time += DELTA;
            if done(sessions) {
                return;
            }
        }
        panic!("sessions never reached the expected condition");
    }

    fn pump(sessions: &mut [&mut TestSession], time: &mut f64, ticks: usize) {
        let mut n = 0;
        pump_until(sessions, time, |_| {
            n += 1;
            n >= ticks
        });
    }

    fn authenticate(session: &mut TestSession, time: &mut f64) {
        session.connect().unwrap();
        pump_until(&mut [session], time, |s| {
            s[0].state() == SessionState::ConnectedToDirectoryAuthenticated
        });
    }

    fn create(network: &Rc<RefCell<LoopbackNetwork>>, name: &str, room: &str, options: RoomOptions, time: &mut f64) -> (TestSession, TestPool) {
        let pool = TestPool::default();
        let mut session = new_session(network, name, pool.clone());
        authenticate(&mut session, time);
        session.create_room(Some(room), options).unwrap();
        pump_until(&mut [&mut session], time, |s| s[0].is_joined());
        (session, pool)
    }

    fn join(network: &Rc<RefCell<LoopbackNetwork>>, name: &str, room: &str, time: &mut f64) -> (TestSession, TestPool) {
        let pool = TestPool::default();
        let mut session = new_session(network, name, pool.clone());
        authenticate(&mut session, time);
        session.join_room(room).unwrap();
        pump_until(&mut [&mut session], time, |s| s[0].is_joined());
        (session, pool)
    }

    fn notified(session: &TestSession, n: &Notification) -> bool {
        session.context().contains(n)
    }

    fn diagnostics(session: &TestSession) -> Vec<Diagnostic> {
        session
            .context()
            .iter()
            .filter_map(|n| match n {
                Notification::Diagnostic(d) => Some(d.clone()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_create_and_join() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;

        let (mut a, _) = create(&network, "alice", "R", RoomOptions::default().max_players(4), &mut time);
        assert_eq!(a.local_actor_id(), 1);
        assert_eq!(a.room().unwrap().name(), "R");
        assert_eq!(a.room().unwrap().max_players(), 4);
        assert!(a.is_master_client());
        let expected = [
            Notification::ConnectedToDirectory,
            Notification::CreatedRoom,
            Notification::JoinedRoom,
        ];
        let seen: Vec<_> = a.context().iter().filter(|n| expected.contains(n)).cloned().collect();
        assert_eq!(seen, expected);

        let (mut b, _) = join(&network, "bob", "R", &mut time);
        pump(&mut [&mut a, &mut b], &mut time, 3);
        assert_eq!(b.local_actor_id(), 2);
        assert_eq!(b.actors().master_id(), Some(1));
        assert_eq!(b.actors().get(1).unwrap().name(), "alice");
        assert!(notified(&a, &Notification::ActorJoined(2)));
        assert_eq!(a.actors().get(2).unwrap().name(), "bob");
        assert_eq!(a.actors().all().len(), 2);
    }

    #[test]
    fn master_moves_to_next_lowest_on_disconnect() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default().max_players(4), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        pump(&mut [&mut a, &mut b], &mut time, 3);
        assert_eq!(a.actors().master_id(), Some(1));
        assert_eq!(b.actors().master_id(), Some(1));

        a.disconnect();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[0].state() == SessionState::Disconnected && s[1].actors().len() == 1
        });
        assert!(notified(&a, &Notification::Disconnected));
        assert!(a.room().is_none());
        assert!(b.is_master_client());
        assert!(notified(&b, &Notification::ActorLeft(1)));
        assert!(notified(&b, &Notification::MasterClientSwitched(2)));
    }

    #[test]
    fn instantiate_and_synchronize() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, pool_a) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, pool_b) = join(&network, "b", "R", &mut time);

        let inst = a
            .instantiate("cube", Vector3::new(1.0, 0.0, 0.0), Quaternion::IDENTITY, 0, None)
            .unwrap();
        assert_eq!(inst, 1001);
        assert!(a.view(inst).is_some());
        pump_until(&mut [&mut a, &mut b], &mut time, |s| s[1].view(inst).is_some());
        assert!(notified(&b, &Notification::ObjectInstantiated(inst)));
        assert_eq!(b.registry().object(inst).unwrap().owner, 1);

        let source = pool_a.fields(inst);
        let replica = pool_b.fields(inst);
        *source.borrow_mut() = vec![Value::Vector3(Vector3::new(1.0, 2.0, 3.0)), Value::Int(5)];
        pump_until(&mut [&mut a, &mut b], &mut time, |_| !replica.borrow().is_empty());
        assert_eq!(*replica.borrow(), *source.borrow());

        // only the second field changes; the replica reconstructs the full vector
        source.borrow_mut()[1] = Value::Int(6);
        pump_until(&mut [&mut a, &mut b], &mut time, |_| replica.borrow()[1] == Value::Int(6));
        assert_eq!(replica.borrow()[0], Value::Vector3(Vector3::new(1.0, 2.0, 3.0)));

        // the replica's owner-side state is never sent back
        *replica.borrow_mut() = vec![Value::Int(0), Value::Int(0)];
        pump(&mut [&mut a, &mut b], &mut time, 5);
        assert_eq!(source.borrow()[1], Value::Int(6));
        assert!(diagnostics(&b).is_empty());
    }

    #[test]
    fn late_joiner_replays_cache() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, pool_a) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, pool_b) = join(&network, "b", "R", &mut time);

        let inst = a
            .instantiate("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        a.rpc(inst, "hit", RpcTarget::AllBuffered, vec![Value::Int(7)]).unwrap();
        a.rpc(inst, "hit", RpcTarget::Others, vec![Value::Int(1)]).unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |_| pool_b.hits().len() == 2);
        assert_eq!(pool_a.hits(), vec![(1, 7)]);
        assert_eq!(pool_b.hits(), vec![(1, 7), (1, 1)]);
        assert_eq!(network.borrow().cached_event_count("R"), 2);

        let (mut c, pool_c) = join(&network, "c", "R", &mut time);
        assert!(c.view(inst).is_some());
        assert_eq!(pool_c.hits(), vec![(1, 7)]);

        a.destroy(inst).unwrap();
        assert!(a.view(inst).is_none());
        pump_until(&mut [&mut a, &mut b, &mut c], &mut time, |s| {
            s[1].view(inst).is_none() && s[2].view(inst).is_none()
        });
        assert!(notified(&b, &Notification::ObjectDestroyed(inst)));
        assert_eq!(network.borrow().cached_event_count("R"), 0);
        assert_eq!(*pool_c.destroyed.borrow(), vec![inst]);

        let (d, pool_d) = join(&network, "d", "R", &mut time);
        assert!(d.view(inst).is_none());
        assert!(pool_d.hits().is_empty());
    }

    #[test]
    fn leaver_objects_are_cleaned_up() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        let inst = b
            .instantiate("pair", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        assert_eq!(b.registry().object(inst).unwrap().view_ids, vec![2001, 2002]);
        pump_until(&mut [&mut a, &mut b], &mut time, |s| s[0].view(2002).is_some());

        b.leave_room().unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[1].state() == SessionState::ConnectedToDirectoryAuthenticated
        });
        assert!(notified(&b, &Notification::LeftRoom));
        assert!(b.registry().all_objects().is_empty());
        assert!(notified(&a, &Notification::ActorLeft(2)));
        assert!(notified(&a, &Notification::ObjectDestroyed(inst)));
        assert!(a.view(2001).is_none());
        assert_eq!(network.borrow().cached_event_count("R"), 0);
    }

    #[test]
    fn room_objects_survive_their_creator() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        assert!(matches!(
            b.instantiate_room_object("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None),
            Err(Error::NotMasterClient)
        ));
        let inst = a
            .instantiate_room_object("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        assert_eq!(inst, 1);
        a.rpc(inst, "hit", RpcTarget::AllBuffered, vec![Value::Int(9)]).unwrap();
        let own = a
            .instantiate("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[1].view(inst).is_some() && s[1].view(own).is_some()
        });
        assert!(matches!(b.destroy(inst), Err(Error::DestroyNotAllowed { .. })));

        // auto-cleanup drops the creator's own object but not the room's
        a.disconnect();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| s[1].is_master_client());
        assert!(b.view(inst).is_some());
        assert!(b.view(own).is_none());
        assert_eq!(network.borrow().cached_event_count("R"), 2);

        let (mut c, pool_c) = join(&network, "c", "R", &mut time);
        assert!(c.view(inst).is_some());
        assert!(c.view(own).is_none());
        assert_eq!(c.registry().object(inst).unwrap().owner, ROOM_OWNER_ID);
        assert_eq!(pool_c.hits(), vec![(1, 9)]);

        b.destroy(inst).unwrap();
        assert!(b.view(inst).is_none());
        pump_until(&mut [&mut b, &mut c], &mut time, |s| s[1].view(inst).is_none());
        assert_eq!(network.borrow().cached_event_count("R"), 0);
    }

    #[test]
    fn destroy_player_keeps_room_objects_cached() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let room_object = a
            .instantiate_room_object("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        let own = a
            .instantiate("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        pump(&mut [&mut a], &mut time, 2);
        assert_eq!(network.borrow().cached_event_count("R"), 2);

        a.destroy_player_objects(1).unwrap();
        pump(&mut [&mut a], &mut time, 2);
        assert!(a.view(own).is_none());
        assert!(a.view(room_object).is_some());
        assert_eq!(network.borrow().cached_event_count("R"), 1);

        a.destroy_all().unwrap();
        pump(&mut [&mut a], &mut time, 2);
        assert!(a.view(room_object).is_none());
        assert_eq!(network.borrow().cached_event_count("R"), 0);
    }

    #[test]
    fn rpc_targets() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, pool_a) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, pool_b) = join(&network, "b", "R", &mut time);
        let inst = b
            .instantiate("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| s[0].view(inst).is_some());

        b.rpc(inst, "hit", RpcTarget::MasterClient, vec![Value::Int(3)]).unwrap();
        a.rpc(inst, "hit", RpcTarget::MasterClient, vec![Value::Int(4)]).unwrap();
        b.rpc(inst, "hit", RpcTarget::AllViaServer, vec![Value::Int(5)]).unwrap();
        b.rpc_to(inst, "hit", 2, vec![Value::Int(6)]).unwrap();
        pump(&mut [&mut a, &mut b], &mut time, 5);
        assert_eq!(pool_a.hits(), vec![(1, 4), (2, 3), (2, 5)]);
        assert_eq!(pool_b.hits(), vec![(2, 6), (2, 5)]);

        a.rpc(inst, "hit", RpcTarget::Others, vec![Value::from("x")]).unwrap();
        pump(&mut [&mut a, &mut b], &mut time, 3);
        assert!(diagnostics(&b)
            .iter()
            .any(|d| matches!(d, Diagnostic::RpcDropped { view_id, .. } if *view_id == inst)));
        assert!(matches!(
            a.rpc(9999, "hit", RpcTarget::All, vec![]),
            Err(Error::UnknownView(9999))
        ));
    }

    #[test]
    fn interest_groups_filter_instantiation() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        let inst = a
            .instantiate("cube", Vector3::ZERO, Quaternion::IDENTITY, 3, None)
            .unwrap();
        pump(&mut [&mut a, &mut b], &mut time, 3);
        assert!(b.view(inst).is_none());

        let pool = TestPool::default();
        let mut c = new_session(&network, "c", pool);
        c.set_receiving_group(3, true);
        authenticate(&mut c, &mut time);
        c.join_room("R").unwrap();
        pump_until(&mut [&mut c], &mut time, |s| s[0].view(inst).is_some());
        assert!(c.interest_groups().is_receiving(3));
    }

    #[test]
    fn explicit_master_handoff() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        pump(&mut [&mut a, &mut b], &mut time, 2);

        assert!(matches!(b.set_master_client(2, true), Err(Error::NotMasterClient)));
        assert!(matches!(a.set_master_client(1, true), Err(Error::AlreadyMaster(1))));
        assert!(matches!(a.set_master_client(7, true), Err(Error::UnknownActor(7))));
        a.set_master_client(2, true).unwrap();
        assert!(a.is_master_client());
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[0].actors().master_id() == Some(2) && s[1].is_master_client()
        });
        assert!(notified(&a, &Notification::MasterClientSwitched(2)));
    }

    #[test]
    fn master_handoff_lasts_until_next_join() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, pool_a) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, pool_b) = join(&network, "b", "R", &mut time);
        let inst = a
            .instantiate("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        pump(&mut [&mut a, &mut b], &mut time, 2);
        a.set_master_client(2, true).unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[0].actors().master_id() == Some(2) && s[1].is_master_client()
        });

        let (mut c, pool_c) = join(&network, "c", "R", &mut time);
        pump_until(&mut [&mut a, &mut b, &mut c], &mut time, |s| {
            s.iter().all(|s| s.actors().master_id() == Some(1))
        });
        assert!(notified(&b, &Notification::MasterClientSwitched(1)));

        // the server routes to the master every client agrees on
        c.rpc(inst, "hit", RpcTarget::MasterClient, vec![Value::Int(9)]).unwrap();
        pump(&mut [&mut a, &mut b, &mut c], &mut time, 4);
        assert_eq!(pool_a.hits(), vec![(3, 9)]);
        assert!(pool_b.hits().is_empty());
        assert!(pool_c.hits().is_empty());
    }

    #[test]
    fn destroy_after_leave_is_ignored() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        let (mut c, pool_c) = join(&network, "c", "R", &mut time);
        let inst = b
            .instantiate("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        pump_until(&mut [&mut a, &mut b, &mut c], &mut time, |s| {
            s[0].view(inst).is_some() && s[2].view(inst).is_some()
        });

        let peer_b = b.transport().peer();
        let peer_c = c.transport().peer();
        network.borrow_mut().drop_peer(peer_b, StatusCode::TimeoutDisconnect);
        // a destroy from the master lands right behind the leave
        let mut content = Table::new();
        content.insert(0, Value::Int(inst));
        let params = LoopbackNetwork::event_params(1, &Value::Table(content));
        network
            .borrow_mut()
            .send_event(peer_c, event::DESTROY, 1, params)
            .unwrap();
        pump_until(&mut [&mut a, &mut c], &mut time, |s| {
            s[0].actors().len() == 2 && s[1].actors().len() == 2
        });

        assert!(c.view(inst).is_none());
        let destroyed = c
            .context()
            .iter()
            .filter(|n| **n == Notification::ObjectDestroyed(inst))
            .count();
        assert_eq!(destroyed, 1);
        assert_eq!(*pool_c.destroyed.borrow(), vec![inst]);
        assert!(diagnostics(&c).contains(&Diagnostic::DestroyUnknownObject(inst)));
        assert!(a.view(inst).is_none());
        assert!(matches!(a.destroy(inst), Err(Error::UnknownObject(_))));
    }

    #[test]
    fn failed_construction_is_reported() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let pool = TestPool {
            short_pair: true,
            ..TestPool::default()
        };
        let mut b = new_session(&network, "b", pool);
        authenticate(&mut b, &mut time);
        b.join_room("R").unwrap();
        pump_until(&mut [&mut b], &mut time, |s| s[0].is_joined());

        let inst = a
            .instantiate("pair", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[1].registry().pending_count() == 1
        });
        assert!(b.view(inst).is_none());
        assert!(diagnostics(&b).contains(&Diagnostic::ViewCountMismatch {
            prefab: "pair".into(),
            expected: 1,
            actual: 2,
        }));
        assert!(!notified(&b, &Notification::ObjectInstantiated(inst)));

        b.leave_room().unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[1].state() == SessionState::ConnectedToDirectoryAuthenticated
        });
        assert!(diagnostics(&b).contains(&Diagnostic::PendingInstantiations(1)));
        assert_eq!(b.registry().pending_count(), 0);
    }

    #[test]
    fn stale_level_prefix_is_dropped() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, pool_a) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, pool_b) = join(&network, "b", "R", &mut time);
        a.set_level_prefix(1);
        let inst = a
            .instantiate("cube", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
            .unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| s[1].view(inst).is_some());
        assert_eq!(b.view(inst).unwrap().level_prefix(), 1);

        let source = pool_a.fields(inst);
        let replica = pool_b.fields(inst);
        *source.borrow_mut() = vec![Value::Int(1)];
        pump_until(&mut [&mut a, &mut b], &mut time, |_| {
            *replica.borrow() == vec![Value::Int(1)]
        });

        a.set_level_prefix(2);
        a.rpc(inst, "hit", RpcTarget::Others, vec![Value::Int(3)]).unwrap();
        *source.borrow_mut() = vec![Value::Int(2)];
        pump(&mut [&mut a, &mut b], &mut time, 5);
        assert!(pool_b.hits().is_empty());
        assert_eq!(*replica.borrow(), vec![Value::Int(1)]);
        assert!(diagnostics(&b).iter().any(|d| matches!(
            d,
            Diagnostic::RpcDropped {
                reason: RpcDropReason::LevelPrefixMismatch {
                    expected: 1,
                    actual: 2
                },
                ..
            }
        )));
    }

    #[test]
    fn actor_numbers_stay_within_property_keys() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (_a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        if let Some(room) = network.borrow_mut().rooms.get_mut("R") {
            room.next_actor = i32::from(i16::MAX) + 1;
        }

        let mut b = new_session(&network, "b", TestPool::default());
        authenticate(&mut b, &mut time);
        b.join_room("R").unwrap();
        pump_until(&mut [&mut b], &mut time, |s| {
            s[0].context()
                .iter()
                .any(|n| matches!(n, Notification::JoinRoomFailed(_)))
        });
        assert!(notified(
            &b,
            &Notification::JoinRoomFailed(OperationFailure {
                kind: JoinFailure::Other(return_code::OPERATION_NOT_ALLOWED),
                message: "actor numbers exhausted".into(),
            })
        ));
        assert!(!b.is_joined());
        pump_until(&mut [&mut b], &mut time, |s| {
            s[0].state() == SessionState::ConnectedToDirectoryAuthenticated
        });

        // a member the server numbered out of range still shows up, without properties
        let big = i32::from(i16::MAX) + 7;
        {
            let mut net = network.borrow_mut();
            let peer = net.add_peer();
            if let Some(room) = net.rooms.get_mut("R") {
                room.next_actor = 2;
                room.members.insert(
                    big,
                    Member {
                        peer,
                        properties: Properties::new(),
                        groups: HashSet::new(),
                    },
                );
            }
        }
        b.join_room("R").unwrap();
        pump_until(&mut [&mut b], &mut time, |s| s[0].is_joined());
        assert!(b.actors().contains(big));
        assert!(b.actors().get(1).is_some());
        assert!(diagnostics(&b).iter().any(|d| matches!(
            d,
            Diagnostic::MalformedEvent { reason, .. } if reason == "actor number does not fit a property key"
        )));
    }

    #[test]
    fn properties_and_custom_events() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default().property("map", "dust"), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        assert_eq!(b.room().unwrap().properties().get("map"), Some(&Value::from("dust")));

        let mut props = Properties::new();
        props.insert("map".into(), Value::from("nuke"));
        a.set_room_properties(props.clone()).unwrap();
        let mut score = Properties::new();
        score.insert("score".into(), Value::Int(10));
        b.set_actor_properties(2, score.clone()).unwrap();
        a.raise_event(5, Value::from("hello"), RaiseEventOptions::others()).unwrap();
        assert!(matches!(
            a.raise_event(200, Value::Null, RaiseEventOptions::others()),
            Err(Error::ReservedEventCode(200))
        ));
        pump(&mut [&mut a, &mut b], &mut time, 4);

        assert!(notified(&b, &Notification::RoomPropertiesChanged(props)));
        assert_eq!(b.room().unwrap().properties().get("map"), Some(&Value::from("nuke")));
        assert!(notified(
            &a,
            &Notification::ActorPropertiesChanged {
                actor: 2,
                changed: score
            }
        ));
        assert_eq!(a.actors().get(2).unwrap().properties().get("score"), Some(&Value::Int(10)));
        assert!(notified(
            &b,
            &Notification::CustomEvent {
                code: 5,
                sender: 1,
                content: Value::from("hello")
            }
        ));
    }

    #[test]
    fn join_failures() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (_a, _) = create(&network, "a", "full", RoomOptions::default().max_players(1), &mut time);

        let mut b = new_session(&network, "b", TestPool::default());
        authenticate(&mut b, &mut time);
        b.join_room("missing").unwrap();
        assert!(matches!(b.join_room("other"), Err(Error::InvalidState(_))));
        pump(&mut [&mut b], &mut time, 3);
        assert!(b.context().iter().any(|n| matches!(
            n,
            Notification::JoinRoomFailed(OperationFailure {
                kind: JoinFailure::RoomNotFound,
                ..
            })
        )));
        assert_eq!(b.state(), SessionState::ConnectedToDirectoryAuthenticated);

        b.join_room("full").unwrap();
        pump(&mut [&mut b], &mut time, 3);
        assert!(b.context().iter().any(|n| matches!(
            n,
            Notification::JoinRoomFailed(OperationFailure {
                kind: JoinFailure::RoomFull,
                ..
            })
        )));

        b.create_room(Some("full"), RoomOptions::default()).unwrap();
        pump(&mut [&mut b], &mut time, 3);
        assert!(b.context().iter().any(|n| matches!(
            n,
            Notification::CreateRoomFailed(OperationFailure {
                kind: JoinFailure::RoomAlreadyExists,
                ..
            })
        )));

        b.join_random_room(Properties::new()).unwrap();
        pump(&mut [&mut b], &mut time, 3);
        assert!(b.context().iter().any(|n| matches!(
            n,
            Notification::JoinRandomFailed(OperationFailure {
                kind: JoinFailure::NoMatchFound,
                ..
            })
        )));
        assert!(!b.is_joined());
    }

    #[test]
    fn join_random_uses_filter() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (_a, _) = create(&network, "a", "casual", RoomOptions::default().property("mode", "casual"), &mut time);
        let (_b, _) = create(&network, "b", "ranked", RoomOptions::default().property("mode", "ranked"), &mut time);

        let mut c = new_session(&network, "c", TestPool::default());
        authenticate(&mut c, &mut time);
        let mut filter = Properties::new();
        filter.insert("mode".into(), Value::from("ranked"));
        c.join_random_room(filter).unwrap();
        pump_until(&mut [&mut c], &mut time, |s| s[0].is_joined());
        assert_eq!(c.room().unwrap().name(), "ranked");
        assert!(!notified(&c, &Notification::CreatedRoom));
    }

    #[test]
    fn authentication_failures() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;

        let cfg = SessionConfig::with_context(Vec::new())
            .app_id("wrong")
            .on_notification(|n, log: &mut Vec<Notification>| log.push(n.clone()));
        let mut a = Session::with_config(LoopbackTransport::new(&network), cfg);
        a.connect().unwrap();
        pump_until(&mut [&mut a], &mut time, |s| s[0].state() == SessionState::Disconnected);
        assert!(notified(
            &a,
            &Notification::ConnectionFailed(DisconnectCause::InvalidAuthentication)
        ));

        network
            .borrow_mut()
            .fail_authentication(return_code::CUSTOM_AUTHENTICATION_FAILED, "banned");
        let mut b = new_session(&network, "b", TestPool::default());
        b.connect().unwrap();
        pump_until(&mut [&mut b], &mut time, |s| s[0].state() == SessionState::Disconnected);
        assert!(notified(&b, &Notification::CustomAuthenticationFailed("banned".into())));
    }

    #[test]
    fn transport_faults() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;

        let cfg = SessionConfig::with_context(Vec::new())
            .app_id(APP_ID)
            .directory_address("10.0.0.1:1")
            .on_notification(|n, log: &mut Vec<Notification>| log.push(n.clone()));
        let mut lost = Session::with_config(LoopbackTransport::new(&network), cfg);
        lost.connect().unwrap();
        pump_until(&mut [&mut lost], &mut time, |s| s[0].state() == SessionState::Disconnected);
        assert!(notified(
            &lost,
            &Notification::FailedToConnect(DisconnectCause::ExceptionOnConnect)
        ));
        assert!(matches!(lost.leave_room(), Err(Error::NotInRoom)));

        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        let peer = b.transport().peer();
        network.borrow_mut().drop_peer(peer, StatusCode::TimeoutDisconnect);
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[1].state() == SessionState::Disconnected && s[0].actors().len() == 1
        });
        assert!(notified(&b, &Notification::ConnectionLost(DisconnectCause::Timeout)));
        assert!(b.room().is_none());
        assert_eq!(b.local_actor_id(), -1);

        b.connect().unwrap();
        pump_until(&mut [&mut b], &mut time, |s| {
            s[0].state() == SessionState::ConnectedToDirectoryAuthenticated
        });
    }

    #[test]
    fn master_closes_connection() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        pump(&mut [&mut a, &mut b], &mut time, 2);
        assert!(matches!(b.close_connection(1), Err(Error::NotMasterClient)));
        a.close_connection(2).unwrap();
        pump_until(&mut [&mut a, &mut b], &mut time, |s| {
            s[1].state() == SessionState::Disconnected
        });
        assert!(notified(&b, &Notification::ConnectionLost(DisconnectCause::ClosedByMaster)));
    }

    #[test]
    fn paused_queue_holds_events() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let (mut a, _) = create(&network, "a", "R", RoomOptions::default(), &mut time);
        let (mut b, _) = join(&network, "b", "R", &mut time);
        pump(&mut [&mut a, &mut b], &mut time, 2);

        b.set_message_queue_running(false);
        a.raise_event(1, Value::Int(42), RaiseEventOptions::others()).unwrap();
        pump(&mut [&mut a, &mut b], &mut time, 4);
        let event = Notification::CustomEvent {
            code: 1,
            sender: 1,
            content: Value::Int(42),
        };
        assert!(!notified(&b, &event));
        b.set_message_queue_running(true);
        pump(&mut [&mut a, &mut b], &mut time, 1);
        assert!(notified(&b, &event));
    }

    #[test]
    fn lobby_and_state_changes() {
        enable_logging();
        let network = LoopbackNetwork::shared(APP_ID);
        let mut time = 0.0;
        let cfg = SessionConfig::with_context(Vec::new())
            .app_id(APP_ID)
            .auto_join_lobby(true)
            .on_notification(|n, log: &mut Vec<Notification>| log.push(n.clone()));
        let mut a = Session::with_config(LoopbackTransport::new(&network), cfg);
        assert!(matches!(a.create_room(None, RoomOptions::default()), Err(Error::InvalidState(SessionState::Created))));
        a.connect().unwrap();
        assert!(matches!(a.connect(), Err(Error::InvalidState(SessionState::Connecting))));
        pump_until(&mut [&mut a], &mut time, |s| s[0].state() == SessionState::JoinedLobby);
        assert!(notified(&a, &Notification::JoinedLobby));

        a.create_room(None, RoomOptions::default()).unwrap();
        pump_until(&mut [&mut a], &mut time, |s| s[0].is_joined());
        assert_eq!(a.room().unwrap().name(), "room-1");
        assert_eq!(network.borrow().room_names(), vec!["room-1".to_owned()]);
    }
}
