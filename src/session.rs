use std::collections::VecDeque;

use crate::{
    actor::{Actor, ActorDirectory},
    consts::{
        DEFAULT_APP_VERSION, DEFAULT_DIRECTORY_ADDRESS, DEFAULT_KEEP_ALIVE_INTERVAL_SEC,
        DEFAULT_SEND_RATE, DEFAULT_SERIALIZATION_RATE, ROOM_OWNER_ID,
    },
    error::{Error, Result},
    notification::{Diagnostic, JoinFailure, Notification, OperationFailure},
    protocol::{
        event, op, param, return_code, CacheOp, DisconnectCause, EventData, OperationResponse,
        RaiseEventOptions, ReceiverGroup, StatusCode,
    },
    registry::{PrefabPool, Registry, KEY_INSTANTIATION_ID},
    room::{Room, RoomOptions},
    rpc::{
        self, Continuation, DeferredRpc, MethodRef, RpcCall, RpcDestination, RpcDropReason, RpcInfo,
        RpcShortcuts, RpcTarget,
    },
    sync::{self, SerializationBatch, SyncPrecision},
    transport::{Delivery, PeerTransport},
    value::{Params, Properties, Quaternion, Table, Value, Vector3},
    view::{InterestGroups, View, ViewId},
    ActorId,
};

/// Key of the target in destroy, destroy-player and view filter payloads.
const KEY_TARGET: i16 = 0;
/// Key of the new master in the assign-master payload.
const KEY_NEW_MASTER: i16 = 1;

type StateCallback<Ctx> = Box<dyn FnMut(SessionState, SessionState, &mut Ctx) + Send + Sync + 'static>;
type NotificationCallback<Ctx> = Box<dyn FnMut(&Notification, &mut Ctx) + Send + Sync + 'static>;

/// Configuration for a session.
///
/// * `app_id`, `app_version` - Sent when authenticating with both servers.
/// * `directory_address` - Where [`connect`](Session::connect) goes first.
/// * `send_rate` - Outgoing queue flushes per second.
/// * `serialization_rate` - View synchronization passes per second.
/// * `on_notification` - Receives every [`Notification`] the session produces.
///
/// # Example
/// ```
/// # struct MyContext { joined: bool }
/// use netroom::{Notification, SessionConfig, SessionState};
///
/// let cfg = SessionConfig::with_context(MyContext { joined: false })
///     .app_id("my-game")
///     .player_name("alice")
///     .send_rate(30.0)
///     .on_state_change(|from, to, _ctx| {
///         if let (SessionState::Joining, SessionState::Joined) = (from, to) {
///             println!("in the room");
///         }
///     })
///     .on_notification(|n, ctx| {
///         if let Notification::JoinedRoom = n {
///             ctx.joined = true;
///         }
///     });
/// ```
pub struct SessionConfig<Ctx> {
    app_id: String,
    app_version: String,
    directory_address: String,
    player_name: String,
    send_rate: f64,
    serialization_rate: f64,
    keep_alive_interval: f64,
    auto_join_lobby: bool,
    precision: SyncPrecision,
    rpc_shortcuts: RpcShortcuts,
    prefab_pool: Option<Box<dyn PrefabPool>>,
    context: Ctx,
    on_state_change: Option<StateCallback<Ctx>>,
    on_notification: Option<NotificationCallback<Ctx>>,
}

impl Default for SessionConfig<()> {
    fn default() -> Self {
        SessionConfig::with_context(())
    }
}

impl<Ctx> SessionConfig<Ctx> {
    /// Create a new, default session configuration with no context.
    pub fn new() -> SessionConfig<()> {
        SessionConfig::<()>::default()
    }
    /// Create a new session configuration with context that will be passed to the callbacks.
    pub fn with_context(ctx: Ctx) -> Self {
        Self {
            app_id: String::new(),
            app_version: DEFAULT_APP_VERSION.to_owned(),
            directory_address: DEFAULT_DIRECTORY_ADDRESS.to_owned(),
            player_name: String::new(),
            send_rate: DEFAULT_SEND_RATE,
            serialization_rate: DEFAULT_SERIALIZATION_RATE,
            keep_alive_interval: DEFAULT_KEEP_ALIVE_INTERVAL_SEC,
            auto_join_lobby: false,
            precision: SyncPrecision::default(),
            rpc_shortcuts: RpcShortcuts::default(),
            prefab_pool: None,
            context: ctx,
            on_state_change: None,
            on_notification: None,
        }
    }
    pub fn app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = app_id.into();
        self
    }
    pub fn app_version(mut self, app_version: impl Into<String>) -> Self {
        self.app_version = app_version.into();
        self
    }
    pub fn directory_address(mut self, address: impl Into<String>) -> Self {
        self.directory_address = address.into();
        self
    }
    pub fn player_name(mut self, name: impl Into<String>) -> Self {
        self.player_name = name.into();
        self
    }
    /// Set the number of outgoing queue flushes per second. The default is 20.
    pub fn send_rate(mut self, per_second: f64) -> Self {
        self.send_rate = per_second;
        self
    }
    /// Set the number of view synchronization passes per second. The default is 10.
    pub fn serialization_rate(mut self, per_second: f64) -> Self {
        self.serialization_rate = per_second;
        self
    }
    /// Set the interval between acks-only sends while the message queue is paused.
    /// The default is `0.1` seconds.
    pub fn keep_alive_interval(mut self, seconds: f64) -> Self {
        self.keep_alive_interval = seconds;
        self
    }
    /// Join the lobby automatically after authenticating with the directory server.
    pub fn auto_join_lobby(mut self, enabled: bool) -> Self {
        self.auto_join_lobby = enabled;
        self
    }
    pub fn precision(mut self, precision: SyncPrecision) -> Self {
        self.precision = precision;
        self
    }
    /// Set the method shortcut table. Must be identical on every client.
    pub fn rpc_shortcuts(mut self, shortcuts: RpcShortcuts) -> Self {
        self.rpc_shortcuts = shortcuts;
        self
    }
    pub fn prefab_pool(mut self, pool: impl PrefabPool + 'static) -> Self {
        self.prefab_pool = Some(Box::new(pool));
        self
    }
    /// Set a callback that will be called when the session changes states.
    pub fn on_state_change<F>(mut self, cb: F) -> Self
    where
        F: FnMut(SessionState, SessionState, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_state_change = Some(Box::new(cb));
        self
    }
    /// Set a callback that will be called for every notification.
    pub fn on_notification<F>(mut self, cb: F) -> Self
    where
        F: FnMut(&Notification, &mut Ctx) + Send + Sync + 'static,
    {
        self.on_notification = Some(Box::new(cb));
        self
    }
}

/// The states in the session state machine.
///
/// The initial state is `Created`. [`connect`](Session::connect) goes to the directory server,
/// which authenticates the client and brokers room creation and joining. Once the directory
/// accepts a create or join, the session disconnects from it, connects to the session server,
/// authenticates again with the secret the directory issued, and replays the create or join
/// there. `Joined` is the only state in which room operations are allowed.
///
/// Leaving the room or failing to join on the session server returns the client to the
/// directory server. Transport faults and [`disconnect`](Session::disconnect) end in
/// `Disconnected`, from which the session may connect again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    ConnectedToDirectory,
    Authenticating,
    JoinedLobby,
    ConnectedToDirectoryAuthenticated,
    ConnectingToSession,
    ConnectedToSession,
    Joining,
    Joined,
    /// The leave operation was sent and is not yet acknowledged.
    Leaving,
    DisconnectingFromDirectory,
    DisconnectingFromSession,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Server {
    None,
    Directory,
    Session,
}

/// The create or join to replay on the session server.
#[derive(Debug, Clone, PartialEq)]
enum JoinIntent {
    Create {
        name: Option<String>,
        options: RoomOptions,
    },
    Join {
        name: String,
    },
    JoinRandom {
        name: Option<String>,
    },
}

impl JoinIntent {
    fn failed(&self, failure: OperationFailure) -> Notification {
        match self {
            JoinIntent::Create { .. } => Notification::CreateRoomFailed(failure),
            JoinIntent::Join { .. } => Notification::JoinRoomFailed(failure),
            JoinIntent::JoinRandom { .. } => Notification::JoinRandomFailed(failure),
        }
    }
    fn room_name(&self) -> Option<&str> {
        match self {
            JoinIntent::Create { name, .. } | JoinIntent::JoinRandom { name, .. } => {
                name.as_deref()
            }
            JoinIntent::Join { name } => Some(name),
        }
    }
}

#[derive(Debug)]
enum Outgoing {
    Operation {
        code: u8,
        params: Params,
        reliable: bool,
    },
    Event {
        code: u8,
        content: Value,
        reliable: bool,
        options: RaiseEventOptions,
    },
}

/// A client of the directory and session servers.
///
/// The session does no IO on its own: the host calls [`tick`](Session::tick) at a steady rate.
/// Each tick drains the transport's deliveries in arrival order, resumes RPC continuations,
/// synchronizes owned views at the serialization rate and flushes the outgoing queue at the
/// send rate. Operations called by the host only queue traffic.
///
/// # Example
/// ```
/// # use netroom::loopback::{LoopbackNetwork, LoopbackTransport};
/// use netroom::{RoomOptions, Session, SessionConfig, SessionState};
///
/// let network = LoopbackNetwork::shared("my-game");
/// let cfg = SessionConfig::default().app_id("my-game").player_name("alice");
/// let mut session = Session::with_config(LoopbackTransport::new(&network), cfg);
/// session.connect().unwrap();
///
/// let mut time = 0.0;
/// while session.state() != SessionState::ConnectedToDirectoryAuthenticated {
///     session.tick(time);
///     time += 0.1;
/// }
/// session.create_room(Some("arena"), RoomOptions::default().max_players(4)).unwrap();
/// while session.state() != SessionState::Joined {
///     session.tick(time);
///     time += 0.1;
/// }
/// assert_eq!(session.room().unwrap().name(), "arena");
/// ```
pub struct Session<T: PeerTransport, Ctx = ()> {
    transport: T,
    state: SessionState,
    server: Server,
    time: f64,
    last_send_time: f64,
    last_serialize_time: f64,
    last_keep_alive_time: f64,
    secret: Option<String>,
    session_address: Option<String>,
    join_intent: Option<JoinIntent>,
    actors: ActorDirectory,
    room: Option<Room>,
    registry: Registry,
    groups: InterestGroups,
    level_prefix: i16,
    outgoing: VecDeque<Outgoing>,
    continuations: Vec<Continuation>,
    deferred_rpcs: Vec<DeferredRpc>,
    message_queue_running: bool,
    cfg: SessionConfig<Ctx>,
}

impl<T: PeerTransport> Session<T> {
    /// Create a new session with a default configuration.
    pub fn new(transport: T) -> Self {
        Session::with_config(transport, SessionConfig::default())
    }
}

impl<T: PeerTransport, Ctx> Session<T, Ctx> {
    /// Create a new session with a custom configuration. <br>
    /// See [`SessionConfig`](SessionConfig) for more details.
    pub fn with_config(transport: T, cfg: SessionConfig<Ctx>) -> Self {
        Self {
            transport,
            state: SessionState::Created,
            server: Server::None,
            time: 0.0,
            last_send_time: f64::NEG_INFINITY,
            last_serialize_time: f64::NEG_INFINITY,
            last_keep_alive_time: f64::NEG_INFINITY,
            secret: None,
            session_address: None,
            join_intent: None,
            actors: ActorDirectory::new(cfg.player_name.clone()),
            room: None,
            registry: Registry::new(),
            groups: InterestGroups::default(),
            level_prefix: 0,
            outgoing: VecDeque::new(),
            continuations: Vec::new(),
            deferred_rpcs: Vec::new(),
            message_queue_running: true,
            cfg,
        }
    }

    fn set_state(&mut self, state: SessionState) {
        log::debug!("session state changing from {:?} to {:?}", self.state, state);
        if let Some(ref mut cb) = self.cfg.on_state_change {
            cb(self.state, state, &mut self.cfg.context)
        }
        self.state = state;
    }
    fn notify(&mut self, notification: Notification) {
        match &notification {
            Notification::Diagnostic(d) => log::warn!("session diagnostic: {d:?}"),
            n => log::debug!("session notification: {n:?}"),
        }
        if let Some(ref mut cb) = self.cfg.on_notification {
            cb(&notification, &mut self.cfg.context)
        }
    }
    fn diagnostic(&mut self, diagnostic: Diagnostic) {
        self.notify(Notification::Diagnostic(diagnostic));
    }

    fn queue_operation(&mut self, code: u8, params: Params) {
        log::trace!("queueing operation {code}");
        self.outgoing.push_back(Outgoing::Operation {
            code,
            params,
            reliable: true,
        });
    }
    fn queue_event(&mut self, code: u8, content: Value, reliable: bool, options: RaiseEventOptions) {
        log::trace!("queueing event {code} with {options:?}");
        self.outgoing.push_back(Outgoing::Event {
            code,
            content,
            reliable,
            options,
        });
    }
    fn flush(&mut self) {
        while let Some(msg) = self.outgoing.pop_front() {
            let result: Result<()> = match msg {
                Outgoing::Operation {
                    code,
                    params,
                    reliable,
                } => self
                    .transport
                    .send_operation(code, params, reliable)
                    .map_err(Into::into),
                Outgoing::Event {
                    code,
                    content,
                    reliable,
                    options,
                } => self
                    .transport
                    .raise_event(code, content, reliable, &options)
                    .map_err(Into::into),
            };
            if let Err(e) = result {
                log::error!("session failed to send: {e}");
            }
        }
        self.last_send_time = self.time;
    }

    fn connect_to(&mut self, server: Server, address: String, state: SessionState) -> bool {
        self.server = server;
        self.set_state(state);
        log::info!("session connecting to {server:?} server at {address}");
        self.transport.connect(&address, &self.cfg.app_id)
    }
    fn authenticate(&mut self) {
        let mut params = Params::new();
        params.insert(param::APPLICATION_ID, Value::from(self.cfg.app_id.as_str()));
        params.insert(param::APP_VERSION, Value::from(self.cfg.app_version.as_str()));
        params.insert(param::USER_ID, Value::from(self.actors.local().name()));
        if self.server == Server::Session {
            if let Some(secret) = &self.secret {
                params.insert(param::SECRET, Value::from(secret.as_str()));
            }
        }
        self.queue_operation(op::AUTHENTICATE, params);
    }
    /// Drops all room state. Objects are torn down through the prefab pool.
    fn cleanup_room(&mut self) {
        let pending = self.registry.pending_count();
        if pending > 0 {
            self.diagnostic(Diagnostic::PendingInstantiations(pending));
        }
        let objects = self.registry.clear();
        if let Some(pool) = self.cfg.prefab_pool.as_deref_mut() {
            for object in &objects {
                pool.destroy(object.instantiation_id, &object.view_ids);
            }
        }
        self.actors.reset();
        self.room = None;
        self.continuations.clear();
        self.deferred_rpcs.clear();
    }
    fn teardown(&mut self) {
        self.cleanup_room();
        self.outgoing.clear();
        self.join_intent = None;
        self.secret = None;
        self.session_address = None;
        self.server = Server::None;
    }
    fn return_to_directory(&mut self) {
        self.outgoing.clear();
        self.set_state(SessionState::DisconnectingFromSession);
        self.transport.disconnect();
    }

    /// Connects to the directory server.
    ///
    /// This only starts the connection; progress is made on the following calls to [`tick`](Session::tick).
    pub fn connect(&mut self) -> Result<()> {
        if !matches!(self.state, SessionState::Created | SessionState::Disconnected) {
            return Err(Error::InvalidState(self.state));
        }
        self.teardown();
        let address = self.cfg.directory_address.clone();
        if !self.connect_to(Server::Directory, address.clone(), SessionState::Connecting) {
            self.server = Server::None;
            self.set_state(SessionState::Disconnected);
            return Err(Error::ConnectFailed(address));
        }
        Ok(())
    }
    /// Tears everything down and disconnects from whichever server is connected.
    ///
    /// Room and lobby state is cleared at once and queued traffic is dropped. An in-flight join
    /// is abandoned. The `Disconnected` notification follows once the transport confirms.
    pub fn disconnect(&mut self) {
        if matches!(
            self.state,
            SessionState::Created | SessionState::Disconnected | SessionState::Disconnecting
        ) {
            return;
        }
        log::info!("session disconnecting");
        self.teardown();
        self.set_state(SessionState::Disconnecting);
        self.transport.disconnect();
    }

    /// Advances the session to `time`, in seconds.
    pub fn tick(&mut self, time: f64) {
        self.time = time;
        if !self.message_queue_running {
            if self.last_keep_alive_time + self.cfg.keep_alive_interval <= time {
                log::trace!("session sending acks only");
                self.transport.send_acks_only();
                self.last_keep_alive_time = time;
            }
            return;
        }
        while let Some(delivery) = self.transport.poll() {
            self.dispatch(delivery);
        }
        if !self.continuations.is_empty() {
            self.continuations.retain_mut(|resume| !resume(time));
        }
        if self.state == SessionState::Joined
            && self.last_serialize_time + 1.0 / self.cfg.serialization_rate <= time
        {
            self.serialize_views();
            self.last_serialize_time = time;
        }
        if self.last_send_time + 1.0 / self.cfg.send_rate <= time {
            self.flush();
        }
    }

    fn dispatch(&mut self, delivery: Delivery) {
        match delivery {
            Delivery::StatusChanged(status) => self.on_status(status),
            Delivery::OperationResponse(resp) => self.on_operation_response(resp),
            Delivery::Event(ev) => self.on_event(ev),
        }
    }

    fn on_status(&mut self, status: StatusCode) {
        log::debug!("session received status {status:?} in state {:?}", self.state);
        match (status, self.state) {
            (StatusCode::Connect, SessionState::Connecting) => {
                self.set_state(SessionState::ConnectedToDirectory);
                log::info!("session connected to directory server");
                self.notify(Notification::ConnectedToDirectory);
                self.authenticate();
                self.set_state(SessionState::Authenticating);
            }
            (StatusCode::Connect, SessionState::ConnectingToSession) => {
                self.set_state(SessionState::ConnectedToSession);
                log::info!("session connected to session server");
                self.authenticate();
            }
            (StatusCode::Disconnect, SessionState::DisconnectingFromDirectory) => {
                let Some(address) = self.session_address.clone() else {
                    log::error!("no session server address to switch to");
                    self.teardown();
                    self.set_state(SessionState::Disconnected);
                    self.notify(Notification::Disconnected);
                    return;
                };
                if !self.connect_to(Server::Session, address, SessionState::ConnectingToSession) {
                    self.on_fault(DisconnectCause::ExceptionOnConnect);
                }
            }
            (StatusCode::Disconnect, SessionState::DisconnectingFromSession) => {
                let address = self.cfg.directory_address.clone();
                if !self.connect_to(Server::Directory, address, SessionState::Connecting) {
                    self.on_fault(DisconnectCause::ExceptionOnConnect);
                }
            }
            (StatusCode::Disconnect, SessionState::Disconnecting) => {
                self.server = Server::None;
                self.set_state(SessionState::Disconnected);
                log::info!("session disconnected");
                self.notify(Notification::Disconnected);
            }
            (StatusCode::Disconnect, SessionState::Created | SessionState::Disconnected) => {}
            (StatusCode::Connect, _) => {
                log::warn!("unexpected connect status in state {:?}", self.state);
            }
            (status, _) => self.on_fault(status.into()),
        }
    }

    fn on_fault(&mut self, cause: DisconnectCause) {
        let connecting = matches!(
            self.state,
            SessionState::Connecting | SessionState::ConnectingToSession
        );
        log::error!("session lost its connection: {cause:?}");
        self.teardown();
        self.set_state(SessionState::Disconnected);
        if connecting {
            self.notify(Notification::FailedToConnect(cause));
        } else {
            self.notify(Notification::ConnectionLost(cause));
        }
    }

    fn on_operation_response(&mut self, resp: OperationResponse) {
        log::trace!(
            "session received response to {} with code {}",
            resp.code,
            resp.return_code
        );
        match (resp.code, self.server) {
            (op::AUTHENTICATE, _) => self.on_authenticate(resp),
            (op::JOIN_LOBBY, Server::Directory) if resp.is_ok() => {
                self.set_state(SessionState::JoinedLobby);
                self.notify(Notification::JoinedLobby);
            }
            (op::LEAVE_LOBBY, Server::Directory) if resp.is_ok() => {
                self.set_state(SessionState::ConnectedToDirectoryAuthenticated);
                self.notify(Notification::LeftLobby);
            }
            (op::CREATE_GAME | op::JOIN_GAME | op::JOIN_RANDOM_GAME, Server::Directory) => {
                self.on_directory_join(resp)
            }
            (op::CREATE_GAME | op::JOIN_GAME, Server::Session) => self.on_session_join(resp),
            (op::LEAVE, Server::Session) if self.state == SessionState::Leaving => {
                self.cleanup_room();
                log::info!("session left the room");
                self.notify(Notification::LeftRoom);
                self.return_to_directory();
            }
            (code, _) if !resp.is_ok() => {
                log::warn!(
                    "operation {code} failed with {}: {}",
                    resp.return_code,
                    resp.debug_message.as_deref().unwrap_or("")
                );
            }
            _ => {}
        }
    }

    fn on_authenticate(&mut self, resp: OperationResponse) {
        if !resp.is_ok() {
            let message = resp.debug_message.unwrap_or_default();
            log::error!("authentication failed with {}: {message}", resp.return_code);
            let notification = match resp.return_code {
                return_code::CUSTOM_AUTHENTICATION_FAILED => {
                    Notification::CustomAuthenticationFailed(message)
                }
                return_code::MAX_CCU_REACHED => {
                    Notification::ConnectionFailed(DisconnectCause::MaxCcuReached)
                }
                return_code::INVALID_REGION => {
                    Notification::ConnectionFailed(DisconnectCause::InvalidRegion)
                }
                _ => Notification::ConnectionFailed(DisconnectCause::InvalidAuthentication),
            };
            self.disconnect();
            self.notify(notification);
            return;
        }
        match self.server {
            Server::Directory => {
                if let Some(secret) = resp.get(param::SECRET).and_then(Value::as_str) {
                    self.secret = Some(secret.to_owned());
                }
                if self.join_intent.take().is_some() {
                    log::debug!("dropping join intent of a failed session join");
                }
                self.set_state(SessionState::ConnectedToDirectoryAuthenticated);
                if self.cfg.auto_join_lobby {
                    self.queue_operation(op::JOIN_LOBBY, Params::new());
                }
            }
            Server::Session => self.replay_join_intent(),
            Server::None => {}
        }
    }

    fn replay_join_intent(&mut self) {
        let Some(intent) = self.join_intent.clone() else {
            log::warn!("authenticated on session server without a join intent");
            self.return_to_directory();
            return;
        };
        let mut params = Params::new();
        params.insert(
            param::PLAYER_PROPERTIES,
            Value::Dict(self.actors.local().wire_properties()),
        );
        if let Some(name) = intent.room_name() {
            params.insert(param::ROOM_NAME, Value::from(name));
        }
        let code = match &intent {
            JoinIntent::Create { options, .. } => {
                params.insert(param::GAME_PROPERTIES, Value::Dict(options.wire_properties()));
                params.insert(param::CLEANUP_CACHE_ON_LEAVE, Value::Bool(options.auto_cleanup));
                op::CREATE_GAME
            }
            JoinIntent::Join { .. } | JoinIntent::JoinRandom { .. } => op::JOIN_GAME,
        };
        self.set_state(SessionState::Joining);
        self.queue_operation(code, params);
    }

    fn on_directory_join(&mut self, resp: OperationResponse) {
        let Some(intent) = self.join_intent.as_mut() else {
            log::debug!("ignoring join response without a pending join");
            return;
        };
        if !resp.is_ok() {
            let failure = OperationFailure {
                kind: JoinFailure::from(resp.return_code),
                message: resp.debug_message.unwrap_or_default(),
            };
            let notification = intent.failed(failure);
            self.join_intent = None;
            self.notify(notification);
            return;
        }
        let assigned = resp.get(param::ROOM_NAME).and_then(Value::as_str);
        match intent {
            JoinIntent::Create { name, .. } | JoinIntent::JoinRandom { name, .. } => {
                if let Some(assigned) = assigned {
                    *name = Some(assigned.to_owned());
                }
            }
            JoinIntent::Join { .. } => {}
        }
        let Some(address) = resp.get(param::ADDRESS).and_then(Value::as_str) else {
            self.join_intent = None;
            return self.malformed(resp.code, "join response without session server address");
        };
        self.session_address = Some(address.to_owned());
        log::debug!("switching to session server at {address}");
        self.outgoing.clear();
        self.set_state(SessionState::DisconnectingFromDirectory);
        self.transport.disconnect();
    }

    fn on_session_join(&mut self, resp: OperationResponse) {
        let Some(intent) = self.join_intent.take() else {
            log::debug!("ignoring join response without a pending join");
            return;
        };
        if !resp.is_ok() {
            let failure = OperationFailure {
                kind: JoinFailure::from(resp.return_code),
                message: resp.debug_message.clone().unwrap_or_default(),
            };
            self.notify(intent.failed(failure));
            self.return_to_directory();
            return;
        }
        let Some(local_id) = resp.get(param::ACTOR_NR).and_then(Value::as_int) else {
            self.malformed(resp.code, "join response without actor number");
            self.return_to_directory();
            return;
        };
        self.actors.change_local_id(local_id);

        let player_props = resp.get(param::PLAYER_PROPERTIES).and_then(Value::as_table);
        let actor_ids = resp
            .get(param::ACTOR_LIST)
            .and_then(Value::as_int_array)
            .unwrap_or_default();
        for &id in actor_ids {
            if id == local_id {
                continue;
            }
            let props = match i16::try_from(id) {
                Ok(key) => player_props.and_then(|t| t.get(&key)).and_then(Value::as_dict),
                Err(_) => {
                    self.malformed(resp.code, "actor number does not fit a property key");
                    None
                }
            };
            let mut actor = Actor::new(id, false);
            if let Some(props) = props {
                actor.merge_properties(props);
            }
            if !self.actors.add(actor) {
                self.diagnostic(Diagnostic::DuplicateActor(id));
            }
        }

        let name = intent
            .room_name()
            .or_else(|| resp.get(param::ROOM_NAME).and_then(Value::as_str))
            .unwrap_or_default()
            .to_owned();
        let game_props = resp
            .get(param::GAME_PROPERTIES)
            .and_then(Value::as_dict)
            .cloned()
            .unwrap_or_default();
        self.room = Some(Room::from_join(name, &game_props));
        self.actors.elect_master(None);

        let receiving: Vec<Value> = (1..=u8::MAX)
            .filter(|&g| self.groups.is_receiving(g))
            .map(Value::Byte)
            .collect();
        if !receiving.is_empty() {
            let mut params = Params::new();
            params.insert(param::ADD, Value::Array(receiving));
            self.queue_operation(op::CHANGE_GROUPS, params);
        }

        self.set_state(SessionState::Joined);
        log::info!(
            "session joined room as actor {local_id}, master is {:?}",
            self.actors.master_id()
        );
        if let JoinIntent::Create { .. } = intent {
            self.notify(Notification::CreatedRoom);
        }
        self.notify(Notification::JoinedRoom);
    }

    fn on_event(&mut self, ev: EventData) {
        if self.state != SessionState::Joined {
            log::trace!("ignoring event {} in state {:?}", ev.code, self.state);
            return;
        }
        log::trace!("session received event {} from actor {}", ev.code, ev.sender);
        match ev.code {
            event::JOIN => self.on_actor_join(ev),
            event::LEAVE => self.on_actor_leave(ev),
            event::PROPERTIES_CHANGED => self.on_properties_changed(ev),
            event::RPC => self.on_rpc(ev),
            event::SEND_SERIALIZE | event::SEND_SERIALIZE_RELIABLE => self.on_serialize(ev),
            event::INSTANTIATION => self.on_instantiation(ev),
            event::DESTROY => {
                let Some(inst) = Self::target_of(&ev) else {
                    return self.malformed(ev.code, "destroy without target");
                };
                if !self.destroy_local(inst) {
                    self.diagnostic(Diagnostic::DestroyUnknownObject(inst));
                }
            }
            event::DESTROY_PLAYER => {
                let Some(actor) = Self::target_of(&ev) else {
                    return self.malformed(ev.code, "destroy player without target");
                };
                let objects = if actor == -1 {
                    self.registry.all_objects()
                } else {
                    self.registry.objects_owned_by(actor)
                };
                for inst in objects {
                    self.destroy_local(inst);
                }
            }
            event::ASSIGN_MASTER => {
                let Some(id) = ev
                    .content()
                    .and_then(Value::as_table)
                    .and_then(|t| t.get(&KEY_NEW_MASTER))
                    .and_then(Value::as_int)
                else {
                    return self.malformed(ev.code, "assign master without actor");
                };
                if self.actors.master_id() != Some(ev.sender) {
                    log::warn!("ignoring master assignment from non-master {}", ev.sender);
                    return;
                }
                match self.actors.assign_master(id) {
                    Ok(()) => self.notify(Notification::MasterClientSwitched(id)),
                    Err(_) => self.diagnostic(Diagnostic::UnresolvableMaster(id)),
                }
            }
            event::CLOSE_CONNECTION => {
                if self.actors.master_id() != Some(ev.sender) {
                    log::warn!("ignoring close connection from non-master {}", ev.sender);
                    return;
                }
                self.disconnect();
                self.notify(Notification::ConnectionLost(DisconnectCause::ClosedByMaster));
            }
            code if code < event::FIRST_RESERVED => {
                let content = ev.content().cloned().unwrap_or_default();
                self.notify(Notification::CustomEvent {
                    code,
                    sender: ev.sender,
                    content,
                });
            }
            code => self.malformed(code, "unknown event code"),
        }
    }

    fn malformed(&mut self, code: u8, reason: &str) {
        self.diagnostic(Diagnostic::MalformedEvent {
            code,
            reason: reason.to_owned(),
        });
    }
    fn target_of(ev: &EventData) -> Option<i32> {
        ev.content()
            .and_then(Value::as_table)
            .and_then(|t| t.get(&KEY_TARGET))
            .and_then(Value::as_int)
    }
    fn event_actor(ev: &EventData) -> ActorId {
        ev.get(param::ACTOR_NR)
            .and_then(Value::as_int)
            .unwrap_or(ev.sender)
    }

    fn on_actor_join(&mut self, ev: EventData) {
        let id = Self::event_actor(&ev);
        if id == self.actors.local_id() {
            return;
        }
        let mut actor = Actor::new(id, false);
        if let Some(props) = ev.get(param::PLAYER_PROPERTIES).and_then(Value::as_dict) {
            actor.merge_properties(props);
        }
        if !self.actors.add(actor) {
            self.diagnostic(Diagnostic::DuplicateActor(id));
            return;
        }
        log::info!("actor {id} joined the room");
        if self.actors.elect_master(None) {
            if let Some(master) = self.actors.master_id() {
                self.notify(Notification::MasterClientSwitched(master));
            }
        }
        self.notify(Notification::ActorJoined(id));
    }

    fn on_actor_leave(&mut self, ev: EventData) {
        let id = Self::event_actor(&ev);
        if !self.actors.contains(id) || id == self.actors.local_id() {
            log::debug!("leave of unknown actor {id}");
            return;
        }
        // leave cleanup completes before anything else touches the leaver's objects
        if self.room.as_ref().map_or(false, Room::auto_cleanup) {
            for inst in self.registry.objects_owned_by(id) {
                self.destroy_local(inst);
            }
        }
        let switched = self.actors.elect_master(Some(id));
        self.actors.remove(id);
        log::info!("actor {id} left the room");
        self.notify(Notification::ActorLeft(id));
        if switched {
            if let Some(master) = self.actors.master_id() {
                self.notify(Notification::MasterClientSwitched(master));
            }
        }
    }

    fn on_properties_changed(&mut self, ev: EventData) {
        let Some(props) = ev.get(param::PROPERTIES).and_then(Value::as_dict).cloned() else {
            return self.malformed(ev.code, "properties changed without properties");
        };
        let target = ev
            .get(param::TARGET_ACTOR_NR)
            .and_then(Value::as_int)
            .unwrap_or(0);
        if target > 0 {
            let Some(actor) = self.actors.get_mut(target) else {
                log::debug!("properties for unknown actor {target}");
                return;
            };
            actor.merge_properties(&props);
            self.actors.rebuild_snapshot_lists();
            self.notify(Notification::ActorPropertiesChanged {
                actor: target,
                changed: props,
            });
        } else if let Some(room) = self.room.as_mut() {
            room.merge_properties(&props);
            self.notify(Notification::RoomPropertiesChanged(props));
        }
    }

    fn on_rpc(&mut self, ev: EventData) {
        let call = match ev.content().and_then(Value::as_table).map(RpcCall::from_table) {
            Some(Ok(call)) => call,
            Some(Err(e)) => return self.malformed(ev.code, &e.to_string()),
            None => return self.malformed(ev.code, "rpc content is not a table"),
        };
        let Some(method) = call.method_name(&self.cfg.rpc_shortcuts).map(str::to_owned) else {
            let MethodRef::Shortcut(code) = call.method else {
                return;
            };
            return self.diagnostic(Diagnostic::RpcDropped {
                view_id: call.view_id,
                method: String::new(),
                reason: RpcDropReason::UnknownShortcut(code),
            });
        };
        let info = RpcInfo {
            sender: ev.sender,
            timestamp: call.timestamp,
            view_id: call.view_id,
        };
        self.execute_rpc(call.view_id, &method, &call.args, info, Some(call.level_prefix));
        self.drain_deferred_rpcs();
    }

    /// Runs an RPC on a local view. `prefix` is checked against the view for remote calls.
    fn execute_rpc(
        &mut self,
        view_id: ViewId,
        method: &str,
        args: &[Value],
        info: RpcInfo,
        prefix: Option<i16>,
    ) {
        let Some(view) = self.registry.view_mut(view_id) else {
            return self.diagnostic(Diagnostic::RpcDropped {
                view_id,
                method: method.to_owned(),
                reason: RpcDropReason::UnknownView,
            });
        };
        if let Some(prefix) = prefix {
            if view.level_prefix > 0 && prefix != view.level_prefix {
                let reason = RpcDropReason::LevelPrefixMismatch {
                    expected: view.level_prefix,
                    actual: prefix,
                };
                return self.diagnostic(Diagnostic::RpcDropped {
                    view_id,
                    method: method.to_owned(),
                    reason,
                });
            }
            if !self.groups.is_receiving(view.group) {
                log::trace!("dropping rpc {method} for view {view_id} in a muted group");
                return;
            }
        }
        match rpc::dispatch(view, method, args, info, &mut self.deferred_rpcs) {
            Ok(Some(continuation)) => self.continuations.push(continuation),
            Ok(None) => {}
            Err(reason) => self.diagnostic(Diagnostic::RpcDropped {
                view_id,
                method: method.to_owned(),
                reason,
            }),
        }
    }

    fn drain_deferred_rpcs(&mut self) {
        loop {
            let deferred = std::mem::take(&mut self.deferred_rpcs);
            if deferred.is_empty() {
                return;
            }
            for call in deferred {
                let result = match call.destination {
                    RpcDestination::Target(target) => {
                        self.send_rpc(call.view_id, &call.method, target, call.args)
                    }
                    RpcDestination::Actor(actor) => {
                        self.send_rpc_to(call.view_id, &call.method, actor, call.args)
                    }
                };
                if let Err(e) = result {
                    log::warn!("rpc {} queued by a handler failed: {e}", call.method);
                }
            }
        }
    }

    fn on_serialize(&mut self, ev: EventData) {
        let batch = match ev.content().and_then(Value::as_table).map(sync::parse_batch) {
            Some(Ok(batch)) => batch,
            Some(Err(e)) => return self.malformed(ev.code, &e.to_string()),
            None => return self.malformed(ev.code, "serialization content is not a table"),
        };
        let local = self.actors.local_id();
        let master = self.actors.master_id();
        for snapshot in batch.snapshots {
            let snapshot = match snapshot {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    self.malformed(ev.code, &e.to_string());
                    continue;
                }
            };
            let Some(view) = self.registry.view_mut(snapshot.view_id) else {
                log::debug!("snapshot for unknown view {}", snapshot.view_id);
                continue;
            };
            if view.level_prefix > 0 && batch.level_prefix != view.level_prefix {
                log::debug!("snapshot for view {} from another level", view.id);
                continue;
            }
            if !self.groups.is_receiving(view.group) || view.is_controlled_by(local, master) {
                continue;
            }
            match sync::apply_snapshot(view, &snapshot) {
                Ok(()) => {}
                Err(Error::SnapshotNotReady(id)) => self.diagnostic(Diagnostic::SnapshotNotReady(id)),
                Err(e) => self.malformed(ev.code, &e.to_string()),
            }
        }
    }

    fn on_instantiation(&mut self, ev: EventData) {
        let record = match ev
            .content()
            .and_then(Value::as_table)
            .map(|t| crate::registry::InstantiationRecord::from_table(t, ev.sender))
        {
            Some(Ok(record)) => record,
            Some(Err(e)) => return self.malformed(ev.code, &e.to_string()),
            None => return self.malformed(ev.code, "instantiation content is not a table"),
        };
        if !self.groups.is_receiving(record.group) {
            log::trace!("skipping instantiation of {} in a muted group", record.prefab);
            return;
        }
        let inst = record.instantiation_id;
        let Some(pool) = self.cfg.prefab_pool.as_deref_mut() else {
            return self.diagnostic(Diagnostic::UnknownPrefab(record.prefab));
        };
        match self.registry.construct(record, pool) {
            Ok(collisions) => {
                for id in collisions {
                    self.diagnostic(Diagnostic::ViewIdCollision(id));
                }
                self.notify(Notification::ObjectInstantiated(inst));
            }
            Err(Error::ViewCountMismatch {
                prefab,
                expected,
                actual,
            }) => self.diagnostic(Diagnostic::ViewCountMismatch {
                prefab,
                expected,
                actual,
            }),
            Err(Error::UnknownPrefab(prefab)) => self.diagnostic(Diagnostic::UnknownPrefab(prefab)),
            Err(e) => self.malformed(ev.code, &e.to_string()),
        }
    }

    fn destroy_local(&mut self, inst: ViewId) -> bool {
        let Some(object) = self.registry.remove_object(inst) else {
            return false;
        };
        if let Some(pool) = self.cfg.prefab_pool.as_deref_mut() {
            pool.destroy(inst, &object.view_ids);
        }
        self.notify(Notification::ObjectDestroyed(inst));
        true
    }

    fn serialize_views(&mut self) {
        let local = self.actors.local_id();
        let master = self.actors.master_id();
        let mut batch = SerializationBatch::new(self.transport.server_time(), self.level_prefix);
        for view in self.registry.views_mut() {
            if !view.active || !view.is_controlled_by(local, master) {
                continue;
            }
            if !self.groups.is_sending(view.group) {
                continue;
            }
            if let Some((reliable, snapshot)) = sync::serialize_view(view, &self.cfg.precision) {
                batch.push(view.group, reliable, snapshot);
            }
        }
        for msg in batch.into_messages() {
            let code = if msg.reliable {
                event::SEND_SERIALIZE_RELIABLE
            } else {
                event::SEND_SERIALIZE
            };
            let options = RaiseEventOptions::others().group(msg.group);
            self.queue_event(code, Value::Table(msg.content), msg.reliable, options);
        }
    }

    fn require_joined(&self) -> Result<()> {
        if self.state != SessionState::Joined {
            return Err(Error::NotInRoom);
        }
        Ok(())
    }
    fn require_directory(&self) -> Result<()> {
        let authenticated = matches!(
            self.state,
            SessionState::ConnectedToDirectoryAuthenticated | SessionState::JoinedLobby
        );
        if !authenticated || self.join_intent.is_some() {
            return Err(Error::InvalidState(self.state));
        }
        Ok(())
    }
    fn require_master(&self) -> Result<()> {
        if !self.actors.is_local_master() {
            return Err(Error::NotMasterClient);
        }
        Ok(())
    }

    /// Joins the lobby of the directory server.
    pub fn join_lobby(&mut self) -> Result<()> {
        if self.state != SessionState::ConnectedToDirectoryAuthenticated {
            return Err(Error::InvalidState(self.state));
        }
        self.queue_operation(op::JOIN_LOBBY, Params::new());
        Ok(())
    }
    pub fn leave_lobby(&mut self) -> Result<()> {
        if self.state != SessionState::JoinedLobby {
            return Err(Error::InvalidState(self.state));
        }
        self.queue_operation(op::LEAVE_LOBBY, Params::new());
        Ok(())
    }

    /// Creates a room. Without a name the server picks one.
    pub fn create_room(&mut self, name: Option<&str>, options: RoomOptions) -> Result<()> {
        self.require_directory()?;
        let mut params = Params::new();
        if let Some(name) = name {
            params.insert(param::ROOM_NAME, Value::from(name));
        }
        params.insert(param::GAME_PROPERTIES, Value::Dict(options.wire_properties()));
        self.join_intent = Some(JoinIntent::Create {
            name: name.map(str::to_owned),
            options,
        });
        self.queue_operation(op::CREATE_GAME, params);
        Ok(())
    }
    pub fn join_room(&mut self, name: &str) -> Result<()> {
        self.require_directory()?;
        let mut params = Params::new();
        params.insert(param::ROOM_NAME, Value::from(name));
        self.join_intent = Some(JoinIntent::Join {
            name: name.to_owned(),
        });
        self.queue_operation(op::JOIN_GAME, params);
        Ok(())
    }
    /// Joins any open room whose properties contain `filter`.
    pub fn join_random_room(&mut self, filter: Properties) -> Result<()> {
        self.require_directory()?;
        let mut params = Params::new();
        params.insert(param::GAME_PROPERTIES, Value::Dict(filter));
        self.join_intent = Some(JoinIntent::JoinRandom { name: None });
        self.queue_operation(op::JOIN_RANDOM_GAME, params);
        Ok(())
    }
    /// Leaves the current room and returns to the directory server.
    pub fn leave_room(&mut self) -> Result<()> {
        self.require_joined()?;
        self.queue_operation(op::LEAVE, Params::new());
        self.set_state(SessionState::Leaving);
        Ok(())
    }

    /// Sends an RPC on `view_id`.
    pub fn rpc(&mut self, view_id: ViewId, method: &str, target: RpcTarget, args: Vec<Value>) -> Result<()> {
        self.send_rpc(view_id, method, target, args)?;
        self.drain_deferred_rpcs();
        Ok(())
    }
    /// Sends an RPC to a single actor. Calls to the local actor run at once.
    pub fn rpc_to(&mut self, view_id: ViewId, method: &str, actor: ActorId, args: Vec<Value>) -> Result<()> {
        self.send_rpc_to(view_id, method, actor, args)?;
        self.drain_deferred_rpcs();
        Ok(())
    }

    fn rpc_content(&self, view: &View, method: &str, args: Vec<Value>) -> Value {
        let call = RpcCall::new(
            view.id,
            self.level_prefix,
            self.transport.server_time(),
            method,
            args,
            &self.cfg.rpc_shortcuts,
        );
        Value::Table(call.to_table())
    }
    fn local_rpc_info(&self, view_id: ViewId) -> RpcInfo {
        RpcInfo {
            sender: self.actors.local_id(),
            timestamp: self.transport.server_time(),
            view_id,
        }
    }

    fn send_rpc(&mut self, view_id: ViewId, method: &str, target: RpcTarget, args: Vec<Value>) -> Result<()> {
        self.require_joined()?;
        let view = self.registry.view(view_id).ok_or(Error::UnknownView(view_id))?;
        let group = view.group;
        let buffer = Self::cache_for(view.owner_id);
        let content = self.rpc_content(view, method, args.clone());
        let execute_locally = match target {
            RpcTarget::All | RpcTarget::AllBuffered => true,
            RpcTarget::MasterClient => self.actors.is_local_master(),
            _ => false,
        };
        let options = match target {
            RpcTarget::All | RpcTarget::Others => Some(RaiseEventOptions::others().group(group)),
            RpcTarget::MasterClient if execute_locally => None,
            RpcTarget::MasterClient => {
                Some(RaiseEventOptions::others().receivers(ReceiverGroup::MasterClient))
            }
            RpcTarget::AllBuffered | RpcTarget::OthersBuffered => {
                Some(RaiseEventOptions::others().cached(buffer))
            }
            RpcTarget::AllViaServer => Some(RaiseEventOptions::all().group(group)),
            RpcTarget::AllBufferedViaServer => Some(RaiseEventOptions::all().cached(buffer)),
        };
        if let Some(options) = options {
            self.queue_event(event::RPC, content, true, options);
        }
        if execute_locally {
            let info = self.local_rpc_info(view_id);
            self.execute_rpc(view_id, method, &args, info, None);
        }
        Ok(())
    }

    fn send_rpc_to(&mut self, view_id: ViewId, method: &str, actor: ActorId, args: Vec<Value>) -> Result<()> {
        self.require_joined()?;
        let view = self.registry.view(view_id).ok_or(Error::UnknownView(view_id))?;
        if actor == self.actors.local_id() {
            let info = self.local_rpc_info(view_id);
            self.execute_rpc(view_id, method, &args, info, None);
            return Ok(());
        }
        if !self.actors.contains(actor) {
            return Err(Error::UnknownActor(actor));
        }
        let content = self.rpc_content(view, method, args);
        self.queue_event(event::RPC, content, true, RaiseEventOptions::others().to(vec![actor]));
        Ok(())
    }

    /// Instantiates `prefab` owned by the local actor. Returns the instantiation id.
    pub fn instantiate(
        &mut self,
        prefab: &str,
        position: Vector3,
        rotation: Quaternion,
        group: u8,
        data: Option<Vec<Value>>,
    ) -> Result<ViewId> {
        self.require_joined()?;
        let owner = self.actors.local_id();
        self.instantiate_as(owner, prefab, position, rotation, group, data)
    }
    /// Instantiates `prefab` as a room object, which outlives its creator. Master only.
    pub fn instantiate_room_object(
        &mut self,
        prefab: &str,
        position: Vector3,
        rotation: Quaternion,
        group: u8,
        data: Option<Vec<Value>>,
    ) -> Result<ViewId> {
        self.require_joined()?;
        self.require_master()?;
        self.instantiate_as(ROOM_OWNER_ID, prefab, position, rotation, group, data)
    }

    fn instantiate_as(
        &mut self,
        owner: ActorId,
        prefab: &str,
        position: Vector3,
        rotation: Quaternion,
        group: u8,
        data: Option<Vec<Value>>,
    ) -> Result<ViewId> {
        let timestamp = self.transport.server_time();
        let creator = self.actors.local_id();
        let Some(pool) = self.cfg.prefab_pool.as_deref_mut() else {
            return Err(Error::UnknownPrefab(prefab.to_owned()));
        };
        let view_count = pool
            .view_count(prefab)
            .ok_or_else(|| Error::UnknownPrefab(prefab.to_owned()))?;
        let mut record = self
            .registry
            .prepare_instantiation(prefab, view_count, owner, creator, timestamp)?;
        record.position = position;
        record.rotation = rotation;
        record.group = group;
        record.data = data;
        record.level_prefix = self.level_prefix;
        let inst = record.instantiation_id;
        let content = Value::Table(record.to_table());
        let collisions = self.registry.construct(record, pool)?;
        for id in collisions {
            self.diagnostic(Diagnostic::ViewIdCollision(id));
        }
        self.queue_event(
            event::INSTANTIATION,
            content,
            true,
            RaiseEventOptions::others().cached(Self::cache_for(owner)),
        );
        log::debug!("instantiated {prefab} as {inst}");
        self.notify(Notification::ObjectInstantiated(inst));
        Ok(inst)
    }

    /// Room-owned traffic stays cached after its sender leaves.
    fn cache_for(owner: ActorId) -> CacheOp {
        if owner == ROOM_OWNER_ID {
            CacheOp::AddToRoomCacheGlobal
        } else {
            CacheOp::AddToRoomCache
        }
    }

    fn remove_view_rpcs(&mut self, view_id: ViewId) {
        let mut filter = Table::new();
        filter.insert(KEY_TARGET, Value::Int(view_id));
        self.queue_event(
            event::RPC,
            Value::Table(filter),
            true,
            RaiseEventOptions::others().cached(CacheOp::RemoveFromRoomCache),
        );
    }

    /// Destroys a network-instantiated object everywhere.
    ///
    /// Allowed for the owner, and for the master on room objects or objects whose owner left.
    pub fn destroy(&mut self, inst: ViewId) -> Result<()> {
        self.require_joined()?;
        let object = self.registry.check_destroy_permission(inst, &self.actors)?.clone();

        let mut filter = Table::new();
        filter.insert(KEY_INSTANTIATION_ID, Value::Int(inst));
        self.queue_event(
            event::INSTANTIATION,
            Value::Table(filter),
            true,
            RaiseEventOptions::others()
                .cached(CacheOp::RemoveFromRoomCache)
                .to(vec![object.creator]),
        );
        for &view_id in &object.view_ids {
            self.remove_view_rpcs(view_id);
        }
        let mut content = Table::new();
        content.insert(KEY_TARGET, Value::Int(inst));
        self.queue_event(event::DESTROY, Value::Table(content), true, RaiseEventOptions::others());
        self.destroy_local(inst);
        Ok(())
    }

    /// Destroys every object of `actor` and purges its cached events. Allowed for the actor
    /// itself and for the master.
    pub fn destroy_player_objects(&mut self, actor: ActorId) -> Result<()> {
        self.require_joined()?;
        if actor != self.actors.local_id() {
            self.require_master()?;
        }
        self.queue_event(
            event::CACHE_SLICE_ALL,
            Value::Null,
            true,
            RaiseEventOptions::others()
                .cached(CacheOp::RemoveFromRoomCache)
                .to(vec![actor]),
        );
        let mut content = Table::new();
        content.insert(KEY_TARGET, Value::Int(actor));
        self.queue_event(
            event::DESTROY_PLAYER,
            Value::Table(content),
            true,
            RaiseEventOptions::others(),
        );
        for inst in self.registry.objects_owned_by(actor) {
            self.destroy_local(inst);
        }
        Ok(())
    }

    /// Destroys every object in the room and wipes the room's event cache. Master only.
    pub fn destroy_all(&mut self) -> Result<()> {
        self.require_joined()?;
        self.require_master()?;
        let pending = self.registry.pending_count();
        if pending > 0 {
            self.diagnostic(Diagnostic::PendingInstantiations(pending));
        }
        self.queue_event(
            event::CACHE_SLICE_ALL,
            Value::Null,
            true,
            RaiseEventOptions::others().cached(CacheOp::RemoveFromRoomCache),
        );
        let mut content = Table::new();
        content.insert(KEY_TARGET, Value::Int(-1));
        self.queue_event(
            event::DESTROY_PLAYER,
            Value::Table(content),
            true,
            RaiseEventOptions::others(),
        );
        for inst in self.registry.all_objects() {
            self.destroy_local(inst);
        }
        Ok(())
    }

    /// Hands the master role to `id`. With `propagate` every client, this one included, applies
    /// the switch when the server delivers it; without it only the local view changes.
    pub fn set_master_client(&mut self, id: ActorId, propagate: bool) -> Result<()> {
        self.require_joined()?;
        self.actors.check_master_handoff(id)?;
        if propagate {
            let mut content = Table::new();
            content.insert(KEY_NEW_MASTER, Value::Int(id));
            self.queue_event(event::ASSIGN_MASTER, Value::Table(content), true, RaiseEventOptions::all());
        } else {
            self.actors.assign_master(id)?;
            self.notify(Notification::MasterClientSwitched(id));
        }
        Ok(())
    }

    /// Forces `actor` to disconnect. Master only.
    pub fn close_connection(&mut self, actor: ActorId) -> Result<()> {
        self.require_joined()?;
        self.require_master()?;
        if actor == self.actors.local_id() || !self.actors.contains(actor) {
            return Err(Error::UnknownActor(actor));
        }
        self.queue_event(
            event::CLOSE_CONNECTION,
            Value::Null,
            true,
            RaiseEventOptions::others().to(vec![actor]),
        );
        Ok(())
    }

    /// Raises an application event. Codes from 200 up are reserved.
    pub fn raise_event(&mut self, code: u8, content: Value, options: RaiseEventOptions) -> Result<()> {
        self.require_joined()?;
        if code >= event::FIRST_RESERVED {
            return Err(Error::ReservedEventCode(code));
        }
        self.queue_event(code, content, true, options);
        Ok(())
    }

    fn send_properties(&mut self, actor: Option<ActorId>, props: Properties) {
        let mut params = Params::new();
        params.insert(param::PROPERTIES, Value::Dict(props));
        params.insert(param::BROADCAST, Value::Bool(true));
        if let Some(actor) = actor {
            params.insert(param::ACTOR_NR, Value::Int(actor));
        }
        self.queue_operation(op::SET_PROPERTIES, params);
    }

    /// Merges `props` into an actor's properties here and on the server. Null values delete keys.
    pub fn set_actor_properties(&mut self, actor: ActorId, props: Properties) -> Result<()> {
        self.require_joined()?;
        let target = self.actors.get_mut(actor).ok_or(Error::UnknownActor(actor))?;
        target.merge_properties(&props);
        self.actors.rebuild_snapshot_lists();
        self.send_properties(Some(actor), props.clone());
        self.notify(Notification::ActorPropertiesChanged {
            actor,
            changed: props,
        });
        Ok(())
    }
    /// Merges `props` into the room's properties here and on the server.
    pub fn set_room_properties(&mut self, props: Properties) -> Result<()> {
        self.require_joined()?;
        let room = self.room.as_mut().ok_or(Error::NotInRoom)?;
        room.merge_properties(&props);
        self.send_properties(None, props.clone());
        self.notify(Notification::RoomPropertiesChanged(props));
        Ok(())
    }
    pub fn set_local_name(&mut self, name: &str) {
        let mut props = Properties::new();
        props.insert(crate::protocol::prop::PLAYER_NAME.to_owned(), Value::from(name));
        self.actors.local_mut().merge_properties(&props);
        self.actors.rebuild_snapshot_lists();
        if self.state == SessionState::Joined {
            let local = self.actors.local_id();
            self.send_properties(Some(local), props);
        }
    }

    /// Subscribes to or unsubscribes from an interest group. Group 0 cannot be muted.
    pub fn set_receiving_group(&mut self, group: u8, enabled: bool) {
        if !self.groups.set_receiving(group, enabled) || self.state != SessionState::Joined {
            return;
        }
        let key = if enabled { param::ADD } else { param::REMOVE };
        let mut params = Params::new();
        params.insert(key, Value::Array(vec![Value::Byte(group)]));
        self.queue_operation(op::CHANGE_GROUPS, params);
    }
    /// Enables or disables synchronization of views in `group`.
    pub fn set_sending_group(&mut self, group: u8, enabled: bool) {
        self.groups.set_sending(group, enabled);
    }
    pub fn set_level_prefix(&mut self, prefix: i16) {
        self.level_prefix = prefix;
    }
    /// Pauses or resumes dispatching. While paused, [`tick`](Session::tick) only keeps the
    /// connection alive.
    pub fn set_message_queue_running(&mut self, running: bool) {
        log::debug!("message queue running: {running}");
        self.message_queue_running = running;
    }

    /// Registers a view that is not network-instantiated, e.g. one placed in a scene.
    pub fn register_view(&mut self, view: View) {
        let id = view.id;
        if self.registry.register_view(view).is_some() {
            self.diagnostic(Diagnostic::ViewIdCollision(id));
        }
    }
    pub fn unregister_view(&mut self, id: ViewId) -> Option<View> {
        self.registry.unregister_view(id)
    }
    /// Allocates a free view id owned by the local actor.
    pub fn allocate_view_id(&mut self) -> Result<ViewId> {
        self.require_joined()?;
        let owner = self.actors.local_id();
        self.registry.allocate_view_id(owner)
    }
    /// Reserves a view id of the local actor, or of the room if `room_owned` is set.
    pub fn reserve_view_id(&mut self, room_owned: bool) -> Result<ViewId> {
        self.require_joined()?;
        let owner = if room_owned {
            ROOM_OWNER_ID
        } else {
            self.actors.local_id()
        };
        self.registry.reserve_view_id(owner)
    }
    pub fn release_view_id(&mut self, id: ViewId) -> bool {
        self.registry.release_view_id(id)
    }

    /// Gets the current state of the session.
    pub fn state(&self) -> SessionState {
        self.state
    }
    pub fn is_joined(&self) -> bool {
        self.state == SessionState::Joined
    }
    pub fn actors(&self) -> &ActorDirectory {
        &self.actors
    }
    pub fn local_actor_id(&self) -> ActorId {
        self.actors.local_id()
    }
    pub fn is_master_client(&self) -> bool {
        self.actors.is_local_master()
    }
    pub fn room(&self) -> Option<&Room> {
        self.room.as_ref()
    }
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
    pub fn view(&self, id: ViewId) -> Option<&View> {
        self.registry.view(id)
    }
    pub fn view_mut(&mut self, id: ViewId) -> Option<&mut View> {
        self.registry.view_mut(id)
    }
    pub fn interest_groups(&self) -> &InterestGroups {
        &self.groups
    }
    pub fn level_prefix(&self) -> i16 {
        self.level_prefix
    }
    pub fn server_time(&self) -> i32 {
        self.transport.server_time()
    }
    pub fn context(&self) -> &Ctx {
        &self.cfg.context
    }
    pub fn context_mut(&mut self) -> &mut Ctx {
        &mut self.cfg.context
    }
    pub fn transport(&self) -> &T {
        &self.transport
    }
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }
}
