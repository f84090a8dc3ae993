//! Remote procedure calls on views.
//!
//! Handlers are registered explicitly per behavior with a [`Signature`] describing which
//! argument lists they accept. Incoming calls resolve to exactly one handler or are dropped.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::protocol::event;
use crate::value::{Table, Value};
use crate::view::{View, ViewId};
use crate::ActorId;

const KEY_VIEW_ID: i16 = 0;
const KEY_PREFIX: i16 = 1;
const KEY_TIMESTAMP: i16 = 2;
const KEY_METHOD: i16 = 3;
const KEY_ARGS: i16 = 4;
const KEY_SHORTCUT: i16 = 5;

/// Who receives an outgoing RPC and whether the server buffers it for late joiners.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcTarget {
    /// Executed locally at once and sent to the others.
    All,
    Others,
    /// Executed locally if the local actor is master, else sent to the master.
    MasterClient,
    AllBuffered,
    OthersBuffered,
    /// Sent to everyone, the sender included; executed locally on the server echo.
    AllViaServer,
    AllBufferedViaServer,
}

impl RpcTarget {
    pub fn is_buffered(self) -> bool {
        matches!(
            self,
            RpcTarget::AllBuffered | RpcTarget::OthersBuffered | RpcTarget::AllBufferedViaServer
        )
    }
}

/// Fixed bijection between method names and single-byte shortcuts.
///
/// Codes are assigned in insertion order; every client of a build must use the same table.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RpcShortcuts {
    by_name: HashMap<String, u8>,
    names: Vec<String>,
}

impl RpcShortcuts {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut table = Self::default();
        for name in names {
            let name = name.into();
            if table.by_name.contains_key(&name) {
                log::warn!("duplicate rpc shortcut name {name:?} ignored");
                continue;
            }
            let Ok(code) = u8::try_from(table.names.len()) else {
                log::warn!("rpc shortcut table is full, {name:?} sent by name");
                break;
            };
            table.by_name.insert(name.clone(), code);
            table.names.push(name);
        }
        table
    }
    pub fn code(&self, name: &str) -> Option<u8> {
        self.by_name.get(name).copied()
    }
    pub fn name(&self, code: u8) -> Option<&str> {
        self.names.get(code as usize).map(String::as_str)
    }
    pub fn len(&self) -> usize {
        self.names.len()
    }
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

/// The method part of an encoded call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MethodRef {
    Name(String),
    Shortcut(u8),
}

/// One RPC as carried by the RPC event.
#[derive(Debug, Clone, PartialEq)]
pub struct RpcCall {
    pub view_id: ViewId,
    pub level_prefix: i16,
    pub timestamp: i32,
    pub method: MethodRef,
    pub args: Vec<Value>,
}

impl RpcCall {
    pub fn new(
        view_id: ViewId,
        level_prefix: i16,
        timestamp: i32,
        method: &str,
        args: Vec<Value>,
        shortcuts: &RpcShortcuts,
    ) -> Self {
        let method = match shortcuts.code(method) {
            Some(code) => MethodRef::Shortcut(code),
            None => MethodRef::Name(method.to_owned()),
        };
        Self {
            view_id,
            level_prefix,
            timestamp,
            method,
            args,
        }
    }

    /// Resolves the method name. The shortcut takes precedence over a literal name.
    pub fn method_name<'a>(&'a self, shortcuts: &'a RpcShortcuts) -> Option<&'a str> {
        match &self.method {
            MethodRef::Shortcut(code) => shortcuts.name(*code),
            MethodRef::Name(name) => Some(name),
        }
    }

    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.insert(KEY_VIEW_ID, Value::Int(self.view_id));
        if self.level_prefix > 0 {
            table.insert(KEY_PREFIX, Value::Short(self.level_prefix));
        }
        table.insert(KEY_TIMESTAMP, Value::Int(self.timestamp));
        match &self.method {
            MethodRef::Name(name) => {
                table.insert(KEY_METHOD, Value::String(name.clone()));
            }
            MethodRef::Shortcut(code) => {
                table.insert(KEY_SHORTCUT, Value::Byte(*code));
            }
        }
        if !self.args.is_empty() {
            table.insert(KEY_ARGS, Value::Array(self.args.clone()));
        }
        table
    }

    pub fn from_table(table: &Table) -> Result<Self> {
        let malformed = |reason| Error::MalformedEvent {
            code: event::RPC,
            reason,
        };
        let view_id = table
            .get(&KEY_VIEW_ID)
            .and_then(Value::as_int)
            .ok_or_else(|| malformed("rpc without view id"))?;
        let method = match (
            table.get(&KEY_SHORTCUT).and_then(Value::as_byte),
            table.get(&KEY_METHOD).and_then(Value::as_str),
        ) {
            (Some(code), _) => MethodRef::Shortcut(code),
            (None, Some(name)) => MethodRef::Name(name.to_owned()),
            (None, None) => return Err(malformed("rpc without method")),
        };
        let args = match table.get(&KEY_ARGS) {
            None => Vec::new(),
            Some(Value::Array(args)) => args.clone(),
            Some(_) => return Err(malformed("rpc arguments are not an array")),
        };
        Ok(Self {
            view_id,
            level_prefix: table.get(&KEY_PREFIX).and_then(Value::as_short).unwrap_or(0),
            timestamp: table.get(&KEY_TIMESTAMP).and_then(Value::as_int).unwrap_or(0),
            method,
            args,
        })
    }
}

/// Argument type accepted by a handler parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    Bool,
    Byte,
    Short,
    Int,
    Long,
    Float,
    Double,
    String,
    Vector3,
    Quaternion,
    Array,
    IntArray,
    Table,
    Dict,
    Custom,
}

impl ArgKind {
    /// Null matches any kind that can be absent.
    pub fn accepts(self, value: &Value) -> bool {
        match value {
            Value::Null => matches!(
                self,
                ArgKind::String
                    | ArgKind::Array
                    | ArgKind::IntArray
                    | ArgKind::Table
                    | ArgKind::Dict
                    | ArgKind::Custom
            ),
            Value::Bool(_) => self == ArgKind::Bool,
            Value::Byte(_) => self == ArgKind::Byte,
            Value::Short(_) => self == ArgKind::Short,
            Value::Int(_) => self == ArgKind::Int,
            Value::Long(_) => self == ArgKind::Long,
            Value::Float(_) => self == ArgKind::Float,
            Value::Double(_) => self == ArgKind::Double,
            Value::String(_) => self == ArgKind::String,
            Value::Vector3(_) => self == ArgKind::Vector3,
            Value::Quaternion(_) => self == ArgKind::Quaternion,
            Value::Array(_) => self == ArgKind::Array,
            Value::IntArray(_) => self == ArgKind::IntArray,
            Value::Table(_) => self == ArgKind::Table,
            Value::Dict(_) => self == ArgKind::Dict,
            Value::Custom { .. } => self == ArgKind::Custom,
        }
    }
}

/// Which argument lists a handler accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signature {
    Exact(Vec<ArgKind>),
    /// Exact parameters followed by a trailing [`RpcInfo`] parameter.
    ExactWithInfo(Vec<ArgKind>),
    /// A single parameter receiving the whole argument array.
    CatchAll,
}

impl Signature {
    fn accepts(&self, args: &[Value]) -> bool {
        match self {
            Signature::Exact(kinds) | Signature::ExactWithInfo(kinds) => {
                kinds.len() == args.len()
                    && kinds.iter().zip(args).all(|(kind, arg)| kind.accepts(arg))
            }
            Signature::CatchAll => true,
        }
    }
}

/// Metadata about an incoming call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RpcInfo {
    pub sender: ActorId,
    pub timestamp: i32,
    pub view_id: ViewId,
}

/// Destination of an RPC issued from inside a handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcDestination {
    Target(RpcTarget),
    Actor(ActorId),
}

/// An RPC queued by a handler; sent by the session after the current dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredRpc {
    pub view_id: ViewId,
    pub method: String,
    pub destination: RpcDestination,
    pub args: Vec<Value>,
}

pub struct RpcContext<'a> {
    pub args: &'a [Value],
    pub info: RpcInfo,
    deferred: &'a mut Vec<DeferredRpc>,
}

impl RpcContext<'_> {
    pub fn rpc(&mut self, view_id: ViewId, method: &str, target: RpcTarget, args: Vec<Value>) {
        self.deferred.push(DeferredRpc {
            view_id,
            method: method.to_owned(),
            destination: RpcDestination::Target(target),
            args,
        });
    }
    pub fn rpc_to(&mut self, view_id: ViewId, method: &str, actor: ActorId, args: Vec<Value>) {
        self.deferred.push(DeferredRpc {
            view_id,
            method: method.to_owned(),
            destination: RpcDestination::Actor(actor),
            args,
        });
    }
}

/// A resumable computation returned by a handler. Called once per tick with the current
/// time until it returns true.
pub type Continuation = Box<dyn FnMut(f64) -> bool>;

type Handler = Box<dyn FnMut(&mut RpcContext<'_>) -> Option<Continuation>>;

struct RpcMethod {
    name: String,
    signature: Signature,
    handler: Handler,
}

/// A named set of RPC handlers attached to a view.
pub struct RpcBehavior {
    name: String,
    methods: Vec<RpcMethod>,
}

impl RpcBehavior {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            methods: Vec::new(),
        }
    }
    pub fn method<F>(mut self, name: impl Into<String>, signature: Signature, handler: F) -> Self
    where
        F: FnMut(&mut RpcContext<'_>) -> Option<Continuation> + 'static,
    {
        self.methods.push(RpcMethod {
            name: name.into(),
            signature,
            handler: Box::new(handler),
        });
        self
    }
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Debug for RpcBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let methods: Vec<_> = self.methods.iter().map(|m| &m.name).collect();
        f.debug_struct("RpcBehavior")
            .field("name", &self.name)
            .field("methods", &methods)
            .finish()
    }
}

/// Why an incoming RPC was not executed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcDropReason {
    UnknownView,
    UnknownShortcut(u8),
    LevelPrefixMismatch { expected: i16, actual: i16 },
    NoSuchMethod,
    NoOverload(usize),
    Ambiguous(usize),
}

impl fmt::Display for RpcDropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RpcDropReason::UnknownView => write!(f, "no view with this id"),
            RpcDropReason::UnknownShortcut(code) => write!(f, "unknown shortcut {code}"),
            RpcDropReason::LevelPrefixMismatch { expected, actual } => {
                write!(f, "level prefix {actual} does not match {expected}")
            }
            RpcDropReason::NoSuchMethod => write!(f, "no such method"),
            RpcDropReason::NoOverload(n) => write!(f, "no overload with {n} args"),
            RpcDropReason::Ambiguous(n) => write!(f, "{n} handlers match"),
        }
    }
}

fn resolve(
    behaviors: &[RpcBehavior],
    method: &str,
    args: &[Value],
) -> std::result::Result<(usize, usize), RpcDropReason> {
    let mut named = 0;
    let mut found = Vec::new();
    for (b, behavior) in behaviors.iter().enumerate() {
        for (m, candidate) in behavior.methods.iter().enumerate() {
            if candidate.name != method {
                continue;
            }
            named += 1;
            if candidate.signature.accepts(args) {
                found.push((b, m));
            }
        }
    }
    match found.as_slice() {
        [single] => Ok(*single),
        [] if named == 0 => Err(RpcDropReason::NoSuchMethod),
        [] => Err(RpcDropReason::NoOverload(args.len())),
        many => Err(RpcDropReason::Ambiguous(many.len())),
    }
}

/// Invokes the single handler on `view` matching `method` and `args`.
pub(crate) fn dispatch(
    view: &mut View,
    method: &str,
    args: &[Value],
    info: RpcInfo,
    deferred: &mut Vec<DeferredRpc>,
) -> std::result::Result<Option<Continuation>, RpcDropReason> {
    let (b, m) = resolve(&view.behaviors, method, args)?;
    log::trace!("rpc {method} on view {} from actor {}", view.id, info.sender);
    let mut ctx = RpcContext {
        args,
        info,
        deferred,
    };
    Ok((view.behaviors[b].methods[m].handler)(&mut ctx))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::view::ViewComponents;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<String>>>;

    fn recorder(log: &Log, tag: &'static str) -> impl FnMut(&mut RpcContext<'_>) -> Option<Continuation> {
        let log = log.clone();
        move |ctx| {
            log.borrow_mut().push(format!("{tag}:{:?}", ctx.args));
            None
        }
    }

    fn info() -> RpcInfo {
        RpcInfo {
            sender: 2,
            timestamp: 100,
            view_id: 1001,
        }
    }

    fn view_with(behaviors: Vec<RpcBehavior>) -> View {
        let mut components = ViewComponents::new();
        for b in behaviors {
            components = components.behavior(b);
        }
        View::new(1001, components)
    }

    #[test]
    fn exact_match_invokes_once() {
        let log = Log::default();
        let mut view = view_with(vec![RpcBehavior::new("player")
            .method("Foo", Signature::Exact(vec![ArgKind::Int]), recorder(&log, "int"))
            .method("Foo", Signature::Exact(vec![ArgKind::String]), recorder(&log, "str"))]);
        let mut deferred = Vec::new();
        dispatch(&mut view, "Foo", &[Value::Int(3)], info(), &mut deferred).unwrap();
        assert_eq!(*log.borrow(), vec!["int:[Int(3)]".to_owned()]);
    }

    #[test]
    fn info_and_catch_all_signatures() {
        let log = Log::default();
        let seen = Rc::new(RefCell::new(None));
        let seen_in = seen.clone();
        let mut view = view_with(vec![RpcBehavior::new("b")
            .method(
                "Hit",
                Signature::ExactWithInfo(vec![ArgKind::Float]),
                move |ctx| {
                    *seen_in.borrow_mut() = Some(ctx.info);
                    None
                },
            )
            .method("Any", Signature::CatchAll, recorder(&log, "any"))]);
        let mut deferred = Vec::new();
        dispatch(&mut view, "Hit", &[Value::Float(1.5)], info(), &mut deferred).unwrap();
        assert_eq!(*seen.borrow(), Some(info()));
        dispatch(
            &mut view,
            "Any",
            &[Value::Int(1), Value::from("x")],
            info(),
            &mut deferred,
        )
        .unwrap();
        assert_eq!(log.borrow().len(), 1);
    }

    #[test]
    fn zero_and_many_matches_invoke_nothing() {
        let log = Log::default();
        let mut view = view_with(vec![
            RpcBehavior::new("a").method("Foo", Signature::Exact(vec![ArgKind::Int]), recorder(&log, "a")),
            RpcBehavior::new("b").method("Foo", Signature::CatchAll, recorder(&log, "b")),
        ]);
        let mut deferred = Vec::new();
        assert_eq!(
            dispatch(&mut view, "Foo", &[Value::Int(1)], info(), &mut deferred).err(),
            Some(RpcDropReason::Ambiguous(2))
        );
        assert_eq!(
            dispatch(&mut view, "Bar", &[], info(), &mut deferred).err(),
            Some(RpcDropReason::NoSuchMethod)
        );

        let mut view = view_with(vec![RpcBehavior::new("a").method(
            "Foo",
            Signature::Exact(vec![ArgKind::Int]),
            recorder(&log, "a"),
        )]);
        assert_eq!(
            dispatch(&mut view, "Foo", &[Value::Bool(true), Value::Int(1)], info(), &mut deferred).err(),
            Some(RpcDropReason::NoOverload(2))
        );
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn null_matches_reference_kinds_only() {
        assert!(ArgKind::String.accepts(&Value::Null));
        assert!(ArgKind::Array.accepts(&Value::Null));
        assert!(!ArgKind::Int.accepts(&Value::Null));
        assert!(!ArgKind::Float.accepts(&Value::Int(1)));
    }

    #[test]
    fn handlers_queue_follow_up_calls() {
        let mut view = view_with(vec![RpcBehavior::new("b").method(
            "Ping",
            Signature::Exact(vec![]),
            |ctx| {
                let view_id = ctx.info.view_id;
                let sender = ctx.info.sender;
                ctx.rpc_to(view_id, "Pong", sender, vec![]);
                let mut ticks = 0;
                Some(Box::new(move |_| {
                    ticks += 1;
                    ticks == 2
                }))
            },
        )]);
        let mut deferred = Vec::new();
        let mut cont = dispatch(&mut view, "Ping", &[], info(), &mut deferred)
            .unwrap()
            .unwrap();
        assert_eq!(
            deferred,
            vec![DeferredRpc {
                view_id: 1001,
                method: "Pong".into(),
                destination: RpcDestination::Actor(2),
                args: vec![],
            }]
        );
        assert!(!cont(0.0));
        assert!(cont(0.1));
    }

    #[test]
    fn shortcuts_are_a_bijection() {
        let shortcuts = RpcShortcuts::new(["Foo", "Bar", "Foo"]);
        assert_eq!(shortcuts.len(), 2);
        assert_eq!(shortcuts.code("Bar"), Some(1));
        assert_eq!(shortcuts.name(1), Some("Bar"));
        assert_eq!(shortcuts.name(5), None);
    }

    #[test]
    fn wire_layout_and_shortcut_precedence() {
        let shortcuts = RpcShortcuts::new(["Foo"]);
        let call = RpcCall::new(2001, 0, 55, "Foo", vec![Value::Int(3)], &shortcuts);
        let table = call.to_table();
        assert_eq!(table.get(&0), Some(&Value::Int(2001)));
        assert!(table.get(&1).is_none());
        assert_eq!(table.get(&2), Some(&Value::Int(55)));
        assert!(table.get(&3).is_none());
        assert_eq!(table.get(&5), Some(&Value::Byte(0)));
        assert_eq!(RpcCall::from_table(&table).unwrap(), call);

        let mut both = table.clone();
        both.insert(3, Value::from("Other"));
        let parsed = RpcCall::from_table(&both).unwrap();
        assert_eq!(parsed.method_name(&shortcuts), Some("Foo"));

        let named = RpcCall::new(2001, 4, 55, "Bar", vec![], &shortcuts);
        let table = named.to_table();
        assert_eq!(table.get(&1), Some(&Value::Short(4)));
        assert_eq!(table.get(&3), Some(&Value::from("Bar")));
        assert!(table.get(&4).is_none());
    }
}
