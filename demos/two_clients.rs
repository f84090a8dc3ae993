use std::{cell::RefCell, rc::Rc};

use netroom::{
    loopback::{LoopbackNetwork, LoopbackTransport},
    ArgKind, InstantiationRecord, Notification, Observed, PrefabPool, Quaternion, RoomOptions,
    RpcBehavior, RpcTarget, Session, SessionConfig, SessionState, Signature, SyncMode, Value,
    Vector3, ViewComponents, ViewId,
};

const APP_ID: &str = "two-clients-demo";

/// A position that the owner moves and the other client mirrors.
struct Position(Rc<RefCell<Vector3>>);

impl Observed for Position {
    fn write_fields(&mut self) -> Vec<Value> {
        vec![Value::Vector3(*self.0.borrow())]
    }
    fn read_fields(&mut self, fields: &[Value]) {
        if let Some(p) = fields.first().and_then(Value::as_vector3) {
            *self.0.borrow_mut() = p;
        }
    }
}

type Positions = Rc<RefCell<Vec<(ViewId, Rc<RefCell<Vector3>>)>>>;

#[derive(Default)]
struct Pool {
    positions: Positions,
}

impl PrefabPool for Pool {
    fn view_count(&self, prefab: &str) -> Option<usize> {
        (prefab == "player").then_some(1)
    }
    fn instantiate(&mut self, record: &InstantiationRecord) -> Vec<ViewComponents> {
        let position = Rc::new(RefCell::new(record.position));
        self.positions
            .borrow_mut()
            .push((record.instantiation_id, Rc::clone(&position)));
        let greet = RpcBehavior::new("Greeter").method(
            "greet",
            Signature::ExactWithInfo(vec![ArgKind::String]),
            |ctx| {
                log::info!(
                    "actor {} says {:?} on view {}",
                    ctx.info.sender,
                    ctx.args[0],
                    ctx.info.view_id
                );
                None
            },
        );
        vec![ViewComponents::new()
            .observe(SyncMode::ReliableDeltaCompressed, Position(position))
            .behavior(greet)]
    }
    fn destroy(&mut self, instantiation_id: ViewId, _view_ids: &[ViewId]) {
        log::info!("destroying object {instantiation_id}");
    }
}

fn position_of(positions: &Positions, id: ViewId) -> Option<Rc<RefCell<Vector3>>> {
    positions
        .borrow()
        .iter()
        .find(|(view, _)| *view == id)
        .map(|(_, p)| Rc::clone(p))
}

fn session(network: &Rc<RefCell<LoopbackNetwork>>, name: &str, positions: &Positions) -> Session<LoopbackTransport> {
    let cfg = SessionConfig::default()
        .app_id(APP_ID)
        .player_name(name)
        .prefab_pool(Pool {
            positions: Rc::clone(positions),
        })
        .on_state_change(|from, to, _| log::info!("{from:?} -> {to:?}"))
        .on_notification(|n, _| {
            if !matches!(n, Notification::Diagnostic(_)) {
                log::info!("{n:?}");
            }
        });
    Session::with_config(LoopbackTransport::new(network), cfg)
}

fn main() {
    env_logger::Builder::new()
        .filter(None, log::LevelFilter::Info)
        .init();

    let network = LoopbackNetwork::shared(APP_ID);
    let alice_objects = Positions::default();
    let bob_objects = Positions::default();
    let mut alice = session(&network, "alice", &alice_objects);
    let mut bob = session(&network, "bob", &bob_objects);

    let tick_rate = 1.0 / 30.0;
    let mut time = 0.0;
    let mut tick = |alice: &mut Session<LoopbackTransport>, bob: &mut Session<LoopbackTransport>| {
        alice.tick(time);
        bob.tick(time);
        network.borrow_mut().advance_time((tick_rate * 1000.0) as i32);
        time += tick_rate;
    };

    alice.connect().unwrap();
    bob.connect().unwrap();
    while alice.state() != SessionState::ConnectedToDirectoryAuthenticated
        || bob.state() != SessionState::ConnectedToDirectoryAuthenticated
    {
        tick(&mut alice, &mut bob);
    }

    alice
        .create_room(Some("arena"), RoomOptions::default().max_players(2))
        .unwrap();
    while !alice.is_joined() {
        tick(&mut alice, &mut bob);
    }
    bob.join_room("arena").unwrap();
    while !bob.is_joined() {
        tick(&mut alice, &mut bob);
    }

    let player = alice
        .instantiate("player", Vector3::ZERO, Quaternion::IDENTITY, 0, None)
        .unwrap();
    alice
        .rpc(player, "greet", RpcTarget::AllBuffered, vec![Value::from("hello")])
        .unwrap();
    while bob.view(player).is_none() {
        tick(&mut alice, &mut bob);
    }

    let (Some(source), Some(replica)) = (
        position_of(&alice_objects, player),
        position_of(&bob_objects, player),
    ) else {
        log::error!("player was not replicated");
        return;
    };
    for step in 1..=20 {
        source.borrow_mut().x = step as f32 * 0.5;
        for _ in 0..6 {
            tick(&mut alice, &mut bob);
        }
        log::info!(
            "alice's player at x = {}, bob sees x = {}",
            source.borrow().x,
            replica.borrow().x
        );
    }

    alice.leave_room().unwrap();
    while alice.state() != SessionState::ConnectedToDirectoryAuthenticated {
        tick(&mut alice, &mut bob);
    }
    bob.disconnect();
    while bob.state() != SessionState::Disconnected {
        tick(&mut alice, &mut bob);
    }
}
