use std::collections::BTreeMap;

use crate::consts::INVALID_ACTOR_ID;
use crate::error::{Error, Result};
use crate::protocol::prop;
use crate::value::{merge_properties, Properties, Value};

pub type ActorId = i32;

/// A participant of the current room.
#[derive(Debug, Clone, PartialEq)]
pub struct Actor {
    id: ActorId,
    is_local: bool,
    name: String,
    properties: Properties,
}

impl Actor {
    pub fn new(id: ActorId, is_local: bool) -> Self {
        Self {
            id,
            is_local,
            name: String::new(),
            properties: Properties::new(),
        }
    }
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }
    pub fn id(&self) -> ActorId {
        self.id
    }
    pub fn is_local(&self) -> bool {
        self.is_local
    }
    pub fn name(&self) -> &str {
        &self.name
    }
    pub fn properties(&self) -> &Properties {
        &self.properties
    }
    /// Merges `update` into the custom properties. The well-known name key updates the name.
    pub fn merge_properties(&mut self, update: &Properties) {
        if let Some(name) = update.get(prop::PLAYER_NAME).and_then(Value::as_str) {
            self.name = name.to_owned();
        }
        let mut custom = update.clone();
        custom.remove(prop::PLAYER_NAME);
        merge_properties(&mut self.properties, &custom);
    }
    /// Properties as sent on the wire: custom properties plus the name under its well-known key.
    pub fn wire_properties(&self) -> Properties {
        let mut props = self.properties.clone();
        props.insert(prop::PLAYER_NAME.to_owned(), Value::from(self.name.as_str()));
        props
    }
}

/// Tracks the actors of the current room, the local actor, and the master client.
///
/// The local actor always exists; before joining a room it carries id `-1`.
#[derive(Debug)]
pub struct ActorDirectory {
    local: Actor,
    remote: BTreeMap<ActorId, Actor>,
    master_id: Option<ActorId>,
    all: Vec<Actor>,
    others: Vec<Actor>,
}

impl Default for ActorDirectory {
    fn default() -> Self {
        Self::new(String::new())
    }
}

impl ActorDirectory {
    pub fn new(local_name: String) -> Self {
        let mut dir = Self {
            local: Actor::new(INVALID_ACTOR_ID, true).with_name(local_name),
            remote: BTreeMap::new(),
            master_id: None,
            all: Vec::new(),
            others: Vec::new(),
        };
        dir.rebuild_snapshot_lists();
        dir
    }
    pub fn local_id(&self) -> ActorId {
        self.local.id
    }
    pub fn local(&self) -> &Actor {
        &self.local
    }
    pub fn local_mut(&mut self) -> &mut Actor {
        &mut self.local
    }
    pub fn get(&self, id: ActorId) -> Option<&Actor> {
        if id == self.local.id {
            return Some(&self.local);
        }
        self.remote.get(&id)
    }
    pub fn get_mut(&mut self, id: ActorId) -> Option<&mut Actor> {
        if id == self.local.id {
            return Some(&mut self.local);
        }
        self.remote.get_mut(&id)
    }
    pub fn contains(&self, id: ActorId) -> bool {
        id == self.local.id || self.remote.contains_key(&id)
    }
    /// Number of actors, the local one included.
    pub fn len(&self) -> usize {
        self.remote.len() + 1
    }
    pub fn master_id(&self) -> Option<ActorId> {
        self.master_id
    }
    pub fn is_local_master(&self) -> bool {
        self.master_id == Some(self.local.id)
    }
    /// All actors ordered by id. Replaced wholesale on every membership change.
    pub fn all(&self) -> &[Actor] {
        &self.all
    }
    /// All actors except the local one, ordered by id.
    pub fn others(&self) -> &[Actor] {
        &self.others
    }

    /// Adds a remote actor. Returns false if the id is already present.
    pub fn add(&mut self, actor: Actor) -> bool {
        if self.contains(actor.id) {
            log::warn!("actor {} is already in the room, ignoring add", actor.id);
            return false;
        }
        log::debug!("actor {} added", actor.id);
        self.remote.insert(actor.id, actor);
        self.rebuild_snapshot_lists();
        true
    }
    /// Removes a remote actor. The local actor cannot be removed.
    pub fn remove(&mut self, id: ActorId) -> Option<Actor> {
        let actor = self.remote.remove(&id)?;
        log::debug!("actor {id} removed");
        self.rebuild_snapshot_lists();
        Some(actor)
    }
    pub fn rebuild_snapshot_lists(&mut self) {
        self.others = self.remote.values().cloned().collect();
        let mut all = self.others.clone();
        let pos = all.partition_point(|a| a.id < self.local.id);
        all.insert(pos, self.local.clone());
        self.all = all;
    }
    /// Replaces the temporary local identity with the id assigned by the session server.
    pub fn change_local_id(&mut self, new_id: ActorId) {
        if new_id == self.local.id {
            return;
        }
        if self.local.id != INVALID_ACTOR_ID {
            log::warn!(
                "local actor id reassigned from {} to {new_id} without leaving first",
                self.local.id
            );
        }
        // a placeholder for our own id may exist if the actor list arrived first
        if let Some(placeholder) = self.remote.remove(&new_id) {
            let mut props = placeholder.properties;
            merge_properties(&mut props, &self.local.properties);
            self.local.properties = props;
        }
        self.local.id = new_id;
        self.rebuild_snapshot_lists();
    }
    /// Drops all remote actors and the master designation, and resets the local id.
    pub fn reset(&mut self) {
        self.remote.clear();
        self.local.id = INVALID_ACTOR_ID;
        self.master_id = None;
        self.rebuild_snapshot_lists();
    }

    /// Re-derives the master client.
    ///
    /// A leaving actor that is not the master never disturbs the current master. Otherwise the
    /// master becomes the surviving actor with the lowest id, the leaver excluded, or the local
    /// actor if it is alone. Returns true if the master changed.
    pub fn elect_master(&mut self, leaving: Option<ActorId>) -> bool {
        if let (Some(leaving), Some(master)) = (leaving, self.master_id) {
            if leaving > 0 && leaving != master {
                return false;
            }
        }
        let new_master = self
            .remote
            .keys()
            .copied()
            .chain(std::iter::once(self.local.id))
            .filter(|&id| Some(id) != leaving && id > 0)
            .min()
            .unwrap_or(self.local.id);
        let changed = self.master_id != Some(new_master);
        if changed {
            log::debug!(
                "master client changing from {:?} to {new_master}",
                self.master_id
            );
        }
        self.master_id = Some(new_master);
        changed
    }
    /// Validates a hand-off of the master role initiated by the local actor.
    pub fn check_master_handoff(&self, id: ActorId) -> Result<()> {
        if !self.is_local_master() {
            return Err(Error::NotMasterClient);
        }
        if !self.contains(id) {
            return Err(Error::UnknownActor(id));
        }
        if self.master_id == Some(id) {
            return Err(Error::AlreadyMaster(id));
        }
        Ok(())
    }
    /// Applies an explicit master assignment. Unknown ids are rejected.
    pub fn assign_master(&mut self, id: ActorId) -> Result<()> {
        if !self.contains(id) {
            return Err(Error::UnknownActor(id));
        }
        log::debug!("master client explicitly set to {id}");
        self.master_id = Some(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn room_with(ids: &[ActorId], local: ActorId) -> ActorDirectory {
        let mut dir = ActorDirectory::new("me".into());
        dir.change_local_id(local);
        for &id in ids.iter().filter(|&&id| id != local) {
            assert!(dir.add(Actor::new(id, false)));
        }
        dir
    }

    #[test]
    fn local_actor_exists_before_join() {
        let dir = ActorDirectory::new("me".into());
        assert_eq!(dir.local_id(), -1);
        assert_eq!(dir.local().name(), "me");
        assert_eq!(dir.all().len(), 1);
        assert!(dir.others().is_empty());
    }

    #[test]
    fn duplicate_add_is_rejected() {
        let mut dir = room_with(&[1, 2], 1);
        assert!(!dir.add(Actor::new(2, false)));
        assert_eq!(dir.len(), 2);
    }

    #[test]
    fn snapshot_lists_are_ordered() {
        let dir = room_with(&[5, 2, 9], 5);
        let all: Vec<_> = dir.all().iter().map(Actor::id).collect();
        let others: Vec<_> = dir.others().iter().map(Actor::id).collect();
        assert_eq!(all, vec![2, 5, 9]);
        assert_eq!(others, vec![2, 9]);
    }

    #[test]
    fn first_election_picks_lowest() {
        let mut dir = room_with(&[3, 2, 7], 7);
        assert!(dir.elect_master(None));
        assert_eq!(dir.master_id(), Some(2));
        assert!(!dir.elect_master(None));
    }

    #[test]
    fn non_master_leaving_keeps_master() {
        let mut dir = room_with(&[1, 2, 3], 3);
        dir.elect_master(None);
        assert!(!dir.elect_master(Some(2)));
        dir.remove(2);
        assert_eq!(dir.master_id(), Some(1));
    }

    #[test]
    fn master_leaving_elects_next_lowest() {
        let mut dir = room_with(&[1, 2, 3], 3);
        dir.elect_master(None);
        assert!(dir.elect_master(Some(1)));
        dir.remove(1);
        assert_eq!(dir.master_id(), Some(2));
    }

    #[test]
    fn alone_local_becomes_master() {
        let mut dir = room_with(&[4, 6], 6);
        dir.elect_master(None);
        assert_eq!(dir.master_id(), Some(4));
        dir.elect_master(Some(4));
        dir.remove(4);
        assert_eq!(dir.master_id(), Some(6));
        assert!(dir.is_local_master());
    }

    #[test]
    fn master_always_lowest_over_random_churn() {
        let mut dir = room_with(&[1], 10_000);
        dir.elect_master(None);
        let mut next_id = 2;
        // deterministic churn: join two, drop the current master or a non-master alternately
        for round in 0..40 {
            for _ in 0..2 {
                dir.add(Actor::new(next_id, false));
                next_id += 1;
                dir.elect_master(None);
            }
            let leaving = if round % 2 == 0 {
                dir.master_id().unwrap()
            } else {
                dir.others().last().unwrap().id()
            };
            if leaving == dir.local_id() {
                continue;
            }
            dir.elect_master(Some(leaving));
            dir.remove(leaving);
            let lowest = dir.all().iter().map(Actor::id).min().unwrap();
            assert_eq!(dir.master_id(), Some(lowest));
        }
    }

    #[test]
    fn handoff_validation() {
        let mut dir = room_with(&[1, 2], 1);
        dir.elect_master(None);
        assert!(matches!(dir.check_master_handoff(9), Err(Error::UnknownActor(9))));
        assert!(matches!(dir.check_master_handoff(1), Err(Error::AlreadyMaster(1))));
        assert!(dir.check_master_handoff(2).is_ok());
        dir.assign_master(2).unwrap();
        assert!(matches!(dir.check_master_handoff(1), Err(Error::NotMasterClient)));
    }

    #[test]
    fn properties_merge_and_name() {
        let mut actor = Actor::new(1, false);
        let mut update = Properties::new();
        update.insert(prop::PLAYER_NAME.into(), "alice".into());
        update.insert("score".into(), Value::Int(10));
        actor.merge_properties(&update);
        assert_eq!(actor.name(), "alice");
        assert_eq!(actor.properties().get("score"), Some(&Value::Int(10)));
        assert!(!actor.properties().contains_key(prop::PLAYER_NAME));
    }
}
