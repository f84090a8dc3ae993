//! View table, view id allocation and the lifecycle of network-instantiated objects.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::actor::ActorDirectory;
use crate::consts::{MAX_SUBIDS, ROOM_OWNER_ID};
use crate::error::{Error, Result};
use crate::protocol::event;
use crate::value::{Quaternion, Table, Value, Vector3};
use crate::view::{owner_of, View, ViewComponents, ViewId};
use crate::ActorId;

const KEY_PREFAB: i16 = 0;
const KEY_POSITION: i16 = 1;
const KEY_ROTATION: i16 = 2;
const KEY_GROUP: i16 = 3;
const KEY_VIEW_IDS: i16 = 4;
const KEY_DATA: i16 = 5;
const KEY_TIMESTAMP: i16 = 6;
/// Also used as the filter key when removing a cached instantiation.
pub(crate) const KEY_INSTANTIATION_ID: i16 = 7;
const KEY_PREFIX: i16 = 8;

/// Creation payload of a network-instantiated object.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantiationRecord {
    pub prefab: String,
    pub position: Vector3,
    pub rotation: Quaternion,
    pub group: u8,
    pub view_ids: Vec<ViewId>,
    pub data: Option<Vec<Value>>,
    pub timestamp: i32,
    /// The first view id.
    pub instantiation_id: ViewId,
    pub level_prefix: i16,
    pub creator: ActorId,
}

impl InstantiationRecord {
    pub fn to_table(&self) -> Table {
        let mut table = Table::new();
        table.insert(KEY_PREFAB, Value::String(self.prefab.clone()));
        if self.position != Vector3::ZERO {
            table.insert(KEY_POSITION, Value::Vector3(self.position));
        }
        if self.rotation != Quaternion::IDENTITY {
            table.insert(KEY_ROTATION, Value::Quaternion(self.rotation));
        }
        if self.group != 0 {
            table.insert(KEY_GROUP, Value::Byte(self.group));
        }
        if self.view_ids.len() > 1 {
            table.insert(KEY_VIEW_IDS, Value::IntArray(self.view_ids.clone()));
        }
        if let Some(data) = &self.data {
            table.insert(KEY_DATA, Value::Array(data.clone()));
        }
        table.insert(KEY_TIMESTAMP, Value::Int(self.timestamp));
        table.insert(KEY_INSTANTIATION_ID, Value::Int(self.instantiation_id));
        if self.level_prefix > 0 {
            table.insert(KEY_PREFIX, Value::Short(self.level_prefix));
        }
        table
    }

    pub fn from_table(table: &Table, creator: ActorId) -> Result<Self> {
        let malformed = |reason| Error::MalformedEvent {
            code: event::INSTANTIATION,
            reason,
        };
        let prefab = table
            .get(&KEY_PREFAB)
            .and_then(Value::as_str)
            .ok_or_else(|| malformed("instantiation without prefab"))?
            .to_owned();
        let timestamp = table
            .get(&KEY_TIMESTAMP)
            .and_then(Value::as_int)
            .ok_or_else(|| malformed("instantiation without timestamp"))?;
        let instantiation_id = table
            .get(&KEY_INSTANTIATION_ID)
            .and_then(Value::as_int)
            .ok_or_else(|| malformed("instantiation without id"))?;
        let view_ids = match table.get(&KEY_VIEW_IDS).and_then(Value::as_int_array) {
            Some(ids) if ids.first() == Some(&instantiation_id) => ids.to_vec(),
            Some(_) => return Err(malformed("first view id differs from instantiation id")),
            None => vec![instantiation_id],
        };
        Ok(Self {
            prefab,
            position: table
                .get(&KEY_POSITION)
                .and_then(Value::as_vector3)
                .unwrap_or(Vector3::ZERO),
            rotation: table
                .get(&KEY_ROTATION)
                .and_then(Value::as_quaternion)
                .unwrap_or(Quaternion::IDENTITY),
            group: table.get(&KEY_GROUP).and_then(Value::as_byte).unwrap_or(0),
            view_ids,
            data: table.get(&KEY_DATA).and_then(Value::as_array).map(<[Value]>::to_vec),
            timestamp,
            instantiation_id,
            level_prefix: table.get(&KEY_PREFIX).and_then(Value::as_short).unwrap_or(0),
            creator,
        })
    }
}

/// The host's object factory.
pub trait PrefabPool {
    /// Number of views the prefab carries, or `None` if the prefab is unknown.
    fn view_count(&self, prefab: &str) -> Option<usize>;
    /// Builds the object and returns one set of components per view, in view id order.
    fn instantiate(&mut self, record: &InstantiationRecord) -> Vec<ViewComponents>;
    fn destroy(&mut self, instantiation_id: ViewId, view_ids: &[ViewId]);
}

/// A live network-instantiated object.
#[derive(Debug, Clone, PartialEq)]
pub struct InstantiatedObject {
    pub instantiation_id: ViewId,
    pub prefab: String,
    /// Owner encoded in the instantiation id; 0 for room objects.
    pub owner: ActorId,
    pub creator: ActorId,
    pub group: u8,
    pub view_ids: Vec<ViewId>,
}

#[derive(Debug, Default)]
pub struct Registry {
    views: BTreeMap<ViewId, View>,
    last_sub_id: HashMap<ActorId, i32>,
    reserved: HashSet<ViewId>,
    pending: HashMap<ViewId, InstantiationRecord>,
    objects: BTreeMap<ViewId, InstantiatedObject>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finds the next free view id of `owner`, continuing after the last one handed out.
    pub fn allocate_view_id(&mut self, owner: ActorId) -> Result<ViewId> {
        let Some(base) = owner
            .checked_mul(MAX_SUBIDS)
            .filter(|base| base.checked_add(MAX_SUBIDS - 1).is_some())
        else {
            return Err(Error::ViewIdsExhausted(owner));
        };
        let start = self.last_sub_id.get(&owner).copied().unwrap_or(0);
        let mut sub_id = start;
        for _ in 1..MAX_SUBIDS {
            sub_id = if sub_id + 1 >= MAX_SUBIDS { 1 } else { sub_id + 1 };
            let id = base + sub_id;
            if self.views.contains_key(&id) || self.reserved.contains(&id) {
                continue;
            }
            self.last_sub_id.insert(owner, sub_id);
            return Ok(id);
        }
        Err(Error::ViewIdsExhausted(owner))
    }
    /// Allocates a view id and keeps it out of further allocations until released.
    pub fn reserve_view_id(&mut self, owner: ActorId) -> Result<ViewId> {
        let id = self.allocate_view_id(owner)?;
        self.reserved.insert(id);
        Ok(id)
    }
    pub fn release_view_id(&mut self, id: ViewId) -> bool {
        self.reserved.remove(&id)
    }

    /// Registers a view. A view already registered under the same id is removed and returned.
    pub fn register_view(&mut self, view: View) -> Option<View> {
        let stale = self.views.insert(view.id, view);
        if let Some(stale) = &stale {
            log::warn!("view id {} registered twice, replacing", stale.id);
        }
        stale
    }
    pub fn unregister_view(&mut self, id: ViewId) -> Option<View> {
        self.views.remove(&id)
    }
    pub fn view(&self, id: ViewId) -> Option<&View> {
        self.views.get(&id)
    }
    pub fn view_mut(&mut self, id: ViewId) -> Option<&mut View> {
        self.views.get_mut(&id)
    }
    pub fn views(&self) -> impl Iterator<Item = &View> {
        self.views.values()
    }
    pub fn views_mut(&mut self) -> impl Iterator<Item = &mut View> {
        self.views.values_mut()
    }
    pub fn view_count(&self) -> usize {
        self.views.len()
    }

    /// Allocates the view ids of a new object and builds its record.
    pub fn prepare_instantiation(
        &mut self,
        prefab: &str,
        view_count: usize,
        owner: ActorId,
        creator: ActorId,
        timestamp: i32,
    ) -> Result<InstantiationRecord> {
        if view_count == 0 {
            return Err(Error::ViewCountMismatch {
                prefab: prefab.to_owned(),
                expected: 1,
                actual: 0,
            });
        }
        let mut view_ids = Vec::with_capacity(view_count);
        for _ in 0..view_count {
            view_ids.push(self.allocate_view_id(owner)?);
        }
        Ok(InstantiationRecord {
            prefab: prefab.to_owned(),
            position: Vector3::ZERO,
            rotation: Quaternion::IDENTITY,
            group: 0,
            instantiation_id: view_ids[0],
            view_ids,
            data: None,
            timestamp,
            level_prefix: 0,
            creator,
        })
    }

    /// Builds and registers an object from its record. Local and remote creations both go
    /// through here. Returns the ids whose previous registration was replaced.
    ///
    /// On failure the record stays in the pending table.
    pub fn construct(
        &mut self,
        record: InstantiationRecord,
        pool: &mut dyn PrefabPool,
    ) -> Result<Vec<ViewId>> {
        let inst = record.instantiation_id;
        self.pending.insert(inst, record);
        let Some(record) = self.pending.get(&inst) else {
            return Err(Error::UnknownObject(inst));
        };
        let expected = pool
            .view_count(&record.prefab)
            .ok_or_else(|| Error::UnknownPrefab(record.prefab.clone()))?;
        if expected != record.view_ids.len() {
            return Err(Error::ViewCountMismatch {
                prefab: record.prefab.clone(),
                expected,
                actual: record.view_ids.len(),
            });
        }
        let components = pool.instantiate(record);
        if components.len() != record.view_ids.len() {
            pool.destroy(inst, &record.view_ids);
            return Err(Error::ViewCountMismatch {
                prefab: record.prefab.clone(),
                expected: record.view_ids.len(),
                actual: components.len(),
            });
        }
        let Some(record) = self.pending.remove(&inst) else {
            return Err(Error::UnknownObject(inst));
        };

        let mut collisions = Vec::new();
        let mut stale_objects = Vec::new();
        for (&id, components) in record.view_ids.iter().zip(components) {
            let view = View::new(id, components)
                .with_group(record.group)
                .with_level_prefix(record.level_prefix)
                .with_instantiation_id(inst);
            if let Some(stale) = self.register_view(view) {
                collisions.push(id);
                if stale.instantiation_id > 0 && stale.instantiation_id != inst {
                    stale_objects.push(stale.instantiation_id);
                }
            }
        }
        if let Some(old) = self.objects.remove(&inst) {
            log::warn!("object {inst} instantiated twice, replacing");
            pool.destroy(inst, &old.view_ids);
        }
        for stale in stale_objects {
            if let Some(object) = self.objects.remove(&stale) {
                for id in object.view_ids.iter().filter(|id| !record.view_ids.contains(id)) {
                    self.views.remove(id);
                }
                pool.destroy(stale, &object.view_ids);
            }
        }
        log::debug!(
            "constructed {} as object {inst} with views {:?}",
            record.prefab,
            record.view_ids
        );
        self.objects.insert(
            inst,
            InstantiatedObject {
                instantiation_id: inst,
                prefab: record.prefab,
                owner: owner_of(inst),
                creator: record.creator,
                group: record.group,
                view_ids: record.view_ids,
            },
        );
        Ok(collisions)
    }

    /// The owner may destroy its objects; the master may destroy room objects and objects
    /// whose owner has left.
    pub fn check_destroy_permission(
        &self,
        inst: ViewId,
        actors: &ActorDirectory,
    ) -> Result<&InstantiatedObject> {
        let object = self.objects.get(&inst).ok_or(Error::UnknownObject(inst))?;
        let local = actors.local_id();
        let orphaned = object.owner == ROOM_OWNER_ID || !actors.contains(object.owner);
        if object.owner == local || (actors.is_local_master() && orphaned) {
            Ok(object)
        } else {
            Err(Error::DestroyNotAllowed {
                actor: local,
                instantiation_id: inst,
            })
        }
    }

    /// Unregisters an object and its views.
    pub fn remove_object(&mut self, inst: ViewId) -> Option<InstantiatedObject> {
        let object = self.objects.remove(&inst)?;
        for id in &object.view_ids {
            self.views.remove(id);
        }
        Some(object)
    }
    pub fn object(&self, inst: ViewId) -> Option<&InstantiatedObject> {
        self.objects.get(&inst)
    }
    /// Instantiation ids of the objects owned by `actor`.
    pub fn objects_owned_by(&self, actor: ActorId) -> Vec<ViewId> {
        self.objects
            .values()
            .filter(|o| o.owner == actor)
            .map(|o| o.instantiation_id)
            .collect()
    }
    pub fn all_objects(&self) -> Vec<ViewId> {
        self.objects.keys().copied().collect()
    }
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Forgets all objects, views, reservations and pending records. Returns the objects that
    /// were live so the host can tear them down.
    pub fn clear(&mut self) -> Vec<InstantiatedObject> {
        let objects = std::mem::take(&mut self.objects).into_values().collect();
        self.views.clear();
        self.last_sub_id.clear();
        self.reserved.clear();
        self.pending.clear();
        objects
    }
}
