use std::sync::{Mutex, RwLock};

use hashbrown::HashMap;
use tracing::trace;

use super::{lock, read, write, Object};
use crate::{
    error::Error,
    id::{GlobalId, NodeId, RESERVED_SLOTS},
};

/// Owned objects of one node. Slot index equals the object part of the id;
/// slots are only ever appended, and removal clears a slot without reusing
/// it.
pub struct Repository {
    me: NodeId,
    slots: RwLock<Vec<Option<Object>>>,
    mapped: Mutex<HashMap<GlobalId, Object>>,
    graveyard: Mutex<Vec<(GlobalId, Object)>>,
}

impl Repository {
    pub fn new(me: NodeId) -> Self {
        Self {
            me,
            slots: RwLock::new(vec![None; RESERVED_SLOTS as usize]),
            mapped: Mutex::new(HashMap::new()),
            graveyard: Mutex::new(Vec::new()),
        }
    }

    pub fn add_object(&self, object: Object) -> GlobalId {
        let mut slots = write(&self.slots);
        slots.push(Some(object));
        GlobalId::direct(self.me, (slots.len() - 1) as u32)
    }

    /// Reserves a slot to be filled later with `set_object`.
    pub fn preallocate_object(&self) -> GlobalId {
        self.preallocate_objects(1)
    }

    /// Reserves `count` consecutive slots and returns the first id.
    pub fn preallocate_objects(&self, count: u32) -> GlobalId {
        let mut slots = write(&self.slots);
        let first = slots.len() as u32;
        let len = slots.len();
        slots.resize(len + count as usize, None);
        trace!(first, count, "preallocated slots");
        GlobalId::direct(self.me, first)
    }

    pub fn set_object(&self, id: GlobalId, object: Object) -> Result<(), Error> {
        self.check_direct(id)?;
        let mut slots = write(&self.slots);
        match slots.get_mut(id.index() as usize) {
            Some(slot) => {
                *slot = Some(object);
                Ok(())
            }
            None => Err(Error::UnknownObject(id)),
        }
    }

    pub fn get_object(&self, id: GlobalId) -> Option<Object> {
        if id.is_mapped() {
            return self.get_mapped_object(id);
        }
        if id.is_null() || self.check_direct(id).is_err() {
            return None;
        }
        read(&self.slots).get(id.index() as usize).cloned().flatten()
    }

    pub fn remove_object(&self, id: GlobalId) -> Option<Object> {
        self.check_direct(id).ok()?;
        write(&self.slots)
            .get_mut(id.index() as usize)
            .and_then(Option::take)
    }

    /// Inserts unless the id is already present; reports whether it was
    /// added.
    pub fn add_mapped_object(&self, id: GlobalId, object: Object) -> bool {
        let mut mapped = lock(&self.mapped);
        if mapped.contains_key(&id) {
            return false;
        }
        mapped.insert(id, object);
        true
    }

    /// Falls back to the graveyard, newest first.
    pub fn get_mapped_object(&self, id: GlobalId) -> Option<Object> {
        if let Some(object) = lock(&self.mapped).get(&id).cloned() {
            return Some(object);
        }
        lock(&self.graveyard)
            .iter()
            .rev()
            .find(|(archived, _)| *archived == id)
            .map(|(_, object)| object.clone())
    }

    /// Removes a mapped object. Archived objects are kept in the graveyard
    /// so late references still resolve to a destroyed object rather than
    /// to nothing.
    pub fn remove_mapped_object(
        &self,
        id: GlobalId,
        archive: bool,
    ) -> Option<Object> {
        let removed = lock(&self.mapped).remove(&id)?;
        if archive {
            lock(&self.graveyard).push((id, removed.clone()));
        }
        Some(removed)
    }

    pub fn graveyard_len(&self) -> usize {
        lock(&self.graveyard).len()
    }

    pub fn graveyard(&self) -> Vec<(GlobalId, Object)> {
        lock(&self.graveyard).clone()
    }

    pub fn slot_count(&self) -> usize {
        read(&self.slots).len()
    }

    /// Every live object, direct slots first.
    pub fn objects(&self) -> Vec<(GlobalId, Object)> {
        let mut all: Vec<_> = read(&self.slots)
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.clone()
                    .map(|object| (GlobalId::direct(self.me, i as u32), object))
            })
            .collect();
        all.extend(
            lock(&self.mapped).iter().map(|(id, object)| (*id, object.clone())),
        );
        all
    }

    /// Replaces the whole table, keeping `slot_count` slots.
    pub fn restore(
        &self,
        slot_count: usize,
        objects: Vec<(GlobalId, Object)>,
        graveyard: Vec<(GlobalId, Object)>,
    ) -> Result<(), Error> {
        let mut slots = vec![None; slot_count.max(RESERVED_SLOTS as usize)];
        let mut mapped = HashMap::new();
        for (id, object) in objects {
            if id.is_mapped() {
                mapped.insert(id, object);
                continue;
            }
            self.check_direct(id)?;
            match slots.get_mut(id.index() as usize) {
                Some(slot) => *slot = Some(object),
                None => return Err(Error::UnknownObject(id)),
            }
        }
        *write(&self.slots) = slots;
        *lock(&self.mapped) = mapped;
        *lock(&self.graveyard) = graveyard;
        Ok(())
    }

    fn check_direct(&self, id: GlobalId) -> Result<(), Error> {
        if id.is_mapped() || id.is_map_handle() || id.owner(u32::MAX) != self.me {
            return Err(Error::NotOwner(id));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::ObjectKind;

    #[test]
    fn test_slot_index_matches_id() {
        let repo = Repository::new(3);
        let a = repo.add_object(Object::Proxy(ObjectKind::Event));
        let b = repo.add_object(Object::Proxy(ObjectKind::Task));
        assert_eq!(a, GlobalId::direct(3, RESERVED_SLOTS));
        assert_eq!(b.index(), a.index() + 1);
        assert_eq!(repo.get_object(b).map(|o| o.kind()), Some(ObjectKind::Task));
    }

    #[test]
    fn test_preallocated_slots_are_empty_until_set() {
        let repo = Repository::new(0);
        let first = repo.preallocate_objects(4);
        let third = GlobalId::direct(0, first.index() + 2);
        assert!(repo.get_object(third).is_none());
        repo.set_object(third, Object::Proxy(ObjectKind::Block)).unwrap();
        assert!(repo.get_object(third).is_some());
        let next = repo.preallocate_object();
        assert_eq!(next.index(), first.index() + 4);
    }

    #[test]
    fn test_foreign_ids_are_rejected() {
        let repo = Repository::new(0);
        let foreign = GlobalId::direct(1, 2);
        assert!(repo.get_object(foreign).is_none());
        assert!(matches!(
            repo.set_object(foreign, Object::Proxy(ObjectKind::Block)),
            Err(Error::NotOwner(_))
        ));
    }

    #[test]
    fn test_mapped_insert_if_absent_and_graveyard() {
        let repo = Repository::new(1);
        let id = GlobalId::mapped(0, 5);
        assert!(repo.add_mapped_object(id, Object::Proxy(ObjectKind::Event)));
        assert!(!repo.add_mapped_object(id, Object::Proxy(ObjectKind::Task)));
        assert_eq!(repo.get_object(id).map(|o| o.kind()), Some(ObjectKind::Event));
        assert!(repo.remove_mapped_object(id, true).is_some());
        assert_eq!(repo.graveyard_len(), 1);
        // late references still find the archived object
        assert_eq!(repo.get_object(id).map(|o| o.kind()), Some(ObjectKind::Event));
        assert!(repo.add_mapped_object(id, Object::Proxy(ObjectKind::Task)));
        assert_eq!(repo.get_object(id).map(|o| o.kind()), Some(ObjectKind::Task));

        let other = GlobalId::mapped(0, 6);
        repo.add_mapped_object(other, Object::Proxy(ObjectKind::Event));
        assert!(repo.remove_mapped_object(other, false).is_some());
        assert!(repo.get_object(other).is_none());
    }

    #[test]
    fn test_removal_does_not_reuse_slots() {
        let repo = Repository::new(0);
        let a = repo.add_object(Object::Proxy(ObjectKind::Event));
        assert!(repo.remove_object(a).is_some());
        let b = repo.add_object(Object::Proxy(ObjectKind::Event));
        assert_ne!(a, b);
        assert!(repo.get_object(a).is_none());
    }
}
