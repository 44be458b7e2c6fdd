//! Connection registry
//!
//! Arena of connection slots indexed by `SessionId`. A slot's generation is
//! bumped whenever it is vacated, so lookups with a stale id miss instead of
//! reaching whichever connection reuses the slot.
//!
//! The registry is plain data; the hub guards it with its state lock.

use std::sync::Arc;

use super::session::{Connection, SessionId};
use super::{HubError, HubResult};

enum SlotEntry {
    Vacant,
    Reserved,
    Occupied(Arc<Connection>),
}

struct Slot {
    generation: u32,
    entry: SlotEntry,
}

#[derive(Default)]
pub struct Registry {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an identifier for a connection about to be registered
    pub fn allocate(&mut self) -> SessionId {
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.entry = SlotEntry::Reserved;
            return SessionId::new(index, slot.generation);
        }
        let index = self.slots.len() as u32;
        self.slots.push(Slot {
            generation: 0,
            entry: SlotEntry::Reserved,
        });
        SessionId::new(index, 0)
    }

    /// Insert a connection under its (previously allocated) identifier
    pub fn register(&mut self, connection: Arc<Connection>) -> HubResult<SessionId> {
        let id = connection.id();
        let slot = self
            .slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .ok_or(HubError::NotFound(id))?;

        match slot.entry {
            SlotEntry::Occupied(_) => Err(HubError::DuplicateIdentifier(id)),
            SlotEntry::Vacant => Err(HubError::NotFound(id)),
            SlotEntry::Reserved => {
                slot.entry = SlotEntry::Occupied(connection);
                self.live += 1;
                Ok(id)
            }
        }
    }

    /// Remove an entry (or release a reservation)
    ///
    /// Idempotent: absent and stale ids are ignored.
    pub fn unregister(&mut self, id: SessionId) -> Option<Arc<Connection>> {
        let slot = self
            .slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())?;

        let removed = match std::mem::replace(&mut slot.entry, SlotEntry::Vacant) {
            SlotEntry::Vacant => return None,
            SlotEntry::Reserved => None,
            SlotEntry::Occupied(connection) => {
                self.live -= 1;
                Some(connection)
            }
        };
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(id.index());
        removed
    }

    pub fn lookup(&self, id: SessionId) -> HubResult<Arc<Connection>> {
        match self.slots.get(id.index() as usize) {
            Some(Slot {
                generation,
                entry: SlotEntry::Occupied(connection),
            }) if *generation == id.generation() => Ok(Arc::clone(connection)),
            _ => Err(HubError::NotFound(id)),
        }
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.lookup(id).is_ok()
    }

    /// Snapshot of every registered connection
    ///
    /// The `Arc`s are cloned up front, so the iterator is unaffected by
    /// registrations or removals that happen while it is consumed.
    pub fn enumerate(&self) -> std::vec::IntoIter<Arc<Connection>> {
        self.slots
            .iter()
            .filter_map(|slot| match &slot.entry {
                SlotEntry::Occupied(connection) => Some(Arc::clone(connection)),
                _ => None,
            })
            .collect::<Vec<_>>()
            .into_iter()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hub::OverflowPolicy;

    fn register_new(registry: &mut Registry) -> SessionId {
        let id = registry.allocate();
        let connection = Arc::new(Connection::new(
            id,
            "127.0.0.1:5000".parse().unwrap(),
            8,
            OverflowPolicy::Close,
        ));
        registry.register(connection).unwrap()
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        let id = register_new(&mut registry);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.lookup(id).unwrap().id(), id);
    }

    #[test]
    fn test_duplicate_register_fails() {
        let mut registry = Registry::new();
        let id = register_new(&mut registry);
        let again = Arc::new(Connection::new(
            id,
            "127.0.0.1:5001".parse().unwrap(),
            8,
            OverflowPolicy::Close,
        ));
        assert_eq!(
            registry.register(again).unwrap_err(),
            HubError::DuplicateIdentifier(id)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_lookup_after_unregister_is_not_found() {
        let mut registry = Registry::new();
        let id = register_new(&mut registry);
        assert!(registry.unregister(id).is_some());
        assert_eq!(registry.lookup(id).unwrap_err(), HubError::NotFound(id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_unregister_is_idempotent() {
        let mut registry = Registry::new();
        let id = register_new(&mut registry);
        assert!(registry.unregister(id).is_some());
        assert!(registry.unregister(id).is_none());
        assert!(registry.unregister(SessionId::new(99, 0)).is_none());
    }

    #[test]
    fn test_never_registered_id_is_not_found() {
        let registry = Registry::new();
        let id = SessionId::new(0, 0);
        assert_eq!(registry.lookup(id).unwrap_err(), HubError::NotFound(id));
    }

    #[test]
    fn test_reserved_slot_is_not_visible() {
        let mut registry = Registry::new();
        let id = registry.allocate();
        assert!(!registry.contains(id));
        assert_eq!(registry.enumerate().count(), 0);
        assert!(registry.unregister(id).is_none());
        // Released reservation bumps the generation like a removal does
        let next = registry.allocate();
        assert_eq!(next.index(), id.index());
        assert_ne!(next.generation(), id.generation());
    }

    #[test]
    fn test_stale_id_never_reaches_reused_slot() {
        let mut registry = Registry::new();
        let old = register_new(&mut registry);
        registry.unregister(old);
        let new = register_new(&mut registry);

        assert_eq!(old.index(), new.index());
        assert!(registry.lookup(old).is_err());
        assert!(registry.lookup(new).is_ok());
        // Removing the stale id must not evict the new occupant
        assert!(registry.unregister(old).is_none());
        assert!(registry.contains(new));
    }

    #[test]
    fn test_enumerate_is_a_snapshot() {
        let mut registry = Registry::new();
        let a = register_new(&mut registry);
        let b = register_new(&mut registry);

        let snapshot = registry.enumerate();
        registry.unregister(a);
        let _c = register_new(&mut registry);

        let ids: Vec<_> = snapshot.map(|c| c.id()).collect();
        assert_eq!(ids, vec![a, b]);
    }

    #[test]
    fn test_register_unregister_sequences() {
        // Lookup after unregister always misses, across slot reuse
        let mut registry = Registry::new();
        let mut removed = Vec::new();
        let mut live = Vec::new();
        for round in 0..50 {
            let id = register_new(&mut registry);
            live.push(id);
            if round % 3 == 0 {
                let victim = live.remove(0);
                registry.unregister(victim);
                removed.push(victim);
            }
        }
        for id in &removed {
            assert!(registry.lookup(*id).is_err());
        }
        for id in &live {
            assert!(registry.lookup(*id).is_ok());
        }
        assert_eq!(registry.len(), live.len());
    }
}
