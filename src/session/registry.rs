//! Mapping between caller-chosen object ids and dense batch slots.
//!
//! Slots are handed out in registration order and never reused, so slot `i`
//! is always row `i` of every batched tensor in the session.

use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct ObjectRegistry {
    id_to_slot: BTreeMap<usize, usize>,
    slot_to_id: Vec<usize>,
}

impl ObjectRegistry {
    pub fn get(&self, object_id: usize) -> Option<usize> {
        self.id_to_slot.get(&object_id).copied()
    }

    /// Allocate the next slot for `object_id`. Re-registering an existing
    /// id returns its original slot.
    pub fn register(&mut self, object_id: usize) -> usize {
        if let Some(slot) = self.get(object_id) {
            return slot;
        }
        let slot = self.slot_to_id.len();
        self.slot_to_id.push(object_id);
        self.id_to_slot.insert(object_id, slot);
        slot
    }

    pub fn id_of(&self, slot: usize) -> Option<usize> {
        self.slot_to_id.get(slot).copied()
    }

    /// Object ids in slot order.
    pub fn ids(&self) -> &[usize] {
        &self.slot_to_id
    }

    pub fn len(&self) -> usize {
        self.slot_to_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slot_to_id.is_empty()
    }

    pub fn clear(&mut self) {
        self.id_to_slot.clear();
        self.slot_to_id.clear();
    }
}
