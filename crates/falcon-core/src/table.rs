//! Open-addressed hash table keyed by interned string handles.
//!
//! Used for globals, instance fields, and class method maps. Keys are
//! [`ObjRef`]s that are always already-interned strings, so identity
//! comparison is enough — no content hashing happens here (that lives in
//! [`crate::heap::Heap`]'s intern set, which *does* need content comparison
//! since it runs before a handle exists).

use crate::object::ObjRef;
use crate::value::Value;

const MAX_LOAD_FACTOR: f64 = 0.75;

#[derive(Clone, Copy)]
enum Slot {
    Empty,
    Tombstone,
    Occupied(ObjRef, Value),
}

/// Linear-probing, power-of-two-capacity hash table.
#[derive(Clone)]
pub struct Table {
    slots: Vec<Slot>,
    len: usize,
}

impl Default for Table {
    fn default() -> Self {
        Self::new()
    }
}

impl Table {
    pub fn new() -> Self {
        Self { slots: Vec::new(), len: 0 }
    }

    /// Number of live (non-tombstone) entries.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, key: ObjRef) -> Option<Value> {
        if self.slots.is_empty() {
            return None;
        }
        let idx = self.find_slot(key);
        match self.slots[idx] {
            Slot::Occupied(k, v) if k == key => Some(v),
            _ => None,
        }
    }

    /// Inserts or overwrites `key`. Returns `true` if this is a brand-new key.
    pub fn set(&mut self, key: ObjRef, value: Value) -> bool {
        if self.slots.is_empty() || (self.len + 1) as f64 > self.capacity() as f64 * MAX_LOAD_FACTOR {
            self.grow();
        }
        let idx = self.find_slot(key);
        let is_new = !matches!(self.slots[idx], Slot::Occupied(k, _) if k == key);
        if is_new && !matches!(self.slots[idx], Slot::Occupied(..)) {
            self.len += 1;
        }
        self.slots[idx] = Slot::Occupied(key, value);
        is_new
    }

    /// Turns the entry into a tombstone. Returns whether a live entry existed.
    pub fn delete(&mut self, key: ObjRef) -> bool {
        if self.slots.is_empty() {
            return false;
        }
        let idx = self.find_slot(key);
        match self.slots[idx] {
            Slot::Occupied(k, _) if k == key => {
                self.slots[idx] = Slot::Tombstone;
                self.len -= 1;
                true
            }
            _ => false,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.slots.iter().filter_map(|s| match s {
            Slot::Occupied(k, v) => Some((*k, *v)),
            _ => None,
        })
    }

    fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Probes for `key`'s slot: the occupied slot if present, else the first
    /// tombstone or empty slot seen (so a `set` right after a negative `get`
    /// reuses the same probe sequence).
    fn find_slot(&self, key: ObjRef) -> usize {
        let cap = self.capacity();
        let mut idx = (key.index() as usize) & (cap - 1);
        let mut first_tombstone: Option<usize> = None;
        loop {
            match self.slots[idx] {
                Slot::Empty => return first_tombstone.unwrap_or(idx),
                Slot::Tombstone => {
                    if first_tombstone.is_none() {
                        first_tombstone = Some(idx);
                    }
                }
                Slot::Occupied(k, _) if k == key => return idx,
                Slot::Occupied(..) => {}
            }
            idx = (idx + 1) & (cap - 1);
        }
    }

    fn grow(&mut self) {
        let new_cap = if self.slots.is_empty() { 8 } else { self.slots.len() * 2 };
        let old = std::mem::replace(&mut self.slots, vec![Slot::Empty; new_cap]);
        self.len = 0;
        for slot in old {
            if let Slot::Occupied(k, v) = slot {
                let idx = self.find_slot(k);
                self.slots[idx] = Slot::Occupied(k, v);
                self.len += 1;
            }
        }
    }
}

impl Clone for Slot {
    fn clone(&self) -> Self {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(i: u32) -> ObjRef {
        ObjRef::for_test(i)
    }

    #[test]
    fn set_get_delete_roundtrip() {
        let mut t = Table::new();
        assert!(t.set(key(1), Value::Number(1.0)));
        assert!(!t.set(key(1), Value::Number(2.0)));
        assert_eq!(t.get(key(1)), Some(Value::Number(2.0)));
        assert!(t.delete(key(1)));
        assert_eq!(t.get(key(1)), None);
        assert!(!t.delete(key(1)));
    }

    #[test]
    fn grows_past_load_factor() {
        let mut t = Table::new();
        for i in 0..100 {
            t.set(key(i), Value::Number(i as f64));
        }
        assert_eq!(t.len(), 100);
        for i in 0..100 {
            assert_eq!(t.get(key(i)), Some(Value::Number(i as f64)));
        }
    }

    #[test]
    fn tombstone_does_not_break_later_probes() {
        let mut t = Table::new();
        for i in 0..8 {
            t.set(key(i), Value::Null);
        }
        t.delete(key(3));
        // Re-inserting should land, and unrelated keys must still resolve.
        t.set(key(3), Value::Bool(true));
        assert_eq!(t.get(key(3)), Some(Value::Bool(true)));
        assert_eq!(t.get(key(7)), Some(Value::Null));
    }

    #[derive(Clone, Copy, Debug)]
    enum TableOp {
        Set(u32, i64),
        Delete(u32),
    }

    fn table_op() -> impl proptest::strategy::Strategy<Value = TableOp> {
        use proptest::prelude::*;
        prop_oneof![
            (0u32..16, any::<i64>()).prop_map(|(k, v)| TableOp::Set(k, v)),
            (0u32..16).prop_map(TableOp::Delete),
        ]
    }

    proptest::proptest! {
        /// A random sequence of set/delete against `Table` must agree with a
        /// `HashMap` reference model at every step, through growth and
        /// tombstone reuse alike.
        #[test]
        fn matches_hash_map_reference_model(ops in proptest::collection::vec(table_op(), 0..200)) {
            use std::collections::HashMap;
            let mut t = Table::new();
            let mut model: HashMap<u32, i64> = HashMap::new();
            for op in ops {
                match op {
                    TableOp::Set(k, v) => {
                        t.set(key(k), Value::Number(v as f64));
                        model.insert(k, v);
                    }
                    TableOp::Delete(k) => {
                        t.delete(key(k));
                        model.remove(&k);
                    }
                }
            }
            proptest::prop_assert_eq!(t.len(), model.len());
            for (k, v) in &model {
                proptest::prop_assert_eq!(t.get(key(*k)), Some(Value::Number(*v as f64)));
            }
        }
    }
}
