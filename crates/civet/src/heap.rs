//! The heap: a slot arena for every garbage-collected object.
//!
//! Objects are stored in `Vec` slots and addressed by [`HeapId`]; freed
//! slots go on a free list and are reused. Collection is tracing
//! mark-and-sweep: the program hands the collector its root set, marking
//! walks containers through an explicit worklist, and the sweep clears
//! every unmarked slot.
//!
//! A pin count on each slot protects objects that are mid-construction
//! (already allocated, not yet reachable from any root) across allocations
//! that might trigger a collection.

use std::mem;

use ahash::RandomState;
use hashbrown::HashTable;

use crate::{
    bytecode::code::FuncDef,
    error::{RunError, RunResult},
    value::{Value, values_equal},
};

/// Opaque identifier of a heap object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HeapId(u32);

impl HeapId {
    pub(crate) fn index(self) -> usize {
        self.0 as usize
    }
}

/// Fixed-seed hasher state: string hashes are compared against each other
/// within one process and are never persisted, so the seeds just need to be
/// stable for the lifetime of the program.
fn fixed_state() -> RandomState {
    RandomState::with_seeds(0x243f_6a88_85a3_08d3, 0x1319_8a2e_0370_7344, 0xa409_3822_299f_31d0, 0x082e_fa98_ec4e_6c89)
}

/// Hashes a string the same way stored string hashes are computed.
pub(crate) fn hash_str(s: &str) -> u64 {
    fixed_state().hash_one(s)
}

/// An immutable string with its hash precomputed at creation.
#[derive(Debug)]
pub(crate) struct Str {
    data: Box<str>,
    hash: u64,
}

impl Str {
    pub(crate) fn new(s: &str) -> Self {
        Self {
            hash: hash_str(s),
            data: s.into(),
        }
    }

    pub(crate) fn as_str(&self) -> &str {
        &self.data
    }

    pub(crate) fn hash(&self) -> u64 {
        self.hash
    }
}

/// A mutable, zero-based array of values.
#[derive(Debug, Default)]
pub(crate) struct Array {
    items: Vec<Value>,
}

impl Array {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    /// Element at a script index; out-of-range or negative yields `None`.
    pub(crate) fn get(&self, index: i64) -> Option<Value> {
        let i = usize::try_from(index).ok()?;
        self.items.get(i).copied()
    }

    pub(crate) fn get_mut(&mut self, index: i64) -> Option<&mut Value> {
        let i = usize::try_from(index).ok()?;
        self.items.get_mut(i)
    }

    pub(crate) fn push(&mut self, v: Value) {
        self.items.push(v);
    }

    /// Appends `n` null slots and returns the index of the first new one.
    pub(crate) fn grow(&mut self, n: usize) -> usize {
        let first = self.items.len();
        self.items.resize(first + n, Value::Null);
        first
    }

    pub(crate) fn items(&self) -> &[Value] {
        &self.items
    }

    pub(crate) fn items_mut(&mut self) -> &mut [Value] {
        &mut self.items
    }
}

#[derive(Debug)]
struct MapEntry {
    key: Value,
    value: Value,
    /// Cached key hash, required for relocating entries after removal.
    hash: u64,
}

/// Key-value mapping over arbitrary non-null keys.
///
/// A `HashTable` of indices over a dense entry vector: lookups go through
/// the table with externally computed hashes (string keys hash by content,
/// other objects by identity), removal swap-removes the dense entry and
/// patches the index of the entry that moved. Iteration order is entry
/// order, which no script may rely on.
#[derive(Debug, Default)]
pub(crate) struct Map {
    indices: HashTable<usize>,
    entries: Vec<MapEntry>,
}

impl Map {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn keys_and_values(&self) -> impl Iterator<Item = Value> + '_ {
        self.entries.iter().flat_map(|e| [e.key, e.value])
    }
}

/// A capture cell: open while the captured variable is still live on the
/// VM stack, closed (owning the value) after its scope ends.
#[derive(Debug)]
pub(crate) struct Upval {
    pub state: UpvalState,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum UpvalState {
    /// Absolute index of the captured slot in the VM value stack.
    Open(usize),
    Closed(Value),
}

/// A callable: a function definition plus its captured upvalue cells.
#[derive(Debug)]
pub(crate) struct Closure {
    pub func_def: HeapId,
    pub upvals: Vec<HeapId>,
}

/// Every kind of heap object.
#[derive(Debug)]
pub(crate) enum HeapData {
    Str(Str),
    Array(Array),
    Map(Map),
    FuncDef(FuncDef),
    Closure(Closure),
    Upval(Upval),
}

#[derive(Debug)]
struct HeapEntry {
    data: HeapData,
    /// Pin count; a pinned object is treated as a GC root.
    pin: u32,
}

/// The object arena plus collection bookkeeping.
#[derive(Debug)]
pub(crate) struct Heap {
    entries: Vec<Option<HeapEntry>>,
    free_list: Vec<HeapId>,
    allocs_since_gc: usize,
    gc_threshold: usize,
    gc_stress: bool,
}

/// Allocation-count threshold before the VM considers collecting.
const DEFAULT_GC_THRESHOLD: usize = 8192;

impl Heap {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            free_list: Vec::new(),
            allocs_since_gc: 0,
            gc_threshold: DEFAULT_GC_THRESHOLD,
            gc_stress: false,
        }
    }

    /// Allocates a new object and returns its id.
    ///
    /// Never collects; callers that want collection check
    /// [`Heap::should_collect`] *before* allocating so a fresh object is
    /// never swept between its allocation and first rooting.
    pub(crate) fn allocate(&mut self, data: HeapData) -> HeapId {
        self.allocs_since_gc += 1;
        let entry = HeapEntry { data, pin: 0 };
        if let Some(id) = self.free_list.pop() {
            self.entries[id.index()] = Some(entry);
            id
        } else {
            let id = HeapId(u32::try_from(self.entries.len()).unwrap_or(u32::MAX));
            self.entries.push(Some(entry));
            id
        }
    }

    pub(crate) fn new_str(&mut self, s: &str) -> HeapId {
        self.allocate(HeapData::Str(Str::new(s)))
    }

    pub(crate) fn get(&self, id: HeapId) -> &HeapData {
        &self.entries[id.index()].as_ref().expect("dead heap slot").data
    }

    pub(crate) fn get_mut(&mut self, id: HeapId) -> &mut HeapData {
        &mut self.entries[id.index()].as_mut().expect("dead heap slot").data
    }

    pub(crate) fn as_str(&self, id: HeapId) -> Option<&Str> {
        match self.get(id) {
            HeapData::Str(s) => Some(s),
            _ => None,
        }
    }

    pub(crate) fn pin(&mut self, id: HeapId) {
        if let Some(entry) = self.entries[id.index()].as_mut() {
            entry.pin += 1;
        }
    }

    pub(crate) fn unpin(&mut self, id: HeapId) {
        if let Some(entry) = self.entries[id.index()].as_mut() {
            entry.pin = entry.pin.saturating_sub(1);
        }
    }

    pub(crate) fn set_gc_stress(&mut self, stress: bool) {
        self.gc_stress = stress;
    }

    pub(crate) fn set_gc_threshold(&mut self, threshold: usize) {
        self.gc_threshold = threshold.max(1);
    }

    /// True once enough allocations have happened that the next safepoint
    /// should collect (or on every safepoint in stress mode).
    pub(crate) fn should_collect(&self) -> bool {
        self.gc_stress || self.allocs_since_gc >= self.gc_threshold
    }

    pub(crate) fn live_objects(&self) -> usize {
        self.entries.iter().filter(|e| e.is_some()).count()
    }

    #[cfg(test)]
    pub(crate) fn is_live(&self, id: HeapId) -> bool {
        self.entries.get(id.index()).is_some_and(Option::is_some)
    }

    // ---- map operations ------------------------------------------------

    /// Hash of a map key. Strings hash by content so equal strings find the
    /// same entry; other objects hash by identity. `-0.0` is folded onto
    /// `0.0` to keep the hash consistent with IEEE equality.
    fn key_hash(&self, key: Value) -> u64 {
        let state = fixed_state();
        match key {
            Value::Null => 0,
            Value::Bool(b) => state.hash_one((1u8, u64::from(b))),
            Value::Number(n) => {
                let n = if n == 0.0 { 0.0 } else { n };
                state.hash_one((2u8, n.to_bits()))
            }
            Value::Native(id) => state.hash_one((3u8, u64::from(id.0))),
            Value::Ref(id) => match self.get(id) {
                HeapData::Str(s) => s.hash(),
                _ => state.hash_one((4u8, id.index() as u64)),
            },
        }
    }

    fn map_ref(&self, map: HeapId) -> Option<&Map> {
        match self.get(map) {
            HeapData::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Temporarily moves the map out of its slot so it can be mutated while
    /// key comparisons read other heap objects. A map is never its own key
    /// (string keys are the only ones compared by content), so the empty
    /// placeholder is unobservable.
    fn take_map(&mut self, map: HeapId) -> RunResult<Map> {
        match self.get_mut(map) {
            HeapData::Map(m) => Ok(mem::take(m)),
            _ => Err(RunError::internal("map operation on non-map object")),
        }
    }

    fn put_map(&mut self, map: HeapId, m: Map) {
        if let HeapData::Map(slot) = self.get_mut(map) {
            *slot = m;
        }
    }

    pub(crate) fn map_len(&self, map: HeapId) -> usize {
        self.map_ref(map).map_or(0, Map::len)
    }

    pub(crate) fn map_get(&self, map: HeapId, key: Value) -> Option<Value> {
        let m = self.map_ref(map)?;
        let hash = self.key_hash(key);
        let idx = m
            .indices
            .find(hash, |&i| m.entries[i].hash == hash && values_equal(self, m.entries[i].key, key))?;
        Some(m.entries[*idx].value)
    }

    /// Inserts or overwrites an entry. Null keys are rejected.
    pub(crate) fn map_insert(&mut self, map: HeapId, key: Value, value: Value) -> RunResult<()> {
        if key.is_null() {
            return Err(RunError::user("can't use null as map key"));
        }
        let hash = self.key_hash(key);
        let mut m = self.take_map(map)?;
        let found = m
            .indices
            .find(hash, |&i| m.entries[i].hash == hash && values_equal(self, m.entries[i].key, key))
            .copied();
        if let Some(i) = found {
            m.entries[i].value = value;
        } else {
            let i = m.entries.len();
            m.entries.push(MapEntry { key, value, hash });
            m.indices.insert_unique(hash, i, |&j| m.entries[j].hash);
        }
        self.put_map(map, m);
        Ok(())
    }

    /// Removes an entry; `false` if the key is absent.
    pub(crate) fn map_delete(&mut self, map: HeapId, key: Value) -> RunResult<bool> {
        let hash = self.key_hash(key);
        let mut m = self.take_map(map)?;
        let found = m
            .indices
            .find_entry(hash, |&i| m.entries[i].hash == hash && values_equal(self, m.entries[i].key, key));
        let removed = match found {
            Ok(occupied) => {
                let (i, _) = occupied.remove();
                m.entries.swap_remove(i);
                // the entry that filled slot i (previously last) needs its
                // table index rewritten
                if i < m.entries.len() {
                    let moved_hash = m.entries[i].hash;
                    let old_index = m.entries.len();
                    if let Some(slot) = m.indices.find_mut(moved_hash, |&j| j == old_index) {
                        *slot = i;
                    }
                }
                true
            }
            Err(_) => false,
        };
        self.put_map(map, m);
        Ok(removed)
    }

    /// Key iteration: `None` yields the first key, a present key yields the
    /// key after it, the last key yields `None`. The order is unspecified
    /// but stable between modifications.
    pub(crate) fn map_next_key(&self, map: HeapId, prev: Option<Value>) -> Option<Value> {
        let m = self.map_ref(map)?;
        match prev {
            None => m.entries.first().map(|e| e.key),
            Some(key) => {
                let hash = self.key_hash(key);
                let idx = m
                    .indices
                    .find(hash, |&i| m.entries[i].hash == hash && values_equal(self, m.entries[i].key, key))?;
                m.entries.get(*idx + 1).map(|e| e.key)
            }
        }
    }

    // ---- garbage collection --------------------------------------------

    /// Mark-and-sweep over the given roots plus every pinned object.
    ///
    /// Every object reachable from a root keeps its identity; everything
    /// else is freed and its slot recycled.
    pub(crate) fn collect(&mut self, roots: impl IntoIterator<Item = HeapId>) {
        let mut reachable = vec![false; self.entries.len()];
        let mut worklist: Vec<HeapId> = roots.into_iter().collect();
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.as_ref().is_some_and(|e| e.pin > 0) {
                worklist.push(HeapId(u32::try_from(i).unwrap_or(u32::MAX)));
            }
        }

        while let Some(id) = worklist.pop() {
            let idx = id.index();
            if idx >= reachable.len() || reachable[idx] {
                continue;
            }
            reachable[idx] = true;
            if let Some(entry) = &self.entries[idx] {
                collect_child_ids(&entry.data, &mut worklist);
            }
        }

        for (idx, slot) in self.entries.iter_mut().enumerate() {
            if reachable[idx] || slot.is_none() {
                continue;
            }
            *slot = None;
            self.free_list.push(HeapId(u32::try_from(idx).unwrap_or(u32::MAX)));
        }
        self.allocs_since_gc = 0;
    }
}

/// Pushes every heap object directly referenced by `data` onto the
/// worklist.
fn collect_child_ids(data: &HeapData, worklist: &mut Vec<HeapId>) {
    fn push(v: Value, worklist: &mut Vec<HeapId>) {
        if let Value::Ref(id) = v {
            worklist.push(id);
        }
    }
    match data {
        HeapData::Str(_) => {}
        HeapData::Array(a) => {
            for &v in a.items() {
                push(v, worklist);
            }
        }
        HeapData::Map(m) => {
            for v in m.keys_and_values() {
                push(v, worklist);
            }
        }
        HeapData::FuncDef(fd) => {
            if let Some(name) = fd.name {
                worklist.push(name);
            }
            for &v in fd.consts.iter() {
                push(v, worklist);
            }
        }
        HeapData::Closure(c) => {
            worklist.push(c.func_def);
            worklist.extend(c.upvals.iter().copied());
        }
        HeapData::Upval(u) => {
            if let UpvalState::Closed(v) = u.state {
                push(v, worklist);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collection_frees_unreachable_objects_and_keeps_roots() {
        let mut heap = Heap::new();
        let kept = heap.new_str("kept");
        let dropped = heap.new_str("dropped");
        let arr = heap.allocate(HeapData::Array(Array::new()));
        if let HeapData::Array(a) = heap.get_mut(arr) {
            a.push(Value::Ref(kept));
        }
        heap.collect([arr]);
        assert!(heap.is_live(arr));
        assert!(heap.is_live(kept));
        assert!(!heap.is_live(dropped));
        assert_eq!(heap.as_str(kept).unwrap().as_str(), "kept");
    }

    #[test]
    fn pinned_objects_survive_without_roots() {
        let mut heap = Heap::new();
        let s = heap.new_str("pinned");
        heap.pin(s);
        heap.collect([]);
        assert!(heap.is_live(s));
        heap.unpin(s);
        heap.collect([]);
        assert!(!heap.is_live(s));
    }

    #[test]
    fn cycles_are_collected() {
        let mut heap = Heap::new();
        let a = heap.allocate(HeapData::Array(Array::new()));
        let b = heap.allocate(HeapData::Array(Array::new()));
        if let HeapData::Array(arr) = heap.get_mut(a) {
            arr.push(Value::Ref(b));
        }
        if let HeapData::Array(arr) = heap.get_mut(b) {
            arr.push(Value::Ref(a));
        }
        heap.collect([a]);
        assert!(heap.is_live(a) && heap.is_live(b));
        heap.collect([]);
        assert!(!heap.is_live(a) && !heap.is_live(b));
    }

    #[test]
    fn freed_slots_are_reused() {
        let mut heap = Heap::new();
        let a = heap.new_str("a");
        heap.collect([]);
        let b = heap.new_str("b");
        assert_eq!(a, b, "the freed slot should be recycled");
    }

    #[test]
    fn map_insert_lookup_delete() {
        let mut heap = Heap::new();
        let map = heap.allocate(HeapData::Map(Map::new()));
        let k1 = Value::Ref(heap.new_str("x"));
        let k1b = Value::Ref(heap.new_str("x"));
        let k2 = Value::Number(2.0);
        heap.map_insert(map, k1, Value::Number(1.0)).unwrap();
        heap.map_insert(map, k2, Value::Bool(true)).unwrap();
        assert_eq!(heap.map_len(map), 2);
        // equal string contents find the same entry
        assert_eq!(heap.map_get(map, k1b), Some(Value::Number(1.0)));
        heap.map_insert(map, k1b, Value::Number(9.0)).unwrap();
        assert_eq!(heap.map_len(map), 2);
        assert_eq!(heap.map_get(map, k1), Some(Value::Number(9.0)));
        assert!(heap.map_get(map, Value::Number(3.0)).is_none());
        assert!(heap.map_delete(map, k1).unwrap());
        assert!(!heap.map_delete(map, k1).unwrap());
        assert_eq!(heap.map_len(map), 1);
        assert_eq!(heap.map_get(map, k2), Some(Value::Bool(true)));
    }

    #[test]
    fn map_rejects_null_keys() {
        let mut heap = Heap::new();
        let map = heap.allocate(HeapData::Map(Map::new()));
        assert!(heap.map_insert(map, Value::Null, Value::Number(1.0)).is_err());
    }

    #[test]
    fn map_key_iteration_visits_every_key_once() {
        let mut heap = Heap::new();
        let map = heap.allocate(HeapData::Map(Map::new()));
        for i in 0..5 {
            heap.map_insert(map, Value::Number(f64::from(i)), Value::Number(0.0)).unwrap();
        }
        let mut seen = Vec::new();
        let mut key = heap.map_next_key(map, None);
        while let Some(k) = key {
            seen.push(k.as_number().unwrap());
            key = heap.map_next_key(map, Some(k));
        }
        seen.sort_by(f64::total_cmp);
        assert_eq!(seen, [0.0, 1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn negative_zero_key_matches_positive_zero() {
        let mut heap = Heap::new();
        let map = heap.allocate(HeapData::Map(Map::new()));
        heap.map_insert(map, Value::Number(0.0), Value::Bool(true)).unwrap();
        assert_eq!(heap.map_get(map, Value::Number(-0.0)), Some(Value::Bool(true)));
    }
}
