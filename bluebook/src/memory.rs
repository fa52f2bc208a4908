//! Object memory: an arena that owns every heap object plus an ordered
//! enumeration table.
//!
//! The table never keeps anything alive. Liveness is decided by marking from
//! a [`RootProvider`]; unmarked objects are freed and their table slots are
//! squeezed out while the survivors keep their relative order. Objects below
//! the old boundary are treated as live by partial compactions.

use std::collections::HashMap;

use log::{debug, info, warn};

use crate::{
    BecomeError, Body, ClassFormat, HeapObject, MemoryError, Value, VmConfig,
    object::{FORMAT_BYTES, FORMAT_METHOD, byte_format_for},
    special::CLASS_FORMAT,
};

// ── Roots ─────────────────────────────────────────────────────────────

/// Supplies the strong references held outside the heap.
///
/// The visitor receives `&mut Value` so `become:` can rewrite roots in place.
pub trait RootProvider {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value));

    /// Drop cached references that should not keep objects alive.
    fn flush_caches(&mut self) {}
}

/// No roots at all; everything outside the old region is garbage.
pub struct NoRoots;

impl RootProvider for NoRoots {
    fn visit_roots(&mut self, _visitor: &mut dyn FnMut(&mut Value)) {}
}

impl RootProvider for Vec<Value> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for value in self.iter_mut() {
            visitor(value);
        }
    }
}

/// Roots plus the references of an object that is about to be registered.
struct PendingRoots<'a> {
    roots: &'a mut dyn RootProvider,
    pending: Vec<Value>,
}

impl RootProvider for PendingRoots<'_> {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.roots.visit_roots(visitor);
        for value in self.pending.iter_mut() {
            visitor(value);
        }
    }

    fn flush_caches(&mut self) {
        self.roots.flush_caches();
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MemoryStats {
    pub partial_compactions: usize,
    pub full_compactions: usize,
    pub grows: usize,
    pub freed: usize,
}

// ── Object memory ─────────────────────────────────────────────────────

pub struct ObjectMemory {
    objects: Vec<Option<HeapObject>>,
    free: Vec<u32>,
    table: Vec<Option<Value>>,
    capacity: usize,
    max_size: usize,
    grow_size: usize,
    compaction_attempts: usize,
    max_old: usize,
    last_hash: u32,
    last_index: usize,
    stats: MemoryStats,
}

impl ObjectMemory {
    pub fn new(config: &VmConfig) -> Self {
        Self {
            objects: Vec::new(),
            free: Vec::new(),
            table: Vec::with_capacity(config.table_size),
            capacity: config.table_size,
            max_size: config.table_max_size,
            grow_size: config.table_grow_size,
            compaction_attempts: config.compaction_attempts,
            max_old: 0,
            last_hash: 0,
            last_index: 0,
            stats: MemoryStats::default(),
        }
    }

    pub fn seed_hash(&mut self, last_hash: u32) {
        self.last_hash = last_hash;
    }

    pub fn stats(&self) -> MemoryStats {
        self.stats
    }

    /// Highest used table index plus one.
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn occupied_count(&self) -> usize {
        self.table.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn max_old(&self) -> usize {
        self.max_old
    }

    /// Everything registered so far becomes old.
    pub fn tenure(&mut self) {
        self.max_old = self.table.len();
    }

    pub fn slots_left(&self) -> usize {
        self.max_size.saturating_sub(self.table.len())
    }

    fn next_hash(&mut self) -> u16 {
        self.last_hash = 13849u32.wrapping_add(27181u32.wrapping_mul(self.last_hash));
        (self.last_hash & 0xFFF) as u16
    }

    fn place(&mut self, object: HeapObject) -> Value {
        let index = match self.free.pop() {
            Some(index) => {
                self.objects[index as usize] = Some(object);
                index
            }
            None => {
                self.objects.push(Some(object));
                (self.objects.len() - 1) as u32
            }
        };
        let value = Value::from_index(index);
        self.table.push(Some(value));
        value
    }

    /// Registers `object`, assigning a fresh identity hash. May compact or
    /// grow the table first.
    pub fn register(
        &mut self,
        mut object: HeapObject,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, MemoryError> {
        if self.table.len() >= self.capacity {
            let mut pending = vec![object.class];
            if let Some(fields) = object.pointers() {
                pending.extend_from_slice(fields);
            }
            let mut roots = PendingRoots { roots, pending };
            self.grow_or_fail(self.grow_size, &mut roots)?;
        }
        object.hash = self.next_hash();
        Ok(self.place(object))
    }

    /// Registers an object read from an image. It keeps its stored hash, the
    /// hash sequence still advances, and the table grows without compacting.
    pub fn register_image_object(&mut self, object: HeapObject) -> Result<Value, MemoryError> {
        if self.table.len() >= self.capacity {
            self.grow(self.grow_size)?;
        }
        self.next_hash();
        Ok(self.place(object))
    }

    // ── Access ────────────────────────────────────────────────────────

    pub fn get(&self, value: Value) -> Option<&HeapObject> {
        self.objects.get(value.index()?)?.as_ref()
    }

    pub fn get_mut(&mut self, value: Value) -> Option<&mut HeapObject> {
        self.objects.get_mut(value.index()?)?.as_mut()
    }

    pub fn object(&self, value: Value) -> Result<&HeapObject, MemoryError> {
        self.get(value).ok_or(MemoryError::InvalidReference(value))
    }

    pub fn object_mut(&mut self, value: Value) -> Result<&mut HeapObject, MemoryError> {
        self.get_mut(value).ok_or(MemoryError::InvalidReference(value))
    }

    pub fn fetch(&self, object: Value, index: usize) -> Result<Value, MemoryError> {
        let fields = self
            .object(object)?
            .pointers()
            .ok_or(MemoryError::NotPointers(object))?;
        fields
            .get(index)
            .copied()
            .ok_or(MemoryError::IndexOutOfBounds { object, index })
    }

    pub fn store(&mut self, object: Value, index: usize, value: Value) -> Result<(), MemoryError> {
        let fields = self
            .object_mut(object)?
            .pointers_mut()
            .ok_or(MemoryError::NotPointers(object))?;
        let slot = fields
            .get_mut(index)
            .ok_or(MemoryError::IndexOutOfBounds { object, index })?;
        *slot = value;
        Ok(())
    }

    pub fn fetch_small(&self, object: Value, index: usize) -> Result<i32, MemoryError> {
        let value = self.fetch(object, index)?;
        value.as_small().ok_or(MemoryError::NotSmallInteger(value))
    }

    pub fn pointer_len(&self, object: Value) -> usize {
        self.get(object).map_or(0, HeapObject::pointer_len)
    }

    pub fn hash_of(&self, object: Value) -> u16 {
        self.get(object).map_or(0, |o| o.hash)
    }

    // ── Compaction ────────────────────────────────────────────────────

    fn mark(&self, start: usize, roots: &mut dyn RootProvider) -> Vec<bool> {
        let mut marks = vec![false; self.objects.len()];
        let mut stack: Vec<usize> = Vec::new();
        roots.visit_roots(&mut |value: &mut Value| {
            if let Some(index) = value.index() {
                stack.push(index);
            }
        });
        stack.extend(self.table[..start].iter().flatten().filter_map(|v| v.index()));

        while let Some(index) = stack.pop() {
            if index >= marks.len() || marks[index] {
                continue;
            }
            let Some(object) = &self.objects[index] else {
                continue;
            };
            marks[index] = true;
            if let Some(class) = object.class.index() {
                stack.push(class);
            }
            if let Some(fields) = object.pointers() {
                stack.extend(fields.iter().filter_map(|v| v.index()));
            }
        }
        marks
    }

    /// Frees every unreachable object registered at or after `start` and
    /// closes the gaps, preserving order. Returns the new used length.
    pub fn compact(&mut self, start: usize, roots: &mut dyn RootProvider) -> usize {
        let start = start.min(self.table.len());
        let marks = self.mark(start, roots);

        let mut write = start;
        let mut freed = 0;
        for read in start..self.table.len() {
            let Some(value) = self.table[read] else {
                continue;
            };
            let live = value.index().is_some_and(|index| marks[index]);
            if live {
                self.table[write] = Some(value);
                write += 1;
            } else if let Some(index) = value.index() {
                self.objects[index] = None;
                self.free.push(index as u32);
                freed += 1;
            }
        }
        self.table.truncate(write);
        self.max_old = self.max_old.min(write);
        self.last_index = 0;
        self.stats.freed += freed;
        debug!("compacted table from {start}: freed {freed}, {write} slots used");
        write
    }

    pub fn partial_gc(&mut self, roots: &mut dyn RootProvider) -> usize {
        self.stats.partial_compactions += 1;
        self.compact(self.max_old, roots)
    }

    pub fn full_gc(&mut self, roots: &mut dyn RootProvider) -> usize {
        self.stats.full_compactions += 1;
        roots.flush_caches();
        self.compact(0, roots)
    }

    /// Makes room for `request` more registrations, compacting first and
    /// growing the table only if that was not enough.
    pub fn grow_or_fail(
        &mut self,
        request: usize,
        roots: &mut dyn RootProvider,
    ) -> Result<(), MemoryError> {
        let starting = self.table.len();
        // A pass over unchanged roots reclaims nothing new.
        let mut dirty = true;
        for attempt in 0..self.compaction_attempts {
            if attempt == 2 {
                roots.flush_caches();
                dirty = true;
            }
            if !dirty {
                continue;
            }
            self.partial_gc(roots);
            dirty = false;
            if starting - self.table.len() >= request {
                return Ok(());
            }
        }

        if self.capacity + request > self.max_size {
            self.full_gc(roots);
            if self.table.len() < self.capacity {
                warn!("object table nearly full: {} of {}", self.table.len(), self.capacity);
                return Ok(());
            }
            return Err(MemoryError::TableFull {
                capacity: self.capacity,
            });
        }
        self.grow(request)
    }

    fn grow(&mut self, request: usize) -> Result<(), MemoryError> {
        if self.capacity + request > self.max_size {
            return Err(MemoryError::TableFull {
                capacity: self.capacity,
            });
        }
        self.capacity += request;
        self.table.reserve(request);
        self.stats.grows += 1;
        info!("growing object table to {} slots", self.capacity);
        Ok(())
    }

    // ── Become ────────────────────────────────────────────────────────

    /// Replaces every reference to `sources[i]` with `targets[i]` (and the
    /// reverse when `two_way`), in all objects and all roots.
    pub fn bulk_become(
        &mut self,
        sources: &[Value],
        targets: &[Value],
        two_way: bool,
        roots: &mut dyn RootProvider,
    ) -> Result<(), BecomeError> {
        if sources.len() != targets.len() {
            return Err(BecomeError::DifferentLengths);
        }
        let mut mutations: HashMap<Value, Value> =
            HashMap::with_capacity(sources.len() * if two_way { 2 } else { 1 });
        for (&source, &target) in sources.iter().zip(targets) {
            if self.get(source).is_none() {
                return Err(BecomeError::NonObjectInSource(source));
            }
            if mutations.insert(source, target).is_some() {
                return Err(BecomeError::RepeatedInSource(source));
            }
        }
        let mut seen_targets: HashMap<Value, Value> = HashMap::with_capacity(targets.len());
        for (&source, &target) in sources.iter().zip(targets) {
            if self.get(target).is_none() {
                return Err(BecomeError::NonObjectInTarget(target));
            }
            if mutations.contains_key(&target) {
                return Err(BecomeError::Overlapping(target));
            }
            if seen_targets.insert(target, source).is_some() && two_way {
                return Err(BecomeError::RepeatedInTarget(target));
            }
        }
        if two_way {
            mutations.extend(seen_targets);
        }

        let substitute = |value: &mut Value| {
            if let Some(&replacement) = mutations.get(value) {
                *value = replacement;
            }
        };
        for slot in self.table.iter().flatten() {
            let Some(object) = slot.index().and_then(|i| self.objects[i].as_mut()) else {
                continue;
            };
            substitute(&mut object.class);
            if let Some(fields) = object.pointers_mut() {
                fields.iter_mut().for_each(substitute);
            }
        }
        roots.visit_roots(&mut |value: &mut Value| substitute(value));
        roots.flush_caches();
        debug!("become: {} objects, two way {two_way}", sources.len());
        Ok(())
    }

    // ── Enumeration ───────────────────────────────────────────────────

    /// First object at or after table index `start`, optionally restricted to
    /// instances of `class`.
    pub fn next_instance(&mut self, start: usize, class: Option<Value>) -> Option<Value> {
        for index in start..self.table.len() {
            let Some(value) = self.table[index] else {
                continue;
            };
            let matches = match class {
                Some(class) => self.get(value).is_some_and(|o| o.class == class),
                None => true,
            };
            if matches {
                self.last_index = index;
                return Some(value);
            }
        }
        None
    }

    /// Table index of `object`, checking the last enumeration hit first.
    pub fn index_of(&self, object: Value) -> Option<usize> {
        if self.table.get(self.last_index).copied().flatten() == Some(object) {
            return Some(self.last_index);
        }
        self.table.iter().position(|slot| *slot == Some(object))
    }

    // ── Instantiation ─────────────────────────────────────────────────

    /// New instance of `class` with `indexable` extra slots, fields set to
    /// `nil` and bits zeroed.
    pub fn instantiate(
        &mut self,
        class: Value,
        indexable: usize,
        nil: Value,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, MemoryError> {
        let class_format = self
            .fetch(class, CLASS_FORMAT)?
            .as_small()
            .map(ClassFormat)
            .ok_or(MemoryError::NotAClass(class))?;
        let fixed = class_format.inst_size();
        let (format, body) = match class_format.format() {
            format @ 0..=4 => (format, Body::Pointers(vec![nil; fixed + indexable])),
            5..=7 => (6, Body::Words(vec![0; indexable])),
            8..=11 => (
                byte_format_for(FORMAT_BYTES, indexable),
                Body::Bytes(vec![0; indexable]),
            ),
            _ => (
                byte_format_for(FORMAT_METHOD, indexable),
                Body::Method {
                    literals: vec![Value::from_raw(1)],
                    bytecode: vec![0; indexable],
                },
            ),
        };
        self.register(HeapObject::new(class, format, body), roots)
    }

    /// Shallow copy with a fresh identity.
    pub fn clone_object(
        &mut self,
        object: Value,
        roots: &mut dyn RootProvider,
    ) -> Result<Value, MemoryError> {
        let copy = self.object(object)?.clone();
        self.register(copy, roots)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{FORMAT_FIXED, FORMAT_WORDS};

    fn small_config() -> VmConfig {
        VmConfig {
            table_size: 16,
            table_max_size: 64,
            table_grow_size: 8,
            ..VmConfig::default()
        }
    }

    fn plain(memory: &mut ObjectMemory, fields: Vec<Value>) -> Value {
        let object = HeapObject::new(Value::from_raw(1), FORMAT_FIXED, Body::Pointers(fields));
        memory.register(object, &mut NoRoots).expect("register")
    }

    #[test]
    fn compaction_drops_unreachable_and_keeps_order() {
        let mut memory = ObjectMemory::new(&small_config());
        let objects: Vec<Value> = (0..10).map(|_| plain(&mut memory, vec![])).collect();
        assert_eq!(memory.occupied_count(), 10);

        let mut roots: Vec<Value> = objects
            .iter()
            .enumerate()
            .filter(|(i, _)| !(3..7).contains(i))
            .map(|(_, v)| *v)
            .collect();
        let used = memory.compact(0, &mut roots);

        assert_eq!(used, 6);
        assert_eq!(memory.occupied_count(), 6);
        let mut survivors = Vec::new();
        let mut start = 0;
        while let Some(v) = memory.next_instance(start, None) {
            survivors.push(v);
            start = memory.index_of(v).expect("indexed") + 1;
        }
        assert_eq!(survivors, roots);
        assert!(memory.get(objects[4]).is_none());
    }

    #[test]
    fn referenced_objects_survive() {
        let mut memory = ObjectMemory::new(&small_config());
        let leaf = plain(&mut memory, vec![]);
        let root = plain(&mut memory, vec![leaf]);
        let garbage = plain(&mut memory, vec![leaf]);
        memory.compact(0, &mut vec![root]);
        assert!(memory.get(leaf).is_some());
        assert!(memory.get(garbage).is_none());
    }

    #[test]
    fn partial_compaction_keeps_old_objects() {
        let mut memory = ObjectMemory::new(&small_config());
        let old = plain(&mut memory, vec![]);
        memory.tenure();
        let young = plain(&mut memory, vec![]);

        memory.partial_gc(&mut NoRoots);
        assert!(memory.get(old).is_some());
        assert!(memory.get(young).is_none());

        memory.full_gc(&mut NoRoots);
        assert!(memory.get(old).is_none());
        assert_eq!(memory.max_old(), 0);
    }

    #[test]
    fn table_grows_then_fails_at_ceiling() {
        let mut memory = ObjectMemory::new(&small_config());
        let mut roots = Vec::new();
        for _ in 0..64 {
            let object = HeapObject::new(Value::from_raw(1), FORMAT_FIXED, Body::Pointers(vec![]));
            let value = memory.register(object, &mut roots).expect("fits");
            roots.push(value);
        }
        assert_eq!(memory.capacity(), 64);
        assert!(memory.stats().grows >= 6);

        let object = HeapObject::new(Value::from_raw(1), FORMAT_FIXED, Body::Pointers(vec![]));
        assert_eq!(
            memory.register(object, &mut roots),
            Err(MemoryError::TableFull { capacity: 64 })
        );
    }

    #[test]
    fn full_table_reclaims_before_growing() {
        let mut memory = ObjectMemory::new(&small_config());
        for _ in 0..16 {
            plain(&mut memory, vec![]);
        }
        let fresh = plain(&mut memory, vec![]);
        assert_eq!(memory.capacity(), 16);
        assert_eq!(memory.occupied_count(), 1);
        assert!(memory.get(fresh).is_some());
    }

    #[test]
    fn pending_object_references_survive_collection() {
        let mut memory = ObjectMemory::new(&small_config());
        let mut last = Value::from_raw(1);
        for _ in 0..16 {
            last = plain(&mut memory, vec![]);
        }
        let holder = plain(&mut memory, vec![last]);
        assert!(memory.get(last).is_some());
        assert_eq!(memory.fetch(holder, 0), Ok(last));
    }

    #[test]
    fn hash_sequence_is_deterministic() {
        let mut memory = ObjectMemory::new(&small_config());
        let a = plain(&mut memory, vec![]);
        let b = plain(&mut memory, vec![]);
        assert_eq!(memory.hash_of(a), 13849 & 0xFFF);
        let second = 13849u32.wrapping_add(27181u32.wrapping_mul(13849));
        assert_eq!(memory.hash_of(b), (second & 0xFFF) as u16);
    }

    #[test]
    fn become_rejects_bad_requests_without_mutation() {
        let mut memory = ObjectMemory::new(&small_config());
        let a = plain(&mut memory, vec![]);
        let b = plain(&mut memory, vec![]);
        let c = plain(&mut memory, vec![]);
        let holder = plain(&mut memory, vec![a, b]);

        assert_eq!(
            memory.bulk_become(&[a, a], &[b, c], false, &mut NoRoots),
            Err(BecomeError::RepeatedInSource(a))
        );
        assert_eq!(
            memory.bulk_become(&[a], &[b, c], false, &mut NoRoots),
            Err(BecomeError::DifferentLengths)
        );
        let small = Value::small(3).expect("small");
        assert_eq!(
            memory.bulk_become(&[small], &[b], false, &mut NoRoots),
            Err(BecomeError::NonObjectInSource(small))
        );
        assert_eq!(
            memory.bulk_become(&[a, c], &[b, b], true, &mut NoRoots),
            Err(BecomeError::RepeatedInTarget(b))
        );
        assert_eq!(
            memory.bulk_become(&[a, b], &[b, c], false, &mut NoRoots),
            Err(BecomeError::Overlapping(b))
        );
        assert_eq!(memory.fetch(holder, 0), Ok(a));
        assert_eq!(memory.fetch(holder, 1), Ok(b));
    }

    #[test]
    fn two_way_become_swaps_references_and_roots() {
        let mut memory = ObjectMemory::new(&small_config());
        let a = plain(&mut memory, vec![]);
        let b = plain(&mut memory, vec![]);
        let holder = plain(&mut memory, vec![a, b, a]);
        let mut roots = vec![a, holder];

        memory
            .bulk_become(&[a], &[b], true, &mut roots)
            .expect("valid become");

        assert_eq!(memory.fetch(holder, 0), Ok(b));
        assert_eq!(memory.fetch(holder, 1), Ok(a));
        assert_eq!(memory.fetch(holder, 2), Ok(b));
        assert_eq!(roots[0], b);
    }

    #[test]
    fn one_way_become_rewrites_classes() {
        let mut memory = ObjectMemory::new(&small_config());
        let old_class = plain(&mut memory, vec![]);
        let new_class = plain(&mut memory, vec![]);
        let instance = memory
            .register(
                HeapObject::new(old_class, FORMAT_WORDS, Body::Words(vec![1, 2])),
                &mut NoRoots,
            )
            .expect("register");

        memory
            .bulk_become(&[old_class], &[new_class], false, &mut NoRoots)
            .expect("valid become");
        assert_eq!(memory.object(instance).map(|o| o.class), Ok(new_class));
    }

    #[test]
    fn instantiate_follows_class_format() {
        let mut memory = ObjectMemory::new(&small_config());
        let nil = plain(&mut memory, vec![]);
        let format = ClassFormat::new(2, crate::object::FORMAT_FIXED_INDEXABLE).value();
        let class = plain(&mut memory, vec![nil, nil, format]);

        let instance = memory
            .instantiate(class, 3, nil, &mut NoRoots)
            .expect("instantiate");
        let object = memory.object(instance).expect("live");
        assert_eq!(object.pointer_len(), 5);
        assert_eq!(object.class, class);
        assert!(object.pointers().expect("pointers").iter().all(|v| *v == nil));
    }
}
