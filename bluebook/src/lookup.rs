//! Method lookup: the global method cache, method dictionary probing along
//! the superclass chain and the `doesNotUnderstand:` fallback.

use log::trace;

use crate::{
    Body, HeapObject, Interpreter, MemoryError, ObjectMemory, Value, VmError,
    object::FORMAT_FIXED,
    special::{
        CLASS_METHOD_DICTIONARY, CLASS_SUPERCLASS, MESSAGE_ARGUMENTS, MESSAGE_LOOKUP_CLASS,
        MESSAGE_SELECTOR, METHOD_DICT_ARRAY, METHOD_DICT_SELECTOR_START,
        SELECTOR_DOES_NOT_UNDERSTAND,
    },
};

/// Marks an unused cache slot; selectors are never SmallIntegers.
const EMPTY: Value = Value::from_raw(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheEntry {
    pub selector: Value,
    pub class: Value,
    pub method: Value,
    pub primitive: u32,
}

impl CacheEntry {
    const fn empty() -> Self {
        Self {
            selector: EMPTY,
            class: EMPTY,
            method: EMPTY,
            primitive: 0,
        }
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Method dictionaries probed on misses.
    pub dictionary_lookups: u64,
}

/// Associative (selector, class) -> method cache.
pub struct MethodCache {
    entries: Vec<CacheEntry>,
    mask: usize,
    probes: usize,
    randomish: usize,
    pub stats: CacheStats,
}

impl MethodCache {
    pub fn new(size: usize, probes: usize) -> Self {
        debug_assert!(size.is_power_of_two());
        Self {
            entries: vec![CacheEntry::empty(); size],
            mask: size - 1,
            probes,
            randomish: 0,
            stats: CacheStats::default(),
        }
    }

    pub fn lookup(
        &mut self,
        selector: Value,
        class: Value,
        selector_hash: u16,
        class_hash: u16,
    ) -> Option<CacheEntry> {
        let step = usize::from(selector_hash);
        let mut probe = (step ^ usize::from(class_hash)) & self.mask;
        for _ in 0..self.probes {
            let entry = self.entries[probe];
            if entry.selector == selector && entry.class == class {
                self.stats.hits += 1;
                return Some(entry);
            }
            probe = (probe + step) & self.mask;
        }
        self.stats.misses += 1;
        None
    }

    /// Stores `entry` in a free probe slot, or evicts a rotating victim.
    pub fn insert(&mut self, entry: CacheEntry, selector_hash: u16, class_hash: u16) {
        let step = usize::from(selector_hash);
        let first = (step ^ usize::from(class_hash)) & self.mask;
        let mut probe = first;
        for _ in 0..self.probes {
            if self.entries[probe].selector == EMPTY {
                self.entries[probe] = entry;
                return;
            }
            probe = (probe + step) & self.mask;
        }
        let mut victim = first;
        for _ in 0..self.randomish {
            victim = (victim + step) & self.mask;
        }
        self.randomish = (self.randomish + 1) % self.probes;
        self.entries[victim] = entry;
    }

    pub fn clear(&mut self) {
        self.entries.fill(CacheEntry::empty());
    }

    pub fn flush_method(&mut self, method: Value) {
        for entry in self.entries.iter_mut().filter(|e| e.method == method) {
            *entry = CacheEntry::empty();
        }
    }

    pub fn flush_selector(&mut self, selector: Value) {
        for entry in self.entries.iter_mut().filter(|e| e.selector == selector) {
            *entry = CacheEntry::empty();
        }
    }

    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in self.entries.iter_mut().filter(|e| e.selector != EMPTY) {
            visitor(&mut entry.selector);
            visitor(&mut entry.class);
            visitor(&mut entry.method);
        }
    }
}

/// Probes one method dictionary. Selectors sit from index 2 on, methods in
/// the parallel array at `index - 2`.
pub fn lookup_in_dictionary(
    memory: &ObjectMemory,
    dictionary: Value,
    selector: Value,
    nil: Value,
) -> Result<Option<Value>, MemoryError> {
    let Some(fields) = memory.get(dictionary).and_then(HeapObject::pointers) else {
        return Ok(None);
    };
    let size = fields.len();
    if size <= METHOD_DICT_SELECTOR_START {
        return Ok(None);
    }
    let mask = (size - METHOD_DICT_SELECTOR_START).next_power_of_two() - 1;
    let hash = usize::from(memory.hash_of(selector));
    let mut index = (mask & hash) + METHOD_DICT_SELECTOR_START;
    if index >= size {
        index = METHOD_DICT_SELECTOR_START;
    }
    let mut wrapped = false;
    loop {
        let candidate = fields[index];
        if candidate == selector {
            let methods = fields[METHOD_DICT_ARRAY];
            return memory
                .fetch(methods, index - METHOD_DICT_SELECTOR_START)
                .map(Some);
        }
        if candidate == nil {
            return Ok(None);
        }
        index += 1;
        if index == size {
            if wrapped {
                return Ok(None);
            }
            index = METHOD_DICT_SELECTOR_START;
            wrapped = true;
        }
    }
}

impl Interpreter {
    /// Walks the superclass chain from `class`, consulting the cache first.
    pub fn lookup_method(
        &mut self,
        selector: Value,
        class: Value,
    ) -> Result<Option<CacheEntry>, VmError> {
        let selector_hash = self.memory.hash_of(selector);
        let class_hash = self.memory.hash_of(class);
        if let Some(entry) = self
            .state
            .method_cache
            .lookup(selector, class, selector_hash, class_hash)
        {
            return Ok(Some(entry));
        }

        let nil = self.state.special.nil;
        let mut current = class;
        while current != nil {
            self.state.method_cache.stats.dictionary_lookups += 1;
            let dictionary = self.memory.fetch(current, CLASS_METHOD_DICTIONARY)?;
            if let Some(method) = lookup_in_dictionary(&self.memory, dictionary, selector, nil)? {
                let primitive = self
                    .memory
                    .object(method)?
                    .method_header()
                    .map_or(0, |h| h.primitive());
                let entry = CacheEntry {
                    selector,
                    class,
                    method,
                    primitive,
                };
                self.state
                    .method_cache
                    .insert(entry, selector_hash, class_hash);
                return Ok(Some(entry));
            }
            current = self.memory.fetch(current, CLASS_SUPERCLASS)?;
        }
        Ok(None)
    }

    /// Resolves the pending message in `class`, rewriting it into a
    /// `doesNotUnderstand:` send when no method is found. Leaves the result in
    /// `new_method` / `primitive_index`.
    pub(crate) fn find_new_method_in_class(&mut self, class: Value) -> Result<(), VmError> {
        let selector = self.state.message_selector;
        if let Some(entry) = self.lookup_method(selector, class)? {
            self.state.new_method = entry.method;
            self.state.primitive_index = entry.primitive;
            return Ok(());
        }

        let dnu = self.special_object(SELECTOR_DOES_NOT_UNDERSTAND)?;
        if selector == dnu {
            return Err(VmError::RecursiveDoesNotUnderstand {
                selector: self.string_of(selector),
            });
        }
        trace!("{} not understood", self.string_of(selector));
        self.create_actual_message(class)?;
        self.state.message_selector = dnu;
        self.find_new_method_in_class(class)
    }

    /// Replaces the arguments on the stack with a Message describing the send.
    fn create_actual_message(&mut self, lookup_class: Value) -> Result<(), VmError> {
        let argc = self.state.argument_count;
        let nil = self.state.special.nil;
        let array_class = self.state.special.array_class;
        let message_class = self.state.special.message_class;

        let arguments = self
            .memory
            .instantiate(array_class, argc, nil, &mut self.state)?;
        for i in 0..argc {
            let argument = self.stack_value(argc - 1 - i)?;
            self.memory.store(arguments, i, argument)?;
        }

        let mut fields = vec![nil; MESSAGE_LOOKUP_CLASS];
        fields[MESSAGE_SELECTOR] = self.state.message_selector;
        fields[MESSAGE_ARGUMENTS] = arguments;
        if self.message_has_lookup_class()? {
            fields.push(lookup_class);
        }
        let message = self.memory.register(
            HeapObject::new(message_class, FORMAT_FIXED, Body::Pointers(fields)),
            &mut self.state,
        )?;

        self.pop_n(argc);
        self.push(message)?;
        self.state.argument_count = 1;
        Ok(())
    }

    /// Whether instances of Message carry the `lookupClass` slot.
    fn message_has_lookup_class(&self) -> Result<bool, VmError> {
        let format = self.class_format(self.state.special.message_class)?;
        Ok(format.inst_size() > MESSAGE_LOOKUP_CLASS)
    }
}
