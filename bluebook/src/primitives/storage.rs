//! Indexed access, instantiation and instance enumeration.
//!
//! `at:` and `at:put:` remember, per receiver, where its indexable part
//! starts and how long it is. Bytecodes 192 and 193 consult that cache
//! before doing a full send.

use crate::{
    Body, HeapObject, Interpreter, Value, VmError,
    interpreter::small,
    object::{FORMAT_METHOD, byte_format_for},
    special::CHARACTER_VALUE,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtKind {
    Pointers,
    Words,
    Bytes,
    /// Bytes read and written as Characters.
    Chars,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AtCacheEntry {
    pub object: Value,
    pub kind: AtKind,
    /// Named instance variables before the indexable part.
    pub fixed: usize,
    pub size: usize,
}

/// Direct-mapped caches for `at:` and `at:put:`, indexed by identity hash.
pub struct AtCache {
    at: Vec<Option<AtCacheEntry>>,
    at_put: Vec<Option<AtCacheEntry>>,
    mask: usize,
}

impl AtCache {
    pub fn new(size: usize) -> Self {
        Self {
            at: vec![None; size],
            at_put: vec![None; size],
            mask: size - 1,
        }
    }

    pub fn cached_entry(&self, object: Value, hash: u16, put: bool) -> Option<AtCacheEntry> {
        let table = if put { &self.at_put } else { &self.at };
        table[usize::from(hash) & self.mask].filter(|e| e.object == object)
    }

    pub fn install(&mut self, entry: AtCacheEntry, hash: u16, put: bool) {
        let table = if put { &mut self.at_put } else { &mut self.at };
        table[usize::from(hash) & self.mask] = Some(entry);
    }

    pub fn clear(&mut self) {
        self.at.fill(None);
        self.at_put.fill(None);
    }

    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        for entry in self.at.iter_mut().chain(self.at_put.iter_mut()).flatten() {
            visitor(&mut entry.object);
        }
    }
}

fn one_based(index: Value, size: usize) -> Option<usize> {
    let index = usize::try_from(index.as_small()?).ok()?;
    (1..=size).contains(&index).then_some(index)
}

impl Interpreter {
    /// Shape of the indexable part of `object`, if it has one.
    fn indexable_layout(
        &self,
        object: Value,
        chars: bool,
    ) -> Result<Option<AtCacheEntry>, VmError> {
        if object.is_small_int() {
            return Ok(None);
        }
        let class = self.fetch_class(object)?;
        let format = self.class_format(class)?;
        if !format.is_indexable() {
            return Ok(None);
        }
        let entry = match &self.memory.object(object)?.body {
            Body::Pointers(fields) if !chars => {
                let fixed = format.inst_size();
                AtCacheEntry {
                    object,
                    kind: AtKind::Pointers,
                    fixed,
                    size: fields.len().saturating_sub(fixed),
                }
            }
            Body::Words(words) if !chars => AtCacheEntry {
                object,
                kind: AtKind::Words,
                fixed: 0,
                size: words.len(),
            },
            Body::Bytes(bytes) => AtCacheEntry {
                object,
                kind: if chars { AtKind::Chars } else { AtKind::Bytes },
                fixed: 0,
                size: bytes.len(),
            },
            _ => return Ok(None),
        };
        Ok(Some(entry))
    }

    fn read_indexed(&mut self, entry: AtCacheEntry, index: usize) -> Result<Value, VmError> {
        let object = entry.object;
        let slot = entry.fixed + index - 1;
        match entry.kind {
            AtKind::Pointers => Ok(self.memory.fetch(object, slot)?),
            AtKind::Words => {
                let word = self.memory.object(object)?.words().map_or(0, |w| w[slot]);
                self.positive_32_bit_integer(word)
            }
            AtKind::Bytes | AtKind::Chars => {
                let byte = self.memory.object(object)?.bytes().map_or(0, |b| b[slot]);
                if entry.kind == AtKind::Bytes {
                    return Ok(small(i32::from(byte)));
                }
                let table = self.state.special.character_table;
                Ok(self.memory.fetch(table, usize::from(byte))?)
            }
        }
    }

    /// Answers false if `value` cannot be stored in that kind of slot.
    fn write_indexed(
        &mut self,
        entry: AtCacheEntry,
        index: usize,
        value: Value,
    ) -> Result<bool, VmError> {
        let object = entry.object;
        let slot = entry.fixed + index - 1;
        let byte = match entry.kind {
            AtKind::Pointers => {
                self.memory.store(object, slot, value)?;
                return Ok(true);
            }
            AtKind::Words => {
                let Some(word) = self.positive_32_bit_value(value) else {
                    return Ok(false);
                };
                if let Body::Words(words) = &mut self.memory.object_mut(object)?.body {
                    words[slot] = word;
                }
                return Ok(true);
            }
            AtKind::Bytes => value.as_small(),
            AtKind::Chars => {
                if value.is_small_int()
                    || self.fetch_class(value)? != self.state.special.character_class
                {
                    return Ok(false);
                }
                self.memory.fetch(value, CHARACTER_VALUE)?.as_small()
            }
        };
        let Some(byte) = byte.and_then(|b| u8::try_from(b).ok()) else {
            return Ok(false);
        };
        if let Some(bytes) = self.memory.object_mut(object)?.bytes_mut() {
            bytes[slot] = byte;
        }
        Ok(true)
    }

    /// Whether the pending send may populate the cache for `receiver`.
    fn at_cacheable(&self, receiver: Value, selector_index: usize) -> Result<bool, VmError> {
        let selector = self
            .memory
            .fetch(self.state.special.special_selectors, selector_index * 2)?;
        Ok(self.state.message_selector == selector
            && self.state.lookup_class == self.fetch_class(receiver)?
            && !self.is_context(receiver))
    }

    fn common_at(&mut self, argc: usize, chars: bool) -> Result<bool, VmError> {
        if argc != 1 {
            return Ok(false);
        }
        let receiver = self.receiver_of(argc)?;
        let Some(entry) = self.indexable_layout(receiver, chars)? else {
            return Ok(false);
        };
        let Some(index) = one_based(self.argument(argc, 0)?, entry.size) else {
            return Ok(false);
        };
        if self.at_cacheable(receiver, AT_SELECTOR)? {
            let hash = self.memory.hash_of(receiver);
            self.state.at_cache.install(entry, hash, false);
        }
        let value = self.read_indexed(entry, index)?;
        self.succeed(argc, value)
    }

    fn common_at_put(&mut self, argc: usize, chars: bool) -> Result<bool, VmError> {
        if argc != 2 {
            return Ok(false);
        }
        let receiver = self.receiver_of(argc)?;
        let Some(entry) = self.indexable_layout(receiver, chars)? else {
            return Ok(false);
        };
        let Some(index) = one_based(self.argument(argc, 0)?, entry.size) else {
            return Ok(false);
        };
        let value = self.argument(argc, 1)?;
        if !self.write_indexed(entry, index, value)? {
            return Ok(false);
        }
        if self.at_cacheable(receiver, AT_PUT_SELECTOR)? {
            let hash = self.memory.hash_of(receiver);
            self.state.at_cache.install(entry, hash, true);
        }
        self.succeed(argc, value)
    }

    /// Bytecode 192.
    pub(crate) fn cached_at(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(1)?;
        if receiver.is_small_int() {
            return Ok(false);
        }
        let hash = self.memory.hash_of(receiver);
        let Some(entry) = self.state.at_cache.cached_entry(receiver, hash, false) else {
            return Ok(false);
        };
        let Some(index) = one_based(self.stack_value(0)?, entry.size) else {
            return Ok(false);
        };
        let value = self.read_indexed(entry, index)?;
        self.pop_n_and_push(2, value)?;
        Ok(true)
    }

    /// Bytecode 193.
    pub(crate) fn cached_at_put(&mut self) -> Result<bool, VmError> {
        let receiver = self.stack_value(2)?;
        if receiver.is_small_int() {
            return Ok(false);
        }
        let hash = self.memory.hash_of(receiver);
        let Some(entry) = self.state.at_cache.cached_entry(receiver, hash, true) else {
            return Ok(false);
        };
        let Some(index) = one_based(self.stack_value(1)?, entry.size) else {
            return Ok(false);
        };
        let value = self.stack_value(0)?;
        if !self.write_indexed(entry, index, value)? {
            return Ok(false);
        }
        self.pop_n_and_push(3, value)?;
        Ok(true)
    }
}

// special selector slots of at: and at:put:
const AT_SELECTOR: usize = 16;
const AT_PUT_SELECTOR: usize = 17;

pub fn at(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    vm.common_at(argc, false)
}

pub fn at_put(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    vm.common_at_put(argc, false)
}

pub fn string_at(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    vm.common_at(argc, true)
}

pub fn string_at_put(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    vm.common_at_put(argc, true)
}

pub fn size(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    let size = match vm.indexable_layout(receiver, false)? {
        Some(entry) => entry.size,
        None => match vm.memory.get(receiver).map(|o| &o.body) {
            Some(Body::Method { literals, bytecode }) => literals.len() * 4 + bytecode.len(),
            _ => return Ok(false),
        },
    };
    vm.succeed(argc, small(size as i32))
}

/// Literal access on CompiledMethods; index 1 is the header.
pub fn object_at(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    let Some(len) = vm
        .memory
        .get(receiver)
        .and_then(|o| o.method_header().map(|_| o.pointer_len()))
    else {
        return Ok(false);
    };
    let Some(index) = one_based(vm.argument(argc, 0)?, len) else {
        return Ok(false);
    };
    let value = vm.memory.fetch(receiver, index - 1)?;
    vm.succeed(argc, value)
}

pub fn object_at_put(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    let Some(len) = vm
        .memory
        .get(receiver)
        .and_then(|o| o.method_header().map(|_| o.pointer_len()))
    else {
        return Ok(false);
    };
    let Some(index) = one_based(vm.argument(argc, 0)?, len) else {
        return Ok(false);
    };
    let value = vm.argument(argc, 1)?;
    vm.memory.store(receiver, index - 1, value)?;
    vm.succeed(argc, value)
}

pub fn basic_new(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let class = vm.receiver_of(argc)?;
    if class.is_small_int() {
        return Ok(false);
    }
    let Ok(format) = vm.class_format(class) else {
        return Ok(false);
    };
    if format.is_indexable() {
        return Ok(false);
    }
    let nil = vm.state.special.nil;
    let instance = vm.memory.instantiate(class, 0, nil, &mut vm.state)?;
    vm.succeed(argc, instance)
}

pub fn basic_new_with_arg(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let class = vm.receiver_of(argc)?;
    let Some(size) = vm.argument(argc, 0)?.as_small().and_then(|n| usize::try_from(n).ok()) else {
        return Ok(false);
    };
    if class.is_small_int() {
        return Ok(false);
    }
    let Ok(format) = vm.class_format(class) else {
        return Ok(false);
    };
    if !format.is_indexable() {
        return Ok(false);
    }
    let nil = vm.state.special.nil;
    let instance = vm.memory.instantiate(class, size, nil, &mut vm.state)?;
    vm.succeed(argc, instance)
}

pub fn inst_var_at(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    let len = vm.memory.pointer_len(receiver);
    let Some(index) = one_based(vm.argument(argc, 0)?, len) else {
        return Ok(false);
    };
    let value = vm.memory.fetch(receiver, index - 1)?;
    vm.succeed(argc, value)
}

pub fn inst_var_at_put(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    let len = vm.memory.pointer_len(receiver);
    let Some(index) = one_based(vm.argument(argc, 0)?, len) else {
        return Ok(false);
    };
    let value = vm.argument(argc, 1)?;
    vm.memory.store(receiver, index - 1, value)?;
    vm.succeed(argc, value)
}

/// Identity hash as a SmallInteger.
pub fn as_oop(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    if receiver.is_small_int() {
        return Ok(false);
    }
    let hash = vm.memory.hash_of(receiver);
    vm.succeed(argc, small(i32::from(hash)))
}

pub fn some_instance(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let class = vm.receiver_of(argc)?;
    match vm.memory.next_instance(0, Some(class)) {
        Some(instance) => vm.succeed(argc, instance),
        None => Ok(false),
    }
}

/// Next instance of the receiver's class in table order, or nil.
pub fn next_instance(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    if receiver.is_small_int() {
        return Ok(false);
    }
    let class = vm.fetch_class(receiver)?;
    let Some(index) = vm.memory.index_of(receiver) else {
        return Ok(false);
    };
    let next = vm
        .memory
        .next_instance(index + 1, Some(class))
        .unwrap_or(vm.state.special.nil);
    vm.succeed(argc, next)
}

/// `CompiledMethod newMethod: bytecodeCount header: header`.
pub fn new_method(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 2 {
        return Ok(false);
    }
    let class = vm.receiver_of(argc)?;
    let header = vm.argument(argc, 1)?;
    let (Some(bytes), Some(header_bits)) = (
        vm.argument(argc, 0)?.as_small().and_then(|n| usize::try_from(n).ok()),
        header.as_small(),
    ) else {
        return Ok(false);
    };
    let literal_count = crate::MethodHeader(header_bits).num_literals();
    let nil = vm.state.special.nil;
    let mut literals = vec![nil; literal_count + 1];
    literals[0] = header;
    let method = HeapObject::new(
        class,
        byte_format_for(FORMAT_METHOD, bytes),
        Body::Method {
            literals,
            bytecode: vec![0; bytes],
        },
    );
    let method = vm.memory.register(method, &mut vm.state)?;
    vm.succeed(argc, method)
}

/// `replaceFrom:to:with:startingAt:` between objects of the same shape.
pub fn replace_from_to(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 4 {
        return Ok(false);
    }
    let receiver = vm.receiver_of(argc)?;
    let replacement = vm.argument(argc, 2)?;
    let (Some(start), Some(stop), Some(rep_start)) = (
        vm.argument(argc, 0)?.as_small(),
        vm.argument(argc, 1)?.as_small(),
        vm.argument(argc, 3)?.as_small(),
    ) else {
        return Ok(false);
    };
    let (Some(target), Some(source)) = (
        vm.indexable_layout(receiver, false)?,
        vm.indexable_layout(replacement, false)?,
    ) else {
        return Ok(false);
    };
    if target.kind != source.kind {
        return Ok(false);
    }
    let count = i64::from(stop) - i64::from(start) + 1;
    if count < 0
        || start < 1
        || rep_start < 1
        || i64::from(stop) > target.size as i64
        || i64::from(rep_start) - 1 + count > source.size as i64
    {
        return Ok(false);
    }
    let count = count as usize;
    let to = target.fixed + start as usize - 1;
    let from = source.fixed + rep_start as usize - 1;

    match source.kind {
        AtKind::Pointers => {
            let values: Vec<Value> = vm
                .memory
                .object(replacement)?
                .pointers()
                .map_or_else(Vec::new, |f| f[from..from + count].to_vec());
            if let Some(fields) = vm.memory.object_mut(receiver)?.pointers_mut() {
                fields[to..to + count].copy_from_slice(&values);
            }
        }
        AtKind::Words => {
            let values: Vec<u32> = vm
                .memory
                .object(replacement)?
                .words()
                .map_or_else(Vec::new, |w| w[from..from + count].to_vec());
            if let Body::Words(words) = &mut vm.memory.object_mut(receiver)?.body {
                words[to..to + count].copy_from_slice(&values);
            }
        }
        AtKind::Bytes | AtKind::Chars => {
            let values: Vec<u8> = vm
                .memory
                .object(replacement)?
                .bytes()
                .map_or_else(Vec::new, |b| b[from..from + count].to_vec());
            if let Some(bytes) = vm.memory.object_mut(receiver)?.bytes_mut() {
                bytes[to..to + count].copy_from_slice(&values);
            }
        }
    }
    vm.pop_n(argc);
    Ok(true)
}
