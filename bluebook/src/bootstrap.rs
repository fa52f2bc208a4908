//! Builds a minimal in-memory image: the kernel classes, the special objects
//! array, a process scheduler and a single user process.
//!
//! Used to start an interpreter without an image file, for tests and
//! benchmarks. Builder methods never fail individually; the first memory
//! error is kept and reported by [`Bootstrap::start`].

use std::{collections::HashMap, sync::Arc};

use crate::{
    Body, ClassFormat, HeapObject, HeadlessDisplay, InputQueue, Interpreter, MemoryError,
    MethodHeader, ObjectMemory, Value, VmConfig, VmError,
    context::bytecode_start,
    interpreter::small,
    object::{
        FORMAT_BYTES, FORMAT_EMPTY, FORMAT_FIXED, FORMAT_FIXED_INDEXABLE, FORMAT_INDEXABLE,
        FORMAT_METHOD, FORMAT_WORDS, byte_format_for,
    },
    special::*,
};

/// Selectors of bytecodes 176..207 with their argument counts.
const SPECIAL_SELECTOR_NAMES: [(&str, i32); 32] = [
    ("+", 1),
    ("-", 1),
    ("<", 1),
    (">", 1),
    ("<=", 1),
    (">=", 1),
    ("=", 1),
    ("~=", 1),
    ("*", 1),
    ("/", 1),
    ("\\\\", 1),
    ("@", 1),
    ("bitShift:", 1),
    ("//", 1),
    ("bitAnd:", 1),
    ("bitOr:", 1),
    ("at:", 1),
    ("at:put:", 2),
    ("size", 0),
    ("next", 0),
    ("nextPut:", 1),
    ("atEnd", 0),
    ("==", 1),
    ("class", 0),
    ("blockCopy:", 1),
    ("value", 0),
    ("value:", 1),
    ("do:", 1),
    ("new", 0),
    ("new:", 1),
    ("x", 0),
    ("y", 0),
];

const CLASS_SLOTS: usize = CLASS_NAME + 1;
const INITIAL_DICTIONARY_CAPACITY: usize = 32;
const PRIORITY_LEVELS: usize = 8;

/// Handles to the kernel classes.
#[derive(Debug, Clone, Copy)]
pub struct Classes {
    pub class: Value,
    pub object: Value,
    pub undefined_object: Value,
    pub true_class: Value,
    pub false_class: Value,
    pub small_integer: Value,
    pub float: Value,
    pub large_positive_integer: Value,
    pub character: Value,
    pub symbol: Value,
    pub string: Value,
    pub byte_array: Value,
    pub array: Value,
    pub bitmap: Value,
    pub compiled_method: Value,
    pub method_dictionary: Value,
    pub method_context: Value,
    pub block_context: Value,
    pub point: Value,
    pub message: Value,
    pub association: Value,
    pub semaphore: Value,
    pub process: Value,
    pub linked_list: Value,
    pub process_scheduler: Value,
}

fn names_of(c: &Classes) -> [(Value, &'static str); 25] {
    [
        (c.class, "Class"),
        (c.object, "Object"),
        (c.undefined_object, "UndefinedObject"),
        (c.true_class, "True"),
        (c.false_class, "False"),
        (c.small_integer, "SmallInteger"),
        (c.float, "Float"),
        (c.large_positive_integer, "LargePositiveInteger"),
        (c.character, "Character"),
        (c.symbol, "Symbol"),
        (c.string, "String"),
        (c.byte_array, "ByteArray"),
        (c.array, "Array"),
        (c.bitmap, "Bitmap"),
        (c.compiled_method, "CompiledMethod"),
        (c.method_dictionary, "MethodDictionary"),
        (c.method_context, "MethodContext"),
        (c.block_context, "BlockContext"),
        (c.point, "Point"),
        (c.message, "Message"),
        (c.association, "Association"),
        (c.semaphore, "Semaphore"),
        (c.process, "Process"),
        (c.linked_list, "LinkedList"),
        (c.process_scheduler, "ProcessorScheduler"),
    ]
}

pub struct Bootstrap {
    memory: ObjectMemory,
    config: VmConfig,
    pub nil: Value,
    pub false_obj: Value,
    pub true_obj: Value,
    pub classes: Classes,
    pub specials: Value,
    pub scheduler: Value,
    pub main_process: Value,
    symbols: HashMap<String, Value>,
    next_hash: u16,
    error: Option<MemoryError>,
}

impl Bootstrap {
    pub const USER_PRIORITY: usize = 4;

    pub fn new() -> Result<Self, MemoryError> {
        Self::with_config(VmConfig::compact())
    }

    pub fn with_config(config: VmConfig) -> Result<Self, MemoryError> {
        let memory = ObjectMemory::new(&config);
        let placeholder = Value::from_index(0);
        let mut boot = Self {
            memory,
            config,
            nil: placeholder,
            false_obj: placeholder,
            true_obj: placeholder,
            classes: Classes {
                class: placeholder,
                object: placeholder,
                undefined_object: placeholder,
                true_class: placeholder,
                false_class: placeholder,
                small_integer: placeholder,
                float: placeholder,
                large_positive_integer: placeholder,
                character: placeholder,
                symbol: placeholder,
                string: placeholder,
                byte_array: placeholder,
                array: placeholder,
                bitmap: placeholder,
                compiled_method: placeholder,
                method_dictionary: placeholder,
                method_context: placeholder,
                block_context: placeholder,
                point: placeholder,
                message: placeholder,
                association: placeholder,
                semaphore: placeholder,
                process: placeholder,
                linked_list: placeholder,
                process_scheduler: placeholder,
            },
            specials: placeholder,
            scheduler: placeholder,
            main_process: placeholder,
            symbols: HashMap::new(),
            next_hash: 0,
            error: None,
        };

        // 1. nil, with its class patched in once UndefinedObject exists
        boot.nil = boot.alloc(placeholder, FORMAT_EMPTY, Body::Pointers(Vec::new()))?;

        // 2. the class of all classes, an instance of itself
        let class = boot.alloc(placeholder, FORMAT_FIXED, Body::Pointers(Vec::new()))?;
        boot.classes.class = class;
        boot.memory.object_mut(class)?.class = class;

        // 3. the kernel hierarchy
        let object = boot.define_class(None, 0, FORMAT_EMPTY)?;
        let def = |boot: &mut Self, inst_size, format| {
            boot.define_class(Some(object), inst_size, format)
        };
        let c = Classes {
            class,
            object,
            undefined_object: def(&mut boot, 0, FORMAT_EMPTY)?,
            true_class: def(&mut boot, 0, FORMAT_EMPTY)?,
            false_class: def(&mut boot, 0, FORMAT_EMPTY)?,
            small_integer: def(&mut boot, 0, FORMAT_EMPTY)?,
            float: def(&mut boot, 0, FORMAT_WORDS)?,
            large_positive_integer: def(&mut boot, 0, FORMAT_BYTES)?,
            character: def(&mut boot, 1, FORMAT_FIXED)?,
            symbol: def(&mut boot, 0, FORMAT_BYTES)?,
            string: def(&mut boot, 0, FORMAT_BYTES)?,
            byte_array: def(&mut boot, 0, FORMAT_BYTES)?,
            array: def(&mut boot, 0, FORMAT_INDEXABLE)?,
            bitmap: def(&mut boot, 0, FORMAT_WORDS)?,
            compiled_method: def(&mut boot, 0, FORMAT_METHOD)?,
            method_dictionary: def(&mut boot, 2, FORMAT_FIXED_INDEXABLE)?,
            method_context: def(&mut boot, TEMP_FRAME_START, FORMAT_FIXED_INDEXABLE)?,
            block_context: def(&mut boot, TEMP_FRAME_START, FORMAT_FIXED_INDEXABLE)?,
            point: def(&mut boot, 2, FORMAT_FIXED)?,
            message: def(&mut boot, 3, FORMAT_FIXED)?,
            association: def(&mut boot, 2, FORMAT_FIXED)?,
            semaphore: def(&mut boot, 3, FORMAT_FIXED)?,
            process: def(&mut boot, 4, FORMAT_FIXED)?,
            linked_list: def(&mut boot, 2, FORMAT_FIXED)?,
            process_scheduler: def(&mut boot, 2, FORMAT_FIXED)?,
        };
        boot.classes = c;
        boot.memory.object_mut(boot.nil)?.class = c.undefined_object;
        // dictionaries made before their classes existed
        let mut defined = vec![object];
        defined.extend(names_of(&c).into_iter().skip(2).map(|(class, _)| class));
        for class in defined {
            let dictionary = boot.memory.fetch(class, CLASS_METHOD_DICTIONARY)?;
            let methods = boot.memory.fetch(dictionary, METHOD_DICT_ARRAY)?;
            boot.memory.object_mut(dictionary)?.class = c.method_dictionary;
            boot.memory.object_mut(methods)?.class = c.array;
        }
        let dictionary = boot.empty_dictionary(INITIAL_DICTIONARY_CAPACITY)?;
        if let Some(fields) = boot.memory.object_mut(class)?.pointers_mut() {
            *fields = vec![boot.nil; CLASS_SLOTS];
            fields[CLASS_SUPERCLASS] = object;
            fields[CLASS_METHOD_DICTIONARY] = dictionary;
            fields[CLASS_FORMAT] = ClassFormat::new(CLASS_SLOTS, FORMAT_FIXED).value();
        }
        boot.false_obj = boot.alloc(c.false_class, FORMAT_EMPTY, Body::Pointers(Vec::new()))?;
        boot.true_obj = boot.alloc(c.true_class, FORMAT_EMPTY, Body::Pointers(Vec::new()))?;

        // 4. class names, now that symbols can be made
        for (class, name) in names_of(&c) {
            let symbol = boot.try_intern(name)?;
            boot.memory.store(class, CLASS_NAME, symbol)?;
        }

        // 5. scheduler with one running process
        let mut lists = Vec::with_capacity(PRIORITY_LEVELS);
        for _ in 0..PRIORITY_LEVELS {
            lists.push(boot.fixed(c.linked_list, vec![boot.nil; 2])?);
        }
        let lists = boot.fixed(c.array, lists)?;
        let priority = small(Self::USER_PRIORITY as i32);
        let main_process = boot.fixed(c.process, vec![boot.nil, boot.nil, priority, boot.nil])?;
        let scheduler = boot.fixed(c.process_scheduler, vec![lists, main_process])?;
        let processor = boot.try_intern("Processor")?;
        let association = boot.fixed(c.association, vec![processor, scheduler])?;
        boot.scheduler = scheduler;
        boot.main_process = main_process;

        // 6. special selectors and the character table
        let mut selectors = Vec::with_capacity(SPECIAL_SELECTOR_NAMES.len() * 2);
        for (name, argc) in SPECIAL_SELECTOR_NAMES {
            selectors.push(boot.try_intern(name)?);
            selectors.push(small(argc));
        }
        let special_selectors = boot.fixed(c.array, selectors)?;
        let mut characters = Vec::with_capacity(256);
        for code in 0..256 {
            characters.push(boot.fixed(c.character, vec![small(code)])?);
        }
        let character_table = boot.fixed(c.array, characters)?;

        // 7. the special objects array
        let nil = boot.nil;
        let mut specials = vec![nil; SPECIAL_OBJECTS_SIZE];
        specials[NIL] = nil;
        specials[FALSE] = boot.false_obj;
        specials[TRUE] = boot.true_obj;
        specials[SCHEDULER_ASSOCIATION] = association;
        specials[CLASS_BITMAP] = c.bitmap;
        specials[CLASS_SMALL_INTEGER] = c.small_integer;
        specials[CLASS_STRING] = c.string;
        specials[CLASS_ARRAY] = c.array;
        specials[CLASS_FLOAT] = c.float;
        specials[CLASS_METHOD_CONTEXT] = c.method_context;
        specials[CLASS_BLOCK_CONTEXT] = c.block_context;
        specials[CLASS_POINT] = c.point;
        specials[CLASS_LARGE_POSITIVE_INTEGER] = c.large_positive_integer;
        specials[CLASS_MESSAGE] = c.message;
        specials[CLASS_COMPILED_METHOD] = c.compiled_method;
        specials[CLASS_SEMAPHORE] = c.semaphore;
        specials[CLASS_CHARACTER] = c.character;
        specials[SELECTOR_DOES_NOT_UNDERSTAND] = boot.try_intern("doesNotUnderstand:")?;
        specials[SELECTOR_CANNOT_RETURN] = boot.try_intern("cannotReturn:")?;
        specials[SPECIAL_SELECTORS] = special_selectors;
        specials[CHARACTER_TABLE] = character_table;
        specials[SELECTOR_MUST_BE_BOOLEAN] = boot.try_intern("mustBeBoolean")?;
        specials[CLASS_BYTE_ARRAY] = c.byte_array;
        specials[CLASS_PROCESS] = c.process;
        specials[COMPACT_CLASSES] = boot.fixed(c.array, vec![nil; 32])?;
        boot.specials = boot.fixed(c.array, specials)?;
        Ok(boot)
    }

    // ── Allocation ────────────────────────────────────────────────────

    fn alloc(&mut self, class: Value, format: u8, body: Body) -> Result<Value, MemoryError> {
        let mut object = HeapObject::new(class, format, body);
        self.next_hash = (self.next_hash + 1) & 0xFFF;
        object.hash = self.next_hash;
        self.memory.register_image_object(object)
    }

    fn fixed(&mut self, class: Value, fields: Vec<Value>) -> Result<Value, MemoryError> {
        let format = if class == self.classes.array {
            FORMAT_INDEXABLE
        } else {
            FORMAT_FIXED
        };
        self.alloc(class, format, Body::Pointers(fields))
    }

    fn keep(&mut self, result: Result<Value, MemoryError>) -> Value {
        match result {
            Ok(value) => value,
            Err(err) => {
                self.error.get_or_insert(err);
                self.nil
            }
        }
    }

    fn define_class(
        &mut self,
        superclass: Option<Value>,
        inst_size: usize,
        format: u8,
    ) -> Result<Value, MemoryError> {
        let nil = self.nil;
        let dictionary = self.empty_dictionary(INITIAL_DICTIONARY_CAPACITY)?;
        let mut fields = vec![nil; CLASS_SLOTS];
        fields[CLASS_SUPERCLASS] = superclass.unwrap_or(nil);
        fields[CLASS_METHOD_DICTIONARY] = dictionary;
        fields[CLASS_FORMAT] = ClassFormat::new(inst_size, format).value();
        self.alloc(self.classes.class, FORMAT_FIXED, Body::Pointers(fields))
    }

    fn empty_dictionary(&mut self, capacity: usize) -> Result<Value, MemoryError> {
        let nil = self.nil;
        let methods = self.alloc(
            self.classes.array,
            FORMAT_INDEXABLE,
            Body::Pointers(vec![nil; capacity]),
        )?;
        let mut fields = vec![nil; METHOD_DICT_SELECTOR_START + capacity];
        fields[METHOD_DICT_TALLY] = small(0);
        fields[METHOD_DICT_ARRAY] = methods;
        self.alloc(
            self.classes.method_dictionary,
            FORMAT_FIXED_INDEXABLE,
            Body::Pointers(fields),
        )
    }

    // ── Symbols and methods ───────────────────────────────────────────

    fn try_intern(&mut self, name: &str) -> Result<Value, MemoryError> {
        if let Some(&symbol) = self.symbols.get(name) {
            return Ok(symbol);
        }
        let bytes = name.as_bytes().to_vec();
        let format = byte_format_for(FORMAT_BYTES, bytes.len());
        let symbol = self.alloc(self.classes.symbol, format, Body::Bytes(bytes))?;
        self.symbols.insert(name.to_owned(), symbol);
        Ok(symbol)
    }

    /// The unique symbol spelled `name`.
    pub fn intern(&mut self, name: &str) -> Value {
        let result = self.try_intern(name);
        self.keep(result)
    }

    /// A compiled method; `literals` excludes the header.
    pub fn method(&mut self, header: MethodHeader, literals: &[Value], bytecode: &[u8]) -> Value {
        let mut all = Vec::with_capacity(literals.len() + 1);
        all.push(header.value());
        all.extend_from_slice(literals);
        let format = byte_format_for(FORMAT_METHOD, bytecode.len());
        let body = Body::Method {
            literals: all,
            bytecode: bytecode.to_vec(),
        };
        let result = self.alloc(self.classes.compiled_method, format, body);
        self.keep(result)
    }

    /// Adds `method` to the method dictionary of `class` under `selector`.
    pub fn install_method(&mut self, class: Value, selector: &str, method: Value) {
        if let Err(err) = self.try_install(class, selector, method) {
            self.error.get_or_insert(err);
        }
    }

    fn try_install(
        &mut self,
        class: Value,
        selector: &str,
        method: Value,
    ) -> Result<(), MemoryError> {
        let selector = self.try_intern(selector)?;
        let dictionary = self.memory.fetch(class, CLASS_METHOD_DICTIONARY)?;
        let capacity = self.memory.pointer_len(dictionary) - METHOD_DICT_SELECTOR_START;
        let tally = self.memory.fetch_small(dictionary, METHOD_DICT_TALLY)? as usize;
        let dictionary = if (tally + 1) * 4 > capacity * 3 {
            self.grow_dictionary(class, dictionary, capacity * 2)?
        } else {
            dictionary
        };
        self.insert_method(dictionary, selector, method)
    }

    fn insert_method(
        &mut self,
        dictionary: Value,
        selector: Value,
        method: Value,
    ) -> Result<(), MemoryError> {
        let size = self.memory.pointer_len(dictionary);
        let mask = (size - METHOD_DICT_SELECTOR_START).next_power_of_two() - 1;
        let mut index =
            (usize::from(self.memory.hash_of(selector)) & mask) + METHOD_DICT_SELECTOR_START;
        loop {
            let candidate = self.memory.fetch(dictionary, index)?;
            if candidate == selector || candidate == self.nil {
                break;
            }
            index += 1;
            if index == size {
                index = METHOD_DICT_SELECTOR_START;
            }
        }
        if self.memory.fetch(dictionary, index)? == self.nil {
            let tally = self.memory.fetch_small(dictionary, METHOD_DICT_TALLY)?;
            self.memory.store(dictionary, METHOD_DICT_TALLY, small(tally + 1))?;
        }
        self.memory.store(dictionary, index, selector)?;
        let methods = self.memory.fetch(dictionary, METHOD_DICT_ARRAY)?;
        self.memory.store(methods, index - METHOD_DICT_SELECTOR_START, method)
    }

    fn grow_dictionary(
        &mut self,
        class: Value,
        old: Value,
        capacity: usize,
    ) -> Result<Value, MemoryError> {
        let dictionary = self.empty_dictionary(capacity)?;
        let old_methods = self.memory.fetch(old, METHOD_DICT_ARRAY)?;
        for index in METHOD_DICT_SELECTOR_START..self.memory.pointer_len(old) {
            let selector = self.memory.fetch(old, index)?;
            if selector != self.nil {
                let method = self.memory.fetch(old_methods, index - METHOD_DICT_SELECTOR_START)?;
                self.insert_method(dictionary, selector, method)?;
            }
        }
        self.memory.store(class, CLASS_METHOD_DICTIONARY, dictionary)?;
        Ok(dictionary)
    }

    // ── Contexts and processes ────────────────────────────────────────

    /// A suspended method context about to run `method` from its first
    /// bytecode, with an empty stack above the temporaries.
    pub fn context(&mut self, method: Value, receiver: Value) -> Value {
        let result = self.try_context(method, receiver);
        self.keep(result)
    }

    fn try_context(&mut self, method: Value, receiver: Value) -> Result<Value, MemoryError> {
        let header = self
            .memory
            .object(method)?
            .method_header()
            .ok_or(MemoryError::NotPointers(method))?;
        let frame = if header.large_context() {
            self.config.large_frame_size
        } else {
            self.config.small_frame_size
        };
        let mut fields = vec![self.nil; TEMP_FRAME_START + frame];
        fields[CONTEXT_PC] = small(bytecode_start(header.num_literals()) as i32);
        fields[CONTEXT_SP] = small(header.num_temps() as i32);
        fields[CONTEXT_METHOD] = method;
        fields[CONTEXT_RECEIVER] = receiver;
        self.alloc(
            self.classes.method_context,
            FORMAT_FIXED_INDEXABLE,
            Body::Pointers(fields),
        )
    }

    pub fn process(&mut self, priority: usize, context: Value) -> Value {
        let nil = self.nil;
        let fields = vec![nil, context, small(priority as i32), nil];
        let result = self.fixed(self.classes.process, fields);
        self.keep(result)
    }

    /// Appends `process` to the ready list of its priority.
    pub fn make_ready(&mut self, process: Value) {
        if let Err(err) = self.try_make_ready(process) {
            self.error.get_or_insert(err);
        }
    }

    fn try_make_ready(&mut self, process: Value) -> Result<(), MemoryError> {
        let priority = self.memory.fetch_small(process, PROCESS_PRIORITY)?.max(1) as usize;
        let lists = self.memory.fetch(self.scheduler, SCHEDULER_PROCESS_LISTS)?;
        let list = self.memory.fetch(lists, priority - 1)?;
        let last = self.memory.fetch(list, LIST_LAST)?;
        if last == self.nil {
            self.memory.store(list, LIST_FIRST, process)?;
        } else {
            self.memory.store(last, LINK_NEXT, process)?;
        }
        self.memory.store(list, LIST_LAST, process)?;
        self.memory.store(process, PROCESS_MY_LIST, list)
    }

    /// A semaphore with no waiters and no excess signals.
    pub fn semaphore(&mut self) -> Value {
        let nil = self.nil;
        let result = self.fixed(self.classes.semaphore, vec![nil, nil, small(0)]);
        self.keep(result)
    }

    /// Suspends `method` (receiver nil) in the main process and starts an
    /// interpreter on the result.
    pub fn start(mut self, method: Value) -> Result<Interpreter, VmError> {
        let nil = self.nil;
        let context = self.context(method, nil);
        let main_process = self.main_process;
        self.memory.store(main_process, PROCESS_SUSPENDED_CONTEXT, context)?;
        if let Some(err) = self.error {
            return Err(err.into());
        }
        self.memory.tenure();
        let input = Arc::new(InputQueue::new(self.config.typeahead_limit));
        Interpreter::new(
            self.memory,
            self.specials,
            self.config,
            Box::new(HeadlessDisplay::default()),
            input,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lookup::lookup_in_dictionary;

    #[test]
    fn kernel_objects_are_wired() {
        let boot = Bootstrap::new().expect("bootstrap");
        let memory = &boot.memory;
        assert_eq!(memory.object(boot.nil).expect("nil").class, boot.classes.undefined_object);
        assert_eq!(memory.object(boot.classes.class).expect("class").class, boot.classes.class);
        assert_eq!(
            memory.fetch(boot.specials, SELECTOR_DOES_NOT_UNDERSTAND),
            Ok(boot.symbols["doesNotUnderstand:"])
        );
        let selectors = memory.fetch(boot.specials, SPECIAL_SELECTORS).expect("selectors");
        assert_eq!(memory.fetch(selectors, 2 * 16), Ok(boot.symbols["at:"]));
        assert_eq!(memory.fetch(selectors, 2 * 17 + 1), Ok(small(2)));
    }

    #[test]
    fn symbols_are_unique() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let a = boot.intern("foo:");
        assert_eq!(boot.intern("foo:"), a);
        assert_ne!(boot.intern("bar"), a);
    }

    #[test]
    fn installed_methods_are_found_after_growth() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let class = boot.classes.point;
        let mut installed = Vec::new();
        for i in 0..40 {
            let method = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x78]);
            let name = format!("m{i}");
            boot.install_method(class, &name, method);
            installed.push((boot.intern(&name), method));
        }
        let dictionary = boot.memory.fetch(class, CLASS_METHOD_DICTIONARY).expect("dictionary");
        assert!(boot.memory.pointer_len(dictionary) > METHOD_DICT_SELECTOR_START + 40);
        for (selector, method) in installed {
            let found = lookup_in_dictionary(&boot.memory, dictionary, selector, boot.nil)
                .expect("lookup");
            assert_eq!(found, Some(method));
        }
    }
}
