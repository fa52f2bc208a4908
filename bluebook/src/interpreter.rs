//! Bytecode interpreter.
//!
//! Registers (`active_context`, `home_context`, `method`, `receiver`, `pc`,
//! `sp`) mirror the active context and are written back before any context
//! switch. `pc` is an index into the method's bytecode and `sp` the index of
//! the top stack slot inside the active context.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, info};

use crate::{
    AtCache, ClassFormat, Display, InputQueue, InterruptState, LoadedImage, MethodCache,
    ObjectMemory, PrimitiveTable, RootProvider, SpecialObjects, Value, VmConfig, VmError,
    fusion::{BranchFusion, fuse_branch},
    special::{
        ASSOCIATION_VALUE, BLOCK_CALLER, CLASS_FORMAT, CLASS_SUPERCLASS, CONTEXT_SENDER,
        SELECTOR_MUST_BE_BOOLEAN, TEMP_FRAME_START,
    },
    value::arith,
};

/// Interpreter state the collector must see.
pub struct VmState {
    pub special: SpecialObjects,

    pub active_context: Value,
    pub home_context: Value,
    pub method: Value,
    pub receiver: Value,
    pub pc: usize,
    pub sp: usize,

    // pending send
    pub new_method: Value,
    pub message_selector: Value,
    pub lookup_class: Value,
    pub argument_count: usize,
    pub primitive_index: u32,

    pub method_cache: MethodCache,
    pub at_cache: AtCache,

    pub free_contexts: Vec<Value>,
    pub free_large_contexts: Vec<Value>,
    /// How many contexts at the top of the sender chain are known not to be
    /// referenced from anywhere else.
    pub reclaimable_contexts: usize,

    /// Temporaries that must stay alive across an allocation.
    pub scratch: Vec<Value>,
}

impl RootProvider for VmState {
    fn visit_roots(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        self.special.visit(visitor);
        visitor(&mut self.active_context);
        visitor(&mut self.home_context);
        visitor(&mut self.method);
        visitor(&mut self.receiver);
        visitor(&mut self.new_method);
        visitor(&mut self.message_selector);
        visitor(&mut self.lookup_class);
        self.method_cache.visit(visitor);
        self.at_cache.visit(visitor);
        for context in self.free_contexts.iter_mut() {
            visitor(context);
        }
        for context in self.free_large_contexts.iter_mut() {
            visitor(context);
        }
        for value in self.scratch.iter_mut() {
            visitor(value);
        }
    }

    fn flush_caches(&mut self) {
        self.method_cache.clear();
        self.at_cache.clear();
        self.free_contexts.clear();
        self.free_large_contexts.clear();
    }
}

pub struct Interpreter {
    pub memory: ObjectMemory,
    pub state: VmState,
    pub config: VmConfig,
    pub(crate) timing: InterruptState,
    pub(crate) display: Box<dyn Display>,
    pub(crate) input: Arc<InputQueue>,
    pub(crate) primitives: PrimitiveTable,
    pub(crate) started: Instant,
    pub(crate) quit: bool,
    bytecodes: u64,
}

impl Interpreter {
    pub fn new(
        memory: ObjectMemory,
        special_objects: Value,
        config: VmConfig,
        display: Box<dyn Display>,
        input: Arc<InputQueue>,
    ) -> Result<Self, VmError> {
        config.validate().map_err(VmError::Config)?;
        let special = SpecialObjects::resolve(&memory, special_objects)?;
        let nil = special.nil;
        let state = VmState {
            special,
            active_context: nil,
            home_context: nil,
            method: nil,
            receiver: nil,
            pc: 0,
            sp: 0,
            new_method: nil,
            message_selector: nil,
            lookup_class: nil,
            argument_count: 0,
            primitive_index: 0,
            method_cache: MethodCache::new(config.method_cache_size, config.method_cache_probes),
            at_cache: AtCache::new(config.at_cache_size),
            free_contexts: Vec::new(),
            free_large_contexts: Vec::new(),
            reclaimable_contexts: 0,
            scratch: Vec::new(),
        };
        let mut interpreter = Self {
            memory,
            state,
            timing: InterruptState::new(&config),
            config,
            display,
            input,
            primitives: PrimitiveTable::default(),
            started: Instant::now(),
            quit: false,
            bytecodes: 0,
        };
        interpreter.load_initial_context()?;
        Ok(interpreter)
    }

    pub fn from_image(
        image: LoadedImage,
        config: VmConfig,
        display: Box<dyn Display>,
        input: Arc<InputQueue>,
    ) -> Result<Self, VmError> {
        Self::new(image.memory, image.special_objects, config, display, input)
    }

    pub fn has_quit(&self) -> bool {
        self.quit
    }

    pub fn bytecodes_executed(&self) -> u64 {
        self.bytecodes
    }

    // ── Execution ─────────────────────────────────────────────────────

    /// Runs until the image quits or a fatal error occurs.
    pub fn run(&mut self) -> Result<(), VmError> {
        info!("interpreter running");
        self.run_for(u64::MAX)?;
        info!("interpreter stopped after {} bytecodes", self.bytecodes);
        Ok(())
    }

    /// Executes at most `limit` bytecodes; returns how many ran.
    pub fn run_for(&mut self, limit: u64) -> Result<u64, VmError> {
        let mut executed = 0;
        while !self.quit && executed < limit {
            self.step()?;
            executed += 1;
        }
        Ok(executed)
    }

    pub fn step(&mut self) -> Result<(), VmError> {
        let byte = self.next_byte()?;
        self.bytecodes += 1;
        self.dispatch(byte)
    }

    fn next_byte(&mut self) -> Result<u8, VmError> {
        let pc = self.state.pc;
        let byte = self
            .memory
            .object(self.state.method)?
            .bytes()
            .and_then(|code| code.get(pc).copied())
            .ok_or(VmError::PcOutOfRange { pc })?;
        self.state.pc += 1;
        Ok(byte)
    }

    fn nono(&self, opcode: u8) -> Result<(), VmError> {
        Err(VmError::ReservedOpcode {
            opcode,
            pc: self.state.pc.saturating_sub(1),
        })
    }

    fn dispatch(&mut self, byte: u8) -> Result<(), VmError> {
        match byte {
            0..=15 => {
                let value = self.memory.fetch(self.state.receiver, usize::from(byte & 15))?;
                self.push(value)
            }
            16..=31 => {
                let value = self.temporary(usize::from(byte & 15))?;
                self.push(value)
            }
            32..=63 => {
                let value = self.literal(usize::from(byte & 31))?;
                self.push(value)
            }
            64..=95 => {
                let value = self.literal_variable(usize::from(byte & 31))?;
                self.push(value)
            }
            96..=103 => {
                let value = self.pop()?;
                self.memory
                    .store(self.state.receiver, usize::from(byte & 7), value)?;
                Ok(())
            }
            104..=111 => {
                let value = self.pop()?;
                self.store_temporary(usize::from(byte & 7), value)
            }
            112 => self.push(self.state.receiver),
            113 => self.push(self.state.special.true_obj),
            114 => self.push(self.state.special.false_obj),
            115 => self.push(self.state.special.nil),
            116..=119 => self.push(small(i32::from(byte) - 117)),
            120 => self.return_to_home_sender(self.state.receiver),
            121 => self.return_to_home_sender(self.state.special.true_obj),
            122 => self.return_to_home_sender(self.state.special.false_obj),
            123 => self.return_to_home_sender(self.state.special.nil),
            124 => {
                let value = self.pop()?;
                self.return_to_home_sender(value)
            }
            125 => {
                let value = self.pop()?;
                let caller = self.memory.fetch(self.state.active_context, BLOCK_CALLER)?;
                self.do_return(value, caller)
            }
            126 | 127 => self.nono(byte),
            128 => {
                let operand = self.next_byte()?;
                self.extended_push(operand)
            }
            129 => {
                let operand = self.next_byte()?;
                self.extended_store(byte, operand)
            }
            130 => {
                let operand = self.next_byte()?;
                self.extended_store(byte, operand)?;
                self.pop_n(1);
                Ok(())
            }
            131 => {
                let operand = self.next_byte()?;
                let selector = self.literal(usize::from(operand & 31))?;
                self.send(selector, usize::from(operand >> 5), false)
            }
            132 => self.double_extended(),
            133 => {
                let operand = self.next_byte()?;
                let selector = self.literal(usize::from(operand & 31))?;
                self.send(selector, usize::from(operand >> 5), true)
            }
            134 => {
                let operand = self.next_byte()?;
                let selector = self.literal(usize::from(operand & 63))?;
                self.send(selector, usize::from(operand >> 6), false)
            }
            135 => {
                self.pop_n(1);
                Ok(())
            }
            136 => {
                let value = self.top()?;
                self.push(value)
            }
            137 => {
                self.state.reclaimable_contexts = 0;
                self.push(self.state.active_context)
            }
            138..=143 => self.nono(byte),
            144..=151 => {
                self.state.pc += usize::from(byte & 7) + 1;
                Ok(())
            }
            152..=159 => self.jump_if(false, usize::from(byte & 7) + 1),
            160..=167 => {
                let low = self.next_byte()?;
                let offset = (isize::from(byte & 7) - 4) * 256 + isize::from(low);
                let pc = self.state.pc;
                self.state.pc = pc
                    .checked_add_signed(offset)
                    .ok_or(VmError::PcOutOfRange { pc })?;
                if byte & 7 < 4 {
                    self.check_for_interrupts()?;
                }
                Ok(())
            }
            168..=175 => {
                let low = self.next_byte()?;
                let offset = usize::from(byte & 3) * 256 + usize::from(low);
                self.jump_if(byte < 172, offset)
            }
            176..=191 => self.special_arithmetic(byte - 176),
            192..=207 => self.special_send(byte - 192),
            208..=223 => {
                let selector = self.literal(usize::from(byte & 15))?;
                self.send(selector, 0, false)
            }
            224..=239 => {
                let selector = self.literal(usize::from(byte & 15))?;
                self.send(selector, 1, false)
            }
            240..=255 => {
                let selector = self.literal(usize::from(byte & 15))?;
                self.send(selector, 2, false)
            }
        }
    }

    fn extended_push(&mut self, operand: u8) -> Result<(), VmError> {
        let index = usize::from(operand & 63);
        let value = match operand >> 6 {
            0 => self.memory.fetch(self.state.receiver, index)?,
            1 => self.temporary(index)?,
            2 => self.literal(index)?,
            _ => self.literal_variable(index)?,
        };
        self.push(value)
    }

    fn extended_store(&mut self, opcode: u8, operand: u8) -> Result<(), VmError> {
        let index = usize::from(operand & 63);
        let value = self.top()?;
        match operand >> 6 {
            0 => self.memory.store(self.state.receiver, index, value)?,
            1 => self.store_temporary(index, value)?,
            2 => return self.nono(opcode),
            _ => {
                let association = self.literal(index)?;
                self.memory.store(association, ASSOCIATION_VALUE, value)?;
            }
        }
        Ok(())
    }

    fn double_extended(&mut self) -> Result<(), VmError> {
        let second = self.next_byte()?;
        let third = usize::from(self.next_byte()?);
        match second >> 5 {
            0 => {
                let selector = self.literal(third)?;
                self.send(selector, usize::from(second & 31), false)
            }
            1 => {
                let selector = self.literal(third)?;
                self.send(selector, usize::from(second & 31), true)
            }
            2 => {
                let value = self.memory.fetch(self.state.receiver, third)?;
                self.push(value)
            }
            3 => {
                let value = self.literal(third)?;
                self.push(value)
            }
            4 => {
                let value = self.literal_variable(third)?;
                self.push(value)
            }
            5 | 6 => {
                let value = self.top()?;
                self.memory.store(self.state.receiver, third, value)?;
                if second >> 5 == 6 {
                    self.pop_n(1);
                }
                Ok(())
            }
            _ => {
                let value = self.top()?;
                let association = self.literal(third)?;
                self.memory.store(association, ASSOCIATION_VALUE, value)?;
                Ok(())
            }
        }
    }

    fn jump_if(&mut self, condition: bool, delta: usize) -> Result<(), VmError> {
        let value = self.pop()?;
        if value == self.state.special.boolean(condition) {
            self.state.pc += delta;
        } else if value != self.state.special.boolean(!condition) {
            self.state.sp += 1;
            let selector = self.special_object(SELECTOR_MUST_BE_BOOLEAN)?;
            self.send(selector, 0, false)?;
        }
        Ok(())
    }

    fn return_to_home_sender(&mut self, value: Value) -> Result<(), VmError> {
        let sender = self.memory.fetch(self.state.home_context, CONTEXT_SENDER)?;
        self.do_return(value, sender)
    }

    // ── Special selectors ─────────────────────────────────────────────

    fn special_arithmetic(&mut self, index: u8) -> Result<(), VmError> {
        let done = match index {
            0 => self.integer_op(arith::safe_add)?,
            1 => self.integer_op(arith::safe_sub)?,
            2 => self.integer_compare(|a, b| a < b)?,
            3 => self.integer_compare(|a, b| a > b)?,
            4 => self.integer_compare(|a, b| a <= b)?,
            5 => self.integer_compare(|a, b| a >= b)?,
            6 => self.integer_compare(|a, b| a == b)?,
            7 => self.integer_compare(|a, b| a != b)?,
            8 => self.integer_op(arith::safe_multiply)?,
            9 => self.integer_op(arith::quick_divide)?,
            10 => self.integer_op(arith::modulo)?,
            11 => self.point_fast_path()?,
            12 => self.integer_op(arith::safe_shift)?,
            13 => self.integer_op(arith::div)?,
            14 => self.integer_op(|a, b| Some(a & b))?,
            _ => self.integer_op(|a, b| Some(a | b))?,
        };
        if !done {
            self.send_special(usize::from(index))?;
        }
        Ok(())
    }

    fn special_send(&mut self, index: u8) -> Result<(), VmError> {
        let done = match index {
            0 => self.cached_at()?,
            1 => self.cached_at_put()?,
            6 => {
                let argument = self.stack_value(0)?;
                let receiver = self.stack_value(1)?;
                self.pop_n(2);
                self.push_bool_and_peek(receiver == argument)?;
                true
            }
            7 => {
                let class = self.fetch_class(self.top()?)?;
                self.pop_n_and_push(1, class)?;
                true
            }
            8 => self.primitive_block_copy(1)?,
            9 => self.primitive_block_value(0)?,
            10 => self.primitive_block_value(1)?,
            _ => false,
        };
        if !done {
            self.send_special(16 + usize::from(index))?;
        }
        Ok(())
    }

    fn send_special(&mut self, index: usize) -> Result<(), VmError> {
        let selectors = self.state.special.special_selectors;
        let selector = self.memory.fetch(selectors, index * 2)?;
        let argc = self.memory.fetch_small(selectors, index * 2 + 1)?;
        self.send(selector, argc as usize, false)
    }

    fn integer_op(&mut self, op: fn(i32, i32) -> Option<i32>) -> Result<bool, VmError> {
        let (Some(a), Some(b)) = (self.stack_small(1)?, self.stack_small(0)?) else {
            return Ok(false);
        };
        let Some(result) = op(a, b).and_then(Value::small) else {
            return Ok(false);
        };
        self.pop_n_and_push(2, result)?;
        Ok(true)
    }

    fn integer_compare(&mut self, op: fn(i32, i32) -> bool) -> Result<bool, VmError> {
        let (Some(a), Some(b)) = (self.stack_small(1)?, self.stack_small(0)?) else {
            return Ok(false);
        };
        self.pop_n(2);
        self.push_bool_and_peek(op(a, b))?;
        Ok(true)
    }

    fn push_bool_and_peek(&mut self, result: bool) -> Result<(), VmError> {
        let action = match self.memory.object(self.state.method)?.bytes() {
            Some(code) => fuse_branch(result, code, self.state.pc),
            None => BranchFusion::Materialize,
        };
        match action {
            BranchFusion::Materialize => self.push(self.state.special.boolean(result)),
            BranchFusion::Fold { advance } => {
                self.state.pc += advance;
                Ok(())
            }
        }
    }

    // ── Sends ─────────────────────────────────────────────────────────

    pub(crate) fn send(
        &mut self,
        selector: Value,
        argc: usize,
        to_super: bool,
    ) -> Result<(), VmError> {
        let class = if to_super {
            self.method_class_superclass()?
        } else {
            let receiver = self.stack_value(argc)?;
            self.fetch_class(receiver)?
        };
        self.send_to_class(selector, argc, class)
    }

    pub(crate) fn send_to_class(
        &mut self,
        selector: Value,
        argc: usize,
        class: Value,
    ) -> Result<(), VmError> {
        self.state.message_selector = selector;
        self.state.argument_count = argc;
        self.state.lookup_class = class;
        self.find_new_method_in_class(class)?;
        self.execute_new_method()
    }

    pub(crate) fn execute_new_method(&mut self) -> Result<(), VmError> {
        let primitive = self.state.primitive_index;
        if primitive > 0 && self.primitive_response(primitive)? {
            return Ok(());
        }
        self.activate_new_method()
    }

    /// Superclass of the class the current method was compiled in. The last
    /// literal holds an association whose value is that class.
    fn method_class_superclass(&self) -> Result<Value, VmError> {
        let method = self.state.method;
        let header = self
            .memory
            .object(method)?
            .method_header()
            .ok_or(VmError::NotAMethod(method))?;
        let association = self.memory.fetch(method, header.num_literals())?;
        let class = self.memory.fetch(association, ASSOCIATION_VALUE)?;
        Ok(self.memory.fetch(class, CLASS_SUPERCLASS)?)
    }

    // ── Stack ─────────────────────────────────────────────────────────

    pub fn push(&mut self, value: Value) -> Result<(), VmError> {
        self.state.sp += 1;
        self.memory
            .store(self.state.active_context, self.state.sp, value)?;
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value, VmError> {
        let value = self.top()?;
        self.state.sp -= 1;
        Ok(value)
    }

    pub fn pop_n(&mut self, n: usize) {
        self.state.sp = self.state.sp.saturating_sub(n);
    }

    pub fn pop_n_and_push(&mut self, n: usize, value: Value) -> Result<(), VmError> {
        self.pop_n(n);
        self.push(value)
    }

    pub fn top(&self) -> Result<Value, VmError> {
        self.stack_value(0)
    }

    pub fn stack_value(&self, depth: usize) -> Result<Value, VmError> {
        let context = self.state.active_context;
        let index = self
            .state
            .sp
            .checked_sub(depth)
            .ok_or(crate::MemoryError::IndexOutOfBounds {
                object: context,
                index: 0,
            })?;
        Ok(self.memory.fetch(context, index)?)
    }

    pub fn stack_small(&self, depth: usize) -> Result<Option<i32>, VmError> {
        Ok(self.stack_value(depth)?.as_small())
    }

    // ── Variables ─────────────────────────────────────────────────────

    fn temporary(&self, index: usize) -> Result<Value, VmError> {
        Ok(self
            .memory
            .fetch(self.state.home_context, TEMP_FRAME_START + index)?)
    }

    fn store_temporary(&mut self, index: usize, value: Value) -> Result<(), VmError> {
        self.memory
            .store(self.state.home_context, TEMP_FRAME_START + index, value)?;
        Ok(())
    }

    fn literal(&self, index: usize) -> Result<Value, VmError> {
        Ok(self.memory.fetch(self.state.method, index + 1)?)
    }

    fn literal_variable(&self, index: usize) -> Result<Value, VmError> {
        let association = self.literal(index)?;
        Ok(self.memory.fetch(association, ASSOCIATION_VALUE)?)
    }

    // ── Object helpers ────────────────────────────────────────────────

    pub fn fetch_class(&self, value: Value) -> Result<Value, VmError> {
        if value.is_small_int() {
            return Ok(self.state.special.small_integer_class);
        }
        Ok(self.memory.object(value)?.class)
    }

    pub fn class_format(&self, class: Value) -> Result<ClassFormat, VmError> {
        Ok(ClassFormat(self.memory.fetch_small(class, CLASS_FORMAT)?))
    }

    pub fn special_object(&self, index: usize) -> Result<Value, VmError> {
        Ok(self.memory.fetch(self.state.special.array, index)?)
    }

    pub fn is_context(&self, value: Value) -> bool {
        let Some(object) = self.memory.get(value) else {
            return false;
        };
        object.class == self.state.special.method_context_class
            || object.class == self.state.special.block_context_class
    }

    /// Printable form of a symbol or string, for diagnostics.
    pub fn string_of(&self, value: Value) -> String {
        match self.memory.get(value).and_then(|o| o.bytes()) {
            Some(bytes) if !value.is_small_int() => String::from_utf8_lossy(bytes).into_owned(),
            _ => format!("{value:?}"),
        }
    }

    /// Re-reads the cached special objects after the array was replaced.
    pub(crate) fn refresh_special_objects(&mut self, array: Value) -> Result<(), VmError> {
        self.state.special = SpecialObjects::resolve(&self.memory, array)?;
        debug!("special objects refreshed");
        Ok(())
    }
}

#[inline]
pub(crate) fn small(value: i32) -> Value {
    Value::small(value).unwrap_or(Value::from_raw(1))
}
