//! Context (call frame) lifecycle: activation, register transfer, recycling
//! and returns.
//!
//! Contexts keep pc and sp in the image's encoding. The pc is a byte offset
//! into the whole method object (header and literals included, 1-based) and
//! the sp counts the occupied temp/stack slots.

use log::trace;

use crate::{
    Body, HeapObject, Interpreter, Value, VmError,
    interpreter::small,
    object::FORMAT_FIXED_INDEXABLE,
    special::{
        BLOCK_HOME, BLOCK_INITIAL_PC, CONTEXT_METHOD, CONTEXT_PC, CONTEXT_RECEIVER, CONTEXT_SENDER,
        CONTEXT_SP, TEMP_FRAME_START,
    },
};

/// Byte offset of bytecode 0 inside a method with `num_literals` literals.
pub(crate) fn bytecode_start(num_literals: usize) -> i64 {
    (num_literals as i64 + 1) * 4 + 1
}

impl Interpreter {
    pub(crate) fn encode_pc(&self, method: Value, pc: usize) -> Result<Value, VmError> {
        let header = self
            .memory
            .object(method)?
            .method_header()
            .ok_or(VmError::NotAMethod(method))?;
        Ok(small((pc as i64 + bytecode_start(header.num_literals())) as i32))
    }

    pub(crate) fn decode_pc(&self, method: Value, encoded: i32) -> Result<usize, VmError> {
        let header = self
            .memory
            .object(method)?
            .method_header()
            .ok_or(VmError::NotAMethod(method))?;
        let pc = i64::from(encoded) - bytecode_start(header.num_literals());
        usize::try_from(pc).map_err(|_| VmError::PcOutOfRange { pc: 0 })
    }

    /// Loads the registers from `context`. Block contexts hold a SmallInteger
    /// argument count where method contexts hold their method.
    pub(crate) fn fetch_context_registers(&mut self, context: Value) -> Result<(), VmError> {
        let home = if self.memory.fetch(context, CONTEXT_METHOD)?.is_small_int() {
            self.memory.fetch(context, BLOCK_HOME)?
        } else {
            context
        };
        let method = self.memory.fetch(home, CONTEXT_METHOD)?;
        let receiver = self.memory.fetch(home, CONTEXT_RECEIVER)?;
        let encoded_pc = self.memory.fetch_small(context, CONTEXT_PC)?;
        let stack_depth = self.memory.fetch_small(context, CONTEXT_SP)?;

        self.state.pc = self.decode_pc(method, encoded_pc)?;
        self.state.sp = (TEMP_FRAME_START as i32 - 1 + stack_depth).max(0) as usize;
        self.state.active_context = context;
        self.state.home_context = home;
        self.state.method = method;
        self.state.receiver = receiver;
        Ok(())
    }

    pub(crate) fn store_context_registers(&mut self) -> Result<(), VmError> {
        let context = self.state.active_context;
        let pc = self.encode_pc(self.state.method, self.state.pc)?;
        let depth = small(self.state.sp as i32 - (TEMP_FRAME_START as i32 - 1));
        self.memory.store(context, CONTEXT_PC, pc)?;
        self.memory.store(context, CONTEXT_SP, depth)?;
        Ok(())
    }

    pub(crate) fn new_active_context(&mut self, context: Value) -> Result<(), VmError> {
        self.store_context_registers()?;
        self.fetch_context_registers(context)
    }

    /// Hands out a nil-filled method context, reusing a freed one when
    /// available.
    pub(crate) fn allocate_or_recycle_context(&mut self, large: bool) -> Result<Value, VmError> {
        let nil = self.state.special.nil;
        let recycled = if large {
            self.state.free_large_contexts.pop()
        } else {
            self.state.free_contexts.pop()
        };
        if let Some(context) = recycled {
            if let Some(fields) = self.memory.object_mut(context)?.pointers_mut() {
                fields.fill(nil);
            }
            return Ok(context);
        }

        let frame = if large {
            self.config.large_frame_size
        } else {
            self.config.small_frame_size
        };
        let class = self.state.special.method_context_class;
        let context = HeapObject::new(
            class,
            FORMAT_FIXED_INDEXABLE,
            Body::Pointers(vec![nil; TEMP_FRAME_START + frame]),
        );
        Ok(self.memory.register(context, &mut self.state)?)
    }

    /// Puts a dead method context back on the free list matching its size.
    fn recycle_context(&mut self, context: Value) {
        let Some(object) = self.memory.get(context) else {
            return;
        };
        if object.class != self.state.special.method_context_class {
            return;
        }
        let frame = object.pointer_len().saturating_sub(TEMP_FRAME_START);
        if frame == self.config.small_frame_size {
            self.state.free_contexts.push(context);
        } else if frame == self.config.large_frame_size {
            self.state.free_large_contexts.push(context);
        }
    }

    /// Builds a context for `new_method`, moves the receiver and arguments
    /// into it and makes it active.
    pub(crate) fn activate_new_method(&mut self) -> Result<(), VmError> {
        let method = self.state.new_method;
        let header = self
            .memory
            .object(method)?
            .method_header()
            .ok_or(VmError::NotAMethod(method))?;
        let context = self.allocate_or_recycle_context(header.large_context())?;
        let argc = self.state.argument_count;

        self.memory.store(context, CONTEXT_SENDER, self.state.active_context)?;
        self.memory.store(context, CONTEXT_PC, self.encode_pc(method, 0)?)?;
        self.memory
            .store(context, CONTEXT_SP, small(header.num_temps() as i32))?;
        self.memory.store(context, CONTEXT_METHOD, method)?;
        for i in 0..=argc {
            let value = self.stack_value(argc - i)?;
            self.memory.store(context, CONTEXT_RECEIVER + i, value)?;
        }
        self.pop_n(argc + 1);
        self.state.reclaimable_contexts += 1;
        self.new_active_context(context)?;
        self.check_for_interrupts()
    }

    /// Hook for `ensure:` blocks between the active context and a return
    /// target. Nothing marks contexts for unwinding yet, so this always
    /// answers false.
    fn is_unwind_marked(&self, _context: Value) -> bool {
        false
    }

    /// Returns `value` to `target`, killing every context passed on the way.
    pub(crate) fn do_return(&mut self, value: Value, target: Value) -> Result<(), VmError> {
        let nil = self.state.special.nil;
        if target == nil || self.memory.fetch(target, CONTEXT_PC)? == nil {
            return Err(VmError::CannotReturn(target));
        }

        let mut context = self.state.active_context;
        while context != target {
            if context == nil {
                return Err(VmError::BrokenSenderChain { target });
            }
            if self.is_unwind_marked(context) {
                trace!("unwind pending in {context:?}");
            }
            context = self.memory.fetch(context, CONTEXT_SENDER)?;
        }

        let mut context = self.state.active_context;
        while context != target {
            let sender = self.memory.fetch(context, CONTEXT_SENDER)?;
            self.memory.store(context, CONTEXT_SENDER, nil)?;
            self.memory.store(context, CONTEXT_PC, nil)?;
            if self.state.reclaimable_contexts > 0 {
                self.state.reclaimable_contexts -= 1;
                self.recycle_context(context);
            }
            context = sender;
        }

        self.fetch_context_registers(target)?;
        self.push(value)
    }

    /// Initial pc of a block whose body starts `offset` bytes past the current pc.
    pub(crate) fn encoded_block_start(&self, offset: usize) -> Result<Value, VmError> {
        self.encode_pc(self.state.method, self.state.pc + offset)
    }

    pub(crate) fn block_initial_pc(&self, block: Value) -> Result<Value, VmError> {
        Ok(self.memory.fetch(block, BLOCK_INITIAL_PC)?)
    }
}
