//! Blocks, perform and process primitives.

use std::time::Duration;

use crate::{
    Body, HeapObject, Interpreter, Value, VmError,
    interpreter::small,
    object::FORMAT_FIXED_INDEXABLE,
    special::{
        BLOCK_ARG_COUNT, BLOCK_CALLER, BLOCK_HOME, BLOCK_INITIAL_PC, CLASS_SUPERCLASS,
        CONTEXT_METHOD, CONTEXT_PC, CONTEXT_SP, PROCESS_MY_LIST, PROCESS_PRIORITY,
        SEMAPHORE_EXCESS_SIGNALS, TEMP_FRAME_START,
    },
};

/// Longest pause granted to `relinquishProcessorForMicroseconds:`.
const MAX_RELINQUISH: Duration = Duration::from_millis(50);

impl Interpreter {
    /// `aContext blockCopy: argumentCount`. The block body starts right
    /// after the jump that follows this send.
    pub(crate) fn primitive_block_copy(&mut self, argc: usize) -> Result<bool, VmError> {
        if argc != 1 {
            return Ok(false);
        }
        let context = self.stack_value(1)?;
        let block_argc = self.stack_value(0)?;
        if !block_argc.is_small_int() || !self.is_context(context) {
            return Ok(false);
        }
        let home = if self.memory.fetch(context, CONTEXT_METHOD)?.is_small_int() {
            self.memory.fetch(context, BLOCK_HOME)?
        } else {
            context
        };
        // the home context now escapes into the block
        self.state.reclaimable_contexts = 0;

        let nil = self.state.special.nil;
        let size = self.memory.pointer_len(home);
        let class = self.state.special.block_context_class;
        let block = self.memory.register(
            HeapObject::new(class, FORMAT_FIXED_INDEXABLE, Body::Pointers(vec![nil; size])),
            &mut self.state,
        )?;
        let initial_pc = self.encoded_block_start(2)?;
        self.memory.store(block, BLOCK_INITIAL_PC, initial_pc)?;
        self.memory.store(block, CONTEXT_PC, initial_pc)?;
        self.memory.store(block, CONTEXT_SP, small(0))?;
        self.memory.store(block, BLOCK_ARG_COUNT, block_argc)?;
        self.memory.store(block, BLOCK_HOME, home)?;
        self.succeed(argc, block)
    }

    /// `aBlock value: ...`: copies the arguments into the block's temps and
    /// makes it the active context.
    pub(crate) fn primitive_block_value(&mut self, argc: usize) -> Result<bool, VmError> {
        let block = self.stack_value(argc)?;
        if block.is_small_int()
            || self.fetch_class(block)? != self.state.special.block_context_class
        {
            return Ok(false);
        }
        if self.memory.fetch_small(block, BLOCK_ARG_COUNT)? as usize != argc {
            return Ok(false);
        }
        if self.memory.fetch(block, BLOCK_CALLER)? != self.state.special.nil {
            return Ok(false);
        }
        for i in 0..argc {
            let argument = self.stack_value(argc - 1 - i)?;
            self.memory.store(block, TEMP_FRAME_START + i, argument)?;
        }
        let initial_pc = self.block_initial_pc(block)?;
        self.memory.store(block, CONTEXT_PC, initial_pc)?;
        self.memory.store(block, CONTEXT_SP, small(argc as i32))?;
        self.memory.store(block, BLOCK_CALLER, self.state.active_context)?;
        self.pop_n(argc + 1);
        self.new_active_context(block)?;
        Ok(true)
    }

    /// Argument count of the method `selector` resolves to in `class`, if any.
    fn resolved_arg_count(
        &mut self,
        selector: Value,
        class: Value,
    ) -> Result<Option<usize>, VmError> {
        let Some(entry) = self.lookup_method(selector, class)? else {
            return Ok(None);
        };
        Ok(self
            .memory
            .object(entry.method)?
            .method_header()
            .map(|h| h.num_args()))
    }

    fn inherits_from(&self, class: Value, ancestor: Value) -> Result<bool, VmError> {
        let nil = self.state.special.nil;
        let mut current = class;
        while current != nil {
            if current == ancestor {
                return Ok(true);
            }
            current = self.memory.fetch(current, CLASS_SUPERCLASS)?;
        }
        Ok(false)
    }

    /// Shared tail of `perform:withArguments:` with and without a lookup class.
    fn perform_with_array(
        &mut self,
        argc: usize,
        selector: Value,
        array: Value,
        lookup: Value,
    ) -> Result<bool, VmError> {
        if selector.is_small_int()
            || array.is_small_int()
            || self.fetch_class(array)? != self.state.special.array_class
        {
            return Ok(false);
        }
        let arguments: Vec<Value> = self
            .memory
            .object(array)?
            .pointers()
            .map_or_else(Vec::new, <[Value]>::to_vec);
        let capacity = self.memory.pointer_len(self.state.active_context);
        if self.state.sp - argc + arguments.len() >= capacity {
            return Ok(false);
        }
        if let Some(expected) = self.resolved_arg_count(selector, lookup)? {
            if expected != arguments.len() {
                return Ok(false);
            }
        }
        self.pop_n(argc);
        for argument in &arguments {
            self.push(*argument)?;
        }
        self.send_to_class(selector, arguments.len(), lookup)?;
        Ok(true)
    }
}

pub fn block_copy(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    vm.primitive_block_copy(argc)
}

pub fn block_value(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    vm.primitive_block_value(argc)
}

/// `perform: selector with: ...`: drops the selector from the stack and
/// sends it with the remaining arguments.
pub fn perform(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc == 0 {
        return Ok(false);
    }
    let selector = vm.argument(argc, 0)?;
    if selector.is_small_int() {
        return Ok(false);
    }
    let arguments = argc - 1;
    let class = vm.fetch_class(vm.receiver_of(argc)?)?;
    if let Some(expected) = vm.resolved_arg_count(selector, class)? {
        if expected != arguments {
            return Ok(false);
        }
    }
    let context = vm.state.active_context;
    let selector_slot = vm.state.sp - arguments;
    for slot in selector_slot..vm.state.sp {
        let value = vm.memory.fetch(context, slot + 1)?;
        vm.memory.store(context, slot, value)?;
    }
    vm.pop_n(1);
    vm.send_to_class(selector, arguments, class)?;
    Ok(true)
}

pub fn perform_with_arguments(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 2 {
        return Ok(false);
    }
    let selector = vm.argument(argc, 0)?;
    let array = vm.argument(argc, 1)?;
    let class = vm.fetch_class(vm.receiver_of(argc)?)?;
    vm.perform_with_array(argc, selector, array, class)
}

/// `perform:withArguments:inSuperclass:`; the receiver must inherit from
/// the given class.
pub fn perform_in_superclass(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 3 {
        return Ok(false);
    }
    let selector = vm.argument(argc, 0)?;
    let array = vm.argument(argc, 1)?;
    let lookup = vm.argument(argc, 2)?;
    let class = vm.fetch_class(vm.receiver_of(argc)?)?;
    if lookup.is_small_int() || !vm.inherits_from(class, lookup)? {
        return Ok(false);
    }
    vm.perform_with_array(argc, selector, array, lookup)
}

/// A LinkedList with a SmallInteger excess signal count.
fn is_semaphore(vm: &Interpreter, object: Value) -> bool {
    vm.memory
        .get(object)
        .and_then(HeapObject::pointers)
        .and_then(|fields| fields.get(SEMAPHORE_EXCESS_SIGNALS))
        .is_some_and(|excess| excess.is_small_int())
}

fn is_process(vm: &Interpreter, object: Value) -> bool {
    vm.memory
        .get(object)
        .and_then(HeapObject::pointers)
        .is_some_and(|fields| {
            fields.len() > PROCESS_MY_LIST && fields[PROCESS_PRIORITY].is_small_int()
        })
}

pub fn signal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let semaphore = vm.receiver_of(argc)?;
    if !is_semaphore(vm, semaphore) {
        return Ok(false);
    }
    vm.synchronous_signal(semaphore)?;
    Ok(true)
}

pub fn wait(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let semaphore = vm.receiver_of(argc)?;
    if !is_semaphore(vm, semaphore) {
        return Ok(false);
    }
    vm.wait(semaphore)?;
    Ok(true)
}

pub fn resume(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let process = vm.receiver_of(argc)?;
    if !is_process(vm, process) {
        return Ok(false);
    }
    vm.resume(process)?;
    Ok(true)
}

/// Only the active process can suspend itself here.
pub fn suspend(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let process = vm.receiver_of(argc)?;
    if process != vm.active_process()? {
        return Ok(false);
    }
    let nil = vm.state.special.nil;
    vm.pop_n_and_push(argc + 1, nil)?;
    let next = vm.wake_highest_priority()?;
    vm.transfer_to(next)?;
    Ok(true)
}

pub fn yield_primitive(vm: &mut Interpreter, _argc: usize) -> Result<bool, VmError> {
    vm.yield_process()?;
    Ok(true)
}

/// Idles until input arrives or the requested time passes.
pub fn relinquish_processor(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let Some(micros) = vm.argument(argc, 0)?.as_small().and_then(|n| u64::try_from(n).ok()) else {
        return Ok(false);
    };
    let pause = Duration::from_micros(micros).min(MAX_RELINQUISH);
    vm.input.wait_for_event(pause);
    vm.pop_n(argc);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Bootstrap;
    use crate::object::MethodHeader;
    use crate::primitives::test_support::{idle_vm, run_primitive};

    #[test]
    fn block_value_runs_and_returns_to_caller() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let block_copy = boot.intern("blockCopy:");
        // [:x | x + 1] value: 41
        let code = [
            0x89, 0x76, 0xC8, // thisContext blockCopy: 1
            0xA4, 0x05, // jump over the body
            0x68, 0x10, 0x76, 0xB0, 0x7D, // x := arg. ^ x + 1 to caller
            0x20, 0xCA, // value: 41
            0x7C,
        ];
        let method = boot.method(
            MethodHeader::new(0, 1, 2, 0, false),
            &[Value::small(41).expect("small"), block_copy],
            &code,
        );
        let mut vm = boot.start(method).expect("interpreter");
        let home = vm.state.active_context;

        vm.run_for(3).expect("block copy");
        let block = vm.top().expect("top");
        assert_eq!(vm.fetch_class(block).expect("class"), vm.state.special.block_context_class);
        assert_eq!(vm.memory.fetch(block, BLOCK_HOME), Ok(home));
        assert_eq!(vm.state.reclaimable_contexts, 0);

        vm.run_for(3).expect("jump, push 41, value:");
        assert_eq!(vm.state.active_context, block);
        assert_eq!(vm.state.home_context, home);
        assert_eq!(vm.state.pc, 5);

        vm.run_for(5).expect("body");
        assert_eq!(vm.state.active_context, home);
        assert_eq!(vm.top().expect("top"), Value::small(42).expect("small"));
        assert_eq!(vm.state.pc, 12);
        assert_eq!(vm.memory.fetch(block, BLOCK_CALLER), Ok(vm.state.special.nil));
    }

    #[test]
    fn process_primitives_fail_on_the_wrong_receiver() {
        let mut vm = idle_vm();
        let one = Value::small(1).expect("small");
        let point = vm.make_point(one, one).expect("point");
        let sp = vm.state.sp;
        for index in [85, 86, 87] {
            assert!(!run_primitive(&mut vm, index, one, &[]));
            assert_eq!(vm.state.sp, sp + 1);
            vm.pop().expect("receiver");
            assert!(!run_primitive(&mut vm, index, point, &[]));
            vm.pop().expect("receiver");
        }
    }

    #[test]
    fn signal_then_wait_consumes_the_excess_signal() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let semaphore = boot.semaphore();
        let method = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x70, 0x7C]);
        let mut vm = boot.start(method).expect("interpreter");
        let active = vm.active_process().expect("active");

        assert!(run_primitive(&mut vm, 85, semaphore, &[]));
        assert_eq!(
            vm.memory.fetch(semaphore, SEMAPHORE_EXCESS_SIGNALS),
            Ok(Value::small(1).expect("small"))
        );
        vm.pop().expect("receiver");
        assert!(run_primitive(&mut vm, 86, semaphore, &[]));
        assert_eq!(
            vm.memory.fetch(semaphore, SEMAPHORE_EXCESS_SIGNALS),
            Ok(Value::small(0).expect("small"))
        );
        assert_eq!(vm.active_process().expect("active"), active);
    }

    #[test]
    fn block_value_rejects_wrong_argument_count() {
        let mut vm = idle_vm();
        let context = vm.state.active_context;
        assert!(run_primitive(&mut vm, 80, context, &[Value::small(1).expect("small")]));
        let block = vm.top().expect("top");
        assert!(!run_primitive(&mut vm, 81, block, &[]));
        assert_eq!(vm.state.active_context, context);
    }

    #[test]
    fn perform_sends_the_selector() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let answer = boot.method(MethodHeader::new(1, 1, 0, 0, false), &[], &[0x10, 0x7C]);
        let undefined = boot.classes.undefined_object;
        boot.install_method(undefined, "echo:", answer);
        let echo = boot.intern("echo:");
        let nothing = boot.intern("nothing");
        let method = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x70, 0x7C]);
        let mut vm = boot.start(method).expect("interpreter");
        let nil = vm.state.special.nil;
        let five = Value::small(5).expect("small");

        // wrong arity for the resolved method
        assert!(!run_primitive(&mut vm, 83, nil, &[echo]));
        vm.pop_n(2);

        assert!(run_primitive(&mut vm, 83, nil, &[echo, five]));
        assert_eq!(vm.state.method, answer);
        vm.run_for(2).expect("echo");
        assert_eq!(vm.top().expect("top"), five);

        // unresolved selectors go through doesNotUnderstand:
        let err = run_and_err(&mut vm, nothing);
        assert!(matches!(err, VmError::RecursiveDoesNotUnderstand { .. }));
    }

    fn run_and_err(vm: &mut Interpreter, selector: Value) -> VmError {
        let nil = vm.state.special.nil;
        vm.push(nil).expect("push");
        vm.push(selector).expect("push");
        vm.state.argument_count = 1;
        vm.primitive_response(83).expect_err("no handler")
    }

    #[test]
    fn perform_with_arguments_unpacks_the_array() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let answer = boot.method(MethodHeader::new(1, 1, 0, 0, false), &[], &[0x10, 0x7C]);
        let undefined = boot.classes.undefined_object;
        boot.install_method(undefined, "echo:", answer);
        let echo = boot.intern("echo:");
        let method = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x70, 0x7C]);
        let mut vm = boot.start(method).expect("interpreter");
        let nil = vm.state.special.nil;
        let array_class = vm.state.special.array_class;
        let array = vm.memory.instantiate(array_class, 1, nil, &mut vm.state).expect("array");
        vm.memory.store(array, 0, Value::small(9).expect("small")).expect("store");

        assert!(run_primitive(&mut vm, 84, nil, &[echo, array]));
        assert_eq!(vm.state.method, answer);
        vm.run_for(2).expect("echo");
        assert_eq!(vm.top().expect("top"), Value::small(9).expect("small"));
    }
}
