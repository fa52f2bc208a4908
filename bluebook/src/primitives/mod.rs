//! Numbered primitives.
//!
//! A primitive receives the interpreter and the argument count of the send.
//! The receiver and arguments are still on the stack. On success it replaces
//! them with the result and answers `true`; on failure it answers `false` and
//! leaves the stack untouched so the method body runs instead.

use log::trace;

use crate::{Interpreter, Value, VmError, interpreter::small, object::FORMAT_BYTES};

pub mod arithmetic;
pub mod control;
pub mod io;
pub mod storage;
pub mod system;

pub use storage::AtCache;

pub type PrimitiveFn = fn(&mut Interpreter, usize) -> Result<bool, VmError>;

#[derive(Clone, Copy)]
pub struct PrimitiveDesc {
    pub name: &'static str,
    pub index: u32,
    pub func: PrimitiveFn,
}

impl PrimitiveDesc {
    pub const fn new(name: &'static str, index: u32, func: PrimitiveFn) -> Self {
        Self { name, index, func }
    }
}

pub fn default_primitives() -> Vec<PrimitiveDesc> {
    vec![
        PrimitiveDesc::new("add", 1, arithmetic::add),
        PrimitiveDesc::new("subtract", 2, arithmetic::subtract),
        PrimitiveDesc::new("less_than", 3, arithmetic::less_than),
        PrimitiveDesc::new("greater_than", 4, arithmetic::greater_than),
        PrimitiveDesc::new("less_or_equal", 5, arithmetic::less_or_equal),
        PrimitiveDesc::new("greater_or_equal", 6, arithmetic::greater_or_equal),
        PrimitiveDesc::new("equal", 7, arithmetic::equal),
        PrimitiveDesc::new("not_equal", 8, arithmetic::not_equal),
        PrimitiveDesc::new("multiply", 9, arithmetic::multiply),
        PrimitiveDesc::new("divide", 10, arithmetic::divide),
        PrimitiveDesc::new("modulo", 11, arithmetic::modulo),
        PrimitiveDesc::new("div", 12, arithmetic::div),
        PrimitiveDesc::new("quo", 13, arithmetic::quo),
        PrimitiveDesc::new("bit_and", 14, arithmetic::bit_and),
        PrimitiveDesc::new("bit_or", 15, arithmetic::bit_or),
        PrimitiveDesc::new("bit_xor", 16, arithmetic::bit_xor),
        PrimitiveDesc::new("bit_shift", 17, arithmetic::bit_shift),
        PrimitiveDesc::new("make_point", 18, arithmetic::make_point),
        PrimitiveDesc::new("as_float", 40, arithmetic::as_float),
        PrimitiveDesc::new("float_add", 41, arithmetic::float_add),
        PrimitiveDesc::new("float_subtract", 42, arithmetic::float_subtract),
        PrimitiveDesc::new("float_less_than", 43, arithmetic::float_less_than),
        PrimitiveDesc::new("float_greater_than", 44, arithmetic::float_greater_than),
        PrimitiveDesc::new("float_less_or_equal", 45, arithmetic::float_less_or_equal),
        PrimitiveDesc::new("float_greater_or_equal", 46, arithmetic::float_greater_or_equal),
        PrimitiveDesc::new("float_equal", 47, arithmetic::float_equal),
        PrimitiveDesc::new("float_not_equal", 48, arithmetic::float_not_equal),
        PrimitiveDesc::new("float_multiply", 49, arithmetic::float_multiply),
        PrimitiveDesc::new("float_divide", 50, arithmetic::float_divide),
        PrimitiveDesc::new("float_truncated", 51, arithmetic::float_truncated),
        PrimitiveDesc::new("at", 60, storage::at),
        PrimitiveDesc::new("at_put", 61, storage::at_put),
        PrimitiveDesc::new("size", 62, storage::size),
        PrimitiveDesc::new("string_at", 63, storage::string_at),
        PrimitiveDesc::new("string_at_put", 64, storage::string_at_put),
        PrimitiveDesc::new("object_at", 68, storage::object_at),
        PrimitiveDesc::new("object_at_put", 69, storage::object_at_put),
        PrimitiveDesc::new("basic_new", 70, storage::basic_new),
        PrimitiveDesc::new("basic_new_with_arg", 71, storage::basic_new_with_arg),
        PrimitiveDesc::new("inst_var_at", 73, storage::inst_var_at),
        PrimitiveDesc::new("inst_var_at_put", 74, storage::inst_var_at_put),
        PrimitiveDesc::new("as_oop", 75, storage::as_oop),
        PrimitiveDesc::new("some_instance", 77, storage::some_instance),
        PrimitiveDesc::new("next_instance", 78, storage::next_instance),
        PrimitiveDesc::new("new_method", 79, storage::new_method),
        PrimitiveDesc::new("block_copy", 80, control::block_copy),
        PrimitiveDesc::new("block_value", 81, control::block_value),
        PrimitiveDesc::new("perform", 83, control::perform),
        PrimitiveDesc::new("perform_with_arguments", 84, control::perform_with_arguments),
        PrimitiveDesc::new("signal", 85, control::signal),
        PrimitiveDesc::new("wait", 86, control::wait),
        PrimitiveDesc::new("resume", 87, control::resume),
        PrimitiveDesc::new("suspend", 88, control::suspend),
        PrimitiveDesc::new("flush_cache", 89, system::flush_cache),
        PrimitiveDesc::new("mouse_point", 90, io::mouse_point),
        PrimitiveDesc::new("cursor_location", 91, io::cursor_location),
        PrimitiveDesc::new("perform_in_superclass", 100, control::perform_in_superclass),
        PrimitiveDesc::new("be_cursor", 101, io::be_cursor),
        PrimitiveDesc::new("be_display", 102, io::be_display),
        PrimitiveDesc::new("replace_from_to", 105, storage::replace_from_to),
        PrimitiveDesc::new("screen_size", 106, io::screen_size),
        PrimitiveDesc::new("mouse_buttons", 107, io::mouse_buttons),
        PrimitiveDesc::new("keyboard_next", 108, io::keyboard_next),
        PrimitiveDesc::new("keyboard_peek", 109, io::keyboard_peek),
        PrimitiveDesc::new("equivalent", 110, system::equivalent),
        PrimitiveDesc::new("class", 111, system::class),
        PrimitiveDesc::new("bytes_left", 112, system::bytes_left),
        PrimitiveDesc::new("quit", 113, system::quit),
        PrimitiveDesc::new("flush_cache_by_method", 116, system::flush_cache_by_method),
        PrimitiveDesc::new("flush_cache_selective", 119, system::flush_cache_selective),
        PrimitiveDesc::new("force_display_update", 127, io::force_display_update),
        PrimitiveDesc::new("array_become", 128, system::array_become),
        PrimitiveDesc::new("special_objects_oop", 129, system::special_objects_oop),
        PrimitiveDesc::new("full_gc", 130, system::full_gc),
        PrimitiveDesc::new("incremental_gc", 131, system::incremental_gc),
        PrimitiveDesc::new("millisecond_clock", 135, system::millisecond_clock),
        PrimitiveDesc::new("signal_at_milliseconds", 136, system::signal_at_milliseconds),
        PrimitiveDesc::new("seconds_clock", 137, system::seconds_clock),
        PrimitiveDesc::new("some_object", 138, system::some_object),
        PrimitiveDesc::new("next_object", 139, system::next_object),
        PrimitiveDesc::new("clone", 148, system::clone),
        PrimitiveDesc::new("yield", 167, control::yield_primitive),
        PrimitiveDesc::new("relinquish_processor", 230, control::relinquish_processor),
        PrimitiveDesc::new("array_become_one_way", 248, system::array_become_one_way),
    ]
}

/// Dense index -> primitive mapping built from [`default_primitives`].
pub struct PrimitiveTable {
    entries: Vec<Option<PrimitiveDesc>>,
}

impl PrimitiveTable {
    pub fn new(primitives: Vec<PrimitiveDesc>) -> Self {
        let len = primitives.iter().map(|p| p.index as usize + 1).max().unwrap_or(0);
        let mut entries = vec![None; len];
        for primitive in primitives {
            entries[primitive.index as usize] = Some(primitive);
        }
        Self { entries }
    }

    pub fn get(&self, index: u32) -> Option<&PrimitiveDesc> {
        self.entries.get(index as usize)?.as_ref()
    }
}

impl Default for PrimitiveTable {
    fn default() -> Self {
        Self::new(default_primitives())
    }
}

// Quick primitives: return the receiver, a constant or an instance variable
// without building a context.
const QUICK_RETURN_SELF: u32 = 256;
const QUICK_RETURN_CONSTANT_END: u32 = 263;
const QUICK_INST_VAR_START: u32 = 264;
const QUICK_INST_VAR_END: u32 = 519;

impl Interpreter {
    /// Runs primitive `index` for the pending send. Answers whether it
    /// succeeded.
    pub(crate) fn primitive_response(&mut self, index: u32) -> Result<bool, VmError> {
        if (QUICK_RETURN_SELF..=QUICK_INST_VAR_END).contains(&index) {
            return self.quick_primitive(index);
        }
        let Some(primitive) = self.primitives.get(index).copied() else {
            trace!("primitive {index} not implemented");
            return Ok(false);
        };
        let argc = self.state.argument_count;
        let sp = self.state.sp;
        let success = (primitive.func)(self, argc)?;
        if !success {
            trace!("primitive {} ({index}) failed", primitive.name);
            self.state.sp = sp;
        }
        Ok(success)
    }

    fn quick_primitive(&mut self, index: u32) -> Result<bool, VmError> {
        let argc = self.state.argument_count;
        let receiver = self.stack_value(argc)?;
        let special = &self.state.special;
        let result = match index {
            QUICK_RETURN_SELF => receiver,
            257 => special.true_obj,
            258 => special.false_obj,
            259 => special.nil,
            260..=QUICK_RETURN_CONSTANT_END => small(index as i32 - 261),
            _ => {
                let field = (index - QUICK_INST_VAR_START) as usize;
                match self.memory.get(receiver).and_then(|o| o.pointers()) {
                    Some(fields) if field < fields.len() => fields[field],
                    _ => return Ok(false),
                }
            }
        };
        self.pop_n_and_push(argc + 1, result)?;
        Ok(true)
    }

    // ── Helpers shared by the primitive modules ───────────────────────

    /// Replaces receiver and arguments with `value`.
    pub(crate) fn succeed(&mut self, argc: usize, value: Value) -> Result<bool, VmError> {
        self.pop_n_and_push(argc + 1, value)?;
        Ok(true)
    }

    pub(crate) fn receiver_of(&self, argc: usize) -> Result<Value, VmError> {
        self.stack_value(argc)
    }

    /// Argument `n` (0-based) of a send with `argc` arguments.
    pub(crate) fn argument(&self, argc: usize, n: usize) -> Result<Value, VmError> {
        self.stack_value(argc - 1 - n)
    }

    /// Unsigned 32-bit value of a non-negative SmallInteger or a 4-byte
    /// LargePositiveInteger.
    pub(crate) fn positive_32_bit_value(&self, value: Value) -> Option<u32> {
        if let Some(n) = value.as_small() {
            return u32::try_from(n).ok();
        }
        let object = self.memory.get(value)?;
        if object.class != self.state.special.large_positive_integer_class {
            return None;
        }
        let bytes = object.bytes()?;
        if bytes.len() > 4 {
            return None;
        }
        Some(
            bytes
                .iter()
                .rev()
                .fold(0u32, |acc, &byte| (acc << 8) | u32::from(byte)),
        )
    }

    /// Tags `value` if it fits, otherwise boxes it as a LargePositiveInteger.
    pub(crate) fn positive_32_bit_integer(&mut self, value: u32) -> Result<Value, VmError> {
        if let Some(tagged) = i32::try_from(value).ok().and_then(Value::small) {
            return Ok(tagged);
        }
        let class = self.state.special.large_positive_integer_class;
        let object = crate::HeapObject::new(
            class,
            FORMAT_BYTES,
            crate::Body::Bytes(value.to_le_bytes().to_vec()),
        );
        Ok(self.memory.register(object, &mut self.state)?)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Bootstrap;
    use crate::object::MethodHeader;

    #[test]
    fn table_is_indexed_by_number() {
        let table = PrimitiveTable::default();
        assert_eq!(table.get(1).map(|p| p.name), Some("add"));
        assert_eq!(table.get(248).map(|p| p.name), Some("array_become_one_way"));
        assert!(table.get(19).is_none());
        assert!(table.get(10_000).is_none());
    }

    #[test]
    fn primitive_numbers_are_unique() {
        let mut seen = std::collections::HashSet::new();
        for primitive in default_primitives() {
            assert!(seen.insert(primitive.index), "duplicate {}", primitive.index);
        }
    }

    #[test]
    fn large_positive_integers_round_trip() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let method = boot.method(MethodHeader::new(0, 0, 0, 0, false), &[], &[0x70, 0x7C]);
        let mut vm = boot.start(method).expect("interpreter");

        let small_value = vm.positive_32_bit_integer(12).expect("small");
        assert!(small_value.is_small_int());
        let boxed = vm.positive_32_bit_integer(0xDEAD_BEEF).expect("boxed");
        assert!(boxed.is_object());
        assert_eq!(vm.positive_32_bit_value(boxed), Some(0xDEAD_BEEF));
        assert_eq!(vm.positive_32_bit_value(Value::small(-1).expect("small")), None);
    }

    #[test]
    fn quick_constant_skips_activation() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let constant = boot.method(MethodHeader::new(0, 0, 0, 261, false), &[], &[0x70, 0x7C]);
        let small_integer = boot.classes.small_integer;
        boot.install_method(small_integer, "zero", constant);
        let zero = boot.intern("zero");
        let driver = boot.method(
            MethodHeader::new(0, 0, 1, 0, false),
            &[zero],
            &[0x76, 0xD0, 0x7C],
        );
        let mut vm = boot.start(driver).expect("interpreter");
        let context = vm.state.active_context;

        vm.run_for(2).expect("send zero");
        assert_eq!(vm.state.active_context, context);
        assert_eq!(vm.top().expect("top"), Value::small(0).expect("small"));
    }

    #[test]
    fn quick_getter_out_of_range_runs_the_method() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let getter = boot.method(MethodHeader::new(0, 0, 0, 264, false), &[], &[0x00, 0x7C]);
        let undefined = boot.classes.undefined_object;
        boot.install_method(undefined, "first", getter);
        let first = boot.intern("first");
        let driver = boot.method(
            MethodHeader::new(0, 0, 1, 0, false),
            &[first],
            &[0x70, 0xD0, 0x7C],
        );
        let mut vm = boot.start(driver).expect("interpreter");
        let context = vm.state.active_context;

        // nil has no instance variables
        vm.run_for(2).expect("send first");
        assert_ne!(vm.state.active_context, context);
        assert_eq!(vm.state.method, getter);
    }
}
