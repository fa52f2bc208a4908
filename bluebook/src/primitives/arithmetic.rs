//! SmallInteger and Float arithmetic primitives.

use crate::{
    Body, HeapObject, Interpreter, Value, VmError,
    object::{FORMAT_FIXED, FORMAT_WORDS},
    value::arith,
};

fn integer_binary(
    vm: &mut Interpreter,
    argc: usize,
    op: fn(i32, i32) -> Option<i32>,
) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let (Some(a), Some(b)) = (vm.receiver_of(argc)?.as_small(), vm.argument(argc, 0)?.as_small())
    else {
        return Ok(false);
    };
    match op(a, b).and_then(Value::small) {
        Some(result) => vm.succeed(argc, result),
        None => Ok(false),
    }
}

fn integer_compare(
    vm: &mut Interpreter,
    argc: usize,
    op: fn(i32, i32) -> bool,
) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let (Some(a), Some(b)) = (vm.receiver_of(argc)?.as_small(), vm.argument(argc, 0)?.as_small())
    else {
        return Ok(false);
    };
    let result = vm.state.special.boolean(op(a, b));
    vm.succeed(argc, result)
}

pub fn add(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, arith::safe_add)
}

pub fn subtract(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, arith::safe_sub)
}

pub fn less_than(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_compare(vm, argc, |a, b| a < b)
}

pub fn greater_than(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_compare(vm, argc, |a, b| a > b)
}

pub fn less_or_equal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_compare(vm, argc, |a, b| a <= b)
}

pub fn greater_or_equal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_compare(vm, argc, |a, b| a >= b)
}

pub fn equal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_compare(vm, argc, |a, b| a == b)
}

pub fn not_equal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_compare(vm, argc, |a, b| a != b)
}

pub fn multiply(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, arith::safe_multiply)
}

/// `/` only succeeds for exact quotients.
pub fn divide(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, arith::quick_divide)
}

pub fn modulo(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, arith::modulo)
}

pub fn div(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, arith::div)
}

pub fn quo(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, arith::quo)
}

pub fn bit_and(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, |a, b| Some(a & b))
}

pub fn bit_or(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, |a, b| Some(a | b))
}

pub fn bit_xor(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, |a, b| Some(a ^ b))
}

pub fn bit_shift(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    integer_binary(vm, argc, arith::safe_shift)
}

/// `x @ y` for SmallInteger coordinates.
pub fn make_point(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let x = vm.receiver_of(argc)?;
    let y = vm.argument(argc, 0)?;
    if !x.is_small_int() || !y.is_small_int() {
        return Ok(false);
    }
    let point = vm.make_point(x, y)?;
    vm.succeed(argc, point)
}

// ── Float ─────────────────────────────────────────────────────────────

fn float_binary(
    vm: &mut Interpreter,
    argc: usize,
    op: fn(f64, f64) -> f64,
) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let receiver = vm.receiver_of(argc)?;
    if receiver.is_small_int() {
        return Ok(false);
    }
    let (Some(a), Some(b)) = (vm.float_of(receiver), vm.float_of(vm.argument(argc, 0)?)) else {
        return Ok(false);
    };
    let result = vm.new_float(op(a, b))?;
    vm.succeed(argc, result)
}

fn float_compare(
    vm: &mut Interpreter,
    argc: usize,
    op: fn(f64, f64) -> bool,
) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let receiver = vm.receiver_of(argc)?;
    if receiver.is_small_int() {
        return Ok(false);
    }
    let (Some(a), Some(b)) = (vm.float_of(receiver), vm.float_of(vm.argument(argc, 0)?)) else {
        return Ok(false);
    };
    let result = vm.state.special.boolean(op(a, b));
    vm.succeed(argc, result)
}

pub fn as_float(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let Some(n) = vm.receiver_of(argc)?.as_small() else {
        return Ok(false);
    };
    let result = vm.new_float(f64::from(n))?;
    vm.succeed(argc, result)
}

pub fn float_add(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_binary(vm, argc, |a, b| a + b)
}

pub fn float_subtract(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_binary(vm, argc, |a, b| a - b)
}

pub fn float_less_than(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_compare(vm, argc, |a, b| a < b)
}

pub fn float_greater_than(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_compare(vm, argc, |a, b| a > b)
}

pub fn float_less_or_equal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_compare(vm, argc, |a, b| a <= b)
}

pub fn float_greater_or_equal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_compare(vm, argc, |a, b| a >= b)
}

pub fn float_equal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_compare(vm, argc, |a, b| a == b)
}

pub fn float_not_equal(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_compare(vm, argc, |a, b| a != b)
}

pub fn float_multiply(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    float_binary(vm, argc, |a, b| a * b)
}

pub fn float_divide(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc == 1 && vm.float_of(vm.argument(argc, 0)?) == Some(0.0) {
        return Ok(false);
    }
    float_binary(vm, argc, |a, b| a / b)
}

pub fn float_truncated(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    if receiver.is_small_int() {
        return Ok(false);
    }
    let Some(f) = vm.float_of(receiver) else {
        return Ok(false);
    };
    let truncated = f.trunc();
    if !truncated.is_finite() {
        return Ok(false);
    }
    match Value::small_i64(truncated as i64) {
        Some(result) => vm.succeed(argc, result),
        None => Ok(false),
    }
}

impl Interpreter {
    pub(crate) fn make_point(&mut self, x: Value, y: Value) -> Result<Value, VmError> {
        let class = self.state.special.point_class;
        let point = HeapObject::new(class, FORMAT_FIXED, Body::Pointers(vec![x, y]));
        Ok(self.memory.register(point, &mut self.state)?)
    }

    /// `@` from bytecode 187.
    pub(crate) fn point_fast_path(&mut self) -> Result<bool, VmError> {
        make_point(self, 1)
    }

    /// Float value of a Float or a SmallInteger.
    pub(crate) fn float_of(&self, value: Value) -> Option<f64> {
        if let Some(n) = value.as_small() {
            return Some(f64::from(n));
        }
        let object = self.memory.get(value)?;
        if object.class != self.state.special.float_class {
            return None;
        }
        object.float()
    }

    pub(crate) fn new_float(&mut self, value: f64) -> Result<Value, VmError> {
        let class = self.state.special.float_class;
        let float = HeapObject::new(class, FORMAT_WORDS, Body::Float(value));
        Ok(self.memory.register(float, &mut self.state)?)
    }
}
