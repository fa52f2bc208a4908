//! Display, cursor and input primitives. They only move data between the
//! object memory and the host collaborators.

use log::debug;

use crate::{
    Interpreter, ObjectMemory, Value, VmError,
    display::FormBits,
    interpreter::small,
    special::{FORM_BITS, FORM_DEPTH, FORM_HEIGHT, FORM_WIDTH, POINT_X, POINT_Y, THE_DISPLAY},
};

/// Borrows the bitmap of a Form whose bits are a word array.
fn read_form(memory: &ObjectMemory, form: Value) -> Option<FormBits<'_>> {
    let fields = memory.get(form)?.pointers()?;
    if fields.len() <= FORM_DEPTH {
        return None;
    }
    let dimension = |index: usize| fields[index].as_small().and_then(|n| usize::try_from(n).ok());
    let bits = memory.get(fields[FORM_BITS])?.words()?;
    Some(FormBits {
        bits,
        width: dimension(FORM_WIDTH)?,
        height: dimension(FORM_HEIGHT)?,
        depth: dimension(FORM_DEPTH)?,
    })
}

fn point_coordinates(memory: &ObjectMemory, point: Value) -> Option<(i32, i32)> {
    let fields = memory.get(point)?.pointers()?;
    Some((fields.get(POINT_X)?.as_small()?, fields.get(POINT_Y)?.as_small()?))
}

fn answer_key(vm: &mut Interpreter, argc: usize, key: Option<u32>) -> Result<bool, VmError> {
    let result = match key {
        Some(code) => small(code as i32),
        None => vm.state.special.nil,
    };
    vm.succeed(argc, result)
}

pub fn mouse_point(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let snapshot = vm.input.snapshot();
    let (Some(x), Some(y)) = (Value::small(snapshot.mouse_x), Value::small(snapshot.mouse_y)) else {
        return Ok(false);
    };
    let point = vm.make_point(x, y)?;
    vm.succeed(argc, point)
}

/// `cursorLocPut:` moves the recorded pointer position.
pub fn cursor_location(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let Some((x, y)) = point_coordinates(&vm.memory, vm.argument(argc, 0)?) else {
        return Ok(false);
    };
    vm.input.mouse_moved(x, y);
    vm.pop_n(argc);
    Ok(true)
}

/// `beCursor` and `beCursorWithMask:`.
pub fn be_cursor(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc > 1 {
        return Ok(false);
    }
    let Some(cursor) = read_form(&vm.memory, vm.receiver_of(argc)?) else {
        return Ok(false);
    };
    let mask = if argc == 1 {
        match read_form(&vm.memory, vm.argument(argc, 0)?) {
            Some(mask) => Some(mask.bits),
            None => return Ok(false),
        }
    } else {
        None
    };
    vm.display.set_cursor(cursor.bits, mask);
    vm.pop_n(argc);
    Ok(true)
}

/// Registers the receiver Form as the screen and shows it.
pub fn be_display(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let form = vm.receiver_of(argc)?;
    let Some(bits) = read_form(&vm.memory, form) else {
        return Ok(false);
    };
    debug!("display form {}x{}x{}", bits.width, bits.height, bits.depth);
    vm.display.update(&bits);
    vm.memory.store(vm.state.special.array, THE_DISPLAY, form)?;
    vm.pop_n(argc);
    Ok(true)
}

pub fn screen_size(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let (width, height) = vm.display.extent();
    let point = vm.make_point(small(width as i32), small(height as i32))?;
    vm.succeed(argc, point)
}

/// Button mask with the modifier keys in the bits above it.
pub fn mouse_buttons(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let snapshot = vm.input.snapshot();
    vm.succeed(argc, small((snapshot.buttons | snapshot.modifiers) as i32))
}

pub fn keyboard_next(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let key = vm.input.keyboard_next();
    answer_key(vm, argc, key)
}

pub fn keyboard_peek(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let key = vm.input.keyboard_peek();
    answer_key(vm, argc, key)
}

/// Pushes the registered display Form to the host again.
pub fn force_display_update(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let form = vm.special_object(THE_DISPLAY)?;
    if let Some(bits) = read_form(&vm.memory, form) {
        vm.display.update(&bits);
    }
    vm.pop_n(argc);
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::{Display, SHIFT_KEY};
    use crate::object::{FORMAT_FIXED, FORMAT_WORDS};
    use crate::primitives::test_support::{idle_vm, run_primitive};
    use crate::{Body, HeapObject};

    fn form(vm: &mut Interpreter, width: i32, height: i32) -> Value {
        let nil = vm.state.special.nil;
        let bits = vm
            .memory
            .register(HeapObject::new(nil, FORMAT_WORDS, Body::Words(vec![0; 16])), &mut vm.state)
            .expect("bits");
        let fields = vec![bits, small(width), small(height), small(1)];
        vm.memory
            .register(HeapObject::new(nil, FORMAT_FIXED, Body::Pointers(fields)), &mut vm.state)
            .expect("form")
    }

    #[test]
    fn keyboard_primitives_read_the_queue() {
        let mut vm = idle_vm();
        let nil = vm.state.special.nil;
        assert!(run_primitive(&mut vm, 109, nil, &[]));
        assert_eq!(vm.top().expect("top"), nil);

        vm.input.set_modifiers(SHIFT_KEY);
        vm.input.key_pressed(u32::from(b'a'));
        assert!(run_primitive(&mut vm, 109, nil, &[]));
        assert_eq!(vm.top().expect("top"), small(0x100 | i32::from(b'a')));
        assert!(run_primitive(&mut vm, 108, nil, &[]));
        assert_eq!(vm.top().expect("top"), small(0x100 | i32::from(b'a')));
        assert!(run_primitive(&mut vm, 108, nil, &[]));
        assert_eq!(vm.top().expect("top"), nil);
    }

    #[test]
    fn mouse_state_is_answered_as_objects() {
        let mut vm = idle_vm();
        let nil = vm.state.special.nil;
        vm.input.mouse_moved(10, 20);
        vm.input.set_buttons(crate::display::RED_BUTTON);
        assert!(run_primitive(&mut vm, 90, nil, &[]));
        let point = vm.top().expect("top");
        assert_eq!(point_coordinates(&vm.memory, point), Some((10, 20)));
        assert!(run_primitive(&mut vm, 107, nil, &[]));
        assert_eq!(vm.top().expect("top"), small(4));

        assert!(run_primitive(&mut vm, 106, nil, &[]));
        let extent = vm.top().expect("top");
        assert_eq!(point_coordinates(&vm.memory, extent), Some((640, 480)));
    }

    #[test]
    fn be_display_registers_the_form() {
        let mut vm = idle_vm();
        let screen = form(&mut vm, 32, 16);
        assert!(run_primitive(&mut vm, 102, screen, &[]));
        assert_eq!(vm.special_object(THE_DISPLAY).expect("display"), screen);
        assert_eq!(vm.display.extent(), (640, 480));
        assert!(run_primitive(&mut vm, 127, screen, &[]));

        let nil = vm.state.special.nil;
        assert!(!run_primitive(&mut vm, 102, nil, &[]));
    }
}
