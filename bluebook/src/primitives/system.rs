//! Identity, memory management, clocks and cache control.

use std::time::{SystemTime, UNIX_EPOCH};

use log::{info, warn};

use crate::{
    Interpreter, Value, VmError,
    interpreter::small,
    special::THE_TIMER_SEMAPHORE,
};

/// Seconds between the Smalltalk epoch (1901) and the Unix epoch.
const SMALLTALK_EPOCH_OFFSET: u64 = 2_177_452_800;

fn small_count(count: usize) -> Value {
    small(count.min(crate::value::MAX_SMALL as usize) as i32)
}

pub fn flush_cache(vm: &mut Interpreter, _argc: usize) -> Result<bool, VmError> {
    vm.state.method_cache.clear();
    vm.state.at_cache.clear();
    Ok(true)
}

pub fn flush_cache_by_method(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let method = vm.receiver_of(argc)?;
    vm.state.method_cache.flush_method(method);
    vm.state.at_cache.clear();
    Ok(true)
}

pub fn flush_cache_selective(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let selector = vm.receiver_of(argc)?;
    vm.state.method_cache.flush_selector(selector);
    vm.state.at_cache.clear();
    Ok(true)
}

pub fn equivalent(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let same = vm.receiver_of(argc)? == vm.argument(argc, 0)?;
    let result = vm.state.special.boolean(same);
    vm.succeed(argc, result)
}

pub fn class(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let class = vm.fetch_class(vm.receiver_of(argc)?)?;
    vm.succeed(argc, class)
}

/// Free object table slots, the closest thing this memory has to bytes.
pub fn bytes_left(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let left = small_count(vm.memory.slots_left());
    vm.succeed(argc, left)
}

pub fn quit(vm: &mut Interpreter, _argc: usize) -> Result<bool, VmError> {
    info!("image requested quit after {} bytecodes", vm.bytecodes_executed());
    vm.quit = true;
    Ok(true)
}

fn become_arrays(vm: &mut Interpreter, argc: usize, two_way: bool) -> Result<bool, VmError> {
    if argc != 1 {
        return Ok(false);
    }
    let array_class = vm.state.special.array_class;
    let mut contents = Vec::with_capacity(2);
    for array in [vm.receiver_of(argc)?, vm.argument(argc, 0)?] {
        if array.is_small_int() || vm.fetch_class(array)? != array_class {
            return Ok(false);
        }
        contents.push(vm.memory.object(array)?.pointers().map_or_else(Vec::new, <[Value]>::to_vec));
    }
    if let Err(err) = vm.memory.bulk_become(&contents[0], &contents[1], two_way, &mut vm.state) {
        warn!("become failed: {err}");
        return Ok(false);
    }
    vm.pop_n(argc);
    Ok(true)
}

/// `elementsExchangeIdentityWith:`
pub fn array_become(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    become_arrays(vm, argc, true)
}

/// `elementsForwardIdentityTo:`
pub fn array_become_one_way(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    become_arrays(vm, argc, false)
}

pub fn special_objects_oop(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let array = vm.state.special.array;
    vm.succeed(argc, array)
}

pub fn full_gc(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    vm.memory.full_gc(&mut vm.state);
    let left = small_count(vm.memory.slots_left());
    vm.succeed(argc, left)
}

pub fn incremental_gc(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    vm.memory.partial_gc(&mut vm.state);
    let left = small_count(vm.memory.slots_left());
    vm.succeed(argc, left)
}

pub fn millisecond_clock(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let now = vm.millisecond_clock();
    vm.succeed(argc, small(now as i32))
}

/// `signal: aSemaphore atMilliseconds: tick` arms the timer; a nil
/// semaphore disarms it.
pub fn signal_at_milliseconds(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    if argc != 2 {
        return Ok(false);
    }
    let semaphore = vm.argument(argc, 0)?;
    let Some(tick) = vm.argument(argc, 1)?.as_small() else {
        return Ok(false);
    };
    if semaphore.is_small_int() {
        return Ok(false);
    }
    vm.memory
        .store(vm.state.special.array, THE_TIMER_SEMAPHORE, semaphore)?;
    vm.timing.next_wakeup_tick = if semaphore == vm.state.special.nil {
        0
    } else {
        i64::from(tick)
    };
    vm.pop_n(argc);
    Ok(true)
}

pub fn seconds_clock(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let unix = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |elapsed| elapsed.as_secs());
    let seconds = vm.positive_32_bit_integer((unix + SMALLTALK_EPOCH_OFFSET) as u32)?;
    vm.succeed(argc, seconds)
}

pub fn some_object(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let first = vm.memory.next_instance(0, None).unwrap_or(vm.state.special.nil);
    vm.succeed(argc, first)
}

/// Answers 0 after the last object.
pub fn next_object(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    let next = vm
        .memory
        .index_of(receiver)
        .and_then(|index| vm.memory.next_instance(index + 1, None))
        .unwrap_or(small(0));
    vm.succeed(argc, next)
}

pub fn clone(vm: &mut Interpreter, argc: usize) -> Result<bool, VmError> {
    let receiver = vm.receiver_of(argc)?;
    if receiver.is_small_int() {
        return vm.succeed(argc, receiver);
    }
    let copy = vm.memory.clone_object(receiver, &mut vm.state)?;
    vm.succeed(argc, copy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::Bootstrap;
    use crate::object::MethodHeader;
    use crate::primitives::test_support::{idle_vm, run_primitive};
    use crate::special::{POINT_X, TEMP_FRAME_START};

    #[test]
    fn selective_flush_drops_cached_at() {
        let mut boot = Bootstrap::new().expect("bootstrap");
        let array_class = boot.classes.array;
        // Array>>at: ^99
        let override_at = boot.method(
            MethodHeader::new(1, 0, 1, 0, false),
            &[small(99)],
            &[0x20, 0x7C],
        );
        boot.install_method(array_class, "at:", override_at);
        let selector = boot.intern("at:");
        // ^t at: 1
        let driver = boot.method(
            MethodHeader::new(0, 1, 0, 0, false),
            &[],
            &[0x10, 0x76, 0xC0, 0x7C],
        );
        let mut vm = boot.start(driver).expect("interpreter");

        assert!(run_primitive(&mut vm, 71, array_class, &[small(2)]));
        let array = vm.pop().expect("array");
        vm.memory
            .store(vm.state.home_context, TEMP_FRAME_START, array)
            .expect("temp");

        // a primitive at: that came from a send fills the cache
        vm.state.message_selector = selector;
        vm.state.lookup_class = array_class;
        assert!(run_primitive(&mut vm, 60, array, &[small(1)]));
        vm.pop().expect("element");
        let hash = vm.memory.hash_of(array);
        assert!(vm.state.at_cache.cached_entry(array, hash, false).is_some());

        assert!(run_primitive(&mut vm, 119, selector, &[]));
        vm.pop().expect("selector");
        assert!(vm.state.at_cache.cached_entry(array, hash, false).is_none());

        vm.run_for(5).expect("send at: and return");
        assert_eq!(vm.state.method, driver);
        assert_eq!(vm.top().expect("top"), small(99));
    }

    #[test]
    fn flush_by_method_drops_cached_at() {
        let mut vm = idle_vm();
        let array_class = vm.state.special.array_class;
        assert!(run_primitive(&mut vm, 71, array_class, &[small(1)]));
        let array = vm.pop().expect("array");
        let selectors = vm.state.special.special_selectors;
        vm.state.message_selector = vm.memory.fetch(selectors, 32).expect("at:");
        vm.state.lookup_class = array_class;
        assert!(run_primitive(&mut vm, 60, array, &[small(1)]));
        vm.pop().expect("element");

        let method = vm.state.method;
        assert!(run_primitive(&mut vm, 116, method, &[]));
        let hash = vm.memory.hash_of(array);
        assert!(vm.state.at_cache.cached_entry(array, hash, false).is_none());
    }

    #[test]
    fn identity_and_class() {
        let mut vm = idle_vm();
        let nil = vm.state.special.nil;
        assert!(run_primitive(&mut vm, 110, nil, &[nil]));
        assert_eq!(vm.top().expect("top"), vm.state.special.true_obj);
        assert!(run_primitive(&mut vm, 110, nil, &[small(1)]));
        assert_eq!(vm.top().expect("top"), vm.state.special.false_obj);
        assert!(run_primitive(&mut vm, 111, small(3), &[]));
        assert_eq!(vm.top().expect("top"), vm.state.special.small_integer_class);
    }

    #[test]
    fn become_swaps_references() {
        let mut vm = idle_vm();
        let a = vm.make_point(small(1), small(1)).expect("a");
        let b = vm.make_point(small(2), small(2)).expect("b");
        let holder = vm.make_point(a, b).expect("holder");
        let nil = vm.state.special.nil;
        let array_class = vm.state.special.array_class;
        let left = vm.memory.instantiate(array_class, 1, nil, &mut vm.state).expect("left");
        let right = vm.memory.instantiate(array_class, 1, nil, &mut vm.state).expect("right");
        vm.memory.store(left, 0, a).expect("store");
        vm.memory.store(right, 0, b).expect("store");
        vm.push(holder).expect("keep holder");

        assert!(run_primitive(&mut vm, 128, left, &[right]));
        assert_eq!(vm.memory.fetch(holder, POINT_X), Ok(b));

        // a repeated source is refused and nothing changes
        vm.memory.store(right, 0, b).expect("store");
        let twice = vm.memory.instantiate(array_class, 2, nil, &mut vm.state).expect("twice");
        vm.memory.store(twice, 0, b).expect("store");
        vm.memory.store(twice, 1, b).expect("store");
        let targets = vm.memory.instantiate(array_class, 2, nil, &mut vm.state).expect("targets");
        vm.memory.store(targets, 0, a).expect("store");
        vm.memory.store(targets, 1, holder).expect("store");
        assert!(!run_primitive(&mut vm, 248, twice, &[targets]));
        assert_eq!(vm.memory.fetch(holder, POINT_X), Ok(b));
    }

    #[test]
    fn timer_semaphore_is_armed_and_disarmed() {
        let mut vm = idle_vm();
        let nil = vm.state.special.nil;
        let semaphore = vm.make_point(small(0), small(0)).expect("stand-in");
        assert!(run_primitive(&mut vm, 136, nil, &[semaphore, small(500)]));
        assert_eq!(vm.timing.next_wakeup_tick, 500);
        assert_eq!(vm.special_object(THE_TIMER_SEMAPHORE).expect("timer"), semaphore);

        assert!(run_primitive(&mut vm, 136, nil, &[nil, small(900)]));
        assert_eq!(vm.timing.next_wakeup_tick, 0);
    }

    #[test]
    fn enumeration_and_clone() {
        let mut vm = idle_vm();
        let nil = vm.state.special.nil;
        assert!(run_primitive(&mut vm, 138, nil, &[]));
        let first = vm.top().expect("top");
        assert!(first.is_object());
        assert!(run_primitive(&mut vm, 139, first, &[]));
        assert_ne!(vm.top().expect("top"), first);

        let point = vm.make_point(small(5), small(6)).expect("point");
        assert!(run_primitive(&mut vm, 148, point, &[]));
        let copy = vm.top().expect("top");
        assert_ne!(copy, point);
        assert_eq!(vm.memory.fetch(copy, POINT_X), Ok(small(5)));
    }

    #[test]
    fn quit_stops_the_loop() {
        let mut vm = idle_vm();
        let nil = vm.state.special.nil;
        assert!(run_primitive(&mut vm, 113, nil, &[]));
        assert!(vm.has_quit());
        assert_eq!(vm.run_for(10).expect("run"), 0);
    }
}
