//! Contracts with the host's display and input devices.
//!
//! The interpreter owns a [`Display`] and shares an [`InputQueue`] with
//! whatever thread delivers events. Event threads only touch the queue; the
//! display is driven from the interpreter thread.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use log::trace;
use parking_lot::{Condvar, Mutex};

pub const SHIFT_KEY: u32 = 8;
pub const CONTROL_KEY: u32 = 16;
pub const COMMAND_KEY: u32 = 64;

pub const RED_BUTTON: u32 = 4;
pub const YELLOW_BUTTON: u32 = 2;
pub const BLUE_BUTTON: u32 = 1;

/// cmd-`.`
pub const INTERRUPT_KEYCODE: u32 = 2094;

/// Bitmap of the Form registered with `beDisplay`.
#[derive(Debug, Clone, Copy)]
pub struct FormBits<'a> {
    pub bits: &'a [u32],
    pub width: usize,
    pub height: usize,
    pub depth: usize,
}

pub trait Display {
    fn update(&mut self, form: &FormBits<'_>);

    /// 16x16 one-bit cursor. `mask` is absent for plain cursors.
    fn set_cursor(&mut self, bits: &[u32], mask: Option<&[u32]>);

    fn extent(&self) -> (u32, u32);

    /// Called at every input poll so hosts without their own event thread
    /// can feed the queue.
    fn process_events(&mut self, _input: &InputQueue) {}
}

/// Display that draws nothing.
#[derive(Debug)]
pub struct HeadlessDisplay {
    width: u32,
    height: u32,
    pub frames: u64,
}

impl HeadlessDisplay {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frames: 0,
        }
    }
}

impl Default for HeadlessDisplay {
    fn default() -> Self {
        Self::new(640, 480)
    }
}

impl Display for HeadlessDisplay {
    fn update(&mut self, form: &FormBits<'_>) {
        self.frames += 1;
        trace!(
            "display update {}x{}x{} ({} words)",
            form.width,
            form.height,
            form.depth,
            form.bits.len()
        );
    }

    fn set_cursor(&mut self, bits: &[u32], mask: Option<&[u32]>) {
        trace!("cursor {} words, mask {}", bits.len(), mask.is_some());
    }

    fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

/// Mouse and modifier state as one consistent copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputSnapshot {
    pub mouse_x: i32,
    pub mouse_y: i32,
    pub buttons: u32,
    pub modifiers: u32,
}

#[derive(Debug)]
struct InputState {
    snapshot: InputSnapshot,
    keys: VecDeque<u32>,
    pending: bool,
}

/// Input shared between the event thread and the interpreter.
#[derive(Debug)]
pub struct InputQueue {
    state: Mutex<InputState>,
    event: Condvar,
    interrupt: AtomicBool,
    typeahead_limit: usize,
}

impl InputQueue {
    pub fn new(typeahead_limit: usize) -> Self {
        Self {
            state: Mutex::new(InputState {
                snapshot: InputSnapshot::default(),
                keys: VecDeque::with_capacity(typeahead_limit),
                pending: false,
            }),
            event: Condvar::new(),
            interrupt: AtomicBool::new(false),
            typeahead_limit,
        }
    }

    fn wake(&self, state: &mut InputState) {
        state.pending = true;
        self.event.notify_one();
    }

    pub fn mouse_moved(&self, x: i32, y: i32) {
        let mut state = self.state.lock();
        state.snapshot.mouse_x = x;
        state.snapshot.mouse_y = y;
        self.wake(&mut state);
    }

    pub fn set_buttons(&self, buttons: u32) {
        let mut state = self.state.lock();
        state.snapshot.buttons = buttons & (RED_BUTTON | YELLOW_BUTTON | BLUE_BUTTON);
        self.wake(&mut state);
    }

    pub fn set_modifiers(&self, modifiers: u32) {
        let mut state = self.state.lock();
        state.snapshot.modifiers = modifiers;
        self.wake(&mut state);
    }

    /// Queues a key stroke with the current modifiers folded into its upper
    /// byte. Strokes beyond the typeahead limit are dropped.
    pub fn key_pressed(&self, character: u32) {
        let mut state = self.state.lock();
        let keycode = (character & 0xFF) | ((state.snapshot.modifiers >> 3) << 8);
        if keycode == INTERRUPT_KEYCODE {
            self.interrupt.store(true, Ordering::Release);
        } else if state.keys.len() < self.typeahead_limit {
            state.keys.push_back(keycode);
        } else {
            trace!("typeahead full, dropping {keycode}");
        }
        self.wake(&mut state);
    }

    pub fn snapshot(&self) -> InputSnapshot {
        self.state.lock().snapshot
    }

    pub fn keyboard_peek(&self) -> Option<u32> {
        self.state.lock().keys.front().copied()
    }

    pub fn keyboard_next(&self) -> Option<u32> {
        self.state.lock().keys.pop_front()
    }

    /// Reads and clears the interrupt-key flag.
    pub fn take_interrupt(&self) -> bool {
        self.interrupt.swap(false, Ordering::AcqRel)
    }

    /// Blocks until an event arrives or `timeout` passes. Answers whether an
    /// event was seen.
    pub fn wait_for_event(&self, timeout: Duration) -> bool {
        let mut state = self.state.lock();
        if !state.pending {
            self.event.wait_for(&mut state, timeout);
        }
        std::mem::replace(&mut state.pending, false)
    }
}
