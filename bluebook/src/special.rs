//! Special objects array layout and well-known field offsets.

use crate::{MemoryError, ObjectMemory, Value};

// ── Special objects array indices ────────────────────────────────────

pub const NIL: usize = 0;
pub const FALSE: usize = 1;
pub const TRUE: usize = 2;
pub const SCHEDULER_ASSOCIATION: usize = 3;
pub const CLASS_BITMAP: usize = 4;
pub const CLASS_SMALL_INTEGER: usize = 5;
pub const CLASS_STRING: usize = 6;
pub const CLASS_ARRAY: usize = 7;
pub const CLASS_FLOAT: usize = 9;
pub const CLASS_METHOD_CONTEXT: usize = 10;
pub const CLASS_BLOCK_CONTEXT: usize = 11;
pub const CLASS_POINT: usize = 12;
pub const CLASS_LARGE_POSITIVE_INTEGER: usize = 13;
pub const THE_DISPLAY: usize = 14;
pub const CLASS_MESSAGE: usize = 15;
pub const CLASS_COMPILED_METHOD: usize = 16;
pub const THE_LOW_SPACE_SEMAPHORE: usize = 17;
pub const CLASS_SEMAPHORE: usize = 18;
pub const CLASS_CHARACTER: usize = 19;
pub const SELECTOR_DOES_NOT_UNDERSTAND: usize = 20;
pub const SELECTOR_CANNOT_RETURN: usize = 21;
pub const THE_INPUT_SEMAPHORE: usize = 22;
pub const SPECIAL_SELECTORS: usize = 23;
pub const CHARACTER_TABLE: usize = 24;
pub const SELECTOR_MUST_BE_BOOLEAN: usize = 25;
pub const CLASS_BYTE_ARRAY: usize = 26;
pub const CLASS_PROCESS: usize = 27;
pub const COMPACT_CLASSES: usize = 28;
pub const THE_TIMER_SEMAPHORE: usize = 29;
pub const THE_INTERRUPT_SEMAPHORE: usize = 30;

/// Minimum length of a usable special objects array.
pub const SPECIAL_OBJECTS_SIZE: usize = 31;

// ── Field offsets ────────────────────────────────────────────────────

pub const CLASS_SUPERCLASS: usize = 0;
pub const CLASS_METHOD_DICTIONARY: usize = 1;
pub const CLASS_FORMAT: usize = 2;
pub const CLASS_NAME: usize = 6;

pub const METHOD_DICT_TALLY: usize = 0;
pub const METHOD_DICT_ARRAY: usize = 1;
pub const METHOD_DICT_SELECTOR_START: usize = 2;

pub const MESSAGE_SELECTOR: usize = 0;
pub const MESSAGE_ARGUMENTS: usize = 1;
pub const MESSAGE_LOOKUP_CLASS: usize = 2;

pub const ASSOCIATION_KEY: usize = 0;
pub const ASSOCIATION_VALUE: usize = 1;

pub const POINT_X: usize = 0;
pub const POINT_Y: usize = 1;

pub const SCHEDULER_PROCESS_LISTS: usize = 0;
pub const SCHEDULER_ACTIVE_PROCESS: usize = 1;

pub const LINK_NEXT: usize = 0;
pub const PROCESS_SUSPENDED_CONTEXT: usize = 1;
pub const PROCESS_PRIORITY: usize = 2;
pub const PROCESS_MY_LIST: usize = 3;

pub const LIST_FIRST: usize = 0;
pub const LIST_LAST: usize = 1;

pub const SEMAPHORE_EXCESS_SIGNALS: usize = 2;

pub const CHARACTER_VALUE: usize = 0;

pub const FORM_BITS: usize = 0;
pub const FORM_WIDTH: usize = 1;
pub const FORM_HEIGHT: usize = 2;
pub const FORM_DEPTH: usize = 3;

// ── Context layout ───────────────────────────────────────────────────

pub const CONTEXT_SENDER: usize = 0;
pub const CONTEXT_PC: usize = 1;
pub const CONTEXT_SP: usize = 2;
pub const CONTEXT_METHOD: usize = 3;
pub const CONTEXT_RECEIVER: usize = 5;
pub const BLOCK_CALLER: usize = 0;
pub const BLOCK_ARG_COUNT: usize = 3;
pub const BLOCK_INITIAL_PC: usize = 4;
pub const BLOCK_HOME: usize = 5;
/// First temporary / stack slot.
pub const TEMP_FRAME_START: usize = 6;

/// Resolved handles to the objects the interpreter touches on every send.
///
/// The special objects array itself stays the source of truth; this struct
/// caches the hot entries and is refreshed with [`SpecialObjects::resolve`]
/// whenever the array changes.
#[derive(Debug, Clone, Copy)]
pub struct SpecialObjects {
    /// The special objects array.
    pub array: Value,

    pub nil: Value,
    pub false_obj: Value,
    pub true_obj: Value,

    pub small_integer_class: Value,
    pub float_class: Value,
    pub method_context_class: Value,
    pub block_context_class: Value,
    pub point_class: Value,
    pub large_positive_integer_class: Value,
    pub array_class: Value,
    pub message_class: Value,
    pub character_class: Value,

    /// Flat array of (selector, argument count) pairs for bytecodes 176..207.
    pub special_selectors: Value,
    pub character_table: Value,
}

impl SpecialObjects {
    pub fn resolve(memory: &ObjectMemory, array: Value) -> Result<Self, MemoryError> {
        let at = |index: usize| memory.fetch(array, index);
        Ok(Self {
            array,
            nil: at(NIL)?,
            false_obj: at(FALSE)?,
            true_obj: at(TRUE)?,
            small_integer_class: at(CLASS_SMALL_INTEGER)?,
            float_class: at(CLASS_FLOAT)?,
            method_context_class: at(CLASS_METHOD_CONTEXT)?,
            block_context_class: at(CLASS_BLOCK_CONTEXT)?,
            point_class: at(CLASS_POINT)?,
            large_positive_integer_class: at(CLASS_LARGE_POSITIVE_INTEGER)?,
            array_class: at(CLASS_ARRAY)?,
            message_class: at(CLASS_MESSAGE)?,
            character_class: at(CLASS_CHARACTER)?,
            special_selectors: at(SPECIAL_SELECTORS)?,
            character_table: at(CHARACTER_TABLE)?,
        })
    }

    pub fn boolean(&self, value: bool) -> Value {
        if value { self.true_obj } else { self.false_obj }
    }

    pub fn visit(&mut self, visitor: &mut dyn FnMut(&mut Value)) {
        visitor(&mut self.array);
        visitor(&mut self.nil);
        visitor(&mut self.false_obj);
        visitor(&mut self.true_obj);
        visitor(&mut self.small_integer_class);
        visitor(&mut self.float_class);
        visitor(&mut self.method_context_class);
        visitor(&mut self.block_context_class);
        visitor(&mut self.point_class);
        visitor(&mut self.large_positive_integer_class);
        visitor(&mut self.array_class);
        visitor(&mut self.message_class);
        visitor(&mut self.character_class);
        visitor(&mut self.special_selectors);
        visitor(&mut self.character_table);
    }
}
