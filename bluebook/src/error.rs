use std::io;

use thiserror::Error;

use crate::Value;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MemoryError {
    #[error("object table has reached its capacity of {capacity} slots")]
    TableFull { capacity: usize },
    #[error("{0:?} does not reference a live object")]
    InvalidReference(Value),
    #[error("{0:?} has no pointer fields")]
    NotPointers(Value),
    #[error("index {index} out of bounds for {object:?}")]
    IndexOutOfBounds { object: Value, index: usize },
    #[error("expected a SmallInteger, got {0:?}")]
    NotSmallInteger(Value),
    #[error("{0:?} is not a class")]
    NotAClass(Value),
}

/// Reasons a `become:` request is rejected. Raised before anything is mutated.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BecomeError {
    #[error("source and target arrays differ in length")]
    DifferentLengths,
    #[error("source array holds the non-object {0:?}")]
    NonObjectInSource(Value),
    #[error("{0:?} is repeated in the source array")]
    RepeatedInSource(Value),
    #[error("target array holds the non-object {0:?}")]
    NonObjectInTarget(Value),
    #[error("{0:?} is repeated in the target array")]
    RepeatedInTarget(Value),
    #[error("{0:?} appears in both source and target arrays")]
    Overlapping(Value),
}

#[derive(Debug, Error)]
pub enum ImageError {
    #[error("reading image: {0}")]
    Io(#[from] io::Error),
    #[error("bad image magic {0:#010x}")]
    BadMagic(u32),
    #[error("unexpected free block at offset {offset:#x}")]
    FreeBlock { offset: u32 },
    #[error("object at offset {offset:#x} with {words} words runs past the end of memory")]
    ObjectOverrun { offset: u32, words: u32 },
    #[error("unknown oop {oop:#x} referenced from the object at {offset:#x}")]
    UnknownOop { oop: u32, offset: u32 },
    #[error("image has no {0}")]
    MissingObject(&'static str),
    #[error(transparent)]
    Memory(#[from] MemoryError),
}

/// Fatal interpreter conditions. Recoverable primitive failures never
/// surface here; they fall back to a message send.
#[derive(Debug, Error)]
pub enum VmError {
    #[error("reserved bytecode {opcode} at pc {pc}")]
    ReservedOpcode { opcode: u8, pc: usize },
    #[error("cannot return to {0:?}: context is dead or missing")]
    CannotReturn(Value),
    #[error("sender chain broken before reaching {target:?}")]
    BrokenSenderChain { target: Value },
    #[error("recursive doesNotUnderstand: for selector {selector}")]
    RecursiveDoesNotUnderstand { selector: String },
    #[error("{0:?} is not a compiled method")]
    NotAMethod(Value),
    #[error("pc {pc} runs past the end of the method")]
    PcOutOfRange { pc: usize },
    #[error("no active process to resume")]
    NoRunnableProcess,
    #[error("invalid configuration: {0}")]
    Config(&'static str),
    #[error(transparent)]
    Memory(#[from] MemoryError),
    #[error(transparent)]
    Image(#[from] ImageError),
}
