pub mod bootstrap;
pub mod config;
pub mod context;
pub mod display;
pub mod error;
pub mod fusion;
pub mod image;
pub mod interpreter;
pub mod interrupts;
pub mod lookup;
pub mod memory;
pub mod object;
pub mod primitives;
pub mod scheduler;
pub mod special;
pub mod value;

pub use bootstrap::Bootstrap;
pub use config::VmConfig;
pub use display::{Display, FormBits, HeadlessDisplay, InputQueue, InputSnapshot};
pub use error::{BecomeError, ImageError, MemoryError, VmError};
pub use image::{LoadedImage, load_image, read_image};
pub use interpreter::{Interpreter, VmState};
pub use interrupts::InterruptState;
pub use lookup::MethodCache;
pub use memory::{NoRoots, ObjectMemory, RootProvider};
pub use object::{Body, ClassFormat, HeapObject, MethodHeader};
pub use primitives::{AtCache, PrimitiveTable};
pub use special::SpecialObjects;
pub use value::Value;
