//! GPIO bit-bang ICSP programmer for PIC microcontrollers.

pub mod constants;
pub mod device;
pub mod error;
pub mod flashing;
pub mod format;
pub mod link;
pub mod memory;
pub mod protocol;

pub use self::device::{Chip, Family};
pub use self::flashing::{Flashing, NullProgress, Progress};
pub use self::link::{GpioLink, GpioLinkConfig, Link};
pub use self::memory::MemoryImage;
pub use self::protocol::Engine;
