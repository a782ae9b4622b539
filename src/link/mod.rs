//! Abstract bit-level link to the target.
//!
//! The ICSP engines drive three lines: MCLR (reset), PGC (clock) and PGD
//! (bidirectional data). Everything above this trait is pure protocol; the
//! concrete implementation only has to flip pins and wait.

use anyhow::Result;

pub use self::gpio::{GpioLink, GpioLinkConfig};

pub mod gpio;

#[cfg(test)]
pub(crate) mod mock;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Pin {
    /// Reset line. Released (input) outside of a programming session.
    Mclr,
    /// PGC programming clock.
    Clock,
    /// PGD programming data, switched to input while the target drives it.
    Data,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Input,
    Output,
}

/// One GPIO-backed connection to a target.
///
/// Delays are protocol minimums; an implementation may wait longer but must
/// never shorten them.
pub trait Link {
    fn set_direction(&mut self, pin: Pin, dir: Direction) -> Result<()>;
    fn set_level(&mut self, pin: Pin, high: bool) -> Result<()>;
    fn read_level(&mut self, pin: Pin) -> Result<bool>;
    fn delay_us(&mut self, us: u32);
}
