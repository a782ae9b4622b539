//! Per-family ICSP engines.
//!
//! Each engine owns a [`Link`](crate::link::Link) and reproduces its
//! family's vendor programming flow bit-for-bit: the program-mode entry key
//! sequence, the command codec, latch loading and the NVM controller
//! handshakes. The shared pipeline in [`crate::flashing`] drives engines
//! only through the [`Engine`] trait plus the constants in [`Geometry`].

use anyhow::Result;

use crate::memory::{ErasedPattern, MemoryImage};

pub use self::dspic33::Dspic33;
pub use self::pic16::Pic16;
pub use self::pic24::Pic24;

pub mod dspic33;
pub mod pic16;
pub mod pic24;

/// A named configuration/fuse word at a fixed address.
#[derive(Debug, Clone, Copy)]
pub struct ConfigWord {
    pub name: &'static str,
    pub addr: u32,
}

/// Family constants the pipeline is parameterized by.
#[derive(Debug, Clone, Copy)]
pub struct Geometry {
    /// Words fetched per read burst.
    pub read_burst: usize,
    /// Words staged per write-latch load.
    pub write_block: usize,
    pub erased: ErasedPattern,
    /// Mask applied to read-back and image words before comparison.
    pub word_mask: u16,
    /// Config words written (and verified) after code memory.
    pub config_words: &'static [ConfigWord],
    /// Config words only written after verification passed; programming
    /// these first could lock the part out of read-back.
    pub deferred_config_words: &'static [ConfigWord],
    /// Whether blank check also scans the config words.
    pub blank_check_config: bool,
}

/// One family's programming protocol.
pub trait Engine {
    fn geometry(&self) -> &'static Geometry;

    /// Drive the reset/key-shift entry sequence. Must be preceded by
    /// `exit_program_mode` (or a fresh power-up); calling it twice in a row
    /// mirrors an undefined hardware state.
    fn enter_program_mode(&mut self) -> Result<()>;
    /// Release the target: clock low, data low, reset line released.
    fn exit_program_mode(&mut self) -> Result<()>;

    /// Fetch the device id and silicon revision words.
    fn read_device_id(&mut self) -> Result<(u16, u16)>;

    /// Re-arm sequential reading (reset vector exit, pointer invalidation).
    fn begin_read(&mut self) -> Result<()>;
    /// Fill `out` with words starting at `addr`. `out.len()` is the
    /// family's read burst (or 1 for random access on the mid-range).
    fn read_block(&mut self, addr: u32, out: &mut [u16]) -> Result<()>;

    fn bulk_erase(&mut self) -> Result<()>;

    /// Family hook run between bulk erase and code programming; the
    /// dsPIC33 uses it to commit FBOOT and re-enter program mode.
    fn prepare_flash(&mut self, _image: &MemoryImage) -> Result<()> {
        Ok(())
    }

    /// Set up the write path (latch page registers etc.).
    fn begin_write(&mut self) -> Result<()>;
    /// Load the write latches with one block and run a program cycle.
    /// `words.len()` equals the geometry's write block.
    fn write_block(&mut self, addr: u32, words: &[u16]) -> Result<()>;
    /// Tear down the write path (clear write enables, settle delays).
    fn finish_write(&mut self) -> Result<()>;

    fn read_config_word(&mut self, addr: u32) -> Result<u16>;
    fn write_config_word(&mut self, addr: u32, value: u16) -> Result<()>;
}

/// Re-pack six raw 16-bit transfers into eight image words. The 24-bit
/// families interleave two instructions' upper bytes into one transfer:
///
/// ```text
/// r0 = lsw0        r1 = msb1:msb0   r2 = lsw1
/// r3 = lsw2        r4 = msb3:msb2   r5 = lsw3
/// ```
pub(crate) fn unpack_read_burst(raw: &[u16; 6]) -> [u16; 8] {
    [
        raw[0],
        raw[1] & 0x00FF,
        raw[2],
        (raw[1] & 0xFF00) >> 8,
        raw[3],
        raw[4] & 0x00FF,
        raw[5],
        (raw[4] & 0xFF00) >> 8,
    ]
}
