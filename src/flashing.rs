//! Programming pipeline.
//!
//! Family-independent orchestration: identify, blank check, erase, write,
//! verify, config dump and device read-back. Everything protocol-specific
//! is reached through [`Engine`] and its [`Geometry`] constants, so the
//! pipeline is written once and tested against a simulated target.

use std::path::Path;

use anyhow::Result;

use crate::device::{Chip, ChipDB, Family};
use crate::error::Error;
use crate::format;
use crate::memory::MemoryImage;
use crate::protocol::{ConfigWord, Engine};

/// Sink for coarse progress events, 0 to 100 percent.
pub trait Progress {
    fn percent(&mut self, pct: u8);
}

/// Discards progress events.
pub struct NullProgress;

impl Progress for NullProgress {
    fn percent(&mut self, _pct: u8) {}
}

/// Monotonic percent emitter over a fixed number of work units. Always
/// starts at 0 and, via `finish`, always ends at 100.
struct Ticker<'a> {
    sink: &'a mut dyn Progress,
    total: usize,
    done: usize,
    last: u8,
}

impl<'a> Ticker<'a> {
    fn new(sink: &'a mut dyn Progress, total: usize) -> Self {
        sink.percent(0);
        Ticker {
            sink,
            total,
            done: 0,
            last: 0,
        }
    }

    fn step(&mut self) {
        self.done += 1;
        let pct = if self.total == 0 {
            100
        } else {
            (self.done * 100 / self.total).min(100) as u8
        };
        if pct > self.last {
            self.last = pct;
            self.sink.percent(pct);
        }
    }

    fn finish(&mut self) {
        if self.last < 100 {
            self.last = 100;
            self.sink.percent(100);
        }
    }
}

pub struct Flashing<E: Engine> {
    pub(crate) engine: E,
    chip: Chip,
    /// Silicon revision word, families that expose one.
    revision: u16,
}

impl<E: Engine> Flashing<E> {
    /// Enter program mode, identify the target and resolve it against the
    /// device registry. On an unknown id the target is released again.
    pub fn open(mut engine: E, family: Family) -> Result<Self> {
        engine.enter_program_mode()?;
        let (device_id, revision) = engine.read_device_id()?;
        log::debug!(
            "device id 0x{:04x}, revision 0x{:04x}",
            device_id,
            revision
        );

        let chip = match ChipDB::find_chip(family, device_id) {
            Ok(chip) => chip,
            Err(err) => {
                let _ = engine.exit_program_mode();
                return Err(err);
            }
        };
        log::info!("found chip: {}", chip);

        Ok(Flashing {
            engine,
            chip,
            revision,
        })
    }

    /// Release the target from program mode.
    pub fn close(mut self) -> Result<()> {
        self.engine.exit_program_mode()
    }

    pub fn chip(&self) -> &Chip {
        &self.chip
    }

    pub fn dump_info(&self) -> Result<()> {
        log::info!(
            "chip: {} ({} words of code memory)",
            self.chip,
            self.chip.code_memory_size
        );
        log::info!("silicon revision: 0x{:04x}", self.revision);
        Ok(())
    }

    /// Scan code memory (and, where the family keeps its fuses in otherwise
    /// unreadable space, the config words) against the erased pattern.
    pub fn blank_check(&mut self, progress: &mut dyn Progress) -> Result<bool> {
        let geometry = self.engine.geometry();
        let burst = geometry.read_burst as u32;
        let mask = geometry.word_mask;

        let total = self.chip.code_memory_size.div_ceil(burst) as usize;
        let mut ticker = Ticker::new(progress, total);

        self.engine.begin_read()?;
        let mut buf = vec![0u16; geometry.read_burst];
        let mut addr = 0;
        while addr < self.chip.code_memory_size {
            self.engine.read_block(addr, &mut buf)?;
            for (i, &word) in buf.iter().enumerate() {
                let a = addr + i as u32;
                // the last burst can overrun the end of code memory
                if a >= self.chip.code_memory_size {
                    break;
                }
                let erased = geometry.erased.value(a) & mask;
                if word & mask != erased {
                    log::debug!("0x{:06x} reads 0x{:04x}, not blank", a, word);
                    return Ok(false);
                }
            }
            ticker.step();
            addr += burst;
        }

        if geometry.blank_check_config {
            for cw in config_words(geometry.config_words, geometry.deferred_config_words) {
                let value = self.engine.read_config_word(cw.addr)? & mask;
                if value != geometry.erased.value(cw.addr) & mask {
                    log::debug!("{} reads 0x{:04x}, not blank", cw.name, value);
                    return Ok(false);
                }
            }
        }

        ticker.finish();
        Ok(true)
    }

    pub fn erase(&mut self) -> Result<()> {
        self.engine.bulk_erase()?;
        log::info!("chip erased");
        Ok(())
    }

    /// Erase the chip and program every filled location of `image`:
    /// code memory block by block, then the regular config words. Blocks
    /// with no filled location are skipped entirely; partially filled
    /// blocks are padded with the erased pattern.
    pub fn write_image(&mut self, image: &MemoryImage, progress: &mut dyn Progress) -> Result<()> {
        if image.filled_count() == 0 {
            return Err(Error::EmptySource.into());
        }

        let geometry = self.engine.geometry();
        let block = geometry.write_block as u32;

        let blocks: Vec<u32> = (0..self.chip.code_memory_size)
            .step_by(geometry.write_block)
            .filter(|&addr| image.any_filled(addr, block))
            .collect();
        let config: Vec<&ConfigWord> = geometry
            .config_words
            .iter()
            .filter(|cw| image.filled(cw.addr))
            .collect();

        self.engine.bulk_erase()?;
        self.engine.prepare_flash(image)?;

        let mut ticker = Ticker::new(progress, blocks.len() + config.len());

        log::debug!("programming {} blocks of code memory", blocks.len());
        self.engine.begin_write()?;
        let mut buf = vec![0u16; geometry.write_block];
        for &addr in &blocks {
            for (i, slot) in buf.iter_mut().enumerate() {
                *slot = image.word(addr + i as u32);
            }
            self.engine.write_block(addr, &buf)?;
            ticker.step();
        }
        self.engine.finish_write()?;

        if !config.is_empty() {
            self.engine.begin_write()?;
            for cw in &config {
                log::debug!("programming {} at 0x{:06x}", cw.name, cw.addr);
                self.engine.write_config_word(cw.addr, image.word(cw.addr))?;
                ticker.step();
            }
            self.engine.finish_write()?;
        }

        ticker.finish();
        Ok(())
    }

    /// Read back every filled location and compare against `image`, both
    /// sides masked to the family's implemented word width. Fails on the
    /// first mismatch.
    pub fn verify_image(&mut self, image: &MemoryImage, progress: &mut dyn Progress) -> Result<()> {
        let geometry = self.engine.geometry();
        let burst = geometry.read_burst as u32;
        let mask = geometry.word_mask;

        let blocks: Vec<u32> = (0..self.chip.code_memory_size)
            .step_by(geometry.read_burst)
            .filter(|&addr| image.any_filled(addr, burst))
            .collect();
        let mut ticker = Ticker::new(progress, blocks.len());

        self.engine.begin_read()?;
        let mut buf = vec![0u16; geometry.read_burst];
        for &base in &blocks {
            self.engine.read_block(base, &mut buf)?;
            for (i, &actual) in buf.iter().enumerate() {
                let addr = base + i as u32;
                if addr >= self.chip.code_memory_size {
                    break;
                }
                if !image.filled(addr) {
                    continue;
                }
                let expected = image.word(addr) & mask;
                if actual & mask != expected {
                    return Err(Error::VerifyMismatch {
                        addr,
                        expected,
                        actual: actual & mask,
                    }
                    .into());
                }
            }
            ticker.step();
        }

        for cw in geometry.config_words {
            if !image.filled(cw.addr) {
                continue;
            }
            let actual = self.engine.read_config_word(cw.addr)? & mask;
            let expected = image.word(cw.addr) & mask;
            if actual != expected {
                return Err(Error::ConfigMismatch {
                    addr: cw.addr,
                    expected,
                    actual,
                }
                .into());
            }
        }

        ticker.finish();
        Ok(())
    }

    /// Program the deferred config words (code protection and friends).
    /// Runs after verification so the array is still readable during it.
    pub fn finalize(&mut self, image: &MemoryImage) -> Result<()> {
        let geometry = self.engine.geometry();
        let deferred: Vec<&ConfigWord> = geometry
            .deferred_config_words
            .iter()
            .filter(|cw| image.filled(cw.addr))
            .collect();
        if deferred.is_empty() {
            return Ok(());
        }

        self.engine.begin_write()?;
        for cw in deferred {
            log::info!("programming {} at 0x{:06x}", cw.name, cw.addr);
            self.engine.write_config_word(cw.addr, image.word(cw.addr))?;
        }
        self.engine.finish_write()
    }

    pub fn flash_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        verify: bool,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let image = format::read_hex_file(path, self.engine.geometry().erased)?;
        self.write_image(&image, progress)?;
        if verify {
            self.verify_image(&image, progress)?;
        }
        self.finalize(&image)?;
        log::info!("flash done");
        Ok(())
    }

    pub fn verify_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let image = format::read_hex_file(path, self.engine.geometry().erased)?;
        if image.filled_count() == 0 {
            return Err(Error::EmptySource.into());
        }
        self.verify_image(&image, progress)?;
        log::info!("verify passed");
        Ok(())
    }

    /// Read code memory and the config words into a sparse image; only
    /// locations that differ from the erased pattern are recorded.
    pub fn read_image(&mut self, progress: &mut dyn Progress) -> Result<MemoryImage> {
        let geometry = self.engine.geometry();
        let burst = geometry.read_burst as u32;
        let mask = geometry.word_mask;
        let mut image = MemoryImage::new(geometry.erased);

        let total = self.chip.code_memory_size.div_ceil(burst) as usize;
        let mut ticker = Ticker::new(progress, total);

        self.engine.begin_read()?;
        let mut buf = vec![0u16; geometry.read_burst];
        let mut addr = 0;
        while addr < self.chip.code_memory_size {
            self.engine.read_block(addr, &mut buf)?;
            for (i, &word) in buf.iter().enumerate() {
                let a = addr + i as u32;
                // the last burst can overrun the end of code memory
                if a >= self.chip.code_memory_size {
                    break;
                }
                if word & mask != geometry.erased.value(a) & mask {
                    image.set(a, word & mask);
                }
            }
            ticker.step();
            addr += burst;
        }

        for cw in config_words(geometry.config_words, geometry.deferred_config_words) {
            let value = self.engine.read_config_word(cw.addr)? & mask;
            if value != geometry.erased.value(cw.addr) & mask {
                image.set(cw.addr, value);
            }
        }

        ticker.finish();
        Ok(image)
    }

    pub fn read_to_file<P: AsRef<Path>>(
        &mut self,
        path: P,
        progress: &mut dyn Progress,
    ) -> Result<()> {
        let image = self.read_image(progress)?;
        format::write_hex_file(&image, path)
    }

    /// Print the configuration registers without touching anything.
    pub fn dump_config(&mut self) -> Result<()> {
        let geometry = self.engine.geometry();
        log::info!("configuration registers:");
        self.engine.begin_read()?;
        for cw in config_words(geometry.config_words, geometry.deferred_config_words) {
            let value = self.engine.read_config_word(cw.addr)?;
            log::info!(" - {}: 0x{:04x}", cw.name, value);
        }
        Ok(())
    }
}

fn config_words<'a>(
    regular: &'a [ConfigWord],
    deferred: &'a [ConfigWord],
) -> impl Iterator<Item = &'a ConfigWord> {
    regular.iter().chain(deferred.iter())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::mock::Pic16Target;
    use crate::memory::ErasedPattern;
    use crate::protocol::{Geometry, Pic16};

    struct Collect(Vec<u8>);

    impl Progress for Collect {
        fn percent(&mut self, pct: u8) {
            self.0.push(pct);
        }
    }

    fn open_target() -> Flashing<Pic16<Pic16Target>> {
        Flashing::open(Pic16::new(Pic16Target::new(0x30A4)), Family::Pic16).unwrap()
    }

    fn test_image() -> MemoryImage {
        let mut image = MemoryImage::new(ErasedPattern::Word14);
        for i in 0..64u32 {
            image.set(i, (0x0123 + i * 7) as u16 & 0x3FFF);
        }
        image.set(0x8007, 0x2F84);
        image
    }

    #[test]
    fn open_identifies_chip() {
        let flashing = open_target();
        assert_eq!(flashing.chip().name, "PIC16F18326");
        flashing.close().unwrap();
    }

    #[test]
    fn unknown_device_aborts_session() {
        let Err(err) = Flashing::open(Pic16::new(Pic16Target::new(0x1234)), Family::Pic16)
        else {
            panic!("unlisted device id must not open a session");
        };
        match err.downcast_ref::<Error>() {
            Some(Error::UnknownDevice { device_id }) => assert_eq!(*device_id, 0x1234),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn erase_makes_a_dirty_chip_blank() {
        let mut flashing = open_target();
        flashing.engine.link.corrupt(0x0010, 0x0000);
        assert!(!flashing.blank_check(&mut NullProgress).unwrap());

        flashing.erase().unwrap();
        assert!(flashing.blank_check(&mut NullProgress).unwrap());
    }

    #[test]
    fn write_then_verify_round_trips() {
        let mut flashing = open_target();
        let image = test_image();

        flashing.write_image(&image, &mut NullProgress).unwrap();
        flashing.verify_image(&image, &mut NullProgress).unwrap();

        assert_eq!(flashing.engine.link.flash_word(5), image.word(5));
        assert_eq!(flashing.engine.link.flash_word(0x8007), 0x2F84);
        // unfilled location beyond the written blocks stays erased
        assert_eq!(flashing.engine.link.flash_word(0x100), 0x3FFF);
    }

    #[test]
    fn verify_mismatch_carries_address_and_values() {
        let mut flashing = open_target();
        let image = test_image();
        flashing.write_image(&image, &mut NullProgress).unwrap();

        flashing.engine.link.corrupt(0x0005, 0x0AAA);
        let err = flashing
            .verify_image(&image, &mut NullProgress)
            .unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::VerifyMismatch {
                addr,
                expected,
                actual,
            }) => {
                assert_eq!(*addr, 0x0005);
                assert_eq!(*expected, image.word(5));
                assert_eq!(*actual, 0x0AAA);
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn empty_image_never_touches_the_chip() {
        let mut flashing = open_target();
        let image = MemoryImage::new(ErasedPattern::Word14);

        let err = flashing.write_image(&image, &mut NullProgress).unwrap_err();
        match err.downcast_ref::<Error>() {
            Some(Error::EmptySource) => {}
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(flashing.engine.link.erase_count, 0);
    }

    static WIDE: Geometry = Geometry {
        read_burst: 8,
        write_block: 4,
        erased: ErasedPattern::Wide24,
        word_mask: 0xFFFF,
        config_words: &[],
        deferred_config_words: &[],
        blank_check_config: false,
    };

    /// Burst-read engine whose code memory ends mid-burst; addresses past
    /// the end read back as junk, like real unimplemented array space.
    struct ShortTailChip {
        code_end: u32,
        patch: Option<(u32, u16)>,
    }

    impl Engine for ShortTailChip {
        fn geometry(&self) -> &'static Geometry {
            &WIDE
        }

        fn enter_program_mode(&mut self) -> Result<()> {
            Ok(())
        }

        fn exit_program_mode(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_device_id(&mut self) -> Result<(u16, u16)> {
            Ok((0x4C02, 0))
        }

        fn begin_read(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_block(&mut self, addr: u32, out: &mut [u16]) -> Result<()> {
            for (i, slot) in out.iter_mut().enumerate() {
                let a = addr + i as u32;
                *slot = match self.patch {
                    Some((pa, pv)) if pa == a => pv,
                    _ if a >= self.code_end => 0x0000,
                    _ => ErasedPattern::Wide24.value(a),
                };
            }
            Ok(())
        }

        fn bulk_erase(&mut self) -> Result<()> {
            Ok(())
        }

        fn begin_write(&mut self) -> Result<()> {
            Ok(())
        }

        fn write_block(&mut self, _addr: u32, _words: &[u16]) -> Result<()> {
            Ok(())
        }

        fn finish_write(&mut self) -> Result<()> {
            Ok(())
        }

        fn read_config_word(&mut self, _addr: u32) -> Result<u16> {
            Ok(0xFFFF)
        }

        fn write_config_word(&mut self, _addr: u32, _value: u16) -> Result<()> {
            Ok(())
        }
    }

    fn open_short_tail(patch: Option<(u32, u16)>) -> Flashing<ShortTailChip> {
        let engine = ShortTailChip {
            code_end: 0x2BFE,
            patch,
        };
        let flashing = Flashing::open(engine, Family::Dspic33).unwrap();
        // 0x2BFE is not a multiple of the 8-word burst, so the final read
        // runs past the end of code memory
        assert_eq!(flashing.chip().code_memory_size % 8, 6);
        flashing
    }

    #[test]
    fn blank_check_ignores_words_past_code_memory() {
        let mut flashing = open_short_tail(None);
        assert!(flashing.blank_check(&mut NullProgress).unwrap());
    }

    #[test]
    fn read_image_stops_at_code_memory_end() {
        let mut flashing = open_short_tail(Some((0x0010, 0x1234)));
        let image = flashing.read_image(&mut NullProgress).unwrap();

        assert_eq!(image.word(0x0010), 0x1234);
        // nothing recorded from the junk tail of the last burst
        assert_eq!(image.filled_count(), 1);
    }

    #[test]
    fn progress_is_monotonic_and_ends_at_100() {
        let mut flashing = open_target();
        let mut progress = Collect(Vec::new());
        flashing.write_image(&test_image(), &mut progress).unwrap();

        assert_eq!(progress.0.first(), Some(&0));
        assert_eq!(progress.0.last(), Some(&100));
        assert!(progress.0.windows(2).all(|w| w[0] <= w[1]));
    }
}
