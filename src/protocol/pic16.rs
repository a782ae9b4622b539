//! Enhanced mid-range engine (PIC16F183xx).
//!
//! Low-voltage ICSP: 6-bit commands and 14-bit data words, all shifted LSB
//! first. Programming is row-based through 32 write latches; program and
//! erase cycles are internally timed, so completion is a fixed wait rather
//! than an NVM status poll.

use anyhow::Result;

use super::{ConfigWord, Engine, Geometry};
use crate::constants::{commands, ENTER_PROGRAM_KEY_LV};
use crate::link::{Direction, Link, Pin};
use crate::memory::ErasedPattern;

/* delays (in microseconds) */
const DELAY_SETUP: u32 = 1;
const DELAY_HOLD: u32 = 1;
const DELAY_TENTS: u32 = 1;
const DELAY_TENTH: u32 = 250;
const DELAY_TCKH: u32 = 1;
const DELAY_TCKL: u32 = 1;
const DELAY_TCO: u32 = 1;
const DELAY_TDLY: u32 = 1;
const DELAY_TERAB: u32 = 5000;
const DELAY_TPINT_DATA: u32 = 2500;
const DELAY_TPINT_CONF: u32 = 5000;

static GEOMETRY: Geometry = Geometry {
    read_burst: 1,
    write_block: 32,
    erased: ErasedPattern::Word14,
    word_mask: 0x3FFF,
    config_words: &[
        ConfigWord { name: "CONFIG1", addr: 0x8007 },
        ConfigWord { name: "CONFIG2", addr: 0x8008 },
        ConfigWord { name: "CONFIG3", addr: 0x8009 },
    ],
    // code protection: programmed last so verification still sees the array
    deferred_config_words: &[ConfigWord { name: "CONFIG4", addr: 0x800A }],
    blank_check_config: true,
};

pub struct Pic16<L: Link> {
    pub(crate) link: L,
    /// Target program counter, when known. Sequential commands advance it;
    /// `None` forces an explicit PC load before the next access.
    pc: Option<u32>,
}

impl<L: Link> Pic16<L> {
    pub fn new(link: L) -> Self {
        Pic16 { link, pc: None }
    }

    /// Shift out a 6-bit command, LSB first, then hold for `delay`.
    fn send_cmd(&mut self, cmd: u8, delay: u32) -> Result<()> {
        for i in 0..6 {
            self.link.set_level(Pin::Clock, true)?;
            self.link.set_level(Pin::Data, (cmd >> i) & 0x01 != 0)?;
            self.link.delay_us(DELAY_TCKH);
            self.link.set_level(Pin::Clock, false)?;
            self.link.delay_us(DELAY_TCKL);
        }
        self.link.set_level(Pin::Data, false)?;
        self.link.delay_us(delay);
        Ok(())
    }

    /// Clock in a 16-bit read: start bit, 14 data bits, stop bit.
    fn read_data(&mut self) -> Result<u16> {
        self.link.set_direction(Pin::Data, Direction::Input)?;

        let mut data: u32 = 0;
        for i in 0..16 {
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_TCKH);
            self.link.delay_us(DELAY_TCO);
            data |= (self.link.read_level(Pin::Data)? as u32) << i;
            self.link.set_level(Pin::Clock, false)?;
            self.link.delay_us(DELAY_TCKL);
        }

        self.link.set_direction(Pin::Data, Direction::Output)?;
        Ok((data >> 1) as u16)
    }

    /// Shift out a 16-bit payload framed by start/stop bits.
    fn write_data(&mut self, data: u16) -> Result<()> {
        let framed = (data as u32) << 1;
        for i in 0..16 {
            self.link.set_level(Pin::Clock, true)?;
            self.link.set_level(Pin::Data, (framed >> i) & 0x01 != 0)?;
            self.link.delay_us(DELAY_SETUP);
            self.link.set_level(Pin::Clock, false)?;
            self.link.delay_us(DELAY_HOLD);
        }
        self.link.set_level(Pin::Data, false)?;
        Ok(())
    }

    /// Load the target PC with a 24-bit address.
    fn set_address(&mut self, addr: u32) -> Result<()> {
        self.send_cmd(commands::LOAD_PC_ADDR, DELAY_TDLY)?;

        let framed = addr << 1;
        for i in 0..24 {
            self.link.set_level(Pin::Clock, true)?;
            self.link.set_level(Pin::Data, (framed >> i) & 0x01 != 0)?;
            self.link.delay_us(DELAY_SETUP);
            self.link.set_level(Pin::Clock, false)?;
            self.link.delay_us(DELAY_HOLD);
        }
        self.link.set_level(Pin::Data, false)?;
        self.link.delay_us(10);

        self.pc = Some(addr);
        Ok(())
    }

    fn goto_address(&mut self, addr: u32) -> Result<()> {
        if self.pc != Some(addr) {
            self.set_address(addr)?;
        }
        Ok(())
    }
}

impl<L: Link> Engine for Pic16<L> {
    fn geometry(&self) -> &'static Geometry {
        &GEOMETRY
    }

    fn enter_program_mode(&mut self) -> Result<()> {
        self.link.set_direction(Pin::Mclr, Direction::Output)?;

        self.link.set_level(Pin::Mclr, true)?; /* apply VDD to MCLR pin */
        self.link.delay_us(DELAY_TENTS);
        self.link.set_level(Pin::Mclr, false)?;
        self.link.set_level(Pin::Clock, false)?;
        self.link.delay_us(DELAY_TENTH);

        /* shift in the "enter program mode" key sequence, LSB first */
        for i in 0..32 {
            self.link
                .set_level(Pin::Data, (ENTER_PROGRAM_KEY_LV >> i) & 0x01 != 0)?;
            self.link.delay_us(DELAY_TCKL);
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_TCKH);
            self.link.set_level(Pin::Clock, false)?;
        }
        self.link.set_level(Pin::Data, false)?;

        /* 33rd clock, data is don't-care */
        self.link.delay_us(DELAY_TCKL);
        self.link.set_level(Pin::Clock, true)?;
        self.link.delay_us(DELAY_TCKH);
        self.link.set_level(Pin::Clock, false)?;

        self.link.delay_us(10);
        self.pc = None;
        Ok(())
    }

    fn exit_program_mode(&mut self) -> Result<()> {
        self.link.set_level(Pin::Clock, false)?;
        self.link.set_level(Pin::Data, false)?;
        self.link.set_direction(Pin::Mclr, Direction::Input)?;
        self.pc = None;
        Ok(())
    }

    fn read_device_id(&mut self) -> Result<(u16, u16)> {
        self.send_cmd(commands::LOAD_CONFIG, DELAY_TDLY)?;
        self.write_data(0x00)?;

        // device id lives at 0x8006, revision follows
        for _ in 0..6 {
            self.send_cmd(commands::INC_ADDR, DELAY_TDLY)?;
        }
        self.send_cmd(commands::READ_FROM_NVM, DELAY_TDLY)?;
        let id = self.read_data()? & 0x3FFF;

        self.send_cmd(commands::INC_ADDR, DELAY_TDLY)?;
        self.send_cmd(commands::READ_FROM_NVM, DELAY_TDLY)?;
        let rev = self.read_data()? & 0x3FFF;

        self.pc = Some(0x8007);
        Ok((id, rev))
    }

    fn begin_read(&mut self) -> Result<()> {
        self.pc = None;
        Ok(())
    }

    fn read_block(&mut self, addr: u32, out: &mut [u16]) -> Result<()> {
        self.goto_address(addr)?;
        for slot in out.iter_mut() {
            self.send_cmd(commands::READ_FROM_NVM_INC, DELAY_TDLY)?;
            *slot = self.read_data()? & 0x3FFF;
        }
        self.pc = Some(addr + out.len() as u32);
        Ok(())
    }

    fn bulk_erase(&mut self) -> Result<()> {
        // erasing from config space wipes program memory and fuses
        self.set_address(0x8000)?;
        self.send_cmd(commands::BULK_ERASE, DELAY_TERAB)?;
        Ok(())
    }

    fn begin_write(&mut self) -> Result<()> {
        self.pc = None;
        Ok(())
    }

    fn write_block(&mut self, addr: u32, words: &[u16]) -> Result<()> {
        self.goto_address(addr)?;

        /* stage all but the last word, advancing the PC */
        let Some((last, head)) = words.split_last() else {
            return Ok(());
        };
        for &word in head {
            self.send_cmd(commands::LOAD_FOR_NVM_INC, DELAY_TDLY)?;
            self.write_data(word)?;
        }

        /* stage the last word and run the internally timed program cycle */
        self.send_cmd(commands::LOAD_FOR_NVM, DELAY_TDLY)?;
        self.write_data(*last)?;
        self.send_cmd(commands::BEGIN_INT_TIMED_PROG, DELAY_TPINT_DATA)?;
        self.send_cmd(commands::INC_ADDR, DELAY_TDLY)?;

        self.pc = Some(addr + words.len() as u32);
        Ok(())
    }

    fn finish_write(&mut self) -> Result<()> {
        Ok(())
    }

    fn read_config_word(&mut self, addr: u32) -> Result<u16> {
        self.set_address(addr)?;
        self.send_cmd(commands::READ_FROM_NVM, DELAY_TDLY)?;
        Ok(self.read_data()? & 0x3FFF)
    }

    fn write_config_word(&mut self, addr: u32, value: u16) -> Result<()> {
        self.set_address(addr)?;
        self.send_cmd(commands::LOAD_FOR_NVM, DELAY_TDLY)?;
        self.write_data(value)?;
        self.send_cmd(commands::BEGIN_INT_TIMED_PROG, DELAY_TPINT_CONF)?;
        self.send_cmd(commands::INC_ADDR, DELAY_TDLY)?;
        self.pc = Some(addr + 1);
        Ok(())
    }
}
