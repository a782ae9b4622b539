//! PIC24FJxxxxGX6xx engine.
//!
//! Enhanced ICSP: every command is a 24-bit instruction injected through a
//! SIX control code, reads come back through the VISI register via REGOUT.
//! Erase and program cycles are gated by the NVM controller; the WR bit is
//! polled (with a budget) until the cycle completes.

use anyhow::Result;

use super::{unpack_read_burst, ConfigWord, Engine, Geometry};
use crate::constants::{ENTER_PROGRAM_KEY_EICSP, NVM_POLL_BUDGET, NVM_WR_BUSY};
use crate::error::Error;
use crate::link::{Direction, Link, Pin};
use crate::memory::ErasedPattern;

/* delays (in microseconds; nanosecond specs are rounded up to 1 us) */
const DELAY_P1: u32 = 1; // 200ns
const DELAY_P1A: u32 = 1; // 40ns
const DELAY_P1B: u32 = 1; // 40ns
const DELAY_P4: u32 = 1; // 40ns
const DELAY_P4A: u32 = 1; // 40ns
const DELAY_P5: u32 = 1; // 20ns
const DELAY_P6: u32 = 1; // 100ns
const DELAY_P7: u32 = 50_000; // 50ms
const DELAY_P11: u32 = 20_000; // 20ms
const DELAY_P16: u32 = 0; // 0s
const DELAY_P17: u32 = 1; // 100ns
const DELAY_P18: u32 = 1000; // 1ms
const DELAY_P19: u32 = 1; // 1ms spec, held high elsewhere
const DELAY_P20: u32 = 23; // 23us
const DELAY_P21: u32 = 100; // 100us

/// TBLRD burst that moves four instruction words into W0:W5.
const READ_BURST_OPS: [u32; 8] = [
    0xBA1B96, // TBLRDL [W6], [W7++]
    0xBADBB6, // TBLRDH.B [W6++], [W7++]
    0xBADBD6, // TBLRDH.B [++W6], [W7++]
    0xBA1BB6, // TBLRDL [W6++], [W7++]
    0xBA1B96, // TBLRDL [W6], [W7++]
    0xBADBB6, // TBLRDH.B [W6++], [W7++]
    0xBADBD6, // TBLRDH.B [++W6], [W7++]
    0xBA0BB6, // TBLRDL [W6++], [W7]
];

static GEOMETRY: Geometry = Geometry {
    read_burst: 8,
    write_block: 4,
    erased: ErasedPattern::Wide24,
    word_mask: 0xFFFF,
    config_words: &[
        ConfigWord { name: "FSEC", addr: 0x0ABF00 },
        ConfigWord { name: "FBSLIM", addr: 0x0ABF10 },
        ConfigWord { name: "FSIGN", addr: 0x0ABF14 },
        ConfigWord { name: "FOSCSEL", addr: 0x0ABF18 },
        ConfigWord { name: "FOSC", addr: 0x0ABF1C },
        ConfigWord { name: "FWDT", addr: 0x0ABF20 },
        ConfigWord { name: "FPOR", addr: 0x0ABF24 },
        ConfigWord { name: "FICD", addr: 0x0ABF28 },
        ConfigWord { name: "FDEVOPT1", addr: 0x0ABF2C },
    ],
    deferred_config_words: &[],
    blank_check_config: false,
};

pub struct Pic24<L: Link> {
    pub(crate) link: L,
    /// Next address the target's read pointer would fetch, when known.
    next_read: Option<u32>,
}

impl<L: Link> Pic24<L> {
    pub fn new(link: L) -> Self {
        Pic24 {
            link,
            next_read: None,
        }
    }

    /// Inject a 24-bit instruction through a SIX control code, LSB first.
    fn six(&mut self, cmd: u32) -> Result<()> {
        self.link.set_level(Pin::Data, false)?;

        /* 4-bit SIX control code, all zeroes */
        for _ in 0..4 {
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_P1B);
            self.link.set_level(Pin::Clock, false)?;
            self.link.delay_us(DELAY_P1A);
        }

        self.link.delay_us(DELAY_P4);

        for i in 0..24 {
            self.link.set_level(Pin::Data, (cmd >> i) & 0x01 != 0)?;
            self.link.delay_us(DELAY_P1A);
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_P1B);
            self.link.set_level(Pin::Clock, false)?;
        }

        self.link.set_level(Pin::Data, false)?;
        self.link.delay_us(DELAY_P4A);
        Ok(())
    }

    fn nop(&mut self) -> Result<()> {
        self.six(0x000000)
    }

    fn reset_pc(&mut self) -> Result<()> {
        self.six(0x040200) // GOTO 0x200
    }

    fn exit_reset_vector(&mut self) -> Result<()> {
        self.nop()?;
        self.reset_pc()?;
        self.nop()
    }

    /// Clock out the VISI register through a REGOUT control code.
    fn regout(&mut self) -> Result<u16> {
        self.link.set_level(Pin::Data, false)?;
        self.link.set_level(Pin::Clock, false)?;

        /* 4-bit REGOUT control code, 0b0001 */
        for i in 0..4 {
            self.link.set_level(Pin::Data, (0x0001 >> i) & 0x01 != 0)?;
            self.link.delay_us(DELAY_P1A);
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_P1B);
            self.link.set_level(Pin::Clock, false)?;
        }

        self.link.delay_us(DELAY_P4);

        /* idle for 8 clock cycles while the target loads the shifter */
        for _ in 0..8 {
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_P1B);
            self.link.set_level(Pin::Clock, false)?;
            self.link.delay_us(DELAY_P1A);
        }

        self.link.delay_us(DELAY_P5);
        self.link.set_direction(Pin::Data, Direction::Input)?;

        let mut data: u16 = 0;
        for i in 0..16 {
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_P1B);
            data |= (self.link.read_level(Pin::Data)? as u16) << i;
            self.link.set_level(Pin::Clock, false)?;
            self.link.delay_us(DELAY_P1A);
        }

        self.link.delay_us(DELAY_P4A);
        self.link.set_direction(Pin::Data, Direction::Output)?;
        Ok(data)
    }

    /// Read NVMCON into VISI and clock it out, until WR clears or the
    /// budget runs out.
    fn wait_nvm_idle(&mut self) -> Result<()> {
        for _ in 0..NVM_POLL_BUDGET {
            self.six(0x803B00)?; // MOV NVMCON, W0
            self.six(0x883C20)?; // MOV W0, VISI
            self.nop()?;
            let nvmcon = self.regout()?;
            self.nop()?;
            self.reset_pc()?;
            self.nop()?;
            if nvmcon & NVM_WR_BUSY == 0 {
                return Ok(());
            }
        }
        Err(Error::ControllerBusy.into())
    }

    /// Point TBLPAG/W6 at `addr` for a table read.
    fn set_read_pointer(&mut self, addr: u32) -> Result<()> {
        self.six(0x200000 | ((addr & 0x00FF_0000) >> 12))?; // MOV #<Addr23:16>, W0
        self.six(0x880190)?; // MOV W0, TBLPAG
        self.six(0x200006 | ((addr & 0x0000_FFFF) << 4))?; // MOV #<Addr15:0>, W6
        Ok(())
    }
}

impl<L: Link> Engine for Pic24<L> {
    fn geometry(&self) -> &'static Geometry {
        &GEOMETRY
    }

    fn enter_program_mode(&mut self) -> Result<()> {
        self.link.set_direction(Pin::Mclr, Direction::Output)?;
        self.link.set_direction(Pin::Data, Direction::Output)?;

        self.link.set_level(Pin::Clock, false)?;

        self.link.set_level(Pin::Mclr, false)?;
        self.link.delay_us(DELAY_P6);
        self.link.set_level(Pin::Mclr, true)?;
        self.link.delay_us(DELAY_P21);
        self.link.set_level(Pin::Mclr, false)?;
        self.link.delay_us(DELAY_P18);

        /* shift in the "enter program mode" key sequence, MSB first */
        for i in (0..32).rev() {
            self.link
                .set_level(Pin::Data, (ENTER_PROGRAM_KEY_EICSP >> i) & 0x01 != 0)?;
            self.link.delay_us(DELAY_P1A);
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_P1B);
            self.link.set_level(Pin::Clock, false)?;
        }

        self.link.set_level(Pin::Data, false)?;
        self.link.delay_us(DELAY_P19);
        self.link.set_level(Pin::Mclr, true)?;
        self.link.delay_us(DELAY_P7);
        self.link.delay_us(DELAY_P1 * 5);

        /*
         * Coming out of reset the first control code is forced to SIX with
         * a forced NOP; five extra clocks are needed on start-up, making a
         * 9-bit SIX command out of the first one.
         */
        for _ in 0..5 {
            self.link.set_level(Pin::Clock, true)?;
            self.link.delay_us(DELAY_P1A);
            self.link.set_level(Pin::Clock, false)?;
            self.link.delay_us(DELAY_P1B);
        }

        self.next_read = None;
        Ok(())
    }

    fn exit_program_mode(&mut self) -> Result<()> {
        self.link.set_level(Pin::Clock, false)?;
        self.link.set_level(Pin::Data, false)?;
        self.link.delay_us(DELAY_P16);
        self.link.set_level(Pin::Mclr, false)?;
        self.link.delay_us(DELAY_P17);
        self.link.set_direction(Pin::Mclr, Direction::Input)?;
        self.next_read = None;
        Ok(())
    }

    fn read_device_id(&mut self) -> Result<(u16, u16)> {
        self.exit_reset_vector()?;

        /* device id words live at 0xFF0000 */
        self.six(0x200FF0)?; // MOV #0xFF, W0
        self.six(0x8802A0)?; // MOV W0, TBLPAG
        self.six(0x200006)?; // MOV #0x0000, W6
        self.six(0x207847)?; // MOV #VISI, W7
        self.nop()?;

        self.six(0xBA0B96)?; // TBLRDL [W6], [W7]
        self.nop()?;
        self.nop()?;
        let id = self.regout()?;
        self.nop()?;

        self.six(0xBADBB6)?; // TBLRDH.B [W6++], [W7++]
        self.nop()?;
        self.nop()?;

        self.six(0xBAD3D6)?; // TBLRDH.B [++W6], [W7--]
        self.nop()?;
        self.nop()?;
        let _rev_high = self.regout()?;
        self.nop()?;

        self.six(0xBA0BB6)?; // TBLRDL [W6++], [W7]
        self.nop()?;
        self.nop()?;
        let rev = self.regout()?;
        self.nop()?;

        self.reset_pc()?;
        self.nop()?;
        self.next_read = None;
        Ok((id, rev))
    }

    fn begin_read(&mut self) -> Result<()> {
        self.exit_reset_vector()?;
        self.next_read = None;
        Ok(())
    }

    fn read_block(&mut self, addr: u32, out: &mut [u16]) -> Result<()> {
        debug_assert_eq!(out.len(), GEOMETRY.read_burst);

        // W6 advances on its own; reload it on 64K pages or after a jump
        if (addr & 0xFFFF) == 0 || self.next_read != Some(addr) {
            self.set_read_pointer(addr)?;
        }

        self.six(0x207847)?; // MOV #VISI, W7
        self.nop()?;
        self.six(0xEB0380)?; // CLR W7
        self.nop()?;
        for op in READ_BURST_OPS {
            self.six(op)?;
            self.nop()?;
            self.nop()?;
        }

        let mut raw = [0u16; 6];
        for (i, slot) in raw.iter_mut().enumerate() {
            self.six(0x883C20 + i as u32)?; // MOV W(i), VISI
            self.nop()?;
            *slot = self.regout()?;
            self.nop()?;
        }

        self.reset_pc()?;
        self.nop()?;

        out.copy_from_slice(&unpack_read_burst(&raw));
        self.next_read = Some(addr + out.len() as u32);
        Ok(())
    }

    fn bulk_erase(&mut self) -> Result<()> {
        self.exit_reset_vector()?;

        /* configure NVMCON for chip erase */
        self.six(0x2400E0)?; // MOV #0x400E, W0
        self.six(0x883B00)?; // MOV W0, NVMCON

        /* unlock and set the WR bit */
        self.six(0x200550)?; // MOV #0x55, W0
        self.six(0x883B30)?; // MOV W0, NVMKEY
        self.six(0x200AA0)?; // MOV #0xAA, W0
        self.six(0x883B30)?; // MOV W0, NVMKEY
        self.six(0xA8E761)?; // BSET NVMCON, #WR
        self.nop()?;
        self.nop()?;
        self.nop()?;

        self.link.delay_us(DELAY_P11);

        for _ in 0..NVM_POLL_BUDGET {
            self.reset_pc()?;
            self.nop()?;
            self.six(0x803B02)?; // MOV NVMCON, W2
            self.six(0x883C22)?; // MOV W2, VISI
            self.nop()?;
            let nvmcon = self.regout()?;
            self.nop()?;
            if nvmcon & NVM_WR_BUSY == 0 {
                /* clear the WREN bit */
                self.six(0x200000)?; // MOV #0x0000, W0
                self.six(0x883B00)?; // MOV W0, NVMCON
                self.next_read = None;
                return Ok(());
            }
        }
        Err(Error::ControllerBusy.into())
    }

    fn begin_write(&mut self) -> Result<()> {
        self.exit_reset_vector()?;
        /* point TBLPAG at the write latches */
        self.six(0x200FAC)?; // MOV #0xFA, W12
        self.six(0x8802AC)?; // MOV W12, TBLPAG
        Ok(())
    }

    fn write_block(&mut self, addr: u32, words: &[u16]) -> Result<()> {
        debug_assert_eq!(words.len(), GEOMETRY.write_block);
        let (lsw0, msb0, lsw1, msb1) =
            (words[0] as u32, words[1] as u32, words[2] as u32, words[3] as u32);

        /* point NVMADRU:NVMADR at the destination */
        self.six(0x200003 | ((addr & 0x0000_FFFF) << 4))?; // MOV #<Addr15:0>, W3
        self.six(0x200004 | ((addr & 0x00FF_0000) >> 12))?; // MOV #<Addr23:16>, W4
        self.six(0x883B13)?; // MOV W3, NVMADR
        self.six(0x883B24)?; // MOV W4, NVMADRU

        /* two instruction words into W0:W2 */
        self.six(0x200000 | (lsw0 << 4))?; // MOV #<LSW0>, W0
        self.six(0x200001 | (0x00FFFF & ((msb1 << 8) | (msb0 & 0x00FF))) << 4)?; // MOV #<MSB1:MSB0>, W1
        self.six(0x200002 | (lsw1 << 4))?; // MOV #<LSW1>, W2

        /* set the read pointer and load the write latches */
        self.six(0xEB0300)?; // CLR W6
        self.nop()?;
        self.six(0xEB0380)?; // CLR W7
        self.nop()?;
        self.six(0xBB0BB6)?; // TBLWTL [W6++], [W7]
        self.nop()?;
        self.nop()?;
        self.six(0xBBDBB6)?; // TBLWTH.B [W6++], [W7++]
        self.nop()?;
        self.nop()?;
        self.six(0xBBEBB6)?; // TBLWTH.B [W6++], [++W7]
        self.nop()?;
        self.nop()?;
        self.six(0xBB1BB6)?; // TBLWTL [W6++], [W7++]
        self.nop()?;
        self.nop()?;

        /* NVMCON: program two instruction words */
        self.six(0x24001A)?; // MOV #0x4001, W10
        self.six(0x883B0A)?; // MOV W10, NVMCON

        /* unlock and start the write cycle */
        self.six(0x200551)?; // MOV #0x55, W1
        self.six(0x883B31)?; // MOV W1, NVMKEY
        self.six(0x200AA1)?; // MOV #0xAA, W1
        self.six(0x883B31)?; // MOV W1, NVMKEY
        self.six(0xA8E761)?; // BSET NVMCON, #WR
        self.nop()?;
        self.nop()?;
        self.nop()?;

        self.wait_nvm_idle()
    }

    fn finish_write(&mut self) -> Result<()> {
        /* clear the WREN bit and let the last cycle settle */
        self.six(0x200000)?; // MOV #0x0000, W0
        self.six(0x883B00)?; // MOV W0, NVMCON
        self.link.delay_us(100_000);
        Ok(())
    }

    fn read_config_word(&mut self, addr: u32) -> Result<u16> {
        self.exit_reset_vector()?;

        self.set_read_pointer(addr)?;
        self.six(0x207847)?; // MOV #VISI, W7
        self.nop()?;

        self.six(0xBA0BB6)?; // TBLRDL [W6++], [W7]
        self.nop()?;
        self.nop()?;
        let value = self.regout()?;
        self.nop()?;

        self.reset_pc()?;
        self.nop()?;
        self.next_read = None;
        Ok(value)
    }

    fn write_config_word(&mut self, addr: u32, value: u16) -> Result<()> {
        /* the config word and an erased upper word into W0:W1 */
        self.six(0x200000 | ((value as u32) << 4))?; // MOV #<ConfigValue>, W0
        self.six(0x2FFFF1)?; // MOV #0xFFFF, W1

        /* set the read/write pointers and load the latches */
        self.six(0xEB0300)?; // CLR W6
        self.nop()?;
        self.six(0xEB0380)?; // CLR W7
        self.nop()?;
        self.six(0xBB0BB6)?; // TBLWTL [W6++], [W7]
        self.nop()?;
        self.nop()?;
        self.six(0xBBDBB6)?; // TBLWTH.B [W6++], [W7++]
        self.nop()?;
        self.nop()?;
        self.six(0xBBEBB6)?; // TBLWTH.B [W6++], [++W7]
        self.nop()?;
        self.nop()?;
        self.six(0xBB1BB6)?; // TBLWTL [W6++], [W7++]
        self.nop()?;
        self.nop()?;

        /* point NVMADRU:NVMADR at the config word */
        self.six(0x200003 | ((addr & 0x0000_FFFF) << 4))?; // MOV #<Addr15:0>, W3
        self.six(0x200004 | ((addr & 0x00FF_0000) >> 12))?; // MOV #<Addr23:16>, W4
        self.six(0x883B13)?; // MOV W3, NVMADR
        self.six(0x883B24)?; // MOV W4, NVMADRU

        /* NVMCON: program two instruction words */
        self.six(0x24001A)?; // MOV #0x4001, W10
        self.six(0x883B0A)?; // MOV W10, NVMCON
        self.nop()?;

        /* unlock and start the write cycle */
        self.six(0x200551)?; // MOV #0x55, W1
        self.six(0x883B31)?; // MOV W1, NVMKEY
        self.six(0x200AA1)?; // MOV #0xAA, W1
        self.six(0x883B31)?; // MOV W1, NVMKEY
        self.six(0xA8E761)?; // BSET NVMCON, #WR
        self.nop()?;
        self.nop()?;
        self.nop()?;

        self.link.delay_us(DELAY_P20);
        self.wait_nvm_idle()
    }
}
