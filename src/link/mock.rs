//! Test doubles for the bit link: a pin-event recorder and a behavioral
//! enhanced mid-range target good enough to run the whole pipeline against.

use std::collections::{BTreeMap, VecDeque};

use anyhow::Result;

use super::{Direction, Link, Pin};
use crate::constants::commands;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Direction(Pin, Direction),
    Level(Pin, bool),
    Delay(u32),
}

/// Records every pin transition; input reads come from a script, or a
/// constant level once the script runs dry.
#[derive(Default)]
pub struct RecordingLink {
    pub events: Vec<Event>,
    pub input_script: VecDeque<bool>,
    pub input_level: bool,
}

impl RecordingLink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input_level(level: bool) -> Self {
        RecordingLink {
            input_level: level,
            ..Self::default()
        }
    }

    /// Data-line levels sampled at each rising clock edge.
    pub fn clocked_data_bits(&self) -> Vec<bool> {
        let mut data = false;
        let mut bits = Vec::new();
        for event in &self.events {
            match *event {
                Event::Level(Pin::Data, level) => data = level,
                Event::Level(Pin::Clock, true) => bits.push(data),
                _ => {}
            }
        }
        bits
    }

    pub fn last_level(&self, pin: Pin) -> Option<bool> {
        self.events.iter().rev().find_map(|e| match *e {
            Event::Level(p, level) if p == pin => Some(level),
            _ => None,
        })
    }

    pub fn last_direction(&self, pin: Pin) -> Option<Direction> {
        self.events.iter().rev().find_map(|e| match *e {
            Event::Direction(p, dir) if p == pin => Some(dir),
            _ => None,
        })
    }
}

// stops the log from ballooning in tests that exhaust the NVM poll budget
const EVENT_CAP: usize = 1 << 20;

impl RecordingLink {
    fn record(&mut self, event: Event) {
        if self.events.len() < EVENT_CAP {
            self.events.push(event);
        }
    }
}

impl Link for RecordingLink {
    fn set_direction(&mut self, pin: Pin, dir: Direction) -> Result<()> {
        self.record(Event::Direction(pin, dir));
        Ok(())
    }

    fn set_level(&mut self, pin: Pin, high: bool) -> Result<()> {
        self.record(Event::Level(pin, high));
        Ok(())
    }

    fn read_level(&mut self, _pin: Pin) -> Result<bool> {
        Ok(self.input_script.pop_front().unwrap_or(self.input_level))
    }

    fn delay_us(&mut self, us: u32) {
        self.events.push(Event::Delay(us));
    }
}

/// Behavioral model of a PIC16F18326 seen through its ICSP pins: key-gated
/// program mode, 6-bit command decode, PC tracking, write latches and bulk
/// erase. Flash content survives exit/re-entry like the real part.
pub struct Pic16Target {
    device_id: u16,
    flash: BTreeMap<u32, u16>,
    latches: BTreeMap<u32, u16>,
    pc: u32,
    state: State,
    in_program_mode: bool,
    pub erase_count: u32,

    mclr_driven: bool,
    mclr_high: bool,
    clock_high: bool,
    data_in: bool,
    out_bit: bool,
}

enum State {
    Idle,
    KeyShift { shift: u32, count: u8 },
    Command { shift: u8, count: u8 },
    Payload { cmd: u8, shift: u32, count: u8, width: u8 },
    ReadOut { shift: u32, remaining: u8 },
}

const ERASED: u16 = 0x3FFF;

impl Pic16Target {
    pub fn new(device_id: u16) -> Self {
        Pic16Target {
            device_id,
            flash: BTreeMap::new(),
            latches: BTreeMap::new(),
            pc: 0,
            state: State::Idle,
            in_program_mode: false,
            erase_count: 0,
            mclr_driven: false,
            mclr_high: false,
            clock_high: false,
            data_in: false,
            out_bit: false,
        }
    }

    pub fn flash_word(&self, addr: u32) -> u16 {
        if addr == 0x8006 {
            return self.device_id;
        }
        self.flash.get(&addr).copied().unwrap_or(ERASED)
    }

    /// Corrupt one programmed word, for verify-failure tests.
    pub fn corrupt(&mut self, addr: u32, value: u16) {
        self.flash.insert(addr, value);
    }

    pub fn is_blank(&self) -> bool {
        self.flash.is_empty()
    }

    fn rising_edge(&mut self) {
        if let State::ReadOut { shift, remaining } = &mut self.state {
            self.out_bit = *shift & 1 != 0;
            *shift >>= 1;
            *remaining -= 1;
        }
    }

    fn falling_edge(&mut self) {
        let bit = self.data_in as u32;
        match &mut self.state {
            State::Idle => {}
            State::KeyShift { shift, count } => {
                if *count < 32 {
                    *shift |= bit << *count;
                }
                *count += 1;
                // 32 key bits plus one don't-care clock
                if *count == 33 {
                    if *shift == crate::constants::ENTER_PROGRAM_KEY_LV {
                        self.in_program_mode = true;
                        self.pc = 0;
                        self.state = State::Command { shift: 0, count: 0 };
                    } else {
                        self.state = State::Idle;
                    }
                }
            }
            State::Command { shift, count } => {
                *shift |= (bit as u8) << *count;
                *count += 1;
                if *count == 6 {
                    let cmd = *shift;
                    self.dispatch(cmd);
                }
            }
            State::Payload {
                cmd,
                shift,
                count,
                width,
            } => {
                *shift |= bit << *count;
                *count += 1;
                if count == width {
                    let (cmd, raw) = (*cmd, *shift);
                    self.complete_payload(cmd, raw);
                }
            }
            State::ReadOut { remaining, .. } => {
                if *remaining == 0 {
                    self.state = State::Command { shift: 0, count: 0 };
                }
            }
        }
    }

    fn dispatch(&mut self, cmd: u8) {
        self.state = State::Command { shift: 0, count: 0 };
        match cmd {
            commands::LOAD_CONFIG
            | commands::LOAD_FOR_NVM
            | commands::LOAD_FOR_NVM_INC => {
                self.state = State::Payload {
                    cmd,
                    shift: 0,
                    count: 0,
                    width: 16,
                };
            }
            commands::LOAD_PC_ADDR => {
                self.state = State::Payload {
                    cmd,
                    shift: 0,
                    count: 0,
                    width: 24,
                };
            }
            commands::READ_FROM_NVM | commands::READ_FROM_NVM_INC => {
                let value = self.flash_word(self.pc);
                self.state = State::ReadOut {
                    // one start bit, the word, one stop bit
                    shift: (value as u32) << 1,
                    remaining: 16,
                };
                if cmd == commands::READ_FROM_NVM_INC {
                    self.pc += 1;
                }
            }
            commands::INC_ADDR => self.pc += 1,
            commands::BEGIN_INT_TIMED_PROG => {
                let staged = std::mem::take(&mut self.latches);
                self.flash.extend(staged);
            }
            commands::BULK_ERASE => {
                if self.pc >= 0x8000 {
                    self.flash.clear();
                    self.erase_count += 1;
                }
            }
            _ => {}
        }
    }

    fn complete_payload(&mut self, cmd: u8, raw: u32) {
        match cmd {
            commands::LOAD_CONFIG => {
                self.pc = 0x8000;
            }
            commands::LOAD_FOR_NVM => {
                self.latches.insert(self.pc, ((raw >> 1) & 0x3FFF) as u16);
            }
            commands::LOAD_FOR_NVM_INC => {
                self.latches.insert(self.pc, ((raw >> 1) & 0x3FFF) as u16);
                self.pc += 1;
            }
            commands::LOAD_PC_ADDR => {
                self.pc = raw >> 1;
            }
            _ => {}
        }
        self.state = State::Command { shift: 0, count: 0 };
    }
}

impl Link for Pic16Target {
    fn set_direction(&mut self, pin: Pin, dir: Direction) -> Result<()> {
        if pin == Pin::Mclr {
            self.mclr_driven = dir == Direction::Output;
            if dir == Direction::Input {
                // reset released: out of program mode
                self.in_program_mode = false;
                self.state = State::Idle;
            }
        }
        Ok(())
    }

    fn set_level(&mut self, pin: Pin, high: bool) -> Result<()> {
        match pin {
            Pin::Mclr => {
                if self.mclr_driven && self.mclr_high && !high && !self.in_program_mode {
                    // VDD pulse on MCLR arms the key shifter
                    self.state = State::KeyShift { shift: 0, count: 0 };
                }
                self.mclr_high = high;
            }
            Pin::Clock => {
                if high && !self.clock_high {
                    self.rising_edge();
                } else if !high && self.clock_high {
                    self.falling_edge();
                }
                self.clock_high = high;
            }
            Pin::Data => self.data_in = high,
        }
        Ok(())
    }

    fn read_level(&mut self, pin: Pin) -> Result<bool> {
        match pin {
            Pin::Data => Ok(self.out_bit),
            Pin::Clock => Ok(self.clock_high),
            Pin::Mclr => Ok(self.mclr_high),
        }
    }

    fn delay_us(&mut self, _us: u32) {}
}
