//! Linux GPIO character-device link.
//!
//! Drives the three ICSP lines through `gpiocdev` on a `/dev/gpiochipN`
//! device. The data line direction is switched by reconfiguring its line
//! request in place; microsecond delays spin on a monotonic clock because
//! the protocol hold times are far below scheduler granularity.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use gpiocdev::line::{Offset, Value};
use gpiocdev::request::Request;

use super::{Direction, Link, Pin};

/// Line offsets on one GPIO chip.
#[derive(Debug, Clone)]
pub struct GpioLinkConfig {
    /// Device path, e.g. "/dev/gpiochip0".
    pub chip: String,
    pub mclr: Offset,
    pub clock: Offset,
    pub data: Offset,
}

pub struct GpioLink {
    request: Request,
    mclr: Offset,
    clock: Offset,
    data: Offset,
}

impl GpioLink {
    pub fn open(config: &GpioLinkConfig) -> Result<Self> {
        let request = Request::builder()
            .on_chip(&config.chip)
            .with_consumer("picsp")
            .with_line(config.mclr)
            .as_output(Value::Inactive)
            .with_line(config.clock)
            .as_output(Value::Inactive)
            .with_line(config.data)
            .as_output(Value::Inactive)
            .request()
            .with_context(|| format!("requesting GPIO lines on {}", config.chip))?;

        log::debug!(
            "opened {} (mclr={}, pgc={}, pgd={})",
            config.chip,
            config.mclr,
            config.clock,
            config.data
        );

        Ok(GpioLink {
            request,
            mclr: config.mclr,
            clock: config.clock,
            data: config.data,
        })
    }

    fn offset(&self, pin: Pin) -> Offset {
        match pin {
            Pin::Mclr => self.mclr,
            Pin::Clock => self.clock,
            Pin::Data => self.data,
        }
    }
}

impl Link for GpioLink {
    fn set_direction(&mut self, pin: Pin, dir: Direction) -> Result<()> {
        let offset = self.offset(pin);
        let mut config = self.request.config();
        match dir {
            Direction::Input => config.with_line(offset).as_input(),
            Direction::Output => config.with_line(offset).as_output(Value::Inactive),
        };
        self.request
            .reconfigure(&config)
            .with_context(|| format!("reconfiguring {:?} as {:?}", pin, dir))?;
        Ok(())
    }

    fn set_level(&mut self, pin: Pin, high: bool) -> Result<()> {
        let value = if high { Value::Active } else { Value::Inactive };
        self.request.set_value(self.offset(pin), value)?;
        Ok(())
    }

    fn read_level(&mut self, pin: Pin) -> Result<bool> {
        Ok(self.request.value(self.offset(pin))? == Value::Active)
    }

    fn delay_us(&mut self, us: u32) {
        let deadline = Duration::from_micros(us as u64);
        let start = Instant::now();
        while start.elapsed() < deadline {
            std::hint::spin_loop();
        }
    }
}
