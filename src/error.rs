//! Error taxonomy of the programming pipeline.
//!
//! Protocol primitives never fail on their own; only content-level checks
//! (device id lookup, read-back comparison) and the bounded NVM status poll
//! surface as errors. Each class maps to a distinct process exit status so
//! front ends driving the tool can tell them apart.

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("device id 0x{device_id:04x} not found in the registry")]
    UnknownDevice { device_id: u16 },

    #[error("source image has no filled locations")]
    EmptySource,

    #[error("verify failed at 0x{addr:06x}: wrote 0x{expected:04x} but read 0x{actual:04x}")]
    VerifyMismatch { addr: u32, expected: u16, actual: u16 },

    #[error(
        "config verify failed at 0x{addr:06x}: wrote 0x{expected:04x} but read 0x{actual:04x}"
    )]
    ConfigMismatch { addr: u32, expected: u16, actual: u16 },

    #[error("NVM controller busy bit never cleared")]
    ControllerBusy,
}

impl Error {
    pub fn exit_code(&self) -> i32 {
        match self {
            Error::UnknownDevice { .. } => 30,
            Error::EmptySource => 31,
            Error::VerifyMismatch { .. } => 32,
            Error::ConfigMismatch { .. } => 33,
            Error::ControllerBusy => 34,
        }
    }
}

/// Exit status for a failed run; pipeline errors keep their class-specific
/// code, anything else (link I/O, bad hex file) is a generic failure.
pub fn exit_code(err: &anyhow::Error) -> i32 {
    err.downcast_ref::<Error>().map(Error::exit_code).unwrap_or(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_are_distinct() {
        let errs = [
            Error::UnknownDevice { device_id: 0xFFFF },
            Error::EmptySource,
            Error::VerifyMismatch { addr: 0, expected: 0, actual: 1 },
            Error::ConfigMismatch { addr: 0, expected: 0, actual: 1 },
            Error::ControllerBusy,
        ];
        let mut codes: Vec<i32> = errs.iter().map(Error::exit_code).collect();
        codes.sort_unstable();
        codes.dedup();
        assert_eq!(codes.len(), errs.len());
    }

    #[test]
    fn anyhow_downcast_keeps_code() {
        let err = anyhow::Error::from(Error::EmptySource);
        assert_eq!(exit_code(&err), 31);
        assert_eq!(exit_code(&anyhow::anyhow!("gpio open failed")), 1);
    }
}
