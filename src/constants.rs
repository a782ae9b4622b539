//! Protocol-wide ICSP constants.

/// "MCHP": low-voltage program mode entry key, shifted LSB first.
pub const ENTER_PROGRAM_KEY_LV: u32 = 0x4D434850;
/// Entry key for the 24-bit instruction families, shifted MSB first.
pub const ENTER_PROGRAM_KEY_EICSP: u32 = 0x4D434851;

/// WR bit of the NVM controller status word.
pub const NVM_WR_BUSY: u16 = 0x8000;

/// Upper bound on NVMCON status polls before the controller is declared
/// wedged.
pub const NVM_POLL_BUDGET: u32 = 10_000;

/// 6-bit ICSP commands of the enhanced mid-range family, sent LSB first.
pub mod commands {
    pub const LOAD_CONFIG: u8 = 0x00;
    pub const LOAD_FOR_NVM: u8 = 0x02;
    pub const LOAD_FOR_NVM_INC: u8 = 0x22;
    pub const READ_FROM_NVM: u8 = 0x04;
    pub const READ_FROM_NVM_INC: u8 = 0x24;
    pub const INC_ADDR: u8 = 0x06;
    pub const LOAD_PC_ADDR: u8 = 0x1D;
    pub const BEGIN_INT_TIMED_PROG: u8 = 0x08;
    pub const BULK_ERASE: u8 = 0x09;
}
