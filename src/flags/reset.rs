//! Telling power-on, software and watchdog resets apart.
//!
//! The PMIC powers up with bit 2 of its GPIO0 control register set, and nothing else sets it, so
//! finding it set means a cold boot (we clear it so the next warm reset reads differently). A
//! software reset is announced beforehand through [`FWUP_FLAG_SWRESET_REQ`]; anything else was the
//! watchdog.

use std::fmt;

use super::{FlagStore, Register, FWUP_FLAG_SWRESET_REQ};

/// PMIC register holding the cold-boot marker
pub const AXP152_GPIO0: u8 = 0x90;
const COLD_BOOT_BIT: u8 = 1 << 2;

/// Register access to the power management IC
pub trait Pmic {
    fn read_reg(&mut self, reg: u8) -> anyhow::Result<u8>;
    fn write_reg(&mut self, reg: u8, value: u8) -> anyhow::Result<()>;
}

/// A simulated PMIC register file, for testing purposes
#[derive(Debug, Clone)]
pub struct SimPmic {
    regs: [u8; 256],
}

impl SimPmic {
    /// The register state right after power was applied
    pub fn power_on() -> Self {
        let mut pmic = Self::default();
        pmic.regs[AXP152_GPIO0 as usize] = COLD_BOOT_BIT;
        pmic
    }

    pub fn reg(&self, reg: u8) -> u8 {
        self.regs[reg as usize]
    }
}

impl Default for SimPmic {
    fn default() -> Self {
        Self { regs: [0; 256] }
    }
}

impl Pmic for SimPmic {
    fn read_reg(&mut self, reg: u8) -> anyhow::Result<u8> {
        Ok(self.regs[reg as usize])
    }

    fn write_reg(&mut self, reg: u8, value: u8) -> anyhow::Result<()> {
        self.regs[reg as usize] = value;
        Ok(())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ResetCause {
    Unknown,
    PowerOn,
    Software,
    Watchdog,
}

impl fmt::Display for ResetCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResetCause::Unknown => "unknown",
            ResetCause::PowerOn => "POR",
            ResetCause::Software => "SOFTWARE",
            ResetCause::Watchdog => "WDOG",
        })
    }
}

/// Work out why we booted, consuming the markers that told us.
pub fn detect_reset_cause<P: Pmic + ?Sized, R: Register>(
    pmic: &mut P,
    flags: &mut FlagStore<R>,
) -> anyhow::Result<ResetCause> {
    let reg = pmic.read_reg(AXP152_GPIO0)?;
    if reg & COLD_BOOT_BIT != 0 {
        pmic.write_reg(AXP152_GPIO0, reg & !COLD_BOOT_BIT)?;
        return Ok(ResetCause::PowerOn);
    }

    if flags.flag(FWUP_FLAG_SWRESET_REQ)? {
        flags.set_flag(FWUP_FLAG_SWRESET_REQ, false)?;
        Ok(ResetCause::Software)
    } else {
        Ok(ResetCause::Watchdog)
    }
}

/// Act on the reset cause: after a power-on reset the flag register holds garbage, so it is
/// zeroed along with the boot counter.
pub fn handle_reset_cause<R: Register>(
    cause: ResetCause,
    flags: &mut FlagStore<R>,
) -> anyhow::Result<()> {
    log::info!("Reset cause: {cause}");

    match cause {
        ResetCause::PowerOn => {
            flags.flags_clear()?;
            flags.bootcount_write(0)?;
        }
        ResetCause::Software | ResetCause::Watchdog => (),
        ResetCause::Unknown => anyhow::bail!("unknown reset cause"),
    }

    Ok(())
}

/// Mark the upcoming reset as requested, so the next boot doesn't blame the watchdog.
pub fn request_software_reset<R: Register>(flags: &mut FlagStore<R>) -> anyhow::Result<()> {
    flags.set_flag(FWUP_FLAG_SWRESET_REQ, true)
}
