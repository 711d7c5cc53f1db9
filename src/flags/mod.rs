//! Flags and the boot counter that survive a reset.
//!
//! Both live in one 32-bit general-purpose register of the always-on power domain: bits 0..8 are
//! eight independent boolean flags, bits 8..16 hold the boot counter. The remaining bits are left
//! untouched. Every write is a read-modify-write of the whole register.

pub mod reset;

use std::fs;
use std::path::PathBuf;

use anyhow::Context;

/// Set by the orchestration script when an update is staged
pub const FWUP_FLAG_UPDATE_INDEX: u8 = 0;

/// Set when an update attempt failed
pub const FWUP_FLAG_FAIL_INDEX: u8 = 1;

/// Set right before a reset is requested, to tell it apart from a watchdog reset
pub const FWUP_FLAG_SWRESET_REQ: u8 = 2;

const FLAG_COUNT: u8 = 8;
const FLAGS_MASK: u32 = 0xFF;
const BOOTCOUNT_SHIFT: u32 = 8;
const BOOTCOUNT_MASK: u32 = 0xFF << BOOTCOUNT_SHIFT;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum FlagError {
    #[error("flag index {0} out of range")]
    InvalidIndex(u8),

    #[error("flag value {0} is not 0 or 1")]
    InvalidValue(u8),
}

/// A 32-bit register that keeps its value across warm resets
pub trait Register {
    fn read(&mut self) -> anyhow::Result<u32>;
    fn write(&mut self, value: u32) -> anyhow::Result<()>;
}

impl<R: Register + ?Sized> Register for &mut R {
    fn read(&mut self) -> anyhow::Result<u32> {
        (**self).read()
    }

    fn write(&mut self, value: u32) -> anyhow::Result<()> {
        (**self).write(value)
    }
}

/// An in-memory register, for testing purposes
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SimRegister(pub u32);

impl Register for SimRegister {
    fn read(&mut self) -> anyhow::Result<u32> {
        Ok(self.0)
    }

    fn write(&mut self, value: u32) -> anyhow::Result<()> {
        self.0 = value;
        Ok(())
    }
}

/// A register persisted as a hex word in a file; a missing file reads as 0.
#[derive(Debug, Clone)]
pub struct FileRegister {
    path: PathBuf,
}

impl FileRegister {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl Register for FileRegister {
    fn read(&mut self) -> anyhow::Result<u32> {
        let text = match fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e).context(format!("reading {}", self.path.display())),
        };

        let text = text.trim();
        let digits = text.strip_prefix("0x").unwrap_or(text);
        u32::from_str_radix(digits, 16)
            .with_context(|| format!("malformed register file {}", self.path.display()))
    }

    fn write(&mut self, value: u32) -> anyhow::Result<()> {
        fs::write(&self.path, format!("0x{value:08x}\n"))
            .with_context(|| format!("writing {}", self.path.display()))
    }
}

/// Typed access to the flag register
#[derive(Debug)]
pub struct FlagStore<R> {
    reg: R,
}

impl<R: Register> FlagStore<R> {
    pub fn new(reg: R) -> Self {
        Self { reg }
    }

    pub fn into_inner(self) -> R {
        self.reg
    }

    pub fn flag_write(&mut self, index: u8, value: u8) -> anyhow::Result<()> {
        if index >= FLAG_COUNT {
            return Err(FlagError::InvalidIndex(index).into());
        }
        if value > 1 {
            return Err(FlagError::InvalidValue(value).into());
        }

        let mut reg = self.reg.read()?;
        reg &= !(1 << index);
        reg |= (value as u32) << index;
        self.reg.write(reg)
    }

    pub fn flag_read(&mut self, index: u8) -> anyhow::Result<u8> {
        if index >= FLAG_COUNT {
            return Err(FlagError::InvalidIndex(index).into());
        }

        let reg = self.reg.read()?;
        Ok(((reg >> index) & 1) as u8)
    }

    pub fn flag(&mut self, index: u8) -> anyhow::Result<bool> {
        Ok(self.flag_read(index)? != 0)
    }

    pub fn set_flag(&mut self, index: u8, value: bool) -> anyhow::Result<()> {
        self.flag_write(index, value as u8)
    }

    /// Clear all eight flags, leaving the boot counter alone.
    pub fn flags_clear(&mut self) -> anyhow::Result<()> {
        let reg = self.reg.read()?;
        self.reg.write(reg & !FLAGS_MASK)
    }

    pub fn bootcount_write(&mut self, count: u8) -> anyhow::Result<()> {
        let mut reg = self.reg.read()?;
        reg &= !BOOTCOUNT_MASK;
        reg |= (count as u32) << BOOTCOUNT_SHIFT;
        self.reg.write(reg)
    }

    pub fn bootcount_read(&mut self) -> anyhow::Result<u8> {
        let reg = self.reg.read()?;
        Ok(((reg & BOOTCOUNT_MASK) >> BOOTCOUNT_SHIFT) as u8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_flags_are_independent() -> anyhow::Result<()> {
        let mut store = FlagStore::new(SimRegister(0xABCD_0000));

        store.flag_write(FWUP_FLAG_FAIL_INDEX, 1)?;
        store.flag_write(7, 1)?;
        store.bootcount_write(5)?;
        assert_eq!(store.flag_read(FWUP_FLAG_FAIL_INDEX)?, 1);
        assert_eq!(store.flag_read(FWUP_FLAG_UPDATE_INDEX)?, 0);
        assert_eq!(store.bootcount_read()?, 5);

        store.flag_write(FWUP_FLAG_FAIL_INDEX, 0)?;
        assert_eq!(store.flag_read(FWUP_FLAG_FAIL_INDEX)?, 0);
        assert_eq!(store.flag_read(7)?, 1);

        store.flags_clear()?;
        assert_eq!(store.bootcount_read()?, 5);

        // Reserved bits survive everything above
        assert_eq!(store.into_inner(), SimRegister(0xABCD_0500));
        Ok(())
    }

    #[test]
    fn test_flag_arguments() -> anyhow::Result<()> {
        let mut store = FlagStore::new(SimRegister::default());

        let err = store.flag_write(8, 1).unwrap_err();
        assert_eq!(err.downcast_ref::<FlagError>(), Some(&FlagError::InvalidIndex(8)));
        let err = store.flag_write(0, 2).unwrap_err();
        assert_eq!(err.downcast_ref::<FlagError>(), Some(&FlagError::InvalidValue(2)));
        assert!(store.flag_read(8).is_err());

        store.bootcount_write(0xFF)?;
        assert_eq!(store.into_inner(), SimRegister(0xFF00));
        Ok(())
    }

    #[test]
    fn test_file_register() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("sue-flags-{}", std::process::id()));
        let _ = fs::remove_file(&path);

        let mut reg = FileRegister::new(&path);
        assert_eq!(reg.read()?, 0);

        let mut store = FlagStore::new(FileRegister::new(&path));
        store.flag_write(FWUP_FLAG_UPDATE_INDEX, 1)?;
        store.bootcount_write(3)?;
        assert_eq!(reg.read()?, 0x0301);
        assert_eq!(fs::read_to_string(&path)?, "0x00000301\n");

        fs::remove_file(&path)?;
        Ok(())
    }
}
