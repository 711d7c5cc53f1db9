//! The BCH engine's flash layout registers.
//!
//! Boot control blocks are written with the hardware ECC layout switched off, so the ROM sees
//! exactly the bytes we prepared. [`EccLayoutGuard`] does the switch and puts the previous layout
//! back when it goes out of scope, whether or not the write succeeded.

use log::error;

/// ECC strength of the first ECC block in a page (FLASH0LAYOUT0)
pub const BCH_FLASH0LAYOUT0_ECC0_MASK: u32 = 0x1f << 11;

/// Number of metadata bytes (FLASH0LAYOUT0)
pub const BCH_FLASH0LAYOUT0_META_SIZE_MASK: u32 = 0xff << 16;

/// ECC strength of the remaining ECC blocks (FLASH0LAYOUT1)
pub const BCH_FLASH0LAYOUT1_ECCN_MASK: u32 = 0x1f << 11;

/// The pair of layout registers of the first flash chip select
pub trait EccLayout {
    fn read_layout(&mut self) -> anyhow::Result<(u32, u32)>;
    fn write_layout(&mut self, layout0: u32, layout1: u32) -> anyhow::Result<()>;
}

impl<E: EccLayout + ?Sized> EccLayout for &mut E {
    fn read_layout(&mut self) -> anyhow::Result<(u32, u32)> {
        (**self).read_layout()
    }

    fn write_layout(&mut self, layout0: u32, layout1: u32) -> anyhow::Result<()> {
        (**self).write_layout(layout0, layout1)
    }
}

/// Simulated layout registers, for testing purposes
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub struct SimEccRegs {
    pub layout0: u32,
    pub layout1: u32,

    /// Number of layout writes so far
    pub writes: usize,
}

impl SimEccRegs {
    /// A typical power-on layout: BCH on, 10 bytes of metadata
    pub fn new() -> Self {
        Self {
            layout0: 0x030a_2000 | (8 << 11),
            layout1: 0x1000_0200 | (8 << 11),
            writes: 0,
        }
    }
}

impl EccLayout for SimEccRegs {
    fn read_layout(&mut self) -> anyhow::Result<(u32, u32)> {
        Ok((self.layout0, self.layout1))
    }

    fn write_layout(&mut self, layout0: u32, layout1: u32) -> anyhow::Result<()> {
        self.layout0 = layout0;
        self.layout1 = layout1;
        self.writes += 1;
        Ok(())
    }
}

/// Keeps hardware ECC disabled for as long as it lives
pub struct EccLayoutGuard<'a, E: EccLayout + ?Sized> {
    regs: &'a mut E,
    saved: (u32, u32),
}

impl<'a, E: EccLayout + ?Sized> EccLayoutGuard<'a, E> {
    /// Save the current layout and clear the ECC strength and metadata fields.
    pub fn disable(regs: &'a mut E) -> anyhow::Result<Self> {
        let saved = regs.read_layout()?;
        let (layout0, layout1) = saved;

        regs.write_layout(
            layout0 & !(BCH_FLASH0LAYOUT0_ECC0_MASK | BCH_FLASH0LAYOUT0_META_SIZE_MASK),
            layout1 & !BCH_FLASH0LAYOUT1_ECCN_MASK,
        )?;

        Ok(Self { regs, saved })
    }

    pub fn saved(&self) -> (u32, u32) {
        self.saved
    }
}

impl<E: EccLayout + ?Sized> Drop for EccLayoutGuard<'_, E> {
    fn drop(&mut self) {
        let (layout0, layout1) = self.saved;
        if let Err(e) = self.regs.write_layout(layout0, layout1) {
            error!("failed to restore BCH layout: {e:#}");
        }
    }
}
