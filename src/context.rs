//! Everything a boot carries from one command to the next.

use std::time::Duration;

use log::{error, info, warn};

use crate::device::{self, Adc, ButtonTiming, Carrier, DeviceInfo, Gpio};
use crate::env::{Constants, Environment};
use crate::flags::reset::{detect_reset_cause, handle_reset_cause, Pmic};
use crate::flags::{FlagStore, Register};
use crate::nand::NandLayout;
use crate::partitions::{MtdSetup, PartitionError};

/// Boot attempts allowed before an update is considered failed, unless `bootlimit` says otherwise
pub const FWUP_MAX_BOOT_CNT: u32 = 6;

/// Value reported when the boot counter can't be read
pub const BOOTCOUNT_ERROR: u8 = 0xFF;

/// The board peripherals needed to bring up a [`BootContext`]
pub struct BoardHw<'a> {
    pub pmic: &'a mut dyn Pmic,
    pub adc1: &'a mut dyn Adc,
    pub adc2: &'a mut dyn Adc,

    /// Hands out the GPIO with the given number
    pub gpio: &'a mut dyn FnMut(u32) -> anyhow::Result<Box<dyn Gpio>>,

    pub adc_timeout: Duration,
    pub button_timing: ButtonTiming,
}

pub struct BootContext<R> {
    pub env: Environment,
    pub constants: Constants,
    pub flags: FlagStore<R>,
    pub device: DeviceInfo,
    pub carrier: Option<Box<dyn Carrier>>,
    pub nand_layout: NandLayout,

    /// Secure boot fuses are burnt
    pub secure: bool,
}

/// `simple_strtoul`-style decimal: leading digits only, 0 if there are none.
fn parse_decimal(value: &str) -> u32 {
    value
        .trim_start()
        .chars()
        .map_while(|c| c.to_digit(10))
        .fold(0u32, |acc, digit| acc.wrapping_mul(10).wrapping_add(digit))
}

impl<R: Register> BootContext<R> {
    pub fn new(
        env: Environment,
        constants: Constants,
        flags: FlagStore<R>,
        nand_layout: NandLayout,
    ) -> Self {
        Self {
            env,
            constants,
            flags,
            device: DeviceInfo::default(),
            carrier: None,
            nand_layout,
            secure: false,
        }
    }

    /// Detect why and on what we booted, then run the carrier's early hook.
    pub fn board_init(&mut self, hw: BoardHw<'_>) -> anyhow::Result<()> {
        let cause = detect_reset_cause(hw.pmic, &mut self.flags)?;
        handle_reset_cause(cause, &mut self.flags)?;

        self.device = device::detect(hw.adc1, hw.adc2, hw.adc_timeout)?;
        self.device.reset_cause = Some(cause);
        for line in self.device.to_string().lines() {
            info!("{line}");
        }

        self.carrier = device::select_carrier(&self.device, hw.button_timing, hw.gpio)?;
        if let Some(carrier) = &mut self.carrier {
            carrier.init(&self.device)?;
        }

        Ok(())
    }

    /// Export what the boot script needs to pick and verify a kernel, then run the carrier's
    /// late hook (which is where update buttons are sampled).
    pub fn board_late_init(&mut self) -> anyhow::Result<()> {
        self.fwupdate_init();

        if let Err(e) = self.setup_mtdparts() {
            error!("setting up mtdparts failed: {e}");
        }

        let fit_config = self.device.fit_config();
        info!("Setting fit_config: {fit_config}");
        self.env.set("fit_config", fit_config);

        let secure = if self.secure { "1" } else { "0" };
        info!("Setting secure_board: {secure}");
        self.env.set("secure_board", secure);

        if let Some(carrier) = &mut self.carrier {
            carrier.late_init(&self.device)?;
        }

        Ok(())
    }

    /// Give `bootlimit` its default if unset.
    pub fn fwupdate_init(&mut self) {
        if self.env.get("bootlimit").is_none() {
            self.env.set("bootlimit", FWUP_MAX_BOOT_CNT.to_string());
        }
    }

    pub fn bootlimit(&self) -> u32 {
        self.env
            .get("bootlimit")
            .map_or(FWUP_MAX_BOOT_CNT, parse_decimal)
    }

    pub fn bootcount_load(&mut self) -> u8 {
        match self.flags.bootcount_read() {
            Ok(count) => count,
            Err(e) => {
                error!("reading boot count failed: {e:#}");
                BOOTCOUNT_ERROR
            }
        }
    }

    pub fn bootcount_store(&mut self, count: u8) {
        info!("BOOTCOUNT is {count}");
        if let Err(e) = self.flags.bootcount_write(count) {
            error!("writing boot count failed: {e:#}");
        }
    }

    /// Pick the partition table for this NAND and publish it to the environment.
    pub fn setup_mtdparts(&mut self) -> Result<(), PartitionError> {
        let setup = MtdSetup::new(
            self.nand_layout.total_size(),
            self.nand_layout.bytes_per_page,
        )?;
        for (name, value) in setup.env_vars() {
            self.env.set(name, value);
        }
        Ok(())
    }

    /// Whether the user asked for an update from USB. Errors count as no.
    pub fn usb_update_request(&mut self) -> bool {
        let Some(carrier) = &mut self.carrier else {
            return false;
        };

        match carrier.usb_update_request(&self.device) {
            Ok(request) => request,
            Err(e) => {
                error!("ERROR: fwupdate_getUsbUpdateReq() failed! {e:#}");
                false
            }
        }
    }

    /// Largest image the download partition holds, 0 if unknown.
    pub fn max_image_size(&self) -> u32 {
        match self.env.get("mtd_download_size").map(str::parse::<u32>) {
            Some(Ok(kib)) => kib.saturating_mul(1024),
            Some(Err(_)) => {
                warn!("mtd_download_size is not a number, not limiting image size");
                0
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::device::{CarrierKind, SimAdc, SimGpio};
    use crate::flags::reset::{ResetCause, SimPmic};
    use crate::flags::SimRegister;

    const LAYOUT: NandLayout = NandLayout {
        blocks: 2048,
        pages_per_block: 64,
        bytes_per_page: 2048,
        oob_bytes_per_page: 64,
    };

    fn context(reg: u32) -> BootContext<SimRegister> {
        BootContext::new(
            Environment::new(),
            Constants::default(),
            FlagStore::new(SimRegister(reg)),
            LAYOUT,
        )
    }

    #[test]
    fn test_parse_decimal() {
        assert_eq!(parse_decimal("6"), 6);
        assert_eq!(parse_decimal(" 12abc"), 12);
        assert_eq!(parse_decimal("x"), 0);
    }

    #[test]
    fn test_fwupdate_init() {
        let mut ctx = context(0);
        ctx.env.set("bootlimit", "3");
        ctx.fwupdate_init();
        assert_eq!(ctx.bootlimit(), 3);

        let mut ctx = context(0);
        ctx.fwupdate_init();
        assert_eq!(ctx.env.get("bootlimit"), Some("6"));
    }

    #[test]
    fn test_boot_sequence() -> anyhow::Result<()> {
        let mut ctx = context(0x0000_0301);
        let mut pmic = SimPmic::power_on();
        let mut adc1 = SimAdc::new([0x8C0, 0, 0x7C0, 0xFA0, 0, 0, 0, 0]);
        let mut adc2 = SimAdc::new([0, 0, 0x40, 0, 0, 0, 0, 0]);
        let mut gpio = |_nr: u32| -> anyhow::Result<Box<dyn Gpio>> {
            Ok(Box::new(SimGpio::fixed(false)))
        };

        ctx.board_init(BoardHw {
            pmic: &mut pmic,
            adc1: &mut adc1,
            adc2: &mut adc2,
            gpio: &mut gpio,
            adc_timeout: device::ADC_TIMEOUT,
            button_timing: ButtonTiming::default(),
        })?;
        assert_eq!(ctx.device.reset_cause, Some(ResetCause::PowerOn));
        assert_eq!(ctx.device.carrier, CarrierKind::DemoClient);
        assert_eq!(ctx.flags.bootcount_read()?, 0);

        ctx.secure = true;
        ctx.board_late_init()?;
        assert_eq!(ctx.env.get("fit_config"), Some("stream810x_democlient"));
        assert_eq!(ctx.env.get("secure_board"), Some("1"));
        assert_eq!(ctx.env.get("bootlimit"), Some("6"));
        assert!(ctx.env.get("mtdparts").is_some());
        assert_eq!(ctx.env.get("mtd_pagesize"), Some("2048"));
        assert!(ctx.max_image_size() > 0);

        // The demo client's update line is active low
        assert!(ctx.usb_update_request());
        Ok(())
    }

    #[test]
    fn test_bootcount() {
        let mut ctx = context(0);
        ctx.bootcount_store(4);
        assert_eq!(ctx.bootcount_load(), 4);
    }

    #[test]
    fn test_max_image_size() {
        let mut ctx = context(0);
        assert_eq!(ctx.max_image_size(), 0);
        ctx.env.set("mtd_download_size", "1024");
        assert_eq!(ctx.max_image_size(), 1 << 20);
        ctx.env.set("mtd_download_size", "lots");
        assert_eq!(ctx.max_image_size(), 0);
    }
}
