//! Carrier-board specific behavior: how a firmware update is requested by the user.

use std::collections::VecDeque;
use std::thread;
use std::time::Duration;

use log::{info, warn};

use super::{CarrierKind, DeviceInfo, Timeout};

/// Linux-style GPIO number of `bank` (1-based) and `pin`
pub const fn imx_gpio_nr(bank: u32, pin: u32) -> u32 {
    (bank - 1) * 32 + pin
}

/// The NPB_IN push button, also the demo client's alternate update button
pub const NPB_IN_GPIO: u32 = imx_gpio_nr(3, 21);

/// The demo client's update request line, low when asserted
pub const DEMO_FWUP_GPIO: u32 = imx_gpio_nr(6, 20);

/// A single input line
pub trait Gpio {
    fn direction_input(&mut self) -> anyhow::Result<()>;
    fn get(&mut self) -> anyhow::Result<bool>;
}

/// An input that plays back a fixed sequence of levels, then holds the last one
#[derive(Debug, Clone, Default)]
pub struct SimGpio {
    levels: VecDeque<bool>,
    last: bool,
}

impl SimGpio {
    pub fn fixed(level: bool) -> Self {
        Self {
            levels: VecDeque::new(),
            last: level,
        }
    }

    pub fn sequence(levels: impl IntoIterator<Item = bool>, then: bool) -> Self {
        Self {
            levels: levels.into_iter().collect(),
            last: then,
        }
    }
}

impl Gpio for SimGpio {
    fn direction_input(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn get(&mut self) -> anyhow::Result<bool> {
        Ok(self.levels.pop_front().unwrap_or(self.last))
    }
}

/// How long a button must be held, and how it is sampled
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ButtonTiming {
    pub hold: Duration,
    pub poll: Duration,

    /// Give up on a button that never gets released
    pub max_wait: Duration,
}

impl Default for ButtonTiming {
    fn default() -> Self {
        Self {
            hold: Duration::from_millis(3000),
            poll: Duration::from_millis(100),
            max_wait: Duration::from_secs(60),
        }
    }
}

/// Board hooks run during boot
pub trait Carrier {
    fn init(&mut self, device: &DeviceInfo) -> anyhow::Result<()>;
    fn late_init(&mut self, device: &DeviceInfo) -> anyhow::Result<()>;
    fn usb_update_request(&mut self, device: &DeviceInfo) -> anyhow::Result<bool>;
}

/// Boards with only the NPB_IN button: holding it through boot requests an update.
pub struct GenericBoard {
    button: Box<dyn Gpio>,
    timing: ButtonTiming,
    request: bool,
}

impl GenericBoard {
    pub fn new(button: Box<dyn Gpio>, timing: ButtonTiming) -> Self {
        Self {
            button,
            timing,
            request: false,
        }
    }
}

impl Carrier for GenericBoard {
    fn init(&mut self, _device: &DeviceInfo) -> anyhow::Result<()> {
        self.button.direction_input()
    }

    fn late_init(&mut self, _device: &DeviceInfo) -> anyhow::Result<()> {
        let mut held = Duration::ZERO;
        let mut was_pressed = false;

        while self.button.get()? {
            was_pressed = true;

            if held > self.timing.hold && !self.request {
                info!("fwup request set, release NPB_IN now");
                self.request = true;
            }
            if held > self.timing.max_wait {
                warn!("NPB_IN still pressed after {:?}", self.timing.max_wait);
                return Err(Timeout(self.timing.max_wait).into());
            }

            thread::sleep(self.timing.poll);
            held += self.timing.poll;
        }

        // Debounce the release
        if was_pressed {
            thread::sleep(self.timing.poll);
        }

        Ok(())
    }

    fn usb_update_request(&mut self, _device: &DeviceInfo) -> anyhow::Result<bool> {
        Ok(self.request)
    }
}

/// The demo client family: a dedicated update line, plus NPB_IN as an alternate button.
pub struct DemoClient {
    fwup: Box<dyn Gpio>,
    alt_fwup: Box<dyn Gpio>,
    timing: ButtonTiming,
    alt_request: bool,
}

impl DemoClient {
    pub fn new(fwup: Box<dyn Gpio>, alt_fwup: Box<dyn Gpio>, timing: ButtonTiming) -> Self {
        Self {
            fwup,
            alt_fwup,
            timing,
            alt_request: false,
        }
    }
}

impl Carrier for DemoClient {
    fn init(&mut self, _device: &DeviceInfo) -> anyhow::Result<()> {
        self.fwup.direction_input()?;
        self.alt_fwup.direction_input()
    }

    fn late_init(&mut self, _device: &DeviceInfo) -> anyhow::Result<()> {
        let mut held = Duration::ZERO;

        while self.alt_fwup.get()? {
            if held > self.timing.hold {
                info!("Alt fwup request set");
                self.alt_request = true;
                break;
            }

            thread::sleep(self.timing.poll);
            held += self.timing.poll;
        }

        Ok(())
    }

    fn usb_update_request(&mut self, _device: &DeviceInfo) -> anyhow::Result<bool> {
        Ok(self.alt_request || !self.fwup.get()?)
    }
}

/// Pick the hooks for a detected carrier. Factory testers have none.
///
/// `open` hands out the GPIO with the given number.
pub fn select_carrier(
    device: &DeviceInfo,
    timing: ButtonTiming,
    open: &mut dyn FnMut(u32) -> anyhow::Result<Box<dyn Gpio>>,
) -> anyhow::Result<Option<Box<dyn Carrier>>> {
    let carrier: Box<dyn Carrier> = match device.carrier {
        CarrierKind::DemoClient
        | CarrierKind::HeDemoClient
        | CarrierKind::StreamkitGo
        | CarrierKind::StreamkitPrime => Box::new(DemoClient::new(
            open(DEMO_FWUP_GPIO)?,
            open(NPB_IN_GPIO)?,
            timing,
        )),
        CarrierKind::Unknown => Box::new(GenericBoard::new(open(NPB_IN_GPIO)?, timing)),
        CarrierKind::FactoryTester => return Ok(None),
    };

    Ok(Some(carrier))
}

#[cfg(test)]
mod test {
    use super::*;

    const FAST: ButtonTiming = ButtonTiming {
        hold: Duration::from_millis(5),
        poll: Duration::from_millis(1),
        max_wait: Duration::from_millis(50),
    };

    #[test]
    fn test_generic_board() -> anyhow::Result<()> {
        let dev = DeviceInfo::default();

        // Released early: no request
        let mut board = GenericBoard::new(Box::new(SimGpio::sequence([true; 3], false)), FAST);
        board.init(&dev)?;
        board.late_init(&dev)?;
        assert!(!board.usb_update_request(&dev)?);

        let mut board = GenericBoard::new(Box::new(SimGpio::sequence([true; 10], false)), FAST);
        board.late_init(&dev)?;
        assert!(board.usb_update_request(&dev)?);
        Ok(())
    }

    #[test]
    fn test_generic_board_stuck_button() {
        let dev = DeviceInfo::default();
        let mut board = GenericBoard::new(Box::new(SimGpio::fixed(true)), FAST);

        let err = board.late_init(&dev).unwrap_err();
        assert!(err.downcast_ref::<Timeout>().is_some());
        // The request was still recognized before giving up
        assert!(board.usb_update_request(&dev).unwrap());
    }

    #[test]
    fn test_demo_client() -> anyhow::Result<()> {
        let dev = DeviceInfo::default();

        // Update line is active low
        let mut board = DemoClient::new(
            Box::new(SimGpio::sequence([true, false], true)),
            Box::new(SimGpio::fixed(false)),
            FAST,
        );
        board.late_init(&dev)?;
        assert!(!board.usb_update_request(&dev)?);
        assert!(board.usb_update_request(&dev)?);

        // A held alternate button latches, and never blocks
        let mut board = DemoClient::new(
            Box::new(SimGpio::fixed(true)),
            Box::new(SimGpio::fixed(true)),
            FAST,
        );
        board.late_init(&dev)?;
        assert!(board.usb_update_request(&dev)?);
        Ok(())
    }

    #[test]
    fn test_select_carrier() -> anyhow::Result<()> {
        let mut opened = Vec::new();
        let mut open = |nr: u32| -> anyhow::Result<Box<dyn Gpio>> {
            opened.push(nr);
            Ok(Box::new(SimGpio::fixed(false)))
        };

        let mut dev = DeviceInfo {
            carrier: CarrierKind::StreamkitGo,
            ..Default::default()
        };
        assert!(select_carrier(&dev, FAST, &mut open)?.is_some());

        dev.carrier = CarrierKind::FactoryTester;
        assert!(select_carrier(&dev, FAST, &mut open)?.is_none());

        dev.carrier = CarrierKind::Unknown;
        assert!(select_carrier(&dev, FAST, &mut open)?.is_some());

        assert_eq!(opened, [180, 85, 85]);
        Ok(())
    }
}
