//! The terminal error state: a console spinner plus an SOS on the status LED, forever.

use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::thread;
use std::time::Duration;

use log::error;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LedState {
    On(Duration),
    Off(Duration),
}
use LedState::*;

impl LedState {
    pub fn get_duration(self) -> Duration {
        match self {
            On(x) => x,
            Off(x) => x,
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, On(_))
    }
}

const DIT: Duration = Duration::from_millis(150);
const DAH: Duration = Duration::from_millis(450);
const GAP: Duration = Duration::from_millis(1050);
pub const LED_ERROR: &[LedState] = &[
    // S ...
    On(DIT),
    Off(DIT),
    On(DIT),
    Off(DIT),
    On(DIT),
    Off(DAH),
    // O ---
    On(DAH),
    Off(DIT),
    On(DAH),
    Off(DIT),
    On(DAH),
    Off(DAH),
    // S ...
    On(DIT),
    Off(DIT),
    On(DIT),
    Off(DIT),
    On(DIT),
    Off(GAP),
];

const SPINNER: &[u8] = b"\\|/-";
const SPINNER_STEP: Duration = Duration::from_secs(1);

pub trait StatusLed {
    fn set(&mut self, on: bool);
}

/// No LED fitted
pub struct NoLed;

impl StatusLed for NoLed {
    fn set(&mut self, _on: bool) {}
}

/// An LED class device under `/sys/class/leds`. Write errors are ignored.
pub struct SysfsLed {
    brightness: Option<fs::File>,
}

impl SysfsLed {
    pub fn open(brightness_path: &Path) -> Self {
        Self {
            brightness: fs::File::options().write(true).open(brightness_path).ok(),
        }
    }
}

impl StatusLed for SysfsLed {
    fn set(&mut self, on: bool) {
        if let Some(f) = &mut self.brightness {
            let _ = f.write_all(if on { b"1\n" } else { b"0\n" });
        }
    }
}

/// Steps through the blink pattern and advances the spinner once a second.
pub struct ErrorIndicator<'a> {
    led: &'a mut dyn StatusLed,
    position: usize,
    spinner: usize,
    since_spin: Duration,
}

impl<'a> ErrorIndicator<'a> {
    pub fn new(led: &'a mut dyn StatusLed) -> Self {
        Self {
            led,
            position: 0,
            spinner: 0,
            since_spin: SPINNER_STEP,
        }
    }

    /// Apply the next LED state, returning how long to hold it.
    pub fn step(&mut self, console: &mut dyn Write) -> Duration {
        if self.since_spin >= SPINNER_STEP {
            let _ = console.write_all(&[b'\x08', SPINNER[self.spinner]]);
            let _ = console.flush();
            self.spinner = (self.spinner + 1) % SPINNER.len();
            self.since_spin = Duration::ZERO;
        }

        let state = LED_ERROR[self.position];
        self.position = (self.position + 1) % LED_ERROR.len();
        self.led.set(state.is_on());

        self.since_spin += state.get_duration();
        state.get_duration()
    }
}

/// Halt the boot. Only an external reset gets out of here.
pub fn error_state(led: &mut dyn StatusLed) -> ! {
    error!("SERIOUS ERROR");

    let mut console = io::stderr();
    let _ = console.write_all(b"SFU: ERROR STATE  -");

    let mut indicator = ErrorIndicator::new(led);
    loop {
        thread::sleep(indicator.step(&mut console));
    }
}
