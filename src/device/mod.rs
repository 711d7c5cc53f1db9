//! Identifying the module and carrier board from the resistor dividers read by the ADCs.
//!
//! Each board has two dividers (MSB and LSB). The ADC reading of a divider falls into one of 30
//! ranges, giving a 5-bit code; the (MSB, LSB) code pair then selects the board type and revision.

pub mod carrier;

use std::fmt;
use std::time::Duration;

use bitflags::bitflags;
use log::debug;
use retry::{delay::Fixed, retry, OperationResult};

use crate::flags::reset::ResetCause;

pub use carrier::{select_carrier, ButtonTiming, Carrier, DemoClient, GenericBoard, Gpio, SimGpio};

/// How often a running conversion is checked on
pub const ADC_POLL_INTERVAL: Duration = Duration::from_millis(1);

/// Default bound on a single conversion
pub const ADC_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
#[error("timed out after {0:?}")]
pub struct Timeout(pub Duration);

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum DetectError {
    #[error("ADC value {0:#06x} is outside every code range")]
    AdcValue(u16),
}

struct AdcRange {
    code: u8,
    min: u16,
    max: u16,
}

const fn range(code: u8, min: u16, max: u16) -> AdcRange {
    AdcRange { code, min, max }
}

/// Half-open `[min, max)` ranges of 12-bit readings
const ADC_MAP: &[AdcRange] = &[
    range(0x01, 0x0000, 0x0088),
    range(0x02, 0x0088, 0x0111),
    range(0x03, 0x0111, 0x0199),
    range(0x04, 0x0199, 0x0222),
    range(0x05, 0x0222, 0x02AA),
    range(0x06, 0x02AA, 0x0333),
    range(0x07, 0x0333, 0x03BB),
    range(0x08, 0x03BB, 0x0444),
    range(0x09, 0x0444, 0x04CC),
    range(0x0A, 0x04CC, 0x0555),
    range(0x0B, 0x0555, 0x05DD),
    range(0x0C, 0x05DD, 0x0666),
    range(0x0D, 0x0666, 0x06EE),
    range(0x0E, 0x06EE, 0x0777),
    range(0x0F, 0x0777, 0x07FF),
    range(0x10, 0x07FF, 0x0888),
    range(0x11, 0x0888, 0x0910),
    range(0x12, 0x0910, 0x0999),
    range(0x13, 0x0999, 0x0A21),
    range(0x14, 0x0A21, 0x0AAA),
    range(0x15, 0x0AAA, 0x0B32),
    range(0x16, 0x0B32, 0x0BBB),
    range(0x17, 0x0BBB, 0x0C43),
    range(0x18, 0x0C43, 0x0CCC),
    range(0x19, 0x0CCC, 0x0D54),
    range(0x1A, 0x0D54, 0x0DDD),
    range(0x1B, 0x0DDD, 0x0E65),
    range(0x1C, 0x0E65, 0x0EEE),
    range(0x1D, 0x0EEE, 0x0F76),
    range(0x1E, 0x0F76, 0x0FFF),
];

pub fn adc_code(value: u16) -> Option<u8> {
    ADC_MAP
        .iter()
        .find(|r| value >= r.min && value < r.max)
        .map(|r| r.code)
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Module {
    #[default]
    Unknown,
    S810Basic,
    S810Extended,
    S810ExtendedPlus,
    S810Basic44W,
}

impl Module {
    pub fn name(self) -> &'static str {
        match self {
            Module::Unknown => "unknown",
            Module::S810Basic => "stream810 basic",
            Module::S810Extended => "stream810 extended",
            Module::S810ExtendedPlus => "stream810 extended plus",
            Module::S810Basic44W => "stream810 basic 4.4W",
        }
    }

    /// Name usable in FIT configuration names
    pub fn canonical_name(self) -> &'static str {
        match self {
            Module::Unknown => "unknown",
            Module::S810Basic => "stream810b",
            Module::S810Extended => "stream810x",
            Module::S810ExtendedPlus => "stream810h",
            Module::S810Basic44W => "stream810b_44w",
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum CarrierKind {
    #[default]
    Unknown,
    DemoClient,
    HeDemoClient,
    StreamkitGo,
    StreamkitPrime,
    FactoryTester,
}

impl CarrierKind {
    pub fn name(self) -> &'static str {
        match self {
            CarrierKind::Unknown => "unknown",
            CarrierKind::DemoClient => "demo client",
            CarrierKind::HeDemoClient => "highend demo client",
            CarrierKind::StreamkitGo => "StreamKit Go",
            CarrierKind::StreamkitPrime => "StreamKit Prime",
            CarrierKind::FactoryTester => "factory tester",
        }
    }

    pub fn canonical_name(self) -> &'static str {
        match self {
            CarrierKind::Unknown => "unknown",
            CarrierKind::DemoClient => "democlient",
            CarrierKind::HeDemoClient => "hedemoclient",
            CarrierKind::StreamkitGo => "streamkitgo",
            CarrierKind::StreamkitPrime => "streamkitprime",
            CarrierKind::FactoryTester => "factory",
        }
    }
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
pub enum Daughter {
    #[default]
    Unknown,
    Empty,
    Highend,
    Voice,
}

impl Daughter {
    pub fn name(self) -> &'static str {
        match self {
            Daughter::Unknown => "unknown",
            Daughter::Empty => "empty",
            Daughter::Highend => "highend",
            Daughter::Voice => "voice",
        }
    }

    pub fn canonical_name(self) -> &'static str {
        self.name()
    }
}

bitflags! {
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct CarrierFlags: u8 {
        /// The carrier LSB divider identifies a daughter board instead
        const HAS_DAUGHTER = 1 << 0;
    }
}

struct ModuleEntry(Module, u8, u8, u8);

const MODULE_MAP: &[ModuleEntry] = &[
    ModuleEntry(Module::S810Basic, 2, 0x11, 0x0A),
    ModuleEntry(Module::S810Basic, 3, 0x11, 0x06),
    ModuleEntry(Module::S810Extended, 2, 0x11, 0x0F),
    ModuleEntry(Module::S810Extended, 3, 0x11, 0x11),
    ModuleEntry(Module::S810ExtendedPlus, 2, 0x11, 0x0C),
    ModuleEntry(Module::S810ExtendedPlus, 3, 0x11, 0x18),
    ModuleEntry(Module::S810Basic44W, 4, 0x11, 0x04),
];

struct CarrierEntry(CarrierKind, u8, u8, u8, CarrierFlags);

// All demo client revisions share the same resistors. On a basic module the LSB always reads as
// 0x01, which is taken to be a plain demo client.
const CARRIER_MAP: &[CarrierEntry] = &[
    CarrierEntry(CarrierKind::DemoClient, 0, 0x1E, 0x01, CarrierFlags::empty()),
    CarrierEntry(CarrierKind::HeDemoClient, 0, 0x1E, 0x1E, CarrierFlags::empty()),
    CarrierEntry(CarrierKind::StreamkitGo, 2, 0x15, 0x01, CarrierFlags::empty()),
    CarrierEntry(CarrierKind::StreamkitGo, 2, 0x16, 0x01, CarrierFlags::empty()),
    CarrierEntry(CarrierKind::StreamkitPrime, 0, 0x04, 0x00, CarrierFlags::HAS_DAUGHTER),
    CarrierEntry(CarrierKind::FactoryTester, 0, 0x19, 0x01, CarrierFlags::empty()),
    CarrierEntry(CarrierKind::FactoryTester, 0, 0x06, 0x18, CarrierFlags::empty()),
    CarrierEntry(CarrierKind::FactoryTester, 1, 0x03, 0x01, CarrierFlags::empty()),
    CarrierEntry(CarrierKind::FactoryTester, 1, 0x03, 0x18, CarrierFlags::empty()),
];

const DAUGHTER_MAP: &[(Daughter, u8, u8)] = &[
    (Daughter::Empty, 0, 0x01),
    (Daughter::Highend, 0, 0x11),
    (Daughter::Voice, 0, 0x13),
];

/// Everything learned about the hardware at boot
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct DeviceInfo {
    pub reset_cause: Option<ResetCause>,

    /// Raw readings: module MSB, module LSB, carrier MSB, carrier LSB
    pub adc_values: [u16; 4],
    pub codes: [u8; 4],

    pub module: Module,
    pub module_version: u8,

    pub carrier: CarrierKind,
    pub carrier_version: u8,
    pub carrier_flags: CarrierFlags,

    pub daughter: Daughter,
    pub daughter_version: u8,
}

impl DeviceInfo {
    /// Decode the four divider readings. Unmatched code pairs leave the type `Unknown`.
    pub fn from_adc_values(adc_values: [u16; 4]) -> Result<Self, DetectError> {
        let mut codes = [0; 4];
        for (code, &value) in codes.iter_mut().zip(&adc_values) {
            *code = adc_code(value).ok_or(DetectError::AdcValue(value))?;
        }
        let [module_msb, module_lsb, carrier_msb, carrier_lsb] = codes;

        let mut info = Self {
            adc_values,
            codes,
            ..Default::default()
        };

        if let Some(ModuleEntry(module, version, ..)) = MODULE_MAP
            .iter()
            .find(|e| (e.2, e.3) == (module_msb, module_lsb))
        {
            info.module = *module;
            info.module_version = *version;
        }

        let carrier = CARRIER_MAP.iter().find(|e| {
            if e.4.contains(CarrierFlags::HAS_DAUGHTER) {
                e.2 == carrier_msb
            } else {
                (e.2, e.3) == (carrier_msb, carrier_lsb)
            }
        });
        if let Some(CarrierEntry(carrier, version, _, _, flags)) = carrier {
            info.carrier = *carrier;
            info.carrier_version = *version;
            info.carrier_flags = *flags;

            if flags.contains(CarrierFlags::HAS_DAUGHTER) {
                if let Some((daughter, version, _)) =
                    DAUGHTER_MAP.iter().find(|e| e.2 == carrier_lsb)
                {
                    info.daughter = *daughter;
                    info.daughter_version = *version;
                }
            }
        }

        Ok(info)
    }

    pub fn has_daughter(&self) -> bool {
        self.carrier_flags.contains(CarrierFlags::HAS_DAUGHTER)
    }

    /// `<module>_<carrier>[_<daughter>]`, selecting the FIT configuration to boot
    pub fn fit_config(&self) -> String {
        let mut config = format!(
            "{}_{}",
            self.module.canonical_name(),
            self.carrier.canonical_name()
        );
        if self.has_daughter() {
            config.push('_');
            config.push_str(self.daughter.canonical_name());
        }
        config
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [mm, ml, cm, cl] = self.adc_values;
        writeln!(
            f,
            "ADC values: Module: {mm:#06x} {ml:#06x}, Carrier board: {cm:#06x} {cl:#06x}"
        )?;
        let [mm, ml, cm, cl] = self.codes;
        writeln!(
            f,
            "Codes     : Module:   {mm:#04x}   {ml:#04x}, Carrier board:   {cm:#04x}   {cl:#04x}"
        )?;
        writeln!(
            f,
            "Module    : {} (L{})",
            self.module.name(),
            self.module_version
        )?;
        write!(
            f,
            "Carrier   : {} (L{})",
            self.carrier.name(),
            self.carrier_version
        )?;
        if self.has_daughter() {
            write!(
                f,
                "\nDaughter  : {} (L{})",
                self.daughter.name(),
                self.daughter_version
            )?;
        }
        Ok(())
    }
}

/// One analog-to-digital converter with several input channels
pub trait Adc {
    fn start_conversion(&mut self, channel: u8) -> anyhow::Result<()>;
    fn conversion_done(&mut self) -> anyhow::Result<bool>;
    fn result(&mut self) -> anyhow::Result<u16>;
}

/// Convert one channel, giving up with [`Timeout`] after `timeout`.
pub fn read_channel<A: Adc + ?Sized>(
    adc: &mut A,
    channel: u8,
    timeout: Duration,
) -> anyhow::Result<u16> {
    adc.start_conversion(channel)?;

    let polls = timeout.as_millis() / ADC_POLL_INTERVAL.as_millis().max(1);
    let done = retry(Fixed::from(ADC_POLL_INTERVAL).take(polls as usize), || {
        match adc.conversion_done() {
            Ok(true) => OperationResult::Ok(()),
            Ok(false) => OperationResult::Retry(None),
            Err(e) => OperationResult::Err(Some(e)),
        }
    });

    match done {
        Ok(()) => adc.result(),
        Err(retry::Error { error: Some(e), .. }) => Err(e),
        Err(retry::Error { error: None, .. }) => Err(Timeout(timeout).into()),
    }
}

/// Read the four dividers (module MSB/LSB on ADC1 channels 0 and 2, carrier MSB on ADC1
/// channel 3, carrier LSB on ADC2 channel 2) and decode them.
pub fn detect(
    adc1: &mut dyn Adc,
    adc2: &mut dyn Adc,
    timeout: Duration,
) -> anyhow::Result<DeviceInfo> {
    let values = [
        read_channel(adc1, 0, timeout)?,
        read_channel(adc1, 2, timeout)?,
        read_channel(adc1, 3, timeout)?,
        read_channel(adc2, 2, timeout)?,
    ];
    debug!("ADC readings: {values:04x?}");

    Ok(DeviceInfo::from_adc_values(values)?)
}

/// A simulated ADC that finishes each conversion after a fixed number of polls
#[derive(Debug, Clone)]
pub struct SimAdc {
    channels: [u16; 8],

    /// Polls a conversion takes; `None` never finishes
    latency: Option<u32>,
    pending: Option<(u8, u32)>,
    result: u16,
}

impl SimAdc {
    pub fn new(channels: [u16; 8]) -> Self {
        Self {
            channels,
            latency: Some(2),
            pending: None,
            result: 0,
        }
    }

    /// An ADC whose conversions never complete
    pub fn stuck() -> Self {
        Self {
            latency: None,
            ..Self::new([0; 8])
        }
    }
}

impl Adc for SimAdc {
    fn start_conversion(&mut self, channel: u8) -> anyhow::Result<()> {
        anyhow::ensure!((channel as usize) < self.channels.len(), "no channel {channel}");
        self.pending = Some((channel, 0));
        Ok(())
    }

    fn conversion_done(&mut self) -> anyhow::Result<bool> {
        let Some((channel, polls)) = self.pending else {
            anyhow::bail!("no conversion running");
        };

        match self.latency {
            Some(latency) if polls >= latency => {
                self.result = self.channels[channel as usize];
                self.pending = None;
                Ok(true)
            }
            _ => {
                self.pending = Some((channel, polls + 1));
                Ok(false)
            }
        }
    }

    fn result(&mut self) -> anyhow::Result<u16> {
        Ok(self.result)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn info(codes: [u8; 4]) -> DeviceInfo {
        // Midpoint of each code's range
        let values = codes.map(|code| {
            let r = &ADC_MAP[code as usize - 1];
            (r.min + r.max) / 2
        });
        DeviceInfo::from_adc_values(values).unwrap()
    }

    #[test]
    fn test_adc_code() {
        assert_eq!(adc_code(0), Some(0x01));
        assert_eq!(adc_code(0x87), Some(0x01));
        assert_eq!(adc_code(0x88), Some(0x02));
        assert_eq!(adc_code(0xFFE), Some(0x1E));
        assert_eq!(adc_code(0xFFF), None);
    }

    #[test]
    fn test_identify() {
        let dev = info([0x11, 0x0F, 0x1E, 0x01]);
        assert_eq!((dev.module, dev.module_version), (Module::S810Extended, 2));
        assert_eq!(dev.carrier, CarrierKind::DemoClient);
        assert_eq!(dev.fit_config(), "stream810x_democlient");

        let dev = info([0x11, 0x04, 0x03, 0x18]);
        assert_eq!((dev.module, dev.module_version), (Module::S810Basic44W, 4));
        assert_eq!((dev.carrier, dev.carrier_version), (CarrierKind::FactoryTester, 1));

        let dev = info([0x01, 0x01, 0x1E, 0x05]);
        assert_eq!(dev.module, Module::Unknown);
        assert_eq!(dev.carrier, CarrierKind::Unknown);
        assert_eq!(dev.fit_config(), "unknown_unknown");
    }

    #[test]
    fn test_daughter_board() {
        // Matched on MSB alone; LSB picks the daughter
        let dev = info([0x11, 0x18, 0x04, 0x13]);
        assert_eq!(dev.carrier, CarrierKind::StreamkitPrime);
        assert_eq!(dev.daughter, Daughter::Voice);
        assert_eq!(dev.fit_config(), "stream810h_streamkitprime_voice");
        assert!(dev.to_string().ends_with("Daughter  : voice (L0)"));

        let dev = info([0x11, 0x18, 0x04, 0x02]);
        assert_eq!(dev.daughter, Daughter::Unknown);
        assert_eq!(dev.fit_config(), "stream810h_streamkitprime_unknown");
    }

    #[test]
    fn test_out_of_range() {
        assert_eq!(
            DeviceInfo::from_adc_values([0, 0, 0xFFF, 0]),
            Err(DetectError::AdcValue(0xFFF))
        );
    }

    #[test]
    fn test_detect() -> anyhow::Result<()> {
        let mut adc1 = SimAdc::new([0x8C0, 0, 0x7C0, 0xFA0, 0, 0, 0, 0]);
        let mut adc2 = SimAdc::new([0, 0, 0x40, 0, 0, 0, 0, 0]);

        let dev = detect(&mut adc1, &mut adc2, ADC_TIMEOUT)?;
        assert_eq!(dev.adc_values, [0x8C0, 0x7C0, 0xFA0, 0x40]);
        assert_eq!(dev.codes, [0x11, 0x0F, 0x1E, 0x01]);
        Ok(())
    }

    #[test]
    fn test_read_timeout() {
        let mut adc = SimAdc::stuck();
        let err = read_channel(&mut adc, 0, Duration::from_millis(5)).unwrap_err();
        assert!(err.downcast_ref::<Timeout>().is_some());

        assert!(read_channel(&mut adc, 9, ADC_TIMEOUT).is_err());
    }
}
