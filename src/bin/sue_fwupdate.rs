//! Runs the firmware update commands against simulated hardware.
//!
//! Each invocation is one boot: board init and late init run first, then the requested command.
//! Persistent state (environment, flag register, constants and the NAND contents) lives in files
//! under `--state-dir`. Variables the command exports are printed to stdout as `NAME=value`, and
//! the command's result becomes the exit status.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use sue_fwupdate::{
    commands::{ConstCommand, FwupCommand, KobsCommand, SfuCommand},
    context::{BoardHw, BootContext},
    device::{
        carrier::{DEMO_FWUP_GPIO, NPB_IN_GPIO},
        ButtonTiming, Gpio, SimAdc, SimGpio, ADC_TIMEOUT,
    },
    env::{Constants, Environment},
    flags::{reset::SimPmic, FileRegister, FlagStore},
    kobs::fcb::CopyEncoder,
    nand::{bch::SimEccRegs, NandLayout, SimNand},
    status::{NoLed, StatusLed, SysfsLed},
    util::parse_hex,
};

fn adc_value(s: &str) -> Result<u16, String> {
    let value = parse_hex(s).map_err(|e| format!("{s:?} is not a hex number: {e}"))?;
    u16::try_from(value).map_err(|_| format!("{s:?} does not fit in 12 bits"))
}

/// The simulated board this boot runs on
#[derive(Args, Debug)]
struct BoardOptions {
    /// Divider readings: module MSB, module LSB, carrier MSB, carrier LSB (hex)
    #[clap(
        long,
        value_delimiter = ',',
        default_value = "0x8c0,0x7c0,0xfa0,0x40",
        value_parser = adc_value
    )]
    adc: Vec<u16>,

    /// Boot as if power was just applied
    #[clap(long)]
    power_on: bool,

    /// Boot with the secure boot fuses burnt
    #[clap(long)]
    secure: bool,

    /// Number of button samples NPB_IN reads as pressed
    #[clap(long, default_value_t = 0)]
    npb_hold: usize,

    /// Assert the demo client's update request line
    #[clap(long)]
    fwup_asserted: bool,
}

impl BoardOptions {
    fn open_gpio(&self, nr: u32) -> Result<Box<dyn Gpio>> {
        let gpio = match nr {
            NPB_IN_GPIO => SimGpio::sequence(vec![true; self.npb_hold], false),
            // Active low
            DEMO_FWUP_GPIO => SimGpio::fixed(!self.fwup_asserted),
            _ => anyhow::bail!("no GPIO {nr} on this board"),
        };
        Ok(Box::new(gpio))
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Boot only, printing what board init found
    Boot,

    /// Inspect, validate and decrypt SFU images
    Sfu {
        /// File standing in for the RAM the image was loaded to
        #[clap(long)]
        image: Option<PathBuf>,

        #[clap(subcommand)]
        cmd: SfuCommand,
    },

    /// Update flags and boot counter
    Fwup {
        #[clap(subcommand)]
        cmd: FwupCommand,
    },

    /// Write the NAND boot structures
    Kobs {
        /// File standing in for the RAM the boot image was loaded to
        #[clap(long)]
        image: PathBuf,

        #[clap(subcommand)]
        cmd: KobsCommand,
    },

    /// Manage the constants partition
    Const {
        #[clap(subcommand)]
        cmd: ConstCommand,
    },
}

#[derive(Parser, Debug)]
#[clap(version, about)]
struct Cli {
    /// Directory holding the environment, flags, constants and NAND image
    #[clap(long, default_value = ".")]
    state_dir: PathBuf,

    /// Layout of the NAND to simulate
    #[clap(long, default_value = "2048x64x2048+64")]
    nand_layout: NandLayout,

    /// Brightness file of the status LED
    #[clap(long)]
    status_led: Option<PathBuf>,

    #[clap(flatten)]
    board: BoardOptions,

    #[clap(subcommand)]
    cmd: Command,
}

struct State {
    env: PathBuf,
    nand: PathBuf,
}

impl State {
    fn new(dir: &Path) -> Self {
        Self {
            env: dir.join("env"),
            nand: dir.join("nand.bin"),
        }
    }
}

fn boot(cli: &Cli) -> Result<BootContext<FileRegister>> {
    let state = State::new(&cli.state_dir);
    let env = Environment::load(&state.env)?;
    let constants = Constants::open(cli.state_dir.join("constants"))?;
    let flags = FlagStore::new(FileRegister::new(cli.state_dir.join("flags")));

    let mut ctx = BootContext::new(env, constants, flags, cli.nand_layout);
    ctx.secure = cli.board.secure;

    let mut pmic = if cli.board.power_on {
        SimPmic::power_on()
    } else {
        SimPmic::default()
    };
    let [mm, ml, cm, cl] = <[u16; 4]>::try_from(cli.board.adc.as_slice())
        .context("expected four ADC values")?;
    let mut adc1 = SimAdc::new([mm, 0, ml, cm, 0, 0, 0, 0]);
    let mut adc2 = SimAdc::new([0, 0, cl, 0, 0, 0, 0, 0]);
    let mut gpio = |nr: u32| cli.board.open_gpio(nr);

    ctx.board_init(BoardHw {
        pmic: &mut pmic,
        adc1: &mut adc1,
        adc2: &mut adc2,
        gpio: &mut gpio,
        adc_timeout: ADC_TIMEOUT,
        button_timing: ButtonTiming::default(),
    })
    .context("board init failed")?;
    ctx.board_late_init().context("board late init failed")?;

    Ok(ctx)
}

fn load_nand(path: &Path, layout: NandLayout) -> Result<SimNand> {
    let mut nand = SimNand::new(layout);
    if path.exists() {
        nand.load(&mut File::open(path)?)
            .with_context(|| format!("loading {}", path.display()))?;
    }
    Ok(nand)
}

fn read_image(path: Option<&Path>) -> Result<Vec<u8>> {
    let path = path.context("this command needs --image")?;
    fs::read(path).with_context(|| format!("reading {}", path.display()))
}

fn run(cli: &Cli) -> Result<i32> {
    let state = State::new(&cli.state_dir);
    let mut ctx = boot(cli)?;
    let mut stdout = io::stdout();

    let code = match &cli.cmd {
        Command::Boot => {
            println!("{}", ctx.device);
            0
        }

        Command::Sfu { image, cmd } => {
            let mut led: Box<dyn StatusLed> = match &cli.status_led {
                Some(path) => Box::new(SysfsLed::open(path)),
                None => Box::new(NoLed),
            };

            let mut ram = if cmd.needs_image() {
                read_image(image.as_deref())?
            } else {
                Vec::new()
            };

            let code = cmd.run(&mut ctx, &mut ram, led.as_mut());

            if cmd.modifies_image() && code == 0 {
                if let Some(path) = image {
                    fs::write(path, &ram)
                        .with_context(|| format!("writing {}", path.display()))?;
                }
            }
            code
        }

        Command::Fwup { cmd } => cmd.run(&mut ctx, &mut stdout)?,

        Command::Kobs { image, cmd } => {
            let ram = read_image(Some(image.as_path()))?;
            let mut nand = load_nand(&state.nand, cli.nand_layout)?;
            let mut regs = SimEccRegs::new();

            let code = cmd.run(&mut nand, &mut regs, &mut CopyEncoder, &ram);
            nand.save(&mut File::create(&state.nand)?)?;
            code
        }

        Command::Const { cmd } => cmd.run(&mut ctx, &mut stdout)?,
    };

    for (name, value) in ctx.env.locals() {
        println!("{name}={value}");
    }
    ctx.env.save(&state.env)?;

    Ok(code)
}

fn main() -> Result<ExitCode> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let code = run(&cli)?;
    Ok(ExitCode::from(code.clamp(0, 255) as u8))
}
