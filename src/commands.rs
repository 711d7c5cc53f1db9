//! The commands the update script runs: `sfu`, `fwup`, `kobs` and `const`.
//!
//! Every command answers with a shell exit code, 0 meaning success or "yes". Results meant for
//! the script are exported as local variables in the [`Environment`](crate::env::Environment).

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use clap::Subcommand;
use log::{debug, error, info};

use crate::context::BootContext;
use crate::env::ConstError;
use crate::flags::{Register, FWUP_FLAG_FAIL_INDEX, FWUP_FLAG_UPDATE_INDEX};
use crate::kobs::fcb::EccEncoder;
use crate::kobs::kobs_init;
use crate::nand::bch::EccLayout;
use crate::nand::Nand;
use crate::sfu::builder::{Chunk, ImageBuilder};
use crate::sfu::decrypt::decrypt_chunk;
use crate::sfu::{check_magic, validate, HdrFlags, SfuParser, Version};
use crate::status::{error_state, StatusLed};
use crate::util::parse_hex;

fn hex_arg(s: &str) -> Result<u32, String> {
    parse_hex(s).map_err(|e| format!("{s:?} is not a hex number: {e}"))
}

fn exit_code(ok: bool) -> i32 {
    if ok {
        0
    } else {
        1
    }
}

/// The image as seen from `addr`, which is an offset into the loaded image buffer
fn image_at(image: &[u8], addr: u32) -> Option<&[u8]> {
    let image = image.get(addr as usize..);
    if image.is_none() {
        error!("address {addr:#010x} is outside the loaded image");
    }
    image
}

#[derive(Debug, Clone, Subcommand)]
pub enum SfuCommand {
    /// Check the magic number and total length
    Magic {
        #[arg(value_parser = hex_arg)]
        addr: u32,
    },

    /// Check the whole image: header, CRC32 and chunk digests
    Valid {
        #[arg(value_parser = hex_arg)]
        addr: u32,
    },

    /// Export the global version as SFU_GLOB_VERS
    Globver {
        #[arg(value_parser = hex_arg)]
        addr: u32,
    },

    /// Export the number of chunks as SFU_NUM_CHNKS
    Chnknum {
        #[arg(value_parser = hex_arg)]
        addr: u32,
    },

    /// Find a chunk by destination and export its header as SFU_CHNK_*
    Chnkhdr {
        #[arg(value_parser = hex_arg)]
        addr: u32,
        dest: String,
    },

    /// Decrypt `len` bytes at `addr` in place, exporting the plain length as SFU_CHNK_SIZE
    Decrypt {
        #[arg(value_parser = hex_arg)]
        addr: u32,
        #[arg(value_parser = hex_arg)]
        len: u32,
    },

    /// Signal a fatal error; never returns
    Errstate,

    /// Build an image from files
    Pack {
        /// Where to write the image
        output: PathBuf,

        /// Global version, `major.minor.commitcnt.githash` in hex
        #[arg(long, default_value = "0.0.0.0")]
        global_version: Version,

        /// Encrypt every chunk with this key
        #[arg(long)]
        key: Option<String>,

        /// A chunk, as `dest=path`
        #[arg(long = "chunk", required = true)]
        chunks: Vec<String>,
    },
}

impl SfuCommand {
    /// Whether the command operates on a loaded image
    pub fn needs_image(&self) -> bool {
        !matches!(self, SfuCommand::Errstate | SfuCommand::Pack { .. })
    }

    /// Whether the loaded image is changed and should be written back
    pub fn modifies_image(&self) -> bool {
        matches!(self, SfuCommand::Decrypt { .. })
    }

    pub fn run<R: Register>(
        &self,
        ctx: &mut BootContext<R>,
        image: &mut [u8],
        led: &mut dyn StatusLed,
    ) -> i32 {
        match self {
            SfuCommand::Magic { addr } => sfu_magic(ctx, image, *addr),
            SfuCommand::Valid { addr } => sfu_valid(ctx, image, *addr),
            SfuCommand::Globver { addr } => sfu_globver(ctx, image, *addr),
            SfuCommand::Chnknum { addr } => sfu_chnknum(ctx, image, *addr),
            SfuCommand::Chnkhdr { addr, dest } => sfu_chnkhdr(ctx, image, *addr, dest),
            SfuCommand::Decrypt { addr, len } => sfu_decrypt(ctx, image, *addr, *len),
            SfuCommand::Errstate => error_state(led),
            SfuCommand::Pack {
                output,
                global_version,
                key,
                chunks,
            } => match sfu_pack(output, *global_version, key.as_deref(), chunks) {
                Ok(()) => 0,
                Err(e) => {
                    error!("packing failed: {e:#}");
                    1
                }
            },
        }
    }
}

pub fn sfu_magic<R: Register>(ctx: &mut BootContext<R>, image: &[u8], addr: u32) -> i32 {
    let Some(image) = image_at(image, addr) else {
        return 1;
    };

    match check_magic(image, ctx.max_image_size()) {
        Ok(header) => {
            ctx.env
                .set_local("SFU_TOTAL_LEN", format!("0x{:08x}", header.total_length));
            0
        }
        Err(_) => 1,
    }
}

pub fn sfu_valid<R: Register>(ctx: &mut BootContext<R>, image: &[u8], addr: u32) -> i32 {
    let Some(image) = image_at(image, addr) else {
        return 1;
    };

    exit_code(validate(image, ctx.max_image_size()).is_valid())
}

pub fn sfu_globver<R: Register>(ctx: &mut BootContext<R>, image: &[u8], addr: u32) -> i32 {
    let Some(image) = image_at(image, addr) else {
        return 1;
    };

    match SfuParser::from_slice(image).global_version() {
        Ok(version) => {
            debug!("SFU_GLOB_VERS={version}");
            ctx.env.set_local("SFU_GLOB_VERS", version.to_string());
            0
        }
        Err(e) => {
            error!("could not read global version: {e}");
            1
        }
    }
}

pub fn sfu_chnknum<R: Register>(ctx: &mut BootContext<R>, image: &[u8], addr: u32) -> i32 {
    let Some(image) = image_at(image, addr) else {
        return 1;
    };

    match SfuParser::from_slice(image).num_chunks() {
        Ok(count) => {
            ctx.env.set_local("SFU_NUM_CHNKS", format!("0x{count:08x}"));
            0
        }
        Err(e) => {
            error!("could not get the number of chunks: {e}");
            1
        }
    }
}

pub fn sfu_chnkhdr<R: Register>(
    ctx: &mut BootContext<R>,
    image: &[u8],
    addr: u32,
    dest: &str,
) -> i32 {
    let Some(image) = image_at(image, addr) else {
        return 1;
    };

    debug!("Searching for \"{dest}\" chunk...");
    let header = match SfuParser::from_slice(image).find_chunk(dest) {
        Ok((number, header)) => {
            debug!("chunk {number} found");
            header
        }
        Err(e) => {
            debug!("{e}");
            return 1;
        }
    };

    let digest = |present: bool, value: String| if present { value } else { String::new() };
    let exports = [
        ("SFU_CHNK_DATA", format!("0x{:08x}", addr.wrapping_add(header.data))),
        ("SFU_CHNK_DEST", header.dest_str().into_owned()),
        ("SFU_CHNK_SIZE", format!("0x{:08x}", header.size)),
        ("SFU_CHNK_VERS", header.version.to_string()),
        ("SFU_CHNK_ENCM", format!("{:08x}", header.encryption_method)),
        (
            "SFU_CHNK_CR32",
            digest(
                header.hdr_flag.contains(HdrFlags::CR32),
                format!("{:08x}", header.crc32),
            ),
        ),
        (
            "SFU_CHNK_MD5_",
            digest(header.hdr_flag.contains(HdrFlags::MD5_), header.md5_hex()),
        ),
        (
            "SFU_CHNK_SHA2",
            digest(header.hdr_flag.contains(HdrFlags::SHA2), header.sha256_hex()),
        ),
    ];

    for (name, value) in exports {
        debug!("{name}={value}");
        ctx.env.set_local(name, value);
    }
    0
}

pub fn sfu_decrypt<R: Register>(
    ctx: &mut BootContext<R>,
    image: &mut [u8],
    addr: u32,
    len: u32,
) -> i32 {
    let key = match ctx.constants.getconst("key") {
        Some(key) if !key.is_empty() => key.as_bytes().to_vec(),
        _ => {
            error!("ERROR: key constants variable not set");
            return 1;
        }
    };

    let start = addr as usize;
    let Some(region) = start
        .checked_add(len as usize)
        .and_then(|end| image.get_mut(start..end))
    else {
        error!("{len:#x} bytes at {addr:#010x} are outside the loaded image");
        return 1;
    };

    match decrypt_chunk(&key, region) {
        Ok(original) => {
            ctx.env.set_local("SFU_CHNK_SIZE", format!("0x{original:08x}"));
            0
        }
        Err(e) => {
            error!("decrypt failed: {e}");
            1
        }
    }
}

/// Write an image holding the given `dest=path` chunks to `output`.
pub fn sfu_pack(
    output: &Path,
    version: Version,
    key: Option<&str>,
    chunks: &[String],
) -> anyhow::Result<()> {
    let mut builder = ImageBuilder::new(version);
    for arg in chunks {
        let Some((dest, path)) = arg.split_once('=') else {
            anyhow::bail!("chunk {arg:?} is not dest=path");
        };

        let payload = fs::read(path)?;
        let mut chunk = Chunk::new(dest, version, payload);
        if let Some(key) = key {
            chunk = chunk.encrypted(key.as_bytes())?;
        }
        builder = builder.chunk(chunk.with_crc32().with_md5().with_sha256());
    }

    let image = builder.build()?;
    fs::write(output, &image)?;
    info!("wrote {} bytes to {}", image.len(), output.display());
    Ok(())
}

#[derive(Debug, Clone, Subcommand)]
pub enum FwupCommand {
    /// Clear the `update` or `fail` flag
    Clear { flag: String },

    /// Print the flags and the boot counter
    Flags,

    /// Set the `update` or `fail` flag
    Set { flag: String },

    /// Succeed if the update flag is set
    Update,

    /// Succeed if the user requested an update from USB
    #[command(name = "usb_update_req")]
    UsbUpdateReq,

    /// Succeed if the fail flag is set
    Fail,

    /// Increment the boot counter
    Incbootcnt,

    /// Succeed while the boot counter is below `bootlimit`
    Bootcnt,

    /// Rebuild the partition table from the NAND geometry
    Mtdparts,
}

fn flag_index(name: &str) -> Option<u8> {
    match name {
        "update" => Some(FWUP_FLAG_UPDATE_INDEX),
        "fail" => Some(FWUP_FLAG_FAIL_INDEX),
        _ => None,
    }
}

impl FwupCommand {
    pub fn run<R: Register>(
        &self,
        ctx: &mut BootContext<R>,
        out: &mut dyn Write,
    ) -> anyhow::Result<i32> {
        let code = match self {
            FwupCommand::Clear { flag } => fwup_set_flag(ctx, flag, false),
            FwupCommand::Set { flag } => fwup_set_flag(ctx, flag, true),
            FwupCommand::Flags => {
                let fail = ctx.flags.flag_read(FWUP_FLAG_FAIL_INDEX).unwrap_or(0);
                let update = ctx.flags.flag_read(FWUP_FLAG_UPDATE_INDEX).unwrap_or(0);
                let bootcount = ctx.flags.bootcount_read().unwrap_or(0);
                writeln!(
                    out,
                    "INFO: flags: bootcount: {bootcount}, fail: {fail}, update: {update}"
                )?;
                0
            }
            FwupCommand::Update => fwup_check_flag(ctx, FWUP_FLAG_UPDATE_INDEX),
            FwupCommand::Fail => fwup_check_flag(ctx, FWUP_FLAG_FAIL_INDEX),
            FwupCommand::UsbUpdateReq => exit_code(ctx.usb_update_request()),
            FwupCommand::Incbootcnt => {
                let count = match ctx.flags.bootcount_read() {
                    Ok(count) => count,
                    Err(e) => {
                        error!("reading boot count failed: {e:#}");
                        return Ok(1);
                    }
                };
                match ctx.flags.bootcount_write(count.wrapping_add(1)) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("writing boot count failed: {e:#}");
                        1
                    }
                }
            }
            FwupCommand::Bootcnt => match ctx.flags.bootcount_read() {
                Ok(count) => exit_code((count as u32) < ctx.bootlimit()),
                Err(e) => {
                    error!("reading boot count failed: {e:#}");
                    1
                }
            },
            FwupCommand::Mtdparts => match ctx.setup_mtdparts() {
                Ok(()) => 0,
                Err(e) => {
                    error!("{e}");
                    1
                }
            },
        };
        Ok(code)
    }
}

/// Unknown flag names are accepted and ignored.
fn fwup_set_flag<R: Register>(ctx: &mut BootContext<R>, name: &str, value: bool) -> i32 {
    let Some(index) = flag_index(name) else {
        debug!("ignoring unknown flag {name:?}");
        return 0;
    };

    match ctx.flags.set_flag(index, value) {
        Ok(()) => 0,
        Err(e) => {
            error!("setting flag {name} failed: {e:#}");
            1
        }
    }
}

fn fwup_check_flag<R: Register>(ctx: &mut BootContext<R>, index: u8) -> i32 {
    match ctx.flags.flag(index) {
        Ok(set) => exit_code(set),
        Err(e) => {
            error!("reading flag {index} failed: {e:#}");
            1
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum KobsCommand {
    /// Write the boot control blocks and two copies of the `size` byte boot image at `addr`
    Init {
        #[arg(value_parser = hex_arg)]
        addr: u32,
        #[arg(value_parser = hex_arg)]
        size: u32,
    },
}

impl KobsCommand {
    pub fn run<N: Nand, E: EccLayout + ?Sized>(
        &self,
        nand: &mut N,
        regs: &mut E,
        encoder: &mut dyn EccEncoder,
        image: &[u8],
    ) -> i32 {
        let KobsCommand::Init { addr, size } = self;

        let start = *addr as usize;
        let Some(boot_image) = start
            .checked_add(*size as usize)
            .and_then(|end| image.get(start..end))
        else {
            error!("{size:#x} bytes at {addr:#010x} are outside the loaded image");
            return 1;
        };

        match kobs_init(nand, regs, encoder, boot_image) {
            Ok(()) => 0,
            Err(e) => {
                error!("kobs: {e:#}");
                1
            }
        }
    }
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConstCommand {
    /// Set a constant, or delete it when no value is given
    Set { name: String, values: Vec<String> },

    /// Print the named constants, or all of them
    Print { names: Vec<String> },

    /// Write the constants back to their partition
    Save,

    /// Discard changes and read the partition again
    Reload,
}

impl ConstCommand {
    pub fn run<R: Register>(
        &self,
        ctx: &mut BootContext<R>,
        out: &mut dyn Write,
    ) -> anyhow::Result<i32> {
        let code = match self {
            ConstCommand::Set { name, values } => {
                let values: Vec<&str> = values.iter().map(String::as_str).collect();
                match ctx.constants.set(name, &values) {
                    Ok(()) => 0,
                    Err(e @ ConstError::IllegalName(_)) => {
                        writeln!(out, "## Error: {e}")?;
                        1
                    }
                    Err(e @ ConstError::ReadOnly(_)) => {
                        writeln!(out, "{e}")?;
                        1
                    }
                    Err(e) => {
                        debug!("{e}");
                        1
                    }
                }
            }
            ConstCommand::Print { names } if names.is_empty() => {
                ctx.constants.print_all(out)?;
                exit_code(!ctx.constants.is_empty())
            }
            ConstCommand::Print { names } => {
                let mut missing = 0;
                for name in names {
                    match ctx.constants.print(name, out) {
                        Ok(()) => (),
                        Err(e) if e.is::<ConstError>() => {
                            writeln!(out, "## Error: {e}")?;
                            missing += 1;
                        }
                        Err(e) => return Err(e),
                    }
                }
                missing
            }
            ConstCommand::Save => {
                info!("Saving Constants...");
                match ctx.constants.save() {
                    Ok(()) => 0,
                    Err(e) => {
                        error!("saving constants failed: {e:#}");
                        1
                    }
                }
            }
            ConstCommand::Reload => match ctx.constants.reload() {
                Ok(()) => exit_code(ctx.constants.is_valid()),
                Err(e) => {
                    error!("reloading constants failed: {e:#}");
                    1
                }
            },
        };
        Ok(code)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::env::{Constants, Environment};
    use crate::flags::{FlagStore, SimRegister};
    use crate::kobs::fcb::CopyEncoder;
    use crate::nand::bch::SimEccRegs;
    use crate::nand::{NandLayout, SimNand};
    use crate::status::NoLed;

    const LAYOUT: NandLayout = NandLayout {
        blocks: 2048,
        pages_per_block: 64,
        bytes_per_page: 2048,
        oob_bytes_per_page: 64,
    };

    const KEY: &str = "0123456789abcdef";

    fn context() -> BootContext<SimRegister> {
        let mut constants = Constants::default();
        constants.set("key", &[KEY]).unwrap();
        BootContext::new(
            Environment::new(),
            constants,
            FlagStore::new(SimRegister(0)),
            LAYOUT,
        )
    }

    fn image() -> Vec<u8> {
        let version = Version::new(1, 0, 0, 0xabc);
        ImageBuilder::new(version)
            .chunk(Chunk::new("fit", version, vec![7; 100]).with_crc32())
            .chunk(
                Chunk::new("rootfs", version, vec![9; 1000])
                    .encrypted(KEY.as_bytes())
                    .unwrap()
                    .with_sha256(),
            )
            .build()
            .unwrap()
    }

    /// An image staged behind some unrelated bytes, as at a load address
    fn staged() -> Vec<u8> {
        let mut ram = vec![0xEE; 0x100];
        ram.extend(image());
        ram
    }

    fn sfu(ctx: &mut BootContext<SimRegister>, ram: &mut [u8], cmd: SfuCommand) -> i32 {
        cmd.run(ctx, ram, &mut NoLed)
    }

    #[test]
    fn test_sfu_header_commands() {
        let mut ctx = context();
        let mut ram = staged();
        let total = image().len();

        assert_eq!(sfu(&mut ctx, &mut ram, SfuCommand::Magic { addr: 0x100 }), 0);
        assert_eq!(
            ctx.env.get_local("SFU_TOTAL_LEN"),
            Some(format!("0x{total:08x}").as_str())
        );
        assert_eq!(sfu(&mut ctx, &mut ram, SfuCommand::Magic { addr: 0 }), 1);
        assert_eq!(sfu(&mut ctx, &mut ram, SfuCommand::Magic { addr: 0x10000 }), 1);

        assert_eq!(sfu(&mut ctx, &mut ram, SfuCommand::Valid { addr: 0x100 }), 0);
        ctx.env.set("mtd_download_size", "1");
        assert_eq!(sfu(&mut ctx, &mut ram, SfuCommand::Valid { addr: 0x100 }), 1);
        ctx.env.remove("mtd_download_size");

        assert_eq!(sfu(&mut ctx, &mut ram, SfuCommand::Globver { addr: 0x100 }), 0);
        assert_eq!(
            ctx.env.get_local("SFU_GLOB_VERS"),
            Some("00000001.00000000.00000000.00000abc")
        );

        assert_eq!(sfu(&mut ctx, &mut ram, SfuCommand::Chnknum { addr: 0x100 }), 0);
        assert_eq!(ctx.env.get_local("SFU_NUM_CHNKS"), Some("0x00000002"));
    }

    #[test]
    fn test_sfu_chnkhdr() {
        let mut ctx = context();
        let mut ram = staged();

        let cmd = |dest: &str| SfuCommand::Chnkhdr {
            addr: 0x100,
            dest: dest.to_string(),
        };
        assert_eq!(sfu(&mut ctx, &mut ram, cmd("fit")), 0);
        assert_eq!(ctx.env.get_local("SFU_CHNK_DEST"), Some("fit"));
        assert_eq!(ctx.env.get_local("SFU_CHNK_SIZE"), Some("0x00000064"));
        assert_eq!(ctx.env.get_local("SFU_CHNK_ENCM"), Some("00000000"));
        assert_eq!(ctx.env.get_local("SFU_CHNK_CR32").map(str::len), Some(8));
        assert_eq!(ctx.env.get_local("SFU_CHNK_SHA2"), Some(""));

        // Data is relative to the load address
        let data = ctx.env.get_local("SFU_CHNK_DATA").unwrap();
        let data = parse_hex(data).unwrap() as usize;
        assert_eq!(ram[data..data + 100], [7; 100]);

        assert_eq!(sfu(&mut ctx, &mut ram, cmd("rootfs")), 0);
        assert_eq!(ctx.env.get_local("SFU_CHNK_ENCM"), Some("00000001"));
        assert_eq!(ctx.env.get_local("SFU_CHNK_CR32"), Some(""));
        assert_eq!(ctx.env.get_local("SFU_CHNK_MD5_"), Some(""));
        assert_eq!(ctx.env.get_local("SFU_CHNK_SHA2").map(str::len), Some(64));

        assert_eq!(sfu(&mut ctx, &mut ram, cmd("root")), 1);
    }

    #[test]
    fn test_sfu_decrypt() {
        let mut ctx = context();
        let mut ram = staged();

        assert_eq!(
            sfu(
                &mut ctx,
                &mut ram,
                SfuCommand::Chnkhdr {
                    addr: 0x100,
                    dest: "rootfs".into(),
                }
            ),
            0
        );
        let data = parse_hex(ctx.env.get_local("SFU_CHNK_DATA").unwrap()).unwrap();
        let size = parse_hex(ctx.env.get_local("SFU_CHNK_SIZE").unwrap()).unwrap();
        assert_eq!(size, 1008);

        let decrypt = SfuCommand::Decrypt { addr: data, len: size };
        assert!(decrypt.modifies_image());
        assert_eq!(sfu(&mut ctx, &mut ram, decrypt.clone()), 0);
        assert_eq!(ctx.env.get_local("SFU_CHNK_SIZE"), Some("0x000003e8"));
        let data = data as usize;
        assert_eq!(ram[data..data + 1000], [9; 1000]);

        // Out of range, and without a key
        let far = SfuCommand::Decrypt {
            addr: data as u32,
            len: 0x10_0000,
        };
        assert_eq!(sfu(&mut ctx, &mut ram, far), 1);
        ctx.constants.set("key", &[]).unwrap();
        assert_eq!(sfu(&mut ctx, &mut ram, decrypt), 1);
    }

    #[test]
    fn test_sfu_pack() -> anyhow::Result<()> {
        let dir = std::env::temp_dir().join(format!("sfu-pack-{}", std::process::id()));
        fs::create_dir_all(&dir)?;
        let payload = dir.join("rootfs.bin");
        fs::write(&payload, [3u8; 500])?;
        let output = dir.join("update.sfu");

        let cmd = SfuCommand::Pack {
            output: output.clone(),
            global_version: "1.2.3.4".parse()?,
            key: None,
            chunks: vec![format!("rootfs={}", payload.display())],
        };
        assert!(!cmd.needs_image());
        let mut ctx = context();
        assert_eq!(sfu(&mut ctx, &mut [], cmd), 0);

        let image = fs::read(&output)?;
        assert!(validate(&image, 0).is_valid());
        let (_, header) = SfuParser::from_slice(&image).find_chunk("rootfs")?;
        assert_eq!(header.size, 500);
        assert!(header.hdr_flag.contains(HdrFlags::MD5_));

        fs::remove_dir_all(&dir)?;
        Ok(())
    }

    #[test]
    fn test_fwup_flags() -> anyhow::Result<()> {
        let mut ctx = context();
        let mut out = Vec::new();

        assert_eq!(FwupCommand::Update.run(&mut ctx, &mut out)?, 1);
        let set = FwupCommand::Set {
            flag: "update".into(),
        };
        assert_eq!(set.run(&mut ctx, &mut out)?, 0);
        assert_eq!(FwupCommand::Update.run(&mut ctx, &mut out)?, 0);
        assert_eq!(FwupCommand::Fail.run(&mut ctx, &mut out)?, 1);

        let bogus = FwupCommand::Set {
            flag: "bogus".into(),
        };
        assert_eq!(bogus.run(&mut ctx, &mut out)?, 0);

        let clear = FwupCommand::Clear {
            flag: "update".into(),
        };
        assert_eq!(clear.run(&mut ctx, &mut out)?, 0);
        assert_eq!(FwupCommand::Update.run(&mut ctx, &mut out)?, 1);

        assert_eq!(FwupCommand::Incbootcnt.run(&mut ctx, &mut out)?, 0);
        assert_eq!(FwupCommand::Flags.run(&mut ctx, &mut out)?, 0);
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "INFO: flags: bootcount: 1, fail: 0, update: 0\n"
        );

        // No carrier, no request
        assert_eq!(FwupCommand::UsbUpdateReq.run(&mut ctx, &mut Vec::new())?, 1);
        Ok(())
    }

    #[test]
    fn test_fwup_bootcnt() -> anyhow::Result<()> {
        let mut ctx = context();
        ctx.fwupdate_init();
        let mut out = Vec::new();

        for _ in 0..6 {
            assert_eq!(FwupCommand::Bootcnt.run(&mut ctx, &mut out)?, 0);
            assert_eq!(FwupCommand::Incbootcnt.run(&mut ctx, &mut out)?, 0);
        }
        assert_eq!(FwupCommand::Bootcnt.run(&mut ctx, &mut out)?, 1);

        // The counter is eight bits wide
        ctx.flags.bootcount_write(255)?;
        assert_eq!(FwupCommand::Incbootcnt.run(&mut ctx, &mut out)?, 0);
        assert_eq!(ctx.flags.bootcount_read()?, 0);
        Ok(())
    }

    #[test]
    fn test_fwup_mtdparts() -> anyhow::Result<()> {
        let mut ctx = context();
        assert_eq!(FwupCommand::Mtdparts.run(&mut ctx, &mut Vec::new())?, 0);
        assert!(ctx
            .env
            .get("mtdparts")
            .is_some_and(|m| m.starts_with("mtdparts=gpmi-nand:")));

        ctx.nand_layout.blocks = 100;
        assert_eq!(FwupCommand::Mtdparts.run(&mut ctx, &mut Vec::new())?, 1);
        Ok(())
    }

    #[test]
    fn test_kobs_command() {
        let layout = NandLayout {
            blocks: 128,
            ..LAYOUT
        };
        let mut nand = SimNand::new(layout);
        let mut regs = SimEccRegs::new();
        let ram = vec![0x5A; 0x3000];

        let cmd = KobsCommand::Init {
            addr: 0x1000,
            size: 0x2000,
        };
        assert_eq!(cmd.run(&mut nand, &mut regs, &mut CopyEncoder, &ram), 0);

        let cmd = KobsCommand::Init {
            addr: 0x2000,
            size: 0x2000,
        };
        assert_eq!(cmd.run(&mut nand, &mut regs, &mut CopyEncoder, &ram), 1);
    }

    #[test]
    fn test_const_commands() -> anyhow::Result<()> {
        let mut ctx = context();
        let mut out = Vec::new();

        let set = |name: &str, values: &[&str]| ConstCommand::Set {
            name: name.into(),
            values: values.iter().map(|v| v.to_string()).collect(),
        };
        assert_eq!(set("serial#", &["42"]).run(&mut ctx, &mut out)?, 0);
        assert_eq!(set("serial#", &["43"]).run(&mut ctx, &mut out)?, 1);
        assert_eq!(set("a=b", &["1"]).run(&mut ctx, &mut out)?, 1);
        assert_eq!(set("name", &["two", "words"]).run(&mut ctx, &mut out)?, 0);
        assert_eq!(set("missing", &[]).run(&mut ctx, &mut out)?, 1);
        assert_eq!(
            String::from_utf8(std::mem::take(&mut out)).unwrap(),
            "Can't overwrite \"serial#\"\n## Error: illegal character '=' in variable name \"a=b\"\n"
        );

        let print = ConstCommand::Print {
            names: vec!["name".into(), "nope".into(), "other".into()],
        };
        assert_eq!(print.run(&mut ctx, &mut out)?, 2);
        assert_eq!(
            String::from_utf8(std::mem::take(&mut out)).unwrap(),
            "name=two words\n## Error: \"nope\" not defined in Constants\n\
             ## Error: \"other\" not defined in Constants\n"
        );

        // No backing store in this context
        assert_eq!(ConstCommand::Save.run(&mut ctx, &mut out)?, 1);
        assert_eq!(ConstCommand::Reload.run(&mut ctx, &mut out)?, 1);

        let mut empty = BootContext::new(
            Environment::new(),
            Constants::default(),
            FlagStore::new(SimRegister(0)),
            LAYOUT,
        );
        assert_eq!(ConstCommand::Print { names: vec![] }.run(&mut empty, &mut out)?, 1);
        Ok(())
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::ErrorKind::BrokenPipe.into())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_output_errors_propagate() -> anyhow::Result<()> {
        let mut ctx = context();
        ctx.constants.set("name", &["value"])?;

        assert!(FwupCommand::Flags.run(&mut ctx, &mut BrokenPipe).is_err());
        assert!(ConstCommand::Print { names: vec![] }
            .run(&mut ctx, &mut BrokenPipe)
            .is_err());
        let print = ConstCommand::Print {
            names: vec!["name".into()],
        };
        assert!(print.run(&mut ctx, &mut BrokenPipe).is_err());
        let print = ConstCommand::Print {
            names: vec!["nope".into()],
        };
        assert!(print.run(&mut ctx, &mut BrokenPipe).is_err());

        // Commands with nothing to print don't touch the writer
        assert_eq!(FwupCommand::Update.run(&mut ctx, &mut BrokenPipe)?, 1);
        Ok(())
    }

    #[test]
    fn test_const_persistence() -> anyhow::Result<()> {
        let path = std::env::temp_dir().join(format!("constants-{}", std::process::id()));
        let _ = fs::remove_file(&path);

        let mut ctx = context();
        ctx.constants = Constants::open(&path)?;
        assert_eq!(ConstCommand::Reload.run(&mut ctx, &mut Vec::new())?, 1);

        ctx.constants.set("mac", &["00:01:02:03:04:05"])?;
        assert_eq!(ConstCommand::Save.run(&mut ctx, &mut Vec::new())?, 0);
        ctx.constants.set("scratch", &["x"])?;
        assert_eq!(ConstCommand::Reload.run(&mut ctx, &mut Vec::new())?, 0);
        assert_eq!(ctx.constants.getconst("scratch"), None);
        assert_eq!(ctx.constants.getconst("mac"), Some("00:01:02:03:04:05"));

        fs::remove_file(&path)?;
        Ok(())
    }
}
