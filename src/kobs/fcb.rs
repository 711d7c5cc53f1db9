//! The Firmware Configuration Block read by the i.MX boot ROM, and the geometry it describes.

use anyhow::ensure;
use deku::{DekuContainerWrite, DekuRead, DekuWrite};

use crate::nand::NandLayout;

pub const FCB_FINGERPRINT: u32 = 0x2042_4346;
pub const FCB_VERSION: u32 = 0x0100_0000;
pub const DBBT_FINGERPRINT: u32 = 0x5442_4244;
pub const DBBT_VERSION: u32 = 0x0100_0000;

/// Serialized size of [`Fcb`]; the DBBT is padded to the same size
pub const FCB_LEN: usize = 216;

/// The region at the start of the NAND owned by the boot ROM
pub const BOOT_PART_SIZE: u64 = 8 << 20;

/// Zero bytes put in front of the boot image
pub const IMAGE_PADDING: usize = 0x400;

/// The ROM searches `1 << SEARCH_EXPONENT` blocks for each boot structure
pub const SEARCH_EXPONENT: u32 = 2;

pub const DATA_SETUP_TIME: u8 = 80;
pub const DATA_HOLD_TIME: u8 = 60;
pub const ADDRESS_SETUP_TIME: u8 = 25;
pub const DATA_SAMPLE_TIME: u8 = 6;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum FcbError {
    #[error("FCB version {0} is not supported")]
    InvalidVersion(u32),

    #[error("NAND page size {0} is not supported")]
    UnsupportedPageSize(usize),

    #[error("image is too big ({size} B, at most {max} B fit)")]
    ImageTooLarge { size: usize, max: usize },

    #[error("{have} byte buffer cannot hold {need} bytes")]
    BufferTooSmall { have: usize, need: usize },

    #[error("{0} byte erase blocks leave no room for the boot images")]
    BlocksTooLarge(usize),
}

#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian",
    ctx_default = "deku::ctx::Endian::Little"
)]
pub struct NandTiming {
    pub data_setup: u8,
    pub data_hold: u8,
    pub address_setup: u8,
    pub dsample_time: u8,
}

/// Toggle-mode DDR timing; unused here, always zero
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian",
    ctx_default = "deku::ctx::Endian::Little"
)]
pub struct TogglemodeTiming {
    pub read_latency: u32,
    pub preamble_delay: u32,
    pub ce_delay: u32,
    pub postamble_delay: u32,
    pub cmd_add_pause: u32,
    pub data_pause: u32,
    pub speed: u32,
    pub busy_timeout: u32,
}

/// ONFI sync-mode timing; unused here, always zero
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian",
    ctx_default = "deku::ctx::Endian::Little"
)]
pub struct OnfiTiming {
    pub speed: u32,
    pub read_latency: u32,
    pub ce_delay: u32,
    pub preamble_delay: u32,
    pub postamble_delay: u32,
    pub cmd_add_pause: u32,
    pub data_pause: u32,
    pub busy_timeout: u32,
}

#[derive(Debug, Default, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Fcb {
    pub checksum: u32,
    pub fingerprint: u32,
    pub version: u32,

    pub timing: NandTiming,
    pub page_data_size: u32,
    pub total_page_size: u32,
    pub sectors_per_block: u32,
    pub number_of_nands: u32,
    pub total_internal_die: u32,
    pub cell_type: u32,

    pub ecc_block_n_ecc_type: u32,
    pub ecc_block_0_size: u32,
    pub ecc_block_n_size: u32,
    pub ecc_block_0_ecc_type: u32,
    pub metadata_bytes: u32,
    pub num_ecc_blocks_per_page: u32,

    pub ecc_block_n_ecc_level_sdk: u32,
    pub ecc_block_0_size_sdk: u32,
    pub ecc_block_n_size_sdk: u32,
    pub ecc_block_0_ecc_level_sdk: u32,
    pub num_ecc_blocks_per_page_sdk: u32,
    pub metadata_bytes_sdk: u32,

    pub erase_threshold: u32,
    pub boot_patch: u32,
    pub patch_sectors: u32,

    pub firmware1_starting_page: u32,
    pub firmware2_starting_page: u32,
    pub pages_in_firmware1: u32,
    pub pages_in_firmware2: u32,

    pub dbbt_search_area_start_address: u32,
    pub bad_block_marker_byte: u32,
    pub bad_block_marker_start_bit: u32,
    pub bb_marker_physical_offset: u32,
    pub bch_type: u32,

    pub tm_timing: TogglemodeTiming,

    pub disable_bbm: u32,
    pub bbm_physical_offset_in_spare_data: u32,
    pub onfi_sync_enable: u32,
    pub onfi_timing: OnfiTiming,
    pub disable_bb_search: u32,
}

/// Discovered Bad Block Table header; the table itself is left empty.
#[derive(Debug, Default, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct Dbbt {
    pub checksum: u32,
    pub fingerprint: u32,
    pub version: u32,
    pub reserved: u32,
    pub num_of_pages: u32,
}

impl Dbbt {
    pub fn new() -> Self {
        Self {
            fingerprint: DBBT_FINGERPRINT,
            version: DBBT_VERSION,
            ..Default::default()
        }
    }

    /// Serialize, zero-padded to [`FCB_LEN`]
    pub fn to_block(&self) -> anyhow::Result<Vec<u8>> {
        let mut bytes = self.to_bytes()?;
        bytes.resize(FCB_LEN, 0);
        Ok(bytes)
    }
}

/// ECC geometry for the supported page sizes: `(ecc blocks per page, bad block marker byte)`
pub fn ecc_geometry(page_size: usize) -> Result<(u32, u32), FcbError> {
    match page_size {
        4096 => Ok((7, 3995)),
        2048 => Ok((3, 1999)),
        _ => Err(FcbError::UnsupportedPageSize(page_size)),
    }
}

/// Where everything goes inside the boot region
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct KobsLayout {
    pub nand: NandLayout,

    /// Copies of each boot structure, one per block
    pub copies: u32,

    pub dbbt_start: u64,
    pub img1_start: u64,
    pub img2_start: u64,
    pub max_img_size: usize,
}

impl KobsLayout {
    pub fn new(nand: NandLayout) -> Result<Self, FcbError> {
        let block_size = nand.block_size() as u64;
        let copies = 1 << SEARCH_EXPONENT;
        let boot_blocks = BOOT_PART_SIZE / block_size;

        // FCBs, then the DBBT search area, then the two image copies
        let img1_start_block = 2 * copies as u64;
        if boot_blocks <= img1_start_block {
            return Err(FcbError::BlocksTooLarge(nand.block_size()));
        }
        let img2_start_block = img1_start_block + (boot_blocks - img1_start_block) / 2;

        let img1_start = img1_start_block * block_size;
        let img2_start = img2_start_block * block_size;

        Ok(Self {
            nand,
            copies,
            dbbt_start: block_size * copies as u64,
            img1_start,
            img2_start,
            max_img_size: (img2_start - img1_start) as usize,
        })
    }

    pub fn page_size(&self) -> usize {
        self.nand.bytes_per_page
    }

    /// Pages needed to hold `size` bytes
    pub fn pages_for(&self, size: usize) -> u32 {
        size.div_ceil(self.page_size()) as u32
    }
}

impl Fcb {
    /// Describe a boot image of `image_size` bytes placed according to `layout`.
    pub fn new(layout: &KobsLayout, image_size: usize) -> Result<Self, FcbError> {
        let page_size = layout.page_size();
        let (ecc_blocks, bb_marker_byte) = ecc_geometry(page_size)?;

        if image_size > layout.max_img_size {
            return Err(FcbError::ImageTooLarge {
                size: image_size,
                max: layout.max_img_size,
            });
        }
        let image_pages = layout.pages_for(image_size);

        Ok(Self {
            fingerprint: FCB_FINGERPRINT,
            version: FCB_VERSION,

            timing: NandTiming {
                data_setup: DATA_SETUP_TIME,
                data_hold: DATA_HOLD_TIME,
                address_setup: ADDRESS_SETUP_TIME,
                dsample_time: DATA_SAMPLE_TIME,
            },
            page_data_size: page_size as u32,
            total_page_size: (page_size + layout.nand.oob_bytes_per_page) as u32,
            sectors_per_block: layout.nand.pages_per_block,

            ecc_block_n_ecc_type: 4,
            ecc_block_0_size: 512,
            ecc_block_n_size: 512,
            ecc_block_0_ecc_type: 4,
            metadata_bytes: 10,
            num_ecc_blocks_per_page: ecc_blocks,

            firmware1_starting_page: (layout.img1_start / page_size as u64) as u32,
            firmware2_starting_page: (layout.img2_start / page_size as u64) as u32,
            pages_in_firmware1: image_pages,
            pages_in_firmware2: image_pages,

            // The ROM falls back to the bad block markers
            dbbt_search_area_start_address: 0,
            bad_block_marker_byte: bb_marker_byte,
            bad_block_marker_start_bit: 0,
            bb_marker_physical_offset: page_size as u32,
            bch_type: 0,

            ..Default::default()
        })
    }

    /// Byte sum of everything after the checksum field, inverted
    pub fn compute_checksum(&self) -> anyhow::Result<u32> {
        let bytes = self.to_bytes()?;
        Ok(checksum(&bytes[4..]))
    }

    pub fn fix_checksum(&mut self) -> anyhow::Result<()> {
        self.checksum = self.compute_checksum()?;
        Ok(())
    }
}

fn checksum(data: &[u8]) -> u32 {
    data.iter()
        .fold(0u32, |acc, &b| acc.wrapping_add(b as u32))
        ^ 0xffff_ffff
}

/// Turns a serialized boot structure into a raw page image with ECC parity
pub trait EccEncoder {
    /// Encode `source` into `target` for the given structure version, returning the bytes used.
    fn encode(&mut self, source: &[u8], target: &mut [u8], version: u32) -> anyhow::Result<usize>;
}

/// Places the structure at the start of the page and leaves parity zeroed, for simulated flash
#[derive(Debug, Default, Copy, Clone)]
pub struct CopyEncoder;

impl EccEncoder for CopyEncoder {
    fn encode(&mut self, source: &[u8], target: &mut [u8], _version: u32) -> anyhow::Result<usize> {
        ensure!(
            target.len() >= source.len(),
            FcbError::BufferTooSmall {
                have: target.len(),
                need: source.len()
            }
        );
        target[..source.len()].copy_from_slice(source);
        Ok(target.len())
    }
}

/// Fill in the checksum of `fcb` and render it into `target` (page plus spare area).
///
/// Version 0 is a plain copy; versions 2 and 3 go through `encoder`.
pub fn checksum_and_encode(
    fcb: &mut Fcb,
    target: &mut [u8],
    version: u32,
    encoder: &mut dyn EccEncoder,
) -> anyhow::Result<usize> {
    ensure!(
        target.len() >= FCB_LEN,
        FcbError::BufferTooSmall {
            have: target.len(),
            need: FCB_LEN
        }
    );

    target.fill(0);
    fcb.fix_checksum()?;
    let bytes = fcb.to_bytes()?;

    match version {
        0 => {
            target[..bytes.len()].copy_from_slice(&bytes);
            Ok(target.len())
        }
        2 | 3 => encoder.encode(&bytes, target, version),
        _ => Err(FcbError::InvalidVersion(version).into()),
    }
}
