//! Writing the i.MX NAND boot structures: FCB copies at the start of the boot region, followed by
//! two copies of the boot image.

pub mod fcb;
pub mod raw;

use anyhow::ensure;
use log::{debug, info, warn};

use crate::nand::bch::{EccLayout, EccLayoutGuard};
use crate::nand::{Nand, NandBlock};
use fcb::{checksum_and_encode, Dbbt, EccEncoder, Fcb, KobsLayout, IMAGE_PADDING};
pub use raw::erase_write;

/// The FCB flavor the ROM of this SoC expects
pub const FCB_ENCODE_VERSION: u32 = 2;

/// Write FCBs and both boot image copies for `image`.
pub fn kobs_init<N, E>(
    nand: &mut N,
    regs: &mut E,
    encoder: &mut dyn EccEncoder,
    image: &[u8],
) -> anyhow::Result<()>
where
    N: Nand,
    E: EccLayout + ?Sized,
{
    let nand_layout = nand.get_layout();
    let layout = KobsLayout::new(nand_layout)?;
    let page_size = layout.page_size();

    info!("kobs: NAND size is {} B", fcb::BOOT_PART_SIZE);
    info!("kobs: NAND blocksize is {} B", nand_layout.block_size());
    info!(
        "kobs: NAND pages are {} B + {} B ecc",
        page_size, nand_layout.oob_bytes_per_page
    );
    info!(
        "kobs: DBBT search area will start at {:#010X} (page {})",
        layout.dbbt_start,
        layout.dbbt_start / page_size as u64
    );
    for (name, start) in [("first", layout.img1_start), ("second", layout.img2_start)] {
        info!(
            "kobs: {name} image will be at {start:#010X} (page {}) size {} pages",
            start / page_size as u64,
            layout.pages_for(image.len())
        );
    }
    info!("kobs: maximum image size is {} B", layout.max_img_size);

    let mut fcb = Fcb::new(&layout, image.len())?;
    ensure!(
        nand_layout.oob_bytes_per_page > 0,
        "NAND layout has no spare area for the bad block marker"
    );

    // Not written; the ROM uses the bad block markers instead
    let dbbt = Dbbt::new();
    debug!("kobs: DBBT {:02x?}", &dbbt.to_block()?[..20]);

    info!("kobs: Writing FCB");
    let mut buffer = vec![0; page_size + nand_layout.oob_bytes_per_page];
    checksum_and_encode(&mut fcb, &mut buffer, FCB_ENCODE_VERSION, encoder)?;
    // Keep the block looking good to anyone checking the marker
    buffer[page_size] = 0xFF;
    let (data, oob) = buffer.split_at(page_size);

    // The ROM reads every FCB block, marked bad or not
    for index in 0..layout.copies {
        if nand.block(index)?.is_none() {
            warn!("kobs: scrubbing bad block marker of FCB block {index}");
        }

        let mut block = nand.scrub(index)?;
        let _ecc_off = EccLayoutGuard::disable(&mut *regs)?;
        block.program_raw(0, data, oob)?;
    }

    info!("kobs: Writing image");
    let mut padded = vec![0; IMAGE_PADDING + image.len()];
    padded[IMAGE_PADDING..].copy_from_slice(image);

    erase_write(nand, layout.img1_start, &padded, layout.max_img_size as u64)?;
    erase_write(nand, layout.img2_start, &padded, layout.max_img_size as u64)?;

    Ok(())
}
