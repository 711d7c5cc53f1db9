//! Writing raw blobs to a region of NAND flash, skipping bad blocks.

use anyhow::{bail, ensure};
use log::{debug, warn};

use crate::nand::{Nand, NandBlock};

/// Where one slice of the blob ended up
struct Placed {
    block: u32,
    start_page: u32,
    range: std::ops::Range<usize>,
}

/// Program `data` into `block` at `start_page`, erasing and retrying a few times.
///
/// Returns `false` if the block should be considered bad.
fn program_block<B: NandBlock>(block: &mut B, start_page: u32, data: &[u8]) -> anyhow::Result<bool> {
    for attempt in 0..5 {
        match block.program(start_page, data) {
            Ok(()) => return Ok(true),
            Err(e) => {
                warn!("program failed (attempt {attempt}): {e:#}");
                block.erase()?;
            }
        }
    }

    Ok(false)
}

/// Erase the region `[offset, offset + max_size)`, then write `data` at its start and read it back.
///
/// `offset` must be page aligned; `data` is zero-padded to a whole number of pages. Bad blocks are
/// skipped, but still count against `max_size`.
pub fn erase_write<N: Nand>(
    nand: &mut N,
    offset: u64,
    data: &[u8],
    max_size: u64,
) -> anyhow::Result<()> {
    let layout = nand.get_layout();
    let page_size = layout.bytes_per_page;
    let block_size = layout.block_size() as u64;

    ensure!(
        offset % page_size as u64 == 0,
        "offset {offset:#x} is not aligned to the {page_size} byte page size"
    );

    let padded_len = data.len().next_multiple_of(page_size);
    ensure!(
        padded_len as u64 <= max_size,
        "{padded_len:#x} bytes do not fit in {max_size:#x}"
    );
    ensure!(
        offset + max_size <= layout.total_size(),
        "region {offset:#x}+{max_size:#x} is past the end of the flash"
    );
    if padded_len == 0 {
        return Ok(());
    }

    let mut padded;
    let data = if padded_len != data.len() {
        padded = Vec::with_capacity(padded_len);
        padded.extend_from_slice(data);
        padded.resize(padded_len, 0);
        &padded[..]
    } else {
        data
    };

    let first_block = (offset / block_size) as u32;
    let last_block = ((offset + max_size - 1) / block_size) as u32;

    debug!("erasing blocks {first_block}..={last_block}");
    for index in first_block..=last_block {
        match nand.block(index)? {
            None => debug!("skipping bad block {index}"),
            Some(mut block) => {
                if let Err(e) = block.erase() {
                    warn!("erase of block {index} failed, marking bad: {e:#}");
                    block.mark_bad()?;
                }
            }
        }
    }

    let mut placed = Vec::new();
    let mut cursor = 0;
    let mut start_page = ((offset % block_size) / page_size as u64) as u32;
    for index in first_block..=last_block {
        if cursor == data.len() {
            break;
        }

        let Some(mut block) = nand.block(index)? else {
            debug!("skipping bad block {index}");
            start_page = 0;
            continue;
        };

        let room = (block.page_count() - start_page) as usize * page_size;
        let range = cursor..std::cmp::min(data.len(), cursor + room);

        if program_block(&mut block, start_page, &data[range.clone()])? {
            cursor = range.end;
            placed.push(Placed {
                block: index,
                start_page,
                range,
            });
        } else {
            warn!("block {index} went bad during write");
            block.mark_bad()?;
        }
        start_page = 0;
    }

    if cursor != data.len() {
        bail!("ran out of good blocks with {:#x} bytes left to write", data.len() - cursor);
    }

    let mut buf = Vec::new();
    for place in placed {
        buf.resize(place.range.len(), 0);
        let block = nand.block(place.block)?;
        let Some(block) = block else {
            bail!("block {} disappeared during verify", place.block);
        };
        block.read(place.start_page, &mut buf)?;
        ensure!(
            buf == data[place.range.clone()],
            "verify failed in block {}",
            place.block
        );
    }

    Ok(())
}
