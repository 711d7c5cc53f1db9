//! Abstractions and code to access NAND flash

use std::io::{Read, Write};
use std::str::FromStr;

use anyhow::ensure;

pub mod bch;

/// Convenience methods for operating on `[u8]`s that represent page contents
pub trait PageUtil {
    /// Does this page contain the all-1s bit pattern?
    fn is_erased(&self) -> bool;
}

impl PageUtil for [u8] {
    fn is_erased(&self) -> bool {
        self.iter().all(|&x| x == 0xFF)
    }
}

/// A pub-fields struct describing the data layout of a NAND flash device
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NandLayout {
    pub blocks: u32,
    pub pages_per_block: u32,
    pub bytes_per_page: usize,

    /// Spare area per page, holding ECC parity and the bad block marker
    pub oob_bytes_per_page: usize,
}

impl NandLayout {
    pub fn block_size(&self) -> usize {
        self.bytes_per_page * self.pages_per_block as usize
    }

    /// Size of the main (non-OOB) area of the whole device
    pub fn total_size(&self) -> u64 {
        self.block_size() as u64 * self.blocks as u64
    }
}

/// Parse strings like "BLOCKSxPAGESxBYTES" or "BLOCKSxPAGESxBYTES+OOB"
impl FromStr for NandLayout {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let (main, oob) = match s.split_once('+') {
            Some((main, oob)) => (main, Some(oob)),
            None => (s, None),
        };

        let [blocks, pages_per_block, bytes_per_page]: [&str; 3] = main
            .split('x')
            .collect::<Vec<_>>()
            .try_into()
            .map_err(|_| anyhow::anyhow!("expected #x#x#[+#]"))?;
        let blocks = blocks.parse()?;
        let pages_per_block = pages_per_block.parse()?;
        let bytes_per_page = bytes_per_page.parse()?;
        let oob_bytes_per_page = oob.map(str::parse).transpose()?.unwrap_or(0);

        Ok(NandLayout {
            blocks,
            pages_per_block,
            bytes_per_page,
            oob_bytes_per_page,
        })
    }
}

/// Represents a NAND flash device
pub trait Nand {
    type Block<'a>: NandBlock + 'a
    where
        Self: 'a;

    /// Get a block
    ///
    /// Returns None if `index` refers to a block marked bad
    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>>;

    /// Erase a block whatever its bad block marker says, clearing the marker
    fn scrub(&mut self, index: u32) -> anyhow::Result<Self::Block<'_>>;

    /// Get the layout of the NAND
    fn get_layout(&self) -> NandLayout;
}

/// Represents a block of a NAND flash device
pub trait NandBlock {
    /// How many pages in this block?
    fn page_count(&self) -> u32;

    /// How many bytes per page?
    fn page_size(&self) -> usize;

    /// Read an integral number of pages, starting at the specified page
    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()>;

    /// Write the specified content, beginning at the specified page
    ///
    /// Note that `index` must be greater than any previously-written index, or in other words,
    /// writing a page makes it and all skipped pages nonwritable.
    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()>;

    /// Write one page and its spare area verbatim, bypassing ECC.
    ///
    /// The same ordering rule as [`NandBlock::program`] applies.
    fn program_raw(&mut self, page: u32, data: &[u8], oob: &[u8]) -> anyhow::Result<()>;

    /// Read the spare area of one page
    fn read_oob(&self, page: u32, oob: &mut [u8]) -> anyhow::Result<()>;

    /// Erase a block, making all pages writable again
    fn erase(&mut self) -> anyhow::Result<()>;

    /// Marks the block as bad, consuming the block object (it cannot be retrieved again).
    ///
    /// This should be called if an erase() results in error, or if a (properly in-order) program()
    /// results in error and we have already tried erase() and reprogramming it.
    fn mark_bad(self) -> anyhow::Result<()>;
}

/// A simulated in-memory NAND flash, for testing purposes
#[derive(Debug, Clone)]
pub struct SimNand {
    blocks: Box<[SimBlock]>,
    layout: NandLayout,
}

/// A block of SimNand
#[derive(Debug, Clone)]
pub struct SimBlock {
    /// All bytes of all written pages (legally, can only append to this)
    data: Vec<u8>,

    /// Spare areas of all pages, empty until a raw write touches the block
    oob: Vec<u8>,

    page_count: u32,
    page_size: usize,
    oob_size: usize,

    /// Is this block marked bad?
    marked_bad: bool,
}

impl SimNand {
    /// Create an empty SimNand with the specified layout
    pub fn new(layout: NandLayout) -> Self {
        let blocks = vec![SimBlock::new(layout); layout.blocks as usize];
        let blocks = blocks.into_boxed_slice();

        Self { blocks, layout }
    }

    /// Initialize the NAND contents with content read from a type implementing `Read`.
    ///
    /// Only the main area is stored; spare areas come back erased.
    pub fn load<R: Read>(&mut self, read: &mut R) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in self.blocks.iter_mut() {
            block.marked_bad = false;
            block.data.clear();
            block.oob.clear();
            read.read_exact(&mut buf)?;
            (&mut *block).program(0, &buf)?;
        }

        Ok(())
    }

    /// Write the contents of this simulated NAND out to a writable stream (such as a File)
    pub fn save<W: Write>(&mut self, write: &mut W) -> anyhow::Result<()> {
        let mut buf = vec![0; self.layout.block_size()];

        for block in 0..self.layout.blocks {
            match self.block(block)? {
                None => buf.fill(0xBD),
                Some(block) => block.read(0, &mut buf)?,
            };

            write.write_all(&buf)?;
        }

        Ok(())
    }
}

impl SimBlock {
    /// Construct an empty block within the given layout
    fn new(layout: NandLayout) -> Self {
        Self {
            data: Default::default(),
            oob: Default::default(),
            page_count: layout.pages_per_block,
            page_size: layout.bytes_per_page,
            oob_size: layout.oob_bytes_per_page,
            marked_bad: false,
        }
    }

    fn write_page(&mut self, index: u32, content: &[u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;

        ensure!(begin >= self.data.len(), "write in already-written area");

        // Writing fully-erased content is a no-op.
        if !content.is_erased() {
            self.data.resize(begin, 0xFF);
            self.data.extend_from_slice(content);
        }

        Ok(())
    }

    fn read_page(&self, index: u32, content: &mut [u8]) -> anyhow::Result<()> {
        ensure!(content.len() == self.page_size, "content not page-sized");
        ensure!(index < self.page_count, "page index out of bounds");

        let begin = index as usize * self.page_size;
        let end = begin + self.page_size;

        if let Some(page) = self.data.get(begin..end) {
            content.copy_from_slice(page);
        } else {
            content.fill(0xFF);
        }

        Ok(())
    }
}

impl Nand for SimNand {
    type Block<'a> = &'a mut SimBlock;

    fn block(&mut self, index: u32) -> anyhow::Result<Option<Self::Block<'_>>> {
        self.blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))
            .map(|x| Some(x).filter(|y| !y.marked_bad))
    }

    fn scrub(&mut self, index: u32) -> anyhow::Result<Self::Block<'_>> {
        let mut block = self
            .blocks
            .get_mut(index as usize)
            .ok_or(anyhow::anyhow!("block {index} out of range"))?;
        block.marked_bad = false;
        block.erase()?;
        Ok(block)
    }

    fn get_layout(&self) -> NandLayout {
        self.layout
    }
}

impl NandBlock for &mut SimBlock {
    fn page_count(&self) -> u32 {
        self.page_count
    }
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn read(&self, start_page: u32, content: &mut [u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks_mut(self.page_size()) {
            self.read_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn program(&mut self, start_page: u32, content: &[u8]) -> anyhow::Result<()> {
        let mut page = start_page;
        for chunk in content.chunks(self.page_size()) {
            self.write_page(page, chunk)?;
            page += 1;
        }
        Ok(())
    }

    fn program_raw(&mut self, page: u32, data: &[u8], oob: &[u8]) -> anyhow::Result<()> {
        ensure!(oob.len() == self.oob_size, "spare area size mismatch");

        // Claim the page even if its main area is blank
        let begin = page as usize * self.page_size;
        ensure!(begin >= self.data.len(), "write in already-written area");
        self.write_page(page, data)?;
        self.data.resize(begin + self.page_size, 0xFF);

        let oob_total = self.oob_size * self.page_count as usize;
        self.oob.resize(oob_total, 0xFF);
        let oob_begin = page as usize * self.oob_size;
        self.oob[oob_begin..oob_begin + self.oob_size].copy_from_slice(oob);
        Ok(())
    }

    fn read_oob(&self, page: u32, oob: &mut [u8]) -> anyhow::Result<()> {
        ensure!(oob.len() == self.oob_size, "spare area size mismatch");
        ensure!(page < self.page_count, "page index out of bounds");

        let begin = page as usize * self.oob_size;
        match self.oob.get(begin..begin + self.oob_size) {
            Some(stored) => oob.copy_from_slice(stored),
            None => oob.fill(0xFF),
        }
        Ok(())
    }

    fn erase(&mut self) -> anyhow::Result<()> {
        self.data.clear();
        self.oob.clear();

        Ok(())
    }

    fn mark_bad(mut self) -> anyhow::Result<()> {
        self.erase()?;
        self.marked_bad = true;
        Ok(())
    }
}

#[cfg(test)]
const TEST_LAYOUT: NandLayout = NandLayout {
    blocks: 8,
    pages_per_block: 16,
    bytes_per_page: 256,
    oob_bytes_per_page: 16,
};

#[test]
fn test_parse_layout() -> anyhow::Result<()> {
    let layout: NandLayout = "2048x64x2048+64".parse()?;
    assert_eq!(layout.block_size(), 128 * 1024);
    assert_eq!(layout.total_size(), 256 << 20);
    assert_eq!(layout.oob_bytes_per_page, 64);

    let layout: NandLayout = "8x16x256".parse()?;
    assert_eq!(layout.oob_bytes_per_page, 0);

    assert!("8x16".parse::<NandLayout>().is_err());
    assert!("8x16x256+x".parse::<NandLayout>().is_err());
    Ok(())
}

#[test]
fn test_sim_block() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks - 1).unwrap().is_some());
    assert!(nand.block(TEST_LAYOUT.blocks).is_err());
}

#[test]
fn test_sim_mark_bad() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    assert!(nand.block(0).unwrap().is_some());
    nand.block(0).unwrap().unwrap().mark_bad().unwrap();
    assert!(nand.block(0).unwrap().is_none());
}

#[test]
fn test_sim_scrub() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let page = vec![0x3Cu8; TEST_LAYOUT.bytes_per_page];
    nand.block(1)?.unwrap().program(0, &page)?;
    nand.block(0)?.unwrap().mark_bad()?;

    nand.scrub(0)?.program(0, &page)?;
    assert!(nand.block(0)?.is_some());

    let mut out = page.clone();
    nand.scrub(1)?.read(0, &mut out)?;
    assert!(out.is_erased());
    assert!(nand.scrub(TEST_LAYOUT.blocks).is_err());
    Ok(())
}

#[test]
fn test_sim_read_write() {
    let mut nand = SimNand::new(TEST_LAYOUT);

    let data_in = vec![0xA5u8; nand.get_layout().bytes_per_page];
    let mut data_out = data_in.clone();

    let mut block = nand.block(0).unwrap().unwrap();
    block.program(2, &data_in).unwrap();
    assert!(block.program(1, &data_in).is_err());

    block.read(1, &mut data_out).unwrap();
    assert!(data_out.is_erased());

    block.read(2, &mut data_out).unwrap();
    assert_eq!(data_out, data_in);

    block.read(3, &mut data_out).unwrap();
    assert!(data_out.is_erased());
}

#[test]
fn test_sim_raw_write() -> anyhow::Result<()> {
    let mut nand = SimNand::new(TEST_LAYOUT);
    let mut block = nand.block(1)?.unwrap();

    let data = vec![0xFFu8; 256];
    let oob: Vec<u8> = (0..16).collect();
    block.program_raw(0, &data, &oob)?;

    // Blank main area, but the page is still used up
    assert!(block.program(0, &[0x11; 256]).is_err());

    let mut oob_out = [0u8; 16];
    block.read_oob(0, &mut oob_out)?;
    assert_eq!(&oob_out[..], &oob[..]);
    block.read_oob(1, &mut oob_out)?;
    assert!(oob_out.is_erased());

    assert!(block.program_raw(1, &data, &oob[..8]).is_err());

    block.erase()?;
    block.read_oob(0, &mut oob_out)?;
    assert!(oob_out.is_erased());
    Ok(())
}

#[test]
fn test_sim_load() {
    let mut nand = SimNand::new(TEST_LAYOUT);
    nand.load(&mut std::io::repeat(0x55u8)).unwrap();

    let mut buf = vec![0u8; nand.get_layout().block_size()];

    let block = nand.block(0).unwrap().unwrap();
    block.read(0, &mut buf).unwrap();

    assert!(buf.iter().all(|&x| x == 0x55u8));
}
