//! The NAND partition tables, and the `mtdparts` string the kernel is told about them with.

/// Leads every rendered `mtdparts` value
pub const MTDPARTS_PREFIX: &str = "mtdparts=gpmi-nand:";

/// Room given to each rendered entry, separator included
pub const MTDPART_ENTRY_MAX: usize = 30;

/// The partition whose size bounds an update image
pub const DOWNLOAD_PARTITION: &str = "download";

const SZ_1K: u32 = 1 << 10;
const SZ_1M: u32 = 1 << 20;
const SZ_256M: u64 = 256 << 20;
const SZ_512M: u64 = 512 << 20;
const SZ_2G: u64 = 2 << 30;

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum PartitionError {
    #[error("no partition table for a NAND of {} MiB", .0 >> 20)]
    UnsupportedSize(u64),

    #[error("mtdparts does not fit in {0} bytes")]
    Truncated(usize),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Partition {
    pub offset: u32,
    pub size: u32,
    pub name: &'static str,
}

const fn part(offset: u32, size: u32, name: &'static str) -> Partition {
    Partition { offset, size, name }
}

pub const PARTITIONS_256M: &[Partition] = &[
    part(0x0000_0000, 0x0080_0000, "u-boot"),
    part(0x0080_0000, 0x0008_0000, "u-boot-env"),
    part(0x0088_0000, 0x0008_0000, "constants"),
    part(0x0090_0000, 0x0080_0000, "settings"),
    part(0x0110_0000, 0x00C0_0000, "fit"),
    part(0x01D0_0000, 0x0730_0000, "rootfs"),
    part(0x0900_0000, 0x0700_0000, "download"),
];

pub const PARTITIONS_512M: &[Partition] = &[
    part(0x0000_0000, 0x0080_0000, "u-boot"),
    part(0x0080_0000, 0x0008_0000, "u-boot-env"),
    part(0x0088_0000, 0x0008_0000, "constants"),
    part(0x0090_0000, 0x0800_0000, "settings"),
    part(0x0890_0000, 0x00C0_0000, "fit"),
    part(0x0950_0000, 0x0C10_0000, "rootfs"),
    part(0x1560_0000, 0x0AA0_0000, "download"),
];

/// Pick the table for a NAND of `flash_size` bytes.
///
/// 2 GiB parts deliberately use the 512 MiB table; the space above it is left alone.
pub fn select_table(flash_size: u64) -> Result<&'static [Partition], PartitionError> {
    match flash_size {
        SZ_256M => Ok(PARTITIONS_256M),
        SZ_512M | SZ_2G => Ok(PARTITIONS_512M),
        _ => Err(PartitionError::UnsupportedSize(flash_size)),
    }
}

/// The `<size><k|M>(<name>)` form of one partition
pub fn render_partition(part: &Partition) -> String {
    if part.size < SZ_1M {
        format!("{}k({})", part.size / SZ_1K, part.name)
    } else {
        format!("{}M({})", part.size / SZ_1M, part.name)
    }
}

/// The bounded output size used on the device: the prefix plus a fixed allowance per entry
pub fn default_capacity(table: &[Partition]) -> usize {
    MTDPARTS_PREFIX.len() + table.len() * MTDPART_ENTRY_MAX
}

/// Render `table` into at most `capacity` bytes.
///
/// An entry that overflows its own allowance, or a string that overflows `capacity`, is an error;
/// nothing is ever cut short.
pub fn render_mtdparts(table: &[Partition], capacity: usize) -> Result<String, PartitionError> {
    let mut out = String::from(MTDPARTS_PREFIX);

    for (i, part) in table.iter().enumerate() {
        let mut entry = render_partition(part);
        if i + 1 != table.len() {
            entry.push(',');
        }

        // The device renders each entry into a fixed buffer that also holds a NUL
        if entry.len() >= MTDPART_ENTRY_MAX {
            return Err(PartitionError::Truncated(MTDPART_ENTRY_MAX));
        }
        if out.len() + entry.len() > capacity {
            return Err(PartitionError::Truncated(capacity));
        }
        out.push_str(&entry);
    }

    Ok(out)
}

/// Everything the environment learns from the partition layout
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct MtdSetup {
    pub mtdparts: String,

    /// Size of the download partition in KiB
    pub download_size_kib: Option<u32>,

    pub page_size: usize,
}

impl MtdSetup {
    /// Select and render the table for a NAND of the given geometry.
    pub fn new(flash_size: u64, page_size: usize) -> Result<Self, PartitionError> {
        let table = select_table(flash_size)?;
        log::info!("Setting partitions for {} MiB flash", flash_size >> 20);

        let mtdparts = render_mtdparts(table, default_capacity(table))?;
        log::info!("Setting mtdparts: {mtdparts}");

        let download_size_kib = table
            .iter()
            .find(|part| part.name == DOWNLOAD_PARTITION)
            .map(|part| part.size / SZ_1K);

        Ok(Self {
            mtdparts,
            download_size_kib,
            page_size,
        })
    }

    /// The `(name, value)` environment variables to set
    pub fn env_vars(&self) -> Vec<(&'static str, String)> {
        let mut vars = vec![("mtdparts", self.mtdparts.clone())];
        if let Some(size) = self.download_size_kib {
            vars.push(("mtd_download_size", size.to_string()));
        }
        vars.push(("mtd_pagesize", self.page_size.to_string()));
        vars
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_select_table() {
        assert_eq!(select_table(SZ_256M), Ok(PARTITIONS_256M));
        assert_eq!(select_table(SZ_512M), Ok(PARTITIONS_512M));
        assert_eq!(select_table(SZ_2G), Ok(PARTITIONS_512M));
        assert_eq!(
            select_table(1 << 30),
            Err(PartitionError::UnsupportedSize(1 << 30))
        );
    }

    #[test]
    fn test_tables_are_contiguous() {
        for table in [PARTITIONS_256M, PARTITIONS_512M] {
            for pair in table.windows(2) {
                assert_eq!(pair[0].offset + pair[0].size, pair[1].offset);
            }
        }
        let last = PARTITIONS_256M[PARTITIONS_256M.len() - 1];
        assert_eq!((last.offset + last.size) as u64, SZ_256M);
    }

    #[test]
    fn test_render() -> anyhow::Result<()> {
        let s = render_mtdparts(PARTITIONS_256M, default_capacity(PARTITIONS_256M))?;
        assert_eq!(
            s,
            "mtdparts=gpmi-nand:8M(u-boot),512k(u-boot-env),512k(constants),8M(settings),\
             12M(fit),115M(rootfs),112M(download)"
        );

        let s = render_mtdparts(PARTITIONS_512M, default_capacity(PARTITIONS_512M))?;
        assert!(s.ends_with(",128M(settings),12M(fit),193M(rootfs),170M(download)"));
        Ok(())
    }

    #[test]
    fn test_render_overflow() {
        // Too small a buffer is an error, not a shortened string
        let capacity = MTDPARTS_PREFIX.len() + 20;
        assert_eq!(
            render_mtdparts(PARTITIONS_256M, capacity),
            Err(PartitionError::Truncated(capacity))
        );

        let long = [part(0, SZ_1M, "a-partition-name-that-is-too-long")];
        assert_eq!(
            render_mtdparts(&long, usize::MAX),
            Err(PartitionError::Truncated(MTDPART_ENTRY_MAX))
        );
    }

    #[test]
    fn test_mtd_setup() -> anyhow::Result<()> {
        let setup = MtdSetup::new(SZ_512M, 4096)?;
        assert_eq!(setup.download_size_kib, Some(0x0AA0_0000 / 1024));

        let vars = setup.env_vars();
        assert_eq!(vars[1], ("mtd_download_size", "174080".to_string()));
        assert_eq!(vars[2], ("mtd_pagesize", "4096".to_string()));
        Ok(())
    }
}
