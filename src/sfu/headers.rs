//! Fixed-layout headers of an SFU image, and the decoded chunk header they describe.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use anyhow::Context;
use bitflags::bitflags;
use bytes::{Buf, BufMut, BytesMut};
pub use deku::{DekuContainerRead, DekuContainerWrite, DekuRead, DekuWrite};

use super::{
    FormatError, OptionId, CHNK_OPT_ID_CR32, CHNK_OPT_ID_DATA, CHNK_OPT_ID_DEST, CHNK_OPT_ID_ENCM,
    CHNK_OPT_ID_MD5, CHNK_OPT_ID_SHA2, CHNK_OPT_ID_SIZE, CHNK_OPT_ID_VERS, DEST_LEN,
    GLOBAL_HDR_LEN, MD5_LEN, SFU_CRC, SFU_MAGIC, SHA256_LEN,
};

/// A version quad, as found in the global header and in `vers` chunk options
#[derive(Debug, Default, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(
    endian = "endian",
    ctx = "endian: deku::ctx::Endian",
    ctx_default = "deku::ctx::Endian::Little"
)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
    pub commitcnt: u32,
    pub githash: u32,
}

impl Version {
    pub const LEN: usize = 16;

    pub fn new(major: u32, minor: u32, commitcnt: u32, githash: u32) -> Self {
        Self {
            major,
            minor,
            commitcnt,
            githash,
        }
    }

    fn from_payload(id: OptionId, mut payload: &[u8]) -> Result<Self, FormatError> {
        if payload.len() < Self::LEN {
            return Err(FormatError::OptionTooShort(id, payload.len() as u32));
        }

        Ok(Self {
            major: payload.get_u32_le(),
            minor: payload.get_u32_le(),
            commitcnt: payload.get_u32_le(),
            githash: payload.get_u32_le(),
        })
    }

    fn put(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.major);
        buf.put_u32_le(self.minor);
        buf.put_u32_le(self.commitcnt);
        buf.put_u32_le(self.githash);
    }
}

/// Formats as the `%08x.%08x.%08x.%08x` string exported to scripts
impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:08x}.{:08x}.{:08x}.{:08x}",
            self.major, self.minor, self.commitcnt, self.githash
        )
    }
}

/// Parses the exported form back, four dot-separated hex fields
impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let fields: Vec<u32> = s
            .split('.')
            .map(|field| u32::from_str_radix(field, 16))
            .collect::<Result<_, _>>()
            .with_context(|| format!("bad version {s:?}"))?;

        match fields[..] {
            [major, minor, commitcnt, githash] => Ok(Self::new(major, minor, commitcnt, githash)),
            _ => anyhow::bail!("version {s:?} needs four fields"),
        }
    }
}

/// The global header at the very start of every image
#[derive(Debug, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct GlobalHeader {
    pub magic: [u8; 8],
    pub img_fmt_version: u32,
    pub total_length: u32,
    pub global_crc32: u32,
    pub global_version: Version,
    pub global_options_count: u32,
}

impl GlobalHeader {
    /// A header for a fresh image; length and CRC are filled in later.
    pub fn new(version: Version) -> Self {
        Self {
            magic: *SFU_MAGIC,
            img_fmt_version: super::MAX_IMG_FMT_VERSION,
            total_length: GLOBAL_HDR_LEN as u32,
            global_crc32: 0,
            global_version: version,
            global_options_count: 0,
        }
    }

    /// Decode the header from the first [`GLOBAL_HDR_LEN`] bytes of `buf`.
    pub fn parse(buf: &[u8]) -> Result<Self, FormatError> {
        let truncated = FormatError::Truncated {
            offset: 0,
            len: GLOBAL_HDR_LEN as u64,
        };
        if buf.len() < GLOBAL_HDR_LEN {
            return Err(truncated);
        }

        Self::from_bytes((buf, 0))
            .map(|(_, header)| header)
            .map_err(|_| truncated)
    }

    pub fn magic_valid(&self) -> bool {
        &self.magic == SFU_MAGIC
    }

    /// Compute the global CRC32 over an image whose header is `self`.
    ///
    /// Returns `None` if the image is shorter than the header claims.
    pub fn compute_crc(&self, image: &[u8]) -> Option<u32> {
        let range = super::GLOBAL_CRC_CALC_OFFSET..self.total_length as usize;
        image.get(range).map(|data| SFU_CRC.checksum(data))
    }
}

/// The `id | length` prefix of every option record
#[derive(Debug, Copy, Clone, Eq, PartialEq, DekuRead, DekuWrite)]
#[deku(endian = "little")]
pub struct OptionHeader {
    pub id: [u8; 4],
    pub length: u32,
}

bitflags! {
    /// Which options were present in a chunk's option group
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq)]
    pub struct HdrFlags: u32 {
        const VERS = 0x01;
        const SIZE = 0x02;
        const DATA = 0x04;
        const DEST = 0x08;
        const MD5_ = 0x10;
        const SHA2 = 0x20;
        const CR32 = 0x40;
        const ENCM = 0x80;

        /// A chunk missing any of these is not an installable chunk
        const MINIMUM = Self::VERS.bits()
            | Self::SIZE.bits()
            | Self::DATA.bits()
            | Self::DEST.bits()
            | Self::ENCM.bits();
    }
}

/// The decoded metadata of one chunk
#[derive(Debug, Default, Clone, Eq, PartialEq)]
pub struct ChunkHeader {
    pub hdr_flag: HdrFlags,
    pub version: Version,
    pub size: u32,
    /// Offset of the payload from the start of the image
    pub data: u32,
    pub dest: [u8; DEST_LEN],
    pub md5: [u8; MD5_LEN],
    pub sha256: [u8; SHA256_LEN],
    pub crc32: u32,
    pub encryption_method: u32,
}

fn le32(id: OptionId, payload: &[u8]) -> Result<u32, FormatError> {
    match payload {
        [a, b, c, d, ..] => Ok(u32::from_le_bytes([*a, *b, *c, *d])),
        _ => Err(FormatError::OptionTooShort(id, payload.len() as u32)),
    }
}

/// Copy a fixed-size field; a short payload leaves the remainder zeroed.
fn fixed<const N: usize>(payload: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    let len = payload.len().min(N);
    out[..len].copy_from_slice(&payload[..len]);
    out
}

impl ChunkHeader {
    /// Record one option of this chunk's group.
    ///
    /// Numeric options use the first four payload bytes, whatever the declared length. Fixed-size
    /// fields (`dest`, `md5_`, `sha2`) copy exactly their own size.
    pub fn apply_option(&mut self, id: OptionId, payload: &[u8]) -> Result<(), FormatError> {
        match id {
            CHNK_OPT_ID_VERS => {
                self.version = Version::from_payload(id, payload)?;
                self.hdr_flag |= HdrFlags::VERS;
                log::debug!("VERSION ({}) HDRFLAG({:08x})", self.version, self.hdr_flag.bits());
            }
            CHNK_OPT_ID_SIZE => {
                self.size = le32(id, payload)?;
                self.hdr_flag |= HdrFlags::SIZE;
                log::debug!("SIZE ({:08x}) HDRFLAG({:08x})", self.size, self.hdr_flag.bits());
            }
            CHNK_OPT_ID_DATA => {
                self.data = le32(id, payload)?;
                self.hdr_flag |= HdrFlags::DATA;
                log::debug!("DATA ({:08x}) HDRFLAG({:08x})", self.data, self.hdr_flag.bits());
            }
            CHNK_OPT_ID_DEST => {
                self.dest = fixed(payload);
                self.hdr_flag |= HdrFlags::DEST;
                log::debug!("DEST ({}) HDRFLAG({:08x})", self.dest_str(), self.hdr_flag.bits());
            }
            CHNK_OPT_ID_MD5 => {
                self.md5 = fixed(payload);
                self.hdr_flag |= HdrFlags::MD5_;
                log::debug!("MD5_ ({}) HDRFLAG({:08x})", self.md5_hex(), self.hdr_flag.bits());
            }
            CHNK_OPT_ID_SHA2 => {
                self.sha256 = fixed(payload);
                self.hdr_flag |= HdrFlags::SHA2;
                log::debug!("SHA256 ({}) HDRFLAG({:08x})", self.sha256_hex(), self.hdr_flag.bits());
            }
            CHNK_OPT_ID_CR32 => {
                self.crc32 = le32(id, payload)?;
                self.hdr_flag |= HdrFlags::CR32;
                log::debug!("CRC32 ({:08x}) HDRFLAG({:08x})", self.crc32, self.hdr_flag.bits());
            }
            CHNK_OPT_ID_ENCM => {
                self.encryption_method = le32(id, payload)?;
                self.hdr_flag |= HdrFlags::ENCM;
                log::debug!(
                    "ENCM ({:08x}) HDRFLAG({:08x})",
                    self.encryption_method,
                    self.hdr_flag.bits()
                );
            }
            _ => return Err(FormatError::UnknownOption(id)),
        }

        Ok(())
    }

    /// Does this chunk carry every option needed to install it?
    pub fn is_minimal(&self) -> bool {
        self.hdr_flag.contains(HdrFlags::MINIMUM)
    }

    /// The destination name, up to the first NUL
    pub fn dest_bytes(&self) -> &[u8] {
        let end = self.dest.iter().position(|&x| x == 0).unwrap_or(DEST_LEN);
        &self.dest[..end]
    }

    pub fn dest_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(self.dest_bytes())
    }

    pub fn md5_hex(&self) -> String {
        hex::encode(self.md5)
    }

    pub fn sha256_hex(&self) -> String {
        hex::encode(self.sha256)
    }
}

/// One chunk option, in the form an image producer works with
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ChunkOption {
    Vers(Version),
    Size(u32),
    Data(u32),
    Dest(String),
    Md5([u8; MD5_LEN]),
    Sha2([u8; SHA256_LEN]),
    Cr32(u32),
    Encm(u32),
}

impl ChunkOption {
    pub fn id(&self) -> OptionId {
        match self {
            ChunkOption::Vers(_) => CHNK_OPT_ID_VERS,
            ChunkOption::Size(_) => CHNK_OPT_ID_SIZE,
            ChunkOption::Data(_) => CHNK_OPT_ID_DATA,
            ChunkOption::Dest(_) => CHNK_OPT_ID_DEST,
            ChunkOption::Md5(_) => CHNK_OPT_ID_MD5,
            ChunkOption::Sha2(_) => CHNK_OPT_ID_SHA2,
            ChunkOption::Cr32(_) => CHNK_OPT_ID_CR32,
            ChunkOption::Encm(_) => CHNK_OPT_ID_ENCM,
        }
    }

    /// Append the complete option record (header and payload) to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let mut payload = BytesMut::new();
        match self {
            ChunkOption::Vers(version) => version.put(&mut payload),
            ChunkOption::Size(x)
            | ChunkOption::Data(x)
            | ChunkOption::Cr32(x)
            | ChunkOption::Encm(x) => payload.put_u32_le(*x),
            ChunkOption::Dest(name) => {
                payload.put_slice(&fixed::<DEST_LEN>(name.as_bytes()));
            }
            ChunkOption::Md5(hash) => payload.put_slice(hash),
            ChunkOption::Sha2(hash) => payload.put_slice(hash),
        }

        buf.put_slice(&self.id());
        buf.put_u32_le(payload.len() as u32);
        buf.put(payload);
    }
}

#[test]
fn test_version_text() -> anyhow::Result<()> {
    let version: Version = "1.0.0.abc".parse()?;
    assert_eq!(version, Version::new(1, 0, 0, 0xabc));
    assert_eq!(version.to_string(), "00000001.00000000.00000000.00000abc");
    assert_eq!(version.to_string().parse::<Version>()?, version);
    assert!("1.2.3".parse::<Version>().is_err());
    assert!("1.2.3.xyz".parse::<Version>().is_err());
    Ok(())
}

#[test]
fn test_global_header_layout() -> anyhow::Result<()> {
    let mut header = GlobalHeader::new(Version::new(1, 2, 3, 0xabc));
    header.global_options_count = 7;
    header.total_length = 0x1234;

    let bytes = header.to_bytes()?;
    assert_eq!(bytes.len(), GLOBAL_HDR_LEN);
    assert_eq!(&bytes[0..8], b"S800_UPD");
    assert_eq!(&bytes[8..12], &[1, 0, 0, 0]);
    assert_eq!(&bytes[12..16], &[0x34, 0x12, 0, 0]);
    assert_eq!(&bytes[20..24], &[1, 0, 0, 0]);
    assert_eq!(&bytes[32..36], &[0xbc, 0x0a, 0, 0]);
    assert_eq!(&bytes[super::GLOBAL_OPT_CNT_OFFSET..], &[7, 0, 0, 0]);

    assert_eq!(GlobalHeader::parse(&bytes)?, header);
    assert!(GlobalHeader::parse(&bytes[..39]).is_err());
    Ok(())
}

#[test]
fn test_version_display() {
    let version = Version::new(1, 0, 0, 0xabc);
    assert_eq!(version.to_string(), "00000001.00000000.00000000.00000abc");
}

#[test]
fn test_apply_option_lengths() -> anyhow::Result<()> {
    let mut header = ChunkHeader::default();

    // Numeric options only look at the first four bytes
    header.apply_option(CHNK_OPT_ID_CR32, &[0x78, 0x56, 0x34, 0x12, 0xff, 0xff])?;
    assert_eq!(header.crc32, 0x12345678);

    // Names are cut at the first NUL, and short payloads are zero-filled
    header.apply_option(CHNK_OPT_ID_DEST, b"fit")?;
    assert_eq!(header.dest_bytes(), b"fit");

    assert_eq!(
        header.apply_option(CHNK_OPT_ID_SIZE, &[1, 2]),
        Err(FormatError::OptionTooShort(CHNK_OPT_ID_SIZE, 2))
    );
    assert_eq!(
        header.apply_option(*b"xxxx", &[0; 4]),
        Err(FormatError::UnknownOption(*b"xxxx"))
    );

    assert_eq!(header.hdr_flag, HdrFlags::CR32 | HdrFlags::DEST);
    assert!(!header.is_minimal());
    Ok(())
}
