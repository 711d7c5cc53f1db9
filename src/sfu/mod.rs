//! The SFU ("S800_UPD") firmware update container.
//!
//! An image is a fixed 40-byte global header, followed by `opt_count` global options, followed by
//! one option group per chunk:
//!
//! ```text
//! GlobalHeader: magic[8] | fmt_version[4] | total_length[4] | crc32[4] | version[16] | opt_count[4]
//! Option:       id[4] | length[4] | payload[length]
//! ChunkGroup:   opt_count[4] | Option*
//! ```
//!
//! All integers are little-endian. The global CRC32 covers everything from the version field up
//! to `total_length`. Chunk payloads live anywhere in the image and are located by the `data`
//! option, an offset from the start of the image.

pub mod builder;
pub mod decrypt;
pub mod headers;
pub mod parser;
pub mod store;
pub mod validate;

pub use headers::{ChunkHeader, ChunkOption, GlobalHeader, HdrFlags, OptionHeader, Version};
pub use parser::SfuParser;
pub use store::{RamSource, SeekSource, SfuSource};
pub use validate::{check_magic, validate, validate_source};

use crc::{Crc, CRC_32_ISO_HDLC};

/// Expected value of the global header's magic field
pub const SFU_MAGIC: &[u8; 8] = b"S800_UPD";

/// Newest image format this parser understands
pub const MAX_IMG_FMT_VERSION: u32 = 1;

pub const GLOBAL_HDR_LEN: usize = 40;
pub const GLOBAL_OPT_CNT_OFFSET: usize = GLOBAL_HDR_LEN - 4;
pub const GLOBAL_CRC_OFFSET: usize = 16;
/// The global CRC32 is computed from here (the global version field) onwards
pub const GLOBAL_CRC_CALC_OFFSET: usize = 20;

pub const OPTION_HDR_LEN: usize = 8;
pub const MAX_OPTION_DATA_LEN: u32 = 512;

pub const DEST_LEN: usize = 32;
pub const MD5_LEN: usize = 16;
pub const SHA256_LEN: usize = 32;

/// The CRC32 used for the global and per-chunk checksums (zlib's `crc32(0, ...)`)
pub const SFU_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A four-character option identifier
pub type OptionId = [u8; 4];

pub const GLBL_CHNK_ID: OptionId = *b"CHNK";

pub const CHNK_OPT_ID_VERS: OptionId = *b"vers";
pub const CHNK_OPT_ID_SIZE: OptionId = *b"size";
pub const CHNK_OPT_ID_DATA: OptionId = *b"data";
pub const CHNK_OPT_ID_DEST: OptionId = *b"dest";
pub const CHNK_OPT_ID_MD5: OptionId = *b"md5_";
pub const CHNK_OPT_ID_SHA2: OptionId = *b"sha2";
pub const CHNK_OPT_ID_CR32: OptionId = *b"cr32";
pub const CHNK_OPT_ID_ENCM: OptionId = *b"encm";

/// Values of the `encm` chunk option
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u32)]
pub enum EncryptionMethod {
    None = 0,

    /// Blowfish-ECB over the padded payload, with the original length in the final 4 bytes
    Blowfish = 1,
}

impl TryFrom<u32> for EncryptionMethod {
    type Error = u32;

    fn try_from(value: u32) -> Result<Self, u32> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Blowfish),
            x => Err(x),
        }
    }
}

/// Result codes of image validation. The numeric values are part of the script interface.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
#[repr(i32)]
pub enum ValidityCode {
    #[error("image is valid")]
    Valid = 0,

    #[error("bad magic")]
    MagicError = -1,

    #[error("total length exceeds the download partition")]
    TotalLengthError = -2,

    #[error("unsupported image format version")]
    FormatVersionError = -3,

    #[error("CRC32 mismatch")]
    Crc32Error = -4,

    #[error("image could not be read")]
    FileError = -5,

    #[error("MD5 mismatch")]
    Md5Error = -6,

    #[error("SHA-256 mismatch")]
    Sha256Error = -7,

    #[error("chunk header could not be parsed")]
    ParseError = -8,
}

impl ValidityCode {
    pub fn is_valid(self) -> bool {
        self == ValidityCode::Valid
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Render an option id for messages, e.g. `"md5_"`
pub fn id_str(id: &OptionId) -> String {
    format!("{:?}", String::from_utf8_lossy(id))
}

/// Structural problems in an image
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum FormatError {
    #[error("bad magic {0:02x?}")]
    BadMagic([u8; 8]),

    #[error("image format version {0} is newer than {}", MAX_IMG_FMT_VERSION)]
    UnsupportedVersion(u32),

    #[error("unknown chunk option {}", id_str(.0))]
    UnknownOption(OptionId),

    #[error("option {} is {} bytes, more than {}", id_str(.0), .1, MAX_OPTION_DATA_LEN)]
    OptionTooLong(OptionId, u32),

    #[error("option {} payload is {} bytes, too short for its value", id_str(.0), .1)]
    OptionTooShort(OptionId, u32),

    #[error("access of {len} bytes at offset {offset:#x} runs past the end of the image")]
    Truncated { offset: u64, len: u64 },
}

/// Something a query asked for is absent from the image
#[derive(Debug, thiserror::Error, Eq, PartialEq)]
pub enum NotFound {
    #[error("no CHNK global option")]
    ChunkCount,

    #[error("chunk {0} requested, but the image has {1} chunks")]
    Chunk(u32, u32),

    #[error("no chunk with destination {0:?}")]
    Dest(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DecryptError {
    #[error("no decryption key is configured")]
    MissingKey,

    #[error(transparent)]
    Key(#[from] crate::blowfish::KeyError),

    #[error("padded length {0:#x} is not a non-zero multiple of the block size")]
    BadPadding(usize),

    #[error("padded length {padded:#x} cannot hold original length {original:#x}")]
    LengthMismatch { padded: usize, original: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum SfuError {
    #[error("error accessing image")]
    FileIo(#[from] std::io::Error),

    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    NotFound(#[from] NotFound),

    #[error("integrity check failed: {0}")]
    Integrity(ValidityCode),

    #[error("decryption failed")]
    Decrypt(#[from] DecryptError),
}
