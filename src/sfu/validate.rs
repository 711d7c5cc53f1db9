//! The integrity gate an image must pass before anything is flashed from it.

use md5::{Digest, Md5};
use sha2::Sha256;

use super::headers::{ChunkHeader, GlobalHeader, HdrFlags};
use super::store::{RamSource, SfuSource};
use super::{
    SfuError, SfuParser, ValidityCode, GLOBAL_CRC_CALC_OFFSET, MAX_IMG_FMT_VERSION, SFU_CRC,
};

/// Map a parser failure to a validity code, keeping I/O trouble distinguishable.
fn code_for(err: &SfuError, otherwise: ValidityCode) -> ValidityCode {
    match err {
        SfuError::FileIo(_) => ValidityCode::FileError,
        _ => otherwise,
    }
}

/// The magic and total length checks, which need nothing but the header.
///
/// `max_size` of 0 means the image may be any length.
fn check_header(header: &GlobalHeader, max_size: u32) -> ValidityCode {
    if !header.magic_valid() {
        log::error!(
            "IMG_VALIDITY__MAGIC_ERROR: magic {:02x?}",
            header.magic
        );
        return ValidityCode::MagicError;
    }

    if max_size != 0 && header.total_length > max_size {
        log::error!(
            "IMG_VALIDITY__TOTLEN_ERROR: length {:#010x} max_size {:#010x}",
            header.total_length,
            max_size
        );
        return ValidityCode::TotalLengthError;
    }

    ValidityCode::Valid
}

/// Check magic and total length of an image in memory, returning its header.
pub fn check_magic(image: &[u8], max_size: u32) -> Result<GlobalHeader, ValidityCode> {
    let header = SfuParser::from_slice(image)
        .global_header()
        .map_err(|_| ValidityCode::MagicError)?;

    match check_header(&header, max_size) {
        ValidityCode::Valid => Ok(header),
        code => Err(code),
    }
}

/// Validate an image staged in memory.
pub fn validate(image: &[u8], max_size: u32) -> ValidityCode {
    validate_source(RamSource::new(image), max_size)
}

/// Validate an image from any backing store.
///
/// Checks run in a fixed order and stop at the first failure: magic, total length, format
/// version, global CRC32, then the digests of every installable chunk.
pub fn validate_source<S: SfuSource>(source: S, max_size: u32) -> ValidityCode {
    let mut parser = SfuParser::new(source);

    let header = match parser.global_header() {
        Ok(header) => header,
        Err(err) => {
            log::error!("could not read global header: {err}");
            return code_for(&err, ValidityCode::MagicError);
        }
    };

    let code = check_header(&header, max_size);
    if !code.is_valid() {
        return code;
    }

    if header.img_fmt_version > MAX_IMG_FMT_VERSION {
        log::error!(
            "IMG_VALIDITY__FMTVER_ERROR: version {} supported {}",
            header.img_fmt_version,
            MAX_IMG_FMT_VERSION
        );
        return ValidityCode::FormatVersionError;
    }

    let crc_offset = GLOBAL_CRC_CALC_OFFSET as u64;
    let crc_len = (header.total_length as u64).saturating_sub(crc_offset);
    let mut digest = SFU_CRC.digest();
    let read = parser
        .source_mut()
        .for_each_piece(crc_offset, crc_len, &mut |piece| digest.update(piece));
    let calculated = read.map(|()| digest.finalize());
    match calculated {
        Ok(crc) if crc == header.global_crc32 => (),
        Ok(crc) => {
            log::error!(
                "IMG_VALIDITY__CRC32_ERROR: calculated {crc:08x} file {:08x}",
                header.global_crc32
            );
            return ValidityCode::Crc32Error;
        }
        Err(err) => {
            log::error!("IMG_VALIDITY__CRC32_ERROR: {err}");
            return code_for(&err, ValidityCode::Crc32Error);
        }
    }

    let count = match parser.num_chunks() {
        Ok(count) => count,
        Err(err) => {
            log::error!("could not get the number of chunks: {err}");
            return code_for(&err, ValidityCode::Crc32Error);
        }
    };

    for chunk_number in 1..=count {
        let chunk = match parser.chunk_header(chunk_number) {
            Ok(chunk) => chunk,
            Err(err) => {
                log::error!("could not parse header of chunk {chunk_number}: {err}");
                return code_for(&err, ValidityCode::ParseError);
            }
        };

        if !chunk.is_minimal() {
            log::debug!("chunk {chunk_number} is not installable, not checking digests");
            continue;
        }

        let code = check_chunk(parser.source_mut(), chunk_number, &chunk);
        if !code.is_valid() {
            return code;
        }
    }

    ValidityCode::Valid
}

fn check_chunk<S: SfuSource>(source: &mut S, chunk_number: u32, chunk: &ChunkHeader) -> ValidityCode {
    let offset = chunk.data as u64;
    let len = chunk.size as u64;

    if chunk.hdr_flag.contains(HdrFlags::CR32) {
        let mut digest = SFU_CRC.digest();
        let read = source.for_each_piece(offset, len, &mut |piece| digest.update(piece));
        let calculated = read.map(|()| digest.finalize());
        match calculated {
            Ok(crc) if crc == chunk.crc32 => (),
            Ok(crc) => {
                log::error!(
                    "IMG_VALIDITY__CRC32_ERROR: chunk {chunk_number} calculated {crc:08x} file {:08x}",
                    chunk.crc32
                );
                return ValidityCode::Crc32Error;
            }
            Err(err) => {
                log::error!("IMG_VALIDITY__CRC32_ERROR: chunk {chunk_number}: {err}");
                return code_for(&err, ValidityCode::Crc32Error);
            }
        }
    }

    if chunk.hdr_flag.contains(HdrFlags::MD5_) {
        let mut hasher = Md5::new();
        let read = source.for_each_piece(offset, len, &mut |piece| hasher.update(piece));
        let calculated = read.map(|()| hasher.finalize());
        match calculated {
            Ok(hash) if hash.as_slice() == chunk.md5 => (),
            Ok(hash) => {
                log::error!(
                    "IMG_VALIDITY__MD5_ERROR: chunk {chunk_number} calculated {} file {}",
                    hex::encode(hash),
                    chunk.md5_hex()
                );
                return ValidityCode::Md5Error;
            }
            Err(err) => {
                log::error!("IMG_VALIDITY__MD5_ERROR: chunk {chunk_number}: {err}");
                return code_for(&err, ValidityCode::Md5Error);
            }
        }
    }

    if chunk.hdr_flag.contains(HdrFlags::SHA2) {
        let mut hasher = Sha256::new();
        let read = source.for_each_piece(offset, len, &mut |piece| hasher.update(piece));
        let calculated = read.map(|()| hasher.finalize());
        match calculated {
            Ok(hash) if hash.as_slice() == chunk.sha256 => (),
            Ok(hash) => {
                log::error!(
                    "IMG_VALIDITY__SHA256_ERROR: chunk {chunk_number} calculated {} file {}",
                    hex::encode(hash),
                    chunk.sha256_hex()
                );
                return ValidityCode::Sha256Error;
            }
            Err(err) => {
                log::error!("IMG_VALIDITY__SHA256_ERROR: chunk {chunk_number}: {err}");
                return code_for(&err, ValidityCode::Sha256Error);
            }
        }
    }

    ValidityCode::Valid
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sfu::builder::{Chunk, ImageBuilder};
    use crate::sfu::headers::{ChunkOption, Version};
    use crate::sfu::{GLOBAL_CRC_OFFSET, GLOBAL_HDR_LEN, SeekSource};
    use proptest::prelude::*;
    use std::io::Cursor;

    const TOTAL_LENGTH_OFFSET: usize = 12;

    fn scenario_image() -> anyhow::Result<Vec<u8>> {
        ImageBuilder::new(Version::new(1, 0, 0, 0xabc))
            .chunk(Chunk::new("rootfs", Version::new(1, 0, 0, 0xabc), [0x5a; 16]))
            .build()
    }

    /// Rewrite the global CRC after tampering with the image.
    fn reseal(image: &mut [u8]) {
        let crc = SFU_CRC.checksum(&image[GLOBAL_CRC_CALC_OFFSET..]);
        image[GLOBAL_CRC_OFFSET..GLOBAL_CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());
    }

    #[test]
    fn test_valid_image() -> anyhow::Result<()> {
        let image = scenario_image()?;
        assert_eq!(validate(&image, 0), ValidityCode::Valid);
        assert_eq!(validate(&image, image.len() as u32), ValidityCode::Valid);
        assert_eq!(
            validate_source(SeekSource::new(Cursor::new(image.clone()))?, 0),
            ValidityCode::Valid
        );

        let chunk = SfuParser::from_slice(&image).chunk_header(1)?;
        assert_eq!(chunk.dest_bytes(), b"rootfs");
        assert_eq!(chunk.size, 16);
        Ok(())
    }

    #[test]
    fn test_total_length_checked_before_crc() -> anyhow::Result<()> {
        let image = scenario_image()?;
        let max_size = image.len() as u32;

        let mut bad = image.clone();
        bad[TOTAL_LENGTH_OFFSET..TOTAL_LENGTH_OFFSET + 4]
            .copy_from_slice(&(max_size + 1).to_le_bytes());
        // The CRC is now stale as well, but the length is reported first
        assert_eq!(validate(&bad, max_size), ValidityCode::TotalLengthError);
        assert_eq!(check_magic(&bad, max_size), Err(ValidityCode::TotalLengthError));
        assert!(check_magic(&image, max_size).is_ok());
        Ok(())
    }

    #[test]
    fn test_header_checks() -> anyhow::Result<()> {
        let image = scenario_image()?;

        let mut bad = image.clone();
        bad[0] = b's';
        assert_eq!(validate(&bad, 0), ValidityCode::MagicError);
        assert_eq!(validate(&image[..20], 0), ValidityCode::MagicError);

        let bad = ImageBuilder::new(Version::default())
            .format_version(MAX_IMG_FMT_VERSION + 1)
            .build()?;
        assert_eq!(validate(&bad, 0), ValidityCode::FormatVersionError);

        // Total length beyond the end of the buffer
        let mut bad = image.clone();
        bad[TOTAL_LENGTH_OFFSET..TOTAL_LENGTH_OFFSET + 4]
            .copy_from_slice(&(image.len() as u32 + 1).to_le_bytes());
        assert_eq!(validate(&bad, 0), ValidityCode::Crc32Error);
        Ok(())
    }

    #[test]
    fn test_chunk_digests() -> anyhow::Result<()> {
        let version = Version::new(2, 0, 0, 0);
        let image = ImageBuilder::new(version)
            .chunk(Chunk::new("fit", version, vec![1; 300]).with_crc32())
            .chunk(Chunk::new("rootfs", version, vec![2; 300]).with_md5())
            .chunk(Chunk::new("u-boot", version, vec![3; 300]).with_sha256())
            .build()?;
        assert_eq!(validate(&image, 0), ValidityCode::Valid);

        let payload_start = image.len() - 900;
        for (chunk, expected) in [
            (0, ValidityCode::Crc32Error),
            (1, ValidityCode::Md5Error),
            (2, ValidityCode::Sha256Error),
        ] {
            let mut bad = image.clone();
            bad[payload_start + chunk * 300 + 17] ^= 0x80;
            reseal(&mut bad);
            assert_eq!(validate(&bad, 0), expected);
        }
        Ok(())
    }

    #[test]
    fn test_incomplete_chunks_are_not_checked() -> anyhow::Result<()> {
        // A chunk with a digest but without dest isn't installable, so its digest is ignored
        let image = ImageBuilder::new(Version::default())
            .chunk(Chunk::raw(vec![ChunkOption::Cr32(0xdeadbeef), ChunkOption::Size(4)]))
            .build()?;
        assert_eq!(validate(&image, 0), ValidityCode::Valid);

        // ...while a chunk that cannot be parsed fails validation
        let image = ImageBuilder::new(Version::default())
            .chunk(Chunk::raw(vec![ChunkOption::Cr32(0)]))
            .build()?;
        let mut bad = image.clone();
        let at = GLOBAL_HDR_LEN + 12 + 4;
        bad[at..at + 4].copy_from_slice(b"xxxx");
        reseal(&mut bad);
        assert_eq!(validate(&bad, 0), ValidityCode::ParseError);
        Ok(())
    }

    #[test]
    fn test_payload_out_of_bounds() -> anyhow::Result<()> {
        let version = Version::default();
        let image = ImageBuilder::new(version)
            .chunk(
                Chunk::new("fit", version, vec![1; 8])
                    .with_sha256()
                    .with_option(ChunkOption::Size(1 << 20)),
            )
            .build()?;
        assert_eq!(validate(&image, 0), ValidityCode::Sha256Error);
        Ok(())
    }

    #[test]
    fn test_payload_corruption_is_a_crc_error() -> anyhow::Result<()> {
        let image = scenario_image()?;
        let payload = SfuParser::from_slice(&image).chunk_header(1)?.data as usize;
        for index in [payload, image.len() - 1] {
            let mut bad = image.clone();
            bad[index] ^= 0x01;
            assert_eq!(validate(&bad, 0), ValidityCode::Crc32Error);
        }
        Ok(())
    }

    proptest! {
        #[test]
        fn corruption_is_a_crc_error(position in 0.0f64..1.0, flip in 1u8..=255) {
            let mut image = scenario_image().unwrap();
            // Anywhere from the version field to the last payload byte
            let covered = image.len() - GLOBAL_CRC_CALC_OFFSET;
            let offset = ((position * covered as f64) as usize).min(covered - 1);
            let index = GLOBAL_CRC_CALC_OFFSET + offset;
            image[index] ^= flip;
            prop_assert_eq!(validate(&image, 0), ValidityCode::Crc32Error);
        }
    }
}
