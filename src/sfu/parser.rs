//! Walking the option records of an image.
//!
//! Every query starts from the top of the image; nothing is cached between calls, so a parser can
//! be pointed at a partition that is rewritten underneath it.

use std::io::{Read, Seek};

use super::headers::{ChunkHeader, DekuContainerRead, GlobalHeader, OptionHeader, Version};
use super::store::{RamSource, SeekSource, SfuSource};
use super::{
    FormatError, NotFound, SfuError, GLBL_CHNK_ID, GLOBAL_HDR_LEN, GLOBAL_OPT_CNT_OFFSET,
    MAX_OPTION_DATA_LEN, OPTION_HDR_LEN,
};

#[derive(Debug)]
pub struct SfuParser<S> {
    source: S,
}

impl<'a> SfuParser<RamSource<'a>> {
    /// Parse an image staged in memory.
    pub fn from_slice(image: &'a [u8]) -> Self {
        Self::new(RamSource::new(image))
    }
}

impl<R: Read + Seek> SfuParser<SeekSource<R>> {
    /// Parse an image straight out of a file or device.
    pub fn from_reader(reader: R) -> Result<Self, SfuError> {
        Ok(Self::new(SeekSource::new(reader)?))
    }
}

impl<S: SfuSource> SfuParser<S> {
    pub fn new(source: S) -> Self {
        Self { source }
    }

    pub fn source_mut(&mut self) -> &mut S {
        &mut self.source
    }

    pub fn into_source(self) -> S {
        self.source
    }

    pub fn global_header(&mut self) -> Result<GlobalHeader, SfuError> {
        let mut buf = [0u8; GLOBAL_HDR_LEN];
        self.source.seek_to(0)?;
        self.source.read_exact(&mut buf)?;
        Ok(GlobalHeader::parse(&buf)?)
    }

    pub fn global_version(&mut self) -> Result<Version, SfuError> {
        Ok(self.global_header()?.global_version)
    }

    /// The chunk count from the `CHNK` global option.
    pub fn num_chunks(&mut self) -> Result<u32, SfuError> {
        Ok(self.scan_global_options()?.ok_or(NotFound::ChunkCount)?)
    }

    /// Decode the option group of chunk `chunk_number`, counting from 1.
    ///
    /// Earlier groups are skipped over without being interpreted, so an option id only this
    /// chunk's reader would reject does not poison the chunks around it. Every option, skipped or
    /// not, must respect [`MAX_OPTION_DATA_LEN`].
    pub fn chunk_header(&mut self, chunk_number: u32) -> Result<ChunkHeader, SfuError> {
        let count = self.scan_global_options()?.ok_or(NotFound::ChunkCount)?;
        if chunk_number == 0 || chunk_number > count {
            return Err(NotFound::Chunk(chunk_number, count).into());
        }

        let mut header = ChunkHeader::default();
        for index in 1..=chunk_number {
            let opt_count = self.source.read_u32_le()?;
            log::trace!("chunk {index}: {opt_count} options");

            for _ in 0..opt_count {
                let option = self.read_option_header()?;
                if option.length > MAX_OPTION_DATA_LEN {
                    log::error!(
                        "option {} of chunk {index} claims {} bytes",
                        super::id_str(&option.id),
                        option.length
                    );
                    return Err(FormatError::OptionTooLong(option.id, option.length).into());
                }

                if index == chunk_number {
                    let mut payload = vec![0u8; option.length as usize];
                    self.source.read_exact(&mut payload)?;
                    header.apply_option(option.id, &payload)?;
                } else {
                    self.source.skip(option.length as u64)?;
                }
            }
        }

        Ok(header)
    }

    /// Find the first installable chunk whose destination is exactly `dest`.
    pub fn find_chunk(&mut self, dest: &str) -> Result<(u32, ChunkHeader), SfuError> {
        let count = self.num_chunks()?;
        for chunk_number in 1..=count {
            let header = self.chunk_header(chunk_number)?;
            if header.is_minimal() && header.dest_bytes() == dest.as_bytes() {
                return Ok((chunk_number, header));
            }
        }

        Err(NotFound::Dest(dest.to_string()).into())
    }

    /// Walk every global option, leaving the source at the first chunk group.
    ///
    /// Returns the chunk count of the first `CHNK` option, if any.
    fn scan_global_options(&mut self) -> Result<Option<u32>, SfuError> {
        self.source.seek_to(GLOBAL_OPT_CNT_OFFSET as u64)?;
        let opt_count = self.source.read_u32_le()?;

        let mut chunks = None;
        for _ in 0..opt_count {
            let option = self.read_option_header()?;
            if option.id == GLBL_CHNK_ID && chunks.is_none() {
                if option.length < 4 {
                    return Err(FormatError::OptionTooShort(option.id, option.length).into());
                }
                let count = self.source.read_u32_le()?;
                log::debug!("CHNK ({count})");
                chunks = Some(count);
                self.source.skip(option.length as u64 - 4)?;
            } else {
                self.source.skip(option.length as u64)?;
            }
        }

        Ok(chunks)
    }

    fn read_option_header(&mut self) -> Result<OptionHeader, SfuError> {
        let offset = self.source.position();
        let mut buf = [0u8; OPTION_HDR_LEN];
        self.source.read_exact(&mut buf)?;

        let (_, header) = OptionHeader::from_bytes((&buf[..], 0)).map_err(|_| {
            FormatError::Truncated {
                offset,
                len: OPTION_HDR_LEN as u64,
            }
        })?;
        Ok(header)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::sfu::builder::{Chunk, ImageBuilder};
    use crate::sfu::headers::{ChunkOption, HdrFlags};
    use crate::sfu::{CHNK_OPT_ID_DEST, DEST_LEN, GLOBAL_CRC_OFFSET, MD5_LEN, SHA256_LEN};
    use bytes::{BufMut, BytesMut};
    use proptest::prelude::*;
    use std::io::Cursor;

    fn v(major: u32) -> Version {
        Version::new(major, 0, 0, 0)
    }

    fn two_chunk_image() -> anyhow::Result<Vec<u8>> {
        ImageBuilder::new(v(3))
            .global_option(*b"note", b"built by hand".to_vec())
            .chunk(Chunk::new("fit", v(1), vec![0x11; 100]).with_crc32())
            .chunk(Chunk::new("rootfs", v(2), vec![0x22; 50]).with_md5().with_sha256())
            .build()
    }

    #[test]
    fn test_parse_image() -> anyhow::Result<()> {
        let image = two_chunk_image()?;
        let mut parser = SfuParser::from_slice(&image);

        assert_eq!(parser.global_version()?, v(3));
        assert_eq!(parser.num_chunks()?, 2);

        let fit = parser.chunk_header(1)?;
        assert!(fit.is_minimal());
        assert_eq!(fit.dest_bytes(), b"fit");
        assert_eq!(fit.size, 100);
        assert!(fit.hdr_flag.contains(HdrFlags::CR32));
        assert_eq!(&image[fit.data as usize..][..100], &[0x11; 100]);

        let (number, rootfs) = parser.find_chunk("rootfs")?;
        assert_eq!(number, 2);
        assert_eq!(rootfs.version, v(2));
        assert!(rootfs.hdr_flag.contains(HdrFlags::MD5_ | HdrFlags::SHA2));
        assert_eq!(&image[rootfs.data as usize..][..50], &[0x22; 50]);

        assert!(matches!(
            parser.find_chunk("root"),
            Err(SfuError::NotFound(NotFound::Dest(_)))
        ));
        Ok(())
    }

    #[test]
    fn test_chunk_number_bounds() -> anyhow::Result<()> {
        let image = two_chunk_image()?;
        let mut parser = SfuParser::from_slice(&image);

        for n in [0, 3, u32::MAX] {
            assert!(matches!(
                parser.chunk_header(n),
                Err(SfuError::NotFound(NotFound::Chunk(_, 2)))
            ));
        }
        Ok(())
    }

    #[test]
    fn test_no_chunk_option() -> anyhow::Result<()> {
        let mut image = ImageBuilder::new(v(1)).build()?;
        // Drop the generated CHNK option
        image.truncate(GLOBAL_HDR_LEN);
        image[GLOBAL_OPT_CNT_OFFSET] = 0;

        let mut parser = SfuParser::from_slice(&image);
        assert!(matches!(
            parser.num_chunks(),
            Err(SfuError::NotFound(NotFound::ChunkCount))
        ));
        assert!(matches!(
            parser.chunk_header(1),
            Err(SfuError::NotFound(NotFound::ChunkCount))
        ));
        Ok(())
    }

    #[test]
    fn test_unknown_option_only_fails_its_chunk() -> anyhow::Result<()> {
        let mut odd = BytesMut::new();
        odd.put_u32_le(2);
        ChunkOption::Dest("odd".into()).encode(&mut odd);
        odd.put_slice(b"zzzz");
        odd.put_u32_le(4);
        odd.put_u32_le(0);

        // Splice the odd group in place of a placeholder first chunk
        let image = ImageBuilder::new(v(1))
            .chunk(Chunk::raw(vec![ChunkOption::Dest("odd".into())]))
            .chunk(Chunk::new("fit", v(1), *b"data"))
            .build()?;
        let mut placeholder = BytesMut::new();
        placeholder.put_u32_le(1);
        ChunkOption::Dest("odd".into()).encode(&mut placeholder);
        let at = image
            .windows(placeholder.len())
            .position(|w| w == &placeholder[..])
            .ok_or_else(|| anyhow::anyhow!("placeholder not found"))?;

        let mut spliced = image[..at].to_vec();
        spliced.extend_from_slice(&odd);
        spliced.extend_from_slice(&image[at + placeholder.len()..]);
        // Payload offsets move with the splice; only the headers matter here.

        let mut parser = SfuParser::from_slice(&spliced);
        assert!(matches!(
            parser.chunk_header(1),
            Err(SfuError::Format(FormatError::UnknownOption(id))) if &id == b"zzzz"
        ));

        let fit = parser.chunk_header(2)?;
        assert_eq!(fit.dest_bytes(), b"fit");
        assert!(fit.is_minimal());
        Ok(())
    }

    #[test]
    fn test_oversized_options() -> anyhow::Result<()> {
        let image = two_chunk_image()?;

        // Claim a huge dest option in chunk 1: fatal for chunk 1 and for chunks behind it
        let dest_at = image
            .windows(4)
            .position(|w| w == CHNK_OPT_ID_DEST)
            .ok_or_else(|| anyhow::anyhow!("no dest option"))?;
        let mut bad = image.clone();
        bad[dest_at + 4..dest_at + 8].copy_from_slice(&513u32.to_le_bytes());

        let mut parser = SfuParser::from_slice(&bad);
        for n in [1, 2] {
            assert!(matches!(
                parser.chunk_header(n),
                Err(SfuError::Format(FormatError::OptionTooLong(_, 513)))
            ));
        }

        // A global option running off the end of the image
        let mut bad = image.clone();
        bad[GLOBAL_HDR_LEN + 4..GLOBAL_HDR_LEN + 8].copy_from_slice(&0xffff_fff0u32.to_le_bytes());
        let mut parser = SfuParser::from_slice(&bad);
        assert!(matches!(
            parser.num_chunks(),
            Err(SfuError::Format(FormatError::Truncated { .. }))
        ));

        // A truncated image
        let mut parser = SfuParser::from_slice(&image[..GLOBAL_HDR_LEN + 10]);
        assert!(matches!(
            parser.chunk_header(1),
            Err(SfuError::Format(FormatError::Truncated { .. }))
        ));
        Ok(())
    }

    #[test]
    fn test_reader_matches_slice() -> anyhow::Result<()> {
        let image = two_chunk_image()?;
        let mut ram = SfuParser::from_slice(&image);
        let mut file = SfuParser::from_reader(Cursor::new(image.clone()))?;

        assert_eq!(ram.global_header()?, file.global_header()?);
        assert_eq!(ram.num_chunks()?, file.num_chunks()?);
        for n in 1..=2 {
            assert_eq!(ram.chunk_header(n)?, file.chunk_header(n)?);
        }

        let mut short = image.clone();
        short.truncate(image.len() / 2);
        let mut file = SfuParser::from_reader(Cursor::new(short))?;
        assert!(file.chunk_header(2).is_err());

        // The header alone doesn't care about the CRC
        let mut corrupt = image;
        corrupt[GLOBAL_CRC_OFFSET] ^= 0xff;
        assert_eq!(SfuParser::from_slice(&corrupt).num_chunks()?, 2);
        Ok(())
    }

    fn option_strategy() -> impl Strategy<Value = ChunkOption> {
        let hash = any::<[u8; 16]>();
        prop_oneof![
            any::<[u32; 4]>().prop_map(|[a, b, c, d]| ChunkOption::Vers(Version::new(a, b, c, d))),
            any::<u32>().prop_map(ChunkOption::Size),
            any::<u32>().prop_map(ChunkOption::Data),
            "[a-z]{1,31}".prop_map(ChunkOption::Dest),
            hash.prop_map(ChunkOption::Md5),
            any::<[u8; 32]>().prop_map(ChunkOption::Sha2),
            any::<u32>().prop_map(ChunkOption::Cr32),
            any::<u32>().prop_map(ChunkOption::Encm),
        ]
    }

    /// The header `options` describe, later options overriding earlier ones. The builder points
    /// `data` at the chunk's payload, which for the last, empty chunk is the end of the image.
    fn expected_header(options: &[ChunkOption], data_offset: u32) -> ChunkHeader {
        let mut header = ChunkHeader::default();
        for option in options {
            match option {
                ChunkOption::Vers(version) => {
                    header.version = *version;
                    header.hdr_flag |= HdrFlags::VERS;
                }
                ChunkOption::Size(size) => {
                    header.size = *size;
                    header.hdr_flag |= HdrFlags::SIZE;
                }
                ChunkOption::Data(_) => {
                    header.data = data_offset;
                    header.hdr_flag |= HdrFlags::DATA;
                }
                ChunkOption::Dest(name) => {
                    header.dest = [0; DEST_LEN];
                    header.dest[..name.len()].copy_from_slice(name.as_bytes());
                    header.hdr_flag |= HdrFlags::DEST;
                }
                ChunkOption::Md5(hash) => {
                    header.md5 = *hash;
                    header.hdr_flag |= HdrFlags::MD5_;
                }
                ChunkOption::Sha2(hash) => {
                    header.sha256 = *hash;
                    header.hdr_flag |= HdrFlags::SHA2;
                }
                ChunkOption::Cr32(crc) => {
                    header.crc32 = *crc;
                    header.hdr_flag |= HdrFlags::CR32;
                }
                ChunkOption::Encm(method) => {
                    header.encryption_method = *method;
                    header.hdr_flag |= HdrFlags::ENCM;
                }
            }
        }
        header
    }

    fn parse_last_chunk(
        options: &[ChunkOption],
        before: usize,
    ) -> anyhow::Result<(ChunkHeader, u32)> {
        let mut builder = ImageBuilder::new(v(1));
        for i in 0..before {
            builder = builder.chunk(Chunk::new(&format!("pad{i}"), v(0), vec![i as u8]));
        }
        let image = builder.chunk(Chunk::raw(options.to_vec())).build()?;

        let mut parser = SfuParser::from_slice(&image);
        let header = parser.chunk_header(before as u32 + 1)?;
        Ok((header, u32::try_from(image.len())?))
    }

    #[test]
    fn test_chunk_without_options() -> anyhow::Result<()> {
        let (header, _) = parse_last_chunk(&[], 1)?;
        assert_eq!(header, ChunkHeader::default());
        assert!(header.hdr_flag.is_empty());
        Ok(())
    }

    #[test]
    fn test_chunk_with_every_option() -> anyhow::Result<()> {
        let options = [
            ChunkOption::Vers(Version::new(1, 0, 0, 0xabc)),
            ChunkOption::Size(16),
            ChunkOption::Data(0),
            ChunkOption::Dest("rootfs".into()),
            ChunkOption::Md5([0x11; MD5_LEN]),
            ChunkOption::Sha2([0x22; SHA256_LEN]),
            ChunkOption::Cr32(0xdead_beef),
            ChunkOption::Encm(1),
        ];
        let (header, end) = parse_last_chunk(&options, 0)?;

        assert!(header.is_minimal());
        assert!(header.hdr_flag.contains(HdrFlags::MD5_ | HdrFlags::SHA2 | HdrFlags::CR32));
        assert_eq!(header.version, Version::new(1, 0, 0, 0xabc));
        assert_eq!(header.size, 16);
        assert_eq!(header.data, end);
        assert_eq!(header.dest_bytes(), b"rootfs");
        assert_eq!(header.md5, [0x11; MD5_LEN]);
        assert_eq!(header.sha256, [0x22; SHA256_LEN]);
        assert_eq!(header.crc32, 0xdead_beef);
        assert_eq!(header.encryption_method, 1);
        Ok(())
    }

    proptest! {
        #[test]
        fn chunk_options_roundtrip(
            options in prop::collection::vec(option_strategy(), 0..10),
            before in 0usize..3,
        ) {
            let (header, end) = parse_last_chunk(&options, before).unwrap();
            prop_assert_eq!(header, expected_header(&options, end));
        }
    }
}
