//! Assemble SFU images.
//!
//! The device only ever consumes images, but the packager and the tests need to produce them. The
//! builder lays out the header, the global options, every chunk's option group and finally the
//! payloads, then fills in the data offsets, the total length and the global CRC32.

use bytes::{BufMut, BytesMut};
use md5::{Digest, Md5};
use sha2::Sha256;

use super::decrypt::encrypt_chunk;
use super::headers::{ChunkOption, DekuContainerWrite, GlobalHeader, Version};
use super::{
    EncryptionMethod, OptionId, GLBL_CHNK_ID, GLOBAL_CRC_CALC_OFFSET, GLOBAL_CRC_OFFSET, SFU_CRC,
};

/// One chunk to be placed in an image
#[derive(Debug, Clone)]
pub struct Chunk {
    /// Options in the order they are written; `Data` offsets are patched during layout.
    options: Vec<ChunkOption>,
    payload: Vec<u8>,
}

impl Chunk {
    /// An installable chunk: `vers`, `size`, `data`, `dest` and `encm` (unencrypted).
    pub fn new(dest: &str, version: Version, payload: impl Into<Vec<u8>>) -> Self {
        let payload = payload.into();
        Self {
            options: vec![
                ChunkOption::Vers(version),
                ChunkOption::Size(payload.len() as u32),
                ChunkOption::Data(0),
                ChunkOption::Dest(dest.to_string()),
                ChunkOption::Encm(EncryptionMethod::None as u32),
            ],
            payload,
        }
    }

    /// A chunk with exactly these options and no payload of its own.
    pub fn raw(options: Vec<ChunkOption>) -> Self {
        Self {
            options,
            payload: Vec::new(),
        }
    }

    /// Encrypt the payload with Blowfish under `key`. Digests added afterwards cover the
    /// encrypted bytes, which is what the device checks.
    pub fn encrypted(mut self, key: &[u8]) -> anyhow::Result<Self> {
        self.payload = encrypt_chunk(key, &self.payload)?;
        let size = self.payload.len() as u32;
        for option in self.options.iter_mut() {
            match option {
                ChunkOption::Size(x) => *x = size,
                ChunkOption::Encm(x) => *x = EncryptionMethod::Blowfish as u32,
                _ => (),
            }
        }
        Ok(self)
    }

    pub fn with_crc32(self) -> Self {
        let crc = SFU_CRC.checksum(&self.payload);
        self.with_option(ChunkOption::Cr32(crc))
    }

    pub fn with_md5(self) -> Self {
        let hash = Md5::digest(&self.payload).into();
        self.with_option(ChunkOption::Md5(hash))
    }

    pub fn with_sha256(self) -> Self {
        let hash = Sha256::digest(&self.payload).into();
        self.with_option(ChunkOption::Sha2(hash))
    }

    /// Add an option before the trailing `encm`, where digests conventionally go.
    pub fn with_option(mut self, option: ChunkOption) -> Self {
        let at = match self.options.last() {
            Some(ChunkOption::Encm(_)) => self.options.len() - 1,
            _ => self.options.len(),
        };
        self.options.insert(at, option);
        self
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    fn encode_group(&self, data_offset: u32, buf: &mut BytesMut) {
        buf.put_u32_le(self.options.len() as u32);
        for option in &self.options {
            match option {
                ChunkOption::Data(_) => ChunkOption::Data(data_offset).encode(buf),
                other => other.encode(buf),
            }
        }
    }

    fn group_len(&self) -> usize {
        let mut buf = BytesMut::new();
        self.encode_group(0, &mut buf);
        buf.len()
    }
}

/// Builder for a complete image
#[derive(Debug, Clone)]
pub struct ImageBuilder {
    header: GlobalHeader,
    global_options: Vec<(OptionId, Vec<u8>)>,
    chunks: Vec<Chunk>,
}

impl ImageBuilder {
    pub fn new(version: Version) -> Self {
        Self {
            header: GlobalHeader::new(version),
            global_options: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Override the image format version written to the header.
    pub fn format_version(mut self, version: u32) -> Self {
        self.header.img_fmt_version = version;
        self
    }

    /// Add a global option other than `CHNK`, which is always generated.
    pub fn global_option(mut self, id: OptionId, payload: impl Into<Vec<u8>>) -> Self {
        self.global_options.push((id, payload.into()));
        self
    }

    pub fn chunk(mut self, chunk: Chunk) -> Self {
        self.chunks.push(chunk);
        self
    }

    /// Lay out and checksum the image.
    pub fn build(&self) -> anyhow::Result<Vec<u8>> {
        let mut header = self.header.clone();
        header.global_options_count = self.global_options.len() as u32 + 1;

        let mut body = BytesMut::new();
        for (id, payload) in &self.global_options {
            body.put_slice(id);
            body.put_u32_le(payload.len() as u32);
            body.put_slice(payload);
        }
        body.put_slice(&GLBL_CHNK_ID);
        body.put_u32_le(4);
        body.put_u32_le(self.chunks.len() as u32);

        let groups_len: usize = self.chunks.iter().map(Chunk::group_len).sum();
        let mut data_offset = super::GLOBAL_HDR_LEN + body.len() + groups_len;
        for chunk in &self.chunks {
            chunk.encode_group(u32::try_from(data_offset)?, &mut body);
            data_offset += chunk.payload.len();
        }
        for chunk in &self.chunks {
            body.put_slice(&chunk.payload);
        }

        header.total_length = u32::try_from(super::GLOBAL_HDR_LEN + body.len())?;

        let mut image = header.to_bytes()?;
        image.extend_from_slice(&body);

        let crc = SFU_CRC.checksum(&image[GLOBAL_CRC_CALC_OFFSET..]);
        image[GLOBAL_CRC_OFFSET..GLOBAL_CRC_OFFSET + 4].copy_from_slice(&crc.to_le_bytes());

        Ok(image)
    }
}

#[test]
fn test_single_chunk_layout() -> anyhow::Result<()> {
    let image = ImageBuilder::new(Version::new(1, 0, 0, 0))
        .chunk(Chunk::new("rootfs", Version::new(1, 0, 0, 0), *b"ABCD"))
        .build()?;

    // header, CHNK option, one group of five options, payload
    let group_len = 4 + (8 + 16) + 3 * (8 + 4) + (8 + 32);
    assert_eq!(image.len(), 40 + 12 + group_len + 4);
    assert_eq!(&image[image.len() - 4..], b"ABCD");
    assert_eq!(&image[40..44], b"CHNK");

    let header = GlobalHeader::parse(&image)?;
    assert_eq!(header.total_length as usize, image.len());
    assert_eq!(header.global_options_count, 1);
    assert_eq!(header.compute_crc(&image), Some(header.global_crc32));
    Ok(())
}
