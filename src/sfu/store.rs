//! Backing stores an image can be parsed from.
//!
//! Both stores track a position and a hard end, and refuse any read or skip that would cross the
//! end, so a corrupt length field cannot walk the parser off the image.

use std::io::{Read, Seek, SeekFrom};

use bytes::Buf;

use super::{FormatError, SfuError};
use crate::util::ReadExt;

/// Random access to the bytes of an image
pub trait SfuSource {
    /// Total number of bytes available
    fn len(&self) -> u64;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Current read position, from the start of the image
    fn position(&self) -> u64;

    /// Move to an absolute position; `pos` may equal [`SfuSource::len`] but not exceed it.
    fn seek_to(&mut self, pos: u64) -> Result<(), SfuError>;

    /// Fill `buf` from the current position, advancing past it.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SfuError>;

    /// Advance past `count` bytes without reading them.
    fn skip(&mut self, count: u64) -> Result<(), SfuError> {
        let pos = self.position();
        let target = pos
            .checked_add(count)
            .filter(|&end| end <= self.len())
            .ok_or(FormatError::Truncated {
                offset: pos,
                len: count,
            })?;
        self.seek_to(target)
    }

    fn read_u32_le(&mut self) -> Result<u32, SfuError> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Feed `len` bytes starting at `offset` to `f`, in one or more pieces.
    ///
    /// The current position is unspecified afterwards.
    fn for_each_piece(
        &mut self,
        offset: u64,
        len: u64,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<(), SfuError>;
}

fn check_range(source_len: u64, offset: u64, len: u64) -> Result<(), SfuError> {
    match offset.checked_add(len) {
        Some(end) if end <= source_len => Ok(()),
        _ => Err(FormatError::Truncated { offset, len }.into()),
    }
}

/// An image staged completely in memory
#[derive(Debug, Clone)]
pub struct RamSource<'a> {
    image: &'a [u8],
    cursor: &'a [u8],
}

impl<'a> RamSource<'a> {
    pub fn new(image: &'a [u8]) -> Self {
        Self {
            image,
            cursor: image,
        }
    }

    /// The whole image this source reads from
    pub fn image(&self) -> &'a [u8] {
        self.image
    }

    /// Borrow `len` bytes at `offset` without copying.
    pub fn slice(&self, offset: u64, len: u64) -> Result<&'a [u8], SfuError> {
        check_range(self.len(), offset, len)?;
        Ok(&self.image[offset as usize..(offset + len) as usize])
    }
}

impl SfuSource for RamSource<'_> {
    fn len(&self) -> u64 {
        self.image.len() as u64
    }

    fn position(&self) -> u64 {
        (self.image.len() - self.cursor.remaining()) as u64
    }

    fn seek_to(&mut self, pos: u64) -> Result<(), SfuError> {
        check_range(self.len(), pos, 0)?;
        self.cursor = &self.image[pos as usize..];
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SfuError> {
        if self.cursor.remaining() < buf.len() {
            return Err(FormatError::Truncated {
                offset: self.position(),
                len: buf.len() as u64,
            }
            .into());
        }
        self.cursor.copy_to_slice(buf);
        Ok(())
    }

    fn skip(&mut self, count: u64) -> Result<(), SfuError> {
        if (self.cursor.remaining() as u64) < count {
            return Err(FormatError::Truncated {
                offset: self.position(),
                len: count,
            }
            .into());
        }
        self.cursor.advance(count as usize);
        Ok(())
    }

    fn for_each_piece(
        &mut self,
        offset: u64,
        len: u64,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<(), SfuError> {
        f(self.slice(offset, len)?);
        Ok(())
    }
}

/// An image in a seekable stream, such as a file or a flash partition
#[derive(Debug)]
pub struct SeekSource<R> {
    inner: R,
    len: u64,
    pos: u64,
}

impl<R: Read + Seek> SeekSource<R> {
    /// Wrap a stream; its current length bounds every later access.
    pub fn new(mut inner: R) -> Result<Self, SfuError> {
        let len = inner.seek(SeekFrom::End(0))?;
        inner.seek(SeekFrom::Start(0))?;
        Ok(Self { inner, len, pos: 0 })
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> SfuSource for SeekSource<R> {
    fn len(&self) -> u64 {
        self.len
    }

    fn position(&self) -> u64 {
        self.pos
    }

    fn seek_to(&mut self, pos: u64) -> Result<(), SfuError> {
        check_range(self.len, pos, 0)?;
        self.inner.seek(SeekFrom::Start(pos))?;
        self.pos = pos;
        Ok(())
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), SfuError> {
        check_range(self.len, self.pos, buf.len() as u64)?;
        self.inner.read_exact(buf)?;
        self.pos += buf.len() as u64;
        Ok(())
    }

    fn for_each_piece(
        &mut self,
        offset: u64,
        len: u64,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<(), SfuError> {
        const PIECE_SIZE: u64 = 65536;

        check_range(self.len, offset, len)?;
        self.seek_to(offset)?;

        let mut buf = Vec::with_capacity(PIECE_SIZE as usize);
        let mut remaining = len;
        while remaining > 0 {
            let want = remaining.min(PIECE_SIZE);
            buf.clear();
            self.inner.read_to_vec(&mut buf, want as usize)?;
            self.pos += buf.len() as u64;
            if buf.len() as u64 != want {
                // The stream shrank underneath us
                return Err(FormatError::Truncated {
                    offset: self.pos,
                    len: remaining,
                }
                .into());
            }

            f(&buf);
            remaining -= want;
        }

        Ok(())
    }
}
