//! Byte sources the decoder reads from.
//!
//! Every multi-byte read is all-or-nothing: either the whole buffer is filled or
//! [`InputError::ShortRead`] is returned carrying the bytes that were available.

use std::io::{self, Read, Seek, SeekFrom};

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("short read at {offset:#x}: wanted {wanted} bytes, got {}", .partial.len())]
    ShortRead {
        offset: u64,
        wanted: usize,
        partial: Vec<u8>,
    },
    #[error("IO: {0}")]
    Io(#[from] io::Error),
}

/// Minimal random-access reader.
pub trait Input {
    /// Move the cursor; returns the new absolute position.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, InputError>;

    fn tell(&mut self) -> Result<u64, InputError>;

    /// Fill `buf` from the cursor, advancing it.
    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InputError>;

    /// Fill `buf` from `offset` without moving the cursor.
    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), InputError>;

    fn read_byte(&mut self) -> Result<u8, InputError> {
        let mut one = [0u8; 1];
        self.read_exact(&mut one)?;
        Ok(one[0])
    }

    /// Total length, leaving the cursor where it was.
    fn size(&mut self) -> Result<u64, InputError> {
        let here = self.tell()?;
        let end = self.seek(SeekFrom::End(0))?;
        self.seek(SeekFrom::Start(here))?;
        Ok(end)
    }
}

fn seek_target(current: u64, len: u64, pos: SeekFrom) -> Result<u64, InputError> {
    let (base, delta) = match pos {
        SeekFrom::Start(n) => return Ok(n),
        SeekFrom::Current(d) => (current, d),
        SeekFrom::End(d) => (len, d),
    };
    base.checked_add_signed(delta).ok_or_else(|| {
        InputError::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "invalid seek to a negative or overflowing position",
        ))
    })
}

/// Input over an in-memory buffer.
#[derive(Debug, Clone)]
pub struct SliceInput<'a> {
    data: &'a [u8],
    pos: u64,
}

impl<'a> SliceInput<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        SliceInput { data, pos: 0 }
    }

    fn copy_from(&self, buf: &mut [u8], offset: u64) -> Result<(), InputError> {
        let len = self.data.len() as u64;
        let start = offset.min(len) as usize;
        let end = offset.saturating_add(buf.len() as u64);
        if end > len {
            return Err(InputError::ShortRead {
                offset,
                wanted: buf.len(),
                partial: self.data[start..].to_vec(),
            });
        }
        buf.copy_from_slice(&self.data[start..end as usize]);
        Ok(())
    }
}

impl Input for SliceInput<'_> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, InputError> {
        self.pos = seek_target(self.pos, self.data.len() as u64, pos)?;
        Ok(self.pos)
    }

    fn tell(&mut self) -> Result<u64, InputError> {
        Ok(self.pos)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InputError> {
        match self.copy_from(buf, self.pos) {
            Ok(()) => {
                self.pos += buf.len() as u64;
                Ok(())
            }
            Err(e) => {
                // A short read still consumes what was there.
                self.pos = self.pos.max(self.data.len() as u64);
                Err(e)
            }
        }
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), InputError> {
        self.copy_from(buf, offset)
    }

    fn size(&mut self) -> Result<u64, InputError> {
        Ok(self.data.len() as u64)
    }
}

/// Input over any seekable reader (files, cursors).
#[derive(Debug)]
pub struct ReaderInput<R> {
    inner: R,
}

impl<R: Read + Seek> ReaderInput<R> {
    pub fn new(inner: R) -> Self {
        ReaderInput { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    /// Read until `buf` is full or the reader is exhausted; returns bytes read.
    fn fill(&mut self, buf: &mut [u8]) -> Result<usize, InputError> {
        let mut done = 0;
        while done < buf.len() {
            match self.inner.read(&mut buf[done..]) {
                Ok(0) => break,
                Ok(n) => done += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(done)
    }
}

impl ReaderInput<std::fs::File> {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self, InputError> {
        Ok(ReaderInput::new(std::fs::File::open(path)?))
    }
}

impl<R: Read + Seek> Input for ReaderInput<R> {
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, InputError> {
        Ok(self.inner.seek(pos)?)
    }

    fn tell(&mut self) -> Result<u64, InputError> {
        Ok(self.inner.stream_position()?)
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), InputError> {
        let offset = self.tell()?;
        let n = self.fill(buf)?;
        if n < buf.len() {
            return Err(InputError::ShortRead { offset, wanted: buf.len(), partial: buf[..n].to_vec() });
        }
        Ok(())
    }

    fn read_exact_at(&mut self, buf: &mut [u8], offset: u64) -> Result<(), InputError> {
        let here = self.tell()?;
        self.inner.seek(SeekFrom::Start(offset))?;
        let res = self.fill(buf);
        self.inner.seek(SeekFrom::Start(here))?;
        let n = res?;
        if n < buf.len() {
            return Err(InputError::ShortRead { offset, wanted: buf.len(), partial: buf[..n].to_vec() });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_slice_input_reads_and_tells() {
        let data = [0x89, 0x50, 0x4E, 0x47];
        let mut input = SliceInput::new(&data);
        let mut buf = [0u8; 2];
        input.read_exact(&mut buf).unwrap();
        assert_eq!(buf, [0x89, 0x50]);
        assert_eq!(input.tell().unwrap(), 2);
        assert_eq!(input.read_byte().unwrap(), 0x4E);
    }

    #[test]
    fn test_slice_input_short_read_keeps_partial() {
        let data = [1, 2, 3];
        let mut input = SliceInput::new(&data);
        input.seek(SeekFrom::Start(1)).unwrap();
        let mut buf = [0u8; 4];
        match input.read_exact(&mut buf) {
            Err(InputError::ShortRead { offset, wanted, partial }) => {
                assert_eq!(offset, 1);
                assert_eq!(wanted, 4);
                assert_eq!(partial, vec![2, 3]);
            }
            other => panic!("expected short read, got {:?}", other),
        }
    }

    #[test]
    fn test_slice_input_read_at_does_not_move_cursor() {
        let data = [10, 20, 30, 40];
        let mut input = SliceInput::new(&data);
        let mut buf = [0u8; 2];
        input.read_exact_at(&mut buf, 2).unwrap();
        assert_eq!(buf, [30, 40]);
        assert_eq!(input.tell().unwrap(), 0);
        assert!(input.read_exact_at(&mut buf, 3).is_err());
    }

    #[test]
    fn test_slice_input_seek_relative_and_negative() {
        let data = [0u8; 8];
        let mut input = SliceInput::new(&data);
        assert_eq!(input.seek(SeekFrom::End(-2)).unwrap(), 6);
        assert_eq!(input.seek(SeekFrom::Current(-6)).unwrap(), 0);
        assert!(input.seek(SeekFrom::Current(-1)).is_err());
        assert_eq!(input.size().unwrap(), 8);
    }

    #[test]
    fn test_reader_input_short_read_and_restore() {
        let mut input = ReaderInput::new(Cursor::new(vec![1u8, 2, 3, 4, 5]));
        input.seek(SeekFrom::Start(1)).unwrap();
        let mut buf = [0u8; 2];
        input.read_exact_at(&mut buf, 3).unwrap();
        assert_eq!(buf, [4, 5]);
        assert_eq!(input.tell().unwrap(), 1);
        assert_eq!(input.size().unwrap(), 5);
        assert_eq!(input.tell().unwrap(), 1);
        let mut big = [0u8; 8];
        match input.read_exact(&mut big) {
            Err(InputError::ShortRead { partial, .. }) => assert_eq!(partial, vec![2, 3, 4, 5]),
            other => panic!("expected short read, got {:?}", other),
        }
    }
}
