//! Seekable reader for XDR record-marked files.
//!
//! Bucket files are a sequence of frames, each a 4-byte big-endian size
//! header with bit 31 set (the RFC 5531 record mark) followed by the XDR
//! payload. [`XdrInputStream`] reads one value at a time from such a file
//! and supports seeking to a byte offset obtained from a bucket index.
//!
//! Every reader owns its own stream; streams are never shared between
//! snapshot values.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;

use stellar_xdr::curr::{Limits, ReadXdr};

/// A buffered, seekable input stream over a record-marked XDR file.
pub struct XdrInputStream {
    reader: BufReader<File>,
    len: u64,
    position: u64,
}

impl XdrInputStream {
    /// Opens the file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            reader: BufReader::new(file),
            len,
            position: 0,
        })
    }

    /// Repositions the stream to an absolute byte offset.
    ///
    /// The offset must point at a record mark; the next [`read_one`]
    /// will decode the frame starting there.
    ///
    /// [`read_one`]: Self::read_one
    pub fn seek(&mut self, pos: u64) -> io::Result<()> {
        self.reader.seek(SeekFrom::Start(pos))?;
        self.position = pos;
        Ok(())
    }

    /// Current byte offset into the file.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// Total file length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Reads one size-prefixed XDR value.
    ///
    /// Returns `Ok(None)` at end of file. A frame that extends past the
    /// end of the file is treated as end of stream rather than an error,
    /// matching the forgiving read behavior of the original stream
    /// implementation.
    pub fn read_one<T: ReadXdr>(&mut self) -> io::Result<Option<T>> {
        if self.position + 4 > self.len {
            return Ok(None);
        }

        let mut mark = [0u8; 4];
        self.reader.read_exact(&mut mark)?;
        self.position += 4;

        let frame_len = (u32::from_be_bytes(mark) & 0x7FFF_FFFF) as u64;
        if self.position + frame_len > self.len {
            return Ok(None);
        }

        let mut payload = vec![0u8; frame_len as usize];
        self.reader.read_exact(&mut payload)?;
        self.position += frame_len;

        let value = T::from_xdr(&payload, Limits::none())
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(Some(value))
    }
}
